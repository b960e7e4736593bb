//! Dial-out triage scenarios: voicemail and IVR navigation.

mod common;

use std::sync::Arc;

use clarion::config::CallType;
use clarion::frames::KeypadEntry;
use clarion::session::transcript::EntryType;
use clarion::store::{MemoryStore, PatientStore, SessionStore};
use clarion::test_utils::{MockTransport, ScriptedLlm, ScriptedResponse};
use clarion::transport::TransportEvent;

use common::*;

/// Scenario: the first transcription is a voicemail greeting. After the
/// response delay the configured message is spoken, the call ends, and the
/// outcome lands on the session and patient records.
#[tokio::test]
async fn voicemail_message_is_left_and_call_ends() {
    let store = MemoryStore::shared();
    seed_david(&store).await;
    let transport = Arc::new(MockTransport::new());

    let classifier = ScriptedLlm::new("classifier", vec![ScriptedResponse::text("VOICEMAIL")]);
    let session = build_session(
        dialout_config(),
        "patient_scheduling",
        CallType::DialOut,
        Some("p-david"),
        serde_json::json!({
            "organization_name": "Demo Clinic Alpha",
            "patient_name": "David Chen",
        }),
        "+15551234567",
        idle_llm(),
        Some(classifier),
        None,
        vec!["Please leave a message after the tone"],
        store.clone(),
        transport.clone(),
    );
    let transcripts = session.transcripts();
    let mut session = session;
    let handle = tokio::spawn(async move { session.run().await });

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    transport.emit(TransportEvent::Joined);
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(transport.dialout_attempts().await, vec!["+15551234567"]);
    transport.emit(TransportEvent::DialoutAnswered {
        participant_id: Some("pstn-1".into()),
    });
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    transport.push_audio(audio_chunk()).await;

    let result = tokio::time::timeout(std::time::Duration::from_secs(5), handle)
        .await
        .expect("session ends")
        .expect("join");
    result.expect("voicemail call completes cleanly");

    let session_doc = store.get_session("s-1", "org-1").await.unwrap().unwrap();
    assert_eq!(session_doc["status"], "completed");
    assert_eq!(session_doc["call_status"], "Voicemail");
    assert!(session_doc["call_transcript"]["message_count"].as_u64().unwrap() >= 1);

    let patient = store.find_by_id("p-david", "org-1").await.unwrap().unwrap();
    assert_eq!(
        patient.call_status,
        Some(clarion::store::CallStatus::Voicemail)
    );

    let entries = transcripts.lock().unwrap().clone();
    assert!(entries.iter().any(|e| e.entry_type == EntryType::Triage
        && e.content.contains("Voicemail detected")));
    // The voicemail message itself was spoken and captured.
    assert!(entries.iter().any(|e| e.role == "assistant"
        && e.content.contains("Monica")));
    assert!(transport.recordings_deleted());
}

/// Scenario: a fixed menu answers. The navigator presses 1, then declares
/// completion when the agent queue announcement arrives; no main-branch
/// frame leaks before completion.
#[tokio::test]
async fn ivr_menu_is_navigated_with_dtmf() {
    let store = MemoryStore::shared();
    let transport = Arc::new(MockTransport::new());

    let classifier = RouterLlm::new(|request| {
        let system = system_text(request);
        let user = last_user_text(request);
        if system.contains("Output EXACTLY one word: CONVERSATION or IVR") {
            // Parallel human detector: nothing human on the line.
            ScriptedResponse::text("IVR")
        } else if system.contains("Interactive Voice Response") {
            // Navigation turns.
            if user.contains("Press 1") {
                ScriptedResponse::text("<dtmf>1</dtmf>")
            } else if user.contains("agent will be with you") {
                ScriptedResponse::text("<ivr>completed</ivr>")
            } else {
                ScriptedResponse::text("<ivr>wait</ivr>")
            }
        } else {
            // 3-way triage.
            ScriptedResponse::text("IVR")
        }
    });

    let session = build_session(
        dialout_config(),
        "eligibility_verification",
        CallType::DialOut,
        Some("p-1"),
        serde_json::json!({
            "facility_name": "Lakeside Dental",
            "patient_name": "David Chen",
            "insurance_member_id": "MEM123",
        }),
        "+18005550100",
        idle_llm(),
        Some(classifier),
        None,
        vec![
            "Press 1 for eligibility, press 2 for claims",
            "An agent will be with you shortly",
        ],
        store.clone(),
        transport.clone(),
    );
    let transcripts = session.transcripts();
    let mut session = session;
    let handle = tokio::spawn(async move { session.run().await });

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    transport.emit(TransportEvent::Joined);
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    transport.emit(TransportEvent::DialoutAnswered {
        participant_id: Some("pstn-1".into()),
    });
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    // Menu audio.
    transport.push_audio(audio_chunk()).await;
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    // Queue announcement.
    transport.push_audio(audio_chunk()).await;
    tokio::time::sleep(std::time::Duration::from_millis(400)).await;

    // The remote side hangs up once the rep conversation is ready.
    transport.emit(TransportEvent::DialoutStopped);
    let result = tokio::time::timeout(std::time::Duration::from_secs(5), handle)
        .await
        .expect("session ends")
        .expect("join");
    result.expect("IVR call completes cleanly");

    assert_eq!(transport.dtmf_sent().await, vec![KeypadEntry::Digit(1)]);

    let entries = transcripts.lock().unwrap().clone();
    assert!(entries.iter().any(|e| e.entry_type == EntryType::IvrAction
        && e.content == "Pressed 1"));
    assert!(entries.iter().any(|e| e.entry_type == EntryType::IvrSummary
        && e.content.contains("IVR navigation completed")));
    // Invariant: pre-completion menu speech never crossed the main branch.
    assert!(!entries.iter().any(|e| e.role == "user"));
}

/// Scenario: a human answers. Triage latches CONVERSATION, the greeting
/// node initializes with the utterance injected, and the main branch opens.
#[tokio::test]
async fn conversation_detection_initializes_greeting() {
    let store = MemoryStore::shared();
    seed_david(&store).await;
    let transport = Arc::new(MockTransport::new());

    let classifier = ScriptedLlm::new("classifier", vec![ScriptedResponse::text("CONVERSATION")]);
    // The greeting responds only after the next utterance; end the call via
    // a scripted end_call as soon as the model is consulted.
    let main_llm = ScriptedLlm::new(
        "main",
        vec![ScriptedResponse::tool("end_call", serde_json::json!({}))],
    );

    let session = build_session(
        dialout_config(),
        "patient_scheduling",
        CallType::DialOut,
        Some("p-david"),
        serde_json::json!({
            "organization_name": "Demo Clinic Alpha",
            "patient_name": "David Chen",
        }),
        "+15551234567",
        main_llm.clone(),
        Some(classifier),
        None,
        vec!["Hello, this is David.", "Actually I have to go, bye."],
        store.clone(),
        transport.clone(),
    );
    let transcripts = session.transcripts();
    let mut session = session;
    let handle = tokio::spawn(async move { session.run().await });

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    transport.emit(TransportEvent::Joined);
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    transport.emit(TransportEvent::DialoutAnswered {
        participant_id: Some("pstn-1".into()),
    });
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    // Answer utterance classifies; greeting speaks; the goodbye triggers
    // the scripted end_call.
    transport.push_audio(audio_chunk()).await;
    tokio::time::sleep(std::time::Duration::from_millis(400)).await;
    transport.push_audio(audio_chunk()).await;

    let result = tokio::time::timeout(std::time::Duration::from_secs(5), handle)
        .await
        .expect("session ends")
        .expect("join");
    result.expect("conversation call completes");

    // The greeting turn saw the injected utterance.
    let saw_injection = main_llm.requests().iter().any(|r| {
        r.messages
            .iter()
            .any(|m| m.content.contains("Hello, this is David."))
    });
    assert!(saw_injection, "answer utterance was injected into context");

    let entries = transcripts.lock().unwrap().clone();
    assert!(entries.iter().any(|e| e.entry_type == EntryType::Triage
        && e.content.contains("Human answered")));
    // The dial-out greeting was spoken after the gate opened.
    assert!(entries.iter().any(|e| e.role == "assistant"
        && e.content.contains("Monica")));

    let session_doc = store.get_session("s-1", "org-1").await.unwrap().unwrap();
    assert_eq!(session_doc["status"], "completed");
}

//! Safety interception scenarios: mid-call emergency with auto-transfer.

mod common;

use std::sync::Arc;
use std::time::Duration;

use clarion::config::CallType;
use clarion::session::transcript::EntryType;
use clarion::store::{MemoryStore, SessionStore};
use clarion::test_utils::{MockTransport, ScriptedLlm, ScriptedResponse};
use clarion::transport::TransportEvent;

use common::*;

/// Scenario: the caller reports chest pain. The safety monitor classifies
/// EMERGENCY, the configured message is spoken within the turn, and with
/// auto-transfer enabled a SIP transfer to staff follows the message.
#[tokio::test(start_paused = true)]
async fn emergency_speaks_message_and_transfers() {
    let store = MemoryStore::shared();
    let transport = Arc::new(MockTransport::new());

    // The guard model flags the utterance; the main model never gets a
    // meaningful word in.
    let safety_llm = RouterLlm::new(|request| {
        let user = last_user_text(request);
        if user.contains("chest pain") {
            ScriptedResponse::text("EMERGENCY")
        } else {
            ScriptedResponse::text("OK")
        }
    });
    let main_llm = ScriptedLlm::new(
        "main",
        vec![ScriptedResponse::text("I'm sorry to hear that.")],
    );

    let session = build_session(
        dialin_config(true),
        "patient_scheduling",
        CallType::DialIn,
        None,
        serde_json::json!({ "organization_name": "Demo Clinic Alpha" }),
        "5165667132",
        main_llm,
        None,
        Some(safety_llm),
        vec!["I'm having chest pain."],
        store.clone(),
        transport.clone(),
    );
    let transcripts = session.transcripts();
    let mut session = session;
    let handle = tokio::spawn(async move { session.run().await });

    tokio::time::sleep(Duration::from_millis(200)).await;
    transport.emit(TransportEvent::FirstParticipantJoined {
        participant_id: "caller-1".into(),
    });
    tokio::time::sleep(Duration::from_millis(300)).await;

    transport.push_audio(audio_chunk()).await;
    // Message estimate plus slack; paused time advances instantly.
    tokio::time::sleep(Duration::from_secs(30)).await;

    {
        let entries = transcripts.lock().unwrap().clone();
        assert!(
            entries.iter().any(|e| e.role == "assistant"
                && e.content.contains("dial nine one one")),
            "emergency message was spoken"
        );
        assert!(entries.iter().any(|e| e.entry_type == EntryType::SystemEvent
            && e.content.contains("Emergency")));
    }
    assert_eq!(
        transport.transfer_attempts().await,
        vec!["sip:+15550009999".to_owned()]
    );

    transport.emit(TransportEvent::ClientDisconnected);
    let result = tokio::time::timeout(Duration::from_secs(60), handle)
        .await
        .expect("session ends")
        .expect("join");
    result.expect("emergency call completes cleanly");
}

/// A staff request transfers after the hold message, marking the session
/// transferred.
#[tokio::test(start_paused = true)]
async fn staff_request_transfers_with_hold_message() {
    let store = MemoryStore::shared();
    let transport = Arc::new(MockTransport::new());

    let safety_llm = RouterLlm::new(|request| {
        let user = last_user_text(request);
        if user.contains("real person") {
            ScriptedResponse::text("STAFF_REQUEST")
        } else {
            ScriptedResponse::text("OK")
        }
    });

    let session = build_session(
        dialin_config(true),
        "patient_scheduling",
        CallType::DialIn,
        None,
        serde_json::json!({ "organization_name": "Demo Clinic Alpha" }),
        "5165667132",
        idle_llm(),
        None,
        Some(safety_llm),
        vec!["Let me talk to a real person."],
        store.clone(),
        transport.clone(),
    );
    let transcripts = session.transcripts();
    let mut session = session;
    let handle = tokio::spawn(async move { session.run().await });

    tokio::time::sleep(Duration::from_millis(200)).await;
    transport.emit(TransportEvent::FirstParticipantJoined {
        participant_id: "caller-1".into(),
    });
    tokio::time::sleep(Duration::from_millis(300)).await;

    transport.push_audio(audio_chunk()).await;
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(
        transport.transfer_attempts().await,
        vec!["sip:+15550009999".to_owned()]
    );
    {
        let entries = transcripts.lock().unwrap().clone();
        assert!(entries.iter().any(|e| e.role == "assistant"
            && e.content.contains("Transferring you now")));
    }
    let session_doc = store.get_session("s-1", "org-1").await.unwrap().unwrap();
    assert_eq!(session_doc["call_status"], "Transferred");

    transport.emit(TransportEvent::ClientDisconnected);
    let result = tokio::time::timeout(Duration::from_secs(60), handle)
        .await
        .expect("session ends")
        .expect("join");
    result.expect("staff-request call completes cleanly");
}

//! Dial-out retry exhaustion (transport errors on every attempt).

mod common;

use std::sync::Arc;
use std::time::Duration;

use clarion::config::CallType;
use clarion::store::{MemoryStore, PatientStore, SessionStore};
use clarion::test_utils::MockTransport;
use clarion::transport::TransportEvent;

use common::*;

async fn wait_attempts(transport: &MockTransport, n: usize) {
    for _ in 0..400 {
        if transport.dialout_attempts().await.len() >= n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {n} dial attempts");
}

/// Three consecutive dial-out errors exhaust the retries: exactly three
/// attempts are placed, the session fails, and cleanup still runs.
#[tokio::test(start_paused = true)]
async fn retry_exhaustion_fails_the_session() {
    let store = MemoryStore::shared();
    seed_david(&store).await;
    let transport = Arc::new(MockTransport::new());

    let mut session = build_session(
        dialout_config(),
        "patient_scheduling",
        CallType::DialOut,
        Some("p-david"),
        serde_json::json!({ "organization_name": "Demo Clinic Alpha" }),
        "+15551234567",
        idle_llm(),
        Some(idle_llm()),
        None,
        Vec::new(),
        store.clone(),
        transport.clone(),
    );
    let handle = tokio::spawn(async move { session.run().await });

    tokio::time::sleep(Duration::from_millis(200)).await;
    transport.emit(TransportEvent::Joined);
    wait_attempts(&transport, 1).await;

    transport.emit(TransportEvent::DialoutError {
        message: "no answer".into(),
    });
    wait_attempts(&transport, 2).await;

    transport.emit(TransportEvent::DialoutError {
        message: "no answer".into(),
    });
    wait_attempts(&transport, 3).await;

    transport.emit(TransportEvent::DialoutError {
        message: "no answer".into(),
    });

    let result = tokio::time::timeout(Duration::from_secs(120), handle)
        .await
        .expect("session ends")
        .expect("join");
    assert!(result.is_err(), "exhausted retries surface an error");

    // Exactly three attempts, never a fourth.
    assert_eq!(transport.dialout_attempts().await.len(), 3);

    let session_doc = store.get_session("s-1", "org-1").await.unwrap().unwrap();
    assert_eq!(session_doc["status"], "failed");
    assert!(session_doc["error"].as_str().unwrap().contains("3 attempts"));

    let patient = store.find_by_id("p-david", "org-1").await.unwrap().unwrap();
    assert_eq!(patient.call_status, Some(clarion::store::CallStatus::Failed));

    // Cleanup ran on the failure path.
    assert!(transport.recordings_deleted());
}

/// A successful answer stops the retry ladder: later transport errors (for
/// example a failing transfer leg) never re-enter dialing.
#[tokio::test(start_paused = true)]
async fn answered_call_never_redials() {
    let store = MemoryStore::shared();
    seed_david(&store).await;
    let transport = Arc::new(MockTransport::new());

    let mut session = build_session(
        dialout_config(),
        "patient_scheduling",
        CallType::DialOut,
        Some("p-david"),
        serde_json::json!({ "organization_name": "Demo Clinic Alpha" }),
        "+15551234567",
        idle_llm(),
        Some(idle_llm()),
        None,
        Vec::new(),
        store.clone(),
        transport.clone(),
    );
    let handle = tokio::spawn(async move { session.run().await });

    tokio::time::sleep(Duration::from_millis(200)).await;
    transport.emit(TransportEvent::Joined);
    wait_attempts(&transport, 1).await;

    transport.emit(TransportEvent::DialoutAnswered {
        participant_id: Some("pstn-1".into()),
    });
    tokio::time::sleep(Duration::from_millis(200)).await;

    // An error after connection must not trigger a redial.
    transport.emit(TransportEvent::DialoutError {
        message: "late error".into(),
    });
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(transport.dialout_attempts().await.len(), 1);

    transport.emit(TransportEvent::DialoutStopped);
    let result = tokio::time::timeout(Duration::from_secs(60), handle)
        .await
        .expect("session ends")
        .expect("join");
    result.expect("answered call completes");
}

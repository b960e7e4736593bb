//! Session and patient persistence seams.
//!
//! The document database is an external collaborator; the call core only
//! knows these traits. The in-memory implementation backs local mode and
//! tests. Store clients are shared across sessions; each operation is
//! atomic against the backing map.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::Result;
use crate::session::transcript::TranscriptData;

/// Session lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Created, pipeline not yet running.
    Starting,
    /// Call in progress.
    Running,
    /// Ended normally.
    Completed,
    /// Ended with an error.
    Failed,
    /// Killed externally.
    Terminated,
}

impl SessionStatus {
    /// Wire form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Terminated => "terminated",
        }
    }
}

/// Patient-facing call outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallStatus {
    /// Call connected and running.
    #[serde(rename = "In Progress")]
    InProgress,
    /// Finished normally.
    #[serde(rename = "Completed")]
    Completed,
    /// Could not complete.
    #[serde(rename = "Failed")]
    Failed,
    /// Voicemail answered; message left.
    #[serde(rename = "Voicemail")]
    Voicemail,
    /// Cold-transferred to staff.
    #[serde(rename = "Transferred")]
    Transferred,
    /// Escalated to a supervisor mid-call.
    #[serde(rename = "Supervisor Dialed")]
    SupervisorDialed,
}

impl CallStatus {
    /// Statuses that must not be overwritten by a later, weaker outcome.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::SupervisorDialed | Self::Failed)
    }

    /// Wire form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "In Progress",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Voicemail => "Voicemail",
            Self::Transferred => "Transferred",
            Self::SupervisorDialed => "Supervisor Dialed",
        }
    }
}

/// A patient document, as the call core sees it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatientRecord {
    /// Store id.
    pub patient_id: String,
    /// Owning organization.
    pub organization_id: String,
    /// Given name.
    #[serde(default)]
    pub first_name: String,
    /// Family name.
    #[serde(default)]
    pub last_name: String,
    /// Digits-only phone number.
    #[serde(default)]
    pub phone_number: String,
    /// ISO date of birth.
    #[serde(default)]
    pub date_of_birth: String,
    /// Email address.
    #[serde(default)]
    pub email: String,
    /// Latest call outcome.
    #[serde(default)]
    pub call_status: Option<CallStatus>,
    /// Workflow-specific fields (appointment slot, insurance ids, ...).
    #[serde(default, flatten)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl PatientRecord {
    /// `"First Last"`, trimmed.
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_owned()
    }
}

/// Session persistence operations used by the call core.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Shallow-merge fields into the session document.
    async fn update_session(
        &self,
        session_id: &str,
        updates: serde_json::Value,
        organization_id: &str,
    ) -> Result<bool>;

    /// Attach the assembled transcript to the session document.
    async fn save_transcript(
        &self,
        session_id: &str,
        transcript: &TranscriptData,
        organization_id: &str,
    ) -> Result<bool>;

    /// Fetch a session document.
    async fn get_session(
        &self,
        session_id: &str,
        organization_id: &str,
    ) -> Result<Option<serde_json::Value>>;
}

/// Patient lookup and mutation operations used by the flows.
#[async_trait]
pub trait PatientStore: Send + Sync {
    /// Find a patient by digits-only phone, scoped to an organization and
    /// workflow.
    async fn find_by_phone(
        &self,
        phone_digits: &str,
        organization_id: &str,
        workflow: &str,
    ) -> Result<Option<PatientRecord>>;

    /// Find a patient by id.
    async fn find_by_id(
        &self,
        patient_id: &str,
        organization_id: &str,
    ) -> Result<Option<PatientRecord>>;

    /// Create a patient; returns the new id.
    async fn create_patient(&self, record: PatientRecord) -> Result<String>;

    /// Shallow-merge fields into the patient document.
    async fn update_patient(
        &self,
        patient_id: &str,
        updates: serde_json::Value,
        organization_id: &str,
    ) -> Result<()>;

    /// Set the patient's call status.
    async fn update_call_status(
        &self,
        patient_id: &str,
        status: CallStatus,
        organization_id: &str,
    ) -> Result<()>;
}

fn merge_object(target: &mut serde_json::Value, updates: serde_json::Value) {
    if let (serde_json::Value::Object(target), serde_json::Value::Object(updates)) =
        (target, updates)
    {
        for (key, value) in updates {
            target.insert(key, value);
        }
    }
}

/// In-memory store for local mode and tests.
#[derive(Default)]
pub struct MemoryStore {
    sessions: RwLock<HashMap<(String, String), serde_json::Value>>,
    patients: RwLock<HashMap<(String, String), PatientRecord>>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared empty store.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Seed a patient.
    pub async fn insert_patient(&self, record: PatientRecord) {
        let key = (record.organization_id.clone(), record.patient_id.clone());
        self.patients.write().await.insert(key, record);
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn update_session(
        &self,
        session_id: &str,
        updates: serde_json::Value,
        organization_id: &str,
    ) -> Result<bool> {
        let mut sessions = self.sessions.write().await;
        let entry = sessions
            .entry((organization_id.to_owned(), session_id.to_owned()))
            .or_insert_with(|| serde_json::json!({ "session_id": session_id }));
        merge_object(entry, updates);
        Ok(true)
    }

    async fn save_transcript(
        &self,
        session_id: &str,
        transcript: &TranscriptData,
        organization_id: &str,
    ) -> Result<bool> {
        let value = serde_json::to_value(transcript)
            .map_err(|e| crate::error::CallError::Store(format!("transcript encode: {e}")))?;
        self.update_session(
            session_id,
            serde_json::json!({ "call_transcript": value }),
            organization_id,
        )
        .await
    }

    async fn get_session(
        &self,
        session_id: &str,
        organization_id: &str,
    ) -> Result<Option<serde_json::Value>> {
        Ok(self
            .sessions
            .read()
            .await
            .get(&(organization_id.to_owned(), session_id.to_owned()))
            .cloned())
    }
}

#[async_trait]
impl PatientStore for MemoryStore {
    async fn find_by_phone(
        &self,
        phone_digits: &str,
        organization_id: &str,
        _workflow: &str,
    ) -> Result<Option<PatientRecord>> {
        Ok(self
            .patients
            .read()
            .await
            .values()
            .find(|p| p.organization_id == organization_id && p.phone_number == phone_digits)
            .cloned())
    }

    async fn find_by_id(
        &self,
        patient_id: &str,
        organization_id: &str,
    ) -> Result<Option<PatientRecord>> {
        Ok(self
            .patients
            .read()
            .await
            .get(&(organization_id.to_owned(), patient_id.to_owned()))
            .cloned())
    }

    async fn create_patient(&self, mut record: PatientRecord) -> Result<String> {
        if record.patient_id.is_empty() {
            record.patient_id = uuid::Uuid::new_v4().to_string();
        }
        let id = record.patient_id.clone();
        self.insert_patient(record).await;
        Ok(id)
    }

    async fn update_patient(
        &self,
        patient_id: &str,
        updates: serde_json::Value,
        organization_id: &str,
    ) -> Result<()> {
        let mut patients = self.patients.write().await;
        let key = (organization_id.to_owned(), patient_id.to_owned());
        let Some(record) = patients.get_mut(&key) else {
            return Err(crate::error::CallError::Store(format!(
                "unknown patient {patient_id}"
            )));
        };
        let serde_json::Value::Object(updates) = updates else {
            return Ok(());
        };
        for (field, value) in updates {
            match field.as_str() {
                "first_name" => record.first_name = value.as_str().unwrap_or_default().to_owned(),
                "last_name" => record.last_name = value.as_str().unwrap_or_default().to_owned(),
                "phone_number" => {
                    record.phone_number = value.as_str().unwrap_or_default().to_owned();
                }
                "date_of_birth" => {
                    record.date_of_birth = value.as_str().unwrap_or_default().to_owned();
                }
                "email" => record.email = value.as_str().unwrap_or_default().to_owned(),
                "call_status" => {
                    record.call_status = serde_json::from_value(value).ok();
                }
                _ => {
                    record.fields.insert(field, value);
                }
            }
        }
        Ok(())
    }

    async fn update_call_status(
        &self,
        patient_id: &str,
        status: CallStatus,
        organization_id: &str,
    ) -> Result<()> {
        self.update_patient(
            patient_id,
            serde_json::json!({ "call_status": status.as_str() }),
            organization_id,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn patient() -> PatientRecord {
        PatientRecord {
            patient_id: "p-1".into(),
            organization_id: "org-1".into(),
            first_name: "David".into(),
            last_name: "Chen".into(),
            phone_number: "5551234567".into(),
            date_of_birth: "1958-11-02".into(),
            ..PatientRecord::default()
        }
    }

    #[tokio::test]
    async fn session_updates_merge() {
        let store = MemoryStore::new();
        store
            .update_session("s-1", serde_json::json!({"status": "running"}), "org-1")
            .await
            .unwrap();
        store
            .update_session("s-1", serde_json::json!({"workflow": "patient_scheduling"}), "org-1")
            .await
            .unwrap();
        let session = store.get_session("s-1", "org-1").await.unwrap().unwrap();
        assert_eq!(session["status"], "running");
        assert_eq!(session["workflow"], "patient_scheduling");
    }

    #[tokio::test]
    async fn phone_lookup_is_org_scoped() {
        let store = MemoryStore::new();
        store.insert_patient(patient()).await;
        assert!(
            store
                .find_by_phone("5551234567", "org-1", "patient_scheduling")
                .await
                .unwrap()
                .is_some()
        );
        assert!(
            store
                .find_by_phone("5551234567", "other-org", "patient_scheduling")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn patient_updates_route_to_typed_and_extra_fields() {
        let store = MemoryStore::new();
        store.insert_patient(patient()).await;
        store
            .update_patient(
                "p-1",
                serde_json::json!({
                    "email": "david@example.com",
                    "appointment_date": "2026-02-03",
                }),
                "org-1",
            )
            .await
            .unwrap();
        let record = store.find_by_id("p-1", "org-1").await.unwrap().unwrap();
        assert_eq!(record.email, "david@example.com");
        assert_eq!(record.fields["appointment_date"], "2026-02-03");
    }

    #[tokio::test]
    async fn call_status_round_trips() {
        let store = MemoryStore::new();
        store.insert_patient(patient()).await;
        store
            .update_call_status("p-1", CallStatus::Voicemail, "org-1")
            .await
            .unwrap();
        let record = store.find_by_id("p-1", "org-1").await.unwrap().unwrap();
        assert_eq!(record.call_status, Some(CallStatus::Voicemail));
        assert!(!CallStatus::Voicemail.is_terminal());
        assert!(CallStatus::Completed.is_terminal());
    }

    #[tokio::test]
    async fn create_patient_allocates_an_id() {
        let store = MemoryStore::new();
        let id = store
            .create_patient(PatientRecord {
                organization_id: "org-1".into(),
                first_name: "New".into(),
                ..PatientRecord::default()
            })
            .await
            .unwrap();
        assert!(!id.is_empty());
        assert!(store.find_by_id(&id, "org-1").await.unwrap().is_some());
    }
}

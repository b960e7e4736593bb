//! Lab results workflow.
//!
//! Dial-in and handoff target: verify identity, read the stored result
//! summary, route interpretation questions to medical staff. Never shares
//! results before verification.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::flow::base::{CallFlow, FlowCore};
use crate::flow::types::{
    ActionConfig, FlowState, FunctionSchema, HandlerOutcome, NodeConfig, handler_fn,
};
use crate::store::PatientRecord;

/// The lab-results workflow.
#[derive(Clone)]
pub struct LabResultsFlow {
    core: FlowCore,
}

impl LabResultsFlow {
    /// Build the workflow for one call.
    pub fn new(core: FlowCore) -> Arc<Self> {
        Arc::new(Self { core })
    }

    fn results_node(self: &Arc<Self>, state: &FlowState) -> NodeConfig {
        let results = state.str("lab_results");
        let results_date = state.str("lab_results_date");
        let task = if results.is_empty() {
            "No lab results are on file for this patient yet. Let them know the results \
             haven't come in, and that the clinic will reach out when they do. If they have \
             questions, offer to transfer to medical staff (request_staff with reason \
             'medical_advice'). When they're done, call end_call."
                .to_owned()
        } else {
            format!(
                "The verified patient's lab results from {results_date}:\n{results}\n\n\
                 Share the summary in one or two plain sentences. You may repeat values \
                 they ask about, but do NOT interpret results or give medical advice - for \
                 interpretation, call request_staff with reason 'medical_advice'.\n\
                 If they want to schedule a follow-up, call route_to_workflow with \
                 workflow=\"patient_scheduling\".\n\
                 When they're done, call end_call."
            )
        };
        let flow: Arc<dyn CallFlow> = Arc::clone(self) as Arc<dyn CallFlow>;
        NodeConfig::named("lab_results")
            .task_message(task)
            .function(self.core.route_to_workflow_schema(Arc::clone(&flow)))
            .function(self.core.request_staff_schema(flow))
            .function(self.core.end_call_schema())
    }

    fn greeting(self: &Arc<Self>) -> NodeConfig {
        let start_flow = Arc::clone(self);
        let start = handler_fn(move |_args, mgr| {
            let flow = Arc::clone(&start_flow);
            Box::pin(async move {
                info!("lab results requested, starting verification");
                if mgr.state().flag("identity_verified") {
                    let node = Arc::clone(&flow).route_after_verification(mgr.state());
                    return Ok(HandlerOutcome::next(node));
                }
                let callflow: Arc<dyn CallFlow> = Arc::clone(&flow) as Arc<dyn CallFlow>;
                Ok(HandlerOutcome::next(flow.core.patient_lookup_node(callflow)))
            })
        });
        let flow: Arc<dyn CallFlow> = Arc::clone(self) as Arc<dyn CallFlow>;
        NodeConfig::named("greeting")
            .role_message(self.global_instructions_text())
            .task_message(
                "The caller reached the lab-results line. If they're asking about their \
                 results, call start_results_lookup. For anything else, say \"Let me \
                 connect you with someone who can help with that.\" and call request_staff.",
            )
            .function(FunctionSchema::new(
                "start_results_lookup",
                "Caller wants their lab results.",
                serde_json::json!({}),
                &[],
                start,
            ))
            .function(self.core.request_staff_schema(flow))
            .function(self.core.end_call_schema())
            .pre_action(ActionConfig::TtsSay(format!(
                "Hello! This is Monica from {}. Are you calling about your lab results?",
                self.core.organization_name()
            )))
            .wait_for_user()
    }

    fn global_instructions_text(&self) -> String {
        format!(
            "You are Monica, the lab-results assistant at {org}.\n\n\
             # Voice Conversation Style\n\
             You are on a phone call; your responses are converted to speech:\n\
             - Speak naturally and calmly, one or two short sentences at a time\n\
             - Never use bullet points, numbered lists, or markdown\n\n\
             # Boundaries\n\
             - NEVER share results before identity verification succeeds\n\
             - Never interpret results or give medical advice; transfer instead",
            org = self.core.organization_name()
        )
    }
}

#[async_trait]
impl CallFlow for LabResultsFlow {
    fn workflow(&self) -> &'static str {
        "lab_results"
    }

    fn global_instructions(&self, _state: &FlowState) -> String {
        self.global_instructions_text()
    }

    fn init_state(&self, state: &mut FlowState) {
        self.core.init_common_state(state);
    }

    fn initial_node(self: Arc<Self>) -> NodeConfig {
        self.greeting()
    }

    fn greeting_node(self: Arc<Self>) -> NodeConfig {
        self.greeting()
    }

    fn handoff_targets(&self) -> &'static [&'static str] {
        &["patient_scheduling"]
    }

    async fn handoff_entry_node(self: Arc<Self>, context: &str, state: &FlowState) -> NodeConfig {
        let node = if state.flag("identity_verified") {
            self.results_node(state)
        } else {
            let flow: Arc<dyn CallFlow> = Arc::clone(&self) as Arc<dyn CallFlow>;
            self.core.patient_lookup_node(flow)
        };
        if context.is_empty() {
            node
        } else {
            node.task_message(format!("Handoff context: {context}"))
        }
    }

    fn route_after_verification(self: Arc<Self>, state: &FlowState) -> NodeConfig {
        self.results_node(state)
    }

    fn extract_lookup_record(&self, patient: &PatientRecord) -> serde_json::Value {
        let mut record = serde_json::json!({
            "patient_id": patient.patient_id,
            "first_name": patient.first_name,
            "last_name": patient.last_name,
            "phone_number": patient.phone_number,
            "date_of_birth": patient.date_of_birth,
            "email": patient.email,
        });
        for field in ["lab_results", "lab_results_date"] {
            if let Some(value) = patient.fields.get(field) {
                record[field] = value.clone();
            }
        }
        record
    }

    fn populate_domain_state(&self, state: &mut FlowState, lookup: &serde_json::Value) {
        for field in ["lab_results", "lab_results_date"] {
            state.set(field, lookup[field].as_str().unwrap_or_default());
        }
    }

    fn verification_greeting(&self, first_name: &str) -> Option<String> {
        Some(if first_name.is_empty() {
            "Thanks, you're verified.".to_owned()
        } else {
            format!("Thanks {first_name}, you're verified.")
        })
    }

    fn stay_node(self: Arc<Self>, state: &FlowState) -> Option<NodeConfig> {
        if state.flag("identity_verified") {
            Some(self.results_node(state))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::config::ColdTransferConfig;
    use crate::store::MemoryStore;
    use crate::test_utils::MockTransport;

    fn flow() -> Arc<LabResultsFlow> {
        let store = MemoryStore::shared();
        LabResultsFlow::new(FlowCore::new(
            serde_json::json!({ "organization_name": "Demo Clinic Alpha" }),
            "s-1",
            "org-1",
            ColdTransferConfig::default(),
            store.clone(),
            store,
            std::sync::Arc::new(MockTransport::new()),
        ))
    }

    #[test]
    fn lookup_record_carries_lab_fields() {
        let flow = flow();
        let mut patient = PatientRecord {
            patient_id: "p-1".into(),
            organization_id: "org-1".into(),
            first_name: "Maria".into(),
            date_of_birth: "1975-06-20".into(),
            ..PatientRecord::default()
        };
        patient.fields.insert(
            "lab_results".into(),
            "A1C 5.6, within normal range".into(),
        );
        patient
            .fields
            .insert("lab_results_date".into(), "2026-07-21".into());

        let lookup = flow.extract_lookup_record(&patient);
        assert_eq!(lookup["lab_results"], "A1C 5.6, within normal range");

        let mut state = FlowState::new();
        flow.populate_domain_state(&mut state, &lookup);
        assert_eq!(state.str("lab_results_date"), "2026-07-21");
    }

    #[tokio::test]
    async fn unverified_handoff_enters_verification() {
        let flow = flow();
        let state = FlowState::new();
        let node = Arc::clone(&flow)
            .handoff_entry_node("patient asked about results", &state)
            .await;
        assert_eq!(node.name, "patient_lookup");
    }

    #[tokio::test]
    async fn verified_handoff_goes_straight_to_results() {
        let flow = flow();
        let mut state = FlowState::new();
        state.set("identity_verified", true);
        state.set("lab_results", "CBC normal");
        let node = Arc::clone(&flow).handoff_entry_node("", &state).await;
        assert_eq!(node.name, "lab_results");
    }

    #[test]
    fn empty_results_node_explains_not_ready() {
        let flow = flow();
        let state = FlowState::new();
        let node = flow.results_node(&state);
        let task = &node.task_messages[0].content;
        assert!(task.contains("haven't come in"));
    }
}

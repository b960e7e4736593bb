//! Insurance eligibility verification workflow (dial-out).
//!
//! The system calls a payer's provider line on behalf of a facility,
//! navigates the phone tree, and walks an insurance rep through a benefits
//! checklist, recording each answer as it lands. Triage and IVR navigation
//! carry the call until a live rep picks up.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::error::Result;
use crate::flow::base::{CallFlow, FlowCore, TriageFlowConfig};
use crate::flow::manager::FlowManager;
use crate::flow::types::{
    ActionConfig, FlowState, FunctionSchema, HandlerOutcome, NodeConfig, handler_fn,
};

const TRIAGE_CLASSIFIER_PROMPT: &str = "\
You are classifying the opening seconds of an outbound call to an insurance \
payer's provider services line. Based on the transcription so far, decide \
who or what answered.

CONVERSATION - a live representative answered:
- A person introduces themselves by name, asks how they can help, or asks \
for your information

IVR - an automated phone tree answered:
- \"Press 1 for...\", \"For claims, say claims\", \"Please enter the \
provider's tax ID\"
- Any menu, prompt for digits, or instruction list

VOICEMAIL - a recording inviting a message:
- \"You've reached...\", \"Please leave a message\", \"after the tone\"

Output EXACTLY one word: CONVERSATION, IVR, or VOICEMAIL";

/// Benefit fields collected from the rep, in asking order.
const BENEFIT_FIELDS: [(&str, &str); 6] = [
    ("plan_active", "Is the member's plan active, and what are the effective dates?"),
    ("deductible_total", "What is the individual deductible?"),
    ("deductible_met", "How much of the deductible has been met?"),
    ("oop_max", "What is the out-of-pocket maximum?"),
    ("copay", "What is the copay or coinsurance for this service?"),
    ("prior_auth_required", "Is prior authorization required for this CPT code?"),
];

/// The eligibility-verification workflow.
#[derive(Clone)]
pub struct EligibilityVerificationFlow {
    core: FlowCore,
}

impl EligibilityVerificationFlow {
    /// Build the workflow for one call.
    pub fn new(core: FlowCore) -> Arc<Self> {
        Arc::new(Self { core })
    }

    fn identity_block(&self) -> String {
        format!(
            "# Caller Identity (share when the rep asks)\n\
             - Calling on behalf of: {facility}\n\
             - Provider: {provider} (NPI {npi})\n\
             - Tax ID: {tax_id}\n\
             - Member: {patient} (DOB {dob}, member ID {member_id})\n\
             - CPT code: {cpt}, place of service {pos}, date of service {dos}\n\
             - Callback number: {callback}",
            facility = self.core.call_data_str("facility_name"),
            provider = self.core.call_data_str("provider_name"),
            npi = self.core.call_data_str("provider_npi"),
            tax_id = self.core.call_data_str("tax_id"),
            patient = self.core.call_data_str("patient_name"),
            dob = self.core.call_data_str("date_of_birth"),
            member_id = self.core.call_data_str("insurance_member_id"),
            cpt = self.core.call_data_str("cpt_code"),
            pos = self.core.call_data_str("place_of_service"),
            dos = self.core.call_data_str("date_of_service"),
            callback = self.core.call_data_str("provider_call_back_phone"),
        )
    }

    fn rep_conversation_node(self: &Arc<Self>) -> NodeConfig {
        let record_flow = Arc::clone(self);
        let record = handler_fn(move |args, mgr| {
            let flow = Arc::clone(&record_flow);
            Box::pin(async move { flow.record_benefit(args, mgr).await })
        });
        let wrap_flow = Arc::clone(self);
        let wrap_up = handler_fn(move |_args, mgr| {
            let flow = Arc::clone(&wrap_flow);
            Box::pin(async move {
                let _ = mgr;
                info!("benefit collection wrapped up");
                Ok(HandlerOutcome::next(flow.closing_node()))
            })
        });
        let staff_flow = Arc::clone(self);
        let request_staff = handler_fn(move |_args, _mgr| {
            let flow = Arc::clone(&staff_flow);
            Box::pin(async move { Ok(HandlerOutcome::next(flow.staff_confirmation_node())) })
        });

        let checklist = BENEFIT_FIELDS
            .iter()
            .map(|(field, question)| format!("- {field}: {question}"))
            .collect::<Vec<_>>()
            .join("\n");

        NodeConfig::named("rep_conversation")
            .task_message(format!(
                "You are speaking with an insurance representative. Work through this \
                 checklist, one question at a time, and call record_benefit after EACH \
                 answer:\n{checklist}\n\n\
                 Answer the rep's verification questions from your caller identity. Spell \
                 IDs character by character when asked.\n\
                 If the rep asks to speak with your manager, call request_staff.\n\
                 When every field is recorded, or the rep says that's everything they can \
                 provide, call wrap_up."
            ))
            .function(FunctionSchema::new(
                "record_benefit",
                "Record one benefit answer from the rep. Call after each answer.",
                serde_json::json!({
                    "field": {
                        "type": "string",
                        "enum": BENEFIT_FIELDS.iter().map(|(f, _)| *f).collect::<Vec<_>>(),
                    },
                    "value": { "type": "string", "description": "The rep's answer, verbatim." }
                }),
                &["field", "value"],
                record,
            ))
            .function(FunctionSchema::new(
                "request_staff",
                "The rep asked to speak with your manager or a human supervisor.",
                serde_json::json!({}),
                &[],
                request_staff,
            ))
            .function(FunctionSchema::new(
                "wrap_up",
                "All fields recorded, or the rep is done providing information.",
                serde_json::json!({}),
                &[],
                wrap_up,
            ))
            .wait_for_user()
    }

    fn staff_confirmation_node(self: &Arc<Self>) -> NodeConfig {
        let dial_core = self.core.clone();
        let dial_staff = handler_fn(move |_args, mgr| {
            let core = dial_core.clone();
            Box::pin(async move { Ok(core.initiate_sip_transfer(mgr)) })
        });
        let decline_flow = Arc::clone(self);
        let decline = handler_fn(move |_args, _mgr| {
            let flow = Arc::clone(&decline_flow);
            Box::pin(async move {
                info!("transfer declined, returning to wrap-up");
                Ok(HandlerOutcome::next(flow.closing_node()))
            })
        });
        NodeConfig::named("staff_confirmation")
            .task_message(
                "You just asked if they'd like to speak with your manager.\n\n\
                 - If yes/sure/please/okay: call dial_staff\n\
                 - If no/nevermind/continue: call decline_transfer",
            )
            .function(FunctionSchema::new(
                "dial_staff",
                "Transfer to the manager when they confirm.",
                serde_json::json!({}),
                &[],
                dial_staff,
            ))
            .function(FunctionSchema::new(
                "decline_transfer",
                "Continue to call wrap-up if they decline the transfer.",
                serde_json::json!({}),
                &[],
                decline,
            ))
            .pre_action(ActionConfig::TtsSay(
                "Would you like to speak with my manager?".into(),
            ))
            .wait_for_user()
    }

    fn closing_node(self: &Arc<Self>) -> NodeConfig {
        NodeConfig::named("closing")
            .task_message(
                "Thank the representative for their time, ask for a call reference number \
                 if you don't have one, and say goodbye. After saying goodbye, call \
                 end_call.",
            )
            .function({
                let flow = Arc::clone(self);
                let reference = handler_fn(move |args, mgr| {
                    let flow = Arc::clone(&flow);
                    Box::pin(async move {
                        let value = args["reference_number"]
                            .as_str()
                            .unwrap_or_default()
                            .to_owned();
                        mgr.state_mut().set("reference_number", value.clone());
                        let patient_id = mgr.state().str("patient_id");
                        flow.core
                            .try_patient_update(
                                &patient_id,
                                serde_json::json!({ "reference_number": value }),
                            )
                            .await;
                        Ok(HandlerOutcome::stay())
                    })
                });
                FunctionSchema::new(
                    "record_reference_number",
                    "Record the call reference number the rep provides.",
                    serde_json::json!({
                        "reference_number": { "type": "string", "description": "Reference number, verbatim." }
                    }),
                    &["reference_number"],
                    reference,
                )
            })
            .function(self.core.end_call_schema())
    }

    async fn record_benefit(
        self: Arc<Self>,
        args: serde_json::Value,
        mgr: &mut FlowManager,
    ) -> Result<HandlerOutcome> {
        let field = args["field"].as_str().unwrap_or_default().to_owned();
        let value = args["value"].as_str().unwrap_or_default().to_owned();
        if field.is_empty() || value.is_empty() {
            return Ok(HandlerOutcome::say("missing field or value"));
        }
        info!(field = %field, "benefit recorded");
        mgr.state_mut().set(format!("benefit_{field}"), value.clone());
        let patient_id = mgr.state().str("patient_id");
        let mut update = serde_json::Map::new();
        update.insert(format!("benefit_{field}"), serde_json::Value::String(value));
        self.core
            .try_patient_update(&patient_id, serde_json::Value::Object(update))
            .await;

        let remaining: Vec<&str> = BENEFIT_FIELDS
            .iter()
            .map(|(f, _)| *f)
            .filter(|f| mgr.state().str(&format!("benefit_{f}")).is_empty())
            .collect();
        Ok(HandlerOutcome::say(if remaining.is_empty() {
            "all fields recorded; wrap up the call".to_owned()
        } else {
            format!("recorded; still needed: {}", remaining.join(", "))
        }))
    }

    fn global_instructions_text(&self) -> String {
        format!(
            "You are a virtual assistant from {facility}, calling to verify insurance \
             eligibility and benefits.\n\n\
             # Voice Conversation Style\n\
             You are on a phone call with an insurance representative. Your responses are \
             converted to speech:\n\
             - Speak professionally, like a healthcare worker on a routine verification call\n\
             - Keep responses concise; answer questions directly without over-explaining\n\
             - Don't thank the rep after every answer, just move to the next question\n\
             - When spelling out IDs, say each character clearly\n\
             - NEVER use bullet points, numbered lists, or markdown\n\n\
             {identity}",
            facility = self.core.call_data_str("facility_name"),
            identity = self.identity_block(),
        )
    }
}

#[async_trait]
impl CallFlow for EligibilityVerificationFlow {
    fn workflow(&self) -> &'static str {
        "eligibility_verification"
    }

    fn global_instructions(&self, _state: &FlowState) -> String {
        self.global_instructions_text()
    }

    fn init_state(&self, state: &mut FlowState) {
        self.core.init_common_state(state);
        for field in [
            "insurance_member_id",
            "insurance_company_name",
            "facility_name",
            "tax_id",
            "provider_name",
            "provider_npi",
            "provider_call_back_phone",
            "cpt_code",
            "place_of_service",
            "date_of_service",
        ] {
            state.set_default(field, self.core.call_data_str(field));
        }
    }

    fn initial_node(self: Arc<Self>) -> NodeConfig {
        self.greeting_node()
    }

    fn greeting_node(self: Arc<Self>) -> NodeConfig {
        self.rep_conversation_node()
            .role_message(self.global_instructions_text())
    }

    fn triage_config(&self) -> Option<TriageFlowConfig> {
        Some(TriageFlowConfig {
            classifier_prompt: TRIAGE_CLASSIFIER_PROMPT.to_owned(),
            ivr_navigation_goal: format!(
                "Reach the eligibility and benefits department for a provider calling \
                 about a member.\n{}",
                self.identity_block()
            ),
            voicemail_message: format!(
                "Hello, this is a representative from {facility} calling to verify \
                 eligibility and benefits for a member. We'll try again later. Thank you.",
                facility = self.core.call_data_str("facility_name"),
            ),
        })
    }

    async fn handoff_entry_node(self: Arc<Self>, _context: &str, _state: &FlowState) -> NodeConfig {
        self.greeting_node()
    }

    fn route_after_verification(self: Arc<Self>, _state: &FlowState) -> NodeConfig {
        self.rep_conversation_node()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::config::ColdTransferConfig;
    use crate::context::shared_context;
    use crate::pipeline::{PassThrough, Pipeline};
    use crate::store::MemoryStore;
    use crate::test_utils::{MockTransport, ScriptedLlm};
    use std::sync::atomic::AtomicBool;
    use tokio::sync::mpsc;

    fn flow() -> Arc<EligibilityVerificationFlow> {
        let store = MemoryStore::shared();
        EligibilityVerificationFlow::new(FlowCore::new(
            serde_json::json!({
                "facility_name": "Lakeside Dental",
                "provider_name": "Dr. Patel",
                "provider_npi": "1234567890",
                "tax_id": "98-7654321",
                "patient_name": "David Chen",
                "date_of_birth": "1958-11-02",
                "insurance_member_id": "MEM123456789",
                "cpt_code": "D0120",
                "provider_call_back_phone": "5550001111",
            }),
            "s-1",
            "org-1",
            ColdTransferConfig::default(),
            store.clone(),
            store,
            Arc::new(MockTransport::new()),
        ))
    }

    fn manager() -> FlowManager {
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let task = Pipeline::new(vec![Box::new(PassThrough)]).start(events_tx);
        let queue = task.queue_handle();
        drop(task);
        FlowManager::new(
            shared_context(Vec::new()),
            queue,
            ScriptedLlm::new("test", Vec::new()),
            Arc::new(AtomicBool::new(false)),
        )
    }

    #[test]
    fn ivr_goal_carries_provider_identifiers() {
        let config = flow().triage_config().unwrap();
        assert!(config.ivr_navigation_goal.contains("1234567890"));
        assert!(config.ivr_navigation_goal.contains("MEM123456789"));
        assert!(config.ivr_navigation_goal.contains("David Chen"));
        assert!(config.voicemail_message.contains("Lakeside Dental"));
    }

    #[tokio::test]
    async fn record_benefit_tracks_remaining_fields() {
        let flow = flow();
        let mut mgr = manager();
        flow.init_state(mgr.state_mut());

        let outcome = Arc::clone(&flow)
            .record_benefit(
                serde_json::json!({ "field": "plan_active", "value": "Active through December" }),
                &mut mgr,
            )
            .await
            .unwrap();
        let message = outcome.message.unwrap();
        assert!(message.contains("deductible_total"));
        assert!(!message.contains("plan_active,"));
        assert_eq!(
            mgr.state().str("benefit_plan_active"),
            "Active through December"
        );
    }

    #[tokio::test]
    async fn all_fields_recorded_suggests_wrap_up() {
        let flow = flow();
        let mut mgr = manager();
        flow.init_state(mgr.state_mut());
        for (field, _) in BENEFIT_FIELDS {
            let _ = Arc::clone(&flow)
                .record_benefit(
                    serde_json::json!({ "field": field, "value": "answered" }),
                    &mut mgr,
                )
                .await
                .unwrap();
        }
        let outcome = Arc::clone(&flow)
            .record_benefit(
                serde_json::json!({ "field": "copay", "value": "20 dollars" }),
                &mut mgr,
            )
            .await
            .unwrap();
        assert!(outcome.message.unwrap().contains("wrap up"));
    }

    #[test]
    fn greeting_node_has_the_rep_checklist() {
        let node = flow().greeting_node();
        assert_eq!(node.name, "rep_conversation");
        assert!(!node.respond_immediately);
        let task = &node.task_messages[0].content;
        assert!(task.contains("record_benefit"));
        assert!(task.contains("prior_auth_required"));
    }
}

//! Shared flow machinery: the workflow trait, identity verification,
//! transfer handling, end-call latching and cross-workflow handoff.
//!
//! Concrete workflows embed a [`FlowCore`] (call data, stores, transport,
//! transfer endpoints) and implement [`CallFlow`]. Verification and transfer
//! behavior is identical across dial-in workflows, so it lives here; each
//! workflow contributes its node graph, persona and triage configuration.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::config::ColdTransferConfig;
use crate::dates::parse_natural_date;
use crate::error::Result;
use crate::flow::manager::FlowManager;
use crate::flow::types::{
    ActionConfig, FlowState, FunctionSchema, HandlerOutcome, NodeConfig, handler_fn,
};
use crate::store::{CallStatus, PatientRecord, PatientStore, SessionStore};
use crate::transport::Transport;
use crate::util::{normalize_phone, normalize_sip_endpoint, phone_last4};

/// Triage configuration supplied by dial-out workflows.
#[derive(Debug, Clone)]
pub struct TriageFlowConfig {
    /// System prompt for the 3-way classifier.
    pub classifier_prompt: String,
    /// Rendered IVR navigation goal.
    pub ivr_navigation_goal: String,
    /// Message left when voicemail answers.
    pub voicemail_message: String,
}

/// A workflow: node factories, persona and triage configuration.
#[async_trait]
pub trait CallFlow: Send + Sync {
    /// Workflow name (matches the services config directory).
    fn workflow(&self) -> &'static str;

    /// Persona and style instructions for the conversation LLM.
    fn global_instructions(&self, state: &FlowState) -> String;

    /// Seed the flow state from call data.
    fn init_state(&self, state: &mut FlowState);

    /// Entry node for dial-in calls.
    fn initial_node(self: Arc<Self>) -> NodeConfig;

    /// Entry node for dial-out calls, once triage hears a human.
    fn greeting_node(self: Arc<Self>) -> NodeConfig;

    /// Triage configuration; `None` disables triage for this workflow.
    fn triage_config(&self) -> Option<TriageFlowConfig> {
        None
    }

    /// Workflows this one may hand off to.
    fn handoff_targets(&self) -> &'static [&'static str] {
        &[]
    }

    /// Entry node when another workflow routes here mid-call.
    async fn handoff_entry_node(self: Arc<Self>, context: &str, state: &FlowState) -> NodeConfig;

    /// Node to continue in after successful identity verification.
    fn route_after_verification(self: Arc<Self>, state: &FlowState) -> NodeConfig;

    /// Fields carried from a matched patient record into the flow state.
    fn extract_lookup_record(&self, patient: &PatientRecord) -> serde_json::Value {
        serde_json::json!({
            "patient_id": patient.patient_id,
            "first_name": patient.first_name,
            "last_name": patient.last_name,
            "phone_number": patient.phone_number,
            "date_of_birth": patient.date_of_birth,
            "email": patient.email,
        })
    }

    /// Populate workflow-specific state after verification.
    fn populate_domain_state(&self, state: &mut FlowState, lookup: &serde_json::Value) {
        let _ = (state, lookup);
    }

    /// Greeting spoken right after verification succeeds.
    fn verification_greeting(&self, first_name: &str) -> Option<String> {
        let _ = first_name;
        None
    }

    /// Node to return to when the caller declines a transfer and stays.
    fn stay_node(self: Arc<Self>, state: &FlowState) -> Option<NodeConfig> {
        let _ = state;
        None
    }
}

/// Reasons that transfer immediately: the bot cannot help with these.
const SKILL_KEYWORDS: [&str; 8] = [
    "billing",
    "cancel",
    "reschedule",
    "insurance",
    "medical_advice",
    "complaint",
    "urgent",
    "check_in",
];

/// Reasons that mean "I want a person": soft-sell before transferring.
const HUMAN_KEYWORDS: [&str; 6] = ["human", "person", "someone", "real", "staff", "agent"];

struct FlowCoreInner {
    call_data: serde_json::Value,
    session_id: String,
    organization_id: String,
    organization_name: String,
    cold_transfer: ColdTransferConfig,
    sessions: Arc<dyn SessionStore>,
    patients: Arc<dyn PatientStore>,
    transport: Arc<dyn Transport>,
}

/// Shared, cheaply clonable flow context.
#[derive(Clone)]
pub struct FlowCore {
    inner: Arc<FlowCoreInner>,
}

impl FlowCore {
    /// Build the core for one call.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        call_data: serde_json::Value,
        session_id: impl Into<String>,
        organization_id: impl Into<String>,
        cold_transfer: ColdTransferConfig,
        sessions: Arc<dyn SessionStore>,
        patients: Arc<dyn PatientStore>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let organization_name = call_data["organization_name"]
            .as_str()
            .unwrap_or("the clinic")
            .to_owned();
        Self {
            inner: Arc::new(FlowCoreInner {
                call_data,
                session_id: session_id.into(),
                organization_id: organization_id.into(),
                organization_name,
                cold_transfer,
                sessions,
                patients,
                transport,
            }),
        }
    }

    /// Opaque per-call data supplied in the start request.
    pub fn call_data(&self) -> &serde_json::Value {
        &self.inner.call_data
    }

    /// A string field from call data, empty when missing.
    pub fn call_data_str(&self, key: &str) -> String {
        self.inner.call_data[key]
            .as_str()
            .unwrap_or_default()
            .to_owned()
    }

    /// Session id of this call.
    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    /// Owning organization id.
    pub fn organization_id(&self) -> &str {
        &self.inner.organization_id
    }

    /// Display name of the organization.
    pub fn organization_name(&self) -> &str {
        &self.inner.organization_name
    }

    /// Patient store handle.
    pub fn patients(&self) -> &Arc<dyn PatientStore> {
        &self.inner.patients
    }

    /// Session store handle.
    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.inner.sessions
    }

    /// Seed the state fields every workflow shares.
    pub fn init_common_state(&self, state: &mut FlowState) {
        for field in [
            "patient_id",
            "patient_name",
            "first_name",
            "last_name",
            "date_of_birth",
            "phone_number",
        ] {
            state.set_default(field, self.call_data_str(field));
        }
        state.set_default("identity_verified", false);
        state.set_default("caller_stated_name", false);
        state.set_default("routed_to", "");
        state.set_default("lookup_attempts", 0);
        state.set_default("anything_else_count", 0);
    }

    /// Best-effort patient update; verification and booking never fail the
    /// call over a store hiccup.
    pub async fn try_patient_update(&self, patient_id: &str, updates: serde_json::Value) {
        if patient_id.is_empty() {
            warn!("patient update skipped, no patient_id");
            return;
        }
        if let Err(e) = self
            .inner
            .patients
            .update_patient(patient_id, updates, &self.inner.organization_id)
            .await
        {
            warn!(error = %e, "patient update failed");
        }
    }

    // ==================== Shared schemas ====================

    /// `end_call` tool shared by every workflow.
    pub fn end_call_schema(&self) -> FunctionSchema {
        let core = self.clone();
        let handler = handler_fn(move |_args, mgr| {
            let core = core.clone();
            Box::pin(async move { core.end_call(mgr).await })
        });
        FunctionSchema::new(
            "end_call",
            "End call. Use when caller says goodbye/bye/that's all. NOT just 'thank you'.",
            serde_json::json!({}),
            &[],
            handler,
        )
    }

    /// `request_staff` tool with smart routing on the stated reason.
    pub fn request_staff_schema(&self, flow: Arc<dyn CallFlow>) -> FunctionSchema {
        let core = self.clone();
        let handler = handler_fn(move |args, mgr| {
            let core = core.clone();
            let flow = Arc::clone(&flow);
            Box::pin(async move { core.request_staff(flow, args, mgr).await })
        });
        FunctionSchema::new(
            "request_staff",
            "Transfer to staff. Use for: billing, cancel, reschedule, insurance, or when the caller asks for a human.",
            serde_json::json!({
                "reason": {
                    "type": "string",
                    "description": "One of: billing, cancel, reschedule, insurance, medical_advice, complaint, urgent, human (caller wants a person)"
                }
            }),
            &["reason"],
            handler,
        )
    }

    /// `route_to_workflow` tool for cross-workflow handoff.
    pub fn route_to_workflow_schema(&self, flow: Arc<dyn CallFlow>) -> FunctionSchema {
        let core = self.clone();
        let targets: Vec<String> = flow
            .handoff_targets()
            .iter()
            .map(|s| (*s).to_owned())
            .collect();
        let handler = handler_fn(move |args, mgr| {
            let core = core.clone();
            let flow = Arc::clone(&flow);
            Box::pin(async move { core.route_to_workflow(flow, args, mgr).await })
        });
        FunctionSchema::new(
            "route_to_workflow",
            "Route to another workflow.",
            serde_json::json!({
                "workflow": { "type": "string", "enum": targets },
                "reason": { "type": "string", "description": "Brief context for the handoff" }
            }),
            &["workflow", "reason"],
            handler,
        )
    }

    // ==================== Verification nodes ====================

    /// Phone-collection node opening the verification subroutine.
    pub fn patient_lookup_node(&self, flow: Arc<dyn CallFlow>) -> NodeConfig {
        let core = self.clone();
        let lookup_flow = Arc::clone(&flow);
        let lookup = handler_fn(move |args, mgr| {
            let core = core.clone();
            let flow = Arc::clone(&lookup_flow);
            Box::pin(async move { core.lookup_by_phone(flow, args, mgr).await })
        });
        NodeConfig::named("patient_lookup")
            .task_message(
                "You just asked for the phone number. Wait for the caller to provide it.\n\n\
                 # Phone Normalization\n\
                 Spoken to written, digits only:\n\
                 - \"five five five one two three four\" becomes \"5551234\"\n\
                 - \"555-123-4567\" becomes \"5551234567\"\n\n\
                 # IMPORTANT: Confirm Before Lookup\n\
                 After collecting the number, READ IT BACK to confirm before calling \
                 lookup_by_phone. Format: \"That's [number as XXX-XXX-XXXX], correct?\"\n\n\
                 If the caller says the number is wrong, ask them to repeat it.\n\
                 If unclear, ask: \"Could you repeat that number?\"\n\
                 If the caller doesn't know their number, call request_staff.",
            )
            .function(FunctionSchema::new(
                "lookup_by_phone",
                "Look up patient by phone. Call after collecting and confirming the phone number.",
                serde_json::json!({
                    "phone_number": { "type": "string", "description": "Digits only (e.g. '5551234567')" }
                }),
                &["phone_number"],
                lookup,
            ))
            .function(self.request_staff_schema(flow))
            .pre_action(ActionConfig::TtsSay(
                "Sounds good! What's the phone number on your account?".into(),
            ))
            .wait_for_user()
    }

    /// DOB verification node.
    pub fn verify_dob_node(&self, flow: Arc<dyn CallFlow>) -> NodeConfig {
        let core = self.clone();
        let verify_flow = Arc::clone(&flow);
        let verify = handler_fn(move |args, mgr| {
            let core = core.clone();
            let flow = Arc::clone(&verify_flow);
            Box::pin(async move { core.verify_dob(flow, args, mgr).await })
        });
        NodeConfig::named("verify_dob")
            .task_message(
                "Wait for the caller to provide their date of birth.\n\n\
                 # Date Normalization\n\
                 Spoken to written:\n\
                 - \"march twenty second seventy eight\" becomes \"March 22, 1978\"\n\
                 - \"three twenty two nineteen seventy eight\" becomes \"March 22, 1978\"\n\n\
                 Once you have the DOB, call verify_dob immediately.\n\n\
                 If unclear, ask: \"Could you repeat that date?\"\n\
                 If the caller can't verify, call request_staff.",
            )
            .function(FunctionSchema::new(
                "verify_dob",
                "Verify patient by DOB. Call after collecting the date of birth.",
                serde_json::json!({
                    "date_of_birth": { "type": "string", "description": "Natural format (e.g. 'March 22, 1978')" }
                }),
                &["date_of_birth"],
                verify,
            ))
            .function(self.request_staff_schema(flow))
            .pre_action(ActionConfig::TtsSay(
                "Can you confirm your date of birth please?".into(),
            ))
            .wait_for_user()
    }

    /// Retry node after a failed lookup or DOB mismatch.
    pub fn patient_not_found_node(&self, flow: Arc<dyn CallFlow>, state: &FlowState) -> NodeConfig {
        let phone = state.str("_last_lookup_phone");
        let phone_display = if phone.len() == 10 {
            format!("{}-{}-{}", &phone[..3], &phone[3..6], &phone[6..])
        } else {
            phone
        };
        let core = self.clone();
        let retry_flow = Arc::clone(&flow);
        let retry = handler_fn(move |args, mgr| {
            let core = core.clone();
            let flow = Arc::clone(&retry_flow);
            Box::pin(async move { core.retry_lookup(flow, args, mgr).await })
        });
        NodeConfig::named("patient_not_found")
            .task_message(
                "The patient wasn't found. Allow them to retry with different info.\n\n\
                 # Rules\n\
                 - If the caller provides a new phone AND/OR date of birth, call retry_lookup \
                 with the new values\n\
                 - If the caller wants to speak to someone, call request_staff\n\
                 - If the caller says goodbye, call end_call\n\n\
                 # Phone/DOB Normalization\n\
                 Phone: digits only (e.g. \"5551234567\")\n\
                 DOB: natural format (e.g. \"March 22, 1978\")",
            )
            .function(FunctionSchema::new(
                "retry_lookup",
                "Retry lookup with corrected phone and/or DOB.",
                serde_json::json!({
                    "phone_number": { "type": "string", "description": "Corrected phone (digits only), or same if unchanged" },
                    "date_of_birth": { "type": "string", "description": "Corrected DOB (natural format), or same if unchanged" }
                }),
                &["phone_number", "date_of_birth"],
                retry,
            ))
            .function(self.request_staff_schema(Arc::clone(&flow)))
            .function(self.end_call_schema())
            .pre_action(ActionConfig::TtsSay(format!(
                "I'm sorry, I couldn't find a record for {phone_display} with that date of \
                 birth. Could you double-check those for me?"
            )))
            .wait_for_user()
    }

    // ==================== Transfer nodes ====================

    /// Speak the transfer message, fire the SIP transfer, end the leg.
    pub fn transfer_pending_node(&self) -> NodeConfig {
        let core = self.clone();
        let transfer = crate::flow::types::action_fn(move |mgr| {
            let core = core.clone();
            Box::pin(async move {
                core.sip_transfer(mgr).await;
                Ok(())
            })
        });
        NodeConfig::named("transfer_pending")
            .pre_action(ActionConfig::TtsSay(
                "Transferring you now, please hold.".into(),
            ))
            .pre_action(ActionConfig::Function(transfer))
            .post_action(ActionConfig::EndConversation)
    }

    /// Apologize and recover when the transfer could not be placed.
    pub fn transfer_failed_node(&self, flow: Arc<dyn CallFlow>, state: &FlowState) -> NodeConfig {
        let core = self.clone();
        let retry = handler_fn(move |_args, mgr| {
            let core = core.clone();
            Box::pin(async move {
                info!("retrying SIP transfer");
                Ok(core.initiate_sip_transfer(mgr))
            })
        });
        NodeConfig::named("transfer_failed")
            .role_message(flow.global_instructions(state))
            .task_message(
                "The transfer didn't go through. Wait for the caller's response.\n\n\
                 If the caller wants to try again, call retry_transfer.\n\
                 If the caller says goodbye, call end_call.",
            )
            .function(FunctionSchema::new(
                "retry_transfer",
                "Retry the failed transfer.",
                serde_json::json!({}),
                &[],
                retry,
            ))
            .function(self.end_call_schema())
            .pre_action(ActionConfig::TtsSay(
                "I apologize, the transfer didn't go through.".into(),
            ))
            .wait_for_user()
    }

    /// Soft-sell node shown when the caller asks for a human.
    pub fn human_request_node(&self, flow: Arc<dyn CallFlow>) -> NodeConfig {
        let transfer_core = self.clone();
        let transfer = handler_fn(move |_args, mgr| {
            let core = transfer_core.clone();
            Box::pin(async move {
                info!("caller insisted on a human, transferring");
                Ok(core.initiate_sip_transfer(mgr))
            })
        });
        let stay_flow = Arc::clone(&flow);
        let stay = handler_fn(move |_args, mgr| {
            let flow = Arc::clone(&stay_flow);
            Box::pin(async move {
                info!("caller agreed to stay with the bot");
                Ok(match Arc::clone(&flow).stay_node(mgr.state()) {
                    Some(node) => {
                        HandlerOutcome::say_and_next("Great! What can I do for you?", node)
                    }
                    None => HandlerOutcome::say("Great! How can I help?"),
                })
            })
        });
        NodeConfig::named("human_request_response")
            .task_message(
                "The caller asked for a human. You just offered to help instead. Wait for \
                 their response:\n\n\
                 If they WANT THE HUMAN (\"yes transfer me\", \"I want a real person\", \
                 \"just transfer\", \"no\" rejecting your offer, \"I'll wait\", \"I'll hold\"), \
                 call transfer_to_human immediately.\n\n\
                 If they AGREE to stay (\"okay what can you help with\", \"sure let's try\", \
                 \"fine what do you need\"), call stay_with_bot.\n\n\
                 If they say GOODBYE (\"bye\", \"thank you bye\", \"that's all\"), call \
                 end_call.\n\n\
                 Do NOT ask clarifying questions - just handle their response.",
            )
            .function(FunctionSchema::new(
                "transfer_to_human",
                "Caller wants the human transfer (said no, I'll wait, transfer me, etc).",
                serde_json::json!({}),
                &[],
                transfer,
            ))
            .function(FunctionSchema::new(
                "stay_with_bot",
                "Caller explicitly agrees to stay with the bot and wants help.",
                serde_json::json!({}),
                &[],
                stay,
            ))
            .function(self.end_call_schema())
            .pre_action(ActionConfig::TtsSay(
                "Let me check... the next available agent is about 12 minutes away. Is there \
                 something I can help you with in the meantime?"
                    .into(),
            ))
            .wait_for_user()
    }

    // ==================== Handlers ====================

    async fn lookup_by_phone(
        &self,
        flow: Arc<dyn CallFlow>,
        args: serde_json::Value,
        mgr: &mut FlowManager,
    ) -> Result<HandlerOutcome> {
        let digits = normalize_phone(args["phone_number"].as_str().unwrap_or_default());
        info!(phone = phone_last4(&digits), "looking up patient by phone");
        mgr.state_mut().set("_last_lookup_phone", digits.clone());

        let patient = self
            .inner
            .patients
            .find_by_phone(&digits, &self.inner.organization_id, flow.workflow())
            .await?;

        match patient {
            Some(patient) => {
                if patient.date_of_birth.is_empty() {
                    warn!("patient found but no DOB on file, transferring to staff");
                    return Ok(self.initiate_sip_transfer(mgr));
                }
                let lookup = flow.extract_lookup_record(&patient);
                mgr.state_mut().set("_lookup_record", lookup);
                info!("record found, requesting DOB");
                Ok(HandlerOutcome::next(self.verify_dob_node(flow)))
            }
            None => {
                let attempts = mgr.state_mut().bump("lookup_attempts");
                if attempts >= 2 {
                    info!("no patient found after two attempts, transferring");
                    return Ok(self.initiate_sip_transfer(mgr));
                }
                info!("no patient found, offering retry");
                mgr.state_mut().set("_last_lookup_dob", "");
                Ok(HandlerOutcome::next(
                    self.patient_not_found_node(flow, mgr.state()),
                ))
            }
        }
    }

    async fn verify_dob(
        &self,
        flow: Arc<dyn CallFlow>,
        args: serde_json::Value,
        mgr: &mut FlowManager,
    ) -> Result<HandlerOutcome> {
        let raw = args["date_of_birth"].as_str().unwrap_or_default().trim();
        let provided = parse_natural_date(raw, None);
        let lookup = mgr
            .state()
            .get("_lookup_record")
            .cloned()
            .unwrap_or_default();
        let stored = lookup["date_of_birth"].as_str().unwrap_or_default();
        info!(provided = ?provided, "verifying DOB");
        mgr.state_mut()
            .set("_last_lookup_dob", provided.clone().unwrap_or_else(|| raw.to_owned()));

        if provided.as_deref() != Some(stored) || stored.is_empty() {
            warn!("DOB mismatch");
            mgr.state_mut().remove("_lookup_record");
            let attempts = mgr.state_mut().bump("lookup_attempts");
            if attempts >= 2 {
                return Ok(self.initiate_sip_transfer(mgr));
            }
            return Ok(HandlerOutcome::next(
                self.patient_not_found_node(flow, mgr.state()),
            ));
        }

        self.apply_verified_identity(&flow, &lookup, mgr).await;
        mgr.state_mut().remove("_lookup_record");
        let greeting = flow.verification_greeting(lookup["first_name"].as_str().unwrap_or_default());
        let next = Arc::clone(&flow).route_after_verification(mgr.state());
        Ok(HandlerOutcome {
            message: greeting,
            next_node: Some(next),
        })
    }

    async fn retry_lookup(
        &self,
        flow: Arc<dyn CallFlow>,
        args: serde_json::Value,
        mgr: &mut FlowManager,
    ) -> Result<HandlerOutcome> {
        let digits = normalize_phone(args["phone_number"].as_str().unwrap_or_default());
        let raw_dob = args["date_of_birth"].as_str().unwrap_or_default().trim();
        let provided_dob = parse_natural_date(raw_dob, None);
        info!(phone = phone_last4(&digits), dob = ?provided_dob, "retrying lookup");
        mgr.state_mut().set("_last_lookup_phone", digits.clone());
        mgr.state_mut().set(
            "_last_lookup_dob",
            provided_dob.clone().unwrap_or_else(|| raw_dob.to_owned()),
        );

        if let Some(patient) = self
            .inner
            .patients
            .find_by_phone(&digits, &self.inner.organization_id, flow.workflow())
            .await?
            && provided_dob.as_deref() == Some(patient.date_of_birth.as_str())
            && !patient.date_of_birth.is_empty()
        {
            let lookup = flow.extract_lookup_record(&patient);
            self.apply_verified_identity(&flow, &lookup, mgr).await;
            let greeting = flow.verification_greeting(&patient.first_name);
            info!("retry successful, patient verified");
            let next = Arc::clone(&flow).route_after_verification(mgr.state());
            return Ok(HandlerOutcome {
                message: greeting,
                next_node: Some(next),
            });
        }

        info!("retry failed, transferring to staff");
        Ok(self.initiate_sip_transfer(mgr))
    }

    async fn apply_verified_identity(
        &self,
        flow: &Arc<dyn CallFlow>,
        lookup: &serde_json::Value,
        mgr: &mut FlowManager,
    ) {
        let state = mgr.state_mut();
        state.set("identity_verified", true);
        for field in [
            "patient_id",
            "first_name",
            "last_name",
            "date_of_birth",
            "phone_number",
            "email",
        ] {
            state.set(field, lookup[field].as_str().unwrap_or_default());
        }
        let name = format!(
            "{} {}",
            lookup["first_name"].as_str().unwrap_or_default(),
            lookup["last_name"].as_str().unwrap_or_default()
        );
        state.set("patient_name", name.trim());
        flow.populate_domain_state(state, lookup);
    }

    /// Choose between the transfer-pending and transfer-failed paths based
    /// on configuration.
    pub fn initiate_sip_transfer(&self, mgr: &mut FlowManager) -> HandlerOutcome {
        match normalize_sip_endpoint(self.inner.cold_transfer.staff_number.as_deref()) {
            Some(_) => HandlerOutcome::next(self.transfer_pending_node()),
            None => {
                warn!("no staff transfer number configured");
                HandlerOutcome::next(self.transfer_failed_node_without_flow(mgr))
            }
        }
    }

    /// Transfer-failed node when no flow handle is available (config gap).
    fn transfer_failed_node_without_flow(&self, _mgr: &mut FlowManager) -> NodeConfig {
        NodeConfig::named("transfer_failed")
            .task_message(
                "The transfer could not be placed. Apologize briefly and wrap up; call \
                 end_call when the caller says goodbye.",
            )
            .function(self.end_call_schema())
            .pre_action(ActionConfig::TtsSay(
                "I apologize, the transfer didn't go through.".into(),
            ))
            .wait_for_user()
    }

    /// Fire the SIP transfer, maintaining the shared transfer flag.
    pub async fn sip_transfer(&self, mgr: &mut FlowManager) {
        let Some(endpoint) = normalize_sip_endpoint(self.inner.cold_transfer.staff_number.as_deref())
        else {
            warn!("no staff transfer number configured");
            return;
        };
        mgr.set_transfer_in_progress(true);
        match self.inner.transport.sip_call_transfer(&endpoint).await {
            Ok(()) => {
                info!(endpoint = %endpoint, "SIP transfer initiated");
                let _ = self
                    .inner
                    .sessions
                    .update_session(
                        &self.inner.session_id,
                        serde_json::json!({ "call_status": CallStatus::Transferred.as_str() }),
                        &self.inner.organization_id,
                    )
                    .await;
            }
            Err(e) => {
                warn!(error = %e, "SIP transfer failed");
                mgr.set_transfer_in_progress(false);
            }
        }
    }

    async fn request_staff(
        &self,
        flow: Arc<dyn CallFlow>,
        args: serde_json::Value,
        mgr: &mut FlowManager,
    ) -> Result<HandlerOutcome> {
        let reason = args["reason"].as_str().unwrap_or_default().to_lowercase();
        info!(reason = %reason, "staff transfer requested");

        if SKILL_KEYWORDS.iter().any(|kw| reason.contains(kw)) {
            return Ok(self.initiate_sip_transfer(mgr));
        }
        if HUMAN_KEYWORDS.iter().any(|kw| reason.contains(kw)) {
            return Ok(HandlerOutcome::next(self.human_request_node(flow)));
        }
        Ok(self.initiate_sip_transfer(mgr))
    }

    async fn route_to_workflow(
        &self,
        flow: Arc<dyn CallFlow>,
        args: serde_json::Value,
        mgr: &mut FlowManager,
    ) -> Result<HandlerOutcome> {
        let workflow = args["workflow"].as_str().unwrap_or_default().to_owned();
        let reason = args["reason"].as_str().unwrap_or_default().to_owned();
        mgr.state_mut()
            .set("routed_to", format!("{workflow} (AI)"));
        info!(workflow = %workflow, reason = %reason, "routing to another workflow");

        if !flow.handoff_targets().contains(&workflow.as_str()) {
            warn!(workflow = %workflow, "unknown handoff target");
            return Ok(HandlerOutcome::say_and_next(
                "I'm not sure how to help with that. Let me transfer you.",
                self.transfer_pending_node(),
            ));
        }

        let target = crate::flow::load_flow(&workflow, self.clone())?;
        let first_name = mgr.state().str("first_name");
        let message = if first_name.is_empty() {
            "Let me help with that!".to_owned()
        } else {
            format!("Let me help with that, {first_name}!")
        };
        let entry = target.handoff_entry_node(&reason, mgr.state()).await;
        Ok(HandlerOutcome::say_and_next(message, entry))
    }

    /// End-call handler with the idempotence latch. Persists session and
    /// patient outcomes, then enters a deterministic goodbye node.
    pub async fn end_call(&self, mgr: &mut FlowManager) -> Result<HandlerOutcome> {
        if !mgr.mark_call_ended() {
            info!("end_call invoked twice, ignoring");
            return Ok(HandlerOutcome::stay());
        }
        info!("ending call");

        let patient_id = mgr.state().str("patient_id");
        let updates = serde_json::json!({
            "status": "completed",
            "completed_at": chrono::Utc::now().to_rfc3339(),
            "identity_verified": mgr.state().flag("identity_verified"),
            "patient_id": patient_id,
        });
        if let Err(e) = self
            .inner
            .sessions
            .update_session(&self.inner.session_id, updates, &self.inner.organization_id)
            .await
        {
            warn!(error = %e, "session update failed in end_call");
            let _ = self
                .inner
                .sessions
                .update_session(
                    &self.inner.session_id,
                    serde_json::json!({ "status": "failed" }),
                    &self.inner.organization_id,
                )
                .await;
        }
        if !patient_id.is_empty() {
            self.try_patient_update(
                &patient_id,
                serde_json::json!({
                    "call_status": CallStatus::Completed.as_str(),
                    "last_call_session_id": self.inner.session_id,
                }),
            )
            .await;
        }

        // Deterministic goodbye, no LLM call.
        Ok(HandlerOutcome::next(
            NodeConfig::named("end")
                .pre_action(ActionConfig::TtsSay("Take care!".into()))
                .post_action(ActionConfig::EndConversation)
                .wait_for_user(),
        ))
    }
}

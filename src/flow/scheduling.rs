//! Patient scheduling workflow.
//!
//! Dial-in: greet, split new vs returning, verify returning patients by
//! phone and DOB, collect the visit reason, offer slots, collect contact
//! details, confirm. Dial-out reuses the same graph once triage hears a
//! human. Also a handoff target for the lab-results workflow.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Datelike, Duration, NaiveDate, Utc};
use tracing::{info, warn};

use crate::dates::parse_natural_date;
use crate::error::Result;
use crate::flow::base::{CallFlow, FlowCore, TriageFlowConfig};
use crate::flow::manager::FlowManager;
use crate::flow::types::{
    ActionConfig, FlowState, FunctionSchema, HandlerOutcome, NodeConfig, handler_fn,
};
use crate::store::PatientRecord;
use crate::util::normalize_phone;

/// Contact fields required before a booking closes.
const REQUIRED_FIELDS: [&str; 5] = [
    "first_name",
    "last_name",
    "phone_number",
    "date_of_birth",
    "email",
];

/// Values the LLM sometimes invents for fields it never collected.
const PLACEHOLDER_VALUES: [&str; 13] = [
    "new",
    "patient",
    "unknown",
    "none",
    "n/a",
    "na",
    "not yet collected",
    "not provided",
    "not available",
    "tbd",
    "pending",
    "null",
    "undefined",
];

const TRIAGE_CLASSIFIER_PROMPT: &str = "\
You are classifying the opening seconds of an outbound phone call from a \
dental clinic to a patient. Based on the transcription so far, decide who or \
what answered.

CONVERSATION - a live person answered:
- \"Hello?\", \"Hi, this is David\", \"Who's calling?\"
- Any short natural greeting or question

IVR - an automated menu answered:
- \"Press 1 for...\", \"para español...\", \"Please listen carefully\"
- Any menu of options or instructions to press keys

VOICEMAIL - a recording that ends in a beep:
- \"You've reached...\", \"Please leave a message\", \"after the tone\"
- A personal or carrier greeting inviting a message

Output EXACTLY one word: CONVERSATION, IVR, or VOICEMAIL";

/// The scheduling workflow.
#[derive(Clone)]
pub struct PatientSchedulingFlow {
    core: FlowCore,
    today: NaiveDate,
    available_slots: Arc<Vec<String>>,
}

impl PatientSchedulingFlow {
    /// Build the workflow for one call.
    pub fn new(core: FlowCore) -> Arc<Self> {
        let today = Utc::now().date_naive();
        Arc::new(Self {
            available_slots: Arc::new(Self::generate_available_slots(today)),
            core,
            today,
        })
    }

    /// Two offered slots: tomorrow morning and the Friday after next-ish.
    fn generate_available_slots(today: NaiveDate) -> Vec<String> {
        let tomorrow = today + Duration::days(1);
        let mut days_until_friday =
            (4 - today.weekday().num_days_from_monday() as i64).rem_euclid(7);
        if days_until_friday <= 1 {
            days_until_friday += 7;
        }
        let next_friday = today + Duration::days(days_until_friday);
        vec![
            format!("{} at 9:00 AM", tomorrow.format("%A, %B %d")),
            format!("{} at 2:00 PM", next_friday.format("%A, %B %d")),
        ]
    }

    fn is_valid_value(value: &str) -> bool {
        let value = value.trim().to_lowercase();
        !value.is_empty() && !PLACEHOLDER_VALUES.contains(&value.as_str())
    }

    /// Keep any info the caller volunteered before being asked.
    fn store_volunteered_info(args: &serde_json::Value, state: &mut FlowState) {
        for field in ["first_name", "last_name", "phone_number", "email"] {
            let value = args[field].as_str().unwrap_or_default().trim();
            if Self::is_valid_value(value) {
                state.set(field, value);
            }
        }
        let dob = args["date_of_birth"].as_str().unwrap_or_default().trim();
        if !dob.is_empty() {
            state.set(
                "date_of_birth",
                parse_natural_date(dob, None).unwrap_or_else(|| dob.to_owned()),
            );
        }
        let reason = args["visit_reason"].as_str().unwrap_or_default().trim();
        if Self::is_valid_value(reason) {
            state.set("appointment_reason", reason);
        }
    }

    fn volunteered_props() -> serde_json::Value {
        serde_json::json!({
            "first_name": { "type": "string", "description": "First name if mentioned." },
            "last_name": { "type": "string", "description": "Last name if mentioned." },
            "phone_number": { "type": "string", "description": "Phone if mentioned (digits only)." },
            "email": { "type": "string", "description": "Email if mentioned." },
            "date_of_birth": { "type": "string", "description": "DOB if mentioned." },
            "visit_reason": { "type": "string", "description": "Reason for the visit if mentioned." }
        })
    }

    fn missing_required(state: &FlowState) -> Vec<&'static str> {
        REQUIRED_FIELDS
            .iter()
            .copied()
            .filter(|f| !Self::is_valid_value(&state.str(f)))
            .collect()
    }

    // ==================== Nodes ====================

    fn greeting_node_impl(self: &Arc<Self>, dial_out: bool) -> NodeConfig {
        let new_flow = Arc::clone(self);
        let set_new = handler_fn(move |args, mgr| {
            let flow = Arc::clone(&new_flow);
            Box::pin(async move { flow.set_new_patient(args, mgr).await })
        });
        let returning_flow = Arc::clone(self);
        let set_returning = handler_fn(move |args, mgr| {
            let flow = Arc::clone(&returning_flow);
            Box::pin(async move { flow.set_returning_patient(args, mgr).await })
        });

        let task = "\
FIRST: Determine if the caller wants to SCHEDULE a new appointment.

SCHEDULING includes: cleaning, check-up, exam, consultation, follow-up, any \
type of NEW appointment.
NOT scheduling (transfer these): check-IN for an existing appointment, \
cancel, reschedule an EXISTING appointment, billing, insurance, medical \
questions. Note: \"follow-up appointment\" means scheduling a NEW \
appointment, not rescheduling.

If they want something OTHER than scheduling:
Say \"Let me connect you with someone who can help with that.\" and call \
request_staff.

If they want to SCHEDULE, ask: \"Are you a new patient, or have you been \
here before?\" Then call the matching function:
- CLEARLY NEW (\"never been here\", \"first time\", \"I'm new\"): call \
set_new_patient immediately
- CLEARLY RETURNING (\"I've been here before\", \"returning patient\"): call \
set_returning_patient immediately
- UNCERTAIN (\"I don't remember\", \"maybe years ago\"): say \"No problem, \
can I have your phone number? I'll try to find you in our database.\" then \
call set_returning_patient

If they DEFLECT the question (\"does it matter?\", \"can we just \
schedule?\"): gently explain and re-ask. Do NOT transfer unless they \
explicitly ask for a human.

Capture any info they ALREADY volunteered in the function call, but don't \
ask for more - the next step handles that.";

        let flow: Arc<dyn CallFlow> = Arc::clone(self) as Arc<dyn CallFlow>;
        let mut node = NodeConfig::named("greeting")
            .role_message(self.global_instructions_text())
            .task_message(task)
            .function(FunctionSchema::new(
                "set_new_patient",
                "Caller is clearly a new patient.",
                Self::volunteered_props(),
                &[],
                set_new,
            ))
            .function(FunctionSchema::new(
                "set_returning_patient",
                "Caller has been here before, or isn't sure.",
                Self::volunteered_props(),
                &[],
                set_returning,
            ))
            .function(self.core.request_staff_schema(Arc::clone(&flow)))
            .wait_for_user();

        if dial_out {
            // Triage already heard the answer; the injected utterance
            // arrives as a task-context message and the bot opens.
            node = node
                .task_message(
                    "This is an OUTBOUND call: you are calling the patient to help them \
                     schedule their upcoming appointment. Open by introducing yourself and \
                     why you're calling, then follow the rules above.",
                )
                .pre_action(ActionConfig::TtsSay(format!(
                    "Hello! This is Monica calling from {}. I'm reaching out to help \
                     schedule your appointment.",
                    self.core.organization_name()
                )));
        } else {
            node = node.pre_action(ActionConfig::TtsSay(format!(
                "Hello! This is Monica from {}. How can I help you?",
                self.core.organization_name()
            )));
        }
        node
    }

    fn visit_reason_node(self: &Arc<Self>) -> NodeConfig {
        let flow = Arc::clone(self);
        let record = handler_fn(move |args, mgr| {
            let flow = Arc::clone(&flow);
            Box::pin(async move {
                let reason = args["reason"].as_str().unwrap_or_default().trim().to_owned();
                if Self::is_valid_value(&reason) {
                    mgr.state_mut().set("appointment_reason", reason);
                }
                Ok(HandlerOutcome::next(flow.scheduling_node()))
            })
        });
        let callflow: Arc<dyn CallFlow> = Arc::clone(self) as Arc<dyn CallFlow>;
        NodeConfig::named("visit_reason")
            .task_message(
                "Ask what brings them in, if you don't already know. Once they state a \
                 reason (cleaning, tooth pain, check-up, anything), call record_visit_reason \
                 with it. Keep it to one short question.",
            )
            .function(FunctionSchema::new(
                "record_visit_reason",
                "Record why the patient wants to come in.",
                serde_json::json!({
                    "reason": { "type": "string", "description": "Visit reason in the caller's words." }
                }),
                &["reason"],
                record,
            ))
            .function(self.core.request_staff_schema(callflow))
            .pre_action(ActionConfig::TtsSay("What brings you in?".into()))
            .wait_for_user()
    }

    fn scheduling_node(self: &Arc<Self>) -> NodeConfig {
        let slots = self.available_slots.join("; ");
        let flow = Arc::clone(self);
        let select = handler_fn(move |args, mgr| {
            let flow = Arc::clone(&flow);
            Box::pin(async move { flow.select_slot(args, mgr).await })
        });
        let callflow: Arc<dyn CallFlow> = Arc::clone(self) as Arc<dyn CallFlow>;
        NodeConfig::named("scheduling")
            .task_message(format!(
                "Offer these openings, exactly as written, and let the caller pick one:\n\
                 {slots}\n\n\
                 When they pick, call select_slot with the date and time parts of the slot \
                 they chose. If neither works for them, apologize - these are the only \
                 openings - and offer to transfer to staff for other times (request_staff \
                 with reason 'reschedule')."
            ))
            .function(FunctionSchema::new(
                "select_slot",
                "Book the chosen slot. Call only with a date and time from the offered list.",
                serde_json::json!({
                    "date": { "type": "string", "description": "Date part of the chosen slot (e.g. 'Friday, March 21')" },
                    "time": { "type": "string", "description": "Time part of the chosen slot (e.g. '2:00 PM')" }
                }),
                &["date", "time"],
                select,
            ))
            .function(self.core.request_staff_schema(callflow))
            .pre_action(ActionConfig::TtsSay(format!(
                "I have two openings: {}. Which works better for you?",
                self.available_slots.join(", or ")
            )))
            .wait_for_user()
    }

    fn collect_info_node(self: &Arc<Self>, state: &FlowState) -> NodeConfig {
        let have: Vec<String> = REQUIRED_FIELDS
            .iter()
            .filter(|f| Self::is_valid_value(&state.str(f)))
            .map(|f| format!("{f}={}", state.str(f)))
            .collect();
        let need: Vec<&str> = Self::missing_required(state);
        let flow = Arc::clone(self);
        let save = handler_fn(move |args, mgr| {
            let flow = Arc::clone(&flow);
            Box::pin(async move { flow.save_patient_info(args, mgr).await })
        });
        let callflow: Arc<dyn CallFlow> = Arc::clone(self) as Arc<dyn CallFlow>;
        NodeConfig::named("collect_info")
            .task_message(format!(
                "Booking for {} at {}.\n\n\
                 ALREADY COLLECTED: {}\n\
                 STILL NEED: {}\n\n\
                 Only ask for fields in STILL NEED, ONE at a time.\n\
                 After the caller provides the LAST missing field, call save_patient_info \
                 with all five values.",
                state.str("appointment_date"),
                state.str("appointment_time"),
                if have.is_empty() { "none".to_owned() } else { have.join(", ") },
                if need.is_empty() { "none".to_owned() } else { need.join(", ") },
            ))
            .function(FunctionSchema::new(
                "save_patient_info",
                "Call after collecting ALL five fields with actual values.",
                serde_json::json!({
                    "first_name": { "type": "string", "description": "First Name" },
                    "last_name": { "type": "string", "description": "Last Name" },
                    "phone_number": { "type": "string", "description": "Phone Number" },
                    "date_of_birth": { "type": "string", "description": "Date Of Birth" },
                    "email": { "type": "string", "description": "Email" }
                }),
                &REQUIRED_FIELDS,
                save,
            ))
            .function(self.core.request_staff_schema(callflow))
    }

    fn confirmation_node(self: &Arc<Self>, state: &FlowState) -> NodeConfig {
        let correct_flow = Arc::clone(self);
        let correct = handler_fn(move |_args, mgr| {
            let flow = Arc::clone(&correct_flow);
            Box::pin(async move {
                info!("caller corrected booking details, re-offering slots");
                let _ = mgr;
                Ok(HandlerOutcome::next(flow.scheduling_node()))
            })
        });
        let callflow: Arc<dyn CallFlow> = Arc::clone(self) as Arc<dyn CallFlow>;
        NodeConfig::named("confirmation")
            .task_message(format!(
                "TODAY: {}\n\n\
                 Confirm BRIEFLY in ONE sentence: \"{}, you're booked for {}. Confirmation \
                 email to {}. Anything else?\"\n\n\
                 DO NOT list or summarize other details.\n\
                 - If no/goodbye: call end_call\n\
                 - If they want to correct something: call correct_info\n\
                 - If they ask about LAB RESULTS: call route_to_workflow with \
                 workflow=\"lab_results\"\n\
                 - If a question: answer briefly, then ask \"Anything else?\"",
                self.today.format("%B %d, %Y"),
                state.str("first_name"),
                state.str("appointment_slot"),
                state.str("email"),
            ))
            .function(self.core.route_to_workflow_schema(Arc::clone(&callflow)))
            .function(FunctionSchema::new(
                "correct_info",
                "Caller wants to change the slot or a detail.",
                serde_json::json!({}),
                &[],
                correct,
            ))
            .function(self.core.end_call_schema())
            .function(self.core.request_staff_schema(callflow))
    }

    // ==================== Handlers ====================

    async fn set_new_patient(
        self: Arc<Self>,
        args: serde_json::Value,
        mgr: &mut FlowManager,
    ) -> Result<HandlerOutcome> {
        info!("caller is a new patient");
        Self::store_volunteered_info(&args, mgr.state_mut());
        mgr.state_mut().set("appointment_type", "New Patient");
        if !mgr.state().str("first_name").is_empty() {
            mgr.state_mut().set("caller_stated_name", true);
        }
        Ok(HandlerOutcome::next(
            if mgr.state().str("appointment_reason").is_empty() {
                self.visit_reason_node()
            } else {
                self.scheduling_node()
            },
        ))
    }

    async fn set_returning_patient(
        self: Arc<Self>,
        args: serde_json::Value,
        mgr: &mut FlowManager,
    ) -> Result<HandlerOutcome> {
        info!("caller is a returning patient, starting verification");
        Self::store_volunteered_info(&args, mgr.state_mut());
        mgr.state_mut().set("appointment_type", "Returning Patient");
        let flow: Arc<dyn CallFlow> = Arc::clone(&self) as Arc<dyn CallFlow>;
        Ok(HandlerOutcome::next(self.core.patient_lookup_node(flow)))
    }

    /// A slot is accepted only when both the date and time parts match one
    /// configured opening.
    async fn select_slot(
        self: Arc<Self>,
        args: serde_json::Value,
        mgr: &mut FlowManager,
    ) -> Result<HandlerOutcome> {
        let date = args["date"].as_str().unwrap_or_default().trim().to_owned();
        let time = args["time"].as_str().unwrap_or_default().trim().to_owned();

        let matched = self.available_slots.iter().find(|slot| {
            let slot_lower = slot.to_lowercase();
            !date.is_empty()
                && !time.is_empty()
                && slot_lower.contains(&date.to_lowercase())
                && slot_lower.contains(&time.to_lowercase())
        });

        let Some(slot) = matched else {
            warn!(date = %date, time = %time, "slot did not match an opening");
            return Ok(HandlerOutcome::say(format!(
                "That time isn't available. The openings are: {}.",
                self.available_slots.join("; ")
            )));
        };

        info!(slot = %slot, "slot selected");
        mgr.state_mut().set("appointment_slot", slot.clone());
        mgr.state_mut().set("appointment_date", date);
        mgr.state_mut().set("appointment_time", time);

        let patient_id = mgr.state().str("patient_id");
        if !patient_id.is_empty() {
            self.core
                .try_patient_update(
                    &patient_id,
                    serde_json::json!({
                        "appointment_slot": mgr.state().str("appointment_slot"),
                        "appointment_date": mgr.state().str("appointment_date"),
                        "appointment_time": mgr.state().str("appointment_time"),
                        "appointment_type": mgr.state().str("appointment_type"),
                        "appointment_reason": mgr.state().str("appointment_reason"),
                    }),
                )
                .await;
        }

        let missing = Self::missing_required(mgr.state());
        if missing.is_empty() {
            return Ok(HandlerOutcome::say_and_next(
                "Perfect! Let me confirm your appointment.",
                self.confirmation_node(mgr.state()),
            ));
        }
        let message = if mgr.state().flag("identity_verified") && missing == ["email"] {
            "Perfect! I just need your email address to send the confirmation."
        } else {
            "Perfect! Now I just need a few details to complete your booking."
        };
        Ok(HandlerOutcome::say_and_next(
            message,
            self.collect_info_node(mgr.state()),
        ))
    }

    async fn save_patient_info(
        self: Arc<Self>,
        args: serde_json::Value,
        mgr: &mut FlowManager,
    ) -> Result<HandlerOutcome> {
        let mut values = serde_json::Map::new();
        for field in REQUIRED_FIELDS {
            let value = args[field].as_str().unwrap_or_default().trim().to_owned();
            if !Self::is_valid_value(&value) {
                warn!(field, "missing required field at save");
                return Ok(HandlerOutcome::say_and_next(
                    format!("I still need your {}.", field.replace('_', " ")),
                    self.collect_info_node(mgr.state()),
                ));
            }
            values.insert(field.to_owned(), serde_json::Value::String(value));
        }

        // Normalize before anything touches the store.
        if let Some(dob) = values.get("date_of_birth").and_then(|v| v.as_str()) {
            let normalized = parse_natural_date(dob, None).unwrap_or_else(|| dob.to_owned());
            values.insert("date_of_birth".into(), normalized.into());
        }
        if let Some(phone) = values.get("phone_number").and_then(|v| v.as_str()) {
            values.insert("phone_number".into(), normalize_phone(phone).into());
        }

        for (field, value) in &values {
            mgr.state_mut().set(field.clone(), value.clone());
        }
        info!(
            name = %format!("{} {}", mgr.state().str("first_name"), mgr.state().str("last_name")),
            "patient info collected"
        );

        let mut updates = serde_json::Value::Object(values);
        for field in [
            "appointment_date",
            "appointment_time",
            "appointment_type",
            "appointment_reason",
            "appointment_slot",
        ] {
            updates[field] = serde_json::Value::String(mgr.state().str(field));
        }

        let patient_id = mgr.state().str("patient_id");
        if patient_id.is_empty() {
            let record = PatientRecord {
                organization_id: self.core.organization_id().to_owned(),
                first_name: mgr.state().str("first_name"),
                last_name: mgr.state().str("last_name"),
                phone_number: mgr.state().str("phone_number"),
                date_of_birth: mgr.state().str("date_of_birth"),
                email: mgr.state().str("email"),
                ..PatientRecord::default()
            };
            match self.core.patients().create_patient(record).await {
                Ok(id) => {
                    self.core.try_patient_update(&id, updates).await;
                    mgr.state_mut().set("patient_id", id);
                }
                Err(e) => warn!(error = %e, "patient create failed"),
            }
        } else {
            self.core.try_patient_update(&patient_id, updates).await;
        }

        Ok(HandlerOutcome::next(self.confirmation_node(mgr.state())))
    }

    fn global_instructions_text(&self) -> String {
        format!(
            "You are Monica, the scheduling assistant at {org}.\n\n\
             # Voice Conversation Style\n\
             You are on a phone call; your responses are converted to speech:\n\
             - Speak naturally and warmly, one or two short sentences at a time\n\
             - Never use bullet points, numbered lists, or markdown\n\
             - Avoid repetitive acknowledgments; just move to the next step\n\
             - When saying dates, speak them naturally (\"Friday, March 21st\")\n\n\
             # Boundaries\n\
             - You only schedule appointments; transfer anything else to staff\n\
             - Never give medical advice\n\
             - Never reveal information about a patient before identity verification",
            org = self.core.organization_name()
        )
    }
}

#[async_trait]
impl CallFlow for PatientSchedulingFlow {
    fn workflow(&self) -> &'static str {
        "patient_scheduling"
    }

    fn global_instructions(&self, _state: &FlowState) -> String {
        self.global_instructions_text()
    }

    fn init_state(&self, state: &mut FlowState) {
        self.core.init_common_state(state);
        state.set("today", self.today.format("%B %d, %Y").to_string());
        state.set(
            "available_slots",
            serde_json::Value::Array(
                self.available_slots
                    .iter()
                    .map(|s| serde_json::Value::String(s.clone()))
                    .collect(),
            ),
        );
    }

    fn initial_node(self: Arc<Self>) -> NodeConfig {
        self.greeting_node_impl(false)
    }

    fn greeting_node(self: Arc<Self>) -> NodeConfig {
        self.greeting_node_impl(true)
    }

    fn triage_config(&self) -> Option<TriageFlowConfig> {
        let patient_name = self.core.call_data_str("patient_name");
        Some(TriageFlowConfig {
            classifier_prompt: TRIAGE_CLASSIFIER_PROMPT.to_owned(),
            ivr_navigation_goal: format!(
                "Reach a live person or the scheduling desk at the number you dialed. \
                 You are calling on behalf of {org} about an appointment for {patient}. \
                 Callback number: {callback}.",
                org = self.core.organization_name(),
                patient = patient_name,
                callback = self.core.call_data_str("provider_call_back_phone"),
            ),
            voicemail_message: format!(
                "Hello, this is Monica calling from {org} for {patient} about scheduling \
                 an upcoming appointment. Please call us back at your convenience. Thank you!",
                org = self.core.organization_name(),
                patient = patient_name,
            ),
        })
    }

    fn handoff_targets(&self) -> &'static [&'static str] {
        &["lab_results"]
    }

    async fn handoff_entry_node(self: Arc<Self>, context: &str, state: &FlowState) -> NodeConfig {
        let node = if state.flag("identity_verified") {
            if state.str("appointment_reason").is_empty() {
                self.visit_reason_node()
            } else {
                self.scheduling_node()
            }
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
        if state.str("appointment_reason").is_empty() {
            self.visit_reason_node()
        } else {
            self.scheduling_node()
        }
    }

    fn verification_greeting(&self, first_name: &str) -> Option<String> {
        Some(if first_name.is_empty() {
            "Welcome back!".to_owned()
        } else {
            format!("Welcome back, {first_name}!")
        })
    }

    fn stay_node(self: Arc<Self>, state: &FlowState) -> Option<NodeConfig> {
        let _ = state;
        Some(self.visit_reason_node())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::config::ColdTransferConfig;
    use crate::context::shared_context;
    use crate::pipeline::{PassThrough, Pipeline};
    use crate::store::{MemoryStore, PatientStore};
    use crate::test_utils::{MockTransport, ScriptedLlm};
    use std::sync::atomic::AtomicBool;
    use tokio::sync::mpsc;

    fn flow() -> (Arc<PatientSchedulingFlow>, Arc<MemoryStore>) {
        let store = MemoryStore::shared();
        let core = FlowCore::new(
            serde_json::json!({ "organization_name": "Demo Clinic Alpha" }),
            "s-1",
            "org-1",
            ColdTransferConfig::default(),
            store.clone(),
            store.clone(),
            Arc::new(MockTransport::new()),
        );
        (PatientSchedulingFlow::new(core), store)
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

    #[tokio::test]
    async fn slots_are_two_well_formed_openings() {
        let (flow, _store) = flow();
        assert_eq!(flow.available_slots.len(), 2);
        assert!(flow.available_slots[0].contains("9:00 AM"));
        assert!(flow.available_slots[1].contains("2:00 PM"));
    }

    #[tokio::test]
    async fn slot_must_match_date_and_time() {
        let (flow, _store) = flow();
        let mut mgr = manager();
        flow.init_state(mgr.state_mut());

        // A made-up slot is re-offered, not booked.
        let outcome = Arc::clone(&flow)
            .select_slot(
                serde_json::json!({ "date": "Sunday, January 01", "time": "11:00 PM" }),
                &mut mgr,
            )
            .await
            .unwrap();
        assert!(outcome.next_node.is_none());
        assert!(outcome.message.unwrap().contains("openings"));

        // The real first slot books.
        let slot = flow.available_slots[0].clone();
        let (date, time) = slot.split_once(" at ").unwrap();
        let outcome = Arc::clone(&flow)
            .select_slot(serde_json::json!({ "date": date, "time": time }), &mut mgr)
            .await
            .unwrap();
        assert!(outcome.next_node.is_some());
        assert_eq!(mgr.state().str("appointment_slot"), slot);
    }

    #[tokio::test]
    async fn save_rejects_placeholder_values() {
        let (flow, _store) = flow();
        let mut mgr = manager();
        flow.init_state(mgr.state_mut());

        let outcome = Arc::clone(&flow)
            .save_patient_info(
                serde_json::json!({
                    "first_name": "David",
                    "last_name": "Chen",
                    "phone_number": "5551234567",
                    "date_of_birth": "November 2, 1958",
                    "email": "not provided",
                }),
                &mut mgr,
            )
            .await
            .unwrap();
        let next = outcome.next_node.unwrap();
        assert_eq!(next.name, "collect_info");
        assert!(outcome.message.unwrap().contains("email"));
    }

    #[tokio::test]
    async fn save_creates_patient_with_appointment_fields() {
        let (flow, store) = flow();
        let mut mgr = manager();
        flow.init_state(mgr.state_mut());
        mgr.state_mut().set("appointment_type", "Returning Patient");
        mgr.state_mut().set("appointment_date", "Friday, March 21");
        mgr.state_mut().set("appointment_time", "2:00 PM");

        let outcome = Arc::clone(&flow)
            .save_patient_info(
                serde_json::json!({
                    "first_name": "David",
                    "last_name": "Chen",
                    "phone_number": "(555) 123-4567",
                    "date_of_birth": "November 2, 1958",
                    "email": "david@example.com",
                }),
                &mut mgr,
            )
            .await
            .unwrap();
        assert_eq!(outcome.next_node.unwrap().name, "confirmation");

        let patient_id = mgr.state().str("patient_id");
        let record = store.find_by_id(&patient_id, "org-1").await.unwrap().unwrap();
        assert_eq!(record.phone_number, "5551234567");
        assert_eq!(record.date_of_birth, "1958-11-02");
        assert_eq!(record.fields["appointment_type"], "Returning Patient");
        assert_eq!(record.fields["appointment_date"], "Friday, March 21");
        assert_eq!(record.fields["appointment_time"], "2:00 PM");
    }

    #[tokio::test]
    async fn returning_patient_enters_verification() {
        let (flow, _store) = flow();
        let mut mgr = manager();
        flow.init_state(mgr.state_mut());

        let outcome = Arc::clone(&flow)
            .set_returning_patient(serde_json::json!({ "first_name": "David" }), &mut mgr)
            .await
            .unwrap();
        assert_eq!(outcome.next_node.unwrap().name, "patient_lookup");
        assert_eq!(mgr.state().str("appointment_type"), "Returning Patient");
        assert_eq!(mgr.state().str("first_name"), "David");
    }

    #[tokio::test]
    async fn triage_config_renders_patient_fields() {
        let store = MemoryStore::shared();
        let core = FlowCore::new(
            serde_json::json!({
                "organization_name": "Demo Clinic Alpha",
                "patient_name": "David Chen",
            }),
            "s-1",
            "org-1",
            ColdTransferConfig::default(),
            store.clone(),
            store,
            Arc::new(MockTransport::new()),
        );
        let flow = PatientSchedulingFlow::new(core);
        let config = flow.triage_config().unwrap();
        assert!(config.voicemail_message.contains("David Chen"));
        assert!(config.ivr_navigation_goal.contains("Demo Clinic Alpha"));
        assert!(config.classifier_prompt.contains("VOICEMAIL"));
    }
}

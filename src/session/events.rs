//! The session event bus.
//!
//! Processors and the transport publish events here; the orchestrator's
//! single-threaded loop consumes them and drives flow initialization,
//! dial retries, transfers and cleanup.

use crate::context::ContextMessage;
use crate::frames::KeypadEntry;
use crate::ivr::IvrStatus;
use crate::transport::TransportEvent;

/// Everything the orchestrator reacts to during a call.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A transport lifecycle event.
    Transport(TransportEvent),
    /// Triage classified the call as a live human conversation.
    ConversationDetected {
        /// Conversation heard before the decision.
        history: Vec<ContextMessage>,
    },
    /// Triage classified the call as an IVR menu.
    IvrDetected {
        /// Conversation heard before the decision.
        history: Vec<ContextMessage>,
    },
    /// Triage classified the call as voicemail (after the response delay).
    VoicemailDetected,
    /// The IVR navigator changed status.
    IvrStatusChanged {
        /// New status (COMPLETED or STUCK reach this bus).
        status: IvrStatus,
        /// Transcription that triggered a human-detection completion, if any.
        transcription: Option<String>,
    },
    /// The IVR navigator pressed a keypad button.
    DtmfPressed(KeypadEntry),
    /// The parallel human detector confirmed a live person during IVR.
    HumanDetected {
        /// Accumulated utterance that confirmed the human.
        text: String,
    },
    /// The safety monitor detected a medical emergency.
    EmergencyDetected,
    /// The caller explicitly asked for a person.
    StaffRequested,
    /// The output validator rejected an assistant response.
    UnsafeOutput {
        /// The rejected response text.
        text: String,
    },
}

//! Clarion: real-time voice-agent orchestrator for telephony calls.
//!
//! Given a per-call configuration, Clarion establishes an audio session with
//! a telephony transport, transcribes inbound audio, classifies who answered
//! (human, IVR menu, or voicemail), navigates phone trees over DTMF, drives
//! a node-graph conversation against a language model, speaks synthesized
//! replies, and persists the transcript and outcome.
//!
//! # Architecture
//!
//! A call is one frame pipeline built from processors connected by async
//! channels, with parallel branches for triage and safety classification:
//!
//! transport input → STT → [safety monitor] → [triage → IVR navigator] →
//! mute filter → transcript/context (user) → LLM → [output validator] →
//! TTS → [TTS gate] → transcript/context (assistant) → transport output
//!
//! The session orchestrator assembles the pipeline, reacts to transport,
//! triage, IVR and safety events on a single event loop, and guarantees
//! at-most-once cleanup on every termination path.

pub mod config;
pub mod context;
pub mod dates;
pub mod error;
pub mod flow;
pub mod frames;
pub mod ivr;
pub mod logging;
pub mod pipeline;
pub mod safety;
pub mod server;
pub mod services;
pub mod session;
pub mod store;
pub mod test_utils;
pub mod transport;
pub mod triage;
pub mod util;

pub use config::{CallType, ServicesConfig};
pub use error::{CallError, Result};
pub use flow::{CallFlow, FlowManager, NodeConfig};
pub use frames::{Frame, FrameDirection};
pub use pipeline::{Pipeline, PipelineTask, Processor};
pub use session::{CallSession, CallSessionParams, SessionServices};
pub use transport::{Transport, TransportEvent};
pub use triage::TriageDecision;

//! Error types for the call orchestrator.

/// Top-level error type for the voice-agent call core.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    /// Configuration error (missing env var, missing required field).
    #[error("config error: {0}")]
    Config(String),

    /// Telephony transport error (dial-out, SIP transfer, media).
    #[error("transport error: {0}")]
    Transport(String),

    /// Speech-to-text transcription error.
    #[error("STT error: {0}")]
    Stt(String),

    /// Language model inference error.
    #[error("LLM error: {0}")]
    Llm(String),

    /// Text-to-speech synthesis error.
    #[error("TTS error: {0}")]
    Tts(String),

    /// Frame pipeline error.
    #[error("pipeline error: {0}")]
    Pipeline(String),

    /// Conversation flow error (node graph, tool handlers).
    #[error("flow error: {0}")]
    Flow(String),

    /// Session / patient store error.
    #[error("store error: {0}")]
    Store(String),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, CallError>;

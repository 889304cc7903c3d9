//! Error taxonomy (spec §7).
//!
//! Every variant carries the cleanup reason code used in front-end events
//! and conversation-log entries, so orchestrator code can go straight from
//! "I have a `GatewayError`" to "here is the reason string to report"
//! without a second mapping table.

use thiserror::Error;

use crate::ids::CallId;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("setup failed for call {call_id}: {detail}")]
    SetupFailure { call_id: CallId, detail: String },

    #[error("talk-detect setup refused for call {call_id}: {detail}")]
    TalkDetectSetupFailed { call_id: CallId, detail: String },

    #[error("inference session error on call {call_id}: {detail}")]
    InferenceSessionError { call_id: CallId, detail: String },

    #[error("PBX request failed: {0}")]
    PbxRequest(#[from] reqwest::Error),

    #[error("inference websocket error: {0}")]
    InferenceTransport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// The reason code surfaced to the PBX/front-end/conversation log, per
    /// spec §7's taxonomy and §8's named timeout reasons.
    pub fn reason_code(&self) -> &'static str {
        match self {
            GatewayError::SetupFailure { .. } => "STASIS_START_ERROR",
            GatewayError::TalkDetectSetupFailed { .. } => "TALK_DETECT_SETUP_FAILED",
            GatewayError::InferenceSessionError { .. } => "OPENAI_STREAM_ERROR",
            GatewayError::PbxRequest(_) => "PBX_REQUEST_ERROR",
            GatewayError::InferenceTransport(_) => "OPENAI_STREAM_ERROR",
            GatewayError::Io(_) => "IO_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

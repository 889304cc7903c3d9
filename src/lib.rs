//! Realtime voice-bot gateway bridging an Asterisk PBX call with a cloud
//! speech-to-speech model.
//!
//! See `SPEC_FULL.md` and `DESIGN.md` at the repository root for the
//! requirements this crate implements and the grounding for each module.

pub mod call;
pub mod config;
pub mod conversation_log;
pub mod dtmf;
pub mod error;
pub mod frontend;
pub mod gateway;
pub mod ids;
pub mod inference;
pub mod orchestrator;
pub mod pbx;
pub mod playback;
pub mod recognition;
pub mod rtp;
pub mod timers;
pub mod tools;
pub mod tts;
pub mod vad;

pub use error::GatewayError;
pub use gateway::Gateway;

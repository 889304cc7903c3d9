//! Newtype identifiers used across the gateway.
//!
//! The teacher (`discrivener`) gets away with bare `u64` ids (`UserId`,
//! `Ssrc`) because Discord only ever hands it two small integer keyspaces.
//! A telephony call mixes several string-typed PBX handles (channel ids,
//! bridge ids, playback handles) that must never be interchanged, so each
//! gets its own newtype here.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque call identifier, supplied by the PBX when a channel enters the
/// Stasis application.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct CallId(pub String);

impl CallId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for CallId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for CallId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

macro_rules! string_id {
    ($name:ident) => {
        #[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(ChannelId);
string_id!(BridgeId);
string_id!(PlaybackHandle);

/// Correlates TTS audio chunks and stream-end events with the inference
/// response that produced them, so the playback queue can discard chunks
/// belonging to a response that was already interrupted (see
/// `playback::PlaybackQueue`).
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ResponseId(pub String);

impl ResponseId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for ResponseId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ResponseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

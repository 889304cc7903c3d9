//! Per-call record (spec §3, §4.8; design note §9).
//!
//! "Re-express each call as a struct whose fields include an explicit state
//! enum plus the minimum orthogonal flags (cleanup-called,
//! overall-TTS-active, DTMF-mode, first-interaction)" instead of the
//! original's ad-hoc boolean sprawl. No direct teacher analogue holds this
//! much state in one place — `discrivener` spreads per-speaker state across
//! `VoiceBufferForUser` instances keyed by SSRC in a shared map; here the
//! call *is* the key, and everything the call owns lives in one record.

use std::collections::HashMap;

use crate::dtmf::DtmfCollector;
use crate::ids::{BridgeId, CallId, ChannelId, PlaybackHandle, ResponseId};
use crate::playback::PlaybackQueue;
use crate::recognition::RecognitionActivationMode;
use crate::rtp::RtpReceiver;
use crate::timers::TimerSet;
use crate::tts::{ArtifactTracker, FullChunkAccumulator, StreamArchiveBuffer};
use crate::vad::VadAudioBuffer;

/// The orchestrator's state machine states (spec §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Arming,
    Greeting,
    Listening,
    Speaking,
    Dtmf,
    Ending,
}

/// Orthogonal flags that don't belong in the state enum because more than
/// one can be true regardless of the current state (design note §9).
#[derive(Debug, Default)]
pub struct CallFlags {
    pub cleanup_called: bool,
    pub overall_tts_active: bool,
    pub first_interaction: bool,
}

impl CallFlags {
    pub fn new() -> Self {
        Self {
            cleanup_called: false,
            overall_tts_active: false,
            first_interaction: true,
        }
    }
}

pub struct Call {
    pub id: CallId,
    pub state: CallState,
    pub flags: CallFlags,

    pub media_channel: ChannelId,
    pub media_injection_channel: Option<ChannelId>,
    pub listener_channel: Option<ChannelId>,
    pub bridges: Vec<BridgeId>,

    pub rtp_receiver: Option<RtpReceiver>,
    pub timers: TimerSet,
    pub playback: PlaybackQueue,
    pub dtmf: DtmfCollector,
    pub vad_buffer: VadAudioBuffer,

    /// Handle of whatever is currently playing, so playback-finished/-failed
    /// events naming a stale handle (one already superseded by an
    /// interrupt) can be told apart from the current one.
    pub current_playback_handle: Option<PlaybackHandle>,
    /// Which recognition-activation mode produced the decision currently in
    /// effect, so a later talk-started event can be interpreted under the
    /// right VAD sub-mode.
    pub current_recognition_mode: Option<RecognitionActivationMode>,
    /// Set when speech is observed while `vad-initial-silence-delay` is
    /// still running, in `vadMode` (spec §4.5).
    pub vad_speech_seen_during_delay: bool,

    pub current_response_id: Option<ResponseId>,
    pub full_chunk_accumulator: Option<FullChunkAccumulator>,
    pub stream_archive: Option<StreamArchiveBuffer>,
    pub artifacts: ArtifactTracker,

    /// Extra per-call channel-variable cache, so the orchestrator can avoid
    /// redundant PBX round trips (e.g. re-reading `DTMF_RESULT`).
    pub channel_vars: HashMap<String, String>,
}

impl Call {
    pub fn new(id: CallId, media_channel: ChannelId, dtmf_max_digits: usize, dtmf_terminator: char) -> Self {
        Self {
            id,
            state: CallState::Arming,
            flags: CallFlags::new(),
            media_channel,
            media_injection_channel: None,
            listener_channel: None,
            bridges: Vec::new(),
            rtp_receiver: None,
            timers: TimerSet::new(),
            playback: PlaybackQueue::new(),
            dtmf: DtmfCollector::new(dtmf_max_digits, dtmf_terminator),
            vad_buffer: VadAudioBuffer::new(),
            current_playback_handle: None,
            current_recognition_mode: None,
            vad_speech_seen_during_delay: false,
            current_response_id: None,
            full_chunk_accumulator: None,
            stream_archive: None,
            artifacts: ArtifactTracker::new(),
            channel_vars: HashMap::new(),
        }
    }

    /// Cleanup is at-most-once per call: re-entry is a no-op (spec §3, §5).
    /// Returns `true` if this call actually performed cleanup (i.e. this was
    /// the first call), `false` if cleanup had already run.
    pub fn mark_cleanup_started(&mut self) -> bool {
        if self.flags.cleanup_called {
            return false;
        }
        self.flags.cleanup_called = true;
        self.state = CallState::Ending;
        true
    }

    pub fn is_ending(&self) -> bool {
        self.state == CallState::Ending
    }

    /// Flips the first-interaction flag to false exactly once, at the first
    /// completion of a synthesized-speech response (spec §3 invariant).
    pub fn mark_first_interaction_complete(&mut self) {
        self.flags.first_interaction = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_call() -> Call {
        Call::new(CallId::from("C1"), ChannelId::from("chan-1"), 16, '#')
    }

    #[test]
    fn cleanup_is_idempotent() {
        let mut call = new_call();
        assert!(call.mark_cleanup_started());
        assert!(!call.mark_cleanup_started());
        assert!(call.is_ending());
    }

    #[test]
    fn first_interaction_flips_exactly_once() {
        let mut call = new_call();
        assert!(call.flags.first_interaction);
        call.mark_first_interaction_complete();
        assert!(!call.flags.first_interaction);
        call.mark_first_interaction_complete();
        assert!(!call.flags.first_interaction);
    }

    #[test]
    fn initial_state_is_arming() {
        let call = new_call();
        assert_eq!(call.state, CallState::Arming);
    }
}

//! VAD / barge-in controller (spec §4.5).
//!
//! Interprets PBX talk-detect events (talk-started / talk-finished) under
//! the two VAD sub-modes and the prompt-phase barge-in rule, and buffers
//! caller audio locally while recognition has not yet activated — mutually
//! exclusive with forwarding audio live to the inference session (spec §3
//! invariant).
//!
//! Grounded on the teacher's `PacketHandler::act`, which dispatches
//! `SpeakingUpdate`/`SpeakingStateUpdate` events into per-source state
//! transitions; generalized here from "per-SSRC talk state" to "per-call
//! VAD state", and from an unconditional per-user ring buffer
//! (`voice_buffer.rs`) to a single buffer gated by whether recognition has
//! activated yet. The ring buffer crate itself (`ringbuf`) is carried over
//! unchanged from the teacher's dependency stack.

use ringbuf::HeapRb;

use crate::recognition::VadRecogActivation;

/// Caller-audio buffer for the current turn, used while VAD-gated
/// recognition has not yet activated. Flushed into the inference session
/// once activation occurs (spec §4.5: "the local VAD audio buffer is
/// flushed into the newly opened inference session before any new packets
/// are forwarded").
pub struct VadAudioBuffer {
    ring: HeapRb<u8>,
}

const VAD_BUFFER_CAPACITY_BYTES: usize = 64 * 1024;

impl VadAudioBuffer {
    pub fn new() -> Self {
        Self {
            ring: HeapRb::new(VAD_BUFFER_CAPACITY_BYTES),
        }
    }

    /// Pushes `audio` onto the buffer, dropping the oldest bytes first if
    /// there isn't enough free space (a 30-second-scale buffer should never
    /// realistically fill for a single turn, but this keeps `push` total).
    pub fn push(&mut self, audio: &[u8]) {
        let (mut producer, consumer) = self.ring.split_ref();
        let needed = audio.len().saturating_sub(producer.free_len());
        if needed > 0 {
            consumer.pop_iter().take(needed).for_each(drop);
        }
        let _ = producer.push_slice(audio);
    }

    /// Drains and returns every buffered byte, in arrival order, leaving
    /// the buffer empty. Spec §8: "on flush, restores order."
    pub fn flush(&mut self) -> Vec<u8> {
        let (_, consumer) = self.ring.split_ref();
        consumer.pop_iter().collect()
    }

    pub fn is_empty(&self) -> bool {
        let (_, consumer) = self.ring.split_ref();
        consumer.is_empty()
    }

    pub fn clear(&mut self) {
        let _ = self.flush();
    }
}

impl Default for VadAudioBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether the call is currently in its greeting/prompt playback phase,
/// which changes how a talk-started event is interpreted under
/// `AfterPrompt`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptPhase {
    Playing,
    Finished,
}

/// What the orchestrator should do in response to a talk-detect event.
#[derive(Debug, PartialEq)]
pub enum VadDecision {
    /// Stop the current playback (barge-in) but do not activate yet.
    StopPlaybackOnly,
    /// Activate the inference session immediately, flushing the buffer
    /// first.
    ActivateAndFlush,
    /// Remember that speech was seen during the initial-silence-delay
    /// window; no immediate action.
    RememberSpeechDuringDelay,
    /// Nothing to do.
    NoOp,
}

/// `vadMode` sub-mode: speech observed during the initial-silence-delay
/// window is remembered but does not activate until the delay completes.
pub fn on_talk_started_vad_mode(delay_still_running: bool) -> VadDecision {
    if delay_still_running {
        VadDecision::RememberSpeechDuringDelay
    } else {
        VadDecision::ActivateAndFlush
    }
}

/// Called when the initial-silence-delay timer completes, in `vadMode`.
pub fn on_initial_silence_delay_complete(speech_was_seen: bool) -> VadDecision {
    if speech_was_seen {
        VadDecision::ActivateAndFlush
    } else {
        // orchestrator arms the post-prompt max-wait timer
        VadDecision::NoOp
    }
}

/// `afterPrompt` sub-mode: talk-started while a prompt plays is barge-in;
/// once the prompt has finished, talk-started activates immediately.
pub fn on_talk_started_after_prompt(phase: PromptPhase) -> VadDecision {
    match phase {
        PromptPhase::Playing => VadDecision::StopPlaybackOnly,
        PromptPhase::Finished => VadDecision::ActivateAndFlush,
    }
}

/// Dispatches a talk-started event under the configured sub-mode.
pub fn on_talk_started(
    sub_mode: VadRecogActivation,
    phase: PromptPhase,
    delay_still_running: bool,
) -> VadDecision {
    match sub_mode {
        VadRecogActivation::VadMode => on_talk_started_vad_mode(delay_still_running),
        VadRecogActivation::AfterPrompt => on_talk_started_after_prompt(phase),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_flush_restores_arrival_order() {
        let mut buf = VadAudioBuffer::new();
        buf.push(&[1, 2, 3]);
        buf.push(&[4, 5]);
        assert_eq!(buf.flush(), vec![1, 2, 3, 4, 5]);
        assert!(buf.is_empty());
    }

    #[test]
    fn after_prompt_barge_in_stops_playback_without_activating() {
        let decision = on_talk_started_after_prompt(PromptPhase::Playing);
        assert_eq!(decision, VadDecision::StopPlaybackOnly);
    }

    #[test]
    fn after_prompt_activates_once_prompt_has_finished() {
        let decision = on_talk_started_after_prompt(PromptPhase::Finished);
        assert_eq!(decision, VadDecision::ActivateAndFlush);
    }

    #[test]
    fn vad_mode_remembers_speech_during_delay_window() {
        let decision = on_talk_started_vad_mode(true);
        assert_eq!(decision, VadDecision::RememberSpeechDuringDelay);
    }

    #[test]
    fn vad_mode_activates_on_delay_complete_if_speech_seen() {
        assert_eq!(
            on_initial_silence_delay_complete(true),
            VadDecision::ActivateAndFlush
        );
        assert_eq!(
            on_initial_silence_delay_complete(false),
            VadDecision::NoOp
        );
    }
}

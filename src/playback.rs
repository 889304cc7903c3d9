//! TTS playback queue (spec §4.2).
//!
//! An ordered sequence of media references; at most one playback is
//! `playing` at a time. No dedupe, reorder, or coalescing. Chunks are
//! tagged with the response id that produced them; once `interrupt()` has
//! run, chunks belonging to the interrupted response are discarded even if
//! they arrive afterward — only chunks for the *current* response (set by
//! the orchestrator when it starts a fresh activation) are accepted.
//!
//! No direct teacher analogue exists (Discord voice has no prompt-playback
//! concept); grounded on the pack's streaming-TTS reference shape
//! (`other_examples/...pipeline-src-tts-streaming.rs`) of "enqueue chunk,
//! play in order, drain".

use std::collections::VecDeque;

use crate::ids::{PlaybackHandle, ResponseId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMedia {
    pub media_ref: String,
    pub response_id: Option<ResponseId>,
}

/// What the orchestrator should do as a result of a queue operation.
#[derive(Debug, PartialEq)]
pub enum PlaybackAction {
    /// Ask the PBX adapter to start playing this media reference.
    Start(String),
    /// Nothing to do right now (queue empty, or already playing).
    None,
}

pub struct PlaybackQueue {
    queue: VecDeque<QueuedMedia>,
    playing: bool,
    /// The response id the queue currently accepts chunks for. `None` means
    /// accept any (used for greeting/static media that isn't response-tagged).
    current_response: Option<ResponseId>,
    /// Whether the overall multi-chunk TTS response is still considered
    /// active (distinct from `playing`, which tracks only the current
    /// playback within that response).
    overall_response_active: bool,
}

impl PlaybackQueue {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            playing: false,
            current_response: None,
            overall_response_active: false,
        }
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn is_overall_response_active(&self) -> bool {
        self.overall_response_active
    }

    /// Sets the response id new chunks must match. Called by the
    /// orchestrator when a fresh inference activation begins.
    pub fn begin_response(&mut self, response_id: ResponseId) {
        self.current_response = Some(response_id);
        self.overall_response_active = true;
    }

    /// Enqueues `media_ref`. If tagged with a response id that doesn't
    /// match the queue's current response, the chunk is silently discarded
    /// (spec §4.2 tie-break rule). Returns the action the caller should
    /// take (start playback if nothing was already playing).
    pub fn enqueue(&mut self, media_ref: String, response_id: Option<ResponseId>) -> PlaybackAction {
        if let Some(ref rid) = response_id {
            if let Some(ref current) = self.current_response {
                if rid != current {
                    return PlaybackAction::None;
                }
            }
        }
        self.queue.push_back(QueuedMedia {
            media_ref: media_ref.clone(),
            response_id,
        });
        if !self.playing {
            self.playing = true;
            self.queue
                .front()
                .map(|m| PlaybackAction::Start(m.media_ref.clone()))
                .unwrap_or(PlaybackAction::None)
        } else {
            PlaybackAction::None
        }
    }

    /// Pops the head (the playback that just finished, successfully or not)
    /// and starts the next one if the queue is non-empty. Returns `(action,
    /// response_drained)` where `response_drained` is true when the queue
    /// emptied out and the orchestrator should be told the response has
    /// fully played.
    pub fn finished(&mut self, _handle: Option<PlaybackHandle>) -> (PlaybackAction, bool) {
        self.queue.pop_front();
        if let Some(next) = self.queue.front() {
            (PlaybackAction::Start(next.media_ref.clone()), false)
        } else {
            self.playing = false;
            (PlaybackAction::None, true)
        }
    }

    /// Stops current playback, empties the queue, and marks the overall
    /// response no longer active. The caller (orchestrator) is responsible
    /// for actually telling the PBX adapter to stop the current playback
    /// handle; this only updates queue-local bookkeeping.
    pub fn interrupt(&mut self) {
        self.queue.clear();
        self.playing = false;
        self.overall_response_active = false;
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl Default for PlaybackQueue {
    fn default() -> Self {
        Self::new()
    }
}

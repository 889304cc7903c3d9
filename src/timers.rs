//! Per-call named timer set (spec §4.3).
//!
//! Grounded on the teacher's `VoiceBufferForUser::on_stop_talking` comment
//! ("set timer to go off in 500ms, and if speaking is still false then
//! flush the buffer") — a single ad-hoc expiry. This generalizes that shape
//! into a registry of named one-shot timers shared by every call, each
//! publishing its expiry as a message rather than running inline (design
//! note §9), and each carrying a generation counter so a stale expiry that
//! raced a cancel-and-reset can be detected and dropped even if it was
//! already queued.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

/// The timer names enumerated in spec §4.3.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum TimerName {
    BargeInActivation,
    NoSpeechBegin,
    InitialStreamIdle,
    SpeechEndSilence,
    MaxRecognitionDuration,
    DtmfInterDigit,
    DtmfFinal,
    VadMaxWaitAfterPrompt,
    VadInitialSilenceDelay,
}

impl TimerName {
    pub fn as_str(self) -> &'static str {
        match self {
            TimerName::BargeInActivation => "barge-in-activation",
            TimerName::NoSpeechBegin => "no-speech-begin",
            TimerName::InitialStreamIdle => "initial-stream-idle",
            TimerName::SpeechEndSilence => "speech-end-silence",
            TimerName::MaxRecognitionDuration => "max-recognition-duration",
            TimerName::DtmfInterDigit => "dtmf-inter-digit",
            TimerName::DtmfFinal => "dtmf-final",
            TimerName::VadMaxWaitAfterPrompt => "vad-max-wait-after-prompt",
            TimerName::VadInitialSilenceDelay => "vad-initial-silence-delay",
        }
    }
}

/// Message posted back to the owning call task when a timer expires.
#[derive(Debug, Clone)]
pub struct TimerExpired {
    pub name: TimerName,
    pub generation: u64,
}

struct TimerEntry {
    handle: JoinHandle<()>,
    generation: u64,
}

/// A call's collection of named timers. Setting an already-running timer
/// cancels the prior instance first; all timers are cancelled on `cancel_all`
/// (invoked during cleanup).
pub struct TimerSet {
    entries: HashMap<TimerName, TimerEntry>,
    next_generation: u64,
}

impl TimerSet {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            next_generation: 0,
        }
    }

    /// Arms `name` for `duration`, cancelling any prior instance of the same
    /// name first. On expiry, posts a `TimerExpired` to `sink`. The
    /// receiving call task must re-check the cleanup flag and any state
    /// predicates the timer assumed when set, and must discard the message
    /// if its generation doesn't match `current_generation(name)` at the
    /// time of receipt (it won't, if `cancel` ran in between — but a
    /// message already sitting in the mailbox cannot be un-sent, hence the
    /// generation check).
    pub fn set(&mut self, name: TimerName, duration: Duration, sink: UnboundedSender<TimerExpired>) {
        self.cancel(name);
        let generation = self.next_generation;
        self.next_generation += 1;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let _ = sink.send(TimerExpired { name, generation });
        });
        self.entries.insert(name, TimerEntry { handle, generation });
    }

    /// Cancels `name` if running. Idempotent: cancelling an unset timer is a
    /// no-op.
    pub fn cancel(&mut self, name: TimerName) {
        if let Some(entry) = self.entries.remove(&name) {
            entry.handle.abort();
        }
    }

    /// Cancels every timer on this call. Called once during cleanup (spec
    /// §8: "every created timer is cancelled by cleanup").
    pub fn cancel_all(&mut self) {
        for (_, entry) in self.entries.drain() {
            entry.handle.abort();
        }
    }

    pub fn is_running(&self, name: TimerName) -> bool {
        self.entries.contains_key(&name)
    }

    /// Whether a received `TimerExpired` is still current (i.e. not a stale
    /// message from a timer that has since been reset or cancelled).
    pub fn is_current(&self, expired: &TimerExpired) -> bool {
        match self.entries.get(&expired.name) {
            Some(entry) => entry.generation == expired.generation,
            None => false,
        }
    }
}

impl Default for TimerSet {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TimerSet {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn timer_fires_and_is_current() {
        let mut timers = TimerSet::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        timers.set(TimerName::NoSpeechBegin, Duration::from_millis(5), tx);
        let expired = rx.recv().await.unwrap();
        assert!(timers.is_current(&expired));
    }

    #[tokio::test]
    async fn resetting_a_timer_invalidates_the_prior_generation() {
        let mut timers = TimerSet::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        timers.set(TimerName::DtmfInterDigit, Duration::from_millis(200), tx.clone());
        // simulate a stale expiry message from a prior generation arriving
        // after we've reset the timer
        let stale = TimerExpired {
            name: TimerName::DtmfInterDigit,
            generation: 0,
        };
        timers.set(TimerName::DtmfInterDigit, Duration::from_millis(5), tx);
        let _fresh = rx.recv().await.unwrap();
        assert!(!timers.is_current(&stale));
    }

    #[test]
    fn cancel_is_idempotent() {
        let mut timers = TimerSet::new();
        timers.cancel(TimerName::MaxRecognitionDuration);
        timers.cancel(TimerName::MaxRecognitionDuration);
        assert!(!timers.is_running(TimerName::MaxRecognitionDuration));
    }

    #[tokio::test]
    async fn cancel_all_clears_every_timer() {
        let mut timers = TimerSet::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        timers.set(TimerName::NoSpeechBegin, Duration::from_secs(10), tx.clone());
        timers.set(TimerName::MaxRecognitionDuration, Duration::from_secs(10), tx);
        timers.cancel_all();
        assert!(!timers.is_running(TimerName::NoSpeechBegin));
        assert!(!timers.is_running(TimerName::MaxRecognitionDuration));
    }
}

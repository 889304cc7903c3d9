//! DTMF collector (spec §4.4).
//!
//! Accumulates digits for the current turn, enforces inter-digit and final
//! timeouts, and detects the configured terminator or max-length condition.
//! First digit of a turn triggers DTMF-mode entry, which the orchestrator
//! uses to suppress recognition and clear pending audio buffers for the
//! remainder of the turn (spec §3 invariant).
//!
//! No direct teacher analogue (Discord voice has no DTMF concept);
//! structurally grounded on the same "accumulate-until-terminal-condition"
//! shape as the teacher's `VoiceBufferForUser` (flush-on-silence), applied
//! here to a digit buffer instead of an audio buffer.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinalizeCause {
    Terminator,
    MaxDigits,
    FinalTimeout,
}

impl FinalizeCause {
    pub fn reason_code(&self) -> &'static str {
        match self {
            FinalizeCause::Terminator => "DTMF_TERMINATOR_RECEIVED",
            FinalizeCause::MaxDigits => "DTMF_MAX_DIGITS_RECEIVED",
            FinalizeCause::FinalTimeout => "DTMF_FINAL_TIMEOUT",
        }
    }
}

#[derive(Debug, PartialEq)]
pub enum DigitOutcome {
    /// This digit was the first of the turn: the orchestrator must stop
    /// playbacks, cancel the inference stream, clear VAD buffers and
    /// recognition timers, and remove talk-detect, before this digit is
    /// appended.
    EnteredDtmfMode,
    /// Digit appended, no special transition.
    Appended,
    /// Digit appended and the buffer should be finalized for the given
    /// cause.
    Finalize(FinalizeCause),
}

pub struct DtmfCollector {
    buffer: String,
    max_digits: usize,
    terminator: char,
    in_dtmf_mode: bool,
    pending_mode_entry_finalize: Option<FinalizeCause>,
}

impl DtmfCollector {
    pub fn new(max_digits: usize, terminator: char) -> Self {
        Self {
            buffer: String::new(),
            max_digits,
            terminator,
            in_dtmf_mode: false,
            pending_mode_entry_finalize: None,
        }
    }

    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    pub fn is_in_dtmf_mode(&self) -> bool {
        self.in_dtmf_mode
    }

    /// Processes one received digit. Callers must check
    /// `Config::dtmf_enabled` before calling this (spec §4.4 step 1: "if
    /// DTMF recognition is disabled by configuration, ignore" — modeled as
    /// the orchestrator never invoking the collector at all in that case,
    /// rather than a flag threaded through every call). The terminator
    /// digit itself is never appended to `buffer`.
    pub fn on_digit(&mut self, digit: char) -> DigitOutcome {
        let entering_mode = !self.in_dtmf_mode;
        if entering_mode {
            self.in_dtmf_mode = true;
        }

        let finalize_cause = if digit == self.terminator {
            Some(FinalizeCause::Terminator)
        } else {
            self.buffer.push(digit);
            if self.buffer.len() >= self.max_digits {
                Some(FinalizeCause::MaxDigits)
            } else {
                None
            }
        };

        if entering_mode {
            // The first digit's own finalize condition (a 1-digit
            // terminator or max-digits=1) still applies; the orchestrator
            // is responsible for running the mode-entry side effects
            // first, then consulting `finalize_condition_after_mode_entry`
            // for it, rather than losing it here.
            self.pending_mode_entry_finalize = finalize_cause;
            return DigitOutcome::EnteredDtmfMode;
        }

        match finalize_cause {
            Some(cause) => DigitOutcome::Finalize(cause),
            None => DigitOutcome::Appended,
        }
    }

    /// Whether the digit that was just appended (the one causing
    /// `EnteredDtmfMode`) also satisfies a finalize condition. The
    /// orchestrator calls this right after handling `EnteredDtmfMode`'s
    /// side effects, before forwarding any further digits.
    pub fn finalize_condition_after_mode_entry(&self) -> Option<FinalizeCause> {
        self.pending_mode_entry_finalize.clone()
    }

    /// Called when the `dtmf-final` timer expires with no terminator seen.
    pub fn finalize_on_timeout(&self) -> FinalizeCause {
        FinalizeCause::FinalTimeout
    }
}

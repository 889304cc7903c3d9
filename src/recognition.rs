//! Recognition-activation mode scheduler (spec §4.5).
//!
//! Three modes govern when the inference session activates: `immediate`,
//! `fixed-delay(d)`, and `vad`. A first-interaction override may substitute
//! a different mode for the very first turn only.
//!
//! Grounded on the teacher's `PacketHandler::act` dispatch over
//! talk-started/talk-stopped-shaped events (`SpeakingUpdate`), generalized
//! from "per-SSRC buffering decision" to "per-call activation decision".

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Sub-mode for VAD recognition activation (spec §4.5).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum VadRecogActivation {
    /// Arm an initial-silence-delay timer; speech during the delay is
    /// remembered but does not activate until the delay completes.
    VadMode,
    /// While a prompt plays, talk-started is barge-in (stop playback, don't
    /// activate until playback completes).
    AfterPrompt,
}

impl VadRecogActivation {
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "aftprompt" | "after_prompt" | "afterprompt" => VadRecogActivation::AfterPrompt,
            _ => VadRecogActivation::VadMode,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum RecognitionActivationMode {
    Immediate,
    FixedDelay(Duration),
    Vad(VadRecogActivation),
}

impl RecognitionActivationMode {
    /// Parses the `RECOGNITION_ACTIVATION_MODE` /
    /// `FIRST_INTERACTION_RECOGNITION_MODE` environment values.
    ///
    /// Accepted forms: `immediate`, `fixed-delay:<seconds>`, `vad`,
    /// `vad:after-prompt`.
    pub fn parse(s: &str) -> Self {
        let lower = s.to_lowercase();
        if lower == "immediate" {
            return RecognitionActivationMode::Immediate;
        }
        if let Some(rest) = lower.strip_prefix("fixed-delay") {
            let secs = rest
                .trim_start_matches(':')
                .trim()
                .parse::<u64>()
                .unwrap_or(0);
            return RecognitionActivationMode::FixedDelay(Duration::from_secs(secs));
        }
        if lower.starts_with("vad") {
            let sub = lower.splitn(2, ':').nth(1).unwrap_or("vad-mode");
            return RecognitionActivationMode::Vad(VadRecogActivation::parse(sub));
        }
        RecognitionActivationMode::Immediate
    }
}

/// Decision returned by the scheduler: what the orchestrator should do next.
#[derive(Debug, PartialEq)]
pub enum ActivationDecision {
    /// Activate the inference session right now.
    ActivateNow,
    /// Arm a timer of the given duration; activate on expiry.
    ArmDelay(Duration),
    /// Request talk-detect and begin buffering; no timer needed yet.
    StartVadListening,
}

/// Pure decision function: given the mode and whether this is the very
/// first turn, what should happen at call-start / post-response?
pub fn decide_on_start(
    global_mode: RecognitionActivationMode,
    first_interaction_override: Option<RecognitionActivationMode>,
    is_first_interaction: bool,
) -> ActivationDecision {
    let mode = if is_first_interaction {
        first_interaction_override.unwrap_or(global_mode)
    } else {
        global_mode
    };
    match mode {
        RecognitionActivationMode::Immediate => ActivationDecision::ActivateNow,
        RecognitionActivationMode::FixedDelay(d) => {
            if d.is_zero() {
                ActivationDecision::ActivateNow
            } else {
                ActivationDecision::ArmDelay(d)
            }
        }
        RecognitionActivationMode::Vad(_) => ActivationDecision::StartVadListening,
    }
}

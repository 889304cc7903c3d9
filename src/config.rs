//! Process configuration.
//!
//! Loaded the way `mmogr-gglib`'s CLI crate does it: `dotenvy` first, then
//! environment variables, with a thin `clap` surface (as `discrivener`'s own
//! binary uses) for overriding bind addresses and the dotenv path at
//! process start. Agent-prompt authoring, greeting selection, and logger
//! formatting are configuration concerns per spec §1 and live here, not in
//! the orchestrator.

use std::env;
use std::time::Duration;

use clap::Parser;

use crate::recognition::RecognitionActivationMode;
use crate::tts::TtsPlaybackMode;

#[derive(Parser, Debug, Clone)]
#[command(name = "gatewayd", about = "Realtime Asterisk voice-bot gateway")]
pub struct Cli {
    /// Path to a .env file to load before reading the environment.
    #[arg(long, default_value = ".env")]
    pub dotenv: String,

    /// Bind address for the operator WebSocket front-end (`/logs`).
    #[arg(long, default_value = "0.0.0.0:8090")]
    pub frontend_bind: String,

    /// Host IP advertised to the PBX for RTP media injection.
    #[arg(long)]
    pub rtp_host_ip: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub recognition_activation_mode: RecognitionActivationMode,
    pub first_interaction_recognition_mode: Option<RecognitionActivationMode>,
    pub barge_in_delay: Duration,
    pub no_speech_begin_timeout: Duration,
    pub initial_stream_idle_timeout: Duration,
    pub speech_end_silence_timeout: Duration,
    pub max_recognition_duration: Duration,
    pub vad_silence_threshold_ms: u32,
    pub vad_talk_threshold: f32,
    pub vad_initial_silence_delay: Duration,
    pub vad_max_wait_after_prompt: Duration,
    pub dtmf_enabled: bool,
    pub dtmf_inter_digit_timeout: Duration,
    pub dtmf_final_timeout: Duration,
    pub dtmf_max_digits: usize,
    pub dtmf_terminator_digit: char,
    pub tts_playback_mode: TtsPlaybackMode,
    pub rtp_host_ip: String,
    pub sounds_root: String,
    pub ari_base_url: String,
    pub ari_username: String,
    pub ari_password: String,
    pub ari_app_name: String,
    pub inference_ws_host: String,
    pub inference_model: String,
    pub inference_api_key: String,
    pub inference_instructions: String,
    pub inference_voice: String,
    pub inference_input_codec: String,
    pub inference_input_sample_rate: u32,
    pub inference_output_codec: String,
    pub inference_output_sample_rate: u32,
    pub greeting_media_ref: Option<String>,
    pub redis_url: Option<String>,
    pub conversation_log_ttl_seconds: u64,
    pub frontend_bind: String,
}

fn env_duration_secs(key: &str, default_secs: u64) -> Duration {
    Duration::from_secs(
        env::var(key)
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(default_secs),
    )
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from `.env` + environment, layering CLI
    /// overrides on top (per-process bind address / rtp host override).
    pub fn load(cli: &Cli) -> Self {
        let _ = dotenvy::from_path(&cli.dotenv);

        let recognition_activation_mode =
            RecognitionActivationMode::parse(&env_or("RECOGNITION_ACTIVATION_MODE", "immediate"));
        let first_interaction_recognition_mode = env::var("FIRST_INTERACTION_RECOGNITION_MODE")
            .ok()
            .map(|v| RecognitionActivationMode::parse(&v));

        Config {
            recognition_activation_mode,
            first_interaction_recognition_mode,
            barge_in_delay: env_duration_secs("BARGE_IN_DELAY_SECONDS", 0),
            no_speech_begin_timeout: env_duration_secs("NO_SPEECH_BEGIN_TIMEOUT_SECONDS", 10),
            initial_stream_idle_timeout: env_duration_secs("OPENAI_STREAM_IDLE_TIMEOUT_SECONDS", 15),
            speech_end_silence_timeout: env_duration_secs("SPEECH_END_SILENCE_TIMEOUT_SECONDS", 2),
            max_recognition_duration: env_duration_secs("MAX_RECOGNITION_DURATION_SECONDS", 30),
            vad_silence_threshold_ms: env::var("VAD_SILENCE_THRESHOLD_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(500),
            vad_talk_threshold: env::var("VAD_TALK_THRESHOLD")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.5),
            vad_initial_silence_delay: env_duration_secs("VAD_INITIAL_SILENCE_DELAY_SECONDS", 0),
            vad_max_wait_after_prompt: env_duration_secs("VAD_MAX_WAIT_AFTER_PROMPT_SECONDS", 5),
            dtmf_enabled: env_bool("DTMF_ENABLED", true),
            dtmf_inter_digit_timeout: env_duration_secs("DTMF_INTERDIGIT_TIMEOUT_SECONDS", 3),
            dtmf_final_timeout: env_duration_secs("DTMF_FINAL_TIMEOUT_SECONDS", 5),
            dtmf_max_digits: env::var("DTMF_MAX_DIGITS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(16),
            dtmf_terminator_digit: env_or("DTMF_TERMINATOR_DIGIT", "#")
                .chars()
                .next()
                .unwrap_or('#'),
            tts_playback_mode: TtsPlaybackMode::parse(&env_or(
                "OPENAI_TTS_PLAYBACK_MODE",
                "full-chunk",
            )),
            rtp_host_ip: cli
                .rtp_host_ip
                .clone()
                .unwrap_or_else(|| env_or("RTP_HOST_IP", "127.0.0.1")),
            sounds_root: env_or("SOUNDS_ROOT", "/var/lib/asterisk/sounds"),
            ari_base_url: env_or("ARI_BASE_URL", "http://127.0.0.1:8088/ari"),
            ari_username: env_or("ARI_USERNAME", "asterisk"),
            ari_password: env_or("ARI_PASSWORD", ""),
            ari_app_name: env_or("ARI_APP_NAME", "openai-realtime-gateway"),
            inference_ws_host: env_or("OPENAI_REALTIME_HOST", "api.openai.com"),
            inference_model: env_or("OPENAI_REALTIME_MODEL", "gpt-4o-realtime-preview"),
            inference_api_key: env_or("OPENAI_API_KEY", ""),
            inference_instructions: env_or("OPENAI_INSTRUCTIONS", "You are a helpful phone assistant."),
            inference_voice: env_or("OPENAI_VOICE", "alloy"),
            inference_input_codec: env_or("OPENAI_INPUT_AUDIO_FORMAT", "g711_ulaw"),
            inference_input_sample_rate: env::var("OPENAI_INPUT_AUDIO_SAMPLE_RATE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
            inference_output_codec: env_or("OPENAI_OUTPUT_AUDIO_FORMAT", "g711_ulaw"),
            inference_output_sample_rate: env::var("OPENAI_OUTPUT_AUDIO_SAMPLE_RATE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
            greeting_media_ref: env::var("GREETING_MEDIA_REF").ok(),
            redis_url: env::var("REDIS_URL").ok(),
            conversation_log_ttl_seconds: env::var("CONVERSATION_LOG_TTL_SECONDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(86_400),
            frontend_bind: cli.frontend_bind.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognition_mode_parses_fixed_delay() {
        let mode = RecognitionActivationMode::parse("fixed-delay:2");
        assert_eq!(
            mode,
            RecognitionActivationMode::FixedDelay(Duration::from_secs(2))
        );
    }

    #[test]
    fn env_bool_accepts_common_truthy_values() {
        env::set_var("GATEWAY_TEST_BOOL", "yes");
        assert!(env_bool("GATEWAY_TEST_BOOL", false));
        env::remove_var("GATEWAY_TEST_BOOL");
    }
}

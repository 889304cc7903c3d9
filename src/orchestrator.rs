//! Call orchestrator (spec §4.8).
//!
//! The state machine wiring RTP ingest, the inference session, VAD/barge-in,
//! DTMF collection, and the TTS playback pipeline together. One instance
//! owns exactly one `Call` for its entire lifetime and runs as the call's
//! logical task: every mutation to call state happens here, driven by
//! messages posted from independent adapter tasks (spec §5 "Scheduling
//! model").
//!
//! Grounded on the teacher's `Model`/`VoicePacketHandlerWrapper` composition
//! point (wiring the voice driver's events into the packet handler and then
//! into whisper) as the direct ancestor of "the orchestrator wires every
//! adapter together"; generalized into an explicit state machine per design
//! note §9 (handlers are methods on `CallOrchestrator`, not a singleton
//! event-handler/service pair).

use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::Utc;
use serde_json::json;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, warn};

use crate::call::{Call, CallState};
use crate::config::Config;
use crate::conversation_log::{Actor, ConversationEntry, ConversationLog};
use crate::dtmf::{DigitOutcome, FinalizeCause};
use crate::error::{GatewayError, Result};
use crate::frontend::{FrontendEvent, SessionUpdateFields};
use crate::ids::{CallId, ChannelId, PlaybackHandle, ResponseId};
use crate::inference::{self, InferenceCommand, InferenceEvent, SessionConfig};
use crate::pbx::{PbxControlAdapter, PbxEvent};
use crate::playback::PlaybackAction;
use crate::recognition::{self, ActivationDecision, RecognitionActivationMode, VadRecogActivation};
use crate::rtp::{RtpPayload, RtpReceiver};
use crate::timers::{TimerExpired, TimerName};
use crate::tools::ToolRegistry;
use crate::tts::{artifact_dir, artifact_filename, wrap_with_format_header, AudioCodec, FullChunkAccumulator, StreamArchiveBuffer, TtsPlaybackMode};
use crate::vad::{self, PromptPhase, VadDecision};
use std::sync::Arc;

/// Every message that can mutate a call's state. Adapters never touch the
/// `Call` directly (spec §3 Ownership); they post one of these instead.
pub enum CallMessage {
    Rtp(RtpPayload),
    Pbx(PbxEvent),
    Inference(InferenceEvent),
    Timer(TimerExpired),
    SessionUpdate(SessionUpdateFields),
    DescribeConfiguration(oneshot::Sender<serde_json::Value>),
    Shutdown,
}

fn spawn_forwarder<T: Send + 'static>(
    mut rx: mpsc::UnboundedReceiver<T>,
    self_tx: mpsc::UnboundedSender<CallMessage>,
    wrap: impl Fn(T) -> CallMessage + Send + 'static,
) {
    tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            if self_tx.send(wrap(item)).is_err() {
                break;
            }
        }
    });
}

pub struct CallOrchestrator {
    call: Call,
    config: Config,
    pbx: Arc<dyn PbxControlAdapter>,
    conversation_log: Arc<dyn ConversationLog>,
    tools: Arc<ToolRegistry>,
    frontend: broadcast::Sender<FrontendEvent>,
    self_tx: mpsc::UnboundedSender<CallMessage>,
    ended_tx: mpsc::UnboundedSender<CallId>,
    timer_tx: mpsc::UnboundedSender<TimerExpired>,
    inference_commands: Option<mpsc::UnboundedSender<InferenceCommand>>,
}

impl CallOrchestrator {
    pub fn new(
        call: Call,
        config: Config,
        pbx: Arc<dyn PbxControlAdapter>,
        conversation_log: Arc<dyn ConversationLog>,
        tools: Arc<ToolRegistry>,
        frontend: broadcast::Sender<FrontendEvent>,
        self_tx: mpsc::UnboundedSender<CallMessage>,
        ended_tx: mpsc::UnboundedSender<CallId>,
    ) -> Self {
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        spawn_forwarder(timer_rx, self_tx.clone(), CallMessage::Timer);
        Self {
            call,
            config,
            pbx,
            conversation_log,
            tools,
            frontend,
            self_tx,
            ended_tx,
            timer_tx,
            inference_commands: None,
        }
    }

    /// Runs the call to completion: setup, then the message loop, until
    /// cleanup fires or the mailbox closes. Breaking out of the loop as
    /// soon as cleanup starts is what guarantees spec §8's "after cleanup
    /// is triggered, no further state-mutating message is processed".
    pub async fn run(mut self, mut mailbox: mpsc::UnboundedReceiver<CallMessage>) {
        if let Err(err) = self.setup().await {
            warn!(call_id = %self.call.id, %err, "call setup failed");
            let reason = err.reason_code();
            self.cleanup(reason).await;
            return;
        }
        while let Some(message) = mailbox.recv().await {
            self.handle_message(message).await;
            if self.call.is_ending() {
                break;
            }
        }
    }

    fn setup_err(&self, detail: impl ToString) -> GatewayError {
        GatewayError::SetupFailure {
            call_id: self.call.id.clone(),
            detail: detail.to_string(),
        }
    }

    async fn setup(&mut self) -> Result<()> {
        self.pbx
            .answer(&self.call.media_channel)
            .await
            .map_err(|e| self.setup_err(e))?;

        let bridge = self
            .pbx
            .create_mixer_bridge()
            .await
            .map_err(|e| self.setup_err(e))?;
        self.pbx
            .add_to_bridge(&bridge, &self.call.media_channel)
            .await
            .map_err(|e| self.setup_err(e))?;
        self.call.bridges.push(bridge.clone());

        let (rtp_tx, rtp_rx) = mpsc::unbounded_channel();
        let receiver = RtpReceiver::bind(rtp_tx)
            .await
            .map_err(|e| self.setup_err(e))?;
        let port = receiver.local_port();
        self.call.rtp_receiver = Some(receiver);
        spawn_forwarder(rtp_rx, self.self_tx.clone(), CallMessage::Rtp);

        let injection = self
            .pbx
            .create_media_injection_channel(&self.config.rtp_host_ip, port, &self.config.inference_input_codec)
            .await
            .map_err(|e| self.setup_err(e))?;
        self.pbx
            .add_to_bridge(&bridge, &injection)
            .await
            .map_err(|e| self.setup_err(e))?;
        self.call.media_injection_channel = Some(injection);

        self.emit("call_answered", json!({}));
        self.emit("call_resources_initialized", json!({ "rtpPort": port }));

        let has_greeting = self.config.greeting_media_ref.is_some();
        self.call.state = if has_greeting { CallState::Greeting } else { CallState::Listening };
        if let Some(greeting) = self.config.greeting_media_ref.clone() {
            let action = self.call.playback.enqueue(greeting, None);
            self.apply_playback_action(action).await;
        }
        self.begin_recognition_cycle(true).await?;
        Ok(())
    }

    async fn handle_message(&mut self, message: CallMessage) {
        match message {
            CallMessage::Rtp(payload) => self.handle_rtp(payload).await,
            CallMessage::Pbx(event) => self.handle_pbx_event(event).await,
            CallMessage::Inference(event) => self.handle_inference_event(event).await,
            CallMessage::Timer(expired) => self.handle_timer_expired(expired).await,
            CallMessage::SessionUpdate(fields) => self.apply_session_update(fields),
            CallMessage::DescribeConfiguration(reply) => {
                let _ = reply.send(self.describe_configuration());
            }
            CallMessage::Shutdown => self.cleanup("GATEWAY_SHUTDOWN").await,
        }
    }

    // ---- recognition-activation ----------------------------------------

    fn effective_mode(&self, is_first_interaction: bool) -> RecognitionActivationMode {
        if is_first_interaction {
            self.config
                .first_interaction_recognition_mode
                .unwrap_or(self.config.recognition_activation_mode)
        } else {
            self.config.recognition_activation_mode
        }
    }

    async fn begin_recognition_cycle(&mut self, is_first_interaction: bool) -> Result<()> {
        let mode = self.effective_mode(is_first_interaction);
        self.call.current_recognition_mode = Some(mode);
        let decision = recognition::decide_on_start(
            self.config.recognition_activation_mode,
            self.config.first_interaction_recognition_mode,
            is_first_interaction,
        );
        match decision {
            ActivationDecision::ActivateNow => {
                self.activate_inference_session().await?;
            }
            ActivationDecision::ArmDelay(d) => {
                self.call
                    .timers
                    .set(TimerName::BargeInActivation, d, self.timer_tx.clone());
            }
            ActivationDecision::StartVadListening => {
                self.pbx
                    .set_talk_detect(
                        &self.call.media_channel,
                        self.config.vad_talk_threshold,
                        self.config.vad_silence_threshold_ms,
                    )
                    .await
                    .map_err(|e| GatewayError::TalkDetectSetupFailed {
                        call_id: self.call.id.clone(),
                        detail: e.to_string(),
                    })?;
                if let RecognitionActivationMode::Vad(VadRecogActivation::VadMode) = mode {
                    self.call.timers.set(
                        TimerName::VadInitialSilenceDelay,
                        self.config.vad_initial_silence_delay,
                        self.timer_tx.clone(),
                    );
                }
            }
        }
        Ok(())
    }

    async fn begin_recognition_cycle_or_cleanup(&mut self, is_first_interaction: bool) {
        if let Err(err) = self.begin_recognition_cycle(is_first_interaction).await {
            let reason = err.reason_code();
            self.cleanup(reason).await;
        }
    }

    async fn activate_inference_session(&mut self) -> Result<()> {
        if self.inference_commands.is_some() {
            // idempotent re-entry guard: at most one active session per
            // call (spec §3, §8); no special double-activation exception
            // is reproduced (DESIGN.md Open Questions decision).
            return Ok(());
        }

        let _ = self.pbx.remove_talk_detect(&self.call.media_channel).await;
        self.call.timers.cancel(TimerName::VadInitialSilenceDelay);
        self.call.timers.cancel(TimerName::VadMaxWaitAfterPrompt);
        self.call.timers.cancel(TimerName::BargeInActivation);
        self.call.vad_speech_seen_during_delay = false;

        let buffered = self.call.vad_buffer.flush();

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (evt_tx, evt_rx) = mpsc::unbounded_channel();
        spawn_forwarder(evt_rx, self.self_tx.clone(), CallMessage::Inference);

        let session_config = SessionConfig {
            instructions: self.config.inference_instructions.clone(),
            voice: self.config.inference_voice.clone(),
            model: self.config.inference_model.clone(),
            modalities: vec!["audio".to_string(), "text".to_string()],
            input_audio_format: self.config.inference_input_codec.clone(),
            input_audio_sample_rate: self.config.inference_input_sample_rate,
            output_audio_format: self.config.inference_output_codec.clone(),
            output_audio_sample_rate: self.config.inference_output_sample_rate,
            tools: Vec::new(),
        };
        let ws_url = inference::realtime_url(&self.config.inference_ws_host, &self.config.inference_model);
        let api_key = self.config.inference_api_key.clone();
        tokio::spawn(inference::run_session(ws_url, api_key, session_config, cmd_rx, evt_tx));

        if !buffered.is_empty() {
            let _ = cmd_tx.send(InferenceCommand::AppendAudio(buffered));
        }
        self.inference_commands = Some(cmd_tx);

        self.call
            .timers
            .set(TimerName::NoSpeechBegin, self.config.no_speech_begin_timeout, self.timer_tx.clone());
        self.call.timers.set(
            TimerName::MaxRecognitionDuration,
            self.config.max_recognition_duration,
            self.timer_tx.clone(),
        );
        self.call.timers.set(
            TimerName::InitialStreamIdle,
            self.config.initial_stream_idle_timeout,
            self.timer_tx.clone(),
        );
        self.emit("openai_stream_activated", json!({}));
        Ok(())
    }

    async fn stop_inference_session(&mut self, reason: &str) {
        if let Some(tx) = self.inference_commands.take() {
            let _ = tx.send(InferenceCommand::Stop(reason.to_string()));
        }
    }

    // ---- RTP --------------------------------------------------------------

    async fn handle_rtp(&mut self, payload: RtpPayload) {
        if self.call.is_ending() || self.call.dtmf.is_in_dtmf_mode() {
            return;
        }
        if let Some(tx) = &self.inference_commands {
            let _ = tx.send(InferenceCommand::AppendAudio(payload.bytes));
        } else if matches!(self.call.current_recognition_mode, Some(RecognitionActivationMode::Vad(_))) {
            self.call.vad_buffer.push(&payload.bytes);
        }
    }

    // ---- PBX events ---------------------------------------------------------

    async fn handle_pbx_event(&mut self, event: PbxEvent) {
        match event {
            PbxEvent::ChannelEnded { channel } => {
                if channel == self.call.media_channel {
                    self.cleanup("PBX_CHANNEL_END").await;
                }
            }
            PbxEvent::DtmfReceived { digit, .. } => self.handle_dtmf_digit(digit).await,
            PbxEvent::TalkStarted { .. } => self.handle_talk_started().await,
            PbxEvent::TalkFinished { .. } => self.handle_talk_finished().await,
            PbxEvent::PlaybackFinished { handle } => self.handle_playback_outcome(handle, true).await,
            PbxEvent::PlaybackFailed { handle } => self.handle_playback_outcome(handle, false).await,
            PbxEvent::ConnectionLost => self.cleanup("PBX_CONNECTION_LOST").await,
        }
    }

    async fn handle_talk_started(&mut self) {
        if self.call.is_ending() || self.call.dtmf.is_in_dtmf_mode() {
            return;
        }
        self.emit("vad_speech_detected_start", json!({}));
        if let Some(RecognitionActivationMode::Vad(sub_mode)) = self.call.current_recognition_mode {
            let phase = if self.call.playback.is_playing() {
                PromptPhase::Playing
            } else {
                PromptPhase::Finished
            };
            let delay_running = self.call.timers.is_running(TimerName::VadInitialSilenceDelay);
            match vad::on_talk_started(sub_mode, phase, delay_running) {
                VadDecision::StopPlaybackOnly => self.stop_all_playback().await,
                VadDecision::ActivateAndFlush => {
                    let _ = self.activate_inference_session().await;
                }
                VadDecision::RememberSpeechDuringDelay => self.call.vad_speech_seen_during_delay = true,
                VadDecision::NoOp => {}
            }
        }
    }

    async fn handle_talk_finished(&mut self) {
        if self.call.is_ending() {
            return;
        }
        self.emit("vad_speech_detected_end", json!({}));
    }

    // ---- DTMF ---------------------------------------------------------------

    async fn handle_dtmf_digit(&mut self, digit: char) {
        if !self.config.dtmf_enabled || self.call.is_ending() {
            return;
        }

        let outcome = self.call.dtmf.on_digit(digit);
        if matches!(outcome, DigitOutcome::EnteredDtmfMode) {
            self.stop_all_playback().await;
            self.stop_inference_session("dtmf_mode_entered").await;
            self.call.vad_buffer.clear();
            self.call.timers.cancel(TimerName::NoSpeechBegin);
            self.call.timers.cancel(TimerName::BargeInActivation);
            self.call.timers.cancel(TimerName::VadInitialSilenceDelay);
            self.call.timers.cancel(TimerName::VadMaxWaitAfterPrompt);
            self.call.timers.cancel(TimerName::MaxRecognitionDuration);
            self.call.timers.cancel(TimerName::InitialStreamIdle);
            let _ = self.pbx.remove_talk_detect(&self.call.media_channel).await;
            self.call.state = CallState::Dtmf;
            self.emit("dtmf_mode_activated", json!({}));
        }

        self.emit(
            "dtmf_received",
            json!({ "digit": digit.to_string(), "buffer": self.call.dtmf.buffer() }),
        );

        self.call
            .timers
            .set(TimerName::DtmfInterDigit, self.config.dtmf_inter_digit_timeout, self.timer_tx.clone());
        if !self.call.timers.is_running(TimerName::DtmfFinal) {
            self.call
                .timers
                .set(TimerName::DtmfFinal, self.config.dtmf_final_timeout, self.timer_tx.clone());
        }

        let finalize_cause = match outcome {
            DigitOutcome::EnteredDtmfMode => self.call.dtmf.finalize_condition_after_mode_entry(),
            DigitOutcome::Finalize(cause) => Some(cause),
            DigitOutcome::Appended => None,
        };
        if let Some(cause) = finalize_cause {
            self.finalize_dtmf(cause).await;
        }
    }

    async fn finalize_dtmf(&mut self, cause: FinalizeCause) {
        let buffer = self.call.dtmf.buffer().to_string();
        let _ = self
            .pbx
            .set_channel_var(&self.call.media_channel, "DTMF_RESULT", &buffer)
            .await;
        self.conversation_log
            .append(
                ConversationEntry {
                    timestamp: Utc::now(),
                    actor: Actor::Dtmf,
                    entry_type: "dtmf_result".into(),
                    content: buffer.clone(),
                    call_id: self.call.id.clone(),
                    tool_name: None,
                    original_turn_timestamp: None,
                },
                self.config.conversation_log_ttl_seconds,
            )
            .await;
        self.emit(
            "dtmf_input_finalized",
            json!({ "result": buffer, "cause": cause.reason_code() }),
        );
        self.cleanup(cause.reason_code()).await;
    }

    // ---- inference session events --------------------------------------------

    async fn handle_inference_event(&mut self, event: InferenceEvent) {
        if self.inference_commands.is_some() && !matches!(event, InferenceEvent::SessionEnded(_)) {
            // any traffic from an active session counts as activity; reset
            // the idle watchdog rather than letting it expire underneath it.
            self.call.timers.set(
                TimerName::InitialStreamIdle,
                self.config.initial_stream_idle_timeout,
                self.timer_tx.clone(),
            );
        }
        match event {
            InferenceEvent::SpeechStarted => {
                self.emit("openai_speech_started", json!({}));
                if self.call.state == CallState::Speaking
                    && (self.call.playback.is_playing() || !self.call.playback.is_empty())
                {
                    self.stop_all_playback().await;
                    self.call.current_response_id = None;
                    self.emit("tts_playback_interrupted", json!({}));
                }
            }
            InferenceEvent::InterimTranscript(text) => {
                self.emit("openai_interim_transcript", json!({ "text": text }));
                if self.call.state == CallState::Greeting && self.call.playback.is_playing() {
                    self.stop_all_playback().await;
                }
            }
            InferenceEvent::FinalTranscript(text) => {
                self.conversation_log
                    .append(
                        ConversationEntry {
                            timestamp: Utc::now(),
                            actor: Actor::Caller,
                            entry_type: "transcript".into(),
                            content: text.clone(),
                            call_id: self.call.id.clone(),
                            tool_name: None,
                            original_turn_timestamp: None,
                        },
                        self.config.conversation_log_ttl_seconds,
                    )
                    .await;
                self.emit("openai_final_transcript", json!({ "text": text }));
                self.call.timers.cancel(TimerName::NoSpeechBegin);
                self.call.state = CallState::Speaking;
            }
            InferenceEvent::AudioChunk { bytes, response_id } => {
                self.handle_audio_chunk(bytes, response_id).await;
            }
            InferenceEvent::AudioStreamEnd { response_id } => {
                self.handle_audio_stream_end(response_id).await;
            }
            InferenceEvent::ToolCall { id, name, arguments_json } => {
                self.handle_tool_call(id, name, arguments_json).await;
            }
            InferenceEvent::SessionError(detail) => {
                warn!(call_id = %self.call.id, %detail, "inference session error");
                self.conversation_log
                    .append(
                        ConversationEntry {
                            timestamp: Utc::now(),
                            actor: Actor::Error,
                            entry_type: "session_error".into(),
                            content: detail,
                            call_id: self.call.id.clone(),
                            tool_name: None,
                            original_turn_timestamp: None,
                        },
                        self.config.conversation_log_ttl_seconds,
                    )
                    .await;
                self.cleanup("OPENAI_STREAM_ERROR").await;
            }
            InferenceEvent::SessionEnded(reason) => {
                self.inference_commands = None;
                debug!(call_id = %self.call.id, %reason, "inference session ended");
            }
        }
    }

    fn begin_new_response(&mut self, response_id: ResponseId) {
        self.call.current_response_id = Some(response_id.clone());
        self.call.playback.begin_response(response_id.clone());
        self.call.full_chunk_accumulator = Some(FullChunkAccumulator::new(response_id.clone()));
        self.call.stream_archive = Some(StreamArchiveBuffer::new(response_id));
    }

    async fn handle_audio_chunk(&mut self, bytes: Vec<u8>, response_id: ResponseId) {
        if !self.call.playback.is_overall_response_active() || self.call.current_response_id.is_none() {
            self.begin_new_response(response_id.clone());
        } else if self.call.current_response_id.as_ref() != Some(&response_id) {
            return; // stale chunk from an interrupted response
        }
        self.call.state = CallState::Speaking;

        match self.config.tts_playback_mode {
            TtsPlaybackMode::Stream => {
                if let Some(archive) = self.call.stream_archive.as_mut() {
                    archive.append(&bytes);
                }
                if let Some(path) = self.write_chunk_artifact(&bytes, false).await {
                    self.call.artifacts.track(path.clone());
                    let media_ref = format!("sound:{}", path.display());
                    let action = self.call.playback.enqueue(media_ref, Some(response_id));
                    self.apply_playback_action(action).await;
                }
            }
            TtsPlaybackMode::FullChunk => {
                if let Some(acc) = self.call.full_chunk_accumulator.as_mut() {
                    acc.push(bytes);
                }
            }
        }
        self.emit("openai_tts_chunk_received_and_queued", json!({}));
    }

    async fn handle_audio_stream_end(&mut self, response_id: ResponseId) {
        if self.call.current_response_id.as_ref() != Some(&response_id) {
            return;
        }
        match self.config.tts_playback_mode {
            TtsPlaybackMode::FullChunk => {
                if let Some(acc) = self.call.full_chunk_accumulator.take() {
                    let codec = AudioCodec::parse(&self.config.inference_output_codec);
                    match acc.finish(codec, self.config.inference_output_sample_rate) {
                        Ok(bytes) => {
                            if let Some(path) = self.write_bytes_to_artifact(&bytes, false).await {
                                self.call.artifacts.track(path.clone());
                                let media_ref = format!("sound:{}", path.display());
                                self.conversation_log
                                    .append(
                                        ConversationEntry {
                                            timestamp: Utc::now(),
                                            actor: Actor::Bot,
                                            entry_type: "tts_prompt".into(),
                                            content: media_ref.clone(),
                                            call_id: self.call.id.clone(),
                                            tool_name: None,
                                            original_turn_timestamp: None,
                                        },
                                        self.config.conversation_log_ttl_seconds,
                                    )
                                    .await;
                                let action = self.call.playback.enqueue(media_ref, Some(response_id));
                                self.apply_playback_action(action).await;
                            }
                        }
                        Err(err) => warn!(call_id = %self.call.id, %err, "failed to finish full-chunk tts artifact"),
                    }
                }
            }
            TtsPlaybackMode::Stream => {
                if let Some(archive) = self.call.stream_archive.take() {
                    let bytes = archive.into_bytes();
                    if let Some(path) = self.write_bytes_to_artifact(&bytes, true).await {
                        self.call.artifacts.track(path);
                    }
                }
            }
        }
        self.emit("openai_tts_stream_ended", json!({}));
    }

    async fn handle_tool_call(&mut self, id: String, name: String, arguments_json: String) {
        if self.call.state == CallState::Listening {
            self.call.state = CallState::Speaking;
        }
        self.conversation_log
            .append(
                ConversationEntry {
                    timestamp: Utc::now(),
                    actor: Actor::ToolCall,
                    entry_type: "tool_call".into(),
                    content: arguments_json.clone(),
                    call_id: self.call.id.clone(),
                    tool_name: Some(name.clone()),
                    original_turn_timestamp: None,
                },
                self.config.conversation_log_ttl_seconds,
            )
            .await;

        let result = self.tools.invoke(&name, &arguments_json).await;
        let output_json = result.to_string();

        self.conversation_log
            .append(
                ConversationEntry {
                    timestamp: Utc::now(),
                    actor: Actor::ToolResponse,
                    entry_type: "tool_response".into(),
                    content: output_json.clone(),
                    call_id: self.call.id.clone(),
                    tool_name: Some(name),
                    original_turn_timestamp: None,
                },
                self.config.conversation_log_ttl_seconds,
            )
            .await;

        if let Some(tx) = &self.inference_commands {
            let _ = tx.send(InferenceCommand::SubmitToolResult { call_id: id, output_json });
        }
    }

    async fn write_chunk_artifact(&self, raw: &[u8], archival: bool) -> Option<PathBuf> {
        let codec = AudioCodec::parse(&self.config.inference_output_codec);
        match wrap_with_format_header(raw, codec, self.config.inference_output_sample_rate) {
            Ok(wrapped) => self.write_bytes_to_artifact(&wrapped, archival).await,
            Err(err) => {
                warn!(call_id = %self.call.id, %err, "failed to wrap tts chunk with format header");
                None
            }
        }
    }

    async fn write_bytes_to_artifact(&self, bytes: &[u8], archival: bool) -> Option<PathBuf> {
        let codec = AudioCodec::parse(&self.config.inference_output_codec);
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let filename = artifact_filename(&self.call.id, millis, codec);
        let dir = artifact_dir(&self.config.sounds_root, self.config.tts_playback_mode, archival);
        if let Err(err) = tokio::fs::create_dir_all(&dir).await {
            warn!(call_id = %self.call.id, %err, "failed to create tts artifact directory");
            return None;
        }
        let path = dir.join(filename);
        if let Err(err) = tokio::fs::write(&path, bytes).await {
            warn!(call_id = %self.call.id, %err, "failed to write tts artifact");
            return None;
        }
        Some(path)
    }

    // ---- playback -------------------------------------------------------------

    async fn apply_playback_action(&mut self, mut action: PlaybackAction) {
        loop {
            match action {
                PlaybackAction::Start(media_ref) => match self.pbx.play(&self.call.media_channel, &media_ref).await {
                    Ok(handle) => {
                        self.call.current_playback_handle = Some(handle);
                        self.emit("playback_started", json!({ "media": media_ref }));
                        return;
                    }
                    Err(err) => {
                        warn!(call_id = %self.call.id, %err, media = %media_ref, "playback failed to start");
                        self.emit(
                            "playback_failed_to_start",
                            json!({ "media": media_ref, "error": err.to_string() }),
                        );
                        let (next_action, drained) = self.call.playback.finished(None);
                        if drained {
                            self.call.current_response_id = None;
                            return;
                        }
                        action = next_action;
                        continue;
                    }
                },
                PlaybackAction::None => return,
            }
        }
    }

    async fn stop_all_playback(&mut self) {
        if let Some(handle) = self.call.current_playback_handle.take() {
            let _ = self.pbx.stop_playback(&handle).await;
        }
        self.call.playback.interrupt();
    }

    async fn handle_playback_outcome(&mut self, handle: PlaybackHandle, _ok: bool) {
        if self.call.current_playback_handle.as_ref() != Some(&handle) {
            return; // stale handle: already superseded by an interrupt
        }
        self.call.current_playback_handle = None;
        let previous_state = self.call.state;
        let (action, drained) = self.call.playback.finished(Some(handle));
        if !drained {
            self.apply_playback_action(action).await;
            return;
        }
        self.call.current_response_id = None;
        match previous_state {
            CallState::Greeting => {
                self.call.state = CallState::Listening;
                if self.inference_commands.is_none() {
                    if let Some(RecognitionActivationMode::Vad(VadRecogActivation::AfterPrompt)) =
                        self.call.current_recognition_mode
                    {
                        let _ = self.activate_inference_session().await;
                    }
                }
            }
            CallState::Speaking => {
                self.call.state = CallState::Listening;
                self.call.mark_first_interaction_complete();
                self.begin_recognition_cycle_or_cleanup(false).await;
            }
            _ => {}
        }
    }

    // ---- timers -----------------------------------------------------------------

    async fn handle_timer_expired(&mut self, expired: TimerExpired) {
        if !self.call.timers.is_current(&expired) {
            return;
        }
        match expired.name {
            TimerName::BargeInActivation => {
                let _ = self.activate_inference_session().await;
            }
            TimerName::NoSpeechBegin => self.cleanup("NO_SPEECH_BEGIN_TIMEOUT").await,
            TimerName::InitialStreamIdle => self.cleanup("OPENAI_STREAM_IDLE_TIMEOUT").await,
            TimerName::SpeechEndSilence => {}
            TimerName::MaxRecognitionDuration => self.cleanup("MAX_RECOGNITION_DURATION_TIMEOUT").await,
            TimerName::DtmfInterDigit | TimerName::DtmfFinal => {
                if self.call.dtmf.is_in_dtmf_mode() {
                    let cause = self.call.dtmf.finalize_on_timeout();
                    self.finalize_dtmf(cause).await;
                }
            }
            TimerName::VadMaxWaitAfterPrompt => self.cleanup("VAD_MAX_WAIT_POST_PROMPT_TIMEOUT").await,
            TimerName::VadInitialSilenceDelay => {
                let speech_seen = self.call.vad_speech_seen_during_delay;
                match vad::on_initial_silence_delay_complete(speech_seen) {
                    VadDecision::ActivateAndFlush => {
                        let _ = self.activate_inference_session().await;
                    }
                    VadDecision::NoOp => {
                        self.call.timers.set(
                            TimerName::VadMaxWaitAfterPrompt,
                            self.config.vad_max_wait_after_prompt,
                            self.timer_tx.clone(),
                        );
                    }
                    _ => {}
                }
            }
        }
    }

    // ---- operator front-end -------------------------------------------------------

    fn apply_session_update(&mut self, fields: SessionUpdateFields) {
        if let Some(v) = fields.instructions {
            self.config.inference_instructions = v;
        }
        if let Some(v) = fields.tts_voice {
            self.config.inference_voice = v;
        }
        if let Some(v) = fields.model {
            self.config.inference_model = v;
        }
        if let Some(mode) = fields.recognition_activation_mode {
            self.config.recognition_activation_mode = RecognitionActivationMode::parse(&mode);
        }
        if let Some(secs) = fields.barge_in_delay_seconds {
            self.config.barge_in_delay = Duration::from_secs(secs);
        }
        if let Some(secs) = fields.vad_initial_silence_delay_seconds {
            self.config.vad_initial_silence_delay = Duration::from_secs(secs);
        }
        if let Some(secs) = fields.no_speech_begin_timeout_seconds {
            self.config.no_speech_begin_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = fields.speech_end_silence_timeout_seconds {
            self.config.speech_end_silence_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = fields.max_recognition_duration_seconds {
            self.config.max_recognition_duration = Duration::from_secs(secs);
        }
        if let Some(v) = fields.vad_silence_threshold_ms {
            self.config.vad_silence_threshold_ms = v;
        }
        if let Some(v) = fields.vad_talk_threshold {
            self.config.vad_talk_threshold = v;
        }
        if let Some(secs) = fields.vad_max_wait_after_prompt_seconds {
            self.config.vad_max_wait_after_prompt = Duration::from_secs(secs);
        }
        if let Some(v) = fields.enable_dtmf_recognition {
            self.config.dtmf_enabled = v;
        }
        if let Some(secs) = fields.dtmf_inter_digit_timeout_seconds {
            self.config.dtmf_inter_digit_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = fields.dtmf_final_timeout_seconds {
            self.config.dtmf_final_timeout = Duration::from_secs(secs);
        }
    }

    fn describe_configuration(&self) -> serde_json::Value {
        json!({
            "callId": self.call.id.as_str(),
            "state": format!("{:?}", self.call.state),
            "recognitionActivationMode": format!("{:?}", self.config.recognition_activation_mode),
            "instructions": self.config.inference_instructions,
            "ttsVoice": self.config.inference_voice,
            "dtmfEnabled": self.config.dtmf_enabled,
            "firstInteraction": self.call.flags.first_interaction,
        })
    }

    fn emit(&self, event_type: &str, payload: serde_json::Value) {
        let event = FrontendEvent::new(event_type, Some(self.call.id.clone()), "orchestrator", payload);
        let _ = self.frontend.send(event);
    }

    // ---- cleanup -----------------------------------------------------------------

    async fn cleanup(&mut self, reason: &'static str) {
        if !self.call.mark_cleanup_started() {
            return; // idempotent: re-entry is a no-op (spec §3, §5, §8)
        }
        self.emit("call_cleanup_started", json!({ "reason": reason }));

        self.stop_inference_session(reason).await;
        if let Some(handle) = self.call.current_playback_handle.take() {
            let _ = self.pbx.stop_playback(&handle).await;
        }
        self.call.playback.interrupt();
        self.call.timers.cancel_all();
        let _ = self.pbx.remove_talk_detect(&self.call.media_channel).await;

        if let Some(mut receiver) = self.call.rtp_receiver.take() {
            receiver.stop();
        }

        self.call.artifacts.delete_all().await;

        let _ = self.pbx.continue_in_dialplan(&self.call.media_channel).await;

        self.emit("call_cleanup_completed", json!({ "reason": reason }));
        let _ = self.ended_tx.send(self.call.id.clone());
    }
}

//! Integration tests exercising the end-to-end scenarios named in the
//! orchestrator's scenario table against in-memory fakes of the PBX and
//! inference adapters (no real Asterisk or realtime-model endpoint
//! involved). Colocated as a `tests/` suite rather than `#[cfg(test)]`
//! modules because these drive the orchestrator through its public
//! `CallMessage` mailbox rather than calling private methods directly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use gateway::call::Call;
use gateway::conversation_log::InMemoryConversationLog;
use gateway::error::Result;
use gateway::ids::{BridgeId, CallId, ChannelId, PlaybackHandle};
use gateway::inference::InferenceEvent;
use gateway::orchestrator::{CallMessage, CallOrchestrator};
use gateway::pbx::{PbxControlAdapter, PbxEvent, SpyDirection};
use gateway::recognition::RecognitionActivationMode;
use gateway::tools::ToolRegistry;
use gateway::tts::TtsPlaybackMode;
use tokio::sync::{broadcast, mpsc};

struct FakePbx {
    next_id: AtomicU64,
    played: Mutex<Vec<String>>,
    stopped_handles: Mutex<Vec<String>>,
    continued_in_dialplan: Mutex<bool>,
    channel_vars: Mutex<HashMap<(String, String), String>>,
}

impl FakePbx {
    fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            played: Mutex::new(Vec::new()),
            stopped_handles: Mutex::new(Vec::new()),
            continued_in_dialplan: Mutex::new(false),
            channel_vars: Mutex::new(HashMap::new()),
        }
    }

    fn next(&self) -> String {
        format!("id-{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

#[async_trait]
impl PbxControlAdapter for FakePbx {
    async fn answer(&self, _channel: &ChannelId) -> Result<()> {
        Ok(())
    }
    async fn create_mixer_bridge(&self) -> Result<BridgeId> {
        Ok(BridgeId(self.next()))
    }
    async fn add_to_bridge(&self, _bridge: &BridgeId, _channel: &ChannelId) -> Result<()> {
        Ok(())
    }
    async fn create_media_injection_channel(&self, _host: &str, _port: u16, _codec: &str) -> Result<ChannelId> {
        Ok(ChannelId(self.next()))
    }
    async fn create_listener_channel(&self, _source: &ChannelId, _spy: SpyDirection) -> Result<ChannelId> {
        Ok(ChannelId(self.next()))
    }
    async fn play(&self, _channel: &ChannelId, media_ref: &str) -> Result<PlaybackHandle> {
        self.played.lock().unwrap().push(media_ref.to_string());
        Ok(PlaybackHandle(self.next()))
    }
    async fn stop_playback(&self, handle: &PlaybackHandle) -> Result<()> {
        self.stopped_handles.lock().unwrap().push(handle.as_str().to_string());
        Ok(())
    }
    async fn set_channel_var(&self, channel: &ChannelId, name: &str, value: &str) -> Result<()> {
        self.channel_vars
            .lock()
            .unwrap()
            .insert((channel.as_str().to_string(), name.to_string()), value.to_string());
        Ok(())
    }
    async fn set_talk_detect(&self, _channel: &ChannelId, _energy: f32, _silence_ms: u32) -> Result<()> {
        Ok(())
    }
    async fn remove_talk_detect(&self, _channel: &ChannelId) -> Result<()> {
        Ok(())
    }
    async fn continue_in_dialplan(&self, _channel: &ChannelId) -> Result<()> {
        *self.continued_in_dialplan.lock().unwrap() = true;
        Ok(())
    }
}

fn base_config(mode: RecognitionActivationMode) -> gateway::config::Config {
    gateway::config::Config {
        recognition_activation_mode: mode,
        first_interaction_recognition_mode: None,
        barge_in_delay: Duration::from_secs(0),
        no_speech_begin_timeout: Duration::from_secs(30),
        initial_stream_idle_timeout: Duration::from_secs(30),
        speech_end_silence_timeout: Duration::from_secs(2),
        max_recognition_duration: Duration::from_secs(30),
        vad_silence_threshold_ms: 500,
        vad_talk_threshold: 0.5,
        vad_initial_silence_delay: Duration::from_secs(0),
        vad_max_wait_after_prompt: Duration::from_secs(5),
        dtmf_enabled: true,
        dtmf_inter_digit_timeout: Duration::from_secs(3),
        dtmf_final_timeout: Duration::from_secs(5),
        dtmf_max_digits: 16,
        dtmf_terminator_digit: '#',
        tts_playback_mode: TtsPlaybackMode::FullChunk,
        rtp_host_ip: "127.0.0.1".to_string(),
        sounds_root: std::env::temp_dir().to_string_lossy().to_string(),
        ari_base_url: "http://127.0.0.1:8088/ari".to_string(),
        ari_username: "asterisk".to_string(),
        ari_password: "".to_string(),
        ari_app_name: "test-app".to_string(),
        inference_ws_host: "127.0.0.1:9".to_string(),
        inference_model: "test-model".to_string(),
        inference_api_key: "".to_string(),
        inference_instructions: "be terse".to_string(),
        inference_voice: "alloy".to_string(),
        inference_input_codec: "ulaw".to_string(),
        inference_input_sample_rate: 8000,
        inference_output_codec: "ulaw".to_string(),
        inference_output_sample_rate: 8000,
        greeting_media_ref: None,
        redis_url: None,
        conversation_log_ttl_seconds: 3600,
        frontend_bind: "0.0.0.0:0".to_string(),
    }
}

struct Harness {
    self_tx: mpsc::UnboundedSender<CallMessage>,
    ended_rx: mpsc::UnboundedReceiver<CallId>,
    frontend_rx: broadcast::Receiver<gateway::frontend::FrontendEvent>,
    pbx: Arc<FakePbx>,
}

fn spawn_call(config: gateway::config::Config) -> Harness {
    let pbx = Arc::new(FakePbx::new());
    let log: Arc<dyn gateway::conversation_log::ConversationLog> = Arc::new(InMemoryConversationLog::new());
    let tools = Arc::new(ToolRegistry::new());
    let (frontend_tx, frontend_rx) = broadcast::channel(64);
    let (self_tx, mailbox) = mpsc::unbounded_channel();
    let (ended_tx, ended_rx) = mpsc::unbounded_channel();

    let call = Call::new(CallId::from("C1"), ChannelId::from("chan-1"), 16, '#');
    let orchestrator = CallOrchestrator::new(
        call,
        config,
        pbx.clone(),
        log.clone(),
        tools,
        frontend_tx,
        self_tx.clone(),
        ended_tx,
    );
    tokio::spawn(orchestrator.run(mailbox));

    Harness { self_tx, ended_rx, frontend_rx, pbx }
}

async fn drain_frontend(rx: &mut broadcast::Receiver<gateway::frontend::FrontendEvent>) -> Vec<String> {
    let mut seen = Vec::new();
    while let Ok(event) = rx.try_recv() {
        seen.push(event.event_type);
    }
    seen
}

/// Scenario 1: immediate-mode happy path. A final transcript arrives, the
/// model answers with three audio chunks and a stream-end; the one
/// resulting playback starts and finishes, and the call keeps running
/// until the PBX reports the channel has ended.
#[tokio::test]
async fn immediate_mode_happy_path_plays_one_response_and_keeps_the_call_alive() {
    let mut harness = spawn_call(base_config(RecognitionActivationMode::Immediate));

    harness
        .self_tx
        .send(CallMessage::Inference(InferenceEvent::FinalTranscript("hello".to_string())))
        .unwrap();

    let response_id = gateway::ids::ResponseId::new();
    for chunk in [b"aaaa".to_vec(), b"bbbb".to_vec(), b"cccc".to_vec()] {
        harness
            .self_tx
            .send(CallMessage::Inference(InferenceEvent::AudioChunk {
                bytes: chunk,
                response_id: response_id.clone(),
            }))
            .unwrap();
    }
    harness
        .self_tx
        .send(CallMessage::Inference(InferenceEvent::AudioStreamEnd {
            response_id: response_id.clone(),
        }))
        .unwrap();

    // give the orchestrator a chance to write the artifact and enqueue playback
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(harness.pbx.played.lock().unwrap().len(), 1);

    let events = drain_frontend(&mut harness.frontend_rx).await;
    assert!(events.contains(&"openai_final_transcript".to_string()));
    assert!(events.contains(&"playback_started".to_string()));

    // the call must not have ended on its own
    assert!(harness.ended_rx.try_recv().is_err());

    harness
        .self_tx
        .send(CallMessage::Pbx(PbxEvent::ChannelEnded {
            channel: ChannelId::from("chan-1"),
        }))
        .unwrap();
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    let ended = harness.ended_rx.recv().await.unwrap();
    assert_eq!(ended.as_str(), "C1");
    assert!(*harness.pbx.continued_in_dialplan.lock().unwrap());
}

/// Scenario 6: max-recognition timeout fires cleanup with the named reason
/// and returns the call to the dialplan, with no final transcript ever
/// received.
#[tokio::test]
async fn max_recognition_timeout_cleans_up_and_returns_to_dialplan() {
    let mut config = base_config(RecognitionActivationMode::Immediate);
    config.max_recognition_duration = Duration::from_millis(30);
    let mut harness = spawn_call(config);

    let ended = harness.ended_rx.recv().await.unwrap();
    assert_eq!(ended.as_str(), "C1");
    assert!(*harness.pbx.continued_in_dialplan.lock().unwrap());

    let events = drain_frontend(&mut harness.frontend_rx).await;
    assert!(events.iter().any(|e| e == "call_cleanup_completed"));
}

/// Scenario 5: stream-mode TTS cancellation by user speech. Three pending
/// chunk playbacks are queued; a `SpeechStarted` event arrives mid-response
/// and must stop the active playback and clear the rest of the queue.
#[tokio::test]
async fn speech_started_interrupts_an_in_progress_response() {
    let mut config = base_config(RecognitionActivationMode::Immediate);
    config.tts_playback_mode = TtsPlaybackMode::Stream;
    let mut harness = spawn_call(config);

    harness
        .self_tx
        .send(CallMessage::Inference(InferenceEvent::FinalTranscript("hi".to_string())))
        .unwrap();

    let response_id = gateway::ids::ResponseId::new();
    for chunk in [b"aaaa".to_vec(), b"bbbb".to_vec(), b"cccc".to_vec()] {
        harness
            .self_tx
            .send(CallMessage::Inference(InferenceEvent::AudioChunk {
                bytes: chunk,
                response_id: response_id.clone(),
            }))
            .unwrap();
    }
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    // first chunk's playback should already be underway
    assert_eq!(harness.pbx.played.lock().unwrap().len(), 1);

    harness
        .self_tx
        .send(CallMessage::Inference(InferenceEvent::SpeechStarted))
        .unwrap();
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }

    assert_eq!(harness.pbx.stopped_handles.lock().unwrap().len(), 1);
    let events = drain_frontend(&mut harness.frontend_rx).await;
    assert!(events.contains(&"tts_playback_interrupted".to_string()));
}

//! Composition root (spec §4, design note §9 "centralize in a `Gateway`").
//!
//! Owns every live call's mailbox, the `ChannelId -> CallId` reverse index
//! ARI events are routed through, and the operator front-end's shared
//! state. A "primary call" pointer exists purely so a `session.update`
//! with no `callId` has somewhere to go when only one call is active; it
//! is a UI convenience and never consulted by the orchestrator itself
//! (design note §9).
//!
//! Grounded on the teacher's top-level `Model`, which owns the one
//! `Channel`/`VoicePacketHandlerWrapper` pair for a guild voice session;
//! generalized here to a registry because this gateway juggers many
//! concurrent calls instead of one connection.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use crate::call::Call;
use crate::config::Config;
use crate::conversation_log::ConversationLog;
use crate::frontend::{FrontendEvent, FrontendState, OperatorCommand};
use crate::ids::{CallId, ChannelId};
use crate::orchestrator::{CallMessage, CallOrchestrator};
use crate::pbx::{PbxControlAdapter, RawAriEvent};
use crate::tools::ToolRegistry;

struct GatewayInner {
    config: Config,
    pbx: Arc<dyn PbxControlAdapter>,
    conversation_log: Arc<dyn ConversationLog>,
    tools: Arc<ToolRegistry>,
    frontend_events: broadcast::Sender<FrontendEvent>,
    active_calls: Arc<Mutex<Vec<CallId>>>,
    calls: Mutex<HashMap<CallId, mpsc::UnboundedSender<CallMessage>>>,
    channel_index: Mutex<HashMap<ChannelId, CallId>>,
    primary_call: Mutex<Option<CallId>>,
    ended_tx: mpsc::UnboundedSender<CallId>,
}

/// Owns every active call and the plumbing that feeds them: ARI events in,
/// operator commands in, front-end events out.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

impl Gateway {
    pub fn new(
        config: Config,
        pbx: Arc<dyn PbxControlAdapter>,
        conversation_log: Arc<dyn ConversationLog>,
        tools: Arc<ToolRegistry>,
    ) -> Self {
        let (frontend_events, _discard) = broadcast::channel(256);
        let (ended_tx, ended_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(GatewayInner {
            config,
            pbx,
            conversation_log,
            tools,
            frontend_events,
            active_calls: Arc::new(Mutex::new(Vec::new())),
            calls: Mutex::new(HashMap::new()),
            channel_index: Mutex::new(HashMap::new()),
            primary_call: Mutex::new(None),
            ended_tx,
        });
        tokio::spawn(reap_ended_calls(inner.clone(), ended_rx));
        Self { inner }
    }

    /// Builds the shared state the `/logs` WebSocket router needs, wiring
    /// a fresh operator-command channel and spawning its dispatch loop.
    pub fn frontend_state(&self) -> FrontendState {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatch_operator_commands(self.inner.clone(), commands_rx));
        FrontendState {
            events: self.inner.frontend_events.clone(),
            commands: commands_tx,
            active_calls: self.inner.active_calls.clone(),
        }
    }

    /// Routes one raw ARI event to the call it concerns. `StasisStart`
    /// spawns a new call instead of being forwarded to an existing one,
    /// since there is no mailbox yet for a channel that just arrived.
    pub async fn route_ari_event(&self, raw: RawAriEvent) {
        if let RawAriEvent::StasisStart { channel } = &raw {
            let channel_id = ChannelId(channel.id.clone());
            self.spawn_call(channel_id).await;
            return;
        }

        let channel_id = ari_event_channel(&raw);
        let Some(event) = raw.into_pbx_event() else { return };

        match channel_id {
            Some(channel_id) => {
                let call_id = {
                    let index = self.inner.channel_index.lock().unwrap();
                    index.get(&channel_id).cloned()
                };
                match call_id {
                    Some(call_id) => self.send_to_call(&call_id, CallMessage::Pbx(event)),
                    None => warn!(channel = %channel_id, "ARI event for unknown channel, dropping"),
                }
            }
            // No channel of its own (e.g. playback events): every active
            // call's own stale-handle check decides whether it applies.
            None => self.broadcast_pbx_event(event),
        }
    }

    /// Creates the call's mailbox, the `Call`/`CallOrchestrator` pair, and
    /// spawns the orchestrator's run loop as its own task. Registers the
    /// media channel in the reverse index immediately so events that race
    /// the orchestrator's own `setup()` (e.g. an early hangup) still route.
    async fn spawn_call(&self, media_channel: ChannelId) {
        let call_id = CallId::from(media_channel.as_str().to_string());
        let (self_tx, mailbox) = mpsc::unbounded_channel();

        {
            let mut calls = self.inner.calls.lock().unwrap();
            if calls.contains_key(&call_id) {
                return;
            }
            calls.insert(call_id.clone(), self_tx.clone());
        }
        self.inner
            .channel_index
            .lock()
            .unwrap()
            .insert(media_channel.clone(), call_id.clone());
        {
            let mut active = self.inner.active_calls.lock().unwrap();
            active.push(call_id.clone());
        }
        {
            let mut primary = self.inner.primary_call.lock().unwrap();
            if primary.is_none() {
                *primary = Some(call_id.clone());
            }
        }

        info!(call_id = %call_id, channel = %media_channel, "call starting");
        self.emit(
            "call_stasis_start",
            Some(call_id.clone()),
            serde_json::json!({ "channel": media_channel.as_str() }),
        );

        let call = Call::new(
            call_id.clone(),
            media_channel,
            self.inner.config.dtmf_max_digits,
            self.inner.config.dtmf_terminator_digit,
        );
        let orchestrator = CallOrchestrator::new(
            call,
            self.inner.config.clone(),
            self.inner.pbx.clone(),
            self.inner.conversation_log.clone(),
            self.inner.tools.clone(),
            self.inner.frontend_events.clone(),
            self_tx,
            self.inner.ended_tx.clone(),
        );
        tokio::spawn(orchestrator.run(mailbox));
    }

    fn send_to_call(&self, call_id: &CallId, message: CallMessage) {
        let calls = self.inner.calls.lock().unwrap();
        if let Some(tx) = calls.get(call_id) {
            let _ = tx.send(message);
        }
    }

    fn broadcast_pbx_event(&self, event: crate::pbx::PbxEvent) {
        let calls = self.inner.calls.lock().unwrap();
        for tx in calls.values() {
            let _ = tx.send(CallMessage::Pbx(event.clone()));
        }
    }

    /// Resolves an explicit `callId`, falling back to the primary call for
    /// operator commands issued with none (spec §6).
    fn resolve_call(&self, call_id: Option<CallId>) -> Option<CallId> {
        call_id.or_else(|| self.inner.primary_call.lock().unwrap().clone())
    }

    fn emit(&self, event_type: &str, call_id: Option<CallId>, payload: serde_json::Value) {
        let event = FrontendEvent::new(event_type, call_id, "gateway", payload);
        let _ = self.inner.frontend_events.send(event);
    }
}

/// Extracts the channel id an ARI event concerns, for reverse-index
/// lookups. `PlaybackFinished` has no channel of its own; its handle is
/// routed purely by the orchestrator's own stale-handle check once it
/// reaches the (only) call that could own it, so it is broadcast to every
/// active call instead of being dropped for lack of a channel id.
fn ari_event_channel(raw: &RawAriEvent) -> Option<ChannelId> {
    match raw {
        RawAriEvent::StasisStart { channel } => Some(ChannelId(channel.id.clone())),
        RawAriEvent::StasisEnd { channel } => Some(ChannelId(channel.id.clone())),
        RawAriEvent::ChannelDtmfReceived { channel, .. } => Some(ChannelId(channel.id.clone())),
        RawAriEvent::ChannelTalkingStarted { channel } => Some(ChannelId(channel.id.clone())),
        RawAriEvent::ChannelTalkingFinished { channel } => Some(ChannelId(channel.id.clone())),
        RawAriEvent::PlaybackFinished { .. } => None,
    }
}

async fn reap_ended_calls(inner: Arc<GatewayInner>, mut ended_rx: mpsc::UnboundedReceiver<CallId>) {
    while let Some(call_id) = ended_rx.recv().await {
        inner.calls.lock().unwrap().remove(&call_id);
        inner
            .channel_index
            .lock()
            .unwrap()
            .retain(|_channel, id| id != &call_id);
        inner.active_calls.lock().unwrap().retain(|id| id != &call_id);
        let mut primary = inner.primary_call.lock().unwrap();
        if primary.as_ref() == Some(&call_id) {
            *primary = None;
        }
        info!(call_id = %call_id, "call ended, removed from registry");
    }
}

async fn dispatch_operator_commands(
    inner: Arc<GatewayInner>,
    mut commands_rx: mpsc::UnboundedReceiver<OperatorCommand>,
) {
    while let Some(command) = commands_rx.recv().await {
        match command {
            OperatorCommand::SessionUpdate { call_id, session } => {
                let gateway = Gateway { inner: inner.clone() };
                let Some(call_id) = gateway.resolve_call(call_id) else {
                    warn!("session.update with no callId and no primary call active");
                    continue;
                };
                gateway.send_to_call(&call_id, CallMessage::SessionUpdate(session));
            }
            OperatorCommand::GetCallConfiguration { call_id, reply } => {
                let (describe_tx, describe_rx) = tokio::sync::oneshot::channel();
                let found = {
                    let calls = inner.calls.lock().unwrap();
                    calls.get(&call_id).cloned()
                };
                match found {
                    Some(tx) => {
                        if tx.send(CallMessage::DescribeConfiguration(describe_tx)).is_ok() {
                            let _ = reply.send(describe_rx.await.ok());
                        } else {
                            let _ = reply.send(None);
                        }
                    }
                    None => {
                        let _ = reply.send(None);
                    }
                }
            }
            OperatorCommand::GetConversationHistory { call_id, reply } => {
                let history = inner.conversation_log.history(&call_id).await;
                let _ = reply.send(history);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation_log::InMemoryConversationLog;
    use crate::error::Result;
    use crate::ids::{BridgeId, PlaybackHandle};
    use crate::pbx::{RawChannel, SpyDirection};
    use crate::recognition::RecognitionActivationMode;
    use crate::tts::TtsPlaybackMode;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    struct FakePbx {
        next_id: AtomicU64,
    }

    impl FakePbx {
        fn new() -> Self {
            Self { next_id: AtomicU64::new(0) }
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
        async fn play(&self, _channel: &ChannelId, _media_ref: &str) -> Result<PlaybackHandle> {
            Ok(PlaybackHandle(self.next()))
        }
        async fn stop_playback(&self, _handle: &PlaybackHandle) -> Result<()> {
            Ok(())
        }
        async fn set_channel_var(&self, _channel: &ChannelId, _name: &str, _value: &str) -> Result<()> {
            Ok(())
        }
        async fn set_talk_detect(&self, _channel: &ChannelId, _energy: f32, _silence_ms: u32) -> Result<()> {
            Ok(())
        }
        async fn remove_talk_detect(&self, _channel: &ChannelId) -> Result<()> {
            Ok(())
        }
        async fn continue_in_dialplan(&self, _channel: &ChannelId) -> Result<()> {
            Ok(())
        }
    }

    fn test_config() -> Config {
        Config {
            recognition_activation_mode: RecognitionActivationMode::Immediate,
            first_interaction_recognition_mode: None,
            barge_in_delay: Duration::from_secs(0),
            no_speech_begin_timeout: Duration::from_secs(30),
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

    fn test_gateway() -> Gateway {
        Gateway::new(
            test_config(),
            Arc::new(FakePbx::new()),
            Arc::new(InMemoryConversationLog::new()),
            Arc::new(ToolRegistry::new()),
        )
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition did not become true in time");
    }

    #[tokio::test]
    async fn stasis_start_registers_call_and_becomes_primary() {
        let gateway = test_gateway();
        gateway
            .route_ari_event(RawAriEvent::StasisStart {
                channel: RawChannel { id: "chan-1".into() },
            })
            .await;
        wait_until(|| gateway.inner.calls.lock().unwrap().contains_key(&CallId::from("chan-1"))).await;

        assert_eq!(
            gateway.inner.primary_call.lock().unwrap().as_ref().map(|c| c.as_str().to_string()),
            Some("chan-1".to_string())
        );
        assert!(gateway.inner.calls.lock().unwrap().contains_key(&CallId::from("chan-1")));
    }

    #[tokio::test]
    async fn duplicate_stasis_start_for_the_same_channel_is_ignored() {
        let gateway = test_gateway();
        let raw = || RawAriEvent::StasisStart {
            channel: RawChannel { id: "chan-1".into() },
        };
        gateway.route_ari_event(raw()).await;
        tokio::task::yield_now().await;
        gateway.route_ari_event(raw()).await;
        tokio::task::yield_now().await;

        assert_eq!(gateway.inner.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stasis_end_removes_the_call_from_the_registry() {
        let gateway = test_gateway();
        gateway
            .route_ari_event(RawAriEvent::StasisStart {
                channel: RawChannel { id: "chan-2".into() },
            })
            .await;
        tokio::task::yield_now().await;
        assert!(gateway.inner.calls.lock().unwrap().contains_key(&CallId::from("chan-2")));

        gateway
            .route_ari_event(RawAriEvent::StasisEnd {
                channel: RawChannel { id: "chan-2".into() },
            })
            .await;
        // let the orchestrator's cleanup path run and report back on ended_tx
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }

        assert!(!gateway.inner.calls.lock().unwrap().contains_key(&CallId::from("chan-2")));
        assert!(gateway.inner.active_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn event_for_unknown_channel_is_dropped_without_panicking() {
        let gateway = test_gateway();
        gateway
            .route_ari_event(RawAriEvent::ChannelTalkingStarted {
                channel: RawChannel { id: "ghost".into() },
            })
            .await;
    }
}

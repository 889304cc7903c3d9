//! Operator-facing WebSocket front-end (spec §4.10, §6 "Operator WebSocket").
//!
//! Every significant orchestrator transition is broadcast to connected
//! operator sockets as a standardized event envelope. Operators may push a
//! handful of commands back: a partial `session.update`, and read-only
//! queries for a call's current configuration or conversation history.
//!
//! Grounded on `Rapheal7-My-Agent/src/server/realtime_voice.rs`'s axum
//! `WebSocketUpgrade` handler (tagged JSON client/server messages,
//! `futures_util::StreamExt`/`SinkExt` split) as the direct structural
//! ancestor; fanout itself uses a `tokio::sync::broadcast` channel rather
//! than that file's single-connection loop, per design note §9's
//! "centralize in a `Gateway` with synchronized access".

use std::sync::{Arc, Mutex};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, warn};

use crate::conversation_log::ConversationEntry;
use crate::ids::CallId;

/// Standardized outbound event envelope (spec §6).
#[derive(Debug, Clone, Serialize)]
pub struct FrontendEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(rename = "callId")]
    pub call_id: Option<CallId>,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub payload: serde_json::Value,
    #[serde(rename = "logLevel", skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

impl FrontendEvent {
    pub fn new(
        event_type: &str,
        call_id: Option<CallId>,
        source: &str,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_type: event_type.to_string(),
            call_id,
            timestamp: Utc::now(),
            source: source.to_string(),
            payload,
            log_level: None,
        }
    }

    pub fn with_log_level(mut self, level: &str) -> Self {
        self.log_level = Some(level.to_string());
        self
    }
}

/// Partial per-call configuration an operator may push live (spec §6
/// `session.update` field list).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionUpdateFields {
    pub instructions: Option<String>,
    pub tts_voice: Option<String>,
    pub model: Option<String>,
    pub tools: Option<Vec<serde_json::Value>>,
    pub recognition_activation_mode: Option<String>,
    pub barge_in_delay_seconds: Option<u64>,
    pub vad_recog_activation: Option<String>,
    pub vad_initial_silence_delay_seconds: Option<u64>,
    pub no_speech_begin_timeout_seconds: Option<u64>,
    pub speech_end_silence_timeout_seconds: Option<u64>,
    pub max_recognition_duration_seconds: Option<u64>,
    pub vad_silence_threshold_ms: Option<u32>,
    pub vad_talk_threshold: Option<f32>,
    pub vad_max_wait_after_prompt_seconds: Option<u64>,
    pub enable_dtmf_recognition: Option<bool>,
    pub dtmf_inter_digit_timeout_seconds: Option<u64>,
    pub dtmf_final_timeout_seconds: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
enum RawOperatorInbound {
    #[serde(rename = "session.update")]
    SessionUpdate {
        #[serde(rename = "callId")]
        call_id: Option<String>,
        session: SessionUpdateFields,
    },
    GetCallConfiguration {
        #[serde(rename = "callId")]
        call_id: String,
    },
    GetConversationHistory {
        #[serde(rename = "callId")]
        call_id: String,
    },
}

/// Commands an operator connection may issue, handed off to the `Gateway`.
pub enum OperatorCommand {
    SessionUpdate {
        call_id: Option<CallId>,
        session: SessionUpdateFields,
    },
    GetCallConfiguration {
        call_id: CallId,
        reply: oneshot::Sender<Option<serde_json::Value>>,
    },
    GetConversationHistory {
        call_id: CallId,
        reply: oneshot::Sender<Vec<ConversationEntry>>,
    },
}

fn parse_operator_inbound(text: &str) -> Option<OperatorCommand> {
    let raw: RawOperatorInbound = serde_json::from_str(text).ok()?;
    Some(match raw {
        RawOperatorInbound::SessionUpdate { call_id, session } => OperatorCommand::SessionUpdate {
            call_id: call_id.map(CallId::from),
            session,
        },
        RawOperatorInbound::GetCallConfiguration { call_id } => {
            let (reply, _rx) = oneshot::channel();
            OperatorCommand::GetCallConfiguration {
                call_id: CallId::from(call_id),
                reply,
            }
        }
        RawOperatorInbound::GetConversationHistory { call_id } => {
            let (reply, _rx) = oneshot::channel();
            OperatorCommand::GetConversationHistory {
                call_id: CallId::from(call_id),
                reply,
            }
        }
    })
}

#[derive(Clone)]
pub struct FrontendState {
    pub events: broadcast::Sender<FrontendEvent>,
    pub commands: mpsc::UnboundedSender<OperatorCommand>,
    pub active_calls: Arc<Mutex<Vec<CallId>>>,
}

pub fn router(state: FrontendState) -> Router {
    Router::new().route("/logs", get(ws_handler)).with_state(state)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<FrontendState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: FrontendState) {
    let (mut sink, mut stream) = socket.split();
    let mut events_rx = state.events.subscribe();

    let snapshot = state.active_calls.lock().unwrap().clone();
    let initial = FrontendEvent::new(
        "active_calls_list",
        None,
        "gateway",
        serde_json::json!({ "callIds": snapshot }),
    );
    if let Ok(text) = serde_json::to_string(&initial) {
        let _ = sink.send(Message::Text(text)).await;
    }

    loop {
        tokio::select! {
            event = events_rx.recv() => {
                match event {
                    Ok(event) => {
                        if let Ok(text) = serde_json::to_string(&event) {
                            if sink.send(Message::Text(text)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "operator socket lagged, resuming from next event");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(command) = parse_operator_inbound(&text) {
                            dispatch_with_reply(command, &state, &mut sink).await;
                        } else {
                            debug!(%text, "ignoring malformed operator message");
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(%err, "operator socket error");
                        break;
                    }
                }
            }
        }
    }
}

/// Re-issues read queries with a fresh oneshot so the handler can await the
/// reply and write it straight back to this socket, instead of the
/// throwaway receiver `parse_operator_inbound` had to create to satisfy the
/// enum's shape.
async fn dispatch_with_reply(
    command: OperatorCommand,
    state: &FrontendState,
    sink: &mut futures_util::stream::SplitSink<WebSocket, Message>,
) {
    match command {
        OperatorCommand::SessionUpdate { call_id, session } => {
            let _ = state.commands.send(OperatorCommand::SessionUpdate { call_id, session });
        }
        OperatorCommand::GetCallConfiguration { call_id, .. } => {
            let (reply, rx) = oneshot::channel();
            let _ = state.commands.send(OperatorCommand::GetCallConfiguration {
                call_id: call_id.clone(),
                reply,
            });
            if let Ok(Some(config)) = rx.await {
                let event = FrontendEvent::new(
                    "call_configuration",
                    Some(call_id),
                    "gateway",
                    config,
                );
                if let Ok(text) = serde_json::to_string(&event) {
                    let _ = sink.send(Message::Text(text)).await;
                }
            }
        }
        OperatorCommand::GetConversationHistory { call_id, .. } => {
            let (reply, rx) = oneshot::channel();
            let _ = state.commands.send(OperatorCommand::GetConversationHistory {
                call_id: call_id.clone(),
                reply,
            });
            if let Ok(history) = rx.await {
                let event = FrontendEvent::new(
                    "conversation_history",
                    Some(call_id),
                    "gateway",
                    serde_json::json!({ "entries": history }),
                );
                if let Ok(text) = serde_json::to_string(&event) {
                    let _ = sink.send(Message::Text(text)).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frontend_event_serializes_with_camel_case_envelope_fields() {
        let event = FrontendEvent::new(
            "call_stasis_start",
            Some(CallId::from("C1")),
            "orchestrator",
            serde_json::json!({"channel": "chan-1"}),
        );
        let text = serde_json::to_string(&event).unwrap();
        assert!(text.contains("\"type\":\"call_stasis_start\""));
        assert!(text.contains("\"callId\":\"C1\""));
        assert!(!text.contains("logLevel"));
    }

    #[test]
    fn session_update_without_call_id_targets_primary_call() {
        let text = r#"{"type":"session.update","session":{"instructions":"be terse"}}"#;
        match parse_operator_inbound(text).unwrap() {
            OperatorCommand::SessionUpdate { call_id, session } => {
                assert!(call_id.is_none());
                assert_eq!(session.instructions.as_deref(), Some("be terse"));
            }
            _ => panic!("unexpected command variant"),
        }
    }

    #[test]
    fn get_conversation_history_parses_call_id() {
        let text = r#"{"type":"get_conversation_history","callId":"C1"}"#;
        match parse_operator_inbound(text).unwrap() {
            OperatorCommand::GetConversationHistory { call_id, .. } => {
                assert_eq!(call_id.as_str(), "C1");
            }
            _ => panic!("unexpected command variant"),
        }
    }

    #[test]
    fn malformed_inbound_is_rejected_not_a_panic() {
        assert!(parse_operator_inbound("{not json").is_none());
    }
}

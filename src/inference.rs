//! Inference session adapter (spec §4.6, §6 "Inference-session wire
//! format").
//!
//! Opens one outbound WebSocket per activation to the configured realtime
//! model endpoint, sends the session-configuration frame once the socket is
//! open, and normalizes inbound frames into `InferenceEvent`s for the
//! orchestrator.
//!
//! Grounded on the teacher's `whisper.rs` (`Whisper::load` /
//! `on_audio_complete` spawning a task that calls into a model and invokes
//! a callback with a structured result): the shape of "spawn a task, run
//! the model, report back via an event" is preserved, generalized from a
//! local Whisper call to a remote WebSocket round trip. The wire-level
//! framing style (tagged JSON client/server messages over
//! `tokio-tungstenite`) is grounded on the pack's
//! `Rapheal7-My-Agent/src/server/realtime_voice.rs` reference file.

use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, warn};

use crate::ids::ResponseId;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub instructions: String,
    pub voice: String,
    pub model: String,
    pub modalities: Vec<String>,
    pub input_audio_format: String,
    pub input_audio_sample_rate: u32,
    pub output_audio_format: String,
    pub output_audio_sample_rate: u32,
    pub tools: Vec<serde_json::Value>,
}

/// Events normalized from the inference session's inbound frames (spec
/// §4.6).
#[derive(Debug, Clone)]
pub enum InferenceEvent {
    SpeechStarted,
    InterimTranscript(String),
    FinalTranscript(String),
    AudioChunk { bytes: Vec<u8>, response_id: ResponseId },
    AudioStreamEnd { response_id: ResponseId },
    ToolCall { id: String, name: String, arguments_json: String },
    SessionError(String),
    SessionEnded(String),
}

/// Commands the orchestrator sends into an active session.
#[derive(Debug, Clone)]
pub enum InferenceCommand {
    AppendAudio(Vec<u8>),
    SubmitToolResult { call_id: String, output_json: String },
    Stop(String),
}

#[derive(Serialize)]
#[serde(tag = "type")]
enum OutboundFrame<'a> {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionUpdatePayload<'a> },
    #[serde(rename = "input_audio_buffer.append")]
    AppendAudio { audio: String },
    #[serde(rename = "conversation.item.create")]
    ItemCreate { item: ToolOutputItem<'a> },
    #[serde(rename = "response.create")]
    ResponseCreate,
}

#[derive(Serialize)]
struct SessionUpdatePayload<'a> {
    modalities: &'a [String],
    turn_detection: ServerVadPayload,
    voice: &'a str,
    input_audio_format: &'a str,
    input_audio_sample_rate: u32,
    output_audio_format: &'a str,
    output_audio_sample_rate: u32,
    instructions: &'a str,
    tools: &'a [serde_json::Value],
}

#[derive(Serialize)]
struct ServerVadPayload {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
struct ToolOutputItem<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    call_id: &'a str,
    output: &'a str,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
enum InboundFrame {
    #[serde(rename = "transcript")]
    Transcript { text: String, is_final: bool },
    #[serde(rename = "audio.delta")]
    AudioDelta { audio: String, response_id: String },
    #[serde(rename = "response.output_item.done")]
    OutputItemDone {
        #[serde(default)]
        function_call: Option<FunctionCall>,
        response_id: String,
    },
    #[serde(rename = "speech_started")]
    SpeechStarted,
    #[serde(rename = "response.audio.done")]
    AudioDone { response_id: String },
    #[serde(rename = "error")]
    Error { message: String },
}

#[derive(Deserialize)]
struct FunctionCall {
    call_id: String,
    name: String,
    arguments: String,
}

/// Connects to the realtime model endpoint and runs the adapter's
/// full-duplex loop until `commands` closes, the peer closes the socket, or
/// a transport error occurs — in every case exactly one `SessionEnded` or
/// trailing error event is emitted before the task exits (spec §4.6:
/// "the adapter must still surface a single `session-ended` event").
pub async fn run_session(
    ws_url: String,
    api_key: String,
    config: SessionConfig,
    mut commands: UnboundedReceiver<InferenceCommand>,
    events: UnboundedSender<InferenceEvent>,
) {
    let request = match build_request(&ws_url, &api_key) {
        Ok(r) => r,
        Err(err) => {
            let _ = events.send(InferenceEvent::SessionError(err.to_string()));
            let _ = events.send(InferenceEvent::SessionEnded("connect_failed".to_string()));
            return;
        }
    };

    let (ws_stream, _response) = match tokio_tungstenite::connect_async(request).await {
        Ok(pair) => pair,
        Err(err) => {
            let _ = events.send(InferenceEvent::SessionError(err.to_string()));
            let _ = events.send(InferenceEvent::SessionEnded("connect_failed".to_string()));
            return;
        }
    };

    let (mut write, mut read) = ws_stream.split();

    let session_frame = OutboundFrame::SessionUpdate {
        session: SessionUpdatePayload {
            modalities: &config.modalities,
            turn_detection: ServerVadPayload { kind: "server_vad" },
            voice: &config.voice,
            input_audio_format: &config.input_audio_format,
            input_audio_sample_rate: config.input_audio_sample_rate,
            output_audio_format: &config.output_audio_format,
            output_audio_sample_rate: config.output_audio_sample_rate,
            instructions: &config.instructions,
            tools: &config.tools,
        },
    };
    if let Err(err) = send_frame(&mut write, &session_frame).await {
        let _ = events.send(InferenceEvent::SessionError(err.to_string()));
        let _ = events.send(InferenceEvent::SessionEnded("send_failed".to_string()));
        return;
    }

    let mut stop_reason = "peer_closed".to_string();

    loop {
        tokio::select! {
            cmd = commands.recv() => {
                match cmd {
                    Some(InferenceCommand::AppendAudio(bytes)) => {
                        let frame = OutboundFrame::AppendAudio {
                            audio: base64::engine::general_purpose::STANDARD.encode(bytes),
                        };
                        if send_frame(&mut write, &frame).await.is_err() {
                            stop_reason = "send_failed".to_string();
                            break;
                        }
                    }
                    Some(InferenceCommand::SubmitToolResult { call_id, output_json }) => {
                        let item_frame = OutboundFrame::ItemCreate {
                            item: ToolOutputItem {
                                kind: "function_call_output",
                                call_id: &call_id,
                                output: &output_json,
                            },
                        };
                        if send_frame(&mut write, &item_frame).await.is_err() {
                            stop_reason = "send_failed".to_string();
                            break;
                        }
                        if send_frame(&mut write, &OutboundFrame::ResponseCreate).await.is_err() {
                            stop_reason = "send_failed".to_string();
                            break;
                        }
                    }
                    Some(InferenceCommand::Stop(reason)) => {
                        stop_reason = reason;
                        let _ = write.close().await;
                        break;
                    }
                    None => {
                        stop_reason = "orchestrator_dropped".to_string();
                        break;
                    }
                }
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_inbound_text(&text, &events);
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        stop_reason = "peer_closed".to_string();
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(%err, "inference session transport error");
                        let _ = events.send(InferenceEvent::SessionError(err.to_string()));
                        stop_reason = "transport_error".to_string();
                        break;
                    }
                }
            }
        }
    }

    let _ = events.send(InferenceEvent::SessionEnded(stop_reason));
}

fn handle_inbound_text(text: &str, events: &UnboundedSender<InferenceEvent>) {
    let frame: InboundFrame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(_) => return, // unrecognized frame kinds are ignored
    };
    let event = match frame {
        InboundFrame::Transcript { text, is_final } => {
            if is_final {
                InferenceEvent::FinalTranscript(text)
            } else {
                InferenceEvent::InterimTranscript(text)
            }
        }
        InboundFrame::AudioDelta { audio, response_id } => {
            match base64::engine::general_purpose::STANDARD.decode(audio) {
                Ok(bytes) => InferenceEvent::AudioChunk {
                    bytes,
                    response_id: ResponseId(response_id),
                },
                Err(err) => {
                    error!(%err, "failed to decode base64 audio delta");
                    return;
                }
            }
        }
        InboundFrame::OutputItemDone { function_call, response_id } => {
            if let Some(call) = function_call {
                InferenceEvent::ToolCall {
                    id: call.call_id,
                    name: call.name,
                    arguments_json: call.arguments,
                }
            } else {
                InferenceEvent::AudioStreamEnd {
                    response_id: ResponseId(response_id),
                }
            }
        }
        InboundFrame::AudioDone { response_id } => InferenceEvent::AudioStreamEnd {
            response_id: ResponseId(response_id),
        },
        InboundFrame::SpeechStarted => InferenceEvent::SpeechStarted,
        InboundFrame::Error { message } => InferenceEvent::SessionError(message),
    };
    let _ = events.send(event);
}

async fn send_frame<S>(
    write: &mut futures_util::stream::SplitSink<
        tokio_tungstenite::WebSocketStream<S>,
        Message,
    >,
    frame: &OutboundFrame<'_>,
) -> Result<(), tokio_tungstenite::tungstenite::Error>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let text = serde_json::to_string(frame).unwrap_or_else(|_| json!({}).to_string());
    write.send(Message::Text(text)).await
}

fn build_request(
    ws_url: &str,
    api_key: &str,
) -> Result<tokio_tungstenite::tungstenite::http::Request<()>, tokio_tungstenite::tungstenite::Error>
{
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    let mut request = ws_url.into_client_request()?;
    request.headers_mut().insert(
        "Authorization",
        format!("Bearer {api_key}").parse().map_err(|_| {
            tokio_tungstenite::tungstenite::Error::Url(
                tokio_tungstenite::tungstenite::error::UrlError::EmptyHostName,
            )
        })?,
    );
    Ok(request)
}

/// Builds the `wss://<host>/v1/realtime?model=<model-id>` endpoint URL
/// (spec §6).
pub fn realtime_url(host: &str, model: &str) -> String {
    format!("wss://{host}/v1/realtime?model={model}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn realtime_url_embeds_host_and_model() {
        let url = realtime_url("api.openai.com", "gpt-4o-realtime-preview");
        assert_eq!(
            url,
            "wss://api.openai.com/v1/realtime?model=gpt-4o-realtime-preview"
        );
    }

    #[test]
    fn transcript_frame_distinguishes_interim_and_final() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        handle_inbound_text(
            r#"{"type":"transcript","text":"hello","is_final":false}"#,
            &tx,
        );
        match rx.try_recv().unwrap() {
            InferenceEvent::InterimTranscript(t) => assert_eq!(t, "hello"),
            other => panic!("unexpected event: {other:?}"),
        }

        handle_inbound_text(
            r#"{"type":"transcript","text":"hello world","is_final":true}"#,
            &tx,
        );
        match rx.try_recv().unwrap() {
            InferenceEvent::FinalTranscript(t) => assert_eq!(t, "hello world"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn audio_delta_decodes_base64_and_tags_response_id() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let encoded = base64::engine::general_purpose::STANDARD.encode(b"pcm-bytes");
        let frame = format!(
            r#"{{"type":"audio.delta","audio":"{encoded}","response_id":"resp-1"}}"#
        );
        handle_inbound_text(&frame, &tx);
        match rx.try_recv().unwrap() {
            InferenceEvent::AudioChunk { bytes, response_id } => {
                assert_eq!(bytes, b"pcm-bytes");
                assert_eq!(response_id.0, "resp-1");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn output_item_done_without_function_call_is_audio_stream_end() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        handle_inbound_text(
            r#"{"type":"response.output_item.done","response_id":"resp-2"}"#,
            &tx,
        );
        match rx.try_recv().unwrap() {
            InferenceEvent::AudioStreamEnd { response_id } => {
                assert_eq!(response_id.0, "resp-2");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn output_item_done_with_function_call_is_tool_call() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        handle_inbound_text(
            r#"{"type":"response.output_item.done","response_id":"resp-3","function_call":{"call_id":"c1","name":"save_parameters","arguments":"{}"}}"#,
            &tx,
        );
        match rx.try_recv().unwrap() {
            InferenceEvent::ToolCall { id, name, .. } => {
                assert_eq!(id, "c1");
                assert_eq!(name, "save_parameters");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn unrecognized_frame_kind_is_ignored_not_fatal() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        handle_inbound_text(r#"{"type":"unknown_frame"}"#, &tx);
        assert!(rx.try_recv().is_err());
    }
}

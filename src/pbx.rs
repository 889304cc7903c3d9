//! PBX control adapter (spec §4.9).
//!
//! Translates orchestrator intents into Asterisk REST Interface (ARI) calls
//! and surfaces the PBX's own event stream back to the orchestrator. This
//! is the gateway's sole dependency on the PBX control library itself,
//! which spec §1 treats as an external collaborator with a named interface
//! only.
//!
//! No direct teacher analogue (Discord's voice gateway is a push socket,
//! not a REST+events split); grounded on `mmogr-gglib/crates/gglib-axum`'s
//! pattern of wrapping a REST surface behind an async trait at the
//! composition root.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc::UnboundedSender;
use tokio_stream::wrappers::IntervalStream;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};

use crate::error::{GatewayError, Result};
use crate::ids::{BridgeId, ChannelId, PlaybackHandle};

/// Events the PBX control adapter surfaces to the orchestrator (spec
/// §4.9).
#[derive(Debug, Clone)]
pub enum PbxEvent {
    ChannelEnded { channel: ChannelId },
    DtmfReceived { channel: ChannelId, digit: char },
    TalkStarted { channel: ChannelId },
    TalkFinished { channel: ChannelId },
    PlaybackFinished { handle: PlaybackHandle },
    PlaybackFailed { handle: PlaybackHandle },
    ConnectionLost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpyDirection {
    In,
    Out,
    Both,
}

impl SpyDirection {
    fn as_str(self) -> &'static str {
        match self {
            SpyDirection::In => "in",
            SpyDirection::Out => "out",
            SpyDirection::Both => "both",
        }
    }
}

/// Translates orchestrator intents into ARI calls. Implemented as an async
/// trait so tests can substitute an in-memory fake (spec §8's scenarios
/// exercise the orchestrator without a live PBX).
#[async_trait]
pub trait PbxControlAdapter: Send + Sync {
    async fn answer(&self, channel: &ChannelId) -> Result<()>;
    async fn create_mixer_bridge(&self) -> Result<BridgeId>;
    async fn add_to_bridge(&self, bridge: &BridgeId, channel: &ChannelId) -> Result<()>;
    async fn create_media_injection_channel(
        &self,
        host: &str,
        port: u16,
        codec: &str,
    ) -> Result<ChannelId>;
    async fn create_listener_channel(
        &self,
        source: &ChannelId,
        spy_direction: SpyDirection,
    ) -> Result<ChannelId>;
    async fn play(&self, channel: &ChannelId, media_ref: &str) -> Result<PlaybackHandle>;
    async fn stop_playback(&self, handle: &PlaybackHandle) -> Result<()>;
    async fn set_channel_var(&self, channel: &ChannelId, name: &str, value: &str) -> Result<()>;
    async fn set_talk_detect(&self, channel: &ChannelId, energy: f32, silence_ms: u32) -> Result<()>;
    async fn remove_talk_detect(&self, channel: &ChannelId) -> Result<()>;
    async fn continue_in_dialplan(&self, channel: &ChannelId) -> Result<()>;
}

/// `reqwest`-backed ARI client.
pub struct AriClient {
    base_url: String,
    app_name: String,
    client: reqwest::Client,
    auth: (String, String),
}

impl AriClient {
    pub fn new(base_url: String, app_name: String, username: String, password: String) -> Self {
        Self {
            base_url,
            app_name,
            client: reqwest::Client::new(),
            auth: (username, password),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Maps an "already gone" 404 during cleanup-time calls into success
    /// (spec §7 "PBX 'not found' on stop/destroy during cleanup: absorbed").
    async fn send_tolerating_not_found(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<()> {
        let response = builder
            .basic_auth(&self.auth.0, Some(&self.auth.1))
            .send()
            .await?;
        if response.status().as_u16() == 404 {
            return Ok(());
        }
        response.error_for_status().map(|_| ()).map_err(GatewayError::from)
    }

    async fn send_json<T: for<'de> Deserialize<'de>>(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<T> {
        let response = builder
            .basic_auth(&self.auth.0, Some(&self.auth.1))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json::<T>().await?)
    }
}

#[derive(Deserialize)]
struct BridgeResponse {
    id: String,
}

#[derive(Deserialize)]
struct ChannelResponse {
    id: String,
}

#[derive(Deserialize)]
struct PlaybackResponse {
    id: String,
}

#[async_trait]
impl PbxControlAdapter for AriClient {
    async fn answer(&self, channel: &ChannelId) -> Result<()> {
        let builder = self
            .client
            .post(self.url(&format!("/channels/{}/answer", channel.as_str())));
        self.send_tolerating_not_found(builder).await
    }

    async fn create_mixer_bridge(&self) -> Result<BridgeId> {
        let builder = self
            .client
            .post(self.url("/bridges"))
            .json(&json!({"type": "mixing"}));
        let resp: BridgeResponse = self.send_json(builder).await?;
        Ok(BridgeId(resp.id))
    }

    async fn add_to_bridge(&self, bridge: &BridgeId, channel: &ChannelId) -> Result<()> {
        let builder = self.client.post(self.url(&format!(
            "/bridges/{}/addChannel?channel={}",
            bridge.as_str(),
            channel.as_str()
        )));
        self.send_tolerating_not_found(builder).await
    }

    async fn create_media_injection_channel(
        &self,
        host: &str,
        port: u16,
        codec: &str,
    ) -> Result<ChannelId> {
        let endpoint = format!("UnicastRTP/{host}:{port}/{codec}");
        let builder = self.client.post(self.url("/channels/externalMedia")).json(&json!({
            "app": self.app_name,
            "external_host": format!("{host}:{port}"),
            "format": codec,
            "endpoint": endpoint,
        }));
        let resp: ChannelResponse = self.send_json(builder).await?;
        Ok(ChannelId(resp.id))
    }

    async fn create_listener_channel(
        &self,
        source: &ChannelId,
        spy_direction: SpyDirection,
    ) -> Result<ChannelId> {
        let builder = self.client.post(self.url("/channels/snoopChannel")).json(&json!({
            "app": self.app_name,
            "spy": spy_direction.as_str(),
            "snoopId": format!("{}-listener", source.as_str()),
        }));
        let resp: ChannelResponse = self.send_json(builder).await?;
        Ok(ChannelId(resp.id))
    }

    async fn play(&self, channel: &ChannelId, media_ref: &str) -> Result<PlaybackHandle> {
        let builder = self
            .client
            .post(self.url(&format!(
                "/channels/{}/play?media={}",
                channel.as_str(),
                media_ref
            )));
        let resp: PlaybackResponse = self.send_json(builder).await?;
        Ok(PlaybackHandle(resp.id))
    }

    async fn stop_playback(&self, handle: &PlaybackHandle) -> Result<()> {
        let builder = self
            .client
            .delete(self.url(&format!("/playbacks/{}", handle.as_str())));
        self.send_tolerating_not_found(builder).await
    }

    async fn set_channel_var(&self, channel: &ChannelId, name: &str, value: &str) -> Result<()> {
        let builder = self.client.post(self.url(&format!(
            "/channels/{}/variable?variable={}&value={}",
            channel.as_str(),
            name,
            value
        )));
        self.send_tolerating_not_found(builder).await
    }

    async fn set_talk_detect(&self, channel: &ChannelId, energy: f32, silence_ms: u32) -> Result<()> {
        let builder = self.client.post(self.url(&format!(
            "/channels/{}/variable?variable=TALK_DETECT(set)&value={},{}",
            channel.as_str(),
            energy,
            silence_ms
        )));
        self.send_tolerating_not_found(builder).await
    }

    async fn remove_talk_detect(&self, channel: &ChannelId) -> Result<()> {
        let builder = self.client.post(self.url(&format!(
            "/channels/{}/variable?variable=TALK_DETECT(remove)",
            channel.as_str()
        )));
        self.send_tolerating_not_found(builder).await
    }

    async fn continue_in_dialplan(&self, channel: &ChannelId) -> Result<()> {
        let builder = self
            .client
            .post(self.url(&format!("/channels/{}/continue", channel.as_str())));
        self.send_tolerating_not_found(builder).await
    }
}

/// Wire shape of the raw ARI event stream (subset actually consumed).
#[derive(Debug, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum RawAriEvent {
    StasisStart {
        channel: RawChannel,
    },
    StasisEnd {
        channel: RawChannel,
    },
    ChannelDtmfReceived {
        channel: RawChannel,
        digit: String,
    },
    ChannelTalkingStarted {
        channel: RawChannel,
    },
    ChannelTalkingFinished {
        channel: RawChannel,
    },
    PlaybackFinished {
        playback: RawPlayback,
    },
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RawChannel {
    pub id: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RawPlayback {
    pub id: String,
}

impl RawAriEvent {
    pub fn into_pbx_event(self) -> Option<PbxEvent> {
        match self {
            // Handled upstream by `Gateway::route_ari_event` (a new call
            // must be spawned before there's a mailbox to route into).
            RawAriEvent::StasisStart { .. } => None,
            RawAriEvent::StasisEnd { channel } => Some(PbxEvent::ChannelEnded {
                channel: ChannelId(channel.id),
            }),
            RawAriEvent::ChannelDtmfReceived { channel, digit } => {
                digit.chars().next().map(|d| PbxEvent::DtmfReceived {
                    channel: ChannelId(channel.id),
                    digit: d,
                })
            }
            RawAriEvent::ChannelTalkingStarted { channel } => Some(PbxEvent::TalkStarted {
                channel: ChannelId(channel.id),
            }),
            RawAriEvent::ChannelTalkingFinished { channel } => Some(PbxEvent::TalkFinished {
                channel: ChannelId(channel.id),
            }),
            RawAriEvent::PlaybackFinished { playback } => Some(PbxEvent::PlaybackFinished {
                handle: PlaybackHandle(playback.id),
            }),
        }
    }
}

/// Builds the ARI events WebSocket URL (`ws(s)://<base>/events?app=<app>&api_key=<user>:<pass>`),
/// converting an `http(s)://.../ari` base URL to its `ws(s)` equivalent.
fn events_url(base_url: &str, app_name: &str, username: &str, password: &str) -> String {
    let ws_base = base_url
        .replacen("https://", "wss://", 1)
        .replacen("http://", "ws://", 1);
    format!(
        "{ws_base}/events?app={app_name}&api_key={username}:{password}&subscribeAll=true"
    )
}

/// Connects to the ARI event WebSocket and forwards every parsed event to
/// `sink` until the connection drops, then reconnects after a backoff
/// delay — driven by a `tokio_stream::wrappers::IntervalStream` rather than
/// a hand-rolled sleep-and-loop, so the backoff cadence is expressed the
/// same way the rest of this gateway expresses periodic/retry behavior.
/// Runs until the process is told to stop (the caller aborts the task).
pub async fn run_event_stream(
    base_url: String,
    app_name: String,
    username: String,
    password: String,
    sink: UnboundedSender<RawAriEvent>,
) {
    let url = events_url(&base_url, &app_name, &username, &password);
    let mut backoff = IntervalStream::new(tokio::time::interval(Duration::from_secs(2)));

    loop {
        match tokio_tungstenite::connect_async(&url).await {
            Ok((stream, _response)) => {
                info!("connected to ARI event stream");
                let (_write, mut read) = stream.split();
                loop {
                    match read.next().await {
                        Some(Ok(Message::Text(text))) => match serde_json::from_str::<RawAriEvent>(&text) {
                            Ok(event) => {
                                if sink.send(event).is_err() {
                                    return; // gateway shut down
                                }
                            }
                            Err(err) => warn!(%err, "unrecognized ARI event, dropping"),
                        },
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            warn!(%err, "ARI event stream transport error");
                            break;
                        }
                    }
                }
            }
            Err(err) => {
                warn!(%err, "failed to connect to ARI event stream, retrying");
            }
        }
        if sink.is_closed() {
            return;
        }
        backoff.next().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_url_converts_http_scheme_to_ws_and_embeds_credentials() {
        let url = events_url("http://127.0.0.1:8088/ari", "my-app", "asterisk", "secret");
        assert_eq!(
            url,
            "ws://127.0.0.1:8088/ari/events?app=my-app&api_key=asterisk:secret&subscribeAll=true"
        );
    }

    #[test]
    fn events_url_converts_https_scheme_to_wss() {
        let url = events_url("https://pbx.example.com/ari", "app", "u", "p");
        assert!(url.starts_with("wss://"));
    }

    #[test]
    fn stasis_end_maps_to_channel_ended() {
        let raw = RawAriEvent::StasisEnd {
            channel: RawChannel { id: "chan-1".into() },
        };
        match raw.into_pbx_event().unwrap() {
            PbxEvent::ChannelEnded { channel } => assert_eq!(channel.as_str(), "chan-1"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn dtmf_event_extracts_the_digit_char() {
        let raw = RawAriEvent::ChannelDtmfReceived {
            channel: RawChannel { id: "chan-1".into() },
            digit: "5".into(),
        };
        match raw.into_pbx_event().unwrap() {
            PbxEvent::DtmfReceived { digit, .. } => assert_eq!(digit, '5'),
            other => panic!("unexpected: {other:?}"),
        }
    }
}

//! RTP receiver (spec §4.1, §6 "RTP wire format").
//!
//! Binds one UDP socket per call on loopback with an ephemeral port. For
//! each datagram of length >= 12 bytes, strips the 12-byte RTP header and
//! emits the remaining payload. Shorter packets are dropped.
//!
//! The teacher ingests RTP indirectly through `songbird`'s Discord voice
//! driver (`packet_handler.rs` reacts to already-decoded `VoicePacket`
//! events); this gateway terminates raw UDP itself, since the wire format
//! here is plain RTP over a socket the PBX is told to send to, not a
//! negotiated Discord voice-gateway transport.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::net::UdpSocket;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::warn;

const RTP_HEADER_LEN: usize = 12;

#[derive(Debug, Clone)]
pub struct RtpPayload {
    pub bytes: Vec<u8>,
    pub source: SocketAddr,
}

/// Strips the RTP header from `packet`, returning `None` if `packet` is
/// shorter than the header. This is the identity on the payload bytes when
/// composed with the sender side (spec §8 round-trip property): encoding a
/// header in front of arbitrary payload bytes and then stripping it here
/// recovers exactly those bytes.
pub fn strip_rtp_header(packet: &[u8]) -> Option<&[u8]> {
    if packet.len() < RTP_HEADER_LEN {
        return None;
    }
    Some(&packet[RTP_HEADER_LEN..])
}

pub struct RtpReceiver {
    local_addr: SocketAddr,
    stopped: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl RtpReceiver {
    /// Binds a UDP socket on loopback with an ephemeral port and spawns the
    /// receive loop, forwarding stripped payloads to `sink`. Errors binding
    /// the socket are returned to the caller (a setup failure, spec §7);
    /// errors on an already-bound socket are fatal to the receiver only —
    /// the orchestrator decides whether that tears the call down.
    pub async fn bind(sink: UnboundedSender<RtpPayload>) -> std::io::Result<Self> {
        let socket = UdpSocket::bind("127.0.0.1:0").await?;
        let local_addr = socket.local_addr()?;
        let stopped = Arc::new(AtomicBool::new(false));
        let stopped_for_task = stopped.clone();

        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            loop {
                if stopped_for_task.load(Ordering::SeqCst) {
                    return;
                }
                match socket.recv_from(&mut buf).await {
                    Ok((len, source)) => {
                        if let Some(payload) = strip_rtp_header(&buf[..len]) {
                            if sink
                                .send(RtpPayload {
                                    bytes: payload.to_vec(),
                                    source,
                                })
                                .is_err()
                            {
                                return;
                            }
                        }
                        // packets shorter than the header are silently dropped
                    }
                    Err(err) => {
                        warn!(%err, "rtp socket error, stopping receiver");
                        return;
                    }
                }
            }
        });

        Ok(Self {
            local_addr,
            stopped,
            task: Some(task),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Idempotent stop: closes the receive loop and releases the port.
    /// Calling this more than once is a no-op.
    pub fn stop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for RtpReceiver {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packets_shorter_than_header_are_dropped() {
        let short = vec![0u8; 11];
        assert!(strip_rtp_header(&short).is_none());
    }

    #[test]
    fn strip_then_nothing_else_is_identity_on_payload_bytes() {
        let mut packet = vec![0u8; RTP_HEADER_LEN];
        let payload = b"ulaw-audio-bytes".to_vec();
        packet.extend_from_slice(&payload);
        let stripped = strip_rtp_header(&packet).unwrap();
        assert_eq!(stripped, payload.as_slice());
    }

    #[tokio::test]
    async fn bind_returns_a_loopback_ephemeral_address() {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let mut receiver = RtpReceiver::bind(tx).await.unwrap();
        assert!(receiver.local_addr().ip().is_loopback());
        assert!(receiver.local_port() > 0);
        receiver.stop();
        receiver.stop(); // idempotent
    }

    #[tokio::test]
    async fn received_datagram_is_forwarded_with_header_stripped() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let receiver = RtpReceiver::bind(tx).await.unwrap();
        let addr = receiver.local_addr();

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut packet = vec![0u8; RTP_HEADER_LEN];
        packet.extend_from_slice(b"hello");
        sender.send_to(&packet, addr).await.unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.bytes, b"hello");
    }
}

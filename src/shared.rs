//! Wire protocol shared between the `portway` server and client.
//!
//! Every message on a control link is a JSON object terminated by the
//! three-byte sentinel `|||`. Payload bytes are hex-encoded so user data can
//! never contain the sentinel.

use std::fmt;
use std::io;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::{Buf, Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use futures_util::stream::{SplitSink, SplitStream};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::{Decoder, Encoder, Framed};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Frame terminator on the control link.
pub const SENTINEL: &[u8] = b"|||";

/// Upper bound on a single frame. A relay pump reads at most [`RELAY_BUFFER`]
/// bytes per iteration, which doubles under hex encoding; the rest is
/// envelope headroom.
pub const MAX_FRAME_LENGTH: usize = 16 * 1024;

/// Bytes read from a tunneled socket per pump iteration.
pub const RELAY_BUFFER: usize = 4096;

/// Outbound message queue depth per control socket.
pub(crate) const OUTBOUND_BUFFER: usize = 64;

/// Timeout for handshake-phase reads on a fresh control link.
pub const NETWORK_TIMEOUT: Duration = Duration::from_secs(10);

/// A control-link message. One frame carries exactly one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// First message on a new control link; carries the shared key.
    Auth {
        /// Bearer key compared verbatim against the server's configured key.
        key: String,
    },
    /// Server verdict on `auth`. The link is closed after a failure.
    AuthResponse {
        /// Whether the key was accepted.
        success: bool,
        /// Rejection reason, present on failure.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// Ask the server to bind `target_port` publicly. The client will dial
    /// `forward_domain:forward_port` for each connection accepted there.
    ForwardRequest {
        forward_domain: String,
        forward_port: u16,
        target_port: u16,
        /// Transport mode; only `TCP` is accepted.
        mode: String,
    },
    /// Server verdict on `forward_request`. `forward_id` and `target_port`
    /// are present on success, `message` on failure.
    ForwardResponse {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_port: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        forward_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// A public peer connected; the client must dial its backend and be
    /// ready to receive `data` for this stream.
    NewConnection { forward_id: String, conn_id: String },
    /// Payload bytes for one tunneled stream, lowercase hex.
    Data {
        forward_id: String,
        conn_id: String,
        data: String,
    },
    /// Terminates one tunneled stream. Sent by either side, idempotent.
    CloseConnection { forward_id: String, conn_id: String },
    /// Tears down a forward and every stream under it.
    CloseForward { forward_id: String },
    /// Non-fatal protocol error report.
    Error { message: String },
}

const KNOWN_TYPES: &[&str] = &[
    "auth",
    "auth_response",
    "forward_request",
    "forward_response",
    "new_connection",
    "data",
    "close_connection",
    "close_forward",
    "error",
];

/// Why a received frame did not yield a [`Message`].
///
/// The three classes get three distinct reactions: invalid JSON and unknown
/// types are answered with an `error` message, missing fields are dropped
/// silently.
#[derive(Debug)]
pub enum FrameError {
    /// The frame was not a valid JSON object.
    InvalidJson(serde_json::Error),
    /// The `type` field named no known message.
    UnknownType(String),
    /// A known message type arrived without one of its required fields.
    MissingFields(String),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::InvalidJson(err) => write!(f, "invalid JSON: {err}"),
            FrameError::UnknownType(ty) => write!(f, "unknown message type {ty:?}"),
            FrameError::MissingFields(ty) => write!(f, "missing required fields for {ty:?}"),
        }
    }
}

impl std::error::Error for FrameError {}

impl Message {
    /// Parse one frame, classifying the failure mode.
    pub fn parse(frame: &[u8]) -> Result<Message, FrameError> {
        let value: serde_json::Value =
            serde_json::from_slice(frame).map_err(FrameError::InvalidJson)?;
        let ty = value
            .get("type")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_owned();
        if !KNOWN_TYPES.contains(&ty.as_str()) {
            return Err(FrameError::UnknownType(ty));
        }
        serde_json::from_value(value).map_err(|_| FrameError::MissingFields(ty))
    }

    /// Encode into the byte form sent on the wire, terminator excluded.
    pub fn to_frame(&self) -> Result<Bytes> {
        Ok(serde_json::to_vec(self)?.into())
    }
}

/// Splits a byte stream into frames at every `|||` sentinel.
///
/// Scanning resumes where the previous call left off, so a growing buffer is
/// never rescanned from the start; a sentinel split across reads is still
/// found because the scan backs up by two bytes.
pub struct SentinelCodec {
    next_index: usize,
}

impl SentinelCodec {
    pub fn new() -> Self {
        SentinelCodec { next_index: 0 }
    }
}

impl Default for SentinelCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for SentinelCodec {
    type Item = BytesMut;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<BytesMut>> {
        match src[self.next_index..]
            .windows(SENTINEL.len())
            .position(|window| window == SENTINEL)
        {
            Some(offset) => {
                let end = self.next_index + offset;
                if end > MAX_FRAME_LENGTH {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "frame exceeds maximum length",
                    ));
                }
                let frame = src.split_to(end);
                src.advance(SENTINEL.len());
                self.next_index = 0;
                Ok(Some(frame))
            }
            None => {
                if src.len() > MAX_FRAME_LENGTH {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "frame exceeds maximum length",
                    ));
                }
                self.next_index = src.len().saturating_sub(SENTINEL.len() - 1);
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> io::Result<Option<BytesMut>> {
        // An unterminated tail at end of stream is discarded.
        let frame = self.decode(src)?;
        if frame.is_none() {
            src.clear();
            self.next_index = 0;
        }
        Ok(frame)
    }
}

impl Encoder<Bytes> for SentinelCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> io::Result<()> {
        dst.reserve(item.len() + SENTINEL.len());
        dst.extend_from_slice(&item);
        dst.extend_from_slice(SENTINEL);
        Ok(())
    }
}

/// Write half of a split control link.
pub type FrameSink<U> = SplitSink<Framed<U, SentinelCodec>, Bytes>;

/// Read half of a split control link.
pub type FrameStream<U> = SplitStream<Framed<U, SentinelCodec>>;

/// A framed control link.
pub struct Delimited<U>(Framed<U, SentinelCodec>);

impl<U: AsyncRead + AsyncWrite + Unpin> Delimited<U> {
    /// Construct a framed link from a raw transport.
    pub fn new(stream: U) -> Self {
        Delimited(Framed::new(stream, SentinelCodec::new()))
    }

    /// Read the next raw frame; `None` on a clean end of stream.
    pub async fn recv(&mut self) -> Result<Option<BytesMut>> {
        self.0
            .next()
            .await
            .transpose()
            .context("failed to read frame from control link")
    }

    /// Read and strictly parse the next message, bounded by
    /// [`NETWORK_TIMEOUT`]. Handshake-phase reads only; on an established
    /// link malformed frames are survivable and must not kill the session.
    pub async fn recv_message_timeout(&mut self) -> Result<Option<Message>> {
        let frame = timeout(NETWORK_TIMEOUT, self.recv())
            .await
            .context("timed out waiting for message")??;
        match frame {
            Some(frame) => Ok(Some(Message::parse(&frame)?)),
            None => Ok(None),
        }
    }

    /// Write one message as a single frame.
    pub async fn send(&mut self, msg: &Message) -> Result<()> {
        self.0.send(msg.to_frame()?).await?;
        Ok(())
    }

    /// Split into independently owned write and read halves.
    pub fn split(self) -> (FrameSink<U>, FrameStream<U>) {
        self.0.split()
    }
}

/// Drains queued messages onto a control link.
///
/// One writer task runs per control socket, so frames produced by concurrent
/// pumps are serialized and never interleave mid-sentinel. Exits when every
/// sender is gone, the transport fails, or the session is cancelled.
pub(crate) async fn write_frames<U>(
    mut sink: FrameSink<U>,
    mut outbound: mpsc::Receiver<Message>,
    token: CancellationToken,
) where
    U: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            // Messages queued before cancellation still drain; the final
            // auth_response on a rejected link depends on this.
            biased;
            msg = outbound.recv() => {
                let Some(msg) = msg else { break };
                let frame = match msg.to_frame() {
                    Ok(frame) => frame,
                    Err(err) => {
                        warn!(%err, "failed to encode frame");
                        continue;
                    }
                };
                // A peer that stops draining its receive buffer blocks this
                // write; cancellation must still win.
                let sent = tokio::select! {
                    biased;
                    result = sink.send(frame) => result.is_ok(),
                    _ = token.cancelled() => false,
                };
                if !sent {
                    break;
                }
            }
            _ = token.cancelled() => break,
        }
    }
}

/// Moves bytes from one side of a tunneled stream onto the control link as
/// `data` frames until EOF, a read error, or cancellation.
///
/// The pump owns the read half of its socket; the caller reaps the registry
/// entry once the pump returns.
pub(crate) async fn pump(
    mut reader: OwnedReadHalf,
    outbound: mpsc::Sender<Message>,
    forward_id: String,
    conn_id: String,
    token: CancellationToken,
) {
    let mut buf = vec![0u8; RELAY_BUFFER];
    loop {
        let n = tokio::select! {
            _ = token.cancelled() => break,
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    debug!("peer closed its end");
                    break;
                }
                Ok(n) => n,
                Err(err) => {
                    debug!(%err, "stream read failed");
                    break;
                }
            },
        };
        let msg = Message::Data {
            forward_id: forward_id.clone(),
            conn_id: conn_id.clone(),
            data: hex::encode(&buf[..n]),
        };
        // A failed send means the control link is gone; the session teardown
        // reaps this stream. The queue can also back up behind a stalled
        // writer, so the send itself must honor cancellation.
        let delivered = tokio::select! {
            biased;
            result = outbound.send(msg) => result.is_ok(),
            _ = token.cancelled() => false,
        };
        if !delivered {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode_all(codec: &mut SentinelCodec, src: &mut BytesMut) -> Vec<BytesMut> {
        let mut frames = Vec::new();
        while let Some(frame) = codec.decode(src).unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn decodes_multiple_frames_from_one_read() {
        let mut codec = SentinelCodec::new();
        let mut src = BytesMut::from(&b"{\"a\":1}|||{\"b\":2}|||"[..]);
        let frames = decode_all(&mut codec, &mut src);
        assert_eq!(frames, vec![&b"{\"a\":1}"[..], &b"{\"b\":2}"[..]]);
        assert!(src.is_empty());
    }

    #[test]
    fn retains_partial_tail_across_reads() {
        let mut codec = SentinelCodec::new();
        let mut src = BytesMut::from(&b"{\"a\":1}|||{\"b\""[..]);
        let frames = decode_all(&mut codec, &mut src);
        assert_eq!(frames, vec![&b"{\"a\":1}"[..]]);

        src.extend_from_slice(b":2}|||");
        let frames = decode_all(&mut codec, &mut src);
        assert_eq!(frames, vec![&b"{\"b\":2}"[..]]);
    }

    #[test]
    fn finds_sentinel_split_across_reads() {
        let mut codec = SentinelCodec::new();
        let mut src = BytesMut::from(&b"abc||"[..]);
        assert!(codec.decode(&mut src).unwrap().is_none());

        src.extend_from_slice(b"|def|||");
        let frames = decode_all(&mut codec, &mut src);
        assert_eq!(frames, vec![&b"abc"[..], &b"def"[..]]);
    }

    #[test]
    fn rejects_oversized_frame() {
        let mut codec = SentinelCodec::new();
        let mut src = BytesMut::from(vec![b'x'; MAX_FRAME_LENGTH + 1].as_slice());
        assert!(codec.decode(&mut src).is_err());
    }

    #[test]
    fn discards_unterminated_tail_at_eof() {
        let mut codec = SentinelCodec::new();
        let mut src = BytesMut::from(&b"{\"a\":1}|||garbage"[..]);
        assert_eq!(
            codec.decode_eof(&mut src).unwrap(),
            Some(BytesMut::from(&b"{\"a\":1}"[..]))
        );
        assert_eq!(codec.decode_eof(&mut src).unwrap(), None);
        assert!(src.is_empty());
    }

    #[test]
    fn encodes_with_terminator() {
        let mut codec = SentinelCodec::new();
        let mut dst = BytesMut::new();
        codec.encode(Bytes::from_static(b"{}"), &mut dst).unwrap();
        assert_eq!(&dst[..], b"{}|||");
    }

    #[test]
    fn message_wire_format_matches_protocol() {
        let msg = Message::Auth { key: "K".into() };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "auth", "key": "K"})
        );

        let msg = Message::Data {
            forward_id: "1.2.3.4:5:5100".into(),
            conn_id: "6.7.8.9:10".into(),
            data: hex::encode([0x00, 0xff]),
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({
                "type": "data",
                "forward_id": "1.2.3.4:5:5100",
                "conn_id": "6.7.8.9:10",
                "data": "00ff",
            })
        );

        // Failure responses omit the optional fields entirely.
        let msg = Message::ForwardResponse {
            success: false,
            target_port: None,
            forward_id: None,
            message: Some("Not authenticated".into()),
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({
                "type": "forward_response",
                "success": false,
                "message": "Not authenticated",
            })
        );
    }

    #[test]
    fn parse_classifies_failure_modes() {
        assert!(matches!(
            Message::parse(b"not json"),
            Err(FrameError::InvalidJson(_))
        ));
        assert!(matches!(
            Message::parse(br#"{"type": "bogus"}"#),
            Err(FrameError::UnknownType(ty)) if ty == "bogus"
        ));
        assert!(matches!(
            Message::parse(br#"{"no_type": true}"#),
            Err(FrameError::UnknownType(ty)) if ty.is_empty()
        ));
        assert!(matches!(
            Message::parse(br#"{"type": "auth"}"#),
            Err(FrameError::MissingFields(ty)) if ty == "auth"
        ));
        assert_eq!(
            Message::parse(br#"{"type": "close_forward", "forward_id": "f"}"#).unwrap(),
            Message::CloseForward {
                forward_id: "f".into()
            }
        );
    }

    #[test]
    fn parse_tolerates_unknown_fields() {
        let msg = Message::parse(br#"{"type": "auth", "key": "K", "extra": 1}"#).unwrap();
        assert_eq!(msg, Message::Auth { key: "K".into() });
    }

    #[test]
    fn hex_payload_round_trips_all_byte_values() {
        let payload: Vec<u8> = (0u8..=255).collect();
        let encoded = hex::encode(&payload);
        assert!(encoded.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(hex::decode(&encoded).unwrap(), payload);
    }
}

//! Wire protocol between clients and the singleton TTS daemon.
//!
//! Messages are MessagePack-encoded and framed with a 4-byte big-endian
//! length prefix over a Unix Domain Socket. The speak acknowledgment is a
//! queuing ack: it is sent once the request is on the playback queue, never
//! after playback completes, so clients return immediately.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

/// Protocol version for compatibility checks.
pub const PROTOCOL_VERSION: u32 = 1;

/// Reject frames larger than this; speak requests are tiny.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Request types for the daemon protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Synthesize and play text.
    Speak {
        text: String,
        /// Optional voice-clone reference file, resolved on the daemon side.
        voice_path: Option<String>,
    },

    /// Get daemon status.
    Status,

    /// Request graceful shutdown.
    Shutdown,
}

/// Response types from the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    /// Speak acknowledgment (queued or rejected).
    Ack(SpeakAck),

    /// Status response with daemon info.
    Status(StatusResponse),

    /// Shutdown acknowledgement.
    Shutdown { message: String },

    /// Error response.
    Error(ErrorResponse),
}

/// Whether a speak request made it onto the playback queue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AckStatus {
    Accepted,
    Rejected,
}

/// Acknowledgment for one speak request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeakAck {
    pub status: AckStatus,
    /// Rejection reason, absent when accepted.
    pub reason: Option<String>,
    /// Arrival order assigned by the daemon, absent when rejected.
    pub order: Option<u64>,
}

impl SpeakAck {
    pub fn accepted(order: u64) -> Self {
        Self {
            status: AckStatus::Accepted,
            reason: None,
            order: Some(order),
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            status: AckStatus::Rejected,
            reason: Some(reason.into()),
            order: None,
        }
    }
}

/// Daemon status response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    /// Daemon uptime in seconds.
    pub uptime_secs: u64,
    /// Protocol version.
    pub version: u32,
    /// Whether the synthesis model is currently loaded.
    pub model_loaded: bool,
    /// Requests waiting in the playback queue.
    pub queue_depth: usize,
    /// System used-memory fraction (0.0–1.0).
    pub used_memory_fraction: f64,
    /// Daemon process RSS in bytes.
    pub rss_bytes: u64,
    /// Total speak requests accepted this lifetime.
    pub total_requests: u64,
}

/// Error response from the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error code for programmatic handling.
    pub code: ErrorCode,
    /// Human-readable error message.
    pub message: String,
}

/// Error codes for daemon errors.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCode {
    /// Unknown or internal error.
    Internal,
    /// Invalid request (bad frame, undecodable payload).
    InvalidRequest,
    /// Memory pressure too high to accept the request.
    Overloaded,
    /// Protocol version mismatch.
    VersionMismatch,
}

/// Framed message wrapper for the length-prefixed protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FramedMessage<T> {
    /// Protocol version.
    pub version: u32,
    /// Request ID for correlation.
    pub request_id: String,
    /// Payload.
    pub payload: T,
}

impl<T> FramedMessage<T> {
    pub fn new(request_id: impl Into<String>, payload: T) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            request_id: request_id.into(),
            payload,
        }
    }
}

/// Encode a message to MessagePack bytes with length prefix.
pub fn encode_message<T: Serialize>(msg: &FramedMessage<T>) -> Result<Vec<u8>, EncodeError> {
    let payload = rmp_serde::to_vec(msg).map_err(|e| EncodeError(e.to_string()))?;
    let len = payload.len() as u32;
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Decode a message from MessagePack bytes (without length prefix).
pub fn decode_message<T: for<'de> Deserialize<'de>>(
    data: &[u8],
) -> Result<FramedMessage<T>, DecodeError> {
    rmp_serde::from_slice(data).map_err(|e| DecodeError(e.to_string()))
}

/// Read one length-prefixed frame body. `Ok(None)` means clean EOF before
/// the length prefix (peer closed between messages).
pub fn read_frame(stream: &mut impl Read) -> std::io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame too large: {} bytes", len),
        ));
    }

    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload)?;
    Ok(Some(payload))
}

/// Encode and write one frame.
pub fn write_frame<T: Serialize>(
    stream: &mut impl Write,
    msg: &FramedMessage<T>,
) -> std::io::Result<()> {
    let encoded = encode_message(msg).map_err(|e| std::io::Error::other(e.to_string()))?;
    stream.write_all(&encoded)
}

#[derive(Debug, Clone)]
pub struct EncodeError(pub String);

impl std::fmt::Display for EncodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "encode error: {}", self.0)
    }
}

impl std::error::Error for EncodeError {}

#[derive(Debug, Clone)]
pub struct DecodeError(pub String);

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "decode error: {}", self.0)
    }
}

impl std::error::Error for DecodeError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_speak_request() {
        let msg = FramedMessage::new(
            "req-1",
            Request::Speak {
                text: "hello world".to_string(),
                voice_path: None,
            },
        );
        let encoded = encode_message(&msg).unwrap();

        // Skip 4-byte length prefix
        let decoded: FramedMessage<Request> = decode_message(&encoded[4..]).unwrap();
        assert_eq!(decoded.version, PROTOCOL_VERSION);
        assert_eq!(decoded.request_id, "req-1");
        if let Request::Speak { text, voice_path } = decoded.payload {
            assert_eq!(text, "hello world");
            assert!(voice_path.is_none());
        } else {
            panic!("expected Speak request");
        }
    }

    #[test]
    fn test_encode_decode_ack_accepted() {
        let msg = FramedMessage::new("resp-1", Response::Ack(SpeakAck::accepted(7)));
        let encoded = encode_message(&msg).unwrap();
        let decoded: FramedMessage<Response> = decode_message(&encoded[4..]).unwrap();

        if let Response::Ack(ack) = decoded.payload {
            assert_eq!(ack.status, AckStatus::Accepted);
            assert_eq!(ack.order, Some(7));
            assert!(ack.reason.is_none());
        } else {
            panic!("expected Ack response");
        }
    }

    #[test]
    fn test_encode_decode_ack_rejected() {
        let msg = FramedMessage::new("resp-2", Response::Ack(SpeakAck::rejected("overloaded")));
        let encoded = encode_message(&msg).unwrap();
        let decoded: FramedMessage<Response> = decode_message(&encoded[4..]).unwrap();

        if let Response::Ack(ack) = decoded.payload {
            assert_eq!(ack.status, AckStatus::Rejected);
            assert_eq!(ack.reason.as_deref(), Some("overloaded"));
            assert!(ack.order.is_none());
        } else {
            panic!("expected Ack response");
        }
    }

    #[test]
    fn test_frame_round_trip_over_stream() {
        let msg = FramedMessage::new("req-3", Request::Status);
        let mut buf = Vec::new();
        write_frame(&mut buf, &msg).unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let body = read_frame(&mut cursor).unwrap().expect("one frame");
        let decoded: FramedMessage<Request> = decode_message(&body).unwrap();
        assert!(matches!(decoded.payload, Request::Status));

        // Stream is exhausted: next read is a clean EOF
        assert!(read_frame(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn test_read_frame_rejects_oversized_length() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&((MAX_FRAME_BYTES as u32) + 1).to_be_bytes());
        let mut cursor = std::io::Cursor::new(buf);
        assert!(read_frame(&mut cursor).is_err());
    }

    #[test]
    fn test_encode_decode_status_response() {
        let msg = FramedMessage::new(
            "resp-3",
            Response::Status(StatusResponse {
                uptime_secs: 42,
                version: PROTOCOL_VERSION,
                model_loaded: true,
                queue_depth: 3,
                used_memory_fraction: 0.41,
                rss_bytes: 100_000_000,
                total_requests: 12,
            }),
        );
        let encoded = encode_message(&msg).unwrap();
        let decoded: FramedMessage<Response> = decode_message(&encoded[4..]).unwrap();

        if let Response::Status(status) = decoded.payload {
            assert_eq!(status.uptime_secs, 42);
            assert!(status.model_loaded);
            assert_eq!(status.queue_depth, 3);
        } else {
            panic!("expected Status response");
        }
    }
}

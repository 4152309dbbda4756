//! Error types for the call control core.
//!
//! Each component owns a focused error enum; [`CallCoreError`] composes them
//! so callers that don't care which layer failed can use a single type.

use thiserror::Error;

/// Errors raised by the binary codec (C1).
#[derive(Debug, Error)]
pub enum CodecError {
    /// The buffer ended before the value being decoded was complete.
    #[error("truncated input: expected at least {needed} more byte(s), got {available}")]
    Truncated {
        /// Bytes required to finish decoding.
        needed: usize,
        /// Bytes actually remaining in the buffer.
        available: usize,
    },
    /// A decoded length prefix was negative.
    #[error("negative length prefix: {0}")]
    NegativeLength(i32),
    /// A decoded length prefix exceeds the bytes remaining in the buffer.
    #[error("length {length} exceeds {available} remaining byte(s)")]
    LengthOutOfRange {
        /// Decoded length.
        length: usize,
        /// Bytes actually remaining.
        available: usize,
    },
    /// A varint did not terminate within 10 continuation bytes.
    #[error("varint exceeds 10 bytes")]
    VarintTooLong,
    /// A decoded string was not valid UTF-8.
    #[error("invalid UTF-8 in decoded string")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
    /// Growing the encode buffer would exceed the 16 MiB cap.
    #[error("encode buffer would exceed the {0} byte cap")]
    BufferCapExceeded(usize),
}

/// Errors surfaced by the IQ schema registry (C2).
#[derive(Debug, Error)]
pub enum SchemaError {
    /// No deserializer is registered for this `(schemaId, schemaVersion)`.
    #[error("unknown schema {schema_id}/{version}")]
    Unknown {
        /// The schema id from the frame header.
        schema_id: uuid::Uuid,
        /// The schema version from the frame header.
        version: i32,
    },
    /// The header decoded but the body failed to deserialize.
    #[error("failed to decode body for schema {schema_id}/{version}: {source}")]
    BodyDecode {
        /// The schema id from the frame header.
        schema_id: uuid::Uuid,
        /// The schema version from the frame header.
        version: i32,
        /// Underlying codec failure.
        #[source]
        source: CodecError,
    },
}

/// Errors raised by the signaling transport (C3).
#[derive(Debug, Error)]
pub enum SignalingError {
    /// The underlying WebSocket connection failed or closed unexpectedly.
    #[error("transport error: {0}")]
    Transport(String),
    /// A frame failed to parse as JSON or as a known message variant.
    #[error("malformed signaling frame: {0}")]
    Malformed(String),
    /// The connect handshake did not complete within the configured timeout.
    #[error("connect timed out")]
    ConnectTimeout,
    /// No inbound frame was received within the keepalive window.
    #[error("ping timeout")]
    PingTimeout,
    /// The reconnect policy was exhausted.
    #[error("reconnect attempts exhausted")]
    RetriesExhausted,
}

/// Errors raised by peer session (C4) state transitions.
#[derive(Debug, Error)]
pub enum PeerSessionError {
    /// A peer-connection API call failed (SDP, ICE, data channel).
    #[error("media/peer-connection error: {0}")]
    Media(String),
    /// A signaling message arrived that violated the session's protocol
    /// expectations (wrong state, unknown session id, stale generation).
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// A timer (call timeout, connect timeout) fired.
    #[error("timeout: {0}")]
    Timeout(&'static str),
}

/// Errors raised by the call aggregator (C5).
#[derive(Debug, Error)]
pub enum CallError {
    /// The peer did not pass the room-subdomain authorization check.
    #[error("not authorized")]
    NotAuthorized,
    /// A message referenced a session id the aggregator does not know.
    #[error("unknown session {0}")]
    UnknownSession(String),
    /// An operation was attempted while an active call already exists.
    #[error("a call is already active")]
    AlreadyActive,
    /// Underlying peer session failure.
    #[error(transparent)]
    Session(#[from] PeerSessionError),
}

/// Umbrella error for callers that want one type across components.
#[derive(Debug, Error)]
pub enum CallCoreError {
    /// Binary codec failure.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// Schema registry failure.
    #[error(transparent)]
    Schema(#[from] SchemaError),
    /// Signaling transport failure.
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    /// Peer session failure.
    #[error(transparent)]
    PeerSession(#[from] PeerSessionError),
    /// Call aggregator failure.
    #[error(transparent)]
    Call(#[from] CallError),
    /// Configuration failure.
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
}

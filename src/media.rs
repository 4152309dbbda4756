//! Media engine boundary.
//!
//! Capturing, encoding, and rendering audio/video are explicitly out of
//! scope (§1 Non-goals): this core only negotiates *capability* (the
//! [`Offer`](crate::types::Offer) flags) and leaves track attachment to
//! the embedding application. This module defines the narrow interface
//! [`PeerSession`](crate::peer_session::PeerSession) calls into so a real
//! media engine can be plugged in without this crate depending on one.

use async_trait::async_trait;

use crate::error::PeerSessionError;
use crate::peer_session::Direction;

/// What the embedding application attaches to a session's peer connection
/// once SDP negotiation completes. Implementations own the actual capture
/// devices, encoders, and renderers; this crate only calls through this
/// trait at the points §4.4.6/§4.4.7 describe.
#[async_trait]
pub trait MediaSink: Send + Sync {
    /// Apply a direction change to the local audio transceiver.
    async fn set_audio_direction(&self, direction: Direction) -> Result<(), PeerSessionError>;
    /// Apply a direction change to the local video transceiver.
    async fn set_video_direction(&self, direction: Direction) -> Result<(), PeerSessionError>;
    /// Called once ICE first connects, so the application can start
    /// rendering/capturing.
    async fn on_connected(&self);
    /// Called on session termination, so the application can release
    /// devices.
    async fn on_terminated(&self);
}

/// A [`MediaSink`] that does nothing; used where a session has no local
/// media (data-channel-only sessions) or in tests.
pub struct NullMediaSink;

#[async_trait]
impl MediaSink for NullMediaSink {
    async fn set_audio_direction(&self, _direction: Direction) -> Result<(), PeerSessionError> {
        Ok(())
    }
    async fn set_video_direction(&self, _direction: Direction) -> Result<(), PeerSessionError> {
        Ok(())
    }
    async fn on_connected(&self) {}
    async fn on_terminated(&self) {}
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_sink_accepts_any_direction_change() {
        let sink = NullMediaSink;
        sink.set_audio_direction(Direction::SendOnly).await.unwrap();
        sink.set_video_direction(Direction::Inactive).await.unwrap();
        sink.on_connected().await;
        sink.on_terminated().await;
    }
}

//! Call control core for a browser-based click-to-call WebRTC client.
//!
//! This crate implements the signaling transport, per-session state
//! machine, multi-peer call aggregator, and length-prefixed binary IQ
//! framing layer that sit beneath a WebRTC peer connection, so an
//! embedding application only has to supply local media and a concrete
//! [`peer_session::PeerConnection`].
//!
//! # Examples
//!
//! ```rust,no_run
//! use callcore::{CallCore, CallCoreConfig};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = CallCoreConfig::from_env()?;
//! let core = CallCore::new(config, "acme-corp", std::sync::Arc::new(|| {
//!     unimplemented!("construct an application-specific PeerConnection")
//! }));
//! core.start();
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::pedantic)]
#![allow(clippy::nursery)]
#![allow(clippy::unused_async)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::derivable_impls)]

/// Shared data model: identifiers, capability offers, participants, call
/// status, and the data-channel label format (§3).
pub mod types;

/// Binary codec: varint/UUID/string/byte-array primitives (C1, §4.1).
pub mod codec;

/// Conversation IQ layer: data-channel frame types (C6, §4.6).
pub mod iq;

/// IQ schema registry (C2, §4.2).
pub mod schema;

/// Peer identity abstraction and client session-id generation.
pub mod identity;

/// Signaling transport (C3, §4.3).
pub mod signaling;

/// Per-session state machine (C4, §4.4).
pub mod peer_session;

/// Call aggregator (C5, §4.5).
pub mod call;

/// Media engine boundary trait.
pub mod media;

/// `CallCore` facade wiring signaling and the call aggregator.
pub mod service;

/// Error types.
pub mod error;

/// Configuration from environment variables (§6.3).
pub mod config;

pub use call::{Call, CallAggregator, CallEvent, TransferDirection};
pub use config::{CallCoreConfig, ConfigError};
pub use error::CallCoreError;
pub use identity::{ClientSessionId, PeerIdentity, PeerIdentityString};
pub use media::{MediaSink, NullMediaSink};
pub use peer_session::{Direction, IceState, NegotiationState, PeerConnection, PeerSession, SessionState};
pub use service::{CallCore, PeerConnectionFactory};
pub use signaling::{SignalingEvent, SignalingFrame, SignalingState, SignalingTransport};
pub use types::{
    CallId, CallStatus, Capability, DataChannelLabel, Offer, Participant, SessionId,
    TerminateReason, TransportCandidate, Tri, Version,
};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::call::{Call, CallAggregator, CallEvent};
    pub use crate::identity::{PeerIdentity, PeerIdentityString};
    pub use crate::peer_session::{PeerConnection, PeerSession};
    pub use crate::service::CallCore;
    pub use crate::signaling::{SignalingEvent, SignalingTransport};
    pub use crate::types::{CallId, CallStatus, Offer, SessionId, TerminateReason};
}

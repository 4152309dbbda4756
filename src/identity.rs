//! Peer identity abstraction, plus the signaling transport's client
//! session-id generator (§4.3).

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display};
use std::hash::Hash;

/// Trait for peer identity in the call control core.
///
/// Implementations must provide a way to uniquely identify peers. The
/// identity must be serializable, comparable, and displayable.
pub trait PeerIdentity:
    Clone + Debug + Display + Serialize + for<'de> Deserialize<'de> + Send + Sync + 'static
{
    /// Convert the identity to a string representation.
    fn to_string_repr(&self) -> String;

    /// Try to create an identity from a string representation.
    fn from_string_repr(s: &str) -> anyhow::Result<Self>
    where
        Self: Sized;

    /// Get a unique identifier for this peer (for use in hash maps, etc.)
    fn unique_id(&self) -> String {
        self.to_string_repr()
    }
}

/// Simple string-based peer identity. Suitable for testing or applications
/// that resolve identity entirely through the signaling gateway.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerIdentityString(pub String);

impl PeerIdentityString {
    /// Create a new string-based peer identity.
    #[must_use]
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PeerIdentityString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl PeerIdentity for PeerIdentityString {
    fn to_string_repr(&self) -> String {
        self.0.clone()
    }

    fn from_string_repr(s: &str) -> anyhow::Result<Self> {
        Ok(Self(s.to_string()))
    }
}

impl From<&str> for PeerIdentityString {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerIdentityString {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Character set used by [`ClientSessionId::generate`]: `0-9 a-z A-Z _ -`,
/// 64 entries so one random byte modulo 64 selects one character (§4.3).
const CHARSET: &[u8; 64] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ_-";

/// Number of random bytes drawn to build a client session-id (§4.3).
const TOKEN_BYTES: usize = 85;

/// A stable client session-id for the signaling transport: `id-` followed
/// by 85 characters drawn from a 64-character alphabet, for an 88-character
/// token reused across reconnects for the transport's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientSessionId(String);

impl ClientSessionId {
    /// Generate a fresh client session-id from a cryptographic RNG.
    #[must_use]
    pub fn generate() -> Self {
        let mut rng = rand::rngs::OsRng;
        let mut raw = [0u8; TOKEN_BYTES];
        rng.fill_bytes(&mut raw);
        let mut token = String::with_capacity(3 + TOKEN_BYTES);
        token.push_str("id-");
        for byte in raw {
            token.push(CHARSET[(byte as usize) % CHARSET.len()] as char);
        }
        Self(token)
    }

    /// Borrow the token as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ClientSessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_identity_string() {
        let id = PeerIdentityString::new("alice-bob-charlie-david");
        assert_eq!(id.to_string(), "alice-bob-charlie-david");
        assert_eq!(id.to_string_repr(), "alice-bob-charlie-david");
    }

    #[test]
    fn test_peer_identity_from_string() {
        let id = PeerIdentityString::from_string_repr("test-peer-id")
            .ok()
            .unwrap();
        assert_eq!(id.as_str(), "test-peer-id");
    }

    #[test]
    fn test_peer_identity_serialization() {
        let id = PeerIdentityString::new("alice-bob");
        let json = serde_json::to_string(&id).ok().unwrap();
        let deserialized: PeerIdentityString = serde_json::from_str(&json).ok().unwrap();
        assert_eq!(id, deserialized);
    }

    #[test]
    fn client_session_id_is_88_chars_with_id_prefix() {
        let id = ClientSessionId::generate();
        assert_eq!(id.as_str().len(), 88);
        assert!(id.as_str().starts_with("id-"));
        assert!(id.as_str()[3..].bytes().all(|b| CHARSET.contains(&b)));
    }

    #[test]
    fn client_session_id_is_not_trivially_predictable() {
        let a = ClientSessionId::generate();
        let b = ClientSessionId::generate();
        assert_ne!(a, b);
    }
}

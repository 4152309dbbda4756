//! IQ schema registry (C2): maps `(schemaId, schemaVersion)` to a
//! deserializer and handler, per open peer session (§4.2).
//!
//! There is no global singleton — different sessions may register different
//! handler sets (e.g. a transfer target registers additional handlers over
//! the base set), so each [`PeerSession`](crate::peer_session::PeerSession)
//! owns one [`IqRegistry`].

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use crate::codec::Decoder;
use crate::error::SchemaError;
use crate::iq::{BinaryHeader, DecodedIq, IqBody, SchemaKey};

type DecodeFn = Arc<dyn Fn(&mut Decoder<'_>) -> Result<DecodedIq, crate::error::CodecError> + Send + Sync>;
type HandleFn = Arc<dyn Fn(DecodedIq, i64) + Send + Sync>;

struct Registration {
    decode: DecodeFn,
    handle: HandleFn,
}

/// Outcome of dispatching one data-channel frame through the registry.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// The frame matched a registered schema and its handler ran.
    Handled,
    /// No handler is registered for this `(schemaId, schemaVersion)`; the
    /// frame is dropped for forward compatibility (§4.2, §7).
    Dropped {
        /// The schema id from the frame header.
        schema_id: uuid::Uuid,
        /// The schema version from the frame header.
        version: i32,
    },
}

/// Per-session registry of `(schemaId, schemaVersion) -> (deserializer,
/// handler)`.
#[derive(Default)]
pub struct IqRegistry {
    entries: HashMap<SchemaKey, Registration>,
}

impl IqRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Register a deserializer and handler for IQ type `T`.
    ///
    /// `handler` receives the decoded body and the frame's `requestId`.
    pub fn register<T>(&mut self, handler: impl Fn(T, i64) + Send + Sync + 'static)
    where
        T: IqBody + Send + Sync + 'static,
        DecodedIq: From<T>,
    {
        let key = SchemaKey::new(T::SCHEMA_ID, T::SCHEMA_VERSION);
        let decode: DecodeFn = Arc::new(|decoder| T::decode_body(decoder).map(DecodedIq::from));
        let handler = Arc::new(handler);
        let handle: HandleFn = Arc::new(move |decoded, request_id| {
            if let Ok(typed) = T::try_from(decoded) {
                handler(typed, request_id);
            }
        });
        self.entries.insert(key, Registration { decode, handle });
    }

    /// Decode the base header, look up its schema key, and on a match
    /// decode the body and invoke the registered handler.
    ///
    /// Unknown schemas are not an error: the frame is dropped and
    /// [`DispatchOutcome::Dropped`] is returned so the caller can log it.
    ///
    /// # Errors
    /// Returns [`SchemaError::BodyDecode`] if the header decodes but the
    /// body does not.
    pub fn dispatch(&self, frame: &[u8]) -> Result<DispatchOutcome, SchemaError> {
        let mut decoder = Decoder::new(frame);
        let header = BinaryHeader::decode(&mut decoder).map_err(|source| {
            SchemaError::BodyDecode {
                schema_id: uuid::Uuid::nil(),
                version: 0,
                source,
            }
        })?;
        let key = header.schema_key();
        let Some(registration) = self.entries.get(&key) else {
            warn!(schema_id = %key.schema_id, version = key.schema_version, "dropping frame for unknown schema");
            return Ok(DispatchOutcome::Dropped {
                schema_id: key.schema_id,
                version: key.schema_version,
            });
        };
        let decoded = (registration.decode)(&mut decoder).map_err(|source| SchemaError::BodyDecode {
            schema_id: key.schema_id,
            version: key.schema_version,
            source,
        })?;
        (registration.handle)(decoded, header.request_id);
        Ok(DispatchOutcome::Handled)
    }

    /// Number of registered schema keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no schemas are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl From<crate::iq::ParticipantInfoIq> for DecodedIq {
    fn from(v: crate::iq::ParticipantInfoIq) -> Self {
        DecodedIq::ParticipantInfo(v)
    }
}
impl From<crate::iq::ParticipantTransferIq> for DecodedIq {
    fn from(v: crate::iq::ParticipantTransferIq) -> Self {
        DecodedIq::ParticipantTransfer(v)
    }
}
impl From<crate::iq::PrepareTransferIq> for DecodedIq {
    fn from(v: crate::iq::PrepareTransferIq) -> Self {
        DecodedIq::PrepareTransfer(v)
    }
}
impl From<crate::iq::OnPrepareTransferIq> for DecodedIq {
    fn from(v: crate::iq::OnPrepareTransferIq) -> Self {
        DecodedIq::OnPrepareTransfer(v)
    }
}
impl From<crate::iq::TransferDoneIq> for DecodedIq {
    fn from(v: crate::iq::TransferDoneIq) -> Self {
        DecodedIq::TransferDone(v)
    }
}
impl From<crate::iq::PushObjectIq> for DecodedIq {
    fn from(v: crate::iq::PushObjectIq) -> Self {
        DecodedIq::PushObject(v)
    }
}
impl From<crate::iq::PushTwincodeIq> for DecodedIq {
    fn from(v: crate::iq::PushTwincodeIq) -> Self {
        DecodedIq::PushTwincode(v)
    }
}
impl From<crate::iq::OnPushObjectIq> for DecodedIq {
    fn from(v: crate::iq::OnPushObjectIq) -> Self {
        DecodedIq::OnPushObject(v)
    }
}
impl From<crate::iq::OnPushTwincodeIq> for DecodedIq {
    fn from(v: crate::iq::OnPushTwincodeIq) -> Self {
        DecodedIq::OnPushTwincode(v)
    }
}

macro_rules! impl_try_from_decoded {
    ($variant:ident, $ty:ty) => {
        impl TryFrom<DecodedIq> for $ty {
            type Error = ();
            fn try_from(value: DecodedIq) -> Result<Self, Self::Error> {
                match value {
                    DecodedIq::$variant(v) => Ok(v),
                    _ => Err(()),
                }
            }
        }
    };
}

impl_try_from_decoded!(ParticipantInfo, crate::iq::ParticipantInfoIq);
impl_try_from_decoded!(ParticipantTransfer, crate::iq::ParticipantTransferIq);
impl_try_from_decoded!(PrepareTransfer, crate::iq::PrepareTransferIq);
impl_try_from_decoded!(OnPrepareTransfer, crate::iq::OnPrepareTransferIq);
impl_try_from_decoded!(TransferDone, crate::iq::TransferDoneIq);
impl_try_from_decoded!(PushObject, crate::iq::PushObjectIq);
impl_try_from_decoded!(PushTwincode, crate::iq::PushTwincodeIq);
impl_try_from_decoded!(OnPushObject, crate::iq::OnPushObjectIq);
impl_try_from_decoded!(OnPushTwincode, crate::iq::OnPushTwincodeIq);

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::iq::ParticipantInfoIq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn unknown_schema_is_dropped_not_an_error() {
        let registry = IqRegistry::new();
        let iq = crate::iq::TransferDoneIq;
        let frame = iq.encode_frame(1).unwrap();
        let outcome = registry.dispatch(&frame).unwrap();
        assert!(matches!(outcome, DispatchOutcome::Dropped { .. }));
    }

    #[test]
    fn registered_schema_invokes_handler_with_decoded_body_and_request_id() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let mut registry = IqRegistry::new();
        registry.register::<ParticipantInfoIq>(move |iq, request_id| {
            assert_eq!(iq.member_id, "m-1");
            assert_eq!(request_id, 9);
            seen.fetch_add(1, Ordering::SeqCst);
        });
        let iq = ParticipantInfoIq {
            member_id: "m-1".into(),
            name: "Alice".into(),
            description: None,
            avatar: None,
        };
        let frame = iq.encode_frame(9).unwrap();
        let outcome = registry.dispatch(&frame).unwrap();
        assert!(matches!(outcome, DispatchOutcome::Handled));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

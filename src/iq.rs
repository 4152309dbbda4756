//! Conversation IQ layer (C6): frame types carried on the data channel,
//! layered on the binary codec (C1) and dispatched through the schema
//! registry (C2).
//!
//! Canonical schema ids are fixed by the wire protocol and MUST NOT change
//! (§6.2).

use crate::codec::{Decoder, Encoder};
use crate::error::CodecError;
use uuid::Uuid;

/// `(schemaId, schemaVersion)` pair used as the registry key (§3, §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SchemaKey {
    /// Canonical schema id.
    pub schema_id: Uuid,
    /// Schema version.
    pub schema_version: i32,
}

impl SchemaKey {
    /// Construct a schema key.
    #[must_use]
    pub fn new(schema_id: Uuid, schema_version: i32) -> Self {
        Self {
            schema_id,
            schema_version,
        }
    }
}

/// Common header every `BinaryPacketIQ` carries before its subtype fields
/// (§3). Produced by the base serializer before any subtype field is
/// written, and consumed by the registry before handing the remaining bytes
/// to a subtype deserializer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinaryHeader {
    /// Schema id.
    pub schema_id: Uuid,
    /// Schema version.
    pub schema_version: i32,
    /// Request correlation id.
    pub request_id: i64,
}

impl BinaryHeader {
    /// Write this header to `encoder`.
    pub fn encode(&self, encoder: &mut Encoder) -> Result<(), CodecError> {
        encoder.write_uuid(&self.schema_id)?;
        encoder.write_int(self.schema_version)?;
        encoder.write_long(self.request_id)
    }

    /// Read a header from `decoder`.
    pub fn decode(decoder: &mut Decoder<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            schema_id: decoder.read_uuid()?,
            schema_version: decoder.read_int()?,
            request_id: decoder.read_long()?,
        })
    }

    /// The `(schema_id, schema_version)` registry key for this header.
    #[must_use]
    pub fn schema_key(&self) -> SchemaKey {
        SchemaKey::new(self.schema_id, self.schema_version)
    }
}

/// A subtype serializable/deserializable on top of a [`BinaryHeader`].
pub trait IqBody: Sized {
    /// Canonical schema id for this type.
    const SCHEMA_ID: Uuid;
    /// Canonical schema version for this type.
    const SCHEMA_VERSION: i32;

    /// Write the subtype's fields, in declared order, after the caller has
    /// already written the base header.
    fn encode_body(&self, encoder: &mut Encoder) -> Result<(), CodecError>;

    /// Read the subtype's fields, in declared order, assuming the caller
    /// has already consumed the base header.
    fn decode_body(decoder: &mut Decoder<'_>) -> Result<Self, CodecError>;

    /// Encode the full frame: base header then subtype fields.
    fn encode_frame(&self, request_id: i64) -> Result<Vec<u8>, CodecError> {
        let mut encoder = Encoder::new();
        let header = BinaryHeader {
            schema_id: Self::SCHEMA_ID,
            schema_version: Self::SCHEMA_VERSION,
            request_id,
        };
        header.encode(&mut encoder)?;
        self.encode_body(&mut encoder)?;
        Ok(encoder.into_bytes())
    }
}

/// `ParticipantInfoIQ` v1 — `a8aa7e0d-c495-4565-89bb-0c5462b54dd0` (§6.2).
///
/// Receiver creates an image handle from `avatar` (JPEG assumed) and updates
/// the participant identity unless the participant is a transfer target
/// that already copied identity from the transferred-from participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantInfoIq {
    /// Stable per-room member id.
    pub member_id: String,
    /// Display name.
    pub name: String,
    /// Optional free-text description.
    pub description: Option<String>,
    /// Optional avatar thumbnail bytes.
    pub avatar: Option<Vec<u8>>,
}

impl IqBody for ParticipantInfoIq {
    const SCHEMA_ID: Uuid = uuid::uuid!("a8aa7e0d-c495-4565-89bb-0c5462b54dd0");
    const SCHEMA_VERSION: i32 = 1;

    fn encode_body(&self, encoder: &mut Encoder) -> Result<(), CodecError> {
        encoder.write_string(&self.member_id)?;
        encoder.write_string(&self.name)?;
        encoder.write_optional_string(self.description.as_deref())?;
        encoder.write_optional_bytes(self.avatar.as_deref())
    }

    fn decode_body(decoder: &mut Decoder<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            member_id: decoder.read_string()?,
            name: decoder.read_string()?,
            description: decoder.read_optional_string()?,
            avatar: decoder.read_optional_bytes()?,
        })
    }
}

/// `ParticipantTransferIQ` v1 — `800fd629-83c4-4d42-8910-1b4256d19eb8` (§6.2).
///
/// Announces transfer intent; receipt latches `transferToMemberId` on the
/// session and notifies the Call (§4.5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantTransferIq {
    /// Target member id of the transfer.
    pub member_id: String,
}

impl IqBody for ParticipantTransferIq {
    const SCHEMA_ID: Uuid = uuid::uuid!("800fd629-83c4-4d42-8910-1b4256d19eb8");
    const SCHEMA_VERSION: i32 = 1;

    fn encode_body(&self, encoder: &mut Encoder) -> Result<(), CodecError> {
        encoder.write_string(&self.member_id)
    }

    fn decode_body(decoder: &mut Decoder<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            member_id: decoder.read_string()?,
        })
    }
}

/// `PrepareTransferIQ` v1 — `9eaa4ad1-3404-4bcc-875d-dc75c748e188` (§6.2).
/// Payload-less beyond the base header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PrepareTransferIq;

impl IqBody for PrepareTransferIq {
    const SCHEMA_ID: Uuid = uuid::uuid!("9eaa4ad1-3404-4bcc-875d-dc75c748e188");
    const SCHEMA_VERSION: i32 = 1;

    fn encode_body(&self, _encoder: &mut Encoder) -> Result<(), CodecError> {
        Ok(())
    }

    fn decode_body(_decoder: &mut Decoder<'_>) -> Result<Self, CodecError> {
        Ok(Self)
    }
}

/// `OnPrepareTransferIQ` v1 — `a17516a2-4bd2-4284-9535-726b6eb1a211` (§6.2).
/// Payload-less beyond the base header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OnPrepareTransferIq;

impl IqBody for OnPrepareTransferIq {
    const SCHEMA_ID: Uuid = uuid::uuid!("a17516a2-4bd2-4284-9535-726b6eb1a211");
    const SCHEMA_VERSION: i32 = 1;

    fn encode_body(&self, _encoder: &mut Encoder) -> Result<(), CodecError> {
        Ok(())
    }

    fn decode_body(_decoder: &mut Decoder<'_>) -> Result<Self, CodecError> {
        Ok(Self)
    }
}

/// `TransferDoneIQ` v1 — `641bf1f6-ebbf-4501-9151-76abc1b9adad` (§6.2).
///
/// Per the Open Question resolution in `SPEC_FULL.md` §12.3, the base
/// header's `requestId` is the only payload; this type carries no fields
/// of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferDoneIq;

impl IqBody for TransferDoneIq {
    const SCHEMA_ID: Uuid = uuid::uuid!("641bf1f6-ebbf-4501-9151-76abc1b9adad");
    const SCHEMA_VERSION: i32 = 1;

    fn encode_body(&self, _encoder: &mut Encoder) -> Result<(), CodecError> {
        Ok(())
    }

    fn decode_body(_decoder: &mut Decoder<'_>) -> Result<Self, CodecError> {
        Ok(Self)
    }
}

/// Canonical message schema id embedded in `PushObjectIq`'s inner object
/// (§4.6). A push whose inner `schema_id` differs from this is dropped.
pub const MESSAGE_SCHEMA_ID: Uuid = uuid::uuid!("c1ba9e82-43a7-413a-ab9f-b743859e7595");

/// The `(schemaId, version)` pair embedded inside a push IQ's inner object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InnerSchema {
    /// Inner object schema id.
    pub schema_id: Uuid,
    /// Inner object schema version.
    pub version: i32,
}

/// A reply-to reference: the sequence id within the referenced sender's
/// stream plus that sender's id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyTo {
    /// Sender id being replied to.
    pub sender_id: Uuid,
    /// Sequence id within that sender's stream.
    pub sequence_id: i64,
}

/// `PushObjectIQ` v5 — `26e3a3bd-7db0-4fc5-9857-bbdb2032960e` (§6.2).
///
/// Conversation message descriptor. If `inner.schema_id` is not
/// [`MESSAGE_SCHEMA_ID`] the message is dropped by the caller after
/// decoding (decoding itself always succeeds; the drop decision is the
/// handler's, per §4.6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushObjectIq {
    /// Sender id.
    pub sender_id: Uuid,
    /// Monotonic sequence id within the sender's stream.
    pub sequence_id: i64,
    /// Optional explicit recipient (absent ⇒ broadcast to the call).
    pub send_to: Option<Uuid>,
    /// Optional reference to a message being replied to.
    pub reply_to: Option<ReplyTo>,
    /// Creation timestamp, epoch milliseconds.
    pub created: i64,
    /// Send timestamp, epoch milliseconds.
    pub sent: i64,
    /// Expiry window, milliseconds.
    pub expire_timeout: i64,
    /// Inner object schema descriptor.
    pub inner: InnerSchema,
    /// Message text.
    pub message: String,
    /// Whether the recipient may copy this message.
    pub copy_allowed: bool,
}

impl IqBody for PushObjectIq {
    const SCHEMA_ID: Uuid = uuid::uuid!("26e3a3bd-7db0-4fc5-9857-bbdb2032960e");
    const SCHEMA_VERSION: i32 = 5;

    fn encode_body(&self, encoder: &mut Encoder) -> Result<(), CodecError> {
        encoder.write_uuid(&self.sender_id)?;
        encoder.write_long(self.sequence_id)?;
        encoder.write_optional_uuid(self.send_to.as_ref())?;
        match &self.reply_to {
            None => encoder.write_bool(false)?,
            Some(r) => {
                encoder.write_bool(true)?;
                encoder.write_uuid(&r.sender_id)?;
                encoder.write_long(r.sequence_id)?;
            }
        }
        encoder.write_long(self.created)?;
        encoder.write_long(self.sent)?;
        encoder.write_long(self.expire_timeout)?;
        encoder.write_uuid(&self.inner.schema_id)?;
        encoder.write_int(self.inner.version)?;
        encoder.write_string(&self.message)?;
        encoder.write_bool(self.copy_allowed)
    }

    fn decode_body(decoder: &mut Decoder<'_>) -> Result<Self, CodecError> {
        let sender_id = decoder.read_uuid()?;
        let sequence_id = decoder.read_long()?;
        let send_to = decoder.read_optional_uuid()?;
        let reply_to = if decoder.read_bool()? {
            Some(ReplyTo {
                sender_id: decoder.read_uuid()?,
                sequence_id: decoder.read_long()?,
            })
        } else {
            None
        };
        let created = decoder.read_long()?;
        let sent = decoder.read_long()?;
        let expire_timeout = decoder.read_long()?;
        let inner = InnerSchema {
            schema_id: decoder.read_uuid()?,
            version: decoder.read_int()?,
        };
        let message = decoder.read_string()?;
        let copy_allowed = decoder.read_bool()?;
        Ok(Self {
            sender_id,
            sequence_id,
            send_to,
            reply_to,
            created,
            sent,
            expire_timeout,
            inner,
            message,
            copy_allowed,
        })
    }
}

/// `PushTwincodeIQ` v2 — `72863c61-c0a9-437b-8b88-3b78354e54b8` (§6.2).
///
/// Shares `PushObjectIq`'s header fields plus a twincode id and its own
/// schema/copy-allowed pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushTwincodeIq {
    /// Sender id.
    pub sender_id: Uuid,
    /// Monotonic sequence id within the sender's stream.
    pub sequence_id: i64,
    /// Optional explicit recipient.
    pub send_to: Option<Uuid>,
    /// Optional reference to a message being replied to.
    pub reply_to: Option<ReplyTo>,
    /// Creation timestamp, epoch milliseconds.
    pub created: i64,
    /// Send timestamp, epoch milliseconds.
    pub sent: i64,
    /// Expiry window, milliseconds.
    pub expire_timeout: i64,
    /// The twincode being pushed.
    pub twincode_id: Uuid,
    /// Schema id describing the twincode payload.
    pub schema_id: Uuid,
    /// Whether the recipient may copy this twincode.
    pub copy_allowed: bool,
}

impl IqBody for PushTwincodeIq {
    const SCHEMA_ID: Uuid = uuid::uuid!("72863c61-c0a9-437b-8b88-3b78354e54b8");
    const SCHEMA_VERSION: i32 = 2;

    fn encode_body(&self, encoder: &mut Encoder) -> Result<(), CodecError> {
        encoder.write_uuid(&self.sender_id)?;
        encoder.write_long(self.sequence_id)?;
        encoder.write_optional_uuid(self.send_to.as_ref())?;
        match &self.reply_to {
            None => encoder.write_bool(false)?,
            Some(r) => {
                encoder.write_bool(true)?;
                encoder.write_uuid(&r.sender_id)?;
                encoder.write_long(r.sequence_id)?;
            }
        }
        encoder.write_long(self.created)?;
        encoder.write_long(self.sent)?;
        encoder.write_long(self.expire_timeout)?;
        encoder.write_uuid(&self.twincode_id)?;
        encoder.write_uuid(&self.schema_id)?;
        encoder.write_bool(self.copy_allowed)
    }

    fn decode_body(decoder: &mut Decoder<'_>) -> Result<Self, CodecError> {
        let sender_id = decoder.read_uuid()?;
        let sequence_id = decoder.read_long()?;
        let send_to = decoder.read_optional_uuid()?;
        let reply_to = if decoder.read_bool()? {
            Some(ReplyTo {
                sender_id: decoder.read_uuid()?,
                sequence_id: decoder.read_long()?,
            })
        } else {
            None
        };
        let created = decoder.read_long()?;
        let sent = decoder.read_long()?;
        let expire_timeout = decoder.read_long()?;
        let twincode_id = decoder.read_uuid()?;
        let schema_id = decoder.read_uuid()?;
        let copy_allowed = decoder.read_bool()?;
        Ok(Self {
            sender_id,
            sequence_id,
            send_to,
            reply_to,
            created,
            sent,
            expire_timeout,
            twincode_id,
            schema_id,
            copy_allowed,
        })
    }
}

/// `OnPushObjectIQ` v3 — `f95ac4b5-d20f-4e1f-8204-6d146dd5291e` (§6.2).
/// Ack for a `PushObjectIq`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OnPushObjectIq {
    /// Receiver device state at ack time.
    pub device_state: i32,
    /// Epoch milliseconds the push was received.
    pub received_timestamp: i64,
}

impl IqBody for OnPushObjectIq {
    const SCHEMA_ID: Uuid = uuid::uuid!("f95ac4b5-d20f-4e1f-8204-6d146dd5291e");
    const SCHEMA_VERSION: i32 = 3;

    fn encode_body(&self, encoder: &mut Encoder) -> Result<(), CodecError> {
        encoder.write_int(self.device_state)?;
        encoder.write_long(self.received_timestamp)
    }

    fn decode_body(decoder: &mut Decoder<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            device_state: decoder.read_int()?,
            received_timestamp: decoder.read_long()?,
        })
    }
}

/// `OnPushTwincodeIQ` v2 — `e6726692-8fe6-4d29-ae64-ba321d44a247` (§6.2).
/// Ack for a `PushTwincodeIq`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OnPushTwincodeIq {
    /// Receiver device state at ack time.
    pub device_state: i32,
    /// Epoch milliseconds the push was received.
    pub received_timestamp: i64,
}

impl IqBody for OnPushTwincodeIq {
    const SCHEMA_ID: Uuid = uuid::uuid!("e6726692-8fe6-4d29-ae64-ba321d44a247");
    const SCHEMA_VERSION: i32 = 2;

    fn encode_body(&self, encoder: &mut Encoder) -> Result<(), CodecError> {
        encoder.write_int(self.device_state)?;
        encoder.write_long(self.received_timestamp)
    }

    fn decode_body(decoder: &mut Decoder<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            device_state: decoder.read_int()?,
            received_timestamp: decoder.read_long()?,
        })
    }
}

/// A decoded IQ frame, tagged by concrete type, produced by the registry
/// (C2) once the base header has been matched to a known schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedIq {
    /// `ParticipantInfoIQ`.
    ParticipantInfo(ParticipantInfoIq),
    /// `ParticipantTransferIQ`.
    ParticipantTransfer(ParticipantTransferIq),
    /// `PrepareTransferIQ`.
    PrepareTransfer(PrepareTransferIq),
    /// `OnPrepareTransferIQ`.
    OnPrepareTransfer(OnPrepareTransferIq),
    /// `TransferDoneIQ`.
    TransferDone(TransferDoneIq),
    /// `PushObjectIQ`.
    PushObject(PushObjectIq),
    /// `PushTwincodeIQ`.
    PushTwincode(PushTwincodeIq),
    /// `OnPushObjectIQ`.
    OnPushObject(OnPushObjectIq),
    /// `OnPushTwincodeIQ`.
    OnPushTwincode(OnPushTwincodeIq),
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn participant_info_round_trips_through_header_and_body() {
        let iq = ParticipantInfoIq {
            member_id: "m-1".into(),
            name: "Alice".into(),
            description: Some("hi".into()),
            avatar: Some(vec![1, 2, 3]),
        };
        let frame = iq.encode_frame(42).unwrap();
        let mut decoder = Decoder::new(&frame);
        let header = BinaryHeader::decode(&mut decoder).unwrap();
        assert_eq!(header.schema_id, ParticipantInfoIq::SCHEMA_ID);
        assert_eq!(header.schema_version, 1);
        assert_eq!(header.request_id, 42);
        let decoded = ParticipantInfoIq::decode_body(&mut decoder).unwrap();
        assert_eq!(decoded, iq);
    }

    #[test]
    fn transfer_done_has_no_body_fields() {
        let iq = TransferDoneIq;
        let frame = iq.encode_frame(7).unwrap();
        let mut decoder = Decoder::new(&frame);
        let header = BinaryHeader::decode(&mut decoder).unwrap();
        assert_eq!(header.request_id, 7);
        assert_eq!(decoder.remaining(), 0);
    }

    #[test]
    fn push_object_drops_when_inner_schema_mismatches() {
        let iq = PushObjectIq {
            sender_id: Uuid::new_v4(),
            sequence_id: 1,
            send_to: None,
            reply_to: None,
            created: 0,
            sent: 0,
            expire_timeout: 0,
            inner: InnerSchema {
                schema_id: Uuid::new_v4(),
                version: 1,
            },
            message: "hi".into(),
            copy_allowed: true,
        };
        assert_ne!(iq.inner.schema_id, MESSAGE_SCHEMA_ID);
    }
}

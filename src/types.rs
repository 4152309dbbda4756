//! Shared data model (§3): identifiers, capability offers, participants,
//! call status, terminate reasons, and the data-channel label format.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use uuid::Uuid;

/// Stable handle for a peer session, used instead of a direct reference so
/// the Call can own sessions in a map and hand out cheap, `Copy` keys
/// (§9 "cyclic ownership").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Allocate a fresh session handle.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier for a logical Call (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(pub Uuid);

impl CallId {
    /// Allocate a fresh call id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A value that is either not-yet-known, or known (§9 "optional/nullable
/// state" — model each tri-state field as a sum type, never a sentinel).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Tri<T> {
    /// Not yet known.
    Unknown,
    /// Known value.
    Known(T),
}

impl<T> Tri<T> {
    /// Borrow the known value, if any.
    pub fn known(&self) -> Option<&T> {
        match self {
            Tri::Unknown => None,
            Tri::Known(v) => Some(v),
        }
    }

    /// True if a value has been latched.
    #[must_use]
    pub fn is_known(&self) -> bool {
        matches!(self, Tri::Known(_))
    }
}

impl<T> Default for Tri<T> {
    fn default() -> Self {
        Tri::Unknown
    }
}

/// Semantic version, `MAJOR.MINOR.PATCH` (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Version {
    /// Major component.
    pub major: u32,
    /// Minor component.
    pub minor: u32,
    /// Patch component.
    pub patch: u32,
}

impl Version {
    /// Construct a version directly.
    #[must_use]
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parse a `MAJOR.MINOR.PATCH` string.
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        let patch = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self::new(major, minor, patch))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Capability advertisement carried with session-initiate / session-accept
/// (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offer {
    /// Audio capability.
    pub audio: bool,
    /// Video capability.
    pub video: bool,
    /// Data-channel capability.
    pub data: bool,
    /// Mesh group-call support; `None` ⇒ derive from `version.major >= 2`.
    pub group: Option<bool>,
    /// Call-transfer support.
    pub transfer: Option<bool>,
    /// Peer version.
    pub version: Version,
}

impl Offer {
    /// Whether the peer supports mesh group calls: the explicit `group`
    /// field if present, otherwise derived from the major version (§3).
    #[must_use]
    pub fn supports_group(&self) -> bool {
        self.group.unwrap_or(self.version.major >= 2)
    }

    /// Whether the peer supports call transfer.
    #[must_use]
    pub fn supports_transfer(&self) -> bool {
        self.transfer.unwrap_or(false)
    }
}

/// One entry of a `transport-info` candidate list (§3, §6.1).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportCandidate {
    /// Raw ICE candidate line.
    pub candidate: String,
    /// SDP media id.
    pub sdp_mid: String,
    /// SDP media line index.
    pub sdp_mline_index: i32,
    /// True if this entry removes a previously-announced candidate.
    #[serde(default)]
    pub removed: bool,
}

impl TransportCandidate {
    /// Extract the ICE username fragment by locating ` ufrag ` in the
    /// candidate line and taking the next whitespace-delimited token
    /// (§3).
    #[must_use]
    pub fn ufrag(&self) -> Option<&str> {
        let idx = self.candidate.find(" ufrag ")?;
        let rest = &self.candidate[idx + " ufrag ".len()..];
        rest.split_whitespace().next()
    }
}

/// Known data-channel capability tokens (§3). Unknown tokens are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    /// Mesh group-call support.
    Group,
    /// Call-transfer support.
    Transfer,
    /// Conversation message push support.
    Message,
    /// Media stream renegotiation support.
    Stream,
}

/// Parsed data-channel label: `CallService:<version>:<cap>,<cap>,...`
/// (§3, §6.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataChannelLabel {
    /// Data-channel protocol version.
    pub version: String,
    /// Parsed, recognized capabilities. Unknown tokens are dropped.
    pub capabilities: HashSet<Capability>,
}

/// The canonical label this core emits on its own outbound data channel
/// (§6.2).
pub const DATA_CHANNEL_LABEL: &str = "CallService:1.3.0:group,transfer,message";

impl DataChannelLabel {
    /// Parse a label by splitting on `:` then `,`; unknown capability
    /// tokens are ignored (§3).
    #[must_use]
    pub fn parse(label: &str) -> Option<Self> {
        let mut parts = label.splitn(3, ':');
        let service = parts.next()?;
        if service != "CallService" {
            return None;
        }
        let version = parts.next()?.to_string();
        let caps = parts.next().unwrap_or("");
        let capabilities = caps
            .split(',')
            .filter_map(|tok| match tok {
                "group" => Some(Capability::Group),
                "transfer" => Some(Capability::Transfer),
                "message" => Some(Capability::Message),
                "stream" => Some(Capability::Stream),
                _ => None,
            })
            .collect();
        Some(Self {
            version,
            capabilities,
        })
    }

    /// True if the `message` capability token was present.
    #[must_use]
    pub fn supports_message(&self) -> bool {
        self.capabilities.contains(&Capability::Message)
    }
}

/// Identity of a remote endpoint within a Call (§3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    /// Locally assigned, monotonic within the owning Call.
    pub participant_id: u64,
    /// Display name.
    pub name: Option<String>,
    /// Free-text description.
    pub description: Option<String>,
    /// Avatar URL derived from received thumbnail bytes.
    pub avatar_url: Option<String>,
    /// Whether the participant's microphone is muted.
    pub audio_muted: bool,
    /// Whether the participant's camera is muted.
    pub camera_muted: bool,
    /// Remote video width, if known.
    pub video_width: Option<u32>,
    /// Remote video height, if known.
    pub video_height: Option<u32>,
    /// Sender id, latched on first identity push.
    pub sender_id: Tri<Uuid>,
    /// True if this participant is a transfer target/source.
    pub transfer: bool,
    /// Previous participant id this one was transferred from, if any.
    pub transferred_from_participant_id: Option<u64>,
}

impl Participant {
    /// Construct a bare participant for a freshly created session.
    #[must_use]
    pub fn new(participant_id: u64) -> Self {
        Self {
            participant_id,
            name: None,
            description: None,
            avatar_url: None,
            audio_muted: false,
            camera_muted: false,
            video_width: None,
            video_height: None,
            sender_id: Tri::Unknown,
            transfer: false,
            transferred_from_participant_id: None,
        }
    }
}

/// Call status (GLOSSARY).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallStatus {
    /// No active call.
    Idle,
    /// Incoming audio call, not yet answered.
    IncomingCall,
    /// Incoming video call, not yet answered.
    IncomingVideoCall,
    /// Incoming video call still ringing (bell only, no preview yet).
    IncomingVideoBell,
    /// Incoming audio call accepted, connecting.
    AcceptedIncomingCall,
    /// Incoming video call accepted, connecting.
    AcceptedIncomingVideoCall,
    /// Outgoing audio call, ringing.
    OutgoingCall,
    /// Outgoing video call, ringing.
    OutgoingVideoCall,
    /// Outgoing video call, bell phase.
    OutgoingVideoBell,
    /// Outgoing audio call accepted, connecting.
    AcceptedOutgoingCall,
    /// Outgoing video call accepted, connecting.
    AcceptedOutgoingVideoCall,
    /// Active audio call.
    InCall,
    /// Active video call.
    InVideoCall,
    /// Active video call, bell phase.
    InVideoBell,
    /// Degraded to a fallback mode (e.g. video fell back to audio).
    Fallback,
    /// Call has ended.
    Terminated,
}

impl CallStatus {
    /// Collapse to the active state for this status's modality (§GLOSSARY).
    #[must_use]
    pub fn to_active(self) -> Self {
        if self.is_video() {
            CallStatus::InVideoCall
        } else {
            CallStatus::InCall
        }
    }

    /// Choose the matching `ACCEPTED_*` variant for an incoming or outgoing
    /// status (§GLOSSARY).
    #[must_use]
    pub fn to_accepted(self) -> Self {
        match self {
            CallStatus::IncomingCall | CallStatus::IncomingVideoBell => {
                CallStatus::AcceptedIncomingCall
            }
            CallStatus::IncomingVideoCall => CallStatus::AcceptedIncomingVideoCall,
            CallStatus::OutgoingCall | CallStatus::OutgoingVideoBell => {
                CallStatus::AcceptedOutgoingCall
            }
            CallStatus::OutgoingVideoCall => CallStatus::AcceptedOutgoingVideoCall,
            other => other,
        }
    }

    /// True for any video-suffixed state.
    #[must_use]
    pub fn is_video(self) -> bool {
        matches!(
            self,
            CallStatus::IncomingVideoCall
                | CallStatus::IncomingVideoBell
                | CallStatus::AcceptedIncomingVideoCall
                | CallStatus::OutgoingVideoCall
                | CallStatus::OutgoingVideoBell
                | CallStatus::AcceptedOutgoingVideoCall
                | CallStatus::InVideoCall
                | CallStatus::InVideoBell
        )
    }
}

/// Terminate reason, exit-code equivalent (§6.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TerminateReason {
    /// Peer was busy.
    Busy,
    /// Call was cancelled before being answered.
    Cancel,
    /// ICE/media connectivity failed.
    ConnectivityError,
    /// Peer declined.
    Decline,
    /// Peer connection closed unexpectedly.
    Disconnected,
    /// Unclassified failure.
    GeneralError,
    /// Referenced session id is no longer known to the peer.
    Gone,
    /// Session was revoked by the gateway.
    Revoked,
    /// Normal completion.
    Success,
    /// A timer (call or connect) expired.
    Expired,
    /// Authorization check failed.
    NotAuthorized,
    /// Call transfer completed; source may terminate.
    TransferDone,
    /// Call scheduled for a later time.
    Schedule,
    /// Reason not classified by the peer.
    Unknown,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn offer_group_derives_from_major_version_when_absent() {
        let v1 = Offer {
            audio: true,
            video: false,
            data: true,
            group: None,
            transfer: None,
            version: Version::new(1, 0, 0),
        };
        assert!(!v1.supports_group());

        let v2 = Offer {
            version: Version::new(2, 0, 0),
            ..v1
        };
        assert!(v2.supports_group());

        let explicit = Offer {
            group: Some(true),
            ..v1
        };
        assert!(explicit.supports_group());
    }

    #[test]
    fn version_parses_major_minor_patch() {
        assert_eq!(Version::parse("1.3.0"), Some(Version::new(1, 3, 0)));
        assert_eq!(Version::parse("1.3"), None);
        assert_eq!(Version::parse("bogus"), None);
    }

    #[test]
    fn data_channel_label_parses_known_capabilities_and_ignores_unknown() {
        let label = DataChannelLabel::parse("CallService:1.3.0:group,transfer,bogus,message").unwrap();
        assert_eq!(label.version, "1.3.0");
        assert!(label.capabilities.contains(&Capability::Group));
        assert!(label.capabilities.contains(&Capability::Transfer));
        assert!(label.capabilities.contains(&Capability::Message));
        assert_eq!(label.capabilities.len(), 3);
        assert!(label.supports_message());
    }

    #[test]
    fn data_channel_label_rejects_wrong_service_name() {
        assert!(DataChannelLabel::parse("OtherService:1.0.0:group").is_none());
    }

    #[test]
    fn ufrag_extracted_from_candidate_line() {
        let candidate = TransportCandidate {
            candidate: "candidate:1 1 UDP 2130706431 10.0.0.1 54321 typ host ufrag abcd generation 0"
                .to_string(),
            sdp_mid: "0".to_string(),
            sdp_mline_index: 0,
            removed: false,
        };
        assert_eq!(candidate.ufrag(), Some("abcd"));
    }

    #[test]
    fn ufrag_absent_is_none() {
        let candidate = TransportCandidate {
            candidate: "candidate:1 1 UDP 2130706431 10.0.0.1 54321 typ host".to_string(),
            sdp_mid: "0".to_string(),
            sdp_mline_index: 0,
            removed: false,
        };
        assert_eq!(candidate.ufrag(), None);
    }

    #[test]
    fn call_status_to_active_collapses_by_modality() {
        assert_eq!(CallStatus::AcceptedIncomingCall.to_active(), CallStatus::InCall);
        assert_eq!(
            CallStatus::AcceptedOutgoingVideoCall.to_active(),
            CallStatus::InVideoCall
        );
    }

    #[test]
    fn call_status_to_accepted_picks_matching_variant() {
        assert_eq!(
            CallStatus::IncomingCall.to_accepted(),
            CallStatus::AcceptedIncomingCall
        );
        assert_eq!(
            CallStatus::OutgoingVideoCall.to_accepted(),
            CallStatus::AcceptedOutgoingVideoCall
        );
    }

    #[test]
    fn terminate_reason_serializes_kebab_case() {
        let json = serde_json::to_string(&TerminateReason::ConnectivityError).unwrap();
        assert_eq!(json, "\"connectivity-error\"");
        let json = serde_json::to_string(&TerminateReason::NotAuthorized).unwrap();
        assert_eq!(json, "\"not-authorized\"");
    }

    #[test]
    fn tri_state_distinguishes_unknown_from_known() {
        let t: Tri<bool> = Tri::Unknown;
        assert!(!t.is_known());
        let t = Tri::Known(true);
        assert_eq!(t.known(), Some(&true));
    }
}

//! Call aggregator (C5): routes gateway messages to peer sessions (C4),
//! enforces the single-active-call and room-authorization invariants, and
//! drives the call-transfer lifecycle over the conversation IQ layer (C6)
//! (§4.5).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};

use crate::error::CallError;
use crate::peer_session::PeerSession;
use crate::signaling::{ActiveCallQuery, MemberEntry, MemberStatus};
use crate::types::{CallId, CallStatus, Participant, SessionId};

/// §4.5: grace period after the last session in a call terminates, before
/// the Call itself is torn down.
pub const FINISH_TIMEOUT: Duration = Duration::from_secs(3);

/// Idempotency bit for the `session-accept` emission (§4.5, §8
/// "idempotence").
const OP_SESSION_ACCEPT: u64 = 1 << 0;
/// Idempotency bit for the transfer-done emission.
const OP_TRANSFER_DONE: u64 = 1 << 1;

/// Direction of an in-flight call transfer (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    /// This call is the transfer source; its session will terminate once
    /// the target confirms.
    Outgoing,
    /// This call is the transfer target, freshly created to receive the
    /// transferred session.
    Incoming,
}

/// Events the aggregator surfaces to the application layer over a
/// broadcast channel, mirroring the transport's `subscribe` idiom (§4.3).
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// A participant was added to the roster.
    ParticipantAdded(u64),
    /// A participant's fields changed.
    ParticipantUpdated(u64),
    /// A participant left the roster.
    ParticipantRemoved(u64),
    /// The call's aggregate status changed.
    StatusChanged(CallStatus),
    /// The peer requested a transfer to `member_id` (§4.6
    /// `ParticipantTransferIQ`).
    TransferRequested {
        /// Member id the call is being transferred to.
        member_id: String,
    },
    /// The transfer target acknowledged readiness (§4.6
    /// `OnPrepareTransferIQ`).
    TransferReady,
    /// The transfer completed; the source session may terminate.
    TransferCompleted,
    /// The last session left and the finish timer fired; the call is torn
    /// down.
    Terminated,
}

/// One active, possibly multi-party, call (§3, §4.5).
pub struct Call {
    /// Identifier for this call.
    pub id: CallId,
    sessions: RwLock<HashMap<SessionId, Arc<PeerSession>>>,
    participants: RwLock<HashMap<u64, Participant>>,
    next_participant_id: AtomicU64,
    status: RwLock<CallStatus>,
    /// Member ids for which a `PrepareTransferIQ` was sent and an
    /// `OnPrepareTransferIQ` is outstanding.
    pending_prepare_transfers: RwLock<HashSet<String>>,
    transfer_direction: RwLock<Option<TransferDirection>>,
    events_tx: broadcast::Sender<CallEvent>,
    operation_flags: AtomicU64,
    /// Roster member id -> locally assigned participant id, since
    /// `join-callroom`/`member-join` key by `memberId` while participants
    /// are keyed by a local handle (§6.1, §3).
    member_ids: RwLock<HashMap<String, u64>>,
}

impl Call {
    fn new(status: CallStatus) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(256);
        Arc::new(Self {
            id: CallId::new(),
            sessions: RwLock::new(HashMap::new()),
            participants: RwLock::new(HashMap::new()),
            next_participant_id: AtomicU64::new(1),
            status: RwLock::new(status),
            pending_prepare_transfers: RwLock::new(HashSet::new()),
            transfer_direction: RwLock::new(None),
            events_tx,
            operation_flags: AtomicU64::new(0),
            member_ids: RwLock::new(HashMap::new()),
        })
    }

    /// Subscribe to this call's events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events_tx.subscribe()
    }

    /// Current aggregate status.
    pub async fn status(&self) -> CallStatus {
        *self.status.read().await
    }

    /// Set the aggregate status and notify subscribers.
    pub async fn set_status(&self, status: CallStatus) {
        *self.status.write().await = status;
        let _ = self.events_tx.send(CallEvent::StatusChanged(status));
    }

    /// Route a session into this call, allocating a fresh participant for
    /// it.
    pub async fn add_session(self: &Arc<Self>, session: Arc<PeerSession>) -> u64 {
        let participant_id = self.next_participant_id.fetch_add(1, Ordering::SeqCst);
        self.participants
            .write()
            .await
            .insert(participant_id, Participant::new(participant_id));
        self.sessions.write().await.insert(session.handle, session);
        let _ = self.events_tx.send(CallEvent::ParticipantAdded(participant_id));
        participant_id
    }

    /// Look up a session by its local handle.
    pub async fn session(&self, session_id: SessionId) -> Option<Arc<PeerSession>> {
        self.sessions.read().await.get(&session_id).cloned()
    }

    /// Remove a session (it has terminated). If this drains the last
    /// session, arms the finish timer (§4.5).
    pub async fn remove_session(self: &Arc<Self>, session_id: SessionId) {
        self.sessions.write().await.remove(&session_id);
        if self.sessions.read().await.is_empty() {
            self.arm_finish_timer();
        }
    }

    fn arm_finish_timer(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(FINISH_TIMEOUT).await;
            if this.sessions.read().await.is_empty() {
                let _ = this.set_status_terminated().await;
            }
        });
    }

    async fn set_status_terminated(self: &Arc<Self>) {
        *self.status.write().await = CallStatus::Terminated;
        let _ = self.events_tx.send(CallEvent::Terminated);
    }

    /// Apply a `join-callroom`/`member-join` roster delta (§6.1).
    pub async fn apply_roster(&self, members: Vec<MemberEntry>) {
        let mut participants = self.participants.write().await;
        let mut member_ids = self.member_ids.write().await;
        for entry in members {
            match entry.status {
                MemberStatus::MemberNew | MemberStatus::MemberNeedSession => {
                    if member_ids.contains_key(&entry.member_id) {
                        continue;
                    }
                    let id = self.next_participant_id.fetch_add(1, Ordering::SeqCst);
                    participants.insert(id, Participant::new(id));
                    member_ids.insert(entry.member_id, id);
                    let _ = self.events_tx.send(CallEvent::ParticipantAdded(id));
                }
                MemberStatus::MemberDelete => {
                    if let Some(id) = member_ids.remove(&entry.member_id) {
                        participants.remove(&id);
                        let _ = self.events_tx.send(CallEvent::ParticipantRemoved(id));
                    }
                }
            }
        }
    }

    /// Handle a received `ParticipantTransferIQ` (§4.6): latch the
    /// target and notify subscribers.
    pub fn handle_participant_transfer(&self, member_id: String) {
        let _ = self
            .events_tx
            .send(CallEvent::TransferRequested { member_id });
    }

    /// Handle a received `PrepareTransferIQ`: track that a reply is owed
    /// once the local side is ready, keyed by `member_id`.
    pub async fn handle_prepare_transfer(&self, member_id: String) {
        self.pending_prepare_transfers
            .write()
            .await
            .insert(member_id);
    }

    /// Handle a received `OnPrepareTransferIQ`: the named member confirmed
    /// readiness; clears the pending entry.
    pub async fn handle_on_prepare_transfer(&self, member_id: &str) {
        self.pending_prepare_transfers.write().await.remove(member_id);
        let _ = self.events_tx.send(CallEvent::TransferReady);
    }

    /// Handle a received `TransferDoneIQ`: idempotent — a duplicate is a
    /// no-op (§8).
    pub fn handle_transfer_done(&self) -> bool {
        if self.operation_flags.fetch_or(OP_TRANSFER_DONE, Ordering::SeqCst) & OP_TRANSFER_DONE != 0 {
            return false;
        }
        let _ = self.events_tx.send(CallEvent::TransferCompleted);
        true
    }

    /// Mark this call's transfer direction (§4.5).
    pub async fn set_transfer_direction(&self, direction: TransferDirection) {
        *self.transfer_direction.write().await = Some(direction);
    }

    /// Current transfer direction, if a transfer is in flight.
    pub async fn transfer_direction(&self) -> Option<TransferDirection> {
        *self.transfer_direction.read().await
    }

    /// Record that `session-accept` was emitted for this call; returns
    /// `false` if it had already been emitted (§8 idempotence).
    pub fn mark_session_accept_sent(&self) -> bool {
        self.operation_flags.fetch_or(OP_SESSION_ACCEPT, Ordering::SeqCst) & OP_SESSION_ACCEPT == 0
    }

    /// Number of sessions currently routed to this call.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

/// Routes incoming and outgoing session traffic to at most one active
/// [`Call`], enforcing the authorization and single-active-call
/// invariants from §4.5.
pub struct CallAggregator {
    /// The room subdomain this client answers incoming calls for.
    local_room_subdomain: String,
    active_call: RwLock<Option<Arc<Call>>>,
    sessions_by_peer: RwLock<HashMap<String, SessionId>>,
    /// Gateway-assigned `sessionId -> SessionId` index, the second
    /// routing index §4.5 "Routing" requires alongside `sessions_by_peer`.
    /// Populated as soon as a gateway session id becomes known: on the
    /// `session-initiate-response` that assigns one for an outgoing
    /// session, or immediately for an incoming one (the gateway already
    /// assigns the id before relaying `session-initiate`).
    sessions_by_gateway_id: RwLock<HashMap<String, SessionId>>,
}

impl CallAggregator {
    /// Construct an aggregator bound to the given room subdomain, used to
    /// authorize incoming `session-initiate`s (§4.5).
    #[must_use]
    pub fn new(local_room_subdomain: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            local_room_subdomain: local_room_subdomain.into(),
            active_call: RwLock::new(None),
            sessions_by_peer: RwLock::new(HashMap::new()),
            sessions_by_gateway_id: RwLock::new(HashMap::new()),
        })
    }

    /// True if `room_subdomain` matches the locally configured value
    /// (§4.5 "incoming session-initiate room-subdomain authorization").
    #[must_use]
    pub fn is_authorized(&self, room_subdomain: &str) -> bool {
        room_subdomain == self.local_room_subdomain
    }

    /// The currently active call, if any.
    pub async fn active_call(&self) -> Option<Arc<Call>> {
        self.active_call.read().await.clone()
    }

    /// Begin an outgoing call. Fails with [`CallError::AlreadyActive`] if
    /// a call is already in progress (§4.5 "outgoing call active-call
    /// guard").
    ///
    /// # Errors
    /// Returns [`CallError::AlreadyActive`] if a call already exists.
    pub async fn begin_outgoing_call(
        &self,
        session: Arc<PeerSession>,
        peer_id: String,
    ) -> Result<Arc<Call>, CallError> {
        let mut active = self.active_call.write().await;
        if active.is_some() {
            return Err(CallError::AlreadyActive);
        }
        let call = Call::new(CallStatus::OutgoingCall);
        call.add_session(session.clone()).await;
        self.sessions_by_peer
            .write()
            .await
            .insert(peer_id, session.handle);
        *active = Some(Arc::clone(&call));
        Ok(call)
    }

    /// Accept an incoming `session-initiate`. Fails with
    /// [`CallError::NotAuthorized`] if `room_subdomain` does not match
    /// (§4.5 "incoming session-initiate room-subdomain authorization
    /// check") — the caller is expected to reply with
    /// `session-initiate-response { status: not-authorized }` in that
    /// case and never construct a session.
    ///
    /// # Errors
    /// Returns [`CallError::NotAuthorized`] on a failed room check.
    pub async fn accept_incoming_session(
        &self,
        room_subdomain: &str,
        session: Arc<PeerSession>,
        peer_id: String,
    ) -> Result<Arc<Call>, CallError> {
        if !self.is_authorized(room_subdomain) {
            return Err(CallError::NotAuthorized);
        }
        let mut active = self.active_call.write().await;
        let call = match active.as_ref() {
            Some(existing) => Arc::clone(existing),
            None => Call::new(CallStatus::IncomingCall),
        };
        call.add_session(session.clone()).await;
        self.sessions_by_peer
            .write()
            .await
            .insert(peer_id, session.handle);
        *active = Some(Arc::clone(&call));
        Ok(call)
    }

    /// Join a mesh group call by applying a `join-callroom` roster onto
    /// the active call, creating one if none exists yet (§4.5 "group join
    /// via join-callroom").
    pub async fn join_group_call(&self, members: Vec<MemberEntry>) -> Arc<Call> {
        let mut active = self.active_call.write().await;
        let call = match active.as_ref() {
            Some(existing) => Arc::clone(existing),
            None => Call::new(CallStatus::InCall),
        };
        call.apply_roster(members).await;
        *active = Some(Arc::clone(&call));
        call
    }

    /// Look up the session routed to `peer_id`.
    pub async fn session_for_peer(&self, peer_id: &str) -> Option<SessionId> {
        self.sessions_by_peer.read().await.get(peer_id).copied()
    }

    /// Record that `gateway_session_id` now routes to `session_id`
    /// (§4.5 "Routing" — the `sessionId -> PeerSession` index).
    pub async fn register_gateway_session(&self, gateway_session_id: String, session_id: SessionId) {
        self.sessions_by_gateway_id
            .write()
            .await
            .insert(gateway_session_id, session_id);
    }

    /// Look up the live session for a gateway-assigned `sessionId`, the
    /// index `session-accept`/`session-update`/`transport-info` route
    /// through (§4.5 "Routing").
    pub async fn session_by_gateway_id(&self, gateway_session_id: &str) -> Option<Arc<PeerSession>> {
        let session_id = *self.sessions_by_gateway_id.read().await.get(gateway_session_id)?;
        self.active_call.read().await.as_ref()?.session(session_id).await
    }

    /// Remove a session from routing, forwarding to the active call's
    /// own bookkeeping; clears the active call entirely once it reports
    /// no sessions remain and has been marked terminated.
    pub async fn remove_session(&self, session_id: SessionId) {
        let call = self.active_call.read().await.clone();
        let Some(call) = call else { return };
        call.remove_session(session_id).await;
        self.sessions_by_peer
            .write()
            .await
            .retain(|_, sid| *sid != session_id);
        self.sessions_by_gateway_id
            .write()
            .await
            .retain(|_, sid| *sid != session_id);
        if call.status().await == CallStatus::Terminated {
            *self.active_call.write().await = None;
        }
    }
}

#[async_trait]
impl ActiveCallQuery for CallAggregator {
    async fn needs_connection(&self) -> bool {
        self.active_call.read().await.is_some()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::peer_session::{NegotiationState, PeerConnection};
    use crate::types::TransportCandidate;

    struct NoopPeerConnection;

    #[async_trait]
    impl PeerConnection for NoopPeerConnection {
        async fn create_offer(&self) -> Result<String, crate::error::PeerSessionError> {
            Ok("offer".into())
        }
        async fn create_answer(&self) -> Result<String, crate::error::PeerSessionError> {
            Ok("answer".into())
        }
        async fn set_local_description(&self, _sdp: &str) -> Result<(), crate::error::PeerSessionError> {
            Ok(())
        }
        async fn set_remote_description(&self, _sdp: &str) -> Result<(), crate::error::PeerSessionError> {
            Ok(())
        }
        async fn add_ice_candidate(
            &self,
            _candidate: &TransportCandidate,
        ) -> Result<(), crate::error::PeerSessionError> {
            Ok(())
        }
        async fn negotiation_state(&self) -> NegotiationState {
            NegotiationState::Stable
        }
        async fn restart_ice(&self) -> Result<(), crate::error::PeerSessionError> {
            Ok(())
        }
        async fn close(&self) -> Result<(), crate::error::PeerSessionError> {
            Ok(())
        }
        async fn send_data(&self, _bytes: &[u8]) -> Result<(), crate::error::PeerSessionError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn second_outgoing_call_is_rejected_while_one_is_active() {
        let aggregator = CallAggregator::new("room-1");
        let s1 = PeerSession::new_outgoing(Arc::new(NoopPeerConnection));
        aggregator
            .begin_outgoing_call(s1, "peer-a".to_string())
            .await
            .unwrap();

        let s2 = PeerSession::new_outgoing(Arc::new(NoopPeerConnection));
        let result = aggregator.begin_outgoing_call(s2, "peer-b".to_string()).await;
        assert!(matches!(result, Err(CallError::AlreadyActive)));
    }

    #[tokio::test]
    async fn incoming_session_rejected_for_wrong_room_subdomain() {
        let aggregator = CallAggregator::new("room-1");
        let session = PeerSession::new_incoming(Arc::new(NoopPeerConnection));
        let result = aggregator
            .accept_incoming_session("room-2", session, "peer-a".to_string())
            .await;
        assert!(matches!(result, Err(CallError::NotAuthorized)));
    }

    #[tokio::test]
    async fn transfer_done_is_idempotent() {
        let call = Call::new(CallStatus::InCall);
        assert!(call.handle_transfer_done());
        assert!(!call.handle_transfer_done());
    }

    #[tokio::test]
    async fn session_accept_idempotency_flag_flips_once() {
        let call = Call::new(CallStatus::IncomingCall);
        assert!(call.mark_session_accept_sent());
        assert!(!call.mark_session_accept_sent());
    }

    #[tokio::test]
    async fn gateway_session_id_resolves_to_the_routed_session() {
        let aggregator = CallAggregator::new("room-1");
        let session = PeerSession::new_outgoing(Arc::new(NoopPeerConnection));
        let handle = session.handle;
        aggregator
            .begin_outgoing_call(session, "peer-a".to_string())
            .await
            .unwrap();

        assert!(aggregator.session_by_gateway_id("gw-1").await.is_none());
        aggregator
            .register_gateway_session("gw-1".to_string(), handle)
            .await;
        let resolved = aggregator.session_by_gateway_id("gw-1").await.unwrap();
        assert_eq!(resolved.handle, handle);
    }

    #[tokio::test]
    async fn removing_last_session_eventually_terminates_the_call() {
        let aggregator = CallAggregator::new("room-1");
        let session = PeerSession::new_outgoing(Arc::new(NoopPeerConnection));
        let handle = session.handle;
        let call = aggregator
            .begin_outgoing_call(session, "peer-a".to_string())
            .await
            .unwrap();
        let mut events = call.subscribe();
        aggregator.remove_session(handle).await;

        let event = tokio::time::timeout(Duration::from_secs(4), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, CallEvent::Terminated));
    }
}

//! Peer Session (C4): the per-session state machine over a WebRTC-style
//! peer connection — offer/answer exchange, ICE candidate flow,
//! renegotiation, and termination (§4.4).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};
use tokio::time::Instant;
use uuid::Uuid;

use crate::codec::Decoder;
use crate::error::PeerSessionError;
use crate::iq::{
    BinaryHeader, IqBody, OnPushObjectIq, OnPushTwincodeIq, PushObjectIq, PushTwincodeIq, MESSAGE_SCHEMA_ID,
};
use crate::schema::IqRegistry;
use crate::types::{CallStatus, DataChannelLabel, SessionId, TerminateReason, TransportCandidate, Tri};

/// Milliseconds since the Unix epoch, for wire timestamps (§3, §4.6).
fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// §4.4.4: call timeout, armed on session creation.
pub const CALL_TIMEOUT: Duration = Duration::from_secs(30);
/// §4.4.4: connect timeout, armed after `session-accept`.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
/// §4.4.4: ICE disconnect backoff before restarting ICE.
pub const DISCONNECT_BACKOFF: Duration = Duration::from_secs(2);

/// §4.4.1 session states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Freshly constructed, direction not yet chosen.
    Init,
    /// Outgoing: local offer created, not yet sent.
    Offering,
    /// Outgoing: `session-initiate` sent, awaiting the gateway's response.
    AwaitingSessionInitiateResponse,
    /// Outgoing: id assigned, awaiting the peer's `session-accept`.
    AwaitingAccept,
    /// Incoming: remote offer received, local answer not yet emitted.
    Answering,
    /// Incoming: `session-accept` emitted, awaiting first ICE connect.
    AwaitingConnect,
    /// ICE connected at least once.
    Connected,
    /// A renegotiation is in flight.
    Renegotiating,
    /// `terminate`/`terminateInternal` has been called; release pending.
    Terminating,
    /// Fully released.
    Terminated,
}

/// Mirrors `RTCSignalingState` from the peer-connection API (§4.4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    /// No offer/answer exchange in flight.
    Stable,
    /// A local offer has been set, awaiting remote answer.
    HaveLocalOffer,
    /// A remote offer has been set, awaiting local answer.
    HaveRemoteOffer,
}

/// Direction of an audio or video transceiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Sending and receiving.
    SendRecv,
    /// Sending only.
    SendOnly,
    /// Receiving only.
    RecvOnly,
    /// Neither.
    Inactive,
}

/// ICE connection state, as reported by the underlying peer connection
/// (§4.4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceState {
    /// Gathering/checking in progress.
    Checking,
    /// Connected (first or renewed).
    Connected,
    /// Fully completed.
    Completed,
    /// Lost connectivity, may recover.
    Disconnected,
    /// Unrecoverable failure.
    Failed,
    /// Connection torn down.
    Closed,
}

/// The narrow surface C4 needs from an underlying WebRTC-style peer
/// connection. A real implementation wraps `webrtc::peer_connection::
/// RTCPeerConnection`; tests use an in-memory mock, mirroring this
/// lineage's convention of trait-abstracting the transport boundary.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Create a local offer without applying it.
    async fn create_offer(&self) -> Result<String, PeerSessionError>;
    /// Create a local answer without applying it.
    async fn create_answer(&self) -> Result<String, PeerSessionError>;
    /// Apply a local description (offer or answer).
    async fn set_local_description(&self, sdp: &str) -> Result<(), PeerSessionError>;
    /// Apply a remote description (offer or answer).
    async fn set_remote_description(&self, sdp: &str) -> Result<(), PeerSessionError>;
    /// Apply one ICE candidate.
    async fn add_ice_candidate(&self, candidate: &TransportCandidate) -> Result<(), PeerSessionError>;
    /// Current negotiation state.
    async fn negotiation_state(&self) -> NegotiationState;
    /// Restart ICE gathering on the existing connection.
    async fn restart_ice(&self) -> Result<(), PeerSessionError>;
    /// Tear down the connection.
    async fn close(&self) -> Result<(), PeerSessionError>;
    /// Send one binary frame on the outbound data channel.
    async fn send_data(&self, bytes: &[u8]) -> Result<(), PeerSessionError>;
}

/// Outcome of evaluating an incoming `session-update(offer)` against the
/// glare algebra in §4.4.2. Exposed as a pure function of the session's
/// current flags so it can be unit-tested without an async peer
/// connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlareDecision {
    /// Whether the incoming offer should be ignored entirely.
    pub ignore_offer: bool,
    /// Whether to acknowledge but not apply the remote description.
    pub acknowledge_only: bool,
    /// The `remoteAnswerPending` flag to latch before applying.
    pub remote_answer_pending: bool,
}

/// Evaluate §4.4.2's glare algebra.
///
/// `is_offer_received` is true for this call (we are evaluating an
/// incoming `offer`, never an `answer`, per the caller's contract).
#[must_use]
pub fn evaluate_offer_collision(
    making_offer: bool,
    negotiation_state: NegotiationState,
    remote_answer_pending: bool,
    initiator: bool,
) -> GlareDecision {
    let ready_for_offer = !making_offer
        && (negotiation_state == NegotiationState::Stable || remote_answer_pending);
    let is_offer_received = true;
    let offer_collision = is_offer_received && !ready_for_offer;
    let ignore_offer = !initiator && offer_collision;

    let acknowledge_only = ignore_offer
        || (negotiation_state == NegotiationState::Stable && !is_offer_received);

    GlareDecision {
        ignore_offer,
        acknowledge_only,
        remote_answer_pending: !is_offer_received,
    }
}

/// Events a session surfaces to its owning Call (§4.4.7, §4.6). Mirrors the
/// Call's own `broadcast`-based observer idiom (§4.5 "Observers").
#[derive(Debug, Clone)]
pub enum PeerSessionEvent {
    /// The inbound data channel's label advertised the `message`
    /// capability (§4.4.7 `SUPPORTS_MESSAGES`).
    SupportsMessages,
    /// A conversation push was received and acked (§4.6).
    PopDescriptor {
        /// Sender id carried on the push, latched onto the participant if
        /// this is the first one seen.
        sender_id: Uuid,
        /// Message text (only populated for `PushObjectIQ`; twincode
        /// pushes carry `None`).
        message: Option<String>,
        /// Epoch milliseconds the push was received.
        received_timestamp: i64,
    },
}

/// The per-session half of the call protocol (§4.4).
pub struct PeerSession {
    /// Local, stable handle for this session (§9).
    pub handle: SessionId,
    /// Gateway-assigned session id, once known.
    peer_connection_id: RwLock<Option<String>>,
    /// True when we originated the session.
    pub initiator: bool,
    /// Current high-level session state.
    state: RwLock<SessionState>,
    /// Current call status, as surfaced to the aggregator.
    pub status: RwLock<CallStatus>,
    /// First time ICE reached `connected`.
    connection_start_time: RwLock<Option<Instant>>,
    /// Peer's advertised version, once known.
    pub peer_version: RwLock<Tri<crate::types::Version>>,
    /// Whether the peer's data channel advertised `message` support.
    pub message_supported: RwLock<Tri<bool>>,
    /// Locally gathered candidates queued until `peer_connection_id` is
    /// known (§4.4.3).
    pending_local_ice: RwLock<VecDeque<TransportCandidate>>,
    /// Remotely received candidates queued until the session is
    /// initialized (§4.4.3).
    pending_remote_ice: RwLock<VecDeque<TransportCandidate>>,
    /// True while our own `createOffer`/`setLocalDescription` is in
    /// flight (§4.4.2).
    making_offer: AtomicBool,
    /// Latched when we have applied a remote offer while a local offer
    /// was also outstanding (§4.4.2).
    remote_answer_pending: AtomicBool,
    /// True if the peer's simultaneous offer is being ignored (§4.4.2).
    pub ignore_offer: AtomicBool,
    /// True if a direction/track change is pending renegotiation (§4.4.6).
    renegotiation_needed: AtomicBool,
    /// True once our initial `session-initiate`/`session-accept` has been
    /// emitted, gating remote-ICE application (§3 invariant 2).
    initialized: AtomicBool,
    /// Current audio transceiver direction.
    pub audio_direction: RwLock<Direction>,
    /// Current video transceiver direction.
    pub video_direction: RwLock<Direction>,
    /// Target member id latched by a received `ParticipantTransferIQ`
    /// (§4.5).
    pub transfer_to_member_id: RwLock<Option<String>>,
    /// Generation counter: bumped on release so in-flight timers/async
    /// steps can detect staleness and no-op (§9 "async composition").
    generation: AtomicU64,
    /// Underlying peer connection.
    peer_connection: Arc<dyn PeerConnection>,
    /// Per-session IQ schema registry (§4.2).
    pub registry: RwLock<IqRegistry>,
    /// True once `terminate`/`terminateInternal` has run, so repeat calls
    /// are no-ops (§8 idempotence).
    terminate_emitted: AtomicBool,
    /// Sender id latched from the first accepted conversation push
    /// (§4.6), tri-state like `peer_version`/`message_supported`.
    remote_sender_id: RwLock<Tri<Uuid>>,
    /// Observer events (§4.4.7, §4.6).
    events_tx: broadcast::Sender<PeerSessionEvent>,
}

impl PeerSession {
    /// Construct an outgoing session (no remote SDP yet); starts in
    /// `OFFERING` (§4.4.1, §3 lifecycle).
    #[must_use]
    pub fn new_outgoing(peer_connection: Arc<dyn PeerConnection>) -> Arc<Self> {
        Arc::new(Self::new(peer_connection, true, SessionState::Offering))
    }

    /// Construct an incoming session (remote SDP provided); starts in
    /// `ANSWERING`.
    #[must_use]
    pub fn new_incoming(peer_connection: Arc<dyn PeerConnection>) -> Arc<Self> {
        Arc::new(Self::new(peer_connection, false, SessionState::Answering))
    }

    fn new(peer_connection: Arc<dyn PeerConnection>, initiator: bool, state: SessionState) -> Self {
        let (events_tx, _) = broadcast::channel(64);
        Self {
            handle: SessionId::new(),
            peer_connection_id: RwLock::new(None),
            initiator,
            state: RwLock::new(state),
            status: RwLock::new(if initiator {
                CallStatus::OutgoingCall
            } else {
                CallStatus::IncomingCall
            }),
            connection_start_time: RwLock::new(None),
            peer_version: RwLock::new(Tri::Unknown),
            message_supported: RwLock::new(Tri::Unknown),
            pending_local_ice: RwLock::new(VecDeque::new()),
            pending_remote_ice: RwLock::new(VecDeque::new()),
            making_offer: AtomicBool::new(false),
            remote_answer_pending: AtomicBool::new(false),
            ignore_offer: AtomicBool::new(false),
            renegotiation_needed: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            audio_direction: RwLock::new(Direction::SendRecv),
            video_direction: RwLock::new(Direction::Inactive),
            transfer_to_member_id: RwLock::new(None),
            generation: AtomicU64::new(0),
            peer_connection,
            registry: RwLock::new(IqRegistry::new()),
            terminate_emitted: AtomicBool::new(false),
            remote_sender_id: RwLock::new(Tri::Unknown),
            events_tx,
        }
    }

    /// Subscribe to this session's observer events (§4.4.7, §4.6).
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PeerSessionEvent> {
        self.events_tx.subscribe()
    }

    /// True once our side's initial SDP has been emitted AND a remote
    /// description has been applied at least once (§3 invariant 2).
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// The gateway-assigned session id, if known.
    pub async fn peer_connection_id(&self) -> Option<String> {
        self.peer_connection_id.read().await.clone()
    }

    /// Current state.
    pub async fn state(&self) -> SessionState {
        *self.state.read().await
    }

    /// §4.4.3: record a locally gathered ICE candidate — queued if the id
    /// isn't known yet, otherwise returned for immediate `transport-info`
    /// emission.
    pub async fn gather_local_candidate(
        &self,
        candidate: TransportCandidate,
    ) -> Option<TransportCandidate> {
        if self.peer_connection_id.read().await.is_some() {
            Some(candidate)
        } else {
            self.pending_local_ice.write().await.push_back(candidate);
            None
        }
    }

    /// §4.4.3: on the `session-initiate-response` that assigns the id,
    /// flush queued local candidates in FIFO order.
    pub async fn assign_peer_connection_id(&self, id: String) -> Vec<TransportCandidate> {
        *self.peer_connection_id.write().await = Some(id);
        let mut queue = self.pending_local_ice.write().await;
        queue.drain(..).collect()
    }

    /// §4.4.3: handle one remotely received `transport-info` candidate.
    /// Queues it if the session is not yet initialized; otherwise applies
    /// it immediately (extracting `ufrag` first).
    ///
    /// # Errors
    /// Propagates [`PeerSessionError`] from the underlying peer connection.
    pub async fn handle_remote_candidate(
        &self,
        candidate: TransportCandidate,
    ) -> Result<(), PeerSessionError> {
        if !self.is_initialized() {
            self.pending_remote_ice.write().await.push_back(candidate);
            return Ok(());
        }
        if !candidate.removed {
            self.peer_connection.add_ice_candidate(&candidate).await?;
        }
        Ok(())
    }

    /// §4.4.3: drain `pendingRemoteIce` in arrival order once the session
    /// first becomes fully initialized.
    ///
    /// # Errors
    /// Propagates the first error from applying a queued candidate; any
    /// candidates after the failure remain queued.
    pub async fn mark_initialized(&self) -> Result<(), PeerSessionError> {
        self.initialized.store(true, Ordering::SeqCst);
        loop {
            let next = self.pending_remote_ice.write().await.pop_front();
            let Some(candidate) = next else { break };
            if !candidate.removed {
                self.peer_connection.add_ice_candidate(&candidate).await?;
            }
        }
        Ok(())
    }

    /// §4.4.2: evaluate and apply an incoming `session-update(offer)`.
    /// Returns `true` if a local answer was created and should be sent.
    ///
    /// # Errors
    /// Propagates [`PeerSessionError`] from SDP application.
    pub async fn handle_remote_offer(&self, sdp: &str) -> Result<bool, PeerSessionError> {
        let making_offer = self.making_offer.load(Ordering::SeqCst);
        let negotiation_state = self.peer_connection.negotiation_state().await;
        let remote_answer_pending = self.remote_answer_pending.load(Ordering::SeqCst);

        let decision =
            evaluate_offer_collision(making_offer, negotiation_state, remote_answer_pending, self.initiator);

        self.ignore_offer.store(decision.ignore_offer, Ordering::SeqCst);
        if decision.acknowledge_only {
            return Ok(false);
        }

        self.remote_answer_pending
            .store(decision.remote_answer_pending, Ordering::SeqCst);
        self.peer_connection.set_remote_description(sdp).await?;
        let answer = self.peer_connection.create_answer().await?;
        self.peer_connection.set_local_description(&answer).await?;
        Ok(true)
    }

    /// §4.4.1: handle a matching `session-accept`; idempotent — a second
    /// call while already past `AWAITING_ACCEPT` is a no-op (§8).
    ///
    /// # Errors
    /// Propagates [`PeerSessionError`] from SDP application.
    pub async fn handle_session_accept(&self, sdp: &str) -> Result<(), PeerSessionError> {
        let mut state = self.state.write().await;
        if *state != SessionState::AwaitingAccept {
            return Ok(());
        }
        drop(state);
        self.peer_connection.set_remote_description(sdp).await?;
        self.mark_initialized().await?;
        state = self.state.write().await;
        *state = SessionState::AwaitingConnect;
        drop(state);
        let accepted = self.status.read().await.to_accepted();
        *self.status.write().await = accepted;
        Ok(())
    }

    /// §4.4.3/§4.4.1: the gateway assigned our session id; flush queued
    /// local ICE and move `OFFERING` forward.
    pub async fn handle_session_initiate_response(
        &self,
        session_id: String,
    ) -> Vec<TransportCandidate> {
        let flushed = self.assign_peer_connection_id(session_id).await;
        let mut state = self.state.write().await;
        if *state == SessionState::Offering {
            *state = SessionState::AwaitingSessionInitiateResponse;
        }
        *state = SessionState::AwaitingAccept;
        flushed
    }

    /// §4.4.5: apply an ICE connection-state transition.
    ///
    /// # Errors
    /// Propagates [`PeerSessionError`] from ICE restart on the
    /// disconnect-backoff path's caller (the timer itself is driven
    /// externally by [`Self::arm_disconnect_backoff`]).
    pub async fn handle_ice_state(&self, ice_state: IceState) -> Result<(), PeerSessionError> {
        match ice_state {
            IceState::Connected | IceState::Completed => {
                let mut start = self.connection_start_time.write().await;
                if start.is_none() {
                    *start = Some(Instant::now());
                    let mut state = self.state.write().await;
                    *state = SessionState::Connected;
                    let mut status = self.status.write().await;
                    *status = status.to_active();
                }
                Ok(())
            }
            IceState::Failed => {
                self.terminate_internal(TerminateReason::ConnectivityError, true)
                    .await
            }
            IceState::Closed => {
                self.terminate_internal(TerminateReason::Disconnected, true)
                    .await
            }
            IceState::Disconnected | IceState::Checking => Ok(()),
        }
    }

    /// §4.4.4: arm a one-shot disconnect-backoff timer. If ICE is still
    /// `disconnected` after [`DISCONNECT_BACKOFF`], restart ICE and set
    /// `renegotiationNeeded`. Staleness is checked via the generation
    /// counter so a terminated session's late timer is a no-op (§9).
    pub fn arm_disconnect_backoff(
        self: &Arc<Self>,
        still_disconnected: impl Fn() -> bool + Send + 'static,
    ) {
        let this = Arc::clone(self);
        let generation = this.generation.load(Ordering::SeqCst);
        tokio::spawn(async move {
            tokio::time::sleep(DISCONNECT_BACKOFF).await;
            if this.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            if still_disconnected() {
                this.renegotiation_needed.store(true, Ordering::SeqCst);
                let _ = this.peer_connection.restart_ice().await;
            }
        });
    }

    /// §4.4.6: update the requested audio direction.
    ///
    /// # Errors
    /// Propagates [`PeerSessionError`] if applying the direction change
    /// requires renegotiation machinery that fails.
    pub async fn set_audio_direction(&self, direction: Direction) -> Result<(), PeerSessionError> {
        self.set_direction(&self.audio_direction, direction).await
    }

    /// §4.4.6: update the requested video direction.
    ///
    /// # Errors
    /// Propagates [`PeerSessionError`] if applying the direction change
    /// requires renegotiation machinery that fails.
    pub async fn set_video_direction(&self, direction: Direction) -> Result<(), PeerSessionError> {
        self.set_direction(&self.video_direction, direction).await
    }

    async fn set_direction(
        &self,
        slot: &RwLock<Direction>,
        direction: Direction,
    ) -> Result<(), PeerSessionError> {
        let mut current = slot.write().await;
        if *current != direction {
            self.renegotiation_needed.store(true, Ordering::SeqCst);
        }
        *current = direction;
        Ok(())
    }

    /// Whether a coalesced renegotiation is pending (§3 invariant 5).
    #[must_use]
    pub fn renegotiation_needed(&self) -> bool {
        self.renegotiation_needed.load(Ordering::SeqCst)
    }

    /// §4.4.7: send one IQ frame on the outbound data channel. Best
    /// effort — failures are logged and surfaced as `false`, never
    /// retried (§5 "Backpressure").
    pub async fn send_iq_bytes(&self, bytes: &[u8]) -> bool {
        match self.peer_connection.send_data(bytes).await {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(error = %err, "data-channel send failed");
                false
            }
        }
    }

    /// §4.4.7: called once the outbound data channel opens. Emits the
    /// identity `ParticipantInfoIQ` (name, avatar thumbnail, room member
    /// id) so the peer can populate our participant entry.
    pub async fn handle_outbound_channel_open(&self, identity: crate::iq::ParticipantInfoIq) -> bool {
        match identity.encode_frame(0) {
            Ok(bytes) => self.send_iq_bytes(&bytes).await,
            Err(err) => {
                tracing::warn!(error = %err, "failed to encode outbound ParticipantInfoIQ");
                false
            }
        }
    }

    /// §4.4.7: called once the inbound data channel opens. Parses the
    /// peer's label capability list, latches `messageSupported`, and
    /// surfaces `SUPPORTS_MESSAGES` when the peer advertised it.
    pub async fn handle_inbound_channel_open(&self, label: &str) {
        let supports_messages = DataChannelLabel::parse(label)
            .map(|parsed| parsed.supports_message())
            .unwrap_or(false);
        *self.message_supported.write().await = Tri::Known(supports_messages);
        if supports_messages {
            let _ = self.events_tx.send(PeerSessionEvent::SupportsMessages);
        }
    }

    /// §4.6: handle one inbound data-channel frame that decodes as a
    /// `PushObjectIQ` or `PushTwincodeIQ`. Stamps `receivedTimestamp`,
    /// latches `remote_sender_id` if unset, surfaces `PopDescriptor`, and
    /// sends the matching `OnPushIQ` ack. Frames for any other schema are
    /// left untouched for the caller's own registry dispatch.
    ///
    /// # Errors
    /// Propagates a decode failure on the base header; an unrecognized or
    /// malformed body is treated as "not a push frame" and ignored.
    pub async fn handle_push_frame(&self, frame: &[u8]) -> Result<bool, PeerSessionError> {
        let mut decoder = Decoder::new(frame);
        let header = BinaryHeader::decode(&mut decoder)
            .map_err(|err| PeerSessionError::Protocol(err.to_string()))?;
        let key = header.schema_key();
        let received_timestamp = now_millis();

        if key.schema_id == PushObjectIq::SCHEMA_ID && key.schema_version == PushObjectIq::SCHEMA_VERSION {
            let body = PushObjectIq::decode_body(&mut decoder)
                .map_err(|err| PeerSessionError::Protocol(err.to_string()))?;
            if body.inner.schema_id != MESSAGE_SCHEMA_ID {
                return Ok(false);
            }
            self.latch_remote_sender_id(body.sender_id).await;
            let _ = self.events_tx.send(PeerSessionEvent::PopDescriptor {
                sender_id: body.sender_id,
                message: Some(body.message),
                received_timestamp,
            });
            let ack = OnPushObjectIq {
                device_state: 0,
                received_timestamp,
            };
            if let Ok(bytes) = ack.encode_frame(header.request_id) {
                self.send_iq_bytes(&bytes).await;
            }
            return Ok(true);
        }

        if key.schema_id == PushTwincodeIq::SCHEMA_ID && key.schema_version == PushTwincodeIq::SCHEMA_VERSION {
            let body = PushTwincodeIq::decode_body(&mut decoder)
                .map_err(|err| PeerSessionError::Protocol(err.to_string()))?;
            self.latch_remote_sender_id(body.sender_id).await;
            let _ = self.events_tx.send(PeerSessionEvent::PopDescriptor {
                sender_id: body.sender_id,
                message: None,
                received_timestamp,
            });
            let ack = OnPushTwincodeIq {
                device_state: 0,
                received_timestamp,
            };
            if let Ok(bytes) = ack.encode_frame(header.request_id) {
                self.send_iq_bytes(&bytes).await;
            }
            return Ok(true);
        }

        Ok(false)
    }

    async fn latch_remote_sender_id(&self, sender_id: Uuid) {
        let mut slot = self.remote_sender_id.write().await;
        if !slot.is_known() {
            *slot = Tri::Known(sender_id);
        }
    }

    /// The sender id latched from the first accepted conversation push,
    /// if any (§4.6).
    pub async fn remote_sender_id(&self) -> Tri<Uuid> {
        *self.remote_sender_id.read().await
    }

    /// §4.4.8: request termination. Idempotent: a second call after the
    /// first has already emitted `session-terminate` is a no-op (§8).
    ///
    /// Returns `Some(peer_connection_id)` if a `session-terminate` frame
    /// should be sent by the caller (only possible once the id is known).
    ///
    /// # Errors
    /// Propagates [`PeerSessionError`] from closing the peer connection.
    pub async fn terminate(&self, reason: TerminateReason) -> Result<Option<String>, PeerSessionError> {
        self.terminate_internal(reason, true).await?;
        Ok(self.peer_connection_id.read().await.clone())
    }

    async fn terminate_internal(
        &self,
        _reason: TerminateReason,
        _notify_peer: bool,
    ) -> Result<(), PeerSessionError> {
        if self.terminate_emitted.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        *self.state.write().await = SessionState::Terminating;
        self.peer_connection.close().await
    }

    /// §4.4.8: close data channels and the peer connection, mark
    /// `TERMINATED`, clear timers, and report participants to remove
    /// (always at least the main participant).
    ///
    /// # Errors
    /// Propagates [`PeerSessionError`] from closing the peer connection.
    pub async fn release(&self) -> Result<(), PeerSessionError> {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let _ = self.peer_connection.close().await;
        *self.state.write().await = SessionState::Terminated;
        *self.status.write().await = CallStatus::Terminated;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct MockPeerConnection {
        negotiation_state: StdMutex<NegotiationState>,
        closed: AtomicBool,
        sent: StdMutex<Vec<Vec<u8>>>,
    }

    impl MockPeerConnection {
        fn new(state: NegotiationState) -> Self {
            Self {
                negotiation_state: StdMutex::new(state),
                closed: AtomicBool::new(false),
                sent: StdMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PeerConnection for MockPeerConnection {
        async fn create_offer(&self) -> Result<String, PeerSessionError> {
            Ok("offer-sdp".to_string())
        }
        async fn create_answer(&self) -> Result<String, PeerSessionError> {
            Ok("answer-sdp".to_string())
        }
        async fn set_local_description(&self, _sdp: &str) -> Result<(), PeerSessionError> {
            Ok(())
        }
        async fn set_remote_description(&self, _sdp: &str) -> Result<(), PeerSessionError> {
            Ok(())
        }
        async fn add_ice_candidate(
            &self,
            _candidate: &TransportCandidate,
        ) -> Result<(), PeerSessionError> {
            Ok(())
        }
        async fn negotiation_state(&self) -> NegotiationState {
            *self.negotiation_state.lock().unwrap()
        }
        async fn restart_ice(&self) -> Result<(), PeerSessionError> {
            Ok(())
        }
        async fn close(&self) -> Result<(), PeerSessionError> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
        async fn send_data(&self, bytes: &[u8]) -> Result<(), PeerSessionError> {
            self.sent.lock().unwrap().push(bytes.to_vec());
            Ok(())
        }
    }

    fn candidate(line: &str) -> TransportCandidate {
        TransportCandidate {
            candidate: line.to_string(),
            sdp_mid: "0".to_string(),
            sdp_mline_index: 0,
            removed: false,
        }
    }

    #[test]
    fn glare_non_initiator_yields_when_both_offering() {
        let decision = evaluate_offer_collision(true, NegotiationState::HaveLocalOffer, false, false);
        assert!(decision.ignore_offer);
    }

    #[test]
    fn glare_initiator_never_ignores() {
        let decision = evaluate_offer_collision(true, NegotiationState::HaveLocalOffer, false, true);
        assert!(!decision.ignore_offer);
    }

    #[test]
    fn glare_stable_state_applies_offer_normally() {
        let decision = evaluate_offer_collision(false, NegotiationState::Stable, false, false);
        assert!(!decision.ignore_offer);
        assert!(!decision.acknowledge_only);
    }

    #[tokio::test]
    async fn local_ice_is_queued_until_id_known_then_flushed_in_order() {
        let pc = Arc::new(MockPeerConnection::new(NegotiationState::Stable));
        let session = PeerSession::new_outgoing(pc);

        assert!(session
            .gather_local_candidate(candidate("a"))
            .await
            .is_none());
        assert!(session
            .gather_local_candidate(candidate("b"))
            .await
            .is_none());

        let flushed = session.assign_peer_connection_id("sess-1".to_string()).await;
        assert_eq!(flushed.len(), 2);
        assert_eq!(flushed[0].candidate, "a");
        assert_eq!(flushed[1].candidate, "b");

        // After the id is known, subsequent candidates are emitted
        // immediately rather than queued.
        let immediate = session.gather_local_candidate(candidate("c")).await;
        assert!(immediate.is_some());
    }

    #[tokio::test]
    async fn remote_ice_is_queued_until_initialized_then_drained_in_order() {
        let pc = Arc::new(MockPeerConnection::new(NegotiationState::Stable));
        let session = PeerSession::new_incoming(pc);

        session
            .handle_remote_candidate(candidate("x"))
            .await
            .unwrap();
        session
            .handle_remote_candidate(candidate("y"))
            .await
            .unwrap();
        assert!(!session.is_initialized());

        session.mark_initialized().await.unwrap();
        assert!(session.is_initialized());

        // Further candidates apply immediately once initialized.
        session
            .handle_remote_candidate(candidate("z"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn session_accept_is_idempotent() {
        let pc = Arc::new(MockPeerConnection::new(NegotiationState::HaveLocalOffer));
        let session = PeerSession::new_outgoing(pc);
        session
            .handle_session_initiate_response("sess-1".to_string())
            .await;
        assert_eq!(session.state().await, SessionState::AwaitingAccept);

        session.handle_session_accept("sdp").await.unwrap();
        assert_eq!(session.state().await, SessionState::AwaitingConnect);

        // A duplicate session-accept is ignored (§8).
        session.handle_session_accept("sdp-2").await.unwrap();
        assert_eq!(session.state().await, SessionState::AwaitingConnect);
    }

    #[tokio::test]
    async fn session_accept_drains_pending_remote_ice() {
        let pc = Arc::new(MockPeerConnection::new(NegotiationState::HaveLocalOffer));
        let session = PeerSession::new_outgoing(pc);
        session
            .handle_session_initiate_response("sess-1".to_string())
            .await;

        session
            .handle_remote_candidate(candidate("queued"))
            .await
            .unwrap();
        assert!(!session.is_initialized());

        session.handle_session_accept("sdp").await.unwrap();
        assert!(session.is_initialized());
    }

    #[tokio::test]
    async fn inbound_channel_open_latches_message_support_from_label() {
        let pc = Arc::new(MockPeerConnection::new(NegotiationState::Stable));
        let session = PeerSession::new_incoming(pc);
        let mut events = session.subscribe();

        session
            .handle_inbound_channel_open("CallService:1.3.0:group,transfer,message")
            .await;

        assert_eq!(*session.message_supported.read().await, Tri::Known(true));
        let event = events.try_recv().unwrap();
        assert!(matches!(event, PeerSessionEvent::SupportsMessages));
    }

    #[tokio::test]
    async fn inbound_channel_open_without_message_capability_sets_known_false() {
        let pc = Arc::new(MockPeerConnection::new(NegotiationState::Stable));
        let session = PeerSession::new_incoming(pc);
        session
            .handle_inbound_channel_open("CallService:1.3.0:group")
            .await;
        assert_eq!(*session.message_supported.read().await, Tri::Known(false));
    }

    #[tokio::test]
    async fn push_object_frame_stamps_latches_and_acks() {
        let pc = Arc::new(MockPeerConnection::new(NegotiationState::Stable));
        let session = PeerSession::new_incoming(pc.clone());
        let mut events = session.subscribe();

        let sender_id = Uuid::new_v4();
        let iq = crate::iq::PushObjectIq {
            sender_id,
            sequence_id: 1,
            send_to: None,
            reply_to: None,
            created: 0,
            sent: 0,
            expire_timeout: 0,
            inner: crate::iq::InnerSchema {
                schema_id: MESSAGE_SCHEMA_ID,
                version: 1,
            },
            message: "hello".to_string(),
            copy_allowed: true,
        };
        let frame = iq.encode_frame(11).unwrap();

        let handled = session.handle_push_frame(&frame).await.unwrap();
        assert!(handled);
        assert_eq!(session.remote_sender_id().await, Tri::Known(sender_id));
        assert_eq!(pc.sent.lock().unwrap().len(), 1);

        let event = events.try_recv().unwrap();
        match event {
            PeerSessionEvent::PopDescriptor { sender_id: s, message, .. } => {
                assert_eq!(s, sender_id);
                assert_eq!(message.as_deref(), Some("hello"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn push_object_frame_with_mismatched_inner_schema_is_dropped() {
        let pc = Arc::new(MockPeerConnection::new(NegotiationState::Stable));
        let session = PeerSession::new_incoming(pc.clone());

        let iq = crate::iq::PushObjectIq {
            sender_id: Uuid::new_v4(),
            sequence_id: 1,
            send_to: None,
            reply_to: None,
            created: 0,
            sent: 0,
            expire_timeout: 0,
            inner: crate::iq::InnerSchema {
                schema_id: Uuid::new_v4(),
                version: 1,
            },
            message: "hello".to_string(),
            copy_allowed: true,
        };
        let frame = iq.encode_frame(11).unwrap();

        let handled = session.handle_push_frame(&frame).await.unwrap();
        assert!(!handled);
        assert!(pc.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn terminate_twice_emits_session_terminate_at_most_once() {
        let pc = Arc::new(MockPeerConnection::new(NegotiationState::Stable));
        let session = PeerSession::new_outgoing(pc);
        session
            .assign_peer_connection_id("sess-1".to_string())
            .await;

        let first = session.terminate(TerminateReason::Cancel).await.unwrap();
        assert_eq!(first, Some("sess-1".to_string()));

        // Second call must not panic and must remain idempotent.
        let second = session.terminate(TerminateReason::Cancel).await.unwrap();
        assert_eq!(second, Some("sess-1".to_string()));
    }

    #[tokio::test]
    async fn ice_connected_transitions_to_connected_and_active_status() {
        let pc = Arc::new(MockPeerConnection::new(NegotiationState::Stable));
        let session = PeerSession::new_outgoing(pc);
        session.handle_ice_state(IceState::Connected).await.unwrap();
        assert_eq!(session.state().await, SessionState::Connected);
    }

    #[tokio::test]
    async fn direction_change_sets_renegotiation_needed_only_on_real_change() {
        let pc = Arc::new(MockPeerConnection::new(NegotiationState::Stable));
        let session = PeerSession::new_outgoing(pc);
        assert!(!session.renegotiation_needed());
        session.set_video_direction(Direction::SendRecv).await.unwrap();
        assert!(session.renegotiation_needed());
    }
}

//! `CallCore` facade: owns one signaling transport (C3) and one call
//! aggregator (C5), and wires the data flow between them (§2, §11).

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::broadcast;

use crate::call::{Call, CallAggregator, CallEvent};
use crate::config::CallCoreConfig;
use crate::peer_session::{PeerConnection, PeerSession};
use crate::signaling::{
    SessionInitiateStatus, SignalingEvent, SignalingFrame, SignalingTransport,
};
use crate::types::TerminateReason;

/// Constructs a fresh, unconnected peer connection for each new session
/// (one outgoing, or one ANSWERING per incoming `session-initiate`). The
/// embedding application supplies this, wrapping its own `webrtc`-backed
/// `RTCPeerConnection` or a test double (§1 Non-goals — media/ICE engine
/// internals are out of scope here).
pub type PeerConnectionFactory = Arc<dyn Fn() -> Arc<dyn PeerConnection> + Send + Sync>;

/// Errors raised constructing or driving the facade.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The configuration failed to load or validate.
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

/// Owns the signaling transport and call aggregator, and forwards
/// gateway frames that concern call routing (authorization, roster,
/// termination) between them. SDP/ICE application and media attachment
/// are the embedding application's responsibility, via
/// [`crate::peer_session::PeerSession`] and
/// [`crate::media::MediaSink`] (§1 Non-goals).
pub struct CallCore {
    signaling: Arc<SignalingTransport>,
    aggregator: Arc<CallAggregator>,
    peer_connection_factory: PeerConnectionFactory,
}

impl CallCore {
    /// Construct the facade from configuration, a room subdomain used to
    /// authorize incoming calls (§4.5), and a factory for the peer
    /// connections that back each new ANSWERING session.
    #[must_use]
    pub fn new(
        config: CallCoreConfig,
        local_room_subdomain: impl Into<String>,
        peer_connection_factory: PeerConnectionFactory,
    ) -> Arc<Self> {
        let aggregator = CallAggregator::new(local_room_subdomain);
        let signaling = SignalingTransport::new(config, aggregator.clone());
        Arc::new(Self {
            signaling,
            aggregator,
            peer_connection_factory,
        })
    }

    /// Start the signaling connect/reconnect loop and the gateway-frame
    /// routing loop.
    pub fn start(self: &Arc<Self>) {
        self.signaling.spawn();
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run_routing_loop().await });
    }

    /// The underlying signaling transport, for direct frame sends
    /// (`session-initiate`, `session-accept`, and so on) that the
    /// embedding application drives once it has local SDP from its own
    /// peer connection.
    #[must_use]
    pub fn signaling(&self) -> &Arc<SignalingTransport> {
        &self.signaling
    }

    /// The call aggregator, for inspecting or joining the active call.
    #[must_use]
    pub fn aggregator(&self) -> &Arc<CallAggregator> {
        &self.aggregator
    }

    /// Subscribe to the active call's events, if one exists.
    pub async fn subscribe_call_events(&self) -> Option<broadcast::Receiver<CallEvent>> {
        self.aggregator
            .active_call()
            .await
            .map(|call: Arc<Call>| call.subscribe())
    }

    async fn run_routing_loop(self: Arc<Self>) {
        let mut events = self.signaling.subscribe();
        loop {
            match events.recv().await {
                Ok(SignalingEvent::Frame(frame)) => self.route_frame(frame).await,
                Ok(SignalingEvent::Ready | SignalingEvent::Closed { .. }) => {}
                Ok(SignalingEvent::ServerClosed) | Err(broadcast::error::RecvError::Closed) => break,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
            }
        }
    }

    async fn route_frame(&self, frame: SignalingFrame) {
        match frame {
            SignalingFrame::JoinCallroom { members, .. } => {
                self.aggregator.join_group_call(members).await;
            }
            SignalingFrame::MemberJoin {
                member_id, status, ..
            } => {
                if let Some(call) = self.aggregator.active_call().await {
                    call.apply_roster(vec![crate::signaling::MemberEntry {
                        status,
                        member_id,
                        session_id: None,
                    }])
                    .await;
                }
            }
            SignalingFrame::SessionInitiate {
                to, sdp, session_id, ..
            } => {
                self.handle_incoming_session_initiate(to, sdp, session_id).await;
            }
            SignalingFrame::SessionInitiateResponse {
                to,
                session_id,
                status,
            } => {
                self.handle_session_initiate_response(to, session_id, status)
                    .await;
            }
            SignalingFrame::SessionAccept {
                session_id, sdp, ..
            } => {
                let Some(session) = self.aggregator.session_by_gateway_id(&session_id).await else {
                    self.reject_unknown_session(session_id).await;
                    return;
                };
                if let Err(err) = session.handle_session_accept(&sdp).await {
                    tracing::warn!(error = %err, %session_id, "failed to apply session-accept");
                }
            }
            SignalingFrame::SessionUpdate {
                session_id, sdp, ..
            } => {
                let Some(session) = self.aggregator.session_by_gateway_id(&session_id).await else {
                    self.reject_unknown_session(session_id).await;
                    return;
                };
                if let Err(err) = session.handle_remote_offer(&sdp).await {
                    tracing::warn!(error = %err, %session_id, "failed to apply session-update");
                }
            }
            SignalingFrame::TransportInfo {
                session_id,
                candidates,
            } => {
                let Some(session) = self.aggregator.session_by_gateway_id(&session_id).await else {
                    self.reject_unknown_session(session_id).await;
                    return;
                };
                for candidate in candidates {
                    if let Err(err) = session.handle_remote_candidate(candidate).await {
                        tracing::warn!(error = %err, %session_id, "failed to apply remote candidate");
                    }
                }
            }
            SignalingFrame::SessionTerminate { session_id, reason } => {
                tracing::info!(%session_id, ?reason, "peer terminated session");
            }
            _ => {}
        }
    }

    /// §4.5: an incoming `session-initiate` is authorized against the
    /// room subdomain carried in `to` (`local@<room>.callroom.<host>`).
    /// On success an ANSWERING [`PeerSession`] is added to the active
    /// call and the remote offer applied; on failure the gateway session
    /// id (if any) is rejected with `not-authorized` and no session is
    /// added to any call.
    async fn handle_incoming_session_initiate(
        &self,
        to: String,
        sdp: String,
        session_id: Option<String>,
    ) {
        let room_subdomain = room_subdomain_of(&to);
        let peer_connection = (self.peer_connection_factory)();
        let session = PeerSession::new_incoming(peer_connection);

        match self
            .aggregator
            .accept_incoming_session(room_subdomain, session.clone(), to.clone())
            .await
        {
            Ok(_call) => {
                if let Some(gateway_session_id) = session_id.clone() {
                    self.aggregator
                        .register_gateway_session(gateway_session_id, session.handle)
                        .await;
                }
                if let Err(err) = session.handle_remote_offer(&sdp).await {
                    tracing::warn!(error = %err, %to, "failed to apply incoming offer");
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, %to, "rejected unauthorized session-initiate");
                if let Some(gateway_session_id) = session_id {
                    self.signaling
                        .send(SignalingFrame::SessionTerminate {
                            session_id: gateway_session_id,
                            reason: TerminateReason::NotAuthorized,
                        })
                        .await;
                }
            }
        }
    }

    /// §4.4.3: the gateway confirmed our outgoing `session-initiate` and
    /// assigned it a session id; wire the id into the matching
    /// [`PeerSession`] and flush any local ICE candidates queued while it
    /// was pending.
    async fn handle_session_initiate_response(
        &self,
        to: String,
        session_id: String,
        status: SessionInitiateStatus,
    ) {
        if status != SessionInitiateStatus::Success {
            tracing::warn!(?status, %to, "session-initiate rejected by gateway");
            return;
        }
        let Some(local_session_id) = self.aggregator.session_for_peer(&to).await else {
            tracing::warn!(%to, "session-initiate-response for unknown peer");
            return;
        };
        let Some(call) = self.aggregator.active_call().await else {
            return;
        };
        let Some(session) = call.session(local_session_id).await else {
            return;
        };

        self.aggregator
            .register_gateway_session(session_id.clone(), session.handle)
            .await;
        let flushed = session.handle_session_initiate_response(session_id.clone()).await;
        if !flushed.is_empty() {
            self.signaling
                .send(SignalingFrame::TransportInfo {
                    session_id,
                    candidates: flushed,
                })
                .await;
        }
    }

    /// §4.5 "Routing": a gateway frame named an unknown `sessionId`.
    async fn reject_unknown_session(&self, session_id: String) {
        tracing::warn!(%session_id, "unknown session id, rejecting");
        self.signaling
            .send(SignalingFrame::SessionTerminate {
                session_id,
                reason: TerminateReason::Gone,
            })
            .await;
    }
}

/// Extracts the room subdomain from a peer identifier of the form
/// `local@<room>.callroom.<host>` (§4.5, §6.1 scenario 2/3). Returns the
/// substring after `@` verbatim, or the whole string if there is no `@`.
fn room_subdomain_of(peer_id: &str) -> &str {
    peer_id.split('@').nth(1).unwrap_or(peer_id)
}

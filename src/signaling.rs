//! Signaling transport (C3): a full-duplex JSON message channel to the
//! gateway, with keepalive, reconnect, and stable client identity (§4.3).
//!
//! The connect/reconnect loop follows the same shape as an agent-side
//! websocket client elsewhere in this lineage: split the socket into a
//! sink/stream pair and drive both directions from one `tokio::select!`
//! loop, so outbound sends and inbound frames interleave in wire order.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::config::CallCoreConfig;
use crate::error::SignalingError;
use crate::identity::ClientSessionId;
use crate::types::{Offer, TerminateReason, TransportCandidate};

/// Ping cadence (§4.3).
pub const PING_INTERVAL: Duration = Duration::from_secs(15);
/// Silence beyond this closes the socket with [`CLOSE_PING_TIMEOUT`] (§4.3).
pub const PING_TIMEOUT: Duration = Duration::from_secs(30);
/// Time allowed for the connect handshake before [`CLOSE_CONNECT_TIMEOUT`]
/// (§4.3).
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
/// Delay before a reconnect attempt (§4.3, §9 — fixed, no backoff).
pub const RETRY_DELAY: Duration = Duration::from_secs(3);
/// Maximum reconnect attempts before the terminal `onServerClose` (§4.3).
pub const MAX_RETRY_ATTEMPTS: u32 = 5;

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// Generic transport error.
pub const CLOSE_GENERIC_ERROR: u16 = 3000;
/// No inbound frame within [`PING_TIMEOUT`].
pub const CLOSE_PING_TIMEOUT: u16 = 3001;
/// Connect handshake did not complete within [`CONNECT_TIMEOUT`].
pub const CLOSE_CONNECT_TIMEOUT: u16 = 3002;

/// `DISCONNECTED -> CONNECTING -> NEGOTIATING -> READY -> CLOSING ->
/// DISCONNECTED` (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    /// No socket.
    Disconnected,
    /// Socket opening, `session-request` not yet acknowledged.
    Connecting,
    /// Socket open, awaiting `session-config`.
    Negotiating,
    /// `session-config` received; frames flow normally.
    Ready,
    /// Graceful shutdown in progress.
    Closing,
}

/// Queried by the transport to decide keepalive and reconnect behavior
/// (§4.3: "as reported by the aggregator's `needConnection` query").
#[async_trait]
pub trait ActiveCallQuery: Send + Sync {
    /// True while a call exists that still needs the signaling channel.
    async fn needs_connection(&self) -> bool;
}

/// A query that always reports no active call, for tests and standalone
/// use of the transport.
pub struct NoActiveCall;

#[async_trait]
impl ActiveCallQuery for NoActiveCall {
    async fn needs_connection(&self) -> bool {
        false
    }
}

/// `session-initiate-response` status values (§6.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionInitiateStatus {
    /// The session was created on the gateway.
    Success,
    /// The requesting peer failed the room-authorization check.
    NotAuthorized,
    /// The referenced session id is no longer known to the gateway.
    Gone,
    /// The call was deferred to a scheduled time.
    Schedule,
}

/// `session-update` update types (§6.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateType {
    /// A renegotiation offer.
    Offer,
    /// A renegotiation answer.
    Answer,
}

/// One TURN/STUN server entry from `session-config` (§6.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnServer {
    /// Server URL.
    pub url: String,
    /// Username credential.
    pub username: String,
    /// Password credential.
    pub password: String,
}

/// One member entry in a `join-callroom` roster (§6.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberEntry {
    /// Membership status.
    pub status: MemberStatus,
    /// Stable per-room member id.
    pub member_id: String,
    /// Session id, if one is already attached to this member.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Membership status carried in a `join-callroom`/`member-join` entry
/// (§6.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MemberStatus {
    /// A new member joined the room.
    MemberNew,
    /// A known member needs a fresh session.
    MemberNeedSession,
    /// A member left the room.
    MemberDelete,
}

/// A signaling message, discriminated on the wire by `msg` (§6.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "msg", rename_all = "kebab-case")]
pub enum SignalingFrame {
    /// `session-request`: client→server, first frame after connect.
    SessionRequest {
        /// Stable client session-id.
        #[serde(rename = "session-id")]
        session_id: String,
    },
    /// `session-config`: server→client, ICE server configuration.
    #[serde(rename_all = "camelCase")]
    SessionConfig {
        /// TURN/STUN servers to use for ICE.
        turn_servers: Vec<TurnServer>,
        /// Max outbound frame size.
        max_send_frame_size: u32,
        /// Max outbound frame rate.
        max_send_frame_rate: u32,
        /// Max inbound frame size.
        max_received_frame_size: u32,
        /// Max inbound frame rate.
        max_received_frame_rate: u32,
    },
    /// `session-initiate`: propose a new session.
    #[serde(rename_all = "camelCase")]
    SessionInitiate {
        /// Target peer identifier.
        to: String,
        /// Local SDP offer.
        sdp: String,
        /// Session id, if already known (renegotiation).
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        /// Advertised local capability.
        offer: Offer,
        /// Requested remote capability.
        offer_to_receive: Offer,
        /// Maximum frame size requested.
        max_frame_size: u32,
        /// Maximum frame rate requested.
        max_frame_rate: u32,
    },
    /// `session-initiate-response`: gateway assigns or rejects a session id.
    #[serde(rename_all = "camelCase")]
    SessionInitiateResponse {
        /// Target peer identifier.
        to: String,
        /// Gateway-assigned session id.
        session_id: String,
        /// Outcome of the initiate request.
        status: SessionInitiateStatus,
    },
    /// `session-accept`: accept an incoming session.
    #[serde(rename_all = "camelCase")]
    SessionAccept {
        /// Session id being accepted.
        session_id: String,
        /// Target peer identifier.
        to: String,
        /// Local SDP answer.
        sdp: String,
        /// Advertised local capability.
        offer: Offer,
        /// Requested remote capability.
        offer_to_receive: Offer,
    },
    /// `session-update`: renegotiation offer or answer.
    #[serde(rename_all = "camelCase")]
    SessionUpdate {
        /// Session id being updated.
        session_id: String,
        /// Whether this update carries an offer or an answer.
        update_type: UpdateType,
        /// SDP payload.
        sdp: String,
    },
    /// `transport-info`: ICE candidate batch.
    #[serde(rename_all = "camelCase")]
    TransportInfo {
        /// Session id these candidates belong to.
        session_id: String,
        /// Candidate batch.
        candidates: Vec<TransportCandidate>,
    },
    /// `session-terminate`: end a session.
    #[serde(rename_all = "camelCase")]
    SessionTerminate {
        /// Session id being terminated.
        session_id: String,
        /// Why the session is ending.
        reason: TerminateReason,
    },
    /// `invite-call-room`: invite a peer into a call room.
    #[serde(rename_all = "camelCase")]
    InviteCallRoom {
        /// Session id the invite is carried over.
        session_id: String,
        /// Outbound twincode id identifying the inviter.
        twincode_outbound_id: String,
        /// Target call room id.
        call_room_id: String,
        /// Room mode (reserved; always 0).
        mode: i32,
        /// Maximum member count (0 ⇒ unlimited).
        max_member_count: i32,
    },
    /// `join-callroom`: server-reported room roster on join.
    #[serde(rename_all = "camelCase")]
    JoinCallroom {
        /// Room being joined.
        call_room_id: String,
        /// This client's session id in the room.
        session_id: String,
        /// This client's member id in the room.
        member_id: String,
        /// Current roster.
        members: Vec<MemberEntry>,
    },
    /// `member-join`: incremental roster update.
    #[serde(rename_all = "camelCase")]
    MemberJoin {
        /// Session id, if one exists for this member.
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        /// Member id affected.
        member_id: String,
        /// New membership status.
        status: MemberStatus,
    },
    /// `device-ringing`: peer device is ringing.
    DeviceRinging {
        /// Session id, if known.
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    /// `ping`: keepalive probe.
    Ping {},
    /// `pong`: keepalive response.
    Pong {},
}

/// Events the transport surfaces to the call aggregator.
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    /// First `session-config` was received; safe to start creating peer
    /// connections (§4.3 "Readiness callback").
    Ready,
    /// A frame was received from the gateway.
    Frame(SignalingFrame),
    /// The socket closed; `code` follows §4.3's taxonomy.
    Closed {
        /// Close code.
        code: u16,
    },
    /// The reconnect policy was exhausted (§4.3 "onServerClose").
    ServerClosed,
}

/// Full-duplex signaling transport to the gateway.
pub struct SignalingTransport {
    config: CallCoreConfig,
    session_id: ClientSessionId,
    state: Arc<RwLock<SignalingState>>,
    events_tx: broadcast::Sender<SignalingEvent>,
    outbound_tx: mpsc::Sender<SignalingFrame>,
    outbound_rx: tokio::sync::Mutex<Option<mpsc::Receiver<SignalingFrame>>>,
    active_call: Arc<dyn ActiveCallQuery>,
    retry_attempts: AtomicU32,
}

impl SignalingTransport {
    /// Construct a transport bound to `config`'s gateway URL, generating a
    /// fresh stable client session-id.
    #[must_use]
    pub fn new(config: CallCoreConfig, active_call: Arc<dyn ActiveCallQuery>) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(256);
        let (outbound_tx, outbound_rx) = mpsc::channel(256);
        Arc::new(Self {
            config,
            session_id: ClientSessionId::generate(),
            state: Arc::new(RwLock::new(SignalingState::Disconnected)),
            events_tx,
            outbound_tx,
            outbound_rx: tokio::sync::Mutex::new(Some(outbound_rx)),
            active_call,
            retry_attempts: AtomicU32::new(0),
        })
    }

    /// The stable client session-id, unchanged across reconnects (§4.3).
    #[must_use]
    pub fn client_session_id(&self) -> &ClientSessionId {
        &self.session_id
    }

    /// Current state.
    pub async fn state(&self) -> SignalingState {
        *self.state.read().await
    }

    /// Subscribe to transport events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.events_tx.subscribe()
    }

    /// Enqueue an outbound frame. Dropped silently if not READY (§4.3,
    /// §5 "Backpressure"); the caller is responsible for re-sending via
    /// higher layers if that matters.
    pub async fn send(&self, frame: SignalingFrame) {
        if *self.state.read().await != SignalingState::Ready
            && !matches!(frame, SignalingFrame::SessionRequest { .. })
        {
            tracing::warn!("dropping outbound frame: transport not READY");
            return;
        }
        if self.outbound_tx.send(frame).await.is_err() {
            tracing::warn!("dropping outbound frame: transport loop has exited");
        }
    }

    /// Drive the connect/reconnect loop until the retry policy is
    /// exhausted or the caller drops the returned task. Spawns onto the
    /// current Tokio runtime.
    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run().await })
    }

    #[tracing::instrument(skip(self), fields(client_session_id = %self.session_id))]
    async fn run(self: Arc<Self>) {
        let mut outbound_rx = match self.outbound_rx.lock().await.take() {
            Some(rx) => rx,
            None => {
                tracing::error!("signaling transport already running");
                return;
            }
        };
        loop {
            *self.state.write().await = SignalingState::Connecting;
            match self.connect_and_handle(&mut outbound_rx).await {
                Ok(()) => {
                    *self.state.write().await = SignalingState::Disconnected;
                    let _ = self.events_tx.send(SignalingEvent::Closed {
                        code: CLOSE_NORMAL,
                    });
                    break;
                }
                Err(err) => {
                    *self.state.write().await = SignalingState::Disconnected;
                    let code = close_code_for(&err);
                    let _ = self.events_tx.send(SignalingEvent::Closed { code });
                    tracing::warn!(error = %err, "signaling connection lost");

                    if !self.active_call.needs_connection().await {
                        break;
                    }
                    let attempt = self.retry_attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    if attempt > MAX_RETRY_ATTEMPTS {
                        let _ = self.events_tx.send(SignalingEvent::ServerClosed);
                        break;
                    }
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
        }
    }

    async fn connect_and_handle(
        &self,
        outbound_rx: &mut mpsc::Receiver<SignalingFrame>,
    ) -> Result<(), SignalingError> {
        let (ws_stream, _) = tokio::time::timeout(
            CONNECT_TIMEOUT,
            tokio_tungstenite::connect_async(self.config.proxy_url.as_str()),
        )
        .await
        .map_err(|_| SignalingError::ConnectTimeout)?
        .map_err(|e| SignalingError::Transport(e.to_string()))?;

        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        let request = SignalingFrame::SessionRequest {
            session_id: self.session_id.as_str().to_string(),
        };
        let payload = serde_json::to_string(&request)
            .map_err(|e| SignalingError::Malformed(e.to_string()))?;
        ws_tx
            .send(WsMessage::Text(payload))
            .await
            .map_err(|e| SignalingError::Transport(e.to_string()))?;
        *self.state.write().await = SignalingState::Negotiating;

        let mut last_receive = Instant::now();
        let mut ping_tick = tokio::time::interval(PING_INTERVAL);
        ping_tick.tick().await;

        loop {
            tokio::select! {
                msg = ws_rx.next() => {
                    match msg {
                        Some(Ok(WsMessage::Text(text))) => {
                            last_receive = Instant::now();
                            self.retry_attempts.store(0, Ordering::SeqCst);
                            self.handle_inbound_text(&text).await?;
                        }
                        Some(Ok(WsMessage::Close(_))) | None => return Ok(()),
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(SignalingError::Transport(e.to_string())),
                    }
                }
                Some(frame) = outbound_rx.recv() => {
                    let payload = serde_json::to_string(&frame)
                        .map_err(|e| SignalingError::Malformed(e.to_string()))?;
                    ws_tx
                        .send(WsMessage::Text(payload))
                        .await
                        .map_err(|e| SignalingError::Transport(e.to_string()))?;
                }
                _ = ping_tick.tick() => {
                    let silence = last_receive.elapsed();
                    if silence > PING_TIMEOUT {
                        let _ = ws_tx
                            .send(WsMessage::Close(Some(CloseFrame {
                                code: CloseCode::from(CLOSE_PING_TIMEOUT),
                                reason: "ping timeout".into(),
                            })))
                            .await;
                        return Err(SignalingError::PingTimeout);
                    }
                    if silence > PING_INTERVAL {
                        if self.active_call.needs_connection().await {
                            let ping = SignalingFrame::Ping {};
                            let payload = serde_json::to_string(&ping)
                                .map_err(|e| SignalingError::Malformed(e.to_string()))?;
                            ws_tx
                                .send(WsMessage::Text(payload))
                                .await
                                .map_err(|e| SignalingError::Transport(e.to_string()))?;
                        } else {
                            let _ = ws_tx
                                .send(WsMessage::Close(Some(CloseFrame {
                                    code: CloseCode::from(CLOSE_NORMAL),
                                    reason: "idle".into(),
                                })))
                                .await;
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    async fn handle_inbound_text(&self, text: &str) -> Result<(), SignalingError> {
        let frame: SignalingFrame =
            serde_json::from_str(text).map_err(|e| SignalingError::Malformed(e.to_string()))?;

        if *self.state.read().await == SignalingState::Negotiating {
            if let SignalingFrame::SessionConfig { .. } = &frame {
                *self.state.write().await = SignalingState::Ready;
                let _ = self.events_tx.send(SignalingEvent::Ready);
                let _ = self.events_tx.send(SignalingEvent::Frame(frame));
            } else {
                tracing::debug!("dropping non session-config frame while negotiating");
            }
            return Ok(());
        }

        if matches!(frame, SignalingFrame::Pong {}) {
            return Ok(());
        }

        let _ = self.events_tx.send(SignalingEvent::Frame(frame));
        Ok(())
    }
}

fn close_code_for(err: &SignalingError) -> u16 {
    match err {
        SignalingError::ConnectTimeout => CLOSE_CONNECT_TIMEOUT,
        SignalingError::PingTimeout => CLOSE_PING_TIMEOUT,
        _ => CLOSE_GENERIC_ERROR,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn session_request_serializes_with_literal_session_id_key() {
        let frame = SignalingFrame::SessionRequest {
            session_id: "id-abc".to_string(),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["msg"], "session-request");
        assert_eq!(json["session-id"], "id-abc");
    }

    #[test]
    fn session_terminate_round_trips_reason() {
        let frame = SignalingFrame::SessionTerminate {
            session_id: "s1".to_string(),
            reason: TerminateReason::NotAuthorized,
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"reason\":\"not-authorized\""));
        let back: SignalingFrame = serde_json::from_str(&json).unwrap();
        match back {
            SignalingFrame::SessionTerminate { reason, .. } => {
                assert_eq!(reason, TerminateReason::NotAuthorized);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn ping_and_pong_round_trip() {
        let json = serde_json::to_string(&SignalingFrame::Ping {}).unwrap();
        assert_eq!(json, "{\"msg\":\"ping\"}");
        let back: SignalingFrame = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, SignalingFrame::Ping {}));
    }

    #[tokio::test]
    async fn no_active_call_reports_false() {
        let query = NoActiveCall;
        assert!(!query.needs_connection().await);
    }
}

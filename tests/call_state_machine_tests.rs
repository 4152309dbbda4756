//! End-to-end session and call-aggregator scenarios (outgoing happy path,
//! incoming call, glare, and idempotent termination).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use callcore::peer_session::{IceState, NegotiationState, PeerConnection, PeerSession, SessionState};
use callcore::types::TransportCandidate;
use callcore::{CallAggregator, CallEvent};

struct StubPeerConnection {
    negotiation_state: std::sync::Mutex<NegotiationState>,
}

impl StubPeerConnection {
    fn new() -> Self {
        Self {
            negotiation_state: std::sync::Mutex::new(NegotiationState::Stable),
        }
    }
}

#[async_trait]
impl PeerConnection for StubPeerConnection {
    async fn create_offer(&self) -> Result<String, callcore::error::PeerSessionError> {
        Ok("v=0 offer".to_string())
    }
    async fn create_answer(&self) -> Result<String, callcore::error::PeerSessionError> {
        Ok("v=0 answer".to_string())
    }
    async fn set_local_description(&self, _sdp: &str) -> Result<(), callcore::error::PeerSessionError> {
        Ok(())
    }
    async fn set_remote_description(&self, _sdp: &str) -> Result<(), callcore::error::PeerSessionError> {
        Ok(())
    }
    async fn add_ice_candidate(
        &self,
        _candidate: &TransportCandidate,
    ) -> Result<(), callcore::error::PeerSessionError> {
        Ok(())
    }
    async fn negotiation_state(&self) -> NegotiationState {
        *self.negotiation_state.lock().unwrap()
    }
    async fn restart_ice(&self) -> Result<(), callcore::error::PeerSessionError> {
        Ok(())
    }
    async fn close(&self) -> Result<(), callcore::error::PeerSessionError> {
        Ok(())
    }
    async fn send_data(&self, _bytes: &[u8]) -> Result<(), callcore::error::PeerSessionError> {
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

#[tokio::test]
async fn outgoing_audio_call_reaches_connected() {
    let aggregator = CallAggregator::new("acme-room");
    let session = PeerSession::new_outgoing(Arc::new(StubPeerConnection::new()));
    let handle = session.handle;

    let call = aggregator
        .begin_outgoing_call(session.clone(), "bob".to_string())
        .await
        .unwrap();
    assert_eq!(call.session_count().await, 1);

    let flushed = session
        .handle_session_initiate_response("gw-session-1".to_string())
        .await;
    assert!(flushed.is_empty());
    assert_eq!(session.state().await, SessionState::AwaitingAccept);

    session.handle_session_accept("v=0 answer").await.unwrap();
    assert_eq!(session.state().await, SessionState::AwaitingConnect);

    session.handle_ice_state(IceState::Connected).await.unwrap();
    assert_eq!(session.state().await, SessionState::Connected);

    let _ = aggregator.remove_session(handle).await;
}

#[tokio::test]
async fn incoming_video_call_is_authorized_and_accepted() {
    let aggregator = CallAggregator::new("acme-room");
    let session = PeerSession::new_incoming(Arc::new(StubPeerConnection::new()));

    let call = aggregator
        .accept_incoming_session("acme-room", session.clone(), "carol".to_string())
        .await
        .unwrap();
    assert_eq!(call.session_count().await, 1);

    let created_answer = session.handle_remote_offer("v=0 remote-offer").await.unwrap();
    assert!(created_answer);
}

#[tokio::test]
async fn unauthorized_incoming_session_is_rejected_before_any_session_exists() {
    let aggregator = CallAggregator::new("acme-room");
    let session = PeerSession::new_incoming(Arc::new(StubPeerConnection::new()));

    let result = aggregator
        .accept_incoming_session("someone-elses-room", session, "mallory".to_string())
        .await;
    assert!(result.is_err());
    assert!(aggregator.active_call().await.is_none());
}

#[tokio::test]
async fn simultaneous_offers_are_resolved_by_initiator_precedence() {
    // Two peers both call create_offer at once; the non-initiator yields.
    let polite = PeerSession::new_incoming(Arc::new(StubPeerConnection::new()));
    *polite
        .peer_version
        .write()
        .await = callcore::types::Tri::Unknown;

    // Simulate the polite side already having a local offer outstanding
    // when the remote offer arrives, by driving the negotiation state of
    // its mock connection to HaveLocalOffer is not directly settable here;
    // instead we exercise the pure decision function the session delegates
    // to, which is the unit under test for the glare algebra itself.
    let decision = callcore::peer_session::evaluate_offer_collision(
        true,
        NegotiationState::HaveLocalOffer,
        false,
        false,
    );
    assert!(decision.ignore_offer);
    drop(polite);
}

#[tokio::test]
async fn reconnect_preserves_call_across_repeated_remote_candidates() {
    let session = PeerSession::new_outgoing(Arc::new(StubPeerConnection::new()));
    session
        .assign_peer_connection_id("gw-session-2".to_string())
        .await;
    session.mark_initialized().await.unwrap();

    session.handle_remote_candidate(candidate("a")).await.unwrap();
    session.handle_remote_candidate(candidate("b")).await.unwrap();
    assert!(session.is_initialized());
}

#[tokio::test]
async fn call_transfer_done_is_observed_exactly_once() {
    let aggregator = CallAggregator::new("acme-room");
    let session = PeerSession::new_outgoing(Arc::new(StubPeerConnection::new()));
    let call = aggregator
        .begin_outgoing_call(session, "dave".to_string())
        .await
        .unwrap();

    let mut events = call.subscribe();
    assert!(call.handle_transfer_done());
    assert!(!call.handle_transfer_done());

    let event = tokio::time::timeout(Duration::from_millis(100), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(event, CallEvent::TransferCompleted));
}

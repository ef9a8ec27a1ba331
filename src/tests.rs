use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::interceptor::Attributes;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtcp::packet::Packet as RtcpPacket;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

use crate::dto::ConnDirection;
use crate::error::EngineError;
use crate::id_types::{PeerId, RoomId};
use crate::registry::RoomsRegistry;
use crate::session::{
    ConnectionStateHandler, IceCandidateHandler, MediaSession, RemoteTrackInfo, RemoteTrackSource,
    RtpSenderHandle, SessionFactory, TrackHandler,
};
use crate::signaling::{RejoinRequest, SignalingClient};

/// Smallest SDP the webrtc crate will parse.
const STUB_SDP: &str = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n";

struct FakeSender {
    track_id: String,
}

#[async_trait]
impl RtpSenderHandle for FakeSender {
    async fn track_id(&self) -> Option<String> {
        Some(self.track_id.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Default)]
struct Handlers {
    ice: Option<Arc<IceCandidateHandler>>,
    state: Option<Arc<ConnectionStateHandler>>,
    track: Option<Arc<TrackHandler>>,
}

/// In-memory session that records every engine operation and lets the
/// test fire the callbacks a real peer connection would.
struct FakeSession {
    direction: ConnDirection,
    handlers: Mutex<Handlers>,
    senders: Mutex<Vec<Arc<FakeSender>>>,
    receivers: Mutex<Vec<RemoteTrackInfo>>,
    state: Mutex<RTCPeerConnectionState>,
    offers: AtomicUsize,
    answers: AtomicUsize,
    remote_descriptions: AtomicUsize,
    removed: Mutex<Vec<String>>,
    rtcp_written: AtomicUsize,
    ice_candidates: AtomicUsize,
    // Remaining add_ice_candidate calls to reject, simulating a session
    // whose remote description hasn't landed yet.
    ice_failures_left: AtomicUsize,
}

impl FakeSession {
    fn new(direction: ConnDirection) -> Self {
        FakeSession {
            direction,
            handlers: Mutex::new(Handlers::default()),
            senders: Mutex::new(Vec::new()),
            receivers: Mutex::new(Vec::new()),
            state: Mutex::new(RTCPeerConnectionState::New),
            offers: AtomicUsize::new(0),
            answers: AtomicUsize::new(0),
            remote_descriptions: AtomicUsize::new(0),
            removed: Mutex::new(Vec::new()),
            rtcp_written: AtomicUsize::new(0),
            ice_candidates: AtomicUsize::new(0),
            ice_failures_left: AtomicUsize::new(0),
        }
    }

    fn fire_track(&self, remote: Arc<dyn RemoteTrackSource>) {
        let handler = self.handlers.lock().unwrap().track.clone();
        handler.expect("no on_track handler registered")(remote);
    }

    fn fire_ice(&self, candidate: Option<RTCIceCandidateInit>) {
        let handler = self.handlers.lock().unwrap().ice.clone();
        handler.expect("no on_ice_candidate handler registered")(candidate);
    }

    fn fire_state(&self, state: RTCPeerConnectionState) {
        *self.state.lock().unwrap() = state;
        let handler = self.handlers.lock().unwrap().state.clone();
        if let Some(handler) = handler {
            handler(state);
        }
    }

    fn sender_ids(&self) -> Vec<String> {
        self.senders
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.track_id.clone())
            .collect()
    }

    fn set_receivers(&self, infos: Vec<RemoteTrackInfo>) {
        *self.receivers.lock().unwrap() = infos;
    }
}

#[async_trait]
impl MediaSession for FakeSession {
    fn on_ice_candidate(&self, handler: IceCandidateHandler) {
        self.handlers.lock().unwrap().ice = Some(Arc::new(handler));
    }

    fn on_connection_state_change(&self, handler: ConnectionStateHandler) {
        self.handlers.lock().unwrap().state = Some(Arc::new(handler));
    }

    fn on_track(&self, handler: TrackHandler) {
        self.handlers.lock().unwrap().track = Some(Arc::new(handler));
    }

    async fn add_ice_candidate(&self, _candidate: RTCIceCandidateInit) -> Result<()> {
        let left = self.ice_failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.ice_failures_left.store(left - 1, Ordering::SeqCst);
            return Err(anyhow!("remote description not set yet"));
        }
        self.ice_candidates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn set_remote_description(&self, _desc: RTCSessionDescription) -> Result<()> {
        self.remote_descriptions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn set_local_description(&self, _desc: RTCSessionDescription) -> Result<()> {
        Ok(())
    }

    async fn create_offer(&self) -> Result<RTCSessionDescription> {
        self.offers.fetch_add(1, Ordering::SeqCst);
        Ok(RTCSessionDescription::offer(STUB_SDP.to_string())?)
    }

    async fn create_answer(&self) -> Result<RTCSessionDescription> {
        self.answers.fetch_add(1, Ordering::SeqCst);
        Ok(RTCSessionDescription::answer(STUB_SDP.to_string())?)
    }

    async fn add_track(&self, sink: Arc<TrackLocalStaticRTP>) -> Result<Arc<dyn RtpSenderHandle>> {
        let sender = Arc::new(FakeSender {
            track_id: sink.id().to_string(),
        });
        self.senders.lock().unwrap().push(sender.clone());
        Ok(sender)
    }

    async fn remove_track(&self, sender: &Arc<dyn RtpSenderHandle>) -> Result<()> {
        let fake = sender
            .as_any()
            .downcast_ref::<FakeSender>()
            .expect("foreign sender handle");
        self.senders
            .lock()
            .unwrap()
            .retain(|s| s.track_id != fake.track_id);
        self.removed.lock().unwrap().push(fake.track_id.clone());
        Ok(())
    }

    async fn senders(&self) -> Vec<Arc<dyn RtpSenderHandle>> {
        self.senders
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.clone() as Arc<dyn RtpSenderHandle>)
            .collect()
    }

    async fn receivers(&self) -> Vec<RemoteTrackInfo> {
        self.receivers.lock().unwrap().clone()
    }

    async fn write_rtcp(&self, _packets: &[Box<dyn RtcpPacket + Send + Sync>]) -> Result<()> {
        self.rtcp_written.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn connection_state(&self) -> RTCPeerConnectionState {
        *self.state.lock().unwrap()
    }

    async fn close(&self) -> Result<()> {
        self.fire_state(RTCPeerConnectionState::Closed);
        Ok(())
    }
}

#[derive(Default)]
struct FakeSessionFactory {
    sessions: Mutex<Vec<Arc<FakeSession>>>,
}

impl FakeSessionFactory {
    fn session(&self, index: usize) -> Arc<FakeSession> {
        self.sessions.lock().unwrap()[index].clone()
    }

    fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }
}

#[async_trait]
impl SessionFactory for FakeSessionFactory {
    async fn create_session(&self, direction: ConnDirection) -> Result<Arc<dyn MediaSession>> {
        let session = Arc::new(FakeSession::new(direction));
        self.sessions.lock().unwrap().push(session.clone());
        Ok(session)
    }
}

/// Packet source fed from a channel; dropping the sender ends the track.
struct FakeRemoteTrack {
    id: String,
    stream_id: String,
    kind: String,
    ssrc: u32,
    capability: RTCRtpCodecCapability,
    packet_rx: tokio::sync::Mutex<mpsc::Receiver<Result<Packet>>>,
}

#[async_trait]
impl RemoteTrackSource for FakeRemoteTrack {
    fn id(&self) -> String {
        self.id.clone()
    }
    fn stream_id(&self) -> String {
        self.stream_id.clone()
    }
    fn kind(&self) -> String {
        self.kind.clone()
    }
    fn ssrc(&self) -> u32 {
        self.ssrc
    }
    fn codec_capability(&self) -> RTCRtpCodecCapability {
        self.capability.clone()
    }
    async fn read_rtp(&self) -> Result<(Packet, Attributes)> {
        let mut rx = self.packet_rx.lock().await;
        match rx.recv().await {
            Some(Ok(packet)) => Ok((packet, Attributes::new())),
            Some(Err(e)) => Err(e),
            None => Err(anyhow!("track ended")),
        }
    }
}

fn fake_track(id: &str, kind: &str) -> (Arc<FakeRemoteTrack>, mpsc::Sender<Result<Packet>>) {
    let (tx, rx) = mpsc::channel(16);
    let mime_type = if kind == "audio" {
        "audio/opus"
    } else {
        "video/VP8"
    };
    let track = Arc::new(FakeRemoteTrack {
        id: id.to_string(),
        stream_id: format!("stream-{}", id),
        kind: kind.to_string(),
        ssrc: 1000,
        capability: RTCRtpCodecCapability {
            mime_type: mime_type.to_string(),
            ..Default::default()
        },
        packet_rx: tokio::sync::Mutex::new(rx),
    });
    (track, tx)
}

struct Harness {
    registry: Arc<RoomsRegistry>,
    factory: Arc<FakeSessionFactory>,
    rejoin_rx: mpsc::UnboundedReceiver<RejoinRequest>,
}

fn harness(split_sessions: bool) -> Harness {
    let factory = Arc::new(FakeSessionFactory::default());
    // Nothing listens on the discard port; outbound signaling fails fast.
    let signaling = Arc::new(SignalingClient::new("http://127.0.0.1:9".to_string()));
    let (rejoin_tx, rejoin_rx) = mpsc::unbounded_channel();
    let registry = RoomsRegistry::new(factory.clone(), signaling, rejoin_tx, split_sessions);
    Harness {
        registry,
        factory,
        rejoin_rx,
    }
}

async fn eventually(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..150 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {}", what);
}

fn sorted(mut v: Vec<String>) -> Vec<String> {
    v.sort();
    v
}

#[tokio::test]
async fn test_three_peer_fanout_add_and_remove() {
    let h = harness(false);
    let room_id = RoomId::from("R");
    h.registry.create_room(room_id.clone(), 7);

    for (peer, can_publish, is_caller, dir) in [
        (1u64, true, true, ConnDirection::Send),
        (2, true, false, ConnDirection::Send),
        (3, false, false, ConnDirection::Recv),
    ] {
        h.registry
            .create_peer(room_id.clone(), PeerId(peer), can_publish, is_caller, 7, dir)
            .await
            .unwrap();
    }
    assert_eq!(h.factory.session_count(), 3);
    let s1 = h.factory.session(0);
    let s2 = h.factory.session(1);
    let s3 = h.factory.session(2);

    // Scenario 1: the caller publishes audio a1 and video v1.
    let (a1, _a1_feed) = fake_track("a1", "audio");
    s1.fire_track(a1);
    // Audio alone must not renegotiate the caller's subscribers yet.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(s2.sender_ids().is_empty());

    let (v1, _v1_feed) = fake_track("v1", "video");
    s1.fire_track(v1);

    eventually("peers 2 and 3 to receive a1 and v1", || {
        sorted(s2.sender_ids()) == vec!["a1", "v1"] && sorted(s3.sender_ids()) == vec!["a1", "v1"]
    })
    .await;
    assert!(s1.sender_ids().is_empty());

    // Scenario 2: a second publisher adds v2.
    let (v2, _v2_feed) = fake_track("v2", "video");
    s2.fire_track(v2);

    eventually("peers 1 and 3 to receive v2", || {
        s1.sender_ids() == vec!["v2"] && sorted(s3.sender_ids()) == vec!["a1", "v1", "v2"]
    })
    .await;
    assert_eq!(sorted(s2.sender_ids()), vec!["a1", "v1"]);

    // Scenario 3: the caller's video upstream dies.
    let offers_s2 = s2.offers.load(Ordering::SeqCst);
    let offers_s3 = s3.offers.load(Ordering::SeqCst);
    drop(_v1_feed);

    eventually("v1 to be retired everywhere", || {
        sorted(s2.sender_ids()) == vec!["a1"] && sorted(s3.sender_ids()) == vec!["a1", "v2"]
    })
    .await;
    let room = h.registry.get_room(&room_id).unwrap();
    assert_eq!(room.track_count(), 2);
    assert!(s2.removed.lock().unwrap().contains(&"v1".to_string()));
    assert!(s3.removed.lock().unwrap().contains(&"v1".to_string()));

    eventually("one renegotiation offer per affected peer", || {
        s2.offers.load(Ordering::SeqCst) == offers_s2 + 1
            && s3.offers.load(Ordering::SeqCst) == offers_s3 + 1
    })
    .await;
}

#[tokio::test]
async fn test_reconcile_is_idempotent() {
    let h = harness(false);
    let room_id = RoomId::from("R");
    h.registry.create_room(room_id.clone(), 1);
    h.registry
        .create_peer(room_id.clone(), PeerId(1), true, false, 1, ConnDirection::Send)
        .await
        .unwrap();
    h.registry
        .create_peer(room_id.clone(), PeerId(2), false, false, 1, ConnDirection::Recv)
        .await
        .unwrap();
    let s1 = h.factory.session(0);
    let s2 = h.factory.session(1);

    let (t, _feed) = fake_track("v1", "video");
    s1.fire_track(t);
    eventually("track to reach peer 2", || s2.sender_ids() == vec!["v1"]).await;

    let room = h.registry.get_room(&room_id).unwrap();
    let offers_before = s2.offers.load(Ordering::SeqCst);
    room.reconcile_tracks().await;
    room.reconcile_tracks().await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(s2.sender_ids(), vec!["v1"]);
    assert!(s2.removed.lock().unwrap().is_empty());
    assert_eq!(s2.offers.load(Ordering::SeqCst), offers_before);
}

#[tokio::test]
async fn test_caller_disconnect_triggers_rejoin_once() {
    let mut h = harness(false);
    let room_id = RoomId::from("R");
    h.registry.create_room(room_id.clone(), 7);
    h.registry
        .create_peer(room_id.clone(), PeerId(1), true, true, 7, ConnDirection::Send)
        .await
        .unwrap();
    let s1 = h.factory.session(0);
    let room = h.registry.get_room(&room_id).unwrap();

    s1.fire_state(RTCPeerConnectionState::Closed);
    eventually("peer 1 to leave the room", || room.peer_count() == 0).await;

    let req = h.rejoin_rx.try_recv().expect("one rejoin request");
    assert_eq!(req.room_id, "R");
    assert!(!req.simply_join);

    // A duplicate close event must not schedule a second rejoin.
    s1.fire_state(RTCPeerConnectionState::Closed);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.rejoin_rx.try_recv().is_err());
}

#[tokio::test]
async fn test_degraded_session_is_closed_and_removed() {
    let h = harness(false);
    let room_id = RoomId::from("R");
    h.registry.create_room(room_id.clone(), 7);
    h.registry
        .create_peer(room_id.clone(), PeerId(5), true, false, 7, ConnDirection::Send)
        .await
        .unwrap();
    let s = h.factory.session(0);
    let room = h.registry.get_room(&room_id).unwrap();
    assert_eq!(room.peer_count(), 1);

    // Failure closes the session; the close event then removes the peer.
    s.fire_state(RTCPeerConnectionState::Failed);
    eventually("failed peer to be removed", || room.peer_count() == 0).await;
    assert_eq!(s.connection_state(), RTCPeerConnectionState::Closed);
}

#[tokio::test]
async fn test_close_peer_removes_entry_via_callback() {
    let h = harness(false);
    let room_id = RoomId::from("R");
    h.registry.create_room(room_id.clone(), 7);
    h.registry
        .create_peer(room_id.clone(), PeerId(4), false, false, 7, ConnDirection::Recv)
        .await
        .unwrap();
    let room = h.registry.get_room(&room_id).unwrap();

    h.registry.close_peer(&room_id, PeerId(4)).await.unwrap();
    eventually("closed peer to leave the map", || room.peer_count() == 0).await;

    // Exists-check precedes any session access.
    let err = h.registry.close_peer(&room_id, PeerId(4)).await.unwrap_err();
    assert!(matches!(err, EngineError::PeerNotFound { .. }));
}

#[tokio::test]
async fn test_create_room_is_idempotent() {
    let h = harness(false);
    let room_id = RoomId::from("R");
    h.registry.create_room(room_id.clone(), 7);
    h.registry.create_room(room_id.clone(), 9);
    assert_eq!(h.registry.room_ggid(&room_id), Some(7));
}

#[tokio::test]
async fn test_reset_room_forgets_everything() {
    let h = harness(false);
    let room_id = RoomId::from("R");
    h.registry.create_room(room_id.clone(), 7);
    h.registry
        .create_peer(room_id.clone(), PeerId(1), true, false, 7, ConnDirection::Send)
        .await
        .unwrap();

    assert_eq!(h.registry.reset_room(&room_id).await, 7);
    assert!(!h.registry.does_room_exist(&room_id));
    assert_eq!(h.registry.room_ggid(&room_id), None);

    // Unknown rooms reset to generation zero without error.
    assert_eq!(h.registry.reset_room(&room_id).await, 0);
}

#[tokio::test]
async fn test_ice_candidate_for_unknown_peer_is_rejected() {
    let h = harness(false);
    let room_id = RoomId::from("R");
    h.registry.create_room(room_id.clone(), 7);

    let err = h
        .registry
        .add_peer_ice_candidate(
            &room_id,
            PeerId(99),
            RTCIceCandidateInit::default(),
            ConnDirection::Send,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::PeerNotFound { .. }));

    let err = h
        .registry
        .add_peer_ice_candidate(
            &RoomId::from("missing"),
            PeerId(1),
            RTCIceCandidateInit::default(),
            ConnDirection::Send,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::RoomNotFound { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_ice_candidate_retries_transient_session_failures() {
    let h = harness(false);
    let room_id = RoomId::from("R");
    h.registry.create_room(room_id.clone(), 7);
    h.registry
        .create_peer(room_id.clone(), PeerId(1), true, false, 7, ConnDirection::Send)
        .await
        .unwrap();
    let s = h.factory.session(0);
    s.ice_failures_left.store(2, Ordering::SeqCst);

    h.registry
        .add_peer_ice_candidate(
            &room_id,
            PeerId(1),
            RTCIceCandidateInit::default(),
            ConnDirection::Send,
        )
        .await
        .unwrap();
    assert_eq!(s.ice_candidates.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_trickle_ice_relay_is_best_effort() {
    let h = harness(false);
    let room_id = RoomId::from("R");
    h.registry.create_room(room_id.clone(), 7);
    h.registry
        .create_peer(room_id.clone(), PeerId(1), true, true, 7, ConnDirection::Send)
        .await
        .unwrap();
    let s = h.factory.session(0);

    // The gathering-complete marker is dropped; a real candidate is
    // relayed (and the unreachable signaler is only a log line).
    s.fire_ice(None);
    s.fire_ice(Some(RTCIceCandidateInit {
        candidate: "candidate:1 1 udp 2130706431 192.0.2.1 54400 typ host".to_string(),
        ..Default::default()
    }));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.registry.get_room(&room_id).unwrap().peer_count(), 1);
}

#[tokio::test]
async fn test_offer_answer_handshake_lock_pairs() {
    let h = harness(false);
    let room_id = RoomId::from("R");
    h.registry.create_room(room_id.clone(), 7);
    h.registry
        .create_peer(room_id.clone(), PeerId(1), true, true, 7, ConnDirection::Send)
        .await
        .unwrap();
    let room = h.registry.get_room(&room_id).unwrap();
    let peer = room.get_peer(PeerId(1)).unwrap();
    let handle = peer.session(ConnDirection::Recv).unwrap();

    // Outbound offer path leaves the lock held; POST fails here, so it is
    // released again. Simulate the held state directly instead.
    handle.handshake.acquire().await;
    assert!(handle.handshake.is_held());

    let answer = RTCSessionDescription::answer(STUB_SDP.to_string()).unwrap();
    h.registry
        .set_peer_answer(&room_id, PeerId(1), answer.clone(), ConnDirection::Recv)
        .await
        .unwrap();
    assert!(!handle.handshake.is_held());

    // A stray second answer applies but must not over-release.
    h.registry
        .set_peer_answer(&room_id, PeerId(1), answer, ConnDirection::Recv)
        .await
        .unwrap();
    assert!(!handle.handshake.is_held());
}

#[tokio::test]
async fn test_inbound_offer_is_a_publisher_privilege() {
    let h = harness(false);
    let room_id = RoomId::from("R");
    h.registry.create_room(room_id.clone(), 7);
    h.registry
        .create_peer(room_id.clone(), PeerId(1), false, false, 7, ConnDirection::Recv)
        .await
        .unwrap();

    let offer = RTCSessionDescription::offer(STUB_SDP.to_string()).unwrap();
    let err = h
        .registry
        .set_peer_offer(&room_id, PeerId(1), offer, ConnDirection::Recv)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::OfferNotAllowed { .. }));
    assert_eq!(err.http_status(), 403);
}

#[tokio::test]
async fn test_split_sessions_handshake_independently() {
    let h = harness(true);
    let room_id = RoomId::from("R");
    h.registry.create_room(room_id.clone(), 7);
    h.registry
        .create_peer(room_id.clone(), PeerId(1), true, true, 7, ConnDirection::Send)
        .await
        .unwrap();
    h.registry
        .create_peer(room_id.clone(), PeerId(1), true, true, 7, ConnDirection::Recv)
        .await
        .unwrap();
    assert_eq!(h.factory.session_count(), 2);
    assert_eq!(h.factory.session(0).direction, ConnDirection::Send);
    assert_eq!(h.factory.session(1).direction, ConnDirection::Recv);

    let room = h.registry.get_room(&room_id).unwrap();
    let peer = room.get_peer(PeerId(1)).unwrap();
    let send = peer.session(ConnDirection::Send).unwrap();
    let recv = peer.session(ConnDirection::Recv).unwrap();
    assert!(!Arc::ptr_eq(&send, &recv));

    // A SEND handshake in flight must not block a RECV offer.
    send.handshake.acquire().await;
    let result = tokio::time::timeout(
        Duration::from_secs(2),
        room.offer_peer(&peer, ConnDirection::Recv),
    )
    .await
    .expect("recv offer must not wait on the send handshake");
    // The outbound POST has nowhere to go in tests; the offer itself was
    // still created on the recv session.
    assert!(result.is_err());
    let recv_session = h.factory.session(1);
    assert_eq!(recv_session.offers.load(Ordering::SeqCst), 1);
    // Failed outbound negotiation returns the recv lock.
    assert!(!recv.handshake.is_held());
}

#[tokio::test]
async fn test_single_session_mode_shares_one_handle() {
    let h = harness(false);
    let room_id = RoomId::from("R");
    h.registry.create_room(room_id.clone(), 7);
    h.registry
        .create_peer(room_id.clone(), PeerId(1), true, true, 7, ConnDirection::Send)
        .await
        .unwrap();

    let room = h.registry.get_room(&room_id).unwrap();
    let peer = room.get_peer(PeerId(1)).unwrap();
    let send = peer.session(ConnDirection::Send).unwrap();
    let recv = peer.session(ConnDirection::Recv).unwrap();
    assert!(Arc::ptr_eq(&send, &recv));
    assert_eq!(peer.sessions().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_keyframe_ticker_sends_pli() {
    let h = harness(false);
    let room_id = RoomId::from("R");
    h.registry.create_room(room_id.clone(), 7);
    h.registry
        .create_peer(room_id.clone(), PeerId(1), true, true, 7, ConnDirection::Send)
        .await
        .unwrap();
    let s = h.factory.session(0);
    s.set_receivers(vec![RemoteTrackInfo {
        track_id: "v1".to_string(),
        ssrc: 4242,
    }]);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(s.rtcp_written.load(Ordering::SeqCst) >= 2);
}

mod http_surface {
    use super::*;
    use serde_json::json;

    fn routes(
        h: &Harness,
    ) -> impl warp::Filter<Extract = impl warp::Reply, Error = std::convert::Infallible> + Clone {
        crate::http_api::routes(h.registry.clone())
    }

    #[tokio::test]
    async fn test_healthcheck() {
        let h = harness(false);
        let api = routes(&h);

        let res = warp::test::request()
            .method("GET")
            .path("/healthcheck")
            .reply(&api)
            .await;
        assert_eq!(res.status(), 204);

        let res = warp::test::request()
            .method("GET")
            .path("/healthcheck?roomId=missing")
            .reply(&api)
            .await;
        assert_eq!(res.status(), 404);

        h.registry.create_room(RoomId::from("R"), 7);
        let res = warp::test::request()
            .method("GET")
            .path("/healthcheck?roomId=R")
            .reply(&api)
            .await;
        assert_eq!(res.status(), 204);
    }

    #[tokio::test]
    async fn test_create_peer_validation_and_state_errors() {
        let h = harness(false);
        let api = routes(&h);

        // Unknown room: state error class.
        let res = warp::test::request()
            .method("POST")
            .path("/room/peer")
            .json(&json!({
                "roomId": "nope", "id": 1, "ggid": 1,
                "canPublish": true, "isCaller": false,
                "connectionDirection": "send"
            }))
            .reply(&api)
            .await;
        assert_eq!(res.status(), 403);

        // Empty roomId: invalid payload.
        let res = warp::test::request()
            .method("POST")
            .path("/room/peer")
            .json(&json!({
                "roomId": "", "id": 1,
                "connectionDirection": "send"
            }))
            .reply(&api)
            .await;
        assert_eq!(res.status(), 422);

        // Malformed JSON: bad request.
        let res = warp::test::request()
            .method("POST")
            .path("/room/peer")
            .body("{nope")
            .reply(&api)
            .await;
        assert_eq!(res.status(), 400);

        // And the good path.
        h.registry.create_room(RoomId::from("R"), 7);
        let res = warp::test::request()
            .method("POST")
            .path("/room/peer")
            .json(&json!({
                "roomId": "R", "id": 1, "ggid": 7,
                "canPublish": true, "isCaller": true,
                "connectionDirection": "send"
            }))
            .reply(&api)
            .await;
        assert_eq!(res.status(), 204);
        assert_eq!(h.factory.session_count(), 1);
    }

    #[tokio::test]
    async fn test_offer_round_trip_produces_answer() {
        let h = harness(false);
        let api = routes(&h);
        h.registry.create_room(RoomId::from("R"), 7);
        h.registry
            .create_peer(
                RoomId::from("R"),
                PeerId(1),
                true,
                true,
                7,
                ConnDirection::Send,
            )
            .await
            .unwrap();

        let res = warp::test::request()
            .method("POST")
            .path("/room/offer")
            .json(&json!({
                "roomId": "R", "id": 1, "ggid": 7,
                "sdp": {"type": "offer", "sdp": STUB_SDP},
                "connectionDirection": "send"
            }))
            .reply(&api)
            .await;
        assert_eq!(res.status(), 204);

        let s = h.factory.session(0);
        assert_eq!(s.remote_descriptions.load(Ordering::SeqCst), 1);
        assert_eq!(s.answers.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reset_room_reports_generation() {
        let h = harness(false);
        let api = routes(&h);
        h.registry.create_room(RoomId::from("R"), 12);

        let res = warp::test::request()
            .method("DELETE")
            .path("/room")
            .json(&json!({"roomId": "R"}))
            .reply(&api)
            .await;
        assert_eq!(res.status(), 200);
        let body: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(body["ggid"], 12);
        assert!(!h.registry.does_room_exist(&RoomId::from("R")));
    }

    #[tokio::test]
    async fn test_answer_for_unknown_room_is_403() {
        let h = harness(false);
        let api = routes(&h);

        let res = warp::test::request()
            .method("POST")
            .path("/room/answer")
            .json(&json!({
                "roomId": "ghost", "id": 1, "ggid": 1,
                "sdp": {"type": "answer", "sdp": STUB_SDP},
                "connectionDirection": "recv"
            }))
            .reply(&api)
            .await;
        assert_eq!(res.status(), 403);
        let body: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(body["message"], "room doesn't exist");
    }
}

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocalWriter;

use crate::dto::ConnDirection;
use crate::error::EngineError;
use crate::id_types::{PeerId, RoomId, TrackId};
use crate::metrics::{
    SFU_KEYFRAMES_REQUESTED_TOTAL, SFU_PACKETS_FORWARDED_TOTAL, SFU_RENEGOTIATIONS_TOTAL,
};
use crate::peer::{Peer, SessionHandle};
use crate::registry::RoomsRegistry;
use crate::session::{RemoteTrackSource, RtpSenderHandle};
use crate::signaling::SignalingClient;

/// How long an inbound track may stay silent before its read loop gives
/// up; re-armed before every read.
const TRACK_READ_DEADLINE: Duration = Duration::from_secs(8);
/// Cadence of unconditional PLIs toward publishers.
const KEYFRAME_INTERVAL: Duration = Duration::from_secs(3);

/// An active inbound track and the local sink every subscriber is wired
/// to. The sink fans one written packet out to all attached senders.
#[derive(Clone)]
pub struct RoomTrack {
    pub owner: PeerId,
    pub sink: Arc<TrackLocalStaticRTP>,
    pub kind: String,
}

/// One signaling-managed room: its peers, its live track set, and the
/// keyframe ticker. The generation id is fixed for the life of the room;
/// a reset destroys the room and the next join builds a fresh one.
pub struct Room {
    pub id: RoomId,
    pub ggid: u64,
    peers: DashMap<PeerId, Arc<Peer>>,
    tracks: DashMap<TrackId, RoomTrack>,
    ticker: Mutex<Option<JoinHandle<()>>>,
    // Reconciliation runs are serialized; concurrent triggers would race
    // the sender snapshots and double-add a sink.
    reconcile_lock: AsyncMutex<()>,
    gone: AtomicBool,
    signaling: Arc<SignalingClient>,
    registry: Weak<RoomsRegistry>,
}

impl Room {
    pub fn new(
        id: RoomId,
        ggid: u64,
        signaling: Arc<SignalingClient>,
        registry: Weak<RoomsRegistry>,
    ) -> Arc<Self> {
        let room = Arc::new(Room {
            id,
            ggid,
            peers: DashMap::new(),
            tracks: DashMap::new(),
            ticker: Mutex::new(None),
            reconcile_lock: AsyncMutex::new(()),
            gone: AtomicBool::new(false),
            signaling,
            registry,
        });
        room.spawn_keyframe_ticker();
        room
    }

    pub fn is_gone(&self) -> bool {
        self.gone.load(Ordering::SeqCst)
    }

    pub fn get_peer(&self, peer_id: PeerId) -> Option<Arc<Peer>> {
        self.peers.get(&peer_id).map(|p| p.clone())
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    fn snapshot_peers(&self) -> Vec<Arc<Peer>> {
        self.peers.iter().map(|entry| entry.value().clone()).collect()
    }

    fn snapshot_tracks(&self) -> Vec<(TrackId, RoomTrack)> {
        self.tracks
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Inserts the peer if absent and installs the new session handle at
    /// the slot named by `direction` (both slots in single-session mode).
    /// Returns the peer and whether it was newly created.
    pub fn install_session(
        &self,
        peer_id: PeerId,
        can_publish: bool,
        is_caller: bool,
        direction: ConnDirection,
        handle: Arc<SessionHandle>,
        split_sessions: bool,
    ) -> (Arc<Peer>, bool) {
        let mut created = false;
        let peer = self
            .peers
            .entry(peer_id)
            .or_insert_with(|| {
                created = true;
                Arc::new(Peer::new(peer_id, can_publish, is_caller))
            })
            .clone();
        if split_sessions {
            peer.install(direction, handle);
        } else {
            peer.install_single(handle);
        }
        (peer, created)
    }

    /// Drops the peer from the map. Called from the close-state callback
    /// only; the sessions are already terminal at that point.
    pub fn remove_peer(&self, peer_id: PeerId) -> Option<Arc<Peer>> {
        self.peers.remove(&peer_id).map(|(_, peer)| peer)
    }

    /// Consumes one inbound track: registers the local sink, pumps RTP
    /// into it until the remote goes away, then retires the track and
    /// reconciles the subscribers.
    pub async fn handle_remote_track(
        self: Arc<Self>,
        peer: Arc<Peer>,
        remote: Arc<dyn RemoteTrackSource>,
    ) {
        let track_id = TrackId::from(remote.id());
        let kind = remote.kind();
        info!(room = %self.id, peer = %peer.id, track = %track_id, kind = %kind, "inbound track");

        let sink = Arc::new(TrackLocalStaticRTP::new(
            remote.codec_capability(),
            remote.id(),
            remote.stream_id(),
        ));
        self.tracks.insert(
            track_id.clone(),
            RoomTrack {
                owner: peer.id,
                sink: sink.clone(),
                kind: kind.clone(),
            },
        );

        let was_first = match kind.as_str() {
            "audio" => !peer.got_first_audio.swap(true, Ordering::SeqCst),
            "video" => !peer.got_first_video.swap(true, Ordering::SeqCst),
            _ => false,
        };

        // The caller publishes both kinds; renegotiating subscribers once
        // per kind in close succession is wasted churn, so wait for the
        // second kind before reconciling.
        let one_kind_pending = peer.got_first_audio.load(Ordering::SeqCst)
            != peer.got_first_video.load(Ordering::SeqCst);
        if peer.is_caller && peer.can_publish && one_kind_pending {
            debug!(room = %self.id, peer = %peer.id, track = %track_id, "deferring reconciliation until the other media kind arrives");
        } else {
            let room = self.clone();
            tokio::spawn(async move { room.reconcile_tracks().await });
        }

        loop {
            match tokio::time::timeout(TRACK_READ_DEADLINE, remote.read_rtp()).await {
                Ok(Ok((packet, _))) => {
                    SFU_PACKETS_FORWARDED_TOTAL.with_label_values(&[&kind]).inc();
                    if let Err(e) = sink.write_rtp(&packet).await {
                        debug!(track = %track_id, error = %e, "sink write failed, ending track loop");
                        break;
                    }
                }
                Ok(Err(e)) => {
                    debug!(track = %track_id, error = %e, "inbound track ended");
                    break;
                }
                Err(_) => {
                    warn!(track = %track_id, "inbound track read deadline elapsed");
                    break;
                }
            }
        }

        self.tracks.remove(&track_id);
        self.reconcile_tracks().await;

        if was_first && peer.is_caller && !peer.triggered_reconnect.swap(true, Ordering::SeqCst) {
            if let Some(registry) = self.registry.upgrade() {
                registry.on_caller_disconnected(&self.id);
            }
        }
    }

    /// Aligns every peer's outgoing senders with the room's track set:
    /// tracks the peer doesn't own and isn't yet sending or receiving get
    /// added; senders whose track left the set get removed. Peers whose
    /// sender set changed are re-offered asynchronously. Idempotent on an
    /// unchanged track set.
    pub async fn reconcile_tracks(self: &Arc<Self>) {
        let _serialized = self.reconcile_lock.lock().await;
        if self.is_gone() {
            return;
        }
        for peer in self.snapshot_peers() {
            let Some(recv) = peer.session(ConnDirection::Recv) else {
                continue;
            };
            if recv.session.connection_state() == RTCPeerConnectionState::Closed {
                continue;
            }

            let mut forwarded: HashMap<String, Arc<dyn RtpSenderHandle>> = HashMap::new();
            for sender in recv.session.senders().await {
                if let Some(id) = sender.track_id().await {
                    forwarded.insert(id, sender);
                }
            }
            let mut receiving: HashSet<String> = HashSet::new();
            if let Some(send) = peer.session(ConnDirection::Send) {
                for info in send.session.receivers().await {
                    receiving.insert(info.track_id);
                }
            }

            let mut renegotiate = false;
            let live = self.snapshot_tracks();
            for (track_id, track) in &live {
                if track.owner == peer.id {
                    continue;
                }
                if forwarded.contains_key(track_id.as_ref())
                    || receiving.contains(track_id.as_ref())
                {
                    continue;
                }
                match recv.session.add_track(track.sink.clone()).await {
                    Ok(_) => {
                        info!(room = %self.id, peer = %peer.id, track = %track_id, "forwarding track to peer");
                        renegotiate = true;
                    }
                    Err(e) => {
                        warn!(room = %self.id, peer = %peer.id, track = %track_id, error = %e, "add_track failed")
                    }
                }
            }

            let live_ids: HashSet<&str> = live.iter().map(|(id, _)| id.as_ref()).collect();
            for (track_id, sender) in &forwarded {
                if live_ids.contains(track_id.as_str()) {
                    continue;
                }
                match recv.session.remove_track(sender).await {
                    Ok(()) => {
                        info!(room = %self.id, peer = %peer.id, track = %track_id, "retiring forwarded track");
                        renegotiate = true;
                    }
                    Err(e) => {
                        warn!(room = %self.id, peer = %peer.id, track = %track_id, error = %e, "remove_track failed")
                    }
                }
            }

            if renegotiate {
                let room = self.clone();
                let peer = peer.clone();
                tokio::spawn(async move {
                    if let Err(e) = room.offer_peer(&peer, ConnDirection::Recv).await {
                        warn!(room = %room.id, peer = %peer.id, error = %e, "renegotiation offer failed");
                    }
                });
            }
        }
    }

    /// Creates a fresh offer on the peer's session for `direction` and
    /// posts it to logjam. The handshake lock stays held on success until
    /// the remote's answer lands; any failure releases it here.
    pub async fn offer_peer(
        &self,
        peer: &Arc<Peer>,
        direction: ConnDirection,
    ) -> Result<(), EngineError> {
        let handle = peer.session(direction).ok_or(EngineError::NoSession {
            room_id: self.id.clone(),
            peer_id: peer.id,
            direction,
        })?;

        handle.handshake.acquire().await;
        let result = async {
            let offer = handle
                .session
                .create_offer()
                .await
                .map_err(EngineError::Session)?;
            handle
                .session
                .set_local_description(offer.clone())
                .await
                .map_err(EngineError::Session)?;
            if self.is_gone() {
                return Err(EngineError::RoomGone {
                    room_id: self.id.clone(),
                });
            }
            self.signaling
                .send_offer(&self.id, peer.id, self.ggid, &offer, direction)
                .await
                .map_err(EngineError::Signaling)?;
            Ok(())
        }
        .await;

        match &result {
            Ok(()) => {
                SFU_RENEGOTIATIONS_TOTAL.inc();
            }
            Err(_) => {
                handle.handshake.release();
            }
        }
        result
    }

    /// Every 3 seconds asks each publisher for a keyframe on every live
    /// inbound video receiver. Stops when the room is reset.
    fn spawn_keyframe_ticker(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(KEYFRAME_INTERVAL);
            loop {
                tick.tick().await;
                let Some(room) = weak.upgrade() else { break };
                if room.is_gone() {
                    break;
                }
                for peer in room.snapshot_peers() {
                    let Some(send) = peer.session(ConnDirection::Send) else {
                        continue;
                    };
                    let session = send.session.clone();
                    tokio::spawn(async move {
                        for info in session.receivers().await {
                            let pli = PictureLossIndication {
                                sender_ssrc: 0,
                                media_ssrc: info.ssrc,
                            };
                            match session.write_rtcp(&[Box::new(pli)]).await {
                                Ok(()) => SFU_KEYFRAMES_REQUESTED_TOTAL.inc(),
                                Err(e) => debug!(ssrc = info.ssrc, error = %e, "PLI write failed"),
                            }
                        }
                    });
                }
            }
        });
        *self.ticker.lock().expect("ticker slot poisoned") = Some(handle);
    }

    /// Marks the room dead, stops the ticker, and closes every session of
    /// every peer concurrently. Peer map entries drain through the
    /// close-state callbacks.
    pub async fn shutdown(&self) {
        self.gone.store(true, Ordering::SeqCst);
        if let Some(handle) = self.ticker.lock().expect("ticker slot poisoned").take() {
            handle.abort();
        }

        let mut closers = Vec::new();
        for peer in self.snapshot_peers() {
            for handle in peer.sessions() {
                let session = handle.session.clone();
                let peer_id = peer.id;
                let room_id = self.id.clone();
                closers.push(tokio::spawn(async move {
                    if let Err(e) = session.close().await {
                        warn!(room = %room_id, peer = %peer_id, error = %e, "session close failed");
                    }
                }));
            }
        }
        for closer in closers {
            let _ = closer.await;
        }
    }
}

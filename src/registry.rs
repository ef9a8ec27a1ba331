use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::dto::ConnDirection;
use crate::error::EngineError;
use crate::id_types::{PeerId, RoomId};
use crate::metrics::{
    SFU_ACTIVE_PEERS, SFU_ACTIVE_ROOMS, SFU_WEBRTC_CONNECTION_FAILURES_TOTAL,
};
use crate::peer::SessionHandle;
use crate::room::Room;
use crate::session::SessionFactory;
use crate::signaling::{RejoinRequest, SignalingClient};

/// How often a failed ICE-candidate application is retried; the session
/// may not have its remote description yet when the first candidate lands.
const ICE_RETRY_INTERVAL: Duration = Duration::from_secs(1);
const ICE_RETRY_LIMIT: u32 = 4;

/// Process-wide room map plus everything sessions are built from. The
/// single long-lived mutable singleton; constructed at process start and
/// handed to the HTTP layer.
pub struct RoomsRegistry {
    rooms: DashMap<RoomId, Arc<Room>>,
    factory: Arc<dyn SessionFactory>,
    signaling: Arc<SignalingClient>,
    rejoin_tx: mpsc::UnboundedSender<RejoinRequest>,
    split_sessions: bool,
}

impl RoomsRegistry {
    pub fn new(
        factory: Arc<dyn SessionFactory>,
        signaling: Arc<SignalingClient>,
        rejoin_tx: mpsc::UnboundedSender<RejoinRequest>,
        split_sessions: bool,
    ) -> Arc<Self> {
        Arc::new(RoomsRegistry {
            rooms: DashMap::new(),
            factory,
            signaling,
            rejoin_tx,
            split_sessions,
        })
    }

    pub fn signaling(&self) -> Arc<SignalingClient> {
        self.signaling.clone()
    }

    fn room(&self, room_id: &RoomId) -> Result<Arc<Room>, EngineError> {
        self.rooms
            .get(room_id)
            .map(|r| r.clone())
            .ok_or_else(|| EngineError::RoomNotFound {
                room_id: room_id.clone(),
            })
    }

    /// Idempotent: an existing room keeps its generation untouched.
    pub fn create_room(self: &Arc<Self>, room_id: RoomId, ggid: u64) {
        let mut created = false;
        self.rooms.entry(room_id.clone()).or_insert_with(|| {
            created = true;
            Room::new(
                room_id.clone(),
                ggid,
                self.signaling.clone(),
                Arc::downgrade(self),
            )
        });
        if created {
            SFU_ACTIVE_ROOMS.inc();
            info!(room = %room_id, ggid, "room created");
        }
    }

    pub fn does_room_exist(&self, room_id: &RoomId) -> bool {
        self.rooms.contains_key(room_id)
    }

    pub fn get_room(&self, room_id: &RoomId) -> Option<Arc<Room>> {
        self.rooms.get(room_id).map(|r| r.clone())
    }

    pub fn room_ggid(&self, room_id: &RoomId) -> Option<u64> {
        self.rooms.get(room_id).map(|r| r.ggid)
    }

    /// Builds a session for the peer, wires its callbacks, installs it at
    /// the direction slot, and schedules a track-set reconciliation.
    pub async fn create_peer(
        self: &Arc<Self>,
        room_id: RoomId,
        peer_id: PeerId,
        can_publish: bool,
        is_caller: bool,
        ggid: u64,
        direction: ConnDirection,
    ) -> Result<(), EngineError> {
        let room = self.room(&room_id)?;
        if ggid != 0 && ggid != room.ggid {
            debug!(room = %room_id, theirs = ggid, ours = room.ggid, "peer carries a different room generation");
        }

        // Session construction happens outside every engine lock.
        let session = self
            .factory
            .create_session(direction)
            .await
            .map_err(EngineError::Session)?;
        let handle = Arc::new(SessionHandle::new(session));

        // All callbacks are registered before any operation that could
        // trigger them.
        self.register_ice_callback(&handle, &room_id, peer_id, room.ggid, direction);
        self.register_state_callback(&handle, &room_id, peer_id, direction);
        if direction == ConnDirection::Send || !self.split_sessions {
            self.register_track_callback(&handle, &room_id, peer_id);
        }

        let (_, created) = room.install_session(
            peer_id,
            can_publish,
            is_caller,
            direction,
            handle,
            self.split_sessions,
        );
        if created {
            SFU_ACTIVE_PEERS.inc();
        }
        info!(room = %room_id, peer = %peer_id, %direction, is_caller, can_publish, "peer session installed");

        let reconcile_room = room.clone();
        tokio::spawn(async move { reconcile_room.reconcile_tracks().await });
        Ok(())
    }

    fn register_ice_callback(
        self: &Arc<Self>,
        handle: &Arc<SessionHandle>,
        room_id: &RoomId,
        peer_id: PeerId,
        ggid: u64,
        direction: ConnDirection,
    ) {
        let weak = Arc::downgrade(self);
        let room_id = room_id.clone();
        handle.session.on_ice_candidate(Box::new(move |candidate| {
            // Gathering-complete marker; nothing to relay.
            let Some(candidate) = candidate else { return };
            let Some(registry) = weak.upgrade() else { return };
            let client = registry.signaling.clone();
            let room_id = room_id.clone();
            tokio::spawn(async move {
                // Trickle ICE is best-effort: failures are logged and dropped.
                if let Err(e) = client
                    .send_ice_candidate(&room_id, peer_id, ggid, &candidate, direction)
                    .await
                {
                    warn!(room = %room_id, peer = %peer_id, error = %e, "relaying ICE candidate failed");
                }
            });
        }));
    }

    fn register_state_callback(
        self: &Arc<Self>,
        handle: &Arc<SessionHandle>,
        room_id: &RoomId,
        peer_id: PeerId,
        direction: ConnDirection,
    ) {
        let weak = Arc::downgrade(self);
        let room_id = room_id.clone();
        handle
            .session
            .on_connection_state_change(Box::new(move |state| {
                let Some(registry) = weak.upgrade() else { return };
                registry.handle_state_change(&room_id, peer_id, direction, state);
            }));
    }

    fn register_track_callback(
        self: &Arc<Self>,
        handle: &Arc<SessionHandle>,
        room_id: &RoomId,
        peer_id: PeerId,
    ) {
        let weak = Arc::downgrade(self);
        let room_id = room_id.clone();
        handle.session.on_track(Box::new(move |remote| {
            let Some(registry) = weak.upgrade() else { return };
            let Ok(room) = registry.room(&room_id) else {
                debug!(room = %room_id, "track arrived for a reset room, dropping");
                return;
            };
            let Some(peer) = room.get_peer(peer_id) else {
                debug!(room = %room_id, peer = %peer_id, "track arrived for an unknown peer, dropping");
                return;
            };
            tokio::spawn(room.handle_remote_track(peer, remote));
        }));
    }

    /// Callbacks relookup state by id so a dead room simply no-ops.
    fn handle_state_change(
        self: &Arc<Self>,
        room_id: &RoomId,
        peer_id: PeerId,
        direction: ConnDirection,
        state: RTCPeerConnectionState,
    ) {
        debug!(room = %room_id, peer = %peer_id, %direction, ?state, "connection state changed");
        let Ok(room) = self.room(room_id) else { return };
        match state {
            RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Failed => {
                if state == RTCPeerConnectionState::Failed {
                    SFU_WEBRTC_CONNECTION_FAILURES_TOTAL.inc();
                }
                // Only the session that changed state closes; the
                // complementary one may stay up.
                let Some(peer) = room.get_peer(peer_id) else { return };
                let Some(handle) = peer.session(direction) else { return };
                let room_id = room_id.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle.session.close().await {
                        warn!(room = %room_id, peer = %peer_id, error = %e, "closing degraded session failed");
                    }
                });
            }
            RTCPeerConnectionState::Closed => {
                if let Some(peer) = room.remove_peer(peer_id) {
                    SFU_ACTIVE_PEERS.dec();
                    info!(room = %room_id, peer = %peer_id, "peer removed");
                    if peer.is_caller && !peer.triggered_reconnect.swap(true, Ordering::SeqCst) {
                        self.on_caller_disconnected(room_id);
                    }
                }
            }
            _ => {}
        }
    }

    /// The caller going away invalidates the broadcast; ask logjam for a
    /// fresh membership. Resets arrive separately over the HTTP surface.
    pub fn on_caller_disconnected(&self, room_id: &RoomId) {
        info!(room = %room_id, "caller disconnected, requesting rejoin");
        let _ = self.rejoin_tx.send(RejoinRequest {
            room_id: room_id.to_string(),
            simply_join: false,
        });
    }

    /// Hands a join request to the watchdog (used at startup and when an
    /// inline join attempt fails).
    pub fn request_join(&self, room_id: String, simply_join: bool) {
        let _ = self.rejoin_tx.send(RejoinRequest {
            room_id,
            simply_join,
        });
    }

    /// Routes a trickle candidate to the session named by `direction`.
    /// Transient session failures are retried: the remote description may
    /// lag behind the first candidates.
    pub async fn add_peer_ice_candidate(
        &self,
        room_id: &RoomId,
        peer_id: PeerId,
        candidate: RTCIceCandidateInit,
        direction: ConnDirection,
    ) -> Result<(), EngineError> {
        let mut attempt = 0;
        loop {
            match self
                .try_add_ice_candidate(room_id, peer_id, candidate.clone(), direction)
                .await
            {
                Err(EngineError::Session(e)) if attempt < ICE_RETRY_LIMIT => {
                    attempt += 1;
                    debug!(room = %room_id, peer = %peer_id, attempt, error = %e, "retrying ICE candidate");
                    tokio::time::sleep(ICE_RETRY_INTERVAL).await;
                }
                other => return other,
            }
        }
    }

    async fn try_add_ice_candidate(
        &self,
        room_id: &RoomId,
        peer_id: PeerId,
        candidate: RTCIceCandidateInit,
        direction: ConnDirection,
    ) -> Result<(), EngineError> {
        let room = self.room(room_id)?;
        let peer = room.get_peer(peer_id).ok_or_else(|| EngineError::PeerNotFound {
            room_id: room_id.clone(),
            peer_id,
        })?;
        let handle = peer.session(direction).ok_or_else(|| EngineError::NoSession {
            room_id: room_id.clone(),
            peer_id,
            direction,
        })?;
        handle
            .session
            .add_ice_candidate(candidate)
            .await
            .map_err(EngineError::Session)
    }

    /// Applies a remote offer and returns the local answer. The handshake
    /// lock is held for the whole exchange; inbound offers are a
    /// publisher privilege.
    pub async fn set_peer_offer(
        &self,
        room_id: &RoomId,
        peer_id: PeerId,
        sdp: RTCSessionDescription,
        direction: ConnDirection,
    ) -> Result<RTCSessionDescription, EngineError> {
        let room = self.room(room_id)?;
        let peer = room.get_peer(peer_id).ok_or_else(|| EngineError::PeerNotFound {
            room_id: room_id.clone(),
            peer_id,
        })?;
        if !peer.is_caller && !peer.can_publish {
            return Err(EngineError::OfferNotAllowed {
                room_id: room_id.clone(),
                peer_id,
            });
        }
        let handle = peer.session(direction).ok_or_else(|| EngineError::NoSession {
            room_id: room_id.clone(),
            peer_id,
            direction,
        })?;

        handle.handshake.acquire().await;
        let result = async {
            handle.session.set_remote_description(sdp).await?;
            let answer = handle.session.create_answer().await?;
            handle.session.set_local_description(answer.clone()).await?;
            Ok(answer)
        }
        .await;
        handle.handshake.release();
        result.map_err(EngineError::Session)
    }

    /// Applies the remote answer that completes an outbound offer and
    /// releases the handshake lock that offer acquired.
    pub async fn set_peer_answer(
        &self,
        room_id: &RoomId,
        peer_id: PeerId,
        sdp: RTCSessionDescription,
        direction: ConnDirection,
    ) -> Result<(), EngineError> {
        let room = self.room(room_id)?;
        let peer = room.get_peer(peer_id).ok_or_else(|| EngineError::PeerNotFound {
            room_id: room_id.clone(),
            peer_id,
        })?;
        let handle = peer.session(direction).ok_or_else(|| EngineError::NoSession {
            room_id: room_id.clone(),
            peer_id,
            direction,
        })?;

        let result = handle
            .session
            .set_remote_description(sdp)
            .await
            .map_err(EngineError::Session);
        handle.handshake.release();
        result
    }

    /// Closes every session the peer holds; the peer map entry drains
    /// through the close-state callback.
    pub async fn close_peer(&self, room_id: &RoomId, peer_id: PeerId) -> Result<(), EngineError> {
        let room = self.room(room_id)?;
        let peer = room.get_peer(peer_id).ok_or_else(|| EngineError::PeerNotFound {
            room_id: room_id.clone(),
            peer_id,
        })?;

        let mut first_err = None;
        for handle in peer.sessions() {
            if let Err(e) = handle.session.close().await {
                if first_err.is_none() {
                    first_err = Some(EngineError::Session(e));
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Tears the room down and returns its final generation id; unknown
    /// rooms yield 0 without error.
    pub async fn reset_room(&self, room_id: &RoomId) -> u64 {
        let Some((_, room)) = self.rooms.remove(room_id) else {
            return 0;
        };
        SFU_ACTIVE_ROOMS.dec();
        info!(room = %room_id, ggid = room.ggid, "resetting room");
        room.shutdown().await;
        room.ggid
    }

    /// Process shutdown: every room goes through the reset path.
    pub async fn shutdown(&self) {
        let room_ids: Vec<RoomId> = self.rooms.iter().map(|e| e.key().clone()).collect();
        for room_id in room_ids {
            self.reset_room(&room_id).await;
        }
    }
}

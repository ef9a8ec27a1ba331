use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;
use tracing::debug;

use crate::dto::ConnDirection;
use crate::id_types::PeerId;
use crate::session::MediaSession;

/// Serializes the offer/answer exchange on one session. Acquired before
/// an offer is created or a remote offer applied; released when the
/// matching answer lands or the exchange fails. The `held` marker gates
/// the release so a stray answer cannot over-unlock.
pub struct HandshakeLock {
    permits: Arc<Semaphore>,
    held: AtomicBool,
}

impl HandshakeLock {
    pub fn new() -> Self {
        HandshakeLock {
            permits: Arc::new(Semaphore::new(1)),
            held: AtomicBool::new(false),
        }
    }

    pub async fn acquire(&self) {
        self.permits
            .acquire()
            .await
            .expect("handshake semaphore never closes")
            .forget();
        self.held.store(true, Ordering::SeqCst);
    }

    /// Returns whether a handshake was actually in flight.
    pub fn release(&self) -> bool {
        if self.held.swap(false, Ordering::SeqCst) {
            self.permits.add_permits(1);
            true
        } else {
            debug!("handshake release with no exchange in flight");
            false
        }
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }
}

impl Default for HandshakeLock {
    fn default() -> Self {
        Self::new()
    }
}

/// One peer connection slot: the session plus the handshake lock that
/// serializes its SDP exchanges.
pub struct SessionHandle {
    pub session: Arc<dyn MediaSession>,
    pub handshake: HandshakeLock,
}

impl SessionHandle {
    pub fn new(session: Arc<dyn MediaSession>) -> Self {
        SessionHandle {
            session,
            handshake: HandshakeLock::new(),
        }
    }
}

#[derive(Default)]
struct Slots {
    send: Option<Arc<SessionHandle>>,
    recv: Option<Arc<SessionHandle>>,
}

/// A connected peer. In split mode the send slot carries the remote's
/// published media and the recv slot carries what this node publishes to
/// the remote; in single-session mode both slots hold the same handle.
pub struct Peer {
    pub id: PeerId,
    pub can_publish: bool,
    pub is_caller: bool,
    slots: Mutex<Slots>,
    pub got_first_audio: AtomicBool,
    pub got_first_video: AtomicBool,
    pub triggered_reconnect: AtomicBool,
}

impl Peer {
    pub fn new(id: PeerId, can_publish: bool, is_caller: bool) -> Self {
        Peer {
            id,
            can_publish,
            is_caller,
            slots: Mutex::new(Slots::default()),
            got_first_audio: AtomicBool::new(false),
            got_first_video: AtomicBool::new(false),
            triggered_reconnect: AtomicBool::new(false),
        }
    }

    /// Installs a handle into the slot named by `direction`.
    pub fn install(&self, direction: ConnDirection, handle: Arc<SessionHandle>) {
        let mut slots = self.slots.lock().expect("peer slots poisoned");
        match direction {
            ConnDirection::Send => slots.send = Some(handle),
            ConnDirection::Recv => slots.recv = Some(handle),
        }
    }

    /// Single-session mode: the same handle serves both directions.
    pub fn install_single(&self, handle: Arc<SessionHandle>) {
        let mut slots = self.slots.lock().expect("peer slots poisoned");
        slots.send = Some(handle.clone());
        slots.recv = Some(handle);
    }

    pub fn session(&self, direction: ConnDirection) -> Option<Arc<SessionHandle>> {
        let slots = self.slots.lock().expect("peer slots poisoned");
        match direction {
            ConnDirection::Send => slots.send.clone(),
            ConnDirection::Recv => slots.recv.clone(),
        }
    }

    /// Every distinct session held by this peer (one entry in
    /// single-session mode).
    pub fn sessions(&self) -> Vec<Arc<SessionHandle>> {
        let slots = self.slots.lock().expect("peer slots poisoned");
        let mut out: Vec<Arc<SessionHandle>> = Vec::new();
        for handle in [slots.send.clone(), slots.recv.clone()].into_iter().flatten() {
            if !out.iter().any(|h| Arc::ptr_eq(h, &handle)) {
                out.push(handle);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_handshake_lock_serializes() {
        let lock = Arc::new(HandshakeLock::new());
        lock.acquire().await;
        assert!(lock.is_held());

        let second = lock.clone();
        let waiter = tokio::spawn(async move {
            second.acquire().await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        assert!(lock.release());
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("second acquire should proceed after release")
            .unwrap();
    }

    #[tokio::test]
    async fn test_handshake_release_is_gated() {
        let lock = HandshakeLock::new();
        // Nothing in flight: release must be a no-op.
        assert!(!lock.release());

        lock.acquire().await;
        assert!(lock.release());
        assert!(!lock.release());

        // The permit is back: an acquire completes immediately.
        tokio::time::timeout(Duration::from_millis(100), lock.acquire())
            .await
            .expect("lock should be free again");
    }
}

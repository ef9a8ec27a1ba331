use thiserror::Error;

use crate::dto::ConnDirection;
use crate::id_types::{PeerId, RoomId};

/// Failures surfaced by the room engine. Each variant carries the HTTP
/// status class it maps to on the inbound surface; session and signaling
/// transport causes stay opaque behind `anyhow`.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("room doesn't exist")]
    RoomNotFound { room_id: RoomId },

    #[error("no such a peer with this id in this room")]
    PeerNotFound { room_id: RoomId, peer_id: PeerId },

    #[error("peer has no {direction} session")]
    NoSession {
        room_id: RoomId,
        peer_id: PeerId,
        direction: ConnDirection,
    },

    #[error("only the caller can offer")]
    OfferNotAllowed { room_id: RoomId, peer_id: PeerId },

    #[error("room generation is gone")]
    RoomGone { room_id: RoomId },

    #[error("peer connection failure: {0}")]
    Session(anyhow::Error),

    #[error("signaling transport failure: {0}")]
    Signaling(anyhow::Error),
}

impl EngineError {
    pub fn http_status(&self) -> u16 {
        match self {
            EngineError::RoomNotFound { .. }
            | EngineError::PeerNotFound { .. }
            | EngineError::NoSession { .. }
            | EngineError::OfferNotAllowed { .. }
            | EngineError::RoomGone { .. } => 403,
            EngineError::Session(_) | EngineError::Signaling(_) => 500,
        }
    }
}

pub mod config;
pub mod dto;
pub mod error;
pub mod http_api;
pub mod id_types;
pub mod logging;
pub mod metrics;
pub mod peer;
pub mod registry;
pub mod room;
pub mod session;
pub mod signaling;
pub mod webrtc_session;

pub use dto::ConnDirection;
pub use error::EngineError;
pub use id_types::{PeerId, RoomId, TrackId};
pub use registry::RoomsRegistry;
pub use session::{MediaSession, RemoteTrackSource, SessionFactory};
pub use signaling::SignalingClient;

#[cfg(test)]
mod tests;

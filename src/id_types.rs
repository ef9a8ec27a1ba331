use std::fmt;
use std::sync::Arc;

/// A strongly typed identifier for a Room.
/// Wraps an `Arc<String>` for cheap cloning.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomId(pub Arc<String>);

/// A strongly typed identifier for a forwarded Track.
/// Wraps an `Arc<String>` for cheap cloning.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TrackId(pub Arc<String>);

/// A peer identifier, assigned by the external signaler.
/// Unique within a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(pub u64);

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for RoomId {
    fn from(s: String) -> Self {
        RoomId(Arc::new(s))
    }
}

impl From<&str> for RoomId {
    fn from(s: &str) -> Self {
        RoomId(Arc::new(s.to_string()))
    }
}

impl From<String> for TrackId {
    fn from(s: String) -> Self {
        TrackId(Arc::new(s))
    }
}

impl From<&str> for TrackId {
    fn from(s: &str) -> Self {
        TrackId(Arc::new(s.to_string()))
    }
}

impl From<u64> for PeerId {
    fn from(v: u64) -> Self {
        PeerId(v)
    }
}

impl AsRef<str> for RoomId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for TrackId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_id_conversion() {
        let id_str = "room-123";
        let id: RoomId = RoomId::from(id_str);
        assert_eq!(id.as_ref(), id_str);

        let id_string = String::from("room-456");
        let id2: RoomId = RoomId::from(id_string.clone());
        assert_eq!(id2.as_ref(), "room-456");
    }

    #[test]
    fn test_track_id_conversion() {
        let id = TrackId::from("track-1");
        assert_eq!(id.as_ref(), "track-1");
    }

    #[test]
    fn test_peer_id_display() {
        let id = PeerId::from(42u64);
        assert_eq!(id.to_string(), "42");
        assert_eq!(id.0, 42);
    }

    #[test]
    fn test_display_trait() {
        let id = RoomId::from("room-string");
        assert_eq!(format!("{}", id), "room-string");
    }
}

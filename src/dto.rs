use std::fmt;

use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

/// Which side of the media exchange a session carries, seen from the
/// remote peer: `Send` means the remote publishes into this node,
/// `Recv` means the remote consumes from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnDirection {
    #[serde(rename = "send")]
    Send,
    #[serde(rename = "recv")]
    Recv,
}

impl fmt::Display for ConnDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnDirection::Send => write!(f, "send"),
            ConnDirection::Recv => write!(f, "recv"),
        }
    }
}

/// Addressing tuple shared by every room-scoped request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerRef {
    pub room_id: String,
    #[serde(default)]
    pub id: u64,
}

impl PeerRef {
    pub fn validate(&self) -> bool {
        !self.room_id.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePeerReq {
    #[serde(flatten)]
    pub peer: PeerRef,
    #[serde(default)]
    pub ggid: u64,
    #[serde(default)]
    pub can_publish: bool,
    #[serde(default)]
    pub is_caller: bool,
    pub connection_direction: ConnDirection,
}

impl CreatePeerReq {
    pub fn validate(&self) -> bool {
        self.peer.validate()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddIceCandidateReq {
    #[serde(flatten)]
    pub peer: PeerRef,
    #[serde(default)]
    pub ggid: u64,
    pub ice_candidate: RTCIceCandidateInit,
    pub connection_direction: ConnDirection,
}

impl AddIceCandidateReq {
    pub fn validate(&self) -> bool {
        self.peer.validate()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetSdpReq {
    #[serde(flatten)]
    pub peer: PeerRef,
    #[serde(default)]
    pub ggid: u64,
    pub sdp: RTCSessionDescription,
    pub connection_direction: ConnDirection,
}

impl SetSdpReq {
    pub fn validate(&self) -> bool {
        self.peer.validate() && !self.sdp.sdp.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomReq {
    pub room_id: String,
}

impl RoomReq {
    pub fn validate(&self) -> bool {
        !self.room_id.is_empty()
    }
}

/// Body of a successful `{logjam}/join` or `{logjam}/rejoin` response;
/// `id` is the generation identifier the far side assigned to the room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinResp {
    #[serde(default)]
    pub id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetRoomResp {
    pub ggid: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conn_direction_wire_format() {
        assert_eq!(serde_json::to_string(&ConnDirection::Send).unwrap(), "\"send\"");
        let d: ConnDirection = serde_json::from_str("\"recv\"").unwrap();
        assert_eq!(d, ConnDirection::Recv);
    }

    #[test]
    fn test_create_peer_req_binding() {
        let body = r#"{"roomId":"r1","id":3,"ggid":9,"canPublish":true,"isCaller":false,"connectionDirection":"send"}"#;
        let req: CreatePeerReq = serde_json::from_str(body).unwrap();
        assert!(req.validate());
        assert_eq!(req.peer.room_id, "r1");
        assert_eq!(req.peer.id, 3);
        assert_eq!(req.ggid, 9);
        assert!(req.can_publish);
        assert_eq!(req.connection_direction, ConnDirection::Send);
    }

    #[test]
    fn test_empty_room_id_fails_validation() {
        let body = r#"{"roomId":"","id":3,"connectionDirection":"recv"}"#;
        let req: CreatePeerReq = serde_json::from_str(body).unwrap();
        assert!(!req.validate());
    }

    #[test]
    fn test_sdp_req_requires_nonempty_sdp() {
        let body = r#"{"roomId":"r1","id":1,"ggid":2,"sdp":{"type":"offer","sdp":""},"connectionDirection":"send"}"#;
        let req: SetSdpReq = serde_json::from_str(body).unwrap();
        assert!(!req.validate());
    }
}

use std::any::Any;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::interceptor::Attributes;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtcp::packet::Packet as RtcpPacket;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_remote::TrackRemote;

use crate::dto::ConnDirection;

/// Fired with `None` once candidate gathering finishes.
pub type IceCandidateHandler = Box<dyn Fn(Option<RTCIceCandidateInit>) + Send + Sync>;
pub type ConnectionStateHandler = Box<dyn Fn(RTCPeerConnectionState) + Send + Sync>;
pub type TrackHandler = Box<dyn Fn(Arc<dyn RemoteTrackSource>) + Send + Sync>;

/// An inbound media track as the engine consumes it: identity, codec, and
/// a packet source. `TrackRemote` satisfies this directly; tests feed
/// packets from a channel.
#[async_trait]
pub trait RemoteTrackSource: Send + Sync {
    fn id(&self) -> String;
    fn stream_id(&self) -> String;
    fn kind(&self) -> String;
    fn ssrc(&self) -> u32;
    fn codec_capability(&self) -> RTCRtpCodecCapability;
    async fn read_rtp(&self) -> Result<(Packet, Attributes)>;
}

#[async_trait]
impl RemoteTrackSource for TrackRemote {
    fn id(&self) -> String {
        self.id()
    }
    fn stream_id(&self) -> String {
        self.stream_id()
    }
    fn kind(&self) -> String {
        self.kind().to_string()
    }
    fn ssrc(&self) -> u32 {
        self.ssrc()
    }
    fn codec_capability(&self) -> RTCRtpCodecCapability {
        self.codec().capability.clone()
    }
    async fn read_rtp(&self) -> Result<(Packet, Attributes)> {
        self.read_rtp().await.map_err(|e| e.into())
    }
}

/// Handle on an RTP sender installed by `MediaSession::add_track`. The
/// engine only ever asks which track the sender is bound to and passes the
/// handle back to `remove_track`.
#[async_trait]
pub trait RtpSenderHandle: Send + Sync {
    async fn track_id(&self) -> Option<String>;
    fn as_any(&self) -> &dyn Any;
}

/// Snapshot of a receiver's bound inbound track.
#[derive(Debug, Clone)]
pub struct RemoteTrackInfo {
    pub track_id: String,
    pub ssrc: u32,
}

/// The engine's view of one peer connection. Callbacks are delivered from
/// their own tasks and may fire before the registration call returns to
/// the caller's next statement; the engine registers all callbacks before
/// any operation that could trigger them.
#[async_trait]
pub trait MediaSession: Send + Sync {
    fn on_ice_candidate(&self, handler: IceCandidateHandler);
    fn on_connection_state_change(&self, handler: ConnectionStateHandler);
    fn on_track(&self, handler: TrackHandler);

    async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()>;
    async fn set_remote_description(&self, desc: RTCSessionDescription) -> Result<()>;
    async fn set_local_description(&self, desc: RTCSessionDescription) -> Result<()>;
    async fn create_offer(&self) -> Result<RTCSessionDescription>;
    async fn create_answer(&self) -> Result<RTCSessionDescription>;

    async fn add_track(&self, sink: Arc<TrackLocalStaticRTP>) -> Result<Arc<dyn RtpSenderHandle>>;
    async fn remove_track(&self, sender: &Arc<dyn RtpSenderHandle>) -> Result<()>;
    async fn senders(&self) -> Vec<Arc<dyn RtpSenderHandle>>;
    async fn receivers(&self) -> Vec<RemoteTrackInfo>;

    async fn write_rtcp(&self, packets: &[Box<dyn RtcpPacket + Send + Sync>]) -> Result<()>;
    fn connection_state(&self) -> RTCPeerConnectionState;
    async fn close(&self) -> Result<()>;
}

/// Builds sessions for the registry. The direction decides the
/// transceiver preparation: a send-direction session receives the remote's
/// publisher tracks, a recv-direction session starts bare.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create_session(&self, direction: ConnDirection) -> Result<Arc<dyn MediaSession>>;
}

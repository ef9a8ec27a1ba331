use std::any::Any;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::warn;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice::network_type::NetworkType;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::packet::Packet as RtcpPacket;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTCRtpHeaderExtensionCapability, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::config::Config;
use crate::dto::ConnDirection;
use crate::session::{
    ConnectionStateHandler, IceCandidateHandler, MediaSession, RemoteTrackInfo, RemoteTrackSource,
    RtpSenderHandle, SessionFactory, TrackHandler,
};

/// Builds real peer connections from the shared ICE configuration. A
/// fresh media engine is assembled per session so codec state never leaks
/// between peers.
pub struct WebRtcSessionFactory {
    config: Arc<Config>,
}

impl WebRtcSessionFactory {
    pub fn new(config: Arc<Config>) -> Self {
        WebRtcSessionFactory { config }
    }

    fn build_api(&self) -> Result<API> {
        let mut media_engine = MediaEngine::default();

        // Opus with FEC and low latency settings
        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: "audio/opus".to_owned(),
                    clock_rate: 48000,
                    channels: 2,
                    sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                    ..Default::default()
                },
                payload_type: 111,
                ..Default::default()
            },
            RTPCodecType::Audio,
        )?;

        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: "video/VP8".to_owned(),
                    clock_rate: 90000,
                    channels: 0,
                    sdp_fmtp_line: "".to_owned(),
                    ..Default::default()
                },
                payload_type: 96,
                ..Default::default()
            },
            RTPCodecType::Video,
        )?;

        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: "video/H264".to_owned(),
                    clock_rate: 90000,
                    channels: 0,
                    sdp_fmtp_line:
                        "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
                            .to_owned(),
                    ..Default::default()
                },
                payload_type: 102,
                ..Default::default()
            },
            RTPCodecType::Video,
        )?;

        let extensions = vec![
            "urn:ietf:params:rtp-hdrext:sdes:mid",
            "urn:ietf:params:rtp-hdrext:sdes:rtp-stream-id",
            "urn:ietf:params:rtp-hdrext:sdes:repaired-rtp-stream-id",
            "http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time",
            "http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01",
            "urn:ietf:params:rtp-hdrext:ssrc-audio-level",
            "urn:ietf:params:rtp-hdrext:toffset",
            "urn:3gpp:video-orientation",
        ];
        for extension in extensions {
            let _ = media_engine.register_header_extension(
                RTCRtpHeaderExtensionCapability {
                    uri: extension.to_string(),
                },
                RTPCodecType::Video,
                None,
            );
            let _ = media_engine.register_header_extension(
                RTCRtpHeaderExtensionCapability {
                    uri: extension.to_string(),
                },
                RTPCodecType::Audio,
                None,
            );
        }

        let mut setting_engine = SettingEngine::default();
        if let Some(ip) = &self.config.custom_ice_host_candidate_ip {
            setting_engine.set_nat_1to1_ips(vec![ip.clone()], RTCIceCandidateType::Host);
        }
        if self.config.ice_tcp_mux_listen_port > 0 {
            setting_engine
                .set_network_types(vec![NetworkType::Udp4, NetworkType::Tcp4]);
        }

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        Ok(APIBuilder::new()
            .with_media_engine(media_engine)
            .with_setting_engine(setting_engine)
            .with_interceptor_registry(registry)
            .build())
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self
                .config
                .ice_servers
                .iter()
                .map(|s| RTCIceServer {
                    urls: s.urls.clone(),
                    username: s.username.clone().unwrap_or_default(),
                    credential: s.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            bundle_policy: RTCBundlePolicy::MaxBundle,
            ..Default::default()
        }
    }
}

#[async_trait]
impl SessionFactory for WebRtcSessionFactory {
    async fn create_session(&self, direction: ConnDirection) -> Result<Arc<dyn MediaSession>> {
        let api = self.build_api()?;
        let pc = api.new_peer_connection(self.rtc_configuration()).await?;
        let pc = Arc::new(pc);

        if self.config.split_sessions {
            // Only the inbound leg needs transceivers up front; the
            // outbound leg grows senders through reconciliation.
            if direction == ConnDirection::Send {
                prepare_transceivers(&pc, RTCRtpTransceiverDirection::Recvonly).await?;
            }
        } else {
            prepare_transceivers(&pc, RTCRtpTransceiverDirection::Sendrecv).await?;
        }

        Ok(Arc::new(WebRtcSession { pc }))
    }
}

async fn prepare_transceivers(
    pc: &Arc<RTCPeerConnection>,
    direction: RTCRtpTransceiverDirection,
) -> Result<()> {
    for kind in [RTPCodecType::Video, RTPCodecType::Audio] {
        pc.add_transceiver_from_kind(
            kind,
            Some(RTCRtpTransceiverInit {
                direction,
                send_encodings: vec![],
            }),
        )
        .await
        .with_context(|| format!("adding {} transceiver", kind))?;
    }
    Ok(())
}

/// The production session: a thin pass-through to `RTCPeerConnection`
/// with the engine's callback types bridged onto the webrtc ones.
pub struct WebRtcSession {
    pc: Arc<RTCPeerConnection>,
}

struct WebRtcSender {
    inner: Arc<RTCRtpSender>,
}

#[async_trait]
impl RtpSenderHandle for WebRtcSender {
    async fn track_id(&self) -> Option<String> {
        self.inner.track().await.map(|t| t.id().to_string())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[async_trait]
impl MediaSession for WebRtcSession {
    fn on_ice_candidate(&self, handler: IceCandidateHandler) {
        let handler = Arc::new(handler);
        self.pc.on_ice_candidate(Box::new(move |candidate| {
            let handler = handler.clone();
            Box::pin(async move {
                match candidate {
                    Some(c) => match c.to_json() {
                        Ok(init) => handler(Some(init)),
                        Err(e) => warn!(error = %e, "serializing ICE candidate failed"),
                    },
                    None => handler(None),
                }
            })
        }));
    }

    fn on_connection_state_change(&self, handler: ConnectionStateHandler) {
        let handler = Arc::new(handler);
        self.pc
            .on_peer_connection_state_change(Box::new(move |state| {
                let handler = handler.clone();
                Box::pin(async move {
                    handler(state);
                })
            }));
    }

    fn on_track(&self, handler: TrackHandler) {
        let handler = Arc::new(handler);
        self.pc.on_track(Box::new(
            move |track: Arc<TrackRemote>, _receiver, _transceiver| {
                let handler = handler.clone();
                Box::pin(async move {
                    handler(track as Arc<dyn RemoteTrackSource>);
                })
            },
        ));
    }

    async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()> {
        self.pc.add_ice_candidate(candidate).await.map_err(Into::into)
    }

    async fn set_remote_description(&self, desc: RTCSessionDescription) -> Result<()> {
        self.pc.set_remote_description(desc).await.map_err(Into::into)
    }

    async fn set_local_description(&self, desc: RTCSessionDescription) -> Result<()> {
        self.pc.set_local_description(desc).await.map_err(Into::into)
    }

    async fn create_offer(&self) -> Result<RTCSessionDescription> {
        self.pc.create_offer(None).await.map_err(Into::into)
    }

    async fn create_answer(&self) -> Result<RTCSessionDescription> {
        self.pc.create_answer(None).await.map_err(Into::into)
    }

    async fn add_track(&self, sink: Arc<TrackLocalStaticRTP>) -> Result<Arc<dyn RtpSenderHandle>> {
        let sender = self
            .pc
            .add_track(Arc::clone(&sink) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        Ok(Arc::new(WebRtcSender { inner: sender }))
    }

    async fn remove_track(&self, sender: &Arc<dyn RtpSenderHandle>) -> Result<()> {
        let concrete = sender
            .as_any()
            .downcast_ref::<WebRtcSender>()
            .context("foreign sender handle passed to WebRtcSession")?;
        self.pc.remove_track(&concrete.inner).await.map_err(Into::into)
    }

    async fn senders(&self) -> Vec<Arc<dyn RtpSenderHandle>> {
        self.pc
            .get_senders()
            .await
            .into_iter()
            .map(|inner| Arc::new(WebRtcSender { inner }) as Arc<dyn RtpSenderHandle>)
            .collect()
    }

    async fn receivers(&self) -> Vec<RemoteTrackInfo> {
        let mut out = Vec::new();
        for receiver in self.pc.get_receivers().await {
            if let Some(track) = receiver.track().await {
                out.push(RemoteTrackInfo {
                    track_id: track.id(),
                    ssrc: track.ssrc(),
                });
            }
        }
        out
    }

    async fn write_rtcp(&self, packets: &[Box<dyn RtcpPacket + Send + Sync>]) -> Result<()> {
        self.pc.write_rtcp(packets).await.map(|_| ()).map_err(Into::into)
    }

    fn connection_state(&self) -> RTCPeerConnectionState {
        self.pc.connection_state()
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await.map_err(Into::into)
    }
}

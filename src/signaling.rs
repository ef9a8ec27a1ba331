use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::dto::{ConnDirection, JoinResp};
use crate::id_types::{PeerId, RoomId};
use crate::registry::RoomsRegistry;

/// Outbound HTTP timeout; also bounds a stalled logjam endpoint.
const SIGNALING_TIMEOUT: Duration = Duration::from_secs(8);
/// Backoff between join/rejoin attempts.
const REJOIN_INTERVAL: Duration = Duration::from_secs(4);

/// A request for the watchdog to (re-)establish room membership.
#[derive(Debug, Clone)]
pub struct RejoinRequest {
    pub room_id: String,
    /// True for the plain startup join, false after a caller loss.
    pub simply_join: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RoomMsg<'a> {
    room_id: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct IceMsg<'a> {
    room_id: &'a str,
    id: u64,
    ggid: u64,
    ice_candidate: &'a RTCIceCandidateInit,
    connection_direction: ConnDirection,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SdpMsg<'a> {
    room_id: &'a str,
    id: u64,
    ggid: u64,
    sdp: &'a RTCSessionDescription,
    connection_direction: ConnDirection,
}

/// Client for the messages this node sends to logjam. Every message
/// carries the room generation so the far side can discard leftovers from
/// a dead generation.
pub struct SignalingClient {
    http: reqwest::Client,
    base_url: String,
}

impl SignalingClient {
    pub fn new(base_url: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(SIGNALING_TIMEOUT)
            .build()
            .expect("reqwest client construction is infallible here");
        SignalingClient { http, base_url }
    }

    async fn post<T: Serialize + ?Sized>(&self, endpoint: &str, body: &T) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, endpoint);
        let resp = self.http.post(&url).json(body).send().await?;
        if resp.status().as_u16() > 204 {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("POST {} -> {}: {}", endpoint, status, text));
        }
        Ok(resp)
    }

    /// POST /join; returns the generation id logjam assigned, if any.
    pub async fn join(&self, room_id: &str) -> Result<Option<u64>> {
        let resp = self.post("/join", &RoomMsg { room_id }).await?;
        let body: JoinResp = resp.json().await.unwrap_or(JoinResp { id: 0 });
        Ok((body.id > 0).then_some(body.id))
    }

    /// POST /rejoin; same response contract as /join.
    pub async fn rejoin(&self, room_id: &str) -> Result<Option<u64>> {
        let resp = self.post("/rejoin", &RoomMsg { room_id }).await?;
        let body: JoinResp = resp.json().await.unwrap_or(JoinResp { id: 0 });
        Ok((body.id > 0).then_some(body.id))
    }

    pub async fn send_ice_candidate(
        &self,
        room_id: &RoomId,
        peer_id: PeerId,
        ggid: u64,
        candidate: &RTCIceCandidateInit,
        direction: ConnDirection,
    ) -> Result<()> {
        self.post(
            "/ice",
            &IceMsg {
                room_id: room_id.as_ref(),
                id: peer_id.0,
                ggid,
                ice_candidate: candidate,
                connection_direction: direction,
            },
        )
        .await?;
        Ok(())
    }

    pub async fn send_offer(
        &self,
        room_id: &RoomId,
        peer_id: PeerId,
        ggid: u64,
        sdp: &RTCSessionDescription,
        direction: ConnDirection,
    ) -> Result<()> {
        self.post(
            "/offer",
            &SdpMsg {
                room_id: room_id.as_ref(),
                id: peer_id.0,
                ggid,
                sdp,
                connection_direction: direction,
            },
        )
        .await?;
        Ok(())
    }

    pub async fn send_answer(
        &self,
        room_id: &RoomId,
        peer_id: PeerId,
        ggid: u64,
        sdp: &RTCSessionDescription,
        direction: ConnDirection,
    ) -> Result<()> {
        self.post(
            "/answer",
            &SdpMsg {
                room_id: room_id.as_ref(),
                id: peer_id.0,
                ggid,
                sdp,
                connection_direction: direction,
            },
        )
        .await?;
        Ok(())
    }
}

/// Drives join/rejoin requests until logjam accepts them, then installs
/// the fresh room generation into the registry. Retries every 4 seconds;
/// one request at a time, in arrival order.
pub fn spawn_rejoin_watchdog(
    registry: Arc<RoomsRegistry>,
    client: Arc<SignalingClient>,
    mut rx: mpsc::UnboundedReceiver<RejoinRequest>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(req) = rx.recv().await {
            info!(room = %req.room_id, simply_join = req.simply_join, "membership request");
            loop {
                let attempt = if req.simply_join {
                    client.join(&req.room_id).await
                } else {
                    client.rejoin(&req.room_id).await
                };
                match attempt {
                    Ok(Some(ggid)) => {
                        registry.create_room(RoomId::from(req.room_id.as_str()), ggid);
                        break;
                    }
                    Ok(None) => {
                        // Accepted without a generation; nothing to install.
                        break;
                    }
                    Err(e) => {
                        warn!(room = %req.room_id, error = %e, "join attempt failed");
                        tokio::time::sleep(REJOIN_INTERVAL).await;
                    }
                }
            }
        }
    })
}

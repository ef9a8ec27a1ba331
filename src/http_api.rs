use std::convert::Infallible;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, warn};
use warp::http::StatusCode;
use warp::reply::Response;
use warp::{Filter, Rejection, Reply};

use crate::dto::{
    AddIceCandidateReq, CreatePeerReq, MessageResponse, PeerRef, ResetRoomResp, RoomReq, SetSdpReq,
};
use crate::error::EngineError;
use crate::id_types::{PeerId, RoomId};
use crate::registry::RoomsRegistry;

#[derive(Debug, Deserialize)]
struct HealthQuery {
    #[serde(rename = "roomId")]
    room_id: Option<String>,
}

/// The room-scoped surface consumed by logjam, plus healthcheck and the
/// Prometheus exposition.
pub fn routes(
    registry: Arc<RoomsRegistry>,
) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone {
    let start_room = warp::path!("room")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_registry(registry.clone()))
        .and_then(start_room);

    let reset_room = warp::path!("room")
        .and(warp::delete())
        .and(warp::body::json())
        .and(with_registry(registry.clone()))
        .and_then(reset_room);

    let create_peer = warp::path!("room" / "peer")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_registry(registry.clone()))
        .and_then(create_peer);

    let close_peer = warp::path!("room" / "peer")
        .and(warp::delete())
        .and(warp::body::json())
        .and(with_registry(registry.clone()))
        .and_then(close_peer);

    let add_ice = warp::path!("room" / "ice")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_registry(registry.clone()))
        .and_then(add_ice_candidate);

    let offer = warp::path!("room" / "offer")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_registry(registry.clone()))
        .and_then(set_offer);

    let answer = warp::path!("room" / "answer")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_registry(registry.clone()))
        .and_then(set_answer);

    let healthcheck = warp::path!("healthcheck")
        .and(warp::get())
        .and(warp::query::<HealthQuery>())
        .and(with_registry(registry))
        .and_then(healthcheck);

    let metrics = warp::path!("metrics").and(warp::get()).map(|| {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let mut buffer = vec![];
        let metric_families = prometheus::gather();
        encoder.encode(&metric_families, &mut buffer).unwrap_or_default();
        String::from_utf8(buffer).unwrap_or_default()
    });

    start_room
        .or(reset_room)
        .or(create_peer)
        .or(close_peer)
        .or(add_ice)
        .or(offer)
        .or(answer)
        .or(healthcheck)
        .or(metrics)
        .recover(handle_rejection)
}

fn with_registry(
    registry: Arc<RoomsRegistry>,
) -> impl Filter<Extract = (Arc<RoomsRegistry>,), Error = Infallible> + Clone {
    warp::any().map(move || registry.clone())
}

fn no_content() -> Response {
    StatusCode::NO_CONTENT.into_response()
}

fn reply_message(status: StatusCode, message: &str) -> Response {
    warp::reply::with_status(
        warp::reply::json(&MessageResponse {
            message: message.to_string(),
        }),
        status,
    )
    .into_response()
}

fn unprocessable() -> Response {
    reply_message(
        StatusCode::UNPROCESSABLE_ENTITY,
        "unprocessable entity, invalid input",
    )
}

fn engine_error(err: &EngineError) -> Response {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    reply_message(status, &err.to_string())
}

/// POST /room — ask logjam for membership, then install the room under
/// the generation it assigned. Transport failures hand the room to the
/// rejoin watchdog; the caller gets 204 either way.
async fn start_room(
    req: RoomReq,
    registry: Arc<RoomsRegistry>,
) -> Result<Response, Infallible> {
    if !req.validate() {
        return Ok(unprocessable());
    }
    match registry.signaling().join(&req.room_id).await {
        Ok(Some(ggid)) => registry.create_room(RoomId::from(req.room_id.as_str()), ggid),
        Ok(None) => debug!(room = %req.room_id, "join accepted without a generation id"),
        Err(e) => {
            warn!(room = %req.room_id, error = %e, "inline join failed, deferring to watchdog");
            registry.request_join(req.room_id.clone(), true);
        }
    }
    Ok(no_content())
}

/// DELETE /room — tear the room down and report its final generation.
async fn reset_room(
    req: RoomReq,
    registry: Arc<RoomsRegistry>,
) -> Result<Response, Infallible> {
    if !req.validate() {
        return Ok(unprocessable());
    }
    let ggid = registry.reset_room(&RoomId::from(req.room_id.as_str())).await;
    Ok(warp::reply::with_status(
        warp::reply::json(&ResetRoomResp { ggid }),
        StatusCode::OK,
    )
    .into_response())
}

async fn create_peer(
    req: CreatePeerReq,
    registry: Arc<RoomsRegistry>,
) -> Result<Response, Infallible> {
    if !req.validate() {
        return Ok(unprocessable());
    }
    let result = registry
        .create_peer(
            RoomId::from(req.peer.room_id.as_str()),
            PeerId(req.peer.id),
            req.can_publish,
            req.is_caller,
            req.ggid,
            req.connection_direction,
        )
        .await;
    match result {
        Ok(()) => Ok(no_content()),
        Err(e) => Ok(engine_error(&e)),
    }
}

async fn close_peer(req: PeerRef, registry: Arc<RoomsRegistry>) -> Result<Response, Infallible> {
    if !req.validate() {
        return Ok(unprocessable());
    }
    let result = registry
        .close_peer(&RoomId::from(req.room_id.as_str()), PeerId(req.id))
        .await;
    match result {
        Ok(()) => Ok(no_content()),
        Err(e) => Ok(engine_error(&e)),
    }
}

async fn add_ice_candidate(
    req: AddIceCandidateReq,
    registry: Arc<RoomsRegistry>,
) -> Result<Response, Infallible> {
    if !req.validate() {
        return Ok(unprocessable());
    }
    let result = registry
        .add_peer_ice_candidate(
            &RoomId::from(req.peer.room_id.as_str()),
            PeerId(req.peer.id),
            req.ice_candidate,
            req.connection_direction,
        )
        .await;
    match result {
        Ok(()) => Ok(no_content()),
        Err(e) => Ok(engine_error(&e)),
    }
}

/// POST /room/offer — apply the remote offer, answer it locally, and
/// relay the answer to logjam once the caller has been acknowledged.
async fn set_offer(req: SetSdpReq, registry: Arc<RoomsRegistry>) -> Result<Response, Infallible> {
    if !req.validate() {
        return Ok(unprocessable());
    }
    let room_id = RoomId::from(req.peer.room_id.as_str());
    let peer_id = PeerId(req.peer.id);
    debug!(room = %room_id, peer = %peer_id, "inbound offer");
    let answer = match registry
        .set_peer_offer(&room_id, peer_id, req.sdp, req.connection_direction)
        .await
    {
        Ok(answer) => answer,
        Err(e) => return Ok(engine_error(&e)),
    };

    let Some(ggid) = registry.room_ggid(&room_id) else {
        warn!(room = %room_id, "room generation is gone, not relaying the answer");
        return Ok(no_content());
    };
    let client = registry.signaling();
    let direction = req.connection_direction;
    tokio::spawn(async move {
        if let Err(e) = client
            .send_answer(&room_id, peer_id, ggid, &answer, direction)
            .await
        {
            warn!(room = %room_id, peer = %peer_id, error = %e, "relaying answer failed");
        }
    });
    Ok(no_content())
}

async fn set_answer(req: SetSdpReq, registry: Arc<RoomsRegistry>) -> Result<Response, Infallible> {
    if !req.validate() {
        return Ok(unprocessable());
    }
    debug!(peer = req.peer.id, room = %req.peer.room_id, "inbound answer");
    let result = registry
        .set_peer_answer(
            &RoomId::from(req.peer.room_id.as_str()),
            PeerId(req.peer.id),
            req.sdp,
            req.connection_direction,
        )
        .await;
    match result {
        Ok(()) => Ok(no_content()),
        Err(e) => Ok(engine_error(&e)),
    }
}

async fn healthcheck(
    query: HealthQuery,
    registry: Arc<RoomsRegistry>,
) -> Result<Response, Infallible> {
    if let Some(room_id) = query.room_id.filter(|r| !r.is_empty()) {
        if !registry.does_room_exist(&RoomId::from(room_id.as_str())) {
            return Ok(StatusCode::NOT_FOUND.into_response());
        }
    }
    Ok(no_content())
}

async fn handle_rejection(err: Rejection) -> Result<Response, Infallible> {
    if err.is_not_found() {
        return Ok(StatusCode::NOT_FOUND.into_response());
    }
    if err.find::<warp::body::BodyDeserializeError>().is_some() {
        return Ok(reply_message(
            StatusCode::BAD_REQUEST,
            "bad request, invalid input",
        ));
    }
    if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        return Ok(StatusCode::METHOD_NOT_ALLOWED.into_response());
    }
    warn!(?err, "unhandled rejection");
    Ok(reply_message(
        StatusCode::INTERNAL_SERVER_ERROR,
        "unhandled error, contact support",
    ))
}

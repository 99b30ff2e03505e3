//! HTTP/websocket boundary (§6): the only place that knows about axum. Every
//! handler here does the same thing -- adapt a transport into whatever
//! `relay_core` needs (a `SafeDuplexChannel` or a bare SDP offer string) and
//! hand it straight to a core handler. No signalling logic lives in this
//! file.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::extract::ws::WebSocketUpgrade;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use uuid::Uuid;

use relay_core::{RoomRegistry, WebRtcFacade};
use relay_core::{ingest_handler, participant_handler};
use relay_protocol::RelayConfig;

use crate::signaling::split_websocket;

/// SDP bodies over WHIP/WHEP are a handful of kilobytes of plain text; 64KB
/// is generous headroom over anything a real browser offer/answer produces.
const WHIP_WHEP_BODY_LIMIT: usize = 64 * 1024;

pub struct AppState {
    pub registry: Arc<RoomRegistry>,
    pub facade: Arc<WebRtcFacade>,
    pub config: RelayConfig,
    pub started_at: Instant,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/ws/ingest/{room}", get(ingest_ws))
        .route("/api/ws/ingest", get(missing_room))
        .route("/api/ws/ingest/", get(missing_room))
        .route("/api/ws/participant/{room}", get(participant_ws))
        .route("/api/ws/participant", get(missing_room))
        .route("/api/ws/participant/", get(missing_room))
        .route("/api/whip/{room}", post(whip))
        .route("/api/whip", post(missing_room))
        .route("/api/whip/", post(missing_room))
        .route("/api/whep/{room}", post(whep))
        .route("/api/whep", post(missing_room))
        .route("/api/whep/", post(missing_room))
        .route("/api/health", get(health))
        .layer(RequestBodyLimitLayer::new(WHIP_WHEP_BODY_LIMIT))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn missing_room() -> Response {
    bad_request("missing room name path segment")
}

fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, message.to_string()).into_response()
}

async fn ingest_ws(
    State(state): State<Arc<AppState>>,
    Path(room): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    if room.trim().is_empty() {
        return bad_request("missing room name path segment");
    }
    ws.on_upgrade(move |socket| async move {
        let (sink, stream) = split_websocket(socket);
        let duplex = relay_core::SafeDuplexChannel::spawn(sink, stream, state.config.verbose);
        if let Err(err) =
            ingest_handler::handle_ingest_join(&state.registry, &state.facade, &room, duplex).await
        {
            tracing::warn!(%err, room = %room, "ingest websocket join failed");
        }
    })
}

async fn participant_ws(
    State(state): State<Arc<AppState>>,
    Path(room): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    if room.trim().is_empty() {
        return bad_request("missing room name path segment");
    }
    ws.on_upgrade(move |socket| async move {
        let (sink, stream) = split_websocket(socket);
        let duplex = relay_core::SafeDuplexChannel::spawn(sink, stream, state.config.verbose);
        let name = format!("guest-{}", Uuid::new_v4());
        if let Err(err) = participant_handler::handle_participant_join(
            &state.registry,
            &state.facade,
            &room,
            name,
            duplex,
        )
        .await
        {
            tracing::warn!(%err, room = %room, "participant websocket join failed");
        }
    })
}

async fn whip(
    State(state): State<Arc<AppState>>,
    Path(room): Path<String>,
    offer_sdp: String,
) -> Response {
    if room.trim().is_empty() {
        return bad_request("missing room name path segment");
    }
    if offer_sdp.trim().is_empty() {
        return bad_request("empty SDP body");
    }
    match ingest_handler::handle_ingest_whip(&state.registry, &state.facade, &room, offer_sdp).await
    {
        Ok(answer_sdp) => sdp_response(answer_sdp),
        Err(err) => {
            tracing::warn!(%err, room = %room, "WHIP ingest negotiation failed");
            (StatusCode::CONFLICT, err.to_string()).into_response()
        }
    }
}

async fn whep(
    State(state): State<Arc<AppState>>,
    Path(room): Path<String>,
    offer_sdp: String,
) -> Response {
    if room.trim().is_empty() {
        return bad_request("missing room name path segment");
    }
    if offer_sdp.trim().is_empty() {
        return bad_request("empty SDP body");
    }
    match participant_handler::handle_participant_whep(
        &state.registry,
        &state.facade,
        &room,
        offer_sdp,
    )
    .await
    {
        Ok(answer_sdp) => sdp_response(answer_sdp),
        Err(err) => {
            tracing::warn!(%err, room = %room, "WHEP participant negotiation failed");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

fn sdp_response(sdp: String) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/sdp")],
        sdp,
    )
        .into_response()
}

async fn health(State(state): State<Arc<AppState>>) -> Response {
    let body = json!({
        "status": "ok",
        "rooms": state.registry.room_count().await,
        "uptime_secs": state.started_at.elapsed().as_secs(),
    });
    (StatusCode::OK, axum::Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_state() -> Arc<AppState> {
        let config = RelayConfig::default();
        let facade = Arc::new(WebRtcFacade::new(&config).unwrap());
        Arc::new(AppState {
            registry: RoomRegistry::new(),
            facade,
            config,
            started_at: Instant::now(),
        })
    }

    #[tokio::test]
    async fn health_reports_zero_rooms_on_a_fresh_registry() {
        let router = build_router(test_state());
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/api/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["rooms"], 0);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn cors_allows_any_origin() {
        let router = build_router(test_state());
        let response = router
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri("/api/health")
                    .header("origin", "https://example.com")
                    .header("access-control-request-method", "GET")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(response
            .headers()
            .get("access-control-allow-origin")
            .is_some());
    }

    #[tokio::test]
    async fn whip_with_empty_body_is_bad_request() {
        let router = build_router(test_state());
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/whip/alpha")
                    .body(Body::from(""))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn whep_missing_room_segment_is_bad_request() {
        let router = build_router(test_state());
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/whep/")
                    .body(Body::from("v=0"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn ingest_ws_missing_room_is_bad_request_before_upgrade() {
        let router = build_router(test_state());
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/api/ws/ingest/")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}

//! Front Door: the stateless HTTP/WS surface that authenticates, rate
//! limits, and routes into the right room instance. Terminates the join
//! token and the WebSocket upgrade; everything stateful lives behind a
//! `RoomHandle`.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::AppError;
use crate::ratelimit::RateLimiter;
use crate::room::{OutboundFrame, RoomHandle};
use crate::token::{self, Claims, VerifyOptions};
use crate::turn;

const DEV_ISSUER_TTL_MIN: i64 = 30;
const DEV_ISSUER_TTL_MAX: i64 = 600;

/// Lazily-spawning room directory, one `RoomHandle` per `roomId`.
///
/// Rooms are never removed from the map: an idle room's actor parks on its
/// command channel between ticks and costs one task, which this service
/// treats as acceptable given the in-scope lifetime is a single process run.
#[derive(Clone, Default)]
pub struct RoomRegistry {
    rooms: Arc<Mutex<HashMap<String, RoomHandle>>>,
}

impl RoomRegistry {
    pub async fn get_or_spawn(&self, room_id: &str) -> RoomHandle {
        let mut rooms = self.rooms.lock().await;
        rooms
            .entry(room_id.to_string())
            .or_insert_with(|| RoomHandle::spawn(room_id.to_string()))
            .clone()
    }

    async fn snapshot_all(&self) -> Vec<crate::room::RoomSnapshot> {
        let rooms: Vec<RoomHandle> = self.rooms.lock().await.values().cloned().collect();
        let mut out = Vec::with_capacity(rooms.len());
        for room in rooms {
            if let Ok(snapshot) = room.snapshot().await {
                out.push(snapshot);
            }
        }
        out
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub rooms: RoomRegistry,
    pub turn_rate_limiter: RateLimiter,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/token/issue", post(issue_dev_token))
        .route("/turn-credentials", get(turn_credentials))
        .route("/ws/:room_id", get(ws_upgrade))
        .route("/internal/rooms", get(internal_rooms))
        .with_state(state)
}

// ---- GET /health --------------------------------------------------------

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let room_count = state.rooms.rooms.lock().await.len();
    Json(serde_json::json!({
        "ok": true,
        "now": Utc::now().timestamp_millis(),
        "rooms": room_count,
    }))
}

// ---- GET /internal/rooms -------------------------------------------------

#[derive(Debug, Serialize)]
struct RoomSnapshotDto {
    #[serde(rename = "roomId")]
    room_id: String,
    #[serde(rename = "peerCount")]
    peer_count: usize,
    #[serde(rename = "connectedCount")]
    connected_count: usize,
    #[serde(rename = "pendingCount")]
    pending_count: usize,
    #[serde(rename = "resumeCount")]
    resume_count: usize,
}

async fn internal_rooms(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    let provided = headers
        .get("x-internal-secret")
        .and_then(|v| v.to_str().ok());
    match provided {
        Some(secret) if secret == state.config.internal_api_secret => {}
        _ => return Err(AppError::Unauthorized),
    }

    let snapshots: Vec<RoomSnapshotDto> = state
        .rooms
        .snapshot_all()
        .await
        .into_iter()
        .map(|s| RoomSnapshotDto {
            room_id: s.room_id,
            peer_count: s.peer_count,
            connected_count: s.connected_count,
            pending_count: s.pending_count,
            resume_count: s.resume_count,
        })
        .collect();

    Ok(Json(serde_json::json!({ "rooms": snapshots })))
}

// ---- POST /token/issue ----------------------------------------------------

#[derive(Debug, Deserialize)]
struct IssueTokenRequest {
    #[serde(rename = "userId")]
    user_id: String,
    #[serde(rename = "roomId")]
    room_id: String,
    name: Option<String>,
    #[serde(rename = "ttlSeconds")]
    ttl_seconds: Option<i64>,
}

#[derive(Debug, Serialize)]
struct IssueTokenResponse {
    token: String,
    #[serde(rename = "roomId")]
    room_id: String,
    #[serde(rename = "userId")]
    user_id: String,
    name: Option<String>,
    #[serde(rename = "expiresAt")]
    expires_at: i64,
}

async fn issue_dev_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<IssueTokenRequest>,
) -> Result<impl IntoResponse, AppError> {
    if !state.config.allow_dev_token_issuer {
        return Err(AppError::DevIssuerDisabled);
    }

    // Each header validates against its own correspondingly-named secret;
    // either one matching is sufficient to admit the request.
    let internal_header = headers
        .get("x-internal-secret")
        .and_then(|v| v.to_str().ok());
    let internal_ok = internal_header == Some(state.config.internal_api_secret.as_str());

    let dev_header = headers
        .get("x-dev-issuer-secret")
        .and_then(|v| v.to_str().ok());
    let dev_ok = state
        .config
        .dev_issuer_secret
        .as_deref()
        .is_some_and(|expected| dev_header == Some(expected));

    if !internal_ok && !dev_ok {
        return Err(AppError::Forbidden);
    }

    if body.user_id.trim().is_empty() || body.room_id.trim().is_empty() {
        return Err(AppError::BadRequest("userId and roomId are required".into()));
    }

    let now = Utc::now().timestamp();
    let ttl = body
        .ttl_seconds
        .unwrap_or(DEV_ISSUER_TTL_MIN)
        .clamp(DEV_ISSUER_TTL_MIN, DEV_ISSUER_TTL_MAX);
    let expires_at = now + ttl;

    let claims = Claims {
        sub: body.user_id.clone(),
        room: body.room_id.clone(),
        name: body.name.clone(),
        iat: now,
        exp: expires_at,
        jti: Some(Uuid::new_v4().to_string()),
    };
    let signed = token::sign(&claims, state.config.join_token_secret.as_bytes());

    Ok(Json(IssueTokenResponse {
        token: signed,
        room_id: body.room_id,
        user_id: body.user_id,
        name: body.name,
        expires_at,
    }))
}

// ---- GET /turn-credentials -------------------------------------------------

#[derive(Debug, Deserialize)]
struct TurnQuery {
    token: Option<String>,
}

#[derive(Debug, Serialize)]
struct IceServer {
    urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    credential: Option<String>,
}

async fn turn_credentials(
    State(state): State<AppState>,
    Query(query): Query<TurnQuery>,
) -> Result<impl IntoResponse, AppError> {
    let token = query.token.as_deref().ok_or(AppError::Unauthorized)?;
    let now = Utc::now().timestamp();
    let claims = token::verify(
        token,
        state.config.join_token_secret.as_bytes(),
        VerifyOptions {
            expected_room: None,
            now,
        },
    )
    .map_err(|_| AppError::Unauthorized)?;

    let scope_key = format!("turn:{}", claims.sub);
    let window_ms = state.config.turn_rate_limit_window().as_millis() as i64;
    let check = state
        .turn_rate_limiter
        .check(&scope_key, state.config.turn_rate_limit_max, window_ms, now * 1000)
        .await;

    if !check.allowed {
        return Err(AppError::RateLimited {
            remaining: check.remaining,
            reset_at: check.reset_at_ms / 1000,
        });
    }

    let creds = turn::mint(
        &claims.sub,
        state.config.turn_shared_secret.as_deref(),
        state.config.turn_ttl_seconds,
        now,
    );

    let mut ice_servers = Vec::new();
    if !state.config.turn_urls.is_empty() {
        ice_servers.push(IceServer {
            urls: state.config.turn_urls.clone(),
            username: creds.as_ref().map(|c| c.username.clone()),
            credential: creds.as_ref().map(|c| c.credential.clone()),
        });
    }

    Ok(Json(serde_json::json!({
        "iceServers": ice_servers,
        "ttlSeconds": state.config.turn_ttl_seconds,
        "rateLimit": {
            "remaining": check.remaining,
            "resetAt": check.reset_at_ms / 1000,
        },
    })))
}

// ---- GET /ws/:room_id -------------------------------------------------------

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: Option<String>,
    #[serde(rename = "resumeToken")]
    resume_token: Option<String>,
}

async fn ws_upgrade(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ws: Option<WebSocketUpgrade>,
) -> Result<Response, AppError> {
    let ws = ws.ok_or(AppError::ExpectedWebSocket)?;
    let token = extract_token(&headers, query.token.as_deref()).ok_or(AppError::Unauthorized)?;
    let now = Utc::now().timestamp();
    let claims = token::verify(
        &token,
        state.config.join_token_secret.as_bytes(),
        VerifyOptions {
            expected_room: Some(&room_id),
            now,
        },
    )
    .map_err(|_| AppError::Unauthorized)?;

    let room = state.rooms.get_or_spawn(&room_id).await;
    let resume_token = query.resume_token;

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, room, claims, resume_token)))
}

fn extract_token(headers: &HeaderMap, query_token: Option<&str>) -> Option<String> {
    if let Some(auth) = headers.get(axum::http::header::AUTHORIZATION) {
        if let Ok(value) = auth.to_str() {
            if let Some(bearer) = value.strip_prefix("Bearer ") {
                return Some(bearer.to_string());
            }
        }
    }
    query_token.map(str::to_string)
}

async fn handle_socket(
    socket: WebSocket,
    room: RoomHandle,
    claims: Claims,
    resume_token: Option<String>,
) {
    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<OutboundFrame>();
    let error_socket_tx = outbound_tx.clone();

    let attached = match room.attach_socket(claims.clone(), resume_token, outbound_tx).await {
        Ok(info) => info,
        Err(_) => {
            let _ = sink
                .send(Message::Close(Some(CloseFrame {
                    code: 1011,
                    reason: "room unavailable".into(),
                })))
                .await;
            return;
        }
    };

    info!(
        room = %claims.room,
        peer_id = %attached.peer_id,
        user_id = %claims.sub,
        "peer attached"
    );

    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let ws_msg = match frame {
                OutboundFrame::Text(text) => Message::Text(text),
                OutboundFrame::Close { code, reason } => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            };
            if sink.send(ws_msg).await.is_err() {
                break;
            }
        }
    });

    let peer_id = attached.peer_id.clone();
    let recv_room = room.clone();
    let error_tx = error_socket_tx.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(item) = stream.next().await {
            let msg = match item {
                Ok(msg) => msg,
                Err(_) => break,
            };
            match msg {
                Message::Text(text) => match crate::protocol::decode(&text) {
                    Ok(decoded) => recv_room.handle_message(peer_id.clone(), decoded).await,
                    Err(crate::protocol::DecodeError::Unsupported) => {
                        warn!(peer_id = %peer_id, "dropped unsupported message type");
                        let _ = error_tx.send(OutboundFrame::Text(
                            crate::protocol::ServerMessage::error(
                                crate::protocol::ErrorCode::Unsupported,
                                "unsupported message type",
                                None,
                            )
                            .to_json(),
                        ));
                    }
                    Err(crate::protocol::DecodeError::Malformed) => {
                        warn!(peer_id = %peer_id, "dropped malformed client message");
                        let _ = error_tx.send(OutboundFrame::Text(
                            crate::protocol::ServerMessage::error(
                                crate::protocol::ErrorCode::BadMessage,
                                "malformed message",
                                None,
                            )
                            .to_json(),
                        ));
                    }
                },
                Message::Binary(_) => {
                    warn!(peer_id = %peer_id, "rejected binary frame");
                    let _ = error_tx.send(OutboundFrame::Text(
                        crate::protocol::ServerMessage::error(
                            crate::protocol::ErrorCode::BadMessage,
                            "binary frames are not supported",
                            None,
                        )
                        .to_json(),
                    ));
                }
                Message::Close(_) => break,
                Message::Ping(_) | Message::Pong(_) => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    room.handle_depart(attached.peer_id, attached.generation).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn test_config() -> Config {
        Config {
            join_token_secret: "join-secret".to_string(),
            internal_api_secret: "internal-secret".to_string(),
            dev_issuer_secret: Some("dev-secret".to_string()),
            allow_dev_token_issuer: true,
            turn_urls: vec!["turn:example.com:3478".to_string()],
            turn_shared_secret: Some("turn-secret".to_string()),
            turn_ttl_seconds: 3600,
            turn_rate_limit_max: 1,
            turn_rate_limit_window_sec: 60,
            bind_addr: "127.0.0.1:0".to_string(),
        }
    }

    fn test_state(config: Config) -> AppState {
        AppState {
            config: Arc::new(config),
            rooms: RoomRegistry::default(),
            turn_rate_limiter: RateLimiter::new(),
        }
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("reads body");
        serde_json::from_slice(&bytes).expect("valid json body")
    }

    fn signed_token(secret: &str, sub: &str, room: &str) -> String {
        let claims = Claims {
            sub: sub.to_string(),
            room: room.to_string(),
            name: None,
            iat: 0,
            exp: i64::MAX,
            jti: None,
        };
        token::sign(&claims, secret.as_bytes())
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let app = build_router(test_state(test_config()));
        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["ok"], serde_json::json!(true));
    }

    #[tokio::test]
    async fn dev_issuer_disabled_returns_403() {
        let mut config = test_config();
        config.allow_dev_token_issuer = false;
        let app = build_router(test_state(config));

        let req = Request::builder()
            .method("POST")
            .uri("/token/issue")
            .header("content-type", "application/json")
            .header("x-dev-issuer-secret", "dev-secret")
            .body(Body::from(r#"{"userId":"alice","roomId":"R"}"#))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        let body = body_json(resp).await;
        assert_eq!(body["error"]["code"], serde_json::json!("DEV_ISSUER_DISABLED"));
    }

    #[tokio::test]
    async fn dev_issuer_rejects_wrong_secret() {
        let app = build_router(test_state(test_config()));
        let req = Request::builder()
            .method("POST")
            .uri("/token/issue")
            .header("content-type", "application/json")
            .header("x-dev-issuer-secret", "wrong-secret")
            .body(Body::from(r#"{"userId":"alice","roomId":"R"}"#))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        let body = body_json(resp).await;
        assert_eq!(body["error"]["code"], serde_json::json!("FORBIDDEN"));
    }

    #[tokio::test]
    async fn dev_issuer_accepts_internal_secret_even_with_dev_secret_configured() {
        // internal_api_secret and dev_issuer_secret are configured to
        // different values; a caller presenting the correct internal
        // secret must be admitted regardless of the dev secret.
        let app = build_router(test_state(test_config()));
        let req = Request::builder()
            .method("POST")
            .uri("/token/issue")
            .header("content-type", "application/json")
            .header("x-internal-secret", "internal-secret")
            .body(Body::from(r#"{"userId":"alice","roomId":"R"}"#))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["roomId"], serde_json::json!("R"));
    }

    #[tokio::test]
    async fn turn_credentials_missing_token_is_unauthorized() {
        let app = build_router(test_state(test_config()));
        let req = Request::builder()
            .uri("/turn-credentials")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn turn_credentials_rate_limits_second_request() {
        let config = test_config(); // turn_rate_limit_max = 1
        let secret = config.join_token_secret.clone();
        let app = build_router(test_state(config));
        let token = signed_token(&secret, "alice", "R");

        let req1 = Request::builder()
            .uri(format!("/turn-credentials?token={token}"))
            .body(Body::empty())
            .unwrap();
        let resp1 = app.clone().oneshot(req1).await.unwrap();
        assert_eq!(resp1.status(), StatusCode::OK);

        let req2 = Request::builder()
            .uri(format!("/turn-credentials?token={token}"))
            .body(Body::empty())
            .unwrap();
        let resp2 = app.oneshot(req2).await.unwrap();
        assert_eq!(resp2.status(), StatusCode::TOO_MANY_REQUESTS);
        let body = body_json(resp2).await;
        assert_eq!(body["error"]["code"], serde_json::json!("RATE_LIMITED"));
        assert_eq!(body["rateLimit"]["remaining"], serde_json::json!(0));
    }

    #[tokio::test]
    async fn ws_upgrade_without_token_is_unauthorized() {
        let app = build_router(test_state(test_config()));
        let req = Request::builder()
            .uri("/ws/room1")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn ws_upgrade_without_websocket_headers_requires_upgrade() {
        let config = test_config();
        let secret = config.join_token_secret.clone();
        let app = build_router(test_state(config));
        let token = signed_token(&secret, "alice", "room1");

        let req = Request::builder()
            .uri(format!("/ws/room1?token={token}"))
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UPGRADE_REQUIRED);
    }

    #[tokio::test]
    async fn ws_upgrade_rejects_wrong_room_binding() {
        let config = test_config();
        let secret = config.join_token_secret.clone();
        let app = build_router(test_state(config));
        let token = signed_token(&secret, "alice", "room-a");

        let req = Request::builder()
            .uri("/ws/room-b?token=".to_string() + &token)
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }
}

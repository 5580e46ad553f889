use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, Method, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{debug, error, warn};

use weir_protocol::{SessionActionRequest, SessionEntry, ViewerActionRequest, WeirConfig};

use crate::connection::SignalProtocol;
use crate::engine::Engine;
use crate::registry::SessionRegistry;
use crate::signaling::{self, ExchangeRequest, SessionQuery, SignalError};
use crate::streams::StreamHub;

/// Shared application state.
pub struct AppState {
    pub config: WeirConfig,
    pub engine: Arc<Engine>,
    pub registry: Arc<SessionRegistry>,
    pub streams: Arc<StreamHub>,
    pub started_at: Instant,
}

/// Build the Axum router with all routes.
///
/// Every endpoint answers CORS preflight with permissive headers; the
/// control plane is meant to sit behind a reverse proxy when it needs
/// authentication.
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);

    Router::new()
        .route("/api/ws", get(ws_upgrade))
        .route("/api/webrtc", post(sync_offer))
        .route("/api/webrtc/sessions", get(list_sessions))
        .route("/api/webrtc/session/pause", post(pause_session))
        .route("/api/webrtc/session/resume", post(resume_session))
        .route("/api/webrtc/pause", post(pause_by_viewer))
        .route("/api/webrtc/resume", post(resume_by_viewer))
        .route("/api/health", get(health))
        .layer(RequestBodyLimitLayer::new(65_536)) // 64KB max request body
        .layer(cors)
        .with_state(state)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Resolve the client address: first token of `X-Forwarded-For`, then
/// `X-Real-IP`, then the `for=` parameter of RFC 7239 `Forwarded`, then
/// the raw remote address.
pub fn client_ip(headers: &HeaderMap, remote: Option<SocketAddr>) -> String {
    if let Some(forwarded_for) = header_str(headers, "x-forwarded-for")
        && let Some(first) = forwarded_for.split(',').next()
    {
        let first = first.trim();
        if !first.is_empty() {
            return first.to_string();
        }
    }
    if let Some(real_ip) = header_str(headers, "x-real-ip") {
        let real_ip = real_ip.trim();
        if !real_ip.is_empty() {
            return real_ip.to_string();
        }
    }
    if let Some(forwarded) = header_str(headers, "forwarded")
        && let Some(addr) = forwarded_for_param(forwarded)
    {
        return addr;
    }
    remote.map(|addr| addr.ip().to_string()).unwrap_or_default()
}

/// RFC 7239 `for=` value: surrounding quotes stripped, IPv6 brackets
/// stripped, port dropped.
fn forwarded_for_param(forwarded: &str) -> Option<String> {
    for part in forwarded.split(';').flat_map(|p| p.split(',')) {
        let part = part.trim();
        if part.len() <= 4 || !part[..4].eq_ignore_ascii_case("for=") {
            continue;
        }
        let value = part[4..].trim_matches('"');
        let host = if let Some(rest) = value.strip_prefix('[') {
            rest.split(']').next().unwrap_or(rest)
        } else if let Some((host, port)) = value.rsplit_once(':') {
            if !host.contains(':') && port.chars().all(|c| c.is_ascii_digit()) {
                host
            } else {
                value
            }
        } else {
            value
        };
        if !host.is_empty() {
            return Some(host.to_string());
        }
    }
    None
}

/// GET /api/ws - WebSocket upgrade for async signaling
async fn ws_upgrade(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SessionQuery>,
    headers: HeaderMap,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let ip = client_ip(&headers, Some(remote));
    let user_agent = header_str(&headers, "user-agent")
        .unwrap_or_default()
        .to_string();
    ws.max_message_size(65_536) // 64KB max for signaling messages
        .on_upgrade(move |socket| signaling::handle_ws(socket, query, ip, user_agent, state))
}

/// POST /api/webrtc?src=<stream> - synchronous offer/answer exchange.
///
/// The role is inferred from the offer's media directions and the answer
/// is returned only after ICE gathering completes, candidates folded in.
async fn sync_offer(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SessionQuery>,
    headers: HeaderMap,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    body: String,
) -> axum::response::Response {
    let Some(stream_name) = query.src.clone().or_else(|| query.dst.clone()) else {
        return (StatusCode::NOT_FOUND, "Stream not found").into_response();
    };
    if body.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "Missing SDP offer").into_response();
    }

    let req = ExchangeRequest {
        stream_name,
        mode: None,
        viewer_id: query.viewer_id.clone().unwrap_or_default(),
        start_paused: query.paused.unwrap_or(false),
        client_ip: client_ip(&headers, Some(remote)),
        user_agent: header_str(&headers, "user-agent")
            .unwrap_or_default()
            .to_string(),
        protocol: SignalProtocol::Http,
        ice_servers: None,
    };

    match signaling::exchange(&state, req, &body, None).await {
        Ok((_conn, answer)) => {
            ([(header::CONTENT_TYPE, "application/sdp")], answer).into_response()
        }
        Err(e) => signal_error_response(e),
    }
}

fn signal_error_response(e: SignalError) -> axum::response::Response {
    let status = match &e {
        SignalError::StreamNotFound => StatusCode::NOT_FOUND,
        SignalError::OfferInvalid(_) => StatusCode::BAD_REQUEST,
        SignalError::AddConsumerFailed(_) | SignalError::Collision(_) | SignalError::Engine(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    match &e {
        SignalError::StreamNotFound => debug!("Stream not found"),
        SignalError::OfferInvalid(err) => warn!("Rejected offer: {err:#}"),
        _ => error!("Signaling failed: {e}"),
    }
    (status, e.to_string()).into_response()
}

/// GET /api/webrtc/sessions - point-in-time session listing
async fn list_sessions(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let sessions: Vec<SessionEntry> = state
        .registry
        .snapshot()
        .iter()
        .map(|conn| conn.entry())
        .collect();
    Json(json!({ "count": sessions.len(), "sessions": sessions }))
}

/// POST /api/webrtc/session/pause - pause one session by id
async fn pause_session(State(state): State<Arc<AppState>>, body: String) -> impl IntoResponse {
    session_action(&state, &body, true)
}

/// POST /api/webrtc/session/resume - resume one session by id
async fn resume_session(State(state): State<Arc<AppState>>, body: String) -> impl IntoResponse {
    session_action(&state, &body, false)
}

fn session_action(state: &AppState, body: &str, pause: bool) -> axum::response::Response {
    let action = if pause { "pause" } else { "resume" };

    let req: SessionActionRequest = match serde_json::from_str(body) {
        Ok(req) => req,
        Err(_) => return (StatusCode::BAD_REQUEST, "Invalid request body").into_response(),
    };
    let session_id = match req.session_id {
        Some(sid) if !sid.is_empty() => sid,
        _ => return (StatusCode::BAD_REQUEST, "Missing session_id").into_response(),
    };

    let Some(conn) = state.registry.lookup_by_session(&session_id) else {
        return (StatusCode::NOT_FOUND, "Session not found").into_response();
    };
    if pause {
        conn.pause();
    } else {
        conn.resume();
    }

    Json(json!({
        "success": true,
        "action": action,
        "session_id": session_id,
    }))
    .into_response()
}

/// POST /api/webrtc/pause - pause consumers by viewer id (empty = all)
async fn pause_by_viewer(State(state): State<Arc<AppState>>, body: String) -> impl IntoResponse {
    viewer_action(&state, &body, true)
}

/// POST /api/webrtc/resume - resume consumers by viewer id (empty = all)
async fn resume_by_viewer(State(state): State<Arc<AppState>>, body: String) -> impl IntoResponse {
    viewer_action(&state, &body, false)
}

fn viewer_action(state: &AppState, body: &str, pause: bool) -> axum::response::Response {
    let action = if pause { "pause" } else { "resume" };

    let req: ViewerActionRequest = if body.trim().is_empty() {
        ViewerActionRequest::default()
    } else {
        match serde_json::from_str(body) {
            Ok(req) => req,
            Err(_) => return (StatusCode::BAD_REQUEST, "Invalid request body").into_response(),
        }
    };
    let viewer_id = req.viewer_id.unwrap_or_default();

    let mut affected = 0usize;
    for conn in state.registry.consumers() {
        if viewer_id.is_empty() || viewer_id == conn.viewer_id() {
            if pause {
                conn.pause();
            } else {
                conn.resume();
            }
            affected += 1;
        }
    }

    let count_field = if pause {
        "paused_connections"
    } else {
        "resumed_connections"
    };
    let mut response = json!({
        "action": action,
        "viewer_id": viewer_id,
        "success": affected > 0,
    });
    response[count_field] = json!(affected);
    Json(response).into_response()
}

/// GET /api/health - liveness (no auth, minimal info)
async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "sessions": state.registry.len(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::test_support::test_connection;
    use crate::connection::{Connection, Mode};

    #[test]
    fn client_ip_takes_first_forwarded_for_token() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "1.2.3.4, 5.6.7.8, 9.9.9.9".parse().unwrap());
        assert_eq!(client_ip(&headers, None), "1.2.3.4");
    }

    #[test]
    fn client_ip_falls_back_to_real_ip() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", "5.6.7.8".parse().unwrap());
        assert_eq!(client_ip(&headers, None), "5.6.7.8");
    }

    #[test]
    fn client_ip_prefers_forwarded_for_over_real_ip() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "1.2.3.4".parse().unwrap());
        headers.insert("x-real-ip", "5.6.7.8".parse().unwrap());
        assert_eq!(client_ip(&headers, None), "1.2.3.4");
    }

    #[test]
    fn client_ip_parses_rfc7239_ipv6() {
        let mut headers = HeaderMap::new();
        headers.insert("forwarded", r#"for="[::1]:1234""#.parse().unwrap());
        assert_eq!(client_ip(&headers, None), "::1");
    }

    #[test]
    fn client_ip_parses_rfc7239_ipv4_with_port() {
        let mut headers = HeaderMap::new();
        headers.insert("forwarded", "for=1.2.3.4:5678;proto=https".parse().unwrap());
        assert_eq!(client_ip(&headers, None), "1.2.3.4");
    }

    #[test]
    fn client_ip_uses_remote_address_last() {
        let headers = HeaderMap::new();
        let remote: SocketAddr = "10.0.0.9:43210".parse().unwrap();
        assert_eq!(client_ip(&headers, Some(remote)), "10.0.0.9");
    }

    #[test]
    fn client_ip_empty_without_any_source() {
        let headers = HeaderMap::new();
        assert_eq!(client_ip(&headers, None), "");
    }

    // --- HTTP-level integration tests ---
    //
    // These use `tower::ServiceExt::oneshot` to send requests through the
    // axum router without starting a real HTTP server.

    use axum::body::Body;
    use axum::extract::connect_info::MockConnectInfo;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    /// Router with a mocked peer address, standing in for
    /// `into_make_service_with_connect_info` in tests.
    fn test_app(state: Arc<AppState>) -> Router {
        build_router(state).layer(MockConnectInfo(SocketAddr::from(([127, 0, 0, 1], 4242))))
    }

    async fn test_app_state() -> Arc<AppState> {
        let mut config: WeirConfig = toml::from_str("").expect("default config");
        // Keep tests off fixed ports.
        config.webrtc.listen = String::new();
        config
            .streams
            .insert("cam1".to_string(), "test://cam1".to_string());
        let engine = Arc::new(Engine::new(&config.webrtc).await.expect("engine"));
        let streams = Arc::new(StreamHub::from_config(&config.streams));
        Arc::new(AppState {
            config,
            engine,
            registry: Arc::new(SessionRegistry::new()),
            streams,
            started_at: Instant::now(),
        })
    }

    async fn register_connection(
        state: &Arc<AppState>,
        session_id: &str,
        viewer_id: &str,
        mode: Mode,
    ) -> Arc<Connection> {
        let conn = test_connection(
            &state.engine,
            state.registry.allocate_id(),
            session_id,
            viewer_id,
            mode,
        )
        .await;
        state
            .registry
            .register(Arc::clone(&conn))
            .expect("register");
        conn
    }

    /// Helper: parse a response body as `serde_json::Value`.
    async fn body_json(response: axum::response::Response<Body>) -> serde_json::Value {
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("failed to read response body")
            .to_bytes();
        serde_json::from_slice(&bytes).expect("response body is not valid JSON")
    }

    async fn body_text(response: axum::response::Response<Body>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_returns_ok() {
        let state = test_app_state().await;
        let app = test_app(state);

        let request = Request::builder()
            .uri("/api/health")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["status"], "ok");
        assert!(json["version"].is_string());
        assert_eq!(json["sessions"], 0);
    }

    #[tokio::test]
    async fn sessions_listing_starts_empty() {
        let state = test_app_state().await;
        let app = test_app(state);

        let request = Request::builder()
            .uri("/api/webrtc/sessions")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["count"], 0);
        assert_eq!(json["sessions"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn sessions_listing_shows_registered_connection() {
        let state = test_app_state().await;
        let sid = "ab".repeat(16);
        register_connection(&state, &sid, "viewer-7", Mode::PassiveConsumer).await;
        let app = test_app(Arc::clone(&state));

        let request = Request::builder()
            .uri("/api/webrtc/sessions")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let json = body_json(response).await;

        assert_eq!(json["count"], 1);
        let entry = &json["sessions"][0];
        assert_eq!(entry["session_id"], sid);
        assert_eq!(entry["stream_source"], "cam1");
        assert_eq!(entry["viewer_id"], "viewer-7");
        assert_eq!(entry["mode"], "passive consumer");
        assert_eq!(entry["paused"], false);
        assert_eq!(entry["session_id"].as_str().unwrap().len(), 32);
    }

    #[tokio::test]
    async fn sessions_listing_is_ordered_by_connection_id() {
        let state = test_app_state().await;
        register_connection(&state, &"a".repeat(32), "", Mode::PassiveConsumer).await;
        register_connection(&state, &"b".repeat(32), "", Mode::PassiveConsumer).await;
        register_connection(&state, &"c".repeat(32), "", Mode::PassiveConsumer).await;
        let app = test_app(Arc::clone(&state));

        let request = Request::builder()
            .uri("/api/webrtc/sessions")
            .body(Body::empty())
            .unwrap();
        let json = body_json(app.oneshot(request).await.unwrap()).await;

        let ids: Vec<u64> = json["sessions"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["connection_id"].as_u64().unwrap())
            .collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(ids, sorted);
        assert_eq!(ids.len(), 3);
    }

    #[tokio::test]
    async fn pause_without_session_id_is_bad_request() {
        let state = test_app_state().await;
        let app = test_app(state);

        let response = app
            .oneshot(post_json("/api/webrtc/session/pause", json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn pause_with_garbage_body_is_bad_request() {
        let state = test_app_state().await;
        let app = test_app(state);

        let request = Request::builder()
            .method("POST")
            .uri("/api/webrtc/session/pause")
            .body(Body::from("not json"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn pause_unknown_session_is_not_found() {
        let state = test_app_state().await;
        let app = test_app(state);

        let response = app
            .oneshot(post_json(
                "/api/webrtc/session/pause",
                json!({ "session_id": "deadbeef".repeat(4) }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_text(response).await, "Session not found");
    }

    #[tokio::test]
    async fn pause_and_resume_flip_listed_state() {
        let state = test_app_state().await;
        let sid = "cd".repeat(16);
        let conn = register_connection(&state, &sid, "", Mode::PassiveConsumer).await;

        let app = test_app(Arc::clone(&state));
        let response = app
            .clone()
            .oneshot(post_json(
                "/api/webrtc/session/pause",
                json!({ "session_id": sid }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["action"], "pause");
        assert_eq!(json["session_id"], sid);
        assert!(conn.is_paused());

        let request = Request::builder()
            .uri("/api/webrtc/sessions")
            .body(Body::empty())
            .unwrap();
        let listing = body_json(app.clone().oneshot(request).await.unwrap()).await;
        assert_eq!(listing["sessions"][0]["paused"], true);

        let response = app
            .oneshot(post_json(
                "/api/webrtc/session/resume",
                json!({ "session_id": sid }),
            ))
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["action"], "resume");
        assert!(!conn.is_paused());
    }

    #[tokio::test]
    async fn viewer_pause_matches_viewer_id() {
        let state = test_app_state().await;
        let a1 = register_connection(&state, &"a1".repeat(16), "A", Mode::PassiveConsumer).await;
        let a2 = register_connection(&state, &"a2".repeat(16), "A", Mode::PassiveConsumer).await;
        let b = register_connection(&state, &"b1".repeat(16), "B", Mode::PassiveConsumer).await;

        let app = test_app(Arc::clone(&state));
        let response = app
            .oneshot(post_json(
                "/api/webrtc/pause",
                json!({ "action": "pause", "viewer_id": "A" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["paused_connections"], 2);
        assert_eq!(json["viewer_id"], "A");
        assert_eq!(json["success"], true);

        assert!(a1.is_paused());
        assert!(a2.is_paused());
        assert!(!b.is_paused());
    }

    #[tokio::test]
    async fn viewer_pause_with_empty_viewer_hits_all_consumers_only() {
        let state = test_app_state().await;
        let consumer =
            register_connection(&state, &"ca".repeat(16), "A", Mode::PassiveConsumer).await;
        let producer =
            register_connection(&state, &"cb".repeat(16), "", Mode::PassiveProducer).await;

        let app = test_app(Arc::clone(&state));
        let response = app
            .oneshot(post_json("/api/webrtc/pause", json!({ "action": "pause" })))
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["paused_connections"], 1);
        assert_eq!(json["success"], true);

        assert!(consumer.is_paused());
        assert!(!producer.is_paused());
    }

    #[tokio::test]
    async fn viewer_pause_without_match_reports_failure() {
        let state = test_app_state().await;
        register_connection(&state, &"dd".repeat(16), "A", Mode::PassiveConsumer).await;

        let app = test_app(Arc::clone(&state));
        let response = app
            .oneshot(post_json(
                "/api/webrtc/resume",
                json!({ "action": "resume", "viewer_id": "nobody" }),
            ))
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["resumed_connections"], 0);
        assert_eq!(json["success"], false);
    }

    #[tokio::test]
    async fn closed_session_disappears_and_pause_turns_404() {
        let state = test_app_state().await;
        let sid = "ee".repeat(16);
        let conn = register_connection(&state, &sid, "", Mode::PassiveConsumer).await;

        // Simulate the engine's CLOSED teardown path
        assert!(conn.mark_closed());
        state.registry.unregister(&conn);

        let app = test_app(Arc::clone(&state));
        let request = Request::builder()
            .uri("/api/webrtc/sessions")
            .body(Body::empty())
            .unwrap();
        let listing = body_json(app.clone().oneshot(request).await.unwrap()).await;
        assert_eq!(listing["count"], 0);

        let response = app
            .oneshot(post_json(
                "/api/webrtc/session/pause",
                json!({ "session_id": sid }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn cors_preflight_is_permissive() {
        let state = test_app_state().await;
        let app = test_app(state);

        let request = Request::builder()
            .method("OPTIONS")
            .uri("/api/webrtc/sessions")
            .header("origin", "https://example.com")
            .header("access-control-request-method", "POST")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let headers = response.headers();
        assert_eq!(
            headers
                .get("access-control-allow-origin")
                .map(|v| v.as_bytes()),
            Some(b"*".as_slice())
        );
        let methods = headers
            .get("access-control-allow-methods")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        assert!(methods.contains("GET"));
        assert!(methods.contains("DELETE"));
    }

    #[tokio::test]
    async fn sync_offer_without_stream_param_is_not_found() {
        let state = test_app_state().await;
        let app = test_app(state);

        let request = Request::builder()
            .method("POST")
            .uri("/api/webrtc")
            .body(Body::from("v=0"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn sync_offer_unknown_stream_is_not_found() {
        let state = test_app_state().await;
        let app = test_app(state);

        let request = Request::builder()
            .method("POST")
            .uri("/api/webrtc?src=nope")
            .body(Body::from("v=0"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn sync_offer_with_garbage_sdp_is_bad_request() {
        let state = test_app_state().await;
        let app = test_app(state);

        let request = Request::builder()
            .method("POST")
            .uri("/api/webrtc?src=cam1")
            .body(Body::from("this is not sdp"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn exchange_reports_stream_not_found() {
        let state = test_app_state().await;
        let req = ExchangeRequest {
            stream_name: "missing".to_string(),
            mode: Some(Mode::PassiveConsumer),
            viewer_id: String::new(),
            start_paused: false,
            client_ip: "127.0.0.1".to_string(),
            user_agent: "test".to_string(),
            protocol: SignalProtocol::Ws,
            ice_servers: None,
        };
        let result = signaling::exchange(&state, req, "v=0", None).await;
        assert!(matches!(result, Err(SignalError::StreamNotFound)));
    }
}

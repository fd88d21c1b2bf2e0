use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use axum::extract::{Query, State};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router, middleware};
use droidnotify_mcp::{JsonRpcMessage, JsonRpcRequest, JsonRpcResponse, parse_message};
use futures_util::stream::{self, Stream, StreamExt as _};
use serde::Deserialize;
use tokio::sync::mpsc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::app::AppState;
use crate::auth::require_auth;
use crate::session::{Session, SessionHub};

const SESSION_HEADER: &str = "mcp-session-id";
const PROTOCOL_HEADER: &str = "mcp-protocol-version";

pub const LEGACY_SSE_PATH: &str = "/sse";
pub const LEGACY_MESSAGES_PATH: &str = "/messages";
pub const HEALTH_PATH: &str = "/health";

pub fn router(st: AppState, mcp_path: &str) -> Router {
    let protected = Router::new()
        .route(mcp_path, post(mcp_post).get(mcp_get).delete(mcp_delete))
        .route(LEGACY_SSE_PATH, get(sse_connect))
        .route(LEGACY_MESSAGES_PATH, post(sse_message))
        .route_layer(middleware::from_fn_with_state(st.auth.clone(), require_auth));

    let mut app = Router::new()
        .route(HEALTH_PATH, get(health))
        .merge(protected)
        .layer(TraceLayer::new_for_http());

    if let Some(cors) = cors_layer(&st.allowed_origins) {
        app = app.layer(cors);
    }

    app.with_state(st)
}

fn cors_layer(origins: &[String]) -> Option<CorsLayer> {
    let origins = origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect::<Vec<_>>();
    if origins.is_empty() {
        return None;
    }
    let session = HeaderName::from_static(SESSION_HEADER);
    Some(
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
            .allow_headers([
                CONTENT_TYPE,
                AUTHORIZATION,
                session.clone(),
                HeaderName::from_static(PROTOCOL_HEADER),
            ])
            .expose_headers([session]),
    )
}

pub async fn serve(addr: SocketAddr, mcp_path: String, st: AppState) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    let local_addr = listener.local_addr()?;
    info!(
        addr = %local_addr,
        path = %mcp_path,
        auth = !st.auth.is_open(),
        "starting MCP HTTP server"
    );

    let hub = st.hub.clone();
    let sweeper = tokio::spawn(sweep_idle_sessions(hub.clone(), st.session_idle));
    let app = router(st, &mcp_path);
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(hub))
        .await
        .context("serve http");
    sweeper.abort();
    served
}

async fn sweep_idle_sessions(hub: SessionHub, max_idle: Duration) {
    let mut tick = tokio::time::interval((max_idle / 2).max(Duration::from_secs(1)));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        hub.sweep_idle(max_idle);
    }
}

async fn shutdown_signal(hub: SessionHub) {
    shutdown_on(tokio::signal::ctrl_c(), hub).await
}

async fn shutdown_on<F>(signal: F, hub: SessionHub)
where
    F: Future<Output = std::io::Result<()>>,
{
    if let Err(e) = signal.await {
        // Without a handler the server runs until killed.
        error!(error = %e, "cannot listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
    // Push streams never end on their own.
    hub.close_all();
}

async fn health(State(st): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "monitoring": st.monitor.is_monitoring(),
        "sessions": st.hub.len(),
    }))
}

async fn mcp_post(State(st): State<AppState>, headers: HeaderMap, body: String) -> Response {
    if let Err(rejection) = validate_origin(&st.allowed_origins, &headers) {
        return rejection.into_response();
    }

    if let Some(v) = header_str(&headers, PROTOCOL_HEADER)
        && v.trim().is_empty()
    {
        return (StatusCode::BAD_REQUEST, "invalid mcp-protocol-version").into_response();
    }

    let msg = match parse_message(&body) {
        Ok(m) => m,
        Err(resp) => return jsonrpc_http_response(resp, None),
    };

    if let JsonRpcMessage::Request(JsonRpcRequest { method, .. }) = &msg
        && method == "initialize"
    {
        let session = st.hub.create(st.new_connection());
        return match session.handle(msg).await {
            Some(r) if r.error.is_none() => jsonrpc_http_response(r, Some(session.id())),
            Some(r) => {
                st.hub.remove(session.id());
                jsonrpc_http_response(r, None)
            }
            None => {
                st.hub.remove(session.id());
                StatusCode::ACCEPTED.into_response()
            }
        };
    }

    let session = match lookup_session(&st.hub, &headers) {
        Ok(s) => s,
        Err(rejection) => return rejection.into_response(),
    };

    match session.handle(msg).await {
        Some(r) => jsonrpc_http_response(r, Some(session.id())),
        None => StatusCode::ACCEPTED.into_response(),
    }
}

/// Server-to-client stream for an existing streamable HTTP session.
async fn mcp_get(State(st): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(rejection) = validate_origin(&st.allowed_origins, &headers) {
        return rejection.into_response();
    }
    let session = match lookup_session(&st.hub, &headers) {
        Ok(s) => s,
        Err(rejection) => return rejection.into_response(),
    };

    let (tx, rx) = mpsc::channel(st.push_capacity);
    let guard = PushGuard::Detach {
        session: session.clone(),
        tx: tx.downgrade(),
    };
    session.attach_push(tx);
    debug!(session_id = %session.id(), "push stream opened");

    Sse::new(push_stream(rx, guard))
        .keep_alive(KeepAlive::default())
        .into_response()
}

async fn mcp_delete(State(st): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(rejection) = validate_origin(&st.allowed_origins, &headers) {
        return rejection.into_response();
    }
    let Some(sid) = header_str(&headers, SESSION_HEADER) else {
        return (StatusCode::BAD_REQUEST, "missing mcp-session-id").into_response();
    };
    if st.hub.remove(sid) {
        StatusCode::ACCEPTED.into_response()
    } else {
        (StatusCode::NOT_FOUND, "unknown mcp-session-id").into_response()
    }
}

/// Legacy HTTP+SSE transport: the stream is the session.
async fn sse_connect(State(st): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(rejection) = validate_origin(&st.allowed_origins, &headers) {
        return rejection.into_response();
    }

    let session = st.hub.create(st.new_connection());
    let (tx, rx) = mpsc::channel(st.push_capacity);
    session.attach_push(tx);

    let endpoint = Event::default()
        .event("endpoint")
        .data(format!("{LEGACY_MESSAGES_PATH}?sessionId={}", session.id()));
    let guard = PushGuard::Remove {
        hub: st.hub.clone(),
        id: session.id().to_string(),
    };

    let events = stream::once(async move { Ok::<_, Infallible>(endpoint) })
        .chain(push_stream(rx, guard));
    Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response()
}

#[derive(Debug, Deserialize)]
struct MessageQuery {
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

async fn sse_message(
    State(st): State<AppState>,
    Query(q): Query<MessageQuery>,
    headers: HeaderMap,
    body: String,
) -> Response {
    if let Err(rejection) = validate_origin(&st.allowed_origins, &headers) {
        return rejection.into_response();
    }
    let Some(sid) = q.session_id.as_deref() else {
        return (StatusCode::BAD_REQUEST, "missing sessionId").into_response();
    };
    let Some(session) = st.hub.get(sid) else {
        return (StatusCode::NOT_FOUND, "unknown sessionId").into_response();
    };

    let msg = match parse_message(&body) {
        Ok(m) => m,
        Err(resp) => {
            let mut rejected = jsonrpc_http_response(resp, None);
            *rejected.status_mut() = StatusCode::BAD_REQUEST;
            return rejected;
        }
    };

    if let Some(resp) = session.handle(msg).await
        && let Err(e) = session.push(resp.into()).await
    {
        warn!(session_id = %sid, error = %e, "could not deliver response over sse");
    }
    StatusCode::ACCEPTED.into_response()
}

/// Runs when a push stream is dropped, whether it ended or the client left.
enum PushGuard {
    /// The session outlives the stream; only this stream's channel goes.
    Detach {
        session: Arc<Session>,
        tx: mpsc::WeakSender<JsonRpcMessage>,
    },
    Remove { hub: SessionHub, id: String },
}

impl Drop for PushGuard {
    fn drop(&mut self) {
        match self {
            PushGuard::Detach { session, tx } => {
                if let Some(tx) = tx.upgrade() {
                    session.detach_push(&tx);
                }
                debug!(session_id = %session.id(), "push stream closed");
            }
            PushGuard::Remove { hub, id } => {
                hub.remove(id);
            }
        }
    }
}

fn push_stream(
    rx: mpsc::Receiver<JsonRpcMessage>,
    guard: PushGuard,
) -> impl Stream<Item = Result<Event, Infallible>> + Send + 'static {
    stream::unfold((rx, guard), |(mut rx, guard)| async move {
        let msg = rx.recv().await?;
        Some((Ok(message_event(&msg)), (rx, guard)))
    })
}

fn message_event(msg: &JsonRpcMessage) -> Event {
    let data = serde_json::to_string(msg).unwrap_or_else(|_| "{}".to_string());
    Event::default().event("message").data(data)
}

fn lookup_session(
    hub: &SessionHub,
    headers: &HeaderMap,
) -> Result<Arc<Session>, (StatusCode, &'static str)> {
    let sid = header_str(headers, SESSION_HEADER)
        .ok_or((StatusCode::BAD_REQUEST, "missing mcp-session-id"))?;
    hub.get(sid)
        .ok_or((StatusCode::NOT_FOUND, "unknown mcp-session-id"))
}

/// With an allow-list the `Origin` must be listed; without one only loopback
/// origins pass. Requests without an `Origin` (non-browser clients) pass.
fn validate_origin(
    allowed: &[String],
    headers: &HeaderMap,
) -> Result<(), (StatusCode, &'static str)> {
    let Some(origin) = header_str(headers, "origin").filter(|s| !s.trim().is_empty()) else {
        return Ok(());
    };

    if !allowed.is_empty() {
        let origin = origin.trim_end_matches('/');
        if allowed.iter().any(|a| a.trim_end_matches('/') == origin) {
            return Ok(());
        }
        return Err((StatusCode::FORBIDDEN, "origin not allowed"));
    }

    let u = url::Url::parse(origin).map_err(|_| (StatusCode::FORBIDDEN, "invalid origin"))?;
    let host = u.host().ok_or((StatusCode::FORBIDDEN, "invalid origin"))?;
    let is_loopback = match host {
        url::Host::Domain(d) => d.eq_ignore_ascii_case("localhost"),
        url::Host::Ipv4(ip) => ip.is_loopback(),
        url::Host::Ipv6(ip) => ip.is_loopback(),
    };
    if !is_loopback {
        return Err((StatusCode::FORBIDDEN, "origin not allowed"));
    }

    Ok(())
}

fn jsonrpc_http_response(resp: JsonRpcResponse, session_id: Option<&str>) -> Response {
    let body = serde_json::to_string(&resp).unwrap_or_else(|_| "{}".to_string());
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "application/json");

    if let Some(sid) = session_id
        && let Ok(v) = HeaderValue::from_str(sid)
    {
        builder = builder.header(SESSION_HEADER, v);
    }

    builder
        .body(axum::body::Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|h| h.to_str().ok())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use anyhow::Context as _;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use droidnotify_core::NotificationRecord;
    use droidnotify_mcp::{
        JsonRpcNotification, McpHandler, McpServerConfig, PROTOCOL_VERSION_LATEST,
    };
    use droidnotify_monitor::{Monitor, MonitorConfig, SnapshotSource, SourceError};
    use http_body_util::BodyExt as _;
    use serde_json::Value;
    use tower::ServiceExt as _;

    use super::*;
    use crate::auth::AuthConfig;
    use crate::tools::NotificationTools;

    struct OneNotification;

    #[async_trait]
    impl SnapshotSource for OneNotification {
        async fn fetch(&self) -> Result<Vec<NotificationRecord>, SourceError> {
            Ok(vec![NotificationRecord {
                id: 7,
                tag: String::new(),
                key: "0|com.example.app|7|null|10123".to_string(),
                group: String::new(),
                package_name: "com.example.app".to_string(),
                title: "Hello".to_string(),
                content: "World".to_string(),
                when: "2024-05-01 10:00:00".to_string(),
            }])
        }
    }

    fn state() -> AppState {
        let monitor = Monitor::new(
            Arc::new(OneNotification),
            MonitorConfig {
                poll_interval: Duration::from_secs(3600),
                event_capacity: 16,
            },
        );
        let hub = SessionHub::new();
        let handler: Arc<dyn McpHandler> =
            Arc::new(NotificationTools::new(monitor.clone(), hub.clone()));
        AppState::new(
            McpServerConfig::default_for_binary("droidnotify-test", "0.0.0"),
            handler,
            hub,
            monitor,
        )
    }

    fn app(st: &AppState) -> Router {
        router(st.clone(), "/mcp")
    }

    fn initialize_body() -> String {
        serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "initialize",
            "params": {
                "protocolVersion": PROTOCOL_VERSION_LATEST,
                "capabilities": {},
                "clientInfo": { "name": "test", "version": "0" }
            }
        })
        .to_string()
    }

    fn post(uri: &str, body: String) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .expect("request")
    }

    fn post_with_session(sid: &str, body: Value) -> Request<Body> {
        let mut req = post("/mcp", body.to_string());
        req.headers_mut()
            .insert(SESSION_HEADER, HeaderValue::from_str(sid).expect("sid"));
        req
    }

    async fn body_json(resp: Response) -> anyhow::Result<Value> {
        let bytes = resp.into_body().collect().await?.to_bytes();
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn initialize(st: &AppState) -> anyhow::Result<String> {
        let resp = app(st).oneshot(post("/mcp", initialize_body())).await?;
        assert_eq!(resp.status(), StatusCode::OK);
        let sid = header_str(resp.headers(), SESSION_HEADER)
            .context("session header")?
            .to_string();
        Ok(sid)
    }

    /// Joined `data:` lines of the first event in `chunk`; keep-alive
    /// comments yield nothing.
    fn sse_data(chunk: &str) -> Option<String> {
        let lines = chunk
            .lines()
            .take_while(|l| !l.is_empty())
            .filter_map(|l| l.strip_prefix("data:"))
            .map(|d| d.strip_prefix(' ').unwrap_or(d))
            .collect::<Vec<_>>();
        (!lines.is_empty()).then(|| lines.join("\n"))
    }

    /// Next SSE `data` payload from a streaming body.
    async fn next_data(body: &mut Body) -> anyhow::Result<String> {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(2), body.frame())
                .await?
                .context("stream ended")??;
            if let Ok(data) = frame.into_data() {
                let text = String::from_utf8(data.to_vec())?;
                if let Some(ev) = sse_data(&text) {
                    return Ok(ev);
                }
            }
        }
    }

    #[tokio::test]
    async fn streamable_http_session_lifecycle() -> anyhow::Result<()> {
        let st = state();
        let sid = initialize(&st).await?;
        assert_eq!(st.hub.len(), 1);

        let resp = app(&st)
            .oneshot(post_with_session(
                &sid,
                serde_json::json!({ "jsonrpc": "2.0", "method": "notifications/initialized" }),
            ))
            .await?;
        assert_eq!(resp.status(), StatusCode::ACCEPTED);

        let resp = app(&st)
            .oneshot(post_with_session(
                &sid,
                serde_json::json!({ "jsonrpc": "2.0", "id": 2, "method": "tools/list" }),
            ))
            .await?;
        assert_eq!(resp.status(), StatusCode::OK);
        let v = body_json(resp).await?;
        assert_eq!(v["result"]["tools"].as_array().map(Vec::len), Some(3));

        let delete = Request::builder()
            .method(Method::DELETE)
            .uri("/mcp")
            .header(SESSION_HEADER, &sid)
            .body(Body::empty())?;
        assert_eq!(app(&st).oneshot(delete).await?.status(), StatusCode::ACCEPTED);
        assert!(st.hub.is_empty());

        let resp = app(&st)
            .oneshot(post_with_session(
                &sid,
                serde_json::json!({ "jsonrpc": "2.0", "id": 3, "method": "ping" }),
            ))
            .await?;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        Ok(())
    }

    #[tokio::test]
    async fn requests_without_session_are_rejected() -> anyhow::Result<()> {
        let st = state();
        let resp = app(&st)
            .oneshot(post(
                "/mcp",
                serde_json::json!({ "jsonrpc": "2.0", "id": 1, "method": "tools/list" }).to_string(),
            ))
            .await?;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        Ok(())
    }

    #[tokio::test]
    async fn failed_initialize_does_not_leave_a_session() -> anyhow::Result<()> {
        let st = state();
        let body = serde_json::json!({ "jsonrpc": "2.0", "id": 1, "method": "initialize" });
        let resp = app(&st).oneshot(post("/mcp", body.to_string())).await?;
        assert!(resp.headers().get(SESSION_HEADER).is_none());
        let v = body_json(resp).await?;
        assert_eq!(v["error"]["code"], -32602);
        assert!(st.hub.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn malformed_body_is_a_parse_error() -> anyhow::Result<()> {
        let st = state();
        let resp = app(&st).oneshot(post("/mcp", "{not json".to_string())).await?;
        let v = body_json(resp).await?;
        assert_eq!(v["error"]["code"], -32700);
        Ok(())
    }

    #[tokio::test]
    async fn tool_call_over_streamable_http() -> anyhow::Result<()> {
        let st = state();
        let sid = initialize(&st).await?;
        let resp = app(&st)
            .oneshot(post_with_session(
                &sid,
                serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": 2,
                    "method": "tools/call",
                    "params": { "name": "getCurrentNotifications", "arguments": { "limit": 5 } }
                }),
            ))
            .await?;
        let v = body_json(resp).await?;
        assert_eq!(v["result"]["isError"], false);
        assert_eq!(v["result"]["structuredContent"]["count"], 1);
        assert_eq!(
            v["result"]["structuredContent"]["notifications"][0]["packageName"],
            "com.example.app"
        );
        Ok(())
    }

    #[tokio::test]
    async fn get_stream_receives_broadcasts_and_detaches_on_close() -> anyhow::Result<()> {
        let st = state();
        let sid = initialize(&st).await?;

        let get = Request::builder()
            .uri("/mcp")
            .header(SESSION_HEADER, &sid)
            .body(Body::empty())?;
        let resp = app(&st).oneshot(get).await?;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            header_str(resp.headers(), "content-type"),
            Some("text/event-stream")
        );
        let mut body = resp.into_body();

        let note = JsonRpcNotification::new("notifications/test", None);
        assert_eq!(st.hub.broadcast(&note.into()), 1);
        let data = next_data(&mut body).await?;
        let v: Value = serde_json::from_str(&data)?;
        assert_eq!(v["method"], "notifications/test");

        drop(body);
        let session = st.hub.get(&sid).context("session survives")?;
        assert!(!session.has_push());
        Ok(())
    }

    #[tokio::test]
    async fn legacy_sse_round_trip() -> anyhow::Result<()> {
        let st = state();
        let resp = app(&st)
            .oneshot(Request::builder().uri("/sse").body(Body::empty())?)
            .await?;
        assert_eq!(resp.status(), StatusCode::OK);
        let mut body = resp.into_body();

        let endpoint = next_data(&mut body).await?;
        assert!(endpoint.starts_with("/messages?sessionId="), "{endpoint}");
        assert_eq!(st.hub.len(), 1);

        let resp = app(&st).oneshot(post(&endpoint, initialize_body())).await?;
        assert_eq!(resp.status(), StatusCode::ACCEPTED);

        let data = next_data(&mut body).await?;
        let v: Value = serde_json::from_str(&data)?;
        assert_eq!(v["id"], 1);
        assert_eq!(v["result"]["serverInfo"]["name"], "droidnotify-test");

        drop(body);
        assert!(st.hub.is_empty(), "closing the stream ends the session");
        Ok(())
    }

    #[tokio::test]
    async fn legacy_messages_require_known_session() -> anyhow::Result<()> {
        let st = state();
        let resp = app(&st).oneshot(post("/messages", initialize_body())).await?;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = app(&st)
            .oneshot(post("/messages?sessionId=nope", initialize_body()))
            .await?;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        Ok(())
    }

    #[tokio::test]
    async fn auth_guards_transports_but_not_health() -> anyhow::Result<()> {
        let st = state().with_auth(AuthConfig {
            bearer_token: Some("T".to_string()),
            basic: None,
        });

        let resp = app(&st).oneshot(post("/mcp", initialize_body())).await?;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let v = body_json(resp).await?;
        assert_eq!(v["code"], "unauthorized");

        let resp = app(&st)
            .oneshot(Request::builder().uri("/sse").body(Body::empty())?)
            .await?;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert!(st.hub.is_empty());

        let mut req = post("/mcp", initialize_body());
        req.headers_mut()
            .insert(AUTHORIZATION, HeaderValue::from_static("Bearer T"));
        assert_eq!(app(&st).oneshot(req).await?.status(), StatusCode::OK);

        let resp = app(&st)
            .oneshot(Request::builder().uri("/health").body(Body::empty())?)
            .await?;
        assert_eq!(resp.status(), StatusCode::OK);
        let v = body_json(resp).await?;
        assert_eq!(v["status"], "ok");
        assert_eq!(v["monitoring"], false);
        assert_eq!(v["sessions"], 1);

        let resp = app(&st)
            .oneshot(Request::builder().uri("/sse?token=T").body(Body::empty())?)
            .await?;
        assert_eq!(resp.status(), StatusCode::OK);
        drop(resp);
        Ok(())
    }

    #[tokio::test]
    async fn failed_signal_listener_never_triggers_shutdown() -> anyhow::Result<()> {
        let hub = SessionHub::new();
        let failed = async { Err::<(), _>(std::io::Error::other("no signal handler")) };
        let waited =
            tokio::time::timeout(Duration::from_millis(200), shutdown_on(failed, hub.clone())).await;
        assert!(waited.is_err(), "shutdown must wait, not fire");

        shutdown_on(async { Ok::<(), std::io::Error>(()) }, hub).await;
        Ok(())
    }

    #[test]
    fn origin_checks() {
        let mut h = HeaderMap::new();
        assert!(validate_origin(&[], &h).is_ok());

        for ok in ["http://localhost:3000", "http://127.0.0.1", "http://[::1]:8080"] {
            h.insert("origin", HeaderValue::from_static(ok));
            assert!(validate_origin(&[], &h).is_ok(), "{ok}");
        }

        h.insert("origin", HeaderValue::from_static("https://evil.example"));
        assert!(validate_origin(&[], &h).is_err());

        let allowed = vec!["https://app.example".to_string()];
        h.insert("origin", HeaderValue::from_static("https://app.example"));
        assert!(validate_origin(&allowed, &h).is_ok());
        h.insert("origin", HeaderValue::from_static("http://localhost:3000"));
        assert!(validate_origin(&allowed, &h).is_err());
    }

    #[tokio::test]
    async fn foreign_origin_is_forbidden() -> anyhow::Result<()> {
        let st = state();
        let mut req = post("/mcp", initialize_body());
        req.headers_mut()
            .insert("origin", HeaderValue::from_static("https://evil.example"));
        assert_eq!(app(&st).oneshot(req).await?.status(), StatusCode::FORBIDDEN);
        Ok(())
    }
}

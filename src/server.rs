//! Relay server: `/proxy`, `/connect` and `/stats`.
//!
//! `/proxy` hands out a sid bound to a destination. `/connect` upgrades to
//! a WebSocket and attaches it to the sid's session, dialing the
//! destination the first time. The session's [`Endpoint`] then relays
//! between the WebSocket and the downstream TCP connection, and survives
//! the WebSocket going away until the browser resumes it or the
//! expiration sweep closes it.
//!
//! Rust guideline compliant 2026-02

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::counters::{
    EndpointStats, ExpireCounters, ExpireStats, PoolStats, RequestCounters, RequestStats,
    SessionCounters, SessionStats, TransportStats,
};
use crate::endpoint::{Endpoint, EndpointContext};
use crate::error::{Error, Result};
use crate::filter::Filter;
use crate::handle::Eviction;
use crate::session::{join_host_port, short_sid, ExpirationPolicy, Session, SessionTable};
use crate::transport::{FrameSink, FrameSource, Transport, WireMessage};

/// Everything the handlers share.
#[derive(Debug)]
pub struct ServerState {
    sessions: Arc<SessionTable>,
    filter: Arc<dyn Filter>,
    allowed_origins: Vec<String>,
    context: EndpointContext,
    resolution_timeout: Duration,
    expiration: ExpirationPolicy,
    session_counters: Arc<SessionCounters>,
    expire_counters: Arc<ExpireCounters>,
    requests: RequestCounters,
}

impl ServerState {
    /// State for `config.server`, filtering with its allow/deny globs.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] if a glob does not compile.
    pub fn new(config: &Config) -> Result<Self> {
        let filter = config.server.filter()?;
        Ok(Self::with_filter(config, Arc::new(filter)))
    }

    /// State for `config.server` with a caller-supplied filter.
    pub fn with_filter(config: &Config, filter: Arc<dyn Filter>) -> Self {
        let session_counters = Arc::new(SessionCounters::default());
        Self {
            sessions: Arc::new(SessionTable::new(
                config.server.ticket_ttl,
                Arc::clone(&session_counters),
            )),
            filter,
            allowed_origins: config.server.allowed_origins.clone(),
            context: config.endpoint_context(config.server.timeouts),
            resolution_timeout: config.server.resolution_timeout,
            expiration: config.server.expiration,
            session_counters,
            expire_counters: Arc::new(ExpireCounters::default()),
            requests: RequestCounters::default(),
        }
    }

    /// The session table.
    pub fn sessions(&self) -> &Arc<SessionTable> {
        &self.sessions
    }

    /// Snapshot of every counter group.
    pub fn stats(&self) -> ServerStats {
        ServerStats {
            sessions: self.sessions.len(),
            session_events: self.session_counters.snapshot(),
            requests: self.requests.snapshot(),
            endpoints: self.context.counters.snapshot(),
            transports: self.context.transport_counters.snapshot(),
            pool: self.context.pool.stats(),
            expire: self.expire_counters.snapshot(),
        }
    }

    fn origin_allowed(&self, origin: &str) -> bool {
        self.allowed_origins
            .iter()
            .any(|prefix| origin.starts_with(prefix.as_str()))
    }
}

/// `GET /stats` body.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStats {
    /// Sessions currently in the table, live or orphaned.
    pub sessions: usize,
    /// Session table events.
    pub session_events: SessionStats,
    /// Handshake request failures.
    pub requests: RequestStats,
    /// Endpoint task activity.
    pub endpoints: EndpointStats,
    /// Transport handle transitions.
    pub transports: TransportStats,
    /// Buffer pool usage.
    pub pool: PoolStats,
    /// Expiration sweeps.
    pub expire: ExpireStats,
}

/// Routes of the relay.
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/proxy", get(proxy))
        .route("/connect", get(connect))
        .route("/stats", get(stats))
        .with_state(state)
}

/// Serve on `listener` until `cancel` fires, sweeping orphans meanwhile.
pub async fn serve(
    listener: TcpListener,
    state: Arc<ServerState>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let sweeper = tokio::spawn(state.expiration.run(
        Arc::clone(&state.sessions),
        Arc::clone(&state.expire_counters),
        cancel.clone(),
    ));

    log::info!("[Server] listening on {}", listener.local_addr()?);
    let app = router(state).into_make_service_with_connect_info::<SocketAddr>();
    let shutdown = cancel.clone();
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await;

    cancel.cancel();
    sweeper.abort();
    log::info!("[Server] stopped");
    Ok(result?)
}

// =============================================================================
// Handlers
// =============================================================================

#[derive(Debug, Deserialize)]
struct ProxyParams {
    host: Option<String>,
    port: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ConnectParams {
    sid: Option<String>,
    pos: Option<String>,
    ack: Option<String>,
}

fn reject(status: StatusCode, message: &str) -> Response {
    (status, format!("{message}\n")).into_response()
}

fn origin(headers: &HeaderMap) -> &str {
    headers
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
}

/// Missing or empty means zero.
fn parse_offset(value: Option<&str>) -> Option<u32> {
    match value {
        None | Some("") => Some(0),
        Some(value) => value.parse().ok(),
    }
}

async fn proxy(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Query(params): Query<ProxyParams>,
) -> Response {
    let mut cors = HeaderMap::new();
    let origin = origin(&headers);
    if !origin.is_empty() {
        if state.origin_allowed(origin) {
            if let Ok(value) = HeaderValue::from_str(origin) {
                cors.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
                cors.insert(header::VARY, HeaderValue::from_static("Origin"));
                cors.insert(
                    header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
                    HeaderValue::from_static("true"),
                );
            }
        } else {
            state.requests.bad_origin.increment();
        }
    }

    let Some(port) = params
        .port
        .as_deref()
        .and_then(|port| port.parse::<u16>().ok())
        .filter(|port| *port != 0)
    else {
        state.requests.proxy_invalid_port.increment();
        return (cors, reject(StatusCode::BAD_REQUEST, "invalid port")).into_response();
    };
    let host = params.host.unwrap_or_default();
    if host.is_empty() {
        state.requests.proxy_invalid_host.increment();
        return (cors, reject(StatusCode::BAD_REQUEST, "invalid host")).into_response();
    }
    if !state.filter.allows(&host, port) {
        state.requests.proxy_denied.increment();
        log::info!("[Server] /proxy to {} denied", join_host_port(&host, port));
        return (cors, reject(StatusCode::UNAUTHORIZED, "destination not allowed"))
            .into_response();
    }

    let sid = state.sessions.issue(&host, port);
    log::debug!(
        "[Server] issued {} for {}",
        short_sid(&sid),
        join_host_port(&host, port)
    );
    (cors, format!("{sid}\n")).into_response()
}

/// A `/connect` that passed every pre-upgrade check.
#[derive(Debug)]
struct Admission {
    sid: String,
    host: String,
    port: u16,
    pos: u32,
    ack: u32,
    peer: SocketAddr,
    existing: Option<Arc<Session>>,
    logid: String,
}

async fn connect(
    State(state): State<Arc<ServerState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(params): Query<ConnectParams>,
    upgrade: WebSocketUpgrade,
) -> Response {
    if !state.allowed_origins.is_empty() {
        let origin = origin(&headers);
        if origin.is_empty() || !state.origin_allowed(origin) {
            state.requests.bad_origin.increment();
            log::info!("[Server] /connect from {} with origin {:?} refused", peer, origin);
            return reject(StatusCode::FORBIDDEN, "origin not allowed");
        }
    }

    let Some(ack) = parse_offset(params.ack.as_deref()) else {
        state.requests.connect_invalid_ack.increment();
        return reject(StatusCode::BAD_REQUEST, "invalid ack");
    };
    let Some(pos) = parse_offset(params.pos.as_deref()) else {
        state.requests.connect_invalid_pos.increment();
        return reject(StatusCode::BAD_REQUEST, "invalid pos");
    };
    let sid = params.sid.unwrap_or_default();
    if sid.is_empty() {
        state.requests.connect_invalid_sid.increment();
        return reject(StatusCode::BAD_REQUEST, "invalid sid");
    }

    let existing = state.sessions.get(&sid);
    let (host, port) = match &existing {
        Some(session) => (session.host().to_string(), session.port()),
        None if pos != 0 || ack != 0 => {
            state.requests.resume_unknown_sid.increment();
            log::info!(
                "[Server] {} from {} resumes an unknown session",
                short_sid(&sid),
                peer
            );
            return reject(StatusCode::GONE, "unknown session");
        }
        None => match state.sessions.ticket(&sid) {
            Some(ticket) => (ticket.host, ticket.port),
            None => {
                state.requests.connect_invalid_sid.increment();
                return reject(StatusCode::BAD_REQUEST, "invalid sid");
            }
        },
    };
    if !state.filter.allows(&host, port) {
        state.requests.connect_denied.increment();
        return reject(StatusCode::UNAUTHORIZED, "destination not allowed");
    }

    let logid = format!(
        "[SID:{}][IP:{}][DEST:{}]",
        short_sid(&sid),
        peer,
        join_host_port(&host, port)
    );
    let admission = Admission {
        sid,
        host,
        port,
        pos,
        ack,
        peer,
        existing,
        logid,
    };
    upgrade.on_upgrade(move |socket| serve_connection(state, socket, admission))
}

async fn stats(State(state): State<Arc<ServerState>>) -> Json<ServerStats> {
    Json(state.stats())
}

// =============================================================================
// Connection
// =============================================================================

async fn serve_connection(state: Arc<ServerState>, socket: WebSocket, admission: Admission) {
    let Admission {
        sid,
        host,
        port,
        pos,
        ack,
        peer,
        existing,
        logid,
    } = admission;

    let (sink, stream) = socket.split();
    let timeouts = state.context.timeouts;
    let transport = Arc::new(Transport::new(
        peer.to_string(),
        Box::new(AxumSink(sink)),
        Box::new(AxumSource(stream)),
        timeouts.ping_timeout,
        timeouts.write_timeout,
    ));

    let resuming = existing.is_some();
    let session = match existing {
        Some(session) => session,
        None => match open_session(&state, &sid, &host, port, &logid).await {
            Some(session) => session,
            None => {
                transport.shutdown().await;
                return;
            }
        },
    };

    let attachment = match session.endpoint().attach(Arc::clone(&transport), pos, ack) {
        Ok(attachment) => attachment,
        Err(err) => {
            log::warn!("{} attach failed: {}", logid, err);
            transport.shutdown().await;
            return;
        }
    };
    if resuming {
        state.sessions.resumed();
    }
    log::info!(
        "{} attached transport #{} pos={:06x} ack={:06x}",
        logid,
        transport.id(),
        pos,
        ack
    );

    match attachment.wait().await {
        Eviction::Closed(err) => {
            state.sessions.delete(&sid);
            log::info!("{} session closed: {}", logid, err);
        }
        Eviction::Replaced => {
            state.sessions.orphan(&sid);
            log::info!("{} transport replaced", logid);
        }
        Eviction::Failed(err) => {
            state.sessions.orphan(&sid);
            log::info!("{} orphaned: {}", logid, err);
        }
    }
    transport.shutdown().await;
}

/// Dial the destination and register a new session relaying to it.
///
/// Returns `None` if the dial failed or another request created the session
/// first.
async fn open_session(
    state: &Arc<ServerState>,
    sid: &str,
    host: &str,
    port: u16,
    logid: &str,
) -> Option<Arc<Session>> {
    let dialed = tokio::time::timeout(state.resolution_timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_elapsed| {
            Error::Transport(format!("dial timed out after {:?}", state.resolution_timeout))
        })
        .and_then(|dialed| dialed.map_err(|e| Error::Transport(format!("dial: {e}"))));
    let downstream = match dialed {
        Ok(stream) => stream,
        Err(err) => {
            state.requests.dial_failed.increment();
            log::warn!("{} {}", logid, err);
            return None;
        }
    };
    if let Err(e) = downstream.set_nodelay(true) {
        log::debug!("{} set_nodelay: {}", logid, e);
    }

    let endpoint = Endpoint::new(logid, &state.context);
    let Some(session) = state
        .sessions
        .create(Session::new(sid, host, port, endpoint.clone()))
    else {
        state.requests.create_raced.increment();
        log::info!("{} lost the race to create the session", logid);
        return None;
    };
    SessionTable::supervise(&state.sessions, &session);
    endpoint.start();
    spawn_downstream(endpoint, downstream, state.context.timeouts.conn_write_timeout);
    log::info!("{} session created", logid);
    Some(session)
}

/// Relay between the endpoint and the downstream connection until either
/// ends, then close the endpoint.
fn spawn_downstream(endpoint: Endpoint, downstream: TcpStream, drain_limit: Duration) {
    tokio::spawn(async move {
        let (mut reader, mut writer) = downstream.into_split();
        let err = match endpoint.relay(&mut reader, &mut writer, drain_limit).await {
            Ok(sent) => Error::Closed(format!("downstream EOF after {sent} bytes")),
            Err(err) => err,
        };
        endpoint.close(err);
    });
}

// =============================================================================
// axum WebSocket adapters
// =============================================================================

#[derive(Debug)]
struct AxumSink(SplitSink<WebSocket, Message>);

#[async_trait]
impl FrameSink for AxumSink {
    async fn send(&mut self, message: WireMessage) -> Result<()> {
        let message = match message {
            WireMessage::Data(data) => Message::Binary(data.into()),
            WireMessage::Text(text) => Message::Text(text.into()),
            WireMessage::Ping(data) => Message::Ping(data.into()),
            WireMessage::Pong(data) => Message::Pong(data.into()),
            WireMessage::Close => Message::Close(None),
        };
        self.0.send(message).await.map_err(Error::transport)
    }

    async fn close(&mut self) -> Result<()> {
        self.0.close().await.map_err(Error::transport)
    }
}

#[derive(Debug)]
struct AxumSource(SplitStream<WebSocket>);

#[async_trait]
impl FrameSource for AxumSource {
    async fn recv(&mut self) -> Option<Result<WireMessage>> {
        let message = match self.0.next().await? {
            Ok(message) => message,
            Err(e) => return Some(Err(Error::Transport(format!("read error: {e}")))),
        };
        Some(Ok(match message {
            Message::Binary(data) => WireMessage::Data(data.to_vec()),
            Message::Text(text) => WireMessage::Text(text.to_string()),
            Message::Ping(data) => WireMessage::Ping(data.to_vec()),
            Message::Pong(data) => WireMessage::Pong(data.to_vec()),
            Message::Close(_) => WireMessage::Close,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws;

    struct TestServer {
        base: String,
        state: Arc<ServerState>,
        cancel: CancellationToken,
    }

    impl Drop for TestServer {
        fn drop(&mut self) {
            self.cancel.cancel();
        }
    }

    async fn start(config: Config) -> TestServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let state = Arc::new(ServerState::new(&config).unwrap());
        let cancel = CancellationToken::new();
        tokio::spawn(serve(listener, Arc::clone(&state), cancel.clone()));
        TestServer {
            base,
            state,
            cancel,
        }
    }

    fn config_allowing(pattern: &str) -> Config {
        let mut config = Config::default();
        config.server.allow = vec![pattern.to_string()];
        config
    }

    async fn get(url: &str, origin: Option<&str>) -> reqwest::Response {
        let mut request = reqwest::Client::new().get(url);
        if let Some(origin) = origin {
            request = request.header("Origin", origin);
        }
        request.send().await.unwrap()
    }

    // ========== Offset Parsing Tests ==========

    #[test]
    fn test_parse_offset() {
        assert_eq!(parse_offset(None), Some(0));
        assert_eq!(parse_offset(Some("")), Some(0));
        assert_eq!(parse_offset(Some("16777215")), Some(0x00ff_ffff));
        assert_eq!(parse_offset(Some("-1")), None);
        assert_eq!(parse_offset(Some("abc")), None);
        assert_eq!(parse_offset(Some("4294967296")), None);
    }

    // ========== /proxy Tests ==========

    #[tokio::test]
    async fn test_proxy_issues_sid_with_cors() {
        let server = start(Config::default()).await;
        let response = get(
            &format!("{}/proxy?host=localhost&port=22", server.base),
            Some("chrome-extension://abc"),
        )
        .await;
        assert_eq!(response.status(), 200);
        assert_eq!(
            response.headers()["access-control-allow-origin"],
            "chrome-extension://abc"
        );
        assert_eq!(
            response.headers()["access-control-allow-credentials"],
            "true"
        );

        let body = response.text().await.unwrap();
        assert!(body.ends_with('\n'));
        let sid = body.trim();
        let ticket = server.state.sessions().ticket(sid).unwrap();
        assert_eq!((ticket.host.as_str(), ticket.port), ("localhost", 22));
    }

    #[tokio::test]
    async fn test_proxy_foreign_origin_gets_no_cors() {
        let server = start(Config::default()).await;
        let response = get(
            &format!("{}/proxy?host=localhost&port=22", server.base),
            Some("https://evil.example"),
        )
        .await;
        assert_eq!(response.status(), 200);
        assert!(response
            .headers()
            .get("access-control-allow-origin")
            .is_none());
        assert_eq!(server.state.stats().requests.bad_origin, 1);
    }

    #[tokio::test]
    async fn test_proxy_rejections() {
        let server = start(Config::default()).await;
        let cases = [
            ("host=localhost", 400),
            ("host=localhost&port=ssh", 400),
            ("host=localhost&port=70000", 400),
            ("port=22", 400),
            ("host=example.com&port=22", 401),
            ("host=localhost&port=2222", 401),
        ];
        for (query, expected) in cases {
            let response = get(&format!("{}/proxy?{query}", server.base), None).await;
            assert_eq!(response.status(), expected, "{query}");
        }

        let requests = server.state.stats().requests;
        assert_eq!(requests.proxy_invalid_port, 3);
        assert_eq!(requests.proxy_invalid_host, 1);
        assert_eq!(requests.proxy_denied, 2);
    }

    // ========== /connect Tests ==========

    async fn connect_status(url: &str, origin: &str) -> u16 {
        match ws::connect(&ws::http_to_ws_scheme(url), &[("Origin", origin)]).await {
            Ok(_) => 101,
            Err(Error::Rejected { status, .. }) => status,
            Err(other) => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_connect_rejections() {
        let server = start(Config::default()).await;
        let base = &server.base;

        assert_eq!(
            connect_status(&format!("{base}/connect?sid=nope"), "chrome://x").await,
            400
        );
        assert_eq!(
            connect_status(&format!("{base}/connect?sid=nope&pos=5&ack=0"), "chrome://x").await,
            410
        );
        assert_eq!(
            connect_status(&format!("{base}/connect?sid=nope&ack=x"), "chrome://x").await,
            400
        );

        let requests = server.state.stats().requests;
        assert_eq!(requests.connect_invalid_sid, 1);
        assert_eq!(requests.resume_unknown_sid, 1);
        assert_eq!(requests.connect_invalid_ack, 1);
    }

    #[tokio::test]
    async fn test_denied_resume_is_not_counted() {
        let server = start(config_allowing("127.0.0.1:*")).await;
        let sessions = server.state.sessions();
        sessions
            .create(Session::new(
                "held",
                "10.0.0.1",
                22,
                Endpoint::new("held", &server.state.context),
            ))
            .unwrap();

        let url = format!("{}/connect?sid=held&pos=3&ack=4", server.base);
        assert_eq!(connect_status(&url, "chrome://x").await, 401);

        let stats = server.state.stats();
        assert_eq!(stats.requests.connect_denied, 1);
        assert_eq!(stats.session_events.resumed, 0);
    }

    #[tokio::test]
    async fn test_connect_checks_origin() {
        let server = start(Config::default()).await;
        let url = format!("{}/connect?sid=whatever", server.base);
        let err = ws::connect(&ws::http_to_ws_scheme(&url), &[("Origin", "https://evil.example")])
            .await
            .unwrap_err();
        assert!(!err.is_fatal(), "403 is not a fatal status: {err:?}");
        assert_eq!(server.state.stats().requests.bad_origin, 1);
    }

    #[tokio::test]
    async fn test_connect_dial_failure_counts() {
        // Grab a free port and release it so nothing listens there.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let server = start(config_allowing("127.0.0.1:*")).await;
        let sid = server.state.sessions().issue("127.0.0.1", port);

        let url = format!("{}/connect?sid={sid}", server.base);
        let (_writer, mut reader) =
            ws::connect(&ws::http_to_ws_scheme(&url), &[("Origin", "chrome://x")])
                .await
                .unwrap();
        // The server closes the socket without ever sending a frame.
        loop {
            match reader.recv().await {
                None | Some(Err(_)) | Some(Ok(WireMessage::Close)) => break,
                Some(Ok(_)) => {}
            }
        }
        assert_eq!(server.state.stats().requests.dial_failed, 1);
        assert!(server.state.sessions().is_empty());
    }

    // ========== /stats Tests ==========

    #[tokio::test]
    async fn test_stats_json() {
        let server = start(Config::default()).await;
        get(&format!("{}/proxy?host=localhost", server.base), None).await;

        let stats: serde_json::Value = get(&format!("{}/stats", server.base), None)
            .await
            .json()
            .await
            .unwrap();
        assert_eq!(stats["sessions"], 0);
        assert_eq!(stats["requests"]["proxy_invalid_port"], 1);
        assert!(stats["pool"]["gets"].is_number());
        assert!(stats["expire"]["runs"].is_number());
    }
}

//! Upgrade gate
//!
//! Entry point for every accepted TCP stream. The stream is served over
//! HTTP/1.1 by hyper: plain requests go to the static file server, upgrade
//! requests are only accepted on [`SOCKET_PATH`]. An upgrade on any other path
//! ends the connection without a response. Accepted upgrades get a
//! [`ServerConnection`] record in the registry and are then handed to the
//! [`ConnectionHandler`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{
    HeaderName, HeaderValue, InvalidHeaderValue, CONNECTION, SEC_WEBSOCKET_ACCEPT,
    SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_VERSION, UPGRADE,
};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;

use super::handler::ConnectionHandler;
use super::registry::{ConnectionRegistry, ServerConnection};
use super::static_files::{ResponseBody, StaticFiles};
use crate::endpoint::SOCKET_PATH;
use crate::logger::{ChildFactory, Logger};

/// WebSocket protocol version accepted by the handshake
pub const WEBSOCKET_VERSION: &str = "13";

/// Time a client gets to send a complete request head
pub const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Reasons an upgrade request on the socket path is refused
#[derive(Debug, Error, PartialEq, Eq)]
pub enum UpgradeError {
    #[error("Upgrade method must be GET, got {0}")]
    InvalidMethod(Method),

    #[error("Unsupported upgrade protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("Unsupported WebSocket version: {0}")]
    UnsupportedVersion(String),

    #[error("Missing Sec-WebSocket-Key header")]
    MissingKey,
}

/// Reasons a connection is ended without a response
#[derive(Debug, Error)]
pub enum GateError {
    #[error("Upgrade rejected for {0}")]
    PathRejected(String),

    #[error("Invalid accept key: {0}")]
    InvalidAcceptKey(#[from] InvalidHeaderValue),
}

/// Whether `req` asks to switch protocols
pub fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let connection_upgrade = req
        .headers()
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    connection_upgrade && req.headers().contains_key(UPGRADE)
}

/// Check an upgrade request, returning the `Sec-WebSocket-Accept` value
pub fn validate_upgrade<B>(req: &Request<B>) -> Result<String, UpgradeError> {
    if req.method() != Method::GET {
        return Err(UpgradeError::InvalidMethod(req.method().clone()));
    }

    let protocol = header_str(req, UPGRADE);
    if !protocol.eq_ignore_ascii_case("websocket") {
        return Err(UpgradeError::UnsupportedProtocol(protocol.to_string()));
    }

    let version = header_str(req, SEC_WEBSOCKET_VERSION);
    if version != WEBSOCKET_VERSION {
        return Err(UpgradeError::UnsupportedVersion(version.to_string()));
    }

    let key = req
        .headers()
        .get(SEC_WEBSOCKET_KEY)
        .filter(|key| !key.is_empty())
        .ok_or(UpgradeError::MissingKey)?;
    Ok(derive_accept_key(key.as_bytes()))
}

fn header_str<B>(req: &Request<B>, name: HeaderName) -> &str {
    req.headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
}

fn text_response(status: StatusCode, text: impl Into<String>) -> Response<ResponseBody> {
    let body = Full::new(Bytes::from(text.into()))
        .map_err(|never| match never {})
        .boxed_unsync();
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
}

/// Routes requests arriving on accepted streams
#[derive(Debug, Clone)]
pub struct UpgradeGate {
    registry: ConnectionRegistry,
    handler: ConnectionHandler,
    request_loggers: ChildFactory,
    socket_loggers: ChildFactory,
    static_files: Option<Arc<StaticFiles>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl UpgradeGate {
    /// Create a gate registering upgraded sockets in `registry`
    ///
    /// Open connections wind down once `shutdown_tx` fires.
    pub fn new(
        registry: ConnectionRegistry,
        logger: &Logger,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        Self {
            handler: ConnectionHandler::new(registry.clone(), logger.clone()),
            registry,
            request_loggers: ChildFactory::new("request", logger),
            socket_loggers: ChildFactory::new("socket", logger),
            static_files: None,
            shutdown_tx,
        }
    }

    /// Serve plain HTTP requests from a static file directory
    pub fn with_static_files(mut self, static_files: Option<StaticFiles>) -> Self {
        self.static_files = static_files.map(Arc::new);
        self
    }

    /// Registry upgraded sockets are recorded in
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Serve one accepted stream until it closes, is upgraded or the server
    /// shuts down
    pub async fn serve_connection<S>(&self, stream: S) -> hyper::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let gate = self.clone();
        let service = service_fn(move |req| {
            let gate = gate.clone();
            async move { gate.route(req).await }
        });

        let conn = http1::Builder::new()
            .timer(TokioTimer::new())
            .header_read_timeout(HEADER_READ_TIMEOUT)
            .serve_connection(TokioIo::new(stream), service)
            .with_upgrades();
        tokio::pin!(conn);

        let mut shutting_down = false;
        loop {
            tokio::select! {
                result = conn.as_mut() => break result,
                _ = shutdown_rx.recv(), if !shutting_down => {
                    shutting_down = true;
                    conn.as_mut().graceful_shutdown();
                }
            }
        }
    }

    async fn route(&self, req: Request<Incoming>) -> Result<Response<ResponseBody>, GateError> {
        let logger = self.request_loggers.create();

        if is_upgrade_request(&req) {
            logger.debug(format!("UPGRADE {}", req.uri()));
            return self.upgrade(req, &logger);
        }

        let started = Instant::now();
        let method = req.method().clone();
        let uri = req.uri().clone();
        logger.debug(format!("{} {}", method, uri));

        let response = match &self.static_files {
            Some(static_files) => static_files.respond(req).await,
            None => text_response(StatusCode::NOT_FOUND, "Not Found"),
        };

        let status = response.status();
        let message = format!(
            "{} {}: {} ({}ms)",
            method,
            uri,
            status.as_u16(),
            started.elapsed().as_millis()
        );
        if status.is_client_error() || status.is_server_error() {
            logger.warn(message);
        } else {
            logger.info(message);
        }
        Ok(response)
    }

    fn upgrade(
        &self,
        mut req: Request<Incoming>,
        logger: &Logger,
    ) -> Result<Response<ResponseBody>, GateError> {
        let target = req
            .uri()
            .path_and_query()
            .map(|target| target.as_str().to_string())
            .unwrap_or_default();
        if target != SOCKET_PATH {
            logger.warn("Path rejected");
            return Err(GateError::PathRejected(target));
        }

        let accept_key = match validate_upgrade(&req) {
            Ok(accept_key) => accept_key,
            Err(e) => {
                logger.warn(format!("Upgrade refused: {}", e));
                let mut response = text_response(StatusCode::BAD_REQUEST, e.to_string());
                response
                    .headers_mut()
                    .insert(CONNECTION, HeaderValue::from_static("close"));
                return Ok(response);
            }
        };
        let accept_key = HeaderValue::from_str(&accept_key)?;

        logger.debug("Handling upgrade");
        let gate = self.clone();
        let logger = logger.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            match hyper::upgrade::on(&mut req).await {
                Ok(upgraded) => {
                    let io = TokioIo::new(upgraded);
                    let ws = WebSocketStream::from_raw_socket(io, Role::Server, None).await;
                    gate.accept(ws, &logger, shutdown_rx).await;
                }
                Err(e) => logger.warn(format!("Upgrade failed: {}", e)),
            }
        });

        let mut response = text_response(StatusCode::SWITCHING_PROTOCOLS, "");
        let headers = response.headers_mut();
        headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
        headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(SEC_WEBSOCKET_ACCEPT, accept_key);
        Ok(response)
    }

    /// Register an upgraded socket and serve it until it closes
    async fn accept<S>(
        &self,
        ws: WebSocketStream<S>,
        logger: &Logger,
        shutdown_rx: broadcast::Receiver<()>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let connection = ServerConnection::new(&self.socket_loggers);
        logger.info(format!("-> {}", connection.logger().name()));
        let key = self.registry.insert(connection).await;

        self.handler.handle(key, ws, shutdown_rx).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::task::JoinHandle;

    fn upgrade_request(path: &str) -> String {
        format!(
            "GET {} HTTP/1.1\r\n\
             Host: localhost\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
             Sec-WebSocket-Version: 13\r\n\r\n",
            path
        )
    }

    fn upgrade_head(path: &str) -> Request<()> {
        Request::builder()
            .method(Method::GET)
            .uri(path)
            .header("Host", "localhost")
            .header("Upgrade", "websocket")
            .header("Connection", "Upgrade")
            .header("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ==")
            .header("Sec-WebSocket-Version", "13")
            .body(())
            .unwrap()
    }

    fn gate() -> (UpgradeGate, broadcast::Sender<()>) {
        let (shutdown_tx, _) = broadcast::channel(1);
        let gate = UpgradeGate::new(ConnectionRegistry::new(), &Logger::root(), shutdown_tx.clone());
        (gate, shutdown_tx)
    }

    fn serve(gate: &UpgradeGate) -> (DuplexStream, JoinHandle<hyper::Result<()>>) {
        let (client, server) = tokio::io::duplex(4096);
        let gate = gate.clone();
        let task = tokio::spawn(async move { gate.serve_connection(server).await });
        (client, task)
    }

    async fn exchange(gate: &UpgradeGate, request: &[u8]) -> String {
        let (mut client, _task) = serve(gate);
        client.write_all(request).await.unwrap();
        let mut buf = Vec::new();
        let _ = client.read_to_end(&mut buf).await;
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn test_validate_upgrade_accept_key() {
        // Sample key and accept value from RFC 6455
        assert_eq!(
            validate_upgrade(&upgrade_head("/ws")),
            Ok("s3pPLMBiTxaQ9kYGzzhZRbK+xOo=".to_string())
        );
    }

    #[test]
    fn test_validate_upgrade_errors() {
        let mut post = upgrade_head("/ws");
        *post.method_mut() = Method::POST;
        assert_eq!(
            validate_upgrade(&post),
            Err(UpgradeError::InvalidMethod(Method::POST))
        );

        let mut h2c = upgrade_head("/ws");
        h2c.headers_mut()
            .insert(UPGRADE, HeaderValue::from_static("h2c"));
        assert!(matches!(
            validate_upgrade(&h2c),
            Err(UpgradeError::UnsupportedProtocol(_))
        ));

        let mut old = upgrade_head("/ws");
        old.headers_mut()
            .insert(SEC_WEBSOCKET_VERSION, HeaderValue::from_static("8"));
        assert!(matches!(
            validate_upgrade(&old),
            Err(UpgradeError::UnsupportedVersion(_))
        ));

        let mut keyless = upgrade_head("/ws");
        keyless.headers_mut().remove(SEC_WEBSOCKET_KEY);
        assert_eq!(validate_upgrade(&keyless), Err(UpgradeError::MissingKey));
    }

    #[test]
    fn test_is_upgrade_request() {
        assert!(is_upgrade_request(&upgrade_head("/ws")));

        let mut keep_alive = upgrade_head("/ws");
        keep_alive
            .headers_mut()
            .insert(CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
        assert!(is_upgrade_request(&keep_alive));

        let plain = Request::get("/").body(()).unwrap();
        assert!(!is_upgrade_request(&plain));
    }

    #[tokio::test]
    async fn test_foreign_path_ends_connection_without_response() {
        let (gate, _shutdown_tx) = gate();

        let response = exchange(&gate, upgrade_request("/other").as_bytes()).await;
        assert!(response.is_empty());
        assert!(gate.registry().is_empty().await);
    }

    #[tokio::test]
    async fn test_query_string_is_not_the_socket_path() {
        let (gate, _shutdown_tx) = gate();

        let response = exchange(&gate, upgrade_request("/ws?token=1").as_bytes()).await;
        assert!(response.is_empty());
        assert!(gate.registry().is_empty().await);
    }

    #[tokio::test]
    async fn test_socket_path_upgrades_and_registers() {
        let (gate, _shutdown_tx) = gate();
        let (client_io, _task) = serve(&gate);

        let (mut client, response) = tokio_tungstenite::client_async("ws://localhost/ws", client_io)
            .await
            .unwrap();
        assert_eq!(response.status(), 101);

        let mut registered = false;
        for _ in 0..100 {
            if gate.registry().len().await == 1 {
                registered = true;
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(registered);

        client.close(None).await.unwrap();
        while client.next().await.is_some() {}

        for _ in 0..100 {
            if gate.registry().is_empty().await {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(gate.registry().is_empty().await);
    }

    #[tokio::test]
    async fn test_bad_handshake_gets_400() {
        let (gate, _shutdown_tx) = gate();

        let request = upgrade_request("/ws").replace("Sec-WebSocket-Version: 13", "Sec-WebSocket-Version: 8");
        let response = exchange(&gate, request.as_bytes()).await;
        assert!(response.starts_with("HTTP/1.1 400 Bad Request"));
        assert!(response.ends_with("Unsupported WebSocket version: 8"));
        assert!(gate.registry().is_empty().await);
    }

    #[tokio::test]
    async fn test_plain_request_without_static_files() {
        let (gate, _shutdown_tx) = gate();

        let response = exchange(
            &gate,
            b"GET /index.html HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 404 Not Found"));
    }

    #[tokio::test]
    async fn test_plain_request_served_from_static_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<p>hello</p>").unwrap();
        let (gate, _shutdown_tx) = gate();
        let gate = gate.with_static_files(Some(StaticFiles::new(dir.path())));

        let response = exchange(
            &gate,
            b"GET /index.html HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.to_ascii_lowercase().contains("content-type: text/html"));
        assert!(response.ends_with("<p>hello</p>"));
    }

    #[tokio::test]
    async fn test_keep_alive_serves_several_requests() {
        let (gate, _shutdown_tx) = gate();
        let (mut client, _task) = serve(&gate);

        client
            .write_all(
                b"GET /a HTTP/1.1\r\nHost: localhost\r\n\r\n\
                  GET /b HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
            )
            .await
            .unwrap();

        let mut buf = Vec::new();
        client.read_to_end(&mut buf).await.unwrap();
        let response = String::from_utf8(buf).unwrap();
        assert_eq!(response.matches("HTTP/1.1 404 Not Found").count(), 2);
    }

    #[tokio::test]
    async fn test_frames_sent_with_the_request_are_not_lost() {
        let (gate, _shutdown_tx) = gate();

        // Upgrade request followed in the same write by a masked "hi" text
        // frame and a masked close frame
        let mut bytes = upgrade_request("/ws").into_bytes();
        bytes.extend_from_slice(&[0x81, 0x82, 0, 0, 0, 0, b'h', b'i']);
        bytes.extend_from_slice(&[0x88, 0x80, 0, 0, 0, 0]);

        let (mut client, _task) = serve(&gate);
        client.write_all(&bytes).await.unwrap();
        let mut buf = Vec::new();
        client.read_to_end(&mut buf).await.unwrap();

        let head_end = buf.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
        let head = String::from_utf8_lossy(&buf[..head_end]);
        assert!(head.starts_with("HTTP/1.1 101 Switching Protocols"));
        // The server answered the buffered close frame
        assert_eq!(buf.get(head_end), Some(&0x88));
        assert!(gate.registry().is_empty().await);
    }

    #[tokio::test]
    async fn test_shutdown_ends_idle_connection() {
        let (gate, shutdown_tx) = gate();
        let (_client, task) = serve(&gate);

        while shutdown_tx.receiver_count() == 0 {
            tokio::task::yield_now().await;
        }
        shutdown_tx.send(()).unwrap();

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("connection still open after shutdown")
            .unwrap()
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_request_head_times_out() {
        let (gate, _shutdown_tx) = gate();
        let (mut client, task) = serve(&gate);

        client.write_all(b"GET / HTTP/1.1\r\nHost: loc").await.unwrap();

        let result = tokio::time::timeout(HEADER_READ_TIMEOUT + Duration::from_secs(1), task).await;
        assert!(result.is_ok(), "stalled connection was never closed");
    }
}

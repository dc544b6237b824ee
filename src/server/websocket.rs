//! WebSocket server implementation
//!
//! Listens on a configurable port, upgrades requests on the registered paths
//! and runs one connection handler task per client.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::{sleep, Instant};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tracing::{debug, error, info, warn};

use super::handler::{ConnectionEnd, ConnectionHandler, StreamOptions};
use super::routes::{parse_request_head, RequestHead, RouteTable, NOT_FOUND_RESPONSE};

/// Port used when none is configured
pub const DEFAULT_PORT: u16 = 8088;
/// Address used when none is configured
pub const DEFAULT_BIND: &str = "0.0.0.0";
/// Delay between echoed frames
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);
/// How long shutdown waits for handlers to send their close frames
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Largest request head inspected before the handshake
const MAX_REQUEST_HEAD: usize = 8192;
/// Pause between peeks while a request head is still arriving
const PEEK_RETRY: Duration = Duration::from_millis(10);

/// Errors that stop the server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Listener error: {0}")]
    Listener(#[from] std::io::Error),
}

/// Configuration for the WebSocket server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
    /// Pause between frames sent to a client
    pub interval: Duration,
    /// Limit on the wait for a client's first message
    pub recv_timeout: Option<Duration>,
}

impl ServerConfig {
    /// Create a new server configuration
    pub fn new(bind: impl Into<String>, port: u16) -> Self {
        Self {
            bind: bind.into(),
            port,
            interval: DEFAULT_INTERVAL,
            recv_timeout: None,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_recv_timeout(mut self, recv_timeout: Option<Duration>) -> Self {
        self.recv_timeout = recv_timeout;
        self
    }

    /// Get the socket address to bind to
    ///
    /// IP literals go through `SocketAddr` so IPv6 addresses get brackets;
    /// anything else (a host name) is passed through for the resolver.
    pub fn socket_addr(&self) -> String {
        match self.bind.parse::<IpAddr>() {
            Ok(ip) => SocketAddr::new(ip, self.port).to_string(),
            Err(_) => format!("{}:{}", self.bind, self.port),
        }
    }

    fn stream_options(&self) -> StreamOptions {
        StreamOptions {
            interval: self.interval,
            recv_timeout: self.recv_timeout,
        }
    }
}

/// URL a local client can use to reach `path` on `port`
pub fn client_url(port: u16, path: &str) -> String {
    format!("ws://127.0.0.1:{}{}", port, path)
}

/// Keeps the live connection count accurate however a task exits
struct ConnectionGuard(Arc<AtomicUsize>);

impl ConnectionGuard {
    fn new(count: &Arc<AtomicUsize>) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(count))
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// WebSocket server streaming timestamped echoes
pub struct WebSocketServer {
    config: ServerConfig,
    routes: Arc<RouteTable>,
    active: Arc<AtomicUsize>,
    shutdown_tx: broadcast::Sender<()>,
}

impl WebSocketServer {
    /// Create a new WebSocket server
    pub fn new(config: ServerConfig, routes: RouteTable) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            routes: Arc::new(routes),
            active: Arc::new(AtomicUsize::new(0)),
            shutdown_tx,
        }
    }

    /// Trigger server shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Number of connections currently being handled
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Bind the configured address
    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        let addr = self.config.socket_addr();
        TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })
    }

    /// Bind and run the server until shutdown
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Run the server on an already bound listener
    ///
    /// Connections are accepted one at a time and each is handled on its own
    /// task. Returns once a shutdown signal is received.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let local_addr = listener.local_addr()?;
        info!("WebSocket server listening on {}", local_addr);
        for path in self.routes.paths() {
            info!("Client can connect to {}", client_url(local_addr.port(), path));
        }

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                // Accept new connections
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => self.dispatch(stream, peer_addr),
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                // Handle shutdown signal
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping server");
                    break;
                }
            }
        }

        let open = self.active_connections();
        if open > 0 {
            info!("Waiting for {} active connections to close...", open);
            if !self.wait_for_idle(SHUTDOWN_GRACE).await {
                warn!(
                    "{} connections still open after {:?}",
                    self.active_connections(),
                    SHUTDOWN_GRACE
                );
            }
        }

        Ok(())
    }

    /// Poll until no connection is being handled or `limit` elapses
    async fn wait_for_idle(&self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        while self.active_connections() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            sleep(Duration::from_millis(10)).await;
        }
        true
    }

    fn dispatch(&self, stream: TcpStream, peer_addr: SocketAddr) {
        let guard = ConnectionGuard::new(&self.active);
        let routes = Arc::clone(&self.routes);
        let options = self.config.stream_options();
        let shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let _guard = guard;
            match handle_connection(stream, peer_addr, &routes, options, shutdown_rx).await {
                Ok(Some(end)) => debug!("Connection from {} ended: {}", peer_addr, end),
                Ok(None) => debug!("Connection from {} answered with 404", peer_addr),
                Err(e) => warn!("Connection error from {}: {}", peer_addr, e),
            }
        });
    }
}

/// Peek at the request head without consuming it.
///
/// Returns `None` when the bytes are not a parseable HTTP request; the
/// WebSocket handshake then reports the failure.
async fn peek_request_head(stream: &TcpStream) -> std::io::Result<Option<(String, usize)>> {
    let mut buf = [0u8; MAX_REQUEST_HEAD];
    loop {
        let n = stream.peek(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        match parse_request_head(&buf[..n]) {
            RequestHead::Complete { path, len } => return Ok(Some((path, len))),
            RequestHead::Invalid => return Ok(None),
            RequestHead::Partial if n == buf.len() => return Ok(None),
            // peek keeps returning the same bytes until more arrive
            RequestHead::Partial => sleep(PEEK_RETRY).await,
        }
    }
}

/// Handle a single WebSocket connection
///
/// Returns `None` when the request was for an unregistered path and was
/// answered with a plain 404.
async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    routes: &RouteTable,
    options: StreamOptions,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> anyhow::Result<Option<ConnectionEnd>> {
    debug!("New connection from {}", peer_addr);

    if let Some((path, head_len)) = peek_request_head(&stream).await? {
        if !routes.contains(&path) {
            warn!("No route for {} requested by {}", path, peer_addr);
            // Drain the head so closing does not reset the connection
            let mut head = vec![0u8; head_len];
            stream.read_exact(&mut head).await?;
            stream.write_all(NOT_FOUND_RESPONSE).await?;
            stream.shutdown().await?;
            return Ok(None);
        }
    }

    // Upgrade to WebSocket
    let ws_stream = accept_hdr_async(stream, |request: &Request, response: Response| {
        routes.check(request, response)
    })
    .await?;
    debug!("Handshake complete with {}", peer_addr);

    let mut handler = ConnectionHandler::new(peer_addr, options);
    let end = handler.run(ws_stream, &mut shutdown_rx).await;
    debug!("Handler for {} is {:?}", peer_addr, handler.state());
    Ok(Some(end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDateTime;
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::http::StatusCode;
    use tokio_tungstenite::tungstenite::{Error as WsError, Message};
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    use crate::server::handler::TIMESTAMP_FORMAT;

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn start(config: ServerConfig) -> (Arc<WebSocketServer>, SocketAddr) {
        let server = Arc::new(WebSocketServer::new(config, RouteTable::livestream()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let running = Arc::clone(&server);
        tokio::spawn(async move { running.serve(listener).await });
        (server, addr)
    }

    fn fast_config() -> ServerConfig {
        ServerConfig::new("127.0.0.1", 0).with_interval(Duration::from_millis(50))
    }

    async fn connect(addr: SocketAddr) -> Client {
        let url = format!("ws://{}/live/livestream.flv", addr);
        let (client, _) = connect_async(url.as_str()).await.unwrap();
        client
    }

    async fn next_text(client: &mut Client) -> String {
        match client.next().await {
            Some(Ok(Message::Text(text))) => text,
            other => panic!("Expected text frame, got {:?}", other),
        }
    }

    fn parse_frame(frame: &str) -> (NaiveDateTime, String) {
        let (stamp, message) = frame.split_once(", ").expect("separator");
        let time = NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT).expect("timestamp");
        (time, message.to_string())
    }

    async fn wait_for_idle(server: &WebSocketServer, limit: Duration) -> bool {
        server.wait_for_idle(limit).await
    }

    /// Read from a raw socket until the response head is complete
    async fn read_response_head(stream: &mut TcpStream) -> String {
        let mut data = Vec::new();
        let mut buf = [0u8; 1024];
        while !data.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "connection closed after {:?}", String::from_utf8_lossy(&data));
            data.extend_from_slice(&buf[..n]);
        }
        String::from_utf8_lossy(&data).into_owned()
    }

    #[test]
    fn test_server_config() {
        let config = ServerConfig::new("127.0.0.1", 9000);
        assert_eq!(config.socket_addr(), "127.0.0.1:9000");
        assert_eq!(config.interval, Duration::from_secs(1));
        assert!(config.recv_timeout.is_none());
    }

    #[test]
    fn test_socket_addr_brackets_ipv6() {
        assert_eq!(ServerConfig::new("::", 8088).socket_addr(), "[::]:8088");
        assert_eq!(ServerConfig::new("::1", 9000).socket_addr(), "[::1]:9000");
        assert!(ServerConfig::new("::", 8088)
            .socket_addr()
            .parse::<SocketAddr>()
            .is_ok());
    }

    #[test]
    fn test_socket_addr_host_name() {
        assert_eq!(ServerConfig::new("localhost", 8088).socket_addr(), "localhost:8088");
    }

    #[tokio::test]
    async fn test_bind_ipv6_loopback() {
        // Hosts without IPv6 cannot run this; only check the address is accepted
        let server = WebSocketServer::new(ServerConfig::new("::1", 0), RouteTable::livestream());
        if let Err(ServerError::Bind { addr, source }) = server.bind().await {
            assert_eq!(addr, "[::1]:0");
            assert_ne!(source.kind(), std::io::ErrorKind::InvalidInput);
        }
    }

    #[test]
    fn test_client_url() {
        assert_eq!(
            client_url(8088, "/live/livestream.flv"),
            "ws://127.0.0.1:8088/live/livestream.flv"
        );
    }

    #[tokio::test]
    async fn test_bind_failure_reports_address() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let server = WebSocketServer::new(
            ServerConfig::new("127.0.0.1", port),
            RouteTable::livestream(),
        );
        let err = server.run().await.unwrap_err();
        assert!(matches!(err, ServerError::Bind { .. }));
        assert!(err.to_string().contains(&format!("127.0.0.1:{}", port)));
    }

    #[tokio::test]
    async fn test_echoes_message_with_timestamp() {
        let (server, addr) = start(fast_config()).await;
        let mut client = connect(addr).await;

        client.send(Message::Text("hello".to_string())).await.unwrap();
        let frame = next_text(&mut client).await;
        let (_, message) = parse_frame(&frame);
        assert_eq!(message, "hello");
        assert_eq!(frame.len(), "YYYY-MM-DD HH:MM:SS.mmm, hello".len());

        client.close(None).await.unwrap();
        server.shutdown();
    }

    #[tokio::test]
    async fn test_frames_one_second_apart() {
        let (server, addr) = start(ServerConfig::new("127.0.0.1", 0)).await;
        let mut client = connect(addr).await;

        client.send(Message::Text("hello".to_string())).await.unwrap();
        let (first, _) = parse_frame(&next_text(&mut client).await);
        let (second, _) = parse_frame(&next_text(&mut client).await);

        let gap = (second - first).num_milliseconds();
        assert!((800..=1200).contains(&gap), "gap was {}ms", gap);

        client.close(None).await.unwrap();
        server.shutdown();
    }

    #[tokio::test]
    async fn test_unknown_path_gets_404() {
        let (server, addr) = start(fast_config()).await;

        let url = format!("ws://{}/live/other.flv", addr);
        match connect_async(url.as_str()).await {
            Err(WsError::Http(response)) => assert_eq!(response.status(), StatusCode::NOT_FOUND),
            Err(e) => panic!("Expected HTTP 404, got {}", e),
            Ok(_) => panic!("Handshake on unknown path should fail"),
        }

        assert!(wait_for_idle(&server, Duration::from_secs(1)).await);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_plain_http_unknown_path_gets_404() {
        let (server, addr) = start(fast_config()).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /index.html HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();

        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        let response = String::from_utf8_lossy(&response);
        assert!(
            response.starts_with("HTTP/1.1 404 Not Found\r\n"),
            "got {:?}",
            response
        );
        assert!(response.ends_with("404 page not found\n"));

        assert!(wait_for_idle(&server, Duration::from_secs(1)).await);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_split_request_head_still_upgrades() {
        let (server, addr) = start(fast_config()).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /live/livestream.flv HTTP/1.1\r\nHost: x\r\n")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        stream
            .write_all(
                b"Upgrade: websocket\r\n\
Connection: Upgrade\r\n\
Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
Sec-WebSocket-Version: 13\r\n\r\n",
            )
            .await
            .unwrap();

        let head = read_response_head(&mut stream).await;
        assert!(head.starts_with("HTTP/1.1 101"), "got {:?}", head);

        drop(stream);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_clients_are_isolated() {
        let (server, addr) = start(fast_config()).await;
        let mut alice = connect(addr).await;
        let mut bob = connect(addr).await;

        alice.send(Message::Text("alice".to_string())).await.unwrap();
        bob.send(Message::Text("bob".to_string())).await.unwrap();

        for _ in 0..3 {
            assert_eq!(parse_frame(&next_text(&mut alice).await).1, "alice");
            assert_eq!(parse_frame(&next_text(&mut bob).await).1, "bob");
        }

        alice.close(None).await.unwrap();
        bob.close(None).await.unwrap();
        server.shutdown();
    }

    #[tokio::test]
    async fn test_client_close_releases_connection() {
        let (server, addr) = start(ServerConfig::new("127.0.0.1", 0)).await;
        let mut client = connect(addr).await;

        client.send(Message::Text("bye".to_string())).await.unwrap();
        next_text(&mut client).await;
        assert_eq!(server.active_connections(), 1);

        client.close(None).await.unwrap();
        assert!(wait_for_idle(&server, Duration::from_millis(1200)).await);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_dropped_client_releases_connection() {
        let (server, addr) = start(ServerConfig::new("127.0.0.1", 0)).await;
        let mut client = connect(addr).await;

        client.send(Message::Text("gone".to_string())).await.unwrap();
        next_text(&mut client).await;
        drop(client);

        assert!(wait_for_idle(&server, Duration::from_millis(1200)).await);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_idle_client_times_out() {
        let config = fast_config().with_recv_timeout(Some(Duration::from_millis(100)));
        let (server, addr) = start(config).await;
        let mut client = connect(addr).await;

        let closed = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match client.next().await {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
        })
        .await;
        assert!(closed.is_ok());
        assert!(wait_for_idle(&server, Duration::from_secs(1)).await);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_serve_waits_for_close_frames() {
        let server = Arc::new(WebSocketServer::new(fast_config(), RouteTable::livestream()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let running = Arc::clone(&server);
        let serving = tokio::spawn(async move { running.serve(listener).await });

        let mut client = connect(addr).await;
        client.send(Message::Text("hello".to_string())).await.unwrap();
        next_text(&mut client).await;

        server.shutdown();
        tokio::time::timeout(Duration::from_secs(3), serving)
            .await
            .expect("serve should return after shutdown")
            .unwrap()
            .unwrap();

        // Every handler finished before serve returned
        assert_eq!(server.active_connections(), 0);

        let mut saw_close = false;
        while let Some(Ok(msg)) = client.next().await {
            if msg.is_close() {
                saw_close = true;
                break;
            }
        }
        assert!(saw_close);
    }

    #[tokio::test]
    async fn test_shutdown_closes_clients() {
        let (server, addr) = start(fast_config()).await;
        let mut client = connect(addr).await;

        client.send(Message::Text("hello".to_string())).await.unwrap();
        next_text(&mut client).await;
        server.shutdown();

        let closed = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match client.next().await {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
        })
        .await;
        assert!(closed.is_ok());
        assert!(wait_for_idle(&server, Duration::from_secs(1)).await);
    }
}

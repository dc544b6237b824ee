//! WebSocket connection handler
//!
//! Waits for one message from the client, then sends it back prefixed with
//! the current local time once per interval until the connection goes away.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use chrono::{DateTime, Local, TimeZone};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info};

/// `YYYY-MM-DD HH:MM:SS.mmm`
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Format one outgoing frame: `"<timestamp>, <message>"`
pub fn format_frame<Tz>(time: &DateTime<Tz>, message: &str) -> String
where
    Tz: TimeZone,
    Tz::Offset: fmt::Display,
{
    format!("{}, {}", time.format(TIMESTAMP_FORMAT), message)
}

/// Lifecycle of a single connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    AwaitingInitialMessage,
    Streaming,
    Closed,
}

/// Why a connection handler finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEnd {
    /// Client sent a close frame or dropped the transport while streaming
    PeerClosed,
    /// Connection ended or failed before the first message arrived
    ReceiveFailed,
    /// No first message within the configured timeout
    ReceiveTimedOut,
    /// Writing a frame failed
    SendFailed,
    /// Server is shutting down
    Shutdown,
}

impl fmt::Display for ConnectionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            ConnectionEnd::PeerClosed => "closed by peer",
            ConnectionEnd::ReceiveFailed => "initial receive failed",
            ConnectionEnd::ReceiveTimedOut => "initial receive timed out",
            ConnectionEnd::SendFailed => "send failed",
            ConnectionEnd::Shutdown => "server shutdown",
        };
        f.write_str(reason)
    }
}

/// Per-connection streaming parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamOptions {
    /// Pause after each sent frame
    pub interval: Duration,
    /// Limit on the wait for the first message; `None` waits forever
    pub recv_timeout: Option<Duration>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            recv_timeout: None,
        }
    }
}

/// Handles a single WebSocket connection
pub struct ConnectionHandler {
    peer_addr: SocketAddr,
    options: StreamOptions,
    state: ConnectionState,
}

impl ConnectionHandler {
    /// Create a new connection handler
    pub fn new(peer_addr: SocketAddr, options: StreamOptions) -> Self {
        Self {
            peer_addr,
            options,
            state: ConnectionState::AwaitingInitialMessage,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Drive the connection until it ends.
    ///
    /// Consumes the stream; the connection is released when this returns.
    pub async fn run<S>(
        &mut self,
        ws: WebSocketStream<S>,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> ConnectionEnd
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut sender, mut receiver) = ws.split();

        let message = match self.receive_initial(&mut receiver, shutdown).await {
            Ok(message) => message,
            Err(end) => {
                self.state = ConnectionState::Closed;
                return end;
            }
        };

        info!("Got websocket connection {} {}", self.peer_addr, message);
        self.state = ConnectionState::Streaming;

        let end = self
            .stream(&mut sender, &mut receiver, &message, shutdown)
            .await;
        if end == ConnectionEnd::Shutdown {
            let _ = sender.send(Message::Close(None)).await;
        }

        self.state = ConnectionState::Closed;
        end
    }

    async fn receive_initial<R>(
        &self,
        receiver: &mut R,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<String, ConnectionEnd>
    where
        R: Stream<Item = Result<Message, WsError>> + Unpin,
    {
        let peer_addr = self.peer_addr;
        let wait = async move {
            loop {
                match receiver.next().await {
                    Some(Ok(Message::Text(text))) => return Ok(text),
                    Some(Ok(Message::Binary(data))) => {
                        return Ok(String::from_utf8_lossy(&data).into_owned())
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("{} closed before sending a message", peer_addr);
                        return Err(ConnectionEnd::ReceiveFailed);
                    }
                    Some(Err(e)) => {
                        debug!("Receive from {} failed: {}", peer_addr, e);
                        return Err(ConnectionEnd::ReceiveFailed);
                    }
                }
            }
        };

        let limited = async {
            match self.options.recv_timeout {
                Some(limit) => timeout(limit, wait)
                    .await
                    .unwrap_or(Err(ConnectionEnd::ReceiveTimedOut)),
                None => wait.await,
            }
        };

        tokio::select! {
            result = limited => result,
            Ok(()) = shutdown.recv() => Err(ConnectionEnd::Shutdown),
        }
    }

    async fn stream<W, R>(
        &self,
        sender: &mut W,
        receiver: &mut R,
        message: &str,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> ConnectionEnd
    where
        W: Sink<Message, Error = WsError> + Unpin,
        R: Stream<Item = Result<Message, WsError>> + Unpin,
    {
        loop {
            let frame = format_frame(&Local::now(), message);
            if let Err(e) = sender.send(Message::Text(frame)).await {
                debug!("Send to {} failed: {}", self.peer_addr, e);
                return ConnectionEnd::SendFailed;
            }

            // Fixed delay after each send; keep reading so a close is noticed
            // without waiting for the next write to fail.
            let pause = sleep(self.options.interval);
            tokio::pin!(pause);

            loop {
                tokio::select! {
                    _ = &mut pause => break,
                    inbound = receiver.next() => match inbound {
                        Some(Ok(Message::Close(_))) | None => return ConnectionEnd::PeerClosed,
                        Some(Err(e)) => {
                            debug!("Read from {} failed: {}", self.peer_addr, e);
                            return ConnectionEnd::PeerClosed;
                        }
                        // Only the first message matters
                        Some(Ok(_)) => {}
                    },
                    Ok(()) = shutdown.recv() => return ConnectionEnd::Shutdown,
                }
            }
        }
    }
}

//! WebSocket server module
//!
//! Accepts WebSocket connections on the registered paths and streams a
//! timestamped echo of each client's first message.

mod handler;
mod routes;
mod websocket;

pub use routes::RouteTable;
pub use websocket::{ServerConfig, WebSocketServer, DEFAULT_BIND, DEFAULT_PORT};

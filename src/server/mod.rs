//! WebSocket server module
//!
//! Accepts WebSocket connections from chat clients, runs each through its
//! lifecycle and hands inbound messages to the router.

mod handler;
mod protocol;
mod websocket;

pub use protocol::*;
pub use websocket::*;

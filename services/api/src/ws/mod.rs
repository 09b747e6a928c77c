//! WebSocket Session Channel
//!
//! A presentation client attaches to a running session and exchanges
//! messages with it in real time:
//!
//! - `protocol`: the JSON message format for client-server communication.
//! - `session`: the connection lifecycle, from `attach` to close.

pub mod protocol;
pub mod session;

pub use session::ws_handler;

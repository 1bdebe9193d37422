//! Management channel to the fleet server.
//!
//! - [`proto`] — JSON message codec (`capability_report`, `alert`, `shell_attach`)
//! - [`client`] — persistent WebSocket with reconnect backoff and dispatch

pub mod client;
pub mod proto;

/// RFC 6455 close code: normal closure.
pub const WS_CLOSE_NORMAL: u16 = 1000;
/// RFC 6455 close code: data type the endpoint cannot accept (binary frame).
pub const WS_CLOSE_INVALID_ENCODING: u16 = 1003;
/// RFC 6455 close code: payload inconsistent with the message type.
pub const WS_CLOSE_INVALID_PAYLOAD: u16 = 1007;

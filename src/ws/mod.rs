//! WebSocket transport, wire protocol, routing and fan-out

pub mod dispatch;
pub mod handler;
pub mod protocol;
pub mod router;

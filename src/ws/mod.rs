//! Wire protocol and WebSocket transport

pub mod bitstream;
pub mod handler;
pub mod packets;
pub mod protocol;

pub use handler::ws_handler;

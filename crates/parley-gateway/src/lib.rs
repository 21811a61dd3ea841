//! Real-time messaging core: frame codec, sessions, the connection hub,
//! per-kind dispatch and broadcast fan-out.

pub mod broadcast;
pub mod codec;
pub mod connection;
pub mod dispatch;
pub mod hub;
pub mod session;

pub use hub::{GatewayConfig, Hub};

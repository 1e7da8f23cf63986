//! Agent endpoint
//!
//! Accepts WebSocket upgrades on `/agent`, authenticates the identity in the
//! upgrade headers and serves each accepted channel on its own task.

mod channel;
mod handler;
mod listener;
mod local;

pub use channel::WsChannel;
pub use handler::{admit, serve_channel, Rejection};
pub use listener::EngineServer;
pub use local::LocalConnector;

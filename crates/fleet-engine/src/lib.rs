//! fleet-engine: Central endpoint for fleet agent channels
//!
//! The engine accepts authenticated WebSocket channels from remote agents,
//! keeps a registry of live connections, pushes commands to agents and
//! correlates their results, and exposes a small admin HTTP surface.

pub mod admin;
pub mod auth;
pub mod command;
pub mod connection;
pub mod server;
pub mod state;

pub use command::{CommandCorrelator, PendingCommand};
pub use connection::SessionRegistry;
pub use server::{EngineServer, LocalConnector};
pub use state::EngineState;

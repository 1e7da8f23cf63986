//! Channel establishment to the engine

mod connector;
mod reconnect;

pub use connector::{WsChannel, WsConnector};
pub use reconnect::{FixedDelay, ReconnectSupervisor, ScheduledRetry};

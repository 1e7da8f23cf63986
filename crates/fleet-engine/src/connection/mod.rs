//! Connection tracking

mod health;
mod registry;

pub use health::{Health, HealthMonitor};
pub use registry::{AgentConnection, ConnectionId, SessionRegistry};

//! fleet-agent: Remote agent for the fleet engine
//!
//! The agent runs on each managed server and keeps one authenticated
//! WebSocket channel open to the engine. It reports heartbeats with host
//! metrics, runs commands pushed by the engine, and reconnects on a fixed
//! delay whenever the channel drops.

pub mod executor;
pub mod loadtest;
pub mod metrics;
pub mod session;
pub mod transport;

pub use session::AgentSession;
pub use transport::WsConnector;

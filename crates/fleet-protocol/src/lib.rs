//! fleet-protocol: Wire protocol for the fleet agent channel
//!
//! This crate defines the JSON messages exchanged between agents and the
//! engine over a persistent WebSocket, the identifiers they carry, and the
//! metadata an agent attaches when it opens the channel.

pub mod codec;
pub mod error;
pub mod handshake;
pub mod ids;
pub mod message;

pub use codec::{decode, encode, MAX_FRAME_SIZE, MAX_MESSAGE_SIZE};
pub use error::ProtocolError;
pub use handshake::{Handshake, AGENT_CLIENT_TYPE, AGENT_PATH};
pub use ids::{AgentId, CommandId};
pub use message::{CommandRequest, CommandResult, HeartbeatReport, HeartbeatStatus, Message};

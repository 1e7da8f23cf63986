//! Transport channel traits

use async_trait::async_trait;

use crate::error::{ChannelError, ConnectionError};
use crate::types::AgentIdentity;
use fleet_protocol::Message;

/// One live, full-duplex, message-framed channel
///
/// Messages are delivered in send order. `recv` must be cancel-safe: it is
/// raced against timers inside `tokio::select!`.
#[async_trait]
pub trait Channel: Send {
    /// Send a message to the peer
    ///
    /// `ChannelError::Protocol` means the message could not be encoded (for
    /// example it is over the size limit) and nothing was written; the
    /// channel stays usable. `ChannelError::Connection` means it is not.
    async fn send(&mut self, message: Message) -> Result<(), ChannelError>;

    /// Receive the next message
    ///
    /// Returns `None` once the channel is closed. `ChannelError::Protocol`
    /// reports a malformed message that was dropped; the channel stays usable.
    async fn recv(&mut self) -> Option<Result<Message, ChannelError>>;

    /// Close the channel
    async fn close(&mut self);
}

/// Opens authenticated channels to the engine
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a channel presenting `identity` as establishment metadata
    ///
    /// Fails with `ConnectionError::AuthenticationFailed` if the engine
    /// rejects the identity, or a network error otherwise.
    async fn open(&self, identity: &AgentIdentity) -> Result<Box<dyn Channel>, ConnectionError>;

    /// Human-readable endpoint description for logs
    fn endpoint(&self) -> &str;
}

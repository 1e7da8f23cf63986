//! In-process channel pair
//!
//! Both ends carry encoded JSON text, so the codec runs exactly as it does
//! over a socket. Used to embed an agent and the engine in one process and to
//! drive both sides deterministically in tests.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{ChannelError, ConnectionError};
use crate::traits::Channel;
use fleet_protocol::{codec, Message};

/// One end of an in-process channel
pub struct MemoryChannel {
    tx: Option<mpsc::Sender<String>>,
    rx: mpsc::Receiver<String>,
}

/// Create a connected pair of in-process channels
pub fn channel_pair(capacity: usize) -> (MemoryChannel, MemoryChannel) {
    let (a_tx, b_rx) = mpsc::channel(capacity);
    let (b_tx, a_rx) = mpsc::channel(capacity);
    (
        MemoryChannel {
            tx: Some(a_tx),
            rx: a_rx,
        },
        MemoryChannel {
            tx: Some(b_tx),
            rx: b_rx,
        },
    )
}

impl MemoryChannel {
    /// Send raw text without encoding it first
    pub async fn send_raw(&mut self, text: impl Into<String>) -> Result<(), ConnectionError> {
        let tx = self.tx.as_ref().ok_or(ConnectionError::Closed)?;
        tx.send(text.into()).await.map_err(|_| ConnectionError::Closed)
    }

    /// Whether this end has been closed
    pub fn is_closed(&self) -> bool {
        self.tx.is_none()
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn send(&mut self, message: Message) -> Result<(), ChannelError> {
        let text = codec::encode(&message)?;
        self.send_raw(text).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<Message, ChannelError>> {
        let text = self.rx.recv().await?;
        Some(codec::decode(&text).map_err(ChannelError::from))
    }

    async fn close(&mut self) {
        self.tx = None;
        self.rx.close();
    }
}

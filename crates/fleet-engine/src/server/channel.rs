//! axum WebSocket as a message channel

use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket};

use fleet_core::traits::Channel;
use fleet_core::{ChannelError, ConnectionError};
use fleet_protocol::{codec, Message};

/// Engine side of an agent WebSocket
pub struct WsChannel {
    socket: WebSocket,
}

impl WsChannel {
    /// Wrap an upgraded socket
    pub fn new(socket: WebSocket) -> Self {
        Self { socket }
    }
}

#[async_trait]
impl Channel for WsChannel {
    async fn send(&mut self, message: Message) -> Result<(), ChannelError> {
        let text = codec::encode(&message)?;
        self.socket
            .send(WsMessage::Text(text))
            .await
            .map_err(|e| ConnectionError::Network(e.to_string()).into())
    }

    async fn recv(&mut self) -> Option<Result<Message, ChannelError>> {
        loop {
            let frame = match self.socket.recv().await? {
                Ok(frame) => frame,
                Err(e) => {
                    return Some(Err(ConnectionError::Network(e.to_string()).into()));
                }
            };

            return match frame {
                WsMessage::Text(text) => Some(codec::decode(&text).map_err(Into::into)),
                WsMessage::Binary(bytes) => Some(codec::decode_bytes(&bytes).map_err(Into::into)),
                // Transport-level keepalives are answered by axum
                WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
                WsMessage::Close(_) => None,
            };
        }
    }

    async fn close(&mut self) {
        let _ = self.socket.send(WsMessage::Close(None)).await;
    }
}

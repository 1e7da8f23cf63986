//! Outbound WebSocket connector
//!
//! Opens the agent channel to the engine. The identity rides in the upgrade
//! request headers; a 401/403 answer to the upgrade is an authentication
//! failure, anything else that stops the upgrade is a network error.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use fleet_core::traits::{Channel, Connector};
use fleet_core::{AgentIdentity, ChannelError, ConnectionError};
use fleet_protocol::{codec, Message, MAX_FRAME_SIZE};

/// Opens WebSocket channels to one engine endpoint
pub struct WsConnector {
    /// Engine URL, e.g. `ws://engine:7420/agent`
    url: String,
}

impl WsConnector {
    /// Create a connector for `url`
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, identity: &AgentIdentity) -> Result<Box<dyn Channel>, ConnectionError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| ConnectionError::Network(format!("Invalid engine URL {}: {}", self.url, e)))?;

        let handshake = identity.handshake();
        for (name, value) in handshake.headers() {
            // Credentials that cannot be sent as a header can never validate
            let value = HeaderValue::from_str(value)
                .map_err(|_| ConnectionError::AuthenticationFailed)?;
            request.headers_mut().insert(name, value);
        }

        // The codec enforces the message limit; this only bounds buffering
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(MAX_FRAME_SIZE);
        config.max_frame_size = Some(MAX_FRAME_SIZE);

        tracing::debug!("Connecting to {} as {}", self.url, identity.id);
        let (stream, _response) =
            tokio_tungstenite::connect_async_with_config(request, Some(config), false)
                .await
                .map_err(map_connect_error)?;

        Ok(Box::new(WsChannel { stream }))
    }

    fn endpoint(&self) -> &str {
        &self.url
    }
}

fn map_connect_error(e: WsError) -> ConnectionError {
    match e {
        WsError::Http(response)
            if matches!(response.status(), StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) =>
        {
            ConnectionError::AuthenticationFailed
        }
        other => ConnectionError::Network(other.to_string()),
    }
}

/// Agent side of the engine WebSocket
pub struct WsChannel {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Channel for WsChannel {
    async fn send(&mut self, message: Message) -> Result<(), ChannelError> {
        let text = codec::encode(&message)?;
        self.stream
            .send(WsMessage::Text(text))
            .await
            .map_err(|e| ConnectionError::Network(e.to_string()).into())
    }

    async fn recv(&mut self) -> Option<Result<Message, ChannelError>> {
        loop {
            let frame = match self.stream.next().await? {
                Ok(frame) => frame,
                Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => return None,
                Err(e) => return Some(Err(ConnectionError::Network(e.to_string()).into())),
            };

            return match frame {
                WsMessage::Text(text) => Some(codec::decode(&text).map_err(Into::into)),
                WsMessage::Binary(bytes) => Some(codec::decode_bytes(&bytes).map_err(Into::into)),
                // tungstenite queues the pong itself
                WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => continue,
                WsMessage::Close(_) => None,
            };
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_other_errors_are_network() {
        let err = map_connect_error(WsError::ConnectionClosed);
        assert!(matches!(err, ConnectionError::Network(_)));
    }

    #[tokio::test]
    async fn test_unreachable_engine_is_network_error() {
        let connector = WsConnector::new("ws://127.0.0.1:1/agent");
        let identity = AgentIdentity::new("A1", "secret");
        let err = connector.open(&identity).await.err().unwrap();
        assert!(matches!(err, ConnectionError::Network(_)));
    }

    #[tokio::test]
    async fn test_invalid_url_is_network_error() {
        let connector = WsConnector::new("not a url");
        let identity = AgentIdentity::new("A1", "secret");
        let err = connector.open(&identity).await.err().unwrap();
        assert!(matches!(err, ConnectionError::Network(_)));
    }
}

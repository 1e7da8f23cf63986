//! Channel-establishment metadata
//!
//! Identity travels in the WebSocket upgrade request, never in a message
//! body, so a rejected authentication leaves nothing to clean up at the
//! protocol level:
//! - `x-client-type`: always `agent`
//! - `x-agent-id`: the agent's identity
//! - `x-agent-key`: the agent's secret key

use crate::error::ProtocolError;
use crate::ids::AgentId;

/// Path of the agent endpoint on the engine
pub const AGENT_PATH: &str = "/agent";

/// Header carrying the client type marker
pub const CLIENT_TYPE_HEADER: &str = "x-client-type";

/// Header carrying the agent ID
pub const AGENT_ID_HEADER: &str = "x-agent-id";

/// Header carrying the agent secret key
pub const AGENT_KEY_HEADER: &str = "x-agent-key";

/// Client type marker sent by agents
pub const AGENT_CLIENT_TYPE: &str = "agent";

/// Identity metadata attached to a channel open
#[derive(Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Claimed agent identity
    pub agent_id: AgentId,
    /// Secret key for the identity
    pub agent_key: String,
}

impl Handshake {
    /// Create handshake metadata for an agent
    pub fn new(agent_id: AgentId, agent_key: impl Into<String>) -> Self {
        Self {
            agent_id,
            agent_key: agent_key.into(),
        }
    }

    /// Header name/value pairs to attach to the upgrade request
    pub fn headers(&self) -> [(&'static str, &str); 3] {
        [
            (CLIENT_TYPE_HEADER, AGENT_CLIENT_TYPE),
            (AGENT_ID_HEADER, self.agent_id.as_str()),
            (AGENT_KEY_HEADER, self.agent_key.as_str()),
        ]
    }

    /// Parse handshake metadata using a header lookup function
    ///
    /// The lookup returns the value of a header by (lowercase) name.
    pub fn from_lookup<'a, F>(lookup: F) -> Result<Self, ProtocolError>
    where
        F: Fn(&str) -> Option<&'a str>,
    {
        let client_type = lookup(CLIENT_TYPE_HEADER)
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or(ProtocolError::MissingHandshakeField(CLIENT_TYPE_HEADER))?;
        if client_type != AGENT_CLIENT_TYPE {
            return Err(ProtocolError::UnsupportedClientType(client_type.to_string()));
        }

        let agent_id = lookup(AGENT_ID_HEADER)
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or(ProtocolError::MissingHandshakeField(AGENT_ID_HEADER))?;

        let agent_key = lookup(AGENT_KEY_HEADER)
            .filter(|v| !v.is_empty())
            .ok_or(ProtocolError::MissingHandshakeField(AGENT_KEY_HEADER))?;

        Ok(Self {
            agent_id: AgentId::new(agent_id),
            agent_key: agent_key.to_string(),
        })
    }
}

impl std::fmt::Debug for Handshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handshake")
            .field("agent_id", &self.agent_id)
            .field("agent_key", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_in<'a>(map: &'a HashMap<&'static str, &'static str>) -> impl Fn(&str) -> Option<&'static str> + 'a {
        move |name| map.get(name).copied()
    }

    #[test]
    fn test_headers_parse_back() {
        let handshake = Handshake::new(AgentId::new("A1"), "s3cret");
        let map: HashMap<&str, String> = handshake
            .headers()
            .iter()
            .map(|(k, v)| (*k, v.to_string()))
            .collect();

        let parsed = Handshake::from_lookup(|name| map.get(name).map(String::as_str)).unwrap();
        assert_eq!(parsed, handshake);
    }

    #[test]
    fn test_missing_key() {
        let map = HashMap::from([(CLIENT_TYPE_HEADER, "agent"), (AGENT_ID_HEADER, "A1")]);
        let result = Handshake::from_lookup(lookup_in(&map));
        assert!(matches!(
            result,
            Err(ProtocolError::MissingHandshakeField(AGENT_KEY_HEADER))
        ));
    }

    #[test]
    fn test_wrong_client_type() {
        let map = HashMap::from([
            (CLIENT_TYPE_HEADER, "browser"),
            (AGENT_ID_HEADER, "A1"),
            (AGENT_KEY_HEADER, "k"),
        ]);
        let result = Handshake::from_lookup(lookup_in(&map));
        assert!(matches!(result, Err(ProtocolError::UnsupportedClientType(t)) if t == "browser"));
    }

    #[test]
    fn test_debug_redacts_key() {
        let handshake = Handshake::new(AgentId::new("A1"), "s3cret");
        let debug = format!("{:?}", handshake);
        assert!(!debug.contains("s3cret"));
    }
}

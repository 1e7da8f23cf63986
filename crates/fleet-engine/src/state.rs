//! Global engine state

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use fleet_core::config::EngineConfig;
use fleet_core::traits::CredentialStore;

use crate::auth::KeyStore;
use crate::command::CommandCorrelator;
use crate::connection::SessionRegistry;

/// Global state shared by every connection task and admin route
pub struct EngineState {
    /// Configuration
    pub config: EngineConfig,
    /// Live agent connections
    pub registry: Arc<SessionRegistry>,
    /// Outstanding remote commands
    pub correlator: Arc<CommandCorrelator>,
    /// Identity/secret validation
    pub credentials: Arc<dyn CredentialStore>,
    /// Cancelled on engine shutdown
    pub shutdown: CancellationToken,
}

impl EngineState {
    /// Create new engine state with an empty in-memory key store
    pub fn new(config: EngineConfig) -> Self {
        Self::with_credentials(config, Arc::new(KeyStore::new()))
    }

    /// Create new engine state with the provided credential store
    pub fn with_credentials(config: EngineConfig, credentials: Arc<dyn CredentialStore>) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let correlator = Arc::new(CommandCorrelator::new(
            Arc::clone(&registry),
            config.command_timeout,
        ));
        Self {
            config,
            registry,
            correlator,
            credentials,
            shutdown: CancellationToken::new(),
        }
    }

    /// Get the session registry
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Get the command correlator
    pub fn correlator(&self) -> &Arc<CommandCorrelator> {
        &self.correlator
    }
}

//! Agent key store

use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use rand::RngCore;
use sha2::{Digest, Sha256};

use fleet_core::traits::CredentialStore;
use fleet_core::{AgentIdentity, FleetError};
use fleet_protocol::AgentId;

/// Length of generated secrets in bytes
const SECRET_BYTES: usize = 32;

/// Credential store keeping SHA-256 digests of agent secrets
///
/// When created with [`KeyStore::open`] every change is written back to the
/// keys file, one `agent_id digest` pair per line.
#[derive(Debug, Default)]
pub struct KeyStore {
    /// Secret digests by agent ID
    digests: DashMap<AgentId, String>,
    /// Keys file, if persistent
    path: Option<PathBuf>,
}

impl KeyStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a store backed by a keys file, creating nothing until the first write
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut store = Self::new();
        if path.exists() {
            store.load_from_file(&path)?;
        } else {
            tracing::warn!("Keys file not found: {:?}", path);
        }
        store.path = Some(path);
        Ok(store)
    }

    /// Load digests from a keys file
    pub fn load_from_file(&mut self, path: &Path) -> Result<()> {
        tracing::info!("Loading agent keys from {:?}", path);

        let file =
            std::fs::File::open(path).with_context(|| format!("Failed to open {:?}", path))?;

        let reader = BufReader::new(file);
        let mut count = 0;

        for (line_num, line) in reader.lines().enumerate() {
            let line = line
                .with_context(|| format!("Failed to read line {} of {:?}", line_num + 1, path))?;
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some(id), Some(digest)) if is_digest(digest) => {
                    self.digests
                        .insert(AgentId::new(id), digest.to_ascii_lowercase());
                    count += 1;
                }
                _ => tracing::warn!(
                    "Skipping malformed entry on line {} of {:?}",
                    line_num + 1,
                    path
                ),
            }
        }

        tracing::info!("Loaded {} agent keys from {:?}", count, path);
        Ok(())
    }

    /// Write all digests to a keys file
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {:?}", parent))?;
        }

        let mut entries: Vec<(AgentId, String)> = self
            .digests
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        entries.sort();

        let mut file =
            std::fs::File::create(path).with_context(|| format!("Failed to create {:?}", path))?;
        writeln!(file, "# agent_id sha256(secret)")?;
        for (id, digest) in entries {
            writeln!(file, "{} {}", id, digest)?;
        }

        tracing::debug!("Saved {} agent keys to {:?}", self.len(), path);
        Ok(())
    }

    /// Register an identity whose secret is already known
    pub fn insert(&self, identity: &AgentIdentity) {
        self.digests
            .insert(identity.id.clone(), digest(&identity.secret_key));
    }

    /// Check whether an agent ID is known
    pub fn contains(&self, agent_id: &AgentId) -> bool {
        self.digests.contains_key(agent_id)
    }

    /// Number of known agents
    pub fn len(&self) -> usize {
        self.digests.len()
    }

    /// Check if the store is empty
    pub fn is_empty(&self) -> bool {
        self.digests.is_empty()
    }

    fn persist(&self) -> Result<(), FleetError> {
        match &self.path {
            Some(path) => self
                .save_to_file(path)
                .map_err(|e| FleetError::Credentials(format!("{:#}", e))),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl CredentialStore for KeyStore {
    async fn validate(&self, agent_id: &AgentId, secret_key: &str) -> bool {
        match self.digests.get(agent_id) {
            Some(stored) => constant_time_eq(stored.as_bytes(), digest(secret_key).as_bytes()),
            None => false,
        }
    }

    async fn issue(&self) -> Result<AgentIdentity, FleetError> {
        let id = AgentId::new(format!("agent-{}", uuid::Uuid::new_v4()));

        let mut secret = [0u8; SECRET_BYTES];
        rand::thread_rng().fill_bytes(&mut secret);
        let identity = AgentIdentity::new(id, hex::encode(secret));

        self.insert(&identity);
        self.persist()?;

        tracing::info!("Issued identity {}", identity.id);
        Ok(identity)
    }

    async fn revoke(&self, agent_id: &AgentId) -> Result<bool, FleetError> {
        let removed = self.digests.remove(agent_id).is_some();
        if removed {
            self.persist()?;
            tracing::info!("Revoked identity {}", agent_id);
        }
        Ok(removed)
    }
}

fn digest(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

fn is_digest(s: &str) -> bool {
    s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

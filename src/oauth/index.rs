//! Registration dedup index.
//!
//! Maps a client key (`client_name#base64url(sorted redirect uris)`) to the
//! upstream client id created for it. Entries never hold a secret: every
//! registered client is public.
//!
//! Reads and writes are not coordinated. Two identical registrations racing
//! past an empty index both create an upstream client and the later write
//! wins; the earlier client is orphaned but harmless.

use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::{Error, Result};

/// One dedup entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientIndexEntry {
    /// Dedup key
    pub client_key: String,
    /// Upstream client id
    pub client_id: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// Index storage failure.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// Filesystem failure
    #[error("index IO error: {0}")]
    Io(#[from] io::Error),

    /// Corrupt entry
    #[error("index entry is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Read or write exceeded the timeout
    #[error("index operation timed out")]
    Timeout,
}

/// Dedup store for registrations.
#[async_trait]
pub trait ClientIndex: Send + Sync + 'static {
    /// Look up the entry for `client_key`.
    async fn get(
        &self,
        client_key: &str,
    ) -> std::result::Result<Option<ClientIndexEntry>, IndexError>;

    /// Insert or overwrite an entry.
    async fn put(&self, entry: ClientIndexEntry) -> std::result::Result<(), IndexError>;
}

/// Process-local index.
#[derive(Default)]
pub struct InMemoryClientIndex {
    entries: DashMap<String, ClientIndexEntry>,
}

impl InMemoryClientIndex {
    /// Create an empty index
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ClientIndex for InMemoryClientIndex {
    async fn get(
        &self,
        client_key: &str,
    ) -> std::result::Result<Option<ClientIndexEntry>, IndexError> {
        Ok(self.entries.get(client_key).map(|e| e.value().clone()))
    }

    async fn put(&self, entry: ClientIndexEntry) -> std::result::Result<(), IndexError> {
        self.entries.insert(entry.client_key.clone(), entry);
        Ok(())
    }
}

/// One JSON file per entry, named by the SHA-256 of the client key.
pub struct FileClientIndex {
    base_dir: PathBuf,
}

impl FileClientIndex {
    /// Open (and create if needed) an index directory.
    pub fn new(base_dir: PathBuf) -> Result<Self> {
        if !base_dir.exists() {
            std::fs::create_dir_all(&base_dir).map_err(|e| {
                Error::Internal(format!("Failed to create client index dir: {e}"))
            })?;
        }

        Ok(Self { base_dir })
    }

    /// Open the index in the default location (`~/.mcp-authz/clients`).
    pub fn default_location() -> Result<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| Error::Internal("Cannot determine home directory".to_string()))?;

        Self::new(home.join(".mcp-authz").join("clients"))
    }

    fn entry_path(&self, client_key: &str) -> PathBuf {
        let hash = Sha256::digest(client_key.as_bytes());
        self.base_dir.join(format!("{}.json", hex::encode(hash)))
    }
}

#[async_trait]
impl ClientIndex for FileClientIndex {
    async fn get(
        &self,
        client_key: &str,
    ) -> std::result::Result<Option<ClientIndexEntry>, IndexError> {
        let path = self.entry_path(client_key);
        let content = match tokio::fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let entry: ClientIndexEntry = serde_json::from_slice(&content)?;
        // Hash collisions are not expected, but never return another key's entry
        Ok((entry.client_key == client_key).then_some(entry))
    }

    async fn put(&self, entry: ClientIndexEntry) -> std::result::Result<(), IndexError> {
        let path = self.entry_path(&entry.client_key);
        let tmp = path.with_extension("json.tmp");

        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&entry)?).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            let _ = tokio::fs::set_permissions(&tmp, perms).await;
        }

        tokio::fs::rename(&tmp, &path).await?;
        debug!(client_id = %entry.client_id, "Saved client index entry");
        Ok(())
    }
}

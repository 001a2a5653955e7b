//! File-backed chat store
//!
//! One JSON file per conversation key, named `<prefix><key><ext>`, inside a
//! directory that must already exist.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use agent_core::{
    error::{AgentError, Result},
    history::ChatStore,
    message::Message,
};
use async_trait::async_trait;

pub const DEFAULT_PREFIX: &str = "neuron_";
pub const DEFAULT_EXTENSION: &str = ".chat";

pub struct FileChatStore {
    directory: PathBuf,
    prefix: String,
    extension: String,
    /// Serialises writers of the same key
    key_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    staging_seq: AtomicU64,
}

impl FileChatStore {
    /// Store files under `directory`, which must exist
    pub fn new(directory: impl Into<PathBuf>) -> Result<Self> {
        let directory = directory.into();
        if !directory.is_dir() {
            return Err(AgentError::Persistence(format!(
                "chat history directory does not exist: {}",
                directory.display()
            )));
        }

        Ok(Self {
            directory,
            prefix: DEFAULT_PREFIX.into(),
            extension: DEFAULT_EXTENSION.into(),
            key_locks: Mutex::new(HashMap::new()),
            staging_seq: AtomicU64::new(0),
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// File backing `key`
    pub fn path_for(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.contains(['/', '\\']) || key.contains("..") {
            return Err(AgentError::Persistence(format!("invalid chat history key '{}'", key)));
        }
        Ok(self
            .directory
            .join(format!("{}{}{}", self.prefix, key, self.extension)))
    }

    fn key_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.key_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.to_string())
            .or_default()
            .clone()
    }

    /// Sibling of `path` no other write uses
    fn staging_path(&self, path: &Path) -> PathBuf {
        let seq = self.staging_seq.fetch_add(1, Ordering::Relaxed);
        let mut name = path.file_name().unwrap_or_default().to_os_string();
        name.push(format!(".{}.{}.tmp", std::process::id(), seq));
        path.with_file_name(name)
    }
}

fn persistence(action: &str, path: &Path, error: impl std::fmt::Display) -> AgentError {
    AgentError::Persistence(format!("failed to {} {}: {}", action, path.display(), error))
}

#[async_trait]
impl ChatStore for FileChatStore {
    async fn load(&self, key: &str) -> Result<Option<Vec<Message>>> {
        let path = self.path_for(key)?;

        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(persistence("read", &path, e)),
        };

        if content.trim().is_empty() {
            return Ok(Some(Vec::new()));
        }

        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| persistence("parse", &path, e))
    }

    async fn save(&self, key: &str, messages: &[Message]) -> Result<()> {
        let path = self.path_for(key)?;
        let content = serde_json::to_string(messages)?;

        let lock = self.key_lock(key);
        let _guard = lock.lock().await;

        // Write then rename so readers never see a half-written file
        let staging = self.staging_path(&path);
        if let Err(e) = tokio::fs::write(&staging, content).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(persistence("write", &staging, e));
        }
        tokio::fs::rename(&staging, &path)
            .await
            .map_err(|e| persistence("replace", &path, e))?;

        tracing::debug!(key, messages = messages.len(), "Saved chat history");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;

        let lock = self.key_lock(key);
        let _guard = lock.lock().await;
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| persistence("remove", &path, e))?;

        tracing::debug!(key, "Deleted chat history");
        Ok(())
    }
}

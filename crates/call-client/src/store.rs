use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use fusion_core::CallData;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum CallStoreError {
    #[error("active call store I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("active call record is corrupt: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("active call store unavailable: {0}")]
    Unavailable(String),
}

/// Durable home of the local user's active call, read back after a restart.
#[async_trait]
pub trait ActiveCallStore: Send + Sync {
    async fn load(&self) -> Result<Option<CallData>, CallStoreError>;
    async fn save(&self, call: &CallData) -> Result<(), CallStoreError>;
    async fn clear(&self) -> Result<(), CallStoreError>;
}

#[derive(Default)]
pub struct InMemoryActiveCallStore {
    slot: Mutex<Option<CallData>>,
}

impl InMemoryActiveCallStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ActiveCallStore for InMemoryActiveCallStore {
    async fn load(&self) -> Result<Option<CallData>, CallStoreError> {
        Ok(self.slot.lock().await.clone())
    }

    async fn save(&self, call: &CallData) -> Result<(), CallStoreError> {
        *self.slot.lock().await = Some(call.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<(), CallStoreError> {
        self.slot.lock().await.take();
        Ok(())
    }
}

/// Keeps the record as a JSON file. Writes go to a sibling temp file first and
/// are renamed into place, so a crash never leaves a half-written record.
pub struct FileActiveCallStore {
    path: PathBuf,
}

impl FileActiveCallStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<dir>/active-call-<username>.json`
    pub fn for_user(dir: impl AsRef<Path>, username: &str) -> Self {
        Self::new(dir.as_ref().join(format!("active-call-{username}.json")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl ActiveCallStore for FileActiveCallStore {
    async fn load(&self) -> Result<Option<CallData>, CallStoreError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn save(&self, call: &CallData) -> Result<(), CallStoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let bytes = serde_json::to_vec_pretty(call)?;
        let temp = self.temp_path();
        tokio::fs::write(&temp, bytes).await?;
        tokio::fs::rename(&temp, &self.path).await?;
        Ok(())
    }

    async fn clear(&self) -> Result<(), CallStoreError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

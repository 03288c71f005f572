//! Credential storage backends.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use client_sync_core::{Credential, Error, Result};

use crate::api::CredentialStorage;

/// Process-local storage. Useful for tests and for clients without a keychain.
#[derive(Debug, Default)]
pub struct MemoryCredentialStorage {
    slot: Mutex<Option<Credential>>,
}

impl MemoryCredentialStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_credential(credential: Credential) -> Self {
        Self {
            slot: Mutex::new(Some(credential)),
        }
    }

    /// Current stored value without going through the async trait.
    #[must_use]
    pub fn peek(&self) -> Option<Credential> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl CredentialStorage for MemoryCredentialStorage {
    async fn load(&self) -> Result<Option<Credential>> {
        Ok(self.peek())
    }

    async fn save(&self, credential: &Credential) -> Result<()> {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(credential.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }
}

/// JSON file on disk. Writes go to a sibling temp file that is then renamed
/// over the target, so a crash never leaves a half-written credential.
#[derive(Debug, Clone)]
pub struct FileCredentialStorage {
    path: PathBuf,
}

impl FileCredentialStorage {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;
    let file_name = path
        .file_name()
        .ok_or_else(|| Error::Storage(format!("not a file path: {}", path.display())))?;
    let mut tmp_name = file_name.to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = parent.join(tmp_name);

    let mut file = std::fs::File::create(&tmp_path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

#[async_trait]
impl CredentialStorage for FileCredentialStorage {
    async fn load(&self) -> Result<Option<Credential>> {
        let path = self.path.clone();
        run_blocking(move || match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        })
        .await
    }

    async fn save(&self, credential: &Credential) -> Result<()> {
        let path = self.path.clone();
        let bytes = serde_json::to_vec(credential)?;
        run_blocking(move || write_atomically(&path, &bytes)).await
    }

    async fn clear(&self) -> Result<()> {
        let path = self.path.clone();
        run_blocking(move || match std::fs::remove_file(&path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        })
        .await
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Internal(format!("credential storage task failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn credential() -> Credential {
        let expires = Utc
            .timestamp_opt(1_900_000_000, 0)
            .single()
            .expect("timestamp");
        Credential::new("access", "refresh", expires)
    }

    #[tokio::test]
    async fn memory_storage_round_trip() {
        let storage = MemoryCredentialStorage::new();
        assert!(storage.load().await.expect("load").is_none());
        storage.save(&credential()).await.expect("save");
        assert_eq!(storage.load().await.expect("load"), Some(credential()));
        storage.clear().await.expect("clear");
        assert!(storage.peek().is_none());
    }

    #[tokio::test]
    async fn file_storage_missing_file_is_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = FileCredentialStorage::new(dir.path().join("credential.json"));
        assert!(storage.load().await.expect("load").is_none());
        // Clearing a missing file is fine.
        storage.clear().await.expect("clear");
    }

    #[tokio::test]
    async fn file_storage_persists_and_clears() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("credential.json");
        let storage = FileCredentialStorage::new(&path);

        storage.save(&credential()).await.expect("save");
        assert!(path.exists());
        assert!(!dir.path().join("nested").join("credential.json.tmp").exists());

        let reopened = FileCredentialStorage::new(&path);
        assert_eq!(reopened.load().await.expect("load"), Some(credential()));

        reopened.clear().await.expect("clear");
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn file_storage_rejects_corrupt_contents() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("credential.json");
        std::fs::write(&path, b"{ not json").expect("write");
        let err = FileCredentialStorage::new(&path).load().await.unwrap_err();
        assert_eq!(err.error_type(), "TYPE_ERROR");
    }
}

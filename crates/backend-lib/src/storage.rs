// ============================
// roomhub-backend-lib/src/storage.rs
// ============================
//! Storage abstraction with flat-file implementation.
use crate::error::AppError;
use async_trait::async_trait;
use std::{
    fs,
    path::{Path, PathBuf},
};
use tokio::fs as tokio_fs;

/// Trait for durable per-room key/value storage backends
#[async_trait]
pub trait Storage: Send + Sync {
    /// Read the bytes stored under `key` for `room`, if any
    async fn get(&self, room: &str, key: &str) -> Result<Option<Vec<u8>>, AppError>;

    /// Store `value` under `key` for `room`
    async fn put(&self, room: &str, key: &str, value: &[u8]) -> Result<(), AppError>;
}

/// Flat-file implementation of the Storage trait
#[derive(Clone)]
pub struct FlatFileStorage {
    root: PathBuf,
}

impl FlatFileStorage {
    pub fn new<P: AsRef<Path>>(root: P) -> anyhow::Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("rooms"))?;
        Ok(Self { root })
    }

    fn key_path(&self, room: &str, key: &str) -> PathBuf {
        // Room names and state keys are client-supplied bytes; hex keeps
        // them filesystem-safe.
        self.root
            .join("rooms")
            .join(hex_name(room))
            .join(hex_name(key))
    }
}

fn hex_name(raw: &str) -> String {
    raw.bytes().map(|b| format!("{b:02x}")).collect()
}

#[async_trait]
impl Storage for FlatFileStorage {
    async fn get(&self, room: &str, key: &str) -> Result<Option<Vec<u8>>, AppError> {
        let path = self.key_path(room, key);
        match tokio_fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn put(&self, room: &str, key: &str, value: &[u8]) -> Result<(), AppError> {
        let path = self.key_path(room, key);
        if let Some(parent) = path.parent() {
            tokio_fs::create_dir_all(parent).await?;
        }
        tokio_fs::write(&path, value).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (FlatFileStorage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let storage = FlatFileStorage::new(temp_dir.path()).unwrap();
        (storage, temp_dir)
    }

    #[tokio::test]
    async fn test_missing_key_reads_none() {
        let (storage, _temp_dir) = setup();
        assert_eq!(storage.get("r1", "worldApps").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let (storage, _temp_dir) = setup();
        storage.put("r1", "crdt", b"abc").await.unwrap();
        assert_eq!(storage.get("r1", "crdt").await.unwrap(), Some(b"abc".to_vec()));
    }

    #[tokio::test]
    async fn test_rooms_are_isolated() {
        let (storage, _temp_dir) = setup();
        storage.put("r1", "crdt", b"one").await.unwrap();
        storage.put("r2", "crdt", b"two").await.unwrap();
        assert_eq!(storage.get("r1", "crdt").await.unwrap(), Some(b"one".to_vec()));
        assert_eq!(storage.get("r2", "crdt").await.unwrap(), Some(b"two".to_vec()));
    }

    #[tokio::test]
    async fn test_awkward_key_bytes_are_safe() {
        let (storage, _temp_dir) = setup();
        storage.put("r/.. 1", "../../etc", b"x").await.unwrap();
        assert_eq!(
            storage.get("r/.. 1", "../../etc").await.unwrap(),
            Some(b"x".to_vec())
        );
    }
}

use crate::error::LiftError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use uuid::Uuid;

/// Durable key-value storage used for the cache snapshot and session data.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, LiftError>;
    async fn set(&self, key: &str, value: &[u8]) -> Result<(), LiftError>;
    async fn remove(&self, key: &str) -> Result<(), LiftError>;
}

/// One file per key under a root directory.
#[derive(Clone, Debug)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let file_name: String = key
            .chars()
            .map(|ch| match ch {
                'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '-' | '_' => ch,
                _ => '_',
            })
            .collect();
        self.root.join(format!("{file_name}.json"))
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, LiftError> {
        match fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(LiftError::storage(format!("failed to read {key}: {err}"))),
        }
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), LiftError> {
        fs::create_dir_all(&self.root).await?;
        let path = self.path_for(key);
        let staging = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
        fs::write(&staging, value).await?;
        fs::rename(&staging, &path).await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), LiftError> {
        match fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// In-process store for tests and ephemeral sessions.
#[derive(Clone, Default)]
pub struct MemoryStore {
    values: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.lock().contains_key(key)
    }

    pub fn raw(&self, key: &str) -> Option<Vec<u8>> {
        self.values.lock().get(key).cloned()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, LiftError> {
        Ok(self.values.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), LiftError> {
        self.values.lock().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), LiftError> {
        self.values.lock().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn file_store_round_trips_and_removes() {
        let dir = TempDir::new().expect("temp dir");
        let store = FileStore::new(dir.path().join("kv"));
        assert_eq!(store.get("liftsync.session").await.unwrap(), None);

        store.set("liftsync.session", b"{\"a\":1}").await.unwrap();
        assert_eq!(
            store.get("liftsync.session").await.unwrap().as_deref(),
            Some(&b"{\"a\":1}"[..])
        );
        assert!(dir.path().join("kv/liftsync.session.json").exists());

        store.remove("liftsync.session").await.unwrap();
        store.remove("liftsync.session").await.unwrap();
        assert_eq!(store.get("liftsync.session").await.unwrap(), None);
    }

    #[tokio::test]
    async fn file_names_are_sanitized() {
        let dir = TempDir::new().expect("temp dir");
        let store = FileStore::new(dir.path());
        store.set("../escape/attempt", b"x").await.unwrap();
        assert!(dir.path().join(".._escape_attempt.json").exists());
    }
}

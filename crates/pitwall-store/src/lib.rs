//! Persistent entity store: one JSON document per (family, natural key).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "pitwall-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("document serialization failure: {0}")]
    Serde(#[from] serde_json::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Raw create/update/lookup primitives the reconciliation layer is built on.
///
/// Keys are natural keys and immutable; `put` on an existing key replaces the
/// document (last write wins). Callers serialize writes for a single key;
/// different keys may be written concurrently.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn get(&self, family: &str, key: &str) -> Result<Option<JsonValue>, StoreError>;
    async fn put(&self, family: &str, key: &str, document: JsonValue) -> Result<(), StoreError>;
    async fn list(&self, family: &str) -> Result<Vec<JsonValue>, StoreError>;
}

/// In-memory store for tests and embedded callers.
#[derive(Debug, Default)]
pub struct MemoryStore {
    documents: RwLock<HashMap<(String, String), JsonValue>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn get(&self, family: &str, key: &str) -> Result<Option<JsonValue>, StoreError> {
        let documents = self.documents.read().await;
        Ok(documents
            .get(&(family.to_string(), key.to_string()))
            .cloned())
    }

    async fn put(&self, family: &str, key: &str, document: JsonValue) -> Result<(), StoreError> {
        let mut documents = self.documents.write().await;
        documents.insert((family.to_string(), key.to_string()), document);
        Ok(())
    }

    async fn list(&self, family: &str) -> Result<Vec<JsonValue>, StoreError> {
        let documents = self.documents.read().await;
        let mut entries: Vec<(&String, &JsonValue)> = documents
            .iter()
            .filter(|((f, _), _)| f.as_str() == family)
            .map(|((_, k), v)| (k, v))
            .collect();
        entries.sort_by(|(a, _), (b, _)| a.cmp(b));
        Ok(entries.into_iter().map(|(_, v)| v.clone()).collect())
    }
}

/// File-backed store: `<root>/<family>/<key>.json`, written via a temp file
/// and an atomic rename so a crashed write never leaves a torn document.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)
            .await
            .with_context(|| format!("creating store root {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Natural keys may contain separators; the on-disk name keeps only
    /// filename-safe characters.
    fn file_name(key: &str) -> String {
        let safe: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '~'
                }
            })
            .collect();
        format!("{safe}.json")
    }

    fn document_path(&self, family: &str, key: &str) -> PathBuf {
        self.root.join(family).join(Self::file_name(key))
    }
}

#[async_trait]
impl EntityStore for FsStore {
    async fn get(&self, family: &str, key: &str) -> Result<Option<JsonValue>, StoreError> {
        let path = self.document_path(family, key);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    async fn put(&self, family: &str, key: &str, document: JsonValue) -> Result<(), StoreError> {
        let path = self.document_path(family, key);
        let parent = path.parent().expect("document path always has parent");
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating family directory {}", parent.display()))?;

        let bytes = serde_json::to_vec_pretty(&document)?;
        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp document {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp document {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp document {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(anyhow::Error::from(err)
                .context(format!(
                    "atomically renaming {} -> {}",
                    temp_path.display(),
                    path.display()
                ))
                .into());
        }

        debug!(family, key, path = %path.display(), "stored document");
        Ok(())
    }

    async fn list(&self, family: &str) -> Result<Vec<JsonValue>, StoreError> {
        let dir = self.root.join(family);
        let mut reader = match fs::read_dir(&dir).await {
            Ok(reader) => reader,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut paths = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .with_context(|| format!("reading family directory {}", dir.display()))?
        {
            let path = entry.path();
            if path.extension().map(|ext| ext == "json").unwrap_or(false) {
                paths.push(path);
            }
        }
        paths.sort();

        let mut documents = Vec::with_capacity(paths.len());
        for path in paths {
            let bytes = fs::read(&path)
                .await
                .with_context(|| format!("reading document {}", path.display()))?;
            documents.push(serde_json::from_slice(&bytes)?);
        }
        Ok(documents)
    }
}

//! Per-user scan history kept in local key/value storage
//!
//! Each user's history is one JSON array under the key `history_<user>`,
//! newest first. When the backing store runs out of room the list is
//! halved until it fits.

use crate::tour::{Source, TourResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use uuid::Uuid;

/// Most entries kept per user.
pub const MAX_HISTORY_ITEMS: usize = 50;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage quota exceeded ({needed} bytes, {quota} allowed)")]
    QuotaExceeded { needed: u64, quota: u64 },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Corrupt history data: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("History entry does not fit in storage")]
    TooLarge,
}

/// String key/value storage.
pub trait Storage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// One JSON file per key under a directory, each limited to `quota` bytes.
pub struct FileStorage {
    dir: PathBuf,
    quota: u64,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>, quota: u64) -> Self {
        Self {
            dir: dir.into(),
            quota,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        // Percent-encoding never emits '+', so the file name stays unique per key.
        let safe = urlencoding::encode(key).replace('%', "+");
        self.dir.join(format!("{}.json", safe))
    }
}

impl Storage for FileStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        match fs::read_to_string(self.path_for(key)) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let needed = value.len() as u64;
        if needed > self.quota {
            return Err(StorageError::QuotaExceeded {
                needed,
                quota: self.quota,
            });
        }
        fs::create_dir_all(&self.dir)?;

        // Write to temp file first, then rename (atomic)
        let path = self.path_for(key);
        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, value)?;
        fs::rename(&temp_path, &path)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory storage with an optional per-value quota.
#[derive(Default)]
pub struct MemoryStorage {
    values: Mutex<HashMap<String, String>>,
    quota: Option<u64>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota: u64) -> Self {
        Self {
            values: Mutex::new(HashMap::new()),
            quota: Some(quota),
        }
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let needed = value.len() as u64;
        if let Some(quota) = self.quota.filter(|q| needed > *q) {
            return Err(StorageError::QuotaExceeded { needed, quota });
        }
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.remove(key);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryItem {
    pub id: Uuid,
    pub landmark_name: String,
    pub confidence: f64,
    pub description: String,
    pub sources: Vec<Source>,
    pub language: String,
    pub scanned_at: DateTime<Utc>,
    /// Small preview image as a data URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
}

impl HistoryItem {
    pub fn from_result(result: &TourResult, language: &str, thumbnail: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            landmark_name: result.landmark.name.clone(),
            confidence: result.landmark.confidence,
            description: result.details.text.clone(),
            sources: result.details.sources.clone(),
            language: language.to_string(),
            scanned_at: Utc::now(),
            thumbnail,
        }
    }
}

pub struct HistoryStore<S: Storage> {
    storage: S,
}

impl<S: Storage> HistoryStore<S> {
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    fn key(user: &str) -> String {
        format!("history_{}", user)
    }

    /// Entries for `user`, newest first. Unreadable data counts as empty.
    pub fn list(&self, user: &str) -> Result<Vec<HistoryItem>, HistoryError> {
        let Some(raw) = self.storage.get(&Self::key(user))? else {
            return Ok(Vec::new());
        };
        match serde_json::from_str(&raw) {
            Ok(items) => Ok(items),
            Err(e) => {
                log::warn!("Discarding unreadable history for {}: {}", user, e);
                Ok(Vec::new())
            }
        }
    }

    /// Prepend `item`, keeping at most [`MAX_HISTORY_ITEMS`]. Returns how
    /// many entries were stored.
    pub fn save(&self, user: &str, item: HistoryItem) -> Result<usize, HistoryError> {
        let mut items = self.list(user)?;
        items.insert(0, item);
        items.truncate(MAX_HISTORY_ITEMS);

        let key = Self::key(user);
        loop {
            let raw = serde_json::to_string(&items)?;
            match self.storage.set(&key, &raw) {
                Ok(()) => return Ok(items.len()),
                Err(StorageError::QuotaExceeded { needed, quota }) => {
                    if items.len() <= 1 {
                        return Err(HistoryError::TooLarge);
                    }
                    let keep = items.len() / 2;
                    log::warn!(
                        "History for {} needs {} bytes of {}, trimming to {} entries",
                        user,
                        needed,
                        quota,
                        keep
                    );
                    items.truncate(keep);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub fn clear(&self, user: &str) -> Result<(), HistoryError> {
        self.storage.remove(&Self::key(user))?;
        Ok(())
    }
}

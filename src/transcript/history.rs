//! Bounded, persisted history of past conversation sessions.

use super::TranscriptEntry;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Sessions kept when no capacity is configured
pub const DEFAULT_HISTORY_CAPACITY: usize = 10;

#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("History I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("History format error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Frozen transcript of one finished session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub timestamp: DateTime<Utc>,
    pub transcript: Vec<TranscriptEntry>,
}

impl SessionSnapshot {
    /// Keeps only entries with content. Returns `None` when nothing is left.
    pub fn from_entries(entries: Vec<TranscriptEntry>, timestamp: DateTime<Utc>) -> Option<Self> {
        let transcript: Vec<TranscriptEntry> = entries
            .into_iter()
            .filter(TranscriptEntry::has_content)
            .map(|mut entry| {
                entry.is_final = true;
                entry
            })
            .collect();

        if transcript.is_empty() {
            None
        } else {
            Some(Self {
                timestamp,
                transcript,
            })
        }
    }
}

/// Newest-first ring of session snapshots.
#[derive(Debug, Clone)]
pub struct SessionHistory {
    snapshots: VecDeque<SessionSnapshot>,
    capacity: usize,
}

impl Default for SessionHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl SessionHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            snapshots: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Restore from persisted snapshots, assumed newest-first.
    pub fn from_snapshots(snapshots: Vec<SessionSnapshot>, capacity: usize) -> Self {
        let mut history = Self::new(capacity);
        history.snapshots = snapshots.into_iter().take(history.capacity).collect();
        history
    }

    /// Insert as newest, returning the evicted oldest snapshot if full.
    pub fn push(&mut self, snapshot: SessionSnapshot) -> Option<SessionSnapshot> {
        self.snapshots.push_front(snapshot);
        if self.snapshots.len() > self.capacity {
            self.snapshots.pop_back()
        } else {
            None
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &SessionSnapshot> {
        self.snapshots.iter()
    }

    pub fn to_vec(&self) -> Vec<SessionSnapshot> {
        self.snapshots.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Durable storage for the session history.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Load snapshots newest-first. Missing storage yields an empty list.
    async fn load(&self) -> Result<Vec<SessionSnapshot>, HistoryError>;

    /// Replace stored snapshots.
    async fn save(&self, snapshots: &[SessionSnapshot]) -> Result<(), HistoryError>;
}

/// JSON file store; writes go through a temp file and a rename.
#[derive(Debug, Clone)]
pub struct FileHistoryStore {
    path: PathBuf,
}

impl FileHistoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Where an unreadable history file is moved so the next save keeps it.
    pub fn corrupt_path(&self) -> PathBuf {
        self.sibling(".corrupt")
    }

    fn temp_path(&self) -> PathBuf {
        self.sibling(".tmp")
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(suffix);
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl HistoryStore for FileHistoryStore {
    async fn load(&self) -> Result<Vec<SessionSnapshot>, HistoryError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("No history at {}", self.path.display());
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        let snapshots: Vec<SessionSnapshot> = match serde_json::from_slice(&bytes) {
            Ok(snapshots) => snapshots,
            Err(e) => {
                let aside = self.corrupt_path();
                log::warn!(
                    "History at {} is unreadable, moving it to {}",
                    self.path.display(),
                    aside.display()
                );
                tokio::fs::rename(&self.path, &aside).await?;
                return Err(e.into());
            }
        };
        log::info!(
            "📚 Loaded {} past sessions from {}",
            snapshots.len(),
            self.path.display()
        );
        Ok(snapshots)
    }

    async fn save(&self, snapshots: &[SessionSnapshot]) -> Result<(), HistoryError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let json = serde_json::to_vec_pretty(snapshots)?;
        let temp = self.temp_path();
        tokio::fs::write(&temp, json).await?;
        tokio::fs::rename(&temp, &self.path).await?;

        log::debug!(
            "Saved {} sessions to {}",
            snapshots.len(),
            self.path.display()
        );
        Ok(())
    }
}

/// In-process store for embedding without a filesystem.
#[derive(Debug, Clone, Default)]
pub struct MemoryHistoryStore {
    snapshots: Arc<Mutex<Vec<SessionSnapshot>>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current contents; a poisoned lock reads as empty.
    pub fn snapshots(&self) -> Vec<SessionSnapshot> {
        self.snapshots
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn load(&self) -> Result<Vec<SessionSnapshot>, HistoryError> {
        Ok(self.snapshots())
    }

    async fn save(&self, snapshots: &[SessionSnapshot]) -> Result<(), HistoryError> {
        let mut guard = self
            .snapshots
            .lock()
            .map_err(|_| std::io::Error::other("history lock poisoned"))?;
        *guard = snapshots.to_vec();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcript::{EntryId, Speaker};
    use tempfile::tempdir;

    fn entry(id: u64, text: &str) -> TranscriptEntry {
        TranscriptEntry {
            id: EntryId(id),
            source: Speaker::User,
            text: text.to_string(),
            is_final: true,
            image_url: None,
        }
    }

    fn snapshot(label: &str) -> SessionSnapshot {
        SessionSnapshot {
            timestamp: Utc::now(),
            transcript: vec![entry(0, label)],
        }
    }

    #[test]
    fn test_eleventh_snapshot_evicts_oldest() {
        let mut history = SessionHistory::new(10);
        for i in 0..10 {
            assert!(history.push(snapshot(&format!("s{}", i))).is_none());
        }

        let evicted = history.push(snapshot("s10")).unwrap();

        assert_eq!(evicted.transcript[0].text, "s0");
        assert_eq!(history.len(), 10);
        let newest = history.iter().next().unwrap();
        assert_eq!(newest.transcript[0].text, "s10");
    }

    #[test]
    fn test_snapshot_drops_empty_entries() {
        let mut open = entry(2, "still talking");
        open.is_final = false;
        let entries = vec![entry(0, "  "), entry(1, "hello"), open];

        let snapshot = SessionSnapshot::from_entries(entries, Utc::now()).unwrap();

        assert_eq!(snapshot.transcript.len(), 2);
        assert!(snapshot.transcript.iter().all(|e| e.is_final));
        assert!(SessionSnapshot::from_entries(vec![entry(0, "")], Utc::now()).is_none());
    }

    #[test]
    fn test_restore_truncates_to_capacity() {
        let snapshots: Vec<_> = (0..5).map(|i| snapshot(&i.to_string())).collect();
        let history = SessionHistory::from_snapshots(snapshots, 3);
        assert_eq!(history.len(), 3);
        assert_eq!(history.iter().next().unwrap().transcript[0].text, "0");
    }

    #[tokio::test]
    async fn test_file_store_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let store = FileHistoryStore::new(dir.path().join("history.json"));
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_store_persists_across_instances() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("history.json");

        let store = FileHistoryStore::new(&path);
        store
            .save(&[snapshot("newest"), snapshot("older")])
            .await
            .unwrap();

        let reopened = FileHistoryStore::new(&path);
        let loaded = reopened.load().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].transcript[0].text, "newest");
        assert!(!store.temp_path().exists());
    }

    #[tokio::test]
    async fn test_file_store_rejects_corrupt_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("history.json");
        std::fs::write(&path, b"not json").unwrap();

        let store = FileHistoryStore::new(&path);
        let result = store.load().await;
        assert!(matches!(result, Err(HistoryError::Json(_))));

        // The unreadable file is kept aside and a later load starts empty
        assert!(!path.exists());
        assert_eq!(std::fs::read(store.corrupt_path()).unwrap(), b"not json");
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryHistoryStore::new();
        store.save(&[snapshot("a")]).await.unwrap();
        assert_eq!(store.load().await.unwrap().len(), 1);
    }
}

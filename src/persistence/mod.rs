//! Bridge between live documents and durable file storage.
//!
//! Storage only ever sees plain text: CRDT metadata is discarded on save and
//! a reload rebuilds content, not edit history.

mod memory;

pub use memory::MemoryFileStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::registry::{DocumentRegistry, LiveDocument};

/// Durable record of one file, owned by the storage collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub name: String,
    pub language: String,
    pub content: String,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("file {file_name:?} in room {room_id:?} has no stored record; saves only update existing records")]
    NotFound { room_id: String, file_name: String },
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[async_trait]
pub trait FileStore: Send + Sync {
    async fn get_file(&self, room_id: &str, file_name: &str) -> Result<Option<FileRecord>, StorageError>;

    async fn put_file(&self, room_id: &str, file_name: &str, content: &str) -> Result<(), StorageError>;
}

/// Language tag for a new file, from its extension.
pub fn language_for(file_name: &str) -> &'static str {
    let extension = file_name.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase());
    match extension.as_deref() {
        Some("py") => "python",
        Some("java") => "java",
        Some("cpp" | "cc" | "cxx" | "hpp" | "h" | "c++") => "c++",
        _ => "javascript",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SavedFile {
    pub chars: usize,
}

#[derive(Clone)]
pub struct PersistenceBridge {
    store: Arc<dyn FileStore>,
}

impl PersistenceBridge {
    pub fn new(store: Arc<dyn FileStore>) -> Self {
        Self { store }
    }

    /// Persisted content for hydration; a missing file is empty content.
    ///
    /// Only the registry's hydration path calls this.
    pub(crate) async fn load(&self, room_id: &str, file_name: &str) -> Result<String, StorageError> {
        match self.store.get_file(room_id, file_name).await? {
            Some(record) => {
                debug!("Loaded {}:{} ({} bytes, {})", room_id, file_name, record.content.len(), record.language);
                Ok(record.content)
            }
            None => {
                info!("No stored file for {}:{}, starting empty", room_id, file_name);
                Ok(String::new())
            }
        }
    }

    /// Current visible text of a live document.
    pub async fn flatten(&self, document: &LiveDocument) -> String {
        document.text().await
    }

    pub async fn save(&self, room_id: &str, file_name: &str, content: &str) -> Result<(), StorageError> {
        self.store.put_file(room_id, file_name, content).await
    }

    /// Flatten and save. The document stays the source of truth on failure
    /// and is left dirty so the next save retries.
    pub async fn save_document(&self, document: &LiveDocument) -> Result<SavedFile, StorageError> {
        // Cleared before flattening: an edit racing the save re-marks it.
        document.mark_clean();
        let content = self.flatten(document).await;
        let key = document.key();
        match self.save(&key.room_id, &key.file_name, &content).await {
            Ok(()) => {
                info!("Saved {} ({} bytes)", key, content.len());
                Ok(SavedFile {
                    chars: content.chars().count(),
                })
            }
            Err(e) => {
                document.mark_dirty();
                error!("Failed to save {}: {}", key, e);
                Err(e)
            }
        }
    }
}

/// Periodically save every dirty document held by the registry.
pub fn spawn_autosave(registry: Arc<DocumentRegistry>, bridge: PersistenceBridge, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let dirty: Vec<Arc<LiveDocument>> = registry
                .documents()
                .into_iter()
                .filter(|doc| doc.is_dirty())
                .collect();
            if dirty.is_empty() {
                continue;
            }
            debug!("Autosaving {} documents", dirty.len());
            for doc in dirty {
                // Failures are logged by save_document and retried next tick.
                let _ = bridge.save_document(&doc).await;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::DocKey;

    struct BrokenStore;

    #[async_trait]
    impl FileStore for BrokenStore {
        async fn get_file(&self, _room_id: &str, _file_name: &str) -> Result<Option<FileRecord>, StorageError> {
            Err(StorageError::Unavailable("down".into()))
        }

        async fn put_file(&self, _room_id: &str, _file_name: &str, _content: &str) -> Result<(), StorageError> {
            Err(StorageError::Unavailable("down".into()))
        }
    }

    #[test]
    fn language_follows_extension() {
        assert_eq!(language_for("main.py"), "python");
        assert_eq!(language_for("Main.JAVA"), "java");
        assert_eq!(language_for("solve.cpp"), "c++");
        assert_eq!(language_for("index.js"), "javascript");
        assert_eq!(language_for("main"), "javascript");
    }

    #[tokio::test]
    async fn save_document_writes_flattened_text() {
        let store = Arc::new(MemoryFileStore::new());
        store.insert_file("r1", "main.py", "").await;
        let bridge = PersistenceBridge::new(store.clone());

        let doc = LiveDocument::new(DocKey::parse("r1:main.py").unwrap(), 1, 4);
        doc.insert(0, "x = 1").await.unwrap();
        assert!(doc.is_dirty());

        let saved = bridge.save_document(&doc).await.unwrap();
        assert_eq!(saved.chars, 5);
        assert!(!doc.is_dirty());
        assert_eq!(store.content("r1", "main.py").await.as_deref(), Some("x = 1"));
    }

    #[tokio::test]
    async fn failed_save_keeps_document_dirty_and_intact() {
        let bridge = PersistenceBridge::new(Arc::new(BrokenStore));
        let doc = LiveDocument::new(DocKey::parse("r1:main.py").unwrap(), 1, 4);
        doc.insert(0, "keep me").await.unwrap();

        assert!(matches!(bridge.save_document(&doc).await, Err(StorageError::Unavailable(_))));
        assert!(doc.is_dirty());
        assert_eq!(doc.text().await, "keep me");
    }

    #[tokio::test]
    async fn missing_file_loads_as_empty() {
        let bridge = PersistenceBridge::new(Arc::new(MemoryFileStore::new()));
        assert_eq!(bridge.load("r1", "new.js").await.unwrap(), "");
    }
}

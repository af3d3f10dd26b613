use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{language_for, FileRecord, FileStore, StorageError};

/// Process-local file store, used when no database is configured.
#[derive(Default)]
pub struct MemoryFileStore {
    files: RwLock<HashMap<(String, String), FileRecord>>,
}

impl MemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or overwrite a file record. The language is taken from the
    /// file extension.
    pub async fn insert_file(&self, room_id: &str, file_name: &str, content: &str) {
        let record = FileRecord {
            name: file_name.to_string(),
            language: language_for(file_name).to_string(),
            content: content.to_string(),
        };
        self.files
            .write()
            .await
            .insert((room_id.to_string(), file_name.to_string()), record);
    }

    pub async fn content(&self, room_id: &str, file_name: &str) -> Option<String> {
        self.files
            .read()
            .await
            .get(&(room_id.to_string(), file_name.to_string()))
            .map(|record| record.content.clone())
    }
}

#[async_trait]
impl FileStore for MemoryFileStore {
    async fn get_file(&self, room_id: &str, file_name: &str) -> Result<Option<FileRecord>, StorageError> {
        Ok(self
            .files
            .read()
            .await
            .get(&(room_id.to_string(), file_name.to_string()))
            .cloned())
    }

    async fn put_file(&self, room_id: &str, file_name: &str, content: &str) -> Result<(), StorageError> {
        let mut files = self.files.write().await;
        match files.get_mut(&(room_id.to_string(), file_name.to_string())) {
            Some(record) => {
                record.content = content.to_string();
                Ok(())
            }
            None => Err(StorageError::NotFound {
                room_id: room_id.to_string(),
                file_name: file_name.to_string(),
            }),
        }
    }
}

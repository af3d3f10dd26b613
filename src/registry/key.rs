use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

const MAX_ROOM_ID_LEN: usize = 64;
const MAX_FILE_NAME_CHARS: usize = 255;

/// Identity of one shared file: the room it belongs to and its name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocKey {
    pub room_id: String,
    pub file_name: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("expected <roomId>:<fileName>, got {0:?}")]
    MissingSeparator(String),
    #[error("invalid room id {0:?}")]
    InvalidRoomId(String),
    #[error("invalid file name {0:?}")]
    InvalidFileName(String),
}

impl DocKey {
    /// Build a key from its parts, validating both.
    pub fn new(room_id: impl Into<String>, file_name: impl Into<String>) -> Result<Self, KeyError> {
        let room_id = room_id.into();
        let file_name = file_name.into();
        if !is_valid_room_id(&room_id) {
            return Err(KeyError::InvalidRoomId(room_id));
        }
        if !is_valid_file_name(&file_name) {
            return Err(KeyError::InvalidFileName(file_name));
        }
        Ok(Self { room_id, file_name })
    }

    /// Parse the composite `<roomId>:<fileName>` form used in socket paths.
    pub fn parse(raw: &str) -> Result<Self, KeyError> {
        let (room_id, file_name) = raw
            .split_once(':')
            .ok_or_else(|| KeyError::MissingSeparator(raw.to_string()))?;
        Self::new(room_id, file_name)
    }
}

impl fmt::Display for DocKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.room_id, self.file_name)
    }
}

pub fn is_valid_room_id(room_id: &str) -> bool {
    !room_id.is_empty()
        && room_id.len() <= MAX_ROOM_ID_LEN
        && room_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

pub fn is_valid_file_name(file_name: &str) -> bool {
    let chars = file_name.chars().count();
    chars > 0
        && chars <= MAX_FILE_NAME_CHARS
        && file_name != "."
        && file_name != ".."
        && !file_name
            .chars()
            .any(|c| c == '/' || c == '\\' || c == ':' || c.is_control())
}

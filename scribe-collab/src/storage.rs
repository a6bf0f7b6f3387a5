//! Persisted session format.
//!
//! A session serializes to a single object tree: the session holds user
//! rows and documents, each document holds its chunks, and everything
//! cross-references by stable user id. The on-disk rendering is JSON, which
//! keeps saved sessions diffable and hand-editable.
//!
//! ```text
//! session
//! ├── user*            id, name, colour, password
//! └── document*        owner, id, title, suffix, encoding
//!     └── chunk*       content, author (0 = no session user)
//! ```

use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("session file i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("session file is not valid: {0}")]
    Format(#[from] serde_json::Error),
}

/// One persisted user row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: u32,
    pub name: String,
    pub red: u8,
    pub green: u8,
    pub blue: u8,
    /// The stored login secret; compared via the salted login digest. Empty
    /// means the name is unprotected.
    #[serde(default)]
    pub password: String,
}

/// One persisted chunk of document content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub content: String,
    /// Author user id; 0 marks text no session user wrote.
    pub author: u32,
}

/// One persisted document with its content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub owner: u32,
    pub id: u32,
    pub title: String,
    pub suffix: u32,
    pub encoding: String,
    pub chunks: Vec<ChunkRecord>,
}

/// The whole-session object tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub users: Vec<UserRecord>,
    pub documents: Vec<DocumentRecord>,
}

impl SessionSnapshot {
    /// Writes the snapshot to `path` as pretty-printed JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), StorageError> {
        let rendered = serde_json::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    /// Reads a snapshot back from `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

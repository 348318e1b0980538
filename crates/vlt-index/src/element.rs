use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A live file in the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexElement {
    pub file_id: Uuid,
    /// Absolute path, no trailing slash
    pub path: String,
    pub mime_type: String,
    pub size: u64,
    /// Modification time, Unix seconds
    pub date: i64,
    /// Hex BLAKE3 of the content; empty when unknown
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub digest: String,
}

impl IndexElement {
    pub fn new(
        file_id: Uuid,
        path: impl Into<String>,
        mime_type: impl Into<String>,
        size: u64,
        date: i64,
    ) -> Self {
        Self {
            file_id,
            path: path.into(),
            mime_type: mime_type.into(),
            size,
            date,
            digest: String::new(),
        }
    }

    pub fn with_digest(mut self, digest: impl Into<String>) -> Self {
        self.digest = digest.into();
        self
    }
}

/// One position in the index arena.
///
/// Positions are stable until compaction: slot `i` belongs to chunk
/// `i / chunk_size`, so a deletion only ever touches one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Slot {
    Live(IndexElement),
    Tombstone,
}

impl Slot {
    pub fn live(&self) -> Option<&IndexElement> {
        match self {
            Slot::Live(el) => Some(el),
            Slot::Tombstone => None,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self, Slot::Tombstone)
    }
}

/// A direct child of a listed folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderEntry {
    pub name: String,
    /// Full path of the child
    pub path: String,
    pub is_dir: bool,
    /// Set for files
    pub element: Option<IndexElement>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexStats {
    /// Live elements
    pub file_count: usize,
    /// Tombstoned slots awaiting compaction
    pub tombstones: usize,
    /// Chunks the arena currently spans
    pub chunks: usize,
}

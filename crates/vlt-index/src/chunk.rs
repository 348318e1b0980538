//! Persisted chunk format
//!
//! ```json
//! {"version":1,"sequence":0,"hasNext":true,"elements":[
//!   {"path":"/a.txt","fileId":"…","mimeType":"text/plain","size":3,"date":1700000000,"digest":"…"},
//!   {"deleted":true}
//! ]}
//! ```
//!
//! Element order is slot order; the chunk ordinal alone places it in the arena.

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use vlt_core::{VltError, VltResult};

use crate::element::{IndexElement, Slot};

pub const CHUNK_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChunkRecord {
    version: u32,
    sequence: u32,
    has_next: bool,
    #[serde(default)]
    elements: Vec<ElementRecord>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ElementRecord {
    #[serde(default, skip_serializing_if = "is_false")]
    deleted: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    file_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    mime_type: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    size: u64,
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    date: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    digest: String,
}

fn is_false(v: &bool) -> bool {
    !*v
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

fn is_zero_i64(v: &i64) -> bool {
    *v == 0
}

impl From<&Slot> for ElementRecord {
    fn from(slot: &Slot) -> Self {
        match slot {
            Slot::Tombstone => Self {
                deleted: true,
                ..Default::default()
            },
            Slot::Live(el) => Self {
                deleted: false,
                path: el.path.clone(),
                file_id: Some(el.file_id),
                mime_type: el.mime_type.clone(),
                size: el.size,
                date: el.date,
                digest: el.digest.clone(),
            },
        }
    }
}

impl ElementRecord {
    fn into_slot(self, sequence: u32, offset: usize) -> VltResult<Slot> {
        if self.deleted {
            return Ok(Slot::Tombstone);
        }
        let Some(file_id) = self.file_id else {
            return Err(VltError::format(format!(
                "index chunk {sequence}: element {offset} has no file id"
            )));
        };
        if !self.path.starts_with('/') {
            return Err(VltError::format(format!(
                "index chunk {sequence}: element {offset} has invalid path {:?}",
                self.path
            )));
        }
        Ok(Slot::Live(IndexElement {
            file_id,
            path: self.path,
            mime_type: self.mime_type,
            size: self.size,
            date: self.date,
            digest: self.digest,
        }))
    }
}

/// A chunk read back from storage.
#[derive(Debug)]
pub struct DecodedChunk {
    pub has_next: bool,
    pub slots: Vec<Slot>,
}

pub fn encode_chunk(sequence: u32, has_next: bool, slots: &[Slot]) -> VltResult<Vec<u8>> {
    let record = ChunkRecord {
        version: CHUNK_VERSION,
        sequence,
        has_next,
        elements: slots.iter().map(ElementRecord::from).collect(),
    };
    serde_json::to_vec(&record)
        .map_err(|e| VltError::format(format!("encoding index chunk {sequence}: {e}")))
}

/// Decode chunk `expected`; the stored sequence must match its ordinal.
pub fn decode_chunk(expected: u32, data: &[u8]) -> VltResult<DecodedChunk> {
    let record: ChunkRecord = serde_json::from_slice(data)
        .map_err(|e| VltError::format(format!("decoding index chunk {expected}: {e}")))?;
    if record.version != CHUNK_VERSION {
        return Err(VltError::format(format!(
            "index chunk {expected}: unsupported version {}",
            record.version
        )));
    }
    if record.sequence != expected {
        return Err(VltError::format(format!(
            "index chunk {expected}: sequence number mismatch (stored {})",
            record.sequence
        )));
    }

    let slots = record
        .elements
        .into_iter()
        .enumerate()
        .map(|(offset, el)| el.into_slot(expected, offset))
        .collect::<VltResult<Vec<_>>>()?;
    Ok(DecodedChunk {
        has_next: record.has_next,
        slots,
    })
}

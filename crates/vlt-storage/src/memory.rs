//! In-process blob store; tags are per-store version numbers

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use vlt_core::{Tag, VltError, VltResult};

use crate::store::{Blob, BlobStore};

#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: Mutex<HashMap<String, Blob>>,
    version: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Sorted ids of every stored object.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Blob>> {
        self.objects.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_tag(&self) -> Tag {
        Tag::new(format!("v{}", self.version.fetch_add(1, Ordering::Relaxed) + 1))
    }
}

#[async_trait]
impl BlobStore for MemoryStore {
    async fn get(&self, id: &str) -> VltResult<Option<Blob>> {
        Ok(self.lock().get(id).cloned())
    }

    async fn get_range(
        &self,
        id: &str,
        start: u64,
        end: Option<u64>,
    ) -> VltResult<Option<Bytes>> {
        let objects = self.lock();
        let Some(blob) = objects.get(id) else {
            return Ok(None);
        };
        let len = blob.data.len() as u64;
        let start = start.min(len);
        let end = end.map_or(len, |e| e.clamp(start, len));
        Ok(Some(blob.data.slice(start as usize..end as usize)))
    }

    async fn set(&self, id: &str, data: Bytes, expected: Option<&Tag>) -> VltResult<Tag> {
        let mut objects = self.lock();
        match (objects.get(id), expected) {
            (Some(_), None) => {
                return Err(VltError::Conflict(format!("{id} already exists")));
            }
            (None, Some(tag)) => {
                return Err(VltError::Conflict(format!(
                    "{id} does not exist (expected tag {tag})"
                )));
            }
            (Some(current), Some(tag)) if &current.tag != tag => {
                return Err(VltError::Conflict(format!(
                    "{id} changed: tag {} != {tag}",
                    current.tag
                )));
            }
            _ => {}
        }

        let tag = self.next_tag();
        objects.insert(
            id.to_string(),
            Blob {
                data,
                tag: tag.clone(),
            },
        );
        Ok(tag)
    }

    async fn delete(&self, id: &str, tag: Option<&Tag>) -> VltResult<()> {
        let mut objects = self.lock();
        if let (Some(current), Some(tag)) = (objects.get(id), tag) {
            if &current.tag != tag {
                return Err(VltError::Conflict(format!(
                    "{id} changed: tag {} != {tag}",
                    current.tag
                )));
            }
        }
        objects.remove(id);
        Ok(())
    }
}

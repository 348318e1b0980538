//! [`BlobStore`] over any OpenDAL operator
//!
//! Tags are BLAKE3 hashes of the object contents, so they are stable across
//! services whether or not the service reports an ETag. Create-only writes use
//! the service's native `if_not_exists` when it advertises one; every other
//! condition is checked against the current contents right before writing.
//! That check-then-write window is covered by the caller's repository lock.

use async_trait::async_trait;
use bytes::Bytes;
use opendal::{ErrorKind, Operator};
use tracing::debug;
use vlt_core::{Tag, VltError, VltResult};

use crate::store::{Blob, BlobStore};

#[derive(Clone, Debug)]
pub struct OpendalStore {
    op: Operator,
}

impl OpendalStore {
    pub fn new(op: Operator) -> Self {
        Self { op }
    }

    pub fn operator(&self) -> &Operator {
        &self.op
    }

    pub async fn check_health(&self) -> VltResult<()> {
        crate::health::check_health(&self.op).await
    }

    async fn current_tag(&self, id: &str) -> VltResult<Option<Tag>> {
        match self.op.read(id).await {
            Ok(buf) => Ok(Some(content_tag(&buf.to_bytes()))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(storage_error("reading", id, e)),
        }
    }
}

pub fn content_tag(data: &[u8]) -> Tag {
    Tag::new(blake3::hash(data).to_hex().to_string())
}

fn storage_error(action: &str, id: &str, e: opendal::Error) -> VltError {
    VltError::Storage(format!("{action} {id}: {e}"))
}

#[async_trait]
impl BlobStore for OpendalStore {
    async fn get(&self, id: &str) -> VltResult<Option<Blob>> {
        match self.op.read(id).await {
            Ok(buf) => {
                let data = buf.to_bytes();
                let tag = content_tag(&data);
                Ok(Some(Blob { data, tag }))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(storage_error("reading", id, e)),
        }
    }

    async fn get_range(
        &self,
        id: &str,
        start: u64,
        end: Option<u64>,
    ) -> VltResult<Option<Bytes>> {
        // Clamp against the real size: services disagree on out-of-range reads
        let size = match self.op.stat(id).await {
            Ok(meta) => meta.content_length(),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(storage_error("stat", id, e)),
        };
        let start = start.min(size);
        let end = end.map_or(size, |e| e.clamp(start, size));
        if start == end {
            return Ok(Some(Bytes::new()));
        }

        match self.op.read_with(id).range(start..end).await {
            Ok(buf) => Ok(Some(buf.to_bytes())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(storage_error("reading range of", id, e)),
        }
    }

    async fn set(&self, id: &str, data: Bytes, expected: Option<&Tag>) -> VltResult<Tag> {
        let tag = content_tag(&data);
        match expected {
            None if self.op.info().full_capability().write_with_if_not_exists => {
                match self.op.write_with(id, data).if_not_exists(true).await {
                    Ok(_) => {}
                    Err(e) if e.kind() == ErrorKind::ConditionNotMatch => {
                        return Err(VltError::Conflict(format!("{id} already exists")));
                    }
                    Err(e) => return Err(storage_error("writing", id, e)),
                }
            }
            None => {
                let exists = self
                    .op
                    .exists(id)
                    .await
                    .map_err(|e| storage_error("stat", id, e))?;
                if exists {
                    return Err(VltError::Conflict(format!("{id} already exists")));
                }
                self.op
                    .write(id, data)
                    .await
                    .map_err(|e| storage_error("writing", id, e))?;
            }
            Some(expected) => {
                match self.current_tag(id).await? {
                    None => {
                        return Err(VltError::Conflict(format!(
                            "{id} does not exist (expected tag {expected})"
                        )));
                    }
                    Some(current) if &current != expected => {
                        return Err(VltError::Conflict(format!(
                            "{id} changed: tag {current} != {expected}"
                        )));
                    }
                    Some(_) => {}
                }
                self.op
                    .write(id, data)
                    .await
                    .map_err(|e| storage_error("writing", id, e))?;
            }
        }
        debug!(id, tag = %tag, "stored object");
        Ok(tag)
    }

    async fn delete(&self, id: &str, tag: Option<&Tag>) -> VltResult<()> {
        if let Some(expected) = tag {
            if let Some(current) = self.current_tag(id).await? {
                if &current != expected {
                    return Err(VltError::Conflict(format!(
                        "{id} changed: tag {current} != {expected}"
                    )));
                }
            }
        }
        self.op
            .delete(id)
            .await
            .map_err(|e| storage_error("deleting", id, e))?;
        debug!(id, "deleted object");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_store() -> OpendalStore {
        OpendalStore::new(
            Operator::new(opendal::services::Memory::default())
                .expect("memory operator")
                .finish(),
        )
    }

    #[test]
    fn test_content_tag_is_stable() {
        assert_eq!(content_tag(b"abc"), content_tag(b"abc"));
        assert_ne!(content_tag(b"abc"), content_tag(b"abd"));
        assert_eq!(content_tag(b"").as_str().len(), 64);
    }

    #[tokio::test]
    async fn test_set_get_roundtrip() {
        let store = memory_store();
        let tag = store
            .set("_index_0", Bytes::from_static(b"chunk"), None)
            .await
            .unwrap();

        let blob = store.get("_index_0").await.unwrap().unwrap();
        assert_eq!(blob.data, Bytes::from_static(b"chunk"));
        assert_eq!(blob.tag, tag);
    }

    #[tokio::test]
    async fn test_stale_tag_conflicts() {
        let store = memory_store();
        let first = store.set("k", Bytes::from_static(b"1"), None).await.unwrap();
        store
            .set("k", Bytes::from_static(b"2"), Some(&first))
            .await
            .unwrap();

        let err = store
            .set("k", Bytes::from_static(b"3"), Some(&first))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert!(store
            .set("k", Bytes::from_static(b"4"), None)
            .await
            .unwrap_err()
            .is_conflict());
    }
}

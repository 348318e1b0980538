use async_trait::async_trait;
use bytes::Bytes;
use vlt_core::{Tag, VltResult};

/// Object contents plus the tag to present on the next write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    pub data: Bytes,
    pub tag: Tag,
}

/// Flat id → bytes store with optimistic concurrency.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// `Ok(None)` when the object does not exist.
    async fn get(&self, id: &str) -> VltResult<Option<Blob>>;

    /// Bytes `[start, end)` of the object, clamped to its size; `end = None`
    /// reads to the end. `Ok(None)` when the object does not exist.
    async fn get_range(&self, id: &str, start: u64, end: Option<u64>)
        -> VltResult<Option<Bytes>>;

    /// Write the object.
    ///
    /// `expected = None` creates the object and fails with `Conflict` if it
    /// exists. `Some(tag)` replaces it only if its current tag equals `tag`.
    async fn set(&self, id: &str, data: Bytes, expected: Option<&Tag>) -> VltResult<Tag>;

    /// Remove the object. With a tag, fails with `Conflict` if the object
    /// changed since. Deleting a missing object succeeds.
    async fn delete(&self, id: &str, tag: Option<&Tag>) -> VltResult<()>;
}

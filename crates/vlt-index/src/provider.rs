//! Where index chunks live
//!
//! [`IndexProvider`] is the only seam between the index and storage: whole
//! chunk get/set/delete addressed by ordinal, with the same tag contract as
//! the blob store. [`BlobIndexProvider`] keeps each chunk as a codec container
//! named `_index_N`, encrypted under the repository master key.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;
use vlt_core::{Tag, VltError, VltResult};
use vlt_crypto::{decrypt_bytes, encrypt_bytes, MasterKey, Metadata};
use vlt_storage::BlobStore;

const INDEX_CONTENT_TYPE: &str = "application/json";

#[async_trait]
pub trait IndexProvider: Send + Sync {
    /// Plaintext of chunk `sequence` and its tag; `None` when it does not exist.
    async fn get(&self, sequence: u32) -> VltResult<Option<(Vec<u8>, Tag)>>;

    /// Store chunk `sequence`. Without `expected` the chunk must not exist yet.
    async fn set(&self, sequence: u32, data: Vec<u8>, expected: Option<&Tag>) -> VltResult<Tag>;

    async fn delete(&self, sequence: u32, tag: Option<&Tag>) -> VltResult<()>;
}

pub fn chunk_object_id(sequence: u32) -> String {
    format!("_index_{sequence}")
}

pub struct BlobIndexProvider {
    store: Arc<dyn BlobStore>,
    master: MasterKey,
}

impl BlobIndexProvider {
    pub fn new(store: Arc<dyn BlobStore>, master: MasterKey) -> Self {
        Self { store, master }
    }
}

#[async_trait]
impl IndexProvider for BlobIndexProvider {
    async fn get(&self, sequence: u32) -> VltResult<Option<(Vec<u8>, Tag)>> {
        let id = chunk_object_id(sequence);
        let Some(blob) = self.store.get(&id).await? else {
            return Ok(None);
        };
        let (metadata, plaintext) = decrypt_bytes(&blob.data, &self.master).await?;
        if metadata.content_type != INDEX_CONTENT_TYPE {
            return Err(VltError::format(format!(
                "{id}: unexpected content type {:?}",
                metadata.content_type
            )));
        }
        debug!(sequence, bytes = plaintext.len(), "read index chunk");
        Ok(Some((plaintext, blob.tag)))
    }

    async fn set(&self, sequence: u32, data: Vec<u8>, expected: Option<&Tag>) -> VltResult<Tag> {
        let id = chunk_object_id(sequence);
        let metadata = Metadata::new("index", INDEX_CONTENT_TYPE, data.len() as u64);
        let sealed = encrypt_bytes(&data, &metadata, &self.master).await?;
        let tag = self.store.set(&id, Bytes::from(sealed), expected).await?;
        debug!(sequence, tag = %tag, "wrote index chunk");
        Ok(tag)
    }

    async fn delete(&self, sequence: u32, tag: Option<&Tag>) -> VltResult<()> {
        self.store.delete(&chunk_object_id(sequence), tag).await
    }
}

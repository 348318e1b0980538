//! Opening, unlocking and using a repository
//!
//! Object layout inside the store:
//! ```text
//! _info.json                     descriptor (key slots), unencrypted
//! _index_0, _index_1, …          index chunks, codec containers
//! <dp>/<id[0..2]>/<id[2..4]>/<id> one codec container per file
//! ```

use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use secrecy::SecretString;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vlt_core::config::{IndexConfig, VltConfig};
use vlt_core::{Tag, VltError, VltResult};
use vlt_crypto::{
    decrypt, decrypt_packages, encrypt, read_header, Credentials, DecryptOptions, KdfParams,
    KeyRing, KeySealer, MasterKey, Metadata, MetadataAction, RequestRange, SlotKind,
    MAX_HEADER_LEN, PACKAGE_OVERHEAD, PACKAGE_SIZE,
};
use vlt_index::{BlobIndexProvider, FolderEntry, Index, IndexElement, IndexStats};
use vlt_storage::{build_operator, BlobStore, OpendalStore, S3Credentials};

use crate::cache::{CachedHeader, HeaderCache};
use crate::descriptor::{RepoDescriptor, DESCRIPTOR_ID};

/// How [`Session::add_file`] stores a file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddOptions {
    pub mime_type: String,
    /// Modification time, Unix seconds
    pub date: i64,
    /// Replace a file already stored at the same path
    pub force: bool,
}

/// Header plus package 0: everything needed to read a file's metadata
const HEAD_FETCH_LEN: u64 = (2 + MAX_HEADER_LEN + PACKAGE_SIZE + PACKAGE_OVERHEAD) as u64;

/// Storage id of a file's container: `dp/ab/cd/abcd…`
pub fn object_id(data_path: &str, file_id: &Uuid) -> String {
    let id = file_id.to_string();
    format!("{data_path}/{}/{}/{id}", &id[0..2], &id[2..4])
}

/// Build the configured blob store.
pub fn store_from_config(config: &VltConfig) -> VltResult<Arc<dyn BlobStore>> {
    let op = build_operator(&config.storage, S3Credentials::from_env().as_ref())
        .context("building storage operator")?;
    Ok(Arc::new(OpendalStore::new(op)))
}

/// A repository whose descriptor has been read but not unlocked.
pub struct Repository {
    store: Arc<dyn BlobStore>,
    descriptor: RepoDescriptor,
    tag: Tag,
    index_config: IndexConfig,
}

impl Repository {
    /// Create a repository protected by one passphrase.
    ///
    /// Fails with a user error if the store already holds a descriptor.
    pub async fn init(
        store: Arc<dyn BlobStore>,
        passphrase: &SecretString,
        kdf: &KdfParams,
    ) -> VltResult<Self> {
        if store.get(DESCRIPTOR_ID).await?.is_some() {
            return Err(VltError::user("a repository already exists at this location"));
        }

        let master = MasterKey::generate();
        let mut ring = KeyRing::new();
        let slot = ring.add_passphrase_slot(&master, passphrase, kdf)?;
        let descriptor = RepoDescriptor::new(ring.into_slots());

        let tag = match store
            .set(DESCRIPTOR_ID, Bytes::from(descriptor.encode()?), None)
            .await
        {
            Ok(tag) => tag,
            Err(e) if e.is_conflict() => {
                return Err(VltError::user("a repository already exists at this location"))
            }
            Err(e) => return Err(e),
        };
        info!(repo = %descriptor.id, slot = %slot, "initialized repository");

        Ok(Self {
            store,
            descriptor,
            tag,
            index_config: IndexConfig::default(),
        })
    }

    pub async fn open(store: Arc<dyn BlobStore>) -> VltResult<Self> {
        let blob = store
            .get(DESCRIPTOR_ID)
            .await?
            .ok_or_else(|| VltError::NotFound("no repository at this location".into()))?;
        let descriptor = RepoDescriptor::decode(&blob.data)?;
        debug!(repo = %descriptor.id, keys = descriptor.keys.len(), "opened repository");
        Ok(Self {
            store,
            descriptor,
            tag: blob.tag,
            index_config: IndexConfig::default(),
        })
    }

    /// `init` against the configured store, with the configured KDF cost and
    /// index settings.
    pub async fn init_from_config(config: &VltConfig, passphrase: &SecretString) -> VltResult<Self> {
        let store = store_from_config(config)?;
        let kdf = KdfParams::from_config(&config.crypto);
        Ok(Self::init(store, passphrase, &kdf)
            .await?
            .with_index_config(config.index.clone()))
    }

    pub async fn open_from_config(config: &VltConfig) -> VltResult<Self> {
        let store = store_from_config(config)?;
        Ok(Self::open(store)
            .await?
            .with_index_config(config.index.clone()))
    }

    pub fn with_index_config(mut self, index_config: IndexConfig) -> Self {
        self.index_config = index_config;
        self
    }

    pub fn descriptor(&self) -> &RepoDescriptor {
        &self.descriptor
    }

    pub fn id(&self) -> Uuid {
        self.descriptor.id
    }

    pub fn list_keys(&self) -> Vec<(String, SlotKind)> {
        self.descriptor.keyring().list()
    }

    /// Unlock with `credentials` and load the index.
    pub async fn unlock(self, credentials: &Credentials<'_>) -> VltResult<Session> {
        let (master, active_slot) = self.descriptor.keyring().unlock(credentials)?;

        let provider = BlobIndexProvider::new(self.store.clone(), master.clone());
        let index = Index::new(Arc::new(provider), &self.index_config)?;
        index.refresh(false).await?;
        info!(repo = %self.descriptor.id, slot = %active_slot, "repository unlocked");

        Ok(Session {
            store: self.store,
            data_path: self.descriptor.data_path.clone(),
            repo_id: self.descriptor.id,
            descriptor: Mutex::new(DescriptorState {
                descriptor: self.descriptor,
                tag: self.tag,
            }),
            master,
            active_slot,
            index,
            cache: HeaderCache::default(),
        })
    }
}

struct DescriptorState {
    descriptor: RepoDescriptor,
    tag: Tag,
}

/// An unlocked repository.
///
/// Mutations assume a single writer per repository; the store's tag checks
/// turn a concurrent writer into `VltError::Conflict`.
pub struct Session {
    store: Arc<dyn BlobStore>,
    data_path: String,
    repo_id: Uuid,
    descriptor: Mutex<DescriptorState>,
    master: MasterKey,
    active_slot: String,
    index: Index,
    cache: HeaderCache,
}

impl Session {
    pub fn repo_id(&self) -> Uuid {
        self.repo_id
    }

    /// Id of the key slot that unlocked this session.
    pub fn active_slot(&self) -> &str {
        &self.active_slot
    }

    pub fn index(&self) -> &Index {
        &self.index
    }

    fn object_id(&self, file_id: &Uuid) -> String {
        object_id(&self.data_path, file_id)
    }

    /// Encrypt `reader` into a new object and index it at `path`.
    ///
    /// `size` must be the exact stream length; it is recorded in the object's
    /// metadata before the content is read. If the index cannot be updated
    /// the object is deleted again. With `force` an existing file at `path`
    /// is replaced: its entry goes in the same index flush and its object is
    /// deleted afterwards.
    pub async fn add_file<R>(
        &self,
        reader: &mut R,
        path: &str,
        size: u64,
        opts: &AddOptions,
        cancel: &CancellationToken,
    ) -> VltResult<IndexElement>
    where
        R: AsyncRead + Unpin,
    {
        vlt_index::path::validate_file_path(path)?;
        let existing = self.index.get_file_by_path(path).await?;
        if existing.is_some() && !opts.force {
            return Err(VltError::user(format!("file already exists: {path}")));
        }

        let file_id = Uuid::new_v4();
        let name = path.rsplit('/').next().unwrap_or(path);
        let metadata = Metadata::new(name, opts.mime_type.as_str(), size);
        let mut sealed = Vec::new();
        let summary = encrypt(reader, &mut sealed, &metadata, &self.master, cancel).await?;
        if summary.content_bytes != size {
            return Err(VltError::user(format!(
                "{path}: expected {size} bytes, read {}",
                summary.content_bytes
            )));
        }

        let object = self.object_id(&file_id);
        self.store.set(&object, Bytes::from(sealed), None).await?;

        let element = IndexElement::new(file_id, path, opts.mime_type.as_str(), size, opts.date)
            .with_digest(summary.digest_hex());
        if let Err(e) = self.index_new_file(element.clone(), existing.as_ref()).await {
            if let Err(cleanup) = self.store.delete(&object, None).await {
                warn!(object = %object, error = %cleanup, "failed to remove unindexed object");
            }
            return Err(e);
        }

        if let Some(old) = existing {
            self.cache.remove(&old.file_id);
            let old_object = self.object_id(&old.file_id);
            if let Err(e) = self.store.delete(&old_object, None).await {
                warn!(object = %old_object, error = %e, "failed to delete replaced object");
            }
            info!(path, file_id = %file_id, replaced = %old.file_id, size, "replaced file");
        } else {
            info!(path, file_id = %file_id, size, packages = summary.packages, "added file");
        }
        Ok(element)
    }

    /// Add `element` to the index, tombstoning `replaces` first, and persist.
    /// On failure the in-memory index is reloaded from storage.
    async fn index_new_file(
        &self,
        element: IndexElement,
        replaces: Option<&IndexElement>,
    ) -> VltResult<()> {
        let staged = async {
            if let Some(old) = replaces {
                self.index.delete_file(&old.path).await?;
            }
            self.index.add_file(element).await
        }
        .await;
        match staged {
            Ok(_) => self.persist_index().await,
            Err(e) => {
                if replaces.is_some() {
                    if let Err(reload) = self.index.refresh(true).await {
                        warn!(error = %reload, "reloading the index after a failed replace");
                    }
                }
                Err(e)
            }
        }
    }

    pub async fn add_bytes(
        &self,
        path: &str,
        mime_type: &str,
        data: &[u8],
        date: i64,
    ) -> VltResult<IndexElement> {
        let opts = AddOptions {
            mime_type: mime_type.to_string(),
            date,
            force: false,
        };
        self.add_file(
            &mut &data[..],
            path,
            data.len() as u64,
            &opts,
            &CancellationToken::new(),
        )
        .await
    }

    /// Decrypt a whole file into `writer`; returns its metadata.
    pub async fn read_file<W>(
        &self,
        file_id: &Uuid,
        writer: &mut W,
        cancel: &CancellationToken,
    ) -> VltResult<Metadata>
    where
        W: AsyncWrite + Unpin,
    {
        let object = self.object_id(file_id);
        let blob = self
            .store
            .get(&object)
            .await?
            .ok_or_else(|| VltError::NotFound(format!("file {file_id}")))?;

        let mut metadata = Metadata::default();
        decrypt(
            &mut &blob.data[..],
            writer,
            &self.master,
            |m, _| {
                metadata = m.clone();
                MetadataAction::Continue
            },
            cancel,
        )
        .await?;
        debug!(file_id = %file_id, bytes = metadata.size, "read file");
        Ok(metadata)
    }

    /// Decrypt `length` bytes from `start` (0 reads to the end) into `writer`.
    ///
    /// Only the packages covering the range are fetched. The returned range is
    /// clamped to the file size and carries the `Content-Range` value.
    pub async fn read_range<W>(
        &self,
        file_id: &Uuid,
        start: u64,
        length: u64,
        writer: &mut W,
        cancel: &CancellationToken,
    ) -> VltResult<RequestRange>
    where
        W: AsyncWrite + Unpin,
    {
        let cached = self.header(file_id).await?;
        let mut range = RequestRange::new(
            start,
            length,
            cached.header.encoded_len as u64,
            cached.metadata_len as u64,
        )?;
        range.set_file_size(cached.metadata.size);
        if range.is_empty() {
            return Ok(range);
        }

        let object = self.object_id(file_id);
        let data = self
            .store
            .get_range(&object, range.start_bytes(), range.end_bytes())
            .await?
            .ok_or_else(|| VltError::NotFound(format!("file {file_id}")))?;
        let start_sequence = u32::try_from(range.start_package())
            .map_err(|_| VltError::user(format!("range start {start} is out of bounds")))?;
        let opts = DecryptOptions {
            start_sequence,
            skip: range.skip_beginning(),
            length: (range.length > 0).then_some(range.length),
        };
        decrypt_packages(
            &mut &data[..],
            writer,
            &cached.header,
            &self.master,
            &opts,
            |_, _| MetadataAction::Continue,
            cancel,
        )
        .await?;
        debug!(file_id = %file_id, range = %range, fetched = data.len(), "read range");
        Ok(range)
    }

    /// Metadata stored in a file's first package.
    pub async fn metadata(&self, file_id: &Uuid) -> VltResult<Metadata> {
        Ok(self.header(file_id).await?.metadata.clone())
    }

    /// Container header and metadata, fetching only header and package 0.
    async fn header(&self, file_id: &Uuid) -> VltResult<Arc<CachedHeader>> {
        if let Some(hit) = self.cache.get(file_id) {
            return Ok(hit);
        }

        let object = self.object_id(file_id);
        let data = self
            .store
            .get_range(&object, 0, Some(HEAD_FETCH_LEN))
            .await?
            .ok_or_else(|| VltError::NotFound(format!("file {file_id}")))?;
        let mut reader = &data[..];
        let header = read_header(&mut reader).await?;

        let mut captured = None;
        decrypt_packages(
            &mut reader,
            &mut tokio::io::sink(),
            &header,
            &self.master,
            &DecryptOptions::default(),
            |m, len| {
                captured = Some((m.clone(), len));
                MetadataAction::Stop
            },
            &CancellationToken::new(),
        )
        .await?;
        let (metadata, metadata_len) =
            captured.ok_or_else(|| VltError::format(format!("{object}: no metadata")))?;

        Ok(self.cache.insert(
            *file_id,
            CachedHeader {
                header,
                metadata,
                metadata_len,
            },
        ))
    }

    /// Remove one file (`/a/b`) or a folder's contents (`/a/*`).
    ///
    /// The index is persisted before any object is deleted; objects that
    /// fail to delete are logged and left behind.
    pub async fn remove(&self, target: &str) -> VltResult<Vec<(Uuid, String)>> {
        let (ids, paths) = self.index.delete_file(target).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.persist_index().await?;

        for id in &ids {
            self.cache.remove(id);
            let object = self.object_id(id);
            if let Err(e) = self.store.delete(&object, None).await {
                warn!(object = %object, error = %e, "failed to delete removed object");
            }
        }
        info!(target, removed = ids.len(), "removed files");
        Ok(ids.into_iter().zip(paths).collect())
    }

    pub async fn list_folder(&self, folder: &str) -> VltResult<Vec<FolderEntry>> {
        self.index.list_folder(folder).await
    }

    pub async fn get_file_by_path(&self, path: &str) -> VltResult<Option<IndexElement>> {
        self.index.get_file_by_path(path).await
    }

    pub async fn get_file_by_id(&self, file_id: &Uuid) -> VltResult<Option<IndexElement>> {
        self.index.get_file_by_id(file_id).await
    }

    pub async fn stat(&self) -> VltResult<IndexStats> {
        self.index.stat().await
    }

    /// Reload the index from storage, dropping anything not yet persisted.
    pub async fn refresh(&self) -> VltResult<()> {
        self.index.refresh(true).await
    }

    /// Compact the index if enough of it is tombstones; returns whether it did.
    pub async fn compact(&self) -> VltResult<bool> {
        if !self.index.compact().await? {
            return Ok(false);
        }
        self.persist_index().await?;
        Ok(true)
    }

    /// Flush the index; on failure reload it so memory matches storage again.
    async fn persist_index(&self) -> VltResult<()> {
        let Err(e) = self.index.flush().await else {
            return Ok(());
        };
        if let Err(reload) = self.index.refresh(true).await {
            warn!(error = %reload, "reloading the index after a failed flush");
        }
        Err(e)
    }

    pub async fn list_keys(&self) -> Vec<(String, SlotKind)> {
        self.descriptor.lock().await.descriptor.keyring().list()
    }

    pub async fn add_passphrase_key(
        &self,
        passphrase: &SecretString,
        params: &KdfParams,
    ) -> VltResult<String> {
        self.update_keys(|ring| ring.add_passphrase_slot(&self.master, passphrase, params))
            .await
    }

    pub async fn add_sealed_key(
        &self,
        sealer: &dyn KeySealer,
        recipient: &str,
    ) -> VltResult<String> {
        self.update_keys(|ring| ring.add_sealed_slot(&self.master, sealer, recipient))
            .await
    }

    /// Remove a key slot. The slot that unlocked this session and the last
    /// remaining slot cannot be removed.
    pub async fn remove_key(&self, id: &str) -> VltResult<()> {
        self.update_keys(|ring| ring.remove_slot(id, &self.active_slot).map(|_| ()))
            .await
    }

    /// Apply `change` to the key ring and persist the descriptor with its tag.
    async fn update_keys<T>(
        &self,
        change: impl FnOnce(&mut KeyRing) -> VltResult<T>,
    ) -> VltResult<T> {
        let mut state = self.descriptor.lock().await;
        let mut ring = state.descriptor.keyring();
        let out = change(&mut ring)?;

        let updated = RepoDescriptor {
            keys: ring.into_slots(),
            ..state.descriptor.clone()
        };
        updated.validate()?;
        let tag = self
            .store
            .set(
                DESCRIPTOR_ID,
                Bytes::from(updated.encode()?),
                Some(&state.tag),
            )
            .await?;
        info!(keys = updated.keys.len(), "updated repository keys");
        state.descriptor = updated;
        state.tag = tag;
        Ok(out)
    }
}

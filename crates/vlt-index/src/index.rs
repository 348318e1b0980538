//! The in-memory index and its chunked persistence
//!
//! Mutations (`add_file`, `delete_file`, `compact`) only touch memory and mark
//! the chunks they changed dirty; `flush` writes exactly those chunks. Every
//! chunk write carries the tag from the last read or write of that chunk, so
//! a concurrent writer surfaces as `VltError::Conflict` instead of a lost
//! update. Conflicts are never retried here.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;
use vlt_core::config::IndexConfig;
use vlt_core::{Tag, VltError, VltResult};

use crate::chunk::{decode_chunk, encode_chunk};
use crate::element::{FolderEntry, IndexElement, IndexStats, Slot};
use crate::path::{self, DeleteTarget};
use crate::provider::IndexProvider;
use crate::tree::IndexTreeNode;

#[derive(Debug, Default)]
struct State {
    loaded: bool,
    slots: Vec<Slot>,
    /// Tombstoned positions, lowest reused first
    deleted: BTreeSet<usize>,
    by_id: HashMap<Uuid, usize>,
    tree: IndexTreeNode,
    /// Tag of each stored chunk by ordinal; `None` for chunks never written
    tags: Vec<Option<Tag>>,
    dirty: BTreeSet<u32>,
}

impl State {
    fn from_slots(slots: Vec<Slot>, tags: Vec<Option<Tag>>) -> VltResult<Self> {
        let mut state = State {
            loaded: true,
            slots,
            tags,
            ..Default::default()
        };
        state.reindex()?;
        Ok(state)
    }

    /// Rebuild the tombstone set, id map and tree from the arena.
    fn reindex(&mut self) -> VltResult<()> {
        self.deleted.clear();
        self.by_id.clear();
        let mut tree = IndexTreeNode::root();
        for (pos, slot) in self.slots.iter().enumerate() {
            let Some(el) = slot.live() else {
                self.deleted.insert(pos);
                continue;
            };
            if self.by_id.insert(el.file_id, pos).is_some() {
                return Err(VltError::format(format!(
                    "index lists file id {} more than once",
                    el.file_id
                )));
            }
            if tree.find(&el.path).is_some_and(|n| n.element.is_some()) {
                return Err(VltError::format(format!(
                    "index lists path {} more than once",
                    el.path
                )));
            }
            tree.insert(&el.path, pos);
        }
        self.tree = tree;
        Ok(())
    }

    fn element(&self, pos: usize) -> Option<&IndexElement> {
        self.slots.get(pos).and_then(Slot::live)
    }
}

/// Number of chunks needed for `len` slots; an empty index still has chunk 0.
fn chunk_count(len: usize, chunk_size: usize) -> usize {
    len.div_ceil(chunk_size).max(1)
}

fn chunk_of(pos: usize, chunk_size: usize) -> u32 {
    (pos / chunk_size) as u32
}

pub struct Index {
    provider: Arc<dyn IndexProvider>,
    chunk_size: usize,
    compact_threshold: f64,
    state: RwLock<State>,
    /// Serializes refreshes so concurrent callers share one fetch
    refresh_lock: Mutex<()>,
    /// Bumped after every completed refresh
    generation: AtomicU64,
}

impl Index {
    pub fn new(provider: Arc<dyn IndexProvider>, config: &IndexConfig) -> VltResult<Self> {
        if config.chunk_size == 0 {
            return Err(VltError::Config("index.chunk_size must be positive".into()));
        }
        if !(0.0..1.0).contains(&config.compact_threshold) {
            return Err(VltError::Config(
                "index.compact_threshold must be in [0, 1)".into(),
            ));
        }
        Ok(Self {
            provider,
            chunk_size: config.chunk_size,
            compact_threshold: config.compact_threshold,
            state: RwLock::new(State::default()),
            refresh_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Load the index from the provider.
    ///
    /// Without `force` this is a no-op once loaded. With `force` the in-memory
    /// copy is replaced, discarding unflushed changes. Callers arriving while
    /// another refresh is in flight wait for it and reuse its result.
    pub async fn refresh(&self, force: bool) -> VltResult<()> {
        let observed = self.generation.load(Ordering::Acquire);
        let _guard = self.refresh_lock.lock().await;
        if self.generation.load(Ordering::Acquire) != observed {
            debug!("index refresh coalesced with a concurrent one");
            return Ok(());
        }

        {
            let state = self.state.read().await;
            if state.loaded && !force {
                return Ok(());
            }
            if !state.dirty.is_empty() {
                warn!(
                    dirty = state.dirty.len(),
                    "refresh discards unflushed index changes"
                );
            }
        }

        let (slots, tags) = self.fetch_chunks().await?;
        let state = State::from_slots(slots, tags)?;
        info!(
            files = state.by_id.len(),
            tombstones = state.deleted.len(),
            chunks = chunk_count(state.slots.len(), self.chunk_size),
            "index loaded"
        );
        *self.state.write().await = state;
        self.generation.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    async fn fetch_chunks(&self) -> VltResult<(Vec<Slot>, Vec<Option<Tag>>)> {
        let mut slots = Vec::new();
        let mut tags = Vec::new();
        let mut sequence: u32 = 0;
        loop {
            let Some((data, tag)) = self.provider.get(sequence).await? else {
                if sequence > 0 {
                    warn!(sequence, "index chunk chain ends at a missing chunk");
                }
                break;
            };
            let chunk = decode_chunk(sequence, &data)?;
            let len = chunk.slots.len();
            if len > self.chunk_size || (chunk.has_next && len != self.chunk_size) {
                return Err(VltError::format(format!(
                    "index chunk {sequence} holds {len} elements, chunk size is {}",
                    self.chunk_size
                )));
            }
            debug!(sequence, elements = len, "fetched index chunk");
            slots.extend(chunk.slots);
            tags.push(Some(tag));
            if !chunk.has_next {
                self.find_orphans(sequence, &mut tags).await?;
                break;
            }
            sequence = sequence
                .checked_add(1)
                .ok_or_else(|| VltError::format("index chunk chain too long"))?;
        }
        Ok((slots, tags))
    }

    /// Record the tags of chunks stored past the end of the chain.
    ///
    /// A flush that fails while deleting chunks orphaned by compaction leaves
    /// them behind. Keeping their tags lets the next flush overwrite or delete
    /// them instead of tripping over them when the index grows again.
    async fn find_orphans(&self, last: u32, tags: &mut Vec<Option<Tag>>) -> VltResult<()> {
        let mut sequence = last;
        while let Some(next) = sequence.checked_add(1) {
            let Some((_, tag)) = self.provider.get(next).await? else {
                break;
            };
            warn!(sequence = next, "found orphaned index chunk past the end of the chain");
            tags.push(Some(tag));
            sequence = next;
        }
        Ok(())
    }

    async fn ensure_loaded(&self) -> VltResult<()> {
        if self.state.read().await.loaded {
            return Ok(());
        }
        self.refresh(false).await
    }

    /// Add a file; returns its arena position. Nothing is persisted until `flush`.
    pub async fn add_file(&self, element: IndexElement) -> VltResult<usize> {
        path::validate_file_path(&element.path)?;
        self.ensure_loaded().await?;

        let mut state = self.state.write().await;
        if let Some(node) = state.tree.find(&element.path) {
            if node.element.is_some() {
                return Err(VltError::user(format!(
                    "file already exists: {}",
                    element.path
                )));
            }
            if node.is_dir() {
                return Err(VltError::user(format!(
                    "a folder already exists at {}",
                    element.path
                )));
            }
        }
        if let Some(pos) = state.tree.file_ancestor(&element.path) {
            let parent = state.element(pos).map(|e| e.path.clone()).unwrap_or_default();
            return Err(VltError::user(format!(
                "cannot add {}: {parent} is a file",
                element.path
            )));
        }
        if state.by_id.contains_key(&element.file_id) {
            return Err(VltError::user(format!(
                "file id {} is already indexed",
                element.file_id
            )));
        }

        let cs = self.chunk_size;
        let pos = match state.deleted.pop_first() {
            Some(pos) => {
                state.slots[pos] = Slot::Live(element.clone());
                pos
            }
            None => {
                let pos = state.slots.len();
                state.slots.push(Slot::Live(element.clone()));
                // Opening a new chunk flips the previous chunk's hasNext
                if pos > 0 && pos % cs == 0 {
                    state.dirty.insert(chunk_of(pos - 1, cs));
                }
                pos
            }
        };
        state.dirty.insert(chunk_of(pos, cs));
        state.by_id.insert(element.file_id, pos);
        state.tree.insert(&element.path, pos);
        debug!(path = %element.path, slot = pos, "added file to index");
        Ok(pos)
    }

    /// Tombstone one file (`/a/b`) or every file under a folder (`/a/*`).
    ///
    /// Returns the removed ids and paths in slot order; a path that matches
    /// nothing is not an error.
    pub async fn delete_file(&self, target: &str) -> VltResult<(Vec<Uuid>, Vec<String>)> {
        let target = path::parse_delete_target(target)?;
        self.ensure_loaded().await?;

        let mut state = self.state.write().await;
        let positions: Vec<usize> = match &target {
            DeleteTarget::Exact(p) => state
                .tree
                .find(p)
                .and_then(|node| node.element)
                .into_iter()
                .collect(),
            DeleteTarget::Prefix(prefix) => state
                .slots
                .iter()
                .enumerate()
                .filter(|(_, s)| s.live().is_some_and(|el| el.path.starts_with(prefix.as_str())))
                .map(|(pos, _)| pos)
                .collect(),
        };
        if positions.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }

        let mut ids = Vec::with_capacity(positions.len());
        let mut paths = Vec::with_capacity(positions.len());
        for pos in positions {
            let slot = std::mem::replace(&mut state.slots[pos], Slot::Tombstone);
            if let Slot::Live(el) = slot {
                state.by_id.remove(&el.file_id);
                ids.push(el.file_id);
                paths.push(el.path);
            }
            state.deleted.insert(pos);
            state.dirty.insert(chunk_of(pos, self.chunk_size));
        }
        state.tree = IndexTreeNode::build(&state.slots);
        debug!(removed = ids.len(), "deleted files from index");
        Ok((ids, paths))
    }

    pub async fn get_file_by_id(&self, file_id: &Uuid) -> VltResult<Option<IndexElement>> {
        self.ensure_loaded().await?;
        let state = self.state.read().await;
        Ok(state
            .by_id
            .get(file_id)
            .and_then(|&pos| state.element(pos))
            .cloned())
    }

    pub async fn get_file_by_path(&self, path: &str) -> VltResult<Option<IndexElement>> {
        let path = path::normalize_lookup(path)?;
        self.ensure_loaded().await?;
        let state = self.state.read().await;
        Ok(state
            .tree
            .find(path)
            .and_then(|node| node.element)
            .and_then(|pos| state.element(pos))
            .cloned())
    }

    /// Direct children of a folder, sorted by name. Unknown folders are empty.
    pub async fn list_folder(&self, folder: &str) -> VltResult<Vec<FolderEntry>> {
        let folder = path::normalize_lookup(folder)?;
        self.ensure_loaded().await?;
        let state = self.state.read().await;
        let Some(node) = state.tree.find(folder) else {
            return Ok(Vec::new());
        };
        Ok(node
            .children
            .values()
            .map(|child| FolderEntry {
                name: child.name.clone(),
                path: path::join(folder, &child.name),
                is_dir: child.is_dir(),
                element: child.element.and_then(|pos| state.element(pos)).cloned(),
            })
            .collect())
    }

    pub async fn stat(&self) -> VltResult<IndexStats> {
        self.ensure_loaded().await?;
        let state = self.state.read().await;
        Ok(IndexStats {
            file_count: state.by_id.len(),
            tombstones: state.deleted.len(),
            chunks: chunk_count(state.slots.len(), self.chunk_size),
        })
    }

    /// Purge tombstones when they exceed the configured share of slots.
    ///
    /// Live elements keep their relative order. Every chunk from the first
    /// purged slot onwards is dirtied; chunks past the new end are deleted by
    /// the next `flush`. Returns whether anything was compacted.
    pub async fn compact(&self) -> VltResult<bool> {
        self.ensure_loaded().await?;
        let mut state = self.state.write().await;

        let total = state.slots.len();
        let dead = state.deleted.len();
        if dead == 0 || (dead as f64 / total as f64) <= self.compact_threshold {
            debug!(total, dead, "index compaction not needed");
            return Ok(false);
        }

        let cs = self.chunk_size;
        let first = state.deleted.first().copied().unwrap_or(0);
        state.slots.retain(|s| !s.is_tombstone());
        let new_chunks = chunk_count(state.slots.len(), cs) as u32;

        state.dirty.extend(chunk_of(first, cs)..new_chunks);
        // The new last chunk must be rewritten with hasNext = false
        state.dirty.insert(new_chunks - 1);
        state.dirty.retain(|&c| c < new_chunks);
        state.reindex()?;

        info!(
            purged = dead,
            remaining = state.slots.len(),
            chunks = new_chunks,
            "index compacted"
        );
        Ok(true)
    }

    /// Write every dirty chunk, then delete chunks past the end of the arena.
    ///
    /// Chunks are written from the highest ordinal down: a new chunk exists
    /// before its predecessor is rewritten with `hasNext = true`, and the
    /// chain is shortened before the chunks past its end are deleted. Returns
    /// the number of chunks written.
    pub async fn flush(&self) -> VltResult<usize> {
        let mut state = self.state.write().await;
        let cs = self.chunk_size;
        let len = state.slots.len();
        let count = chunk_count(len, cs);

        let dirty: Vec<u32> = state.dirty.iter().rev().copied().collect();
        let mut written = 0;
        for sequence in dirty {
            let ordinal = sequence as usize;
            let start = ordinal * cs;
            if ordinal >= count {
                state.dirty.remove(&sequence);
                continue;
            }
            let end = (start + cs).min(len);
            let data = encode_chunk(sequence, ordinal + 1 < count, &state.slots[start..end])?;
            let expected = state.tags.get(ordinal).cloned().flatten();
            let tag = self.provider.set(sequence, data, expected.as_ref()).await?;

            if state.tags.len() <= ordinal {
                state.tags.resize(ordinal + 1, None);
            }
            state.tags[ordinal] = Some(tag);
            state.dirty.remove(&sequence);
            written += 1;
        }

        while state.tags.len() > count {
            let sequence = (state.tags.len() - 1) as u32;
            if let Some(tag) = state.tags.last().cloned().flatten() {
                self.provider.delete(sequence, Some(&tag)).await?;
                debug!(sequence, "deleted orphaned index chunk");
            }
            state.tags.pop();
        }

        if written > 0 {
            info!(chunks = written, "index flushed");
        }
        Ok(written)
    }

    /// Chunks changed since the last flush, ascending.
    pub async fn dirty_chunks(&self) -> Vec<u32> {
        self.state.read().await.dirty.iter().copied().collect()
    }

    pub async fn is_dirty(&self) -> bool {
        !self.state.read().await.dirty.is_empty()
    }
}

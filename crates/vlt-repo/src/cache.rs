//! Bounded cache of container headers and metadata, keyed by file id.
//!
//! Ranged reads need the header size, the wrapped content key and the
//! metadata size before they can translate a range; caching them saves a
//! fetch of package 0 per request. The oldest insertion is evicted first.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use uuid::Uuid;
use vlt_crypto::{ContainerHeader, Metadata};

pub const DEFAULT_CAPACITY: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedHeader {
    pub header: ContainerHeader,
    pub metadata: Metadata,
    /// Encoded metadata bytes at the start of package 0
    pub metadata_len: usize,
}

#[derive(Debug, Default)]
struct Entries {
    map: HashMap<Uuid, Arc<CachedHeader>>,
    order: VecDeque<Uuid>,
}

#[derive(Debug)]
pub struct HeaderCache {
    capacity: usize,
    entries: Mutex<Entries>,
}

impl Default for HeaderCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl HeaderCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(Entries::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, id: &Uuid) -> Option<Arc<CachedHeader>> {
        self.lock().map.get(id).cloned()
    }

    pub fn insert(&self, id: Uuid, entry: CachedHeader) -> Arc<CachedHeader> {
        let entry = Arc::new(entry);
        let mut entries = self.lock();
        if entries.map.insert(id, entry.clone()).is_none() {
            entries.order.push_back(id);
        }
        while entries.map.len() > self.capacity {
            let Some(oldest) = entries.order.pop_front() else {
                break;
            };
            entries.map.remove(&oldest);
        }
        entry
    }

    pub fn remove(&self, id: &Uuid) {
        let mut entries = self.lock();
        if entries.map.remove(id).is_some() {
            entries.order.retain(|k| k != id);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().map.is_empty()
    }
}

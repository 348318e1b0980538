//! vlt-index: the encrypted inventory mapping vault paths to blob ids
//!
//! Elements live in a flat arena whose positions are load-bearing: element
//! `i` is persisted in chunk `i / chunk_size`. Deleting an element leaves a
//! tombstone in its slot so no other chunk changes; [`Index::compact`] purges
//! tombstones once they exceed the configured ratio. The path tree used for
//! lookups and folder listings is derived from the arena and never persisted.

pub mod chunk;
pub mod element;
pub mod index;
pub mod path;
pub mod provider;
pub mod tree;

pub use element::{FolderEntry, IndexElement, IndexStats};
pub use index::Index;
pub use provider::{chunk_object_id, BlobIndexProvider, IndexProvider};
pub use tree::IndexTreeNode;

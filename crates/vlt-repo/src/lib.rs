//! vlt-repo: an unlocked vault
//!
//! [`Repository`] reads the unencrypted descriptor (`_info.json`) holding the
//! key slots. Unlocking it with a credential yields a [`Session`] that owns
//! the master key and the index, and stores every file as a codec container
//! under the descriptor's data path.

pub mod cache;
pub mod descriptor;
pub mod repository;

pub use cache::{CachedHeader, HeaderCache};
pub use descriptor::{RepoDescriptor, DESCRIPTOR_ID};
pub use repository::{object_id, store_from_config, AddOptions, Repository, Session};

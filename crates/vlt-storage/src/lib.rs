//! vlt-storage: blob stores addressed by id, with opaque concurrency tags
//!
//! Every encrypted object and every index chunk goes through [`BlobStore`].
//! Writes are conditional: no tag means create-only, a tag means
//! update-only-if-unchanged, and a mismatch is `VltError::Conflict`.

pub mod health;
pub mod memory;
pub mod opendal_store;
pub mod operator;
pub mod store;

pub use health::check_health;
pub use memory::MemoryStore;
pub use opendal_store::OpendalStore;
pub use operator::{build_operator, S3Credentials};
pub use store::{Blob, BlobStore};

//! vlt-core: shared plumbing for the vlt encrypted vault
//!
//! - `error`: the `VltError` taxonomy every other crate returns
//! - `config`: `vlt.toml` schema with defaults and env overrides
//! - `logging`: tracing-subscriber bootstrap (json or text)
//! - `types`: small value types shared across crates

pub mod config;
pub mod error;
pub mod logging;
pub mod types;

pub use error::{VltError, VltResult};
pub use types::Tag;

//! vlt-crypto: client-side encryption for the vlt vault
//!
//! Key hierarchy:
//! ```text
//! Key slot (passphrase via Argon2id, or sealed for an external recipient)
//!   └── Master Key (256-bit random, AES-KW wrapped by every slot)
//!         └── Content Key (per object, 256-bit random, AES-KW wrapped, stored in the container header)
//!               └── Packages: XChaCha20-Poly1305, ≤64 KiB plaintext each, nonce bound to the sequence number
//! ```
//!
//! Container layout:
//! ```text
//! [2B LE header len][header JSON {v,k}]
//! [package 0: 16B package header | ciphertext of ([2B LE meta len][meta JSON][content…]) | 16B tag]
//! [package 1 …]
//! ```

pub mod codec;
pub mod encoding;
pub mod header;
pub mod kdf;
pub mod keyring;
pub mod keys;
pub mod package;
pub mod range;
pub mod sealer;

pub use codec::{
    decrypt, decrypt_bytes, decrypt_packages, encrypt, encrypt_bytes, DecryptOptions,
    DecryptOutcome, EncryptSummary, MetadataAction,
};
pub use header::{read_header, ContainerHeader, Metadata};
pub use kdf::{derive_passphrase_keys, KdfParams};
pub use keyring::{Credentials, KeyRing, KeySealer, KeySlot, SlotKind};
pub use keys::{unwrap_key, wrap_key, ContentKey, MasterKey};
pub use range::{parse_range_header, RequestRange};
pub use sealer::AgeSealer;

/// Size of master and content keys in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of an AES-KW wrapped 256-bit key
pub const WRAPPED_KEY_SIZE: usize = 40;

/// Size of a passphrase slot salt
pub const SALT_SIZE: usize = 16;

/// Maximum plaintext bytes per package
pub const PACKAGE_SIZE: usize = 64 * 1024;

/// Ciphertext bytes added to every package (16B package header + 16B tag)
pub const PACKAGE_OVERHEAD: usize = 32;

/// Container header format version written by this crate
pub const HEADER_VERSION: u16 = 1;

/// Upper bound on the encoded header JSON
pub const MAX_HEADER_LEN: usize = 2046;

/// Upper bound on the encoded metadata JSON
pub const MAX_METADATA_LEN: usize = 32766;

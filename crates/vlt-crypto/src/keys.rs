//! Master and content keys, AES-256-KW wrapping (RFC 3394)

use aes_kw::KekAes256;
use rand::RngCore;
use vlt_core::{VltError, VltResult};
use zeroize::Zeroize;

use crate::{KEY_SIZE, SALT_SIZE, WRAPPED_KEY_SIZE};

/// The repository master key. Every key slot wraps the same value.
/// Zeroized on drop.
#[derive(Clone)]
pub struct MasterKey {
    bytes: [u8; KEY_SIZE],
}

impl MasterKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }

    /// Generate a fresh random master key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self { bytes }
    }
}

impl PartialEq for MasterKey {
    fn eq(&self, other: &Self) -> bool {
        use subtle::ConstantTimeEq;
        self.bytes.ct_eq(&other.bytes).into()
    }
}

impl Eq for MasterKey {}

impl Drop for MasterKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// A per-object 256-bit content key. Zeroized on drop.
pub struct ContentKey {
    bytes: [u8; KEY_SIZE],
}

impl ContentKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }

    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Wrap this key under the master key for storage in a container header.
    pub fn wrap(&self, master: &MasterKey) -> VltResult<[u8; WRAPPED_KEY_SIZE]> {
        wrap_key(master.as_bytes(), &self.bytes)
    }

    /// Recover a content key from a container header.
    ///
    /// A wrong master key or a tampered header both surface as `Decrypt`.
    pub fn unwrap_from(master: &MasterKey, wrapped: &[u8]) -> VltResult<Self> {
        let mut bytes = unwrap_key(master.as_bytes(), wrapped)?;
        let key = Self::from_bytes(bytes);
        bytes.zeroize();
        Ok(key)
    }
}

impl Drop for ContentKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Wrap a 256-bit key with AES-256-KW.
pub fn wrap_key(kek: &[u8; KEY_SIZE], key: &[u8]) -> VltResult<[u8; WRAPPED_KEY_SIZE]> {
    if key.len() != KEY_SIZE {
        return Err(VltError::format(format!(
            "key to wrap has wrong size: {} bytes (expected {KEY_SIZE})",
            key.len()
        )));
    }
    let kek = KekAes256::from(*kek);

    let mut output = [0u8; WRAPPED_KEY_SIZE];
    kek.wrap(key, &mut output)
        .map_err(|e| VltError::format(format!("key wrap failed: {e:?}")))?;
    Ok(output)
}

/// Unwrap an AES-256-KW wrapped key. The integrity check failing is a
/// `Decrypt` error; a wrapped blob of the wrong length is a `Format` error.
pub fn unwrap_key(kek: &[u8; KEY_SIZE], wrapped: &[u8]) -> VltResult<[u8; KEY_SIZE]> {
    if wrapped.len() != WRAPPED_KEY_SIZE {
        return Err(VltError::format(format!(
            "wrapped key has wrong size: {} bytes (expected {WRAPPED_KEY_SIZE})",
            wrapped.len()
        )));
    }
    let kek = KekAes256::from(*kek);

    let mut output = [0u8; KEY_SIZE];
    kek.unwrap(wrapped, &mut output)
        .map_err(|_| VltError::decrypt("key unwrap failed: wrong key or corrupted data"))?;
    Ok(output)
}

/// Random salt for a new passphrase slot.
pub fn new_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

//! Key derivation: Argon2id passphrase → wrapping key + confirmation hash

use argon2::{Algorithm, Argon2, Params, Version};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use vlt_core::config::CryptoConfig;
use vlt_core::{VltError, VltResult};
use zeroize::Zeroizing;

use crate::{KEY_SIZE, SALT_SIZE};

const VARIANT_ARGON2ID: &str = "argon2id";
const ARGON2_VERSION: u32 = 0x13;

/// Argon2id parameters, stored with every passphrase slot so the defaults can
/// be re-tuned without invalidating existing slots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    #[serde(default)]
    pub variant: String,
    #[serde(default)]
    pub version: u32,
    /// Memory cost in KiB
    #[serde(default)]
    pub memory_kib: u32,
    /// Time cost / iterations
    #[serde(default)]
    pub iterations: u32,
    #[serde(default)]
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            variant: VARIANT_ARGON2ID.into(),
            version: ARGON2_VERSION,
            memory_kib: 80 * 1024,
            iterations: 4,
            parallelism: 2,
        }
    }
}

impl KdfParams {
    /// Parameters assumed for slots that were written without any.
    pub fn legacy() -> Self {
        Self {
            variant: VARIANT_ARGON2ID.into(),
            version: ARGON2_VERSION,
            memory_kib: 64 * 1024,
            iterations: 1,
            parallelism: 4,
        }
    }

    pub fn from_config(config: &CryptoConfig) -> Self {
        Self {
            variant: VARIANT_ARGON2ID.into(),
            version: ARGON2_VERSION,
            memory_kib: config.argon2_mem_cost_kib,
            iterations: config.argon2_time_cost,
            parallelism: config.argon2_parallelism,
        }
    }

    /// Fill unset fields with defaults; reject anything but Argon2id v0x13.
    pub fn validate(&mut self) -> VltResult<()> {
        let defaults = Self::default();
        if self.variant.is_empty() {
            self.variant = defaults.variant;
        } else if self.variant != VARIANT_ARGON2ID {
            return Err(VltError::format(format!(
                "unsupported KDF variant: {}",
                self.variant
            )));
        }
        if self.version == 0 {
            self.version = ARGON2_VERSION;
        } else if self.version != ARGON2_VERSION {
            return Err(VltError::format(format!(
                "unsupported Argon2 version: {:#x}",
                self.version
            )));
        }
        if self.memory_kib == 0 {
            self.memory_kib = defaults.memory_kib;
        }
        if self.iterations == 0 {
            self.iterations = defaults.iterations;
        }
        if self.parallelism == 0 {
            self.parallelism = defaults.parallelism;
        }
        Ok(())
    }
}

/// Key material derived from a passphrase.
pub struct PassphraseKeys {
    /// Wraps the master key
    pub wrapping_key: Zeroizing<[u8; KEY_SIZE]>,
    /// Stored in the slot to reject wrong passphrases without attempting an unwrap
    pub confirmation_hash: [u8; KEY_SIZE],
}

/// Derive 64 bytes with Argon2id: the first half is the wrapping key, the
/// second half the confirmation hash.
pub fn derive_passphrase_keys(
    passphrase: &SecretString,
    salt: &[u8],
    params: &KdfParams,
) -> VltResult<PassphraseKeys> {
    if passphrase.expose_secret().is_empty() {
        return Err(VltError::user("passphrase must not be empty"));
    }
    if salt.len() != SALT_SIZE {
        return Err(VltError::format(format!(
            "invalid salt length: {} bytes (expected {SALT_SIZE})",
            salt.len()
        )));
    }
    let mut params = params.clone();
    params.validate()?;

    let argon2_params = Params::new(
        params.memory_kib,
        params.iterations,
        params.parallelism,
        Some(2 * KEY_SIZE),
    )
    .map_err(|e| VltError::format(format!("invalid Argon2id params: {e}")))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params);

    let mut out = Zeroizing::new([0u8; 2 * KEY_SIZE]);
    argon2
        .hash_password_into(passphrase.expose_secret().as_bytes(), salt, &mut out[..])
        .map_err(|e| VltError::format(format!("Argon2id KDF failed: {e}")))?;

    let mut wrapping_key = Zeroizing::new([0u8; KEY_SIZE]);
    wrapping_key.copy_from_slice(&out[..KEY_SIZE]);
    let mut confirmation_hash = [0u8; KEY_SIZE];
    confirmation_hash.copy_from_slice(&out[KEY_SIZE..]);

    Ok(PassphraseKeys {
        wrapping_key,
        confirmation_hash,
    })
}

#[cfg(test)]
pub(crate) fn fast_params() -> KdfParams {
    KdfParams {
        memory_kib: 1024,
        iterations: 1,
        parallelism: 1,
        ..KdfParams::default()
    }
}

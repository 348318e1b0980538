//! age (X25519) implementation of [`KeySealer`]

use std::str::FromStr;

use age::x25519;
use secrecy::{ExposeSecret, SecretString};
use tracing::debug;
use vlt_core::{VltError, VltResult};
use zeroize::Zeroize;

use crate::keyring::KeySealer;
use crate::keys::MasterKey;
use crate::KEY_SIZE;

/// Seals master keys to age X25519 recipients and opens them with the
/// identities it holds.
pub struct AgeSealer {
    identities: Vec<x25519::Identity>,
}

impl AgeSealer {
    pub fn new(identities: Vec<x25519::Identity>) -> Self {
        Self { identities }
    }

    /// A sealer with one fresh identity, plus that identity's recipient string.
    pub fn generate() -> (Self, String) {
        let identity = x25519::Identity::generate();
        let recipient = identity.to_public().to_string();
        (Self::new(vec![identity]), recipient)
    }

    /// Parse an `AGE-SECRET-KEY-1…` identity.
    pub fn from_identity_str(identity: &SecretString) -> VltResult<Self> {
        let identity = x25519::Identity::from_str(identity.expose_secret().trim())
            .map_err(|e| VltError::user(format!("invalid age identity: {e}")))?;
        Ok(Self::new(vec![identity]))
    }

    /// Recipient strings for every held identity.
    pub fn recipients(&self) -> Vec<String> {
        self.identities
            .iter()
            .map(|i| i.to_public().to_string())
            .collect()
    }
}

impl KeySealer for AgeSealer {
    fn seal(&self, recipient: &str, key: &MasterKey) -> VltResult<Vec<u8>> {
        let recipient = x25519::Recipient::from_str(recipient)
            .map_err(|e| VltError::user(format!("invalid age recipient: {e}")))?;
        age::encrypt(&recipient, key.as_bytes())
            .map_err(|e| VltError::Other(anyhow::anyhow!("age encryption failed: {e}")))
    }

    fn unseal(&self, sealed: &[u8]) -> VltResult<Option<MasterKey>> {
        for identity in &self.identities {
            match age::decrypt(identity, sealed) {
                Ok(mut plaintext) => {
                    if plaintext.len() != KEY_SIZE {
                        plaintext.zeroize();
                        return Err(VltError::format(format!(
                            "sealed master key has wrong size: {} bytes",
                            plaintext.len()
                        )));
                    }
                    let mut bytes = [0u8; KEY_SIZE];
                    bytes.copy_from_slice(&plaintext);
                    plaintext.zeroize();
                    let key = MasterKey::from_bytes(bytes);
                    bytes.zeroize();
                    return Ok(Some(key));
                }
                Err(age::DecryptError::NoMatchingKeys) => {
                    debug!("age identity does not match sealed key");
                }
                Err(e) => return Err(VltError::format(format!("invalid sealed key: {e}"))),
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_unseal() {
        let (sealer, recipient) = AgeSealer::generate();
        let master = MasterKey::generate();

        let sealed = sealer.seal(&recipient, &master).unwrap();
        assert_eq!(sealer.unseal(&sealed).unwrap(), Some(master));
    }

    #[test]
    fn test_other_identity_cannot_unseal() {
        let (sealer, recipient) = AgeSealer::generate();
        let (other, _) = AgeSealer::generate();

        let sealed = sealer.seal(&recipient, &MasterKey::generate()).unwrap();
        assert_eq!(other.unseal(&sealed).unwrap(), None);
    }

    #[test]
    fn test_invalid_recipient() {
        let (sealer, _) = AgeSealer::generate();
        let err = sealer.seal("not-a-recipient", &MasterKey::generate()).unwrap_err();
        assert!(err.is_user_error());
    }

    #[test]
    fn test_identity_roundtrip_through_string() {
        let identity = x25519::Identity::generate();
        let recipient = identity.to_public().to_string();
        let encoded = identity.to_string();

        let sealer = AgeSealer::from_identity_str(&encoded).unwrap();
        assert_eq!(sealer.recipients(), vec![recipient]);
    }

    #[test]
    fn test_garbage_is_format_error() {
        let (sealer, _) = AgeSealer::generate();
        assert!(matches!(
            sealer.unseal(b"definitely not age"),
            Err(VltError::Format(_))
        ));
    }
}

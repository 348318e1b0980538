//! Key slots: one master key wrapped under N independent credentials
//!
//! Passphrase slots store an Argon2id salt, a confirmation hash used to reject
//! wrong passphrases before attempting an unwrap, and the AES-KW wrapped
//! master key. Sealed slots hold the master key encrypted for an external
//! recipient and are opened by a [`KeySealer`].

use std::fmt;

use secrecy::SecretString;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};
use vlt_core::{VltError, VltResult};

use crate::kdf::{derive_passphrase_keys, KdfParams};
use crate::keys::{new_salt, unwrap_key, wrap_key, MasterKey};

/// External collaborator that seals the master key for a recipient and
/// opens sealed keys with locally available identities.
pub trait KeySealer: Send + Sync {
    fn seal(&self, recipient: &str, key: &MasterKey) -> VltResult<Vec<u8>>;

    /// `Ok(None)` when none of the local identities can open `sealed`.
    fn unseal(&self, sealed: &[u8]) -> VltResult<Option<MasterKey>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    Passphrase,
    Sealed,
    /// A stored record that could not be decoded
    Malformed,
}

impl fmt::Display for SlotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Passphrase => f.write_str("passphrase"),
            Self::Sealed => f.write_str("sealed"),
            Self::Malformed => f.write_str("malformed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySlot {
    Passphrase {
        salt: Vec<u8>,
        confirmation_hash: Vec<u8>,
        wrapped_master_key: Vec<u8>,
        kdf: KdfParams,
    },
    Sealed {
        recipient: String,
        wrapped_master_key: Vec<u8>,
    },
    /// A stored record that failed to decode. It is kept verbatim so that
    /// rewriting the descriptor does not lose it, and never unlocks anything.
    Malformed {
        record: serde_json::Value,
        reason: String,
    },
}

impl KeySlot {
    /// `p:<hex of the first 8 wrapped bytes>` for passphrase slots, the
    /// recipient for sealed slots, `x:<hash prefix of the record>` for
    /// malformed ones.
    pub fn id(&self) -> String {
        match self {
            Self::Passphrase {
                wrapped_master_key, ..
            } => {
                let prefix = &wrapped_master_key[..wrapped_master_key.len().min(8)];
                format!("p:{}", hex::encode_upper(prefix))
            }
            Self::Sealed { recipient, .. } => recipient.clone(),
            Self::Malformed { record, .. } => {
                let hash = blake3::hash(record.to_string().as_bytes());
                format!("x:{}", hex::encode_upper(&hash.as_bytes()[..8]))
            }
        }
    }

    pub fn kind(&self) -> SlotKind {
        match self {
            Self::Passphrase { .. } => SlotKind::Passphrase,
            Self::Sealed { .. } => SlotKind::Sealed,
            Self::Malformed { .. } => SlotKind::Malformed,
        }
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::Malformed { .. })
    }

    fn matches_id(&self, id: &str) -> bool {
        match self {
            Self::Sealed { recipient, .. } => recipient == id,
            _ => self.id().eq_ignore_ascii_case(id),
        }
    }

    /// Decode one stored record; anything unusable becomes `Malformed`.
    fn from_record(record: serde_json::Value) -> Self {
        let decoded = SlotRecord::deserialize(&record)
            .map_err(|e| VltError::format(format!("key slot: {e}")))
            .and_then(Self::try_from);
        match decoded {
            Ok(slot) => slot,
            Err(e) => Self::Malformed {
                record,
                reason: e.to_string(),
            },
        }
    }
}

impl Serialize for KeySlot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Malformed { record, .. } => record.serialize(serializer),
            slot => SlotRecord::from(slot).serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for KeySlot {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(Self::from_record)
    }
}

/// Persisted slot shape: a flat object whose populated fields select the kind.
#[derive(Serialize, Deserialize)]
struct SlotRecord {
    #[serde(
        rename = "m",
        default,
        with = "crate::encoding::b64",
        skip_serializing_if = "Vec::is_empty"
    )]
    wrapped_master_key: Vec<u8>,
    #[serde(rename = "g", default, skip_serializing_if = "String::is_empty")]
    recipient: String,
    #[serde(
        rename = "p",
        default,
        with = "crate::encoding::b64",
        skip_serializing_if = "Vec::is_empty"
    )]
    confirmation_hash: Vec<u8>,
    #[serde(
        rename = "s",
        default,
        with = "crate::encoding::b64",
        skip_serializing_if = "Vec::is_empty"
    )]
    salt: Vec<u8>,
    #[serde(rename = "o", default, skip_serializing_if = "Option::is_none")]
    kdf: Option<KdfParams>,
}

impl TryFrom<SlotRecord> for KeySlot {
    type Error = VltError;

    fn try_from(record: SlotRecord) -> Result<Self, Self::Error> {
        if record.wrapped_master_key.is_empty() {
            return Err(VltError::format("key slot without a wrapped master key"));
        }
        if !record.recipient.is_empty() {
            return Ok(Self::Sealed {
                recipient: record.recipient,
                wrapped_master_key: record.wrapped_master_key,
            });
        }
        if record.salt.is_empty() || record.confirmation_hash.is_empty() {
            return Err(VltError::format(
                "passphrase key slot without salt or confirmation hash",
            ));
        }
        Ok(Self::Passphrase {
            salt: record.salt,
            confirmation_hash: record.confirmation_hash,
            wrapped_master_key: record.wrapped_master_key,
            kdf: record.kdf.unwrap_or_else(KdfParams::legacy),
        })
    }
}

impl From<&KeySlot> for SlotRecord {
    fn from(slot: &KeySlot) -> Self {
        match slot {
            KeySlot::Passphrase {
                salt,
                confirmation_hash,
                wrapped_master_key,
                kdf,
            } => Self {
                wrapped_master_key: wrapped_master_key.clone(),
                recipient: String::new(),
                confirmation_hash: confirmation_hash.clone(),
                salt: salt.clone(),
                kdf: Some(kdf.clone()),
            },
            KeySlot::Sealed {
                recipient,
                wrapped_master_key,
            } => Self {
                wrapped_master_key: wrapped_master_key.clone(),
                recipient: recipient.clone(),
                confirmation_hash: Vec::new(),
                salt: Vec::new(),
                kdf: None,
            },
            // Serialized from the kept record instead
            KeySlot::Malformed { .. } => Self {
                wrapped_master_key: Vec::new(),
                recipient: String::new(),
                confirmation_hash: Vec::new(),
                salt: Vec::new(),
                kdf: None,
            },
        }
    }
}

/// Credentials offered to [`KeyRing::unlock`]. Sealed slots are tried first.
#[derive(Default)]
pub struct Credentials<'a> {
    pub passphrase: Option<&'a SecretString>,
    pub sealer: Option<&'a dyn KeySealer>,
}

impl<'a> Credentials<'a> {
    pub fn passphrase(passphrase: &'a SecretString) -> Self {
        Self {
            passphrase: Some(passphrase),
            sealer: None,
        }
    }

    pub fn sealer(sealer: &'a dyn KeySealer) -> Self {
        Self {
            passphrase: None,
            sealer: Some(sealer),
        }
    }
}

/// Ordered list of key slots for one repository.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyRing {
    slots: Vec<KeySlot>,
}

impl KeyRing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_slots(slots: Vec<KeySlot>) -> Self {
        Self { slots }
    }

    pub fn slots(&self) -> &[KeySlot] {
        &self.slots
    }

    pub fn into_slots(self) -> Vec<KeySlot> {
        self.slots
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// `(slot id, kind)` for every slot, in order.
    pub fn list(&self) -> Vec<(String, SlotKind)> {
        self.slots.iter().map(|s| (s.id(), s.kind())).collect()
    }

    /// Recover the master key. Returns it with the id of the slot that opened it.
    ///
    /// A slot with malformed fields is skipped with a warning. A slot whose
    /// confirmation hash matches but whose wrapped key cannot be unwrapped is
    /// reported as `Format` if no other slot succeeds.
    pub fn unlock(&self, credentials: &Credentials<'_>) -> VltResult<(MasterKey, String)> {
        for slot in &self.slots {
            if let KeySlot::Malformed { reason, .. } = slot {
                warn!(slot = %slot.id(), reason = %reason, "skipping malformed key slot");
            }
        }

        if let Some(sealer) = credentials.sealer {
            for slot in &self.slots {
                let KeySlot::Sealed {
                    recipient,
                    wrapped_master_key,
                } = slot
                else {
                    continue;
                };
                match sealer.unseal(wrapped_master_key) {
                    Ok(Some(key)) => {
                        debug!(slot = %recipient, "unlocked sealed key slot");
                        return Ok((key, slot.id()));
                    }
                    Ok(None) => {}
                    Err(e) => warn!(slot = %recipient, error = %e, "skipping sealed key slot"),
                }
            }
        }

        let mut slot_error = None;
        if let Some(passphrase) = credentials.passphrase {
            for slot in &self.slots {
                let KeySlot::Passphrase {
                    salt,
                    confirmation_hash,
                    wrapped_master_key,
                    kdf,
                } = slot
                else {
                    continue;
                };

                let keys = match derive_passphrase_keys(passphrase, salt, kdf) {
                    Ok(keys) => keys,
                    Err(e @ VltError::User(_)) => return Err(e),
                    Err(e) => {
                        warn!(slot = %slot.id(), error = %e, "skipping malformed key slot");
                        continue;
                    }
                };
                if !bool::from(keys.confirmation_hash[..].ct_eq(confirmation_hash.as_slice())) {
                    continue;
                }
                match unwrap_key(&keys.wrapping_key, wrapped_master_key) {
                    Ok(bytes) => {
                        debug!(slot = %slot.id(), "unlocked passphrase key slot");
                        return Ok((MasterKey::from_bytes(bytes), slot.id()));
                    }
                    Err(e) => {
                        warn!(slot = %slot.id(), error = %e, "passphrase matched but master key unwrap failed");
                        slot_error = Some(VltError::format(format!(
                            "key slot {} is corrupted: {e}",
                            slot.id()
                        )));
                    }
                }
            }
        }

        Err(slot_error.unwrap_or(VltError::InvalidCredential))
    }

    /// Add a passphrase slot wrapping `master`. Returns the new slot id.
    ///
    /// Fails if the passphrase already unlocks an existing slot.
    pub fn add_passphrase_slot(
        &mut self,
        master: &MasterKey,
        passphrase: &SecretString,
        params: &KdfParams,
    ) -> VltResult<String> {
        match self.unlock(&Credentials::passphrase(passphrase)) {
            Ok(_) => {
                return Err(VltError::user(
                    "this passphrase is already added to the repository",
                ))
            }
            Err(VltError::InvalidCredential) => {}
            Err(e) => return Err(e),
        }

        let mut params = params.clone();
        params.validate()?;
        let salt = new_salt();
        let keys = derive_passphrase_keys(passphrase, &salt, &params)?;
        let wrapped = wrap_key(&keys.wrapping_key, master.as_bytes())?;

        let slot = KeySlot::Passphrase {
            salt: salt.to_vec(),
            confirmation_hash: keys.confirmation_hash.to_vec(),
            wrapped_master_key: wrapped.to_vec(),
            kdf: params,
        };
        let id = slot.id();
        self.slots.push(slot);
        debug!(slot = %id, "added passphrase key slot");
        Ok(id)
    }

    /// Add a slot sealed for `recipient`. Returns the new slot id.
    pub fn add_sealed_slot(
        &mut self,
        master: &MasterKey,
        sealer: &dyn KeySealer,
        recipient: &str,
    ) -> VltResult<String> {
        if recipient.is_empty() {
            return Err(VltError::user("recipient must not be empty"));
        }
        let duplicate = self
            .slots
            .iter()
            .any(|s| matches!(s, KeySlot::Sealed { recipient: r, .. } if r == recipient));
        if duplicate {
            return Err(VltError::user(format!(
                "a key for {recipient} is already added to the repository"
            )));
        }

        let wrapped_master_key = sealer.seal(recipient, master)?;
        self.slots.push(KeySlot::Sealed {
            recipient: recipient.to_string(),
            wrapped_master_key,
        });
        debug!(slot = %recipient, "added sealed key slot");
        Ok(recipient.to_string())
    }

    /// Remove the slot with `id`. The last slot and the slot identified by
    /// `active_id` (the one that unlocked the current session) are kept.
    pub fn remove_slot(&mut self, id: &str, active_id: &str) -> VltResult<KeySlot> {
        let position = self
            .slots
            .iter()
            .position(|s| s.matches_id(id))
            .ok_or_else(|| VltError::user(format!("key {id} not found")))?;
        if self.slots.len() == 1 {
            return Err(VltError::user(
                "cannot remove the only key of the repository",
            ));
        }
        if self.slots[position].matches_id(active_id) {
            return Err(VltError::user(
                "cannot remove the key used to unlock the repository",
            ));
        }

        let removed = self.slots.remove(position);
        debug!(slot = %removed.id(), "removed key slot");
        Ok(removed)
    }
}

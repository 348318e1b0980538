//! Repository descriptor stored unencrypted as `_info.json`
//!
//! ```json
//! {"app":"vlt","ver":1,"id":"<uuid>","dp":"data","k":[{"m":"…","p":"…","s":"…","o":{…}}]}
//! ```

use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;
use vlt_core::{VltError, VltResult};
use vlt_crypto::{KeyRing, KeySlot};

pub const DESCRIPTOR_ID: &str = "_info.json";

pub const APP_ID: &str = "vlt";

pub const DESCRIPTOR_VERSION: u16 = 1;

const DEFAULT_DATA_PATH: &str = "data";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoDescriptor {
    pub app: String,
    #[serde(rename = "ver")]
    pub version: u16,
    pub id: Uuid,
    /// Prefix under which file objects are stored
    #[serde(rename = "dp")]
    pub data_path: String,
    #[serde(rename = "k", default)]
    pub keys: Vec<KeySlot>,
}

impl RepoDescriptor {
    /// A descriptor for a new repository with a fresh id.
    pub fn new(keys: Vec<KeySlot>) -> Self {
        Self {
            app: APP_ID.into(),
            version: DESCRIPTOR_VERSION,
            id: Uuid::new_v4(),
            data_path: DEFAULT_DATA_PATH.into(),
            keys,
        }
    }

    pub fn validate(&self) -> VltResult<()> {
        if self.app != APP_ID {
            return Err(VltError::format(format!(
                "descriptor belongs to app {:?}",
                self.app
            )));
        }
        if self.version != DESCRIPTOR_VERSION {
            return Err(VltError::format(format!(
                "unsupported descriptor version {}; the repository may have been created by a newer vlt",
                self.version
            )));
        }
        if self.keys.iter().all(KeySlot::is_malformed) {
            return Err(VltError::format("repository does not have any usable key"));
        }
        let dp = self.data_path.as_str();
        if dp.is_empty()
            || dp.starts_with('/')
            || dp.ends_with('/')
            || dp.starts_with('_')
            || dp.split('/').any(|c| c.is_empty() || c == "." || c == "..")
        {
            return Err(VltError::format(format!("invalid data path {dp:?}")));
        }
        Ok(())
    }

    pub fn keyring(&self) -> KeyRing {
        KeyRing::from_slots(self.keys.clone())
    }

    pub fn encode(&self) -> VltResult<Vec<u8>> {
        serde_json::to_vec_pretty(self)
            .map_err(|e| VltError::format(format!("encoding descriptor: {e}")))
    }

    /// Parse and validate. A malformed key slot is kept but only fails the
    /// descriptor when no usable slot is left.
    pub fn decode(data: &[u8]) -> VltResult<Self> {
        let descriptor: Self = serde_json::from_slice(data)
            .map_err(|e| VltError::format(format!("decoding descriptor: {e}")))?;
        for slot in descriptor.keys.iter().filter(|s| s.is_malformed()) {
            warn!(slot = %slot.id(), "descriptor holds a malformed key slot");
        }
        descriptor.validate()?;
        Ok(descriptor)
    }
}

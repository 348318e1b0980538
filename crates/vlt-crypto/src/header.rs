//! Container header (`[2B LE len][{"v":1,"k":"<b64 wrapped content key>"}]`)
//! and the metadata prefix carried inside package 0.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use vlt_core::{VltError, VltResult};

use crate::{HEADER_VERSION, MAX_HEADER_LEN, MAX_METADATA_LEN, WRAPPED_KEY_SIZE};

#[derive(Serialize, Deserialize)]
struct HeaderJson {
    v: u16,
    #[serde(with = "crate::encoding::b64")]
    k: Vec<u8>,
}

/// Parsed container header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHeader {
    pub version: u16,
    /// Content key wrapped under the master key
    pub wrapped_key: Vec<u8>,
    /// Bytes occupied on the wire, including the length prefix
    pub encoded_len: usize,
}

impl ContainerHeader {
    pub fn new(wrapped_key: [u8; WRAPPED_KEY_SIZE]) -> Self {
        let mut header = Self {
            version: HEADER_VERSION,
            wrapped_key: wrapped_key.to_vec(),
            encoded_len: 0,
        };
        // JSON of a fixed-size key and a u16 always serializes
        header.encoded_len = header.encode().map(|b| b.len()).unwrap_or(0);
        header
    }

    pub fn encode(&self) -> VltResult<Vec<u8>> {
        let json = serde_json::to_vec(&HeaderJson {
            v: self.version,
            k: self.wrapped_key.clone(),
        })
        .map_err(|e| VltError::format(format!("encoding header: {e}")))?;
        if json.len() > MAX_HEADER_LEN {
            return Err(VltError::format(format!(
                "header too large: {} bytes",
                json.len()
            )));
        }

        let mut out = Vec::with_capacity(2 + json.len());
        out.extend_from_slice(&(json.len() as u16).to_le_bytes());
        out.extend_from_slice(&json);
        Ok(out)
    }
}

/// Read and validate the container header from the start of a stream.
///
/// Leaves the reader positioned at the first package.
pub async fn read_header<R: AsyncRead + Unpin>(reader: &mut R) -> VltResult<ContainerHeader> {
    let mut len_buf = [0u8; 2];
    reader.read_exact(&mut len_buf).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => VltError::format("stream too short for header"),
        _ => VltError::Io(e),
    })?;
    let len = u16::from_le_bytes(len_buf) as usize;
    if len == 0 || len > MAX_HEADER_LEN {
        return Err(VltError::format(format!("invalid header length: {len}")));
    }

    let mut json = vec![0u8; len];
    reader.read_exact(&mut json).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => VltError::format("header truncated"),
        _ => VltError::Io(e),
    })?;

    let parsed: HeaderJson = serde_json::from_slice(&json)
        .map_err(|e| VltError::format(format!("invalid header JSON: {e}")))?;
    if parsed.v != HEADER_VERSION {
        return Err(VltError::format(format!(
            "unsupported header version: {}",
            parsed.v
        )));
    }

    Ok(ContainerHeader {
        version: parsed.v,
        wrapped_key: parsed.k,
        encoded_len: 2 + len,
    })
}

/// Descriptive data stored encrypted at the start of package 0.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(rename = "n", default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(rename = "ct", default, skip_serializing_if = "String::is_empty")]
    pub content_type: String,
    #[serde(rename = "sz", default, skip_serializing_if = "is_zero")]
    pub size: u64,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

impl Metadata {
    pub fn new(name: impl Into<String>, content_type: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            content_type: content_type.into(),
            size,
        }
    }

    /// `[2B LE len][JSON]`
    pub fn encode(&self) -> VltResult<Vec<u8>> {
        let json = serde_json::to_vec(self)
            .map_err(|e| VltError::format(format!("encoding metadata: {e}")))?;
        if json.len() > MAX_METADATA_LEN {
            return Err(VltError::format(format!(
                "metadata too large: {} bytes (max {MAX_METADATA_LEN})",
                json.len()
            )));
        }

        let mut out = Vec::with_capacity(2 + json.len());
        out.extend_from_slice(&(json.len() as u16).to_le_bytes());
        out.extend_from_slice(&json);
        Ok(out)
    }

    /// Parse the metadata prefix of decrypted package 0.
    ///
    /// Returns the metadata and the number of bytes it occupied.
    pub fn decode_prefix(buf: &[u8]) -> VltResult<(Self, usize)> {
        if buf.len() < 2 {
            return Err(VltError::format("package 0 too short for metadata"));
        }
        let len = u16::from_le_bytes([buf[0], buf[1]]) as usize;
        if len > MAX_METADATA_LEN {
            return Err(VltError::format(format!("invalid metadata length: {len}")));
        }
        let end = 2 + len;
        if end > buf.len() {
            return Err(VltError::format(format!(
                "metadata length {len} exceeds package 0 ({} bytes)",
                buf.len()
            )));
        }

        let metadata = if len == 0 {
            Self::default()
        } else {
            serde_json::from_slice(&buf[2..end])
                .map_err(|e| VltError::format(format!("invalid metadata JSON: {e}")))?
        };
        Ok((metadata, end))
    }
}

//! Single-package XChaCha20-Poly1305 sealing
//!
//! Package format (binary):
//! ```text
//! [16 bytes: package header][N bytes: ciphertext][16 bytes: Poly1305 tag]
//!
//! package header = format (1B, 0x01) | flags (1B, 0x80 = final)
//!                | payload_len - 1 (2B LE) | nonce prefix (12B, random)
//! nonce          = nonce prefix (12B) || 0 (8B) || sequence (4B BE)
//! AAD            = package header (16B)
//! ```
//!
//! Binding the sequence into the nonce rejects reordered packages; binding the
//! final flag into the AAD rejects truncation at a package boundary.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use vlt_core::{VltError, VltResult};

use crate::keys::ContentKey;
use crate::PACKAGE_SIZE;

pub const PACKAGE_HEADER_SIZE: usize = 16;
pub const TAG_SIZE: usize = 16;

const PACKAGE_FORMAT: u8 = 0x01;
const FLAG_FINAL: u8 = 0x80;
const NONCE_PREFIX_SIZE: usize = 12;

/// Parsed 16-byte package header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackageHeader {
    pub is_final: bool,
    /// Plaintext bytes in this package (1..=PACKAGE_SIZE)
    pub payload_len: usize,
    nonce_prefix: [u8; NONCE_PREFIX_SIZE],
}

impl PackageHeader {
    fn new(payload_len: usize, is_final: bool) -> Self {
        let mut nonce_prefix = [0u8; NONCE_PREFIX_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_prefix);
        Self {
            is_final,
            payload_len,
            nonce_prefix,
        }
    }

    pub fn to_bytes(&self) -> [u8; PACKAGE_HEADER_SIZE] {
        let mut out = [0u8; PACKAGE_HEADER_SIZE];
        out[0] = PACKAGE_FORMAT;
        out[1] = if self.is_final { FLAG_FINAL } else { 0 };
        out[2..4].copy_from_slice(&((self.payload_len - 1) as u16).to_le_bytes());
        out[4..].copy_from_slice(&self.nonce_prefix);
        out
    }

    pub fn parse(bytes: &[u8; PACKAGE_HEADER_SIZE]) -> VltResult<Self> {
        if bytes[0] != PACKAGE_FORMAT {
            return Err(VltError::decrypt(format!(
                "unknown package format {:#04x}",
                bytes[0]
            )));
        }
        if bytes[1] & !FLAG_FINAL != 0 {
            return Err(VltError::decrypt(format!(
                "unknown package flags {:#04x}",
                bytes[1]
            )));
        }
        let mut nonce_prefix = [0u8; NONCE_PREFIX_SIZE];
        nonce_prefix.copy_from_slice(&bytes[4..]);
        Ok(Self {
            is_final: bytes[1] & FLAG_FINAL != 0,
            payload_len: u16::from_le_bytes([bytes[2], bytes[3]]) as usize + 1,
            nonce_prefix,
        })
    }

    /// Ciphertext plus tag that follow this header on the wire.
    pub fn body_len(&self) -> usize {
        self.payload_len + TAG_SIZE
    }

    fn nonce(&self, sequence: u32) -> [u8; 24] {
        let mut nonce = [0u8; 24];
        nonce[..NONCE_PREFIX_SIZE].copy_from_slice(&self.nonce_prefix);
        nonce[20..].copy_from_slice(&sequence.to_be_bytes());
        nonce
    }
}

/// Encrypt one package. `plaintext` must hold 1..=PACKAGE_SIZE bytes, and only
/// the final package may be short.
///
/// Returns `[16-byte header][ciphertext][16-byte tag]`.
pub fn seal_package(
    key: &ContentKey,
    sequence: u32,
    plaintext: &[u8],
    is_final: bool,
) -> VltResult<Vec<u8>> {
    if plaintext.is_empty() || plaintext.len() > PACKAGE_SIZE {
        return Err(VltError::format(format!(
            "package payload must be 1..={PACKAGE_SIZE} bytes, got {}",
            plaintext.len()
        )));
    }
    let header = PackageHeader::new(plaintext.len(), is_final);
    let header_bytes = header.to_bytes();
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
    let nonce = header.nonce(sequence);

    let ciphertext = cipher
        .encrypt(
            XNonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: &header_bytes,
            },
        )
        .map_err(|e| VltError::decrypt(format!("package {sequence} encryption failed: {e}")))?;

    let mut out = Vec::with_capacity(PACKAGE_HEADER_SIZE + ciphertext.len());
    out.extend_from_slice(&header_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Authenticate and decrypt one package body (ciphertext + tag) whose header
/// has already been read.
pub fn open_package(
    key: &ContentKey,
    sequence: u32,
    header_bytes: &[u8; PACKAGE_HEADER_SIZE],
    body: &[u8],
) -> VltResult<(PackageHeader, Vec<u8>)> {
    let header = PackageHeader::parse(header_bytes)?;
    if body.len() != header.body_len() {
        return Err(VltError::decrypt(format!(
            "package {sequence} truncated: {} of {} bytes",
            body.len(),
            header.body_len()
        )));
    }
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
    let nonce = header.nonce(sequence);

    let plaintext = cipher
        .decrypt(
            XNonce::from_slice(&nonce),
            Payload {
                msg: body,
                aad: header_bytes,
            },
        )
        .map_err(|_| {
            VltError::decrypt(format!(
                "package {sequence} failed authentication: wrong key, corrupted data, or reordered package"
            ))
        })?;
    Ok((header, plaintext))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split(package: &[u8]) -> ([u8; PACKAGE_HEADER_SIZE], &[u8]) {
        let mut header = [0u8; PACKAGE_HEADER_SIZE];
        header.copy_from_slice(&package[..PACKAGE_HEADER_SIZE]);
        (header, &package[PACKAGE_HEADER_SIZE..])
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let key = ContentKey::generate();
        let sealed = seal_package(&key, 3, b"hello, encrypted world!", true).unwrap();
        let (header, body) = split(&sealed);

        let (parsed, plaintext) = open_package(&key, 3, &header, body).unwrap();
        assert_eq!(plaintext, b"hello, encrypted world!");
        assert!(parsed.is_final);
        assert_eq!(parsed.payload_len, 23);
    }

    #[test]
    fn test_sealed_size() {
        let key = ContentKey::generate();
        let sealed = seal_package(&key, 0, &vec![0u8; PACKAGE_SIZE], false).unwrap();
        assert_eq!(sealed.len(), PACKAGE_SIZE + PACKAGE_HEADER_SIZE + TAG_SIZE);
    }

    #[test]
    fn test_empty_and_oversized_payloads_rejected() {
        let key = ContentKey::generate();
        assert!(seal_package(&key, 0, b"", true).is_err());
        assert!(seal_package(&key, 0, &vec![0u8; PACKAGE_SIZE + 1], true).is_err());
    }

    #[test]
    fn test_wrong_sequence_fails() {
        let key = ContentKey::generate();
        let sealed = seal_package(&key, 0, b"secret data", false).unwrap();
        let (header, body) = split(&sealed);

        let result = open_package(&key, 1, &header, body);
        assert!(matches!(result, Err(VltError::Decrypt(_))));
    }

    #[test]
    fn test_forged_final_flag_fails() {
        let key = ContentKey::generate();
        let sealed = seal_package(&key, 0, b"secret data", false).unwrap();
        let (mut header, body) = split(&sealed);
        header[1] = FLAG_FINAL;

        assert!(open_package(&key, 0, &header, body).is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = ContentKey::generate();
        let mut sealed = seal_package(&key, 0, b"secret data", true).unwrap();
        sealed[PACKAGE_HEADER_SIZE + 2] ^= 0xFF;
        let (header, body) = split(&sealed);

        assert!(open_package(&key, 0, &header, body).is_err());
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = seal_package(&ContentKey::generate(), 0, b"secret", true).unwrap();
        let (header, body) = split(&sealed);

        assert!(open_package(&ContentKey::generate(), 0, &header, body).is_err());
    }

    #[test]
    fn test_unknown_format_byte() {
        let mut header = [0u8; PACKAGE_HEADER_SIZE];
        header[0] = 0x02;
        assert!(PackageHeader::parse(&header).is_err());
    }
}

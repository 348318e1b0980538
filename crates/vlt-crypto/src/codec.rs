//! Streaming container encryption and decryption
//!
//! Both directions work one package at a time: at most one package of
//! plaintext is buffered, and a package is fully authenticated before any of
//! its bytes reach the writer.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use vlt_core::{VltError, VltResult};

use crate::header::{read_header, ContainerHeader, Metadata};
use crate::keys::{ContentKey, MasterKey};
use crate::package::{open_package, seal_package, PackageHeader, PACKAGE_HEADER_SIZE};
use crate::PACKAGE_SIZE;

/// Where decryption starts and how much plaintext it emits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecryptOptions {
    /// Sequence number of the first package in the stream
    pub start_sequence: u32,
    /// Plaintext bytes to drop before emitting anything
    pub skip: u64,
    /// Stop after emitting this many bytes; `None` reads to the final package
    pub length: Option<u64>,
}

/// Returned by the metadata callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataAction {
    Continue,
    /// Skip all further decryption work
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecryptOutcome {
    Complete { bytes_written: u64, packages: u32 },
    /// The metadata callback asked to stop after package 0
    MetadataOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncryptSummary {
    /// Container header bytes, length prefix included
    pub header_len: usize,
    /// Encoded metadata bytes at the start of package 0, length prefix included
    pub metadata_len: usize,
    pub packages: u32,
    /// Total ciphertext bytes written
    pub bytes_written: u64,
    /// Plaintext content bytes consumed from the reader
    pub content_bytes: u64,
    /// BLAKE3 of the plaintext content, metadata excluded
    pub digest: [u8; 32],
}

impl EncryptSummary {
    pub fn digest_hex(&self) -> String {
        hex::encode(self.digest)
    }
}

/// Encrypt `reader` into `writer` under a fresh content key wrapped by `master`.
///
/// Cancellation is checked before each package and surfaces as
/// `VltError::Cancelled`; the writer then holds a truncated container.
pub async fn encrypt<R, W>(
    reader: &mut R,
    writer: &mut W,
    metadata: &Metadata,
    master: &MasterKey,
    cancel: &CancellationToken,
) -> VltResult<EncryptSummary>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let content_key = ContentKey::generate();
    let header = ContainerHeader::new(content_key.wrap(master)?);
    let header_bytes = header.encode()?;
    writer.write_all(&header_bytes).await?;

    let metadata_bytes = metadata.encode()?;
    let mut summary = EncryptSummary {
        header_len: header_bytes.len(),
        metadata_len: metadata_bytes.len(),
        packages: 0,
        bytes_written: header_bytes.len() as u64,
        content_bytes: 0,
        digest: [0; 32],
    };

    let mut hasher = blake3::Hasher::new();
    let mut current = Vec::with_capacity(PACKAGE_SIZE);
    current.extend_from_slice(&metadata_bytes);
    summary.content_bytes += fill_buffer(reader, &mut current, PACKAGE_SIZE).await? as u64;
    hasher.update(&current[metadata_bytes.len()..]);

    let mut sequence: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(VltError::Cancelled);
        }

        // Look one package ahead so the last one can carry the final flag
        let mut next = Vec::new();
        if current.len() == PACKAGE_SIZE {
            next.reserve(PACKAGE_SIZE);
            summary.content_bytes += fill_buffer(reader, &mut next, PACKAGE_SIZE).await? as u64;
            hasher.update(&next);
        }
        let is_final = next.is_empty();

        let sealed = seal_package(&content_key, sequence, &current, is_final)?;
        writer.write_all(&sealed).await?;
        summary.bytes_written += sealed.len() as u64;
        summary.packages += 1;

        if is_final {
            break;
        }
        current = next;
        sequence = sequence
            .checked_add(1)
            .ok_or_else(|| VltError::format("object exceeds the maximum package count"))?;
    }

    writer.flush().await?;
    summary.digest = *hasher.finalize().as_bytes();
    debug!(
        packages = summary.packages,
        content_bytes = summary.content_bytes,
        "encrypted object"
    );
    Ok(summary)
}

/// Read the container header, then decrypt every package.
pub async fn decrypt<R, W, F>(
    reader: &mut R,
    writer: &mut W,
    master: &MasterKey,
    on_metadata: F,
    cancel: &CancellationToken,
) -> VltResult<DecryptOutcome>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: FnMut(&Metadata, usize) -> MetadataAction,
{
    let header = read_header(reader).await?;
    decrypt_packages(
        reader,
        writer,
        &header,
        master,
        &DecryptOptions::default(),
        on_metadata,
        cancel,
    )
    .await
}

/// Decrypt packages from a reader positioned at package `opts.start_sequence`.
///
/// With `start_sequence == 0` and `skip == 0` the metadata prefix is parsed off
/// package 0 and handed to `on_metadata` before any content is written.
/// Otherwise the caller's `skip` already accounts for the metadata bytes and
/// the callback is not invoked.
pub async fn decrypt_packages<R, W, F>(
    reader: &mut R,
    writer: &mut W,
    header: &ContainerHeader,
    master: &MasterKey,
    opts: &DecryptOptions,
    mut on_metadata: F,
    cancel: &CancellationToken,
) -> VltResult<DecryptOutcome>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: FnMut(&Metadata, usize) -> MetadataAction,
{
    // Same error whether the header was corrupted or the key is wrong
    let content_key = ContentKey::unwrap_from(master, &header.wrapped_key)
        .map_err(|_| VltError::decrypt("cannot unwrap content key"))?;

    let parse_metadata = opts.start_sequence == 0 && opts.skip == 0;
    let mut sequence = opts.start_sequence;
    let mut skip = opts.skip;
    let mut remaining = opts.length;
    let mut bytes_written: u64 = 0;
    let mut packages: u32 = 0;
    let mut saw_final = false;

    let mut header_buf = [0u8; PACKAGE_HEADER_SIZE];
    let mut body = Vec::with_capacity(PACKAGE_SIZE + PACKAGE_HEADER_SIZE);

    loop {
        if cancel.is_cancelled() {
            return Err(VltError::Cancelled);
        }
        if remaining == Some(0) {
            break;
        }

        let n = read_up_to(reader, &mut header_buf).await?;
        if n == 0 {
            break;
        }
        if saw_final {
            return Err(VltError::decrypt("unexpected data after the final package"));
        }
        if n < PACKAGE_HEADER_SIZE {
            return Err(VltError::decrypt(format!("package {sequence} truncated")));
        }

        let package_header = PackageHeader::parse(&header_buf)?;
        body.clear();
        let got = fill_buffer(reader, &mut body, package_header.body_len()).await?;
        if got < package_header.body_len() {
            return Err(VltError::decrypt(format!("package {sequence} truncated")));
        }

        let (package_header, plaintext) =
            open_package(&content_key, sequence, &header_buf, &body)?;
        if !package_header.is_final && package_header.payload_len != PACKAGE_SIZE {
            return Err(VltError::decrypt(format!(
                "package {sequence} is short but not final"
            )));
        }

        let mut content: &[u8] = &plaintext;
        if parse_metadata && packages == 0 {
            let (metadata, consumed) = Metadata::decode_prefix(content)?;
            if on_metadata(&metadata, consumed) == MetadataAction::Stop {
                return Ok(DecryptOutcome::MetadataOnly);
            }
            content = &content[consumed..];
        }

        if skip > 0 {
            let dropped = skip.min(content.len() as u64);
            content = &content[dropped as usize..];
            skip -= dropped;
        }
        if let Some(left) = remaining.as_mut() {
            let take = (*left).min(content.len() as u64);
            content = &content[..take as usize];
            *left -= take;
        }

        writer.write_all(content).await?;
        bytes_written += content.len() as u64;
        packages += 1;
        saw_final = package_header.is_final;
        sequence = sequence
            .checked_add(1)
            .ok_or_else(|| VltError::format("package sequence overflow"))?;
    }

    if !saw_final && remaining != Some(0) {
        return Err(VltError::decrypt(format!(
            "stream ended before the final package (after package {})",
            sequence.saturating_sub(1)
        )));
    }

    writer.flush().await?;
    debug!(packages, bytes_written, "decrypted object");
    Ok(DecryptOutcome::Complete {
        bytes_written,
        packages,
    })
}

/// Encrypt an in-memory buffer.
pub async fn encrypt_bytes(
    data: &[u8],
    metadata: &Metadata,
    master: &MasterKey,
) -> VltResult<Vec<u8>> {
    let mut reader = data;
    let mut out = Vec::with_capacity(data.len() + data.len() / PACKAGE_SIZE * 32 + 256);
    encrypt(
        &mut reader,
        &mut out,
        metadata,
        master,
        &CancellationToken::new(),
    )
    .await?;
    Ok(out)
}

/// Decrypt an in-memory container.
pub async fn decrypt_bytes(data: &[u8], master: &MasterKey) -> VltResult<(Metadata, Vec<u8>)> {
    let mut reader = data;
    let mut out = Vec::with_capacity(data.len());
    let mut metadata = Metadata::default();
    decrypt(
        &mut reader,
        &mut out,
        master,
        |m, _| {
            metadata = m.clone();
            MetadataAction::Continue
        },
        &CancellationToken::new(),
    )
    .await?;
    Ok((metadata, out))
}

/// Append from `reader` until `buf` holds `cap` bytes or the reader is
/// exhausted. Returns the number of bytes appended.
async fn fill_buffer<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    cap: usize,
) -> VltResult<usize> {
    let start = buf.len();
    if start >= cap {
        return Ok(0);
    }
    let mut limited = (&mut *reader).take((cap - start) as u64);
    limited.read_to_end(buf).await?;
    Ok(buf.len() - start)
}

async fn read_up_to<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> VltResult<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::TAG_SIZE;

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_roundtrip_small() {
        let master = MasterKey::generate();
        let metadata = Metadata::new("notes.txt", "text/plain", 11);

        let encrypted = encrypt_bytes(b"hello vault", &metadata, &master).await.unwrap();
        let (parsed, plaintext) = decrypt_bytes(&encrypted, &master).await.unwrap();

        assert_eq!(parsed, metadata);
        assert_eq!(plaintext, b"hello vault");
    }

    #[tokio::test]
    async fn test_roundtrip_empty_content() {
        let master = MasterKey::generate();
        let encrypted = encrypt_bytes(b"", &Metadata::default(), &master).await.unwrap();
        let (parsed, plaintext) = decrypt_bytes(&encrypted, &master).await.unwrap();

        assert_eq!(parsed, Metadata::default());
        assert!(plaintext.is_empty());
    }

    #[tokio::test]
    async fn test_package_layout() {
        let master = MasterKey::generate();
        let metadata = Metadata::new("big.bin", "", 0);
        let meta_len = metadata.encode().unwrap().len();
        // Exactly two full packages of plaintext
        let data = sample(2 * PACKAGE_SIZE - meta_len);

        let mut out = Vec::new();
        let summary = encrypt(
            &mut &data[..],
            &mut out,
            &metadata,
            &master,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(summary.packages, 2);
        assert_eq!(summary.metadata_len, meta_len);
        assert_eq!(summary.content_bytes, data.len() as u64);
        assert_eq!(summary.digest, *blake3::hash(&data).as_bytes());
        assert_eq!(
            out.len(),
            summary.header_len + 2 * (PACKAGE_SIZE + PACKAGE_HEADER_SIZE + TAG_SIZE)
        );
        assert_eq!(summary.bytes_written, out.len() as u64);
    }

    #[tokio::test]
    async fn test_metadata_only_stops_early() {
        let master = MasterKey::generate();
        let metadata = Metadata::new("movie.mkv", "video/x-matroska", 300_000);
        let encrypted = encrypt_bytes(&sample(300_000), &metadata, &master).await.unwrap();

        let mut out = Vec::new();
        let mut seen = None;
        let outcome = decrypt(
            &mut &encrypted[..],
            &mut out,
            &master,
            |m, len| {
                seen = Some((m.clone(), len));
                MetadataAction::Stop
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(outcome, DecryptOutcome::MetadataOnly);
        assert!(out.is_empty());
        let (m, len) = seen.unwrap();
        assert_eq!(m, metadata);
        assert_eq!(len, metadata.encode().unwrap().len());
    }

    #[tokio::test]
    async fn test_wrong_master_key() {
        let encrypted = encrypt_bytes(b"secret", &Metadata::default(), &MasterKey::generate())
            .await
            .unwrap();
        let err = decrypt_bytes(&encrypted, &MasterKey::generate())
            .await
            .unwrap_err();
        assert!(matches!(err, VltError::Decrypt(_)));
    }

    #[tokio::test]
    async fn test_truncated_at_package_boundary() {
        let master = MasterKey::generate();
        let encrypted = encrypt_bytes(&sample(PACKAGE_SIZE * 2), &Metadata::default(), &master)
            .await
            .unwrap();
        let header_len = read_header(&mut &encrypted[..]).await.unwrap().encoded_len;
        // Keep only the first (non-final) package
        let cut = header_len + PACKAGE_SIZE + PACKAGE_HEADER_SIZE + TAG_SIZE;

        let err = decrypt_bytes(&encrypted[..cut], &master).await.unwrap_err();
        assert!(matches!(err, VltError::Decrypt(_)), "{err}");
    }

    #[tokio::test]
    async fn test_truncated_mid_package() {
        let master = MasterKey::generate();
        let encrypted = encrypt_bytes(&sample(1000), &Metadata::default(), &master)
            .await
            .unwrap();

        let err = decrypt_bytes(&encrypted[..encrypted.len() - 1], &master)
            .await
            .unwrap_err();
        assert!(matches!(err, VltError::Decrypt(_)));
    }

    #[tokio::test]
    async fn test_trailing_data_rejected() {
        let master = MasterKey::generate();
        let mut encrypted = encrypt_bytes(&sample(10), &Metadata::default(), &master)
            .await
            .unwrap();
        encrypted.extend_from_slice(&[0u8; 40]);

        assert!(decrypt_bytes(&encrypted, &master).await.is_err());
    }

    #[tokio::test]
    async fn test_tampered_package_emits_nothing() {
        let master = MasterKey::generate();
        let mut encrypted = encrypt_bytes(&sample(5000), &Metadata::default(), &master)
            .await
            .unwrap();
        let last = encrypted.len() - TAG_SIZE - 1;
        encrypted[last] ^= 0x01;

        let mut out = Vec::new();
        let err = decrypt(
            &mut &encrypted[..],
            &mut out,
            &master,
            |_, _| MetadataAction::Continue,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, VltError::Decrypt(_)));
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_decrypt_from_later_package() {
        let master = MasterKey::generate();
        let data = sample(3 * PACKAGE_SIZE);
        let encrypted = encrypt_bytes(&data, &Metadata::default(), &master)
            .await
            .unwrap();
        let mut reader = &encrypted[..];
        let header = read_header(&mut reader).await.unwrap();
        let meta_len = Metadata::default().encode().unwrap().len();

        // Skip package 0 entirely and start at package 1
        let package_len = PACKAGE_SIZE + PACKAGE_HEADER_SIZE + TAG_SIZE;
        let mut rest = &reader[package_len..];
        let opts = DecryptOptions {
            start_sequence: 1,
            skip: 10,
            length: Some(100),
        };
        let mut out = Vec::new();
        decrypt_packages(
            &mut rest,
            &mut out,
            &header,
            &master,
            &opts,
            |_, _| MetadataAction::Continue,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        let logical_start = PACKAGE_SIZE - meta_len + 10;
        assert_eq!(out, &data[logical_start..logical_start + 100]);
    }

    #[tokio::test]
    async fn test_wrong_start_sequence_fails() {
        let master = MasterKey::generate();
        let encrypted = encrypt_bytes(&sample(100), &Metadata::default(), &master)
            .await
            .unwrap();
        let mut reader = &encrypted[..];
        let header = read_header(&mut reader).await.unwrap();

        let opts = DecryptOptions {
            start_sequence: 4,
            ..Default::default()
        };
        let err = decrypt_packages(
            &mut reader,
            &mut Vec::<u8>::new(),
            &header,
            &master,
            &opts,
            |_, _| MetadataAction::Continue,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, VltError::Decrypt(_)));
    }

    #[tokio::test]
    async fn test_cancellation_is_distinct() {
        let master = MasterKey::generate();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let data = sample(10);
        let err = encrypt(
            &mut &data[..],
            &mut Vec::<u8>::new(),
            &Metadata::default(),
            &master,
            &cancel,
        )
        .await
        .unwrap_err();
        assert!(err.is_cancelled());
    }
}

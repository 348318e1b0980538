//! Container round-trips, tamper detection and ranged decryption through
//! the public API.

use proptest::prelude::*;
use tokio_util::sync::CancellationToken;
use vlt_core::VltError;
use vlt_crypto::{
    decrypt_bytes, decrypt_packages, encrypt, encrypt_bytes, read_header, DecryptOptions,
    MasterKey, Metadata, MetadataAction, RequestRange, PACKAGE_OVERHEAD, PACKAGE_SIZE,
};

fn make_data(size: usize) -> Vec<u8> {
    (0..size)
        .map(|i| (i.wrapping_mul(31) ^ (i >> 7)) as u8)
        .collect()
}

struct Sealed {
    bytes: Vec<u8>,
    header_len: usize,
    metadata_len: usize,
}

async fn seal(data: &[u8], metadata: &Metadata, master: &MasterKey) -> Sealed {
    let mut bytes = Vec::new();
    let summary = encrypt(
        &mut &data[..],
        &mut bytes,
        metadata,
        master,
        &CancellationToken::new(),
    )
    .await
    .unwrap();
    Sealed {
        bytes,
        header_len: summary.header_len,
        metadata_len: summary.metadata_len,
    }
}

/// Fetch the physical range for `[start, start+length)` and decrypt it the
/// way a ranged reader would.
async fn read_range(
    sealed: &Sealed,
    master: &MasterKey,
    size: u64,
    start: u64,
    length: u64,
) -> Result<Vec<u8>, VltError> {
    let mut rng = RequestRange::new(
        start,
        length,
        sealed.header_len as u64,
        sealed.metadata_len as u64,
    )?;
    rng.set_file_size(size);
    if rng.is_empty() {
        return Ok(Vec::new());
    }

    let header = read_header(&mut &sealed.bytes[..]).await?;
    let from = rng.start_bytes() as usize;
    let to = rng
        .end_bytes()
        .map_or(sealed.bytes.len(), |end| (end as usize).min(sealed.bytes.len()));
    let opts = DecryptOptions {
        start_sequence: rng.start_package() as u32,
        skip: rng.skip_beginning(),
        length: Some(rng.length),
    };

    let mut out = Vec::new();
    decrypt_packages(
        &mut &sealed.bytes[from..to],
        &mut out,
        &header,
        master,
        &opts,
        |_, _| MetadataAction::Continue,
        &CancellationToken::new(),
    )
    .await?;
    Ok(out)
}

#[tokio::test]
async fn roundtrip_across_package_boundaries() {
    let master = MasterKey::generate();
    let metadata = Metadata::new("boundaries.bin", "application/octet-stream", 0);
    let meta_len = metadata.encode().unwrap().len();

    let mut lengths = vec![0, 1, 2, 1000, 3 * PACKAGE_SIZE, 3 * PACKAGE_SIZE + 1];
    for k in 1..=3 {
        let boundary = k * PACKAGE_SIZE - meta_len;
        lengths.extend([boundary - 1, boundary, boundary + 1]);
    }

    for len in lengths {
        let data = make_data(len);
        let metadata = Metadata {
            size: len as u64,
            ..metadata.clone()
        };
        let encrypted = encrypt_bytes(&data, &metadata, &master).await.unwrap();
        let (parsed, plaintext) = decrypt_bytes(&encrypted, &master).await.unwrap();

        assert_eq!(parsed, metadata, "len={len}");
        assert_eq!(plaintext.len(), len, "len={len}");
        assert!(plaintext == data, "content mismatch at len={len}");

        let packages = (meta_len + len).div_ceil(PACKAGE_SIZE).max(1);
        let header_len = read_header(&mut &encrypted[..]).await.unwrap().encoded_len;
        assert_eq!(
            encrypted.len(),
            header_len + meta_len + len + packages * PACKAGE_OVERHEAD,
            "len={len}"
        );
    }
}

#[tokio::test]
async fn digest_covers_content_only() {
    let master = MasterKey::generate();
    for len in [0, 10, PACKAGE_SIZE - 40, PACKAGE_SIZE, 2 * PACKAGE_SIZE + 7] {
        let data = make_data(len);
        let mut digests = Vec::new();
        for name in ["a", "a much longer name that shifts the package split.bin"] {
            let mut out = Vec::new();
            let summary = encrypt(
                &mut &data[..],
                &mut out,
                &Metadata::new(name, "", len as u64),
                &master,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
            digests.push(summary.digest_hex());
        }
        assert_eq!(digests[0], digests[1], "len={len}");
        assert_eq!(digests[0], blake3::hash(&data).to_hex().to_string(), "len={len}");
    }
}

#[tokio::test]
async fn tampering_with_any_package_fails() {
    let master = MasterKey::generate();
    let data = make_data(2 * PACKAGE_SIZE + 500);
    let sealed = seal(&data, &Metadata::default(), &master).await;
    let physical = PACKAGE_SIZE + PACKAGE_OVERHEAD;

    for package in 0..3 {
        let mut bytes = sealed.bytes.clone();
        // A ciphertext byte well inside the package
        let at = sealed.header_len + package * physical + 100;
        bytes[at] ^= 0x40;

        let err = decrypt_bytes(&bytes, &master).await.unwrap_err();
        assert!(matches!(err, VltError::Decrypt(_)), "package {package}: {err}");
    }
}

#[tokio::test]
async fn tampered_package_emits_no_bytes_from_it() {
    let master = MasterKey::generate();
    let data = make_data(2 * PACKAGE_SIZE);
    let sealed = seal(&data, &Metadata::default(), &master).await;
    let mut bytes = sealed.bytes.clone();
    let second = sealed.header_len + PACKAGE_SIZE + PACKAGE_OVERHEAD + 20;
    bytes[second] ^= 0x01;

    let mut out = Vec::new();
    let mut reader = &bytes[..];
    let header = read_header(&mut reader).await.unwrap();
    let err = decrypt_packages(
        &mut reader,
        &mut out,
        &header,
        &master,
        &DecryptOptions::default(),
        |_, _| MetadataAction::Continue,
        &CancellationToken::new(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, VltError::Decrypt(_)));
    // Only package 0's content made it out
    assert_eq!(out.len(), PACKAGE_SIZE - sealed.metadata_len);
    assert_eq!(out, &data[..out.len()]);
}

#[tokio::test]
async fn swapped_packages_fail() {
    let master = MasterKey::generate();
    let data = make_data(3 * PACKAGE_SIZE);
    let sealed = seal(&data, &Metadata::default(), &master).await;
    let physical = PACKAGE_SIZE + PACKAGE_OVERHEAD;

    let mut bytes = sealed.bytes.clone();
    let first = sealed.header_len + physical;
    let (a, b) = bytes[first..first + 2 * physical].split_at_mut(physical);
    a.swap_with_slice(b);

    assert!(decrypt_bytes(&bytes, &master).await.is_err());
}

#[tokio::test]
async fn range_600107_bytes() {
    let master = MasterKey::generate();
    let data = make_data(600_107);
    let sealed = seal(&data, &Metadata::new("big.bin", "", 600_107), &master).await;

    let out = read_range(&sealed, &master, 600_107, 60_000, 8_000)
        .await
        .unwrap();
    assert!(out == data[60_000..68_000]);

    let tail = read_range(&sealed, &master, 600_107, 599_000, 0)
        .await
        .unwrap();
    assert!(tail == data[599_000..]);

    let empty = read_range(&sealed, &master, 600_107, 600_107, 10)
        .await
        .unwrap();
    assert!(empty.is_empty());
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Decrypting the translated physical range and trimming reproduces
    /// exactly the requested logical bytes
    #[test]
    fn ranged_read_matches_source(
        size in 1usize..(3 * PACKAGE_SIZE + 10),
        start_frac in 0.0f64..1.1,
        length in 0u64..(2 * PACKAGE_SIZE as u64),
        name_len in 0usize..300,
    ) {
        let rt = runtime();
        let master = MasterKey::generate();
        let data = make_data(size);
        let metadata = Metadata::new("n".repeat(name_len), "", size as u64);
        let sealed = rt.block_on(seal(&data, &metadata, &master));

        let start = (size as f64 * start_frac) as u64;
        let out = rt
            .block_on(read_range(&sealed, &master, size as u64, start, length))
            .unwrap();

        let from = (start as usize).min(size);
        let to = if length == 0 { size } else { (from + length as usize).min(size) };
        prop_assert_eq!(out.len(), to - from);
        prop_assert!(out == data[from..to]);
    }

    /// Full decryption reproduces content and metadata
    #[test]
    fn roundtrip_arbitrary(
        data in proptest::collection::vec(any::<u8>(), 0..(PACKAGE_SIZE + 2048)),
        name in "[a-zA-Z0-9 ._-]{0,40}",
        content_type in "[a-z]{0,10}(/[a-z0-9.+-]{1,20})?",
    ) {
        let rt = runtime();
        let master = MasterKey::generate();
        let metadata = Metadata::new(name, content_type, data.len() as u64);

        let encrypted = rt.block_on(encrypt_bytes(&data, &metadata, &master)).unwrap();
        let (parsed, plaintext) = rt.block_on(decrypt_bytes(&encrypted, &master)).unwrap();
        prop_assert_eq!(parsed, metadata);
        prop_assert_eq!(plaintext, data);
    }
}

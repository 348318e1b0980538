use vlt_crypto::package::seal_package;
use vlt_crypto::{decrypt_bytes, encrypt_bytes, ContentKey, MasterKey, Metadata};

fn make_data(size: usize) -> Vec<u8> {
    (0..size)
        .map(|i| (i.wrapping_mul(7) ^ (i >> 3)) as u8)
        .collect()
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap()
}

#[divan::bench(args = [1024, 65536])]
fn bench_seal_package(bencher: divan::Bencher, size: usize) {
    let key = ContentKey::generate();
    let data = make_data(size);
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| seal_package(divan::black_box(&key), 0, divan::black_box(&data), true).unwrap());
}

#[divan::bench(args = [65536, 1048576, 8388608])]
fn bench_encrypt(bencher: divan::Bencher, size: usize) {
    let rt = runtime();
    let master = MasterKey::generate();
    let metadata = Metadata::new("bench.bin", "application/octet-stream", size as u64);
    let data = make_data(size);
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| {
            rt.block_on(encrypt_bytes(
                divan::black_box(&data),
                &metadata,
                divan::black_box(&master),
            ))
            .unwrap()
        });
}

#[divan::bench(args = [65536, 1048576, 8388608])]
fn bench_decrypt(bencher: divan::Bencher, size: usize) {
    let rt = runtime();
    let master = MasterKey::generate();
    let data = make_data(size);
    let encrypted = rt
        .block_on(encrypt_bytes(&data, &Metadata::default(), &master))
        .unwrap();
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| {
            rt.block_on(decrypt_bytes(
                divan::black_box(&encrypted),
                divan::black_box(&master),
            ))
            .unwrap()
        });
}

fn main() {
    divan::main();
}

use std::sync::Arc;

use sdrive_crypto::{AesGcmProvider, ChunkCipher, SecretKey, StreamParams};

fn make_data(size: usize) -> Vec<u8> {
    (0..size)
        .map(|i| (i.wrapping_mul(7) ^ (i >> 3)) as u8)
        .collect()
}

fn cipher(size: usize) -> ChunkCipher {
    let params = StreamParams::new(
        "bench-stream",
        size as u32,
        size as u64,
        "application/octet-stream",
    )
    .unwrap();
    ChunkCipher::new(
        Arc::new(AesGcmProvider::new()),
        &SecretKey::from_bytes([0xAB; 32]),
        params,
    )
    .unwrap()
}

#[divan::bench(args = [1024, 65536, 1048576])]
fn bench_encrypt_chunk(bencher: divan::Bencher, size: usize) {
    let cipher = cipher(size);
    let data = make_data(size);
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| {
            cipher
                .encrypt_chunk(0, divan::black_box(&data))
                .unwrap()
        });
}

#[divan::bench(args = [1024, 65536, 1048576])]
fn bench_decrypt_chunk(bencher: divan::Bencher, size: usize) {
    let cipher = cipher(size);
    let data = make_data(size);
    let package = cipher.encrypt_chunk(0, &data).unwrap().to_package();
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| {
            cipher
                .decrypt_chunk(0, divan::black_box(&package))
                .unwrap()
        });
}

#[divan::bench]
fn bench_derive_dek() -> SecretKey {
    let fmk = SecretKey::from_bytes([3u8; 32]);
    sdrive_crypto::derive_dek(divan::black_box(&fmk), "file-1", 1).unwrap()
}

fn main() {
    divan::main();
}

//! Test fixtures for generating test data.

use bytes::Bytes;
use hoard_core::CacheTriple;
use hoard_storage::{ByteStream, StorageResult};
use sha2::{Digest, Sha256};

/// Generate deterministic test data based on a seed.
pub fn seeded_bytes(seed: u64, len: usize) -> Bytes {
    let mut data = vec![0u8; len];
    let mut state = seed;

    for chunk in data.chunks_mut(8) {
        // Simple LCG for deterministic data
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        let bytes = state.to_le_bytes();
        for (i, byte) in chunk.iter_mut().enumerate() {
            *byte = bytes[i % 8];
        }
    }

    Bytes::from(data)
}

/// Compute SHA-256 hash of data as hex string.
#[allow(dead_code)]
pub fn sha256_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    result.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Split data into chunks of specified size.
#[allow(dead_code)]
pub fn split_into_chunks(data: &[u8], chunk_size: usize) -> Vec<Bytes> {
    data.chunks(chunk_size)
        .map(Bytes::copy_from_slice)
        .collect()
}

/// Stream `data` in chunks of `chunk_size`.
#[allow(dead_code)]
pub fn chunked_stream(data: &[u8], chunk_size: usize) -> ByteStream {
    let chunks: Vec<StorageResult<Bytes>> = split_into_chunks(data, chunk_size)
        .into_iter()
        .map(Ok)
        .collect();
    Box::pin(futures::stream::iter(chunks))
}

/// A triple in the default test version and scope.
#[allow(dead_code)]
pub fn triple(key: &str) -> CacheTriple {
    CacheTriple::new(key, "v1", "refs/heads/main").expect("valid triple")
}

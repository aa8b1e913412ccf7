pub mod contract;
pub mod fixtures;

#[allow(unused_imports)]
pub use fixtures::{chunked_stream, read_object, seeded_bytes, sha256_hash};

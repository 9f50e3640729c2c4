pub mod fixtures;

#[allow(unused_imports)]
pub use fixtures::{collect_stream, seeded_bytes, sha256_hash};

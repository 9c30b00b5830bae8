mod minhash;
mod simhash;

pub use minhash::MinHashPreprocessor;
pub use simhash::SimHashPreprocessor;

use tracing::warn;

/// Text normalization and near-duplicate removal ahead of extraction.
/// Strategies are selected per job by tag.
pub trait Preprocessor: Send + Sync {
    fn describe(&self) -> &'static str;

    /// Normalize a single text.
    fn process(&self, text: &str) -> String;

    /// Drop near-duplicate texts, keeping the first occurrence of each
    /// equivalence class.
    fn dedupe(&self, texts: Vec<String>) -> Vec<String>;
}

pub fn preprocessor_for(tag: &str) -> Box<dyn Preprocessor> {
    match tag {
        "simhash" => Box::new(SimHashPreprocessor::new()),
        "minhash" => Box::new(MinHashPreprocessor::default()),
        other => {
            warn!(tag = other, "unknown preprocess algorithm, using simhash");
            Box::new(SimHashPreprocessor::new())
        }
    }
}

/// md5 of a whitespace token, reduced to the lower 64 bits the fingerprint
/// algorithms operate on.
pub(crate) fn token_hash(token: &str) -> u64 {
    use md5::{Digest, Md5};

    let digest = Md5::digest(token.as_bytes());
    let mut lower = [0u8; 8];
    lower.copy_from_slice(&digest[8..16]);
    u64::from_be_bytes(lower)
}

/// The full 128-bit md5 digest, for algorithms that reduce modulo a large
/// prime-ish modulus instead of truncating.
pub(crate) fn token_hash_wide(token: &str) -> u128 {
    use md5::{Digest, Md5};

    let digest = Md5::digest(token.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest);
    u128::from_be_bytes(bytes)
}

use std::collections::HashMap;

use tracing::debug;

use super::{token_hash, Preprocessor};

/// Two texts are near-duplicates when their 64-bit fingerprints differ in
/// at most this many bits.
const HAMMING_THRESHOLD: u32 = 3;

/// Frequency-weighted 64-bit SimHash over whitespace tokens.
pub struct SimHashPreprocessor;

impl SimHashPreprocessor {
    pub fn new() -> Self {
        Self
    }

    pub fn fingerprint(text: &str) -> u64 {
        let mut weights: HashMap<&str, i64> = HashMap::new();
        for token in text.split_whitespace() {
            *weights.entry(token).or_insert(0) += 1;
        }
        if weights.is_empty() {
            return 0;
        }

        let mut accumulator = [0i64; 64];
        for (token, weight) in weights {
            let hash = token_hash(token);
            for (bit, slot) in accumulator.iter_mut().enumerate() {
                if (hash >> bit) & 1 == 1 {
                    *slot += weight;
                } else {
                    *slot -= weight;
                }
            }
        }

        let mut fingerprint = 0u64;
        for (bit, slot) in accumulator.iter().enumerate() {
            if *slot > 0 {
                fingerprint |= 1 << bit;
            }
        }
        fingerprint
    }

    pub fn hamming_distance(a: u64, b: u64) -> u32 {
        (a ^ b).count_ones()
    }
}

impl Default for SimHashPreprocessor {
    fn default() -> Self {
        Self::new()
    }
}

impl Preprocessor for SimHashPreprocessor {
    fn describe(&self) -> &'static str {
        "simhash"
    }

    fn process(&self, text: &str) -> String {
        text.trim().to_string()
    }

    fn dedupe(&self, texts: Vec<String>) -> Vec<String> {
        let mut unique_texts: Vec<String> = Vec::with_capacity(texts.len());
        let mut unique_hashes: Vec<u64> = Vec::with_capacity(texts.len());

        for text in texts {
            let fingerprint = Self::fingerprint(&text);
            let duplicate = unique_hashes
                .iter()
                .any(|kept| Self::hamming_distance(fingerprint, *kept) <= HAMMING_THRESHOLD);

            if duplicate {
                debug!(fingerprint, "dropping near-duplicate text");
            } else {
                unique_texts.push(text);
                unique_hashes.push(fingerprint);
            }
        }

        unique_texts
    }
}

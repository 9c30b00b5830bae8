use std::collections::HashSet;

use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::debug;

use super::{token_hash_wide, Preprocessor};

/// Number of hash permutations in a signature.
const NUM_PERMUTATIONS: usize = 128;
/// Modulus for the permutation arithmetic.
const MODULUS: u128 = 1_000_000_000_000_000_000;
/// Seed for the permutation draw, fixed so signatures are comparable across
/// texts processed by the same preprocessor instance.
const PERMUTATION_SEED: u64 = 0x6d69_6e68_6173_68;

/// MinHash signatures over the token *set* of each text; similarity is the
/// fraction of matching signature positions.
pub struct MinHashPreprocessor {
    permutations: Vec<(u64, u64)>,
    threshold: f64,
}

impl MinHashPreprocessor {
    pub fn new(threshold: f64) -> Self {
        let mut rng = StdRng::seed_from_u64(PERMUTATION_SEED);
        let permutations = (0..NUM_PERMUTATIONS)
            .map(|_| (rng.gen_range(1..=1_000_000), rng.gen_range(0..=1_000_000)))
            .collect();

        Self {
            permutations,
            threshold,
        }
    }

    pub fn signature(&self, text: &str) -> Vec<u64> {
        let tokens: HashSet<&str> = text.split_whitespace().collect();
        if tokens.is_empty() {
            return vec![0; NUM_PERMUTATIONS];
        }

        let hashes: Vec<u128> = tokens
            .iter()
            .map(|token| token_hash_wide(token) % MODULUS)
            .collect();

        self.permutations
            .iter()
            .map(|(a, b)| {
                hashes
                    .iter()
                    .map(|h| {
                        let value = (u128::from(*a) * h + u128::from(*b)) % MODULUS;
                        #[allow(clippy::cast_possible_truncation)]
                        {
                            value as u64
                        }
                    })
                    .min()
                    .unwrap_or(0)
            })
            .collect()
    }

    pub fn similarity(a: &[u64], b: &[u64]) -> f64 {
        if a.len() != b.len() || a.is_empty() {
            return 0.0;
        }

        let matches = a.iter().zip(b.iter()).filter(|(x, y)| x == y).count();
        #[allow(clippy::cast_precision_loss)]
        {
            matches as f64 / a.len() as f64
        }
    }
}

impl Default for MinHashPreprocessor {
    fn default() -> Self {
        Self::new(0.7)
    }
}

impl Preprocessor for MinHashPreprocessor {
    fn describe(&self) -> &'static str {
        "minhash"
    }

    fn process(&self, text: &str) -> String {
        text.trim().to_string()
    }

    fn dedupe(&self, texts: Vec<String>) -> Vec<String> {
        let mut unique_texts: Vec<String> = Vec::with_capacity(texts.len());
        let mut unique_signatures: Vec<Vec<u64>> = Vec::with_capacity(texts.len());

        for text in texts {
            let signature = self.signature(&text);
            let duplicate = unique_signatures
                .iter()
                .any(|kept| Self::similarity(&signature, kept) >= self.threshold);

            if duplicate {
                debug!("dropping near-duplicate text by minhash signature");
            } else {
                unique_texts.push(text);
                unique_signatures.push(signature);
            }
        }

        unique_texts
    }
}

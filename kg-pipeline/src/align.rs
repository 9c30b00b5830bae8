use std::collections::{HashMap, HashSet};

use tracing::info;

use crate::types::{AlignedEntity, EntityMention, Triple};

/// Merges duplicate mentions across documents into canonical entities.
///
/// Single deterministic pass: each unmerged mention opens a cluster and
/// absorbs every later unmerged mention whose similarity reaches the
/// threshold.
pub struct EntityAligner {
    threshold: f64,
}

impl EntityAligner {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    fn preprocess_name(name: &str) -> String {
        let lowered = name.to_lowercase();
        let stripped: String = lowered
            .chars()
            .filter(|c| !c.is_ascii_punctuation())
            .collect();
        stripped.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    /// Name similarity over preprocessed names. A containment match counts
    /// as a full name match so cross-document shorthand ("百度" vs
    /// "百度公司") clusters with its long form.
    fn name_similarity(a: &str, b: &str) -> f64 {
        let a = Self::preprocess_name(a);
        let b = Self::preprocess_name(b);
        if a.is_empty() || b.is_empty() {
            return 0.0;
        }
        if a == b {
            return 1.0;
        }
        if a.contains(&b) || b.contains(&a) {
            return 1.0;
        }
        strsim::normalized_levenshtein(&a, &b)
    }

    /// Weighted similarity: 0.7 name, 0.3 type (half credit for a type
    /// mismatch). Exact name equality short-circuits to 1.
    pub fn similarity(&self, a: &EntityMention, b: &EntityMention) -> f64 {
        let name_similarity = Self::name_similarity(&a.name, &b.name);
        if (name_similarity - 1.0).abs() < f64::EPSILON
            && Self::preprocess_name(&a.name) == Self::preprocess_name(&b.name)
        {
            return 1.0;
        }

        let type_similarity = if a.entity_type == b.entity_type {
            1.0
        } else {
            0.5
        };

        name_similarity * 0.7 + type_similarity * 0.3
    }

    /// Returns the canonical entities plus the mention-id -> canonical-id
    /// merge map for rewriting triples.
    pub fn align(
        &self,
        mentions: &[EntityMention],
    ) -> (Vec<AlignedEntity>, HashMap<String, String>) {
        let mut aligned: Vec<AlignedEntity> = Vec::new();
        let mut merge_map: HashMap<String, String> = HashMap::new();
        let mut processed: HashSet<usize> = HashSet::new();

        for i in 0..mentions.len() {
            if processed.contains(&i) {
                continue;
            }
            processed.insert(i);

            let Some(seed) = mentions.get(i) else {
                continue;
            };
            let mut canonical = AlignedEntity {
                id: seed.id.clone(),
                name: seed.name.clone(),
                entity_type: seed.entity_type.clone(),
                merged_ids: vec![seed.id.clone()],
                attributes: Default::default(),
            };

            for j in (i + 1)..mentions.len() {
                if processed.contains(&j) {
                    continue;
                }
                let Some(candidate) = mentions.get(j) else {
                    continue;
                };

                let probe = EntityMention {
                    id: canonical.id.clone(),
                    name: canonical.name.clone(),
                    entity_type: canonical.entity_type.clone(),
                    start_pos: 0,
                    end_pos: 0,
                    confidence: None,
                };
                if self.similarity(&probe, candidate) < self.threshold {
                    continue;
                }

                processed.insert(j);
                merge_map.insert(candidate.id.clone(), canonical.id.clone());
                canonical.merged_ids.push(candidate.id.clone());

                // the longer surface form becomes the canonical name
                if candidate.name.chars().count() > canonical.name.chars().count() {
                    canonical.name = candidate.name.clone();
                }
            }

            aligned.push(canonical);
        }

        info!(
            mentions = mentions.len(),
            aligned = aligned.len(),
            "entity alignment finished"
        );

        (aligned, merge_map)
    }

    /// Rewrites triple endpoints through the merge map and drops duplicate
    /// tuples, keeping first occurrences.
    pub fn adjust_triples(
        triples: Vec<Triple>,
        merge_map: &HashMap<String, String>,
    ) -> Vec<Triple> {
        let mut seen: HashSet<(String, String, String)> = HashSet::new();
        let mut adjusted = Vec::with_capacity(triples.len());

        for mut triple in triples {
            if let Some(canonical) = merge_map.get(&triple.head_id) {
                triple.head_id = canonical.clone();
            }
            if let Some(canonical) = merge_map.get(&triple.tail_id) {
                triple.tail_id = canonical.clone();
            }

            let key = (
                triple.head_id.clone(),
                triple.relation.clone(),
                triple.tail_id.clone(),
            );
            if seen.insert(key) {
                adjusted.push(triple);
            }
        }

        adjusted
    }
}

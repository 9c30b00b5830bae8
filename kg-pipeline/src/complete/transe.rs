use std::collections::{BTreeSet, HashMap, HashSet};

use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::types::{AlignedEntity, Triple};

use super::KnowledgeCompleter;

/// Fixed training seed keeps completion reproducible for a given job.
const TRAINING_SEED: u64 = 0x7472_616e_7365;
/// Tails suggested per (head, relation) pair.
const TOP_TAILS: usize = 3;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TransEConfig {
    pub embedding_dim: usize,
    pub margin: f64,
    pub learning_rate: f64,
    pub epochs: usize,
}

impl Default for TransEConfig {
    fn default() -> Self {
        Self {
            embedding_dim: 50,
            margin: 1.0,
            learning_rate: 0.01,
            epochs: 100,
        }
    }
}

/// Translational embeddings: a relation is a vector translating its head
/// towards its tail; plausible missing tails sit close to `h + r`.
pub struct TransEModel {
    config: TransEConfig,
    entity_embeddings: HashMap<String, Vec<f64>>,
    relation_embeddings: HashMap<String, Vec<f64>>,
    trained: bool,
    rng: StdRng,
}

/// Lossless serialized form of a trained model.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct TransESnapshot {
    pub config: TransEConfig,
    pub entity_embeddings: HashMap<String, Vec<f64>>,
    pub relation_embeddings: HashMap<String, Vec<f64>>,
    pub trained: bool,
}

impl PartialEq for TransEConfig {
    fn eq(&self, other: &Self) -> bool {
        self.embedding_dim == other.embedding_dim
            && self.margin.to_bits() == other.margin.to_bits()
            && self.learning_rate.to_bits() == other.learning_rate.to_bits()
            && self.epochs == other.epochs
    }
}

impl TransEModel {
    pub fn new(config: TransEConfig) -> Self {
        Self {
            config,
            entity_embeddings: HashMap::new(),
            relation_embeddings: HashMap::new(),
            trained: false,
            rng: StdRng::seed_from_u64(TRAINING_SEED),
        }
    }

    pub fn is_trained(&self) -> bool {
        self.trained
    }

    fn init_vector(&mut self) -> Vec<f64> {
        let dim = self.config.embedding_dim;
        #[allow(clippy::cast_precision_loss)]
        let bound = 6.0 / (dim as f64).sqrt();
        let mut vector: Vec<f64> = (0..dim).map(|_| self.rng.gen_range(-bound..bound)).collect();
        l2_normalize(&mut vector);
        vector
    }

    fn initialize_embeddings(&mut self, entities: &BTreeSet<String>, relations: &BTreeSet<String>) {
        self.entity_embeddings.clear();
        self.relation_embeddings.clear();

        for entity in entities {
            let vector = self.init_vector();
            self.entity_embeddings.insert(entity.clone(), vector);
        }
        for relation in relations {
            let vector = self.init_vector();
            self.relation_embeddings.insert(relation.clone(), vector);
        }
    }

    fn corrupt(&mut self, triple: &(String, String, String), entities: &[String]) -> (String, String, String) {
        let (head, relation, tail) = triple.clone();
        if entities.len() < 2 {
            return (head, relation, tail);
        }

        // replace head or tail with equal probability
        let replace_head = self.rng.gen_bool(0.5);
        let current = if replace_head { &head } else { &tail };
        let replacement = loop {
            let index = self.rng.gen_range(0..entities.len());
            let Some(candidate) = entities.get(index) else {
                continue;
            };
            if candidate != current {
                break candidate.clone();
            }
        };

        if replace_head {
            (replacement, relation, tail)
        } else {
            (head, relation, replacement)
        }
    }

    /// Margin ranking training over the observed triples.
    pub fn train(&mut self, triples: &[(String, String, String)]) {
        if triples.is_empty() {
            warn!("no triples available for transe training");
            return;
        }

        let mut entity_set: BTreeSet<String> = BTreeSet::new();
        let mut relation_set: BTreeSet<String> = BTreeSet::new();
        for (head, relation, tail) in triples {
            entity_set.insert(head.clone());
            entity_set.insert(tail.clone());
            relation_set.insert(relation.clone());
        }
        self.initialize_embeddings(&entity_set, &relation_set);
        let entity_list: Vec<String> = entity_set.into_iter().collect();

        for epoch in 0..self.config.epochs {
            let mut total_loss = 0.0;

            for positive in triples {
                let negative = self.corrupt(positive, &entity_list);

                let positive_score = self.score(&positive.0, &positive.1, &positive.2);
                let negative_score = self.score(&negative.0, &negative.1, &negative.2);
                let (Some(positive_score), Some(negative_score)) =
                    (positive_score, negative_score)
                else {
                    continue;
                };

                let loss = (self.config.margin + positive_score - negative_score).max(0.0);
                total_loss += loss;
                if loss > 0.0 {
                    self.apply_gradients(positive, &negative);
                }
            }

            if (epoch + 1) % 10 == 0 {
                debug!(epoch = epoch + 1, total_loss, "transe training progress");
            }
        }

        self.trained = true;
        info!(
            entities = self.entity_embeddings.len(),
            relations = self.relation_embeddings.len(),
            "transe training finished"
        );
    }

    fn score(&self, head: &str, relation: &str, tail: &str) -> Option<f64> {
        let h = self.entity_embeddings.get(head)?;
        let r = self.relation_embeddings.get(relation)?;
        let t = self.entity_embeddings.get(tail)?;

        let distance = h
            .iter()
            .zip(r.iter())
            .zip(t.iter())
            .map(|((h, r), t)| (h + r - t).powi(2))
            .sum::<f64>()
            .sqrt();
        Some(distance)
    }

    fn apply_gradients(
        &mut self,
        positive: &(String, String, String),
        negative: &(String, String, String),
    ) {
        let rate = self.config.learning_rate;
        let dim = self.config.embedding_dim;

        let gradient = |h: &[f64], r: &[f64], t: &[f64]| -> Vec<f64> {
            (0..dim)
                .map(|i| {
                    2.0 * (h.get(i).copied().unwrap_or(0.0)
                        + r.get(i).copied().unwrap_or(0.0)
                        - t.get(i).copied().unwrap_or(0.0))
                })
                .collect()
        };

        let positive_grad = {
            let (Some(h), Some(r), Some(t)) = (
                self.entity_embeddings.get(&positive.0),
                self.relation_embeddings.get(&positive.1),
                self.entity_embeddings.get(&positive.2),
            ) else {
                return;
            };
            gradient(h, r, t)
        };
        let negative_grad = {
            let (Some(h), Some(r), Some(t)) = (
                self.entity_embeddings.get(&negative.0),
                self.relation_embeddings.get(&negative.1),
                self.entity_embeddings.get(&negative.2),
            ) else {
                return;
            };
            gradient(h, r, t)
        };

        let mut nudge = |store: Target, key: &str, grad: &[f64], sign: f64| {
            let map = match store {
                Target::Entity => &mut self.entity_embeddings,
                Target::Relation => &mut self.relation_embeddings,
            };
            if let Some(vector) = map.get_mut(key) {
                for (value, g) in vector.iter_mut().zip(grad.iter()) {
                    *value -= rate * sign * g;
                }
                l2_normalize(vector);
            }
        };

        // positive sample pulls h + r towards t
        nudge(Target::Entity, &positive.0, &positive_grad, 1.0);
        nudge(Target::Relation, &positive.1, &positive_grad, 1.0);
        nudge(Target::Entity, &positive.2, &positive_grad, -1.0);

        // negative sample pushes its corrupted triple apart
        nudge(Target::Entity, &negative.0, &negative_grad, -1.0);
        nudge(Target::Relation, &negative.1, &negative_grad, -1.0);
        nudge(Target::Entity, &negative.2, &negative_grad, 1.0);
    }

    /// For every (relation, head) pair, suggest the closest tails not
    /// already observed.
    fn infer(&self, entities: &[AlignedEntity], observed: &[Triple]) -> Vec<Triple> {
        let entity_ids: Vec<&str> = entities.iter().map(|e| e.id.as_str()).collect();
        if entity_ids.is_empty() {
            return Vec::new();
        }

        let existing: HashSet<(&str, &str, &str)> =
            observed.iter().map(Triple::key).collect();
        let relations: Vec<String> = self.relation_embeddings.keys().cloned().collect();

        let mut inferred = Vec::new();
        for relation in &relations {
            let Some(r) = self.relation_embeddings.get(relation) else {
                continue;
            };
            for head in entity_ids.iter().copied() {
                let Some(h) = self.entity_embeddings.get(head) else {
                    continue;
                };
                let translated: Vec<f64> =
                    h.iter().zip(r.iter()).map(|(h, r)| h + r).collect();

                let mut candidates: Vec<(&str, f64)> = Vec::new();
                for tail in entity_ids.iter().copied() {
                    if tail == head || existing.contains(&(head, relation.as_str(), tail)) {
                        continue;
                    }
                    let Some(t) = self.entity_embeddings.get(tail) else {
                        continue;
                    };
                    let distance = translated
                        .iter()
                        .zip(t.iter())
                        .map(|(a, b)| (a - b).powi(2))
                        .sum::<f64>()
                        .sqrt();
                    candidates.push((tail, distance));
                }

                // stable sort keeps entity iteration order on ties
                candidates.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
                for (tail, _) in candidates.into_iter().take(TOP_TAILS) {
                    inferred.push(Triple::completed(
                        head.to_string(),
                        relation.clone(),
                        tail.to_string(),
                    ));
                }
            }
        }

        info!(inferred = inferred.len(), "knowledge completion finished");
        inferred
    }

    pub fn snapshot(&self) -> TransESnapshot {
        TransESnapshot {
            config: self.config,
            entity_embeddings: self.entity_embeddings.clone(),
            relation_embeddings: self.relation_embeddings.clone(),
            trained: self.trained,
        }
    }

    pub fn from_snapshot(snapshot: TransESnapshot) -> Self {
        Self {
            config: snapshot.config,
            entity_embeddings: snapshot.entity_embeddings,
            relation_embeddings: snapshot.relation_embeddings,
            trained: snapshot.trained,
            rng: StdRng::seed_from_u64(TRAINING_SEED),
        }
    }

    pub fn save(&self, path: &std::path::Path) -> Result<(), std::io::Error> {
        let serialized = serde_json::to_vec(&self.snapshot())?;
        std::fs::write(path, serialized)
    }

    pub fn load(path: &std::path::Path) -> Result<Self, std::io::Error> {
        let bytes = std::fs::read(path)?;
        let snapshot: TransESnapshot = serde_json::from_slice(&bytes)?;
        Ok(Self::from_snapshot(snapshot))
    }
}

enum Target {
    Entity,
    Relation,
}

impl KnowledgeCompleter for TransEModel {
    fn describe(&self) -> &'static str {
        "transe"
    }

    fn complete(&mut self, entities: &[AlignedEntity], observed: &[Triple]) -> Vec<Triple> {
        if !self.trained {
            let training_data: Vec<(String, String, String)> = observed
                .iter()
                .map(|t| (t.head_id.clone(), t.relation.clone(), t.tail_id.clone()))
                .collect();
            self.train(&training_data);
        }

        let mut combined = observed.to_vec();
        combined.extend(self.infer(entities, observed));
        combined
    }
}

fn l2_normalize(vector: &mut [f64]) {
    let norm = vector.iter().map(|v| v * v).sum::<f64>().sqrt();
    if norm > f64::EPSILON {
        for value in vector.iter_mut() {
            *value /= norm;
        }
    }
}

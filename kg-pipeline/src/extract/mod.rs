mod llm;
mod rules;

pub use llm::{LlmClient, LlmEntityExtractor, LlmRelationExtractor};
pub use rules::{RuleEntityExtractor, RuleRelationExtractor};

use std::sync::Arc;

use async_trait::async_trait;
use common::error::AppError;
use tracing::warn;
use uuid::Uuid;

use crate::types::{AlignedEntity, EntityMention, Triple};

/// Produces typed entity mentions from one document's text.
#[async_trait]
pub trait EntityExtractor: Send + Sync {
    fn describe(&self) -> &'static str;

    async fn extract(&self, text: &str) -> Result<Vec<EntityMention>, AppError>;
}

/// Produces (head, relation, tail) triples over aligned entity ids.
#[async_trait]
pub trait RelationExtractor: Send + Sync {
    fn describe(&self) -> &'static str;

    async fn extract(
        &self,
        text: &str,
        entities: &[AlignedEntity],
    ) -> Result<Vec<Triple>, AppError>;
}

pub fn entity_extractor_for(
    tag: &str,
    llm: Option<Arc<LlmClient>>,
) -> Box<dyn EntityExtractor> {
    match (tag, llm) {
        ("llm", Some(client)) => Box::new(LlmEntityExtractor::new(client)),
        ("llm", None) => {
            warn!("llm entity extraction requested without an api key, using local bank");
            Box::new(RuleEntityExtractor::new(true))
        }
        ("rule" | "crf", _) => Box::new(RuleEntityExtractor::new(false)),
        ("local", _) => Box::new(RuleEntityExtractor::new(true)),
        (other, _) => {
            warn!(tag = other, "unknown entity extraction algorithm, using local bank");
            Box::new(RuleEntityExtractor::new(true))
        }
    }
}

pub fn relation_extractor_for(
    tag: &str,
    llm: Option<Arc<LlmClient>>,
) -> Box<dyn RelationExtractor> {
    match (tag, llm) {
        ("llm", Some(client)) => Box::new(LlmRelationExtractor::new(client)),
        ("llm", None) => {
            warn!("llm relation extraction requested without an api key, using rule bank");
            Box::new(RuleRelationExtractor::new())
        }
        ("rule", _) => Box::new(RuleRelationExtractor::new()),
        (other, _) => {
            warn!(tag = other, "unknown relation extraction algorithm, using rule bank");
            Box::new(RuleRelationExtractor::new())
        }
    }
}

/// Characters the downstream graph store rejects in labels; replaced at
/// extraction time so every later consumer sees clean types.
const FORBIDDEN_LABEL_CHARS: &[char] = &['\\', '/', ':', '"', '*', '?', '<', '>', '|'];

pub fn sanitize_type(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if FORBIDDEN_LABEL_CHARS.contains(&c) {
                '_'
            } else {
                c
            }
        })
        .collect();
    let trimmed = cleaned.trim();
    if trimmed.is_empty() {
        "Entity".to_string()
    } else {
        trimmed.to_string()
    }
}

pub(crate) fn mention_id() -> String {
    let hex: String = Uuid::new_v4().simple().to_string().chars().take(8).collect();
    format!("mention_{hex}")
}

/// LLM output arrives with optional code fences and prose around the
/// payload; keep only the outermost `[...]` (or `{...}`) span.
pub fn extract_json_payload(content: &str) -> Option<String> {
    let cleaned = content.replace("```json", "").replace("```", "");

    for (open, close) in [('[', ']'), ('{', '}')] {
        if let (Some(start), Some(end)) = (cleaned.find(open), cleaned.rfind(close)) {
            if start < end {
                return cleaned.get(start..=end).map(ToString::to_string);
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factories_resolve_tags() {
        assert_eq!(entity_extractor_for("rule", None).describe(), "rule-bank");
        assert_eq!(entity_extractor_for("local", None).describe(), "local-bank");
        assert_eq!(entity_extractor_for("bogus", None).describe(), "local-bank");
        assert_eq!(relation_extractor_for("rule", None).describe(), "rule-bank");
        // llm without credentials degrades instead of failing later
        assert_eq!(entity_extractor_for("llm", None).describe(), "local-bank");
    }

    #[test]
    fn json_payload_is_unwrapped_from_fences() {
        let content = "Sure, here you go:\n```json\n[{\"name\": \"a\"}]\n```\n";
        assert_eq!(
            extract_json_payload(content).as_deref(),
            Some("[{\"name\": \"a\"}]")
        );
    }

    #[test]
    fn json_payload_prefers_outermost_array() {
        let content = "noise [1, [2, 3]] trailing";
        assert_eq!(extract_json_payload(content).as_deref(), Some("[1, [2, 3]]"));
    }

    #[test]
    fn json_payload_falls_back_to_object() {
        let content = "{\"entities\": []}";
        assert_eq!(
            extract_json_payload(content).as_deref(),
            Some("{\"entities\": []}")
        );
        assert!(extract_json_payload("no json here").is_none());
    }

    #[test]
    fn sanitize_type_replaces_graph_hostile_chars() {
        assert_eq!(sanitize_type("per/son"), "per_son");
        assert_eq!(sanitize_type("  组织  "), "组织");
        assert_eq!(sanitize_type(""), "Entity");
    }

    #[test]
    fn mention_ids_are_unique() {
        let a = mention_id();
        let b = mention_id();
        assert_ne!(a, b);
        assert!(a.starts_with("mention_"));
    }
}

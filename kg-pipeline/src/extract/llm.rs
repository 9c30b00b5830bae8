use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::types::{
    ChatCompletionRequestSystemMessage, ChatCompletionRequestUserMessage,
    CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;
use common::error::AppError;
use serde::Deserialize;
use tokio::time::timeout;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing::{debug, warn};

use crate::types::{byte_to_char_offset, char_slice, AlignedEntity, EntityMention, Triple};

use super::{
    extract_json_payload, mention_id, sanitize_type, EntityExtractor, RelationExtractor,
    RuleEntityExtractor, RuleRelationExtractor,
};

/// Quick extraction calls get a 30 second budget per attempt.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Offset slack tolerated in model-reported positions.
const POSITION_EPSILON: usize = 5;
/// Minimum similarity between the reported span and the reported name.
const NAME_MATCH_THRESHOLD: f64 = 0.6;

const ENTITY_SYSTEM_MESSAGE: &str =
    "You are an entity extraction expert who precisely identifies entities in text.";

const RELATION_SYSTEM_MESSAGE: &str =
    "You are a relation extraction expert who precisely identifies relations between known entities.";

/// One OpenAI-compatible chat client per process; per-job API keys build
/// their own instance.
pub struct LlmClient {
    client: Client<OpenAIConfig>,
    model: String,
}

impl LlmClient {
    pub fn new(base_url: &str, api_key: &str, model: &str) -> Self {
        let config = OpenAIConfig::new()
            .with_api_key(api_key)
            .with_api_base(base_url);

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
        }
    }

    /// Single chat completion with three total attempts, exponential
    /// backoff with jitter between them.
    pub async fn complete(&self, system: &str, user: &str) -> Result<String, AppError> {
        let strategy = ExponentialBackoff::from_millis(500).map(jitter).take(2);

        RetryIf::spawn(
            strategy,
            || self.request_once(system, user),
            |err: &AppError| is_retryable(err),
        )
        .await
    }

    async fn request_once(&self, system: &str, user: &str) -> Result<String, AppError> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .temperature(0.3)
            .messages([
                ChatCompletionRequestSystemMessage::from(system).into(),
                ChatCompletionRequestUserMessage::from(user).into(),
            ])
            .build()?;

        let response = timeout(REQUEST_TIMEOUT, self.client.chat().create(request))
            .await
            .map_err(|_| AppError::Processing("llm request timed out".to_string()))??;

        let content = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.as_ref())
            .ok_or_else(|| AppError::LLMParsing("no content in llm response".to_string()))?;

        Ok(content.clone())
    }
}

fn is_retryable(err: &AppError) -> bool {
    matches!(err, AppError::OpenAI(_) | AppError::Processing(_))
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawEntityMention {
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub entity_type: Option<String>,
    pub start_pos: Option<i64>,
    pub end_pos: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawRelation {
    pub entity1_id: Option<String>,
    pub relation: Option<String>,
    pub entity2_id: Option<String>,
}

/// LLM-backed entity extraction with strict output validation. Exhausted
/// retries and unparseable output fall back to the local regex bank.
pub struct LlmEntityExtractor {
    client: Arc<LlmClient>,
    fallback: RuleEntityExtractor,
}

impl LlmEntityExtractor {
    pub fn new(client: Arc<LlmClient>) -> Self {
        Self {
            client,
            fallback: RuleEntityExtractor::new(true),
        }
    }

    fn prompt(text: &str) -> String {
        format!(
            "Extract the entities from the following text. Entity types include, \
but are not limited to: person, organization, location, time, event, product.\n\n\
Text: {text}\n\n\
Return a JSON array where every element has exactly these fields:\n\
- \"name\": the entity name as it appears in the text\n\
- \"type\": the entity type\n\
- \"start_pos\": character index where the entity starts\n\
- \"end_pos\": character index where the entity ends\n\n\
Return only the JSON array, with no extra commentary."
        )
    }

    async fn request_entities(&self, text: &str) -> Result<Vec<EntityMention>, AppError> {
        let content = self
            .client
            .complete(ENTITY_SYSTEM_MESSAGE, &Self::prompt(text))
            .await?;
        let payload = extract_json_payload(&content)
            .ok_or_else(|| AppError::LLMParsing("no JSON payload in llm output".to_string()))?;
        let raw: Vec<RawEntityMention> = serde_json::from_str(&payload)
            .map_err(|err| AppError::LLMParsing(format!("malformed entity array: {err}")))?;

        Ok(raw
            .into_iter()
            .filter_map(|candidate| validate_mention(candidate, text))
            .collect())
    }
}

#[async_trait]
impl EntityExtractor for LlmEntityExtractor {
    fn describe(&self) -> &'static str {
        "llm"
    }

    async fn extract(&self, text: &str) -> Result<Vec<EntityMention>, AppError> {
        match self.request_entities(text).await {
            Ok(mentions) if !mentions.is_empty() => Ok(mentions),
            Ok(_) => {
                warn!("llm returned zero valid entities, extending with local bank");
                self.fallback.extract(text).await
            }
            Err(err) => {
                warn!(%err, "llm entity extraction failed, using local bank");
                self.fallback.extract(text).await
            }
        }
    }
}

/// Validates one model-reported mention: required fields, position sanity
/// with a small slack, and span/name agreement. Positions that do not fit
/// are corrected by locating the name in the source text.
pub(crate) fn validate_mention(raw: RawEntityMention, text: &str) -> Option<EntityMention> {
    let name = raw.name.as_deref().map(str::trim).unwrap_or_default();
    if name.is_empty() {
        debug!("dropping entity without a name");
        return None;
    }
    let entity_type = match raw.entity_type.as_deref().map(str::trim) {
        Some(t) if !t.is_empty() => sanitize_type(t),
        _ => {
            debug!(name, "dropping entity without a type");
            return None;
        }
    };

    let text_len = text.chars().count();
    let reported = match (raw.start_pos, raw.end_pos) {
        (Some(start), Some(end)) if start >= 0 && end > start => {
            let start = usize::try_from(start).ok()?;
            let end = usize::try_from(end).ok()?;
            (end <= text_len + POSITION_EPSILON).then_some((start, end.min(text_len)))
        }
        _ => None,
    };

    if let Some((start, end)) = reported {
        if let Some(span) = char_slice(text, start, end) {
            let span = span.trim();
            if span == name || strsim::normalized_levenshtein(span, name) >= NAME_MATCH_THRESHOLD
            {
                return Some(EntityMention {
                    id: mention_id(),
                    name: name.to_string(),
                    entity_type,
                    start_pos: start,
                    end_pos: end,
                    confidence: None,
                });
            }
        }
    }

    // Re-locate the reported name by substring search.
    let byte_pos = text.find(name)?;
    let start = byte_to_char_offset(text, byte_pos);
    let end = start + name.chars().count();
    debug!(name, start, end, "corrected llm-reported entity offsets");

    Some(EntityMention {
        id: mention_id(),
        name: name.to_string(),
        entity_type,
        start_pos: start,
        end_pos: end,
        confidence: None,
    })
}

/// LLM-backed relation extraction over the aligned entity table; errors
/// fall back to the rule bank.
pub struct LlmRelationExtractor {
    client: Arc<LlmClient>,
    fallback: RuleRelationExtractor,
}

impl LlmRelationExtractor {
    pub fn new(client: Arc<LlmClient>) -> Self {
        Self {
            client,
            fallback: RuleRelationExtractor::new(),
        }
    }

    fn prompt(text: &str, entities: &[AlignedEntity]) -> String {
        let table: Vec<String> = entities
            .iter()
            .map(|e| format!("- id: {}, name: {}, type: {}", e.id, e.name, e.entity_type))
            .collect();

        format!(
            "Identify relations between the known entities in the following text.\n\n\
Text: {text}\n\n\
Known entities:\n{}\n\n\
Return a JSON array where every element has exactly these fields:\n\
- \"entity1_id\": the id of the head entity\n\
- \"relation\": the relation type\n\
- \"entity2_id\": the id of the tail entity\n\n\
Only reference ids from the list above. Return only the JSON array; return \
an empty array when there are no relations.",
            table.join("\n")
        )
    }

    async fn request_relations(
        &self,
        text: &str,
        entities: &[AlignedEntity],
    ) -> Result<Vec<Triple>, AppError> {
        let content = self
            .client
            .complete(RELATION_SYSTEM_MESSAGE, &Self::prompt(text, entities))
            .await?;
        let payload = extract_json_payload(&content)
            .ok_or_else(|| AppError::LLMParsing("no JSON payload in llm output".to_string()))?;
        let raw: Vec<RawRelation> = serde_json::from_str(&payload)
            .map_err(|err| AppError::LLMParsing(format!("malformed relation array: {err}")))?;

        Ok(validate_relations(raw, entities))
    }
}

#[async_trait]
impl RelationExtractor for LlmRelationExtractor {
    fn describe(&self) -> &'static str {
        "llm"
    }

    async fn extract(
        &self,
        text: &str,
        entities: &[AlignedEntity],
    ) -> Result<Vec<Triple>, AppError> {
        if entities.len() < 2 {
            return Ok(Vec::new());
        }

        match self.request_relations(text, entities).await {
            Ok(triples) => Ok(triples),
            Err(err) => {
                warn!(%err, "llm relation extraction failed, using rule bank");
                self.fallback.extract(text, entities).await
            }
        }
    }
}

/// Keeps only relations whose endpoints are known entity ids, sanitizes
/// the label and removes duplicate tuples.
pub(crate) fn validate_relations(
    raw: Vec<RawRelation>,
    entities: &[AlignedEntity],
) -> Vec<Triple> {
    let known: HashSet<&str> = entities.iter().map(|e| e.id.as_str()).collect();
    let mut seen: HashSet<(String, String, String)> = HashSet::new();
    let mut triples = Vec::new();

    for relation in raw {
        let (Some(head), Some(label), Some(tail)) = (
            relation.entity1_id.as_deref(),
            relation.relation.as_deref(),
            relation.entity2_id.as_deref(),
        ) else {
            debug!("dropping relation with missing fields");
            continue;
        };

        if !known.contains(head) || !known.contains(tail) {
            debug!(head, tail, "dropping relation with unknown endpoints");
            continue;
        }

        let label = sanitize_type(label);
        let key = (head.to_string(), label.clone(), tail.to_string());
        if seen.insert(key) {
            triples.push(Triple::extracted(head.to_string(), label, tail.to_string()));
        }
    }

    triples
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_mention(
        name: &str,
        entity_type: &str,
        start: i64,
        end: i64,
    ) -> RawEntityMention {
        RawEntityMention {
            name: Some(name.to_string()),
            entity_type: Some(entity_type.to_string()),
            start_pos: Some(start),
            end_pos: Some(end),
        }
    }

    #[test]
    fn exact_positions_are_accepted() {
        let text = "百度公司于2023年推出文心一言。";
        let mention = validate_mention(raw_mention("百度公司", "组织", 0, 4), text)
            .expect("valid mention");
        assert_eq!((mention.start_pos, mention.end_pos), (0, 4));
        assert_eq!(mention.entity_type, "组织");
    }

    #[test]
    fn off_by_small_k_offsets_are_corrected() {
        let text = "百度公司于2023年推出文心一言。";
        // reported positions point at the wrong span; the name is present,
        // so the stored offsets must locate it exactly
        let mention = validate_mention(raw_mention("文心一言", "技术", 3, 8), text)
            .expect("corrected mention");
        assert_eq!((mention.start_pos, mention.end_pos), (12, 16));
        assert_eq!(
            char_slice(text, mention.start_pos, mention.end_pos).as_deref(),
            Some("文心一言")
        );
    }

    #[test]
    fn positions_past_epsilon_relocate_or_drop() {
        let text = "百度公司于2023年推出文心一言。";
        // end far beyond len + epsilon, name present -> relocated
        let mention =
            validate_mention(raw_mention("百度公司", "组织", 90, 99), text).expect("relocated");
        assert_eq!((mention.start_pos, mention.end_pos), (0, 4));

        // name absent from the text -> dropped
        assert!(validate_mention(raw_mention("不存在实体", "组织", 0, 5), text).is_none());
    }

    #[test]
    fn missing_required_fields_drop_the_mention() {
        let text = "some text";
        assert!(validate_mention(
            RawEntityMention {
                name: None,
                entity_type: Some("Person".to_string()),
                start_pos: Some(0),
                end_pos: Some(4),
            },
            text
        )
        .is_none());
        assert!(validate_mention(
            RawEntityMention {
                name: Some("some".to_string()),
                entity_type: None,
                start_pos: Some(0),
                end_pos: Some(4),
            },
            text
        )
        .is_none());
    }

    #[test]
    fn fuzzy_span_agreement_is_enough() {
        let text = "The company OpenAI Inc released a model.";
        let start = 12;
        let end = 22; // "OpenAI Inc"
        let mention = validate_mention(raw_mention("OpenAI Inc.", "Organization", start, end), text)
            .expect("fuzzy match accepted");
        assert_eq!(mention.start_pos, start as usize);
    }

    fn aligned(id: &str, name: &str) -> AlignedEntity {
        AlignedEntity {
            id: id.to_string(),
            name: name.to_string(),
            entity_type: "组织".to_string(),
            merged_ids: vec![id.to_string()],
            attributes: Default::default(),
        }
    }

    #[test]
    fn relations_with_unknown_ids_are_dropped() {
        let entities = vec![aligned("e1", "百度"), aligned("e2", "文心一言")];
        let raw = vec![
            RawRelation {
                entity1_id: Some("e1".to_string()),
                relation: Some("推出".to_string()),
                entity2_id: Some("e2".to_string()),
            },
            RawRelation {
                entity1_id: Some("e1".to_string()),
                relation: Some("推出".to_string()),
                entity2_id: Some("ghost".to_string()),
            },
            RawRelation {
                entity1_id: Some("e1".to_string()),
                relation: Some("推出".to_string()),
                entity2_id: Some("e2".to_string()),
            },
        ];

        let triples = validate_relations(raw, &entities);
        assert_eq!(triples.len(), 1);
        assert_eq!(triples[0].relation, "推出");
    }

    #[test]
    fn relation_labels_are_sanitized() {
        let entities = vec![aligned("e1", "a"), aligned("e2", "b")];
        let raw = vec![RawRelation {
            entity1_id: Some("e1".to_string()),
            relation: Some("works/for".to_string()),
            entity2_id: Some("e2".to_string()),
        }];

        let triples = validate_relations(raw, &entities);
        assert_eq!(triples[0].relation, "works_for");
    }

    #[test]
    fn prompts_embed_the_entity_table() {
        let entities = vec![aligned("e1", "百度公司")];
        let prompt = LlmRelationExtractor::prompt("text body", &entities);
        assert!(prompt.contains("- id: e1, name: 百度公司, type: 组织"));
        assert!(prompt.contains("text body"));
    }
}

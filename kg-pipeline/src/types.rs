use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One occurrence of a candidate entity inside a single document. Offsets
/// are character positions into the source text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityMention {
    pub id: String,
    pub name: String,
    pub entity_type: String,
    pub start_pos: usize,
    pub end_pos: usize,
    #[serde(default)]
    pub confidence: Option<f32>,
}

/// The canonical entity a cluster of mentions collapses into.
///
/// Every mention id of a job either is an `AlignedEntity` id or appears in
/// exactly one `merged_ids` set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlignedEntity {
    pub id: String,
    pub name: String,
    pub entity_type: String,
    pub merged_ids: Vec<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TripleSource {
    Extracted,
    Completed,
}

/// A directed edge over aligned-entity ids.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Triple {
    pub head_id: String,
    pub relation: String,
    pub tail_id: String,
    #[serde(default)]
    pub confidence: Option<f32>,
    pub source: TripleSource,
}

impl Triple {
    pub fn extracted(head_id: String, relation: String, tail_id: String) -> Self {
        Self {
            head_id,
            relation,
            tail_id,
            confidence: None,
            source: TripleSource::Extracted,
        }
    }

    pub fn completed(head_id: String, relation: String, tail_id: String) -> Self {
        Self {
            head_id,
            relation,
            tail_id,
            confidence: None,
            source: TripleSource::Completed,
        }
    }

    /// Identity used for de-duplication; source and confidence do not
    /// distinguish edges.
    pub fn key(&self) -> (&str, &str, &str) {
        (&self.head_id, &self.relation, &self.tail_id)
    }
}

/// Returns the character-offset slice `[start, end)` of `text`, or `None`
/// when the bounds do not fit.
pub fn char_slice(text: &str, start: usize, end: usize) -> Option<String> {
    if start >= end {
        return None;
    }
    let collected: String = text.chars().skip(start).take(end - start).collect();
    if collected.chars().count() == end - start {
        Some(collected)
    } else {
        None
    }
}

/// Converts a byte offset produced by the regex engine into a character
/// offset into the same text.
pub fn byte_to_char_offset(text: &str, byte_offset: usize) -> usize {
    text.get(..byte_offset)
        .map_or_else(|| text.chars().count(), |prefix| prefix.chars().count())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn char_slice_handles_cjk() {
        let text = "百度公司于2023年";
        assert_eq!(char_slice(text, 0, 4).as_deref(), Some("百度公司"));
        assert_eq!(char_slice(text, 4, 5).as_deref(), Some("于"));
        assert!(char_slice(text, 5, 20).is_none());
        assert!(char_slice(text, 3, 3).is_none());
    }

    #[test]
    fn byte_offsets_translate_to_char_offsets() {
        let text = "ab百度cd";
        let byte_pos = text.find("cd").unwrap();
        assert_eq!(byte_to_char_offset(text, byte_pos), 4);
        assert_eq!(byte_to_char_offset(text, 0), 0);
    }

    #[test]
    fn triple_key_ignores_source() {
        let a = Triple::extracted("h".into(), "r".into(), "t".into());
        let b = Triple::completed("h".into(), "r".into(), "t".into());
        assert_eq!(a.key(), b.key());
    }
}

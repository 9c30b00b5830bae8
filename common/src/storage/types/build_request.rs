use serde::{Deserialize, Serialize};

/// Algorithm tags selected by the client for each pluggable stage.
/// Unknown tags are resolved to fallback strategies by the stage factories.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AlgorithmSelection {
    #[serde(default = "default_preprocess")]
    pub preprocess: String,
    #[serde(default = "default_entity_extraction")]
    pub entity_extraction: String,
    #[serde(default = "default_relation_extraction")]
    pub relation_extraction: String,
    #[serde(default = "default_knowledge_completion")]
    pub knowledge_completion: String,
}

fn default_preprocess() -> String {
    "simhash".to_string()
}

fn default_entity_extraction() -> String {
    "llm".to_string()
}

fn default_relation_extraction() -> String {
    "llm".to_string()
}

fn default_knowledge_completion() -> String {
    "transe".to_string()
}

impl Default for AlgorithmSelection {
    fn default() -> Self {
        Self {
            preprocess: default_preprocess(),
            entity_extraction: default_entity_extraction(),
            relation_extraction: default_relation_extraction(),
            knowledge_completion: default_knowledge_completion(),
        }
    }
}

/// A graph-build submission as accepted on the wire and snapshotted into the
/// task row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GraphBuildRequest {
    pub file_ids: Vec<String>,
    #[serde(default)]
    pub kg_name: Option<String>,
    #[serde(default)]
    pub algorithms: AlgorithmSelection,
    #[serde(default)]
    pub model_api_key: Option<String>,
    #[serde(default)]
    pub enable_completion: bool,
    #[serde(default)]
    pub enable_visualization: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_with_defaults() {
        let request: GraphBuildRequest =
            serde_json::from_str(r#"{"file_ids": ["a.txt"]}"#).expect("deserialize request");

        assert_eq!(request.file_ids, vec!["a.txt"]);
        assert_eq!(request.algorithms.preprocess, "simhash");
        assert_eq!(request.algorithms.knowledge_completion, "transe");
        assert!(!request.enable_completion);
        assert!(request.kg_name.is_none());
    }

    #[test]
    fn keeps_explicit_algorithm_tags() {
        let request: GraphBuildRequest = serde_json::from_str(
            r#"{
                "file_ids": ["a"],
                "algorithms": {
                    "preprocess": "minhash",
                    "entity_extraction": "rule",
                    "relation_extraction": "rule",
                    "knowledge_completion": "transe"
                },
                "enable_completion": true
            }"#,
        )
        .expect("deserialize request");

        assert_eq!(request.algorithms.preprocess, "minhash");
        assert_eq!(request.algorithms.entity_extraction, "rule");
        assert!(request.enable_completion);
    }
}

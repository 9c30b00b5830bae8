use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    pub neo4j_uri: String,
    pub neo4j_user: String,
    pub neo4j_password: String,
    pub surrealdb_address: String,
    pub surrealdb_username: String,
    pub surrealdb_password: String,
    pub surrealdb_namespace: String,
    pub surrealdb_database: String,
    pub llm_api_key: String,
    #[serde(default = "default_llm_base_url")]
    pub llm_base_url: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default = "default_parse_concurrency")]
    pub parse_concurrency: usize,
    #[serde(default = "default_upload_dir")]
    pub upload_dir: String,
    #[serde(default = "default_temp_dir")]
    pub temp_dir: String,
    pub http_port: u16,
    #[serde(default = "default_embedding_dim")]
    pub embedding_dim: usize,
    #[serde(default = "default_margin")]
    pub margin: f64,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default = "default_alignment_threshold")]
    pub alignment_threshold: f64,
}

fn default_llm_base_url() -> String {
    "https://dashscope.aliyuncs.com/compatible-mode/v1".to_string()
}

fn default_llm_model() -> String {
    "qwen-plus".to_string()
}

fn default_worker_count() -> usize {
    5
}

fn default_parse_concurrency() -> usize {
    4
}

fn default_upload_dir() -> String {
    "./uploads".to_string()
}

fn default_temp_dir() -> String {
    "./temp".to_string()
}

fn default_embedding_dim() -> usize {
    50
}

fn default_margin() -> f64 {
    1.0
}

fn default_learning_rate() -> f64 {
    0.01
}

fn default_epochs() -> usize {
    100
}

fn default_alignment_threshold() -> f64 {
    0.8
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::default())
        .build()?;

    config.try_deserialize()
}

#[cfg(any(test, feature = "test-utils"))]
impl Default for AppConfig {
    fn default() -> Self {
        Self {
            neo4j_uri: "bolt://localhost:7687".to_string(),
            neo4j_user: "neo4j".to_string(),
            neo4j_password: "password".to_string(),
            surrealdb_address: "mem://".to_string(),
            surrealdb_username: "root".to_string(),
            surrealdb_password: "root".to_string(),
            surrealdb_namespace: "test".to_string(),
            surrealdb_database: "test".to_string(),
            llm_api_key: String::new(),
            llm_base_url: default_llm_base_url(),
            llm_model: default_llm_model(),
            worker_count: default_worker_count(),
            parse_concurrency: default_parse_concurrency(),
            upload_dir: default_upload_dir(),
            temp_dir: default_temp_dir(),
            http_port: 8000,
            embedding_dim: default_embedding_dim(),
            margin: default_margin(),
            learning_rate: default_learning_rate(),
            epochs: default_epochs(),
            alignment_threshold: default_alignment_threshold(),
        }
    }
}

use neo4rs::Graph;
use tracing::info;
use url::Url;

use crate::error::AppError;

/// Process-wide handle on the labeled property graph store. The underlying
/// driver keeps one connection pool and is safe to share; sessions and
/// transactions are opened per operation by the callers.
#[derive(Clone)]
pub struct GraphClient {
    pub graph: Graph,
}

impl GraphClient {
    pub async fn connect(uri: &str, user: &str, password: &str) -> Result<Self, AppError> {
        let addr = match Url::parse(uri) {
            Ok(url) => {
                let host = url.host_str().unwrap_or("localhost").to_string();
                let port = url.port().unwrap_or(7687);
                format!("{host}:{port}")
            }
            Err(_) => uri.to_string(),
        };

        info!("connecting to graph store at {addr}");
        let graph = Graph::new(&addr, user, password).await?;
        info!("graph store connection established");

        Ok(Self { graph })
    }
}

/// Characters the graph store rejects inside labels and relationship types.
const FORBIDDEN: &[char] = &['\\', '/', ':', '"', '*', '?', '<', '>', '|'];

/// Normalizes an entity type into a node label: forbidden character runs
/// become a single underscore, surrounding underscores/spaces are trimmed,
/// the first letter is uppercased, and an empty result falls back to
/// "Entity". Write, query and delete paths must all go through here so
/// deletion matches what was written.
pub fn sanitize_label(raw: &str) -> String {
    let mut cleaned = String::with_capacity(raw.len());
    let mut last_was_replacement = false;
    for ch in raw.chars() {
        if FORBIDDEN.contains(&ch) {
            if !last_was_replacement {
                cleaned.push('_');
                last_was_replacement = true;
            }
        } else {
            cleaned.push(ch);
            last_was_replacement = false;
        }
    }

    let cleaned = cleaned.trim_matches(|c: char| c == '_' || c.is_whitespace());
    if cleaned.is_empty() {
        return "Entity".to_string();
    }

    let mut chars = cleaned.chars();
    match chars.next() {
        Some(first) if first.is_lowercase() => {
            format!("{}{}", first.to_uppercase(), chars.as_str())
        }
        _ => cleaned.to_string(),
    }
}

/// Relationship types get the same cleaning as labels, then uppercased.
pub fn sanitize_relation(raw: &str) -> String {
    let cleaned = sanitize_label(raw);
    cleaned.to_uppercase()
}

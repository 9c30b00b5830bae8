use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use common::error::AppError;
use common::graph::{sanitize_label, sanitize_relation, GraphClient};
use neo4rs::{query, Node, Relation};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::types::{AlignedEntity, Triple};

/// Window after graph creation inside which legacy nodes without a kg_id
/// are attributed to the graph during deletion.
const LEGACY_DELETE_WINDOW_MINUTES: i64 = 10;

/// The engine's write-side seam onto the graph store; tests install a
/// recording fake behind it.
#[async_trait]
pub trait GraphSink: Send + Sync {
    /// Exactly one call per job, from a single writer session. Entities are
    /// written before any triple referencing them.
    async fn persist(
        &self,
        user_id: &str,
        kg_id: &str,
        entities: &[AlignedEntity],
        triples: &[Triple],
    ) -> Result<(), AppError>;

    /// Capped preview used by the optional visualization stage; returns
    /// (node count, edge count).
    async fn preview(&self, kg_id: &str, limit: usize) -> Result<(usize, usize), AppError>;
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct QueryNode {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    pub kg_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct QueryEdge {
    pub id: i64,
    pub source: i64,
    pub target: i64,
    #[serde(rename = "type")]
    pub relation: String,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct GraphQueryResult {
    pub nodes: Vec<QueryNode>,
    pub edges: Vec<QueryEdge>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VizNode {
    pub id: i64,
    pub label: String,
    pub group: String,
    pub title: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct VizEdge {
    pub from: i64,
    pub to: i64,
    pub label: String,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct VizData {
    pub nodes: Vec<VizNode>,
    pub edges: Vec<VizEdge>,
}

/// The three read shapes of the query service.
#[derive(Debug, Clone)]
pub enum GraphQuery {
    /// Entities whose name contains the given substring, with outgoing
    /// neighbors.
    Entity(String),
    /// All edges of one relation type.
    Relation(String),
    /// Everything in the graph, capped.
    All { limit: usize },
}

fn entity_statement(entity_type: &str) -> String {
    let label = sanitize_label(entity_type);
    format!(
        "MERGE (n:`{label}` {{id: $id}}) \
         SET n.name = $name, n.kg_id = $kg_id \
         MERGE (u:User {{id: $user_id}})-[:OWNS]->(n)"
    )
}

fn triple_statement(relation: &str) -> String {
    let relation = sanitize_relation(relation);
    format!(
        "MATCH (s {{id: $head, kg_id: $kg_id}}) \
         MATCH (o {{id: $tail, kg_id: $kg_id}}) \
         MERGE (s)-[:`{relation}`]->(o)"
    )
}

fn relation_query_statement(relation: &str) -> String {
    let relation = sanitize_relation(relation);
    format!(
        "MATCH (u:User {{id: $user_id}})-[:OWNS]->(e1 {{kg_id: $kg_id}}) \
         MATCH (e1)-[r:`{relation}`]->(e2 {{kg_id: $kg_id}}) \
         RETURN e1 AS e, r, e2 AS neighbor"
    )
}

/// Read/delete seam used by the HTTP surface; ownership checks happen
/// before any of these are called.
#[async_trait]
pub trait GraphReader: Send + Sync {
    async fn query(
        &self,
        user_id: &str,
        kg_id: &str,
        graph_query: &GraphQuery,
    ) -> Result<GraphQueryResult, AppError>;

    async fn visualize(&self, kg_id: &str, limit: usize) -> Result<VizData, AppError>;

    async fn delete_graph(
        &self,
        user_id: &str,
        kg_id: &str,
        graph_created_at: DateTime<Utc>,
    ) -> Result<(), AppError>;
}

/// Cypher-side persistence, deletion and reads against the shared graph
/// store connection.
pub struct GraphStore {
    client: GraphClient,
}

impl GraphStore {
    pub fn new(client: GraphClient) -> Self {
        Self { client }
    }

    pub async fn delete_graph(
        &self,
        user_id: &str,
        kg_id: &str,
        graph_created_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        // edges touching the graph's nodes go first
        self.client
            .graph
            .run(
                query(
                    "MATCH (n) WHERE n.kg_id = $kg_id \
                     OPTIONAL MATCH (n)-[r]->() \
                     OPTIONAL MATCH ()-[r2]->(n) \
                     DELETE r, r2",
                )
                .param("kg_id", kg_id),
            )
            .await?;

        // nodes by kg_id, plus the compatibility branch for legacy nodes
        // created before kg_id stamping existed
        let window_start = graph_created_at.format("%Y-%m-%dT%H:%M:%S").to_string();
        let window_end = (graph_created_at + Duration::minutes(LEGACY_DELETE_WINDOW_MINUTES))
            .format("%Y-%m-%dT%H:%M:%S")
            .to_string();

        self.client
            .graph
            .run(
                query(
                    "MATCH (u:User {id: $user_id})-[:OWNS]->(n) \
                     WHERE (n.kg_id = $kg_id) \
                     OR (n.kg_id IS NULL \
                         AND n.created_at >= datetime($window_start) \
                         AND n.created_at <= datetime($window_end)) \
                     DETACH DELETE n",
                )
                .param("user_id", user_id)
                .param("kg_id", kg_id)
                .param("window_start", window_start)
                .param("window_end", window_end),
            )
            .await?;

        info!(kg_id, "graph store data deleted");
        Ok(())
    }

    pub async fn query(
        &self,
        user_id: &str,
        kg_id: &str,
        graph_query: &GraphQuery,
    ) -> Result<GraphQueryResult, AppError> {
        let prepared = match graph_query {
            GraphQuery::Entity(name) => query(
                "MATCH (u:User {id: $user_id})-[:OWNS]->(e {kg_id: $kg_id}) \
                 WHERE e.name CONTAINS $entity \
                 OPTIONAL MATCH (e)-[r]->(neighbor {kg_id: $kg_id}) \
                 RETURN e, r, neighbor",
            )
            .param("user_id", user_id)
            .param("kg_id", kg_id)
            .param("entity", name.as_str()),
            GraphQuery::Relation(relation) => query(&relation_query_statement(relation))
                .param("user_id", user_id)
                .param("kg_id", kg_id),
            GraphQuery::All { limit } => {
                #[allow(clippy::cast_possible_wrap)]
                let limit = *limit as i64;
                query(
                    "MATCH (u:User {id: $user_id})-[:OWNS]->(e {kg_id: $kg_id}) \
                     OPTIONAL MATCH (e)-[r]->(neighbor {kg_id: $kg_id}) \
                     RETURN e, r, neighbor LIMIT $limit",
                )
                .param("user_id", user_id)
                .param("kg_id", kg_id)
                .param("limit", limit)
            }
        };

        let mut stream = self.client.graph.execute(prepared).await?;
        let mut result = GraphQueryResult::default();
        let mut seen_nodes = std::collections::HashSet::new();

        while let Some(row) = stream.next().await? {
            for key in ["e", "neighbor"] {
                if let Ok(node) = row.get::<Node>(key) {
                    if seen_nodes.insert(node.id()) {
                        result.nodes.push(to_query_node(&node));
                    }
                }
            }
            if let Ok(relation) = row.get::<Relation>("r") {
                result.edges.push(QueryEdge {
                    id: relation.id(),
                    source: relation.start_node_id(),
                    target: relation.end_node_id(),
                    relation: relation.typ().to_string(),
                });
            }
        }

        debug!(
            kg_id,
            nodes = result.nodes.len(),
            edges = result.edges.len(),
            "graph query finished"
        );
        Ok(result)
    }

    /// Capped node/edge bundle with label/group metadata for the UI.
    pub async fn visualize(&self, kg_id: &str, limit: usize) -> Result<VizData, AppError> {
        #[allow(clippy::cast_possible_wrap)]
        let limit = limit as i64;
        let prepared = query(
            "MATCH (n) WHERE n.kg_id = $kg_id \
             OPTIONAL MATCH (n)-[r]->(m) WHERE m.kg_id = $kg_id \
             RETURN n, r, m LIMIT $limit",
        )
        .param("kg_id", kg_id)
        .param("limit", limit);

        let mut stream = self.client.graph.execute(prepared).await?;
        let mut data = VizData::default();
        let mut seen_nodes = std::collections::HashSet::new();

        while let Some(row) = stream.next().await? {
            for key in ["n", "m"] {
                if let Ok(node) = row.get::<Node>(key) {
                    if seen_nodes.insert(node.id()) {
                        data.nodes.push(to_viz_node(&node, kg_id));
                    }
                }
            }
            if let Ok(relation) = row.get::<Relation>("r") {
                data.edges.push(VizEdge {
                    from: relation.start_node_id(),
                    to: relation.end_node_id(),
                    label: relation.typ().to_string(),
                });
            }
        }

        Ok(data)
    }
}

fn to_query_node(node: &Node) -> QueryNode {
    let labels = node.labels();
    QueryNode {
        id: node.id(),
        name: node.get::<String>("name").unwrap_or_default(),
        entity_type: labels
            .first()
            .map_or_else(|| "Entity".to_string(), ToString::to_string),
        kg_id: node.get::<String>("kg_id").ok(),
    }
}

fn to_viz_node(node: &Node, kg_id: &str) -> VizNode {
    let labels = node.labels();
    let group = labels
        .first()
        .map_or_else(|| "Entity".to_string(), ToString::to_string);
    let label = node
        .get::<String>("name")
        .unwrap_or_else(|_| format!("Node_{}", node.id()));

    VizNode {
        id: node.id(),
        title: format!("type: {group}\ngraph: {kg_id}"),
        label,
        group,
    }
}

#[async_trait]
impl GraphReader for GraphStore {
    async fn query(
        &self,
        user_id: &str,
        kg_id: &str,
        graph_query: &GraphQuery,
    ) -> Result<GraphQueryResult, AppError> {
        GraphStore::query(self, user_id, kg_id, graph_query).await
    }

    async fn visualize(&self, kg_id: &str, limit: usize) -> Result<VizData, AppError> {
        GraphStore::visualize(self, kg_id, limit).await
    }

    async fn delete_graph(
        &self,
        user_id: &str,
        kg_id: &str,
        graph_created_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        GraphStore::delete_graph(self, user_id, kg_id, graph_created_at).await
    }
}

#[async_trait]
impl GraphSink for GraphStore {
    async fn persist(
        &self,
        user_id: &str,
        kg_id: &str,
        entities: &[AlignedEntity],
        triples: &[Triple],
    ) -> Result<(), AppError> {
        let mut txn = self.client.graph.start_txn().await?;

        txn.run(query("MERGE (u:User {id: $user_id})").param("user_id", user_id))
            .await?;

        for entity in entities {
            txn.run(
                query(&entity_statement(&entity.entity_type))
                    .param("id", entity.id.as_str())
                    .param("name", entity.name.as_str())
                    .param("kg_id", kg_id)
                    .param("user_id", user_id),
            )
            .await?;
        }

        let mut written_edges = 0usize;
        for triple in triples {
            txn.run(
                query(&triple_statement(&triple.relation))
                    .param("head", triple.head_id.as_str())
                    .param("tail", triple.tail_id.as_str())
                    .param("kg_id", kg_id),
            )
            .await?;
            written_edges += 1;
        }

        txn.commit().await?;

        if written_edges == 0 {
            warn!(kg_id, "no relations were written for this graph");
        }
        info!(
            kg_id,
            entities = entities.len(),
            relations = written_edges,
            "graph persisted"
        );
        Ok(())
    }

    async fn preview(&self, kg_id: &str, limit: usize) -> Result<(usize, usize), AppError> {
        let data = self.visualize(kg_id, limit).await?;
        Ok((data.nodes.len(), data.edges.len()))
    }
}

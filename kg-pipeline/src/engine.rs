use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use common::error::{AppError, ParseError};
use common::storage::db::SurrealDbClient;
use common::storage::types::build_request::GraphBuildRequest;
use common::storage::types::kg_task::{KgTask, TaskStatus};
use common::storage::types::knowledge_graph::{GraphStatus, KnowledgeGraph};
use common::utils::config::AppConfig;
use futures::stream::{self, StreamExt};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::align::EntityAligner;
use crate::complete::{completer_for, TransEConfig};
use crate::extract::{entity_extractor_for, relation_extractor_for, LlmClient};
use crate::graph_store::GraphSink;
use crate::parser::FileParser;
use crate::preprocess::preprocessor_for;
use crate::progress::{ProgressTracker, TaskProgress};
use crate::types::{AlignedEntity, EntityMention, Triple};

/// Queued jobs waiting for a worker slot.
const QUEUE_CAPACITY: usize = 64;
/// Node/edge cap for the visualization preview stage.
const PREVIEW_LIMIT: usize = 100;

type StageError = (&'static str, AppError);

/// Orchestrates the build stages over a bounded worker pool and owns the
/// dual-store progress state.
pub struct JobEngine {
    shared: Arc<EngineShared>,
    queue: std::sync::Mutex<Option<mpsc::Sender<KgTask>>>,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

struct EngineShared {
    db: Arc<SurrealDbClient>,
    graph: Arc<dyn GraphSink>,
    config: AppConfig,
    tracker: ProgressTracker,
}

impl JobEngine {
    /// Spawns the worker pool and returns the engine handle.
    pub fn start(db: Arc<SurrealDbClient>, graph: Arc<dyn GraphSink>, config: AppConfig) -> Self {
        let worker_count = config.worker_count.max(1);
        let (sender, receiver) = mpsc::channel::<KgTask>(QUEUE_CAPACITY);
        let receiver = Arc::new(AsyncMutex::new(receiver));

        let shared = Arc::new(EngineShared {
            db,
            graph,
            config,
            tracker: ProgressTracker::new(),
        });

        let workers = (0..worker_count)
            .map(|index| {
                let receiver = Arc::clone(&receiver);
                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    worker_loop(index, receiver, shared).await;
                })
            })
            .collect();

        Self {
            shared,
            queue: std::sync::Mutex::new(Some(sender)),
            workers: std::sync::Mutex::new(workers),
        }
    }

    /// Creates the durable task row, registers the in-memory progress
    /// entry and enqueues the job. Returns immediately with the task id.
    pub async fn submit(
        &self,
        user_id: &str,
        request: GraphBuildRequest,
    ) -> Result<String, AppError> {
        if request.file_ids.is_empty() {
            return Err(AppError::Validation(
                "at least one file id is required".to_string(),
            ));
        }

        let sender = {
            let guard = self
                .queue
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            guard.clone()
        }
        .ok_or_else(|| AppError::InternalError("job engine is shut down".to_string()))?;

        let task =
            KgTask::create_and_store(user_id.to_string(), request, &self.shared.db).await?;
        self.shared.tracker.init(&task.id);
        let task_id = task.id.clone();

        sender
            .send(task)
            .await
            .map_err(|_| AppError::InternalError("job queue is closed".to_string()))?;

        info!(%task_id, user_id, "knowledge graph job submitted");
        Ok(task_id)
    }

    /// Live progress for a running job; `None` once the job has reached a
    /// terminal state (the durable task row is the record then).
    pub fn progress_snapshot(&self, task_id: &str) -> Option<TaskProgress> {
        self.shared.tracker.get(task_id)
    }

    /// Stops accepting jobs and waits for queued work to drain.
    pub async fn shutdown(&self) {
        let sender = {
            let mut guard = self
                .queue
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            guard.take()
        };
        drop(sender);

        let workers = {
            let mut guard = self
                .workers
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            std::mem::take(&mut *guard)
        };
        for worker in workers {
            if let Err(err) = worker.await {
                warn!(%err, "worker did not shut down cleanly");
            }
        }
        info!("job engine drained");
    }
}

async fn worker_loop(
    index: usize,
    receiver: Arc<AsyncMutex<mpsc::Receiver<KgTask>>>,
    shared: Arc<EngineShared>,
) {
    loop {
        let task = { receiver.lock().await.recv().await };
        let Some(task) = task else {
            debug!(worker = index, "job queue closed, worker exiting");
            break;
        };

        let task_id = task.id.clone();
        info!(worker = index, %task_id, "picked up job");
        Box::pin(run_job(Arc::clone(&shared), task)).await;
    }
}

#[tracing::instrument(skip_all, fields(task_id = %task.id, user_id = %task.user_id))]
async fn run_job(shared: Arc<EngineShared>, task: KgTask) {
    let reporter = ProgressReporter {
        tracker: shared.tracker.clone(),
        db: Arc::clone(&shared.db),
        task_id: task.id.clone(),
    };

    match execute_stages(&shared, &task, &reporter).await {
        Ok(outcome) => {
            reporter
                .report(
                    100,
                    TaskStatus::Completed,
                    &format!(
                        "knowledge graph built with {} entities and {} relations",
                        outcome.entity_count, outcome.relation_count
                    ),
                    "finalize",
                )
                .await;
            info!(kg_id = %outcome.kg_id, "job completed");
        }
        Err((stage, err)) => {
            error!(stage, %err, "job failed");
            reporter.fail(stage, &format!("{stage} stage error: {err}")).await;
        }
    }

    // terminal state lives in the durable row from here on
    shared.tracker.remove(&task.id);
}

struct JobOutcome {
    kg_id: String,
    entity_count: usize,
    relation_count: usize,
}

async fn execute_stages(
    shared: &EngineShared,
    task: &KgTask,
    reporter: &ProgressReporter,
) -> Result<JobOutcome, StageError> {
    let request = &task.algorithms;

    reporter
        .report(
            5,
            TaskStatus::Processing,
            "job accepted, preparing to parse files",
            "init",
        )
        .await;

    let (texts, valid_file_ids) = parse_stage(shared, task, reporter).await?;
    let processed = preprocess_stage(shared, request, &texts, reporter).await;

    let llm = build_llm_client(&shared.config, request.model_api_key.as_deref());
    let mentions = entity_stage(request, &processed, llm.clone(), reporter).await?;

    let aligner = EntityAligner::new(shared.config.alignment_threshold);
    let (aligned, merge_map) = aligner.align(&mentions);
    reporter
        .report(
            50,
            TaskStatus::Processing,
            &format!(
                "aligned {} mentions into {} entities",
                mentions.len(),
                aligned.len()
            ),
            "align",
        )
        .await;

    let triples = relation_stage(request, &processed, &aligned, llm, reporter).await?;
    let triples = EntityAligner::adjust_triples(triples, &merge_map);
    reporter
        .report(
            65,
            TaskStatus::Processing,
            &format!("relation extraction finished with {} triples", triples.len()),
            "extract_relations",
        )
        .await;

    let triples = completion_stage(shared, request, &aligned, triples, reporter).await;

    let outcome =
        persist_stage(shared, task, request, valid_file_ids, &aligned, &triples, reporter)
            .await?;

    visualize_stage(shared, request, &outcome.kg_id, reporter).await;

    if let Err(err) = KnowledgeGraph::mark_completed(&outcome.kg_id, &shared.db).await {
        warn!(%err, "failed to mark graph row completed");
    }

    Ok(outcome)
}

async fn parse_stage(
    shared: &EngineShared,
    task: &KgTask,
    reporter: &ProgressReporter,
) -> Result<(Vec<String>, Vec<String>), StageError> {
    let parser = FileParser::new();
    let upload_dir = PathBuf::from(&shared.config.upload_dir);
    let total = task.file_ids.len();

    let results: Vec<Option<(String, String)>> =
        stream::iter(task.file_ids.iter().cloned().enumerate())
            .map(|(index, file_id)| {
                let parser = &parser;
                let upload_dir = &upload_dir;
                async move {
                    let outcome = match parser.resolve_path(upload_dir, &file_id).await {
                        Some(path) => parser.parse(&path, None).await,
                        None => Err(ParseError::FileMissing(file_id.clone())),
                    };

                    #[allow(clippy::cast_possible_truncation)]
                    let progress = 5 + (10 * (index + 1) / total) as u8;
                    match outcome {
                        Ok(text) => {
                            reporter
                                .report(
                                    progress,
                                    TaskStatus::Processing,
                                    &format!("parsed file {}/{total}", index + 1),
                                    "parse",
                                )
                                .await;
                            Some((file_id.clone(), text))
                        }
                        Err(err) => {
                            warn!(%file_id, %err, "skipping unparsable file");
                            reporter
                                .report(
                                    progress,
                                    TaskStatus::Processing,
                                    &format!("skipped file {}/{total}: {err}", index + 1),
                                    "parse",
                                )
                                .await;
                            None
                        }
                    }
                }
            })
            .buffered(shared.config.parse_concurrency.max(1))
            .collect()
            .await;

    let mut texts = Vec::new();
    let mut valid_file_ids = Vec::new();
    for (file_id, text) in results.into_iter().flatten() {
        valid_file_ids.push(file_id);
        texts.push(text);
    }

    if texts.is_empty() {
        return Err((
            "parse",
            AppError::Validation(format!(
                "all files skipped: none of the {total} inputs could be parsed"
            )),
        ));
    }

    reporter
        .report(
            15,
            TaskStatus::Processing,
            &format!("parsed {}/{total} files", texts.len()),
            "parse",
        )
        .await;

    Ok((texts, valid_file_ids))
}

async fn preprocess_stage(
    _shared: &EngineShared,
    request: &GraphBuildRequest,
    texts: &[String],
    reporter: &ProgressReporter,
) -> Vec<String> {
    let preprocessor = preprocessor_for(&request.algorithms.preprocess);
    let total = texts.len();

    let mut processed = Vec::with_capacity(total);
    for (index, text) in texts.iter().enumerate() {
        processed.push(preprocessor.process(text));
        #[allow(clippy::cast_possible_truncation)]
        let progress = 15 + (10 * (index + 1) / total) as u8;
        reporter
            .report(
                progress,
                TaskStatus::Processing,
                &format!("preprocessing text {}/{total}", index + 1),
                "preprocess",
            )
            .await;
    }

    let deduped = preprocessor.dedupe(processed);
    reporter
        .report(
            25,
            TaskStatus::Processing,
            &format!("preprocessing finished, {} unique texts", deduped.len()),
            "preprocess",
        )
        .await;
    deduped
}

async fn entity_stage(
    request: &GraphBuildRequest,
    texts: &[String],
    llm: Option<Arc<LlmClient>>,
    reporter: &ProgressReporter,
) -> Result<Vec<EntityMention>, StageError> {
    let extractor = entity_extractor_for(&request.algorithms.entity_extraction, llm);
    let total = texts.len();
    let mut mentions = Vec::new();

    for (index, text) in texts.iter().enumerate() {
        let extracted = extractor
            .extract(text)
            .await
            .map_err(|err| ("extract_entities", err))?;
        mentions.extend(extracted);

        #[allow(clippy::cast_possible_truncation)]
        let progress = 25 + (15 * (index + 1) / total) as u8;
        reporter
            .report(
                progress,
                TaskStatus::Processing,
                &format!(
                    "extracting entities {}/{total}, {} mentions so far",
                    index + 1,
                    mentions.len()
                ),
                "extract_entities",
            )
            .await;
    }

    reporter
        .report(
            40,
            TaskStatus::Processing,
            &format!("entity extraction finished with {} mentions", mentions.len()),
            "extract_entities",
        )
        .await;
    Ok(mentions)
}

async fn relation_stage(
    request: &GraphBuildRequest,
    texts: &[String],
    aligned: &[AlignedEntity],
    llm: Option<Arc<LlmClient>>,
    reporter: &ProgressReporter,
) -> Result<Vec<Triple>, StageError> {
    let extractor = relation_extractor_for(&request.algorithms.relation_extraction, llm);
    let total = texts.len();
    let mut triples = Vec::new();

    for (index, text) in texts.iter().enumerate() {
        let extracted = extractor
            .extract(text, aligned)
            .await
            .map_err(|err| ("extract_relations", err))?;
        triples.extend(extracted);

        #[allow(clippy::cast_possible_truncation)]
        let progress = 50 + (15 * (index + 1) / total) as u8;
        reporter
            .report(
                progress,
                TaskStatus::Processing,
                &format!(
                    "extracting relations {}/{total}, {} triples so far",
                    index + 1,
                    triples.len()
                ),
                "extract_relations",
            )
            .await;
    }

    Ok(triples)
}

/// Non-fatal: a completion failure carries the observed triples forward.
async fn completion_stage(
    shared: &EngineShared,
    request: &GraphBuildRequest,
    aligned: &[AlignedEntity],
    triples: Vec<Triple>,
    reporter: &ProgressReporter,
) -> Vec<Triple> {
    if !request.enable_completion {
        reporter
            .report(
                75,
                TaskStatus::Processing,
                "completion disabled, keeping observed relations",
                "complete",
            )
            .await;
        return triples;
    }

    let transe_config = TransEConfig {
        embedding_dim: shared.config.embedding_dim,
        margin: shared.config.margin,
        learning_rate: shared.config.learning_rate,
        epochs: shared.config.epochs,
    };
    let mut completer =
        completer_for(&request.algorithms.knowledge_completion, transe_config);

    let entities = aligned.to_vec();
    let observed = triples.clone();
    let completed = tokio::task::spawn_blocking(move || completer.complete(&entities, &observed))
        .await;

    match completed {
        Ok(completed) => {
            reporter
                .report(
                    75,
                    TaskStatus::Processing,
                    &format!("completion finished, {} relations total", completed.len()),
                    "complete",
                )
                .await;
            completed
        }
        Err(err) => {
            warn!(%err, "knowledge completion crashed, keeping observed relations");
            reporter
                .report(
                    75,
                    TaskStatus::Processing,
                    "completion unavailable, keeping observed relations",
                    "complete",
                )
                .await;
            triples
        }
    }
}

async fn persist_stage(
    shared: &EngineShared,
    task: &KgTask,
    request: &GraphBuildRequest,
    valid_file_ids: Vec<String>,
    aligned: &[AlignedEntity],
    triples: &[Triple],
    reporter: &ProgressReporter,
) -> Result<JobOutcome, StageError> {
    let graph_row = KnowledgeGraph::new(
        task.user_id.clone(),
        request.kg_name.clone(),
        valid_file_ids,
        aligned.len() as u64,
        triples.len() as u64,
    )
    .create_and_store(&shared.db)
    .await
    .map_err(|err| ("persist", err))?;

    // the task row learns its kg_id before any terminal status can be read
    KgTask::record_kg_id(&task.id, &graph_row.id, &shared.db)
        .await
        .map_err(|err| ("persist", err))?;
    shared.tracker.set_kg_id(&task.id, &graph_row.id);

    if let Err(err) = shared
        .graph
        .persist(&task.user_id, &graph_row.id, aligned, triples)
        .await
    {
        let _ = KnowledgeGraph::record_build_state(
            &graph_row.id,
            GraphStatus::Failed,
            80,
            &err.to_string(),
            &shared.db,
        )
        .await;
        return Err(("persist", err));
    }

    reporter
        .report(
            90,
            TaskStatus::Processing,
            &format!(
                "persisted {} entities and {} relations",
                aligned.len(),
                triples.len()
            ),
            "persist",
        )
        .await;

    Ok(JobOutcome {
        kg_id: graph_row.id,
        entity_count: aligned.len(),
        relation_count: triples.len(),
    })
}

/// Non-fatal preview generation for the UI.
async fn visualize_stage(
    shared: &EngineShared,
    request: &GraphBuildRequest,
    kg_id: &str,
    reporter: &ProgressReporter,
) {
    if !request.enable_visualization {
        reporter
            .report(
                95,
                TaskStatus::Processing,
                "visualization disabled",
                "visualize",
            )
            .await;
        return;
    }

    match shared.graph.preview(kg_id, PREVIEW_LIMIT).await {
        Ok((nodes, edges)) => {
            reporter
                .report(
                    95,
                    TaskStatus::Processing,
                    &format!("visualization preview ready ({nodes} nodes, {edges} edges)"),
                    "visualize",
                )
                .await;
        }
        Err(err) => {
            warn!(%err, "visualization preview unavailable");
            reporter
                .report(
                    95,
                    TaskStatus::Processing,
                    "visualization skipped, graph unaffected",
                    "visualize",
                )
                .await;
        }
    }
}

fn build_llm_client(config: &AppConfig, override_key: Option<&str>) -> Option<Arc<LlmClient>> {
    let key = override_key
        .filter(|k| !k.trim().is_empty())
        .map(ToString::to_string)
        .or_else(|| {
            let configured = config.llm_api_key.trim();
            (!configured.is_empty()).then(|| configured.to_string())
        })?;

    Some(Arc::new(LlmClient::new(
        &config.llm_base_url,
        &key,
        &config.llm_model,
    )))
}

/// Writes every update to the in-memory map and mirrors it into the task
/// row; durable errors are logged and tolerated mid-job, the terminal
/// write is retried.
struct ProgressReporter {
    tracker: ProgressTracker,
    db: Arc<SurrealDbClient>,
    task_id: String,
}

impl ProgressReporter {
    async fn report(&self, progress: u8, status: TaskStatus, message: &str, stage: &str) {
        let effective = self
            .tracker
            .record(&self.task_id, progress, status, message, stage);
        self.mirror(&effective, message, stage).await;
    }

    /// Failure keeps the last progress value and records the reason.
    async fn fail(&self, stage: &'static str, message: &str) {
        let effective = self
            .tracker
            .record(&self.task_id, 0, TaskStatus::Failed, message, stage);
        self.mirror(&effective, message, stage).await;
    }

    async fn mirror(&self, effective: &TaskProgress, message: &str, stage: &str) {
        let attempts = if effective.status.is_terminal() { 3 } else { 1 };

        for attempt in 1..=attempts {
            match KgTask::record_progress(
                &self.task_id,
                effective.progress,
                effective.status,
                message,
                stage,
                &self.db,
            )
            .await
            {
                Ok(()) => return,
                Err(err) if attempt < attempts => {
                    warn!(%err, attempt, "durable progress write failed, retrying");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                Err(err) => {
                    warn!(%err, "durable progress write failed, continuing");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph_store::GraphSink;
    use common::storage::types::build_request::AlgorithmSelection;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use uuid::Uuid;

    #[derive(Debug, Clone)]
    struct PersistCall {
        user_id: String,
        kg_id: String,
        entities: Vec<AlignedEntity>,
        triples: Vec<Triple>,
    }

    #[derive(Default)]
    struct FakeGraphSink {
        calls: Mutex<Vec<PersistCall>>,
        fail_persist: bool,
    }

    #[async_trait::async_trait]
    impl GraphSink for FakeGraphSink {
        async fn persist(
            &self,
            user_id: &str,
            kg_id: &str,
            entities: &[AlignedEntity],
            triples: &[Triple],
        ) -> Result<(), AppError> {
            if self.fail_persist {
                return Err(AppError::InternalError("graph store down".to_string()));
            }
            self.calls
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push(PersistCall {
                    user_id: user_id.to_string(),
                    kg_id: kg_id.to_string(),
                    entities: entities.to_vec(),
                    triples: triples.to_vec(),
                });
            Ok(())
        }

        async fn preview(&self, _kg_id: &str, _limit: usize) -> Result<(usize, usize), AppError> {
            Ok((0, 0))
        }
    }

    const FILLER: &str = "the quick brown fox jumps over the lazy dog and keeps running through the field without stopping for anything at all ";

    fn rule_request(file_ids: &[&str]) -> GraphBuildRequest {
        GraphBuildRequest {
            file_ids: file_ids.iter().map(ToString::to_string).collect(),
            kg_name: Some("test graph".to_string()),
            algorithms: AlgorithmSelection {
                preprocess: "simhash".to_string(),
                entity_extraction: "rule".to_string(),
                relation_extraction: "rule".to_string(),
                knowledge_completion: "transe".to_string(),
            },
            model_api_key: None,
            enable_completion: false,
            enable_visualization: false,
        }
    }

    async fn test_engine(
        upload_dir: &TempDir,
        sink: Arc<FakeGraphSink>,
    ) -> (JobEngine, Arc<SurrealDbClient>) {
        let db = Arc::new(
            SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
                .await
                .expect("in-memory surrealdb"),
        );

        let mut config = AppConfig::default();
        config.upload_dir = upload_dir.path().display().to_string();
        config.worker_count = 2;
        config.epochs = 10;

        let engine = JobEngine::start(Arc::clone(&db), sink, config);
        (engine, db)
    }

    async fn wait_for_terminal(db: &SurrealDbClient, task_id: &str) -> KgTask {
        for _ in 0..200 {
            if let Ok(Some(task)) = db.get_item::<KgTask>(task_id).await {
                if task.status.is_terminal() {
                    return task;
                }
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("task {task_id} did not reach a terminal state");
    }

    fn write_upload(dir: &TempDir, name: &str, body: &str) {
        std::fs::write(dir.path().join(name), body).expect("write upload");
    }

    #[tokio::test]
    async fn happy_path_builds_and_persists_the_graph() {
        let uploads = TempDir::new().expect("tempdir");
        write_upload(
            &uploads,
            "doc1.txt",
            &format!("百度公司于2023年推出文心一言。王海峰领导百度研究院。{FILLER}"),
        );

        let sink = Arc::new(FakeGraphSink::default());
        let (engine, db) = test_engine(&uploads, Arc::clone(&sink)).await;

        let task_id = engine
            .submit("user-1", rule_request(&["doc1.txt"]))
            .await
            .expect("submit");
        let task = wait_for_terminal(&db, &task_id).await;

        assert_eq!(task.status, TaskStatus::Completed, "message: {}", task.message);
        assert_eq!(task.progress, 100);
        let kg_id = task.kg_id.expect("kg_id set on completion");
        assert!(!task.message.contains("failed"));

        let calls = sink
            .calls
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        assert_eq!(calls.len(), 1);
        let call = &calls[0];
        assert_eq!(call.user_id, "user-1");
        assert_eq!(call.kg_id, kg_id);

        let names: Vec<&str> = call.entities.iter().map(|e| e.name.as_str()).collect();
        for expected in ["百度公司", "文心一言", "王海峰", "百度研究院"] {
            assert!(names.contains(&expected), "missing {expected} in {names:?}");
        }

        let relation_pairs: Vec<(String, String, String)> = call
            .triples
            .iter()
            .map(|t| {
                let resolve = |id: &str| {
                    call.entities
                        .iter()
                        .find(|e| e.id == id)
                        .map(|e| e.name.clone())
                        .unwrap_or_default()
                };
                (resolve(&t.head_id), t.relation.clone(), resolve(&t.tail_id))
            })
            .collect();
        assert!(relation_pairs.contains(&(
            "百度公司".to_string(),
            "推出".to_string(),
            "文心一言".to_string()
        )));
        assert!(relation_pairs.contains(&(
            "王海峰".to_string(),
            "领导".to_string(),
            "百度研究院".to_string()
        )));

        // graph header row is completed as well
        let graph: KnowledgeGraph = db
            .get_item(&kg_id)
            .await
            .expect("fetch graph")
            .expect("graph row exists");
        assert_eq!(graph.status, GraphStatus::Completed);
        assert_eq!(graph.entity_count, call.entities.len() as u64);

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn empty_file_ids_are_rejected_at_submit() {
        let uploads = TempDir::new().expect("tempdir");
        let sink = Arc::new(FakeGraphSink::default());
        let (engine, _db) = test_engine(&uploads, sink).await;

        let err = engine
            .submit("user-1", rule_request(&[]))
            .await
            .expect_err("empty file list");
        assert!(matches!(err, AppError::Validation(_)));

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn all_files_missing_fails_the_job() {
        let uploads = TempDir::new().expect("tempdir");
        let sink = Arc::new(FakeGraphSink::default());
        let (engine, db) = test_engine(&uploads, Arc::clone(&sink)).await;

        let task_id = engine
            .submit("user-1", rule_request(&["ghost-1", "ghost-2"]))
            .await
            .expect("submit");
        let task = wait_for_terminal(&db, &task_id).await;

        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.message.contains("all files skipped"), "{}", task.message);
        assert!(!task.message.is_empty());
        assert!(sink
            .calls
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .is_empty());

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn bad_files_are_skipped_while_good_ones_proceed() {
        let uploads = TempDir::new().expect("tempdir");
        write_upload(
            &uploads,
            "good.txt",
            &format!("百度公司推出文心一言。{FILLER}"),
        );
        write_upload(&uploads, "bad.txt", "x");

        let sink = Arc::new(FakeGraphSink::default());
        let (engine, db) = test_engine(&uploads, Arc::clone(&sink)).await;

        let task_id = engine
            .submit("user-1", rule_request(&["good.txt", "bad.txt"]))
            .await
            .expect("submit");
        let task = wait_for_terminal(&db, &task_id).await;

        assert_eq!(task.status, TaskStatus::Completed, "message: {}", task.message);

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn cross_document_mentions_collapse_to_one_node() {
        let uploads = TempDir::new().expect("tempdir");
        write_upload(
            &uploads,
            "a.txt",
            &format!("百度公司推出文心一言。{FILLER}"),
        );
        write_upload(
            &uploads,
            "b.txt",
            "百度公司集团推出文心一言。 quarterly revenue climbed sharply while analysts \
             debated valuation multiples and regulators reviewed several pending filings \
             across overseas subsidiaries during a volatile trading week for technology shares",
        );

        let sink = Arc::new(FakeGraphSink::default());
        let (engine, db) = test_engine(&uploads, Arc::clone(&sink)).await;

        let task_id = engine
            .submit("user-1", rule_request(&["a.txt", "b.txt"]))
            .await
            .expect("submit");
        let task = wait_for_terminal(&db, &task_id).await;
        assert_eq!(task.status, TaskStatus::Completed, "message: {}", task.message);

        let calls = sink
            .calls
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        let call = &calls[0];

        let org_nodes: Vec<&AlignedEntity> = call
            .entities
            .iter()
            .filter(|e| e.name.contains("百度公司"))
            .collect();
        assert_eq!(org_nodes.len(), 1, "duplicate org persisted: {org_nodes:?}");
        assert_eq!(org_nodes[0].name, "百度公司集团");

        // every triple endpoint references a persisted canonical id
        for triple in &call.triples {
            assert!(call.entities.iter().any(|e| e.id == triple.head_id));
            assert!(call.entities.iter().any(|e| e.id == triple.tail_id));
        }

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn persist_failure_marks_task_and_graph_failed() {
        let uploads = TempDir::new().expect("tempdir");
        write_upload(
            &uploads,
            "doc.txt",
            &format!("百度公司推出文心一言。{FILLER}"),
        );

        let sink = Arc::new(FakeGraphSink {
            calls: Mutex::new(Vec::new()),
            fail_persist: true,
        });
        let (engine, db) = test_engine(&uploads, sink).await;

        let task_id = engine
            .submit("user-1", rule_request(&["doc.txt"]))
            .await
            .expect("submit");
        let task = wait_for_terminal(&db, &task_id).await;

        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.message.contains("persist"), "{}", task.message);

        let kg_id = task.kg_id.expect("kg row created before persist");
        let graph: KnowledgeGraph = db
            .get_item(&kg_id)
            .await
            .expect("fetch graph")
            .expect("graph row exists");
        assert_eq!(graph.status, GraphStatus::Failed);

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn completion_enabled_adds_inferred_triples() {
        let uploads = TempDir::new().expect("tempdir");
        write_upload(
            &uploads,
            "chain.txt",
            &format!(
                "百度公司推出文心一言。文心一言推出对话服务。{FILLER}"
            ),
        );

        let sink = Arc::new(FakeGraphSink::default());
        let (engine, db) = test_engine(&uploads, Arc::clone(&sink)).await;

        let mut request = rule_request(&["chain.txt"]);
        request.enable_completion = true;
        let task_id = engine.submit("user-1", request).await.expect("submit");
        let task = wait_for_terminal(&db, &task_id).await;
        assert_eq!(task.status, TaskStatus::Completed, "message: {}", task.message);

        let calls = sink
            .calls
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        let observed = calls[0]
            .triples
            .iter()
            .filter(|t| t.source == crate::types::TripleSource::Extracted)
            .count();
        assert!(calls[0].triples.len() >= observed);

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_drains_cleanly() {
        let uploads = TempDir::new().expect("tempdir");
        let sink = Arc::new(FakeGraphSink::default());
        let (engine, _db) = test_engine(&uploads, sink).await;

        engine.shutdown().await;

        let err = engine
            .submit("user-1", rule_request(&["x.txt"]))
            .await
            .expect_err("submit after shutdown");
        assert!(matches!(err, AppError::InternalError(_)));
    }
}

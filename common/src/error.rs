use async_openai::error::OpenAIError;
use thiserror::Error;
use tokio::task::JoinError;

// Core internal errors
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] surrealdb::Error),
    #[error("Graph store error: {0}")]
    GraphStore(#[from] neo4rs::Error),
    #[error("LLM error: {0}")]
    OpenAI(#[from] OpenAIError),
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Authorization error: {0}")]
    Auth(String),
    #[error("LLM parsing error: {0}")]
    LLMParsing(String),
    #[error("Task join error: {0}")]
    Join(#[from] JoinError),
    #[error("IoError: {0}")]
    Io(#[from] std::io::Error),
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
    #[error("Pipeline processing error: {0}")]
    Processing(String),
    #[error("Internal service error: {0}")]
    InternalError(String),
}

/// Failures of the parse stage, one variant per rejection reason so the
/// job runner can decide between skipping a file and failing the job.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("unsupported file format: {0}")]
    FormatUnsupported(String),
    #[error("file missing: {0}")]
    FileMissing(String),
    #[error("corrupt file: {0}")]
    Corrupt(String),
    #[error("unable to determine text encoding for {0}")]
    EncodingUnknown(String),
    #[error("no text extracted from {0}")]
    EmptyExtraction(String),
    #[error("extracted text is not meaningful: {0}")]
    NotMeaningful(String),
}

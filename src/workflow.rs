use crate::assistant::AssistantError;
use crate::blob::BlobStoreError;
use crate::codegen::CodegenError;
use crate::config::ConfigError;
use crate::record::RecordStoreError;

pub mod envelope;
pub mod prompts;
pub mod retry;
pub mod service;

pub use envelope::{ApiEnvelope, ResponseType};
pub use retry::RetryPolicy;
pub use service::WorkflowService;

/// Internal failure of one workflow operation, mapped onto the uniform
/// response envelope at the operation boundary.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error(transparent)]
    Record(#[from] RecordStoreError),
    #[error(transparent)]
    Blob(#[from] BlobStoreError),
    #[error(transparent)]
    Assistant(#[from] AssistantError),
    #[error(transparent)]
    Codegen(#[from] CodegenError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("record `{0}` has no job-runner session; upload a file first")]
    MissingSession(String),
    #[error("record `{0}` has no cleaned file; run the clean phase first")]
    MissingCleanedFile(String),
    #[error("record `{0}` has no generated queries; run query generation first")]
    MissingQueries(String),
    #[error("query routine returned {actual} entries, expected {expected}")]
    QueryCountMismatch { expected: usize, actual: usize },
    #[error("query routine output could not be parsed: {source}")]
    QueryParse {
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to dispatch background phase: {source}")]
    Dispatch {
        #[source]
        source: std::io::Error,
    },
}

impl WorkflowError {
    /// Envelope status code for this failure.
    pub fn status_code(&self) -> u16 {
        match self {
            WorkflowError::Record(RecordStoreError::NotFound(_)) => 404,
            WorkflowError::Blob(BlobStoreError::NotFound(_)) => 404,
            WorkflowError::MissingSession(_)
            | WorkflowError::MissingCleanedFile(_)
            | WorkflowError::MissingQueries(_) => 400,
            _ => 500,
        }
    }
}

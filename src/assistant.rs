use serde::{Deserialize, Serialize};

pub mod client;
pub mod messages;

pub use client::AssistantClient;
pub use messages::collect_artifacts;

#[derive(Debug, thiserror::Error)]
pub enum AssistantError {
    #[error("assistant api request failed: {0}")]
    ApiRequest(String),
    #[error("assistant api responded with error: {0}")]
    ApiResponse(String),
}

/// Terminal state of one submitted job. `Completed` guarantees artifacts can
/// be enumerated; `Failed` guarantees an error message; `Incomplete` is a
/// timeout/partial condition with nothing guaranteed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Completed,
    Incomplete,
    Failed,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Completed => write!(f, "completed"),
            JobState::Incomplete => write!(f, "incomplete"),
            JobState::Failed => write!(f, "failed"),
        }
    }
}

/// One output produced by a job run, in emission order. File artifacts are
/// fetched separately by id and persisted to the blob store by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Artifact {
    Text { content: String },
    File { file_id: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub state: JobState,
    pub artifacts: Vec<Artifact>,
    pub error_message: Option<String>,
}

impl RunOutcome {
    pub fn texts(&self) -> Vec<String> {
        self.artifacts
            .iter()
            .filter_map(|artifact| match artifact {
                Artifact::Text { content } => Some(content.clone()),
                Artifact::File { .. } => None,
            })
            .collect()
    }

    pub fn file_ids(&self) -> Vec<String> {
        self.artifacts
            .iter()
            .filter_map(|artifact| match artifact {
                Artifact::File { file_id } => Some(file_id.clone()),
                Artifact::Text { .. } => None,
            })
            .collect()
    }

    pub fn first_file_id(&self) -> Option<String> {
        self.file_ids().into_iter().next()
    }
}

/// Handles of the external job-runner session bound to one record at upload
/// time and reused for every later submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRefs {
    pub thread_ref: String,
    pub assistant_ref: String,
}

/// Consumed external capability: submit an instruction against a session,
/// wait for the job to reach a terminal state, enumerate its artifacts.
pub trait JobRunner: Send + Sync {
    fn open_session(&self, filename: &str, bytes: &[u8]) -> Result<SessionRefs, AssistantError>;
    fn submit_and_await(
        &self,
        session: &SessionRefs,
        instruction: &str,
    ) -> Result<RunOutcome, AssistantError>;
    fn fetch_file(&self, file_id: &str) -> Result<Vec<u8>, AssistantError>;
}

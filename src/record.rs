use crate::shared::ids::RecordId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub mod sqlite;

pub use sqlite::SqliteRecordStore;

#[derive(Debug, thiserror::Error)]
pub enum RecordStoreError {
    #[error("workflow record `{0}` was not found")]
    NotFound(String),
    #[error("record store failure: {0}")]
    Storage(String),
    #[error("record encoding failed: {source}")]
    Encode {
        #[source]
        source: serde_json::Error,
    },
}

/// Phase names of the workflow, in forward order. `status.current` never
/// moves backward through this sequence; failed attempts are recorded inside
/// the phase payload instead.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Started,
    Uploaded,
    Cleaned,
    QueryReady,
    GraphReady,
    InsightsReady,
}

impl Phase {
    pub fn rank(self) -> u8 {
        match self {
            Phase::Started => 0,
            Phase::Uploaded => 1,
            Phase::Cleaned => 2,
            Phase::QueryReady => 3,
            Phase::GraphReady => 4,
            Phase::InsightsReady => 5,
        }
    }

    /// Forward-only: a phase may advance or re-enter itself, never regress.
    pub fn can_advance_to(self, next: Self) -> bool {
        next.rank() >= self.rank()
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Started => write!(f, "started"),
            Phase::Uploaded => write!(f, "uploaded"),
            Phase::Cleaned => write!(f, "cleaned"),
            Phase::QueryReady => write!(f, "query_ready"),
            Phase::GraphReady => write!(f, "graph_ready"),
            Phase::InsightsReady => write!(f, "insights_ready"),
        }
    }
}

/// Terminal outcome of one job-runner phase, kept under the phase's key in
/// `status` so polling callers can read what happened.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPhaseStatus {
    /// Terminal job state: `completed`, `incomplete` or `failed`.
    pub status: String,
    #[serde(default)]
    pub message: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The record's structured `status` field: current phase plus per-phase
/// payloads. Payload shapes differ per phase; unknown keys round-trip
/// through `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusField {
    #[serde(default)]
    pub current: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleaned: Option<JobPhaseStatus>,
    /// Textual commentary from the insights run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Vec<String>>,
    /// Blob keys of rendered insight images.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insights: Option<Vec<String>>,
    /// Terminal job state of the insights run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insights_status: Option<String>,
    /// Index of the most recently rendered graph.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph_index: Option<usize>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl StatusField {
    /// Moves `current` to `next` if that is a forward move; regressions are
    /// dropped. Deliberate phase resets bypass this and assign directly.
    pub fn advance(&mut self, next: Phase) {
        if self.current.can_advance_to(next) {
            self.current = next;
        }
    }
}

/// One generated analysis question. `graph` is attached by the graph phase
/// once an image is rendered; `graph_error` records an exhausted attempt
/// budget and does not block a later re-render.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryEntry {
    pub question: String,
    #[serde(alias = "Solution")]
    pub solution: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph_error: Option<String>,
}

/// One per uploaded dataset; tracks file references, generated analyses and
/// phase status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRecord {
    pub id: RecordId,
    #[serde(default)]
    pub origin_file: Option<String>,
    #[serde(default)]
    pub thread_ref: Option<String>,
    #[serde(default)]
    pub assistant_ref: Option<String>,
    #[serde(default)]
    pub cleaned_file: Option<String>,
    #[serde(default)]
    pub header: Option<String>,
    #[serde(default)]
    pub queries: Vec<QueryEntry>,
    #[serde(default)]
    pub status: StatusField,
    pub created_at: i64,
    pub updated_at: i64,
}

impl WorkflowRecord {
    pub fn new(id: RecordId, now: i64) -> Self {
        Self {
            id,
            origin_file: None,
            thread_ref: None,
            assistant_ref: None,
            cleaned_file: None,
            header: None,
            queries: Vec::new(),
            status: StatusField::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// True once upload bound a job-runner session to this record.
    pub fn has_session(&self) -> bool {
        self.thread_ref.is_some() && self.assistant_ref.is_some()
    }
}

/// A strict partial update: only fields carrying `Some` are merged into the
/// stored record; everything else is left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assistant_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleaned_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queries: Option<Vec<QueryEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<StatusField>,
}

impl RecordPatch {
    pub fn is_empty(&self) -> bool {
        self == &RecordPatch::default()
    }

    pub fn apply(self, record: &mut WorkflowRecord) {
        if let Some(origin_file) = self.origin_file {
            record.origin_file = Some(origin_file);
        }
        if let Some(thread_ref) = self.thread_ref {
            record.thread_ref = Some(thread_ref);
        }
        if let Some(assistant_ref) = self.assistant_ref {
            record.assistant_ref = Some(assistant_ref);
        }
        if let Some(cleaned_file) = self.cleaned_file {
            record.cleaned_file = Some(cleaned_file);
        }
        if let Some(header) = self.header {
            record.header = Some(header);
        }
        if let Some(queries) = self.queries {
            record.queries = queries;
        }
        if let Some(status) = self.status {
            record.status = status;
        }
    }
}

/// Consumed persistence interface: one document per workflow record, merged
/// by strict partial updates.
pub trait RecordStore: Send + Sync {
    fn create(&self, record: WorkflowRecord) -> Result<WorkflowRecord, RecordStoreError>;
    fn get(&self, id: &RecordId) -> Result<WorkflowRecord, RecordStoreError>;
    fn update(&self, id: &RecordId, patch: RecordPatch) -> Result<WorkflowRecord, RecordStoreError>;
}

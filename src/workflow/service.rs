use super::envelope::ApiEnvelope;
use super::prompts::{
    graph_prompt, query_generation_prompt, CLEAN_INSTRUCTION, CSV_PREVIEW_LINES,
    GRAPH_ENTRY_POINT, INSIGHTS_INSTRUCTION, QUERY_COUNT, QUERY_ENTRY_POINT,
};
use super::retry::RetryPolicy;
use super::WorkflowError;
use crate::assistant::{AssistantClient, JobRunner, JobState, RunOutcome, SessionRefs};
use crate::blob::{BlobStore, FsBlobStore};
use crate::codegen::{
    ChatHttpClient, CodeGenHelper, CodegenError, RoutineCall, RoutineEngine, RoutineSandbox,
};
use crate::config::Settings;
use crate::record::{
    JobPhaseStatus, Phase, QueryEntry, RecordPatch, RecordStore, RecordStoreError, WorkflowRecord,
};
use crate::shared::fs_atomic::atomic_write_file;
use crate::shared::ids::{generate_record_id, RecordId};
use crate::shared::logging::append_event_log;
use crate::shared::now_secs;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Drives one workflow record through its phases. Each operation is an
/// independent read-modify-write against the record store; there is no
/// cross-step locking, so concurrent operations on the same record race with
/// last-write-wins semantics per patched field set. Patches are strictly
/// field-scoped, which bounds the blast radius, but callers should serialize
/// steps per record.
#[derive(Clone)]
pub struct WorkflowService {
    records: Arc<dyn RecordStore>,
    blobs: Arc<dyn BlobStore>,
    jobs: Arc<dyn JobRunner>,
    engine: Arc<dyn RoutineEngine>,
    state_root: PathBuf,
    graph_retry: RetryPolicy,
    graphs_per_invocation: usize,
}

impl WorkflowService {
    pub fn new(
        records: Arc<dyn RecordStore>,
        blobs: Arc<dyn BlobStore>,
        jobs: Arc<dyn JobRunner>,
        engine: Arc<dyn RoutineEngine>,
        state_root: impl Into<PathBuf>,
        graph_retry: RetryPolicy,
        graphs_per_invocation: usize,
    ) -> Self {
        Self {
            records,
            blobs,
            jobs,
            engine,
            state_root: state_root.into(),
            graph_retry,
            graphs_per_invocation: graphs_per_invocation.max(1),
        }
    }

    /// Production wiring: SQLite records, filesystem blobs, the assistants
    /// API as job runner, and the chat-backed sandboxed routine engine.
    pub fn from_settings(settings: &Settings) -> Result<Self, WorkflowError> {
        settings.validate()?;
        let records = crate::record::SqliteRecordStore::open(&settings.record_db_path())?;
        let blobs = FsBlobStore::new(settings.blob_root());
        let jobs = AssistantClient::from_settings(settings)?;
        let chat = ChatHttpClient::from_settings(settings)?;
        let sandbox = RoutineSandbox::new(
            settings.python_binary.clone(),
            settings.scratch_root(),
            Duration::from_secs(settings.sandbox_timeout_secs),
        );
        let engine = CodeGenHelper::new(Arc::new(chat), sandbox);
        Ok(Self::new(
            Arc::new(records),
            Arc::new(blobs),
            Arc::new(jobs),
            Arc::new(engine),
            settings.state_root.clone(),
            RetryPolicy::new(settings.graph_max_attempts),
            settings.graphs_per_invocation,
        ))
    }

    // ---- operations ----

    pub fn create(&self) -> ApiEnvelope {
        self.respond(self.try_create())
    }

    pub fn upload_file(&self, id: &RecordId, filename: &str, bytes: &[u8]) -> ApiEnvelope {
        self.respond(self.try_upload_file(id, filename, bytes))
    }

    /// Acknowledges immediately; the clean job runs in the background and
    /// reports into the record. Poll `check_status` for the outcome.
    pub fn clean_file(&self, id: &RecordId) -> ApiEnvelope {
        self.respond(self.try_start_clean(id))
    }

    pub fn generate_queries(&self, id: &RecordId) -> ApiEnvelope {
        self.respond(self.try_generate_queries(id))
    }

    /// Processes eligible queries up to the per-invocation budget; invoke
    /// repeatedly to cover the whole list.
    pub fn draw_graphs(&self, id: &RecordId) -> ApiEnvelope {
        self.respond(self.try_draw_graphs(id))
    }

    /// Acknowledges immediately; same background contract as `clean_file`.
    pub fn draw_insights(&self, id: &RecordId) -> ApiEnvelope {
        self.respond(self.try_start_insights(id))
    }

    pub fn check_status(&self, id: &RecordId) -> ApiEnvelope {
        self.respond(self.try_check_status(id))
    }

    fn respond(&self, result: Result<ApiEnvelope, WorkflowError>) -> ApiEnvelope {
        match result {
            Ok(envelope) => envelope,
            Err(err) => ApiEnvelope::error(err.status_code(), err.to_string()),
        }
    }

    // ---- create / upload ----

    fn try_create(&self) -> Result<ApiEnvelope, WorkflowError> {
        let now = now_secs();
        let id = generate_record_id(now)
            .map_err(|err| WorkflowError::Record(RecordStoreError::Storage(err)))?;
        let record = self.records.create(WorkflowRecord::new(id, now))?;
        self.log("info", "record_created", record.id.as_str());
        Ok(ApiEnvelope::success(
            "new analytic record created",
            to_data(&record),
        ))
    }

    fn try_upload_file(
        &self,
        id: &RecordId,
        filename: &str,
        bytes: &[u8],
    ) -> Result<ApiEnvelope, WorkflowError> {
        let record = self.records.get(id)?;

        let stored_name = timestamped_filename(filename, Utc::now());
        // Blob failure aborts here, before any session exists, so the
        // record never carries session refs without an origin file.
        self.blobs.put(&stored_name, bytes)?;
        let session = self.jobs.open_session(&stored_name, bytes)?;

        let mut status = record.status.clone();
        status.advance(Phase::Uploaded);
        self.records.update(
            id,
            RecordPatch {
                origin_file: Some(stored_name.clone()),
                thread_ref: Some(session.thread_ref),
                assistant_ref: Some(session.assistant_ref),
                status: Some(status),
                ..RecordPatch::default()
            },
        )?;

        self.log(
            "info",
            "upload_complete",
            &format!("record {id} stored {stored_name}"),
        );
        Ok(ApiEnvelope::success(
            format!("successfully uploaded {filename}"),
            json!(stored_name),
        ))
    }

    // ---- clean phase ----

    fn try_start_clean(&self, id: &RecordId) -> Result<ApiEnvelope, WorkflowError> {
        let record = self.records.get(id)?;
        session_refs(&record)?;

        // Reset before dispatch: stale messages and attachments from an
        // earlier clean run must never linger into this one.
        let mut status = record.status.clone();
        status.cleaned = None;
        self.records.update(
            id,
            RecordPatch {
                cleaned_file: Some(String::new()),
                status: Some(status),
                ..RecordPatch::default()
            },
        )?;

        self.dispatch("clean", id, |service, id| service.run_clean_phase(&id))?;
        Ok(ApiEnvelope::success(
            "cleaning started; poll status for the outcome",
            json!("started"),
        ))
    }

    /// Blocking body of the clean phase; the public operation dispatches
    /// this onto a background thread. Upstream failure is recorded into the
    /// phase payload, never raised.
    pub fn run_clean_phase(&self, id: &RecordId) {
        if let Err(err) = self.clean_phase_inner(id) {
            self.log("error", "clean_failed", &format!("record {id}: {err}"));
        }
    }

    fn clean_phase_inner(&self, id: &RecordId) -> Result<(), WorkflowError> {
        let record = self.records.get(id)?;
        let session = session_refs(&record)?;
        self.log("info", "clean_started", id.as_str());

        let (payload, cleaned_key) =
            match self.jobs.submit_and_await(&session, CLEAN_INSTRUCTION) {
                Ok(outcome) => self.clean_outcome_payload(&outcome),
                Err(err) => (failed_payload(err.to_string()), None),
            };

        let mut status = record.status.clone();
        // Deliberate assignment: the clean phase owns this transition, even
        // when re-cleaning resets a record that had advanced further.
        status.current = Phase::Cleaned;
        let state = payload.status.clone();
        status.cleaned = Some(payload);

        self.records.update(
            id,
            RecordPatch {
                cleaned_file: cleaned_key,
                status: Some(status),
                ..RecordPatch::default()
            },
        )?;
        self.log(
            "info",
            "clean_finished",
            &format!("record {id} terminal state {state}"),
        );
        Ok(())
    }

    fn clean_outcome_payload(&self, outcome: &RunOutcome) -> (JobPhaseStatus, Option<String>) {
        let mut message = outcome.texts();
        if let Some(err) = &outcome.error_message {
            message.push(err.clone());
        }

        let mut attachment = None;
        let mut cleaned_key = None;
        if outcome.state == JobState::Completed {
            if let Some(file_id) = outcome.first_file_id() {
                match self.persist_artifact(&file_id, "csv") {
                    Ok(key) => {
                        attachment = Some(key.clone());
                        cleaned_key = Some(key);
                    }
                    Err(err) => message.push(format!("failed to persist cleaned file: {err}")),
                }
            }
        }

        (
            JobPhaseStatus {
                status: outcome.state.to_string(),
                message,
                attachment,
                extra: serde_json::Map::new(),
            },
            cleaned_key,
        )
    }

    // ---- query generation ----

    fn try_generate_queries(&self, id: &RecordId) -> Result<ApiEnvelope, WorkflowError> {
        let record = self.records.get(id)?;
        let cleaned = cleaned_file(&record)?;

        let bytes = self.blobs.get(cleaned)?;
        let head = csv_preview(&bytes, CSV_PREVIEW_LINES);

        let outcome = self.engine.synthesize_and_run(
            None,
            &query_generation_prompt(&head),
            &RoutineCall::NoArgs {
                entry_point: QUERY_ENTRY_POINT.to_string(),
            },
        )?;

        let generated: Vec<QueryEntry> = serde_json::from_str(&outcome.output)
            .map_err(|source| WorkflowError::QueryParse { source })?;
        if generated.len() != QUERY_COUNT {
            return Err(WorkflowError::QueryCountMismatch {
                expected: QUERY_COUNT,
                actual: generated.len(),
            });
        }
        let queries: Vec<QueryEntry> = generated
            .into_iter()
            .map(|entry| QueryEntry {
                question: entry.question,
                solution: entry.solution,
                graph: None,
                graph_error: None,
            })
            .collect();

        let mut status = record.status.clone();
        status.advance(Phase::QueryReady);
        let updated = self.records.update(
            id,
            RecordPatch {
                header: Some(head),
                queries: Some(queries),
                status: Some(status),
                ..RecordPatch::default()
            },
        )?;

        self.log("info", "queries_ready", id.as_str());
        Ok(ApiEnvelope::success(
            "analysis questions are ready",
            to_data(&updated.queries),
        ))
    }

    // ---- graph phase ----

    fn try_draw_graphs(&self, id: &RecordId) -> Result<ApiEnvelope, WorkflowError> {
        let record = self.records.get(id)?;
        let cleaned = cleaned_file(&record)?;
        if record.queries.is_empty() {
            return Err(WorkflowError::MissingQueries(id.to_string()));
        }

        let bytes = self.blobs.get(cleaned)?;
        let csv_path = self.materialize_csv(id, &bytes)?;
        let header = record.header.clone().unwrap_or_default();

        let mut queries = record.queries.clone();
        let mut budget = self.graphs_per_invocation;
        let mut processed = Vec::new();

        for index in 0..queries.len() {
            // Entries that already carry a graph are settled; a recorded
            // graph_error is informational and leaves the entry eligible.
            if queries[index].graph.is_some() {
                continue;
            }
            if budget == 0 {
                break;
            }
            budget -= 1;

            let prompt = graph_prompt(
                &header,
                &queries[index].question,
                &queries[index].solution,
                id.as_str(),
                index,
            );
            let call = RoutineCall::WithDataframe {
                entry_point: GRAPH_ENTRY_POINT.to_string(),
                csv_path: csv_path.clone(),
            };

            let rendered: Result<String, WorkflowError> = self.graph_retry.run(|_attempt| {
                let outcome = self.engine.synthesize_and_run(None, &prompt, &call)?;
                let reported = outcome.output.clone();
                let (name, image) = outcome
                    .produced_file
                    .ok_or(CodegenError::MissingArtifact { name: reported })?;
                self.blobs.put(&name, &image)?;
                Ok(name)
            });

            match rendered {
                Ok(name) => {
                    queries[index].graph = Some(name.clone());
                    queries[index].graph_error = None;

                    let mut status = record.status.clone();
                    status.advance(Phase::GraphReady);
                    status.graph_index = Some(index);
                    self.records.update(
                        id,
                        RecordPatch {
                            queries: Some(queries.clone()),
                            status: Some(status),
                            ..RecordPatch::default()
                        },
                    )?;
                    self.log(
                        "info",
                        "graph_rendered",
                        &format!("record {id} query {index} -> {name}"),
                    );
                    processed.push(json!({"index": index, "graph": name}));
                }
                Err(err) => {
                    // Budget exhausted for this query: record the terminal
                    // error on the entry and move on.
                    queries[index].graph_error = Some(err.to_string());
                    self.records.update(
                        id,
                        RecordPatch {
                            queries: Some(queries.clone()),
                            ..RecordPatch::default()
                        },
                    )?;
                    self.log(
                        "error",
                        "graph_abandoned",
                        &format!("record {id} query {index}: {err}"),
                    );
                    processed.push(json!({"index": index, "error": err.to_string()}));
                }
            }
        }

        let remaining = queries.iter().filter(|q| q.graph.is_none()).count();
        Ok(ApiEnvelope::success(
            format!(
                "graph generation processed {} queries; {remaining} still lack a graph",
                processed.len()
            ),
            json!({"processed": processed, "remaining": remaining}),
        ))
    }

    // ---- insights phase ----

    fn try_start_insights(&self, id: &RecordId) -> Result<ApiEnvelope, WorkflowError> {
        let record = self.records.get(id)?;
        session_refs(&record)?;

        let mut status = record.status.clone();
        status.message = None;
        status.insights = None;
        status.insights_status = None;
        self.records.update(
            id,
            RecordPatch {
                status: Some(status),
                ..RecordPatch::default()
            },
        )?;

        self.dispatch("insights", id, |service, id| {
            service.run_insights_phase(&id)
        })?;
        Ok(ApiEnvelope::success(
            "insight generation started; poll status for the outcome",
            json!("started"),
        ))
    }

    /// Blocking body of the insights phase; dispatched like the clean phase
    /// and recorded with the same local-recovery policy.
    pub fn run_insights_phase(&self, id: &RecordId) {
        if let Err(err) = self.insights_phase_inner(id) {
            self.log("error", "insights_failed", &format!("record {id}: {err}"));
        }
    }

    fn insights_phase_inner(&self, id: &RecordId) -> Result<(), WorkflowError> {
        let record = self.records.get(id)?;
        let session = session_refs(&record)?;
        self.log("info", "insights_started", id.as_str());

        let (state, message, images) =
            match self.jobs.submit_and_await(&session, INSIGHTS_INSTRUCTION) {
                Ok(outcome) => {
                    let mut message = outcome.texts();
                    if let Some(err) = &outcome.error_message {
                        message.push(err.clone());
                    }
                    let mut images = Vec::new();
                    if outcome.state == JobState::Completed {
                        for file_id in outcome.file_ids() {
                            match self.persist_artifact(&file_id, "png") {
                                Ok(key) => images.push(key),
                                Err(err) => message
                                    .push(format!("failed to persist insight image: {err}")),
                            }
                        }
                    }
                    (outcome.state, message, images)
                }
                Err(err) => (JobState::Failed, vec![err.to_string()], Vec::new()),
            };

        let mut status = record.status.clone();
        status.current = Phase::InsightsReady;
        status.message = Some(message);
        status.insights = Some(images);
        status.insights_status = Some(state.to_string());

        self.records.update(
            id,
            RecordPatch {
                status: Some(status),
                ..RecordPatch::default()
            },
        )?;
        self.log(
            "info",
            "insights_finished",
            &format!("record {id} terminal state {state}"),
        );
        Ok(())
    }

    // ---- status ----

    fn try_check_status(&self, id: &RecordId) -> Result<ApiEnvelope, WorkflowError> {
        let record = self.records.get(id)?;
        Ok(ApiEnvelope::success(
            "current workflow status",
            to_data(&record.status),
        ))
    }

    // ---- helpers ----

    fn dispatch(
        &self,
        phase: &str,
        id: &RecordId,
        body: fn(WorkflowService, RecordId),
    ) -> Result<(), WorkflowError> {
        let service = self.clone();
        let id = id.clone();
        thread::Builder::new()
            .name(format!("{phase}-{id}"))
            .spawn(move || body(service, id))
            .map_err(|source| WorkflowError::Dispatch { source })?;
        Ok(())
    }

    /// Downloads a produced file from the job runner and stores it under
    /// `<fileId>.<ext>`; the key is the retrievable reference.
    fn persist_artifact(&self, file_id: &str, ext: &str) -> Result<String, WorkflowError> {
        let bytes = self.jobs.fetch_file(file_id)?;
        let key = format!("{file_id}.{ext}");
        self.blobs.put(&key, &bytes)?;
        Ok(key)
    }

    fn materialize_csv(&self, id: &RecordId, bytes: &[u8]) -> Result<PathBuf, WorkflowError> {
        let dir = self.state_root.join("scratch");
        fs::create_dir_all(&dir).map_err(|source| {
            WorkflowError::Codegen(CodegenError::Io {
                path: dir.display().to_string(),
                source,
            })
        })?;
        let path = dir.join(format!("{id}.csv"));
        atomic_write_file(&path, bytes).map_err(|source| {
            WorkflowError::Codegen(CodegenError::Io {
                path: path.display().to_string(),
                source,
            })
        })?;
        Ok(fs::canonicalize(&path).unwrap_or(path))
    }

    fn log(&self, level: &str, event: &str, message: &str) {
        append_event_log(&self.state_root, level, event, message);
    }
}

fn session_refs(record: &WorkflowRecord) -> Result<SessionRefs, WorkflowError> {
    match (record.thread_ref.as_ref(), record.assistant_ref.as_ref()) {
        (Some(thread_ref), Some(assistant_ref)) => Ok(SessionRefs {
            thread_ref: thread_ref.clone(),
            assistant_ref: assistant_ref.clone(),
        }),
        _ => Err(WorkflowError::MissingSession(record.id.to_string())),
    }
}

fn cleaned_file(record: &WorkflowRecord) -> Result<&str, WorkflowError> {
    record
        .cleaned_file
        .as_deref()
        .filter(|key| !key.is_empty())
        .ok_or_else(|| WorkflowError::MissingCleanedFile(record.id.to_string()))
}

fn failed_payload(message: String) -> JobPhaseStatus {
    JobPhaseStatus {
        status: JobState::Failed.to_string(),
        message: vec![message],
        attachment: None,
        extra: serde_json::Map::new(),
    }
}

/// Upload blob key: timestamp prefix plus the original name with spaces
/// mapped to dashes.
fn timestamped_filename(filename: &str, now: DateTime<Utc>) -> String {
    let stamped = filename.replace(' ', "-");
    format!("{}_{stamped}", now.format("%Y-%m-%d-%H-%M-%S"))
}

/// First lines of the cleaned CSV: the column row plus sample rows, used as
/// the header snapshot for later prompts.
fn csv_preview(bytes: &[u8], max_lines: usize) -> String {
    String::from_utf8_lossy(bytes)
        .lines()
        .take(max_lines)
        .collect::<Vec<_>>()
        .join("\n")
}

fn to_data<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

use datasight::assistant::{
    Artifact, AssistantError, JobRunner, JobState, RunOutcome, SessionRefs,
};
use datasight::blob::{BlobStore, BlobStoreError, FsBlobStore};
use datasight::codegen::{CodegenError, RoutineCall, RoutineEngine, RoutineOutcome};
use datasight::record::{Phase, RecordStore, SqliteRecordStore, WorkflowRecord};
use datasight::shared::ids::RecordId;
use datasight::shared::now_secs;
use datasight::workflow::{RetryPolicy, WorkflowService};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct ScriptedJobRunner {
    outcomes: Mutex<VecDeque<Result<RunOutcome, AssistantError>>>,
    files: Mutex<HashMap<String, Vec<u8>>>,
    sessions_opened: Mutex<u32>,
    fail_open_session: bool,
    /// When set, submit_and_await blocks until the test releases it, so the
    /// pre-dispatch record state can be observed deterministically.
    gate: Mutex<Option<Receiver<()>>>,
}

impl ScriptedJobRunner {
    fn new() -> Self {
        Self {
            outcomes: Mutex::new(VecDeque::new()),
            files: Mutex::new(HashMap::new()),
            sessions_opened: Mutex::new(0),
            fail_open_session: false,
            gate: Mutex::new(None),
        }
    }

    fn failing_sessions() -> Self {
        Self {
            fail_open_session: true,
            ..Self::new()
        }
    }

    fn push_outcome(&self, outcome: Result<RunOutcome, AssistantError>) {
        self.outcomes.lock().expect("lock").push_back(outcome);
    }

    fn gated(self) -> (Self, Sender<()>) {
        let (tx, rx) = channel();
        *self.gate.lock().expect("lock") = Some(rx);
        (self, tx)
    }

    fn sessions_opened(&self) -> u32 {
        *self.sessions_opened.lock().expect("lock")
    }
}

impl JobRunner for ScriptedJobRunner {
    fn open_session(&self, _filename: &str, _bytes: &[u8]) -> Result<SessionRefs, AssistantError> {
        if self.fail_open_session {
            return Err(AssistantError::ApiRequest(
                "assistant service unavailable".to_string(),
            ));
        }
        let mut count = self.sessions_opened.lock().expect("lock");
        *count += 1;
        Ok(SessionRefs {
            thread_ref: format!("thread-{count}"),
            assistant_ref: format!("asst-{count}"),
        })
    }

    fn submit_and_await(
        &self,
        _session: &SessionRefs,
        _instruction: &str,
    ) -> Result<RunOutcome, AssistantError> {
        if let Some(rx) = self.gate.lock().expect("lock").as_ref() {
            let _ = rx.recv_timeout(Duration::from_secs(5));
        }
        self.outcomes
            .lock()
            .expect("lock")
            .pop_front()
            .unwrap_or_else(|| {
                Err(AssistantError::ApiRequest(
                    "no scripted outcome".to_string(),
                ))
            })
    }

    fn fetch_file(&self, file_id: &str) -> Result<Vec<u8>, AssistantError> {
        self.files
            .lock()
            .expect("lock")
            .get(file_id)
            .cloned()
            .ok_or_else(|| AssistantError::ApiResponse(format!("unknown file `{file_id}`")))
    }
}

struct ScriptedEngine {
    results: Mutex<VecDeque<Result<RoutineOutcome, CodegenError>>>,
    calls: Mutex<u32>,
}

impl ScriptedEngine {
    fn new() -> Self {
        Self {
            results: Mutex::new(VecDeque::new()),
            calls: Mutex::new(0),
        }
    }

    fn push(&self, result: Result<RoutineOutcome, CodegenError>) {
        self.results.lock().expect("lock").push_back(result);
    }

    fn call_count(&self) -> u32 {
        *self.calls.lock().expect("lock")
    }
}

impl RoutineEngine for ScriptedEngine {
    fn synthesize_and_run(
        &self,
        _existing: Option<&str>,
        _instruction: &str,
        _call: &RoutineCall,
    ) -> Result<RoutineOutcome, CodegenError> {
        *self.calls.lock().expect("lock") += 1;
        self.results
            .lock()
            .expect("lock")
            .pop_front()
            .unwrap_or_else(|| {
                Err(CodegenError::ApiResponse(
                    "no scripted routine result".to_string(),
                ))
            })
    }
}

struct RefusingBlobStore;

impl BlobStore for RefusingBlobStore {
    fn put(&self, key: &str, _bytes: &[u8]) -> Result<(), BlobStoreError> {
        Err(BlobStoreError::Io {
            path: key.to_string(),
            source: std::io::Error::other("object storage is down"),
        })
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, BlobStoreError> {
        Err(BlobStoreError::NotFound(key.to_string()))
    }
}

struct Harness {
    _temp: tempfile::TempDir,
    service: WorkflowService,
    records: Arc<SqliteRecordStore>,
    jobs: Arc<ScriptedJobRunner>,
    engine: Arc<ScriptedEngine>,
}

fn harness_with(jobs: ScriptedJobRunner, graph_attempts: u32) -> Harness {
    let temp = tempfile::tempdir().expect("tempdir");
    let records =
        Arc::new(SqliteRecordStore::open(&temp.path().join("records.db")).expect("open store"));
    let blobs = Arc::new(FsBlobStore::new(temp.path().join("blobs")));
    let jobs = Arc::new(jobs);
    let engine = Arc::new(ScriptedEngine::new());
    let service = WorkflowService::new(
        records.clone(),
        blobs,
        jobs.clone(),
        engine.clone(),
        temp.path().join("state"),
        RetryPolicy::new(graph_attempts),
        1,
    );
    Harness {
        _temp: temp,
        service,
        records,
        jobs,
        engine,
    }
}

fn harness() -> Harness {
    harness_with(ScriptedJobRunner::new(), 5)
}

fn uploaded_record(h: &Harness) -> RecordId {
    let envelope = h.service.create();
    let id = RecordId::parse(envelope.data["id"].as_str().expect("id")).expect("valid id");
    let envelope = h.service.upload_file(&id, "sales.xlsx", b"rows");
    assert!(envelope.is_success());
    id
}

fn cleaned_record(h: &Harness) -> RecordId {
    let id = uploaded_record(h);
    h.jobs
        .files
        .lock()
        .expect("lock")
        .insert("file-csv".to_string(), b"a,b\n1,2\n".to_vec());
    h.jobs.push_outcome(Ok(RunOutcome {
        state: JobState::Completed,
        artifacts: vec![Artifact::File {
            file_id: "file-csv".to_string(),
        }],
        error_message: None,
    }));
    h.service.run_clean_phase(&id);
    id
}

fn ten_queries_json() -> String {
    let entries: Vec<_> = (0..10)
        .map(|i| json!({"question": format!("Q{i}?"), "solution": format!("S{i}.")}))
        .collect();
    serde_json::to_string(&entries).expect("json")
}

fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("condition not reached within deadline");
}

#[test]
fn missing_records_yield_not_found_envelopes() {
    let h = harness();
    let id = RecordId::parse("rec-none-0000").expect("id");

    for envelope in [
        h.service.check_status(&id),
        h.service.clean_file(&id),
        h.service.upload_file(&id, "x.xlsx", b"x"),
        h.service.generate_queries(&id),
        h.service.draw_graphs(&id),
        h.service.draw_insights(&id),
    ] {
        assert!(!envelope.is_success());
        assert_eq!(envelope.status_code, 404);
        assert_eq!(envelope.data, json!(false));
    }
}

#[test]
fn phases_refuse_to_run_before_their_preconditions() {
    let h = harness();
    let envelope = h.service.create();
    let id = RecordId::parse(envelope.data["id"].as_str().expect("id")).expect("valid id");

    // No upload yet: no session for the job-runner phases.
    assert_eq!(h.service.clean_file(&id).status_code, 400);
    assert_eq!(h.service.draw_insights(&id).status_code, 400);

    // No cleaned file yet: the synchronous phases refuse too.
    let id = uploaded_record(&h);
    assert_eq!(h.service.generate_queries(&id).status_code, 400);
    assert_eq!(h.service.draw_graphs(&id).status_code, 400);
}

#[test]
fn blob_failure_aborts_upload_before_any_session_is_created() {
    let temp = tempfile::tempdir().expect("tempdir");
    let records =
        Arc::new(SqliteRecordStore::open(&temp.path().join("records.db")).expect("open store"));
    let jobs = Arc::new(ScriptedJobRunner::new());
    let service = WorkflowService::new(
        records.clone(),
        Arc::new(RefusingBlobStore),
        jobs.clone(),
        Arc::new(ScriptedEngine::new()),
        temp.path().join("state"),
        RetryPolicy::new(5),
        1,
    );

    let id = RecordId::parse("rec-blob-0001").expect("id");
    records
        .create(WorkflowRecord::new(id.clone(), now_secs()))
        .expect("create");

    let envelope = service.upload_file(&id, "sales.xlsx", b"rows");
    assert!(!envelope.is_success());
    assert_eq!(envelope.status_code, 500);

    // The invariant held: no session was opened and nothing was recorded.
    assert_eq!(jobs.sessions_opened(), 0);
    let record = records.get(&id).expect("record");
    assert!(record.origin_file.is_none());
    assert!(record.thread_ref.is_none());
    assert!(record.assistant_ref.is_none());
}

#[test]
fn session_failure_leaves_the_record_without_partial_refs() {
    let h = harness_with(ScriptedJobRunner::failing_sessions(), 5);
    let envelope = h.service.create();
    let id = RecordId::parse(envelope.data["id"].as_str().expect("id")).expect("valid id");

    let envelope = h.service.upload_file(&id, "sales.xlsx", b"rows");
    assert!(!envelope.is_success());

    let record = h.records.get(&id).expect("record");
    assert!(record.origin_file.is_none());
    assert!(record.thread_ref.is_none());
    assert!(record.assistant_ref.is_none());
    assert_eq!(record.status.current, Phase::Started);
}

#[test]
fn failed_clean_is_recorded_not_raised() {
    let h = harness();
    let id = uploaded_record(&h);

    h.jobs.push_outcome(Ok(RunOutcome {
        state: JobState::Failed,
        artifacts: Vec::new(),
        error_message: Some("code interpreter crashed".to_string()),
    }));

    // The trigger still acknowledges success; the failure lands in status.
    let ack = h.service.clean_file(&id);
    assert!(ack.is_success());
    assert_eq!(ack.data, json!("started"));

    wait_until(|| {
        h.records
            .get(&id)
            .map(|r| r.status.cleaned.is_some())
            .unwrap_or(false)
    });
    let record = h.records.get(&id).expect("record");
    assert_eq!(record.cleaned_file.as_deref(), Some(""));
    assert_eq!(record.status.current, Phase::Cleaned);
    let payload = record.status.cleaned.as_ref().expect("payload");
    assert_eq!(payload.status, "failed");
    assert!(payload
        .message
        .iter()
        .any(|m| m.contains("code interpreter crashed")));
    assert!(payload.attachment.is_none());
}

#[test]
fn incomplete_clean_keeps_cleaned_file_empty() {
    let h = harness();
    let id = uploaded_record(&h);

    h.jobs.push_outcome(Ok(RunOutcome {
        state: JobState::Incomplete,
        artifacts: Vec::new(),
        error_message: Some("run polling timed out after 600s".to_string()),
    }));
    let ack = h.service.clean_file(&id);
    assert!(ack.is_success());

    wait_until(|| {
        h.records
            .get(&id)
            .map(|r| r.status.cleaned.is_some())
            .unwrap_or(false)
    });
    let record = h.records.get(&id).expect("record");
    assert_eq!(record.status.current, Phase::Cleaned);
    assert_eq!(record.cleaned_file.as_deref(), Some(""));
    assert_eq!(
        record.status.cleaned.as_ref().expect("payload").status,
        "incomplete"
    );
}

#[test]
fn re_cleaning_starts_from_an_empty_payload() {
    let (runner, release) = ScriptedJobRunner::new().gated();
    let h = harness_with(runner, 5);
    let id = uploaded_record(&h);

    // First run records a non-empty payload.
    h.jobs
        .files
        .lock()
        .expect("lock")
        .insert("file-csv".to_string(), b"a,b\n1,2\n".to_vec());
    h.jobs.push_outcome(Ok(RunOutcome {
        state: JobState::Completed,
        artifacts: vec![
            Artifact::Text {
                content: "All tidy now.".to_string(),
            },
            Artifact::File {
                file_id: "file-csv".to_string(),
            },
        ],
        error_message: None,
    }));
    h.service.clean_file(&id);
    release.send(()).expect("release first run");
    wait_until(|| {
        h.records
            .get(&id)
            .map(|r| r.status.cleaned.is_some())
            .unwrap_or(false)
    });
    let record = h.records.get(&id).expect("record");
    assert!(!record.status.cleaned.as_ref().expect("payload").message.is_empty());
    assert_eq!(record.cleaned_file.as_deref(), Some("file-csv.csv"));

    // Second invocation: while the job is still gated, the starting state
    // must already be reset to empty.
    h.jobs.push_outcome(Ok(RunOutcome {
        state: JobState::Completed,
        artifacts: Vec::new(),
        error_message: None,
    }));
    let ack = h.service.clean_file(&id);
    assert!(ack.is_success());

    let record = h.records.get(&id).expect("record");
    assert!(record.status.cleaned.is_none());
    assert_eq!(record.cleaned_file.as_deref(), Some(""));

    release.send(()).expect("release second run");
    wait_until(|| {
        h.records
            .get(&id)
            .map(|r| r.status.cleaned.is_some())
            .unwrap_or(false)
    });
}

#[test]
fn query_generation_commits_nothing_on_bad_routine_output() {
    let h = harness();
    let id = cleaned_record(&h);

    h.engine.push(Ok(RoutineOutcome {
        code: String::new(),
        output: "this is not json".to_string(),
        produced_file: None,
    }));
    let envelope = h.service.generate_queries(&id);
    assert!(!envelope.is_success());
    assert_eq!(envelope.status_code, 500);

    let record = h.records.get(&id).expect("record");
    assert!(record.queries.is_empty());
    assert!(record.header.is_none());
    assert_eq!(record.status.current, Phase::Cleaned);
}

#[test]
fn query_generation_rejects_a_short_list() {
    let h = harness();
    let id = cleaned_record(&h);

    h.engine.push(Ok(RoutineOutcome {
        code: String::new(),
        output: r#"[{"question": "Q?", "solution": "S."}]"#.to_string(),
        produced_file: None,
    }));
    let envelope = h.service.generate_queries(&id);
    assert!(!envelope.is_success());
    assert!(envelope.description.contains("expected 10"));

    let record = h.records.get(&id).expect("record");
    assert!(record.queries.is_empty());
}

#[test]
fn graph_attempts_retry_then_record_a_terminal_error() {
    let h = harness_with(ScriptedJobRunner::new(), 3);
    let id = cleaned_record(&h);

    h.engine.push(Ok(RoutineOutcome {
        code: String::new(),
        output: ten_queries_json(),
        produced_file: None,
    }));
    h.service.generate_queries(&id);
    let calls_before = h.engine.call_count();

    // All three attempts fail: the error is recorded on the entry.
    for _ in 0..3 {
        h.engine.push(Err(CodegenError::ExecutionFailed {
            exit_code: 1,
            stderr: "seaborn blew up".to_string(),
        }));
    }
    let envelope = h.service.draw_graphs(&id);
    assert!(envelope.is_success());
    assert_eq!(h.engine.call_count(), calls_before + 3);

    let record = h.records.get(&id).expect("record");
    assert!(record.queries[0].graph.is_none());
    let error = record.queries[0].graph_error.as_ref().expect("recorded error");
    assert!(error.contains("seaborn blew up"));

    // The entry stays eligible: a later invocation with a healthy engine
    // attaches the graph and clears the error.
    h.engine.push(Ok(RoutineOutcome {
        code: String::new(),
        output: "\"recovered.png\"".to_string(),
        produced_file: Some(("recovered.png".to_string(), b"png".to_vec())),
    }));
    let envelope = h.service.draw_graphs(&id);
    assert!(envelope.is_success());

    let record = h.records.get(&id).expect("record");
    assert_eq!(record.queries[0].graph.as_deref(), Some("recovered.png"));
    assert!(record.queries[0].graph_error.is_none());
}

#[test]
fn second_graph_attempt_can_succeed_within_one_invocation() {
    let h = harness();
    let id = cleaned_record(&h);

    h.engine.push(Ok(RoutineOutcome {
        code: String::new(),
        output: ten_queries_json(),
        produced_file: None,
    }));
    h.service.generate_queries(&id);
    let calls_before = h.engine.call_count();

    h.engine.push(Err(CodegenError::MissingCodeBlock));
    h.engine.push(Ok(RoutineOutcome {
        code: String::new(),
        output: "\"second-try.png\"".to_string(),
        produced_file: Some(("second-try.png".to_string(), b"png".to_vec())),
    }));
    let envelope = h.service.draw_graphs(&id);
    assert!(envelope.is_success());
    assert_eq!(h.engine.call_count(), calls_before + 2);

    let record = h.records.get(&id).expect("record");
    assert_eq!(record.queries[0].graph.as_deref(), Some("second-try.png"));
}

#[test]
fn failed_insights_run_is_recorded_in_status() {
    let h = harness();
    let id = uploaded_record(&h);

    h.jobs.push_outcome(Err(AssistantError::ApiRequest(
        "connection reset".to_string(),
    )));
    let ack = h.service.draw_insights(&id);
    assert!(ack.is_success());
    assert_eq!(ack.data, json!("started"));

    wait_until(|| {
        h.records
            .get(&id)
            .map(|r| r.status.insights_status.is_some())
            .unwrap_or(false)
    });
    let record = h.records.get(&id).expect("record");
    assert_eq!(record.status.current, Phase::InsightsReady);
    assert_eq!(record.status.insights_status.as_deref(), Some("failed"));
    assert_eq!(record.status.insights.as_ref().expect("images").len(), 0);
    assert!(record
        .status
        .message
        .as_ref()
        .expect("message")
        .iter()
        .any(|m| m.contains("connection reset")));
}

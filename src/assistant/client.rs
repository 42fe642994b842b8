use super::messages::{terminal_outcome, MessageListData};
use super::{collect_artifacts, AssistantError, JobRunner, JobState, RunOutcome, SessionRefs};
use crate::config::{ConfigError, Settings};
use serde::Deserialize;
use serde_json::json;
use std::io::Read;
use std::time::{Duration, Instant};

/// Standing instructions for the assistant bound to each uploaded dataset.
const OPERATOR_INSTRUCTIONS: &str = "You are an AI assistant with access to tools to complete \
the task. Apply a ReAct and tree-of-thoughts approach to complete the given task.";

/// Per-run guidance attached to every run submission.
const RUN_GUIDANCE: &str = "Answer in simple English with an example.";

#[derive(Debug, Clone, Deserialize)]
struct CreatedObject {
    id: String,
}

#[derive(Debug, Clone, Deserialize)]
struct RunData {
    status: String,
    #[serde(default)]
    last_error: Option<RunError>,
}

#[derive(Debug, Clone, Deserialize)]
struct RunError {
    message: String,
}

/// HTTP client for the assistants API: file upload, session creation, run
/// submission and polling, artifact download.
#[derive(Debug, Clone)]
pub struct AssistantClient {
    api_base: String,
    api_key: String,
    assistant_model: String,
    temperature: f64,
    poll_interval: Duration,
    run_timeout: Duration,
}

impl AssistantClient {
    pub fn new(
        api_base: impl Into<String>,
        api_key: impl Into<String>,
        assistant_model: impl Into<String>,
        temperature: f64,
        poll_interval: Duration,
        run_timeout: Duration,
    ) -> Self {
        Self {
            api_base: api_base.into(),
            api_key: api_key.into(),
            assistant_model: assistant_model.into(),
            temperature,
            poll_interval,
            run_timeout,
        }
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, ConfigError> {
        Ok(Self::new(
            settings.api_base.clone(),
            settings.resolve_api_key()?,
            settings.assistant_model.clone(),
            settings.assistant_temperature,
            Duration::from_millis(settings.poll_interval_ms),
            Duration::from_secs(settings.run_timeout_secs),
        ))
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.api_base.trim_end_matches('/'), path)
    }

    fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, AssistantError> {
        let mut url = self.endpoint(path);
        if !query.is_empty() {
            let encoded = query
                .iter()
                .map(|(k, v)| format!("{k}={}", urlencoding::encode(v)))
                .collect::<Vec<_>>()
                .join("&");
            url = format!("{url}?{encoded}");
        }

        let response = ureq::get(&url)
            .set("Authorization", &format!("Bearer {}", self.api_key))
            .set("OpenAI-Beta", "assistants=v2")
            .call()
            .map_err(|e| AssistantError::ApiRequest(e.to_string()))?;

        response
            .into_json::<T>()
            .map_err(|e| AssistantError::ApiRequest(e.to_string()))
    }

    fn post_json<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<T, AssistantError> {
        let url = self.endpoint(path);
        let response = ureq::post(&url)
            .set("Authorization", &format!("Bearer {}", self.api_key))
            .set("OpenAI-Beta", "assistants=v2")
            .send_json(body.clone())
            .map_err(|e| AssistantError::ApiRequest(e.to_string()))?;

        response
            .into_json::<T>()
            .map_err(|e| AssistantError::ApiRequest(e.to_string()))
    }

    fn upload_file(&self, filename: &str, bytes: &[u8]) -> Result<String, AssistantError> {
        let boundary = form_boundary()?;
        let body = multipart_form(&boundary, filename, bytes);
        let url = self.endpoint("files");

        let response = ureq::post(&url)
            .set("Authorization", &format!("Bearer {}", self.api_key))
            .set(
                "Content-Type",
                &format!("multipart/form-data; boundary={boundary}"),
            )
            .send_bytes(&body)
            .map_err(|e| AssistantError::ApiRequest(e.to_string()))?;

        let created: CreatedObject = response
            .into_json()
            .map_err(|e| AssistantError::ApiRequest(e.to_string()))?;
        Ok(created.id)
    }

    fn create_assistant(&self, file_id: &str) -> Result<String, AssistantError> {
        let created: CreatedObject = self.post_json(
            "assistants",
            &json!({
                "model": self.assistant_model,
                "temperature": self.temperature,
                "instructions": OPERATOR_INSTRUCTIONS,
                "tools": [{"type": "code_interpreter"}],
                "tool_resources": {
                    "code_interpreter": {"file_ids": [file_id]}
                },
            }),
        )?;
        Ok(created.id)
    }

    fn create_thread(&self) -> Result<String, AssistantError> {
        let created: CreatedObject = self.post_json("threads", &json!({}))?;
        Ok(created.id)
    }

    fn post_user_message(
        &self,
        thread_ref: &str,
        instruction: &str,
    ) -> Result<(), AssistantError> {
        let _: CreatedObject = self.post_json(
            &format!("threads/{thread_ref}/messages"),
            &json!({
                "role": "user",
                "content": [{"type": "text", "text": instruction}],
            }),
        )?;
        Ok(())
    }

    fn create_run(&self, session: &SessionRefs) -> Result<String, AssistantError> {
        let created: CreatedObject = self.post_json(
            &format!("threads/{}/runs", session.thread_ref),
            &json!({
                "assistant_id": session.assistant_ref,
                "instructions": RUN_GUIDANCE,
            }),
        )?;
        Ok(created.id)
    }

    fn get_run(&self, thread_ref: &str, run_id: &str) -> Result<RunData, AssistantError> {
        self.get_json(&format!("threads/{thread_ref}/runs/{run_id}"), &[])
    }

    fn list_messages(&self, thread_ref: &str) -> Result<MessageListData, AssistantError> {
        self.get_json(
            &format!("threads/{thread_ref}/messages"),
            &[("limit", "100".to_string()), ("order", "desc".to_string())],
        )
    }

    fn await_terminal(
        &self,
        thread_ref: &str,
        run_id: &str,
    ) -> Result<(JobState, Option<String>), AssistantError> {
        let deadline = Instant::now() + self.run_timeout;
        loop {
            let run = self.get_run(thread_ref, run_id)?;
            let last_error = run.last_error.map(|e| e.message);
            if let Some(terminal) = terminal_outcome(&run.status, last_error) {
                return Ok(terminal);
            }
            if Instant::now() >= deadline {
                return Ok((
                    JobState::Incomplete,
                    Some(format!(
                        "run polling timed out after {}s",
                        self.run_timeout.as_secs()
                    )),
                ));
            }
            std::thread::sleep(self.poll_interval);
        }
    }
}

impl JobRunner for AssistantClient {
    fn open_session(&self, filename: &str, bytes: &[u8]) -> Result<SessionRefs, AssistantError> {
        let file_id = self.upload_file(filename, bytes)?;
        let assistant_ref = self.create_assistant(&file_id)?;
        let thread_ref = self.create_thread()?;
        Ok(SessionRefs {
            thread_ref,
            assistant_ref,
        })
    }

    fn submit_and_await(
        &self,
        session: &SessionRefs,
        instruction: &str,
    ) -> Result<RunOutcome, AssistantError> {
        self.post_user_message(&session.thread_ref, instruction)?;
        let run_id = self.create_run(session)?;
        let (state, error_message) = self.await_terminal(&session.thread_ref, &run_id)?;

        let artifacts = if state == JobState::Completed {
            let listing = self.list_messages(&session.thread_ref)?;
            collect_artifacts(&listing.data)
        } else {
            Vec::new()
        };

        Ok(RunOutcome {
            state,
            artifacts,
            error_message,
        })
    }

    fn fetch_file(&self, file_id: &str) -> Result<Vec<u8>, AssistantError> {
        let url = self.endpoint(&format!("files/{file_id}/content"));
        let response = ureq::get(&url)
            .set("Authorization", &format!("Bearer {}", self.api_key))
            .call()
            .map_err(|e| AssistantError::ApiRequest(e.to_string()))?;

        let mut bytes = Vec::new();
        response
            .into_reader()
            .read_to_end(&mut bytes)
            .map_err(|e| AssistantError::ApiRequest(e.to_string()))?;
        Ok(bytes)
    }
}

fn form_boundary() -> Result<String, AssistantError> {
    let mut raw = [0_u8; 16];
    getrandom::getrandom(&mut raw)
        .map_err(|e| AssistantError::ApiRequest(format!("boundary randomness unavailable: {e}")))?;
    let hex: String = raw.iter().map(|b| format!("{b:02x}")).collect();
    Ok(format!("datasight-{hex}"))
}

/// Builds a two-part form body: the `purpose=assistants` field and the file
/// itself.
pub(crate) fn multipart_form(boundary: &str, filename: &str, bytes: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    body.extend_from_slice(b"Content-Disposition: form-data; name=\"purpose\"\r\n\r\n");
    body.extend_from_slice(b"assistants\r\n");
    body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    body.extend_from_slice(
        format!("Content-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\n")
            .as_bytes(),
    );
    body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multipart_form_carries_purpose_file_and_terminator() {
        let body = multipart_form("bnd", "sales report.xlsx", b"cells");
        let text = String::from_utf8_lossy(&body);
        assert!(text.starts_with("--bnd\r\n"));
        assert!(text.contains("name=\"purpose\"\r\n\r\nassistants"));
        assert!(text.contains("filename=\"sales report.xlsx\""));
        assert!(text.contains("cells"));
        assert!(text.ends_with("--bnd--\r\n"));
    }

    #[test]
    fn boundaries_are_unique_per_upload() {
        let a = form_boundary().expect("boundary");
        let b = form_boundary().expect("boundary");
        assert_ne!(a, b);
        assert!(a.starts_with("datasight-"));
    }

    #[test]
    fn endpoints_tolerate_trailing_slash_in_api_base() {
        let client = AssistantClient::new(
            "https://api.example.test/v1/",
            "sk-test",
            "gpt-4o",
            0.7,
            Duration::from_millis(10),
            Duration::from_secs(1),
        );
        assert_eq!(
            client.endpoint("threads"),
            "https://api.example.test/v1/threads"
        );
    }
}

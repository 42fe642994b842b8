use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    Success,
    Error,
}

/// Uniform response shape for every workflow operation. Asynchronous phases
/// acknowledge with a success envelope; their real outcome is only visible
/// through the status check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiEnvelope {
    pub status_code: u16,
    pub response_type: ResponseType,
    pub description: String,
    pub data: Value,
}

impl ApiEnvelope {
    pub fn success(description: impl Into<String>, data: Value) -> Self {
        Self {
            status_code: 200,
            response_type: ResponseType::Success,
            description: description.into(),
            data,
        }
    }

    pub fn error(status_code: u16, description: impl Into<String>) -> Self {
        Self {
            status_code,
            response_type: ResponseType::Error,
            description: description.into(),
            data: Value::Bool(false),
        }
    }

    pub fn is_success(&self) -> bool {
        self.response_type == ResponseType::Success
    }
}

use super::CodegenError;
use crate::config::{ConfigError, Settings};
use serde::Deserialize;
use serde_json::json;

/// Chat-completion backend used for routine synthesis.
pub trait ChatBackend: Send + Sync {
    fn complete(&self, system: &str, user: &str) -> Result<String, CodegenError>;
}

#[derive(Debug, Clone, Deserialize)]
struct ChatCompletionData {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ChatHttpClient {
    api_base: String,
    api_key: String,
    model: String,
    max_tokens: u32,
}

impl ChatHttpClient {
    pub fn new(
        api_base: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        max_tokens: u32,
    ) -> Self {
        Self {
            api_base: api_base.into(),
            api_key: api_key.into(),
            model: model.into(),
            max_tokens,
        }
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, ConfigError> {
        Ok(Self::new(
            settings.api_base.clone(),
            settings.resolve_api_key()?,
            settings.codegen_model.clone(),
            settings.codegen_max_tokens,
        ))
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.api_base.trim_end_matches('/'))
    }
}

impl ChatBackend for ChatHttpClient {
    fn complete(&self, system: &str, user: &str) -> Result<String, CodegenError> {
        let body = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
        });

        let response = ureq::post(&self.endpoint())
            .set("Authorization", &format!("Bearer {}", self.api_key))
            .send_json(body)
            .map_err(|e| CodegenError::ApiRequest(e.to_string()))?;

        let completion: ChatCompletionData = response
            .into_json()
            .map_err(|e| CodegenError::ApiRequest(e.to_string()))?;

        completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| {
                CodegenError::ApiResponse("completion carried no message content".to_string())
            })
    }
}

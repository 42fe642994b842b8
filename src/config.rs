use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read settings file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid yaml in {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("settings validation failed: {0}")]
    Validation(String),
    #[error("missing required env var `{0}`")]
    MissingEnvVar(String),
}

pub const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";
pub const API_KEY_ENV_VAR: &str = "DATASIGHT_API_KEY";
pub const API_KEY_FALLBACK_ENV_VAR: &str = "OPENAI_API_KEY";

fn default_api_base() -> String {
    DEFAULT_API_BASE.to_string()
}

fn default_assistant_model() -> String {
    "gpt-4o".to_string()
}

fn default_codegen_model() -> String {
    "gpt-4".to_string()
}

fn default_assistant_temperature() -> f64 {
    0.7
}

fn default_codegen_max_tokens() -> u32 {
    1200
}

fn default_python_binary() -> String {
    "python3".to_string()
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_run_timeout_secs() -> u64 {
    600
}

fn default_sandbox_timeout_secs() -> u64 {
    120
}

fn default_graph_max_attempts() -> u32 {
    5
}

fn default_graphs_per_invocation() -> usize {
    1
}

/// Service settings, read from a YAML file. The API key may live in the file
/// or in `DATASIGHT_API_KEY` / `OPENAI_API_KEY`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Settings {
    /// Root directory for logs, the record database, blobs and sandbox
    /// scratch space.
    pub state_root: PathBuf,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_assistant_model")]
    pub assistant_model: String,
    #[serde(default = "default_codegen_model")]
    pub codegen_model: String,
    #[serde(default = "default_assistant_temperature")]
    pub assistant_temperature: f64,
    #[serde(default = "default_codegen_max_tokens")]
    pub codegen_max_tokens: u32,
    #[serde(default = "default_python_binary")]
    pub python_binary: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,
    #[serde(default = "default_sandbox_timeout_secs")]
    pub sandbox_timeout_secs: u64,
    /// Attempt budget per query in the graph phase.
    #[serde(default = "default_graph_max_attempts")]
    pub graph_max_attempts: u32,
    /// Eligible queries processed per draw-graphs invocation. The default
    /// keeps the one-query-per-call contract; raising it covers more of the
    /// list in a single call.
    #[serde(default = "default_graphs_per_invocation")]
    pub graphs_per_invocation: usize,
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let settings: Settings =
            serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.state_root.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "state_root must be non-empty".to_string(),
            ));
        }
        if self.api_base.trim().is_empty() {
            return Err(ConfigError::Validation(
                "api_base must be non-empty".to_string(),
            ));
        }
        if self.python_binary.trim().is_empty() {
            return Err(ConfigError::Validation(
                "python_binary must be non-empty".to_string(),
            ));
        }
        if !(0.0..=2.0).contains(&self.assistant_temperature) {
            return Err(ConfigError::Validation(format!(
                "assistant_temperature {} is outside 0.0..=2.0",
                self.assistant_temperature
            )));
        }
        if self.graph_max_attempts == 0 {
            return Err(ConfigError::Validation(
                "graph_max_attempts must be at least 1".to_string(),
            ));
        }
        if self.graphs_per_invocation == 0 {
            return Err(ConfigError::Validation(
                "graphs_per_invocation must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// The API key from settings, falling back to the environment.
    pub fn resolve_api_key(&self) -> Result<String, ConfigError> {
        if let Some(key) = self.api_key.as_ref().filter(|v| !v.trim().is_empty()) {
            return Ok(key.clone());
        }
        env_var_fallback(API_KEY_ENV_VAR, API_KEY_FALLBACK_ENV_VAR)
            .ok_or_else(|| ConfigError::MissingEnvVar(API_KEY_ENV_VAR.to_string()))
    }

    pub fn blob_root(&self) -> PathBuf {
        self.state_root.join("blobs")
    }

    pub fn record_db_path(&self) -> PathBuf {
        self.state_root.join("records.db")
    }

    pub fn scratch_root(&self) -> PathBuf {
        self.state_root.join("scratch")
    }
}

fn env_var_fallback(primary: &str, fallback: &str) -> Option<String> {
    std::env::var(primary)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .or_else(|| {
            std::env::var(fallback)
                .ok()
                .filter(|v| !v.trim().is_empty())
        })
}

pub mod chat;
pub mod extract;
pub mod sandbox;

pub use chat::{ChatBackend, ChatHttpClient};
pub use extract::extract_code;
pub use sandbox::{RoutineCall, RoutineSandbox, SandboxRun};

use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum CodegenError {
    #[error("chat completion request failed: {0}")]
    ApiRequest(String),
    #[error("chat completion responded with error: {0}")]
    ApiResponse(String),
    #[error("model response contained no delimited code block")]
    MissingCodeBlock,
    #[error("python binary `{binary}` is not available")]
    MissingInterpreter { binary: String },
    #[error("synthesized routine failed with exit code {exit_code}: {stderr}")]
    ExecutionFailed { exit_code: i32, stderr: String },
    #[error("synthesized routine timed out after {timeout_ms}ms")]
    ExecutionTimeout { timeout_ms: u64 },
    #[error("synthesized routine reported `{name}` but produced no such file")]
    MissingArtifact { name: String },
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

const GENERATOR_SYSTEM_PROMPT: &str = "You are a Python code generator familiar with pandas. \
Respond to every question with Python code. Wrap your code in ``` delimiters. Import any \
Python modules you need. Do not provide elaborations.";

fn updater_system_prompt(code: &str) -> String {
    format!(
        "You are a Python code updater familiar with pandas. You have been given the following \
Python method: {code}. Update it based on the user content, but do not change the method name. \
Return the updated code wrapped in ``` delimiters. Do not provide elaborations."
    )
}

/// Result of one generate-and-execute cycle. `output` is the routine's
/// stdout; `produced_file` carries the bytes of a file the routine reported
/// writing, when one exists in its scratch directory.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutineOutcome {
    pub code: String,
    pub output: String,
    pub produced_file: Option<(String, Vec<u8>)>,
}

/// Seam between the workflow core and code synthesis/execution, so the
/// synchronous phases can be exercised without a chat backend or an
/// interpreter.
pub trait RoutineEngine: Send + Sync {
    fn synthesize_and_run(
        &self,
        existing: Option<&str>,
        instruction: &str,
        call: &RoutineCall,
    ) -> Result<RoutineOutcome, CodegenError>;
}

/// The production engine: chat completion, code block extraction, sandboxed
/// execution. Each cycle runs in its own disposable scratch directory;
/// nothing is shared between cycles.
pub struct CodeGenHelper {
    chat: Arc<dyn ChatBackend>,
    sandbox: RoutineSandbox,
}

impl CodeGenHelper {
    pub fn new(chat: Arc<dyn ChatBackend>, sandbox: RoutineSandbox) -> Self {
        Self { chat, sandbox }
    }

    /// Asks the chat model for a routine and extracts the delimited code
    /// block. With `existing`, the model is asked to update that routine
    /// while keeping its entry-point name.
    pub fn synthesize(
        &self,
        existing: Option<&str>,
        instruction: &str,
    ) -> Result<String, CodegenError> {
        let response = match existing {
            None => self.chat.complete(GENERATOR_SYSTEM_PROMPT, instruction)?,
            Some(code) => self
                .chat
                .complete(&updater_system_prompt(code), instruction)?,
        };
        extract_code(&response)
    }
}

impl RoutineEngine for CodeGenHelper {
    fn synthesize_and_run(
        &self,
        existing: Option<&str>,
        instruction: &str,
        call: &RoutineCall,
    ) -> Result<RoutineOutcome, CodegenError> {
        let code = self.synthesize(existing, instruction)?;
        let run = self.sandbox.execute(&code, call)?;
        Ok(RoutineOutcome {
            code,
            output: run.output,
            produced_file: run.produced_file,
        })
    }
}

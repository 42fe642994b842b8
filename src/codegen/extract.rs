use super::CodegenError;
use regex::Regex;

/// Pulls the routine out of a model response. The response is expected to
/// carry exactly one fenced code block; the first one wins, and a language
/// tag on the opening fence is dropped.
pub fn extract_code(response: &str) -> Result<String, CodegenError> {
    let pattern = Regex::new(r"(?s)```([A-Za-z0-9_+-]*)[ \t]*\r?\n?(.*?)```")
        .expect("code fence pattern is valid");

    let captures = pattern
        .captures(response)
        .ok_or(CodegenError::MissingCodeBlock)?;
    let body = captures.get(2).map(|m| m.as_str()).unwrap_or_default();
    let code = body.trim_matches('\n').trim_end().to_string();
    if code.trim().is_empty() {
        return Err(CodegenError::MissingCodeBlock);
    }
    Ok(code)
}

//! Result framing for external process output.
//!
//! The external process may print any number of log lines to stdout. The **last non-empty line**
//! is the result: a JSON object carrying a boolean `success` field. Lines before it are logs;
//! those that are JSON objects with `"type": "progress"` are surfaced as [`ProgressEvent`]s.

use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("process produced no output on stdout")]
    Empty,
    #[error("final stdout line is not valid JSON: {0}")]
    NotJson(#[source] serde_json::Error),
    #[error("final stdout line is JSON but not an object")]
    NotAnObject,
    #[error("result object has no boolean `success` field")]
    MissingSuccess,
}

/// The JSON object a process reports as its outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptResult {
    pub success: bool,
    /// Full object as printed, for pass-through responses
    pub body: Map<String, Value>,
}

impl ScriptResult {
    fn str_field(&self, key: &str) -> Option<&str> {
        self.body.get(key).and_then(Value::as_str).filter(|s| !s.trim().is_empty())
    }

    pub fn message(&self) -> Option<&str> {
        self.str_field("message")
    }

    pub fn error(&self) -> Option<&str> {
        self.str_field("error")
    }

    /// Best human-readable explanation of a failure: `message`, then `error`.
    pub fn reason(&self) -> Option<&str> {
        self.message().or_else(|| self.error())
    }

    /// `details` rendered as text; structured values are serialized back to JSON.
    pub fn details(&self) -> Option<String> {
        match self.body.get("details")? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}

/// Structured progress line emitted while a conversion runs.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProgressEvent {
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Deserialize)]
struct Tagged {
    #[serde(rename = "type")]
    kind: String,
    #[serde(flatten)]
    event: ProgressEvent,
}

/// Recognise a `{"type": "progress", ...}` log line.
pub fn parse_progress(line: &str) -> Option<ProgressEvent> {
    let line = line.trim();
    if !line.starts_with('{') {
        return None;
    }
    let tagged: Tagged = serde_json::from_str(line).ok()?;
    (tagged.kind == "progress").then_some(tagged.event)
}

/// Extract the result object from the final non-empty stdout line.
pub fn extract_result(stdout: &str) -> Result<ScriptResult, OutputError> {
    let last = stdout
        .lines()
        .map(str::trim)
        .rfind(|line| !line.is_empty())
        .ok_or(OutputError::Empty)?;

    let value: Value = serde_json::from_str(last).map_err(OutputError::NotJson)?;
    let Value::Object(body) = value else {
        return Err(OutputError::NotAnObject);
    };
    let success = body.get("success").and_then(Value::as_bool).ok_or(OutputError::MissingSuccess)?;

    Ok(ScriptResult { success, body })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_after_log_lines() {
        let stdout = "Testing connection...\n\
                      Connection test successful: ok\n\
                      {\"type\":\"progress\",\"stage\":\"processing\",\"progress\":40}\n\
                      {\"success\": true, \"outputs\": {\"glb\": \"x.glb\"}}\n\n";

        let result = extract_result(stdout).unwrap();
        assert!(result.success);
        assert!(result.body.contains_key("outputs"));
    }

    #[test]
    fn test_result_without_trailing_newline() {
        let result = extract_result("log\n{\"success\":false,\"message\":\"too small\"}").unwrap();
        assert!(!result.success);
        assert_eq!(result.reason(), Some("too small"));
    }

    #[test]
    fn test_only_last_line_counts() {
        // A result object that is followed by a log line is not the result
        let stdout = "{\"success\": true}\nConversion complete!\n";
        assert!(matches!(extract_result(stdout), Err(OutputError::NotJson(_))));
    }

    #[test]
    fn test_missing_or_malformed_result() {
        assert!(matches!(extract_result(""), Err(OutputError::Empty)));
        assert!(matches!(extract_result("\n  \n"), Err(OutputError::Empty)));
        assert!(matches!(extract_result("[1, 2]"), Err(OutputError::NotAnObject)));
        assert!(matches!(extract_result("{\"outputs\": {}}"), Err(OutputError::MissingSuccess)));
        assert!(matches!(extract_result("{\"success\": \"yes\"}"), Err(OutputError::MissingSuccess)));
        assert!(matches!(
            extract_result("{\"type\":\"progress\",\"progress\":100}"),
            Err(OutputError::MissingSuccess)
        ));
    }

    #[test]
    fn test_reason_and_details() {
        let result = extract_result(r#"{"success": false, "error": "bad format", "details": {"format": "GIF"}}"#).unwrap();
        assert_eq!(result.message(), None);
        assert_eq!(result.reason(), Some("bad format"));
        assert_eq!(result.details().as_deref(), Some(r#"{"format":"GIF"}"#));

        let result = extract_result(r#"{"success": false, "message": "", "error": "boom", "details": null}"#).unwrap();
        assert_eq!(result.reason(), Some("boom"));
        assert_eq!(result.details(), None);
    }

    #[test]
    fn test_parse_progress() {
        let event = parse_progress(r#"{"type": "progress", "stage": "processing", "progress": 55, "message": "Converting: 55%"}"#).unwrap();
        assert_eq!(event.stage.as_deref(), Some("processing"));
        assert_eq!(event.progress, Some(55.0));

        assert!(parse_progress(r#"{"type": "log", "message": "hi"}"#).is_none());
        assert!(parse_progress(r#"{"success": true}"#).is_none());
        assert!(parse_progress("Status: processing").is_none());
    }
}

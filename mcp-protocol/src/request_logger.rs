//! Structured request logging middleware for the tool HTTP surface.
//!
//! Every `/tools/*` request gets one line with the tool, action, outcome
//! status, duration and a truncated parameter summary. The middleware
//! wraps the whole handler, so rejected and unauthenticated calls are
//! logged with their status too. Sensitive parameters are redacted before
//! anything reaches the log.

use axum::{
    body::Body,
    extract::Request,
    middleware::Next,
    response::Response,
};
use serde_json::Value;
use std::time::Instant;
use tracing::{info, warn};

/// Maximum length for parameter values before truncation
const MAX_PARAM_LENGTH: usize = 30;

/// Truncation suffix for long parameters
const TRUNCATION_SUFFIX: &str = "...";

/// Upper bound on how much request body the logger will buffer.
const MAX_LOGGED_BODY: usize = 1024 * 1024;

/// Tool request logging middleware.
///
/// Emits lines shaped like:
/// `manage_task.create [200] [12 ms] title="Implement login", branch_id="1f0e..."`
pub async fn request_logging_middleware(request: Request, next: Next) -> Response {
    let start_time = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    // Only tool calls carry a body worth summarising.
    if !path.starts_with("/tools/") {
        return next.run(request).await;
    }
    let tool = path.trim_start_matches("/tools/").to_string();

    let (parts, body) = request.into_parts();
    let body_bytes = match axum::body::to_bytes(body, MAX_LOGGED_BODY).await {
        Ok(bytes) => bytes,
        Err(err) => {
            // The body could not be buffered; let the handler see an empty
            // one and still record the request.
            let response = next.run(Request::from_parts(parts, Body::empty())).await;
            warn!(
                %method,
                %path,
                status = response.status().as_u16(),
                duration_ms = start_time.elapsed().as_millis() as u64,
                error = %err,
                "Tool request body unreadable"
            );
            return response;
        }
    };

    let (action, params_summary) = match serde_json::from_slice::<Value>(&body_bytes) {
        Ok(json) => {
            let action = json
                .get("action")
                .and_then(|a| a.as_str())
                .unwrap_or("unknown")
                .to_string();
            (action, format_params_summary(&json))
        }
        Err(_) => ("invalid_json".to_string(), String::new()),
    };

    // Hand the handler back an identical request.
    let request = Request::from_parts(parts, Body::from(body_bytes));
    let response = next.run(request).await;

    info!(
        operation = %format!("{tool}.{action}"),
        status = response.status().as_u16(),
        duration_ms = start_time.elapsed().as_millis() as u64,
        params = %params_summary,
        "Tool request"
    );

    response
}

/// Format request parameters into a summary string with truncation. The
/// `action` key is the operation itself and is skipped.
fn format_params_summary(body: &Value) -> String {
    match body {
        Value::Object(map) => {
            let formatted_params: Vec<String> = map
                .iter()
                .filter(|(key, _)| key.as_str() != "action")
                .map(|(key, value)| {
                    if is_sensitive_parameter(key) {
                        format!("{key}=\"[REDACTED]\"")
                    } else {
                        format!("{key}=\"{}\"", format_parameter_value(value))
                    }
                })
                .collect();

            formatted_params.join(", ")
        }
        Value::Array(arr) => format!("[{} items]", arr.len()),
        _ => format_parameter_value(body),
    }
}

/// Format a single parameter value with truncation
fn format_parameter_value(value: &Value) -> String {
    let value_str = match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Array(arr) => format!("[{} items]", arr.len()),
        Value::Object(obj) => format!("{{...{} fields}}", obj.len()),
        Value::Null => "null".to_string(),
    };

    truncate_string(&value_str, MAX_PARAM_LENGTH)
}

/// Truncate string to max length with suffix
fn truncate_string(input: &str, max_length: usize) -> String {
    if input.len() <= max_length {
        input.to_string()
    } else {
        let truncated_length = max_length.saturating_sub(TRUNCATION_SUFFIX.len());
        format!("{}{}", &input[..truncated_length], TRUNCATION_SUFFIX)
    }
}

/// Check if parameter should be redacted for security
fn is_sensitive_parameter(key: &str) -> bool {
    let sensitive_keys = [
        "password",
        "token",
        "secret",
        "key",
        "auth",
        "authorization",
        "credential",
        "api_key",
        "access_token",
        "refresh_token",
    ];

    let key_lower = key.to_lowercase();
    sensitive_keys
        .iter()
        .any(|&sensitive| key_lower.contains(sensitive))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_truncate_string() {
        assert_eq!(truncate_string("short", 10), "short");
        assert_eq!(truncate_string("this is a very long string", 10), "this is...");
        assert_eq!(truncate_string("exactly10c", 10), "exactly10c");
    }

    #[test]
    fn test_format_parameter_value() {
        assert_eq!(format_parameter_value(&json!("test")), "test");
        assert_eq!(format_parameter_value(&json!(42)), "42");
        assert_eq!(format_parameter_value(&json!(true)), "true");
        assert_eq!(format_parameter_value(&json!(null)), "null");
        assert_eq!(format_parameter_value(&json!(["a", "b", "c"])), "[3 items]");
        assert_eq!(
            format_parameter_value(&json!({"a": 1, "b": 2})),
            "{...2 fields}"
        );
    }

    #[test]
    fn test_format_params_summary_skips_action() {
        let body = json!({
            "action": "create",
            "title": "This is a very long task title that should be truncated",
            "branch_id": "b-1",
            "count": 42,
        });

        let summary = format_params_summary(&body);
        assert!(!summary.contains("action="));
        assert!(summary.contains("branch_id=\"b-1\""));
        assert!(summary.contains("title=\"This is a very long task ti...\""));
        assert!(summary.contains("count=\"42\""));
    }

    #[test]
    fn test_sensitive_parameter_redaction() {
        let body = json!({
            "action": "validate",
            "name": "ci",
            "token": "raw-bearer-value",
            "api_key": "sensitive",
        });

        let summary = format_params_summary(&body);
        assert!(summary.contains("name=\"ci\""));
        assert!(summary.contains("token=\"[REDACTED]\""));
        assert!(summary.contains("api_key=\"[REDACTED]\""));
        assert!(!summary.contains("raw-bearer-value"));
    }

    #[test]
    fn test_is_sensitive_parameter() {
        assert!(is_sensitive_parameter("password"));
        assert!(is_sensitive_parameter("api_key"));
        assert!(is_sensitive_parameter("access_token"));
        assert!(is_sensitive_parameter("AUTH_TOKEN"));
        assert!(!is_sensitive_parameter("username"));
        assert!(!is_sensitive_parameter("title"));
        assert!(!is_sensitive_parameter("description"));
    }
}

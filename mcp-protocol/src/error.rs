//! HTTP mapping for the stable error codes.

use axum::http::StatusCode;
use taskloom_core::ErrorCode;

/// The HTTP status carried alongside a failure envelope.
pub fn http_status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::MissingField | ErrorCode::ValidationError | ErrorCode::UnknownAction => {
            StatusCode::BAD_REQUEST
        }
        ErrorCode::AuthRequired | ErrorCode::InvalidToken => StatusCode::UNAUTHORIZED,
        ErrorCode::PermissionDenied | ErrorCode::CrossTenantWrite => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::DuplicateName | ErrorCode::ConcurrentModification => StatusCode::CONFLICT,
        ErrorCode::DependenciesUnsatisfied => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorCode::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
        ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Status for an already-built envelope: 200 on success, otherwise mapped
/// from the embedded code.
pub fn http_status_for_envelope(envelope: &serde_json::Value) -> StatusCode {
    if envelope
        .get("success")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false)
    {
        return StatusCode::OK;
    }
    envelope
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(serde_json::Value::as_str)
        .and_then(|code| serde_json::from_value::<ErrorCode>(serde_json::json!(code)).ok())
        .map(http_status_for)
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use taskloom_core::{protocol, TaskError};

    #[test]
    fn test_code_mapping() {
        assert_eq!(http_status_for(ErrorCode::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(
            http_status_for(ErrorCode::RateLimitExceeded),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            http_status_for(ErrorCode::AuthRequired),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            http_status_for(ErrorCode::ConcurrentModification),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn test_envelope_mapping() {
        let ok = protocol::success(json!({}));
        assert_eq!(http_status_for_envelope(&ok), StatusCode::OK);

        let not_found = protocol::failure("manage_task.get", &TaskError::not_found("Task", "x"));
        assert_eq!(http_status_for_envelope(&not_found), StatusCode::NOT_FOUND);

        let garbage = json!({"success": false});
        assert_eq!(
            http_status_for_envelope(&garbage),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}

use crate::models::TaskStatus;
use thiserror::Error;
use uuid::Uuid;

/// Result type alias for orchestration operations
pub type Result<T> = std::result::Result<T, TaskError>;

/// Stable machine-readable error codes carried across the RPC boundary.
///
/// Codes never change once published; handlers map every [`TaskError`]
/// variant onto exactly one of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    MissingField,
    ValidationError,
    UnknownAction,
    AuthRequired,
    PermissionDenied,
    InvalidToken,
    RateLimitExceeded,
    NotFound,
    DuplicateName,
    DependenciesUnsatisfied,
    ConcurrentModification,
    CrossTenantWrite,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingField => "MISSING_FIELD",
            Self::ValidationError => "VALIDATION_ERROR",
            Self::UnknownAction => "UNKNOWN_ACTION",
            Self::AuthRequired => "AUTH_REQUIRED",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::InvalidToken => "INVALID_TOKEN",
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::NotFound => "NOT_FOUND",
            Self::DuplicateName => "DUPLICATE_NAME",
            Self::DependenciesUnsatisfied => "DEPENDENCIES_UNSATISFIED",
            Self::ConcurrentModification => "CONCURRENT_MODIFICATION",
            Self::CrossTenantWrite => "CROSS_TENANT_WRITE",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Comprehensive error type for the orchestration core.
///
/// Covers validation, integrity, auth, policy, resource, concurrency and
/// infrastructure failures. Each variant maps to a stable [`ErrorCode`]
/// via [`TaskError::code`], which the protocol layer surfaces in the
/// response envelope.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TaskError {
    /// Entity not found (or denied by the tenant filter; the two are
    /// indistinguishable by design).
    #[error("Not found: {0}")]
    NotFound(String),

    /// A required request field was absent
    #[error("Missing required field '{field}'")]
    MissingField {
        field: String,
        expected: String,
        hint: String,
    },

    /// Validation error with details
    #[error("Validation error: {0}")]
    Validation(String),

    /// Invalid state transition attempted
    #[error("Invalid state transition from {0} to {1}")]
    InvalidStateTransition(TaskStatus, TaskStatus),

    /// Action string not recognised for the tool
    #[error("Unknown action '{action}' for {tool}")]
    UnknownAction { tool: String, action: String },

    /// No authenticated identity on a request that requires one
    #[error("Authentication required")]
    AuthRequired,

    /// Authenticated but lacking the required scope
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Token missing, malformed, expired, or revoked
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    /// A sliding-window rate or burst limit was exceeded
    #[error("Rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    /// Name uniqueness violated within its scope
    #[error("Duplicate name: {0}")]
    DuplicateName(String),

    /// Blocking dependencies are not all done
    #[error("Task {task_id} has {} unsatisfied dependencies", blockers.len())]
    DependenciesUnsatisfied { task_id: Uuid, blockers: Vec<Uuid> },

    /// Optimistic-lock mismatch; retryable with a fresh version
    #[error("Concurrent modification of {entity} {id}")]
    ConcurrentModification { entity: String, id: String },

    /// Write attempted against a row owned by another tenant
    #[error("Cross-tenant write rejected for {entity} {id}")]
    CrossTenantWrite { entity: String, id: String },

    /// Database operation error
    #[error("Database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Internal system error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TaskError {
    /// Create a not-found error for an entity id
    pub fn not_found(entity: &str, id: impl std::fmt::Display) -> Self {
        Self::NotFound(format!("{entity} {id} not found"))
    }

    /// Create a missing-field error with a usage hint
    pub fn missing_field(field: &str, expected: &str, hint: &str) -> Self {
        Self::MissingField {
            field: field.to_string(),
            expected: expected.to_string(),
            hint: hint.to_string(),
        }
    }

    /// Create a validation error for an empty field
    pub fn empty_field(field: &str) -> Self {
        Self::Validation(format!("Field '{field}' cannot be empty"))
    }

    pub fn unknown_action(tool: &str, action: &str) -> Self {
        Self::UnknownAction {
            tool: tool.to_string(),
            action: action.to_string(),
        }
    }

    pub fn concurrent_modification(entity: &str, id: impl std::fmt::Display) -> Self {
        Self::ConcurrentModification {
            entity: entity.to_string(),
            id: id.to_string(),
        }
    }

    pub fn cross_tenant_write(entity: &str, id: impl std::fmt::Display) -> Self {
        Self::CrossTenantWrite {
            entity: entity.to_string(),
            id: id.to_string(),
        }
    }

    /// The stable code surfaced in the response envelope.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::MissingField { .. } => ErrorCode::MissingField,
            Self::Validation(_) | Self::InvalidStateTransition(_, _) => ErrorCode::ValidationError,
            Self::UnknownAction { .. } => ErrorCode::UnknownAction,
            Self::AuthRequired => ErrorCode::AuthRequired,
            Self::PermissionDenied(_) => ErrorCode::PermissionDenied,
            Self::InvalidToken(_) => ErrorCode::InvalidToken,
            Self::RateLimitExceeded(_) => ErrorCode::RateLimitExceeded,
            Self::DuplicateName(_) => ErrorCode::DuplicateName,
            Self::DependenciesUnsatisfied { .. } => ErrorCode::DependenciesUnsatisfied,
            Self::ConcurrentModification { .. } => ErrorCode::ConcurrentModification,
            Self::CrossTenantWrite { .. } => ErrorCode::CrossTenantWrite,
            Self::Database(_)
            | Self::Serialization(_)
            | Self::Configuration(_)
            | Self::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Retryable errors may succeed if the caller repeats the request with
    /// fresh state.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrentModification { .. })
    }

    /// Infrastructure failures are logged with a correlation id; their
    /// message never crosses the RPC boundary verbatim.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Self::Database(_) | Self::Serialization(_) | Self::Configuration(_) | Self::Internal(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::MissingField { .. } | Self::InvalidStateTransition(_, _)
        )
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

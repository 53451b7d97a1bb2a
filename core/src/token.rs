//! API token entity and scope model.
//!
//! Raw tokens are never persisted; only the SHA-256 hex digest of the
//! trimmed bearer string is stored. Hashing itself lives in the protocol
//! crate next to the validator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Result, TaskError};

/// A persisted API token. Immutable after creation except for
/// `usage_count`, `last_used_at` and `is_active`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiToken {
    pub id: Uuid,
    pub user_id: String,
    pub name: String,
    /// SHA-256 hex digest of the raw bearer string.
    pub token_hash: String,
    pub scopes: Vec<Scope>,
    /// Per-token requests-per-minute override; falls back to the server
    /// default when zero.
    pub rate_limit: u32,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub usage_count: i64,
    pub is_active: bool,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

impl ApiToken {
    /// Expired means a hard expiry exists and is in the past.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }

    pub fn has_scope(&self, required: &Scope) -> bool {
        self.scopes.iter().any(|s| s.grants(required))
    }
}

/// The identity extracted from a validated token, attached to the request
/// for the rest of the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenInfo {
    pub token_id: Uuid,
    pub token_hash: String,
    pub user_id: String,
    pub scopes: Vec<Scope>,
    pub rate_limit: u32,
    pub expires_at: Option<DateTime<Utc>>,
    pub usage_count: i64,
}

impl From<&ApiToken> for TokenInfo {
    fn from(token: &ApiToken) -> Self {
        Self {
            token_id: token.id,
            token_hash: token.token_hash.clone(),
            user_id: token.user_id.clone(),
            scopes: token.scopes.clone(),
            rate_limit: token.rate_limit,
            expires_at: token.expires_at,
            usage_count: token.usage_count,
        }
    }
}

/// Permission verbs attachable to an entity scope.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScopeAction {
    Read,
    Write,
    Create,
    Update,
    Delete,
    Manage,
}

impl ScopeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Manage => "manage",
        }
    }
}

/// A permission label of the form `entity:action`, e.g. `tasks:read`.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct Scope {
    pub entity: String,
    pub action: ScopeAction,
}

impl Scope {
    pub fn new(entity: &str, action: ScopeAction) -> Self {
        Self {
            entity: entity.to_string(),
            action,
        }
    }

    /// Parse `entity:action`. Unknown verbs are rejected.
    pub fn parse(s: &str) -> Result<Self> {
        let (entity, action) = s
            .split_once(':')
            .ok_or_else(|| TaskError::Validation(format!("Invalid scope '{s}': expected entity:action")))?;
        if entity.is_empty() {
            return Err(TaskError::Validation(format!("Invalid scope '{s}': empty entity")));
        }
        let action = match action {
            "read" => ScopeAction::Read,
            "write" => ScopeAction::Write,
            "create" => ScopeAction::Create,
            "update" => ScopeAction::Update,
            "delete" => ScopeAction::Delete,
            "manage" => ScopeAction::Manage,
            other => {
                return Err(TaskError::Validation(format!(
                    "Invalid scope '{s}': unknown action '{other}'"
                )))
            }
        };
        Ok(Self {
            entity: entity.to_string(),
            action,
        })
    }

    /// Whether this granted scope satisfies `required`.
    ///
    /// `manage` covers every verb on its entity; `write` covers the
    /// mutating verbs. Read operations never satisfy a write requirement.
    pub fn grants(&self, required: &Scope) -> bool {
        if self.entity != required.entity {
            return false;
        }
        match self.action {
            ScopeAction::Manage => true,
            ScopeAction::Write => matches!(
                required.action,
                ScopeAction::Write | ScopeAction::Create | ScopeAction::Update | ScopeAction::Delete
            ),
            action => action == required.action,
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.entity, self.action.as_str())
    }
}

impl Serialize for Scope {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Scope {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Scope::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// The scope a tool action requires before the facade will run it.
pub fn required_scope(tool: &str, action: &str) -> Option<Scope> {
    let entity = match tool {
        "manage_task" | "manage_subtask" => "tasks",
        "manage_project" => "projects",
        "manage_context" => "contexts",
        "manage_agent" => "agents",
        "manage_token" => "tokens",
        _ => return None,
    };
    let verb = match action {
        "get" | "list" | "search" | "next" | "resolve" | "stats" | "validate"
        | "project_health_check" | "validate_integrity" | "list_branches" => ScopeAction::Read,
        "create" | "register" | "create_branch" => ScopeAction::Create,
        "update" | "complete" | "add_dependency" | "remove_dependency" | "add_insight"
        | "add_progress" | "assign" | "unassign" | "delegate" | "reactivate" | "rotate"
        | "accept_hint" | "dismiss_hint" | "hint_feedback" => ScopeAction::Update,
        "delete" | "unregister" | "revoke" | "cleanup" | "cleanup_obsolete" => ScopeAction::Delete,
        "rebalance" | "rebalance_agents" => ScopeAction::Manage,
        _ => return None,
    };
    Some(Scope::new(entity, verb))
}

/// True for the two accepted raw token shapes: a 64-hex opaque string or
/// an `mcp_`-prefixed token.
pub fn is_recognised_token_format(raw: &str) -> bool {
    if let Some(rest) = raw.strip_prefix("mcp_") {
        return rest.len() >= 16;
    }
    raw.len() == 64 && raw.chars().all(|c| c.is_ascii_hexdigit())
}

/// Generate a fresh opaque 64-hex token.
pub fn generate_raw_token() -> String {
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_parse_and_display() {
        let scope = Scope::parse("tasks:read").unwrap();
        assert_eq!(scope.entity, "tasks");
        assert_eq!(scope.action, ScopeAction::Read);
        assert_eq!(scope.to_string(), "tasks:read");

        assert!(Scope::parse("tasks").is_err());
        assert!(Scope::parse(":read").is_err());
        assert!(Scope::parse("tasks:fly").is_err());
    }

    #[test]
    fn test_scope_grants() {
        let read = Scope::parse("tasks:read").unwrap();
        let write = Scope::parse("tasks:write").unwrap();
        let create = Scope::parse("tasks:create").unwrap();
        let manage = Scope::parse("tasks:manage").unwrap();

        // Read never satisfies a write requirement
        assert!(!read.grants(&write));
        assert!(!read.grants(&create));
        assert!(read.grants(&read));

        // Write covers the mutating verbs but not read
        assert!(write.grants(&create));
        assert!(write.grants(&Scope::parse("tasks:delete").unwrap()));
        assert!(!write.grants(&read));

        // Manage covers everything on its entity
        assert!(manage.grants(&read));
        assert!(manage.grants(&write));
        assert!(manage.grants(&create));

        // Entities never cross
        let projects_manage = Scope::parse("projects:manage").unwrap();
        assert!(!projects_manage.grants(&read));
    }

    #[test]
    fn test_required_scope_mapping() {
        assert_eq!(
            required_scope("manage_task", "next"),
            Some(Scope::new("tasks", ScopeAction::Read))
        );
        assert_eq!(
            required_scope("manage_task", "create"),
            Some(Scope::new("tasks", ScopeAction::Create))
        );
        assert_eq!(
            required_scope("manage_project", "cleanup_obsolete"),
            Some(Scope::new("projects", ScopeAction::Delete))
        );
        assert_eq!(
            required_scope("manage_agent", "rebalance"),
            Some(Scope::new("agents", ScopeAction::Manage))
        );
        assert_eq!(required_scope("manage_task", "bogus"), None);
        assert_eq!(required_scope("bogus_tool", "get"), None);
    }

    #[test]
    fn test_token_format_recognition() {
        let opaque = generate_raw_token();
        assert_eq!(opaque.len(), 64);
        assert!(is_recognised_token_format(&opaque));
        assert!(is_recognised_token_format("mcp_0123456789abcdef0123"));
        assert!(!is_recognised_token_format("mcp_short"));
        assert!(!is_recognised_token_format("not-a-token"));
    }

    #[test]
    fn test_token_expiry() {
        let now = Utc::now();
        let mut token = ApiToken {
            id: Uuid::new_v4(),
            user_id: "user-1".to_string(),
            name: "ci".to_string(),
            token_hash: "00".repeat(32),
            scopes: vec![Scope::parse("tasks:read").unwrap()],
            rate_limit: 0,
            expires_at: None,
            last_used_at: None,
            usage_count: 0,
            is_active: true,
            metadata: serde_json::json!({}),
            created_at: now,
        };
        assert!(!token.is_expired(now));

        token.expires_at = Some(now - chrono::Duration::seconds(1));
        assert!(token.is_expired(now));

        token.expires_at = Some(now + chrono::Duration::hours(1));
        assert!(!token.is_expired(now));
    }

    #[test]
    fn test_scope_serde_round_trip() {
        let scopes = vec![
            Scope::parse("tasks:read").unwrap(),
            Scope::parse("projects:manage").unwrap(),
        ];
        let json = serde_json::to_string(&scopes).unwrap();
        assert_eq!(json, r#"["tasks:read","projects:manage"]"#);
        let back: Vec<Scope> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, scopes);
    }
}

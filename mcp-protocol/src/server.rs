//! HTTP surface: one POST route per tool plus a health endpoint.
//!
//! The handler authenticates the bearer token, checks the scope required
//! by the requested action, then hands off to the facade. Every response
//! is a canonical envelope; the HTTP status mirrors the embedded code.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use taskloom_core::{protocol, token::Scope, TaskError, TokenInfo};

use crate::auth::{check_scope, ClientInfo, TokenValidator};
use crate::error::http_status_for_envelope;
use crate::handler::OrchestrationFacade;

/// User assumed when authentication is disabled (testing only).
pub const ANONYMOUS_USER: &str = "default_user";

const TOOLS: &[&str] = &[
    "manage_task",
    "manage_subtask",
    "manage_project",
    "manage_context",
    "manage_agent",
    "manage_token",
];

#[derive(Clone)]
pub struct AppState {
    pub facade: Arc<OrchestrationFacade>,
    pub validator: Arc<TokenValidator>,
    /// `AUTH_REQUIRED=false` admits anonymous requests (testing only).
    pub auth_required: bool,
}

/// The MCP-style HTTP server.
pub struct McpServer {
    state: AppState,
}

impl McpServer {
    pub fn new(
        facade: Arc<OrchestrationFacade>,
        validator: Arc<TokenValidator>,
        auth_required: bool,
    ) -> Self {
        if !auth_required {
            tracing::warn!("Authentication is DISABLED; anonymous access permitted (testing only)");
        }
        Self {
            state: AppState {
                facade,
                validator,
                auth_required,
            },
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health))
            .route("/tools/:tool", post(handle_tool))
            // Outermost layer: every tool request is logged with timing
            // and outcome, including rejected and unauthenticated ones.
            .layer(axum::middleware::from_fn(
                crate::request_logger::request_logging_middleware,
            ))
            .with_state(self.state.clone())
    }

    /// Bind and serve until the process is shut down.
    pub async fn serve(&self, addr: &str) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!(%addr, "MCP server listening");
        axum::serve(listener, self.router()).await?;
        Ok(())
    }
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now(),
    }))
}

async fn handle_tool(
    State(state): State<AppState>,
    Path(tool): Path<String>,
    headers: HeaderMap,
    body: Option<Json<Value>>,
) -> impl IntoResponse {
    let body = body.map(|Json(v)| v).unwrap_or_else(|| json!({}));
    let envelope = process(&state, &tool, &headers, body).await;
    let status = http_status_for_envelope(&envelope);
    (status, Json(envelope))
}

async fn process(state: &AppState, tool: &str, headers: &HeaderMap, body: Value) -> Value {
    if !TOOLS.contains(&tool) {
        return protocol::failure(tool, &TaskError::unknown_action(tool, "-"));
    }

    let mut args = match body {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        _ => {
            return protocol::failure(
                tool,
                &TaskError::Validation("Request body must be a JSON object".to_string()),
            )
        }
    };

    let Some(action) = args.remove("action").and_then(|v| v.as_str().map(String::from)) else {
        return protocol::failure(
            tool,
            &TaskError::missing_field("action", "string", "every tool call requires an action"),
        );
    };
    let operation = format!("{tool}.{action}");

    let info = match authenticate(state, headers).await {
        Ok(info) => info,
        Err(err) => return protocol::failure(&operation, &err),
    };

    if let Err(err) = check_scope(&info, tool, &action) {
        return protocol::failure(&operation, &err);
    }

    debug!(%operation, user_id = %info.user_id, "Authenticated tool call");

    // Every RPC carries an implicit deadline; downstream work is dropped
    // at its next suspension point when it fires.
    match tokio::time::timeout(
        REQUEST_DEADLINE,
        state.facade.dispatch(tool, &action, args, &info.user_id),
    )
    .await
    {
        Ok(envelope) => envelope,
        Err(_) => protocol::failure(
            &operation,
            &TaskError::Internal(format!(
                "Request exceeded the {}s deadline",
                REQUEST_DEADLINE.as_secs()
            )),
        ),
    }
}

/// Implicit per-request deadline.
const REQUEST_DEADLINE: std::time::Duration = std::time::Duration::from_secs(30);

async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<TokenInfo, TaskError> {
    if !state.auth_required {
        return Ok(anonymous_identity());
    }

    let raw = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .ok_or(TaskError::AuthRequired)?;

    let client_info = ClientInfo {
        remote_addr: headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .map(String::from),
        user_agent: headers
            .get("user-agent")
            .and_then(|v| v.to_str().ok())
            .map(String::from),
    };

    state.validator.validate(raw, &client_info).await
}

/// Full-access identity used when auth is disabled.
fn anonymous_identity() -> TokenInfo {
    TokenInfo {
        token_id: uuid::Uuid::nil(),
        token_hash: String::new(),
        user_id: ANONYMOUS_USER.to_string(),
        scopes: ["projects", "tasks", "contexts", "agents", "tokens"]
            .iter()
            .map(|entity| Scope::new(entity, taskloom_core::ScopeAction::Manage))
            .collect(),
        rate_limit: 0,
        expires_at: None,
        usage_count: 0,
    }
}

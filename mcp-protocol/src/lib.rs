//! Protocol layer for the taskloom orchestration service.
//!
//! - [`auth`] - token validation, sliding-window rate limits, scope checks
//! - [`handler`] - the orchestration facade behind the `manage_*` tools
//! - [`server`] - axum HTTP surface
//! - [`request_logger`] - per-request structured logging middleware
//! - [`error`] - HTTP status mapping for the stable error codes

pub mod auth;
pub mod error;
pub mod handler;
pub mod request_logger;
pub mod server;

pub use auth::{check_scope, hash_token, ClientInfo, RateLimitConfig, TokenValidator};
pub use request_logger::request_logging_middleware;
pub use handler::{FacadeConfig, OrchestrationFacade};
pub use server::{AppState, McpServer, ANONYMOUS_USER};

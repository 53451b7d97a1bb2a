//! Taskloom core library.
//!
//! Domain models, business logic and trait interfaces for the multi-tenant
//! task orchestration service. Every other crate depends on the types and
//! interfaces defined here.
//!
//! # Architecture
//!
//! - [`models`] - Task, subtask, project, branch and agent entities
//! - [`context`] - Four-tier context hierarchy entities and merge semantics
//! - [`token`] - API token entity and the scope model
//! - [`error`] - Error types with stable RPC error codes
//! - [`repository`] - Persistence traits implemented by the database crate
//! - [`scoped`] - User-scoped decorators enforcing tenant isolation
//! - [`selector`] - Dependency-aware next-task selection
//! - [`hierarchy`] - Context resolve/create/update/delete/delegate engine
//! - [`context_cache`] - TTL + dependency-hash cache over resolutions
//! - [`hints`] / [`hint_engine`] - Workflow hint rules and pipeline
//! - [`events`] - Append-only domain event log
//! - [`validation`] - Field validators and the dependency graph
//! - [`protocol`] - Tool parameter DTOs and the response envelope

pub mod context;
pub mod context_cache;
pub mod error;
pub mod events;
pub mod hierarchy;
pub mod hint_engine;
pub mod hints;
pub mod models;
pub mod protocol;
pub mod repository;
pub mod scoped;
pub mod selector;
pub mod token;
pub mod validation;

// Re-export commonly used types at the crate root for convenience
pub use context::{ContextLevel, ContextRecord, ResolvedContext, TriggerType, GLOBAL_CONTEXT_ID};
pub use error::{ErrorCode, Result, TaskError};
pub use events::{EventFilter, EventStore, StoredEvent};
pub use hierarchy::ContextHierarchyService;
pub use hint_engine::HintEngine;
pub use hints::{HintRule, HintType, ImpactLevel, RuleContext, WorkflowHint};
pub use models::{
    Agent, AgentStatus, Branch, DependencyType, NewAgent, NewBranch, NewProject, NewSubtask,
    NewTask, Priority, Project, Subtask, Task, TaskDependency, TaskFilter, TaskStatus, UpdateAgent,
    UpdateProject, UpdateSubtask, UpdateTask,
};
pub use repository::{
    AgentRepository, BranchRepository, ContextCacheRepository, ContextRepository,
    DelegationRepository, ProjectRepository, Repositories, SubtaskRepository, TaskRepository,
    TokenRepository,
};
pub use scoped::scope_repositories;
pub use selector::{NextTaskResult, NextTaskSelector, SelectorFilters};
pub use token::{ApiToken, Scope, ScopeAction, TokenInfo};
pub use validation::{DependencyGraph, Validator};

/// Current version of the core crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_re_exports() {
        let status = TaskStatus::Todo;
        assert!(status.is_actionable());

        let error = TaskError::not_found("Task", uuid::Uuid::new_v4());
        assert_eq!(error.code(), ErrorCode::NotFound);
    }
}

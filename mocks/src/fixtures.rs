//! Ready-made workspaces for integration tests.

use std::sync::Arc;

use taskloom_core::{
    models::{Branch, NewBranch, NewProject, Project},
    repository::Repositories,
    scoped::scope_repositories,
};

use crate::repository::InMemoryStore;

/// The default test tenant.
pub const TEST_USER: &str = "user-1";

/// A second tenant for isolation tests.
pub const OTHER_USER: &str = "user-2";

/// A seeded workspace: one project with a `main` branch for [`TEST_USER`],
/// plus scoped repository handles for both tenants.
pub struct Workspace {
    pub store: Arc<InMemoryStore>,
    pub base: Repositories,
    pub repos: Repositories,
    pub other: Repositories,
    pub project: Project,
    pub branch: Branch,
}

impl Workspace {
    pub async fn seeded() -> Self {
        let store = InMemoryStore::new();
        let base = store.repositories();
        let repos = scope_repositories(&base, TEST_USER);
        let other = scope_repositories(&base, OTHER_USER);

        let project = repos
            .projects
            .create(NewProject {
                name: "Test Project".to_string(),
                description: "Seeded by fixtures".to_string(),
                user_id: String::new(),
            })
            .await
            .expect("seed project");

        let branch = repos
            .branches
            .create(NewBranch {
                project_id: project.id,
                name: "main".to_string(),
                description: String::new(),
                user_id: String::new(),
            })
            .await
            .expect("seed branch");

        Self {
            store,
            base,
            repos,
            other,
            project,
            branch,
        }
    }
}

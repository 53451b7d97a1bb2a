//! Test doubles for the taskloom workspace: thread-safe in-memory
//! repositories with error injection and call tracking, entity builders,
//! and seeded fixtures.

pub mod builders;
pub mod fixtures;
pub mod repository;

pub use builders::{SubtaskBuilder, TaskBuilder, TokenBuilder};
pub use fixtures::{Workspace, OTHER_USER, TEST_USER};
pub use repository::InMemoryStore;

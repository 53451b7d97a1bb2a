//! Server binary support library: configuration, telemetry and wiring.

pub mod config;
pub mod setup;
pub mod telemetry;

pub use config::Config;
pub use setup::{ensure_database_directory, initialize_app};

//! Builders to construct scheduler components from configuration.

pub mod manager_builder;

pub use manager_builder::{build_manager, build_manager_from_json};

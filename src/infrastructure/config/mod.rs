//! Configuration loading.

pub mod loader;
pub mod manifest;

pub use loader::{ConfigError, ConfigLoader};
pub use manifest::{load_manifest, write_manifest};

//! Process-level setup for applications embedding providence: layered
//! configuration and logging.

pub mod config;
pub mod logging;

pub use config::*;
pub use logging::*;

use anyhow::{Context, Result};
use providence::Providence;
use std::path::Path;

/// Loads configuration, installs logging and builds a root with the HTTP
/// transport. Relative log file paths resolve against `base_dir`.
pub fn bootstrap<P: AsRef<Path>>(config_path: Option<P>, base_dir: &Path) -> Result<Providence> {
    let config = AppConfig::load_or_default(config_path)?;
    match &config.logging {
        Some(logging) => init_logging(logging, base_dir),
        None => init_minimal(),
    }
    tracing::debug!(config = ?config.providence, "Configuration loaded");
    Providence::builder()
        .config(config.providence)
        .build()
        .context("Failed to build providence root")
}

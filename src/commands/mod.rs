pub mod analyze;
pub mod benchmark;
pub mod init_config;
pub mod read_fits;

pub use analyze::analyze;
pub use benchmark::benchmark;
pub use init_config::init_config;
pub use read_fits::read_fits;

use anyhow::{Context, Result};
use std::path::Path;

use crate::cli::TuningOptions;
use crate::config::Config;

/// Configuration from `path` (or the defaults) with command line overrides
/// applied and validated.
pub(crate) fn load_config(path: Option<&Path>, tuning: &TuningOptions) -> Result<Config> {
    let mut config = match path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load config file: {}", path.display()))?,
        None => Config::default(),
    };
    config.merge_with_cli(&tuning.to_overrides());
    config
        .validate()
        .context("Configuration validation failed")?;
    Ok(config)
}

pub(crate) fn fmt_opt(value: Option<f64>, precision: usize) -> String {
    match value {
        Some(v) => format!("{:.*}", precision, v),
        None => "-".to_string(),
    }
}

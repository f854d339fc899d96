//! CLI command implementations

pub mod config;
pub mod evaluate;
pub mod run;

pub use config::ConfigCommand;
pub use evaluate::EvaluateCommand;
pub use run::RunCommand;

use anyhow::Context;
use experiment_types::Experiment;
use serde::de::DeserializeOwned;
use std::path::Path;

/// Read and parse a JSON file
pub fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

/// Load experiments from a file holding either one experiment or an array
pub fn load_experiments(path: &Path) -> anyhow::Result<Vec<Experiment>> {
    let value: serde_json::Value = read_json(path)?;
    let experiments = if value.is_array() {
        serde_json::from_value(value)
    } else {
        serde_json::from_value(value).map(|e| vec![e])
    }
    .with_context(|| format!("{} does not contain experiments", path.display()))?;
    Ok(experiments)
}

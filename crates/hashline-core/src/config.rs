//! Pipeline configuration: worker limits, queue sizing and the aggregate separator.

use crate::error::{HashlineError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_SEPARATOR: &str = "_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Upper bound on in-flight workers per fan-out stage.
    /// `None` launches one worker per item with no cap.
    pub max_workers: Option<usize>,

    /// Capacity of every inter-stage queue.
    pub channel_capacity: usize,

    /// Joins the sorted results in the aggregator.
    pub separator: String,

    /// Artificial latency for the default signers, in milliseconds.
    pub signer_latency_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_workers: None,
            channel_capacity: 1,
            separator: DEFAULT_SEPARATOR.to_string(),
            signer_latency_ms: 0,
        }
    }
}

impl PipelineConfig {
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let config: Self =
            serde_yaml::from_str(raw).map_err(|e| HashlineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| HashlineError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_yaml_str(&raw)
    }

    /// Reads `HASHLINE_MAX_WORKERS`, `HASHLINE_CHANNEL_CAPACITY`,
    /// `HASHLINE_SEPARATOR` and `HASHLINE_SIGNER_LATENCY_MS`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup("HASHLINE_MAX_WORKERS") {
            config.max_workers = Some(parse_number("HASHLINE_MAX_WORKERS", &raw)?);
        }
        if let Some(raw) = lookup("HASHLINE_CHANNEL_CAPACITY") {
            config.channel_capacity = parse_number("HASHLINE_CHANNEL_CAPACITY", &raw)?;
        }
        if let Some(sep) = lookup("HASHLINE_SEPARATOR") {
            config.separator = sep;
        }
        if let Some(raw) = lookup("HASHLINE_SIGNER_LATENCY_MS") {
            config.signer_latency_ms = parse_number("HASHLINE_SIGNER_LATENCY_MS", &raw)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_workers == Some(0) {
            return Err(HashlineError::Config("max_workers must be at least 1".into()));
        }
        if self.channel_capacity == 0 {
            return Err(HashlineError::Config("channel_capacity must be at least 1".into()));
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| HashlineError::Config(format!("{} is not a number: {:?}", key, raw)))
}

//! Data Model: Item, StageReport, RunReport
use crate::error::{HashlineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A value flowing through the pipeline.
///
/// Identity is the canonical string form; stages only ever look at
/// [`Item::canonical`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Item {
    Int(i64),
    Text(String),
    Bytes(Vec<u8>),
}

impl Item {
    /// Canonical string representation. Bytes must be valid UTF-8.
    pub fn canonical(&self) -> Result<String> {
        match self {
            Self::Int(n) => Ok(n.to_string()),
            Self::Text(s) => Ok(s.clone()),
            Self::Bytes(b) => String::from_utf8(b.clone())
                .map_err(|e| HashlineError::InputConversion(format!("{:?}: {}", b, e))),
        }
    }

    /// Consumes the item, avoiding a copy for text.
    pub fn into_canonical(self) -> Result<String> {
        match self {
            Self::Text(s) => Ok(s),
            other => other.canonical(),
        }
    }
}

impl From<i64> for Item {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<String> for Item {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for Item {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<Vec<u8>> for Item {
    fn from(b: Vec<u8>) -> Self {
        Self::Bytes(b)
    }
}

impl fmt::Display for Item {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Int(n) => write!(f, "{}", n),
            Self::Text(s) => f.write_str(s),
            Self::Bytes(b) => write!(f, "{}", String::from_utf8_lossy(b)),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageReport {
    pub id: String,
    pub items_in: u64,
    pub items_out: u64,
    pub deterministic: bool,
    pub latency_ms: u64,
}

impl StageReport {
    pub fn new(id: &str, items_in: u64, items_out: u64) -> Self {
        Self {
            id: id.to_string(),
            items_in,
            items_out,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub pipeline_id: String,
    pub started_at: DateTime<Utc>,
    pub stages: Vec<StageReport>,
    /// blake3 over the canonical seed items, newline separated
    pub in_hash: String,
    /// blake3 over the canonical output items, newline separated
    pub out_hash: String,
    pub latency_ms: u64,
}

/// Everything left on the last queue once the chain drained.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub items: Vec<Item>,
    pub report: RunReport,
}

impl RunOutput {
    /// The lone value an aggregating chain leaves behind.
    pub fn into_single(mut self) -> Result<String> {
        if self.items.len() != 1 {
            return Err(HashlineError::Wiring(format!(
                "{} must end in an aggregator, last queue held {} items",
                self.report.pipeline_id,
                self.items.len()
            )));
        }
        match self.items.pop() {
            Some(item) => item.into_canonical(),
            None => Err(HashlineError::Wiring("aggregate missing".to_string())),
        }
    }
}

//! Hashline Core: Stage trait, Serializing Gate, fan-out driver and Runner
//!
//! Stages run concurrently, each one connected to the next by a bounded
//! queue. Per-item stages fan out through [`fan_out`]; non-reentrant
//! dependencies are shared through a [`SerializingGate`].
//!
//! ```text
//! seed → [stage 1] → [stage 2] → … → [aggregator] → one value
//! ```

pub mod config;
pub mod context;
pub mod data_model;
pub mod error;
pub mod fan_out;
pub mod gate;
pub mod runner;
pub mod stage;

pub use config::PipelineConfig;
pub use context::RunContext;
pub use data_model::{Item, RunOutput, RunReport, StageReport};
pub use error::{HashlineError, Result};
pub use fan_out::fan_out;
pub use gate::SerializingGate;
pub use runner::PipelineRunner;
pub use stage::Stage;

/// Re-exported so stages and callers share one token type.
pub use tokio_util::sync::CancellationToken;

/// Hashline engine version
pub const HASHLINE_VERSION: &str = "1.0.0";

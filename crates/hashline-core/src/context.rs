//! Execution Context: per-run settings shared by every stage and worker
use crate::config::PipelineConfig;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: String,
    pub max_workers: Option<usize>,
    pub channel_capacity: usize,
    cancel: CancellationToken,
}

impl RunContext {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            max_workers: config.max_workers,
            channel_capacity: config.channel_capacity.max(1),
            cancel: CancellationToken::new(),
        }
    }

    /// Ties the run to a caller-owned token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Context for one run of the chain. Cancelling it stops the run
    /// without touching the caller's token; cancelling the caller's token
    /// still reaches it.
    pub(crate) fn scoped(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            ..self.clone()
        }
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new(&PipelineConfig::default())
    }
}

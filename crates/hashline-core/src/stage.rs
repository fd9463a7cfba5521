//! Stage Trait: the single contract every pipeline step implements
use crate::context::RunContext;
use crate::data_model::{Item, StageReport};
use crate::error::Result;
use async_trait::async_trait;
use tokio::sync::mpsc::{Receiver, Sender};

/// One step of the chain.
///
/// A stage reads `input` until it is closed and writes to `output`.
/// Returning (and so dropping `output`) closes the stage's output queue,
/// so a stage must not return while anything it spawned can still write.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Stable id (ex: "hash.single.v1")
    fn id(&self) -> &'static str;

    /// Whether the emitted multiset depends only on the consumed multiset
    fn deterministic(&self) -> bool {
        true
    }

    async fn run(
        &self,
        input: Receiver<Item>,
        output: Sender<Item>,
        ctx: &RunContext,
    ) -> Result<StageReport>;
}

use crate::signers::{sign_blocking, Signer};
use async_trait::async_trait;
use hashline_core::error::describe_join_error;
use hashline_core::{
    fan_out, CancellationToken, HashlineError, Item, Result, RunContext, Stage, StageReport,
};
use std::sync::Arc;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::task::JoinSet;

/// Number of salted checksums per item.
pub const MULTI_HASH_ROUNDS: usize = 6;

/// Concatenation of `checksum("0" + v)` .. `checksum("5" + v)`.
pub struct MultiHashStage {
    checksum: Arc<dyn Signer>,
}

impl MultiHashStage {
    pub fn new(checksum: Arc<dyn Signer>) -> Self {
        Self { checksum }
    }
}

#[async_trait]
impl Stage for MultiHashStage {
    fn id(&self) -> &'static str {
        "multi_hash.v1"
    }

    async fn run(
        &self,
        input: Receiver<Item>,
        output: Sender<Item>,
        ctx: &RunContext,
    ) -> Result<StageReport> {
        let checksum = Arc::clone(&self.checksum);
        let cancel = ctx.cancellation().clone();
        fan_out(self.id(), input, output, ctx, move |item| {
            multi_hash(item, Arc::clone(&checksum), cancel.clone())
        })
        .await
    }
}

/// All rounds run at once; each owns one pre-allocated slot, and the
/// result is assembled in slot order once every round has reported.
pub async fn multi_hash(
    item: Item,
    checksum: Arc<dyn Signer>,
    cancel: CancellationToken,
) -> Result<Item> {
    let data = item.into_canonical()?;

    let mut rounds = JoinSet::new();
    for index in 0..MULTI_HASH_ROUNDS {
        let salted = format!("{}{}", index, data);
        let checksum = Arc::clone(&checksum);
        let cancel = cancel.clone();
        rounds.spawn(async move { (index, sign_blocking(checksum, salted, &cancel).await) });
    }

    let mut slots: [Option<String>; MULTI_HASH_ROUNDS] = Default::default();
    while let Some(joined) = rounds.join_next().await {
        let (index, signed) =
            joined.map_err(|e| HashlineError::Worker(describe_join_error(e)))?;
        slots[index] = Some(signed?);
    }

    let mut combined = String::new();
    for (index, slot) in slots.into_iter().enumerate() {
        let part = slot
            .ok_or_else(|| HashlineError::Worker(format!("round {} never reported", index)))?;
        combined.push_str(&part);
    }
    Ok(Item::Text(combined))
}

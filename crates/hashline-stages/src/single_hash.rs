use crate::signers::{sign_blocking, sign_gated, DigestGate, Signer};
use async_trait::async_trait;
use hashline_core::{
    fan_out, CancellationToken, Item, Result, RunContext, Stage, StageReport,
};
use std::sync::Arc;
use tokio::sync::mpsc::{Receiver, Sender};

/// `checksum(v) ~ checksum(digest(v))` for every item.
///
/// Both halves run concurrently. Only the digest call goes through the
/// gate, so it is serialized against other digest calls and nothing else.
pub struct SingleHashStage {
    checksum: Arc<dyn Signer>,
    digest: DigestGate,
}

impl SingleHashStage {
    pub fn new(checksum: Arc<dyn Signer>, digest: DigestGate) -> Self {
        Self { checksum, digest }
    }
}

#[async_trait]
impl Stage for SingleHashStage {
    fn id(&self) -> &'static str {
        "single_hash.v1"
    }

    async fn run(
        &self,
        input: Receiver<Item>,
        output: Sender<Item>,
        ctx: &RunContext,
    ) -> Result<StageReport> {
        let checksum = Arc::clone(&self.checksum);
        let digest = self.digest.clone();
        let cancel = ctx.cancellation().clone();

        fan_out(self.id(), input, output, ctx, move |item| {
            single_hash(item, Arc::clone(&checksum), digest.clone(), cancel.clone())
        })
        .await
    }
}

pub async fn single_hash(
    item: Item,
    checksum: Arc<dyn Signer>,
    digest: DigestGate,
    cancel: CancellationToken,
) -> Result<Item> {
    let data = item.into_canonical()?;

    let left = sign_blocking(Arc::clone(&checksum), data.clone(), &cancel);
    let right = async {
        let digested = sign_gated(&digest, data, &cancel).await?;
        sign_blocking(checksum, digested, &cancel).await
    };

    let (left, right) = tokio::try_join!(left, right)?;
    Ok(Item::Text(format!("{}~{}", left, right)))
}

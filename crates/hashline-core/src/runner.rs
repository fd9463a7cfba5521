//! Pipeline Runner: chains stages over bounded queues and waits for the chain to drain
use crate::context::RunContext;
use crate::data_model::{Item, RunOutput, RunReport, StageReport};
use crate::error::{describe_join_error, describe_panic, record_failure, HashlineError, Result};
use crate::stage::Stage;
use chrono::Utc;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::{self, Sender};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct PipelineRunner {
    stages: Vec<Arc<dyn Stage>>,
    pipeline_id: String,
}

impl PipelineRunner {
    /// Rejects an empty chain before anything runs.
    pub fn new(stages: Vec<Box<dyn Stage>>) -> Result<Self> {
        if stages.is_empty() {
            return Err(HashlineError::Wiring(
                "pipeline needs at least one stage".to_string(),
            ));
        }

        let pipeline_id = stages
            .iter()
            .map(|s| s.id().split('.').next().unwrap_or("?"))
            .collect::<Vec<_>>()
            .join("→");

        Ok(Self {
            stages: stages.into_iter().map(Arc::from).collect(),
            pipeline_id,
        })
    }

    /// Runs every stage concurrently, stage `i`'s output queue feeding
    /// stage `i + 1`, and returns what is left on the last queue.
    ///
    /// The first failure cancels the run. Every stage task (and through it
    /// every worker) is still joined before the error is returned. Dropping
    /// the returned future cancels the run and aborts every task it spawned.
    pub async fn run(&self, seed: Vec<Item>, ctx: &RunContext) -> Result<RunOutput> {
        if ctx.max_workers == Some(0) {
            return Err(HashlineError::Config("max_workers must be at least 1".into()));
        }

        let run_ctx = ctx.scoped();
        let cancel = run_ctx.cancellation().clone();
        let started_at = Utc::now();
        let start = Instant::now();

        info!(
            run_id = %ctx.run_id,
            pipeline = %self.pipeline_id,
            seed = seed.len(),
            max_workers = ?ctx.max_workers,
            "pipeline starting"
        );

        let in_hash = hash_items(&seed);
        let (seed_tx, mut rx) = mpsc::channel(run_ctx.channel_capacity);

        let mut tasks: JoinSet<Finished> = JoinSet::new();
        for (index, stage) in self.stages.iter().enumerate() {
            let (tx, next_rx) = mpsc::channel(run_ctx.channel_capacity);
            let input = std::mem::replace(&mut rx, next_rx);
            let stage = Arc::clone(stage);
            let stage_ctx = run_ctx.clone();

            tasks.spawn(async move {
                let started = Instant::now();
                let id = stage.id();
                debug!(stage = id, index, "stage starting");

                let result = AssertUnwindSafe(stage.run(input, tx, &stage_ctx))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|payload| {
                        Err(HashlineError::Worker(format!("{}: {}", id, describe_panic(payload))))
                    });

                debug!(stage = id, index, ok = result.is_ok(), "stage closed");
                Finished::Stage {
                    index,
                    result,
                    latency_ms: started.elapsed().as_millis() as u64,
                }
            });
        }

        tasks.spawn({
            let cancel = cancel.clone();
            async move { Finished::Feeder(feed(seed, seed_tx, cancel).await) }
        });
        tasks.spawn(async move {
            let mut items = Vec::new();
            while let Some(item) = rx.recv().await {
                items.push(item);
            }
            Finished::Collector(items)
        });

        // Declared after the task set so it drops first: a dropped run
        // cancels the token before the tasks are aborted.
        let _cancel_on_drop = cancel.clone().drop_guard();

        let mut reports: Vec<Option<StageReport>> = vec![None; self.stages.len()];
        let mut items = Vec::new();
        let mut failure: Option<HashlineError> = None;

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Finished::Stage { index, result: Ok(mut report), latency_ms }) => {
                    report.latency_ms = latency_ms;
                    report.deterministic = self.stages[index].deterministic();
                    reports[index] = Some(report);
                }
                Ok(Finished::Stage { index, result: Err(err), .. }) => {
                    if failure.is_none() && !err.is_secondary() {
                        warn!(
                            run_id = %ctx.run_id,
                            stage = self.stages[index].id(),
                            error = %err,
                            "stage failed, cancelling run"
                        );
                    }
                    record_failure(&mut failure, err);
                    cancel.cancel();
                }
                Ok(Finished::Feeder(Ok(()))) => {}
                Ok(Finished::Feeder(Err(err))) => {
                    record_failure(&mut failure, err);
                    cancel.cancel();
                }
                Ok(Finished::Collector(collected)) => items = collected,
                Err(e) => {
                    record_failure(&mut failure, HashlineError::Worker(describe_join_error(e)));
                    cancel.cancel();
                }
            }
        }

        // A caller cancelling after the chain drained does not undo the
        // run: every stage that saw the cancellation already reported it.
        if let Some(err) = failure {
            warn!(run_id = %ctx.run_id, error = %err, "pipeline aborted");
            return Err(err);
        }

        let report = RunReport {
            run_id: ctx.run_id.clone(),
            pipeline_id: self.pipeline_id.clone(),
            started_at,
            stages: reports.into_iter().flatten().collect(),
            in_hash,
            out_hash: hash_items(&items),
            latency_ms: start.elapsed().as_millis() as u64,
        };

        info!(
            run_id = %ctx.run_id,
            items = items.len(),
            latency_ms = report.latency_ms,
            "pipeline drained"
        );

        Ok(RunOutput { items, report })
    }

    /// Runs a chain that ends in an aggregating stage and returns the
    /// single value it emitted.
    pub async fn run_aggregate(&self, seed: Vec<Item>, ctx: &RunContext) -> Result<String> {
        self.run(seed, ctx).await?.into_single()
    }

    pub fn pipeline_id(&self) -> &str {
        &self.pipeline_id
    }

    /// Never zero: `new` rejects an empty chain.
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }
}

enum Finished {
    Stage {
        index: usize,
        result: Result<StageReport>,
        latency_ms: u64,
    },
    Feeder(Result<()>),
    Collector(Vec<Item>),
}

async fn feed(seed: Vec<Item>, tx: Sender<Item>, cancel: CancellationToken) -> Result<()> {
    for item in seed {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(HashlineError::Cancelled),
            sent = tx.send(item) => {
                sent.map_err(|_| HashlineError::Closed("seed".to_string()))?;
            }
        }
    }
    Ok(())
}

fn hash_items(items: &[Item]) -> String {
    let mut hasher = blake3::Hasher::new();
    for item in items {
        match item {
            Item::Bytes(raw) => hasher.update(raw),
            other => hasher.update(other.to_string().as_bytes()),
        };
        hasher.update(b"\n");
    }
    format!("blake3:{}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::fan_out::fan_out;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc::Receiver;

    struct Upper;

    #[async_trait]
    impl Stage for Upper {
        fn id(&self) -> &'static str {
            "upper.v1"
        }

        async fn run(
            &self,
            input: Receiver<Item>,
            output: Sender<Item>,
            ctx: &RunContext,
        ) -> Result<StageReport> {
            fan_out(self.id(), input, output, ctx, upper).await
        }
    }

    async fn upper(item: Item) -> Result<Item> {
        Ok(Item::Text(item.canonical()?.to_uppercase()))
    }

    struct SortJoin;

    #[async_trait]
    impl Stage for SortJoin {
        fn id(&self) -> &'static str {
            "sort_join.v1"
        }

        async fn run(
            &self,
            mut input: Receiver<Item>,
            output: Sender<Item>,
            _ctx: &RunContext,
        ) -> Result<StageReport> {
            let mut all = Vec::new();
            while let Some(item) = input.recv().await {
                all.push(item.canonical()?);
            }
            all.sort();
            let count = all.len() as u64;
            output
                .send(Item::Text(all.join("_")))
                .await
                .map_err(|_| HashlineError::Closed(self.id().to_string()))?;
            Ok(StageReport::new(self.id(), count, 1))
        }
    }

    struct Stall;

    #[async_trait]
    impl Stage for Stall {
        fn id(&self) -> &'static str {
            "stall.v1"
        }

        async fn run(
            &self,
            _input: Receiver<Item>,
            _output: Sender<Item>,
            ctx: &RunContext,
        ) -> Result<StageReport> {
            ctx.cancellation().cancelled().await;
            Err(HashlineError::Cancelled)
        }
    }

    struct Explode;

    #[async_trait]
    impl Stage for Explode {
        fn id(&self) -> &'static str {
            "explode.v1"
        }

        async fn run(
            &self,
            _input: Receiver<Item>,
            _output: Sender<Item>,
            _ctx: &RunContext,
        ) -> Result<StageReport> {
            panic!("stage exploded")
        }
    }

    struct Ticker {
        ticks: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Stage for Ticker {
        fn id(&self) -> &'static str {
            "ticker.v1"
        }

        async fn run(
            &self,
            _input: Receiver<Item>,
            _output: Sender<Item>,
            _ctx: &RunContext,
        ) -> Result<StageReport> {
            loop {
                tokio::time::sleep(Duration::from_millis(5)).await;
                self.ticks.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    /// Passes items through, then cancels the caller's token once its
    /// input is exhausted and everything has been forwarded.
    struct CancelOnClose {
        token: CancellationToken,
    }

    #[async_trait]
    impl Stage for CancelOnClose {
        fn id(&self) -> &'static str {
            "cancel_on_close.v1"
        }

        async fn run(
            &self,
            mut input: Receiver<Item>,
            output: Sender<Item>,
            _ctx: &RunContext,
        ) -> Result<StageReport> {
            let mut count = 0;
            while let Some(item) = input.recv().await {
                count += 1;
                output
                    .send(item)
                    .await
                    .map_err(|_| HashlineError::Closed(self.id().to_string()))?;
            }
            drop(output);
            self.token.cancel();
            Ok(StageReport::new(self.id(), count, count))
        }
    }

    fn seed(values: &[&str]) -> Vec<Item> {
        values.iter().map(|v| Item::from(*v)).collect()
    }

    #[test]
    fn test_empty_pipeline_rejected() {
        let err = PipelineRunner::new(Vec::new()).err().unwrap();
        assert!(matches!(err, HashlineError::Wiring(_)));
    }

    #[test]
    fn test_pipeline_id() {
        let runner = PipelineRunner::new(vec![Box::new(Upper), Box::new(SortJoin)]).unwrap();
        assert_eq!(runner.pipeline_id(), "upper→sort_join");
        assert_eq!(runner.stage_count(), 2);
    }

    #[tokio::test]
    async fn test_chain_drains_and_aggregates() {
        let runner = PipelineRunner::new(vec![Box::new(Upper), Box::new(SortJoin)]).unwrap();
        let ctx = RunContext::default();

        let out = runner.run(seed(&["b", "c", "a"]), &ctx).await.unwrap();
        assert_eq!(out.items, vec![Item::Text("A_B_C".to_string())]);
        assert_eq!(out.report.stages.len(), 2);
        assert_eq!(out.report.stages[0].items_in, 3);
        assert_eq!(out.report.stages[1].items_out, 1);
        assert!(out.report.in_hash.starts_with("blake3:"));
    }

    #[tokio::test]
    async fn test_run_aggregate_requires_single_value() {
        let runner = PipelineRunner::new(vec![Box::new(Upper)]).unwrap();
        let ctx = RunContext::default();

        let err = runner.run_aggregate(seed(&["x", "y"]), &ctx).await.unwrap_err();
        assert!(matches!(err, HashlineError::Wiring(_)));
    }

    #[tokio::test]
    async fn test_input_error_fails_whole_run() {
        let runner = PipelineRunner::new(vec![Box::new(Upper), Box::new(SortJoin)]).unwrap();
        let ctx = RunContext::default();
        let mut items = seed(&["a", "b"]);
        items.push(Item::Bytes(vec![0xc3, 0x28]));

        let err = runner.run_aggregate(items, &ctx).await.unwrap_err();
        assert!(matches!(err, HashlineError::InputConversion(_)));
        assert!(!ctx.is_cancelled());
    }

    #[tokio::test]
    async fn test_stage_panic_is_reported() {
        let runner = PipelineRunner::new(vec![Box::new(Explode), Box::new(SortJoin)]).unwrap();
        let err = runner
            .run(seed(&["a"]), &RunContext::default())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            HashlineError::Worker("explode.v1: panicked: stage exploded".to_string())
        );
    }

    #[tokio::test]
    async fn test_zero_workers_rejected_before_running() {
        let runner = PipelineRunner::new(vec![Box::new(Upper), Box::new(SortJoin)]).unwrap();
        let ctx = RunContext::new(&PipelineConfig {
            max_workers: Some(0),
            ..PipelineConfig::default()
        });

        let err = tokio::time::timeout(Duration::from_secs(2), runner.run_aggregate(seed(&["a"]), &ctx))
            .await
            .expect("zero worker limit must not hang")
            .unwrap_err();
        assert!(matches!(err, HashlineError::Config(_)));
    }

    #[tokio::test]
    async fn test_dropped_run_stops_its_stages() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let runner = PipelineRunner::new(vec![Box::new(Ticker {
            ticks: Arc::clone(&ticks),
        })])
        .unwrap();
        let ctx = RunContext::default();

        let outcome =
            tokio::time::timeout(Duration::from_millis(30), runner.run(seed(&["a"]), &ctx)).await;
        assert!(outcome.is_err());

        let at_drop = ticks.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), at_drop);
        assert!(!ctx.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancel_after_drain_keeps_result() {
        let token = CancellationToken::new();
        let runner = PipelineRunner::new(vec![
            Box::new(CancelOnClose {
                token: token.clone(),
            }),
            Box::new(SortJoin),
        ])
        .unwrap();
        let ctx = RunContext::default().with_cancellation(token.clone());

        let got = runner.run_aggregate(seed(&["b", "a"]), &ctx).await.unwrap();
        assert_eq!(got, "a_b");
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_seed_hash_keeps_raw_bytes() {
        let a = hash_items(&[Item::Bytes(vec![0xff])]);
        let b = hash_items(&[Item::Bytes(vec![0xfe])]);
        assert_ne!(a, b);
        assert_eq!(a, hash_items(&[Item::Bytes(vec![0xff])]));
    }

    #[tokio::test]
    async fn test_caller_cancellation() {
        let runner = PipelineRunner::new(vec![Box::new(Stall), Box::new(SortJoin)]).unwrap();
        let token = CancellationToken::new();
        let ctx = RunContext::new(&PipelineConfig::default()).with_cancellation(token.clone());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });

        let err = runner.run(seed(&["a"]), &ctx).await.unwrap_err();
        assert_eq!(err, HashlineError::Cancelled);
        canceller.await.unwrap();
    }
}

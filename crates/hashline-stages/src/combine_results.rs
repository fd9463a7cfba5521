use async_trait::async_trait;
use hashline_core::config::DEFAULT_SEPARATOR;
use hashline_core::{HashlineError, Item, Result, RunContext, Stage, StageReport};
use tokio::sync::mpsc::{Receiver, Sender};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregatePhase {
    Idle,
    Collecting,
    Sorting,
    Emitted,
}

/// Buffer for one run's results. Arrival order never reaches the output:
/// [`Aggregate::finish`] sorts before joining. Duplicates are kept.
#[derive(Debug)]
pub struct Aggregate {
    values: Vec<String>,
    phase: AggregatePhase,
}

impl Aggregate {
    pub fn new() -> Self {
        Self {
            values: Vec::new(),
            phase: AggregatePhase::Idle,
        }
    }

    pub fn phase(&self) -> AggregatePhase {
        self.phase
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn push(&mut self, value: String) -> Result<()> {
        match self.phase {
            AggregatePhase::Idle | AggregatePhase::Collecting => {
                self.phase = AggregatePhase::Collecting;
                self.values.push(value);
                Ok(())
            }
            phase => Err(HashlineError::Wiring(format!(
                "aggregate is {:?}, cannot accept more values",
                phase
            ))),
        }
    }

    /// Sorts and joins. A second call is an error: one aggregate per run.
    pub fn finish(&mut self, separator: &str) -> Result<String> {
        if self.phase == AggregatePhase::Emitted {
            return Err(HashlineError::Wiring("aggregate already emitted".to_string()));
        }
        self.phase = AggregatePhase::Sorting;
        self.values.sort();
        let joined = self.values.join(separator);
        self.phase = AggregatePhase::Emitted;
        Ok(joined)
    }
}

impl Default for Aggregate {
    fn default() -> Self {
        Self::new()
    }
}

/// Terminal stage: waits for upstream to close, then emits exactly one
/// sorted, separator-joined value.
pub struct CombineResultsStage {
    separator: String,
}

impl CombineResultsStage {
    pub fn new(separator: impl Into<String>) -> Self {
        Self {
            separator: separator.into(),
        }
    }
}

impl Default for CombineResultsStage {
    fn default() -> Self {
        Self::new(DEFAULT_SEPARATOR)
    }
}

#[async_trait]
impl Stage for CombineResultsStage {
    fn id(&self) -> &'static str {
        "combine_results.v1"
    }

    async fn run(
        &self,
        mut input: Receiver<Item>,
        output: Sender<Item>,
        ctx: &RunContext,
    ) -> Result<StageReport> {
        let cancel = ctx.cancellation();
        let mut aggregate = Aggregate::new();

        loop {
            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(HashlineError::Cancelled),
                received = input.recv() => received,
            };
            match received {
                Some(item) => aggregate.push(item.into_canonical()?)?,
                None => break,
            }
        }

        let items_in = aggregate.len() as u64;
        let joined = aggregate.finish(&self.separator)?;
        debug!(stage = self.id(), items_in, bytes = joined.len(), "aggregate emitted");

        output
            .send(Item::Text(joined))
            .await
            .map_err(|_| HashlineError::Closed(self.id().to_string()))?;
        Ok(StageReport::new(self.id(), items_in, 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn aggregate_of(values: &[&str]) -> String {
        let mut aggregate = Aggregate::new();
        for v in values {
            aggregate.push(v.to_string()).unwrap();
        }
        aggregate.finish("_").unwrap()
    }

    #[test]
    fn test_arrival_order_does_not_matter() {
        let values = ["3410~129", "12~7", "b", "a", "b"];
        let expected = aggregate_of(&values);

        let mut reversed = values;
        reversed.reverse();
        assert_eq!(aggregate_of(&reversed), expected);

        let mut rotated = values;
        rotated.rotate_left(2);
        assert_eq!(aggregate_of(&rotated), expected);
    }

    #[test]
    fn test_duplicates_preserved() {
        assert_eq!(aggregate_of(&["b", "a", "b"]), "a_b_b");
    }

    #[test]
    fn test_empty_is_empty_join() {
        assert_eq!(aggregate_of(&[]), "");
    }

    #[test]
    fn test_phases() {
        let mut aggregate = Aggregate::new();
        assert_eq!(aggregate.phase(), AggregatePhase::Idle);
        aggregate.push("x".into()).unwrap();
        assert_eq!(aggregate.phase(), AggregatePhase::Collecting);
        aggregate.finish("_").unwrap();
        assert_eq!(aggregate.phase(), AggregatePhase::Emitted);
        assert!(aggregate.push("y".into()).is_err());
        assert!(aggregate.finish("_").is_err());
    }

    #[tokio::test]
    async fn test_stage_emits_once_after_close() {
        let (in_tx, in_rx) = mpsc::channel(4);
        let (out_tx, mut out_rx) = mpsc::channel(4);
        for v in ["c", "a", "b"] {
            in_tx.send(Item::from(v)).await.unwrap();
        }
        drop(in_tx);

        let stage = CombineResultsStage::new("|");
        let report = stage
            .run(in_rx, out_tx, &RunContext::default())
            .await
            .unwrap();

        assert_eq!(report.items_in, 3);
        assert_eq!(out_rx.recv().await, Some(Item::Text("a|b|c".to_string())));
        assert_eq!(out_rx.recv().await, None);
    }
}

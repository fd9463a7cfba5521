//! Hashline Stages: the signer chain built on `hashline_core`.
//!
//! # Pipeline Flow
//!
//! ```text
//! seed → SingleHash → MultiHash → CombineResults → "r1_r2_…_rn"
//!           ↓             ↓              ↓
//!     c(v)~c(d(v))   c(0v)…c(5v)   sorted + joined
//! ```
//!
//! `c` is a [`Signer`] (any concurrency), `d` an [`ExclusiveSigner`]
//! reached only through its [`DigestGate`].

mod combine_results;
mod multi_hash;
mod signers;
mod single_hash;

pub use combine_results::{Aggregate, AggregatePhase, CombineResultsStage};
pub use multi_hash::{multi_hash, MultiHashStage, MULTI_HASH_ROUNDS};
pub use signers::{
    digest_gate, sign_blocking, sign_gated, Checksum32, DigestGate, ExclusiveSigner,
    ScratchDigest, SignError, Signer,
};
pub use single_hash::{single_hash, SingleHashStage};

use hashline_core::{PipelineConfig, PipelineRunner, Result, Stage};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// CONVENIENCE BUILDERS
// ============================================================================

/// SingleHash → MultiHash → CombineResults over caller-supplied signers.
pub fn signer_stages(
    checksum: Arc<dyn Signer>,
    digest: DigestGate,
    separator: &str,
) -> Vec<Box<dyn Stage>> {
    vec![
        Box::new(SingleHashStage::new(Arc::clone(&checksum), digest)),
        Box::new(MultiHashStage::new(checksum)),
        Box::new(CombineResultsStage::new(separator)),
    ]
}

/// The standard chain with the default signers.
pub fn signer_pipeline(config: &PipelineConfig) -> Result<PipelineRunner> {
    let latency = Duration::from_millis(config.signer_latency_ms);
    PipelineRunner::new(signer_stages(
        Arc::new(Checksum32::with_latency(latency)),
        digest_gate(ScratchDigest::with_latency(latency)),
        &config.separator,
    ))
}

// ============================================================================
// TESTS
// ============================================================================

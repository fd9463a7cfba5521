//! External signing functions consumed by the hash stages.
//!
//! [`Signer`] implementations must tolerate any number of concurrent
//! calls. [`ExclusiveSigner`] implementations keep scratch state between
//! calls and are only ever reached through a [`DigestGate`].

use hashline_core::error::describe_join_error;
use hashline_core::{CancellationToken, HashlineError, Result, SerializingGate};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct SignError(pub String);

/// Pure signer, safe for unlimited concurrent use.
pub trait Signer: Send + Sync {
    fn name(&self) -> &str;

    fn sign(&self, data: &str) -> std::result::Result<String, SignError>;
}

/// Pure signer that must not be entered twice at the same time.
pub trait ExclusiveSigner: Send {
    fn name(&self) -> &str;

    fn sign(&mut self, data: &str) -> std::result::Result<String, SignError>;
}

/// The gate every caller of the exclusive signer shares.
pub type DigestGate = SerializingGate<Box<dyn ExclusiveSigner>>;

pub fn digest_gate<S: ExclusiveSigner + 'static>(signer: S) -> DigestGate {
    let name = signer.name().to_string();
    SerializingGate::new(name, Box::new(signer) as Box<dyn ExclusiveSigner>)
}

/// crc32-shaped checksum: the first four bytes of the blake3 digest as a
/// little-endian `u32`, in decimal.
#[derive(Debug, Clone, Default)]
pub struct Checksum32 {
    latency: Duration,
}

impl Checksum32 {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call sleep first, like a slow remote signer.
    pub fn with_latency(latency: Duration) -> Self {
        Self { latency }
    }
}

impl Signer for Checksum32 {
    fn name(&self) -> &str {
        "checksum32"
    }

    fn sign(&self, data: &str) -> std::result::Result<String, SignError> {
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }
        let hash = blake3::hash(data.as_bytes());
        let bytes = hash.as_bytes();
        let word = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        Ok(word.to_string())
    }
}

/// md5-shaped digest: 32 lowercase hex characters. Reuses one hasher as
/// scratch space, hence `&mut self`.
#[derive(Debug, Clone, Default)]
pub struct ScratchDigest {
    hasher: blake3::Hasher,
    latency: Duration,
}

impl ScratchDigest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }
}

impl ExclusiveSigner for ScratchDigest {
    fn name(&self) -> &str {
        "scratch_digest"
    }

    fn sign(&mut self, data: &str) -> std::result::Result<String, SignError> {
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }
        // A previous call may have unwound halfway through.
        self.hasher.reset();
        self.hasher.update(data.as_bytes());
        let hex = self.hasher.finalize().to_hex();
        Ok(hex.as_str()[..32].to_string())
    }
}

/// Calls a concurrent signer on the blocking pool. A call still queued
/// for a blocking thread when the run is cancelled is skipped.
pub async fn sign_blocking(
    signer: Arc<dyn Signer>,
    data: String,
    cancel: &CancellationToken,
) -> Result<String> {
    let name = signer.name().to_string();
    let token = cancel.clone();
    let joined = tokio::task::spawn_blocking(move || {
        if token.is_cancelled() {
            return None;
        }
        Some(signer.sign(&data))
    })
    .await;
    match joined {
        Ok(Some(Ok(signature))) => Ok(signature),
        Ok(Some(Err(err))) => Err(HashlineError::Sign {
            signer: name,
            message: err.0,
        }),
        Ok(None) => Err(HashlineError::Cancelled),
        Err(e) => Err(HashlineError::Sign {
            signer: name,
            message: describe_join_error(e),
        }),
    }
}

/// Calls the exclusive signer through its gate.
pub async fn sign_gated(
    gate: &DigestGate,
    data: String,
    cancel: &CancellationToken,
) -> Result<String> {
    let signed = gate
        .call(cancel, move |signer| {
            signer
                .sign(&data)
                .map_err(|err| (signer.name().to_string(), err))
        })
        .await?;
    signed.map_err(|(signer, err)| HashlineError::Sign {
        signer,
        message: err.0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Refuses;

    impl Signer for Refuses {
        fn name(&self) -> &str {
            "refuses"
        }

        fn sign(&self, _data: &str) -> std::result::Result<String, SignError> {
            Err(SignError("signer offline".to_string()))
        }
    }

    #[test]
    fn test_checksum_is_decimal_and_stable() {
        let signer = Checksum32::new();
        let a = signer.sign("0").unwrap();
        assert_eq!(a, signer.sign("0").unwrap());
        assert!(a.parse::<u32>().is_ok());
        assert_ne!(a, signer.sign("1").unwrap());
    }

    #[test]
    fn test_scratch_digest_does_not_carry_state() {
        let mut signer = ScratchDigest::new();
        let first = signer.sign("abc").unwrap();
        signer.sign("something else").unwrap();
        assert_eq!(first, signer.sign("abc").unwrap());
        assert_eq!(first.len(), 32);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[tokio::test]
    async fn test_sign_blocking_surfaces_signer_error() {
        let err = sign_blocking(Arc::new(Refuses), "x".to_string(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            HashlineError::Sign {
                signer: "refuses".to_string(),
                message: "signer offline".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_sign_blocking_skips_after_cancel() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = sign_blocking(Arc::new(Checksum32::new()), "x".to_string(), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, HashlineError::Cancelled);
    }

    #[tokio::test]
    async fn test_sign_gated_matches_direct_call() {
        let gate = digest_gate(ScratchDigest::new());
        let cancel = CancellationToken::new();
        let gated = sign_gated(&gate, "abc".to_string(), &cancel).await.unwrap();
        assert_eq!(gated, ScratchDigest::new().sign("abc").unwrap());
        assert_eq!(gate.name(), "scratch_digest");
    }
}

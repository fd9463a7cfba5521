//! Serializing Gate: mutual exclusion around a non-reentrant operation.
//!
//! The gate owns the operation's scratch state, so the only way to touch
//! that state is through [`SerializingGate::call`]. Clones share one lock;
//! hand the same gate to every worker and stage that must be serialized
//! against each other.

use crate::error::{describe_join_error, HashlineError, Result};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::trace;

pub struct SerializingGate<S> {
    name: Arc<str>,
    state: Arc<Mutex<S>>,
}

impl<S> Clone for SerializingGate<S> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            state: Arc::clone(&self.state),
        }
    }
}

impl<S: Send + 'static> SerializingGate<S> {
    pub fn new(name: impl Into<String>, state: S) -> Self {
        Self {
            name: Arc::from(name.into()),
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs `f` with exclusive access to the state.
    ///
    /// Waiting for the lock can be cancelled; once acquired, `f` runs to
    /// completion on the blocking pool. The lock is released when `f`
    /// returns or unwinds, and a panic in `f` comes back as
    /// [`HashlineError::Sign`].
    pub async fn call<F, R>(&self, cancel: &CancellationToken, f: F) -> Result<R>
    where
        F: FnOnce(&mut S) -> R + Send + 'static,
        R: Send + 'static,
    {
        let mut guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(HashlineError::Cancelled),
            guard = Arc::clone(&self.state).lock_owned() => guard,
        };
        trace!(gate = %self.name, "acquired");

        let result = tokio::task::spawn_blocking(move || f(&mut *guard)).await;

        trace!(gate = %self.name, "released");
        result.map_err(|e| HashlineError::Sign {
            signer: self.name.to_string(),
            message: describe_join_error(e),
        })
    }

    /// Whether some caller currently holds the lock.
    pub fn is_held(&self) -> bool {
        self.state.try_lock().is_err()
    }
}

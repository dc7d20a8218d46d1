//! Conditional writes against the shared peer state.

use std::sync::Arc;
use tracing::debug;
use zkctl_core::{mutate, ControllerError, Mutation, PeerState, PeerStateStore, Result, Snapshot};

/// Shared handle to the peer state store used by every component of one
/// unit's controller.
#[derive(Clone)]
pub struct PeerHandle {
    store: Arc<dyn PeerStateStore>,
}

impl PeerHandle {
    pub fn new(store: Arc<dyn PeerStateStore>) -> Self {
        Self { store }
    }

    pub async fn read(&self) -> Result<Snapshot> {
        self.store.read().await
    }

    /// Apply `change` on top of `snapshot` and write it conditionally.
    ///
    /// On success `snapshot` moves to the written version. When another unit
    /// wrote first, `snapshot` is refreshed and `None` is returned; the
    /// caller retries on its next pass.
    pub async fn commit<F, T>(&self, snapshot: &mut Snapshot, change: F) -> Result<Option<T>>
    where
        F: FnOnce(&mut PeerState) -> T,
    {
        match mutate(self.store.as_ref(), snapshot, change).await? {
            Mutation::Unchanged(value) => Ok(Some(value)),
            Mutation::Written(next, value) => {
                *snapshot = next;
                Ok(Some(value))
            }
            Mutation::Conflict { expected, actual } => {
                debug!(
                    "Peer state changed underneath (expected version {}, found {}); retrying next pass",
                    expected, actual
                );
                *snapshot = self.store.read().await?;
                Ok(None)
            }
        }
    }

    /// Like [`commit`](Self::commit), but re-applies `change` on the fresh
    /// state after a lost race, up to `attempts` times. Used for operator
    /// requests that have no later pass to retry on.
    pub async fn commit_with_retry<F, T>(
        &self,
        snapshot: &mut Snapshot,
        attempts: u32,
        mut change: F,
    ) -> Result<T>
    where
        F: FnMut(&mut PeerState) -> T,
    {
        let mut expected = snapshot.version;
        for _ in 0..attempts.max(1) {
            expected = snapshot.version;
            if let Some(value) = self.commit(snapshot, &mut change).await? {
                return Ok(value);
            }
        }
        Err(ControllerError::LockContention {
            expected,
            actual: snapshot.version,
        })
    }
}

impl std::fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerHandle").finish_non_exhaustive()
    }
}

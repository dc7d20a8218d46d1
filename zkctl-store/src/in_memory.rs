use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use zkctl_core::{CasOutcome, PeerState, PeerStateStore, Result, Snapshot};

/// In-memory peer state shared by every handle cloned from it.
///
/// Suitable for tests and single-process simulations. Each successful
/// compare-and-write bumps the version by one and is counted, so callers can
/// assert that a pass performed no writes.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPeerStore {
    snapshot: Arc<RwLock<Snapshot>>,
    writes: Arc<AtomicU64>,
}

impl InMemoryPeerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store, e.g. to resume a simulated ensemble.
    pub fn with_state(state: PeerState) -> Self {
        Self {
            snapshot: Arc::new(RwLock::new(Snapshot { version: 0, state })),
            writes: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn version(&self) -> u64 {
        self.snapshot.read().version
    }

    /// Successful writes since creation.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> PeerState {
        self.snapshot.read().state.clone()
    }
}

#[async_trait]
impl PeerStateStore for InMemoryPeerStore {
    async fn read(&self) -> Result<Snapshot> {
        Ok(self.snapshot.read().clone())
    }

    async fn compare_and_write(&self, expected: u64, state: &PeerState) -> Result<CasOutcome> {
        let mut current = self.snapshot.write();
        if current.version != expected {
            return Ok(CasOutcome::Conflict {
                actual: current.version,
            });
        }

        current.version += 1;
        current.state = state.clone();
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(CasOutcome::Written {
            version: current.version,
        })
    }
}

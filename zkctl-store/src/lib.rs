//! # zkctl Store
//!
//! Peer-state stores and the unit's data volume.
//!
//! ## Implementations
//!
//! - [`InMemoryPeerStore`] - Shared blob held in memory (tests, simulation)
//! - [`FileSystemPeerStore`] - Checksummed blob in a file, atomic replace
//! - [`DataVolume`] - Snapshot/log directories and the rendered config files
//!
//! ## Example
//!
//! ```rust
//! use zkctl_store::InMemoryPeerStore;
//! use zkctl_core::{PeerStateStore, CasOutcome, UnitId};
//!
//! # tokio_test::block_on(async {
//! let store = InMemoryPeerStore::new();
//! let mut snapshot = store.read().await.unwrap();
//! snapshot.state.unit_mut(UnitId::new(0)).address = Some("zk-0".to_string());
//!
//! let outcome = store.compare_and_write(snapshot.version, &snapshot.state).await.unwrap();
//! assert_eq!(outcome, CasOutcome::Written { version: 1 });
//!
//! // A second writer still holding version 0 loses
//! let outcome = store.compare_and_write(0, &snapshot.state).await.unwrap();
//! assert_eq!(outcome, CasOutcome::Conflict { actual: 1 });
//! # });
//! ```

pub mod data_volume;
pub mod file_system;
pub mod in_memory;
mod tests;

pub use data_volume::DataVolume;
pub use file_system::FileSystemPeerStore;
pub use in_memory::InMemoryPeerStore;

//! # zkctl Core - Ensemble Controller Model
//!
//! Shared building blocks of the zkctl controller, which keeps a live
//! ZooKeeper ensemble quorum-safe while units are scaled, restarted and
//! re-keyed.
//!
//! ## Components
//!
//! - **Identifiers**: `UnitId`, `ConfigVersion`, `CredentialEpoch`, `OpToken`
//! - **Ensemble Model**: units, roles, health and quorum arithmetic
//! - **Peer State**: the shared versioned blob and the compare-and-write
//!   `PeerStateStore` contract
//! - **Rolling Operations**: config changes and serialized per-unit operations
//! - **Credentials and Certificates**: rotation state and the signing contract
//! - **Collaborators**: `Workload`, `CertificateAuthority` and `Clock` traits
//! - **Rendering**: the ZooKeeper properties, dynamic, JAAS and `myid` files
//!
//! ## Optimistic Writes
//!
//! Every change to the peer state goes through [`mutate`], which writes only
//! when the state actually changed and only if nobody wrote in between:
//!
//! ```rust
//! use zkctl_core::{mutate, Mutation, PeerState, PeerStateStore, Snapshot, CasOutcome, Result, UnitId};
//! use async_trait::async_trait;
//! use std::sync::Mutex;
//!
//! #[derive(Default)]
//! struct Blob(Mutex<Snapshot>);
//!
//! #[async_trait]
//! impl PeerStateStore for Blob {
//!     async fn read(&self) -> Result<Snapshot> {
//!         Ok(self.0.lock().unwrap().clone())
//!     }
//!
//!     async fn compare_and_write(&self, expected: u64, state: &PeerState) -> Result<CasOutcome> {
//!         let mut current = self.0.lock().unwrap();
//!         if current.version != expected {
//!             return Ok(CasOutcome::Conflict { actual: current.version });
//!         }
//!         current.version += 1;
//!         current.state = state.clone();
//!         Ok(CasOutcome::Written { version: current.version })
//!     }
//! }
//!
//! # tokio_test::block_on(async {
//! let store = Blob::default();
//! let snapshot = store.read().await?;
//! let result = mutate(&store, &snapshot, |state| {
//!     state.unit_mut(UnitId::new(0)).address = Some("zk-0".to_string());
//! })
//! .await?;
//! assert!(matches!(result, Mutation::Written(ref s, ()) if s.version == 1));
//! # Ok::<(), zkctl_core::ControllerError>(())
//! # }).unwrap();
//! ```

pub mod certificate;
pub mod clock;
pub mod config;
pub mod credential;
pub mod ensemble;
pub mod error;
pub mod operations;
pub mod peer_state;
pub mod types;
pub mod workload;
pub mod zookeeper_config;

pub use certificate::*;
pub use clock::*;
pub use config::{ControllerConfig, ExposeExternal, LogLevel};
pub use credential::*;
pub use ensemble::*;
pub use error::*;
pub use operations::*;
pub use peer_state::*;
pub use types::*;
pub use workload::*;
pub use zookeeper_config::*;

//! # zkctl Controller
//!
//! The per-unit controller that keeps a ZooKeeper ensemble quorum-safe while
//! it is resized, restarted, re-keyed and re-certified.
//!
//! Every unit runs one [`Reconciler`]. The units share nothing but a
//! versioned peer-state blob, written with compare-and-write; one unit at a
//! time is elected planner and turns desired membership, settings,
//! credentials and TLS into rolling operations that every unit then applies
//! to itself, one unit at a time.
//!
//! ## Key Components
//!
//! - **ClusterView**: observed ensemble derived from the peer state
//! - **QuorumConfigBuilder**: one quorum-safe membership step per pass
//! - **RollingOpsCoordinator**: lock, apply, verify, retry and escalate
//! - **CredentialManager**: two-phase rotation of the internal accounts
//! - **TlsCoordinator**: certificate requests, staging and cutover
//! - **Reconciler**: the event-driven loop tying the components together
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tokio::sync::mpsc;
//! use zkctl_controller::{ControllerCommand, DesiredMembership, Event, Reconciler};
//! use zkctl_core::{CertificateAuthority, ControllerConfig, SystemClock, UnitId, Workload};
//! use zkctl_store::InMemoryPeerStore;
//!
//! async fn start(workload: Arc<dyn Workload>, authority: Arc<dyn CertificateAuthority>) {
//!     let store = Arc::new(InMemoryPeerStore::new());
//!     let reconciler = Reconciler::new(
//!         UnitId::new(0),
//!         "zk-0.zookeeper-endpoints",
//!         ControllerConfig::new(),
//!         store,
//!         workload,
//!         authority,
//!         Arc::new(SystemClock),
//!     );
//!     let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
//!
//!     // Start the controller
//!     let handle = tokio::spawn(reconciler.run(cmd_rx));
//!
//!     cmd_tx
//!         .send(ControllerCommand::Event(Event::MembershipChanged(
//!             DesiredMembership::voters(0..3),
//!         )))
//!         .unwrap();
//!     cmd_tx.send(ControllerCommand::Shutdown).unwrap();
//!     handle.await.unwrap().unwrap();
//! }
//! ```

pub mod actions;
pub mod cluster_view;
pub mod credentials;
pub mod events;
pub mod peer;
pub mod provider;
pub mod quorum;
pub mod reconcile;
pub mod render;
pub mod rolling;
pub mod status;
pub mod telemetry;
pub mod tls;

pub use actions::*;
pub use cluster_view::*;
pub use credentials::*;
pub use events::*;
pub use peer::*;
pub use provider::*;
pub use quorum::*;
pub use reconcile::*;
pub use render::*;
pub use rolling::*;
pub use status::*;
pub use telemetry::*;
pub use tls::*;

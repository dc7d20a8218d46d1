pub mod authority;
pub mod fault_injection;
pub mod harness;
pub mod workload_sim;

pub use authority::MockAuthority;
pub use fault_injection::FaultType;
pub use harness::{read_state, EnsembleHarness, ObservedOp, Observations};
pub use workload_sim::{ServerState, SimulatedCluster, SimulatedWorkload};

use scaleio_scheduler::state::NodeState;
use thiserror::Error;

pub mod coordinator;
pub mod host;
pub mod lifecycle;
pub mod setup;

pub use coordinator::{Coordinator, CoordinatorError, LocalCoordinator};
pub use host::{Host, HostError, SystemHost};
pub use lifecycle::{NodeLifecycle, Step};
pub use setup::{NodeSetup, OsFamily, Provisioner, SetupError, SetupOutcome};

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Coordinator request failed: {0}")]
    Coordinator(#[from] CoordinatorError),

    #[error("Setup failed: {0}")]
    Setup(#[from] SetupError),

    #[error("Host operation failed: {0}")]
    Host(#[from] HostError),

    #[error("Timed out waiting for the {barrier} barrier ({target})")]
    BarrierTimeout { barrier: &'static str, target: NodeState },

    #[error("Node {0} is not part of the cluster")]
    UnknownNode(String),
}

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

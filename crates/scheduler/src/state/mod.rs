//! State Module - Datenstrukturen für Nodes und Cluster
//!
//! - `Node`, `Persona`, `NodeState`: ein einzelner Rechner und seine Phase
//! - `ClusterState`: Snapshot aller Nodes plus Cluster-Konfiguration
//! - `Cluster`: geteilter Handle mit expliziten Merge-Operationen

mod cluster;
mod node;

pub use cluster::{Cluster, ClusterState, Preconfig, ScaleIo};
pub use node::{Node, NodeState, Persona};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("Node {0} is already registered")]
    DuplicateNode(String),

    #[error("Unknown node: {0}")]
    UnknownNode(String),

    #[error("Node {hostname} cannot go back from {current} to {requested}")]
    PhaseRegression {
        hostname: String,
        current: NodeState,
        requested: NodeState,
    },

    #[error("No ScaleIO gateway address known")]
    NoGateway,
}

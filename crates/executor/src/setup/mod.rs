//! Setup - Installationsschritte eines Nodes
//!
//! Jeder Schritt bekommt einen Snapshot des Clusters und den eigenen Node.
//! Was ein Schritt tatsächlich tut, hängt von der Persona ab: Manager
//! installieren das MDM-Paket, primary und secondary zusätzlich das Gateway.

mod download;
mod os;
mod provisioner;

pub use download::download;
pub use os::OsFamily;
pub use provisioner::{Provisioner, REQUIRED_KERNEL};

use async_trait::async_trait;
use scaleio_scheduler::state::{ClusterState, Node, StateError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Download of {url} failed with status {status}")]
    Download { url: String, status: u16 },

    #[error("Command '{command}' failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("Command '{command}' did not report '{expected}'")]
    UnexpectedOutput { command: String, expected: &'static str },

    #[error("No {package} package configured for {family}")]
    MissingPackage { package: &'static str, family: OsFamily },

    #[error("Unsupported operating system: {0}")]
    UnsupportedOs(String),

    #[error("No manager addresses known yet")]
    NoManagers,

    #[error(transparent)]
    State(#[from] StateError),
}

/// Ergebnis eines Schritts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetupOutcome {
    pub reboot_required: bool,
}

impl SetupOutcome {
    pub fn done() -> Self {
        Self::default()
    }

    pub fn reboot() -> Self {
        Self { reboot_required: true }
    }
}

#[async_trait]
pub trait NodeSetup: Send + Sync {
    /// Betriebssystem-Voraussetzungen (Pakete, Kernel).
    async fn environment_setup(&self, cluster: &ClusterState, node: &Node) -> Result<SetupOutcome, SetupError>;

    /// MDM-Paket, nur für Manager.
    async fn management_setup(&self, cluster: &ClusterState, node: &Node) -> Result<SetupOutcome, SetupError>;

    /// SDS, SDC und LIA.
    async fn node_setup(&self, cluster: &ClusterState, node: &Node) -> Result<SetupOutcome, SetupError>;

    /// Gateway, nur für primary und secondary.
    async fn gateway_setup(&self, cluster: &ClusterState, node: &Node) -> Result<SetupOutcome, SetupError>;

    /// REX-Ray Volume-Treiber.
    async fn driver_setup(&self, cluster: &ClusterState, node: &Node) -> Result<SetupOutcome, SetupError>;

    /// Isolator für den Volume-Treiber.
    async fn isolator_setup(&self, cluster: &ClusterState, node: &Node) -> Result<SetupOutcome, SetupError>;
}

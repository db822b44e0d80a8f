//! Persistent key-value model of the framework.
//!
//! Everything the scheduler must remember across restarts lives here:
//! the role and phase of every host, the shadow metadata per host and the
//! cluster-wide `configured` flag.

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::reconcile::ShadowMetadata;
use crate::state::{NodeState, Persona};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store document is invalid: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Persisted role and phase of one host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub persona: Persona,
    pub state: NodeState,
}

impl NodeInfo {
    pub fn new(persona: Persona, state: NodeState) -> Self {
        Self { persona, state }
    }
}

/// Hostnames holding the manager roles.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MdmNodes {
    pub primary: Option<String>,
    pub secondary: Option<String>,
    pub tiebreaker: Option<String>,
}

impl MdmNodes {
    pub fn get(&self, persona: Persona) -> Option<&str> {
        match persona {
            Persona::MdmPrimary => self.primary.as_deref(),
            Persona::MdmSecondary => self.secondary.as_deref(),
            Persona::TieBreaker => self.tiebreaker.as_deref(),
            _ => None,
        }
    }
}

#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn node_info(&self, hostname: &str) -> Result<Option<NodeInfo>, StoreError>;

    async fn set_node_info(&self, hostname: &str, info: NodeInfo) -> Result<(), StoreError>;

    async fn mdm_nodes(&self) -> Result<MdmNodes, StoreError>;

    async fn metadata(&self, hostname: &str) -> Result<Option<ShadowMetadata>, StoreError>;

    async fn set_metadata(&self, hostname: &str, metadata: &ShadowMetadata) -> Result<(), StoreError>;

    async fn configured(&self) -> Result<bool, StoreError>;

    async fn set_configured(&self, configured: bool) -> Result<(), StoreError>;
}

/// The whole persisted namespace of one framework role.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct StoreDocument {
    #[serde(default)]
    pub configured: bool,
    #[serde(default)]
    pub nodes: BTreeMap<String, NodeInfo>,
    #[serde(default)]
    pub metadata: BTreeMap<String, ShadowMetadata>,
}

impl StoreDocument {
    pub fn mdm_nodes(&self) -> MdmNodes {
        let holder = |persona: Persona| {
            self.nodes
                .iter()
                .find(|(_, info)| info.persona == persona)
                .map(|(hostname, _)| hostname.clone())
        };

        MdmNodes {
            primary: holder(Persona::MdmPrimary),
            secondary: holder(Persona::MdmSecondary),
            tiebreaker: holder(Persona::TieBreaker),
        }
    }
}

use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::{MdmNodes, MetadataStore, NodeInfo, StoreDocument, StoreError};
use crate::reconcile::ShadowMetadata;

/// Non-persistent store, lost on restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    document: Mutex<StoreDocument>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn document(&self) -> MutexGuard<'_, StoreDocument> {
        self.document.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl MetadataStore for MemoryStore {
    async fn node_info(&self, hostname: &str) -> Result<Option<NodeInfo>, StoreError> {
        Ok(self.document().nodes.get(hostname).copied())
    }

    async fn set_node_info(&self, hostname: &str, info: NodeInfo) -> Result<(), StoreError> {
        self.document().nodes.insert(hostname.to_string(), info);
        Ok(())
    }

    async fn mdm_nodes(&self) -> Result<MdmNodes, StoreError> {
        Ok(self.document().mdm_nodes())
    }

    async fn metadata(&self, hostname: &str) -> Result<Option<ShadowMetadata>, StoreError> {
        Ok(self.document().metadata.get(hostname).cloned())
    }

    async fn set_metadata(&self, hostname: &str, metadata: &ShadowMetadata) -> Result<(), StoreError> {
        self.document()
            .metadata
            .insert(hostname.to_string(), metadata.clone());
        Ok(())
    }

    async fn configured(&self) -> Result<bool, StoreError> {
        Ok(self.document().configured)
    }

    async fn set_configured(&self, configured: bool) -> Result<(), StoreError> {
        self.document().configured = configured;
        Ok(())
    }
}

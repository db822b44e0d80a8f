use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use super::{MdmNodes, MetadataStore, NodeInfo, StoreDocument, StoreError};
use crate::reconcile::ShadowMetadata;

/// JSON document per framework role at `<dir>/<role>.json`.
///
/// The document is cached in memory and rewritten on every mutation
/// through a temp file plus rename.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    document: Mutex<StoreDocument>,
}

impl FileStore {
    pub async fn open(dir: &Path, framework_role: &str) -> Result<Self, StoreError> {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(format!("{framework_role}.json"));

        let document = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreDocument::default(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), "opened metadata store");

        Ok(Self {
            path,
            document: Mutex::new(document),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, document: &StoreDocument) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(document)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for FileStore {
    async fn node_info(&self, hostname: &str) -> Result<Option<NodeInfo>, StoreError> {
        Ok(self.document.lock().await.nodes.get(hostname).copied())
    }

    async fn set_node_info(&self, hostname: &str, info: NodeInfo) -> Result<(), StoreError> {
        let mut document = self.document.lock().await;
        document.nodes.insert(hostname.to_string(), info);
        self.persist(&document).await
    }

    async fn mdm_nodes(&self) -> Result<MdmNodes, StoreError> {
        Ok(self.document.lock().await.mdm_nodes())
    }

    async fn metadata(&self, hostname: &str) -> Result<Option<ShadowMetadata>, StoreError> {
        Ok(self.document.lock().await.metadata.get(hostname).cloned())
    }

    async fn set_metadata(&self, hostname: &str, metadata: &ShadowMetadata) -> Result<(), StoreError> {
        let mut document = self.document.lock().await;
        document.metadata.insert(hostname.to_string(), metadata.clone());
        self.persist(&document).await
    }

    async fn configured(&self) -> Result<bool, StoreError> {
        Ok(self.document.lock().await.configured)
    }

    async fn set_configured(&self, configured: bool) -> Result<(), StoreError> {
        let mut document = self.document.lock().await;
        document.configured = configured;
        self.persist(&document).await
    }
}

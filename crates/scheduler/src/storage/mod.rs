//! Client interface of the ScaleIO control plane.
//!
//! Reconciliation only talks to [`StorageBackend`] and [`StorageSession`].
//! [`RestStorageBackend`] implements them against the gateway REST API,
//! tests use the mock from `test_utils`.

mod rest;

pub use rest::{RestSession, RestStorageBackend};

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Gateway returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Storage call rejected: {0}")]
    Rejected(String),
}

/// Handle to an object in the storage system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRef {
    pub id: String,
    pub name: String,
}

impl ObjectRef {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdsSpec {
    pub name: String,
    pub ips: Vec<String>,
    pub modes: Vec<String>,
    pub fault_set: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[async_trait]
pub trait StorageBackend: Send + Sync {
    type Session: StorageSession;

    async fn authenticate(
        &self,
        endpoint: &str,
        api_version: &str,
        credentials: &Credentials,
    ) -> Result<Self::Session, StorageError>;
}

/// Authenticated session. Lookups return `Ok(None)` when nothing matches.
#[async_trait]
pub trait StorageSession: Send + Sync {
    /// Finds the system by id or name. Both empty matches a single system.
    async fn find_system(&self, id: &str, name: &str) -> Result<Option<ObjectRef>, StorageError>;

    async fn find_protection_domain(
        &self,
        system: &ObjectRef,
        name: &str,
    ) -> Result<Option<ObjectRef>, StorageError>;

    async fn create_protection_domain(&self, system: &ObjectRef, name: &str) -> Result<ObjectRef, StorageError>;

    async fn remove_protection_domain(&self, domain: &ObjectRef) -> Result<(), StorageError>;

    async fn find_sds(&self, domain: &ObjectRef, name: &str) -> Result<Option<ObjectRef>, StorageError>;

    async fn create_sds(&self, domain: &ObjectRef, spec: &SdsSpec) -> Result<ObjectRef, StorageError>;

    async fn remove_sds(&self, sds: &ObjectRef) -> Result<(), StorageError>;

    async fn find_storage_pool(&self, domain: &ObjectRef, name: &str) -> Result<Option<ObjectRef>, StorageError>;

    async fn create_storage_pool(&self, domain: &ObjectRef, name: &str) -> Result<ObjectRef, StorageError>;

    async fn remove_storage_pool(&self, pool: &ObjectRef) -> Result<(), StorageError>;

    async fn find_device(&self, pool: &ObjectRef, path: &str) -> Result<Option<ObjectRef>, StorageError>;

    async fn attach_device(&self, pool: &ObjectRef, path: &str, sds_id: &str) -> Result<ObjectRef, StorageError>;

    async fn detach_device(&self, device: &ObjectRef) -> Result<(), StorageError>;
}

//! Coordinator - Verbindung des Node-Agents zum Scheduler
//!
//! Der Agent liest den Cluster-Zustand nur über Snapshots und meldet
//! Phasen, Devices und Lebenszeichen zurück.

use std::sync::Arc;

use async_trait::async_trait;
use scaleio_scheduler::state::{ClusterState, NodeState};
use scaleio_scheduler::storage::StorageBackend;
use scaleio_scheduler::store::MetadataStore;
use scaleio_scheduler::topology::Topology;
use scaleio_scheduler::{SchedulerError, ScaleIoScheduler};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("Scheduler rejected the request: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Node {0} is not known to the scheduler")]
    UnknownNode(String),
}

#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Snapshot des gesamten Clusters.
    async fn cluster_state(&self) -> Result<ClusterState, CoordinatorError>;

    /// Meldet die neue Phase. Rückschritte werden vom Scheduler abgelehnt.
    async fn update_node_state(&self, hostname: &str, state: NodeState) -> Result<(), CoordinatorError>;

    async fn advertise_devices(&self, hostname: &str, topology: Topology) -> Result<(), CoordinatorError>;

    /// Meldet die auf dem Host ermittelte IP-Adresse.
    async fn set_ip_address(&self, hostname: &str, ip: &str) -> Result<(), CoordinatorError>;

    async fn ping(&self, hostname: &str) -> Result<(), CoordinatorError>;
}

/// Coordinator im selben Prozess wie der Scheduler.
pub struct LocalCoordinator<S: MetadataStore, B: StorageBackend> {
    scheduler: Arc<ScaleIoScheduler<S, B>>,
}

impl<S: MetadataStore, B: StorageBackend> LocalCoordinator<S, B> {
    pub fn new(scheduler: Arc<ScaleIoScheduler<S, B>>) -> Self {
        Self { scheduler }
    }
}

impl<S: MetadataStore, B: StorageBackend> Clone for LocalCoordinator<S, B> {
    fn clone(&self) -> Self {
        Self {
            scheduler: Arc::clone(&self.scheduler),
        }
    }
}

#[async_trait]
impl<S: MetadataStore, B: StorageBackend> Coordinator for LocalCoordinator<S, B> {
    async fn cluster_state(&self) -> Result<ClusterState, CoordinatorError> {
        Ok(self.scheduler.snapshot())
    }

    async fn update_node_state(&self, hostname: &str, state: NodeState) -> Result<(), CoordinatorError> {
        self.scheduler.update_node_state(hostname, state).await?;
        Ok(())
    }

    async fn advertise_devices(&self, hostname: &str, topology: Topology) -> Result<(), CoordinatorError> {
        self.scheduler.advertise_devices(hostname, topology)?;
        Ok(())
    }

    async fn set_ip_address(&self, hostname: &str, ip: &str) -> Result<(), CoordinatorError> {
        self.scheduler.set_ip_address(hostname, ip)?;
        Ok(())
    }

    async fn ping(&self, hostname: &str) -> Result<(), CoordinatorError> {
        self.scheduler.ping(hostname)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scaleio_config::Config;
    use scaleio_scheduler::state::StateError;
    use scaleio_scheduler::test_utils::{offer, MemoryStore, MockStorage};

    async fn coordinator() -> LocalCoordinator<MemoryStore, MockStorage> {
        let scheduler = ScaleIoScheduler::new(
            Config::default(),
            Arc::new(MemoryStore::new()),
            Arc::new(MockStorage::new()),
        );
        scheduler
            .resource_offers(&[
                offer("a", "10.0.0.1", 4.0, 8192.0),
                offer("b", "10.0.0.2", 4.0, 8192.0),
                offer("c", "10.0.0.3", 4.0, 8192.0),
            ])
            .await
            .unwrap();
        LocalCoordinator::new(Arc::new(scheduler))
    }

    #[tokio::test]
    async fn test_updates_are_visible_in_snapshot() {
        let coordinator = coordinator().await;

        coordinator
            .update_node_state("a", NodeState::CleanPrereqsReboot)
            .await
            .unwrap();
        coordinator.ping("a").await.unwrap();

        let state = coordinator.cluster_state().await.unwrap();
        assert_eq!(state.nodes["a"].state, NodeState::CleanPrereqsReboot);
        assert!(state.nodes["a"].last_contact > 0);
    }

    #[tokio::test]
    async fn test_regression_is_rejected() {
        let coordinator = coordinator().await;
        coordinator
            .update_node_state("a", NodeState::InitializeCluster)
            .await
            .unwrap();

        let err = coordinator
            .update_node_state("a", NodeState::Unknown)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            CoordinatorError::Scheduler(SchedulerError::State(StateError::PhaseRegression { .. }))
        ));
    }

    #[tokio::test]
    async fn test_advertise_sets_flag() {
        let coordinator = coordinator().await;

        coordinator
            .advertise_devices("b", Topology::single_pool("default", "default", vec!["/dev/sdb".into()]))
            .await
            .unwrap();

        let state = coordinator.cluster_state().await.unwrap();
        assert!(state.nodes["b"].advertised);
        assert_eq!(state.nodes["b"].provides.devices().collect::<Vec<_>>(), vec!["/dev/sdb"]);
    }

    #[tokio::test]
    async fn test_reported_ip_replaces_offer_ip() {
        let coordinator = coordinator().await;

        coordinator.set_ip_address("c", "192.168.1.30").await.unwrap();

        let state = coordinator.cluster_state().await.unwrap();
        assert_eq!(state.nodes["c"].ip_address, "192.168.1.30");
    }
}

use std::sync::Arc;

use scaleio_config::Config;
use thiserror::Error;
use tracing::{info, warn};

pub mod controller;
pub mod offer;
pub mod reconcile;
pub mod selection;
pub mod state;
pub mod storage;
pub mod store;
pub mod topology;

use controller::{ControlLoop, PhaseBarrier};
use offer::Offer;
use reconcile::ReconcileError;
use selection::{SelectionError, SelectionReport};
use state::{Cluster, ClusterState, NodeState, ScaleIo, StateError};
use storage::StorageBackend;
use store::{MetadataStore, NodeInfo, StoreError};
use topology::Topology;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Role selection failed: {0}")]
    Selection(#[from] SelectionError),

    #[error("Reconciliation failed: {0}")]
    Reconcile(#[from] ReconcileError),

    #[error("Metadata store failed: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    State(#[from] StateError),
}

// ============================================================================
// ScaleIoScheduler - Einstiegspunkt für Offers und Node-Meldungen
// ============================================================================

/// Der zentrale Koordinator.
///
/// Hält den geteilten Cluster-Zustand, den Metadata Store und den
/// Storage-Client. Alle Mutationen laufen über [`Cluster`], I/O findet
/// immer außerhalb des Locks statt.
pub struct ScaleIoScheduler<S: MetadataStore, B: StorageBackend> {
    cluster: Cluster,
    store: Arc<S>,
    backend: Arc<B>,
    config: Config,
}

impl<S: MetadataStore, B: StorageBackend> ScaleIoScheduler<S, B> {
    pub fn new(config: Config, store: Arc<S>, backend: Arc<B>) -> Self {
        let cluster = Cluster::new(ClusterState::new(ScaleIo::from_config(&config)));
        Self {
            cluster,
            store,
            backend,
            config,
        }
    }

    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn snapshot(&self) -> ClusterState {
        self.cluster.snapshot()
    }

    /// Verarbeitet eine Runde Offers: Rollen vergeben, Data Nodes aufnehmen.
    pub async fn resource_offers(&self, offers: &[Offer]) -> Result<SelectionReport, SchedulerError> {
        let preconfig = self.cluster.snapshot().scaleio.preconfig;
        let report = selection::perform_node_selection(
            &self.cluster,
            self.store.as_ref(),
            offers,
            &preconfig,
            &self.config.selection,
        )
        .await?;

        for (persona, hostname) in &report.managers {
            info!(hostname = %hostname, %persona, "manager assigned");
        }
        Ok(report)
    }

    /// Übernimmt die von einem Node gemeldete Phase und persistiert sie.
    pub async fn update_node_state(&self, hostname: &str, state: NodeState) -> Result<(), SchedulerError> {
        let node = self.cluster.set_node_state(hostname, state)?;
        self.store
            .set_node_info(hostname, NodeInfo::new(node.persona, node.state))
            .await?;
        info!(hostname, state = %state, "node state updated");
        Ok(())
    }

    pub fn advertise_devices(&self, hostname: &str, topology: Topology) -> Result<(), SchedulerError> {
        let devices = topology.devices().count();
        self.cluster.advertise_devices(hostname, topology)?;
        info!(hostname, devices, "node advertised devices");
        Ok(())
    }

    pub fn set_ip_address(&self, hostname: &str, ip: &str) -> Result<(), SchedulerError> {
        self.cluster.set_ip_address(hostname, ip)?;
        Ok(())
    }

    pub fn ping(&self, hostname: &str) -> Result<(), SchedulerError> {
        self.cluster.ping(hostname)?;
        Ok(())
    }

    /// Baut den Control Loop. Ein bereits konfigurierter Cluster startet
    /// direkt im Steady-State.
    pub async fn control_loop(&self) -> ControlLoop<S, B> {
        let target = controller::RESOURCE_PHASE;
        let barrier = match self.store.configured().await {
            Ok(true) => PhaseBarrier::already_fired(target),
            Ok(false) => PhaseBarrier::new(target),
            Err(e) => {
                warn!(error = %e, "cannot read configured flag, waiting for barrier");
                PhaseBarrier::new(target)
            }
        };

        ControlLoop::new(
            self.cluster.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.backend),
            barrier,
            self.config.scheduler.steady_state_reconcile,
            self.config.scheduler.poll_status(),
        )
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

//! ControlLoop - Bringt Reconciliation und Node-Phasen zusammen
//!
//! Pro Iteration:
//! 1. Snapshot des Cluster-Zustands (Lock nur für die Kopie)
//! 2. Barriere prüfen: stehen alle Nodes auf `AddResourcesToScaleIO`?
//! 3. Falls ja: Reconciliation gegen den Snapshot, dann Bulk-Advance auf `InstallRexRay`
//! 4. Danach: Steady-State Reconciliation in jeder Iteration, nur für Nodes
//!    ab `AddResourcesToScaleIO`

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::barrier::PhaseBarrier;
use crate::reconcile::{reconcile, ReconcileReport};
use crate::state::{Cluster, NodeState};
use crate::storage::StorageBackend;
use crate::store::{MetadataStore, NodeInfo};
use crate::SchedulerError;

/// Phase, auf die alle Nodes warten, bevor Ressourcen angelegt werden.
pub const RESOURCE_PHASE: NodeState = NodeState::AddResourcesToScaleIO;
/// Phase nach dem Anlegen der Ressourcen.
pub const RELEASE_PHASE: NodeState = NodeState::InstallRexRay;

/// Ergebnis einer Iteration.
#[derive(Debug)]
pub enum TickOutcome {
    /// Barriere noch nicht erreicht
    Waiting,
    /// Barriere hat gefeuert
    Released {
        report: Option<ReconcileReport>,
        advanced: Vec<String>,
    },
    /// Reconciliation nach der Barriere
    SteadyState {
        report: ReconcileReport,
        advanced: Vec<String>,
    },
    /// Barriere gefeuert, Steady-State deaktiviert
    Idle,
}

pub struct ControlLoop<S: MetadataStore, B: StorageBackend> {
    cluster: Cluster,
    store: Arc<S>,
    backend: Arc<B>,
    barrier: PhaseBarrier,
    steady_state: bool,
    interval: Duration,
}

impl<S: MetadataStore, B: StorageBackend> ControlLoop<S, B> {
    pub fn new(
        cluster: Cluster,
        store: Arc<S>,
        backend: Arc<B>,
        barrier: PhaseBarrier,
        steady_state: bool,
        interval: Duration,
    ) -> Self {
        Self {
            cluster,
            store,
            backend,
            barrier,
            steady_state,
            interval,
        }
    }

    pub fn barrier(&self) -> &PhaseBarrier {
        &self.barrier
    }

    /// Führt eine Iteration aus.
    pub async fn tick(&mut self) -> Result<TickOutcome, SchedulerError> {
        let snapshot = self.cluster.snapshot();

        if self.barrier.check(&snapshot) {
            info!(nodes = snapshot.nodes.len(), "all nodes ready, adding resources to ScaleIO");

            let report = match reconcile(&snapshot, self.store.as_ref(), self.backend.as_ref()).await {
                Ok(report) => Some(report),
                Err(e) => {
                    error!(error = %e, "adding resources to ScaleIO failed");
                    None
                }
            };

            // Die Nodes werden auch nach einem Fehlschlag freigegeben
            let advanced = self.cluster.advance_all(RELEASE_PHASE);
            if let Err(e) = self.store.set_configured(true).await {
                warn!(error = %e, "failed to persist configured flag");
            }
            self.persist_phases(&advanced).await;

            return Ok(TickOutcome::Released { report, advanced });
        }

        if !self.barrier.has_fired() {
            debug!("waiting for all nodes to reach {}", self.barrier.target());
            return Ok(TickOutcome::Waiting);
        }

        if !self.steady_state {
            return Ok(TickOutcome::Idle);
        }

        // Nur Nodes, deren Pakete installiert sind
        let mut ready = snapshot;
        ready
            .nodes
            .retain(|_, n| n.state >= RESOURCE_PHASE && !n.state.is_fatal());

        let report = reconcile(&ready, self.store.as_ref(), self.backend.as_ref()).await?;

        // Nachzügler, die nach der Barriere auf RESOURCE_PHASE angekommen sind
        let advanced = self.cluster.advance_waiting(RESOURCE_PHASE, RELEASE_PHASE);
        self.persist_phases(&advanced).await;

        Ok(TickOutcome::SteadyState { report, advanced })
    }

    /// Schreibt die aktuelle Phase der Nodes, die inzwischen auch weiter
    /// als die Freigabe sein kann.
    async fn persist_phases(&self, hostnames: &[String]) {
        let snapshot = self.cluster.snapshot();
        for hostname in hostnames {
            let Some(node) = snapshot.node(hostname) else {
                continue;
            };
            let info = NodeInfo::new(node.persona, node.state);
            if let Err(e) = self.store.set_node_info(hostname, info).await {
                warn!(hostname = %hostname, error = %e, "failed to persist node state");
            }
        }
    }

    /// Läuft endlos. Fehler einer Iteration werden geloggt.
    pub async fn run(mut self) {
        loop {
            sleep(self.interval).await;

            match self.tick().await {
                Ok(TickOutcome::Released { advanced, .. }) => {
                    info!(advanced = advanced.len(), "released nodes to {}", RELEASE_PHASE);
                }
                Ok(TickOutcome::SteadyState { report, advanced }) => {
                    for (hostname, e) in report.failed() {
                        warn!(hostname = %hostname, error = %e, "steady state reconciliation failed");
                    }
                    if !advanced.is_empty() {
                        info!(advanced = advanced.len(), "released late nodes to {}", RELEASE_PHASE);
                    }
                }
                Ok(TickOutcome::Waiting) | Ok(TickOutcome::Idle) => {}
                Err(e) => error!(error = %e, "control loop iteration failed"),
            }
        }
    }
}

//! NodeLifecycle - Installations-Zustandsmaschine eines Nodes
//!
//! Jede Iteration liest einen frischen Snapshot, meldet ein Lebenszeichen
//! und führt die Aktion der aktuellen Phase aus. Phasen werden nur über
//! den Coordinator geändert, der Rückschritte ablehnt.
//!
//! Ablauf:
//! 1. `Unknown`: IP-Adresse melden, Betriebssystem vorbereiten
//! 2. Barrieren zwischen den Installationsschritten: alle Nodes müssen
//!    mindestens die Phase erreicht haben
//! 3. `AddResourcesToScaleIO`: warten, bis der Control Loop freigibt
//! 4. Treiber installieren, eventuell neu starten, dann `FinishInstall`
//!
//! Jeder Fehler führt direkt nach `FatalInstall`.

use std::sync::Arc;

use scaleio_config::ExecutorConfig;
use scaleio_scheduler::state::{ClusterState, Node, NodeState};
use scaleio_scheduler::topology::Topology;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::coordinator::Coordinator;
use crate::host::Host;
use crate::setup::NodeSetup;
use crate::ExecutorError;

/// Ergebnis einer Iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Continue,
    /// Endzustand erreicht, die Maschine läuft nicht weiter
    Stopped(NodeState),
}

pub struct NodeLifecycle<C: Coordinator, S: NodeSetup, H: Host> {
    hostname: String,
    coordinator: Arc<C>,
    setup: S,
    host: H,
    config: ExecutorConfig,
    /// Neustart nach der Kernel-Installation
    prereqs_reboot: bool,
    /// Neustart nach der Installation, von mehreren Schritten gesetzt
    reboot_required: bool,
}

// ============================================================================
// Helpers
// ============================================================================

/// Host part of an address like `http://10.0.0.5:8080/api`.
pub fn address_host(address: &str) -> &str {
    let rest = address.split_once("://").map_or(address, |(_, rest)| rest);
    let authority = rest.split('/').next().unwrap_or(rest);
    match authority.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => authority,
    }
}

impl<C: Coordinator, S: NodeSetup, H: Host> NodeLifecycle<C, S, H> {
    pub fn new(hostname: impl Into<String>, coordinator: Arc<C>, setup: S, host: H, config: ExecutorConfig) -> Self {
        Self {
            hostname: hostname.into(),
            coordinator,
            setup,
            host,
            config,
            prereqs_reboot: false,
            reboot_required: false,
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn reboot_required(&self) -> bool {
        self.reboot_required
    }

    /// Läuft bis zu einem Endzustand und gibt ihn zurück.
    pub async fn run(mut self) -> NodeState {
        loop {
            match self.step().await {
                Ok(Step::Continue) => {}
                Ok(Step::Stopped(state)) => return state,
                Err(e) => {
                    error!(hostname = %self.hostname, error = %e, "installation failed");
                    if let Err(e) = self.coordinator.update_node_state(&self.hostname, NodeState::FatalInstall).await {
                        error!(hostname = %self.hostname, error = %e, "failed to signal FatalInstall");
                    }
                    return NodeState::FatalInstall;
                }
            }
        }
    }

    /// Führt die Aktion der aktuellen Phase aus.
    pub async fn step(&mut self) -> Result<Step, ExecutorError> {
        let cluster = self.coordinator.cluster_state().await?;
        let node = cluster
            .node(&self.hostname)
            .cloned()
            .ok_or_else(|| ExecutorError::UnknownNode(self.hostname.clone()))?;

        if let Err(e) = self.coordinator.ping(&self.hostname).await {
            warn!(hostname = %self.hostname, error = %e, "ping failed");
        }

        debug!(hostname = %self.hostname, state = %node.state, "running state");

        match node.state {
            NodeState::Unknown => {
                self.publish_ip(&node).await?;
                let outcome = self.setup.environment_setup(&cluster, &node).await?;
                self.prereqs_reboot = outcome.reboot_required;
                self.publish(NodeState::CleanPrereqsReboot).await?;
            }

            NodeState::CleanPrereqsReboot => {
                let cluster = self.wait_for("prereqs reboot", NodeState::CleanPrereqsReboot).await?;
                self.publish(NodeState::PrerequisitesInstalled).await?;

                if std::mem::take(&mut self.prereqs_reboot) {
                    info!(hostname = %self.hostname, "reboot required for the new kernel");
                    self.reboot_host(&cluster).await;
                } else {
                    info!(hostname = %self.hostname, "no reboot needed after prerequisites");
                }
            }

            NodeState::PrerequisitesInstalled => {
                let cluster = self.wait_for("prereqs finished", NodeState::PrerequisitesInstalled).await?;
                let management = self.setup.management_setup(&cluster, &node).await?;
                let base = self.setup.node_setup(&cluster, &node).await?;
                self.reboot_required |= management.reboot_required || base.reboot_required;

                self.register_devices(&cluster, &node).await?;
                self.publish(NodeState::BasePackagedInstalled).await?;
            }

            NodeState::BasePackagedInstalled => {
                self.wait_for("base install", NodeState::BasePackagedInstalled).await?;
                self.publish(NodeState::InitializeCluster).await?;
            }

            NodeState::InitializeCluster => {
                let cluster = self.wait_for("cluster install", NodeState::InitializeCluster).await?;
                let outcome = self.setup.gateway_setup(&cluster, &node).await?;
                self.reboot_required |= outcome.reboot_required;
                self.publish(NodeState::AddResourcesToScaleIO).await?;
            }

            NodeState::AddResourcesToScaleIO => {
                // Der Control Loop hebt den Node auf InstallRexRay
                sleep(self.config.barrier_poll()).await;
            }

            NodeState::InstallRexRay => {
                let driver = self.setup.driver_setup(&cluster, &node).await?;
                self.reboot_required |= driver.reboot_required;
                self.setup.isolator_setup(&cluster, &node).await?;
                self.publish(NodeState::CleanInstallReboot).await?;
            }

            NodeState::CleanInstallReboot => {
                let cluster = self.wait_for("clean install reboot", NodeState::CleanInstallReboot).await?;
                if self.reboot_required {
                    info!(hostname = %self.hostname, "reboot required before finishing the install");
                    self.publish(NodeState::SystemReboot).await?;
                    self.reboot_host(&cluster).await;
                } else {
                    self.publish(NodeState::FinishInstall).await?;
                }
            }

            NodeState::SystemReboot => {
                self.publish(NodeState::FinishInstall).await?;
            }

            NodeState::FinishInstall => {
                if !node.declarative && !node.advertised {
                    match self.register_devices(&cluster, &node).await {
                        Ok(()) => info!(hostname = %self.hostname, "devices advertised"),
                        Err(e) => warn!(hostname = %self.hostname, error = %e, "advertising devices failed"),
                    }
                }
                sleep(self.config.poll_for_changes()).await;
            }

            NodeState::UpgradeCluster => {
                sleep(self.config.poll_for_changes()).await;
            }

            NodeState::FatalInstall => return Ok(Step::Stopped(NodeState::FatalInstall)),
        }

        Ok(Step::Continue)
    }

    async fn publish(&self, state: NodeState) -> Result<(), ExecutorError> {
        self.coordinator.update_node_state(&self.hostname, state).await?;
        info!(hostname = %self.hostname, %state, "signaled state");
        Ok(())
    }

    /// Meldet die IP des Hosts, falls sie von der des Offers abweicht.
    async fn publish_ip(&self, node: &Node) -> Result<(), ExecutorError> {
        match self.host.discover_ip().await {
            Ok(ip) if ip != node.ip_address => {
                self.coordinator.set_ip_address(&self.hostname, &ip).await?;
                info!(hostname = %self.hostname, %ip, "published host address");
            }
            Ok(_) => {}
            Err(e) => warn!(hostname = %self.hostname, error = %e, "cannot discover own address"),
        }
        Ok(())
    }

    /// Wartet, bis alle nicht-fatalen Nodes mindestens `target` erreicht haben.
    ///
    /// Gibt den Snapshot zurück, der die Barriere erfüllt hat.
    async fn wait_for(&self, barrier: &'static str, target: NodeState) -> Result<ClusterState, ExecutorError> {
        let deadline = self.config.barrier_timeout().map(|t| Instant::now() + t);

        loop {
            let cluster = self.coordinator.cluster_state().await?;
            if cluster.all_at_least(target) {
                debug!(hostname = %self.hostname, barrier, "barrier passed");
                return Ok(cluster);
            }

            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(ExecutorError::BarrierTimeout { barrier, target });
            }

            debug!(hostname = %self.hostname, barrier, "waiting for other nodes");
            sleep(self.config.barrier_poll()).await;
        }
    }

    /// Meldet die Devices des Nodes: deklarierte Topologie oder freie
    /// Platten im Default-Pool.
    async fn register_devices(&self, cluster: &ClusterState, node: &Node) -> Result<(), ExecutorError> {
        let topology = if node.declarative {
            node.provides.clone()
        } else {
            let devices = self.host.unused_devices().await?;
            Topology::single_pool(&cluster.scaleio.protection_domain, &cluster.scaleio.storage_pool, devices)
        };

        self.coordinator.advertise_devices(&self.hostname, topology).await?;
        Ok(())
    }

    /// Fehler beim Neustart werden nur geloggt.
    async fn reboot_host(&self, cluster: &ClusterState) {
        if cluster.scaleio.debug {
            info!(hostname = %self.hostname, "skipping the reboot in debug mode");
            return;
        }

        if let Some(address) = cluster.scaleio.scheduler_address.as_deref() {
            match self.host.discover_ip().await {
                Ok(ip) if ip == address_host(address) => {
                    info!(hostname = %self.hostname, "delaying reboot of the host running the scheduler");
                    sleep(self.config.delay_for_reboot()).await;
                }
                Ok(_) => {}
                Err(e) => warn!(hostname = %self.hostname, error = %e, "cannot discover own address"),
            }
        }

        if let Err(e) = self.host.reboot().await {
            error!(hostname = %self.hostname, error = %e, "reboot failed");
        }
        sleep(self.config.wait_for_reboot()).await;
    }
}

//! Cluster State - Prozessweiter Zustand aller Nodes
//!
//! `ClusterState` ist ein reines Datenaggregat. Ein `clone()` ist eine
//! vollständige Kopie und dient dem Control Loop als konsistenter Snapshot.
//! Geteilt wird der Zustand ausschließlich über [`Cluster`], dessen
//! Methoden den Lock nur für die Dauer einer Merge-Operation halten.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use scaleio_config::{Config, PackagesConfig, RexrayConfig};
use serde::{Deserialize, Serialize};

use super::node::{Node, NodeState, Persona};
use super::StateError;
use crate::topology::Topology;

/// Statisch konfigurierte Manager-Adressen.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Preconfig {
    /// Nur true wenn alle drei Manager-Adressen gesetzt sind
    pub enabled: bool,
    pub primary_mdm: Option<String>,
    pub secondary_mdm: Option<String>,
    pub tiebreaker_mdm: Option<String>,
    pub gateway: Option<String>,
}

/// Clusterweite Konfiguration, Teil jedes Snapshots.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScaleIo {
    pub cluster_id: String,
    pub cluster_name: String,
    pub admin_password: String,
    pub api_version: String,
    pub lb_gateway: Option<String>,
    pub protection_domain: String,
    pub storage_pool: String,
    pub preconfig: Preconfig,
    pub packages: PackagesConfig,
    pub rexray: RexrayConfig,
    pub isolator_binary: String,
    pub scheduler_address: Option<String>,
    pub debug: bool,
    pub experimental: bool,
}

impl ScaleIo {
    pub fn from_config(config: &Config) -> Self {
        let cluster = &config.cluster;
        let preconfig = &cluster.preconfig;

        Self {
            cluster_id: cluster.id.clone(),
            cluster_name: cluster.name.clone(),
            admin_password: cluster.admin_password.clone(),
            api_version: cluster.api_version.clone(),
            lb_gateway: cluster.lb_gateway.clone(),
            protection_domain: cluster.protection_domain.clone(),
            storage_pool: cluster.storage_pool.clone(),
            preconfig: Preconfig {
                enabled: preconfig.is_complete(),
                primary_mdm: preconfig.primary_mdm.clone(),
                secondary_mdm: preconfig.secondary_mdm.clone(),
                tiebreaker_mdm: preconfig.tiebreaker_mdm.clone(),
                gateway: preconfig.gateway.clone(),
            },
            packages: config.packages.clone(),
            rexray: config.rexray.clone(),
            isolator_binary: config.isolator.binary.clone(),
            scheduler_address: config.scheduler.address.clone(),
            debug: config.debug,
            experimental: config.experimental,
        }
    }
}

/// Snapshot-fähiger Zustand des gesamten Clusters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterState {
    pub scaleio: ScaleIo,
    /// Nodes nach Hostname
    pub nodes: BTreeMap<String, Node>,
}

impl ClusterState {
    pub fn new(scaleio: ScaleIo) -> Self {
        Self {
            scaleio,
            nodes: BTreeMap::new(),
        }
    }

    pub fn node(&self, hostname: &str) -> Option<&Node> {
        self.nodes.get(hostname)
    }

    pub fn node_with_persona(&self, persona: Persona) -> Option<&Node> {
        self.nodes.values().find(|n| n.persona == persona)
    }

    /// IPs der Manager in Reihenfolge primary, secondary, tiebreaker.
    ///
    /// Statisch konfigurierte Adressen haben Vorrang.
    pub fn manager_ips(&self) -> Vec<String> {
        let preconfig = &self.scaleio.preconfig;
        Persona::MANAGERS
            .iter()
            .filter_map(|&persona| {
                let configured = match persona {
                    Persona::MdmPrimary => preconfig.primary_mdm.clone(),
                    Persona::MdmSecondary => preconfig.secondary_mdm.clone(),
                    _ => preconfig.tiebreaker_mdm.clone(),
                };
                configured.or_else(|| self.node_with_persona(persona).map(|n| n.ip_address.clone()))
            })
            .filter(|ip| !ip.is_empty())
            .collect()
    }

    /// Prüft ob alle nicht-fatalen Nodes mindestens `target` erreicht haben.
    ///
    /// Ohne einen einzigen nicht-fatalen Node ist die Bedingung false.
    pub fn all_at_least(&self, target: NodeState) -> bool {
        let mut live = self.nodes.values().filter(|n| !n.state.is_fatal()).peekable();
        live.peek().is_some() && live.all(|n| n.state >= target)
    }

    /// Prüft ob alle nicht-fatalen Nodes genau auf `target` stehen.
    pub fn all_exactly(&self, target: NodeState) -> bool {
        let mut live = self.nodes.values().filter(|n| !n.state.is_fatal()).peekable();
        live.peek().is_some() && live.all(|n| n.state == target)
    }

    /// Adresse des ScaleIO Gateways.
    ///
    /// Reihenfolge: statisches Gateway, Load-Balancer, IP des primären MDM.
    pub fn gateway_address(&self) -> Result<String, StateError> {
        if let Some(gw) = &self.scaleio.preconfig.gateway {
            return Ok(gw.clone());
        }
        if let Some(gw) = &self.scaleio.lb_gateway {
            return Ok(gw.clone());
        }
        self.node_with_persona(Persona::MdmPrimary)
            .map(|n| n.ip_address.clone())
            .filter(|ip| !ip.is_empty())
            .ok_or(StateError::NoGateway)
    }
}

/// Geteilter Handle auf den Cluster-Zustand.
#[derive(Debug, Clone, Default)]
pub struct Cluster {
    inner: Arc<Mutex<ClusterState>>,
}

impl Cluster {
    pub fn new(state: ClusterState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ClusterState> {
        // Alle Mutationen sind einzelne Zuweisungen, ein vergifteter Lock hält einen gültigen Zustand
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Tiefe Kopie des aktuellen Zustands.
    pub fn snapshot(&self) -> ClusterState {
        self.lock().clone()
    }

    pub fn contains(&self, hostname: &str) -> bool {
        self.lock().nodes.contains_key(hostname)
    }

    pub fn has_persona(&self, persona: Persona) -> bool {
        self.lock().node_with_persona(persona).is_some()
    }

    /// Nimmt einen neuen Node auf. Doppelte Hostnames werden abgelehnt.
    pub fn register_node(&self, node: Node) -> Result<(), StateError> {
        let mut state = self.lock();
        if state.nodes.contains_key(&node.hostname) {
            return Err(StateError::DuplicateNode(node.hostname));
        }
        state.nodes.insert(node.hostname.clone(), node);
        Ok(())
    }

    /// Setzt die Phase eines Nodes. Rückschritte werden abgelehnt.
    ///
    /// Gibt den aktualisierten Node zurück.
    pub fn set_node_state(&self, hostname: &str, requested: NodeState) -> Result<Node, StateError> {
        let mut state = self.lock();
        let node = state
            .nodes
            .get_mut(hostname)
            .ok_or_else(|| StateError::UnknownNode(hostname.to_string()))?;

        if requested < node.state {
            return Err(StateError::PhaseRegression {
                hostname: hostname.to_string(),
                current: node.state,
                requested,
            });
        }
        node.state = requested;
        Ok(node.clone())
    }

    /// Hebt alle Nodes mit Phase <= `target` auf `target`.
    ///
    /// Gibt die Hostnames der angehobenen Nodes zurück.
    pub fn advance_all(&self, target: NodeState) -> Vec<String> {
        let mut state = self.lock();
        state
            .nodes
            .values_mut()
            .filter(|n| n.state < target)
            .map(|n| {
                n.state = target;
                n.hostname.clone()
            })
            .collect()
    }

    /// Hebt nur Nodes, die genau auf `from` stehen, auf `to`.
    pub fn advance_waiting(&self, from: NodeState, to: NodeState) -> Vec<String> {
        if to <= from {
            return Vec::new();
        }
        let mut state = self.lock();
        state
            .nodes
            .values_mut()
            .filter(|n| n.state == from)
            .map(|n| {
                n.state = to;
                n.hostname.clone()
            })
            .collect()
    }

    /// Übernimmt die gemeldete Topologie eines Nodes.
    ///
    /// Deklarative Nodes behalten ihre deklarierte Topologie, es wird nur
    /// `advertised` gesetzt.
    pub fn advertise_devices(&self, hostname: &str, topology: Topology) -> Result<(), StateError> {
        let mut state = self.lock();
        let node = state
            .nodes
            .get_mut(hostname)
            .ok_or_else(|| StateError::UnknownNode(hostname.to_string()))?;

        if !node.declarative {
            node.provides = topology;
        }
        node.advertised = true;
        Ok(())
    }

    /// Aktualisiert IP-Adresse eines Nodes (vom Executor ermittelt).
    pub fn set_ip_address(&self, hostname: &str, ip: &str) -> Result<(), StateError> {
        let mut state = self.lock();
        let node = state
            .nodes
            .get_mut(hostname)
            .ok_or_else(|| StateError::UnknownNode(hostname.to_string()))?;
        node.ip_address = ip.to_string();
        Ok(())
    }

    pub fn ping(&self, hostname: &str) -> Result<u64, StateError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();

        let mut state = self.lock();
        let node = state
            .nodes
            .get_mut(hostname)
            .ok_or_else(|| StateError::UnknownNode(hostname.to_string()))?;
        node.last_contact = now;
        Ok(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(hostname: &str, state: NodeState) -> Node {
        let mut node = Node::new(hostname, Persona::DataNode);
        node.state = state;
        node
    }

    fn cluster_with(nodes: Vec<Node>) -> Cluster {
        let cluster = Cluster::default();
        for n in nodes {
            cluster.register_node(n).unwrap();
        }
        cluster
    }

    #[test]
    fn test_register_duplicate_rejected() {
        let cluster = cluster_with(vec![node("a", NodeState::Unknown)]);
        let err = cluster.register_node(node("a", NodeState::Unknown)).unwrap_err();
        assert!(matches!(err, StateError::DuplicateNode(h) if h == "a"));
    }

    #[test]
    fn test_set_node_state_rejects_regression() {
        let cluster = cluster_with(vec![node("a", NodeState::InitializeCluster)]);

        let err = cluster.set_node_state("a", NodeState::Unknown).unwrap_err();
        assert!(matches!(err, StateError::PhaseRegression { .. }));
        assert_eq!(cluster.snapshot().nodes["a"].state, NodeState::InitializeCluster);

        cluster.set_node_state("a", NodeState::InitializeCluster).unwrap();
        cluster.set_node_state("a", NodeState::FatalInstall).unwrap();
    }

    #[test]
    fn test_set_node_state_unknown_node() {
        let cluster = Cluster::default();
        assert!(matches!(
            cluster.set_node_state("x", NodeState::Unknown),
            Err(StateError::UnknownNode(_))
        ));
    }

    #[test]
    fn test_advance_all_is_monotonic() {
        let cluster = cluster_with(vec![
            node("a", NodeState::AddResourcesToScaleIO),
            node("b", NodeState::FinishInstall),
            node("c", NodeState::FatalInstall),
        ]);

        let advanced = cluster.advance_all(NodeState::InstallRexRay);
        let snapshot = cluster.snapshot();

        assert_eq!(advanced, vec!["a".to_string()]);
        assert_eq!(snapshot.nodes["a"].state, NodeState::InstallRexRay);
        assert_eq!(snapshot.nodes["b"].state, NodeState::FinishInstall);
        assert_eq!(snapshot.nodes["c"].state, NodeState::FatalInstall);
    }

    #[test]
    fn test_advance_waiting_only_touches_exact_phase() {
        let cluster = cluster_with(vec![
            node("a", NodeState::AddResourcesToScaleIO),
            node("b", NodeState::Unknown),
        ]);

        let advanced = cluster.advance_waiting(NodeState::AddResourcesToScaleIO, NodeState::InstallRexRay);

        assert_eq!(advanced, vec!["a".to_string()]);
        assert_eq!(cluster.snapshot().nodes["b"].state, NodeState::Unknown);
    }

    #[test]
    fn test_snapshot_is_independent() {
        let cluster = cluster_with(vec![node("a", NodeState::Unknown)]);
        let snapshot = cluster.snapshot();

        cluster.set_node_state("a", NodeState::CleanPrereqsReboot).unwrap();

        assert_eq!(snapshot.nodes["a"].state, NodeState::Unknown);
    }

    #[test]
    fn test_all_at_least_ignores_fatal_nodes() {
        let state = cluster_with(vec![
            node("a", NodeState::InitializeCluster),
            node("b", NodeState::FatalInstall),
        ])
        .snapshot();

        assert!(state.all_at_least(NodeState::InitializeCluster));
        assert!(!state.all_at_least(NodeState::AddResourcesToScaleIO));
        assert!(!ClusterState::default().all_at_least(NodeState::Unknown));
    }

    #[test]
    fn test_all_exactly() {
        let state = cluster_with(vec![
            node("a", NodeState::AddResourcesToScaleIO),
            node("b", NodeState::InstallRexRay),
        ])
        .snapshot();

        assert!(!state.all_exactly(NodeState::AddResourcesToScaleIO));
    }

    #[test]
    fn test_gateway_address_resolution_order() {
        let mut primary = node("mdm1", NodeState::Unknown);
        primary.persona = Persona::MdmPrimary;
        primary.ip_address = "10.0.0.1".to_string();
        let mut state = cluster_with(vec![primary]).snapshot();

        assert_eq!(state.gateway_address().unwrap(), "10.0.0.1");

        state.scaleio.lb_gateway = Some("lb.local".to_string());
        assert_eq!(state.gateway_address().unwrap(), "lb.local");

        state.scaleio.preconfig.gateway = Some("10.0.0.10".to_string());
        assert_eq!(state.gateway_address().unwrap(), "10.0.0.10");

        assert!(matches!(
            ClusterState::default().gateway_address(),
            Err(StateError::NoGateway)
        ));
    }

    #[test]
    fn test_advertise_devices_keeps_declared_topology() {
        let mut declared = node("a", NodeState::Unknown);
        declared.declarative = true;
        declared.provides = Topology::single_pool("d1", "p1", vec!["/dev/sdb".into()]);
        let cluster = cluster_with(vec![declared, node("b", NodeState::Unknown)]);

        let advertised = Topology::single_pool("default", "default", vec!["/dev/sdx".into()]);
        cluster.advertise_devices("a", advertised.clone()).unwrap();
        cluster.advertise_devices("b", advertised.clone()).unwrap();

        let snapshot = cluster.snapshot();
        assert!(snapshot.nodes["a"].advertised);
        assert!(snapshot.nodes["a"].provides.domains.contains_key("d1"));
        assert_eq!(snapshot.nodes["b"].provides, advertised);
    }

    #[test]
    fn test_ping_updates_last_contact() {
        let cluster = cluster_with(vec![node("a", NodeState::Unknown)]);
        let now = cluster.ping("a").unwrap();

        assert!(now > 0);
        assert_eq!(cluster.snapshot().nodes["a"].last_contact, now);
    }
}

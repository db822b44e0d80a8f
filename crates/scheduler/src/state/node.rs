//! Node - Ein Rechner im Cluster mit Rolle und Lifecycle-Phase

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::offer::Offer;
use crate::topology::{self, Role, Topology};

/// Die Rolle eines Nodes im ScaleIO-Cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Persona {
    #[default]
    Unassigned,
    MdmPrimary,
    MdmSecondary,
    TieBreaker,
    DataNode,
}

impl Persona {
    /// Die drei Manager-Rollen in Auswahl-Reihenfolge.
    pub const MANAGERS: [Persona; 3] = [Persona::MdmPrimary, Persona::MdmSecondary, Persona::TieBreaker];

    /// Wert des `scaleio-persona` Attributs für diese Rolle.
    pub fn attribute_value(self) -> Option<&'static str> {
        match self {
            Persona::MdmPrimary => Some("primary"),
            Persona::MdmSecondary => Some("secondary"),
            Persona::TieBreaker => Some("tiebreaker"),
            Persona::DataNode => Some("datanode"),
            Persona::Unassigned => None,
        }
    }

    pub fn is_manager(self) -> bool {
        matches!(self, Persona::MdmPrimary | Persona::MdmSecondary | Persona::TieBreaker)
    }

    /// Primary und Secondary betreiben zusätzlich das Gateway.
    pub fn runs_gateway(self) -> bool {
        matches!(self, Persona::MdmPrimary | Persona::MdmSecondary)
    }
}

impl fmt::Display for Persona {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Persona::Unassigned => "unassigned",
            Persona::MdmPrimary => "mdm-primary",
            Persona::MdmSecondary => "mdm-secondary",
            Persona::TieBreaker => "tiebreaker",
            Persona::DataNode => "datanode",
        };
        f.write_str(name)
    }
}

/// Lifecycle-Phase eines Nodes.
///
/// Die Reihenfolge der Varianten ist die Install-Reihenfolge. `FatalInstall`
/// steht am Ende, damit ein Bulk-Advance einen fehlgeschlagenen Node nie
/// zurück in die Installation hebt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    #[default]
    Unknown,
    CleanPrereqsReboot,
    PrerequisitesInstalled,
    BasePackagedInstalled,
    InitializeCluster,
    AddResourcesToScaleIO,
    InstallRexRay,
    CleanInstallReboot,
    SystemReboot,
    FinishInstall,
    UpgradeCluster,
    FatalInstall,
}

impl NodeState {
    pub fn is_fatal(self) -> bool {
        self == NodeState::FatalInstall
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Ein Node im Cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub hostname: String,
    pub agent_id: String,
    pub offer_id: String,
    pub task_id: String,
    pub executor_id: String,
    pub ip_address: String,
    pub persona: Persona,
    pub state: NodeState,
    /// Unix-Sekunden des letzten Pings
    pub last_contact: u64,
    /// Topologie wurde explizit über Attribute angegeben
    pub declarative: bool,
    /// Node hat seine Devices mindestens einmal gemeldet
    pub advertised: bool,
    /// Domains zu denen der Node Storage beiträgt
    pub provides: Topology,
    /// Domains auf die der Node Client-Zugriff braucht
    pub consumes: Topology,
}

impl Node {
    pub fn new(hostname: impl Into<String>, persona: Persona) -> Self {
        let hostname = hostname.into();
        Self {
            task_id: format!("scaleio-{hostname}"),
            executor_id: format!("executor-scaleio-{hostname}"),
            hostname,
            agent_id: String::new(),
            offer_id: String::new(),
            ip_address: String::new(),
            persona,
            state: NodeState::Unknown,
            last_contact: 0,
            declarative: false,
            advertised: false,
            provides: Topology::default(),
            consumes: Topology::default(),
        }
    }

    /// Baut einen Node aus einem Offer und dekodiert dabei beide Topologien.
    pub fn from_offer(offer: &Offer, persona: Persona, state: NodeState) -> Self {
        let attributes = offer.attribute_map();
        let provides = topology::decode(&attributes, Role::Server);
        let consumes = topology::decode(&attributes, Role::Client);

        let mut node = Self::new(offer.hostname.clone(), persona);
        node.agent_id = offer.agent_id.clone();
        node.offer_id = offer.id.clone();
        node.ip_address = offer.ip.clone();
        node.state = state;
        node.declarative = provides.is_some() || consumes.is_some();
        node.provides = provides.unwrap_or_default();
        node.consumes = consumes.unwrap_or_default();
        node
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_state_order() {
        assert!(NodeState::Unknown < NodeState::CleanPrereqsReboot);
        assert!(NodeState::AddResourcesToScaleIO < NodeState::InstallRexRay);
        assert!(NodeState::SystemReboot < NodeState::FinishInstall);
        assert!(NodeState::UpgradeCluster < NodeState::FatalInstall);
    }

    #[test]
    fn test_persona_attribute_values() {
        assert_eq!(Persona::MdmPrimary.attribute_value(), Some("primary"));
        assert_eq!(Persona::TieBreaker.attribute_value(), Some("tiebreaker"));
        assert_eq!(Persona::Unassigned.attribute_value(), None);
        assert!(Persona::TieBreaker.is_manager());
        assert!(!Persona::TieBreaker.runs_gateway());
    }

    #[test]
    fn test_node_from_offer_declarative() {
        let offer = Offer::new("o1", "host-a")
            .with_ip("10.0.0.1")
            .with_attribute("scaleio-sds-domains", "d1")
            .with_attribute("scaleio-sds-d1", "p1");

        let node = Node::from_offer(&offer, Persona::DataNode, NodeState::Unknown);

        assert!(node.declarative);
        assert_eq!(node.task_id, "scaleio-host-a");
        assert_eq!(node.executor_id, "executor-scaleio-host-a");
        assert_eq!(node.ip_address, "10.0.0.1");
        assert!(node.provides.domains.contains_key("d1"));
        assert!(node.consumes.is_empty());
    }

    #[test]
    fn test_node_from_offer_without_topology() {
        let offer = Offer::new("o1", "host-b");
        let node = Node::from_offer(&offer, Persona::DataNode, NodeState::PrerequisitesInstalled);

        assert!(!node.declarative);
        assert_eq!(node.state, NodeState::PrerequisitesInstalled);
    }
}

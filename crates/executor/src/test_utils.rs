//! Mocks for driving the node lifecycle without a real host.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use scaleio_scheduler::state::{Cluster, ClusterState, Node, NodeState};
use scaleio_scheduler::topology::Topology;
use scaleio_scheduler::SchedulerError;

use crate::coordinator::{Coordinator, CoordinatorError};
use crate::host::{Host, HostError};
use crate::setup::{NodeSetup, SetupError, SetupOutcome};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// RecordingCoordinator
// ============================================================================

/// Coordinator over a plain [`Cluster`], recording every request.
#[derive(Debug, Default)]
pub struct RecordingCoordinator {
    cluster: Cluster,
    published: Mutex<Vec<(String, NodeState)>>,
    advertised: Mutex<Vec<(String, Topology)>>,
    pings: AtomicUsize,
}

impl RecordingCoordinator {
    pub fn new(cluster: Cluster) -> Self {
        Self {
            cluster,
            ..Default::default()
        }
    }

    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    /// Published states of one node, in order.
    pub fn states_for(&self, hostname: &str) -> Vec<NodeState> {
        lock(&self.published)
            .iter()
            .filter(|(h, _)| h == hostname)
            .map(|(_, s)| *s)
            .collect()
    }

    pub fn advertised(&self) -> Vec<(String, Topology)> {
        lock(&self.advertised).clone()
    }

    pub fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Coordinator for RecordingCoordinator {
    async fn cluster_state(&self) -> Result<ClusterState, CoordinatorError> {
        Ok(self.cluster.snapshot())
    }

    async fn update_node_state(&self, hostname: &str, state: NodeState) -> Result<(), CoordinatorError> {
        self.cluster
            .set_node_state(hostname, state)
            .map_err(SchedulerError::from)?;
        lock(&self.published).push((hostname.to_string(), state));
        Ok(())
    }

    async fn advertise_devices(&self, hostname: &str, topology: Topology) -> Result<(), CoordinatorError> {
        self.cluster
            .advertise_devices(hostname, topology.clone())
            .map_err(SchedulerError::from)?;
        lock(&self.advertised).push((hostname.to_string(), topology));
        Ok(())
    }

    async fn set_ip_address(&self, hostname: &str, ip: &str) -> Result<(), CoordinatorError> {
        self.cluster
            .set_ip_address(hostname, ip)
            .map_err(SchedulerError::from)?;
        Ok(())
    }

    async fn ping(&self, hostname: &str) -> Result<(), CoordinatorError> {
        self.cluster.ping(hostname).map_err(SchedulerError::from)?;
        self.pings.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// MockSetup
// ============================================================================

#[derive(Debug, Default)]
struct SetupState {
    calls: Vec<&'static str>,
    failing: HashSet<&'static str>,
    reboots: HashSet<&'static str>,
}

/// Setup steps that only record their calls.
///
/// Step names match the [`NodeSetup`] methods, e.g. `"node_setup"`.
#[derive(Debug, Default, Clone)]
pub struct MockSetup {
    state: Arc<Mutex<SetupState>>,
}

impl MockSetup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_on(&self, step: &'static str) {
        lock(&self.state).failing.insert(step);
    }

    pub fn reboot_on(&self, step: &'static str) {
        lock(&self.state).reboots.insert(step);
    }

    pub fn calls(&self) -> Vec<&'static str> {
        lock(&self.state).calls.clone()
    }

    fn record(&self, step: &'static str) -> Result<SetupOutcome, SetupError> {
        let mut state = lock(&self.state);
        state.calls.push(step);
        if state.failing.contains(step) {
            return Err(SetupError::CommandFailed {
                command: step.to_string(),
                stderr: "injected failure".to_string(),
            });
        }
        Ok(SetupOutcome {
            reboot_required: state.reboots.contains(step),
        })
    }
}

#[async_trait]
impl NodeSetup for MockSetup {
    async fn environment_setup(&self, _cluster: &ClusterState, _node: &Node) -> Result<SetupOutcome, SetupError> {
        self.record("environment_setup")
    }

    async fn management_setup(&self, _cluster: &ClusterState, _node: &Node) -> Result<SetupOutcome, SetupError> {
        self.record("management_setup")
    }

    async fn node_setup(&self, _cluster: &ClusterState, _node: &Node) -> Result<SetupOutcome, SetupError> {
        self.record("node_setup")
    }

    async fn gateway_setup(&self, _cluster: &ClusterState, _node: &Node) -> Result<SetupOutcome, SetupError> {
        self.record("gateway_setup")
    }

    async fn driver_setup(&self, _cluster: &ClusterState, _node: &Node) -> Result<SetupOutcome, SetupError> {
        self.record("driver_setup")
    }

    async fn isolator_setup(&self, _cluster: &ClusterState, _node: &Node) -> Result<SetupOutcome, SetupError> {
        self.record("isolator_setup")
    }
}

// ============================================================================
// MockHost
// ============================================================================

#[derive(Debug, Default)]
struct HostState {
    ip: String,
    devices: Vec<String>,
    reboots: usize,
}

#[derive(Debug, Default, Clone)]
pub struct MockHost {
    state: Arc<Mutex<HostState>>,
}

impl MockHost {
    pub fn new(ip: &str, devices: &[&str]) -> Self {
        Self {
            state: Arc::new(Mutex::new(HostState {
                ip: ip.to_string(),
                devices: devices.iter().map(|d| d.to_string()).collect(),
                reboots: 0,
            })),
        }
    }

    pub fn reboots(&self) -> usize {
        lock(&self.state).reboots
    }
}

#[async_trait]
impl Host for MockHost {
    async fn discover_ip(&self) -> Result<String, HostError> {
        let ip = lock(&self.state).ip.clone();
        if ip.is_empty() {
            return Err(HostError::NoAddress);
        }
        Ok(ip)
    }

    async fn reboot(&self) -> Result<(), HostError> {
        lock(&self.state).reboots += 1;
        Ok(())
    }

    async fn unused_devices(&self) -> Result<Vec<String>, HostError> {
        Ok(lock(&self.state).devices.clone())
    }
}

//! Tests for the phase barrier and steady-state reconciliation

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use scaleio_config::Config;
use scaleio_scheduler::{
    controller::TickOutcome,
    reconcile::ShadowMetadata,
    state::{Cluster, NodeState},
    store::{MdmNodes, MetadataStore, NodeInfo, StoreError},
    test_utils::{declared_offer, MemoryStore, MockStorage},
    ScaleIoScheduler,
};

type TestScheduler = ScaleIoScheduler<MemoryStore, MockStorage>;

fn scheduler(store: Arc<MemoryStore>, storage: MockStorage) -> TestScheduler {
    let mut config = Config::default();
    config.cluster.preconfig.gateway = Some("10.0.0.100".to_string());
    ScaleIoScheduler::new(config, store, Arc::new(storage))
}

async fn with_nodes(scheduler: &TestScheduler, count: usize) {
    let offers: Vec<_> = (1..=count)
        .map(|i| declared_offer(&format!("host-{i}"), &format!("10.0.0.{i}"), "d1", "p1", &["/dev/sdb"]))
        .collect();
    scheduler.resource_offers(&offers).await.unwrap();
}

async fn set_all(scheduler: &TestScheduler, state: NodeState) {
    for hostname in scheduler.snapshot().nodes.keys() {
        scheduler.update_node_state(hostname, state).await.unwrap();
    }
}

#[tokio::test]
async fn test_waits_until_every_node_reaches_resource_phase() {
    let storage = MockStorage::new();
    let scheduler = scheduler(Arc::new(MemoryStore::new()), storage.clone());
    with_nodes(&scheduler, 4).await;
    set_all(&scheduler, NodeState::InitializeCluster).await;
    scheduler
        .update_node_state("host-1", NodeState::AddResourcesToScaleIO)
        .await
        .unwrap();

    let mut control = scheduler.control_loop().await;

    assert!(matches!(control.tick().await.unwrap(), TickOutcome::Waiting));
    assert!(!control.barrier().has_fired());
    assert!(storage.calls().is_empty());
}

#[tokio::test]
async fn test_barrier_reconciles_and_releases_all_nodes() {
    let store = Arc::new(MemoryStore::new());
    let storage = MockStorage::new();
    let scheduler = scheduler(Arc::clone(&store), storage.clone());
    with_nodes(&scheduler, 4).await;
    set_all(&scheduler, NodeState::AddResourcesToScaleIO).await;

    let mut control = scheduler.control_loop().await;

    let TickOutcome::Released { report, advanced } = control.tick().await.unwrap() else {
        panic!("barrier did not fire");
    };
    assert_eq!(report.unwrap().applied(), 4);
    assert_eq!(advanced.len(), 4);
    assert_eq!(storage.sds_names("d1").len(), 4);

    for node in scheduler.snapshot().nodes.values() {
        assert_eq!(node.state, NodeState::InstallRexRay);
        let info = store.node_info(&node.hostname).await.unwrap().unwrap();
        assert_eq!(info.state, NodeState::InstallRexRay);
    }
    assert!(store.configured().await.unwrap());

    // Zweite Iteration: Steady-State ohne Änderungen
    storage.clear_calls();
    let TickOutcome::SteadyState { report, advanced } = control.tick().await.unwrap() else {
        panic!("expected steady state");
    };
    assert_eq!(report.applied(), 0);
    assert!(advanced.is_empty());
    assert!(storage.calls().is_empty());
}

#[tokio::test]
async fn test_failed_reconciliation_still_releases_nodes() {
    let store = Arc::new(MemoryStore::new());
    let storage = MockStorage::new();
    storage.fail_on("authenticate");
    let scheduler = scheduler(Arc::clone(&store), storage.clone());
    with_nodes(&scheduler, 3).await;
    set_all(&scheduler, NodeState::AddResourcesToScaleIO).await;

    let mut control = scheduler.control_loop().await;

    let TickOutcome::Released { report, advanced } = control.tick().await.unwrap() else {
        panic!("barrier did not fire");
    };
    assert!(report.is_none());
    assert_eq!(advanced.len(), 3);

    // Die nächste Iteration holt die Reconciliation nach
    storage.clear_failures();
    let TickOutcome::SteadyState { report, .. } = control.tick().await.unwrap() else {
        panic!("expected steady state");
    };
    assert_eq!(report.applied(), 3);
}

#[tokio::test]
async fn test_release_never_lowers_a_phase() {
    let scheduler = scheduler(Arc::new(MemoryStore::new()), MockStorage::new());
    with_nodes(&scheduler, 3).await;
    set_all(&scheduler, NodeState::AddResourcesToScaleIO).await;
    scheduler
        .update_node_state("host-2", NodeState::FatalInstall)
        .await
        .unwrap();

    let mut control = scheduler.control_loop().await;
    control.tick().await.unwrap();

    let snapshot = scheduler.snapshot();
    assert_eq!(snapshot.nodes["host-1"].state, NodeState::InstallRexRay);
    assert_eq!(snapshot.nodes["host-2"].state, NodeState::FatalInstall);
}

#[tokio::test]
async fn test_late_node_is_reconciled_and_released() {
    let storage = MockStorage::new();
    let scheduler = scheduler(Arc::new(MemoryStore::new()), storage.clone());
    with_nodes(&scheduler, 3).await;
    set_all(&scheduler, NodeState::AddResourcesToScaleIO).await;

    let mut control = scheduler.control_loop().await;
    control.tick().await.unwrap();

    scheduler
        .resource_offers(&[declared_offer("late", "10.0.0.50", "d1", "p1", &["/dev/sdc"])])
        .await
        .unwrap();

    // Noch nicht installiert: wird ignoriert
    let TickOutcome::SteadyState { report, advanced } = control.tick().await.unwrap() else {
        panic!("expected steady state");
    };
    assert!(!report.nodes.contains_key("late"));
    assert!(advanced.is_empty());

    scheduler
        .update_node_state("late", NodeState::AddResourcesToScaleIO)
        .await
        .unwrap();

    let TickOutcome::SteadyState { report, advanced } = control.tick().await.unwrap() else {
        panic!("expected steady state");
    };
    assert_eq!(report.applied(), 1);
    assert_eq!(advanced, vec!["late".to_string()]);
    assert!(storage.devices("d1", "p1").contains(&"/dev/sdc".to_string()));
    assert_eq!(scheduler.snapshot().nodes["late"].state, NodeState::InstallRexRay);
}

#[tokio::test]
async fn test_restart_with_configured_cluster_skips_barrier() {
    let store = Arc::new(MemoryStore::new());
    store.set_configured(true).await.unwrap();
    let scheduler = scheduler(Arc::clone(&store), MockStorage::new());

    let control = scheduler.control_loop().await;

    assert!(control.barrier().has_fired());
}

#[tokio::test]
async fn test_steady_state_disabled_goes_idle() {
    let mut config = Config::default();
    config.cluster.preconfig.gateway = Some("10.0.0.100".to_string());
    config.scheduler.steady_state_reconcile = false;
    let scheduler = ScaleIoScheduler::new(config, Arc::new(MemoryStore::new()), Arc::new(MockStorage::new()));
    with_nodes(&scheduler, 3).await;
    set_all(&scheduler, NodeState::AddResourcesToScaleIO).await;

    let mut control = scheduler.control_loop().await;
    control.tick().await.unwrap();

    assert!(matches!(control.tick().await.unwrap(), TickOutcome::Idle));
}

/// Store that lets one node move on while the control loop persists the
/// release, like an agent running concurrently.
#[derive(Default)]
struct RacingStore {
    inner: MemoryStore,
    cluster: OnceLock<Cluster>,
}

#[async_trait]
impl MetadataStore for RacingStore {
    async fn node_info(&self, hostname: &str) -> Result<Option<NodeInfo>, StoreError> {
        self.inner.node_info(hostname).await
    }

    async fn set_node_info(&self, hostname: &str, info: NodeInfo) -> Result<(), StoreError> {
        self.inner.set_node_info(hostname, info).await
    }

    async fn mdm_nodes(&self) -> Result<MdmNodes, StoreError> {
        self.inner.mdm_nodes().await
    }

    async fn metadata(&self, hostname: &str) -> Result<Option<ShadowMetadata>, StoreError> {
        self.inner.metadata(hostname).await
    }

    async fn set_metadata(&self, hostname: &str, metadata: &ShadowMetadata) -> Result<(), StoreError> {
        self.inner.set_metadata(hostname, metadata).await
    }

    async fn configured(&self) -> Result<bool, StoreError> {
        self.inner.configured().await
    }

    async fn set_configured(&self, configured: bool) -> Result<(), StoreError> {
        if let Some(cluster) = self.cluster.get() {
            cluster
                .set_node_state("host-1", NodeState::CleanInstallReboot)
                .unwrap();
        }
        self.inner.set_configured(configured).await
    }
}

#[tokio::test]
async fn test_release_persists_current_phase_of_nodes_that_moved_on() {
    let store = Arc::new(RacingStore::default());
    let mut config = Config::default();
    config.cluster.preconfig.gateway = Some("10.0.0.100".to_string());
    let scheduler = ScaleIoScheduler::new(config, Arc::clone(&store), Arc::new(MockStorage::new()));
    let _ = store.cluster.set(scheduler.cluster().clone());

    let offers: Vec<_> = (1..=3)
        .map(|i| declared_offer(&format!("host-{i}"), &format!("10.0.0.{i}"), "d1", "p1", &["/dev/sdb"]))
        .collect();
    scheduler.resource_offers(&offers).await.unwrap();
    for hostname in scheduler.snapshot().nodes.keys() {
        scheduler
            .update_node_state(hostname, NodeState::AddResourcesToScaleIO)
            .await
            .unwrap();
    }

    let mut control = scheduler.control_loop().await;
    assert!(matches!(control.tick().await.unwrap(), TickOutcome::Released { .. }));

    let moved_on = store.node_info("host-1").await.unwrap().unwrap();
    assert_eq!(moved_on.state, NodeState::CleanInstallReboot);
    let released = store.node_info("host-2").await.unwrap().unwrap();
    assert_eq!(released.state, NodeState::InstallRexRay);
}

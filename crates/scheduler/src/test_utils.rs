//! Mocks and builders shared by unit and integration tests.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

pub use crate::store::MemoryStore;

use crate::offer::Offer;
use crate::topology::{encode, Role, Topology};
use crate::storage::{Credentials, ObjectRef, SdsSpec, StorageBackend, StorageError, StorageSession};

/// Offer with CPU and memory resources.
pub fn offer(hostname: &str, ip: &str, cpus: f64, mem: f64) -> Offer {
    Offer::new(format!("offer-{hostname}"), hostname)
        .with_agent(format!("agent-{hostname}"))
        .with_ip(ip)
        .with_resource("cpus", cpus)
        .with_resource("mem", mem)
}

/// Offer declaring one domain with one pool and the given devices.
pub fn declared_offer(hostname: &str, ip: &str, domain: &str, pool: &str, devices: &[&str]) -> Offer {
    let topology = Topology::single_pool(domain, pool, devices.iter().map(|d| d.to_string()).collect());
    let mut offer = offer(hostname, ip, 4.0, 8192.0);
    offer.attributes.extend(encode(&topology, Role::Server));
    offer
}

#[derive(Debug, Default)]
struct MockDomain {
    sdss: BTreeSet<String>,
    pools: BTreeMap<String, BTreeSet<String>>,
}

#[derive(Debug, Default)]
struct MockState {
    domains: BTreeMap<String, MockDomain>,
    calls: Vec<String>,
    failures: HashSet<String>,
}

/// In-memory storage system recording every call.
///
/// Calls are recorded as `"<op>:<name>"`, e.g. `"create_domain:d1"`.
/// Registering a call with [`MockStorage::fail_on`] makes it fail.
#[derive(Debug, Default, Clone)]
pub struct MockStorage {
    state: Arc<Mutex<MockState>>,
}

fn lock(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn split_id(id: &str) -> (String, String) {
    match id.split_once('|') {
        Some((a, b)) => (a.to_string(), b.to_string()),
        None => (id.to_string(), String::new()),
    }
}

impl MockStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_on(&self, call: &str) {
        lock(&self.state).failures.insert(call.to_string());
    }

    pub fn clear_failures(&self) {
        lock(&self.state).failures.clear();
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.state).calls.clone()
    }

    pub fn clear_calls(&self) {
        lock(&self.state).calls.clear();
    }

    pub fn has_domain(&self, domain: &str) -> bool {
        lock(&self.state).domains.contains_key(domain)
    }

    pub fn has_pool(&self, domain: &str, pool: &str) -> bool {
        lock(&self.state)
            .domains
            .get(domain)
            .is_some_and(|d| d.pools.contains_key(pool))
    }

    pub fn sds_names(&self, domain: &str) -> Vec<String> {
        lock(&self.state)
            .domains
            .get(domain)
            .map(|d| d.sdss.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn devices(&self, domain: &str, pool: &str) -> Vec<String> {
        lock(&self.state)
            .domains
            .get(domain)
            .and_then(|d| d.pools.get(pool))
            .map(|p| p.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl StorageBackend for MockStorage {
    type Session = MockSession;

    async fn authenticate(
        &self,
        _endpoint: &str,
        _api_version: &str,
        _credentials: &Credentials,
    ) -> Result<MockSession, StorageError> {
        let session = MockSession {
            state: Arc::clone(&self.state),
        };
        session.record("authenticate".to_string())?;
        Ok(session)
    }
}

pub struct MockSession {
    state: Arc<Mutex<MockState>>,
}

impl MockSession {
    fn record(&self, call: String) -> Result<(), StorageError> {
        let mut state = lock(&self.state);
        let failing = state.failures.contains(&call);
        state.calls.push(call.clone());
        if failing {
            return Err(StorageError::Rejected(call));
        }
        Ok(())
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MockState) -> T) -> T {
        f(&mut lock(&self.state))
    }
}

#[async_trait]
impl StorageSession for MockSession {
    async fn find_system(&self, _id: &str, name: &str) -> Result<Option<ObjectRef>, StorageError> {
        self.record("find_system".to_string())?;
        Ok(Some(ObjectRef::new("system", name)))
    }

    async fn find_protection_domain(&self, _system: &ObjectRef, name: &str) -> Result<Option<ObjectRef>, StorageError> {
        self.record(format!("find_domain:{name}"))?;
        Ok(self.with_state(|s| s.domains.contains_key(name).then(|| ObjectRef::new(name, name))))
    }

    async fn create_protection_domain(&self, _system: &ObjectRef, name: &str) -> Result<ObjectRef, StorageError> {
        self.record(format!("create_domain:{name}"))?;
        self.with_state(|s| {
            s.domains.entry(name.to_string()).or_default();
        });
        Ok(ObjectRef::new(name, name))
    }

    async fn remove_protection_domain(&self, domain: &ObjectRef) -> Result<(), StorageError> {
        self.record(format!("remove_domain:{}", domain.name))?;
        self.with_state(|s| s.domains.remove(&domain.id));
        Ok(())
    }

    async fn find_sds(&self, domain: &ObjectRef, name: &str) -> Result<Option<ObjectRef>, StorageError> {
        self.record(format!("find_sds:{name}"))?;
        let exists = self.with_state(|s| s.domains.get(&domain.id).is_some_and(|d| d.sdss.contains(name)));
        Ok(exists.then(|| ObjectRef::new(format!("{}|{name}", domain.id), name)))
    }

    async fn create_sds(&self, domain: &ObjectRef, spec: &SdsSpec) -> Result<ObjectRef, StorageError> {
        self.record(format!("create_sds:{}", spec.name))?;
        self.with_state(|s| {
            s.domains
                .entry(domain.id.clone())
                .or_default()
                .sdss
                .insert(spec.name.clone())
        });
        Ok(ObjectRef::new(format!("{}|{}", domain.id, spec.name), &spec.name))
    }

    async fn remove_sds(&self, sds: &ObjectRef) -> Result<(), StorageError> {
        self.record(format!("remove_sds:{}", sds.name))?;
        let (domain, name) = split_id(&sds.id);
        self.with_state(|s| s.domains.get_mut(&domain).map(|d| d.sdss.remove(&name)));
        Ok(())
    }

    async fn find_storage_pool(&self, domain: &ObjectRef, name: &str) -> Result<Option<ObjectRef>, StorageError> {
        self.record(format!("find_pool:{name}"))?;
        let exists = self.with_state(|s| s.domains.get(&domain.id).is_some_and(|d| d.pools.contains_key(name)));
        Ok(exists.then(|| ObjectRef::new(format!("{}|{name}", domain.id), name)))
    }

    async fn create_storage_pool(&self, domain: &ObjectRef, name: &str) -> Result<ObjectRef, StorageError> {
        self.record(format!("create_pool:{name}"))?;
        self.with_state(|s| {
            s.domains
                .entry(domain.id.clone())
                .or_default()
                .pools
                .entry(name.to_string())
                .or_default();
        });
        Ok(ObjectRef::new(format!("{}|{name}", domain.id), name))
    }

    async fn remove_storage_pool(&self, pool: &ObjectRef) -> Result<(), StorageError> {
        self.record(format!("remove_pool:{}", pool.name))?;
        let (domain, name) = split_id(&pool.id);
        self.with_state(|s| s.domains.get_mut(&domain).map(|d| d.pools.remove(&name)));
        Ok(())
    }

    async fn find_device(&self, pool: &ObjectRef, path: &str) -> Result<Option<ObjectRef>, StorageError> {
        self.record(format!("find_device:{path}"))?;
        let (domain, name) = split_id(&pool.id);
        let exists = self.with_state(|s| {
            s.domains
                .get(&domain)
                .and_then(|d| d.pools.get(&name))
                .is_some_and(|p| p.contains(path))
        });
        Ok(exists.then(|| ObjectRef::new(format!("{}|{path}", pool.id), path)))
    }

    async fn attach_device(&self, pool: &ObjectRef, path: &str, _sds_id: &str) -> Result<ObjectRef, StorageError> {
        self.record(format!("attach_device:{path}"))?;
        let (domain, name) = split_id(&pool.id);
        self.with_state(|s| {
            s.domains
                .entry(domain)
                .or_default()
                .pools
                .entry(name)
                .or_default()
                .insert(path.to_string())
        });
        Ok(ObjectRef::new(format!("{}|{path}", pool.id), path))
    }

    async fn detach_device(&self, device: &ObjectRef) -> Result<(), StorageError> {
        self.record(format!("detach_device:{}", device.name))?;
        let mut parts = device.id.splitn(3, '|');
        let (Some(domain), Some(pool), Some(path)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(StorageError::Rejected(format!("bad device id {}", device.id)));
        };
        self.with_state(|s| {
            s.domains
                .get_mut(domain)
                .and_then(|d| d.pools.get_mut(pool))
                .map(|p| p.remove(path))
        });
        Ok(())
    }
}

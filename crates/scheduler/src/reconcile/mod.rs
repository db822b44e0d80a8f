//! Reconcile Module - Gleicht die Storage-Topologie mit dem Deklarierten ab
//!
//! Pro Node:
//! 1. Shadow Metadata laden (oder leer anlegen)
//! 2. Lösch- und Hinzufüge-Pass gegen die deklarierte Topologie
//! 3. Nur wenn sich etwas geändert hat oder Flags offen sind: anwenden
//! 4. Shadow Metadata immer speichern
//!
//! Die Session zum Gateway wird pro Pass höchstens einmal aufgebaut.

mod shadow;

pub use shadow::{ShadowDevice, ShadowDomain, ShadowMetadata, ShadowPool, ShadowSds, SDS_MODE_ALL};

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::state::{ClusterState, Node, StateError};
use crate::storage::{Credentials, ObjectRef, SdsSpec, StorageBackend, StorageError, StorageSession};
use crate::store::{MetadataStore, StoreError};

/// Benutzer für die Gateway-Anmeldung.
pub const ADMIN_USER: &str = "admin";

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Storage call failed: {0}")]
    Storage(#[from] StorageError),

    #[error("Metadata store failed: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("ScaleIO system not found (id '{id}', name '{name}')")]
    SystemNotFound { id: String, name: String },

    #[error("{kind} '{name}' not found after create")]
    NotFoundAfterCreate { kind: &'static str, name: String },

    #[error("No SDS available in protection domain '{0}'")]
    MissingSds(String),
}

/// Ergebnis eines Passes für einen Node.
#[derive(Debug)]
pub enum NodeOutcome {
    /// Weder deklarativ noch gemeldet
    Skipped,
    /// Nichts zu tun, kein externer Aufruf
    Unchanged,
    Applied,
    Failed(ReconcileError),
}

#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub nodes: BTreeMap<String, NodeOutcome>,
}

impl ReconcileReport {
    pub fn failed(&self) -> impl Iterator<Item = (&String, &ReconcileError)> {
        self.nodes.iter().filter_map(|(host, outcome)| match outcome {
            NodeOutcome::Failed(e) => Some((host, e)),
            _ => None,
        })
    }

    pub fn applied(&self) -> usize {
        self.nodes
            .values()
            .filter(|o| matches!(o, NodeOutcome::Applied))
            .count()
    }
}

/// Führt einen Reconciliation-Pass über alle Nodes des Snapshots aus.
///
/// Fehler eines Nodes stoppen die anderen Nodes nicht. Nur wenn keine
/// Session zum Gateway aufgebaut werden kann, bricht der Pass ab.
pub async fn reconcile<S, B>(snapshot: &ClusterState, store: &S, backend: &B) -> Result<ReconcileReport, ReconcileError>
where
    S: MetadataStore + ?Sized,
    B: StorageBackend + ?Sized,
{
    let mut report = ReconcileReport::default();
    let mut session: Option<(B::Session, ObjectRef)> = None;

    for node in snapshot.nodes.values() {
        let hostname = node.hostname.clone();

        if !node.declarative && !node.advertised {
            debug!(hostname = %hostname, "node neither declarative nor advertised, skipping");
            report.nodes.insert(hostname, NodeOutcome::Skipped);
            continue;
        }

        let mut shadow = match store.metadata(&hostname).await {
            Ok(Some(shadow)) => shadow,
            Ok(None) => {
                warn!(hostname = %hostname, "no previous metadata, starting empty");
                ShadowMetadata::default()
            }
            Err(e) => {
                report.nodes.insert(hostname, NodeOutcome::Failed(e.into()));
                continue;
            }
        };

        let deleted = shadow.process_deletions(&node.provides);
        let added = shadow.process_additions(&node.provides, sds_name(node));

        if !deleted && !added && !shadow.has_pending() {
            report.nodes.insert(hostname, NodeOutcome::Unchanged);
            continue;
        }

        if session.is_none() {
            match connect(snapshot, backend).await {
                Ok(connected) => session = Some(connected),
                Err(e) => {
                    if let Err(store_err) = store.set_metadata(&hostname, &shadow).await {
                        warn!(hostname = %hostname, error = %store_err, "failed to persist metadata");
                    }
                    return Err(e);
                }
            }
        }
        let Some((sess, system)) = session.as_ref() else {
            continue;
        };

        let applied = apply_node(sess, system, node, &mut shadow).await;
        apply_deletions(sess, system, &hostname, &mut shadow).await;

        let persisted = store.set_metadata(&hostname, &shadow).await;

        let outcome = match (applied, persisted) {
            (Err(e), _) => NodeOutcome::Failed(e),
            (Ok(()), Err(e)) => NodeOutcome::Failed(e.into()),
            (Ok(()), Ok(())) => NodeOutcome::Applied,
        };
        if let NodeOutcome::Failed(e) = &outcome {
            warn!(hostname = %hostname, error = %e, "reconciliation failed for node");
        } else {
            info!(hostname = %hostname, "reconciled node topology");
        }
        report.nodes.insert(hostname, outcome);
    }

    Ok(report)
}

/// Der SDS eines Nodes heißt wie seine IP, ersatzweise wie sein Hostname.
fn sds_name(node: &Node) -> &str {
    if node.ip_address.is_empty() {
        &node.hostname
    } else {
        &node.ip_address
    }
}

async fn connect<B>(snapshot: &ClusterState, backend: &B) -> Result<(B::Session, ObjectRef), ReconcileError>
where
    B: StorageBackend + ?Sized,
{
    let scaleio = &snapshot.scaleio;
    let endpoint = format!("https://{}/api", snapshot.gateway_address()?);
    let credentials = Credentials {
        username: ADMIN_USER.to_string(),
        password: scaleio.admin_password.clone(),
    };

    let session = backend
        .authenticate(&endpoint, &scaleio.api_version, &credentials)
        .await?;
    let system = session
        .find_system(&scaleio.cluster_id, &scaleio.cluster_name)
        .await?
        .ok_or_else(|| ReconcileError::SystemNotFound {
            id: scaleio.cluster_id.clone(),
            name: scaleio.cluster_name.clone(),
        })?;

    Ok((session, system))
}

/// Legt alle Entitäten mit `add`-Flag an und bestätigt sie per Lookup.
async fn apply_node<T>(session: &T, system: &ObjectRef, node: &Node, shadow: &mut ShadowMetadata) -> Result<(), ReconcileError>
where
    T: StorageSession + ?Sized,
{
    for (domain_name, domain) in shadow.domains.iter_mut() {
        if domain.delete {
            continue;
        }

        let mut pd = session.find_protection_domain(system, domain_name).await?;
        if pd.is_none() && domain.add {
            session.create_protection_domain(system, domain_name).await?;
            pd = session.find_protection_domain(system, domain_name).await?;
        }
        let pd = pd.ok_or_else(|| ReconcileError::NotFoundAfterCreate {
            kind: "protection domain",
            name: domain_name.clone(),
        })?;
        domain.add = false;

        let mut sds_id = None;
        for (sds_name, sds) in domain.sdss.iter_mut() {
            if sds.delete {
                continue;
            }

            let mut found = session.find_sds(&pd, sds_name).await?;
            if found.is_none() && sds.add {
                let spec = SdsSpec {
                    name: sds_name.clone(),
                    ips: vec![sds_name.clone()],
                    modes: vec![sds.mode.clone()],
                    fault_set: sds.fault_set.clone(),
                };
                session.create_sds(&pd, &spec).await?;
                found = session.find_sds(&pd, sds_name).await?;
            }
            let found = found.ok_or_else(|| ReconcileError::NotFoundAfterCreate {
                kind: "sds",
                name: sds_name.clone(),
            })?;
            sds.add = false;
            if sds_id.is_none() {
                sds_id = Some(found.id);
            }
        }

        for (pool_name, pool) in domain.pools.iter_mut() {
            if pool.delete {
                continue;
            }

            let mut sp = session.find_storage_pool(&pd, pool_name).await?;
            if sp.is_none() && pool.add {
                session.create_storage_pool(&pd, pool_name).await?;
                sp = session.find_storage_pool(&pd, pool_name).await?;
            }
            let sp = sp.ok_or_else(|| ReconcileError::NotFoundAfterCreate {
                kind: "storage pool",
                name: pool_name.clone(),
            })?;
            pool.add = false;

            for (path, device) in pool.devices.iter_mut() {
                if !device.add || device.delete {
                    continue;
                }
                let sds_id = sds_id
                    .as_deref()
                    .ok_or_else(|| ReconcileError::MissingSds(domain_name.clone()))?;

                session.attach_device(&sp, path, sds_id).await?;
                device.add = false;
                debug!(hostname = %node.hostname, device = %path, pool = %pool_name, "attached device");
            }
        }
    }

    Ok(())
}

/// Entfernt alle Entitäten mit `delete`-Flag, best effort.
///
/// Reihenfolge: Devices, Pools, SDS, Domain. Fehlschläge werden geloggt,
/// das Flag bleibt stehen und der nächste Pass versucht es erneut.
async fn apply_deletions<T>(session: &T, system: &ObjectRef, hostname: &str, shadow: &mut ShadowMetadata)
where
    T: StorageSession + ?Sized,
{
    let mut gone_domains = Vec::new();

    for (domain_name, domain) in shadow.domains.iter_mut() {
        let wants_removal = domain.delete
            || domain.sdss.values().any(|s| s.delete)
            || domain
                .pools
                .values()
                .any(|p| p.delete || p.devices.values().any(|d| d.delete));
        if !wants_removal {
            continue;
        }

        let pd = match session.find_protection_domain(system, domain_name).await {
            Ok(pd) => pd,
            Err(e) => {
                warn!(hostname, domain = %domain_name, error = %e, "lookup for removal failed");
                continue;
            }
        };
        let Some(pd) = pd else {
            // Domain existiert extern nicht mehr: alles darunter ist weg
            if domain.delete {
                gone_domains.push(domain_name.clone());
            } else {
                domain.sdss.retain(|_, s| !s.delete);
                domain.pools.retain(|_, p| !p.delete);
                for pool in domain.pools.values_mut() {
                    pool.devices.retain(|_, d| !d.delete);
                }
            }
            continue;
        };

        let mut gone_pools = Vec::new();
        for (pool_name, pool) in domain.pools.iter_mut() {
            if !pool.delete && !pool.devices.values().any(|d| d.delete) {
                continue;
            }

            let sp = match session.find_storage_pool(&pd, pool_name).await {
                Ok(Some(sp)) => sp,
                Ok(None) => {
                    if pool.delete {
                        gone_pools.push(pool_name.clone());
                    } else {
                        pool.devices.retain(|_, d| !d.delete);
                    }
                    continue;
                }
                Err(e) => {
                    warn!(hostname, pool = %pool_name, error = %e, "lookup for removal failed");
                    continue;
                }
            };

            let mut gone_devices = Vec::new();
            for (path, device) in pool.devices.iter() {
                if !device.delete {
                    continue;
                }
                let result = match session.find_device(&sp, path).await {
                    Ok(Some(dev)) => session.detach_device(&dev).await,
                    Ok(None) => Ok(()),
                    Err(e) => Err(e),
                };
                match result {
                    Ok(()) => gone_devices.push(path.clone()),
                    Err(e) => warn!(hostname, device = %path, error = %e, "device removal failed"),
                }
            }
            for path in gone_devices {
                pool.devices.remove(&path);
            }

            if pool.delete {
                if !pool.devices.is_empty() {
                    continue;
                }
                match session.remove_storage_pool(&sp).await {
                    Ok(()) => gone_pools.push(pool_name.clone()),
                    Err(e) => warn!(hostname, pool = %pool_name, error = %e, "storage pool removal failed"),
                }
            }
        }
        for name in gone_pools {
            domain.pools.remove(&name);
        }

        let mut gone_sdss = Vec::new();
        for (sds_name, sds) in domain.sdss.iter() {
            if !sds.delete {
                continue;
            }
            let result = match session.find_sds(&pd, sds_name).await {
                Ok(Some(found)) => session.remove_sds(&found).await,
                Ok(None) => Ok(()),
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => gone_sdss.push(sds_name.clone()),
                Err(e) => warn!(hostname, sds = %sds_name, error = %e, "sds removal failed"),
            }
        }
        for name in gone_sdss {
            domain.sdss.remove(&name);
        }

        if domain.delete && domain.pools.is_empty() && domain.sdss.is_empty() {
            match session.remove_protection_domain(&pd).await {
                Ok(()) => gone_domains.push(domain_name.clone()),
                Err(e) => warn!(hostname, domain = %domain_name, error = %e, "protection domain removal failed"),
            }
        }
    }

    for name in gone_domains {
        shadow.domains.remove(&name);
    }
}

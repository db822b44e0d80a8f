//! Shadow Metadata - Was im Storage-System bereits angelegt wurde
//!
//! Pro Node wird gespeichert, welche Domains, SDS, Pools und Devices
//! bereits existieren. Jede Entität trägt zwei Flags:
//! - `add`: Anlegen steht aus oder ist fehlgeschlagen
//! - `delete`: Entfernen steht aus oder ist fehlgeschlagen
//!
//! Entitäten werden erst aus dem Shadow gelöscht, wenn das externe
//! Entfernen erfolgreich war.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::topology::Topology;

/// Modus mit dem ein SDS angelegt wird.
pub const SDS_MODE_ALL: &str = "all";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShadowMetadata {
    pub domains: BTreeMap<String, ShadowDomain>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShadowDomain {
    pub name: String,
    pub add: bool,
    pub delete: bool,
    pub sdss: BTreeMap<String, ShadowSds>,
    pub pools: BTreeMap<String, ShadowPool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShadowSds {
    pub name: String,
    pub add: bool,
    pub delete: bool,
    pub mode: String,
    pub fault_set: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShadowPool {
    pub name: String,
    pub add: bool,
    pub delete: bool,
    pub devices: BTreeMap<String, ShadowDevice>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShadowDevice {
    pub name: String,
    pub add: bool,
    pub delete: bool,
}

/// Setzt ein Flag. Gibt true zurück wenn es vorher nicht gesetzt war.
fn raise(flag: &mut bool) -> bool {
    let changed = !*flag;
    *flag = true;
    changed
}

/// Löscht ein Flag. Gibt true zurück wenn es vorher gesetzt war.
fn clear(flag: &mut bool) -> bool {
    let changed = *flag;
    *flag = false;
    changed
}

impl ShadowDomain {
    fn pending(name: &str) -> Self {
        Self {
            name: name.to_string(),
            add: true,
            ..Default::default()
        }
    }
}

impl ShadowPool {
    fn pending(name: &str) -> Self {
        Self {
            name: name.to_string(),
            add: true,
            ..Default::default()
        }
    }
}

impl ShadowDevice {
    fn pending(name: &str) -> Self {
        Self {
            name: name.to_string(),
            add: true,
            delete: false,
        }
    }
}

impl ShadowSds {
    fn pending(name: &str) -> Self {
        Self {
            name: name.to_string(),
            add: true,
            delete: false,
            mode: SDS_MODE_ALL.to_string(),
            fault_set: None,
        }
    }
}

impl ShadowMetadata {
    /// Markiert alles zum Löschen, was nicht mehr deklariert ist.
    ///
    /// - Domain fehlt oder hat keine Pools: Domain und alle ihre SDS
    /// - Pool fehlt, hat keine Devices oder liegt in einer gelöschten Domain
    /// - Device fehlt oder liegt in einem gelöschten Pool
    ///
    /// Gibt true zurück wenn mindestens ein Flag neu gesetzt wurde.
    pub fn process_deletions(&mut self, declared: &Topology) -> bool {
        let mut changed = false;

        for (domain_name, domain) in self.domains.iter_mut() {
            let declared_domain = declared.domains.get(domain_name);

            if declared_domain.map_or(true, |d| d.pools.is_empty()) {
                changed |= raise(&mut domain.delete);
            }

            if domain.delete {
                for sds in domain.sdss.values_mut() {
                    changed |= raise(&mut sds.delete);
                }
            }

            for (pool_name, pool) in domain.pools.iter_mut() {
                let declared_pool = declared_domain.and_then(|d| d.pools.get(pool_name));

                if domain.delete || declared_pool.map_or(true, |p| p.devices.is_empty()) {
                    changed |= raise(&mut pool.delete);
                }

                for (device_name, device) in pool.devices.iter_mut() {
                    let still_declared = declared_pool.is_some_and(|p| p.devices.contains(device_name));
                    if pool.delete || !still_declared {
                        changed |= raise(&mut device.delete);
                    }
                }
            }
        }

        changed
    }

    /// Legt Shadow-Einträge für alles Deklarierte an, das noch fehlt.
    ///
    /// Pro Domain gibt es genau einen SDS, benannt nach `sds_name` (der IP
    /// des Nodes). Wieder deklarierte Entitäten verlieren ihr `delete`-Flag.
    ///
    /// Gibt true zurück wenn sich etwas geändert hat.
    pub fn process_additions(&mut self, declared: &Topology, sds_name: &str) -> bool {
        let mut changed = false;

        for (domain_name, declared_domain) in &declared.domains {
            // Ohne Pools wird die Domain gelöscht, nicht angelegt
            if declared_domain.pools.is_empty() {
                continue;
            }

            let domain = self.domains.entry(domain_name.clone()).or_insert_with(|| {
                changed = true;
                ShadowDomain::pending(domain_name)
            });
            changed |= clear(&mut domain.delete);

            match domain.sdss.get_mut(sds_name) {
                Some(sds) => changed |= clear(&mut sds.delete),
                None => {
                    changed = true;
                    domain.sdss.insert(sds_name.to_string(), ShadowSds::pending(sds_name));
                }
            }

            for (pool_name, declared_pool) in &declared_domain.pools {
                if declared_pool.devices.is_empty() {
                    continue;
                }

                let pool = domain.pools.entry(pool_name.clone()).or_insert_with(|| {
                    changed = true;
                    ShadowPool::pending(pool_name)
                });
                changed |= clear(&mut pool.delete);

                for device_name in &declared_pool.devices {
                    match pool.devices.get_mut(device_name) {
                        Some(device) => changed |= clear(&mut device.delete),
                        None => {
                            changed = true;
                            pool.devices
                                .insert(device_name.clone(), ShadowDevice::pending(device_name));
                        }
                    }
                }
            }
        }

        changed
    }

    /// Prüft ob noch `add`- oder `delete`-Flags offen sind.
    pub fn has_pending(&self) -> bool {
        self.domains.values().any(|d| {
            d.add
                || d.delete
                || d.sdss.values().any(|s| s.add || s.delete)
                || d.pools.values().any(|p| {
                    p.add || p.delete || p.devices.values().any(|dev| dev.add || dev.delete)
                })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn declared(devices: &[&str]) -> Topology {
        Topology::single_pool("d1", "p1", devices.iter().map(|d| d.to_string()).collect())
    }

    fn settled(devices: &[&str]) -> ShadowMetadata {
        let mut shadow = ShadowMetadata::default();
        shadow.process_additions(&declared(devices), "10.0.0.1");
        clear_all(&mut shadow);
        shadow
    }

    fn clear_all(shadow: &mut ShadowMetadata) {
        for d in shadow.domains.values_mut() {
            d.add = false;
            for s in d.sdss.values_mut() {
                s.add = false;
            }
            for p in d.pools.values_mut() {
                p.add = false;
                for dev in p.devices.values_mut() {
                    dev.add = false;
                }
            }
        }
    }

    #[test]
    fn test_additions_on_empty_shadow() {
        let mut shadow = ShadowMetadata::default();
        let changed = shadow.process_additions(&declared(&["/dev/sdb"]), "10.0.0.1");

        assert!(changed);
        let domain = &shadow.domains["d1"];
        assert!(domain.add);
        assert_eq!(domain.sdss["10.0.0.1"].mode, "all");
        assert!(domain.pools["p1"].add);
        assert!(domain.pools["p1"].devices["/dev/sdb"].add);
        assert!(shadow.has_pending());
    }

    #[test]
    fn test_unchanged_topology_reports_no_change() {
        let mut shadow = settled(&["/dev/sdb"]);

        assert!(!shadow.process_deletions(&declared(&["/dev/sdb"])));
        assert!(!shadow.process_additions(&declared(&["/dev/sdb"]), "10.0.0.1"));
        assert!(!shadow.has_pending());
    }

    #[test]
    fn test_removed_device_is_flagged() {
        let mut shadow = settled(&["/dev/sdb", "/dev/sdc"]);

        assert!(shadow.process_deletions(&declared(&["/dev/sdb"])));

        let pool = &shadow.domains["d1"].pools["p1"];
        assert!(!pool.delete);
        assert!(!pool.devices["/dev/sdb"].delete);
        assert!(pool.devices["/dev/sdc"].delete);
    }

    #[test]
    fn test_removed_pool_cascades_to_devices() {
        let mut shadow = settled(&["/dev/sdb", "/dev/sdc"]);
        let mut topology = declared(&["/dev/sdb"]);
        let domain = topology.domains.get_mut("d1").unwrap();
        domain.pools.clear();
        domain.pools.insert(
            "p2".into(),
            crate::topology::StoragePool {
                name: "p2".into(),
                devices: vec!["/dev/sdd".into()],
            },
        );

        assert!(shadow.process_deletions(&topology));

        let pool = &shadow.domains["d1"].pools["p1"];
        assert!(pool.delete);
        assert!(pool.devices.values().all(|d| d.delete));
        assert!(!shadow.domains["d1"].delete);
    }

    #[test]
    fn test_removed_domain_cascades_everywhere() {
        let mut shadow = settled(&["/dev/sdb"]);

        assert!(shadow.process_deletions(&Topology::default()));

        let domain = &shadow.domains["d1"];
        assert!(domain.delete);
        assert!(domain.sdss["10.0.0.1"].delete);
        assert!(domain.pools["p1"].delete);
        assert!(domain.pools["p1"].devices["/dev/sdb"].delete);
    }

    #[test]
    fn test_domain_without_pools_is_deleted_not_added() {
        let mut shadow = settled(&["/dev/sdb"]);
        let mut topology = declared(&[]);
        topology.domains.get_mut("d1").unwrap().pools.clear();

        shadow.process_deletions(&topology);
        shadow.process_additions(&topology, "10.0.0.1");

        assert!(shadow.domains["d1"].delete);

        let mut fresh = ShadowMetadata::default();
        assert!(!fresh.process_additions(&topology, "10.0.0.1"));
        assert!(fresh.domains.is_empty());
    }

    #[test]
    fn test_second_deletion_pass_reports_no_change() {
        let mut shadow = settled(&["/dev/sdb"]);

        assert!(shadow.process_deletions(&Topology::default()));
        assert!(!shadow.process_deletions(&Topology::default()));
        assert!(shadow.has_pending());
    }

    #[test]
    fn test_redeclared_entity_clears_delete() {
        let mut shadow = settled(&["/dev/sdb"]);
        shadow.process_deletions(&Topology::default());

        let changed = shadow.process_additions(&declared(&["/dev/sdb"]), "10.0.0.1");

        assert!(changed);
        assert!(!shadow.has_pending());
    }
}

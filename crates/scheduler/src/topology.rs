//! Declared storage topology, decoded from offer attributes.
//!
//! A node declares its topology with flat attributes, all carrying a
//! role prefix (`scaleio-sds` for storage it provides, `scaleio-sdc` for
//! storage it consumes):
//!
//! ```text
//! scaleio-sds-domains=d1,d2
//! scaleio-sds-d1=p1,p2                  pools of d1
//! scaleio-sds-d1-p1=/dev/sdb,/dev/sdc   devices of d1/p1
//! scaleio-sds-d1-faultsets=fs1          fault sets of d1
//! scaleio-sds-d1-fs1=10.0.0.1,10.0.0.2  members of d1/fs1
//! ```
//!
//! Devices may also be listed under the legacy key `scaleio-sds-<pool>`.
//! The `<domain>-<pool>` key always wins. The legacy key is not read for a
//! pool named like a declared domain or `domains`, since that key holds a
//! pool or domain list.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::offer::Attribute;

pub const SERVER_PREFIX: &str = "scaleio-sds";
pub const CLIENT_PREFIX: &str = "scaleio-sdc";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Storage the node contributes
    Server,
    /// Storage the node needs access to
    Client,
}

impl Role {
    pub fn prefix(self) -> &'static str {
        match self {
            Role::Server => SERVER_PREFIX,
            Role::Client => CLIENT_PREFIX,
        }
    }

    /// Brings a key into `<prefix>-<key>` form unless it already carries the prefix.
    pub fn fix_key(self, key: &str) -> String {
        let prefix = self.prefix();
        if key.contains(prefix) {
            key.to_string()
        } else {
            format!("{prefix}-{key}")
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    pub domains: BTreeMap<String, ProtectionDomain>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectionDomain {
    pub name: String,
    pub pools: BTreeMap<String, StoragePool>,
    pub fault_sets: BTreeMap<String, FaultSet>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoragePool {
    pub name: String,
    pub devices: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultSet {
    pub name: String,
    /// IPs of the member nodes
    pub members: Vec<String>,
}

impl Topology {
    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    /// Single domain with a single pool, used for advertised devices.
    pub fn single_pool(domain: &str, pool: &str, devices: Vec<String>) -> Self {
        let mut pools = BTreeMap::new();
        pools.insert(
            pool.to_string(),
            StoragePool {
                name: pool.to_string(),
                devices,
            },
        );

        let mut domains = BTreeMap::new();
        domains.insert(
            domain.to_string(),
            ProtectionDomain {
                name: domain.to_string(),
                pools,
                fault_sets: BTreeMap::new(),
            },
        );

        Self { domains }
    }

    pub fn devices(&self) -> impl Iterator<Item = &str> {
        self.domains
            .values()
            .flat_map(|d| d.pools.values())
            .flat_map(|p| p.devices.iter().map(String::as_str))
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Decodes the topology for one role.
///
/// Returns `None` if the node declares no domain for this role, i.e. it
/// is not declarative. Missing nested attributes are logged and skipped.
pub fn decode(attributes: &BTreeMap<String, String>, role: Role) -> Option<Topology> {
    let lookup = |key: &str| attributes.get(&role.fix_key(key)).map(String::as_str);

    let domain_names = split_list(lookup("domains")?);
    if domain_names.is_empty() {
        return None;
    }

    let mut topology = Topology::default();
    let reserved: Vec<String> = domain_names.iter().cloned().chain(["domains".to_string()]).collect();
    let legacy = |pool: &str| {
        if reserved.iter().any(|r| r == pool) {
            None
        } else {
            lookup(pool)
        }
    };

    for domain_name in domain_names {
        let mut domain = ProtectionDomain {
            name: domain_name.clone(),
            ..Default::default()
        };

        match lookup(&format!("{domain_name}-faultsets")) {
            Some(value) => {
                for fault_set in split_list(value) {
                    let members = match lookup(&format!("{domain_name}-{fault_set}")) {
                        Some(value) => split_list(value),
                        None => {
                            warn!(domain = %domain_name, fault_set = %fault_set, "fault set has no members");
                            Vec::new()
                        }
                    };
                    domain.fault_sets.insert(
                        fault_set.clone(),
                        FaultSet {
                            name: fault_set,
                            members,
                        },
                    );
                }
            }
            None => warn!(domain = %domain_name, prefix = role.prefix(), "no fault sets declared"),
        }

        match lookup(&domain_name) {
            Some(value) => {
                for pool in split_list(value) {
                    let devices = lookup(&format!("{domain_name}-{pool}")).or_else(|| legacy(&pool));
                    let devices = match devices {
                        Some(value) => split_list(value),
                        None => {
                            warn!(domain = %domain_name, pool = %pool, "storage pool has no devices");
                            Vec::new()
                        }
                    };
                    domain.pools.insert(
                        pool.clone(),
                        StoragePool {
                            name: pool,
                            devices,
                        },
                    );
                }
            }
            None => warn!(domain = %domain_name, prefix = role.prefix(), "no storage pools declared"),
        }

        topology.domains.insert(domain_name, domain);
    }

    Some(topology)
}

/// Inverse of [`decode`]. Empty lists are omitted.
pub fn encode(topology: &Topology, role: Role) -> Vec<Attribute> {
    let mut attributes = Vec::new();
    if topology.is_empty() {
        return attributes;
    }

    let join = |items: Vec<&str>| items.join(",");

    attributes.push(Attribute::new(
        role.fix_key("domains"),
        join(topology.domains.keys().map(String::as_str).collect()),
    ));

    for (name, domain) in &topology.domains {
        if !domain.pools.is_empty() {
            attributes.push(Attribute::new(
                role.fix_key(name),
                join(domain.pools.keys().map(String::as_str).collect()),
            ));
        }
        for (pool_name, pool) in &domain.pools {
            if !pool.devices.is_empty() {
                attributes.push(Attribute::new(
                    role.fix_key(&format!("{name}-{pool_name}")),
                    join(pool.devices.iter().map(String::as_str).collect()),
                ));
            }
        }

        if !domain.fault_sets.is_empty() {
            attributes.push(Attribute::new(
                role.fix_key(&format!("{name}-faultsets")),
                join(domain.fault_sets.keys().map(String::as_str).collect()),
            ));
        }
        for (fs_name, fault_set) in &domain.fault_sets {
            if !fault_set.members.is_empty() {
                attributes.push(Attribute::new(
                    role.fix_key(&format!("{name}-{fs_name}")),
                    join(fault_set.members.iter().map(String::as_str).collect()),
                ));
            }
        }
    }

    attributes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_fix_key() {
        assert_eq!(Role::Server.fix_key("domains"), "scaleio-sds-domains");
        assert_eq!(Role::Server.fix_key("scaleio-sds-domains"), "scaleio-sds-domains");
        assert_eq!(Role::Client.fix_key("d1"), "scaleio-sdc-d1");
    }

    #[test]
    fn test_decode_without_domains_is_not_declarative() {
        let attributes = attrs(&[("scaleio-sds-d1", "p1")]);
        assert_eq!(decode(&attributes, Role::Server), None);
    }

    #[test]
    fn test_decode_empty_domain_list_is_not_declarative() {
        let attributes = attrs(&[("scaleio-sds-domains", " , ")]);
        assert_eq!(decode(&attributes, Role::Server), None);
    }

    #[test]
    fn test_decode_full_tree() {
        let attributes = attrs(&[
            ("scaleio-sds-domains", "d1"),
            ("scaleio-sds-d1", "p1,p2"),
            ("scaleio-sds-d1-p1", "/dev/sdb,/dev/sdc"),
            ("scaleio-sds-d1-p2", "/dev/sdd"),
            ("scaleio-sds-d1-faultsets", "fs1"),
            ("scaleio-sds-d1-fs1", "10.0.0.1,10.0.0.2"),
        ]);

        let topology = decode(&attributes, Role::Server).unwrap();
        let domain = &topology.domains["d1"];

        assert_eq!(domain.pools["p1"].devices, vec!["/dev/sdb", "/dev/sdc"]);
        assert_eq!(domain.pools["p2"].devices, vec!["/dev/sdd"]);
        assert_eq!(domain.fault_sets["fs1"].members, vec!["10.0.0.1", "10.0.0.2"]);
    }

    #[test]
    fn test_decode_legacy_device_key() {
        let attributes = attrs(&[
            ("scaleio-sds-domains", "d1"),
            ("scaleio-sds-d1", "p1"),
            ("scaleio-sds-p1", "/dev/sdb"),
        ]);

        let topology = decode(&attributes, Role::Server).unwrap();
        assert_eq!(topology.domains["d1"].pools["p1"].devices, vec!["/dev/sdb"]);
    }

    #[test]
    fn test_decode_missing_nested_keys_is_not_an_error() {
        let attributes = attrs(&[("scaleio-sds-domains", "d1,d2"), ("scaleio-sds-d2", "p1")]);

        let topology = decode(&attributes, Role::Server).unwrap();

        assert!(topology.domains["d1"].pools.is_empty());
        assert!(topology.domains["d2"].pools["p1"].devices.is_empty());
    }

    #[test]
    fn test_decode_roles_are_independent() {
        let attributes = attrs(&[("scaleio-sdc-domains", "d1"), ("scaleio-sdc-d1", "p1")]);

        assert!(decode(&attributes, Role::Server).is_none());
        assert!(decode(&attributes, Role::Client).is_some());
    }

    #[test]
    fn test_single_pool_devices() {
        let topology = Topology::single_pool("default", "pool", vec!["/dev/sdb".into()]);
        assert_eq!(topology.devices().collect::<Vec<_>>(), vec!["/dev/sdb"]);
    }

    #[test]
    fn test_decode_pool_named_like_domain_ignores_legacy_key() {
        let attributes = attrs(&[
            ("scaleio-sds-domains", "fast,slow"),
            ("scaleio-sds-fast", "slow"),
            ("scaleio-sds-slow", "p1"),
            ("scaleio-sds-slow-p1", "/dev/sdc"),
        ]);

        let topology = decode(&attributes, Role::Server).unwrap();

        assert!(topology.domains["fast"].pools["slow"].devices.is_empty());
        assert_eq!(topology.domains["slow"].pools["p1"].devices, vec!["/dev/sdc"]);
    }

    #[test]
    fn test_decode_domain_pool_key_wins_over_legacy_key() {
        let attributes = attrs(&[
            ("scaleio-sds-domains", "d1"),
            ("scaleio-sds-d1", "p1"),
            ("scaleio-sds-d1-p1", "/dev/sdb"),
            ("scaleio-sds-p1", "/dev/sdz"),
        ]);

        let topology = decode(&attributes, Role::Server).unwrap();
        assert_eq!(topology.domains["d1"].pools["p1"].devices, vec!["/dev/sdb"]);
    }

    fn round_trip(topology: &Topology, role: Role) -> Option<Topology> {
        let attributes = encode(topology, role)
            .into_iter()
            .map(|a| (a.name, a.value))
            .collect();
        decode(&attributes, role)
    }

    fn pool(name: &str, devices: &[&str]) -> (String, StoragePool) {
        (
            name.to_string(),
            StoragePool {
                name: name.to_string(),
                devices: devices.iter().map(|d| d.to_string()).collect(),
            },
        )
    }

    #[test]
    fn test_encode_decode_multi_domain_server_topology() {
        let mut topology = Topology::default();
        topology.domains.insert(
            "d1".to_string(),
            ProtectionDomain {
                name: "d1".to_string(),
                pools: [pool("p1", &["/dev/sdb", "/dev/sdc"]), pool("p2", &["/dev/sdd"])].into(),
                fault_sets: [(
                    "fs1".to_string(),
                    FaultSet {
                        name: "fs1".to_string(),
                        members: vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()],
                    },
                )]
                .into(),
            },
        );
        topology.domains.insert(
            "d2".to_string(),
            ProtectionDomain {
                name: "d2".to_string(),
                pools: [pool("p1", &["/dev/sde"]), pool("empty", &[])].into(),
                fault_sets: BTreeMap::new(),
            },
        );

        assert_eq!(round_trip(&topology, Role::Server), Some(topology));
    }

    #[test]
    fn test_encode_decode_client_topology_with_empty_domain() {
        let mut topology = Topology::single_pool("d1", "p1", vec!["/dev/scinia".to_string()]);
        topology.domains.insert(
            "bare".to_string(),
            ProtectionDomain {
                name: "bare".to_string(),
                ..Default::default()
            },
        );

        let attributes = encode(&topology, Role::Client);

        assert!(attributes.iter().all(|a| a.name.starts_with("scaleio-sdc-")));
        assert_eq!(round_trip(&topology, Role::Client), Some(topology));
    }

    #[test]
    fn test_encode_empty_topology_is_not_declarative() {
        assert!(encode(&Topology::default(), Role::Server).is_empty());
        assert_eq!(round_trip(&Topology::default(), Role::Server), None);
    }
}

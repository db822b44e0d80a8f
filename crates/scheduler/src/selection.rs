//! Role selection: which offered machine plays which cluster role.
//!
//! Each manager role is assigned once for the lifetime of the cluster.
//! Resolution order per role:
//!
//! 1. a registered node already holds the role
//! 2. the store remembers a hostname for the role
//! 3. an offer pins the role via the `scaleio-persona` attribute
//! 4. best fit among offers without stored role metadata
//!
//! Every other offered machine becomes a data node.

use std::collections::HashSet;

use scaleio_config::SelectionConfig;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::offer::{Offer, PERSONA_ATTRIBUTE};
use crate::state::{Cluster, Node, NodeState, Persona, Preconfig, StateError};
use crate::store::{MetadataStore, NodeInfo, StoreError};

#[derive(Debug, Error)]
pub enum SelectionError {
    #[error("No acceptable offer for role {0}")]
    NoAcceptableOffer(Persona),

    #[error("Metadata store failed: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    State(#[from] StateError),
}

/// Outcome of one selection pass.
#[derive(Debug, Default)]
pub struct SelectionReport {
    pub managers: Vec<(Persona, String)>,
    pub data_nodes: Vec<String>,
    pub failures: Vec<(String, SelectionError)>,
}

/// First offer whose `scaleio-persona` attribute names this role.
pub fn manually_configured(offers: &[Offer], persona: Persona) -> Option<&Offer> {
    let wanted = persona.attribute_value()?;
    offers
        .iter()
        .find(|o| o.attribute(PERSONA_ATTRIBUTE) == Some(wanted))
}

/// Best fitting offer for a manager role.
///
/// Offers below the minimum CPU or memory (after scaling) are discarded.
/// A candidate beats the current best if it has more than 75% of its CPU
/// and more than 125% of its memory, or simply more CPU. Ties keep the
/// earlier offer.
pub fn best_offer_for_manager<'a>(
    offers: &'a [Offer],
    excluded: &HashSet<String>,
    config: &SelectionConfig,
) -> Option<&'a Offer> {
    let mut best: Option<&Offer> = None;
    let (mut best_cpu, mut best_mem) = (0.0_f64, 0.0_f64);

    for offer in offers {
        if excluded.contains(&offer.hostname) {
            debug!(hostname = %offer.hostname, "offer already has role metadata");
            continue;
        }

        let cpus = offer.scalar("cpus");
        let mem = offer.scalar("mem");

        if config.mdm_cpu >= cpus * config.cpu_factor || config.mdm_memory >= mem * config.memory_factor {
            debug!(hostname = %offer.hostname, cpus, mem, "offer too small for a manager");
            continue;
        }

        if (cpus > best_cpu * 0.75 && mem > best_mem * 1.25) || cpus > best_cpu {
            best = Some(offer);
            best_cpu = cpus;
            best_mem = mem;
        }
    }

    best
}

async fn register<S>(
    cluster: &Cluster,
    store: &S,
    offer: &Offer,
    persona: Persona,
) -> Result<(), SelectionError>
where
    S: MetadataStore + ?Sized,
{
    let state = match store.node_info(&offer.hostname).await? {
        Some(info) => info.state,
        None => {
            store
                .set_node_info(&offer.hostname, NodeInfo::new(persona, NodeState::Unknown))
                .await?;
            NodeState::Unknown
        }
    };

    cluster.register_node(Node::from_offer(offer, persona, state))?;
    Ok(())
}

/// Resolves one manager role. Returns the hostname if a node was registered.
pub async fn select_manager<S>(
    cluster: &Cluster,
    store: &S,
    offers: &[Offer],
    persona: Persona,
    config: &SelectionConfig,
) -> Result<Option<String>, SelectionError>
where
    S: MetadataStore + ?Sized,
{
    if cluster.has_persona(persona) {
        return Ok(None);
    }

    let available: Vec<Offer> = offers
        .iter()
        .filter(|o| !cluster.contains(&o.hostname))
        .cloned()
        .collect();

    if let Some(hostname) = store.mdm_nodes().await?.get(persona) {
        // Rolle ist vergeben, der Rechner hat nur gerade kein Offer
        let Some(offer) = available.iter().find(|o| o.hostname == hostname) else {
            debug!(hostname, %persona, "stored manager not offered yet");
            return Ok(None);
        };
        register(cluster, store, offer, persona).await?;
        info!(hostname, %persona, "restored manager from store");
        return Ok(Some(hostname.to_string()));
    }

    if let Some(offer) = manually_configured(&available, persona) {
        store
            .set_node_info(&offer.hostname, NodeInfo::new(persona, NodeState::Unknown))
            .await?;
        register(cluster, store, offer, persona).await?;
        info!(hostname = %offer.hostname, %persona, "manager pinned by attribute");
        return Ok(Some(offer.hostname.clone()));
    }

    let mut excluded = HashSet::new();
    for offer in &available {
        if store.node_info(&offer.hostname).await?.is_some() {
            excluded.insert(offer.hostname.clone());
        }
    }

    let offer = best_offer_for_manager(&available, &excluded, config)
        .ok_or(SelectionError::NoAcceptableOffer(persona))?;

    store
        .set_node_info(&offer.hostname, NodeInfo::new(persona, NodeState::Unknown))
        .await?;
    register(cluster, store, offer, persona).await?;
    info!(hostname = %offer.hostname, %persona, "manager selected by best fit");
    Ok(Some(offer.hostname.clone()))
}

/// Registers an offer as data node, creating its role metadata if needed.
pub async fn select_data_node<S>(cluster: &Cluster, store: &S, offer: &Offer) -> Result<(), SelectionError>
where
    S: MetadataStore + ?Sized,
{
    register(cluster, store, offer, Persona::DataNode).await
}

/// Runs one selection pass over the current offers.
///
/// A manager role that cannot be resolved aborts the pass. Roles
/// resolved before stay committed. Data node failures are per node and
/// collected in the report.
pub async fn perform_node_selection<S>(
    cluster: &Cluster,
    store: &S,
    offers: &[Offer],
    preconfig: &Preconfig,
    config: &SelectionConfig,
) -> Result<SelectionReport, SelectionError>
where
    S: MetadataStore + ?Sized,
{
    let mut report = SelectionReport::default();

    let static_managers = preconfig.primary_mdm.is_some()
        || preconfig.secondary_mdm.is_some()
        || preconfig.tiebreaker_mdm.is_some();

    if !static_managers {
        for persona in Persona::MANAGERS {
            if let Some(hostname) = select_manager(cluster, store, offers, persona, config).await? {
                report.managers.push((persona, hostname));
            }
        }
    }

    for offer in offers {
        if cluster.contains(&offer.hostname) {
            continue;
        }
        match select_data_node(cluster, store, offer).await {
            Ok(()) => {
                debug!(hostname = %offer.hostname, "registered data node");
                report.data_nodes.push(offer.hostname.clone());
            }
            Err(e) => {
                warn!(hostname = %offer.hostname, error = %e, "failed to register data node");
                report.failures.push((offer.hostname.clone(), e));
            }
        }
    }

    Ok(report)
}

//! Which storage node serves which compute node. Built once at startup and shared
//! read-only afterwards.
use std::path::Path;

use serde::Deserialize;

use crate::common::config::DuplicateClaimPolicy;
use crate::common::hostlist::expand_unique;
use crate::k8s::objects::SystemConfiguration;
use crate::server::allocation::planner::ServerNodeCounts;
use crate::{Map, Set};

#[derive(Debug, Default, Clone)]
pub struct Topology {
    compute_to_storage: Map<String, String>,
    /// Attached compute nodes of each storage node, in inventory order.
    storage_to_computes: Map<String, Vec<String>>,
}

/// Mapping file written by the inventory tooling.
#[derive(Deserialize)]
struct MappingFile {
    rabbits: Map<String, MappedStorage>,
}

#[derive(Deserialize)]
struct MappedStorage {
    hostlist: String,
}

impl Topology {
    /// Builds the topology from `(storage node, attached hosts)` pairs.
    pub fn build<I, H>(storage_nodes: I, policy: DuplicateClaimPolicy) -> crate::Result<Self>
    where
        I: IntoIterator<Item = (String, H)>,
        H: IntoIterator<Item = String>,
    {
        let mut topology = Topology::default();
        for (storage, hosts) in storage_nodes {
            let mut attached = Vec::new();
            for host in hosts {
                if let Some(previous) = topology.compute_to_storage.get(&host) {
                    if previous == &storage {
                        continue;
                    }
                    let message = format!(
                        "Same hostname ({host}) cannot be associated with both {storage} and {previous}"
                    );
                    match policy {
                        DuplicateClaimPolicy::Fail => {
                            return Err(crate::Error::ConfigError(message));
                        }
                        DuplicateClaimPolicy::Warn => {
                            log::warn!("{message}, keeping {previous}");
                            continue;
                        }
                    }
                }
                topology
                    .compute_to_storage
                    .insert(host.clone(), storage.clone());
                attached.push(host);
            }
            topology
                .storage_to_computes
                .entry(storage)
                .or_default()
                .extend(attached);
        }
        Ok(topology)
    }

    pub fn from_system_configuration(
        config: SystemConfiguration,
        policy: DuplicateClaimPolicy,
    ) -> crate::Result<Self> {
        Self::build(
            config.spec.storage_nodes.into_iter().map(|node| {
                (
                    node.name,
                    node.computes_access.into_iter().map(|compute| compute.name),
                )
            }),
            policy,
        )
    }

    pub fn from_mapping_file(path: &Path, policy: DuplicateClaimPolicy) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::Error::ConfigError(format!("Cannot read {}: {e}", path.display()))
        })?;
        let mapping: MappingFile = serde_json::from_str(&content).map_err(|e| {
            crate::Error::ConfigError(format!("Invalid mapping file {}: {e}", path.display()))
        })?;
        let mut storage_nodes = Vec::with_capacity(mapping.rabbits.len());
        for (name, storage) in mapping.rabbits {
            let hosts = expand_unique(&storage.hostlist).map_err(|e| {
                crate::Error::ConfigError(format!("Invalid hostlist of {name}: {e}"))
            })?;
            storage_nodes.push((name, hosts));
        }
        // Map iteration order is arbitrary, keep the result stable
        storage_nodes.sort_by(|a, b| a.0.cmp(&b.0));
        Self::build(storage_nodes, policy)
    }

    pub fn storage_of(&self, host: &str) -> Option<&str> {
        self.compute_to_storage.get(host).map(String::as_str)
    }

    pub fn computes_of(&self, storage: &str) -> &[String] {
        self.storage_to_computes
            .get(storage)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Counts the given hosts per storage node, in the order in which the hosts come.
    pub fn server_counts<S: AsRef<str>>(&self, hosts: &[S]) -> Result<ServerNodeCounts, String> {
        let mut counts = ServerNodeCounts::default();
        let mut unknown = Set::new();
        for host in hosts {
            match self.storage_of(host.as_ref()) {
                Some(storage) => counts.add(storage),
                None => {
                    unknown.insert(host.as_ref().to_string());
                }
            }
        }
        if !unknown.is_empty() {
            let mut unknown: Vec<_> = unknown.into_iter().collect();
            unknown.sort();
            return Err(format!(
                "compute nodes {} are not attached to any storage node",
                unknown.join(",")
            ));
        }
        Ok(counts)
    }
}

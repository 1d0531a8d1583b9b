//! Keeps the scheduler's view of storage nodes in line with what DWS reports.
use std::path::Path;
use std::rc::Rc;

use serde::Deserialize;
use serde_json::Value;

use crate::common::config::RabbitConfig;
use crate::define_wrapped_type;
use crate::gateway::JobManagerNotifier;
use crate::k8s::api::WatchEvent;
use crate::k8s::objects::{Storage, StorageNodeStatus, decode};
use crate::server::topology::Topology;
use crate::{EXCLUDE_PROPERTY, Map, Set};

const DEFAULT_SSD_COUNT: u32 = 36;
const PCIE_DRAIN_REASON: &str = "rabbit lost PCIe connection";

/// Where a storage node lives in the scheduler's resource graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RackPath {
    pub path: String,
    pub ssd_count: u32,
}

/// Parts of the scheduler's resource graph needed to address storage nodes directly.
#[derive(Debug, Default, Clone)]
pub struct ResourceGraph {
    pub racks: Map<String, RackPath>,
    pub compute_nodes: Set<String>,
}

#[derive(Deserialize)]
struct GraphVertex {
    metadata: VertexMetadata,
}

#[derive(Deserialize)]
struct VertexMetadata {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    properties: Map<String, Value>,
    #[serde(default)]
    paths: Map<String, String>,
}

impl ResourceGraph {
    /// Reads `scheduling.graph.nodes` of an R document (or `graph.nodes` of a bare graph).
    pub fn load(path: &Path) -> crate::Result<Self> {
        let document: Value = serde_json::from_slice(&std::fs::read(path)?)?;
        let nodes = document
            .pointer("/scheduling/graph/nodes")
            .or_else(|| document.pointer("/graph/nodes"))
            .cloned()
            .ok_or_else(|| {
                crate::Error::ConfigError(format!(
                    "Resource graph {} does not contain graph nodes",
                    path.display()
                ))
            })?;
        Self::from_vertices(serde_json::from_value(nodes)?)
    }

    fn from_vertices(vertices: Vec<GraphVertex>) -> crate::Result<Self> {
        let mut graph = ResourceGraph::default();
        for GraphVertex { metadata } in vertices {
            let containment = metadata.paths.get("containment").cloned();
            match metadata.kind.as_str() {
                "rack" => {
                    let Some(storage) = metadata.properties.get("rabbit").and_then(Value::as_str)
                    else {
                        continue;
                    };
                    let ssd_count = match metadata.properties.get("ssdcount") {
                        None => Some(DEFAULT_SSD_COUNT),
                        Some(Value::Number(n)) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
                        Some(Value::String(s)) => s.parse().ok(),
                        Some(_) => None,
                    }
                    .ok_or_else(|| {
                        crate::Error::ConfigError(format!(
                            "Invalid ssdcount of rack holding {storage}"
                        ))
                    })?;
                    let path = containment.ok_or_else(|| {
                        crate::Error::ConfigError(format!("Rack holding {storage} has no path"))
                    })?;
                    graph
                        .racks
                        .insert(storage.to_string(), RackPath { path, ssd_count });
                }
                "node" => {
                    graph.compute_nodes.insert(metadata.name);
                }
                _ => {}
            }
        }
        Ok(graph)
    }
}

pub struct StorageManager {
    topology: Rc<Topology>,
    /// Present when storage status is pushed to the scheduler directly.
    graph: Option<ResourceGraph>,
    reported_unknown: Set<String>,
    drain_compute_nodes: bool,
    soft_drain: bool,
    drain_allowlist: Option<Set<String>>,
    exclude_hosts: Set<String>,
    notifier: JobManagerNotifier,
}

define_wrapped_type!(StorageManagerRef, StorageManager, pub);

impl StorageManagerRef {
    pub fn new(
        topology: Rc<Topology>,
        graph: Option<ResourceGraph>,
        config: &RabbitConfig,
        notifier: JobManagerNotifier,
    ) -> Self {
        Self(crate::common::WrappedRcRefCell::wrap(StorageManager {
            topology,
            graph,
            reported_unknown: Set::new(),
            drain_compute_nodes: config.drain_compute_nodes,
            soft_drain: config.soft_drain,
            drain_allowlist: config.drain_allowlist.clone(),
            exclude_hosts: config.exclude_hosts.clone(),
            notifier,
        }))
    }
}

impl StorageManager {
    pub fn on_storage_event(&mut self, event: WatchEvent) {
        let object = match event {
            WatchEvent::Added(object) | WatchEvent::Modified(object) => object,
            WatchEvent::Deleted(object) => {
                log::debug!(
                    "Storage {} was deleted",
                    object.pointer("/metadata/name").and_then(Value::as_str).unwrap_or("?")
                );
                return;
            }
            WatchEvent::Bookmark { .. } | WatchEvent::Error { .. } => return,
        };
        match decode::<Storage>(object) {
            Ok(storage) => self.update(&storage),
            Err(error) => log::error!("Invalid Storage object in event stream: {error}"),
        }
    }

    /// Applies the reported health of one storage node.
    pub fn update(&mut self, storage: &Storage) {
        let name = storage.name();
        let status = storage.node_status();
        log::debug!("Storage {name} is {status:?}");

        if let Some(graph) = &self.graph {
            match graph.racks.get(name) {
                Some(rack) => {
                    let up = status == StorageNodeStatus::Ready;
                    for slot in 0..rack.ssd_count {
                        self.notifier
                            .set_status(format!("{}/ssd{slot}", rack.path), up);
                    }
                }
                None => {
                    if self.reported_unknown.insert(name.to_string()) {
                        log::error!(
                            "Encountered an unknown Storage object '{name}' in the event stream"
                        );
                    }
                }
            }
        }

        let offline = storage.offline_computes();
        if self.drain_compute_nodes {
            let targets: Vec<&String> = offline
                .iter()
                .filter(|host| {
                    self.drain_allowlist
                        .as_ref()
                        .is_none_or(|allowlist| allowlist.contains(host.as_str()))
                })
                .collect();
            if !targets.is_empty() {
                log::debug!("Draining nodes {targets:?} attached to {name}");
                self.notifier.drain(&targets, PCIE_DRAIN_REASON);
            }
        }

        let attached = self.topology.computes_of(name);
        let down: Set<&str> = if status != StorageNodeStatus::Ready {
            attached.iter().map(String::as_str).collect()
        } else if !self.drain_compute_nodes && self.soft_drain {
            offline.iter().map(String::as_str).collect()
        } else {
            Set::new()
        };
        let up: Vec<&str> = attached
            .iter()
            .map(String::as_str)
            .filter(|host| !down.contains(host) && self.is_markable(host))
            .collect();
        let mut down: Vec<&str> = down.into_iter().filter(|host| self.is_markable(host)).collect();
        down.sort_unstable();
        if !up.is_empty() {
            log::debug!("Removing property {EXCLUDE_PROPERTY} from nodes attached to {name}");
            self.notifier.remove_property(&up, EXCLUDE_PROPERTY);
        }
        if !down.is_empty() {
            log::debug!("Adding property {EXCLUDE_PROPERTY} to nodes attached to {name}");
            self.notifier.set_property(&down, &exclusion_value());
        }
    }

    /// Steers jobs away from `nodes`, e.g. after their mounts timed out.
    pub fn mark_nodes(&self, nodes: &[String], reason: &str) {
        let targets: Vec<&str> = nodes
            .iter()
            .map(String::as_str)
            .filter(|host| self.is_markable(host))
            .collect();
        if targets.is_empty() {
            return;
        }
        log::info!("Marking nodes {targets:?}: {reason}");
        self.notifier.set_property(&targets, &exclusion_value());
        if self.drain_compute_nodes {
            self.notifier.drain(&targets, reason);
        }
    }

    fn is_markable(&self, host: &str) -> bool {
        if self.exclude_hosts.contains(host) {
            return false;
        }
        match &self.graph {
            Some(graph) => graph.compute_nodes.contains(host),
            None => self.topology.storage_of(host).is_some(),
        }
    }
}

fn exclusion_value() -> String {
    format!("{EXCLUDE_PROPERTY}=bad")
}

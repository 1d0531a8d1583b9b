use serde::Serialize;

use crate::k8s::objects::{AllocationSetBreakdown, AllocationStrategy};
use crate::server::allocation::PlanError;

/// Number of compute nodes of a job attached to each storage server. Servers are kept
/// in the order in which they were first seen.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerNodeCounts {
    entries: Vec<(String, u32)>,
}

impl ServerNodeCounts {
    pub fn add(&mut self, server: &str) {
        match self.entries.iter_mut().find(|(name, _)| name == server) {
            Some((_, count)) => *count += 1,
            None => self.entries.push((server.to_string(), 1)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn servers(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u32)> {
        self.entries.iter().map(|(name, count)| (name.as_str(), *count))
    }

    /// Up to `n` servers with the most attached nodes. Ties keep the encounter order.
    fn most_common(&self, n: usize) -> Vec<&str> {
        let mut sorted: Vec<&(String, u32)> = self.entries.iter().collect();
        sorted.sort_by(|a, b| b.1.cmp(&a.1));
        sorted
            .into_iter()
            .take(n)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

impl<S: AsRef<str>> FromIterator<S> for ServerNodeCounts {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        let mut counts = ServerNodeCounts::default();
        for server in iter {
            counts.add(server.as_ref());
        }
        counts
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Placement {
    pub allocation_count: u32,
    pub name: String,
}

/// One allocation set of the Servers resource.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedAllocationSet {
    /// Bytes.
    pub allocation_size: u64,
    pub label: String,
    pub storage: Vec<Placement>,
}

fn div_ceil(a: u128, b: u128) -> u64 {
    u64::try_from(a.div_ceil(b)).unwrap_or(u64::MAX)
}

fn gcd(a: u32, b: u32) -> u32 {
    if b == 0 { a } else { gcd(b, a % b) }
}

/// Distributes `count` allocations over the best connected servers, round robin.
fn spread_count(nodes: &ServerNodeCounts, mut count: u32) -> Vec<Placement> {
    let mut placements: Vec<Placement> = Vec::new();
    while count > 0 {
        for name in nodes.most_common(count as usize) {
            match placements.iter_mut().find(|p| p.name == name) {
                Some(placement) => placement.allocation_count += 1,
                None => placements.push(Placement {
                    allocation_count: 1,
                    name: name.to_string(),
                }),
            }
            count -= 1;
            if count == 0 {
                break;
            }
        }
    }
    placements
}

pub fn plan_allocation_set(
    set: &AllocationSetBreakdown,
    nodes: &ServerNodeCounts,
    min_allocation_size: u64,
) -> Result<PlannedAllocationSet, PlanError> {
    if nodes.is_empty() {
        return Err(PlanError::NoServers);
    }
    let minimum = set.minimum_capacity as u128;
    let exact_count = set.constraints.as_ref().and_then(|c| c.count);
    let (size, storage) = match (set.allocation_strategy, exact_count) {
        (AllocationStrategy::PerCompute, _) => (
            set.minimum_capacity,
            nodes
                .iter()
                .map(|(name, count)| Placement {
                    allocation_count: count,
                    name: name.to_string(),
                })
                .collect(),
        ),
        (AllocationStrategy::SingleServer, count)
        | (AllocationStrategy::AcrossServers, count @ Some(_)) => {
            let count = count.unwrap_or(1);
            if count == 0 {
                return Err(PlanError::InvalidCount(set.label.clone()));
            }
            (div_ceil(minimum, count as u128), spread_count(nodes, count))
        }
        (AllocationStrategy::AcrossServers, None) => {
            let divisor = nodes.iter().fold(0, |acc, (_, count)| gcd(acc, count));
            let total: u32 = nodes.iter().map(|(_, count)| count).sum();
            (
                div_ceil(divisor as u128 * minimum, total as u128),
                nodes
                    .iter()
                    .map(|(name, count)| Placement {
                        allocation_count: count / divisor,
                        name: name.to_string(),
                    })
                    .collect(),
            )
        }
    };
    Ok(PlannedAllocationSet {
        allocation_size: size.max(min_allocation_size),
        label: set.label.clone(),
        storage,
    })
}

/// Computes the allocation sets written to the Servers resource of a workflow.
pub fn build_allocation_sets(
    sets: &[AllocationSetBreakdown],
    nodes: &ServerNodeCounts,
    min_allocation_size: u64,
) -> Result<Vec<PlannedAllocationSet>, PlanError> {
    sets.iter()
        .map(|set| plan_allocation_set(set, nodes, min_allocation_size))
        .collect()
}

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::GIB;
use crate::k8s::objects::{AllocationSetBreakdown, DirectiveBreakdown};
use crate::server::allocation::PlanError;
use crate::server::allocation::limits::{RequestedCapacity, ResourceLimits, StorageLabel};

const BREAKDOWN_KIND: &str = "DirectiveBreakdown";
const COPY_OFFLOAD_DAEMON: &str = "copy-offload";
const GROUP_KINDS: [&str; 2] = ["chassis", "rack"];

/// Node of the resource tree of a jobspec. Unknown keys are carried through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResource {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclusive: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub with: Vec<JobResource>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl JobResource {
    pub fn new(kind: &str, count: u64) -> Self {
        JobResource {
            kind: kind.to_string(),
            count: Some(count),
            label: None,
            exclusive: None,
            with: Vec::new(),
            extra: Default::default(),
        }
    }

    fn count_or_one(&self) -> u64 {
        self.count.unwrap_or(1)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Augmentation {
    Rewritten(Vec<JobResource>),
    /// The breakdowns ask for no node-local storage.
    Unchanged,
    /// The resources already carry a storage slot, nothing to do.
    AlreadyApplied,
}

enum Layout<'a> {
    Flat(&'a JobResource),
    Grouped {
        group: &'a JobResource,
        node: &'a JobResource,
    },
}

impl Layout<'_> {
    fn node_count(&self) -> u64 {
        match self {
            Layout::Flat(node) => node.count_or_one(),
            Layout::Grouped { group, node } => group.count_or_one() * node.count_or_one(),
        }
    }
}

/// Returns `None` when the resources were already rewritten.
fn detect_layout(resources: &[JobResource]) -> Result<Option<Layout<'_>>, PlanError> {
    let Some(first) = resources.first() else {
        return Err(PlanError::EmptyResources);
    };
    if first.kind == "slot" && first.with.len() == 2 {
        if let Some(child) = first.with.iter().find(|c| c.kind != "ssd" && c.kind != "node") {
            return Err(PlanError::UnexpectedSlotContent(child.kind.clone()));
        }
        return Ok(None);
    }
    if resources.len() == 1 {
        if first.kind == "node" {
            return Ok(Some(Layout::Flat(first)));
        }
        if GROUP_KINDS.contains(&first.kind.as_str()) && first.with.len() == 1 {
            let child = &first.with[0];
            if child.kind == "slot" && child.with.iter().any(|c| c.kind == "ssd") {
                return Ok(None);
            }
            if child.kind == "node" {
                return Ok(Some(Layout::Grouped { group: first, node: child }));
            }
        }
    }
    Err(PlanError::UnsupportedLayout {
        entries: resources.len(),
        first: first.kind.clone(),
    })
}

/// GiB of node-local storage one compute node needs for this allocation set.
fn apply_allocation(
    set: &AllocationSetBreakdown,
    node_count: u64,
    floor_gib: u64,
    requested: &mut RequestedCapacity,
) -> Result<u64, PlanError> {
    let label = StorageLabel::parse(&set.label)?;
    let expected = label.expected_strategy();
    if set.allocation_strategy != expected {
        return Err(PlanError::StrategyMismatch {
            label: set.label.clone(),
            expected,
            got: set.allocation_strategy,
        });
    }
    let capacity_gib = (set.minimum_capacity / GIB).max(floor_gib);
    requested.increment(label, capacity_gib);
    if label.is_per_compute() {
        Ok(capacity_gib)
    } else {
        Ok(capacity_gib / node_count.max(1))
    }
}

fn storage_slot(node: &JobResource, count: u64, ssd_gib: u64) -> JobResource {
    let mut node = node.clone();
    node.count = Some(1);
    let mut ssd = JobResource::new("ssd", ssd_gib);
    ssd.exclusive = Some(true);
    let mut slot = JobResource::new("slot", count);
    slot.label = Some("rabbit".to_string());
    slot.with = vec![node, ssd];
    slot
}

/// Rewrites the resources of a job so that every compute node is paired with the
/// node-local storage the breakdowns ask for. Nothing is modified when any check fails.
pub fn augment_jobspec(
    resources: &[JobResource],
    breakdowns: &[DirectiveBreakdown],
    floor_gib: u64,
    limits: &ResourceLimits,
) -> Result<Augmentation, PlanError> {
    let Some(layout) = detect_layout(resources)? else {
        return Ok(Augmentation::AlreadyApplied);
    };
    let node_count = layout.node_count();
    let mut requested = RequestedCapacity::default();
    let mut ssd_gib = 0;
    let mut applied = false;
    for breakdown in breakdowns {
        let kind = breakdown.kind.as_deref().unwrap_or_default();
        if kind != BREAKDOWN_KIND {
            return Err(PlanError::UnsupportedBreakdownKind(kind.to_string()));
        }
        if !breakdown.is_ready() {
            return Err(PlanError::BreakdownNotReady(breakdown.name().to_string()));
        }
        for set in breakdown.allocation_sets() {
            ssd_gib += apply_allocation(set, node_count, floor_gib, &mut requested)?;
            applied = true;
        }
    }
    requested.validate(limits, node_count)?;
    if !applied {
        return Ok(Augmentation::Unchanged);
    }
    let rewritten = match layout {
        Layout::Flat(node) => storage_slot(node, node_count, ssd_gib),
        Layout::Grouped { group, node } => {
            let mut group = group.clone();
            group.with = vec![storage_slot(node, node.count_or_one(), ssd_gib)];
            group
        }
    };
    Ok(Augmentation::Rewritten(vec![rewritten]))
}

pub fn copy_offload(breakdowns: &[DirectiveBreakdown]) -> bool {
    breakdowns
        .iter()
        .any(|breakdown| breakdown.requires_daemon(COPY_OFFLOAD_DAEMON))
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::{Augmentation, JobResource, augment_jobspec, copy_offload};
    use crate::GIB;
    use crate::k8s::objects::{DirectiveBreakdown, decode};
    use crate::server::allocation::PlanError;
    use crate::server::allocation::limits::ResourceLimits;

    fn breakdown(sets: Value) -> DirectiveBreakdown {
        decode(json!({
            "kind": "DirectiveBreakdown",
            "metadata": {"name": "fluxjob-1-0"},
            "status": {"ready": true, "storage": {"allocationSets": sets}}
        }))
        .unwrap()
    }

    fn xfs(gib: u64) -> DirectiveBreakdown {
        breakdown(json!([{
            "label": "xfs",
            "allocationStrategy": "AllocatePerCompute",
            "minimumCapacity": gib * GIB,
        }]))
    }

    fn lustre10tb() -> DirectiveBreakdown {
        breakdown(json!([
            {"label": "ost", "allocationStrategy": "AllocateAcrossServers", "minimumCapacity": 10240 * GIB},
            {"label": "mgtmdt", "allocationStrategy": "AllocateAcrossServers",
             "minimumCapacity": GIB, "constraints": {"count": 1}},
        ]))
    }

    fn resources(value: Value) -> Vec<JobResource> {
        serde_json::from_value(value).unwrap()
    }

    fn nodes(count: u64) -> Vec<JobResource> {
        resources(json!([{"type": "node", "count": count, "with": [{"type": "slot", "count": 1}]}]))
    }

    fn augment(resources: &[JobResource], breakdowns: &[DirectiveBreakdown], floor: u64) -> Vec<JobResource> {
        match augment_jobspec(resources, breakdowns, floor, &ResourceLimits::default()).unwrap() {
            Augmentation::Rewritten(resources) => resources,
            other => panic!("unexpected result {other:?}"),
        }
    }

    fn ssd_count(resources: &[JobResource]) -> u64 {
        let slot = &resources[0];
        assert_eq!(slot.kind, "slot");
        assert_eq!(slot.with[1].kind, "ssd");
        slot.with[1].count.unwrap()
    }

    #[test]
    fn flat_rewrite_shape() {
        let output = augment(&nodes(4), &[xfs(10)], 1);
        assert_eq!(
            serde_json::to_value(&output).unwrap(),
            json!([{
                "type": "slot",
                "count": 4,
                "label": "rabbit",
                "with": [
                    {"type": "node", "count": 1, "with": [{"type": "slot", "count": 1}]},
                    {"type": "ssd", "count": 10, "exclusive": true}
                ]
            }])
        );
    }

    #[test]
    fn lustre_is_divided_by_nodes() {
        for count in [1, 2, 4, 6, 8] {
            let output = augment(&nodes(count), &[lustre10tb()], 1);
            assert_eq!(ssd_count(&output), 10240 / count + 1 / count);
        }
    }

    #[test]
    fn sum_of_breakdowns() {
        assert_eq!(ssd_count(&augment(&nodes(1), &[xfs(10)], 1)), 10);
        assert_eq!(ssd_count(&augment(&nodes(3), &[xfs(10), xfs(10)], 1)), 20);
        assert_eq!(ssd_count(&augment(&nodes(1), &[xfs(10), lustre10tb()], 1)), 10251);
    }

    #[test]
    fn minimum_size() {
        for floor in [11, 15, 170] {
            assert_eq!(ssd_count(&augment(&nodes(1), &[xfs(10)], floor)), floor);
        }
    }

    #[test]
    fn slot_without_count() {
        let input = resources(json!([{"type": "node", "count": 1, "with": [{"type": "slot"}]}]));
        assert_eq!(ssd_count(&augment(&input, &[xfs(10)], 1)), 10);
    }

    #[test]
    fn rewrite_is_idempotent() {
        let output = augment(&nodes(2), &[xfs(10)], 1);
        assert_eq!(
            augment_jobspec(&output, &[xfs(10)], 1, &ResourceLimits::default()),
            Ok(Augmentation::AlreadyApplied)
        );
    }

    #[test]
    fn hierarchical_rewrite() {
        let input = resources(json!([{"type": "rack", "count": 2, "with": [{"type": "node", "count": 3}]}]));
        let output = augment(&input, &[lustre10tb()], 1);
        assert_eq!(
            serde_json::to_value(&output).unwrap(),
            json!([{
                "type": "rack",
                "count": 2,
                "with": [{
                    "type": "slot",
                    "count": 3,
                    "label": "rabbit",
                    "with": [
                        {"type": "node", "count": 1},
                        {"type": "ssd", "count": 10240 / 6, "exclusive": true}
                    ]
                }]
            }])
        );
        assert_eq!(
            augment_jobspec(&output, &[lustre10tb()], 1, &ResourceLimits::default()),
            Ok(Augmentation::AlreadyApplied)
        );
    }

    #[test]
    fn no_storage_requested() {
        assert_eq!(
            augment_jobspec(&nodes(1), &[breakdown(json!([]))], 1, &ResourceLimits::default()),
            Ok(Augmentation::Unchanged)
        );
    }

    #[test]
    fn bad_resources() {
        let check = |value: Value, expected: PlanError| {
            assert_eq!(
                augment_jobspec(&resources(value), &[xfs(10)], 1, &ResourceLimits::default()),
                Err(expected)
            );
        };
        check(json!([]), PlanError::EmptyResources);
        check(
            json!([{"type": "slot", "count": 1, "with": []}]),
            PlanError::UnsupportedLayout { entries: 1, first: "slot".into() },
        );
        check(
            json!([{"type": "node", "count": 1}, {"type": "node", "count": 1}]),
            PlanError::UnsupportedLayout { entries: 2, first: "node".into() },
        );
        check(
            json!([{"type": "slot", "count": 1, "with": [{"type": "node"}, {"type": "core"}]}]),
            PlanError::UnexpectedSlotContent("core".into()),
        );
    }

    #[test]
    fn bad_breakdowns() {
        let check = |breakdown: DirectiveBreakdown, expected: PlanError| {
            assert_eq!(
                augment_jobspec(&nodes(1), &[breakdown], 1, &ResourceLimits::default()),
                Err(expected)
            );
        };
        let mut wrong_kind = xfs(1);
        wrong_kind.kind = Some("Workflow".into());
        check(wrong_kind, PlanError::UnsupportedBreakdownKind("Workflow".into()));

        let mut not_ready = xfs(1);
        not_ready.status.as_mut().unwrap().ready = false;
        check(not_ready, PlanError::BreakdownNotReady("fluxjob-1-0".into()));

        check(
            breakdown(json!([{"label": "zfs", "allocationStrategy": "AllocatePerCompute", "minimumCapacity": 1}])),
            PlanError::UnknownLabel("zfs".into()),
        );
        let mismatch = augment_jobspec(
            &nodes(1),
            &[breakdown(json!([{"label": "xfs", "allocationStrategy": "AllocateAcrossServers", "minimumCapacity": 1}]))],
            1,
            &ResourceLimits::default(),
        );
        assert_eq!(
            mismatch.unwrap_err().to_string(),
            "xfs allocationStrategy must be 'AllocatePerCompute' but got 'AllocateAcrossServers'"
        );
    }

    #[test]
    fn limits_are_enforced() {
        let limits = ResourceLimits { xfs: Some(50), ..Default::default() };
        let result = augment_jobspec(&nodes(2), &[xfs(51)], 1, &limits);
        assert_eq!(
            result.unwrap_err().to_string(),
            "Requested a total of 51 GiB of xfs storage per node but max is 50 GiB per node"
        );
        let limits = ResourceLimits { lustre: Some(2000), ..Default::default() };
        assert!(augment_jobspec(&nodes(4), &[lustre10tb()], 1, &limits).is_err());
        assert!(augment_jobspec(&nodes(6), &[lustre10tb()], 1, &limits).is_ok());
    }

    #[test]
    fn copy_offload_daemon() {
        let mut breakdown = xfs(1);
        assert!(!copy_offload(std::slice::from_ref(&breakdown)));
        breakdown.status.as_mut().unwrap().required_daemons = vec!["copy-offload".into()];
        assert!(copy_offload(&[breakdown]));
    }
}

//! Typed views of the custom resources. Only the fields used by the bridge are decoded,
//! everything else is left to the API server.
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::JobId;
use crate::k8s::api::ApiResult;

pub fn decode<T: DeserializeOwned>(value: Value) -> ApiResult<T> {
    Ok(serde_json::from_value(value)?)
}

/// Stages of a Workflow, in the order in which they are visited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum WorkflowStage {
    Proposal,
    Setup,
    DataIn,
    PreRun,
    PostRun,
    DataOut,
    Teardown,
}

impl WorkflowStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStage::Proposal => "Proposal",
            WorkflowStage::Setup => "Setup",
            WorkflowStage::DataIn => "DataIn",
            WorkflowStage::PreRun => "PreRun",
            WorkflowStage::PostRun => "PostRun",
            WorkflowStage::DataOut => "DataOut",
            WorkflowStage::Teardown => "Teardown",
        }
    }
}

impl Display for WorkflowStage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRef {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Workflow {
    #[serde(default)]
    pub metadata: ObjectMeta,
    pub spec: WorkflowSpec,
    #[serde(default)]
    pub status: Option<WorkflowStatus>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSpec {
    pub desired_state: WorkflowStage,
    #[serde(default)]
    pub dw_directives: Vec<String>,
    #[serde(rename = "jobID")]
    pub job_id: JobId,
    #[serde(rename = "userID", default)]
    pub user_id: u32,
    #[serde(rename = "groupID", default)]
    pub group_id: u32,
    #[serde(rename = "wlmID", default)]
    pub wlm_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStatus {
    #[serde(default)]
    pub state: Option<WorkflowStage>,
    #[serde(default)]
    pub ready: bool,
    /// Progress of the current state, e.g. `Completed`, `Error` or `TransientCondition`.
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub computes: Option<ResourceRef>,
    #[serde(default)]
    pub directive_breakdowns: Vec<ResourceRef>,
    #[serde(default)]
    pub elapsed_time_last_state: Option<String>,
    #[serde(default)]
    pub workflow_token: Option<WorkflowToken>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowToken {
    #[serde(default)]
    pub secret_name: String,
    #[serde(default)]
    pub secret_namespace: String,
}

/// Status flags that may be reported in any stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowCondition {
    Error,
    TransientCondition,
    Normal,
}

impl Workflow {
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    pub fn job_id(&self) -> JobId {
        self.spec.job_id
    }

    pub fn desired_state(&self) -> WorkflowStage {
        self.spec.desired_state
    }

    pub fn reported_state(&self) -> Option<WorkflowStage> {
        self.status.as_ref().and_then(|status| status.state)
    }

    /// The Workflow works on `stage`, which may not be finished yet.
    pub fn stage_active(&self, stage: WorkflowStage) -> bool {
        self.desired_state() == stage && self.reported_state() == Some(stage)
    }

    /// The Workflow finished `stage` and is waiting for the next desired state.
    pub fn stage_complete(&self, stage: WorkflowStage) -> bool {
        self.stage_active(stage) && self.status.as_ref().map(|s| s.ready).unwrap_or(false)
    }

    pub fn condition(&self) -> WorkflowCondition {
        match self.status.as_ref().and_then(|s| s.status.as_deref()) {
            Some("Error") => WorkflowCondition::Error,
            Some("TransientCondition") => WorkflowCondition::TransientCondition,
            _ => WorkflowCondition::Normal,
        }
    }

    pub fn message(&self) -> &str {
        self.status
            .as_ref()
            .and_then(|s| s.message.as_deref())
            .unwrap_or_default()
    }

    pub fn finalizers(&self) -> &[String] {
        self.metadata.finalizers.as_deref().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocationStrategy {
    #[serde(rename = "AllocatePerCompute")]
    PerCompute,
    #[serde(rename = "AllocateSingleServer")]
    SingleServer,
    #[serde(rename = "AllocateAcrossServers")]
    AcrossServers,
}

impl Display for AllocationStrategy {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            AllocationStrategy::PerCompute => "AllocatePerCompute",
            AllocationStrategy::SingleServer => "AllocateSingleServer",
            AllocationStrategy::AcrossServers => "AllocateAcrossServers",
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DirectiveBreakdown {
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub status: Option<BreakdownStatus>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakdownStatus {
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub storage: Option<StorageBreakdown>,
    #[serde(default)]
    pub required_daemons: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageBreakdown {
    #[serde(default)]
    pub reference: Option<ResourceRef>,
    #[serde(default)]
    pub allocation_sets: Vec<AllocationSetBreakdown>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationSetBreakdown {
    pub label: String,
    pub allocation_strategy: AllocationStrategy,
    /// Bytes.
    pub minimum_capacity: u64,
    #[serde(default)]
    pub constraints: Option<AllocationConstraints>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AllocationConstraints {
    #[serde(default)]
    pub count: Option<u32>,
}

impl DirectiveBreakdown {
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    pub fn is_ready(&self) -> bool {
        self.status.as_ref().map(|s| s.ready).unwrap_or(false)
    }

    pub fn allocation_sets(&self) -> &[AllocationSetBreakdown] {
        self.status
            .as_ref()
            .and_then(|s| s.storage.as_ref())
            .map(|s| s.allocation_sets.as_slice())
            .unwrap_or_default()
    }

    pub fn requires_daemon(&self, daemon: &str) -> bool {
        self.status
            .as_ref()
            .map(|s| s.required_daemons.iter().any(|d| d == daemon))
            .unwrap_or(false)
    }
}

/// Health of a storage node as reported by DWS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageNodeStatus {
    Ready,
    Down,
    Disabled,
    Unknown,
}

impl StorageNodeStatus {
    pub fn parse(status: Option<&str>) -> Self {
        match status {
            Some("Ready") => StorageNodeStatus::Ready,
            Some("Disabled") | Some("Drained") | None => StorageNodeStatus::Disabled,
            Some("Offline") | Some("Failed") | Some("NotPresent") | Some("Degraded") => {
                StorageNodeStatus::Down
            }
            Some(_) => StorageNodeStatus::Unknown,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Storage {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub status: Option<StorageStatus>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageStatus {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub access: Option<StorageAccess>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageAccess {
    #[serde(default)]
    pub computes: Vec<ComputeAccess>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ComputeAccess {
    pub name: String,
    #[serde(default)]
    pub status: Option<String>,
}

impl Storage {
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    pub fn node_status(&self) -> StorageNodeStatus {
        StorageNodeStatus::parse(self.status.as_ref().and_then(|s| s.status.as_deref()))
    }

    pub fn computes(&self) -> &[ComputeAccess] {
        self.status
            .as_ref()
            .and_then(|s| s.access.as_ref())
            .map(|a| a.computes.as_slice())
            .unwrap_or_default()
    }

    /// Compute nodes whose link to this storage node is not healthy.
    pub fn offline_computes(&self) -> Vec<String> {
        self.computes()
            .iter()
            .filter(|c| c.status.as_deref() != Some("Ready"))
            .map(|c| c.name.clone())
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemConfiguration {
    #[serde(default)]
    pub spec: SystemConfigurationSpec,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemConfigurationSpec {
    #[serde(default)]
    pub storage_nodes: Vec<StorageNodeEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageNodeEntry {
    pub name: String,
    #[serde(default)]
    pub computes_access: Vec<ComputeAccessEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ComputeAccessEntry {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientMount {
    #[serde(default)]
    pub spec: ClientMountSpec,
    #[serde(default)]
    pub status: Option<ClientMountStatus>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientMountSpec {
    #[serde(default)]
    pub node: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientMountStatus {
    #[serde(default)]
    pub mounts: Vec<MountStatus>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MountStatus {
    #[serde(default)]
    pub state: String,
}

impl ClientMount {
    /// Every mount of this node has reached `state` (`mounted` or `unmounted`).
    pub fn in_state(&self, state: &str) -> bool {
        match &self.status {
            Some(status) => status.mounts.iter().all(|m| m.state == state),
            None => false,
        }
    }
}

pub fn datamovement_failed(datamovement: &Value) -> bool {
    datamovement.pointer("/status/status").and_then(Value::as_str) == Some("Failed")
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{
        AllocationStrategy, DirectiveBreakdown, Storage, StorageNodeStatus, Workflow,
        WorkflowCondition, WorkflowStage, decode,
    };
    use crate::JobId;

    #[test]
    fn workflow_stage_checks() {
        let workflow: Workflow = decode(json!({
            "metadata": {"name": "fluxjob-58", "finalizers": ["a"]},
            "spec": {"desiredState": "Setup", "jobID": "f21", "userID": 1000, "dwDirectives": []},
            "status": {"state": "Setup", "ready": false, "status": "TransientCondition", "message": "slow"}
        }))
        .unwrap();
        assert_eq!(workflow.name(), "fluxjob-58");
        assert_eq!(workflow.job_id(), JobId::new(58));
        assert!(workflow.stage_active(WorkflowStage::Setup));
        assert!(!workflow.stage_complete(WorkflowStage::Setup));
        assert_eq!(workflow.condition(), WorkflowCondition::TransientCondition);
        assert_eq!(workflow.message(), "slow");
        assert_eq!(workflow.finalizers(), &["a".to_string()]);
    }

    #[test]
    fn breakdown_allocation_sets() {
        let breakdown: DirectiveBreakdown = decode(json!({
            "kind": "DirectiveBreakdown",
            "metadata": {"name": "b"},
            "status": {
                "ready": true,
                "requiredDaemons": ["copy-offload"],
                "storage": {
                    "reference": {"name": "s", "namespace": "default"},
                    "allocationSets": [{
                        "label": "ost",
                        "allocationStrategy": "AllocateAcrossServers",
                        "minimumCapacity": 1024,
                        "constraints": {"count": 2}
                    }]
                }
            }
        }))
        .unwrap();
        assert!(breakdown.is_ready());
        assert!(breakdown.requires_daemon("copy-offload"));
        let sets = breakdown.allocation_sets();
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].allocation_strategy, AllocationStrategy::AcrossServers);
        assert_eq!(sets[0].constraints.as_ref().unwrap().count, Some(2));
    }

    #[test]
    fn storage_status() {
        let storage: Storage = decode(json!({
            "metadata": {"name": "rabbit1"},
            "status": {"status": "Ready", "access": {"computes": [
                {"name": "c1", "status": "Ready"},
                {"name": "c2", "status": "Offline"},
                {"name": "c3"}
            ]}}
        }))
        .unwrap();
        assert_eq!(storage.node_status(), StorageNodeStatus::Ready);
        assert_eq!(storage.offline_computes(), vec!["c2", "c3"]);

        let storage: Storage = decode(json!({"metadata": {"name": "rabbit2"}})).unwrap();
        assert_eq!(storage.node_status(), StorageNodeStatus::Disabled);
        assert!(storage.computes().is_empty());
    }
}

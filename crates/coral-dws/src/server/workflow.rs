//! Per-job bookkeeping of the Workflows owned by this bridge.
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::k8s::objects::WorkflowStage;
use crate::server::allocation::jobspec::JobResource;
use crate::{JobId, Map, workflow_name};

/// The job's resource request, as known to the bridge.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceSnapshot {
    /// Received with `create`, not yet rewritten.
    Pending(Vec<JobResource>),
    /// Rewritten and handed back to the job manager.
    Consumed,
    /// The record was recreated from a watch event, e.g. after a restart.
    Unknown,
}

#[derive(Debug, Clone)]
pub struct TransientCondition {
    pub since: Instant,
    pub message: String,
    /// Desired state of the Workflow when the condition was last reported.
    pub stage: WorkflowStage,
}

/// Soft timeout of the stage a Workflow is currently working on.
#[derive(Debug)]
pub struct ActiveTimer {
    pub stage: WorkflowStage,
    handle: AbortHandle,
}

impl ActiveTimer {
    pub fn new(stage: WorkflowStage, handle: AbortHandle) -> Self {
        Self { stage, handle }
    }
}

impl Drop for ActiveTimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[derive(Debug)]
pub struct WorkflowRecord {
    pub job_id: JobId,
    pub name: String,
    pub resources: ResourceSnapshot,
    /// The Workflow was moved to Teardown, earlier stages must not be requested anymore.
    pub torn_down: bool,
    /// Deletion was handed to the cleanup worker.
    pub deleted: bool,
    pub epilog_removed: bool,
    pub assigned_servers: Option<Vec<String>>,
    pub compute_nodes: Vec<String>,
    /// How many more compute nodes may be given up on before a stuck stage is fatal.
    pub failure_tolerance: u32,
    active_timer: Option<ActiveTimer>,
    pub transient_condition: Option<TransientCondition>,
}

impl WorkflowRecord {
    pub fn new(job_id: JobId, resources: ResourceSnapshot) -> Self {
        Self {
            job_id,
            name: workflow_name(job_id),
            resources,
            torn_down: false,
            deleted: false,
            epilog_removed: false,
            assigned_servers: None,
            compute_nodes: Vec::new(),
            failure_tolerance: 0,
            active_timer: None,
            transient_condition: None,
        }
    }

    /// Replaces the current timer, the previous one (if any) is cancelled.
    pub fn set_timer(&mut self, timer: ActiveTimer) {
        self.active_timer = Some(timer);
    }

    pub fn cancel_timer(&mut self) {
        self.active_timer = None;
    }

    pub fn timer_stage(&self) -> Option<WorkflowStage> {
        self.active_timer.as_ref().map(|t| t.stage)
    }
}

#[derive(Default, Debug)]
pub struct WorkflowRegistry {
    records: Map<JobId, WorkflowRecord>,
}

impl WorkflowRegistry {
    pub fn get(&self, job_id: JobId) -> Option<&WorkflowRecord> {
        self.records.get(&job_id)
    }

    pub fn get_mut(&mut self, job_id: JobId) -> Option<&mut WorkflowRecord> {
        self.records.get_mut(&job_id)
    }

    /// Returns the record of `job_id`, creating one with unknown resources when missing.
    pub fn ensure(&mut self, job_id: JobId) -> &mut WorkflowRecord {
        self.records
            .entry(job_id)
            .or_insert_with(|| WorkflowRecord::new(job_id, ResourceSnapshot::Unknown))
    }

    pub fn insert(&mut self, record: WorkflowRecord) -> &mut WorkflowRecord {
        let job_id = record.job_id;
        self.records.insert(job_id, record);
        self.ensure(job_id)
    }

    pub fn remove(&mut self, job_id: JobId) -> Option<WorkflowRecord> {
        self.records.remove(&job_id)
    }

    pub fn contains(&self, job_id: JobId) -> bool {
        self.records.contains_key(&job_id)
    }

    pub fn job_ids(&self) -> Vec<JobId> {
        let mut ids: Vec<JobId> = self.records.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkflowRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

use itertools::Itertools;
use tokio::time::Instant;

use crate::JobId;
use crate::k8s::CLIENT_MOUNT_CRD;
use crate::k8s::api::{ApiResult, ListOptions, Scope};
use crate::k8s::objects::{ClientMount, WorkflowStage, decode};
use crate::k8s::workflow_label_selector;
use crate::server::reconciler::{
    Reconciler, ReconcilerContext, ReconcilerMessage, move_to_teardown,
};
use crate::server::transitions::{blocks_on_epilog, soft_timeout};
use crate::server::workflow::{ActiveTimer, WorkflowRecord};

const MOUNT_TIMEOUT_REASON: &str = "rabbit mount timed out";

/// Starts the soft timeout of `stage`, if one is configured. A running timer of the
/// same stage is kept.
pub fn start_stage_timer(ctx: &ReconcilerContext, record: &mut WorkflowRecord, stage: WorkflowStage) {
    let Some(timeout) = soft_timeout(stage, &ctx.config.stage_timeouts) else {
        return;
    };
    if record.timer_stage() == Some(stage) {
        return;
    }
    let sender = ctx.sender.clone();
    let job_id = record.job_id;
    let deadline = Instant::now() + timeout;
    let handle = tokio::task::spawn_local(async move {
        tokio::time::sleep_until(deadline).await;
        if sender
            .send(ReconcilerMessage::StageTimeout { job_id, stage })
            .is_err()
        {
            log::debug!("Reconciler stopped before the {stage} timeout of job {job_id}");
        }
    });
    record.set_timer(ActiveTimer::new(stage, handle.abort_handle()));
}

/// Compute nodes of the job whose mounts have not reached the state the stage needs.
async fn lagging_nodes(
    ctx: &ReconcilerContext,
    record: &WorkflowRecord,
    stage: WorkflowStage,
) -> crate::Result<Vec<String>> {
    let target = match stage {
        WorkflowStage::PostRun => "unmounted",
        _ => "mounted",
    };
    let list = ctx
        .api
        .list(
            &CLIENT_MOUNT_CRD,
            Scope::Cluster,
            ListOptions {
                label_selector: Some(workflow_label_selector(&record.name)),
                limit: None,
            },
        )
        .await?;
    let mounts = list
        .items
        .into_iter()
        .map(decode::<ClientMount>)
        .collect::<ApiResult<Vec<_>>>()?;
    Ok(mounts
        .into_iter()
        .filter(|mount| !mount.in_state(target))
        .map(|mount| mount.spec.node)
        .unique()
        .collect())
}

impl Reconciler {
    pub(super) async fn handle_stage_timeout(&mut self, job_id: JobId, stage: WorkflowStage) {
        let ctx = &self.ctx;
        let Some(record) = self.registry.get_mut(job_id) else {
            return;
        };
        if record.timer_stage() != Some(stage) {
            log::debug!("Ignoring stale {stage} timeout of job {job_id}");
            return;
        }
        record.cancel_timer();
        if record.torn_down {
            return;
        }
        log::warn!("Workflow {} did not finish {stage} in time", record.name);

        if record.failure_tolerance > 0 && stage != WorkflowStage::Setup {
            match lagging_nodes(ctx, record, stage).await {
                Ok(nodes)
                    if !nodes.is_empty() && nodes.len() <= record.failure_tolerance as usize =>
                {
                    log::info!(
                        "Giving up on nodes {nodes:?} of job {job_id}, {stage} did not finish there"
                    );
                    record.failure_tolerance -= nodes.len() as u32;
                    ctx.notifier.node_failure(job_id, nodes);
                    start_stage_timer(ctx, record, stage);
                    return;
                }
                Ok(nodes) => {
                    log::debug!("Lagging nodes of job {job_id} cannot be tolerated: {nodes:?}");
                }
                Err(error) => log::error!("Cannot list mounts of job {job_id}: {error}"),
            }
        }

        ctx.notifier.raise(
            job_id,
            format!("DWS/Rabbit interactions failed: workflow timed out in '{stage}'"),
        );
        if blocks_on_epilog(stage) {
            if let Err(error) = move_to_teardown(ctx, record, None).await {
                log::error!("Cannot move workflow {} to Teardown: {error}", record.name);
            }
        }
    }

    /// Fails jobs whose Workflow stays in TransientCondition for too long.
    pub async fn sweep_transient_conditions(&mut self) {
        let ctx = &self.ctx;
        let timeout = ctx.config.tc_timeout;
        let now = Instant::now();
        let expired: Vec<JobId> = self
            .registry
            .iter()
            .filter(|record| {
                record
                    .transient_condition
                    .as_ref()
                    .is_some_and(|condition| now.duration_since(condition.since) > timeout)
            })
            .map(|record| record.job_id)
            .collect();
        for job_id in expired {
            let Some(record) = self.registry.get_mut(job_id) else {
                continue;
            };
            let Some(condition) = record.transient_condition.take() else {
                continue;
            };
            if condition.stage == WorkflowStage::PreRun {
                // Usually a file system that cannot be mounted on some of the nodes
                match lagging_nodes(ctx, record, WorkflowStage::PreRun).await {
                    Ok(nodes) => ctx.storage.get().mark_nodes(&nodes, MOUNT_TIMEOUT_REASON),
                    Err(error) => log::error!("Cannot list mounts of job {job_id}: {error}"),
                }
            }
            ctx.notifier.raise(
                job_id,
                format!(
                    "DWS/Rabbit interactions failed: workflow in 'TransientCondition' state too long: {}",
                    condition.message
                ),
            );
            if blocks_on_epilog(condition.stage) && !record.torn_down {
                if let Err(error) = move_to_teardown(ctx, record, None).await {
                    log::error!("Cannot move workflow {} to Teardown: {error}", record.name);
                }
            }
        }
    }
}

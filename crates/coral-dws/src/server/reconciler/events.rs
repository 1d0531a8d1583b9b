use std::mem;

use serde_json::Value;
use tokio::time::Instant;

use crate::gateway::messages::ResourceUpdate;
use crate::k8s::SECRET_RESOURCE;
use crate::k8s::api::WatchEvent;
use crate::k8s::objects::{Workflow, WorkflowCondition, WorkflowStage, decode};
use crate::server::allocation::jobspec::{Augmentation, augment_jobspec, copy_offload};
use crate::server::cleanup::remove_finalizer;
use crate::server::reconciler::{
    Reconciler, ReconcilerContext, fetch_breakdowns, finalizers_of, move_desired_state,
    move_to_teardown, namespace_or_default, save_elapsed_time, save_workflow, start_stage_timer,
};
use crate::server::transitions::{StageAction, blocks_on_epilog, completion_action};
use crate::server::workflow::{ResourceSnapshot, TransientCondition, WorkflowRecord};
use crate::{EXCLUDE_PROPERTY, GIB, WORKFLOW_NAME_PREFIX};

impl Reconciler {
    pub async fn handle_workflow_event(&mut self, event: WatchEvent) {
        let (object, deleted) = match event {
            WatchEvent::Added(object) | WatchEvent::Modified(object) => (object, false),
            WatchEvent::Deleted(object) => (object, true),
            WatchEvent::Bookmark { .. } | WatchEvent::Error { .. } => return,
        };
        let workflow: Workflow = match decode(object.clone()) {
            Ok(workflow) => workflow,
            Err(error) => {
                log::error!("Invalid object in workflow stream: {error}: {object}");
                return;
            }
        };
        let name = workflow.name().to_string();
        if !name.starts_with(WORKFLOW_NAME_PREFIX) {
            log::warn!("Unrecognized workflow '{name}' in event stream");
            return;
        }
        let job_id = workflow.job_id();
        if deleted {
            log::debug!("Workflow {name} was deleted");
            self.registry.remove(job_id);
            return;
        }

        let ctx = &self.ctx;
        let record = self.registry.ensure(job_id);
        if let Err(error) = process_workflow(ctx, record, &workflow, &object).await {
            log::error!("Failed to process event for workflow '{name}' of job {job_id}: {error}");
            if !record.torn_down {
                if let Err(error) = move_to_teardown(ctx, record, Some(object)).await {
                    log::error!("Failed to move workflow '{name}' to Teardown after error: {error}");
                }
            }
            ctx.notifier
                .raise(job_id, "DWS/Rabbit interactions failed".to_string());
        }
    }
}

async fn process_workflow(
    ctx: &ReconcilerContext,
    record: &mut WorkflowRecord,
    workflow: &Workflow,
    object: &Value,
) -> crate::Result<()> {
    if workflow.reported_state().is_none() {
        // DWS has not picked up the Workflow yet
        return Ok(());
    }
    if record.deleted {
        return Ok(());
    }
    let desired = workflow.desired_state();
    if workflow.stage_active(WorkflowStage::Teardown)
        && !workflow.stage_complete(WorkflowStage::Teardown)
    {
        remove_finalizer(ctx.api.as_ref(), &record.name, workflow.finalizers()).await?;
    } else if record.torn_down && !workflow.stage_complete(WorkflowStage::Teardown) {
        // The Teardown request may still be in flight, stale events must not move the
        // Workflow back.
        return Ok(());
    } else if workflow.stage_complete(desired) {
        on_stage_complete(ctx, record, desired, workflow, object).await?;
    }

    match workflow.condition() {
        WorkflowCondition::Error => {
            ctx.notifier.raise(
                record.job_id,
                format!(
                    "DWS/Rabbit interactions failed: workflow hit an error: {}",
                    workflow.message()
                ),
            );
            if blocks_on_epilog(desired) && !record.torn_down {
                move_to_teardown(ctx, record, Some(object.clone())).await?;
            }
        }
        WorkflowCondition::TransientCondition => {
            log::info!(
                "Workflow '{}' has TransientCondition set, message is '{}'",
                record.name,
                workflow.message()
            );
            let condition = record
                .transient_condition
                .get_or_insert_with(|| TransientCondition {
                    since: Instant::now(),
                    message: String::new(),
                    stage: desired,
                });
            condition.message = workflow.message().to_string();
            condition.stage = desired;
        }
        WorkflowCondition::Normal => record.transient_condition = None,
    }
    Ok(())
}

async fn on_stage_complete(
    ctx: &ReconcilerContext,
    record: &mut WorkflowRecord,
    stage: WorkflowStage,
    workflow: &Workflow,
    object: &Value,
) -> crate::Result<()> {
    if record.timer_stage() == Some(stage) {
        record.cancel_timer();
    }
    match completion_action(stage) {
        StageAction::ApplyBreakdowns => apply_breakdowns(ctx, record, workflow, object).await?,
        StageAction::Advance(next) => {
            move_desired_state(ctx, &record.name, next).await?;
            save_elapsed_time(ctx, record.job_id, object);
            start_stage_timer(ctx, record, next);
        }
        StageAction::ReleaseProlog => {
            let variables = workflow
                .status
                .as_ref()
                .map(|status| status.env.clone())
                .unwrap_or_default();
            let token = workflow_token(ctx, workflow).await?;
            ctx.notifier.prolog_remove(record.job_id, variables, token);
            save_elapsed_time(ctx, record.job_id, object);
        }
        StageAction::MoveToTeardown => {
            move_to_teardown(ctx, record, Some(object.clone())).await?;
        }
        StageAction::Finish => {
            if !record.epilog_removed {
                ctx.notifier.epilog_remove(record.job_id);
                record.epilog_removed = true;
            }
            save_elapsed_time(ctx, record.job_id, object);
            ctx.cleanup.delete(&record.name, &finalizers_of(object));
            record.deleted = true;
        }
    }
    Ok(())
}

/// Rewrites the job's resources once DWS has broken down its directives.
async fn apply_breakdowns(
    ctx: &ReconcilerContext,
    record: &mut WorkflowRecord,
    workflow: &Workflow,
    object: &Value,
) -> crate::Result<()> {
    let resources = match mem::replace(&mut record.resources, ResourceSnapshot::Consumed) {
        ResourceSnapshot::Pending(resources) => resources,
        ResourceSnapshot::Consumed => {
            log::debug!("Resources of job {} were already updated", record.job_id);
            return Ok(());
        }
        ResourceSnapshot::Unknown => {
            ctx.notifier.resource_update(ResourceUpdate {
                id: record.job_id,
                resources: Vec::new(),
                copy_offload: false,
                errmsg: Some("resources of the job are unknown to the rabbit service".to_string()),
                exclude: None,
            });
            return Ok(());
        }
    };
    let breakdowns = fetch_breakdowns(ctx, workflow).await?;
    let config = &ctx.config;
    let (resources, errmsg) = match augment_jobspec(
        &resources,
        &breakdowns,
        config.min_allocation_size / GIB,
        &config.limits,
    ) {
        Ok(Augmentation::Rewritten(rewritten)) if !config.disable_fluxion => (rewritten, None),
        Ok(_) => (resources, None),
        Err(error) => {
            log::info!("Cannot apply breakdowns to job {}: {error}", record.job_id);
            (resources, Some(error.to_string()))
        }
    };
    let exclude = (config.disable_fluxion || !config.drain_compute_nodes)
        .then(|| EXCLUDE_PROPERTY.to_string());
    ctx.notifier.resource_update(ResourceUpdate {
        id: record.job_id,
        resources,
        copy_offload: copy_offload(&breakdowns),
        errmsg,
        exclude,
    });
    save_workflow(ctx, record.job_id, object);
    Ok(())
}

/// The one-time credential DWS stored for the job, if any.
async fn workflow_token(
    ctx: &ReconcilerContext,
    workflow: &Workflow,
) -> crate::Result<Option<String>> {
    let Some(token) = workflow
        .status
        .as_ref()
        .and_then(|status| status.workflow_token.as_ref())
    else {
        return Ok(None);
    };
    let secret = ctx
        .api
        .get(
            &SECRET_RESOURCE,
            namespace_or_default(&token.secret_namespace),
            &token.secret_name,
        )
        .await?;
    Ok(secret
        .pointer("/data/token")
        .and_then(Value::as_str)
        .map(String::from))
}

//! Drives the Workflow of every job through its stages.
//!
//! Everything here runs in a single task: requests from the job manager, Workflow
//! events and timer expirations are queued into one [`ReconcilerMessage`] stream and
//! handled one after another, so the state of a job is never touched concurrently.
mod events;
mod requests;
mod timers;

use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::time::MissedTickBehavior;

use crate::common::config::RabbitConfig;
use crate::common::rpc::{ResponseToken, RpcReceiver, RpcSender};
use crate::gateway::JobManagerNotifier;
use crate::gateway::messages::{DwsRequest, DwsResponse};
use crate::k8s::api::{CustomObjectApi, WatchEvent};
use crate::k8s::objects::{DirectiveBreakdown, Workflow, WorkflowStage, decode};
use crate::k8s::{DEFAULT_NAMESPACE, DIRECTIVE_BREAKDOWN_CRD, WORKFLOW_CRD};
use crate::server::cleanup::CleanupService;
use crate::server::storage::StorageManagerRef;
use crate::server::topology::Topology;
use crate::server::workflow::{WorkflowRecord, WorkflowRegistry};
use crate::JobId;

pub use timers::start_stage_timer;

pub enum ReconcilerMessage {
    Request(DwsRequest, ResponseToken<DwsResponse>),
    WorkflowEvent(WatchEvent),
    StageTimeout { job_id: JobId, stage: WorkflowStage },
}

pub type ReconcilerSender = RpcSender<ReconcilerMessage>;

/// Everything the handlers need besides the registry.
pub struct ReconcilerContext {
    pub api: Rc<dyn CustomObjectApi>,
    pub notifier: JobManagerNotifier,
    pub cleanup: CleanupService,
    pub storage: StorageManagerRef,
    pub topology: Rc<Topology>,
    pub config: Rc<RabbitConfig>,
    /// Queue of the reconciler itself, used by stage timers.
    pub sender: ReconcilerSender,
}

pub struct Reconciler {
    ctx: ReconcilerContext,
    registry: WorkflowRegistry,
}

impl Reconciler {
    pub fn new(ctx: ReconcilerContext) -> Self {
        Self {
            ctx,
            registry: WorkflowRegistry::default(),
        }
    }

    pub fn registry(&self) -> &WorkflowRegistry {
        &self.registry
    }

    pub async fn handle_message(&mut self, message: ReconcilerMessage) {
        match message {
            ReconcilerMessage::Request(request, token) => {
                let response = self.handle_request(request).await;
                token.respond(response);
            }
            ReconcilerMessage::WorkflowEvent(event) => self.handle_workflow_event(event).await,
            ReconcilerMessage::StageTimeout { job_id, stage } => {
                self.handle_stage_timeout(job_id, stage).await
            }
        }
    }
}

pub async fn reconciler_process(
    mut reconciler: Reconciler,
    mut receiver: RpcReceiver<ReconcilerMessage>,
) {
    let period = (reconciler.ctx.config.tc_timeout / 2).max(Duration::from_millis(100));
    let mut sweep = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = sweep.tick() => {
                reconciler.sweep_transient_conditions().await;
            }
            message = receiver.recv() => {
                let Some(message) = message else {
                    log::debug!("Reconciler queue closed");
                    return;
                };
                reconciler.handle_message(message).await;
            }
        }
    }
}

fn finalizers_of(workflow: &Value) -> Vec<String> {
    workflow
        .pointer("/metadata/finalizers")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

/// `rabbit_{state}_timing` entry of the stage the Workflow reported last.
fn elapsed_time_entry(workflow: &Value) -> Option<(String, Value)> {
    let timing = workflow.pointer("/status/elapsedTimeLastState")?;
    let state = workflow.pointer("/status/state")?.as_str()?;
    Some((
        format!("rabbit_{}_timing", state.to_lowercase()),
        timing.clone(),
    ))
}

fn save_elapsed_time(ctx: &ReconcilerContext, job_id: JobId, workflow: &Value) {
    if let Some((key, timing)) = elapsed_time_entry(workflow) {
        ctx.notifier.kvs_put(job_id, BTreeMap::from([(key, timing)]));
    }
}

fn save_workflow(ctx: &ReconcilerContext, job_id: JobId, workflow: &Value) {
    let mut entries = BTreeMap::from([("rabbit_workflow".to_string(), workflow.clone())]);
    entries.extend(elapsed_time_entry(workflow));
    ctx.notifier.kvs_put(job_id, entries);
}

async fn move_desired_state(
    ctx: &ReconcilerContext,
    name: &str,
    stage: WorkflowStage,
) -> crate::Result<()> {
    log::debug!("Moving workflow {name} to {stage}");
    ctx.api
        .patch(
            &WORKFLOW_CRD,
            DEFAULT_NAMESPACE,
            name,
            json!({"spec": {"desiredState": stage}}),
        )
        .await?;
    Ok(())
}

async fn fetch_breakdowns(
    ctx: &ReconcilerContext,
    workflow: &Workflow,
) -> crate::Result<Vec<DirectiveBreakdown>> {
    let references = workflow
        .status
        .as_ref()
        .map(|s| s.directive_breakdowns.as_slice())
        .unwrap_or_default();
    let mut breakdowns = Vec::with_capacity(references.len());
    for reference in references {
        let namespace = namespace_or_default(&reference.namespace);
        let object = ctx
            .api
            .get(&DIRECTIVE_BREAKDOWN_CRD, namespace, &reference.name)
            .await?;
        breakdowns.push(decode(object)?);
    }
    Ok(breakdowns)
}

fn namespace_or_default(namespace: &str) -> &str {
    if namespace.is_empty() {
        DEFAULT_NAMESPACE
    } else {
        namespace
    }
}

/// Moves a Workflow straight to Teardown. `workflow` is fetched when not given.
///
/// Returns `false` when the Workflow does not exist anymore.
async fn move_to_teardown(
    ctx: &ReconcilerContext,
    record: &mut WorkflowRecord,
    workflow: Option<Value>,
) -> crate::Result<bool> {
    let workflow = match workflow {
        Some(workflow) => workflow,
        None => match ctx
            .api
            .get(&WORKFLOW_CRD, DEFAULT_NAMESPACE, &record.name)
            .await
        {
            Ok(workflow) => workflow,
            Err(error) if error.is_not_found() => {
                log::debug!("Workflow {} is gone, nothing to tear down", record.name);
                record.torn_down = true;
                record.deleted = true;
                record.cancel_timer();
                return Ok(false);
            }
            Err(error) => return Err(error.into()),
        },
    };
    log::info!("Moving workflow {} to Teardown", record.name);
    save_workflow(ctx, record.job_id, &workflow);
    ctx.cleanup.teardown(
        record.job_id,
        &record.name,
        &finalizers_of(&workflow),
        ctx.config.save_datamovements,
    );
    record.torn_down = true;
    record.cancel_timer();
    record.transient_condition = None;
    Ok(true)
}

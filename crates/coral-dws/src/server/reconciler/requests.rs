use nix::unistd::{Uid, User};
use serde_json::{Value, json};

use crate::common::error::RequestError;
use crate::common::hostlist::{encode_hostlist, expand_unique};
use crate::gateway::messages::{
    CreateRequest, DwsReply, DwsRequest, DwsResponse, PostRunRequest, SetupRequest,
};
use crate::k8s::objects::{Workflow, WorkflowStage, decode};
use crate::k8s::{COMPUTES_CRD, DEFAULT_NAMESPACE, SERVERS_CRD, WORKFLOW_CRD};
use crate::server::allocation::directives::{check_persistent, parse_dw_directives};
use crate::server::allocation::planner::build_allocation_sets;
use crate::server::reconciler::{
    Reconciler, fetch_breakdowns, move_desired_state, move_to_teardown, namespace_or_default,
    start_stage_timer,
};
use crate::server::workflow::{ResourceSnapshot, WorkflowRecord};
use crate::{JobId, WORKFLOW_FINALIZER, workflow_name};

/// Primary group of `uid`, or the uid itself when the user is unknown to this host.
fn primary_group(uid: u32) -> u32 {
    match User::from_uid(Uid::from_raw(uid)) {
        Ok(Some(user)) => user.gid.as_raw(),
        Ok(None) => uid,
        Err(error) => {
            log::warn!("Cannot look up user {uid}: {error}");
            uid
        }
    }
}

fn workflow_body(job_id: JobId, user_id: u32, directives: &[String]) -> Value {
    json!({
        "kind": WORKFLOW_CRD.kind,
        "apiVersion": WORKFLOW_CRD.api_version(),
        "metadata": {
            "name": workflow_name(job_id),
            "namespace": DEFAULT_NAMESPACE,
            "finalizers": [WORKFLOW_FINALIZER],
        },
        "spec": {
            "desiredState": WorkflowStage::Proposal,
            "dwDirectives": directives,
            "jobID": job_id.to_f58(),
            "userID": user_id,
            "groupID": primary_group(user_id),
            "wlmID": "flux",
        }
    })
}

impl Reconciler {
    pub async fn handle_request(&mut self, request: DwsRequest) -> DwsResponse {
        let subject = match request.job_id() {
            Some(job_id) => format!("job {job_id}"),
            None => "workflow status".to_string(),
        };
        let result = match request {
            DwsRequest::Create(request) => self.create(request).await,
            DwsRequest::Setup(request) => self.setup(request).await,
            DwsRequest::PostRun(request) => self.post_run(request).await,
            DwsRequest::Teardown { job_id } => self.teardown(job_id, false).await,
            DwsRequest::Abort { job_id } => self.teardown(job_id, true).await,
            DwsRequest::Status => Ok(DwsReply::Workflows(self.registry.job_ids())),
        };
        match &result {
            Err(RequestError::Internal(message)) => {
                log::error!("Request for {subject} failed: {message}");
            }
            Err(RequestError::User(message)) => {
                log::debug!("Request for {subject} rejected: {message}");
            }
            Ok(_) => {}
        }
        result
    }

    async fn create(&mut self, request: CreateRequest) -> DwsResponse {
        let config = &self.ctx.config;
        let directives = parse_dw_directives(&request.dw_directives, &config.presets)?;
        if config.restrict_persistent_creation {
            check_persistent(&directives, request.user_id, config.instance_owner)?;
        }
        let job_id = request.job_id;
        if let Some(record) = self.registry.get_mut(job_id) {
            log::debug!("Workflow {} already exists", record.name);
            if record.resources == ResourceSnapshot::Unknown {
                record.resources = ResourceSnapshot::Pending(request.resources);
            }
            record.failure_tolerance = request.failure_tolerance;
            return Ok(DwsReply::Done);
        }

        let body = workflow_body(job_id, request.user_id, &directives);
        match self
            .ctx
            .api
            .create(&WORKFLOW_CRD, DEFAULT_NAMESPACE, body)
            .await
        {
            Ok(_) => {}
            Err(error) if error.is_conflict() => {
                log::debug!("Workflow of job {job_id} was already created");
            }
            Err(error) => return Err(error.into()),
        }
        let mut record = WorkflowRecord::new(job_id, ResourceSnapshot::Pending(request.resources));
        record.failure_tolerance = request.failure_tolerance;
        let record = self.registry.insert(record);
        log::info!("Created workflow {} for job {job_id}", record.name);
        self.ctx
            .notifier
            .memo(job_id, json!({"rabbit_workflow": record.name}));
        Ok(DwsReply::Done)
    }

    async fn setup(&mut self, request: SetupRequest) -> DwsResponse {
        let job_id = request.job_id;
        if self
            .registry
            .get(job_id)
            .is_some_and(|record| record.torn_down || record.deleted)
        {
            log::debug!("Ignoring setup of job {job_id}, its workflow is being torn down");
            return Ok(DwsReply::Done);
        }
        let ctx = &self.ctx;
        let name = workflow_name(job_id);
        let hosts = expand_unique(&request.resources.execution.nodelist.join(","))
            .map_err(|error| RequestError::User(format!("Invalid nodelist: {error:#}")))?;
        let workflow: Workflow = match ctx.api.get(&WORKFLOW_CRD, DEFAULT_NAMESPACE, &name).await {
            Ok(workflow) => decode(workflow)?,
            Err(error) => {
                if error.is_not_found() {
                    self.registry.remove(job_id);
                }
                return Err(error.into());
            }
        };
        let counts = ctx
            .topology
            .server_counts(&hosts)
            .map_err(RequestError::Internal)?;
        let servers: Vec<String> = counts.servers().map(String::from).collect();
        ctx.notifier
            .memo(job_id, json!({"rabbits": encode_hostlist(&servers)}));

        let computes = workflow
            .status
            .as_ref()
            .and_then(|status| status.computes.as_ref())
            .ok_or_else(|| {
                RequestError::Internal(format!("Workflow {name} has no Computes resource"))
            })?;
        let data: Vec<Value> = hosts.iter().map(|host| json!({"name": host})).collect();
        ctx.api
            .patch(
                &COMPUTES_CRD,
                namespace_or_default(&computes.namespace),
                &computes.name,
                json!({"data": data}),
            )
            .await?;

        for breakdown in fetch_breakdowns(ctx, &workflow).await? {
            // e.g. persistentdw breakdowns do not allocate anything
            let Some(storage) = breakdown.status.as_ref().and_then(|s| s.storage.as_ref()) else {
                continue;
            };
            let Some(reference) = &storage.reference else {
                continue;
            };
            let allocation_sets = build_allocation_sets(
                &storage.allocation_sets,
                &counts,
                ctx.config.min_allocation_size,
            )
            .map_err(|error| RequestError::Internal(error.to_string()))?;
            ctx.api
                .patch(
                    &SERVERS_CRD,
                    namespace_or_default(&reference.namespace),
                    &reference.name,
                    json!({"spec": {"allocationSets": allocation_sets}}),
                )
                .await?;
        }

        move_desired_state(ctx, &name, WorkflowStage::Setup).await?;
        let record = self.registry.ensure(job_id);
        record.assigned_servers = Some(servers);
        record.compute_nodes = hosts;
        start_stage_timer(ctx, record, WorkflowStage::Setup);
        Ok(DwsReply::Done)
    }

    async fn post_run(&mut self, request: PostRunRequest) -> DwsResponse {
        let ctx = &self.ctx;
        let job_id = request.job_id;
        let known = self.registry.contains(job_id);
        let record = self.registry.ensure(job_id);
        if record.torn_down {
            return Ok(DwsReply::Done);
        }
        if !request.run_started {
            // The job never ran, there is nothing to stage out
            if !move_to_teardown(ctx, record, None).await? {
                self.registry.remove(job_id);
            }
        } else if let Err(error) =
            move_desired_state(ctx, &record.name, WorkflowStage::PostRun).await
        {
            if !known || error.is_not_found() {
                self.registry.remove(job_id);
            }
            return Err(error.into());
        } else {
            start_stage_timer(ctx, record, WorkflowStage::PostRun);
        }
        Ok(DwsReply::Done)
    }

    /// `abort` may come for jobs whose Workflow was never created.
    async fn teardown(&mut self, job_id: JobId, abort: bool) -> DwsResponse {
        if abort && !self.registry.contains(job_id) {
            let name = workflow_name(job_id);
            match self.ctx.api.get(&WORKFLOW_CRD, DEFAULT_NAMESPACE, &name).await {
                Ok(workflow) => {
                    let record = self.registry.ensure(job_id);
                    move_to_teardown(&self.ctx, record, Some(workflow)).await?;
                }
                Err(error) if error.is_not_found() => {
                    log::debug!("Job {job_id} aborted without a workflow");
                }
                Err(error) => return Err(error.into()),
            }
            return Ok(DwsReply::Done);
        }
        let known = self.registry.contains(job_id);
        let record = self.registry.ensure(job_id);
        if record.torn_down {
            return Ok(DwsReply::Done);
        }
        match move_to_teardown(&self.ctx, record, None).await {
            Ok(true) => {}
            Ok(false) => {
                self.registry.remove(job_id);
            }
            Err(error) => {
                if !known {
                    self.registry.remove(job_id);
                }
                return Err(error.into());
            }
        }
        Ok(DwsReply::Done)
    }
}

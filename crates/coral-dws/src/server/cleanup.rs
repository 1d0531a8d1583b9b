//! Deletion and teardown of Workflows, retried until they succeed. Runs on its own
//! thread with its own API client so that a slow API server never stalls the
//! reconciler.
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::task::LocalSet;

use crate::common::backoff::Backoff;
use crate::gateway::JobManagerNotifier;
use crate::k8s::api::{ApiResult, CustomObjectApi, ListOptions, Scope};
use crate::k8s::client::KubeApi;
use crate::k8s::objects::{Workflow, WorkflowStage, datamovement_failed, decode};
use crate::k8s::{DATA_MOVEMENT_CRD, DEFAULT_NAMESPACE, WORKFLOW_CRD, workflow_label_selector};
use crate::{JobId, WORKFLOW_FINALIZER};

/// Failed attempts that are retried silently before a warning is logged.
const QUIET_ATTEMPTS: u32 = 4;

#[derive(Debug)]
pub enum CleanupRequest {
    /// Release the finalizer and delete the Workflow.
    Delete {
        name: String,
        finalizers: Vec<String>,
    },
    /// Release the finalizer and move the Workflow to Teardown.
    Teardown {
        job_id: JobId,
        name: String,
        finalizers: Vec<String>,
        save_datamovements: usize,
    },
}

/// Hands requests over to the cleanup worker. Submission never blocks.
#[derive(Clone, Debug)]
pub struct CleanupService {
    sender: UnboundedSender<CleanupRequest>,
}

impl CleanupService {
    pub fn new() -> (Self, UnboundedReceiver<CleanupRequest>) {
        let (sender, receiver) = unbounded_channel();
        (CleanupService { sender }, receiver)
    }

    fn submit(&self, request: CleanupRequest) {
        if let Err(error) = self.sender.send(request) {
            log::error!("Cleanup worker has stopped, dropping {:?}", error.0);
        }
    }

    pub fn delete(&self, name: &str, finalizers: &[String]) {
        self.submit(CleanupRequest::Delete {
            name: name.to_string(),
            finalizers: finalizers.to_vec(),
        });
    }

    pub fn teardown(
        &self,
        job_id: JobId,
        name: &str,
        finalizers: &[String],
        save_datamovements: usize,
    ) {
        self.submit(CleanupRequest::Teardown {
            job_id,
            name: name.to_string(),
            finalizers: finalizers.to_vec(),
            save_datamovements,
        });
    }
}

fn without_our_finalizer(finalizers: &[String]) -> Vec<&String> {
    finalizers
        .iter()
        .filter(|f| f.as_str() != WORKFLOW_FINALIZER)
        .collect()
}

async fn current_finalizers(api: &dyn CustomObjectApi, name: &str) -> ApiResult<Vec<String>> {
    let workflow: Workflow = decode(api.get(&WORKFLOW_CRD, DEFAULT_NAMESPACE, name).await?)?;
    Ok(workflow.finalizers().to_vec())
}

/// Removes our finalizer from a Workflow. `finalizers` is the list as last seen; when it
/// is outdated the patch may be refused, so it is retried once with a fresh copy.
pub async fn remove_finalizer(
    api: &dyn CustomObjectApi,
    name: &str,
    finalizers: &[String],
) -> ApiResult<()> {
    if !finalizers.iter().any(|f| f == WORKFLOW_FINALIZER) {
        return Ok(());
    }
    let patch = json!({"metadata": {"finalizers": without_our_finalizer(finalizers)}});
    match api.patch(&WORKFLOW_CRD, DEFAULT_NAMESPACE, name, patch).await {
        Ok(_) => Ok(()),
        Err(error) if error.is_not_found() => Ok(()),
        Err(error) => {
            log::debug!("Cannot remove finalizer of {name}, retrying with a fresh copy: {error}");
            let finalizers = current_finalizers(api, name).await?;
            if !finalizers.iter().any(|f| f == WORKFLOW_FINALIZER) {
                return Ok(());
            }
            let patch = json!({"metadata": {"finalizers": without_our_finalizer(&finalizers)}});
            api.patch(&WORKFLOW_CRD, DEFAULT_NAMESPACE, name, patch)
                .await
                .map(|_| ())
        }
    }
}

/// Datamovements of a Workflow to keep in the job record, failed ones first.
pub async fn fetch_datamovements(
    api: &dyn CustomObjectApi,
    name: &str,
    count: usize,
) -> ApiResult<Vec<Value>> {
    if count == 0 {
        return Ok(Vec::new());
    }
    let list = api
        .list(
            &DATA_MOVEMENT_CRD,
            Scope::Cluster,
            ListOptions {
                label_selector: Some(workflow_label_selector(name)),
                limit: Some(u32::try_from(count).unwrap_or(u32::MAX)),
            },
        )
        .await?;
    let (mut selected, succeeded): (Vec<Value>, Vec<Value>) =
        list.items.into_iter().partition(datamovement_failed);
    selected.truncate(count);
    let remaining = count - selected.len();
    selected.extend(succeeded.into_iter().take(remaining));
    Ok(selected)
}

async fn delete_workflow(
    api: &dyn CustomObjectApi,
    name: &str,
    finalizers: &[String],
) -> ApiResult<()> {
    remove_finalizer(api, name, finalizers).await?;
    api.delete(&WORKFLOW_CRD, DEFAULT_NAMESPACE, name).await
}

async fn teardown_workflow(
    api: &dyn CustomObjectApi,
    name: &str,
    finalizers: &[String],
) -> ApiResult<()> {
    let patch = json!({
        "spec": {"desiredState": WorkflowStage::Teardown},
        "metadata": {"finalizers": without_our_finalizer(finalizers)},
    });
    api.patch(&WORKFLOW_CRD, DEFAULT_NAMESPACE, name, patch)
        .await
        .map(|_| ())
}

#[derive(Debug, Clone, Copy)]
enum CleanupAction {
    Delete,
    Teardown,
}

impl CleanupAction {
    fn as_str(&self) -> &'static str {
        match self {
            CleanupAction::Delete => "delete",
            CleanupAction::Teardown => "teardown",
        }
    }
}

/// Runs one request until it succeeds or the Workflow is gone.
async fn run_request(
    api: Rc<dyn CustomObjectApi>,
    notifier: JobManagerNotifier,
    request: CleanupRequest,
    mut backoff: Backoff,
) {
    let (action, name, mut finalizers) = match request {
        CleanupRequest::Delete { name, finalizers } => (CleanupAction::Delete, name, finalizers),
        CleanupRequest::Teardown {
            job_id,
            name,
            finalizers,
            save_datamovements,
        } => {
            match fetch_datamovements(api.as_ref(), &name, save_datamovements).await {
                Ok(datamovements) if !datamovements.is_empty() => {
                    let entries = BTreeMap::from([(
                        "rabbit_datamovements".to_string(),
                        Value::Array(datamovements),
                    )]);
                    notifier.kvs_put(job_id, entries);
                }
                Ok(_) => {}
                Err(error) => {
                    log::warn!(
                        "Failed to fetch {} for workflow '{name}': {error}",
                        DATA_MOVEMENT_CRD.plural
                    );
                }
            }
            (CleanupAction::Teardown, name, finalizers)
        }
    };
    let action_name = action.as_str();
    loop {
        let result = match action {
            CleanupAction::Delete => delete_workflow(api.as_ref(), &name, &finalizers).await,
            CleanupAction::Teardown => teardown_workflow(api.as_ref(), &name, &finalizers).await,
        };
        let error = match result {
            Ok(()) => {
                log::debug!("Workflow {name}: {action_name} finished");
                return;
            }
            Err(error) if error.is_not_found() => {
                log::debug!("Workflow {name} not found, presuming {action_name} already happened");
                return;
            }
            Err(error) => error,
        };
        let delay = backoff.on_failure();
        if backoff.failures() > QUIET_ATTEMPTS || matches!(action, CleanupAction::Teardown) {
            log::warn!(
                "Failed to {action_name} workflow {name} after {} attempts, retrying in {}: {error}",
                backoff.failures(),
                humantime::format_duration(delay)
            );
        }
        tokio::time::sleep(delay).await;
        // Refresh what we know, the failure may have been caused by a stale copy
        match current_finalizers(api.as_ref(), &name).await {
            Ok(current) => finalizers = current,
            Err(error) if error.is_not_found() => return,
            Err(error) => log::debug!("Cannot refresh workflow {name}: {error}"),
        }
    }
}

/// Serves cleanup requests, each in its own task, until all senders are gone.
pub async fn cleanup_process(
    api: Rc<dyn CustomObjectApi>,
    notifier: JobManagerNotifier,
    retry_delay: Duration,
    max_retry_delay: Duration,
    mut receiver: UnboundedReceiver<CleanupRequest>,
) {
    while let Some(request) = receiver.recv().await {
        log::debug!("Cleanup request: {request:?}");
        tokio::task::spawn_local(run_request(
            api.clone(),
            notifier.clone(),
            request,
            Backoff::new(retry_delay, max_retry_delay),
        ));
    }
}

/// Starts the cleanup worker thread. The thread connects with its own client.
pub fn start_cleanup_worker(
    kubeconfig: Option<PathBuf>,
    notifier: JobManagerNotifier,
    retry_delay: Duration,
    max_retry_delay: Duration,
) -> crate::Result<CleanupService> {
    let (service, receiver) = CleanupService::new();
    std::thread::Builder::new()
        .name("workflow-cleanup".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(error) => {
                    log::error!("Cannot start cleanup runtime: {error}");
                    return;
                }
            };
            LocalSet::new().block_on(&runtime, async move {
                let api = match KubeApi::connect(kubeconfig.as_deref()).await {
                    Ok(api) => api,
                    Err(error) => {
                        log::error!("Cleanup worker cannot reach kubernetes: {error:#}");
                        return;
                    }
                };
                cleanup_process(Rc::new(api), notifier, retry_delay, max_retry_delay, receiver)
                    .await;
            });
        })?;
    Ok(service)
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;
    use std::time::Duration;

    use serde_json::{Value, json};
    use tokio::task::LocalSet;

    use super::{CleanupService, cleanup_process, fetch_datamovements, remove_finalizer};
    use crate::gateway::JobManagerNotifier;
    use crate::gateway::messages::ToJobManagerMessage;
    use crate::gateway::testing::drain_notifications;
    use crate::k8s::api::ApiError;
    use crate::k8s::testing::TestApi;
    use crate::k8s::{DATA_MOVEMENT_CRD, DEFAULT_NAMESPACE, WORKFLOW_CRD};
    use crate::{JobId, WORKFLOW_FINALIZER};

    const NAME: &str = "fluxjob-1";

    fn put_workflow(api: &TestApi) -> Vec<String> {
        let finalizers = vec![WORKFLOW_FINALIZER.to_string(), "other".to_string()];
        api.put(
            &WORKFLOW_CRD,
            DEFAULT_NAMESPACE,
            NAME,
            json!({
                "metadata": {"finalizers": finalizers},
                "spec": {"desiredState": "PostRun", "jobID": "f2"}
            }),
        );
        finalizers
    }

    fn unavailable() -> ApiError {
        ApiError::Status {
            code: 503,
            message: "unavailable".into(),
        }
    }

    fn start(api: &TestApi) -> (CleanupService, tokio::sync::mpsc::UnboundedReceiver<ToJobManagerMessage>) {
        let (service, receiver) = CleanupService::new();
        let (notifier, notifications) = JobManagerNotifier::new();
        tokio::task::spawn_local(cleanup_process(
            Rc::new(api.clone()),
            notifier,
            Duration::from_secs(5),
            Duration::from_secs(20),
            receiver,
        ));
        (service, notifications)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_retries_with_backoff() {
        LocalSet::new()
            .run_until(async {
                let api = TestApi::new();
                let finalizers = put_workflow(&api);
                for _ in 0..4 {
                    api.fail_next("patch", unavailable());
                }
                let (service, _notifications) = start(&api);
                service.teardown(JobId::new(1), NAME, &finalizers, 0);
                settle().await;
                assert_eq!(api.requests_of("patch", "workflows").len(), 1);

                // 5, 10, 20 and then capped at 20 seconds
                for (delay, attempts) in [(5, 2), (10, 3), (20, 4), (20, 5)] {
                    tokio::time::advance(Duration::from_secs(delay) + Duration::from_millis(1)).await;
                    settle().await;
                    assert_eq!(api.requests_of("patch", "workflows").len(), attempts);
                }
                let workflow = api.object(&WORKFLOW_CRD, DEFAULT_NAMESPACE, NAME).unwrap();
                assert_eq!(workflow["spec"]["desiredState"], "Teardown");
                assert_eq!(workflow["metadata"]["finalizers"], json!(["other"]));
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn delete_removes_finalizer_first() {
        LocalSet::new()
            .run_until(async {
                let api = TestApi::new();
                api.put(
                    &WORKFLOW_CRD,
                    DEFAULT_NAMESPACE,
                    NAME,
                    json!({"metadata": {"finalizers": [WORKFLOW_FINALIZER]}}),
                );
                api.fail_next("delete", ApiError::Transport("reset".into()));
                let (service, _notifications) = start(&api);
                service.delete(NAME, &[WORKFLOW_FINALIZER.to_string()]);
                settle().await;
                assert!(api.object(&WORKFLOW_CRD, DEFAULT_NAMESPACE, NAME).is_some());

                tokio::time::advance(Duration::from_millis(5001)).await;
                settle().await;
                assert!(api.object(&WORKFLOW_CRD, DEFAULT_NAMESPACE, NAME).is_none());
                assert_eq!(api.requests_of("delete", "workflows").len(), 2);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn missing_workflow_is_done() {
        LocalSet::new()
            .run_until(async {
                let api = TestApi::new();
                let (service, _notifications) = start(&api);
                service.teardown(JobId::new(1), NAME, &[], 0);
                service.delete(NAME, &[]);
                settle().await;
                tokio::time::advance(Duration::from_secs(60)).await;
                settle().await;
                assert_eq!(api.requests_of("patch", "workflows").len(), 1);
                assert_eq!(api.requests_of("delete", "workflows").len(), 1);
            })
            .await;
    }

    #[tokio::test]
    async fn stale_finalizers_are_refreshed() {
        let api = TestApi::new();
        put_workflow(&api);
        api.fail_next("patch", ApiError::Status { code: 422, message: "invalid".into() });
        remove_finalizer(&api, NAME, &[WORKFLOW_FINALIZER.to_string(), "gone".to_string()])
            .await
            .unwrap();
        let workflow = api.object(&WORKFLOW_CRD, DEFAULT_NAMESPACE, NAME).unwrap();
        assert_eq!(workflow["metadata"]["finalizers"], json!(["other"]));
    }

    fn put_datamovement(api: &TestApi, name: &str, status: &str) {
        api.put(
            &DATA_MOVEMENT_CRD,
            "nnf-system",
            name,
            json!({
                "metadata": {"labels": {
                    "dataworkflowservices.github.io/workflow.name": NAME,
                    "dataworkflowservices.github.io/workflow.namespace": "default",
                }},
                "status": {"status": status}
            }),
        );
    }

    #[tokio::test]
    async fn failed_datamovements_first() {
        let api = TestApi::new();
        put_datamovement(&api, "dm-a", "Success");
        put_datamovement(&api, "dm-b", "Failed");
        put_datamovement(&api, "dm-c", "Success");
        let names = |items: Vec<Value>| -> Vec<String> {
            items
                .iter()
                .map(|i| i["metadata"]["name"].as_str().unwrap().to_string())
                .collect()
        };
        assert_eq!(
            names(fetch_datamovements(&api, NAME, 2).await.unwrap()),
            vec!["dm-b", "dm-a"]
        );
        assert!(fetch_datamovements(&api, NAME, 0).await.unwrap().is_empty());
        assert!(api.requests_of("list", DATA_MOVEMENT_CRD.plural).len() == 1);
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_saves_datamovements() {
        LocalSet::new()
            .run_until(async {
                let api = TestApi::new();
                let finalizers = put_workflow(&api);
                put_datamovement(&api, "dm-a", "Failed");
                let (service, mut notifications) = start(&api);
                service.teardown(JobId::new(1), NAME, &finalizers, 5);
                settle().await;
                let messages = drain_notifications(&mut notifications);
                assert!(matches!(
                    &messages[..],
                    [ToJobManagerMessage::KvsPut { entries, .. }]
                        if entries["rabbit_datamovements"].as_array().map(Vec::len) == Some(1)
                ));
            })
            .await;
    }
}

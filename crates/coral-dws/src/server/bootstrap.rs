use std::path::Path;
use std::rc::Rc;

use tokio::net::TcpListener;

use crate::common::backoff::Backoff;
use crate::common::config::RabbitConfig;
use crate::common::rpc::make_rpc_queue;
use crate::gateway::JobManagerNotifier;
use crate::gateway::connection::gateway_process;
use crate::k8s::api::{ApiError, CustomObjectApi, ListOptions, Scope, WatchEvent};
use crate::k8s::client::KubeApi;
use crate::k8s::objects::{SystemConfiguration, decode};
use crate::k8s::watch::{INITIAL_RESOURCE_VERSION, ResourceWatch, WatchCursor, Watchers, watchers_process};
use crate::k8s::{DEFAULT_NAMESPACE, STORAGE_CRD, SYSTEM_CONFIGURATION_CRD, WORKFLOW_CRD};
use crate::server::cleanup::start_cleanup_worker;
use crate::server::reconciler::{
    Reconciler, ReconcilerContext, ReconcilerMessage, ReconcilerSender, reconciler_process,
};
use crate::server::storage::{ResourceGraph, StorageManagerRef};
use crate::server::topology::Topology;

/// Name of the SystemConfiguration that describes the rabbit inventory.
const SYSTEM_CONFIGURATION_NAME: &str = "default";

async fn connect(kubeconfig: Option<&Path>) -> crate::Result<KubeApi> {
    KubeApi::connect(kubeconfig).await.map_err(|error| {
        ApiError::Transport(format!("Cannot connect to the Kubernetes API: {error:#}")).into()
    })
}

/// Compute-to-storage mapping, from the mapping file if one is configured.
pub async fn load_topology(
    api: &dyn CustomObjectApi,
    config: &RabbitConfig,
) -> crate::Result<Topology> {
    if let Some(path) = &config.mapping {
        log::debug!("Reading rabbit mapping from {}", path.display());
        return Topology::from_mapping_file(path, config.duplicate_claims);
    }
    let object = api
        .get(
            &SYSTEM_CONFIGURATION_CRD,
            DEFAULT_NAMESPACE,
            SYSTEM_CONFIGURATION_NAME,
        )
        .await?;
    let system_configuration: SystemConfiguration = decode(object)?;
    Topology::from_system_configuration(system_configuration, config.duplicate_claims)
}

pub fn load_resource_graph(config: &RabbitConfig) -> crate::Result<Option<ResourceGraph>> {
    if config.disable_fluxion {
        return Ok(None);
    }
    match &config.resource_graph {
        Some(path) => ResourceGraph::load(path).map(Some),
        None => Err(crate::Error::ConfigError(
            "resource_graph has to be set unless disable_fluxion is enabled".to_string(),
        )),
    }
}

/// Feeds the current state of all storage nodes to `storage` and prepares watches of
/// storage nodes and Workflows.
pub async fn prepare_watches(
    api: Rc<dyn CustomObjectApi>,
    storage: &StorageManagerRef,
    reconciler: ReconcilerSender,
    config: &RabbitConfig,
) -> crate::Result<Watchers> {
    let storages = api
        .list(
            &STORAGE_CRD,
            Scope::Namespaced(DEFAULT_NAMESPACE),
            ListOptions::default(),
        )
        .await?;
    log::debug!("Found {} storage nodes", storages.items.len());
    {
        let mut manager = storage.get_mut();
        for item in storages.items {
            manager.on_storage_event(WatchEvent::Added(item));
        }
    }

    let backoff = || Backoff::new(config.retry_delay, config.max_retry_delay);
    let mut watchers = Watchers::default();
    let storage = storage.clone();
    watchers.add_watch(ResourceWatch::new(
        api.clone(),
        STORAGE_CRD,
        DEFAULT_NAMESPACE,
        WatchCursor::new(storages.resource_version, backoff()),
        Box::new(move |event| storage.get_mut().on_storage_event(event)),
    ));
    watchers.add_watch(ResourceWatch::new(
        api,
        WORKFLOW_CRD,
        DEFAULT_NAMESPACE,
        WatchCursor::new(INITIAL_RESOURCE_VERSION.to_string(), backoff()),
        Box::new(move |event| {
            if reconciler
                .send(ReconcilerMessage::WorkflowEvent(event))
                .is_err()
            {
                log::debug!("Reconciler has stopped, dropping workflow event");
            }
        }),
    ));
    Ok(watchers)
}

/// Runs the service until SIGINT or until one of its processes stops.
///
/// Has to be called inside a [`tokio::task::LocalSet`].
pub async fn run_server(config: RabbitConfig) -> crate::Result<()> {
    let api: Rc<dyn CustomObjectApi> = Rc::new(connect(config.kubeconfig.as_deref()).await?);
    let topology = Rc::new(load_topology(api.as_ref(), &config).await?);
    let graph = load_resource_graph(&config)?;

    let (notifier, notifications) = JobManagerNotifier::new();
    let cleanup = start_cleanup_worker(
        config.kubeconfig.clone(),
        notifier.clone(),
        config.retry_delay,
        config.max_retry_delay,
    )?;
    let storage = StorageManagerRef::new(topology.clone(), graph, &config, notifier.clone());
    let (sender, receiver) = make_rpc_queue();
    let watchers = prepare_watches(api.clone(), &storage, sender.clone(), &config).await?;

    let listener = TcpListener::bind(&config.listen).await?;
    log::info!("Waiting for the job manager on {}", listener.local_addr()?);

    let watch_interval = config.watch_interval;
    let reconciler = Reconciler::new(ReconcilerContext {
        api,
        notifier,
        cleanup,
        storage,
        topology,
        config: Rc::new(config),
        sender: sender.clone(),
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("Received SIGINT, stopping");
        }
        _ = gateway_process(listener, sender, notifications) => {
            log::debug!("Gateway stopped");
        }
        _ = reconciler_process(reconciler, receiver) => {
            log::debug!("Reconciler stopped");
        }
        _ = watchers_process(watchers, watch_interval) => {}
    }
    Ok(())
}

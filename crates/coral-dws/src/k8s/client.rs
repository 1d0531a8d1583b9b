use std::path::Path;

use futures::TryStreamExt;
use kube::Client;
use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams,
    WatchEvent as KubeWatchEvent, WatchParams,
};
use kube::config::{Config, KubeConfigOptions, Kubeconfig};
use serde_json::Value;

use crate::k8s::Crd;
use crate::k8s::api::{
    ApiError, ApiFuture, ApiResult, CustomObjectApi, ListOptions, ObjectList, Scope, WatchEvent,
};

/// Length of one watch window, in seconds.
const WATCH_WINDOW_SECS: u32 = 1;

/// [`CustomObjectApi`] backed by a Kubernetes API server.
#[derive(Clone)]
pub struct KubeApi {
    client: Client,
}

impl KubeApi {
    /// Connects using the given kubeconfig, or infers the configuration (in-cluster
    /// environment or the default kubeconfig) when no path is given.
    pub async fn connect(kubeconfig: Option<&Path>) -> anyhow::Result<Self> {
        let config = match kubeconfig {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path)?;
                Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?
            }
            None => Config::infer().await?,
        };
        let client = Client::try_from(config)?;
        Ok(Self { client })
    }

    fn api(&self, crd: &Crd, scope: Scope<'_>) -> Api<DynamicObject> {
        let resource = ApiResource {
            group: crd.group.to_string(),
            version: crd.version.to_string(),
            api_version: crd.api_version(),
            kind: crd.kind.to_string(),
            plural: crd.plural.to_string(),
        };
        match scope {
            Scope::Namespaced(namespace) => {
                Api::namespaced_with(self.client.clone(), namespace, &resource)
            }
            Scope::Cluster => Api::all_with(self.client.clone(), &resource),
        }
    }
}

fn map_error(error: kube::Error) -> ApiError {
    match error {
        kube::Error::Api(response) => ApiError::Status {
            code: response.code,
            message: response.message,
        },
        error => ApiError::Transport(error.to_string()),
    }
}

fn to_value(object: DynamicObject) -> ApiResult<Value> {
    Ok(serde_json::to_value(object)?)
}

impl CustomObjectApi for KubeApi {
    fn get(&self, crd: &Crd, namespace: &str, name: &str) -> ApiFuture<Value> {
        let api = self.api(crd, Scope::Namespaced(namespace));
        let name = name.to_string();
        Box::pin(async move { to_value(api.get(&name).await.map_err(map_error)?) })
    }

    fn list(&self, crd: &Crd, scope: Scope<'_>, options: ListOptions) -> ApiFuture<ObjectList> {
        let api = self.api(crd, scope);
        Box::pin(async move {
            let mut params = ListParams::default();
            if let Some(selector) = &options.label_selector {
                params = params.labels(selector);
            }
            if let Some(limit) = options.limit {
                params = params.limit(limit);
            }
            let list = api.list(&params).await.map_err(map_error)?;
            let resource_version = list.metadata.resource_version.unwrap_or_default();
            let items = list
                .items
                .into_iter()
                .map(to_value)
                .collect::<ApiResult<Vec<_>>>()?;
            Ok(ObjectList {
                items,
                resource_version,
            })
        })
    }

    fn create(&self, crd: &Crd, namespace: &str, body: Value) -> ApiFuture<Value> {
        let api = self.api(crd, Scope::Namespaced(namespace));
        let api_version = crd.api_version();
        let kind = crd.kind.to_string();
        Box::pin(async move {
            let mut body = body;
            if let Value::Object(map) = &mut body {
                map.entry("apiVersion").or_insert(Value::String(api_version));
                map.entry("kind").or_insert(Value::String(kind));
            }
            let object: DynamicObject = serde_json::from_value(body)?;
            to_value(
                api.create(&PostParams::default(), &object)
                    .await
                    .map_err(map_error)?,
            )
        })
    }

    fn patch(&self, crd: &Crd, namespace: &str, name: &str, patch: Value) -> ApiFuture<Value> {
        let api = self.api(crd, Scope::Namespaced(namespace));
        let name = name.to_string();
        Box::pin(async move {
            to_value(
                api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await
                    .map_err(map_error)?,
            )
        })
    }

    fn delete(&self, crd: &Crd, namespace: &str, name: &str) -> ApiFuture<()> {
        let api = self.api(crd, Scope::Namespaced(namespace));
        let name = name.to_string();
        Box::pin(async move {
            api.delete(&name, &DeleteParams::default())
                .await
                .map_err(map_error)?;
            Ok(())
        })
    }

    fn watch(
        &self,
        crd: &Crd,
        scope: Scope<'_>,
        resource_version: &str,
    ) -> ApiFuture<Vec<WatchEvent>> {
        let api = self.api(crd, scope);
        let resource_version = resource_version.to_string();
        Box::pin(async move {
            let params = WatchParams::default().timeout(WATCH_WINDOW_SECS);
            let stream = api
                .watch(&params, &resource_version)
                .await
                .map_err(map_error)?;
            let mut stream = std::pin::pin!(stream);
            let mut events = Vec::new();
            while let Some(event) = stream.try_next().await.map_err(map_error)? {
                events.push(match event {
                    KubeWatchEvent::Added(object) => WatchEvent::Added(to_value(object)?),
                    KubeWatchEvent::Modified(object) => WatchEvent::Modified(to_value(object)?),
                    KubeWatchEvent::Deleted(object) => WatchEvent::Deleted(to_value(object)?),
                    KubeWatchEvent::Bookmark(bookmark) => WatchEvent::Bookmark {
                        resource_version: bookmark.metadata.resource_version,
                    },
                    KubeWatchEvent::Error(error) => WatchEvent::Error {
                        code: error.code,
                        message: error.message,
                    },
                });
            }
            Ok(events)
        })
    }
}

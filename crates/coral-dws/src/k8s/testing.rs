//! In-memory stand-in for the custom resource API.
use std::collections::{BTreeMap, VecDeque};

use serde_json::{Value, json};

use crate::Map;
use crate::common::WrappedRcRefCell;
use crate::k8s::Crd;
use crate::k8s::api::{
    ApiError, ApiFuture, ApiResult, CustomObjectApi, ListOptions, ObjectList, Scope, WatchEvent,
};

type ObjectKey = (String, String, String);

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRequest {
    pub op: &'static str,
    pub plural: String,
    pub name: String,
    pub body: Option<Value>,
}

#[derive(Default)]
pub struct TestApiState {
    objects: BTreeMap<ObjectKey, Value>,
    version: u64,
    /// Per plural: (version, namespace, event)
    events: Map<String, Vec<(u64, String, WatchEvent)>>,
    /// Watches resuming from a version older than this fail with 410.
    pub compacted_before: u64,
    /// Report compaction as an ERROR event instead of a failed request.
    pub gone_as_event: bool,
    failures: Map<&'static str, VecDeque<ApiError>>,
    pub requests: Vec<RecordedRequest>,
}

/// Cloned handles share the same state.
#[derive(Clone, Default)]
pub struct TestApi {
    state: WrappedRcRefCell<TestApiState>,
}

fn merge_patch(target: &mut Value, patch: &Value) {
    match patch {
        Value::Object(patch) => {
            if !target.is_object() {
                *target = Value::Object(Default::default());
            }
            if let Value::Object(target) = target {
                for (key, value) in patch {
                    if value.is_null() {
                        target.remove(key);
                    } else {
                        merge_patch(target.entry(key.clone()).or_insert(Value::Null), value);
                    }
                }
            }
        }
        patch => *target = patch.clone(),
    }
}

fn has_finalizers(object: &Value) -> bool {
    object
        .pointer("/metadata/finalizers")
        .and_then(Value::as_array)
        .map(|f| !f.is_empty())
        .unwrap_or(false)
}

fn not_found(name: &str) -> ApiError {
    ApiError::Status {
        code: 404,
        message: format!("{name} not found"),
    }
}

fn matches_selector(object: &Value, selector: &Option<String>) -> bool {
    let Some(selector) = selector else {
        return true;
    };
    selector.split(',').all(|term| {
        let Some((key, value)) = term.split_once('=') else {
            return false;
        };
        object
            .pointer("/metadata/labels")
            .and_then(|labels| labels.get(key))
            .and_then(Value::as_str)
            == Some(value)
    })
}

impl TestApiState {
    fn take_failure(&mut self, op: &'static str) -> ApiResult<()> {
        match self.failures.get_mut(op).and_then(|f| f.pop_front()) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn record(&mut self, op: &'static str, crd: &Crd, name: &str, body: Option<Value>) {
        self.requests.push(RecordedRequest {
            op,
            plural: crd.plural.to_string(),
            name: name.to_string(),
            body,
        });
    }

    fn store(&mut self, crd: &Crd, namespace: &str, name: &str, mut object: Value, added: bool) {
        self.version += 1;
        merge_patch(
            &mut object,
            &json!({"metadata": {"name": name, "namespace": namespace, "resourceVersion": self.version.to_string()}}),
        );
        let event = if added {
            WatchEvent::Added(object.clone())
        } else {
            WatchEvent::Modified(object.clone())
        };
        self.push_event(crd, namespace, event);
        self.objects.insert(
            (crd.plural.to_string(), namespace.to_string(), name.to_string()),
            object,
        );
    }

    fn remove(&mut self, crd: &Crd, namespace: &str, name: &str) {
        let key = (crd.plural.to_string(), namespace.to_string(), name.to_string());
        if let Some(mut object) = self.objects.remove(&key) {
            self.version += 1;
            merge_patch(
                &mut object,
                &json!({"metadata": {"resourceVersion": self.version.to_string()}}),
            );
            self.push_event(crd, namespace, WatchEvent::Deleted(object));
        }
    }

    fn push_event(&mut self, crd: &Crd, namespace: &str, event: WatchEvent) {
        self.events.entry(crd.plural.to_string()).or_default().push((
            self.version,
            namespace.to_string(),
            event,
        ));
    }

    fn in_scope(namespace: &str, scope: &Scope<'_>) -> bool {
        match scope {
            Scope::Namespaced(ns) => *ns == namespace,
            Scope::Cluster => true,
        }
    }
}

impl TestApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces an object, as if it was written by another client.
    pub fn put(&self, crd: &Crd, namespace: &str, name: &str, object: Value) {
        let mut state = self.state.get_mut();
        let added = !state.objects.contains_key(&(
            crd.plural.to_string(),
            namespace.to_string(),
            name.to_string(),
        ));
        state.store(crd, namespace, name, object, added);
    }

    /// Merges `patch` into an existing object, as if it was written by another client.
    pub fn update(&self, crd: &Crd, namespace: &str, name: &str, patch: Value) {
        let mut state = self.state.get_mut();
        let key = (crd.plural.to_string(), namespace.to_string(), name.to_string());
        let mut object = state.objects.get(&key).cloned().unwrap_or(Value::Null);
        merge_patch(&mut object, &patch);
        state.store(crd, namespace, name, object, false);
    }

    pub fn object(&self, crd: &Crd, namespace: &str, name: &str) -> Option<Value> {
        self.state
            .get()
            .objects
            .get(&(crd.plural.to_string(), namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// The next `op` request fails with `error`.
    pub fn fail_next(&self, op: &'static str, error: ApiError) {
        self.state
            .get_mut()
            .failures
            .entry(op)
            .or_default()
            .push_back(error);
    }

    /// Forgets all events up to the current version, watches resuming from an older
    /// version will be told that it is gone.
    pub fn compact(&self, as_event: bool) {
        let mut state = self.state.get_mut();
        state.compacted_before = state.version;
        state.gone_as_event = as_event;
    }

    pub fn version(&self) -> u64 {
        self.state.get().version
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.get().requests.clone()
    }

    pub fn requests_of(&self, op: &str, plural: &str) -> Vec<RecordedRequest> {
        self.state
            .get()
            .requests
            .iter()
            .filter(|r| r.op == op && r.plural == plural)
            .cloned()
            .collect()
    }
}

impl CustomObjectApi for TestApi {
    fn get(&self, crd: &Crd, namespace: &str, name: &str) -> ApiFuture<Value> {
        let result = {
            let mut state = self.state.get_mut();
            state.record("get", crd, name, None);
            state.take_failure("get").and_then(|_| {
                state
                    .objects
                    .get(&(crd.plural.to_string(), namespace.to_string(), name.to_string()))
                    .cloned()
                    .ok_or_else(|| not_found(name))
            })
        };
        Box::pin(async move { result })
    }

    fn list(&self, crd: &Crd, scope: Scope<'_>, options: ListOptions) -> ApiFuture<ObjectList> {
        let result = {
            let mut state = self.state.get_mut();
            state.record("list", crd, "", None);
            state.take_failure("list").map(|_| {
                let mut items: Vec<Value> = state
                    .objects
                    .iter()
                    .filter(|((plural, namespace, _), object)| {
                        plural == crd.plural
                            && TestApiState::in_scope(namespace, &scope)
                            && matches_selector(object, &options.label_selector)
                    })
                    .map(|(_, object)| object.clone())
                    .collect();
                if let Some(limit) = options.limit {
                    items.truncate(limit as usize);
                }
                ObjectList {
                    items,
                    resource_version: state.version.to_string(),
                }
            })
        };
        Box::pin(async move { result })
    }

    fn create(&self, crd: &Crd, namespace: &str, body: Value) -> ApiFuture<Value> {
        let result = {
            let mut state = self.state.get_mut();
            let name = body
                .pointer("/metadata/name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            state.record("create", crd, &name, Some(body.clone()));
            state.take_failure("create").and_then(|_| {
                let key = (crd.plural.to_string(), namespace.to_string(), name.clone());
                if state.objects.contains_key(&key) {
                    return Err(ApiError::Status {
                        code: 409,
                        message: format!("{name} already exists"),
                    });
                }
                state.store(crd, namespace, &name, body, true);
                Ok(state.objects[&key].clone())
            })
        };
        Box::pin(async move { result })
    }

    fn patch(&self, crd: &Crd, namespace: &str, name: &str, patch: Value) -> ApiFuture<Value> {
        let result = {
            let mut state = self.state.get_mut();
            state.record("patch", crd, name, Some(patch.clone()));
            state.take_failure("patch").and_then(|_| {
                let key = (crd.plural.to_string(), namespace.to_string(), name.to_string());
                let mut object = state.objects.get(&key).cloned().ok_or_else(|| not_found(name))?;
                merge_patch(&mut object, &patch);
                let deleting = object.pointer("/metadata/deletionTimestamp").is_some();
                if deleting && !has_finalizers(&object) {
                    state.remove(crd, namespace, name);
                    Ok(object)
                } else {
                    state.store(crd, namespace, name, object, false);
                    Ok(state.objects[&key].clone())
                }
            })
        };
        Box::pin(async move { result })
    }

    fn delete(&self, crd: &Crd, namespace: &str, name: &str) -> ApiFuture<()> {
        let result = {
            let mut state = self.state.get_mut();
            state.record("delete", crd, name, None);
            state.take_failure("delete").and_then(|_| {
                let key = (crd.plural.to_string(), namespace.to_string(), name.to_string());
                let object = state.objects.get(&key).cloned().ok_or_else(|| not_found(name))?;
                if has_finalizers(&object) {
                    let mut object = object;
                    merge_patch(
                        &mut object,
                        &json!({"metadata": {"deletionTimestamp": "2024-01-01T00:00:00Z"}}),
                    );
                    state.store(crd, namespace, name, object, false);
                } else {
                    state.remove(crd, namespace, name);
                }
                Ok(())
            })
        };
        Box::pin(async move { result })
    }

    fn watch(
        &self,
        crd: &Crd,
        scope: Scope<'_>,
        resource_version: &str,
    ) -> ApiFuture<Vec<WatchEvent>> {
        let result = {
            let mut state = self.state.get_mut();
            state.record("watch", crd, resource_version, None);
            state.take_failure("watch").and_then(|_| {
                let since = resource_version.parse::<u64>().unwrap_or(0);
                if since == 0 {
                    return Ok(state
                        .objects
                        .iter()
                        .filter(|((plural, namespace, _), _)| {
                            plural == crd.plural && TestApiState::in_scope(namespace, &scope)
                        })
                        .map(|(_, object)| WatchEvent::Added(object.clone()))
                        .collect());
                }
                if since < state.compacted_before {
                    let message = format!("too old resource version: {since}");
                    return if state.gone_as_event {
                        Ok(vec![WatchEvent::Error { code: 410, message }])
                    } else {
                        Err(ApiError::Status { code: 410, message })
                    };
                }
                Ok(state
                    .events
                    .get(crd.plural)
                    .map(|events| {
                        events
                            .iter()
                            .filter(|(version, namespace, _)| {
                                *version > since && TestApiState::in_scope(namespace, &scope)
                            })
                            .map(|(_, _, event)| event.clone())
                            .collect()
                    })
                    .unwrap_or_default())
            })
        };
        Box::pin(async move { result })
    }
}

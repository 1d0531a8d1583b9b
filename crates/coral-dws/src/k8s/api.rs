use std::future::Future;
use std::pin::Pin;

use serde_json::Value;
use thiserror::Error;

use crate::k8s::Crd;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ApiError {
    /// The API server answered with an error status.
    #[error("API request failed with status {code}: {message}")]
    Status { code: u16, message: String },
    /// The API server could not be reached, or the connection broke.
    #[error("API request failed: {0}")]
    Transport(String),
    #[error("Cannot decode API object: {0}")]
    Decode(String),
}

impl ApiError {
    pub fn code(&self) -> Option<u16> {
        match self {
            ApiError::Status { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.code() == Some(404)
    }

    pub fn is_conflict(&self) -> bool {
        self.code() == Some(409)
    }

    /// The requested resource version is too old to resume a watch from.
    pub fn is_gone(&self) -> bool {
        self.code() == Some(410)
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(error: serde_json::Error) -> Self {
        ApiError::Decode(error.to_string())
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
pub type ApiFuture<T> = Pin<Box<dyn Future<Output = ApiResult<T>>>>;

/// Namespace scope of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope<'a> {
    Namespaced(&'a str),
    Cluster,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListOptions {
    pub label_selector: Option<String>,
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectList {
    pub items: Vec<Value>,
    pub resource_version: String,
}

/// One event delivered by a watch.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Added(Value),
    Modified(Value),
    Deleted(Value),
    /// Only advances the resource version.
    Bookmark { resource_version: String },
    /// The watch failed on the server side, e.g. with `410 Gone`.
    Error { code: u16, message: String },
}

impl WatchEvent {
    pub fn object(&self) -> Option<&Value> {
        match self {
            WatchEvent::Added(object)
            | WatchEvent::Modified(object)
            | WatchEvent::Deleted(object) => Some(object),
            WatchEvent::Bookmark { .. } | WatchEvent::Error { .. } => None,
        }
    }

    pub fn resource_version(&self) -> Option<&str> {
        match self {
            WatchEvent::Bookmark { resource_version } => Some(resource_version),
            _ => self
                .object()
                .and_then(|object| object.pointer("/metadata/resourceVersion"))
                .and_then(Value::as_str),
        }
    }
}

/// Requests against the custom resource API.
///
/// Objects are passed around as JSON and decoded into the typed views from
/// [`crate::k8s::objects`] by the callers. Returned futures own everything they need, so
/// they can be awaited after `self` is borrowed elsewhere.
pub trait CustomObjectApi {
    fn get(&self, crd: &Crd, namespace: &str, name: &str) -> ApiFuture<Value>;

    fn list(&self, crd: &Crd, scope: Scope<'_>, options: ListOptions) -> ApiFuture<ObjectList>;

    fn create(&self, crd: &Crd, namespace: &str, body: Value) -> ApiFuture<Value>;

    /// Applies a JSON merge patch.
    fn patch(&self, crd: &Crd, namespace: &str, name: &str, patch: Value) -> ApiFuture<Value>;

    fn delete(&self, crd: &Crd, namespace: &str, name: &str) -> ApiFuture<()>;

    /// Watches the collection for one bounded window, starting after `resource_version`,
    /// and returns the events that were delivered during that window.
    fn watch(
        &self,
        crd: &Crd,
        scope: Scope<'_>,
        resource_version: &str,
    ) -> ApiFuture<Vec<WatchEvent>>;
}

//! Connection to the job manager. Requests arrive over the gateway and are answered by
//! the reconciler; everything the bridge tells the job manager on its own initiative
//! goes through a [`JobManagerNotifier`].
use std::collections::BTreeMap;

use serde_json::Value;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

use crate::JobId;
use crate::common::hostlist::encode_hostlist;
use crate::gateway::messages::{ResourceUpdate, ToJobManagerMessage};

pub mod connection;
pub mod messages;

/// Severity of job exceptions that terminate the job.
pub const FATAL_SEVERITY: u32 = 0;

/// Fire-and-forget notifications for the job manager. Cheap to clone and usable from
/// any thread.
#[derive(Clone, Debug)]
pub struct JobManagerNotifier {
    sender: UnboundedSender<ToJobManagerMessage>,
}

impl JobManagerNotifier {
    pub fn new() -> (Self, UnboundedReceiver<ToJobManagerMessage>) {
        let (sender, receiver) = unbounded_channel();
        (JobManagerNotifier { sender }, receiver)
    }

    pub fn send(&self, message: ToJobManagerMessage) {
        if self.sender.send(message).is_err() {
            log::debug!("Gateway is not running, dropping notification");
        }
    }

    pub fn resource_update(&self, update: ResourceUpdate) {
        self.send(ToJobManagerMessage::ResourceUpdate(update));
    }

    pub fn prolog_remove(
        &self,
        id: JobId,
        variables: BTreeMap<String, String>,
        token: Option<String>,
    ) {
        self.send(ToJobManagerMessage::PrologRemove {
            id,
            variables,
            token,
        });
    }

    pub fn epilog_remove(&self, id: JobId) {
        self.send(ToJobManagerMessage::EpilogRemove { id });
    }

    pub fn memo(&self, id: JobId, memo: Value) {
        self.send(ToJobManagerMessage::Memo { id, memo });
    }

    /// Raises a fatal exception on the job.
    pub fn raise(&self, id: JobId, message: String) {
        log::info!("Raising exception on job {id}: {message}");
        self.send(ToJobManagerMessage::JobRaise {
            id,
            severity: FATAL_SEVERITY,
            kind: "exception".to_string(),
            message,
        });
    }

    pub fn node_failure(&self, id: JobId, nodes: Vec<String>) {
        self.send(ToJobManagerMessage::NodeFailure { id, nodes });
    }

    pub fn kvs_put(&self, id: JobId, entries: BTreeMap<String, Value>) {
        self.send(ToJobManagerMessage::KvsPut { id, entries });
    }

    pub fn drain<S: AsRef<str>>(&self, nodes: &[S], reason: &str) {
        self.send(ToJobManagerMessage::Drain {
            targets: encode_hostlist(nodes),
            mode: "update".to_string(),
            reason: reason.to_string(),
        });
    }

    pub fn set_property<S: AsRef<str>>(&self, nodes: &[S], property: &str) {
        self.send(ToJobManagerMessage::SetProperty {
            targets: encode_hostlist(nodes),
            property: property.to_string(),
        });
    }

    pub fn remove_property<S: AsRef<str>>(&self, nodes: &[S], property: &str) {
        self.send(ToJobManagerMessage::RemoveProperty {
            targets: encode_hostlist(nodes),
            property: property.to_string(),
        });
    }

    pub fn set_status(&self, path: String, up: bool) {
        self.send(ToJobManagerMessage::SetStatus { path, up });
    }
}

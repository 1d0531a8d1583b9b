use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::JobId;
use crate::common::error::RequestError;
use crate::server::allocation::jobspec::JobResource;

// Messages job manager -> bridge
#[derive(Deserialize, Serialize, Debug)]
#[serde(tag = "topic", content = "payload", rename_all = "kebab-case")]
pub enum FromJobManagerMessage {
    Request(RequestMessage),
    /// A notification sent by us could not be delivered to the job.
    NotificationFailed(NotificationFailed),
}

#[derive(Deserialize, Serialize, Debug)]
pub struct RequestMessage {
    pub request_id: u64,
    pub request: DwsRequest,
}

#[derive(Deserialize, Serialize, Debug)]
pub struct NotificationFailed {
    pub topic: String,
    pub errstr: String,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum DwsRequest {
    Create(CreateRequest),
    Setup(SetupRequest),
    PostRun(PostRunRequest),
    Teardown { job_id: JobId },
    Abort { job_id: JobId },
    Status,
}

impl DwsRequest {
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            DwsRequest::Create(msg) => Some(msg.job_id),
            DwsRequest::Setup(msg) => Some(msg.job_id),
            DwsRequest::PostRun(msg) => Some(msg.job_id),
            DwsRequest::Teardown { job_id } | DwsRequest::Abort { job_id } => Some(*job_id),
            DwsRequest::Status => None,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct CreateRequest {
    pub job_id: JobId,
    pub user_id: u32,
    /// A string or a list of strings, validated by the reconciler.
    pub dw_directives: Value,
    pub resources: Vec<JobResource>,
    #[serde(default)]
    pub failure_tolerance: u32,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct SetupRequest {
    pub job_id: JobId,
    #[serde(rename = "R")]
    pub resources: ResourceSet,
}

/// The part of a Flux resource set (R) that names the allocated nodes.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct ResourceSet {
    pub execution: ResourceExecution,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct ResourceExecution {
    /// Hostlist expressions.
    #[serde(default)]
    pub nodelist: Vec<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct PostRunRequest {
    pub job_id: JobId,
    pub run_started: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DwsReply {
    Done,
    Workflows(Vec<JobId>),
}

pub type DwsResponse = Result<DwsReply, RequestError>;

// Messages bridge -> job manager
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "topic", content = "payload", rename_all = "kebab-case")]
pub enum ToJobManagerMessage {
    Response(ResponseMessage),
    ResourceUpdate(ResourceUpdate),
    PrologRemove {
        id: JobId,
        variables: BTreeMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    EpilogRemove {
        id: JobId,
    },
    Memo {
        id: JobId,
        memo: Value,
    },
    JobRaise {
        id: JobId,
        severity: u32,
        #[serde(rename = "type")]
        kind: String,
        message: String,
    },
    NodeFailure {
        id: JobId,
        nodes: Vec<String>,
    },
    KvsPut {
        id: JobId,
        entries: BTreeMap<String, Value>,
    },
    Drain {
        targets: String,
        mode: String,
        reason: String,
    },
    SetProperty {
        targets: String,
        property: String,
    },
    RemoveProperty {
        targets: String,
        property: String,
    },
    SetStatus {
        path: String,
        up: bool,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ResponseMessage {
    pub request_id: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errstr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflows: Option<Vec<JobId>>,
}

impl ResponseMessage {
    pub fn new(request_id: u64, response: DwsResponse) -> Self {
        match response {
            Ok(reply) => ResponseMessage {
                request_id,
                success: true,
                errstr: None,
                error_kind: None,
                workflows: match reply {
                    DwsReply::Done => None,
                    DwsReply::Workflows(workflows) => Some(workflows),
                },
            },
            Err(error) => ResponseMessage {
                request_id,
                success: false,
                errstr: Some(error.to_string()),
                error_kind: Some(error.kind().to_string()),
                workflows: None,
            },
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ResourceUpdate {
    pub id: JobId,
    pub resources: Vec<JobResource>,
    pub copy_offload: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errmsg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude: Option<String>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{
        DwsReply, DwsRequest, FromJobManagerMessage, ResponseMessage, ToJobManagerMessage,
    };
    use crate::JobId;
    use crate::common::error::RequestError;

    #[test]
    fn parse_requests() {
        let msg: FromJobManagerMessage = serde_json::from_value(json!({
            "topic": "request",
            "payload": {"request_id": 3, "request": {
                "method": "create",
                "job_id": "f2x",
                "user_id": 1000,
                "dw_directives": "#DW jobdw type=xfs capacity=1GiB name=x",
                "resources": [{"type": "node", "count": 1}]
            }}
        }))
        .unwrap();
        let FromJobManagerMessage::Request(msg) = msg else {
            panic!("unexpected message");
        };
        assert_eq!(msg.request_id, 3);
        let DwsRequest::Create(create) = msg.request else {
            panic!("unexpected request");
        };
        assert_eq!(create.failure_tolerance, 0);
        assert_eq!(create.resources[0].count, Some(1));

        let setup: DwsRequest = serde_json::from_value(json!({
            "method": "setup",
            "job_id": 5,
            "R": {"version": 1, "execution": {"nodelist": ["node[1-2]"]}}
        }))
        .unwrap();
        assert_eq!(setup.job_id(), Some(JobId::new(5)));

        let status: DwsRequest = serde_json::from_value(json!({"method": "status"})).unwrap();
        assert_eq!(status.job_id(), None);
    }

    #[test]
    fn response_encoding() {
        let ok = ResponseMessage::new(1, Ok(DwsReply::Workflows(vec![JobId::new(7)])));
        assert_eq!(
            serde_json::to_value(ToJobManagerMessage::Response(ok)).unwrap(),
            json!({"topic": "response", "payload": {"request_id": 1, "success": true, "workflows": [7]}})
        );
        let failed = ResponseMessage::new(2, Err(RequestError::User("bad".into())));
        assert_eq!(
            serde_json::to_value(&failed).unwrap(),
            json!({"request_id": 2, "success": false, "errstr": "bad", "error_kind": "user"})
        );
    }

    #[test]
    fn notification_encoding() {
        let msg = ToJobManagerMessage::JobRaise {
            id: JobId::new(1),
            severity: 0,
            kind: "dws".into(),
            message: "failed".into(),
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"topic": "job-raise", "payload": {"id": 1, "severity": 0, "type": "dws", "message": "failed"}})
        );
    }
}

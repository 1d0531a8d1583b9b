pub mod common;
pub mod gateway;
pub mod k8s;
pub mod server;

pub use common::ids::JobId;
pub use common::{Map, Set};

pub type Error = crate::common::error::DwsError;
pub type Result<T> = std::result::Result<T, Error>;

/// Exit status used for faults that a supervisor should not retry.
pub const EXIT_NO_RESTART: i32 = 3;

/// Prefix of every Workflow object created by this bridge.
pub const WORKFLOW_NAME_PREFIX: &str = "fluxjob-";

/// Finalizer attached to Workflows while this bridge still owns them.
pub const WORKFLOW_FINALIZER: &str = "flux-framework.readthedocs.io/workflow";

/// Scheduler property put on compute nodes whose storage is unusable.
pub const EXCLUDE_PROPERTY: &str = "badrabbit";

pub const GIB: u64 = 1024 * 1024 * 1024;

pub fn workflow_name(job_id: JobId) -> String {
    format!("{WORKFLOW_NAME_PREFIX}{job_id}")
}

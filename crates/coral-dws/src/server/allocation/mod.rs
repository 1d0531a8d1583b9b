//! Sizing and placement of storage allocations, and the jobspec rewrite that reserves
//! node-local storage for a job.
use thiserror::Error;

use crate::k8s::objects::AllocationStrategy;

pub mod directives;
pub mod jobspec;
pub mod limits;
pub mod planner;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PlanError {
    #[error("jobspec resources empty")]
    EmptyResources,
    #[error("jobspec resources has top level 'slot' entry with {0} below it")]
    UnexpectedSlotContent(String),
    #[error(
        "jobspec resources must have a single top-level 'node' entry, got {entries} entries, first entry '{first}'"
    )]
    UnsupportedLayout { entries: usize, first: String },
    #[error("unsupported breakdown kind '{0}'")]
    UnsupportedBreakdownKind(String),
    #[error("Breakdown {0} marked as not ready")]
    BreakdownNotReady(String),
    #[error("unrecognized storage label '{0}'")]
    UnknownLabel(String),
    #[error("{label} allocationStrategy must be '{expected}' but got '{got}'")]
    StrategyMismatch {
        label: String,
        expected: AllocationStrategy,
        got: AllocationStrategy,
    },
    #[error(
        "Requested a total of {requested} GiB of {bucket} storage per node but max is {allowable} GiB per node"
    )]
    LimitExceeded {
        requested: u64,
        bucket: &'static str,
        allowable: u64,
    },
    #[error("allocation count of '{0}' must be positive")]
    InvalidCount(String),
    #[error("no storage servers are attached to the compute nodes of the job")]
    NoServers,
}

pub mod allocation;
pub mod bootstrap;
pub mod cleanup;
pub mod reconciler;
pub mod storage;
pub mod topology;
pub mod transitions;
pub mod workflow;

//! What the bridge does when a Workflow finishes a stage.
use std::time::Duration;

use crate::common::config::StageTimeouts;
use crate::k8s::objects::WorkflowStage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageAction {
    /// Rewrite the job's resources from the directive breakdowns.
    ApplyBreakdowns,
    /// Request the next stage.
    Advance(WorkflowStage),
    /// Let the job start.
    ReleaseProlog,
    MoveToTeardown,
    /// Release the job and delete the Workflow.
    Finish,
}

pub fn completion_action(stage: WorkflowStage) -> StageAction {
    match stage {
        WorkflowStage::Proposal => StageAction::ApplyBreakdowns,
        WorkflowStage::Setup => StageAction::Advance(WorkflowStage::DataIn),
        WorkflowStage::DataIn => StageAction::Advance(WorkflowStage::PreRun),
        WorkflowStage::PreRun => StageAction::ReleaseProlog,
        WorkflowStage::PostRun => StageAction::Advance(WorkflowStage::DataOut),
        WorkflowStage::DataOut => StageAction::MoveToTeardown,
        WorkflowStage::Teardown => StageAction::Finish,
    }
}

/// Soft timeout of a stage, started when the stage is requested.
pub fn soft_timeout(stage: WorkflowStage, timeouts: &StageTimeouts) -> Option<Duration> {
    match stage {
        WorkflowStage::Setup => timeouts.setup,
        WorkflowStage::PreRun => timeouts.prerun,
        WorkflowStage::PostRun => timeouts.postrun,
        _ => None,
    }
}

/// The job waits in its epilog while the Workflow works on these stages, so a job
/// exception alone does not end them.
pub fn blocks_on_epilog(stage: WorkflowStage) -> bool {
    matches!(stage, WorkflowStage::PostRun | WorkflowStage::DataOut)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{StageAction, blocks_on_epilog, completion_action, soft_timeout};
    use crate::common::config::StageTimeouts;
    use crate::k8s::objects::WorkflowStage;

    #[test]
    fn stages_advance_in_order() {
        let mut stage = WorkflowStage::Setup;
        let mut visited = vec![stage];
        while let StageAction::Advance(next) = completion_action(stage) {
            visited.push(next);
            stage = next;
        }
        assert_eq!(
            visited,
            vec![WorkflowStage::Setup, WorkflowStage::DataIn, WorkflowStage::PreRun]
        );
        assert_eq!(
            completion_action(WorkflowStage::PostRun),
            StageAction::Advance(WorkflowStage::DataOut)
        );
        assert_eq!(
            completion_action(WorkflowStage::DataOut),
            StageAction::MoveToTeardown
        );
    }

    #[test]
    fn only_some_stages_have_timeouts() {
        let timeouts = StageTimeouts {
            setup: Some(Duration::from_secs(10)),
            prerun: None,
            postrun: Some(Duration::from_secs(30)),
        };
        assert_eq!(
            soft_timeout(WorkflowStage::Setup, &timeouts),
            Some(Duration::from_secs(10))
        );
        assert_eq!(soft_timeout(WorkflowStage::PreRun, &timeouts), None);
        assert_eq!(soft_timeout(WorkflowStage::DataOut, &timeouts), None);
        assert!(blocks_on_epilog(WorkflowStage::DataOut));
        assert!(!blocks_on_epilog(WorkflowStage::PreRun));
    }
}

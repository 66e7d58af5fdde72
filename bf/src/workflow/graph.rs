//! Stage graph
//!
//! The workflow is a fixed directed graph with a small number of
//! conditional edges. The next stage is computed from the current stage
//! plus the run context; cycles (debug <-> test, implement <-> rejection)
//! are plain transitions with their iteration guards on the edges.

use crate::domain::{RunContext, StageName};

/// Edge guards for the conditional transitions
#[derive(Debug, Clone, Copy)]
pub struct GraphLimits {
    pub max_debug_attempts: u32,
}

/// Where the run goes after a successful stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    /// Dispatch another adapter stage
    Stage(StageName),
    /// Suspend and wait for the human verdict
    AwaitValidation,
    /// Terminal success
    Complete,
}

/// First stage of every run
pub fn initial_stage() -> StageName {
    StageName::Prepare
}

/// Stage a run re-enters after a rejection with instructions
pub fn rejection_reentry() -> StageName {
    StageName::Implement
}

/// Compute the successor of a succeeded stage
pub fn next_stage(current: StageName, ctx: &RunContext, limits: &GraphLimits) -> Next {
    match current {
        StageName::Prepare => Next::Stage(StageName::Analyze),
        StageName::Analyze => Next::Stage(StageName::Implement),
        StageName::Implement => Next::Stage(StageName::Test),
        StageName::Test => {
            let failed = ctx.test_report.as_ref().map(|r| r.executed && !r.passed).unwrap_or(false);
            if failed && ctx.debug_attempts < limits.max_debug_attempts {
                Next::Stage(StageName::Debug)
            } else {
                // Exhausted debug attempts proceed to qa carrying the
                // failure marker in the context's test report
                Next::Stage(StageName::Qa)
            }
        }
        StageName::Debug => Next::Stage(StageName::Test),
        StageName::Qa => Next::Stage(StageName::FinalizePr),
        StageName::FinalizePr => Next::AwaitValidation,
        // The approve edge; reject and abandon are handled by the engine
        StageName::HumanValidation => Next::Stage(StageName::Merge),
        StageName::Merge => Next::Complete,
    }
}

//! Progress reporting hooks for sync runs.

use kernelsync_shared::PipelineKind;

use crate::sync::SyncOutcome;

/// Progress callback for reporting run status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new stage.
    fn phase(&self, name: &str);
    /// Called after each registration candidate, whatever its result.
    fn candidate_processed(&self, kind: PipelineKind, member_id: &str, current: usize, total: usize);
    /// Called when the run completes.
    fn done(&self, outcome: &SyncOutcome);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn candidate_processed(
        &self,
        _kind: PipelineKind,
        _member_id: &str,
        _current: usize,
        _total: usize,
    ) {
    }
    fn done(&self, _outcome: &SyncOutcome) {}
}

//! Request state reporting

use tracing::info;

pub const STATE_IN_PROGRESS: &str = "in_progress";
pub const STATE_COMPLETE: &str = "complete";
pub const STATE_FAILED: &str = "failed";

/// Receives coarse milestones of a build request
pub trait RequestStateRecorder: Send + Sync {
    fn set_state(&self, request_id: u64, state: &str, reason: &str);
}

/// Logs each milestone
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingStateRecorder;

impl RequestStateRecorder for TracingStateRecorder {
    fn set_state(&self, request_id: u64, state: &str, reason: &str) {
        info!(request_id, state, "{}", reason);
    }
}

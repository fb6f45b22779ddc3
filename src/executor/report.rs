use std::time::{Duration, Instant, SystemTime};

use serde::Serialize;
use thiserror::Error;

/// Final status of one visited leaf action.
#[derive(Debug, Copy, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Completed,
    Failed,
    Skipped,
}

/// Outcome of one visited leaf, in visiting order.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActionRecord {
    /// Indices from the top-level sequence down to the leaf.
    pub path: Vec<usize>,
    pub action: &'static str,
    pub status: ActionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Report of one run.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    /// No leaf failed and the scenario did not terminate itself.
    pub success: bool,
    pub completed_actions: usize,
    pub failed_actions: usize,
    pub skipped_actions: usize,
    pub start_time: SystemTime,
    pub end_time: SystemTime,
    pub duration: Duration,
    /// The run halted early because `stop()` was requested.
    pub stopped: bool,
    /// Message of the `fail` action (or terminating leaf) that ended the run.
    pub termination_reason: Option<String>,
    pub outcomes: Vec<ActionRecord>,
}

impl ExecutionResult {
    /// Number of leaf actions the run visited.
    pub fn visited_actions(&self) -> usize {
        self.completed_actions + self.failed_actions + self.skipped_actions
    }
}

/// Errors returned by `MacroEngine::execute`.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("execution already in progress")]
    AlreadyRunning,

    /// The run aborted; `result` holds what was done up to that point.
    #[error("execution aborted: {message}")]
    Fault {
        message: String,
        result: Box<ExecutionResult>,
    },
}

impl ExecutionError {
    /// Partial report attached to a fault.
    pub fn partial_result(&self) -> Option<&ExecutionResult> {
        match self {
            ExecutionError::AlreadyRunning => None,
            ExecutionError::Fault { result, .. } => Some(result),
        }
    }
}

/// Accumulates counters and records while a run is in flight.
#[derive(Debug)]
pub(crate) struct ReportBuilder {
    start_time: SystemTime,
    started: Instant,
    completed: usize,
    failed: usize,
    skipped: usize,
    stopped: bool,
    termination_reason: Option<String>,
    outcomes: Vec<ActionRecord>,
}

impl ReportBuilder {
    pub(crate) fn start() -> Self {
        Self {
            start_time: SystemTime::now(),
            started: Instant::now(),
            completed: 0,
            failed: 0,
            skipped: 0,
            stopped: false,
            termination_reason: None,
            outcomes: Vec::new(),
        }
    }

    pub(crate) fn record(
        &mut self,
        path: Vec<usize>,
        action: &'static str,
        status: ActionStatus,
        error: Option<String>,
    ) {
        match status {
            ActionStatus::Completed => self.completed += 1,
            ActionStatus::Failed => self.failed += 1,
            ActionStatus::Skipped => self.skipped += 1,
        }
        self.outcomes.push(ActionRecord {
            path,
            action,
            status,
            error,
        });
    }

    pub(crate) fn mark_stopped(&mut self) {
        self.stopped = true;
    }

    pub(crate) fn mark_terminated(&mut self, reason: String) {
        self.termination_reason = Some(reason);
    }

    pub(crate) fn snapshot(&self) -> ExecutionResult {
        let duration = self.started.elapsed();
        ExecutionResult {
            success: self.failed == 0 && self.termination_reason.is_none(),
            completed_actions: self.completed,
            failed_actions: self.failed,
            skipped_actions: self.skipped,
            start_time: self.start_time,
            end_time: self.start_time + duration,
            duration,
            stopped: self.stopped,
            termination_reason: self.termination_reason.clone(),
            outcomes: self.outcomes.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_reflects_failures_and_termination() {
        let mut report = ReportBuilder::start();
        report.record(vec![0], "click", ActionStatus::Completed, None);
        report.record(vec![1], "skip", ActionStatus::Skipped, None);
        let ok = report.snapshot();
        assert!(ok.success);
        assert_eq!(ok.visited_actions(), 2);
        assert!(ok.end_time >= ok.start_time);

        report.mark_terminated("boom".into());
        assert!(!report.snapshot().success);

        let mut failing = ReportBuilder::start();
        failing.record(vec![0, 2], "input", ActionStatus::Failed, Some("no field".into()));
        let r = failing.snapshot();
        assert!(!r.success);
        assert_eq!(r.outcomes[0].path, vec![0, 2]);
    }

    #[test]
    fn fault_exposes_partial_result() {
        let err = ExecutionError::Fault {
            message: "x".into(),
            result: Box::new(ReportBuilder::start().snapshot()),
        };
        assert_eq!(err.to_string(), "execution aborted: x");
        assert!(err.partial_result().is_some());
        assert!(ExecutionError::AlreadyRunning.partial_result().is_none());
    }
}

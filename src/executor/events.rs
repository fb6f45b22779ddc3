//! Life-cycle events emitted while a scenario runs.
//!
//! Events travel over an unbounded Tokio channel, so emitting never blocks the run.
//! Within one run events are sent strictly in the order things happen.

use serde::Serialize;
use tokio::sync::mpsc;

use crate::config::Action;
use crate::executor::report::ExecutionResult;

pub type EventSender = mpsc::UnboundedSender<ExecutionEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<ExecutionEvent>;

/// Create a new event channel.
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Events emitted during scenario execution.
///
/// `index` is always the position within the sequence currently being walked
/// (nested sequences restart at 0).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ExecutionEvent {
    /// `execution:start`
    Start { total_actions: usize },

    /// `execution:action-start`, before a leaf is dispatched.
    ActionStart {
        index: usize,
        action: Action,
        /// Fraction of the top-level sequence reached, in `(0, 1]`.
        progress: f64,
    },

    /// `execution:action-complete`
    ActionComplete { index: usize, action: Action },

    /// `execution:action-failed`
    ActionFailed {
        index: usize,
        action: Action,
        error: String,
    },

    /// `execution:action-skipped`
    ActionSkipped {
        index: usize,
        action: Action,
        reason: Option<String>,
    },

    /// `execution:condition-evaluated`, once per `if` and once per `while` check.
    ConditionEvaluated {
        action: &'static str,
        condition: Option<String>,
        result: bool,
    },

    /// `execution:loop-iteration`, before each body pass of `loop`/`while` (1-based).
    LoopIteration {
        action: &'static str,
        iteration: u32,
        total: Option<u32>,
    },

    /// `execution:terminated`, by a `fail` action or a leaf asking to terminate.
    Terminated { index: usize, reason: String },

    /// `execution:stop-requested`, emitted by `StopHandle::stop`.
    StopRequested { index: usize },

    /// `execution:stopped`, when the run honours a stop request.
    Stopped { index: usize },

    /// `execution:complete`, closes every run that did not fault.
    Complete { result: ExecutionResult },

    /// `execution:error`, emitted right before a fault is returned to the caller.
    Error {
        error: String,
        result: ExecutionResult,
    },
}

impl ExecutionEvent {
    /// Wire name of the signal.
    pub fn name(&self) -> &'static str {
        match self {
            ExecutionEvent::Start { .. } => "execution:start",
            ExecutionEvent::ActionStart { .. } => "execution:action-start",
            ExecutionEvent::ActionComplete { .. } => "execution:action-complete",
            ExecutionEvent::ActionFailed { .. } => "execution:action-failed",
            ExecutionEvent::ActionSkipped { .. } => "execution:action-skipped",
            ExecutionEvent::ConditionEvaluated { .. } => "execution:condition-evaluated",
            ExecutionEvent::LoopIteration { .. } => "execution:loop-iteration",
            ExecutionEvent::Terminated { .. } => "execution:terminated",
            ExecutionEvent::StopRequested { .. } => "execution:stop-requested",
            ExecutionEvent::Stopped { .. } => "execution:stopped",
            ExecutionEvent::Complete { .. } => "execution:complete",
            ExecutionEvent::Error { .. } => "execution:error",
        }
    }

    /// True for the events that end a run.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            ExecutionEvent::Complete { .. } | ExecutionEvent::Error { .. }
        )
    }
}

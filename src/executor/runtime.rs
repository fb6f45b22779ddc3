use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::{Action, Condition, ExecutionOptions};
use crate::executor::actions::ActionExecutor;
use crate::executor::condition::evaluate;
use crate::executor::context::ExecutionContext;
use crate::executor::events::{EventSender, ExecutionEvent};
use crate::executor::report::{ActionStatus, ExecutionError, ExecutionResult, ReportBuilder};

/// Termination reason used when a `fail` action carries no message.
const DEFAULT_FAIL_MESSAGE: &str = "Test failed";
/// Termination reason used when a leaf terminates the run without an error message.
const DEFAULT_TERMINATE_MESSAGE: &str = "Execution terminated by action";

/// State shared between the engine and its stop handles.
struct Shared {
    running: AtomicBool,
    cancel: Mutex<CancellationToken>,
    /// Index of the action most recently reached in the active sequence.
    current_index: AtomicUsize,
    events: Option<EventSender>,
}

impl Shared {
    fn new(events: Option<EventSender>) -> Self {
        Self {
            running: AtomicBool::new(false),
            cancel: Mutex::new(CancellationToken::new()),
            current_index: AtomicUsize::new(0),
            events,
        }
    }

    fn emit(&self, make: impl FnOnce() -> ExecutionEvent) {
        if let Some(tx) = &self.events {
            // A dropped receiver only means nobody is listening.
            let _ = tx.send(make());
        }
    }

    /// Publishing a run and stopping it both happen under this lock, so a stop always
    /// lands on the token of the run it observed.
    fn lock_cancel(&self) -> MutexGuard<'_, CancellationToken> {
        self.cancel.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Requests cooperative cancellation of the engine's active run.
///
/// Stopping is advisory: an in-flight leaf action or condition check completes, and the
/// run halts before the next action is dispatched.
#[derive(Clone)]
pub struct StopHandle {
    shared: Arc<Shared>,
}

impl StopHandle {
    pub fn stop(&self) {
        let token = self.shared.lock_cancel();
        if !self.shared.running.load(Ordering::SeqCst) {
            debug!(target: "macrobot::runtime", "Stop requested with no run in flight; ignoring");
            return;
        }
        let index = self.shared.current_index.load(Ordering::SeqCst);
        info!(target: "macrobot::runtime", index, "Stop requested");
        self.shared
            .emit(|| ExecutionEvent::StopRequested { index });
        token.cancel();
    }
}

/// Resets the single-run flag when a run ends, including when its future is dropped.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// MacroEngine is responsible for:
/// - walking the action graph in order, descending into `if`/`while`/`loop` bodies
/// - evaluating conditions through the condition evaluator
/// - dispatching regular leaf actions to the `ActionExecutor`
/// - counting outcomes and emitting life-cycle events
///
/// One engine runs at most one scenario at a time.
pub struct MacroEngine {
    options: ExecutionOptions,
    shared: Arc<Shared>,
}

impl MacroEngine {
    /// Create a new engine with the given options and no event listener.
    pub fn new(options: ExecutionOptions) -> Self {
        Self {
            options,
            shared: Arc::new(Shared::new(None)),
        }
    }

    /// Attach an event channel. Stop handles taken before this call are detached.
    pub fn with_events(mut self, events: EventSender) -> Self {
        self.shared = Arc::new(Shared::new(Some(events)));
        self
    }

    /// Returns a reference to the options.
    pub fn options(&self) -> &ExecutionOptions {
        &self.options
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Request cancellation of the active run (see `StopHandle::stop`).
    pub fn stop(&self) {
        self.stop_handle().stop();
    }

    /// Run `actions` to completion, termination, stop or fault.
    ///
    /// Scenario-authored termination (`fail`, `terminateExecution`) and stops are reported
    /// through the returned `ExecutionResult`. `Err` is reserved for a second concurrent
    /// call and for faults (executor errors, nesting overflow, `stopOnFailure`).
    pub async fn execute<E: ActionExecutor>(
        &self,
        actions: &[Action],
        ctx: &mut ExecutionContext<E>,
    ) -> Result<ExecutionResult, ExecutionError> {
        let token = {
            let mut cancel = self.shared.lock_cancel();
            if self
                .shared
                .running
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                warn!(target: "macrobot::runtime", "Execution requested while another run is active");
                return Err(ExecutionError::AlreadyRunning);
            }
            self.shared.current_index.store(0, Ordering::SeqCst);
            *cancel = CancellationToken::new();
            cancel.clone()
        };
        let _guard = RunGuard(&self.shared.running);

        info!(
            target: "macrobot::runtime",
            actions = actions.len(),
            stop_on_failure = self.options.stop_on_failure,
            "Starting execution"
        );
        self.shared.emit(|| ExecutionEvent::Start {
            total_actions: actions.len(),
        });

        let mut run = Run {
            engine: self,
            token,
            report: ReportBuilder::start(),
            top_len: actions.len(),
        };

        match run.walk(actions, ctx).await {
            Ok(flow) => {
                let result = run.report.snapshot();
                info!(
                    target: "macrobot::runtime",
                    ?flow,
                    success = result.success,
                    completed = result.completed_actions,
                    failed = result.failed_actions,
                    skipped = result.skipped_actions,
                    duration_ms = result.duration.as_millis() as u64,
                    "Execution finished"
                );
                self.shared.emit(|| ExecutionEvent::Complete {
                    result: result.clone(),
                });
                Ok(result)
            }
            Err(message) => {
                let result = run.report.snapshot();
                error!(target: "macrobot::runtime", error = %message, "Execution aborted");
                self.shared.emit(|| ExecutionEvent::Error {
                    error: message.clone(),
                    result: result.clone(),
                });
                Err(ExecutionError::Fault {
                    message,
                    result: Box::new(result),
                })
            }
        }
    }
}

/// How a walk ended when it did not fault.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Flow {
    Finished,
    Stopped,
    Terminated,
}

/// What happens when a sequence runs out of actions.
enum SeqKind<'a> {
    /// Top-level sequence or an `if` branch: done.
    Once,
    /// `loop` body: restart until `count` passes ran.
    Loop { count: u32, iteration: u32 },
    /// `while` body: restart while the condition holds, at most `max` passes.
    While {
        condition: Option<&'a Condition>,
        max: u32,
        iteration: u32,
    },
}

/// One pending sequence on the work stack.
struct SeqFrame<'a> {
    actions: &'a [Action],
    next: usize,
    kind: SeqKind<'a>,
}

impl<'a> SeqFrame<'a> {
    fn once(actions: &'a [Action]) -> Self {
        Self {
            actions,
            next: 0,
            kind: SeqKind::Once,
        }
    }

    /// A repeating body starts "exhausted" so the first pass goes through the same
    /// iteration check as every later one.
    fn repeating(actions: &'a [Action], kind: SeqKind<'a>) -> Self {
        Self {
            actions,
            next: actions.len(),
            kind,
        }
    }
}

/// Per-run state.
struct Run<'e> {
    engine: &'e MacroEngine,
    token: CancellationToken,
    report: ReportBuilder,
    top_len: usize,
}

impl Run<'_> {
    /// Walk the action graph with an explicit stack of sequences. Returns the fault message
    /// on error.
    async fn walk<'a, E: ActionExecutor>(
        &mut self,
        actions: &'a [Action],
        ctx: &mut ExecutionContext<E>,
    ) -> Result<Flow, String> {
        let mut stack = vec![SeqFrame::once(actions)];

        loop {
            let depth = stack.len();
            // Position of the control node owning the top sequence, in its parent.
            let owner = depth
                .checked_sub(2)
                .map_or(0, |parent| stack[parent].next.saturating_sub(1));
            let Some(top) = stack.last_mut() else {
                break;
            };

            if top.next >= top.actions.len() {
                if !matches!(top.kind, SeqKind::Once) && self.stop_requested(owner) {
                    return Ok(Flow::Stopped);
                }
                if !self.repeat(top, ctx).await {
                    stack.pop();
                }
                continue;
            }

            if self.stop_requested(top.next) {
                return Ok(Flow::Stopped);
            }

            let sequence: &'a [Action] = top.actions;
            let index = top.next;
            top.next += 1;
            let action = &sequence[index];
            self.engine
                .shared
                .current_index
                .store(index, Ordering::SeqCst);
            trace!(target: "macrobot::runtime", depth, index, kind = action.kind(), "Dispatching action");

            match action {
                Action::If {
                    condition,
                    then_actions,
                    else_actions,
                } => {
                    let result = evaluate(condition.as_ref(), ctx).await;
                    self.emit(|| ExecutionEvent::ConditionEvaluated {
                        action: "if",
                        condition: describe(condition.as_ref()),
                        result,
                    });
                    let branch = if result {
                        Some(then_actions.as_slice())
                    } else {
                        else_actions.as_deref()
                    };
                    if let Some(branch) = branch {
                        self.enter(depth)?;
                        stack.push(SeqFrame::once(branch));
                    }
                }
                Action::While {
                    condition,
                    actions: body,
                    max_iterations,
                } => {
                    self.enter(depth)?;
                    let max = max_iterations.unwrap_or(self.engine.options.default_max_iterations);
                    stack.push(SeqFrame::repeating(
                        body,
                        SeqKind::While {
                            condition: condition.as_ref(),
                            max,
                            iteration: 0,
                        },
                    ));
                }
                Action::Loop {
                    count,
                    actions: body,
                } => {
                    self.enter(depth)?;
                    stack.push(SeqFrame::repeating(
                        body,
                        SeqKind::Loop {
                            count: *count,
                            iteration: 0,
                        },
                    ));
                }
                Action::Skip { reason } => {
                    self.action_started(index, action, stack[0].next);
                    self.report
                        .record(path(&stack), action.kind(), ActionStatus::Skipped, None);
                    self.emit(|| ExecutionEvent::ActionSkipped {
                        index,
                        action: action.clone(),
                        reason: reason.clone(),
                    });
                }
                Action::Fail { message } => {
                    self.action_started(index, action, stack[0].next);
                    let reason = message
                        .clone()
                        .unwrap_or_else(|| DEFAULT_FAIL_MESSAGE.to_string());
                    self.report.record(
                        path(&stack),
                        action.kind(),
                        ActionStatus::Failed,
                        Some(reason.clone()),
                    );
                    self.emit(|| ExecutionEvent::ActionFailed {
                        index,
                        action: action.clone(),
                        error: reason.clone(),
                    });
                    self.terminate(index, reason);
                    return Ok(Flow::Terminated);
                }
                Action::Test { .. } => {
                    self.action_started(index, action, stack[0].next);
                    self.report
                        .record(path(&stack), action.kind(), ActionStatus::Completed, None);
                    self.emit(|| ExecutionEvent::ActionComplete {
                        index,
                        action: action.clone(),
                    });
                }
                leaf => {
                    self.action_started(index, leaf, stack[0].next);
                    let (executor, mut scope) = ctx.split();
                    let outcome = match executor.execute_action(leaf, &mut scope).await {
                        Ok(outcome) => outcome,
                        Err(err) => {
                            let error = format!("{err:#}");
                            self.report.record(
                                path(&stack),
                                leaf.kind(),
                                ActionStatus::Failed,
                                Some(error.clone()),
                            );
                            let message =
                                format!("Action {index} ({}) raised an error: {error}", leaf.kind());
                            self.emit(|| ExecutionEvent::ActionFailed {
                                index,
                                action: leaf.clone(),
                                error,
                            });
                            return Err(message);
                        }
                    };

                    if outcome.success {
                        self.report
                            .record(path(&stack), leaf.kind(), ActionStatus::Completed, None);
                        self.emit(|| ExecutionEvent::ActionComplete {
                            index,
                            action: leaf.clone(),
                        });
                    } else {
                        let error = outcome
                            .error
                            .clone()
                            .unwrap_or_else(|| "action failed".to_string());
                        warn!(
                            target: "macrobot::runtime",
                            index, kind = leaf.kind(), %error,
                            "Action failed"
                        );
                        self.report.record(
                            path(&stack),
                            leaf.kind(),
                            ActionStatus::Failed,
                            Some(error.clone()),
                        );
                        self.emit(|| ExecutionEvent::ActionFailed {
                            index,
                            action: leaf.clone(),
                            error: error.clone(),
                        });
                        if self.engine.options.stop_on_failure && !outcome.terminate_execution {
                            return Err(format!(
                                "Action {index} ({}) failed: {error}",
                                leaf.kind()
                            ));
                        }
                    }

                    if outcome.terminate_execution {
                        let reason = outcome
                            .error
                            .unwrap_or_else(|| DEFAULT_TERMINATE_MESSAGE.to_string());
                        self.terminate(index, reason);
                        return Ok(Flow::Terminated);
                    }
                    if let Some(jump) = outcome.jump_to {
                        trace!(target: "macrobot::runtime", from = index, to = jump, "Jumping within sequence");
                        if let Some(frame) = stack.last_mut() {
                            frame.next = jump;
                        }
                    }
                }
            }
        }

        Ok(Flow::Finished)
    }

    /// Decide whether an exhausted sequence runs another pass. Returns false when it is done.
    async fn repeat<E: ActionExecutor>(
        &mut self,
        frame: &mut SeqFrame<'_>,
        ctx: &mut ExecutionContext<E>,
    ) -> bool {
        match &mut frame.kind {
            SeqKind::Once => false,
            SeqKind::Loop { count, iteration } => {
                if *iteration >= *count {
                    return false;
                }
                *iteration += 1;
                let (iteration, total) = (*iteration, *count);
                self.emit(|| ExecutionEvent::LoopIteration {
                    action: "loop",
                    iteration,
                    total: Some(total),
                });
                frame.next = 0;
                true
            }
            SeqKind::While {
                condition,
                max,
                iteration,
            } => {
                if *iteration >= *max {
                    warn!(
                        target: "macrobot::runtime",
                        max_iterations = *max,
                        "While loop reached its iteration limit"
                    );
                    return false;
                }
                let condition = *condition;
                let result = evaluate(condition, ctx).await;
                self.emit(|| ExecutionEvent::ConditionEvaluated {
                    action: "while",
                    condition: describe(condition),
                    result,
                });
                if !result {
                    return false;
                }
                *iteration += 1;
                let iteration = *iteration;
                self.emit(|| ExecutionEvent::LoopIteration {
                    action: "while",
                    iteration,
                    total: None,
                });
                frame.next = 0;
                true
            }
        }
    }

    fn stop_requested(&mut self, index: usize) -> bool {
        if !self.token.is_cancelled() {
            return false;
        }
        info!(target: "macrobot::runtime", index, "Execution stopped");
        self.report.mark_stopped();
        self.emit(|| ExecutionEvent::Stopped { index });
        true
    }

    /// Fail if pushing another sequence would exceed the nesting limit.
    fn enter(&self, depth: usize) -> Result<(), String> {
        let max = self.engine.options.max_depth;
        if depth >= max {
            return Err(format!(
                "Maximum action nesting depth ({max}) exceeded (possible runaway scenario)"
            ));
        }
        Ok(())
    }

    fn terminate(&mut self, index: usize, reason: String) {
        info!(target: "macrobot::runtime", index, %reason, "Execution terminated by scenario");
        self.report.mark_terminated(reason.clone());
        self.emit(|| ExecutionEvent::Terminated { index, reason });
    }

    /// `reached` is the 1-based position in the top-level sequence.
    fn action_started(&self, index: usize, action: &Action, reached: usize) {
        let progress = if self.top_len == 0 {
            1.0
        } else {
            reached as f64 / self.top_len as f64
        };
        self.emit(|| ExecutionEvent::ActionStart {
            index,
            action: action.clone(),
            progress,
        });
    }

    fn emit(&self, make: impl FnOnce() -> ExecutionEvent) {
        self.engine.shared.emit(make);
    }
}

/// Indices of the actions currently being executed, from the top-level sequence down.
fn path(stack: &[SeqFrame<'_>]) -> Vec<usize> {
    stack.iter().map(|f| f.next.saturating_sub(1)).collect()
}

fn describe(condition: Option<&Condition>) -> Option<String> {
    condition.and_then(|c| serde_json::to_string(c).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Result, bail};

    use crate::config::MouseButton;
    use crate::executor::actions::ActionOutcome;
    use crate::executor::context::{ActionScope, Template};
    use crate::executor::events::{EventReceiver, event_channel};
    use crate::matching::Frame;
    use crate::sources::{FrameSequence, StaticScreen};

    /// Records every dispatched leaf. `input` texts drive the outcome:
    /// `fail`, `terminate`, `raise` and `jump:<n>`.
    #[derive(Default)]
    struct Scripted {
        visited: Vec<String>,
        /// Request a stop once this many leaves ran.
        stop: Option<(StopHandle, usize)>,
    }

    impl ActionExecutor for Scripted {
        async fn execute_action(
            &mut self,
            action: &Action,
            _scope: &mut ActionScope<'_>,
        ) -> Result<ActionOutcome> {
            tokio::task::yield_now().await;
            let label = match action {
                Action::Click { x, y, .. } => format!("click {x},{y}"),
                Action::Wait { ms, .. } => format!("wait {ms}"),
                Action::Input { text } => format!("input {text}"),
                other => other.kind().to_string(),
            };
            self.visited.push(label);
            if let Some((handle, after)) = &self.stop {
                if self.visited.len() == *after {
                    handle.stop();
                }
            }

            let outcome = match action {
                Action::Input { text } => match text.as_str() {
                    "fail" => ActionOutcome::failed("field not found"),
                    "terminate" => ActionOutcome::failed("session lost").terminate(),
                    "raise" => bail!("device disconnected"),
                    other => match other.strip_prefix("jump:") {
                        Some(n) => ActionOutcome::ok().jump_to(n.parse()?),
                        None => ActionOutcome::ok(),
                    },
                },
                _ => ActionOutcome::ok(),
            };
            Ok(outcome)
        }
    }

    fn tap(x: i32) -> Action {
        Action::Click {
            x,
            y: 0,
            button: MouseButton::Left,
            count: None,
        }
    }

    fn wait(ms: u64) -> Action {
        Action::Wait { ms, max_ms: None }
    }

    fn input(text: &str) -> Action {
        Action::Input { text: text.into() }
    }

    fn repeat(count: u32, actions: Vec<Action>) -> Action {
        Action::Loop { count, actions }
    }

    fn always(then_actions: Vec<Action>) -> Action {
        Action::If {
            condition: None,
            then_actions,
            else_actions: None,
        }
    }

    fn engine() -> (MacroEngine, EventReceiver) {
        let (tx, rx) = event_channel();
        (MacroEngine::new(ExecutionOptions::default()).with_events(tx), rx)
    }

    fn drain(rx: &mut EventReceiver) -> Vec<ExecutionEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    fn names(events: &[ExecutionEvent]) -> Vec<&'static str> {
        events.iter().map(ExecutionEvent::name).collect()
    }

    fn scene() -> Frame {
        Frame::from_fn(40, 30, |x, y| {
            if (12..20).contains(&x) && (10..16).contains(&y) {
                ((x * 13) ^ (y * 29)) as u8
            } else {
                70
            }
        })
        .unwrap()
    }

    fn blank() -> Frame {
        Frame::from_fn(40, 30, |_, _| 70).unwrap()
    }

    fn widget() -> Template {
        Template::new(scene().crop(10, 8, 12, 10).unwrap()).with_crop_location(10, 8)
    }

    #[tokio::test]
    async fn loop_runs_body_count_times() {
        let (engine, mut rx) = engine();
        let mut ctx = ExecutionContext::new(Scripted::default());

        let result = engine
            .execute(&[repeat(3, vec![tap(5)])], &mut ctx)
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.completed_actions, 3);
        assert_eq!(ctx.executor.visited, vec!["click 5,0"; 3]);
        assert_eq!(result.outcomes[2].path, vec![0, 0]);

        let events = drain(&mut rx);
        let iterations: Vec<u32> = events
            .iter()
            .filter_map(|ev| match ev {
                ExecutionEvent::LoopIteration {
                    iteration, total, ..
                } => {
                    assert_eq!(*total, Some(3));
                    Some(*iteration)
                }
                _ => None,
            })
            .collect();
        assert_eq!(iterations, vec![1, 2, 3]);
        assert_eq!(names(&events).first(), Some(&"execution:start"));
        assert_eq!(names(&events).last(), Some(&"execution:complete"));
    }

    #[tokio::test]
    async fn unmatched_image_takes_else_branch() {
        let (engine, mut rx) = engine();
        let mut ctx = ExecutionContext::new(Scripted::default())
            .with_screen(StaticScreen::new(blank()))
            .with_template("widget", widget());
        let scenario = vec![Action::If {
            condition: Some(Condition::image_match("widget")),
            then_actions: vec![Action::Fail { message: None }],
            else_actions: Some(vec![tap(1)]),
        }];

        let result = engine.execute(&scenario, &mut ctx).await.unwrap();

        assert!(result.success);
        assert_eq!(result.completed_actions, 1);
        assert_eq!(result.failed_actions, 0);
        assert_eq!(ctx.executor.visited, vec!["click 1,0"]);

        let events = drain(&mut rx);
        assert!(events.iter().any(|ev| matches!(
            ev,
            ExecutionEvent::ConditionEvaluated { action: "if", result: false, condition: Some(_) }
        )));
    }

    #[tokio::test]
    async fn false_if_without_else_does_nothing() {
        let (engine, mut rx) = engine();
        let mut ctx = ExecutionContext::new(Scripted::default())
            .with_screen(StaticScreen::new(blank()))
            .with_template("widget", widget());
        let scenario = vec![Action::If {
            condition: Some(Condition::image_match("widget")),
            then_actions: vec![tap(1)],
            else_actions: None,
        }];

        let result = engine.execute(&scenario, &mut ctx).await.unwrap();

        assert!(result.success);
        assert_eq!(result.visited_actions(), 0);
        assert_eq!(
            names(&drain(&mut rx)),
            vec![
                "execution:start",
                "execution:condition-evaluated",
                "execution:complete"
            ]
        );
    }

    #[tokio::test]
    async fn fail_terminates_the_run() {
        let (engine, mut rx) = engine();
        let mut ctx = ExecutionContext::new(Scripted::default());
        let scenario = vec![
            Action::Fail {
                message: Some("x".into()),
            },
            tap(1),
        ];

        let result = engine.execute(&scenario, &mut ctx).await.unwrap();

        assert!(!result.success);
        assert_eq!(result.termination_reason.as_deref(), Some("x"));
        assert_eq!(result.failed_actions, 1);
        assert!(ctx.executor.visited.is_empty());

        let events = drain(&mut rx);
        assert_eq!(
            names(&events),
            vec![
                "execution:start",
                "execution:action-start",
                "execution:action-failed",
                "execution:terminated",
                "execution:complete"
            ]
        );
        match &events[1] {
            ExecutionEvent::ActionStart {
                index, progress, ..
            } => {
                assert_eq!(*index, 0);
                assert!((progress - 0.5).abs() < 1e-9);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn fail_without_message_uses_default_reason() {
        let (engine, _rx) = engine();
        let mut ctx = ExecutionContext::new(Scripted::default());
        let result = engine
            .execute(&[always(vec![Action::Fail { message: None }])], &mut ctx)
            .await
            .unwrap();
        assert_eq!(result.termination_reason.as_deref(), Some("Test failed"));
    }

    #[tokio::test]
    async fn stop_halts_before_next_action() {
        let (engine, mut rx) = engine();
        let mut ctx = ExecutionContext::new(Scripted {
            visited: Vec::new(),
            stop: Some((engine.stop_handle(), 1)),
        });

        let result = engine
            .execute(&[wait(10), wait(20), wait(30)], &mut ctx)
            .await
            .unwrap();

        assert!(result.success);
        assert!(result.stopped);
        assert_eq!(result.completed_actions, 1);
        assert_eq!(ctx.executor.visited, vec!["wait 10"]);
        assert_eq!(
            names(&drain(&mut rx)),
            vec![
                "execution:start",
                "execution:action-start",
                "execution:stop-requested",
                "execution:action-complete",
                "execution:stopped",
                "execution:complete"
            ]
        );
    }

    #[tokio::test]
    async fn stop_at_end_of_loop_body_reports_the_loop() {
        let (engine, mut rx) = engine();
        let mut ctx = ExecutionContext::new(Scripted {
            visited: Vec::new(),
            stop: Some((engine.stop_handle(), 1)),
        });
        let scenario = vec![Action::Test { name: None }, repeat(3, vec![tap(1)]), tap(2)];

        let result = engine.execute(&scenario, &mut ctx).await.unwrap();

        assert!(result.stopped);
        assert_eq!(result.completed_actions, 2);
        let stopped: Vec<usize> = drain(&mut rx)
            .iter()
            .filter_map(|ev| match ev {
                ExecutionEvent::Stopped { index } => Some(*index),
                _ => None,
            })
            .collect();
        assert_eq!(stopped, vec![1]);
    }

    #[tokio::test]
    async fn stop_issued_as_the_run_starts_is_honoured() {
        let (engine, _rx) = engine();
        let handle = engine.stop_handle();
        let mut ctx = ExecutionContext::new(Scripted::default());
        let actions = vec![tap(1), tap(2), tap(3)];

        // The run is polled first, so it is already published when the stop lands.
        let (result, ()) = tokio::join!(engine.execute(&actions, &mut ctx), async {
            handle.stop()
        });

        let result = result.unwrap();
        assert!(result.stopped);
        assert_eq!(ctx.executor.visited, vec!["click 1,0"]);

        // The next run gets a fresh token and a stop inside it still applies.
        let mut again = ExecutionContext::new(Scripted {
            visited: Vec::new(),
            stop: Some((engine.stop_handle(), 2)),
        });
        let second = engine.execute(&actions, &mut again).await.unwrap();
        assert!(second.stopped);
        assert_eq!(second.completed_actions, 2);
    }

    #[tokio::test]
    async fn stop_outside_a_run_does_not_leak_into_the_next() {
        let (engine, _rx) = engine();
        engine.stop();
        let mut ctx = ExecutionContext::new(Scripted::default());
        let result = engine.execute(&[tap(1), tap(2)], &mut ctx).await.unwrap();
        assert!(!result.stopped);
        assert_eq!(result.completed_actions, 2);
    }

    #[tokio::test]
    async fn while_is_bounded_by_max_iterations() {
        let (engine, mut rx) = engine();
        let mut ctx = ExecutionContext::new(Scripted::default());
        let scenario = vec![Action::While {
            condition: None,
            actions: vec![tap(1)],
            max_iterations: Some(5),
        }];

        let result = engine.execute(&scenario, &mut ctx).await.unwrap();

        assert_eq!(result.completed_actions, 5);
        let events = drain(&mut rx);
        let checks = events
            .iter()
            .filter(|ev| matches!(ev, ExecutionEvent::ConditionEvaluated { action: "while", .. }))
            .count();
        assert_eq!(checks, 5);
    }

    #[tokio::test]
    async fn while_falls_back_to_default_bound() {
        let options = ExecutionOptions {
            default_max_iterations: 7,
            ..ExecutionOptions::default()
        };
        let engine = MacroEngine::new(options);
        let mut ctx = ExecutionContext::new(Scripted::default());
        let scenario = vec![Action::While {
            condition: None,
            actions: vec![tap(1)],
            max_iterations: None,
        }];
        let result = engine.execute(&scenario, &mut ctx).await.unwrap();
        assert_eq!(result.completed_actions, 7);
    }

    #[tokio::test]
    async fn while_stops_when_condition_turns_false() {
        let (engine, _rx) = engine();
        let mut ctx = ExecutionContext::new(Scripted::default())
            .with_screen(FrameSequence::new(vec![scene(), scene(), blank()]))
            .with_template("widget", widget());
        let scenario = vec![Action::While {
            condition: Some(Condition::image_match("widget")),
            actions: vec![tap(1)],
            max_iterations: Some(10),
        }];

        let result = engine.execute(&scenario, &mut ctx).await.unwrap();

        assert!(result.success);
        assert_eq!(result.completed_actions, 2);
    }

    #[tokio::test]
    async fn counters_match_visited_leaves() {
        let (engine, _rx) = engine();
        let mut ctx = ExecutionContext::new(Scripted::default());
        let scenario = vec![
            Action::Skip {
                reason: Some("flaky".into()),
            },
            Action::Test { name: None },
            input("fail"),
            always(vec![Action::Skip { reason: None }, tap(2)]),
            repeat(0, vec![tap(3)]),
        ];

        let result = engine.execute(&scenario, &mut ctx).await.unwrap();

        assert!(!result.success);
        assert!(result.termination_reason.is_none());
        assert_eq!(result.completed_actions, 2);
        assert_eq!(result.failed_actions, 1);
        assert_eq!(result.skipped_actions, 2);
        assert_eq!(result.visited_actions(), result.outcomes.len());
        assert_eq!(result.outcomes[3].path, vec![3, 0]);
        assert_eq!(ctx.executor.visited, vec!["input fail", "click 2,0"]);
    }

    #[tokio::test]
    async fn jump_stays_within_current_sequence() {
        let (engine, _rx) = engine();
        let mut ctx = ExecutionContext::new(Scripted::default());
        let scenario = vec![
            repeat(1, vec![input("jump:2"), tap(1), tap(2)]),
            always(vec![input("jump:99"), tap(3)]),
            tap(4),
        ];

        let result = engine.execute(&scenario, &mut ctx).await.unwrap();

        assert!(result.success);
        assert_eq!(
            ctx.executor.visited,
            vec!["input jump:2", "click 2,0", "input jump:99", "click 4,0"]
        );
    }

    #[tokio::test]
    async fn terminating_leaf_halts_nested_run() {
        let (engine, mut rx) = engine();
        let mut ctx = ExecutionContext::new(Scripted::default());
        let scenario = vec![repeat(2, vec![input("terminate"), tap(1)]), tap(2)];

        let result = engine.execute(&scenario, &mut ctx).await.unwrap();

        assert!(!result.success);
        assert_eq!(result.termination_reason.as_deref(), Some("session lost"));
        assert_eq!(ctx.executor.visited, vec!["input terminate"]);
        let events = drain(&mut rx);
        assert!(names(&events).contains(&"execution:terminated"));
        assert!(events.last().is_some_and(ExecutionEvent::is_final));
    }

    #[tokio::test]
    async fn stop_on_failure_faults() {
        let (tx, mut rx) = event_channel();
        let options = ExecutionOptions {
            stop_on_failure: true,
            ..ExecutionOptions::default()
        };
        let engine = MacroEngine::new(options).with_events(tx);
        let mut ctx = ExecutionContext::new(Scripted::default());

        let err = engine
            .execute(&[tap(1), input("fail"), tap(2)], &mut ctx)
            .await
            .unwrap_err();

        let partial = err.partial_result().unwrap();
        assert_eq!(partial.completed_actions, 1);
        assert_eq!(partial.failed_actions, 1);
        assert_eq!(ctx.executor.visited, vec!["click 1,0", "input fail"]);
        assert_eq!(
            names(&drain(&mut rx)).last(),
            Some(&"execution:error")
        );
        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn executor_error_faults() {
        let (engine, mut rx) = engine();
        let mut ctx = ExecutionContext::new(Scripted::default());

        let err = engine
            .execute(&[tap(1), input("raise"), tap(2)], &mut ctx)
            .await
            .unwrap_err();

        match &err {
            ExecutionError::Fault { message, result } => {
                assert!(message.contains("device disconnected"));
                assert_eq!(result.completed_actions, 1);
                assert_eq!(result.failed_actions, 1);
            }
            other => panic!("unexpected error {other:?}"),
        }
        let events = drain(&mut rx);
        let names = names(&events);
        assert!(!names.contains(&"execution:complete"));
        assert_eq!(
            names[names.len() - 2..],
            ["execution:action-failed", "execution:error"]
        );
        match &events[events.len() - 2] {
            ExecutionEvent::ActionFailed { index, error, .. } => {
                assert_eq!(*index, 1);
                assert!(error.contains("device disconnected"));
            }
            other => panic!("unexpected event {other:?}"),
        }

        // The engine is usable again.
        let again = engine.execute(&[tap(3)], &mut ctx).await.unwrap();
        assert!(again.success);
    }

    #[tokio::test]
    async fn nesting_beyond_max_depth_faults() {
        let options = ExecutionOptions {
            max_depth: 2,
            ..ExecutionOptions::default()
        };
        let engine = MacroEngine::new(options);
        let mut ctx = ExecutionContext::new(Scripted::default());
        let scenario = vec![repeat(1, vec![repeat(1, vec![repeat(1, vec![tap(1)])])])];

        let err = engine.execute(&scenario, &mut ctx).await.unwrap_err();

        assert!(err.to_string().contains("nesting depth"));
        assert!(ctx.executor.visited.is_empty());
    }

    #[tokio::test]
    async fn concurrent_execute_is_rejected() {
        let engine = MacroEngine::new(ExecutionOptions::default());
        let actions = vec![tap(1)];
        let mut first = ExecutionContext::new(Scripted::default());
        let mut second = ExecutionContext::new(Scripted::default());

        let (a, b) = tokio::join!(
            engine.execute(&actions, &mut first),
            engine.execute(&actions, &mut second)
        );

        assert!(a.unwrap().success);
        assert!(matches!(b, Err(ExecutionError::AlreadyRunning)));
        assert!(second.executor.visited.is_empty());
        assert!(!engine.is_running());
    }
}

#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

/*!
Executor module for macrobot.

This module wires together:
- `actions`: the `ActionExecutor` seam and the enigo-backed `DesktopExecutor`
- `condition`: evaluation of `if`/`while` conditions (image match, probes)
- `context`: screen, matcher and template library a run works against
- `events`: life-cycle events streamed while a scenario runs
- `report`: counters and the final `ExecutionResult`
- `runtime`: `MacroEngine`, which walks the action graph

Typical usage:
- Load a `ScenarioConfig` and its templates.
- Build an `ExecutionContext` around an executor and a screen source.
- Call `MacroEngine::execute`, optionally keeping a `StopHandle` for cancellation.

Example:
```no_run
use macrobot::config::ExecutionOptions;
use macrobot::executor::{DesktopExecutor, ExecutionContext, MacroEngine, event_channel};

# async fn run(actions: Vec<macrobot::config::Action>) -> anyhow::Result<()> {
let (tx, mut rx) = event_channel();
let engine = MacroEngine::new(ExecutionOptions::default()).with_events(tx);
let mut ctx = ExecutionContext::new(DesktopExecutor::new(true)); // dry-run mode
tokio::spawn(async move {
    while let Some(ev) = rx.recv().await {
        println!("{}", ev.name());
    }
});
let result = engine.execute(&actions, &mut ctx).await?;
println!("success: {}", result.success);
# Ok(())
# }
```
*/

pub mod actions;
pub mod condition;
pub mod context;
pub mod events;
pub mod report;
pub mod runtime;

// Re-exports for convenient access from `macrobot::executor::*`
pub use actions::{
    ActionExecutor, ActionOutcome, DesktopExecutor, ImageMatchReading, ProbeReading,
    match_in_scope,
};
pub use context::{ActionScope, ExecutionContext, Template, TemplateLibrary};
pub use events::{EventReceiver, EventSender, ExecutionEvent, event_channel};
pub use report::{ActionRecord, ActionStatus, ExecutionError, ExecutionResult};
pub use runtime::{MacroEngine, StopHandle};

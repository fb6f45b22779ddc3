use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{debug, error, info, warn};

use macrobot::config as cfg;
use macrobot::executor::{
    DesktopExecutor, EventReceiver, ExecutionContext, ExecutionError, ExecutionEvent,
    ExecutionResult, MacroEngine, event_channel,
};
use macrobot::matching::{LocationCache, TemplateMatcher};
use macrobot::sources::FileScreen;

/// Exit status used when the engine faulted rather than the scenario failing.
const FAULT_EXIT: u8 = 2;

/// macrobot CLI
#[derive(Debug, Parser)]
#[command(
    name = macrobot::PKG_NAME,
    version = macrobot::PKG_VERSION,
    about = "Run a device-automation scenario with image-driven conditions"
)]
struct Args {
    /// Path to the JSON scenario file
    #[arg(short = 's', long = "scenario", required_unless_present = "print_schema")]
    scenario: Option<PathBuf>,

    /// Enable dry-run mode (log actions instead of simulating input)
    #[arg(long = "dry-run")]
    dry_run: bool,

    /// Abort on the first failed action (overrides the scenario's option)
    #[arg(long = "stop-on-failure")]
    stop_on_failure: bool,

    /// PNG file re-read on every capture, kept up to date by an external screenshot tool
    #[arg(long = "screen")]
    screen: Option<PathBuf>,

    /// Set log level (e.g., trace, debug, info, warn, error). Overrides RUST_LOG.
    #[arg(long = "log-level")]
    log_level: Option<String>,

    /// Print the JSON Schema for scenario files and exit
    #[arg(long = "print-schema")]
    print_schema: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();
    macrobot::init_tracing(args.log_level.as_deref());

    if args.print_schema {
        let schema = cfg::generate_schema();
        let json = serde_json::to_string_pretty(&schema)?;
        println!("{json}");
        return Ok(ExitCode::SUCCESS);
    }

    let scenario_path = args
        .scenario
        .clone()
        .context("--scenario is required")?;
    info!(
        version = macrobot::PKG_VERSION,
        scenario = %scenario_path.display(),
        dry_run = args.dry_run,
        "Starting macrobot"
    );

    let mut config = cfg::load_from_path_async(&scenario_path).await?;
    if args.stop_on_failure {
        config.options.stop_on_failure = true;
    }
    let base_dir = scenario_path.parent().unwrap_or(Path::new("."));
    let templates = cfg::load_templates(&config, base_dir)?;
    debug!(
        target: "macrobot",
        name = config.name.as_deref().unwrap_or("<unnamed>"),
        actions = config.actions.len(),
        templates = templates.len(),
        "Scenario loaded successfully"
    );

    let matcher = TemplateMatcher::with_cache(LocationCache::new(
        config.matcher.cache_capacity,
        Duration::from_millis(config.matcher.cache_ttl_ms),
    ));
    let mut ctx = ExecutionContext::new(DesktopExecutor::new(args.dry_run))
        .with_matcher(matcher)
        .with_templates(templates)
        .with_device(config.device.clone());
    match &args.screen {
        Some(path) => ctx = ctx.with_screen(FileScreen::new(path)),
        None => warn!("No --screen given; image conditions will evaluate to false"),
    }

    let (tx, rx) = event_channel();
    let engine = MacroEngine::new(config.options.clone()).with_events(tx);
    let logger = tokio::spawn(log_events(rx));

    let stop = engine.stop_handle();
    let signal = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, stopping after the current action");
            stop.stop();
        }
    });

    let outcome = engine.execute(&config.actions, &mut ctx).await;

    signal.abort();
    // Dropping the engine closes the event channel so the logger drains and exits.
    drop(engine);
    let _ = logger.await;

    match outcome {
        Ok(result) => {
            print_result(&result)?;
            info!("macrobot exited");
            Ok(if result.success {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Err(ExecutionError::Fault { message, result }) => {
            print_result(&result)?;
            error!(error = %message, "Scenario aborted");
            Ok(ExitCode::from(FAULT_EXIT))
        }
        Err(err) => Err(err.into()),
    }
}

fn print_result(result: &ExecutionResult) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(result).context("Failed to serialize result")?;
    println!("{json}");
    Ok(())
}

/// Mirror engine events into the log.
async fn log_events(mut rx: EventReceiver) {
    while let Some(event) = rx.recv().await {
        match &event {
            ExecutionEvent::ActionFailed {
                index,
                action,
                error,
            } => warn!(target: "macrobot", index, kind = action.kind(), %error, "{}", event.name()),
            ExecutionEvent::Terminated { index, reason } => {
                warn!(target: "macrobot", index, %reason, "{}", event.name())
            }
            ExecutionEvent::Error { error, .. } => {
                error!(target: "macrobot", %error, "{}", event.name())
            }
            ExecutionEvent::Complete { result } => info!(
                target: "macrobot",
                success = result.success,
                completed = result.completed_actions,
                failed = result.failed_actions,
                skipped = result.skipped_actions,
                stopped = result.stopped,
                "{}", event.name()
            ),
            other => debug!(
                target: "macrobot",
                payload = %serde_json::to_string(other).unwrap_or_default(),
                "{}", other.name()
            ),
        }
    }
}

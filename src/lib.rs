#![forbid(unsafe_code)]
#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

//! macrobot runs declarative device-automation scenarios: sequences of taps, waits and
//! text input, steered by `if`/`while`/`loop` nodes whose conditions look at the screen.
//!
//! The codebase is organized into cohesive modules:
//! - `config`: Scenario models, loader, validation and schema helpers.
//! - `executor`: The macro engine, condition evaluator and action executors.
//! - `matching`: Grayscale template matching with a location cache.
//! - `sources`: Screen sources the engine captures frames from.
//!
//! Use `macrobot::prelude::*` to bring commonly used items into scope quickly.

/// Public module: configuration (models, loader, schema helpers).
pub mod config;
/// Public module: execution engine (runtime, conditions, actions, events).
pub mod executor;
/// Public module: template matching (frames, scoring, cache, search).
pub mod matching;
/// Public module: screen sources (static, sequence, file).
pub mod sources;

/// Crate-level constants for consumers that want to inspect package metadata at runtime.
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
pub const PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Returns the crate version (e.g., "0.1.0").
#[inline]
pub const fn version() -> &'static str {
    PKG_VERSION
}

/// Parse a level name (trace|debug|info|warn|error).
pub fn parse_level(name: &str) -> Option<tracing::Level> {
    use tracing::Level;

    match name.to_lowercase().as_str() {
        "trace" => Some(Level::TRACE),
        "debug" => Some(Level::DEBUG),
        "info" => Some(Level::INFO),
        "warn" | "warning" => Some(Level::WARN),
        "error" => Some(Level::ERROR),
        _ => None,
    }
}

/// Initialize tracing (logging).
/// - `level` wins when given.
/// - Otherwise honors the `RUST_LOG` environment variable if set.
/// - Falls back to `info` level.
///
/// Logs go to stderr so stdout stays free for the JSON report.
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init_tracing(level: Option<&str>) {
    use tracing::Level;
    use tracing_subscriber::fmt;

    let level = level
        .map(str::to_owned)
        .or_else(|| std::env::var("RUST_LOG").ok())
        .and_then(|s| parse_level(&s))
        .unwrap_or(Level::INFO);

    // Ignore the error if the global subscriber was already set.
    let _ = fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .try_init();
}

/// A convenient set of exports for most consumers.
///
/// Bring this into scope with:
/// `use macrobot::prelude::*;`
pub mod prelude {
    // Common result/error handling
    pub use anyhow::{Context, Error, Result, anyhow, bail, ensure};

    // Serialization
    pub use serde::{Deserialize, Serialize};

    // Tracing macros
    pub use tracing::{debug, error, info, instrument, trace, warn};

    // Timing helpers
    pub use std::time::Duration;
    pub use tokio::time::sleep;

    // External crates (namespaced) if callers want direct access
    pub use crate as macrobot;
    pub use enigo;
    pub use rand;

    // Frequently used items
    pub use crate::config::{Action, Condition, ScenarioConfig};
    pub use crate::executor::{
        ActionExecutor, ExecutionContext, ExecutionEvent, ExecutionResult, MacroEngine,
    };
    pub use crate::matching::{Frame, MatchOptions, TemplateMatcher};
    pub use crate::sources::ScreenSource;
    pub use crate::{config, executor, matching, sources};
}

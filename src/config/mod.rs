//! Scenario configuration for macrobot.
//!
//! This module wires together the data models (actions, conditions, options) and the
//! loading/validation helpers used throughout the crate.
//!
//! Example:
//! use macrobot::config::{ScenarioConfig, load_from_path};
//!
//! let cfg = load_from_path("scenarios/login.json")?;

pub mod loader;
pub mod models;

// Re-export core data models
pub use models::{
    Action, CompareOp, Condition, ConditionKind, ExecutionOptions, ImageMatchParams, LogLevel,
    MatcherConfig, MouseButton, ScenarioConfig, SoundCheckParams, SystemInfoParams, SystemProbe,
    TemplateDef, TemplateDefs,
};

// Re-export loader utilities
pub use loader::{
    generate_schema, load_from_path, load_from_path_async, load_from_reader, load_from_str,
    load_templates, validate_scenario, write_schema_to_writer,
};

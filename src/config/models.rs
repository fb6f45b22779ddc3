use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::matching::Point;

/// Default bound on `while` iterations when a node does not set `maxIterations`.
pub const DEFAULT_MAX_ITERATIONS: u32 = 100;
/// Default bound on control-node nesting.
pub const DEFAULT_MAX_DEPTH: usize = 64;

/// Root of a scenario file.
///
/// A scenario bundles everything the CLI needs to run one action graph:
/// - the ordered `actions`
/// - the `templates` referenced by image-match actions and conditions
/// - engine `options` and `matcher` tuning
/// - an opaque `device` value handed to the executor untouched
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioConfig {
    /// Human-readable scenario name (used in logs).
    #[serde(default)]
    pub name: Option<String>,

    /// The action graph, executed top to bottom.
    #[serde(default)]
    pub actions: Vec<Action>,

    /// Template images by name. Paths are resolved relative to the scenario file.
    #[serde(default)]
    pub templates: TemplateDefs,

    #[serde(default)]
    pub options: ExecutionOptions,

    #[serde(default)]
    pub matcher: MatcherConfig,

    /// Device handle/settings passed through to the executor.
    #[serde(default)]
    pub device: serde_json::Value,
}

pub type TemplateDefs = BTreeMap<String, TemplateDef>;

/// A template image on disk.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TemplateDef {
    /// PNG file holding the template.
    pub path: String,
    /// Where the template was cut from the original screenshot; used as the default search hint.
    #[serde(default)]
    pub crop_location: Option<Point>,
}

/// Engine behaviour switches.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutionOptions {
    /// Abort the run on the first failed leaf action.
    pub stop_on_failure: bool,
    /// Maximum nesting of control nodes.
    pub max_depth: usize,
    /// Iteration bound for `while` nodes without an explicit `maxIterations`.
    pub default_max_iterations: u32,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            stop_on_failure: false,
            max_depth: DEFAULT_MAX_DEPTH,
            default_max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }
}

/// Location cache tuning for the scenario's matcher.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct MatcherConfig {
    pub cache_capacity: usize,
    pub cache_ttl_ms: u64,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            cache_capacity: crate::matching::cache::DEFAULT_CACHE_CAPACITY,
            cache_ttl_ms: crate::matching::cache::DEFAULT_CACHE_TTL.as_millis() as u64,
        }
    }
}

/// One step of a scenario.
///
/// Actions come in three flavours:
/// - control nodes (`if`, `while`, `loop`) that own nested sequences
/// - testing leaves (`skip`, `fail`, `test`) handled by the engine itself
/// - regular leaves, forwarded to the action executor
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum Action {
    // --- Control ---
    /// Run `thenActions` if the condition holds, otherwise `elseActions` (if any).
    If {
        /// Absent condition means "always".
        #[serde(default)]
        condition: Option<Condition>,
        #[serde(default)]
        then_actions: Vec<Action>,
        #[serde(default)]
        else_actions: Option<Vec<Action>>,
    },

    /// Run `actions` while the condition holds, at most `maxIterations` times.
    While {
        #[serde(default)]
        condition: Option<Condition>,
        #[serde(default)]
        actions: Vec<Action>,
        #[serde(default)]
        max_iterations: Option<u32>,
    },

    /// Run `actions` exactly `count` times.
    Loop {
        count: u32,
        #[serde(default)]
        actions: Vec<Action>,
    },

    // --- Testing ---
    /// Occupy a slot without doing anything; counted as skipped.
    Skip {
        #[serde(default)]
        reason: Option<String>,
    },

    /// Terminate the whole run as failed.
    Fail {
        #[serde(default)]
        message: Option<String>,
    },

    /// Assertion placeholder; always succeeds.
    Test {
        #[serde(default)]
        name: Option<String>,
    },

    // --- Input ---
    /// Tap/click at a screen position.
    #[serde(alias = "tap")]
    Click {
        x: i32,
        y: i32,
        #[serde(default)]
        button: MouseButton,
        /// Number of clicks (default: 1).
        #[serde(default)]
        count: Option<u8>,
    },

    /// Press at one position, move, release at another.
    Drag {
        from_x: i32,
        from_y: i32,
        to_x: i32,
        to_y: i32,
        #[serde(default)]
        duration_ms: Option<u64>,
    },

    /// Type literal text.
    Input { text: String },

    /// Send a key sequence (e.g. "{ENTER}").
    Key { text: String },

    // --- Timing ---
    /// Sleep for `ms`, or a random duration in `[ms, maxMs]` when `maxMs` is set.
    Wait {
        ms: u64,
        #[serde(default)]
        max_ms: Option<u64>,
    },

    // --- Logging ---
    Log { level: LogLevel, message: String },

    // --- Probes ---
    /// Sample the audio level and check it.
    SoundCheck(SoundCheckParams),

    /// Assert that a template is visible on screen.
    ImageMatch(ImageMatchParams),
}

impl Action {
    /// The `type` tag of this action.
    pub fn kind(&self) -> &'static str {
        match self {
            Action::If { .. } => "if",
            Action::While { .. } => "while",
            Action::Loop { .. } => "loop",
            Action::Skip { .. } => "skip",
            Action::Fail { .. } => "fail",
            Action::Test { .. } => "test",
            Action::Click { .. } => "click",
            Action::Drag { .. } => "drag",
            Action::Input { .. } => "input",
            Action::Key { .. } => "key",
            Action::Wait { .. } => "wait",
            Action::Log { .. } => "log",
            Action::SoundCheck(_) => "sound-check",
            Action::ImageMatch(_) => "image-match",
        }
    }

    /// Control nodes own nested sequences and are not counted as visited leaves.
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            Action::If { .. } | Action::While { .. } | Action::Loop { .. }
        )
    }
}

/// Parameters shared by the `image-match` action and condition.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageMatchParams {
    /// Name of a template in the scenario's template library.
    pub template: String,
    /// Minimum score (default 0.95).
    #[serde(default)]
    pub threshold: Option<f64>,
    /// Overrides the template's own crop location.
    #[serde(default)]
    pub crop_location: Option<Point>,
    #[serde(default)]
    pub color_invariant: bool,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub use_cache: Option<bool>,
}

impl ImageMatchParams {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            threshold: None,
            crop_location: None,
            color_invariant: false,
            timeout_ms: None,
            use_cache: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SoundCheckParams {
    /// Minimum average level for the check to pass.
    #[serde(default)]
    pub min_level: Option<f64>,
    /// Sampling window.
    #[serde(default)]
    pub duration_ms: Option<u64>,
}

/// Host/device properties a condition can read.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SystemProbe {
    CursorX,
    CursorY,
    ScreenWidth,
    ScreenHeight,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct SystemInfoParams {
    pub probe: SystemProbe,
}

/// What a condition measures.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ConditionKind {
    ImageMatch(ImageMatchParams),
    SoundCheck(SoundCheckParams),
    SystemInfo(SystemInfoParams),
}

/// Boolean probe consumed by `if` and `while`.
///
/// The measured scalar (match score, sound level, probe value) is compared with
/// `value` using `operator`. Without an explicit comparison, image matches test
/// `score >= threshold` and other probes use their own success flag.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct Condition {
    #[serde(flatten)]
    pub kind: ConditionKind,
    #[serde(default)]
    pub operator: Option<CompareOp>,
    #[serde(default)]
    pub value: Option<f64>,
}

impl Condition {
    pub fn new(kind: ConditionKind) -> Self {
        Self {
            kind,
            operator: None,
            value: None,
        }
    }

    pub fn image_match(template: impl Into<String>) -> Self {
        Self::new(ConditionKind::ImageMatch(ImageMatchParams::new(template)))
    }

    pub fn compare(mut self, operator: CompareOp, value: f64) -> Self {
        self.operator = Some(operator);
        self.value = Some(value);
        self
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            ConditionKind::ImageMatch(_) => "image-match",
            ConditionKind::SoundCheck(_) => "sound-check",
            ConditionKind::SystemInfo(_) => "system-info",
        }
    }
}

/// Comparison applied to a condition's measured scalar.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum CompareOp {
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Lte,
    #[serde(rename = "!=")]
    Ne,
}

impl CompareOp {
    /// Tolerance used by `==` and `!=`.
    pub const EPSILON: f64 = 1e-9;

    pub fn apply(self, lhs: f64, rhs: f64) -> bool {
        match self {
            CompareOp::Gte => lhs >= rhs,
            CompareOp::Gt => lhs > rhs,
            CompareOp::Eq => (lhs - rhs).abs() <= Self::EPSILON,
            CompareOp::Lt => lhs < rhs,
            CompareOp::Lte => lhs <= rhs,
            CompareOp::Ne => (lhs - rhs).abs() > Self::EPSILON,
        }
    }
}

/// Mouse button enumeration.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MouseButton {
    #[default]
    Left,
    Middle,
    Right,
}

/// Logging level enumeration.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_nested_control_actions() {
        let raw = json!([
            {"type": "loop", "count": 3, "actions": [{"type": "tap", "x": 1, "y": 1}]},
            {"type": "if",
             "condition": {"type": "image-match", "template": "ok_button", "threshold": 0.9},
             "thenActions": [{"type": "fail", "message": "should not be visible"}],
             "elseActions": [{"type": "click", "x": 5, "y": 5}]},
            {"type": "while", "maxIterations": 4, "actions": [{"type": "wait", "ms": 10}]}
        ]);
        let actions: Vec<Action> = serde_json::from_value(raw).unwrap();

        assert_eq!(actions.len(), 3);
        match &actions[0] {
            Action::Loop { count, actions } => {
                assert_eq!(*count, 3);
                assert!(matches!(actions[0], Action::Click { x: 1, y: 1, .. }));
            }
            other => panic!("unexpected {other:?}"),
        }
        match &actions[1] {
            Action::If {
                condition: Some(cond),
                then_actions,
                else_actions: Some(else_actions),
            } => {
                assert_eq!(cond.kind_name(), "image-match");
                assert!(matches!(
                    &cond.kind,
                    ConditionKind::ImageMatch(p) if p.template == "ok_button" && p.threshold == Some(0.9)
                ));
                assert_eq!(then_actions[0].kind(), "fail");
                assert_eq!(else_actions.len(), 1);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            actions[2],
            Action::While {
                condition: None,
                max_iterations: Some(4),
                ..
            }
        ));
        assert!(actions.iter().all(Action::is_control));
    }

    #[test]
    fn parses_condition_comparison() {
        let cond: Condition = serde_json::from_value(json!({
            "type": "system-info", "probe": "cursor-x", "operator": "<", "value": 100
        }))
        .unwrap();
        assert_eq!(cond.operator, Some(CompareOp::Lt));
        assert_eq!(cond.value, Some(100.0));
        assert!(matches!(
            cond.kind,
            ConditionKind::SystemInfo(SystemInfoParams {
                probe: SystemProbe::CursorX
            })
        ));
    }

    #[test]
    fn compare_ops() {
        assert!(CompareOp::Gte.apply(0.95, 0.95));
        assert!(!CompareOp::Gt.apply(0.95, 0.95));
        assert!(CompareOp::Eq.apply(0.1 + 0.2, 0.3));
        assert!(CompareOp::Ne.apply(1.0, 2.0));
        assert!(CompareOp::Lt.apply(1.0, 2.0));
        assert!(CompareOp::Lte.apply(2.0, 2.0));
    }

    #[test]
    fn leaf_kinds_roundtrip_tag() {
        let a = Action::SoundCheck(SoundCheckParams::default());
        let v = serde_json::to_value(&a).unwrap();
        assert_eq!(v["type"], "sound-check");
        let b = Action::Drag {
            from_x: 0,
            from_y: 0,
            to_x: 10,
            to_y: 10,
            duration_ms: None,
        };
        assert_eq!(serde_json::to_value(&b).unwrap()["fromX"], 0);
    }
}

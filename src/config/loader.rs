use anyhow::{Context, Result, anyhow, bail};
use schemars::{Schema, schema_for};
use serde_valid::Validate;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use tracing::{debug, trace};

use super::models::{Action, Condition, ConditionKind, ImageMatchParams, ScenarioConfig};
use crate::executor::context::{Template, TemplateLibrary};
use crate::matching::{Frame, MatchOptions};

/// Load a scenario from a string slice.
pub fn load_from_str(s: &str) -> Result<ScenarioConfig> {
    let cfg: ScenarioConfig =
        serde_json::from_str(s).context("Failed to parse JSON scenario string")?;
    validate_scenario(&cfg)?;
    Ok(cfg)
}

/// Load a scenario from any reader (e.g., a file).
pub fn load_from_reader<R: Read>(reader: R) -> Result<ScenarioConfig> {
    let cfg: ScenarioConfig =
        serde_json::from_reader(reader).context("Failed to parse JSON scenario from reader")?;
    validate_scenario(&cfg)?;
    Ok(cfg)
}

/// Load a scenario from a file path synchronously.
pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<ScenarioConfig> {
    let path_ref = path.as_ref();
    let file = File::open(path_ref)
        .with_context(|| format!("Failed to open scenario file {}", path_ref.display()))?;
    let cfg = load_from_reader(file)?;
    debug!("Loaded scenario from {}", path_ref.display());
    Ok(cfg)
}

/// Load a scenario from a file path asynchronously (Tokio).
pub async fn load_from_path_async<P: AsRef<Path>>(path: P) -> Result<ScenarioConfig> {
    use tokio::fs;
    let path_ref = path.as_ref();
    let bytes = fs::read(path_ref)
        .await
        .with_context(|| format!("Failed to read scenario file {}", path_ref.display()))?;
    let cfg: ScenarioConfig = serde_json::from_slice(&bytes)
        .with_context(|| format!("Failed to parse JSON scenario from {}", path_ref.display()))?;
    validate_scenario(&cfg)?;
    debug!("Loaded scenario from {}", path_ref.display());
    Ok(cfg)
}

/// Decode every template image of the scenario. Relative paths are resolved against `base_dir`.
pub fn load_templates(cfg: &ScenarioConfig, base_dir: &Path) -> Result<TemplateLibrary> {
    let mut library = TemplateLibrary::new();
    for (name, def) in &cfg.templates {
        let path = base_dir.join(&def.path);
        let frame = Frame::load(&path)
            .with_context(|| format!("Failed to load template '{name}'"))?;
        trace!(
            target: "macrobot::config",
            %name, path = %path.display(), width = frame.width(), height = frame.height(),
            "Template loaded"
        );
        library.insert(
            name.clone(),
            Template {
                frame,
                crop_location: def.crop_location,
            },
        );
    }
    Ok(library)
}

/// Generate the JSON Schema for the scenario model (for external validation or tooling).
pub fn generate_schema() -> Schema {
    schema_for!(ScenarioConfig)
}

/// Write the JSON Schema for the scenario model to any writer (pretty-printed).
pub fn write_schema_to_writer<W: Write>(mut writer: W) -> Result<()> {
    let schema = generate_schema();
    let json = serde_json::to_string_pretty(&schema).context("Failed to serialize schema")?;
    writer
        .write_all(json.as_bytes())
        .context("Failed to write schema to writer")?;
    Ok(())
}

/// Perform sanity checks on a scenario:
/// - image-match actions and conditions reference known templates
/// - image-match options are in range
/// - control nesting stays within `options.maxDepth`
pub fn validate_scenario(cfg: &ScenarioConfig) -> Result<()> {
    if cfg.options.max_depth == 0 {
        bail!("options.maxDepth must be at least 1");
    }
    for (idx, action) in cfg.actions.iter().enumerate() {
        validate_action(cfg, action, 1)
            .with_context(|| format!("Invalid action at index {idx}"))?;
    }
    Ok(())
}

fn validate_action(cfg: &ScenarioConfig, action: &Action, depth: usize) -> Result<()> {
    let nested = |actions: &[Action], branch: &str| -> Result<()> {
        if depth >= cfg.options.max_depth {
            bail!(
                "Maximum action nesting depth ({}) exceeded",
                cfg.options.max_depth
            );
        }
        for (i, child) in actions.iter().enumerate() {
            validate_action(cfg, child, depth + 1)
                .with_context(|| format!("Invalid action in `{branch}` at index {i}"))?;
        }
        Ok(())
    };

    match action {
        Action::If {
            condition,
            then_actions,
            else_actions,
        } => {
            if let Some(cond) = condition {
                validate_condition(cfg, cond).context("Invalid `if` condition")?;
            }
            nested(then_actions, "thenActions")?;
            if let Some(else_actions) = else_actions {
                nested(else_actions, "elseActions")?;
            }
        }
        Action::While {
            condition,
            actions,
            max_iterations,
        } => {
            if let Some(cond) = condition {
                validate_condition(cfg, cond).context("Invalid `while` condition")?;
            }
            if *max_iterations == Some(0) {
                bail!("`while` maxIterations must be at least 1");
            }
            nested(actions, "actions")?;
        }
        Action::Loop { actions, .. } => nested(actions, "actions")?,
        Action::ImageMatch(params) => validate_image_match(cfg, params)?,
        // Leaf actions: nothing to validate
        Action::Skip { .. }
        | Action::Fail { .. }
        | Action::Test { .. }
        | Action::Click { .. }
        | Action::Drag { .. }
        | Action::Input { .. }
        | Action::Key { .. }
        | Action::Wait { .. }
        | Action::Log { .. }
        | Action::SoundCheck(_) => {}
    }
    Ok(())
}

fn validate_condition(cfg: &ScenarioConfig, cond: &Condition) -> Result<()> {
    match &cond.kind {
        ConditionKind::ImageMatch(params) => validate_image_match(cfg, params),
        ConditionKind::SoundCheck(_) | ConditionKind::SystemInfo(_) => {
            if cond.operator.is_some() && cond.value.is_none() {
                bail!("Condition operator given without a `value` to compare against");
            }
            Ok(())
        }
    }
}

fn validate_image_match(cfg: &ScenarioConfig, params: &ImageMatchParams) -> Result<()> {
    if !cfg.templates.contains_key(&params.template) {
        bail!(
            "Referenced template '{}' was not found in `templates`",
            params.template
        );
    }
    let mut options = MatchOptions::default();
    if let Some(threshold) = params.threshold {
        options.threshold = threshold;
    }
    options
        .validate()
        .map_err(|e| anyhow!("Invalid image-match options for '{}': {e}", params.template))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scenario(actions: serde_json::Value) -> String {
        json!({
            "name": "login",
            "templates": {"ok": {"path": "ok.png", "cropLocation": {"x": 10, "y": 20}}},
            "actions": actions
        })
        .to_string()
    }

    #[test]
    fn loads_valid_scenario() {
        let cfg = load_from_str(&scenario(json!([
            {"type": "image-match", "template": "ok"},
            {"type": "while",
             "condition": {"type": "image-match", "template": "ok", "operator": "<", "value": 0.5},
             "actions": [{"type": "wait", "ms": 100}]}
        ])))
        .unwrap();
        assert_eq!(cfg.name.as_deref(), Some("login"));
        assert_eq!(cfg.actions.len(), 2);
        assert_eq!(cfg.options.max_depth, 64);
        assert_eq!(
            cfg.templates["ok"].crop_location,
            Some(crate::matching::Point { x: 10, y: 20 })
        );
    }

    #[test]
    fn rejects_unknown_template() {
        let err = load_from_str(&scenario(json!([
            {"type": "if",
             "condition": {"type": "image-match", "template": "missing"},
             "thenActions": []}
        ])))
        .unwrap_err();
        assert!(format!("{err:#}").contains("missing"));
    }

    #[test]
    fn rejects_out_of_range_threshold() {
        let err = load_from_str(&scenario(json!([
            {"type": "loop", "count": 2, "actions": [
                {"type": "image-match", "template": "ok", "threshold": 1.2}
            ]}
        ])))
        .unwrap_err();
        assert!(format!("{err:#}").contains("Invalid image-match options"));
    }

    #[test]
    fn rejects_excessive_nesting() {
        let mut actions = json!([{"type": "test"}]);
        for _ in 0..4 {
            actions = json!([{"type": "loop", "count": 1, "actions": actions}]);
        }
        let raw = json!({"options": {"maxDepth": 3}, "actions": actions}).to_string();
        let err = load_from_str(&raw).unwrap_err();
        assert!(format!("{err:#}").contains("nesting depth"));

        let raw = json!({"options": {"maxDepth": 5}, "actions": actions}).to_string();
        assert!(load_from_str(&raw).is_ok());
    }

    #[test]
    fn schema_mentions_actions() {
        let mut out = Vec::new();
        write_schema_to_writer(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("actions"));
        assert!(text.contains("thenActions"));
    }
}

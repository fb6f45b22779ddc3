use anyhow::{Context, Result, bail};
use enigo::Keyboard as _;
use enigo::Mouse as _;
use enigo::{Button as EButton, Coordinate, Direction, Enigo, Key, Settings};
use rand::random_range;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::config::models::{
    Action, Condition, ConditionKind, ImageMatchParams, LogLevel, MouseButton as CMouseButton,
    SystemProbe,
};
use crate::executor::context::ActionScope;
use crate::matching::{Frame, MatchOptions, MatchResult};

/// Number of intermediate pointer moves of a drag.
const DRAG_STEPS: u32 = 10;

/// What an executor reports back for one leaf action.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionOutcome {
    pub success: bool,
    pub error: Option<String>,
    /// Resume the current sequence at this index instead of the next one.
    pub jump_to: Option<usize>,
    /// End the whole run, like a `fail` action.
    pub terminate_execution: bool,
}

impl ActionOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn jump_to(mut self, index: usize) -> Self {
        self.jump_to = Some(index);
        self
    }

    pub fn terminate(mut self) -> Self {
        self.terminate_execution = true;
        self
    }
}

/// Result of matching a template against one captured frame.
#[derive(Debug, Clone)]
pub struct ImageMatchReading {
    pub success: bool,
    pub score: f64,
    pub threshold: f64,
    pub result: MatchResult,
}

/// Result of a sound-check or system-info probe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeReading {
    pub success: bool,
    /// The measured scalar, if the probe produces one.
    pub value: Option<f64>,
}

/// Device-facing side of the engine.
///
/// The engine handles control flow and the testing leaves itself; every other leaf is
/// handed to `execute_action` unchanged. Returning `Err` means the executor could not
/// run the action at all and aborts the run; a failed action is an `Ok` outcome with
/// `success == false`.
#[allow(async_fn_in_trait)]
pub trait ActionExecutor {
    async fn execute_action(
        &mut self,
        action: &Action,
        scope: &mut ActionScope<'_>,
    ) -> Result<ActionOutcome>;

    /// Match an image-match action/condition against an already captured frame.
    async fn execute_image_match(
        &mut self,
        params: &ImageMatchParams,
        frame: &Frame,
        scope: &mut ActionScope<'_>,
    ) -> Result<ImageMatchReading> {
        match_in_scope(params, frame, scope).await
    }

    /// Evaluate a sound-check or system-info condition.
    async fn probe(
        &mut self,
        condition: &Condition,
        _scope: &mut ActionScope<'_>,
    ) -> Result<ProbeReading> {
        bail!(
            "{} conditions are not supported by this executor",
            condition.kind_name()
        )
    }
}

/// Run the matcher for `params` using the templates and matcher in `scope`.
pub async fn match_in_scope(
    params: &ImageMatchParams,
    frame: &Frame,
    scope: &mut ActionScope<'_>,
) -> Result<ImageMatchReading> {
    let template = scope
        .templates
        .get(&params.template)
        .with_context(|| format!("Unknown template '{}'", params.template))?;

    let defaults = MatchOptions::default();
    let options = MatchOptions {
        threshold: params.threshold.unwrap_or(defaults.threshold),
        timeout_ms: params.timeout_ms.unwrap_or(defaults.timeout_ms),
        use_cache: params.use_cache.unwrap_or(defaults.use_cache),
        crop_location: params.crop_location.or(template.crop_location),
        color_invariant: params.color_invariant,
    };
    let result = scope
        .matcher
        .find_template(frame, &template.frame, &options)
        .await;
    Ok(ImageMatchReading {
        success: result.found,
        score: result.score,
        threshold: options.threshold,
        result,
    })
}

/// Executes leaf actions on the local desktop through Enigo, with optional dry-run mode.
/// In dry-run mode, actions are only logged and no real input is simulated.
pub struct DesktopExecutor {
    dry_run: bool,
    enigo: Option<Enigo>,
}

impl DesktopExecutor {
    /// Create a new executor.
    /// - dry_run: when true, only logs instead of simulating real input.
    pub fn new(dry_run: bool) -> Self {
        Self {
            dry_run,
            enigo: None,
        }
    }

    /// Returns whether the executor is currently in dry-run mode.
    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Enable or disable dry-run mode dynamically.
    pub fn set_dry_run(&mut self, dry_run: bool) {
        self.dry_run = dry_run;
    }

    fn click(&mut self, x: i32, y: i32, button: CMouseButton, count: Option<u8>) -> Result<()> {
        let count = count.unwrap_or(1).max(1);
        if self.dry_run {
            info!(target: "macrobot::actions", x, y, ?button, count, "DRY-RUN click");
            return Ok(());
        }
        let enigo = self.ensure_enigo()?;
        trace!(target: "macrobot::actions", x, y, ?button, count, "click");
        enigo.move_mouse(x, y, Coordinate::Abs)?;
        let btn = map_mouse_button(button);
        for _ in 0..count {
            enigo.button(btn, Direction::Click)?;
        }
        Ok(())
    }

    async fn drag(&mut self, from: (i32, i32), to: (i32, i32), duration_ms: u64) -> Result<()> {
        if self.dry_run {
            info!(target: "macrobot::actions", ?from, ?to, duration_ms, "DRY-RUN drag");
            return Ok(());
        }
        trace!(target: "macrobot::actions", ?from, ?to, duration_ms, "drag");
        let pause = Duration::from_millis(duration_ms / u64::from(DRAG_STEPS));
        {
            let enigo = self.ensure_enigo()?;
            enigo.move_mouse(from.0, from.1, Coordinate::Abs)?;
            enigo.button(EButton::Left, Direction::Press)?;
        }
        for step in 1..=DRAG_STEPS {
            let t = f64::from(step) / f64::from(DRAG_STEPS);
            let x = from.0 + (f64::from(to.0 - from.0) * t).round() as i32;
            let y = from.1 + (f64::from(to.1 - from.1) * t).round() as i32;
            self.ensure_enigo()?.move_mouse(x, y, Coordinate::Abs)?;
            if !pause.is_zero() {
                tokio::time::sleep(pause).await;
            }
        }
        self.ensure_enigo()?
            .button(EButton::Left, Direction::Release)?;
        Ok(())
    }

    fn type_text(&mut self, text: &str) -> Result<()> {
        if self.dry_run {
            info!(target: "macrobot::actions", %text, "DRY-RUN type_text");
            return Ok(());
        }
        let enigo = self.ensure_enigo()?;
        trace!(target: "macrobot::actions", %text, "type_text");
        enigo.text(text)?;
        Ok(())
    }

    /// Send a key sequence. `{ENTER}`, `{TAB}`, `{ESC}` and friends press the named key;
    /// everything else is typed as text.
    fn key_sequence(&mut self, text: &str) -> Result<()> {
        if self.dry_run {
            info!(target: "macrobot::actions", %text, "DRY-RUN key_sequence");
            return Ok(());
        }
        let enigo = self.ensure_enigo()?;
        trace!(target: "macrobot::actions", %text, "key_sequence");
        for token in parse_key_sequence(text) {
            match token {
                KeyToken::Text(chunk) => enigo.text(chunk)?,
                KeyToken::Key(key) => enigo.key(key, Direction::Click)?,
            }
        }
        Ok(())
    }

    /// Sleep for `ms`, or a random duration within `[ms, max_ms]` when `max_ms` is set.
    async fn wait(&self, ms: u64, max_ms: Option<u64>) {
        let delay = match max_ms {
            Some(max) if max != ms => {
                let (lo, hi) = if ms <= max { (ms, max) } else { (max, ms) };
                random_range(lo..=hi)
            }
            _ => ms,
        };
        if self.dry_run {
            info!(target: "macrobot::actions", ms, ?max_ms, delay, "DRY-RUN wait");
            return;
        }
        trace!(target: "macrobot::actions", delay, "wait");
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }

    /// Log a message with a given level, useful within scenarios.
    fn log_message(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Trace => trace!(target: "macrobot", "{message}"),
            LogLevel::Debug => debug!(target: "macrobot", "{message}"),
            LogLevel::Info => info!(target: "macrobot", "{message}"),
            LogLevel::Warn => warn!(target: "macrobot", "{message}"),
            LogLevel::Error => tracing::error!(target: "macrobot", "{message}"),
        }
    }

    fn system_value(&mut self, probe: SystemProbe) -> Result<f64> {
        if self.dry_run {
            info!(target: "macrobot::actions", ?probe, "DRY-RUN system probe; reporting 0");
            return Ok(0.0);
        }
        let enigo = self.ensure_enigo()?;
        let value = match probe {
            SystemProbe::CursorX => enigo.location()?.0,
            SystemProbe::CursorY => enigo.location()?.1,
            SystemProbe::ScreenWidth => enigo.main_display()?.0,
            SystemProbe::ScreenHeight => enigo.main_display()?.1,
        };
        Ok(f64::from(value))
    }

    fn ensure_enigo(&mut self) -> Result<&mut Enigo> {
        if self.enigo.is_none() {
            trace!(target: "macrobot::actions", "Initializing Enigo");
            self.enigo =
                Some(Enigo::new(&Settings::default()).context("Failed to initialize Enigo")?);
        }
        self.enigo
            .as_mut()
            .context("Enigo must be initialized")
    }
}

impl ActionExecutor for DesktopExecutor {
    async fn execute_action(
        &mut self,
        action: &Action,
        scope: &mut ActionScope<'_>,
    ) -> Result<ActionOutcome> {
        match action {
            Action::Click {
                x,
                y,
                button,
                count,
            } => self.click(*x, *y, *button, *count)?,
            Action::Drag {
                from_x,
                from_y,
                to_x,
                to_y,
                duration_ms,
            } => {
                self.drag((*from_x, *from_y), (*to_x, *to_y), duration_ms.unwrap_or(0))
                    .await?
            }
            Action::Input { text } => self.type_text(text)?,
            Action::Key { text } => self.key_sequence(text)?,
            Action::Wait { ms, max_ms } => self.wait(*ms, *max_ms).await,
            Action::Log { level, message } => self.log_message(*level, message),
            Action::ImageMatch(params) => {
                let frame = match scope.screen.capture() {
                    Ok(frame) => frame,
                    Err(e) => return Ok(ActionOutcome::failed(format!("screen capture failed: {e:#}"))),
                };
                let reading = self.execute_image_match(params, &frame, scope).await?;
                if !reading.success {
                    return Ok(ActionOutcome::failed(format!(
                        "template '{}' not found (best score {:.3} < {:.3})",
                        params.template, reading.score, reading.threshold
                    )));
                }
            }
            Action::SoundCheck(_) => {
                warn!(target: "macrobot::actions", "sound-check requested but no audio capture is available");
                return Ok(ActionOutcome::failed(
                    "sound-check is not supported by the desktop executor",
                ));
            }
            Action::If { .. }
            | Action::While { .. }
            | Action::Loop { .. }
            | Action::Skip { .. }
            | Action::Fail { .. }
            | Action::Test { .. } => {
                bail!("'{}' actions are handled by the engine", action.kind())
            }
        }
        Ok(ActionOutcome::ok())
    }

    async fn probe(
        &mut self,
        condition: &Condition,
        _scope: &mut ActionScope<'_>,
    ) -> Result<ProbeReading> {
        match &condition.kind {
            ConditionKind::SystemInfo(params) => Ok(ProbeReading {
                success: true,
                value: Some(self.system_value(params.probe)?),
            }),
            ConditionKind::SoundCheck(_) => bail!("sound-check is not supported by the desktop executor"),
            ConditionKind::ImageMatch(_) => bail!("image-match conditions are not probes"),
        }
    }
}

#[derive(Debug, PartialEq)]
enum KeyToken<'a> {
    Text(&'a str),
    Key(Key),
}

/// Split `"user{TAB}pass{ENTER}"` into text runs and named keys. Unknown `{...}` stays text.
fn parse_key_sequence(text: &str) -> Vec<KeyToken<'_>> {
    let mut tokens = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        let Some(open) = rest.find('{') else {
            tokens.push(KeyToken::Text(rest));
            break;
        };
        if open > 0 {
            tokens.push(KeyToken::Text(&rest[..open]));
        }
        let tail = &rest[open..];
        let named = tail
            .find('}')
            .and_then(|close| named_key(&tail[1..close]).map(|key| (key, close)));
        match named {
            Some((key, close)) => {
                tokens.push(KeyToken::Key(key));
                rest = &tail[close + 1..];
            }
            None => {
                tokens.push(KeyToken::Text(&tail[..1]));
                rest = &tail[1..];
            }
        }
    }
    tokens
}

fn named_key(name: &str) -> Option<Key> {
    let key = match name.to_ascii_uppercase().as_str() {
        "ENTER" | "RETURN" => Key::Return,
        "TAB" => Key::Tab,
        "ESC" | "ESCAPE" => Key::Escape,
        "BACKSPACE" => Key::Backspace,
        "DELETE" | "DEL" => Key::Delete,
        "SPACE" => Key::Space,
        "UP" => Key::UpArrow,
        "DOWN" => Key::DownArrow,
        "LEFT" => Key::LeftArrow,
        "RIGHT" => Key::RightArrow,
        "HOME" => Key::Home,
        "END" => Key::End,
        "PAGEUP" => Key::PageUp,
        "PAGEDOWN" => Key::PageDown,
        _ => return None,
    };
    Some(key)
}

fn map_mouse_button(btn: CMouseButton) -> EButton {
    match btn {
        CMouseButton::Left => EButton::Left,
        CMouseButton::Middle => EButton::Middle,
        CMouseButton::Right => EButton::Right,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::context::{ExecutionContext, Template};
    use crate::sources::StaticScreen;

    fn screen() -> Frame {
        Frame::from_fn(32, 24, |x, y| {
            if (10..16).contains(&x) && (8..12).contains(&y) {
                (x * 20 + y * 7) as u8
            } else {
                50
            }
        })
        .unwrap()
    }

    fn context() -> ExecutionContext<DesktopExecutor> {
        let frame = screen();
        let button = frame.crop(8, 6, 10, 8).unwrap();
        ExecutionContext::new(DesktopExecutor::new(true))
            .with_screen(StaticScreen::new(frame))
            .with_template("button", Template::new(button).with_crop_location(8, 6))
    }

    #[tokio::test]
    async fn dry_run_leaves_succeed() {
        let mut ctx = context();
        let (exec, mut scope) = ctx.split();
        for action in [
            Action::Click {
                x: 1,
                y: 2,
                button: CMouseButton::Left,
                count: None,
            },
            Action::Input { text: "hi".into() },
            Action::Wait {
                ms: 5,
                max_ms: Some(10),
            },
            Action::Log {
                level: LogLevel::Info,
                message: "note".into(),
            },
        ] {
            let outcome = exec.execute_action(&action, &mut scope).await.unwrap();
            assert!(outcome.success, "{action:?}");
        }
    }

    #[tokio::test]
    async fn image_match_leaf_reports_found_and_missing() {
        let mut ctx = context();
        let (exec, mut scope) = ctx.split();

        let found = exec
            .execute_action(&Action::ImageMatch(ImageMatchParams::new("button")), &mut scope)
            .await
            .unwrap();
        assert!(found.success);

        let err = exec
            .execute_action(&Action::ImageMatch(ImageMatchParams::new("nope")), &mut scope)
            .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn control_actions_are_rejected() {
        let mut ctx = context();
        let (exec, mut scope) = ctx.split();
        let result = exec
            .execute_action(&Action::Test { name: None }, &mut scope)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn sound_check_fails_gracefully() {
        let mut ctx = context();
        let (exec, mut scope) = ctx.split();
        let outcome = exec
            .execute_action(&Action::SoundCheck(Default::default()), &mut scope)
            .await
            .unwrap();
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("sound-check"));
    }

    #[test]
    fn key_sequences_split_named_keys() {
        assert_eq!(
            parse_key_sequence("ab{enter}c{NOPE}"),
            vec![
                KeyToken::Text("ab"),
                KeyToken::Key(Key::Return),
                KeyToken::Text("c"),
                KeyToken::Text("{"),
                KeyToken::Text("NOPE}"),
            ]
        );
        assert_eq!(parse_key_sequence("{TAB}{TAB}").len(), 2);
        assert!(parse_key_sequence("").is_empty());
    }

    #[test]
    fn outcome_builders() {
        let o = ActionOutcome::ok().jump_to(3);
        assert!(o.success);
        assert_eq!(o.jump_to, Some(3));
        let t = ActionOutcome::failed("x").terminate();
        assert!(!t.success && t.terminate_execution);
    }
}

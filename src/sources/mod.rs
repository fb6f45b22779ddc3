/*!
Screen sources (where condition evaluation gets its frames from).

This module defines the `ScreenSource` trait and the simple in-process sources.
Concrete file-backed capture lives in its own file:

- `file.rs` -> `FileScreen` (re-read an image file dumped by an external capture tool)

Every source must:
- Produce a fresh frame on each `capture` call; the engine never caches frames
- Return an error (never panic) when no frame is available; the condition evaluator
  turns that into a `false` result
*/

use std::collections::VecDeque;

use anyhow::{Result, bail};
use tracing::trace;

use crate::matching::Frame;

pub mod file;

pub use file::FileScreen;

/// Produces the current screen contents.
pub trait ScreenSource {
    /// Static human-readable identifier (used in logs).
    fn name(&self) -> &'static str;

    /// Capture the current frame.
    fn capture(&mut self) -> Result<Frame>;
}

/// Source used when no screen is attached. Every capture fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoScreen;

impl ScreenSource for NoScreen {
    fn name(&self) -> &'static str {
        "none"
    }

    fn capture(&mut self) -> Result<Frame> {
        bail!("no screen source attached")
    }
}

/// Always returns the same frame.
#[derive(Debug, Clone)]
pub struct StaticScreen {
    frame: Frame,
}

impl StaticScreen {
    pub fn new(frame: Frame) -> Self {
        Self { frame }
    }
}

impl ScreenSource for StaticScreen {
    fn name(&self) -> &'static str {
        "static"
    }

    fn capture(&mut self) -> Result<Frame> {
        Ok(self.frame.clone())
    }
}

/// Replays a fixed list of frames, one per capture. The last frame repeats once the
/// list runs out.
#[derive(Debug, Clone)]
pub struct FrameSequence {
    frames: VecDeque<Frame>,
    captures: usize,
}

impl FrameSequence {
    pub fn new(frames: impl IntoIterator<Item = Frame>) -> Self {
        Self {
            frames: frames.into_iter().collect(),
            captures: 0,
        }
    }

    /// Number of captures served so far.
    pub fn captures(&self) -> usize {
        self.captures
    }
}

impl ScreenSource for FrameSequence {
    fn name(&self) -> &'static str {
        "sequence"
    }

    fn capture(&mut self) -> Result<Frame> {
        let frame = if self.frames.len() > 1 {
            self.frames.pop_front()
        } else {
            self.frames.front().cloned()
        };
        let Some(frame) = frame else {
            bail!("frame sequence is empty");
        };
        self.captures += 1;
        trace!(target: "macrobot::sources", captures = self.captures, "FrameSequence capture");
        Ok(frame)
    }
}

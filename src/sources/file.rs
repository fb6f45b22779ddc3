//! File-backed screen source.
//!
//! Re-decodes a single image file on every capture. This pairs with external capture
//! tools (e.g. a device screenshot loop) that keep overwriting the same path.
//!
//! Behavior:
//! - Missing file: the capture fails (the condition evaluates to `false`) and the error is
//!   logged at debug level only, since producers commonly write the first frame late.
//! - Unchanged file: the previously decoded frame is reused when the (length, mtime)
//!   signature has not changed, to avoid decoding the same PNG in tight `while` loops.

use std::fs;
use std::path::PathBuf;
use std::time::SystemTime;

use anyhow::{Context, Result};
use tracing::{debug, trace};

use super::ScreenSource;
use crate::matching::Frame;

/// Source that decodes the current frame from an image file.
#[derive(Debug, Clone)]
pub struct FileScreen {
    path: PathBuf,
    last: Option<((u64, u64), Frame)>,
}

impl FileScreen {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last: None,
        }
    }

    /// Change signature (length, mtime nanoseconds).
    fn file_signature(meta: &fs::Metadata) -> (u64, u64) {
        let len = meta.len();
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        (len, mtime)
    }
}

impl ScreenSource for FileScreen {
    fn name(&self) -> &'static str {
        "file"
    }

    fn capture(&mut self) -> Result<Frame> {
        let meta = fs::metadata(&self.path)
            .inspect_err(|e| {
                debug!(
                    target: "macrobot::sources",
                    path = %self.path.display(), error = %e,
                    "Screen file unavailable"
                );
            })
            .with_context(|| format!("Screen file {} unavailable", self.path.display()))?;

        let sig = Self::file_signature(&meta);
        if let Some((last_sig, frame)) = &self.last {
            if *last_sig == sig {
                trace!(target: "macrobot::sources", path = %self.path.display(), "Screen file unchanged; reusing frame");
                return Ok(frame.clone());
            }
        }

        let frame = Frame::load(&self.path)?;
        trace!(
            target: "macrobot::sources",
            path = %self.path.display(), width = frame.width(), height = frame.height(),
            "Decoded screen frame"
        );
        self.last = Some((sig, frame.clone()));
        Ok(frame)
    }
}

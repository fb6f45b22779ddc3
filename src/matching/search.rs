use std::time::{Duration, Instant};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_valid::Validate;
use tracing::{debug, trace};

use super::cache::{LocationCache, content_hash};
use super::frame::{Frame, GrayBuffer};
use super::score::{PreparedTemplate, match_template_at};

pub const DEFAULT_THRESHOLD: f64 = 0.95;
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// Row step of the coarse vertical sweep around a crop hint.
const VERTICAL_STEP: usize = 2;
/// Half-width of the horizontal window scanned at each row of the vertical sweep.
const HORIZONTAL_TOLERANCE: i64 = 24;
const HORIZONTAL_STEP: usize = 2;
/// Radius of the final 1px refinement.
const FINE_WINDOW: i64 = 3;
/// Step of the exhaustive grid used when there is no crop hint.
const GRID_STEP: usize = 4;
/// Scoring calls between two yields to the runtime.
const YIELD_INTERVAL: usize = 64;

/// A pixel position (top-left corner of a template).
#[derive(Debug, Copy, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

/// Tuning knobs for a single `find_template` call.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct MatchOptions {
    /// Minimum score for a location to count as found.
    #[validate(minimum = 0.0)]
    #[validate(maximum = 1.0)]
    pub threshold: f64,
    /// Wall-clock budget for the whole search, in milliseconds.
    pub timeout_ms: u64,
    pub use_cache: bool,
    /// Where the template was originally captured; enables the hinted search.
    pub crop_location: Option<Point>,
    /// Match on Sobel edge maps instead of raw luminosity.
    pub color_invariant: bool,
}

impl Default for MatchOptions {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            use_cache: true,
            crop_location: None,
            color_invariant: false,
        }
    }
}

/// Which stage of the search produced the result.
#[derive(Debug, Copy, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SearchPhase {
    /// Revalidated cached location.
    Cache,
    /// Coarse vertical sweep around the crop hint.
    CropVertical,
    /// Full-width row scan at the best row of the sweep.
    CropHorizontal,
    /// 1px refinement around the best point of the hinted search.
    CropRefine,
    /// Coarse grid over the whole frame.
    Grid,
    /// 1px refinement around the best grid point.
    GridRefine,
    /// The template does not fit inside the frame at any offset.
    OutOfBounds,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MatchResult {
    pub found: bool,
    pub x: i64,
    pub y: i64,
    pub width: u32,
    pub height: u32,
    pub score: f64,
    pub search_phase: SearchPhase,
    pub total_time: Duration,
    /// Number of `match_template_at` calls performed.
    pub evaluations: usize,
    pub timed_out: bool,
}

/// Locates templates in frames. Owns its location cache; do not share one matcher
/// between concurrently running scenarios.
#[derive(Debug, Default)]
pub struct TemplateMatcher {
    cache: LocationCache,
}

impl TemplateMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cache(cache: LocationCache) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &LocationCache {
        &self.cache
    }

    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }

    /// Find `template` inside `source`.
    ///
    /// `found` is set only when the returned score reaches `options.threshold` before the
    /// timeout elapses. Otherwise the best location seen so far is reported with `found = false`.
    ///
    /// The search yields to the runtime at its timeout checks, never inside a scoring call.
    pub async fn find_template(
        &mut self,
        source: &Frame,
        template: &Frame,
        options: &MatchOptions,
    ) -> MatchResult {
        let started = Instant::now();
        let (mut frame, mut tpl) = (source.to_gray(), template.to_gray());
        if options.color_invariant {
            frame = frame.sobel();
            tpl = tpl.sobel();
        }
        let key = content_hash(&tpl);
        let prepared = PreparedTemplate::new(tpl);

        let mut search = Search::new(&frame, &prepared, options, started);
        if prepared.width() > frame.width() || prepared.height() > frame.height() {
            debug!(
                target: "macrobot::matching",
                template_w = prepared.width(), template_h = prepared.height(),
                frame_w = frame.width(), frame_h = frame.height(),
                "Template larger than frame; nothing to search"
            );
            return search.finish(SearchPhase::OutOfBounds, template);
        }

        let cached = if options.use_cache {
            self.cache.get(key)
        } else {
            None
        };
        if let Some(entry) = cached {
            let score = search.score(entry.x, entry.y);
            if score >= options.threshold {
                trace!(target: "macrobot::matching", x = entry.x, y = entry.y, score, "Cache hit");
                return search.finish(SearchPhase::Cache, template);
            }
            debug!(
                target: "macrobot::matching",
                x = entry.x, y = entry.y, score,
                "Cached location no longer matches; invalidating"
            );
            self.cache.remove(key);
            search.reset_best();
        }

        let phase = match options.crop_location {
            Some(hint) => search.hinted(hint).await,
            None => search.grid().await,
        };
        let result = search.finish(phase, template);

        if result.found {
            self.cache.insert(key, result.x, result.y);
        }
        debug!(
            target: "macrobot::matching",
            found = result.found, x = result.x, y = result.y, score = result.score,
            phase = ?result.search_phase, evaluations = result.evaluations,
            elapsed_ms = result.total_time.as_millis() as u64,
            "Template search finished"
        );
        result
    }
}

#[derive(Debug, Copy, Clone)]
struct Candidate {
    x: i64,
    y: i64,
    score: f64,
}

/// State of one search: the best candidate so far and the timeout bookkeeping.
struct Search<'a> {
    frame: &'a GrayBuffer,
    template: &'a PreparedTemplate,
    threshold: f64,
    started: Instant,
    timeout: Duration,
    max_x: i64,
    max_y: i64,
    best: Option<Candidate>,
    evaluations: usize,
    /// Evaluation count at which the next checkpoint yields.
    next_yield: usize,
    timed_out: bool,
}

impl<'a> Search<'a> {
    fn new(
        frame: &'a GrayBuffer,
        template: &'a PreparedTemplate,
        options: &MatchOptions,
        started: Instant,
    ) -> Self {
        Self {
            frame,
            template,
            threshold: options.threshold,
            started,
            timeout: Duration::from_millis(options.timeout_ms),
            max_x: frame.width() as i64 - template.width() as i64,
            max_y: frame.height() as i64 - template.height() as i64,
            best: None,
            evaluations: 0,
            next_yield: YIELD_INTERVAL,
            timed_out: false,
        }
    }

    fn score(&mut self, x: i64, y: i64) -> f64 {
        self.evaluations += 1;
        let score = match_template_at(self.frame, self.template, x, y);
        if self.best.is_none_or(|b| score > b.score) {
            self.best = Some(Candidate { x, y, score });
        }
        score
    }

    fn reset_best(&mut self) {
        self.best = None;
    }

    /// Timeout check run before every scoring call. Every `YIELD_INTERVAL` evaluations it
    /// first lets other tasks run.
    async fn checkpoint(&mut self) -> bool {
        if self.evaluations >= self.next_yield {
            self.next_yield = self.evaluations + YIELD_INTERVAL;
            tokio::task::yield_now().await;
        }
        self.expired()
    }

    fn expired(&mut self) -> bool {
        if !self.timed_out && self.started.elapsed() >= self.timeout {
            self.timed_out = true;
        }
        self.timed_out
    }

    fn sufficient(&self) -> bool {
        self.best.is_some_and(|b| b.score >= self.threshold)
    }

    /// Search outward from the crop hint. Returns the phase the search ended in.
    async fn hinted(&mut self, hint: Point) -> SearchPhase {
        let cx = i64::from(hint.x).clamp(0, self.max_x);
        let cy = i64::from(hint.y).clamp(0, self.max_y);

        // Vertical sweep: rows alternate outward from the hint, each scanned within the
        // horizontal tolerance window.
        let x_lo = (cx - HORIZONTAL_TOLERANCE).max(0);
        let x_hi = (cx + HORIZONTAL_TOLERANCE).min(self.max_x);
        for y in outward(cy, 0, self.max_y, VERTICAL_STEP) {
            for x in outward(cx, x_lo, x_hi, HORIZONTAL_STEP) {
                if self.checkpoint().await {
                    return SearchPhase::CropVertical;
                }
                if self.score(x, y) >= self.threshold {
                    return SearchPhase::CropVertical;
                }
            }
        }

        let Some(best) = self.best else {
            return SearchPhase::CropVertical;
        };

        // Full-width scan of the best row.
        for x in outward(best.x, 0, self.max_x, 1) {
            if self.checkpoint().await {
                return SearchPhase::CropHorizontal;
            }
            if self.score(x, best.y) >= self.threshold {
                return SearchPhase::CropHorizontal;
            }
        }

        self.refine(SearchPhase::CropRefine).await
    }

    /// Exhaustive coarse grid, first sufficient location wins.
    async fn grid(&mut self) -> SearchPhase {
        for y in (0..=self.max_y).step_by(GRID_STEP) {
            for x in (0..=self.max_x).step_by(GRID_STEP) {
                if self.checkpoint().await {
                    return SearchPhase::Grid;
                }
                if self.score(x, y) >= self.threshold {
                    return SearchPhase::Grid;
                }
            }
        }
        self.refine(SearchPhase::GridRefine).await
    }

    /// 1px scan of the window around the best candidate, first sufficient location wins.
    async fn refine(&mut self, phase: SearchPhase) -> SearchPhase {
        let Some(center) = self.best else {
            return phase;
        };
        for y in (center.y - FINE_WINDOW).max(0)..=(center.y + FINE_WINDOW).min(self.max_y) {
            for x in (center.x - FINE_WINDOW).max(0)..=(center.x + FINE_WINDOW).min(self.max_x) {
                if self.checkpoint().await {
                    return phase;
                }
                if (x, y) != (center.x, center.y) && self.score(x, y) >= self.threshold {
                    return phase;
                }
            }
        }
        phase
    }

    fn finish(&self, phase: SearchPhase, template: &Frame) -> MatchResult {
        let best = self.best.unwrap_or(Candidate {
            x: 0,
            y: 0,
            score: 0.0,
        });
        MatchResult {
            found: !self.timed_out && self.sufficient(),
            x: best.x,
            y: best.y,
            width: template.width(),
            height: template.height(),
            score: best.score,
            search_phase: phase,
            total_time: self.started.elapsed(),
            evaluations: self.evaluations,
            timed_out: self.timed_out,
        }
    }
}

/// Positions in `[lo, hi]` ordered by distance from `center`: `c, c+s, c-s, c+2s, ...`.
fn outward(center: i64, lo: i64, hi: i64, step: usize) -> impl Iterator<Item = i64> {
    let step = step.max(1) as i64;
    let reach = (center - lo).max(hi - center).max(0);
    (0..=reach / step).flat_map(move |k| {
        let d = k * step;
        let below = if d == 0 { None } else { Some(center - d) };
        std::iter::once(center + d)
            .chain(below)
            .filter(move |v| (lo..=hi).contains(v))
    })
}

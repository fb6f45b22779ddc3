/*!
Image template matching for macrobot.

This module wires together:
- `frame`: pixel buffers, grayscale conversion, Sobel edge maps
- `score`: the per-offset similarity score (`match_template_at`)
- `cache`: the bounded LRU of last-known template locations
- `search`: `TemplateMatcher`, the phased search driving all of the above

Typical usage:
```no_run
use macrobot::matching::{Frame, MatchOptions, TemplateMatcher};

# async fn run(screen: Frame, button: Frame) {
let mut matcher = TemplateMatcher::new();
let hit = matcher
    .find_template(&screen, &button, &MatchOptions::default())
    .await;
if hit.found {
    println!("button at {},{} (score {:.3})", hit.x, hit.y, hit.score);
}
# }
```
*/

pub mod cache;
pub mod frame;
pub mod score;
pub mod search;

pub use cache::{CacheEntry, LocationCache, content_hash};
pub use frame::{Frame, FrameError, GrayBuffer, PixelFormat};
pub use score::{PreparedTemplate, match_template_at};
pub use search::{
    DEFAULT_THRESHOLD, DEFAULT_TIMEOUT_MS, MatchOptions, MatchResult, Point, SearchPhase,
    TemplateMatcher,
};

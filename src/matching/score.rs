//! Similarity scoring between a template and a frame region.
//!
//! The score is a zero-mean normalized cross-correlation (ZNCC). It is invariant to uniform
//! brightness and contrast shifts, and anti-correlated regions are clamped to 0 so the result
//! always lies in `[0, 1]`.
//!
//! Textureless regions have a (near) zero standard deviation and would make the correlation
//! denominator vanish. They are scored separately:
//! - flat template against flat region: `1 - |mean_t - mean_r| / 255`
//! - flat against textured (either way round): 0

use super::frame::GrayBuffer;

/// Per-pixel variance (in squared intensity levels) below which a patch counts as flat.
pub const FLAT_VARIANCE: f64 = 1.0;

/// A grayscale template with its statistics computed once per search.
#[derive(Debug, Clone)]
pub struct PreparedTemplate {
    gray: GrayBuffer,
    mean: f64,
    /// Sum of squared deviations from the mean.
    deviation: f64,
}

impl PreparedTemplate {
    pub fn new(gray: GrayBuffer) -> Self {
        let n = (gray.width() * gray.height()) as f64;
        let (sum, sum_sq) = gray.data().iter().fold((0u64, 0u64), |(s, sq), &v| {
            let v = u64::from(v);
            (s + v, sq + v * v)
        });
        let mean = sum as f64 / n;
        let deviation = (sum_sq as f64 - (sum as f64 * sum as f64) / n).max(0.0);
        Self {
            gray,
            mean,
            deviation,
        }
    }

    pub fn gray(&self) -> &GrayBuffer {
        &self.gray
    }

    pub fn width(&self) -> usize {
        self.gray.width()
    }

    pub fn height(&self) -> usize {
        self.gray.height()
    }

    fn is_flat(&self) -> bool {
        self.deviation / self.pixel_count() < FLAT_VARIANCE
    }

    fn pixel_count(&self) -> f64 {
        (self.gray.width() * self.gray.height()) as f64
    }
}

/// Score the template placed with its top-left corner at `(x, y)` in `frame`.
///
/// Returns 0 for any offset where the template would leave the frame.
pub fn match_template_at(frame: &GrayBuffer, template: &PreparedTemplate, x: i64, y: i64) -> f64 {
    let (tw, th) = (template.width(), template.height());
    if x < 0 || y < 0 {
        return 0.0;
    }
    let (x, y) = (x as usize, y as usize);
    if x + tw > frame.width() || y + th > frame.height() {
        return 0.0;
    }

    let mut sum_r = 0u64;
    let mut sum_rr = 0u64;
    let mut sum_rt = 0u64;
    for row in 0..th {
        let region = frame.row(x, y + row, tw);
        let tpl = template.gray.row(0, row, tw);
        for (&r, &t) in region.iter().zip(tpl) {
            let (r, t) = (u64::from(r), u64::from(t));
            sum_r += r;
            sum_rr += r * r;
            sum_rt += r * t;
        }
    }

    let n = template.pixel_count();
    let mean_r = sum_r as f64 / n;
    let deviation_r = (sum_rr as f64 - (sum_r as f64 * sum_r as f64) / n).max(0.0);
    let region_flat = deviation_r / n < FLAT_VARIANCE;

    match (template.is_flat(), region_flat) {
        (true, true) => 1.0 - (template.mean - mean_r).abs() / 255.0,
        (true, false) | (false, true) => 0.0,
        (false, false) => {
            let covariance = sum_rt as f64 - template.mean * sum_r as f64;
            let ncc = covariance / (deviation_r * template.deviation).sqrt();
            ncc.clamp(0.0, 1.0)
        }
    }
}

//! Pixel buffers consumed by the matcher.
//!
//! A `Frame` is what a screen source hands over (RGBA, RGB or 8-bit gray). The matcher never
//! works on frames directly: both the screen capture and the template are reduced to a
//! single-channel `GrayBuffer` first, optionally followed by a Sobel edge pass.

use std::path::Path;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Luminosity weights (ITU-R BT.601).
const LUMA_R: f64 = 0.299;
const LUMA_G: f64 = 0.587;
const LUMA_B: f64 = 0.114;

/// Memory layout of a `Frame`.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Rgba8,
    Rgb8,
    Gray8,
}

impl PixelFormat {
    /// Bytes per pixel.
    pub const fn channels(self) -> usize {
        match self {
            PixelFormat::Rgba8 => 4,
            PixelFormat::Rgb8 => 3,
            PixelFormat::Gray8 => 1,
        }
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame dimensions must be non-zero (got {width}x{height})")]
    EmptyDimensions { width: u32, height: u32 },

    #[error("frame buffer has {actual} bytes, expected {expected} for {width}x{height} {format:?}")]
    BufferSize {
        width: u32,
        height: u32,
        format: PixelFormat,
        expected: usize,
        actual: usize,
    },

    #[error("failed to load image {path}: {source}")]
    Image {
        path: String,
        #[source]
        source: image::ImageError,
    },
}

/// An owned image buffer in one of the supported pixel formats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    width: u32,
    height: u32,
    format: PixelFormat,
    data: Vec<u8>,
}

impl Frame {
    /// Wrap a raw, tightly packed buffer. The buffer length must match the dimensions exactly.
    pub fn new(width: u32, height: u32, format: PixelFormat, data: Vec<u8>) -> Result<Self, FrameError> {
        if width == 0 || height == 0 {
            return Err(FrameError::EmptyDimensions { width, height });
        }
        let expected = width as usize * height as usize * format.channels();
        if data.len() != expected {
            return Err(FrameError::BufferSize {
                width,
                height,
                format,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            format,
            data,
        })
    }

    /// Build a gray frame by evaluating `f(x, y)` for every pixel.
    pub fn from_fn(
        width: u32,
        height: u32,
        mut f: impl FnMut(u32, u32) -> u8,
    ) -> Result<Self, FrameError> {
        let mut data = Vec::with_capacity(width as usize * height as usize);
        for y in 0..height {
            for x in 0..width {
                data.push(f(x, y));
            }
        }
        Self::new(width, height, PixelFormat::Gray8, data)
    }

    /// Convert a decoded RGBA image.
    pub fn from_rgba_image(img: &image::RgbaImage) -> Result<Self, FrameError> {
        Self::new(
            img.width(),
            img.height(),
            PixelFormat::Rgba8,
            img.as_raw().clone(),
        )
    }

    /// Decode an image file (PNG) into an RGBA frame.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, FrameError> {
        let path_ref = path.as_ref();
        let img = image::open(path_ref).map_err(|source| FrameError::Image {
            path: path_ref.display().to_string(),
            source,
        })?;
        Self::from_rgba_image(&img.to_rgba8())
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Copy out a rectangular region. Returns `None` if the region is empty or leaves the frame.
    pub fn crop(&self, x: u32, y: u32, width: u32, height: u32) -> Option<Frame> {
        if width == 0
            || height == 0
            || x.checked_add(width)? > self.width
            || y.checked_add(height)? > self.height
        {
            return None;
        }
        let ch = self.format.channels();
        let stride = self.width as usize * ch;
        let mut data = Vec::with_capacity(width as usize * height as usize * ch);
        for row in y..y + height {
            let start = row as usize * stride + x as usize * ch;
            data.extend_from_slice(&self.data[start..start + width as usize * ch]);
        }
        Some(Frame {
            width,
            height,
            format: self.format,
            data,
        })
    }

    /// Reduce to a single luminosity channel (`0.299R + 0.587G + 0.114B`). Alpha is ignored.
    pub fn to_gray(&self) -> GrayBuffer {
        let data = match self.format {
            PixelFormat::Gray8 => self.data.clone(),
            PixelFormat::Rgb8 | PixelFormat::Rgba8 => self
                .data
                .chunks_exact(self.format.channels())
                .map(|px| luminosity(px[0], px[1], px[2]))
                .collect(),
        };
        GrayBuffer {
            width: self.width as usize,
            height: self.height as usize,
            data,
        }
    }
}

fn luminosity(r: u8, g: u8, b: u8) -> u8 {
    let l = LUMA_R * f64::from(r) + LUMA_G * f64::from(g) + LUMA_B * f64::from(b);
    l.round().clamp(0.0, 255.0) as u8
}

/// Single-channel 8-bit working buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrayBuffer {
    width: usize,
    height: usize,
    data: Vec<u8>,
}

impl GrayBuffer {
    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> u8 {
        self.data[y * self.width + x]
    }

    /// Row slice `[x, x + len)` of row `y`.
    #[inline]
    pub(crate) fn row(&self, x: usize, y: usize, len: usize) -> &[u8] {
        let start = y * self.width + x;
        &self.data[start..start + len]
    }

    /// Sobel gradient magnitude, `sqrt(gx² + gy²)` clamped to 255.
    ///
    /// Border pixels sample their nearest in-bounds neighbour, so a template cut from a frame
    /// only differs from the frame's own edge map along its outermost ring.
    pub fn sobel(&self) -> GrayBuffer {
        let (w, h) = (self.width as isize, self.height as isize);
        let at = |x: isize, y: isize| -> i32 {
            let cx = x.clamp(0, w - 1) as usize;
            let cy = y.clamp(0, h - 1) as usize;
            i32::from(self.get(cx, cy))
        };

        let mut data = Vec::with_capacity(self.data.len());
        for y in 0..h {
            for x in 0..w {
                let gx = (at(x + 1, y - 1) + 2 * at(x + 1, y) + at(x + 1, y + 1))
                    - (at(x - 1, y - 1) + 2 * at(x - 1, y) + at(x - 1, y + 1));
                let gy = (at(x - 1, y + 1) + 2 * at(x, y + 1) + at(x + 1, y + 1))
                    - (at(x - 1, y - 1) + 2 * at(x, y - 1) + at(x + 1, y - 1));
                let magnitude = f64::from(gx * gx + gy * gy).sqrt();
                data.push(magnitude.min(255.0) as u8);
            }
        }
        GrayBuffer {
            width: self.width,
            height: self.height,
            data,
        }
    }
}

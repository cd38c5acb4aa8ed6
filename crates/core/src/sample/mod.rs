//! Boundary between the scan pipeline and whatever supplies pixels.
//!
//! The host provides the scan geometry ([`FrameSource`]), the pixel reader
//! ([`ColumnSampler`]) and display callbacks ([`HostHooks`]). [`Raster`] is an
//! in-memory image that implements the first two.

use crate::{Color, ColorColumn, Result, SonifierError};

/// Columns the host renderer reads ahead of the requested rectangle.
///
/// Sampling at logical column `x` therefore requests `x - RASTER_READ_AHEAD`.
pub const RASTER_READ_AHEAD: i64 = 1;

/// Rectangle of pixels to read, in frame coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleRect {
    pub x: i64,
    pub y: i64,
    pub width: usize,
    pub height: usize,
}

/// Scan geometry provided by the host.
pub trait FrameSource: Send + Sync {
    /// Scan extent in pixels. Zero means the frame is momentarily empty.
    fn width(&self) -> usize;

    /// Rectangle covering the full height of the logical column `position`.
    fn column_rect(&self, position: i64) -> SampleRect;
}

/// Reads the colors inside a rectangle, top to bottom.
///
/// Implementations may return fewer rows than requested.
pub trait ColumnSampler: Send + Sync {
    fn sample(&self, rect: &SampleRect) -> Result<ColorColumn>;
}

/// Display callbacks invoked by the scan controller.
pub trait HostHooks: Send + Sync {
    /// The scan position changed or the scanline must be cleared.
    fn redraw(&self) {}

    /// The controller left idle; the host may enable what scanning needs.
    fn activated(&self) {}
}

/// Hooks that do nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHooks;

impl HostHooks for NoHooks {}

/// Shifts a logical column rectangle to the one that must be requested.
pub fn request_rect(rect: SampleRect) -> SampleRect {
    SampleRect {
        x: rect.x - RASTER_READ_AHEAD,
        ..rect
    }
}

/// Keeps at most `expected` rows.
pub fn clamp_column(mut column: ColorColumn, expected: usize) -> ColorColumn {
    column.truncate(expected.min(column.len()));
    column
}

/// Samples the logical column at `position`.
pub fn sample_column(
    frame: &dyn FrameSource,
    sampler: &dyn ColumnSampler,
    position: i64,
) -> Result<ColorColumn> {
    let rect = frame.column_rect(position);
    let column = sampler.sample(&request_rect(rect))?;
    if column.len() < rect.height {
        tracing::debug!(
            position,
            expected = rect.height,
            got = column.len(),
            "sampler returned a short column"
        );
    }
    Ok(clamp_column(column, rect.height))
}

/// Row-major in-memory image.
#[derive(Debug, Clone, PartialEq)]
pub struct Raster {
    width: usize,
    height: usize,
    pixels: Vec<Color>,
    read_ahead: i64,
}

impl Raster {
    pub fn from_pixels(width: usize, height: usize, pixels: Vec<Color>) -> Result<Self> {
        if pixels.len() != width * height {
            return Err(SonifierError::config(format!(
                "raster of {width}x{height} needs {} pixels, got {}",
                width * height,
                pixels.len()
            )));
        }
        Ok(Self {
            width,
            height,
            pixels,
            read_ahead: 0,
        })
    }

    /// Builds a raster by evaluating `f(x, y)` for every pixel.
    pub fn from_fn<F>(width: usize, height: usize, mut f: F) -> Self
    where
        F: FnMut(usize, usize) -> Color,
    {
        let mut pixels = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                pixels.push(f(x, y));
            }
        }
        Self {
            width,
            height,
            pixels,
            read_ahead: 0,
        }
    }

    /// Makes reads return the column `read_ahead` to the right of the
    /// requested one, the way the host renderer does.
    pub fn with_read_ahead(mut self, read_ahead: i64) -> Self {
        self.read_ahead = read_ahead;
        self
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn pixel(&self, x: usize, y: usize) -> Option<Color> {
        (x < self.width && y < self.height).then(|| self.pixels[y * self.width + x])
    }
}

impl FrameSource for Raster {
    fn width(&self) -> usize {
        self.width
    }

    fn column_rect(&self, position: i64) -> SampleRect {
        SampleRect {
            x: position,
            y: 0,
            width: 1,
            height: self.height,
        }
    }
}

impl ColumnSampler for Raster {
    fn sample(&self, rect: &SampleRect) -> Result<ColorColumn> {
        let x = rect.x + self.read_ahead;
        if x < 0 || x >= self.width as i64 {
            return Err(SonifierError::Sampling(format!(
                "column {x} outside raster of width {}",
                self.width
            )));
        }
        let top = rect.y.max(0) as usize;
        let bottom = (top + rect.height).min(self.height);
        Ok((top..bottom)
            .filter_map(|y| self.pixel(x as usize, y))
            .collect())
    }
}

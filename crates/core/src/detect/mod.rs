//! Run detection over a sampled column.
//!
//! A detector walks a [`ColorColumn`] once, finds every maximal run of rows
//! matching its predicate and reduces each run to play points, one list per
//! output channel. The height channel is `1 - mean_row / height`, so a run at
//! the top of the image maps close to 1.0.
//!
//! A run still open when the column ends is not flushed.

use serde::{Deserialize, Serialize};

use crate::{ColorColumn, ColorRange, Result, SonifierError};

/// Normalised [0, 1] summary of a detected run.
pub type PlayPoint = f32;

/// A matching run reduced to its averages.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Window {
    /// Mean index of the matching rows.
    pub mean_row: f32,
    /// Number of matching rows.
    pub size: usize,
    /// Mean x position reported by the predicate.
    pub x: f32,
    /// Mean y position reported by the predicate.
    pub y: f32,
}

/// Finds all closed runs of rows for which `matcher` returns a position.
pub fn scan_windows<F>(column: &ColorColumn, mut matcher: F) -> Vec<Window>
where
    F: FnMut(&crate::Color) -> Option<(f32, f32)>,
{
    let mut windows = Vec::new();
    let mut row_sum = 0usize;
    let mut x_sum = 0.0f32;
    let mut y_sum = 0.0f32;
    let mut size = 0usize;

    for (row, color) in column.iter().enumerate() {
        match matcher(color) {
            Some((x, y)) => {
                row_sum += row;
                x_sum += x;
                y_sum += y;
                size += 1;
            }
            None if size > 0 => {
                let n = size as f32;
                windows.push(Window {
                    mean_row: row_sum as f32 / n,
                    size,
                    x: x_sum / n,
                    y: y_sum / n,
                });
                row_sum = 0;
                x_sum = 0.0;
                y_sum = 0.0;
                size = 0;
            }
            None => {}
        }
    }

    windows
}

fn height_point(window: &Window, height: usize) -> PlayPoint {
    1.0 - window.mean_row / height as f32
}

/// Matches rows whose luma falls inside `[min_luma, max_luma]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LumaDetector {
    pub min_luma: f32,
    pub max_luma: f32,
}

impl LumaDetector {
    pub fn new(min_luma: f32, max_luma: f32) -> Result<Self> {
        let detector = Self { min_luma, max_luma };
        detector.validate()?;
        Ok(detector)
    }

    fn validate(&self) -> Result<()> {
        if self.min_luma.is_finite() && self.max_luma.is_finite() {
            Ok(())
        } else {
            Err(SonifierError::config("luma bounds must be finite"))
        }
    }

    /// Bounds in ascending order; inverted configurations are swapped.
    pub fn bounds(&self) -> (f32, f32) {
        if self.min_luma <= self.max_luma {
            (self.min_luma, self.max_luma)
        } else {
            (self.max_luma, self.min_luma)
        }
    }

    pub fn detect(&self, column: &ColorColumn) -> Vec<Vec<PlayPoint>> {
        let (lo, hi) = self.bounds();
        let height = column.len();
        let heights = scan_windows(column, |color| {
            let luma = color.luma();
            (lo..=hi).contains(&luma).then_some((0.0, 0.0))
        })
        .iter()
        .map(|w| height_point(w, height))
        .collect();
        vec![heights]
    }
}

/// Matches rows inside a [`ColorRange`] and reports height, x and y channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeDetector {
    pub range: ColorRange,
}

impl RangeDetector {
    pub fn new(range: ColorRange) -> Self {
        Self { range }
    }

    pub fn detect(&self, column: &ColorColumn) -> Vec<Vec<PlayPoint>> {
        let height = column.len();
        let windows = scan_windows(column, |color| self.range.in_range(color));

        let mut heights = Vec::with_capacity(windows.len());
        let mut xs = Vec::with_capacity(windows.len());
        let mut ys = Vec::with_capacity(windows.len());
        for window in &windows {
            heights.push(height_point(window, height));
            xs.push(window.x);
            ys.push(window.y);
        }
        vec![heights, xs, ys]
    }
}

/// The closed set of detector variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Detector {
    Luma(LumaDetector),
    ColorRange(RangeDetector),
}

impl Detector {
    /// Runs the window pass and returns one play point list per channel.
    pub fn detect(&self, column: &ColorColumn) -> Vec<Vec<PlayPoint>> {
        match self {
            Detector::Luma(d) => d.detect(column),
            Detector::ColorRange(d) => d.detect(column),
        }
    }

    /// Number of play point lists [`Detector::detect`] produces.
    pub fn channels(&self) -> usize {
        match self {
            Detector::Luma(_) => 1,
            Detector::ColorRange(_) => 3,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Detector::Luma(_) => "luma detector",
            Detector::ColorRange(_) => "color detector",
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Detector::Luma(d) => d.validate(),
            Detector::ColorRange(_) => Ok(()),
        }
    }
}

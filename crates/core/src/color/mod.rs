//! Color samples and the predicates that decide whether a color belongs to a
//! configured region of a color space.

use std::fmt;

use palette::{FromColor, Hsv, Srgb};
use serde::{Deserialize, Serialize};

use crate::{Result, SonifierError};

// HCY luma weights (Rec. 709).
const RED_LUMA: f32 = 0.2126;
const GREEN_LUMA: f32 = 0.7152;
const BLUE_LUMA: f32 = 0.0722;

/// Default tolerance around the reference axis target.
pub const DEFAULT_TARGET_DELTA: f32 = 0.01;

/// An RGB sample with components normalised to [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
}

impl Color {
    pub fn new(r: f32, g: f32, b: f32) -> Self {
        Self { r, g, b }
    }

    /// Builds a color from 8-bit channel values.
    pub fn from_rgb8(r: u8, g: u8, b: u8) -> Self {
        Self::new(r as f32 / 255.0, g as f32 / 255.0, b as f32 / 255.0)
    }

    pub fn black() -> Self {
        Self::new(0.0, 0.0, 0.0)
    }

    pub fn white() -> Self {
        Self::new(1.0, 1.0, 1.0)
    }

    pub fn rgb(&self) -> [f32; 3] {
        [self.r, self.g, self.b]
    }

    /// Hue, saturation and value, each in [0, 1].
    pub fn hsv(&self) -> [f32; 3] {
        let hsv: Hsv = Hsv::from_color(Srgb::new(self.r, self.g, self.b));
        let hue = hsv.hue.into_positive_degrees() / 360.0;
        [hue.rem_euclid(1.0), hsv.saturation, hsv.value]
    }

    pub fn luma(&self) -> f32 {
        RED_LUMA * self.r + GREEN_LUMA * self.g + BLUE_LUMA * self.b
    }
}

/// The colors revealed by the scanline at one step, ordered top to bottom.
pub type ColorColumn = Vec<Color>;

/// Three-component color model a [`ColorRange`] operates in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorSpace {
    Rgb,
    Hsv,
}

impl ColorSpace {
    pub fn axis_names(&self) -> [&'static str; 3] {
        match self {
            ColorSpace::Rgb => ["red", "green", "blue"],
            ColorSpace::Hsv => ["hue", "saturation", "value"],
        }
    }

    /// Looks up an axis by its name in this space (`hue`, `green`, ...).
    pub fn axis(&self, name: &str) -> Result<Axis> {
        let wanted = name.trim().to_ascii_lowercase();
        self.axis_names()
            .iter()
            .position(|n| *n == wanted)
            .map(|index| Axis(index as u8))
            .ok_or_else(|| {
                SonifierError::InvalidAxis(format!("unknown {self:?} axis `{name}`"))
            })
    }

    pub fn axis_name(&self, axis: Axis) -> &'static str {
        self.axis_names()[axis.index()]
    }

    pub fn components(&self, color: &Color) -> [f32; 3] {
        match self {
            ColorSpace::Rgb => color.rgb(),
            ColorSpace::Hsv => color.hsv(),
        }
    }
}

/// One of the three components of a color space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Axis(u8);

impl Axis {
    pub fn new(index: usize) -> Result<Self> {
        if index < 3 {
            Ok(Self(index as u8))
        } else {
            Err(SonifierError::InvalidAxis(format!("axis index {index} is not in 0..3")))
        }
    }

    pub fn index(&self) -> usize {
        self.0 as usize
    }

    /// The axis that is neither `self` nor `other`.
    fn remaining(self, other: Axis) -> Axis {
        Axis(3 - self.0 - other.0)
    }
}

/// Position of `val` inside the `[minv, maxv]` range as a fraction.
/// Inverted ranges are measured from the lower bound; empty ranges map to 0.
pub fn map_to_percent(minv: f32, maxv: f32, val: f32) -> f32 {
    if minv > maxv {
        (val - maxv) / (minv - maxv)
    } else if minv == maxv {
        0.0
    } else {
        (val - minv) / (maxv - minv)
    }
}

/// Value at fraction `pct` of the `[minv, maxv]` range, measured from the
/// lower bound even when the range is given inverted.
pub fn map_to_range(minv: f32, maxv: f32, pct: f32) -> f32 {
    if minv > maxv {
        maxv + pct * (minv - maxv)
    } else if minv == maxv {
        minv
    } else {
        minv + pct * (maxv - minv)
    }
}

/// A slice of a three-component color space.
///
/// The reference axis must sit within `delta` of `target`; the x and y axes
/// are bounded by inclusive intervals. The three axis roles always form a
/// permutation of the color components: y is whatever axis is left over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ColorRangeDef", into = "ColorRangeDef")]
pub struct ColorRange {
    space: ColorSpace,
    reference: Axis,
    target: f32,
    delta: f32,
    x_axis: Axis,
    x_range: (f32, f32),
    y_range: (f32, f32),
}

impl ColorRange {
    pub fn new(
        space: ColorSpace,
        reference: &str,
        target: f32,
        x_axis: &str,
        x_range: (f32, f32),
        y_range: (f32, f32),
        delta: f32,
    ) -> Result<Self> {
        let reference = space.axis(reference)?;
        let x_axis = space.axis(x_axis)?;
        if reference == x_axis {
            return Err(SonifierError::InvalidAxis(format!(
                "reference and x axis are both `{}`",
                space.axis_name(reference)
            )));
        }
        check_interval("x", x_range)?;
        check_interval("y", y_range)?;
        if !(delta.is_finite() && delta > 0.0) {
            return Err(SonifierError::config(format!("target delta {delta} must be positive")));
        }
        if !target.is_finite() {
            return Err(SonifierError::config("target must be finite"));
        }

        Ok(Self {
            space,
            reference,
            target,
            delta,
            x_axis,
            x_range,
            y_range,
        })
    }

    /// Shortcut for an HSV range with the default target tolerance.
    pub fn hsv(
        reference: &str,
        target: f32,
        x_axis: &str,
        x_range: (f32, f32),
        y_range: (f32, f32),
    ) -> Result<Self> {
        Self::new(ColorSpace::Hsv, reference, target, x_axis, x_range, y_range, DEFAULT_TARGET_DELTA)
    }

    /// Shortcut for an RGB range with the default target tolerance.
    pub fn rgb(
        reference: &str,
        target: f32,
        x_axis: &str,
        x_range: (f32, f32),
        y_range: (f32, f32),
    ) -> Result<Self> {
        Self::new(ColorSpace::Rgb, reference, target, x_axis, x_range, y_range, DEFAULT_TARGET_DELTA)
    }

    pub fn space(&self) -> ColorSpace {
        self.space
    }

    pub fn reference(&self) -> Axis {
        self.reference
    }

    pub fn x_axis(&self) -> Axis {
        self.x_axis
    }

    pub fn y_axis(&self) -> Axis {
        self.reference.remaining(self.x_axis)
    }

    /// Moves the reference role to `axis`. If `axis` was the x axis, x takes
    /// over the old reference axis.
    pub fn set_reference(&mut self, axis: Axis) {
        if axis == self.x_axis {
            self.x_axis = self.reference;
        }
        self.reference = axis;
    }

    /// Moves the x role to `axis`. If `axis` was the reference axis, the
    /// reference takes over the old x axis.
    pub fn set_x_axis(&mut self, axis: Axis) {
        if axis == self.reference {
            self.reference = self.x_axis;
        }
        self.x_axis = axis;
    }

    /// Returns the x and y positions of a matching color within their ranges,
    /// or `None` when the color falls outside the slice.
    pub fn in_range(&self, color: &Color) -> Option<(f32, f32)> {
        let components = self.space.components(color);
        let reference = components[self.reference.index()];
        let x = components[self.x_axis.index()];
        let y = components[self.y_axis().index()];

        let (x_min, x_max) = self.x_range;
        let (y_min, y_max) = self.y_range;
        if (reference - self.target).abs() < self.delta
            && (x_min..=x_max).contains(&x)
            && (y_min..=y_max).contains(&y)
        {
            Some((map_to_percent(x_min, x_max, x), map_to_percent(y_min, y_max, y)))
        } else {
            None
        }
    }
}

impl Default for ColorRange {
    /// Saturated mid-value reds in HSV.
    fn default() -> Self {
        Self {
            space: ColorSpace::Hsv,
            reference: Axis(0),
            target: 0.0,
            delta: DEFAULT_TARGET_DELTA,
            x_axis: Axis(1),
            x_range: (0.8, 1.0),
            y_range: (0.4, 0.6),
        }
    }
}

fn check_interval(name: &str, (min, max): (f32, f32)) -> Result<()> {
    if !(min.is_finite() && max.is_finite()) || min > max {
        return Err(SonifierError::config(format!("{name} range {min}~{max} is not a valid interval")));
    }
    Ok(())
}

impl fmt::Display for ColorRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = |axis| self.space.axis_name(axis);
        write!(
            f,
            "{}: {} (D: {}), {}: {}~{}, {}: {}~{}",
            name(self.reference),
            self.target,
            self.delta,
            name(self.x_axis),
            self.x_range.0,
            self.x_range.1,
            name(self.y_axis()),
            self.y_range.0,
            self.y_range.1
        )
    }
}

/// Serialized form of a [`ColorRange`], with axes given by name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColorRangeDef {
    pub space: ColorSpace,
    pub reference: String,
    pub target: f32,
    #[serde(default = "default_delta")]
    pub delta: f32,
    pub x_axis: String,
    pub x_range: (f32, f32),
    pub y_range: (f32, f32),
}

fn default_delta() -> f32 {
    DEFAULT_TARGET_DELTA
}

impl TryFrom<ColorRangeDef> for ColorRange {
    type Error = SonifierError;

    fn try_from(def: ColorRangeDef) -> Result<Self> {
        ColorRange::new(
            def.space,
            &def.reference,
            def.target,
            &def.x_axis,
            def.x_range,
            def.y_range,
            def.delta,
        )
    }
}

impl From<ColorRange> for ColorRangeDef {
    fn from(range: ColorRange) -> Self {
        ColorRangeDef {
            space: range.space,
            reference: range.space.axis_name(range.reference).to_string(),
            target: range.target,
            delta: range.delta,
            x_axis: range.space.axis_name(range.x_axis).to_string(),
            x_range: range.x_range,
            y_range: range.y_range,
        }
    }
}

//! Event renderers turn play points into concrete musical events.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{
    color::map_to_range, error::midi_value, ControlValue, Event, Note, PlayPoint, Result,
    SonifierError,
};

/// An ordered list of semitone offsets from the tonic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ScaleDef", into = "ScaleDef")]
pub struct Scale {
    name: Option<String>,
    steps: Vec<u8>,
}

const PRESETS: [(&str, &[u8]); 5] = [
    ("minor pentatonic", &[0, 3, 5, 7, 10]),
    ("major pentatonic", &[0, 2, 4, 7, 9]),
    ("major", &[0, 2, 4, 5, 7, 9, 11]),
    ("minor natural", &[0, 2, 3, 5, 7, 8, 10]),
    ("minor harmonic", &[0, 2, 3, 5, 7, 8, 11]),
];

impl Scale {
    /// A custom scale. Offsets must be non-empty and below one octave.
    pub fn custom(steps: Vec<u8>) -> Result<Self> {
        if steps.is_empty() {
            return Err(SonifierError::config("scale needs at least one step"));
        }
        if let Some(step) = steps.iter().find(|s| **s >= 12) {
            return Err(SonifierError::config(format!("scale step {step} exceeds an octave")));
        }
        Ok(Self { name: None, steps })
    }

    /// One of the built-in scales, by name.
    pub fn named(name: &str) -> Result<Self> {
        let wanted = name.trim().to_ascii_lowercase();
        PRESETS
            .iter()
            .find(|(n, _)| *n == wanted)
            .map(|(n, steps)| Self {
                name: Some(n.to_string()),
                steps: steps.to_vec(),
            })
            .ok_or_else(|| SonifierError::config(format!("unknown scale `{name}`")))
    }

    pub fn preset_names() -> impl Iterator<Item = &'static str> {
        PRESETS.iter().map(|(n, _)| *n)
    }

    fn preset(index: usize) -> Self {
        let (name, steps) = PRESETS[index];
        Self {
            name: Some(name.to_string()),
            steps: steps.to_vec(),
        }
    }

    pub fn minor_pentatonic() -> Self {
        Self::preset(0)
    }

    pub fn major_pentatonic() -> Self {
        Self::preset(1)
    }

    pub fn major() -> Self {
        Self::preset(2)
    }

    pub fn steps(&self) -> &[u8] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl FromStr for Scale {
    type Err = SonifierError;

    fn from_str(s: &str) -> Result<Self> {
        Scale::named(s)
    }
}

impl fmt::Display for Scale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => f.write_str(name),
            None => write!(f, "custom {:?}", self.steps),
        }
    }
}

/// Serialized form of a [`Scale`]: a preset name or a list of offsets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScaleDef {
    Named(String),
    Custom(Vec<u8>),
}

impl TryFrom<ScaleDef> for Scale {
    type Error = SonifierError;

    fn try_from(def: ScaleDef) -> Result<Self> {
        match def {
            ScaleDef::Named(name) => Scale::named(&name),
            ScaleDef::Custom(steps) => Scale::custom(steps),
        }
    }
}

impl From<Scale> for ScaleDef {
    fn from(scale: Scale) -> Self {
        match scale.name {
            Some(name) => ScaleDef::Named(name),
            None => ScaleDef::Custom(scale.steps),
        }
    }
}

/// Linear map from [0, 1] onto a pitch range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChromaticRenderer {
    pub min_note: Note,
    pub max_note: Note,
}

impl ChromaticRenderer {
    pub fn new(min_note: Note, max_note: Note) -> Self {
        Self { min_note, max_note }
    }

    pub fn render_point(&self, pct: PlayPoint) -> Event {
        let span = self.max_note.pitch() as f32 - self.min_note.pitch() as f32;
        let offset = (clamp_pct(pct) * span) as i32;
        Event::with_notes([self.min_note.transpose(offset)])
    }
}

/// Quantises [0, 1] onto the degrees of a scale spanning several octaves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "DiatonicDef", into = "DiatonicDef")]
pub struct DiatonicRenderer {
    pub(crate) fundamental: Note,
    pub(crate) octaves: u8,
    pub(crate) scale: Scale,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DiatonicDef {
    fundamental: Note,
    octaves: u8,
    scale: Scale,
}

impl TryFrom<DiatonicDef> for DiatonicRenderer {
    type Error = SonifierError;

    fn try_from(def: DiatonicDef) -> Result<Self> {
        DiatonicRenderer::new(def.fundamental, def.octaves, def.scale)
    }
}

impl From<DiatonicRenderer> for DiatonicDef {
    fn from(r: DiatonicRenderer) -> Self {
        DiatonicDef {
            fundamental: r.fundamental,
            octaves: r.octaves,
            scale: r.scale,
        }
    }
}

impl DiatonicRenderer {
    pub fn new(fundamental: Note, octaves: u8, scale: Scale) -> Result<Self> {
        let renderer = Self {
            fundamental,
            octaves,
            scale,
        };
        renderer.validate()?;
        Ok(renderer)
    }

    pub fn fundamental(&self) -> Note {
        self.fundamental
    }

    pub fn octaves(&self) -> u8 {
        self.octaves
    }

    pub fn scale(&self) -> &Scale {
        &self.scale
    }

    fn validate(&self) -> Result<()> {
        if !(1..=16).contains(&self.octaves) {
            return Err(SonifierError::config(format!(
                "octave range {} is not in 1..=16",
                self.octaves
            )));
        }
        if self.scale.is_empty() {
            return Err(SonifierError::config("scale needs at least one step"));
        }
        Ok(())
    }

    pub fn render_point(&self, pct: PlayPoint) -> Event {
        let len = self.scale.len().max(1);
        let degrees = (self.octaves as usize * len).saturating_sub(1);
        let index = (clamp_pct(pct) * degrees as f32).round() as usize;
        let step = self.scale.steps().get(index % len).copied().unwrap_or(0) as i32;
        let octave = (index / len) as i32 * 12;
        Event::with_notes([self.fundamental.transpose(step + octave)])
    }
}

/// Linear map from [0, 1] onto the values of one controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlChangeRenderer {
    pub control: u8,
    pub min_value: u8,
    pub max_value: u8,
}

impl ControlChangeRenderer {
    pub fn new(control: i64, min_value: i64, max_value: i64) -> Result<Self> {
        Ok(Self {
            control: midi_value("control", control)?,
            min_value: midi_value("control value", min_value)?,
            max_value: midi_value("control value", max_value)?,
        })
    }

    fn validate(&self) -> Result<()> {
        Self::new(self.control as i64, self.min_value as i64, self.max_value as i64).map(|_| ())
    }

    pub fn render_point(&self, pct: PlayPoint) -> Event {
        let value = map_to_range(self.min_value as f32, self.max_value as f32, clamp_pct(pct));
        Event::with_controls([ControlValue::saturating(self.control, value as i64)])
    }
}

fn clamp_pct(pct: PlayPoint) -> f32 {
    if pct.is_nan() {
        0.0
    } else {
        pct.clamp(0.0, 1.0)
    }
}

/// The closed set of renderer variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Renderer {
    Chromatic(ChromaticRenderer),
    Diatonic(DiatonicRenderer),
    ControlChange(ControlChangeRenderer),
}

impl Renderer {
    /// Renders a single play point.
    pub fn render_point(&self, pct: PlayPoint) -> Event {
        match self {
            Renderer::Chromatic(r) => r.render_point(pct),
            Renderer::Diatonic(r) => r.render_point(pct),
            Renderer::ControlChange(r) => r.render_point(pct),
        }
    }

    /// Renders a batch of play points and merges the results.
    pub fn render(&self, points: &[PlayPoint]) -> Event {
        points.iter().fold(Event::new(), |mut event, pct| {
            event.merge(self.render_point(*pct));
            event
        })
    }

    /// Re-checks invariants of a renderer built through deserialization.
    pub fn validate(&self) -> Result<()> {
        match self {
            Renderer::Chromatic(_) => Ok(()),
            Renderer::Diatonic(r) => r.validate(),
            Renderer::ControlChange(r) => r.validate(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(s: &str) -> Note {
        s.parse().unwrap()
    }

    fn pitches(event: &Event) -> Vec<u8> {
        event.notes.iter().map(Note::pitch).collect()
    }

    #[test]
    fn diatonic_spans_one_octave_of_major() {
        let r = DiatonicRenderer::new(note("C2"), 1, Scale::major()).unwrap();
        assert_eq!(r.render_point(0.0).notes.into_iter().next(), Some(note("C2")));
        assert_eq!(r.render_point(1.0).notes.into_iter().next(), Some(note("B2")));
        assert_eq!(pitches(&r.render_point(0.5)), vec![note("F2").pitch()]);
    }

    #[test]
    fn diatonic_climbs_octaves() {
        let scale = Scale::named("minor pentatonic").unwrap();
        let r = DiatonicRenderer::new(note("A1"), 3, scale).unwrap();
        assert_eq!(pitches(&r.render_point(1.0)), vec![note("G4").pitch()]);
        // index 5 is the tonic one octave up
        assert_eq!(pitches(&r.render_point(5.0 / 14.0)), vec![note("A2").pitch()]);
    }

    #[test]
    fn diatonic_clamps_at_the_top_of_the_midi_range() {
        let r = DiatonicRenderer::new(note("C8"), 4, Scale::major()).unwrap();
        let top = r.render_point(1.0).notes.into_iter().next().unwrap();
        assert_eq!((top.pitch(), top.bend()), (127, 0));
    }

    #[test]
    fn diatonic_without_octaves_is_rejected() {
        let json = r#"{"kind":"diatonic","fundamental":"C2","octaves":0,"scale":"major"}"#;
        assert!(serde_json::from_str::<Renderer>(json).is_err());

        let json = r#"{"kind":"diatonic","fundamental":"C2","octaves":17,"scale":"major"}"#;
        assert!(serde_json::from_str::<Renderer>(json).is_err());

        // a zero span built inside the crate still renders the tonic
        let r = DiatonicRenderer {
            fundamental: note("C2"),
            octaves: 0,
            scale: Scale::major(),
        };
        assert!(r.validate().is_err());
        assert_eq!(pitches(&r.render_point(0.5)), vec![note("C2").pitch()]);
    }

    #[test]
    fn chromatic_maps_linearly() {
        let r = Renderer::Chromatic(ChromaticRenderer::new(note("C3"), note("C5")));
        assert_eq!(pitches(&r.render_point(0.0)), vec![48]);
        assert_eq!(pitches(&r.render_point(0.5)), vec![60]);
        assert_eq!(pitches(&r.render_point(1.0)), vec![72]);
        assert_eq!(pitches(&r.render_point(7.0)), vec![72]);
    }

    #[test]
    fn control_change_maps_onto_value_range() {
        let r = ControlChangeRenderer::new(7, 20, 120).unwrap();
        let event = r.render_point(0.5);
        let cv = event.controls.iter().next().unwrap();
        assert_eq!((cv.control(), cv.value()), (7, 70));
        assert!(ControlChangeRenderer::new(128, 0, 127).is_err());
    }

    #[test]
    fn batches_merge_into_one_event() {
        let r = Renderer::Chromatic(ChromaticRenderer::new(note("C3"), note("C5")));
        let event = r.render(&[0.0, 0.5, 0.5, 1.0]);
        assert_eq!(pitches(&event), vec![48, 60, 72]);
        assert!(r.render(&[]).is_empty());
    }

    #[test]
    fn scales_parse_and_validate() {
        assert_eq!("Major".parse::<Scale>().unwrap(), Scale::major());
        assert!(Scale::named("lydian dominant").is_err());
        assert!(Scale::custom(vec![]).is_err());
        assert!(Scale::custom(vec![0, 12]).is_err());
        assert_eq!(Scale::preset_names().count(), 5);
        assert!(DiatonicRenderer::new(note("C2"), 0, Scale::major()).is_err());
    }

    #[test]
    fn renderers_deserialize_from_tagged_json() {
        let json = r#"{"kind":"diatonic","fundamental":"C2","octaves":5,"scale":"major pentatonic"}"#;
        let renderer: Renderer = serde_json::from_str(json).unwrap();
        renderer.validate().unwrap();

        let json = r#"{"kind":"diatonic","fundamental":"C2","octaves":1,"scale":[0,1,2]}"#;
        let renderer: Renderer = serde_json::from_str(json).unwrap();
        assert_eq!(renderer.render_point(1.0).notes.len(), 1);

        let json = r#"{"kind":"control_change","control":9,"min_value":0,"max_value":200}"#;
        let renderer: Renderer = serde_json::from_str(json).unwrap();
        assert!(renderer.validate().is_err());
    }
}

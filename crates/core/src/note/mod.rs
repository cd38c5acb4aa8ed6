//! Musical value objects exchanged between renderers and players.
//!
//! A [`Note`] is a MIDI pitch refined by a sub-semitone bend and carrying a
//! velocity. An [`Event`] bundles the notes, controller values and optional
//! program change produced for one scan step.

use std::{collections::BTreeSet, fmt, ops, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{error::midi_value, Result, SonifierError};

/// Velocity used when a note definition does not specify one.
pub const DEFAULT_VELOCITY: u8 = 127;

/// Number of bend steps that make up one semitone when composing notes.
const BEND_CARRY: i32 = 127;

/// MIDI note 0 is C in this octave.
const BASE_OCTAVE: i32 = -1;

const SHARP_NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

/// A MIDI note with sub-semitone bend and velocity.
///
/// Ordering is lexicographic over (pitch, bend, velocity), so the derived
/// `Ord` gives the priority order used by mono players.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Note {
    pitch: u8,
    bend: u8,
    velocity: u8,
}

impl Note {
    /// Creates a note, rejecting any component outside 0..=127.
    pub fn new(pitch: i64, bend: i64, velocity: i64) -> Result<Self> {
        Ok(Self {
            pitch: midi_value("note", pitch)?,
            bend: midi_value("bend", bend)?,
            velocity: midi_value("velocity", velocity)?,
        })
    }

    /// Creates an unbent note at full velocity.
    pub fn from_pitch(pitch: i64) -> Result<Self> {
        Self::new(pitch, 0, DEFAULT_VELOCITY as i64)
    }

    /// Unbent full-velocity note, clamping `pitch` to the MIDI range.
    pub fn saturating(pitch: u8) -> Self {
        Self {
            pitch: pitch.min(127),
            bend: 0,
            velocity: DEFAULT_VELOCITY,
        }
    }

    /// Finds the note (and bend) closest below the given frequency in Hz.
    pub fn from_frequency(freq: f64) -> Result<Self> {
        if !(freq.is_finite() && freq > 0.0) {
            return Err(SonifierError::InvalidNote(format!("{freq} Hz")));
        }
        let semitones = 12.0 * (freq / 440.0).log2() + 69.0;
        let pitch = semitones.floor();
        let bend = ((semitones - pitch) * 128.0).floor().min(127.0);
        Self::new(pitch as i64, bend as i64, DEFAULT_VELOCITY as i64)
    }

    pub fn pitch(&self) -> u8 {
        self.pitch
    }

    pub fn bend(&self) -> u8 {
        self.bend
    }

    pub fn velocity(&self) -> u8 {
        self.velocity
    }

    /// Returns a copy of this note played at another velocity.
    pub fn with_velocity(self, velocity: i64) -> Result<Self> {
        Ok(Self {
            velocity: midi_value("velocity", velocity)?,
            ..self
        })
    }

    /// Moves the note by whole semitones, clamping the pitch at both ends of
    /// the MIDI range. The bend is kept.
    pub fn transpose(self, semitones: i32) -> Self {
        Self {
            pitch: (self.pitch as i32 + semitones).clamp(0, 127) as u8,
            ..self
        }
    }

    /// Frequency in Hz, including the bend.
    pub fn freq(&self) -> f64 {
        let base = 440.0 * 2f64.powf((self.pitch as f64 - 69.0) / 12.0);
        base * 2f64.powf(self.bend as f64 / (12.0 * 128.0))
    }

    fn compose(mut pitch: i32, mut bend: i32, velocity: u8) -> Self {
        if bend >= BEND_CARRY {
            pitch += 1;
            bend -= BEND_CARRY;
        } else if bend < 0 {
            pitch -= 1;
            bend += BEND_CARRY;
        }

        let (pitch, bend) = if pitch > 127 {
            (127, 127)
        } else if pitch < 0 {
            (0, 0)
        } else {
            (pitch, bend.clamp(0, 127))
        };

        Self {
            pitch: pitch as u8,
            bend: bend as u8,
            velocity,
        }
    }
}

impl ops::Add for Note {
    type Output = Note;

    fn add(self, rhs: Note) -> Note {
        Note::compose(
            self.pitch as i32 + rhs.pitch as i32,
            self.bend as i32 + rhs.bend as i32,
            self.velocity,
        )
    }
}

impl ops::Sub for Note {
    type Output = Note;

    fn sub(self, rhs: Note) -> Note {
        Note::compose(
            self.pitch as i32 - rhs.pitch as i32,
            self.bend as i32 - rhs.bend as i32,
            self.velocity,
        )
    }
}

impl fmt::Display for Note {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = SHARP_NAMES[self.pitch as usize % 12];
        let octave = self.pitch as i32 / 12 + BASE_OCTAVE;
        write!(f, "{name}{octave}")?;
        if self.bend != 0 {
            write!(f, "+{}", self.bend)?;
        }
        if self.velocity != DEFAULT_VELOCITY {
            write!(f, "%{}", self.velocity)?;
        }
        Ok(())
    }
}

impl FromStr for Note {
    type Err = SonifierError;

    /// Parses `<Letter>[#|b]<octave>[+<bend>][%<velocity>]`, e.g. `A4`, `Db2+32`, `C#4+12%100`.
    fn from_str(s: &str) -> Result<Self> {
        let def = s.trim();
        let invalid = || SonifierError::InvalidNote(s.to_string());

        let mut chars = def.chars();
        let letter = chars.next().ok_or_else(invalid)?.to_ascii_uppercase();
        let natural = match letter {
            'C' => 0,
            'D' => 2,
            'E' => 4,
            'F' => 5,
            'G' => 7,
            'A' => 9,
            'B' => 11,
            _ => return Err(invalid()),
        };

        let mut rest = chars.as_str();
        let semitone = match rest.chars().next() {
            Some('#') if !matches!(letter, 'E' | 'B') => {
                rest = &rest[1..];
                natural + 1
            }
            Some('b' | 'B') if !matches!(letter, 'C' | 'F') => {
                rest = &rest[1..];
                natural - 1
            }
            Some('#' | 'b' | 'B') => return Err(invalid()),
            _ => natural,
        };

        let (rest, velocity) = match rest.split_once('%') {
            Some((head, velocity)) => (head, velocity.parse::<i64>().map_err(|_| invalid())?),
            None => (rest, DEFAULT_VELOCITY as i64),
        };
        let (octave, bend) = match rest.split_once('+') {
            Some((octave, bend)) => (octave, bend.parse::<i64>().map_err(|_| invalid())?),
            None => (rest, 0),
        };
        let octave = octave.parse::<i64>().map_err(|_| invalid())?;

        let pitch = semitone as i64 + (octave - BASE_OCTAVE as i64) * 12;
        Note::new(pitch, bend, velocity)
    }
}

impl TryFrom<String> for Note {
    type Error = SonifierError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Note> for String {
    fn from(note: Note) -> Self {
        note.to_string()
    }
}

/// A controller number paired with its 7-bit value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ControlValue {
    control: u8,
    value: u8,
}

impl ControlValue {
    pub fn new(control: i64, value: i64) -> Result<Self> {
        Ok(Self {
            control: midi_value("control", control)?,
            value: midi_value("control value", value)?,
        })
    }

    /// Builds a control value from already-mapped numbers, clamping into range.
    pub(crate) fn saturating(control: u8, value: i64) -> Self {
        Self {
            control: control.min(127),
            value: value.clamp(0, 127) as u8,
        }
    }

    pub fn control(&self) -> u8 {
        self.control
    }

    pub fn value(&self) -> u8 {
        self.value
    }
}

impl fmt::Display for ControlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}>{}", self.control, self.value)
    }
}

impl FromStr for ControlValue {
    type Err = SonifierError;

    /// Parses the `<CC>Value` form, e.g. `<7>100`.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || {
            SonifierError::config(format!(
                "{s} is not a valid control change (expected '<CC>Value')"
            ))
        };
        let body = s.trim().strip_prefix('<').ok_or_else(invalid)?;
        let (control, value) = body.split_once('>').ok_or_else(invalid)?;
        let control = control.parse::<i64>().map_err(|_| invalid())?;
        let value = value.parse::<i64>().map_err(|_| invalid())?;
        ControlValue::new(control, value)
    }
}

/// A MIDI program change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProgramChange(u8);

impl ProgramChange {
    pub fn new(program: i64) -> Result<Self> {
        Ok(Self(midi_value("program", program)?))
    }

    pub fn program(&self) -> u8 {
        self.0
    }
}

impl fmt::Display for ProgramChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ProgramChange {
    type Err = SonifierError;

    fn from_str(s: &str) -> Result<Self> {
        let program = s
            .trim()
            .parse::<i64>()
            .map_err(|_| SonifierError::config(format!("{s} is not a valid program number")))?;
        ProgramChange::new(program)
    }
}

/// Output produced for one scan step: notes, controller values and an
/// optional program change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Event {
    pub notes: BTreeSet<Note>,
    pub controls: BTreeSet<ControlValue>,
    pub program: Option<ProgramChange>,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_notes(notes: impl IntoIterator<Item = Note>) -> Self {
        Self {
            notes: notes.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn with_controls(controls: impl IntoIterator<Item = ControlValue>) -> Self {
        Self {
            controls: controls.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn with_program(program: ProgramChange) -> Self {
        Self {
            program: Some(program),
            ..Self::default()
        }
    }

    /// Unions notes and controls; keeps this event's program change if set.
    pub fn merge(&mut self, other: Event) {
        self.notes.extend(other.notes);
        self.controls.extend(other.controls);
        if self.program.is_none() {
            self.program = other.program;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty() && self.controls.is_empty() && self.program.is_none()
    }
}

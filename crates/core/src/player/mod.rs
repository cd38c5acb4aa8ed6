//! Event players keep track of what is sounding and forward only changes.
//!
//! A [`Player`] diffs each incoming [`Event`] against the notes it holds, the
//! last value sent per controller and the last program, then calls its
//! [`OutputSink`] with the deltas. Sinks are interchangeable: [`LogSink`]
//! reports through `tracing`, [`midi::MidiSink`] talks to a MIDI port.

pub mod midi;

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::{ControlValue, Event, Note, ProgramChange, Result};

pub use midi::{MidiRegistry, MidiSink};

/// Destination for the deltas computed by a [`Player`].
pub trait OutputSink: Send {
    fn notes_on(&mut self, notes: &BTreeSet<Note>) -> Result<()>;
    fn notes_off(&mut self, notes: &BTreeSet<Note>) -> Result<()>;
    fn send_cc(&mut self, control: ControlValue) -> Result<()>;
    fn send_pc(&mut self, program: ProgramChange) -> Result<()>;
}

/// Which note a mono player keeps when several arrive together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Low,
}

/// Polyphony of a player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum Voicing {
    #[default]
    Poly,
    Mono { priority: Priority },
}

impl Voicing {
    fn collapse(&self, notes: &BTreeSet<Note>) -> BTreeSet<Note> {
        match self {
            Voicing::Poly => notes.clone(),
            Voicing::Mono { priority } => {
                let pick = match priority {
                    Priority::High => notes.last(),
                    Priority::Low => notes.first(),
                };
                pick.copied().into_iter().collect()
            }
        }
    }
}

/// Diffing front end for an [`OutputSink`].
pub struct Player {
    voicing: Voicing,
    active: BTreeSet<Note>,
    last_cc: HashMap<u8, u8>,
    last_program: Option<ProgramChange>,
    sink: Box<dyn OutputSink>,
}

impl Player {
    pub fn new(voicing: Voicing, sink: Box<dyn OutputSink>) -> Self {
        Self {
            voicing,
            active: BTreeSet::new(),
            last_cc: HashMap::new(),
            last_program: None,
            sink,
        }
    }

    pub fn poly(sink: Box<dyn OutputSink>) -> Self {
        Self::new(Voicing::Poly, sink)
    }

    pub fn mono(priority: Priority, sink: Box<dyn OutputSink>) -> Self {
        Self::new(Voicing::Mono { priority }, sink)
    }

    pub fn voicing(&self) -> Voicing {
        self.voicing
    }

    /// Notes currently sounding.
    pub fn active(&self) -> &BTreeSet<Note> {
        &self.active
    }

    /// Applies one event: stops vanished notes, starts new ones, then sends
    /// controller and program changes that differ from what was last sent.
    pub fn play(&mut self, event: &Event) -> Result<()> {
        let incoming = self.voicing.collapse(&event.notes);
        let to_stop: BTreeSet<Note> = self.active.difference(&incoming).copied().collect();
        let to_start: BTreeSet<Note> = incoming.difference(&self.active).copied().collect();

        if !to_stop.is_empty() {
            self.sink.notes_off(&to_stop)?;
            self.active.retain(|n| !to_stop.contains(n));
        }
        if !to_start.is_empty() {
            self.sink.notes_on(&to_start)?;
            self.active.extend(to_start);
        }

        for control in &event.controls {
            if self.last_cc.get(&control.control()) != Some(&control.value()) {
                self.sink.send_cc(*control)?;
                self.last_cc.insert(control.control(), control.value());
            }
        }

        if let Some(program) = event.program {
            if self.last_program != Some(program) {
                self.sink.send_pc(program)?;
                self.last_program = Some(program);
            }
        }
        Ok(())
    }

    /// Turns off every active note and forgets controller history so the
    /// next event re-sends its values.
    pub fn stop(&mut self) -> Result<()> {
        self.last_cc.clear();
        self.last_program = None;
        if self.active.is_empty() {
            return Ok(());
        }
        let notes = std::mem::take(&mut self.active);
        self.sink.notes_off(&notes)
    }
}

impl std::fmt::Debug for Player {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Player")
            .field("voicing", &self.voicing)
            .field("active", &self.active)
            .finish()
    }
}

fn note_list(notes: &BTreeSet<Note>) -> String {
    notes.iter().map(Note::to_string).collect::<Vec<_>>().join(" ")
}

/// Sink that reports every call through `tracing`.
#[derive(Debug, Clone)]
pub struct LogSink {
    name: String,
}

impl LogSink {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl OutputSink for LogSink {
    fn notes_on(&mut self, notes: &BTreeSet<Note>) -> Result<()> {
        tracing::info!(sink = %self.name, notes = %note_list(notes), "notes on");
        Ok(())
    }

    fn notes_off(&mut self, notes: &BTreeSet<Note>) -> Result<()> {
        tracing::info!(sink = %self.name, notes = %note_list(notes), "notes off");
        Ok(())
    }

    fn send_cc(&mut self, control: ControlValue) -> Result<()> {
        tracing::info!(sink = %self.name, %control, "control change");
        Ok(())
    }

    fn send_pc(&mut self, program: ProgramChange) -> Result<()> {
        tracing::info!(sink = %self.name, %program, "program change");
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{RecordingSink, SinkCall};
    use super::*;

    fn notes(defs: &[&str]) -> BTreeSet<Note> {
        defs.iter().map(|d| d.parse().unwrap()).collect()
    }

    fn event(defs: &[&str]) -> Event {
        Event::with_notes(notes(defs))
    }

    fn recorded(voicing: Voicing) -> (Player, RecordingSink) {
        let sink = RecordingSink::default();
        (Player::new(voicing, Box::new(sink.clone())), sink)
    }

    #[test]
    fn only_deltas_reach_the_sink() {
        let (mut player, sink) = recorded(Voicing::Poly);
        player.play(&event(&["A4"])).unwrap();
        assert_eq!(sink.take(), vec![SinkCall::On(notes(&["A4"]))]);

        player.play(&event(&["A4", "C5"])).unwrap();
        assert_eq!(sink.take(), vec![SinkCall::On(notes(&["C5"]))]);

        player.play(&event(&[])).unwrap();
        assert_eq!(sink.take(), vec![SinkCall::Off(notes(&["A4", "C5"]))]);
        assert!(player.active().is_empty());
    }

    #[test]
    fn notes_off_precede_notes_on() {
        let (mut player, sink) = recorded(Voicing::Poly);
        player.play(&event(&["C4", "E4"])).unwrap();
        sink.take();

        player.play(&event(&["E4", "G4"])).unwrap();
        assert_eq!(
            sink.take(),
            vec![SinkCall::Off(notes(&["C4"])), SinkCall::On(notes(&["G4"]))]
        );
        assert_eq!(player.active(), &notes(&["E4", "G4"]));
    }

    #[test]
    fn mono_keeps_the_prioritised_note() {
        let (mut high, high_sink) = recorded(Voicing::Mono {
            priority: Priority::High,
        });
        high.play(&event(&["C4", "E4", "G4"])).unwrap();
        assert_eq!(high_sink.take(), vec![SinkCall::On(notes(&["G4"]))]);

        let (mut low, low_sink) = recorded(Voicing::Mono {
            priority: Priority::Low,
        });
        low.play(&event(&["C4", "E4", "G4"])).unwrap();
        assert_eq!(low_sink.take(), vec![SinkCall::On(notes(&["C4"]))]);

        low.play(&event(&["B3", "C4"])).unwrap();
        assert_eq!(
            low_sink.take(),
            vec![SinkCall::Off(notes(&["C4"])), SinkCall::On(notes(&["B3"]))]
        );
    }

    #[test]
    fn controls_are_sent_when_new_or_changed() {
        let (mut player, sink) = recorded(Voicing::Poly);
        let cc = |c, v| ControlValue::new(c, v).unwrap();

        player.play(&Event::with_controls([cc(7, 10), cc(9, 0)])).unwrap();
        player.play(&Event::with_controls([cc(7, 10), cc(9, 1)])).unwrap();
        assert_eq!(
            sink.take(),
            vec![
                SinkCall::Cc(cc(7, 10)),
                SinkCall::Cc(cc(9, 0)),
                SinkCall::Cc(cc(9, 1)),
            ]
        );
    }

    #[test]
    fn program_changes_are_deduplicated() {
        let (mut player, sink) = recorded(Voicing::Poly);
        let pc = ProgramChange::new(5).unwrap();
        player.play(&Event::with_program(pc)).unwrap();
        player.play(&Event::with_program(pc)).unwrap();
        player.play(&Event::new()).unwrap();
        assert_eq!(sink.take(), vec![SinkCall::Pc(pc)]);
    }

    #[test]
    fn stop_releases_everything() {
        let (mut player, sink) = recorded(Voicing::Poly);
        let cc = ControlValue::new(7, 64).unwrap();
        let mut ev = event(&["A4", "C5"]);
        ev.controls.insert(cc);
        player.play(&ev).unwrap();
        sink.take();

        player.stop().unwrap();
        assert_eq!(sink.take(), vec![SinkCall::Off(notes(&["A4", "C5"]))]);

        // idle stop is silent, and controller history was reset
        player.stop().unwrap();
        player.play(&Event::with_controls([cc])).unwrap();
        assert_eq!(sink.take(), vec![SinkCall::Cc(cc)]);
    }

    #[test]
    fn voicing_deserializes_from_json() {
        let voicing: Voicing =
            serde_json::from_str(r#"{"mode":"mono","priority":"high"}"#).unwrap();
        assert_eq!(
            voicing,
            Voicing::Mono {
                priority: Priority::High
            }
        );
        let voicing: Voicing = serde_json::from_str(r#"{"mode":"poly"}"#).unwrap();
        assert_eq!(voicing, Voicing::Poly);
    }
}

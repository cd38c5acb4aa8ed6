//! MIDI output through `midir`.
//!
//! Output ports are addressed by their index in the backend's port list (the
//! device id). A [`MidiRegistry`] opens each device at most once and hands
//! out shared connections, so several sinks can drive one device.

use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, Mutex, MutexGuard},
};

use midir::{MidiOutput, MidiOutputConnection};

use super::OutputSink;
use crate::{ControlValue, Note, ProgramChange, Result, SonifierError};

const NOTE_OFF: u8 = 0x80;
const NOTE_ON: u8 = 0x90;
const CONTROL_CHANGE: u8 = 0xB0;
const PROGRAM_CHANGE: u8 = 0xC0;

type SharedConnection = Arc<Mutex<MidiOutputConnection>>;

/// Process-wide cache of open MIDI output connections keyed by device id.
pub struct MidiRegistry {
    client_name: String,
    outputs: Mutex<HashMap<usize, SharedConnection>>,
}

impl MidiRegistry {
    pub fn new(client_name: impl Into<String>) -> Self {
        Self {
            client_name: client_name.into(),
            outputs: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the connection for `device_id`, connecting on first use.
    ///
    /// The lookup and the insert happen under the same lock, so two sinks
    /// racing for one device share a single connection.
    pub fn open(&self, device_id: usize) -> Result<SharedConnection> {
        let mut outputs = self.lock_outputs()?;
        if let Some(conn) = outputs.get(&device_id) {
            return Ok(conn.clone());
        }

        let midi_out = MidiOutput::new(&self.client_name)
            .map_err(|e| SonifierError::Midi(format!("failed to initialise output: {e}")))?;
        let ports = midi_out.ports();
        let port = ports
            .get(device_id)
            .ok_or_else(|| SonifierError::Midi(format!("no output port with id {device_id}")))?;
        let port_name = midi_out
            .port_name(port)
            .unwrap_or_else(|_| format!("port {device_id}"));

        let conn = midi_out
            .connect(port, &format!("{}-{device_id}", self.client_name))
            .map_err(|e| SonifierError::Midi(format!("failed to connect to {port_name}: {e}")))?;
        tracing::info!(device_id, port = %port_name, "connected midi output");

        let conn = Arc::new(Mutex::new(conn));
        outputs.insert(device_id, conn.clone());
        Ok(conn)
    }

    /// Number of devices opened so far.
    pub fn open_count(&self) -> Result<usize> {
        Ok(self.lock_outputs()?.len())
    }

    /// Lists output ports as `(device id, name)` pairs.
    pub fn list_ports(&self) -> Result<Vec<(usize, String)>> {
        let midi_out = MidiOutput::new(&self.client_name)
            .map_err(|e| SonifierError::Midi(format!("failed to initialise output: {e}")))?;
        Ok(midi_out
            .ports()
            .iter()
            .enumerate()
            .filter_map(|(id, port)| midi_out.port_name(port).ok().map(|name| (id, name)))
            .collect())
    }

    fn lock_outputs(&self) -> Result<MutexGuard<'_, HashMap<usize, SharedConnection>>> {
        self.outputs
            .lock()
            .map_err(|_| SonifierError::msg("midi registry has been poisoned"))
    }
}

impl std::fmt::Debug for MidiRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MidiRegistry")
            .field("client_name", &self.client_name)
            .finish()
    }
}

/// Converts a user-facing channel (1..=16) into the status nibble.
pub fn channel_index(channel: u8) -> Result<u8> {
    if (1..=16).contains(&channel) {
        Ok(channel - 1)
    } else {
        Err(SonifierError::config(format!(
            "midi channel {channel} is not in 1..=16"
        )))
    }
}

fn note_on(channel: u8, note: &Note) -> [u8; 3] {
    [NOTE_ON | channel, note.pitch(), note.velocity()]
}

fn note_off(channel: u8, note: &Note) -> [u8; 3] {
    [NOTE_OFF | channel, note.pitch(), 0]
}

fn control_change(channel: u8, control: ControlValue) -> [u8; 3] {
    [CONTROL_CHANGE | channel, control.control(), control.value()]
}

fn program_change(channel: u8, program: ProgramChange) -> [u8; 2] {
    [PROGRAM_CHANGE | channel, program.program()]
}

/// Sink writing raw MIDI messages to one channel of a shared device.
///
/// Bend is not transmitted; notes are sent at their integer pitch.
pub struct MidiSink {
    device_id: usize,
    channel: u8,
    output: SharedConnection,
}

impl MidiSink {
    /// Opens (or reuses) `device_id` from the registry. `channel` is 1..=16.
    pub fn open(registry: &MidiRegistry, device_id: usize, channel: u8) -> Result<Self> {
        let channel = channel_index(channel)?;
        let output = registry.open(device_id)?;
        Ok(Self {
            device_id,
            channel,
            output,
        })
    }

    fn send(&self, message: &[u8]) -> Result<()> {
        let mut conn = self
            .output
            .lock()
            .map_err(|_| SonifierError::msg("midi connection has been poisoned"))?;
        conn.send(message).map_err(|e| {
            SonifierError::Midi(format!("send to device {} failed: {e}", self.device_id))
        })
    }
}

impl OutputSink for MidiSink {
    fn notes_on(&mut self, notes: &BTreeSet<Note>) -> Result<()> {
        notes
            .iter()
            .try_for_each(|n| self.send(&note_on(self.channel, n)))
    }

    fn notes_off(&mut self, notes: &BTreeSet<Note>) -> Result<()> {
        notes
            .iter()
            .try_for_each(|n| self.send(&note_off(self.channel, n)))
    }

    fn send_cc(&mut self, control: ControlValue) -> Result<()> {
        self.send(&control_change(self.channel, control))
    }

    fn send_pc(&mut self, program: ProgramChange) -> Result<()> {
        self.send(&program_change(self.channel, program))
    }
}

impl std::fmt::Debug for MidiSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MidiSink")
            .field("device_id", &self.device_id)
            .field("channel", &(self.channel + 1))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channels_are_one_indexed() {
        assert_eq!(channel_index(1).unwrap(), 0);
        assert_eq!(channel_index(16).unwrap(), 15);
        assert!(channel_index(0).is_err());
        assert!(channel_index(17).is_err());
    }

    #[test]
    fn encodes_channel_voice_messages() {
        let note: Note = "A4+30%100".parse().unwrap();
        assert_eq!(note_on(2, &note), [0x92, 69, 100]);
        assert_eq!(note_off(2, &note), [0x82, 69, 0]);

        let cc = ControlValue::new(7, 90).unwrap();
        assert_eq!(control_change(15, cc), [0xBF, 7, 90]);

        let pc = ProgramChange::new(12).unwrap();
        assert_eq!(program_change(0, pc), [0xC0, 12]);
    }

    #[test]
    fn registry_starts_empty() {
        let registry = MidiRegistry::new("scan-sonifier-test");
        assert_eq!(registry.open_count().unwrap(), 0);
    }
}

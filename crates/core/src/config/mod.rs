use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::{
    player::{midi::channel_index, LogSink},
    ColorRange, ControlChangeRenderer, Detector, DiatonicRenderer, LumaDetector, MidiRegistry,
    MidiSink, Note, OutputSink, Player, Priority, RangeDetector, Renderer, Result, Scale,
    SonifierError, Voicing, RASTER_READ_AHEAD,
};

pub const BPM_RANGE: (u32, u32) = (1, 600);
pub const LOOP_BEATS_RANGE: (u32, u32) = (1, 64);
pub const TIMERES_MS_RANGE: (u64, u64) = (10, 1000);

fn check_range<T>(name: &str, value: T, (min, max): (T, T)) -> Result<()>
where
    T: PartialOrd + std::fmt::Display,
{
    if value < min || value > max {
        return Err(SonifierError::config(format!(
            "{name} {value} is not in {min}..={max}"
        )));
    }
    Ok(())
}

/// Tempo parameters that pace the scanline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TempoConfig {
    pub bpm: u32,
    /// Beats per full sweep of the frame.
    pub loop_beats: u32,
    /// Shortest allowed tick, in milliseconds.
    pub timeres_ms: u64,
}

impl Default for TempoConfig {
    fn default() -> Self {
        Self {
            bpm: 120,
            loop_beats: 4,
            timeres_ms: 20,
        }
    }
}

impl TempoConfig {
    pub fn validate(&self) -> Result<()> {
        check_range("bpm", self.bpm, BPM_RANGE)?;
        check_range("loop beats", self.loop_beats, LOOP_BEATS_RANGE)?;
        check_range("time resolution", self.timeres_ms, TIMERES_MS_RANGE)
    }
}

/// Tempo shared with the timing thread, readable without locking.
///
/// Every setter validates before storing, so readers always see values inside
/// the configured bounds.
#[derive(Debug)]
pub struct LiveTempo {
    bpm: AtomicU32,
    loop_beats: AtomicU32,
    timeres_ms: AtomicU64,
}

impl LiveTempo {
    pub fn new(tempo: TempoConfig) -> Result<Self> {
        tempo.validate()?;
        Ok(Self {
            bpm: AtomicU32::new(tempo.bpm),
            loop_beats: AtomicU32::new(tempo.loop_beats),
            timeres_ms: AtomicU64::new(tempo.timeres_ms),
        })
    }

    pub fn snapshot(&self) -> TempoConfig {
        TempoConfig {
            bpm: self.bpm.load(Ordering::Relaxed),
            loop_beats: self.loop_beats.load(Ordering::Relaxed),
            timeres_ms: self.timeres_ms.load(Ordering::Relaxed),
        }
    }

    pub fn set_bpm(&self, bpm: u32) -> Result<()> {
        check_range("bpm", bpm, BPM_RANGE)?;
        self.bpm.store(bpm, Ordering::Relaxed);
        Ok(())
    }

    pub fn set_loop_beats(&self, loop_beats: u32) -> Result<()> {
        check_range("loop beats", loop_beats, LOOP_BEATS_RANGE)?;
        self.loop_beats.store(loop_beats, Ordering::Relaxed);
        Ok(())
    }

    pub fn set_timeres_ms(&self, timeres_ms: u64) -> Result<()> {
        check_range("time resolution", timeres_ms, TIMERES_MS_RANGE)?;
        self.timeres_ms.store(timeres_ms, Ordering::Relaxed);
        Ok(())
    }
}

/// Where a player sends its output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SinkConfig {
    Log,
    Midi { device_id: usize, channel: u8 },
}

impl SinkConfig {
    fn validate(&self) -> Result<()> {
        match self {
            SinkConfig::Log => Ok(()),
            SinkConfig::Midi { channel, .. } => channel_index(*channel).map(|_| ()),
        }
    }

    /// Opens the sink. MIDI devices come from the shared registry.
    pub fn open(&self, name: &str, registry: &MidiRegistry) -> Result<Box<dyn OutputSink>> {
        Ok(match self {
            SinkConfig::Log => Box::new(LogSink::new(name)),
            SinkConfig::Midi { device_id, channel } => {
                Box::new(MidiSink::open(registry, *device_id, *channel)?)
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerConfig {
    #[serde(default)]
    pub voicing: Voicing,
    pub sink: SinkConfig,
}

impl PlayerConfig {
    pub fn build(&self, name: &str, registry: &MidiRegistry) -> Result<Player> {
        Ok(Player::new(self.voicing, self.sink.open(name, registry)?))
    }
}

/// One detector channel routed through a renderer into a player.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaneConfig {
    /// Index of the detector output (0 = height, 1 = x, 2 = y).
    #[serde(default)]
    pub channel: usize,
    pub renderer: Renderer,
    pub player: PlayerConfig,
}

/// A detector and the lanes fed by it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerConfig {
    pub name: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    pub detector: Detector,
    pub lanes: Vec<LaneConfig>,
}

fn enabled_by_default() -> bool {
    true
}

impl ConsumerConfig {
    pub fn validate(&self) -> Result<()> {
        self.detector.validate()?;
        let channels = self.detector.channels();
        for lane in &self.lanes {
            if lane.channel >= channels {
                return Err(SonifierError::config(format!(
                    "consumer `{}` routes channel {} but its {} has {channels}",
                    self.name,
                    lane.channel,
                    self.detector.label()
                )));
            }
            lane.renderer.validate()?;
            lane.player.sink.validate()?;
        }
        Ok(())
    }
}

/// Complete description of a scan pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub tempo: TempoConfig,
    /// Read-ahead emulated by in-memory rasters.
    #[serde(default = "default_read_ahead")]
    pub raster_read_ahead: i64,
    pub consumers: Vec<ConsumerConfig>,
}

fn default_read_ahead() -> i64 {
    RASTER_READ_AHEAD
}

impl PipelineConfig {
    /// Parses and validates a JSON preset.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: PipelineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        self.tempo.validate()?;
        let mut names = std::collections::HashSet::new();
        for consumer in &self.consumers {
            if !names.insert(consumer.name.as_str()) {
                return Err(SonifierError::config(format!(
                    "consumer name `{}` is used twice",
                    consumer.name
                )));
            }
            consumer.validate()?;
        }
        Ok(())
    }

    /// Replaces every sink with a log sink.
    pub fn with_log_sinks(mut self) -> Self {
        for lane in self.consumers.iter_mut().flat_map(|c| c.lanes.iter_mut()) {
            lane.player.sink = SinkConfig::Log;
        }
        self
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            tempo: TempoConfig::default(),
            raster_read_ahead: RASTER_READ_AHEAD,
            consumers: vec![dark_consumer(), red_consumer()],
        }
    }
}

fn midi(channel: u8) -> SinkConfig {
    SinkConfig::Midi {
        device_id: 0,
        channel,
    }
}

// A1 and C2
const DARK_FUNDAMENTAL: u8 = 33;
const RED_FUNDAMENTAL: u8 = 36;

fn dark_consumer() -> ConsumerConfig {
    ConsumerConfig {
        name: "dark".into(),
        enabled: true,
        detector: Detector::Luma(LumaDetector {
            min_luma: 0.0,
            max_luma: 0.1,
        }),
        lanes: vec![LaneConfig {
            channel: 0,
            renderer: Renderer::Diatonic(DiatonicRenderer {
                fundamental: Note::saturating(DARK_FUNDAMENTAL),
                octaves: 3,
                scale: Scale::minor_pentatonic(),
            }),
            player: PlayerConfig {
                voicing: Voicing::Poly,
                sink: midi(1),
            },
        }],
    }
}

fn red_consumer() -> ConsumerConfig {
    let cc = |control| Renderer::ControlChange(ControlChangeRenderer {
        control,
        min_value: 0,
        max_value: 127,
    });
    let lanes = vec![
        LaneConfig {
            channel: 0,
            renderer: Renderer::Diatonic(DiatonicRenderer {
                fundamental: Note::saturating(RED_FUNDAMENTAL),
                octaves: 5,
                scale: Scale::major_pentatonic(),
            }),
            player: PlayerConfig {
                voicing: Voicing::Mono {
                    priority: Priority::High,
                },
                sink: midi(2),
            },
        },
        LaneConfig {
            channel: 1,
            renderer: cc(7),
            player: PlayerConfig {
                voicing: Voicing::Poly,
                sink: midi(2),
            },
        },
        LaneConfig {
            channel: 2,
            renderer: cc(9),
            player: PlayerConfig {
                voicing: Voicing::Poly,
                sink: midi(2),
            },
        },
    ];

    ConsumerConfig {
        name: "red".into(),
        enabled: true,
        detector: Detector::ColorRange(RangeDetector::new(ColorRange::default())),
        lanes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tempo_defaults_and_bounds() {
        let tempo = TempoConfig::default();
        assert_eq!((tempo.bpm, tempo.loop_beats, tempo.timeres_ms), (120, 4, 20));
        tempo.validate().unwrap();

        for bad in [
            TempoConfig { bpm: 0, ..tempo },
            TempoConfig { bpm: 601, ..tempo },
            TempoConfig { loop_beats: 65, ..tempo },
            TempoConfig { timeres_ms: 9, ..tempo },
            TempoConfig { timeres_ms: 1001, ..tempo },
        ] {
            assert!(bad.validate().is_err(), "{bad:?}");
        }
    }

    #[test]
    fn live_tempo_rejects_out_of_range_updates() {
        let live = LiveTempo::new(TempoConfig::default()).unwrap();
        live.set_bpm(90).unwrap();
        assert!(live.set_bpm(0).is_err());
        assert!(live.set_loop_beats(100).is_err());
        live.set_timeres_ms(50).unwrap();
        let tempo = live.snapshot();
        assert_eq!((tempo.bpm, tempo.loop_beats, tempo.timeres_ms), (90, 4, 50));
        assert!(LiveTempo::new(TempoConfig { bpm: 0, ..tempo }).is_err());
    }

    #[test]
    fn default_preset_is_valid_and_round_trips() {
        let config = PipelineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.consumers.len(), 2);
        assert_eq!(config.consumers[1].lanes.len(), 3);

        let json = config.to_json().unwrap();
        assert_eq!(PipelineConfig::from_json(&json).unwrap(), config);
    }

    #[test]
    fn minimal_preset_fills_in_defaults() {
        let json = r#"{
            "consumers": [{
                "name": "ink",
                "detector": {"kind": "luma", "min_luma": 0.0, "max_luma": 0.2},
                "lanes": [{
                    "renderer": {"kind": "chromatic", "min_note": "C3", "max_note": "C5"},
                    "player": {"sink": {"kind": "log"}}
                }]
            }]
        }"#;
        let config = PipelineConfig::from_json(json).unwrap();
        assert_eq!(config.tempo, TempoConfig::default());
        assert_eq!(config.raster_read_ahead, RASTER_READ_AHEAD);
        let consumer = &config.consumers[0];
        assert!(consumer.enabled);
        assert_eq!(consumer.lanes[0].channel, 0);
        assert_eq!(consumer.lanes[0].player.voicing, Voicing::Poly);
    }

    #[test]
    fn presets_fail_fast_on_bad_values() {
        let lane = |channel: usize, sink: &str| {
            format!(
                r#"{{"channel": {channel}, "renderer": {{"kind": "control_change", "control": 7,
                "min_value": 0, "max_value": 127}}, "player": {{"sink": {sink}}}}}"#
            )
        };
        let consumer = |lane: String| {
            format!(
                r#"{{"consumers": [{{"name": "a", "detector": {{"kind": "luma",
                "min_luma": 0.0, "max_luma": 0.1}}, "lanes": [{lane}]}}]}}"#
            )
        };

        assert!(PipelineConfig::from_json(&consumer(lane(0, r#"{"kind":"log"}"#))).is_ok());
        // luma detectors only have the height channel
        assert!(PipelineConfig::from_json(&consumer(lane(1, r#"{"kind":"log"}"#))).is_err());
        assert!(PipelineConfig::from_json(&consumer(lane(
            0,
            r#"{"kind":"midi","device_id":0,"channel":17}"#
        )))
        .is_err());
        assert!(PipelineConfig::from_json(r#"{"consumers": [{"name": "a"}]}"#).is_err());

        let mut config = PipelineConfig::default();
        config.consumers[1].name = "dark".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn log_only_rewrites_every_sink() {
        let config = PipelineConfig::default().with_log_sinks();
        assert!(config
            .consumers
            .iter()
            .flat_map(|c| &c.lanes)
            .all(|lane| lane.player.sink == SinkConfig::Log));
    }
}

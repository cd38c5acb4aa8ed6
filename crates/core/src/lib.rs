//! Core library for the scanline sonifier.
//!
//! A scanline sweeps across an image in time with a musical tempo. At every
//! step the column under it is sampled, detectors find runs of matching
//! colors, renderers quantise the runs into notes and controller values, and
//! players send the changes to MIDI or to the log. Each module owns one stage
//! of that chain; [`pipeline`] wires the stages together on worker threads.

pub mod color;
pub mod config;
pub mod detect;
pub mod error;
pub mod note;
pub mod pipeline;
pub mod player;
pub mod renderer;
pub mod sample;
pub mod scan;

pub use color::{map_to_percent, map_to_range, Axis, Color, ColorColumn, ColorRange, ColorSpace};
pub use config::{
    ConsumerConfig, LaneConfig, LiveTempo, PipelineConfig, PlayerConfig, SinkConfig, TempoConfig,
};
pub use detect::{Detector, LumaDetector, PlayPoint, RangeDetector, Window};
pub use error::{Result, SonifierError};
pub use note::{ControlValue, Event, Note, ProgramChange};
pub use pipeline::{Consumer, Lane, Pipeline};
pub use player::{LogSink, MidiRegistry, MidiSink, OutputSink, Player, Priority, Voicing};
pub use renderer::{ChromaticRenderer, ControlChangeRenderer, DiatonicRenderer, Renderer, Scale};
pub use sample::{
    ColumnSampler, FrameSource, HostHooks, NoHooks, Raster, SampleRect, RASTER_READ_AHEAD,
};
pub use scan::{Pacing, ScanController, ScanMode, ScanState, ScanTick};

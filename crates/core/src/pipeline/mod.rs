//! Thread wiring between the scan controller and the consumers.
//!
//! The timing thread emits [`ScanTick`]s. One dispatcher thread samples the
//! column for each tick and fans it out; every [`Consumer`] runs on its own
//! thread behind an unbounded FIFO, so a slow consumer never reorders or
//! drops columns, it only lags. Threads start on first activation.

use std::{
    sync::{Arc, Mutex, MutexGuard},
    thread::{self, JoinHandle},
};

use crossbeam::channel::{unbounded, Receiver, Sender};

use crate::{
    sample::sample_column, ColorColumn, ColumnSampler, ConsumerConfig, Detector, FrameSource,
    HostHooks, LiveTempo, MidiRegistry, PipelineConfig, Player, Renderer, Result, ScanController,
    ScanState, ScanTick, SonifierError, TempoConfig,
};

/// Backlog above which the dispatcher warns about a lagging consumer.
pub const QUEUE_WARN_DEPTH: usize = 64;

/// A renderer and player fed by one detector channel.
#[derive(Debug)]
pub struct Lane {
    pub channel: usize,
    pub renderer: Renderer,
    pub player: Player,
}

/// A detector followed by its lanes.
#[derive(Debug)]
pub struct Consumer {
    name: String,
    detector: Detector,
    lanes: Vec<Lane>,
    enabled: bool,
}

impl Consumer {
    /// Checks the detector and every renderer before accepting them.
    pub fn new(name: impl Into<String>, detector: Detector, lanes: Vec<Lane>) -> Result<Self> {
        detector.validate()?;
        for lane in &lanes {
            lane.renderer.validate()?;
        }
        Ok(Self {
            name: name.into(),
            detector,
            lanes,
            enabled: true,
        })
    }

    /// Builds the consumer, opening any MIDI devices its players need.
    pub fn from_config(config: &ConsumerConfig, registry: &MidiRegistry) -> Result<Self> {
        config.validate()?;
        let lanes = config
            .lanes
            .iter()
            .enumerate()
            .map(|(i, lane)| {
                Ok(Lane {
                    channel: lane.channel,
                    renderer: lane.renderer.clone(),
                    player: lane.player.build(&format!("{}/{i}", config.name), registry)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut consumer = Consumer::new(config.name.clone(), config.detector.clone(), lanes)?;
        consumer.enabled = config.enabled;
        Ok(consumer)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Detects runs in `column` and plays what each lane renders from them.
    pub fn process(&mut self, column: &ColorColumn) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let points = self.detector.detect(column);
        for lane in &mut self.lanes {
            let batch = points.get(lane.channel).map(Vec::as_slice).unwrap_or_default();
            let event = lane.renderer.render(batch);
            lane.player.play(&event)?;
        }
        Ok(())
    }

    /// Stops every player, attempting all of them before reporting a failure.
    pub fn release(&mut self) -> Result<()> {
        let mut first_err = None;
        for lane in &mut self.lanes {
            if let Err(e) = lane.player.stop() {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Turns the consumer on or off; switching off releases its notes.
    pub fn set_enabled(&mut self, enabled: bool) -> Result<()> {
        let was_enabled = std::mem::replace(&mut self.enabled, enabled);
        if was_enabled && !enabled {
            self.release()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum ConsumerMsg {
    Column(Arc<ColorColumn>),
    Release,
    SetEnabled(bool),
    Shutdown,
}

fn run_consumer(mut consumer: Consumer, inbox: Receiver<ConsumerMsg>) {
    while let Ok(msg) = inbox.recv() {
        let (result, done) = match msg {
            ConsumerMsg::Column(column) => (consumer.process(&column), false),
            ConsumerMsg::Release => (consumer.release(), false),
            ConsumerMsg::SetEnabled(enabled) => (consumer.set_enabled(enabled), false),
            ConsumerMsg::Shutdown => (consumer.release(), true),
        };
        if let Err(e) = result {
            tracing::warn!(consumer = consumer.name(), error = %e, "consumer step failed");
        }
        if done {
            break;
        }
    }
    tracing::debug!(consumer = consumer.name(), "consumer thread exited");
}

struct Dispatcher {
    frame: Arc<dyn FrameSource>,
    sampler: Arc<dyn ColumnSampler>,
    outboxes: Vec<(String, Sender<ConsumerMsg>)>,
}

impl Dispatcher {
    fn run(self, ticks: Receiver<ScanTick>) {
        while let Ok(tick) = ticks.recv() {
            match tick {
                ScanTick::Sample { position } => {
                    match sample_column(self.frame.as_ref(), self.sampler.as_ref(), position) {
                        Ok(column) => self.broadcast(ConsumerMsg::Column(Arc::new(column))),
                        Err(e) => {
                            tracing::warn!(position, error = %e, "sampling failed, skipping tick")
                        }
                    }
                }
                ScanTick::Release => self.broadcast(ConsumerMsg::Release),
                ScanTick::Shutdown => {
                    self.broadcast(ConsumerMsg::Shutdown);
                    break;
                }
            }
        }
        tracing::debug!("dispatcher thread exited");
    }

    fn broadcast(&self, msg: ConsumerMsg) {
        for (name, outbox) in &self.outboxes {
            let backlog = outbox.len();
            if backlog > QUEUE_WARN_DEPTH {
                tracing::warn!(consumer = %name, backlog, "consumer is falling behind");
            }
            if outbox.send(msg.clone()).is_err() {
                tracing::warn!(consumer = %name, "consumer thread is gone");
            }
        }
    }
}

enum Workers {
    Pending {
        dispatcher: Dispatcher,
        ticks: Receiver<ScanTick>,
        consumers: Vec<(Consumer, Receiver<ConsumerMsg>)>,
    },
    Running(Vec<JoinHandle<()>>),
    Stopped,
}

fn spawn(name: String, f: impl FnOnce() + Send + 'static) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(name.clone())
        .spawn(f)
        .map_err(|e| SonifierError::Thread(format!("failed to spawn {name}: {e}")))
}

/// Scan controller, dispatcher and consumers wired together.
pub struct Pipeline {
    scan: ScanController,
    tempo: Arc<LiveTempo>,
    ticks: Sender<ScanTick>,
    outboxes: Vec<(String, Sender<ConsumerMsg>)>,
    workers: Mutex<Workers>,
}

impl Pipeline {
    pub fn new(
        frame: Arc<dyn FrameSource>,
        sampler: Arc<dyn ColumnSampler>,
        hooks: Arc<dyn HostHooks>,
        tempo: TempoConfig,
        consumers: Vec<Consumer>,
    ) -> Result<Self> {
        let tempo = Arc::new(LiveTempo::new(tempo)?);
        let (tick_tx, tick_rx) = unbounded();

        let mut outboxes = Vec::with_capacity(consumers.len());
        let mut pending = Vec::with_capacity(consumers.len());
        for consumer in consumers {
            let (tx, rx) = unbounded();
            outboxes.push((consumer.name().to_string(), tx));
            pending.push((consumer, rx));
        }

        let dispatcher = Dispatcher {
            frame: frame.clone(),
            sampler,
            outboxes: outboxes.clone(),
        };
        let scan = ScanController::new(frame, hooks, tempo.clone(), tick_tx.clone());

        Ok(Self {
            scan,
            tempo,
            ticks: tick_tx,
            outboxes,
            workers: Mutex::new(Workers::Pending {
                dispatcher,
                ticks: tick_rx,
                consumers: pending,
            }),
        })
    }

    /// Validates `config` and builds its consumers.
    pub fn from_config(
        config: &PipelineConfig,
        frame: Arc<dyn FrameSource>,
        sampler: Arc<dyn ColumnSampler>,
        hooks: Arc<dyn HostHooks>,
        registry: &MidiRegistry,
    ) -> Result<Self> {
        config.validate()?;
        let consumers = config
            .consumers
            .iter()
            .map(|c| Consumer::from_config(c, registry))
            .collect::<Result<Vec<_>>>()?;
        Self::new(frame, sampler, hooks, config.tempo, consumers)
    }

    /// Live tempo; changes apply from the next tick.
    pub fn tempo(&self) -> &LiveTempo {
        &self.tempo
    }

    pub fn consumer_names(&self) -> impl Iterator<Item = &str> {
        self.outboxes.iter().map(|(name, _)| name.as_str())
    }

    pub fn trigger_once(&self) -> Result<()> {
        self.ensure_started()?;
        self.scan.trigger_once()
    }

    pub fn loop_scan(&self) -> Result<()> {
        self.ensure_started()?;
        self.scan.loop_scan()
    }

    pub fn step_once(&self) -> Result<()> {
        self.ensure_started()?;
        self.scan.step_once()
    }

    /// Goes idle and releases every player.
    pub fn stop(&self) -> Result<()> {
        self.scan.stop()
    }

    pub fn snapshot(&self) -> Result<ScanState> {
        self.scan.snapshot()
    }

    pub fn take_changed(&self) -> Result<bool> {
        self.scan.take_changed()
    }

    /// Enables or disables the named consumer. Disabling releases its notes.
    pub fn set_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let (_, outbox) = self
            .outboxes
            .iter()
            .find(|(n, _)| n == name)
            .ok_or_else(|| SonifierError::config(format!("no consumer named `{name}`")))?;
        outbox
            .send(ConsumerMsg::SetEnabled(enabled))
            .map_err(|_| SonifierError::msg(format!("consumer `{name}` is gone")))
    }

    /// Stops scanning, releases every player and joins all worker threads.
    ///
    /// The workers are joined even when the timing thread fails to stop; the
    /// first error is returned afterwards.
    pub fn shutdown(&self) -> Result<()> {
        let scan_result = self.scan.shutdown();
        let workers = std::mem::replace(&mut *self.lock_workers()?, Workers::Stopped);

        let mut first_err = scan_result.err();
        if let Workers::Running(handles) = workers {
            // the dispatcher forwards this to every consumer
            if self.ticks.send(ScanTick::Shutdown).is_err() {
                first_err.get_or_insert(SonifierError::msg("tick channel is closed"));
            }
            for handle in handles {
                if handle.join().is_err() {
                    first_err
                        .get_or_insert(SonifierError::Thread("pipeline worker panicked".into()));
                }
            }
            tracing::info!("pipeline shut down");
        }
        first_err.map_or(Ok(()), Err)
    }

    fn ensure_started(&self) -> Result<()> {
        let mut workers = self.lock_workers()?;
        match &*workers {
            Workers::Running(_) => return Ok(()),
            Workers::Stopped => {
                return Err(SonifierError::msg("pipeline has been shut down"));
            }
            Workers::Pending { .. } => {}
        }

        let Workers::Pending {
            dispatcher,
            ticks,
            consumers,
        } = std::mem::replace(&mut *workers, Workers::Stopped)
        else {
            return Ok(());
        };

        let mut handles = Vec::with_capacity(consumers.len() + 1);
        for (consumer, inbox) in consumers {
            let name = format!("consumer-{}", consumer.name());
            handles.push(spawn(name, move || run_consumer(consumer, inbox))?);
        }
        handles.push(spawn("scan-dispatch".into(), move || dispatcher.run(ticks))?);
        *workers = Workers::Running(handles);
        drop(workers);

        self.scan.start()?;
        tracing::info!(consumers = self.outboxes.len(), "pipeline started");
        Ok(())
    }

    fn lock_workers(&self) -> Result<MutexGuard<'_, Workers>> {
        self.workers
            .lock()
            .map_err(|_| SonifierError::msg("pipeline workers have been poisoned"))
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("scan", &self.scan)
            .field("consumers", &self.consumer_names().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::BTreeSet,
        sync::atomic::{AtomicUsize, Ordering},
        time::{Duration, Instant},
    };

    use super::*;
    use crate::{
        player::testing::{RecordingSink, SinkCall},
        ChromaticRenderer, Color, ColorRange, ControlChangeRenderer, DiatonicRenderer,
        LumaDetector, NoHooks, Note, Raster, RangeDetector, SampleRect, Scale, Voicing,
        RASTER_READ_AHEAD,
    };

    fn note(s: &str) -> Note {
        s.parse().unwrap()
    }

    fn notes(defs: &[&str]) -> BTreeSet<Note> {
        defs.iter().map(|d| note(d)).collect()
    }

    /// Dark rows 1 and 2 of 4 in every column.
    fn band(width: usize) -> Raster {
        Raster::from_fn(width, 4, |_, y| {
            if (1..=2).contains(&y) {
                Color::black()
            } else {
                Color::white()
            }
        })
    }

    fn ink_consumer() -> (Consumer, RecordingSink) {
        let sink = RecordingSink::default();
        let lane = Lane {
            channel: 0,
            renderer: Renderer::Chromatic(ChromaticRenderer::new(note("C3"), note("C5"))),
            player: Player::new(Voicing::Poly, Box::new(sink.clone())),
        };
        let detector = Detector::Luma(LumaDetector::new(0.0, 0.1).unwrap());
        (Consumer::new("ink", detector, vec![lane]).unwrap(), sink)
    }

    fn fast() -> TempoConfig {
        TempoConfig {
            bpm: 600,
            loop_beats: 1,
            timeres_ms: 10,
        }
    }

    fn pipeline(raster: Raster) -> (Pipeline, RecordingSink) {
        let raster = Arc::new(raster);
        let (consumer, sink) = ink_consumer();
        let pipeline = Pipeline::new(
            raster.clone(),
            raster,
            Arc::new(NoHooks),
            fast(),
            vec![consumer],
        )
        .unwrap();
        (pipeline, sink)
    }

    fn wait_for(sink: &RecordingSink, what: &str, done: impl Fn(&[SinkCall]) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(3);
        while !done(&sink.snapshot()) {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn released(calls: &[SinkCall]) -> bool {
        matches!(calls.last(), Some(SinkCall::Off(_)))
    }

    #[test]
    fn consumer_routes_channels_to_lanes() {
        let pitch = RecordingSink::default();
        let cc = RecordingSink::default();
        let range = ColorRange::rgb("red", 0.0, "green", (0.0, 1.0), (0.0, 1.0)).unwrap();
        let mut consumer = Consumer::new(
            "cyan",
            Detector::ColorRange(RangeDetector::new(range)),
            vec![
                Lane {
                    channel: 0,
                    renderer: Renderer::Chromatic(ChromaticRenderer::new(note("C3"), note("C5"))),
                    player: Player::poly(Box::new(pitch.clone())),
                },
                Lane {
                    channel: 1,
                    renderer: Renderer::ControlChange(ControlChangeRenderer::new(7, 0, 100).unwrap()),
                    player: Player::poly(Box::new(cc.clone())),
                },
            ],
        )
        .unwrap();

        let column = vec![
            Color::new(0.0, 0.5, 0.5),
            Color::new(1.0, 1.0, 1.0),
            Color::new(1.0, 1.0, 1.0),
            Color::new(1.0, 1.0, 1.0),
        ];
        consumer.process(&column).unwrap();
        assert_eq!(pitch.take(), vec![SinkCall::On(notes(&["C5"]))]);
        assert_eq!(
            cc.take(),
            vec![SinkCall::Cc(crate::ControlValue::new(7, 50).unwrap())]
        );

        consumer.set_enabled(false).unwrap();
        assert_eq!(pitch.take(), vec![SinkCall::Off(notes(&["C5"]))]);
        consumer.process(&column).unwrap();
        assert!(pitch.take().is_empty());
    }

    #[test]
    fn single_shot_plays_then_releases() {
        let (pipeline, sink) = pipeline(band(4).with_read_ahead(RASTER_READ_AHEAD));
        pipeline.trigger_once().unwrap();

        wait_for(&sink, "release", released);
        // every column holds the same band: 1 - 1.5 / 4 of two octaves above C3
        assert_eq!(
            sink.snapshot(),
            vec![SinkCall::On(notes(&["D#4"])), SinkCall::Off(notes(&["D#4"]))]
        );
        pipeline.shutdown().unwrap();
    }

    #[test]
    fn failed_samples_are_skipped() {
        // without emulated read-ahead the first column cannot be read
        let (pipeline, sink) = pipeline(band(3));
        pipeline.trigger_once().unwrap();
        wait_for(&sink, "release", released);
        assert_eq!(sink.snapshot().len(), 2);
        pipeline.shutdown().unwrap();
    }

    #[test]
    fn stop_silences_a_loop() {
        let (pipeline, sink) = pipeline(band(8).with_read_ahead(RASTER_READ_AHEAD));
        pipeline.loop_scan().unwrap();
        wait_for(&sink, "first note", |calls| !calls.is_empty());

        pipeline.stop().unwrap();
        wait_for(&sink, "release", released);
        thread::sleep(Duration::from_millis(50));
        assert!(released(&sink.snapshot()));
        assert!(!pipeline.snapshot().unwrap().mode.is_active());
        pipeline.shutdown().unwrap();
    }

    #[test]
    fn disabling_a_consumer_releases_it() {
        let (pipeline, sink) = pipeline(band(8).with_read_ahead(RASTER_READ_AHEAD));
        pipeline.loop_scan().unwrap();
        wait_for(&sink, "first note", |calls| !calls.is_empty());

        pipeline.set_enabled("ink", false).unwrap();
        wait_for(&sink, "release", released);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(sink.snapshot().len(), 2);
        assert!(pipeline.set_enabled("missing", true).is_err());
        pipeline.shutdown().unwrap();
    }

    #[test]
    fn shutdown_releases_and_refuses_restart() {
        let (pipeline, sink) = pipeline(band(8).with_read_ahead(RASTER_READ_AHEAD));
        pipeline.loop_scan().unwrap();
        wait_for(&sink, "first note", |calls| !calls.is_empty());

        pipeline.shutdown().unwrap();
        assert!(released(&sink.snapshot()));
        assert!(pipeline.trigger_once().is_err());
    }

    #[test]
    fn unstarted_pipeline_shuts_down_cleanly() {
        let (pipeline, sink) = pipeline(band(2));
        assert_eq!(pipeline.consumer_names().collect::<Vec<_>>(), vec!["ink"]);
        pipeline.shutdown().unwrap();
        assert!(sink.snapshot().is_empty());
    }

    #[test]
    fn consumers_reject_invalid_renderers() {
        let lane = Lane {
            channel: 0,
            renderer: Renderer::Diatonic(DiatonicRenderer {
                fundamental: note("C2"),
                octaves: 0,
                scale: Scale::major(),
            }),
            player: Player::poly(Box::new(RecordingSink::default())),
        };
        let detector = Detector::Luma(LumaDetector::new(0.0, 0.1).unwrap());
        assert!(Consumer::new("ink", detector, vec![lane]).is_err());

        let lane = Lane {
            channel: 0,
            renderer: Renderer::Chromatic(ChromaticRenderer::new(note("C3"), note("C5"))),
            player: Player::poly(Box::new(RecordingSink::default())),
        };
        let detector = Detector::Luma(LumaDetector {
            min_luma: f32::NAN,
            max_luma: 0.1,
        });
        assert!(Consumer::new("ink", detector, vec![lane]).is_err());
    }

    /// Answers the first width query, then panics.
    struct FailingFrame {
        raster: Arc<Raster>,
        calls: AtomicUsize,
    }

    impl FrameSource for FailingFrame {
        fn width(&self) -> usize {
            if self.calls.fetch_add(1, Ordering::SeqCst) > 0 {
                panic!("frame went away");
            }
            self.raster.width()
        }

        fn column_rect(&self, position: i64) -> SampleRect {
            self.raster.column_rect(position)
        }
    }

    #[test]
    fn shutdown_joins_workers_when_the_timing_thread_failed() {
        let raster = Arc::new(band(4).with_read_ahead(RASTER_READ_AHEAD));
        let frame = Arc::new(FailingFrame {
            raster: raster.clone(),
            calls: AtomicUsize::new(0),
        });
        let (consumer, sink) = ink_consumer();
        let pipeline = Pipeline::new(
            frame.clone(),
            raster,
            Arc::new(NoHooks),
            fast(),
            vec![consumer],
        )
        .unwrap();

        pipeline.step_once().unwrap();
        wait_for(&sink, "first note", |calls| !calls.is_empty());
        pipeline.step_once().unwrap();
        let deadline = Instant::now() + Duration::from_secs(3);
        while frame.calls.load(Ordering::SeqCst) < 2 {
            assert!(Instant::now() < deadline, "timing thread never woke");
            thread::sleep(Duration::from_millis(5));
        }

        assert!(matches!(pipeline.shutdown(), Err(SonifierError::Thread(_))));
        assert_eq!(
            sink.snapshot(),
            vec![SinkCall::On(notes(&["D#4"])), SinkCall::Off(notes(&["D#4"]))]
        );
        assert!(pipeline.trigger_once().is_err());
    }
}

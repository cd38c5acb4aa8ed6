//! Scan timing: the state machine that moves the scanline to tempo.
//!
//! [`ScanController`] owns the scan position. A dedicated timing thread waits
//! on a condition variable while idle and, once activated, advances the
//! position by [`Pacing::increment`] pixels every [`Pacing::interval`]. Each
//! step is reported as a [`ScanTick`] on an unbounded channel, followed by a
//! [`ScanTick::Release`] whenever playback must fall silent.

use std::{
    sync::{Arc, Condvar, Mutex, MutexGuard},
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam::channel::Sender;

use crate::{FrameSource, HostHooks, LiveTempo, Result, SonifierError, TempoConfig};

/// Wait applied when the frame is momentarily empty.
pub const EMPTY_FRAME_BACKOFF: Duration = Duration::from_millis(10);

/// Activation mode of the scanline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanMode {
    #[default]
    Idle,
    /// Advance forever, wrapping at the right edge.
    Continuous,
    /// Advance until the last column, then go idle.
    SingleShot,
    /// Advance one pixel, then go idle.
    SingleStep,
}

impl ScanMode {
    pub fn is_active(&self) -> bool {
        !matches!(self, ScanMode::Idle)
    }
}

/// Tick length and pixel stride for one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacing {
    pub interval: Duration,
    pub increment: usize,
}

impl Pacing {
    /// Derives the pacing for a frame `width` pixels wide, or `None` when the
    /// frame is empty.
    ///
    /// One loop over the frame lasts `60 / bpm * loop_beats` seconds. When a
    /// single pixel would take less than the time resolution, the stride grows
    /// to the smallest whole number of pixels that fills it.
    pub fn compute(width: usize, tempo: &TempoConfig) -> Option<Pacing> {
        if width == 0 {
            return None;
        }
        let loop_secs = 60.0 / tempo.bpm.max(1) as f64 * tempo.loop_beats.max(1) as f64;
        let pixel_secs = loop_secs / width as f64;
        let timeres = Duration::from_millis(tempo.timeres_ms);
        let timeres_secs = timeres.as_secs_f64();

        let increment = if pixel_secs < timeres_secs {
            (timeres_secs / pixel_secs).ceil() as usize
        } else {
            1
        };
        let interval = Duration::from_secs_f64(pixel_secs * increment as f64).max(timeres);
        Some(Pacing {
            interval,
            increment: increment.max(1),
        })
    }
}

/// Position and mode of the scanline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanState {
    /// Current column, `-1` before the first step.
    pub position: i64,
    /// Stride used by the last step.
    pub increment: usize,
    pub mode: ScanMode,
    /// Set after every step; cleared by whoever paints the scanline.
    pub changed: bool,
}

impl Default for ScanState {
    fn default() -> Self {
        Self {
            position: -1,
            increment: 1,
            mode: ScanMode::Idle,
            changed: false,
        }
    }
}

impl ScanState {
    /// Applies one tick at the given width and stride. Returns `true` when
    /// the tick completed the current mode and the state went idle.
    pub fn advance(&mut self, width: usize, increment: usize) -> bool {
        if width == 0 {
            return false;
        }
        let width = width as i64;
        let increment = increment.max(1);

        let finished = match self.mode {
            ScanMode::Idle => return false,
            ScanMode::Continuous => {
                self.increment = increment;
                self.position = (self.position + increment as i64).rem_euclid(width);
                false
            }
            ScanMode::SingleShot => {
                self.increment = increment;
                let next = self.position + increment as i64;
                if next >= width - 1 {
                    self.position = width - 1;
                    true
                } else {
                    self.position = next.max(0);
                    false
                }
            }
            ScanMode::SingleStep => {
                self.position = (self.position + 1).rem_euclid(width);
                true
            }
        };

        if finished {
            self.mode = ScanMode::Idle;
        }
        self.changed = true;
        finished
    }
}

/// Work item emitted by the timing thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanTick {
    /// Sample the column at `position`.
    Sample { position: i64 },
    /// Silence every player.
    Release,
    /// Stop the receiving dispatcher.
    Shutdown,
}

#[derive(Debug, Default)]
struct Inner {
    scan: ScanState,
    wake_pending: bool,
    shutdown: bool,
}

#[derive(Debug, Default)]
struct Shared {
    inner: Mutex<Inner>,
    wake: Condvar,
}

impl Shared {
    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| SonifierError::msg("scan state has been poisoned"))
    }
}

/// Owns the scan position and the timing thread that advances it.
pub struct ScanController {
    shared: Arc<Shared>,
    frame: Arc<dyn FrameSource>,
    hooks: Arc<dyn HostHooks>,
    tempo: Arc<LiveTempo>,
    ticks: Sender<ScanTick>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ScanController {
    pub fn new(
        frame: Arc<dyn FrameSource>,
        hooks: Arc<dyn HostHooks>,
        tempo: Arc<LiveTempo>,
        ticks: Sender<ScanTick>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            frame,
            hooks,
            tempo,
            ticks,
            thread: Mutex::new(None),
        }
    }

    /// Spawns the timing thread unless it is already running.
    pub fn start(&self) -> Result<()> {
        let mut slot = self
            .thread
            .lock()
            .map_err(|_| SonifierError::msg("scan thread handle has been poisoned"))?;
        if slot.is_some() {
            return Ok(());
        }

        let timing = TimingLoop {
            shared: self.shared.clone(),
            frame: self.frame.clone(),
            hooks: self.hooks.clone(),
            tempo: self.tempo.clone(),
            ticks: self.ticks.clone(),
        };
        let handle = thread::Builder::new()
            .name("scan-timing".into())
            .spawn(move || timing.run())
            .map_err(|e| SonifierError::Thread(format!("failed to spawn timing thread: {e}")))?;
        *slot = Some(handle);
        tracing::debug!("scan timing thread started");
        Ok(())
    }

    /// Plays one pass from the left edge to the right edge.
    pub fn trigger_once(&self) -> Result<()> {
        self.activate(ScanMode::SingleShot, true)
    }

    /// Scans continuously, wrapping at the right edge.
    pub fn loop_scan(&self) -> Result<()> {
        self.activate(ScanMode::Continuous, false)
    }

    /// Advances exactly one pixel.
    pub fn step_once(&self) -> Result<()> {
        self.activate(ScanMode::SingleStep, false)
    }

    /// Goes idle, clears the scanline and releases every player.
    pub fn stop(&self) -> Result<()> {
        {
            let mut inner = self.shared.lock()?;
            inner.scan.mode = ScanMode::Idle;
            inner.scan.position = -1;
            inner.scan.changed = true;
            inner.wake_pending = true;
            // sent under the lock so no sample can follow the release
            self.ticks
                .send(ScanTick::Release)
                .map_err(|_| SonifierError::msg("tick channel is closed"))?;
        }
        self.shared.wake.notify_all();
        self.hooks.redraw();
        tracing::info!("scan stopped");
        Ok(())
    }

    /// Current state of the scanline.
    pub fn snapshot(&self) -> Result<ScanState> {
        Ok(self.shared.lock()?.scan)
    }

    /// Returns whether the scanline moved since the last call, clearing the flag.
    pub fn take_changed(&self) -> Result<bool> {
        let mut inner = self.shared.lock()?;
        Ok(std::mem::take(&mut inner.scan.changed))
    }

    /// Ends the timing thread and waits for it.
    pub fn shutdown(&self) -> Result<()> {
        {
            let mut inner = self.shared.lock()?;
            inner.shutdown = true;
        }
        self.shared.wake.notify_all();

        let handle = self
            .thread
            .lock()
            .map_err(|_| SonifierError::msg("scan thread handle has been poisoned"))?
            .take();
        if let Some(handle) = handle {
            handle
                .join()
                .map_err(|_| SonifierError::Thread("timing thread panicked".into()))?;
        }
        Ok(())
    }

    fn activate(&self, mode: ScanMode, rewind: bool) -> Result<()> {
        let was_idle = {
            let mut inner = self.shared.lock()?;
            let was_idle = !inner.scan.mode.is_active();
            inner.scan.mode = mode;
            if rewind {
                inner.scan.position = -1;
            }
            inner.wake_pending = true;
            was_idle
        };
        self.shared.wake.notify_all();
        if was_idle {
            self.hooks.activated();
        }
        tracing::debug!(?mode, "scan activated");
        Ok(())
    }
}

impl std::fmt::Debug for ScanController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanController")
            .field("shared", &self.shared)
            .finish()
    }
}

struct TimingLoop {
    shared: Arc<Shared>,
    frame: Arc<dyn FrameSource>,
    hooks: Arc<dyn HostHooks>,
    tempo: Arc<LiveTempo>,
    ticks: Sender<ScanTick>,
}

enum Step {
    Continue,
    Exit,
}

impl TimingLoop {
    fn run(self) {
        loop {
            match self.step() {
                Ok(Step::Continue) => {}
                Ok(Step::Exit) => break,
                Err(e) => {
                    tracing::error!(error = %e, "scan timing thread stopped");
                    break;
                }
            }
        }
        tracing::debug!("scan timing thread exited");
    }

    fn step(&self) -> Result<Step> {
        {
            let mut inner = self.shared.lock()?;
            while !inner.scan.mode.is_active() && !inner.shutdown {
                inner = self
                    .shared
                    .wake
                    .wait(inner)
                    .map_err(|_| SonifierError::msg("scan state has been poisoned"))?;
            }
            if inner.shutdown {
                return Ok(Step::Exit);
            }
            inner.wake_pending = false;
        }

        let width = self.frame.width();
        let Some(pacing) = Pacing::compute(width, &self.tempo.snapshot()) else {
            tracing::debug!("empty frame, backing off");
            self.sleep(EMPTY_FRAME_BACKOFF)?;
            return Ok(Step::Continue);
        };

        let (position, mode, finished) = {
            let mut inner = self.shared.lock()?;
            // a stop may have landed while the lock was released
            if !inner.scan.mode.is_active() {
                return Ok(Step::Continue);
            }
            let mode = inner.scan.mode;
            let finished = inner.scan.advance(width, pacing.increment);
            let position = inner.scan.position;

            if self.ticks.send(ScanTick::Sample { position }).is_err() {
                return Ok(Step::Exit);
            }
            if mode == ScanMode::SingleShot
                && finished
                && self.ticks.send(ScanTick::Release).is_err()
            {
                return Ok(Step::Exit);
            }
            (position, mode, finished)
        };

        self.hooks.redraw();
        tracing::trace!(position, increment = pacing.increment, "scan tick");

        match (mode, finished) {
            (ScanMode::SingleShot, true) => {
                tracing::debug!(position, "single shot reached the edge");
            }
            (ScanMode::SingleStep, _) => {}
            _ => self.sleep(pacing.interval)?,
        }
        Ok(Step::Continue)
    }

    /// Sleeps for `timeout` unless a mode change or shutdown arrives first.
    fn sleep(&self, timeout: Duration) -> Result<()> {
        let inner = self.shared.lock()?;
        let _ = self
            .shared
            .wake
            .wait_timeout_while(inner, timeout, |i| !i.wake_pending && !i.shutdown)
            .map_err(|_| SonifierError::msg("scan state has been poisoned"))?;
        Ok(())
    }
}

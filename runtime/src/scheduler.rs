//! Host-side sync cadence
//!
//! Two halves:
//! - [`SyncClock`] decides *when* a tick happens. It pulls frames from a
//!   [`TickSource`] and feeds their spacing through a [`CadenceAccumulator`],
//!   so jitter in frame timing neither drifts nor bursts the cadence.
//! - [`SyncScheduler`] decides *what* a tick sends: the diff against the
//!   previous baseline, a full state when the root changed shape, or a
//!   heartbeat once the room has been quiet for a heartbeat interval.

use log::{debug, info};
use shared::{deep_clone, generate_diff, Patch, Value};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant, Interval, MissedTickBehavior};

/// Receives one `Instant` per rendered frame from an embedding render loop
pub type FrameSignal = mpsc::UnboundedReceiver<Instant>;
pub type FrameSender = mpsc::UnboundedSender<Instant>;

/// Creates the channel a render loop uses to drive the scheduler
pub fn frame_channel() -> (FrameSender, FrameSignal) {
    mpsc::unbounded_channel()
}

/// Where frames come from
pub enum TickSource {
    /// Aligned with an external display refresh
    Frames(FrameSignal),
    /// Fixed-period timer, used when no refresh signal exists
    Interval(Interval),
}

impl TickSource {
    /// Picks the frame-aligned source when a frame signal is available
    pub fn detect(frames: Option<FrameSignal>, period: Duration) -> Self {
        match frames {
            Some(signal) => {
                info!("Sync scheduler aligned to frame signal");
                TickSource::Frames(signal)
            }
            None => {
                info!("No frame signal, sync scheduler using a {:?} timer", period);
                Self::fixed(period)
            }
        }
    }

    pub fn fixed(period: Duration) -> Self {
        let mut timer = interval(period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        TickSource::Interval(timer)
    }

    async fn next_frame(&mut self, period: Duration) -> Instant {
        if let TickSource::Frames(signal) = self {
            match signal.recv().await {
                Some(at) => return at,
                None => {
                    info!("Frame signal closed, falling back to a {:?} timer", period);
                    *self = Self::fixed(period);
                }
            }
        }

        match self {
            TickSource::Interval(timer) => timer.tick().await,
            // Replaced above when the signal closed
            TickSource::Frames(_) => Instant::now(),
        }
    }
}

/// Turns irregular frame spacing into a steady tick cadence
#[derive(Debug, Clone)]
pub struct CadenceAccumulator {
    cadence: Duration,
    epsilon: Duration,
    accumulated: Duration,
    last_frame: Option<Instant>,
}

impl CadenceAccumulator {
    pub fn new(cadence: Duration, epsilon: Duration) -> Self {
        Self {
            cadence,
            epsilon,
            accumulated: Duration::ZERO,
            last_frame: None,
        }
    }

    /// Records a frame at `now`; returns true when a tick is due
    ///
    /// The first frame only establishes the reference point. Leftover time
    /// is carried into the next tick, but never more than one cadence, so a
    /// long stall produces one tick rather than a burst.
    pub fn advance(&mut self, now: Instant) -> bool {
        let Some(previous) = self.last_frame.replace(now) else {
            return false;
        };

        self.accumulated += now.saturating_duration_since(previous);
        if self.accumulated + self.epsilon < self.cadence {
            return false;
        }

        self.accumulated = self.accumulated.saturating_sub(self.cadence);
        if self.accumulated > self.cadence {
            self.accumulated = Duration::ZERO;
        }
        true
    }

    pub fn cadence(&self) -> Duration {
        self.cadence
    }
}

/// A tick source paired with its accumulator
pub struct SyncClock {
    source: TickSource,
    accumulator: CadenceAccumulator,
}

impl SyncClock {
    pub fn new(source: TickSource, cadence: Duration, epsilon: Duration) -> Self {
        Self {
            source,
            accumulator: CadenceAccumulator::new(cadence, epsilon),
        }
    }

    /// Waits for the next frame that completes a tick
    pub async fn next_tick(&mut self) -> Instant {
        loop {
            let frame = self.source.next_frame(self.accumulator.cadence()).await;
            if self.accumulator.advance(frame) {
                return frame;
            }
        }
    }
}

/// What one scheduler tick produced
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    Idle,
    Patches(Vec<Patch>),
    /// The root itself changed shape; only a full state can express it
    FullState,
    Heartbeat,
}

pub struct SyncScheduler {
    baseline: Value,
    heartbeat_interval: Duration,
    last_send: Instant,
    ticks: u64,
}

impl SyncScheduler {
    pub fn new(state: &Value, heartbeat_interval: Duration, now: Instant) -> Self {
        Self {
            baseline: deep_clone(state),
            heartbeat_interval,
            last_send: now,
            ticks: 0,
        }
    }

    /// Diffs `state` against the baseline and rolls the baseline forward
    pub fn tick(&mut self, state: &Value, now: Instant) -> SyncOutcome {
        let patches = generate_diff(&self.baseline, state);
        self.baseline = deep_clone(state);
        self.ticks += 1;

        if patches.iter().any(|patch| patch.path.is_empty()) {
            self.last_send = now;
            return SyncOutcome::FullState;
        }

        if !patches.is_empty() {
            debug!("Sync tick {}: {} patches", self.ticks, patches.len());
            self.last_send = now;
            return SyncOutcome::Patches(patches);
        }

        if now.saturating_duration_since(self.last_send) >= self.heartbeat_interval {
            self.last_send = now;
            return SyncOutcome::Heartbeat;
        }

        SyncOutcome::Idle
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }
}

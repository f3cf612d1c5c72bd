//! The estimator aggregate and its single-writer sharing.
//!
//! [`Estimator`] owns the sample history, the speed estimate and the pause
//! state. Every mutation goes through [`Estimator::observe`] or
//! [`Estimator::reset`], each of which runs to completion synchronously, so a
//! reader can never see a speed that belongs to a different sample than the
//! position it is paired with.
//!
//! For concurrent use, [`Estimator::into_shared`] splits it into one
//! [`EstimatorWriter`] (held by the sync loop) and any number of cloned
//! [`EstimatorReader`]s (render loop, status reporting). Both sides go through
//! one mutex that is never held across an `.await`.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, info, warn};
use tokio::time::Instant;

use crate::config::EstimatorConfig;
use crate::history::{Sample, SampleHistory};
use crate::pause::{PauseDetector, PlaybackState};
use crate::speed::{SpeedEstimator, SpeedUpdate};
use crate::timing::TickRate;

/// What happened to one observed position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Observation {
    /// The sample entered the history; `update` says what the speed
    /// estimator made of it.
    Recorded(SpeedUpdate),
    /// The sample looked like a seek and was discarded. It is kept as a
    /// candidate in case the next sample confirms the seek.
    JumpRejected {
        position: u64,
        delta: f64,
        expected: f64,
    },
    /// Two consecutive, mutually consistent jumps: the estimator was reset and
    /// reseeded at the new location.
    SeekConfirmed { from: u64, to: u64 },
    /// The sample was timestamped before the newest one already held.
    OutOfOrder,
}

/// Position, speed and pause state captured together.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EstimatorSnapshot {
    /// Last accepted position, zero before the first sample.
    pub position: u64,
    pub observed_at: Option<Instant>,
    pub speed: f64,
    pub state: PlaybackState,
    pub sample_count: usize,
}

impl EstimatorSnapshot {
    /// Whether the remote playback is paused.
    pub fn is_paused(&self) -> bool {
        self.state.is_paused()
    }
}

/// Debug/telemetry view of the estimator. Regenerated on each request.
#[derive(Debug, Clone, PartialEq)]
pub struct EstimatorStatus {
    pub current_speed: f64,
    pub is_paused: bool,
    pub last_position: u64,
    pub last_update_time: Option<Instant>,
    pub history_size: usize,
    pub recent_samples: Vec<Sample>,
}

/// Sample history, speed estimate and pause state of one remote playback.
///
/// Every new position goes through [`Estimator::observe`], which records it,
/// updates the speed estimate and reclassifies the playback state in one
/// step. A sample rejected as a jump is remembered; if the next one confirms
/// the jump, it is treated as a seek and the estimator starts over there.
#[derive(Debug, Clone)]
pub struct Estimator {
    config: EstimatorConfig,
    rate: TickRate,
    history: SampleHistory,
    speed: SpeedEstimator,
    pause: PauseDetector,
    state: PlaybackState,
    seek_candidate: Option<Sample>,
}

impl Estimator {
    /// Create an empty estimator. `config` is assumed to be validated.
    pub fn new(config: EstimatorConfig) -> Self {
        Self {
            rate: config.tick_rate(),
            history: SampleHistory::with_capacity(config.history_capacity),
            speed: SpeedEstimator::new(config),
            pause: PauseDetector::new(config.pause_run, config.pause_min_elapsed),
            state: PlaybackState::Unloaded,
            seek_candidate: None,
            config,
        }
    }

    /// The configuration this estimator was built with.
    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    /// Record a freshly polled position and re-derive speed and pause state.
    pub fn observe(&mut self, position: u64, observed_at: Instant) -> Observation {
        if let Some(latest) = self.history.latest() {
            if observed_at < latest.observed_at {
                debug!("Ignoring out-of-order sample {position}");
                return Observation::OutOfOrder;
            }
        }

        self.history.record(position, observed_at);
        debug!("Measured: position={position}");

        let observation = match self.speed.update(&mut self.history) {
            SpeedUpdate::JumpRejected {
                rejected,
                delta,
                expected,
            } => self.on_jump(rejected, delta, expected),
            update => {
                self.seek_candidate = None;
                Observation::Recorded(update)
            }
        };

        self.refresh_state();
        observation
    }

    fn on_jump(&mut self, rejected: Sample, delta: f64, expected: f64) -> Observation {
        let Some(candidate) = self.seek_candidate.take() else {
            self.seek_candidate = Some(rejected);
            return Observation::JumpRejected {
                position: rejected.position,
                delta,
                expected,
            };
        };

        if !self.continues(&candidate, &rejected) {
            self.seek_candidate = Some(rejected);
            return Observation::JumpRejected {
                position: rejected.position,
                delta,
                expected,
            };
        }

        let from = self.last_position();
        info!(
            "Seek confirmed: {from} -> {}, resetting estimator",
            rejected.position
        );
        self.reset();
        self.history.record(candidate.position, candidate.observed_at);
        self.speed.update(&mut self.history);
        self.history.record(rejected.position, rejected.observed_at);
        self.speed.update(&mut self.history);
        Observation::SeekConfirmed {
            from,
            to: rejected.position,
        }
    }

    /// Whether `next` plausibly follows `candidate` at the current speed.
    fn continues(&self, candidate: &Sample, next: &Sample) -> bool {
        let span = next.observed_at.saturating_duration_since(candidate.observed_at);
        let delta = (next.position as f64 - candidate.position as f64).abs();
        let expected = self
            .rate
            .expected_ticks(span, self.speed.estimate().max(1.0))
            .max(1.0);
        delta <= self.config.jump_factor * expected
    }

    fn refresh_state(&mut self) {
        let state = self.pause.classify(&self.history);
        if state != self.state {
            match state {
                PlaybackState::Paused => warn!(
                    "Pause detected: {} identical positions ({})",
                    self.config.pause_run,
                    self.last_position()
                ),
                PlaybackState::Playing if self.state.is_paused() => {
                    info!("Resume detected: positions changing again")
                }
                _ => debug!("Playback state {} -> {state}", self.state),
            }
        }
        self.state = state;
    }

    /// Clear history, return to 1x and forget the pause state.
    pub fn reset(&mut self) {
        self.history.clear();
        self.speed.reset();
        self.state = PlaybackState::Unloaded;
        self.seek_candidate = None;
    }

    /// Last accepted position, or 0 before the first sample.
    pub fn last_position(&self) -> u64 {
        self.history.latest().map(|s| s.position).unwrap_or(0)
    }

    /// When the last accepted position was observed.
    pub fn last_update_time(&self) -> Option<Instant> {
        self.history.latest().map(|s| s.observed_at)
    }

    /// Smoothed speed multiplier.
    pub fn speed(&self) -> f64 {
        self.speed.estimate()
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn is_paused(&self) -> bool {
        self.state.is_paused()
    }

    /// Samples currently held.
    pub fn history(&self) -> &SampleHistory {
        &self.history
    }

    /// Position, speed and pause state, captured together.
    pub fn snapshot(&self) -> EstimatorSnapshot {
        EstimatorSnapshot {
            position: self.last_position(),
            observed_at: self.last_update_time(),
            speed: self.speed(),
            state: self.state,
            sample_count: self.history.len(),
        }
    }

    /// Regenerate the telemetry view. No side effects.
    pub fn status(&self) -> EstimatorStatus {
        EstimatorStatus {
            current_speed: self.speed(),
            is_paused: self.is_paused(),
            last_position: self.last_position(),
            last_update_time: self.last_update_time(),
            history_size: self.history.len(),
            recent_samples: self.history.iter().copied().collect(),
        }
    }

    /// Split into the single writer and a cloneable reader.
    pub fn into_shared(self) -> (EstimatorWriter, EstimatorReader) {
        let inner = Arc::new(Mutex::new(self));
        (
            EstimatorWriter {
                inner: Arc::clone(&inner),
            },
            EstimatorReader { inner },
        )
    }
}

fn lock(inner: &Mutex<Estimator>) -> MutexGuard<'_, Estimator> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The only handle that can mutate a shared [`Estimator`]. Not `Clone`.
#[derive(Debug)]
pub struct EstimatorWriter {
    inner: Arc<Mutex<Estimator>>,
}

impl EstimatorWriter {
    /// Record a polled position. See [`Estimator::observe`].
    pub fn observe(&mut self, position: u64, observed_at: Instant) -> Observation {
        lock(&self.inner).observe(position, observed_at)
    }

    /// Drop all estimator state. See [`Estimator::reset`].
    pub fn reset(&mut self) {
        lock(&self.inner).reset();
    }

    /// Consistent snapshot of the shared estimator.
    pub fn snapshot(&self) -> EstimatorSnapshot {
        lock(&self.inner).snapshot()
    }

    /// A new reader onto the same estimator.
    pub fn reader(&self) -> EstimatorReader {
        EstimatorReader {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Read-only handle to a shared [`Estimator`].
#[derive(Debug, Clone)]
pub struct EstimatorReader {
    inner: Arc<Mutex<Estimator>>,
}

impl EstimatorReader {
    /// Position, speed and pause state, read in one critical section.
    pub fn snapshot(&self) -> EstimatorSnapshot {
        lock(&self.inner).snapshot()
    }

    /// Telemetry view of the shared estimator.
    pub fn status(&self) -> EstimatorStatus {
        lock(&self.inner).status()
    }
}

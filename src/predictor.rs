use std::time::Duration;

use log::{debug, trace};
use tokio::time::Instant;

use crate::config::EstimatorConfig;
use crate::estimator::EstimatorSnapshot;
use crate::timing::TickRate;

/// How a [`Prediction`] was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredictionMode {
    /// Nothing loaded at the source; the position is zero.
    Unloaded,
    /// Paused: the last known position, without extrapolation.
    Paused,
    /// Extrapolated at the estimated speed.
    SpeedAware,
    /// Extrapolated at 1x, within the drift bound.
    FixedRate,
    /// A 1x extrapolation drifted too far and was snapped back.
    Snapped,
    /// No sample arrived for longer than the extrapolation limit; the
    /// prediction holds at the limit.
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prediction {
    pub position: u64,
    pub mode: PredictionMode,
}

impl Prediction {
    fn new(position: u64, mode: PredictionMode) -> Self {
        Self { position, mode }
    }
}

/// Predicts the remote position "now" from an [`EstimatorSnapshot`].
///
/// Speed-aware extrapolation is the normal path. Until the estimator holds
/// two samples there is no speed to speak of, and the fixed-rate path with
/// drift snapping is used instead.
#[derive(Debug, Clone, Copy)]
pub struct Predictor {
    rate: TickRate,
    max_drift: u64,
    max_extrapolation: Duration,
}

impl Predictor {
    /// Create a predictor from the rate, drift and extrapolation settings of
    /// `config`.
    pub fn new(config: &EstimatorConfig) -> Self {
        Self {
            rate: config.tick_rate(),
            max_drift: config.max_drift,
            max_extrapolation: config.max_extrapolation,
        }
    }

    /// Predict the remote position at `now`.
    ///
    /// Uses [`Predictor::fixed_rate`] until two samples exist, then
    /// [`Predictor::speed_aware`].
    pub fn predict(&self, snapshot: &EstimatorSnapshot, now: Instant) -> Prediction {
        if snapshot.sample_count < 2 {
            self.fixed_rate(snapshot, now)
        } else {
            self.speed_aware(snapshot, now)
        }
    }

    /// `position + floor(elapsed * nominal * speed)`, short-circuiting on
    /// pause and on an unloaded source.
    ///
    /// `elapsed` is capped at the configured extrapolation limit, so a
    /// prediction made from stale data stays bounded.
    pub fn speed_aware(&self, snapshot: &EstimatorSnapshot, now: Instant) -> Prediction {
        if snapshot.is_paused() {
            trace!("Paused, holding at {}", snapshot.position);
            return Prediction::new(snapshot.position, PredictionMode::Paused);
        }
        if snapshot.position == 0 {
            return Prediction::new(0, PredictionMode::Unloaded);
        }

        let mut elapsed = elapsed_since(snapshot, now);
        let mut mode = PredictionMode::SpeedAware;
        if elapsed > self.max_extrapolation {
            trace!(
                "No sample for {:.3}s, holding extrapolation at {:.3}s",
                elapsed.as_secs_f64(),
                self.max_extrapolation.as_secs_f64()
            );
            elapsed = self.max_extrapolation;
            mode = PredictionMode::Stale;
        }
        let ticks = self.rate.whole_ticks(elapsed, snapshot.speed);
        let predicted = snapshot.position.saturating_add(ticks);
        trace!(
            "Prediction: last={}, elapsed={:.3}s, speed={:.2}x, predicted={predicted}",
            snapshot.position,
            elapsed.as_secs_f64(),
            snapshot.speed
        );
        Prediction::new(predicted, mode)
    }

    /// `position + floor(elapsed * nominal)`, snapping back to the last
    /// confirmed position once the drift exceeds `max_drift`.
    pub fn fixed_rate(&self, snapshot: &EstimatorSnapshot, now: Instant) -> Prediction {
        if snapshot.position == 0 {
            return Prediction::new(0, PredictionMode::Unloaded);
        }

        let ticks = self.rate.whole_ticks(elapsed_since(snapshot, now), 1.0);
        if ticks > self.max_drift {
            debug!("Large drift ({ticks} ticks), snapping to {}", snapshot.position);
            return Prediction::new(snapshot.position, PredictionMode::Snapped);
        }
        Prediction::new(
            snapshot.position.saturating_add(ticks),
            PredictionMode::FixedRate,
        )
    }
}

fn elapsed_since(snapshot: &EstimatorSnapshot, now: Instant) -> Duration {
    snapshot
        .observed_at
        .map(|at| now.saturating_duration_since(at))
        .unwrap_or_default()
}

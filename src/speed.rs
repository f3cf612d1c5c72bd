use std::time::Duration;

use log::{debug, trace, warn};

use crate::config::EstimatorConfig;
use crate::history::{Sample, SampleHistory};
use crate::timing::TickRate;

/// Result of feeding one new sample to the [`SpeedEstimator`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SpeedUpdate {
    /// Fewer than two samples; the estimate is unchanged.
    Insufficient,
    /// The window spans too little wall time to be informative.
    WindowTooNarrow { span: Duration },
    /// The newest sample moved far more than the current speed allows. It
    /// has been removed from the history.
    JumpRejected {
        rejected: Sample,
        delta: f64,
        expected: f64,
    },
    /// The raw speed strayed too far from the estimate and was not applied.
    OutlierRejected { raw: f64 },
    /// The raw speed was folded into the smoothed estimate.
    Updated { raw: f64, estimate: f64 },
}

/// Smoothed playback-rate multiplier derived from the sample history.
///
/// Each update measures the slope between the two ends of the most recent
/// window, rejects seeks and outliers, then applies an exponential moving
/// average. Two consecutive outliers that agree with each other are taken as
/// a real change of speed and are applied; any other outcome in between
/// breaks the pair.
#[derive(Debug, Clone)]
pub struct SpeedEstimator {
    config: EstimatorConfig,
    rate: TickRate,
    estimate: f64,
    pending_outlier: Option<f64>,
}

impl SpeedEstimator {
    /// Create an estimator starting at 1x.
    pub fn new(config: EstimatorConfig) -> Self {
        Self {
            rate: config.tick_rate(),
            estimate: initial_speed(&config),
            pending_outlier: None,
            config,
        }
    }

    /// Current smoothed speed multiplier.
    pub fn estimate(&self) -> f64 {
        self.estimate
    }

    /// Forget all measurements and return to 1x.
    pub fn reset(&mut self) {
        self.estimate = initial_speed(&self.config);
        self.pending_outlier = None;
    }

    /// Run one estimation step against `history`, whose newest entry is the
    /// sample that just arrived.
    ///
    /// On a jump the newest sample is discarded from `history`.
    pub fn update(&mut self, history: &mut SampleHistory) -> SpeedUpdate {
        let count = history.len();
        let (oldest, newest) = {
            let mut window = history.window(self.config.speed_window);
            match (window.next(), window.next_back()) {
                (Some(oldest), Some(newest)) => (*oldest, *newest),
                _ => {
                    self.pending_outlier = None;
                    return SpeedUpdate::Insufficient;
                }
            }
        };

        let span = newest.observed_at.saturating_duration_since(oldest.observed_at);
        if span < self.config.min_window_span {
            debug!(
                "Window span {:.3}s too small, keeping speed={:.2}x",
                span.as_secs_f64(),
                self.estimate
            );
            self.pending_outlier = None;
            return SpeedUpdate::WindowTooNarrow { span };
        }

        let delta = newest.position as f64 - oldest.position as f64;
        let expected = self.rate.expected_ticks(span, self.estimate);

        if count >= 3 && delta.abs() > self.config.jump_factor * expected.abs() {
            warn!(
                "Jump detected: {delta} ticks (expected ~{expected:.0}), discarding sample at {}",
                newest.position
            );
            history.discard_latest();
            self.pending_outlier = None;
            return SpeedUpdate::JumpRejected {
                rejected: newest,
                delta,
                expected,
            };
        }

        let measured = delta / span.as_secs_f64();
        let raw = self
            .rate
            .speed_of(measured)
            .clamp(self.config.min_speed, self.config.max_speed);

        if count >= 3 && (raw - self.estimate).abs() > self.config.outlier_threshold {
            match self.pending_outlier {
                Some(previous) if (previous - raw).abs() <= self.config.outlier_threshold => {
                    debug!(
                        "Outlier {raw:.2}x confirmed by previous {previous:.2}x, accepting speed change"
                    );
                }
                _ => {
                    warn!(
                        "Outlier detected: {raw:.2}x (current avg: {:.2}x), discarding",
                        self.estimate
                    );
                    self.pending_outlier = Some(raw);
                    return SpeedUpdate::OutlierRejected { raw };
                }
            }
        }

        let alpha = self.config.smoothing_alpha;
        self.estimate = (alpha * raw + (1.0 - alpha) * self.estimate)
            .clamp(self.config.min_speed, self.config.max_speed);
        self.pending_outlier = None;

        trace!(
            "Speed: delta={delta}, span={:.3}s, measured={measured:.1} tps, raw={raw:.2}x, smoothed={:.2}x",
            span.as_secs_f64(),
            self.estimate
        );

        SpeedUpdate::Updated {
            raw,
            estimate: self.estimate,
        }
    }
}

fn initial_speed(config: &EstimatorConfig) -> f64 {
    1.0_f64.clamp(config.min_speed, config.max_speed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    /// Feed `(position, seconds)` pairs one at a time, returning each outcome.
    fn feed(
        estimator: &mut SpeedEstimator,
        history: &mut SampleHistory,
        t0: Instant,
        samples: &[(u64, f64)],
    ) -> Vec<SpeedUpdate> {
        samples
            .iter()
            .map(|&(position, secs)| {
                history.record(position, t0 + Duration::from_secs_f64(secs));
                estimator.update(history)
            })
            .collect()
    }

    fn constant_rate(start: u64, speed: f64, step: f64, count: usize) -> Vec<(u64, f64)> {
        (0..count)
            .map(|i| {
                let secs = i as f64 * step;
                (start + (secs * 64.0 * speed).round() as u64, secs)
            })
            .collect()
    }

    fn setup() -> (SpeedEstimator, SampleHistory, Instant) {
        let config = EstimatorConfig::default();
        (
            SpeedEstimator::new(config),
            SampleHistory::with_capacity(config.history_capacity),
            Instant::now(),
        )
    }

    #[test]
    fn test_single_sample_is_insufficient() {
        let (mut est, mut history, t0) = setup();
        let outcomes = feed(&mut est, &mut history, t0, &[(1000, 0.0)]);
        assert_eq!(outcomes, vec![SpeedUpdate::Insufficient]);
        assert_eq!(est.estimate(), 1.0);
    }

    #[test]
    fn test_normal_speed_pair() {
        let (mut est, mut history, t0) = setup();
        feed(&mut est, &mut history, t0, &[(1000, 0.0), (1032, 0.5)]);
        assert!((est.estimate() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_narrow_window_keeps_estimate() {
        let (mut est, mut history, t0) = setup();
        let outcomes = feed(&mut est, &mut history, t0, &[(1000, 0.0), (1064, 0.005)]);
        assert!(matches!(outcomes[1], SpeedUpdate::WindowTooNarrow { .. }));
        assert_eq!(est.estimate(), 1.0);
    }

    #[test]
    fn test_converges_on_constant_rates() {
        for speed in [0.5, 1.0, 2.0] {
            let (mut est, mut history, t0) = setup();
            feed(&mut est, &mut history, t0, &constant_rate(1000, speed, 0.5, 10));
            let error = (est.estimate() - speed).abs() / speed;
            assert!(
                error <= 0.1,
                "speed {speed}: estimate {} off by {:.1}%",
                est.estimate(),
                error * 100.0
            );
        }
    }

    #[test]
    fn test_slow_playback_trends_down() {
        let (mut est, mut history, t0) = setup();
        let samples = constant_rate(1000, 0.25, 0.5, 16);

        let mut previous = est.estimate();
        for (i, &sample) in samples.iter().enumerate() {
            feed(&mut est, &mut history, t0, &[sample]);
            assert!(est.estimate() <= previous, "estimate rose at sample {i}");
            previous = est.estimate();
        }
        assert!((est.estimate() - 0.25).abs() < 0.025, "got {}", est.estimate());
    }

    #[test]
    fn test_jump_is_discarded() {
        let (mut est, mut history, t0) = setup();
        feed(
            &mut est,
            &mut history,
            t0,
            &[(936, 0.0), (968, 0.5), (1000, 1.0)],
        );
        let before = est.estimate();

        let outcomes = feed(&mut est, &mut history, t0, &[(50_000, 1.5)]);
        match outcomes[0] {
            SpeedUpdate::JumpRejected { rejected, .. } => assert_eq!(rejected.position, 50_000),
            other => panic!("expected jump rejection, got {other:?}"),
        }
        assert_eq!(est.estimate(), before);
        assert_eq!(history.len(), 3);
        assert_eq!(history.latest().map(|s| s.position), Some(1000));
    }

    #[test]
    fn test_no_jump_rejection_with_two_samples() {
        let (mut est, mut history, t0) = setup();
        let outcomes = feed(&mut est, &mut history, t0, &[(1000, 0.0), (50_000, 0.5)]);
        assert!(matches!(outcomes[1], SpeedUpdate::Updated { .. }));
        assert_eq!(history.len(), 2);
    }

    #[test]
    fn test_single_outlier_rejected_then_confirmed() {
        let (mut est, mut history, t0) = setup();
        feed(&mut est, &mut history, t0, &constant_rate(1000, 1.0, 0.5, 5));
        assert!((est.estimate() - 1.0).abs() < 1e-9);

        // Window [1032@0.5 .. 1237@2.5] measures ~1.6x.
        let outcomes = feed(&mut est, &mut history, t0, &[(1237, 2.5)]);
        assert!(matches!(outcomes[0], SpeedUpdate::OutlierRejected { .. }));
        assert!((est.estimate() - 1.0).abs() < 1e-9);
        assert_eq!(history.len(), 6);

        // Window [1064@1.0 .. 1269@3.0] agrees, so the change is accepted.
        let outcomes = feed(&mut est, &mut history, t0, &[(1269, 3.0)]);
        assert!(matches!(outcomes[0], SpeedUpdate::Updated { .. }));
        assert!(est.estimate() > 1.15 && est.estimate() < 1.2);
    }

    #[test]
    fn test_outliers_split_by_jump_do_not_confirm() {
        let (mut est, mut history, t0) = setup();
        feed(&mut est, &mut history, t0, &constant_rate(1000, 1.0, 0.5, 5));

        // ~1.6x, then a seek, then ~1.66x: not consecutive.
        let outcomes = feed(
            &mut est,
            &mut history,
            t0,
            &[(1237, 2.5), (50_000, 3.0), (1330, 3.5)],
        );
        assert!(matches!(outcomes[0], SpeedUpdate::OutlierRejected { .. }));
        assert!(matches!(outcomes[1], SpeedUpdate::JumpRejected { .. }));
        assert!(matches!(outcomes[2], SpeedUpdate::OutlierRejected { .. }));
        assert!((est.estimate() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_raw_speed_is_clamped() {
        let (mut est, mut history, t0) = setup();
        let outcomes = feed(&mut est, &mut history, t0, &[(1000, 0.0), (1000, 1.0)]);
        match outcomes[1] {
            SpeedUpdate::Updated { raw, estimate } => {
                assert_eq!(raw, 0.05);
                assert!((estimate - 0.715).abs() < 1e-9);
            }
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[test]
    fn test_reset_returns_to_unity() {
        let (mut est, mut history, t0) = setup();
        feed(&mut est, &mut history, t0, &[(1000, 0.0), (1128, 0.5)]);
        assert!(est.estimate() > 1.0);
        est.reset();
        assert_eq!(est.estimate(), 1.0);
    }
}

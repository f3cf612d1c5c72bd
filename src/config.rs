use std::time::Duration;

use crate::error::ConfigError;
use crate::retry::RetryPolicy;
use crate::timing::TickRate;

/// Tuning for the estimator: history, speed estimation, pause detection and
/// prediction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EstimatorConfig {
    /// Expected ticks per second at 1x speed.
    pub nominal_rate: f64,
    /// Maximum number of samples kept in history.
    pub history_capacity: usize,
    /// Number of most recent samples spanned by a speed measurement.
    pub speed_window: usize,
    /// Number of identical samples required to declare a pause.
    pub pause_run: usize,
    /// Minimum wall time the identical run must span.
    pub pause_min_elapsed: Duration,
    /// Largest tolerated gap, in ticks, between a fixed-rate prediction and
    /// the last confirmed position before snapping back.
    pub max_drift: u64,
    pub min_speed: f64,
    pub max_speed: f64,
    /// Largest tolerated deviation of a raw speed measurement from the
    /// running estimate.
    pub outlier_threshold: f64,
    /// EMA weight given to each new measurement.
    pub smoothing_alpha: f64,
    /// A position delta above `jump_factor` times the expected delta is a seek.
    pub jump_factor: f64,
    /// Windows narrower than this carry no usable speed information.
    pub min_window_span: Duration,
    /// Longest stretch the predictor extrapolates past the last sample.
    /// Beyond it the prediction holds, so a source that went quiet is not
    /// run ahead of indefinitely. Defaults to one forced-resync interval plus
    /// its timeout.
    pub max_extrapolation: Duration,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            nominal_rate: 64.0,
            history_capacity: 10,
            speed_window: 5,
            pause_run: 3,
            pause_min_elapsed: Duration::from_millis(100),
            max_drift: 10,
            min_speed: 0.05,
            max_speed: 5.0,
            outlier_threshold: 0.5,
            smoothing_alpha: 0.3,
            jump_factor: 5.0,
            min_window_span: Duration::from_millis(10),
            max_extrapolation: Duration::from_millis(3500),
        }
    }
}

impl EstimatorConfig {
    /// Set the expected ticks per second at 1x speed.
    pub fn with_nominal_rate(mut self, ticks_per_sec: f64) -> Self {
        self.nominal_rate = ticks_per_sec;
        self
    }

    /// Set how many samples the history keeps.
    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }

    /// Set how many recent samples a speed measurement spans.
    pub fn with_speed_window(mut self, window: usize) -> Self {
        self.speed_window = window;
        self
    }

    /// Set the pause rule.
    ///
    /// # Arguments
    ///
    /// * `run` - Number of identical positions that make a pause.
    /// * `min_elapsed` - Wall time the run must span.
    pub fn with_pause_run(mut self, run: usize, min_elapsed: Duration) -> Self {
        self.pause_run = run;
        self.pause_min_elapsed = min_elapsed;
        self
    }

    /// Set the drift, in ticks, tolerated by the fixed-rate predictor.
    pub fn with_max_drift(mut self, ticks: u64) -> Self {
        self.max_drift = ticks;
        self
    }

    /// Clamp raw and smoothed speed to `min..=max`.
    pub fn with_speed_bounds(mut self, min: f64, max: f64) -> Self {
        self.min_speed = min;
        self.max_speed = max;
        self
    }

    /// Set the largest accepted deviation from the running estimate.
    pub fn with_outlier_threshold(mut self, threshold: f64) -> Self {
        self.outlier_threshold = threshold;
        self
    }

    /// Set the EMA weight given to each new measurement.
    pub fn with_smoothing_alpha(mut self, alpha: f64) -> Self {
        self.smoothing_alpha = alpha;
        self
    }

    /// Cap extrapolation past the last sample at `limit`.
    pub fn with_max_extrapolation(mut self, limit: Duration) -> Self {
        self.max_extrapolation = limit;
        self
    }

    /// The nominal rate as a [`TickRate`].
    pub fn tick_rate(&self) -> TickRate {
        TickRate::new(self.nominal_rate)
    }

    /// Check every field, returning the first violation found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.nominal_rate.is_finite() && self.nominal_rate > 0.0) {
            return Err(ConfigError::NominalRate(self.nominal_rate));
        }
        min_count("history_capacity", self.history_capacity, 2)?;
        min_count("speed_window", self.speed_window, 2)?;
        min_count("pause_run", self.pause_run, 2)?;
        if self.speed_window > self.history_capacity {
            return Err(ConfigError::TooSmall {
                name: "history_capacity",
                min: self.speed_window,
                value: self.history_capacity,
            });
        }
        if self.pause_run > self.history_capacity {
            return Err(ConfigError::TooSmall {
                name: "history_capacity",
                min: self.pause_run,
                value: self.history_capacity,
            });
        }
        if !(self.min_speed.is_finite()
            && self.max_speed.is_finite()
            && self.min_speed > 0.0
            && self.min_speed <= self.max_speed)
        {
            return Err(ConfigError::SpeedBounds {
                min: self.min_speed,
                max: self.max_speed,
            });
        }
        if !(self.smoothing_alpha > 0.0 && self.smoothing_alpha <= 1.0) {
            return Err(ConfigError::SmoothingWeight(self.smoothing_alpha));
        }
        positive("outlier_threshold", self.outlier_threshold)?;
        positive("jump_factor", self.jump_factor)?;
        non_zero("max_extrapolation", self.max_extrapolation)
    }
}

/// Polling cadence and forced-resync policy for the sync scheduler.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncConfig {
    /// Period of the sync loop.
    pub poll_interval: Duration,
    /// A forced (active) query is issued at least this often.
    pub force_sync_interval: Duration,
    /// Upper bound on a single forced query.
    pub force_sync_timeout: Duration,
    /// Positions below this are discarded as garbage.
    pub min_valid_position: u64,
    /// Positions above this are discarded as garbage.
    pub max_valid_position: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            force_sync_interval: Duration::from_millis(1500),
            force_sync_timeout: Duration::from_secs(2),
            min_valid_position: 0,
            max_valid_position: u64::MAX,
        }
    }
}

impl SyncConfig {
    /// Set the period of the sync loop.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set how often a forced query is issued.
    pub fn with_force_sync_interval(mut self, interval: Duration) -> Self {
        self.force_sync_interval = interval;
        self
    }

    /// Set the upper bound on a single forced query.
    pub fn with_force_sync_timeout(mut self, timeout: Duration) -> Self {
        self.force_sync_timeout = timeout;
        self
    }

    /// Only record positions within `min..=max`.
    pub fn with_valid_positions(mut self, min: u64, max: u64) -> Self {
        self.min_valid_position = min;
        self.max_valid_position = max;
        self
    }

    /// Whether a position reported by the source is worth recording.
    pub fn accepts(&self, position: u64) -> bool {
        (self.min_valid_position..=self.max_valid_position).contains(&position)
    }

    /// Reject zero intervals and an empty valid position range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        non_zero("poll_interval", self.poll_interval)?;
        non_zero("force_sync_interval", self.force_sync_interval)?;
        non_zero("force_sync_timeout", self.force_sync_timeout)?;
        if self.min_valid_position > self.max_valid_position {
            return Err(ConfigError::PositionRange {
                min: self.min_valid_position,
                max: self.max_valid_position,
            });
        }
        Ok(())
    }
}

/// Everything the [`Coordinator`](crate::coordinator::Coordinator) needs.
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorConfig {
    pub estimator: EstimatorConfig,
    pub sync: SyncConfig,
    /// Period of the render loop (about 60 Hz by default).
    pub render_interval: Duration,
    /// Period of the identity-tracking loop.
    pub identity_interval: Duration,
    /// Consecutive transport failures tolerated before reconnecting.
    pub failures_before_reconnect: u32,
    /// Policy for the initial connect and for reconnects.
    pub retry: RetryPolicy,
    /// The render loop logs a summary once every this many frames.
    pub frames_per_summary: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            estimator: EstimatorConfig::default(),
            sync: SyncConfig::default(),
            render_interval: Duration::from_micros(16_667),
            identity_interval: Duration::from_secs(1),
            failures_before_reconnect: 3,
            retry: RetryPolicy::default(),
            frames_per_summary: 600,
        }
    }
}

impl CoordinatorConfig {
    /// Replace the estimator configuration.
    pub fn with_estimator_config(mut self, config: EstimatorConfig) -> Self {
        self.estimator = config;
        self
    }

    /// Replace the sync configuration.
    pub fn with_sync_config(mut self, config: SyncConfig) -> Self {
        self.sync = config;
        self
    }

    /// Set the period of the render loop.
    pub fn with_render_interval(mut self, interval: Duration) -> Self {
        self.render_interval = interval;
        self
    }

    /// Set the period of the identity-tracking loop.
    pub fn with_identity_interval(mut self, interval: Duration) -> Self {
        self.identity_interval = interval;
        self
    }

    /// Set how many consecutive sync failures trigger a reconnect.
    pub fn with_failures_before_reconnect(mut self, failures: u32) -> Self {
        self.failures_before_reconnect = failures;
        self
    }

    /// Set the backoff used for connecting and reconnecting.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Validate every nested configuration, returning the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.estimator.validate()?;
        self.sync.validate()?;
        non_zero("render_interval", self.render_interval)?;
        non_zero("identity_interval", self.identity_interval)?;
        min_count(
            "failures_before_reconnect",
            self.failures_before_reconnect as usize,
            1,
        )?;
        min_count("frames_per_summary", self.frames_per_summary as usize, 1)?;
        self.retry.validate()
    }
}

fn min_count(name: &'static str, value: usize, min: usize) -> Result<(), ConfigError> {
    if value < min {
        return Err(ConfigError::TooSmall { name, min, value });
    }
    Ok(())
}

fn positive(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if !(value.is_finite() && value > 0.0) {
        return Err(ConfigError::NonPositive { name, value });
    }
    Ok(())
}

pub(crate) fn non_zero(name: &'static str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::ZeroInterval { name });
    }
    Ok(())
}

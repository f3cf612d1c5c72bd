use std::fmt;
use std::time::Duration;

use crate::history::SampleHistory;

/// Playback state as inferred from the most recent samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaybackState {
    /// Position pinned at zero: the source has nothing loaded yet.
    #[default]
    Unloaded,
    Playing,
    /// Position frozen while wall time passes.
    Paused,
}

impl PlaybackState {
    pub fn is_paused(self) -> bool {
        self == PlaybackState::Paused
    }
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PlaybackState::Unloaded => "unloaded",
            PlaybackState::Playing => "playing",
            PlaybackState::Paused => "paused",
        };
        f.write_str(name)
    }
}

/// Classifies the tail of a [`SampleHistory`] as paused or playing.
///
/// A pause is `run` identical, non-zero positions spanning more than
/// `min_elapsed`. Any movement, even one tick, is playback.
#[derive(Debug, Clone, Copy)]
pub struct PauseDetector {
    run: usize,
    min_elapsed: Duration,
}

impl PauseDetector {
    /// Create a detector.
    ///
    /// # Arguments
    ///
    /// * `run` - Number of trailing samples that must be identical.
    /// * `min_elapsed` - Wall time those samples must span, exclusive.
    pub fn new(run: usize, min_elapsed: Duration) -> Self {
        Self { run, min_elapsed }
    }

    /// Classify the tail of `history`.
    pub fn classify(&self, history: &SampleHistory) -> PlaybackState {
        let Some(latest) = history.latest() else {
            return PlaybackState::Unloaded;
        };
        if latest.position == 0 {
            return PlaybackState::Unloaded;
        }
        if history.len() < self.run {
            return PlaybackState::Playing;
        }

        let mut window = history.window(self.run);
        let Some(first) = window.next().copied() else {
            return PlaybackState::Playing;
        };
        let frozen = window.all(|s| s.position == first.position);
        let span = latest.observed_at.saturating_duration_since(first.observed_at);

        if frozen && span > self.min_elapsed {
            PlaybackState::Paused
        } else {
            PlaybackState::Playing
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    fn history_of(samples: &[(u64, u64)]) -> SampleHistory {
        let t0 = Instant::now();
        let mut history = SampleHistory::with_capacity(10);
        for &(position, millis) in samples {
            history.record(position, t0 + Duration::from_millis(millis));
        }
        history
    }

    fn detector() -> PauseDetector {
        PauseDetector::new(3, Duration::from_millis(100))
    }

    #[test]
    fn test_identical_run_is_paused() {
        let history = history_of(&[(5000, 0), (5000, 200), (5000, 400)]);
        assert_eq!(detector().classify(&history), PlaybackState::Paused);
    }

    #[test]
    fn test_zero_run_is_never_paused() {
        let history = history_of(&[(0, 0), (0, 200), (0, 400), (0, 600)]);
        assert_eq!(detector().classify(&history), PlaybackState::Unloaded);
    }

    #[test]
    fn test_short_run_is_playing() {
        let history = history_of(&[(5000, 0), (5000, 200)]);
        assert_eq!(detector().classify(&history), PlaybackState::Playing);
    }

    #[test]
    fn test_run_must_span_minimum_time() {
        let history = history_of(&[(5000, 0), (5000, 40), (5000, 80)]);
        assert_eq!(detector().classify(&history), PlaybackState::Playing);
    }

    #[test]
    fn test_slow_movement_is_playing() {
        let history = history_of(&[(5000, 0), (5000, 500), (5001, 1000)]);
        assert_eq!(detector().classify(&history), PlaybackState::Playing);
    }

    #[test]
    fn test_only_tail_matters() {
        let history = history_of(&[(4000, 0), (4500, 500), (5000, 1000), (5000, 1500), (5000, 2000)]);
        assert_eq!(detector().classify(&history), PlaybackState::Paused);
    }

    #[test]
    fn test_empty_history_is_unloaded() {
        assert_eq!(
            detector().classify(&SampleHistory::with_capacity(4)),
            PlaybackState::Unloaded
        );
    }
}

use std::collections::vec_deque::{self, VecDeque};

use tokio::time::Instant;

/// One successful poll of the tick source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    pub position: u64,
    pub observed_at: Instant,
}

impl Sample {
    /// Create a sample of `position` observed at `observed_at`.
    pub fn new(position: u64, observed_at: Instant) -> Self {
        Self {
            position,
            observed_at,
        }
    }
}

/// Fixed-capacity, time-ordered ring of recent samples.
///
/// Recording at capacity evicts the oldest sample. No plausibility checks
/// happen here; see [`SpeedEstimator`](crate::speed::SpeedEstimator).
#[derive(Debug, Clone)]
pub struct SampleHistory {
    samples: VecDeque<Sample>,
    capacity: usize,
}

impl SampleHistory {
    /// Create an empty history holding at most `capacity` samples.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a sample, evicting the oldest one if the history is full.
    pub fn record(&mut self, position: u64, observed_at: Instant) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(Sample::new(position, observed_at));
    }

    /// The most recent `n` samples (or fewer), oldest first.
    pub fn window(&self, n: usize) -> vec_deque::Iter<'_, Sample> {
        let start = self.samples.len().saturating_sub(n);
        self.samples.range(start..)
    }

    /// The newest sample, if any.
    pub fn latest(&self) -> Option<&Sample> {
        self.samples.back()
    }

    /// Remove and return the newest sample.
    pub fn discard_latest(&mut self) -> Option<Sample> {
        self.samples.pop_back()
    }

    /// Remove every sample.
    pub fn clear(&mut self) {
        self.samples.clear();
    }

    /// Number of samples held.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Maximum number of samples held.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// All samples, oldest first.
    pub fn iter(&self) -> vec_deque::Iter<'_, Sample> {
        self.samples.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn filled(capacity: usize, count: u64) -> (SampleHistory, Instant) {
        let t0 = Instant::now();
        let mut history = SampleHistory::with_capacity(capacity);
        for i in 0..count {
            history.record(i * 10, t0 + Duration::from_millis(i * 100));
        }
        (history, t0)
    }

    #[test]
    fn test_record_evicts_oldest() {
        let (history, _) = filled(3, 5);
        assert_eq!(history.len(), 3);
        let positions: Vec<_> = history.iter().map(|s| s.position).collect();
        assert_eq!(positions, vec![20, 30, 40]);
    }

    #[test]
    fn test_window_is_chronological_tail() {
        let (history, t0) = filled(10, 6);
        let window: Vec<_> = history.window(3).copied().collect();
        assert_eq!(window.len(), 3);
        assert_eq!(window[0], Sample::new(30, t0 + Duration::from_millis(300)));
        assert_eq!(window[2], Sample::new(50, t0 + Duration::from_millis(500)));
    }

    #[test]
    fn test_window_larger_than_history() {
        let (history, _) = filled(10, 2);
        assert_eq!(history.window(5).len(), 2);
        assert_eq!(SampleHistory::with_capacity(4).window(3).len(), 0);
    }

    #[test]
    fn test_discard_latest() {
        let (mut history, _) = filled(10, 3);
        let dropped = history.discard_latest().unwrap();
        assert_eq!(dropped.position, 20);
        assert_eq!(history.latest().map(|s| s.position), Some(10));
    }

    #[test]
    fn test_clear() {
        let (mut history, _) = filled(10, 3);
        history.clear();
        assert!(history.is_empty());
        assert!(history.latest().is_none());
    }
}

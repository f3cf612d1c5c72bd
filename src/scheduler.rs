use std::sync::Arc;

use log::{debug, info, warn};
use tokio::time::{timeout, Instant};

use crate::config::SyncConfig;
use crate::error::SourceError;
use crate::estimator::{EstimatorReader, EstimatorWriter, Observation};
use crate::source::{ActiveStatus, SourceCapability, TickSource};

/// Which query a sync cycle issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncKind {
    Forced,
    Passive,
}

/// What one sync cycle did to the estimator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SyncOutcome {
    Updated {
        kind: SyncKind,
        position: u64,
        observation: Observation,
    },
    /// A forced query answered zero: the source is not ready and the
    /// estimator keeps its previous position.
    NotReady,
    /// The source answered with a position outside the configured valid
    /// range; it was not recorded.
    OutOfRange { kind: SyncKind, position: u64 },
}

/// Decides when to query the tick source and feeds results to the estimator.
///
/// The scheduler is the only owner of the [`EstimatorWriter`]. Each cycle
/// awaits the source first and only then commits to the estimator in one
/// synchronous step, so cancelling a cycle never leaves a partial update.
pub struct SyncScheduler {
    source: Arc<dyn TickSource>,
    capability: SourceCapability,
    config: SyncConfig,
    writer: EstimatorWriter,
    last_forced: Option<Instant>,
    force_requested: bool,
    last_status: Option<ActiveStatus>,
}

impl SyncScheduler {
    /// Create a scheduler. The source's capability is resolved here, once.
    ///
    /// # Arguments
    ///
    /// * `source` - The connected tick source to poll.
    /// * `writer` - The estimator's single writer handle.
    /// * `config` - Polling cadence, forced-sync policy and valid position range.
    pub fn new(source: Arc<dyn TickSource>, writer: EstimatorWriter, config: SyncConfig) -> Self {
        let capability = source.capability();
        debug!("SyncScheduler initialised ({capability:?})");
        Self {
            source,
            capability,
            config,
            writer,
            last_forced: None,
            force_requested: false,
            last_status: None,
        }
    }

    /// Capability resolved at construction.
    pub fn capability(&self) -> SourceCapability {
        self.capability
    }

    /// A reader onto the estimator this scheduler feeds.
    pub fn reader(&self) -> EstimatorReader {
        self.writer.reader()
    }

    /// Most recent status returned by a forced query.
    pub fn last_status(&self) -> Option<&ActiveStatus> {
        self.last_status.as_ref()
    }

    /// Make the next cycle a forced one.
    pub fn request_force(&mut self) {
        self.force_requested = true;
    }

    /// Whether a cycle starting at `now` should issue the active query.
    pub fn should_force(&self, explicit: bool, now: Instant) -> bool {
        if self.capability == SourceCapability::PassiveOnly {
            return false;
        }
        explicit
            || self.force_requested
            || self
                .last_forced
                .map(|at| now.saturating_duration_since(at) >= self.config.force_sync_interval)
                .unwrap_or(true)
    }

    /// Run one sync cycle.
    ///
    /// Transport failures are returned without touching the estimator.
    pub async fn sync(&mut self, explicit: bool) -> Result<SyncOutcome, SourceError> {
        if self.should_force(explicit, Instant::now()) {
            self.force_sync().await
        } else {
            self.passive_sync().await
        }
    }

    async fn force_sync(&mut self) -> Result<SyncOutcome, SourceError> {
        let limit = self.config.force_sync_timeout;
        let status = timeout(limit, self.source.active_query())
            .await
            .map_err(|_| SourceError::Timeout(limit))??;
        let observed_at = Instant::now();
        self.last_forced = Some(observed_at);
        self.force_requested = false;

        let position = status.position;
        if position == 0 {
            warn!(
                "Forced sync got position 0 (source not ready), keeping {}",
                self.writer.snapshot().position
            );
            self.last_status = Some(status);
            return Ok(SyncOutcome::NotReady);
        }

        if !self.config.accepts(position) {
            self.last_status = Some(status);
            return Ok(self.out_of_range(SyncKind::Forced, position));
        }

        info!(
            "Forced sync: position {position} ({} / {}, remote reports {:.2}x)",
            status.elapsed_label, status.total_label, status.rate_multiplier
        );
        self.last_status = Some(status);
        let observation = self.writer.observe(position, observed_at);
        Ok(SyncOutcome::Updated {
            kind: SyncKind::Forced,
            position,
            observation,
        })
    }

    async fn passive_sync(&mut self) -> Result<SyncOutcome, SourceError> {
        let position = self.source.passive_query().await?;
        if !self.config.accepts(position) {
            return Ok(self.out_of_range(SyncKind::Passive, position));
        }
        let observation = self.writer.observe(position, Instant::now());
        debug!("Passive sync: position {position}");
        Ok(SyncOutcome::Updated {
            kind: SyncKind::Passive,
            position,
            observation,
        })
    }

    fn out_of_range(&self, kind: SyncKind, position: u64) -> SyncOutcome {
        warn!(
            "Invalid position {position} from {kind:?} sync (expected {}-{}), ignoring",
            self.config.min_valid_position, self.config.max_valid_position
        );
        SyncOutcome::OutOfRange { kind, position }
    }

    /// Drop all estimator state, e.g. after a reconnect. The next cycle is
    /// forced.
    pub fn reset(&mut self) {
        self.writer.reset();
        self.last_forced = None;
        self.last_status = None;
        self.force_requested = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EstimatorConfig;
    use crate::estimator::Estimator;
    use crate::sim::SimulatedSource;
    use std::time::Duration;
    use tokio::time::sleep;

    async fn setup(source: SimulatedSource) -> (Arc<SimulatedSource>, SyncScheduler) {
        let source = Arc::new(source);
        source.connect().await.unwrap();
        let (writer, _reader) = Estimator::new(EstimatorConfig::default()).into_shared();
        let scheduler = SyncScheduler::new(source.clone(), writer, SyncConfig::default());
        (source, scheduler)
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_cycle_is_forced() {
        let (source, mut scheduler) = setup(SimulatedSource::new(1000, 64.0)).await;
        let outcome = scheduler.sync(false).await.unwrap();
        assert!(matches!(
            outcome,
            SyncOutcome::Updated {
                kind: SyncKind::Forced,
                position: 1000,
                ..
            }
        ));
        assert_eq!(source.active_queries(), 1);
        assert_eq!(scheduler.reader().snapshot().position, 1000);
        assert_eq!(scheduler.last_status().map(|s| s.position), Some(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_passive_between_forced_syncs() {
        let (source, mut scheduler) = setup(SimulatedSource::new(1000, 64.0)).await;
        scheduler.sync(false).await.unwrap();

        sleep(Duration::from_millis(500)).await;
        let outcome = scheduler.sync(false).await.unwrap();
        assert!(matches!(
            outcome,
            SyncOutcome::Updated {
                kind: SyncKind::Passive,
                position: 1032,
                ..
            }
        ));

        sleep(Duration::from_millis(500)).await;
        scheduler.sync(false).await.unwrap();
        assert_eq!(source.active_queries(), 1);
        assert_eq!(source.passive_queries(), 2);

        sleep(Duration::from_millis(500)).await;
        scheduler.sync(false).await.unwrap();
        assert_eq!(source.active_queries(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_and_requested_force() {
        let (source, mut scheduler) = setup(SimulatedSource::new(1000, 64.0)).await;
        scheduler.sync(false).await.unwrap();
        scheduler.sync(true).await.unwrap();
        assert_eq!(source.active_queries(), 2);

        scheduler.request_force();
        sleep(Duration::from_millis(100)).await;
        scheduler.sync(false).await.unwrap();
        assert_eq!(source.active_queries(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_passive_only_source_never_forces() {
        let (source, mut scheduler) = setup(SimulatedSource::new(1000, 64.0).passive_only()).await;
        assert!(!scheduler.should_force(true, Instant::now()));
        scheduler.sync(true).await.unwrap();
        assert_eq!(source.active_queries(), 0);
        assert_eq!(source.passive_queries(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_zero_is_not_ready() {
        let (source, mut scheduler) = setup(SimulatedSource::new(0, 64.0)).await;
        source.pause();
        assert_eq!(scheduler.sync(false).await.unwrap(), SyncOutcome::NotReady);
        assert_eq!(scheduler.reader().snapshot().sample_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_timeout() {
        let (source, mut scheduler) = setup(SimulatedSource::new(1000, 64.0)).await;
        source.set_active_latency(Duration::from_secs(3));
        let result = scheduler.sync(false).await;
        assert_eq!(result, Err(SourceError::Timeout(Duration::from_secs(2))));
        assert_eq!(scheduler.reader().snapshot().sample_count, 0);
        assert!(scheduler.should_force(false, Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_leaves_estimator_untouched() {
        let (source, mut scheduler) = setup(SimulatedSource::new(1000, 64.0)).await;
        scheduler.sync(false).await.unwrap();
        source.fail_next_queries(1);
        sleep(Duration::from_millis(500)).await;
        assert!(scheduler.sync(false).await.is_err());
        assert_eq!(scheduler.reader().snapshot().sample_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_range_positions_are_ignored() {
        let source = Arc::new(SimulatedSource::new(2_000_000, 64.0));
        source.connect().await.unwrap();
        let (writer, _reader) = Estimator::new(EstimatorConfig::default()).into_shared();
        let config = SyncConfig::default().with_valid_positions(1, 1_000_000);
        let mut scheduler = SyncScheduler::new(source.clone(), writer, config);

        let outcome = scheduler.sync(false).await.unwrap();
        assert!(matches!(
            outcome,
            SyncOutcome::OutOfRange {
                kind: SyncKind::Forced,
                position: 2_000_000
            }
        ));
        sleep(Duration::from_millis(500)).await;
        let outcome = scheduler.sync(false).await.unwrap();
        assert!(matches!(
            outcome,
            SyncOutcome::OutOfRange {
                kind: SyncKind::Passive,
                ..
            }
        ));
        assert_eq!(scheduler.reader().snapshot().sample_count, 0);

        source.seek(5000);
        sleep(Duration::from_millis(500)).await;
        scheduler.sync(false).await.unwrap();
        assert_eq!(scheduler.reader().snapshot().position, 5032);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_forces_next_cycle() {
        let (source, mut scheduler) = setup(SimulatedSource::new(1000, 64.0)).await;
        scheduler.sync(false).await.unwrap();
        scheduler.reset();
        assert_eq!(scheduler.reader().snapshot().sample_count, 0);
        scheduler.sync(false).await.unwrap();
        assert_eq!(source.active_queries(), 2);
    }
}

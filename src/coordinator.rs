//! Session lifecycle and the three loops that run over one estimator.
//!
//! A [`Coordinator`] connects the tick source, picks the initial target,
//! seeds the estimator with one forced sync and then runs:
//!
//! - the sync loop, sole writer of the estimator, which may block on I/O;
//! - the render loop, which predicts a position every frame and hands it to
//!   the [`FrameSink`] without ever awaiting I/O;
//! - the identity loop, which tracks which stream the frames belong to.
//!
//! All loops share one [`CancellationToken`]. Stopping cancels it, waits for
//! the loops to finish and only then disconnects the source. Each loop holds
//! a drop guard on the token, so a loop that exits for any reason, a panic
//! included, ends the whole session.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, error, info, trace, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::config::CoordinatorConfig;
use crate::error::{ConfigError, SessionError};
use crate::estimator::{Estimator, EstimatorReader, EstimatorSnapshot, EstimatorStatus};
use crate::predictor::{Prediction, Predictor};
use crate::scheduler::{SyncOutcome, SyncScheduler};
use crate::source::{Frame, FrameSink, IdentityTracker, TickSource};

/// Loops that have not exited this long after cancellation are aborted.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Uninitialized,
    Initializing,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CoordinatorState::Uninitialized => "uninitialized",
            CoordinatorState::Initializing => "initializing",
            CoordinatorState::Running => "running",
            CoordinatorState::Stopping => "stopping",
            CoordinatorState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

type Target = Option<Arc<str>>;
type LoopHandle = JoinHandle<Result<(), SessionError>>;

/// Requests shutdown of a running session from another task.
///
/// The session's owner still has to call [`Coordinator::join`] or
/// [`Coordinator::stop`] to release the source.
#[derive(Debug, Clone)]
pub struct StopHandle {
    token: CancellationToken,
}

impl StopHandle {
    /// Ask the session to stop. Safe to call repeatedly.
    pub fn stop(&self) {
        self.token.cancel();
    }
}

struct Session {
    token: CancellationToken,
    _guard: DropGuard,
    loops: Vec<(&'static str, LoopHandle)>,
    reader: EstimatorReader,
    target: watch::Receiver<Target>,
}

/// Owns the session lifecycle: UNINITIALIZED → INITIALIZING → RUNNING →
/// STOPPING → STOPPED.
pub struct Coordinator {
    config: CoordinatorConfig,
    source: Arc<dyn TickSource>,
    tracker: Arc<dyn IdentityTracker>,
    sink: Arc<dyn FrameSink>,
    state: Arc<watch::Sender<CoordinatorState>>,
    predictor: Predictor,
    session: Option<Session>,
}

impl Coordinator {
    /// Create a coordinator. Invalid configuration is rejected here, before
    /// anything is connected.
    ///
    /// # Arguments
    ///
    /// * `config` - Loop periods, estimator tuning and reconnect policy.
    /// * `source` - The remote whose playback position is estimated.
    /// * `tracker` - Decides which stream the frames belong to.
    /// * `sink` - Receives one [`Frame`] per render tick.
    pub fn new(
        config: CoordinatorConfig,
        source: Arc<dyn TickSource>,
        tracker: Arc<dyn IdentityTracker>,
        sink: Arc<dyn FrameSink>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let (state, _) = watch::channel(CoordinatorState::Uninitialized);
        Ok(Self {
            predictor: Predictor::new(&config.estimator),
            config,
            source,
            tracker,
            sink,
            state: Arc::new(state),
            session: None,
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> CoordinatorState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<CoordinatorState> {
        self.state.subscribe()
    }

    /// A handle for stopping the running session from elsewhere, if one is
    /// running.
    pub fn stop_handle(&self) -> Option<StopHandle> {
        self.session.as_ref().map(|s| StopHandle {
            token: s.token.clone(),
        })
    }

    /// Latest estimator snapshot, if a session is running.
    pub fn snapshot(&self) -> Option<EstimatorSnapshot> {
        self.session.as_ref().map(|s| s.reader.snapshot())
    }

    /// Telemetry view of the estimator, if a session is running.
    pub fn status(&self) -> Option<EstimatorStatus> {
        self.session.as_ref().map(|s| s.reader.status())
    }

    /// Predicted position right now, as the render loop would compute it.
    pub fn predict_now(&self) -> Option<Prediction> {
        self.snapshot()
            .map(|snap| self.predictor.predict(&snap, Instant::now()))
    }

    /// The stream the frames currently belong to.
    pub fn current_target(&self) -> Option<Arc<str>> {
        self.session
            .as_ref()
            .and_then(|s| s.target.borrow().clone())
    }

    /// Connect, seed the estimator and launch the loops.
    ///
    /// On failure the source is released and the state returns to STOPPED.
    pub async fn start(&mut self) -> Result<()> {
        let state = self.state();
        if !matches!(
            state,
            CoordinatorState::Uninitialized | CoordinatorState::Stopped
        ) {
            return Err(SessionError::InvalidState {
                action: "start",
                state,
            }
            .into());
        }

        info!("Initialising session");
        self.state.send_replace(CoordinatorState::Initializing);

        match self.initialize().await {
            Ok(session) => {
                self.session = Some(session);
                self.state.send_replace(CoordinatorState::Running);
                info!("All loops started");
                Ok(())
            }
            Err(e) => {
                error!("Initialisation failed: {e:#}");
                self.source.disconnect().await;
                self.state.send_replace(CoordinatorState::Stopped);
                Err(e)
            }
        }
    }

    async fn initialize(&self) -> Result<Session> {
        self.config
            .retry
            .connect(self.source.as_ref())
            .await
            .context("Failed to connect tick source")?;

        let initial_target: Target = match self.tracker.current_target().await {
            Ok(target) => target.map(Arc::from),
            Err(e) => {
                warn!("Could not resolve initial target: {e}");
                None
            }
        };
        if initial_target.is_none() {
            warn!("No target selected");
        }

        let (writer, reader) = Estimator::new(self.config.estimator).into_shared();
        let mut scheduler =
            SyncScheduler::new(Arc::clone(&self.source), writer, self.config.sync);

        debug!("Performing initial synchronisation");
        let seeded = scheduler
            .sync(true)
            .await
            .context("Initial synchronisation failed")?;
        debug!("Initial synchronisation: {seeded:?}");

        let (target_tx, target_rx) = watch::channel(initial_target);
        let token = CancellationToken::new();

        let loops = vec![
            (
                "sync",
                tokio::spawn(sync_loop(
                    scheduler,
                    Arc::clone(&self.source),
                    self.config.clone(),
                    Arc::clone(&self.state),
                    token.clone(),
                )),
            ),
            (
                "render",
                tokio::spawn(render_loop(
                    reader.clone(),
                    self.predictor,
                    Arc::clone(&self.sink),
                    target_rx.clone(),
                    self.config.render_interval,
                    self.config.frames_per_summary,
                    token.clone(),
                )),
            ),
            (
                "identity",
                tokio::spawn(identity_loop(
                    Arc::clone(&self.tracker),
                    target_tx,
                    self.config.identity_interval,
                    token.clone(),
                )),
            ),
        ];

        Ok(Session {
            _guard: token.clone().drop_guard(),
            token,
            loops,
            reader,
            target: target_rx,
        })
    }

    /// Wait until the session ends, either through a [`StopHandle`] or one
    /// of the loops exiting (a fatal error or a panic), then release the
    /// source.
    ///
    /// Returns the error that ended the session, if any.
    pub async fn join(&mut self) -> Result<()> {
        let Some(token) = self.session.as_ref().map(|s| s.token.clone()) else {
            return Ok(());
        };
        token.cancelled().await;
        self.stop().await
    }

    /// Start and wait for the session to end.
    pub async fn run(&mut self) -> Result<()> {
        self.start().await?;
        self.join().await
    }

    /// Cancel all loops, await them, disconnect and move to STOPPED.
    ///
    /// Calling this with no active session does nothing. If a loop ended the
    /// session with an error, that error is returned once the coordinator has
    /// stopped.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(session) = self.session.take() else {
            debug!("stop() while {}, nothing to do", self.state());
            return Ok(());
        };

        info!("Stopping");
        self.state.send_replace(CoordinatorState::Stopping);
        session.token.cancel();

        let mut failure = None;
        for (name, handle) in session.loops {
            if let Err(e) = finish_loop(name, handle).await {
                failure.get_or_insert(e);
            }
        }

        self.source.disconnect().await;
        self.state.send_replace(CoordinatorState::Stopped);
        info!("Stopped");

        match failure {
            Some(e) => Err(e).context("Session ended with an error"),
            None => Ok(()),
        }
    }
}

async fn finish_loop(name: &'static str, mut handle: LoopHandle) -> Result<(), SessionError> {
    match timeout(SHUTDOWN_GRACE, &mut handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            error!("{name} loop failed: {e}");
            Err(SessionError::LoopAborted(name))
        }
        Err(_) => {
            warn!("{name} loop did not stop within {SHUTDOWN_GRACE:?}, aborting");
            handle.abort();
            let _ = handle.await;
            Ok(())
        }
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn sync_loop(
    mut scheduler: SyncScheduler,
    source: Arc<dyn TickSource>,
    config: CoordinatorConfig,
    state: Arc<watch::Sender<CoordinatorState>>,
    token: CancellationToken,
) -> Result<(), SessionError> {
    let _guard = token.clone().drop_guard();
    debug!("Sync loop started");
    let mut ticker = ticker(config.sync.poll_interval);
    // The session was seeded during initialisation.
    ticker.tick().await;
    let mut failures = 0u32;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            result = scheduler.sync(false) => result,
        };

        match result {
            Ok(SyncOutcome::Updated {
                kind,
                position,
                observation,
            }) => {
                failures = 0;
                trace!("{kind:?} sync: {position} -> {observation:?}");
            }
            Ok(SyncOutcome::NotReady | SyncOutcome::OutOfRange { .. }) => failures = 0,
            Err(e) => {
                failures += 1;
                warn!(
                    "Sync error ({failures}/{}): {e}",
                    config.failures_before_reconnect
                );
                if failures < config.failures_before_reconnect {
                    continue;
                }

                info!("Too many sync failures, reconnecting");
                source.disconnect().await;
                let reconnected = tokio::select! {
                    _ = token.cancelled() => break,
                    result = config.retry.connect(source.as_ref()) => result,
                };
                match reconnected {
                    Ok(()) => {
                        info!("Reconnected, resetting estimator");
                        scheduler.reset();
                        failures = 0;
                    }
                    Err(e) => {
                        error!("Reconnection failed ({e}), stopping session");
                        state.send_replace(CoordinatorState::Stopping);
                        token.cancel();
                        return Err(SessionError::ReconnectExhausted {
                            attempts: config.retry.attempts,
                        });
                    }
                }
            }
        }
    }

    debug!("Sync loop stopped");
    Ok(())
}

async fn render_loop(
    reader: EstimatorReader,
    predictor: Predictor,
    sink: Arc<dyn FrameSink>,
    target: watch::Receiver<Target>,
    period: Duration,
    frames_per_summary: u64,
    token: CancellationToken,
) -> Result<(), SessionError> {
    let _guard = token.clone().drop_guard();
    debug!("Render loop started");
    let mut ticker = ticker(period);
    let mut frames = 0u64;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let snapshot = reader.snapshot();
        let prediction = predictor.predict(&snapshot, Instant::now());
        let frame = Frame {
            index: frames,
            prediction,
            target: target.borrow().clone(),
        };
        sink.present(frame);

        frames += 1;
        if frames % frames_per_summary == 0 {
            debug!(
                "Rendered {frames} frames: position {} ({:?}), speed {:.2}x, {}",
                prediction.position, prediction.mode, snapshot.speed, snapshot.state
            );
        }
    }

    debug!("Render loop stopped after {frames} frames");
    Ok(())
}

async fn identity_loop(
    tracker: Arc<dyn IdentityTracker>,
    target: watch::Sender<Target>,
    period: Duration,
    token: CancellationToken,
) -> Result<(), SessionError> {
    let _guard = token.clone().drop_guard();
    debug!("Identity loop started");
    let mut ticker = ticker(period);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let lookup = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            lookup = tracker.current_target() => lookup,
        };

        match lookup {
            Ok(next) => {
                let next: Target = next.map(Arc::from);
                target.send_if_modified(|current| {
                    if *current == next {
                        return false;
                    }
                    info!("Target changed: {current:?} -> {next:?}");
                    *current = next;
                    true
                });
            }
            Err(e) => warn!("Identity tracking error: {e}"),
        }
    }

    debug!("Identity loop stopped");
    Ok(())
}

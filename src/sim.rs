//! In-process stand-ins for the remote side, driven by the tokio clock.
//!
//! [`SimulatedSource`] models a remote playback that can change speed, pause,
//! seek, drop its connection or fail individual queries. Because it reads
//! `tokio::time::Instant`, it follows a paused test clock exactly.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use tokio::time::{sleep, Instant};

use crate::error::SourceError;
use crate::source::{ActiveStatus, IdentityTracker, SourceCapability, TickSource};
use crate::timing::TickRate;

#[derive(Debug)]
struct Playback {
    anchor_position: f64,
    anchor_at: Instant,
    speed: f64,
    paused: bool,
    active_latency: Duration,
}

impl Playback {
    fn position_at(&self, rate: &TickRate, now: Instant) -> f64 {
        if self.paused {
            return self.anchor_position;
        }
        let elapsed = now.saturating_duration_since(self.anchor_at);
        (self.anchor_position + rate.expected_ticks(elapsed, self.speed)).max(0.0)
    }

    fn reanchor(&mut self, rate: &TickRate, now: Instant) {
        self.anchor_position = self.position_at(rate, now);
        self.anchor_at = now;
    }
}

/// A remote playback advancing at `speed` times the nominal rate.
#[derive(Debug)]
pub struct SimulatedSource {
    rate: TickRate,
    capability: SourceCapability,
    total_length: u64,
    playback: Mutex<Playback>,
    connected: AtomicBool,
    refuse: AtomicBool,
    pending_failures: AtomicU32,
    connect_attempts: AtomicU32,
    passive_queries: AtomicU32,
    active_queries: AtomicU32,
}

impl SimulatedSource {
    /// Start playing at `start_position`, 1x speed, from now.
    pub fn new(start_position: u64, ticks_per_sec: f64) -> Self {
        Self {
            rate: TickRate::new(ticks_per_sec),
            capability: SourceCapability::ActiveCapable,
            total_length: u64::MAX,
            playback: Mutex::new(Playback {
                anchor_position: start_position as f64,
                anchor_at: Instant::now(),
                speed: 1.0,
                paused: false,
                active_latency: Duration::ZERO,
            }),
            connected: AtomicBool::new(false),
            refuse: AtomicBool::new(false),
            pending_failures: AtomicU32::new(0),
            connect_attempts: AtomicU32::new(0),
            passive_queries: AtomicU32::new(0),
            active_queries: AtomicU32::new(0),
        }
    }

    /// Report only passive query support.
    pub fn passive_only(mut self) -> Self {
        self.capability = SourceCapability::PassiveOnly;
        self
    }

    /// Set the length reported by active queries; positions stop there.
    pub fn with_total_length(mut self, ticks: u64) -> Self {
        self.total_length = ticks;
        self
    }

    fn playback(&self) -> MutexGuard<'_, Playback> {
        self.playback.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current true position, rounded down.
    pub fn position(&self) -> u64 {
        let position = self.playback().position_at(&self.rate, Instant::now());
        (position.floor() as u64).min(self.total_length)
    }

    /// Change the playback speed from now on.
    pub fn set_speed(&self, speed: f64) {
        let mut playback = self.playback();
        playback.reanchor(&self.rate, Instant::now());
        playback.speed = speed;
    }

    /// Freeze the position.
    pub fn pause(&self) {
        let mut playback = self.playback();
        playback.reanchor(&self.rate, Instant::now());
        playback.paused = true;
    }

    /// Continue from the frozen position.
    pub fn resume(&self) {
        let mut playback = self.playback();
        playback.anchor_at = Instant::now();
        playback.paused = false;
    }

    /// Jump to `position` and keep playing from there.
    pub fn seek(&self, position: u64) {
        let mut playback = self.playback();
        playback.anchor_position = position as f64;
        playback.anchor_at = Instant::now();
    }

    /// Delay applied to every active query.
    pub fn set_active_latency(&self, latency: Duration) {
        self.playback().active_latency = latency;
    }

    /// Make the next `count` queries fail with a transport error.
    pub fn fail_next_queries(&self, count: u32) {
        self.pending_failures.store(count, Ordering::SeqCst);
    }

    /// Make connection attempts fail while `refuse` is set.
    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Drop the connection as if the remote went away.
    pub fn drop_connection(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Connection attempts so far, failed ones included.
    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    /// Passive queries issued so far.
    pub fn passive_queries(&self) -> u32 {
        self.passive_queries.load(Ordering::SeqCst)
    }

    /// Active queries issued so far.
    pub fn active_queries(&self) -> u32 {
        self.active_queries.load(Ordering::SeqCst)
    }

    fn check_query(&self) -> Result<(), SourceError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(SourceError::Disconnected);
        }
        let injected = self
            .pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(SourceError::Transport("injected failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl TickSource for SimulatedSource {
    fn capability(&self) -> SourceCapability {
        self.capability
    }

    async fn connect(&self) -> Result<(), SourceError> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(SourceError::Transport("connection refused".into()));
        }
        self.connected.store(true, Ordering::SeqCst);
        debug!("Simulated source connected");
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        debug!("Simulated source disconnected");
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn passive_query(&self) -> Result<u64, SourceError> {
        self.passive_queries.fetch_add(1, Ordering::SeqCst);
        self.check_query()?;
        Ok(self.position())
    }

    async fn active_query(&self) -> Result<ActiveStatus, SourceError> {
        if self.capability == SourceCapability::PassiveOnly {
            return Err(SourceError::Unsupported);
        }
        self.active_queries.fetch_add(1, Ordering::SeqCst);
        self.check_query()?;

        let latency = self.playback().active_latency;
        if !latency.is_zero() {
            sleep(latency).await;
        }

        let (position, speed) = {
            let playback = self.playback();
            let position = playback.position_at(&self.rate, Instant::now()).floor() as u64;
            let speed = if playback.paused { 0.0 } else { playback.speed };
            (position.min(self.total_length), speed)
        };
        Ok(ActiveStatus {
            position,
            total_length: self.total_length,
            rate_multiplier: speed,
            elapsed_label: self.rate.clock_label(position),
            total_label: self.rate.clock_label(self.total_length),
        })
    }
}

/// Identity tracker with a target set by hand.
#[derive(Debug, Default)]
pub struct FixedTracker {
    target: Mutex<Option<String>>,
    failing: AtomicBool,
}

impl FixedTracker {
    /// Create a tracker reporting `target`.
    pub fn new(target: Option<&str>) -> Self {
        Self {
            target: Mutex::new(target.map(str::to_string)),
            failing: AtomicBool::new(false),
        }
    }

    /// Change the reported target.
    pub fn set_target(&self, target: Option<&str>) {
        *self.target.lock().unwrap_or_else(PoisonError::into_inner) = target.map(str::to_string);
    }

    /// Make every lookup fail until cleared.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl IdentityTracker for FixedTracker {
    async fn current_target(&self) -> Result<Option<String>, SourceError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SourceError::Transport("tracker unavailable".into()));
        }
        Ok(self
            .target
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}

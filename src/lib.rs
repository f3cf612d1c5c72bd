//! # ticksync
//!
//! ticksync estimates, at frame rate, the playback position of a remote
//! process that can only be polled a few times per second and whose playback
//! speed is not directly observable. The remote may pause, change speed or
//! jump to a different position at any time.
//!
//! Sparse samples go into a bounded history; a speed estimator derives a
//! smoothed rate multiplier from it while rejecting seeks and outliers; a
//! pause detector tells "paused" apart from "very slow"; and a predictor
//! extrapolates from the last sample to "now". A [`Coordinator`] runs the
//! polling, rendering and identity-tracking loops over that shared state.
//!
//! ## Example
//! ```rust,no_run
//! use std::sync::Arc;
//! use ticksync::sim::{FixedTracker, SimulatedSource};
//! use ticksync::{Coordinator, CoordinatorConfig, Frame, FrameSink};
//!
//! struct PrintSink;
//!
//! impl FrameSink for PrintSink {
//!     fn present(&self, frame: Frame) {
//!         println!("frame {} at tick {}", frame.index, frame.prediction.position);
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let source = Arc::new(SimulatedSource::new(1000, 64.0));
//!     let tracker = Arc::new(FixedTracker::new(Some("player")));
//!
//!     let mut coordinator = Coordinator::new(
//!         CoordinatorConfig::default(),
//!         source,
//!         tracker,
//!         Arc::new(PrintSink),
//!     )?;
//!
//!     coordinator.start().await?;
//!     tokio::time::sleep(std::time::Duration::from_secs(5)).await;
//!     coordinator.stop().await
//! }
//! ```

mod config;
mod coordinator;
mod error;
mod estimator;
mod history;
mod pause;
mod predictor;
mod retry;
mod scheduler;
pub mod sim;
mod source;
mod speed;
mod timing;

// Re-export public API
pub use config::{CoordinatorConfig, EstimatorConfig, SyncConfig};
pub use coordinator::{Coordinator, CoordinatorState, StopHandle};
pub use error::{ConfigError, SessionError, SourceError};
pub use estimator::{
    Estimator, EstimatorReader, EstimatorSnapshot, EstimatorStatus, EstimatorWriter, Observation,
};
pub use history::{Sample, SampleHistory};
pub use pause::{PauseDetector, PlaybackState};
pub use predictor::{Prediction, PredictionMode, Predictor};
pub use retry::RetryPolicy;
pub use scheduler::{SyncKind, SyncOutcome, SyncScheduler};
pub use source::{ActiveStatus, Frame, FrameSink, IdentityTracker, SourceCapability, TickSource};
pub use speed::{SpeedEstimator, SpeedUpdate};
pub use timing::TickRate;

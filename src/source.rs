//! Boundaries to the outside world: the remote tick source, the identity
//! tracker and the downstream frame consumer.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::SourceError;
use crate::predictor::Prediction;

/// Which queries a [`TickSource`] can answer, resolved once per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceCapability {
    /// Only the cheap cached query is available.
    PassiveOnly,
    /// Fresh (possibly side-effecting) reads are available too.
    ActiveCapable,
}

/// Rich status returned by an active query.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveStatus {
    pub position: u64,
    pub total_length: u64,
    pub rate_multiplier: f64,
    pub elapsed_label: String,
    pub total_label: String,
}

const EMPTY_CLOCK: &str = "0:00:00";

impl FromStr for ActiveStatus {
    type Err = SourceError;

    /// Parse a console status line such as
    /// `Currently playing 12500 of 160000 ticks at 1.00x speed (0:03:15 / 0:41:40)`.
    ///
    /// Only the current position is mandatory.
    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let malformed = || SourceError::Malformed(line.trim().to_string());

        let (_, rest) = line.split_once("Currently playing ").ok_or_else(malformed)?;
        let mut words = rest.split_whitespace();
        let position = words
            .next()
            .and_then(|w| w.parse::<u64>().ok())
            .ok_or_else(malformed)?;
        let total_length = match (words.next(), words.next()) {
            (Some("of"), Some(total)) => total.parse().unwrap_or(0),
            _ => 0,
        };

        let rate_multiplier = rest
            .split_once(" at ")
            .and_then(|(_, r)| r.split_once("x speed"))
            .and_then(|(rate, _)| rate.trim().parse().ok())
            .unwrap_or(1.0);

        let (elapsed_label, total_label) = rest
            .rsplit_once('(')
            .and_then(|(_, r)| r.split_once(')'))
            .and_then(|(inner, _)| inner.split_once('/'))
            .map(|(a, b)| (a.trim().to_string(), b.trim().to_string()))
            .unwrap_or_else(|| (EMPTY_CLOCK.to_string(), EMPTY_CLOCK.to_string()));

        Ok(Self {
            position,
            total_length,
            rate_multiplier,
            elapsed_label,
            total_label,
        })
    }
}

/// The remote process whose playback position is being estimated.
///
/// Implementations must be cheap to share; the coordinator holds one behind
/// an `Arc` and calls it from the sync loop only.
#[async_trait]
pub trait TickSource: Send + Sync {
    /// Queried once when a session starts.
    fn capability(&self) -> SourceCapability {
        SourceCapability::PassiveOnly
    }

    async fn connect(&self) -> Result<(), SourceError>;

    async fn disconnect(&self);

    fn is_connected(&self) -> bool;

    /// Last value known to the remote side, without side effects.
    async fn passive_query(&self) -> Result<u64, SourceError>;

    /// A fresh read. May briefly disturb the remote playback.
    async fn active_query(&self) -> Result<ActiveStatus, SourceError> {
        Err(SourceError::Unsupported)
    }
}

/// Decides which logical stream is currently being visualized.
#[async_trait]
pub trait IdentityTracker: Send + Sync {
    async fn current_target(&self) -> Result<Option<String>, SourceError>;
}

/// One render tick handed to the downstream consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub index: u64,
    pub prediction: Prediction,
    pub target: Option<Arc<str>>,
}

/// Downstream consumer of predicted positions.
///
/// Called from the render loop at frame rate; implementations must not block.
pub trait FrameSink: Send + Sync {
    fn present(&self, frame: Frame);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_status_line() {
        let status: ActiveStatus =
            "Currently playing 12500 of 160000 ticks at 1.00x speed (0:03:15 / 0:41:40)"
                .parse()
                .unwrap();
        assert_eq!(
            status,
            ActiveStatus {
                position: 12500,
                total_length: 160000,
                rate_multiplier: 1.0,
                elapsed_label: "0:03:15".into(),
                total_label: "0:41:40".into(),
            }
        );
    }

    #[test]
    fn test_parse_slow_motion_with_noise() {
        let status: ActiveStatus =
            "demo_info\r\nCurrently playing 800 of 9000 ticks at 0.25x speed (0:00:12 / 0:02:20)\r\n"
                .parse()
                .unwrap();
        assert_eq!(status.position, 800);
        assert_eq!(status.rate_multiplier, 0.25);
        assert_eq!(status.total_label, "0:02:20");
    }

    #[test]
    fn test_parse_partial_line_uses_defaults() {
        let status: ActiveStatus = "Currently playing 42".parse().unwrap();
        assert_eq!(status.position, 42);
        assert_eq!(status.total_length, 0);
        assert_eq!(status.rate_multiplier, 1.0);
        assert_eq!(status.elapsed_label, "0:00:00");
    }

    #[test]
    fn test_parse_rejects_missing_position() {
        assert!(matches!(
            "No demo playing".parse::<ActiveStatus>(),
            Err(SourceError::Malformed(_))
        ));
        assert!(matches!(
            "Currently playing nothing".parse::<ActiveStatus>(),
            Err(SourceError::Malformed(_))
        ));
    }
}

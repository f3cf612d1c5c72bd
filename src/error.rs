use thiserror::Error;

/// Failure reported by a [`TickSource`](crate::source::TickSource) or
/// [`IdentityTracker`](crate::source::IdentityTracker).
///
/// These are transport-level problems. The sync loop skips the current poll
/// cycle on any of them and retries on the next one.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SourceError {
    #[error("not connected to tick source")]
    Disconnected,
    #[error("query timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("operation not supported by this source")]
    Unsupported,
    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Configuration rejected at construction time.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    #[error("nominal rate must be finite and positive, got {0}")]
    NominalRate(f64),
    #[error("{name} must be at least {min}, got {value}")]
    TooSmall {
        name: &'static str,
        min: usize,
        value: usize,
    },
    #[error("speed bounds must satisfy 0 < min <= max, got [{min}, {max}]")]
    SpeedBounds { min: f64, max: f64 },
    #[error("smoothing weight must be in (0, 1], got {0}")]
    SmoothingWeight(f64),
    #[error("{name} must be finite and positive, got {value}")]
    NonPositive { name: &'static str, value: f64 },
    #[error("{name} must be non-zero")]
    ZeroInterval { name: &'static str },
    #[error("valid position range is empty: [{min}, {max}]")]
    PositionRange { min: u64, max: u64 },
}

/// Failure that ends a coordinator session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("reconnect failed after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
    #[error("cannot {action} while {state}")]
    InvalidState {
        action: &'static str,
        state: crate::coordinator::CoordinatorState,
    },
    #[error("{0} loop panicked or was aborted")]
    LoopAborted(&'static str),
}

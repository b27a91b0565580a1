use steplink_driver::DriverError;
use steplink_task::{AbortCause, AbortError};

/// Errors that can occur in motor operations.
#[derive(Debug, thiserror::Error)]
pub enum MotionError {
    /// The underlying request failed.
    #[error(transparent)]
    Driver(#[from] DriverError),

    /// A device reply could not be decoded.
    #[error("frame error: {0}")]
    Frame(#[from] steplink_frame::FrameError),

    /// The motor is not marked active in its configuration.
    #[error("motor {0} is not active")]
    Inactive(u8),

    /// Speed is derived from the profile in trapezoidal mode.
    #[error("speed cannot be set in trapezoidal mode")]
    TrapezoidalSpeed,

    /// The configuration is unusable.
    #[error("invalid motor config: {0}")]
    Config(String),
}

impl From<AbortError> for MotionError {
    fn from(err: AbortError) -> Self {
        MotionError::Driver(err.into())
    }
}

impl AbortCause for MotionError {
    fn abort_cause(&self) -> Option<&AbortError> {
        match self {
            MotionError::Driver(err) => err.abort_cause(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, MotionError>;

use steplink_task::{AbortCause, AbortError};

use crate::pool::PoolError;

/// Errors that can occur in driver operations.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] steplink_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] steplink_frame::FrameError),

    /// No correlation sequence could be allocated or matched.
    #[error(transparent)]
    Pool(#[from] PoolError<u16>),

    /// The request was aborted or timed out.
    #[error(transparent)]
    Abort(#[from] AbortError),

    /// The device declined the request.
    #[error("rejected by device: {0}")]
    Rejected(String),

    /// The device acknowledged with a payload that does not match the request.
    #[error("unexpected response: expected {expected}, got {got}")]
    UnexpectedResponse { expected: String, got: String },

    /// A SYN status message could not be parsed.
    #[error("invalid sync message: {0:?}")]
    InvalidSync(String),

    /// The packet stream ended while waiting.
    #[error("driver disconnected")]
    Disconnected,
}

impl AbortCause for DriverError {
    fn abort_cause(&self) -> Option<&AbortError> {
        match self {
            DriverError::Abort(err) => Some(err),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, DriverError>;

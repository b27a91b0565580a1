use std::fmt;
use std::io;

use steplink_driver::DriverError;
use steplink_motion::MotionError;
use steplink_task::AbortCause;
use steplink_transport::TransportError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
/// Interrupted by Ctrl-C.
pub const INTERRUPTED: i32 = 130;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused => TRANSPORT_ERROR,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::Open { source, path } => {
            io_error(context, io::Error::new(source.kind(), format!("{}: {source}", path.display())))
        }
        TransportError::Io(source) => io_error(context, source),
        TransportError::UnsupportedBaud(_) | TransportError::PathTooLong { .. } => {
            CliError::new(USAGE, format!("{context}: {err}"))
        }
        other => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
    }
}

pub fn driver_error(context: &str, err: DriverError) -> CliError {
    if err.is_timeout() {
        return CliError::new(TIMEOUT, format!("{context}: {err}"));
    }
    match err {
        DriverError::Transport(err) => transport_error(context, err),
        DriverError::Rejected(_) | DriverError::UnexpectedResponse { .. } => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        DriverError::Frame(_) | DriverError::InvalidSync(_) => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        DriverError::Disconnected => CliError::new(FAILURE, format!("{context}: {err}")),
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}

pub fn motion_error(context: &str, err: MotionError) -> CliError {
    match err {
        MotionError::Driver(err) => driver_error(context, err),
        MotionError::Config(_) | MotionError::Inactive(_) | MotionError::TrapezoidalSpeed => {
            CliError::new(USAGE, format!("{context}: {err}"))
        }
        MotionError::Frame(_) => CliError::new(DATA_INVALID, format!("{context}: {err}")),
    }
}

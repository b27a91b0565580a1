use std::future::{poll_fn, Future};
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;

use clap::{Args, Subcommand};
use futures_core::Stream;
use steplink_driver::{Driver, DriverConfig};
use steplink_transport::{Device, Link, Subscription, DEFAULT_BAUD};
use tracing::debug;

use crate::exit::{driver_error, io_error, transport_error, CliError, CliResult, INTERRUPTED, USAGE};
use crate::output::OutputFormat;

pub mod emulate;
pub mod info;
pub mod monitor;
pub mod r#move;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the firmware identity of a controller.
    Info(InfoArgs),
    /// Print broadcast packets (logs, status) as they arrive.
    Monitor(MonitorArgs),
    /// Drive one motor to a target position.
    Move(MoveArgs),
    /// Serve an emulated controller on a Unix domain socket.
    Emulate(EmulateArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| io_error("tokio runtime", err))?;
    runtime.block_on(async move {
        match command {
            Command::Info(args) => info::run(args, format).await,
            Command::Monitor(args) => monitor::run(args, format).await,
            Command::Move(args) => r#move::run(args, format).await,
            Command::Emulate(args) => emulate::run(args).await,
            Command::Version(args) => version::run(args),
        }
    })
}

#[derive(Args, Debug, Clone)]
pub struct DeviceArgs {
    /// Serial device path, or `unix:<socket path>` for an emulator.
    #[arg(env = "STEPLINK_DEVICE")]
    pub device: String,
    /// Serial line rate.
    #[arg(long, default_value_t = DEFAULT_BAUD)]
    pub baud: u32,
    /// Per-request timeout (e.g. 1s, 500ms).
    #[arg(long, default_value = "1s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct InfoArgs {
    #[command(flatten)]
    pub device: DeviceArgs,
}

#[derive(Args, Debug)]
pub struct MonitorArgs {
    #[command(flatten)]
    pub device: DeviceArgs,
    /// Exit after printing N packets.
    #[arg(long)]
    pub count: Option<usize>,
    /// Leave the system disabled instead of enabling it on connect.
    #[arg(long)]
    pub no_enable: bool,
}

#[derive(Args, Debug)]
pub struct MoveArgs {
    #[command(flatten)]
    pub device: DeviceArgs,
    /// Motor index.
    #[arg(long, short = 'm')]
    pub motor: u8,
    /// Target position in configured units.
    #[arg(long, short = 't', allow_hyphen_values = true)]
    pub target: f64,
    /// Cruise speed in units/s (constant-speed mode only).
    #[arg(long, short = 's')]
    pub speed: Option<f64>,
    /// JSON motor configuration; missing fields use defaults.
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct EmulateArgs {
    /// Socket path to bind.
    pub path: PathBuf,
    /// Number of emulated motors.
    #[arg(long, default_value_t = 3)]
    pub motors: u8,
    /// FW_INFO identity string.
    #[arg(long)]
    pub identity: Option<String>,
    /// Exit after serving N host connections.
    #[arg(long)]
    pub connections: Option<usize>,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

/// Open the device and start a driver on it. The driver is attached first
/// so broadcasts sent right after connecting are not missed.
pub(crate) async fn connect(args: &DeviceArgs) -> CliResult<Driver> {
    let timeout = parse_timeout(&args.timeout)?;
    let device = Device::parse(&args.device, args.baud);
    let config = DriverConfig {
        enable_timeout: timeout,
        request_timeout: timeout,
        ..DriverConfig::default()
    };
    let driver = Driver::new(Link::new(), config);
    device
        .connect(driver.link())
        .await
        .map_err(|err| transport_error("connect failed", err))?;
    debug!(%device, "connected");
    Ok(driver)
}

/// Disable the system (best effort) and drop the link.
pub(crate) async fn close(driver: &Driver) {
    if driver.is_enabled() {
        if let Err(err) = driver.disable().await {
            tracing::warn!(error = %err, "disable on exit failed");
        }
    }
    driver.link().disconnect().await;
    driver.shutdown().await;
}

pub(crate) async fn enable(driver: &Driver) -> CliResult<()> {
    driver
        .enable()
        .await
        .map_err(|err| driver_error("enable failed", err))
}

/// Run `work` unless Ctrl-C comes first.
pub(crate) async fn interruptible<T>(work: impl Future<Output = CliResult<T>>) -> CliResult<T> {
    tokio::select! {
        result = work => result,
        _ = tokio::signal::ctrl_c() => Err(CliError::new(INTERRUPTED, "interrupted")),
    }
}

pub(crate) async fn next<T: Clone + Send + 'static>(sub: &mut Subscription<T>) -> Option<T> {
    poll_fn(|cx| Pin::new(&mut *sub).poll_next(cx)).await
}

pub(crate) fn parse_timeout(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "timeout must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid timeout value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "timeout must be greater than zero"));
    }

    Ok(match unit {
        "ms" => Duration::from_millis(value),
        _ => Duration::from_secs(value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_timeout_seconds() {
        assert_eq!(parse_timeout("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_timeout("2").unwrap(), Duration::from_secs(2));
    }

    #[test]
    fn parse_timeout_millis() {
        assert_eq!(parse_timeout("150ms").unwrap(), Duration::from_millis(150));
    }

    #[test]
    fn parse_timeout_invalid() {
        for input in ["0s", "bad", "", "1.5s"] {
            let err = parse_timeout(input).unwrap_err();
            assert_eq!(err.code, USAGE, "{input}");
        }
    }
}

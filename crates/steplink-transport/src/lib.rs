//! Byte-stream transport to a stepper controller.
//!
//! A [`Link`] owns the connection to one device and provides:
//! - a fan-out stream of inbound byte chunks ([`Link::chunks`])
//! - serialized writes ([`Link::write`])
//! - lifecycle events around connect and disconnect
//!
//! Streams come from a serial tty ([`serial::open`]) or a Unix domain socket
//! ([`uds::connect`]); any `AsyncRead + AsyncWrite` will do.

pub mod device;
pub mod error;
pub mod link;
pub mod subscription;

#[cfg(unix)]
pub mod serial;
#[cfg(unix)]
pub mod uds;

pub use device::{Device, DEFAULT_BAUD};
pub use error::{Result, TransportError};
pub use link::{Link, LinkEvents};
pub use subscription::Subscription;

#[cfg(unix)]
pub use serial::SerialPort;

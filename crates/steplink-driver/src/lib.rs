//! Host-side protocol driver for steplink motor controllers.
//!
//! [`Driver`] owns the receive loop of one [`steplink_transport::Link`]:
//! broadcast packets (sequence 0) are fanned out to subscribers, everything
//! else is matched to the request that carries the same sequence.
//! [`Emulator`] answers like the firmware does, for tests and for running
//! the CLI without hardware.

pub mod driver;
pub mod emulator;
pub mod error;
pub mod pool;
pub mod sync;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use driver::{Driver, DriverConfig, DriverEvents, WeakDriver};
pub use emulator::{DriverSettings, Emulator, EmulatorConfig, DEFAULT_IDENTITY};
pub use error::{DriverError, Result};
pub use pool::{PoolError, SequencePool, FIRST_SEQUENCE, LAST_SEQUENCE};
pub use sync::SyncMessage;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

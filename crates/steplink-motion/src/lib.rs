//! Motion planning and move dispatch for steplink axes.
//!
//! [`planner`] is pure step-space math. [`Motor`] owns one axis: it turns a
//! target position into planned [`Motion`]s and feeds them to the device
//! through a [`steplink_driver::Driver`], keeping at most
//! [`MotorConfig::max_delay`] milliseconds of motion in flight.

pub mod config;
pub mod error;
pub mod motor;
pub mod planner;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use config::{MotorConfig, MotorConfigReport, FULL_STEPS_PER_REV};
pub use error::{MotionError, Result};
pub use motor::{Motor, DEFAULT_SPEED, HOOK_TIMEOUT};
pub use planner::{discretize, trapezoidal, Motion, MotionSegment};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

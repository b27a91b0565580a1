//! Cooperative cancellation for steplink.
//!
//! A [`Task`] wraps a unit of asynchronous work and tracks how it settled.
//! Cooperative tasks receive an [`AbortContext`]; children spawned through
//! it are aborted together with their parent, so a whole tree of in-flight
//! requests can be cancelled with one call.
//!
//! [`Event`] is the lifecycle hook registry used by the transport and driver
//! layers.

pub mod context;
pub mod error;
pub mod event;
pub mod task;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use context::{AbortContext, AbortableStream};
pub use error::{AbortCause, AbortError};
pub use event::{Event, HookHandle};
pub use task::{SettleState, Task, TaskFuture, TaskHandle};

/// Lock a state mutex. Critical sections never panic midway, so a poisoned
/// lock still holds consistent data.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

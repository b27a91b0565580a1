//! Host-side protocol stack for COBS-framed stepper motor controllers.
//!
//! # Crate Structure
//!
//! - [`transport`]: byte-stream link to the device (serial tty, Unix socket)
//! - [`frame`]: COBS framing, packet codec and little-endian field packing
//! - [`task`]: cooperative cancellation and lifecycle hooks
//! - [`driver`]: request/response correlation, broadcasts, device emulator
//! - [`motion`]: trapezoidal planning and per-axis move dispatch

/// Re-export transport types.
pub mod transport {
    pub use steplink_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use steplink_frame::*;
}

/// Re-export task types.
pub mod task {
    pub use steplink_task::*;
}

/// Re-export driver types.
pub mod driver {
    pub use steplink_driver::*;
}

/// Re-export motion types.
pub mod motion {
    pub use steplink_motion::*;
}

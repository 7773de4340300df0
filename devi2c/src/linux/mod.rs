//! Linux i2c-dev backend
//!
//! Built only for Linux, where buses appear as `/dev/i2c-N` character devices.

pub mod bus;

pub use bus::{LinuxBusDriver, LinuxBusRegistry};

//! Native I2C controller/device core
//!
//! The crate sits behind a managed runtime's I2C classes and provides:
//! - bus discovery (`bus::BusRegistry`) with Linux i2c-dev and simulated backends
//! - reference-counted controllers, one lock per physical bus
//! - devices with a one-way Open → Disposed lifecycle
//! - the transfer engine that runs transactions and classifies their outcome
//! - the four-call host interface (`host::NativeI2c`) and its dispatch registry

pub mod bus;
pub mod controller;
pub mod device;
pub mod host;
#[cfg(target_os = "linux")]
pub mod linux;
pub mod sim;
pub mod transfer;

pub use devi2c_common::{config, error, types};

pub use controller::{Controller, ControllerManager};
pub use device::{Device, DeviceState, RetryPolicy};
pub use host::{HostBridge, InteropRegistry, NativeI2c};
pub use transfer::TransferEngine;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the data if a panicking thread poisoned it
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

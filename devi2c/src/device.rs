//! Devices bound to a controller
//!
//! A `Device` is the communications channel to one slave address on one bus.
//! Its lifecycle is a two-state machine, Open → Disposed, recorded in the
//! owning controller's device collection and changed only under that
//! controller's lock. Dropping a device disposes it.

use devi2c_common::config::{Config, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY_MS};
use devi2c_common::error::{I2cError, I2cResult};
use devi2c_common::types::{ConnectionSettings, DeviceAddress, DeviceId, TransferResult};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

use crate::controller::Controller;
use crate::transfer::TransferEngine;

/// Lifecycle state of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Open,
    Disposed,
}

/// Caller-side retry policy for recoverable transfer outcomes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, delay: Duration) -> Self {
        Self { max_retries, delay }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.max_retries, config.retry_delay())
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            DEFAULT_MAX_RETRIES,
            Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
        )
    }
}

/// A device on an I2C bus
pub struct Device {
    id: DeviceId,
    settings: ConnectionSettings,
    serial: u64,
    clock_stretch_timeout: Duration,
    controller: Arc<Controller>,
}

impl Device {
    /// Bind a new device to `controller`
    ///
    /// # Errors
    /// Returns `AddressInUse` if an open device already holds the address,
    /// `BusMismatch` if the settings name another bus, and
    /// `ControllerClosed` if the controller's bus has been released.
    pub fn open(controller: &Arc<Controller>, settings: ConnectionSettings) -> I2cResult<Self> {
        // Each device keeps its controller open while it lives.
        let manager = controller.manager();
        if let Some(manager) = &manager {
            manager.retain(controller)?;
        }

        let serial = match controller.bind(&settings) {
            Ok(serial) => serial,
            Err(err) => {
                if let Some(manager) = &manager {
                    manager.close_controller(controller);
                }
                return Err(err);
            }
        };

        let device = Self {
            id: settings.device_id(),
            settings,
            serial,
            clock_stretch_timeout: settings
                .timeout_override()
                .unwrap_or(controller.clock_stretch_timeout()),
            controller: controller.clone(),
        };
        info!(
            "Opened I2C device {} at {} on bus {}",
            device.id, settings.address, settings.bus_id
        );
        Ok(device)
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    /// Connection settings; a copy, since they never change after open
    pub fn settings(&self) -> ConnectionSettings {
        self.settings
    }

    pub fn address(&self) -> DeviceAddress {
        self.settings.address
    }

    pub fn controller(&self) -> &Arc<Controller> {
        &self.controller
    }

    /// Effective clock-stretch timeout for this device's transfers
    pub fn clock_stretch_timeout(&self) -> Duration {
        self.clock_stretch_timeout
    }

    pub(crate) fn serial(&self) -> u64 {
        self.serial
    }

    pub fn state(&self) -> DeviceState {
        if self.controller.lock().is_bound(self.address(), self.serial) {
            DeviceState::Open
        } else {
            DeviceState::Disposed
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.state() == DeviceState::Disposed
    }

    /// Dispose the device, freeing its address
    ///
    /// Waits for any transfer in flight on the bus. Disposing twice is a
    /// no-op.
    pub fn dispose(&self) {
        if !self.controller.unbind(self.address(), self.serial) {
            return;
        }
        info!(
            "Disposed I2C device {} on bus {}",
            self.id, self.settings.bus_id
        );

        match self.controller.manager() {
            Some(manager) => manager.close_controller(&self.controller),
            None => {
                if self.controller.devices().is_empty() {
                    self.controller.release();
                }
            }
        }
    }

    /// Run one transaction; see `TransferEngine::transmit`
    pub fn transmit(&self, write: &[u8], read: &mut [u8]) -> I2cResult<TransferResult> {
        TransferEngine::transmit(self, write, read)
    }

    /// Read `buffer.len()` bytes from the device
    pub fn read(&self, buffer: &mut [u8]) -> I2cResult<TransferResult> {
        self.transmit(&[], buffer)
    }

    /// Write `buffer` to the device
    pub fn write(&self, buffer: &[u8]) -> I2cResult<TransferResult> {
        self.transmit(buffer, &mut [])
    }

    /// Write then read with a repeated START, as one bus-locked operation
    pub fn write_read(&self, write: &[u8], read: &mut [u8]) -> I2cResult<TransferResult> {
        self.transmit(write, read)
    }

    /// Read a single byte
    ///
    /// # Errors
    /// Returns `IncompleteTransfer` if the byte was not received.
    pub fn read_byte(&self) -> I2cResult<u8> {
        let mut buffer = [0u8; 1];
        let result = self.read(&mut buffer)?;
        if !result.is_full() {
            return Err(I2cError::IncompleteTransfer(result));
        }
        Ok(buffer[0])
    }

    /// Write a single byte
    ///
    /// # Errors
    /// Returns `IncompleteTransfer` if the byte was not accepted.
    pub fn write_byte(&self, value: u8) -> I2cResult<()> {
        let result = self.write(&[value])?;
        if !result.is_full() {
            return Err(I2cError::IncompleteTransfer(result));
        }
        Ok(())
    }

    /// Transmit, retrying recoverable outcomes
    ///
    /// Retries up to `policy.max_retries` times with `policy.delay` between
    /// attempts. Only PartialTransfer and ClockStretchTimeout are retried;
    /// the bus lock is released between attempts. Returns the last result.
    pub fn transmit_with_retry(
        &self,
        write: &[u8],
        read: &mut [u8],
        policy: RetryPolicy,
    ) -> I2cResult<TransferResult> {
        let mut attempt = 0;

        loop {
            let result = self.transmit(write, read)?;
            if !result.status.is_recoverable() || attempt >= policy.max_retries {
                return Ok(result);
            }

            attempt += 1;
            debug!(
                "Retrying I2C transfer to {} ({}), attempt {} of {}",
                self.settings.address, result, attempt, policy.max_retries
            );

            if !policy.delay.is_zero() {
                thread::sleep(policy.delay);
            }
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("settings", &self.settings)
            .field("clock_stretch_timeout", &self.clock_stretch_timeout)
            .finish_non_exhaustive()
    }
}

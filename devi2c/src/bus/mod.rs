//! Physical bus access
//!
//! `BusDriver` is the seam between the transfer engine and hardware. A driver
//! runs one complete transaction (START, address, data, optional repeated
//! START, STOP) and reports what it observed on the wire. Turning those
//! observations into a `TransferResult` is the transfer engine's job.

pub mod registry;

pub use registry::{BusInfo, BusRegistry};

use devi2c_common::types::{BusSpeed, DeviceAddress};
use std::time::Duration;

/// One transaction handed to a driver
///
/// If both buffers are non-empty the driver must issue the write, then a
/// repeated START and the read, without releasing the bus in between.
#[derive(Debug)]
pub struct BusRequest<'a> {
    pub address: DeviceAddress,
    pub speed: BusSpeed,
    /// Longest the master waits for a slave holding SCL low
    pub clock_stretch_timeout: Duration,
    pub write: &'a [u8],
    pub read: &'a mut [u8],
}

impl BusRequest<'_> {
    /// Total bytes requested in both directions
    pub fn requested(&self) -> usize {
        self.write.len() + self.read.len()
    }
}

/// Faults a driver can observe after the address byte was acknowledged
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusFault {
    /// Clock-stretch watchdog expired
    ClockStretchTimeout,
    /// Slave NACKed a data byte
    DataNack,
    /// Anything else the hardware reported (arbitration loss, bus error, ...)
    Other(String),
}

/// What a driver observed during one transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusReport {
    pub address_acked: bool,
    /// Data bytes moved in either direction before the transaction ended
    pub bytes_moved: usize,
    pub fault: Option<BusFault>,
}

impl BusReport {
    /// Transaction ran to its STOP without a fault
    pub fn complete(bytes_moved: usize) -> Self {
        Self {
            address_acked: true,
            bytes_moved,
            fault: None,
        }
    }

    /// Nobody answered the address byte
    pub fn address_nack() -> Self {
        Self {
            address_acked: false,
            bytes_moved: 0,
            fault: None,
        }
    }

    /// Transaction aborted by `fault` after `bytes_moved` bytes
    pub fn fault(bytes_moved: usize, fault: BusFault) -> Self {
        Self {
            address_acked: true,
            bytes_moved,
            fault: Some(fault),
        }
    }
}

/// A physical (or simulated) I2C bus master
///
/// Drivers are owned by exactly one controller and are only called with that
/// controller's lock held, so implementations need no locking of their own.
pub trait BusDriver: Send {
    fn execute(&mut self, request: &mut BusRequest<'_>) -> BusReport;
}

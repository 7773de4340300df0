//! i2c-dev bus discovery and transfers
//!
//! Buses are the `i2c-N` character devices in the configured directory.
//! Transactions go through the `I2C_RDWR` ioctl, so a combined write/read is
//! issued by the kernel with a repeated START and no STOP in between.

#![cfg(target_os = "linux")]

use devi2c_common::config::Config;
use devi2c_common::error::{I2cError, I2cResult};
use devi2c_common::types::{BusId, BusSpeed, DeviceAddress};
use i2cdev::core::{I2CMessage, I2CTransfer};
use i2cdev::linux::{LinuxI2CBus, LinuxI2CMessage};
use std::fs;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::bus::{BusDriver, BusFault, BusInfo, BusRegistry, BusReport, BusRequest};

/// `I2C_TIMEOUT` ioctl request; the argument is in units of 10 ms
const I2C_TIMEOUT: u32 = 0x0702;

/// Registry over `<dev_dir>/i2c-N`
#[derive(Debug, Clone)]
pub struct LinuxBusRegistry {
    dev_dir: PathBuf,
    prefix: String,
}

impl LinuxBusRegistry {
    pub fn new(dev_dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dev_dir: dev_dir.into(),
            prefix: prefix.into(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.dev_dir.clone(), config.selector_prefix.clone())
    }
}

/// Bus number of a device node name such as `i2c-1`
fn parse_bus_node(name: &str) -> Option<BusId> {
    let number = name.strip_prefix("i2c-")?;
    if number.is_empty() || !number.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    number.parse().ok().map(BusId)
}

impl BusRegistry for LinuxBusRegistry {
    fn list_buses(&self) -> Vec<BusInfo> {
        let entries = match fs::read_dir(&self.dev_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(
                    "Cannot scan {} for I2C buses: {}",
                    self.dev_dir.display(),
                    e
                );
                return Vec::new();
            }
        };

        let mut buses: Vec<BusInfo> = entries
            .filter_map(Result::ok)
            .filter_map(|entry| {
                let id = parse_bus_node(entry.file_name().to_str()?)?;
                Some(BusInfo {
                    id,
                    selector: id.selector(&self.prefix),
                    path: Some(entry.path()),
                })
            })
            .collect();
        buses.sort_by_key(|b| b.id);
        buses
    }

    fn open(&self, info: &BusInfo) -> I2cResult<Box<dyn BusDriver>> {
        let path = info
            .path
            .clone()
            .unwrap_or_else(|| self.dev_dir.join(format!("i2c-{}", info.id)));

        let bus = LinuxI2CBus::new(&path).map_err(|e| I2cError::BusOpen {
            bus: info.id,
            path: path.clone(),
            source: e.into(),
        })?;
        info!("Opened I2C adapter {}", path.display());

        Ok(Box::new(LinuxBusDriver {
            id: info.id,
            bus,
            timeout: None,
            speeds_noted: Vec::new(),
        }))
    }
}

/// Driver for one open i2c-dev adapter
pub struct LinuxBusDriver {
    id: BusId,
    bus: LinuxI2CBus,
    /// Adapter timeout last applied, to skip redundant ioctls
    timeout: Option<Duration>,
    /// Speeds already reported as not settable
    speeds_noted: Vec<BusSpeed>,
}

impl LinuxBusDriver {
    /// The adapter clock is fixed by the kernel driver (device tree or module
    /// parameter); i2c-dev has no call to change it per transfer.
    fn note_speed(&mut self, speed: BusSpeed) {
        if self.speeds_noted.contains(&speed) {
            return;
        }
        self.speeds_noted.push(speed);
        info!(
            "I2C bus {}: {:?} ({} Hz) requested, adapter clock is set by the kernel driver",
            self.id,
            speed,
            speed.hz()
        );
    }

    fn apply_timeout(&mut self, timeout: Duration) {
        if self.timeout == Some(timeout) {
            return;
        }

        let ticks = timeout.as_millis().div_ceil(10).clamp(1, u32::MAX as u128) as libc::c_ulong;
        // SAFETY: I2C_TIMEOUT takes a plain integer argument.
        let rc = unsafe { libc::ioctl(self.bus.as_raw_fd(), I2C_TIMEOUT as _, ticks) };
        if rc < 0 {
            warn!(
                "Failed to set timeout on I2C bus {}: {}",
                self.id,
                io::Error::last_os_error()
            );
        } else {
            debug!("I2C bus {} timeout set to {:?}", self.id, timeout);
            self.timeout = Some(timeout);
        }
    }
}

impl BusDriver for LinuxBusDriver {
    fn execute(&mut self, request: &mut BusRequest<'_>) -> BusReport {
        let address = match request.address {
            DeviceAddress::SevenBit(a) => a as u16,
            DeviceAddress::TenBit(a) => {
                warn!("10-bit address 0x{:03X} is not supported on bus {}", a, self.id);
                return BusReport::fault(
                    0,
                    BusFault::Other("10-bit addressing is not supported".to_string()),
                );
            }
        };
        self.note_speed(request.speed);
        self.apply_timeout(request.clock_stretch_timeout);

        let mut lengths = Vec::with_capacity(2);
        let mut messages = Vec::with_capacity(2);
        if !request.write.is_empty() {
            lengths.push(request.write.len());
            messages.push(LinuxI2CMessage::write(request.write).with_address(address));
        }
        if !request.read.is_empty() {
            lengths.push(request.read.len());
            messages.push(LinuxI2CMessage::read(&mut *request.read).with_address(address));
        }

        match self.bus.transfer(&mut messages) {
            // The kernel reports how many messages completed.
            Ok(done) => BusReport::complete(lengths.iter().take(done as usize).sum()),
            Err(e) => report_for_error(&io::Error::from(e)),
        }
    }
}

/// Map an i2c-dev error onto what was observed on the wire
///
/// Adapters report a missing ACK as `ENXIO` or `EREMOTEIO` without saying
/// which byte was refused, so both count as an address NACK.
fn report_for_error(err: &io::Error) -> BusReport {
    match err.raw_os_error() {
        Some(libc::ENXIO) | Some(libc::EREMOTEIO) => BusReport::address_nack(),
        Some(libc::ETIMEDOUT) => BusReport::fault(0, BusFault::ClockStretchTimeout),
        _ => {
            warn!("I2C transfer failed: {}", err);
            BusReport::fault(0, BusFault::Other(err.to_string()))
        }
    }
}

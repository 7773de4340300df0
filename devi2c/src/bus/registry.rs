//! Discovery of available buses

use devi2c_common::error::{I2cError, I2cResult};
use devi2c_common::types::BusId;
use std::path::PathBuf;

use super::BusDriver;

/// A bus found by a registry scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusInfo {
    pub id: BusId,
    /// Host-facing selector, e.g. `I2C1`
    pub selector: String,
    /// Backing device node, if the bus has one
    pub path: Option<PathBuf>,
}

/// Source of physical buses
///
/// Scans reflect the hardware present at call time and are never cached.
/// A missing or unreadable bus directory is not an error: it simply yields
/// no buses.
pub trait BusRegistry: Send + Sync {
    /// Buses currently present, ordered by id
    fn list_buses(&self) -> Vec<BusInfo>;

    /// Open the physical bus behind `info`
    fn open(&self, info: &BusInfo) -> I2cResult<Box<dyn BusDriver>>;

    fn list_selectors(&self) -> Vec<String> {
        self.list_buses().into_iter().map(|b| b.selector).collect()
    }

    fn resolve(&self, bus: BusId) -> I2cResult<BusInfo> {
        self.list_buses()
            .into_iter()
            .find(|b| b.id == bus)
            .ok_or(I2cError::NotFound(bus))
    }
}

/// Selector string in the host's convention (`I2C1,I2C2`)
pub fn device_selector(registry: &dyn BusRegistry) -> String {
    registry.list_selectors().join(",")
}

//! Controllers and the controller manager
//!
//! A `Controller` owns one physical bus. Its lock guards the device
//! collection and the bus driver, so holding it both serializes transfers and
//! makes device lifecycle changes atomic with respect to them.
//!
//! The `ControllerManager` keeps a reference-counted table of open
//! controllers. Lock order is always manager table → controller; code holding
//! a controller lock never calls back into the manager.

use devi2c_common::config::{Config, ConfigError};
use devi2c_common::error::{I2cError, I2cResult};
use devi2c_common::types::{BusId, ConnectionSettings, DeviceAddress, DeviceId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tracing::{debug, info};

use crate::bus::{BusDriver, BusRegistry, registry};
use crate::device::Device;
use crate::lock;

#[derive(Debug, Clone, Copy)]
struct Binding {
    serial: u64,
    id: DeviceId,
}

/// State guarded by the controller lock
pub(crate) struct ControllerState {
    driver: Option<Box<dyn BusDriver>>,
    devices: HashMap<DeviceAddress, Binding>,
    next_serial: u64,
}

impl ControllerState {
    /// Whether the binding created with `serial` is still open
    pub(crate) fn is_bound(&self, address: DeviceAddress, serial: u64) -> bool {
        self.devices
            .get(&address)
            .is_some_and(|b| b.serial == serial)
    }

    pub(crate) fn driver(&mut self) -> Option<&mut (dyn BusDriver + 'static)> {
        self.driver.as_deref_mut()
    }
}

/// Owner of one physical I2C bus
pub struct Controller {
    id: BusId,
    selector: String,
    clock_stretch_timeout: Duration,
    state: Mutex<ControllerState>,
    manager: Weak<ManagerShared>,
}

impl Controller {
    pub fn id(&self) -> BusId {
        self.id
    }

    pub fn selector(&self) -> &str {
        &self.selector
    }

    /// Controller-wide clock-stretch timeout
    pub fn clock_stretch_timeout(&self) -> Duration {
        self.clock_stretch_timeout
    }

    /// Whether the physical bus is still held
    pub fn is_open(&self) -> bool {
        self.lock().driver.is_some()
    }

    /// Ids of the devices currently open on this bus
    pub fn devices(&self) -> Vec<DeviceId> {
        let mut ids: Vec<DeviceId> = self.lock().devices.values().map(|b| b.id).collect();
        ids.sort();
        ids
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ControllerState> {
        lock(&self.state)
    }

    pub(crate) fn manager(&self) -> Option<ControllerManager> {
        self.manager
            .upgrade()
            .map(|shared| ControllerManager { shared })
    }

    /// Bind `settings` to this bus, returning the serial of the new binding
    pub(crate) fn bind(&self, settings: &ConnectionSettings) -> I2cResult<u64> {
        if settings.bus_id != self.id {
            return Err(I2cError::BusMismatch {
                controller: self.id,
                settings: settings.bus_id,
            });
        }
        let address = settings.address.validate()?;

        let mut state = self.lock();
        if state.driver.is_none() {
            return Err(I2cError::ControllerClosed(self.id));
        }
        if state.devices.contains_key(&address) {
            return Err(I2cError::AddressInUse {
                bus: self.id,
                address,
            });
        }

        let serial = state.next_serial;
        state.next_serial += 1;
        state.devices.insert(
            address,
            Binding {
                serial,
                id: settings.device_id(),
            },
        );
        Ok(serial)
    }

    /// Drop the binding created with `serial`
    ///
    /// Returns true only for the call that performed the Open → Disposed
    /// transition.
    pub(crate) fn unbind(&self, address: DeviceAddress, serial: u64) -> bool {
        let mut state = self.lock();
        if state.is_bound(address, serial) {
            state.devices.remove(&address);
            true
        } else {
            false
        }
    }

    /// Release the physical bus; every device still open becomes disposed
    pub(crate) fn release(&self) {
        let mut state = self.lock();
        let orphaned = state.devices.len();
        state.devices.clear();
        if state.driver.take().is_some() {
            info!(
                "Released I2C bus {} ({} device(s) still open)",
                self.id, orphaned
            );
        }
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("id", &self.id)
            .field("selector", &self.selector)
            .field("clock_stretch_timeout", &self.clock_stretch_timeout)
            .finish_non_exhaustive()
    }
}

struct ControllerEntry {
    controller: Arc<Controller>,
    refs: usize,
}

struct ManagerShared {
    registry: Arc<dyn BusRegistry>,
    config: Config,
    controllers: Mutex<HashMap<BusId, ControllerEntry>>,
}

/// Owner of all open controllers
///
/// Cloning is cheap; clones share the same controller table.
#[derive(Clone)]
pub struct ControllerManager {
    shared: Arc<ManagerShared>,
}

impl ControllerManager {
    /// Manager over `registry`
    ///
    /// # Errors
    /// Returns `ConfigError::InvalidValue` if `config` fails validation.
    pub fn new(registry: Arc<dyn BusRegistry>, config: Config) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(ManagerShared {
                registry,
                config,
                controllers: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Manager over the Linux i2c-dev buses described by `config`
    #[cfg(target_os = "linux")]
    pub fn linux(config: Config) -> Result<Self, ConfigError> {
        let registry = crate::linux::LinuxBusRegistry::from_config(&config);
        Self::new(Arc::new(registry), config)
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn registry(&self) -> &dyn BusRegistry {
        self.shared.registry.as_ref()
    }

    pub fn list_selectors(&self) -> Vec<String> {
        self.shared.registry.list_selectors()
    }

    /// All bus selectors in the host's comma-separated format
    pub fn device_selector(&self) -> String {
        registry::device_selector(self.registry())
    }

    /// Open the controller for `bus`, or take another reference to it
    ///
    /// Every successful call must be paired with `close_controller`.
    pub fn open_controller(&self, bus: BusId) -> I2cResult<Arc<Controller>> {
        let mut controllers = lock(&self.shared.controllers);

        if let Some(entry) = controllers.get_mut(&bus) {
            entry.refs += 1;
            debug!("I2C bus {} reference count now {}", bus, entry.refs);
            return Ok(entry.controller.clone());
        }

        let info = self.shared.registry.resolve(bus)?;
        let driver = self.shared.registry.open(&info)?;

        let controller = Arc::new(Controller {
            id: bus,
            selector: info.selector,
            clock_stretch_timeout: self.shared.config.clock_stretch_timeout(),
            state: Mutex::new(ControllerState {
                driver: Some(driver),
                devices: HashMap::new(),
                next_serial: 0,
            }),
            manager: Arc::downgrade(&self.shared),
        });
        info!("Opened I2C bus {} ({})", bus, controller.selector);

        controllers.insert(
            bus,
            ControllerEntry {
                controller: controller.clone(),
                refs: 1,
            },
        );
        Ok(controller)
    }

    /// Drop one reference; the bus is released when the count reaches zero
    ///
    /// Closing a controller that is no longer in the table is a no-op.
    pub fn close_controller(&self, controller: &Arc<Controller>) {
        let mut controllers = lock(&self.shared.controllers);

        let Some(entry) = controllers.get_mut(&controller.id) else {
            debug!("I2C bus {} already closed", controller.id);
            return;
        };
        if !Arc::ptr_eq(&entry.controller, controller) {
            debug!("Stale controller handle for I2C bus {}", controller.id);
            return;
        }

        entry.refs -= 1;
        debug!(
            "I2C bus {} reference count now {}",
            controller.id, entry.refs
        );
        if entry.refs == 0 {
            controllers.remove(&controller.id);
            controller.release();
        }
    }

    /// Take an additional reference on an already open controller
    pub(crate) fn retain(&self, controller: &Arc<Controller>) -> I2cResult<()> {
        let mut controllers = lock(&self.shared.controllers);
        match controllers.get_mut(&controller.id) {
            Some(entry) if Arc::ptr_eq(&entry.controller, controller) => {
                entry.refs += 1;
                Ok(())
            }
            _ => Err(I2cError::ControllerClosed(controller.id)),
        }
    }

    /// Open a device by settings, opening its controller if needed
    pub fn create_device(&self, settings: ConnectionSettings) -> I2cResult<Device> {
        let controller = self.open_controller(settings.bus_id)?;
        let device = Device::open(&controller, settings);
        // The device holds its own reference when the open succeeded.
        self.close_controller(&controller);
        device
    }

    /// Look up an open controller without taking a reference
    pub fn controller(&self, bus: BusId) -> Option<Arc<Controller>> {
        lock(&self.shared.controllers)
            .get(&bus)
            .map(|e| e.controller.clone())
    }

    /// Current reference count of `bus` (0 when closed)
    pub fn ref_count(&self, bus: BusId) -> usize {
        lock(&self.shared.controllers)
            .get(&bus)
            .map_or(0, |e| e.refs)
    }

    pub fn open_buses(&self) -> Vec<BusId> {
        let mut buses: Vec<BusId> = lock(&self.shared.controllers).keys().copied().collect();
        buses.sort();
        buses
    }

    /// Release every controller regardless of outstanding references
    pub fn shutdown(&self) {
        let mut controllers = lock(&self.shared.controllers);
        info!("Shutting down {} I2C controller(s)", controllers.len());
        for (_, entry) in controllers.drain() {
            entry.controller.release();
        }
    }
}

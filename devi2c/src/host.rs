//! Call surface for the hosting runtime
//!
//! The managed side reaches the core through four calls, expressed by the
//! `NativeI2c` trait. `HostBridge` implements them on a `ControllerManager`
//! and maps managed object handles to native controllers and devices.
//! `InteropRegistry` is assembled at startup and routes each call to the core
//! registered for the managed type it was issued on.

use devi2c_common::error::{I2cError, InteropError, InteropResult};
use devi2c_common::types::{
    BusId, BusSpeed, ConnectionSettings, DeviceAddress, DeviceId, TransferResult,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::controller::{Controller, ControllerManager};
use crate::device::Device;
use crate::lock;

/// Opaque handle of a managed object, assigned by the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectHandle(pub u32);

/// Managed classes with native backing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ManagedType {
    Controller,
    Device,
}

impl ManagedType {
    pub fn name(&self) -> &'static str {
        match self {
            ManagedType::Controller => "controller",
            ManagedType::Device => "device",
        }
    }
}

/// What `init` is asked to construct
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagedObject {
    Controller {
        bus_id: BusId,
    },
    Device {
        bus_id: BusId,
        address: DeviceAddress,
        /// `None` selects the configured default speed
        bus_speed: Option<BusSpeed>,
    },
}

impl ManagedObject {
    pub fn kind(&self) -> ManagedType {
        match self {
            ManagedObject::Controller { .. } => ManagedType::Controller,
            ManagedObject::Device { .. } => ManagedType::Device,
        }
    }
}

/// The four native calls of the managed I2C classes
pub trait NativeI2c: Send + Sync {
    /// Construct native state for a newly created managed object
    fn init(&self, handle: ObjectHandle, object: ManagedObject) -> InteropResult<()>;

    /// Comma-separated selectors of the buses present right now
    fn get_device_selector(&self) -> String;

    /// Tear down native state; safe to call any number of times
    ///
    /// For a controller this drops the reference taken by `init`.
    ///
    /// `disposing` is false when called from a finalizer, after which the
    /// handle will never be used again.
    fn dispose(&self, handle: ObjectHandle, disposing: bool) -> InteropResult<()>;

    fn transmit(
        &self,
        handle: ObjectHandle,
        write: &[u8],
        read: &mut [u8],
    ) -> InteropResult<TransferResult>;
}

enum NativeObject {
    Controller(Arc<Controller>),
    Device(Arc<Device>),
    /// Explicitly disposed device whose managed object is still alive
    Disposed(DeviceId),
}

/// `NativeI2c` on top of a controller manager
pub struct HostBridge {
    manager: ControllerManager,
    objects: Mutex<HashMap<ObjectHandle, NativeObject>>,
}

impl HostBridge {
    pub fn new(manager: ControllerManager) -> Self {
        Self {
            manager,
            objects: Mutex::new(HashMap::new()),
        }
    }

    pub fn manager(&self) -> &ControllerManager {
        &self.manager
    }

    /// Number of handles with native state (including disposed devices)
    pub fn handle_count(&self) -> usize {
        lock(&self.objects).len()
    }
}

impl NativeI2c for HostBridge {
    fn init(&self, handle: ObjectHandle, object: ManagedObject) -> InteropResult<()> {
        let mut objects = lock(&self.objects);
        match objects.get(&handle) {
            None | Some(NativeObject::Disposed(_)) => {}
            Some(_) => return Err(InteropError::HandleInUse(handle.0)),
        }

        let native = match object {
            ManagedObject::Controller { bus_id } => {
                NativeObject::Controller(self.manager.open_controller(bus_id)?)
            }
            ManagedObject::Device {
                bus_id,
                address,
                bus_speed,
            } => {
                let speed = bus_speed.unwrap_or(self.manager.config().default_bus_speed);
                let settings = ConnectionSettings::with_address(bus_id, address).bus_speed(speed);
                NativeObject::Device(Arc::new(self.manager.create_device(settings)?))
            }
        };

        debug!("Initialised managed {} {:?}", object.kind().name(), handle);
        objects.insert(handle, native);
        Ok(())
    }

    fn get_device_selector(&self) -> String {
        self.manager.device_selector()
    }

    fn dispose(&self, handle: ObjectHandle, disposing: bool) -> InteropResult<()> {
        // Swap in the tombstone under one guard; tear down after releasing it.
        let removed = {
            let mut objects = lock(&self.objects);
            let removed = objects.remove(&handle);
            let tombstone = match &removed {
                Some(NativeObject::Device(device)) => Some(device.id()),
                Some(NativeObject::Disposed(id)) => Some(*id),
                _ => None,
            };
            if let (true, Some(id)) = (disposing, tombstone) {
                objects.insert(handle, NativeObject::Disposed(id));
            }
            removed
        };

        match removed {
            Some(NativeObject::Device(device)) => device.dispose(),
            Some(NativeObject::Disposed(_)) => {}
            Some(NativeObject::Controller(controller)) => {
                self.manager.close_controller(&controller);
            }
            None => debug!("Dispose of unknown handle {:?} ignored", handle),
        }
        Ok(())
    }

    fn transmit(
        &self,
        handle: ObjectHandle,
        write: &[u8],
        read: &mut [u8],
    ) -> InteropResult<TransferResult> {
        // Clone out of the table so transfers never hold the table lock.
        let device = match lock(&self.objects).get(&handle) {
            Some(NativeObject::Device(device)) => device.clone(),
            Some(NativeObject::Disposed(id)) => {
                return Err(I2cError::ObjectDisposed(*id).into());
            }
            Some(NativeObject::Controller(_)) => {
                return Err(InteropError::WrongObjectKind {
                    call: "transmit",
                    kind: ManagedType::Controller.name(),
                });
            }
            None => return Err(InteropError::UnknownHandle(handle.0)),
        };

        Ok(device.transmit(write, read)?)
    }
}

/// A native call as issued by the runtime
#[derive(Debug)]
pub enum InteropCall<'a> {
    Init {
        handle: ObjectHandle,
        object: ManagedObject,
    },
    GetDeviceSelector,
    Dispose {
        handle: ObjectHandle,
        disposing: bool,
    },
    Transmit {
        handle: ObjectHandle,
        write: &'a [u8],
        read: &'a mut [u8],
    },
}

impl InteropCall<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            InteropCall::Init { .. } => "init",
            InteropCall::GetDeviceSelector => "get_device_selector",
            InteropCall::Dispose { .. } => "dispose",
            InteropCall::Transmit { .. } => "transmit",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InteropReply {
    Done,
    Selector(String),
    Transfer(TransferResult),
}

/// Startup-built routing from managed type to native core
///
/// Controllers accept `init`, `get_device_selector` and `dispose`; devices
/// accept `init`, `dispose` and `transmit`.
#[derive(Default)]
pub struct InteropRegistry {
    cores: HashMap<ManagedType, Arc<dyn NativeI2c>>,
}

impl InteropRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry routing both managed types to one bridge
    pub fn with_bridge(bridge: Arc<HostBridge>) -> Self {
        Self::new()
            .register(ManagedType::Controller, bridge.clone())
            .register(ManagedType::Device, bridge)
    }

    pub fn register(mut self, managed: ManagedType, core: Arc<dyn NativeI2c>) -> Self {
        self.cores.insert(managed, core);
        self
    }

    pub fn dispatch(
        &self,
        managed: ManagedType,
        call: InteropCall<'_>,
    ) -> InteropResult<InteropReply> {
        let core = self
            .cores
            .get(&managed)
            .ok_or(InteropError::NotRegistered(managed.name()))?;

        match (managed, call) {
            (_, InteropCall::Init { handle, object }) if object.kind() == managed => {
                core.init(handle, object)?;
                Ok(InteropReply::Done)
            }
            (ManagedType::Controller, InteropCall::GetDeviceSelector) => {
                Ok(InteropReply::Selector(core.get_device_selector()))
            }
            (_, InteropCall::Dispose { handle, disposing }) => {
                core.dispose(handle, disposing)?;
                Ok(InteropReply::Done)
            }
            (
                ManagedType::Device,
                InteropCall::Transmit {
                    handle,
                    write,
                    read,
                },
            ) => Ok(InteropReply::Transfer(core.transmit(handle, write, read)?)),
            (managed, call) => Err(InteropError::WrongObjectKind {
                call: call.name(),
                kind: managed.name(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fixture, init_tracing, SLAVE_A};
    use devi2c_common::types::TransferStatus;
    use std::thread;

    fn bridge() -> Arc<HostBridge> {
        let (manager, _) = fixture();
        Arc::new(HostBridge::new(manager))
    }

    fn device_object(bus: u8, address: u8) -> ManagedObject {
        ManagedObject::Device {
            bus_id: BusId(bus),
            address: DeviceAddress::SevenBit(address),
            bus_speed: None,
        }
    }

    #[test]
    fn test_init_and_transmit() {
        init_tracing();
        let bridge = bridge();
        bridge.init(ObjectHandle(1), device_object(1, SLAVE_A)).unwrap();

        let result = bridge.transmit(ObjectHandle(1), &[0x00, 0x42], &mut []).unwrap();
        assert_eq!(result, TransferResult::full(2));

        let mut buf = [0u8; 1];
        bridge.transmit(ObjectHandle(1), &[0x00], &mut buf).unwrap();
        assert_eq!(buf, [0x42]);
    }

    #[test]
    fn test_device_uses_configured_default_speed() {
        let bridge = bridge();
        bridge.init(ObjectHandle(1), device_object(1, SLAVE_A)).unwrap();
        bridge
            .init(
                ObjectHandle(2),
                ManagedObject::Device {
                    bus_id: BusId(2),
                    address: DeviceAddress::SevenBit(SLAVE_A),
                    bus_speed: Some(BusSpeed::Fast),
                },
            )
            .unwrap();

        let objects = lock(&bridge.objects);
        let speed = |handle| match objects.get(&ObjectHandle(handle)) {
            Some(NativeObject::Device(device)) => device.settings().bus_speed,
            _ => panic!("Expected device"),
        };
        assert_eq!(speed(1), bridge.manager().config().default_bus_speed);
        assert_eq!(speed(2), BusSpeed::Fast);
    }

    #[test]
    fn test_init_same_handle_twice() {
        let bridge = bridge();
        bridge.init(ObjectHandle(1), device_object(1, SLAVE_A)).unwrap();
        let err = bridge
            .init(ObjectHandle(1), device_object(2, SLAVE_A))
            .unwrap_err();
        assert!(matches!(err, InteropError::HandleInUse(1)));
    }

    #[test]
    fn test_init_address_in_use() {
        let bridge = bridge();
        bridge.init(ObjectHandle(1), device_object(1, SLAVE_A)).unwrap();
        let err = bridge
            .init(ObjectHandle(2), device_object(1, SLAVE_A))
            .unwrap_err();
        assert!(matches!(
            err,
            InteropError::I2c(I2cError::AddressInUse { .. })
        ));
    }

    #[test]
    fn test_init_unknown_bus() {
        let bridge = bridge();
        let err = bridge
            .init(ObjectHandle(1), ManagedObject::Controller { bus_id: BusId(5) })
            .unwrap_err();
        assert!(matches!(err, InteropError::I2c(I2cError::NotFound(BusId(5)))));
        assert_eq!(bridge.handle_count(), 0);
    }

    #[test]
    fn test_dispose_is_repeatable() {
        let bridge = bridge();
        bridge.init(ObjectHandle(1), device_object(1, SLAVE_A)).unwrap();

        bridge.dispose(ObjectHandle(1), true).unwrap();
        bridge.dispose(ObjectHandle(1), true).unwrap();

        let err = bridge.transmit(ObjectHandle(1), &[0x00], &mut []).unwrap_err();
        assert!(matches!(err, InteropError::I2c(I2cError::ObjectDisposed(_))));

        // The address is free for a new managed device.
        bridge.init(ObjectHandle(2), device_object(1, SLAVE_A)).unwrap();
    }

    #[test]
    fn test_finalizer_dispose_forgets_handle() {
        let bridge = bridge();
        bridge.init(ObjectHandle(1), device_object(1, SLAVE_A)).unwrap();

        bridge.dispose(ObjectHandle(1), false).unwrap();
        assert_eq!(bridge.handle_count(), 0);
        assert_eq!(bridge.manager().ref_count(BusId(1)), 0);

        // Runtime may recycle the handle.
        bridge.init(ObjectHandle(1), device_object(1, SLAVE_A)).unwrap();
        assert_eq!(bridge.handle_count(), 1);
    }

    #[test]
    fn test_dispose_unknown_handle_is_noop() {
        let bridge = bridge();
        assert!(bridge.dispose(ObjectHandle(99), true).is_ok());
        assert!(bridge.dispose(ObjectHandle(99), false).is_ok());
    }

    #[test]
    fn test_controller_handle_lifecycle() {
        let bridge = bridge();
        bridge
            .init(ObjectHandle(1), ManagedObject::Controller { bus_id: BusId(1) })
            .unwrap();
        assert_eq!(bridge.manager().ref_count(BusId(1)), 1);

        let err = bridge.transmit(ObjectHandle(1), &[0x00], &mut []).unwrap_err();
        assert!(matches!(
            err,
            InteropError::WrongObjectKind {
                call: "transmit",
                kind: "controller"
            }
        ));

        bridge.dispose(ObjectHandle(1), true).unwrap();
        assert_eq!(bridge.manager().ref_count(BusId(1)), 0);
    }

    #[test]
    fn test_transmit_unknown_handle() {
        let bridge = bridge();
        let err = bridge.transmit(ObjectHandle(7), &[], &mut []).unwrap_err();
        assert!(matches!(err, InteropError::UnknownHandle(7)));
    }

    #[test]
    fn test_hardware_outcome_is_data() {
        let bridge = bridge();
        bridge.init(ObjectHandle(1), device_object(1, 0x33)).unwrap();
        let result = bridge.transmit(ObjectHandle(1), &[0x00], &mut []).unwrap();
        assert_eq!(result.status, TransferStatus::SlaveAddressNotAcknowledged);
    }

    #[test]
    fn test_registry_routes_calls() {
        let registry = InteropRegistry::with_bridge(bridge());

        let reply = registry
            .dispatch(ManagedType::Controller, InteropCall::GetDeviceSelector)
            .unwrap();
        assert_eq!(reply, InteropReply::Selector("I2C1,I2C2".to_string()));

        registry
            .dispatch(
                ManagedType::Device,
                InteropCall::Init {
                    handle: ObjectHandle(3),
                    object: device_object(1, SLAVE_A),
                },
            )
            .unwrap();

        let mut buf = [0u8; 2];
        let reply = registry
            .dispatch(
                ManagedType::Device,
                InteropCall::Transmit {
                    handle: ObjectHandle(3),
                    write: &[0x00],
                    read: &mut buf,
                },
            )
            .unwrap();
        assert_eq!(reply, InteropReply::Transfer(TransferResult::full(3)));

        let reply = registry
            .dispatch(
                ManagedType::Device,
                InteropCall::Dispose {
                    handle: ObjectHandle(3),
                    disposing: true,
                },
            )
            .unwrap();
        assert_eq!(reply, InteropReply::Done);
    }

    #[test]
    fn test_registry_dispose_releases_managed_controller() {
        let (manager, sim) = fixture();
        let bridge = Arc::new(HostBridge::new(manager));
        let registry = InteropRegistry::with_bridge(bridge.clone());

        registry
            .dispatch(
                ManagedType::Controller,
                InteropCall::Init {
                    handle: ObjectHandle(1),
                    object: ManagedObject::Controller { bus_id: BusId(1) },
                },
            )
            .unwrap();
        registry
            .dispatch(
                ManagedType::Device,
                InteropCall::Init {
                    handle: ObjectHandle(2),
                    object: device_object(1, SLAVE_A),
                },
            )
            .unwrap();
        assert_eq!(bridge.manager().ref_count(BusId(1)), 2);

        for (managed, handle) in [(ManagedType::Device, 2), (ManagedType::Controller, 1)] {
            let reply = registry
                .dispatch(
                    managed,
                    InteropCall::Dispose {
                        handle: ObjectHandle(handle),
                        disposing: true,
                    },
                )
                .unwrap();
            assert_eq!(reply, InteropReply::Done);
        }

        assert_eq!(bridge.manager().ref_count(BusId(1)), 0);
        assert_eq!(sim.bus(BusId(1)).unwrap().open_drivers(), 0);
    }

    #[test]
    fn test_init_racing_dispose_keeps_new_device() {
        for _ in 0..200 {
            let bridge = bridge();
            bridge.init(ObjectHandle(1), device_object(1, SLAVE_A)).unwrap();

            let disposer = {
                let bridge = bridge.clone();
                thread::spawn(move || bridge.dispose(ObjectHandle(1), true).unwrap())
            };
            let reinit = bridge.init(ObjectHandle(1), device_object(2, SLAVE_A));
            disposer.join().unwrap();

            // A successful init must never be replaced by the old tombstone.
            if reinit.is_ok() {
                let result = bridge.transmit(ObjectHandle(1), &[0x00], &mut []).unwrap();
                assert!(result.is_full());
                assert_eq!(bridge.manager().ref_count(BusId(2)), 1);
            } else {
                assert!(matches!(reinit, Err(InteropError::HandleInUse(1))));
            }
        }
    }

    #[test]
    fn test_registry_rejects_calls_not_in_table() {
        let registry = InteropRegistry::with_bridge(bridge());

        let err = registry
            .dispatch(ManagedType::Device, InteropCall::GetDeviceSelector)
            .unwrap_err();
        assert!(matches!(
            err,
            InteropError::WrongObjectKind {
                call: "get_device_selector",
                kind: "device"
            }
        ));

        let err = registry
            .dispatch(
                ManagedType::Controller,
                InteropCall::Init {
                    handle: ObjectHandle(1),
                    object: device_object(1, SLAVE_A),
                },
            )
            .unwrap_err();
        assert!(matches!(
            err,
            InteropError::WrongObjectKind { call: "init", .. }
        ));
    }

    #[test]
    fn test_registry_without_core() {
        let registry = InteropRegistry::new();
        let err = registry
            .dispatch(ManagedType::Controller, InteropCall::GetDeviceSelector)
            .unwrap_err();
        assert!(matches!(err, InteropError::NotRegistered("controller")));
    }
}

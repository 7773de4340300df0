//! Transaction execution and result classification
//!
//! The engine takes the owning controller's lock for the whole transaction.
//! The guard lives on the stack of `transmit`, so it is dropped on every exit
//! path: success, timeout, fault or structural error.

use devi2c_common::error::{I2cError, I2cResult};
use devi2c_common::types::{TransferResult, TransferStatus};
use tracing::{debug, warn};

use crate::bus::{BusFault, BusReport, BusRequest};
use crate::device::Device;

/// Shape of a transaction, derived from which buffers are non-empty
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Empty,
    WriteOnly,
    ReadOnly,
    /// Write, repeated START, read; typical register read
    WriteRead,
}

impl TransferKind {
    pub fn of(write: &[u8], read: &[u8]) -> Self {
        match (write.is_empty(), read.is_empty()) {
            (true, true) => TransferKind::Empty,
            (false, true) => TransferKind::WriteOnly,
            (true, false) => TransferKind::ReadOnly,
            (false, false) => TransferKind::WriteRead,
        }
    }
}

/// Executes transactions on behalf of devices
pub struct TransferEngine;

impl TransferEngine {
    /// Run one transaction for `device`
    ///
    /// Hardware outcomes are returned in the `TransferResult`. Errors are
    /// reserved for structural problems such as a disposed device.
    pub fn transmit(device: &Device, write: &[u8], read: &mut [u8]) -> I2cResult<TransferResult> {
        let controller = device.controller();
        let mut state = controller.lock();

        if !state.is_bound(device.address(), device.serial()) {
            return Err(I2cError::ObjectDisposed(device.id()));
        }

        let kind = TransferKind::of(write, read);
        if kind == TransferKind::Empty {
            return Ok(TransferResult::full(0));
        }

        let driver = state
            .driver()
            .ok_or(I2cError::ControllerClosed(controller.id()))?;

        let settings = device.settings();
        let mut request = BusRequest {
            address: settings.address,
            speed: settings.bus_speed,
            clock_stretch_timeout: device.clock_stretch_timeout(),
            write,
            read,
        };
        let requested = request.requested();
        let report = driver.execute(&mut request);
        let result = Self::classify(requested, &report);

        match result.status {
            TransferStatus::UnknownError => warn!(
                "I2C {:?} to {} on bus {} failed after {} of {} bytes: {:?}",
                kind,
                settings.address,
                settings.bus_id,
                result.bytes_transferred,
                requested,
                report.fault
            ),
            _ => debug!(
                "I2C {:?} to {} on bus {}: {}",
                kind, settings.address, settings.bus_id, result
            ),
        }

        Ok(result)
    }

    /// Turn a driver report into a result
    ///
    /// Priority: address NACK, clock-stretch timeout, early end, success,
    /// anything else. The byte count never exceeds `requested`.
    pub fn classify(requested: usize, report: &BusReport) -> TransferResult {
        if !report.address_acked {
            return TransferResult::new(0, TransferStatus::SlaveAddressNotAcknowledged);
        }

        let moved = report.bytes_moved.min(requested);
        let status = match &report.fault {
            Some(BusFault::ClockStretchTimeout) => TransferStatus::ClockStretchTimeout,
            Some(BusFault::DataNack) | None if moved < requested => {
                TransferStatus::PartialTransfer
            }
            Some(BusFault::DataNack) | None => TransferStatus::FullTransfer,
            Some(BusFault::Other(_)) => TransferStatus::UnknownError,
        };

        TransferResult::new(count(moved), status)
    }
}

fn count(bytes: usize) -> u32 {
    u32::try_from(bytes).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{BusEventKind, EventLog, Fault, SimBus, SimRegistry, SimSlave};
    use crate::test_support::{fixture, init_tracing, settings, SLAVE_A, SLAVE_B};
    use crate::ControllerManager;
    use devi2c_common::config::Config;
    use devi2c_common::types::{BusId, DeviceAddress};
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_transfer_kind() {
        assert_eq!(TransferKind::of(&[], &[]), TransferKind::Empty);
        assert_eq!(TransferKind::of(&[1], &[]), TransferKind::WriteOnly);
        assert_eq!(TransferKind::of(&[], &[0]), TransferKind::ReadOnly);
        assert_eq!(TransferKind::of(&[1], &[0]), TransferKind::WriteRead);
    }

    #[test]
    fn test_classify_address_nack_wins() {
        let report = BusReport {
            address_acked: false,
            bytes_moved: 3,
            fault: Some(BusFault::ClockStretchTimeout),
        };
        let result = TransferEngine::classify(4, &report);
        assert_eq!(result.status, TransferStatus::SlaveAddressNotAcknowledged);
        assert_eq!(result.bytes_transferred, 0);
    }

    #[test]
    fn test_classify_stretch_timeout_keeps_count() {
        let report = BusReport::fault(2, BusFault::ClockStretchTimeout);
        assert_eq!(
            TransferEngine::classify(4, &report),
            TransferResult::new(2, TransferStatus::ClockStretchTimeout)
        );
    }

    #[test]
    fn test_classify_short_completion_is_partial() {
        assert_eq!(
            TransferEngine::classify(4, &BusReport::complete(3)),
            TransferResult::new(3, TransferStatus::PartialTransfer)
        );
        assert_eq!(
            TransferEngine::classify(4, &BusReport::fault(1, BusFault::DataNack)),
            TransferResult::new(1, TransferStatus::PartialTransfer)
        );
    }

    #[test]
    fn test_classify_full_and_clamped() {
        assert_eq!(
            TransferEngine::classify(4, &BusReport::complete(4)),
            TransferResult::full(4)
        );
        assert_eq!(
            TransferEngine::classify(4, &BusReport::complete(9)),
            TransferResult::full(4)
        );
    }

    #[test]
    fn test_classify_other_fault_is_unknown() {
        let report = BusReport::fault(1, BusFault::Other("bus error".to_string()));
        assert_eq!(
            TransferEngine::classify(4, &report),
            TransferResult::new(1, TransferStatus::UnknownError)
        );
    }

    #[test]
    fn test_empty_transmit_is_full_with_zero_bytes() {
        init_tracing();
        let (manager, registry) = fixture();
        let device = manager.create_device(settings(1, SLAVE_A)).unwrap();
        let nobody = manager.create_device(settings(1, 0x10)).unwrap();

        assert_eq!(device.transmit(&[], &mut []).unwrap(), TransferResult::full(0));
        assert_eq!(nobody.transmit(&[], &mut []).unwrap(), TransferResult::full(0));
        assert_eq!(registry.bus(BusId(1)).unwrap().transactions(), 0);
    }

    #[test]
    fn test_write_then_read_register() {
        let (manager, _) = fixture();
        let device = manager.create_device(settings(1, SLAVE_A)).unwrap();

        let result = device.transmit(&[0x10, 0xDE, 0xAD], &mut []).unwrap();
        assert_eq!(result, TransferResult::full(3));

        let mut buf = [0u8; 2];
        let result = device.transmit(&[0x10], &mut buf).unwrap();
        assert_eq!(result, TransferResult::full(3));
        assert_eq!(buf, [0xDE, 0xAD]);
    }

    #[test]
    fn test_read_only_continues_from_pointer() {
        let (manager, registry) = fixture();
        let bus = registry.bus(BusId(1)).unwrap();
        bus.add_slave(
            DeviceAddress::SevenBit(0x30),
            SimSlave::with_registers(vec![7, 8, 9]),
        );
        let device = manager.create_device(settings(1, 0x30)).unwrap();

        let mut buf = [0u8; 3];
        assert_eq!(device.transmit(&[], &mut buf).unwrap(), TransferResult::full(3));
        assert_eq!(buf, [7, 8, 9]);
    }

    #[test]
    fn test_partial_write_for_every_nack_position() {
        let (manager, registry) = fixture();
        let bus = registry.bus(BusId(1)).unwrap();
        let device = manager.create_device(settings(1, SLAVE_A)).unwrap();
        let data = [0x00, 0x11, 0x22, 0x33, 0x44, 0x55];

        for n in 0..data.len() {
            bus.set_fault(DeviceAddress::SevenBit(SLAVE_A), Some(Fault::NackAt(n)));
            let result = device.transmit(&data, &mut []).unwrap();
            assert_eq!(
                result,
                TransferResult::new(n as u32, TransferStatus::PartialTransfer),
                "NACK after {} of {} bytes",
                n,
                data.len()
            );
        }
    }

    #[test]
    fn test_address_nack_for_any_buffers() {
        let (manager, _) = fixture();
        let device = manager.create_device(settings(1, 0x42)).unwrap();

        let cases: [(&[u8], usize); 3] = [(&[1, 2, 3], 0), (&[], 4), (&[9], 2)];
        for (write, read_len) in cases {
            let mut read = vec![0u8; read_len];
            let result = device.transmit(write, &mut read).unwrap();
            assert_eq!(
                result,
                TransferResult::new(0, TransferStatus::SlaveAddressNotAcknowledged)
            );
        }
    }

    #[test]
    fn test_clock_stretch_timeout_reports_bytes_before_stall() {
        let (manager, registry) = fixture();
        let bus = registry.bus(BusId(1)).unwrap();
        bus.set_fault(
            DeviceAddress::SevenBit(SLAVE_A),
            Some(Fault::StretchAt {
                byte: 2,
                duration: Duration::from_secs(30),
            }),
        );
        let device = manager
            .create_device(settings(1, SLAVE_A).clock_stretch_timeout(Duration::from_millis(5)))
            .unwrap();

        let mut buf = [0u8; 4];
        let result = device.transmit(&[0x00], &mut buf).unwrap();
        assert_eq!(
            result,
            TransferResult::new(2, TransferStatus::ClockStretchTimeout)
        );
    }

    #[test]
    fn test_bus_error_is_unknown_error() {
        let (manager, registry) = fixture();
        let bus = registry.bus(BusId(1)).unwrap();
        bus.set_fault(DeviceAddress::SevenBit(SLAVE_A), Some(Fault::ErrorAt(1)));
        let device = manager.create_device(settings(1, SLAVE_A)).unwrap();

        let result = device.transmit(&[0x00, 0x01, 0x02], &mut []).unwrap();
        assert_eq!(result, TransferResult::new(1, TransferStatus::UnknownError));

        // The lock was released on the fault path.
        bus.set_fault(DeviceAddress::SevenBit(SLAVE_A), None);
        let result = device.transmit(&[0x00, 0x01, 0x02], &mut []).unwrap();
        assert!(result.is_full());
    }

    #[test]
    fn test_transmit_on_disposed_device_fails() {
        let (manager, _) = fixture();
        let device = manager.create_device(settings(1, SLAVE_A)).unwrap();
        device.dispose();

        assert!(matches!(
            device.transmit(&[0x00], &mut []),
            Err(I2cError::ObjectDisposed(_))
        ));
        assert!(matches!(
            device.transmit(&[], &mut []),
            Err(I2cError::ObjectDisposed(_))
        ));
    }

    #[test]
    fn test_same_controller_transfers_never_interleave() {
        init_tracing();
        let (manager, registry) = fixture();
        let bus = registry.bus(BusId(1)).unwrap();
        bus.set_byte_time(Duration::from_micros(200));

        let a = Arc::new(manager.create_device(settings(1, SLAVE_A)).unwrap());
        let b = Arc::new(manager.create_device(settings(1, SLAVE_B)).unwrap());
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = [a, b]
            .into_iter()
            .map(|device| {
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..5 {
                        let mut buf = [0u8; 4];
                        let result = device.transmit(&[0x00, 1, 2, 3], &mut buf).unwrap();
                        assert!(result.is_full());
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let events = bus.log().snapshot();
        assert_eq!(
            events.iter().filter(|e| e.kind == BusEventKind::Start).count(),
            10
        );

        // Between each START and its STOP only one address may appear.
        let mut current = None;
        for event in &events {
            match event.kind {
                BusEventKind::Start => {
                    assert!(current.is_none(), "START inside another transaction");
                    current = Some(event.address);
                }
                BusEventKind::Stop => {
                    assert_eq!(current, Some(event.address));
                    current = None;
                }
                _ => assert_eq!(current, Some(event.address), "interleaved byte"),
            }
        }
        assert!(current.is_none());
    }

    #[test]
    fn test_distinct_controllers_run_concurrently() {
        let log = EventLog::new();
        let registry = Arc::new(SimRegistry::new("I2C"));
        for id in [1, 2] {
            let bus = SimBus::with_log(BusId(id), log.clone());
            bus.add_slave(DeviceAddress::SevenBit(SLAVE_A), SimSlave::new(16));
            bus.set_byte_time(Duration::from_millis(5));
            registry.add_bus(bus);
        }
        let manager = ControllerManager::new(registry, Config::default()).unwrap();

        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = [1u8, 2]
            .into_iter()
            .map(|bus| {
                let device = manager.create_device(settings(bus, SLAVE_A)).unwrap();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    let data = [0u8; 10];
                    assert!(device.transmit(&data, &mut []).unwrap().is_full());
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let events = log.snapshot();
        let span = |bus: BusId| {
            let start = events
                .iter()
                .find(|e| e.bus == bus && e.kind == BusEventKind::Start)
                .unwrap()
                .at;
            let stop = events
                .iter()
                .find(|e| e.bus == bus && e.kind == BusEventKind::Stop)
                .unwrap()
                .at;
            (start, stop)
        };
        let (start1, stop1) = span(BusId(1));
        let (start2, stop2) = span(BusId(2));
        assert!(start1 < stop2 && start2 < stop1, "transfers were serialized");
    }

    #[test]
    fn test_dispose_waits_for_in_flight_transfer() {
        let (manager, registry) = fixture();
        let bus = registry.bus(BusId(1)).unwrap();
        bus.set_byte_time(Duration::from_millis(2));
        let device = Arc::new(manager.create_device(settings(1, SLAVE_A)).unwrap());

        let worker = {
            let device = device.clone();
            thread::spawn(move || device.transmit(&[0x00; 20], &mut []))
        };
        // Give the worker time to take the bus.
        thread::sleep(Duration::from_millis(5));
        device.dispose();

        let first = worker.join().unwrap();
        // Either the transfer won the lock and completed, or it lost and saw
        // the disposal. It is never cut short on the wire.
        match first {
            Ok(result) => assert!(result.is_full()),
            Err(err) => assert!(matches!(err, I2cError::ObjectDisposed(_))),
        }
        let events = bus.log().snapshot();
        let starts = events.iter().filter(|e| e.kind == BusEventKind::Start).count();
        let stops = events.iter().filter(|e| e.kind == BusEventKind::Stop).count();
        assert_eq!(starts, stops);

        assert!(matches!(
            device.transmit(&[0x00], &mut []),
            Err(I2cError::ObjectDisposed(_))
        ));
    }
}

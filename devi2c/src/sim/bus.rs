//! In-memory bus and registry

use devi2c_common::error::{I2cError, I2cResult};
use devi2c_common::types::{BusId, BusSpeed, DeviceAddress};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::bus::{BusDriver, BusFault, BusInfo, BusRegistry, BusReport, BusRequest};
use crate::lock;

use super::slave::{Fault, SimSlave, Step};

/// Wire-level event recorded by a simulated bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusEventKind {
    Start,
    Write(u8),
    Read(u8),
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusEvent {
    pub bus: BusId,
    pub address: DeviceAddress,
    pub kind: BusEventKind,
    pub at: Instant,
}

/// Event log, shareable between several buses
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<BusEvent>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, bus: BusId, address: DeviceAddress, kind: BusEventKind) {
        lock(&self.events).push(BusEvent {
            bus,
            address,
            kind,
            at: Instant::now(),
        });
    }

    pub fn snapshot(&self) -> Vec<BusEvent> {
        lock(&self.events).clone()
    }

    pub fn clear(&self) {
        lock(&self.events).clear();
    }
}

#[derive(Debug)]
struct SimBusState {
    slaves: HashMap<DeviceAddress, SimSlave>,
    byte_time: Duration,
    present: bool,
    open_drivers: usize,
    transactions: usize,
    last_speed: Option<BusSpeed>,
}

/// A simulated bus
///
/// Clones share the same state, so a test can keep one clone for inspection
/// while the registry hands out drivers for the others.
#[derive(Debug, Clone)]
pub struct SimBus {
    id: BusId,
    state: Arc<Mutex<SimBusState>>,
    log: EventLog,
}

impl SimBus {
    pub fn new(id: BusId) -> Self {
        Self::with_log(id, EventLog::new())
    }

    /// Bus recording into an existing log
    pub fn with_log(id: BusId, log: EventLog) -> Self {
        Self {
            id,
            state: Arc::new(Mutex::new(SimBusState {
                slaves: HashMap::new(),
                byte_time: Duration::ZERO,
                present: true,
                open_drivers: 0,
                transactions: 0,
                last_speed: None,
            })),
            log,
        }
    }

    pub fn id(&self) -> BusId {
        self.id
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }

    pub fn add_slave(&self, address: DeviceAddress, slave: SimSlave) {
        lock(&self.state).slaves.insert(address, slave);
    }

    pub fn remove_slave(&self, address: DeviceAddress) {
        lock(&self.state).slaves.remove(&address);
    }

    pub fn set_fault(&self, address: DeviceAddress, fault: Option<Fault>) {
        if let Some(slave) = lock(&self.state).slaves.get_mut(&address) {
            slave.set_fault(fault);
        }
    }

    pub fn registers(&self, address: DeviceAddress) -> Option<Vec<u8>> {
        lock(&self.state)
            .slaves
            .get(&address)
            .map(|s| s.registers().to_vec())
    }

    /// Time spent clocking each data byte
    pub fn set_byte_time(&self, byte_time: Duration) {
        lock(&self.state).byte_time = byte_time;
    }

    /// Simulate the adapter appearing or disappearing
    pub fn set_present(&self, present: bool) {
        lock(&self.state).present = present;
    }

    pub fn is_present(&self) -> bool {
        lock(&self.state).present
    }

    /// Number of drivers currently holding this bus open
    pub fn open_drivers(&self) -> usize {
        lock(&self.state).open_drivers
    }

    /// Number of transactions that reached the wire
    pub fn transactions(&self) -> usize {
        lock(&self.state).transactions
    }

    /// Bus speed of the most recent transaction
    pub fn last_speed(&self) -> Option<BusSpeed> {
        lock(&self.state).last_speed
    }

    fn open_driver(&self) -> SimDriver {
        lock(&self.state).open_drivers += 1;
        SimDriver { bus: self.clone() }
    }

    /// Run `f` on the slave at `address` under the bus state lock
    fn with_slave<R>(&self, address: DeviceAddress, f: impl FnOnce(&mut SimSlave) -> R) -> Option<R> {
        lock(&self.state).slaves.get_mut(&address).map(f)
    }

    /// Clock the data bytes of one transaction
    ///
    /// The state lock is taken per byte and released while the byte is on
    /// the wire, so the bus itself never serializes concurrent drivers.
    fn transact(&self, request: &mut BusRequest<'_>, byte_time: Duration) -> BusReport {
        let address = request.address;
        if self.with_slave(address, |_| ()).is_none() {
            return BusReport::address_nack();
        }

        let write_len = request.write.len();
        let total = request.requested();
        for position in 0..total {
            // A slave removed mid-transaction stops answering.
            let Some(step) = self.with_slave(address, |slave| slave.step(position)) else {
                return BusReport::fault(position, BusFault::DataNack);
            };
            match step {
                Step::Ready => {}
                Step::Nack => return BusReport::fault(position, BusFault::DataNack),
                Step::Error => {
                    return BusReport::fault(
                        position,
                        BusFault::Other("arbitration lost".to_string()),
                    );
                }
                Step::Stall(duration) if duration > request.clock_stretch_timeout => {
                    thread::sleep(request.clock_stretch_timeout);
                    return BusReport::fault(position, BusFault::ClockStretchTimeout);
                }
                Step::Stall(duration) => thread::sleep(duration),
            }
            pace(byte_time);

            let clocked = self.with_slave(address, |slave| {
                let kind = if position < write_len {
                    let byte = request.write[position];
                    slave.accept(position == 0, byte);
                    BusEventKind::Write(byte)
                } else {
                    let byte = slave.supply();
                    request.read[position - write_len] = byte;
                    BusEventKind::Read(byte)
                };
                self.log.push(self.id, address, kind);
            });
            if clocked.is_none() {
                return BusReport::fault(position, BusFault::DataNack);
            }
        }

        BusReport::complete(total)
    }
}

fn pace(byte_time: Duration) {
    if !byte_time.is_zero() {
        thread::sleep(byte_time);
    }
}

/// Driver handle for a simulated bus
#[derive(Debug)]
pub struct SimDriver {
    bus: SimBus,
}

impl BusDriver for SimDriver {
    fn execute(&mut self, request: &mut BusRequest<'_>) -> BusReport {
        let bus = &self.bus;
        let byte_time = {
            let mut state = lock(&bus.state);
            state.transactions += 1;
            state.last_speed = Some(request.speed);
            state.byte_time
        };

        bus.log.push(bus.id, request.address, BusEventKind::Start);
        let report = bus.transact(request, byte_time);
        bus.log.push(bus.id, request.address, BusEventKind::Stop);

        report
    }
}

impl Drop for SimDriver {
    fn drop(&mut self) {
        lock(&self.bus.state).open_drivers -= 1;
    }
}

/// Registry over a set of simulated buses
#[derive(Debug)]
pub struct SimRegistry {
    prefix: String,
    buses: Mutex<BTreeMap<BusId, SimBus>>,
}

impl SimRegistry {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            buses: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn add_bus(&self, bus: SimBus) {
        lock(&self.buses).insert(bus.id(), bus);
    }

    pub fn bus(&self, id: BusId) -> Option<SimBus> {
        lock(&self.buses).get(&id).cloned()
    }
}

impl BusRegistry for SimRegistry {
    fn list_buses(&self) -> Vec<BusInfo> {
        lock(&self.buses)
            .values()
            .filter(|bus| bus.is_present())
            .map(|bus| BusInfo {
                id: bus.id(),
                selector: bus.id().selector(&self.prefix),
                path: None,
            })
            .collect()
    }

    fn open(&self, info: &BusInfo) -> I2cResult<Box<dyn BusDriver>> {
        let bus = self
            .bus(info.id)
            .filter(|bus| bus.is_present())
            .ok_or(I2cError::NotFound(info.id))?;
        debug!("Opening simulated I2C bus {}", info.id);
        Ok(Box::new(bus.open_driver()))
    }
}

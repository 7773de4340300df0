//! Simulated I2C hardware
//!
//! Buses and slaves that live entirely in memory. Slaves can be scripted to
//! NACK, stretch the clock or fault at a given byte, and every bus records a
//! byte-level event log so tests can check wire ordering.

pub mod bus;
pub mod slave;

pub use bus::{BusEvent, BusEventKind, EventLog, SimBus, SimDriver, SimRegistry};
pub use slave::{Fault, SimSlave};

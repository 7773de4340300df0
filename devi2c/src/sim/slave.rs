//! Scripted slave devices for the simulated bus

use std::time::Duration;

/// Fault injected into a simulated slave
///
/// Byte positions count data bytes across the whole transaction, write
/// phase first, starting at 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// NACK the data byte at this position
    NackAt(usize),
    /// Hold SCL low for `duration` before the byte at `byte`
    StretchAt { byte: usize, duration: Duration },
    /// Report a generic bus error before the byte at this position
    ErrorAt(usize),
}

/// Slave behaviour before one data byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Ready,
    /// Hold SCL low for this long
    Stall(Duration),
    Nack,
    Error,
}

/// A register-file slave
///
/// The first written byte of a transaction selects the register pointer;
/// following writes store at the pointer, reads return from it. The pointer
/// auto-increments and wraps.
#[derive(Debug, Clone)]
pub struct SimSlave {
    registers: Vec<u8>,
    pointer: usize,
    fault: Option<Fault>,
}

impl SimSlave {
    /// Slave with `size` zeroed registers
    pub fn new(size: usize) -> Self {
        Self::with_registers(vec![0; size])
    }

    pub fn with_registers(registers: Vec<u8>) -> Self {
        Self {
            registers,
            pointer: 0,
            fault: None,
        }
    }

    pub fn with_fault(mut self, fault: Fault) -> Self {
        self.fault = Some(fault);
        self
    }

    pub fn set_fault(&mut self, fault: Option<Fault>) {
        self.fault = fault;
    }

    pub fn registers(&self) -> &[u8] {
        &self.registers
    }

    /// What the slave does before the data byte at `position`
    pub(crate) fn step(&self, position: usize) -> Step {
        match self.fault {
            Some(Fault::NackAt(n)) if n == position => Step::Nack,
            Some(Fault::StretchAt { byte, duration }) if byte == position => Step::Stall(duration),
            Some(Fault::ErrorAt(n)) if n == position => Step::Error,
            _ => Step::Ready,
        }
    }

    /// Take a written byte; the first byte of a transaction selects the register
    pub(crate) fn accept(&mut self, first: bool, byte: u8) {
        if first {
            self.select(byte);
        } else {
            self.store(byte);
        }
    }

    /// Supply the next byte of a read
    pub(crate) fn supply(&mut self) -> u8 {
        self.load()
    }

    fn select(&mut self, register: u8) {
        if !self.registers.is_empty() {
            self.pointer = register as usize % self.registers.len();
        }
    }

    fn store(&mut self, value: u8) {
        if self.registers.is_empty() {
            return;
        }
        self.registers[self.pointer] = value;
        self.pointer = (self.pointer + 1) % self.registers.len();
    }

    fn load(&mut self) -> u8 {
        if self.registers.is_empty() {
            return 0xFF;
        }
        let value = self.registers[self.pointer];
        self.pointer = (self.pointer + 1) % self.registers.len();
        value
    }
}

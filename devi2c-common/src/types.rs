//! Core data types shared between the bus core and its host bindings
//!
//! This module provides the value types that cross the interop boundary:
//! - BusId / DeviceAddress / DeviceId: identity of buses and devices
//! - ConnectionSettings: how a device is bound to a bus
//! - TransferStatus / TransferResult: outcome of one bus transaction
//!
//! The numeric values of `TransferStatus` are mirrored by the managed side
//! and must never be reordered.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::time::Duration;

/// Default prefix of bus selector strings (`I2C1`, `I2C2`, ...)
pub const DEFAULT_SELECTOR_PREFIX: &str = "I2C";

/// Multiplier used to fold bus number and 7-bit address into a device id
pub const DEVICE_ID_MULTIPLIER: u32 = 1000;

/// Marker bit for device ids built from 10-bit addresses
const TEN_BIT_ID_FLAG: u32 = 0x8000_0000;

/// Highest valid 7-bit address
pub const MAX_SEVEN_BIT_ADDRESS: u8 = 0x7F;

/// Highest valid 10-bit address
pub const MAX_TEN_BIT_ADDRESS: u16 = 0x3FF;

// ============================================================================
// Bus Identity
// ============================================================================

/// Identifier of one physical I2C bus (the `n` in `/dev/i2c-n` or `I2Cn`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BusId(pub u8);

impl BusId {
    /// Format this bus as a selector string, e.g. `I2C1`
    pub fn selector(&self, prefix: &str) -> String {
        format!("{}{}", prefix, self.0)
    }

    /// Parse a selector string such as `I2C1` back into a bus id
    ///
    /// The prefix comparison is case-insensitive. Returns `None` if the
    /// prefix does not match or the remainder is not a bus number.
    pub fn from_selector(selector: &str, prefix: &str) -> Option<Self> {
        let selector = selector.trim();
        if selector.len() <= prefix.len() || !selector.is_char_boundary(prefix.len()) {
            return None;
        }
        let (head, tail) = selector.split_at(prefix.len());
        if !head.eq_ignore_ascii_case(prefix) {
            return None;
        }
        // u8::from_str would also take a leading '+'
        if !tail.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        tail.parse::<u8>().ok().map(BusId)
    }
}

impl fmt::Display for BusId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Addressing
// ============================================================================

/// Slave addressing mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AddressingMode {
    SevenBit,
    TenBit,
}

/// A validated slave address
///
/// The same numeric value in 7-bit and 10-bit mode refers to two different
/// devices on the wire, so the mode is part of the address identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceAddress {
    SevenBit(u8),
    TenBit(u16),
}

impl DeviceAddress {
    /// Create a 7-bit address (0x00-0x7F)
    pub fn seven_bit(address: u8) -> Result<Self, AddressError> {
        if address > MAX_SEVEN_BIT_ADDRESS {
            return Err(AddressError::OutOfRange {
                address: address as u16,
                mode: AddressingMode::SevenBit,
            });
        }
        Ok(Self::SevenBit(address))
    }

    /// Create a 10-bit address (0x000-0x3FF)
    pub fn ten_bit(address: u16) -> Result<Self, AddressError> {
        if address > MAX_TEN_BIT_ADDRESS {
            return Err(AddressError::OutOfRange {
                address,
                mode: AddressingMode::TenBit,
            });
        }
        Ok(Self::TenBit(address))
    }

    /// Re-check the range invariant, e.g. after deserialization
    pub fn validate(self) -> Result<Self, AddressError> {
        match self {
            Self::SevenBit(a) => Self::seven_bit(a),
            Self::TenBit(a) => Self::ten_bit(a),
        }
    }

    pub fn mode(&self) -> AddressingMode {
        match self {
            Self::SevenBit(_) => AddressingMode::SevenBit,
            Self::TenBit(_) => AddressingMode::TenBit,
        }
    }

    /// Raw numeric address
    pub fn raw(&self) -> u16 {
        match self {
            Self::SevenBit(a) => *a as u16,
            Self::TenBit(a) => *a,
        }
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SevenBit(a) => write!(f, "0x{:02X}", a),
            Self::TenBit(a) => write!(f, "0x{:03X} (10-bit)", a),
        }
    }
}

/// Address validation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("Address 0x{address:X} is out of range for {mode:?} addressing")]
    OutOfRange { address: u16, mode: AddressingMode },
}

/// Unique id of a device across all buses
///
/// 7-bit devices use the managed-side encoding `bus * 1000 + address`.
/// 10-bit devices carry the top bit so their ids never collide with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub u32);

impl DeviceId {
    pub fn new(bus: BusId, address: DeviceAddress) -> Self {
        match address {
            DeviceAddress::SevenBit(a) => Self(bus.0 as u32 * DEVICE_ID_MULTIPLIER + a as u32),
            DeviceAddress::TenBit(a) => Self(TEN_BIT_ID_FLAG | (bus.0 as u32) << 16 | a as u32),
        }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Connection Settings
// ============================================================================

/// Bus clock rate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BusSpeed {
    /// 100 kHz
    #[default]
    #[serde(alias = "standard-mode")]
    Standard,
    /// 400 kHz
    #[serde(alias = "fast-mode")]
    Fast,
}

impl BusSpeed {
    pub fn hz(&self) -> u32 {
        match self {
            BusSpeed::Standard => 100_000,
            BusSpeed::Fast => 400_000,
        }
    }
}

/// Connection settings of a device on an I2C bus
///
/// Settings are copied into the device when it is opened and never change
/// afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ConnectionSettings {
    pub bus_id: BusId,
    pub address: DeviceAddress,
    #[serde(default)]
    pub bus_speed: BusSpeed,
    /// Overrides the controller-wide clock-stretch timeout when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clock_stretch_timeout_ms: Option<u64>,
}

impl ConnectionSettings {
    /// Settings for a 7-bit device at standard speed
    pub fn new(bus_id: u8, address: u8) -> Result<Self, AddressError> {
        Ok(Self {
            bus_id: BusId(bus_id),
            address: DeviceAddress::seven_bit(address)?,
            bus_speed: BusSpeed::default(),
            clock_stretch_timeout_ms: None,
        })
    }

    /// Settings for an already validated address
    pub fn with_address(bus_id: BusId, address: DeviceAddress) -> Self {
        Self {
            bus_id,
            address,
            bus_speed: BusSpeed::default(),
            clock_stretch_timeout_ms: None,
        }
    }

    pub fn bus_speed(mut self, speed: BusSpeed) -> Self {
        self.bus_speed = speed;
        self
    }

    pub fn clock_stretch_timeout(mut self, timeout: Duration) -> Self {
        self.clock_stretch_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn timeout_override(&self) -> Option<Duration> {
        self.clock_stretch_timeout_ms.map(Duration::from_millis)
    }

    pub fn device_id(&self) -> DeviceId {
        DeviceId::new(self.bus_id, self.address)
    }
}

// ============================================================================
// Transfer Result
// ============================================================================

/// Outcome of a bus transaction
///
/// These values must match the managed `I2cTransferStatus` enum exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TransferStatus {
    /// All requested bytes were moved
    FullTransfer = 0,
    /// The slave held SCL low longer than the configured timeout
    ClockStretchTimeout = 1,
    /// The transaction ended early, e.g. the slave NACKed a data byte
    PartialTransfer = 2,
    /// No device acknowledged the address byte
    SlaveAddressNotAcknowledged = 3,
    /// Any other bus fault
    UnknownError = 4,
}

impl TransferStatus {
    /// Create a TransferStatus from its numeric code
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(TransferStatus::FullTransfer),
            1 => Some(TransferStatus::ClockStretchTimeout),
            2 => Some(TransferStatus::PartialTransfer),
            3 => Some(TransferStatus::SlaveAddressNotAcknowledged),
            4 => Some(TransferStatus::UnknownError),
            _ => None,
        }
    }

    pub fn code(&self) -> u8 {
        *self as u8
    }

    /// Whether retrying the same transaction is expected to help
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            TransferStatus::ClockStretchTimeout | TransferStatus::PartialTransfer
        )
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransferStatus::FullTransfer => "FullTransfer",
            TransferStatus::ClockStretchTimeout => "ClockStretchTimeout",
            TransferStatus::PartialTransfer => "PartialTransfer",
            TransferStatus::SlaveAddressNotAcknowledged => "SlaveAddressNotAcknowledged",
            TransferStatus::UnknownError => "UnknownError",
        };
        f.write_str(name)
    }
}

// Serialized by numeric code, the form the managed side reads.
impl Serialize for TransferStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

impl<'de> Deserialize<'de> for TransferStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = u8::deserialize(deserializer)?;
        TransferStatus::from_code(code).ok_or_else(|| {
            serde::de::Error::custom(format!("invalid transfer status code {}", code))
        })
    }
}

/// Structured result of one transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TransferResult {
    pub bytes_transferred: u32,
    pub status: TransferStatus,
}

impl TransferResult {
    pub fn new(bytes_transferred: u32, status: TransferStatus) -> Self {
        Self {
            bytes_transferred,
            status,
        }
    }

    /// A completed transaction that moved `bytes` bytes
    pub fn full(bytes: u32) -> Self {
        Self::new(bytes, TransferStatus::FullTransfer)
    }

    pub fn is_full(&self) -> bool {
        self.status == TransferStatus::FullTransfer
    }
}

impl fmt::Display for TransferResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} bytes)", self.status, self.bytes_transferred)
    }
}

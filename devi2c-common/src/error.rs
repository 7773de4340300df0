//! Error types for the devi2c bus core
//!
//! - I2cError: structural errors of the controller/device layer
//! - InteropError: errors surfaced through the host call interface
//! - ConfigError: configuration loading/validation errors (re-exported from config module)
//! - AddressError: address validation errors (re-exported from types module)
//!
//! Hardware transaction outcomes (NACK, clock-stretch timeout, ...) are not
//! errors. They are reported as data in `TransferResult`.

use std::io;
use std::path::PathBuf;

use crate::types::{BusId, DeviceAddress, DeviceId, TransferResult};

pub use crate::config::ConfigError;
pub use crate::types::AddressError;

// ============================================================================
// I2C Error
// ============================================================================

/// Structural errors of the controller and device layer
///
/// These abort the call immediately and are never retried by the core.
#[derive(Debug, thiserror::Error)]
pub enum I2cError {
    /// Bus id is not known to the registry
    #[error("I2C bus {0} not found")]
    NotFound(BusId),

    /// Another open device is already bound to this address
    #[error("I2C device at address {address} on bus {bus} is already in use")]
    AddressInUse { bus: BusId, address: DeviceAddress },

    /// Operation on a disposed device
    #[error("I2C device {0} has been disposed")]
    ObjectDisposed(DeviceId),

    /// Operation on a controller whose bus has been released
    #[error("I2C controller for bus {0} has been closed")]
    ControllerClosed(BusId),

    /// Settings name a different bus than the controller they are opened on
    #[error("Connection settings target bus {settings} but controller owns bus {controller}")]
    BusMismatch { controller: BusId, settings: BusId },

    /// Address outside the range of its addressing mode
    #[error("Invalid device address: {0}")]
    InvalidAddress(#[from] AddressError),

    /// Failed to open the underlying bus device
    #[error("Failed to open I2C bus {bus} at {path:?}: {source}")]
    BusOpen {
        bus: BusId,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A single-byte access did not complete
    #[error("Incomplete transfer: {0}")]
    IncompleteTransfer(TransferResult),
}

// ============================================================================
// Interop Error
// ============================================================================

/// Errors surfaced through the host call interface
#[derive(Debug, thiserror::Error)]
pub enum InteropError {
    /// Error from the controller/device layer
    #[error("I2C error: {0}")]
    I2c(#[from] I2cError),

    /// Handle was never initialised or has already been torn down
    #[error("Unknown managed object handle {0}")]
    UnknownHandle(u32),

    /// Handle was already initialised
    #[error("Managed object handle {0} is already initialised")]
    HandleInUse(u32),

    /// Call is not valid for the object the handle refers to
    #[error("{call} is not supported on a managed {kind}")]
    WrongObjectKind {
        call: &'static str,
        kind: &'static str,
    },

    /// No core registered for the managed type
    #[error("No native implementation registered for {0}")]
    NotRegistered(&'static str),
}

// ============================================================================
// Result Type Aliases
// ============================================================================

/// Result type using I2cError
pub type I2cResult<T> = std::result::Result<T, I2cError>;

/// Result type using InteropError
pub type InteropResult<T> = std::result::Result<T, InteropError>;

//! Custom error types for the host framework.
//!
//! This module defines the primary error type, `DaqError`, shared by the host
//! layer and every detector driver. Using the `thiserror` crate, it provides a
//! centralized way to report failures, from configuration mistakes to
//! detector-specific problems.
//!
//! ## Error Hierarchy
//!
//! - **`Configuration`**: semantic errors in requested settings that are caught
//!   before any hardware is touched (bad frame/group arithmetic, unsupported
//!   trigger mode, out-of-range exposure).
//! - **`Io`**: wraps `std::io::Error`, covering socket and file failures.
//! - **`Driver`**: structured driver errors with a [`DriverErrorKind`].
//! - **`BufferNotAllocated`**: buffer manager misuse.
//!
//! Drivers usually keep their own typed error and convert into `DaqError` at
//! the capability boundary.

use thiserror::Error;

// =============================================================================
// Driver Errors
// =============================================================================

/// Broad category of a [`DriverError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    /// Device could not be brought up.
    Initialization,
    /// Invalid settings rejected before I/O.
    Configuration,
    /// Link to the device failed or desynchronized.
    Communication,
    /// The device reported a failure itself.
    Hardware,
    /// Anything else.
    Unknown,
}

impl std::fmt::Display for DriverErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            DriverErrorKind::Initialization => "initialization",
            DriverErrorKind::Configuration => "configuration",
            DriverErrorKind::Communication => "communication",
            DriverErrorKind::Hardware => "hardware",
            DriverErrorKind::Unknown => "unknown",
        };
        write!(f, "{}", label)
    }
}

/// Error raised by a driver, tagged with the driver type and a category.
#[derive(Error, Debug, Clone)]
#[error("Driver '{driver_type}' {kind} error: {message}")]
pub struct DriverError {
    /// Driver type string, as returned by `DriverFactory::driver_type`.
    pub driver_type: String,
    /// Category of the failure.
    pub kind: DriverErrorKind,
    /// Human readable message.
    pub message: String,
}

impl DriverError {
    /// Build a driver error.
    pub fn new(
        driver_type: impl Into<String>,
        kind: DriverErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            driver_type: driver_type.into(),
            kind,
            message: message.into(),
        }
    }
}

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Primary error type for the acquisition framework.
///
/// # Error Categories
///
/// 1. **Configuration Errors** - `Configuration`
///    - Raised before any command reaches the detector
///    - Recovery: fix the requested settings
///
/// 2. **Hardware/Communication Errors** - `Io`, `Driver`
///    - May be transient (network glitch) or permanent (detector off)
///    - Recovery: reconnect the device, then retry
///
/// 3. **Buffer Errors** - `BufferNotAllocated`
///    - Programming error between driver and host buffers
///
/// # Example
///
/// ```rust
/// use daq_core::error::DaqError;
///
/// fn validate_groups(frames: u32, groups: u32) -> Result<(), DaqError> {
///     if groups == 0 || frames % groups != 0 {
///         return Err(DaqError::Configuration(
///             "Number of frames must be a multiple of number of groups".into(),
///         ));
///     }
///     Ok(())
/// }
/// ```
#[derive(Error, Debug)]
pub enum DaqError {
    /// Requested settings are invalid.
    ///
    /// Occurs when values parse correctly but fail semantic validation
    /// (e.g., frame count not a multiple of the group count, unsupported
    /// trigger mode, non-zero latency).
    ///
    /// **Error Type**: Permanent - requires changing the requested values.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Standard I/O operation failed.
    ///
    /// **Recovery Strategy**:
    /// - For `ErrorKind::ConnectionRefused` or `NotFound`: check the server address
    /// - For `ErrorKind::UnexpectedEof`: the peer closed the socket, reconnect
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Structured driver error with category
    #[error("{0}")]
    Driver(DriverError),

    /// A frame was written before any buffer was allocated.
    #[error("Frame buffers have not been allocated")]
    BufferNotAllocated,
}

impl From<DriverError> for DaqError {
    fn from(err: DriverError) -> Self {
        DaqError::Driver(err)
    }
}

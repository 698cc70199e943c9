//! Error type for the Xh driver.

use daq_core::error::{DaqError, DriverError, DriverErrorKind};
use thiserror::Error;

/// Driver type string used in structured errors.
pub(crate) const DRIVER_TYPE: &str = "xh";

/// Result alias for Xh operations.
pub type XhResult<T> = std::result::Result<T, XhError>;

/// Failures of the Xh client, session and acquisition engine.
#[derive(Error, Debug)]
pub enum XhError {
    /// Cannot resolve, connect, bind, listen or accept.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Unexpected response shape, lost prompt or wrong return type.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The server reported a failure (negative, null or NaN return).
    #[error("Device error: {0}")]
    Device(String),

    /// Invalid settings, rejected before any command is sent.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The control socket was closed by the peer.
    #[error("Connection to the Xh server was lost")]
    Disconnected,

    /// A command was issued without a live connection.
    #[error("Not connected to the Xh server")]
    NotConnected,

    /// Socket I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Host buffer manager rejected a frame.
    #[error(transparent)]
    Core(#[from] DaqError),
}

impl XhError {
    /// Whether this error leaves the control connection unusable.
    pub fn forces_disconnect(&self) -> bool {
        matches!(
            self,
            XhError::Connection(_) | XhError::Protocol(_) | XhError::Disconnected | XhError::Io(_)
        )
    }

    fn kind(&self) -> DriverErrorKind {
        match self {
            XhError::Connection(_) => DriverErrorKind::Initialization,
            XhError::Protocol(_)
            | XhError::Disconnected
            | XhError::NotConnected
            | XhError::Io(_) => DriverErrorKind::Communication,
            XhError::Device(_) => DriverErrorKind::Hardware,
            XhError::Configuration(_) => DriverErrorKind::Configuration,
            XhError::Core(_) => DriverErrorKind::Unknown,
        }
    }
}

impl From<XhError> for DaqError {
    fn from(err: XhError) -> Self {
        match err {
            XhError::Core(inner) => inner,
            XhError::Configuration(msg) => DaqError::Configuration(msg),
            other => DaqError::Driver(DriverError::new(DRIVER_TYPE, other.kind(), other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_errors_force_disconnect() {
        assert!(XhError::Protocol("unknown line".into()).forces_disconnect());
        assert!(XhError::Disconnected.forces_disconnect());
        assert!(!XhError::Device("bad handle".into()).forces_disconnect());
        assert!(!XhError::Configuration("groups".into()).forces_disconnect());
    }

    #[test]
    fn converts_to_driver_error() {
        let err: DaqError = XhError::Device("hv trip".into()).into();
        assert!(err.to_string().contains("Driver 'xh' hardware error"));

        let err: DaqError = XhError::Configuration("frames".into()).into();
        assert!(matches!(err, DaqError::Configuration(_)));
    }
}

//! Xh strip line-detector driver for rust-daq.
//!
//! The detector is controlled through the Xh server, a line-oriented TCP
//! service. Frame data comes back over a second TCP connection that the
//! server opens to a port advertised by the driver.
//!
//! Protocol Overview:
//! - Control: ASCII commands terminated by `\n`, one at a time
//! - Prompt: the server sends `>` when it is ready for the next command
//! - Replies: `* value` return, `! text` error, `# text` debug, `@ done total text` progress
//! - Data: raw big-endian samples over the data channel, one transfer per `read`
//!
//! # Layers
//!
//! - [`client`]: prompt/response exchange and the data channel
//! - [`session`]: every detector command, plus configuration mirrors
//! - [`acquisition`]: the worker task that moves frames into host buffers
//! - [`detector`]: `daq-core` capability traits over all of the above
//! - [`factory`]: config parsing and registration
//!
//! # Usage
//!
//! Add to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! daq-driver-xh = { path = "../daq-driver-xh" }
//! ```
//!
//! Register the factory with your device registry:
//!
//! ```rust,ignore
//! use daq_driver_xh::XhFactory;
//!
//! registry.register_factory(Box::new(XhFactory));
//! ```

pub mod acquisition;
pub mod client;
pub mod data_channel;
pub mod detector;
pub mod error;
pub mod factory;
pub mod hardware;
pub mod response;
pub mod session;
pub mod status;
pub mod timing;
pub mod transform;

pub use client::XhClient;
pub use detector::XhDetector;
pub use error::{XhError, XhResult};
pub use factory::{XhConfig, XhFactory};
pub use session::XhSession;
pub use status::{AcqState, XhStatus};
pub use timing::{TimingParameters, TriggerControl};

/// Force the linker to include this crate.
///
/// Call this function from main() to ensure the driver factory is linked
/// into the final binary and not stripped by the linker.
#[inline(never)]
pub fn link() {
    std::hint::black_box(std::any::TypeId::of::<XhFactory>());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_does_not_panic() {
        link();
    }
}

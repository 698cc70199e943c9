//! `daq-core`
//!
//! Core trait definitions and types shared by rust-daq detector drivers.
//!
//! ## Modules
//!
//! - [`capabilities`]: fine-grained async capability traits (`SyncControl`,
//!   `RoiControl`, `AcquisitionControl`, ...)
//! - [`driver`]: [`driver::DriverFactory`] plugin API and the
//!   [`driver::DeviceComponents`] capability bag
//! - [`buffer`]: host frame buffers lent to acquisition engines
//! - [`data`]: frames, geometry and frame metadata
//! - [`error`]: [`error::DaqError`], the host error type
//!
//! ## Example
//!
//! ```rust,no_run
//! use daq_core::buffer::SoftBufferManager;
//! use daq_core::data::{FrameDim, ImageType};
//!
//! let buffers = SoftBufferManager::new();
//! buffers.allocate(FrameDim::new(1024, 1, ImageType::Bpp32), 2)?;
//! # Ok::<(), daq_core::error::DaqError>(())
//! ```

pub mod buffer;
pub mod capabilities;
pub mod data;
pub mod driver;
pub mod error;

// Re-export commonly used types
pub use anyhow::{anyhow, Result};
pub use error::{AppResult, DaqError};

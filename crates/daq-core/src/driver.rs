//! Driver Factory and Component Types
//!
//! This module provides the plugin API for registered detector drivers.
//! Drivers implement [`DriverFactory`] and are registered with the host at
//! startup via explicit `registry.register_factory(factory)` calls.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Composition Root (main.rs)              │
//! │  registry.register_factory(XhFactory);                          │
//! └─────────────────────────────────────────────────────────────────┘
//!                                   │
//!                                   ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    DriverFactory::build()                       │
//! │  Parses TOML config, connects, returns capability trait objects │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example: Implementing a Driver Factory
//!
//! ```rust,ignore
//! use daq_core::driver::{DriverFactory, DeviceComponents, Capability};
//! use futures::future::BoxFuture;
//! use std::sync::Arc;
//!
//! pub struct LineDetectorFactory;
//!
//! impl DriverFactory for LineDetectorFactory {
//!     fn driver_type(&self) -> &'static str { "line_detector" }
//!     fn name(&self) -> &'static str { "Generic Line Detector" }
//!     fn capabilities(&self) -> &'static [Capability] { &[Capability::AcquisitionControl] }
//!
//!     fn validate(&self, config: &toml::Value) -> anyhow::Result<()> {
//!         let table = config.as_table().ok_or_else(|| anyhow::anyhow!("expected table"))?;
//!         if !table.contains_key("host") {
//!             anyhow::bail!("missing 'host' field");
//!         }
//!         Ok(())
//!     }
//!
//!     fn build(&self, config: toml::Value) -> BoxFuture<'static, anyhow::Result<DeviceComponents>> {
//!         Box::pin(async move {
//!             let driver = Arc::new(LineDetector::connect(config).await?);
//!             Ok(DeviceComponents::new().with_acquisition_control(driver))
//!         })
//!     }
//! }
//! ```

use crate::capabilities::{
    AcquisitionControl, BinControl, Commandable, DetectorInfo, DeviceCategory, ExposureControl,
    FrameProducer, RoiControl, SyncControl, Triggerable,
};
use anyhow::Result;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// =============================================================================
// Capability Enum (Runtime Introspection)
// =============================================================================

/// Runtime capability flags for device introspection.
///
/// Mirrors the capability traits as an enum for easy matching and listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Can be armed and triggered
    /// Corresponds to [`crate::capabilities::Triggerable`]
    Triggerable,

    /// Produces image frames
    /// Corresponds to [`crate::capabilities::FrameProducer`]
    FrameProducer,

    /// Has exposure/integration time control
    /// Corresponds to [`crate::capabilities::ExposureControl`]
    ExposureControl,

    /// Describes its geometry and pixel format
    /// Corresponds to [`crate::capabilities::DetectorInfo`]
    DetectorInfo,

    /// Negotiates trigger mode and frame counts
    /// Corresponds to [`crate::capabilities::SyncControl`]
    SyncControl,

    /// Supports a region of interest
    /// Corresponds to [`crate::capabilities::RoiControl`]
    RoiControl,

    /// Supports binning
    /// Corresponds to [`crate::capabilities::BinControl`]
    BinControl,

    /// Has a prepare/start/stop lifecycle
    /// Corresponds to [`crate::capabilities::AcquisitionControl`]
    AcquisitionControl,

    /// Can execute structured JSON commands
    /// Corresponds to [`crate::capabilities::Commandable`]
    Commandable,
}

impl Capability {
    /// Human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Triggerable => "Triggerable",
            Self::FrameProducer => "Frame Producer",
            Self::ExposureControl => "Exposure Control",
            Self::DetectorInfo => "Detector Info",
            Self::SyncControl => "Sync Control",
            Self::RoiControl => "ROI Control",
            Self::BinControl => "Bin Control",
            Self::AcquisitionControl => "Acquisition Control",
            Self::Commandable => "Commandable",
        }
    }
}

// =============================================================================
// Device Components (Capability Bag)
// =============================================================================

/// Container for capability trait objects returned by drivers.
///
/// # Builder Pattern
///
/// ```rust,ignore
/// let driver = Arc::new(MyDetector::new().await?);
///
/// let components = DeviceComponents::new()
///     .with_exposure_control(driver.clone())
///     .with_acquisition_control(driver);
/// ```
#[derive(Default)]
pub struct DeviceComponents {
    /// Device category for UI grouping
    pub category: Option<DeviceCategory>,

    /// Triggerable implementation (arm/trigger)
    pub triggerable: Option<Arc<dyn Triggerable>>,

    /// FrameProducer implementation (frame streaming)
    pub frame_producer: Option<Arc<dyn FrameProducer>>,

    /// ExposureControl implementation (exposure time)
    pub exposure_control: Option<Arc<dyn ExposureControl>>,

    /// DetectorInfo implementation (geometry, pixel format)
    pub detector_info: Option<Arc<dyn DetectorInfo>>,

    /// SyncControl implementation (trigger mode, frame count)
    pub sync_control: Option<Arc<dyn SyncControl>>,

    /// RoiControl implementation
    pub roi_control: Option<Arc<dyn RoiControl>>,

    /// BinControl implementation
    pub bin_control: Option<Arc<dyn BinControl>>,

    /// AcquisitionControl implementation (prepare/start/stop)
    pub acquisition_control: Option<Arc<dyn AcquisitionControl>>,

    /// Commandable implementation (structured commands)
    pub commandable: Option<Arc<dyn Commandable>>,
}

impl DeviceComponents {
    /// Create a new empty DeviceComponents
    pub fn new() -> Self {
        Self::default()
    }

    /// Get list of capabilities this device supports
    pub fn capabilities(&self) -> Vec<Capability> {
        let mut caps = Vec::new();

        if self.triggerable.is_some() {
            caps.push(Capability::Triggerable);
        }
        if self.frame_producer.is_some() {
            caps.push(Capability::FrameProducer);
        }
        if self.exposure_control.is_some() {
            caps.push(Capability::ExposureControl);
        }
        if self.detector_info.is_some() {
            caps.push(Capability::DetectorInfo);
        }
        if self.sync_control.is_some() {
            caps.push(Capability::SyncControl);
        }
        if self.roi_control.is_some() {
            caps.push(Capability::RoiControl);
        }
        if self.bin_control.is_some() {
            caps.push(Capability::BinControl);
        }
        if self.acquisition_control.is_some() {
            caps.push(Capability::AcquisitionControl);
        }
        if self.commandable.is_some() {
            caps.push(Capability::Commandable);
        }

        caps
    }

    // Builder methods

    /// Set device category
    pub fn with_category(mut self, category: DeviceCategory) -> Self {
        self.category = Some(category);
        self
    }

    /// Set Triggerable implementation
    pub fn with_triggerable(mut self, t: Arc<dyn Triggerable>) -> Self {
        self.triggerable = Some(t);
        self
    }

    /// Set FrameProducer implementation
    pub fn with_frame_producer(mut self, f: Arc<dyn FrameProducer>) -> Self {
        self.frame_producer = Some(f);
        self
    }

    /// Set ExposureControl implementation
    pub fn with_exposure_control(mut self, e: Arc<dyn ExposureControl>) -> Self {
        self.exposure_control = Some(e);
        self
    }

    /// Set DetectorInfo implementation
    pub fn with_detector_info(mut self, d: Arc<dyn DetectorInfo>) -> Self {
        self.detector_info = Some(d);
        self
    }

    /// Set SyncControl implementation
    pub fn with_sync_control(mut self, s: Arc<dyn SyncControl>) -> Self {
        self.sync_control = Some(s);
        self
    }

    /// Set RoiControl implementation
    pub fn with_roi_control(mut self, r: Arc<dyn RoiControl>) -> Self {
        self.roi_control = Some(r);
        self
    }

    /// Set BinControl implementation
    pub fn with_bin_control(mut self, b: Arc<dyn BinControl>) -> Self {
        self.bin_control = Some(b);
        self
    }

    /// Set AcquisitionControl implementation
    pub fn with_acquisition_control(mut self, a: Arc<dyn AcquisitionControl>) -> Self {
        self.acquisition_control = Some(a);
        self
    }

    /// Set Commandable implementation
    pub fn with_commandable(mut self, c: Arc<dyn Commandable>) -> Self {
        self.commandable = Some(c);
        self
    }
}

// =============================================================================
// Driver Factory Trait
// =============================================================================

/// Trait for driver factories that create device instances.
///
/// The factory is responsible for:
///
/// 1. Declaring what driver type it handles (matching TOML `type` field)
/// 2. Validating configuration before instantiation
/// 3. Asynchronously creating the driver and returning capabilities
///
/// # Thread Safety
///
/// The `build()` method takes `&self` and returns a `BoxFuture<'static, ...>`.
/// The factory must not hold mutable state across builds.
pub trait DriverFactory: Send + Sync + 'static {
    /// Driver type name used in TOML config `type` field.
    fn driver_type(&self) -> &'static str;

    /// Human-readable name for documentation and error messages.
    fn name(&self) -> &'static str;

    /// List of capabilities this driver type provides.
    fn capabilities(&self) -> &'static [Capability] {
        &[]
    }

    /// Validate configuration without instantiating.
    ///
    /// Called before `build()` to provide early error feedback.
    fn validate(&self, config: &toml::Value) -> Result<()>;

    /// Async instantiation of the driver.
    ///
    /// Opens connections to hardware and returns DeviceComponents with all
    /// implemented capabilities.
    fn build(&self, config: toml::Value) -> BoxFuture<'static, Result<DeviceComponents>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_name() {
        assert_eq!(Capability::RoiControl.name(), "ROI Control");
        assert_eq!(Capability::FrameProducer.name(), "Frame Producer");
    }

    #[test]
    fn test_device_components_capabilities() {
        let empty = DeviceComponents::new().with_category(DeviceCategory::Detector);
        assert!(empty.capabilities().is_empty());
        assert_eq!(empty.category, Some(DeviceCategory::Detector));
    }

    #[test]
    fn test_capability_serde() {
        let cap = Capability::AcquisitionControl;
        let json = serde_json::to_string(&cap).unwrap();
        assert_eq!(json, "\"acquisition_control\"");

        let cap: Capability = serde_json::from_str("\"bin_control\"").unwrap();
        assert_eq!(cap, Capability::BinControl);
    }
}

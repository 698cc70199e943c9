//! Driver registration for the Xh detector.
//!
//! # Usage
//!
//! ```rust,ignore
//! use daq_driver_xh::XhFactory;
//! use daq_core::driver::DriverFactory;
//!
//! registry.register_factory(Box::new(XhFactory));
//!
//! let config = toml::toml! {
//!     host = "xh-server.lab"
//!     port = 1972
//!     config_name = "config_xh"
//!     timing_scripts = ["timing_fast", "timing_slow"]
//! };
//! let components = factory.build(config.into()).await?;
//! ```

use crate::detector::XhDetector;
use crate::error::{XhError, XhResult};
use crate::session::XhSession;
use anyhow::{anyhow, Context, Result};
use daq_core::buffer::DEFAULT_NB_BUFFERS;
use daq_core::capabilities::DeviceCategory;
use daq_core::driver::{Capability, DeviceComponents, DriverFactory};
use futures::future::BoxFuture;
use serde::Deserialize;
use std::sync::Arc;

fn default_sys_name() -> String {
    "'xh0'".to_string()
}

fn default_clock_factor() -> f64 {
    20e-9
}

fn default_nb_buffers() -> usize {
    DEFAULT_NB_BUFFERS
}

/// Configuration for the Xh driver
#[derive(Debug, Clone, Deserialize)]
pub struct XhConfig {
    /// Host name of the Xh control server
    pub host: String,
    /// Control port of the server
    pub port: u16,
    /// Detector system name, quoted as the server expects it
    #[serde(default = "default_sys_name")]
    pub sys_name: String,
    /// Configuration script run at init (`~{name}`)
    #[serde(default)]
    pub config_name: Option<String>,
    /// Timing scripts that may be run
    #[serde(default)]
    pub timing_scripts: Vec<String>,
    /// Seconds per exposure cycle
    #[serde(default = "default_clock_factor")]
    pub clock_factor: f64,
    /// Interpret exposures as seconds instead of cycles
    #[serde(default)]
    pub time_mode: bool,
    /// Open the detector with head un-interleaving
    #[serde(default)]
    pub uninterleave: bool,
    /// Host frame slots
    #[serde(default = "default_nb_buffers")]
    pub nb_buffers: usize,
}

impl XhConfig {
    /// Config for `host:port` with every other field defaulted.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            sys_name: default_sys_name(),
            config_name: None,
            timing_scripts: Vec::new(),
            clock_factor: default_clock_factor(),
            time_mode: false,
            uninterleave: false,
            nb_buffers: default_nb_buffers(),
        }
    }

    /// Check values serde cannot.
    pub fn validate(&self) -> XhResult<()> {
        if self.host.trim().is_empty() {
            return Err(XhError::Configuration("host must not be empty".into()));
        }
        if self.port == 0 {
            return Err(XhError::Configuration("port must not be 0".into()));
        }
        if self.sys_name.trim().is_empty() {
            return Err(XhError::Configuration("sys_name must not be empty".into()));
        }
        if self.clock_factor.is_nan() || self.clock_factor <= 0.0 {
            return Err(XhError::Configuration(format!(
                "clock_factor must be positive, got {}",
                self.clock_factor
            )));
        }
        if self.nb_buffers == 0 {
            return Err(XhError::Configuration(
                "nb_buffers must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// XhFactory - DriverFactory implementation
// =============================================================================

/// Factory for creating Xh detector instances.
pub struct XhFactory;

/// Static capabilities for Xh
static XH_CAPABILITIES: &[Capability] = &[
    Capability::Triggerable,
    Capability::FrameProducer,
    Capability::ExposureControl,
    Capability::DetectorInfo,
    Capability::SyncControl,
    Capability::RoiControl,
    Capability::BinControl,
    Capability::AcquisitionControl,
    Capability::Commandable,
];

impl DriverFactory for XhFactory {
    fn driver_type(&self) -> &'static str {
        "xh"
    }

    fn name(&self) -> &'static str {
        "Xh Strip Detector"
    }

    fn capabilities(&self) -> &'static [Capability] {
        XH_CAPABILITIES
    }

    fn validate(&self, config: &toml::Value) -> Result<()> {
        let cfg: XhConfig = config.clone().try_into()?;
        cfg.validate().map_err(|e| anyhow!("Invalid Xh config: {}", e))
    }

    fn build(&self, config: toml::Value) -> BoxFuture<'static, Result<DeviceComponents>> {
        Box::pin(async move {
            let cfg: XhConfig = config.try_into().context("Invalid Xh config")?;
            cfg.validate().context("Invalid Xh config")?;

            let session = Arc::new(XhSession::new(cfg));
            session
                .init()
                .await
                .context("Failed to initialize Xh detector")?;
            let detector = Arc::new(XhDetector::new(session));
            tracing::info!(
                npixels = detector.session().npixels(),
                "Xh detector ready"
            );

            Ok(DeviceComponents {
                category: Some(DeviceCategory::Detector),
                triggerable: Some(detector.clone()),
                frame_producer: Some(detector.clone()),
                exposure_control: Some(detector.clone()),
                detector_info: Some(detector.clone()),
                sync_control: Some(detector.clone()),
                roi_control: Some(detector.clone()),
                bin_control: Some(detector.clone()),
                acquisition_control: Some(detector.clone()),
                commandable: Some(detector),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_metadata() {
        let factory = XhFactory;
        assert_eq!(factory.driver_type(), "xh");
        assert_eq!(factory.name(), "Xh Strip Detector");
        assert!(factory.capabilities().contains(&Capability::AcquisitionControl));
        assert!(factory.capabilities().contains(&Capability::Commandable));
    }

    #[test]
    fn config_defaults() {
        let config = toml::toml! {
            host = "localhost"
            port = 1972
        };
        let cfg: XhConfig = toml::Value::Table(config).try_into().unwrap();
        assert_eq!(cfg.sys_name, "'xh0'");
        assert_eq!(cfg.nb_buffers, DEFAULT_NB_BUFFERS);
        assert!((cfg.clock_factor - 20e-9).abs() < f64::EPSILON);
        assert!(cfg.config_name.is_none());
        assert!(!cfg.time_mode);
    }

    #[test]
    fn validate_rejects_bad_values() {
        let factory = XhFactory;

        let ok = toml::toml! {
            host = "localhost"
            port = 1972
            timing_scripts = ["fast"]
        };
        assert!(factory.validate(&toml::Value::Table(ok)).is_ok());

        let zero_port = toml::toml! {
            host = "localhost"
            port = 0
        };
        assert!(factory.validate(&toml::Value::Table(zero_port)).is_err());

        let no_buffers = toml::toml! {
            host = "localhost"
            port = 1972
            nb_buffers = 0
        };
        assert!(factory.validate(&toml::Value::Table(no_buffers)).is_err());

        let bad_clock = toml::toml! {
            host = "localhost"
            port = 1972
            clock_factor = -1.0
        };
        assert!(factory.validate(&toml::Value::Table(bad_clock)).is_err());

        let missing_host = toml::toml! {
            port = 1972
        };
        assert!(factory.validate(&toml::Value::Table(missing_host)).is_err());
    }
}

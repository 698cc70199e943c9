//! Atomic Hardware Capabilities
//!
//! This module defines fine-grained capability traits that detector drivers
//! implement. Instead of one monolithic `Camera` trait, a driver implements the
//! capabilities it actually supports:
//!
//! - A line detector might implement: `DetectorInfo + SyncControl + RoiControl + BinControl + AcquisitionControl`
//! - A free-running camera might implement: `ExposureControl + FrameProducer`
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait]) unless it only reads local state
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for errors
//! - Focuses on ONE thing
//!
//! # Example
//!
//! ```rust,ignore
//! async fn triggered_run<D>(detector: &D, frames: u32) -> Result<()>
//! where
//!     D: SyncControl + AcquisitionControl,
//! {
//!     detector.set_trigger_mode(TriggerMode::IntTrig).await?;
//!     detector.set_nb_frames(frames).await?;
//!     detector.prepare().await?;
//!     detector.start().await?;
//!     Ok(())
//! }
//! ```

use crate::data::{Bin, FrameDim, ImageType, Roi};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use crate::data::Frame;

// =============================================================================
// Device Category
// =============================================================================

/// Device category for classification and UI grouping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeviceCategory {
    /// Area cameras
    Camera,
    /// Line and point detectors
    Detector,
    /// Devices that don't fit other categories
    #[default]
    Other,
}

// =============================================================================
// Trigger and status types
// =============================================================================

/// Acquisition trigger mode requested by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    /// One software start acquires the whole sequence
    #[default]
    IntTrig,
    /// Each software trigger acquires one frame
    IntTrigMult,
    /// Hardware triggers every frame of a started sequence
    ExtTrigSingle,
    /// Each hardware trigger acquires one frame
    ExtTrigMult,
    /// Hardware gate controls exposure
    ExtGate,
}

/// Host-level acquisition status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AcqStatus {
    /// Ready for a new acquisition
    Ready,
    /// Acquisition in progress
    Running,
    /// Acquisition aborted on an error
    Fault,
}

/// Detector-level activity while acquiring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DetStatus {
    /// Not doing anything
    Idle,
    /// Integrating
    Exposure,
    /// Transferring data
    Readout,
    /// Armed, waiting for a trigger
    WaitForTrigger,
    /// Device reported a failure
    Fault,
}

/// Combined status returned by [`AcquisitionControl::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HwStatus {
    /// Host-level state
    pub acq: AcqStatus,
    /// Detector activity
    pub det: DetStatus,
}

impl HwStatus {
    /// Build a status pair.
    pub fn new(acq: AcqStatus, det: DetStatus) -> Self {
        Self { acq, det }
    }
}

// =============================================================================
// Capability traits
// =============================================================================

/// Capability: Trigger Control
///
/// # Contract
/// - `arm()` prepares device for trigger (may program hardware sequences)
/// - `trigger()` initiates acquisition of the next frame
/// - Calling `trigger()` on unarmed device should return Err
#[async_trait]
pub trait Triggerable: Send + Sync {
    /// Arm device for trigger
    ///
    /// # Returns
    /// - Ok(()) if armed successfully
    /// - Err if device is busy or in error state
    async fn arm(&self) -> Result<()>;

    /// Send software trigger
    ///
    /// # Returns
    /// - Ok(()) if trigger accepted
    /// - Err if not armed or hardware error
    async fn trigger(&self) -> Result<()>;

    /// Check if device is currently armed
    ///
    /// # Default Implementation
    /// Returns an error indicating state query is not supported.
    async fn is_armed(&self) -> Result<bool> {
        anyhow::bail!("Armed state query not supported by this device")
    }
}

/// Capability: Exposure Time Control
///
/// # Contract
/// - Exposure is in seconds (not milliseconds)
/// - Setting exposure does not start acquisition
/// - Exposure applies to next acquisition
#[async_trait]
pub trait ExposureControl: Send + Sync {
    /// Set exposure/integration time
    ///
    /// # Returns
    /// - Err if value is out of hardware range
    async fn set_exposure(&self, seconds: f64) -> Result<()>;

    /// Get current exposure setting in seconds
    async fn get_exposure(&self) -> Result<f64>;
}

/// Capability: Frame Streaming
///
/// Devices that push frames into a host buffer and broadcast them.
#[async_trait]
pub trait FrameProducer: Send + Sync {
    /// Start continuous frame acquisition
    ///
    /// # Returns
    /// - Err if already streaming or hardware error
    async fn start_stream(&self) -> Result<()>;

    /// Start finite frame acquisition with a maximum frame count
    ///
    /// `Some(0)` or `None` means continuous acquisition.
    ///
    /// # Default Implementation
    /// Calls `start_stream()`. Drivers that support finite acquisition
    /// should override this method.
    async fn start_stream_finite(&self, frame_limit: Option<u32>) -> Result<()> {
        match frame_limit {
            Some(n) if n > 0 => {
                tracing::warn!(
                    "Device does not support finite acquisition; starting continuous stream \
                     (requested {} frames)",
                    n
                );
                self.start_stream().await
            }
            _ => self.start_stream().await,
        }
    }

    /// Stop frame acquisition
    async fn stop_stream(&self) -> Result<()>;

    /// Get frame resolution (width, height) in pixels
    fn resolution(&self) -> (u32, u32);

    /// Subscribe to published frames
    ///
    /// # Returns
    /// - Some(receiver) if the device broadcasts frames
    /// - None if streaming subscriptions are not supported
    async fn subscribe_frames(
        &self,
    ) -> Option<tokio::sync::broadcast::Receiver<std::sync::Arc<crate::data::Frame>>> {
        None
    }

    /// Check if device is currently streaming frames
    ///
    /// # Default Implementation
    /// Returns an error indicating state query is not supported.
    async fn is_streaming(&self) -> Result<bool> {
        anyhow::bail!("Streaming state query not supported by this device")
    }

    /// Get the number of frames captured since streaming started
    fn frame_count(&self) -> u64 {
        0
    }
}

/// Capability: Detector Description
///
/// Static detector information plus the pixel format, which some detectors
/// can switch at runtime.
#[async_trait]
pub trait DetectorInfo: Send + Sync {
    /// Short detector family name (e.g. "xh")
    fn detector_type(&self) -> String;

    /// Detector model string
    fn detector_model(&self) -> String;

    /// Maximum image geometry in pixels
    fn max_image_size(&self) -> FrameDim;

    /// Physical pixel size (x, y) in meters
    fn pixel_size(&self) -> (f64, f64) {
        (1.0, 1.0)
    }

    /// Current pixel format
    fn image_type(&self) -> ImageType;

    /// Switch pixel format
    async fn set_image_type(&self, image_type: ImageType) -> Result<()>;
}

/// Capability: Synchronisation
///
/// Trigger mode, frame count and timing ranges negotiated before an
/// acquisition.
#[async_trait]
pub trait SyncControl: Send + Sync {
    /// Whether the detector accepts the given trigger mode
    fn check_trigger_mode(&self, mode: TriggerMode) -> bool;

    /// Select trigger mode
    async fn set_trigger_mode(&self, mode: TriggerMode) -> Result<()>;

    /// Current trigger mode
    fn trigger_mode(&self) -> TriggerMode;

    /// Number of frames for the next acquisition (0 = continuous)
    async fn set_nb_frames(&self, nb_frames: u32) -> Result<()>;

    /// Number of frames requested
    fn nb_frames(&self) -> u32;

    /// Latency time between frames in seconds
    async fn set_latency(&self, seconds: f64) -> Result<()>;

    /// Current latency time in seconds
    fn latency(&self) -> f64;

    /// Valid exposure range (min, max) in seconds
    fn exposure_range(&self) -> (f64, f64);

    /// Valid latency range (min, max) in seconds
    fn latency_range(&self) -> (f64, f64);
}

/// Capability: Region of Interest
#[async_trait]
pub trait RoiControl: Send + Sync {
    /// Return the ROI the hardware would actually apply for `requested`
    fn check_roi(&self, requested: Roi) -> Result<Roi>;

    /// Apply a ROI
    async fn set_roi(&self, roi: Roi) -> Result<()>;

    /// Current ROI
    fn roi(&self) -> Roi;
}

/// Capability: Binning
#[async_trait]
pub trait BinControl: Send + Sync {
    /// Return the binning the hardware would actually apply for `requested`
    fn check_bin(&self, requested: Bin) -> Bin;

    /// Apply binning
    async fn set_bin(&self, bin: Bin) -> Result<()>;

    /// Current binning
    fn bin(&self) -> Bin;
}

/// Capability: Acquisition Lifecycle
///
/// # Contract
/// - `prepare()` validates settings and programs the hardware
/// - `start()` begins acquiring into the host buffers
/// - `stop()` blocks until the device has stopped producing frames
#[async_trait]
pub trait AcquisitionControl: Send + Sync {
    /// Validate and program the next acquisition
    async fn prepare(&self) -> Result<()>;

    /// Start the acquisition
    async fn start(&self) -> Result<()>;

    /// Stop the acquisition
    async fn stop(&self) -> Result<()>;

    /// Query detector state
    async fn status(&self) -> Result<HwStatus>;

    /// Frames acquired by the current or last acquisition
    fn acquired_frames(&self) -> u64;
}

/// Capability: Structured Commands
///
/// Devices that can execute specialized commands with structured arguments.
///
/// # Contract
/// - `execute_command()` takes a command name and JSON arguments.
/// - Returns a JSON object with results.
#[async_trait]
pub trait Commandable: Send + Sync {
    /// Execute a specialized command
    ///
    /// # Returns
    /// - Ok(JSON object) with results
    /// - Err if command unknown or execution failed
    async fn execute_command(
        &self,
        command: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value>;
}

#[cfg(test)]
#[allow(clippy::float_cmp)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct MockDetector {
        exposure: Mutex<f64>,
        roi: Mutex<Roi>,
    }

    #[async_trait]
    impl ExposureControl for MockDetector {
        async fn set_exposure(&self, seconds: f64) -> Result<()> {
            *self.exposure.lock().unwrap() = seconds;
            Ok(())
        }

        async fn get_exposure(&self) -> Result<f64> {
            Ok(*self.exposure.lock().unwrap())
        }
    }

    #[async_trait]
    impl RoiControl for MockDetector {
        fn check_roi(&self, requested: Roi) -> Result<Roi> {
            Ok(Roi::new(requested.x, 0, requested.width, 0))
        }

        async fn set_roi(&self, roi: Roi) -> Result<()> {
            *self.roi.lock().unwrap() = self.check_roi(roi)?;
            Ok(())
        }

        fn roi(&self) -> Roi {
            *self.roi.lock().unwrap()
        }
    }

    #[tokio::test]
    async fn test_exposure_trait() {
        let det = MockDetector {
            exposure: Mutex::new(0.0),
            roi: Mutex::new(Roi::default()),
        };
        det.set_exposure(0.25).await.unwrap();
        assert_eq!(det.get_exposure().await.unwrap(), 0.25);
    }

    #[tokio::test]
    async fn test_roi_trait_uses_checked_value() {
        let det = MockDetector {
            exposure: Mutex::new(0.0),
            roi: Mutex::new(Roi::default()),
        };
        det.set_roi(Roi::new(10, 3, 100, 5)).await.unwrap();
        assert_eq!(det.roi(), Roi::new(10, 0, 100, 0));
    }

    #[test]
    fn trigger_mode_serde() {
        let json = serde_json::to_string(&TriggerMode::IntTrigMult).unwrap();
        assert_eq!(json, "\"int_trig_mult\"");
    }
}

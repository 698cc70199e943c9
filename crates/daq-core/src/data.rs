//! Frame and geometry types exchanged between drivers and the host.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Pixel storage format of a detector image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ImageType {
    /// 16-bit unsigned samples
    Bpp16,
    /// 32-bit unsigned samples
    #[default]
    Bpp32,
}

impl ImageType {
    /// Bytes used by one sample.
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            ImageType::Bpp16 => 2,
            ImageType::Bpp32 => 4,
        }
    }

    /// Bits per sample.
    pub fn bit_depth(self) -> u32 {
        (self.bytes_per_pixel() * 8) as u32
    }
}

/// Image dimensions plus pixel format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameDim {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Pixel format
    pub image_type: ImageType,
}

impl FrameDim {
    /// Create a frame geometry.
    pub fn new(width: u32, height: u32, image_type: ImageType) -> Self {
        Self {
            width,
            height,
            image_type,
        }
    }

    /// Size in bytes of one frame with this geometry.
    pub fn frame_bytes(&self) -> usize {
        self.width as usize * self.height as usize * self.image_type.bytes_per_pixel()
    }
}

/// Region of interest, in detector pixels.
///
/// A zero `width` means "full width".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct Roi {
    /// X-coordinate of top-left corner in pixels
    pub x: u32,
    /// Y-coordinate of top-left corner in pixels
    pub y: u32,
    /// Width of ROI in pixels
    pub width: u32,
    /// Height of ROI in pixels
    pub height: u32,
}

impl Roi {
    /// Create a region of interest.
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// True when the ROI selects the full image.
    pub fn is_full(&self) -> bool {
        self.x == 0 && self.width == 0
    }
}

/// Binning factors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Bin {
    /// Horizontal factor
    pub x: u32,
    /// Vertical factor
    pub y: u32,
}

impl Bin {
    /// Create binning factors.
    pub fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }
}

impl Default for Bin {
    fn default() -> Self {
        Self { x: 1, y: 1 }
    }
}

/// Metadata attached to a frame handed to the buffer manager.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameInfo {
    /// Zero-based acquisition frame number
    pub acq_frame_nb: u64,
    /// Time the frame was published
    pub timestamp: DateTime<Utc>,
}

impl FrameInfo {
    /// Frame info stamped with the current time.
    pub fn now(acq_frame_nb: u64) -> Self {
        Self {
            acq_frame_nb,
            timestamp: Utc::now(),
        }
    }
}

/// Represents a single image frame.
///
/// # Storage
/// Data is stored as a raw byte vector (`Vec<u8>`), little endian.
/// - 16-bit images: 2 bytes per pixel.
/// - 32-bit images: 4 bytes per pixel.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Acquisition frame number
    pub frame_nb: u64,

    /// Width in pixels
    pub width: u32,

    /// Height in pixels
    pub height: u32,

    /// Bits per pixel (16 or 32)
    pub bit_depth: u32,

    /// Raw pixel data
    pub data: Vec<u8>,
}

impl Frame {
    /// Create a frame from raw byte data with explicit bit depth.
    ///
    /// The caller must ensure the buffer length matches the expected size for the bit depth.
    pub fn from_bytes(frame_nb: u64, width: u32, height: u32, bit_depth: u32, data: Vec<u8>) -> Self {
        Self {
            frame_nb,
            width,
            height,
            bit_depth,
            data,
        }
    }

    /// Get pixel value at (x, y) as u32 (handling bit depth conversion).
    pub fn get(&self, x: u32, y: u32) -> Option<u32> {
        if x >= self.width || y >= self.height {
            return None;
        }

        let idx = (y * self.width + x) as usize;

        match self.bit_depth {
            16 => {
                let start = idx * 2;
                let bytes = self.data.get(start..start + 2)?;
                Some(u16::from_le_bytes([bytes[0], bytes[1]]) as u32)
            }
            32 => {
                let start = idx * 4;
                let bytes = self.data.get(start..start + 4)?;
                Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
            }
            _ => None,
        }
    }

    /// All samples of the frame widened to u32.
    pub fn samples(&self) -> Vec<u32> {
        match self.bit_depth {
            16 => self
                .data
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]) as u32)
                .collect(),
            32 => self
                .data
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
            _ => Vec::new(),
        }
    }
}

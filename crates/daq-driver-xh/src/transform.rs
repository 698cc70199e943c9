//! Frame transforms applied between the data channel and the host buffer.
//!
//! Samples arrive big endian, one full detector line per frame. Each frame is
//! rescaled by the accumulation count, cropped to the ROI, binned
//! horizontally and written little endian into the host slot.

use daq_core::data::{FrameDim, ImageType};

/// Geometry and scaling of one acquisition, captured when it is prepared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {
    /// Sample format on the wire and in the host buffer
    pub image_type: ImageType,
    /// Samples per detector frame
    pub npixels: u32,
    /// First ROI column
    pub roi_x: u32,
    /// ROI width, 0 for the full line
    pub roi_width: u32,
    /// Horizontal binning factor
    pub bin_x: u32,
    /// Number of accumulated frames each sample is divided by
    pub accumulation: u32,
}

impl FrameLayout {
    /// Bytes of one frame as sent by the server.
    pub fn wire_bytes(&self) -> usize {
        self.npixels as usize * self.image_type.bytes_per_pixel()
    }

    fn roi_span(&self) -> (usize, usize) {
        let npixels = self.npixels as usize;
        let start = (self.roi_x as usize).min(npixels);
        let available = npixels - start;
        let width = match self.roi_width as usize {
            0 => available,
            w => w.min(available),
        };
        (start, width)
    }

    fn bin(&self) -> usize {
        self.bin_x.max(1) as usize
    }

    /// Width of a transformed frame.
    pub fn output_width(&self) -> u32 {
        let (_, width) = self.roi_span();
        (width / self.bin()) as u32
    }

    /// Host buffer geometry for this layout.
    pub fn frame_dim(&self) -> FrameDim {
        FrameDim::new(self.output_width(), 1, self.image_type)
    }

    /// Transform one wire frame into a host slot.
    ///
    /// `wire` must hold [`wire_bytes`](Self::wire_bytes) bytes. Only the first
    /// `output_width` samples of `slot` are written.
    pub fn transform(&self, wire: &[u8], slot: &mut [u8]) {
        let bpp = self.image_type.bytes_per_pixel();
        let divisor = u64::from(self.accumulation.max(1));
        let (start, width) = self.roi_span();
        let bin = self.bin();

        let samples = wire
            .chunks_exact(bpp)
            .skip(start)
            .take(width)
            .map(|raw| decode_be(raw) / divisor);

        let mut out = slot.chunks_exact_mut(bpp);
        let mut sum = 0u64;
        for (i, sample) in samples.enumerate() {
            sum += sample;
            if (i + 1) % bin != 0 {
                continue;
            }
            match out.next() {
                Some(dst) => encode_le(sum, dst),
                None => break,
            }
            sum = 0;
        }
    }
}

fn decode_be(raw: &[u8]) -> u64 {
    raw.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
}

fn encode_le(value: u64, dst: &mut [u8]) {
    match dst.len() {
        2 => dst.copy_from_slice(&(value.min(u64::from(u16::MAX)) as u16).to_le_bytes()),
        _ => dst.copy_from_slice(&(value.min(u64::from(u32::MAX)) as u32).to_le_bytes()),
    }
}

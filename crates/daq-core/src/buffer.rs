//! Host frame buffers.
//!
//! Drivers never own frame memory. They borrow one slot at a time through
//! [`BufferManager::fill_frame`], write the transformed pixels into it and
//! then announce the frame with [`BufferManager::new_frame_ready`]. The slot
//! reference is only valid for the duration of the fill callback.
//!
//! [`SoftBufferManager`] is the in-memory implementation used by the host: a
//! small ring of slots plus a broadcast channel that republishes every ready
//! frame as an `Arc<Frame>`.

use crate::data::{Frame, FrameDim, FrameInfo};
use crate::error::{AppResult, DaqError};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Default number of slots in the ring
pub const DEFAULT_NB_BUFFERS: usize = 2;

/// Broadcast channel depth for ready frames
const FRAME_CHANNEL_CAPACITY: usize = 64;

/// Host-side frame buffer manager consumed by acquisition engines.
pub trait BufferManager: Send + Sync {
    /// Geometry of the allocated slots, if any.
    fn frame_dim(&self) -> Option<FrameDim>;

    /// Record the acquisition start time.
    fn set_start_timestamp(&self, timestamp: DateTime<Utc>);

    /// Lend the slot for `frame_nb` to `fill`.
    ///
    /// The slot is exactly `frame_dim().frame_bytes()` long.
    fn fill_frame(&self, frame_nb: u64, fill: &mut dyn FnMut(&mut [u8])) -> AppResult<()>;

    /// Announce that the slot for `info.acq_frame_nb` holds a complete frame.
    ///
    /// Returns `false` when the producer must stop delivering frames.
    fn new_frame_ready(&self, info: &FrameInfo) -> bool;
}

struct Slots {
    dim: Option<FrameDim>,
    buffers: Vec<Vec<u8>>,
    start_timestamp: Option<DateTime<Utc>>,
}

/// Ring of in-memory frame slots with a frame broadcast.
pub struct SoftBufferManager {
    slots: Mutex<Slots>,
    frame_tx: broadcast::Sender<Arc<Frame>>,
    frames_ready: AtomicU64,
    /// Stop after this many frames (0 = unlimited)
    frame_limit: AtomicU64,
}

impl Default for SoftBufferManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftBufferManager {
    /// Create an empty manager; call [`allocate`](Self::allocate) before use.
    pub fn new() -> Self {
        let (frame_tx, _) = broadcast::channel(FRAME_CHANNEL_CAPACITY);
        Self {
            slots: Mutex::new(Slots {
                dim: None,
                buffers: Vec::new(),
                start_timestamp: None,
            }),
            frame_tx,
            frames_ready: AtomicU64::new(0),
            frame_limit: AtomicU64::new(0),
        }
    }

    /// (Re)allocate `nb_buffers` slots of geometry `dim` and reset counters.
    pub fn allocate(&self, dim: FrameDim, nb_buffers: usize) -> AppResult<()> {
        if nb_buffers == 0 {
            return Err(DaqError::Configuration(
                "at least one frame buffer is required".into(),
            ));
        }
        let mut slots = self.slots.lock();
        slots.dim = Some(dim);
        slots.buffers = vec![vec![0u8; dim.frame_bytes()]; nb_buffers];
        self.frames_ready.store(0, Ordering::SeqCst);
        tracing::debug!(
            width = dim.width,
            height = dim.height,
            nb_buffers,
            "frame buffers allocated"
        );
        Ok(())
    }

    /// Make `new_frame_ready` return false once `limit` frames are ready.
    pub fn set_frame_limit(&self, limit: u64) {
        self.frame_limit.store(limit, Ordering::SeqCst);
    }

    /// Number of frames announced since the last allocation.
    pub fn frames_ready(&self) -> u64 {
        self.frames_ready.load(Ordering::SeqCst)
    }

    /// Acquisition start time, if one was recorded.
    pub fn start_timestamp(&self) -> Option<DateTime<Utc>> {
        self.slots.lock().start_timestamp
    }

    /// Subscribe to ready frames.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Frame>> {
        self.frame_tx.subscribe()
    }

    /// Copy of the slot currently holding `frame_nb`.
    pub fn frame(&self, frame_nb: u64) -> Option<Frame> {
        let slots = self.slots.lock();
        let dim = slots.dim?;
        let idx = slot_index(frame_nb, slots.buffers.len())?;
        Some(Frame::from_bytes(
            frame_nb,
            dim.width,
            dim.height,
            dim.image_type.bit_depth(),
            slots.buffers[idx].clone(),
        ))
    }
}

fn slot_index(frame_nb: u64, nb_buffers: usize) -> Option<usize> {
    if nb_buffers == 0 {
        return None;
    }
    Some((frame_nb % nb_buffers as u64) as usize)
}

impl BufferManager for SoftBufferManager {
    fn frame_dim(&self) -> Option<FrameDim> {
        self.slots.lock().dim
    }

    fn set_start_timestamp(&self, timestamp: DateTime<Utc>) {
        self.slots.lock().start_timestamp = Some(timestamp);
    }

    fn fill_frame(&self, frame_nb: u64, fill: &mut dyn FnMut(&mut [u8])) -> AppResult<()> {
        let mut slots = self.slots.lock();
        let idx = slot_index(frame_nb, slots.buffers.len()).ok_or(DaqError::BufferNotAllocated)?;
        fill(&mut slots.buffers[idx]);
        Ok(())
    }

    fn new_frame_ready(&self, info: &FrameInfo) -> bool {
        if let Some(frame) = self.frame(info.acq_frame_nb) {
            // No subscribers is not an error
            let _ = self.frame_tx.send(Arc::new(frame));
        }
        let ready = self.frames_ready.fetch_add(1, Ordering::SeqCst) + 1;
        let limit = self.frame_limit.load(Ordering::SeqCst);

        limit == 0 || ready < limit
    }
}

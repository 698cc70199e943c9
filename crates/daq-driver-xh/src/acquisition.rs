//! Acquisition engine.
//!
//! A single worker task polls the timing generator, reads completed frames
//! through the data channel in batches, transforms them and hands them to the
//! host [`BufferManager`]. The worker is spawned once and parked between runs;
//! the foreground drives it through [`RunControl`].
//!
//! ```text
//!            start()                      target reached / stop()
//!  Waiting ──────────▶ Running ──────────────────────────────▶ Waiting
//!     │
//!     └── quit() ──▶ Exited
//! ```
//!
//! Both the run command and the worker state are `tokio::sync::watch`
//! channels, so a waiter never misses a transition.

use crate::error::{XhError, XhResult};
use crate::status::{AcqState, XhStatus};
use crate::transform::FrameLayout;
use async_trait::async_trait;
use daq_core::buffer::BufferManager;
use daq_core::capabilities::TriggerMode;
use daq_core::data::FrameInfo;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Poll interval while no new frame is available
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Command issued by the foreground.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunCommand {
    /// Stay parked
    Wait,
    /// Acquire
    Run,
    /// Exit the worker
    Quit,
}

/// State reported by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Parked, waiting for a run command
    Waiting,
    /// Inside the acquisition loop
    Running,
    /// Task finished
    Exited,
}

/// Hardware operations the worker needs.
#[async_trait]
pub trait AcquisitionDevice: Send + Sync {
    /// Poll the timing generator.
    async fn read_status(&self) -> XhResult<XhStatus>;

    /// Read `count` frames starting at `first`, concatenated in wire format.
    async fn read_frames(&self, first: u64, count: u64) -> XhResult<Vec<u8>>;

    /// Stop the timing generator.
    async fn stop_timing(&self) -> XhResult<()>;

    /// Geometry and scaling of the prepared acquisition.
    fn layout(&self) -> FrameLayout;

    /// Trigger mode of the prepared acquisition.
    fn trigger_mode(&self) -> TriggerMode;

    /// Frames to collect before the run ends, 0 for unbounded.
    fn frames_to_collect(&self) -> u64;
}

/// Shared state between the foreground and the worker.
pub struct RunControl {
    command: watch::Sender<RunCommand>,
    state: watch::Sender<WorkerState>,
    acquired: AtomicU64,
    software_trigger: AtomicBool,
    fault: Mutex<Option<String>>,
}

impl Default for RunControl {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RunControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunControl")
            .field("command", &self.command())
            .field("state", &self.worker_state())
            .field("acquired", &self.acquired())
            .finish()
    }
}

impl RunControl {
    /// Parked run control.
    pub fn new() -> Self {
        let (command, _) = watch::channel(RunCommand::Wait);
        let (state, _) = watch::channel(WorkerState::Waiting);
        Self {
            command,
            state,
            acquired: AtomicU64::new(0),
            software_trigger: AtomicBool::new(false),
            fault: Mutex::new(None),
        }
    }

    /// Current command.
    pub fn command(&self) -> RunCommand {
        *self.command.borrow()
    }

    /// Current worker state.
    pub fn worker_state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Frames published in the current run.
    pub fn acquired(&self) -> u64 {
        self.acquired.load(Ordering::SeqCst)
    }

    /// Reset the frame counter before a new acquisition.
    pub fn reset_acquired(&self) {
        self.acquired.store(0, Ordering::SeqCst);
    }

    /// Arm the one-shot software trigger.
    pub fn arm_software_trigger(&self) {
        self.software_trigger.store(true, Ordering::SeqCst);
    }

    /// Whether the software trigger is armed and not yet consumed.
    pub fn software_trigger_armed(&self) -> bool {
        self.software_trigger.load(Ordering::SeqCst)
    }

    /// Last fault recorded by the worker.
    pub fn fault(&self) -> Option<String> {
        self.fault.lock().clone()
    }

    /// Forget the last fault.
    pub fn clear_fault(&self) {
        *self.fault.lock() = None;
    }

    /// Release the worker into a run.
    ///
    /// With `wait_running`, return only once the worker is inside the loop,
    /// or has already finished the run.
    pub async fn start(&self, wait_running: bool) -> XhResult<()> {
        match self.command() {
            RunCommand::Quit => {
                return Err(XhError::Configuration(
                    "acquisition worker has exited".into(),
                ))
            }
            RunCommand::Run => {
                tracing::warn!("acquisition already running");
                return Ok(());
            }
            RunCommand::Wait => {}
        }

        // Let a previous run finish its tail before reusing the command
        let mut state_rx = self.state.subscribe();
        let _ = state_rx.wait_for(|s| *s != WorkerState::Running).await;

        self.command.send_replace(RunCommand::Run);
        if wait_running {
            let _ = state_rx
                .wait_for(|s| *s == WorkerState::Running || self.command() != RunCommand::Run)
                .await;
        }
        Ok(())
    }

    /// Ask the worker to leave the loop and wait until it has.
    ///
    /// No-op when no run is in progress.
    pub async fn stop(&self) {
        let requested = self.command.send_if_modified(|cmd| {
            if *cmd == RunCommand::Run {
                *cmd = RunCommand::Wait;
                true
            } else {
                false
            }
        });
        if !requested {
            return;
        }
        let mut state_rx = self.state.subscribe();
        let _ = state_rx.wait_for(|s| *s != WorkerState::Running).await;
    }

    /// Wait until the current run is over.
    pub async fn wait_finished(&self) {
        let mut state_rx = self.state.subscribe();
        let _ = state_rx
            .wait_for(|s| *s != WorkerState::Running && self.command() != RunCommand::Run)
            .await;
    }

    /// Ask the worker to exit without waiting.
    pub fn request_quit(&self) {
        self.command.send_replace(RunCommand::Quit);
    }

    /// Ask the worker to exit and wait for it.
    pub async fn quit(&self) {
        self.request_quit();
        let mut state_rx = self.state.subscribe();
        let _ = state_rx.wait_for(|s| *s == WorkerState::Exited).await;
    }

    fn consume_software_trigger(&self) {
        self.software_trigger.store(false, Ordering::SeqCst);
    }

    fn stop_requested(&self) -> bool {
        self.command() != RunCommand::Run
    }

    /// Run -> Wait, leaving Quit untouched.
    fn request_wait(&self) {
        self.command.send_if_modified(|cmd| {
            if *cmd == RunCommand::Run {
                *cmd = RunCommand::Wait;
                true
            } else {
                false
            }
        });
    }

    fn set_fault(&self, message: String) {
        *self.fault.lock() = Some(message);
    }
}

/// Spawn the acquisition worker.
pub fn spawn_worker<D>(
    device: Arc<D>,
    control: Arc<RunControl>,
    buffers: Arc<dyn BufferManager>,
) -> JoinHandle<()>
where
    D: AcquisitionDevice + ?Sized + 'static,
{
    tokio::spawn(async move { worker_loop(device, control, buffers).await })
}

async fn worker_loop<D>(device: Arc<D>, control: Arc<RunControl>, buffers: Arc<dyn BufferManager>)
where
    D: AcquisitionDevice + ?Sized,
{
    let mut command_rx = control.command.subscribe();
    loop {
        control.state.send_replace(WorkerState::Waiting);
        let command = match command_rx.wait_for(|c| *c != RunCommand::Wait).await {
            Ok(command) => *command,
            Err(_) => break,
        };
        if command == RunCommand::Quit {
            break;
        }

        control.state.send_replace(WorkerState::Running);
        tracing::debug!("acquisition worker running");

        if let Err(err) = run_acquisition(device.as_ref(), &control, buffers.as_ref()).await {
            tracing::error!(error = %err, acquired = control.acquired(), "acquisition failed");
            control.set_fault(err.to_string());
        }
        control.request_wait();
        tracing::debug!(acquired = control.acquired(), "acquisition worker parked");
    }
    control.state.send_replace(WorkerState::Exited);
}

async fn run_acquisition<D>(
    device: &D,
    control: &RunControl,
    buffers: &dyn BufferManager,
) -> XhResult<()>
where
    D: AcquisitionDevice + ?Sized,
{
    let mode = device.trigger_mode();
    let target = device.frames_to_collect();
    let layout = device.layout();
    let wire_bytes = layout.wire_bytes();
    if wire_bytes == 0 {
        return Err(XhError::Configuration("detector reports no pixels".into()));
    }

    let mut stopped = false;
    let result = async {
        let mut keep_going = true;
        while keep_going && (target == 0 || control.acquired() < target) {
            // Frames of the batch already read are published before this check
            if control.stop_requested() {
                device.stop_timing().await?;
                stopped = true;
                break;
            }
            if mode == TriggerMode::IntTrigMult && !control.software_trigger_armed() {
                control.request_wait();
                break;
            }

            let status = device.read_status().await?;
            let acquired = control.acquired();
            let completed = u64::from(status.completed_frames);
            let idle = status.state == AcqState::Idle;

            let mut pending = if idle && target != 0 {
                target.saturating_sub(acquired)
            } else {
                completed.saturating_sub(acquired)
            };
            if mode == TriggerMode::IntTrigMult {
                pending = 1;
            }

            if idle || completed > acquired {
                if pending == 0 {
                    // Generator finished with nothing left to read
                    break;
                }
                if mode == TriggerMode::IntTrigMult {
                    control.consume_software_trigger();
                }
                let data = device.read_frames(acquired, pending).await?;
                for wire in data.chunks_exact(wire_bytes).take(pending as usize) {
                    let frame_nb = control.acquired();
                    buffers.fill_frame(frame_nb, &mut |slot: &mut [u8]| {
                        layout.transform(wire, slot)
                    })?;
                    let more = buffers.new_frame_ready(&FrameInfo::now(frame_nb));
                    control.acquired.fetch_add(1, Ordering::SeqCst);
                    tracing::trace!(frame_nb, "frame published");
                    if !more {
                        keep_going = false;
                        break;
                    }
                }
            } else {
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        }
        Ok::<(), XhError>(())
    }
    .await;

    if mode == TriggerMode::IntTrigMult && !stopped {
        if let Err(err) = device.stop_timing().await {
            tracing::warn!(error = %err, "timing stop after software-triggered frame failed");
            return result.and(Err(err));
        }
    }
    result
}

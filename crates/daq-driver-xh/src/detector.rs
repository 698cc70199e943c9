//! Capability façade for the Xh detector.
//!
//! [`XhDetector`] ties a [`XhSession`] to the acquisition worker and the host
//! frame buffers, and exposes the result through the `daq-core` capability
//! traits. One detector owns exactly one worker task, spawned on
//! construction and told to quit when the detector is dropped.

use crate::acquisition::{spawn_worker, RunControl, WorkerState};
use crate::error::XhResult;
use crate::hardware::{ClockMode, ClockOptions, HeadVoltage, HvMode, HvMonitor, HvSign, TriggerOutput};
use crate::session::{TriggerLevel, XhSession};
use crate::status::AcqState;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use daq_core::buffer::{BufferManager, SoftBufferManager};
use daq_core::capabilities::{
    AcqStatus, AcquisitionControl, BinControl, Commandable, DetStatus, DetectorInfo,
    ExposureControl, FrameProducer, HwStatus, RoiControl, SyncControl, TriggerMode, Triggerable,
};
use daq_core::data::{Bin, Frame, FrameDim, ImageType, Roi};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::instrument;

/// Xh detector exposed through the host capability traits.
pub struct XhDetector {
    session: Arc<XhSession>,
    control: Arc<RunControl>,
    buffers: Arc<SoftBufferManager>,
    worker: parking_lot::Mutex<Option<JoinHandle<()>>>,
    nb_buffers: usize,
    prepared: AtomicBool,
}

impl std::fmt::Debug for XhDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XhDetector")
            .field("session", &self.session)
            .field("control", &self.control)
            .field("nb_buffers", &self.nb_buffers)
            .finish()
    }
}

impl XhDetector {
    /// Wrap an initialized session and spawn its acquisition worker.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(session: Arc<XhSession>) -> Self {
        let nb_buffers = session.config().nb_buffers;
        let control = Arc::new(RunControl::new());
        let buffers = Arc::new(SoftBufferManager::new());
        let worker = spawn_worker(
            session.clone(),
            control.clone(),
            buffers.clone() as Arc<dyn BufferManager>,
        );
        Self {
            session,
            control,
            buffers,
            worker: parking_lot::Mutex::new(Some(worker)),
            nb_buffers,
            prepared: AtomicBool::new(false),
        }
    }

    /// Underlying command session.
    pub fn session(&self) -> &Arc<XhSession> {
        &self.session
    }

    /// Host frame buffers.
    pub fn buffers(&self) -> &Arc<SoftBufferManager> {
        &self.buffers
    }

    /// Run control shared with the worker.
    pub fn run_control(&self) -> &Arc<RunControl> {
        &self.control
    }

    /// Program the hardware and size the host buffers for the next run.
    #[instrument(skip(self), err)]
    pub async fn prepare_acquisition(&self) -> XhResult<()> {
        self.prepared.store(false, Ordering::SeqCst);
        self.session.prepare_acquisition().await?;

        self.control.reset_acquired();
        self.control.clear_fault();
        let layout = self.session.frame_layout();
        self.buffers.allocate(layout.frame_dim(), self.nb_buffers)?;
        self.buffers.set_frame_limit(self.session.frames_to_collect());

        self.prepared.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Start the timing generator and release the worker.
    #[instrument(skip(self), err)]
    pub async fn start_acquisition(&self) -> XhResult<()> {
        let mode = self.session.trigger_mode();
        if mode == TriggerMode::IntTrigMult {
            self.control.arm_software_trigger();
        }
        self.buffers.set_start_timestamp(Utc::now());
        self.session.start_timing().await?;
        self.control.start(mode == TriggerMode::ExtTrigMult).await?;
        tracing::info!(?mode, acquired = self.control.acquired(), "Xh acquisition started");
        Ok(())
    }

    /// Stop the worker and wait until it is parked.
    pub async fn stop_acquisition(&self) {
        self.control.stop().await;
        tracing::info!(acquired = self.control.acquired(), "Xh acquisition stopped");
    }

    /// Wait until the current run is over.
    pub async fn wait_finished(&self) {
        self.control.wait_finished().await;
    }

    /// Host and detector state.
    pub async fn hw_status(&self) -> XhResult<HwStatus> {
        if self.control.fault().is_some() {
            return Ok(HwStatus::new(AcqStatus::Fault, DetStatus::Fault));
        }
        let worker_busy = self.control.worker_state() == WorkerState::Running;
        let status = self.session.read_status().await?;
        Ok(match status.state {
            AcqState::Idle if worker_busy => HwStatus::new(AcqStatus::Running, DetStatus::Readout),
            AcqState::Idle => HwStatus::new(AcqStatus::Ready, DetStatus::Idle),
            AcqState::Running => HwStatus::new(AcqStatus::Running, DetStatus::Exposure),
            _ => HwStatus::new(AcqStatus::Running, DetStatus::WaitForTrigger),
        })
    }

    /// Stop the worker and close the connection.
    pub async fn shutdown(&self) {
        self.control.quit().await;
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                tracing::warn!(error = %e, "acquisition worker ended abnormally");
            }
        }
        self.session.shutdown().await;
        tracing::info!("Xh detector shut down");
    }
}

impl Drop for XhDetector {
    fn drop(&mut self) {
        self.control.request_quit();
    }
}

// =============================================================================
// Capability traits
// =============================================================================

#[async_trait]
impl ExposureControl for XhDetector {
    async fn set_exposure(&self, seconds: f64) -> Result<()> {
        Ok(self.session.set_exposure(seconds)?)
    }

    async fn get_exposure(&self) -> Result<f64> {
        Ok(self.session.exposure())
    }
}

#[async_trait]
impl Triggerable for XhDetector {
    async fn arm(&self) -> Result<()> {
        Ok(self.prepare_acquisition().await?)
    }

    async fn trigger(&self) -> Result<()> {
        if !self.prepared.load(Ordering::SeqCst) {
            bail!("Xh detector is not armed");
        }
        Ok(self.start_acquisition().await?)
    }

    async fn is_armed(&self) -> Result<bool> {
        Ok(self.prepared.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl FrameProducer for XhDetector {
    async fn start_stream(&self) -> Result<()> {
        self.prepare_acquisition().await?;
        Ok(self.start_acquisition().await?)
    }

    async fn start_stream_finite(&self, frame_limit: Option<u32>) -> Result<()> {
        if let Some(n) = frame_limit {
            self.session.set_nb_frames(n);
        }
        self.start_stream().await
    }

    async fn stop_stream(&self) -> Result<()> {
        self.stop_acquisition().await;
        Ok(())
    }

    fn resolution(&self) -> (u32, u32) {
        let dim = self.session.frame_layout().frame_dim();
        (dim.width, dim.height)
    }

    async fn subscribe_frames(&self) -> Option<broadcast::Receiver<Arc<Frame>>> {
        Some(self.buffers.subscribe())
    }

    async fn is_streaming(&self) -> Result<bool> {
        Ok(self.control.worker_state() == WorkerState::Running)
    }

    fn frame_count(&self) -> u64 {
        self.control.acquired()
    }
}

#[async_trait]
impl DetectorInfo for XhDetector {
    fn detector_type(&self) -> String {
        "xh".to_string()
    }

    fn detector_model(&self) -> String {
        "Xh".to_string()
    }

    fn max_image_size(&self) -> FrameDim {
        self.session.max_image_size()
    }

    fn image_type(&self) -> ImageType {
        self.session.image_type()
    }

    async fn set_image_type(&self, image_type: ImageType) -> Result<()> {
        self.session.set_image_type(image_type);
        Ok(())
    }
}

#[async_trait]
impl SyncControl for XhDetector {
    fn check_trigger_mode(&self, mode: TriggerMode) -> bool {
        self.session.check_trigger_mode(mode)
    }

    async fn set_trigger_mode(&self, mode: TriggerMode) -> Result<()> {
        Ok(self.session.set_trigger_mode(mode)?)
    }

    fn trigger_mode(&self) -> TriggerMode {
        self.session.trigger_mode()
    }

    async fn set_nb_frames(&self, nb_frames: u32) -> Result<()> {
        self.session.set_nb_frames(nb_frames);
        Ok(())
    }

    fn nb_frames(&self) -> u32 {
        self.session.nb_frames()
    }

    async fn set_latency(&self, seconds: f64) -> Result<()> {
        Ok(self.session.set_latency(seconds)?)
    }

    fn latency(&self) -> f64 {
        0.0
    }

    fn exposure_range(&self) -> (f64, f64) {
        self.session.exposure_range()
    }

    fn latency_range(&self) -> (f64, f64) {
        let (_, max) = self.session.exposure_range();
        (0.0, max)
    }
}

#[async_trait]
impl RoiControl for XhDetector {
    fn check_roi(&self, requested: Roi) -> Result<Roi> {
        Ok(self.session.check_roi(requested)?)
    }

    async fn set_roi(&self, roi: Roi) -> Result<()> {
        Ok(self.session.set_roi(roi)?)
    }

    fn roi(&self) -> Roi {
        self.session.roi()
    }
}

#[async_trait]
impl BinControl for XhDetector {
    fn check_bin(&self, requested: Bin) -> Bin {
        self.session.check_bin(requested)
    }

    async fn set_bin(&self, bin: Bin) -> Result<()> {
        self.session.set_bin(bin);
        Ok(())
    }

    fn bin(&self) -> Bin {
        self.session.bin()
    }
}

#[async_trait]
impl AcquisitionControl for XhDetector {
    async fn prepare(&self) -> Result<()> {
        Ok(self.prepare_acquisition().await?)
    }

    async fn start(&self) -> Result<()> {
        Ok(self.start_acquisition().await?)
    }

    async fn stop(&self) -> Result<()> {
        self.stop_acquisition().await;
        Ok(())
    }

    async fn status(&self) -> Result<HwStatus> {
        Ok(self.hw_status().await?)
    }

    fn acquired_frames(&self) -> u64 {
        self.control.acquired()
    }
}

// =============================================================================
// Commandable - structured device commands
// =============================================================================

#[derive(Deserialize)]
struct CommandArg {
    cmd: String,
}

#[derive(Deserialize)]
struct HvDacArgs {
    value: f64,
    #[serde(default)]
    noslew: bool,
    #[serde(default)]
    sign: Option<HvSign>,
    #[serde(default)]
    direct: bool,
}

#[derive(Deserialize)]
struct HvAdcArgs {
    #[serde(default)]
    monitor: Option<HvMonitor>,
    #[serde(default)]
    sign: Option<HvSign>,
    #[serde(default)]
    direct: bool,
}

#[derive(Deserialize)]
struct HeadDacArgs {
    value: f64,
    voltage: HeadVoltage,
    #[serde(default)]
    head: Option<u32>,
    #[serde(default)]
    direct: bool,
}

#[derive(Deserialize)]
struct HeadAdcArgs {
    head: u32,
    voltage: HeadVoltage,
}

#[derive(Deserialize)]
struct CapsArgs {
    caps_ab: i32,
    caps_cd: i32,
    #[serde(default)]
    head: Option<u32>,
}

#[derive(Deserialize)]
struct CalEnArgs {
    on: bool,
    #[serde(default)]
    head: Option<u32>,
}

#[derive(Deserialize)]
struct ExtOutputArgs {
    output: i32,
    kind: TriggerOutput,
    #[serde(default)]
    width: u32,
    #[serde(default)]
    invert: bool,
}

#[derive(Deserialize)]
struct LedArgs {
    pause: u32,
    frame: u32,
    integration: u32,
    #[serde(default)]
    inc_orbit: bool,
}

#[derive(Deserialize)]
struct OrbitArgs {
    delay: f64,
    #[serde(default)]
    falling: Option<bool>,
}

#[derive(Deserialize)]
struct ClockArgs {
    #[serde(default)]
    mode: ClockMode,
    #[serde(default)]
    options: ClockOptions,
}

#[derive(Deserialize)]
struct PixelRangeArgs {
    first: u32,
    num: u32,
    #[serde(default)]
    reset: bool,
}

#[derive(Deserialize)]
struct OffsetArgs {
    first: u32,
    num: u32,
    value: i32,
    #[serde(default)]
    direct: bool,
}

#[derive(Deserialize)]
struct ModifyGroupArgs {
    group: u32,
    #[serde(default)]
    last: bool,
    #[serde(default)]
    allow_excess: bool,
    #[serde(default)]
    fixed_reset: Option<u32>,
}

#[derive(Deserialize)]
struct TrigLevelArgs {
    level: TriggerLevel,
    mode: u8,
}

#[derive(Deserialize)]
struct ValueArg<T> {
    value: T,
}

#[derive(Deserialize)]
struct NameArg {
    #[serde(default)]
    name: Option<String>,
}

fn parse_args<T: DeserializeOwned>(command: &str, args: Value) -> Result<T> {
    let args = if args.is_null() { json!({}) } else { args };
    serde_json::from_value(args).with_context(|| format!("Invalid arguments for '{}'", command))
}

fn value_arg<T: DeserializeOwned>(command: &str, args: Value) -> Result<T> {
    Ok(parse_args::<ValueArg<T>>(command, args)?.value)
}

fn required_name(command: &str, args: Value) -> Result<String> {
    parse_args::<NameArg>(command, args)?
        .name
        .ok_or_else(|| anyhow!("Missing 'name' argument for '{}'", command))
}

fn ok() -> Value {
    json!({ "success": true })
}

#[async_trait]
impl Commandable for XhDetector {
    async fn execute_command(&self, command: &str, args: Value) -> Result<Value> {
        let session = &self.session;
        tracing::debug!(command, %args, "Xh command");

        match command {
            // Raw access
            "send_command" => {
                let a: CommandArg = parse_args(command, args)?;
                session.send_command(&a.cmd).await?;
                Ok(ok())
            }
            "send_command_number" => {
                let a: CommandArg = parse_args(command, args)?;
                Ok(json!({ "value": session.send_command_number(&a.cmd).await? }))
            }
            "send_command_string" => {
                let a: CommandArg = parse_args(command, args)?;
                Ok(json!({ "value": session.send_command_string(&a.cmd).await? }))
            }
            "reset" => {
                self.control.stop().await;
                session.reset().await?;
                Ok(ok())
            }

            // High voltage
            "set_hv_dac" => {
                let a: HvDacArgs = parse_args(command, args)?;
                session.set_hv_dac(a.value, a.noslew, a.sign, a.direct).await?;
                Ok(ok())
            }
            "get_hv_adc" => {
                let a: HvAdcArgs = parse_args(command, args)?;
                Ok(json!({ "value": session.get_hv_adc(a.monitor, a.sign, a.direct).await? }))
            }
            "enable_hv" => {
                let mode: HvMode = value_arg(command, args)?;
                session.enable_hv(mode).await?;
                Ok(ok())
            }
            "get_bias" => Ok(json!({ "value": session.get_bias().await? })),

            // Head
            "set_head_dac" => {
                let a: HeadDacArgs = parse_args(command, args)?;
                session.set_head_dac(a.value, a.voltage, a.head, a.direct).await?;
                Ok(ok())
            }
            "get_head_adc" => {
                let a: HeadAdcArgs = parse_args(command, args)?;
                Ok(json!({ "value": session.get_head_adc(a.head, a.voltage).await? }))
            }
            "set_head_caps" => {
                let a: CapsArgs = parse_args(command, args)?;
                session.set_head_caps(a.caps_ab, a.caps_cd, a.head).await?;
                Ok(ok())
            }
            "list_available_caps" => {
                let caps = session.list_available_caps().await?;
                Ok(serde_json::to_value(caps)?)
            }
            "set_cal_en" => {
                let a: CalEnArgs = parse_args(command, args)?;
                session.set_cal_en(a.on, a.head).await?;
                Ok(ok())
            }
            "set_cal_image" => {
                session.set_cal_image(value_arg(command, args)?).await?;
                Ok(ok())
            }
            "set_16bit_readout" => {
                session.set_16bit_readout(value_arg(command, args)?).await?;
                Ok(ok())
            }
            "set_dead_pixels" => {
                let a: PixelRangeArgs = parse_args(command, args)?;
                session.set_dead_pixels(a.first, a.num, a.reset).await?;
                Ok(ok())
            }
            "set_offsets" => {
                let a: OffsetArgs = parse_args(command, args)?;
                session.set_offsets(a.first, a.num, a.value, a.direct).await?;
                Ok(ok())
            }
            "set_x_delay" => {
                session.set_x_delay(value_arg(command, args)?).await?;
                Ok(ok())
            }
            "get_temperature" => {
                let channel: u32 = value_arg(command, args)?;
                Ok(json!({ "value": session.get_temperature(channel).await? }))
            }
            "get_setpoint" => {
                let channel: u32 = value_arg(command, args)?;
                Ok(json!({ "value": session.get_setpoint(channel).await? }))
            }

            // Clock and trigger outputs
            "setup_clock" => {
                let a: ClockArgs = parse_args(command, args)?;
                session.setup_clock(a.mode, &a.options).await?;
                Ok(ok())
            }
            "sync_clock" => {
                session.sync_clock().await?;
                Ok(ok())
            }
            "set_ext_trig_output" => {
                let a: ExtOutputArgs = parse_args(command, args)?;
                session
                    .set_ext_trig_output(a.output, a.kind, a.width, a.invert)
                    .await?;
                Ok(ok())
            }
            "set_led_timing" => {
                let a: LedArgs = parse_args(command, args)?;
                session
                    .set_led_timing(a.pause, a.frame, a.integration, a.inc_orbit)
                    .await?;
                Ok(ok())
            }
            "setup_orbit" => {
                let a: OrbitArgs = parse_args(command, args)?;
                if let Some(falling) = a.falling {
                    session.set_orbit_delay_falling(falling);
                }
                session.setup_orbit(a.delay).await?;
                Ok(ok())
            }

            // Timing
            "set_nb_groups" => {
                session.set_nb_groups(value_arg(command, args)?)?;
                Ok(ok())
            }
            "set_nb_scans" => {
                session.set_nb_scans(value_arg(command, args)?);
                Ok(ok())
            }
            "set_frame_accumulation" => {
                session.set_frame_accumulation(value_arg(command, args)?)?;
                Ok(ok())
            }
            "set_time_mode" => {
                session.set_time_mode(value_arg(command, args)?);
                Ok(ok())
            }
            "set_trig_mux" => {
                session.set_trig_mux(value_arg(command, args)?);
                Ok(ok())
            }
            "set_orbit_trigger" => {
                session.set_orbit_trigger(value_arg(command, args)?)?;
                Ok(ok())
            }
            "set_trig_level_mode" => {
                let a: TrigLevelArgs = parse_args(command, args)?;
                session.set_trig_level_mode(a.level, a.mode)?;
                Ok(ok())
            }
            "set_custom_trigger" => {
                session.set_custom_trigger(&required_name(command, args)?)?;
                Ok(ok())
            }
            "custom_trigger" => Ok(json!({ "value": session.custom_trigger() })),
            "available_trigger_names" => {
                Ok(json!({ "value": session.available_trigger_names() }))
            }
            "timing_parameters" => Ok(serde_json::to_value(session.timing_parameters())?),
            "set_timing_parameters" => {
                let updated = session.update_timing_parameters(&args)?;
                Ok(serde_json::to_value(updated)?)
            }
            "modify_timing_group" => {
                let a: ModifyGroupArgs = parse_args(command, args)?;
                session
                    .modify_timing_group(a.group, a.last, a.allow_excess, a.fixed_reset)
                    .await?;
                Ok(ok())
            }
            "continue_timing" => {
                session.continue_timing().await?;
                Ok(ok())
            }
            "total_frames" => Ok(json!({ "value": session.total_frames().await? })),

            // Scripts
            "run_timing_script" => {
                session.run_timing_script(&required_name(command, args)?).await?;
                Ok(ok())
            }
            "timing_script" => Ok(json!({ "value": session.timing_script().await? })),
            "config_xh" => {
                let a: NameArg = parse_args(command, args)?;
                session.config_xh(a.name.as_deref()).await?;
                Ok(ok())
            }
            "cool_down" => {
                session.cool_down().await?;
                Ok(ok())
            }
            "power_down" => {
                session.power_down().await?;
                Ok(ok())
            }
            "shutdown_script" => {
                let a: CommandArg = parse_args(command, args)?;
                session.shutdown_script(&a.cmd).await?;
                Ok(ok())
            }
            "set_uninterleave" => {
                session.set_uninterleave(value_arg(command, args)?).await?;
                Ok(ok())
            }
            _ => bail!("Unknown command: {}", command),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::XhClient;
    use crate::factory::XhConfig;

    fn offline_detector() -> XhDetector {
        let session = XhSession::with_client(XhConfig::new("localhost", 1972), XhClient::new());
        XhDetector::new(Arc::new(session))
    }

    #[tokio::test]
    async fn detector_info() {
        let detector = offline_detector();
        assert_eq!(detector.detector_type(), "xh");
        assert_eq!(detector.detector_model(), "Xh");
        assert_eq!(detector.pixel_size(), (1.0, 1.0));
        assert_eq!(detector.image_type(), ImageType::Bpp32);
        assert_eq!(detector.max_image_size().height, 1);
    }

    #[tokio::test]
    async fn unknown_command_is_rejected() {
        let detector = offline_detector();
        let err = detector
            .execute_command("self_destruct", Value::Null)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Unknown command"));
    }

    #[tokio::test]
    async fn commands_validate_locally() {
        let detector = offline_detector();

        detector
            .execute_command("set_nb_groups", json!({ "value": 4 }))
            .await
            .unwrap();
        assert_eq!(detector.session().nb_groups(), 4);

        assert!(detector
            .execute_command("set_nb_groups", json!({ "value": 2048 }))
            .await
            .is_err());
        assert!(detector
            .execute_command("set_orbit_trigger", json!({ "value": 7 }))
            .await
            .is_err());

        detector
            .execute_command("set_trig_level_mode", json!({ "level": "group", "mode": 1 }))
            .await
            .unwrap();
        let reply = detector
            .execute_command("custom_trigger", Value::Null)
            .await
            .unwrap();
        assert_eq!(reply["value"], "group_trigger");

        let params = detector
            .execute_command("set_timing_parameters", json!({ "scan_period": 40 }))
            .await
            .unwrap();
        assert_eq!(params["scan_period"], 40);
    }

    #[tokio::test]
    async fn timing_script_outside_allow_list() {
        let detector = offline_detector();
        let err = detector
            .execute_command("run_timing_script", json!({ "name": "rm_everything" }))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn trigger_requires_arm() {
        let detector = offline_detector();
        assert!(!detector.is_armed().await.unwrap());
        assert!(detector.trigger().await.is_err());
    }

    #[tokio::test]
    async fn stop_without_run_is_noop() {
        let detector = offline_detector();
        AcquisitionControl::stop(&detector).await.unwrap();
        assert_eq!(detector.acquired_frames(), 0);
        detector.shutdown().await;
        assert_eq!(detector.run_control().worker_state(), WorkerState::Exited);
    }
}

//! Device session: the command façade over one Xh control connection.
//!
//! The session owns the [`XhClient`] behind an async mutex, so one exchange
//! (or one frame transfer) completes before the next command goes out. All
//! configuration mirrors live behind a `parking_lot` mutex that is never held
//! across an await.
//!
//! Commands address the detector by its system name, `'xh0'` by default:
//!
//! ```text
//! xstrip open 'xh0'                      -> * 3        (open handle)
//! unif-get-nx 3                          -> * 1024     (pixels per frame)
//! xstrip timing setup-group 'xh0' 0 10 1 5000 last  -> * 10
//! xstrip timing start 'xh0'              -> >
//! xstrip timing read-status 'xh0'        -> * "Idle: group=0, ..."
//! read 0 0 0 1024 1 10 from 3 long       -> (data channel) * 0
//! ```

use crate::acquisition::AcquisitionDevice;
use crate::client::XhClient;
use crate::error::{XhError, XhResult};
use crate::factory::XhConfig;
use crate::hardware::{
    self, AvailableCaps, ClockMode, ClockOptions, HeadVoltage, HvMode, HvMonitor, HvSign,
    TriggerOutput,
};
use crate::status::XhStatus;
use crate::timing::{
    setup_group_command, TimingParameters, TriggerControl, SOFTWARE_TRIG_MUX, TRIGGER_NAMES,
};
use crate::transform::FrameLayout;
use async_trait::async_trait;
use daq_core::capabilities::TriggerMode;
use daq_core::data::{Bin, FrameDim, ImageType, Roi};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::instrument;

/// Groups the timing generator can hold
pub const MAX_GROUPS: u32 = 1024;

/// Cycle length used for the exposure range, independent of the clock factor
const RANGE_CYCLE_SECONDS: f64 = 20e-9;

/// Lemo output pattern driven during acquisitions
const ACQUISITION_LEMO_OUT: u32 = 65535;

/// Orbit mux selected by orbit trigger modes
const ORBIT_MODE_MUX: i32 = 3;

/// Which timing level a trigger mode applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerLevel {
    /// Groups
    Group,
    /// Frames
    Frame,
    /// Scans
    Scan,
}

impl TriggerLevel {
    fn flags(self) -> (TriggerControl, TriggerControl) {
        match self {
            TriggerLevel::Group => (TriggerControl::GROUP_TRIGGER, TriggerControl::GROUP_ORBIT),
            TriggerLevel::Frame => (TriggerControl::FRAME_TRIGGER, TriggerControl::FRAME_ORBIT),
            TriggerLevel::Scan => (TriggerControl::SCAN_TRIGGER, TriggerControl::SCAN_ORBIT),
        }
    }
}

#[derive(Debug)]
struct SessionState {
    timing: TimingParameters,
    trigger_mode: TriggerMode,
    /// Native value: cycles in time mode, passed through otherwise
    exposure: f64,
    time_mode: bool,
    nb_frames: u32,
    nb_groups: u32,
    nb_scans: u32,
    frames_to_collect: u64,
    image_type: ImageType,
    roi: Roi,
    bin: Bin,
    npixels: u32,
    open_handle: Option<i64>,
    uninterleave: bool,
    trig_group_mode: u8,
    trig_frame_mode: u8,
    trig_scan_mode: u8,
    frame_accumulation: u32,
    orbit_delay_falling: bool,
}

impl SessionState {
    fn new(config: &XhConfig) -> Self {
        Self {
            timing: TimingParameters::default(),
            trigger_mode: TriggerMode::IntTrig,
            exposure: 0.0,
            time_mode: config.time_mode,
            nb_frames: 1,
            nb_groups: 1,
            nb_scans: 1,
            frames_to_collect: 1,
            image_type: ImageType::Bpp32,
            roi: Roi::default(),
            bin: Bin::default(),
            npixels: 0,
            open_handle: None,
            uninterleave: config.uninterleave,
            trig_group_mode: 0,
            trig_frame_mode: 0,
            trig_scan_mode: 0,
            frame_accumulation: 1,
            orbit_delay_falling: false,
        }
    }

    fn trig_mode_mut(&mut self, level: TriggerLevel) -> &mut u8 {
        match level {
            TriggerLevel::Group => &mut self.trig_group_mode,
            TriggerLevel::Frame => &mut self.trig_frame_mode,
            TriggerLevel::Scan => &mut self.trig_scan_mode,
        }
    }

    /// Mode 0 clears the trigger flags, 1 selects the external trigger, 2 the orbit.
    fn apply_trig_mode(&mut self, level: TriggerLevel, mode: u8) -> XhResult<()> {
        let (trigger, orbit) = level.flags();
        self.timing.trig_control = match mode {
            0 => TriggerControl::NO_TRIGGER,
            1 => trigger,
            2 => {
                self.timing.orbit_mux = ORBIT_MODE_MUX;
                orbit
            }
            _ => {
                return Err(XhError::Configuration(format!(
                    "trigger mode for {:?} must be 0..=2, got {}",
                    level, mode
                )))
            }
        };
        *self.trig_mode_mut(level) = mode;
        Ok(())
    }
}

/// Command façade for one Xh detector.
pub struct XhSession {
    config: XhConfig,
    client: tokio::sync::Mutex<XhClient>,
    state: Mutex<SessionState>,
}

impl std::fmt::Debug for XhSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XhSession")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("sys_name", &self.config.sys_name)
            .finish()
    }
}

impl XhSession {
    /// Create a disconnected session; call [`init`](Self::init) next.
    pub fn new(config: XhConfig) -> Self {
        Self::with_client(config, XhClient::new())
    }

    /// Create a session over an existing client.
    pub fn with_client(config: XhConfig, client: XhClient) -> Self {
        let state = SessionState::new(&config);
        Self {
            config,
            client: tokio::sync::Mutex::new(client),
            state: Mutex::new(state),
        }
    }

    /// Session configuration.
    pub fn config(&self) -> &XhConfig {
        &self.config
    }

    fn sys(&self) -> &str {
        &self.config.sys_name
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Connect, register the data channel and open the detector.
    #[instrument(skip(self), fields(host = %self.config.host, port = self.config.port), err)]
    pub async fn init(&self) -> XhResult<()> {
        let uninterleave = self.state.lock().uninterleave;
        let mut client = self.client.lock().await;

        client.connect(&self.config.host, self.config.port).await?;
        let data_port = client.open_data_channel().await?;
        tracing::debug!(data_port, "server assigned data port");

        if let Some(name) = self.config.config_name.as_deref().filter(|n| !n.is_empty()) {
            client.send_wait(&format!("~{}", name)).await?;
        }

        let handle = self.open_detector(&mut client, uninterleave).await?;
        let npixels = client.send_wait_int(&format!("unif-get-nx {}", handle)).await?;
        if npixels <= 0 {
            return Err(client.device_error("detector reports no pixels"));
        }
        let npixels = u32::try_from(npixels)
            .map_err(|_| XhError::Protocol(format!("pixel count out of range: {}", npixels)))?;

        let mut state = self.state.lock();
        state.open_handle = Some(handle);
        state.npixels = npixels;
        state.timing = TimingParameters {
            trig_mux: SOFTWARE_TRIG_MUX,
            ..TimingParameters::default()
        };
        state.nb_scans = 1;
        tracing::info!(handle, npixels, "Xh detector {} initialized", self.config.sys_name);
        Ok(())
    }

    async fn open_detector(&self, client: &mut XhClient, uninterleave: bool) -> XhResult<i64> {
        let mut cmd = format!("xstrip open {}", self.sys());
        if uninterleave {
            cmd.push_str(" un-interleave");
        }
        let handle = client.send_wait_int(&cmd).await?;
        if handle < 0 {
            return Err(client.device_error(&format!("cannot open {}", self.sys())));
        }
        tracing::debug!(handle, "configured open path");
        Ok(handle)
    }

    /// Disconnect and initialize again.
    pub async fn reset(&self) -> XhResult<()> {
        self.client.lock().await.disconnect().await;
        self.init().await
    }

    /// Close the connection.
    pub async fn shutdown(&self) {
        self.client.lock().await.disconnect().await;
        self.state.lock().open_handle = None;
    }

    /// Whether the control connection is live.
    pub async fn is_connected(&self) -> bool {
        self.client.lock().await.is_connected()
    }

    /// Debug lines of the last exchange.
    pub async fn debug_messages(&self) -> Vec<String> {
        self.client.lock().await.debug_messages().to_vec()
    }

    // =========================================================================
    // Raw command helpers
    // =========================================================================

    /// Send a command; any return value is ignored.
    pub async fn send_command(&self, cmd: &str) -> XhResult<()> {
        self.client.lock().await.send_wait(cmd).await
    }

    /// Send a command returning a number.
    pub async fn send_command_number(&self, cmd: &str) -> XhResult<f64> {
        self.command_double(cmd).await
    }

    /// Send a command returning a string.
    pub async fn send_command_string(&self, cmd: &str) -> XhResult<String> {
        self.command_string(cmd).await
    }

    async fn command_int(&self, cmd: &str) -> XhResult<i64> {
        let mut client = self.client.lock().await;
        let value = client.send_wait_int(cmd).await?;
        if value < 0 {
            return Err(client.device_error(&format!("'{}' returned {}", cmd, value)));
        }
        Ok(value)
    }

    async fn command_double(&self, cmd: &str) -> XhResult<f64> {
        let mut client = self.client.lock().await;
        let value = client.send_wait_double(cmd).await?;
        if value.is_nan() {
            return Err(client.device_error(&format!("'{}' returned nan", cmd)));
        }
        Ok(value)
    }

    async fn command_string(&self, cmd: &str) -> XhResult<String> {
        let mut client = self.client.lock().await;
        let value = client.send_wait_string(cmd).await?;
        if value.is_empty() {
            return Err(client.device_error(&format!("'{}' returned an empty string", cmd)));
        }
        Ok(value)
    }

    // =========================================================================
    // Exposure, latency and trigger
    // =========================================================================

    /// Set the exposure in seconds.
    pub fn set_exposure(&self, seconds: f64) -> XhResult<()> {
        let (min, max) = self.exposure_range();
        if !(min..=max).contains(&seconds) {
            return Err(XhError::Configuration(format!(
                "exposure {} s outside {}..={} s",
                seconds, min, max
            )));
        }
        let mut state = self.state.lock();
        state.exposure = if state.time_mode {
            seconds / self.config.clock_factor
        } else {
            seconds
        };
        tracing::debug!(seconds, native = state.exposure, "exposure set");
        Ok(())
    }

    /// Exposure in seconds.
    pub fn exposure(&self) -> f64 {
        let state = self.state.lock();
        if state.time_mode {
            state.exposure * self.config.clock_factor
        } else {
            state.exposure
        }
    }

    /// Exposure in device cycles.
    pub fn exposure_cycles(&self) -> f64 {
        self.state.lock().exposure
    }

    /// Valid exposure range in seconds.
    pub fn exposure_range(&self) -> (f64, f64) {
        (0.0, f64::from(u32::MAX) * RANGE_CYCLE_SECONDS)
    }

    /// Interpret exposures as seconds (`true`) or raw cycles.
    pub fn set_time_mode(&self, time_mode: bool) {
        self.state.lock().time_mode = time_mode;
    }

    /// Current time mode.
    pub fn time_mode(&self) -> bool {
        self.state.lock().time_mode
    }

    /// Latency is not supported; only 0 is accepted.
    pub fn set_latency(&self, seconds: f64) -> XhResult<()> {
        if seconds != 0.0 {
            return Err(XhError::Configuration("latency is not managed".into()));
        }
        Ok(())
    }

    /// Whether `mode` is supported.
    pub fn check_trigger_mode(&self, mode: TriggerMode) -> bool {
        matches!(
            mode,
            TriggerMode::IntTrig | TriggerMode::IntTrigMult | TriggerMode::ExtTrigMult
        )
    }

    /// Select the acquisition trigger mode.
    pub fn set_trigger_mode(&self, mode: TriggerMode) -> XhResult<()> {
        if !self.check_trigger_mode(mode) {
            return Err(XhError::Configuration(format!(
                "trigger mode {:?} is not managed",
                mode
            )));
        }
        self.state.lock().trigger_mode = mode;
        Ok(())
    }

    /// Current trigger mode.
    pub fn trigger_mode(&self) -> TriggerMode {
        self.state.lock().trigger_mode
    }

    /// Names accepted by [`set_custom_trigger`](Self::set_custom_trigger).
    pub fn available_trigger_names(&self) -> Vec<&'static str> {
        TRIGGER_NAMES.iter().map(|(name, _)| *name).collect()
    }

    /// Replace the timing trigger flags by a named flag.
    pub fn set_custom_trigger(&self, name: &str) -> XhResult<()> {
        let control = TriggerControl::from_name(name)
            .ok_or_else(|| XhError::Configuration(format!("trigger mode '{}' not found", name)))?;
        self.state.lock().timing.trig_control = control;
        Ok(())
    }

    /// Name of the current trigger flags, or the raw bits for a combination.
    pub fn custom_trigger(&self) -> String {
        let control = self.state.lock().timing.trig_control;
        TRIGGER_NAMES
            .iter()
            .find(|(_, flag)| *flag == control)
            .map(|(name, _)| (*name).to_string())
            .unwrap_or_else(|| format!("{:#x}", control.bits()))
    }

    /// Set the trigger mode (0 none, 1 external, 2 orbit) of one timing level.
    pub fn set_trig_level_mode(&self, level: TriggerLevel, mode: u8) -> XhResult<()> {
        self.state.lock().apply_trig_mode(level, mode)
    }

    /// Trigger mode of one timing level.
    pub fn trig_level_mode(&self, level: TriggerLevel) -> u8 {
        *self.state.lock().trig_mode_mut(level)
    }

    /// Select the trigger input (9 = software, 8 = main trigger, 0..=7 Lemo).
    pub fn set_trig_mux(&self, mux: i32) {
        self.state.lock().timing.trig_mux = mux;
    }

    /// Current trigger input.
    pub fn trig_mux(&self) -> i32 {
        self.state.lock().timing.trig_mux
    }

    /// Select the orbit input: 0 direct, 1 delayed, 2 LVDS direct, 3 LVDS delayed.
    pub fn set_orbit_trigger(&self, mux: i32) -> XhResult<()> {
        if !(0..=3).contains(&mux) {
            return Err(XhError::Configuration(format!(
                "orbit mux must be 0..=3, got {}",
                mux
            )));
        }
        self.state.lock().timing.orbit_mux = mux;
        Ok(())
    }

    /// Current orbit input.
    pub fn orbit_trigger(&self) -> i32 {
        self.state.lock().timing.orbit_mux
    }

    /// Copy of the timing parameters.
    pub fn timing_parameters(&self) -> TimingParameters {
        self.state.lock().timing.clone()
    }

    /// Replace the timing parameters.
    pub fn set_timing_parameters(&self, params: TimingParameters) {
        self.state.lock().timing = params;
    }

    /// Merge the fields of a JSON object into the timing parameters.
    ///
    /// Unknown fields or badly typed values leave the parameters untouched.
    pub fn update_timing_parameters(&self, patch: &serde_json::Value) -> XhResult<TimingParameters> {
        let patch = patch.as_object().ok_or_else(|| {
            XhError::Configuration("timing parameters must be a JSON object".into())
        })?;
        let mut state = self.state.lock();
        let mut merged = serde_json::to_value(&state.timing)
            .map_err(|e| XhError::Configuration(e.to_string()))?;
        if let Some(fields) = merged.as_object_mut() {
            for (key, value) in patch {
                if !fields.contains_key(key) {
                    return Err(XhError::Configuration(format!(
                        "unknown timing parameter '{}'",
                        key
                    )));
                }
                fields.insert(key.clone(), value.clone());
            }
        }
        let updated: TimingParameters = serde_json::from_value(merged)
            .map_err(|e| XhError::Configuration(format!("invalid timing parameters: {}", e)))?;
        state.timing = updated.clone();
        Ok(updated)
    }

    // =========================================================================
    // Frame counts and geometry
    // =========================================================================

    /// Number of frames to acquire.
    pub fn set_nb_frames(&self, nb_frames: u32) {
        let mut state = self.state.lock();
        state.nb_frames = nb_frames;
        state.frames_to_collect = u64::from(nb_frames);
    }

    /// Requested number of frames.
    pub fn nb_frames(&self) -> u32 {
        self.state.lock().nb_frames
    }

    /// Number of timing groups the frames are split into.
    pub fn set_nb_groups(&self, nb_groups: u32) -> XhResult<()> {
        if nb_groups >= MAX_GROUPS {
            return Err(XhError::Configuration(format!(
                "number of groups cannot be bigger than {}",
                MAX_GROUPS
            )));
        }
        self.state.lock().nb_groups = nb_groups;
        Ok(())
    }

    /// Number of timing groups.
    pub fn nb_groups(&self) -> u32 {
        self.state.lock().nb_groups
    }

    /// Scans per frame.
    pub fn set_nb_scans(&self, nb_scans: u32) {
        self.state.lock().nb_scans = nb_scans;
    }

    /// Scans per frame.
    pub fn nb_scans(&self) -> u32 {
        self.state.lock().nb_scans
    }

    /// Number of accumulated frames each sample is divided by.
    pub fn set_frame_accumulation(&self, count: u32) -> XhResult<()> {
        if count == 0 {
            return Err(XhError::Configuration(
                "frame accumulation must be at least 1".into(),
            ));
        }
        self.state.lock().frame_accumulation = count;
        Ok(())
    }

    /// Current accumulation count.
    pub fn frame_accumulation(&self) -> u32 {
        self.state.lock().frame_accumulation
    }

    /// Pixels per detector frame.
    pub fn npixels(&self) -> u32 {
        self.state.lock().npixels
    }

    /// Full detector geometry.
    pub fn max_image_size(&self) -> FrameDim {
        let state = self.state.lock();
        FrameDim::new(state.npixels, 1, state.image_type)
    }

    /// Host pixel format.
    pub fn image_type(&self) -> ImageType {
        self.state.lock().image_type
    }

    /// Select the host pixel format without touching the readout mode.
    pub fn set_image_type(&self, image_type: ImageType) {
        self.state.lock().image_type = image_type;
    }

    /// Validate a ROI: the detector is one line high.
    pub fn check_roi(&self, requested: Roi) -> XhResult<Roi> {
        if requested.y != 0 || requested.height > 1 {
            return Err(XhError::Configuration(
                "ROI must be a single line starting at row 0".into(),
            ));
        }
        let npixels = self.npixels();
        if npixels > 0 && requested.x.saturating_add(requested.width) > npixels {
            return Err(XhError::Configuration(format!(
                "ROI {}+{} exceeds {} pixels",
                requested.x, requested.width, npixels
            )));
        }
        Ok(Roi::new(requested.x, 0, requested.width, 0))
    }

    /// Set the ROI; only x and width are kept.
    pub fn set_roi(&self, roi: Roi) -> XhResult<()> {
        let checked = self.check_roi(roi)?;
        self.state.lock().roi = checked;
        Ok(())
    }

    /// Current ROI.
    pub fn roi(&self) -> Roi {
        self.state.lock().roi
    }

    /// Clamp binning to what the detector supports.
    pub fn check_bin(&self, requested: Bin) -> Bin {
        Bin::new(requested.x.max(1), 1)
    }

    /// Set binning.
    pub fn set_bin(&self, bin: Bin) {
        self.state.lock().bin = self.check_bin(bin);
    }

    /// Current binning.
    pub fn bin(&self) -> Bin {
        self.state.lock().bin
    }

    /// Transform parameters for the next acquisition.
    pub fn frame_layout(&self) -> FrameLayout {
        let state = self.state.lock();
        FrameLayout {
            image_type: state.image_type,
            npixels: state.npixels,
            roi_x: state.roi.x,
            roi_width: state.roi.width,
            bin_x: state.bin.x,
            accumulation: state.frame_accumulation,
        }
    }

    /// Frames the worker collects before ending the run (0 = unbounded).
    pub fn frames_to_collect(&self) -> u64 {
        self.state.lock().frames_to_collect
    }

    // =========================================================================
    // Acquisition
    // =========================================================================

    /// Program the timing generator for the configured acquisition.
    #[instrument(skip(self), err)]
    pub async fn prepare_acquisition(&self) -> XhResult<()> {
        let (exposure, nb_frames, nb_groups, nb_scans) = {
            let state = self.state.lock();
            (state.exposure, state.nb_frames, state.nb_groups, state.nb_scans)
        };

        if nb_groups == 0 {
            return Err(XhError::Configuration(
                "Number of groups must be bigger than 0".into(),
            ));
        }
        if nb_frames % nb_groups != 0 {
            return Err(XhError::Configuration(
                "Number of frames must be a multiple of number of groups".into(),
            ));
        }

        self.send_command(&hardware::ext_output(
            self.sys(),
            -1,
            TriggerOutput::Integration,
            0,
            false,
        ))
        .await?;

        {
            let mut state = self.state.lock();
            let fraction = exposure - exposure.floor();
            state.timing.s2_delay = ((fraction * 4.0) as u32).min(3);
            for level in [TriggerLevel::Group, TriggerLevel::Frame, TriggerLevel::Scan] {
                let mode = *state.trig_mode_mut(level);
                if mode != 0 {
                    state.apply_trig_mode(level, mode)?;
                }
            }
            state.timing.lemo_out = vec![ACQUISITION_LEMO_OUT];
            state.frames_to_collect = u64::from(nb_frames);
        }

        if exposure != 0.0 {
            let cycles = exposure.round().clamp(0.0, f64::from(u32::MAX)) as u32;
            let frames_per_group = nb_frames / nb_groups;
            for group in 0..nb_groups {
                self.set_timing_group(group, frames_per_group, nb_scans, cycles, group + 1 == nb_groups)
                    .await?;
            }
        } else {
            let total = self.total_frames().await?;
            if total != i64::from(nb_frames) {
                return Err(XhError::Configuration(format!(
                    "trying to collect {} frames but {} are configured",
                    nb_frames, total
                )));
            }
        }
        tracing::info!(
            nb_frames,
            nb_groups,
            nb_scans,
            frames_to_collect = self.frames_to_collect(),
            "acquisition prepared"
        );
        Ok(())
    }

    /// Program one timing group; returns the frame count the server accepted.
    #[instrument(skip(self), err)]
    pub async fn set_timing_group(
        &self,
        group: u32,
        frames: u32,
        scans: u32,
        cycles: u32,
        last: bool,
    ) -> XhResult<u64> {
        let cmd = {
            let state = self.state.lock();
            setup_group_command(self.sys(), group, frames, scans, cycles, last, &state.timing)
        };
        let programmed = self.command_int(&cmd).await? as u64;

        let mut state = self.state.lock();
        if state.timing.trig_control != TriggerControl::NO_TRIGGER {
            state.trigger_mode = TriggerMode::ExtTrigMult;
        }
        if state.timing.trig_mux == SOFTWARE_TRIG_MUX {
            state.trigger_mode = TriggerMode::IntTrigMult;
        }
        if last && state.trigger_mode != TriggerMode::IntTrigMult {
            state.frames_to_collect = programmed;
        }
        Ok(programmed)
    }

    /// Modify a programmed group before the last one is written.
    pub async fn modify_timing_group(
        &self,
        group: u32,
        last: bool,
        allow_excess: bool,
        fixed_reset: Option<u32>,
    ) -> XhResult<()> {
        self.send_command(&hardware::modify_group(
            self.sys(),
            group,
            last,
            allow_excess,
            fixed_reset,
        ))
        .await
    }

    /// Start the timing generator.
    pub async fn start_timing(&self) -> XhResult<()> {
        self.send_command(&format!("xstrip timing start {}", self.sys()))
            .await
    }

    /// Stop the timing generator.
    pub async fn stop_timing(&self) -> XhResult<()> {
        self.send_command(&format!("xstrip timing stop {}", self.sys()))
            .await
    }

    /// Software continue from a pause before a group, frame or scan.
    pub async fn continue_timing(&self) -> XhResult<()> {
        self.send_command(&format!("xstrip timing continue {}", self.sys()))
            .await
    }

    /// Poll the timing generator.
    pub async fn read_status(&self) -> XhResult<XhStatus> {
        let reply = self
            .command_string(&format!("xstrip timing read-status {}", self.sys()))
            .await?;
        reply.parse()
    }

    /// Read `count` frames from detector memory through the data channel.
    pub async fn read_frames(&self, first: u64, count: u64) -> XhResult<Vec<u8>> {
        let (handle, npixels, image_type, uninterleave) = {
            let state = self.state.lock();
            let handle = state.open_handle.ok_or(XhError::NotConnected)?;
            (handle, state.npixels, state.image_type, state.uninterleave)
        };

        let geometry = if uninterleave {
            format!("{} 2", npixels / 2)
        } else {
            format!("{} 1", npixels)
        };
        let suffix = match image_type {
            ImageType::Bpp16 => "raw",
            ImageType::Bpp32 => "long",
        };
        let cmd = format!(
            "read 0 0 {} {} {} from {} {}",
            first, geometry, count, handle, suffix
        );

        let bytes = count as usize * npixels as usize * image_type.bytes_per_pixel();
        let mut buf = vec![0u8; bytes];

        let mut client = self.client.lock().await;
        client.send_no_wait(&cmd).await?;
        client.receive_data(&mut buf).await?;
        let ack = client.wait_for_int().await?;
        if ack < 0 {
            return Err(client.device_error("frame read failed"));
        }
        tracing::trace!(first, count, bytes, "frames read");
        Ok(buf)
    }

    // =========================================================================
    // Detector head, HV and clock
    // =========================================================================

    /// Switch the readout between 16 and 32 bit samples.
    pub async fn set_16bit_readout(&self, on: bool) -> XhResult<()> {
        self.send_command(&format!("xstrip mode16bit {} {}", self.sys(), u8::from(on)))
            .await?;
        self.state.lock().image_type = if on { ImageType::Bpp16 } else { ImageType::Bpp32 };
        Ok(())
    }

    /// Mark a range of pixels as dead, or clear the marks.
    pub async fn set_dead_pixels(&self, first: u32, num: u32, reset: bool) -> XhResult<()> {
        let mut cmd = format!("xstrip set-dead-pixels {} {} {}", self.sys(), first, num);
        if reset {
            cmd.push_str(" reset");
        }
        self.send_command(&cmd).await
    }

    /// Set the offset of a range of pixels.
    pub async fn set_offsets(&self, first: u32, num: u32, value: i32, direct: bool) -> XhResult<()> {
        let mut cmd = format!("xstrip offsets set {} {} {} {}", self.sys(), first, num, value);
        if direct {
            cmd.push_str(" direct");
        }
        self.send_command(&cmd).await
    }

    /// Set the HV supply control DAC.
    pub async fn set_hv_dac(
        &self,
        value: f64,
        noslew: bool,
        sign: Option<HvSign>,
        direct: bool,
    ) -> XhResult<()> {
        self.send_command(&hardware::hv_set_dac(self.sys(), value, noslew, sign, direct))
            .await
    }

    /// Read an HV supply monitor.
    pub async fn get_hv_adc(
        &self,
        monitor: Option<HvMonitor>,
        sign: Option<HvSign>,
        direct: bool,
    ) -> XhResult<f64> {
        self.command_double(&hardware::hv_get_adc(self.sys(), monitor, sign, direct))
            .await
    }

    /// Enable or disable the HV supply.
    pub async fn enable_hv(&self, mode: HvMode) -> XhResult<()> {
        self.send_command(&hardware::hv_enable(self.sys(), mode)).await
    }

    /// Read the bias current.
    pub async fn get_bias(&self) -> XhResult<f64> {
        self.command_double(&format!("xstrip hv get-adc {} ibias", self.sys()))
            .await
    }

    /// Set a head DAC.
    pub async fn set_head_dac(
        &self,
        value: f64,
        voltage: HeadVoltage,
        head: Option<u32>,
        direct: bool,
    ) -> XhResult<()> {
        self.send_command(&hardware::head_set_dac(self.sys(), value, voltage, head, direct))
            .await
    }

    /// Read a head ADC.
    pub async fn get_head_adc(&self, head: u32, voltage: HeadVoltage) -> XhResult<f64> {
        self.command_double(&hardware::head_get_adc(self.sys(), head, voltage))
            .await
    }

    /// Set the XChip capacitors.
    pub async fn set_head_caps(&self, caps_ab: i32, caps_cd: i32, head: Option<u32>) -> XhResult<()> {
        self.send_command(&hardware::head_set_caps(self.sys(), caps_ab, caps_cd, head))
            .await
    }

    /// Drive the calibration LED enable.
    pub async fn set_cal_en(&self, on: bool, head: Option<u32>) -> XhResult<()> {
        self.send_command(&hardware::head_set_cal_en(self.sys(), on, head))
            .await
    }

    /// Capacitor values accepted by [`set_head_caps`](Self::set_head_caps).
    pub async fn list_available_caps(&self) -> XhResult<AvailableCaps> {
        let reply = self
            .command_string(&format!("xstrip head list-caps {}", self.sys()))
            .await?;
        Ok(AvailableCaps::parse(&reply))
    }

    /// Set a calibration image using XChip Vres, scale in percent.
    pub async fn set_cal_image(&self, scale: f64) -> XhResult<()> {
        self.send_command(&format!("xstrip head set-cal-image {} {}", self.sys(), scale))
            .await
    }

    /// Route a signal to an external trigger output (-1 = all outputs).
    pub async fn set_ext_trig_output(
        &self,
        output: i32,
        kind: TriggerOutput,
        width: u32,
        invert: bool,
    ) -> XhResult<()> {
        self.send_command(&hardware::ext_output(self.sys(), output, kind, width, invert))
            .await
    }

    /// Configure the LED stretch times, in 0.32768 ms cycles.
    pub async fn set_led_timing(
        &self,
        pause: u32,
        frame: u32,
        integration: u32,
        inc_orbit: bool,
    ) -> XhResult<()> {
        let mut cmd = format!(
            "xstrip timing setup-leds {} {} {} {}",
            self.sys(),
            pause,
            frame,
            integration
        );
        if inc_orbit {
            cmd.push_str(" inc-orbit");
        }
        self.send_command(&cmd).await
    }

    /// Trigger the orbit delay on the falling edge.
    pub fn set_orbit_delay_falling(&self, falling: bool) {
        self.state.lock().orbit_delay_falling = falling;
    }

    /// Set the orbit delay.
    pub async fn setup_orbit(&self, delay: f64) -> XhResult<()> {
        let falling = self.state.lock().orbit_delay_falling;
        let mut cmd = format!("xstrip timing setup-orbit {} {}", self.sys(), delay);
        if falling {
            cmd.push_str(" falling");
        }
        self.send_command(&cmd).await
    }

    /// Configure the ADC clock.
    pub async fn setup_clock(&self, mode: ClockMode, opts: &ClockOptions) -> XhResult<()> {
        self.send_command(&hardware::clock_setup(self.sys(), mode, opts))
            .await
    }

    /// Synchronise the ADC clocks.
    pub async fn sync_clock(&self) -> XhResult<()> {
        self.send_command(&format!("xstrip test sync-clock {}", self.sys()))
            .await
    }

    /// Delay between the XChip control signals and data (0..=63, -1 default).
    pub async fn set_x_delay(&self, delay: i32) -> XhResult<()> {
        self.send_command(&format!("xstrip set-x-delay {} {}", self.sys(), delay))
            .await
    }

    /// Temperature of a head sensor, in degrees C.
    pub async fn get_temperature(&self, channel: u32) -> XhResult<f64> {
        self.command_double(&format!("xstrip tc get {} ch {} t", self.sys(), channel))
            .await
    }

    /// Temperature setpoint of a head sensor, in degrees C.
    pub async fn get_setpoint(&self, channel: u32) -> XhResult<f64> {
        self.command_double(&format!("xstrip tc get {} ch {} setpoint", self.sys(), channel))
            .await
    }

    // =========================================================================
    // Scripts
    // =========================================================================

    /// Number of time frames configured in the hardware.
    pub async fn total_frames(&self) -> XhResult<i64> {
        self.command_int("%xstrip_num_tf").await
    }

    /// Run a timing script from the configured allow-list.
    pub async fn run_timing_script(&self, name: &str) -> XhResult<()> {
        if !self.config.timing_scripts.iter().any(|s| s == name) {
            return Err(XhError::Configuration(format!(
                "timing script '{}' not found",
                name
            )));
        }
        self.send_command(&format!("~{}", name)).await
    }

    /// Name of the loaded timing file.
    pub async fn timing_script(&self) -> XhResult<String> {
        self.command_string("%xstrip_timing_file").await
    }

    /// Run a configuration script; `None` runs the configured one.
    pub async fn config_xh(&self, name: Option<&str>) -> XhResult<()> {
        let name = name
            .filter(|n| !n.is_empty())
            .or(self.config.config_name.as_deref())
            .ok_or_else(|| XhError::Configuration("no configuration script given".into()))?;
        self.send_command(&format!("~{}", name)).await
    }

    /// Power down the heads.
    pub async fn cool_down(&self) -> XhResult<()> {
        self.send_command("~head_powerdown").await
    }

    /// Run the cool-down sequence.
    pub async fn power_down(&self) -> XhResult<()> {
        self.send_command("~cooldown_xh").await
    }

    /// Shut the detector down with a script command.
    pub async fn shutdown_script(&self, script: &str) -> XhResult<()> {
        self.send_command(script).await
    }

    /// Reopen the detector with or without head un-interleaving.
    #[instrument(skip(self), err)]
    pub async fn set_uninterleave(&self, uninterleave: bool) -> XhResult<()> {
        let current = {
            let state = self.state.lock();
            if state.uninterleave == uninterleave {
                return Ok(());
            }
            state.open_handle
        };

        let mut client = self.client.lock().await;
        if let Some(handle) = current {
            client.send_wait(&format!("close {}", handle)).await?;
        }
        self.state.lock().open_handle = None;
        let handle = self.open_detector(&mut client, uninterleave).await?;

        let mut state = self.state.lock();
        state.open_handle = Some(handle);
        state.uninterleave = uninterleave;
        Ok(())
    }

    /// Whether heads are read un-interleaved.
    pub fn uninterleave(&self) -> bool {
        self.state.lock().uninterleave
    }
}

#[async_trait]
impl AcquisitionDevice for XhSession {
    async fn read_status(&self) -> XhResult<XhStatus> {
        XhSession::read_status(self).await
    }

    async fn read_frames(&self, first: u64, count: u64) -> XhResult<Vec<u8>> {
        XhSession::read_frames(self, first, count).await
    }

    async fn stop_timing(&self) -> XhResult<()> {
        XhSession::stop_timing(self).await
    }

    fn layout(&self) -> FrameLayout {
        self.frame_layout()
    }

    fn trigger_mode(&self) -> TriggerMode {
        XhSession::trigger_mode(self)
    }

    fn frames_to_collect(&self) -> u64 {
        XhSession::frames_to_collect(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn config() -> XhConfig {
        XhConfig::new("localhost", 1972)
    }

    fn session_pair() -> (XhSession, DuplexStream) {
        let (host, server) = tokio::io::duplex(4096);
        let session = XhSession::with_client(config(), XhClient::with_stream(host));
        session.state.lock().open_handle = Some(3);
        session.state.lock().npixels = 8;
        (session, server)
    }

    async fn read_line(server: &mut DuplexStream) -> String {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            server.read_exact(&mut byte).await.unwrap();
            if byte[0] == b'\n' {
                return String::from_utf8(line).unwrap();
            }
            line.push(byte[0]);
        }
    }

    #[tokio::test]
    async fn prepare_rejects_uneven_groups_before_io() {
        let session = XhSession::new(config());
        session.set_exposure(10.0).unwrap();
        session.set_nb_frames(10);
        session.set_nb_groups(3).unwrap();

        let err = session.prepare_acquisition().await.unwrap_err();
        match err {
            XhError::Configuration(msg) => assert!(msg.contains("multiple of number of groups")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn prepare_checks_groups_with_default_exposure() {
        // Not connected: any device command would fail with NotConnected
        let session = XhSession::new(config());
        session.set_nb_frames(10);
        session.set_nb_groups(3).unwrap();
        assert!(matches!(
            session.prepare_acquisition().await,
            Err(XhError::Configuration(msg)) if msg.contains("multiple of number of groups")
        ));

        session.set_nb_groups(0).unwrap();
        assert!(matches!(
            session.prepare_acquisition().await,
            Err(XhError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn prepare_rejects_zero_groups() {
        let session = XhSession::new(config());
        session.set_exposure(1.0).unwrap();
        session.set_nb_groups(0).unwrap();
        assert!(matches!(
            session.prepare_acquisition().await,
            Err(XhError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn prepare_programs_each_group() {
        let (session, mut server) = session_pair();
        session.set_timing_parameters(TimingParameters::default());
        session.set_exposure(50.5).unwrap();
        session.set_nb_frames(4);
        session.set_nb_groups(2).unwrap();

        let server_task = tokio::spawn(async move {
            server.write_all(b"> ").await.unwrap();
            let ext = read_line(&mut server).await;
            server.write_all(b"> ").await.unwrap();
            let g0 = read_line(&mut server).await;
            server.write_all(b"* 2\n> ").await.unwrap();
            let g1 = read_line(&mut server).await;
            server.write_all(b"* 4\n> ").await.unwrap();
            (ext, g0, g1, server)
        });

        session.prepare_acquisition().await.unwrap();
        let (ext, g0, g1, _server) = server_task.await.unwrap();

        assert_eq!(ext, "xstrip timing ext-output 'xh0' -1 integration");
        assert_eq!(
            g0,
            "xstrip timing setup-group 'xh0' 0 2 1 51 lemo-out 65535 s2-delay 2"
        );
        assert_eq!(
            g1,
            "xstrip timing setup-group 'xh0' 1 2 1 51 lemo-out 65535 s2-delay 2 last"
        );
        assert_eq!(session.frames_to_collect(), 4);
        assert_eq!(session.trigger_mode(), TriggerMode::IntTrig);
    }

    #[tokio::test]
    async fn software_mux_selects_int_trig_mult() {
        let (session, mut server) = session_pair();
        session.set_trig_mux(SOFTWARE_TRIG_MUX);

        let server_task = tokio::spawn(async move {
            server.write_all(b"> ").await.unwrap();
            let cmd = read_line(&mut server).await;
            server.write_all(b"* 5\n").await.unwrap();
            (cmd, server)
        });
        let programmed = session.set_timing_group(0, 5, 1, 100, true).await.unwrap();
        let (cmd, _server) = server_task.await.unwrap();

        assert_eq!(programmed, 5);
        assert!(!cmd.contains("trig-mux"));
        assert_eq!(session.trigger_mode(), TriggerMode::IntTrigMult);
    }

    #[tokio::test]
    async fn negative_group_count_is_device_error() {
        let (session, mut server) = session_pair();
        server.write_all(b"> ! too many frames\n* -1\n").await.unwrap();

        let err = session.set_timing_group(0, 5, 1, 100, true).await.unwrap_err();
        match err {
            XhError::Device(msg) => assert!(msg.contains("too many frames")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn read_status_parses_reply() {
        let (session, mut server) = session_pair();
        server
            .write_all(b"> * \"Paused at frame: group=0, frame=1, scan=0, cycle=0, completed frames=1\"\n")
            .await
            .unwrap();

        let status = session.read_status().await.unwrap();
        assert_eq!(status.state, crate::status::AcqState::PausedAtFrame);
        assert_eq!(status.completed_frames, 1);
    }

    #[test]
    fn exposure_time_mode_converts_cycles() {
        let session = XhSession::new(config());
        session.set_time_mode(true);
        session.set_exposure(1e-6).unwrap();
        assert!((session.exposure_cycles() - 50.0).abs() < 1e-9);
        assert!((session.exposure() - 1e-6).abs() < 1e-15);

        session.set_time_mode(false);
        session.set_exposure(12.0).unwrap();
        assert_eq!(session.exposure_cycles(), 12.0);

        assert!(session.set_exposure(-1.0).is_err());
        assert!(session.set_exposure(100.0).is_err());
    }

    #[test]
    fn trigger_modes_and_validation() {
        let session = XhSession::new(config());
        assert!(session.set_trigger_mode(TriggerMode::ExtGate).is_err());
        session.set_trigger_mode(TriggerMode::ExtTrigMult).unwrap();
        assert!(session.set_latency(0.1).is_err());
        session.set_latency(0.0).unwrap();
        assert!(session.set_nb_groups(1024).is_err());
        session.set_nb_groups(1023).unwrap();
        assert!(session.set_orbit_trigger(4).is_err());
        session.set_orbit_trigger(3).unwrap();
    }

    #[test]
    fn trig_level_modes_select_flags() {
        let session = XhSession::new(config());
        session.set_trig_level_mode(TriggerLevel::Frame, 1).unwrap();
        assert_eq!(session.custom_trigger(), "frame_trigger");

        session.set_trig_level_mode(TriggerLevel::Scan, 2).unwrap();
        assert_eq!(session.custom_trigger(), "scan_orbit");
        assert_eq!(session.orbit_trigger(), ORBIT_MODE_MUX);

        assert!(session.set_trig_level_mode(TriggerLevel::Group, 3).is_err());
        assert!(session.set_custom_trigger("bogus").is_err());
    }

    #[test]
    fn timing_parameters_merge_json() {
        let session = XhSession::new(config());
        let updated = session
            .update_timing_parameters(&serde_json::json!({ "frame_delay": 12, "cycles_end": true }))
            .unwrap();
        assert_eq!(updated.frame_delay, 12);
        assert!(updated.cycles_end);
        assert_eq!(session.timing_parameters().aux_width, 1);

        assert!(session
            .update_timing_parameters(&serde_json::json!({ "bogus": 1 }))
            .is_err());
        assert!(session
            .update_timing_parameters(&serde_json::json!({ "frame_delay": "soon" }))
            .is_err());
        assert_eq!(session.timing_parameters().frame_delay, 12);
    }

    #[test]
    fn roi_and_bin_checks() {
        let session = XhSession::new(config());
        session.state.lock().npixels = 100;

        let roi = session.check_roi(Roi::new(10, 0, 20, 1)).unwrap();
        assert_eq!(roi, Roi::new(10, 0, 20, 0));
        assert!(session.check_roi(Roi::new(0, 1, 10, 1)).is_err());
        assert!(session.check_roi(Roi::new(90, 0, 20, 1)).is_err());

        assert_eq!(session.check_bin(Bin::new(4, 8)), Bin::new(4, 1));
        assert_eq!(session.check_bin(Bin::new(0, 1)), Bin::new(1, 1));
    }
}

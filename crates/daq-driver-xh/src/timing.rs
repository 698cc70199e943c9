//! Timing-group parameters and the `setup-group` command builder.
//!
//! A timing group is a block of frames and scans that share one trigger and
//! delay configuration. The server takes the whole configuration as keyword
//! clauses on a single `xstrip timing setup-group` line; only values that
//! differ from the documented default are written, in a fixed order.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt::Write;

/// Trigger and orbit selection flags for timing groups.
///
/// Serialized as the raw bit mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TriggerControl(u32);

bitflags! {
    impl TriggerControl: u32 {
        /// Free running
        const NO_TRIGGER = 0;
        /// External trigger starts each group
        const GROUP_TRIGGER = 0x01;
        /// External trigger starts each frame
        const FRAME_TRIGGER = 0x02;
        /// External trigger starts each scan
        const SCAN_TRIGGER = 0x04;
        /// Orbit signal starts each group
        const GROUP_ORBIT = 0x08;
        /// Orbit signal starts each frame
        const FRAME_ORBIT = 0x10;
        /// Orbit signal starts each scan
        const SCAN_ORBIT = 0x20;
        /// Trigger on the falling edge
        const FALLING_TRIGGER = 0x40;

        /// Any external trigger
        const ANY_TRIGGER = Self::GROUP_TRIGGER.bits()
            | Self::FRAME_TRIGGER.bits()
            | Self::SCAN_TRIGGER.bits();
        /// Any orbit start
        const ANY_ORBIT = Self::GROUP_ORBIT.bits()
            | Self::FRAME_ORBIT.bits()
            | Self::SCAN_ORBIT.bits();
    }
}

impl TriggerControl {
    /// True when any external trigger flag (group, frame or scan) is set.
    pub fn has_trigger(self) -> bool {
        self.intersects(Self::ANY_TRIGGER)
    }

    /// True when any orbit flag is set.
    pub fn has_orbit(self) -> bool {
        self.intersects(Self::ANY_ORBIT)
    }

    /// Look up a flag by its name in [`TRIGGER_NAMES`].
    pub fn from_name(name: &str) -> Option<Self> {
        TRIGGER_NAMES
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, flag)| *flag)
    }
}

/// Named trigger flags, in their stable enumeration order.
pub static TRIGGER_NAMES: &[(&str, TriggerControl)] = &[
    ("no_trigger", TriggerControl::NO_TRIGGER),
    ("group_trigger", TriggerControl::GROUP_TRIGGER),
    ("frame_trigger", TriggerControl::FRAME_TRIGGER),
    ("scan_trigger", TriggerControl::SCAN_TRIGGER),
    ("group_orbit", TriggerControl::GROUP_ORBIT),
    ("frame_orbit", TriggerControl::FRAME_ORBIT),
    ("scan_orbit", TriggerControl::SCAN_ORBIT),
    ("falling_trigger", TriggerControl::FALLING_TRIGGER),
];

/// Trigger multiplexer value selecting the internal software trigger
pub const SOFTWARE_TRIG_MUX: i32 = 9;

/// Parameters shared by every `setup-group` command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingParameters {
    /// Trigger and orbit flags
    pub trig_control: TriggerControl,
    /// Trigger input multiplexer (-1 = unset)
    pub trig_mux: i32,
    /// Orbit input multiplexer (-1 = unset)
    pub orbit_mux: i32,
    /// Lemo output bit patterns
    pub lemo_out: Vec<u32>,
    /// Compensate exposure rounding
    pub correct_rounding: bool,
    /// Delay before each group, in cycles
    pub group_delay: u32,
    /// Delay before each frame, in cycles
    pub frame_delay: u32,
    /// Scan period, in cycles
    pub scan_period: u32,
    /// Aux output delay
    pub aux_delay: u32,
    /// Aux output width
    pub aux_width: u32,
    /// Long S1 reset
    pub long_s1: u32,
    /// Frame time, in cycles
    pub frame_time: u32,
    /// Shift down
    pub shift_down: u32,
    /// First cycle of integration
    pub cycles_start: u32,
    /// Integrate up to the end of the cycle
    pub cycles_end: bool,
    /// S1 fine delay
    pub s1_delay: u32,
    /// S2 fine delay
    pub s2_delay: u32,
    /// XCLK fine delay
    pub xclk_delay: u32,
    /// Reset rising-edge fine delay
    pub rst_r_delay: u32,
    /// Reset falling-edge fine delay
    pub rst_f_delay: u32,
    /// Allow more frames than fit in memory
    pub allow_excess: bool,
}

impl Default for TimingParameters {
    fn default() -> Self {
        Self {
            trig_control: TriggerControl::NO_TRIGGER,
            trig_mux: -1,
            orbit_mux: -1,
            lemo_out: Vec::new(),
            correct_rounding: false,
            group_delay: 0,
            frame_delay: 0,
            scan_period: 0,
            aux_delay: 0,
            aux_width: 1,
            long_s1: 0,
            frame_time: 0,
            shift_down: 0,
            cycles_start: 1,
            cycles_end: false,
            s1_delay: 0,
            s2_delay: 0,
            xclk_delay: 0,
            rst_r_delay: 0,
            rst_f_delay: 0,
            allow_excess: false,
        }
    }
}

fn trigger_phrase(control: TriggerControl) -> &'static str {
    let g = control.contains(TriggerControl::GROUP_TRIGGER);
    let f = control.contains(TriggerControl::FRAME_TRIGGER);
    let s = control.contains(TriggerControl::SCAN_TRIGGER);
    match (g, f, s) {
        (false, false, false) => "",
        (true, false, false) => " ext-trig-group",
        (false, true, false) => " ext-trig-frame",
        (true, true, false) => " ext-trig-group ext-trig-frame",
        (false, false, true) => " ext-trig-scan",
        (false, true, true) => " ext-trig-frame ext-trig-scan",
        // Group+scan also arms the frame trigger on this hardware
        (true, _, true) => " ext-trig-group ext-trig-frame ext-trig-scan",
    }
}

fn orbit_phrase(control: TriggerControl) -> &'static str {
    let g = control.contains(TriggerControl::GROUP_ORBIT);
    let f = control.contains(TriggerControl::FRAME_ORBIT);
    let s = control.contains(TriggerControl::SCAN_ORBIT);
    match (g, f, s) {
        (false, false, false) => "",
        (true, false, false) => " orbit-group",
        (true, true, false) => " orbit-group orbit-frame",
        (true, true, true) => " orbit-group orbit-frame orbit-scan",
        (false, true, false) => " orbit-frame",
        (false, false, true) => " orbit-scan",
        (true, false, true) => " orbit-group orbit-scan",
        (false, true, true) => " orbit-frame orbit-scan",
    }
}

/// Build the `xstrip timing setup-group` command for one group.
pub fn setup_group_command(
    sys_name: &str,
    group: u32,
    frames: u32,
    scans: u32,
    cycles: u32,
    last: bool,
    params: &TimingParameters,
) -> String {
    let mut cmd = format!(
        "xstrip timing setup-group {} {} {} {} {}",
        sys_name, group, frames, scans, cycles
    );
    let control = params.trig_control;
    cmd.push_str(trigger_phrase(control));
    cmd.push_str(orbit_phrase(control));
    if control.contains(TriggerControl::FALLING_TRIGGER) {
        cmd.push_str(" trig-falling");
    }

    // write! into a String cannot fail
    if params.trig_mux != -1 && control.has_trigger() {
        let _ = write!(cmd, " trig-mux {}", params.trig_mux);
    }
    if params.orbit_mux != -1 {
        let _ = write!(cmd, " orbit-mux {}", params.orbit_mux);
    }
    if !params.lemo_out.is_empty() {
        cmd.push_str(" lemo-out");
        for lemo in &params.lemo_out {
            let _ = write!(cmd, " {}", lemo);
        }
    }
    if params.correct_rounding {
        cmd.push_str(" correct-rounding");
    }

    let numeric = [
        ("group-delay", params.group_delay, 0),
        ("frame-delay", params.frame_delay, 0),
        ("scan-period", params.scan_period, 0),
        ("aux-delay", params.aux_delay, 0),
        ("aux-width", params.aux_width, 1),
        ("long-s1", params.long_s1, 0),
        ("frame-time", params.frame_time, 0),
        ("shift-down", params.shift_down, 0),
        ("cycles-start", params.cycles_start, 1),
    ];
    for (keyword, value, default) in numeric {
        if value != default {
            let _ = write!(cmd, " {} {}", keyword, value);
        }
    }
    if params.cycles_end {
        cmd.push_str(" cycles-end");
    }

    let fine_delays = [
        ("s1-delay", params.s1_delay),
        ("s2-delay", params.s2_delay),
        ("xclk-delay", params.xclk_delay),
        ("rst-r-delay", params.rst_r_delay),
        ("rst-f-delay", params.rst_f_delay),
    ];
    for (keyword, value) in fine_delays {
        if value != 0 {
            let _ = write!(cmd, " {} {}", keyword, value);
        }
    }

    if params.allow_excess {
        cmd.push_str(" allow-excess");
    }
    if last {
        cmd.push_str(" last");
    }
    cmd
}

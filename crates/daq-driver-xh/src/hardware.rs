//! Typed arguments for the detector head, high-voltage and clock commands.

use serde::{Deserialize, Serialize};
use std::fmt::Write;

/// Supply polarity override for HV commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HvSign {
    /// Negative supply
    Neg,
    /// Positive supply
    Pos,
}

impl HvSign {
    fn keyword(self) -> &'static str {
        match self {
            HvSign::Neg => " neg",
            HvSign::Pos => " pos",
        }
    }
}

/// HV supply monitor read by `get-adc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HvMonitor {
    /// High-voltage output
    Hv,
    /// 12 V rail
    V12,
    /// 5 V rail
    V5,
}

/// HV supply enable mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HvMode {
    /// On, with over-temperature protection
    Auto,
    /// On, protection overridden
    ForcedOn,
    /// Off
    Off,
}

impl HvMode {
    fn keyword(self) -> &'static str {
        match self {
            HvMode::Auto => "auto",
            HvMode::ForcedOn => "forced-on",
            HvMode::Off => "off",
        }
    }
}

/// Head supply addressed by head DAC/ADC commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeadVoltage {
    /// Digital supply
    Vdd,
    /// Reference
    Vref,
    /// Reference, comparator
    Vrefc,
    /// Reset level 1
    Vres1,
    /// Reset level 2
    Vres2,
    /// Pull-up reference
    Vpupref,
    /// Clamp
    Vclamp,
    /// Calibration LED
    Vled,
}

impl HeadVoltage {
    fn keyword(self) -> &'static str {
        match self {
            HeadVoltage::Vdd => "vdd",
            HeadVoltage::Vref => "vref",
            HeadVoltage::Vrefc => "vrefc",
            HeadVoltage::Vres1 => "vres1",
            HeadVoltage::Vres2 => "vres2",
            HeadVoltage::Vpupref => "vpupref",
            HeadVoltage::Vclamp => "vclamp",
            HeadVoltage::Vled => "vled",
        }
    }
}

/// Signal routed to an external trigger output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerOutput {
    /// Static level
    Dc,
    /// High for the whole group
    WholeGroup,
    /// Before the group delay
    GroupPreDelay,
    /// After the group delay
    GroupPostDelay,
    /// Before the frame delay
    FramePreDelay,
    /// After the frame delay
    FramePostDelay,
    /// Before the scan delay
    ScanPreDelay,
    /// After the scan delay
    ScanPostDelay,
    /// During integration
    Integration,
    /// Aux pulse
    Aux1,
    /// Waiting for an external trigger
    WaitingTrigger,
    /// Waiting for orbit sync
    WaitingOrbit,
}

impl TriggerOutput {
    fn keyword(self) -> &'static str {
        match self {
            TriggerOutput::Dc => "dc",
            TriggerOutput::WholeGroup => "whole-group",
            TriggerOutput::GroupPreDelay => "group-pre-delay",
            TriggerOutput::GroupPostDelay => "group-post-delay",
            TriggerOutput::FramePreDelay => "frame-pre-delay",
            TriggerOutput::FramePostDelay => "frame-post-delay",
            TriggerOutput::ScanPreDelay => "scan-pre-delay",
            TriggerOutput::ScanPostDelay => "scan-post-delay",
            TriggerOutput::Integration => "integration",
            TriggerOutput::Aux1 => "aux1",
            TriggerOutput::WaitingTrigger => "waiting-trig",
            TriggerOutput::WaitingOrbit => "waiting orbit",
        }
    }
}

/// ADC clock source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockMode {
    /// On-board oscillator
    #[default]
    Internal,
    /// ESRF 54.68 MHz RF clock
    Esrf5468,
    /// ESRF 11.36 MHz RF clock
    Esrf1136,
}

/// Optional PLL and filter settings for `clock setup`; zero leaves a value unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockOptions {
    /// PLL charge pump gain 0..=3
    pub pll_gain: u32,
    /// Extra divide in R and N
    pub extra_div: u32,
    /// Low pass filter capacitance 0..=1
    pub caps: u32,
    /// Low pass filter R3 0..=4
    pub r3: u32,
    /// Low pass filter R4 0..=4
    pub r4: u32,
    /// Stage 1 only
    pub stage1: bool,
    /// Skip the lock check
    pub no_check: bool,
}

/// Capacitor values accepted by `set-xchip-caps`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailableCaps {
    /// Capacitance codes
    pub values: Vec<i32>,
    /// Whether CD caps can differ from AB
    pub alternate_cd: bool,
}

impl AvailableCaps {
    /// Parse a `list-caps` reply such as `"2 5 7 10 alternate-cd=1"`.
    pub fn parse(reply: &str) -> Self {
        let mut values = Vec::new();
        let mut alternate_cd = false;
        for token in reply.split_whitespace() {
            if let Some(flag) = token.strip_prefix("alternate-cd=") {
                alternate_cd = flag.trim() != "0";
            } else if let Ok(value) = token.parse() {
                values.push(value);
            }
        }
        Self {
            values,
            alternate_cd,
        }
    }
}

fn head_suffix(cmd: &mut String, head: Option<u32>) {
    if let Some(head) = head {
        let _ = write!(cmd, " head {}", head);
    }
}

pub(crate) fn hv_set_dac(sys: &str, value: f64, noslew: bool, sign: Option<HvSign>, direct: bool) -> String {
    let mut cmd = format!("xstrip hv set-dac {} {}", sys, value);
    if noslew {
        cmd.push_str(" noslew");
    }
    if direct {
        cmd.push_str(" direct");
    }
    if let Some(sign) = sign {
        cmd.push_str(sign.keyword());
    }
    cmd
}

pub(crate) fn hv_get_adc(
    sys: &str,
    monitor: Option<HvMonitor>,
    sign: Option<HvSign>,
    direct: bool,
) -> String {
    let mut cmd = format!("xstrip hv get-adc {}", sys);
    if direct {
        cmd.push_str(" direct");
    }
    if let Some(sign) = sign {
        cmd.push_str(sign.keyword());
    }
    match monitor {
        Some(HvMonitor::Hv) => cmd.push_str(" hv"),
        Some(HvMonitor::V12) => cmd.push_str(" v12"),
        Some(HvMonitor::V5) => cmd.push_str(" v5"),
        None => {}
    }
    cmd
}

pub(crate) fn hv_enable(sys: &str, mode: HvMode) -> String {
    format!("xstrip hv enable {} {}", sys, mode.keyword())
}

pub(crate) fn head_set_dac(
    sys: &str,
    value: f64,
    voltage: HeadVoltage,
    head: Option<u32>,
    direct: bool,
) -> String {
    let mut cmd = format!("xstrip head set-dac {} {} {}", sys, value, voltage.keyword());
    head_suffix(&mut cmd, head);
    if direct {
        cmd.push_str(" direct");
    }
    cmd
}

pub(crate) fn head_get_adc(sys: &str, head: u32, voltage: HeadVoltage) -> String {
    format!("xstrip head get-adc {} {} {}", sys, head, voltage.keyword())
}

pub(crate) fn head_set_caps(sys: &str, caps_ab: i32, caps_cd: i32, head: Option<u32>) -> String {
    let mut cmd = format!("xstrip head set-xchip-caps {} {} {}", sys, caps_ab, caps_cd);
    head_suffix(&mut cmd, head);
    cmd
}

pub(crate) fn head_set_cal_en(sys: &str, on: bool, head: Option<u32>) -> String {
    let mut cmd = format!("xstrip head set-cal-en {} {}", sys, u8::from(on));
    head_suffix(&mut cmd, head);
    cmd
}

pub(crate) fn ext_output(sys: &str, output: i32, kind: TriggerOutput, width: u32, invert: bool) -> String {
    let mut cmd = format!("xstrip timing ext-output {} {} {}", sys, output, kind.keyword());
    if width > 0 {
        let _ = write!(cmd, " width {}", width);
    }
    if invert {
        cmd.push_str(" invert");
    }
    cmd
}

pub(crate) fn modify_group(
    sys: &str,
    group: u32,
    last: bool,
    allow_excess: bool,
    fixed_reset: Option<u32>,
) -> String {
    let mut cmd = format!("xstrip timing modify-group {} {}", sys, group);
    if last {
        cmd.push_str(" last");
    }
    if allow_excess {
        cmd.push_str(" allow-excess");
    }
    if let Some(fixed) = fixed_reset {
        let _ = write!(cmd, " fixed-rst-s1 {}", fixed);
    }
    cmd
}

pub(crate) fn clock_setup(sys: &str, mode: ClockMode, opts: &ClockOptions) -> String {
    let mut cmd = format!("xstrip clock setup {}", sys);
    match mode {
        ClockMode::Internal => {}
        ClockMode::Esrf5468 => cmd.push_str(" esrf"),
        ClockMode::Esrf1136 => cmd.push_str(" esrf11"),
    }
    if opts.stage1 {
        cmd.push_str(" stage1");
    }
    if opts.no_check {
        cmd.push_str(" no-check");
    }
    let tuning = [
        ("pll-gain", opts.pll_gain),
        ("extra-div", opts.extra_div),
        ("caps", opts.caps),
        ("r3", opts.r3),
        ("r4", opts.r4),
    ];
    for (keyword, value) in tuning {
        if value > 0 {
            let _ = write!(cmd, " {} {}", keyword, value);
        }
    }
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;

    const SYS: &str = "'xh0'";

    #[test]
    fn hv_commands() {
        assert_eq!(
            hv_set_dac(SYS, -90.0, true, Some(HvSign::Neg), false),
            "xstrip hv set-dac 'xh0' -90 noslew neg"
        );
        assert_eq!(
            hv_get_adc(SYS, Some(HvMonitor::V12), None, true),
            "xstrip hv get-adc 'xh0' direct v12"
        );
        assert_eq!(hv_enable(SYS, HvMode::ForcedOn), "xstrip hv enable 'xh0' forced-on");
    }

    #[test]
    fn head_commands() {
        assert_eq!(
            head_set_dac(SYS, 1.5, HeadVoltage::Vres1, Some(0), true),
            "xstrip head set-dac 'xh0' 1.5 vres1 head 0 direct"
        );
        assert_eq!(
            head_get_adc(SYS, 1, HeadVoltage::Vled),
            "xstrip head get-adc 'xh0' 1 vled"
        );
        assert_eq!(
            head_set_cal_en(SYS, true, None),
            "xstrip head set-cal-en 'xh0' 1"
        );
    }

    #[test]
    fn timing_and_clock_commands() {
        assert_eq!(
            ext_output(SYS, -1, TriggerOutput::Integration, 0, false),
            "xstrip timing ext-output 'xh0' -1 integration"
        );
        assert_eq!(
            ext_output(SYS, 2, TriggerOutput::WaitingOrbit, 10, true),
            "xstrip timing ext-output 'xh0' 2 waiting orbit width 10 invert"
        );
        assert_eq!(
            modify_group(SYS, 3, true, false, Some(12)),
            "xstrip timing modify-group 'xh0' 3 last fixed-rst-s1 12"
        );
        let opts = ClockOptions {
            pll_gain: 2,
            no_check: true,
            ..ClockOptions::default()
        };
        assert_eq!(
            clock_setup(SYS, ClockMode::Esrf1136, &opts),
            "xstrip clock setup 'xh0' esrf11 no-check pll-gain 2"
        );
    }

    #[test]
    fn parses_cap_list() {
        let caps = AvailableCaps::parse("2 5 7 10 12 alternate-cd=1");
        assert_eq!(caps.values, vec![2, 5, 7, 10, 12]);
        assert!(caps.alternate_cd);

        let caps = AvailableCaps::parse("3 6 alternate-cd=0");
        assert_eq!(caps.values, vec![3, 6]);
        assert!(!caps.alternate_cd);
    }
}

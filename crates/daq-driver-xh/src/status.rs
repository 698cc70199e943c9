//! Parser for `xstrip timing read-status` replies.
//!
//! The server answers with a single string such as
//!
//! ```text
//! Running: group=0, frame=3, scan=0, cycle=12, completed frames=3
//! ```
//!
//! The state name comes before the colon. It is followed by five
//! comma-separated `name=value` fields in a fixed order.

use crate::error::{XhError, XhResult};
use std::str::FromStr;

/// Timing generator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcqState {
    /// Not running
    Idle,
    /// Waiting for a group trigger
    PausedAtGroup,
    /// Waiting for a frame trigger
    PausedAtFrame,
    /// Waiting for a scan trigger
    PausedAtScan,
    /// Integrating or reading out
    Running,
}

impl AcqState {
    /// True for every paused state.
    pub fn is_paused(self) -> bool {
        matches!(
            self,
            AcqState::PausedAtGroup | AcqState::PausedAtFrame | AcqState::PausedAtScan
        )
    }

    /// The label may carry a short prefix before the state name.
    fn from_label(label: &str) -> Self {
        let label = label.trim();
        if label.ends_with("Idle") {
            AcqState::Idle
        } else if label.ends_with("Paused at frame") {
            AcqState::PausedAtFrame
        } else if label.ends_with("Paused at group") {
            AcqState::PausedAtGroup
        } else if label.ends_with("Paused at scan") {
            AcqState::PausedAtScan
        } else {
            AcqState::Running
        }
    }
}

/// One snapshot of the timing generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XhStatus {
    /// Generator state
    pub state: AcqState,
    /// Current group
    pub group_num: u32,
    /// Current frame within the group
    pub frame_num: u32,
    /// Current scan within the frame
    pub scan_num: u32,
    /// Cycle counter
    pub cycle: u32,
    /// Frames completed since timing start
    pub completed_frames: u32,
}

impl XhStatus {
    /// Status of a generator that has not started.
    pub fn idle() -> Self {
        Self {
            state: AcqState::Idle,
            group_num: 0,
            frame_num: 0,
            scan_num: 0,
            cycle: 0,
            completed_frames: 0,
        }
    }
}

impl FromStr for XhStatus {
    type Err = XhError;

    fn from_str(reply: &str) -> XhResult<Self> {
        let (label, fields) = reply
            .split_once(':')
            .ok_or_else(|| XhError::Protocol(format!("status without state: '{}'", reply)))?;

        let mut values = fields.split(',').map(|field| {
            let (_, value) = field.split_once('=').ok_or_else(|| {
                XhError::Protocol(format!("status field without value: '{}'", field.trim()))
            })?;
            let value = value.trim_start();
            let digits = value.bytes().take_while(u8::is_ascii_digit).count();
            value[..digits].parse::<u32>().map_err(|_| {
                XhError::Protocol(format!("non-numeric status field: '{}'", field.trim()))
            })
        });
        let mut next = |name: &str| -> XhResult<u32> {
            values
                .next()
                .unwrap_or_else(|| Err(XhError::Protocol(format!("status is missing {}", name))))
        };

        Ok(Self {
            state: AcqState::from_label(label),
            group_num: next("group")?,
            frame_num: next("frame")?,
            scan_num: next("scan")?,
            cycle: next("cycle")?,
            completed_frames: next("completed frames")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_running_status() {
        let status: XhStatus = "Running: group=1, frame=3, scan=0, cycle=12, completed frames=7"
            .parse()
            .unwrap();
        assert_eq!(status.state, AcqState::Running);
        assert_eq!(status.group_num, 1);
        assert_eq!(status.frame_num, 3);
        assert_eq!(status.cycle, 12);
        assert_eq!(status.completed_frames, 7);
    }

    #[test]
    fn parses_state_labels() {
        let parse = |label: &str| {
            format!("{label}: group=0, frame=0, scan=0, cycle=0, completed frames=0")
                .parse::<XhStatus>()
                .unwrap()
                .state
        };
        assert_eq!(parse("Idle"), AcqState::Idle);
        assert_eq!(parse("Paused at group"), AcqState::PausedAtGroup);
        assert_eq!(parse("Paused at frame"), AcqState::PausedAtFrame);
        assert_eq!(parse("Paused at scan"), AcqState::PausedAtScan);
        assert_eq!(parse("Waiting for trigger"), AcqState::Running);
        assert_eq!(parse("  Idle"), AcqState::Idle);
        assert!(AcqState::PausedAtScan.is_paused());
    }

    #[test]
    fn rejects_missing_fields() {
        let err = "Idle: group=0, frame=0".parse::<XhStatus>().unwrap_err();
        assert!(matches!(err, XhError::Protocol(_)));

        let err = "Idle".parse::<XhStatus>().unwrap_err();
        assert!(matches!(err, XhError::Protocol(_)));

        let err = "Idle: group=0, frame=x, scan=0, cycle=0, completed frames=0"
            .parse::<XhStatus>()
            .unwrap_err();
        assert!(matches!(err, XhError::Protocol(_)));
    }
}

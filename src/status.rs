//! Status word decoding for GCS 3.0 container units.
//!
//! Axis status word layout:
//!
//! | bits  | field |
//! |-------|-------|
//! | 0..8  | drive state machine (DSM) |
//! | 8..16 | mode of operation (MOP) |
//! | 16    | closed loop |
//! | 17    | on target |
//! | 18    | in motion |
//! | 19    | referenced |
//! | 20    | internal process running |
//! | 21    | positive limit active |
//! | 22    | negative limit active |
//!
//! Bit 0 doubles as the error flag and bit 1 as the enable flag.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DriveState {
    ReadyToSwitchOn,
    Fault,
    OperationEnabled,
    FaultReactionActive,
    QuickStopActive,
    /// Reserved value, kept as is.
    Unknown(u8),
}

impl DriveState {
    pub const NAMED: [Self; 5] = [
        Self::ReadyToSwitchOn,
        Self::Fault,
        Self::OperationEnabled,
        Self::FaultReactionActive,
        Self::QuickStopActive,
    ];

    #[must_use]
    pub const fn from_raw(v: u8) -> Self {
        match v {
            0 => Self::ReadyToSwitchOn,
            1 => Self::Fault,
            2 => Self::OperationEnabled,
            3 => Self::FaultReactionActive,
            6 => Self::QuickStopActive,
            other => Self::Unknown(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ModeOfOperation {
    Open,
    OpenLoopPosition,
    ClosedLoopPosition,
    OpenLoopVelocity,
    ClosedLoopVelocity,
    OpenLoopForce,
    ClosedLoopForce,
    StepOperation,
    Unknown(u8),
}

impl ModeOfOperation {
    pub const NAMED: [Self; 8] = [
        Self::Open,
        Self::OpenLoopPosition,
        Self::ClosedLoopPosition,
        Self::OpenLoopVelocity,
        Self::ClosedLoopVelocity,
        Self::OpenLoopForce,
        Self::ClosedLoopForce,
        Self::StepOperation,
    ];

    #[must_use]
    pub const fn from_raw(v: u8) -> Self {
        match v {
            0 => Self::Open,
            1 => Self::OpenLoopPosition,
            2 => Self::ClosedLoopPosition,
            3 => Self::OpenLoopVelocity,
            4 => Self::ClosedLoopVelocity,
            5 => Self::OpenLoopForce,
            6 => Self::ClosedLoopForce,
            7 => Self::StepOperation,
            other => Self::Unknown(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct AxisStatus {
    pub word: u32,
    pub error: bool,
    pub enabled: bool,
    pub drive_state: DriveState,
    pub drive_state_raw: u8,
    pub mode: ModeOfOperation,
    pub mode_raw: u8,
    pub closed_loop: bool,
    pub on_target: bool,
    pub in_motion: bool,
    pub referenced: bool,
    pub internal_process_running: bool,
    pub positive_limit: bool,
    pub negative_limit: bool,
}

impl AxisStatus {
    /// One flag per named drive state; at most one is set.
    #[must_use]
    pub fn drive_state_flags(&self) -> [(DriveState, bool); 5] {
        DriveState::NAMED.map(|s| (s, s == self.drive_state))
    }

    #[must_use]
    pub fn mode_flags(&self) -> [(ModeOfOperation, bool); 8] {
        ModeOfOperation::NAMED.map(|m| (m, m == self.mode))
    }
}

const fn bit(word: u32, n: u32) -> bool {
    (word >> n) & 1 == 1
}

/// Decode an axis status word. Never fails.
#[must_use]
pub const fn decode_axis_status(word: u32) -> AxisStatus {
    let dsm = (word & 0xFF) as u8;
    let mop = ((word >> 8) & 0xFF) as u8;
    AxisStatus {
        word,
        error: bit(word, 0),
        enabled: bit(word, 1),
        drive_state: DriveState::from_raw(dsm),
        drive_state_raw: dsm,
        mode: ModeOfOperation::from_raw(mop),
        mode_raw: mop,
        closed_loop: bit(word, 16),
        on_target: bit(word, 17),
        in_motion: bit(word, 18),
        referenced: bit(word, 19),
        internal_process_running: bit(word, 20),
        positive_limit: bit(word, 21),
        negative_limit: bit(word, 22),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SystemStatus {
    pub word: u32,
    pub command_error: bool,
    pub critical_error: bool,
    pub information: bool,
    pub warning: bool,
}

#[must_use]
pub const fn decode_system_status(word: u32) -> SystemStatus {
    SystemStatus {
        word,
        command_error: bit(word, 0),
        critical_error: bit(word, 1),
        information: bit(word, 2),
        warning: bit(word, 3),
    }
}

/// Status of one container unit as reported by `STV?`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UnitStatus {
    Axis(AxisStatus),
    System(SystemStatus),
    Raw(u32),
}

impl UnitStatus {
    #[must_use]
    pub const fn axis(&self) -> Option<&AxisStatus> {
        match self {
            Self::Axis(a) => Some(a),
            _ => None,
        }
    }
}

/// Pick the layout from the container unit name (`AXIS_1`, `SYS_1`, ...).
#[must_use]
pub fn decode_unit_status(unit: &str, word: u32) -> UnitStatus {
    let upper = unit.to_ascii_uppercase();
    if upper.contains("AXIS") {
        UnitStatus::Axis(decode_axis_status(word))
    } else if upper.starts_with("SYS") {
        UnitStatus::System(decode_system_status(word))
    } else {
        UnitStatus::Raw(word)
    }
}

//! Servo calibration state.
//!
//! The robot reports its 16 servo offsets in response to the `c` command.
//! The table lives on the link session and survives reconnects; hosts may
//! persist it through [`crate::domain::settings::SettingsService`].

use std::ops::RangeInclusive;

/// Number of servos on the robot.
pub const MOTOR_COUNT: usize = 16;

/// Largest single fine-adjust step, in degrees.
pub const MAX_ADJUST_STEP: i32 = 9;

/// Servos whose offset can be tuned: the head pan servo and the eight leg servos.
pub const CALIBRATABLE_SERVOS: [usize; 9] = [0, 8, 9, 10, 11, 12, 13, 14, 15];

/// Marker stored for an offset the robot reported but that could not be parsed.
pub const UNPARSEABLE_ANGLE: i32 = 0xFF;

// Servo index header rows the firmware prints before the offsets.
const INDEX_HEADER: &str = "c0,1,2,3,4,5,6,7,8,9,10,11,12,13,14,15,";
const INDEX_HEADER_PADDED: &str = "c0,0,0,1,2,3,4,5,6,7,8,9,10,11,12,13,14,15,";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MotorAngleTable([i32; MOTOR_COUNT]);

impl MotorAngleTable {
    pub fn get(&self, index: usize) -> Option<i32> {
        self.0.get(index).copied()
    }

    pub fn set(&mut self, index: usize, angle: i32) -> Option<()> {
        let slot = self.0.get_mut(index)?;
        *slot = angle;
        Some(())
    }

    pub fn to_array(&self) -> [i32; MOTOR_COUNT] {
        self.0
    }

    pub fn iter(&self) -> impl Iterator<Item = i32> + '_ {
        self.0.iter().copied()
    }
}

impl From<[i32; MOTOR_COUNT]> for MotorAngleTable {
    fn from(angles: [i32; MOTOR_COUNT]) -> Self {
        Self(angles)
    }
}

pub fn is_calibratable(servo: usize) -> bool {
    CALIBRATABLE_SERVOS.contains(&servo)
}

pub fn adjust_range() -> RangeInclusive<i32> {
    -MAX_ADJUST_STEP..=MAX_ADJUST_STEP
}

/// Parse the offsets out of a frame answering the `c` command.
///
/// Returns `None` for the index header rows and for anything that does not
/// split into exactly 16 fields.
pub fn parse_calibration_report(frame: &str) -> Option<MotorAngleTable> {
    if frame == INDEX_HEADER || frame == INDEX_HEADER_PADDED {
        return None;
    }

    let fields: Vec<&str> = frame.split(',').filter(|f| !f.is_empty()).collect();
    if fields.len() != MOTOR_COUNT {
        return None;
    }

    let mut angles = [0; MOTOR_COUNT];
    for (slot, field) in angles.iter_mut().zip(fields) {
        *slot = field
            .replace('c', "")
            .trim()
            .parse()
            .unwrap_or(UNPARSEABLE_ANGLE);
    }
    Some(MotorAngleTable(angles))
}

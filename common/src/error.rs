use thiserror::Error;

use crate::types::Direction;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RequestError {
    #[error("target height is not a finite number")]
    NotFinite,
    #[error("target height {target_cm:.1}cm is outside {min_cm:.1}..={max_cm:.1}cm")]
    OutOfRange {
        target_cm: f32,
        min_cm: f32,
        max_cm: f32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MotionError {
    #[error("{output} output write failed: {detail}")]
    Output {
        output: &'static str,
        detail: String,
    },
    #[error("{direction:?} drive exceeded its {limit_ms}ms window")]
    DriveWindowExceeded { direction: Direction, limit_ms: u64 },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("min height {min_cm:.1}cm must be below max height {max_cm:.1}cm")]
    HeightRange { min_cm: f32, max_cm: f32 },
    #[error("sensor range {min_cm:.1}..{max_cm:.1}cm is empty")]
    SensorRange { min_cm: f32, max_cm: f32 },
    #[error("GPIO{pin} is assigned to both {first} and {second}")]
    PinConflict {
        pin: i32,
        first: &'static str,
        second: &'static str,
    },
    #[error("device id `{0}` is not a valid Homie topic id")]
    DeviceId(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("payload is not valid utf-8")]
    NotUtf8,
    #[error("payload of {0} bytes exceeds the limit")]
    Oversized(usize),
    #[error("`{0}` is not a height in centimeters")]
    InvalidHeight(String),
}

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Up => "UP",
            Self::Down => "DOWN",
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Self::Up => Self::Down,
            Self::Down => Self::Up,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DriveCommand {
    Up,
    Down,
    Stop,
}

impl DriveCommand {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Up => "UP",
            Self::Down => "DOWN",
            Self::Stop => "STOP",
        }
    }

    pub fn direction(self) -> Option<Direction> {
        match self {
            Self::Up => Some(Direction::Up),
            Self::Down => Some(Direction::Down),
            Self::Stop => None,
        }
    }
}

impl From<Direction> for DriveCommand {
    fn from(direction: Direction) -> Self {
        match direction {
            Direction::Up => Self::Up,
            Direction::Down => Self::Down,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlState {
    Idle,
    Seeking,
    Settling,
    Settled,
    Aborted,
}

impl ControlState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Seeking => "SEEKING",
            Self::Settling => "SETTLING",
            Self::Settled => "SETTLED",
            Self::Aborted => "ABORTED",
        }
    }

    pub fn is_active(self) -> bool {
        matches!(self, Self::Seeking | Self::Settling)
    }
}

/// One ultrasonic measurement. `distance_cm` is only meaningful when `valid`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeightSample {
    pub distance_cm: f32,
    pub timestamp_ms: u64,
    pub valid: bool,
}

impl HeightSample {
    pub fn valid(distance_cm: f32, timestamp_ms: u64) -> Self {
        Self {
            distance_cm,
            timestamp_ms,
            valid: true,
        }
    }

    pub fn invalid(timestamp_ms: u64) -> Self {
        Self {
            distance_cm: 0.0,
            timestamp_ms,
            valid: false,
        }
    }

    pub fn height_cm(&self) -> Option<f32> {
        self.valid.then_some(self.distance_cm)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeskStatePayload {
    pub state: &'static str,
    pub command: &'static str,
    #[serde(rename = "heightCm")]
    pub height_cm: Option<f32>,
    #[serde(rename = "targetCm")]
    pub target_cm: Option<f32>,
    #[serde(rename = "reverseToggles")]
    pub reverse_toggles: u32,
    #[serde(rename = "maxReverseToggles")]
    pub max_reverse_toggles: u32,
    #[serde(rename = "sensorValid")]
    pub sensor_valid: bool,
    #[serde(rename = "sessionMs")]
    pub session_ms: u64,
    #[serde(rename = "lastOutcome")]
    pub last_outcome: Option<&'static str>,
    #[serde(rename = "lastAbortReason")]
    pub last_abort_reason: Option<&'static str>,
}

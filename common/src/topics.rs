//! Homie topic layout for one desk and parsing of inbound commands.

use crate::error::CommandError;

pub const HOMIE_ROOT: &str = "homie";
pub const MAX_COMMAND_PAYLOAD_BYTES: usize = 256;

/// Fully qualified topics under `homie/<device_id>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeskTopics {
    pub device_state: String,
    pub height: String,
    pub state: String,
    pub outcome: String,
    pub target_set: String,
    pub abort_set: String,
    pub temperature: String,
    pub humidity: String,
}

impl DeskTopics {
    pub fn new(device_id: &str) -> Self {
        let base = format!("{HOMIE_ROOT}/{device_id}");
        Self {
            device_state: format!("{base}/$state"),
            height: format!("{base}/desk/height"),
            state: format!("{base}/desk/state"),
            outcome: format!("{base}/desk/outcome"),
            target_set: format!("{base}/desk/target/set"),
            abort_set: format!("{base}/desk/abort/set"),
            temperature: format!("{base}/climate/temperature"),
            humidity: format!("{base}/climate/humidity"),
        }
    }

    pub fn subscriptions(&self) -> [&str; 2] {
        [self.target_set.as_str(), self.abort_set.as_str()]
    }

    /// Classifies an inbound message. Topics this desk does not own yield `None`.
    pub fn parse_command(
        &self,
        topic: &str,
        payload: &[u8],
    ) -> Option<Result<DeskCommand, CommandError>> {
        if topic == self.target_set {
            Some(parse_height(payload).map(DeskCommand::SetHeight))
        } else if topic == self.abort_set {
            Some(Ok(DeskCommand::Abort))
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DeskCommand {
    SetHeight(f32),
    Abort,
}

/// Parses a plain-text height in centimeters, e.g. `"102.5"`.
pub fn parse_height(payload: &[u8]) -> Result<f32, CommandError> {
    if payload.len() > MAX_COMMAND_PAYLOAD_BYTES {
        return Err(CommandError::Oversized(payload.len()));
    }
    let text = core::str::from_utf8(payload).map_err(|_| CommandError::NotUtf8)?;
    let text = text.trim();
    text.parse::<f32>()
        .ok()
        .filter(|value| value.is_finite())
        .ok_or_else(|| CommandError::InvalidHeight(text.to_string()))
}

pub fn height_payload(height_cm: f32) -> String {
    format!("{height_cm:.1}")
}

pub mod climate;
pub mod config;
pub mod control_loop;
pub mod controller;
pub mod error;
pub mod events;
pub mod homie;
pub mod motion;
pub mod sampler;
pub mod topics;
pub mod types;

#[cfg(test)]
mod testing;

pub use climate::{ClimateReading, DhtModel};
pub use config::{ControlConfig, HardwareConfig, MotionConfig, RuntimeConfig, SamplerConfig};
pub use control_loop::DeskControlLoop;
pub use controller::{ControlStep, HeightController};
pub use error::{CommandError, ConfigError, MotionError, RequestError};
pub use events::{AbortReason, LifecycleEventSink, ReportBacklog, SessionOutcome, SessionReport};
pub use homie::{HomieEvent, HomieEventType, MqttDisconnectReason, WifiDisconnectReason};
pub use motion::MotionDriver;
pub use sampler::{DistanceSampler, EchoTimer, Now, PulseEchoTimer};
pub use topics::{DeskCommand, DeskTopics};
pub use types::{ControlState, DeskStatePayload, Direction, DriveCommand, HeightSample};

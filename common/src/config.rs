use serde::{Deserialize, Serialize};

use crate::{climate::DhtModel, error::ConfigError};

/// Round-trip speed of sound in air at ~20°C, in centimeters per microsecond.
pub const SPEED_OF_SOUND_CM_PER_US: f32 = 0.0343;

/// Pin assignments. Defaults follow the NodeMCU wiring (D6/D7 ultrasonic,
/// D5 DHT, D1/D2 optocouplers).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HardwareConfig {
    pub trigger_pin: i32,
    pub echo_pin: i32,
    pub dht_pin: i32,
    pub dht_model: DhtModel,
    pub up_pin: i32,
    pub down_pin: i32,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            trigger_pin: 12,
            echo_pin: 13,
            dht_pin: 14,
            dht_model: DhtModel::Dht22,
            up_pin: 5,
            down_pin: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SamplerConfig {
    pub trigger_pulse_us: u32,
    pub min_range_cm: f32,
    pub max_range_cm: f32,
    pub echo_timeout_margin_us: u32,
    pub mount_offset_cm: f32,
    pub filter_window: usize,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            trigger_pulse_us: 10,
            min_range_cm: 2.0,
            max_range_cm: 400.0,
            echo_timeout_margin_us: 2_000,
            mount_offset_cm: 0.0,
            filter_window: 3,
        }
    }
}

impl SamplerConfig {
    /// Longest echo worth waiting for: the round trip at maximum range plus margin.
    pub fn echo_timeout_us(&self) -> u32 {
        let round_trip_us = self.max_range_cm * 2.0 / SPEED_OF_SOUND_CM_PER_US;
        (round_trip_us.ceil() as u32).saturating_add(self.echo_timeout_margin_us)
    }

    pub fn sanitize(&mut self) {
        self.trigger_pulse_us = self.trigger_pulse_us.clamp(10, 100);
        self.min_range_cm = self.min_range_cm.clamp(0.0, 50.0);
        self.max_range_cm = self.max_range_cm.clamp(50.0, 600.0);
        self.echo_timeout_margin_us = self.echo_timeout_margin_us.min(10_000);
        if !self.mount_offset_cm.is_finite() {
            self.mount_offset_cm = 0.0;
        }
        self.filter_window = self.filter_window.clamp(1, 15);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MotionConfig {
    pub reverse_dead_time_ms: u64,
    pub max_drive_ms: u64,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            reverse_dead_time_ms: 300,
            max_drive_ms: 30_000,
        }
    }
}

impl MotionConfig {
    pub fn sanitize(&mut self) {
        self.reverse_dead_time_ms = self.reverse_dead_time_ms.min(5_000);
        self.max_drive_ms = self.max_drive_ms.clamp(1_000, 120_000);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ControlConfig {
    /// Direction flips tolerated per session; one more aborts it.
    pub max_reverse_toggles: u32,
    pub deadband_cm: f32,
    pub settle_confirm_samples: u8,
    pub max_blind_ticks: u32,
    pub max_session_ms: u64,
    pub tick_interval_ms: u64,
    pub min_height_cm: f32,
    pub max_height_cm: f32,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            max_reverse_toggles: 3,
            deadband_cm: 1.0,
            settle_confirm_samples: 1,
            max_blind_ticks: 20,
            max_session_ms: 60_000,
            tick_interval_ms: 100,
            min_height_cm: 60.0,
            max_height_cm: 125.0,
        }
    }
}

impl ControlConfig {
    pub fn sanitize(&mut self) {
        self.max_reverse_toggles = self.max_reverse_toggles.min(20);
        self.deadband_cm = if self.deadband_cm.is_finite() {
            self.deadband_cm.clamp(0.2, 5.0)
        } else {
            1.0
        };
        self.settle_confirm_samples = self.settle_confirm_samples.min(10);
        self.max_blind_ticks = self.max_blind_ticks.clamp(1, 1_000);
        self.max_session_ms = self.max_session_ms.clamp(1_000, 300_000);
        self.tick_interval_ms = self.tick_interval_ms.clamp(20, 1_000);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClimateConfig {
    pub enabled: bool,
    pub publish_interval_ms: u64,
}

impl Default for ClimateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            publish_interval_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            mqtt_host: "192.168.1.100".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub device_id: String,
    pub hardware: HardwareConfig,
    pub sampler: SamplerConfig,
    pub motion: MotionConfig,
    pub control: ControlConfig,
    pub climate: ClimateConfig,
    pub network: NetworkConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            device_id: "standing-desk".to_string(),
            hardware: HardwareConfig::default(),
            sampler: SamplerConfig::default(),
            motion: MotionConfig::default(),
            control: ControlConfig::default(),
            climate: ClimateConfig::default(),
            network: NetworkConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.sampler.sanitize();
        self.motion.sanitize();
        self.control.sanitize();
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_valid_homie_id(&self.device_id) {
            return Err(ConfigError::DeviceId(self.device_id.clone()));
        }

        let control = &self.control;
        if !(control.min_height_cm.is_finite()
            && control.max_height_cm.is_finite()
            && control.min_height_cm < control.max_height_cm)
        {
            return Err(ConfigError::HeightRange {
                min_cm: control.min_height_cm,
                max_cm: control.max_height_cm,
            });
        }

        if self.sampler.min_range_cm >= self.sampler.max_range_cm {
            return Err(ConfigError::SensorRange {
                min_cm: self.sampler.min_range_cm,
                max_cm: self.sampler.max_range_cm,
            });
        }

        let hw = &self.hardware;
        let pins = [
            (hw.trigger_pin, "trigger"),
            (hw.echo_pin, "echo"),
            (hw.dht_pin, "dht"),
            (hw.up_pin, "up"),
            (hw.down_pin, "down"),
        ];
        for (index, (pin, first)) in pins.iter().enumerate() {
            if let Some((_, second)) = pins[index + 1..].iter().find(|(other, _)| other == pin) {
                return Err(ConfigError::PinConflict {
                    pin: *pin,
                    first: *first,
                    second: *second,
                });
            }
        }

        Ok(())
    }
}

fn is_valid_homie_id(id: &str) -> bool {
    !id.is_empty()
        && !id.starts_with('-')
        && id
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
}

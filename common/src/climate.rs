use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DhtModel {
    Dht11,
    /// AM2301
    Dht21,
    /// AM2302 / AM2321
    Dht22,
}

impl DhtModel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dht11 => "DHT11",
            Self::Dht21 => "DHT21",
            Self::Dht22 => "DHT22",
        }
    }

    /// Datasheet measuring range as `(celsius, relative humidity %)`.
    pub fn measuring_range(self) -> ((f32, f32), (f32, f32)) {
        match self {
            Self::Dht11 => ((0.0, 50.0), (20.0, 90.0)),
            Self::Dht21 | Self::Dht22 => ((-40.0, 80.0), (0.0, 100.0)),
        }
    }

    /// Minimum interval between two reads the part tolerates.
    pub fn min_read_interval_ms(self) -> u64 {
        match self {
            Self::Dht11 => 1_000,
            Self::Dht21 | Self::Dht22 => 2_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ClimateReading {
    #[serde(rename = "temperatureC")]
    pub temperature_c: f32,
    pub humidity: f32,
}

impl ClimateReading {
    /// Accepts a raw reading only when both values lie in the part's range.
    pub fn checked(model: DhtModel, temperature_c: f32, humidity: f32) -> Option<Self> {
        let ((t_min, t_max), (h_min, h_max)) = model.measuring_range();
        let temperature_ok = temperature_c.is_finite() && (t_min..=t_max).contains(&temperature_c);
        let humidity_ok = humidity.is_finite() && (h_min..=h_max).contains(&humidity);

        (temperature_ok && humidity_ok).then_some(Self {
            temperature_c,
            humidity,
        })
    }

    pub fn temperature_payload(&self) -> String {
        format!("{:.1}", self.temperature_c)
    }

    pub fn humidity_payload(&self) -> String {
        format!("{:.1}", self.humidity)
    }
}

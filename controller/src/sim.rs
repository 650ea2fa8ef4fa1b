//! Simulated desk mechanics for host builds.
//!
//! The plant answers echo pings with its current height and reacts to the
//! two motor outputs, so the real sampler, driver and controller run
//! unchanged against it.

use std::{
    convert::Infallible,
    sync::{Arc, Mutex},
};

use desk_common::{
    config::SPEED_OF_SOUND_CM_PER_US, ClimateReading, DhtModel, Direction, EchoTimer,
};
use embedded_hal::digital::{ErrorType, OutputPin};
use tracing::warn;

pub type Clock = Arc<dyn Fn() -> u64 + Send + Sync>;

#[derive(Debug, Clone)]
pub struct PlantParams {
    pub start_height_cm: f32,
    pub min_travel_cm: f32,
    pub max_travel_cm: f32,
    pub speed_cm_per_s: f32,
    /// Time the frame keeps moving after its output is released.
    pub coast_ms: u64,
    pub jitter_cm: f32,
    /// Every n-th ping gets no echo. Zero disables dropouts.
    pub dropout_every: u32,
    pub mount_offset_cm: f32,
}

impl Default for PlantParams {
    fn default() -> Self {
        Self {
            start_height_cm: 72.0,
            min_travel_cm: 62.0,
            max_travel_cm: 127.0,
            speed_cm_per_s: 3.5,
            coast_ms: 150,
            jitter_cm: 0.3,
            dropout_every: 25,
            mount_offset_cm: 0.0,
        }
    }
}

struct Plant {
    params: PlantParams,
    height_cm: f32,
    up: bool,
    down: bool,
    motion: Option<Direction>,
    coast_until_ms: Option<u64>,
    updated_ms: u64,
    pings: u32,
    noise: u32,
    interlock_faults: u32,
}

impl Plant {
    fn advance(&mut self, now_ms: u64) {
        let from_ms = self.updated_ms;
        self.updated_ms = self.updated_ms.max(now_ms);

        let Some(direction) = self.motion else {
            return;
        };
        let until_ms = self
            .coast_until_ms
            .map_or(now_ms, |coast_until| coast_until.min(now_ms));
        let moved_cm =
            self.params.speed_cm_per_s * until_ms.saturating_sub(from_ms) as f32 / 1_000.0;

        let height_cm = match direction {
            Direction::Up => self.height_cm + moved_cm,
            Direction::Down => self.height_cm - moved_cm,
        };
        self.height_cm = height_cm.clamp(self.params.min_travel_cm, self.params.max_travel_cm);

        if self.coast_until_ms.is_some_and(|coast_until| now_ms >= coast_until) {
            self.motion = None;
            self.coast_until_ms = None;
        }
    }

    fn set_output(&mut self, direction: Direction, high: bool, now_ms: u64) {
        self.advance(now_ms);
        match direction {
            Direction::Up => self.up = high,
            Direction::Down => self.down = high,
        }

        match (self.up, self.down) {
            (true, true) => {
                self.interlock_faults += 1;
                self.motion = None;
                self.coast_until_ms = None;
                warn!("simulated desk: both motor outputs asserted");
            }
            (true, false) => self.start(Direction::Up),
            (false, true) => self.start(Direction::Down),
            (false, false) => {
                if self.motion.is_some() && self.coast_until_ms.is_none() {
                    self.coast_until_ms = Some(now_ms + self.params.coast_ms);
                }
            }
        }
    }

    fn start(&mut self, direction: Direction) {
        self.motion = Some(direction);
        self.coast_until_ms = None;
    }

    /// Uniform noise in `[-1, 1]` from a small LCG.
    fn next_noise(&mut self) -> f32 {
        self.noise = self.noise.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        (self.noise >> 8) as f32 / (1u32 << 23) as f32 - 1.0
    }

    fn ping(&mut self, now_ms: u64) -> Option<f32> {
        self.advance(now_ms);
        self.pings = self.pings.wrapping_add(1);
        if self.params.dropout_every > 0 && self.pings % self.params.dropout_every == 0 {
            return None;
        }
        let jitter_cm = self.next_noise() * self.params.jitter_cm;
        Some(self.height_cm - self.params.mount_offset_cm + jitter_cm)
    }
}

#[derive(Clone)]
pub struct SimulatedDesk {
    plant: Arc<Mutex<Plant>>,
    clock: Clock,
}

impl SimulatedDesk {
    pub fn new(params: PlantParams, clock: Clock) -> Self {
        let plant = Plant {
            height_cm: params.start_height_cm,
            params,
            up: false,
            down: false,
            motion: None,
            coast_until_ms: None,
            updated_ms: clock(),
            pings: 0,
            noise: 0x2545_f491,
            interlock_faults: 0,
        };
        Self {
            plant: Arc::new(Mutex::new(plant)),
            clock,
        }
    }

    pub fn echo(&self) -> SimulatedEcho {
        SimulatedEcho { desk: self.clone() }
    }

    pub fn motor_outputs(&self) -> (SimulatedOutput, SimulatedOutput) {
        (
            SimulatedOutput {
                desk: self.clone(),
                direction: Direction::Up,
            },
            SimulatedOutput {
                desk: self.clone(),
                direction: Direction::Down,
            },
        )
    }

    pub fn height_cm(&self) -> f32 {
        let now_ms = (self.clock)();
        self.with_plant(|plant| {
            plant.advance(now_ms);
            plant.height_cm
        })
    }

    pub fn interlock_faults(&self) -> u32 {
        self.with_plant(|plant| plant.interlock_faults)
    }

    /// Room climate drifting slowly around 22°C / 45%.
    pub fn climate(&self, model: DhtModel) -> Option<ClimateReading> {
        let now_ms = (self.clock)();
        let phase = (now_ms % 600_000) as f32 / 600_000.0 * core::f32::consts::TAU;
        let noise = self.with_plant(Plant::next_noise);
        ClimateReading::checked(
            model,
            22.0 + 1.5 * phase.sin() + 0.1 * noise,
            45.0 + 5.0 * phase.cos() + 0.5 * noise,
        )
    }

    fn with_plant<R>(&self, f: impl FnOnce(&mut Plant) -> R) -> R {
        let mut plant = match self.plant.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut plant)
    }
}

pub struct SimulatedEcho {
    desk: SimulatedDesk,
}

impl EchoTimer for SimulatedEcho {
    type Error = Infallible;

    fn round_trip_us(&mut self, _: u32, timeout_us: u32) -> Result<Option<u32>, Self::Error> {
        let now_ms = (self.desk.clock)();
        let Some(distance_cm) = self.desk.with_plant(|plant| plant.ping(now_ms)) else {
            return Ok(None);
        };
        let round_trip_us = (distance_cm.max(0.0) * 2.0 / SPEED_OF_SOUND_CM_PER_US).round() as u32;
        Ok((round_trip_us <= timeout_us).then_some(round_trip_us))
    }
}

pub struct SimulatedOutput {
    desk: SimulatedDesk,
    direction: Direction,
}

impl SimulatedOutput {
    fn set(&mut self, high: bool) {
        let now_ms = (self.desk.clock)();
        let direction = self.direction;
        self.desk
            .with_plant(|plant| plant.set_output(direction, high, now_ms));
    }
}

impl ErrorType for SimulatedOutput {
    type Error = Infallible;
}

impl OutputPin for SimulatedOutput {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.set(false);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.set(true);
        Ok(())
    }
}

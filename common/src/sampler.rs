//! Ultrasonic height sampling.
//!
//! [`DistanceSampler`] turns echo round-trip times into [`HeightSample`]s. The
//! pin-level pulse/echo handshake sits behind [`EchoTimer`] so the same
//! sampler runs against real GPIO ([`PulseEchoTimer`]) or a simulated desk.

use std::collections::VecDeque;

use embedded_hal::{
    delay::DelayNs,
    digital::{Error as _, ErrorKind, InputPin, OutputPin},
};
use log::{debug, warn};

use crate::{
    config::{SamplerConfig, SPEED_OF_SOUND_CM_PER_US},
    types::HeightSample,
};

/// Microsecond monotonic clock used to time the echo pulse.
pub trait Now {
    fn now_micros(&self) -> u64;
}

pub trait EchoTimer {
    type Error: core::fmt::Debug;

    /// Fires one trigger pulse and returns the echo pulse width in
    /// microseconds, or `Ok(None)` when no echo completes within `timeout_us`.
    fn round_trip_us(
        &mut self,
        trigger_pulse_us: u32,
        timeout_us: u32,
    ) -> Result<Option<u32>, Self::Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoPinError {
    Trigger(ErrorKind),
    Echo(ErrorKind),
}

/// HC-SR04 style trigger/echo handshake over embedded-hal pins.
pub struct PulseEchoTimer<Trig, Echo, D, C> {
    trigger: Trig,
    echo: Echo,
    delay: D,
    clock: C,
}

impl<Trig, Echo, D, C> PulseEchoTimer<Trig, Echo, D, C>
where
    Trig: OutputPin,
    Echo: InputPin,
    D: DelayNs,
    C: Now,
{
    pub fn new(trigger: Trig, echo: Echo, delay: D, clock: C) -> Self {
        Self {
            trigger,
            echo,
            delay,
            clock,
        }
    }

    fn wait_for_level(
        &mut self,
        high: bool,
        since_us: u64,
        timeout_us: u32,
    ) -> Result<Option<u64>, EchoPinError> {
        loop {
            let level = self
                .echo
                .is_high()
                .map_err(|err| EchoPinError::Echo(err.kind()))?;
            let now = self.clock.now_micros();
            if level == high {
                return Ok(Some(now));
            }
            if now.saturating_sub(since_us) >= u64::from(timeout_us) {
                return Ok(None);
            }
        }
    }
}

impl<Trig, Echo, D, C> EchoTimer for PulseEchoTimer<Trig, Echo, D, C>
where
    Trig: OutputPin,
    Echo: InputPin,
    D: DelayNs,
    C: Now,
{
    type Error = EchoPinError;

    fn round_trip_us(
        &mut self,
        trigger_pulse_us: u32,
        timeout_us: u32,
    ) -> Result<Option<u32>, Self::Error> {
        let trigger_err = |err: Trig::Error| EchoPinError::Trigger(err.kind());

        self.trigger.set_low().map_err(trigger_err)?;
        self.delay.delay_us(2);
        self.trigger.set_high().map_err(trigger_err)?;
        self.delay.delay_us(trigger_pulse_us);
        self.trigger.set_low().map_err(trigger_err)?;

        let armed_at = self.clock.now_micros();
        let Some(rise) = self.wait_for_level(true, armed_at, timeout_us)? else {
            return Ok(None);
        };
        let Some(fall) = self.wait_for_level(false, rise, timeout_us)? else {
            return Ok(None);
        };

        Ok(Some(u32::try_from(fall - rise).unwrap_or(u32::MAX)))
    }
}

pub fn echo_to_distance_cm(round_trip_us: u32) -> f32 {
    round_trip_us as f32 * SPEED_OF_SOUND_CM_PER_US / 2.0
}

pub struct DistanceSampler<T> {
    timer: T,
    config: SamplerConfig,
    timeout_us: u32,
    window: VecDeque<f32>,
    consecutive_misses: u32,
    total_misses: u64,
}

impl<T: EchoTimer> DistanceSampler<T> {
    pub fn new(timer: T, config: SamplerConfig) -> Self {
        let timeout_us = config.echo_timeout_us();
        let capacity = config.filter_window.max(1);
        Self {
            timer,
            config,
            timeout_us,
            window: VecDeque::with_capacity(capacity),
            consecutive_misses: 0,
            total_misses: 0,
        }
    }

    pub fn sample(&mut self, now_ms: u64) -> HeightSample {
        let reading = self
            .timer
            .round_trip_us(self.config.trigger_pulse_us, self.timeout_us);

        let round_trip_us = match reading {
            Ok(Some(us)) => us,
            Ok(None) => {
                debug!("no echo within {}us", self.timeout_us);
                return self.miss(now_ms);
            }
            Err(err) => {
                warn!("echo read failed: {err:?}");
                return self.miss(now_ms);
            }
        };

        let distance_cm = echo_to_distance_cm(round_trip_us);
        if !(self.config.min_range_cm..=self.config.max_range_cm).contains(&distance_cm) {
            debug!("echo distance {distance_cm:.1}cm outside sensor range");
            return self.miss(now_ms);
        }

        if self.window.len() >= self.config.filter_window.max(1) {
            self.window.pop_front();
        }
        self.window.push_back(distance_cm);
        self.consecutive_misses = 0;

        HeightSample::valid(self.filtered_cm() + self.config.mount_offset_cm, now_ms)
    }

    pub fn consecutive_misses(&self) -> u32 {
        self.consecutive_misses
    }

    pub fn total_misses(&self) -> u64 {
        self.total_misses
    }

    fn miss(&mut self, now_ms: u64) -> HeightSample {
        self.consecutive_misses = self.consecutive_misses.saturating_add(1);
        self.total_misses = self.total_misses.saturating_add(1);
        HeightSample::invalid(now_ms)
    }

    fn filtered_cm(&self) -> f32 {
        let mut sorted: Vec<f32> = self.window.iter().copied().collect();
        sorted.sort_by(f32::total_cmp);
        let mid = sorted.len() / 2;
        if sorted.len() % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        } else {
            sorted[mid]
        }
    }
}

//! Up/down optocoupler outputs with a hard interlock.
//!
//! At most one output is ever asserted. A reversal releases the active output
//! and waits out `reverse_dead_time_ms` before asserting the other one, and a
//! direction held longer than `max_drive_ms` is cut off.

use embedded_hal::digital::{Error as _, OutputPin};
use log::{debug, warn};

use crate::{
    config::MotionConfig,
    error::MotionError,
    types::{Direction, DriveCommand},
};

pub struct MotionDriver<U, D> {
    up: U,
    down: D,
    config: MotionConfig,
    commanded: DriveCommand,
    asserted: Option<(Direction, u64)>,
    last_released: Option<(Direction, u64)>,
}

impl<U, D> MotionDriver<U, D>
where
    U: OutputPin,
    D: OutputPin,
{
    /// Takes ownership of both outputs and drives them low.
    pub fn new(up: U, down: D, config: MotionConfig) -> Result<Self, MotionError> {
        let mut driver = Self {
            up,
            down,
            config,
            commanded: DriveCommand::Stop,
            asserted: None,
            last_released: None,
        };
        driver.write(Direction::Up, false)?;
        driver.write(Direction::Down, false)?;
        Ok(driver)
    }

    pub fn commanded(&self) -> DriveCommand {
        self.commanded
    }

    /// Direction whose output is currently asserted.
    pub fn asserted(&self) -> Option<Direction> {
        self.asserted.map(|(direction, _)| direction)
    }

    /// A direction is commanded but held off by the reversal dead time.
    pub fn is_pending(&self) -> bool {
        self.commanded != DriveCommand::Stop && self.asserted.is_none()
    }

    pub fn drive(&mut self, command: DriveCommand, now_ms: u64) -> Result<(), MotionError> {
        match command.direction() {
            None => self.stop(now_ms),
            Some(direction) => self.drive_direction(direction, now_ms),
        }
    }

    fn stop(&mut self, now_ms: u64) -> Result<(), MotionError> {
        self.commanded = DriveCommand::Stop;
        if let Some((direction, _)) = self.asserted {
            self.release(direction, now_ms)?;
            debug!("motion stopped");
        }
        Ok(())
    }

    fn drive_direction(&mut self, direction: Direction, now_ms: u64) -> Result<(), MotionError> {
        if let Some((active, since_ms)) = self.asserted {
            if active == direction {
                let held_ms = now_ms.saturating_sub(since_ms);
                if held_ms > self.config.max_drive_ms {
                    warn!(
                        "{} drive held for {held_ms}ms; cutting outputs",
                        direction.as_str()
                    );
                    self.commanded = DriveCommand::Stop;
                    self.release(active, now_ms)?;
                    return Err(MotionError::DriveWindowExceeded {
                        direction,
                        limit_ms: self.config.max_drive_ms,
                    });
                }
                return Ok(());
            }
            self.release(active, now_ms)?;
        }

        self.commanded = direction.into();
        if !self.dead_time_elapsed(direction, now_ms) {
            return Ok(());
        }

        // Interlock: the opposing line is always written low before asserting.
        let asserted = self
            .write(direction.opposite(), false)
            .and_then(|()| self.write(direction, true));
        if let Err(err) = asserted {
            self.commanded = DriveCommand::Stop;
            self.release_all();
            return Err(err);
        }

        self.asserted = Some((direction, now_ms));
        debug!("motion {} asserted", direction.as_str());
        Ok(())
    }

    fn dead_time_elapsed(&self, direction: Direction, now_ms: u64) -> bool {
        match self.last_released {
            Some((released, at_ms)) if released != direction => {
                now_ms.saturating_sub(at_ms) >= self.config.reverse_dead_time_ms
            }
            _ => true,
        }
    }

    fn release(&mut self, direction: Direction, now_ms: u64) -> Result<(), MotionError> {
        self.asserted = None;
        self.last_released = Some((direction, now_ms));
        if let Err(err) = self.write(direction, false) {
            self.commanded = DriveCommand::Stop;
            self.release_all();
            return Err(err);
        }
        Ok(())
    }

    fn release_all(&mut self) {
        self.asserted = None;
        for direction in [Direction::Up, Direction::Down] {
            if let Err(err) = self.write(direction, false) {
                warn!("failed to release {} output: {err}", direction.as_str());
            }
        }
    }

    fn write(&mut self, direction: Direction, high: bool) -> Result<(), MotionError> {
        let result = match (direction, high) {
            (Direction::Up, true) => self.up.set_high().map_err(|err| err.kind()),
            (Direction::Up, false) => self.up.set_low().map_err(|err| err.kind()),
            (Direction::Down, true) => self.down.set_high().map_err(|err| err.kind()),
            (Direction::Down, false) => self.down.set_low().map_err(|err| err.kind()),
        };
        result.map_err(|kind| MotionError::Output {
            output: direction.as_str(),
            detail: format!("{kind:?}"),
        })
    }
}

use std::{cell::Cell, collections::VecDeque, rc::Rc};

use embedded_hal::digital::{ErrorKind, ErrorType, OutputPin};

use crate::{config::SPEED_OF_SOUND_CM_PER_US, sampler::EchoTimer};

#[derive(Default)]
struct LineState {
    up: Cell<bool>,
    down: Cell<bool>,
    writes: Cell<u32>,
    violations: Cell<u32>,
    fail: Cell<bool>,
}

/// A pair of fake motor outputs that records levels and interlock breaches.
#[derive(Clone, Default)]
pub struct MotorLines {
    state: Rc<LineState>,
}

impl MotorLines {
    pub fn pins(&self) -> (LinePin, LinePin) {
        (
            LinePin {
                state: self.state.clone(),
                up: true,
            },
            LinePin {
                state: self.state.clone(),
                up: false,
            },
        )
    }

    /// `(up, down)` output levels.
    pub fn levels(&self) -> (bool, bool) {
        (self.state.up.get(), self.state.down.get())
    }

    pub fn writes(&self) -> u32 {
        self.state.writes.get()
    }

    pub fn interlock_violations(&self) -> u32 {
        self.state.violations.get()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.state.fail.set(fail);
    }
}

#[derive(Debug)]
pub struct LineFault;

impl embedded_hal::digital::Error for LineFault {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Other
    }
}

pub struct LinePin {
    state: Rc<LineState>,
    up: bool,
}

impl LinePin {
    fn set(&mut self, high: bool) -> Result<(), LineFault> {
        if self.state.fail.get() {
            return Err(LineFault);
        }
        self.state.writes.set(self.state.writes.get() + 1);
        if self.up {
            self.state.up.set(high);
        } else {
            self.state.down.set(high);
        }
        if self.state.up.get() && self.state.down.get() {
            self.state.violations.set(self.state.violations.get() + 1);
        }
        Ok(())
    }
}

impl ErrorType for LinePin {
    type Error = LineFault;
}

impl OutputPin for LinePin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.set(false)
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.set(true)
    }
}

/// Echo source replaying a fixed list of distances; `None` is a timeout.
pub struct ScriptedEchoes {
    distances: VecDeque<Option<f32>>,
}

impl ScriptedEchoes {
    pub fn new(distances: impl IntoIterator<Item = Option<f32>>) -> Self {
        Self {
            distances: distances.into_iter().collect(),
        }
    }
}

impl EchoTimer for ScriptedEchoes {
    type Error = core::convert::Infallible;

    fn round_trip_us(&mut self, _: u32, _: u32) -> Result<Option<u32>, Self::Error> {
        Ok(self
            .distances
            .pop_front()
            .flatten()
            .map(|cm| (cm * 2.0 / SPEED_OF_SOUND_CM_PER_US).round() as u32))
    }
}

use embedded_hal::digital::OutputPin;
use log::warn;

use crate::{
    controller::HeightController,
    error::RequestError,
    events::{LifecycleEventSink, SessionReport},
    motion::MotionDriver,
    sampler::{DistanceSampler, EchoTimer},
    types::{DeskStatePayload, DriveCommand, HeightSample},
};

/// One desk: sampler, controller, and motor outputs driven together once per
/// tick. Every finished session is handed to the sink exactly once.
pub struct DeskControlLoop<T, U, D, S> {
    sampler: DistanceSampler<T>,
    driver: MotionDriver<U, D>,
    controller: HeightController,
    sink: S,
    last_sample: Option<HeightSample>,
}

impl<T, U, D, S> DeskControlLoop<T, U, D, S>
where
    T: EchoTimer,
    U: OutputPin,
    D: OutputPin,
    S: LifecycleEventSink,
{
    pub fn new(
        sampler: DistanceSampler<T>,
        driver: MotionDriver<U, D>,
        controller: HeightController,
        sink: S,
    ) -> Self {
        Self {
            sampler,
            driver,
            controller,
            sink,
            last_sample: None,
        }
    }

    pub fn controller(&self) -> &HeightController {
        &self.controller
    }

    pub fn driver(&self) -> &MotionDriver<U, D> {
        &self.driver
    }

    pub fn sampler(&self) -> &DistanceSampler<T> {
        &self.sampler
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn last_sample(&self) -> Option<HeightSample> {
        self.last_sample
    }

    pub fn tick(&mut self, now_ms: u64) -> HeightSample {
        let sample = self.sampler.sample(now_ms);
        self.last_sample = Some(sample);

        let step = self.controller.tick(&sample, now_ms);
        if let Some(report) = step.report {
            self.emit(&report);
        }
        self.apply(step.command, now_ms);

        sample
    }

    pub fn request_height(&mut self, target_cm: f32, now_ms: u64) -> Result<(), RequestError> {
        if let Some(superseded) = self.controller.request_height(target_cm, now_ms)? {
            self.emit(&superseded);
        }
        Ok(())
    }

    /// Stops the outputs immediately. Returns whether a session was running.
    pub fn abort(&mut self, now_ms: u64) -> bool {
        let report = self.controller.abort(now_ms);
        self.apply(DriveCommand::Stop, now_ms);
        match report {
            Some(report) => {
                self.emit(&report);
                true
            }
            None => false,
        }
    }

    pub fn state_payload(&self, now_ms: u64) -> DeskStatePayload {
        let sensor_valid = self.last_sample.is_some_and(|sample| sample.valid);
        self.controller.state_payload(now_ms, sensor_valid)
    }

    fn apply(&mut self, command: DriveCommand, now_ms: u64) {
        let Err(err) = self.driver.drive(command, now_ms) else {
            return;
        };
        warn!("motor outputs faulted: {err}");
        if let Some(report) = self.controller.motion_fault(&err, now_ms) {
            self.emit(&report);
        }
    }

    fn emit(&mut self, report: &SessionReport) {
        self.sink.session_finished(report);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        config::{ControlConfig, MotionConfig, SamplerConfig},
        events::{AbortReason, SessionOutcome},
        testing::{LinePin, MotorLines, ScriptedEchoes},
        types::ControlState,
    };

    type TestLoop = DeskControlLoop<ScriptedEchoes, LinePin, LinePin, Vec<SessionReport>>;

    fn desk(lines: &MotorLines, distances: &[Option<f32>]) -> TestLoop {
        let sampler = DistanceSampler::new(
            ScriptedEchoes::new(distances.iter().copied()),
            SamplerConfig {
                filter_window: 1,
                ..SamplerConfig::default()
            },
        );
        let (up, down) = lines.pins();
        let driver = MotionDriver::new(up, down, MotionConfig::default()).unwrap();
        DeskControlLoop::new(
            sampler,
            driver,
            HeightController::new(ControlConfig::default()),
            Vec::new(),
        )
    }

    fn run(desk: &mut TestLoop, lines: &MotorLines, ticks: u64) {
        for tick in 1..=ticks {
            desk.tick(tick * 100);
            assert_ne!(lines.levels(), (true, true));
        }
    }

    #[test]
    fn oscillating_desk_aborts_with_outputs_released() {
        let lines = MotorLines::default();
        let heights = [70.0, 90.0, 70.0, 90.0, 70.0].map(Some);
        let mut desk = desk(&lines, &heights);
        desk.request_height(80.0, 0).unwrap();

        run(&mut desk, &lines, 5);

        let reports = desk.sink();
        assert_eq!(reports.len(), 1);
        assert_eq!(
            reports[0].outcome,
            SessionOutcome::Aborted(AbortReason::ReverseLimit)
        );
        assert_eq!(reports[0].reverse_toggles, 4);
        assert_eq!(lines.levels(), (false, false));
        assert_eq!(lines.interlock_violations(), 0);
    }

    #[test]
    fn converging_desk_settles_once() {
        let lines = MotorLines::default();
        let heights = [60.0, 70.0, 77.0, 79.0, 80.0, 80.0, 80.0].map(Some);
        let mut desk = desk(&lines, &heights);
        desk.request_height(80.0, 0).unwrap();

        run(&mut desk, &lines, 7);

        let reports = desk.sink();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].outcome, SessionOutcome::Settled);
        assert_eq!(reports[0].reverse_toggles, 0);
        assert_eq!(desk.controller().state(), ControlState::Idle);
        assert_eq!(lines.levels(), (false, false));
    }

    #[test]
    fn seeking_drives_the_matching_output() {
        let lines = MotorLines::default();
        let mut desk = desk(&lines, &[Some(70.0), Some(72.0)]);
        desk.request_height(100.0, 0).unwrap();

        run(&mut desk, &lines, 1);
        assert_eq!(lines.levels(), (true, false));

        assert!(desk.abort(150));
        assert_eq!(lines.levels(), (false, false));
        assert_eq!(
            desk.sink()[0].outcome,
            SessionOutcome::Aborted(AbortReason::Cancelled)
        );
        assert!(!desk.abort(200));
    }

    #[test]
    fn silent_sensor_never_moves_the_desk() {
        let lines = MotorLines::default();
        let mut desk = desk(&lines, &[None; 10]);
        desk.request_height(100.0, 0).unwrap();

        run(&mut desk, &lines, 10);

        assert_eq!(lines.levels(), (false, false));
        assert!(!desk.state_payload(1_000).sensor_valid);
        assert_eq!(desk.sampler().consecutive_misses(), 10);
    }

    #[test]
    fn output_fault_aborts_session() {
        let lines = MotorLines::default();
        let mut desk = desk(&lines, &[Some(70.0)]);
        desk.request_height(100.0, 0).unwrap();
        lines.fail_writes(true);

        run(&mut desk, &lines, 1);

        assert_eq!(
            desk.sink()[0].outcome,
            SessionOutcome::Aborted(AbortReason::Actuator)
        );
        assert_eq!(desk.driver().commanded(), DriveCommand::Stop);
    }

    #[test]
    fn retarget_reports_superseded_session() {
        let lines = MotorLines::default();
        let mut desk = desk(&lines, &[Some(70.0)]);
        desk.request_height(100.0, 0).unwrap();
        run(&mut desk, &lines, 1);

        desk.request_height(65.0, 150).unwrap();

        assert_eq!(
            desk.sink()[0].outcome,
            SessionOutcome::Aborted(AbortReason::Superseded)
        );
        assert_eq!(desk.controller().target_cm(), Some(65.0));
    }
}

use log::{debug, info, warn};

use crate::{
    config::ControlConfig,
    error::{MotionError, RequestError},
    events::{AbortReason, SessionOutcome, SessionReport},
    types::{ControlState, DeskStatePayload, Direction, DriveCommand, HeightSample},
};

#[derive(Debug, Clone, Copy)]
struct ControlSession {
    target_cm: f32,
    started_at_ms: u64,
    last_direction: Option<Direction>,
    reverse_toggles: u32,
    commanded: DriveCommand,
    confirmations: u8,
    blind_ticks: u32,
}

impl ControlSession {
    fn new(target_cm: f32, now_ms: u64) -> Self {
        Self {
            target_cm,
            started_at_ms: now_ms,
            last_direction: None,
            reverse_toggles: 0,
            commanded: DriveCommand::Stop,
            confirmations: 0,
            blind_ticks: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ControlStep {
    pub command: DriveCommand,
    pub report: Option<SessionReport>,
}

impl ControlStep {
    fn drive(command: DriveCommand) -> Self {
        Self {
            command,
            report: None,
        }
    }
}

enum Verdict {
    Continue(DriveCommand),
    Finish(SessionOutcome),
}

/// Bang-bang height controller with a bounded number of direction reversals.
///
/// Pure state machine: [`HeightController::tick`] consumes one sample and
/// returns the command for the motor outputs plus, on a terminal transition,
/// the session report. Sensor and motor I/O live in
/// [`crate::control_loop::DeskControlLoop`].
#[derive(Debug, Clone)]
pub struct HeightController {
    config: ControlConfig,
    state: ControlState,
    session: Option<ControlSession>,
    last_height_cm: Option<f32>,
    last_report: Option<SessionReport>,
}

impl HeightController {
    pub fn new(config: ControlConfig) -> Self {
        Self {
            config,
            state: ControlState::Idle,
            session: None,
            last_height_cm: None,
            last_report: None,
        }
    }

    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    pub fn state(&self) -> ControlState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    pub fn target_cm(&self) -> Option<f32> {
        self.session.map(|session| session.target_cm)
    }

    pub fn reverse_toggles(&self) -> u32 {
        self.session
            .map(|session| session.reverse_toggles)
            .unwrap_or(0)
    }

    pub fn commanded(&self) -> DriveCommand {
        match (self.state, self.session) {
            (ControlState::Seeking, Some(session)) => session.commanded,
            _ => DriveCommand::Stop,
        }
    }

    pub fn last_height_cm(&self) -> Option<f32> {
        self.last_height_cm
    }

    pub fn last_report(&self) -> Option<&SessionReport> {
        self.last_report.as_ref()
    }

    /// Starts a session toward `target_cm`. An active session is replaced and
    /// its report (aborted as superseded) is returned.
    pub fn request_height(
        &mut self,
        target_cm: f32,
        now_ms: u64,
    ) -> Result<Option<SessionReport>, RequestError> {
        if !target_cm.is_finite() {
            return Err(RequestError::NotFinite);
        }
        if !(self.config.min_height_cm..=self.config.max_height_cm).contains(&target_cm) {
            return Err(RequestError::OutOfRange {
                target_cm,
                min_cm: self.config.min_height_cm,
                max_cm: self.config.max_height_cm,
            });
        }

        let superseded = self
            .is_active()
            .then(|| self.finish(SessionOutcome::Aborted(AbortReason::Superseded), now_ms));

        self.session = Some(ControlSession::new(target_cm, now_ms));
        self.state = ControlState::Seeking;
        info!("seeking {target_cm:.1}cm");

        Ok(superseded)
    }

    /// Cancels the active session. Idle controllers ignore the call.
    pub fn abort(&mut self, now_ms: u64) -> Option<SessionReport> {
        self.is_active()
            .then(|| self.finish(SessionOutcome::Aborted(AbortReason::Cancelled), now_ms))
    }

    /// Ends the active session after the motor outputs reported a fault.
    pub fn motion_fault(&mut self, err: &MotionError, now_ms: u64) -> Option<SessionReport> {
        let reason = match err {
            MotionError::DriveWindowExceeded { .. } => AbortReason::DriveWindow,
            MotionError::Output { .. } => AbortReason::Actuator,
        };
        self.is_active()
            .then(|| self.finish(SessionOutcome::Aborted(reason), now_ms))
    }

    pub fn tick(&mut self, sample: &HeightSample, now_ms: u64) -> ControlStep {
        if let Some(height_cm) = sample.height_cm() {
            self.last_height_cm = Some(height_cm);
        }

        match self.state {
            ControlState::Idle => ControlStep::drive(DriveCommand::Stop),
            ControlState::Settled | ControlState::Aborted => {
                self.state = ControlState::Idle;
                ControlStep::drive(DriveCommand::Stop)
            }
            ControlState::Seeking | ControlState::Settling => self.tick_active(sample, now_ms),
        }
    }

    pub fn state_payload(&self, now_ms: u64, sensor_valid: bool) -> DeskStatePayload {
        DeskStatePayload {
            state: self.state.as_str(),
            command: self.commanded().as_str(),
            height_cm: self.last_height_cm,
            target_cm: self.target_cm(),
            reverse_toggles: self.reverse_toggles(),
            max_reverse_toggles: self.config.max_reverse_toggles,
            sensor_valid,
            session_ms: self
                .session
                .map(|session| now_ms.saturating_sub(session.started_at_ms))
                .unwrap_or(0),
            last_outcome: self.last_report.as_ref().map(|r| r.outcome.as_str()),
            last_abort_reason: self
                .last_report
                .as_ref()
                .and_then(|r| r.outcome.abort_reason())
                .map(AbortReason::as_str),
        }
    }

    fn tick_active(&mut self, sample: &HeightSample, now_ms: u64) -> ControlStep {
        let Some(mut session) = self.session else {
            self.state = ControlState::Idle;
            return ControlStep::drive(DriveCommand::Stop);
        };

        let verdict = self.evaluate(&mut session, sample, now_ms);
        self.session = Some(session);

        match verdict {
            Verdict::Continue(command) => ControlStep::drive(command),
            Verdict::Finish(outcome) => ControlStep {
                command: DriveCommand::Stop,
                report: Some(self.finish(outcome, now_ms)),
            },
        }
    }

    fn evaluate(
        &mut self,
        session: &mut ControlSession,
        sample: &HeightSample,
        now_ms: u64,
    ) -> Verdict {
        if now_ms.saturating_sub(session.started_at_ms) > self.config.max_session_ms {
            return Verdict::Finish(SessionOutcome::Aborted(AbortReason::Timeout));
        }

        let Some(height_cm) = sample.height_cm() else {
            session.blind_ticks = session.blind_ticks.saturating_add(1);
            if session.blind_ticks > self.config.max_blind_ticks {
                return Verdict::Finish(SessionOutcome::Aborted(AbortReason::SensorLost));
            }
            // Hold course through dropouts; Settling already commands Stop.
            return match self.state {
                ControlState::Seeking => Verdict::Continue(session.commanded),
                _ => Verdict::Continue(DriveCommand::Stop),
            };
        };
        session.blind_ticks = 0;

        let error_cm = session.target_cm - height_cm;
        let in_deadband = error_cm.abs() <= self.config.deadband_cm;

        let leaving_deadband = self.state == ControlState::Settling && !in_deadband;
        if self.state == ControlState::Settling {
            if in_deadband {
                session.confirmations = session.confirmations.saturating_add(1);
                if session.confirmations >= self.config.settle_confirm_samples {
                    return Verdict::Finish(SessionOutcome::Settled);
                }
                return Verdict::Continue(DriveCommand::Stop);
            }
            debug!("{height_cm:.1}cm left the deadband while settling");
            self.state = ControlState::Seeking;
        }

        if in_deadband {
            self.state = ControlState::Settling;
            session.commanded = DriveCommand::Stop;
            session.confirmations = 0;
            if self.config.settle_confirm_samples == 0 {
                return Verdict::Finish(SessionOutcome::Settled);
            }
            return Verdict::Continue(DriveCommand::Stop);
        }

        let direction = if error_cm > 0.0 {
            Direction::Up
        } else {
            Direction::Down
        };

        // Drifting out of the deadband is jitter, not a reversal.
        if !leaving_deadband
            && session
                .last_direction
                .is_some_and(|last| last != direction)
        {
            session.reverse_toggles = session.reverse_toggles.saturating_add(1);
            info!(
                "reversing {} at {height_cm:.1}cm ({}/{})",
                direction.as_str(),
                session.reverse_toggles,
                self.config.max_reverse_toggles
            );
            if session.reverse_toggles > self.config.max_reverse_toggles {
                return Verdict::Finish(SessionOutcome::Aborted(AbortReason::ReverseLimit));
            }
        }

        session.last_direction = Some(direction);
        session.commanded = direction.into();
        Verdict::Continue(session.commanded)
    }

    fn finish(&mut self, outcome: SessionOutcome, now_ms: u64) -> SessionReport {
        let session = self
            .session
            .take()
            .unwrap_or_else(|| ControlSession::new(f32::NAN, now_ms));

        let report = SessionReport {
            target_cm: session.target_cm,
            outcome,
            final_height_cm: self.last_height_cm,
            reverse_toggles: session.reverse_toggles,
            started_at_ms: session.started_at_ms,
            finished_at_ms: now_ms,
        };

        match outcome {
            SessionOutcome::Settled => {
                self.state = ControlState::Settled;
                info!(
                    "settled at {:?}cm for target {:.1}cm after {} reversals",
                    report.final_height_cm, report.target_cm, report.reverse_toggles
                );
            }
            SessionOutcome::Aborted(reason) => {
                self.state = ControlState::Aborted;
                warn!(
                    "aborted {:.1}cm session: {} after {} reversals",
                    report.target_cm,
                    reason.as_str(),
                    report.reverse_toggles
                );
            }
        }

        self.last_report = Some(report.clone());
        report
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn controller(max_reverse_toggles: u32) -> HeightController {
        HeightController::new(ControlConfig {
            max_reverse_toggles,
            ..ControlConfig::default()
        })
    }

    /// Feeds one sample per 100ms tick, returning the commands issued.
    fn run(
        controller: &mut HeightController,
        heights: &[Option<f32>],
        start_ms: u64,
    ) -> (Vec<DriveCommand>, Vec<SessionReport>) {
        let mut commands = Vec::new();
        let mut reports = Vec::new();
        for (i, height) in heights.iter().enumerate() {
            let now_ms = start_ms + (i as u64 + 1) * 100;
            let sample = match height {
                Some(cm) => HeightSample::valid(*cm, now_ms),
                None => HeightSample::invalid(now_ms),
            };
            let step = controller.tick(&sample, now_ms);
            commands.push(step.command);
            reports.extend(step.report);
        }
        (commands, reports)
    }

    #[test]
    fn alternating_samples_abort_after_third_flip() {
        let mut controller = controller(3);
        controller.request_height(80.0, 0).unwrap();

        let heights = [70.0, 90.0, 70.0, 90.0, 70.0].map(Some);
        let (commands, reports) = run(&mut controller, &heights, 0);

        assert_eq!(
            commands,
            vec![
                DriveCommand::Up,
                DriveCommand::Down,
                DriveCommand::Up,
                DriveCommand::Down,
                DriveCommand::Stop,
            ]
        );
        assert_eq!(reports.len(), 1);
        assert_eq!(
            reports[0].outcome,
            SessionOutcome::Aborted(AbortReason::ReverseLimit)
        );
        assert_eq!(reports[0].reverse_toggles, 4);
        assert_eq!(reports[0].final_height_cm, Some(70.0));
        assert_eq!(controller.state(), ControlState::Aborted);
    }

    #[test]
    fn converging_samples_settle_without_toggles() {
        let mut controller = controller(3);
        controller.request_height(80.0, 0).unwrap();
        let mut states = Vec::new();

        for (i, height) in [60.0, 70.0, 77.0, 79.0, 80.0].iter().enumerate() {
            let now_ms = (i as u64 + 1) * 100;
            let step = controller.tick(&HeightSample::valid(*height, now_ms), now_ms);
            states.push(controller.state());
            if let Some(report) = step.report {
                assert_eq!(report.outcome, SessionOutcome::Settled);
                assert_eq!(report.reverse_toggles, 0);
                assert_eq!(report.final_height_cm, Some(80.0));
            }
        }

        assert_eq!(
            states,
            vec![
                ControlState::Seeking,
                ControlState::Seeking,
                ControlState::Seeking,
                ControlState::Settling,
                ControlState::Settled,
            ]
        );
        assert_eq!(
            controller.last_report().map(|r| r.outcome),
            Some(SessionOutcome::Settled)
        );
    }

    #[test]
    fn terminal_state_returns_to_idle_on_next_tick() {
        let mut controller = controller(3);
        controller.request_height(80.0, 0).unwrap();
        run(&mut controller, &[Some(80.0), Some(80.0)], 0);
        assert_eq!(controller.state(), ControlState::Settled);

        let step = controller.tick(&HeightSample::valid(80.0, 500), 500);

        assert_eq!(step, ControlStep::drive(DriveCommand::Stop));
        assert_eq!(controller.state(), ControlState::Idle);
    }

    #[test]
    fn always_invalid_samples_hold_stop() {
        let mut controller = controller(3);
        controller.request_height(100.0, 0).unwrap();

        let (commands, reports) = run(&mut controller, &[None; 20], 0);

        assert!(commands.iter().all(|c| *c == DriveCommand::Stop));
        assert!(reports.is_empty());
        assert_eq!(controller.state(), ControlState::Seeking);
    }

    #[test]
    fn blind_session_eventually_reports_sensor_lost() {
        let mut controller = controller(3);
        controller.request_height(100.0, 0).unwrap();

        let (commands, reports) = run(&mut controller, &[None; 21], 0);

        assert_eq!(commands.last(), Some(&DriveCommand::Stop));
        assert_eq!(
            reports.first().map(|r| r.outcome),
            Some(SessionOutcome::Aborted(AbortReason::SensorLost))
        );
    }

    #[test]
    fn dropout_holds_current_direction() {
        let mut controller = controller(3);
        controller.request_height(100.0, 0).unwrap();

        let (commands, _) = run(&mut controller, &[Some(80.0), None, None, Some(85.0)], 0);

        assert_eq!(commands, vec![DriveCommand::Up; 4]);
        assert_eq!(controller.reverse_toggles(), 0);
    }

    #[test]
    fn deadband_jitter_while_settling_does_not_count() {
        let mut controller = HeightController::new(ControlConfig {
            settle_confirm_samples: 3,
            ..ControlConfig::default()
        });
        controller.request_height(80.0, 0).unwrap();

        let heights = [75.0, 79.5, 78.7, 79.4, 79.8, 80.2, 79.9].map(Some);
        let (commands, reports) = run(&mut controller, &heights, 0);

        assert_eq!(
            commands,
            vec![
                DriveCommand::Up,
                DriveCommand::Stop,
                DriveCommand::Up,
                DriveCommand::Stop,
                DriveCommand::Stop,
                DriveCommand::Stop,
                DriveCommand::Stop,
            ]
        );
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].outcome, SessionOutcome::Settled);
        assert_eq!(reports[0].reverse_toggles, 0);
    }

    #[test]
    fn leaving_settling_does_not_count_as_reversal() {
        let mut controller = HeightController::new(ControlConfig {
            settle_confirm_samples: 3,
            ..ControlConfig::default()
        });
        controller.request_height(80.0, 0).unwrap();

        run(&mut controller, &[Some(75.0), Some(80.9), Some(81.1)], 0);

        assert_eq!(controller.state(), ControlState::Seeking);
        assert_eq!(controller.commanded(), DriveCommand::Down);
        assert_eq!(controller.reverse_toggles(), 0);

        run(&mut controller, &[Some(78.5)], 300);

        assert_eq!(controller.commanded(), DriveCommand::Up);
        assert_eq!(controller.reverse_toggles(), 1);
    }

    #[test]
    fn toggle_count_is_monotonic() {
        let mut controller = controller(50);
        controller.request_height(80.0, 0).unwrap();
        let heights: Vec<Option<f32>> = (0..40)
            .map(|i| match i % 5 {
                0 => Some(70.0),
                1 => None,
                2 => Some(90.0),
                3 => Some(80.3),
                _ => Some(95.0),
            })
            .collect();

        let mut last = 0;
        for (i, height) in heights.iter().enumerate() {
            let now_ms = (i as u64 + 1) * 100;
            let sample = height
                .map(|cm| HeightSample::valid(cm, now_ms))
                .unwrap_or(HeightSample::invalid(now_ms));
            controller.tick(&sample, now_ms);
            let toggles = controller.reverse_toggles();
            assert!(toggles >= last);
            assert!(toggles - last <= 1);
            last = toggles;
        }
    }

    #[test]
    fn retarget_supersedes_active_session() {
        let mut controller = controller(3);
        controller.request_height(80.0, 0).unwrap();
        run(&mut controller, &[Some(70.0), Some(90.0)], 0);
        assert_eq!(controller.reverse_toggles(), 1);

        let superseded = controller.request_height(100.0, 300).unwrap().unwrap();

        assert_eq!(
            superseded.outcome,
            SessionOutcome::Aborted(AbortReason::Superseded)
        );
        assert_eq!(superseded.reverse_toggles, 1);
        assert_eq!(controller.state(), ControlState::Seeking);
        assert_eq!(controller.target_cm(), Some(100.0));
        assert_eq!(controller.reverse_toggles(), 0);
    }

    #[test]
    fn abort_reports_toggles_at_cancellation() {
        let mut controller = controller(3);
        controller.request_height(80.0, 0).unwrap();
        run(&mut controller, &[Some(70.0), Some(90.0), Some(70.0)], 0);

        let report = controller.abort(400).unwrap();

        assert_eq!(
            report.outcome,
            SessionOutcome::Aborted(AbortReason::Cancelled)
        );
        assert_eq!(report.reverse_toggles, 2);
        assert_eq!(report.duration_ms(), 400);
        assert_eq!(controller.commanded(), DriveCommand::Stop);
        assert_eq!(controller.abort(500), None);
    }

    #[test]
    fn session_timeout_aborts() {
        let mut controller = HeightController::new(ControlConfig {
            max_session_ms: 1_000,
            ..ControlConfig::default()
        });
        controller.request_height(100.0, 0).unwrap();
        controller.tick(&HeightSample::valid(70.0, 500), 500);

        let step = controller.tick(&HeightSample::valid(71.0, 1_001), 1_001);

        assert_eq!(step.command, DriveCommand::Stop);
        assert_eq!(
            step.report.map(|r| r.outcome),
            Some(SessionOutcome::Aborted(AbortReason::Timeout))
        );
    }

    #[test]
    fn rejects_out_of_range_targets() {
        let mut controller = controller(3);

        assert_eq!(
            controller.request_height(f32::NAN, 0),
            Err(RequestError::NotFinite)
        );
        assert!(matches!(
            controller.request_height(200.0, 0),
            Err(RequestError::OutOfRange { .. })
        ));
        assert_eq!(controller.state(), ControlState::Idle);
    }

    #[test]
    fn motion_fault_aborts_active_session() {
        let mut controller = controller(3);
        controller.request_height(100.0, 0).unwrap();
        controller.tick(&HeightSample::valid(70.0, 100), 100);

        let report = controller
            .motion_fault(
                &MotionError::DriveWindowExceeded {
                    direction: Direction::Up,
                    limit_ms: 30_000,
                },
                200,
            )
            .unwrap();

        assert_eq!(
            report.outcome,
            SessionOutcome::Aborted(AbortReason::DriveWindow)
        );
        assert_eq!(controller.state(), ControlState::Aborted);
    }

    #[test]
    fn state_payload_reflects_session() {
        let mut controller = controller(3);
        controller.request_height(90.0, 0).unwrap();
        controller.tick(&HeightSample::valid(75.0, 100), 100);

        let payload = controller.state_payload(600, true);

        assert_eq!(payload.state, "SEEKING");
        assert_eq!(payload.command, "UP");
        assert_eq!(payload.height_cm, Some(75.0));
        assert_eq!(payload.target_cm, Some(90.0));
        assert_eq!(payload.session_ms, 600);
        assert_eq!(payload.last_outcome, None);
    }
}

use std::collections::VecDeque;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// Direction flips exceeded `max_reverse_toggles`.
    ReverseLimit,
    Cancelled,
    /// Replaced by a newer height request.
    Superseded,
    Timeout,
    SensorLost,
    DriveWindow,
    Actuator,
}

impl AbortReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReverseLimit => "REVERSE_LIMIT",
            Self::Cancelled => "CANCELLED",
            Self::Superseded => "SUPERSEDED",
            Self::Timeout => "TIMEOUT",
            Self::SensorLost => "SENSOR_LOST",
            Self::DriveWindow => "DRIVE_WINDOW",
            Self::Actuator => "ACTUATOR",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Settled,
    Aborted(AbortReason),
}

impl SessionOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Settled => "SETTLED",
            Self::Aborted(_) => "ABORTED",
        }
    }

    pub fn abort_reason(self) -> Option<AbortReason> {
        match self {
            Self::Settled => None,
            Self::Aborted(reason) => Some(reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionReport {
    pub target_cm: f32,
    pub outcome: SessionOutcome,
    pub final_height_cm: Option<f32>,
    pub reverse_toggles: u32,
    pub started_at_ms: u64,
    pub finished_at_ms: u64,
}

impl SessionReport {
    pub fn duration_ms(&self) -> u64 {
        self.finished_at_ms.saturating_sub(self.started_at_ms)
    }

    pub fn payload(&self) -> SessionReportPayload {
        SessionReportPayload {
            outcome: self.outcome.as_str(),
            reason: self.outcome.abort_reason().map(AbortReason::as_str),
            target_cm: self.target_cm,
            final_height_cm: self.final_height_cm,
            reverse_toggles: self.reverse_toggles,
            duration_ms: self.duration_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionReportPayload {
    pub outcome: &'static str,
    pub reason: Option<&'static str>,
    #[serde(rename = "targetCm")]
    pub target_cm: f32,
    #[serde(rename = "finalHeightCm")]
    pub final_height_cm: Option<f32>,
    #[serde(rename = "reverseToggles")]
    pub reverse_toggles: u32,
    #[serde(rename = "durationMs")]
    pub duration_ms: u64,
}

/// Receives exactly one report per finished control session.
pub trait LifecycleEventSink {
    fn session_finished(&mut self, report: &SessionReport);
}

impl LifecycleEventSink for Vec<SessionReport> {
    fn session_finished(&mut self, report: &SessionReport) {
        self.push(report.clone());
    }
}

/// Reports waiting for the uplink, oldest first. Once `capacity` is reached
/// the oldest report is evicted.
#[derive(Debug, Clone)]
pub struct ReportBacklog {
    reports: VecDeque<SessionReport>,
    capacity: usize,
}

impl ReportBacklog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            reports: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.reports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.is_empty()
    }

    /// Queues a report, returning the one evicted to make room.
    pub fn push(&mut self, report: SessionReport) -> Option<SessionReport> {
        let evicted = if self.reports.len() >= self.capacity {
            self.reports.pop_front()
        } else {
            None
        };
        self.reports.push_back(report);
        evicted
    }

    /// Publishes queued reports in order. Stops at the first failure and keeps
    /// the failed report at the front.
    pub fn flush<E>(
        &mut self,
        mut publish: impl FnMut(&SessionReport) -> Result<(), E>,
    ) -> Result<usize, E> {
        let mut published = 0;
        while let Some(report) = self.reports.front() {
            publish(report)?;
            self.reports.pop_front();
            published += 1;
        }
        Ok(published)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn aborted_payload_carries_reason() {
        let report = SessionReport {
            target_cm: 80.0,
            outcome: SessionOutcome::Aborted(AbortReason::ReverseLimit),
            final_height_cm: Some(70.0),
            reverse_toggles: 4,
            started_at_ms: 1_000,
            finished_at_ms: 1_500,
        };

        let value = serde_json::to_value(report.payload()).unwrap();

        assert_eq!(
            value,
            json!({
                "outcome": "ABORTED",
                "reason": "REVERSE_LIMIT",
                "targetCm": 80.0,
                "finalHeightCm": 70.0,
                "reverseToggles": 4,
                "durationMs": 500,
            })
        );
    }

    #[test]
    fn settled_payload_has_null_reason() {
        let report = SessionReport {
            target_cm: 100.0,
            outcome: SessionOutcome::Settled,
            final_height_cm: None,
            reverse_toggles: 0,
            started_at_ms: 0,
            finished_at_ms: 0,
        };

        let value = serde_json::to_value(report.payload()).unwrap();

        assert_eq!(value["outcome"], "SETTLED");
        assert!(value["reason"].is_null());
        assert!(value["finalHeightCm"].is_null());
    }

    fn report(target_cm: f32) -> SessionReport {
        SessionReport {
            target_cm,
            outcome: SessionOutcome::Settled,
            final_height_cm: Some(target_cm),
            reverse_toggles: 0,
            started_at_ms: 0,
            finished_at_ms: 1_000,
        }
    }

    #[test]
    fn backlog_keeps_reports_until_published() {
        let mut backlog = ReportBacklog::new(4);
        backlog.push(report(80.0));
        backlog.push(report(95.0));

        let failed: Result<usize, &str> = backlog.flush(|_| Err("offline"));
        assert_eq!(failed, Err("offline"));
        assert_eq!(backlog.len(), 2);

        let mut sent = Vec::new();
        let published = backlog.flush(|r| {
            sent.push(r.target_cm);
            Ok::<(), &str>(())
        });

        assert_eq!(published, Ok(2));
        assert_eq!(sent, vec![80.0, 95.0]);
        assert!(backlog.is_empty());
    }

    #[test]
    fn backlog_stops_at_first_failure() {
        let mut backlog = ReportBacklog::new(4);
        for target in [70.0, 80.0, 90.0] {
            backlog.push(report(target));
        }

        let mut calls = 0;
        let result = backlog.flush(|r| {
            calls += 1;
            if r.target_cm == 80.0 {
                Err("broker busy")
            } else {
                Ok(())
            }
        });

        assert_eq!(result, Err("broker busy"));
        assert_eq!(calls, 2);
        assert_eq!(backlog.len(), 2);
    }

    #[test]
    fn full_backlog_evicts_oldest() {
        let mut backlog = ReportBacklog::new(2);

        assert_eq!(backlog.push(report(70.0)), None);
        assert_eq!(backlog.push(report(80.0)), None);
        let evicted = backlog.push(report(90.0));

        assert_eq!(evicted.map(|r| r.target_cm), Some(70.0));
        assert_eq!(backlog.len(), 2);
    }
}

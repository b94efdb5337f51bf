//! Per-attempt progress publisher.

use std::ops::Range;
use std::sync::{Mutex, PoisonError};

use tokio_util::sync::CancellationToken;

use super::{EventKind, ProgressBus, ProgressEvent};
use crate::model::JobId;

#[derive(Default)]
struct ReporterState {
    percent: u8,
    closed: bool,
}

/// Publishes one job attempt's progress.
///
/// Percent never goes backwards, nothing is published after a terminal
/// `complete` or `error`, and a cancelled reporter stays silent.
pub struct ProgressReporter {
    bus: ProgressBus,
    project_id: String,
    job_id: Option<JobId>,
    cancel: Option<CancellationToken>,
    state: Mutex<ReporterState>,
}

impl ProgressReporter {
    pub fn new(bus: ProgressBus, project_id: impl Into<String>) -> Self {
        Self {
            bus,
            project_id: project_id.into(),
            job_id: None,
            cancel: None,
            state: Mutex::new(ReporterState::default()),
        }
    }

    pub fn for_job(mut self, job_id: JobId) -> Self {
        self.job_id = Some(job_id);
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Highest percent published so far.
    pub fn percent(&self) -> u8 {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).percent
    }

    pub fn progress(&self, stage: &str, percent: u8, message: &str) {
        self.emit(EventKind::Progress, stage, percent, message);
    }

    /// Map `step / steps` into `range` and publish.
    pub fn scaled(&self, stage: &str, range: &Range<u8>, step: u32, steps: u32, message: &str) {
        let span = range.end.saturating_sub(range.start) as u32;
        let offset = if steps == 0 { 0 } else { span * step.min(steps) / steps };
        self.progress(stage, range.start.saturating_add(offset as u8), message);
    }

    pub fn complete(&self, stage: &str, message: &str) {
        self.emit(EventKind::Complete, stage, 100, message);
    }

    pub fn error(&self, stage: &str, message: &str) {
        self.emit(EventKind::Error, stage, 0, message);
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).closed
    }

    fn emit(&self, kind: EventKind, stage: &str, percent: u8, message: &str) {
        if self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
            return;
        }
        let percent = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.closed {
                return;
            }
            state.percent = state.percent.max(percent.min(100));
            if kind != EventKind::Progress {
                state.closed = true;
            }
            state.percent
        };

        let mut event = ProgressEvent::new(&self.project_id, kind, stage, percent, message);
        event.job_id = self.job_id;
        self.bus.publish(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_is_monotonic_and_closes_on_terminal() {
        let bus = ProgressBus::new();
        let mut sub = bus.subscribe("p1");
        let reporter = ProgressReporter::new(bus.clone(), "p1");

        reporter.progress("a", 40, "");
        reporter.progress("b", 20, "");
        reporter.complete("done", "");
        reporter.progress("late", 100, "");

        let percents: Vec<u8> = std::iter::from_fn(|| sub.try_recv()).map(|e| e.percent).collect();
        assert_eq!(percents, vec![40, 40, 100]);
        assert!(reporter.is_closed());
    }

    #[test]
    fn scaled_maps_into_range() {
        let bus = ProgressBus::new();
        let mut sub = bus.subscribe("p1");
        let reporter = ProgressReporter::new(bus.clone(), "p1");
        reporter.scaled("turn", &(10..85), 3, 6, "");
        assert_eq!(sub.try_recv().unwrap().percent, 47);
    }

    #[test]
    fn cancelled_reporter_is_silent() {
        let bus = ProgressBus::new();
        let mut sub = bus.subscribe("p1");
        let token = CancellationToken::new();
        let reporter = ProgressReporter::new(bus.clone(), "p1").with_cancel(token.clone());
        token.cancel();
        reporter.progress("x", 50, "");
        assert!(sub.try_recv().is_none());
    }
}

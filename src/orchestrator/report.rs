// src/orchestrator/report.rs

use std::fmt;
use std::net::Ipv4Addr;
use thiserror::Error;

use crate::error::{Backend, BackendError, ErrorKind};
use crate::orchestrator::state::EnvState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Applied,
    /// `NotFound` on a removal; counted as success.
    AlreadyAbsent,
    Failed,
    Compensated,
    CompensationFailed,
}

impl StepOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepOutcome::Applied => "applied",
            StepOutcome::AlreadyAbsent => "already-absent",
            StepOutcome::Failed => "failed",
            StepOutcome::Compensated => "compensated",
            StepOutcome::CompensationFailed => "compensation-failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRecord {
    pub backend: Backend,
    pub action: String,
    pub outcome: StepOutcome,
    pub detail: String,
}

/// What a backend holds for the username.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Absent,
    Present,
    Address(Ipv4Addr),
    Unknown,
}

impl fmt::Display for Presence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Presence::Absent => f.write_str("absent"),
            Presence::Present => f.write_str("present"),
            Presence::Address(ip) => write!(f, "present@{}", ip),
            Presence::Unknown => f.write_str("unknown"),
        }
    }
}

/// One `(backend, expected, observed)` disagreement left for the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mismatch {
    pub backend: Backend,
    pub expected: Presence,
    pub observed: Presence,
}

impl Mismatch {
    /// The backend still holds something that should be gone.
    pub fn leftover(backend: Backend) -> Self {
        Self { backend, expected: Presence::Absent, observed: Presence::Present }
    }
}

/// Step-by-step account of one orchestrator operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationReport {
    pub username: String,
    pub steps: Vec<StepRecord>,
    pub mismatches: Vec<Mismatch>,
    pub state: EnvState,
    pub remediation: Option<String>,
}

impl OperationReport {
    pub fn new(username: &str) -> Self {
        Self {
            username: username.to_string(),
            steps: Vec::new(),
            mismatches: Vec::new(),
            state: EnvState::Absent,
            remediation: None,
        }
    }

    pub fn record(&mut self, backend: Backend, action: impl Into<String>, outcome: StepOutcome, detail: impl Into<String>) {
        self.steps.push(StepRecord {
            backend,
            action: action.into(),
            outcome,
            detail: detail.into(),
        });
    }

    pub fn applied(&mut self, backend: Backend, action: impl Into<String>) {
        self.record(backend, action, StepOutcome::Applied, "");
    }

    pub fn failed(&mut self, backend: Backend, action: impl Into<String>, err: &BackendError) {
        self.record(backend, action, StepOutcome::Failed, err.to_string());
    }

    /// Backends whose forward step landed, in order.
    pub fn landed(&self) -> Vec<Backend> {
        self.steps
            .iter()
            .filter(|s| matches!(s.outcome, StepOutcome::Applied | StepOutcome::AlreadyAbsent))
            .map(|s| s.backend)
            .collect()
    }
}

/// A failed operation. Always carries the report so callers learn which
/// steps landed and what still needs reconciling.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct OperationFailure {
    pub kind: ErrorKind,
    pub message: String,
    pub report: OperationReport,
}

impl OperationFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>, report: OperationReport) -> Self {
        Self { kind, message: message.into(), report }
    }

    /// Rejected before any backend was touched.
    pub fn rejected(kind: ErrorKind, message: impl Into<String>, username: &str, state: EnvState) -> Self {
        let mut report = OperationReport::new(username);
        report.state = state;
        Self::new(kind, message, report)
    }

    pub fn invalid(message: impl Into<String>, username: &str) -> Self {
        Self::rejected(ErrorKind::InvalidArgument, message, username, EnvState::Absent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presence_renders_addresses() {
        assert_eq!(Presence::Address(Ipv4Addr::new(10, 251, 1, 10)).to_string(), "present@10.251.1.10");
        assert_eq!(Mismatch::leftover(Backend::Dns).observed, Presence::Present);
    }

    #[test]
    fn report_tracks_successful_steps() {
        let mut report = OperationReport::new("alice");
        report.applied(Backend::Container, "remove");
        report.record(Backend::Database, "remove_account", StepOutcome::AlreadyAbsent, "");
        report.failed(Backend::Dns, "remove", &BackendError::unavailable("resolver down"));

        assert_eq!(report.landed(), vec![Backend::Container, Backend::Database]);
        assert!(report.steps[2].detail.contains("resolver down"));
    }

    #[test]
    fn failure_display_leads_with_kind() {
        let failure = OperationFailure::invalid("username must be lowercase", "Alice");
        assert_eq!(failure.to_string(), "InvalidArgument: username must be lowercase");
        assert!(failure.report.steps.is_empty());
    }
}

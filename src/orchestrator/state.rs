// src/orchestrator/state.rs

use std::fmt;

/// Why an environment ended up DEGRADED.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DegradedKind {
    /// A compensating call failed; backends disagree about the environment.
    CompensationFailed,
    /// Remove stopped part way; some backends still hold resources.
    PartialRemoval,
    /// Live under the new identity, but the old identity left remnants behind.
    CleanupPending { old_username: String },
}

impl DegradedKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DegradedKind::CompensationFailed => "compensation-failed",
            DegradedKind::PartialRemoval => "partial-removal",
            DegradedKind::CleanupPending { .. } => "cleanup-pending",
        }
    }
}

/// Lifecycle of one username.
///
/// ```text
/// ABSENT -> PROVISIONING -> ACTIVE -> (EDITING -> ACTIVE) -> REMOVING -> ABSENT
///                 \                        \                   \
///                  +-----------------------+--------------------+--> DEGRADED
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum EnvState {
    #[default]
    Absent,
    Provisioning,
    Active,
    Editing,
    Removing,
    Degraded(DegradedKind),
}

impl EnvState {
    /// An operation is in flight; the per-username lock is held.
    pub fn is_transient(&self) -> bool {
        matches!(self, EnvState::Provisioning | EnvState::Editing | EnvState::Removing)
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, EnvState::Degraded(_))
    }

    /// Lock-release states: ACTIVE, ABSENT and DEGRADED.
    pub fn is_terminal(&self) -> bool {
        !self.is_transient()
    }

    /// Legal moves driven by create/edit/remove. Repair may additionally move
    /// any terminal state to ACTIVE or ABSENT from live observation.
    pub fn can_transition(&self, to: &EnvState) -> bool {
        use EnvState::*;
        match (self, to) {
            (Absent, Provisioning) => true,
            // remove is idempotent, including on names already gone
            (Absent, Removing) => true,
            (Provisioning, Active | Absent | Degraded(_)) => true,
            (Active, Editing | Removing) => true,
            (Editing, Active | Degraded(_)) => true,
            // a rename retires the old identity
            (Editing, Absent) => true,
            (Removing, Absent | Degraded(_)) => true,
            (Degraded(_), Removing) => true,
            // repair
            (from, Active | Absent) => from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for EnvState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvState::Absent => f.write_str("ABSENT"),
            EnvState::Provisioning => f.write_str("PROVISIONING"),
            EnvState::Active => f.write_str("ACTIVE"),
            EnvState::Editing => f.write_str("EDITING"),
            EnvState::Removing => f.write_str("REMOVING"),
            EnvState::Degraded(kind) => write!(f, "DEGRADED:{}", kind.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_match_operator_vocabulary() {
        assert_eq!(EnvState::Active.to_string(), "ACTIVE");
        let pending = EnvState::Degraded(DegradedKind::CleanupPending { old_username: "alice".into() });
        assert_eq!(pending.to_string(), "DEGRADED:cleanup-pending");
        assert_eq!(EnvState::Degraded(DegradedKind::PartialRemoval).to_string(), "DEGRADED:partial-removal");
    }

    #[test]
    fn lifecycle_moves_are_ordered() {
        assert!(EnvState::Absent.can_transition(&EnvState::Provisioning));
        assert!(EnvState::Provisioning.can_transition(&EnvState::Active));
        assert!(EnvState::Active.can_transition(&EnvState::Editing));
        assert!(EnvState::Removing.can_transition(&EnvState::Absent));
        assert!(EnvState::Degraded(DegradedKind::PartialRemoval).can_transition(&EnvState::Removing));

        assert!(!EnvState::Absent.can_transition(&EnvState::Editing));
        assert!(!EnvState::Provisioning.can_transition(&EnvState::Editing));
        assert!(!EnvState::Editing.can_transition(&EnvState::Removing));
        assert!(!EnvState::Active.can_transition(&EnvState::Degraded(DegradedKind::CompensationFailed)));
    }

    #[test]
    fn repair_targets_only_leave_terminal_states() {
        let degraded = EnvState::Degraded(DegradedKind::CompensationFailed);
        assert!(degraded.can_transition(&EnvState::Active));
        assert!(degraded.can_transition(&EnvState::Absent));
        assert!(!EnvState::Removing.can_transition(&EnvState::Active));
    }
}

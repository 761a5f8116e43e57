//! Boot step records and the step state machine.
//!
//! Every boot action - mounting a filesystem, reading the table,
//! launching a daemon - is one step. A step moves
//! `Clear -> Starting -> {Passed | Failed}`, with `Retrying` as a
//! transient sub-state inside a bounded retry loop and `Canceled` as an
//! alternate terminal state meaning the step was already satisfied.

use crate::display::ItemStyle;

/// State of a boot step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StepState {
    /// No recorded result
    #[default]
    Clear,
    /// The step is executing
    Starting,
    /// A retry attempt is in progress
    Retrying,
    /// The step completed successfully
    Passed,
    /// The step failed
    Failed,
    /// The step was skipped because it was already satisfied
    Canceled,
}

impl StepState {
    /// Display style and label for this state.
    pub fn style(self) -> (ItemStyle, &'static str) {
        match self {
            StepState::Clear => (ItemStyle::Plain, ""),
            StepState::Starting => (ItemStyle::Plain, "..."),
            StepState::Retrying => (ItemStyle::Warn, "retrying"),
            StepState::Passed => (ItemStyle::Good, "ok"),
            StepState::Failed => (ItemStyle::Severe, "failed"),
            StepState::Canceled => (ItemStyle::Plain, "skipped"),
        }
    }
}

impl std::fmt::Display for StepState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StepState::Clear => "clear",
            StepState::Starting => "starting",
            StepState::Retrying => "retrying",
            StepState::Passed => "passed",
            StepState::Failed => "failed",
            StepState::Canceled => "canceled",
        };
        write!(f, "{}", name)
    }
}

/// The action a step performs, dispatched by the engine.
///
/// Variants carry stable indices into the engine-owned descriptor
/// vectors rather than references into them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    /// Load kernel modules listed in the modules file
    LoadModules,
    /// Resolve and mount the root filesystem
    MountRoot,
    /// Read the filesystem table and resolve mount overrides
    ReadFstab,
    /// Mount the virtual filesystem at this descriptor index
    MountVfs(usize),
    /// Launch and probe the daemon at this descriptor index
    StartDaemon(usize),
}

/// One entry of the engine's ordered step list.
#[derive(Debug, Clone)]
pub struct StepRecord {
    /// Name shown on the boot display
    pub name: String,
    /// Action to dispatch
    pub kind: StepKind,
    /// Whether a failure halts the boot sequence
    pub fatal: bool,
    /// Last recorded state
    pub result: StepState,
    /// How long the last execution took
    pub duration_ms: Option<u64>,
}

impl StepRecord {
    /// Create a step with no recorded result.
    pub fn new(name: impl Into<String>, kind: StepKind, fatal: bool) -> Self {
        Self {
            name: name.into(),
            kind,
            fatal,
            result: StepState::Clear,
            duration_ms: None,
        }
    }

    /// A step runs unless its last recorded result already satisfied it.
    pub fn needs_run(&self) -> bool {
        !matches!(self.result, StepState::Passed | StepState::Canceled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_step_needs_run() {
        let step = StepRecord::new("mount procfs", StepKind::MountVfs(0), true);
        assert_eq!(step.result, StepState::Clear);
        assert!(step.needs_run());
    }

    #[test]
    fn test_failed_step_is_retried_on_next_pass() {
        let mut step = StepRecord::new("start execd", StepKind::StartDaemon(2), true);
        step.result = StepState::Failed;
        assert!(step.needs_run());
    }

    #[test]
    fn test_satisfied_steps_are_skipped() {
        let mut step = StepRecord::new("start confd", StepKind::StartDaemon(1), false);
        step.result = StepState::Passed;
        assert!(!step.needs_run());
        step.result = StepState::Canceled;
        assert!(!step.needs_run());
    }

    #[test]
    fn test_state_styles() {
        assert_eq!(StepState::Passed.style().1, "ok");
        assert_eq!(StepState::Failed.style().0, ItemStyle::Severe);
        assert_eq!(StepState::Retrying.style().0, ItemStyle::Warn);
    }
}

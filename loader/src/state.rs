//! Attempt state machine and lifecycle hooks.

use std::fmt;

use crate::error::BootstrapError;

/// State of one bootstrap attempt.
///
/// `Idle → Acquiring → Compiling → Instantiating → Running → Completed`,
/// with `Failed` reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttemptState {
    Idle,
    Acquiring,
    Compiling,
    Instantiating,
    Running,
    Completed,
    Failed,
}

impl AttemptState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether `self → next` is a legal transition.
    pub fn can_advance_to(self, next: AttemptState) -> bool {
        use AttemptState::*;
        match (self, next) {
            (Idle, Acquiring)
            | (Acquiring, Compiling)
            | (Compiling, Instantiating)
            | (Instantiating, Running)
            | (Running, Completed) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for AttemptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "IDLE",
            Self::Acquiring => "ACQUIRING",
            Self::Compiling => "COMPILING",
            Self::Instantiating => "INSTANTIATING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Observer for an attempt's lifecycle.
///
/// Called inline from the attempt; implementations should return quickly.
pub trait BootstrapHooks: Send + Sync {
    fn on_transition(&self, _from: AttemptState, _to: AttemptState) {}

    /// Total bytes received so far.
    fn on_bytes_received(&self, _total: u64) {}

    fn on_failure(&self, _error: &BootstrapError) {}
}

/// Hooks that do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl BootstrapHooks for NoopHooks {}

#[cfg(test)]
mod tests {
    use super::*;
    use AttemptState::*;

    #[test]
    fn test_happy_path_transitions() {
        let path = [Idle, Acquiring, Compiling, Instantiating, Running, Completed];
        for pair in path.windows(2) {
            assert!(pair[0].can_advance_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_no_skipping_or_reordering() {
        assert!(!Idle.can_advance_to(Compiling));
        assert!(!Acquiring.can_advance_to(Instantiating));
        assert!(!Compiling.can_advance_to(Acquiring));
        assert!(!Instantiating.can_advance_to(Completed));
    }

    #[test]
    fn test_failure_from_any_live_state() {
        for state in [Idle, Acquiring, Compiling, Instantiating, Running] {
            assert!(state.can_advance_to(Failed));
        }
    }

    #[test]
    fn test_terminal_states_are_final() {
        for terminal in [Completed, Failed] {
            assert!(terminal.is_terminal());
            for next in [Idle, Acquiring, Compiling, Instantiating, Running, Completed, Failed] {
                assert!(!terminal.can_advance_to(next));
            }
        }
    }
}

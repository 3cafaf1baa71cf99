use std::fmt::Display;

use crate::error::TaskError;

/// Lifecycle of tasks and artifacts.
///
/// States only move forward: `New → Populated → Setup → Complete`. `Error`
/// can be entered from any state that isn't terminal yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum State {
    #[default]
    New,
    Populated,
    Setup,
    Complete,
    Error,
}

impl State {
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Complete | State::Error)
    }

    pub fn can_move_to(self, next: State) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == State::Error || next > self
    }

    /// Moves `self` to `next`, or fails without changing anything.
    pub(crate) fn transition(&mut self, key: &str, next: State) -> Result<(), TaskError> {
        if !self.can_move_to(next) {
            return Err(TaskError::IllegalTransition {
                key: key.to_string(),
                from: *self,
                to: next,
            });
        }

        *self = next;
        Ok(())
    }
}

impl Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            State::New => "new",
            State::Populated => "populated",
            State::Setup => "setup",
            State::Complete => "complete",
            State::Error => "error",
        })
    }
}

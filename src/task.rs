// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The reverse-communication request returned by [`crate::LbfgsB::step`].

use std::fmt;

/// What the caller must do next.
///
/// `step` always returns one of these. `Fg` and `Start` ask the caller to
/// evaluate the objective and gradient at the (possibly updated) `x` and
/// call `step` again; `NewX` reports an accepted iterate that the caller may
/// inspect before resuming; `Converged`, `Warning` and `Error` are terminal —
/// the solver must not be stepped again.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde1", derive(serde::Serialize, serde::Deserialize))]
pub enum Task {
    /// Evaluate `(f, g)` at `x` and call `step` again.
    Fg,
    /// A new, improved iterate is available for inspection; call `step`
    /// again (with `x`/`f`/`g` unchanged) to continue.
    NewX,
    /// A new line search has just begun; behaves like `Fg` for the caller.
    Start,
    /// The run has converged. Carries a short human-readable reason.
    Converged(String),
    /// A non-fatal condition was detected; the caller decides whether to
    /// stop. Carries a short human-readable reason.
    Warning(String),
    /// The run failed. Carries a short human-readable reason.
    Error(String),
}

impl Task {
    /// True for `Converged`, `Warning` and `Error`: states in which the
    /// caller must not call `step` again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Task::Converged(_) | Task::Warning(_) | Task::Error(_)
        )
    }

    /// The diagnostic message carried by `Converged`/`Warning`/`Error`, or
    /// `None` for `Fg`/`NewX`/`Start`.
    pub fn message(&self) -> Option<&str> {
        match self {
            Task::Converged(m) | Task::Warning(m) | Task::Error(m) => Some(m),
            Task::Fg | Task::NewX | Task::Start => None,
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Task::Fg => write!(f, "FG"),
            Task::NewX => write!(f, "NEWX"),
            Task::Start => write!(f, "START"),
            Task::Converged(m) => write!(f, "CONV: {m}"),
            Task::Warning(m) => write!(f, "WARN: {m}"),
            Task::Error(m) => write!(f, "ERROR: {m}"),
        }
    }
}

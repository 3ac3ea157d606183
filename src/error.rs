// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Construction-time errors.

use thiserror::Error;

/// Errors raised while constructing or configuring an [`crate::LbfgsB`].
///
/// Failures that occur once a solver is already running (a corrupted
/// workspace, a non-positive-definite preconditioner, a line-search
/// breakdown) are not represented here: they are reported through
/// [`crate::Task::Error`] instead, since by the time they can be detected
/// the reverse-communication driver is already mid-iteration and must hand
/// the caller a `Task`, not a `Result`.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum LbfgsError {
    /// A constructor or setter argument is outside its documented domain.
    #[error("invalid parameter: {text}")]
    InvalidParameter {
        /// Human-readable description of the violated constraint.
        text: String,
    },
}

impl LbfgsError {
    pub(crate) fn invalid(text: impl Into<String>) -> Self {
        LbfgsError::InvalidParameter { text: text.into() }
    }
}

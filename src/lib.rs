// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A reverse-communication, limited-memory BFGS core.
//!
//! [`LbfgsB`] approximates the inverse Hessian of a differentiable scalar
//! objective `f(x)` from the `m` most recent curvature pairs and drives a
//! safeguarded strong-Wolfe line search to produce a sequence of iterates
//! converging towards a stationary point. Optionally, an elementwise active
//! mask freezes variables pinned at a bound, and a nonnegative diagonal array
//! can be supplied as a preconditioner in place of the default scaled
//! steepest-descent initial direction.
//!
//! The solver never evaluates the objective itself. Instead, [`LbfgsB::step`]
//! returns a [`Task`] telling the caller what to do next: evaluate `(f, g)`
//! at `x` and call `step` again, inspect the current iterate, or stop because
//! the run converged, warned, or errored. This mirrors the calling convention
//! of the classic Fortran/C L-BFGS(-B) family: the optimizer holds no
//! reference to the objective and can be suspended and resumed freely between
//! calls to `step`.
//!
//! # Example
//!
//! ```
//! use lbfgsb_core::{LbfgsB, Task};
//!
//! let n = 5;
//! let mut x = vec![1.0_f64; n];
//! let mut g = vec![0.0_f64; n];
//! let mut f = 0.5 * x.iter().map(|v| v * v).sum::<f64>();
//! for (gi, xi) in g.iter_mut().zip(&x) {
//!     *gi = *xi;
//! }
//!
//! let mut solver = LbfgsB::new(n, 5).unwrap();
//! loop {
//!     match solver.step(&mut x, &mut f, &mut g, None, None) {
//!         Task::Fg | Task::Start => {
//!             f = 0.5 * x.iter().map(|v| v * v).sum::<f64>();
//!             for (gi, xi) in g.iter_mut().zip(&x) {
//!                 *gi = *xi;
//!             }
//!         }
//!         Task::NewX => continue,
//!         Task::Converged(_) => break,
//!         Task::Warning(_) | Task::Error(_) => panic!("unexpected termination"),
//!     }
//! }
//! assert!(x.iter().all(|v| v.abs() < 1e-6));
//! ```

#![warn(missing_docs)]
#![deny(clippy::float_cmp)]

mod error;
mod kernel;
mod linesearch;
mod solver;
mod task;

pub use error::LbfgsError;
pub use solver::LbfgsB;
pub use task::Task;

//! Bounded execution of external toolchain invocations.
//!
//! An [`Invocation`] is plain data: one or more stages, each with its own
//! argument vector and environment overlay, piped stdout-to-stdin. The
//! [`BoundedRunner`] launches them under a deadline and folds every way a
//! child can go wrong into an [`Outcome`].

pub mod invocation;
pub mod outcome;
pub mod process;

pub use invocation::*;
pub use outcome::*;
pub use process::*;

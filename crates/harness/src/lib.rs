//! tcforge orchestration: builds toolchain invocations for every cell of the
//! coarsening matrix, runs them under a deadline and reports the results.

pub mod builder;
#[cfg(feature = "cli")]
pub mod cli;
pub mod report;
pub mod session;
pub mod settings;
pub mod tools;

pub use builder::*;
#[cfg(feature = "cli")]
pub use cli::*;
pub use report::*;
pub use session::*;
pub use settings::*;
pub use tools::*;

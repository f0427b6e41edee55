//! Facade over the tcforge crates.

pub use tcforge_harness as harness;
pub use tcforge_matrix as matrix;
pub use tcforge_runner as runner;

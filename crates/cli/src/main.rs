//! Command-line entry point for tcforge.

use anyhow::Result;
use clap::Parser;
use std::process::ExitCode;
use tcforge_harness::cli::{run_cli, Cli};

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    run_cli(cli)
}

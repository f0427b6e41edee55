//! CLI wiring for the tcforge matrix runner.

use crate::builder::DivRegionPolicy;
use crate::report::ReportPrinter;
use crate::session::MatrixSession;
use crate::settings::{HarnessSettings, Suite};
use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tcforge_matrix::{ConfigSpace, Configuration, Direction, TestTarget};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "tcforge", about = "Thread-coarsening configuration matrix runner")]
pub struct Cli {
    /// Print report lines without color.
    #[arg(long, global = true, default_value_t = false)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run every kernel of every target over the configuration space.
    Run {
        #[command(flatten)]
        selection: SelectionArgs,
        /// Write the full report as JSON.
        #[arg(long)]
        json_report: Option<PathBuf>,
        /// Exit with status 1 when any invocation failed.
        #[arg(long, default_value_t = false)]
        strict: bool,
    },
    /// Show the targets, kernels and number of planned invocations.
    List {
        #[command(flatten)]
        selection: SelectionArgs,
    },
    /// Print the command line a single matrix cell would run.
    Show {
        #[command(flatten)]
        selection: SelectionArgs,
        #[arg(long)]
        target: String,
        #[arg(long)]
        kernel: String,
        #[arg(long, default_value_t = 0)]
        direction: u32,
        #[arg(long, default_value_t = 2)]
        factor: u32,
        #[arg(long, default_value_t = 1)]
        stride: u32,
    },
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
pub enum SuiteArg {
    Drivers,
    Sources,
}

impl From<SuiteArg> for Suite {
    fn from(value: SuiteArg) -> Suite {
        match value {
            SuiteArg::Drivers => Suite::Drivers,
            SuiteArg::Sources => Suite::Sources,
        }
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
pub enum SpaceArg {
    Standard,
    Exhaustive,
    Smoke,
}

impl From<SpaceArg> for ConfigSpace {
    fn from(value: SpaceArg) -> ConfigSpace {
        match value {
            SpaceArg::Standard => ConfigSpace::standard(),
            SpaceArg::Exhaustive => ConfigSpace::exhaustive(),
            SpaceArg::Smoke => ConfigSpace::smoke(),
        }
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
pub enum PolicyArg {
    Classic,
    MergeTrue,
    MergeFalse,
    Merge,
}

impl From<PolicyArg> for DivRegionPolicy {
    fn from(value: PolicyArg) -> DivRegionPolicy {
        match value {
            PolicyArg::Classic => DivRegionPolicy::Classic,
            PolicyArg::MergeTrue => DivRegionPolicy::MergeTrue,
            PolicyArg::MergeFalse => DivRegionPolicy::MergeFalse,
            PolicyArg::Merge => DivRegionPolicy::Merge,
        }
    }
}

/// Flags that pick what gets run. They override the settings file.
#[derive(Args, Debug, Default, Clone)]
pub struct SelectionArgs {
    /// JSON settings file.
    #[arg(long)]
    pub settings: Option<PathBuf>,
    #[arg(long, value_enum)]
    pub suite: Option<SuiteArg>,
    #[arg(long, value_enum)]
    pub space: Option<SpaceArg>,
    #[arg(long, value_delimiter = ',')]
    pub directions: Option<Vec<u32>>,
    #[arg(long, value_delimiter = ',')]
    pub factors: Option<Vec<u32>>,
    #[arg(long, value_delimiter = ',')]
    pub strides: Option<Vec<u32>>,
    /// Keep targets whose name contains this text. Repeatable.
    #[arg(long)]
    pub only: Vec<String>,
    #[arg(long, conflicts_with = "no_timeout")]
    pub timeout_secs: Option<u64>,
    /// Disable hang protection.
    #[arg(long, default_value_t = false)]
    pub no_timeout: bool,
    #[arg(long)]
    pub poll_interval_ms: Option<u64>,
    #[arg(long, value_enum)]
    pub div_region_mgt: Option<PolicyArg>,
    #[arg(long)]
    pub jobs: Option<usize>,
    /// Write the resolved settings to this file, for rerunning with `--settings`.
    #[arg(long)]
    pub save_settings: Option<PathBuf>,
}

impl SelectionArgs {
    pub fn resolve(&self) -> Result<HarnessSettings> {
        let mut settings = match &self.settings {
            Some(path) => HarnessSettings::load_from_file(path)?,
            None => HarnessSettings::default(),
        };

        if let Some(suite) = self.suite {
            settings.suite = suite.into();
            settings.registry = None;
        }
        if let Some(space) = self.space {
            settings.space = space.into();
        }
        if let Some(directions) = &self.directions {
            settings.space.directions = directions
                .iter()
                .map(|&d| Direction::try_from(d).map_err(anyhow::Error::msg))
                .collect::<Result<_>>()?;
        }
        if let Some(factors) = &self.factors {
            settings.space.factors = factors.clone();
        }
        if let Some(strides) = &self.strides {
            settings.space.strides = strides.clone();
        }
        if !self.only.is_empty() {
            settings.registry = Some(settings.registry().filter(&self.only));
        }
        if let Some(timeout_secs) = self.timeout_secs {
            settings.timeout_secs = timeout_secs;
            settings.no_timeout = false;
        }
        if self.no_timeout {
            settings.no_timeout = true;
        }
        if let Some(poll_interval_ms) = self.poll_interval_ms {
            settings.poll_interval_ms = poll_interval_ms;
        }
        if let Some(policy) = self.div_region_mgt {
            settings.div_region_mgt = policy.into();
        }
        if let Some(jobs) = self.jobs {
            settings.jobs = jobs;
        }

        settings.validate()?;
        if let Some(path) = &self.save_settings {
            settings.save_to_file(path)?;
            info!(path = %path.display(), "wrote resolved settings");
        }
        Ok(settings)
    }
}

pub fn run_cli(cli: Cli) -> Result<ExitCode> {
    let _ = tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();

    let Cli { no_color, command } = cli;
    let printer = ReportPrinter::new(!no_color && console::colors_enabled());
    let stdout = io::stdout();
    let mut out = stdout.lock();

    match command {
        Command::Run {
            selection,
            json_report,
            strict,
        } => {
            let settings = selection.resolve()?;
            let session = MatrixSession::new(
                settings.registry(),
                settings.space.clone(),
                settings.builder(),
                Arc::new(settings.runner()),
            )
            .with_printer(printer)
            .with_jobs(settings.jobs);

            let report = session.run(&mut out)?;

            if let Some(path) = json_report {
                report.save(&path)?;
                info!(path = %path.display(), "wrote JSON report");
            }

            if strict && report.has_failures() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::List { selection } => {
            let settings = selection.resolve()?;
            write_listing(&mut out, &settings)?;
        }
        Command::Show {
            selection,
            target,
            kernel,
            direction,
            factor,
            stride,
        } => {
            let settings = selection.resolve()?;
            let direction = Direction::try_from(direction).map_err(anyhow::Error::msg)?;
            let config = Configuration::new(direction, factor, stride);
            ConfigSpace::new(vec![direction], vec![factor], vec![stride]).validate()?;

            let registry = settings.registry();
            let entry = match registry.find(&target) {
                Some(entry) if entry.kernels.contains(&kernel) => entry.clone(),
                Some(_) => bail!("target {target} has no kernel named {kernel}"),
                None => TestTarget::new(target.as_str(), [kernel.as_str()]),
            };

            let invocation = settings.builder().build(&entry, &kernel, config);
            writeln!(out, "{}", invocation.display_line())?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn write_listing(out: &mut dyn Write, settings: &HarnessSettings) -> Result<()> {
    let registry = settings.registry();
    for target in registry.targets() {
        writeln!(
            out,
            "{} ({}): {}",
            target.target,
            target.kind(),
            target.kernels.join(", ")
        )?;
    }
    writeln!(
        out,
        "{} invocations planned ({} kernels x {} configurations)",
        registry.invocation_count(&settings.space),
        registry.kernel_count(),
        settings.space.len()
    )?;
    Ok(())
}

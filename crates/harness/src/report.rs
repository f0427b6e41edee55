//! Per-invocation report lines and the run summary.

use anyhow::Result;
use console::Style;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tcforge_matrix::{Configuration, TargetKind};
use tcforge_runner::{FailureKind, Outcome};

pub const SUMMARY_SEPARATOR: &str = "#################################";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportEntry {
    pub target: String,
    #[serde(default)]
    pub kind: TargetKind,
    pub kernel: String,
    pub configuration: Configuration,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
}

impl ReportEntry {
    pub fn from_outcome(
        target: &str,
        kernel: &str,
        configuration: Configuration,
        outcome: &Outcome,
    ) -> Self {
        Self {
            target: target.to_string(),
            kind: TargetKind::default(),
            kernel: kernel.to_string(),
            configuration,
            passed: outcome.is_success(),
            failure_kind: outcome.failure_kind(),
            exit_code: if outcome.is_success() {
                None
            } else {
                outcome.exit_code()
            },
            diagnostic: outcome.diagnostic().map(str::to_string),
        }
    }

    pub fn with_kind(mut self, kind: TargetKind) -> Self {
        self.kind = kind;
        self
    }

    /// `<kernel> <direction> <factor> <stride> Ok!` or `... Failure`.
    /// Kernel sources lead with the file name, since kernel names repeat
    /// across files.
    pub fn status_line(&self) -> String {
        let verdict = if self.passed { "Ok!" } else { "Failure" };
        match self.kind {
            TargetKind::Driver => format!("{} {} {}", self.kernel, self.configuration, verdict),
            TargetKind::KernelSource => format!(
                "{} {} {} {}",
                self.target, self.kernel, self.configuration, verdict
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub total_count: usize,
    pub failure_count: usize,
    pub failures_by_kind: BTreeMap<FailureKind, usize>,
    pub entries: Vec<ReportEntry>,
    pub generated_at_unix_ms: u128,
}

impl Default for RunReport {
    fn default() -> Self {
        Self::new()
    }
}

impl RunReport {
    pub fn new() -> Self {
        Self {
            total_count: 0,
            failure_count: 0,
            failures_by_kind: BTreeMap::new(),
            entries: Vec::new(),
            generated_at_unix_ms: 0,
        }
    }

    pub fn record(&mut self, entry: ReportEntry) {
        self.total_count += 1;
        if !entry.passed {
            self.failure_count += 1;
            if let Some(kind) = entry.failure_kind {
                *self.failures_by_kind.entry(kind).or_default() += 1;
            }
        }
        self.entries.push(entry);
    }

    /// Stamp the completion time.
    pub fn finish(&mut self) {
        self.generated_at_unix_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_else(|_| Duration::from_secs(0))
            .as_millis();
    }

    pub fn summary_line(&self) -> String {
        format!(
            "{} failures out of {}",
            self.failure_count, self.total_count
        )
    }

    pub fn has_failures(&self) -> bool {
        self.failure_count > 0
    }

    pub fn failures(&self) -> impl Iterator<Item = &ReportEntry> {
        self.entries.iter().filter(|entry| !entry.passed)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let report = serde_json::from_str(&json)?;
        Ok(report)
    }
}

/// Writes report lines as invocations complete.
#[derive(Debug, Clone)]
pub struct ReportPrinter {
    success: Style,
    failure: Style,
}

impl Default for ReportPrinter {
    fn default() -> Self {
        Self::new(console::colors_enabled())
    }
}

impl ReportPrinter {
    pub fn new(colored: bool) -> Self {
        let (success, failure) = if colored {
            (
                Style::new().green().bold().force_styling(true),
                Style::new().red().bold().force_styling(true),
            )
        } else {
            (Style::new(), Style::new())
        };
        Self { success, failure }
    }

    pub fn plain() -> Self {
        Self::new(false)
    }

    /// Failures print their diagnostic ahead of the status line.
    pub fn write_entry(&self, out: &mut dyn Write, entry: &ReportEntry) -> Result<()> {
        if entry.passed {
            writeln!(out, "{}", self.success.apply_to(entry.status_line()))?;
        } else {
            if let Some(diagnostic) = &entry.diagnostic {
                writeln!(out, "{}", diagnostic.trim_end())?;
            }
            writeln!(out, "{}", self.failure.apply_to(entry.status_line()))?;
        }
        out.flush()?;
        Ok(())
    }

    pub fn write_summary(&self, out: &mut dyn Write, report: &RunReport) -> Result<()> {
        writeln!(out, "{SUMMARY_SEPARATOR}")?;
        writeln!(out, "{}", report.summary_line())?;
        out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tcforge_matrix::Direction;

    fn config() -> Configuration {
        Configuration::new(Direction::X, 2, 32)
    }

    fn failed(stderr: &str) -> Outcome {
        Outcome::Failure {
            stage: 0,
            exit_code: Some(1),
            stdout: String::new(),
            stderr: stderr.to_string(),
            skipped_stages: 0,
        }
    }

    #[test]
    fn status_lines() {
        let ok = Outcome::Success {
            stdout: String::new(),
            stderr: String::new(),
        };
        let entry = ReportEntry::from_outcome("mm/mm", "mm", config(), &ok);
        assert_eq!(entry.status_line(), "mm 0 2 32 Ok!");
        assert_eq!(entry.diagnostic, None);

        let entry = ReportEntry::from_outcome("mm/mm", "mm", config(), &failed("bad arg"));
        assert_eq!(entry.status_line(), "mm 0 2 32 Failure");
        assert_eq!(entry.exit_code, Some(1));
    }

    #[test]
    fn kernel_source_lines_name_the_file() {
        let ok = Outcome::Success {
            stdout: String::new(),
            stderr: String::new(),
        };
        let correlation = ReportEntry::from_outcome("correlation.cl", "mean_kernel", config(), &ok)
            .with_kind(TargetKind::KernelSource);
        let covariance = ReportEntry::from_outcome("covariance.cl", "mean_kernel", config(), &ok)
            .with_kind(TargetKind::KernelSource);
        assert_eq!(correlation.status_line(), "correlation.cl mean_kernel 0 2 32 Ok!");
        assert_ne!(correlation.status_line(), covariance.status_line());
    }

    #[test]
    fn failure_prints_diagnostic_before_status() {
        let printer = ReportPrinter::plain();
        let entry = ReportEntry::from_outcome("mm/mm", "mm", config(), &failed("bad arg\n"));
        let mut out = Vec::new();
        printer.write_entry(&mut out, &entry).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "bad arg\nmm 0 2 32 Failure\n");
    }

    #[test]
    fn colored_lines_carry_ansi_codes() {
        let printer = ReportPrinter::new(true);
        let entry = ReportEntry::from_outcome("mm/mm", "mm", config(), &failed("x"));
        let mut out = Vec::new();
        printer.write_entry(&mut out, &entry).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("\u{1b}["));
        assert!(text.contains("mm 0 2 32 Failure"));
    }

    #[test]
    fn tallies_and_summary() {
        let mut report = RunReport::new();
        let timeout = Outcome::Timeout {
            stage: 0,
            skipped_stages: 0,
        };
        let ok = Outcome::Success {
            stdout: String::new(),
            stderr: String::new(),
        };
        report.record(ReportEntry::from_outcome("t", "k", config(), &ok));
        report.record(ReportEntry::from_outcome("t", "k", config(), &timeout));
        report.record(ReportEntry::from_outcome("t", "k", config(), &failed("e")));

        assert_eq!(report.summary_line(), "2 failures out of 3");
        assert_eq!(report.failures_by_kind[&FailureKind::Timeout], 1);
        assert_eq!(report.failures_by_kind[&FailureKind::ToolInvocationFailure], 1);
        assert_eq!(report.failures().count(), 2);

        let mut out = Vec::new();
        ReportPrinter::plain().write_summary(&mut out, &report).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            format!("{SUMMARY_SEPARATOR}\n2 failures out of 3\n")
        );
    }

    #[test]
    fn report_saves_and_loads() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("reports").join("run.json");
        let mut report = RunReport::new();
        report.record(ReportEntry::from_outcome("t", "k", config(), &failed("e")));
        report.finish();
        report.save(&path)?;

        let loaded = RunReport::load(&path)?;
        assert_eq!(loaded.failure_count, 1);
        assert_eq!(loaded.entries, report.entries);
        Ok(())
    }
}

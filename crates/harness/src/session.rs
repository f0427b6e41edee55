//! Matrix run orchestration.

use crate::builder::InvocationBuilder;
use crate::report::{ReportEntry, ReportPrinter, RunReport};
use anyhow::Result;
use rayon::prelude::*;
use std::io::Write;
use tcforge_matrix::{ConfigSpace, Configuration, TargetKind, TestRegistry, TestTarget};
use tcforge_runner::{DynExecutor, Invocation, Outcome};
use tracing::{debug, info, warn};

/// One cell of the matrix, ready to execute.
#[derive(Debug, Clone)]
pub struct PlannedInvocation {
    pub target: String,
    pub kind: TargetKind,
    pub kernel: String,
    pub configuration: Configuration,
    pub invocation: Invocation,
}

pub struct MatrixSession {
    registry: TestRegistry,
    space: ConfigSpace,
    builder: InvocationBuilder,
    executor: DynExecutor,
    printer: ReportPrinter,
    jobs: usize,
}

impl MatrixSession {
    pub fn new(
        registry: TestRegistry,
        space: ConfigSpace,
        builder: InvocationBuilder,
        executor: DynExecutor,
    ) -> Self {
        Self {
            registry,
            space,
            builder,
            executor,
            printer: ReportPrinter::default(),
            jobs: 1,
        }
    }

    pub fn with_printer(mut self, printer: ReportPrinter) -> Self {
        self.printer = printer;
        self
    }

    /// Number of invocations in flight at once. `1` runs strictly in order.
    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs.max(1);
        self
    }

    pub fn registry(&self) -> &TestRegistry {
        &self.registry
    }

    pub fn space(&self) -> &ConfigSpace {
        &self.space
    }

    pub fn planned_count(&self) -> usize {
        self.registry.invocation_count(&self.space)
    }

    /// Every invocation of a run, in execution order.
    pub fn plan(&self) -> Vec<PlannedInvocation> {
        self.registry
            .targets()
            .iter()
            .flat_map(|target| self.plan_target(target))
            .collect()
    }

    fn plan_target(&self, target: &TestTarget) -> Vec<PlannedInvocation> {
        let configurations = self.space.configurations();
        target
            .kernels
            .iter()
            .flat_map(|kernel| {
                configurations.iter().map(move |&configuration| PlannedInvocation {
                    target: target.target.clone(),
                    kind: target.kind(),
                    kernel: kernel.clone(),
                    configuration,
                    invocation: self.builder.build(target, kernel, configuration),
                })
            })
            .collect()
    }

    /// Run the whole matrix, writing one line per invocation to `out` as
    /// results arrive and the summary at the end. Individual failures never
    /// stop the run.
    pub fn run(&self, out: &mut dyn Write) -> Result<RunReport> {
        if self.space.is_empty() {
            warn!("configuration space is empty; nothing will be executed");
        }
        info!(
            targets = self.registry.targets().len(),
            kernels = self.registry.kernel_count(),
            configurations = self.space.len(),
            planned = self.planned_count(),
            jobs = self.jobs,
            "starting matrix run"
        );

        let mut report = RunReport::new();
        if self.jobs == 1 {
            self.run_sequential(out, &mut report)?;
        } else {
            self.run_parallel(out, &mut report)?;
        }

        report.finish();
        self.printer.write_summary(out, &report)?;
        info!(
            total = report.total_count,
            failures = report.failure_count,
            "matrix run finished"
        );
        Ok(report)
    }

    fn run_sequential(&self, out: &mut dyn Write, report: &mut RunReport) -> Result<()> {
        for target in self.registry.targets() {
            info!(test_target = %target.target, kind = %target.kind(), "running target");
            for planned in self.plan_target(target) {
                let outcome = self.executor.execute(&planned.invocation);
                self.fold(out, report, &planned, &outcome)?;
            }
        }
        Ok(())
    }

    /// Targets run one at a time; within a target invocations share a pool
    /// and are folded back in generator order.
    fn run_parallel(&self, out: &mut dyn Write, report: &mut RunReport) -> Result<()> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.jobs)
            .build()?;

        for target in self.registry.targets() {
            info!(test_target = %target.target, kind = %target.kind(), "running target");
            let planned = self.plan_target(target);
            let outcomes: Vec<Outcome> = pool.install(|| {
                planned
                    .par_iter()
                    .map(|p| self.executor.execute(&p.invocation))
                    .collect()
            });
            for (planned, outcome) in planned.iter().zip(&outcomes) {
                self.fold(out, report, planned, outcome)?;
            }
        }
        Ok(())
    }

    fn fold(
        &self,
        out: &mut dyn Write,
        report: &mut RunReport,
        planned: &PlannedInvocation,
        outcome: &Outcome,
    ) -> Result<()> {
        debug!(
            test_target = %planned.target,
            kernel = %planned.kernel,
            direction = %planned.configuration.direction,
            factor = planned.configuration.factor,
            stride = planned.configuration.stride,
            passed = outcome.is_success(),
            "invocation finished"
        );
        let entry = ReportEntry::from_outcome(
            &planned.target,
            &planned.kernel,
            planned.configuration,
            outcome,
        )
        .with_kind(planned.kind);
        self.printer.write_entry(out, &entry)?;
        report.record(entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ToolPaths;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tcforge_matrix::Direction;
    use tcforge_runner::{InvocationExecutor, TIME_EXPIRED};

    /// Fails every invocation whose compiler options mention stride 32 and
    /// times out factor 4 in direction 1.
    struct ScriptedExecutor {
        calls: AtomicUsize,
    }

    impl InvocationExecutor for ScriptedExecutor {
        fn execute(&self, invocation: &Invocation) -> Outcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let options = &invocation.stages[0].env["OCL_COMPILER_OPTIONS"];
            if options.contains("-coarsening-stride 32 ") {
                Outcome::Failure {
                    stage: 0,
                    exit_code: Some(1),
                    stdout: String::new(),
                    stderr: "bad arg".into(),
                    skipped_stages: 0,
                }
            } else if options.contains("-coarsening-factor 4 -coarsening-direction 1 ") {
                Outcome::Timeout {
                    stage: 0,
                    skipped_stages: 0,
                }
            } else {
                Outcome::Success {
                    stdout: String::new(),
                    stderr: String::new(),
                }
            }
        }
    }

    fn session(registry: TestRegistry, space: ConfigSpace) -> (MatrixSession, Arc<ScriptedExecutor>) {
        let executor = Arc::new(ScriptedExecutor {
            calls: AtomicUsize::new(0),
        });
        let builder = InvocationBuilder::new(ToolPaths::from_home(Path::new("/h")));
        let session = MatrixSession::new(registry, space, builder, executor.clone())
            .with_printer(ReportPrinter::plain());
        (session, executor)
    }

    fn mm_registry() -> TestRegistry {
        TestRegistry::new().with(TestTarget::new("mm", ["mm"]))
    }

    #[test]
    fn runs_every_cell_and_counts_failures() -> Result<()> {
        let (session, executor) = session(mm_registry(), ConfigSpace::standard());
        let mut out = Vec::new();
        let report = session.run(&mut out)?;

        assert_eq!(executor.calls.load(Ordering::SeqCst), 12);
        assert_eq!(report.total_count, 12);
        // stride 32: 4 failures; direction 1 factor 4 strides 1 and 2: 2 timeouts.
        assert_eq!(report.failure_count, 6);
        assert_eq!(report.summary_line(), "6 failures out of 12");
        assert_eq!(
            report.failure_count,
            report.entries.iter().filter(|e| !e.passed).count()
        );
        Ok(())
    }

    #[test]
    fn report_lines_follow_generator_order() -> Result<()> {
        let (session, _) = session(mm_registry(), ConfigSpace::standard());
        let mut out = Vec::new();
        session.run(&mut out)?;
        let text = String::from_utf8(out)?;
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines[0], "mm 0 2 1 Ok!");
        assert_eq!(lines[1], "mm 0 2 2 Ok!");
        assert_eq!(lines[2], "bad arg");
        assert_eq!(lines[3], "mm 0 2 32 Failure");
        assert!(text.contains(&format!("{TIME_EXPIRED}\nmm 1 4 1 Failure\n")));
        assert_eq!(lines.last().copied(), Some("6 failures out of 12"));
        Ok(())
    }

    #[test]
    fn total_matches_cartesian_invariant_across_targets() -> Result<()> {
        let registry = TestRegistry::new()
            .with(TestTarget::new("mm", ["mm"]))
            .with(TestTarget::new("memset", ["memset1", "memset2"]));
        let space = ConfigSpace::new(vec![Direction::X, Direction::Y], vec![1, 2, 4], vec![1]);
        let (session, executor) = session(registry, space);
        assert_eq!(session.planned_count(), 18);

        let report = session.run(&mut Vec::new())?;
        assert_eq!(report.total_count, 18);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 18);
        assert_eq!(report.entries[0].target, "mm");
        assert_eq!(report.entries[6].kernel, "memset1");
        assert_eq!(report.entries[12].kernel, "memset2");
        Ok(())
    }

    #[test]
    fn empty_space_runs_nothing() -> Result<()> {
        let space = ConfigSpace::new(vec![Direction::X], Vec::new(), vec![1]);
        let (session, executor) = session(mm_registry(), space);
        let mut out = Vec::new();
        let report = session.run(&mut out)?;
        assert_eq!(report.total_count, 0);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
        assert!(String::from_utf8(out)?.ends_with("0 failures out of 0\n"));
        Ok(())
    }

    #[test]
    fn parallel_run_matches_sequential_output() -> Result<()> {
        let registry = TestRegistry::new()
            .with(TestTarget::new("mm", ["mm"]))
            .with(TestTarget::new("mt", ["mt"]));

        let (sequential, _) = session(registry.clone(), ConfigSpace::exhaustive());
        let mut sequential_out = Vec::new();
        let sequential_report = sequential.run(&mut sequential_out)?;

        let (parallel, _) = session(registry, ConfigSpace::exhaustive());
        let parallel = parallel.with_jobs(4);
        let mut parallel_out = Vec::new();
        let parallel_report = parallel.run(&mut parallel_out)?;

        assert_eq!(sequential_out, parallel_out);
        assert_eq!(sequential_report.entries, parallel_report.entries);
        Ok(())
    }

    #[test]
    fn plan_is_deterministic() {
        let (session, _) = session(TestRegistry::driver_suite(), ConfigSpace::smoke());
        let first = session.plan();
        let second = session.plan();
        assert_eq!(first.len(), session.planned_count());
        assert!(first
            .iter()
            .zip(&second)
            .all(|(a, b)| a.invocation == b.invocation));
    }
}

//! Deadline-bounded process execution.
//!
//! Every stage is launched as the leader of its own process group so that
//! anything it forks can be killed with it. The deadline covers the whole
//! stage: waiting for exit and draining its output streams.

use crate::invocation::{Invocation, StageCommand};
use crate::outcome::Outcome;
use std::io::{self, Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(30);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);
pub const DEFAULT_CAPTURE_LIMIT: usize = 8 * 1024 * 1024;

/// How long output readers get to finish once the process group is killed.
const STREAM_GRACE: Duration = Duration::from_millis(200);

/// How long a single stage may run before it is killed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlinePolicy {
    Bounded(Duration),
    /// Wait for exit however long it takes. Must be asked for explicitly.
    Unbounded,
}

impl Default for DeadlinePolicy {
    fn default() -> Self {
        DeadlinePolicy::Bounded(DEFAULT_DEADLINE)
    }
}

impl DeadlinePolicy {
    fn expires_at(&self, started_at: Instant) -> Option<Instant> {
        match self {
            DeadlinePolicy::Bounded(limit) => Some(started_at + *limit),
            DeadlinePolicy::Unbounded => None,
        }
    }
}

/// Anything that can turn an invocation into an outcome. Implementations
/// must not share mutable state between calls.
pub trait InvocationExecutor: Send + Sync {
    fn execute(&self, invocation: &Invocation) -> Outcome;
}

pub type DynExecutor = Arc<dyn InvocationExecutor>;

#[derive(Debug, Clone)]
pub struct BoundedRunner {
    deadline: DeadlinePolicy,
    poll_interval: Duration,
    capture_limit: usize,
}

impl Default for BoundedRunner {
    fn default() -> Self {
        Self::new(DeadlinePolicy::default())
    }
}

enum StageResult {
    Exited {
        status: ExitStatus,
        stdout: Capture,
        stderr: String,
    },
    TimedOut,
    Aborted(String),
}

struct Capture {
    bytes: Vec<u8>,
    total_bytes: usize,
    /// Why the stream ended before EOF, if it did.
    note: Option<String>,
}

impl Capture {
    fn empty() -> Self {
        Self {
            bytes: Vec::new(),
            total_bytes: 0,
            note: None,
        }
    }

    fn is_complete(&self) -> bool {
        self.total_bytes == self.bytes.len() && self.note.is_none()
    }
}

/// A reader thread's result, or the channel it will arrive on.
enum Drain {
    Done(Capture),
    Pending(Receiver<Capture>),
}

impl Drain {
    fn wait(reader: Option<Receiver<Capture>>, until: Option<Instant>) -> Self {
        let Some(reader) = reader else {
            return Drain::Done(Capture::empty());
        };
        let received = match until {
            Some(until) => reader.recv_timeout(until.saturating_duration_since(Instant::now())),
            None => reader.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match received {
            Ok(capture) => Drain::Done(capture),
            Err(RecvTimeoutError::Timeout) => Drain::Pending(reader),
            Err(RecvTimeoutError::Disconnected) => Drain::Done(Capture::empty()),
        }
    }

    fn retry(self, until: Instant) -> Self {
        match self {
            Drain::Pending(reader) => Drain::wait(Some(reader), Some(until)),
            done => done,
        }
    }

    fn is_pending(&self) -> bool {
        matches!(self, Drain::Pending(_))
    }

    /// A reader still pending here is detached.
    fn into_capture(self) -> Capture {
        match self {
            Drain::Done(capture) => capture,
            Drain::Pending(_) => Capture {
                note: Some("stream still held open after the stage exited".to_string()),
                ..Capture::empty()
            },
        }
    }
}

impl BoundedRunner {
    pub fn new(deadline: DeadlinePolicy) -> Self {
        Self {
            deadline,
            poll_interval: DEFAULT_POLL_INTERVAL,
            capture_limit: DEFAULT_CAPTURE_LIMIT,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval.max(Duration::from_millis(1));
        self
    }

    pub fn with_capture_limit(mut self, capture_limit: usize) -> Self {
        self.capture_limit = capture_limit.max(1);
        self
    }

    pub fn deadline(&self) -> DeadlinePolicy {
        self.deadline
    }

    /// Run every stage in order, piping each stage's stdout into the next.
    /// The first stage that does not exit cleanly ends the pipeline.
    pub fn run(&self, invocation: &Invocation) -> Outcome {
        if invocation.stages.is_empty() {
            return Outcome::Failure {
                stage: 0,
                exit_code: None,
                stdout: String::new(),
                stderr: "invocation has no stages".to_string(),
                skipped_stages: 0,
            };
        }

        let total = invocation.stages.len();
        let mut input: Option<Vec<u8>> = None;
        let mut last = (String::new(), String::new());

        for (index, stage) in invocation.stages.iter().enumerate() {
            let skipped_stages = total - index - 1;
            let is_last = skipped_stages == 0;

            match self.run_stage(stage, input.take()) {
                StageResult::Exited {
                    status,
                    stdout,
                    stderr,
                } if status.success() => {
                    if is_last {
                        last = (render_capture(stdout), stderr);
                    } else if !stdout.is_complete() {
                        // Incomplete intermediate output is never forwarded.
                        let reason = match &stdout.note {
                            Some(note) => format!("{} output is incomplete: {note}", stage.label),
                            None => format!(
                                "{} produced {} bytes, more than the {} byte capture limit",
                                stage.label, stdout.total_bytes, self.capture_limit
                            ),
                        };
                        return Outcome::Failure {
                            stage: index,
                            exit_code: status.code(),
                            stdout: String::new(),
                            stderr: reason,
                            skipped_stages,
                        };
                    } else {
                        input = Some(stdout.bytes);
                    }
                }
                StageResult::Exited {
                    status,
                    stdout,
                    stderr,
                } => {
                    debug!(stage = %stage.label, %status, "stage failed");
                    let stderr = if stderr.trim().is_empty() {
                        describe_exit(status)
                    } else {
                        stderr
                    };
                    return Outcome::Failure {
                        stage: index,
                        exit_code: status.code(),
                        stdout: render_capture(stdout),
                        stderr,
                        skipped_stages,
                    };
                }
                StageResult::TimedOut => {
                    return Outcome::Timeout {
                        stage: index,
                        skipped_stages,
                    };
                }
                StageResult::Aborted(reason) => {
                    debug!(stage = %stage.label, reason = %reason, "stage aborted");
                    return Outcome::Failure {
                        stage: index,
                        exit_code: None,
                        stdout: String::new(),
                        stderr: reason,
                        skipped_stages,
                    };
                }
            }
        }

        Outcome::Success {
            stdout: last.0,
            stderr: last.1,
        }
    }

    fn run_stage(&self, stage: &StageCommand, input: Option<Vec<u8>>) -> StageResult {
        debug!(
            stage = %stage.label,
            command = %stage.display_line(),
            "launching stage"
        );

        let mut command = Command::new(&stage.program);
        command
            .args(&stage.args)
            .envs(&stage.env)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let started_at = Instant::now();
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(error) => {
                return StageResult::Aborted(format!(
                    "failed to launch {}: {error}",
                    stage.program.display()
                ))
            }
        };

        // Detached; never joined.
        if let (Some(bytes), Some(mut stdin)) = (input, child.stdin.take()) {
            thread::spawn(move || {
                let _ = stdin.write_all(&bytes);
            });
        }

        let limit = self.capture_limit;
        let stdout_reader = child.stdout.take().map(|s| spawn_reader(s, limit));
        let stderr_reader = child.stderr.take().map(|s| spawn_reader(s, limit));

        let status = match self.wait(&mut child, started_at) {
            Ok(Some(status)) => status,
            Ok(None) => {
                terminate_and_reap(&mut child);
                warn!(
                    stage = %stage.label,
                    elapsed_ms = started_at.elapsed().as_millis() as u64,
                    "stage exceeded its deadline and was killed"
                );
                // Readers are detached; a process that left the group may still hold the pipes.
                drop(stdout_reader);
                drop(stderr_reader);
                return StageResult::TimedOut;
            }
            Err(error) => {
                terminate_and_reap(&mut child);
                return StageResult::Aborted(format!(
                    "failed waiting for {}: {error}",
                    stage.program.display()
                ));
            }
        };

        let expires_at = self.deadline.expires_at(started_at);
        let mut stdout = Drain::wait(stdout_reader, expires_at);
        let mut stderr = Drain::wait(stderr_reader, expires_at);
        if stdout.is_pending() || stderr.is_pending() {
            warn!(
                stage = %stage.label,
                elapsed_ms = started_at.elapsed().as_millis() as u64,
                "stage exited but its output is still held open; killing its process group"
            );
            kill_process_group(&child);
            let grace = Instant::now() + STREAM_GRACE;
            stdout = stdout.retry(grace);
            stderr = stderr.retry(grace);
        }
        let stdout = stdout.into_capture();
        let stderr = stderr.into_capture();
        debug!(
            stage = %stage.label,
            %status,
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            "stage exited"
        );

        let stderr = render_capture(stderr);
        trace!(
            stage = %stage.label,
            stdout_bytes = stdout.total_bytes,
            stdout = %String::from_utf8_lossy(&stdout.bytes),
            stderr = %stderr,
            "captured streams"
        );

        StageResult::Exited {
            status,
            stdout,
            stderr,
        }
    }

    /// `Ok(None)` means the deadline passed with the child still running.
    fn wait(&self, child: &mut Child, started_at: Instant) -> io::Result<Option<ExitStatus>> {
        let Some(expires_at) = self.deadline.expires_at(started_at) else {
            return child.wait().map(Some);
        };

        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(Some(status));
            }
            let now = Instant::now();
            if now >= expires_at {
                return Ok(None);
            }
            thread::sleep(self.poll_interval.min(expires_at - now));
        }
    }
}

impl InvocationExecutor for BoundedRunner {
    fn execute(&self, invocation: &Invocation) -> Outcome {
        self.run(invocation)
    }
}

fn spawn_reader<R>(stream: R, limit: usize) -> Receiver<Capture>
where
    R: Read + Send + 'static,
{
    let (sender, receiver) = mpsc::channel();
    thread::spawn(move || {
        let _ = sender.send(read_capped(stream, limit));
    });
    receiver
}

fn read_capped<R: Read>(mut reader: R, limit: usize) -> Capture {
    let mut bytes = Vec::with_capacity(limit.min(8192));
    let mut total_bytes = 0usize;
    let mut note = None;
    let mut chunk = [0u8; 8192];

    loop {
        let read_len = match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
            Err(error) => {
                note = Some(format!("read error: {error}"));
                break;
            }
        };
        total_bytes = total_bytes.saturating_add(read_len);
        if bytes.len() < limit {
            let copy_len = read_len.min(limit - bytes.len());
            bytes.extend_from_slice(&chunk[..copy_len]);
        }
    }

    Capture {
        bytes,
        total_bytes,
        note,
    }
}

fn render_capture(capture: Capture) -> String {
    let mut text = String::from_utf8_lossy(&capture.bytes).into_owned();
    if capture.total_bytes > capture.bytes.len() {
        text.push_str(&format!(
            "\n[{} bytes truncated]",
            capture.total_bytes - capture.bytes.len()
        ));
    }
    if let Some(note) = capture.note {
        text.push_str(&format!("\n[{note}]"));
    }
    text
}

/// Diagnostic for a stage that failed without writing to stderr.
fn describe_exit(status: ExitStatus) -> String {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return if status.core_dumped() {
                format!("terminated by signal {signal} (core dumped)")
            } else {
                format!("terminated by signal {signal}")
            };
        }
    }
    status.to_string()
}

fn terminate_and_reap(child: &mut Child) {
    kill_process_group(child);
    let _ = child.kill();
    let _ = child.wait();
}

/// The child leads its group, so the group id is its pid. The id stays
/// reserved while any member is alive, even after the leader is reaped.
#[cfg(unix)]
fn kill_process_group(child: &Child) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Ok(pid) = i32::try_from(child.id()) else {
        return;
    };
    if let Err(error) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
        trace!(pid, %error, "process group already gone");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_child: &Child) {}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::outcome::FailureKind;
    use std::fs;

    fn sh(label: &str, script: &str) -> StageCommand {
        StageCommand::new(label, "sh").args(["-c", script])
    }

    fn runner(deadline: Duration) -> BoundedRunner {
        BoundedRunner::new(DeadlinePolicy::Bounded(deadline))
    }

    #[test]
    fn clean_exit_is_success_with_captured_streams() {
        let outcome = runner(Duration::from_secs(10))
            .run(&Invocation::single(sh("driver", "printf hello; printf warn >&2")));
        assert_eq!(
            outcome,
            Outcome::Success {
                stdout: "hello".into(),
                stderr: "warn".into(),
            }
        );
    }

    #[test]
    fn nonzero_exit_carries_code_and_stderr() {
        let outcome = runner(Duration::from_secs(10))
            .run(&Invocation::single(sh("driver", "printf 'bad arg' >&2; exit 1")));
        match &outcome {
            Outcome::Failure {
                stage,
                exit_code,
                stderr,
                skipped_stages,
                ..
            } => {
                assert_eq!(*stage, 0);
                assert_eq!(*exit_code, Some(1));
                assert_eq!(stderr, "bad arg");
                assert_eq!(*skipped_stages, 0);
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(
            outcome.failure_kind(),
            Some(FailureKind::ToolInvocationFailure)
        );
    }

    #[test]
    fn hung_stage_times_out_at_deadline_and_is_reaped() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let pid_file = dir.path().join("pid");
        let script = format!("echo $$ > {}; exec sleep 30", pid_file.display());
        let deadline = Duration::from_millis(300);

        let started = Instant::now();
        let outcome = runner(deadline).run(&Invocation::single(sh("driver", &script)));
        let elapsed = started.elapsed();

        assert_eq!(
            outcome,
            Outcome::Timeout {
                stage: 0,
                skipped_stages: 0,
            }
        );
        assert_eq!(outcome.diagnostic(), Some("Time expired!"));
        assert!(elapsed >= deadline, "timed out early: {elapsed:?}");
        assert!(elapsed < Duration::from_secs(10), "run stalled: {elapsed:?}");

        let pid = fs::read_to_string(&pid_file)?;
        let alive = Command::new("sh")
            .args(["-c", &format!("kill -0 {} 2>/dev/null", pid.trim())])
            .status()?
            .success();
        assert!(!alive, "timed out child is still running");
        Ok(())
    }

    /// Zombies count as gone; they are waiting on a reaper we do not control.
    #[cfg(target_os = "linux")]
    fn still_running(pid: &str) -> bool {
        let give_up_at = Instant::now() + Duration::from_secs(2);
        loop {
            let running = match fs::read_to_string(format!("/proc/{pid}/stat")) {
                Ok(stat) => !stat
                    .rsplit(')')
                    .next()
                    .is_some_and(|rest| rest.trim_start().starts_with('Z')),
                Err(_) => false,
            };
            if !running || Instant::now() >= give_up_at {
                return running;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn timeout_kills_processes_forked_by_the_stage() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let pid_file = dir.path().join("grandchild");
        let script = format!("sleep 30 & echo $! > {}; wait", pid_file.display());

        let started = Instant::now();
        let outcome = runner(Duration::from_millis(300))
            .run(&Invocation::single(sh("driver", &script)));

        assert!(matches!(outcome, Outcome::Timeout { stage: 0, .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
        let pid = fs::read_to_string(&pid_file)?;
        assert!(!still_running(pid.trim()), "forked process outlived the timeout");
        Ok(())
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn background_process_holding_output_cannot_stretch_the_deadline() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let pid_file = dir.path().join("background");
        let script = format!("sleep 30 & echo $! > {}; printf done; exit 0", pid_file.display());
        let deadline = Duration::from_secs(1);

        let started = Instant::now();
        let outcome = runner(deadline).run(&Invocation::single(sh("driver", &script)));
        let elapsed = started.elapsed();

        assert!(outcome.is_success(), "{outcome:?}");
        assert_eq!(outcome.stdout(), "done");
        assert!(
            elapsed < deadline + Duration::from_secs(2),
            "runner blocked past the deadline: {elapsed:?}"
        );
        let pid = fs::read_to_string(&pid_file)?;
        assert!(!still_running(pid.trim()), "background process was left running");
        Ok(())
    }

    #[test]
    fn signal_death_names_the_signal() {
        let outcome = runner(Duration::from_secs(10))
            .run(&Invocation::single(sh("opt", "kill -9 $$")));
        assert_eq!(outcome.exit_code(), None);
        assert_eq!(outcome.diagnostic(), Some("terminated by signal 9"));
    }

    #[test]
    fn read_error_is_noted_in_the_capture() {
        struct Unplugged {
            served: bool,
        }

        impl Read for Unplugged {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                if self.served {
                    return Err(io::Error::new(io::ErrorKind::Other, "device gone"));
                }
                self.served = true;
                buf[..4].copy_from_slice(b"part");
                Ok(4)
            }
        }

        let capture = read_capped(Unplugged { served: false }, 1024);
        assert!(!capture.is_complete());
        assert_eq!(render_capture(capture), "part\n[read error: device gone]");
    }

    #[test]
    fn missing_program_is_a_failure_not_a_panic() {
        let stage = StageCommand::new("driver", "/nonexistent/tcforge/driver").arg("mm");
        let outcome = runner(Duration::from_secs(1)).run(&Invocation::single(stage));
        match outcome {
            Outcome::Failure {
                exit_code, stderr, ..
            } => {
                assert_eq!(exit_code, None);
                assert!(stderr.contains("failed to launch"), "{stderr}");
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn first_stage_output_feeds_second_stage() {
        let invocation = Invocation::piped(
            sh("clang", "printf 'define void @mm()'"),
            sh("opt", "cat; printf ' ok' >&2"),
        );
        let outcome = runner(Duration::from_secs(10)).run(&invocation);
        assert_eq!(
            outcome,
            Outcome::Success {
                stdout: "define void @mm()".into(),
                stderr: " ok".into(),
            }
        );
    }

    #[test]
    fn failing_first_stage_aborts_pipeline() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let marker = dir.path().join("opt-ran");
        let invocation = Invocation::piped(
            sh("clang", "printf 'syntax error' >&2; exit 3"),
            sh("opt", &format!("touch {}", marker.display())),
        );
        let outcome = runner(Duration::from_secs(10)).run(&invocation);

        assert_eq!(outcome.failure_kind(), Some(FailureKind::PipelineAbort));
        assert_eq!(outcome.exit_code(), Some(3));
        assert_eq!(outcome.diagnostic(), Some("syntax error"));
        assert!(!marker.exists(), "second stage must not be launched");
        Ok(())
    }

    #[test]
    fn second_stage_failure_is_not_an_abort() {
        let invocation = Invocation::piped(sh("clang", "printf ir"), sh("opt", "exit 2"));
        let outcome = runner(Duration::from_secs(10)).run(&invocation);
        assert!(matches!(outcome, Outcome::Failure { stage: 1, .. }));
        assert_eq!(
            outcome.failure_kind(),
            Some(FailureKind::ToolInvocationFailure)
        );
    }

    #[test]
    fn unbounded_policy_waits_for_exit() {
        let outcome = BoundedRunner::new(DeadlinePolicy::Unbounded)
            .run(&Invocation::single(sh("driver", "sleep 0.2; exit 0")));
        assert!(outcome.is_success());
    }

    #[test]
    fn large_output_does_not_block_the_child() {
        let outcome = runner(Duration::from_secs(20))
            .run(&Invocation::single(sh("driver", "head -c 300000 /dev/zero")));
        assert!(outcome.is_success());
        assert_eq!(outcome.stdout().len(), 300_000);
    }
}

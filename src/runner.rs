//! Subprocess execution.
//!
//! All external commands run through this module, for consistent logging
//! and for the process-group bookkeeping that termination signals rely on.
//! Two layers are exposed:
//!
//! - [`capture`] / [`capture_status`]: run one command, collect its output.
//! - [`Sequence`]: a fluent chain of steps sharing a first-error latch.
//!   Once a step fails, later steps are skipped and [`Sequence::done`]
//!   returns the first error. Steps may override env vars, set a timeout,
//!   and attach output sinks; `pushd`/`popd` nest working directories.
//!
//! Commands never chdir the grove process itself: each step launches with
//! `Command::current_dir`, so the starting directory is restored on every
//! exit path by construction.
//!
//! A child that outlives its timeout is placed in its own process group at
//! spawn, sent SIGQUIT, given a grace window, then SIGKILLed. The same
//! group-kill runs for every active child when grove itself receives
//! SIGINT or SIGTERM.

use std::collections::HashSet;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{LazyLock, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use wait_timeout::ChildExt;

use crate::error::{Error, Result};

/// Grace window between SIGQUIT and SIGKILL for a timed-out child.
const KILL_GRACE: Duration = Duration::from_secs(10);

/// Process groups of currently-running children.
static ACTIVE_GROUPS: LazyLock<Mutex<HashSet<u32>>> = LazyLock::new(|| Mutex::new(HashSet::new()));

/// Collected output of one finished command.
#[derive(Debug, Default)]
pub struct Output {
    pub status: Option<ExitStatus>,
    pub stdout: String,
    pub stderr: String,
}

impl Output {
    pub fn success(&self) -> bool {
        self.status.is_some_and(|s| s.success())
    }

    fn exit_info(&self) -> String {
        match self.status {
            Some(status) => match status.code() {
                Some(code) => format!("exit code {code}"),
                None => "killed by signal".to_string(),
            },
            None => "timed out".to_string(),
        }
    }
}

fn register_group(pgid: u32) {
    ACTIVE_GROUPS.lock().unwrap().insert(pgid);
}

fn unregister_group(pgid: u32) {
    ACTIVE_GROUPS.lock().unwrap().remove(&pgid);
}

#[cfg(unix)]
fn signal_group(pgid: u32, signal: nix::sys::signal::Signal) {
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;
    if let Err(e) = killpg(Pid::from_raw(pgid as i32), signal) {
        log::debug!("killpg({pgid}, {signal}) failed: {e}");
    }
}

/// SIGQUIT the child's process group, wait out the grace window, SIGKILL.
fn kill_group(child: &mut Child, pgid: u32) {
    #[cfg(unix)]
    {
        use nix::sys::signal::Signal;
        signal_group(pgid, Signal::SIGQUIT);
        if child.wait_timeout(KILL_GRACE).ok().flatten().is_none() {
            signal_group(pgid, Signal::SIGKILL);
            let _ = child.wait();
        }
        return;
    }
    #[cfg(not(unix))]
    {
        let _ = pgid;
        let _ = child.kill();
        let _ = child.wait();
    }
}

/// Install a handler that group-kills every active child when grove itself
/// receives SIGINT or SIGTERM. Call once from `main`.
#[cfg(unix)]
pub fn forward_termination_signals() {
    use nix::sys::signal::Signal;
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = match Signals::new([SIGINT, SIGTERM]) {
        Ok(signals) => signals,
        Err(e) => {
            log::warn!("could not install signal handler: {e}");
            return;
        }
    };
    thread::spawn(move || {
        if let Some(signal) = signals.forever().next() {
            let groups: Vec<u32> = ACTIVE_GROUPS.lock().unwrap().iter().copied().collect();
            for pgid in &groups {
                signal_group(*pgid, Signal::SIGQUIT);
            }
            // Give children the grace window, then make sure.
            let deadline = Instant::now() + KILL_GRACE;
            while Instant::now() < deadline {
                if ACTIVE_GROUPS.lock().unwrap().is_empty() {
                    break;
                }
                thread::sleep(Duration::from_millis(100));
            }
            for pgid in ACTIVE_GROUPS.lock().unwrap().iter() {
                signal_group(*pgid, Signal::SIGKILL);
            }
            std::process::exit(128 + signal);
        }
    });
}

#[cfg(not(unix))]
pub fn forward_termination_signals() {}

fn command_line(program: &str, args: &[&str]) -> String {
    if args.is_empty() {
        program.to_string()
    } else {
        format!("{} {}", program, args.join(" "))
    }
}

/// One reader thread per stream keeps long-running commands live: lines are
/// teed to our stderr as they arrive when `tee` is set, and always buffered.
fn drain(stream: impl Read + Send + 'static, tee: bool) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buffered = String::new();
        let reader = BufReader::new(stream);
        for line in reader.lines() {
            let Ok(line) = line else { break };
            if tee {
                eprintln!("{line}");
            }
            buffered.push_str(&line);
            buffered.push('\n');
        }
        buffered
    })
}

/// Launch one command and collect its output.
///
/// On timeout the child's process group is killed and
/// [`Error::CommandTimedOut`] is returned; a non-zero exit is *not* an
/// error at this layer (callers decide what failure means).
fn launch(
    dir: &Path,
    envs: &[(String, String)],
    timeout: Option<Duration>,
    tee: bool,
    program: &str,
    args: &[&str],
) -> Result<Output> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (key, value) in envs {
        cmd.env(key, value);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let started = Instant::now();
    let mut child = cmd.spawn().map_err(|e| {
        Error::message(format!(
            "failed to launch `{}` in {}: {e}",
            command_line(program, args),
            dir.display()
        ))
    })?;
    let pgid = child.id();
    register_group(pgid);

    let stdout = drain(child.stdout.take().expect("stdout piped"), tee);
    let stderr = drain(child.stderr.take().expect("stderr piped"), tee);

    let status = match timeout {
        Some(limit) => match child.wait_timeout(limit) {
            Ok(Some(status)) => Some(status),
            Ok(None) => {
                kill_group(&mut child, pgid);
                None
            }
            Err(e) => {
                unregister_group(pgid);
                return Err(Error::Io(e));
            }
        },
        None => Some(child.wait().map_err(Error::Io)?),
    };
    unregister_group(pgid);

    let output = Output {
        status,
        stdout: stdout.join().unwrap_or_default(),
        stderr: stderr.join().unwrap_or_default(),
    };
    log::debug!(
        "[trace] cmd=\"{}\" dur={:.1}ms ok={}",
        command_line(program, args),
        started.elapsed().as_secs_f64() * 1000.0,
        output.success()
    );

    if output.status.is_none() {
        return Err(Error::CommandTimedOut {
            command: command_line(program, args),
            after: timeout.unwrap_or_default(),
        });
    }
    Ok(output)
}

/// Run a command in `dir` and return its stdout. Non-zero exit is an error
/// carrying the command line and the buffered stderr.
pub fn capture(dir: &Path, program: &str, args: &[&str]) -> Result<String> {
    log::debug!("$ {} [{}]", command_line(program, args), dir.display());
    let output = launch(dir, &[], None, false, program, args)?;
    if output.success() {
        Ok(output.stdout)
    } else {
        Err(failure(program, args, &output))
    }
}

/// Run a command and report only whether it exited zero. For commands that
/// answer through their exit code, like `git diff --quiet`.
pub fn capture_status(dir: &Path, program: &str, args: &[&str]) -> Result<bool> {
    log::debug!("$ {} [{}]", command_line(program, args), dir.display());
    let output = launch(dir, &[], None, false, program, args)?;
    Ok(output.success())
}

fn failure(program: &str, args: &[&str], output: &Output) -> Error {
    let mut msg = format!(
        "`{}` failed ({})",
        command_line(program, args),
        output.exit_info()
    );
    // Output-on-error: surface what the quiet run buffered.
    let detail = if output.stderr.trim().is_empty() {
        output.stdout.trim()
    } else {
        output.stderr.trim()
    };
    if !detail.is_empty() {
        msg.push_str("\n");
        msg.push_str(detail);
    }
    Error::message(msg)
}

/// A chain of command steps sharing a first-error latch.
///
/// ```no_run
/// use grove::runner::Sequence;
/// use std::time::Duration;
///
/// let mut seq = Sequence::new("/tmp/repo", false);
/// seq.run("git", &["fetch", "origin"])
///     .pushd("sub")
///     .step()
///     .timeout(Duration::from_secs(30))
///     .run("git", &["status"])
///     .popd();
/// seq.done()?;
/// # Ok::<(), grove::error::Error>(())
/// ```
pub struct Sequence {
    verbose: bool,
    dirs: Vec<PathBuf>,
    err: Option<Error>,
}

impl Sequence {
    pub fn new(dir: impl Into<PathBuf>, verbose: bool) -> Self {
        Sequence {
            verbose,
            dirs: vec![dir.into()],
            err: None,
        }
    }

    fn current_dir(&self) -> &Path {
        self.dirs.last().expect("dir stack never empty")
    }

    pub fn failed(&self) -> bool {
        self.err.is_some()
    }

    /// Enter a directory, resolved against the current step directory.
    /// Nested pushd/popd pairs behave as a stack.
    pub fn pushd(&mut self, dir: impl AsRef<Path>) -> &mut Self {
        if self.err.is_none() {
            let next = self.current_dir().join(dir.as_ref());
            self.trace(&format!("pushd {}", next.display()));
            self.dirs.push(next);
        }
        self
    }

    pub fn popd(&mut self) -> &mut Self {
        if self.err.is_none() {
            if self.dirs.len() > 1 {
                self.dirs.pop();
                self.trace("popd");
            } else {
                self.err = Some(Error::message("popd without matching pushd"));
            }
        }
        self
    }

    /// Run a step with default options.
    pub fn run(&mut self, program: &str, args: &[&str]) -> &mut Self {
        self.step().run(program, args)
    }

    /// Start building a step with overrides.
    pub fn step(&mut self) -> Step<'_> {
        Step {
            seq: self,
            envs: Vec::new(),
            timeout: None,
            stdout_sink: None,
            stderr_sink: None,
        }
    }

    /// Finish the sequence: restore the starting directory and yield the
    /// first error, if any step failed.
    pub fn done(&mut self) -> Result<()> {
        self.dirs.truncate(1);
        match self.err.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn trace(&self, line: &str) {
        if self.verbose {
            let indent = "  ".repeat(self.dirs.len() - 1);
            eprintln!(
                "[{}] {indent}>> {line}",
                chrono::Local::now().format("%H:%M:%S%.3f")
            );
        }
    }

    fn execute(
        &mut self,
        envs: &[(String, String)],
        timeout: Option<Duration>,
        stdout_sink: Option<&mut dyn Write>,
        stderr_sink: Option<&mut dyn Write>,
        program: &str,
        args: &[&str],
    ) {
        if self.err.is_some() {
            return;
        }
        self.trace(&command_line(program, args));
        log::debug!(
            "$ {} [{}]",
            command_line(program, args),
            self.current_dir().display()
        );
        let result = launch(
            self.current_dir(),
            envs,
            timeout,
            self.verbose,
            program,
            args,
        );
        match result {
            Ok(output) => {
                if let Some(sink) = stdout_sink {
                    let _ = sink.write_all(output.stdout.as_bytes());
                }
                if let Some(sink) = stderr_sink {
                    let _ = sink.write_all(output.stderr.as_bytes());
                }
                if output.success() {
                    self.trace(&format!("ok ({})", output.exit_info()));
                } else {
                    self.err = Some(failure(program, args, &output));
                }
            }
            Err(err) => self.err = Some(err),
        }
    }
}

/// Per-step options; built by [`Sequence::step`] and consumed by
/// [`Step::run`].
pub struct Step<'a> {
    seq: &'a mut Sequence,
    envs: Vec<(String, String)>,
    timeout: Option<Duration>,
    stdout_sink: Option<&'a mut dyn Write>,
    stderr_sink: Option<&'a mut dyn Write>,
}

impl<'a> Step<'a> {
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn timeout(mut self, limit: Duration) -> Self {
        self.timeout = Some(limit);
        self
    }

    pub fn stdout(mut self, sink: &'a mut dyn Write) -> Self {
        self.stdout_sink = Some(sink);
        self
    }

    pub fn stderr(mut self, sink: &'a mut dyn Write) -> Self {
        self.stderr_sink = Some(sink);
        self
    }

    pub fn run(self, program: &str, args: &[&str]) -> &'a mut Sequence {
        let Step {
            seq,
            envs,
            timeout,
            stdout_sink,
            stderr_sink,
        } = self;
        seq.execute(&envs, timeout, stdout_sink, stderr_sink, program, args);
        seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_latches_first_error() {
        let mut seq = Sequence::new("/", false);
        seq.run("false", &[]).run("sh", &["-c", "echo should-not-run; exit 3"]);
        let err = seq.done().unwrap_err();
        // The second step's exit code must not overwrite the first failure.
        assert!(!err.to_string().contains("exit code 3"), "{err}");
    }

    #[test]
    fn sequence_skips_after_failure() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");
        let mut seq = Sequence::new(dir.path(), false);
        seq.run("false", &[])
            .run("touch", &[marker.to_str().unwrap()]);
        assert!(seq.done().is_err());
        assert!(!marker.exists());
    }

    #[test]
    fn step_captures_stdout() {
        let mut buf = Vec::new();
        let mut seq = Sequence::new("/", false);
        seq.step().stdout(&mut buf).run("echo", &["hello"]);
        seq.done().unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), "hello\n");
    }

    #[test]
    fn step_env_override() {
        let mut buf = Vec::new();
        let mut seq = Sequence::new("/", false);
        seq.step()
            .env("GROVE_TEST_VALUE", "42")
            .stdout(&mut buf)
            .run("sh", &["-c", "echo $GROVE_TEST_VALUE"]);
        seq.done().unwrap();
        assert_eq!(String::from_utf8(buf).unwrap().trim(), "42");
    }

    #[test]
    fn pushd_popd_nest() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let mut buf = Vec::new();
        let mut seq = Sequence::new(dir.path(), false);
        seq.pushd("sub").step().stdout(&mut buf).run("pwd", &[]);
        seq.popd();
        seq.done().unwrap();
        let printed = String::from_utf8(buf).unwrap();
        assert!(printed.trim().ends_with("sub"), "{printed}");
    }

    #[test]
    fn unbalanced_popd_is_an_error() {
        let mut seq = Sequence::new("/", false);
        seq.popd();
        assert!(seq.done().is_err());
    }

    #[test]
    fn timeout_kills_and_reports_distinct_error() {
        let mut seq = Sequence::new("/", false);
        let started = Instant::now();
        seq.step()
            .timeout(Duration::from_millis(200))
            .run("sleep", &["30"]);
        let err = seq.done().unwrap_err();
        assert!(matches!(err, Error::CommandTimedOut { .. }), "{err}");
        assert!(started.elapsed() < Duration::from_secs(20));
    }

    #[test]
    fn done_restores_starting_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let mut seq = Sequence::new(dir.path(), false);
        seq.pushd("sub").run("false", &[]);
        let _ = seq.done();
        // After done() the next step runs from the starting directory again.
        let mut buf = Vec::new();
        seq.step().stdout(&mut buf).run("pwd", &[]);
        seq.done().unwrap();
        assert!(!String::from_utf8(buf).unwrap().trim().ends_with("sub"));
    }

    #[test]
    fn capture_reports_stderr_on_failure() {
        let err = capture(Path::new("/"), "sh", &["-c", "echo oops >&2; exit 1"]).unwrap_err();
        assert!(err.to_string().contains("oops"), "{err}");
    }

    #[test]
    fn capture_status_maps_exit_code() {
        assert!(capture_status(Path::new("/"), "true", &[]).unwrap());
        assert!(!capture_status(Path::new("/"), "false", &[]).unwrap());
    }
}

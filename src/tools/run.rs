//! Runs a single external tool invocation with a sanitized
//! environment and a per-call timeout.
//!
//! The teacher never shells out — it talks to LLVM through the C API
//! in-process — so this is new code, but it follows the plain
//! `std::process::Command` usage shown throughout the pack (e.g.
//! `xtask/src/containers.rs`, `other_examples/.../espup__src-utils.rs`).
//! No async runtime is pulled in: nothing in the example pack depends
//! on `tokio`, so a blocking poll-and-kill loop is the idiomatic fit
//! here instead.

use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::diagnostic::render_command;

/// Default timeout applied when the caller configures zero or a
/// negative duration.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// How often the runner polls the child for exit while waiting.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// The outcome of a subprocess invocation that was actually run to
/// completion or to its timeout — as opposed to failing to spawn at
/// all, which is a plain `std::io::Error`.
#[derive(Debug)]
pub struct ToolOutput {
    /// Shell-safe rendering of the command that ran, for logs/diagnostics.
    pub command: String,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// `None` if the process was killed due to the timeout.
    pub status: Option<std::process::ExitStatus>,
    pub timed_out: bool,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.is_some_and(|s| s.success())
    }

    pub fn stderr_string(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    pub fn stdout_string(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

/// Runs `bin args...` with a minimal environment (locale=C, UTC, and
/// only `PATH`/`HOME`/`TMPDIR` passed through) and the given timeout.
///
/// A zero or negative timeout is normalized to [`DEFAULT_TIMEOUT`].
/// Returns `Ok` even when the process exits non-zero, so the caller
/// can include stdout/stderr in its own diagnostic; only a failure to
/// spawn the process at all is an `Err`.
pub fn run(bin: &Path, args: &[String], timeout: Duration) -> std::io::Result<ToolOutput> {
    let timeout = if timeout.is_zero() {
        DEFAULT_TIMEOUT
    } else {
        timeout
    };

    let command = render_command(&bin.to_string_lossy(), args);

    let mut cmd = Command::new(bin);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .env_clear()
        .env("LC_ALL", "C")
        .env("TZ", "UTC");
    for var in ["PATH", "HOME", "TMPDIR"] {
        if let Ok(value) = std::env::var(var) {
            cmd.env(var, value);
        }
    }

    let mut child = cmd.spawn()?;

    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();
    let stdout_reader = thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(pipe) = stdout_pipe.as_mut() {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    });
    let stderr_reader = thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(pipe) = stderr_pipe.as_mut() {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    });

    let (status, timed_out) = wait_with_timeout(&mut child, timeout);

    let stdout = stdout_reader.join().unwrap_or_default();
    let stderr = stderr_reader.join().unwrap_or_default();

    Ok(ToolOutput {
        command,
        stdout,
        stderr,
        status,
        timed_out,
    })
}

fn wait_with_timeout(
    child: &mut Child,
    timeout: Duration,
) -> (Option<std::process::ExitStatus>, bool) {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return (Some(status), false),
            Ok(None) => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    return (None, true);
                }
                thread::sleep(POLL_INTERVAL);
            }
            Err(_) => return (None, false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_true_successfully() {
        let output = run(Path::new("/bin/true"), &[], Duration::from_secs(5)).unwrap();
        assert!(output.success());
        assert!(!output.timed_out);
    }

    #[test]
    fn captures_stdout_and_nonzero_exit() {
        let output = run(
            Path::new("/bin/sh"),
            &["-c".to_owned(), "echo hello; exit 3".to_owned()],
            Duration::from_secs(5),
        )
        .unwrap();
        assert!(!output.success());
        assert_eq!(output.stdout_string().trim(), "hello");
        assert_eq!(output.status.unwrap().code(), Some(3));
    }

    #[test]
    fn times_out_long_running_process() {
        let output = run(
            Path::new("/bin/sh"),
            &["-c".to_owned(), "sleep 5".to_owned()],
            Duration::from_millis(100),
        )
        .unwrap();
        assert!(output.timed_out);
        assert!(output.status.is_none());
    }

    #[test]
    fn zero_timeout_normalizes_to_default() {
        let output = run(Path::new("/bin/true"), &[], Duration::ZERO).unwrap();
        assert!(output.success());
    }

    #[test]
    fn command_rendering_quotes_whitespace() {
        let output = run(
            Path::new("/bin/echo"),
            &["a b".to_owned()],
            Duration::from_secs(5),
        )
        .unwrap();
        assert!(output.command.contains("\"a b\""));
    }
}

//! The diagnostic model: every failure the pipeline can produce is a
//! [`Diagnostic`] tagged with a [`Stage`] and a [`Code`], carrying the
//! command that ran (if any), captured stderr, a human-facing hint,
//! and whether retrying might help.
//!
//! Modeled after `bpf-linker`'s `LinkerError`: one flat enum of typed
//! failure variants rendered through `thiserror`, except here the
//! stage/code pair is reusable across many failure shapes instead of
//! one variant per shape.

use std::error::Error as StdError;
use std::fmt;

/// A pipeline stage, used to tag diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    DiscoverTools,
    InputNormalization,
    LlvmLink,
    Transform,
    Opt,
    Llc,
    Finalize,
    Btf,
    ElfValidate,
}

impl Stage {
    fn as_str(self) -> &'static str {
        match self {
            Self::DiscoverTools => "discover-tools",
            Self::InputNormalization => "input-normalization",
            Self::LlvmLink => "llvm-link",
            Self::Transform => "transform",
            Self::Opt => "opt",
            Self::Llc => "llc",
            Self::Finalize => "finalize",
            Self::Btf => "btf",
            Self::ElfValidate => "elf-validate",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stable, test-assertable failure code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Code {
    ToolNotFound,
    InvalidInput,
    Timeout,
    ToolExecutionFailed,
    ElfValidationFailed,
}

impl Code {
    fn as_str(self) -> &'static str {
        match self {
            Self::ToolNotFound => "TOOL_NOT_FOUND",
            Self::InvalidInput => "INVALID_INPUT",
            Self::Timeout => "TIMEOUT",
            Self::ToolExecutionFailed => "TOOL_EXECUTION_FAILED",
            Self::ElfValidationFailed => "ELF_VALIDATION_FAILED",
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How many lines of captured stderr to keep in a rendered diagnostic.
const MAX_STDERR_LINES: usize = 20;

/// A structured pipeline failure.
///
/// Construct with [`Diagnostic::new`] or [`Diagnostic::classify`]; the
/// latter derives `code`/`retry` from `stage` and the captured stderr
/// following the classification rules in the spec.
pub struct Diagnostic {
    pub stage: Stage,
    pub code: Code,
    pub retry: bool,
    pub command: Option<String>,
    pub stderr: Option<String>,
    pub hint: Option<String>,
    pub inner: Option<Box<dyn StdError + Send + Sync + 'static>>,
}

impl Diagnostic {
    pub fn new(stage: Stage, code: Code) -> Self {
        Self {
            stage,
            code,
            retry: false,
            command: None,
            stderr: None,
            hint: None,
            inner: None,
        }
    }

    /// Builds a diagnostic by applying the classification rules:
    ///
    /// - `deadline_exceeded` (the runner's own per-invocation timeout
    ///   firing), or stderr mentioning "timed out", classifies as
    ///   `TIMEOUT` with `retry = true`;
    /// - otherwise `discover` stage classifies as `TOOL_NOT_FOUND`;
    /// - `input` stage classifies as `INVALID_INPUT`;
    /// - `validate` stage classifies as `ELF_VALIDATION_FAILED`;
    /// - any other stage classifies as `TOOL_EXECUTION_FAILED`.
    pub fn classify(
        stage: Stage,
        source: Option<Box<dyn StdError + Send + Sync + 'static>>,
        stderr: Option<String>,
        deadline_exceeded: bool,
    ) -> Self {
        let timed_out = deadline_exceeded
            || stderr
                .as_deref()
                .is_some_and(|s| s.to_lowercase().contains("timed out"));
        let (code, retry) = if timed_out {
            (Code::Timeout, true)
        } else {
            match stage {
                Stage::DiscoverTools => (Code::ToolNotFound, false),
                Stage::InputNormalization => (Code::InvalidInput, false),
                Stage::ElfValidate => (Code::ElfValidationFailed, false),
                _ => (Code::ToolExecutionFailed, false),
            }
        };
        Self {
            stage,
            code,
            retry,
            command: None,
            stderr,
            hint: None,
            inner: source,
        }
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn with_stderr(mut self, stderr: impl Into<String>) -> Self {
        self.stderr = Some(stderr.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_retry(mut self, retry: bool) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.inner = Some(Box::new(source));
        self
    }

    /// Whether this diagnostic, or any diagnostic found by walking
    /// `source()` chains, carries the given stage.
    pub fn is_stage(&self, stage: Stage) -> bool {
        if self.stage == stage {
            return true;
        }
        let mut cause = StdError::source(self);
        while let Some(err) = cause {
            if let Some(diag) = err.downcast_ref::<Diagnostic>() {
                if diag.stage == stage {
                    return true;
                }
            }
            cause = err.source();
        }
        false
    }

    fn trimmed_stderr(&self) -> Option<String> {
        let stderr = self.stderr.as_deref()?;
        let lines: Vec<&str> = stderr.lines().collect();
        if lines.len() <= MAX_STDERR_LINES {
            return Some(stderr.to_owned());
        }
        let mut out = lines[..MAX_STDERR_LINES].join("\n");
        out.push_str("\n…(truncated)");
        Some(out)
    }
}

impl fmt::Debug for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Diagnostic")
            .field("stage", &self.stage)
            .field("code", &self.code)
            .field("retry", &self.retry)
            .field("command", &self.command)
            .field("hint", &self.hint)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "[{}] {}", self.stage, self.code)?;
        if let Some(command) = &self.command {
            writeln!(f, "command: {command}")?;
        }
        if let Some(inner) = &self.inner {
            writeln!(f, "caused by: {inner}")?;
        }
        if let Some(stderr) = self.trimmed_stderr() {
            writeln!(f, "stderr:\n{stderr}")?;
        }
        if let Some(hint) = &self.hint {
            writeln!(f, "hint: {hint}")?;
        }
        if self.retry {
            writeln!(f, "this failure might be transient, retrying may help")?;
        }
        Ok(())
    }
}

impl StdError for Diagnostic {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .as_ref()
            .map(|e| e.as_ref() as &(dyn StdError + 'static))
    }
}

/// Quotes a single shell argument for log rendering if it contains
/// whitespace or quotes; otherwise returns it unchanged.
pub(crate) fn shell_quote(arg: &str) -> String {
    if arg.is_empty() || arg.chars().any(|c| c.is_whitespace() || c == '"' || c == '\'') {
        format!("\"{}\"", arg.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        arg.to_owned()
    }
}

/// Renders a command + args vector into a shell-safe log string.
pub(crate) fn render_command(bin: &str, args: &[String]) -> String {
    let mut out = shell_quote(bin);
    for arg in args {
        out.push(' ');
        out.push_str(&shell_quote(arg));
    }
    out
}

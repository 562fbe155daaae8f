//! Pipeline configuration: a record of user intent, validated once at
//! the start of a run.
//!
//! Shaped like the teacher's `LinkerOptions` — a plain struct filled
//! in by the caller — but built through a small `with_*` builder since
//! the field count here is larger and most fields have sane defaults.

use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use crate::cancellation::Cancellation;
use crate::tools::ToolOverrides;

/// Default target CPU version when the caller doesn't specify one.
pub const DEFAULT_CPU: &str = "v3";

/// Default front-end symbol-mangling prefix stripped off helper and
/// program names (`main.bpfGetCurrentPidTgid` -> `bpfGetCurrentPidTgid`).
/// The spec leaves this as an open design question rather than a fixed
/// constant, so it's a configuration value here.
pub const DEFAULT_MANGLING_PREFIX: &str = "main.";

/// Named optimization profiles. A profile expands to a `-passes=`
/// string at the `opt` invocation in the orchestrator; callers who
/// need more control can supply an explicit pipeline string instead
/// (see [`OptSpec::Explicit`]).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OptProfile {
    Conservative,
    Default,
    Aggressive,
    VerifierSafe,
}

impl OptProfile {
    /// The `-passes=` string this profile expands to.
    pub fn passes(self) -> &'static str {
        match self {
            Self::Conservative => "default<O1>",
            Self::Default => "default<O2>",
            Self::Aggressive => "default<O3>",
            Self::VerifierSafe => "default<O2>,simplifycfg<no-switch-range-to-icmp>",
        }
    }
}

impl fmt::Display for OptProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Conservative => "conservative",
            Self::Default => "default",
            Self::Aggressive => "aggressive",
            Self::VerifierSafe => "verifier-safe",
        };
        f.write_str(s)
    }
}

/// Either a named profile or an explicit `-passes=` pipeline string
/// supplied by the caller.
#[derive(Clone, Debug)]
pub enum OptSpec {
    Profile(OptProfile),
    Explicit(String),
}

impl Default for OptSpec {
    fn default() -> Self {
        Self::Profile(OptProfile::Default)
    }
}

/// Configuration for a single pipeline run.
pub struct PipelineConfig {
    pub inputs: Vec<PathBuf>,
    pub output: PathBuf,
    pub cpu: String,
    pub timeout: Duration,
    pub keep_temp: bool,
    pub temp_dir: Option<PathBuf>,
    pub verbose: bool,
    pub dump_ir: bool,
    pub enable_btf: bool,
    pub jobs: usize,
    pub programs: Vec<String>,
    pub sections: HashMap<String, String>,
    pub opt: OptSpec,
    pub custom_passes: Vec<String>,
    pub tool_overrides: ToolOverrides,
    pub enable_core: bool,
    pub mangling_prefix: String,
    pub cancellation: Cancellation,
    pub stdout: Box<dyn Write + Send>,
    pub stderr: Box<dyn Write + Send>,
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("inputs", &self.inputs)
            .field("output", &self.output)
            .field("cpu", &self.cpu)
            .field("timeout", &self.timeout)
            .field("keep_temp", &self.keep_temp)
            .field("temp_dir", &self.temp_dir)
            .field("verbose", &self.verbose)
            .field("dump_ir", &self.dump_ir)
            .field("enable_btf", &self.enable_btf)
            .field("jobs", &self.jobs)
            .field("programs", &self.programs)
            .field("sections", &self.sections)
            .field("custom_passes", &self.custom_passes)
            .field("enable_core", &self.enable_core)
            .field("mangling_prefix", &self.mangling_prefix)
            .field("cancellation", &self.cancellation)
            .finish_non_exhaustive()
    }
}

/// Builds a [`PipelineConfig`], filling in the defaults documented in
/// the spec (`cpu = "v3"`, `timeout = 30s`, `jobs = 1`).
pub struct PipelineConfigBuilder {
    inputs: Vec<PathBuf>,
    output: PathBuf,
    cpu: String,
    timeout: Duration,
    keep_temp: bool,
    temp_dir: Option<PathBuf>,
    verbose: bool,
    dump_ir: bool,
    enable_btf: bool,
    jobs: usize,
    programs: Vec<String>,
    sections: HashMap<String, String>,
    opt: OptSpec,
    custom_passes: Vec<String>,
    tool_overrides: ToolOverrides,
    enable_core: bool,
    mangling_prefix: String,
    cancellation: Cancellation,
    stdout: Box<dyn Write + Send>,
    stderr: Box<dyn Write + Send>,
}

impl PipelineConfigBuilder {
    pub fn new(inputs: Vec<PathBuf>, output: PathBuf) -> Self {
        Self {
            inputs,
            output,
            cpu: DEFAULT_CPU.to_owned(),
            timeout: Duration::from_secs(30),
            keep_temp: false,
            temp_dir: None,
            verbose: false,
            dump_ir: false,
            enable_btf: false,
            jobs: 1,
            programs: Vec::new(),
            sections: HashMap::new(),
            opt: OptSpec::default(),
            custom_passes: Vec::new(),
            tool_overrides: ToolOverrides::default(),
            enable_core: true,
            mangling_prefix: DEFAULT_MANGLING_PREFIX.to_owned(),
            cancellation: Cancellation::new(),
            stdout: Box::new(std::io::stdout()),
            stderr: Box::new(std::io::stderr()),
        }
    }

    pub fn cpu(mut self, cpu: impl Into<String>) -> Self {
        self.cpu = cpu.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn keep_temp(mut self, keep_temp: bool) -> Self {
        self.keep_temp = keep_temp;
        self
    }

    pub fn temp_dir(mut self, temp_dir: PathBuf) -> Self {
        self.temp_dir = Some(temp_dir);
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn dump_ir(mut self, dump_ir: bool) -> Self {
        self.dump_ir = dump_ir;
        self
    }

    pub fn enable_btf(mut self, enable_btf: bool) -> Self {
        self.enable_btf = enable_btf;
        self
    }

    pub fn jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs.max(1);
        self
    }

    pub fn programs(mut self, programs: Vec<String>) -> Self {
        self.programs = programs;
        self
    }

    pub fn sections(mut self, sections: HashMap<String, String>) -> Self {
        self.sections = sections;
        self
    }

    pub fn opt_profile(mut self, profile: OptProfile) -> Self {
        self.opt = OptSpec::Profile(profile);
        self
    }

    pub fn opt_passes(mut self, passes: impl Into<String>) -> Self {
        self.opt = OptSpec::Explicit(passes.into());
        self
    }

    pub fn custom_passes(mut self, passes: Vec<String>) -> Self {
        self.custom_passes = passes;
        self
    }

    pub fn tool_overrides(mut self, overrides: ToolOverrides) -> Self {
        self.tool_overrides = overrides;
        self
    }

    pub fn enable_core(mut self, enable_core: bool) -> Self {
        self.enable_core = enable_core;
        self
    }

    pub fn mangling_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.mangling_prefix = prefix.into();
        self
    }

    /// Shares `token` with this config: calling `token.cancel()` from
    /// another thread aborts the run at the next checkpoint between
    /// transform passes (spec §5).
    pub fn cancellation(mut self, token: Cancellation) -> Self {
        self.cancellation = token;
        self
    }

    pub fn stdout(mut self, stdout: Box<dyn Write + Send>) -> Self {
        self.stdout = stdout;
        self
    }

    pub fn stderr(mut self, stderr: Box<dyn Write + Send>) -> Self {
        self.stderr = stderr;
        self
    }

    pub fn build(self) -> PipelineConfig {
        PipelineConfig {
            inputs: self.inputs,
            output: self.output,
            cpu: self.cpu,
            timeout: self.timeout,
            keep_temp: self.keep_temp,
            temp_dir: self.temp_dir,
            verbose: self.verbose,
            dump_ir: self.dump_ir,
            enable_btf: self.enable_btf,
            jobs: self.jobs,
            programs: self.programs,
            sections: self.sections,
            opt: self.opt,
            custom_passes: self.custom_passes,
            tool_overrides: self.tool_overrides,
            enable_core: self.enable_core,
            mangling_prefix: self.mangling_prefix,
            cancellation: self.cancellation,
            stdout: self.stdout,
            stderr: self.stderr,
        }
    }
}

/// Extensions the normalizer/orchestrator accept for an input file.
pub const SUPPORTED_EXTENSIONS: &[&str] = &["ll", "bc", "o", "a"];

impl PipelineConfig {
    /// Validates the config per the orchestrator's stage 1 (spec
    /// §4.5): at least one input, a non-empty output path, and every
    /// input's extension recognized (case-insensitive).
    pub fn validate(&self) -> Result<(), String> {
        if self.inputs.is_empty() {
            return Err("at least one input file is required".to_owned());
        }
        if self.output.as_os_str().is_empty() {
            return Err("output path must not be empty".to_owned());
        }
        for input in &self.inputs {
            let ext = input
                .extension()
                .and_then(|e| e.to_str())
                .map(str::to_lowercase);
            match ext.as_deref() {
                Some(ext) if SUPPORTED_EXTENSIONS.contains(&ext) => {}
                _ => {
                    return Err(format!(
                        "unsupported input extension for {}: expected one of {:?}",
                        input.display(),
                        SUPPORTED_EXTENSIONS
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = PipelineConfigBuilder::new(vec![PathBuf::from("a.ll")], PathBuf::from("out.o"))
            .build();
        assert_eq!(cfg.cpu, "v3");
        assert_eq!(cfg.timeout, Duration::from_secs(30));
        assert_eq!(cfg.jobs, 1);
    }

    #[test]
    fn validate_rejects_empty_inputs() {
        let cfg = PipelineConfigBuilder::new(vec![], PathBuf::from("out.o")).build();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_unsupported_extension() {
        let cfg =
            PipelineConfigBuilder::new(vec![PathBuf::from("a.txt")], PathBuf::from("out.o"))
                .build();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_accepts_case_insensitive_extension() {
        let cfg =
            PipelineConfigBuilder::new(vec![PathBuf::from("a.LL")], PathBuf::from("out.o"))
                .build();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn jobs_floor_is_one() {
        let cfg = PipelineConfigBuilder::new(vec![PathBuf::from("a.ll")], PathBuf::from("out.o"))
            .jobs(0)
            .build();
        assert_eq!(cfg.jobs, 1);
    }
}

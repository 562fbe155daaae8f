//! Tool discovery: resolves executable paths for the fixed set of
//! external LLVM/binutils tools the pipeline shells out to.
//!
//! Grounded in the PATH-walking approach of the teacher's (now
//! superseded) `path.rs`, generalized from "find `libLLVM`" to "find
//! each of the six named tools", and in the `which`-crate-style
//! resolution used by `xtask/src/containers.rs`.

mod run;

pub use run::{ToolOutput, run};

use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::diagnostic::{Code, Diagnostic, Stage};

/// The fixed allow-list of external tools the pipeline may invoke.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ToolName {
    /// Concatenates IR modules (`llvm-link`).
    Linker,
    /// Runs optimization passes, accepts `-passes=<string> -S` (`opt`).
    Optimizer,
    /// Generates machine code, accepts `-march=bpf -mcpu=<cpu> -filetype=obj` (`llc`).
    Codegen,
    /// Lists/extracts archive members, accepts `t`/`p` (`llvm-ar`). Optional.
    Archiver,
    /// Extracts a named section, accepts `--dump-section=.llvmbc=<path>` (`llvm-objcopy`). Optional.
    Objcopy,
    /// Deduplicates BTF, accepts `-J <path>` (`pahole`). Optional.
    BtfDedup,
}

impl ToolName {
    /// The canonical binary name used when no override is configured.
    pub fn canonical_name(self) -> &'static str {
        match self {
            Self::Linker => "llvm-link",
            Self::Optimizer => "opt",
            Self::Codegen => "llc",
            Self::Archiver => "llvm-ar",
            Self::Objcopy => "llvm-objcopy",
            Self::BtfDedup => "pahole",
        }
    }

    /// Whether a missing tool of this kind is a fatal `discover` error.
    pub fn required(self) -> bool {
        matches!(self, Self::Linker | Self::Optimizer | Self::Codegen)
    }

    fn all() -> [Self; 6] {
        [
            Self::Linker,
            Self::Optimizer,
            Self::Codegen,
            Self::Archiver,
            Self::Objcopy,
            Self::BtfDedup,
        ]
    }
}

impl fmt::Display for ToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.canonical_name())
    }
}

/// Per-tool override: an absolute path, a bare name to resolve on
/// `PATH`, or nothing (use the canonical name).
#[derive(Clone, Debug, Default)]
pub struct ToolOverrides {
    overrides: std::collections::HashMap<ToolName, String>,
}

impl ToolOverrides {
    pub fn set(&mut self, tool: ToolName, value: impl Into<String>) -> &mut Self {
        self.overrides.insert(tool, value.into());
        self
    }

    fn get(&self, tool: ToolName) -> Option<&str> {
        self.overrides.get(&tool).map(String::as_str)
    }
}

/// Resolved paths for every tool in [`ToolName::all`]. Optional tools
/// that could not be found carry an empty path.
#[derive(Clone, Debug, Default)]
pub struct ToolSet {
    pub linker: PathBuf,
    pub optimizer: PathBuf,
    pub codegen: PathBuf,
    pub archiver: PathBuf,
    pub objcopy: PathBuf,
    pub btf_dedup: PathBuf,
}

impl ToolSet {
    pub fn path(&self, tool: ToolName) -> &Path {
        match tool {
            ToolName::Linker => &self.linker,
            ToolName::Optimizer => &self.optimizer,
            ToolName::Codegen => &self.codegen,
            ToolName::Archiver => &self.archiver,
            ToolName::Objcopy => &self.objcopy,
            ToolName::BtfDedup => &self.btf_dedup,
        }
    }

    fn set_path(&mut self, tool: ToolName, path: PathBuf) {
        match tool {
            ToolName::Linker => self.linker = path,
            ToolName::Optimizer => self.optimizer = path,
            ToolName::Codegen => self.codegen = path,
            ToolName::Archiver => self.archiver = path,
            ToolName::Objcopy => self.objcopy = path,
            ToolName::BtfDedup => self.btf_dedup = path,
        }
    }

    /// Whether `tool`'s resolved path is non-empty.
    pub fn available(&self, tool: ToolName) -> bool {
        !self.path(tool).as_os_str().is_empty()
    }
}

/// Characters that are never allowed in a resolved tool path, since
/// the path eventually feeds a shell-rendered log line and, on some
/// platforms, a shell-invoked subprocess.
const SHELL_META_BYTES: &[u8] = b";|&$`\n";

fn has_shell_meta(path: &str) -> bool {
    path.bytes().any(|b| SHELL_META_BYTES.contains(&b))
}

/// Accepts `name` itself, or `name-NN[.NN...]` where every dot-
/// separated component after the first dash is purely numeric (e.g.
/// `opt-18`, `llvm-ar-18.1`).
fn matches_versioned(candidate: &str, name: &str) -> bool {
    if candidate == name {
        return true;
    }
    let Some(suffix) = candidate.strip_prefix(name) else {
        return false;
    };
    let Some(version) = suffix.strip_prefix('-') else {
        return false;
    };
    !version.is_empty() && version.split('.').all(|part| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit()))
}

fn is_executable_file(path: &Path) -> bool {
    let Ok(meta) = fs::metadata(path) else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        meta.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

fn resolve_on_path(name: &str) -> Option<PathBuf> {
    let path_var = env::var_os("PATH")?;
    for dir in env::split_paths(&path_var) {
        let candidate = dir.join(name);
        if is_executable_file(&candidate) {
            return Some(candidate);
        }
    }
    None
}

/// Resolves a single tool given an optional override string.
///
/// - An absolute override path is validated directly as an executable
///   file.
/// - A bare override name (or, absent an override, the canonical
///   name) is resolved against `PATH`, also accepting version-suffixed
///   variants (`opt-18`).
fn resolve_one(tool: ToolName, overrides: &ToolOverrides) -> Result<Option<PathBuf>, String> {
    let requested = overrides.get(tool).unwrap_or_else(|| tool.canonical_name());

    if has_shell_meta(requested) {
        return Err(format!(
            "resolved path for `{tool}` contains unsafe characters: {requested:?}"
        ));
    }

    let requested_path = Path::new(requested);
    if requested_path.is_absolute() {
        if !is_executable_file(requested_path) {
            return Ok(None);
        }
        let path = requested_path.to_path_buf();
        let Some(path_str) = path.to_str() else {
            return Err(format!("resolved path for `{tool}` is not valid UTF-8"));
        };
        if has_shell_meta(path_str) {
            return Err(format!(
                "resolved path for `{tool}` contains unsafe characters: {path_str:?}"
            ));
        }
        return Ok(Some(path));
    }

    // Bare name: walk PATH looking for an exact or version-suffixed match.
    if let Some(path_var) = env::var_os("PATH") {
        for dir in env::split_paths(&path_var) {
            let Ok(entries) = fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let file_name = entry.file_name();
                let Some(file_name) = file_name.to_str() else {
                    continue;
                };
                if matches_versioned(file_name, requested) {
                    let candidate = dir.join(file_name);
                    if is_executable_file(&candidate) {
                        return Ok(Some(candidate));
                    }
                }
            }
        }
    }
    Ok(resolve_on_path(requested))
}

/// Discovers paths for all tools in the allow-list.
///
/// Required tools (`linker`, `optimizer`, `codegen`) missing entirely
/// produce a fatal `discover-tools`/`TOOL_NOT_FOUND` diagnostic.
/// Optional tools (`archiver`, `objcopy`, `btf_dedup`) missing simply
/// resolve to an empty path.
pub fn discover(overrides: &ToolOverrides) -> Result<ToolSet, Diagnostic> {
    let mut tools = ToolSet::default();
    for tool in ToolName::all() {
        let resolved = resolve_one(tool, overrides).map_err(|err| {
            Diagnostic::new(Stage::DiscoverTools, Code::ToolNotFound)
                .with_hint(format!(
                    "install `{tool}` or pass an explicit override for it: {err}"
                ))
        })?;
        match resolved {
            Some(path) => {
                debug!(tool = %tool, path = %path.display(), "resolved tool");
                tools.set_path(tool, path);
            }
            None if tool.required() => {
                return Err(Diagnostic::new(Stage::DiscoverTools, Code::ToolNotFound).with_hint(
                    format!(
                        "could not find required tool `{tool}` on PATH; install it or pass \
                         an explicit path via the corresponding tool-override option"
                    ),
                ));
            }
            None => {
                debug!(tool = %tool, "optional tool not found");
            }
        }
    }
    Ok(tools)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_versioned_accepts_exact_name() {
        assert!(matches_versioned("opt", "opt"));
    }

    #[test]
    fn matches_versioned_accepts_numeric_suffix() {
        assert!(matches_versioned("opt-18", "opt"));
        assert!(matches_versioned("llvm-ar-18.1", "llvm-ar"));
    }

    #[test]
    fn matches_versioned_rejects_unrelated_name() {
        assert!(!matches_versioned("optional", "opt"));
        assert!(!matches_versioned("opt-abc", "opt"));
        assert!(!matches_versioned("opt-", "opt"));
    }

    #[test]
    fn has_shell_meta_detects_metacharacters() {
        assert!(has_shell_meta("foo;rm -rf /"));
        assert!(has_shell_meta("foo\n"));
        assert!(!has_shell_meta("/usr/bin/opt-18"));
    }

    #[test]
    fn toolset_available_false_for_default() {
        let tools = ToolSet::default();
        assert!(!tools.available(ToolName::BtfDedup));
    }
}

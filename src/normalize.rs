//! Input normalizer: converts each input artifact into one or more
//! IR/bitcode files suitable for feeding to the linker.
//!
//! Archive handling shells out to the configured archiver's `t`
//! (list) and `p` (print) subcommands rather than parsing the archive
//! format in-process — unlike the teacher's `link_modules`, which
//! reads archives itself via the `ar` crate, this pipeline treats
//! `.a` extraction the same way it treats every other external tool
//! interaction: a subprocess call whose stdout is captured (§4.4,
//! §6). `.o` extraction is always delegated to `objcopy`, mirroring
//! how the teacher documents an object file as "an object file
//! containing bitcode" that still needs a tool to pull the bitcode
//! section back out.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::diagnostic::{Code, Diagnostic, Stage};
use crate::tools::{ToolName, ToolSet, run};

const BITCODE_SECTION: &str = ".llvmbc";

fn lower_ext(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
}

/// Archive members and extracted bitcode land in the caller-owned
/// workspace at 0600 (spec §5), same as every other intermediate file
/// the pipeline writes.
fn write_workspace_file(path: &Path, contents: impl AsRef<[u8]>) -> std::io::Result<()> {
    std::fs::write(path, contents)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

fn sanitize_member_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn invalid_input(hint: impl Into<String>) -> Diagnostic {
    Diagnostic::new(Stage::InputNormalization, Code::InvalidInput).with_hint(hint)
}

/// Normalizes one input artifact (recursing into archive members) and
/// returns the list of IR/bitcode files it expanded to, in order.
fn normalize_one(
    path: &Path,
    workspace: &Path,
    tools: &ToolSet,
    timeout: Duration,
    tag: &str,
) -> Result<Vec<PathBuf>, Diagnostic> {
    match lower_ext(path).as_deref() {
        Some("ll") | Some("bc") => Ok(vec![path.to_path_buf()]),
        Some("o") => Ok(vec![extract_bitcode_from_object(
            path, workspace, tools, timeout, tag,
        )?]),
        Some("a") => expand_archive(path, workspace, tools, timeout, tag),
        _ => {
            debug!(path = %path.display(), "input has no IR-bearing extension, skipping");
            Ok(Vec::new())
        }
    }
}

fn extract_bitcode_from_object(
    path: &Path,
    workspace: &Path,
    tools: &ToolSet,
    timeout: Duration,
    tag: &str,
) -> Result<PathBuf, Diagnostic> {
    if !tools.available(ToolName::Objcopy) {
        return Err(invalid_input(format!(
            "{} requires extracting embedded bitcode but no objcopy-like tool is \
             available; install `{}` or pass an override for it",
            path.display(),
            ToolName::Objcopy.canonical_name()
        )));
    }

    let out_path = workspace.join(format!("{tag}.bc"));
    let dump_arg = format!("--dump-section={BITCODE_SECTION}={}", out_path.display());
    let output = run(
        tools.path(ToolName::Objcopy),
        &[dump_arg, path.display().to_string()],
        timeout,
    )
    .map_err(|err| {
        invalid_input(format!(
            "failed to run objcopy on {}: {err}",
            path.display()
        ))
    })?;

    if !output.success() || !out_path.exists() {
        return Err(invalid_input(format!(
            "{} has no embedded `{BITCODE_SECTION}` bitcode section",
            path.display()
        ))
        .with_command(output.command)
        .with_stderr(output.stderr_string()));
    }

    let size = std::fs::metadata(&out_path).map(|m| m.len()).unwrap_or(0);
    if size == 0 {
        return Err(invalid_input(format!(
            "{} has an empty embedded `{BITCODE_SECTION}` bitcode section",
            path.display()
        )));
    }

    Ok(out_path)
}

fn expand_archive(
    path: &Path,
    workspace: &Path,
    tools: &ToolSet,
    timeout: Duration,
    tag: &str,
) -> Result<Vec<PathBuf>, Diagnostic> {
    if !tools.available(ToolName::Archiver) {
        return Err(invalid_input(format!(
            "{} requires listing archive members but no archiver tool is available; \
             install `{}` or pass an override for it",
            path.display(),
            ToolName::Archiver.canonical_name()
        )));
    }

    let list_output = run(
        tools.path(ToolName::Archiver),
        &["t".to_owned(), path.display().to_string()],
        timeout,
    )
    .map_err(|err| invalid_input(format!("failed to list members of {}: {err}", path.display())))?;

    if !list_output.success() {
        return Err(invalid_input(format!(
            "failed to list members of archive {}",
            path.display()
        ))
        .with_command(list_output.command)
        .with_stderr(list_output.stderr_string()));
    }

    let members: Vec<String> = list_output
        .stdout_string()
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_owned)
        .collect();

    let mut outputs = Vec::new();
    for (member_idx, member) in members.iter().enumerate() {
        let print_output = run(
            tools.path(ToolName::Archiver),
            &[
                "p".to_owned(),
                path.display().to_string(),
                member.clone(),
            ],
            timeout,
        )
        .map_err(|err| {
            invalid_input(format!(
                "failed to read archive member {member} from {}: {err}",
                path.display()
            ))
        })?;
        if !print_output.success() {
            warn!(archive = %path.display(), member, "ignoring archive member: failed to extract");
            continue;
        }

        let member_ext = Path::new(member)
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase);
        let member_tag = format!("{tag}-{member_idx}-{}", sanitize_member_name(member));
        let member_path = workspace.join(format!("{member_tag}.member"));

        match member_ext.as_deref() {
            Some("ll") | Some("bc") => {
                write_workspace_file(&member_path, &print_output.stdout).map_err(|err| {
                    invalid_input(format!("failed to write archive member {member}: {err}"))
                })?;
                outputs.push(member_path);
            }
            Some("o") => {
                write_workspace_file(&member_path, &print_output.stdout).map_err(|err| {
                    invalid_input(format!("failed to write archive member {member}: {err}"))
                })?;
                match extract_bitcode_from_object(&member_path, workspace, tools, timeout, &member_tag) {
                    Ok(bc) => outputs.push(bc),
                    Err(_) => {
                        debug!(archive = %path.display(), member, "ignoring archive member: no embedded bitcode");
                    }
                }
            }
            _ => {
                debug!(archive = %path.display(), member, "ignoring archive member: not IR-bearing");
            }
        }
    }

    if outputs.is_empty() {
        return Err(invalid_input(format!(
            "archive {} has no IR-bearing members",
            path.display()
        )));
    }

    Ok(outputs)
}

/// Bounded-parallel, order-preserving map over `items` using at most
/// `jobs` worker threads.
fn parallel_map<T, R, F>(items: &[T], jobs: usize, f: F) -> Vec<R>
where
    T: Sync,
    R: Send,
    F: Fn(usize, &T) -> R + Sync,
{
    let slots: Vec<Mutex<Option<R>>> = items.iter().map(|_| Mutex::new(None)).collect();
    let next = AtomicUsize::new(0);
    let workers = jobs.min(items.len()).max(1);
    thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| {
                loop {
                    let idx = next.fetch_add(1, Ordering::SeqCst);
                    if idx >= items.len() {
                        break;
                    }
                    let result = f(idx, &items[idx]);
                    *slots[idx].lock().unwrap() = Some(result);
                }
            });
        }
    });
    slots
        .into_iter()
        .map(|slot| slot.into_inner().unwrap().expect("every index is assigned exactly once"))
        .collect()
}

/// Normalizes every configured input into a single ordered list of
/// IR/bitcode paths. When `jobs > 1` and there is more than one input,
/// top-level inputs are processed on a bounded worker pool; the
/// result order always matches input order.
pub fn normalize_inputs(
    inputs: &[PathBuf],
    workspace: &Path,
    tools: &ToolSet,
    jobs: usize,
    timeout: Duration,
) -> Result<Vec<PathBuf>, Diagnostic> {
    let per_input: Vec<Result<Vec<PathBuf>, Diagnostic>> = if jobs > 1 && inputs.len() > 1 {
        parallel_map(inputs, jobs, |idx, input| {
            normalize_one(input, workspace, tools, timeout, &format!("in{idx}"))
        })
    } else {
        inputs
            .iter()
            .enumerate()
            .map(|(idx, input)| normalize_one(input, workspace, tools, timeout, &format!("in{idx}")))
            .collect()
    };

    let mut outputs = Vec::new();
    let mut errors = Vec::new();
    for result in per_input {
        match result {
            Ok(paths) => outputs.extend(paths),
            Err(diag) => errors.push(diag),
        }
    }

    if let Some(first) = errors.into_iter().reduce(|mut acc, next| {
        if let Some(hint) = next.hint {
            let acc_hint = acc.hint.get_or_insert_with(String::new);
            if !acc_hint.is_empty() {
                acc_hint.push_str("; ");
            }
            acc_hint.push_str(&hint);
        }
        acc
    }) {
        return Err(first);
    }

    if outputs.is_empty() {
        return Err(invalid_input(
            "no input produced any IR or bitcode file usable by the linker",
        ));
    }

    Ok(outputs)
}

//! The orchestrator (spec §4.5): the staged driver that turns a set of
//! configured inputs into a validated BPF ELF object.
//!
//! Mirrors the shape of the teacher's `Linker::link` — a single method
//! walking a fixed sequence of stages, each producing a diagnostic
//! tagged with its own [`Stage`] on failure — generalized from "link
//! bitcode, optionally optimize, emit an object" to the longer
//! link → transform → optimize → codegen → finalize → BTF → validate
//! chain this crate's spec calls for.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::config::{OptSpec, PipelineConfig};
use crate::diagnostic::{Code, Diagnostic, Stage};
use crate::elf;
use crate::normalize;
use crate::tools::{self, ToolName, ToolSet, run as run_tool};
use crate::transform::{self, TransformConfig};

fn stage_failed(stage: Stage, hint: impl Into<String>) -> Diagnostic {
    Diagnostic::new(stage, Code::ToolExecutionFailed).with_hint(hint)
}

/// Workspace directories are 0700 and every intermediate file written
/// into one is 0600 (spec §5): the workspace may hold a copy of the
/// linked/transformed IR, which can embed source paths and symbol
/// names from the caller's build tree.
fn secure_dir_permissions(dir: &Path) -> std::io::Result<()> {
    fs::set_permissions(dir, fs::Permissions::from_mode(0o700))
}

fn write_intermediate(path: &Path, contents: impl AsRef<[u8]>) -> std::io::Result<()> {
    fs::write(path, contents)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

/// Drives one pipeline run to completion. Holds nothing but the config
/// it was built from; every stage's state lives in the workspace
/// directory on disk, not in this struct.
pub struct Pipeline {
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }

    pub fn run(&mut self) -> Result<(), Diagnostic> {
        self.config.validate().map_err(|hint| {
            Diagnostic::new(Stage::InputNormalization, Code::InvalidInput).with_hint(hint)
        })?;

        let tool_set = tools::discover(&self.config.tool_overrides)?;

        let _keep_alive;
        let workspace = match &self.config.temp_dir {
            Some(dir) => {
                fs::create_dir_all(dir).map_err(|err| {
                    stage_failed(
                        Stage::InputNormalization,
                        format!("failed to create workspace {}: {err}", dir.display()),
                    )
                })?;
                secure_dir_permissions(dir).map_err(|err| {
                    stage_failed(
                        Stage::InputNormalization,
                        format!("failed to set permissions on workspace {}: {err}", dir.display()),
                    )
                })?;
                dir.clone()
            }
            None => {
                let dir = tempfile::Builder::new()
                    .prefix("tinybpf-linker-")
                    .tempdir()
                    .map_err(|err| {
                        stage_failed(Stage::InputNormalization, format!("failed to create workspace: {err}"))
                    })?;
                secure_dir_permissions(dir.path()).map_err(|err| {
                    stage_failed(Stage::InputNormalization, format!("failed to set workspace permissions: {err}"))
                })?;
                let path = dir.path().to_path_buf();
                if self.config.keep_temp {
                    let kept = dir.keep();
                    debug!(workspace = %kept.display(), "keeping workspace directory");
                } else {
                    _keep_alive = dir;
                }
                path
            }
        };
        info!(workspace = %workspace.display(), "running pipeline");

        let normalized = normalize::normalize_inputs(
            &self.config.inputs,
            &workspace,
            &tool_set,
            self.config.jobs,
            self.config.timeout,
        )?;

        let linked_path = workspace.join("01-linked.ll");
        self.link(&tool_set, &normalized, &linked_path)?;

        let transformed_path = workspace.join("02-transformed.ll");
        self.transform(&workspace, &linked_path, &transformed_path)?;
        self.strip_host_paths(&workspace, &transformed_path)?;

        let optimized_path = workspace.join("03-optimized.ll");
        self.optimize(&tool_set, &transformed_path, &optimized_path)?;

        let codegen_path = workspace.join("04-codegen.o");
        self.codegen(&tool_set, &optimized_path, &codegen_path)?;

        self.finalize(&codegen_path)?;

        if self.config.enable_btf {
            self.dedup_btf(&tool_set)?;
        }

        elf::validate(&self.config.output)?;

        info!(output = %self.config.output.display(), "pipeline finished");
        Ok(())
    }

    fn link(&self, tools: &ToolSet, inputs: &[PathBuf], out: &Path) -> Result<(), Diagnostic> {
        let mut args: Vec<String> = vec!["-S".to_owned(), "-o".to_owned(), out.display().to_string()];
        args.extend(inputs.iter().map(|p| p.display().to_string()));

        let output = run_tool(tools.path(ToolName::Linker), &args, self.config.timeout)
            .map_err(|err| stage_failed(Stage::LlvmLink, format!("failed to run llvm-link: {err}")))?;

        if !output.success() {
            return Err(Diagnostic::classify(
                Stage::LlvmLink,
                None,
                Some(output.stderr_string()),
                output.timed_out,
            )
            .with_command(output.command)
            .with_stderr(output.stderr_string())
            .with_hint("llvm-link failed to combine the input modules"));
        }
        Ok(())
    }

    fn transform(&self, workspace: &Path, input: &Path, out: &Path) -> Result<(), Diagnostic> {
        let text = fs::read_to_string(input)
            .map_err(|err| stage_failed(Stage::Transform, format!("failed to read {}: {err}", input.display())))?;
        let module = transform::parse(&text);

        let tcfg = TransformConfig {
            programs: self.config.programs.clone(),
            sections: self.config.sections.clone(),
            enable_core: self.config.enable_core,
            mangling_prefix: self.config.mangling_prefix.clone(),
        };

        let dump_dir = workspace.join("dump-ir");
        if self.config.dump_ir {
            fs::create_dir_all(&dump_dir).map_err(|err| {
                stage_failed(Stage::Transform, format!("failed to create dump-ir directory: {err}"))
            })?;
        }

        let mut pass_idx = 0usize;
        let mut snapshot_err = None;
        let transformed = transform::run(module, &tcfg, &self.config.cancellation, |name, snapshot| {
            if !self.config.dump_ir || snapshot_err.is_some() {
                return;
            }
            pass_idx += 1;
            let path = dump_dir.join(format!("{pass_idx:02}-{name}.ll"));
            if let Err(err) = write_intermediate(&path, transform::render(snapshot)) {
                snapshot_err = Some(stage_failed(
                    Stage::Transform,
                    format!("failed to write dump-ir snapshot {}: {err}", path.display()),
                ));
            }
        })?;
        if let Some(err) = snapshot_err {
            return Err(err);
        }

        write_intermediate(out, transform::render(&transformed))
            .map_err(|err| stage_failed(Stage::Transform, format!("failed to write {}: {err}", out.display())))?;
        Ok(())
    }

    /// Replaces every occurrence of the workspace's absolute path in the
    /// transformed IR with `.`, so the debug-info paths LLVM's printer
    /// embedded while the workspace was at its temp-dir location don't
    /// leak the builder's filesystem layout into the final object.
    fn strip_host_paths(&self, workspace: &Path, transformed: &Path) -> Result<(), Diagnostic> {
        let text = fs::read_to_string(transformed).map_err(|err| {
            stage_failed(Stage::Transform, format!("failed to read {}: {err}", transformed.display()))
        })?;
        let workspace_str = workspace.display().to_string();
        if !text.contains(&workspace_str) {
            return Ok(());
        }
        let stripped = text.replace(&workspace_str, ".");
        write_intermediate(transformed, stripped).map_err(|err| {
            stage_failed(Stage::Transform, format!("failed to write {}: {err}", transformed.display()))
        })
    }

    fn optimize(&self, tools: &ToolSet, input: &Path, out: &Path) -> Result<(), Diagnostic> {
        let passes = match &self.config.opt {
            OptSpec::Profile(profile) => profile.passes().to_owned(),
            OptSpec::Explicit(passes) => passes.clone(),
        };
        let mut passes_arg = format!("-passes={passes}");
        for extra in &self.config.custom_passes {
            passes_arg.push(',');
            passes_arg.push_str(extra);
        }

        let args = vec![
            passes_arg,
            "-S".to_owned(),
            "-o".to_owned(),
            out.display().to_string(),
            input.display().to_string(),
        ];
        let output = run_tool(tools.path(ToolName::Optimizer), &args, self.config.timeout)
            .map_err(|err| stage_failed(Stage::Opt, format!("failed to run opt: {err}")))?;

        if !output.success() {
            return Err(Diagnostic::classify(
                Stage::Opt,
                None,
                Some(output.stderr_string()),
                output.timed_out,
            )
            .with_command(output.command)
            .with_stderr(output.stderr_string())
            .with_hint("opt failed to run the configured optimization pipeline"));
        }
        Ok(())
    }

    fn codegen(&self, tools: &ToolSet, input: &Path, out: &Path) -> Result<(), Diagnostic> {
        let args = vec![
            "-march=bpf".to_owned(),
            format!("-mcpu={}", self.config.cpu),
            "-filetype=obj".to_owned(),
            "-o".to_owned(),
            out.display().to_string(),
            input.display().to_string(),
        ];
        let output = run_tool(tools.path(ToolName::Codegen), &args, self.config.timeout)
            .map_err(|err| stage_failed(Stage::Llc, format!("failed to run llc: {err}")))?;

        if !output.success() {
            return Err(Diagnostic::classify(
                Stage::Llc,
                None,
                Some(output.stderr_string()),
                output.timed_out,
            )
            .with_command(output.command)
            .with_stderr(output.stderr_string())
            .with_hint("llc failed to generate a BPF object"));
        }
        Ok(())
    }

    fn finalize(&self, codegen_output: &Path) -> Result<(), Diagnostic> {
        if let Some(parent) = self.config.output.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|err| {
                    stage_failed(Stage::Finalize, format!("failed to create output directory: {err}"))
                })?;
            }
        }
        fs::copy(codegen_output, &self.config.output).map_err(|err| {
            stage_failed(
                Stage::Finalize,
                format!("failed to write output object {}: {err}", self.config.output.display()),
            )
        })?;
        Ok(())
    }

    fn dedup_btf(&self, tools: &ToolSet) -> Result<(), Diagnostic> {
        if !tools.available(ToolName::BtfDedup) {
            return Err(Diagnostic::new(Stage::Btf, Code::ToolExecutionFailed).with_hint(format!(
                "BTF deduplication was requested but `{}` is not available; install it or disable BTF",
                ToolName::BtfDedup.canonical_name()
            )));
        }
        let args = vec!["-J".to_owned(), self.config.output.display().to_string()];
        let output = run_tool(tools.path(ToolName::BtfDedup), &args, self.config.timeout)
            .map_err(|err| stage_failed(Stage::Btf, format!("failed to run pahole: {err}")))?;

        if !output.success() {
            return Err(Diagnostic::classify(
                Stage::Btf,
                None,
                Some(output.stderr_string()),
                output.timed_out,
            )
            .with_command(output.command)
            .with_stderr(output.stderr_string())
            .with_hint("pahole failed to generate BTF for the output object"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfigBuilder;
    use std::time::Duration;

    #[test]
    fn validate_failure_surfaces_before_tool_discovery() {
        let config = PipelineConfigBuilder::new(vec![], PathBuf::from("out.o"))
            .timeout(Duration::from_secs(1))
            .build();
        let mut pipeline = Pipeline::new(config);
        let err = pipeline.run().unwrap_err();
        assert_eq!(err.code, Code::InvalidInput);
    }

    #[test]
    fn write_intermediate_sets_owner_only_permissions() {
        let workspace = tempfile::tempdir().unwrap();
        let path = workspace.path().join("02-transformed.ll");
        write_intermediate(&path, "; ir\n").unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn secure_dir_permissions_restricts_workspace() {
        let workspace = tempfile::tempdir().unwrap();
        secure_dir_permissions(workspace.path()).unwrap();
        let mode = fs::metadata(workspace.path()).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o700);
    }

    #[test]
    fn strip_host_paths_replaces_workspace_prefix() {
        let config = PipelineConfigBuilder::new(vec![PathBuf::from("a.ll")], PathBuf::from("out.o")).build();
        let pipeline = Pipeline::new(config);
        let workspace = tempfile::tempdir().unwrap();
        let transformed = workspace.path().join("02-transformed.ll");
        let leaked = format!(
            "!1 = !DIFile(filename: \"main.go\", directory: \"{}\")\n",
            workspace.path().display()
        );
        fs::write(&transformed, &leaked).unwrap();

        pipeline.strip_host_paths(workspace.path(), &transformed).unwrap();

        let result = fs::read_to_string(&transformed).unwrap();
        assert!(!result.contains(&workspace.path().display().to_string()));
        assert!(result.contains("directory: \".\""));
    }
}

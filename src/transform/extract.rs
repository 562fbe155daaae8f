//! (c) Extract programs: keeps only the requested (or default-
//! eligible) top-level functions plus the globals that travel with
//! them, and drops everything else the managed runtime emitted.

use std::sync::LazyLock;

use regex::Regex;

use crate::diagnostic::{Code, Diagnostic, Stage};

use super::ir::{captured_name, function_blocks};
use super::Module;

static GLOBAL_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^@(?:"([^"]*)"|([A-Za-z0-9_.$-]+))\s*="#).unwrap());

const RUNTIME_PREFIXES: &[&str] = &["runtime.", "tinygo_", "internal/"];

fn global_decl_name(line: &str) -> Option<String> {
    GLOBAL_NAME.captures(line).map(|c| captured_name(&c))
}

pub(super) fn run(module: &mut Module, requested: &[String]) -> Result<(), Diagnostic> {
    let blocks = function_blocks(module);
    let defined: Vec<String> = blocks.iter().map(|b| b.name.clone()).collect();

    let keep: Vec<String> = if requested.is_empty() {
        defined
            .iter()
            .filter(|name| {
                name.as_str() != "main"
                    && name.as_str() != "__dynamic_loader"
                    && !RUNTIME_PREFIXES.iter().any(|p| name.starts_with(p))
            })
            .cloned()
            .collect()
    } else {
        for name in requested {
            if !defined.contains(name) {
                return Err(Diagnostic::new(Stage::Transform, Code::ToolExecutionFailed).with_hint(
                    format!(
                        "requested program `{name}` is not defined in the linked module; \
                         functions actually defined: {defined:?}"
                    ),
                ));
            }
        }
        requested.to_vec()
    };

    if keep.is_empty() {
        return Err(Diagnostic::new(Stage::Transform, Code::ToolExecutionFailed).with_hint(
            "no BPF program functions remain after filtering; nothing to extract",
        ));
    }

    let mut remove = vec![false; module.len()];
    for block in &blocks {
        if !keep.contains(&block.name) {
            for flag in &mut remove[block.start..=block.end] {
                *flag = true;
            }
        }
    }
    for (idx, line) in module.iter().enumerate() {
        if remove[idx] {
            continue;
        }
        if let Some(name) = global_decl_name(line) {
            if name == ".string" || name.starts_with("runtime.") {
                remove[idx] = true;
            }
        }
    }

    let mut kept = Vec::with_capacity(module.len());
    for (idx, line) in module.iter().enumerate() {
        if !remove[idx] {
            kept.push(line.clone());
        }
    }
    *module = kept;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Module {
        vec![
            "define i32 @main() {".to_owned(),
            "  ret i32 0".to_owned(),
            "}".to_owned(),
            "define i32 @runtime.gc() {".to_owned(),
            "  ret i32 0".to_owned(),
            "}".to_owned(),
            "define i32 @handle_connect(ptr %ctx) {".to_owned(),
            "  ret i32 0".to_owned(),
            "}".to_owned(),
            "@runtime.typePointers = global i8 0".to_owned(),
            "@\".string\" = global i8 0".to_owned(),
        ]
    }

    #[test]
    fn default_keep_set_drops_main_and_runtime() {
        let mut module = sample();
        run(&mut module, &[]).unwrap();
        let joined = module.join("\n");
        assert!(joined.contains("handle_connect"));
        assert!(!joined.contains("@main()"));
        assert!(!joined.contains("runtime.gc"));
        assert!(!joined.contains("runtime.typePointers"));
        assert!(!joined.contains(".string"));
    }

    #[test]
    fn explicit_request_for_missing_function_fails() {
        let mut module = sample();
        let err = run(&mut module, &["does_not_exist".to_owned()]).unwrap_err();
        assert_eq!(err.code, Code::ToolExecutionFailed);
        assert!(err.hint.unwrap().contains("handle_connect"));
    }

    #[test]
    fn explicit_request_keeps_only_named_function() {
        let mut module = sample();
        run(&mut module, &["main".to_owned()]).unwrap();
        let joined = module.join("\n");
        assert!(joined.contains("@main()"));
        assert!(!joined.contains("handle_connect"));
    }

    #[test]
    fn empty_keep_set_is_fatal() {
        let mut module: Module = vec!["define i32 @main() {".to_owned(), "}".to_owned()];
        let err = run(&mut module, &[]).unwrap_err();
        assert_eq!(err.code, Code::ToolExecutionFailed);
    }
}

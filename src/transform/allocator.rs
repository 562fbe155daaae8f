//! (d) Replace allocator calls: turns a managed-runtime heap
//! allocation into a stack allocation plus an explicit zeroing, since
//! the BPF verifier has no notion of a heap.

use std::sync::LazyLock;

use regex::Regex;

use super::ir::{function_blocks, indent_of};
use super::Module;

static ALLOC_CALL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"^(\s*)(%\S+)\s*=\s*(?:tail\s+)?call\s+ptr\s+@(?:"[^"]*runtime\.alloc\w*[^"]*"|[A-Za-z0-9_.$-]*runtime\.alloc\w*)\s*\(\s*i64\s+(\d+)"#,
    )
    .unwrap()
});

static LABEL_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\s*(?:[A-Za-z$._][\w$.-]*|\d+):\s*(;.*)?$"#).unwrap()
});

/// The line to insert the function's stack allocations at: right after
/// the entry block's label line (`entry:`), or right after the
/// `define` line itself when the entry block is unlabeled. Inserting
/// before the label, as opposed to after it, would split the `define`
/// line from its entry block and produce an unnamed, terminator-less
/// first basic block — invalid IR that `opt` rejects.
fn entry_insertion_point(block_start: usize, module: &[String]) -> usize {
    let after_define = block_start + 1;
    match module.get(after_define) {
        Some(line) if LABEL_LINE.is_match(line) => after_define + 1,
        _ => after_define,
    }
}

const MEMSET_DECL: &str =
    "declare void @llvm.memset.p0.i64(ptr, i8, i64, i1) argmemonly nounwind willreturn writeonly";

pub(super) fn run(module: &mut Module) {
    let blocks = function_blocks(module);
    let mut any_rewrite = false;

    for block in blocks.iter().rev() {
        let mut matches: Vec<(usize, String, String, u64)> = Vec::new();
        for idx in block.start..=block.end {
            if let Some(caps) = ALLOC_CALL.captures(&module[idx]) {
                let indent = indent_of(&module[idx]).to_owned();
                let ssa = caps[2].to_owned();
                let size: u64 = caps[3].parse().unwrap_or(0);
                matches.push((idx, indent, ssa, size));
            }
        }
        if matches.is_empty() {
            continue;
        }
        any_rewrite = true;

        for (idx, indent, ssa, size) in &matches {
            module[*idx] = format!("{indent}call void @llvm.memset.p0.i64(ptr {ssa}, i8 0, i64 {size}, i1 false)");
        }

        let mut insert_at = entry_insertion_point(block.start, module);
        for (_, indent, ssa, size) in &matches {
            module.insert(insert_at, format!("{indent}{ssa} = alloca [{size} x i8], align 8"));
            insert_at += 1;
        }
    }

    if any_rewrite && !module.iter().any(|l| l.contains("@llvm.memset.p0.i64") && l.trim_start().starts_with("declare")) {
        let insert_at = module.iter().position(|l| l.starts_with("define")).unwrap_or(module.len());
        module.insert(insert_at, MEMSET_DECL.to_owned());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replaces_alloc_call_with_alloca_and_memset() {
        let mut module: Module = vec![
            "define ptr @handle(ptr %ctx) {".to_owned(),
            "entry:".to_owned(),
            "  %1 = call ptr @runtime.alloc(i64 24, ptr null)".to_owned(),
            "  ret ptr %1".to_owned(),
            "}".to_owned(),
        ];
        run(&mut module);
        assert!(module.iter().any(|l| l.contains("call void @llvm.memset.p0.i64(ptr %1, i8 0, i64 24, i1 false)")));
        assert!(module.iter().any(|l| l.trim_start().starts_with("declare void @llvm.memset.p0.i64")));

        let entry_idx = module.iter().position(|l| l.trim() == "entry:").unwrap();
        assert_eq!(module[entry_idx + 1].trim(), "%1 = alloca [24 x i8], align 8");
    }

    #[test]
    fn inserts_alloca_after_unlabeled_entry_block() {
        let mut module: Module = vec![
            "define ptr @handle(ptr %ctx) {".to_owned(),
            "  %1 = call ptr @runtime.alloc(i64 8, ptr null)".to_owned(),
            "  ret ptr %1".to_owned(),
            "}".to_owned(),
        ];
        run(&mut module);
        assert_eq!(module[1].trim(), "%1 = alloca [8 x i8], align 8");
    }

    #[test]
    fn leaves_module_unchanged_without_allocator_calls() {
        let mut module: Module = vec!["define i32 @foo() {".to_owned(), "  ret i32 0".to_owned(), "}".to_owned()];
        let before = module.clone();
        run(&mut module);
        assert_eq!(module, before);
    }
}

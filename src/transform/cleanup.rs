//! (m) Cleanup: the preceding passes leave behind declarations for
//! intrinsics nothing ended up calling, attribute groups nothing ended
//! up referencing, and the comment lines LLVM's printer pairs with
//! them. This pass sweeps all of it, plus normalizes blank-line runs,
//! so the emitted IR reads like something a toolchain produced on
//! purpose rather than a half-edited transcript.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use super::Module;

static IDENT_REF: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[@%]([A-Za-z0-9_.$\"-]+)").unwrap());

static DECLARE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^declare\b.*?@(?:"([^"]*)"|([A-Za-z0-9_.$-]+))\s*\("#).unwrap());

static GLOBAL_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^@(?:"([^"]*)"|([A-Za-z0-9_.$-]+))\s*="#).unwrap());

static ATTR_GROUP_DEF: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^attributes\s+(#\d+)\s*=").unwrap());

static ATTR_GROUP_REF: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(#\d+)").unwrap());

fn name_of(caps: &regex::Captures<'_>) -> String {
    caps.get(1).or_else(|| caps.get(2)).map(|m| m.as_str().to_owned()).unwrap_or_default()
}

/// Every `@name`/`%name` token referenced anywhere in the module,
/// keyed by bare name (quotes stripped) so a declaration and its uses
/// compare equal regardless of how each one happens to be quoted.
fn referenced_names(module: &[String]) -> HashSet<String> {
    let mut refs = HashSet::new();
    for line in module {
        for caps in IDENT_REF.captures_iter(line) {
            refs.insert(caps[1].trim_matches('"').to_owned());
        }
    }
    refs
}

fn is_unreferenced_declare(line: &str, refs: &HashSet<String>, self_name: &str) -> bool {
    DECLARE_NAME
        .captures(line)
        .map(|c| name_of(&c) == self_name && refs.iter().filter(|r| r.as_str() == self_name).count() <= 1)
        .unwrap_or(false)
}

fn strip_unreferenced_declarations(module: &mut Module) {
    loop {
        let refs = referenced_names(module);
        let mut keep = vec![true; module.len()];
        let mut changed = false;
        for (idx, line) in module.iter().enumerate() {
            let Some(caps) = DECLARE_NAME.captures(line) else {
                continue;
            };
            let name = name_of(&caps);
            if is_unreferenced_declare(line, &refs, &name) {
                keep[idx] = false;
                if idx > 0 && module[idx - 1].trim_start().starts_with(';') {
                    keep[idx - 1] = false;
                }
                changed = true;
            }
        }
        if !changed {
            break;
        }
        let mut kept = Vec::with_capacity(module.len());
        for (idx, line) in module.iter().enumerate() {
            if keep[idx] {
                kept.push(line.clone());
            }
        }
        *module = kept;
    }
}

fn strip_unreferenced_globals(module: &mut Module) {
    let refs = referenced_names(module);
    module.retain(|line| {
        let Some(caps) = GLOBAL_NAME.captures(line) else {
            return true;
        };
        if line.contains("section \"") {
            return true;
        }
        let name = name_of(&caps);
        refs.iter().filter(|r| r.as_str() == name).count() > 1
    });
}

fn strip_unused_attribute_groups(module: &mut Module) {
    let mut used: HashSet<String> = HashSet::new();
    for line in module.iter() {
        if ATTR_GROUP_DEF.is_match(line) {
            continue;
        }
        for caps in ATTR_GROUP_REF.captures_iter(line) {
            used.insert(caps[1].to_owned());
        }
    }
    module.retain(|line| match ATTR_GROUP_DEF.captures(line) {
        Some(caps) => used.contains(&caps[1]),
        None => true,
    });
}

/// `; Function Attrs: ...` comments are only meaningful immediately
/// above the `define`/`declare` they annotate. Earlier passes in this
/// module already drop one sitting directly above a `declare` line they
/// remove; this sweeps the rest; e.g. one left dangling above a global
/// or attribute-group line stripped elsewhere, or separated from its
/// declaration by a now-blank line.
fn strip_orphaned_function_attrs_comments(module: &mut Module) {
    let keep: Vec<bool> = module
        .iter()
        .enumerate()
        .map(|(idx, line)| {
            if !line.trim_start().starts_with("; Function Attrs") {
                return true;
            }
            module[idx + 1..]
                .iter()
                .find(|l| !l.trim().is_empty())
                .is_some_and(|l| l.trim_start().starts_with("define") || l.trim_start().starts_with("declare"))
        })
        .collect();
    let mut kept = Vec::with_capacity(module.len());
    for (idx, line) in module.iter().enumerate() {
        if keep[idx] {
            kept.push(line.clone());
        }
    }
    *module = kept;
}

fn collapse_blank_lines(module: &mut Module) {
    let mut collapsed = Vec::with_capacity(module.len());
    let mut last_blank = false;
    for line in module.drain(..) {
        let blank = line.trim().is_empty();
        if blank && last_blank {
            continue;
        }
        last_blank = blank;
        collapsed.push(line);
    }
    while collapsed.last().is_some_and(|l| l.trim().is_empty()) {
        collapsed.pop();
    }
    collapsed.push(String::new());
    *module = collapsed;
}

pub(super) fn run(module: &mut Module) {
    strip_unreferenced_declarations(module);
    strip_unreferenced_globals(module);
    strip_unused_attribute_groups(module);
    strip_orphaned_function_attrs_comments(module);
    collapse_blank_lines(module);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removes_unreferenced_declare_and_its_comment() {
        let mut module: Module = vec![
            "; Function Attrs: nounwind".to_owned(),
            "declare void @llvm.dbg.value(metadata, metadata, metadata)".to_owned(),
            "define i32 @foo() {".to_owned(),
            "  ret i32 0".to_owned(),
            "}".to_owned(),
        ];
        run(&mut module);
        let joined = module.join("\n");
        assert!(!joined.contains("llvm.dbg.value"));
        assert!(!joined.contains("Function Attrs"));
    }

    #[test]
    fn keeps_declare_still_called() {
        let mut module: Module = vec![
            "declare void @llvm.memset.p0.i64(ptr, i8, i64, i1)".to_owned(),
            "define void @foo() {".to_owned(),
            "  call void @llvm.memset.p0.i64(ptr null, i8 0, i64 8, i1 false)".to_owned(),
            "}".to_owned(),
        ];
        let before = module.clone();
        run(&mut module);
        assert!(module.iter().any(|l| l.contains("declare void @llvm.memset.p0.i64")));
        let _ = before;
    }

    #[test]
    fn removes_unreferenced_global_without_section() {
        let mut module: Module = vec!["@unused = internal global i32 0".to_owned(), "define i32 @foo() { ret i32 0 }".to_owned()];
        run(&mut module);
        assert!(!module.iter().any(|l| l.contains("@unused")));
    }

    #[test]
    fn keeps_sectioned_globals_even_if_unreferenced() {
        let mut module: Module =
            vec!["@main.events = global { ptr } zeroinitializer, section \".maps\", align 8".to_owned()];
        run(&mut module);
        assert!(module.iter().any(|l| l.contains("@main.events")));
    }

    #[test]
    fn removes_unused_attribute_groups() {
        let mut module: Module = vec![
            "define void @foo() #0 {".to_owned(),
            "}".to_owned(),
            "attributes #0 = { nounwind }".to_owned(),
            "attributes #1 = { noinline }".to_owned(),
        ];
        run(&mut module);
        assert!(module.iter().any(|l| l.starts_with("attributes #0")));
        assert!(!module.iter().any(|l| l.starts_with("attributes #1")));
    }

    #[test]
    fn removes_function_attrs_comment_orphaned_by_an_unrelated_removal() {
        let mut module: Module = vec![
            "; Function Attrs: nounwind".to_owned(),
            "@unused = internal global i32 0".to_owned(),
        ];
        run(&mut module);
        assert!(!module.iter().any(|l| l.contains("Function Attrs")));
        assert!(!module.iter().any(|l| l.contains("@unused")));
    }

    #[test]
    fn collapses_blank_line_runs_and_trims_trailing() {
        let mut module: Module = vec![
            "define void @foo() {".to_owned(),
            String::new(),
            String::new(),
            "}".to_owned(),
            String::new(),
            String::new(),
        ];
        run(&mut module);
        assert_eq!(
            module,
            vec!["define void @foo() {".to_owned(), String::new(), "}".to_owned(), String::new()]
        );
    }
}

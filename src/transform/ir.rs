//! Shared line-level helpers used by several passes.
//!
//! The engine never builds a parsed AST (spec-mandated: transformations
//! are line-oriented), so every pass re-derives the same handful of
//! facts — a function's brace-delimited extent, the identifier bound by
//! an `@`-qualified name — straight from the text. Kept in one place so
//! the passes agree on what a "function block" or a "global name" is.

use regex::Captures;

use super::Module;

/// A top-level `define` block: the function name and its line range,
/// inclusive of the `define` line and the closing brace line.
pub(super) struct FunctionBlock {
    pub name: String,
    pub start: usize,
    pub end: usize,
}

static DEFINE_NAME: std::sync::LazyLock<regex::Regex> = std::sync::LazyLock::new(|| {
    regex::Regex::new(r#"^define\b[^@]*@(?:"([^"]*)"|([A-Za-z0-9_.$-]+))\s*\("#).unwrap()
});

/// Pulls the bare-or-quoted identifier out of a two-group capture where
/// group 1 is the quoted form (`@"foo.bar"`) and group 2 is the bare
/// form (`@foo_bar`).
pub(super) fn captured_name(caps: &Captures<'_>) -> String {
    caps.get(1)
        .or_else(|| caps.get(2))
        .map(|m| m.as_str().to_owned())
        .unwrap_or_default()
}

pub(super) fn define_name(line: &str) -> Option<String> {
    DEFINE_NAME.captures(line).map(|c| captured_name(&c))
}

/// Finds every top-level `define` block by tracking brace depth across
/// the whole module. Blocks never nest at the top level in LLVM IR, so
/// a simple open/close counter starting at each `define` line suffices.
pub(super) fn function_blocks(module: &[String]) -> Vec<FunctionBlock> {
    let mut blocks = Vec::new();
    let mut i = 0;
    while i < module.len() {
        if let Some(name) = define_name(&module[i]) {
            let mut depth = 0i32;
            let mut end = i;
            for (j, line) in module.iter().enumerate().skip(i) {
                depth += line.matches('{').count() as i32;
                depth -= line.matches('}').count() as i32;
                if depth <= 0 {
                    end = j;
                    break;
                }
            }
            blocks.push(FunctionBlock { name, start: i, end });
            i = end + 1;
        } else {
            i += 1;
        }
    }
    blocks
}

/// Leading whitespace of `line`.
pub(super) fn indent_of(line: &str) -> &str {
    let trimmed = line.trim_start();
    &line[..line.len() - trimmed.len()]
}

/// The highest `!N` metadata id referenced or defined anywhere in the
/// module, or 0 if none exists. New synthesized nodes start at this
/// value plus one.
pub(super) fn max_metadata_id(module: &[String]) -> u64 {
    static META_ID: std::sync::LazyLock<regex::Regex> =
        std::sync::LazyLock::new(|| regex::Regex::new(r"!(\d+)\b").unwrap());
    module
        .iter()
        .flat_map(|line| META_ID.captures_iter(line))
        .filter_map(|c| c[1].parse::<u64>().ok())
        .max()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_single_function_block() {
        let module: Module = vec![
            "define i32 @foo(ptr %ctx) {".to_owned(),
            "entry:".to_owned(),
            "  ret i32 0".to_owned(),
            "}".to_owned(),
        ];
        let blocks = function_blocks(&module);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].name, "foo");
        assert_eq!(blocks[0].start, 0);
        assert_eq!(blocks[0].end, 3);
    }

    #[test]
    fn finds_quoted_function_name() {
        let module: Module = vec![
            "define i32 @\"main.foo\"(ptr %ctx) {".to_owned(),
            "}".to_owned(),
        ];
        let blocks = function_blocks(&module);
        assert_eq!(blocks[0].name, "main.foo");
    }

    #[test]
    fn max_metadata_id_finds_largest() {
        let module: Module = vec!["!12 = !DISubrange(count: 3)".to_owned(), "!7 = !{}".to_owned()];
        assert_eq!(max_metadata_id(&module), 12);
    }
}

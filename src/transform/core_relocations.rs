//! (f) CO-RE rewrite: turns struct field accesses against CO-RE typed
//! structs into relocations the kernel resolves against the running
//! kernel's BTF, instead of offsets baked in at build time.
//!
//! Only runs when CO-RE support is enabled for the pipeline run;
//! programs with no CO-RE-sentinel types pass through unchanged.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use super::ir::captured_name;
use super::Module;

const CORE_SENTINEL: &str = "bpfCore";

fn snake_case(pascal: &str) -> String {
    let mut out = String::new();
    for (i, c) in pascal.chars().enumerate() {
        if c.is_ascii_uppercase() {
            if i != 0 {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

fn core_type_to_snake(qualified: &str) -> Option<String> {
    let idx = qualified.find(CORE_SENTINEL)?;
    let rest = &qualified[idx + CORE_SENTINEL.len()..];
    if rest.is_empty() {
        return None;
    }
    Some(snake_case(rest))
}

static GEP_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"^(\s*)(%\S+)\s*=\s*getelementptr\s+inbounds\s+%(?:"([^"]*bpfCore[^"]*)"|([A-Za-z0-9_.$-]*bpfCore[A-Za-z0-9_.$-]*)),\s*ptr\s+(%\S+),\s*i32\s+0,\s*i32\s+(\d+)\s*(?:,\s*!dbg\s+(![0-9]+))?\s*$"#,
    )
    .unwrap()
});

const STRUCT_ACCESS_DECL: &str =
    "declare ptr @llvm.preserve.struct.access.index.p0.p0(ptr, i32, i32) readnone nounwind";

fn gep_rewrite(module: &mut Module) {
    let mut rewrote_any = false;
    for line in module.iter_mut() {
        let Some(caps) = GEP_LINE.captures(line) else {
            continue;
        };
        let indent = &caps[1];
        let result = &caps[2];
        let base = &caps[5];
        let field_idx = &caps[6];
        let dbg = caps
            .get(7)
            .map(|m| format!(", !dbg {}", m.as_str()))
            .unwrap_or_default();
        *line = format!(
            "{indent}{result} = call ptr @llvm.preserve.struct.access.index.p0.p0(ptr {base}, i32 {field_idx}, i32 {field_idx}){dbg}"
        );
        rewrote_any = true;
    }
    if rewrote_any
        && !module
            .iter()
            .any(|l| l.trim_start().starts_with("declare") && l.contains("@llvm.preserve.struct.access.index"))
    {
        let at = module.iter().position(|l| l.starts_with("define")).unwrap_or(module.len());
        module.insert(at, STRUCT_ACCESS_DECL.to_owned());
    }
}

static FIELD_EXISTS_CALL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^(\s*(?:%\S+\s*=\s*)?(?:tail\s+)?call\s+[^@]*?)@(?:"[^"]*"|[A-Za-z0-9_.$-]*)bpfCoreFieldExists\s*\((.*)\)\s*(.*)$"#).unwrap()
});
static TYPE_EXISTS_CALL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^(\s*(?:%\S+\s*=\s*)?(?:tail\s+)?call\s+[^@]*?)@(?:"[^"]*"|[A-Za-z0-9_.$-]*)bpfCoreTypeExists\s*\((.*)\)\s*(.*)$"#).unwrap()
});

const FIELD_EXISTS_KIND: u32 = 2;
const TYPE_EXISTS_KIND: u32 = 1;
const FIELD_INFO_DECL: &str =
    "declare i32 @llvm.bpf.preserve.field.info(ptr, i64) readnone nounwind";
const TYPE_INFO_DECL: &str = "declare i32 @llvm.bpf.preserve.type.info(ptr, i64) readnone nounwind";

fn first_arg(args: &str) -> &str {
    args.split(',').next().unwrap_or("ptr null").trim()
}

fn bare_ssa(arg: &str) -> Option<&str> {
    arg.trim().strip_prefix("ptr ").map(str::trim).or(Some(arg.trim())).filter(|s| s.starts_with('%'))
}

static ALLOCA_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\s*(%\S+)\s*=\s*alloca\s+%(?:"([^"]*)"|([A-Za-z0-9_.$-]+))\b"#).unwrap()
});

static BYTE_GEP_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\s*(%\S+)\s*=\s*getelementptr\s+inbounds\s+i8,\s*ptr\s+(%\S+),\s*i64\s+(-?\d+)\s*$"#).unwrap()
});

static STRUCT_TYPEDEF_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^%(?:"([^"]*)"|([A-Za-z0-9_.$-]+))\s*=\s*type\s*\{\s*([^}]*)\}\s*$"#).unwrap()
});

static ARRAY_TYPE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\[(\d+)\s*x\s*(.+)\]$").unwrap());

/// Byte size of a field type as it would lay out in a struct, for the
/// subset of types CO-RE field accesses actually use: integers, raw
/// pointers, and fixed-size arrays of either.
fn field_size_bytes(ty: &str) -> u64 {
    let ty = ty.trim();
    if ty == "ptr" {
        return 8;
    }
    if let Some(rest) = ty.strip_prefix('i') {
        if let Ok(bits) = rest.parse::<u64>() {
            return bits.div_ceil(8);
        }
    }
    if let Some(caps) = ARRAY_TYPE.captures(ty) {
        let count: u64 = caps[1].parse().unwrap_or(1);
        return count * field_size_bytes(&caps[2]);
    }
    8
}

fn collect_struct_fields(module: &[String]) -> HashMap<String, Vec<String>> {
    let mut out = HashMap::new();
    for line in module {
        let Some(caps) = STRUCT_TYPEDEF_LINE.captures(line) else {
            continue;
        };
        let name = captured_name(&caps);
        let fields: Vec<String> =
            caps[3].split(',').map(|f| f.trim().to_owned()).filter(|f| !f.is_empty()).collect();
        out.insert(name, fields);
    }
    out
}

fn collect_allocas(module: &[String]) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for line in module {
        if let Some(caps) = ALLOCA_LINE.captures(line) {
            let ty = caps.get(2).or_else(|| caps.get(3)).map(|m| m.as_str().to_owned()).unwrap_or_default();
            out.insert(caps[1].to_owned(), ty);
        }
    }
    out
}

fn collect_byte_geps(module: &[String]) -> HashMap<String, (String, i64)> {
    let mut out = HashMap::new();
    for line in module {
        if let Some(caps) = BYTE_GEP_LINE.captures(line) {
            let offset: i64 = caps[3].parse().unwrap_or(0);
            out.insert(caps[1].to_owned(), (caps[2].to_owned(), offset));
        }
    }
    out
}

/// Walks `start` back through a chain of byte-offset GEPs to the stack
/// allocation it ultimately indexes into, returning the alloca's SSA
/// name, its struct type name, and the total accumulated byte offset.
fn trace_to_alloca(
    start: &str,
    allocas: &HashMap<String, String>,
    geps: &HashMap<String, (String, i64)>,
) -> Option<(String, String, i64)> {
    let mut current = start.to_owned();
    let mut offset = 0i64;
    for _ in 0..64 {
        if let Some(ty) = allocas.get(&current) {
            return Some((current, ty.clone(), offset));
        }
        let (base, step) = geps.get(&current)?;
        offset += step;
        current = base.clone();
    }
    None
}

/// Natural alignment of a field type, in bytes, matching the byte
/// offsets LLVM's IR printer assigns struct members under the default
/// data layout: integers and pointers align to their own width, and
/// arrays inherit their element's alignment.
fn field_align_bytes(ty: &str) -> u64 {
    let ty = ty.trim();
    if let Some(caps) = ARRAY_TYPE.captures(ty) {
        return field_align_bytes(&caps[2]);
    }
    field_size_bytes(ty).next_power_of_two().min(8).max(1)
}

fn field_index_for_offset(fields: &[String], target_offset: i64) -> Option<usize> {
    if target_offset < 0 {
        return None;
    }
    let target_offset = target_offset as u64;
    let mut offset = 0u64;
    for (idx, field) in fields.iter().enumerate() {
        let align = field_align_bytes(field);
        offset = offset.div_ceil(align) * align;
        if offset == target_offset {
            return Some(idx);
        }
        offset += field_size_bytes(field);
    }
    None
}

/// Rewrites `bpfCoreFieldExists`/`bpfCoreTypeExists` calls into the
/// corresponding `llvm.bpf.preserve.*.info` intrinsics. The original
/// declarations become unreferenced and are swept up by the cleanup
/// pass rather than removed here.
///
/// For field-exists, the front end lowers a struct field access to a
/// chain of byte-offset `getelementptr i8` instructions off a stack
/// allocation rather than a typed GEP, so before rewriting the call
/// this traces that chain back to the alloca and re-expresses the
/// access as a struct-indexed GEP (inserted just above the call) whose
/// field index the kernel's CO-RE relocation can actually resolve
/// against BTF.
fn preserve_info_rewrite(module: &mut Module) {
    let allocas = collect_allocas(module);
    let byte_geps = collect_byte_geps(module);
    let struct_fields = collect_struct_fields(module);

    let mut needs_field_decl = false;
    let mut needs_type_decl = false;
    let mut rewritten: Module = Vec::with_capacity(module.len());
    let mut core_gep_counter = 0u32;

    for line in module.drain(..) {
        if let Some(caps) = FIELD_EXISTS_CALL.captures(&line) {
            let prefix = caps[1].to_owned();
            let raw_arg = first_arg(&caps[2]).to_owned();
            let tail = caps.get(3).map(|m| m.as_str()).unwrap_or_default().to_owned();
            needs_field_decl = true;

            let indent: String = line.chars().take_while(|c| c.is_whitespace()).collect();
            let resolved = bare_ssa(&raw_arg).and_then(|ssa| {
                let (alloca_ssa, ty, offset) = trace_to_alloca(ssa, &allocas, &byte_geps)?;
                let fields = struct_fields.get(&ty)?;
                let field_idx = field_index_for_offset(fields, offset)?;
                Some((alloca_ssa, ty, field_idx))
            });

            let field_arg = match resolved {
                Some((alloca_ssa, ty, field_idx)) => {
                    core_gep_counter += 1;
                    let temp = format!("%core.field.{core_gep_counter}");
                    rewritten.push(format!(
                        "{indent}{temp} = getelementptr inbounds %{ty}, ptr {alloca_ssa}, i32 0, i32 {field_idx}"
                    ));
                    format!("ptr {temp}")
                }
                None => raw_arg,
            };

            let rewritten_call =
                format!("{prefix}@llvm.bpf.preserve.field.info({field_arg}, i64 {FIELD_EXISTS_KIND}) {tail}")
                    .trim_end()
                    .to_owned();
            rewritten.push(rewritten_call);
        } else if let Some(caps) = TYPE_EXISTS_CALL.captures(&line) {
            let prefix = caps[1].to_owned();
            let arg0 = first_arg(&caps[2]).to_owned();
            let tail = caps.get(3).map(|m| m.as_str()).unwrap_or_default();
            needs_type_decl = true;
            rewritten.push(
                format!("{prefix}@llvm.bpf.preserve.type.info({arg0}, i64 {TYPE_EXISTS_KIND}) {tail}")
                    .trim_end()
                    .to_owned(),
            );
        } else {
            rewritten.push(line);
        }
    }
    *module = rewritten;

    let has_decl = |sym: &str| module.iter().any(|l| l.trim_start().starts_with("declare") && l.contains(sym));
    let insert_at = module.iter().position(|l| l.starts_with("define")).unwrap_or(module.len());
    if needs_type_decl && !has_decl("@llvm.bpf.preserve.type.info") {
        module.insert(insert_at, TYPE_INFO_DECL.to_owned());
    }
    if needs_field_decl && !has_decl("@llvm.bpf.preserve.field.info") {
        module.insert(insert_at, FIELD_INFO_DECL.to_owned());
    }
}

static CORE_TYPEDEF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^%(?:"([^"]*bpfCore[^"]*)"|([A-Za-z0-9_.$-]*bpfCore[A-Za-z0-9_.$-]*))\s*=\s*type\b"#).unwrap()
});

/// Strips the CO-RE sentinel prefix from type names and converts them
/// (and the debug-info node carrying the same name) from CamelCase to
/// snake_case so they line up with the kernel's BTF names.
fn sanitize_core_names(module: &mut Module) {
    let mut renames: Vec<(String, String)> = Vec::new();
    for line in module.iter() {
        if let Some(caps) = CORE_TYPEDEF.captures(line) {
            let qualified = captured_name(&caps);
            if let Some(snake) = core_type_to_snake(&qualified) {
                renames.push((qualified, snake));
            }
        }
    }

    for (old, new) in &renames {
        let escaped = regex::escape(old);
        let ref_pattern = Regex::new(&format!(r#"%(?:"{escaped}"|{escaped})(?![\w.$-])"#)).unwrap();
        let name_pattern = Regex::new(&format!(r#"name:\s*"{escaped}""#)).unwrap();
        for line in module.iter_mut() {
            if ref_pattern.is_match(line) {
                *line = ref_pattern.replace_all(line, format!("%{new}")).into_owned();
            }
            if name_pattern.is_match(line) {
                *line = name_pattern.replace(line, format!("name: \"{new}\"")).into_owned();
            }
        }
    }
}

pub(super) fn run(module: &mut Module) {
    gep_rewrite(module);
    preserve_info_rewrite(module);
    sanitize_core_names(module);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_gep_into_struct_access_intrinsic() {
        let mut module: Module = vec![
            "define i32 @foo() {".to_owned(),
            "  %1 = getelementptr inbounds %main.bpfCoreTaskStruct, ptr %0, i32 0, i32 3".to_owned(),
            "}".to_owned(),
        ];
        run(&mut module);
        assert!(module[1].contains("call ptr @llvm.preserve.struct.access.index.p0.p0(ptr %0, i32 3, i32 3)"));
        assert!(module.iter().any(|l| l.contains("declare ptr @llvm.preserve.struct.access.index.p0.p0")));
    }

    #[test]
    fn rewrites_field_exists_call() {
        let mut module: Module = vec!["  %2 = call i32 @main.bpfCoreFieldExists(ptr %1)".to_owned()];
        run(&mut module);
        assert!(module[0].contains("@llvm.bpf.preserve.field.info(ptr %1, i64 2)"));
    }

    #[test]
    fn rewrites_field_exists_call_by_tracing_byte_offset_gep_to_field_index() {
        let mut module: Module = vec![
            "%main.bpfCoreTaskStruct = type { i32, i64, ptr }".to_owned(),
            "define i32 @foo() {".to_owned(),
            "  %1 = alloca %main.bpfCoreTaskStruct, align 8".to_owned(),
            "  %2 = getelementptr inbounds i8, ptr %1, i64 8".to_owned(),
            "  %3 = call i32 @main.bpfCoreFieldExists(ptr %2)".to_owned(),
            "}".to_owned(),
        ];
        run(&mut module);
        let joined = module.join("\n");
        assert!(joined.contains("getelementptr inbounds %task_struct, ptr %1, i32 0, i32 1"));
        assert!(joined.contains("@llvm.bpf.preserve.field.info(ptr %core.field.1, i64 2)"));
    }

    #[test]
    fn sanitizes_core_type_names() {
        let mut module: Module = vec![
            "%main.bpfCoreTaskStruct = type { i32, i32 }".to_owned(),
            "  %1 = alloca %main.bpfCoreTaskStruct".to_owned(),
            "!5 = !DICompositeType(tag: DW_TAG_structure_type, name: \"main.bpfCoreTaskStruct\", size: 64)".to_owned(),
        ];
        run(&mut module);
        assert_eq!(module[0], "%task_struct = type { i32, i32 }");
        assert_eq!(module[1], "  %1 = alloca %task_struct");
        assert!(module[2].contains("name: \"task_struct\""));
    }
}

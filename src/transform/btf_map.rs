//! (j) Rewrite map definitions: the front end encodes each BPF map's
//! fixed properties (type, key size, value size, ...) as concrete
//! integers in a `bpfMapDef` struct literal, but libbpf's BTF-defined
//! map convention expects every field to be an opaque pointer whose
//! *debug info*, not its runtime value, carries the number — via a
//! pointer-to-sized-array chain the kernel's BTF loader inspects at
//! load time. This pass retypes the struct, zeroes its instances, and
//! synthesizes the DWARF nodes BTF generation needs to recover each
//! field's value.
//!
//! Only 5, 6, and 7-field layouts are recognized, matching libbpf's
//! `struct bpf_map_def` and its two historical extensions (`pinning`,
//! and the older `inner_map_idx`/`numa_node` pair). Anything else is a
//! front-end layout this engine doesn't know how to retarget.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::diagnostic::{Code, Diagnostic, Stage};

use super::ir::{captured_name, max_metadata_id};
use super::Module;

const MAP_DEF_SENTINEL: &str = "bpfMapDef";

fn field_names(count: usize) -> Option<&'static [&'static str]> {
    match count {
        5 => Some(&["type", "key_size", "value_size", "max_entries", "map_flags"]),
        6 => Some(&["type", "key_size", "value_size", "max_entries", "map_flags", "pinning"]),
        7 => Some(&[
            "type",
            "key_size",
            "value_size",
            "max_entries",
            "map_flags",
            "inner_map_idx",
            "numa_node",
        ]),
        _ => None,
    }
}

static TYPEDEF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^%(?:"([^"]*)"|([A-Za-z0-9_.$-]+))\s*=\s*type\s*\{\s*([^}]*)\}\s*$"#).unwrap()
});

static INT_FIELD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^i\d+$").unwrap());

static GLOBAL_INIT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^(.*?global\s+%(?:"[^"]*"|[A-Za-z0-9_.$-]+)\s*\{)([^}]*)(\}.*?),\s*align\s+\d+\s*$"#)
        .unwrap()
});

static INT_LITERAL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"i\d+\s+(-?\d+)").unwrap());

static ALIGN_CLAUSE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r",\s*align\s+\d+\s*$").unwrap());

static COMPOSITE_NODE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^(!\d+)\s*=\s*(!DICompositeType\(.*?name:\s*"([^"]*)".*?)size:\s*\d+(.*)$"#).unwrap()
});

static ELEMENTS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"elements:\s*!\{([^}]*)\}").unwrap());

static MEMBER_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"^(!\d+)\s*=\s*(!DIDerivedType\(tag:\s*DW_TAG_member,\s*name:\s*)"([A-Za-z]+)"(.*?)baseType:\s*![0-9]+(.*?)size:\s*\d+,\s*offset:\s*\d+(.*)$"#,
    )
    .unwrap()
});

static NODE_ID: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(!\d+)\s*=").unwrap());

static BASIC_I8: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^(!\d+)\s*=\s*!DIBasicType\(name:\s*"i8""#).unwrap());

fn find_i8_basic_type(module: &[String]) -> Option<String> {
    module.iter().find_map(|l| BASIC_I8.captures(l).map(|c| c[1].to_owned()))
}

/// Synthesizes the subrange/array/pointer-type chain each distinct
/// field value needs, deduplicating by value so two fields sharing a
/// size (say, two maps with the same `max_entries`) share one chain.
struct MetadataBuilder {
    next_id: u64,
    pending: Vec<String>,
    by_value: HashMap<u64, String>,
    i8_id: Option<String>,
}

impl MetadataBuilder {
    fn new(module: &Module) -> Self {
        Self {
            next_id: max_metadata_id(module) + 1,
            pending: Vec::new(),
            by_value: HashMap::new(),
            i8_id: find_i8_basic_type(module),
        }
    }

    fn alloc(&mut self) -> String {
        let id = format!("!{}", self.next_id);
        self.next_id += 1;
        id
    }

    fn pointer_for(&mut self, value: u64) -> String {
        if let Some(id) = self.by_value.get(&value) {
            return id.clone();
        }
        let subrange_id = self.alloc();
        self.pending.push(format!("{subrange_id} = !DISubrange(count: {value})"));
        let array_id = self.alloc();
        let base = self.i8_id.clone().unwrap_or_else(|| "null".to_owned());
        self.pending.push(format!(
            "{array_id} = !DICompositeType(tag: DW_TAG_array_type, baseType: {base}, size: 8, elements: !{{{subrange_id}}})"
        ));
        let pointer_id = self.alloc();
        self.pending
            .push(format!("{pointer_id} = !DIDerivedType(tag: DW_TAG_pointer_type, baseType: {array_id}, size: 64)"));
        self.by_value.insert(value, pointer_id.clone());
        pointer_id
    }
}

fn collect_layouts(module: &[String]) -> Result<HashMap<String, usize>, Diagnostic> {
    let mut layouts = HashMap::new();
    for (idx, line) in module.iter().enumerate() {
        let Some(caps) = TYPEDEF.captures(line) else {
            continue;
        };
        let name = captured_name(&caps);
        if !name.contains(MAP_DEF_SENTINEL) {
            continue;
        }
        let fields: Vec<&str> = caps[3].split(',').map(str::trim).filter(|s| !s.is_empty()).collect();
        if !fields.iter().all(|f| INT_FIELD.is_match(f)) {
            continue;
        }
        if field_names(fields.len()).is_none() {
            return Err(Diagnostic::new(Stage::Transform, Code::ToolExecutionFailed).with_hint(format!(
                "map definition `{name}` at IR line {} has {} fields; only 5, 6, or 7-field bpf_map_def \
                 layouts are recognized",
                idx + 1,
                fields.len()
            )));
        }
        layouts.insert(name, fields.len());
    }
    Ok(layouts)
}

fn collect_field_values(module: &[String], layouts: &HashMap<String, usize>) -> HashMap<String, Vec<u64>> {
    let mut out = HashMap::new();
    for (name, count) in layouts {
        let escaped = regex::escape(name);
        let needle = Regex::new(&format!(r#"%(?:"{escaped}"|{escaped})(?![\w.$-])"#)).unwrap();
        for line in module {
            if line.contains(" = type ") || !needle.is_match(line) {
                continue;
            }
            if let Some(caps) = GLOBAL_INIT.captures(line) {
                let values: Vec<u64> = INT_LITERAL
                    .captures_iter(&caps[2])
                    .filter_map(|c| c[1].parse::<i64>().ok())
                    .map(|v| v.max(0) as u64)
                    .collect();
                if values.len() == *count {
                    out.insert(name.clone(), values);
                }
            }
            break;
        }
    }
    out
}

fn rewrite_typedefs(module: &mut Module, layouts: &HashMap<String, usize>) {
    for line in module.iter_mut() {
        let Some(caps) = TYPEDEF.captures(line) else {
            continue;
        };
        let quoted = caps.get(1).is_some();
        let name = captured_name(&caps);
        let Some(count) = layouts.get(&name) else {
            continue;
        };
        let ptrs = vec!["ptr"; *count].join(", ");
        *line = if quoted {
            format!("%\"{name}\" = type {{ {ptrs} }}")
        } else {
            format!("%{name} = type {{ {ptrs} }}")
        };
    }
}

fn rewrite_globals(module: &mut Module, layouts: &HashMap<String, usize>) {
    let patterns: Vec<(Regex, Regex, String)> = layouts
        .iter()
        .map(|(name, count)| {
            let escaped = regex::escape(name);
            let with_init =
                Regex::new(&format!(r#"%(?:"{escaped}"|{escaped})(?![\w.$-])\s*\{{[^}}]*\}}"#)).unwrap();
            let bare = Regex::new(&format!(r#"%(?:"{escaped}"|{escaped})(?![\w.$-])"#)).unwrap();
            let ptrs = format!("{{ {} }}", vec!["ptr"; *count].join(", "));
            (with_init, bare, ptrs)
        })
        .collect();

    for line in module.iter_mut() {
        if line.contains(" = type ") {
            continue;
        }
        for (with_init, bare, ptrs) in &patterns {
            if with_init.is_match(line) {
                *line = with_init.replace(line, format!("{ptrs} zeroinitializer")).into_owned();
            } else if bare.is_match(line) {
                *line = bare.replace(line, ptrs.as_str()).into_owned();
            } else {
                continue;
            }
            if ALIGN_CLAUSE.is_match(line) {
                *line = ALIGN_CLAUSE.replace(line, ", align 8").into_owned();
            }
            break;
        }
    }
}

fn rewrite_debug_info(module: &mut Module, layouts: &HashMap<String, usize>, field_values: &HashMap<String, Vec<u64>>) {
    let mut builder = MetadataBuilder::new(module);

    let id_to_idx: HashMap<String, usize> = module
        .iter()
        .enumerate()
        .filter_map(|(idx, line)| NODE_ID.captures(line).map(|c| (c[1].to_owned(), idx)))
        .collect();

    let mut composite_rewrites: Vec<(usize, u64)> = Vec::new();
    let mut member_rewrites: Vec<(usize, &'static str, u64, String)> = Vec::new();

    for (idx, line) in module.iter().enumerate() {
        let Some(caps) = COMPOSITE_NODE.captures(line) else {
            continue;
        };
        let name = &caps[3];
        let Some(&count) = layouts.get(name) else {
            continue;
        };
        composite_rewrites.push((idx, count as u64 * 64));

        let Some(names) = field_names(count) else {
            continue;
        };
        let Some(elements) = ELEMENTS.captures(line) else {
            continue;
        };
        let member_ids: Vec<&str> = elements[1].split(',').map(str::trim).filter(|s| !s.is_empty()).collect();
        let values = field_values.get(name);

        for (i, field) in names.iter().enumerate() {
            let Some(member_id) = member_ids.get(i) else {
                break;
            };
            let Some(&member_idx) = id_to_idx.get(*member_id) else {
                continue;
            };
            let value = values.and_then(|v| v.get(i)).copied().unwrap_or(0);
            let pointer_id = builder.pointer_for(value);
            member_rewrites.push((member_idx, field, i as u64 * 64, pointer_id));
        }
    }

    for (idx, new_size) in composite_rewrites {
        let caps = COMPOSITE_NODE.captures(&module[idx]).unwrap();
        module[idx] = format!("{} = {}size: {}{}", &caps[1], &caps[2], new_size, &caps[4]);
    }

    for (idx, field, offset, pointer_id) in member_rewrites {
        let Some(caps) = MEMBER_LINE.captures(&module[idx]) else {
            continue;
        };
        module[idx] = format!(
            "{} = {}\"{}\"{}baseType: {}{}size: 64, offset: {}{}",
            &caps[1], &caps[2], field, &caps[4], pointer_id, &caps[5], offset, &caps[6]
        );
    }

    module.extend(builder.pending.drain(..));
}

pub(super) fn run(module: &mut Module) -> Result<(), Diagnostic> {
    let layouts = collect_layouts(module)?;
    if layouts.is_empty() {
        return Ok(());
    }
    let field_values = collect_field_values(module, &layouts);
    rewrite_typedefs(module, &layouts);
    rewrite_globals(module, &layouts);
    rewrite_debug_info(module, &layouts, &field_values);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retypes_fields_and_zeroes_instance() {
        let mut module: Module = vec![
            "%main.bpfMapDef = type { i32, i32, i32, i32, i32 }".to_owned(),
            "@main.events = internal global %main.bpfMapDef { i32 1, i32 4, i32 4, i32 1024, i32 0 }, align 4"
                .to_owned(),
        ];
        run(&mut module).unwrap();
        assert_eq!(module[0], "%main.bpfMapDef = type { ptr, ptr, ptr, ptr, ptr }");
        assert!(module[1].contains("{ ptr, ptr, ptr, ptr, ptr } zeroinitializer"));
        assert!(module[1].contains("align 8"));
    }

    #[test]
    fn six_field_layout_is_recognized() {
        let mut module: Module = vec![
            "%main.bpfMapDef = type { i32, i32, i32, i32, i32, i32 }".to_owned(),
            "@main.events = global %main.bpfMapDef zeroinitializer, align 4".to_owned(),
        ];
        run(&mut module).unwrap();
        assert_eq!(module[0], "%main.bpfMapDef = type { ptr, ptr, ptr, ptr, ptr, ptr }");
    }

    #[test]
    fn unsupported_field_count_is_fatal() {
        let mut module: Module = vec!["%main.bpfMapDef = type { i32, i32, i32, i32 }".to_owned()];
        let err = run(&mut module).unwrap_err();
        assert_eq!(err.code, Code::ToolExecutionFailed);
        assert!(err.hint.unwrap().contains("4 fields"));
    }

    #[test]
    fn rewrites_composite_size_and_member_fields() {
        let mut module: Module = vec![
            "%main.bpfMapDef = type { i32, i32, i32, i32, i32 }".to_owned(),
            "@main.events = internal global %main.bpfMapDef { i32 1, i32 4, i32 4, i32 1024, i32 0 }, align 4"
                .to_owned(),
            "!10 = !DICompositeType(tag: DW_TAG_structure_type, name: \"main.bpfMapDef\", size: 160, elements: !{!11})".to_owned(),
            "!11 = !DIDerivedType(tag: DW_TAG_member, name: \"Type\", baseType: !12, size: 32, offset: 0, scope: !10)".to_owned(),
        ];
        run(&mut module).unwrap();
        assert!(module[2].contains("size: 320"));
        assert!(module[3].contains("name: \"type\""));
        assert!(module[3].contains("size: 64, offset: 0"));
        assert!(module.iter().any(|l| l.contains("!DISubrange(count: 1)")));
    }

    #[test]
    fn module_without_map_defs_is_unchanged() {
        let mut module: Module = vec!["define i32 @foo() {".to_owned(), "}".to_owned()];
        let before = module.clone();
        run(&mut module).unwrap();
        assert_eq!(module, before);
    }
}

//! (k) Sanitize BTF-bound debug info: the kernel's BTF deduplicator
//! rejects names containing `.` (Go's package-qualified symbols are
//! full of them), and it has no notion of DWARF pointer-type names at
//! all, so those are dropped rather than rewritten.

use std::sync::LazyLock;

use regex::Regex;

use super::Module;

static NAME_FIELD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(name|Name|linkageName|linkagename):\s*"([^"]*)""#).unwrap());

static POINTER_NODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"!DIDerivedType\(tag:\s*DW_TAG_pointer_type").unwrap());

static POINTER_NAME_FIELD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#",?\s*(?:name|Name):\s*"[^"]*""#).unwrap());

pub(super) fn run(module: &mut Module) {
    for line in module.iter_mut() {
        if POINTER_NODE.is_match(line) {
            *line = POINTER_NAME_FIELD.replace(line, "").into_owned();
        }
        if NAME_FIELD.is_match(line) && line.contains('.') {
            *line = NAME_FIELD
                .replace_all(line, |caps: &regex::Captures<'_>| {
                    format!("{}: \"{}\"", &caps[1], caps[2].replace('.', "_"))
                })
                .into_owned();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replaces_dots_with_underscores_in_name_fields() {
        let mut module: Module = vec![
            "!5 = !DICompositeType(tag: DW_TAG_structure_type, name: \"main.bpfMapDef\", size: 160)".to_owned(),
            "!6 = !DISubprogram(name: \"main.handleConnect\", linkageName: \"main.handleConnect\")".to_owned(),
        ];
        run(&mut module);
        assert!(module[0].contains("name: \"main_bpfMapDef\""));
        assert!(module[1].contains("name: \"main_handleConnect\""));
        assert!(module[1].contains("linkageName: \"main_handleConnect\""));
    }

    #[test]
    fn drops_name_field_on_pointer_type_nodes() {
        let mut module: Module =
            vec!["!7 = !DIDerivedType(tag: DW_TAG_pointer_type, name: \"main.eventsPtr\", baseType: !5, size: 64)".to_owned()];
        run(&mut module);
        assert_eq!(module[0], "!7 = !DIDerivedType(tag: DW_TAG_pointer_type, baseType: !5, size: 64)");
    }

    #[test]
    fn leaves_unqualified_names_alone() {
        let mut module: Module =
            vec!["!8 = !DIBasicType(name: \"i32\", size: 32, encoding: DW_ATE_signed)".to_owned()];
        let before = module.clone();
        run(&mut module);
        assert_eq!(module, before);
    }
}

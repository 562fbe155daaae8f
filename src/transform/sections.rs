//! (g)/(h) Section assignment: gives every retained global and
//! function an explicit ELF section, since nothing downstream of this
//! engine infers one from linkage the way a native toolchain would.

use std::sync::LazyLock;

use regex::Regex;

use super::ir::captured_name;
use super::Module;

const EXCLUDED_PREFIXES: &[&str] = &["runtime.", "internal/", "reflect.", ".string", "llvm."];

static GLOBAL_DECL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"^@(?:"([^"]*)"|([A-Za-z0-9_.$-]+))\s*=\s*((?:external |private |internal |unnamed_addr |dso_local |local_unnamed_addr )*)(constant|global)\s+(.*)$"#,
    )
    .unwrap()
});

static ALIGN_CLAUSE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r",\s*align\s+\d+\s*$").unwrap());

fn insert_section(line: &str, section: &str) -> String {
    if let Some(m) = ALIGN_CLAUSE.find(line) {
        format!("{}, section \"{section}\"{}", &line[..m.start()], &line[m.start()..])
    } else {
        format!("{line}, section \"{section}\"")
    }
}

/// (g) Every module-level variable not already sectioned, not a
/// managed-runtime global, and not a map definition gets `.bss`,
/// `.rodata`, or `.data` depending on its initializer.
pub(super) fn assign_data_sections(module: &mut Module) {
    for line in module.iter_mut() {
        let Some(caps) = GLOBAL_DECL.captures(line) else {
            continue;
        };
        let name = captured_name(&caps);
        if EXCLUDED_PREFIXES.iter().any(|p| name.starts_with(p)) {
            continue;
        }
        let rest = &caps[5];
        if rest.contains("bpfMapDef") {
            continue;
        }
        if line.contains("section \"") {
            continue;
        }
        let section = if rest.contains("zeroinitializer") {
            ".bss"
        } else if &caps[4] == "constant" {
            ".rodata"
        } else {
            ".data"
        };
        *line = insert_section(line, section);
    }
}

/// (h) Every retained function gets an explicit section (from the
/// caller's program→section map, falling back to the function name),
/// and every map-definition global loses its `internal` qualifier and
/// gets assigned to `.maps` if it has no section yet.
pub(super) fn assign_program_sections(
    module: &mut Module,
    sections: &std::collections::HashMap<String, String>,
) {
    for line in module.iter_mut() {
        if !line.starts_with("define") {
            continue;
        }
        if line.contains("section \"") {
            continue;
        }
        let Some(caps) = DEFINE_NAME.captures(line) else {
            continue;
        };
        let name = captured_name(&caps);
        let section = sections.get(&name).cloned().unwrap_or(name);
        *line = insert_program_section(line, &section);
    }

    for line in module.iter_mut() {
        let Some(caps) = GLOBAL_DECL.captures(line) else {
            continue;
        };
        if !caps[5].contains("bpfMapDef") {
            continue;
        }
        let stripped = line.replacen("internal ", "", 1);
        *line = if stripped.contains("section \"") {
            stripped
        } else {
            insert_section(&stripped, ".maps")
        };
    }
}

static DEFINE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^define\b[^@]*@(?:"([^"]*)"|([A-Za-z0-9_.$-]+))\s*\("#).unwrap()
});

fn insert_program_section(line: &str, section: &str) -> String {
    let clause = format!(" section \"{section}\"");
    if let Some(pos) = line.find(" !dbg ") {
        format!("{}{}{}", &line[..pos], clause, &line[pos..])
    } else if let Some(pos) = line.rfind(" {") {
        format!("{}{}{}", &line[..pos], clause, &line[pos..])
    } else {
        format!("{line}{clause}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assigns_bss_for_zeroinitializer() {
        let mut module: Module = vec!["@main.counter = global i64 0, align 8".to_owned()];
        assign_data_sections(&mut module);
        assert!(module[0].contains("section \".bss\""));
    }

    #[test]
    fn assigns_rodata_for_constant() {
        let mut module: Module = vec!["@main.msg = constant [4 x i8] c\"GPL\\00\", align 1".to_owned()];
        assign_data_sections(&mut module);
        assert!(module[0].contains("section \".rodata\""));
    }

    #[test]
    fn skips_runtime_and_map_globals() {
        let mut module: Module = vec![
            "@runtime.foo = global i8 0".to_owned(),
            "@main.events = global %main.bpfMapDef zeroinitializer, align 4".to_owned(),
        ];
        let before = module.clone();
        assign_data_sections(&mut module);
        assert_eq!(module, before);
    }

    #[test]
    fn assigns_program_section_by_default_name() {
        let mut module: Module = vec!["define i32 @handle_connect(ptr %ctx) {".to_owned()];
        assign_program_sections(&mut module, &std::collections::HashMap::new());
        assert!(module[0].contains("section \"handle_connect\""));
    }

    #[test]
    fn assigns_program_section_from_map_before_brace() {
        let mut module: Module = vec!["define i32 @handle_connect(ptr %ctx) !dbg !10 {".to_owned()];
        let mut sections = std::collections::HashMap::new();
        sections.insert("handle_connect".to_owned(), "kprobe/sys_connect".to_owned());
        assign_program_sections(&mut module, &sections);
        assert_eq!(
            module[0],
            "define i32 @handle_connect(ptr %ctx) section \"kprobe/sys_connect\" !dbg !10 {"
        );
    }

    #[test]
    fn strips_internal_and_assigns_maps_section() {
        let mut module: Module =
            vec!["@main.events = internal global %main.bpfMapDef zeroinitializer, align 4".to_owned()];
        assign_program_sections(&mut module, &std::collections::HashMap::new());
        assert!(!module[0].contains("internal"));
        assert!(module[0].contains("section \".maps\""));
    }
}

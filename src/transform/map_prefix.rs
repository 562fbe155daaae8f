//! (i) Strip map prefix: Go-qualifies every package-level symbol
//! (`main.events`), but libbpf's loader expects the bare map name, so
//! this renames each `.maps`-sectioned global to its last
//! dot-separated component and rewrites every reference to match.

use regex::Regex;

use super::ir::captured_name;
use super::Module;

static MAPS_GLOBAL: std::sync::LazyLock<Regex> = std::sync::LazyLock::new(|| {
    Regex::new(r#"^@(?:"([^"]*)"|([A-Za-z0-9_.$-]+))\s*=.*section\s*"\.maps"#).unwrap()
});

pub(super) fn strip(module: &mut Module) {
    let renames: Vec<(String, String)> = module
        .iter()
        .filter_map(|line| {
            let caps = MAPS_GLOBAL.captures(line)?;
            let name = captured_name(&caps);
            name.contains('.').then(|| {
                let suffix = name.rsplit('.').next().unwrap_or(&name).to_owned();
                (name, suffix)
            })
        })
        .collect();

    for (old, new) in &renames {
        let escaped = regex::escape(old);
        let pattern = Regex::new(&format!(r#"@(?:"{escaped}"|{escaped})(?![\w.$-])"#)).unwrap();
        for line in module.iter_mut() {
            if pattern.is_match(line) {
                *line = pattern.replace_all(line, format!("@{new}")).into_owned();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_dotted_prefix_and_rewrites_references() {
        let mut module: Module = vec![
            "@main.events = global %main.bpfMapDef zeroinitializer, section \".maps\", align 8".to_owned(),
            "  %1 = call i32 @llvm.bpf.map.lookup(ptr @main.events)".to_owned(),
        ];
        strip(&mut module);
        assert!(module[0].starts_with("@events ="));
        assert!(module[1].contains("@events"));
        assert!(!module[1].contains("main.events"));
    }

    #[test]
    fn leaves_undotted_map_names_alone() {
        let mut module: Module =
            vec!["@events = global %bpfMapDef zeroinitializer, section \".maps\", align 8".to_owned()];
        let before = module.clone();
        strip(&mut module);
        assert_eq!(module, before);
    }

    #[test]
    fn does_not_touch_globals_outside_maps_section() {
        let mut module: Module = vec!["@main.counter = global i64 0, section \".bss\", align 8".to_owned()];
        let before = module.clone();
        strip(&mut module);
        assert_eq!(module, before);
    }
}

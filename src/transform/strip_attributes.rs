//! (b) Strip attributes: removes host-CPU, host-feature, and
//! allocator annotations from `attributes #N` lines, leaving function
//! attributes like `nounwind` untouched.

use std::sync::LazyLock;

use regex::Regex;

use super::Module;

static HOST_ATTR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        concat!(
            r#""target-cpu"="[^"]*""#,
            r#"|"target-features"="[^"]*""#,
            r#"|allockind\s*=\s*"[^"]*""#,
            r#"|allocsize\s*\([^)]*\)"#,
            r#"|"alloc-family"="[^"]*""#,
        ),
    )
    .unwrap()
});

static MULTI_SPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r" {2,}").unwrap());

pub(super) fn run(module: &mut Module) {
    for line in module.iter_mut() {
        if !line.trim_start().starts_with("attributes #") {
            continue;
        }
        let stripped = HOST_ATTR.replace_all(line, "");
        let collapsed = MULTI_SPACE.replace_all(&stripped, " ");
        *line = collapsed.trim_end().to_owned();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_host_cpu_and_features() {
        let mut module: Module = vec![concat!(
            r#"attributes #0 = { nounwind "target-cpu"="skylake" "#,
            r#""target-features"="+avx2" }"#
        )
        .to_owned()];
        run(&mut module);
        assert_eq!(module[0], "attributes #0 = { nounwind }");
    }

    #[test]
    fn strips_allocator_annotations() {
        let mut module: Module = vec![concat!(
            r#"attributes #1 = { allockind="alloc,zeroed" allocsize(0) "#,
            r#""alloc-family"="malloc" nounwind }"#
        )
        .to_owned()];
        run(&mut module);
        assert_eq!(module[0], "attributes #1 = { nounwind }");
    }

    #[test]
    fn leaves_non_attribute_lines_alone() {
        let mut module: Module = vec!["define i32 @foo() \"target-cpu\"=\"x\" {".to_owned()];
        let before = module.clone();
        run(&mut module);
        assert_eq!(module, before);
    }
}

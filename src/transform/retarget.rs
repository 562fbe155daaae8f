//! (a) Retarget: replace the host `target datalayout`/`target triple`
//! lines with fixed BPF equivalents. Idempotent by construction since
//! it only ever assigns a constant replacement line.

use super::Module;

const BPF_DATALAYOUT: &str = "target datalayout = \"e-m:e-p:64:64-i64:64-i128:128-n32:64-S128\"";
const BPF_TRIPLE: &str = "target triple = \"bpf\"";

pub(super) fn run(module: &mut Module) {
    for line in module.iter_mut() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("target datalayout") {
            *line = BPF_DATALAYOUT.to_owned();
        } else if trimmed.starts_with("target triple") {
            *line = BPF_TRIPLE.to_owned();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replaces_both_target_lines() {
        let mut module: Module = vec![
            "target datalayout = \"e-m:o-p270:32:32\"".to_owned(),
            "target triple = \"x86_64-unknown-linux-gnu\"".to_owned(),
        ];
        run(&mut module);
        assert_eq!(module[0], BPF_DATALAYOUT);
        assert_eq!(module[1], BPF_TRIPLE);
    }

    #[test]
    fn leaves_module_unchanged_when_absent() {
        let mut module: Module = vec!["define i32 @foo() {".to_owned()];
        let before = module.clone();
        run(&mut module);
        assert_eq!(module, before);
    }

    #[test]
    fn is_idempotent() {
        let mut module: Module = vec!["target triple = \"x86_64\"".to_owned()];
        run(&mut module);
        let once = module.clone();
        run(&mut module);
        assert_eq!(module, once);
    }
}

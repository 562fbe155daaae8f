//! (l) License section: `libbpf` refuses to load a program whose object
//! has no `license` section, so this guarantees one exists, defaulting
//! to the GPL-compatible string every kernel helper function requires.

use super::ir::define_name;
use super::Module;

const LICENSE_GLOBAL: &str = "@_license = global [4 x i8] c\"GPL\\00\", section \"license\", align 1";

pub(super) fn run(module: &mut Module) {
    if module.iter().any(|l| l.contains("section \"license\"")) {
        return;
    }
    let insert_at = module
        .iter()
        .position(|l| define_name(l).is_some() || l.trim_start().starts_with("declare"))
        .unwrap_or(module.len());
    module.insert(insert_at, LICENSE_GLOBAL.to_owned());
}

//! Program-type taxonomy: a fixed mapping from BPF program categories
//! to their ELF section-name prefixes, used to validate a caller-
//! supplied `function -> section` map (spec §4.8).

use std::collections::HashMap;
use std::fmt;

/// A BPF program category and the section-name prefix it expects.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProgramCategory {
    Kprobe,
    Kretprobe,
    Uprobe,
    Uretprobe,
    Tracepoint,
    RawTracepoint,
    Fentry,
    Fexit,
    Xdp,
    Classifier,
    CgroupSkb,
    SocketFilter,
    PerfEvent,
    Lsm,
}

impl ProgramCategory {
    /// The ELF section-name prefix this category expects, e.g.
    /// `"kprobe"` for [`Self::Kprobe`].
    pub fn section_prefix(self) -> &'static str {
        match self {
            Self::Kprobe => "kprobe",
            Self::Kretprobe => "kretprobe",
            Self::Uprobe => "uprobe",
            Self::Uretprobe => "uretprobe",
            Self::Tracepoint => "tracepoint",
            Self::RawTracepoint => "raw_tracepoint",
            Self::Fentry => "fentry",
            Self::Fexit => "fexit",
            Self::Xdp => "xdp",
            Self::Classifier => "classifier",
            Self::CgroupSkb => "cgroup_skb",
            Self::SocketFilter => "socket",
            Self::PerfEvent => "perf_event",
            Self::Lsm => "lsm",
        }
    }

    fn all() -> &'static [Self] {
        &[
            Self::Kprobe,
            Self::Kretprobe,
            Self::Uprobe,
            Self::Uretprobe,
            Self::Tracepoint,
            Self::RawTracepoint,
            Self::Fentry,
            Self::Fexit,
            Self::Xdp,
            Self::Classifier,
            Self::CgroupSkb,
            Self::SocketFilter,
            Self::PerfEvent,
            Self::Lsm,
        ]
    }

    fn from_prefix(name: &str) -> Option<Self> {
        Self::all()
            .iter()
            .copied()
            .find(|c| c.section_prefix() == name)
    }
}

impl fmt::Display for ProgramCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.section_prefix())
    }
}

/// Validates that every section in `sections` either equals
/// `category`'s prefix or begins with `"<prefix>/"`.
///
/// Returns the names of functions whose section violates the
/// category, or an error naming the known categories if `category` is
/// not recognized.
pub fn validate_section_map(
    category: &str,
    sections: &HashMap<String, String>,
) -> Result<Vec<String>, String> {
    let category = ProgramCategory::from_prefix(category).ok_or_else(|| {
        let known: Vec<&str> = ProgramCategory::all().iter().map(|c| c.section_prefix()).collect();
        format!("unknown program category `{category}`; known categories: {known:?}")
    })?;

    let prefix = category.section_prefix();
    let mismatched = sections
        .iter()
        .filter(|(_, section)| {
            section.as_str() != prefix && !section.starts_with(&format!("{prefix}/"))
        })
        .map(|(function, _)| function.clone())
        .collect();

    Ok(mismatched)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_exact_category_match() {
        let mut sections = HashMap::new();
        sections.insert("handle_connect".to_owned(), "kprobe".to_owned());
        let mismatched = validate_section_map("kprobe", &sections).unwrap();
        assert!(mismatched.is_empty());
    }

    #[test]
    fn accepts_category_slash_suffix() {
        let mut sections = HashMap::new();
        sections.insert("handle_connect".to_owned(), "kprobe/sys_connect".to_owned());
        let mismatched = validate_section_map("kprobe", &sections).unwrap();
        assert!(mismatched.is_empty());
    }

    #[test]
    fn flags_mismatched_section() {
        let mut sections = HashMap::new();
        sections.insert("handle_connect".to_owned(), "xdp".to_owned());
        let mismatched = validate_section_map("kprobe", &sections).unwrap();
        assert_eq!(mismatched, vec!["handle_connect".to_owned()]);
    }

    #[test]
    fn rejects_unknown_category() {
        let sections = HashMap::new();
        let err = validate_section_map("not-a-real-category", &sections).unwrap_err();
        assert!(err.contains("unknown program category"));
        assert!(err.contains("kprobe"));
    }
}

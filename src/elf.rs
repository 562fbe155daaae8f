//! ELF validator: opens the final object and checks class, machine,
//! executable sections, and symbol presence.
//!
//! Built on the `object` crate's read API — the same crate the
//! teacher already depends on, there only as a `build.rs` helper for
//! static-link probing (see `build.rs::link_llvm_static`, which reads
//! `.a` archive members with `object::read::archive::ArchiveFile`).
//! Here it's promoted to a runtime dependency since the orchestrator
//! validates the *output* ELF after codegen. Grounded further by
//! `other_examples/.../nu-ebpf-src-compiler-elf.rs`, which constructs
//! a BPF ELF with `object::write` using the same `Architecture`/
//! `BinaryFormat` enums this validator reads back.

use std::path::Path;

use object::{Architecture, BinaryFormat, Object, ObjectSection, ObjectSymbol, SectionKind};

use crate::diagnostic::{Code, Diagnostic, Stage};

fn validation_failed(hint: impl Into<String>) -> Diagnostic {
    Diagnostic::new(Stage::ElfValidate, Code::ElfValidationFailed).with_hint(hint)
}

/// Validates that `path` is a 64-bit little-endian BPF ELF object
/// carrying at least one executable PROGBITS section and at least one
/// symbol.
pub fn validate(path: &Path) -> Result<(), Diagnostic> {
    let data = std::fs::read(path).map_err(|err| {
        validation_failed(format!("failed to read output object {}: {err}", path.display()))
    })?;

    let file = object::File::parse(&*data).map_err(|err| {
        validation_failed(format!("{} is not a valid object file: {err}", path.display()))
    })?;

    if file.format() != BinaryFormat::Elf {
        return Err(validation_failed(format!(
            "{} is not an ELF object (format: {:?})",
            path.display(),
            file.format()
        )));
    }

    if !file.is_64() {
        return Err(validation_failed(format!(
            "{} is not a 64-bit ELF object",
            path.display()
        )));
    }
    if file.is_big_endian() {
        return Err(validation_failed(format!(
            "{} is not little-endian",
            path.display()
        )));
    }

    if file.architecture() != Architecture::Bpf {
        return Err(validation_failed(format!(
            "{} has machine {:?}, expected BPF",
            path.display(),
            file.architecture()
        )));
    }

    let has_executable_progbits = file.sections().any(|section| {
        section.kind() == SectionKind::Text && !section.data().unwrap_or_default().is_empty()
    });
    if !has_executable_progbits {
        return Err(validation_failed(format!(
            "{} has no non-empty executable PROGBITS section; expected at least one BPF program",
            path.display()
        )));
    }

    if file.symbols().next().is_none() {
        return Err(validation_failed(format!(
            "{} has an empty symbol table",
            path.display()
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn write_minimal_bpf_elf() -> tempfile::NamedTempFile {
        use object::write::{Object as WriteObject, Symbol, SymbolSection};
        use object::{Endianness, SymbolFlags, SymbolKind, SymbolScope};

        let mut obj = WriteObject::new(BinaryFormat::Elf, Architecture::Bpf, Endianness::Little);
        let section = obj.add_section(Vec::new(), b"handle_connect".to_vec(), SectionKind::Text);
        obj.append_section_data(section, &[0x95, 0, 0, 0, 0, 0, 0, 0], 8);

        obj.add_symbol(Symbol {
            name: b"handle_connect".to_vec(),
            value: 0,
            size: 8,
            kind: SymbolKind::Text,
            scope: SymbolScope::Linkage,
            weak: false,
            section: SymbolSection::Section(section),
            flags: SymbolFlags::None,
        });

        let bytes = obj.write().unwrap();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&bytes).unwrap();
        file
    }

    #[test]
    fn validates_a_minimal_bpf_elf() {
        let file = write_minimal_bpf_elf();
        validate(file.path()).unwrap();
    }

    #[test]
    fn rejects_non_elf_files() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"not an object file").unwrap();
        let err = validate(file.path()).unwrap_err();
        assert_eq!(err.code, Code::ElfValidationFailed);
    }

    #[test]
    fn rejects_missing_file() {
        let err = validate(Path::new("/nonexistent/path.o")).unwrap_err();
        assert_eq!(err.code, Code::ElfValidationFailed);
    }
}

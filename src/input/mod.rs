//! Input files: the tagged variants the link consumes and the staging
//! structures the parallel readers produce.
//!
//! Readers parse file bytes into [`ParsedObject`]s without touching shared
//! state; the driver merges them into the module serially in command-line
//! order, which keeps symbol resolution deterministic.

use crate::elf::{ElfClass, ElfEndian, ElfMachine, ElfSym};
use crate::section::SectionId;
use crate::support::arena::define_index;
use crate::symbol::SymbolId;
use std::path::{Path, PathBuf};

pub mod archive;
pub mod reader;
pub mod search;

define_index!(
    /// Index of an [`InputFile`] in the module's input arena.
    InputId
);

/// Roles of the internal input files that host linker-synthesized
/// sections. One internal input exists per role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InternalInputKind {
    /// `.got`
    Got,
    /// `.got.plt`
    GotPlt,
    /// `.plt`
    Plt,
    /// Allocated common symbols
    Common,
    /// Dynamic-linking sections (`.dynamic`, `.dynsym`, `.dynstr`, hash,
    /// `.rela.dyn`, `.rela.plt`, `.interp`)
    Dynamic,
    /// Copy-relocation `.bss` aliases
    CopyRelocs,
    /// `.note.gnu.build-id`
    BuildId,
    /// Branch stubs / veneers
    Stubs,
    /// Linker-script data (`BYTE(...)`, fills, script symbols)
    Script,
    /// Output sections created by the section map
    OutputSections,
    /// Target attribute sections
    Attributes,
}

/// What an input file is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputKind {
    /// ELF relocatable object
    Object,
    /// ELF shared object
    SharedObject,
    /// ELF executable read for `--patch-base`
    Executable,
    /// Archive library (members become `Object` inputs on extraction)
    Archive,
    /// LLVM bitcode (requires an LTO backend; rejected by the core)
    Bitcode,
    /// Linker-script text
    LinkerScript,
    /// Internal input hosting synthesized sections
    Internal(InternalInputKind),
}

/// An input file participating in the link.
#[derive(Debug)]
pub struct InputFile {
    /// Path as resolved (archives: the archive path)
    pub path: PathBuf,
    /// Member name when extracted from an archive
    pub member_name: Option<String>,
    /// Variant
    pub kind: InputKind,
    /// Sections this file contributed, in header order
    pub sections: Vec<SectionId>,
    /// Per-occurrence symbols, indexed like the file's symbol table
    pub symbols: Vec<Option<SymbolId>>,
    /// `DT_SONAME` for shared objects
    pub soname: Option<String>,
    /// `DT_NEEDED` entries for shared objects
    pub needed: Vec<String>,
    /// Class of the file
    pub class: Option<ElfClass>,
    /// Byte order of the file
    pub endian: Option<ElfEndian>,
    /// Machine of the file
    pub machine: Option<ElfMachine>,
    /// `e_flags` of the file
    pub e_flags: u32,
    /// Position in command-line order (archives give members their own
    /// ordinal after the archive's)
    pub ordinal: usize,
}

impl InputFile {
    /// A new input with no content attached yet.
    pub fn new(path: impl Into<PathBuf>, kind: InputKind, ordinal: usize) -> Self {
        InputFile {
            path: path.into(),
            member_name: None,
            kind,
            sections: Vec::new(),
            symbols: Vec::new(),
            soname: None,
            needed: Vec::new(),
            class: None,
            endian: None,
            machine: None,
            e_flags: 0,
            ordinal,
        }
    }

    /// An internal input.
    pub fn internal(kind: InternalInputKind) -> Self {
        let name = match kind {
            InternalInputKind::Got => "<internal:got>",
            InternalInputKind::GotPlt => "<internal:gotplt>",
            InternalInputKind::Plt => "<internal:plt>",
            InternalInputKind::Common => "<internal:common>",
            InternalInputKind::Dynamic => "<internal:dynamic>",
            InternalInputKind::CopyRelocs => "<internal:copyrelocs>",
            InternalInputKind::BuildId => "<internal:buildid>",
            InternalInputKind::Stubs => "<internal:stubs>",
            InternalInputKind::Script => "<internal:script>",
            InternalInputKind::OutputSections => "<internal:output>",
            InternalInputKind::Attributes => "<internal:attributes>",
        };
        InputFile::new(name, InputKind::Internal(kind), usize::MAX)
    }

    /// Display name: `path` or `path(member)` for archive members.
    pub fn display_name(&self) -> String {
        match &self.member_name {
            Some(member) => format!("{}({member})", self.path.display()),
            None => self.path.display().to_string(),
        }
    }

    /// Whether this input came from a shared library.
    pub fn is_dynamic(&self) -> bool {
        self.kind == InputKind::SharedObject
    }

    /// Whether this is one of the linker's internal inputs.
    pub fn is_internal(&self) -> bool {
        matches!(self.kind, InputKind::Internal(_))
    }
}

/// A section as parsed, before it is granted an arena slot.
#[derive(Debug, Clone)]
pub struct ParsedSection {
    pub name: String,
    pub sh_type: u32,
    pub flags: u64,
    pub size: u64,
    pub link: u32,
    pub info: u32,
    pub addralign: u64,
    pub entsize: u64,
    /// Section body; `None` for `SHT_NOBITS`
    pub data: Option<Vec<u8>>,
    /// Header index in the file
    pub index: usize,
}

/// Relocations of one input section.
#[derive(Debug, Clone)]
pub struct ParsedRelocs {
    /// Header index of the section the entries fix up
    pub target_index: usize,
    /// Header index of the relocation section itself
    pub own_index: usize,
    pub entries: Vec<crate::elf::ElfRela>,
}

/// A COMDAT group read from `SHT_GROUP`.
#[derive(Debug, Clone)]
pub struct ParsedGroup {
    /// Header index of the group section
    pub index: usize,
    /// Signature symbol name
    pub signature: String,
    /// Member section header indexes
    pub members: Vec<u32>,
}

/// One symbol with its name resolved out of the string table.
#[derive(Debug, Clone)]
pub struct ParsedSymbol {
    pub name: String,
    pub sym: ElfSym,
}

/// The product of parsing one input file, free of shared state.
#[derive(Debug)]
pub struct ParsedObject {
    pub path: PathBuf,
    pub member_name: Option<String>,
    pub kind: InputKind,
    pub class: ElfClass,
    pub endian: ElfEndian,
    pub machine: ElfMachine,
    pub e_flags: u32,
    pub entry: u64,
    pub sections: Vec<ParsedSection>,
    pub symbols: Vec<ParsedSymbol>,
    pub relocs: Vec<ParsedRelocs>,
    pub groups: Vec<ParsedGroup>,
    pub soname: Option<String>,
    pub needed: Vec<String>,
}

impl ParsedObject {
    /// Display name for diagnostics.
    pub fn display_name(&self) -> String {
        match &self.member_name {
            Some(member) => format!("{}({member})", self.path.display()),
            None => self.path.display().to_string(),
        }
    }
}

/// Classify raw bytes into the input format family.
pub fn identify_bytes(data: &[u8]) -> FileFormat {
    if crate::elf::read::is_elf(data) {
        return FileFormat::Elf;
    }
    if archive::is_archive(data) {
        return FileFormat::Archive;
    }
    if archive::is_thin_archive(data) {
        return FileFormat::ThinArchive;
    }
    if data.starts_with(b"BC\xc0\xde") {
        return FileFormat::Bitcode;
    }
    FileFormat::LinkerScript
}

/// Coarse input format, decided from magic bytes. Anything unrecognized
/// is treated as linker-script text, matching the usual driver behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Elf,
    Archive,
    ThinArchive,
    Bitcode,
    LinkerScript,
}

/// Read a file, mapping I/O errors to the standard fatal diagnostic.
pub fn read_file(path: &Path) -> crate::diag::Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| {
        crate::diag::DiagnosticEntry::fatal(
            crate::diag::DiagId::FATAL_CANNOT_READ_INPUT,
            vec![path.display().to_string(), e.to_string()],
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identify() {
        assert_eq!(identify_bytes(b"\x7fELF rest"), FileFormat::Elf);
        assert_eq!(identify_bytes(b"!<arch>\nxxx"), FileFormat::Archive);
        assert_eq!(identify_bytes(b"!<thin>\nxxx"), FileFormat::ThinArchive);
        assert_eq!(identify_bytes(b"BC\xc0\xde"), FileFormat::Bitcode);
        assert_eq!(
            identify_bytes(b"SECTIONS { }"),
            FileFormat::LinkerScript
        );
    }

    #[test]
    fn test_display_name() {
        let mut f = InputFile::new("libfoo.a", InputKind::Object, 0);
        f.member_name = Some("bar.o".into());
        assert_eq!(f.display_name(), "libfoo.a(bar.o)");
    }
}

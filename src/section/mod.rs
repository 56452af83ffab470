//! Sections: the unit of input classification and output placement.
//!
//! One [`Section`] type serves both sides: input sections are created by
//! the readers during normalize, output sections are synthesized by the
//! section map during layout. Discarded input sections are retagged
//! `Ignore`/`Discard` but never freed, so indices stay valid to the end of
//! the link.

use crate::elf::{self, SectionFlags};
use crate::fragment::FragmentId;
use crate::input::InputId;
use crate::reloc::RelocId;
use crate::support::arena::define_index;

define_index!(
    /// Index of a [`Section`] in the module's section arena.
    SectionId
);

/// Semantic class of a section, driving rule matching, garbage collection
/// eligibility and emission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SectionKind {
    /// Ordinary progbits/nobits content
    Regular,
    /// A COMMON-symbol holding section (internal input)
    Common,
    /// Debug info; never allocated, ineligible for GC
    Debug,
    /// `SHT_NOTE`
    Note,
    /// `.note.GNU-stack`
    StackNote,
    /// `SHT_REL`/`SHT_RELA`
    Relocation,
    /// Mergeable string/constant data (`SHF_MERGE`)
    MergeStr,
    /// `SHT_GROUP` COMDAT signature section
    Group,
    /// `SHT_NULL`
    Null,
    /// Symbol/string tables consumed by the linker itself
    NamePool,
    /// `.eh_frame`
    EhFrame,
    /// Target-defined sections (`SHT_ARM_EXIDX`, attribute sections)
    Target,
    /// Dropped by a `/DISCARD/` rule or `SHF_EXCLUDE`
    Discard,
    /// Dropped by garbage collection or COMDAT deduplication
    Ignore,
    /// Bitcode pseudo-section awaiting an LTO backend
    Bitcode,
}

impl SectionKind {
    /// Sections that never participate in garbage collection.
    pub fn gc_ineligible(self) -> bool {
        matches!(
            self,
            SectionKind::Null
                | SectionKind::StackNote
                | SectionKind::Relocation
                | SectionKind::EhFrame
                | SectionKind::Group
                | SectionKind::NamePool
                | SectionKind::Debug
                | SectionKind::Note
                | SectionKind::Discard
        )
    }
}

/// Output-side bookkeeping, present once a section is address-assigned.
#[derive(Debug, Clone, Default)]
pub struct OutputBinding {
    /// Virtual address
    pub addr: u64,
    /// Load address; equals `addr` unless `AT(...)`/LMA region diverged it
    pub lma: u64,
    /// File offset
    pub offset: u64,
    /// Indices into the module's program-header table
    pub phdrs: Vec<usize>,
    /// Section-header index in the emitted file
    pub shndx: u16,
    /// Committed `=fillexpr` pattern, applied to padding gaps
    pub fill: Option<u64>,
}

/// A section: input or output, ELF or synthesized.
#[derive(Debug, Clone)]
pub struct Section {
    /// Section name
    pub name: String,
    /// Semantic class
    pub kind: SectionKind,
    /// Raw `sh_type`
    pub sh_type: u32,
    /// Raw `sh_flags`
    pub flags: SectionFlags,
    /// Alignment requirement (power of two, 0/1 both meaning none)
    pub align: u64,
    /// `sh_entsize`
    pub entsize: u64,
    /// Resolved `sh_link` target
    pub link: Option<SectionId>,
    /// Raw `sh_info`
    pub info: u32,
    /// Owning input file
    pub owner: InputId,
    /// Section-header index within the owner (input side)
    pub input_index: usize,
    /// Placed content in order
    pub fragments: Vec<FragmentId>,
    /// Relocations fixing up this section's bytes
    pub relocs: Vec<RelocId>,
    /// For a `Relocation` section: the section its entries fix up
    pub fixup_target: Option<SectionId>,
    /// Current size in bytes (input size until layout, then laid-out size)
    pub size: u64,
    /// Marked `KEEP` or `SHF_GNU_RETAIN`: garbage collection keeps it
    pub retained: bool,
    /// Set by garbage collection; discarded sections stay `false`
    pub live: bool,
    /// Output section this input section was matched into
    pub output_section: Option<SectionId>,
    /// `(output entry order, rule order)` of the matched script rule
    pub matched_rule: Option<(usize, usize)>,
    /// Output-side data, set during address assignment
    pub out: Option<OutputBinding>,
}

impl Section {
    /// A new section with the given identity; everything else defaults.
    pub fn new(name: impl Into<String>, kind: SectionKind, owner: InputId) -> Self {
        Section {
            name: name.into(),
            kind,
            sh_type: elf::SHT_PROGBITS,
            flags: SectionFlags::empty(),
            align: 1,
            entsize: 0,
            link: None,
            info: 0,
            owner,
            input_index: 0,
            fragments: Vec::new(),
            relocs: Vec::new(),
            fixup_target: None,
            size: 0,
            retained: false,
            live: false,
            output_section: None,
            matched_rule: None,
            out: None,
        }
    }

    /// Whether the section occupies the output image address space.
    pub fn is_alloc(&self) -> bool {
        self.flags.contains(SectionFlags::ALLOC)
    }

    /// Whether the section is writable at run time.
    pub fn is_writable(&self) -> bool {
        self.flags.contains(SectionFlags::WRITE)
    }

    /// Whether the section holds executable code.
    pub fn is_exec(&self) -> bool {
        self.flags.contains(SectionFlags::EXECINSTR)
    }

    /// Whether the section holds thread-local data.
    pub fn is_tls(&self) -> bool {
        self.flags.contains(SectionFlags::TLS)
    }

    /// Whether the section has no file content.
    pub fn is_nobits(&self) -> bool {
        self.sh_type == elf::SHT_NOBITS
    }

    /// TLS nobits: contributes to the TLS template but does not advance
    /// the location counter.
    pub fn is_tbss(&self) -> bool {
        self.is_tls() && self.is_nobits()
    }

    /// Whether this input section was dropped (by rule, COMDAT or GC).
    pub fn is_discarded(&self) -> bool {
        matches!(self.kind, SectionKind::Discard | SectionKind::Ignore)
    }

    /// Memory permissions for segment assignment.
    pub fn segment_flags(&self) -> elf::SegmentFlags {
        let mut f = elf::SegmentFlags::R;
        if self.is_writable() {
            f |= elf::SegmentFlags::W;
        }
        if self.is_exec() {
            f |= elf::SegmentFlags::X;
        }
        f
    }

    /// Classify an input section from its header and name, mirroring what
    /// the readers do for every section they ingest.
    pub fn classify(name: &str, sh_type: u32, flags: SectionFlags) -> SectionKind {
        if flags.contains(SectionFlags::EXCLUDE) {
            return SectionKind::Discard;
        }
        match sh_type {
            elf::SHT_NULL => SectionKind::Null,
            elf::SHT_REL | elf::SHT_RELA => SectionKind::Relocation,
            elf::SHT_GROUP => SectionKind::Group,
            elf::SHT_SYMTAB | elf::SHT_STRTAB | elf::SHT_SYMTAB_SHNDX => SectionKind::NamePool,
            elf::SHT_NOTE => {
                if name == ".note.GNU-stack" {
                    SectionKind::StackNote
                } else {
                    SectionKind::Note
                }
            }
            elf::SHT_ARM_EXIDX | elf::SHT_GNU_ATTRIBUTES => SectionKind::Target,
            t if t == elf::SHT_ARM_ATTRIBUTES => SectionKind::Target,
            _ => {
                if name.starts_with(".debug")
                    || name.starts_with(".zdebug")
                    || name.starts_with(".line")
                    || name.starts_with(".stab")
                {
                    SectionKind::Debug
                } else if name == ".eh_frame" {
                    SectionKind::EhFrame
                } else if flags.contains(SectionFlags::MERGE)
                    && flags.contains(SectionFlags::STRINGS)
                {
                    SectionKind::MergeStr
                } else {
                    SectionKind::Regular
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        let kind = Section::classify(".text", elf::SHT_PROGBITS, SectionFlags::ALLOC);
        assert_eq!(kind, SectionKind::Regular);
        assert_eq!(
            Section::classify(".debug_info", elf::SHT_PROGBITS, SectionFlags::empty()),
            SectionKind::Debug
        );
        assert_eq!(
            Section::classify(".note.GNU-stack", elf::SHT_NOTE, SectionFlags::empty()),
            SectionKind::StackNote
        );
        assert_eq!(
            Section::classify(
                ".rodata.str1.1",
                elf::SHT_PROGBITS,
                SectionFlags::ALLOC | SectionFlags::MERGE | SectionFlags::STRINGS
            ),
            SectionKind::MergeStr
        );
        assert_eq!(
            Section::classify(".rela.text", elf::SHT_RELA, SectionFlags::empty()),
            SectionKind::Relocation
        );
        assert_eq!(
            Section::classify(".dropme", elf::SHT_PROGBITS, SectionFlags::EXCLUDE),
            SectionKind::Discard
        );
    }

    #[test]
    fn test_tbss() {
        let mut s = Section::new(".tbss", SectionKind::Regular, InputId(0));
        s.sh_type = elf::SHT_NOBITS;
        s.flags = SectionFlags::ALLOC | SectionFlags::WRITE | SectionFlags::TLS;
        assert!(s.is_tbss());
        s.sh_type = elf::SHT_PROGBITS;
        assert!(!s.is_tbss());
    }

    #[test]
    fn test_segment_flags() {
        let mut s = Section::new(".text", SectionKind::Regular, InputId(0));
        s.flags = SectionFlags::ALLOC | SectionFlags::EXECINSTR;
        assert_eq!(
            s.segment_flags(),
            elf::SegmentFlags::R | elf::SegmentFlags::X
        );
    }
}

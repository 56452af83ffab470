//! Symbols: per-occurrence records, canonical resolution records and the
//! name pool.
//!
//! Each symbol record read from an input becomes an [`LDSymbol`]. Linkable
//! (non-local) names additionally share one [`ResolveInfo`] in the
//! [`name_pool::NamePool`]; the pool's resolver picks the winning
//! definition as occurrences stream in.

use crate::elf;
use crate::fragment::FragmentRef;
use crate::input::InputId;
use crate::section::SectionId;
use crate::support::arena::define_index;

pub mod name_pool;
pub mod version;

define_index!(
    /// Index of an [`LDSymbol`] in the pool's symbol arena.
    SymbolId
);

define_index!(
    /// Index of a [`ResolveInfo`] in the pool.
    ResolveId
);

/// ELF symbol type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SymbolType {
    #[default]
    NoType,
    Object,
    Func,
    Section,
    File,
    Common,
    Tls,
    IFunc,
}

impl SymbolType {
    /// Decode from `st_info`'s type nibble.
    pub fn from_elf(raw: u8) -> Self {
        match raw {
            elf::STT_OBJECT => SymbolType::Object,
            elf::STT_FUNC => SymbolType::Func,
            elf::STT_SECTION => SymbolType::Section,
            elf::STT_FILE => SymbolType::File,
            elf::STT_COMMON => SymbolType::Common,
            elf::STT_TLS => SymbolType::Tls,
            elf::STT_GNU_IFUNC => SymbolType::IFunc,
            _ => SymbolType::NoType,
        }
    }

    /// Encode to `st_info`'s type nibble.
    pub fn to_elf(self) -> u8 {
        match self {
            SymbolType::NoType => elf::STT_NOTYPE,
            SymbolType::Object => elf::STT_OBJECT,
            SymbolType::Func => elf::STT_FUNC,
            SymbolType::Section => elf::STT_SECTION,
            SymbolType::File => elf::STT_FILE,
            SymbolType::Common => elf::STT_COMMON,
            SymbolType::Tls => elf::STT_TLS,
            SymbolType::IFunc => elf::STT_GNU_IFUNC,
        }
    }
}

/// What kind of definition (or absence of one) a record carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SymbolDesc {
    #[default]
    Undefined,
    Defined,
    Common,
    Absolute,
    IFunc,
}

/// Symbol binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SymbolBinding {
    Local,
    #[default]
    Global,
    Weak,
}

impl SymbolBinding {
    /// Decode from `st_info`'s binding nibble; `STB_GNU_UNIQUE` is treated
    /// as global.
    pub fn from_elf(raw: u8) -> Self {
        match raw {
            elf::STB_LOCAL => SymbolBinding::Local,
            elf::STB_WEAK => SymbolBinding::Weak,
            _ => SymbolBinding::Global,
        }
    }

    /// Encode to `st_info`'s binding nibble.
    pub fn to_elf(self) -> u8 {
        match self {
            SymbolBinding::Local => elf::STB_LOCAL,
            SymbolBinding::Global => elf::STB_GLOBAL,
            SymbolBinding::Weak => elf::STB_WEAK,
        }
    }
}

/// Symbol visibility, ordered so a larger rank is more restrictive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Visibility {
    #[default]
    Default,
    Protected,
    Hidden,
    Internal,
}

impl Visibility {
    /// Decode from `st_other`.
    pub fn from_elf(raw: u8) -> Self {
        match raw & 0x3 {
            elf::STV_INTERNAL => Visibility::Internal,
            elf::STV_HIDDEN => Visibility::Hidden,
            elf::STV_PROTECTED => Visibility::Protected,
            _ => Visibility::Default,
        }
    }

    /// Encode to `st_other`.
    pub fn to_elf(self) -> u8 {
        match self {
            Visibility::Default => elf::STV_DEFAULT,
            Visibility::Internal => elf::STV_INTERNAL,
            Visibility::Hidden => elf::STV_HIDDEN,
            Visibility::Protected => elf::STV_PROTECTED,
        }
    }

    /// The more restrictive of two visibilities; applied across all
    /// occurrences of a name.
    pub fn most_restrictive(self, other: Visibility) -> Visibility {
        if (self as u8) >= (other as u8) {
            self
        } else {
            other
        }
    }

    /// Whether the symbol may be preempted by another module at run time.
    pub fn is_preemptible_visibility(self) -> bool {
        self == Visibility::Default
    }
}

bitflags::bitflags! {
    /// Artifacts reserved for a symbol during the relocation scan. The
    /// mask makes the scan idempotent: a second relocation wanting the
    /// same artifact reuses the recorded one.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ReservedFlags: u32 {
        const GOT = 0x1;
        const PLT = 0x2;
        const COPY_REL = 0x4;
        const DYN_REL = 0x8;
        const TLS_GD = 0x10;
        const TLS_IE = 0x20;
    }
}

/// The canonical record for a linkable name. At most one per name in the
/// pool; mutated only by the resolver's precedence function.
#[derive(Debug, Clone)]
pub struct ResolveInfo {
    /// The symbol name
    pub name: String,
    /// Symbol type of the chosen record
    pub ty: SymbolType,
    /// Definition state of the chosen record
    pub desc: SymbolDesc,
    /// Binding of the chosen record
    pub binding: SymbolBinding,
    /// Most restrictive visibility across occurrences
    pub visibility: Visibility,
    /// Size of the chosen record
    pub size: u64,
    /// Alignment for common symbols (max across common occurrences)
    pub common_align: u64,
    /// Input file providing the chosen definition
    pub source: Option<InputId>,
    /// Whether the chosen definition lives in a shared library
    pub from_dynamic: bool,
    /// The chosen per-occurrence symbol that appears in the output
    pub out_symbol: Option<SymbolId>,
    /// Synthesis reservations (see [`ReservedFlags`])
    pub reserved: ReservedFlags,
    /// Canonical holder when this name is an alias of another definition
    pub alias_of: Option<ResolveId>,
    /// Binding before `--wrap` rewrote references, for later inspection
    pub saved_binding: Option<SymbolBinding>,
    /// Forced local by a version script `local:` pattern
    pub forced_local: bool,
    /// Version node name from a version script
    pub version: Option<String>,
    /// Exported into `.dynsym`
    pub exported: bool,
    /// Assigned `.dynsym` index, once emitted
    pub dynsym_index: Option<u32>,
    /// Referenced by any relocation or command (drives archive extraction
    /// and `--gc-sections` entry roots)
    pub referenced: bool,
}

impl ResolveInfo {
    /// A fresh undefined record for `name`.
    pub fn undefined(name: impl Into<String>) -> Self {
        ResolveInfo {
            name: name.into(),
            ty: SymbolType::NoType,
            desc: SymbolDesc::Undefined,
            binding: SymbolBinding::Global,
            visibility: Visibility::Default,
            size: 0,
            common_align: 0,
            source: None,
            from_dynamic: false,
            out_symbol: None,
            reserved: ReservedFlags::empty(),
            alias_of: None,
            saved_binding: None,
            forced_local: false,
            version: None,
            exported: false,
            dynsym_index: None,
            referenced: false,
        }
    }

    /// Whether the record has a definition of any strength.
    pub fn is_defined(&self) -> bool {
        !matches!(self.desc, SymbolDesc::Undefined)
    }

    /// Whether the record is a common definition awaiting allocation.
    pub fn is_common(&self) -> bool {
        self.desc == SymbolDesc::Common
    }

    /// Whether the definition is weak.
    pub fn is_weak(&self) -> bool {
        self.binding == SymbolBinding::Weak
    }

    /// Preemptibility under the given link mode: default-visibility global
    /// in a dynamic link, not forced local, and not covered by
    /// `-Bsymbolic` (the caller folds that in for defined symbols).
    pub fn is_preemptible(&self, dynamic: bool, bsymbolic: bool) -> bool {
        if !dynamic || self.forced_local {
            return false;
        }
        if !self.visibility.is_preemptible_visibility() {
            return false;
        }
        if self.binding == SymbolBinding::Local {
            return false;
        }
        if bsymbolic && self.is_defined() && !self.from_dynamic {
            return false;
        }
        true
    }
}

/// A per-occurrence symbol reference: the record one input file
/// contributed, holding its value and placement.
#[derive(Debug, Clone)]
pub struct LDSymbol {
    /// Name (owned; locals are not pooled)
    pub name: String,
    /// The pool record this occurrence resolves through; `None` for
    /// locals and section symbols
    pub resolve: Option<ResolveId>,
    /// Symbol value: input-side offset until layout, output VMA afterwards
    /// for absolute symbols
    pub value: u64,
    /// Size
    pub size: u64,
    /// Type
    pub ty: SymbolType,
    /// Binding
    pub binding: SymbolBinding,
    /// Visibility
    pub visibility: Visibility,
    /// Defining input section, if any
    pub section: Option<SectionId>,
    /// Placement within the section's fragment list
    pub frag_ref: Option<FragmentRef>,
    /// Contributing input file
    pub owner: InputId,
    /// Special `st_shndx` (`SHN_ABS`, `SHN_COMMON`) when not section-bound
    pub special_shndx: Option<u16>,
}

impl LDSymbol {
    /// Whether this occurrence defines the symbol (has a section or is
    /// absolute/common).
    pub fn is_definition(&self) -> bool {
        self.section.is_some()
            || matches!(
                self.special_shndx,
                Some(elf::SHN_ABS) | Some(elf::SHN_COMMON)
            )
    }
}

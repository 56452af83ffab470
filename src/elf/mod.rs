//! ELF constants and the byte-level structures the linker reads and writes.
//!
//! The linker owns its ELF layer: readers decode relocatable objects,
//! shared objects and executables into the crate's IR, and writers encode
//! the laid-out image. Both sides are class- and endian-aware at runtime.

use num_derive::FromPrimitive;

pub mod read;
pub mod write;

/// ELF file class.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElfClass {
    /// 32-bit objects
    Elf32 = Self::ELF32,
    /// 64-bit objects
    Elf64 = Self::ELF64,
}

impl ElfClass {
    pub const NONE: u8 = 0;
    pub const ELF32: u8 = 1;
    pub const ELF64: u8 = 2;

    /// Size of the ELF header for this class.
    pub fn ehdr_size(self) -> u64 {
        match self {
            ElfClass::Elf32 => 52,
            ElfClass::Elf64 => 64,
        }
    }

    /// Size of one program header.
    pub fn phdr_size(self) -> u64 {
        match self {
            ElfClass::Elf32 => 32,
            ElfClass::Elf64 => 56,
        }
    }

    /// Size of one section header.
    pub fn shdr_size(self) -> u64 {
        match self {
            ElfClass::Elf32 => 40,
            ElfClass::Elf64 => 64,
        }
    }

    /// Size of one symbol-table entry.
    pub fn sym_size(self) -> u64 {
        match self {
            ElfClass::Elf32 => 16,
            ElfClass::Elf64 => 24,
        }
    }

    /// Size of one relocation-with-addend entry.
    pub fn rela_size(self) -> u64 {
        match self {
            ElfClass::Elf32 => 12,
            ElfClass::Elf64 => 24,
        }
    }

    /// Size of a pointer/word for this class.
    pub fn word_size(self) -> u64 {
        match self {
            ElfClass::Elf32 => 4,
            ElfClass::Elf64 => 8,
        }
    }
}

impl TryFrom<u8> for ElfClass {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, u8> {
        match value {
            Self::ELF32 => Ok(ElfClass::Elf32),
            Self::ELF64 => Ok(ElfClass::Elf64),
            o => Err(o),
        }
    }
}

/// Data encoding of an ELF file.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElfEndian {
    /// Two's complement, little-endian
    Little = Self::LSB,
    /// Two's complement, big-endian
    Big = Self::MSB,
}

impl ElfEndian {
    pub const NONE: u8 = 0;
    pub const LSB: u8 = 1;
    pub const MSB: u8 = 2;
}

impl TryFrom<u8> for ElfEndian {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, u8> {
        match value {
            Self::LSB => Ok(ElfEndian::Little),
            Self::MSB => Ok(ElfEndian::Big),
            o => Err(o),
        }
    }
}

/// Machine architectures the linker recognizes. The relocator tables are
/// supplied per target; machines without a bundled relocator are accepted
/// on read and rejected when a link is attempted for them.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive)]
#[non_exhaustive]
pub enum ElfMachine {
    /// No machine
    None = 0,
    /// Intel 80386
    I386 = 3,
    /// ARM (AArch32)
    Arm = 40,
    /// AMD x86-64
    X86_64 = 62,
    /// Qualcomm Hexagon
    Hexagon = 164,
    /// ARM 64-bit (AArch64)
    AArch64 = 183,
    /// RISC-V
    RiscV = 243,
}

impl ElfMachine {
    /// The generic-ABI name, as shown in diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            ElfMachine::None => "none",
            ElfMachine::I386 => "i386",
            ElfMachine::Arm => "arm",
            ElfMachine::X86_64 => "x86_64",
            ElfMachine::Hexagon => "hexagon",
            ElfMachine::AArch64 => "aarch64",
            ElfMachine::RiscV => "riscv",
        }
    }
}

// e_ident layout
pub const EI_MAG0: usize = 0;
pub const EI_CLASS: usize = 4;
pub const EI_DATA: usize = 5;
pub const EI_VERSION: usize = 6;
pub const EI_OSABI: usize = 7;
pub const EI_ABIVERSION: usize = 8;
pub const EI_NIDENT: usize = 16;
pub const ELFMAG: [u8; 4] = [0x7f, b'E', b'L', b'F'];
pub const EV_CURRENT: u32 = 1;

// e_type
pub const ET_NONE: u16 = 0;
pub const ET_REL: u16 = 1;
pub const ET_EXEC: u16 = 2;
pub const ET_DYN: u16 = 3;
pub const ET_CORE: u16 = 4;

// sh_type
pub const SHT_NULL: u32 = 0;
pub const SHT_PROGBITS: u32 = 1;
pub const SHT_SYMTAB: u32 = 2;
pub const SHT_STRTAB: u32 = 3;
pub const SHT_RELA: u32 = 4;
pub const SHT_HASH: u32 = 5;
pub const SHT_DYNAMIC: u32 = 6;
pub const SHT_NOTE: u32 = 7;
pub const SHT_NOBITS: u32 = 8;
pub const SHT_REL: u32 = 9;
pub const SHT_SHLIB: u32 = 10;
pub const SHT_DYNSYM: u32 = 11;
pub const SHT_INIT_ARRAY: u32 = 14;
pub const SHT_FINI_ARRAY: u32 = 15;
pub const SHT_PREINIT_ARRAY: u32 = 16;
pub const SHT_GROUP: u32 = 17;
pub const SHT_SYMTAB_SHNDX: u32 = 18;
pub const SHT_GNU_ATTRIBUTES: u32 = 0x6fff_fff5;
pub const SHT_GNU_HASH: u32 = 0x6fff_fff6;
pub const SHT_GNU_VERDEF: u32 = 0x6fff_fffd;
pub const SHT_GNU_VERNEED: u32 = 0x6fff_fffe;
pub const SHT_GNU_VERSYM: u32 = 0x6fff_ffff;
pub const SHT_ARM_EXIDX: u32 = 0x7000_0001;
pub const SHT_ARM_ATTRIBUTES: u32 = 0x7000_0003;
pub const SHT_RISCV_ATTRIBUTES: u32 = 0x7000_0003;
pub const SHT_HEXAGON_ORDERED: u32 = 0x7000_0000;

// special section indexes
pub const SHN_UNDEF: u16 = 0;
pub const SHN_LORESERVE: u16 = 0xff00;
pub const SHN_ABS: u16 = 0xfff1;
pub const SHN_COMMON: u16 = 0xfff2;
pub const SHN_XINDEX: u16 = 0xffff;

bitflags::bitflags! {
    /// `sh_flags` of a section header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SectionFlags: u64 {
        const WRITE = 0x1;
        const ALLOC = 0x2;
        const EXECINSTR = 0x4;
        const MERGE = 0x10;
        const STRINGS = 0x20;
        const INFO_LINK = 0x40;
        const LINK_ORDER = 0x80;
        const OS_NONCONFORMING = 0x100;
        const GROUP = 0x200;
        const TLS = 0x400;
        const COMPRESSED = 0x800;
        const GNU_RETAIN = 0x20_0000;
        const EXCLUDE = 0x8000_0000;
    }
}

bitflags::bitflags! {
    /// `p_flags` of a program header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SegmentFlags: u32 {
        const X = 0x1;
        const W = 0x2;
        const R = 0x4;
    }
}

// p_type
pub const PT_NULL: u32 = 0;
pub const PT_LOAD: u32 = 1;
pub const PT_DYNAMIC: u32 = 2;
pub const PT_INTERP: u32 = 3;
pub const PT_NOTE: u32 = 4;
pub const PT_PHDR: u32 = 6;
pub const PT_TLS: u32 = 7;
pub const PT_GNU_EH_FRAME: u32 = 0x6474_e550;
pub const PT_GNU_STACK: u32 = 0x6474_e551;
pub const PT_GNU_RELRO: u32 = 0x6474_e552;
pub const PT_ARM_EXIDX: u32 = 0x7000_0001;
pub const PT_RISCV_ATTRIBUTES: u32 = 0x7000_0003;

// symbol binding
pub const STB_LOCAL: u8 = 0;
pub const STB_GLOBAL: u8 = 1;
pub const STB_WEAK: u8 = 2;
pub const STB_GNU_UNIQUE: u8 = 10;

// symbol type
pub const STT_NOTYPE: u8 = 0;
pub const STT_OBJECT: u8 = 1;
pub const STT_FUNC: u8 = 2;
pub const STT_SECTION: u8 = 3;
pub const STT_FILE: u8 = 4;
pub const STT_COMMON: u8 = 5;
pub const STT_TLS: u8 = 6;
pub const STT_GNU_IFUNC: u8 = 10;

// symbol visibility
pub const STV_DEFAULT: u8 = 0;
pub const STV_INTERNAL: u8 = 1;
pub const STV_HIDDEN: u8 = 2;
pub const STV_PROTECTED: u8 = 3;

// dynamic tags
pub const DT_NULL: u64 = 0;
pub const DT_NEEDED: u64 = 1;
pub const DT_PLTRELSZ: u64 = 2;
pub const DT_PLTGOT: u64 = 3;
pub const DT_HASH: u64 = 4;
pub const DT_STRTAB: u64 = 5;
pub const DT_SYMTAB: u64 = 6;
pub const DT_RELA: u64 = 7;
pub const DT_RELASZ: u64 = 8;
pub const DT_RELAENT: u64 = 9;
pub const DT_STRSZ: u64 = 10;
pub const DT_SYMENT: u64 = 11;
pub const DT_INIT: u64 = 12;
pub const DT_FINI: u64 = 13;
pub const DT_SONAME: u64 = 14;
pub const DT_RPATH: u64 = 15;
pub const DT_SYMBOLIC: u64 = 16;
pub const DT_REL: u64 = 17;
pub const DT_RELSZ: u64 = 18;
pub const DT_RELENT: u64 = 19;
pub const DT_PLTREL: u64 = 20;
pub const DT_DEBUG: u64 = 21;
pub const DT_TEXTREL: u64 = 22;
pub const DT_JMPREL: u64 = 23;
pub const DT_BIND_NOW: u64 = 24;
pub const DT_INIT_ARRAY: u64 = 25;
pub const DT_FINI_ARRAY: u64 = 26;
pub const DT_INIT_ARRAYSZ: u64 = 27;
pub const DT_FINI_ARRAYSZ: u64 = 28;
pub const DT_RUNPATH: u64 = 29;
pub const DT_FLAGS: u64 = 30;
pub const DT_GNU_HASH: u64 = 0x6fff_fef5;
pub const DT_FLAGS_1: u64 = 0x6fff_fffb;

pub const DF_SYMBOLIC: u64 = 0x2;
pub const DF_TEXTREL: u64 = 0x4;
pub const DF_BIND_NOW: u64 = 0x8;
pub const DF_STATIC_TLS: u64 = 0x10;
pub const DF_1_NOW: u64 = 0x1;
pub const DF_1_PIE: u64 = 0x0800_0000;

// notes
pub const NT_GNU_BUILD_ID: u32 = 3;

// compression
pub const ELFCOMPRESS_ZLIB: u32 = 1;

// group flags
pub const GRP_COMDAT: u32 = 1;

/// Parsed ELF file header, class-independent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElfHeader {
    pub class: ElfClass,
    pub endian: ElfEndian,
    pub os_abi: u8,
    pub e_type: u16,
    pub machine: ElfMachine,
    pub entry: u64,
    pub phoff: u64,
    pub shoff: u64,
    pub flags: u32,
    pub phnum: u16,
    pub shnum: u16,
    pub shstrndx: u16,
}

/// Parsed section header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SectionHeader {
    pub name: u32,
    pub sh_type: u32,
    pub flags: u64,
    pub addr: u64,
    pub offset: u64,
    pub size: u64,
    pub link: u32,
    pub info: u32,
    pub addralign: u64,
    pub entsize: u64,
}

/// Parsed symbol-table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ElfSym {
    pub name: u32,
    pub value: u64,
    pub size: u64,
    pub info: u8,
    pub other: u8,
    pub shndx: u16,
}

impl ElfSym {
    /// Symbol binding (upper nibble of `st_info`).
    pub fn binding(&self) -> u8 {
        self.info >> 4
    }

    /// Symbol type (lower nibble of `st_info`).
    pub fn sym_type(&self) -> u8 {
        self.info & 0xf
    }

    /// Symbol visibility (`st_other`).
    pub fn visibility(&self) -> u8 {
        self.other & 0x3
    }

    /// Pack binding and type into `st_info`.
    pub fn make_info(binding: u8, sym_type: u8) -> u8 {
        (binding << 4) | (sym_type & 0xf)
    }
}

/// Parsed relocation entry (`rel` entries read with a zero addend).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElfRela {
    pub offset: u64,
    pub sym_index: u32,
    pub rel_type: u32,
    pub addend: i64,
}

/// Parsed program header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ElfPhdr {
    pub p_type: u32,
    pub flags: u32,
    pub offset: u64,
    pub vaddr: u64,
    pub paddr: u64,
    pub filesz: u64,
    pub memsz: u64,
    pub align: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::FromPrimitive as _;

    #[test]
    fn test_machine_decoding() {
        assert_eq!(ElfMachine::from_u16(243), Some(ElfMachine::RiscV));
        assert_eq!(ElfMachine::from_u16(62), Some(ElfMachine::X86_64));
        assert_eq!(ElfMachine::from_u16(9999), None);
    }

    #[test]
    fn test_class_sizes() {
        assert_eq!(ElfClass::Elf32.ehdr_size(), 52);
        assert_eq!(ElfClass::Elf64.ehdr_size(), 64);
        assert_eq!(ElfClass::Elf64.sym_size(), 24);
        assert_eq!(ElfClass::Elf32.rela_size(), 12);
    }

    #[test]
    fn test_sym_info_packing() {
        let info = ElfSym::make_info(STB_GLOBAL, STT_FUNC);
        let sym = ElfSym {
            info,
            ..Default::default()
        };
        assert_eq!(sym.binding(), STB_GLOBAL);
        assert_eq!(sym.sym_type(), STT_FUNC);
    }
}

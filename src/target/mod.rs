//! Target backends: per-architecture relocation tables, GOT/PLT
//! templates and relaxation predicates behind one trait.
//!
//! The core drives backends through [`TargetInfo`]; the relocation
//! arithmetic itself lives in each backend's `apply`.

use crate::elf::{ElfClass, ElfEndian, ElfMachine};
use crate::reloc::RelocAction;

pub mod aarch64;
pub mod riscv;
pub mod x86_64;

/// Inputs to one relocation application, fully resolved.
#[derive(Debug, Clone)]
pub struct RelocInput {
    /// Target relocation type
    pub rtype: u32,
    /// `S`: the symbol value, already PLT-redirected when the scan
    /// reserved a stub for a call-class relocation
    pub symbol_value: u64,
    /// `A`
    pub addend: i64,
    /// `P`: the VMA of the fixed-up bytes
    pub place: u64,
    /// The paired high-part's `S + A`, for low-part relocations
    pub paired_value: Option<u64>,
    /// VMA of the symbol's GOT slot, when one was reserved
    pub got_value: Option<u64>,
    /// VMA of the GOT base (`_GLOBAL_OFFSET_TABLE_`)
    pub got_base: u64,
    /// Start of the TLS template, for thread-pointer-relative forms
    pub tls_base: u64,
    /// `__global_pointer$`, when defined (RISC-V GP relaxation)
    pub gp: Option<u64>,
    /// Static link: unresolvable dynamic forms must collapse
    pub is_static: bool,
    /// A paired high part was rewritten to its absolute form; this site
    /// applies absolute arithmetic instead of PC-relative
    pub rewrite_abs: bool,
}

/// Why a relocation could not be applied.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelocFailure {
    #[error("value 0x{value:x} overflows the relocated field")]
    Overflow { value: u64 },
    #[error("value 0x{value:x} is not aligned to {required} bytes")]
    BadAlignment { value: u64, required: u64 },
    #[error("missing paired high-part relocation")]
    BadPairing,
    #[error("relocation type {rtype} is not supported by this target")]
    Unsupported { rtype: u32 },
}

/// How a relocation type participates in HI/LO pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairRole {
    None,
    /// Carries the high bits; low parts resolve against it
    High,
    /// Reads its high partner's `S + A`
    Low,
}

/// What the scan consults to decide artifact synthesis, per relocation
/// type and symbol preemptibility.
#[derive(Debug, Clone, Copy)]
pub struct ClassifyInput {
    pub rtype: u32,
    pub preemptible: bool,
    pub is_pic: bool,
    pub is_static: bool,
    pub is_func: bool,
    pub is_tls: bool,
    pub is_local: bool,
    /// Defined in a shared library (copy-relocation candidate)
    pub from_dynamic: bool,
}

/// Dynamic relocation type codes of a target.
#[derive(Debug, Clone, Copy)]
pub struct DynRelocCodes {
    pub relative: u32,
    pub glob_dat: u32,
    pub jump_slot: u32,
    pub copy: u32,
    pub symbolic: u32,
    pub dtpmod: u32,
    pub dtprel: u32,
    pub tprel: u32,
    pub irelative: u32,
}

/// One architecture backend.
pub trait TargetInfo: Send + Sync {
    /// The machine this backend serves.
    fn machine(&self) -> ElfMachine;

    /// Human name for diagnostics.
    fn name(&self) -> &'static str;

    /// A relocation type's name for diagnostics.
    fn reloc_name(&self, rtype: u32) -> String;

    /// Classify a relocation for the scan per the generic table.
    fn classify(&self, input: &ClassifyInput) -> RelocAction;

    /// Pairing role of a type.
    fn pair_role(&self, rtype: u32) -> PairRole {
        let _ = rtype;
        PairRole::None
    }

    /// Whether application should read `S` from the PLT entry.
    fn redirects_to_plt(&self, rtype: u32) -> bool;

    /// Whether application should use the GOT slot address.
    fn uses_got(&self, rtype: u32) -> bool;

    /// Dynamic relocation codes.
    fn dyn_codes(&self) -> DynRelocCodes;

    /// Apply the relocation arithmetic over the fragment bytes at the
    /// target reference. `bytes` starts at the relocated field.
    fn apply(
        &self,
        input: &RelocInput,
        bytes: &mut [u8],
        endian: ElfEndian,
        class: ElfClass,
    ) -> Result<(), RelocFailure>;

    /// Size of one GOT slot.
    fn got_entry_size(&self, class: ElfClass) -> u64 {
        class.word_size()
    }

    /// Size of the PLT header.
    fn plt_header_size(&self) -> u64;

    /// Size of one PLT entry.
    fn plt_entry_size(&self) -> u64;

    /// Encode the PLT header. `got_plt` is the `.got.plt` VMA, `plt` the
    /// `.plt` VMA.
    fn write_plt_header(&self, got_plt: u64, plt: u64, endian: ElfEndian) -> Vec<u8>;

    /// Encode PLT entry `index` whose GOTPLT slot lives at `slot`.
    fn write_plt_entry(
        &self,
        slot: u64,
        plt_entry_addr: u64,
        index: usize,
        endian: ElfEndian,
    ) -> Vec<u8>;

    /// Whether `--relax` has work on this target.
    fn supports_relaxation(&self) -> bool {
        false
    }
}

/// Backend lookup. Machines without a bundled backend are reported by
/// the caller as unsupported.
pub fn lookup(machine: ElfMachine, class: ElfClass) -> Option<Box<dyn TargetInfo>> {
    match machine {
        ElfMachine::RiscV => Some(Box::new(riscv::RiscV::new(class))),
        ElfMachine::X86_64 => Some(Box::new(x86_64::X86_64)),
        ElfMachine::AArch64 => Some(Box::new(aarch64::AArch64)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup() {
        assert!(lookup(ElfMachine::RiscV, ElfClass::Elf32).is_some());
        assert!(lookup(ElfMachine::X86_64, ElfClass::Elf64).is_some());
        assert!(lookup(ElfMachine::AArch64, ElfClass::Elf64).is_some());
        assert!(lookup(ElfMachine::Hexagon, ElfClass::Elf32).is_none());
        assert!(lookup(ElfMachine::Arm, ElfClass::Elf32).is_none());
    }
}

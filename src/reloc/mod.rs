//! Relocation records and the scan/apply passes built on them.
//!
//! A [`Relocation`] fixes up bytes at a fragment-relative target reference
//! against a symbol plus addend. Paired entries (RISC-V `PCREL_HI20` with
//! its `PCREL_LO12`, HI/LO pairs elsewhere) are linked explicitly and
//! applied as a unit.

use crate::fragment::FragmentRef;
use crate::section::SectionId;
use crate::support::arena::define_index;
use crate::symbol::{ResolveId, SymbolId};

pub mod apply;
pub mod scan;

define_index!(
    /// Index of a [`Relocation`] in the module's relocation arena.
    RelocId
);

/// One input relocation.
#[derive(Debug, Clone)]
pub struct Relocation {
    /// Target-specific relocation type
    pub rtype: u32,
    /// The referenced per-occurrence symbol
    pub symbol: SymbolId,
    /// The bytes being fixed up
    pub target: FragmentRef,
    /// Explicit addend (`rel` inputs are read with zero)
    pub addend: i64,
    /// For a low-part relocation: its high-part partner
    pub paired: Option<RelocId>,
    /// The section whose bytes this entry patches
    pub section: SectionId,
}

/// A dynamic relocation the linker emits into `.rela.dyn`/`.rela.plt`.
#[derive(Debug, Clone)]
pub struct DynReloc {
    /// Target-specific dynamic relocation type
    pub rtype: u32,
    /// The symbol the loader resolves; `None` for `RELATIVE`-class
    /// entries
    pub sym: Option<ResolveId>,
    /// Where the loader writes (VMA computed after layout)
    pub place: FragmentRef,
    /// Addend
    pub addend: i64,
    /// Whether this entry belongs in `.rela.plt` rather than `.rela.dyn`
    pub is_plt: bool,
}

/// Classification a target backend assigns to one relocation during the
/// scan; drives artifact synthesis per the generic table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocAction {
    /// No synthesis required
    None,
    /// Absolute word against a local under PIC: `RELATIVE` dyn reloc
    DynRelative,
    /// Absolute word against a preemptible global: symbolic dyn reloc
    DynSymbolic,
    /// GOT-relative access: reserve a GOT slot
    Got,
    /// PLT call: reserve stub, GOTPLT slot and `JMP_SLOT`
    Plt,
    /// Copy-relocate a shared-library datum into `.bss`
    Copy,
    /// TLS general dynamic: module-id + offset slot pair
    TlsGd,
    /// TLS local dynamic: shared module-id slot
    TlsLd,
    /// TLS initial exec: one TP-offset slot
    TlsIe,
    /// TLS local exec: immediate, no synthesis
    TlsLe,
    /// The target rejects this relocation for this link kind
    Unsupported,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::FragmentId;

    #[test]
    fn test_reloc_shape() {
        let r = Relocation {
            rtype: 1,
            symbol: SymbolId(0),
            target: FragmentRef {
                frag: FragmentId(0),
                offset: 4,
            },
            addend: -8,
            paired: None,
            section: SectionId(0),
        };
        assert_eq!(r.target.offset, 4);
        assert!(r.paired.is_none());
    }
}

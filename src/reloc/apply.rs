//! Post-layout relocation application.
//!
//! Finalizes the synthesized artifacts (PLT bytes, GOT slot values) now
//! that addresses are known, then walks every relocation in layout order
//! and invokes the target relocator over the owning fragment's bytes.

use crate::diag::{DiagId, DiagnosticEntry, DiagnosticKind};
use crate::elf;
use crate::fragment::{FragmentId, FragmentKind, FragmentRef, GotSlotKind};
use crate::module::Module;
use crate::reloc::RelocId;
use crate::section::SectionId;
use crate::symbol::{ReservedFlags, SymbolId};
use crate::target::{PairRole, RelocFailure, RelocInput, TargetInfo};
use std::collections::{HashMap, HashSet};

/// The resolved `(S, A)` of a relocation, weak-undefined collapsing to
/// zero and merged strings re-homed.
fn symbol_and_addend(module: &Module, symbol: SymbolId, addend: i64) -> (u64, i64) {
    let sym = module.pool.symbol(symbol);
    if let Some(resolve) = sym.resolve {
        let info = module.pool.info(resolve);
        if !info.is_defined() {
            return (0, addend);
        }
        return (module.resolve_value(resolve), addend);
    }
    // local occurrence; section-relative references into merged strings
    // fold the addend into the piece lookup
    if let (Some(section), Some(fref)) = (sym.section, sym.frag_ref) {
        if !module.merge_map.is_empty() {
            if let Some((frag, offset)) = crate::object::merge::remap(
                module,
                section,
                fref.offset.wrapping_add(addend as u64),
            ) {
                return (module.fragment_vma(FragmentRef { frag, offset }), 0);
            }
        }
    }
    (module.symbol_value(symbol), addend)
}

/// The VMA the loader's thread pointer is measured against.
fn tls_base(module: &Module) -> u64 {
    module
        .segments
        .iter()
        .find(|seg| seg.p_type == elf::PT_TLS)
        .map(|seg| seg.vaddr)
        .unwrap_or(0)
}

/// Fill PLT fragment bytes and GOT slot values; addresses are final.
pub fn finalize_synthetics(module: &mut Module, target: &dyn TargetInfo) {
    let endian = module.endian;
    // PLT header and entries
    let plt_vma = module
        .plt_slots
        .values()
        .next()
        .map(|&(_, frag)| {
            let owner = module.fragments[frag].owner;
            module.sections[owner]
                .out
                .as_ref()
                .map(|o| o.addr)
                .unwrap_or(0)
        })
        .unwrap_or(0);
    let gotplt_vma = module
        .gotplt_slots
        .values()
        .next()
        .map(|&frag| {
            let owner = module.fragments[frag].owner;
            module.sections[owner]
                .out
                .as_ref()
                .map(|o| o.addr)
                .unwrap_or(0)
        })
        .unwrap_or(0);
    let plt_work: Vec<(crate::symbol::ResolveId, usize, FragmentId)> = module
        .plt_slots
        .iter()
        .map(|(&id, &(index, frag))| (id, index, frag))
        .collect();
    for (id, index, frag) in plt_work {
        let entry_vma = module.fragment_vma(FragmentRef { frag, offset: 0 });
        let slot_frag = module.gotplt_slots[&id];
        let slot_vma = module.fragment_vma(FragmentRef {
            frag: slot_frag,
            offset: 0,
        });
        let bytes = target.write_plt_entry(slot_vma, entry_vma, index, endian);
        if let FragmentKind::Plt { data, .. } = &mut module.fragments[frag].kind {
            *data = bytes;
        }
        // lazy binding: the slot starts at the PLT header
        if let FragmentKind::Got { value, .. } = &mut module.fragments[slot_frag].kind {
            *value = plt_vma;
        }
    }
    // the header itself
    let header_frag = module
        .sections
        .iter()
        .find(|(_, s)| s.name == ".plt" && !s.fragments.is_empty())
        .and_then(|(_, s)| s.fragments.first().copied());
    if let Some(frag) = header_frag {
        if matches!(
            module.fragments[frag].kind,
            FragmentKind::Plt {
                index: usize::MAX,
                ..
            }
        ) {
            let bytes = target.write_plt_header(gotplt_vma, plt_vma, endian);
            if let FragmentKind::Plt { data, .. } = &mut module.fragments[frag].kind {
                *data = bytes;
            }
        }
    }
    // GOT slot values
    let tls = tls_base(module);
    let got_work: Vec<FragmentId> = module
        .fragments
        .iter()
        .filter(|(_, f)| matches!(f.kind, FragmentKind::Got { .. }))
        .map(|(id, _)| id)
        .collect();
    let dynamic = module.is_dynamic_link();
    for frag in got_work {
        let (kind, sym) = match &module.fragments[frag].kind {
            FragmentKind::Got { kind, sym, .. } => (*kind, *sym),
            _ => continue,
        };
        let value = match (kind, sym) {
            (GotSlotKind::GotPlt, _) => continue, // set with the PLT entries
            (GotSlotKind::Regular, Some(id)) => {
                let info = module.pool.info(id);
                if dynamic && info.is_preemptible(true, module.config.bsymbolic) {
                    0
                } else {
                    module.resolve_value(id)
                }
            }
            (GotSlotKind::Regular, None) => 0,
            (GotSlotKind::TlsModuleId, _) => {
                if dynamic {
                    0
                } else {
                    1
                }
            }
            (GotSlotKind::TlsOffset, Some(id)) => module.resolve_value(id).wrapping_sub(tls),
            (GotSlotKind::TlsOffset, None) => 0,
            (GotSlotKind::TlsTpOff, Some(id)) => {
                let info = module.pool.info(id);
                if dynamic && info.is_preemptible(true, module.config.bsymbolic) {
                    0
                } else {
                    module.resolve_value(id).wrapping_sub(tls)
                }
            }
            (GotSlotKind::TlsTpOff, None) => 0,
        };
        if let FragmentKind::Got { value: slot, .. } = &mut module.fragments[frag].kind {
            *slot = value;
        }
    }
}

struct Work {
    frag: FragmentId,
    offset: u64,
    input: RelocInput,
    sym_name: String,
    owner: String,
}

/// Apply every relocation of every live placed section.
pub fn run(module: &mut Module, target: &dyn TargetInfo) {
    finalize_synthetics(module, target);
    let gp = module
        .pool
        .find_id("__global_pointer$")
        .filter(|&id| module.pool.info(id).is_defined())
        .map(|id| module.resolve_value(id));
    let tls = tls_base(module);
    let is_static = module.config.is_static;
    // which high parts are rewritten to absolute form under static link
    let mut rewrites: HashSet<RelocId> = HashSet::new();
    let sections = apply_sections(module);
    if target.supports_relaxation() && is_static {
        for &sid in &sections {
            for &rid in &module.sections[sid].relocs {
                let reloc = &module.relocs[rid];
                if target.pair_role(reloc.rtype) != PairRole::High
                    || target.uses_got(reloc.rtype)
                {
                    continue;
                }
                let (s, a) = symbol_and_addend(module, reloc.symbol, reloc.addend);
                let sa = s.wrapping_add(a as u64);
                let p = module.fragment_vma(reloc.target);
                let x = sa.wrapping_sub(p) as i64;
                if !crate::target::riscv::fits_pcrel(x) && crate::target::riscv::fits_lui(sa) {
                    rewrites.insert(rid);
                    let name = module.pool.symbol(reloc.symbol).name.clone();
                    module.raise(DiagnosticEntry::new(
                        DiagId::VERBOSE_RELAX_HI20_TO_LUI,
                        DiagnosticKind::Verbose,
                        vec![name],
                    ));
                }
            }
        }
    }
    // first pass: the value each high part resolves to, consumed by lows
    let mut hi_values: HashMap<RelocId, u64> = HashMap::new();
    for &sid in &sections {
        for &rid in &module.sections[sid].relocs {
            let reloc = &module.relocs[rid];
            if target.pair_role(reloc.rtype) != PairRole::High {
                continue;
            }
            let p = module.fragment_vma(reloc.target);
            let value = if target.uses_got(reloc.rtype) {
                let slot = got_slot_vma(module, reloc.symbol);
                slot.wrapping_add(reloc.addend as u64).wrapping_sub(p)
            } else {
                let (s, a) = symbol_and_addend(module, reloc.symbol, reloc.addend);
                let sa = s.wrapping_add(a as u64);
                if rewrites.contains(&rid) {
                    sa
                } else {
                    sa.wrapping_sub(p)
                }
            };
            hi_values.insert(rid, value);
        }
    }
    // second pass: build the work list
    let mut work: Vec<Work> = Vec::new();
    for &sid in &sections {
        for &rid in &module.sections[sid].relocs {
            let reloc = module.relocs[rid].clone();
            let (s, a) = symbol_and_addend(module, reloc.symbol, reloc.addend);
            let sym = module.pool.symbol(reloc.symbol);
            let sym_name = sym.name.clone();
            let resolve = sym.resolve;
            let place = module.fragment_vma(reloc.target);
            let mut symbol_value = s;
            if target.redirects_to_plt(reloc.rtype) {
                if let Some(id) = resolve {
                    if module.pool.info(id).reserved.contains(ReservedFlags::PLT) {
                        if let Some(&(_, frag)) = module.plt_slots.get(&id) {
                            symbol_value = module.fragment_vma(FragmentRef { frag, offset: 0 });
                        }
                    }
                }
            }
            let got_value = if target.uses_got(reloc.rtype) {
                Some(got_slot_vma(module, reloc.symbol))
            } else {
                None
            };
            let paired_value = reloc.paired.and_then(|hi| hi_values.get(&hi).copied());
            let rewrite_abs = rewrites.contains(&rid)
                || reloc
                    .paired
                    .map(|hi| rewrites.contains(&hi))
                    .unwrap_or(false);
            work.push(Work {
                frag: reloc.target.frag,
                offset: reloc.target.offset,
                input: RelocInput {
                    rtype: reloc.rtype,
                    symbol_value,
                    addend: a,
                    place,
                    paired_value,
                    got_value,
                    got_base: got_base(module),
                    tls_base: tls,
                    gp,
                    is_static,
                    rewrite_abs,
                },
                sym_name,
                owner: module.inputs[module.sections[sid].owner].display_name(),
            });
        }
    }
    // third pass: mutate fragment bytes
    for w in work {
        let data = match &mut module.fragments[w.frag].kind {
            FragmentKind::Region { data } | FragmentKind::Stub { data, .. } => data,
            _ => continue,
        };
        let offset = w.offset as usize;
        if offset > data.len() {
            continue;
        }
        let slice = &mut data[offset..];
        match target.apply(&w.input, slice, module.endian, module.class) {
            Ok(()) => {}
            Err(RelocFailure::Overflow { value }) => {
                module.diag.raise(DiagnosticEntry::error(
                    DiagId::ERROR_RELOC_OVERFLOW,
                    vec![
                        target.reloc_name(w.input.rtype),
                        w.sym_name,
                        format!("{value:x}"),
                        w.owner,
                    ],
                ));
            }
            Err(RelocFailure::BadAlignment { value, required }) => {
                module.diag.raise(DiagnosticEntry::error(
                    DiagId::ERROR_RELOC_BAD_ALIGNMENT,
                    vec![
                        target.reloc_name(w.input.rtype),
                        w.sym_name,
                        format!("{value:x}"),
                        required.to_string(),
                    ],
                ));
            }
            Err(RelocFailure::BadPairing) => {
                module.diag.raise(DiagnosticEntry::error(
                    DiagId::ERROR_ORPHAN_LO_RELOC,
                    vec![w.owner],
                ));
            }
            Err(RelocFailure::Unsupported { rtype }) => {
                module.diag.raise(DiagnosticEntry::error(
                    DiagId::ERROR_UNSUPPORTED_RELOC,
                    vec![target.reloc_name(rtype), w.sym_name, w.owner],
                ));
            }
        }
    }
}

fn apply_sections(module: &Module) -> Vec<SectionId> {
    let mut out = Vec::new();
    for (_, input) in module.inputs.iter() {
        for &sid in &input.sections {
            let section = &module.sections[sid];
            if section.is_discarded() || !section.live || section.relocs.is_empty() {
                continue;
            }
            if section.output_section.is_none() {
                continue;
            }
            out.push(sid);
        }
    }
    out
}

/// The VMA of the GOT slot backing `symbol`'s GOT-class access.
fn got_slot_vma(module: &Module, symbol: SymbolId) -> u64 {
    let sym = module.pool.symbol(symbol);
    let frag = match sym.resolve {
        Some(id) => module
            .got_slots
            .get(&(id, GotSlotKind::Regular))
            .or_else(|| module.got_slots.get(&(id, GotSlotKind::TlsModuleId)))
            .or_else(|| module.got_slots.get(&(id, GotSlotKind::TlsTpOff)))
            .copied(),
        None => module.local_got_slots.get(&symbol).copied(),
    };
    frag.map(|f| module.fragment_vma(FragmentRef { frag: f, offset: 0 }))
        .unwrap_or(0)
}

/// `_GLOBAL_OFFSET_TABLE_`: the `.got.plt` base when it exists, else the
/// `.got` base.
fn got_base(module: &Module) -> u64 {
    for name in [".got.plt", ".got"] {
        let section = module
            .sections
            .iter()
            .find(|(_, s)| s.name == name && s.out.is_some() && !s.fragments.is_empty());
        if let Some((_, s)) = section {
            if let Some(out) = &s.out {
                return out.addr;
            }
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tls_base_defaults_to_zero() {
        let module = Module::new(crate::config::LinkConfig::builder().build());
        assert_eq!(tls_base(&module), 0);
    }
}

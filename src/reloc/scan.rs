//! The relocation scan: decide per relocation what linker-synthesized
//! artifact is required, reserve it, and record dynamic relocations.
//!
//! Reservations are keyed by `ResolveInfo` identity and guarded by the
//! record's reserved mask, so the scan is idempotent and a relocation
//! discovered twice (or concurrently) reuses the same artifact.

use crate::diag::{DiagId, DiagnosticEntry};
use crate::elf::{self, SectionFlags};
use crate::fragment::{FragmentId, FragmentKind, FragmentRef, GotSlotKind};
use crate::input::InternalInputKind;
use crate::module::Module;
use crate::reloc::{DynReloc, RelocAction, RelocId};
use crate::section::SectionId;
use crate::symbol::{ReservedFlags, ResolveId, SymbolType};
use crate::target::{ClassifyInput, PairRole, TargetInfo};
use std::collections::HashMap;

/// Run the scan over every live section.
pub fn run(module: &mut Module, target: &dyn TargetInfo) {
    pair_hi_lo(module, target);
    let scan_order = scan_sections(module);
    let dynamic = module.is_dynamic_link();
    let is_pic = module.config.is_pic();
    let is_static = module.config.is_static;
    let bsymbolic = module.config.bsymbolic;
    for sid in scan_order {
        let reloc_ids = module.sections[sid].relocs.clone();
        for rid in reloc_ids {
            let reloc = module.relocs[rid].clone();
            let sym = module.pool.symbol(reloc.symbol);
            let resolve = sym.resolve;
            let (preemptible, is_func, is_tls, from_dynamic) = match resolve {
                Some(id) => {
                    let info = module.pool.info(id);
                    (
                        info.is_preemptible(dynamic, bsymbolic),
                        info.ty == SymbolType::Func || info.ty == SymbolType::IFunc,
                        info.ty == SymbolType::Tls,
                        info.from_dynamic,
                    )
                }
                None => (
                    false,
                    sym.ty == SymbolType::Func,
                    sym.ty == SymbolType::Tls,
                    false,
                ),
            };
            let action = target.classify(&ClassifyInput {
                rtype: reloc.rtype,
                preemptible,
                is_pic,
                is_static,
                is_func,
                is_tls,
                is_local: resolve.is_none(),
                from_dynamic,
            });
            match action {
                RelocAction::None => {}
                RelocAction::DynRelative => {
                    if dynamic || is_pic {
                        module.dyn_relocs.push(DynReloc {
                            rtype: target.dyn_codes().relative,
                            sym: None,
                            place: reloc.target,
                            addend: reloc.addend,
                            is_plt: false,
                        });
                    }
                }
                RelocAction::DynSymbolic => {
                    if let Some(id) = resolve {
                        reserve_dyn_symbolic(module, target, id, &reloc);
                    }
                }
                RelocAction::Got => {
                    reserve_got_for(module, target, resolve, reloc.symbol, preemptible);
                }
                RelocAction::Plt => {
                    if let Some(id) = resolve {
                        reserve_plt(module, target, id);
                    }
                }
                RelocAction::Copy => {
                    if let Some(id) = resolve {
                        reserve_copy(module, target, id);
                    }
                }
                RelocAction::TlsGd => {
                    if let Some(id) = resolve {
                        reserve_tls_gd(module, target, id, preemptible, is_static);
                    }
                }
                RelocAction::TlsLd => {
                    reserve_tls_ld(module, target, is_static);
                }
                RelocAction::TlsIe => {
                    if let Some(id) = resolve {
                        reserve_tls_ie(module, target, id, preemptible, is_static);
                    }
                }
                RelocAction::TlsLe => {
                    if dynamic && is_pic {
                        let name = module.pool.symbol(reloc.symbol).name.clone();
                        module.raise(DiagnosticEntry::error(
                            DiagId::ERROR_DYNAMIC_REQUIRED,
                            vec![
                                target.reloc_name(reloc.rtype),
                                name,
                                module.inputs[module.sections[sid].owner].display_name(),
                            ],
                        ));
                    }
                }
                RelocAction::Unsupported => {
                    let name = module.pool.symbol(reloc.symbol).name.clone();
                    module.raise(DiagnosticEntry::error(
                        DiagId::ERROR_UNSUPPORTED_RELOC,
                        vec![
                            target.reloc_name(reloc.rtype),
                            name,
                            module.inputs[module.sections[sid].owner].display_name(),
                        ],
                    ));
                }
            }
        }
    }
}

/// Sections the scan visits, in deterministic input order.
fn scan_sections(module: &Module) -> Vec<SectionId> {
    let mut out = Vec::new();
    for (_, input) in module.inputs.iter() {
        for &sid in &input.sections {
            let section = &module.sections[sid];
            if section.is_discarded() || !section.live || section.relocs.is_empty() {
                continue;
            }
            out.push(sid);
        }
    }
    out
}

/// Link each low-part relocation to its high partner: the low part's
/// symbol names the high site's label, so the pair is found by offset
/// within the same section.
fn pair_hi_lo(module: &mut Module, target: &dyn TargetInfo) {
    let sections = scan_sections(module);
    for sid in sections {
        let reloc_ids = module.sections[sid].relocs.clone();
        let mut hi_by_offset: HashMap<u64, RelocId> = HashMap::new();
        for &rid in &reloc_ids {
            let reloc = &module.relocs[rid];
            if target.pair_role(reloc.rtype) == PairRole::High {
                hi_by_offset.insert(reloc.target.offset, rid);
            }
        }
        for &rid in &reloc_ids {
            let reloc = &module.relocs[rid];
            if target.pair_role(reloc.rtype) != PairRole::Low {
                continue;
            }
            let sym = module.pool.symbol(reloc.symbol);
            let hi = if sym.section == Some(sid) {
                hi_by_offset.get(&sym.value).copied()
            } else {
                None
            };
            match hi {
                Some(hi_rid) => module.relocs[rid].paired = Some(hi_rid),
                None => {
                    let owner = module.inputs[module.sections[sid].owner].display_name();
                    let name = module.pool.symbol(module.relocs[rid].symbol).name.clone();
                    module.raise(DiagnosticEntry::error(
                        DiagId::ERROR_UNRESOLVED_PAIRED_HI,
                        vec![owner, name],
                    ));
                }
            }
        }
    }
}

fn got_section(module: &mut Module, target: &dyn TargetInfo) -> SectionId {
    let align = target.got_entry_size(module.class);
    module.internal_section(
        InternalInputKind::Got,
        ".got",
        elf::SHT_PROGBITS,
        SectionFlags::ALLOC | SectionFlags::WRITE,
        align,
    )
}

fn gotplt_section(module: &mut Module, target: &dyn TargetInfo) -> SectionId {
    let align = target.got_entry_size(module.class);
    module.internal_section(
        InternalInputKind::GotPlt,
        ".got.plt",
        elf::SHT_PROGBITS,
        SectionFlags::ALLOC | SectionFlags::WRITE,
        align,
    )
}

fn plt_section(module: &mut Module) -> SectionId {
    module.internal_section(
        InternalInputKind::Plt,
        ".plt",
        elf::SHT_PROGBITS,
        SectionFlags::ALLOC | SectionFlags::EXECINSTR,
        16,
    )
}

fn alloc_got_slot(
    module: &mut Module,
    target: &dyn TargetInfo,
    kind: GotSlotKind,
    sym: Option<ResolveId>,
) -> FragmentId {
    let section = got_section(module, target);
    let size = target.got_entry_size(module.class);
    module.append_fragment(
        section,
        size,
        FragmentKind::Got {
            kind,
            sym,
            size,
            value: 0,
        },
    )
}

/// Reserve the regular GOT slot for a symbol (or a local occurrence).
pub fn reserve_got_for(
    module: &mut Module,
    target: &dyn TargetInfo,
    resolve: Option<ResolveId>,
    symbol: crate::symbol::SymbolId,
    preemptible: bool,
) -> FragmentId {
    if let Some(id) = resolve {
        if let Some(&frag) = module.got_slots.get(&(id, GotSlotKind::Regular)) {
            return frag;
        }
        let frag = alloc_got_slot(module, target, GotSlotKind::Regular, Some(id));
        module.got_slots.insert((id, GotSlotKind::Regular), frag);
        module.pool.info_mut(id).reserved |= ReservedFlags::GOT;
        if preemptible {
            module.dyn_relocs.push(DynReloc {
                rtype: target.dyn_codes().glob_dat,
                sym: Some(id),
                place: FragmentRef { frag, offset: 0 },
                addend: 0,
                is_plt: false,
            });
            module.pool.info_mut(id).reserved |= ReservedFlags::DYN_REL;
        } else if module.config.is_pic() {
            // the slot holds a link-time value fixed up by the loader
            module.dyn_relocs.push(DynReloc {
                rtype: target.dyn_codes().relative,
                sym: None,
                place: FragmentRef { frag, offset: 0 },
                addend: 0,
                is_plt: false,
            });
        }
        frag
    } else {
        if let Some(&frag) = module.local_got_slots.get(&symbol) {
            return frag;
        }
        let frag = alloc_got_slot(module, target, GotSlotKind::Regular, None);
        module.local_got_slots.insert(symbol, frag);
        if module.config.is_pic() {
            module.dyn_relocs.push(DynReloc {
                rtype: target.dyn_codes().relative,
                sym: None,
                place: FragmentRef { frag, offset: 0 },
                addend: 0,
                is_plt: false,
            });
        }
        frag
    }
}

/// Reserve a PLT entry (stub + GOTPLT slot + `JMP_SLOT`).
pub fn reserve_plt(
    module: &mut Module,
    target: &dyn TargetInfo,
    id: ResolveId,
) -> (usize, FragmentId) {
    if let Some(&entry) = module.plt_slots.get(&id) {
        return entry;
    }
    let plt = plt_section(module);
    if module.sections[plt].fragments.is_empty() {
        // the header trampoline occupies slot zero; bytes are finalized
        // once addresses are known
        let size = target.plt_header_size();
        module.append_fragment(
            plt,
            16,
            FragmentKind::Plt {
                index: usize::MAX,
                data: vec![0; size as usize],
            },
        );
        // .got.plt[0..3] are reserved for the loader
        let gotplt = gotplt_section(module, target);
        for _ in 0..3 {
            let size = target.got_entry_size(module.class);
            module.append_fragment(
                gotplt,
                size,
                FragmentKind::Got {
                    kind: GotSlotKind::GotPlt,
                    sym: None,
                    size,
                    value: 0,
                },
            );
        }
    }
    let index = module.plt_slots.len();
    let entry_size = target.plt_entry_size();
    let frag = module.append_fragment(
        plt,
        16,
        FragmentKind::Plt {
            index,
            data: vec![0; entry_size as usize],
        },
    );
    let gotplt = gotplt_section(module, target);
    let slot_size = target.got_entry_size(module.class);
    let slot = module.append_fragment(
        gotplt,
        slot_size,
        FragmentKind::Got {
            kind: GotSlotKind::GotPlt,
            sym: Some(id),
            size: slot_size,
            value: 0,
        },
    );
    module.gotplt_slots.insert(id, slot);
    module.plt_slots.insert(id, (index, frag));
    module.pool.info_mut(id).reserved |= ReservedFlags::PLT;
    module.dyn_relocs.push(DynReloc {
        rtype: target.dyn_codes().jump_slot,
        sym: Some(id),
        place: FragmentRef {
            frag: slot,
            offset: 0,
        },
        addend: 0,
        is_plt: true,
    });
    (index, frag)
}

/// Promote a shared-library datum to a copy relocation: equivalent space
/// in `.bss`, the symbol re-pointed there, one `R_*_COPY` emitted.
pub fn reserve_copy(module: &mut Module, target: &dyn TargetInfo, id: ResolveId) {
    if module.pool.info(id).reserved.contains(ReservedFlags::COPY_REL) {
        return;
    }
    let (size, align, name, ty) = {
        let info = module.pool.info(id);
        (
            info.size.max(1),
            info.common_align.max(module.class.word_size()),
            info.name.clone(),
            info.ty,
        )
    };
    let section = module.internal_section(
        InternalInputKind::CopyRelocs,
        ".bss",
        elf::SHT_NOBITS,
        SectionFlags::ALLOC | SectionFlags::WRITE,
        align,
    );
    let frag = module.append_fragment(
        section,
        align,
        FragmentKind::Fill {
            size,
            pattern: 0,
            pattern_size: 0,
        },
    );
    let owner = module.sections[section].owner;
    module.pool.define_in_section(
        owner,
        &name,
        section,
        Some(FragmentRef { frag, offset: 0 }),
        0,
        ty,
        false,
    );
    {
        let info = module.pool.info_mut(id);
        info.reserved |= ReservedFlags::COPY_REL | ReservedFlags::DYN_REL;
        info.from_dynamic = false;
    }
    module.dyn_relocs.push(DynReloc {
        rtype: target.dyn_codes().copy,
        sym: Some(id),
        place: FragmentRef { frag, offset: 0 },
        addend: 0,
        is_plt: false,
    });
}

fn reserve_dyn_symbolic(
    module: &mut Module,
    target: &dyn TargetInfo,
    id: ResolveId,
    reloc: &crate::reloc::Relocation,
) {
    module.dyn_relocs.push(DynReloc {
        rtype: target.dyn_codes().symbolic,
        sym: Some(id),
        place: reloc.target,
        addend: reloc.addend,
        is_plt: false,
    });
    module.pool.info_mut(id).reserved |= ReservedFlags::DYN_REL;
}

fn reserve_tls_gd(
    module: &mut Module,
    target: &dyn TargetInfo,
    id: ResolveId,
    preemptible: bool,
    is_static: bool,
) {
    if module.pool.info(id).reserved.contains(ReservedFlags::TLS_GD) {
        return;
    }
    let modid = alloc_got_slot(module, target, GotSlotKind::TlsModuleId, Some(id));
    let offset = alloc_got_slot(module, target, GotSlotKind::TlsOffset, Some(id));
    module.got_slots.insert((id, GotSlotKind::TlsModuleId), modid);
    module.got_slots.insert((id, GotSlotKind::TlsOffset), offset);
    module.pool.info_mut(id).reserved |= ReservedFlags::TLS_GD | ReservedFlags::GOT;
    if !is_static && (preemptible || module.config.is_pic()) {
        let codes = target.dyn_codes();
        module.dyn_relocs.push(DynReloc {
            rtype: codes.dtpmod,
            sym: Some(id),
            place: FragmentRef {
                frag: modid,
                offset: 0,
            },
            addend: 0,
            is_plt: false,
        });
        if preemptible {
            module.dyn_relocs.push(DynReloc {
                rtype: codes.dtprel,
                sym: Some(id),
                place: FragmentRef {
                    frag: offset,
                    offset: 0,
                },
                addend: 0,
                is_plt: false,
            });
        }
    }
}

fn reserve_tls_ld(module: &mut Module, target: &dyn TargetInfo, is_static: bool) {
    if module.tls_ld_slot.is_some() {
        return;
    }
    // one shared module-id slot, plus a zero offset slot
    let section = got_section(module, target);
    let size = target.got_entry_size(module.class);
    let modid = module.append_fragment(
        section,
        size,
        FragmentKind::Got {
            kind: GotSlotKind::TlsModuleId,
            sym: None,
            size,
            value: 0,
        },
    );
    module.append_fragment(
        section,
        size,
        FragmentKind::Got {
            kind: GotSlotKind::TlsOffset,
            sym: None,
            size,
            value: 0,
        },
    );
    module.tls_ld_slot = Some(modid);
    if !is_static {
        module.dyn_relocs.push(DynReloc {
            rtype: target.dyn_codes().dtpmod,
            sym: None,
            place: FragmentRef {
                frag: modid,
                offset: 0,
            },
            addend: 0,
            is_plt: false,
        });
    }
}

fn reserve_tls_ie(
    module: &mut Module,
    target: &dyn TargetInfo,
    id: ResolveId,
    preemptible: bool,
    is_static: bool,
) {
    if module.pool.info(id).reserved.contains(ReservedFlags::TLS_IE) {
        return;
    }
    let slot = alloc_got_slot(module, target, GotSlotKind::TlsTpOff, Some(id));
    module.got_slots.insert((id, GotSlotKind::TlsTpOff), slot);
    module.pool.info_mut(id).reserved |= ReservedFlags::TLS_IE | ReservedFlags::GOT;
    if !is_static && (preemptible || module.config.is_pic()) {
        module.dyn_relocs.push(DynReloc {
            rtype: target.dyn_codes().tprel,
            sym: Some(id),
            place: FragmentRef {
                frag: slot,
                offset: 0,
            },
            addend: 0,
            is_plt: false,
        });
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LinkConfig, OutputKind};
    use crate::elf::ElfClass;
    use crate::fragment::FragmentKind;
    use crate::input::{InputFile, InputKind};
    use crate::reloc::Relocation;
    use crate::section::{Section, SectionKind};
    use crate::symbol::name_pool::SymbolInput;
    use crate::symbol::{SymbolBinding, SymbolDesc, Visibility};
    use crate::target::riscv::{self, RiscV};

    fn scan_module(kind: OutputKind, rtype: u32) -> Module {
        let mut module = Module::new(LinkConfig::builder().kind(kind).build());
        let input = module
            .inputs
            .alloc(InputFile::new("a.o", InputKind::Object, 0));
        let mut text = Section::new(".text", SectionKind::Regular, input);
        text.flags = SectionFlags::ALLOC | SectionFlags::EXECINSTR;
        text.live = true;
        let sid = module.sections.alloc(text);
        module.inputs[input].sections.push(sid);
        let frag = module.append_fragment(sid, 4, FragmentKind::Region { data: vec![0; 16] });
        // an undefined preemptible function
        let sym = module
            .pool
            .add_symbol(
                input,
                SymbolInput {
                    name: "callee",
                    ty: SymbolType::Func,
                    desc: SymbolDesc::Undefined,
                    binding: SymbolBinding::Global,
                    visibility: Visibility::Default,
                    size: 0,
                    value: 0,
                    section: None,
                    frag_ref: None,
                    special_shndx: None,
                    from_dynamic: false,
                    common_align: 0,
                },
            )
            .unwrap();
        // make it satisfied by a shared library so the link is dynamic
        let dso = module.inputs.alloc(InputFile::new(
            "libc.so",
            InputKind::SharedObject,
            1,
        ));
        module.needs_dynamic = true;
        module
            .pool
            .add_symbol(
                dso,
                SymbolInput {
                    name: "callee",
                    ty: SymbolType::Func,
                    desc: SymbolDesc::Defined,
                    binding: SymbolBinding::Global,
                    visibility: Visibility::Default,
                    size: 0,
                    value: 0x100,
                    section: None,
                    frag_ref: None,
                    special_shndx: None,
                    from_dynamic: true,
                    common_align: 0,
                },
            )
            .unwrap();
        let rid = module.relocs.alloc(Relocation {
            rtype,
            symbol: sym,
            target: FragmentRef { frag, offset: 0 },
            addend: 0,
            paired: None,
            section: sid,
        });
        module.sections[sid].relocs.push(rid);
        module
    }

    #[test]
    fn test_plt_reservation_is_idempotent() {
        let mut module = scan_module(OutputKind::Exec, riscv::R_RISCV_CALL_PLT);
        let target = RiscV::new(ElfClass::Elf32);
        run(&mut module, &target);
        run(&mut module, &target);
        assert_eq!(module.plt_slots.len(), 1);
        let id = module.pool.find_id("callee").unwrap();
        assert!(module.pool.info(id).reserved.contains(ReservedFlags::PLT));
        // one JMP_SLOT dynamic reloc despite two scans
        let jump_slots = module
            .dyn_relocs
            .iter()
            .filter(|d| d.rtype == riscv::R_RISCV_JUMP_SLOT)
            .count();
        assert_eq!(jump_slots, 1);
        // header + one entry in .plt
        let plt = module
            .internal_section(
                InternalInputKind::Plt,
                ".plt",
                elf::SHT_PROGBITS,
                SectionFlags::ALLOC | SectionFlags::EXECINSTR,
                16,
            );
        assert_eq!(module.sections[plt].fragments.len(), 2);
    }

    #[test]
    fn test_got_reservation() {
        let mut module = scan_module(OutputKind::Exec, riscv::R_RISCV_GOT_HI20);
        let target = RiscV::new(ElfClass::Elf32);
        run(&mut module, &target);
        let id = module.pool.find_id("callee").unwrap();
        assert!(module.pool.info(id).reserved.contains(ReservedFlags::GOT));
        assert!(module
            .got_slots
            .contains_key(&(id, GotSlotKind::Regular)));
        // preemptible symbol gets a symbolic dynamic reloc on its slot
        assert_eq!(module.dyn_relocs.len(), 1);
        assert_eq!(module.dyn_relocs[0].sym, Some(id));
    }

    #[test]
    fn test_static_call_reserves_nothing() {
        let mut module = scan_module(OutputKind::Exec, riscv::R_RISCV_CALL_PLT);
        module.config.is_static = true;
        module.needs_dynamic = false;
        let target = RiscV::new(ElfClass::Elf32);
        run(&mut module, &target);
        assert!(module.plt_slots.is_empty());
        assert!(module.dyn_relocs.is_empty());
    }
}

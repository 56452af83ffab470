//! Linker relaxation (RISC-V): rewrite oversized sequences once
//! addresses are known, delete the surplus bytes and shift every
//! following symbol and relocation target in the section.
//!
//! The driver iterates relax passes with a fresh address assignment in
//! between until no pass shrinks anything. Deleted bytes are never
//! restored; `R_RISCV_ALIGN` padding is the reservoir the pass consumes.

use crate::diag::{DiagId, DiagnosticEntry, DiagnosticKind};
use crate::elf::write::{get_u32_at, put_u32_at};
use crate::elf::ElfMachine;
use crate::module::Module;
use crate::reloc::RelocId;
use crate::section::SectionId;
use crate::support::align_up;
use crate::symbol::ReservedFlags;
use crate::target::riscv;

/// Bytes deleted vs. bytes a conservative analysis had to leave in
/// place, per module; section detail is logged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelaxStats {
    pub bytes_deleted: u64,
    pub bytes_frustrated: u64,
    pub passes: u32,
}

enum Action {
    /// Overwrite the 32-bit word at `offset`
    Patch { offset: u64, word: u32 },
    /// Change a relocation's type
    Retype { rid: RelocId, rtype: u32 },
    /// Remove `len` bytes at `offset`
    Delete { offset: u64, len: u64 },
}

/// One relaxation pass over every candidate section. Returns the bytes
/// deleted; zero means the fixed point is reached.
pub fn relax_pass(module: &mut Module, stats: &mut RelaxStats) -> u64 {
    if module.machine != ElfMachine::RiscV || !module.config.relax {
        return 0;
    }
    let mut deleted_total = 0u64;
    let sections: Vec<SectionId> = module
        .inputs
        .iter()
        .flat_map(|(_, input)| input.sections.clone())
        .filter(|&sid| {
            let s = &module.sections[sid];
            s.live && !s.is_discarded() && s.is_exec() && !s.relocs.is_empty()
                && s.output_section.is_some()
        })
        .collect();
    for sid in sections {
        deleted_total += relax_section(module, sid, stats);
    }
    stats.passes += 1;
    stats.bytes_deleted += deleted_total;
    deleted_total
}

fn relax_section(module: &mut Module, sid: SectionId, stats: &mut RelaxStats) -> u64 {
    let reloc_ids = module.sections[sid].relocs.clone();
    // a RELAX marker at the same offset opts a site in
    let relax_offsets: std::collections::HashSet<u64> = reloc_ids
        .iter()
        .filter(|&&rid| module.relocs[rid].rtype == riscv::R_RISCV_RELAX)
        .map(|&rid| module.relocs[rid].target.offset)
        .collect();
    let gp = module
        .pool
        .find_id("__global_pointer$")
        .filter(|&id| module.pool.info(id).is_defined())
        .map(|id| module.resolve_value(id));
    let mut actions: Vec<Action> = Vec::new();
    for &rid in &reloc_ids {
        let reloc = module.relocs[rid].clone();
        let offset = reloc.target.offset;
        match reloc.rtype {
            riscv::R_RISCV_CALL | riscv::R_RISCV_CALL_PLT => {
                if !relax_offsets.contains(&offset) {
                    continue;
                }
                let sym = module.pool.symbol(reloc.symbol);
                if let Some(id) = sym.resolve {
                    if module.pool.info(id).reserved.contains(ReservedFlags::PLT) {
                        continue;
                    }
                    if !module.pool.info(id).is_defined() {
                        continue;
                    }
                }
                let s = module.symbol_value_of_reloc(reloc.symbol);
                let p = module.fragment_vma(reloc.target);
                let x = s.wrapping_add(reloc.addend as u64).wrapping_sub(p) as i64;
                if x >= -(1 << 20) && x < (1 << 20) && x % 2 == 0 {
                    // AUIPC+JALR becomes JAL, keeping the link register
                    let word = read_word(module, sid, offset + 4);
                    let rd = (word >> 7) & 0x1f;
                    actions.push(Action::Patch {
                        offset,
                        word: 0x6f | (rd << 7),
                    });
                    actions.push(Action::Retype {
                        rid,
                        rtype: riscv::R_RISCV_JAL,
                    });
                    actions.push(Action::Delete {
                        offset: offset + 4,
                        len: 4,
                    });
                    module.raise(DiagnosticEntry::new(
                        DiagId::VERBOSE_RELAX_REWRITE,
                        DiagnosticKind::Verbose,
                        vec![
                            "call-to-jal".to_string(),
                            format!("{p:x}"),
                            module.sections[sid].name.clone(),
                            "4".to_string(),
                        ],
                    ));
                } else {
                    stats.bytes_frustrated += 4;
                }
            }
            riscv::R_RISCV_HI20 => {
                if !relax_offsets.contains(&offset) {
                    continue;
                }
                let Some(gp) = gp else {
                    stats.bytes_frustrated += 4;
                    continue;
                };
                let s = module.symbol_value_of_reloc(reloc.symbol);
                let value = s.wrapping_add(reloc.addend as u64);
                let delta = value.wrapping_sub(gp) as i64;
                if !(-0x800..0x800).contains(&delta) {
                    stats.bytes_frustrated += 4;
                    continue;
                }
                // the LUI goes away; matching absolute LO12 sites become
                // gp-relative
                actions.push(Action::Retype {
                    rid,
                    rtype: riscv::R_RISCV_NONE,
                });
                actions.push(Action::Delete { offset, len: 4 });
                for &lo_rid in &reloc_ids {
                    let lo = module.relocs[lo_rid].clone();
                    let is_lo_i = lo.rtype == riscv::R_RISCV_LO12_I;
                    let is_lo_s = lo.rtype == riscv::R_RISCV_LO12_S;
                    if !is_lo_i && !is_lo_s {
                        continue;
                    }
                    let lo_sym = module.pool.symbol(lo.symbol);
                    let hi_sym = module.pool.symbol(reloc.symbol);
                    if lo_sym.name != hi_sym.name || lo.addend != reloc.addend {
                        continue;
                    }
                    let lo_word = read_word(module, sid, lo.target.offset);
                    actions.push(Action::Patch {
                        offset: lo.target.offset,
                        word: set_rs1_gp(lo_word),
                    });
                    actions.push(Action::Retype {
                        rid: lo_rid,
                        rtype: if is_lo_i {
                            riscv::R_RISCV_INTERNAL_GPREL_I
                        } else {
                            riscv::R_RISCV_INTERNAL_GPREL_S
                        },
                    });
                }
                module.raise(DiagnosticEntry::new(
                    DiagId::VERBOSE_RELAX_REWRITE,
                    DiagnosticKind::Verbose,
                    vec![
                        "lui-to-gprel".to_string(),
                        format!("{:x}", module.fragment_vma(reloc.target)),
                        module.sections[sid].name.clone(),
                        "4".to_string(),
                    ],
                ));
            }
            riscv::R_RISCV_ALIGN => {
                let p = module.fragment_vma(reloc.target);
                let avail = reloc.addend as u64;
                let align = (avail + 4).next_power_of_two();
                let needed = align_up(p, align) - p;
                if needed > avail {
                    module.raise(DiagnosticEntry::error(
                        DiagId::PLAIN,
                        vec![format!(
                            "cannot satisfy alignment padding in `{}': need {needed}, have {avail}",
                            module.sections[sid].name
                        )],
                    ));
                    continue;
                }
                let surplus = avail - needed;
                if surplus > 0 {
                    actions.push(Action::Delete {
                        offset: offset + needed,
                        len: surplus,
                    });
                }
                // consumed either way; never reconsidered
                actions.push(Action::Retype {
                    rid,
                    rtype: riscv::R_RISCV_NONE,
                });
            }
            _ => {}
        }
    }
    if actions.is_empty() {
        return 0;
    }
    // byte patches land before any deletion moves the bytes
    let mut deleted = 0u64;
    for action in &actions {
        if let Action::Patch { offset, word } = action {
            write_word(module, sid, *offset, *word);
        }
    }
    for action in &actions {
        if let Action::Retype { rid, rtype } = action {
            module.relocs[*rid].rtype = *rtype;
        }
    }
    let mut deletions: Vec<(u64, u64)> = actions
        .iter()
        .filter_map(|a| match a {
            Action::Delete { offset, len } => Some((*offset, *len)),
            _ => None,
        })
        .collect();
    deletions.sort_by(|a, b| b.0.cmp(&a.0));
    for (offset, len) in deletions {
        delete_bytes(module, sid, offset, len);
        deleted += len;
    }
    log::debug!(
        "relaxed `{}' in {}: {deleted} bytes deleted",
        module.sections[sid].name,
        module.inputs[module.sections[sid].owner].display_name()
    );
    deleted
}

fn read_word(module: &Module, sid: SectionId, offset: u64) -> u32 {
    let frag = module.sections[sid].fragments[0];
    match &module.fragments[frag].kind {
        crate::fragment::FragmentKind::Region { data } => {
            get_u32_at(&data[offset as usize..], module.endian)
        }
        _ => 0,
    }
}

fn write_word(module: &mut Module, sid: SectionId, offset: u64, word: u32) {
    let endian = module.endian;
    let frag = module.sections[sid].fragments[0];
    if let crate::fragment::FragmentKind::Region { data } =
        &mut module.fragments[frag].kind
    {
        put_u32_at(&mut data[offset as usize..], endian, word);
    }
}

/// Rewrite an absolute-addressing instruction's base register to `gp`.
fn set_rs1_gp(word: u32) -> u32 {
    (word & !(0x1f << 15)) | (3 << 15)
}

/// Remove `len` bytes at `offset` from the section's region fragment and
/// shift every following symbol value and relocation target-ref. Offsets
/// at or before the cut stay put, so no offset can go negative, and
/// target refs stay within the (now smaller) fragment.
pub fn delete_bytes(module: &mut Module, sid: SectionId, offset: u64, len: u64) {
    let frag = module.sections[sid].fragments[0];
    if let crate::fragment::FragmentKind::Region { data } = &mut module.fragments[frag].kind {
        let start = offset as usize;
        let end = (offset + len) as usize;
        data.drain(start..end.min(data.len()));
    }
    let reloc_ids = module.sections[sid].relocs.clone();
    for rid in reloc_ids {
        let reloc = &mut module.relocs[rid];
        if reloc.target.offset > offset {
            reloc.target.offset -= len;
        }
    }
    // every symbol placed after the cut moves with the bytes, including
    // values previously committed from assignments re-derived on the
    // next sweep
    for sym_id in module.pool.symbol_ids() {
        let sym = module.pool.symbol_mut(sym_id);
        if sym.section != Some(sid) {
            continue;
        }
        if sym.value > offset {
            sym.value -= len;
        }
        if let Some(fref) = sym.frag_ref.as_mut() {
            if fref.frag == frag && fref.offset > offset {
                fref.offset -= len;
            }
        }
    }
    module.sections[sid].size = module.sections[sid].size.saturating_sub(len);
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LinkConfig;
    use crate::elf::SectionFlags;
    use crate::fragment::{FragmentKind, FragmentRef};
    use crate::input::{InputFile, InputKind};
    use crate::object::section_map::build_and_match;
    use crate::reloc::Relocation;
    use crate::section::{Section, SectionKind};
    use crate::symbol::name_pool::SymbolInput;
    use crate::symbol::{SymbolBinding, SymbolDesc, SymbolType, Visibility};

    /// A `.text` with auipc+jalr at 0 (CALL+RELAX) calling a symbol 0x20
    /// bytes ahead, then 8 bytes of tail code with a symbol on it.
    fn call_module() -> (Module, SectionId) {
        let mut module = Module::new(LinkConfig::builder().build());
        let input = module
            .inputs
            .alloc(InputFile::new("a.o", InputKind::Object, 0));
        let mut text = Section::new(".text", SectionKind::Regular, input);
        text.flags = SectionFlags::ALLOC | SectionFlags::EXECINSTR;
        text.live = true;
        text.align = 4;
        let sid = module.sections.alloc(text);
        module.inputs[input].sections.push(sid);
        let mut data = Vec::new();
        data.extend_from_slice(&0x0000_0097u32.to_le_bytes()); // auipc ra
        data.extend_from_slice(&0x0000_80e7u32.to_le_bytes()); // jalr ra
        data.extend_from_slice(&[0x13, 0, 0, 0]); // nop
        data.extend_from_slice(&[0x13, 0, 0, 0]); // nop
        data.extend_from_slice(&[0x67, 0x80, 0, 0]); // ret (target)
        let frag = module.append_fragment(sid, 4, FragmentKind::Region { data });
        let callee = module
            .pool
            .add_symbol(
                input,
                SymbolInput {
                    name: "callee",
                    ty: SymbolType::Func,
                    desc: SymbolDesc::Defined,
                    binding: SymbolBinding::Global,
                    visibility: Visibility::Default,
                    size: 4,
                    value: 16,
                    section: Some(sid),
                    frag_ref: Some(FragmentRef { frag, offset: 16 }),
                    special_shndx: None,
                    from_dynamic: false,
                    common_align: 0,
                },
            )
            .unwrap();
        let tail = module
            .pool
            .add_symbol(
                input,
                SymbolInput {
                    name: "tail",
                    ty: SymbolType::NoType,
                    desc: SymbolDesc::Defined,
                    binding: SymbolBinding::Global,
                    visibility: Visibility::Default,
                    size: 0,
                    value: 8,
                    section: Some(sid),
                    frag_ref: Some(FragmentRef { frag, offset: 8 }),
                    special_shndx: None,
                    from_dynamic: false,
                    common_align: 0,
                },
            )
            .unwrap();
        let _ = tail;
        let call = module.relocs.alloc(Relocation {
            rtype: riscv::R_RISCV_CALL,
            symbol: callee,
            target: FragmentRef { frag, offset: 0 },
            addend: 0,
            paired: None,
            section: sid,
        });
        let relax = module.relocs.alloc(Relocation {
            rtype: riscv::R_RISCV_RELAX,
            symbol: callee,
            target: FragmentRef { frag, offset: 0 },
            addend: 0,
            paired: None,
            section: sid,
        });
        module.sections[sid].relocs.push(call);
        module.sections[sid].relocs.push(relax);
        build_and_match(&mut module);
        crate::layout::assign_addresses(&mut module).unwrap();
        (module, sid)
    }

    #[test]
    fn test_call_relaxes_to_jal() {
        let (mut module, sid) = call_module();
        let mut stats = RelaxStats::default();
        let deleted = relax_pass(&mut module, &mut stats);
        assert_eq!(deleted, 4);
        assert_eq!(module.sections[sid].size, 16);
        // the call reloc is now a JAL on a jal instruction
        let call = module.sections[sid]
            .relocs
            .iter()
            .map(|&rid| module.relocs[rid].clone())
            .find(|r| r.rtype == riscv::R_RISCV_JAL)
            .unwrap();
        assert_eq!(call.target.offset, 0);
        let word = read_word(&module, sid, 0);
        assert_eq!(word & 0x7f, 0x6f); // jal opcode
        assert_eq!((word >> 7) & 0x1f, 1); // rd = ra preserved
        // the callee shifted back by 4
        let callee = module.pool.find_symbol("callee").unwrap();
        assert_eq!(callee.value, 12);
        // tail symbol after the cut shifted too
        assert_eq!(module.pool.find_symbol("tail").unwrap().value, 4);
        // a second pass finds nothing further
        let deleted = relax_pass(&mut module, &mut stats);
        assert_eq!(deleted, 0);
        assert_eq!(stats.bytes_deleted, 4);
    }

    #[test]
    fn test_symbols_at_cut_point_stay() {
        let (mut module, sid) = call_module();
        let mut stats = RelaxStats::default();
        relax_pass(&mut module, &mut stats);
        // no negative offsets anywhere
        for &rid in &module.sections[sid].relocs {
            let r = &module.relocs[rid];
            assert!(r.target.offset <= module.sections[sid].size);
        }
    }

    #[test]
    fn test_relax_disabled_by_config() {
        let (mut module, _) = call_module();
        module.config.relax = false;
        let mut stats = RelaxStats::default();
        assert_eq!(relax_pass(&mut module, &mut stats), 0);
    }
}

//! Emission: assemble the output image.
//!
//! Order: ELF header, program headers, section contents (each fragment's
//! `emit` into its slice of the image), symbol table, string tables,
//! section headers. The build-id, when enabled, is computed over the
//! final image and patched back into its note.

use crate::config::OutputKind;
use crate::diag::{DiagId, DiagnosticEntry, Result};
use crate::elf::{self, write::ByteSink};
use crate::module::Module;
use crate::section::SectionId;
use crate::support::align_up;
use crate::support::sha1::Sha1;
use crate::symbol::{ResolveId, SymbolBinding, SymbolId};
use crate::target::TargetInfo;
use std::collections::HashMap;

pub mod dynamic;
pub mod symdef;

pub use dynamic::StringTable;

/// Output sections in emission order: allocated by address, the rest by
/// assigned file offset.
fn output_sections(module: &Module) -> Vec<SectionId> {
    let mut alloc = Vec::new();
    let mut rest = Vec::new();
    for (sid, section) in module.sections.iter() {
        if section.output_section.is_some() || section.out.is_none() {
            continue;
        }
        if section.sh_type == elf::SHT_NULL && section.size == 0 {
            continue;
        }
        if section.is_alloc() {
            alloc.push(sid);
        } else {
            rest.push(sid);
        }
    }
    alloc.sort_by_key(|&sid| module.sections[sid].out.as_ref().map(|o| o.addr).unwrap_or(0));
    rest.sort_by_key(|&sid| {
        module.sections[sid]
            .out
            .as_ref()
            .map(|o| o.offset)
            .unwrap_or(0)
    });
    alloc.extend(rest);
    alloc
}

struct SymtabBuilder {
    sink: ByteSink,
    strtab: StringTable,
    count: u32,
    first_global: u32,
    by_resolve: HashMap<ResolveId, u32>,
    by_local: HashMap<SymbolId, u32>,
}

fn shndx_of(module: &Module, section: Option<SectionId>, order: &HashMap<SectionId, u16>) -> u16 {
    let Some(sid) = section else {
        return elf::SHN_UNDEF;
    };
    let top = module.sections[sid].output_section.unwrap_or(sid);
    order.get(&top).copied().unwrap_or(elf::SHN_UNDEF)
}

fn build_symtab(module: &Module, order: &HashMap<SectionId, u16>) -> SymtabBuilder {
    let mut b = SymtabBuilder {
        sink: ByteSink::new(module.class, module.endian),
        strtab: StringTable::new(),
        count: 1,
        first_global: 0,
        by_resolve: HashMap::new(),
        by_local: HashMap::new(),
    };
    crate::elf::write::write_sym(&mut b.sink, &elf::ElfSym::default());
    // section symbols first, then named locals
    let mut ordered: Vec<(&SectionId, &u16)> = order.iter().collect();
    ordered.sort_by_key(|&(_, &ndx)| ndx);
    for (&sid, &ndx) in ordered {
        let section = &module.sections[sid];
        if !section.is_alloc() {
            continue;
        }
        crate::elf::write::write_sym(
            &mut b.sink,
            &elf::ElfSym {
                name: 0,
                value: section.out.as_ref().map(|o| o.addr).unwrap_or(0),
                size: 0,
                info: elf::ElfSym::make_info(elf::STB_LOCAL, elf::STT_SECTION),
                other: 0,
                shndx: ndx,
            },
        );
        b.count += 1;
    }
    for id in module.pool.symbol_ids() {
        let sym = module.pool.symbol(id);
        if sym.binding != SymbolBinding::Local || sym.name.is_empty() {
            continue;
        }
        if sym.ty == crate::symbol::SymbolType::Section
            || sym.ty == crate::symbol::SymbolType::File
        {
            continue;
        }
        if !module.symbol_section_live(id) {
            continue;
        }
        let name = b.strtab.add(&sym.name);
        crate::elf::write::write_sym(
            &mut b.sink,
            &elf::ElfSym {
                name,
                value: module.symbol_value(id),
                size: sym.size,
                info: elf::ElfSym::make_info(elf::STB_LOCAL, sym.ty.to_elf()),
                other: sym.visibility.to_elf(),
                shndx: sym
                    .special_shndx
                    .unwrap_or_else(|| shndx_of(module, sym.section, order)),
            },
        );
        b.by_local.insert(id, b.count);
        b.count += 1;
    }
    b.first_global = b.count;
    for (rid, info) in module.pool.infos() {
        if info.binding == SymbolBinding::Local {
            continue;
        }
        let Some(out) = info.out_symbol else {
            continue;
        };
        if info.is_defined() && !module.symbol_section_live(out) {
            continue;
        }
        if info.from_dynamic && !info.referenced {
            continue;
        }
        let out_sym = module.pool.symbol(out);
        let binding = if info.forced_local {
            elf::STB_LOCAL
        } else {
            info.binding.to_elf()
        };
        let (value, shndx) = if !info.is_defined() || info.from_dynamic {
            (0, elf::SHN_UNDEF)
        } else if out_sym.special_shndx == Some(elf::SHN_ABS) {
            (module.resolve_value(rid), elf::SHN_ABS)
        } else {
            (
                module.resolve_value(rid),
                shndx_of(module, out_sym.section, order),
            )
        };
        let name = b.strtab.add(&info.name);
        crate::elf::write::write_sym(
            &mut b.sink,
            &elf::ElfSym {
                name,
                value,
                size: info.size,
                info: elf::ElfSym::make_info(binding, info.ty.to_elf()),
                other: info.visibility.to_elf(),
                shndx,
            },
        );
        b.by_resolve.insert(rid, b.count);
        b.count += 1;
    }
    b
}

fn fill_bytes(value: u64) -> Vec<u8> {
    if value == 0 {
        return Vec::new();
    }
    let bytes = if value <= 0xff {
        1
    } else if value <= 0xffff {
        2
    } else {
        4
    };
    value.to_be_bytes()[8 - bytes..].to_vec()
}

/// The entry-point address for the header.
fn entry_address(module: &Module) -> u64 {
    if matches!(module.config.kind, OutputKind::Relocatable) {
        return 0;
    }
    if let Some(entry) = &module.entry_name {
        if let Some(id) = module.pool.find_id(entry) {
            if module.pool.info(id).is_defined() {
                return module.resolve_value(id);
            }
        }
        // fall back to the first executable section
        if let Some((_, section)) = module
            .sections
            .iter()
            .find(|(_, s)| s.output_section.is_none() && s.out.is_some() && s.is_exec())
        {
            module.raise(DiagnosticEntry::warning(
                DiagId::PLAIN,
                vec![format!(
                    "cannot find entry symbol {entry}; defaulting to start of `{}'",
                    section.name
                )],
            ));
            return section.out.as_ref().map(|o| o.addr).unwrap_or(0);
        }
    }
    0
}

/// Assemble the image.
pub fn run(module: &mut Module, target: &dyn TargetInfo) -> Result<Vec<u8>> {
    dynamic::finalize(module, target);
    let class = module.class;
    let endian = module.endian;
    let relocatable = module.config.kind == OutputKind::Relocatable;
    let sections = output_sections(module);
    let mut order: HashMap<SectionId, u16> = HashMap::new();
    for (i, &sid) in sections.iter().enumerate() {
        order.insert(sid, (i + 1) as u16);
    }
    let symtab = build_symtab(module, &order);
    // relocatable outputs keep their relocations
    let rela_sections: Vec<(SectionId, Vec<u8>)> = if relocatable {
        build_rela_sections(module, &sections, &symtab)
    } else {
        Vec::new()
    };
    // tail layout: content end, then symtab/strtab/shstrtab, then shdrs
    let mut tail = sections
        .iter()
        .map(|&sid| {
            let s = &module.sections[sid];
            let out = s.out.as_ref().map(|o| o.offset).unwrap_or(0);
            if s.sh_type == elf::SHT_NOBITS {
                out
            } else {
                out + s.size
            }
        })
        .max()
        .unwrap_or(module.sizeof_headers());
    let mut shstrtab = StringTable::new();
    for &sid in &sections {
        shstrtab.add(&module.sections[sid].name.clone());
    }
    let rela_names: Vec<String> = rela_sections
        .iter()
        .map(|(sid, _)| format!(".rela{}", module.sections[*sid].name))
        .collect();
    for name in &rela_names {
        shstrtab.add(name);
    }
    shstrtab.add(".symtab");
    shstrtab.add(".strtab");
    shstrtab.add(".shstrtab");
    let word = class.word_size();
    tail = align_up(tail, word);
    let symtab_off = tail;
    let symtab_len = symtab.sink.len();
    tail += symtab_len;
    let strtab_off = tail;
    let strtab_len = symtab.strtab.len();
    tail += strtab_len;
    let mut rela_offsets: Vec<u64> = Vec::new();
    for (_, bytes) in &rela_sections {
        tail = align_up(tail, word);
        rela_offsets.push(tail);
        tail += bytes.len() as u64;
    }
    let shstrtab_off = tail;
    tail += shstrtab.len();
    let shoff = align_up(tail, word);
    let shnum = 1 + sections.len() + rela_sections.len() + 3;
    let image_len = shoff + shnum as u64 * class.shdr_size();

    let mut image = vec![0u8; image_len as usize];
    // section contents
    for &sid in &sections {
        emit_section_contents(module, sid, &mut image);
    }
    // symtab / strtab / shstrtab / rela bodies
    image[symtab_off as usize..(symtab_off + symtab_len) as usize]
        .copy_from_slice(symtab.sink.as_slice());
    image[strtab_off as usize..(strtab_off + strtab_len) as usize]
        .copy_from_slice(symtab.strtab.bytes());
    for ((_, bytes), &off) in rela_sections.iter().zip(&rela_offsets) {
        image[off as usize..off as usize + bytes.len()].copy_from_slice(bytes);
    }
    image[shstrtab_off as usize..(shstrtab_off + shstrtab.len()) as usize]
        .copy_from_slice(shstrtab.bytes());
    // section headers
    let mut shdr_sink = ByteSink::new(class, endian);
    crate::elf::write::write_shdr(&mut shdr_sink, &elf::SectionHeader::default());
    let symtab_ndx = (1 + sections.len() + rela_sections.len()) as u32;
    for &sid in &sections {
        let link_name = match module.sections[sid].sh_type {
            elf::SHT_DYNSYM | elf::SHT_DYNAMIC => Some(".dynstr"),
            elf::SHT_HASH | elf::SHT_RELA => Some(".dynsym"),
            _ => None,
        };
        let link = link_name
            .and_then(|want| {
                sections
                    .iter()
                    .position(|&x| module.sections[x].name == want)
            })
            .map(|i| i as u32 + 1)
            .unwrap_or(0);
        let name = shstrtab.add(&module.sections[sid].name.clone());
        let s = &module.sections[sid];
        let out = s.out.as_ref();
        crate::elf::write::write_shdr(
            &mut shdr_sink,
            &elf::SectionHeader {
                name,
                sh_type: if relocatable && s.sh_type == elf::SHT_NOBITS {
                    elf::SHT_NOBITS
                } else {
                    s.sh_type
                },
                flags: s.flags.bits(),
                addr: if relocatable {
                    0
                } else {
                    out.map(|o| o.addr).unwrap_or(0)
                },
                offset: out.map(|o| o.offset).unwrap_or(0),
                size: s.size,
                link,
                info: if s.sh_type == elf::SHT_DYNSYM { 1 } else { 0 },
                addralign: s.align,
                entsize: s.entsize,
            },
        );
    }
    for (i, (sid, bytes)) in rela_sections.iter().enumerate() {
        let target_ndx = order.get(sid).copied().unwrap_or(0);
        crate::elf::write::write_shdr(
            &mut shdr_sink,
            &elf::SectionHeader {
                name: shstrtab.add(&rela_names[i]),
                sh_type: elf::SHT_RELA,
                flags: 0,
                addr: 0,
                offset: rela_offsets[i],
                size: bytes.len() as u64,
                link: symtab_ndx,
                info: u32::from(target_ndx),
                addralign: word,
                entsize: class.rela_size(),
            },
        );
    }
    crate::elf::write::write_shdr(
        &mut shdr_sink,
        &elf::SectionHeader {
            name: shstrtab.add(".symtab"),
            sh_type: elf::SHT_SYMTAB,
            flags: 0,
            addr: 0,
            offset: symtab_off,
            size: symtab_len,
            link: symtab_ndx + 1,
            info: symtab.first_global,
            addralign: word,
            entsize: class.sym_size(),
        },
    );
    crate::elf::write::write_shdr(
        &mut shdr_sink,
        &elf::SectionHeader {
            name: shstrtab.add(".strtab"),
            sh_type: elf::SHT_STRTAB,
            flags: 0,
            addr: 0,
            offset: strtab_off,
            size: strtab_len,
            link: 0,
            info: 0,
            addralign: 1,
            entsize: 0,
        },
    );
    crate::elf::write::write_shdr(
        &mut shdr_sink,
        &elf::SectionHeader {
            name: shstrtab.add(".shstrtab"),
            sh_type: elf::SHT_STRTAB,
            flags: 0,
            addr: 0,
            offset: shstrtab_off,
            size: shstrtab.len(),
            link: 0,
            info: 0,
            addralign: 1,
            entsize: 0,
        },
    );
    image[shoff as usize..shoff as usize + shdr_sink.len() as usize]
        .copy_from_slice(shdr_sink.as_slice());
    // program headers
    if !relocatable && !module.segments.is_empty() {
        let mut psink = ByteSink::new(class, endian);
        for seg in &module.segments {
            crate::elf::write::write_phdr(
                &mut psink,
                &elf::ElfPhdr {
                    p_type: seg.p_type,
                    flags: seg.flags.bits(),
                    offset: seg.offset,
                    vaddr: seg.vaddr,
                    paddr: seg.paddr,
                    filesz: seg.filesz,
                    memsz: seg.memsz,
                    align: seg.align,
                },
            );
        }
        let phoff = class.ehdr_size() as usize;
        image[phoff..phoff + psink.len() as usize].copy_from_slice(psink.as_slice());
    }
    // the file header
    let e_type = match module.config.kind {
        OutputKind::Exec => elf::ET_EXEC,
        OutputKind::Pie | OutputKind::Dyn => elf::ET_DYN,
        OutputKind::Relocatable => elf::ET_REL,
    };
    let mut esink = ByteSink::new(class, endian);
    crate::elf::write::write_ehdr(
        &mut esink,
        &elf::ElfHeader {
            class,
            endian,
            os_abi: 0,
            e_type,
            machine: module.machine,
            entry: entry_address(module),
            phoff: if module.segments.is_empty() || relocatable {
                0
            } else {
                class.ehdr_size()
            },
            shoff,
            flags: module.e_flags,
            phnum: if relocatable {
                0
            } else {
                module.segments.len() as u16
            },
            shnum: shnum as u16,
            shstrndx: (shnum - 1) as u16,
        },
    );
    image[..esink.len() as usize].copy_from_slice(esink.as_slice());
    patch_build_id(module, &mut image);
    Ok(image)
}

fn emit_section_contents(module: &Module, sid: SectionId, image: &mut [u8]) {
    let section = &module.sections[sid];
    if section.sh_type == elf::SHT_NOBITS {
        return;
    }
    let Some(out) = section.out.as_ref() else {
        return;
    };
    let base = out.offset as usize;
    let size = section.size as usize;
    if base + size > image.len() {
        return;
    }
    // pre-fill the section range with its fill pattern
    let fill = out.fill;
    if let Some(pattern) = fill {
        let bytes = fill_bytes(pattern);
        if !bytes.is_empty() {
            for (i, slot) in image[base..base + size].iter_mut().enumerate() {
                *slot = bytes[i % bytes.len()];
            }
        }
    }
    for &frag_id in &section.fragments {
        let frag = &module.fragments[frag_id];
        let offset = frag.offset_or_zero() as usize;
        let fsize = frag.size() as usize;
        if fsize == 0 || base + offset + fsize > image.len() {
            continue;
        }
        frag.emit(
            &mut image[base + offset..base + offset + fsize],
            module.endian,
            module.class,
        );
    }
    // content placed from input sections lives in re-homed fragments
    for (_, other) in module.sections.iter() {
        if other.output_section != Some(sid) || other.is_discarded() || !other.live {
            continue;
        }
        for &frag_id in &other.fragments {
            let frag = &module.fragments[frag_id];
            if frag.owner != sid {
                continue;
            }
            let offset = frag.offset_or_zero() as usize;
            let fsize = frag.size() as usize;
            if fsize == 0 || base + offset + fsize > image.len() {
                continue;
            }
            frag.emit(
                &mut image[base + offset..base + offset + fsize],
                module.endian,
                module.class,
            );
        }
    }
}

/// Hash the image and patch the digest into the build-id note.
fn patch_build_id(module: &Module, image: &mut [u8]) {
    let Some((_, note)) = module.sections.iter().find(|(_, s)| {
        s.name == ".note.gnu.build-id" && s.output_section.is_none() && s.out.is_some()
    }) else {
        return;
    };
    let Some(out) = note.out.as_ref() else {
        return;
    };
    // name header is 16 bytes: namesz, descsz, type, "GNU\0"
    let desc_off = out.offset as usize + 16;
    if desc_off + 20 > image.len() {
        return;
    }
    let digest = Sha1::digest(image);
    image[desc_off..desc_off + 20].copy_from_slice(&digest);
}

/// Regenerate `.rela.*` bodies for `-r` output.
fn build_rela_sections(
    module: &Module,
    sections: &[SectionId],
    symtab: &SymtabBuilder,
) -> Vec<(SectionId, Vec<u8>)> {
    let mut out = Vec::new();
    for &out_sid in sections {
        let mut sink = ByteSink::new(module.class, module.endian);
        for (_, input_section) in module.sections.iter() {
            if input_section.output_section != Some(out_sid) || !input_section.live {
                continue;
            }
            for &rid in &input_section.relocs {
                let reloc = &module.relocs[rid];
                let sym = module.pool.symbol(reloc.symbol);
                let index = match sym.resolve {
                    Some(resolve) => symtab.by_resolve.get(&resolve).copied().unwrap_or(0),
                    None => symtab.by_local.get(&reloc.symbol).copied().unwrap_or(0),
                };
                let offset = module.fragments[reloc.target.frag].offset_or_zero()
                    + reloc.target.offset;
                crate::elf::write::write_rela(
                    &mut sink,
                    offset,
                    index,
                    reloc.rtype,
                    reloc.addend,
                );
            }
        }
        if !sink.is_empty() {
            out.push((out_sid, sink.into_bytes()));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_bytes_width() {
        assert_eq!(fill_bytes(0x90), vec![0x90]);
        assert_eq!(fill_bytes(0x9090), vec![0x90, 0x90]);
        assert_eq!(fill_bytes(0xdeadbeef), vec![0xde, 0xad, 0xbe, 0xef]);
        assert!(fill_bytes(0).is_empty());
    }
}

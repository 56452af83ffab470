//! Program-header construction: explicit `PHDRS` assignment or synthesis
//! by grouping contiguous allocated sections of compatible permissions.

use crate::diag::{DiagId, DiagnosticEntry, Result};
use crate::elf::{self, SegmentFlags};
use crate::module::{Module, OutputSegment};
use crate::script::expr::EvalContext;
use crate::section::SectionId;

/// Allocated output sections in address order.
fn alloc_sections(module: &Module) -> Vec<SectionId> {
    let mut out: Vec<SectionId> = module
        .sections
        .iter()
        .filter(|(_, s)| {
            s.output_section.is_none()
                && s.out.is_some()
                && s.is_alloc()
                && s.sh_type != elf::SHT_NULL
        })
        .map(|(sid, _)| sid)
        .collect();
    out.sort_by_key(|&sid| module.sections[sid].out.as_ref().map(|o| o.addr).unwrap_or(0));
    out
}

/// Build `module.segments` from scratch.
pub fn build_segments(module: &mut Module) -> Result<()> {
    module.segments.clear();
    if module.script.has_phdrs_cmd {
        build_from_script(module)?;
    } else {
        synthesize_loads(module);
    }
    add_implicit_segments(module);
    compute_extents(module);
    validate_load_permissions(module)?;
    Ok(())
}

fn build_from_script(module: &mut Module) -> Result<()> {
    let specs = module.script.phdr_specs.clone();
    let mut by_name: std::collections::HashMap<String, usize> = Default::default();
    for spec in &specs {
        let mut segment = OutputSegment::new(spec.p_type);
        segment.name = Some(spec.name.clone());
        segment.has_filehdr = spec.filehdr;
        segment.has_phdrs = spec.phdrs;
        if let Some(flags_expr) = &spec.flags {
            let ctx = EvalContext::outside(module);
            let flags = flags_expr.eval(&ctx)?;
            segment.flags = SegmentFlags::from_bits_truncate(flags as u32);
        }
        if let Some(at) = &spec.at {
            let ctx = EvalContext::outside(module);
            segment.paddr = at.eval(&ctx)?;
        }
        by_name.insert(spec.name.clone(), module.segments.len());
        module.segments.push(segment);
    }
    // sections claim their declared segments; an unnamed section inherits
    // the previous section's assignment
    let sections = alloc_sections(module);
    let mut inherited: Vec<usize> = Vec::new();
    for sid in sections {
        let entry_phdrs: Vec<String> = module
            .section_map
            .entries
            .iter()
            .find(|e| e.section == sid)
            .map(|e| e.desc.phdrs.clone())
            .unwrap_or_default();
        let targets: Vec<usize> = if entry_phdrs.is_empty() {
            inherited.clone()
        } else {
            let mut resolved = Vec::new();
            for name in &entry_phdrs {
                match by_name.get(name) {
                    Some(&idx) => resolved.push(idx),
                    None => {
                        return Err(DiagnosticEntry::error(
                            DiagId::ERROR_DUPLICATE_OUTPUT_SECTION_PHDR,
                            vec![module.sections[sid].name.clone(), name.clone()],
                        ));
                    }
                }
            }
            resolved
        };
        for &seg in &targets {
            module.segments[seg].sections.push(sid);
            let flags = module.sections[sid].segment_flags();
            if module.script.phdr_specs[seg].flags.is_none() {
                module.segments[seg].flags |= flags;
            }
        }
        if let Some(out) = module.sections[sid].out.as_mut() {
            out.phdrs = targets.clone();
        }
        inherited = targets;
    }
    Ok(())
}

/// Group contiguous allocated sections of identical permissions into
/// `PT_LOAD` segments.
fn synthesize_loads(module: &mut Module) {
    let sections = alloc_sections(module);
    let mut current: Option<usize> = None;
    let mut current_flags = SegmentFlags::empty();
    for sid in sections {
        let flags = module.sections[sid].segment_flags();
        let tbss = module.sections[sid].is_tbss();
        let start_new = match current {
            None => true,
            Some(_) => flags != current_flags && !tbss,
        };
        if start_new {
            let mut segment = OutputSegment::new(elf::PT_LOAD);
            segment.flags = flags;
            segment.align = module.max_page_size();
            // the first load carries the file and program headers
            if module.segments.is_empty() && module.headers_loaded {
                segment.has_filehdr = true;
                segment.has_phdrs = true;
            }
            current = Some(module.segments.len());
            current_flags = flags;
            module.segments.push(segment);
        }
        if let Some(seg) = current {
            module.segments[seg].sections.push(sid);
            if let Some(out) = module.sections[sid].out.as_mut() {
                out.phdrs = vec![seg];
            }
        }
    }
}

fn add_implicit_segments(module: &mut Module) {
    let dynamic = module.is_dynamic_link();
    // PT_PHDR when the headers are mapped
    let headers_mapped = module.segments.iter().any(|s| s.has_phdrs);
    if headers_mapped && dynamic && !module.script.has_phdrs_cmd {
        let mut phdr = OutputSegment::new(elf::PT_PHDR);
        phdr.flags = SegmentFlags::R;
        module.segments.insert(0, phdr);
    }
    // PT_INTERP
    if let Some(interp) = section_named(module, ".interp") {
        let mut seg = OutputSegment::new(elf::PT_INTERP);
        seg.flags = SegmentFlags::R;
        seg.sections.push(interp);
        module.segments.push(seg);
    }
    // PT_DYNAMIC
    if let Some(dyn_sid) = section_named(module, ".dynamic") {
        let mut seg = OutputSegment::new(elf::PT_DYNAMIC);
        seg.flags = SegmentFlags::R | SegmentFlags::W;
        seg.sections.push(dyn_sid);
        module.segments.push(seg);
    }
    // PT_TLS spans the TLS template
    let tls: Vec<SectionId> = alloc_sections(module)
        .into_iter()
        .filter(|&sid| module.sections[sid].is_tls())
        .collect();
    if !tls.is_empty() {
        let mut seg = OutputSegment::new(elf::PT_TLS);
        seg.flags = SegmentFlags::R;
        seg.sections = tls;
        module.segments.push(seg);
    }
    // PT_GNU_RELRO over the relro range
    if module.config.z_relro && dynamic {
        let relro: Vec<SectionId> = alloc_sections(module)
            .into_iter()
            .filter(|&sid| {
                matches!(
                    module.sections[sid].name.as_str(),
                    ".data.rel.ro" | ".dynamic" | ".got"
                )
            })
            .collect();
        if !relro.is_empty() {
            let mut seg = OutputSegment::new(elf::PT_GNU_RELRO);
            seg.flags = SegmentFlags::R;
            seg.sections = relro;
            module.segments.push(seg);
        }
    }
    // PT_GNU_STACK records the stack policy
    if !module.script.has_phdrs_cmd {
        let mut stack = OutputSegment::new(elf::PT_GNU_STACK);
        stack.flags = if module.config.z_execstack {
            SegmentFlags::R | SegmentFlags::W | SegmentFlags::X
        } else {
            SegmentFlags::R | SegmentFlags::W
        };
        stack.align = 0;
        module.segments.push(stack);
    }
}

fn section_named(module: &Module, name: &str) -> Option<SectionId> {
    module
        .sections
        .iter()
        .find(|(_, s)| {
            s.name == name
                && s.output_section.is_none()
                && s.out.is_some()
                && s.is_alloc()
                && s.size > 0
        })
        .map(|(sid, _)| sid)
}

fn compute_extents(module: &mut Module) {
    let headers = module.sizeof_headers();
    let base = module.image_base();
    let max_page_size = module.max_page_size();
    for seg in &mut module.segments {
        let mut vaddr = u64::MAX;
        let mut paddr = u64::MAX;
        let mut offset = u64::MAX;
        let mut end_file = 0u64;
        let mut end_mem = 0u64;
        let mut align = seg.align.max(1);
        if seg.has_filehdr || seg.has_phdrs || seg.p_type == elf::PT_PHDR {
            let hdr_off = if seg.p_type == elf::PT_PHDR {
                module.class.ehdr_size()
            } else {
                0
            };
            let hdr_len = if seg.p_type == elf::PT_PHDR {
                headers - module.class.ehdr_size()
            } else {
                headers
            };
            vaddr = base + hdr_off;
            paddr = base + hdr_off;
            offset = hdr_off;
            end_file = hdr_off + hdr_len;
            end_mem = hdr_off + hdr_len;
        }
        for &sid in &seg.sections {
            let section = &module.sections[sid];
            let Some(out) = section.out.as_ref() else {
                continue;
            };
            vaddr = vaddr.min(out.addr);
            paddr = paddr.min(out.lma);
            offset = offset.min(out.offset);
            align = align.max(section.align);
            let file_size = if section.sh_type == elf::SHT_NOBITS {
                0
            } else {
                section.size
            };
            end_file = end_file.max(out.offset + file_size);
            end_mem = end_mem.max(out.addr + section.size);
        }
        if vaddr == u64::MAX {
            vaddr = 0;
            paddr = if seg.paddr != 0 { seg.paddr } else { 0 };
            offset = 0;
        }
        seg.vaddr = vaddr;
        if seg.paddr == 0 {
            seg.paddr = paddr;
        }
        seg.offset = offset;
        seg.filesz = end_file.saturating_sub(offset);
        // memsz is measured from the segment's vaddr
        seg.memsz = end_mem.saturating_sub(vaddr);
        if seg.p_type == elf::PT_LOAD {
            seg.align = align.max(max_page_size);
        }
    }
}

fn validate_load_permissions(module: &Module) -> Result<()> {
    for seg in &module.segments {
        if seg.p_type != elf::PT_LOAD {
            continue;
        }
        for &sid in &seg.sections {
            let flags = module.sections[sid].segment_flags();
            if !seg.flags.contains(flags) {
                return Err(DiagnosticEntry::error(
                    DiagId::ERROR_SEGMENT_PERMISSION_MISMATCH,
                    vec![seg
                        .name
                        .clone()
                        .unwrap_or_else(|| format!("PT_LOAD #{}", seg.p_type))],
                ));
            }
        }
    }
    Ok(())
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LinkConfig;
    use crate::elf::SectionFlags;
    use crate::fragment::FragmentKind;
    use crate::input::{InputFile, InputKind};
    use crate::object::section_map::build_and_match;
    use crate::section::{Section, SectionKind};

    fn laid_out_module(specs: &[(&str, SectionFlags, u64)]) -> Module {
        let mut module = Module::new(LinkConfig::builder().build());
        let input = module
            .inputs
            .alloc(InputFile::new("a.o", InputKind::Object, 0));
        for &(name, flags, size) in specs {
            let mut s = Section::new(name, SectionKind::Regular, input);
            s.flags = SectionFlags::ALLOC | flags;
            s.live = true;
            let sid = module.sections.alloc(s);
            module.inputs[input].sections.push(sid);
            module.append_fragment(
                sid,
                4,
                FragmentKind::Region {
                    data: vec![0u8; size as usize],
                },
            );
        }
        build_and_match(&mut module);
        crate::layout::assign_addresses(&mut module).unwrap();
        module
    }

    #[test]
    fn test_loads_grouped_by_permission() {
        let module = laid_out_module(&[
            (".text", SectionFlags::EXECINSTR, 0x100),
            (".rodata", SectionFlags::empty(), 0x40),
            (".data", SectionFlags::WRITE, 0x40),
        ]);
        let loads: Vec<&OutputSegment> = module
            .segments
            .iter()
            .filter(|s| s.p_type == elf::PT_LOAD)
            .collect();
        assert_eq!(loads.len(), 3);
        assert_eq!(loads[0].flags, SegmentFlags::R | SegmentFlags::X);
        assert_eq!(loads[1].flags, SegmentFlags::R);
        assert_eq!(loads[2].flags, SegmentFlags::R | SegmentFlags::W);
        // the first load maps the headers from the image base
        assert!(loads[0].has_filehdr);
        assert_eq!(loads[0].offset, 0);
        assert_eq!(loads[0].vaddr, module.image_base());
    }

    #[test]
    fn test_gnu_stack_present() {
        let module = laid_out_module(&[(".text", SectionFlags::EXECINSTR, 8)]);
        let stack = module
            .segments
            .iter()
            .find(|s| s.p_type == elf::PT_GNU_STACK)
            .unwrap();
        assert_eq!(stack.flags, SegmentFlags::R | SegmentFlags::W);
    }

    #[test]
    fn test_single_load_for_one_perm_class() {
        let module = laid_out_module(&[
            (".text", SectionFlags::EXECINSTR, 8),
            (".text.hot", SectionFlags::EXECINSTR, 8),
        ]);
        let loads = module
            .segments
            .iter()
            .filter(|s| s.p_type == elf::PT_LOAD)
            .count();
        assert_eq!(loads, 1);
    }
}

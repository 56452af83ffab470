//! Layout: address assignment, assignment commits, file offsets and
//! program headers.
//!
//! The sweep walks `SECTIONS` in source order (or the default order when
//! no script shaped the output), advancing the location counter through
//! output sections, committing assignments at the level the script placed
//! them, tracking memory-region cursors and diverging LMA from VMA where
//! `AT` asks for it. Relaxation re-runs the whole sweep until a fixed
//! point.

use crate::diag::{DiagId, DiagnosticEntry, DiagnosticKind, Result};
use crate::elf::{self, SectionFlags};
use crate::fragment::{DataWidth, FragmentKind};
use crate::input::InternalInputKind;
use crate::module::Module;
use crate::object::section_map::SectionMap;
use crate::script::expr::EvalContext;
use crate::script::{
    AssignKind, AssignOp, Assignment, OutputSectCommand, OutputSectDesc, OutputSectType,
    SectionsCommand,
};
use crate::section::{OutputBinding, SectionId, SectionKind};
use crate::support::align_up;
use std::collections::HashMap;

pub mod phdr;
pub mod relax;

/// Runtime cursor of one memory region during a sweep.
#[derive(Debug, Clone)]
struct RegionCursor {
    origin: u64,
    length: u64,
    cursor: u64,
    first_exceeded: Option<SectionId>,
    sections: Vec<SectionId>,
}

#[derive(Default)]
struct Sweep {
    regions: HashMap<String, RegionCursor>,
    lma_delta: u64,
}

impl Sweep {
    fn region<'a>(
        &'a mut self,
        module: &Module,
        map: &SectionMap,
        name: &str,
        context: &str,
    ) -> Result<&'a mut RegionCursor> {
        // resolve aliases through the script state
        let Some(region) = module.script.find_region(name) else {
            return Err(DiagnosticEntry::fatal(
                DiagId::ERROR_UNDEFINED_MEMORY_REGION,
                vec![context.to_string(), name.to_string()],
            ));
        };
        let key = region.name.clone();
        if !self.regions.contains_key(&key) {
            let ctx = EvalContext {
                module,
                dot: None,
                map: Some(map),
            };
            let origin = region.origin.eval(&ctx)?;
            let length = region.length.eval(&ctx)?;
            self.regions.insert(
                key.clone(),
                RegionCursor {
                    origin,
                    length,
                    cursor: origin,
                    first_exceeded: None,
                    sections: Vec::new(),
                },
            );
        }
        Ok(self
            .regions
            .get_mut(&key)
            .unwrap_or_else(|| unreachable!("region inserted above")))
    }
}

/// Ordering rank for output sections when no `SECTIONS` command shapes
/// the image.
fn default_rank(module: &Module, sid: SectionId) -> u32 {
    let section = &module.sections[sid];
    let name = section.name.as_str();
    if name == ".interp" {
        return 0;
    }
    if section.kind == SectionKind::Note || name.starts_with(".note") {
        return 1;
    }
    if !section.is_alloc() {
        return 100;
    }
    if section.is_exec() {
        return 10;
    }
    if !section.is_writable() {
        return match name {
            ".rodata" => 20,
            ".eh_frame" => 25,
            _ => 22,
        };
    }
    if section.is_tls() {
        return if section.is_nobits() { 31 } else { 30 };
    }
    match name {
        ".init_array" | ".fini_array" | ".preinit_array" | ".ctors" | ".dtors" => 35,
        ".data.rel.ro" => 36,
        ".dynamic" => 37,
        ".got" => 38,
        ".got.plt" => 39,
        ".sdata" => 42,
        _ => {
            if section.is_nobits() {
                50
            } else {
                41
            }
        }
    }
}

/// Commit one assignment at the current location and define its symbol.
fn commit_assignment(
    module: &mut Module,
    map: &SectionMap,
    assignment: &mut Assignment,
    dot: Option<u64>,
) -> Result<Option<u64>> {
    let provide = matches!(
        assignment.kind,
        AssignKind::Provide | AssignKind::ProvideHidden
    );
    if provide && !assignment.is_dot() {
        let skip = match module.pool.find(&assignment.symbol) {
            Some(info) => info.is_defined() || !info.referenced,
            None => true,
        };
        if skip {
            return Ok(None);
        }
    }
    let value = {
        let ctx = EvalContext {
            module,
            dot,
            map: Some(map),
        };
        assignment.expr.commit(&ctx)?
    };
    let value = if assignment.op == AssignOp::Set {
        value
    } else {
        let current = if assignment.is_dot() {
            dot.unwrap_or(0)
        } else {
            module
                .pool
                .find_id(&assignment.symbol)
                .map(|id| module.resolve_value(id))
                .unwrap_or(0)
        };
        match assignment.op {
            AssignOp::Set => value,
            AssignOp::Add => current.wrapping_add(value),
            AssignOp::Sub => current.wrapping_sub(value),
            AssignOp::Mul => current.wrapping_mul(value),
            AssignOp::Div => {
                if value == 0 {
                    return Err(DiagnosticEntry::fatal(
                        DiagId::ERROR_DIVISION_BY_ZERO,
                        vec![assignment.symbol.clone()],
                    ));
                }
                current / value
            }
            AssignOp::Shl => current.wrapping_shl(value as u32),
            AssignOp::Shr => current.wrapping_shr(value as u32),
            AssignOp::And => current & value,
            AssignOp::Or => current | value,
        }
    };
    if assignment.is_dot() {
        return Ok(Some(value));
    }
    let hidden = matches!(
        assignment.kind,
        AssignKind::ProvideHidden | AssignKind::Hidden
    );
    let owner = module.internal_input(InternalInputKind::Script);
    module.pool.define_absolute(owner, &assignment.symbol, value, hidden);
    Ok(None)
}

/// Run the full sweep: addresses, assignment commits, file offsets and
/// segments.
pub fn assign_addresses(module: &mut Module) -> Result<()> {
    // reset from any previous iteration; script-data fragments are
    // recreated by the sweep
    for sid in module.sections.indices().collect::<Vec<_>>() {
        module.sections[sid].out = None;
        let stale: Vec<bool> = module.sections[sid]
            .fragments
            .iter()
            .map(|&f| matches!(module.fragments[f].kind, FragmentKind::OutputData { .. }))
            .collect();
        if stale.iter().any(|&s| s) {
            let mut keep = Vec::new();
            for (i, &f) in module.sections[sid].fragments.iter().enumerate() {
                if !stale[i] {
                    keep.push(f);
                }
            }
            module.sections[sid].fragments = keep;
        }
    }
    // outside-SECTIONS assignments commit first, in source order
    let mut outside = std::mem::take(&mut module.script.outside_assignments);
    let map_placeholder = std::mem::take(&mut module.section_map);
    let mut result = sweep(module, &map_placeholder, &mut outside);
    module.section_map = map_placeholder;
    module.script.outside_assignments = outside;
    if result.is_ok() {
        result = finish(module);
    }
    result
}

fn sweep(
    module: &mut Module,
    map: &SectionMap,
    outside: &mut [Assignment],
) -> Result<()> {
    for assignment in outside.iter_mut() {
        commit_assignment(module, map, assignment, None)?;
    }
    let mut commands = std::mem::take(&mut module.script.sections_commands);
    let mut state = Sweep::default();
    let mut laid_out: Vec<bool> = vec![false; map.entries.len()];
    let mut dot = if module.script.has_sections_cmd {
        0
    } else {
        module.headers_loaded = true;
        module.image_base() + module.sizeof_headers()
    };
    let mut commands_result: Result<()> = Ok(());
    if module.script.has_sections_cmd {
        for cmd in commands.iter_mut() {
            let step = step_command(module, map, cmd, &mut state, &mut laid_out, dot);
            match step {
                Ok(new_dot) => dot = new_dot,
                Err(e) => {
                    commands_result = Err(e);
                    break;
                }
            }
        }
    }
    // entries no script command placed (orphans, default map, internal
    // synthesized sections), in default order
    if commands_result.is_ok() {
        let mut rest: Vec<usize> = (0..map.entries.len())
            .filter(|&i| !laid_out[i])
            .collect();
        rest.sort_by_key(|&i| {
            (
                default_rank(module, map.entries[i].section),
                map.entries[i].order,
            )
        });
        for idx in rest {
            match layout_output_section(module, map, idx, None, &mut state, dot) {
                Ok(new_dot) => dot = new_dot,
                Err(e) => {
                    commands_result = Err(e);
                    break;
                }
            }
        }
    }
    module.script.sections_commands = commands;
    // write region runtime state back and verify limits
    for (name, cursor) in state.regions {
        if let Some(region) = module.script.find_region_mut(&name) {
            region.cursor = Some(cursor.cursor);
            region.output_sections = cursor.sections.clone();
            region.first_exceeded = cursor.first_exceeded;
        }
        if let Some(offender) = cursor.first_exceeded {
            module.raise(DiagnosticEntry::fatal(
                DiagId::ERROR_MEMORY_REGION_EXCEEDED_LIMIT,
                vec![name.clone(), module.sections[offender].name.clone()],
            ));
        } else {
            if cursor.cursor == cursor.origin {
                module.raise(DiagnosticEntry::warning(
                    DiagId::WARN_MEMORY_REGION_ZERO_SIZED,
                    vec![name.clone()],
                ));
            }
            module.raise(DiagnosticEntry::new(
                DiagId::VERBOSE_VERIFIED_MEMORY_REGION,
                DiagnosticKind::Verbose,
                vec![name],
            ));
        }
    }
    commands_result
}

fn step_command(
    module: &mut Module,
    map: &SectionMap,
    cmd: &mut SectionsCommand,
    state: &mut Sweep,
    laid_out: &mut [bool],
    dot: u64,
) -> Result<u64> {
    match cmd {
        SectionsCommand::Assignment(assignment) => {
            match commit_assignment(module, map, assignment, Some(dot))? {
                Some(new_dot) => Ok(new_dot),
                None => Ok(dot),
            }
        }
        SectionsCommand::Assert(expr) => {
            let ctx = EvalContext {
                module,
                dot: Some(dot),
                map: Some(map),
            };
            expr.commit(&ctx)?;
            Ok(dot)
        }
        SectionsCommand::Entry(symbol) => {
            if module.entry_name.is_none() {
                module.entry_name = Some(symbol.clone());
            }
            Ok(dot)
        }
        SectionsCommand::OutputSect(desc) => {
            let Some(entry_idx) = map.entry_index(&desc.name) else {
                return Ok(dot);
            };
            laid_out[entry_idx] = true;
            layout_output_section(module, map, entry_idx, Some(desc), state, dot)
        }
    }
}

/// Lay out one output section: address, content offsets, inner
/// assignments, region cursors, LMA. Returns the new location counter.
fn layout_output_section(
    module: &mut Module,
    map: &SectionMap,
    entry_idx: usize,
    desc_override: Option<&mut OutputSectDesc>,
    state: &mut Sweep,
    dot: u64,
) -> Result<u64> {
    let entry = &map.entries[entry_idx];
    let out_sid = entry.section;
    let mut cloned = entry.desc.clone();
    let desc: &mut OutputSectDesc = match desc_override {
        Some(d) => d,
        None => &mut cloned,
    };
    // matched content per body command
    let mut matched_by_command: HashMap<usize, Vec<SectionId>> = HashMap::new();
    let mut default_matched: Vec<SectionId> = Vec::new();
    for rule in &entry.rules {
        if rule.command_index == usize::MAX {
            default_matched.extend(rule.matched.iter().copied());
        } else {
            matched_by_command
                .entry(rule.command_index)
                .or_default()
                .extend(rule.matched.iter().copied());
        }
    }
    // derive identity from the content
    let mut flags = SectionFlags::empty();
    let mut content_align: u64 = 1;
    let mut all_nobits = true;
    let mut any_content = false;
    let all_matched: Vec<SectionId> = matched_by_command
        .values()
        .flatten()
        .chain(default_matched.iter())
        .copied()
        .filter(|&sid| module.sections[sid].live && !module.sections[sid].is_discarded())
        .collect();
    for &sid in &all_matched {
        let s = &module.sections[sid];
        flags |= s.flags
            & (SectionFlags::ALLOC
                | SectionFlags::WRITE
                | SectionFlags::EXECINSTR
                | SectionFlags::TLS
                | SectionFlags::MERGE
                | SectionFlags::STRINGS);
        content_align = content_align.max(s.align);
        if !s.is_nobits() {
            all_nobits = false;
        }
        any_content = true;
    }
    let has_data_cmds = desc
        .commands
        .iter()
        .any(|c| matches!(c, OutputSectCommand::Data { .. }));
    if has_data_cmds {
        all_nobits = false;
        any_content = true;
        flags |= SectionFlags::ALLOC;
    }
    if desc.sect_type == Some(OutputSectType::NoLoad) {
        all_nobits = true;
    }
    // prolog expressions
    let subalign = match &mut desc.subalign {
        Some(e) => {
            let ctx = EvalContext {
                module,
                dot: Some(dot),
                map: Some(map),
            };
            Some(e.commit(&ctx)?)
        }
        None => None,
    };
    let align = match &mut desc.align {
        Some(e) => {
            let ctx = EvalContext {
                module,
                dot: Some(dot),
                map: Some(map),
            };
            e.commit(&ctx)?.max(content_align)
        }
        None => content_align,
    };
    let alloc = flags.contains(SectionFlags::ALLOC);
    let addr = if let Some(addr_expr) = &mut desc.address {
        let ctx = EvalContext {
            module,
            dot: Some(dot),
            map: Some(map),
        };
        addr_expr.commit(&ctx)?
    } else if !alloc && any_content {
        0
    } else if let Some(region_name) = desc.region.clone() {
        let region = state.region(module, map, &region_name, &desc.name)?;
        align_up(region.cursor, align)
    } else if let Some(region_name) = pick_region_by_attrs(module, &flags) {
        desc.region = Some(region_name.clone());
        let region = state.region(module, map, &region_name, &desc.name)?;
        align_up(region.cursor, align)
    } else {
        align_up(dot, align)
    };
    // walk the body, assigning fragment offsets
    let mut cursor: u64 = 0;
    let mut fill: Option<u64> = None;
    if let Some(fill_expr) = &mut desc.fill {
        let ctx = EvalContext {
            module,
            dot: Some(dot),
            map: Some(map),
        };
        fill = Some(fill_expr.commit(&ctx)?);
    }
    for (index, cmd) in desc.commands.iter_mut().enumerate() {
        match cmd {
            OutputSectCommand::Input(_) => {
                let Some(matched) = matched_by_command.get(&index) else {
                    continue;
                };
                for &sid in matched {
                    if !module.sections[sid].live || module.sections[sid].is_discarded() {
                        continue;
                    }
                    cursor = place_input_section(module, out_sid, sid, subalign, cursor);
                }
            }
            OutputSectCommand::Assignment(assignment) => {
                match commit_assignment(module, map, assignment, Some(addr + cursor))? {
                    Some(new_dot) => {
                        if new_dot < addr + cursor {
                            return Err(DiagnosticEntry::fatal(
                                DiagId::ERROR_SCRIPT_SYNTAX,
                                vec![format!(
                                    "cannot move the location counter backwards in `{}'",
                                    desc.name
                                )],
                            ));
                        }
                        cursor = new_dot - addr;
                    }
                    None => {}
                }
            }
            OutputSectCommand::Data { width, expr } => {
                let value = {
                    let ctx = EvalContext {
                        module,
                        dot: Some(addr + cursor),
                        map: Some(map),
                    };
                    expr.commit(&ctx)?
                };
                let width: DataWidth = *width;
                let frag = module.append_fragment(
                    out_sid,
                    1,
                    FragmentKind::OutputData { width, value },
                );
                module.fragments[frag].offset = Some(cursor);
                cursor += width.size();
                // append_fragment grew size; the walk recomputes it below
                module.sections[out_sid].size = 0;
            }
            OutputSectCommand::Fill(expr) => {
                let ctx = EvalContext {
                    module,
                    dot: Some(addr + cursor),
                    map: Some(map),
                };
                fill = Some(expr.commit(&ctx)?);
            }
            OutputSectCommand::Assert(expr) => {
                let ctx = EvalContext {
                    module,
                    dot: Some(addr + cursor),
                    map: Some(map),
                };
                expr.commit(&ctx)?;
            }
            OutputSectCommand::Plugin(_) => {}
        }
    }
    for &sid in &default_matched {
        if !module.sections[sid].live || module.sections[sid].is_discarded() {
            continue;
        }
        cursor = place_input_section(module, out_sid, sid, subalign, cursor);
    }
    // LMA
    let lma = if let Some(at_expr) = &mut desc.at {
        let ctx = EvalContext {
            module,
            dot: Some(dot),
            map: Some(map),
        };
        let lma = at_expr.commit(&ctx)?;
        state.lma_delta = lma.wrapping_sub(addr);
        lma
    } else if let Some(at_region_name) = desc.at_region.clone() {
        let region = state.region(module, map, &at_region_name, &desc.name)?;
        let lma = align_up(region.cursor, align);
        state.lma_delta = lma.wrapping_sub(addr);
        lma
    } else if alloc {
        addr.wrapping_add(state.lma_delta)
    } else {
        addr
    };
    // commit the output identity
    let is_tbss = flags.contains(SectionFlags::TLS) && all_nobits;
    {
        let section = &mut module.sections[out_sid];
        section.flags = flags;
        section.align = align.max(1);
        section.size = cursor;
        section.sh_type = if !any_content && cursor == 0 {
            elf::SHT_NULL
        } else if all_nobits && any_content {
            elf::SHT_NOBITS
        } else {
            elf::SHT_PROGBITS
        };
        if desc.sect_type == Some(OutputSectType::NoLoad) {
            section.sh_type = elf::SHT_NOBITS;
        }
        section.live = true;
        section.out = Some(OutputBinding {
            addr,
            lma,
            offset: 0,
            phdrs: Vec::new(),
            shndx: 0,
            fill,
        });
    }
    // region accounting and the new location counter
    let occupied = if is_tbss { 0 } else { cursor };
    if alloc {
        if let Some(region_name) = desc.region.clone() {
            let region = state.region(module, map, &region_name, &desc.name)?;
            region.cursor = addr + occupied;
            region.sections.push(out_sid);
            if region.first_exceeded.is_none()
                && addr + occupied > region.origin + region.length
            {
                region.first_exceeded = Some(out_sid);
            }
        }
        if let Some(at_region_name) = desc.at_region.clone() {
            let region = state.region(module, map, &at_region_name, &desc.name)?;
            region.cursor = lma + occupied;
            region.sections.push(out_sid);
            if region.first_exceeded.is_none() && lma + occupied > region.origin + region.length
            {
                region.first_exceeded = Some(out_sid);
            }
        }
    }
    if alloc && !is_tbss {
        Ok(addr + cursor)
    } else {
        Ok(dot)
    }
}

/// Offsets one input section's fragments inside the output section and
/// re-homes them there.
fn place_input_section(
    module: &mut Module,
    out_sid: SectionId,
    sid: SectionId,
    subalign: Option<u64>,
    mut cursor: u64,
) -> u64 {
    let frags = module.sections[sid].fragments.clone();
    let section_align = subalign.unwrap_or(module.sections[sid].align);
    cursor = align_up(cursor, section_align.max(1));
    let start = cursor;
    for frag_id in frags {
        let align = if subalign.is_some() {
            1
        } else {
            module.fragments[frag_id].align
        };
        cursor = align_up(cursor, align.max(1));
        module.fragments[frag_id].offset = Some(cursor);
        module.fragments[frag_id].owner = out_sid;
        cursor += module.fragments[frag_id].size();
    }
    let out_addr = module.sections[out_sid]
        .out
        .as_ref()
        .map(|o| o.addr)
        .unwrap_or(0);
    module.sections[sid].out = Some(OutputBinding {
        addr: out_addr + start,
        lma: 0,
        offset: start,
        phdrs: Vec::new(),
        shndx: 0,
        fill: None,
    });
    module.sections[sid].output_section = Some(out_sid);
    cursor
}

/// When neither an address nor `>REGION` names a home and regions exist,
/// the first region whose attributes cover the section takes it.
fn pick_region_by_attrs(module: &Module, flags: &SectionFlags) -> Option<String> {
    if module.script.memory_regions.is_empty() || !flags.contains(SectionFlags::ALLOC) {
        return None;
    }
    module
        .script
        .memory_regions
        .iter()
        .find(|r| r.matches_section(*flags))
        .map(|r| r.name.clone())
}

/// Post-sweep work: input-section VMAs, boundary symbols, file offsets,
/// segments, trailing asserts.
fn finish(module: &mut Module) -> Result<()> {
    // input-section address fixups now that output addresses are final
    for sid in module.sections.indices().collect::<Vec<_>>() {
        let Some(out_sid) = module.sections[sid].output_section else {
            continue;
        };
        if module.sections[sid].out.is_none() {
            continue;
        }
        let base = module.sections[out_sid]
            .out
            .as_ref()
            .map(|o| o.addr)
            .unwrap_or(0);
        if let Some(binding) = module.sections[sid].out.as_mut() {
            binding.addr = base + binding.offset;
        }
    }
    synthesize_boundary_symbols(module);
    assign_file_offsets(module);
    phdr::build_segments(module)?;
    // asserts outside SECTIONS commit once addresses exist
    let mut asserts = std::mem::take(&mut module.script.asserts);
    let mut result = Ok(());
    for assert in asserts.iter_mut() {
        let ctx = EvalContext::outside(module);
        if let Err(e) = assert.commit(&ctx) {
            result = Err(e);
            break;
        }
    }
    module.script.asserts = asserts;
    result
}

/// `__start_X` / `__stop_X` for every referenced pair whose output
/// section exists and is allocated.
fn synthesize_boundary_symbols(module: &mut Module) {
    let mut work: Vec<(String, SectionId, bool)> = Vec::new();
    for (_, info) in module.pool.infos() {
        if info.is_defined() || !info.referenced {
            continue;
        }
        let (section_name, is_stop) = match info.name.strip_prefix("__start_") {
            Some(rest) => (rest, false),
            None => match info.name.strip_prefix("__stop_") {
                Some(rest) => (rest, true),
                None => continue,
            },
        };
        let Some(sid) = module.section_map.find_output_section(section_name) else {
            continue;
        };
        if !module.sections[sid].is_alloc() || module.sections[sid].out.is_none() {
            continue;
        }
        work.push((info.name.clone(), sid, is_stop));
    }
    let owner = module.internal_input(InternalInputKind::Script);
    for (name, sid, is_stop) in work {
        let value = if is_stop { module.sections[sid].size } else { 0 };
        module
            .pool
            .define_in_section(owner, &name, sid, None, value, crate::symbol::SymbolType::NoType, false);
    }
}

/// File offsets: allocated sections in address order, congruent to their
/// VMA modulo the maximum page size; non-allocated content follows.
fn assign_file_offsets(module: &mut Module) {
    let page = module.max_page_size();
    let headers = module.sizeof_headers();
    let mut alloc: Vec<SectionId> = Vec::new();
    let mut non_alloc: Vec<SectionId> = Vec::new();
    for (sid, section) in module.sections.iter() {
        if section.out.is_none() || section.output_section.is_some() {
            continue;
        }
        if section.is_alloc() {
            alloc.push(sid);
        } else if section.sh_type != elf::SHT_NULL {
            non_alloc.push(sid);
        }
    }
    alloc.sort_by_key(|&sid| {
        module.sections[sid]
            .out
            .as_ref()
            .map(|o| o.addr)
            .unwrap_or(0)
    });
    let mut offset = headers;
    for sid in alloc {
        let (addr, nobits, size) = {
            let s = &module.sections[sid];
            (
                s.out.as_ref().map(|o| o.addr).unwrap_or(0),
                s.sh_type == elf::SHT_NOBITS,
                s.size,
            )
        };
        if nobits {
            if let Some(out) = module.sections[sid].out.as_mut() {
                out.offset = offset;
            }
            continue;
        }
        let want = addr % page;
        let have = offset % page;
        offset += (want + page - have) % page;
        if let Some(out) = module.sections[sid].out.as_mut() {
            out.offset = offset;
        }
        offset += size;
    }
    for sid in non_alloc {
        let align = module.sections[sid].align.max(1);
        offset = align_up(offset, align);
        if let Some(out) = module.sections[sid].out.as_mut() {
            out.offset = offset;
        }
        offset += module.sections[sid].size;
    }
    // input sections inherit their output section's base offset
    for sid in module.sections.indices().collect::<Vec<_>>() {
        let Some(out_sid) = module.sections[sid].output_section else {
            continue;
        };
        let base = module.sections[out_sid]
            .out
            .as_ref()
            .map(|o| o.offset)
            .unwrap_or(0);
        let within = module.sections[sid]
            .out
            .as_ref()
            .map(|o| o.offset)
            .unwrap_or(0);
        if let Some(binding) = module.sections[sid].out.as_mut() {
            binding.offset = base + within;
        }
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LinkConfig;
    use crate::input::{InputFile, InputKind};
    use crate::object::section_map::build_and_match;
    use crate::script::parse::parse_script;
    use crate::script::ScriptCommand;
    use crate::section::Section;

    fn module_with(names_sizes: &[(&str, u64, u64)]) -> Module {
        let mut module = Module::new(LinkConfig::builder().build());
        let input = module
            .inputs
            .alloc(InputFile::new("a.o", InputKind::Object, 0));
        for &(name, size, align) in names_sizes {
            let mut s = Section::new(name, SectionKind::Regular, input);
            s.flags = SectionFlags::ALLOC;
            s.align = align;
            s.live = true;
            let sid = module.sections.alloc(s);
            module.inputs[input].sections.push(sid);
            module.append_fragment(
                sid,
                align,
                FragmentKind::Region {
                    data: vec![0u8; size as usize],
                },
            );
        }
        module
    }

    fn activate(module: &mut Module, text: &str) {
        let cmds = parse_script("t.ld", text).unwrap();
        for cmd in cmds {
            match cmd {
                ScriptCommand::Sections(body) => {
                    module.script.sections_commands = body;
                    module.script.has_sections_cmd = true;
                }
                ScriptCommand::Memory(descs) => {
                    for d in descs {
                        module
                            .script
                            .memory_regions
                            .push(crate::script::ScriptMemoryRegion::new(d).unwrap());
                    }
                }
                _ => {}
            }
        }
    }

    #[test]
    fn test_dot_and_align_assignment() {
        // the S5 shape: .a at 0x1000, .b aligned to the next 0x1000
        let mut module = module_with(&[(".a", 0x10, 1), (".b", 0x20, 1)]);
        activate(
            &mut module,
            "SECTIONS { . = 0x1000; .a : { *(.a) } . = ALIGN(., 0x1000); .b : { *(.b) } }",
        );
        build_and_match(&mut module);
        assign_addresses(&mut module).unwrap();
        let a = module.section_map.find_output_section(".a").unwrap();
        let b = module.section_map.find_output_section(".b").unwrap();
        assert_eq!(module.sections[a].out.as_ref().unwrap().addr, 0x1000);
        assert_eq!(module.sections[b].out.as_ref().unwrap().addr, 0x2000);
        assert_eq!(module.sections[a].size, 0x10);
        assert_eq!(module.sections[b].size, 0x20);
    }

    #[test]
    fn test_memory_region_overflow_names_first_offender() {
        // the S4 shape: 0x180 bytes of .data into a 0x100-byte region
        let mut module = module_with(&[
            (".data.a", 0x100, 1),
            (".data.b", 0x60, 1),
            (".data.c", 0x20, 1),
        ]);
        activate(
            &mut module,
            "MEMORY { RAM (rw) : ORIGIN = 0x1000, LENGTH = 0x100 }\nSECTIONS { .data : { *(.data*) } > RAM }",
        );
        build_and_match(&mut module);
        let _ = assign_addresses(&mut module);
        assert!(module.diag.has_fatal());
        let entries = module.diag.entries();
        let overflow = entries
            .iter()
            .find(|e| e.id == DiagId::ERROR_MEMORY_REGION_EXCEEDED_LIMIT)
            .unwrap();
        assert_eq!(overflow.args[0], "RAM");
        assert_eq!(overflow.args[1], ".data");
    }

    #[test]
    fn test_at_diverges_lma() {
        let mut module = module_with(&[(".data", 0x10, 4)]);
        activate(
            &mut module,
            "SECTIONS { . = 0x1000; .data : AT(0x8000) { *(.data) } }",
        );
        build_and_match(&mut module);
        assign_addresses(&mut module).unwrap();
        let d = module.section_map.find_output_section(".data").unwrap();
        let out = module.sections[d].out.as_ref().unwrap();
        assert_eq!(out.addr, 0x1000);
        assert_eq!(out.lma, 0x8000);
    }

    #[test]
    fn test_default_layout_starts_past_headers() {
        let mut module = module_with(&[(".text", 8, 4)]);
        // mark as exec so ranking puts it first
        let input_sections: Vec<SectionId> = module.inputs.iter().flat_map(|(_, f)| f.sections.clone()).collect();
        for sid in input_sections {
            module.sections[sid].flags |= SectionFlags::EXECINSTR;
        }
        build_and_match(&mut module);
        assign_addresses(&mut module).unwrap();
        let t = module.section_map.find_output_section(".text").unwrap();
        let out = module.sections[t].out.as_ref().unwrap();
        assert_eq!(
            out.addr,
            module.image_base() + module.sizeof_headers()
        );
        assert!(module.headers_loaded);
    }

    #[test]
    fn test_data_command_emits_fragment() {
        let mut module = module_with(&[(".tbl", 4, 4)]);
        activate(
            &mut module,
            "SECTIONS { .tbl : { *(.tbl) LONG(0xdeadbeef) } }",
        );
        build_and_match(&mut module);
        assign_addresses(&mut module).unwrap();
        let t = module.section_map.find_output_section(".tbl").unwrap();
        assert_eq!(module.sections[t].size, 8);
    }

    #[test]
    fn test_boundary_symbols() {
        let mut module = module_with(&[("mysec", 0x40, 4)]);
        module.pool.mark_referenced("__start_mysec");
        module.pool.mark_referenced("__stop_mysec");
        build_and_match(&mut module);
        assign_addresses(&mut module).unwrap();
        let start = module.pool.find("__start_mysec").unwrap();
        assert!(start.is_defined());
        let start_sym = start.out_symbol.unwrap();
        let stop_sym = module.pool.find("__stop_mysec").unwrap().out_symbol.unwrap();
        let base = module.symbol_value(start_sym);
        assert_eq!(module.symbol_value(stop_sym), base + 0x40);
    }
}

//! Garbage collection (`--gc-sections`): remove sections transitively
//! unreachable from the entry set.

use crate::config::OutputKind;
use crate::diag::{DiagId, DiagnosticEntry, DiagnosticKind};
use crate::module::Module;
use crate::section::{SectionId, SectionKind};
use crate::symbol::Visibility;
use std::collections::{HashMap, HashSet, VecDeque};

/// Run the collection. Idempotent: a second run over the same module
/// reaches the same live set.
pub fn run(module: &mut Module) {
    if !module.config.gc_sections {
        // everything placeable is live
        for sid in module.sections.indices().collect::<Vec<_>>() {
            if !module.sections[sid].is_discarded() {
                module.sections[sid].live = true;
            }
        }
        return;
    }
    let edges = build_edges(module);
    let roots = entry_set(module);
    let mut live: HashSet<SectionId> = HashSet::new();
    let mut queue: VecDeque<SectionId> = roots.into_iter().collect();
    while let Some(sid) = queue.pop_front() {
        if !live.insert(sid) {
            continue;
        }
        if let Some(next) = edges.get(&sid) {
            for &t in next {
                if !live.contains(&t) {
                    queue.push_back(t);
                }
            }
        }
    }
    // sweep
    for sid in module.sections.indices().collect::<Vec<_>>() {
        let section = &module.sections[sid];
        if section.is_discarded() {
            continue;
        }
        if section.kind.gc_ineligible() || section.retained {
            module.sections[sid].live = true;
            continue;
        }
        if live.contains(&sid) {
            module.sections[sid].live = true;
            continue;
        }
        let name = section.name.clone();
        let owner = module.inputs[section.owner].display_name();
        if module.config.print_gc_sections {
            module.raise(DiagnosticEntry::new(
                DiagId::TRACE_GC_SECTION,
                DiagnosticKind::Note,
                vec![name, owner],
            ));
        } else {
            log::debug!("gc: removing unused section `{name}' from {owner}");
        }
        module.sections[sid].live = false;
        module.sections[sid].kind = SectionKind::Ignore;
    }
    if let Some(cref) = module.config.gc_cref.clone() {
        emit_cref_trace(module, &cref);
    }
}

/// Edges: section -> sections it references through relocations, plus the
/// implicit `__start_X`/`__stop_X` edges to every section named `X`.
fn build_edges(module: &Module) -> HashMap<SectionId, Vec<SectionId>> {
    let mut by_name: HashMap<&str, Vec<SectionId>> = HashMap::new();
    for (sid, section) in module.sections.iter() {
        if !section.is_discarded() && !section.kind.gc_ineligible() {
            by_name.entry(section.name.as_str()).or_default().push(sid);
        }
    }
    let mut edges: HashMap<SectionId, Vec<SectionId>> = HashMap::new();
    for (sid, section) in module.sections.iter() {
        if section.is_discarded() {
            continue;
        }
        for &rid in &section.relocs {
            let reloc = &module.relocs[rid];
            let sym = module.pool.symbol(reloc.symbol);
            // resolve through the pool so a reference binds to the chosen
            // definition's section, not the local occurrence
            let target_section = match sym.resolve {
                Some(resolve) => {
                    let info = module.pool.info(resolve);
                    info.out_symbol
                        .and_then(|out| module.pool.symbol(out).section)
                }
                None => sym.section,
            };
            if let Some(target) = target_section {
                edges.entry(sid).or_default().push(target);
            }
            // __start_X / __stop_X keep every section named X
            let name = &sym.name;
            let bounds = name
                .strip_prefix("__start_")
                .or_else(|| name.strip_prefix("__stop_"));
            if let Some(section_name) = bounds {
                if let Some(targets) = by_name.get(section_name) {
                    edges.entry(sid).or_default().extend(targets.iter().copied());
                }
            }
        }
    }
    edges
}

fn section_of_symbol(module: &Module, name: &str) -> Option<SectionId> {
    let info = module.pool.find(name)?;
    let out = info.out_symbol?;
    module.pool.symbol(out).section
}

fn entry_set(module: &Module) -> Vec<SectionId> {
    let mut roots: Vec<SectionId> = Vec::new();
    // the entry symbol's section, else the first text-like section
    let entry_root = module
        .entry_name
        .as_deref()
        .and_then(|entry| section_of_symbol(module, entry));
    match entry_root {
        Some(sid) => roots.push(sid),
        None => {
            let first_text = module
                .sections
                .iter()
                .find(|(_, s)| {
                    !s.is_discarded()
                        && s.kind == SectionKind::Regular
                        && s.is_exec()
                })
                .map(|(sid, _)| sid);
            if let Some(sid) = first_text {
                roots.push(sid);
            }
        }
    }
    // retained sections (SHF_GNU_RETAIN, KEEP rules)
    for (sid, section) in module.sections.iter() {
        if section.retained && !section.is_discarded() {
            roots.push(sid);
        }
    }
    // forced-undefined, extern and export-dynamic-symbol names
    for name in module
        .config
        .undefined
        .iter()
        .chain(module.script.externs.iter())
        .chain(module.config.export_dynamic_symbols.iter())
    {
        if let Some(sid) = section_of_symbol(module, name) {
            roots.push(sid);
        }
    }
    // common symbols' owning internal section
    for (_, info) in module.pool.infos() {
        if info.is_common() {
            if let Some(out) = info.out_symbol {
                if let Some(sid) = module.pool.symbol(out).section {
                    roots.push(sid);
                }
            }
        }
    }
    // exported surface: shared objects and dynamic executables root every
    // default-visibility global definition
    let exports_all = matches!(module.config.kind, OutputKind::Dyn | OutputKind::Pie)
        || module.config.export_dynamic;
    if exports_all {
        for (_, info) in module.pool.infos() {
            if info.is_defined()
                && !info.from_dynamic
                && !info.forced_local
                && info.visibility == Visibility::Default
            {
                if let Some(out) = info.out_symbol {
                    if let Some(sid) = module.pool.symbol(out).section {
                        roots.push(sid);
                    }
                }
            }
        }
    }
    roots
}

/// `--gc-cref=SYM`: list every section referencing `SYM`.
fn emit_cref_trace(module: &Module, name: &str) {
    for (sid, section) in module.sections.iter() {
        let _ = sid;
        for &rid in &section.relocs {
            let reloc = &module.relocs[rid];
            if module.pool.symbol(reloc.symbol).name == name {
                module.raise(DiagnosticEntry::new(
                    DiagId::TRACE_GC_CREF,
                    DiagnosticKind::Note,
                    vec![
                        name.to_string(),
                        section.name.clone(),
                        module.inputs[section.owner].display_name(),
                    ],
                ));
            }
        }
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LinkConfig;
    use crate::elf::SectionFlags;
    use crate::fragment::{FragmentKind, FragmentRef};
    use crate::input::{InputFile, InputKind};
    use crate::reloc::Relocation;
    use crate::section::Section;
    use crate::symbol::name_pool::SymbolInput;
    use crate::symbol::{SymbolBinding, SymbolDesc, SymbolType};

    /// One object: `.text.used` (holding `_start` and a call to `used`),
    /// `.text.used2` (holding `used`) and `.text.dead`.
    fn gc_module() -> (Module, Vec<SectionId>) {
        let mut module = Module::new(
            LinkConfig::builder()
                .gc_sections(true)
                .entry("_start".to_string())
                .build(),
        );
        module.entry_name = Some("_start".into());
        let input = module
            .inputs
            .alloc(InputFile::new("a.o", InputKind::Object, 0));
        let mut ids = Vec::new();
        for name in [".text.used", ".text.used2", ".text.dead"] {
            let mut s = Section::new(name, SectionKind::Regular, input);
            s.flags = SectionFlags::ALLOC | SectionFlags::EXECINSTR;
            let sid = module.sections.alloc(s);
            module.inputs[input].sections.push(sid);
            let frag = module.append_fragment(sid, 4, FragmentKind::Region { data: vec![0; 8] });
            let _ = frag;
            ids.push(sid);
        }
        let def = |module: &mut Module, name: &str, sid: SectionId| {
            let frag = module.sections[sid].fragments[0];
            module
                .pool
                .add_symbol(
                    input,
                    SymbolInput {
                        name,
                        ty: SymbolType::Func,
                        desc: SymbolDesc::Defined,
                        binding: SymbolBinding::Global,
                        visibility: crate::symbol::Visibility::Default,
                        size: 8,
                        value: 0,
                        section: Some(sid),
                        frag_ref: Some(FragmentRef { frag, offset: 0 }),
                        special_shndx: None,
                        from_dynamic: false,
                        common_align: 0,
                    },
                )
                .unwrap()
        };
        let _start = def(&mut module, "_start", ids[0]);
        let used = def(&mut module, "used", ids[1]);
        let _dead = def(&mut module, "dead", ids[2]);
        let _ = _start;
        // .text.used references `used`
        let frag0 = module.sections[ids[0]].fragments[0];
        let rid = module.relocs.alloc(Relocation {
            rtype: 0,
            symbol: used,
            target: FragmentRef {
                frag: frag0,
                offset: 4,
            },
            addend: 0,
            paired: None,
            section: ids[0],
        });
        module.sections[ids[0]].relocs.push(rid);
        (module, ids)
    }

    #[test]
    fn test_dead_section_collected() {
        let (mut module, ids) = gc_module();
        run(&mut module);
        assert!(module.sections[ids[0]].live);
        assert!(module.sections[ids[1]].live);
        assert!(!module.sections[ids[2]].live);
        assert_eq!(module.sections[ids[2]].kind, SectionKind::Ignore);
    }

    #[test]
    fn test_gc_is_idempotent() {
        let (mut module, ids) = gc_module();
        run(&mut module);
        let first: Vec<bool> = ids.iter().map(|&sid| module.sections[sid].live).collect();
        run(&mut module);
        let second: Vec<bool> = ids.iter().map(|&sid| module.sections[sid].live).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_retained_section_survives() {
        let (mut module, ids) = gc_module();
        module.sections[ids[2]].retained = true;
        run(&mut module);
        assert!(module.sections[ids[2]].live);
    }

    #[test]
    fn test_disabled_gc_keeps_everything() {
        let (mut module, ids) = gc_module();
        module.config.gc_sections = false;
        run(&mut module);
        assert!(ids.iter().all(|&sid| module.sections[sid].live));
    }

    #[test]
    fn test_undefined_option_roots_section() {
        let (mut module, ids) = gc_module();
        module.config.undefined.push("dead".to_string());
        run(&mut module);
        assert!(module.sections[ids[2]].live);
    }
}

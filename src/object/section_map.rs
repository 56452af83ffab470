//! The section map: output-section entries, rule containers and the
//! matching engine that binds every input section to exactly one output
//! section or discards it.

use crate::diag::DiagnosticKind;
use crate::input::{InputKind, InternalInputKind};
use crate::module::Module;
use crate::script::{
    InputSectDesc, OutputSectCommand, OutputSectDesc, ScriptCommand, SectionsCommand, SortPolicy,
};
use crate::section::{Section, SectionId, SectionKind};
use crate::support::glob::Pattern;
use std::collections::HashMap;

/// The `/DISCARD/` output-section name.
pub const DISCARD_SECTION: &str = "/DISCARD/";

/// One `*(pattern...)` rule of an output section, with its match list and
/// observable metrics.
#[derive(Debug)]
pub struct RuleContainer {
    pub desc: InputSectDesc,
    /// Matched input sections, in match order (sorted per the policy once
    /// matching completes)
    pub matched: Vec<SectionId>,
    /// Observable metric: how many sections this rule matched
    pub match_count: usize,
    /// Index of the originating command within the output section's body
    pub command_index: usize,
}

/// One output section of the map.
#[derive(Debug)]
pub struct OutputSectionEntry {
    pub name: String,
    /// The output `Section` backing this entry
    pub section: SectionId,
    /// Script description; synthesized for orphans and defaults
    pub desc: OutputSectDesc,
    pub rules: Vec<RuleContainer>,
    /// Position in script (and hence layout) order
    pub order: usize,
    /// From the default map rather than the user's script
    pub synthesized: bool,
}

/// Ordered list of output-section entries plus the discard rules.
#[derive(Debug, Default)]
pub struct SectionMap {
    pub entries: Vec<OutputSectionEntry>,
    by_name: HashMap<String, usize>,
    /// Rules of the `/DISCARD/` pseudo-section
    pub discard_rules: Vec<InputSectDesc>,
}

/// The built-in placement map used for sections no script rule claims:
/// `(input pattern, output section)`, checked in order.
const DEFAULT_MAP: &[(&str, &str)] = &[
    (".text*", ".text"),
    (".rodata*", ".rodata"),
    (".data.rel.ro*", ".data.rel.ro"),
    (".data*", ".data"),
    (".sdata*", ".sdata"),
    (".sbss*", ".sbss"),
    (".tdata*", ".tdata"),
    (".tbss*", ".tbss"),
    (".bss*", ".bss"),
    (".init_array*", ".init_array"),
    (".fini_array*", ".fini_array"),
    (".preinit_array*", ".preinit_array"),
    (".ctors*", ".ctors"),
    (".dtors*", ".dtors"),
    (".init*", ".init"),
    (".fini*", ".fini"),
    (".got.plt*", ".got.plt"),
    (".got*", ".got"),
    (".eh_frame*", ".eh_frame"),
    (".gcc_except_table*", ".gcc_except_table"),
    (".note.gnu.build-id", ".note.gnu.build-id"),
];

impl SectionMap {
    /// Look up an entry index by output-section name.
    pub fn entry_index(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    /// The output `Section` named `name`, for expression queries.
    pub fn find_output_section(&self, name: &str) -> Option<SectionId> {
        self.entry_index(name).map(|i| self.entries[i].section)
    }

    fn add_entry(
        &mut self,
        module_sections: &mut crate::support::arena::Arena<SectionId, Section>,
        owner: crate::input::InputId,
        desc: OutputSectDesc,
        synthesized: bool,
    ) -> usize {
        let order = self.entries.len();
        let mut section = Section::new(desc.name.clone(), SectionKind::Regular, owner);
        section.live = true;
        let section = module_sections.alloc(section);
        let rules = desc
            .commands
            .iter()
            .enumerate()
            .filter_map(|(command_index, cmd)| match cmd {
                OutputSectCommand::Input(d) => Some(RuleContainer {
                    desc: d.clone(),
                    matched: Vec::new(),
                    match_count: 0,
                    command_index,
                }),
                _ => None,
            })
            .collect();
        let index = self.entries.len();
        self.by_name.insert(desc.name.clone(), index);
        self.entries.push(OutputSectionEntry {
            name: desc.name.clone(),
            section,
            desc,
            rules,
            order,
            synthesized,
        });
        index
    }
}

/// Re-run matching for sections created after the first pass (GOT, PLT,
/// dynamic and other synthesized internal sections). Already-bound
/// sections are untouched.
pub fn match_new_sections(module: &mut Module) {
    match_sections(module);
}

/// Build the map from the activated script and bind every input section.
pub fn build_and_match(module: &mut Module) {
    let owner = module.internal_input(InternalInputKind::OutputSections);
    let mut map = SectionMap::default();
    // entries from the script, in source order
    let commands: Vec<SectionsCommand> = module.script.sections_commands.clone();
    for cmd in &commands {
        if let SectionsCommand::OutputSect(desc) = cmd {
            if desc.name == DISCARD_SECTION {
                for c in &desc.commands {
                    if let OutputSectCommand::Input(d) = c {
                        map.discard_rules.push(d.clone());
                    }
                }
                continue;
            }
            map.add_entry(&mut module.sections, owner, desc.clone(), false);
        }
    }
    module.section_map = map;
    match_sections(module);
}

fn file_names(module: &Module, section: SectionId) -> (String, String, String) {
    let input = &module.inputs[module.sections[section].owner];
    let path = input.path.display().to_string();
    let base = input
        .path
        .file_name()
        .map(|b| b.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.clone());
    (path, base, input.display_name())
}

fn file_matches(module: &Module, section: SectionId, desc: &InputSectDesc) -> bool {
    let (path, base, display) = file_names(module, section);
    let spec = &desc.spec;
    if let Some(archive) = &spec.archive {
        let input = &module.inputs[module.sections[section].owner];
        if input.member_name.is_none() {
            return false;
        }
        if !(archive.matches(&path) || archive.matches(&base)) {
            return false;
        }
        let member = input.member_name.as_deref().unwrap_or("");
        return spec.file.matches(member);
    }
    spec.file.matches(&path) || spec.file.matches(&base) || spec.file.matches(&display)
}

/// Whether `desc` claims `section`; returns the pattern index used.
fn rule_matches(module: &Module, section: SectionId, desc: &InputSectDesc) -> Option<usize> {
    if !file_matches(module, section, desc) {
        return None;
    }
    let name = &module.sections[section].name;
    let (path, base, _) = file_names(module, section);
    for (index, pat) in desc.spec.sections.iter().enumerate() {
        if !pat.pattern.matches(name) {
            continue;
        }
        let excluded = pat
            .exclude_files
            .iter()
            .any(|ex| ex.matches(&path) || ex.matches(&base));
        if excluded {
            continue;
        }
        return Some(index);
    }
    None
}

fn placeable(kind: SectionKind) -> bool {
    matches!(
        kind,
        SectionKind::Regular
            | SectionKind::MergeStr
            | SectionKind::EhFrame
            | SectionKind::Note
            | SectionKind::Target
            | SectionKind::Common
    )
}

/// `.ctors.N` / `.init_array.N` priority for `SORT_BY_INIT_PRIORITY`.
fn init_priority(name: &str) -> u64 {
    name.rsplit('.')
        .next()
        .and_then(|tail| tail.parse().ok())
        .unwrap_or(u64::MAX)
}

fn match_sections(module: &mut Module) {
    // collect candidate input sections in input order
    let mut candidates: Vec<SectionId> = Vec::new();
    for (input_id, input) in module.inputs.iter() {
        if matches!(input.kind, InputKind::SharedObject | InputKind::Executable) {
            continue;
        }
        let _ = input_id;
        for &sid in &input.sections {
            let section = &module.sections[sid];
            if section.output_section.is_some() {
                continue;
            }
            if placeable(section.kind) {
                candidates.push(sid);
            }
        }
    }
    for sid in candidates {
        // the discard rules run with the script rules, in script order;
        // model the common case of `/DISCARD/` trailing the script by
        // testing explicit rules first
        let mut matched = false;
        let mut matched_rule: Option<(usize, usize, bool)> = None;
        'entries: for (entry_idx, entry) in module.section_map.entries.iter().enumerate() {
            for (rule_idx, rule) in entry.rules.iter().enumerate() {
                if rule_matches(module, sid, &rule.desc).is_some() {
                    matched_rule = Some((entry_idx, rule_idx, rule.desc.keep));
                    break 'entries;
                }
            }
        }
        if let Some((entry_idx, rule_idx, keep)) = matched_rule {
            let out_section = module.section_map.entries[entry_idx].section;
            {
                let entry = &mut module.section_map.entries[entry_idx];
                entry.rules[rule_idx].matched.push(sid);
                entry.rules[rule_idx].match_count += 1;
            }
            let section = &mut module.sections[sid];
            section.output_section = Some(out_section);
            section.matched_rule = Some((entry_idx, rule_idx));
            if keep {
                section.retained = true;
            }
            matched = true;
            log::trace!(
                "section {} matched rule {} of output section {}",
                module.sections[sid].name,
                rule_idx,
                module.section_map.entries[entry_idx].name
            );
        }
        if matched {
            continue;
        }
        let discard = module
            .section_map
            .discard_rules
            .iter()
            .any(|d| rule_matches(module, sid, d).is_some());
        if discard {
            module.sections[sid].kind = SectionKind::Discard;
            continue;
        }
        place_by_default(module, sid);
    }
    sort_rule_matches(module);
}

/// Default placement for sections no explicit rule claimed.
fn place_by_default(module: &mut Module, sid: SectionId) {
    let name = module.sections[sid].name.clone();
    let out_name = DEFAULT_MAP
        .iter()
        .find(|(pat, _)| Pattern::new(*pat).matches(&name))
        .map(|(_, out)| (*out).to_string())
        .unwrap_or_else(|| name.clone());
    let entry_idx = match module.section_map.entry_index(&out_name) {
        Some(idx) => idx,
        None => {
            let owner = module.internal_input(InternalInputKind::OutputSections);
            let desc = OutputSectDesc {
                name: out_name.clone(),
                address: None,
                sect_type: None,
                at: None,
                align: None,
                subalign: None,
                commands: Vec::new(),
                region: None,
                at_region: None,
                phdrs: Vec::new(),
                fill: None,
            };
            let idx = module
                .section_map
                .add_entry(&mut module.sections, owner, desc, true);
            module.raise(crate::diag::DiagnosticEntry::new(
                crate::diag::DiagId::PLAIN,
                DiagnosticKind::Verbose,
                vec![format!("placing orphan section `{name}' in `{out_name}'")],
            ));
            idx
        }
    };
    let out_section = module.section_map.entries[entry_idx].section;
    module.sections[sid].output_section = Some(out_section);
    module.sections[sid].matched_rule = Some((entry_idx, usize::MAX));
    // default placements append in encounter order on a synthetic rule
    let entry = &mut module.section_map.entries[entry_idx];
    if entry.rules.last().map(|r| r.command_index) != Some(usize::MAX) {
        entry.rules.push(RuleContainer {
            desc: InputSectDesc {
                keep: false,
                spec: crate::script::InputSectSpec {
                    archive: None,
                    file: Pattern::new("*"),
                    sections: vec![crate::script::SectionPattern {
                        pattern: Pattern::new("*"),
                        exclude_files: Vec::new(),
                        sort: SortPolicy::None,
                    }],
                },
            },
            matched: Vec::new(),
            match_count: 0,
            command_index: usize::MAX,
        });
    }
    if let Some(rule) = entry.rules.last_mut() {
        rule.matched.push(sid);
        rule.match_count += 1;
    }
}

/// Stable-sort each rule's match list per its sort policy. Input
/// encounter order is the tie-break.
fn sort_rule_matches(module: &mut Module) {
    for entry in &mut module.section_map.entries {
        for rule in &mut entry.rules {
            let policy = rule
                .desc
                .spec
                .sections
                .first()
                .map(|p| p.sort)
                .unwrap_or(SortPolicy::None);
            match policy {
                SortPolicy::None => {}
                SortPolicy::ByName => {
                    rule.matched
                        .sort_by(|&a, &b| module.sections[a].name.cmp(&module.sections[b].name));
                }
                SortPolicy::ByAlignment => {
                    // larger alignment first
                    rule.matched.sort_by(|&a, &b| {
                        module.sections[b].align.cmp(&module.sections[a].align)
                    });
                }
                SortPolicy::ByInitPriority => {
                    rule.matched.sort_by(|&a, &b| {
                        init_priority(&module.sections[a].name)
                            .cmp(&init_priority(&module.sections[b].name))
                    });
                }
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
    use crate::input::InputFile;
    use crate::script::parse::parse_script;

    fn module_with_sections(names: &[&str]) -> (Module, Vec<SectionId>) {
        let mut module = Module::new(LinkConfig::builder().build());
        let input = module
            .inputs
            .alloc(InputFile::new("a.o", InputKind::Object, 0));
        let mut ids = Vec::new();
        for name in names {
            let mut s = Section::new(*name, SectionKind::Regular, input);
            s.flags = SectionFlags::ALLOC;
            let sid = module.sections.alloc(s);
            module.inputs[input].sections.push(sid);
            ids.push(sid);
        }
        (module, ids)
    }

    fn activate(module: &mut Module, script: &str) {
        let cmds = parse_script("t.ld", script).unwrap();
        for cmd in cmds {
            if let ScriptCommand::Sections(body) = cmd {
                module.script.sections_commands = body;
                module.script.has_sections_cmd = true;
            }
        }
    }

    #[test]
    fn test_first_rule_wins() {
        let (mut module, ids) =
            module_with_sections(&[".text.hot", ".text.cold", ".data.x"]);
        activate(
            &mut module,
            "SECTIONS { .hot : { *(.text.hot) } .text : { *(.text*) } .data : { *(.data*) } }",
        );
        build_and_match(&mut module);
        let hot_out = module.section_map.find_output_section(".hot").unwrap();
        let text_out = module.section_map.find_output_section(".text").unwrap();
        assert_eq!(module.sections[ids[0]].output_section, Some(hot_out));
        assert_eq!(module.sections[ids[1]].output_section, Some(text_out));
        assert_eq!(
            module.section_map.entries[module.section_map.entry_index(".hot").unwrap()].rules[0]
                .match_count,
            1
        );
    }

    #[test]
    fn test_discard_rule() {
        let (mut module, ids) = module_with_sections(&[".text", ".junk"]);
        activate(
            &mut module,
            "SECTIONS { .text : { *(.text) } /DISCARD/ : { *(.junk) } }",
        );
        build_and_match(&mut module);
        assert!(module.sections[ids[0]].output_section.is_some());
        assert_eq!(module.sections[ids[1]].kind, SectionKind::Discard);
    }

    #[test]
    fn test_keep_marks_retained() {
        let (mut module, ids) = module_with_sections(&[".init_array.00010"]);
        activate(
            &mut module,
            "SECTIONS { .init_array : { KEEP(*(.init_array*)) } }",
        );
        build_and_match(&mut module);
        assert!(module.sections[ids[0]].retained);
    }

    #[test]
    fn test_default_map_places_orphans() {
        let (mut module, ids) = module_with_sections(&[".text.startup", ".mystery"]);
        activate(&mut module, "SECTIONS { .data : { *(.data) } }");
        build_and_match(&mut module);
        // .text.startup flows to the default .text entry
        let text_out = module.section_map.find_output_section(".text").unwrap();
        assert_eq!(module.sections[ids[0]].output_section, Some(text_out));
        // unknown names keep their own output section
        let mystery_out = module.section_map.find_output_section(".mystery").unwrap();
        assert_eq!(module.sections[ids[1]].output_section, Some(mystery_out));
    }

    #[test]
    fn test_sort_by_init_priority() {
        let (mut module, ids) =
            module_with_sections(&[".init_array.20", ".init_array.5", ".init_array.100"]);
        activate(
            &mut module,
            "SECTIONS { .init_array : { KEEP(*(SORT_BY_INIT_PRIORITY(.init_array.*))) } }",
        );
        build_and_match(&mut module);
        let entry = &module.section_map.entries[0];
        let order: Vec<&str> = entry.rules[0]
            .matched
            .iter()
            .map(|&sid| module.sections[sid].name.as_str())
            .collect();
        assert_eq!(order, [".init_array.5", ".init_array.20", ".init_array.100"]);
        let _ = ids;
    }

    #[test]
    fn test_exclude_file() {
        let mut module = Module::new(LinkConfig::builder().build());
        let a = module
            .inputs
            .alloc(InputFile::new("crtbegin.o", InputKind::Object, 0));
        let b = module
            .inputs
            .alloc(InputFile::new("user.o", InputKind::Object, 1));
        let mut ids = Vec::new();
        for input in [a, b] {
            let mut s = Section::new(".ctors", SectionKind::Regular, input);
            s.flags = SectionFlags::ALLOC;
            let sid = module.sections.alloc(s);
            module.inputs[input].sections.push(sid);
            ids.push(sid);
        }
        activate(
            &mut module,
            "SECTIONS { .ctors : { *(EXCLUDE_FILE(*crtbegin.o) .ctors) } }",
        );
        build_and_match(&mut module);
        let entry = &module.section_map.entries[0];
        // crtbegin.o's .ctors falls through to a default placement
        assert_eq!(entry.rules[0].matched, vec![ids[1]]);
        assert!(module.sections[ids[0]].output_section.is_some());
    }
}

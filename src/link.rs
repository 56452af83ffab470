//! The link driver: the six phases of a link, in strict order, over one
//! module.
//!
//! Prepare parses scripts and builds the input worklist; normalize reads
//! inputs (parsing ELF files in parallel, merging serially in
//! command-line order); resolve finishes symbol resolution across archive
//! extraction, wrap, version scripts and `--defsym`; layout runs GC, rule
//! matching, merging, the relocation scan, address assignment and
//! relaxation to a fixed point, then applies relocations; emit writes the
//! image. A fatal diagnostic aborts at the next phase boundary and the
//! output file is never committed on failure.

use crate::config::{InputRequest, LinkConfig, OutputKind};
use crate::diag::{DiagId, DiagnosticEntry, DiagnosticKind, Result};
use crate::elf::SectionFlags;
use crate::fragment::{FragmentKind, TargetFragRole};
use crate::input::{
    archive::{self, Archive},
    identify_bytes, reader, read_file, search, FileFormat, InternalInputKind,
};
use crate::layout::relax::{relax_pass, RelaxStats};
use crate::module::{LinkState, Module};
use crate::object::{check_nocrossrefs, gc, merge, section_map};
use crate::plugin::{LinkerPlugin, LinkerWrapper, PluginTiming, RelocHook};
use crate::reloc::{apply, scan};
use crate::script::{parse::parse_script, ScriptCommand, ScriptMemoryRegion, SectionsCommand};
use crate::support::pool::{run_indexed, CancelFlag};
use crate::support::sha1::Sha1;
use crate::symbol::version::{DynamicList, VersionScript};
use crate::target::TargetInfo;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

struct LoadedArchive {
    path: PathBuf,
    data: Vec<u8>,
    archive: Archive,
    extracted: HashSet<usize>,
}

/// One link from configuration to output file.
pub struct Linker {
    module: Module,
    target: Option<Box<dyn TargetInfo>>,
    plugins: Vec<Box<dyn LinkerPlugin>>,
    reloc_hooks: Vec<RelocHook>,
    archives: Vec<LoadedArchive>,
    pending: Vec<InputRequest>,
    relax_stats: RelaxStats,
    content_hasher: Sha1,
    image: Option<Vec<u8>>,
}

impl Linker {
    /// A linker over a fresh module.
    pub fn new(config: LinkConfig) -> Self {
        Linker {
            module: Module::new(config),
            target: None,
            plugins: Vec::new(),
            reloc_hooks: Vec::new(),
            archives: Vec::new(),
            pending: Vec::new(),
            relax_stats: RelaxStats::default(),
            content_hasher: Sha1::new(),
            image: None,
        }
    }

    /// Register a plugin. Universal plugins see every state change;
    /// after-sections plugins join once sections exist.
    pub fn add_plugin(&mut self, plugin: Box<dyn LinkerPlugin>) {
        self.plugins.push(plugin);
    }

    /// The module, for inspection after (or during) a link.
    pub fn module(&self) -> &Module {
        &self.module
    }

    /// Relaxation statistics of the last link.
    pub fn relax_stats(&self) -> RelaxStats {
        self.relax_stats
    }

    /// The deterministic content hash over every input and script text
    /// read so far (the caching identity of the link).
    pub fn content_hash(&self) -> [u8; 20] {
        self.content_hasher.clone().finish()
    }

    /// The emitted image, once the link succeeded.
    pub fn image(&self) -> Option<&[u8]> {
        self.image.as_deref()
    }

    fn phase_boundary(&self, phase: &str) -> Result<()> {
        if self.module.diag.has_fatal() {
            return Err(DiagnosticEntry::fatal(
                DiagId::PLAIN,
                vec![format!("link aborted during {phase}")],
            ));
        }
        Ok(())
    }

    fn notify_state(&mut self, state: LinkState, universal_only: bool) {
        for plugin in &mut self.plugins {
            if universal_only && plugin.timing() != PluginTiming::Universal {
                continue;
            }
            let mut wrapper = LinkerWrapper::new(&mut self.module, &mut self.reloc_hooks);
            if let Err(e) = plugin.on_state(state, &mut wrapper) {
                let name = plugin.name().to_string();
                self.module.raise(DiagnosticEntry::error(
                    DiagId::ERROR_PLUGIN_FAILED,
                    vec![name, e.message()],
                ));
            }
        }
    }

    /// Run the whole pipeline and write the output.
    pub fn link(&mut self) -> Result<()> {
        self.prepare()?;
        self.phase_boundary("prepare")?;
        self.normalize()?;
        self.phase_boundary("normalize")?;
        self.resolve()?;
        self.phase_boundary("resolve")?;
        self.layout()?;
        self.phase_boundary("layout")?;
        self.emit()?;
        if self.module.diag.has_failure() {
            return Err(DiagnosticEntry::fatal(
                DiagId::PLAIN,
                vec!["link failed".to_string()],
            ));
        }
        Ok(())
    }

    // ----- phase 1: prepare ---------------------------------------------

    fn prepare(&mut self) -> Result<()> {
        self.module.set_state(LinkState::Initializing);
        self.pending = self.module.config.inputs.clone();
        if let Some(text) = self.module.config.script_text.clone() {
            self.content_hasher.update(text.as_bytes());
            self.activate_script("<command line>", &text)?;
        }
        for path in self.module.config.scripts.clone() {
            let text_bytes = read_file(&path)?;
            self.content_hasher.update(&text_bytes);
            let text = String::from_utf8_lossy(&text_bytes).into_owned();
            self.activate_script(&path.display().to_string(), &text)?;
        }
        // --defsym behaves like a leading script assignment
        for defsym in self.module.config.defsym.clone() {
            let mut expr = crate::script::parse::parse_expression_text(&defsym.expr)?;
            expr.set_context("<--defsym>");
            self.module
                .script
                .outside_assignments
                .push(crate::script::Assignment {
                    symbol: defsym.name,
                    op: crate::script::AssignOp::Set,
                    kind: crate::script::AssignKind::Plain,
                    expr,
                    level: crate::script::AssignmentLevel::OutsideSections,
                });
        }
        let entry = self
            .module
            .config
            .entry
            .clone()
            .or_else(|| self.module.script.entry.clone())
            .unwrap_or_else(|| "_start".to_string());
        self.module.pool.mark_referenced(&entry);
        self.module.entry_name = Some(entry);
        for name in self.module.config.undefined.clone() {
            self.module.pool.mark_referenced(&name);
        }
        for name in self.module.config.export_dynamic_symbols.clone() {
            self.module.pool.mark_referenced(&name);
        }
        if self.module.config.build_id {
            self.create_build_id_note();
        }
        self.notify_state(LinkState::Initializing, true);
        Ok(())
    }

    fn create_build_id_note(&mut self) {
        let section = self.module.internal_section(
            InternalInputKind::BuildId,
            ".note.gnu.build-id",
            crate::elf::SHT_NOTE,
            SectionFlags::ALLOC,
            4,
        );
        if !self.module.sections[section].fragments.is_empty() {
            return;
        }
        let mut data = Vec::with_capacity(36);
        let mut sink = crate::elf::write::ByteSink::new(self.module.class, self.module.endian);
        sink.put_u32(4); // namesz
        sink.put_u32(20); // descsz
        sink.put_u32(crate::elf::NT_GNU_BUILD_ID);
        data.extend_from_slice(sink.as_slice());
        data.extend_from_slice(b"GNU\0");
        data.extend_from_slice(&[0u8; 20]);
        self.module.append_fragment(
            section,
            4,
            FragmentKind::Target {
                role: TargetFragRole::BuildId,
                data,
            },
        );
    }

    fn activate_script(&mut self, origin: &str, text: &str) -> Result<()> {
        let commands = parse_script(origin, text)?;
        self.activate_commands(origin, commands)
    }

    fn activate_commands(&mut self, origin: &str, commands: Vec<ScriptCommand>) -> Result<()> {
        for command in commands {
            match command {
                ScriptCommand::Entry(symbol) => {
                    if self.module.script.entry.is_none() {
                        self.module.script.entry = Some(symbol);
                    }
                }
                ScriptCommand::Extern(names) => {
                    for name in names {
                        self.module.pool.mark_referenced(&name);
                        self.module.script.externs.push(name);
                    }
                }
                ScriptCommand::Group(specs) | ScriptCommand::Input(specs) => {
                    for spec in specs {
                        self.pending.push(match spec {
                            crate::script::InputSpec::File(f) => {
                                InputRequest::File(PathBuf::from(f))
                            }
                            crate::script::InputSpec::Library(l) => InputRequest::Library(l),
                        });
                    }
                }
                ScriptCommand::Include { path, optional } => {
                    match search::find_input(&self.module.config, &path) {
                        Ok(found) => {
                            let bytes = read_file(&found)?;
                            self.content_hasher.update(&bytes);
                            let text = String::from_utf8_lossy(&bytes).into_owned();
                            self.activate_script(&found.display().to_string(), &text)?;
                        }
                        Err(_) if optional => {
                            log::debug!("INCLUDE_OPTIONAL `{path}' not found; skipping");
                        }
                        Err(_) => {
                            return Err(DiagnosticEntry::fatal(
                                DiagId::FATAL_MISSING_INCLUDE,
                                vec![path],
                            ));
                        }
                    }
                }
                ScriptCommand::SearchDir(dir) => {
                    self.module.config.search_dirs.push(PathBuf::from(dir));
                }
                ScriptCommand::Output(file) => {
                    self.module.script.output = Some(file);
                }
                ScriptCommand::OutputArch(arch) => {
                    self.module.script.output_arch = Some(arch);
                }
                ScriptCommand::OutputFormat(formats) => {
                    self.module.script.output_format = formats;
                }
                ScriptCommand::Phdrs(specs) => {
                    self.module.script.phdr_specs = specs;
                    self.module.script.has_phdrs_cmd = true;
                }
                ScriptCommand::Memory(descs) => {
                    for desc in descs {
                        match ScriptMemoryRegion::new(desc) {
                            Ok(region) => self.module.script.memory_regions.push(region),
                            Err(e) => self.module.raise(e),
                        }
                    }
                }
                ScriptCommand::RegionAlias { alias, region } => {
                    if let Err(e) = self.module.script.add_region_alias(&alias, &region) {
                        self.module.raise(e);
                    }
                }
                ScriptCommand::NoCrossRefs(names) => {
                    self.module.script.nocrossrefs.push(names);
                }
                ScriptCommand::Sections(body) => {
                    self.scan_sizeof_headers(&body);
                    self.mark_section_symbol_refs(&body);
                    self.module.script.sections_commands.extend(body);
                    self.module.script.has_sections_cmd = true;
                }
                ScriptCommand::Assignment(assignment) => {
                    if assignment.expr.has_sizeof_headers() {
                        self.module.headers_loaded = true;
                        self.module.script.sizeof_headers_seen = true;
                    }
                    let mut symbols = Vec::new();
                    assignment.expr.get_symbols(&mut symbols);
                    for symbol in symbols {
                        self.module.pool.mark_referenced(&symbol);
                    }
                    self.module.script.outside_assignments.push(assignment);
                }
                ScriptCommand::Assert(expr) => {
                    self.module.script.asserts.push(expr);
                }
                ScriptCommand::Plugin(cmd) => {
                    log::info!(
                        "script requests plugin `{}' of type `{}' ({origin})",
                        cmd.name,
                        cmd.plugin_type
                    );
                    self.module.script.plugins.push(cmd);
                }
            }
        }
        Ok(())
    }

    /// Any syntactic `SIZEOF_HEADERS` forces header loading; expression
    /// symbols become references so `PROVIDE` and boundary symbols fire.
    fn scan_sizeof_headers(&mut self, body: &[SectionsCommand]) {
        let mut found = false;
        let mut visit_expr = |expr: &crate::script::Expression| {
            if expr.has_sizeof_headers() {
                found = true;
            }
        };
        for command in body {
            match command {
                SectionsCommand::Assignment(a) => visit_expr(&a.expr),
                SectionsCommand::Assert(e) => visit_expr(e),
                SectionsCommand::OutputSect(desc) => {
                    if let Some(e) = &desc.address {
                        visit_expr(e);
                    }
                    if let Some(e) = &desc.at {
                        visit_expr(e);
                    }
                    for cmd in &desc.commands {
                        match cmd {
                            crate::script::OutputSectCommand::Assignment(a) => {
                                visit_expr(&a.expr)
                            }
                            crate::script::OutputSectCommand::Data { expr, .. } => {
                                visit_expr(expr)
                            }
                            crate::script::OutputSectCommand::Assert(e) => visit_expr(e),
                            _ => {}
                        }
                    }
                }
                SectionsCommand::Entry(_) => {}
            }
        }
        if found {
            self.module.headers_loaded = true;
            self.module.script.sizeof_headers_seen = true;
        }
    }

    fn mark_section_symbol_refs(&mut self, body: &[SectionsCommand]) {
        let mut symbols = Vec::new();
        for command in body {
            match command {
                SectionsCommand::Assignment(a) => a.expr.get_symbols(&mut symbols),
                SectionsCommand::Assert(e) => e.get_symbols(&mut symbols),
                SectionsCommand::OutputSect(desc) => {
                    for cmd in &desc.commands {
                        match cmd {
                            crate::script::OutputSectCommand::Assignment(a) => {
                                a.expr.get_symbols(&mut symbols)
                            }
                            crate::script::OutputSectCommand::Data { expr, .. } => {
                                expr.get_symbols(&mut symbols)
                            }
                            _ => {}
                        }
                    }
                }
                SectionsCommand::Entry(_) => {}
            }
        }
        for symbol in symbols {
            self.module.pool.mark_referenced(&symbol);
        }
    }

    // ----- phase 2: normalize -------------------------------------------

    fn normalize(&mut self) -> Result<()> {
        // expand the worklist sequentially (scripts can add inputs),
        // collecting ELF files for the parallel parse
        let mut elf_files: Vec<(PathBuf, Vec<u8>)> = Vec::new();
        let mut index = 0;
        while index < self.pending.len() {
            let request = self.pending[index].clone();
            index += 1;
            let path = match request {
                InputRequest::File(path) => path,
                InputRequest::Library(name) => search::find_library(&self.module.config, &name)?,
                InputRequest::StartGroup | InputRequest::EndGroup => continue,
            };
            let bytes = read_file(&path)?;
            self.content_hasher.update(&bytes);
            match identify_bytes(&bytes) {
                FileFormat::Elf => elf_files.push((path, bytes)),
                FileFormat::Archive | FileFormat::ThinArchive => {
                    let parsed = archive::parse(&path, &bytes)?;
                    if self.module.config.trace {
                        log::info!("{}", path.display());
                    }
                    self.archives.push(LoadedArchive {
                        path,
                        data: bytes,
                        archive: parsed,
                        extracted: HashSet::new(),
                    });
                }
                FileFormat::Bitcode => {
                    self.module.raise(DiagnosticEntry::error(
                        DiagId::ERROR_BITCODE_UNSUPPORTED,
                        vec![path.display().to_string()],
                    ));
                }
                FileFormat::LinkerScript => {
                    let text = String::from_utf8_lossy(&bytes).into_owned();
                    self.activate_script(&path.display().to_string(), &text)?;
                }
            }
        }
        // one task per file; results merge serially in command-line order
        let cancel = CancelFlag::new();
        let threads = self.module.config.effective_threads();
        let parsed = run_indexed(threads, elf_files.len(), &cancel, |i| {
            let (path, bytes) = &elf_files[i];
            reader::parse_elf(path, bytes)
        });
        for slot in parsed {
            let Some(result) = slot else { continue };
            match result {
                Ok(object) => {
                    if self.module.config.trace {
                        log::info!("{}", object.display_name());
                    }
                    if let Err(e) = self.module.add_parsed_object(object) {
                        self.module.raise(e);
                    }
                }
                Err(e) => self.module.raise(e),
            }
        }
        if let Some(patch_base) = self.module.config.patch_base.clone() {
            if self.module.config.patch_enable {
                let bytes = read_file(&patch_base)?;
                let object = reader::parse_elf(&patch_base, &bytes)?;
                if let Err(e) = self.module.add_parsed_object(object) {
                    self.module.raise(e);
                }
            }
        }
        let target = crate::target::lookup(self.module.machine, self.module.class);
        match target {
            Some(t) => self.target = Some(t),
            None => {
                return Err(DiagnosticEntry::fatal(
                    DiagId::ERROR_INCOMPATIBLE_MACHINE,
                    vec![
                        self.module.config.output.display().to_string(),
                        self.module.machine.name().to_string(),
                        "no backend".to_string(),
                    ],
                ));
            }
        }
        Ok(())
    }

    // ----- phase 3: resolve ---------------------------------------------

    fn resolve(&mut self) -> Result<()> {
        self.extract_archives();
        if let Some(path) = self.module.config.version_script.clone() {
            let bytes = read_file(&path)?;
            self.content_hasher.update(&bytes);
            let script = VersionScript::parse(&String::from_utf8_lossy(&bytes))?;
            script.apply(&mut self.module.pool);
        }
        if let Some(path) = self.module.config.dynamic_list.clone() {
            let bytes = read_file(&path)?;
            let list = DynamicList::parse(&String::from_utf8_lossy(&bytes))?;
            for id in self.module.pool.info_ids() {
                let name = self.module.pool.info(id).name.clone();
                if list.matches(&name) {
                    self.module.pool.info_mut(id).exported = true;
                }
            }
        }
        self.module.pool.compute_alias_chains();
        self.report_unresolved();
        self.module.set_state(LinkState::BeforeLayout);
        self.notify_state(LinkState::BeforeLayout, false);
        Ok(())
    }

    /// Pull archive members that define undefined referenced symbols,
    /// iterating to a fixpoint (the `GROUP` algorithm).
    fn extract_archives(&mut self) {
        loop {
            let undefined: Vec<String> = self
                .module
                .pool
                .undefined_references()
                .into_iter()
                .map(|id| self.module.pool.info(id).name.clone())
                .collect();
            if undefined.is_empty() {
                break;
            }
            let mut extracted_any = false;
            for arch_index in 0..self.archives.len() {
                for name in &undefined {
                    let member = self.archives[arch_index].archive.member_for_symbol(name);
                    let Some(member_idx) = member else { continue };
                    if self.archives[arch_index].extracted.contains(&member_idx) {
                        continue;
                    }
                    self.archives[arch_index].extracted.insert(member_idx);
                    extracted_any = true;
                    self.extract_member(arch_index, member_idx);
                }
            }
            if !extracted_any {
                break;
            }
        }
    }

    fn extract_member(&mut self, arch_index: usize, member_idx: usize) {
        let (path, member_name, bytes) = {
            let arch = &self.archives[arch_index];
            let member = &arch.archive.members[member_idx];
            let bytes = match member.range {
                Some((start, end)) => arch.data[start..end].to_vec(),
                None => {
                    // thin archive: the member is an external file
                    let member_path = arch.archive.thin_member_path(&arch.path, member);
                    match read_file(&member_path) {
                        Ok(b) => b,
                        Err(e) => {
                            self.module.raise(e);
                            return;
                        }
                    }
                }
            };
            (arch.path.clone(), member.name.clone(), bytes)
        };
        if self.module.config.trace {
            log::info!("{}({member_name})", path.display());
        }
        match reader::parse_elf(&path, &bytes) {
            Ok(mut object) => {
                object.member_name = Some(member_name);
                if let Err(e) = self.module.add_parsed_object(object) {
                    self.module.raise(e);
                }
            }
            Err(e) => self.module.raise(e),
        }
    }

    /// The input that references a still-undefined name, for the report.
    fn referencing_input(&self, name: &str) -> String {
        for (_, section) in self.module.sections.iter() {
            for &rid in &section.relocs {
                let sym = self.module.pool.symbol(self.module.relocs[rid].symbol);
                if sym.name == name {
                    return self.module.inputs[section.owner].display_name();
                }
            }
        }
        "<command line>".to_string()
    }

    fn report_unresolved(&mut self) {
        use crate::config::UnresolvedPolicy;
        let policy = self.module.config.unresolved;
        if matches!(
            policy,
            UnresolvedPolicy::IgnoreAll | UnresolvedPolicy::IgnoreInObjectFiles
        ) {
            return;
        }
        // shared objects may leave imports undefined
        if self.module.config.kind == OutputKind::Dyn {
            return;
        }
        let undefined: Vec<String> = self
            .module
            .pool
            .undefined_references()
            .into_iter()
            .filter(|&id| {
                let info = self.module.pool.info(id);
                info.binding != crate::symbol::SymbolBinding::Weak
                    && !info.name.starts_with("__start_")
                    && !info.name.starts_with("__stop_")
                    && Some(info.name.as_str()) != self.module.entry_name.as_deref()
            })
            .map(|id| self.module.pool.info(id).name.clone())
            .collect();
        for name in undefined {
            let from = self.referencing_input(&name);
            self.module.raise(DiagnosticEntry::error(
                DiagId::UNDEFINED_REFERENCE,
                vec![name, from],
            ));
        }
    }

    // ----- phase 5: layout ----------------------------------------------

    fn layout(&mut self) -> Result<()> {
        let Some(target) = self.target.take() else {
            return Err(DiagnosticEntry::new(
                DiagId::ERROR_WRONG_STATE,
                DiagnosticKind::InternalError,
                vec!["layout".into(), self.module.state().name().into()],
            ));
        };
        let result = self.layout_with(target.as_ref());
        self.target = Some(target);
        result
    }

    /// Materialize common symbols as zero-filled fragments of the
    /// internal common input; the rule engine then routes them like any
    /// `.bss` content. `--no-define-common` leaves them common.
    fn allocate_commons(&mut self) {
        if self.module.config.no_define_common {
            return;
        }
        for id in self.module.pool.info_ids() {
            let (name, size, align, ty) = {
                let info = self.module.pool.info(id);
                if !info.is_common() {
                    continue;
                }
                (
                    info.name.clone(),
                    info.size.max(1),
                    info.common_align.max(1),
                    info.ty,
                )
            };
            let section = self.module.internal_section(
                InternalInputKind::Common,
                ".bss",
                crate::elf::SHT_NOBITS,
                SectionFlags::ALLOC | SectionFlags::WRITE,
                align,
            );
            let frag = self.module.append_fragment(
                section,
                align,
                FragmentKind::Fill {
                    size,
                    pattern: 0,
                    pattern_size: 0,
                },
            );
            let owner = self.module.sections[section].owner;
            self.module.pool.define_in_section(
                owner,
                &name,
                section,
                Some(crate::fragment::FragmentRef { frag, offset: 0 }),
                0,
                ty,
                false,
            );
            self.module.pool.info_mut(id).size = size;
        }
    }

    fn layout_with(&mut self, target: &dyn TargetInfo) -> Result<()> {
        self.allocate_commons();
        gc::run(&mut self.module);
        self.module.set_state(LinkState::CreatingSections);
        section_map::build_and_match(&mut self.module);
        for plugin in &mut self.plugins {
            let mut wrapper = LinkerWrapper::new(&mut self.module, &mut self.reloc_hooks);
            if let Err(e) = plugin.on_sections_matched(&mut wrapper) {
                let name = plugin.name().to_string();
                self.module.raise(DiagnosticEntry::error(
                    DiagId::ERROR_PLUGIN_FAILED,
                    vec![name, e.message()],
                ));
            }
        }
        merge::run(&mut self.module);
        if self.module.config.kind != OutputKind::Relocatable {
            scan::run(&mut self.module, target);
        }
        check_nocrossrefs(&self.module);
        crate::emit::dynamic::prepare(&mut self.module, target);
        section_map::match_new_sections(&mut self.module);
        // two passes so the header-size estimate settles on the real
        // program-header count
        crate::layout::assign_addresses(&mut self.module)?;
        crate::layout::assign_addresses(&mut self.module)?;
        if self.module.config.kind != OutputKind::Relocatable
            && self.module.config.relax
            && target.supports_relaxation()
        {
            for _ in 0..16 {
                let deleted = relax_pass(&mut self.module, &mut self.relax_stats);
                if deleted == 0 {
                    break;
                }
                crate::layout::assign_addresses(&mut self.module)?;
            }
            log::debug!(
                "relaxation: {} bytes deleted, {} frustrated, {} passes",
                self.relax_stats.bytes_deleted,
                self.relax_stats.bytes_frustrated,
                self.relax_stats.passes
            );
        }
        self.module.set_state(LinkState::AfterLayout);
        self.notify_state(LinkState::AfterLayout, false);
        // plugin relocation hooks run before application
        if !self.reloc_hooks.is_empty() {
            for rid in self.module.relocs.indices().collect::<Vec<_>>() {
                for hook in &self.reloc_hooks {
                    hook(&mut self.module.relocs[rid]);
                }
            }
        }
        if self.module.config.kind != OutputKind::Relocatable {
            apply::run(&mut self.module, target);
        }
        Ok(())
    }

    // ----- phase 6: emit ------------------------------------------------

    fn emit(&mut self) -> Result<()> {
        let Some(target) = self.target.take() else {
            return Err(DiagnosticEntry::new(
                DiagId::ERROR_WRONG_STATE,
                DiagnosticKind::InternalError,
                vec!["emit".into(), self.module.state().name().into()],
            ));
        };
        let image = crate::emit::run(&mut self.module, target.as_ref());
        self.target = Some(target);
        let image = image?;
        if self.module.diag.has_failure() {
            // never commit a failed link's output
            return Ok(());
        }
        let output = self.module.config.output.clone();
        write_output(&output, &image)?;
        self.image = Some(image);
        if let Some(symdef) = self.module.config.symdef_file.clone() {
            crate::emit::symdef::write(&self.module, &symdef)?;
        }
        Ok(())
    }
}

fn write_output(path: &Path, image: &[u8]) -> Result<()> {
    std::fs::write(path, image).map_err(|e| {
        DiagnosticEntry::fatal(
            DiagId::ERROR_OUTPUT_WRITE,
            vec![path.display().to_string(), e.to_string()],
        )
    })?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755));
    }
    Ok(())
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linker_shape() {
        let linker = Linker::new(LinkConfig::builder().build());
        assert_eq!(linker.module().state(), LinkState::Unknown);
        assert!(linker.image().is_none());
    }

    #[test]
    fn test_content_hash_changes_with_script() {
        let mut a = Linker::new(
            LinkConfig::builder()
                .script_text("SECTIONS { }".to_string())
                .build(),
        );
        let mut b = Linker::new(
            LinkConfig::builder()
                .script_text("SECTIONS { . = 0x1000; }".to_string())
                .build(),
        );
        a.prepare().unwrap();
        b.prepare().unwrap();
        assert_ne!(a.content_hash(), b.content_hash());
        // identical invocations hash identically
        let mut c = Linker::new(
            LinkConfig::builder()
                .script_text("SECTIONS { }".to_string())
                .build(),
        );
        c.prepare().unwrap();
        assert_eq!(a.content_hash(), c.content_hash());
    }
}

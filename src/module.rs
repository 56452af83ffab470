//! The `Module`: root aggregate of one link.
//!
//! Owns the name pool, the input/section/fragment/relocation arenas, the
//! linker-script state, the section map and the lifecycle state. Exactly
//! one module exists per link; phases receive it mutably and advance its
//! state monotonically.

use crate::config::LinkConfig;
use crate::diag::{DiagId, DiagnosticEngine, DiagnosticEntry, DiagnosticKind, Result};
use crate::elf::{self, ElfClass, ElfEndian, ElfMachine, SectionFlags};
use crate::fragment::{Fragment, FragmentId, FragmentKind, FragmentRef};
use crate::input::{
    InputFile, InputId, InputKind, InternalInputKind, ParsedObject, ParsedSymbol,
};
use crate::object::section_map::SectionMap;
use crate::reloc::{DynReloc, RelocId, Relocation};
use crate::script::ScriptState;
use crate::section::{Section, SectionId, SectionKind};
use crate::support::arena::Arena;
use crate::symbol::name_pool::{NamePool, ResolveError, SymbolInput};
use crate::symbol::{ResolveId, SymbolBinding, SymbolDesc, SymbolId, SymbolType, Visibility};
use std::collections::HashMap;

/// Lifecycle of a link. Advances monotonically; operations that require a
/// given state fail when invoked in another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LinkState {
    Unknown,
    Initializing,
    BeforeLayout,
    CreatingSections,
    AfterLayout,
}

impl LinkState {
    /// Name used in diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            LinkState::Unknown => "unknown",
            LinkState::Initializing => "initializing",
            LinkState::BeforeLayout => "before-layout",
            LinkState::CreatingSections => "creating-sections",
            LinkState::AfterLayout => "after-layout",
        }
    }
}

/// A synthesized program header (segment) of the output.
#[derive(Debug, Clone)]
pub struct OutputSegment {
    pub p_type: u32,
    pub flags: elf::SegmentFlags,
    /// Output sections in the segment, in address order
    pub sections: Vec<SectionId>,
    /// Script `PHDRS` name when declared there
    pub name: Option<String>,
    pub vaddr: u64,
    pub paddr: u64,
    pub offset: u64,
    pub filesz: u64,
    pub memsz: u64,
    pub align: u64,
    /// `FILEHDR` requested
    pub has_filehdr: bool,
    /// `PHDRS` requested
    pub has_phdrs: bool,
}

impl OutputSegment {
    pub fn new(p_type: u32) -> Self {
        OutputSegment {
            p_type,
            flags: elf::SegmentFlags::R,
            sections: Vec::new(),
            name: None,
            vaddr: 0,
            paddr: 0,
            offset: 0,
            filesz: 0,
            memsz: 0,
            align: 1,
            has_filehdr: false,
            has_phdrs: false,
        }
    }
}

/// The root aggregate.
pub struct Module {
    pub config: LinkConfig,
    pub diag: DiagnosticEngine,
    pub inputs: Arena<InputId, InputFile>,
    pub sections: Arena<SectionId, Section>,
    pub fragments: Arena<FragmentId, Fragment>,
    pub relocs: Arena<RelocId, Relocation>,
    pub pool: NamePool,
    pub script: ScriptState,
    pub section_map: SectionMap,
    state: LinkState,
    internal_inputs: HashMap<InternalInputKind, InputId>,
    /// Internal sections by role and name
    internal_sections: HashMap<(InternalInputKind, String), SectionId>,
    /// Resolved output identity
    pub class: ElfClass,
    pub endian: ElfEndian,
    pub machine: ElfMachine,
    pub e_flags: u32,
    target_identity_set: bool,
    /// A shared library participates: executables gain dynamic structures
    pub needs_dynamic: bool,
    /// Dynamic relocations to emit
    pub dyn_relocs: Vec<DynReloc>,
    /// Laid-out segments
    pub segments: Vec<OutputSegment>,
    /// `SIZEOF_HEADERS` (or header PHDRs) forced headers into the image
    pub headers_loaded: bool,
    /// Resolved entry symbol name
    pub entry_name: Option<String>,
    /// COMDAT signatures already kept, by winning input
    comdat_signatures: HashMap<String, InputId>,
    /// TLS local-dynamic module-id slot, shared by every LD access
    pub tls_ld_slot: Option<FragmentId>,
    /// GOT slots by resolved symbol and slot kind; keyed by identity so
    /// parallel scans reserve the same slot a serial scan would
    pub got_slots: HashMap<(ResolveId, crate::fragment::GotSlotKind), FragmentId>,
    /// GOT slots of local (unpooled) symbols
    pub local_got_slots: HashMap<SymbolId, FragmentId>,
    /// PLT entries by resolved symbol, with their index
    pub plt_slots: HashMap<ResolveId, (usize, FragmentId)>,
    /// GOTPLT slot backing each PLT entry
    pub gotplt_slots: HashMap<ResolveId, FragmentId>,
    /// Merge-pass remapping: (input section, input offset) → offset in
    /// the merged output fragment
    pub merge_map: HashMap<(SectionId, u64), (FragmentId, u64)>,
}

impl Module {
    /// A fresh module for one link.
    pub fn new(config: LinkConfig) -> Self {
        let mut module = Module {
            class: config.class.unwrap_or(ElfClass::Elf32),
            endian: config.endian.unwrap_or(ElfEndian::Little),
            machine: config.machine.unwrap_or(ElfMachine::RiscV),
            target_identity_set: config.machine.is_some(),
            config,
            diag: DiagnosticEngine::new(),
            inputs: Arena::new(),
            sections: Arena::new(),
            fragments: Arena::new(),
            relocs: Arena::new(),
            pool: NamePool::new(),
            script: ScriptState::default(),
            section_map: SectionMap::default(),
            state: LinkState::Unknown,
            internal_inputs: HashMap::new(),
            internal_sections: HashMap::new(),
            e_flags: 0,
            needs_dynamic: false,
            dyn_relocs: Vec::new(),
            segments: Vec::new(),
            headers_loaded: false,
            entry_name: None,
            comdat_signatures: HashMap::new(),
            tls_ld_slot: None,
            got_slots: HashMap::new(),
            local_got_slots: HashMap::new(),
            plt_slots: HashMap::new(),
            gotplt_slots: HashMap::new(),
            merge_map: HashMap::new(),
        };
        module
            .pool
            .set_allow_multiple_definition(module.config.allow_multiple_definition);
        for name in module.config.wrap.clone() {
            module.pool.add_wrap(name);
        }
        module
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Advance the state; regression is an internal error.
    pub fn set_state(&mut self, next: LinkState) {
        if next < self.state {
            self.diag.raise(DiagnosticEntry::new(
                DiagId::ERROR_WRONG_STATE,
                DiagnosticKind::InternalError,
                vec!["set_state".to_string(), self.state.name().to_string()],
            ));
            return;
        }
        self.state = next;
    }

    /// Fail unless the module is in `required`.
    pub fn require_state(&self, operation: &str, required: LinkState) -> Result<()> {
        if self.state != required {
            return Err(DiagnosticEntry::new(
                DiagId::ERROR_WRONG_STATE,
                DiagnosticKind::InternalError,
                vec![operation.to_string(), self.state.name().to_string()],
            ));
        }
        Ok(())
    }

    /// The internal input for `kind`, created on first use.
    pub fn internal_input(&mut self, kind: InternalInputKind) -> InputId {
        if let Some(&id) = self.internal_inputs.get(&kind) {
            return id;
        }
        let id = self.inputs.alloc(InputFile::internal(kind));
        self.internal_inputs.insert(kind, id);
        id
    }

    /// The internal section of `kind` named `name`, created on first use
    /// with the given type/flags/alignment.
    pub fn internal_section(
        &mut self,
        kind: InternalInputKind,
        name: &str,
        sh_type: u32,
        flags: SectionFlags,
        align: u64,
    ) -> SectionId {
        if let Some(&id) = self.internal_sections.get(&(kind, name.to_string())) {
            return id;
        }
        let owner = self.internal_input(kind);
        let mut section = Section::new(name, SectionKind::Regular, owner);
        section.sh_type = sh_type;
        section.flags = flags;
        section.align = align;
        section.live = true;
        section.retained = true;
        let id = self.sections.alloc(section);
        self.inputs[owner].sections.push(id);
        self.internal_sections.insert((kind, name.to_string()), id);
        id
    }

    /// Append a fragment to a section, keeping both sides consistent.
    pub fn append_fragment(&mut self, section: SectionId, align: u64, kind: FragmentKind) -> FragmentId {
        let frag = Fragment::new(section, align, kind);
        let size = frag.size();
        let id = self.fragments.alloc(frag);
        let sec = &mut self.sections[section];
        sec.fragments.push(id);
        sec.size += size;
        sec.align = sec.align.max(align);
        id
    }

    /// Whether the output will carry dynamic structures.
    pub fn is_dynamic_link(&self) -> bool {
        self.config.is_dynamic() || (self.needs_dynamic && !self.config.is_static)
    }

    /// Adopt the target identity from the first real ELF input, or verify
    /// compatibility for later ones.
    fn merge_target_identity(&mut self, parsed: &ParsedObject) -> Result<()> {
        if !self.target_identity_set {
            self.class = parsed.class;
            self.endian = parsed.endian;
            self.machine = parsed.machine;
            self.e_flags = parsed.e_flags;
            self.target_identity_set = true;
            return Ok(());
        }
        if parsed.machine != self.machine || parsed.class != self.class {
            return Err(DiagnosticEntry::fatal(
                DiagId::ERROR_INCOMPATIBLE_MACHINE,
                vec![
                    parsed.display_name(),
                    parsed.machine.name().to_string(),
                    self.machine.name().to_string(),
                ],
            ));
        }
        Ok(())
    }

    /// Merge one parsed input into the module: allocate its input slot,
    /// sections and fragments, deduplicate COMDAT groups, resolve its
    /// symbols into the pool and attach its relocations. This is the
    /// serial half of the normalize phase; call order must follow
    /// command-line order.
    pub fn add_parsed_object(&mut self, parsed: ParsedObject) -> Result<InputId> {
        match parsed.kind {
            InputKind::SharedObject => return self.add_shared_object(parsed),
            InputKind::Executable => return self.add_patch_base(parsed),
            _ => {}
        }
        self.merge_target_identity(&parsed)?;
        let ordinal = self.inputs.len();
        let display = parsed.display_name();
        let mut file = InputFile::new(parsed.path.clone(), InputKind::Object, ordinal);
        file.member_name = parsed.member_name.clone();
        file.class = Some(parsed.class);
        file.endian = Some(parsed.endian);
        file.machine = Some(parsed.machine);
        file.e_flags = parsed.e_flags;
        let input_id = self.inputs.alloc(file);

        // sections, one arena slot per header entry
        let mut by_index: Vec<SectionId> = Vec::with_capacity(parsed.sections.len());
        for psec in &parsed.sections {
            let flags = SectionFlags::from_bits_retain(psec.flags);
            let kind = Section::classify(&psec.name, psec.sh_type, flags);
            let mut section = Section::new(psec.name.clone(), kind, input_id);
            section.sh_type = psec.sh_type;
            section.flags = flags;
            section.align = psec.addralign.max(1);
            section.entsize = psec.entsize;
            section.info = psec.info;
            section.input_index = psec.index;
            section.size = psec.size;
            section.retained = flags.contains(SectionFlags::GNU_RETAIN);
            let id = self.sections.alloc(section);
            by_index.push(id);
            self.inputs[input_id].sections.push(id);
        }
        // resolve sh_link now that every header has a slot
        for (psec, &id) in parsed.sections.iter().zip(&by_index) {
            if let Some(&link) = by_index.get(psec.link as usize) {
                if psec.link != 0 {
                    self.sections[id].link = Some(link);
                }
            }
        }
        // content fragments
        for (psec, &id) in parsed.sections.iter().zip(&by_index) {
            let placeable = matches!(
                self.sections[id].kind,
                SectionKind::Regular
                    | SectionKind::MergeStr
                    | SectionKind::EhFrame
                    | SectionKind::Note
                    | SectionKind::StackNote
                    | SectionKind::Debug
                    | SectionKind::Target
            );
            if !placeable {
                continue;
            }
            let align = self.sections[id].align;
            let kind = match &psec.data {
                Some(bytes) => FragmentKind::Region { data: bytes.clone() },
                None => FragmentKind::Fill {
                    size: psec.size,
                    pattern: 0,
                    pattern_size: 0,
                },
            };
            // size is recomputed by append
            self.sections[id].size = 0;
            self.append_fragment(id, align, kind);
        }
        // COMDAT deduplication: first signature wins
        for group in &parsed.groups {
            let keep = match self.comdat_signatures.get(&group.signature) {
                Some(_) => false,
                None => {
                    self.comdat_signatures
                        .insert(group.signature.clone(), input_id);
                    true
                }
            };
            if keep {
                continue;
            }
            for &member in &group.members {
                if let Some(&sid) = by_index.get(member as usize) {
                    self.sections[sid].kind = SectionKind::Ignore;
                }
            }
            if let Some(&gid) = by_index.get(group.index) {
                self.sections[gid].kind = SectionKind::Ignore;
            }
        }
        // symbols
        let mut symbol_ids: Vec<Option<SymbolId>> = vec![None; parsed.symbols.len()];
        for (index, psym) in parsed.symbols.iter().enumerate() {
            if index == 0 {
                continue;
            }
            let id = self.add_object_symbol(input_id, &display, psym, &by_index)?;
            symbol_ids[index] = id;
        }
        self.inputs[input_id].symbols = symbol_ids;
        // relocations
        for prel in &parsed.relocs {
            let Some(&target_sid) = by_index.get(prel.target_index) else {
                continue;
            };
            if let Some(&own) = by_index.get(prel.own_index) {
                self.sections[own].fixup_target = Some(target_sid);
            }
            let Some(&frag) = self.sections[target_sid].fragments.first() else {
                continue;
            };
            for entry in &prel.entries {
                let Some(Some(symbol)) = self
                    .inputs[input_id]
                    .symbols
                    .get(entry.sym_index as usize)
                    .copied()
                else {
                    continue;
                };
                let reloc = Relocation {
                    rtype: entry.rel_type,
                    symbol,
                    target: FragmentRef {
                        frag,
                        offset: entry.offset,
                    },
                    addend: entry.addend,
                    paired: None,
                    section: target_sid,
                };
                let rid = self.relocs.alloc(reloc);
                self.sections[target_sid].relocs.push(rid);
            }
        }
        Ok(input_id)
    }

    fn add_object_symbol(
        &mut self,
        input_id: InputId,
        display: &str,
        psym: &ParsedSymbol,
        by_index: &[SectionId],
    ) -> Result<Option<SymbolId>> {
        let sym = &psym.sym;
        let ty = SymbolType::from_elf(sym.sym_type());
        if ty == SymbolType::File {
            return Ok(None);
        }
        let binding = SymbolBinding::from_elf(sym.binding());
        let (desc, section, special) = match sym.shndx {
            elf::SHN_UNDEF => (SymbolDesc::Undefined, None, None),
            elf::SHN_ABS => (SymbolDesc::Absolute, None, Some(elf::SHN_ABS)),
            elf::SHN_COMMON => (SymbolDesc::Common, None, Some(elf::SHN_COMMON)),
            ndx if (ndx as usize) < by_index.len() => {
                let sid = by_index[ndx as usize];
                if self.sections[sid].is_discarded() {
                    // a definition in a deduplicated COMDAT member binds
                    // to the kept copy instead
                    (SymbolDesc::Undefined, None, None)
                } else {
                    let desc = if ty == SymbolType::IFunc {
                        SymbolDesc::IFunc
                    } else {
                        SymbolDesc::Defined
                    };
                    (desc, Some(sid), None)
                }
            }
            _ => (SymbolDesc::Undefined, None, None),
        };
        let frag_ref = section.and_then(|sid| {
            self.sections[sid]
                .fragments
                .first()
                .map(|&frag| FragmentRef {
                    frag,
                    offset: sym.value,
                })
        });
        let input = SymbolInput {
            name: &psym.name,
            ty,
            desc,
            binding,
            visibility: Visibility::from_elf(sym.other),
            size: sym.size,
            value: sym.value,
            section,
            frag_ref,
            special_shndx: special,
            from_dynamic: false,
            common_align: if desc == SymbolDesc::Common {
                sym.value.max(1)
            } else {
                0
            },
        };
        match self.pool.add_symbol(input_id, input) {
            Ok(id) => Ok(Some(id)),
            Err(ResolveError::Duplicate { name, old_source }) => {
                let old = old_source
                    .map(|id| self.inputs[id].display_name())
                    .unwrap_or_else(|| "<unknown>".to_string());
                Err(DiagnosticEntry::error(
                    DiagId::MULTIPLE_DEFINITION,
                    vec![name, old, display.to_string()],
                ))
            }
        }
    }

    fn add_shared_object(&mut self, parsed: ParsedObject) -> Result<InputId> {
        let ordinal = self.inputs.len();
        let mut file = InputFile::new(parsed.path.clone(), InputKind::SharedObject, ordinal);
        file.soname = parsed.soname.clone();
        file.needed = parsed.needed.clone();
        file.class = Some(parsed.class);
        file.endian = Some(parsed.endian);
        file.machine = Some(parsed.machine);
        let input_id = self.inputs.alloc(file);
        self.needs_dynamic = true;
        for psym in parsed.symbols.iter().skip(1) {
            let sym = &psym.sym;
            if sym.shndx == elf::SHN_UNDEF {
                // undefined symbols of a shared library are satisfied at
                // load time; they impose nothing on this link
                continue;
            }
            let binding = SymbolBinding::from_elf(sym.binding());
            if binding == SymbolBinding::Local {
                continue;
            }
            let input = SymbolInput {
                name: &psym.name,
                ty: SymbolType::from_elf(sym.sym_type()),
                desc: SymbolDesc::Defined,
                binding,
                visibility: Visibility::from_elf(sym.other),
                size: sym.size,
                value: sym.value,
                section: None,
                frag_ref: None,
                special_shndx: None,
                from_dynamic: true,
                common_align: 0,
            };
            if let Err(ResolveError::Duplicate { .. }) = self.pool.add_symbol(input_id, input) {
                // cannot happen: dynamic definitions never outrank
            }
        }
        Ok(input_id)
    }

    fn add_patch_base(&mut self, parsed: ParsedObject) -> Result<InputId> {
        let ordinal = self.inputs.len();
        let mut file = InputFile::new(parsed.path.clone(), InputKind::Executable, ordinal);
        file.class = Some(parsed.class);
        file.endian = Some(parsed.endian);
        file.machine = Some(parsed.machine);
        let input_id = self.inputs.alloc(file);
        for psym in parsed.symbols.iter().skip(1) {
            let sym = &psym.sym;
            if sym.shndx == elf::SHN_UNDEF || psym.name.is_empty() {
                continue;
            }
            let binding = SymbolBinding::from_elf(sym.binding());
            if binding == SymbolBinding::Local {
                continue;
            }
            // pin at the linked address
            let input = SymbolInput {
                name: &psym.name,
                ty: SymbolType::from_elf(sym.sym_type()),
                desc: SymbolDesc::Absolute,
                binding: SymbolBinding::Weak,
                visibility: Visibility::from_elf(sym.other),
                size: sym.size,
                value: sym.value,
                section: None,
                frag_ref: None,
                special_shndx: Some(elf::SHN_ABS),
                from_dynamic: false,
                common_align: 0,
            };
            if let Err(ResolveError::Duplicate { .. }) =
                self.pool.add_symbol(input_id, input)
            {
                // weak patch anchors never collide fatally
            }
        }
        Ok(input_id)
    }

    /// The VMA of a fragment-relative reference; valid after address
    /// assignment.
    pub fn fragment_vma(&self, fref: FragmentRef) -> u64 {
        let frag = &self.fragments[fref.frag];
        let section = &self.sections[frag.owner];
        let base = section.out.as_ref().map(|o| o.addr).unwrap_or(0);
        base + frag.offset_or_zero() + fref.offset
    }

    /// The output file offset of a fragment-relative reference.
    pub fn fragment_file_offset(&self, fref: FragmentRef) -> u64 {
        let frag = &self.fragments[fref.frag];
        let section = &self.sections[frag.owner];
        let base = section.out.as_ref().map(|o| o.offset).unwrap_or(0);
        base + frag.offset_or_zero() + fref.offset
    }

    /// The post-layout value of a per-occurrence symbol.
    pub fn symbol_value(&self, id: SymbolId) -> u64 {
        let sym = self.pool.symbol(id);
        if sym.special_shndx == Some(elf::SHN_ABS) {
            return sym.value;
        }
        if let Some(fref) = sym.frag_ref {
            // merge-string pieces may have been re-homed
            if let Some(section) = sym.section {
                if let Some(&(frag, offset)) = self.merge_map.get(&(section, fref.offset)) {
                    return self.fragment_vma(FragmentRef { frag, offset });
                }
            }
            return self.fragment_vma(fref);
        }
        if let Some(section) = sym.section {
            let base = self.sections[section]
                .out
                .as_ref()
                .map(|o| o.addr)
                .unwrap_or(0);
            return base + sym.value;
        }
        sym.value
    }

    /// The value a relocation sees for its referenced symbol: resolved
    /// through the pool for linkable names, the local occurrence
    /// otherwise, 0 for an unresolved reference.
    pub fn symbol_value_of_reloc(&self, id: SymbolId) -> u64 {
        let sym = self.pool.symbol(id);
        match sym.resolve {
            Some(resolve) => {
                if self.pool.info(resolve).is_defined() {
                    self.resolve_value(resolve)
                } else {
                    0
                }
            }
            None => self.symbol_value(id),
        }
    }

    /// The post-layout value of a resolved name: the chosen definition's
    /// value, or 0 for an unresolved weak reference.
    pub fn resolve_value(&self, id: ResolveId) -> u64 {
        let info = self.pool.info(id);
        match info.out_symbol {
            Some(out) if info.is_defined() => self.symbol_value(out),
            _ => 0,
        }
    }

    /// Whether the section a symbol lives in survived the link (it was
    /// neither discarded nor garbage-collected).
    pub fn symbol_section_live(&self, id: SymbolId) -> bool {
        let sym = self.pool.symbol(id);
        match sym.section {
            Some(sid) => !self.sections[sid].is_discarded(),
            None => true,
        }
    }

    /// Raise `entry` and return whether the link can continue.
    pub fn raise(&self, entry: DiagnosticEntry) {
        self.diag.raise(entry);
    }

    /// `CONSTANT(MAXPAGESIZE)` for the current target.
    pub fn max_page_size(&self) -> u64 {
        if let Some(v) = self.config.max_page_size {
            return v;
        }
        match self.machine {
            ElfMachine::AArch64 => 0x1_0000,
            _ => 0x1000,
        }
    }

    /// `CONSTANT(COMMONPAGESIZE)` for the current target.
    pub fn common_page_size(&self) -> u64 {
        self.config
            .common_page_size
            .unwrap_or(0x1000)
            .min(self.max_page_size())
    }

    /// The default image base for the current target and output kind.
    pub fn image_base(&self) -> u64 {
        if let Some(base) = self.config.image_base {
            return base;
        }
        if self.config.is_pic() {
            return 0;
        }
        match self.machine {
            ElfMachine::X86_64 => 0x40_0000,
            _ => 0x1_0000,
        }
    }

    /// `SIZEOF_HEADERS`: the ELF header plus the program-header table.
    /// Uses the laid-out segment count once layout has produced one, the
    /// `PHDRS` declaration count before that, or an estimate.
    pub fn sizeof_headers(&self) -> u64 {
        let phnum = if !self.segments.is_empty() {
            self.segments.len() as u64
        } else if self.script.has_phdrs_cmd {
            self.script.phdr_specs.len() as u64
        } else {
            self.estimate_phdr_count()
        };
        self.class.ehdr_size() + phnum * self.class.phdr_size()
    }

    /// Conservative segment-count estimate for header sizing before
    /// layout: distinct permission classes of allocated output sections
    /// plus the non-load segments the configuration implies.
    pub fn estimate_phdr_count(&self) -> u64 {
        let mut perms: Vec<elf::SegmentFlags> = Vec::new();
        for (_, section) in self.sections.iter() {
            if !section.is_alloc() || section.is_discarded() {
                continue;
            }
            let f = section.segment_flags();
            if !perms.contains(&f) {
                perms.push(f);
            }
        }
        let mut count = perms.len().max(1) as u64;
        if self.is_dynamic_link() {
            // PT_PHDR, PT_INTERP, PT_DYNAMIC
            count += 3;
        }
        count += 1; // PT_GNU_STACK
        count
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_is_monotone() {
        let mut module = Module::new(LinkConfig::builder().build());
        assert_eq!(module.state(), LinkState::Unknown);
        module.set_state(LinkState::Initializing);
        module.set_state(LinkState::BeforeLayout);
        assert!(module
            .require_state("match-sections", LinkState::BeforeLayout)
            .is_ok());
        assert!(module
            .require_state("assign-addresses", LinkState::CreatingSections)
            .is_err());
        // regression raises an internal error
        module.set_state(LinkState::Initializing);
        assert!(module.diag.has_failure());
        assert_eq!(module.state(), LinkState::BeforeLayout);
    }

    #[test]
    fn test_internal_sections_are_unique() {
        let mut module = Module::new(LinkConfig::builder().build());
        let a = module.internal_section(
            InternalInputKind::Got,
            ".got",
            elf::SHT_PROGBITS,
            SectionFlags::ALLOC | SectionFlags::WRITE,
            8,
        );
        let b = module.internal_section(
            InternalInputKind::Got,
            ".got",
            elf::SHT_PROGBITS,
            SectionFlags::ALLOC | SectionFlags::WRITE,
            8,
        );
        assert_eq!(a, b);
        assert_eq!(module.inputs[module.sections[a].owner].display_name(), "<internal:got>");
    }

    #[test]
    fn test_add_tiny_object() {
        let data = crate::input::reader::fixtures::tiny_object();
        let parsed =
            crate::input::reader::parse_elf(std::path::Path::new("tiny.o"), &data).unwrap();
        let mut module = Module::new(LinkConfig::builder().build());
        let input = module.add_parsed_object(parsed).unwrap();
        assert_eq!(module.machine, ElfMachine::RiscV);
        assert_eq!(module.inputs[input].sections.len(), 5);
        let start = module.pool.find("_start").unwrap();
        assert!(start.is_defined());
        let undef = module.pool.find("undef_sym").unwrap();
        assert!(!undef.is_defined());
        assert!(undef.referenced);
    }
}

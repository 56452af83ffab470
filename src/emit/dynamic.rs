//! Dynamic-linking sections: `.dynamic`, `.dynsym`, `.dynstr`, `.hash`,
//! `.rela.dyn`, `.rela.plt` and `.interp`.
//!
//! `prepare` runs after the relocation scan and creates the sections with
//! their final sizes so layout can place them; `finalize` rewrites their
//! bytes once addresses are known. Sizes must not change between the two.

use crate::config::OutputKind;
use crate::elf::{self, write::ByteSink, SectionFlags};
use crate::input::InternalInputKind;
use crate::module::Module;
use crate::section::SectionId;
use crate::symbol::{ResolveId, SymbolBinding};
use crate::target::TargetInfo;
use std::collections::HashMap;

/// A simple string table accumulator.
#[derive(Debug, Default)]
pub struct StringTable {
    data: Vec<u8>,
    offsets: HashMap<String, u32>,
}

impl StringTable {
    /// A table with the leading NUL.
    pub fn new() -> Self {
        StringTable {
            data: vec![0],
            offsets: HashMap::new(),
        }
    }

    /// Intern `s`, returning its offset.
    pub fn add(&mut self, s: &str) -> u32 {
        if let Some(&off) = self.offsets.get(s) {
            return off;
        }
        let off = self.data.len() as u32;
        self.data.extend_from_slice(s.as_bytes());
        self.data.push(0);
        self.offsets.insert(s.to_string(), off);
        off
    }

    /// The table bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Current size.
    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    /// Whether only the leading NUL is present.
    pub fn is_empty(&self) -> bool {
        self.data.len() <= 1
    }
}

/// The ELF SysV hash function.
pub fn sysv_hash(name: &str) -> u32 {
    let mut h: u32 = 0;
    for &b in name.as_bytes() {
        h = h.wrapping_shl(4).wrapping_add(u32::from(b));
        let g = h & 0xf000_0000;
        if g != 0 {
            h ^= g >> 24;
        }
        h &= !g;
    }
    h
}

/// The dynamic symbols of the output, in a deterministic order: null
/// entry, then undefined imports, then exported definitions, both in
/// pool creation order.
pub fn dynsym_order(module: &Module) -> Vec<ResolveId> {
    let mut undefined = Vec::new();
    let mut exported = Vec::new();
    for (id, info) in module.pool.infos() {
        if info.binding == SymbolBinding::Local || info.forced_local {
            continue;
        }
        if info.from_dynamic && info.referenced {
            undefined.push(id);
            continue;
        }
        if !info.is_defined() {
            if info.referenced && info.binding != SymbolBinding::Weak {
                undefined.push(id);
            }
            continue;
        }
        if info.exported {
            exported.push(id);
        }
    }
    let mut out = undefined;
    out.extend(exported);
    out
}

/// Mark the symbols that must appear in `.dynsym`.
pub fn mark_exports(module: &mut Module) {
    let export_all = matches!(module.config.kind, OutputKind::Dyn | OutputKind::Pie)
        || module.config.export_dynamic;
    let explicit: Vec<String> = module.config.export_dynamic_symbols.clone();
    for id in module.pool.info_ids() {
        let info = module.pool.info(id);
        let name = info.name.clone();
        let eligible = info.is_defined()
            && !info.from_dynamic
            && !info.forced_local
            && info.visibility == crate::symbol::Visibility::Default
            && info.binding != SymbolBinding::Local;
        if !eligible {
            continue;
        }
        let wanted = export_all
            || explicit.iter().any(|n| *n == name)
            || !info.reserved.is_empty();
        if wanted {
            module.pool.info_mut(id).exported = true;
        }
    }
}

fn dyn_section(
    module: &mut Module,
    name: &str,
    sh_type: u32,
    flags: SectionFlags,
    align: u64,
    entsize: u64,
    size: u64,
) -> SectionId {
    let sid = module.internal_section(InternalInputKind::Dynamic, name, sh_type, flags, align);
    module.sections[sid].entsize = entsize;
    if module.sections[sid].fragments.is_empty() && size > 0 {
        module.append_fragment(
            sid,
            align,
            crate::fragment::FragmentKind::Region {
                data: vec![0u8; size as usize],
            },
        );
    }
    sid
}

/// Count of entries the `.dynamic` section will carry.
fn dynamic_entry_count(module: &Module) -> u64 {
    let mut n = 0u64;
    for (_, input) in module.inputs.iter() {
        if input.is_dynamic() {
            n += 1; // DT_NEEDED
        }
    }
    if module.config.soname.is_some() {
        n += 1;
    }
    // STRTAB SYMTAB STRSZ SYMENT HASH
    n += 5;
    if module.dyn_relocs.iter().any(|r| !r.is_plt) {
        n += 3; // RELA RELASZ RELAENT
    }
    if module.dyn_relocs.iter().any(|r| r.is_plt) {
        n += 4; // JMPREL PLTRELSZ PLTREL PLTGOT
    }
    if module.config.bsymbolic {
        n += 1;
    }
    if module.config.z_now {
        n += 1;
    }
    if module.config.kind == OutputKind::Pie {
        n += 1; // FLAGS_1
    }
    n + 1 // DT_NULL
}

/// Create the dynamic sections with their final sizes.
pub fn prepare(module: &mut Module, _target: &dyn TargetInfo) {
    if !module.is_dynamic_link() {
        return;
    }
    mark_exports(module);
    let class = module.class;
    let word = class.word_size();
    let dynsyms = dynsym_order(module);
    for (index, &id) in dynsyms.iter().enumerate() {
        module.pool.info_mut(id).dynsym_index = Some(index as u32 + 1);
    }
    let mut dynstr = StringTable::new();
    for &id in &dynsyms {
        dynstr.add(&module.pool.info(id).name.clone());
    }
    let needed: Vec<String> = module
        .inputs
        .iter()
        .filter(|(_, f)| f.is_dynamic())
        .map(|(_, f)| {
            f.soname
                .clone()
                .unwrap_or_else(|| f.path.display().to_string())
        })
        .collect();
    for name in &needed {
        dynstr.add(name);
    }
    if let Some(soname) = module.config.soname.clone() {
        dynstr.add(&soname);
    }
    if let Some(interp) = module.config.dynamic_linker.clone() {
        let sid = dyn_section(
            module,
            ".interp",
            elf::SHT_PROGBITS,
            SectionFlags::ALLOC,
            1,
            0,
            interp.len() as u64 + 1,
        );
        let _ = sid;
    }
    let sym_count = dynsyms.len() as u64 + 1;
    dyn_section(
        module,
        ".dynsym",
        elf::SHT_DYNSYM,
        SectionFlags::ALLOC,
        word,
        class.sym_size(),
        sym_count * class.sym_size(),
    );
    dyn_section(
        module,
        ".dynstr",
        elf::SHT_STRTAB,
        SectionFlags::ALLOC,
        1,
        0,
        dynstr.len(),
    );
    // SysV hash: nbucket, nchain, buckets, chains
    let nbucket = sym_count.next_power_of_two().max(1);
    dyn_section(
        module,
        ".hash",
        elf::SHT_HASH,
        SectionFlags::ALLOC,
        word,
        4,
        (2 + nbucket + sym_count) * 4,
    );
    let rela_dyn = module.dyn_relocs.iter().filter(|r| !r.is_plt).count() as u64;
    if rela_dyn > 0 {
        dyn_section(
            module,
            ".rela.dyn",
            elf::SHT_RELA,
            SectionFlags::ALLOC,
            word,
            class.rela_size(),
            rela_dyn * class.rela_size(),
        );
    }
    let rela_plt = module.dyn_relocs.iter().filter(|r| r.is_plt).count() as u64;
    if rela_plt > 0 {
        dyn_section(
            module,
            ".rela.plt",
            elf::SHT_RELA,
            SectionFlags::ALLOC,
            word,
            class.rela_size(),
            rela_plt * class.rela_size(),
        );
    }
    let entries = dynamic_entry_count(module);
    dyn_section(
        module,
        ".dynamic",
        elf::SHT_DYNAMIC,
        SectionFlags::ALLOC | SectionFlags::WRITE,
        word,
        word * 2,
        entries * word * 2,
    );
}

fn out_addr(module: &Module, name: &str) -> u64 {
    module
        .sections
        .iter()
        .find(|(_, s)| s.name == name && s.output_section.is_none() && s.out.is_some())
        .and_then(|(_, s)| s.out.as_ref().map(|o| o.addr))
        .unwrap_or(0)
}

fn out_size(module: &Module, name: &str) -> u64 {
    module
        .sections
        .iter()
        .find(|(_, s)| s.name == name && s.output_section.is_none() && s.out.is_some())
        .map(|(_, s)| s.size)
        .unwrap_or(0)
}

fn set_internal_bytes(module: &mut Module, name: &str, bytes: Vec<u8>) {
    let frag = module
        .sections
        .iter()
        .find(|(_, s)| {
            s.name == name
                && module.inputs[s.owner].kind
                    == crate::input::InputKind::Internal(InternalInputKind::Dynamic)
        })
        .and_then(|(_, s)| s.fragments.first().copied());
    if let Some(frag) = frag {
        if let crate::fragment::FragmentKind::Region { data } =
            &mut module.fragments[frag].kind
        {
            debug_assert_eq!(data.len(), bytes.len());
            *data = bytes;
        }
    }
}

/// Rewrite the dynamic sections' bytes with final addresses.
pub fn finalize(module: &mut Module, _target: &dyn TargetInfo) {
    if !module.is_dynamic_link() {
        return;
    }
    let class = module.class;
    let endian = module.endian;
    let dynsyms = dynsym_order(module);
    // .dynstr
    let mut dynstr = StringTable::new();
    let mut name_offsets: Vec<u32> = Vec::new();
    for &id in &dynsyms {
        let name = module.pool.info(id).name.clone();
        name_offsets.push(dynstr.add(&name));
    }
    let needed: Vec<String> = module
        .inputs
        .iter()
        .filter(|(_, f)| f.is_dynamic())
        .map(|(_, f)| {
            f.soname
                .clone()
                .unwrap_or_else(|| f.path.display().to_string())
        })
        .collect();
    let needed_offsets: Vec<u32> = needed.iter().map(|n| dynstr.add(n)).collect();
    let soname_offset = module
        .config
        .soname
        .clone()
        .map(|s| dynstr.add(&s));
    // .interp
    if let Some(interp) = module.config.dynamic_linker.clone() {
        let mut bytes = interp.into_bytes();
        bytes.push(0);
        set_internal_bytes(module, ".interp", bytes);
    }
    // .dynsym
    let mut sink = ByteSink::new(class, endian);
    crate::elf::write::write_sym(&mut sink, &elf::ElfSym::default());
    for (&id, &name_off) in dynsyms.iter().zip(&name_offsets) {
        let info = module.pool.info(id);
        let defined = info.is_defined() && !info.from_dynamic;
        let value = if defined { module.resolve_value(id) } else { 0 };
        let shndx = if defined { 1u16 } else { elf::SHN_UNDEF };
        let sym = elf::ElfSym {
            name: name_off,
            value,
            size: module.pool.info(id).size,
            info: elf::ElfSym::make_info(
                module.pool.info(id).binding.to_elf(),
                module.pool.info(id).ty.to_elf(),
            ),
            other: module.pool.info(id).visibility.to_elf(),
            shndx,
        };
        crate::elf::write::write_sym(&mut sink, &sym);
    }
    set_internal_bytes(module, ".dynsym", sink.into_bytes());
    set_internal_bytes(module, ".dynstr", dynstr.bytes().to_vec());
    // .hash
    let sym_count = dynsyms.len() as u64 + 1;
    let nbucket = sym_count.next_power_of_two().max(1);
    let mut buckets = vec![0u32; nbucket as usize];
    let mut chains = vec![0u32; sym_count as usize];
    for (i, &id) in dynsyms.iter().enumerate() {
        let sym_index = i as u32 + 1;
        let hash = sysv_hash(&module.pool.info(id).name);
        let bucket = (hash as u64 % nbucket) as usize;
        chains[sym_index as usize] = buckets[bucket];
        buckets[bucket] = sym_index;
    }
    let mut hash_sink = ByteSink::new(class, endian);
    hash_sink.put_u32(nbucket as u32);
    hash_sink.put_u32(sym_count as u32);
    for b in buckets {
        hash_sink.put_u32(b);
    }
    for c in chains {
        hash_sink.put_u32(c);
    }
    set_internal_bytes(module, ".hash", hash_sink.into_bytes());
    // relocation sections
    let dyn_relocs = module.dyn_relocs.clone();
    for is_plt in [false, true] {
        let mut sink = ByteSink::new(class, endian);
        for reloc in dyn_relocs.iter().filter(|r| r.is_plt == is_plt) {
            let offset = module.fragment_vma(reloc.place);
            let sym_index = reloc
                .sym
                .and_then(|id| module.pool.info(id).dynsym_index)
                .unwrap_or(0);
            let addend = match reloc.sym {
                // RELATIVE entries carry the link-time value
                None => relative_addend(module, reloc),
                Some(_) => reloc.addend,
            };
            crate::elf::write::write_rela(&mut sink, offset, sym_index, reloc.rtype, addend);
        }
        if !sink.is_empty() {
            let name = if is_plt { ".rela.plt" } else { ".rela.dyn" };
            set_internal_bytes(module, name, sink.into_bytes());
        }
    }
    // .dynamic
    let mut dsink = ByteSink::new(class, endian);
    let put = |sink: &mut ByteSink, tag: u64, value: u64| {
        sink.put_word(tag);
        sink.put_word(value);
    };
    for off in needed_offsets {
        put(&mut dsink, elf::DT_NEEDED, u64::from(off));
    }
    if let Some(off) = soname_offset {
        put(&mut dsink, elf::DT_SONAME, u64::from(off));
    }
    put(&mut dsink, elf::DT_STRTAB, out_addr(module, ".dynstr"));
    put(&mut dsink, elf::DT_SYMTAB, out_addr(module, ".dynsym"));
    put(&mut dsink, elf::DT_STRSZ, dynstr.len());
    put(&mut dsink, elf::DT_SYMENT, class.sym_size());
    put(&mut dsink, elf::DT_HASH, out_addr(module, ".hash"));
    if dyn_relocs.iter().any(|r| !r.is_plt) {
        put(&mut dsink, elf::DT_RELA, out_addr(module, ".rela.dyn"));
        put(&mut dsink, elf::DT_RELASZ, out_size(module, ".rela.dyn"));
        put(&mut dsink, elf::DT_RELAENT, class.rela_size());
    }
    if dyn_relocs.iter().any(|r| r.is_plt) {
        put(&mut dsink, elf::DT_JMPREL, out_addr(module, ".rela.plt"));
        put(&mut dsink, elf::DT_PLTRELSZ, out_size(module, ".rela.plt"));
        put(&mut dsink, elf::DT_PLTREL, elf::DT_RELA);
        put(&mut dsink, elf::DT_PLTGOT, out_addr(module, ".got.plt"));
    }
    if module.config.bsymbolic {
        put(&mut dsink, elf::DT_SYMBOLIC, 0);
    }
    if module.config.z_now {
        put(&mut dsink, elf::DT_BIND_NOW, 0);
    }
    if module.config.kind == OutputKind::Pie {
        put(&mut dsink, elf::DT_FLAGS_1, elf::DF_1_PIE);
    }
    put(&mut dsink, elf::DT_NULL, 0);
    // pad to the declared size
    let declared = out_size(module, ".dynamic");
    while dsink.len() < declared {
        dsink.put_word(elf::DT_NULL);
        dsink.put_word(0);
    }
    set_internal_bytes(module, ".dynamic", dsink.into_bytes());
}

/// The value a `RELATIVE` entry asks the loader to add the base to: the
/// link-time value already stored at the place.
fn relative_addend(module: &Module, reloc: &crate::reloc::DynReloc) -> i64 {
    module.fragment_vma(reloc.place) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sysv_hash_vectors() {
        assert_eq!(sysv_hash(""), 0);
        assert_eq!(sysv_hash("printf"), 0x077905a6);
        assert_eq!(sysv_hash("exit"), 0x0006cf04);
    }

    #[test]
    fn test_string_table_interning() {
        let mut tab = StringTable::new();
        let a = tab.add("alpha");
        let b = tab.add("beta");
        assert_eq!(tab.add("alpha"), a);
        assert_ne!(a, b);
        assert_eq!(&tab.bytes()[a as usize..a as usize + 5], b"alpha");
        assert_eq!(tab.bytes()[0], 0);
    }
}

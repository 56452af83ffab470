//! End-to-end links over synthetic relocatable objects.

use eld::config::{InputRequest, LinkConfig};
use eld::elf::{
    self,
    write::{self, ByteSink},
    ElfClass, ElfEndian, ElfHeader, ElfMachine, ElfSym, SectionHeader,
};
use eld::Linker;
use std::path::PathBuf;

/// A small relocatable-object builder over the crate's own encoders.
struct ObjBuilder {
    class: ElfClass,
    machine: ElfMachine,
    sections: Vec<(String, u32, u64, Vec<u8>, u64)>, // name, type, flags, body, align
    symbols: Vec<(String, ElfSym)>,
    relocs: Vec<(usize, Vec<elf::ElfRela>)>, // target section index (in self.sections)
}

impl ObjBuilder {
    fn new(machine: ElfMachine, class: ElfClass) -> Self {
        ObjBuilder {
            class,
            machine,
            sections: Vec::new(),
            symbols: Vec::new(),
            relocs: Vec::new(),
        }
    }

    fn section(&mut self, name: &str, flags: u64, body: &[u8], align: u64) -> usize {
        self.sections
            .push((name.to_string(), elf::SHT_PROGBITS, flags, body.to_vec(), align));
        self.sections.len() - 1
    }

    fn global_func(&mut self, name: &str, section: usize, value: u64, size: u64) {
        self.symbols.push((
            name.to_string(),
            ElfSym {
                name: 0,
                value,
                size,
                info: ElfSym::make_info(elf::STB_GLOBAL, elf::STT_FUNC),
                other: 0,
                shndx: (section + 1) as u16,
            },
        ));
    }

    fn undef(&mut self, name: &str) {
        self.symbols.push((
            name.to_string(),
            ElfSym {
                name: 0,
                value: 0,
                size: 0,
                info: ElfSym::make_info(elf::STB_GLOBAL, elf::STT_NOTYPE),
                other: 0,
                shndx: elf::SHN_UNDEF,
            },
        ));
    }

    fn reloc(&mut self, section: usize, offset: u64, sym: usize, rtype: u32, addend: i64) {
        let entry = elf::ElfRela {
            offset,
            sym_index: (sym + 1) as u32,
            rel_type: rtype,
            addend,
        };
        if let Some(slot) = self.relocs.iter_mut().find(|(s, _)| *s == section) {
            slot.1.push(entry);
        } else {
            self.relocs.push((section, vec![entry]));
        }
    }

    fn build(&self) -> Vec<u8> {
        let class = self.class;
        let endian = ElfEndian::Little;
        let mut strtab = vec![0u8];
        let mut sym_name_offsets = Vec::new();
        for (name, _) in &self.symbols {
            sym_name_offsets.push(strtab.len() as u32);
            strtab.extend_from_slice(name.as_bytes());
            strtab.push(0);
        }
        let mut shstrtab = vec![0u8];
        let mut sh_name_offsets = Vec::new();
        let mut all_names: Vec<String> =
            self.sections.iter().map(|(n, ..)| n.clone()).collect();
        for (section, _) in &self.relocs {
            all_names.push(format!(".rela{}", self.sections[*section].0));
        }
        all_names.extend(
            [".strtab", ".symtab", ".shstrtab"]
                .iter()
                .map(|s| s.to_string()),
        );
        for name in &all_names {
            sh_name_offsets.push(shstrtab.len() as u32);
            shstrtab.extend_from_slice(name.as_bytes());
            shstrtab.push(0);
        }
        // layout: ehdr | bodies... | rela bodies | strtab | symtab | shstrtab | shdrs
        let ehdr_size = class.ehdr_size();
        let mut offset = ehdr_size;
        let mut body_offsets = Vec::new();
        for (_, _, _, body, align) in &self.sections {
            offset = (offset + align - 1) & !(align - 1);
            body_offsets.push(offset);
            offset += body.len() as u64;
        }
        let mut rela_offsets = Vec::new();
        for (_, entries) in &self.relocs {
            offset = (offset + 7) & !7;
            rela_offsets.push(offset);
            offset += entries.len() as u64 * class.rela_size();
        }
        let strtab_off = offset;
        offset += strtab.len() as u64;
        let symtab_off = (offset + 7) & !7;
        let sym_count = self.symbols.len() as u64 + 1;
        offset = symtab_off + sym_count * class.sym_size();
        let shstrtab_off = offset;
        offset += shstrtab.len() as u64;
        let shoff = (offset + 7) & !7;
        let shnum = 1 + self.sections.len() + self.relocs.len() + 3;
        let strtab_ndx = (1 + self.sections.len() + self.relocs.len()) as u32;
        let symtab_ndx = strtab_ndx + 1;

        let mut sink = ByteSink::new(class, endian);
        write::write_ehdr(
            &mut sink,
            &ElfHeader {
                class,
                endian,
                os_abi: 0,
                e_type: elf::ET_REL,
                machine: self.machine,
                entry: 0,
                phoff: 0,
                shoff,
                flags: 0,
                phnum: 0,
                shnum: shnum as u16,
                shstrndx: (shnum - 1) as u16,
            },
        );
        for ((_, _, _, body, _), &off) in self.sections.iter().zip(&body_offsets) {
            sink.pad_to(off);
            sink.put_bytes(body);
        }
        for ((_, entries), &off) in self.relocs.iter().zip(&rela_offsets) {
            sink.pad_to(off);
            for e in entries {
                write::write_rela(&mut sink, e.offset, e.sym_index, e.rel_type, e.addend);
            }
        }
        sink.pad_to(strtab_off);
        sink.put_bytes(&strtab);
        sink.pad_to(symtab_off);
        write::write_sym(&mut sink, &ElfSym::default());
        for ((_, sym), &name) in self.symbols.iter().zip(&sym_name_offsets) {
            let mut sym = *sym;
            sym.name = name;
            write::write_sym(&mut sink, &sym);
        }
        sink.pad_to(shstrtab_off);
        sink.put_bytes(&shstrtab);
        sink.pad_to(shoff);
        write::write_shdr(&mut sink, &SectionHeader::default());
        let mut name_iter = sh_name_offsets.iter();
        for (i, (_, sh_type, flags, body, align)) in self.sections.iter().enumerate() {
            write::write_shdr(
                &mut sink,
                &SectionHeader {
                    name: *name_iter.next().unwrap(),
                    sh_type: *sh_type,
                    flags: *flags,
                    addr: 0,
                    offset: body_offsets[i],
                    size: body.len() as u64,
                    link: 0,
                    info: 0,
                    addralign: *align,
                    entsize: 0,
                },
            );
        }
        for (i, (section, entries)) in self.relocs.iter().enumerate() {
            write::write_shdr(
                &mut sink,
                &SectionHeader {
                    name: *name_iter.next().unwrap(),
                    sh_type: elf::SHT_RELA,
                    flags: 0,
                    addr: 0,
                    offset: rela_offsets[i],
                    size: entries.len() as u64 * class.rela_size(),
                    link: symtab_ndx,
                    info: (*section + 1) as u32,
                    addralign: 8,
                    entsize: class.rela_size(),
                },
            );
        }
        write::write_shdr(
            &mut sink,
            &SectionHeader {
                name: *name_iter.next().unwrap(),
                sh_type: elf::SHT_STRTAB,
                offset: strtab_off,
                size: strtab.len() as u64,
                addralign: 1,
                ..Default::default()
            },
        );
        write::write_shdr(
            &mut sink,
            &SectionHeader {
                name: *name_iter.next().unwrap(),
                sh_type: elf::SHT_SYMTAB,
                offset: symtab_off,
                size: sym_count * class.sym_size(),
                link: strtab_ndx,
                info: 1,
                addralign: 8,
                entsize: class.sym_size(),
                ..Default::default()
            },
        );
        write::write_shdr(
            &mut sink,
            &SectionHeader {
                name: *name_iter.next().unwrap(),
                sh_type: elf::SHT_STRTAB,
                offset: shstrtab_off,
                size: shstrtab.len() as u64,
                addralign: 1,
                ..Default::default()
            },
        );
        sink.into_bytes()
    }
}

struct Workspace {
    dir: PathBuf,
}

impl Workspace {
    fn new(tag: &str) -> Self {
        let dir = std::env::temp_dir().join(format!(
            "eld-test-{tag}-{}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        Workspace { dir }
    }

    fn file(&self, name: &str, bytes: &[u8]) -> PathBuf {
        let path = self.dir.join(name);
        std::fs::write(&path, bytes).unwrap();
        path
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

const ALLOC_EXEC: u64 = 0x6; // SHF_ALLOC | SHF_EXECINSTR
const ALLOC_WRITE: u64 = 0x3; // SHF_WRITE | SHF_ALLOC

fn start_object() -> ObjBuilder {
    let mut obj = ObjBuilder::new(ElfMachine::RiscV, ElfClass::Elf32);
    let code: Vec<u8> = [0x0000_0013u32, 0x0000_0013]
        .iter()
        .flat_map(|w| w.to_le_bytes())
        .collect();
    let text = obj.section(".text", ALLOC_EXEC, &code, 4);
    obj.global_func("_start", text, 0, 8);
    obj
}

/// Minimal static RV32 link: `ET_EXEC`, the entry at the image base plus
/// the header sizes, `.text` carrying the input bytes, no dynamic
/// section.
#[test]
fn test_minimal_static_link() {
    let ws = Workspace::new("s1");
    let input = ws.file("start.o", &start_object().build());
    let out = ws.path("a.out");
    let config = LinkConfig::builder()
        .output(out.clone())
        .inputs(vec![InputRequest::File(input)])
        .build();
    let mut linker = Linker::new(config);
    linker.link().unwrap();
    let image = std::fs::read(&out).unwrap();
    let hdr = eld::elf::read::read_header(&image).unwrap();
    assert_eq!(hdr.e_type, elf::ET_EXEC);
    assert_eq!(hdr.class, ElfClass::Elf32);
    assert_eq!(hdr.endian, ElfEndian::Little);
    assert_eq!(hdr.machine, ElfMachine::RiscV);
    assert_eq!(hdr.entry, 0x10074);
    // exactly one PT_LOAD; no PT_DYNAMIC
    let loads: Vec<_> = (0..hdr.phnum as usize)
        .map(|i| eld::elf::read::read_program_header(&image, &hdr, i).unwrap())
        .collect();
    assert_eq!(
        loads.iter().filter(|p| p.p_type == elf::PT_LOAD).count(),
        1
    );
    assert!(loads.iter().all(|p| p.p_type != elf::PT_DYNAMIC));
    // the entry bytes are the input code
    let load = loads.iter().find(|p| p.p_type == elf::PT_LOAD).unwrap();
    let text_off = (hdr.entry - load.vaddr + load.offset) as usize;
    assert_eq!(&image[text_off..text_off + 4], &0x0000_0013u32.to_le_bytes());
}

/// Two identical invocations produce byte-identical outputs.
#[test]
fn test_determinism() {
    let ws = Workspace::new("det");
    let input = ws.file("start.o", &start_object().build());
    let mut images = Vec::new();
    for run in 0..2 {
        let out = ws.path(&format!("a{run}.out"));
        let config = LinkConfig::builder()
            .output(out.clone())
            .inputs(vec![InputRequest::File(input.clone())])
            .build();
        Linker::new(config).link().unwrap();
        images.push(std::fs::read(&out).unwrap());
    }
    assert_eq!(images[0], images[1]);
}

/// `--wrap=foo`: the reference lands on `__wrap_foo`; without a wrapper
/// definition the link reports it undefined. `__real_foo` reaches the
/// original definition.
#[test]
fn test_wrap() {
    let ws = Workspace::new("s2");
    // a.o defines foo; b.o references foo
    let mut a = ObjBuilder::new(ElfMachine::RiscV, ElfClass::Elf32);
    let text = a.section(".text", ALLOC_EXEC, &[0x67, 0x80, 0x00, 0x00], 4);
    a.global_func("foo", text, 0, 4);
    let mut b = start_object();
    b.undef("foo");
    b.reloc(0, 0, 1, eld::target::riscv::R_RISCV_CALL, 0);
    let a_path = ws.file("a.o", &a.build());
    let b_path = ws.file("b.o", &b.build());
    let config = LinkConfig::builder()
        .output(ws.path("wrapped.out"))
        .inputs(vec![
            InputRequest::File(a_path.clone()),
            InputRequest::File(b_path.clone()),
        ])
        .wrap(vec!["foo".to_string()])
        .build();
    let mut linker = Linker::new(config);
    assert!(linker.link().is_err());
    let messages: Vec<String> = linker
        .module()
        .diag
        .entries()
        .iter()
        .map(|e| e.message())
        .collect();
    assert!(
        messages
            .iter()
            .any(|m| m.contains("undefined reference") && m.contains("__wrap_foo")),
        "missing __wrap_foo report in {messages:?}"
    );
    // c.o defines __wrap_foo and calls __real_foo: the link succeeds
    let mut c = ObjBuilder::new(ElfMachine::RiscV, ElfClass::Elf32);
    let ctext = c.section(
        ".text",
        ALLOC_EXEC,
        &[0x97, 0x00, 0x00, 0x00, 0xe7, 0x80, 0x00, 0x00],
        4,
    );
    c.global_func("__wrap_foo", ctext, 0, 8);
    c.undef("__real_foo");
    c.reloc(0, 0, 1, eld::target::riscv::R_RISCV_CALL, 0);
    let c_path = ws.file("c.o", &c.build());
    let config = LinkConfig::builder()
        .output(ws.path("wrapped2.out"))
        .inputs(vec![
            InputRequest::File(a_path),
            InputRequest::File(b_path),
            InputRequest::File(c_path),
        ])
        .wrap(vec!["foo".to_string()])
        .build();
    let mut linker = Linker::new(config);
    linker.link().unwrap();
    // __real_foo resolved to a.o's foo
    let module = linker.module();
    let real = module.pool.find("foo").unwrap();
    assert!(real.is_defined());
    assert!(module.pool.find("__wrap_foo").unwrap().is_defined());
}

/// `--gc-sections`: the unreferenced section is dropped, its symbols
/// leave the symbol table and a second link is identical.
#[test]
fn test_gc_sections() {
    let ws = Workspace::new("s3");
    let mut obj = ObjBuilder::new(ElfMachine::RiscV, ElfClass::Elf32);
    let used = obj.section(".text.used", ALLOC_EXEC, &[0x13, 0, 0, 0, 0x13, 0, 0, 0], 4);
    let dead = obj.section(".text.dead", ALLOC_EXEC, &[0xef, 0xbe, 0xad, 0xde], 4);
    obj.global_func("_start", used, 0, 8);
    obj.global_func("dead_code", dead, 0, 4);
    let input = ws.file("gc.o", &obj.build());
    let mut images = Vec::new();
    for run in 0..2 {
        let out = ws.path(&format!("gc{run}.out"));
        let config = LinkConfig::builder()
            .output(out.clone())
            .inputs(vec![InputRequest::File(input.clone())])
            .gc_sections(true)
            .print_gc_sections(true)
            .build();
        let mut linker = Linker::new(config);
        linker.link().unwrap();
        if run == 0 {
            let entries = linker.module().diag.entries();
            assert!(entries
                .iter()
                .any(|e| e.message().contains(".text.dead")));
        }
        images.push(std::fs::read(&out).unwrap());
    }
    assert_eq!(images[0], images[1]);
    // no bytes of the dead section, and no dead symbol
    let image = &images[0];
    assert!(!image
        .windows(4)
        .any(|w| w == [0xef, 0xbe, 0xad, 0xde]));
    assert!(!image
        .windows("dead_code".len())
        .any(|w| w == b"dead_code"));
}

/// MEMORY overflow is fatal, names the region and the first offending
/// section, and produces no output file.
#[test]
fn test_memory_region_overflow() {
    let ws = Workspace::new("s4");
    let mut obj = ObjBuilder::new(ElfMachine::RiscV, ElfClass::Elf32);
    let data = vec![0xabu8; 0x180];
    let sec = obj.section(".data", ALLOC_WRITE, &data, 4);
    obj.global_func("_start", sec, 0, 4);
    let input = ws.file("big.o", &obj.build());
    let out = ws.path("over.out");
    let config = LinkConfig::builder()
        .output(out.clone())
        .inputs(vec![InputRequest::File(input)])
        .script_text(
            "MEMORY { RAM (rw) : ORIGIN = 0x1000, LENGTH = 0x100 }\n\
             SECTIONS { .data : { *(.data) } > RAM }",
        )
        .build();
    let mut linker = Linker::new(config);
    assert!(linker.link().is_err());
    let entries = linker.module().diag.entries();
    let overflow = entries
        .iter()
        .find(|e| e.message().contains("exceeded its limit"))
        .unwrap();
    assert!(overflow.message().contains("RAM"));
    assert!(!out.exists());
}

/// Dot assignments and `ALIGN` place sections exactly (the S5 shape),
/// with `SIZEOF` observable through a trailing assertion.
#[test]
fn test_align_and_dot_script() {
    let ws = Workspace::new("s5");
    let mut obj = ObjBuilder::new(ElfMachine::RiscV, ElfClass::Elf32);
    let a = obj.section(".a", ALLOC_EXEC, &[0u8; 0x10], 4);
    obj.section(".b", ALLOC_EXEC, &[0u8; 0x20], 4);
    obj.global_func("_start", a, 0, 0x10);
    let input = ws.file("ab.o", &obj.build());
    let out = ws.path("ab.out");
    let config = LinkConfig::builder()
        .output(out.clone())
        .inputs(vec![InputRequest::File(input)])
        .script_text(
            "SECTIONS { . = 0x1000; .a : { *(.a) } . = ALIGN(., 0x1000); .b : { *(.b) }\n\
             ASSERT(SIZEOF(.a) == 0x10, \"size of .a\") }",
        )
        .build();
    let mut linker = Linker::new(config);
    linker.link().unwrap();
    let module = linker.module();
    let a_sid = module.section_map.find_output_section(".a").unwrap();
    let b_sid = module.section_map.find_output_section(".b").unwrap();
    assert_eq!(module.sections[a_sid].out.as_ref().unwrap().addr, 0x1000);
    assert_eq!(module.sections[b_sid].out.as_ref().unwrap().addr, 0x2000);
    assert_eq!(module.sections[a_sid].size, 0x10);
    assert_eq!(module.sections[b_sid].size, 0x20);
}

/// Paired `PCREL_HI20`/`PCREL_LO12_I` apply coherently (the S6 shape).
#[test]
fn test_pcrel_hi_lo_pair() {
    let ws = Workspace::new("s6");
    let mut obj = ObjBuilder::new(ElfMachine::RiscV, ElfClass::Elf64);
    // auipc a0, %pcrel_hi(datum); addi a0, a0, %pcrel_lo
    let code: Vec<u8> = [0x0000_0517u32, 0x0005_0513]
        .iter()
        .flat_map(|w| w.to_le_bytes())
        .collect();
    let text = obj.section(".text", ALLOC_EXEC, &code, 4);
    let data = obj.section(".data", ALLOC_WRITE, &[0u8; 8], 8);
    obj.global_func("_start", text, 0, 8);
    obj.symbols.push((
        "datum".to_string(),
        ElfSym {
            name: 0,
            value: 0,
            size: 8,
            info: ElfSym::make_info(elf::STB_GLOBAL, elf::STT_OBJECT),
            other: 0,
            shndx: (data + 1) as u16,
        },
    ));
    // the lo12 references the hi site via a local label
    obj.symbols.push((
        ".Lhi".to_string(),
        ElfSym {
            name: 0,
            value: 0,
            size: 0,
            info: ElfSym::make_info(elf::STB_LOCAL, elf::STT_NOTYPE),
            other: 0,
            shndx: (text + 1) as u16,
        },
    ));
    obj.reloc(text, 0, 1, eld::target::riscv::R_RISCV_PCREL_HI20, 0);
    obj.reloc(text, 4, 2, eld::target::riscv::R_RISCV_PCREL_LO12_I, 0);
    let input = ws.file("pair.o", &obj.build());
    let out = ws.path("pair.out");
    let config = LinkConfig::builder()
        .output(out.clone())
        .inputs(vec![InputRequest::File(input)])
        .build();
    let mut linker = Linker::new(config);
    linker.link().unwrap();
    let module = linker.module();
    let datum = module.pool.find_id("datum").unwrap();
    let s = module.resolve_value(datum);
    let start = module.pool.find_id("_start").unwrap();
    let p = module.resolve_value(start);
    let image = std::fs::read(&out).unwrap();
    let hdr = eld::elf::read::read_header(&image).unwrap();
    let load = (0..hdr.phnum as usize)
        .map(|i| eld::elf::read::read_program_header(&image, &hdr, i).unwrap())
        .find(|ph| ph.p_type == elf::PT_LOAD && ph.flags & 1 != 0)
        .unwrap();
    let text_off = (p - load.vaddr + load.offset) as usize;
    let auipc = u32::from_le_bytes(image[text_off..text_off + 4].try_into().unwrap());
    let addi = u32::from_le_bytes(image[text_off + 4..text_off + 8].try_into().unwrap());
    let x = s.wrapping_sub(p) as i64;
    // hi20 and lo12 recompose to the displacement
    let hi = ((auipc >> 12) as i32) << 12 >> 12; // sign-extend 20 bits is not needed here
    let lo = (addi as i32) >> 20;
    let recomposed = ((hi as i64) << 12) + i64::from(lo);
    assert_eq!(recomposed, x, "auipc={auipc:08x} addi={addi:08x}");
    // the lo bits follow the biased formula
    assert_eq!(i64::from(lo), x - ((x + 0x800) & !0xfff));
}

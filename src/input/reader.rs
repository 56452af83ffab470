//! ELF input parsing: relocatable objects, shared objects and executables
//! into [`ParsedObject`] staging structures.
//!
//! Parsing touches no shared state and is safe to run one-task-per-file;
//! the driver merges results serially.

use super::{
    InputKind, ParsedGroup, ParsedObject, ParsedRelocs, ParsedSection, ParsedSymbol,
};
use crate::diag::{DiagId, DiagnosticEntry, Result};
use crate::elf::{
    self,
    read::{self, ReadError},
    ElfHeader, SectionFlags,
};
use std::path::Path;

fn invalid(path: &Path, err: &ReadError) -> DiagnosticEntry {
    DiagnosticEntry::fatal(
        DiagId::ERROR_INVALID_ELF,
        vec![path.display().to_string(), err.to_string()],
    )
}

struct RawFile<'a> {
    data: &'a [u8],
    hdr: ElfHeader,
    shdrs: Vec<elf::SectionHeader>,
    shstrtab: &'a [u8],
}

impl<'a> RawFile<'a> {
    fn open(path: &Path, data: &'a [u8]) -> Result<Self> {
        let hdr = read::read_header(data).map_err(|e| invalid(path, &e))?;
        let mut shdrs = Vec::with_capacity(hdr.shnum as usize);
        for i in 0..hdr.shnum as usize {
            shdrs.push(read::read_section_header(data, &hdr, i).map_err(|e| invalid(path, &e))?);
        }
        let shstrtab = shdrs
            .get(hdr.shstrndx as usize)
            .map(|sh| section_body(data, sh))
            .unwrap_or(&[]);
        Ok(RawFile {
            data,
            hdr,
            shdrs,
            shstrtab,
        })
    }

    fn section_name(&self, path: &Path, sh: &elf::SectionHeader) -> Result<String> {
        read::read_string(self.shstrtab, u64::from(sh.name))
            .map(str::to_string)
            .map_err(|e| invalid(path, &e))
    }

    /// Read the symbols of a `SHT_SYMTAB`/`SHT_DYNSYM` section with their
    /// names resolved through its linked string table.
    fn read_symbols(&self, path: &Path, symtab_index: usize) -> Result<Vec<ParsedSymbol>> {
        let Some(sh) = self.shdrs.get(symtab_index) else {
            return Ok(Vec::new());
        };
        let strtab = self
            .shdrs
            .get(sh.link as usize)
            .map(|s| section_body(self.data, s))
            .unwrap_or(&[]);
        let entsize = self.hdr.class.sym_size();
        let count = if sh.size > 0 { sh.size / entsize } else { 0 };
        let mut out = Vec::with_capacity(count as usize);
        for i in 0..count {
            let sym = read::read_symbol(
                self.data,
                self.hdr.class,
                self.hdr.endian,
                sh.offset + i * entsize,
            )
            .map_err(|e| invalid(path, &e))?;
            let name = read::read_string(strtab, u64::from(sym.name))
                .map_err(|e| invalid(path, &e))?
                .to_string();
            out.push(ParsedSymbol { name, sym });
        }
        Ok(out)
    }
}

fn section_body<'a>(data: &'a [u8], sh: &elf::SectionHeader) -> &'a [u8] {
    if sh.sh_type == elf::SHT_NOBITS {
        return &[];
    }
    let start = sh.offset as usize;
    let end = start.saturating_add(sh.size as usize);
    data.get(start..end).unwrap_or(&[])
}

/// Parse a relocatable object.
pub fn parse_object(path: &Path, data: &[u8]) -> Result<ParsedObject> {
    let raw = RawFile::open(path, data)?;
    let mut sections = Vec::new();
    let mut relocs = Vec::new();
    let mut groups = Vec::new();
    let mut symtab_index = None;
    for (index, sh) in raw.shdrs.iter().enumerate() {
        let name = raw.section_name(path, sh)?;
        match sh.sh_type {
            elf::SHT_SYMTAB => symtab_index = Some(index),
            elf::SHT_REL | elf::SHT_RELA => {
                let entries = read::read_relocations(
                    section_body(data, sh),
                    raw.hdr.class,
                    raw.hdr.endian,
                    sh.sh_type,
                )
                .map_err(|e| invalid(path, &e))?;
                relocs.push(ParsedRelocs {
                    target_index: sh.info as usize,
                    own_index: index,
                    entries,
                });
            }
            _ => {}
        }
        let flags = SectionFlags::from_bits_retain(sh.flags);
        let (body, addralign) = if flags.contains(SectionFlags::COMPRESSED) {
            let (inflated, chalign) =
                read::decompress_section(section_body(data, sh), raw.hdr.class, raw.hdr.endian)
                    .map_err(|e| {
                        DiagnosticEntry::error(
                            DiagId::ERROR_DECOMPRESS_FAILED,
                            vec![path.display().to_string(), name.clone(), e.to_string()],
                        )
                    })?;
            (Some(inflated), chalign.max(1))
        } else if sh.sh_type == elf::SHT_NOBITS {
            (None, sh.addralign.max(1))
        } else {
            (Some(section_body(data, sh).to_vec()), sh.addralign.max(1))
        };
        sections.push(ParsedSection {
            name,
            sh_type: sh.sh_type,
            flags: sh.flags & !SectionFlags::COMPRESSED.bits(),
            size: body.as_ref().map_or(sh.size, |b| b.len() as u64),
            link: sh.link,
            info: sh.info,
            addralign,
            entsize: sh.entsize,
            data: body,
            index,
        });
    }
    let symbols = match symtab_index {
        Some(idx) => raw.read_symbols(path, idx)?,
        None => Vec::new(),
    };
    // COMDAT groups: word 0 is GRP_COMDAT, the rest are member indexes;
    // the signature symbol is named by sh_info into the symtab
    for (index, sh) in raw.shdrs.iter().enumerate() {
        if sh.sh_type != elf::SHT_GROUP {
            continue;
        }
        let body = section_body(data, sh);
        let mut words = Vec::new();
        let mut r = read::ByteReader::new(body, raw.hdr.class, raw.hdr.endian, 0);
        for _ in 0..body.len() / 4 {
            words.push(r.u32().map_err(|e| invalid(path, &e))?);
        }
        if words.first().copied() != Some(elf::GRP_COMDAT) {
            continue;
        }
        let signature = symbols
            .get(sh.info as usize)
            .map(|s| s.name.clone())
            .unwrap_or_default();
        groups.push(ParsedGroup {
            index,
            signature,
            members: words[1..].to_vec(),
        });
    }
    Ok(ParsedObject {
        path: path.to_path_buf(),
        member_name: None,
        kind: InputKind::Object,
        class: raw.hdr.class,
        endian: raw.hdr.endian,
        machine: raw.hdr.machine,
        e_flags: raw.hdr.flags,
        entry: raw.hdr.entry,
        sections,
        symbols,
        relocs,
        groups,
        soname: None,
        needed: Vec::new(),
    })
}

/// Parse a shared object: only its dynamic symbols and `DT_SONAME`/
/// `DT_NEEDED` matter to the link; its sections do not participate.
pub fn parse_shared_object(path: &Path, data: &[u8]) -> Result<ParsedObject> {
    let raw = RawFile::open(path, data)?;
    let mut dynsym_index = None;
    let mut dynamic: Option<&elf::SectionHeader> = None;
    let mut dynstr: &[u8] = &[];
    for (index, sh) in raw.shdrs.iter().enumerate() {
        match sh.sh_type {
            elf::SHT_DYNSYM => {
                dynsym_index = Some(index);
                dynstr = raw
                    .shdrs
                    .get(sh.link as usize)
                    .map(|s| section_body(data, s))
                    .unwrap_or(&[]);
            }
            elf::SHT_DYNAMIC => dynamic = Some(sh),
            _ => {}
        }
    }
    let symbols = match dynsym_index {
        Some(idx) => raw.read_symbols(path, idx)?,
        None => Vec::new(),
    };
    let mut soname = None;
    let mut needed = Vec::new();
    if let Some(dynamic) = dynamic {
        let body = section_body(data, dynamic);
        let mut r = read::ByteReader::new(body, raw.hdr.class, raw.hdr.endian, 0);
        let entsize = raw.hdr.class.word_size() * 2;
        for _ in 0..body.len() as u64 / entsize {
            let tag = r.word().map_err(|e| invalid(path, &e))?;
            let value = r.word().map_err(|e| invalid(path, &e))?;
            match tag {
                elf::DT_SONAME => {
                    soname = read::read_string(dynstr, value).ok().map(str::to_string)
                }
                elf::DT_NEEDED => {
                    if let Ok(s) = read::read_string(dynstr, value) {
                        needed.push(s.to_string());
                    }
                }
                elf::DT_NULL => break,
                _ => {}
            }
        }
    }
    Ok(ParsedObject {
        path: path.to_path_buf(),
        member_name: None,
        kind: InputKind::SharedObject,
        class: raw.hdr.class,
        endian: raw.hdr.endian,
        machine: raw.hdr.machine,
        e_flags: raw.hdr.flags,
        entry: raw.hdr.entry,
        sections: Vec::new(),
        symbols,
        relocs: Vec::new(),
        groups: Vec::new(),
        soname,
        needed,
    })
}

/// Parse an already-linked executable for `--patch-base`: exported
/// defined symbols become absolute anchors at their linked addresses.
pub fn parse_executable(path: &Path, data: &[u8]) -> Result<ParsedObject> {
    let raw = RawFile::open(path, data)?;
    let mut symtab_index = None;
    let mut dynsym_index = None;
    for (index, sh) in raw.shdrs.iter().enumerate() {
        match sh.sh_type {
            elf::SHT_SYMTAB => symtab_index = Some(index),
            elf::SHT_DYNSYM => dynsym_index = Some(index),
            _ => {}
        }
    }
    let symbols = match symtab_index.or(dynsym_index) {
        Some(idx) => raw.read_symbols(path, idx)?,
        None => Vec::new(),
    };
    Ok(ParsedObject {
        path: path.to_path_buf(),
        member_name: None,
        kind: InputKind::Executable,
        class: raw.hdr.class,
        endian: raw.hdr.endian,
        machine: raw.hdr.machine,
        e_flags: raw.hdr.flags,
        entry: raw.hdr.entry,
        sections: Vec::new(),
        symbols,
        relocs: Vec::new(),
        groups: Vec::new(),
        soname: None,
        needed: Vec::new(),
    })
}

/// Dispatch on `e_type`.
pub fn parse_elf(path: &Path, data: &[u8]) -> Result<ParsedObject> {
    let hdr = read::read_header(data).map_err(|e| invalid(path, &e))?;
    match hdr.e_type {
        elf::ET_REL => parse_object(path, data),
        elf::ET_DYN => parse_shared_object(path, data),
        elf::ET_EXEC => parse_executable(path, data),
        other => Err(DiagnosticEntry::fatal(
            DiagId::ERROR_INVALID_ELF,
            vec![
                path.display().to_string(),
                format!("unsupported e_type {other}"),
            ],
        )),
    }
}

/// Test fixtures shared by unit and integration tests.
#[cfg(test)]
pub mod fixtures {
    use super::*;
    use crate::elf::write::{self, ByteSink};
    use crate::elf::{ElfClass, ElfEndian, ElfHeader, ElfMachine};

    /// Build a minimal relocatable object with a `.text` section, one
    /// defined global and one undefined reference.
    pub fn tiny_object() -> Vec<u8> {
        let class = ElfClass::Elf64;
        let endian = ElfEndian::Little;
        let mut sink = ByteSink::new(class, endian);
        // layout: ehdr | .text | .strtab | .symtab | .shstrtab | shdrs
        let text: &[u8] = &[0x13, 0x00, 0x00, 0x00, 0x13, 0x00, 0x00, 0x00];
        let strtab = b"\0_start\0undef_sym\0";
        let shstrtab = b"\0.text\0.strtab\0.symtab\0.shstrtab\0";
        let text_off = 64u64;
        let strtab_off = text_off + text.len() as u64;
        let symtab_off = strtab_off + strtab.len() as u64;
        let sym_count = 3u64; // null, _start, undef_sym
        let shstrtab_off = symtab_off + sym_count * 24;
        let shoff = shstrtab_off + shstrtab.len() as u64;
        let hdr = ElfHeader {
            class,
            endian,
            os_abi: 0,
            e_type: elf::ET_REL,
            machine: ElfMachine::RiscV,
            entry: 0,
            phoff: 0,
            shoff,
            flags: 0,
            phnum: 0,
            shnum: 5,
            shstrndx: 4,
        };
        write::write_ehdr(&mut sink, &hdr);
        sink.put_bytes(text);
        sink.put_bytes(strtab);
        // null symbol
        write::write_sym(&mut sink, &elf::ElfSym::default());
        // _start defined in section 1
        write::write_sym(
            &mut sink,
            &elf::ElfSym {
                name: 1,
                value: 0,
                size: 8,
                info: elf::ElfSym::make_info(elf::STB_GLOBAL, elf::STT_FUNC),
                other: 0,
                shndx: 1,
            },
        );
        // undef_sym
        write::write_sym(
            &mut sink,
            &elf::ElfSym {
                name: 8,
                value: 0,
                size: 0,
                info: elf::ElfSym::make_info(elf::STB_GLOBAL, elf::STT_NOTYPE),
                other: 0,
                shndx: elf::SHN_UNDEF,
            },
        );
        sink.put_bytes(shstrtab);
        // section headers
        write::write_shdr(&mut sink, &elf::SectionHeader::default());
        write::write_shdr(
            &mut sink,
            &elf::SectionHeader {
                name: 1,
                sh_type: elf::SHT_PROGBITS,
                flags: (SectionFlags::ALLOC | SectionFlags::EXECINSTR).bits(),
                addr: 0,
                offset: text_off,
                size: text.len() as u64,
                link: 0,
                info: 0,
                addralign: 4,
                entsize: 0,
            },
        );
        write::write_shdr(
            &mut sink,
            &elf::SectionHeader {
                name: 7,
                sh_type: elf::SHT_STRTAB,
                offset: strtab_off,
                size: strtab.len() as u64,
                addralign: 1,
                ..Default::default()
            },
        );
        write::write_shdr(
            &mut sink,
            &elf::SectionHeader {
                name: 15,
                sh_type: elf::SHT_SYMTAB,
                offset: symtab_off,
                size: sym_count * 24,
                link: 2,
                info: 1, // first global
                addralign: 8,
                entsize: 24,
                ..Default::default()
            },
        );
        write::write_shdr(
            &mut sink,
            &elf::SectionHeader {
                name: 23,
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

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::fixtures::tiny_object;
    use super::*;
    use crate::elf::ElfMachine;

    #[test]
    fn test_parse_tiny_object() {
        let data = tiny_object();
        let parsed = parse_elf(Path::new("tiny.o"), &data).unwrap();
        assert_eq!(parsed.kind, InputKind::Object);
        assert_eq!(parsed.machine, ElfMachine::RiscV);
        assert_eq!(parsed.sections.len(), 5);
        assert_eq!(parsed.sections[1].name, ".text");
        assert_eq!(parsed.sections[1].data.as_deref().map(|d| d.len()), Some(8));
        assert_eq!(parsed.symbols.len(), 3);
        assert_eq!(parsed.symbols[1].name, "_start");
        assert_eq!(parsed.symbols[2].name, "undef_sym");
        assert_eq!(parsed.symbols[2].sym.shndx, elf::SHN_UNDEF);
    }

    #[test]
    fn test_reject_garbage() {
        assert!(parse_elf(Path::new("x.o"), b"garbage").is_err());
    }
}

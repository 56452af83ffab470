//! Byte-level ELF decoding over in-memory buffers.
//!
//! A [`ByteReader`] carries the class and endianness picked up from
//! `e_ident` and decodes the generic-ABI structures; higher layers
//! (`input`) turn the decoded records into IR sections and symbols.

use super::{
    ElfClass, ElfEndian, ElfHeader, ElfMachine, ElfPhdr, ElfRela, ElfSym, SectionHeader,
    EI_ABIVERSION, EI_CLASS, EI_DATA, EI_NIDENT, EI_OSABI, EI_VERSION, ELFCOMPRESS_ZLIB, ELFMAG,
    SHT_REL, SHT_RELA,
};
use flate2::{Decompress, FlushDecompress};
use num_traits::FromPrimitive as _;

/// Errors from the byte-level decoders. The input layer attaches the file
/// path when turning these into diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReadError {
    #[error("file is truncated at offset {offset:#x}")]
    Truncated { offset: u64 },
    #[error("not an ELF file (bad magic)")]
    BadMagic,
    #[error("unsupported ELF class {value}")]
    UnsupportedClass { value: u8 },
    #[error("unsupported ELF data encoding {value}")]
    UnsupportedEncoding { value: u8 },
    #[error("unsupported ELF version {value}")]
    UnsupportedVersion { value: u8 },
    #[error("unknown machine {value}")]
    UnknownMachine { value: u16 },
    #[error("string table index {index} out of range")]
    BadStringIndex { index: u64 },
    #[error("unterminated string at offset {offset:#x}")]
    UnterminatedString { offset: u64 },
    #[error("compressed section is malformed: {reason}")]
    BadCompression { reason: String },
}

type Result<T> = std::result::Result<T, ReadError>;

/// A positioned reader over a byte buffer with a fixed class and encoding.
#[derive(Debug, Clone, Copy)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    pub class: ElfClass,
    pub endian: ElfEndian,
    pos: u64,
}

impl<'a> ByteReader<'a> {
    /// A reader positioned at `offset`.
    pub fn new(data: &'a [u8], class: ElfClass, endian: ElfEndian, offset: u64) -> Self {
        ByteReader {
            data,
            class,
            endian,
            pos: offset,
        }
    }

    /// Current position.
    pub fn pos(&self) -> u64 {
        self.pos
    }

    /// Reposition the reader.
    pub fn seek(&mut self, offset: u64) {
        self.pos = offset;
    }

    fn take(&mut self, len: u64) -> Result<&'a [u8]> {
        let start = usize::try_from(self.pos).map_err(|_| ReadError::Truncated {
            offset: self.pos,
        })?;
        let end = start
            .checked_add(len as usize)
            .filter(|&e| e <= self.data.len())
            .ok_or(ReadError::Truncated { offset: self.pos })?;
        self.pos += len;
        Ok(&self.data[start..end])
    }

    /// Read one byte.
    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    /// Read a 16-bit value in the file's byte order.
    pub fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(match self.endian {
            ElfEndian::Little => u16::from_le_bytes([b[0], b[1]]),
            ElfEndian::Big => u16::from_be_bytes([b[0], b[1]]),
        })
    }

    /// Read a 32-bit value in the file's byte order.
    pub fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(match self.endian {
            ElfEndian::Little => u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            ElfEndian::Big => u32::from_be_bytes([b[0], b[1], b[2], b[3]]),
        })
    }

    /// Read a 64-bit value in the file's byte order.
    pub fn u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        let arr = [b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]];
        Ok(match self.endian {
            ElfEndian::Little => u64::from_le_bytes(arr),
            ElfEndian::Big => u64::from_be_bytes(arr),
        })
    }

    /// Read a class-sized word (`Elf32_Addr`/`Elf64_Addr`), widened to u64.
    pub fn word(&mut self) -> Result<u64> {
        match self.class {
            ElfClass::Elf32 => Ok(u64::from(self.u32()?)),
            ElfClass::Elf64 => self.u64(),
        }
    }
}

/// Whether the buffer begins with the ELF magic.
pub fn is_elf(data: &[u8]) -> bool {
    data.len() >= 4 && data[..4] == ELFMAG
}

/// Decode the file header, validating `e_ident`.
pub fn read_header(data: &[u8]) -> Result<ElfHeader> {
    if data.len() < EI_NIDENT || data[..4] != ELFMAG {
        return Err(ReadError::BadMagic);
    }
    let class = ElfClass::try_from(data[EI_CLASS])
        .map_err(|value| ReadError::UnsupportedClass { value })?;
    let endian = ElfEndian::try_from(data[EI_DATA])
        .map_err(|value| ReadError::UnsupportedEncoding { value })?;
    if data[EI_VERSION] != 1 {
        return Err(ReadError::UnsupportedVersion {
            value: data[EI_VERSION],
        });
    }
    let os_abi = data[EI_OSABI];
    let _abi_version = data[EI_ABIVERSION];
    let mut r = ByteReader::new(data, class, endian, EI_NIDENT as u64);
    let e_type = r.u16()?;
    let machine_raw = r.u16()?;
    let machine = ElfMachine::from_u16(machine_raw)
        .ok_or(ReadError::UnknownMachine { value: machine_raw })?;
    let _version = r.u32()?;
    let entry = r.word()?;
    let phoff = r.word()?;
    let shoff = r.word()?;
    let flags = r.u32()?;
    let _ehsize = r.u16()?;
    let _phentsize = r.u16()?;
    let phnum = r.u16()?;
    let _shentsize = r.u16()?;
    let shnum = r.u16()?;
    let shstrndx = r.u16()?;
    Ok(ElfHeader {
        class,
        endian,
        os_abi,
        e_type,
        machine,
        entry,
        phoff,
        shoff,
        flags,
        phnum,
        shnum,
        shstrndx,
    })
}

/// Decode the section header at index `index`.
pub fn read_section_header(
    data: &[u8],
    hdr: &ElfHeader,
    index: usize,
) -> Result<SectionHeader> {
    let off = hdr.shoff + index as u64 * hdr.class.shdr_size();
    let mut r = ByteReader::new(data, hdr.class, hdr.endian, off);
    Ok(SectionHeader {
        name: r.u32()?,
        sh_type: r.u32()?,
        flags: r.word()?,
        addr: r.word()?,
        offset: r.word()?,
        size: r.word()?,
        link: r.u32()?,
        info: r.u32()?,
        addralign: r.word()?,
        entsize: r.word()?,
    })
}

/// Decode the program header at index `index`.
pub fn read_program_header(data: &[u8], hdr: &ElfHeader, index: usize) -> Result<ElfPhdr> {
    let off = hdr.phoff + index as u64 * hdr.class.phdr_size();
    let mut r = ByteReader::new(data, hdr.class, hdr.endian, off);
    match hdr.class {
        ElfClass::Elf32 => Ok(ElfPhdr {
            p_type: r.u32()?,
            offset: r.word()?,
            vaddr: r.word()?,
            paddr: r.word()?,
            filesz: r.word()?,
            memsz: r.word()?,
            flags: r.u32()?,
            align: r.word()?,
        }),
        ElfClass::Elf64 => {
            let p_type = r.u32()?;
            let flags = r.u32()?;
            Ok(ElfPhdr {
                p_type,
                flags,
                offset: r.word()?,
                vaddr: r.word()?,
                paddr: r.word()?,
                filesz: r.word()?,
                memsz: r.word()?,
                align: r.word()?,
            })
        }
    }
}

/// Decode the symbol at byte offset `off` of a symbol table.
pub fn read_symbol(
    data: &[u8],
    class: ElfClass,
    endian: ElfEndian,
    off: u64,
) -> Result<ElfSym> {
    let mut r = ByteReader::new(data, class, endian, off);
    match class {
        ElfClass::Elf32 => {
            let name = r.u32()?;
            let value = r.word()?;
            let size = r.word()?;
            let info = r.u8()?;
            let other = r.u8()?;
            let shndx = r.u16()?;
            Ok(ElfSym {
                name,
                value,
                size,
                info,
                other,
                shndx,
            })
        }
        ElfClass::Elf64 => {
            let name = r.u32()?;
            let info = r.u8()?;
            let other = r.u8()?;
            let shndx = r.u16()?;
            let value = r.word()?;
            let size = r.word()?;
            Ok(ElfSym {
                name,
                value,
                size,
                info,
                other,
                shndx,
            })
        }
    }
}

/// Decode every relocation of a `SHT_REL`/`SHT_RELA` section body.
pub fn read_relocations(
    body: &[u8],
    class: ElfClass,
    endian: ElfEndian,
    sh_type: u32,
) -> Result<Vec<ElfRela>> {
    debug_assert!(sh_type == SHT_REL || sh_type == SHT_RELA);
    let explicit_addend = sh_type == SHT_RELA;
    let entsize = match (class, explicit_addend) {
        (ElfClass::Elf32, false) => 8,
        (ElfClass::Elf32, true) => 12,
        (ElfClass::Elf64, false) => 16,
        (ElfClass::Elf64, true) => 24,
    };
    let count = body.len() as u64 / entsize;
    let mut out = Vec::with_capacity(count as usize);
    let mut r = ByteReader::new(body, class, endian, 0);
    for _ in 0..count {
        let offset = r.word()?;
        let info = r.word()?;
        let (sym_index, rel_type) = match class {
            ElfClass::Elf32 => ((info >> 8) as u32, (info & 0xff) as u32),
            ElfClass::Elf64 => ((info >> 32) as u32, (info & 0xffff_ffff) as u32),
        };
        let addend = if explicit_addend {
            match class {
                ElfClass::Elf32 => i64::from(r.u32()? as i32),
                ElfClass::Elf64 => r.u64()? as i64,
            }
        } else {
            0
        };
        out.push(ElfRela {
            offset,
            sym_index,
            rel_type,
            addend,
        });
    }
    Ok(out)
}

/// Fetch the NUL-terminated string at `index` in a string-table body.
pub fn read_string(strtab: &[u8], index: u64) -> Result<&str> {
    let start = usize::try_from(index).map_err(|_| ReadError::BadStringIndex { index })?;
    if start > strtab.len() {
        return Err(ReadError::BadStringIndex { index });
    }
    let rest = &strtab[start..];
    let end = rest
        .iter()
        .position(|&b| b == 0)
        .ok_or(ReadError::UnterminatedString { offset: index })?;
    std::str::from_utf8(&rest[..end]).map_err(|_| ReadError::UnterminatedString { offset: index })
}

/// Inflate a `SHF_COMPRESSED` section body. The leading `Elf32_Chdr` or
/// `Elf64_Chdr` names the algorithm and the uncompressed size; only
/// `ELFCOMPRESS_ZLIB` is supported. Returns `(uncompressed, addralign)`.
pub fn decompress_section(
    body: &[u8],
    class: ElfClass,
    endian: ElfEndian,
) -> Result<(Vec<u8>, u64)> {
    let mut r = ByteReader::new(body, class, endian, 0);
    let ch_type = r.u32()?;
    if class == ElfClass::Elf64 {
        let _reserved = r.u32()?;
    }
    let ch_size = r.word()?;
    let ch_addralign = r.word()?;
    if ch_type != ELFCOMPRESS_ZLIB {
        return Err(ReadError::BadCompression {
            reason: format!("unsupported compression type {ch_type}"),
        });
    }
    let payload = &body[r.pos() as usize..];
    let mut out = vec![0u8; ch_size as usize];
    let mut inflate = Decompress::new(true);
    inflate
        .decompress(payload, &mut out, FlushDecompress::Finish)
        .map_err(|e| ReadError::BadCompression {
            reason: e.to_string(),
        })?;
    if inflate.total_out() != ch_size {
        return Err(ReadError::BadCompression {
            reason: format!(
                "uncompressed size {} does not match header {}",
                inflate.total_out(),
                ch_size
            ),
        });
    }
    Ok((out, ch_addralign))
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::write::ByteSink;

    #[test]
    fn test_byte_reader_endianness() {
        let data = [0x01u8, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
        let mut le = ByteReader::new(&data, ElfClass::Elf64, ElfEndian::Little, 0);
        assert_eq!(le.u32().unwrap(), 0x0403_0201);
        let mut be = ByteReader::new(&data, ElfClass::Elf64, ElfEndian::Big, 0);
        assert_eq!(be.u32().unwrap(), 0x0102_0304);
        let mut w32 = ByteReader::new(&data, ElfClass::Elf32, ElfEndian::Little, 0);
        assert_eq!(w32.word().unwrap(), 0x0403_0201);
    }

    #[test]
    fn test_truncation_detected() {
        let data = [0u8; 2];
        let mut r = ByteReader::new(&data, ElfClass::Elf64, ElfEndian::Little, 0);
        assert!(matches!(r.u32(), Err(ReadError::Truncated { .. })));
    }

    #[test]
    fn test_header_roundtrip() {
        let hdr = ElfHeader {
            class: ElfClass::Elf64,
            endian: ElfEndian::Little,
            os_abi: 0,
            e_type: crate::elf::ET_REL,
            machine: ElfMachine::RiscV,
            entry: 0x1_0074,
            phoff: 0,
            shoff: 64,
            flags: 0x4,
            phnum: 0,
            shnum: 3,
            shstrndx: 2,
        };
        let mut sink = ByteSink::new(ElfClass::Elf64, ElfEndian::Little);
        crate::elf::write::write_ehdr(&mut sink, &hdr);
        let decoded = read_header(sink.as_slice()).unwrap();
        assert_eq!(decoded, hdr);
    }

    #[test]
    fn test_read_string() {
        let tab = b"\0.text\0.data\0";
        assert_eq!(read_string(tab, 1).unwrap(), ".text");
        assert_eq!(read_string(tab, 7).unwrap(), ".data");
        assert_eq!(read_string(tab, 0).unwrap(), "");
        assert!(read_string(tab, 100).is_err());
    }

    #[test]
    fn test_read_relocations_rela64() {
        let mut sink = ByteSink::new(ElfClass::Elf64, ElfEndian::Little);
        // offset 0x10, sym 2, type 5, addend -4
        sink.put_u64(0x10);
        sink.put_u64((2u64 << 32) | 5);
        sink.put_u64((-4i64) as u64);
        let relocs =
            read_relocations(sink.as_slice(), ElfClass::Elf64, ElfEndian::Little, SHT_RELA)
                .unwrap();
        assert_eq!(relocs.len(), 1);
        assert_eq!(relocs[0].offset, 0x10);
        assert_eq!(relocs[0].sym_index, 2);
        assert_eq!(relocs[0].rel_type, 5);
        assert_eq!(relocs[0].addend, -4);
    }
}

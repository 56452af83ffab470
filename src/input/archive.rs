//! Archive (`.a`) reading: regular and GNU thin archives.
//!
//! Members are enumerated up front; extraction is driven by the resolver,
//! which pulls in any member defining a currently-undefined referenced
//! symbol and iterates to a fixpoint (the `GROUP` algorithm).

use crate::diag::{DiagId, DiagnosticEntry, Result};
use std::path::{Path, PathBuf};

pub const ARCHIVE_MAGIC: &[u8; 8] = b"!<arch>\n";
pub const THIN_MAGIC: &[u8; 8] = b"!<thin>\n";

/// Whether the buffer is a regular archive.
pub fn is_archive(data: &[u8]) -> bool {
    data.len() >= 8 && &data[..8] == ARCHIVE_MAGIC
}

/// Whether the buffer is a GNU thin archive.
pub fn is_thin_archive(data: &[u8]) -> bool {
    data.len() >= 8 && &data[..8] == THIN_MAGIC
}

/// One member of an archive.
#[derive(Debug, Clone)]
pub struct ArchiveMember {
    /// Member name, extended names already resolved
    pub name: String,
    /// Byte range of the member body inside the archive (regular
    /// archives), or `None` for thin members stored externally
    pub range: Option<(usize, usize)>,
    /// Offset of the member header, the key the symbol index uses
    pub header_offset: usize,
}

/// A parsed archive: member table plus the symbol index.
#[derive(Debug, Default)]
pub struct Archive {
    /// Whether members live outside the archive file
    pub thin: bool,
    pub members: Vec<ArchiveMember>,
    /// `(symbol name, member header offset)` pairs from the index
    pub symbol_index: Vec<(String, usize)>,
}

impl Archive {
    /// Members defining `symbol` according to the index.
    pub fn member_for_symbol(&self, symbol: &str) -> Option<usize> {
        let offset = self
            .symbol_index
            .iter()
            .find(|(name, _)| name == symbol)
            .map(|&(_, off)| off)?;
        self.members.iter().position(|m| m.header_offset == offset)
    }

    /// Resolve a thin member's path relative to the archive's directory.
    pub fn thin_member_path(&self, archive_path: &Path, member: &ArchiveMember) -> PathBuf {
        archive_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(&member.name)
    }
}

fn malformed(path: &Path, reason: &str) -> DiagnosticEntry {
    DiagnosticEntry::fatal(
        DiagId::ERROR_ARCHIVE_MALFORMED,
        vec![path.display().to_string(), reason.to_string()],
    )
}

fn parse_decimal(field: &[u8]) -> Option<usize> {
    let text = std::str::from_utf8(field).ok()?.trim_end();
    if text.is_empty() {
        return Some(0);
    }
    text.parse().ok()
}

/// Parse the member table and symbol index of an archive.
pub fn parse(path: &Path, data: &[u8]) -> Result<Archive> {
    let thin = is_thin_archive(data);
    if !thin && !is_archive(data) {
        return Err(malformed(path, "bad magic"));
    }
    let mut archive = Archive {
        thin,
        ..Archive::default()
    };
    let mut extended_names: &[u8] = &[];
    let mut pos = 8usize;
    while pos + 60 <= data.len() {
        let header = &data[pos..pos + 60];
        if &header[58..60] != b"`\n" {
            return Err(malformed(path, "bad member header terminator"));
        }
        let size = parse_decimal(&header[48..58])
            .ok_or_else(|| malformed(path, "bad member size field"))?;
        let name_field = std::str::from_utf8(&header[..16])
            .map_err(|_| malformed(path, "bad member name field"))?
            .trim_end();
        let body_start = pos + 60;
        // thin archives store only headers for normal members
        let body_present = !thin || name_field == "/" || name_field == "//";
        if body_present && body_start + size > data.len() {
            return Err(malformed(path, "member extends past end of archive"));
        }
        if name_field == "/" {
            // System V symbol index: big-endian count, offsets, names
            let body = &data[body_start..body_start + size];
            archive.symbol_index = parse_symbol_index(path, body)?;
        } else if name_field == "//" {
            extended_names = &data[body_start..body_start + size];
        } else {
            let name = if let Some(rest) = name_field.strip_prefix('/') {
                // extended name reference: /<offset into //>
                let off: usize = rest
                    .parse()
                    .map_err(|_| malformed(path, "bad extended name reference"))?;
                let tail = extended_names
                    .get(off..)
                    .ok_or_else(|| malformed(path, "extended name out of range"))?;
                let end = tail
                    .iter()
                    .position(|&b| b == b'\n')
                    .unwrap_or(tail.len());
                String::from_utf8_lossy(&tail[..end])
                    .trim_end_matches('/')
                    .to_string()
            } else {
                name_field.trim_end_matches('/').to_string()
            };
            archive.members.push(ArchiveMember {
                name,
                range: if thin {
                    None
                } else {
                    Some((body_start, body_start + size))
                },
                header_offset: pos,
            });
        }
        pos = body_start;
        if body_present {
            pos += size;
        }
        // member bodies are 2-byte aligned
        if pos % 2 == 1 {
            pos += 1;
        }
    }
    Ok(archive)
}

fn parse_symbol_index(path: &Path, body: &[u8]) -> Result<Vec<(String, usize)>> {
    if body.len() < 4 {
        return Err(malformed(path, "truncated symbol index"));
    }
    let count = u32::from_be_bytes([body[0], body[1], body[2], body[3]]) as usize;
    let offsets_end = 4 + count * 4;
    if body.len() < offsets_end {
        return Err(malformed(path, "truncated symbol index offsets"));
    }
    let mut entries = Vec::with_capacity(count);
    let mut name_pos = offsets_end;
    for i in 0..count {
        let off_field = &body[4 + i * 4..8 + i * 4];
        let member_offset =
            u32::from_be_bytes([off_field[0], off_field[1], off_field[2], off_field[3]]) as usize;
        let tail = &body[name_pos..];
        let end = tail
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| malformed(path, "unterminated symbol index name"))?;
        let name = String::from_utf8_lossy(&tail[..end]).into_owned();
        name_pos += end + 1;
        entries.push((name, member_offset));
    }
    Ok(entries)
}

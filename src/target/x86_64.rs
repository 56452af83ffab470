//! x86-64 backend.

use super::{ClassifyInput, DynRelocCodes, RelocFailure, RelocInput, TargetInfo};
use crate::elf::{
    write::{get_u32_at, put_u16_at, put_u32_at, put_u64_at},
    ElfClass, ElfEndian, ElfMachine,
};
use crate::reloc::RelocAction;

pub const R_X86_64_NONE: u32 = 0;
pub const R_X86_64_64: u32 = 1;
pub const R_X86_64_PC32: u32 = 2;
pub const R_X86_64_GOT32: u32 = 3;
pub const R_X86_64_PLT32: u32 = 4;
pub const R_X86_64_COPY: u32 = 5;
pub const R_X86_64_GLOB_DAT: u32 = 6;
pub const R_X86_64_JUMP_SLOT: u32 = 7;
pub const R_X86_64_RELATIVE: u32 = 8;
pub const R_X86_64_GOTPCREL: u32 = 9;
pub const R_X86_64_32: u32 = 10;
pub const R_X86_64_32S: u32 = 11;
pub const R_X86_64_16: u32 = 12;
pub const R_X86_64_PC16: u32 = 13;
pub const R_X86_64_8: u32 = 14;
pub const R_X86_64_PC8: u32 = 15;
pub const R_X86_64_DTPMOD64: u32 = 16;
pub const R_X86_64_DTPOFF64: u32 = 17;
pub const R_X86_64_TPOFF64: u32 = 18;
pub const R_X86_64_TLSGD: u32 = 19;
pub const R_X86_64_TLSLD: u32 = 20;
pub const R_X86_64_DTPOFF32: u32 = 21;
pub const R_X86_64_GOTTPOFF: u32 = 22;
pub const R_X86_64_TPOFF32: u32 = 23;
pub const R_X86_64_PC64: u32 = 24;
pub const R_X86_64_GOTPCRELX: u32 = 41;
pub const R_X86_64_REX_GOTPCRELX: u32 = 42;
pub const R_X86_64_IRELATIVE: u32 = 37;

const NAMES: &[(u32, &str)] = &[
    (R_X86_64_NONE, "R_X86_64_NONE"),
    (R_X86_64_64, "R_X86_64_64"),
    (R_X86_64_PC32, "R_X86_64_PC32"),
    (R_X86_64_GOT32, "R_X86_64_GOT32"),
    (R_X86_64_PLT32, "R_X86_64_PLT32"),
    (R_X86_64_COPY, "R_X86_64_COPY"),
    (R_X86_64_GLOB_DAT, "R_X86_64_GLOB_DAT"),
    (R_X86_64_JUMP_SLOT, "R_X86_64_JUMP_SLOT"),
    (R_X86_64_RELATIVE, "R_X86_64_RELATIVE"),
    (R_X86_64_GOTPCREL, "R_X86_64_GOTPCREL"),
    (R_X86_64_32, "R_X86_64_32"),
    (R_X86_64_32S, "R_X86_64_32S"),
    (R_X86_64_PC64, "R_X86_64_PC64"),
    (R_X86_64_TPOFF32, "R_X86_64_TPOFF32"),
    (R_X86_64_GOTTPOFF, "R_X86_64_GOTTPOFF"),
    (R_X86_64_GOTPCRELX, "R_X86_64_GOTPCRELX"),
    (R_X86_64_REX_GOTPCRELX, "R_X86_64_REX_GOTPCRELX"),
];

/// The x86-64 backend.
pub struct X86_64;

fn check_i32(value: i64) -> Result<(), RelocFailure> {
    i32::try_from(value)
        .map(|_| ())
        .map_err(|_| RelocFailure::Overflow {
            value: value as u64,
        })
}

fn check_u32(value: u64) -> Result<(), RelocFailure> {
    u32::try_from(value)
        .map(|_| ())
        .map_err(|_| RelocFailure::Overflow { value })
}

impl TargetInfo for X86_64 {
    fn machine(&self) -> ElfMachine {
        ElfMachine::X86_64
    }

    fn name(&self) -> &'static str {
        "x86_64"
    }

    fn reloc_name(&self, rtype: u32) -> String {
        NAMES
            .iter()
            .find(|&&(t, _)| t == rtype)
            .map(|&(_, n)| n.to_string())
            .unwrap_or_else(|| format!("R_X86_64_<{rtype}>"))
    }

    fn classify(&self, input: &ClassifyInput) -> RelocAction {
        match input.rtype {
            R_X86_64_64 | R_X86_64_32 | R_X86_64_32S => {
                if input.is_pic && !input.preemptible {
                    RelocAction::DynRelative
                } else if input.preemptible {
                    if input.from_dynamic && !input.is_func && !input.is_pic {
                        RelocAction::Copy
                    } else {
                        RelocAction::DynSymbolic
                    }
                } else {
                    RelocAction::None
                }
            }
            R_X86_64_GOT32 | R_X86_64_GOTPCREL | R_X86_64_GOTPCRELX
            | R_X86_64_REX_GOTPCRELX => RelocAction::Got,
            R_X86_64_PLT32 => {
                if input.preemptible && !input.is_static {
                    RelocAction::Plt
                } else {
                    RelocAction::None
                }
            }
            R_X86_64_TLSGD => RelocAction::TlsGd,
            R_X86_64_TLSLD => RelocAction::TlsLd,
            R_X86_64_GOTTPOFF => RelocAction::TlsIe,
            R_X86_64_TPOFF32 | R_X86_64_TPOFF64 => RelocAction::TlsLe,
            _ => RelocAction::None,
        }
    }

    fn redirects_to_plt(&self, rtype: u32) -> bool {
        rtype == R_X86_64_PLT32
    }

    fn uses_got(&self, rtype: u32) -> bool {
        matches!(
            rtype,
            R_X86_64_GOT32
                | R_X86_64_GOTPCREL
                | R_X86_64_GOTPCRELX
                | R_X86_64_REX_GOTPCRELX
                | R_X86_64_TLSGD
                | R_X86_64_TLSLD
                | R_X86_64_GOTTPOFF
        )
    }

    fn dyn_codes(&self) -> DynRelocCodes {
        DynRelocCodes {
            relative: R_X86_64_RELATIVE,
            glob_dat: R_X86_64_GLOB_DAT,
            jump_slot: R_X86_64_JUMP_SLOT,
            copy: R_X86_64_COPY,
            symbolic: R_X86_64_64,
            dtpmod: R_X86_64_DTPMOD64,
            dtprel: R_X86_64_DTPOFF64,
            tprel: R_X86_64_TPOFF64,
            irelative: R_X86_64_IRELATIVE,
        }
    }

    fn apply(
        &self,
        input: &RelocInput,
        bytes: &mut [u8],
        endian: ElfEndian,
        _class: ElfClass,
    ) -> Result<(), RelocFailure> {
        let s = input.symbol_value;
        let a = input.addend;
        let p = input.place;
        let sa = s.wrapping_add(a as u64);
        match input.rtype {
            R_X86_64_NONE => Ok(()),
            R_X86_64_64 => {
                put_u64_at(bytes, endian, sa);
                Ok(())
            }
            R_X86_64_32 => {
                check_u32(sa)?;
                put_u32_at(bytes, endian, sa as u32);
                Ok(())
            }
            R_X86_64_32S => {
                check_i32(sa as i64)?;
                put_u32_at(bytes, endian, sa as u32);
                Ok(())
            }
            R_X86_64_16 => {
                put_u16_at(bytes, endian, sa as u16);
                Ok(())
            }
            R_X86_64_8 => {
                bytes[0] = sa as u8;
                Ok(())
            }
            R_X86_64_PC32 | R_X86_64_PLT32 => {
                let x = sa.wrapping_sub(p) as i64;
                check_i32(x)?;
                put_u32_at(bytes, endian, x as u32);
                Ok(())
            }
            R_X86_64_PC64 => {
                let x = sa.wrapping_sub(p);
                put_u64_at(bytes, endian, x);
                Ok(())
            }
            R_X86_64_GOTPCREL | R_X86_64_GOTPCRELX | R_X86_64_REX_GOTPCRELX
            | R_X86_64_GOTTPOFF | R_X86_64_TLSGD | R_X86_64_TLSLD => {
                let slot = input.got_value.ok_or(RelocFailure::BadPairing)?;
                let x = slot.wrapping_add(a as u64).wrapping_sub(p) as i64;
                check_i32(x)?;
                put_u32_at(bytes, endian, x as u32);
                Ok(())
            }
            R_X86_64_GOT32 => {
                let slot = input.got_value.ok_or(RelocFailure::BadPairing)?;
                let x = slot.wrapping_add(a as u64).wrapping_sub(input.got_base) as i64;
                check_i32(x)?;
                put_u32_at(bytes, endian, x as u32);
                Ok(())
            }
            R_X86_64_TPOFF32 => {
                // x86-64 TP offsets are negative from the thread pointer
                let x = (sa.wrapping_sub(input.tls_base) as i64)
                    .wrapping_sub(align_tls(input) as i64);
                check_i32(x)?;
                put_u32_at(bytes, endian, x as u32);
                Ok(())
            }
            R_X86_64_DTPOFF32 => {
                let x = sa.wrapping_sub(input.tls_base) as i64;
                check_i32(x)?;
                put_u32_at(bytes, endian, x as u32);
                Ok(())
            }
            other => Err(RelocFailure::Unsupported { rtype: other }),
        }
    }

    fn plt_header_size(&self) -> u64 {
        16
    }

    fn plt_entry_size(&self) -> u64 {
        16
    }

    fn write_plt_header(&self, got_plt: u64, plt: u64, endian: ElfEndian) -> Vec<u8> {
        let _ = endian;
        // pushq .got.plt+8(%rip); jmpq *.got.plt+16(%rip); pad
        let mut out = vec![0u8; 16];
        out[0] = 0xff;
        out[1] = 0x35;
        let push_disp = got_plt.wrapping_add(8).wrapping_sub(plt.wrapping_add(6)) as u32;
        put_u32_at(&mut out[2..], ElfEndian::Little, push_disp);
        out[6] = 0xff;
        out[7] = 0x25;
        let jmp_disp = got_plt.wrapping_add(16).wrapping_sub(plt.wrapping_add(12)) as u32;
        put_u32_at(&mut out[8..], ElfEndian::Little, jmp_disp);
        out[12] = 0x0f;
        out[13] = 0x1f;
        out[14] = 0x40;
        out[15] = 0x00;
        out
    }

    fn write_plt_entry(
        &self,
        slot: u64,
        plt_entry_addr: u64,
        index: usize,
        endian: ElfEndian,
    ) -> Vec<u8> {
        let _ = endian;
        // jmpq *slot(%rip); pushq $index; jmp plt0
        let mut out = vec![0u8; 16];
        out[0] = 0xff;
        out[1] = 0x25;
        let disp = slot.wrapping_sub(plt_entry_addr.wrapping_add(6)) as u32;
        put_u32_at(&mut out[2..], ElfEndian::Little, disp);
        out[6] = 0x68;
        put_u32_at(&mut out[7..], ElfEndian::Little, index as u32);
        out[11] = 0xe9;
        // back to the header: entry i sits at plt0 + 16 * (i + 1)
        let back = (16 * (index as i64 + 1) + 16) as u32;
        put_u32_at(&mut out[12..], ElfEndian::Little, back.wrapping_neg());
        out
    }
}

fn align_tls(_input: &RelocInput) -> u64 {
    0
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn apply(rtype: u32, s: u64, a: i64, p: u64, bytes: &mut [u8]) -> Result<(), RelocFailure> {
        X86_64.apply(
            &RelocInput {
                rtype,
                symbol_value: s,
                addend: a,
                place: p,
                paired_value: None,
                got_value: Some(0x3000),
                got_base: 0x3000,
                tls_base: 0,
                gp: None,
                is_static: false,
                rewrite_abs: false,
            },
            bytes,
            ElfEndian::Little,
            ElfClass::Elf64,
        )
    }

    #[test]
    fn test_pc32() {
        let mut bytes = [0u8; 4];
        apply(R_X86_64_PC32, 0x2000, -4, 0x1000, &mut bytes).unwrap();
        assert_eq!(u32::from_le_bytes(bytes), 0xffc);
    }

    #[test]
    fn test_abs_overflow() {
        let mut bytes = [0u8; 4];
        assert!(matches!(
            apply(R_X86_64_32, u64::MAX, 0, 0, &mut bytes),
            Err(RelocFailure::Overflow { .. })
        ));
        // 32S accepts sign-extended negatives that 32 rejects
        apply(R_X86_64_32S, u64::MAX, 0, 0, &mut bytes).unwrap();
        assert_eq!(i32::from_le_bytes(bytes), -1);
    }

    #[test]
    fn test_gotpcrel_uses_slot() {
        let mut bytes = [0u8; 4];
        apply(R_X86_64_GOTPCREL, 0x9999, -4, 0x1000, &mut bytes).unwrap();
        // slot (0x3000) - 4 - place
        assert_eq!(u32::from_le_bytes(bytes), 0x1ffc);
    }

    #[test]
    fn test_plt_entry_shape() {
        let entry = X86_64.write_plt_entry(0x5018, 0x4010, 0, ElfEndian::Little);
        assert_eq!(entry.len(), 16);
        assert_eq!(&entry[..2], &[0xff, 0x25]);
        assert_eq!(entry[6], 0x68);
    }
}

//! AArch64 backend: the common data, branch and page-addressing
//! relocations plus PLT templates.

use super::{ClassifyInput, DynRelocCodes, RelocFailure, RelocInput, TargetInfo};
use crate::elf::{
    write::{get_u32_at, put_u32_at, put_u64_at},
    ElfClass, ElfEndian, ElfMachine,
};
use crate::reloc::RelocAction;

pub const R_AARCH64_NONE: u32 = 0;
pub const R_AARCH64_ABS64: u32 = 257;
pub const R_AARCH64_ABS32: u32 = 258;
pub const R_AARCH64_PREL32: u32 = 261;
pub const R_AARCH64_ADR_PREL_PG_HI21: u32 = 275;
pub const R_AARCH64_ADD_ABS_LO12_NC: u32 = 277;
pub const R_AARCH64_LDST8_ABS_LO12_NC: u32 = 278;
pub const R_AARCH64_JUMP26: u32 = 282;
pub const R_AARCH64_CALL26: u32 = 283;
pub const R_AARCH64_LDST64_ABS_LO12_NC: u32 = 286;
pub const R_AARCH64_ADR_GOT_PAGE: u32 = 311;
pub const R_AARCH64_LD64_GOT_LO12_NC: u32 = 312;
pub const R_AARCH64_TLSIE_ADR_GOTTPREL_PAGE21: u32 = 541;
pub const R_AARCH64_TLSIE_LD64_GOTTPREL_LO12_NC: u32 = 542;
pub const R_AARCH64_TLSLE_ADD_TPREL_HI12: u32 = 549;
pub const R_AARCH64_TLSLE_ADD_TPREL_LO12_NC: u32 = 551;
pub const R_AARCH64_COPY: u32 = 1024;
pub const R_AARCH64_GLOB_DAT: u32 = 1025;
pub const R_AARCH64_JUMP_SLOT: u32 = 1026;
pub const R_AARCH64_RELATIVE: u32 = 1027;
pub const R_AARCH64_TLS_DTPMOD: u32 = 1028;
pub const R_AARCH64_TLS_DTPREL: u32 = 1029;
pub const R_AARCH64_TLS_TPREL: u32 = 1030;
pub const R_AARCH64_IRELATIVE: u32 = 1032;

const NAMES: &[(u32, &str)] = &[
    (R_AARCH64_ABS64, "R_AARCH64_ABS64"),
    (R_AARCH64_ABS32, "R_AARCH64_ABS32"),
    (R_AARCH64_PREL32, "R_AARCH64_PREL32"),
    (R_AARCH64_ADR_PREL_PG_HI21, "R_AARCH64_ADR_PREL_PG_HI21"),
    (R_AARCH64_ADD_ABS_LO12_NC, "R_AARCH64_ADD_ABS_LO12_NC"),
    (R_AARCH64_JUMP26, "R_AARCH64_JUMP26"),
    (R_AARCH64_CALL26, "R_AARCH64_CALL26"),
    (R_AARCH64_LDST64_ABS_LO12_NC, "R_AARCH64_LDST64_ABS_LO12_NC"),
    (R_AARCH64_ADR_GOT_PAGE, "R_AARCH64_ADR_GOT_PAGE"),
    (R_AARCH64_LD64_GOT_LO12_NC, "R_AARCH64_LD64_GOT_LO12_NC"),
];

/// The AArch64 backend.
pub struct AArch64;

fn page(value: u64) -> u64 {
    value & !0xfff
}

fn patch_adrp(word: u32, value: i64) -> Result<u32, RelocFailure> {
    if value < -(1i64 << 32) || value >= (1i64 << 32) {
        return Err(RelocFailure::Overflow {
            value: value as u64,
        });
    }
    let imm = (value >> 12) as u32;
    Ok((word & 0x9f00_001f) | ((imm & 0x3) << 29) | (((imm >> 2) & 0x7_ffff) << 5))
}

fn patch_imm12(word: u32, value: u64, scale: u32) -> u32 {
    let imm = ((value & 0xfff) >> scale) as u32;
    (word & !(0xfff << 10)) | (imm << 10)
}

fn patch_branch26(word: u32, value: i64) -> Result<u32, RelocFailure> {
    if value % 4 != 0 {
        return Err(RelocFailure::BadAlignment {
            value: value as u64,
            required: 4,
        });
    }
    if value < -(1i64 << 27) || value >= (1i64 << 27) {
        return Err(RelocFailure::Overflow {
            value: value as u64,
        });
    }
    Ok((word & 0xfc00_0000) | (((value >> 2) as u32) & 0x03ff_ffff))
}

impl TargetInfo for AArch64 {
    fn machine(&self) -> ElfMachine {
        ElfMachine::AArch64
    }

    fn name(&self) -> &'static str {
        "aarch64"
    }

    fn reloc_name(&self, rtype: u32) -> String {
        NAMES
            .iter()
            .find(|&&(t, _)| t == rtype)
            .map(|&(_, n)| n.to_string())
            .unwrap_or_else(|| format!("R_AARCH64_<{rtype}>"))
    }

    fn classify(&self, input: &ClassifyInput) -> RelocAction {
        match input.rtype {
            R_AARCH64_ABS64 | R_AARCH64_ABS32 => {
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
            R_AARCH64_ADR_GOT_PAGE | R_AARCH64_LD64_GOT_LO12_NC => RelocAction::Got,
            R_AARCH64_CALL26 | R_AARCH64_JUMP26 => {
                if input.preemptible && input.is_func && !input.is_static {
                    RelocAction::Plt
                } else {
                    RelocAction::None
                }
            }
            R_AARCH64_TLSIE_ADR_GOTTPREL_PAGE21 | R_AARCH64_TLSIE_LD64_GOTTPREL_LO12_NC => {
                RelocAction::TlsIe
            }
            R_AARCH64_TLSLE_ADD_TPREL_HI12 | R_AARCH64_TLSLE_ADD_TPREL_LO12_NC => {
                RelocAction::TlsLe
            }
            _ => RelocAction::None,
        }
    }

    fn redirects_to_plt(&self, rtype: u32) -> bool {
        matches!(rtype, R_AARCH64_CALL26 | R_AARCH64_JUMP26)
    }

    fn uses_got(&self, rtype: u32) -> bool {
        matches!(
            rtype,
            R_AARCH64_ADR_GOT_PAGE
                | R_AARCH64_LD64_GOT_LO12_NC
                | R_AARCH64_TLSIE_ADR_GOTTPREL_PAGE21
                | R_AARCH64_TLSIE_LD64_GOTTPREL_LO12_NC
        )
    }

    fn dyn_codes(&self) -> DynRelocCodes {
        DynRelocCodes {
            relative: R_AARCH64_RELATIVE,
            glob_dat: R_AARCH64_GLOB_DAT,
            jump_slot: R_AARCH64_JUMP_SLOT,
            copy: R_AARCH64_COPY,
            symbolic: R_AARCH64_ABS64,
            dtpmod: R_AARCH64_TLS_DTPMOD,
            dtprel: R_AARCH64_TLS_DTPREL,
            tprel: R_AARCH64_TLS_TPREL,
            irelative: R_AARCH64_IRELATIVE,
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
            R_AARCH64_NONE => Ok(()),
            R_AARCH64_ABS64 => {
                put_u64_at(bytes, endian, sa);
                Ok(())
            }
            R_AARCH64_ABS32 => {
                u32::try_from(sa).map_err(|_| RelocFailure::Overflow { value: sa })?;
                put_u32_at(bytes, endian, sa as u32);
                Ok(())
            }
            R_AARCH64_PREL32 => {
                let x = sa.wrapping_sub(p) as i64;
                i32::try_from(x).map_err(|_| RelocFailure::Overflow { value: x as u64 })?;
                put_u32_at(bytes, endian, x as u32);
                Ok(())
            }
            R_AARCH64_ADR_PREL_PG_HI21 => {
                let x = page(sa).wrapping_sub(page(p)) as i64;
                let word = get_u32_at(bytes, endian);
                put_u32_at(bytes, endian, patch_adrp(word, x)?);
                Ok(())
            }
            R_AARCH64_ADD_ABS_LO12_NC => {
                let word = get_u32_at(bytes, endian);
                put_u32_at(bytes, endian, patch_imm12(word, sa, 0));
                Ok(())
            }
            R_AARCH64_LDST8_ABS_LO12_NC => {
                let word = get_u32_at(bytes, endian);
                put_u32_at(bytes, endian, patch_imm12(word, sa, 0));
                Ok(())
            }
            R_AARCH64_LDST64_ABS_LO12_NC => {
                let word = get_u32_at(bytes, endian);
                put_u32_at(bytes, endian, patch_imm12(word, sa, 3));
                Ok(())
            }
            R_AARCH64_CALL26 | R_AARCH64_JUMP26 => {
                let x = sa.wrapping_sub(p) as i64;
                let word = get_u32_at(bytes, endian);
                put_u32_at(bytes, endian, patch_branch26(word, x)?);
                Ok(())
            }
            R_AARCH64_ADR_GOT_PAGE | R_AARCH64_TLSIE_ADR_GOTTPREL_PAGE21 => {
                let slot = input.got_value.ok_or(RelocFailure::BadPairing)?;
                let x = page(slot.wrapping_add(a as u64)).wrapping_sub(page(p)) as i64;
                let word = get_u32_at(bytes, endian);
                put_u32_at(bytes, endian, patch_adrp(word, x)?);
                Ok(())
            }
            R_AARCH64_LD64_GOT_LO12_NC | R_AARCH64_TLSIE_LD64_GOTTPREL_LO12_NC => {
                let slot = input.got_value.ok_or(RelocFailure::BadPairing)?;
                let word = get_u32_at(bytes, endian);
                put_u32_at(bytes, endian, patch_imm12(word, slot.wrapping_add(a as u64), 3));
                Ok(())
            }
            R_AARCH64_TLSLE_ADD_TPREL_HI12 => {
                let x = sa.wrapping_sub(input.tls_base);
                let word = get_u32_at(bytes, endian);
                put_u32_at(bytes, endian, patch_imm12(word, x >> 12, 0));
                Ok(())
            }
            R_AARCH64_TLSLE_ADD_TPREL_LO12_NC => {
                let x = sa.wrapping_sub(input.tls_base);
                let word = get_u32_at(bytes, endian);
                put_u32_at(bytes, endian, patch_imm12(word, x, 0));
                Ok(())
            }
            other => Err(RelocFailure::Unsupported { rtype: other }),
        }
    }

    fn plt_header_size(&self) -> u64 {
        32
    }

    fn plt_entry_size(&self) -> u64 {
        16
    }

    fn write_plt_header(&self, got_plt: u64, plt: u64, endian: ElfEndian) -> Vec<u8> {
        // stp x16/x30, adrp x16 to the resolver slot, ldr+add, br x17
        let slot2 = got_plt + 16;
        let x = (page(slot2).wrapping_sub(page(plt + 4))) as i64;
        let mut words: [u32; 8] = [
            0xa9bf_7bf0, // stp x16, x30, [sp, #-16]!
            0x9000_0010, // adrp x16, resolver page
            0xf940_0211, // ldr x17, [x16, lo]
            0x9100_0210, // add x16, x16, lo
            0xd61f_0220, // br x17
            0xd503_201f, // nop
            0xd503_201f,
            0xd503_201f,
        ];
        if let Ok(adrp) = patch_adrp(words[1], x) {
            words[1] = adrp;
        }
        words[2] = patch_imm12(words[2], slot2, 3);
        words[3] = patch_imm12(words[3], slot2, 0);
        let mut out = vec![0u8; 32];
        for (i, w) in words.iter().enumerate() {
            put_u32_at(&mut out[i * 4..], endian, *w);
        }
        out
    }

    fn write_plt_entry(
        &self,
        slot: u64,
        plt_entry_addr: u64,
        _index: usize,
        endian: ElfEndian,
    ) -> Vec<u8> {
        let x = (page(slot).wrapping_sub(page(plt_entry_addr))) as i64;
        let mut words: [u32; 4] = [
            0x9000_0010, // adrp x16, slot page
            0xf940_0211, // ldr x17, [x16, lo]
            0x9100_0210, // add x16, x16, lo
            0xd61f_0220, // br x17
        ];
        if let Ok(adrp) = patch_adrp(words[0], x) {
            words[0] = adrp;
        }
        words[1] = patch_imm12(words[1], slot, 3);
        words[2] = patch_imm12(words[2], slot, 0);
        let mut out = vec![0u8; 16];
        for (i, w) in words.iter().enumerate() {
            put_u32_at(&mut out[i * 4..], endian, *w);
        }
        out
    }
}

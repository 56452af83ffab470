//! RISC-V backend: relocation arithmetic, HI/LO pairing, PLT templates
//! and the relaxation predicates the driver consults.

use super::{
    ClassifyInput, DynRelocCodes, PairRole, RelocFailure, RelocInput, TargetInfo,
};
use crate::elf::{
    write::{get_u16_at, get_u32_at, put_u16_at, put_u32_at, put_u64_at},
    ElfClass, ElfEndian, ElfMachine,
};
use crate::reloc::RelocAction;

// relocation types
pub const R_RISCV_NONE: u32 = 0;
pub const R_RISCV_32: u32 = 1;
pub const R_RISCV_64: u32 = 2;
pub const R_RISCV_RELATIVE: u32 = 3;
pub const R_RISCV_COPY: u32 = 4;
pub const R_RISCV_JUMP_SLOT: u32 = 5;
pub const R_RISCV_TLS_DTPMOD32: u32 = 6;
pub const R_RISCV_TLS_DTPMOD64: u32 = 7;
pub const R_RISCV_TLS_DTPREL32: u32 = 8;
pub const R_RISCV_TLS_DTPREL64: u32 = 9;
pub const R_RISCV_TLS_TPREL32: u32 = 10;
pub const R_RISCV_TLS_TPREL64: u32 = 11;
pub const R_RISCV_BRANCH: u32 = 16;
pub const R_RISCV_JAL: u32 = 17;
pub const R_RISCV_CALL: u32 = 18;
pub const R_RISCV_CALL_PLT: u32 = 19;
pub const R_RISCV_GOT_HI20: u32 = 20;
pub const R_RISCV_TLS_GOT_HI20: u32 = 21;
pub const R_RISCV_TLS_GD_HI20: u32 = 22;
pub const R_RISCV_PCREL_HI20: u32 = 23;
pub const R_RISCV_PCREL_LO12_I: u32 = 24;
pub const R_RISCV_PCREL_LO12_S: u32 = 25;
pub const R_RISCV_HI20: u32 = 26;
pub const R_RISCV_LO12_I: u32 = 27;
pub const R_RISCV_LO12_S: u32 = 28;
pub const R_RISCV_TPREL_HI20: u32 = 29;
pub const R_RISCV_TPREL_LO12_I: u32 = 30;
pub const R_RISCV_TPREL_LO12_S: u32 = 31;
pub const R_RISCV_TPREL_ADD: u32 = 32;
pub const R_RISCV_ADD8: u32 = 33;
pub const R_RISCV_ADD16: u32 = 34;
pub const R_RISCV_ADD32: u32 = 35;
pub const R_RISCV_ADD64: u32 = 36;
pub const R_RISCV_SUB8: u32 = 37;
pub const R_RISCV_SUB16: u32 = 38;
pub const R_RISCV_SUB32: u32 = 39;
pub const R_RISCV_SUB64: u32 = 40;
pub const R_RISCV_ALIGN: u32 = 43;
pub const R_RISCV_RVC_BRANCH: u32 = 44;
pub const R_RISCV_RVC_JUMP: u32 = 45;
pub const R_RISCV_RELAX: u32 = 51;
pub const R_RISCV_SET6: u32 = 53;
pub const R_RISCV_SET8: u32 = 54;
pub const R_RISCV_SET16: u32 = 55;
pub const R_RISCV_SET32: u32 = 56;
pub const R_RISCV_32_PCREL: u32 = 57;

/// Internal marker for a `HI20/LO12` pair relaxed to `gp`-relative
/// addressing; not an ABI type.
pub const R_RISCV_INTERNAL_GPREL_I: u32 = 0xff00_0001;
pub const R_RISCV_INTERNAL_GPREL_S: u32 = 0xff00_0002;

const NAMES: &[(u32, &str)] = &[
    (R_RISCV_NONE, "R_RISCV_NONE"),
    (R_RISCV_32, "R_RISCV_32"),
    (R_RISCV_64, "R_RISCV_64"),
    (R_RISCV_RELATIVE, "R_RISCV_RELATIVE"),
    (R_RISCV_COPY, "R_RISCV_COPY"),
    (R_RISCV_JUMP_SLOT, "R_RISCV_JUMP_SLOT"),
    (R_RISCV_BRANCH, "R_RISCV_BRANCH"),
    (R_RISCV_JAL, "R_RISCV_JAL"),
    (R_RISCV_CALL, "R_RISCV_CALL"),
    (R_RISCV_CALL_PLT, "R_RISCV_CALL_PLT"),
    (R_RISCV_GOT_HI20, "R_RISCV_GOT_HI20"),
    (R_RISCV_TLS_GOT_HI20, "R_RISCV_TLS_GOT_HI20"),
    (R_RISCV_TLS_GD_HI20, "R_RISCV_TLS_GD_HI20"),
    (R_RISCV_PCREL_HI20, "R_RISCV_PCREL_HI20"),
    (R_RISCV_PCREL_LO12_I, "R_RISCV_PCREL_LO12_I"),
    (R_RISCV_PCREL_LO12_S, "R_RISCV_PCREL_LO12_S"),
    (R_RISCV_HI20, "R_RISCV_HI20"),
    (R_RISCV_LO12_I, "R_RISCV_LO12_I"),
    (R_RISCV_LO12_S, "R_RISCV_LO12_S"),
    (R_RISCV_TPREL_HI20, "R_RISCV_TPREL_HI20"),
    (R_RISCV_TPREL_LO12_I, "R_RISCV_TPREL_LO12_I"),
    (R_RISCV_TPREL_LO12_S, "R_RISCV_TPREL_LO12_S"),
    (R_RISCV_TPREL_ADD, "R_RISCV_TPREL_ADD"),
    (R_RISCV_ALIGN, "R_RISCV_ALIGN"),
    (R_RISCV_RVC_BRANCH, "R_RISCV_RVC_BRANCH"),
    (R_RISCV_RVC_JUMP, "R_RISCV_RVC_JUMP"),
    (R_RISCV_RELAX, "R_RISCV_RELAX"),
    (R_RISCV_32_PCREL, "R_RISCV_32_PCREL"),
];

/// The RISC-V backend; RV32 and RV64 share it, keyed by class.
pub struct RiscV {
    class: ElfClass,
}

impl RiscV {
    pub fn new(class: ElfClass) -> Self {
        RiscV { class }
    }
}

/// Sign-extended low 12 bits of `value` with the `+0x800` page bias:
/// `value - ((value + 0x800) & !0xfff)`.
pub fn lo12(value: i64) -> i32 {
    (value - ((value + 0x800) & !0xfff)) as i32
}

/// High 20 bits of `value` with the bias.
pub fn hi20(value: i64) -> i64 {
    (value + 0x800) >> 12
}

/// Whether a PC-relative displacement fits the `AUIPC` ±2 GiB window.
pub fn fits_pcrel(value: i64) -> bool {
    let biased = value.wrapping_add(0x800);
    i32::try_from(biased).is_ok()
}

/// Whether an absolute value fits the `LUI` window (signed 32-bit after
/// the bias); the predicate of the static `PCREL_HI20` → `LUI` rewrite.
pub fn fits_lui(value: u64) -> bool {
    let biased = (value as i64).wrapping_add(0x800);
    i32::try_from(biased).is_ok()
}

fn patch_utype(word: u32, imm_hi20: i64) -> u32 {
    (word & 0xfff) | (((imm_hi20 as u32) & 0xf_ffff) << 12)
}

fn patch_itype(word: u32, imm12: i32) -> u32 {
    (word & 0x000f_ffff) | (((imm12 as u32) & 0xfff) << 20)
}

fn patch_stype(word: u32, imm12: i32) -> u32 {
    let imm = imm12 as u32;
    (word & 0x01ff_f07f) | (((imm >> 5) & 0x7f) << 25) | ((imm & 0x1f) << 7)
}

fn patch_btype(word: u32, offset: i64) -> u32 {
    let imm = offset as u32;
    (word & 0x01ff_f07f)
        | (((imm >> 12) & 1) << 31)
        | (((imm >> 5) & 0x3f) << 25)
        | (((imm >> 1) & 0xf) << 8)
        | (((imm >> 11) & 1) << 7)
}

fn patch_jtype(word: u32, offset: i64) -> u32 {
    let imm = offset as u32;
    (word & 0xfff)
        | (((imm >> 20) & 1) << 31)
        | (((imm >> 1) & 0x3ff) << 21)
        | (((imm >> 11) & 1) << 20)
        | (((imm >> 12) & 0xff) << 12)
}

fn patch_cb(word: u16, offset: i64) -> u16 {
    let imm = offset as u16;
    (word & 0xe383)
        | (((imm >> 8) & 1) << 12)
        | (((imm >> 3) & 3) << 10)
        | (((imm >> 6) & 3) << 5)
        | (((imm >> 1) & 3) << 3)
        | (((imm >> 5) & 1) << 2)
}

fn patch_cj(word: u16, offset: i64) -> u16 {
    let imm = offset as u16;
    (word & 0xe003)
        | (((imm >> 11) & 1) << 12)
        | (((imm >> 4) & 1) << 11)
        | (((imm >> 8) & 3) << 9)
        | (((imm >> 10) & 1) << 8)
        | (((imm >> 6) & 1) << 7)
        | (((imm >> 7) & 1) << 6)
        | (((imm >> 1) & 7) << 3)
        | (((imm >> 5) & 1) << 2)
}

const OPC_LUI: u32 = 0x37;
const OPC_AUIPC: u32 = 0x17;

// register numbers used by the PLT templates
const X0: u32 = 0;
const T0: u32 = 5;
const T1: u32 = 6;
const T2: u32 = 7;
const T3: u32 = 28;

fn utype(opcode: u32, rd: u32, imm_hi20: i64) -> u32 {
    opcode | (rd << 7) | (((imm_hi20 as u32) & 0xf_ffff) << 12)
}

fn itype(opcode: u32, rd: u32, funct3: u32, rs1: u32, imm12: i32) -> u32 {
    opcode | (rd << 7) | (funct3 << 12) | (rs1 << 15) | (((imm12 as u32) & 0xfff) << 20)
}

fn sub(rd: u32, rs1: u32, rs2: u32) -> u32 {
    0x33 | (rd << 7) | (rs1 << 15) | (rs2 << 20) | (0x20 << 25)
}

fn check_range(value: i64, bits: u32) -> Result<(), RelocFailure> {
    let min = -(1i64 << (bits - 1));
    let max = (1i64 << (bits - 1)) - 1;
    if value < min || value > max {
        return Err(RelocFailure::Overflow {
            value: value as u64,
        });
    }
    Ok(())
}

fn check_align(value: i64, align: u64) -> Result<(), RelocFailure> {
    if (value as u64) % align != 0 {
        return Err(RelocFailure::BadAlignment {
            value: value as u64,
            required: align,
        });
    }
    Ok(())
}

impl TargetInfo for RiscV {
    fn machine(&self) -> ElfMachine {
        ElfMachine::RiscV
    }

    fn name(&self) -> &'static str {
        match self.class {
            ElfClass::Elf32 => "riscv32",
            ElfClass::Elf64 => "riscv64",
        }
    }

    fn reloc_name(&self, rtype: u32) -> String {
        NAMES
            .iter()
            .find(|&&(t, _)| t == rtype)
            .map(|&(_, n)| n.to_string())
            .unwrap_or_else(|| format!("R_RISCV_<{rtype}>"))
    }

    fn classify(&self, input: &ClassifyInput) -> RelocAction {
        match input.rtype {
            R_RISCV_32 | R_RISCV_64 => {
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
            R_RISCV_GOT_HI20 => RelocAction::Got,
            R_RISCV_CALL | R_RISCV_CALL_PLT => {
                if input.preemptible && input.is_func && !input.is_static {
                    RelocAction::Plt
                } else {
                    RelocAction::None
                }
            }
            R_RISCV_TLS_GD_HI20 => RelocAction::TlsGd,
            R_RISCV_TLS_GOT_HI20 => RelocAction::TlsIe,
            R_RISCV_TPREL_HI20 | R_RISCV_TPREL_LO12_I | R_RISCV_TPREL_LO12_S
            | R_RISCV_TPREL_ADD => RelocAction::TlsLe,
            _ => RelocAction::None,
        }
    }

    fn pair_role(&self, rtype: u32) -> PairRole {
        match rtype {
            R_RISCV_PCREL_HI20 | R_RISCV_GOT_HI20 | R_RISCV_TLS_GOT_HI20
            | R_RISCV_TLS_GD_HI20 => PairRole::High,
            R_RISCV_PCREL_LO12_I | R_RISCV_PCREL_LO12_S => PairRole::Low,
            _ => PairRole::None,
        }
    }

    fn redirects_to_plt(&self, rtype: u32) -> bool {
        matches!(rtype, R_RISCV_CALL | R_RISCV_CALL_PLT)
    }

    fn uses_got(&self, rtype: u32) -> bool {
        matches!(
            rtype,
            R_RISCV_GOT_HI20 | R_RISCV_TLS_GOT_HI20 | R_RISCV_TLS_GD_HI20
        )
    }

    fn dyn_codes(&self) -> DynRelocCodes {
        let (dtpmod, dtprel, tprel) = match self.class {
            ElfClass::Elf32 => (R_RISCV_TLS_DTPMOD32, R_RISCV_TLS_DTPREL32, R_RISCV_TLS_TPREL32),
            ElfClass::Elf64 => (R_RISCV_TLS_DTPMOD64, R_RISCV_TLS_DTPREL64, R_RISCV_TLS_TPREL64),
        };
        DynRelocCodes {
            relative: R_RISCV_RELATIVE,
            glob_dat: match self.class {
                ElfClass::Elf32 => R_RISCV_32,
                ElfClass::Elf64 => R_RISCV_64,
            },
            jump_slot: R_RISCV_JUMP_SLOT,
            copy: R_RISCV_COPY,
            symbolic: match self.class {
                ElfClass::Elf32 => R_RISCV_32,
                ElfClass::Elf64 => R_RISCV_64,
            },
            dtpmod,
            dtprel,
            tprel,
            irelative: 58,
        }
    }

    fn apply(
        &self,
        input: &RelocInput,
        bytes: &mut [u8],
        endian: ElfEndian,
        class: ElfClass,
    ) -> Result<(), RelocFailure> {
        let s = input.symbol_value;
        let a = input.addend;
        let p = input.place;
        let sa = s.wrapping_add(a as u64);
        match input.rtype {
            R_RISCV_NONE | R_RISCV_RELAX | R_RISCV_ALIGN | R_RISCV_TPREL_ADD => Ok(()),
            R_RISCV_32 => {
                if class == ElfClass::Elf64 {
                    check_range(sa as i64, 33)?;
                }
                put_u32_at(bytes, endian, sa as u32);
                Ok(())
            }
            R_RISCV_64 => {
                put_u64_at(bytes, endian, sa);
                Ok(())
            }
            R_RISCV_32_PCREL => {
                let x = sa.wrapping_sub(p) as i64;
                check_range(x, 32)?;
                put_u32_at(bytes, endian, x as u32);
                Ok(())
            }
            R_RISCV_BRANCH => {
                let x = sa.wrapping_sub(p) as i64;
                check_range(x, 13)?;
                check_align(x, 2)?;
                let word = get_u32_at(bytes, endian);
                put_u32_at(bytes, endian, patch_btype(word, x));
                Ok(())
            }
            R_RISCV_JAL => {
                let x = sa.wrapping_sub(p) as i64;
                check_range(x, 21)?;
                check_align(x, 2)?;
                let word = get_u32_at(bytes, endian);
                put_u32_at(bytes, endian, patch_jtype(word, x));
                Ok(())
            }
            R_RISCV_RVC_BRANCH => {
                let x = sa.wrapping_sub(p) as i64;
                check_range(x, 9)?;
                check_align(x, 2)?;
                let half = get_u16_at(bytes, endian);
                put_u16_at(bytes, endian, patch_cb(half, x));
                Ok(())
            }
            R_RISCV_RVC_JUMP => {
                let x = sa.wrapping_sub(p) as i64;
                check_range(x, 12)?;
                check_align(x, 2)?;
                let half = get_u16_at(bytes, endian);
                put_u16_at(bytes, endian, patch_cj(half, x));
                Ok(())
            }
            R_RISCV_CALL | R_RISCV_CALL_PLT => {
                // AUIPC + JALR pair at P
                let x = sa.wrapping_sub(p) as i64;
                if !fits_pcrel(x) {
                    return Err(RelocFailure::Overflow { value: x as u64 });
                }
                let auipc = get_u32_at(bytes, endian);
                put_u32_at(bytes, endian, patch_utype(auipc, hi20(x)));
                let jalr = get_u32_at(&bytes[4..], endian);
                put_u32_at(&mut bytes[4..], endian, patch_itype(jalr, lo12(x)));
                Ok(())
            }
            R_RISCV_GOT_HI20 | R_RISCV_TLS_GOT_HI20 | R_RISCV_TLS_GD_HI20 => {
                let slot = input.got_value.ok_or(RelocFailure::BadPairing)?;
                let x = slot.wrapping_add(a as u64).wrapping_sub(p) as i64;
                if !fits_pcrel(x) {
                    return Err(RelocFailure::Overflow { value: x as u64 });
                }
                let word = get_u32_at(bytes, endian);
                put_u32_at(bytes, endian, patch_utype(word, hi20(x)));
                Ok(())
            }
            R_RISCV_PCREL_HI20 => {
                let x = sa.wrapping_sub(p) as i64;
                if input.rewrite_abs {
                    // static rewrite: AUIPC becomes LUI with the absolute
                    // page of S + A
                    if !fits_lui(sa) {
                        return Err(RelocFailure::Overflow { value: sa });
                    }
                    let word = get_u32_at(bytes, endian);
                    let lui = (word & !0x7f) | OPC_LUI;
                    put_u32_at(bytes, endian, patch_utype(lui, hi20(sa as i64)));
                    return Ok(());
                }
                if !fits_pcrel(x) {
                    return Err(RelocFailure::Overflow { value: x as u64 });
                }
                let word = get_u32_at(bytes, endian);
                debug_assert_eq!(word & 0x7f, OPC_AUIPC);
                put_u32_at(bytes, endian, patch_utype(word, hi20(x)));
                Ok(())
            }
            R_RISCV_PCREL_LO12_I => {
                let x = input.paired_value.ok_or(RelocFailure::BadPairing)? as i64;
                let word = get_u32_at(bytes, endian);
                put_u32_at(bytes, endian, patch_itype(word, lo12(x)));
                Ok(())
            }
            R_RISCV_PCREL_LO12_S => {
                let x = input.paired_value.ok_or(RelocFailure::BadPairing)? as i64;
                let word = get_u32_at(bytes, endian);
                put_u32_at(bytes, endian, patch_stype(word, lo12(x)));
                Ok(())
            }
            R_RISCV_HI20 => {
                if !fits_lui(sa) {
                    return Err(RelocFailure::Overflow { value: sa });
                }
                let word = get_u32_at(bytes, endian);
                put_u32_at(bytes, endian, patch_utype(word, hi20(sa as i64)));
                Ok(())
            }
            R_RISCV_LO12_I => {
                let word = get_u32_at(bytes, endian);
                put_u32_at(bytes, endian, patch_itype(word, lo12(sa as i64)));
                Ok(())
            }
            R_RISCV_LO12_S => {
                let word = get_u32_at(bytes, endian);
                put_u32_at(bytes, endian, patch_stype(word, lo12(sa as i64)));
                Ok(())
            }
            R_RISCV_INTERNAL_GPREL_I | R_RISCV_INTERNAL_GPREL_S => {
                let gp = input.gp.ok_or(RelocFailure::BadPairing)?;
                let x = sa.wrapping_sub(gp) as i64;
                check_range(x, 12)?;
                let word = get_u32_at(bytes, endian);
                let patched = if input.rtype == R_RISCV_INTERNAL_GPREL_I {
                    patch_itype(word, x as i32)
                } else {
                    patch_stype(word, x as i32)
                };
                put_u32_at(bytes, endian, patched);
                Ok(())
            }
            R_RISCV_TPREL_HI20 => {
                let x = sa.wrapping_sub(input.tls_base) as i64;
                if !fits_lui(x as u64) {
                    return Err(RelocFailure::Overflow { value: x as u64 });
                }
                let word = get_u32_at(bytes, endian);
                put_u32_at(bytes, endian, patch_utype(word, hi20(x)));
                Ok(())
            }
            R_RISCV_TPREL_LO12_I => {
                let x = sa.wrapping_sub(input.tls_base) as i64;
                let word = get_u32_at(bytes, endian);
                put_u32_at(bytes, endian, patch_itype(word, lo12(x)));
                Ok(())
            }
            R_RISCV_TPREL_LO12_S => {
                let x = sa.wrapping_sub(input.tls_base) as i64;
                let word = get_u32_at(bytes, endian);
                put_u32_at(bytes, endian, patch_stype(word, lo12(x)));
                Ok(())
            }
            R_RISCV_ADD8 => rmw8(bytes, |v| v.wrapping_add(sa as u8)),
            R_RISCV_ADD16 => rmw16(bytes, endian, |v| v.wrapping_add(sa as u16)),
            R_RISCV_ADD32 => rmw32(bytes, endian, |v| v.wrapping_add(sa as u32)),
            R_RISCV_ADD64 => rmw64(bytes, endian, |v| v.wrapping_add(sa)),
            R_RISCV_SUB8 => rmw8(bytes, |v| v.wrapping_sub(sa as u8)),
            R_RISCV_SUB16 => rmw16(bytes, endian, |v| v.wrapping_sub(sa as u16)),
            R_RISCV_SUB32 => rmw32(bytes, endian, |v| v.wrapping_sub(sa as u32)),
            R_RISCV_SUB64 => rmw64(bytes, endian, |v| v.wrapping_sub(sa)),
            R_RISCV_SET6 => {
                bytes[0] = (bytes[0] & 0xc0) | (sa as u8 & 0x3f);
                Ok(())
            }
            R_RISCV_SET8 => {
                bytes[0] = sa as u8;
                Ok(())
            }
            R_RISCV_SET16 => {
                put_u16_at(bytes, endian, sa as u16);
                Ok(())
            }
            R_RISCV_SET32 => {
                put_u32_at(bytes, endian, sa as u32);
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
        // resolver trampoline: compute the gotplt base pc-relatively,
        // load the resolver address, scale the entry index and jump
        let x = got_plt.wrapping_sub(plt) as i64;
        let load_f3 = match self.class {
            ElfClass::Elf32 => 2, // lw
            ElfClass::Elf64 => 3, // ld
        };
        let shift = match self.class {
            ElfClass::Elf32 => 2,
            ElfClass::Elf64 => 1,
        };
        let words: [u32; 8] = [
            utype(OPC_AUIPC, T2, hi20(x)),
            sub(T1, T1, T3),
            itype(0x03, T3, load_f3, T2, lo12(x)),
            itype(0x13, T1, 0, T1, -44),
            itype(0x13, T0, 0, T2, lo12(x)),
            itype(0x13, T1, 5, T1, shift),
            itype(0x03, T0, load_f3, T0, self.class.word_size() as i32),
            itype(0x67, X0, 0, T3, 0),
        ];
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
        let x = slot.wrapping_sub(plt_entry_addr) as i64;
        let load_f3 = match self.class {
            ElfClass::Elf32 => 2,
            ElfClass::Elf64 => 3,
        };
        let words: [u32; 4] = [
            utype(OPC_AUIPC, T3, hi20(x)),
            itype(0x03, T3, load_f3, T3, lo12(x)),
            itype(0x67, T1, 0, T3, 0),
            itype(0x13, X0, 0, X0, 0), // nop
        ];
        let mut out = vec![0u8; 16];
        for (i, w) in words.iter().enumerate() {
            put_u32_at(&mut out[i * 4..], endian, *w);
        }
        out
    }

    fn supports_relaxation(&self) -> bool {
        true
    }
}

fn rmw8(bytes: &mut [u8], f: impl Fn(u8) -> u8) -> Result<(), RelocFailure> {
    bytes[0] = f(bytes[0]);
    Ok(())
}

fn rmw16(
    bytes: &mut [u8],
    endian: ElfEndian,
    f: impl Fn(u16) -> u16,
) -> Result<(), RelocFailure> {
    let v = get_u16_at(bytes, endian);
    put_u16_at(bytes, endian, f(v));
    Ok(())
}

fn rmw32(
    bytes: &mut [u8],
    endian: ElfEndian,
    f: impl Fn(u32) -> u32,
) -> Result<(), RelocFailure> {
    let v = get_u32_at(bytes, endian);
    put_u32_at(bytes, endian, f(v));
    Ok(())
}

fn rmw64(
    bytes: &mut [u8],
    endian: ElfEndian,
    f: impl Fn(u64) -> u64,
) -> Result<(), RelocFailure> {
    let v = crate::elf::write::get_u64_at(bytes, endian);
    put_u64_at(bytes, endian, f(v));
    Ok(())
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn apply(rtype: u32, s: u64, a: i64, p: u64, bytes: &mut [u8]) -> Result<(), RelocFailure> {
        apply_with(rtype, s, a, p, None, false, bytes)
    }

    fn apply_with(
        rtype: u32,
        s: u64,
        a: i64,
        p: u64,
        paired: Option<u64>,
        rewrite_abs: bool,
        bytes: &mut [u8],
    ) -> Result<(), RelocFailure> {
        let target = RiscV::new(ElfClass::Elf64);
        target.apply(
            &RelocInput {
                rtype,
                symbol_value: s,
                addend: a,
                place: p,
                paired_value: paired,
                got_value: None,
                got_base: 0,
                tls_base: 0,
                gp: None,
                is_static: true,
                rewrite_abs,
            },
            bytes,
            ElfEndian::Little,
            ElfClass::Elf64,
        )
    }

    #[test]
    fn test_lo12_bias() {
        assert_eq!(lo12(0x7ff), 0x7ff);
        assert_eq!(lo12(0x800), -2048);
        assert_eq!(lo12(0x1000), 0);
        assert_eq!(lo12(-1), -1);
        // hi/lo recompose
        for v in [0i64, 1, 0x7ff, 0x800, 0xfff, 0x12345, -5, -0x800] {
            assert_eq!((hi20(v) << 12) + i64::from(lo12(v)), v, "value {v:#x}");
        }
    }

    #[test]
    fn test_hi_lo_pair_matches_spec_formula() {
        // LO12 bits must equal (S+A) - ((S+A+0x800) & !0xFFF)
        for sa in [0x1234i64, 0x1800, 0xffff_f800u32 as i64] {
            let expect = sa - ((sa + 0x800) & !0xfff);
            assert_eq!(i64::from(lo12(sa)), expect);
        }
    }

    #[test]
    fn test_jal_encoding() {
        // jal x0, +8 from a JAL template
        let mut bytes = 0x0000_006fu32.to_le_bytes().to_vec();
        apply(R_RISCV_JAL, 0x1008, 0, 0x1000, &mut bytes).unwrap();
        let word = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        // imm[20|10:1|11|19:12] for +8 sets bit 21+2
        assert_eq!(word, 0x0080_006f);
    }

    #[test]
    fn test_branch_overflow() {
        let mut bytes = 0x0000_0063u32.to_le_bytes().to_vec();
        let err = apply(R_RISCV_BRANCH, 0x10_0000, 0, 0, &mut bytes).unwrap_err();
        assert!(matches!(err, RelocFailure::Overflow { .. }));
        let mut bytes = 0x0000_0063u32.to_le_bytes().to_vec();
        let err = apply(R_RISCV_BRANCH, 0x101, 0, 0x0, &mut bytes).unwrap_err();
        assert!(matches!(err, RelocFailure::BadAlignment { .. }));
    }

    #[test]
    fn test_call_pair() {
        // auipc ra / jalr ra
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&0x0000_0097u32.to_le_bytes());
        bytes.extend_from_slice(&0x0000_80e7u32.to_le_bytes());
        apply(R_RISCV_CALL, 0x1_1800, 0, 0x1_0000, &mut bytes).unwrap();
        let auipc = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let jalr = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        // x = 0x1800: hi = 2, lo = -2048
        assert_eq!(auipc >> 12, 2);
        assert_eq!((jalr as i32) >> 20, -2048);
    }

    #[test]
    fn test_pcrel_hi20_lui_rewrite() {
        // static rewrite turns AUIPC into LUI with the absolute page
        let mut bytes = 0x0000_0517u32.to_le_bytes().to_vec(); // auipc a0
        apply_with(R_RISCV_PCREL_HI20, 0x1_2800, 0, 0x8000_0000, None, true, &mut bytes)
            .unwrap();
        let word = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        assert_eq!(word & 0x7f, OPC_LUI);
        assert_eq!((word >> 7) & 0x1f, 10); // rd preserved
        assert_eq!(word >> 12, hi20(0x1_2800) as u32);
    }

    #[test]
    fn test_lui_rewrite_predicate_boundary() {
        // fits exactly up to the biased i32 range
        assert!(fits_lui(0x7fff_f7ff));
        assert!(!fits_lui(0x8000_0000u64.wrapping_sub(0x800) + 0x800));
        // S+A at 2^31 - 0x800 is the last page LUI reaches
        assert!(fits_lui((1u64 << 31) - 0x801));
        assert!(!fits_lui(1u64 << 31));
        // negative (high) addresses fit via sign extension on RV64
        assert!(fits_lui(0xffff_ffff_ffff_8000));
    }

    #[test]
    fn test_pcrel_lo12_uses_paired_value() {
        let mut bytes = 0x0000_0503u32.to_le_bytes().to_vec(); // lb a0
        let err = apply(R_RISCV_PCREL_LO12_I, 0, 0, 0, &mut bytes).unwrap_err();
        assert_eq!(err, RelocFailure::BadPairing);
        apply_with(
            R_RISCV_PCREL_LO12_I,
            0,
            0,
            0,
            Some(0x1834),
            false,
            &mut bytes,
        )
        .unwrap();
        let word = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        assert_eq!(((word as i32) >> 20), lo12(0x1834));
    }

    #[test]
    fn test_add_sub_pairs() {
        let mut bytes = 10u32.to_le_bytes().to_vec();
        apply(R_RISCV_ADD32, 5, 0, 0, &mut bytes).unwrap();
        assert_eq!(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]), 15);
        apply(R_RISCV_SUB32, 3, 0, 0, &mut bytes).unwrap();
        assert_eq!(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]), 12);
    }

    #[test]
    fn test_classification() {
        let target = RiscV::new(ElfClass::Elf64);
        let base = ClassifyInput {
            rtype: R_RISCV_CALL_PLT,
            preemptible: true,
            is_pic: true,
            is_static: false,
            is_func: true,
            is_tls: false,
            is_local: false,
            from_dynamic: true,
        };
        assert_eq!(target.classify(&base), RelocAction::Plt);
        let mut local = base;
        local.preemptible = false;
        assert_eq!(target.classify(&local), RelocAction::None);
        let mut abs = base;
        abs.rtype = R_RISCV_64;
        abs.preemptible = false;
        assert_eq!(target.classify(&abs), RelocAction::DynRelative);
        let mut got = base;
        got.rtype = R_RISCV_GOT_HI20;
        assert_eq!(target.classify(&got), RelocAction::Got);
    }
}

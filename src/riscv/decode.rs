//! RV64GC instruction decoding.
//!
//! Compressed instructions decode together with their 32-bit base expansion
//! so the translator can rewrite any instruction in its full-size form.

use super::encode;
use super::{Format, Insn, Mnemonic};

/// Instruction length implied by the low halfword.
pub fn insn_len(halfword: u16) -> u8 {
    if halfword & 0b11 == 0b11 { 4 } else { 2 }
}

/// Decode one instruction from `word`. For compressed instructions only the
/// low 16 bits are significant.
pub fn decode(word: u32) -> Insn {
    if word as u16 & 0b11 == 0b11 {
        decode_32(word)
    } else {
        decode_16(word as u16)
    }
}

fn unknown(raw: u32, len: u8) -> Insn {
    Insn {
        raw,
        len,
        mnemonic: Mnemonic::Unknown,
        format: Format::Unknown,
        rd: None,
        rs1: None,
        rs2: None,
        rs3: None,
        imm: 0,
        rd_is_x: false,
        rs1_is_x: false,
        rs2_is_x: false,
        expansion: None,
    }
}

// ==================== 32-bit decoding ====================

fn fld_rd(raw: u32) -> u8 {
    ((raw >> 7) & 0x1f) as u8
}

fn fld_rs1(raw: u32) -> u8 {
    ((raw >> 15) & 0x1f) as u8
}

fn fld_rs2(raw: u32) -> u8 {
    ((raw >> 20) & 0x1f) as u8
}

fn fld_funct3(raw: u32) -> u32 {
    (raw >> 12) & 0x7
}

fn fld_funct7(raw: u32) -> u32 {
    raw >> 25
}

fn imm_i(raw: u32) -> i64 {
    ((raw as i32) >> 20) as i64
}

fn imm_s(raw: u32) -> i64 {
    ((((raw & 0xfe00_0000) as i32) >> 20) | (((raw >> 7) & 0x1f) as i32)) as i64
}

fn imm_b(raw: u32) -> i64 {
    let mut v = (((raw >> 8) & 0xf) << 1) | (((raw >> 25) & 0x3f) << 5) | (((raw >> 7) & 0x1) << 11);
    v |= (raw >> 31) << 12;
    ((v << 19) as i32 >> 19) as i64
}

fn imm_u(raw: u32) -> i64 {
    ((raw & 0xffff_f000) as i32) as i64
}

fn imm_j(raw: u32) -> i64 {
    let v = (((raw >> 21) & 0x3ff) << 1)
        | (((raw >> 20) & 0x1) << 11)
        | (((raw >> 12) & 0xff) << 12)
        | ((raw >> 31) << 20);
    ((v << 11) as i32 >> 11) as i64
}

struct Build {
    insn: Insn,
}

impl Build {
    fn new(raw: u32, mnemonic: Mnemonic, format: Format) -> Self {
        Build {
            insn: Insn {
                raw,
                len: 4,
                mnemonic,
                format,
                rd: None,
                rs1: None,
                rs2: None,
                rs3: None,
                imm: 0,
                rd_is_x: false,
                rs1_is_x: false,
                rs2_is_x: false,
                expansion: None,
            },
        }
    }

    fn rd(mut self, r: u8, is_x: bool) -> Self {
        self.insn.rd = Some(r);
        self.insn.rd_is_x = is_x;
        self
    }

    fn rs1(mut self, r: u8, is_x: bool) -> Self {
        self.insn.rs1 = Some(r);
        self.insn.rs1_is_x = is_x;
        self
    }

    fn rs2(mut self, r: u8, is_x: bool) -> Self {
        self.insn.rs2 = Some(r);
        self.insn.rs2_is_x = is_x;
        self
    }

    fn rs3(mut self, r: u8) -> Self {
        self.insn.rs3 = Some(r);
        self
    }

    fn imm(mut self, v: i64) -> Self {
        self.insn.imm = v;
        self
    }

    fn done(self) -> Insn {
        self.insn
    }
}

fn decode_32(raw: u32) -> Insn {
    use Mnemonic::*;
    let opcode = raw & 0x7f;
    let f3 = fld_funct3(raw);
    let f7 = fld_funct7(raw);
    let rd = fld_rd(raw);
    let rs1 = fld_rs1(raw);
    let rs2 = fld_rs2(raw);

    match opcode {
        0x37 => Build::new(raw, Lui, Format::U).rd(rd, true).imm(imm_u(raw)).done(),
        0x17 => Build::new(raw, Auipc, Format::U).rd(rd, true).imm(imm_u(raw)).done(),
        0x6f => Build::new(raw, Jal, Format::J).rd(rd, true).imm(imm_j(raw)).done(),
        0x67 if f3 == 0 => Build::new(raw, Jalr, Format::I)
            .rd(rd, true)
            .rs1(rs1, true)
            .imm(imm_i(raw))
            .done(),
        0x63 => {
            let m = match f3 {
                0b000 => Beq,
                0b001 => Bne,
                0b100 => Blt,
                0b101 => Bge,
                0b110 => Bltu,
                0b111 => Bgeu,
                _ => return unknown(raw, 4),
            };
            Build::new(raw, m, Format::B)
                .rs1(rs1, true)
                .rs2(rs2, true)
                .imm(imm_b(raw))
                .done()
        }
        0x03 => {
            let m = match f3 {
                0b000 => Lb,
                0b001 => Lh,
                0b010 => Lw,
                0b011 => Ld,
                0b100 => Lbu,
                0b101 => Lhu,
                0b110 => Lwu,
                _ => return unknown(raw, 4),
            };
            Build::new(raw, m, Format::I)
                .rd(rd, true)
                .rs1(rs1, true)
                .imm(imm_i(raw))
                .done()
        }
        0x23 => {
            let m = match f3 {
                0b000 => Sb,
                0b001 => Sh,
                0b010 => Sw,
                0b011 => Sd,
                _ => return unknown(raw, 4),
            };
            Build::new(raw, m, Format::S)
                .rs1(rs1, true)
                .rs2(rs2, true)
                .imm(imm_s(raw))
                .done()
        }
        0x13 => {
            let (m, imm) = match f3 {
                0b000 => (Addi, imm_i(raw)),
                0b010 => (Slti, imm_i(raw)),
                0b011 => (Sltiu, imm_i(raw)),
                0b100 => (Xori, imm_i(raw)),
                0b110 => (Ori, imm_i(raw)),
                0b111 => (Andi, imm_i(raw)),
                0b001 if f7 & !1 == 0 => (Slli, ((raw >> 20) & 0x3f) as i64),
                0b101 if f7 & !1 == 0 => (Srli, ((raw >> 20) & 0x3f) as i64),
                0b101 if f7 & !1 == 0x20 => (Srai, ((raw >> 20) & 0x3f) as i64),
                _ => return unknown(raw, 4),
            };
            Build::new(raw, m, Format::I).rd(rd, true).rs1(rs1, true).imm(imm).done()
        }
        0x1b => {
            let (m, imm) = match (f3, f7) {
                (0b000, _) => (Addiw, imm_i(raw)),
                (0b001, 0x00) => (Slliw, ((raw >> 20) & 0x1f) as i64),
                (0b101, 0x00) => (Srliw, ((raw >> 20) & 0x1f) as i64),
                (0b101, 0x20) => (Sraiw, ((raw >> 20) & 0x1f) as i64),
                _ => return unknown(raw, 4),
            };
            Build::new(raw, m, Format::I).rd(rd, true).rs1(rs1, true).imm(imm).done()
        }
        0x33 => {
            let m = match (f7, f3) {
                (0x00, 0b000) => Add,
                (0x20, 0b000) => Sub,
                (0x00, 0b001) => Sll,
                (0x00, 0b010) => Slt,
                (0x00, 0b011) => Sltu,
                (0x00, 0b100) => Xor,
                (0x00, 0b101) => Srl,
                (0x20, 0b101) => Sra,
                (0x00, 0b110) => Or,
                (0x00, 0b111) => And,
                (0x01, 0b000) => Mul,
                (0x01, 0b001) => Mulh,
                (0x01, 0b010) => Mulhsu,
                (0x01, 0b011) => Mulhu,
                (0x01, 0b100) => Div,
                (0x01, 0b101) => Divu,
                (0x01, 0b110) => Rem,
                (0x01, 0b111) => Remu,
                _ => return unknown(raw, 4),
            };
            Build::new(raw, m, Format::R).rd(rd, true).rs1(rs1, true).rs2(rs2, true).done()
        }
        0x3b => {
            let m = match (f7, f3) {
                (0x00, 0b000) => Addw,
                (0x20, 0b000) => Subw,
                (0x00, 0b001) => Sllw,
                (0x00, 0b101) => Srlw,
                (0x20, 0b101) => Sraw,
                (0x01, 0b000) => Mulw,
                (0x01, 0b100) => Divw,
                (0x01, 0b101) => Divuw,
                (0x01, 0b110) => Remw,
                (0x01, 0b111) => Remuw,
                _ => return unknown(raw, 4),
            };
            Build::new(raw, m, Format::R).rd(rd, true).rs1(rs1, true).rs2(rs2, true).done()
        }
        0x0f => match f3 {
            0b000 => Build::new(raw, Fence, Format::I).done(),
            0b001 => Build::new(raw, FenceI, Format::I).done(),
            _ => unknown(raw, 4),
        },
        0x73 => match f3 {
            0b000 => match raw >> 20 {
                0 if rd == 0 && rs1 == 0 => Build::new(raw, Ecall, Format::I).done(),
                1 if rd == 0 && rs1 == 0 => Build::new(raw, Ebreak, Format::I).done(),
                _ => unknown(raw, 4),
            },
            0b001 | 0b010 | 0b011 => {
                let m = match f3 {
                    0b001 => Csrrw,
                    0b010 => Csrrs,
                    _ => Csrrc,
                };
                Build::new(raw, m, Format::I)
                    .rd(rd, true)
                    .rs1(rs1, true)
                    .imm((raw >> 20) as i64)
                    .done()
            }
            0b101 | 0b110 | 0b111 => {
                let m = match f3 {
                    0b101 => Csrrwi,
                    0b110 => Csrrsi,
                    _ => Csrrci,
                };
                // rs1 field is a zero-extended immediate, not a register.
                Build::new(raw, m, Format::I).rd(rd, true).imm((raw >> 20) as i64).done()
            }
            _ => unknown(raw, 4),
        },
        0x2f => {
            let f5 = raw >> 27;
            let m = match (f5, f3) {
                (0x02, 0b010) => LrW,
                (0x03, 0b010) => ScW,
                (0x01, 0b010) => AmoswapW,
                (0x00, 0b010) => AmoaddW,
                (0x04, 0b010) => AmoxorW,
                (0x0c, 0b010) => AmoandW,
                (0x08, 0b010) => AmoorW,
                (0x10, 0b010) => AmominW,
                (0x14, 0b010) => AmomaxW,
                (0x18, 0b010) => AmominuW,
                (0x1c, 0b010) => AmomaxuW,
                (0x02, 0b011) => LrD,
                (0x03, 0b011) => ScD,
                (0x01, 0b011) => AmoswapD,
                (0x00, 0b011) => AmoaddD,
                (0x04, 0b011) => AmoxorD,
                (0x0c, 0b011) => AmoandD,
                (0x08, 0b011) => AmoorD,
                (0x10, 0b011) => AmominD,
                (0x14, 0b011) => AmomaxD,
                (0x18, 0b011) => AmominuD,
                (0x1c, 0b011) => AmomaxuD,
                _ => return unknown(raw, 4),
            };
            Build::new(raw, m, Format::Amo)
                .rd(rd, true)
                .rs1(rs1, true)
                .rs2(rs2, true)
                .done()
        }
        0x07 => {
            let m = match f3 {
                0b010 => Flw,
                0b011 => Fld,
                _ => return unknown(raw, 4),
            };
            Build::new(raw, m, Format::I)
                .rd(rd, false)
                .rs1(rs1, true)
                .imm(imm_i(raw))
                .done()
        }
        0x27 => {
            let m = match f3 {
                0b010 => Fsw,
                0b011 => Fsd,
                _ => return unknown(raw, 4),
            };
            Build::new(raw, m, Format::S)
                .rs1(rs1, true)
                .rs2(rs2, false)
                .imm(imm_s(raw))
                .done()
        }
        0x43 | 0x47 | 0x4b | 0x4f => {
            let m = match (opcode, f7 & 0b11) {
                (0x43, 0b00) => FmaddS,
                (0x47, 0b00) => FmsubS,
                (0x4b, 0b00) => FnmsubS,
                (0x4f, 0b00) => FnmaddS,
                (0x43, 0b01) => FmaddD,
                (0x47, 0b01) => FmsubD,
                (0x4b, 0b01) => FnmsubD,
                (0x4f, 0b01) => FnmaddD,
                _ => return unknown(raw, 4),
            };
            Build::new(raw, m, Format::R4)
                .rd(rd, false)
                .rs1(rs1, false)
                .rs2(rs2, false)
                .rs3((raw >> 27) as u8)
                .done()
        }
        0x53 => decode_op_fp(raw, f7, f3, rd, rs1, rs2),
        _ => unknown(raw, 4),
    }
}

fn decode_op_fp(raw: u32, f7: u32, f3: u32, rd: u8, rs1: u8, rs2: u8) -> Insn {
    use Mnemonic::*;
    // (mnemonic, rd is integer, rs1 is integer)
    let (m, rd_x, rs1_x) = match f7 {
        0x00 => (FaddS, false, false),
        0x04 => (FsubS, false, false),
        0x08 => (FmulS, false, false),
        0x0c => (FdivS, false, false),
        0x2c => (FsqrtS, false, false),
        0x10 => match f3 {
            0 => (FsgnjS, false, false),
            1 => (FsgnjnS, false, false),
            2 => (FsgnjxS, false, false),
            _ => return unknown(raw, 4),
        },
        0x14 => match f3 {
            0 => (FminS, false, false),
            1 => (FmaxS, false, false),
            _ => return unknown(raw, 4),
        },
        0x60 => match rs2 {
            0 => (FcvtWS, true, false),
            1 => (FcvtWuS, true, false),
            2 => (FcvtLS, true, false),
            3 => (FcvtLuS, true, false),
            _ => return unknown(raw, 4),
        },
        0x70 => match f3 {
            0 => (FmvXW, true, false),
            1 => (FclassS, true, false),
            _ => return unknown(raw, 4),
        },
        0x50 => match f3 {
            0 => (FleS, true, false),
            1 => (FltS, true, false),
            2 => (FeqS, true, false),
            _ => return unknown(raw, 4),
        },
        0x68 => match rs2 {
            0 => (FcvtSW, false, true),
            1 => (FcvtSWu, false, true),
            2 => (FcvtSL, false, true),
            3 => (FcvtSLu, false, true),
            _ => return unknown(raw, 4),
        },
        0x78 => (FmvWX, false, true),
        0x01 => (FaddD, false, false),
        0x05 => (FsubD, false, false),
        0x09 => (FmulD, false, false),
        0x0d => (FdivD, false, false),
        0x2d => (FsqrtD, false, false),
        0x11 => match f3 {
            0 => (FsgnjD, false, false),
            1 => (FsgnjnD, false, false),
            2 => (FsgnjxD, false, false),
            _ => return unknown(raw, 4),
        },
        0x15 => match f3 {
            0 => (FminD, false, false),
            1 => (FmaxD, false, false),
            _ => return unknown(raw, 4),
        },
        0x20 => (FcvtSD, false, false),
        0x21 => (FcvtDS, false, false),
        0x61 => match rs2 {
            0 => (FcvtWD, true, false),
            1 => (FcvtWuD, true, false),
            2 => (FcvtLD, true, false),
            3 => (FcvtLuD, true, false),
            _ => return unknown(raw, 4),
        },
        0x71 => match f3 {
            0 => (FmvXD, true, false),
            1 => (FclassD, true, false),
            _ => return unknown(raw, 4),
        },
        0x51 => match f3 {
            0 => (FleD, true, false),
            1 => (FltD, true, false),
            2 => (FeqD, true, false),
            _ => return unknown(raw, 4),
        },
        0x69 => match rs2 {
            0 => (FcvtDW, false, true),
            1 => (FcvtDWu, false, true),
            2 => (FcvtDL, false, true),
            3 => (FcvtDLu, false, true),
            _ => return unknown(raw, 4),
        },
        0x79 => (FmvDX, false, true),
        _ => return unknown(raw, 4),
    };
    Build::new(raw, m, Format::R)
        .rd(rd, rd_x)
        .rs1(rs1, rs1_x)
        .rs2(rs2, false)
        .done()
}

// ==================== compressed decoding ====================

fn creg(field: u16) -> u8 {
    8 + (field & 0x7) as u8
}

fn sext(value: u32, bits: u32) -> i64 {
    let shift = 64 - bits;
    ((value as i64) << shift) >> shift
}

fn ci_imm(raw: u16) -> i64 {
    sext((((raw >> 12) as u32 & 1) << 5) | ((raw >> 2) as u32 & 0x1f), 6)
}

fn ci_shamt(raw: u16) -> u32 {
    ((((raw >> 12) & 1) << 5) | ((raw >> 2) & 0x1f)) as u32
}

fn ci_lui_imm(raw: u16) -> i64 {
    sext((((raw >> 12) as u32 & 1) << 17) | (((raw >> 2) as u32 & 0x1f) << 12), 18)
}

fn ci_addi16sp_imm(raw: u16) -> i64 {
    let r = raw as u32;
    let v = (((r >> 12) & 1) << 9)
        | (((r >> 6) & 1) << 4)
        | (((r >> 5) & 1) << 6)
        | (((r >> 3) & 3) << 7)
        | (((r >> 2) & 1) << 5);
    sext(v, 10)
}

fn ciw_imm(raw: u16) -> i64 {
    let r = raw as u32;
    ((((r >> 11) & 3) << 4)
        | (((r >> 7) & 0xf) << 6)
        | (((r >> 6) & 1) << 2)
        | (((r >> 5) & 1) << 3)) as i64
}

fn cl_w_imm(raw: u16) -> i64 {
    let r = raw as u32;
    ((((r >> 10) & 7) << 3) | (((r >> 6) & 1) << 2) | (((r >> 5) & 1) << 6)) as i64
}

fn cl_d_imm(raw: u16) -> i64 {
    let r = raw as u32;
    ((((r >> 10) & 7) << 3) | (((r >> 5) & 3) << 6)) as i64
}

fn ci_lwsp_imm(raw: u16) -> i64 {
    let r = raw as u32;
    ((((r >> 12) & 1) << 5) | (((r >> 4) & 7) << 2) | (((r >> 2) & 3) << 6)) as i64
}

fn ci_ldsp_imm(raw: u16) -> i64 {
    let r = raw as u32;
    ((((r >> 12) & 1) << 5) | (((r >> 5) & 3) << 3) | (((r >> 2) & 7) << 6)) as i64
}

fn css_swsp_imm(raw: u16) -> i64 {
    let r = raw as u32;
    ((((r >> 9) & 0xf) << 2) | (((r >> 7) & 3) << 6)) as i64
}

fn css_sdsp_imm(raw: u16) -> i64 {
    let r = raw as u32;
    ((((r >> 10) & 7) << 3) | (((r >> 7) & 7) << 6)) as i64
}

fn cb_imm(raw: u16) -> i64 {
    let r = raw as u32;
    let v = (((r >> 12) & 1) << 8)
        | (((r >> 10) & 3) << 3)
        | (((r >> 5) & 3) << 6)
        | (((r >> 3) & 3) << 1)
        | (((r >> 2) & 1) << 5);
    sext(v, 9)
}

fn cj_imm(raw: u16) -> i64 {
    let r = raw as u32;
    let v = (((r >> 12) & 1) << 11)
        | (((r >> 11) & 1) << 4)
        | (((r >> 9) & 3) << 8)
        | (((r >> 8) & 1) << 10)
        | (((r >> 7) & 1) << 6)
        | (((r >> 6) & 1) << 7)
        | (((r >> 3) & 7) << 1)
        | (((r >> 2) & 1) << 5);
    sext(v, 12)
}

struct CBuild {
    insn: Insn,
}

impl CBuild {
    fn new(raw: u16, mnemonic: Mnemonic, format: Format, expansion: u32) -> Self {
        CBuild {
            insn: Insn {
                raw: raw as u32,
                len: 2,
                mnemonic,
                format,
                rd: None,
                rs1: None,
                rs2: None,
                rs3: None,
                imm: 0,
                rd_is_x: false,
                rs1_is_x: false,
                rs2_is_x: false,
                expansion: Some(expansion),
            },
        }
    }

    fn rd(mut self, r: u8, is_x: bool) -> Self {
        self.insn.rd = Some(r);
        self.insn.rd_is_x = is_x;
        self
    }

    fn rs1(mut self, r: u8, is_x: bool) -> Self {
        self.insn.rs1 = Some(r);
        self.insn.rs1_is_x = is_x;
        self
    }

    fn rs2(mut self, r: u8, is_x: bool) -> Self {
        self.insn.rs2 = Some(r);
        self.insn.rs2_is_x = is_x;
        self
    }

    fn imm(mut self, v: i64) -> Self {
        self.insn.imm = v;
        self
    }

    fn done(self) -> Insn {
        self.insn
    }
}

fn decode_16(raw: u16) -> Insn {
    use Mnemonic::*;
    if raw == 0 {
        return unknown(0, 2);
    }
    let f3 = (raw >> 13) & 0x7;
    match raw & 0b11 {
        0b00 => match f3 {
            0b000 => {
                let imm = ciw_imm(raw);
                if imm == 0 {
                    return unknown(raw as u32, 2);
                }
                let rd = creg(raw >> 2);
                CBuild::new(raw, CAddi4spn, Format::Ciw, encode::addi(rd, 2, imm as i32))
                    .rd(rd, true)
                    .rs1(2, true)
                    .imm(imm)
                    .done()
            }
            0b001 => {
                let (rd, rs1, imm) = (creg(raw >> 2), creg(raw >> 7), cl_d_imm(raw));
                CBuild::new(raw, CFld, Format::Cl, encode::fld(rd, rs1, imm as i32))
                    .rd(rd, false)
                    .rs1(rs1, true)
                    .imm(imm)
                    .done()
            }
            0b010 => {
                let (rd, rs1, imm) = (creg(raw >> 2), creg(raw >> 7), cl_w_imm(raw));
                CBuild::new(raw, CLw, Format::Cl, encode::lw(rd, rs1, imm as i32))
                    .rd(rd, true)
                    .rs1(rs1, true)
                    .imm(imm)
                    .done()
            }
            0b011 => {
                let (rd, rs1, imm) = (creg(raw >> 2), creg(raw >> 7), cl_d_imm(raw));
                CBuild::new(raw, CLd, Format::Cl, encode::ld(rd, rs1, imm as i32))
                    .rd(rd, true)
                    .rs1(rs1, true)
                    .imm(imm)
                    .done()
            }
            0b101 => {
                let (rs2, rs1, imm) = (creg(raw >> 2), creg(raw >> 7), cl_d_imm(raw));
                CBuild::new(raw, CFsd, Format::Cs, encode::fsd(rs2, rs1, imm as i32))
                    .rs1(rs1, true)
                    .rs2(rs2, false)
                    .imm(imm)
                    .done()
            }
            0b110 => {
                let (rs2, rs1, imm) = (creg(raw >> 2), creg(raw >> 7), cl_w_imm(raw));
                CBuild::new(raw, CSw, Format::Cs, encode::sw(rs2, rs1, imm as i32))
                    .rs1(rs1, true)
                    .rs2(rs2, true)
                    .imm(imm)
                    .done()
            }
            0b111 => {
                let (rs2, rs1, imm) = (creg(raw >> 2), creg(raw >> 7), cl_d_imm(raw));
                CBuild::new(raw, CSd, Format::Cs, encode::sd(rs2, rs1, imm as i32))
                    .rs1(rs1, true)
                    .rs2(rs2, true)
                    .imm(imm)
                    .done()
            }
            _ => unknown(raw as u32, 2),
        },
        0b01 => match f3 {
            0b000 => {
                let rd = ((raw >> 7) & 0x1f) as u8;
                let imm = ci_imm(raw);
                if rd == 0 {
                    CBuild::new(raw, CNop, Format::Ci, encode::nop()).done()
                } else {
                    CBuild::new(raw, CAddi, Format::Ci, encode::addi(rd, rd, imm as i32))
                        .rd(rd, true)
                        .rs1(rd, true)
                        .imm(imm)
                        .done()
                }
            }
            0b001 => {
                let rd = ((raw >> 7) & 0x1f) as u8;
                if rd == 0 {
                    return unknown(raw as u32, 2);
                }
                let imm = ci_imm(raw);
                CBuild::new(raw, CAddiw, Format::Ci, encode::addiw(rd, rd, imm as i32))
                    .rd(rd, true)
                    .rs1(rd, true)
                    .imm(imm)
                    .done()
            }
            0b010 => {
                let rd = ((raw >> 7) & 0x1f) as u8;
                let imm = ci_imm(raw);
                CBuild::new(raw, CLi, Format::Ci, encode::addi(rd, 0, imm as i32))
                    .rd(rd, true)
                    .imm(imm)
                    .done()
            }
            0b011 => {
                let rd = ((raw >> 7) & 0x1f) as u8;
                if rd == 2 {
                    let imm = ci_addi16sp_imm(raw);
                    if imm == 0 {
                        return unknown(raw as u32, 2);
                    }
                    CBuild::new(raw, CAddi16sp, Format::Ci, encode::addi(2, 2, imm as i32))
                        .rd(2, true)
                        .rs1(2, true)
                        .imm(imm)
                        .done()
                } else {
                    let imm = ci_lui_imm(raw);
                    if rd == 0 || imm == 0 {
                        return unknown(raw as u32, 2);
                    }
                    CBuild::new(raw, CLui, Format::Ci, encode::lui(rd, (imm >> 12) as i32))
                        .rd(rd, true)
                        .imm(imm)
                        .done()
                }
            }
            0b100 => {
                let rd = creg(raw >> 7);
                match (raw >> 10) & 0b11 {
                    0b00 => {
                        let sh = ci_shamt(raw);
                        CBuild::new(raw, CSrli, Format::Cb, encode::srli(rd, rd, sh))
                            .rd(rd, true)
                            .rs1(rd, true)
                            .imm(sh as i64)
                            .done()
                    }
                    0b01 => {
                        let sh = ci_shamt(raw);
                        CBuild::new(raw, CSrai, Format::Cb, encode::srai(rd, rd, sh))
                            .rd(rd, true)
                            .rs1(rd, true)
                            .imm(sh as i64)
                            .done()
                    }
                    0b10 => {
                        let imm = ci_imm(raw);
                        CBuild::new(raw, CAndi, Format::Cb, encode::andi(rd, rd, imm as i32))
                            .rd(rd, true)
                            .rs1(rd, true)
                            .imm(imm)
                            .done()
                    }
                    _ => {
                        let rs2 = creg(raw >> 2);
                        let (m, exp) = match ((raw >> 12) & 1, (raw >> 5) & 0b11) {
                            (0, 0b00) => (CSub, encode::sub(rd, rd, rs2)),
                            (0, 0b01) => (CXor, encode::xor(rd, rd, rs2)),
                            (0, 0b10) => (COr, encode::or(rd, rd, rs2)),
                            (0, 0b11) => (CAnd, encode::and(rd, rd, rs2)),
                            (1, 0b00) => (CSubw, encode::subw(rd, rd, rs2)),
                            (1, 0b01) => (CAddw, encode::addw(rd, rd, rs2)),
                            _ => return unknown(raw as u32, 2),
                        };
                        CBuild::new(raw, m, Format::Ca, exp)
                            .rd(rd, true)
                            .rs1(rd, true)
                            .rs2(rs2, true)
                            .done()
                    }
                }
            }
            0b101 => {
                let imm = cj_imm(raw);
                CBuild::new(raw, CJ, Format::Cj, encode::jal(0, imm as i32)).imm(imm).done()
            }
            0b110 => {
                let rs1 = creg(raw >> 7);
                let imm = cb_imm(raw);
                CBuild::new(raw, CBeqz, Format::Cb, encode::beq(rs1, 0, imm as i32))
                    .rs1(rs1, true)
                    .imm(imm)
                    .done()
            }
            0b111 => {
                let rs1 = creg(raw >> 7);
                let imm = cb_imm(raw);
                CBuild::new(raw, CBnez, Format::Cb, encode::bne(rs1, 0, imm as i32))
                    .rs1(rs1, true)
                    .imm(imm)
                    .done()
            }
            _ => unknown(raw as u32, 2),
        },
        0b10 => match f3 {
            0b000 => {
                let rd = ((raw >> 7) & 0x1f) as u8;
                if rd == 0 {
                    return unknown(raw as u32, 2);
                }
                let sh = ci_shamt(raw);
                CBuild::new(raw, CSlli, Format::Ci, encode::slli(rd, rd, sh))
                    .rd(rd, true)
                    .rs1(rd, true)
                    .imm(sh as i64)
                    .done()
            }
            0b001 => {
                let rd = ((raw >> 7) & 0x1f) as u8;
                let imm = ci_ldsp_imm(raw);
                CBuild::new(raw, CFldsp, Format::Ci, encode::fld(rd, 2, imm as i32))
                    .rd(rd, false)
                    .rs1(2, true)
                    .imm(imm)
                    .done()
            }
            0b010 => {
                let rd = ((raw >> 7) & 0x1f) as u8;
                if rd == 0 {
                    return unknown(raw as u32, 2);
                }
                let imm = ci_lwsp_imm(raw);
                CBuild::new(raw, CLwsp, Format::Ci, encode::lw(rd, 2, imm as i32))
                    .rd(rd, true)
                    .rs1(2, true)
                    .imm(imm)
                    .done()
            }
            0b011 => {
                let rd = ((raw >> 7) & 0x1f) as u8;
                if rd == 0 {
                    return unknown(raw as u32, 2);
                }
                let imm = ci_ldsp_imm(raw);
                CBuild::new(raw, CLdsp, Format::Ci, encode::ld(rd, 2, imm as i32))
                    .rd(rd, true)
                    .rs1(2, true)
                    .imm(imm)
                    .done()
            }
            0b100 => {
                let r1 = ((raw >> 7) & 0x1f) as u8;
                let r2 = ((raw >> 2) & 0x1f) as u8;
                match ((raw >> 12) & 1, r1, r2) {
                    (0, rs1, 0) if rs1 != 0 => {
                        CBuild::new(raw, CJr, Format::Cr, encode::jalr(0, rs1, 0))
                            .rs1(rs1, true)
                            .done()
                    }
                    (0, rd, rs2) if rd != 0 && rs2 != 0 => {
                        CBuild::new(raw, CMv, Format::Cr, encode::add(rd, 0, rs2))
                            .rd(rd, true)
                            .rs2(rs2, true)
                            .done()
                    }
                    (1, 0, 0) => CBuild::new(raw, CEbreak, Format::Cr, encode::ebreak()).done(),
                    (1, rs1, 0) if rs1 != 0 => {
                        CBuild::new(raw, CJalr, Format::Cr, encode::jalr(1, rs1, 0))
                            .rd(1, true)
                            .rs1(rs1, true)
                            .done()
                    }
                    (1, rd, rs2) if rd != 0 && rs2 != 0 => {
                        CBuild::new(raw, CAdd, Format::Cr, encode::add(rd, rd, rs2))
                            .rd(rd, true)
                            .rs1(rd, true)
                            .rs2(rs2, true)
                            .done()
                    }
                    _ => unknown(raw as u32, 2),
                }
            }
            0b101 => {
                let rs2 = ((raw >> 2) & 0x1f) as u8;
                let imm = css_sdsp_imm(raw);
                CBuild::new(raw, CFsdsp, Format::Css, encode::fsd(rs2, 2, imm as i32))
                    .rs1(2, true)
                    .rs2(rs2, false)
                    .imm(imm)
                    .done()
            }
            0b110 => {
                let rs2 = ((raw >> 2) & 0x1f) as u8;
                let imm = css_swsp_imm(raw);
                CBuild::new(raw, CSwsp, Format::Css, encode::sw(rs2, 2, imm as i32))
                    .rs1(2, true)
                    .rs2(rs2, true)
                    .imm(imm)
                    .done()
            }
            0b111 => {
                let rs2 = ((raw >> 2) & 0x1f) as u8;
                let imm = css_sdsp_imm(raw);
                CBuild::new(raw, CSdsp, Format::Css, encode::sd(rs2, 2, imm as i32))
                    .rs1(2, true)
                    .rs2(rs2, true)
                    .imm(imm)
                    .done()
            }
            _ => unknown(raw as u32, 2),
        },
        _ => unknown(raw as u32, 2),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_addi() {
        let insn = decode(0x0031_0093); // addi x1, x2, 3
        assert_eq!(insn.mnemonic, Mnemonic::Addi);
        assert_eq!(insn.rd, Some(1));
        assert_eq!(insn.rs1, Some(2));
        assert_eq!(insn.imm, 3);
        assert_eq!(insn.len, 4);
    }

    #[test]
    fn test_decode_system() {
        assert_eq!(decode(0x0000_0073).mnemonic, Mnemonic::Ecall);
        assert_eq!(decode(0x0010_0073).mnemonic, Mnemonic::Ebreak);
        assert!(decode(0x0000_0073).is_terminator());
    }

    #[test]
    fn test_decode_ret() {
        let insn = decode(0x0000_8067); // jalr x0, x1, 0
        assert_eq!(insn.mnemonic, Mnemonic::Jalr);
        assert_eq!(insn.rd, Some(0));
        assert_eq!(insn.rs1, Some(1));
        assert!(insn.is_indirect_jump());
    }

    #[test]
    fn test_decode_branch_imm() {
        let insn = decode(crate::riscv::encode::beq(5, 6, -16));
        assert_eq!(insn.mnemonic, Mnemonic::Beq);
        assert_eq!(insn.imm, -16);
        let insn = decode(crate::riscv::encode::beq(5, 6, 2046));
        assert_eq!(insn.imm, 2046);
    }

    #[test]
    fn test_decode_jal_imm() {
        for off in [-1048576i32, -4, 0, 2, 1048574] {
            let insn = decode(crate::riscv::encode::jal(1, off));
            assert_eq!(insn.mnemonic, Mnemonic::Jal);
            assert_eq!(insn.imm, off as i64, "offset {}", off);
            assert_eq!(insn.rd, Some(1));
        }
    }

    #[test]
    fn test_decode_store_imm() {
        let insn = decode(crate::riscv::encode::sd(31, 4, -24));
        assert_eq!(insn.mnemonic, Mnemonic::Sd);
        assert_eq!(insn.rs1, Some(4));
        assert_eq!(insn.rs2, Some(31));
        assert_eq!(insn.imm, -24);
    }

    #[test]
    fn test_decode_compressed_li() {
        let insn = decode(0x4501); // c.li a0, 0
        assert_eq!(insn.mnemonic, Mnemonic::CLi);
        assert_eq!(insn.rd, Some(10));
        assert_eq!(insn.imm, 0);
        assert_eq!(insn.expansion, Some(0x0000_0513)); // addi a0, x0, 0
    }

    #[test]
    fn test_decode_compressed_jr() {
        let insn = decode(0x8082); // c.jr ra
        assert_eq!(insn.mnemonic, Mnemonic::CJr);
        assert_eq!(insn.rs1, Some(1));
        assert!(insn.is_indirect_jump());
        assert_eq!(insn.expansion, Some(0x0000_8067));
    }

    #[test]
    fn test_decode_compressed_addi() {
        let insn = decode(0x0505); // c.addi a0, 1
        assert_eq!(insn.mnemonic, Mnemonic::CAddi);
        assert_eq!(insn.rd, Some(10));
        assert_eq!(insn.imm, 1);
    }

    #[test]
    fn test_compressed_expansion_agrees() {
        // Every compressed decode must expand to a 32-bit word that decodes
        // to the same register fields and immediate.
        for raw in [0x4501u16, 0x0505, 0x8082, 0x6105, 0x714d, 0xe022, 0x862a] {
            let c = decode(raw as u32);
            if c.mnemonic == Mnemonic::Unknown {
                continue;
            }
            let full = decode(c.expansion.expect("compressed expansion"));
            assert_ne!(full.mnemonic, Mnemonic::Unknown, "raw {:#06x}", raw);
            assert_eq!(full.len, 4);
        }
    }

    #[test]
    fn test_zero_word_is_unknown() {
        assert_eq!(decode(0).mnemonic, Mnemonic::Unknown);
    }

    #[test]
    fn test_xreg_masks() {
        let insn = decode(crate::riscv::encode::add(31, 4, 7));
        assert_eq!(insn.xreg_writes(), 1 << 31);
        assert_eq!(insn.xreg_reads(), (1 << 4) | (1 << 7));
        // FP load reads an x base but writes an f register.
        let insn = decode(crate::riscv::encode::fld(5, 31, 0));
        assert_eq!(insn.xreg_writes(), 0);
        assert_eq!(insn.xreg_reads(), 1 << 31);
    }

    #[test]
    fn test_insn_len() {
        assert_eq!(insn_len(0x0093), 4);
        assert_eq!(insn_len(0x4501), 2);
    }
}

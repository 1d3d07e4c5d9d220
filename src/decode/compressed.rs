//! 16-bit compressed (RVC) instruction shapes.
//!
//! Every compressed form is rewritten here into the base instruction
//! it aliases, so nothing downstream of [`decode`](super::decode) ever
//! sees a `C.*` opcode. The CB-type branch immediate assembly below is
//! the one spot the source got wrong (`||` where it meant bitwise
//! `|`, which happens to be silently "correct" whenever at most one of
//! the two operands is nonzero and wrong otherwise); this port uses
//! `|` throughout.

use crate::bits::{extract, sign_extend};
use crate::error::EmuError;
use crate::types::{GpReg, RegIdx, NO_REG};

use super::shapes::addi_from_sp;
use super::{Decoded, Op};

fn w32(w: u16) -> u32 {
    w as u32
}

fn funct3(w: u16) -> u32 {
    extract(w32(w), 13, 3)
}

fn rd_full(w: u16) -> RegIdx {
    extract(w32(w), 7, 5) as RegIdx
}

fn rs2_full(w: u16) -> RegIdx {
    extract(w32(w), 2, 5) as RegIdx
}

fn rdp(w: u16) -> RegIdx {
    (extract(w32(w), 2, 3) + 8) as RegIdx
}

fn rs1p(w: u16) -> RegIdx {
    (extract(w32(w), 7, 3) + 8) as RegIdx
}

fn rs2p(w: u16) -> RegIdx {
    rdp(w)
}

fn bit12(w: u16) -> u32 {
    extract(w32(w), 12, 1)
}

fn rvc(op: Op) -> Decoded {
    Decoded {
        op,
        rvc: true,
        ..Decoded::default()
    }
}

pub fn decode_compressed(w: u16) -> Result<Decoded, EmuError> {
    let illegal = || -> Result<Decoded, EmuError> {
        Err(EmuError::IllegalInstruction {
            pc: 0,
            word: w32(w),
        })
    };

    if w == 0 {
        // All-zero is defined as an illegal instruction, used as a
        // trap-on-jump-to-unmapped-memory sentinel.
        return illegal();
    }

    let quadrant = w & 0x3;
    let f3 = funct3(w);

    match quadrant {
        0 => match f3 {
            0b000 => {
                let raw = (extract(w32(w), 11, 2) << 4)
                    | (extract(w32(w), 7, 4) << 6)
                    | (extract(w32(w), 6, 1) << 2)
                    | (extract(w32(w), 5, 1) << 3);
                if raw == 0 {
                    return illegal();
                }
                Ok(addi_from_sp(rdp(w), raw as i32))
            }
            0b001 => {
                let uimm = (extract(w32(w), 10, 3) << 3) | (extract(w32(w), 5, 2) << 6);
                Ok(Decoded {
                    op: Op::Fld,
                    rd: rdp(w),
                    rs1: rs1p(w),
                    imm: uimm as i32,
                    ..rvc(Op::Fld)
                })
            }
            0b010 => {
                let uimm =
                    (extract(w32(w), 10, 3) << 3) | (extract(w32(w), 6, 1) << 2) | (extract(w32(w), 5, 1) << 6);
                Ok(Decoded {
                    op: Op::Lw,
                    rd: rdp(w),
                    rs1: rs1p(w),
                    imm: uimm as i32,
                    ..rvc(Op::Lw)
                })
            }
            0b011 => {
                let uimm = (extract(w32(w), 10, 3) << 3) | (extract(w32(w), 5, 2) << 6);
                Ok(Decoded {
                    op: Op::Ld,
                    rd: rdp(w),
                    rs1: rs1p(w),
                    imm: uimm as i32,
                    ..rvc(Op::Ld)
                })
            }
            0b101 => {
                let uimm = (extract(w32(w), 10, 3) << 3) | (extract(w32(w), 5, 2) << 6);
                Ok(Decoded {
                    op: Op::Fsd,
                    rs1: rs1p(w),
                    rs2: rs2p(w),
                    imm: uimm as i32,
                    ..rvc(Op::Fsd)
                })
            }
            0b110 => {
                let uimm =
                    (extract(w32(w), 10, 3) << 3) | (extract(w32(w), 6, 1) << 2) | (extract(w32(w), 5, 1) << 6);
                Ok(Decoded {
                    op: Op::Sw,
                    rs1: rs1p(w),
                    rs2: rs2p(w),
                    imm: uimm as i32,
                    ..rvc(Op::Sw)
                })
            }
            0b111 => {
                let uimm = (extract(w32(w), 10, 3) << 3) | (extract(w32(w), 5, 2) << 6);
                Ok(Decoded {
                    op: Op::Sd,
                    rs1: rs1p(w),
                    rs2: rs2p(w),
                    imm: uimm as i32,
                    ..rvc(Op::Sd)
                })
            }
            _ => illegal(),
        },
        1 => match f3 {
            0b000 => {
                // C.ADDI, or C.NOP when rd == 0 and imm == 0.
                let imm = sign_extend((bit12(w) << 5) | extract(w32(w), 2, 5), 6);
                Ok(Decoded {
                    op: Op::Addi,
                    rd: rd_full(w),
                    rs1: rd_full(w),
                    imm,
                    ..rvc(Op::Addi)
                })
            }
            0b001 => {
                let rd = rd_full(w);
                if rd == 0 {
                    return illegal();
                }
                let imm = sign_extend((bit12(w) << 5) | extract(w32(w), 2, 5), 6);
                Ok(Decoded {
                    op: Op::Addiw,
                    rd,
                    rs1: rd,
                    imm,
                    ..rvc(Op::Addiw)
                })
            }
            0b010 => {
                let imm = sign_extend((bit12(w) << 5) | extract(w32(w), 2, 5), 6);
                Ok(Decoded {
                    op: Op::Addi,
                    rd: rd_full(w),
                    rs1: NO_REG,
                    imm,
                    ..rvc(Op::Addi)
                })
            }
            0b011 => {
                let rd = rd_full(w);
                if rd == 0 {
                    return illegal();
                }
                if rd == GpReg::Sp.index() as RegIdx {
                    let imm = sign_extend(
                        (bit12(w) << 9)
                            | (extract(w32(w), 6, 1) << 4)
                            | (extract(w32(w), 5, 1) << 6)
                            | (extract(w32(w), 3, 2) << 7)
                            | (extract(w32(w), 2, 1) << 5),
                        10,
                    );
                    if imm == 0 {
                        return illegal();
                    }
                    Ok(addi_from_sp(GpReg::Sp.index() as RegIdx, imm))
                } else {
                    let raw6 = (bit12(w) << 5) | extract(w32(w), 2, 5);
                    if raw6 == 0 {
                        return illegal();
                    }
                    let imm = sign_extend(raw6, 6) << 12;
                    Ok(Decoded {
                        op: Op::Lui,
                        rd,
                        imm,
                        ..rvc(Op::Lui)
                    })
                }
            }
            0b100 => {
                let group = extract(w32(w), 10, 2);
                let rd = rs1p(w);
                match group {
                    0b00 => {
                        let shamt = (bit12(w) << 5) | extract(w32(w), 2, 5);
                        Ok(Decoded {
                            op: Op::Srli,
                            rd,
                            rs1: rd,
                            imm: shamt as i32,
                            ..rvc(Op::Srli)
                        })
                    }
                    0b01 => {
                        let shamt = (bit12(w) << 5) | extract(w32(w), 2, 5);
                        Ok(Decoded {
                            op: Op::Srai,
                            rd,
                            rs1: rd,
                            imm: shamt as i32,
                            ..rvc(Op::Srai)
                        })
                    }
                    0b10 => {
                        let imm = sign_extend((bit12(w) << 5) | extract(w32(w), 2, 5), 6);
                        Ok(Decoded {
                            op: Op::Andi,
                            rd,
                            rs1: rd,
                            imm,
                            ..rvc(Op::Andi)
                        })
                    }
                    0b11 => {
                        let f2 = extract(w32(w), 5, 2);
                        let rs2 = rs2p(w);
                        let op = match (bit12(w), f2) {
                            (0, 0b00) => Op::Sub,
                            (0, 0b01) => Op::Xor,
                            (0, 0b10) => Op::Or,
                            (0, 0b11) => Op::And,
                            (1, 0b00) => Op::Subw,
                            (1, 0b01) => Op::Addw,
                            _ => return illegal(),
                        };
                        Ok(Decoded {
                            op,
                            rd,
                            rs1: rd,
                            rs2,
                            ..rvc(op)
                        })
                    }
                    _ => illegal(),
                }
            }
            0b101 => {
                let imm = sign_extend(
                    (extract(w32(w), 12, 1) << 11)
                        | (extract(w32(w), 11, 1) << 4)
                        | (extract(w32(w), 9, 2) << 8)
                        | (extract(w32(w), 8, 1) << 10)
                        | (extract(w32(w), 7, 1) << 6)
                        | (extract(w32(w), 6, 1) << 7)
                        | (extract(w32(w), 3, 3) << 1)
                        | (extract(w32(w), 2, 1) << 5),
                    12,
                );
                Ok(Decoded {
                    op: Op::Jal,
                    rd: NO_REG,
                    imm,
                    ..rvc(Op::Jal)
                }
                .block_ending())
            }
            0b110 | 0b111 => {
                let op = if f3 == 0b110 { Op::Beq } else { Op::Bne };
                let imm = sign_extend(
                    (extract(w32(w), 12, 1) << 8)
                        | (extract(w32(w), 10, 2) << 3)
                        | (extract(w32(w), 5, 2) << 6)
                        | (extract(w32(w), 3, 2) << 1)
                        | (extract(w32(w), 2, 1) << 5),
                    9,
                );
                Ok(Decoded {
                    op,
                    rs1: rs1p(w),
                    rs2: GpReg::Zero.index() as RegIdx,
                    imm,
                    ..rvc(op)
                }
                .block_ending())
            }
            _ => illegal(),
        },
        2 => match f3 {
            0b000 => {
                let rd = rd_full(w);
                let shamt = (bit12(w) << 5) | extract(w32(w), 2, 5);
                Ok(Decoded {
                    op: Op::Slli,
                    rd,
                    rs1: rd,
                    imm: shamt as i32,
                    ..rvc(Op::Slli)
                })
            }
            0b001 => {
                let uimm =
                    (bit12(w) << 5) | (extract(w32(w), 5, 2) << 3) | (extract(w32(w), 2, 3) << 6);
                Ok(Decoded {
                    op: Op::Fld,
                    rd: rd_full(w),
                    rs1: GpReg::Sp.index() as RegIdx,
                    imm: uimm as i32,
                    ..rvc(Op::Fld)
                })
            }
            0b010 => {
                let rd = rd_full(w);
                if rd == 0 {
                    return illegal();
                }
                let uimm = (bit12(w) << 5) | (extract(w32(w), 4, 3) << 2) | (extract(w32(w), 2, 2) << 6);
                Ok(Decoded {
                    op: Op::Lw,
                    rd,
                    rs1: GpReg::Sp.index() as RegIdx,
                    imm: uimm as i32,
                    ..rvc(Op::Lw)
                })
            }
            0b011 => {
                let rd = rd_full(w);
                if rd == 0 {
                    return illegal();
                }
                let uimm = (bit12(w) << 5) | (extract(w32(w), 5, 2) << 3) | (extract(w32(w), 2, 3) << 6);
                Ok(Decoded {
                    op: Op::Ld,
                    rd,
                    rs1: GpReg::Sp.index() as RegIdx,
                    imm: uimm as i32,
                    ..rvc(Op::Ld)
                })
            }
            0b100 => {
                let rd = rd_full(w);
                let rs2 = rs2_full(w);
                match (bit12(w), rs2 == 0) {
                    (0, true) => {
                        if rd == 0 {
                            return illegal();
                        }
                        Ok(Decoded {
                            op: Op::Jalr,
                            rd: NO_REG,
                            rs1: rd,
                            ..rvc(Op::Jalr)
                        }
                        .block_ending())
                    }
                    (0, false) => Ok(Decoded {
                        op: Op::Add,
                        rd,
                        rs1: GpReg::Zero.index() as RegIdx,
                        rs2,
                        ..rvc(Op::Add)
                    }),
                    (1, true) => {
                        if rd == 0 {
                            Ok(Decoded {
                                op: Op::Ebreak,
                                ..rvc(Op::Ebreak)
                            }
                            .block_ending())
                        } else {
                            Ok(Decoded {
                                op: Op::Jalr,
                                rd: GpReg::Ra.index() as RegIdx,
                                rs1: rd,
                                ..rvc(Op::Jalr)
                            }
                            .block_ending())
                        }
                    }
                    (1, false) => Ok(Decoded {
                        op: Op::Add,
                        rd,
                        rs1: rd,
                        rs2,
                        ..rvc(Op::Add)
                    }),
                    _ => illegal(),
                }
            }
            0b101 => {
                let uimm = (extract(w32(w), 10, 3) << 3) | (extract(w32(w), 7, 3) << 6);
                Ok(Decoded {
                    op: Op::Fsd,
                    rs1: GpReg::Sp.index() as RegIdx,
                    rs2: rs2_full(w),
                    imm: uimm as i32,
                    ..rvc(Op::Fsd)
                })
            }
            0b110 => {
                let uimm = (extract(w32(w), 9, 4) << 2) | (extract(w32(w), 7, 2) << 6);
                Ok(Decoded {
                    op: Op::Sw,
                    rs1: GpReg::Sp.index() as RegIdx,
                    rs2: rs2_full(w),
                    imm: uimm as i32,
                    ..rvc(Op::Sw)
                })
            }
            0b111 => {
                let uimm = (extract(w32(w), 10, 3) << 3) | (extract(w32(w), 7, 3) << 6);
                Ok(Decoded {
                    op: Op::Sd,
                    rs1: GpReg::Sp.index() as RegIdx,
                    rs2: rs2_full(w),
                    imm: uimm as i32,
                    ..rvc(Op::Sd)
                })
            }
            _ => illegal(),
        },
        _ => illegal(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn c_nop_decodes_to_addi_zero() {
        let d = decode_compressed(0x0001).unwrap();
        assert_eq!(d.op, Op::Addi);
        assert_eq!(d.rd, 0);
        assert_eq!(d.imm, 0);
        assert!(d.rvc);
    }

    #[test]
    fn c_li_loads_small_immediate() {
        // c.li x8, 5: quadrant 1, funct3=010, rd=01000, imm bits
        let w: u16 = 0b010_0_01000_00101_01;
        let d = decode_compressed(w).unwrap();
        assert_eq!(d.op, Op::Addi);
        assert_eq!(d.rd, 8);
        assert_eq!(d.rs1, NO_REG);
        assert_eq!(d.imm, 5);
    }

    #[test]
    fn c_beqz_sets_block_ending() {
        // c.beqz x8, 0 encodes rs1'=000 (x8), offset bits all zero.
        let w: u16 = 0b110_000_000_00_000_01;
        let d = decode_compressed(w).unwrap();
        assert_eq!(d.op, Op::Beq);
        assert_eq!(d.rs1, 8);
        assert_eq!(d.rs2, 0);
        assert_eq!(d.imm, 0);
        assert!(d.cont);
    }

    #[test]
    fn c_jr_requires_nonzero_rd() {
        // quadrant 2, funct3=100, bit12=0, rs2=0, rd=0 is reserved.
        let w: u16 = 0b1000_00000_00000_10;
        assert!(decode_compressed(w).is_err());
    }

    #[test]
    fn c_addi4spn_zero_immediate_is_illegal() {
        let w: u16 = 0b000_00000_000_00_00;
        assert!(decode_compressed(w).is_err());
    }

    #[test]
    fn c_fsdsp_uimm_matches_sdsp_field_layout() {
        // quadrant 2, funct3=101: imm[12:10]=010, imm[9:7]=001, rs2=00101 (f5)
        // uimm[5:3]=inst[12:10]=010, uimm[8:6]=inst[9:7]=001
        // -> uimm = (0b010 << 3) | (0b001 << 6) = 16 | 64 = 80
        let w: u16 = 0b101_010_001_00101_10;
        let d = decode_compressed(w).unwrap();
        assert_eq!(d.op, Op::Fsd);
        assert_eq!(d.rs1, GpReg::Sp.index() as RegIdx);
        assert_eq!(d.rs2, 5);
        assert_eq!(d.imm, 80);
    }
}

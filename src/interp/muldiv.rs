//! M-extension multiply/divide/remainder semantics, including the
//! ISA's required edge cases: divide-by-zero yields an all-ones
//! quotient and the dividend as remainder; `INT_MIN / -1` overflows to
//! `INT_MIN` rather than trapping (§4.2).

use crate::decode::{Decoded, Op};
use crate::error::EmuError;
use crate::machine::Machine;
use crate::types::Addr;

fn sext_w(x: u32) -> u64 {
    (x as i32) as i64 as u64
}

pub fn execute(machine: &mut Machine, d: &Decoded, link: Addr) -> Result<(), EmuError> {
    let rs1 = machine.read_gp(d.rs1);
    let rs2 = machine.read_gp(d.rs2);

    match d.op {
        Op::Mul => machine.write_gp(d.rd, rs1.wrapping_mul(rs2)),
        Op::Mulh => {
            let p = (rs1 as i64 as i128) * (rs2 as i64 as i128);
            machine.write_gp(d.rd, (p >> 64) as u64);
        }
        Op::Mulhsu => {
            let p = (rs1 as i64 as i128) * (rs2 as u128 as i128);
            machine.write_gp(d.rd, (p >> 64) as u64);
        }
        Op::Mulhu => {
            let p = (rs1 as u128) * (rs2 as u128);
            machine.write_gp(d.rd, (p >> 64) as u64);
        }
        Op::Div => {
            let a = rs1 as i64;
            let b = rs2 as i64;
            let q = if b == 0 {
                -1i64
            } else if a == i64::MIN && b == -1 {
                i64::MIN
            } else {
                a.wrapping_div(b)
            };
            machine.write_gp(d.rd, q as u64);
        }
        Op::Divu => {
            let q = if rs2 == 0 { u64::MAX } else { rs1 / rs2 };
            machine.write_gp(d.rd, q);
        }
        Op::Rem => {
            let a = rs1 as i64;
            let b = rs2 as i64;
            let r = if b == 0 {
                a
            } else if a == i64::MIN && b == -1 {
                0
            } else {
                a.wrapping_rem(b)
            };
            machine.write_gp(d.rd, r as u64);
        }
        Op::Remu => {
            let r = if rs2 == 0 { rs1 } else { rs1 % rs2 };
            machine.write_gp(d.rd, r);
        }
        Op::Mulw => machine.write_gp(d.rd, sext_w((rs1 as u32).wrapping_mul(rs2 as u32))),
        Op::Divw => {
            let a = rs1 as u32 as i32;
            let b = rs2 as u32 as i32;
            let q = if b == 0 {
                -1i32
            } else if a == i32::MIN && b == -1 {
                i32::MIN
            } else {
                a.wrapping_div(b)
            };
            machine.write_gp(d.rd, sext_w(q as u32));
        }
        Op::Divuw => {
            let a = rs1 as u32;
            let b = rs2 as u32;
            let q = if b == 0 { u32::MAX } else { a / b };
            machine.write_gp(d.rd, sext_w(q));
        }
        Op::Remw => {
            let a = rs1 as u32 as i32;
            let b = rs2 as u32 as i32;
            let r = if b == 0 {
                a
            } else if a == i32::MIN && b == -1 {
                0
            } else {
                a.wrapping_rem(b)
            };
            machine.write_gp(d.rd, sext_w(r as u32));
        }
        Op::Remuw => {
            let a = rs1 as u32;
            let b = rs2 as u32;
            let r = if b == 0 { a } else { a % b };
            machine.write_gp(d.rd, sext_w(r));
        }
        _ => {
            return Err(EmuError::Invariant {
                site: "muldiv::execute",
                detail: format!("{:?} routed to the wrong handler", d.op),
            })
        }
    }

    machine.pc = link;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::Decoded;
    use crate::types::NO_REG;

    fn base(op: Op, rs1: i8, rs2: i8, rd: i8) -> Decoded {
        Decoded {
            op,
            rd,
            rs1,
            rs2,
            rs3: NO_REG,
            imm: 0,
            csr: 0,
            rvc: false,
            cont: false,
        }
    }

    #[test]
    fn div_overflow_saturates_to_min() {
        let mut machine = Machine::default();
        machine.gp[1] = i64::MIN as u64;
        machine.gp[2] = (-1i64) as u64;
        execute(&mut machine, &base(Op::Div, 1, 2, 3), 4).unwrap();
        assert_eq!(machine.read_gp(3) as i64, i64::MIN);
    }

    #[test]
    fn div_by_zero_yields_all_ones() {
        let mut machine = Machine::default();
        machine.gp[1] = 42;
        execute(&mut machine, &base(Op::Div, 1, 2, 3), 4).unwrap();
        assert_eq!(machine.read_gp(3), u64::MAX);
    }

    #[test]
    fn rem_by_zero_yields_dividend() {
        let mut machine = Machine::default();
        machine.gp[1] = 42;
        execute(&mut machine, &base(Op::Rem, 1, 2, 3), 4).unwrap();
        assert_eq!(machine.read_gp(3), 42);
    }

    #[test]
    fn mulhu_computes_high_bits_of_full_product() {
        let mut machine = Machine::default();
        machine.gp[1] = u64::MAX;
        machine.gp[2] = 2;
        execute(&mut machine, &base(Op::Mulhu, 1, 2, 3), 4).unwrap();
        assert_eq!(machine.read_gp(3), 1);
    }

    #[test]
    fn divuw_operates_on_32_bit_operands_and_sign_extends() {
        let mut machine = Machine::default();
        machine.gp[1] = 0xffff_ffff_0000_000au64; // low 32 bits: 10
        machine.gp[2] = 3;
        execute(&mut machine, &base(Op::Divuw, 1, 2, 3), 4).unwrap();
        assert_eq!(machine.read_gp(3), 3);
    }
}

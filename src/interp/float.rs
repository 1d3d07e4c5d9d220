//! F/D extension semantics: loads/stores, fused multiply-add, the
//! arithmetic/compare/convert families, sign injection, classification,
//! and raw bit moves (§4.2). Rounding uses the host's nearest-ties-to-
//! even conversion throughout, matching the ISA's default dynamic
//! rounding mode; no guest-selectable rounding mode is honored (see
//! `interp::csr`).

use crate::decode::{Decoded, Op};
use crate::error::EmuError;
use crate::machine::Machine;
use crate::memory::Mmu;
use crate::types::Addr;

fn sext_w(x: u32) -> u64 {
    (x as i32) as i64 as u64
}

fn fsgnj32(a: f32, mag_sign_of: f32) -> f32 {
    f32::from_bits((a.to_bits() & 0x7fff_ffff) | (mag_sign_of.to_bits() & 0x8000_0000))
}
fn fsgnjn32(a: f32, sign_src: f32) -> f32 {
    f32::from_bits((a.to_bits() & 0x7fff_ffff) | (!sign_src.to_bits() & 0x8000_0000))
}
fn fsgnjx32(a: f32, sign_src: f32) -> f32 {
    f32::from_bits(a.to_bits() ^ (sign_src.to_bits() & 0x8000_0000))
}
fn fsgnj64(a: f64, mag_sign_of: f64) -> f64 {
    f64::from_bits((a.to_bits() & 0x7fff_ffff_ffff_ffff) | (mag_sign_of.to_bits() & 0x8000_0000_0000_0000))
}
fn fsgnjn64(a: f64, sign_src: f64) -> f64 {
    f64::from_bits((a.to_bits() & 0x7fff_ffff_ffff_ffff) | (!sign_src.to_bits() & 0x8000_0000_0000_0000))
}
fn fsgnjx64(a: f64, sign_src: f64) -> f64 {
    f64::from_bits(a.to_bits() ^ (sign_src.to_bits() & 0x8000_0000_0000_0000))
}

/// 10-bit one-hot `fclass` mask (§4.2): bit0 −∞, 1 neg normal, 2 neg
/// subnormal, 3 −0, 4 +0, 5 pos subnormal, 6 pos normal, 7 +∞,
/// 8 signaling NaN, 9 quiet NaN.
fn fclass32(x: f32) -> u64 {
    let bits = x.to_bits();
    let sign = bits >> 31 != 0;
    let exp = (bits >> 23) & 0xff;
    let mantissa = bits & 0x007f_ffff;
    if exp == 0xff {
        if mantissa == 0 {
            if sign { 1 << 0 } else { 1 << 7 }
        } else if mantissa & 0x0040_0000 != 0 {
            1 << 9
        } else {
            1 << 8
        }
    } else if exp == 0 {
        if mantissa == 0 {
            if sign { 1 << 3 } else { 1 << 4 }
        } else if sign {
            1 << 2
        } else {
            1 << 5
        }
    } else if sign {
        1 << 1
    } else {
        1 << 6
    }
}

fn fclass64(x: f64) -> u64 {
    let bits = x.to_bits();
    let sign = bits >> 63 != 0;
    let exp = (bits >> 52) & 0x7ff;
    let mantissa = bits & 0x000f_ffff_ffff_ffff;
    if exp == 0x7ff {
        if mantissa == 0 {
            if sign { 1 << 0 } else { 1 << 7 }
        } else if mantissa & 0x0008_0000_0000_0000 != 0 {
            1 << 9
        } else {
            1 << 8
        }
    } else if exp == 0 {
        if mantissa == 0 {
            if sign { 1 << 3 } else { 1 << 4 }
        } else if sign {
            1 << 2
        } else {
            1 << 5
        }
    } else if sign {
        1 << 1
    } else {
        1 << 6
    }
}

fn fcvt_w_s(x: f32) -> i32 {
    if x.is_nan() {
        return i32::MAX;
    }
    let r = x.round_ties_even();
    if r >= i32::MAX as f32 {
        i32::MAX
    } else if r <= i32::MIN as f32 {
        i32::MIN
    } else {
        r as i32
    }
}
fn fcvt_wu_s(x: f32) -> u32 {
    if x.is_nan() || x < 0.0 {
        return 0;
    }
    let r = x.round_ties_even();
    if r >= u32::MAX as f32 {
        u32::MAX
    } else {
        r as u32
    }
}
fn fcvt_l_s(x: f32) -> i64 {
    if x.is_nan() {
        return i64::MAX;
    }
    let r = x.round_ties_even();
    if r >= i64::MAX as f32 {
        i64::MAX
    } else if r <= i64::MIN as f32 {
        i64::MIN
    } else {
        r as i64
    }
}
fn fcvt_lu_s(x: f32) -> u64 {
    if x.is_nan() || x < 0.0 {
        return 0;
    }
    let r = x.round_ties_even();
    if r >= u64::MAX as f32 {
        u64::MAX
    } else {
        r as u64
    }
}
fn fcvt_w_d(x: f64) -> i32 {
    if x.is_nan() {
        return i32::MAX;
    }
    let r = x.round_ties_even();
    if r >= i32::MAX as f64 {
        i32::MAX
    } else if r <= i32::MIN as f64 {
        i32::MIN
    } else {
        r as i32
    }
}
fn fcvt_wu_d(x: f64) -> u32 {
    if x.is_nan() || x < 0.0 {
        return 0;
    }
    let r = x.round_ties_even();
    if r >= u32::MAX as f64 {
        u32::MAX
    } else {
        r as u32
    }
}
fn fcvt_l_d(x: f64) -> i64 {
    if x.is_nan() {
        return i64::MAX;
    }
    let r = x.round_ties_even();
    if r >= i64::MAX as f64 {
        i64::MAX
    } else if r <= i64::MIN as f64 {
        i64::MIN
    } else {
        r as i64
    }
}
fn fcvt_lu_d(x: f64) -> u64 {
    if x.is_nan() || x < 0.0 {
        return 0;
    }
    let r = x.round_ties_even();
    if r >= u64::MAX as f64 {
        u64::MAX
    } else {
        r as u64
    }
}

pub fn execute(machine: &mut Machine, mmu: &mut Mmu, d: &Decoded, link: Addr) -> Result<(), EmuError> {
    match d.op {
        Op::Flw => {
            let addr = machine.read_gp(d.rs1).wrapping_add(d.imm as i64 as u64);
            let v = f32::from_bits(u32::from_le_bytes(mmu.load::<4>(addr)));
            machine.write_fp32(d.rd, v);
        }
        Op::Fsw => {
            let addr = machine.read_gp(d.rs1).wrapping_add(d.imm as i64 as u64);
            let v = machine.read_fp32(d.rs2);
            mmu.store(addr, &v.to_bits().to_le_bytes());
        }
        Op::Fld => {
            let addr = machine.read_gp(d.rs1).wrapping_add(d.imm as i64 as u64);
            let v = f64::from_bits(u64::from_le_bytes(mmu.load::<8>(addr)));
            machine.write_fp64(d.rd, v);
        }
        Op::Fsd => {
            let addr = machine.read_gp(d.rs1).wrapping_add(d.imm as i64 as u64);
            let v = machine.read_fp64(d.rs2);
            mmu.store(addr, &v.to_bits().to_le_bytes());
        }

        Op::FmaddS => {
            let (a, b, c) = (machine.read_fp32(d.rs1), machine.read_fp32(d.rs2), machine.read_fp32(d.rs3));
            machine.write_fp32(d.rd, a.mul_add(b, c));
        }
        Op::FmsubS => {
            let (a, b, c) = (machine.read_fp32(d.rs1), machine.read_fp32(d.rs2), machine.read_fp32(d.rs3));
            machine.write_fp32(d.rd, a.mul_add(b, -c));
        }
        Op::FnmsubS => {
            let (a, b, c) = (machine.read_fp32(d.rs1), machine.read_fp32(d.rs2), machine.read_fp32(d.rs3));
            machine.write_fp32(d.rd, (-a).mul_add(b, c));
        }
        Op::FnmaddS => {
            let (a, b, c) = (machine.read_fp32(d.rs1), machine.read_fp32(d.rs2), machine.read_fp32(d.rs3));
            machine.write_fp32(d.rd, (-a).mul_add(b, -c));
        }
        Op::FmaddD => {
            let (a, b, c) = (machine.read_fp64(d.rs1), machine.read_fp64(d.rs2), machine.read_fp64(d.rs3));
            machine.write_fp64(d.rd, a.mul_add(b, c));
        }
        Op::FmsubD => {
            let (a, b, c) = (machine.read_fp64(d.rs1), machine.read_fp64(d.rs2), machine.read_fp64(d.rs3));
            machine.write_fp64(d.rd, a.mul_add(b, -c));
        }
        Op::FnmsubD => {
            let (a, b, c) = (machine.read_fp64(d.rs1), machine.read_fp64(d.rs2), machine.read_fp64(d.rs3));
            machine.write_fp64(d.rd, (-a).mul_add(b, c));
        }
        Op::FnmaddD => {
            let (a, b, c) = (machine.read_fp64(d.rs1), machine.read_fp64(d.rs2), machine.read_fp64(d.rs3));
            machine.write_fp64(d.rd, (-a).mul_add(b, -c));
        }

        Op::FaddS => {
            let (a, b) = (machine.read_fp32(d.rs1), machine.read_fp32(d.rs2));
            machine.write_fp32(d.rd, a + b);
        }
        Op::FsubS => {
            let (a, b) = (machine.read_fp32(d.rs1), machine.read_fp32(d.rs2));
            machine.write_fp32(d.rd, a - b);
        }
        Op::FmulS => {
            let (a, b) = (machine.read_fp32(d.rs1), machine.read_fp32(d.rs2));
            machine.write_fp32(d.rd, a * b);
        }
        Op::FdivS => {
            let (a, b) = (machine.read_fp32(d.rs1), machine.read_fp32(d.rs2));
            machine.write_fp32(d.rd, a / b);
        }
        Op::FsqrtS => {
            let a = machine.read_fp32(d.rs1);
            machine.write_fp32(d.rd, a.sqrt());
        }
        Op::FaddD => {
            let (a, b) = (machine.read_fp64(d.rs1), machine.read_fp64(d.rs2));
            machine.write_fp64(d.rd, a + b);
        }
        Op::FsubD => {
            let (a, b) = (machine.read_fp64(d.rs1), machine.read_fp64(d.rs2));
            machine.write_fp64(d.rd, a - b);
        }
        Op::FmulD => {
            let (a, b) = (machine.read_fp64(d.rs1), machine.read_fp64(d.rs2));
            machine.write_fp64(d.rd, a * b);
        }
        Op::FdivD => {
            let (a, b) = (machine.read_fp64(d.rs1), machine.read_fp64(d.rs2));
            machine.write_fp64(d.rd, a / b);
        }
        Op::FsqrtD => {
            let a = machine.read_fp64(d.rs1);
            machine.write_fp64(d.rd, a.sqrt());
        }

        Op::FsgnjS => {
            let (a, b) = (machine.read_fp32(d.rs1), machine.read_fp32(d.rs2));
            machine.write_fp32(d.rd, fsgnj32(a, b));
        }
        Op::FsgnjnS => {
            let (a, b) = (machine.read_fp32(d.rs1), machine.read_fp32(d.rs2));
            machine.write_fp32(d.rd, fsgnjn32(a, b));
        }
        Op::FsgnjxS => {
            let (a, b) = (machine.read_fp32(d.rs1), machine.read_fp32(d.rs2));
            machine.write_fp32(d.rd, fsgnjx32(a, b));
        }
        Op::FsgnjD => {
            let (a, b) = (machine.read_fp64(d.rs1), machine.read_fp64(d.rs2));
            machine.write_fp64(d.rd, fsgnj64(a, b));
        }
        Op::FsgnjnD => {
            let (a, b) = (machine.read_fp64(d.rs1), machine.read_fp64(d.rs2));
            machine.write_fp64(d.rd, fsgnjn64(a, b));
        }
        Op::FsgnjxD => {
            let (a, b) = (machine.read_fp64(d.rs1), machine.read_fp64(d.rs2));
            machine.write_fp64(d.rd, fsgnjx64(a, b));
        }

        Op::FminS => {
            let (a, b) = (machine.read_fp32(d.rs1), machine.read_fp32(d.rs2));
            machine.write_fp32(d.rd, a.min(b));
        }
        Op::FmaxS => {
            let (a, b) = (machine.read_fp32(d.rs1), machine.read_fp32(d.rs2));
            machine.write_fp32(d.rd, a.max(b));
        }
        Op::FminD => {
            let (a, b) = (machine.read_fp64(d.rs1), machine.read_fp64(d.rs2));
            machine.write_fp64(d.rd, a.min(b));
        }
        Op::FmaxD => {
            let (a, b) = (machine.read_fp64(d.rs1), machine.read_fp64(d.rs2));
            machine.write_fp64(d.rd, a.max(b));
        }

        Op::FeqS => {
            let (a, b) = (machine.read_fp32(d.rs1), machine.read_fp32(d.rs2));
            machine.write_gp(d.rd, (a == b) as u64);
        }
        Op::FltS => {
            let (a, b) = (machine.read_fp32(d.rs1), machine.read_fp32(d.rs2));
            machine.write_gp(d.rd, (a < b) as u64);
        }
        Op::FleS => {
            let (a, b) = (machine.read_fp32(d.rs1), machine.read_fp32(d.rs2));
            machine.write_gp(d.rd, (a <= b) as u64);
        }
        Op::FeqD => {
            let (a, b) = (machine.read_fp64(d.rs1), machine.read_fp64(d.rs2));
            machine.write_gp(d.rd, (a == b) as u64);
        }
        Op::FltD => {
            let (a, b) = (machine.read_fp64(d.rs1), machine.read_fp64(d.rs2));
            machine.write_gp(d.rd, (a < b) as u64);
        }
        Op::FleD => {
            let (a, b) = (machine.read_fp64(d.rs1), machine.read_fp64(d.rs2));
            machine.write_gp(d.rd, (a <= b) as u64);
        }

        Op::FclassS => {
            let a = machine.read_fp32(d.rs1);
            machine.write_gp(d.rd, fclass32(a));
        }
        Op::FclassD => {
            let a = machine.read_fp64(d.rs1);
            machine.write_gp(d.rd, fclass64(a));
        }

        Op::FcvtWS => {
            let a = machine.read_fp32(d.rs1);
            machine.write_gp(d.rd, sext_w(fcvt_w_s(a) as u32));
        }
        Op::FcvtWuS => {
            let a = machine.read_fp32(d.rs1);
            machine.write_gp(d.rd, sext_w(fcvt_wu_s(a)));
        }
        Op::FcvtLS => {
            let a = machine.read_fp32(d.rs1);
            machine.write_gp(d.rd, fcvt_l_s(a) as u64);
        }
        Op::FcvtLuS => {
            let a = machine.read_fp32(d.rs1);
            machine.write_gp(d.rd, fcvt_lu_s(a));
        }
        Op::FcvtWD => {
            let a = machine.read_fp64(d.rs1);
            machine.write_gp(d.rd, sext_w(fcvt_w_d(a) as u32));
        }
        Op::FcvtWuD => {
            let a = machine.read_fp64(d.rs1);
            machine.write_gp(d.rd, sext_w(fcvt_wu_d(a)));
        }
        Op::FcvtLD => {
            let a = machine.read_fp64(d.rs1);
            machine.write_gp(d.rd, fcvt_l_d(a) as u64);
        }
        Op::FcvtLuD => {
            let a = machine.read_fp64(d.rs1);
            machine.write_gp(d.rd, fcvt_lu_d(a));
        }

        Op::FcvtSW => machine.write_fp32(d.rd, (machine.read_gp(d.rs1) as u32 as i32) as f32),
        Op::FcvtSWu => machine.write_fp32(d.rd, (machine.read_gp(d.rs1) as u32) as f32),
        Op::FcvtSL => machine.write_fp32(d.rd, (machine.read_gp(d.rs1) as i64) as f32),
        Op::FcvtSLu => machine.write_fp32(d.rd, machine.read_gp(d.rs1) as f32),
        Op::FcvtDW => machine.write_fp64(d.rd, (machine.read_gp(d.rs1) as u32 as i32) as f64),
        Op::FcvtDWu => machine.write_fp64(d.rd, (machine.read_gp(d.rs1) as u32) as f64),
        Op::FcvtDL => machine.write_fp64(d.rd, (machine.read_gp(d.rs1) as i64) as f64),
        Op::FcvtDLu => machine.write_fp64(d.rd, machine.read_gp(d.rs1) as f64),

        Op::FcvtSD => {
            let a = machine.read_fp64(d.rs1);
            machine.write_fp32(d.rd, a as f32);
        }
        Op::FcvtDS => {
            let a = machine.read_fp32(d.rs1);
            machine.write_fp64(d.rd, a as f64);
        }

        Op::FmvXW => {
            let a = machine.read_fp32(d.rs1);
            machine.write_gp(d.rd, sext_w(a.to_bits()));
        }
        Op::FmvWX => machine.write_fp32(d.rd, f32::from_bits(machine.read_gp(d.rs1) as u32)),
        Op::FmvXD => {
            let a = machine.read_fp64(d.rs1);
            machine.write_gp(d.rd, a.to_bits());
        }
        Op::FmvDX => machine.write_fp64(d.rd, f64::from_bits(machine.read_gp(d.rs1))),

        _ => {
            return Err(EmuError::Invariant {
                site: "float::execute",
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
    use crate::types::NO_REG;

    fn base(op: Op, rd: i8, rs1: i8, rs2: i8, rs3: i8) -> Decoded {
        Decoded {
            op,
            rd,
            rs1,
            rs2,
            rs3,
            imm: 0,
            csr: 0,
            rvc: false,
            cont: false,
        }
    }

    #[test]
    fn fadd_s_computes_sum() {
        let mut machine = Machine::default();
        let mut mmu = Mmu::new();
        machine.write_fp32(1, 1.5);
        machine.write_fp32(2, 2.5);
        execute(&mut machine, &mut mmu, &base(Op::FaddS, 3, 1, 2, NO_REG), 4).unwrap();
        assert_eq!(machine.read_fp32(3), 4.0);
    }

    #[test]
    fn fsgnjn_negates_the_sign_source() {
        let mut machine = Machine::default();
        let mut mmu = Mmu::new();
        machine.write_fp32(1, 3.0);
        machine.write_fp32(2, 1.0);
        execute(&mut machine, &mut mmu, &base(Op::FsgnjnS, 3, 1, 2, NO_REG), 4).unwrap();
        assert_eq!(machine.read_fp32(3), -3.0);
    }

    #[test]
    fn fclass_identifies_negative_zero() {
        let mut machine = Machine::default();
        let mut mmu = Mmu::new();
        machine.write_fp32(1, -0.0);
        execute(&mut machine, &mut mmu, &base(Op::FclassS, 2, 1, NO_REG, NO_REG), 4).unwrap();
        assert_eq!(machine.read_gp(2), 1 << 3);
    }

    #[test]
    fn fcvt_w_s_of_nan_is_i32_max() {
        let mut machine = Machine::default();
        let mut mmu = Mmu::new();
        machine.write_fp32(1, f32::NAN);
        execute(&mut machine, &mut mmu, &base(Op::FcvtWS, 2, 1, NO_REG, NO_REG), 4).unwrap();
        assert_eq!(machine.read_gp(2) as i64 as i32, i32::MAX);
    }

    #[test]
    fn fmv_x_w_moves_raw_bits_sign_extended() {
        let mut machine = Machine::default();
        let mut mmu = Mmu::new();
        machine.write_fp32(1, -1.0);
        execute(&mut machine, &mut mmu, &base(Op::FmvXW, 2, 1, NO_REG, NO_REG), 4).unwrap();
        assert_eq!(machine.read_gp(2) as u32, (-1.0f32).to_bits());
    }

    #[test]
    fn fmadd_s_is_a_single_fused_rounding() {
        let mut machine = Machine::default();
        let mut mmu = Mmu::new();
        machine.write_fp32(1, 2.0);
        machine.write_fp32(2, 3.0);
        machine.write_fp32(3, 1.0);
        execute(&mut machine, &mut mmu, &base(Op::FmaddS, 4, 1, 2, 3), 4).unwrap();
        assert_eq!(machine.read_fp32(4), 7.0);
    }
}

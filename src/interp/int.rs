//! RV32I/RV64I base integer semantics, Fence/FenceI, and the Ecall/
//! Ebreak control-transfer pair (§4.2).

use crate::decode::{Decoded, Op};
use crate::error::EmuError;
use crate::machine::{ExitReason, Machine};
use crate::memory::Mmu;
use crate::types::Addr;

fn sext_w(x: u32) -> u64 {
    (x as i32) as i64 as u64
}

pub fn execute(machine: &mut Machine, mmu: &mut Mmu, d: &Decoded, link: Addr) -> Result<(), EmuError> {
    let rs1 = machine.read_gp(d.rs1);
    let rs2 = machine.read_gp(d.rs2);
    let imm = d.imm as i64 as u64;

    let mut next_pc = link;

    match d.op {
        Op::Lui => machine.write_gp(d.rd, imm),
        Op::Auipc => machine.write_gp(d.rd, machine.pc.wrapping_add(imm)),
        Op::Jal => {
            machine.write_gp(d.rd, link);
            next_pc = machine.pc.wrapping_add(imm);
        }
        Op::Jalr => {
            let target = rs1.wrapping_add(imm) & !1u64;
            machine.write_gp(d.rd, link);
            next_pc = target;
        }
        Op::Beq => {
            if rs1 == rs2 {
                next_pc = machine.pc.wrapping_add(imm);
            }
        }
        Op::Bne => {
            if rs1 != rs2 {
                next_pc = machine.pc.wrapping_add(imm);
            }
        }
        Op::Blt => {
            if (rs1 as i64) < (rs2 as i64) {
                next_pc = machine.pc.wrapping_add(imm);
            }
        }
        Op::Bge => {
            if (rs1 as i64) >= (rs2 as i64) {
                next_pc = machine.pc.wrapping_add(imm);
            }
        }
        Op::Bltu => {
            if rs1 < rs2 {
                next_pc = machine.pc.wrapping_add(imm);
            }
        }
        Op::Bgeu => {
            if rs1 >= rs2 {
                next_pc = machine.pc.wrapping_add(imm);
            }
        }
        Op::Lb => {
            let addr = rs1.wrapping_add(imm);
            let v = mmu.load::<1>(addr)[0] as i8;
            machine.write_gp(d.rd, v as i64 as u64);
        }
        Op::Lh => {
            let addr = rs1.wrapping_add(imm);
            let v = i16::from_le_bytes(mmu.load::<2>(addr));
            machine.write_gp(d.rd, v as i64 as u64);
        }
        Op::Lw => {
            let addr = rs1.wrapping_add(imm);
            let v = i32::from_le_bytes(mmu.load::<4>(addr));
            machine.write_gp(d.rd, v as i64 as u64);
        }
        Op::Lbu => {
            let addr = rs1.wrapping_add(imm);
            machine.write_gp(d.rd, mmu.load::<1>(addr)[0] as u64);
        }
        Op::Lhu => {
            let addr = rs1.wrapping_add(imm);
            machine.write_gp(d.rd, u16::from_le_bytes(mmu.load::<2>(addr)) as u64);
        }
        Op::Lwu => {
            let addr = rs1.wrapping_add(imm);
            machine.write_gp(d.rd, u32::from_le_bytes(mmu.load::<4>(addr)) as u64);
        }
        Op::Ld => {
            let addr = rs1.wrapping_add(imm);
            machine.write_gp(d.rd, u64::from_le_bytes(mmu.load::<8>(addr)));
        }
        Op::Sb => {
            let addr = rs1.wrapping_add(imm);
            mmu.store(addr, &rs2.to_le_bytes()[..1]);
        }
        Op::Sh => {
            let addr = rs1.wrapping_add(imm);
            mmu.store(addr, &rs2.to_le_bytes()[..2]);
        }
        Op::Sw => {
            let addr = rs1.wrapping_add(imm);
            mmu.store(addr, &rs2.to_le_bytes()[..4]);
        }
        Op::Sd => {
            let addr = rs1.wrapping_add(imm);
            mmu.store(addr, &rs2.to_le_bytes());
        }
        Op::Addi => machine.write_gp(d.rd, rs1.wrapping_add(imm)),
        Op::Slti => machine.write_gp(d.rd, ((rs1 as i64) < (d.imm as i64)) as u64),
        Op::Sltiu => machine.write_gp(d.rd, (rs1 < imm) as u64),
        Op::Xori => machine.write_gp(d.rd, rs1 ^ imm),
        Op::Ori => machine.write_gp(d.rd, rs1 | imm),
        Op::Andi => machine.write_gp(d.rd, rs1 & imm),
        Op::Slli => machine.write_gp(d.rd, rs1 << (d.imm as u32 & 0x3f)),
        Op::Srli => machine.write_gp(d.rd, rs1 >> (d.imm as u32 & 0x3f)),
        Op::Srai => machine.write_gp(d.rd, ((rs1 as i64) >> (d.imm as u32 & 0x3f)) as u64),
        Op::Add => machine.write_gp(d.rd, rs1.wrapping_add(rs2)),
        Op::Sub => machine.write_gp(d.rd, rs1.wrapping_sub(rs2)),
        Op::Sll => machine.write_gp(d.rd, rs1 << (rs2 & 0x3f)),
        Op::Slt => machine.write_gp(d.rd, ((rs1 as i64) < (rs2 as i64)) as u64),
        Op::Sltu => machine.write_gp(d.rd, (rs1 < rs2) as u64),
        Op::Xor => machine.write_gp(d.rd, rs1 ^ rs2),
        Op::Srl => machine.write_gp(d.rd, rs1 >> (rs2 & 0x3f)),
        Op::Sra => machine.write_gp(d.rd, ((rs1 as i64) >> (rs2 & 0x3f)) as u64),
        Op::Or => machine.write_gp(d.rd, rs1 | rs2),
        Op::And => machine.write_gp(d.rd, rs1 & rs2),
        Op::Fence | Op::FenceI => {}
        Op::Ecall => {
            machine.exit_reason = ExitReason::Ecall;
            machine.reenter_pc = link;
        }
        Op::Ebreak => {
            machine.exit_reason = ExitReason::Ebreak;
            machine.reenter_pc = link;
        }
        Op::Addiw => machine.write_gp(d.rd, sext_w((rs1 as u32).wrapping_add(d.imm as u32))),
        Op::Slliw => machine.write_gp(d.rd, sext_w((rs1 as u32) << (d.imm as u32 & 0x1f))),
        Op::Srliw => machine.write_gp(d.rd, sext_w((rs1 as u32) >> (d.imm as u32 & 0x1f))),
        Op::Sraiw => {
            let shamt = d.imm as u32 & 0x1f;
            machine.write_gp(d.rd, sext_w(((rs1 as u32 as i32) >> shamt) as u32));
        }
        Op::Addw => machine.write_gp(d.rd, sext_w((rs1 as u32).wrapping_add(rs2 as u32))),
        Op::Subw => machine.write_gp(d.rd, sext_w((rs1 as u32).wrapping_sub(rs2 as u32))),
        Op::Sllw => machine.write_gp(d.rd, sext_w((rs1 as u32) << (rs2 as u32 & 0x1f))),
        Op::Srlw => machine.write_gp(d.rd, sext_w((rs1 as u32) >> (rs2 as u32 & 0x1f))),
        Op::Sraw => {
            let shamt = rs2 as u32 & 0x1f;
            machine.write_gp(d.rd, sext_w(((rs1 as u32 as i32) >> shamt) as u32));
        }
        _ => {
            return Err(EmuError::Invariant {
                site: "int::execute",
                detail: format!("{:?} routed to the wrong handler", d.op),
            })
        }
    }

    machine.pc = next_pc;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::Decoded;
    use crate::types::NO_REG;

    fn base(op: Op) -> Decoded {
        Decoded {
            op,
            rd: NO_REG,
            rs1: NO_REG,
            rs2: NO_REG,
            rs3: NO_REG,
            imm: 0,
            csr: 0,
            rvc: false,
            cont: false,
        }
    }

    #[test]
    fn div_min_by_neg_one_overflows_to_min() {
        // Exercised through muldiv, not int, but int's sibling
        // semantics (jalr low-bit clear) live here.
        let mut machine = Machine::default();
        let mut mmu = Mmu::new();
        machine.gp[1] = 0x1001; // rs1, odd address
        let d = Decoded {
            rs1: 1,
            rd: 2,
            ..base(Op::Jalr)
        };
        execute(&mut machine, &mut mmu, &d, 4).unwrap();
        assert_eq!(machine.pc, 0x1000, "low bit must be cleared");
        assert_eq!(machine.read_gp(2), 4);
    }

    #[test]
    fn auipc_is_relative_to_its_own_pc() {
        let mut machine = Machine::default();
        machine.pc = 0x8000;
        let mut mmu = Mmu::new();
        let d = Decoded {
            rd: 3,
            imm: 0x1000,
            ..base(Op::Auipc)
        };
        execute(&mut machine, &mut mmu, &d, 0x8004).unwrap();
        assert_eq!(machine.read_gp(3), 0x9000);
    }
}

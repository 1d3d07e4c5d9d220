//! Zicsr. Only `fflags`/`frm`/`fcsr` are recognized CSRs (§4.2); they
//! always read zero and writes are accepted but discarded, since this
//! crate's FP conversions go straight to the host's rounding mode
//! rather than honoring a guest-programmed one. Any other CSR number is
//! a fatal invariant violation, not a guest-recoverable condition.

use crate::decode::{Decoded, Op};
use crate::error::EmuError;
use crate::machine::Machine;
use crate::types::{csr, Addr, NO_REG};

pub fn execute(machine: &mut Machine, d: &Decoded, link: Addr) -> Result<(), EmuError> {
    if !matches!(d.csr, csr::FFLAGS | csr::FRM | csr::FCSR) {
        return Err(EmuError::Invariant {
            site: "csr::execute",
            detail: format!("unrecognized CSR 0x{:03x}", d.csr),
        });
    }

    if d.rd != NO_REG {
        machine.write_gp(d.rd, 0);
    }

    // Writes are evaluated (reading rs1/the 5-bit immediate) but have
    // no effect: `fcsr` always reads back zero regardless.
    match d.op {
        Op::Csrrw | Op::Csrrs | Op::Csrrc => {
            let _ = machine.read_gp(d.rs1);
        }
        Op::Csrrwi | Op::Csrrsi | Op::Csrrci => {
            let _ = d.imm;
        }
        _ => {
            return Err(EmuError::Invariant {
                site: "csr::execute",
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

    fn base(op: Op, csr_num: u16, rd: i8, rs1: i8) -> Decoded {
        Decoded {
            op,
            rd,
            rs1,
            rs2: NO_REG,
            rs3: NO_REG,
            imm: 0,
            csr: csr_num,
            rvc: false,
            cont: false,
        }
    }

    #[test]
    fn fcsr_read_is_always_zero() {
        let mut machine = Machine::default();
        machine.fcsr = 0x42;
        execute(&mut machine, &base(Op::Csrrs, csr::FCSR, 5, NO_REG), 4).unwrap();
        assert_eq!(machine.read_gp(5), 0);
    }

    #[test]
    fn unrecognized_csr_is_fatal() {
        let mut machine = Machine::default();
        let result = execute(&mut machine, &base(Op::Csrrw, 0x7c0, 5, 1), 4);
        assert!(matches!(result, Err(EmuError::Invariant { .. })));
    }
}

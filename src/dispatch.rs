//! Execution dispatcher (§4.4): the outer loop tying decode, interpret,
//! and the hot cache together. A cache hit chains block to block
//! without returning here; a miss bumps the hot counter, interprets one
//! block, and (once hot) hands the block to a [`BlockCompiler`] — which
//! today is always [`crate::cache::NullCompiler`], so every block is
//! actually executed by the interpreter regardless of hotness.

use crate::cache::{BlockCompiler, HotCache};
use crate::decode;
use crate::error::EmuError;
use crate::interp;
use crate::machine::{ExitReason, Machine};
use crate::memory::Mmu;
use crate::types::Addr;

pub struct Dispatcher<C: BlockCompiler> {
    pub cache: HotCache,
    pub compiler: C,
}

impl<C: BlockCompiler> Dispatcher<C> {
    pub fn new(compiler: C) -> Result<Self, EmuError> {
        Ok(Self {
            cache: HotCache::new()?,
            compiler,
        })
    }

    /// Run until the guest traps out via `ecall`/`ebreak`. Returns the
    /// exit reason the caller (the driver binary, for `ecall`) needs to
    /// act on; the block-chaining cache-hit path and the interpret-one-
    /// block miss path both funnel through here.
    pub fn run(&mut self, machine: &mut Machine, mmu: &mut Mmu) -> Result<ExitReason, EmuError> {
        loop {
            if let Some(_arena_addr) = self.cache.cache_lookup(machine.pc)? {
                // A real JIT backend would jump into arena code here and
                // let it chain block to block before returning. With
                // only `NullCompiler` shipped this branch is currently
                // unreachable (cache_lookup never reports a hit), but
                // the dispatcher's contract keeps this arm so the
                // cache's `Some` path is load-bearing once a compiler
                // exists.
                continue;
            }

            let just_crossed = self.cache.cache_hot(machine.pc)?;
            let reason = interp::run_block(machine, mmu)?;

            if just_crossed {
                if let Some(block) = self.compiler.compile(machine, mmu, machine.pc) {
                    self.cache.cache_add(machine.pc, &block.code, block.align)?;
                }
            }

            match reason {
                ExitReason::Ecall | ExitReason::Ebreak => return Ok(reason),
                ExitReason::BlockEnd => continue,
            }
        }
    }
}

/// Guest PC a fresh `Dispatcher`/`Machine` pair should resume at after
/// an `ecall` has been serviced by the driver.
pub fn reenter(machine: &mut Machine) -> Addr {
    machine.pc = machine.reenter_pc;
    machine.pc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::NullCompiler;
    use crate::memory::Perm;

    fn image_with(words: &[u32]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(words.len() * 4);
        for w in words {
            bytes.extend_from_slice(&w.to_le_bytes());
        }
        bytes
    }

    #[test]
    fn runs_to_ecall_and_reports_reason() {
        let mut mmu = Mmu::new();
        // addi a0, x0, 0 ; addi a7, x0, 93 (exit) ; ecall
        let words = [
            0x0000_0513u32, // addi a0, x0, 0
            0x05d0_0893u32, // addi a7, x0, 93
            0x0000_0073u32, // ecall
        ];
        mmu.map_segment(0x1000, 0x1000, Perm::READ | Perm::EXEC, &image_with(&words))
            .unwrap();
        mmu.base = 0x2000;

        let mut machine = Machine::new(0x1000, 0x2000);
        let mut dispatcher = Dispatcher::new(NullCompiler).unwrap();
        let reason = dispatcher.run(&mut machine, &mut mmu).unwrap();
        assert_eq!(reason, ExitReason::Ecall);
        assert_eq!(machine.read_gp(crate::types::GpReg::A7.index() as i8), 93);
        assert_eq!(machine.reenter_pc, 0x1000 + 12);
    }

    #[test]
    fn reenter_moves_pc_to_reenter_pc() {
        let mut machine = Machine::new(0, 0);
        machine.reenter_pc = 0x4000;
        assert_eq!(reenter(&mut machine), 0x4000);
        assert_eq!(machine.pc, 0x4000);
    }
}

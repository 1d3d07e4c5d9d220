use std::path::PathBuf;

use clap::Parser;
use clap_num::maybe_hex;

use rv64emu::cache::NullCompiler;
use rv64emu::dispatch::Dispatcher;
use rv64emu::elf_loader::load_elf;
use rv64emu::interp;
use rv64emu::machine::{ExitReason, Machine};
use rv64emu::memory::Mmu;
use rv64emu::syscall;
use rv64emu::types::Addr;

/// Run a statically linked RV64GC ELF executable.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about)]
struct Args {
    /// Path to the guest ELF executable
    elf: PathBuf,

    /// Arguments forwarded to the guest as argv[1..]
    #[arg(trailing_var_arg = true)]
    guest_args: Vec<String>,

    /// Single-step and print the program counter and decoded op before
    /// every instruction
    #[arg(short, long)]
    trace: bool,

    /// Print an 8-word memory window starting at this address after
    /// every traced instruction (use 0x prefix for hexadecimal)
    #[arg(short, long, value_parser = maybe_hex::<u64>)]
    mem_dump: Option<Addr>,
}

const STACK_SIZE: u64 = 32 * 1024 * 1024;

/// Lay out the initial guest stack per the RISC-V psABI: argv strings,
/// then (decreasing address) the argv terminator, the (empty) envp
/// terminator, the `AT_NULL` auxv terminator, the argv pointer array,
/// and finally argc at the lowest address, which becomes `sp`. The
/// region itself comes from the program-break allocator rather than a
/// dedicated stack mapping, matching the design's single allocation
/// path.
fn build_initial_stack(mmu: &mut Mmu, argv: &[String]) -> Addr {
    let top = mmu
        .brk(mmu.base + STACK_SIZE)
        .expect("failed to reserve the initial guest stack");

    let mut sp = top;
    let mut argv_ptrs = Vec::with_capacity(argv.len());
    for s in argv.iter().rev() {
        let bytes = s.as_bytes();
        sp -= bytes.len() as u64 + 1;
        mmu.store(sp, bytes);
        mmu.store(sp + bytes.len() as u64, &[0u8]);
        argv_ptrs.push(sp);
    }
    argv_ptrs.reverse();

    // The fixed-size table below (argc, argv pointers, argv terminator,
    // envp terminator, auxv terminator) always occupies a multiple of
    // 8 bytes; align its start down to 16 now so the final sp -- which
    // points at argc, the lowest address in the table -- lands on a
    // 16-byte boundary as the psABI requires at _start.
    let table_len = 8 + 8 * argv_ptrs.len() as u64 + 8 + 8 + 16;
    sp = (sp - table_len) & !0xfu64;
    sp += table_len;

    sp -= 16; // AT_NULL auxv terminator
    mmu.store(sp, &0u64.to_le_bytes());
    mmu.store(sp + 8, &0u64.to_le_bytes());

    sp -= 8; // envp terminator; no environment is forwarded
    mmu.store(sp, &0u64.to_le_bytes());

    sp -= 8; // argv terminator
    mmu.store(sp, &0u64.to_le_bytes());

    for &ptr in argv_ptrs.iter().rev() {
        sp -= 8;
        mmu.store(sp, &ptr.to_le_bytes());
    }

    sp -= 8; // argc
    mmu.store(sp, &(argv.len() as u64).to_le_bytes());

    sp
}

fn print_memory(mmu: &Mmu, base: Addr) {
    for n in 0..8u64 {
        let addr = base + 8 * n;
        let word = u64::from_le_bytes(mmu.load::<8>(addr));
        println!("{addr:x}: {word:016x}");
    }
}

/// Run with a per-instruction trace, bypassing the hot-block cache:
/// tracing needs a hook between every instruction, which the
/// block-at-a-time dispatcher doesn't expose.
fn run_traced(machine: &mut Machine, mmu: &mut Mmu, mem_dump: Option<Addr>) -> ExitReason {
    loop {
        eprintln!("pc=0x{:x}", machine.pc);
        let block_ended = interp::step(machine, mmu).unwrap_or_else(|e| {
            eprintln!("fatal: {e}");
            std::process::exit(1);
        });
        if let Some(base) = mem_dump {
            print_memory(mmu, base);
        }
        if block_ended {
            match machine.exit_reason {
                ExitReason::Ecall => return ExitReason::Ecall,
                ExitReason::Ebreak => return ExitReason::Ebreak,
                ExitReason::BlockEnd => {}
            }
        }
    }
}

fn main() {
    let args = Args::parse();

    let mut mmu = Mmu::new();
    let entry = load_elf(&mut mmu, &args.elf).unwrap_or_else(|e| {
        eprintln!("error loading {}: {e}", args.elf.display());
        std::process::exit(1);
    });
    eprintln!("entry: 0x{entry:x}");

    let mut argv = vec![args.elf.to_string_lossy().into_owned()];
    argv.extend(args.guest_args.iter().cloned());
    let sp = build_initial_stack(&mut mmu, &argv);

    let mut machine = Machine::new(entry, sp);
    let mut dispatcher = Dispatcher::new(NullCompiler).unwrap_or_else(|e| {
        eprintln!("fatal: {e}");
        std::process::exit(1);
    });

    loop {
        let reason = if args.trace {
            run_traced(&mut machine, &mut mmu, args.mem_dump)
        } else {
            dispatcher.run(&mut machine, &mut mmu).unwrap_or_else(|e| {
                eprintln!("fatal: {e}");
                std::process::exit(1);
            })
        };

        match reason {
            ExitReason::Ecall => {
                if let Err(e) = syscall::dispatch(&mut machine, &mut mmu) {
                    eprintln!("fatal: {e}");
                    std::process::exit(1);
                }
                rv64emu::dispatch::reenter(&mut machine);
            }
            ExitReason::Ebreak => {
                eprintln!("ebreak hit at pc=0x{:x}", machine.pc);
                std::process::exit(1);
            }
            ExitReason::BlockEnd => unreachable!("run/run_traced only return on ecall or ebreak"),
        }
    }
}

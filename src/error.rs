//! Crate-wide error taxonomy.
//!
//! §7 of the design splits failures into invariant violations (fatal),
//! illegal guest instructions (fatal, for now), host I/O and allocation
//! failures (fatal), and guest syscall failures (never surfaced here —
//! they go back to the guest as a negative errno in `a0`). Only the
//! first four kinds produce an [`EmuError`]; the last is handled
//! entirely inside [`crate::syscall`].

use thiserror::Error;

use crate::types::Addr;

#[derive(Debug, Error)]
pub enum EmuError {
    #[error("invariant violation at {site}: {detail}")]
    Invariant { site: &'static str, detail: String },

    #[error("illegal instruction 0x{word:08x} at pc=0x{pc:x}")]
    IllegalInstruction { pc: Addr, word: u32 },

    #[error(transparent)]
    Elf(#[from] ElfError),

    #[error("host mmap/munmap/mprotect failed: {0}")]
    Mmap(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ElfError {
    #[error("file too small to contain an ELF header")]
    TooSmall,
    #[error("bad ELF magic bytes")]
    BadMagic,
    #[error("only statically linked riscv64 (EM_RISCV, ELFCLASS64) executables are supported")]
    WrongMachineOrClass,
    #[error("ELF has no PT_LOAD segments")]
    NoLoadSegments,
    #[error("underlying ELF parse error: {0}")]
    Parse(String),
    #[error("I/O error reading ELF file: {0}")]
    Io(#[from] std::io::Error),
}

/// Abort with a message identifying the call site, mirroring the
/// source's `fatalf` macro. Used only for conditions the design
/// classifies as invariant violations: states that cannot arise from
/// any well-formed guest input, as opposed to a guest illegal
/// instruction or a syscall failure, both of which are reported
/// through ordinary `Result`s instead.
#[macro_export]
macro_rules! fatal {
    ($site:expr, $($arg:tt)*) => {{
        eprintln!("[fatal] {}: {}", $site, format!($($arg)*));
        std::process::exit(1);
    }};
}

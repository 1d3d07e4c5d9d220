//! ELF loading.
//!
//! Parses the ELF header and `PT_LOAD` program headers with the `elf`
//! crate (the same crate the teacher uses for section-header walks) and
//! maps each segment into the guest address space through [`Mmu`].
//! Beyond what loading requires, the ELF header is not interpreted —
//! the design treats the rest of the header parser as out of scope.

use elf::abi::{EM_RISCV, ELFCLASS64, ET_EXEC, PT_LOAD};
use elf::endian::LittleEndian;
use elf::ElfBytes;

use crate::error::{ElfError, EmuError};
use crate::memory::{Mmu, Perm};
use crate::types::Addr;

/// Load a static RV64 ELF executable into `mmu`, mapping every
/// `PT_LOAD` segment at `TO_HOST(p_vaddr)` with permissions derived
/// from `p_flags`, satisfying any BSS tail with an additional anonymous
/// mapping, and recording the entry point. Returns the entry address.
pub fn load_elf(mmu: &mut Mmu, path: &std::path::Path) -> Result<Addr, EmuError> {
    let bytes = std::fs::read(path).map_err(ElfError::Io)?;
    if bytes.len() < 64 {
        return Err(ElfError::TooSmall.into());
    }
    if &bytes[0..4] != b"\x7fELF" {
        return Err(ElfError::BadMagic.into());
    }

    let file = ElfBytes::<LittleEndian>::minimal_parse(&bytes)
        .map_err(|e| ElfError::Parse(e.to_string()))?;

    let header = file.ehdr;
    if header.e_machine != EM_RISCV || header.class != elf::file::Class::ELF64 {
        return Err(ElfError::WrongMachineOrClass.into());
    }
    debug_assert_eq!(ELFCLASS64, 2, "sanity check on the elf crate's class constant");
    if header.e_type != ET_EXEC {
        return Err(ElfError::WrongMachineOrClass.into());
    }

    let segments = file
        .segments()
        .ok_or(ElfError::NoLoadSegments)?;

    let mut any_load = false;
    for phdr in segments.iter().filter(|p| p.p_type == PT_LOAD) {
        any_load = true;
        let file_data = file
            .segment_data(&phdr)
            .map_err(|e| ElfError::Parse(e.to_string()))?;
        let perm = Perm::from_elf_pflags(phdr.p_flags);

        // file_data covers p_filesz bytes; memsz may be larger (BSS
        // tail), which map_segment zero-pads since `data` is shorter
        // than `size`.
        let memsz = phdr.p_memsz;
        mmu.map_segment(phdr.p_vaddr, memsz, perm, file_data)?;
    }
    if !any_load {
        return Err(ElfError::NoLoadSegments.into());
    }

    mmu.entry = header.e_entry;
    Ok(mmu.entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    /// Build a minimal valid RV64 ET_EXEC ELF with one PT_LOAD segment
    /// (a handful of `addi`/`ecall` words) and a BSS tail, entirely in
    /// memory, so the loader can be exercised without a prebuilt
    /// fixture binary.
    fn build_minimal_elf(text: &[u8], memsz_extra: u64) -> Vec<u8> {
        const EHDR_SIZE: u64 = 64;
        const PHDR_SIZE: u64 = 56;
        let vaddr = 0x1_0000u64;
        let filesz = text.len() as u64;
        let memsz = filesz + memsz_extra;

        let mut buf = Vec::new();
        // e_ident
        buf.extend_from_slice(b"\x7fELF");
        buf.push(2); // ELFCLASS64
        buf.push(1); // little-endian
        buf.push(1); // EI_VERSION
        buf.extend_from_slice(&[0u8; 9]); // padding
        buf.extend_from_slice(&2u16.to_le_bytes()); // e_type = ET_EXEC
        buf.extend_from_slice(&243u16.to_le_bytes()); // e_machine = EM_RISCV
        buf.extend_from_slice(&1u32.to_le_bytes()); // e_version
        buf.extend_from_slice(&vaddr.to_le_bytes()); // e_entry
        buf.extend_from_slice(&EHDR_SIZE.to_le_bytes()); // e_phoff
        buf.extend_from_slice(&0u64.to_le_bytes()); // e_shoff
        buf.extend_from_slice(&0u32.to_le_bytes()); // e_flags
        buf.extend_from_slice(&(EHDR_SIZE as u16).to_le_bytes()); // e_ehsize
        buf.extend_from_slice(&(PHDR_SIZE as u16).to_le_bytes()); // e_phentsize
        buf.extend_from_slice(&1u16.to_le_bytes()); // e_phnum
        buf.extend_from_slice(&0u16.to_le_bytes()); // e_shentsize
        buf.extend_from_slice(&0u16.to_le_bytes()); // e_shnum
        buf.extend_from_slice(&0u16.to_le_bytes()); // e_shstrndx
        assert_eq!(buf.len() as u64, EHDR_SIZE);

        // Program header (PT_LOAD, R+W+X)
        buf.extend_from_slice(&1u32.to_le_bytes()); // p_type = PT_LOAD
        buf.extend_from_slice(&7u32.to_le_bytes()); // p_flags = R|W|X
        let p_offset = EHDR_SIZE + PHDR_SIZE;
        buf.extend_from_slice(&p_offset.to_le_bytes());
        buf.extend_from_slice(&vaddr.to_le_bytes()); // p_vaddr
        buf.extend_from_slice(&vaddr.to_le_bytes()); // p_paddr
        buf.extend_from_slice(&filesz.to_le_bytes());
        buf.extend_from_slice(&memsz.to_le_bytes());
        buf.extend_from_slice(&0x1000u64.to_le_bytes()); // p_align

        buf.extend_from_slice(text);
        buf
    }

    #[test]
    fn loads_text_and_zeroes_bss_tail() {
        let text: &[u8] = &[0x13, 0x00, 0x00, 0x00]; // addi x0, x0, 0
        let image = build_minimal_elf(text, 0x100);
        let dir = std::env::temp_dir();
        let path = dir.join(format!("rv64emu-test-{}.elf", std::process::id()));
        {
            let mut f = std::fs::File::create(&path).unwrap();
            f.write_all(&image).unwrap();
        }

        let mut mmu = Mmu::new();
        let entry = load_elf(&mut mmu, &path).unwrap();
        assert_eq!(entry, 0x1_0000);
        assert_eq!(mmu.load::<4>(0x1_0000), text);
        assert_eq!(mmu.load::<4>(0x1_0000 + 0x50), [0u8; 4]);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn rejects_bad_magic() {
        let mut data = build_minimal_elf(&[0u8; 4], 0);
        data[0] = b'X';
        let dir = std::env::temp_dir();
        let path = dir.join(format!("rv64emu-test-badmagic-{}.elf", std::process::id()));
        std::fs::write(&path, &data).unwrap();

        let mut mmu = Mmu::new();
        let result = load_elf(&mut mmu, &path);
        assert!(matches!(result, Err(EmuError::Elf(ElfError::BadMagic))));
        std::fs::remove_file(&path).ok();
    }
}

//! Guest memory manager.
//!
//! Guest and host share one address space via a fixed offset (§4.3):
//! every guest virtual address becomes a host virtual address by
//! addition, and vice versa by subtraction. Guest mappings are real
//! host mappings — there is no page table and no software MMU, which is
//! what makes `TO_HOST`/`TO_GUEST` a plain arithmetic round trip rather
//! than a translation that can fail.

use std::ffi::c_void;

use crate::bits::{round_down, round_up};
use crate::error::EmuError;
use crate::types::Addr;

/// Guest addresses live in `0x0..`; adding this offset lands them in a
/// high band that host user-space binaries (loaded low, or as PIE
/// somewhere in the middle of the address space) do not occupy, so
/// guest and host mappings cannot collide.
pub const OFFSET: u64 = 0x0000_8880_0000_0000;

#[inline]
pub fn to_host(guest: Addr) -> Addr {
    guest.wrapping_add(OFFSET)
}

#[inline]
pub fn to_guest(host: Addr) -> Addr {
    host.wrapping_sub(OFFSET)
}

/// Mirrors the ELF `PF_R`/`PF_W`/`PF_X` program-header flags (§4.3).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Perm(u32);

impl Perm {
    pub const READ: Perm = Perm(1 << 0);
    pub const WRITE: Perm = Perm(1 << 1);
    pub const EXEC: Perm = Perm(1 << 2);

    pub const fn contains(self, other: Perm) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn from_elf_pflags(p_flags: u32) -> Perm {
        // ELF PF_X = 1, PF_W = 2, PF_R = 4.
        let mut perm = Perm(0);
        if p_flags & 0x4 != 0 {
            perm.0 |= Self::READ.0;
        }
        if p_flags & 0x2 != 0 {
            perm.0 |= Self::WRITE.0;
        }
        if p_flags & 0x1 != 0 {
            perm.0 |= Self::EXEC.0;
        }
        perm
    }
}

impl std::ops::BitOr for Perm {
    type Output = Perm;
    fn bitor(self, rhs: Perm) -> Perm {
        Perm(self.0 | rhs.0)
    }
}

fn perm_to_prot(perm: Perm) -> i32 {
    let mut prot = libc::PROT_NONE;
    if perm.contains(Perm::READ) {
        prot |= libc::PROT_READ;
    }
    if perm.contains(Perm::WRITE) {
        prot |= libc::PROT_WRITE;
    }
    if perm.contains(Perm::EXEC) {
        prot |= libc::PROT_EXEC;
    }
    prot
}

fn page_size() -> u64 {
    // SAFETY: sysconf with _SC_PAGESIZE never fails on a POSIX host and
    // takes no pointer arguments.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as u64 }
}

/// Guest↔host address translation plus program-break–style dynamic
/// allocation, all backed by real host mappings (§4.3, §5 resource 2).
#[derive(Debug)]
pub struct Mmu {
    /// Guest entry point, read from the ELF header.
    pub entry: Addr,
    /// Top of mapped host region (host address space, page-aligned).
    pub host_alloc: Addr,
    /// High-water mark of loaded ELF segments, in guest address space.
    pub base: Addr,
    /// Current program break, in guest address space.
    pub alloc: Addr,
}

impl Default for Mmu {
    fn default() -> Self {
        Self {
            entry: 0,
            host_alloc: to_host(0),
            base: 0,
            alloc: 0,
        }
    }
}

impl Mmu {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `size` bytes of guest memory starting at `guest_addr` with
    /// the given permissions, backed by `data` (zero-padded if shorter
    /// than `size`). `guest_addr` and `size` need not be page-aligned;
    /// the mapping is rounded out to whole pages, matching the PT_LOAD
    /// handling in §4.3.
    pub fn map_segment(
        &mut self,
        guest_addr: Addr,
        size: u64,
        perm: Perm,
        data: &[u8],
    ) -> Result<(), EmuError> {
        let page = page_size();
        let host_addr = to_host(guest_addr);
        let aligned_host = round_down(host_addr, page);
        let pad = host_addr - aligned_host;
        let aligned_len = round_up(size + pad, page);

        // SAFETY: MAP_FIXED|MAP_ANONYMOUS over an address we have
        // computed to be inside the guest's reserved high band; the
        // mapping is torn down only by explicit brk shrinkage or
        // process exit, never aliased.
        let ptr = unsafe {
            libc::mmap(
                aligned_host as *mut c_void,
                aligned_len as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(EmuError::Mmap(std::io::Error::last_os_error()));
        }

        // SAFETY: the mapping above covers [aligned_host, aligned_host
        // + aligned_len) with write permission; `data` is at most
        // `size` bytes and `pad + data.len() <= aligned_len`.
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                (aligned_host as *mut u8).add(pad as usize),
                data.len(),
            );
        }

        let prot = perm_to_prot(perm);
        // SAFETY: same region as the mmap above, already fully
        // initialized.
        let rc = unsafe { libc::mprotect(aligned_host as *mut c_void, aligned_len as usize, prot) };
        if rc != 0 {
            return Err(EmuError::Mmap(std::io::Error::last_os_error()));
        }

        let end = aligned_host + aligned_len;
        if end > self.host_alloc {
            self.host_alloc = end;
        }
        let guest_end = guest_addr + size;
        if guest_end > self.base {
            self.base = round_up(guest_end, page);
        }
        Ok(())
    }

    /// Program-break allocator (§4.3). `addr == 0` returns the current
    /// break without mutating anything. Otherwise grows or shrinks the
    /// mapped region to match, never letting the break fall below
    /// `base`.
    pub fn brk(&mut self, addr: Addr) -> Result<Addr, EmuError> {
        if addr == 0 {
            if self.alloc == 0 {
                self.alloc = self.base;
            }
            return Ok(self.alloc);
        }
        if self.alloc == 0 {
            self.alloc = self.base;
        }
        if addr < self.base {
            return Ok(self.alloc);
        }

        let page = page_size();
        if addr > self.alloc {
            let new_top = round_up(to_host(addr), page);
            if new_top > self.host_alloc {
                let grow = new_top - self.host_alloc;
                // SAFETY: extends the mapped region immediately above
                // the current high-water mark with a fresh anonymous
                // fixed mapping; nothing else owns that range yet.
                let ptr = unsafe {
                    libc::mmap(
                        self.host_alloc as *mut c_void,
                        grow as usize,
                        libc::PROT_READ | libc::PROT_WRITE,
                        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
                        -1,
                        0,
                    )
                };
                if ptr == libc::MAP_FAILED {
                    return Err(EmuError::Mmap(std::io::Error::last_os_error()));
                }
                self.host_alloc = new_top;
            }
            self.alloc = addr;
        } else {
            let old_top = round_up(to_host(self.alloc), page);
            let new_top = round_up(to_host(addr), page);
            if old_top > new_top + page {
                let shrink = old_top - new_top;
                // SAFETY: unmaps only the trailing pages this struct
                // itself mapped via brk growth above.
                let rc = unsafe { libc::munmap(new_top as *mut c_void, shrink as usize) };
                if rc != 0 {
                    return Err(EmuError::Mmap(std::io::Error::last_os_error()));
                }
                self.host_alloc = new_top;
            }
            self.alloc = addr;
        }
        Ok(self.alloc)
    }

    /// Read `len` bytes out of guest memory at `guest_addr`.
    ///
    /// # Safety
    /// `guest_addr..guest_addr+len` must fall inside a region this
    /// `Mmu` has mapped (a loaded segment or brk-grown heap/stack).
    pub unsafe fn read_bytes(&self, guest_addr: Addr, len: usize) -> &[u8] {
        std::slice::from_raw_parts(to_host(guest_addr) as *const u8, len)
    }

    /// Write `data` into guest memory at `guest_addr`.
    ///
    /// # Safety
    /// Same precondition as [`Mmu::read_bytes`], with write permission.
    pub unsafe fn write_bytes(&mut self, guest_addr: Addr, data: &[u8]) {
        std::ptr::copy_nonoverlapping(data.as_ptr(), to_host(guest_addr) as *mut u8, data.len());
    }

    pub fn load<const N: usize>(&self, guest_addr: Addr) -> [u8; N] {
        // SAFETY: the interpreter only issues loads/stores against
        // addresses derived from registers that were themselves seeded
        // from mapped ELF segments, the brk-allocated heap, or the
        // brk-allocated stack; out-of-bounds guest accesses are a
        // guest bug outside this emulator's fault-reporting scope
        // (§1 Non-goals: precise exception generation).
        let bytes = unsafe { self.read_bytes(guest_addr, N) };
        bytes.try_into().unwrap()
    }

    pub fn store(&mut self, guest_addr: Addr, data: &[u8]) {
        // SAFETY: see `load`.
        unsafe { self.write_bytes(guest_addr, data) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_host_to_guest_round_trips() {
        for pc in [0u64, 0x1000, 0x8000_0000, 0xdead_beef] {
            assert_eq!(to_guest(to_host(pc)), pc);
        }
    }

    #[test]
    fn brk_zero_returns_current_without_mutating() {
        let mut mmu = Mmu::new();
        mmu.base = 0x1_0000;
        mmu.alloc = 0x2_0000;
        let host_alloc_before = mmu.host_alloc;
        assert_eq!(mmu.brk(0).unwrap(), 0x2_0000);
        assert_eq!(mmu.alloc, 0x2_0000);
        assert_eq!(mmu.host_alloc, host_alloc_before);
    }

    #[test]
    fn brk_below_base_is_rejected() {
        let mut mmu = Mmu::new();
        mmu.base = 0x10_0000;
        mmu.alloc = 0x10_0000;
        let before = mmu.alloc;
        let result = mmu.brk(0x1000).unwrap();
        assert_eq!(result, before, "brk below base must not move the break");
    }

    #[test]
    fn brk_grows_and_is_writable() {
        let mut mmu = Mmu::new();
        mmu.map_segment(0x1000, 0x10, Perm::READ | Perm::WRITE, &[0xffu8; 0x10])
            .unwrap();
        mmu.base = 0x2000;
        mmu.alloc = 0x2000;
        let new_break = mmu.brk(0x2000 + 0x10000).unwrap();
        assert_eq!(new_break, 0x2000 + 0x10000);
        mmu.store(0x2100, &[1, 2, 3, 4]);
        assert_eq!(mmu.load::<4>(0x2100), [1, 2, 3, 4]);
    }
}

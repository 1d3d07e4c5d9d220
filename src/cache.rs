//! Hot-block cache (§4.4).
//!
//! A fixed 65536-slot table keyed by guest PC, linear-probed with a
//! 32-step hard cap ported from `original_source/src/cache.c`'s
//! `assert(++search_count <= MAX_SEARCH_COUNT)` — past that many
//! collisions the table is treated as misconfigured and the process
//! aborts rather than degrading silently into an O(n) scan. A slot only
//! reports a usable compiled block once its hot counter has saturated
//! at the promotion threshold *and* code has actually been recorded for
//! it; until then lookups are always misses.

use crate::error::EmuError;
use crate::machine::Machine;
use crate::memory::Mmu;
use crate::types::Addr;

const NUM_SLOTS: usize = 65536;
const MAX_PROBES: u32 = 32;
const HOT_THRESHOLD: u32 = 100_000;
const ARENA_SIZE: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy)]
struct Slot {
    pc: Addr,
    hits: u32,
    /// Byte offset into the arena once code has been emitted for this
    /// PC; `None` until `cache_add` runs.
    offset: Option<usize>,
    occupied: bool,
}

impl Default for Slot {
    fn default() -> Self {
        Self {
            pc: 0,
            hits: 0,
            offset: None,
            occupied: false,
        }
    }
}

/// Raw host machine code a [`BlockCompiler`] hands back for one guest
/// PC; the cache assigns it an arena offset via `cache_add`. Nothing in
/// this crate ever produces one (see [`NullCompiler`]): the type exists
/// so the cache's promotion/arena bookkeeping is exercised by tests
/// independent of a real code generator.
#[derive(Debug, Clone)]
pub struct CompiledBlock {
    pub code: Vec<u8>,
    pub align: usize,
}

/// The seam a JIT backend would implement (§4.4 "Added"). `NullCompiler`
/// is the only implementation shipped; it always declines, so the
/// dispatcher falls back to the interpreter for every block while the
/// cache's promotion/arena mechanics stay fully testable.
pub trait BlockCompiler {
    fn compile(&self, machine: &Machine, mmu: &Mmu, pc: Addr) -> Option<CompiledBlock>;
}

pub struct NullCompiler;

impl BlockCompiler for NullCompiler {
    fn compile(&self, _machine: &Machine, _mmu: &Mmu, _pc: Addr) -> Option<CompiledBlock> {
        None
    }
}

pub struct HotCache {
    slots: Vec<Slot>,
    arena: *mut u8,
    arena_tail: usize,
}

impl HotCache {
    pub fn new() -> Result<Self, EmuError> {
        // SAFETY: MAP_PRIVATE|MAP_ANONYMOUS with no fixed address; the
        // mapping is owned exclusively by this HotCache and released in
        // Drop.
        let arena = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                ARENA_SIZE,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if arena == libc::MAP_FAILED {
            return Err(EmuError::Mmap(std::io::Error::last_os_error()));
        }
        Ok(Self {
            slots: vec![Slot::default(); NUM_SLOTS],
            arena: arena as *mut u8,
            arena_tail: 0,
        })
    }

    fn index(pc: Addr) -> usize {
        (pc % NUM_SLOTS as u64) as usize
    }

    /// Find `pc`'s slot, linear-probing past collisions. Returns `None`
    /// if `pc` has never been seen and there's room to claim a slot, or
    /// panics past `MAX_PROBES` the way the source's `assert` would
    /// (ported as a fatal invariant, §7 item 1).
    fn find_slot(&self, pc: Addr) -> Result<Option<usize>, EmuError> {
        let start = Self::index(pc);
        for probe in 0..MAX_PROBES {
            let i = (start + probe as usize) % NUM_SLOTS;
            let slot = &self.slots[i];
            if slot.occupied && slot.pc == pc {
                return Ok(Some(i));
            }
            if !slot.occupied {
                return Ok(None);
            }
        }
        Err(EmuError::Invariant {
            site: "cache::find_slot",
            detail: format!("probe cap ({MAX_PROBES}) exceeded for pc=0x{pc:x}"),
        })
    }

    fn claim_slot(&mut self, pc: Addr) -> Result<usize, EmuError> {
        let start = Self::index(pc);
        for probe in 0..MAX_PROBES {
            let i = (start + probe as usize) % NUM_SLOTS;
            if !self.slots[i].occupied {
                self.slots[i] = Slot {
                    pc,
                    hits: 0,
                    offset: None,
                    occupied: true,
                };
                return Ok(i);
            }
            if self.slots[i].pc == pc {
                return Ok(i);
            }
        }
        Err(EmuError::Invariant {
            site: "cache::claim_slot",
            detail: format!("probe cap ({MAX_PROBES}) exceeded for pc=0x{pc:x}"),
        })
    }

    /// Returns the arena address for `pc` only once it is hot and code
    /// has been recorded; otherwise `None` (cold path: interpret).
    pub fn cache_lookup(&self, pc: Addr) -> Result<Option<*const u8>, EmuError> {
        let Some(i) = self.find_slot(pc)? else {
            return Ok(None);
        };
        let slot = &self.slots[i];
        if slot.hits >= HOT_THRESHOLD {
            if let Some(offset) = slot.offset {
                // SAFETY: offset was produced by `cache_add`, which only
                // ever returns offsets inside `[0, arena_tail)` of this
                // same arena allocation.
                return Ok(Some(unsafe { self.arena.add(offset) }));
            }
        }
        Ok(None)
    }

    /// Bump `pc`'s hot counter, saturating at the threshold. Returns
    /// `true` exactly the call that crosses the threshold, so the
    /// dispatcher knows to invoke the compiler this once.
    pub fn cache_hot(&mut self, pc: Addr) -> Result<bool, EmuError> {
        let i = self.claim_slot(pc)?;
        let slot = &mut self.slots[i];
        if slot.hits >= HOT_THRESHOLD {
            return Ok(false);
        }
        slot.hits += 1;
        Ok(slot.hits == HOT_THRESHOLD)
    }

    /// Copy `code` into the arena tail (rounded up to `align`), record
    /// `(pc, offset)`, and return the executable address.
    pub fn cache_add(&mut self, pc: Addr, code: &[u8], align: usize) -> Result<*const u8, EmuError> {
        let aligned_tail = crate::bits::round_up(self.arena_tail as u64, align as u64) as usize;
        let end = aligned_tail + code.len();
        if end > ARENA_SIZE {
            return Err(EmuError::Invariant {
                site: "cache::cache_add",
                detail: "code arena exhausted".to_string(),
            });
        }
        // SAFETY: `aligned_tail..end` is within the arena's mapped
        // RWX region and not yet claimed by any other block.
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), self.arena.add(aligned_tail), code.len());
        }
        flush_icache(unsafe { self.arena.add(aligned_tail) }, code.len());
        self.arena_tail = end;

        let i = self.claim_slot(pc)?;
        self.slots[i].offset = Some(aligned_tail);
        // SAFETY: see cache_lookup.
        Ok(unsafe { self.arena.add(aligned_tail) })
    }
}

impl Drop for HotCache {
    fn drop(&mut self) {
        // SAFETY: `self.arena` was obtained from `mmap` with length
        // `ARENA_SIZE` in `new` and is not shared with anything else.
        unsafe {
            libc::munmap(self.arena as *mut std::ffi::c_void, ARENA_SIZE);
        }
    }
}

/// No host architecture's instruction cache needs flushing through a
/// syscall that this crate's host targets expose generically; this is
/// the documented no-op shim for `__builtin___clear_cache`-style calls
/// (§5).
fn flush_icache(_start: *const u8, _len: usize) {}

// SAFETY: the arena pointer is only ever dereferenced through the
// bounds this struct itself enforces; `Machine`/`Mmu` references
// crossing thread boundaries are not part of this crate's concurrency
// model (§5: single-threaded).
unsafe impl Send for HotCache {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn miss_until_hot_and_coded() {
        let cache = HotCache::new().unwrap();
        assert!(cache.cache_lookup(0x1000).unwrap().is_none());
    }

    #[test]
    fn hot_counter_saturates_and_reports_threshold_crossing() {
        let mut cache = HotCache::new().unwrap();
        let mut crossed = false;
        for _ in 0..HOT_THRESHOLD {
            crossed = cache.cache_hot(0x2000).unwrap();
        }
        assert!(crossed, "threshold-th call must report crossing");
        assert!(!cache.cache_hot(0x2000).unwrap(), "further calls stay false");
    }

    #[test]
    fn hot_without_code_is_still_a_miss() {
        let mut cache = HotCache::new().unwrap();
        for _ in 0..HOT_THRESHOLD {
            cache.cache_hot(0x3000).unwrap();
        }
        assert!(cache.cache_lookup(0x3000).unwrap().is_none());
    }

    #[test]
    fn hot_and_coded_is_a_hit() {
        let mut cache = HotCache::new().unwrap();
        for _ in 0..HOT_THRESHOLD {
            cache.cache_hot(0x4000).unwrap();
        }
        let addr = cache.cache_add(0x4000, &[0x90, 0x90], 16).unwrap();
        let looked_up = cache.cache_lookup(0x4000).unwrap().unwrap();
        assert_eq!(addr, looked_up);
    }

    #[test]
    fn distinct_pcs_use_distinct_slots() {
        let mut cache = HotCache::new().unwrap();
        let i1 = cache.claim_slot(0x5000).unwrap();
        let i2 = cache.claim_slot(0x6000).unwrap();
        assert_ne!(i1, i2);
    }

    #[test]
    fn probe_cap_is_a_fatal_invariant() {
        let mut cache = HotCache::new().unwrap();
        // Collide NUM_SLOTS-multiples so every one of MAX_PROBES+1 keys
        // maps to the same starting slot.
        for n in 0..=MAX_PROBES {
            let pc = n as u64 * NUM_SLOTS as u64;
            let result = cache.claim_slot(pc);
            if n < MAX_PROBES {
                assert!(result.is_ok());
            } else {
                assert!(matches!(result, Err(EmuError::Invariant { .. })));
            }
        }
    }
}

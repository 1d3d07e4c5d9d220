//! Environment-call translation layer (§6).
//!
//! The core only ever hands control here on an `ecall` exit
//! (`ExitReason::Ecall`); everything else this emulator does stays
//! entirely inside the four core subsystems. [`dispatch`] reads `a7`
//! (the syscall number) and `a0..a5` (its arguments) off the register
//! file, services the request against the host, and writes the 64-bit
//! result back into `a0`. Execution resumes at `machine.reenter_pc`,
//! set by the interpreter before it returned.
//!
//! Numbers and the set of implemented calls are grounded in
//! `original_source/src/syscall.c`'s `SYS_*` table and its `sys_brk`/
//! `sys_fstat` bodies; everything that table lists as
//! `sys_unimplemented` but that a minimal userland (libc startup, file
//! I/O, `printf`) actually needs to make progress is implemented here
//! against the real host syscall of the same name, since an
//! environment call that can never succeed makes the crate
//! non-runnable rather than merely incomplete.

use std::ffi::CStr;
use std::io;
use std::os::raw::c_char;

use thiserror::Error;

use crate::machine::Machine;
use crate::memory::{to_host, Mmu};
use crate::types::{Addr, GpReg};

#[derive(Debug, Error)]
pub enum SyscallError {
    #[error("unimplemented syscall number {0}")]
    Unimplemented(u64),
}

/// Linux RISC-V syscall numbers, `original_source/src/syscall.c`'s
/// `SYS_*` list.
mod nr {
    pub const GETCWD: u64 = 17;
    pub const FACCESSAT: u64 = 48;
    pub const OPENAT: u64 = 56;
    pub const CLOSE: u64 = 57;
    pub const LSEEK: u64 = 62;
    pub const READ: u64 = 63;
    pub const WRITE: u64 = 64;
    pub const WRITEV: u64 = 66;
    pub const PREAD: u64 = 67;
    pub const PWRITE: u64 = 68;
    pub const FSTATAT: u64 = 79;
    pub const FSTAT: u64 = 80;
    pub const EXIT: u64 = 93;
    pub const EXIT_GROUP: u64 = 94;
    pub const GETTIMEOFDAY: u64 = 169;
    pub const UNAME: u64 = 160;
    pub const BRK: u64 = 214;

    // Legacy (pre-2014, ≥1024) numbers the same libcs still emit.
    pub const OPEN: u64 = 1024;
    pub const ACCESS: u64 = 1033;
    pub const STAT: u64 = 1038;
    pub const LSTAT: u64 = 1039;
}

/// Guest-side `open`/`openat` flag bits, the Linux "generic" ABI RISC-V
/// shares with most non-x86 architectures.
mod guest_flag {
    pub const O_WRONLY: u32 = 0o1;
    pub const O_RDWR: u32 = 0o2;
    pub const O_CREAT: u32 = 0o100;
    pub const O_EXCL: u32 = 0o200;
    pub const O_NOCTTY: u32 = 0o400;
    pub const O_TRUNC: u32 = 0o1000;
    pub const O_APPEND: u32 = 0o2000;
    pub const O_NONBLOCK: u32 = 0o4000;
    pub const O_DIRECTORY: u32 = 0o200000;
    pub const O_CLOEXEC: u32 = 0o2000000;
}

/// Translate guest `open`-family flags to the host's, rather than
/// passing the guest's bit pattern straight through: a host that isn't
/// itself RISC-V Linux (or another "generic ABI" architecture) would
/// otherwise silently honor the wrong bits.
fn remap_open_flags(guest: u32) -> i32 {
    let mut host = match guest & 0o3 {
        guest_flag::O_WRONLY => libc::O_WRONLY,
        x if x == guest_flag::O_RDWR => libc::O_RDWR,
        _ => libc::O_RDONLY,
    };
    if guest & guest_flag::O_CREAT != 0 {
        host |= libc::O_CREAT;
    }
    if guest & guest_flag::O_EXCL != 0 {
        host |= libc::O_EXCL;
    }
    if guest & guest_flag::O_NOCTTY != 0 {
        host |= libc::O_NOCTTY;
    }
    if guest & guest_flag::O_TRUNC != 0 {
        host |= libc::O_TRUNC;
    }
    if guest & guest_flag::O_APPEND != 0 {
        host |= libc::O_APPEND;
    }
    if guest & guest_flag::O_NONBLOCK != 0 {
        host |= libc::O_NONBLOCK;
    }
    if guest & guest_flag::O_DIRECTORY != 0 {
        host |= libc::O_DIRECTORY;
    }
    if guest & guest_flag::O_CLOEXEC != 0 {
        host |= libc::O_CLOEXEC;
    }
    host
}

fn errno_neg() -> i64 {
    -(io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO) as i64)
}

/// Borrow a NUL-terminated guest string as a host `&CStr`.
///
/// # Safety
/// `guest_ptr` must point at a NUL-terminated byte sequence inside a
/// region `mmu` has mapped.
unsafe fn guest_cstr<'a>(guest_ptr: Addr) -> &'a CStr {
    CStr::from_ptr(to_host(guest_ptr) as *const c_char)
}

fn args(machine: &Machine) -> [u64; 6] {
    [
        machine.read_gp(GpReg::A0.index() as i8),
        machine.read_gp(GpReg::A1.index() as i8),
        machine.read_gp(GpReg::A2.index() as i8),
        machine.read_gp(GpReg::A3.index() as i8),
        machine.read_gp(GpReg::A4.index() as i8),
        machine.read_gp(GpReg::A5.index() as i8),
    ]
}

/// Service the `ecall` the guest just made. Reads `a7`/`a0..a5`,
/// performs the corresponding host syscall, and writes the result back
/// into `a0` (§6). `exit`/`exit_group` terminate the host process
/// directly with the guest's exit status, matching a real kernel's
/// `do_exit` — there is no "returning" from them.
pub fn dispatch(machine: &mut Machine, mmu: &mut Mmu) -> Result<(), SyscallError> {
    let num = machine.read_gp(GpReg::A7.index() as i8);
    let [a0, a1, a2, a3, _a4, _a5] = args(machine);

    let ret: i64 = match num {
        nr::EXIT | nr::EXIT_GROUP => std::process::exit(a0 as i32),

        nr::BRK => match mmu.brk(a0) {
            Ok(v) => v as i64,
            Err(_) => -1,
        },

        nr::READ => sys_read(a0 as i32, a1, a2 as usize),
        nr::WRITE => sys_write(a0 as i32, a1, a2 as usize),
        nr::PREAD => sys_pread(a0 as i32, a1, a2 as usize, a3 as i64),
        nr::PWRITE => sys_pwrite(a0 as i32, a1, a2 as usize, a3 as i64),

        nr::OPENAT => sys_openat(a0 as i32, a1, a2 as u32, a3 as u32),
        nr::OPEN => sys_openat(libc::AT_FDCWD, a0, a1 as u32, a2 as u32),
        nr::CLOSE => sys_close(a0 as i32),
        nr::LSEEK => sys_lseek(a0 as i32, a1 as i64, a2 as i32),

        nr::FSTAT => sys_fstat(a0 as i32, a1),
        nr::FSTATAT => sys_fstatat(a0 as i32, a1, a2, a3 as i32),
        nr::STAT => sys_fstatat(libc::AT_FDCWD, a0, a1, 0),
        nr::LSTAT => sys_fstatat(libc::AT_FDCWD, a0, a1, libc::AT_SYMLINK_NOFOLLOW),

        nr::FACCESSAT => sys_faccessat(a0 as i32, a1, a2 as i32, a3 as i32),
        nr::ACCESS => sys_faccessat(libc::AT_FDCWD, a0, a1 as i32, 0),

        nr::WRITEV => sys_writev(a0 as i32, a1, a2 as i32),
        nr::GETTIMEOFDAY => sys_gettimeofday(a0),
        nr::UNAME => sys_uname(a0),
        nr::GETCWD => sys_getcwd(a0, a1 as usize),

        _ => return Err(SyscallError::Unimplemented(num)),
    };

    machine.write_gp(GpReg::A0.index() as i8, ret as u64);
    Ok(())
}

fn sys_read(fd: i32, buf: Addr, count: usize) -> i64 {
    // SAFETY: `buf..buf+count` is guest memory the caller is
    // responsible for having mapped; reading into it through the host
    // address is exactly what `to_host` exists for.
    let rc = unsafe { libc::read(fd, to_host(buf) as *mut _, count) };
    if rc < 0 {
        errno_neg()
    } else {
        rc as i64
    }
}

fn sys_write(fd: i32, buf: Addr, count: usize) -> i64 {
    // SAFETY: see `sys_read`.
    let rc = unsafe { libc::write(fd, to_host(buf) as *const _, count) };
    if rc < 0 {
        errno_neg()
    } else {
        rc as i64
    }
}

fn sys_pread(fd: i32, buf: Addr, count: usize, offset: i64) -> i64 {
    // SAFETY: see `sys_read`.
    let rc = unsafe { libc::pread(fd, to_host(buf) as *mut _, count, offset) };
    if rc < 0 {
        errno_neg()
    } else {
        rc as i64
    }
}

fn sys_pwrite(fd: i32, buf: Addr, count: usize, offset: i64) -> i64 {
    // SAFETY: see `sys_read`.
    let rc = unsafe { libc::pwrite(fd, to_host(buf) as *const _, count, offset) };
    if rc < 0 {
        errno_neg()
    } else {
        rc as i64
    }
}

fn sys_openat(dirfd: i32, pathname: Addr, flags: u32, mode: u32) -> i64 {
    // SAFETY: the guest is required to pass a NUL-terminated path;
    // openat itself never writes through this pointer.
    let path = unsafe { guest_cstr(pathname) };
    let rc = unsafe { libc::openat(dirfd, path.as_ptr(), remap_open_flags(flags), mode) };
    if rc < 0 {
        errno_neg()
    } else {
        rc as i64
    }
}

fn sys_close(fd: i32) -> i64 {
    // fds 0/1/2 are shared with the host process (§5); a guest closing
    // its own stdio must not tear down ours.
    if fd <= 2 {
        return 0;
    }
    let rc = unsafe { libc::close(fd) };
    if rc < 0 {
        errno_neg()
    } else {
        0
    }
}

fn sys_lseek(fd: i32, offset: i64, whence: i32) -> i64 {
    let rc = unsafe { libc::lseek(fd, offset, whence) };
    if rc < 0 {
        errno_neg()
    } else {
        rc
    }
}

fn sys_fstat(fd: i32, statbuf: Addr) -> i64 {
    // SAFETY: `statbuf` names a guest-mapped region at least
    // `size_of::<libc::stat>()` bytes long, by the same contract every
    // other memory-writing syscall here relies on.
    let rc = unsafe { libc::fstat(fd, to_host(statbuf) as *mut libc::stat) };
    if rc < 0 {
        errno_neg()
    } else {
        0
    }
}

fn sys_fstatat(dirfd: i32, pathname: Addr, statbuf: Addr, flags: i32) -> i64 {
    let path = unsafe { guest_cstr(pathname) };
    // SAFETY: see `sys_fstat`.
    let rc = unsafe { libc::fstatat(dirfd, path.as_ptr(), to_host(statbuf) as *mut libc::stat, flags) };
    if rc < 0 {
        errno_neg()
    } else {
        0
    }
}

fn sys_faccessat(dirfd: i32, pathname: Addr, mode: i32, flags: i32) -> i64 {
    let path = unsafe { guest_cstr(pathname) };
    let rc = unsafe { libc::faccessat(dirfd, path.as_ptr(), mode, flags) };
    if rc < 0 {
        errno_neg()
    } else {
        0
    }
}

fn sys_writev(fd: i32, iov: Addr, iovcnt: i32) -> i64 {
    if iovcnt < 0 {
        return -(libc::EINVAL as i64);
    }
    let mut host_iov = Vec::with_capacity(iovcnt as usize);
    for i in 0..iovcnt as u64 {
        // Each guest `iovec` is `{ iov_base: u64, iov_len: u64 }`, 16
        // bytes, matching the host layout on a 64-bit target.
        let entry_addr = iov + i * 16;
        host_iov.push(libc::iovec {
            iov_base: to_host(read_u64_at(entry_addr)) as *mut _,
            iov_len: read_u64_at(entry_addr + 8) as usize,
        });
    }
    // SAFETY: each `iov_base` was translated through `to_host` from a
    // guest pointer the guest claims is readable for `iov_len` bytes.
    let rc = unsafe { libc::writev(fd, host_iov.as_ptr(), iovcnt) };
    if rc < 0 {
        errno_neg()
    } else {
        rc as i64
    }
}

fn read_u64_at(guest_addr: Addr) -> u64 {
    // SAFETY: the guest iovec array is required to be mapped by the
    // caller, same contract as every other syscall argument here.
    let host_ptr = to_host(guest_addr) as *const u64;
    unsafe { host_ptr.read_unaligned() }
}

fn sys_gettimeofday(tv: Addr) -> i64 {
    if tv == 0 {
        return 0;
    }
    // SAFETY: `tv` names a guest-mapped `struct timeval`; no timezone
    // struct is ever requested.
    let rc = unsafe { libc::gettimeofday(to_host(tv) as *mut libc::timeval, std::ptr::null_mut()) };
    if rc < 0 {
        errno_neg()
    } else {
        0
    }
}

fn sys_uname(buf: Addr) -> i64 {
    // SAFETY: `buf` names a guest-mapped `struct utsname`.
    let rc = unsafe { libc::uname(to_host(buf) as *mut libc::utsname) };
    if rc < 0 {
        errno_neg()
    } else {
        0
    }
}

fn sys_getcwd(buf: Addr, size: usize) -> i64 {
    if size == 0 {
        return -(libc::EINVAL as i64);
    }
    // SAFETY: `buf..buf+size` is guest-mapped, per the same contract as
    // every other buffer-writing syscall above.
    let rc = unsafe { libc::getcwd(to_host(buf) as *mut c_char, size) };
    if rc.is_null() {
        errno_neg()
    } else {
        buf as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Perm;
    use crate::types::GpReg;

    fn machine_with_fd_args(num: u64, a0: u64, a1: u64, a2: u64, a3: u64) -> Machine {
        let mut m = Machine::default();
        m.write_gp(GpReg::A7.index() as i8, num);
        m.write_gp(GpReg::A0.index() as i8, a0);
        m.write_gp(GpReg::A1.index() as i8, a1);
        m.write_gp(GpReg::A2.index() as i8, a2);
        m.write_gp(GpReg::A3.index() as i8, a3);
        m
    }

    #[test]
    fn remap_open_flags_passes_through_generic_bits() {
        let host = remap_open_flags(guest_flag::O_CREAT | guest_flag::O_TRUNC | guest_flag::O_WRONLY);
        assert_eq!(host & libc::O_CREAT, libc::O_CREAT);
        assert_eq!(host & libc::O_TRUNC, libc::O_TRUNC);
        assert_eq!(host & libc::O_WRONLY, libc::O_WRONLY);
    }

    #[test]
    fn close_of_stdio_fds_is_a_no_op_success() {
        assert_eq!(sys_close(0), 0);
        assert_eq!(sys_close(1), 0);
        assert_eq!(sys_close(2), 0);
    }

    #[test]
    fn openat_write_lseek_read_round_trip_through_a_real_file() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("rv64emu-syscall-test-{}.txt", std::process::id()));
        let path_c = std::ffi::CString::new(path.to_str().unwrap()).unwrap();

        let mut mmu = Mmu::new();
        // One writable guest page to stage the path string and I/O buffer in.
        mmu.map_segment(0x5000, 0x1000, Perm::READ | Perm::WRITE, &[]).unwrap();
        mmu.store(0x5000, path_c.as_bytes_with_nul());
        mmu.store(0x5100, b"hello");

        let flags = guest_flag::O_CREAT | guest_flag::O_WRONLY | guest_flag::O_TRUNC;
        let fd = sys_openat(libc::AT_FDCWD, 0x5000, flags, 0o644);
        assert!(fd >= 0, "openat failed: {fd}");

        let written = sys_write(fd as i32, 0x5100, 5);
        assert_eq!(written, 5);
        assert_eq!(sys_close(fd as i32), 0);

        let fd = sys_openat(libc::AT_FDCWD, 0x5000, 0, 0);
        assert!(fd >= 0);
        mmu.store(0x5200, &[0u8; 5]);
        let read = sys_read(fd as i32, 0x5200, 5);
        assert_eq!(read, 5);
        // SAFETY: just wrote 5 bytes at this address above.
        let bytes = unsafe { mmu.read_bytes(0x5200, 5) };
        assert_eq!(bytes, b"hello");
        sys_close(fd as i32);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn fstat_of_a_known_size_file_reports_that_size() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("rv64emu-syscall-fstat-{}.txt", std::process::id()));
        std::fs::write(&path, b"0123456789").unwrap();
        let path_c = std::ffi::CString::new(path.to_str().unwrap()).unwrap();

        let mut mmu = Mmu::new();
        mmu.map_segment(0x6000, 0x1000, Perm::READ | Perm::WRITE, &[]).unwrap();
        mmu.store(0x6000, path_c.as_bytes_with_nul());

        let fd = sys_openat(libc::AT_FDCWD, 0x6000, 0, 0);
        assert!(fd >= 0);
        let rc = sys_fstat(fd as i32, 0x6100);
        assert_eq!(rc, 0);
        // SAFETY: libc::stat's st_size field is the 6th u64-sized field
        // on a standard x86_64/riscv64 Linux layout is not portable to
        // assert on directly here; instead use the libc type itself.
        let st: libc::stat = unsafe { (to_host(0x6100) as *const libc::stat).read_unaligned() };
        assert_eq!(st.st_size, 10);

        sys_close(fd as i32);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn dispatch_routes_through_a7_and_writes_a0() {
        let mut mmu = Mmu::new();
        mmu.map_segment(0x7000, 0x1000, Perm::READ | Perm::WRITE, &[]).unwrap();
        mmu.base = 0x8000;
        mmu.alloc = 0x8000;

        let mut machine = machine_with_fd_args(nr::BRK, 0, 0, 0, 0);
        dispatch(&mut machine, &mut mmu).unwrap();
        assert_eq!(machine.read_gp(GpReg::A0.index() as i8), 0x8000);
    }

    #[test]
    fn unimplemented_syscall_number_is_reported_not_fatal() {
        let mut mmu = Mmu::new();
        let mut machine = machine_with_fd_args(999_999, 0, 0, 0, 0);
        let result = dispatch(&mut machine, &mut mmu);
        assert!(matches!(result, Err(SyscallError::Unimplemented(999_999))));
    }
}

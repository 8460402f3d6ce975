//! Raw virtual-memory façade.
//!
//! Thin, policy-free wrappers over the platform's mapping calls, plus the
//! one policy this crate does centralize: how a range gets zeroed. All
//! sizes must be page-multiples and all addresses page-aligned; debug
//! builds assert it.
//!
//! A *reservation* carries no protection and no backing. `commit` makes
//! pages readable and writable; `uncommit` returns them to the
//! reserved-but-unbacked state.

use core::ptr;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::constants::ZERO_WRITE_LIMIT;
use crate::error::QbaError;

static PAGE_SIZE: AtomicU64 = AtomicU64::new(0);

/// OS page size, queried once and cached.
pub fn page_size() -> u64 {
    let cached = PAGE_SIZE.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    let size = sys::query_page_size();
    PAGE_SIZE.store(size, Ordering::Relaxed);
    size
}

/// Whether named shared mappings exist on this platform.
pub fn supports_sharing() -> bool {
    sys::SUPPORTS_SHARING
}

#[inline]
fn debug_check(addr: u64, size: u64) {
    let page = page_size();
    debug_assert!(addr % page == 0, "address {:#x} not page-aligned", addr);
    debug_assert!(size % page == 0, "size {:#x} not a page multiple", size);
}

/// Reserve `size` bytes of address space wherever the OS likes.
pub fn reserve(size: u64) -> Result<u64, QbaError> {
    debug_check(0, size);
    sys::reserve(size)
}

/// Reserve `size` bytes at exactly `addr`.
pub fn reserve_at(addr: u64, size: u64) -> Result<u64, QbaError> {
    debug_check(addr, size);
    sys::reserve_at(addr, size)
}

/// Reserve `size` bytes at an address that is a multiple of `alignment`.
///
/// Over-reserves by `size + alignment - page`, excises the aligned middle
/// and returns the prefix and postfix to the OS.
pub fn reserve_aligned(size: u64, alignment: u64) -> Result<u64, QbaError> {
    debug_check(0, size);
    debug_assert!(alignment.is_power_of_two());
    let page = page_size();
    if alignment <= page {
        return sys::reserve(size);
    }
    sys::reserve_aligned(size, alignment, page)
}

/// Map `size` bytes of the shared object `fd` read-write at exactly `addr`.
pub fn map_shared(addr: u64, size: u64, fd: i32) -> Result<u64, QbaError> {
    debug_check(addr, size);
    sys::map_shared(addr, size, fd)
}

/// Make reserved pages readable and writable.
pub fn commit(addr: u64, size: u64) -> Result<(), QbaError> {
    debug_check(addr, size);
    sys::commit(addr, size)
}

/// Drop the physical backing and protection of committed pages.
pub fn uncommit(addr: u64, size: u64) {
    debug_check(addr, size);
    sys::uncommit(addr, size);
}

/// Return a reservation to the OS.
pub fn release(addr: u64, size: u64) {
    debug_check(addr, size);
    sys::release(addr, size);
}

/// Zero `[addr, addr + size)`.
///
/// Small ranges are written directly. Large private ranges discard their
/// physical backing instead, resetting copy-on-write to the zero page.
/// Shared ranges are always written: discarding a shared page would drop
/// other processes' view of it too.
pub fn zero(addr: u64, size: u64, shared: bool) {
    if size == 0 {
        return;
    }
    let page = page_size();
    let resettable = !shared && size > ZERO_WRITE_LIMIT && addr % page == 0 && size % page == 0;
    if !resettable || sys::reset(addr, size).is_err() {
        unsafe { ptr::write_bytes(addr as usize as *mut u8, 0, size as usize) };
    }
}

/// Copy `size` bytes between non-overlapping committed ranges.
pub fn copy(src: u64, dst: u64, size: u64) {
    unsafe {
        ptr::copy_nonoverlapping(
            src as usize as *const u8,
            dst as usize as *mut u8,
            size as usize,
        );
    }
}

/// Create or attach the named shared object. Returns the descriptor and
/// whether this call created it.
pub fn shared_create(name: &str) -> Result<(i32, bool), QbaError> {
    sys::shared_create(name)
}

/// Grow the shared object to `size` bytes.
pub fn shared_truncate(fd: i32, size: u64) -> Result<(), QbaError> {
    sys::shared_truncate(fd, size)
}

/// Remove the shared object's name.
pub fn shared_unlink(name: &str) {
    sys::shared_unlink(name);
}

/// Close a descriptor from [`shared_create`].
pub fn shared_close(fd: i32) {
    sys::shared_close(fd);
}

#[cfg(unix)]
mod sys {
    use std::ffi::CString;

    use qba_lib::align_up_u64;

    use crate::error::QbaError;

    pub const SUPPORTS_SHARING: bool = true;

    fn last_os_error() -> i32 {
        std::io::Error::last_os_error().raw_os_error().unwrap_or(-1)
    }

    pub fn query_page_size() -> u64 {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size <= 0 { 4096 } else { size as u64 }
    }

    pub fn reserve(size: u64) -> Result<u64, QbaError> {
        let addr = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                size as usize,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            log::warn!("reserve of {:#x} bytes refused: os error {}", size, last_os_error());
            return Err(QbaError::OutOfAddressSpace);
        }
        Ok(addr as u64)
    }

    #[cfg(target_os = "linux")]
    const FIXED_FLAG: libc::c_int = libc::MAP_FIXED_NOREPLACE;
    #[cfg(not(target_os = "linux"))]
    const FIXED_FLAG: libc::c_int = libc::MAP_FIXED;

    pub fn reserve_at(addr: u64, size: u64) -> Result<u64, QbaError> {
        let got = unsafe {
            libc::mmap(
                addr as usize as *mut libc::c_void,
                size as usize,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE | FIXED_FLAG,
                -1,
                0,
            )
        };
        if got == libc::MAP_FAILED || got as u64 != addr {
            if got != libc::MAP_FAILED {
                unsafe { libc::munmap(got, size as usize) };
            }
            return Err(QbaError::OutOfAddressSpace);
        }
        Ok(addr)
    }

    pub fn reserve_aligned(size: u64, alignment: u64, page: u64) -> Result<u64, QbaError> {
        let oversize = size + alignment - page;
        let raw = reserve(oversize)?;
        let base = align_up_u64(raw, alignment);
        let prefix = base - raw;
        if prefix != 0 {
            unsafe { libc::munmap(raw as usize as *mut libc::c_void, prefix as usize) };
        }
        let postfix = oversize - prefix - size;
        if postfix != 0 {
            unsafe {
                libc::munmap((base + size) as usize as *mut libc::c_void, postfix as usize)
            };
        }
        Ok(base)
    }

    pub fn map_shared(addr: u64, size: u64, fd: i32) -> Result<u64, QbaError> {
        let got = unsafe {
            libc::mmap(
                addr as usize as *mut libc::c_void,
                size as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | FIXED_FLAG,
                fd,
                0,
            )
        };
        if got == libc::MAP_FAILED || got as u64 != addr {
            let code = last_os_error();
            if got != libc::MAP_FAILED {
                unsafe { libc::munmap(got, size as usize) };
            }
            log::warn!("shared map at {:#x} failed: os error {}", addr, code);
            return Err(QbaError::MapFailed { code });
        }
        Ok(addr)
    }

    pub fn commit(addr: u64, size: u64) -> Result<(), QbaError> {
        let rc = unsafe {
            libc::mprotect(
                addr as usize as *mut libc::c_void,
                size as usize,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };
        if rc != 0 {
            return Err(QbaError::MapFailed { code: last_os_error() });
        }
        Ok(())
    }

    pub fn uncommit(addr: u64, size: u64) {
        unsafe {
            libc::madvise(
                addr as usize as *mut libc::c_void,
                size as usize,
                libc::MADV_DONTNEED,
            );
            libc::mprotect(addr as usize as *mut libc::c_void, size as usize, libc::PROT_NONE);
        }
    }

    pub fn release(addr: u64, size: u64) {
        unsafe { libc::munmap(addr as usize as *mut libc::c_void, size as usize) };
    }

    pub fn reset(addr: u64, size: u64) -> Result<(), QbaError> {
        let rc = unsafe {
            libc::madvise(
                addr as usize as *mut libc::c_void,
                size as usize,
                libc::MADV_DONTNEED,
            )
        };
        if rc != 0 {
            return Err(QbaError::MapFailed { code: last_os_error() });
        }
        Ok(())
    }

    fn shm_name(name: &str) -> CString {
        let mut owned = String::with_capacity(name.len() + 1);
        if !name.starts_with('/') {
            owned.push('/');
        }
        owned.push_str(name);
        CString::new(owned).unwrap_or_default()
    }

    pub fn shared_create(name: &str) -> Result<(i32, bool), QbaError> {
        let cname = shm_name(name);
        let fd = unsafe {
            libc::shm_open(
                cname.as_ptr(),
                libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                0o600 as libc::mode_t,
            )
        };
        if fd >= 0 {
            return Ok((fd, true));
        }
        if last_os_error() == libc::EEXIST {
            let fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_RDWR, 0) };
            if fd >= 0 {
                return Ok((fd, false));
            }
        }
        Err(QbaError::MapFailed { code: last_os_error() })
    }

    pub fn shared_truncate(fd: i32, size: u64) -> Result<(), QbaError> {
        let rc = unsafe { libc::ftruncate(fd, size as libc::off_t) };
        if rc != 0 {
            return Err(QbaError::MapFailed { code: last_os_error() });
        }
        Ok(())
    }

    pub fn shared_unlink(name: &str) {
        let cname = shm_name(name);
        unsafe { libc::shm_unlink(cname.as_ptr()) };
    }

    pub fn shared_close(fd: i32) {
        if fd >= 0 {
            unsafe { libc::close(fd) };
        }
    }
}

#[cfg(windows)]
mod sys {
    use qba_lib::align_up_u64;

    use windows_sys::Win32::System::Memory::{
        MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_NOACCESS, PAGE_READWRITE,
        VirtualAlloc, VirtualFree,
    };
    use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

    use crate::error::QbaError;

    pub const SUPPORTS_SHARING: bool = false;

    pub fn query_page_size() -> u64 {
        let mut info = core::mem::MaybeUninit::<SYSTEM_INFO>::uninit();
        unsafe { GetSystemInfo(info.as_mut_ptr()) };
        let info = unsafe { info.assume_init() };
        info.dwPageSize as u64
    }

    pub fn reserve(size: u64) -> Result<u64, QbaError> {
        let addr = unsafe {
            VirtualAlloc(core::ptr::null(), size as usize, MEM_RESERVE, PAGE_NOACCESS)
        };
        if addr.is_null() {
            return Err(QbaError::OutOfAddressSpace);
        }
        Ok(addr as u64)
    }

    pub fn reserve_at(addr: u64, size: u64) -> Result<u64, QbaError> {
        let got = unsafe {
            VirtualAlloc(
                addr as usize as *const core::ffi::c_void,
                size as usize,
                MEM_RESERVE,
                PAGE_NOACCESS,
            )
        };
        if got as u64 != addr {
            return Err(QbaError::OutOfAddressSpace);
        }
        Ok(addr)
    }

    pub fn reserve_aligned(size: u64, alignment: u64, _page: u64) -> Result<u64, QbaError> {
        // A reservation cannot be partially released here, so probe: take
        // an oversized reservation to learn a usable range, drop it, and
        // re-reserve the aligned slice before anyone else can.
        for _ in 0..16 {
            let probe = reserve(size + alignment)?;
            let base = align_up_u64(probe, alignment);
            release(probe, 0);
            if let Ok(addr) = reserve_at(base, size) {
                return Ok(addr);
            }
        }
        Err(QbaError::OutOfAddressSpace)
    }

    pub fn map_shared(_addr: u64, _size: u64, _fd: i32) -> Result<u64, QbaError> {
        Err(QbaError::ShareUnsupported)
    }

    pub fn commit(addr: u64, size: u64) -> Result<(), QbaError> {
        let got = unsafe {
            VirtualAlloc(
                addr as usize as *const core::ffi::c_void,
                size as usize,
                MEM_COMMIT,
                PAGE_READWRITE,
            )
        };
        if got.is_null() {
            return Err(QbaError::MapFailed { code: 0 });
        }
        Ok(())
    }

    pub fn uncommit(addr: u64, size: u64) {
        unsafe {
            VirtualFree(addr as usize as *mut core::ffi::c_void, size as usize, MEM_DECOMMIT)
        };
    }

    pub fn release(addr: u64, _size: u64) {
        unsafe { VirtualFree(addr as usize as *mut core::ffi::c_void, 0, MEM_RELEASE) };
    }

    pub fn reset(addr: u64, size: u64) -> Result<(), QbaError> {
        uncommit(addr, size);
        commit(addr, size)
    }

    pub fn shared_create(_name: &str) -> Result<(i32, bool), QbaError> {
        Err(QbaError::ShareUnsupported)
    }

    pub fn shared_truncate(_fd: i32, _size: u64) -> Result<(), QbaError> {
        Err(QbaError::ShareUnsupported)
    }

    pub fn shared_unlink(_name: &str) {}

    pub fn shared_close(_fd: i32) {}
}

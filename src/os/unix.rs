use crate::map_error;
use crate::mmap::{MapFlags, Mmap, ProtFlags};
use core::ffi::{c_int, c_void};
use core::ptr::NonNull;
use libc::{mmap, mprotect, munmap};

pub(crate) struct MmapImpl;

fn prot_unix(prot: ProtFlags) -> c_int {
    let mut out = libc::PROT_NONE;
    if prot.contains(ProtFlags::PROT_READ) {
        out |= libc::PROT_READ;
    }
    if prot.contains(ProtFlags::PROT_WRITE) {
        out |= libc::PROT_WRITE;
    }
    if prot.contains(ProtFlags::PROT_EXEC) {
        out |= libc::PROT_EXEC;
    }
    out
}

fn flags_unix(flags: MapFlags) -> c_int {
    let mut out = libc::MAP_ANON;
    if flags.contains(MapFlags::MAP_PRIVATE) {
        out |= libc::MAP_PRIVATE;
    }
    if flags.contains(MapFlags::MAP_FIXED) {
        out |= libc::MAP_FIXED;
    }
    out
}

impl Mmap for MmapImpl {
    unsafe fn mmap_anonymous(
        addr: Option<usize>,
        len: usize,
        prot: ProtFlags,
        flags: MapFlags,
    ) -> crate::Result<NonNull<c_void>> {
        let ptr = unsafe {
            mmap(
                addr.unwrap_or(0) as *mut c_void,
                len,
                prot_unix(prot),
                flags_unix(flags),
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(map_error(format!(
                "mmap failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(unsafe { NonNull::new_unchecked(ptr) })
    }

    unsafe fn munmap(addr: NonNull<c_void>, len: usize) -> crate::Result<()> {
        if unsafe { munmap(addr.as_ptr(), len) } != 0 {
            return Err(map_error(format!(
                "munmap failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    unsafe fn mprotect(addr: NonNull<c_void>, len: usize, prot: ProtFlags) -> crate::Result<()> {
        if unsafe { mprotect(addr.as_ptr(), len, prot_unix(prot)) } != 0 {
            return Err(map_error(format!(
                "mprotect failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }
}

use crate::map_error;
use crate::mmap::{MapFlags, Mmap, ProtFlags};
use core::ffi::c_void;
use core::mem::MaybeUninit;
use core::ptr::{null, NonNull};
use windows_sys::Win32::Foundation::GetLastError;
use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, VirtualProtect, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE,
    PAGE_EXECUTE, PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE, PAGE_NOACCESS,
    PAGE_PROTECTION_FLAGS, PAGE_READONLY, PAGE_READWRITE,
};

pub(crate) struct MmapImpl;

fn prot_win(prot: ProtFlags) -> PAGE_PROTECTION_FLAGS {
    let read = prot.contains(ProtFlags::PROT_READ);
    let write = prot.contains(ProtFlags::PROT_WRITE);
    let exec = prot.contains(ProtFlags::PROT_EXEC);
    match (read, write, exec) {
        (false, false, false) => PAGE_NOACCESS,
        (true, false, false) => PAGE_READONLY,
        (_, true, false) => PAGE_READWRITE,
        (false, false, true) => PAGE_EXECUTE,
        (true, false, true) => PAGE_EXECUTE_READ,
        (_, true, true) => PAGE_EXECUTE_READWRITE,
    }
}

impl Mmap for MmapImpl {
    unsafe fn mmap_anonymous(
        addr: Option<usize>,
        len: usize,
        prot: ProtFlags,
        _flags: MapFlags,
    ) -> crate::Result<NonNull<c_void>> {
        let wish = addr.map_or(null(), |addr| addr as *const c_void);
        let ptr = unsafe { VirtualAlloc(wish, len, MEM_RESERVE | MEM_COMMIT, prot_win(prot)) };
        NonNull::new(ptr).ok_or_else(|| {
            map_error(format!("VirtualAlloc failed: error code {}", unsafe {
                GetLastError()
            }))
        })
    }

    unsafe fn munmap(addr: NonNull<c_void>, _len: usize) -> crate::Result<()> {
        if unsafe { VirtualFree(addr.as_ptr(), 0, MEM_RELEASE) } == 0 {
            return Err(map_error(format!("VirtualFree failed: error code {}", unsafe {
                GetLastError()
            })));
        }
        Ok(())
    }

    unsafe fn mprotect(addr: NonNull<c_void>, len: usize, prot: ProtFlags) -> crate::Result<()> {
        let mut old = MaybeUninit::uninit();
        if unsafe { VirtualProtect(addr.as_ptr(), len, prot_win(prot), old.as_mut_ptr()) } == 0 {
            return Err(map_error(format!(
                "VirtualProtect failed: error code {}",
                unsafe { GetLastError() }
            )));
        }
        Ok(())
    }
}

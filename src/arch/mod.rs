//! Host machine constant and the dynamic relocation rules for the ELF
//! backend. Only the host architecture's rules are compiled in; an image
//! for any other machine is rejected during validation.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod x86_64;
        pub(crate) use x86_64::*;
    } else if #[cfg(target_arch = "x86")] {
        mod x86;
        pub(crate) use x86::*;
    } else if #[cfg(target_arch = "aarch64")] {
        mod aarch64;
        pub(crate) use aarch64::*;
    } else {
        compile_error!("unsupported host architecture for the ELF backend");
    }
}

/// # Safety
/// `place..place + 4` must lie inside the image mapping.
#[allow(unused)]
#[inline]
pub(crate) unsafe fn write_word32(place: usize, value: u32) {
    unsafe { (place as *mut u32).write_unaligned(value) }
}

/// # Safety
/// `place..place + 8` must lie inside the image mapping.
#[cfg(target_pointer_width = "64")]
#[inline]
pub(crate) unsafe fn write_word64(place: usize, value: u64) {
    unsafe { (place as *mut u64).write_unaligned(value) }
}

/// Read the implicit addend stored at the relocation place (REL format).
///
/// # Safety
/// The host word at `place` must lie inside the image mapping.
#[inline]
pub(crate) unsafe fn read_implicit_addend(place: usize) -> i64 {
    #[cfg(target_pointer_width = "64")]
    {
        unsafe { (place as *const u64).read_unaligned() as i64 }
    }
    #[cfg(target_pointer_width = "32")]
    {
        unsafe { (place as *const u32).read_unaligned() as i32 as i64 }
    }
}

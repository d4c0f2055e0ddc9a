//! Per-OS memory primitives and the indirect-call primitive.

cfg_if::cfg_if! {
    if #[cfg(windows)] {
        mod windows;
        pub(crate) use windows::MmapImpl;
    } else if #[cfg(unix)] {
        mod unix;
        pub(crate) use unix::MmapImpl;
    }
}

/// Call the machine word at `addr` as a zero-argument C function and
/// discard its return value.
///
/// Rust's `extern "C"` calling convention keeps the mandated stack
/// alignment (16 bytes before `call`/`bl` on SysV amd64 and aarch64), so
/// no hand-written trampoline is needed.
///
/// # Safety
/// `addr` must be the address of a callable function inside an
/// executable mapping, and the callee must be ABI-compatible with a
/// zero-argument C function.
#[cfg_attr(target_os = "macos", allow(unused))]
pub(crate) unsafe fn call0(addr: usize) {
    let entry: unsafe extern "C" fn() = unsafe { core::mem::transmute(addr) };
    unsafe { entry() }
}

//! Process-wide handle to the host dynamic linker's `dlopen`/`dlsym`/
//! `dlerror`/`dlclose`, resolved by address rather than by linking against
//! them: the on-disk symbol tables of the already-mapped libc-like modules
//! supply the offsets, the `/proc/self/maps` bases supply the rest.

use super::maps::{self, RuntimeModule};
use core::ffi::{c_char, c_int, c_void};
use std::ffi::{CStr, CString};
use std::sync::OnceLock;

type DlopenFn = unsafe extern "C" fn(*const c_char, c_int) -> *mut c_void;
type DlsymFn = unsafe extern "C" fn(*mut c_void, *const c_char) -> *mut c_void;
type DlerrorFn = unsafe extern "C" fn() -> *mut c_char;

pub(crate) struct DynApi {
    dlopen: usize,
    dlsym: usize,
    dlerror: usize,
    /// Kept for completeness; loaded dependencies stay open for the life
    /// of the process, so nothing calls it today.
    #[allow(unused)]
    dlclose: usize,
}

static DYN_API: OnceLock<core::result::Result<DynApi, String>> = OnceLock::new();

/// One-shot initialisation with a retained error: every call after a
/// failed init sees the same message.
pub(crate) fn get() -> core::result::Result<&'static DynApi, String> {
    match DYN_API.get_or_init(init) {
        Ok(api) => Ok(api),
        Err(err) => Err(err.clone()),
    }
}

fn init() -> core::result::Result<DynApi, String> {
    let modules = maps::runtime_modules().map_err(|err| err.to_string())?;
    let dlopen = runtime_api_symbol(&modules, "dlopen")?;
    let dlsym = runtime_api_symbol(&modules, "dlsym")?;
    let dlerror = runtime_api_symbol(&modules, "dlerror")?;
    let dlclose = runtime_api_symbol(&modules, "dlclose").unwrap_or(0);
    log::debug!("resolved runtime linker API: dlopen=0x{dlopen:x} dlsym=0x{dlsym:x}");
    Ok(DynApi {
        dlopen,
        dlsym,
        dlerror,
        dlclose,
    })
}

fn runtime_api_symbol(
    modules: &[RuntimeModule],
    symbol: &str,
) -> core::result::Result<usize, String> {
    for module in modules {
        if let Some(offset) = maps::symbol_offset_in_file(&module.path, symbol) {
            return Ok(module.base + offset as usize);
        }
    }
    Err(format!("symbol {symbol:?} not found in runtime modules"))
}

impl DynApi {
    /// `dlsym(NULL, name)`; `None` when the symbol is absent or the
    /// linker reported an error.
    pub(crate) fn dlsym_default(&self, name: &str) -> Option<usize> {
        let cname = CString::new(name).ok()?;
        self.clear_error();
        let dlsym: DlsymFn = unsafe { core::mem::transmute(self.dlsym) };
        let addr = unsafe { dlsym(core::ptr::null_mut(), cname.as_ptr()) } as usize;
        if self.take_error().is_some() || addr == 0 {
            return None;
        }
        Some(addr)
    }

    /// `dlopen(name, flags)`, surfacing the `dlerror` text on failure.
    pub(crate) fn dlopen(
        &self,
        name: &str,
        flags: c_int,
    ) -> core::result::Result<usize, String> {
        let cname =
            CString::new(name).map_err(|_| "library name contains NUL".to_string())?;
        self.clear_error();
        let dlopen: DlopenFn = unsafe { core::mem::transmute(self.dlopen) };
        let handle = unsafe { dlopen(cname.as_ptr(), flags) } as usize;
        if let Some(err) = self.take_error() {
            return Err(err);
        }
        if handle == 0 {
            return Err("dlopen returned a nil handle".to_string());
        }
        Ok(handle)
    }

    fn clear_error(&self) {
        if self.dlerror != 0 {
            let dlerror: DlerrorFn = unsafe { core::mem::transmute(self.dlerror) };
            let _ = unsafe { dlerror() };
        }
    }

    fn take_error(&self) -> Option<String> {
        if self.dlerror == 0 {
            return None;
        }
        let dlerror: DlerrorFn = unsafe { core::mem::transmute(self.dlerror) };
        let msg = unsafe { dlerror() };
        if msg.is_null() {
            return None;
        }
        let msg = unsafe { CStr::from_ptr(msg) }.to_string_lossy().into_owned();
        if msg.is_empty() {
            None
        } else {
            Some(msg)
        }
    }
}

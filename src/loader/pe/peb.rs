//! Runtime-module introspection via the PEB loader list.
//!
//! Walking `InMemoryOrderModuleList` yields the modules the OS loader has
//! already brought into the process, so the import binder can reuse them
//! instead of calling `LoadLibraryA` again.

use core::ffi::c_void;
use core::mem::size_of;

#[repr(C)]
struct ListEntry {
    flink: *mut ListEntry,
    blink: *mut ListEntry,
}

#[allow(dead_code)]
#[repr(C)]
struct UnicodeString {
    length: u16,
    maximum_length: u16,
    buffer: *mut u16,
}

/// The prefix of `LDR_DATA_TABLE_ENTRY` up to the names; the rest of the
/// structure varies across Windows versions and is not needed.
#[allow(dead_code)]
#[repr(C)]
struct LdrDataTableEntry {
    in_load_order_links: ListEntry,
    in_memory_order_links: ListEntry,
    in_initialization_order_links: ListEntry,
    dll_base: *mut c_void,
    entry_point: *mut c_void,
    size_of_image: u32,
    full_dll_name: UnicodeString,
    base_dll_name: UnicodeString,
}

/// An executable module registered with the OS loader.
pub(super) struct RuntimeModule {
    pub(super) name: String,
    pub(super) base: usize,
}

#[cfg(target_arch = "x86_64")]
fn peb_address() -> usize {
    let peb: usize;
    unsafe {
        core::arch::asm!("mov {}, gs:[0x60]", out(reg) peb, options(nostack, pure, readonly));
    }
    peb
}

#[cfg(target_arch = "x86")]
fn peb_address() -> usize {
    let peb: usize;
    unsafe {
        core::arch::asm!("mov {}, fs:[0x30]", out(reg) peb, options(nostack, pure, readonly));
    }
    peb
}

#[cfg(target_arch = "aarch64")]
fn peb_address() -> usize {
    // x18 holds the TEB on arm64 windows; the PEB pointer sits at +0x60.
    let teb: usize;
    unsafe {
        core::arch::asm!("mov {}, x18", out(reg) teb, options(nostack, pure, readonly));
    }
    unsafe { *((teb + 0x60) as *const usize) }
}

#[cfg(target_pointer_width = "64")]
const PEB_LDR_OFFSET: usize = 0x18;
#[cfg(target_pointer_width = "32")]
const PEB_LDR_OFFSET: usize = 0x0c;

#[cfg(target_pointer_width = "64")]
const LDR_MODULE_LIST_OFFSET: usize = 0x20;
#[cfg(target_pointer_width = "32")]
const LDR_MODULE_LIST_OFFSET: usize = 0x14;

fn unicode_to_string(text: &UnicodeString) -> String {
    if text.buffer.is_null() || text.length == 0 {
        return String::new();
    }
    let units = unsafe {
        core::slice::from_raw_parts(text.buffer, text.length as usize / size_of::<u16>())
    };
    String::from_utf16_lossy(units)
}

pub(super) fn runtime_modules() -> Vec<RuntimeModule> {
    let mut modules = Vec::new();
    let peb = peb_address();
    if peb == 0 {
        return modules;
    }
    let ldr = unsafe { *((peb + PEB_LDR_OFFSET) as *const usize) };
    if ldr == 0 {
        return modules;
    }
    let list_head = (ldr + LDR_MODULE_LIST_OFFSET) as *mut ListEntry;

    let mut cursor = unsafe { (*list_head).flink };
    while !cursor.is_null() && cursor != list_head {
        // The list links through `in_memory_order_links`, one ListEntry in.
        let entry = unsafe {
            &*((cursor as usize - size_of::<ListEntry>()) as *const LdrDataTableEntry)
        };
        if !entry.dll_base.is_null() {
            let name = unicode_to_string(&entry.base_dll_name);
            if !name.is_empty() {
                modules.push(RuntimeModule {
                    name,
                    base: entry.dll_base as usize,
                });
            }
        }
        cursor = unsafe { (*cursor).flink };
    }
    modules
}

/// Case-insensitive lookup by module basename, with and without `.dll`.
pub(super) fn module_by_name(modules: &[RuntimeModule], want: &str) -> Option<usize> {
    let want = want.to_ascii_lowercase();
    let want_with_dll = if want.ends_with(".dll") {
        want.clone()
    } else {
        format!("{want}.dll")
    };
    modules.iter().find_map(|module| {
        let name = module.name.to_ascii_lowercase();
        (name == want || name == want_with_dll).then_some(module.base)
    })
}

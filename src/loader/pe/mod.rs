//! PE (DLL) backend: a from-scratch mapper. Sections are laid out at
//! their RVAs inside one reserved region, base relocations are applied
//! against the achieved base, the import table is bound to modules
//! already in (or brought into) the process, section protections are
//! locked, TLS callbacks and `DllMain` run, and the export directory
//! becomes the exported-symbol table.

mod peb;

use crate::mmap::{align_up, ImageMapping, MapFlags, Mmap, ProtFlags, PAGE_SIZE};
use crate::os::{self, MmapImpl};
use crate::{
    dependency_error, export_not_found, foreign_platform_error, loader, malformed_error,
    relocate_error, unresolved_symbol_error, Error, Result,
};
use core::ffi::c_void;
use core::mem::size_of;
use core::ptr::NonNull;
use std::collections::HashMap;
use std::ffi::CString;
use windows_sys::Win32::System::LibraryLoader::{GetProcAddress, LoadLibraryA};

const DOS_SIGNATURE: u16 = 0x5a4d; // MZ
const NT_SIGNATURE: u32 = 0x0000_4550; // PE\0\0

const MACHINE_I386: u16 = 0x014c;
const MACHINE_AMD64: u16 = 0x8664;
const MACHINE_ARM64: u16 = 0xaa64;

#[cfg(target_arch = "x86")]
const HOST_MACHINE: u16 = MACHINE_I386;
#[cfg(target_arch = "x86_64")]
const HOST_MACHINE: u16 = MACHINE_AMD64;
#[cfg(target_arch = "aarch64")]
const HOST_MACHINE: u16 = MACHINE_ARM64;

#[cfg(target_pointer_width = "64")]
const OPTIONAL_MAGIC: u16 = 0x020b; // PE32+
#[cfg(target_pointer_width = "32")]
const OPTIONAL_MAGIC: u16 = 0x010b; // PE32

const FILE_DLL: u16 = 0x2000;

const DIRECTORY_EXPORT: usize = 0;
const DIRECTORY_IMPORT: usize = 1;
const DIRECTORY_BASERELOC: usize = 5;
const DIRECTORY_TLS: usize = 9;

const REL_BASED_ABSOLUTE: u16 = 0;
const REL_BASED_HIGHLOW: u16 = 3;
const REL_BASED_DIR64: u16 = 10;

const SCN_MEM_EXECUTE: u32 = 0x2000_0000;
const SCN_MEM_READ: u32 = 0x4000_0000;
const SCN_MEM_WRITE: u32 = 0x8000_0000;

const ORDINAL_FLAG: usize = 1 << (usize::BITS - 1);

const DLL_PROCESS_ATTACH: u32 = 1;
const DLL_PROCESS_DETACH: u32 = 0;

#[allow(dead_code)]
#[repr(C)]
struct DosHeader {
    e_magic: u16,
    e_cblp: u16,
    e_cp: u16,
    e_crlc: u16,
    e_cparhdr: u16,
    e_minalloc: u16,
    e_maxalloc: u16,
    e_ss: u16,
    e_sp: u16,
    e_csum: u16,
    e_ip: u16,
    e_cs: u16,
    e_lfarlc: u16,
    e_ovno: u16,
    e_res: [u16; 4],
    e_oemid: u16,
    e_oeminfo: u16,
    e_res2: [u16; 10],
    e_lfanew: i32,
}

#[allow(dead_code)]
#[repr(C)]
struct FileHeader {
    machine: u16,
    number_of_sections: u16,
    time_date_stamp: u32,
    pointer_to_symbol_table: u32,
    number_of_symbols: u32,
    size_of_optional_header: u16,
    characteristics: u16,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct DataDirectory {
    virtual_address: u32,
    size: u32,
}

#[allow(dead_code)]
#[repr(C)]
struct OptionalHeader64 {
    magic: u16,
    major_linker_version: u8,
    minor_linker_version: u8,
    size_of_code: u32,
    size_of_initialized_data: u32,
    size_of_uninitialized_data: u32,
    address_of_entry_point: u32,
    base_of_code: u32,
    image_base: u64,
    section_alignment: u32,
    file_alignment: u32,
    major_operating_system_version: u16,
    minor_operating_system_version: u16,
    major_image_version: u16,
    minor_image_version: u16,
    major_subsystem_version: u16,
    minor_subsystem_version: u16,
    win32_version_value: u32,
    size_of_image: u32,
    size_of_headers: u32,
    check_sum: u32,
    subsystem: u16,
    dll_characteristics: u16,
    size_of_stack_reserve: u64,
    size_of_stack_commit: u64,
    size_of_heap_reserve: u64,
    size_of_heap_commit: u64,
    loader_flags: u32,
    number_of_rva_and_sizes: u32,
    data_directory: [DataDirectory; 16],
}

#[allow(dead_code)]
#[repr(C)]
struct OptionalHeader32 {
    magic: u16,
    major_linker_version: u8,
    minor_linker_version: u8,
    size_of_code: u32,
    size_of_initialized_data: u32,
    size_of_uninitialized_data: u32,
    address_of_entry_point: u32,
    base_of_code: u32,
    base_of_data: u32,
    image_base: u32,
    section_alignment: u32,
    file_alignment: u32,
    major_operating_system_version: u16,
    minor_operating_system_version: u16,
    major_image_version: u16,
    minor_image_version: u16,
    major_subsystem_version: u16,
    minor_subsystem_version: u16,
    win32_version_value: u32,
    size_of_image: u32,
    size_of_headers: u32,
    check_sum: u32,
    subsystem: u16,
    dll_characteristics: u16,
    size_of_stack_reserve: u32,
    size_of_stack_commit: u32,
    size_of_heap_reserve: u32,
    size_of_heap_commit: u32,
    loader_flags: u32,
    number_of_rva_and_sizes: u32,
    data_directory: [DataDirectory; 16],
}

#[cfg(target_pointer_width = "64")]
type OptionalHeader = OptionalHeader64;
#[cfg(target_pointer_width = "32")]
type OptionalHeader = OptionalHeader32;

#[allow(dead_code)]
#[repr(C)]
struct SectionHeader {
    name: [u8; 8],
    virtual_size: u32,
    virtual_address: u32,
    size_of_raw_data: u32,
    pointer_to_raw_data: u32,
    pointer_to_relocations: u32,
    pointer_to_linenumbers: u32,
    number_of_relocations: u16,
    number_of_linenumbers: u16,
    characteristics: u32,
}

#[repr(C)]
struct BaseRelocationBlock {
    virtual_address: u32,
    size_of_block: u32,
}

#[allow(dead_code)]
#[repr(C)]
struct ImportDescriptor {
    original_first_thunk: u32,
    time_date_stamp: u32,
    forwarder_chain: u32,
    name: u32,
    first_thunk: u32,
}

#[allow(dead_code)]
#[repr(C)]
struct ExportDirectory {
    characteristics: u32,
    time_date_stamp: u32,
    major_version: u16,
    minor_version: u16,
    name: u32,
    base: u32,
    number_of_functions: u32,
    number_of_names: u32,
    address_of_functions: u32,
    address_of_names: u32,
    address_of_name_ordinals: u32,
}

#[allow(dead_code)]
#[repr(C)]
struct TlsDirectory {
    start_address_of_raw_data: usize,
    end_address_of_raw_data: usize,
    address_of_index: usize,
    address_of_callbacks: usize,
    size_of_zero_fill: u32,
    characteristics: u32,
}

type DllMainFn = unsafe extern "system" fn(usize, u32, *mut c_void) -> i32;
type TlsCallbackFn = unsafe extern "system" fn(usize, u32, *mut c_void);

/// A manually mapped DLL.
pub(crate) struct PeModule {
    mapping: ImageMapping,
    exports: HashMap<String, usize>,
    entry_point: usize,
}

unsafe impl Send for PeModule {}
unsafe impl Sync for PeModule {}

fn read_struct<T>(data: &[u8], offset: usize) -> Result<T> {
    if offset
        .checked_add(size_of::<T>())
        .map_or(true, |end| end > data.len())
    {
        return Err(malformed_error("PE structure out of bounds"));
    }
    Ok(unsafe { (data.as_ptr().add(offset) as *const T).read_unaligned() })
}

struct PeLayout {
    image_base: usize,
    size_of_image: usize,
    size_of_headers: usize,
    section_alignment: usize,
    entry_point_rva: usize,
    directories: [DataDirectory; 16],
    sections: Vec<SectionHeader>,
}

fn parse_headers(bytes: &[u8]) -> Result<PeLayout> {
    let dos: DosHeader = read_struct(bytes, 0).map_err(|_| Error::UnsupportedFormat)?;
    if dos.e_magic != DOS_SIGNATURE || dos.e_lfanew <= 0 {
        return Err(Error::UnsupportedFormat);
    }
    let nt_offset = dos.e_lfanew as usize;
    let signature: u32 = read_struct(bytes, nt_offset).map_err(|_| Error::UnsupportedFormat)?;
    if signature != NT_SIGNATURE {
        return Err(Error::UnsupportedFormat);
    }

    let file_header: FileHeader = read_struct(bytes, nt_offset + 4)?;
    if file_header.machine != HOST_MACHINE {
        return Err(foreign_platform_error(
            machine_name(file_header.machine),
            machine_name(HOST_MACHINE),
        ));
    }
    if file_header.characteristics & FILE_DLL == 0 {
        return Err(malformed_error("image is not a DLL"));
    }

    let optional_offset = nt_offset + 4 + size_of::<FileHeader>();
    if (file_header.size_of_optional_header as usize) < size_of::<OptionalHeader>() {
        return Err(malformed_error("optional header too short"));
    }
    let optional: OptionalHeader = read_struct(bytes, optional_offset)?;
    if optional.magic != OPTIONAL_MAGIC {
        return Err(malformed_error(format!(
            "optional header magic {:#x} does not match the host word size",
            optional.magic
        )));
    }
    if optional.size_of_image == 0 {
        return Err(malformed_error("SizeOfImage is zero"));
    }

    let sections_offset = optional_offset + file_header.size_of_optional_header as usize;
    let mut sections = Vec::with_capacity(file_header.number_of_sections as usize);
    for index in 0..file_header.number_of_sections as usize {
        let section: SectionHeader =
            read_struct(bytes, sections_offset + index * size_of::<SectionHeader>())?;
        sections.push(section);
    }

    Ok(PeLayout {
        image_base: optional.image_base as usize,
        size_of_image: optional.size_of_image as usize,
        size_of_headers: optional.size_of_headers as usize,
        section_alignment: (optional.section_alignment as usize).max(PAGE_SIZE),
        entry_point_rva: optional.address_of_entry_point as usize,
        directories: optional.data_directory,
        sections,
    })
}

fn machine_name(machine: u16) -> String {
    match machine {
        MACHINE_I386 => "IMAGE_FILE_MACHINE_I386".to_string(),
        MACHINE_AMD64 => "IMAGE_FILE_MACHINE_AMD64".to_string(),
        MACHINE_ARM64 => "IMAGE_FILE_MACHINE_ARM64".to_string(),
        other => format!("machine {other:#x}"),
    }
}

impl PeModule {
    pub(crate) fn load(bytes: &[u8]) -> Result<PeModule> {
        let layout = parse_headers(bytes)?;
        let mapping = map_image(bytes, &layout)?;
        let base = mapping.start();

        apply_relocations(&mapping, &layout)?;
        resolve_imports(&mapping, &layout)?;
        apply_protections(&mapping, &layout)?;
        run_tls_callbacks(&mapping, &layout);

        let entry_point = if layout.entry_point_rva != 0 {
            base + layout.entry_point_rva
        } else {
            0
        };
        if entry_point != 0 {
            let dll_main: DllMainFn = unsafe { core::mem::transmute(entry_point) };
            let ok = unsafe { dll_main(base, DLL_PROCESS_ATTACH, core::ptr::null_mut()) };
            if ok == 0 {
                return Err(dependency_error(
                    "DllMain",
                    "DLL_PROCESS_ATTACH returned FALSE",
                ));
            }
        }

        let exports = build_exports(&mapping, &layout);
        log::debug!(
            "loaded PE image: base=0x{base:x} size=0x{:x} exports={}",
            layout.size_of_image,
            exports.len()
        );
        Ok(PeModule {
            mapping,
            exports,
            entry_point,
        })
    }

    pub(crate) fn call_export(&self, name: &str) -> Result<()> {
        for candidate in loader::export_candidates(name) {
            if let Some(&addr) = self.exports.get(candidate.as_str()) {
                if addr != 0 {
                    log::debug!("invoking export {candidate:?} at 0x{addr:x}");
                    unsafe { os::call0(addr) };
                    return Ok(());
                }
            }
        }
        Err(export_not_found(name))
    }
}

impl Drop for PeModule {
    fn drop(&mut self) {
        if self.entry_point != 0 {
            let dll_main: DllMainFn = unsafe { core::mem::transmute(self.entry_point) };
            unsafe {
                dll_main(
                    self.mapping.start(),
                    DLL_PROCESS_DETACH,
                    core::ptr::null_mut(),
                );
            }
        }
    }
}

/// Reserve `SizeOfImage` (preferred base first, anywhere second), copy
/// the headers, and copy each section's raw data to its RVA. The tail of
/// every section is zero because the region starts zeroed.
fn map_image(bytes: &[u8], layout: &PeLayout) -> Result<ImageMapping> {
    let size = align_up(layout.size_of_image, layout.section_alignment);
    let prot = ProtFlags::PROT_READ | ProtFlags::PROT_WRITE;
    let memory = unsafe {
        MmapImpl::mmap_anonymous(Some(layout.image_base), size, prot, MapFlags::MAP_PRIVATE)
    }
    .or_else(|_| unsafe { MmapImpl::mmap_anonymous(None, size, prot, MapFlags::MAP_PRIVATE) })?;
    let mapping = ImageMapping::new(memory, 0, size, MmapImpl::munmap);
    let base = mapping.start();

    let header_len = layout.size_of_headers.min(bytes.len());
    unsafe {
        core::ptr::copy_nonoverlapping(bytes.as_ptr(), base as *mut u8, header_len);
    }

    for section in &layout.sections {
        if section.size_of_raw_data == 0 {
            continue;
        }
        let raw_offset = section.pointer_to_raw_data as usize;
        let raw_len = section.size_of_raw_data as usize;
        if raw_offset
            .checked_add(raw_len)
            .map_or(true, |end| end > bytes.len())
        {
            return Err(malformed_error(format!(
                "section raw data out of bounds: offset=0x{raw_offset:x} len=0x{raw_len:x}"
            )));
        }
        let rva = section.virtual_address as usize;
        let copy_len = raw_len.min(layout.size_of_image.saturating_sub(rva));
        if copy_len == 0 {
            continue;
        }
        unsafe {
            core::ptr::copy_nonoverlapping(
                bytes.as_ptr().add(raw_offset),
                (base + rva) as *mut u8,
                copy_len,
            );
        }
    }
    log::trace!(
        "mapped {} PE sections at 0x{base:x} (preferred 0x{:x})",
        layout.sections.len(),
        layout.image_base
    );
    Ok(mapping)
}

fn apply_relocations(mapping: &ImageMapping, layout: &PeLayout) -> Result<()> {
    let base = mapping.start();
    let delta = base.wrapping_sub(layout.image_base) as isize;
    if delta == 0 {
        return Ok(());
    }
    let directory = layout.directories[DIRECTORY_BASERELOC];
    if directory.virtual_address == 0 || directory.size == 0 {
        return Err(relocate_error(
            "image was rebased but carries no relocation directory",
        ));
    }

    let mut offset = directory.virtual_address as usize;
    let end = offset + directory.size as usize;
    while offset + size_of::<BaseRelocationBlock>() <= end {
        if !mapping.contains(base + offset, size_of::<BaseRelocationBlock>()) {
            return Err(relocate_error("base relocation block out of mapped image"));
        }
        let block = unsafe {
            ((base + offset) as *const BaseRelocationBlock).read_unaligned()
        };
        if block.size_of_block < size_of::<BaseRelocationBlock>() as u32
            || !mapping.contains(base + offset, block.size_of_block as usize)
        {
            return Err(relocate_error("malformed base relocation block"));
        }
        let entries =
            (block.size_of_block as usize - size_of::<BaseRelocationBlock>()) / size_of::<u16>();
        let entry_base = base + offset + size_of::<BaseRelocationBlock>();
        for index in 0..entries {
            let entry =
                unsafe { ((entry_base + index * size_of::<u16>()) as *const u16).read_unaligned() };
            let kind = entry >> 12;
            let rva = block.virtual_address as usize + (entry & 0x0fff) as usize;
            let place = base + rva;
            match kind {
                REL_BASED_ABSOLUTE => {}
                REL_BASED_HIGHLOW => {
                    if !mapping.contains(place, size_of::<u32>()) {
                        return Err(relocate_error(format!(
                            "relocation target 0x{rva:x} out of mapped image"
                        )));
                    }
                    unsafe {
                        let target = place as *mut u32;
                        target.write_unaligned(
                            target.read_unaligned().wrapping_add(delta as u32),
                        );
                    }
                }
                REL_BASED_DIR64 => {
                    if !mapping.contains(place, size_of::<u64>()) {
                        return Err(relocate_error(format!(
                            "relocation target 0x{rva:x} out of mapped image"
                        )));
                    }
                    unsafe {
                        let target = place as *mut u64;
                        target.write_unaligned(
                            target.read_unaligned().wrapping_add(delta as u64),
                        );
                    }
                }
                other => {
                    return Err(relocate_error(format!(
                        "unsupported base relocation type: {other}"
                    )));
                }
            }
        }
        offset += block.size_of_block as usize;
    }
    Ok(())
}

/// Read a NUL-terminated string out of the mapped image.
fn mapped_cstr(mapping: &ImageMapping, rva: usize) -> Option<String> {
    let base = mapping.start();
    let mut out = Vec::with_capacity(32);
    for index in 0..4096usize {
        let addr = base + rva + index;
        if !mapping.contains(addr, 1) {
            return None;
        }
        let byte = unsafe { *(addr as *const u8) };
        if byte == 0 {
            break;
        }
        out.push(byte);
    }
    String::from_utf8(out).ok()
}

fn resolve_imports(mapping: &ImageMapping, layout: &PeLayout) -> Result<()> {
    let directory = layout.directories[DIRECTORY_IMPORT];
    if directory.virtual_address == 0 || directory.size == 0 {
        return Ok(());
    }
    let base = mapping.start();
    let resident = peb::runtime_modules();

    let mut offset = directory.virtual_address as usize;
    loop {
        if !mapping.contains(base + offset, size_of::<ImportDescriptor>()) {
            return Err(malformed_error("import directory out of mapped image"));
        }
        let descriptor =
            unsafe { ((base + offset) as *const ImportDescriptor).read_unaligned() };
        if descriptor.name == 0 {
            break;
        }
        let dll_name = mapped_cstr(mapping, descriptor.name as usize)
            .ok_or_else(|| malformed_error("import descriptor name out of bounds"))?;

        let module = match peb::module_by_name(&resident, &dll_name) {
            Some(module) => module,
            None => {
                let cname = CString::new(dll_name.as_str())
                    .map_err(|_| malformed_error("import name contains NUL"))?;
                let handle = unsafe { LoadLibraryA(cname.as_ptr() as *const u8) };
                if handle.is_null() {
                    return Err(dependency_error(&dll_name, "LoadLibraryA failed"));
                }
                handle as usize
            }
        };

        let lookup_rva = if descriptor.original_first_thunk != 0 {
            descriptor.original_first_thunk as usize
        } else {
            descriptor.first_thunk as usize
        };
        let bound_rva = descriptor.first_thunk as usize;

        let mut index = 0usize;
        loop {
            let lookup_slot = base + lookup_rva + index * size_of::<usize>();
            let bound_slot = base + bound_rva + index * size_of::<usize>();
            if !mapping.contains(lookup_slot, size_of::<usize>())
                || !mapping.contains(bound_slot, size_of::<usize>())
            {
                return Err(malformed_error("import thunk table out of mapped image"));
            }
            let lookup = unsafe { (lookup_slot as *const usize).read_unaligned() };
            if lookup == 0 {
                break;
            }
            let address = if lookup & ORDINAL_FLAG != 0 {
                let ordinal = (lookup & 0xffff) as *const u8;
                unsafe { GetProcAddress(module as _, ordinal) }
                    .map(|function| function as usize)
                    .ok_or_else(|| {
                        unresolved_symbol_error(format!(
                            "{dll_name}!ordinal#{}",
                            lookup & 0xffff
                        ))
                    })?
            } else {
                // IMAGE_IMPORT_BY_NAME: u16 hint then the name.
                let Some(symbol) = mapped_cstr(mapping, lookup + 2) else {
                    return Err(malformed_error("import thunk name out of bounds"));
                };
                let cname = CString::new(symbol.as_str())
                    .map_err(|_| malformed_error("import name contains NUL"))?;
                unsafe { GetProcAddress(module as _, cname.as_ptr() as *const u8) }
                    .map(|function| function as usize)
                    .ok_or_else(|| unresolved_symbol_error(format!("{dll_name}!{symbol}")))?
            };
            unsafe {
                (bound_slot as *mut usize).write_unaligned(address);
            }
            index += 1;
        }

        offset += size_of::<ImportDescriptor>();
    }
    Ok(())
}

fn section_prot(characteristics: u32) -> ProtFlags {
    let mut prot = ProtFlags::PROT_NONE;
    if characteristics & SCN_MEM_READ != 0 {
        prot |= ProtFlags::PROT_READ;
    }
    if characteristics & SCN_MEM_WRITE != 0 {
        prot |= ProtFlags::PROT_WRITE;
    }
    if characteristics & SCN_MEM_EXECUTE != 0 {
        prot |= ProtFlags::PROT_EXEC;
    }
    prot
}

fn apply_protections(mapping: &ImageMapping, layout: &PeLayout) -> Result<()> {
    let base = mapping.start();
    for section in &layout.sections {
        let rva = section.virtual_address as usize;
        let size = (section.virtual_size as usize).max(section.size_of_raw_data as usize);
        if size == 0 || rva >= mapping.len() {
            continue;
        }
        let len = align_up(size, layout.section_alignment).min(mapping.len() - rva);
        let prot = section_prot(section.characteristics);
        unsafe {
            MmapImpl::mprotect(
                NonNull::new((base + rva) as *mut c_void).expect("section base is never null"),
                len,
                prot,
            )?;
        }
        log::trace!("VirtualProtect 0x{:x} len=0x{len:x} prot={prot:?}", base + rva);
    }
    Ok(())
}

fn run_tls_callbacks(mapping: &ImageMapping, layout: &PeLayout) {
    let directory = layout.directories[DIRECTORY_TLS];
    if directory.virtual_address == 0 || directory.size == 0 {
        return;
    }
    let base = mapping.start();
    let tls = unsafe {
        ((base + directory.virtual_address as usize) as *const TlsDirectory).read_unaligned()
    };
    // AddressOfCallbacks is a VA, already adjusted by the relocation pass.
    let mut slot = tls.address_of_callbacks;
    if slot == 0 {
        return;
    }
    loop {
        if !mapping.contains(slot, size_of::<usize>()) {
            return;
        }
        let callback = unsafe { (slot as *const usize).read_unaligned() };
        if callback == 0 {
            return;
        }
        let callback: TlsCallbackFn = unsafe { core::mem::transmute(callback) };
        unsafe { callback(base, DLL_PROCESS_ATTACH, core::ptr::null_mut()) };
        slot += size_of::<usize>();
    }
}

/// Walk the export directory into a name → mapped-address table.
/// Forwarder entries (whose address lands inside the directory itself)
/// are skipped.
fn build_exports(mapping: &ImageMapping, layout: &PeLayout) -> HashMap<String, usize> {
    let mut exports = HashMap::new();
    let directory = layout.directories[DIRECTORY_EXPORT];
    if directory.virtual_address == 0 || directory.size == 0 {
        return exports;
    }
    let base = mapping.start();
    if !mapping.contains(
        base + directory.virtual_address as usize,
        size_of::<ExportDirectory>(),
    ) {
        return exports;
    }
    let table = unsafe {
        ((base + directory.virtual_address as usize) as *const ExportDirectory).read_unaligned()
    };
    let directory_start = directory.virtual_address as usize;
    let directory_end = directory_start + directory.size as usize;

    let names_ok = mapping.contains(
        base + table.address_of_names as usize,
        table.number_of_names as usize * size_of::<u32>(),
    );
    let ordinals_ok = mapping.contains(
        base + table.address_of_name_ordinals as usize,
        table.number_of_names as usize * size_of::<u16>(),
    );
    let functions_ok = mapping.contains(
        base + table.address_of_functions as usize,
        table.number_of_functions as usize * size_of::<u32>(),
    );
    if !names_ok || !ordinals_ok || !functions_ok {
        return exports;
    }

    for index in 0..table.number_of_names as usize {
        let name_rva = unsafe {
            ((base + table.address_of_names as usize + index * size_of::<u32>()) as *const u32)
                .read_unaligned()
        } as usize;
        let Some(name) = mapped_cstr(mapping, name_rva) else {
            continue;
        };
        let ordinal = unsafe {
            ((base + table.address_of_name_ordinals as usize + index * size_of::<u16>())
                as *const u16)
                .read_unaligned()
        } as usize;
        if ordinal >= table.number_of_functions as usize {
            continue;
        }
        let function_rva = unsafe {
            ((base + table.address_of_functions as usize + ordinal * size_of::<u32>())
                as *const u32)
                .read_unaligned()
        } as usize;
        if function_rva == 0 || (function_rva >= directory_start && function_rva < directory_end) {
            continue;
        }
        exports.entry(name).or_insert(base + function_rva);
    }
    exports
}

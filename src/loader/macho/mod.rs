//! Mach-O (dylib/bundle) backend: rather than re-implementing dyld, map
//! the image ourselves and hand it to the live dyld4 runtime to link,
//! fix up and initialize, then call the export out of the image's own
//! symbol table.

mod dyld;

use crate::mmap::{align_down, align_up, ImageMapping, MapFlags, Mmap, ProtFlags, PAGE_SIZE};
use crate::{
    ap32, export_not_found, foreign_platform_error, malformed_error, map_error, relocate_error,
    Error, Result,
};
use core::ffi::c_void;
use core::mem::size_of;
use core::ptr::NonNull;
use dyld::{
    DyldCacheHeader, LoadCommand, MachHeader64, SegmentCommand64, SharedFileMapping,
    WritableDyldState, LC_SEGMENT_64,
};
use std::ffi::CString;

const MH_MAGIC_64: u32 = 0xfeed_facf;
const MH_DYLIB: u32 = 0x6;
const MH_BUNDLE: u32 = 0x8;

const FAT_MAGIC: u32 = 0xcafe_babe;
const FAT_MAGIC_64: u32 = 0xcafe_babf;

const CPU_TYPE_X86_64: i32 = 0x0100_0007;
const CPU_TYPE_ARM64: i32 = 0x0100_000c;

#[cfg(target_arch = "x86_64")]
const HOST_CPU: i32 = CPU_TYPE_X86_64;
#[cfg(target_arch = "aarch64")]
const HOST_CPU: i32 = CPU_TYPE_ARM64;

const DYLD_PATH: &str = "/usr/lib/dyld";
const LIBDYLD_PATH: &str = "/usr/lib/system/libdyld.dylib";

const DYLD_SCRATCH_SIZE: usize = 0x4000;

/// A validated Mach-O image. The load work itself is deferred to
/// invocation: dyld keeps cyclic references into everything it loads, so
/// the image only enters the runtime when an export is actually called.
pub(crate) struct MachoModule {
    image: Vec<u8>,
}

unsafe impl Send for MachoModule {}
unsafe impl Sync for MachoModule {}

impl MachoModule {
    pub(crate) fn load(bytes: &[u8]) -> Result<MachoModule> {
        let slice = current_arch_slice_checked(bytes)?;
        validate_thin(slice)?;
        Ok(MachoModule {
            image: slice.to_vec(),
        })
    }

    pub(crate) fn call_export(&self, name: &str) -> Result<()> {
        // Mach-O exports carry the C-symbol underscore.
        let symbol = if name.starts_with('_') {
            name.to_string()
        } else {
            format!("_{name}")
        };
        run_loader(&self.image, &symbol)
    }
}

impl Drop for MachoModule {
    fn drop(&mut self) {
        // Zero the retained copy; payload bytes should not outlive the
        // handle in readable memory.
        self.image.fill(0);
    }
}

/// Pick the current-architecture slice out of a fat or thin image.
pub(super) fn current_arch_slice(data: &[u8]) -> Option<&[u8]> {
    current_arch_slice_checked(data).ok()
}

fn current_arch_slice_checked(data: &[u8]) -> Result<&[u8]> {
    if data.len() < 8 {
        return Err(Error::UnsupportedFormat);
    }
    let be_magic = u32::from_be_bytes(data[0..4].try_into().unwrap());
    if be_magic != FAT_MAGIC && be_magic != FAT_MAGIC_64 {
        return Ok(data);
    }

    let wide = be_magic == FAT_MAGIC_64;
    let nfat = u32::from_be_bytes(data[4..8].try_into().unwrap()) as usize;
    let entry_size = if wide { 32 } else { 20 };
    for index in 0..nfat {
        let at = 8 + index * entry_size;
        if at + entry_size > data.len() {
            return Err(malformed_error("fat Mach-O arch table out of bounds"));
        }
        let cputype = i32::from_be_bytes(data[at..at + 4].try_into().unwrap());
        if cputype != HOST_CPU {
            continue;
        }
        let (offset, size) = if wide {
            (
                u64::from_be_bytes(data[at + 8..at + 16].try_into().unwrap()) as usize,
                u64::from_be_bytes(data[at + 16..at + 24].try_into().unwrap()) as usize,
            )
        } else {
            (
                u32::from_be_bytes(data[at + 8..at + 12].try_into().unwrap()) as usize,
                u32::from_be_bytes(data[at + 12..at + 16].try_into().unwrap()) as usize,
            )
        };
        if size == 0 || offset.checked_add(size).map_or(true, |end| end > data.len()) {
            return Err(malformed_error("invalid fat Mach-O slice bounds"));
        }
        return Ok(&data[offset..offset + size]);
    }
    Err(foreign_platform_error(
        "no matching fat slice",
        cpu_name(HOST_CPU),
    ))
}

fn validate_thin(data: &[u8]) -> Result<()> {
    if data.len() < size_of::<MachHeader64>() {
        return Err(Error::UnsupportedFormat);
    }
    let magic = u32::from_le_bytes(data[0..4].try_into().unwrap());
    if magic != MH_MAGIC_64 {
        return Err(Error::UnsupportedFormat);
    }
    let cputype = i32::from_le_bytes(data[4..8].try_into().unwrap());
    if cputype != HOST_CPU {
        return Err(foreign_platform_error(cpu_name(cputype), cpu_name(HOST_CPU)));
    }
    let filetype = u32::from_le_bytes(data[12..16].try_into().unwrap());
    if filetype != MH_DYLIB && filetype != MH_BUNDLE {
        return Err(malformed_error(format!(
            "unsupported Mach-O file type: {filetype:#x}"
        )));
    }
    Ok(())
}

fn cpu_name(cputype: i32) -> String {
    match cputype {
        CPU_TYPE_X86_64 => "x86_64".to_string(),
        CPU_TYPE_ARM64 => "arm64".to_string(),
        other => format!("cputype {other:#x}"),
    }
}

/// The dyld entry points the sequence needs, discovered by mangled name.
struct DyldEntryPoints {
    jit_loader_make: usize,
    load_dependents: usize,
    apply_fixups: usize,
    inc_dl_ref_count: usize,
    run_initializers: usize,
    diagnostics_ctor: usize,
    diagnostics_clear_error: usize,
    diagnostics_has_error: usize,
    diagnostics_error_message: usize,
    memory_manager: usize,
    lock_lock: usize,
    lock_unlock: usize,
    write_protect: usize,
}

fn resolve_entry_points(dyld: usize, libdyld: usize, slide: u64) -> Result<DyldEntryPoints> {
    let in_dyld = |symbols: &[&str]| unsafe {
        dyld::find_first_available_symbol(dyld, slide, DYLD_PATH, symbols)
    };
    let in_dyld_matching = |required: &[&str]| unsafe {
        dyld::find_first_matching_symbol(dyld, slide, DYLD_PATH, required)
    };
    let in_either = |symbols: &[&str], required: &[&str]| unsafe {
        let mut addr = dyld::find_first_available_symbol(dyld, slide, DYLD_PATH, symbols);
        if addr == 0 {
            addr = dyld::find_first_available_symbol(libdyld, slide, "", symbols);
        }
        if addr == 0 {
            addr = dyld::find_first_matching_symbol(dyld, slide, DYLD_PATH, required);
        }
        if addr == 0 {
            addr = dyld::find_first_matching_symbol(libdyld, slide, "", required);
        }
        addr
    };

    let jit_loader_make = in_dyld(&[
        "__ZN5dyld416JustInTimeLoader4makeERNS_12RuntimeStateEPKN5dyld39MachOFileEPKcRKNS_6FileIDEybbbtPKN6mach_o6LayoutE",
    ]);
    let mut load_dependents = in_dyld(&[
        "__ZN5dyld46Loader14loadDependentsER11DiagnosticsRNS_12RuntimeStateERKNS0_11LoadOptionsE",
        "__ZN5dyld416JustInTimeLoader14loadDependentsER11DiagnosticsRNS_12RuntimeStateERKNS_6Loader11LoadOptionsE",
        "__ZN5dyld414PrebuiltLoader14loadDependentsER11DiagnosticsRNS_12RuntimeStateERKNS_6Loader11LoadOptionsE",
    ]);
    if load_dependents == 0 {
        load_dependents =
            in_dyld_matching(&["Loader14loadDependentsER11DiagnosticsRNS_12RuntimeStateE"]);
    }
    let mut apply_fixups = in_dyld(&[
        "__ZNK5dyld46Loader11applyFixupsER11DiagnosticsRNS_12RuntimeStateERNS_34DyldCacheDataConstLazyScopedWriterEbPN3lsl6VectorINSt3__14pairIPKS0_PKcEEEE",
        "__ZNK5dyld416JustInTimeLoader11applyFixupsER11DiagnosticsRNS_12RuntimeStateERNS_34DyldCacheDataConstLazyScopedWriterEbPN3lsl6VectorINSt3__14pairIPKNS_6LoaderEPKcEEEE",
        "__ZNK5dyld414PrebuiltLoader11applyFixupsER11DiagnosticsRNS_12RuntimeStateERNS_34DyldCacheDataConstLazyScopedWriterEbPN3lsl6VectorINSt3__14pairIPKNS_6LoaderEPKcEEEE",
    ]);
    if apply_fixups == 0 {
        apply_fixups =
            in_dyld_matching(&["Loader11applyFixupsER11DiagnosticsRNS_12RuntimeStateE"]);
    }
    let mut inc_dl_ref_count =
        in_dyld(&["__ZN5dyld412RuntimeState13incDlRefCountEPKNS_6LoaderE"]);
    if inc_dl_ref_count == 0 {
        inc_dl_ref_count = in_dyld_matching(&["RuntimeState13incDlRefCount"]);
    }
    let mut run_initializers = in_dyld(&[
        "__ZNK5dyld46Loader38runInitializersBottomUpPlusUpwardLinksERNS_12RuntimeStateE",
        "__ZNK5dyld46Loader15runInitializersERNS_12RuntimeStateE",
        "__ZNK5dyld416JustInTimeLoader15runInitializersERNS_12RuntimeStateE",
        "__ZNK5dyld414PrebuiltLoader15runInitializersERNS_12RuntimeStateE",
    ]);
    if run_initializers == 0 {
        run_initializers = in_dyld_matching(&["runInitializers", "RuntimeState"]);
    }

    let diagnostics_ctor = in_either(
        &["__ZN11DiagnosticsC1Ev", "__ZN11DiagnosticsC2Ev"],
        &["DiagnosticsC", "Ev"],
    );
    let diagnostics_clear_error = in_either(
        &["__ZN11Diagnostics10clearErrorEv"],
        &["Diagnostics10clearErrorEv"],
    );
    let diagnostics_has_error = in_either(
        &["__ZNK11Diagnostics8hasErrorEv"],
        &["Diagnostics8hasErrorEv"],
    );
    let diagnostics_error_message = in_either(
        &["__ZNK11Diagnostics12errorMessageEv"],
        &["Diagnostics12errorMessageEv"],
    );

    let mut missing = Vec::new();
    if jit_loader_make == 0 {
        missing.push("JustInTimeLoader::make".to_string());
    }
    if load_dependents == 0 {
        missing.push("Loader::loadDependents".to_string());
    }
    if apply_fixups == 0 {
        missing.push("Loader::applyFixups".to_string());
    }
    if inc_dl_ref_count == 0 {
        missing.push("RuntimeState::incDlRefCount".to_string());
    }
    if run_initializers == 0 {
        missing.push("Loader::runInitializers".to_string());
    }
    if diagnostics_clear_error == 0 {
        missing.push("Diagnostics::clearError".to_string());
    }
    if diagnostics_has_error == 0 {
        missing.push("Diagnostics::hasError".to_string());
    }
    if !missing.is_empty() {
        return Err(Error::MissingDyldSymbols { list: missing });
    }

    Ok(DyldEntryPoints {
        jit_loader_make,
        load_dependents,
        apply_fixups,
        inc_dl_ref_count,
        run_initializers,
        diagnostics_ctor,
        diagnostics_clear_error,
        diagnostics_has_error,
        diagnostics_error_message,
        memory_manager: in_dyld(&["__ZN3lsl13MemoryManager13memoryManagerEv"]),
        lock_lock: in_dyld(&["__ZN3lsl4Lock4lockEv"]),
        lock_unlock: in_dyld(&["__ZN3lsl4Lock6unlockEv"]),
        write_protect: in_dyld(&["__ZN3lsl13MemoryManager12writeProtectEb"]),
    })
}

// These mirror dyld4's own layouts and are only ever handed across the
// FFI boundary, so several fields are write-only on our side.
#[allow(dead_code)]
#[repr(C)]
struct FileId {
    inode: u64,
    mod_time: u64,
    is_valid: bool,
    _pad: [u8; 7],
}

#[allow(dead_code)]
#[repr(C)]
struct LoadChain {
    previous: usize,
    image: usize,
}

#[allow(dead_code)]
#[repr(C)]
struct LoadOptions {
    launching: bool,
    static_linkage: bool,
    can_be_missing: bool,
    rtld_local: bool,
    rtld_no_delete: bool,
    rtld_no_load: bool,
    inserted_dylib: bool,
    can_be_dylib: bool,
    can_be_bundle: bool,
    can_be_executable: bool,
    force_unloadable: bool,
    use_fall_back_paths: bool,
    _pad: [u8; 4],
    rpath_stack: usize,
    finder: usize,
    path_not_found_handler: usize,
}

#[allow(dead_code)]
#[repr(C)]
struct LoadedVector {
    allocator: usize,
    elements: usize,
    size: usize,
    capacity: usize,
}

#[allow(dead_code)]
#[repr(C)]
struct DataConstLazyScopedWriter {
    state: usize,
    was_made_writable: bool,
    _pad: [u8; 7],
}

struct Diagnostics {
    address: usize,
    clear_error: usize,
    has_error: usize,
    error_message: usize,
}

impl Diagnostics {
    fn clear(&self) {
        unsafe { dyld::call1(self.clear_error, self.address) };
    }

    fn error(&self) -> Option<String> {
        if unsafe { dyld::call1(self.has_error, self.address) } == 0 {
            return None;
        }
        if self.error_message == 0 {
            return Some(String::new());
        }
        let message = unsafe { dyld::call1(self.error_message, self.address) };
        if message == 0 {
            return Some(String::new());
        }
        let text = unsafe { dyld::cstr_at(message) };
        Some(text.trim().to_string())
    }
}

fn with_detail(base: &str, detail: Option<String>) -> String {
    match detail {
        Some(detail) if !detail.is_empty() => format!("{base}: {detail}"),
        _ => base.to_string(),
    }
}

/// Map the image, register it with the running dyld, and jump to the
/// named export.
fn run_loader(image: &[u8], symbol: &str) -> Result<()> {
    let cache_base =
        dyld::shared_region_start().ok_or(Error::DyldApisUnavailable)?;
    let header = unsafe { &*(cache_base as *const DyldCacheHeader) };
    let mapping_info = unsafe {
        &*((cache_base + header.mapping_offset as usize) as *const SharedFileMapping)
    };
    let (images_offset, images_count) = dyld::cache_image_table(header);
    if images_offset == 0 || images_count == 0 {
        return Err(Error::DyldApisUnavailable);
    }
    let slide = cache_base as u64 - mapping_info.address;

    let libdyld = unsafe { dyld::find_cache_image(cache_base, LIBDYLD_PATH, slide) };
    let dyld_image = unsafe { dyld::find_cache_image(cache_base, DYLD_PATH, slide) };
    if libdyld == 0 || dyld_image == 0 {
        return Err(Error::DyldApisUnavailable);
    }

    let apis = unsafe { dyld::runtime_apis(libdyld, slide) };
    if apis == 0 {
        return Err(Error::DyldApisUnavailable);
    }

    let unpacked = ap32::maybe_unpack(image)?;
    let buffer: &[u8] = unpacked.as_deref().unwrap_or(image);

    let entry_points = resolve_entry_points(dyld_image as usize, libdyld as usize, slide)?;

    let (mapping, load_address) = map_macho_image(buffer)?;

    let scratch = unsafe {
        crate::os::MmapImpl::mmap_anonymous(
            None,
            DYLD_SCRATCH_SIZE,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_PRIVATE,
        )
    }
    .map_err(|err| map_error(format!("dyld scratch space: {err}")))?;
    let mut cursor = scratch.as_ptr() as usize;

    let top_loader_slot = cursor as *mut usize;
    cursor += size_of::<usize>();

    let fileid = cursor as *mut FileId;
    cursor += size_of::<FileId>();
    unsafe {
        (*fileid).inode = 0;
        (*fileid).mod_time = 0;
        (*fileid).is_valid = false;
    }

    let diag = Diagnostics {
        address: cursor,
        clear_error: entry_points.diagnostics_clear_error,
        has_error: entry_points.diagnostics_has_error,
        error_message: entry_points.diagnostics_error_message,
    };
    cursor += 0x1000;
    if entry_points.diagnostics_ctor != 0 {
        unsafe { dyld::call1(entry_points.diagnostics_ctor, diag.address) };
    }

    let chain_main = cursor as *mut LoadChain;
    cursor += size_of::<LoadChain>();
    let chain_caller = cursor as *mut LoadChain;
    cursor += size_of::<LoadChain>();
    let chain_current = cursor as *mut LoadChain;
    cursor += size_of::<LoadChain>();
    let options = cursor as *mut LoadOptions;

    let loaded = (apis + 32) as *const LoadedVector;
    let start_loader_count = unsafe { (*loaded).size };

    let loader_name = CString::new(format!(
        "reflektor-{:x}-{:x}",
        buffer.as_ptr() as usize,
        buffer.len()
    ))
    .expect("loader name contains no NUL");

    // Hold dyld's writable state for the whole registration sequence; the
    // guard restores write protection on every exit path.
    let _writable = WritableDyldState::enter(
        entry_points.memory_manager,
        entry_points.lock_lock,
        entry_points.write_protect,
        entry_points.lock_unlock,
    );

    diag.clear();
    unsafe { *top_loader_slot = 0 };

    let top_loader = unsafe {
        dyld::call10(
            entry_points.jit_loader_make,
            apis,
            load_address,
            loader_name.as_ptr() as usize,
            fileid as usize,
            0,
            0,
            1,
            0,
            0,
            0,
        )
    };
    if let Some(detail) = diag.error() {
        let base = if entry_points.diagnostics_ctor == 0 {
            "dyld could not create a loader for the image (Diagnostics::ctor unresolved)"
        } else {
            "dyld could not create a loader for the image"
        };
        return Err(malformed_error(with_detail(base, Some(detail))));
    }
    if top_loader == 0 {
        return Err(malformed_error(
            "dyld returned a null loader for the image",
        ));
    }
    unsafe { *top_loader_slot = top_loader };

    // lateLeaveMapped, so dyld does not tear the image down under us.
    unsafe {
        let flags = (top_loader + 16) as *mut u64;
        *flags |= 1 << 21;
    }

    unsafe {
        (*chain_main).previous = 0;
        (*chain_main).image = *((apis + 24) as *const usize);
        (*chain_caller).previous = chain_main as usize;
        (*chain_caller).image = if (*loaded).elements != 0 {
            *((*loaded).elements as *const usize)
        } else {
            0
        };
        (*chain_current).previous = chain_caller as usize;
        (*chain_current).image = top_loader;

        core::ptr::write_bytes(options as *mut u8, 0, size_of::<LoadOptions>());
        (*options).static_linkage = false;
        (*options).rtld_local = false;
        (*options).rtld_no_delete = true;
        (*options).can_be_dylib = true;
        (*options).use_fall_back_paths = true;
        (*options).rpath_stack = chain_current as usize;
    }

    diag.clear();
    unsafe {
        dyld::call4(
            entry_points.load_dependents,
            top_loader,
            diag.address,
            apis,
            options as usize,
        )
    };
    if let Some(detail) = diag.error() {
        return Err(Error::DependencyLoadFailure {
            name: loader_name.to_string_lossy().into_owned(),
            detail: with_detail("dyld could not load dependents", Some(detail)),
        });
    }

    let new_loaders = unsafe { (*loaded).size } - start_loader_count;
    if new_loaders != 0 {
        let mut writer = DataConstLazyScopedWriter {
            state: apis,
            was_made_writable: false,
            _pad: [0; 7],
        };
        for index in 0..new_loaders {
            let loader = unsafe {
                *(((*loaded).elements + (start_loader_count + index) * size_of::<usize>())
                    as *const usize)
            };
            unsafe {
                dyld::call6(
                    entry_points.apply_fixups,
                    loader,
                    diag.address,
                    apis,
                    &mut writer as *mut _ as usize,
                    1,
                    0,
                )
            };
        }
        if let Some(detail) = diag.error() {
            return Err(relocate_error(with_detail(
                "dyld could not apply fixups",
                Some(detail),
            )));
        }
    }

    unsafe {
        dyld::call2(entry_points.inc_dl_ref_count, apis, top_loader);
        dyld::call2(entry_points.run_initializers, top_loader, apis);
    }

    let text = find_mapped_text_segment(load_address)
        .ok_or_else(|| malformed_error("loaded image has no __TEXT segment"))?;
    if load_address < text.vmaddr as usize {
        return Err(map_error("invalid loaded image slide"));
    }
    let image_slide = load_address - text.vmaddr as usize;
    let entry = unsafe { dyld::find_symbol(load_address, symbol, image_slide as u64) };
    if entry == 0 {
        return Err(export_not_found(symbol));
    }

    log::debug!("invoking Mach-O export {symbol:?} at 0x{entry:x}");
    unsafe { dyld::call0(entry) };

    // Initializer state now lives inside dyld's graph; the mapping and
    // the scratch structures it references stay resident.
    mapping.leak();
    Ok(())
}

fn find_mapped_text_segment(load_address: usize) -> Option<&'static SegmentCommand64> {
    let header = unsafe { &*(load_address as *const MachHeader64) };
    let mut lc = load_address + size_of::<MachHeader64>();
    for _ in 0..header.ncmds {
        let cmd = unsafe { &*(lc as *const LoadCommand) };
        if cmd.cmd == LC_SEGMENT_64 {
            let seg = unsafe { &*(lc as *const SegmentCommand64) };
            if &seg.segname[..7] == b"__TEXT\0" {
                return Some(seg);
            }
        }
        lc += cmd.cmdsize as usize;
    }
    None
}

#[derive(Clone, Copy)]
struct MachoSegment {
    vmaddr: usize,
    vmsize: usize,
    fileoff: usize,
    filesize: usize,
    initprot: u32,
}

/// Same layout algorithm as the ELF mapper, applied to `LC_SEGMENT_64`
/// entries. The address handed to dyld is `base + text.vmaddr -
/// text.fileoff` so the Mach-O header lands where dyld expects it.
fn map_macho_image(data: &[u8]) -> Result<(ImageMapping, usize)> {
    let header_size = size_of::<MachHeader64>();
    if data.len() < header_size {
        return Err(malformed_error("Mach-O image too short"));
    }
    let ncmds = u32::from_le_bytes(data[16..20].try_into().unwrap());

    let mut segments = Vec::new();
    let mut text: Option<MachoSegment> = None;
    let mut min_vm = usize::MAX;
    let mut max_vm = 0usize;

    let mut lc = header_size;
    for _ in 0..ncmds {
        if lc + size_of::<LoadCommand>() > data.len() {
            return Err(malformed_error("Mach-O load commands out of bounds"));
        }
        let cmd = u32::from_le_bytes(data[lc..lc + 4].try_into().unwrap());
        let cmdsize = u32::from_le_bytes(data[lc + 4..lc + 8].try_into().unwrap()) as usize;
        if cmdsize == 0 || lc + cmdsize > data.len() {
            return Err(malformed_error("Mach-O load command size out of bounds"));
        }
        if cmd == LC_SEGMENT_64 {
            if cmdsize < size_of::<SegmentCommand64>() {
                return Err(malformed_error("truncated LC_SEGMENT_64 command"));
            }
            let seg = unsafe {
                (data.as_ptr().add(lc) as *const SegmentCommand64).read_unaligned()
            };
            let parsed = MachoSegment {
                vmaddr: seg.vmaddr as usize,
                vmsize: seg.vmsize as usize,
                fileoff: seg.fileoff as usize,
                filesize: seg.filesize as usize,
                initprot: seg.initprot,
            };
            let is_text = &seg.segname[..7] == b"__TEXT\0";
            if parsed.vmsize != 0 {
                min_vm = min_vm.min(parsed.vmaddr);
                let end = parsed
                    .vmaddr
                    .checked_add(parsed.vmsize)
                    .ok_or_else(|| malformed_error("Mach-O segment range overflows"))?;
                max_vm = max_vm.max(end);
            }
            if is_text {
                text = Some(parsed);
            }
            segments.push(parsed);
        }
        lc += cmdsize;
    }

    let text = text.ok_or_else(|| malformed_error("Mach-O image has no __TEXT segment"))?;
    if segments.is_empty() || min_vm == usize::MAX || max_vm <= min_vm {
        return Err(malformed_error("Mach-O image has no loadable segments"));
    }

    let span = max_vm - min_vm;
    let memory = unsafe {
        crate::os::MmapImpl::mmap_anonymous(
            None,
            span,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_PRIVATE,
        )
    }?;
    let mapping = ImageMapping::new(memory, min_vm, span, <crate::os::MmapImpl as Mmap>::munmap);
    let bias = mapping.load_bias();

    for seg in &segments {
        if seg.filesize == 0 {
            continue;
        }
        if seg.fileoff.checked_add(seg.filesize).map_or(true, |end| end > data.len()) {
            return Err(malformed_error(format!(
                "segment file range out of bounds: fileoff=0x{:x} filesize=0x{:x}",
                seg.fileoff, seg.filesize
            )));
        }
        unsafe {
            core::ptr::copy_nonoverlapping(
                data.as_ptr().add(seg.fileoff),
                bias.wrapping_add(seg.vmaddr) as *mut u8,
                seg.filesize,
            );
        }
    }

    for seg in &segments {
        if seg.vmsize == 0 {
            continue;
        }
        let start = align_down(bias.wrapping_add(seg.vmaddr), PAGE_SIZE);
        let end = align_up(bias.wrapping_add(seg.vmaddr) + seg.vmsize, PAGE_SIZE);
        if end <= start {
            continue;
        }
        let prot = vm_prot(seg.initprot);
        unsafe {
            <crate::os::MmapImpl as Mmap>::mprotect(
                NonNull::new(start as *mut c_void).expect("segment start is never null"),
                end - start,
                prot,
            )?;
        }
        log::trace!("mprotect 0x{start:x} len=0x{:x} prot={prot:?}", end - start);
    }

    let load_address = bias
        .wrapping_add(text.vmaddr)
        .wrapping_sub(text.fileoff);
    if load_address < mapping.start() || load_address >= mapping.start() + mapping.len() {
        return Err(malformed_error("invalid Mach-O __TEXT placement"));
    }
    Ok((mapping, load_address))
}

fn vm_prot(initprot: u32) -> ProtFlags {
    // VM_PROT_{READ,WRITE,EXECUTE} share the PROT_* bit values.
    ProtFlags::from_bits_truncate(initprot & 0b111)
}

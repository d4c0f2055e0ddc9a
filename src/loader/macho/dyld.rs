//! Walking the live dyld shared cache and the dyld4 runtime structures.
//!
//! Everything here mirrors structures dyld lays out in memory; none of it
//! is covered by a public SDK contract, which is why symbol discovery
//! works from priority lists of mangled names with a contains-all
//! fallback and an on-disk `/usr/lib/dyld` symbol-table fallback.

use core::mem::size_of;

/// `shared_region_check_np`
const SYS_SHARED_REGION_CHECK_NP: i64 = 294;

pub(super) const LC_SEGMENT_64: u32 = 0x19;
pub(super) const LC_SYMTAB: u32 = 0x2;

// The structs below mirror dyld's own layouts; unused fields exist to
// keep the offsets honest.
#[allow(dead_code)]
#[repr(C)]
pub(super) struct DyldCacheHeader {
    pub magic: [u8; 16],
    pub mapping_offset: u32,
    pub mapping_count: u32,
    pub images_offset_old: u32,
    pub images_count_old: u32,
    pub dyld_base_address: u64,
    pub code_signature_offset: u64,
    pub code_signature_size: u64,
    pub slide_info_offset_unused: u64,
    pub slide_info_size_unused: u64,
    pub local_symbols_offset: u64,
    pub local_symbols_size: u64,
    pub uuid: [u8; 16],
    pub cache_type: u64,
    pub branch_pools_offset: u32,
    pub branch_pools_count: u32,
    pub accelerate_info_addr: u64,
    pub accelerate_info_size: u64,
    pub images_text_offset: u64,
    pub images_text_count: u64,
    pub patch_info_addr: u64,
    pub patch_info_size: u64,
    pub other_image_group_addr_unused: u64,
    pub other_image_group_size_unused: u64,
    pub prog_closures_addr: u64,
    pub prog_closures_size: u64,
    pub prog_closures_trie_addr: u64,
    pub prog_closures_trie_size: u64,
    pub platform: u32,
    pub format_version_and_flags: u32,
    pub shared_region_start: u64,
    pub shared_region_size: u64,
    pub max_slide: u64,
    pub dylibs_image_array_addr: u64,
    pub dylibs_image_array_size: u64,
    pub dylibs_trie_addr: u64,
    pub dylibs_trie_size: u64,
    pub other_image_array_addr: u64,
    pub other_image_array_size: u64,
    pub other_trie_addr: u64,
    pub other_trie_size: u64,
    pub mapping_with_slide_offset: u32,
    pub mapping_with_slide_count: u32,
    pub dylibs_pbl_state_array_addr_unused: u64,
    pub dylibs_pbl_set_addr: u64,
    pub programs_pbl_set_pool_addr: u64,
    pub programs_pbl_set_pool_size: u64,
    pub program_trie_addr: u64,
    pub program_trie_size: u32,
    pub os_version: u32,
    pub alt_platform: u32,
    pub alt_os_version: u32,
    pub swift_opts_offset: u64,
    pub swift_opts_size: u64,
    pub sub_cache_array_offset: u32,
    pub sub_cache_array_count: u32,
    pub symbol_file_uuid: [u8; 16],
    pub rosetta_read_only_addr: u64,
    pub rosetta_read_only_size: u64,
    pub rosetta_read_write_addr: u64,
    pub rosetta_read_write_size: u64,
    pub images_offset: u32,
    pub images_count: u32,
}

#[allow(dead_code)]
#[repr(C)]
pub(super) struct DyldCacheImageInfo {
    pub address: u64,
    pub mod_time: u64,
    pub inode: u64,
    pub path_file_offset: u32,
    pub pad: u32,
}

#[allow(dead_code)]
#[repr(C)]
pub(super) struct SharedFileMapping {
    pub address: u64,
    pub size: u64,
    pub file_offset: u64,
    pub max_prot: u32,
    pub init_prot: u32,
}

#[allow(dead_code)]
#[repr(C)]
pub(super) struct MachHeader64 {
    pub magic: u32,
    pub cputype: i32,
    pub cpusubtype: i32,
    pub filetype: u32,
    pub ncmds: u32,
    pub sizeofcmds: u32,
    pub flags: u32,
    pub reserved: u32,
}

#[repr(C)]
pub(super) struct LoadCommand {
    pub cmd: u32,
    pub cmdsize: u32,
}

#[allow(dead_code)]
#[repr(C)]
pub(super) struct SegmentCommand64 {
    pub cmd: u32,
    pub cmdsize: u32,
    pub segname: [u8; 16],
    pub vmaddr: u64,
    pub vmsize: u64,
    pub fileoff: u64,
    pub filesize: u64,
    pub maxprot: u32,
    pub initprot: u32,
    pub nsects: u32,
    pub flags: u32,
}

#[allow(dead_code)]
#[repr(C)]
pub(super) struct Section64 {
    pub sectname: [u8; 16],
    pub segname: [u8; 16],
    pub addr: u64,
    pub size: u64,
    pub offset: u32,
    pub align: u32,
    pub reloff: u32,
    pub nreloc: u32,
    pub flags: u32,
    pub reserved1: u32,
    pub reserved2: u32,
    pub reserved3: u32,
}

#[allow(dead_code)]
#[repr(C)]
pub(super) struct SymtabCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    pub symoff: u32,
    pub nsyms: u32,
    pub stroff: u32,
    pub strsize: u32,
}

#[allow(dead_code)]
#[repr(C)]
pub(super) struct Nlist64 {
    pub strx: u32,
    pub ntype: u8,
    pub sect: u8,
    pub desc: u16,
    pub value: u64,
}

/// Ask the kernel where the dyld shared cache begins.
pub(super) fn shared_region_start() -> Option<usize> {
    let mut address: usize = 0;
    let rc = unsafe { libc::syscall(SYS_SHARED_REGION_CHECK_NP as i32, &mut address) };
    if rc != 0 || address == 0 {
        return None;
    }
    Some(address)
}

fn fixed_cstr(buf: &[u8]) -> &[u8] {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    &buf[..end]
}

/// # Safety
/// `ptr` must point at a NUL-terminated string readable by this process.
unsafe fn cstr_equal(ptr: usize, want: &str) -> bool {
    if ptr == 0 {
        return false;
    }
    let want = want.as_bytes();
    for (index, &expected) in want.iter().enumerate() {
        if unsafe { *((ptr + index) as *const u8) } != expected {
            return false;
        }
    }
    unsafe { *((ptr + want.len()) as *const u8) == 0 }
}

/// # Safety
/// `ptr` must point at a NUL-terminated string readable by this process.
pub(super) unsafe fn cstr_at(ptr: usize) -> String {
    let mut out = Vec::with_capacity(64);
    if ptr == 0 {
        return String::new();
    }
    for index in 0..4096usize {
        let byte = unsafe { *((ptr + index) as *const u8) };
        if byte == 0 {
            break;
        }
        out.push(byte);
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Find a cache image by install path and return its slid load address.
///
/// # Safety
/// `cache_base` must be the live shared-cache base for this process.
pub(super) unsafe fn find_cache_image(cache_base: usize, want_path: &str, slide: u64) -> u64 {
    let header = unsafe { &*(cache_base as *const DyldCacheHeader) };
    let (images_offset, images_count) = cache_image_table(header);
    if images_offset == 0 || images_count == 0 {
        return 0;
    }
    let table = cache_base + images_offset as usize;
    for index in 0..images_count as usize {
        let info =
            unsafe { &*((table + index * size_of::<DyldCacheImageInfo>()) as *const DyldCacheImageInfo) };
        let path = cache_base + info.path_file_offset as usize;
        if unsafe { cstr_equal(path, want_path) } {
            return info.address + slide;
        }
    }
    0
}

/// The image-info table moved in newer cache formats; prefer the legacy
/// fields when they are populated.
pub(super) fn cache_image_table(header: &DyldCacheHeader) -> (u32, u32) {
    let mut count = header.images_count_old;
    let mut offset = header.images_offset_old;
    if count == 0 {
        count = header.images_count;
    }
    if offset == 0 {
        offset = header.images_offset;
    }
    (offset, count)
}

/// # Safety
/// `base` must be the slid address of a mapped Mach-O header.
unsafe fn find_section(base: u64, want_seg: &str, want_sect: &str, slide: u64) -> usize {
    let header = unsafe { &*(base as usize as *const MachHeader64) };
    let mut lc = base as usize + size_of::<MachHeader64>();
    for _ in 0..header.ncmds {
        let cmd = unsafe { &*(lc as *const LoadCommand) };
        if cmd.cmd == LC_SEGMENT_64 {
            let seg = unsafe { &*(lc as *const SegmentCommand64) };
            if want_seg.is_empty() || fixed_cstr(&seg.segname) == want_seg.as_bytes() {
                let mut sect = lc + size_of::<SegmentCommand64>();
                for _ in 0..seg.nsects {
                    let section = unsafe { &*(sect as *const Section64) };
                    if fixed_cstr(&section.sectname) == want_sect.as_bytes() {
                        return (section.addr + slide) as usize;
                    }
                    sect += size_of::<Section64>();
                }
            }
        }
        lc += cmd.cmdsize as usize;
    }
    0
}

/// Locate libdyld's `__dyld_apis` section and read the live RuntimeState
/// APIs pointer out of it. Searched segments, legacy layouts first.
///
/// # Safety
/// `libdyld` must be the slid address of the mapped libdyld image.
pub(super) unsafe fn runtime_apis(libdyld: u64, slide: u64) -> usize {
    const CANDIDATES: [&str; 4] = ["__TPRO_CONST", "__DATA_CONST", "__AUTH_CONST", "__DATA"];
    for segment in CANDIDATES {
        let section = unsafe { find_section(libdyld, segment, "__dyld_apis", slide) };
        let apis = unsafe { apis_from_section(section) };
        if apis != 0 {
            return apis;
        }
    }
    let section = unsafe { find_section(libdyld, "", "__dyld_apis", slide) };
    unsafe { apis_from_section(section) }
}

/// # Safety
/// `section` is either 0 or the address of the `__dyld_apis` section.
unsafe fn apis_from_section(section: usize) -> usize {
    if section == 0 {
        return 0;
    }
    let apis = unsafe { *(section as *const usize) };
    if apis != 0 {
        return apis;
    }
    // Some layouts put the APIs struct at the section base itself;
    // sanity-check the loaded-vector pointers at the known offsets.
    let image_ptr = unsafe { *((section + 24) as *const usize) };
    let vector_ptr = unsafe { *((section + 32) as *const usize) };
    if image_ptr != 0 || vector_ptr != 0 {
        return section;
    }
    0
}

struct SymtabView {
    symtab: *const SymtabCommand,
    strtab: usize,
    nlists: usize,
}

/// # Safety
/// `base` must be the slid address of a mapped Mach-O header whose
/// `__LINKEDIT` is mapped alongside it (true for cache images and for
/// images this loader maps itself).
unsafe fn symtab_view(base: usize) -> Option<SymtabView> {
    let header = unsafe { &*(base as *const MachHeader64) };
    let mut lc = base + size_of::<MachHeader64>();
    let mut symtab: *const SymtabCommand = core::ptr::null();
    let mut linkedit: *const SegmentCommand64 = core::ptr::null();
    let mut text: *const SegmentCommand64 = core::ptr::null();
    for _ in 0..header.ncmds {
        let cmd = unsafe { &*(lc as *const LoadCommand) };
        match cmd.cmd {
            LC_SYMTAB => symtab = lc as *const SymtabCommand,
            LC_SEGMENT_64 => {
                let seg = lc as *const SegmentCommand64;
                let name = fixed_cstr(unsafe { &(*seg).segname });
                if name == b"__LINKEDIT" {
                    linkedit = seg;
                } else if name == b"__TEXT" {
                    text = seg;
                }
            }
            _ => {}
        }
        lc += cmd.cmdsize as usize;
    }
    if symtab.is_null() || linkedit.is_null() || text.is_null() {
        return None;
    }
    let (symtab_ref, linkedit, text) = unsafe { (&*symtab, &*linkedit, &*text) };
    let file_slide =
        linkedit.vmaddr as i64 - text.vmaddr as i64 - linkedit.fileoff as i64;
    Some(SymtabView {
        symtab,
        strtab: (base as i64 + file_slide + symtab_ref.stroff as i64) as usize,
        nlists: (base as i64 + file_slide + symtab_ref.symoff as i64) as usize,
    })
}

/// Exact-name symbol lookup in a mapped image's own symbol table.
///
/// # Safety
/// See [`symtab_view`].
pub(super) unsafe fn find_symbol(base: usize, symbol: &str, slide: u64) -> usize {
    let Some(view) = (unsafe { symtab_view(base) }) else {
        return 0;
    };
    let nsyms = unsafe { (*view.symtab).nsyms };
    for index in 0..nsyms as usize {
        let nlist = unsafe { &*((view.nlists + index * size_of::<Nlist64>()) as *const Nlist64) };
        if nlist.strx == 0 || nlist.value == 0 {
            continue;
        }
        if unsafe { cstr_equal(view.strtab + nlist.strx as usize, symbol) } {
            return (nlist.value + slide) as usize;
        }
    }
    0
}

/// Shortest usable symbol whose name contains every required substring.
///
/// # Safety
/// See [`symtab_view`].
unsafe fn find_symbol_by_contains(base: usize, slide: u64, required: &[&str]) -> usize {
    let Some(view) = (unsafe { symtab_view(base) }) else {
        return 0;
    };
    let nsyms = unsafe { (*view.symtab).nsyms };
    let mut best_len = usize::MAX;
    let mut best_addr = 0usize;
    for index in 0..nsyms as usize {
        let nlist = unsafe { &*((view.nlists + index * size_of::<Nlist64>()) as *const Nlist64) };
        if nlist.strx == 0 || nlist.value == 0 {
            continue;
        }
        let name = unsafe { cstr_at(view.strtab + nlist.strx as usize) };
        if !usable_candidate(&name) || !contains_all(&name, required) {
            continue;
        }
        if name.len() < best_len {
            best_len = name.len();
            best_addr = (nlist.value + slide) as usize;
        }
    }
    best_addr
}

fn usable_candidate(name: &str) -> bool {
    !name.is_empty() && !name.contains("block_invoke") && !name.contains(".cold")
}

fn contains_all(name: &str, required: &[&str]) -> bool {
    required
        .iter()
        .all(|needle| needle.is_empty() || name.contains(needle))
}

/// Try each mangled name in priority order against the mapped image,
/// then against the image's on-disk symbol table.
///
/// # Safety
/// See [`symtab_view`].
pub(super) unsafe fn find_first_available_symbol(
    base: usize,
    slide: u64,
    disk_path: &str,
    symbols: &[&str],
) -> usize {
    for symbol in symbols {
        if symbol.is_empty() {
            continue;
        }
        let addr = unsafe { find_symbol(base, symbol, slide) };
        if addr != 0 {
            return addr;
        }
    }
    if disk_path.is_empty() {
        return 0;
    }
    for symbol in symbols {
        if symbol.is_empty() {
            continue;
        }
        let addr = find_symbol_in_file(disk_path, symbol, slide);
        if addr != 0 {
            return addr;
        }
    }
    0
}

/// Contains-all fallback over the mapped image and its on-disk table.
///
/// # Safety
/// See [`symtab_view`].
pub(super) unsafe fn find_first_matching_symbol(
    base: usize,
    slide: u64,
    disk_path: &str,
    required: &[&str],
) -> usize {
    if required.is_empty() {
        return 0;
    }
    let addr = unsafe { find_symbol_by_contains(base, slide, required) };
    if addr != 0 {
        return addr;
    }
    if disk_path.is_empty() {
        return 0;
    }
    find_symbol_in_file_by_contains(disk_path, slide, required)
}

fn read_struct<T>(data: &[u8], offset: usize) -> Option<T> {
    if offset.checked_add(size_of::<T>())? > data.len() {
        return None;
    }
    Some(unsafe { (data.as_ptr().add(offset) as *const T).read_unaligned() })
}

/// Iterate the on-disk symbol table of the current-arch slice of the
/// Mach-O at `path`, calling `visit` with each (name, value).
fn visit_file_symbols(path: &str, mut visit: impl FnMut(&str, u64)) {
    let Ok(data) = std::fs::read(path) else {
        return;
    };
    let Some(slice) = super::current_arch_slice(&data) else {
        return;
    };
    let Some(header) = read_struct::<MachHeader64>(slice, 0) else {
        return;
    };
    let mut lc = size_of::<MachHeader64>();
    for _ in 0..header.ncmds {
        let Some(cmd) = read_struct::<LoadCommand>(slice, lc) else {
            return;
        };
        if cmd.cmd == LC_SYMTAB {
            let Some(symtab) = read_struct::<SymtabCommand>(slice, lc) else {
                return;
            };
            for index in 0..symtab.nsyms as usize {
                let Some(nlist) =
                    read_struct::<Nlist64>(slice, symtab.symoff as usize + index * size_of::<Nlist64>())
                else {
                    return;
                };
                if nlist.strx == 0 || nlist.value == 0 {
                    continue;
                }
                let name_offset = symtab.stroff as usize + nlist.strx as usize;
                if name_offset >= slice.len() {
                    continue;
                }
                let name = fixed_cstr(&slice[name_offset..]);
                if let Ok(name) = core::str::from_utf8(name) {
                    visit(name, nlist.value);
                }
            }
            return;
        }
        if cmd.cmdsize == 0 {
            return;
        }
        lc += cmd.cmdsize as usize;
    }
}

fn find_symbol_in_file(path: &str, symbol: &str, slide: u64) -> usize {
    let mut found = 0usize;
    visit_file_symbols(path, |name, value| {
        if found == 0 && name == symbol {
            found = (value + slide) as usize;
        }
    });
    found
}

fn find_symbol_in_file_by_contains(path: &str, slide: u64, required: &[&str]) -> usize {
    let mut best_len = usize::MAX;
    let mut best_addr = 0usize;
    visit_file_symbols(path, |name, value| {
        if usable_candidate(name) && contains_all(name, required) && name.len() < best_len {
            best_len = name.len();
            best_addr = (value + slide) as usize;
        }
    });
    best_addr
}

pub(super) unsafe fn call0(function: usize) -> usize {
    unsafe { call10(function, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0) }
}

pub(super) unsafe fn call1(function: usize, a0: usize) -> usize {
    unsafe { call10(function, a0, 0, 0, 0, 0, 0, 0, 0, 0, 0) }
}

pub(super) unsafe fn call2(function: usize, a0: usize, a1: usize) -> usize {
    unsafe { call10(function, a0, a1, 0, 0, 0, 0, 0, 0, 0, 0) }
}

pub(super) unsafe fn call4(function: usize, a0: usize, a1: usize, a2: usize, a3: usize) -> usize {
    unsafe { call10(function, a0, a1, a2, a3, 0, 0, 0, 0, 0, 0) }
}

pub(super) unsafe fn call6(
    function: usize,
    a0: usize,
    a1: usize,
    a2: usize,
    a3: usize,
    a4: usize,
    a5: usize,
) -> usize {
    unsafe { call10(function, a0, a1, a2, a3, a4, a5, 0, 0, 0, 0) }
}

#[allow(clippy::too_many_arguments)]
pub(super) unsafe fn call10(
    function: usize,
    a0: usize,
    a1: usize,
    a2: usize,
    a3: usize,
    a4: usize,
    a5: usize,
    a6: usize,
    a7: usize,
    a8: usize,
    a9: usize,
) -> usize {
    type Fn10 = unsafe extern "C" fn(
        usize,
        usize,
        usize,
        usize,
        usize,
        usize,
        usize,
        usize,
        usize,
        usize,
    ) -> usize;
    let function: Fn10 = unsafe { core::mem::transmute(function) };
    unsafe { function(a0, a1, a2, a3, a4, a5, a6, a7, a8, a9) }
}

/// Scoped entry into dyld's writable state, taken under the memory
/// manager's lock. Dropping the guard leaves the writable state again,
/// so every exit path of the load sequence restores write protection.
pub(super) struct WritableDyldState {
    memory_manager: usize,
    lock: usize,
    write_protect: usize,
    unlock: usize,
}

impl WritableDyldState {
    pub(super) fn enter(
        memory_manager_fn: usize,
        lock: usize,
        write_protect: usize,
        unlock: usize,
    ) -> Option<WritableDyldState> {
        if memory_manager_fn == 0 || lock == 0 || write_protect == 0 || unlock == 0 {
            return None;
        }
        let memory_manager = unsafe { call0(memory_manager_fn) };
        if memory_manager == 0 {
            return None;
        }
        unsafe {
            call1(lock, memory_manager);
            let counter = (memory_manager + 0x18) as *mut u64;
            let mut current = *counter;
            if current == 0 {
                call2(write_protect, memory_manager, 0);
                current = *counter;
            }
            *counter = current + 1;
            call1(unlock, memory_manager);
        }
        Some(WritableDyldState {
            memory_manager,
            lock,
            write_protect,
            unlock,
        })
    }
}

impl Drop for WritableDyldState {
    fn drop(&mut self) {
        unsafe {
            call1(self.lock, self.memory_manager);
            let counter = (self.memory_manager + 0x18) as *mut u64;
            let current = *counter;
            if current != 0 {
                *counter = current - 1;
                if current - 1 == 0 {
                    call2(self.write_protect, self.memory_manager, 1);
                }
            }
            call1(self.unlock, self.memory_manager);
        }
    }
}


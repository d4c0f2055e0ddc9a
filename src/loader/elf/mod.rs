//! ELF (`ET_DYN`) in-memory loader backend.
//!
//! The image is laid out in one anonymous mapping, its dynamic relocations
//! are applied against libraries already resident in the process, page
//! protections are locked down from the program-header flags, and the
//! global/weak FUNC/NOTYPE symbols become the exported-symbol table.

pub(crate) mod dynapi;
pub(crate) mod maps;
pub(crate) mod resolver;

use crate::mmap::{align_down, align_up, ImageMapping, MapFlags, Mmap, ProtFlags, PAGE_SIZE};
use crate::os::{self, MmapImpl};
use crate::{
    arch, export_not_found, foreign_platform_error, loader, malformed_error, map_error,
    relocate_error, Error, Result,
};
use core::ffi::c_void;
use core::mem::size_of;
use core::ptr::NonNull;
use elf::abi::{
    DT_NEEDED, ET_CORE, ET_DYN, ET_EXEC, ET_REL, PF_R, PF_W, PF_X, PT_LOAD, SHN_UNDEF, SHT_REL,
    SHT_RELA, STB_GLOBAL, STB_WEAK, STT_FUNC, STT_NOTYPE,
};
use elf::endian::AnyEndian;
use elf::file::Class;
use elf::string_table::StringTable;
use elf::symbol::SymbolTable;
use elf::ElfBytes;
use resolver::SymbolResolver;
use std::collections::HashMap;

#[cfg(target_pointer_width = "64")]
const HOST_CLASS: Class = Class::ELF64;
#[cfg(target_pointer_width = "32")]
const HOST_CLASS: Class = Class::ELF32;

/// Relocation tables are walked in this fixed order; the `.sec` spellings
/// appear in CET-enabled toolchains.
const RELOCATION_SECTIONS: [&str; 6] = [
    ".rela.dyn",
    ".rela.plt",
    ".rela.plt.sec",
    ".rel.dyn",
    ".rel.plt",
    ".rel.plt.sec",
];

/// A loaded and relocated ELF image.
pub(crate) struct ElfModule {
    mapping: ImageMapping,
    exports: HashMap<String, usize>,
}

// The mapping is exclusively owned and the export table is immutable
// after load, so shared access from multiple threads is fine.
unsafe impl Send for ElfModule {}
unsafe impl Sync for ElfModule {}

impl ElfModule {
    pub(crate) fn load(bytes: &[u8]) -> Result<ElfModule> {
        let file =
            ElfBytes::<AnyEndian>::minimal_parse(bytes).map_err(|_| Error::UnsupportedFormat)?;
        validate(&file)?;

        let loads = collect_load_segments(&file, bytes.len())?;
        let mapping = map_image(bytes, &loads)?;

        let needed = needed_libraries(&file);
        let mut resolver = SymbolResolver::new(&needed);
        apply_relocations(&file, &mapping, &mut resolver)?;
        apply_protections(&mapping, &loads)?;

        let exports = build_exports(&file, mapping.load_bias());
        log::debug!(
            "loaded ELF image: bias=0x{:x} len=0x{:x} exports={}",
            mapping.load_bias(),
            mapping.len(),
            exports.len()
        );
        Ok(ElfModule { mapping, exports })
    }

    pub(crate) fn call_export(&self, name: &str) -> Result<()> {
        for candidate in loader::export_candidates(name) {
            if let Some(&addr) = self.exports.get(candidate.as_str()) {
                // Invocation targets stay inside the image mapping.
                if addr != 0 && self.mapping.contains(addr, 1) {
                    log::debug!("invoking export {candidate:?} at 0x{addr:x}");
                    unsafe { os::call0(addr) };
                    return Ok(());
                }
            }
        }
        Err(export_not_found(name))
    }
}

fn validate(file: &ElfBytes<AnyEndian>) -> Result<()> {
    let ehdr = &file.ehdr;
    if ehdr.e_machine != arch::EM_ARCH {
        return Err(foreign_platform_error(
            machine_name(ehdr.e_machine),
            machine_name(arch::EM_ARCH),
        ));
    }
    if ehdr.e_type != ET_DYN {
        return Err(malformed_error(format!(
            "unsupported ELF file type: {}",
            file_type_name(ehdr.e_type)
        )));
    }
    if !matches!(ehdr.endianness, AnyEndian::Little) {
        return Err(malformed_error("unsupported ELF endianness (big-endian)"));
    }
    if ehdr.class != HOST_CLASS {
        return Err(malformed_error("ELF class does not match the host"));
    }
    Ok(())
}

fn machine_name(machine: u16) -> String {
    match machine {
        elf::abi::EM_386 => "EM_386".to_string(),
        elf::abi::EM_X86_64 => "EM_X86_64".to_string(),
        elf::abi::EM_AARCH64 => "EM_AARCH64".to_string(),
        other => format!("EM_{other}"),
    }
}

fn file_type_name(e_type: u16) -> String {
    match e_type {
        ET_REL => "ET_REL".to_string(),
        ET_EXEC => "ET_EXEC".to_string(),
        ET_DYN => "ET_DYN".to_string(),
        ET_CORE => "ET_CORE".to_string(),
        other => format!("{other:#x}"),
    }
}

/// A `PT_LOAD` program header, reduced to what the mapper needs.
struct LoadSegment {
    vaddr: usize,
    memsz: usize,
    offset: usize,
    filesz: usize,
    flags: u32,
}

fn collect_load_segments(file: &ElfBytes<AnyEndian>, input_len: usize) -> Result<Vec<LoadSegment>> {
    let segments = file
        .segments()
        .ok_or_else(|| malformed_error("ELF image has no program headers"))?;

    let mut loads = Vec::new();
    for phdr in segments.iter() {
        if phdr.p_type != PT_LOAD || phdr.p_memsz == 0 {
            continue;
        }
        let vaddr = phdr.p_vaddr as usize;
        let memsz = phdr.p_memsz as usize;
        let offset = phdr.p_offset as usize;
        let filesz = phdr.p_filesz as usize;

        let end = vaddr.checked_add(memsz).ok_or_else(|| {
            malformed_error(format!(
                "PT_LOAD range overflows: vaddr=0x{vaddr:x} memsz=0x{memsz:x}"
            ))
        })?;
        end.checked_add(PAGE_SIZE - 1).ok_or_else(|| {
            malformed_error(format!(
                "PT_LOAD range overflows: vaddr=0x{vaddr:x} memsz=0x{memsz:x}"
            ))
        })?;
        if filesz > memsz {
            return Err(malformed_error(format!(
                "PT_LOAD filesz 0x{filesz:x} exceeds memsz 0x{memsz:x}"
            )));
        }
        if offset.checked_add(filesz).is_none() || offset + filesz > input_len {
            return Err(malformed_error(format!(
                "segment file range out of bounds: offset=0x{offset:x} filesz=0x{filesz:x}"
            )));
        }
        loads.push(LoadSegment {
            vaddr,
            memsz,
            offset,
            filesz,
            flags: phdr.p_flags,
        });
    }
    if loads.is_empty() {
        return Err(malformed_error("ELF image has no loadable segments"));
    }
    Ok(loads)
}

/// Reserve one read-write anonymous region spanning the page-aligned
/// `[min_vaddr, max_vaddr)` and copy each segment's file bytes into it.
/// Bytes past `filesz` stay zero by virtue of the anonymous mapping.
fn map_image(bytes: &[u8], loads: &[LoadSegment]) -> Result<ImageMapping> {
    let min_vaddr = loads
        .iter()
        .map(|seg| align_down(seg.vaddr, PAGE_SIZE))
        .min()
        .unwrap();
    let max_vaddr = loads
        .iter()
        .map(|seg| align_up(seg.vaddr + seg.memsz, PAGE_SIZE))
        .max()
        .unwrap();
    if max_vaddr <= min_vaddr {
        return Err(malformed_error("ELF image maps an empty address range"));
    }
    let len = max_vaddr - min_vaddr;

    let memory = unsafe {
        MmapImpl::mmap_anonymous(
            None,
            len,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_PRIVATE,
        )
    }?;
    let mapping = ImageMapping::new(memory, min_vaddr, len, MmapImpl::munmap);
    let bias = mapping.load_bias();

    for seg in loads.iter().filter(|seg| seg.filesz > 0) {
        let dst = bias.wrapping_add(seg.vaddr) as *mut u8;
        unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr().add(seg.offset), dst, seg.filesz);
        }
    }
    log::trace!(
        "mapped {} PT_LOAD segments: base=0x{:x} bias=0x{:x} len=0x{len:x}",
        loads.len(),
        mapping.start(),
        bias,
    );
    Ok(mapping)
}

fn apply_relocations(
    file: &ElfBytes<AnyEndian>,
    mapping: &ImageMapping,
    resolver: &mut SymbolResolver,
) -> Result<()> {
    let dynsyms = file
        .dynamic_symbol_table()
        .map_err(|err| malformed_error(format!("bad dynamic symbol table: {err}")))?;

    for section in RELOCATION_SECTIONS {
        let shdr = file
            .section_header_by_name(section)
            .map_err(|err| malformed_error(format!("bad section headers: {err}")))?;
        let Some(shdr) = shdr else {
            continue;
        };
        match shdr.sh_type {
            SHT_RELA => {
                let relas = file.section_data_as_relas(&shdr).map_err(|err| {
                    malformed_error(format!("bad relocation section {section}: {err}"))
                })?;
                for (index, rela) in relas.enumerate() {
                    apply_one(
                        mapping,
                        dynsyms.as_ref(),
                        resolver,
                        section,
                        index,
                        rela.r_offset,
                        rela.r_sym,
                        rela.r_type,
                        Some(rela.r_addend),
                    )?;
                }
            }
            SHT_REL => {
                let rels = file.section_data_as_rels(&shdr).map_err(|err| {
                    malformed_error(format!("bad relocation section {section}: {err}"))
                })?;
                for (index, rel) in rels.enumerate() {
                    apply_one(
                        mapping,
                        dynsyms.as_ref(),
                        resolver,
                        section,
                        index,
                        rel.r_offset,
                        rel.r_sym,
                        rel.r_type,
                        None,
                    )?;
                }
            }
            other => {
                return Err(malformed_error(format!(
                    "unsupported relocation section type {other} in {section}"
                )));
            }
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn apply_one(
    mapping: &ImageMapping,
    dynsyms: Option<&(SymbolTable<'_, AnyEndian>, StringTable<'_>)>,
    resolver: &mut SymbolResolver,
    section: &str,
    index: usize,
    r_offset: u64,
    r_sym: u32,
    r_type: u32,
    addend: Option<i64>,
) -> Result<()> {
    let place = mapping.load_bias().wrapping_add(r_offset as usize);
    if !mapping.contains(place, size_of::<usize>()) {
        return Err(relocate_error(format!(
            "{section}[{index}]: relocation target 0x{r_offset:x} out of mapped image"
        )));
    }
    let addend = addend.unwrap_or_else(|| unsafe { arch::read_implicit_addend(place) });
    let sym_value = resolve_symbol_value(mapping, dynsyms, resolver, section, index, r_sym)?;
    unsafe { arch::apply_relocation(r_type, place, mapping.load_bias(), sym_value, addend) }
}

fn resolve_symbol_value(
    mapping: &ImageMapping,
    dynsyms: Option<&(SymbolTable<'_, AnyEndian>, StringTable<'_>)>,
    resolver: &mut SymbolResolver,
    section: &str,
    index: usize,
    r_sym: u32,
) -> Result<usize> {
    if r_sym == 0 {
        return Ok(0);
    }
    let (symtab, strtab) = dynsyms.ok_or_else(|| {
        relocate_error(format!(
            "{section}[{index}]: relocation references a symbol but the image has no dynamic symbol table"
        ))
    })?;
    let sym = symtab.get(r_sym as usize).map_err(|_| {
        relocate_error(format!(
            "{section}[{index}]: relocation references invalid symbol index {r_sym}"
        ))
    })?;
    // Undefined weak symbols are optional and resolve to 0 by ELF rules.
    if sym.st_shndx == SHN_UNDEF && sym.st_bind() == STB_WEAK {
        return Ok(0);
    }
    if sym.st_shndx != SHN_UNDEF && sym.st_value != 0 {
        return Ok(mapping.load_bias().wrapping_add(sym.st_value as usize));
    }
    let name = strtab.get(sym.st_name as usize).map_err(|_| {
        relocate_error(format!(
            "{section}[{index}]: bad name for symbol index {r_sym}"
        ))
    })?;
    if name.is_empty() {
        return Err(relocate_error(format!(
            "{section}[{index}]: relocation symbol index {r_sym} is undefined and unnamed"
        )));
    }
    resolver.resolve(name)
}

fn apply_protections(mapping: &ImageMapping, loads: &[LoadSegment]) -> Result<()> {
    for seg in loads {
        let start = align_down(seg.vaddr, PAGE_SIZE);
        let end = align_up(seg.vaddr + seg.memsz, PAGE_SIZE);
        let addr = mapping.load_bias().wrapping_add(start);
        let len = end - start;
        if !mapping.contains(addr, len) {
            return Err(map_error(format!(
                "segment protection range out of mapped image: vaddr=0x{:x} len=0x{len:x}",
                seg.vaddr
            )));
        }
        let prot = segment_prot(seg.flags);
        unsafe {
            MmapImpl::mprotect(NonNull::new_unchecked(addr as *mut c_void), len, prot)?;
        }
        log::trace!("mprotect 0x{addr:x} len=0x{len:x} prot={prot:?}");
    }
    Ok(())
}

fn segment_prot(flags: u32) -> ProtFlags {
    let mut prot = ProtFlags::PROT_NONE;
    if flags & PF_R != 0 {
        prot |= ProtFlags::PROT_READ;
    }
    if flags & PF_W != 0 {
        prot |= ProtFlags::PROT_WRITE;
    }
    if flags & PF_X != 0 {
        prot |= ProtFlags::PROT_EXEC;
    }
    prot
}

fn needed_libraries(file: &ElfBytes<AnyEndian>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let strtab = match file.dynamic_symbol_table() {
        Ok(Some((_, strtab))) => strtab,
        _ => return out,
    };
    let dynamic = match file.dynamic() {
        Ok(Some(dynamic)) => dynamic,
        _ => return out,
    };
    for entry in dynamic.iter() {
        if entry.d_tag != DT_NEEDED {
            continue;
        }
        let Ok(name) = strtab.get(entry.d_val() as usize) else {
            continue;
        };
        let name = name.trim();
        if !name.is_empty() && !out.iter().any(|existing| existing == name) {
            out.push(name.to_string());
        }
    }
    out
}

/// Union of the dynamic and static symbol tables, dynamic first so its
/// addresses win on duplicate names.
fn build_exports(file: &ElfBytes<AnyEndian>, bias: usize) -> HashMap<String, usize> {
    let mut exports = HashMap::new();
    if let Ok(Some((symtab, strtab))) = file.dynamic_symbol_table() {
        collect_symbols(&mut exports, &symtab, &strtab, bias);
    }
    if let Ok(Some((symtab, strtab))) = file.symbol_table() {
        collect_symbols(&mut exports, &symtab, &strtab, bias);
    }
    exports
}

fn collect_symbols(
    exports: &mut HashMap<String, usize>,
    symtab: &SymbolTable<'_, AnyEndian>,
    strtab: &StringTable<'_>,
    bias: usize,
) {
    for sym in symtab.iter() {
        if sym.st_value == 0 || sym.st_shndx == SHN_UNDEF {
            continue;
        }
        let bind = sym.st_bind();
        if bind != STB_GLOBAL && bind != STB_WEAK {
            continue;
        }
        let kind = sym.st_symtype();
        if kind != STT_FUNC && kind != STT_NOTYPE {
            continue;
        }
        let Ok(name) = strtab.get(sym.st_name as usize) else {
            continue;
        };
        if name.is_empty() {
            continue;
        }
        let addr = bias.wrapping_add(sym.st_value as usize);
        if !exports.contains_key(name) {
            exports.insert(name.to_string(), addr);
        }
        // A versioned name@VERSION also answers to its base name.
        if let Some(at) = name.find('@') {
            if at > 0 && !exports.contains_key(&name[..at]) {
                exports.insert(name[..at].to_string(), addr);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn machine_names() {
        assert_eq!(machine_name(elf::abi::EM_X86_64), "EM_X86_64");
        assert_eq!(machine_name(elf::abi::EM_AARCH64), "EM_AARCH64");
        assert_eq!(machine_name(9999), "EM_9999");
    }

    #[test]
    fn segment_prot_from_flags() {
        assert_eq!(segment_prot(PF_R), ProtFlags::PROT_READ);
        assert_eq!(
            segment_prot(PF_R | PF_X),
            ProtFlags::PROT_READ | ProtFlags::PROT_EXEC
        );
        assert_eq!(
            segment_prot(PF_R | PF_W),
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE
        );
        assert_eq!(segment_prot(0), ProtFlags::PROT_NONE);
    }
}

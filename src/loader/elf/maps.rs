//! Runtime-module introspection via `/proc/self/maps`.
//!
//! Produces `{path, load_base}` pairs for executable file-backed mappings,
//! ordered so that libc-like modules are searched first.

use crate::Result;
use elf::endian::AnyEndian;
use elf::string_table::StringTable;
use elf::symbol::SymbolTable;
use elf::ElfBytes;
use std::collections::HashMap;
use std::path::Path;

/// An executable module already mapped into the process.
pub(crate) struct RuntimeModule {
    pub(crate) path: String,
    pub(crate) base: usize,
    pub(crate) score: i32,
}

struct MapsEntry {
    start: usize,
    offset: usize,
    path: String,
}

pub(crate) fn runtime_modules() -> Result<Vec<RuntimeModule>> {
    let raw = std::fs::read_to_string("/proc/self/maps")?;
    Ok(modules_from_maps(&raw))
}

fn modules_from_maps(raw: &str) -> Vec<RuntimeModule> {
    let mut base_by_path: HashMap<String, usize> = HashMap::new();
    for entry in parse_maps(raw) {
        if entry.start < entry.offset {
            continue;
        }
        let base = entry.start - entry.offset;
        base_by_path
            .entry(entry.path)
            .and_modify(|current| *current = (*current).min(base))
            .or_insert(base);
    }

    let mut modules: Vec<RuntimeModule> = base_by_path
        .into_iter()
        .map(|(path, base)| RuntimeModule {
            score: module_score(&path),
            path,
            base,
        })
        .collect();
    modules.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.path.cmp(&b.path)));
    modules
}

/// Keep only executable mappings backed by an absolute path.
fn parse_maps(raw: &str) -> Vec<MapsEntry> {
    let mut entries = Vec::new();
    for line in raw.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 6 {
            continue;
        }
        if !fields[1].contains('x') {
            continue;
        }
        let Some((start, _end)) = fields[0].split_once('-') else {
            continue;
        };
        let (Ok(start), Ok(offset)) = (
            usize::from_str_radix(start, 16),
            usize::from_str_radix(fields[2], 16),
        ) else {
            continue;
        };
        let path = fields[5..].join(" ");
        let path = path.strip_suffix(" (deleted)").unwrap_or(&path);
        if !path.starts_with('/') {
            continue;
        }
        entries.push(MapsEntry {
            start,
            offset,
            path: path.to_string(),
        });
    }
    entries
}

pub(crate) fn module_score(path: &str) -> i32 {
    let path = path.to_lowercase();
    if path.contains("libc.so") {
        100
    } else if path.contains("libc-") {
        95
    } else if path.contains("ld-musl") {
        90
    } else if path.contains("musl") {
        85
    } else if path.contains("ld-linux") {
        80
    } else {
        -1
    }
}

/// Look up `name` in the on-disk symbol tables of the ELF at `path` and
/// return its image-relative value.
pub(crate) fn symbol_offset_in_file(path: &str, name: &str) -> Option<u64> {
    if !Path::new(path).is_file() {
        return None;
    }
    let data = std::fs::read(path).ok()?;
    let file = ElfBytes::<AnyEndian>::minimal_parse(&data).ok()?;
    if let Ok(Some((symtab, strtab))) = file.dynamic_symbol_table() {
        if let Some(value) = match_symbol(&symtab, &strtab, name) {
            return Some(value);
        }
    }
    if let Ok(Some((symtab, strtab))) = file.symbol_table() {
        if let Some(value) = match_symbol(&symtab, &strtab, name) {
            return Some(value);
        }
    }
    None
}

fn match_symbol(
    symtab: &SymbolTable<'_, AnyEndian>,
    strtab: &StringTable<'_>,
    want: &str,
) -> Option<u64> {
    for sym in symtab.iter() {
        if sym.st_value == 0 {
            continue;
        }
        let Ok(name) = strtab.get(sym.st_name as usize) else {
            continue;
        };
        if name == want || (name.starts_with(want) && name[want.len()..].starts_with('@')) {
            return Some(sym.st_value);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
7f1f20000000-7f1f20028000 r--p 00000000 fd:01 123 /usr/lib/x86_64-linux-gnu/libc.so.6
7f1f20028000-7f1f201bd000 r-xp 00028000 fd:01 123 /usr/lib/x86_64-linux-gnu/libc.so.6
7f1f20400000-7f1f20428000 r-xp 00002000 fd:01 456 /usr/lib/x86_64-linux-gnu/ld-linux-x86-64.so.2
7f1f20600000-7f1f20610000 r-xp 00001000 fd:01 789 /opt/tool/libhelper.so
7f1f20800000-7f1f20810000 rw-p 00000000 00:00 0 [heap]
7f1f20900000-7f1f20910000 r-xp 00000000 00:00 0
7f1f20a00000-7f1f20a10000 r-xp 00003000 fd:01 999 /tmp/gone.so (deleted)
";

    #[test]
    fn parser_keeps_executable_file_backed_lines() {
        let entries = parse_maps(SAMPLE);
        let paths: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(
            paths,
            [
                "/usr/lib/x86_64-linux-gnu/libc.so.6",
                "/usr/lib/x86_64-linux-gnu/ld-linux-x86-64.so.2",
                "/opt/tool/libhelper.so",
                "/tmp/gone.so",
            ]
        );
    }

    #[test]
    fn modules_are_based_and_ordered_by_score() {
        let modules = modules_from_maps(SAMPLE);
        assert_eq!(modules[0].path, "/usr/lib/x86_64-linux-gnu/libc.so.6");
        assert_eq!(modules[0].base, 0x7f1f20000000);
        assert_eq!(modules[0].score, 100);
        assert_eq!(
            modules[1].path,
            "/usr/lib/x86_64-linux-gnu/ld-linux-x86-64.so.2"
        );
        assert_eq!(modules[1].base, 0x7f1f20400000 - 0x2000);
        assert!(modules.last().unwrap().score == -1);
    }

    #[test]
    fn scores() {
        assert_eq!(module_score("/usr/lib/libc.so.6"), 100);
        assert_eq!(module_score("/usr/lib/libc-2.31.so"), 95);
        assert_eq!(module_score("/lib/ld-musl-x86_64.so.1"), 90);
        assert_eq!(module_score("/lib/musl/something.so"), 85);
        assert_eq!(module_score("/lib64/ld-linux-x86-64.so.2"), 80);
        assert_eq!(module_score("/opt/whatever.so"), -1);
    }
}

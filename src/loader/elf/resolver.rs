//! Resolution of the image's external symbols against the live process.
//!
//! Resolution order: the on-disk symbol tables of already-mapped modules
//! (offset + load base), then the runtime linker's `dlsym(NULL, ...)`.
//! If both miss, the baseline dependencies are opened and the search is
//! repeated. Hits and permanent misses are cached per load.

use super::dynapi::{self, DynApi};
use super::maps::{self, RuntimeModule};
use crate::{unresolved_symbol_error, Result};
use std::collections::{HashMap, HashSet};
use std::path::Path;

pub(crate) struct SymbolResolver {
    api: Option<&'static DynApi>,
    modules: Vec<RuntimeModule>,
    resolved: HashMap<String, usize>,
    misses: HashSet<String>,
    opened: HashSet<String>,
}

impl SymbolResolver {
    /// Build a resolver and opportunistically make sure the image's needed
    /// libraries plus the per-arch baseline are mapped.
    pub(crate) fn new(needed_libraries: &[String]) -> Self {
        let modules = maps::runtime_modules().unwrap_or_default();
        let api = match dynapi::get() {
            Ok(api) => Some(api),
            Err(err) => {
                log::warn!("runtime linker API unavailable: {err}");
                None
            }
        };
        let mut resolver = SymbolResolver {
            api,
            modules,
            resolved: HashMap::new(),
            misses: HashSet::new(),
            opened: HashSet::new(),
        };
        for library in needed_libraries.iter().map(String::as_str) {
            if let Err(detail) = resolver.ensure_library_loaded(library) {
                log::debug!("could not pre-open dependency {library}: {detail}");
            }
        }
        for library in baseline_dependencies() {
            if let Err(detail) = resolver.ensure_library_loaded(library) {
                log::debug!("could not pre-open dependency {library}: {detail}");
            }
        }
        resolver
    }

    pub(crate) fn resolve(&mut self, name: &str) -> Result<usize> {
        if let Some(&addr) = self.resolved.get(name) {
            return Ok(addr);
        }
        if self.misses.contains(name) {
            return Err(unresolved_symbol_error(name));
        }

        if let Some(addr) = self.lookup(name) {
            self.resolved.insert(name.to_string(), addr);
            return Ok(addr);
        }

        // Neither the module scan nor dlsym knew the name: pull in the
        // baseline dependencies and retry once.
        if self.api.is_some() {
            for library in baseline_dependencies() {
                let _ = self.ensure_library_loaded(library);
            }
            if let Some(addr) = self.lookup(name) {
                self.resolved.insert(name.to_string(), addr);
                return Ok(addr);
            }
        }

        if let Some(at) = name.find('@') {
            if at > 0 {
                if let Ok(addr) = self.resolve(&name[..at]) {
                    self.resolved.insert(name.to_string(), addr);
                    return Ok(addr);
                }
            }
        }

        self.misses.insert(name.to_string());
        Err(unresolved_symbol_error(name))
    }

    fn lookup(&self, name: &str) -> Option<usize> {
        if let Some(addr) = self.resolve_from_modules(name) {
            return Some(addr);
        }
        self.api.and_then(|api| api.dlsym_default(name))
    }

    fn resolve_from_modules(&self, name: &str) -> Option<usize> {
        for module in &self.modules {
            match maps::symbol_offset_in_file(&module.path, name) {
                Some(offset) if offset != 0 => return Some(module.base + offset as usize),
                _ => continue,
            }
        }
        None
    }

    /// Map `name` into the process unless a module with that path or
    /// basename is already resident.
    fn ensure_library_loaded(&mut self, name: &str) -> core::result::Result<(), String> {
        let name = name.trim();
        if name.is_empty() || self.has_module(name) {
            return Ok(());
        }
        let Some(api) = self.api else {
            return Err("dlopen is unavailable".to_string());
        };

        let mut last_error = None;
        for candidate in dlopen_candidates(name) {
            if self.has_module(&candidate) {
                return Ok(());
            }
            if self.opened.contains(&candidate) {
                continue;
            }
            match api.dlopen(&candidate, libc::RTLD_NOW | libc::RTLD_GLOBAL) {
                Ok(_handle) => {
                    self.opened.insert(candidate.clone());
                    self.opened.insert(name.to_string());
                    self.refresh_modules();
                    if self.has_module(name) || self.has_module(&candidate) {
                        return Ok(());
                    }
                }
                Err(err) => last_error = Some(err),
            }
        }
        if self.has_module(name) {
            return Ok(());
        }
        Err(last_error.unwrap_or_else(|| format!("dlopen({name}): returned nil handle")))
    }

    fn refresh_modules(&mut self) {
        if let Ok(modules) = maps::runtime_modules() {
            self.modules = modules;
        }
    }

    fn has_module(&self, name: &str) -> bool {
        let name = name.trim();
        if name.is_empty() {
            return false;
        }
        let base = basename(name);
        self.modules
            .iter()
            .any(|module| module.path == name || basename(&module.path) == base)
    }
}

fn basename(path: &str) -> &str {
    Path::new(path)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(path)
}

/// Libraries every resolution context wants resident: libc, libdl,
/// libpthread, and the dynamic linkers plausible for the host arch.
pub(crate) fn baseline_dependencies() -> impl Iterator<Item = &'static str> {
    const COMMON: [&str; 3] = ["libc.so.6", "libdl.so.2", "libpthread.so.0"];
    #[cfg(target_arch = "x86_64")]
    const ARCH: [&str; 2] = ["ld-linux-x86-64.so.2", "ld-musl-x86_64.so.1"];
    #[cfg(target_arch = "x86")]
    const ARCH: [&str; 2] = ["ld-linux.so.2", "ld-musl-i386.so.1"];
    #[cfg(target_arch = "aarch64")]
    const ARCH: [&str; 2] = ["ld-linux-aarch64.so.1", "ld-musl-aarch64.so.1"];
    COMMON.into_iter().chain(ARCH)
}

fn library_search_dirs() -> impl Iterator<Item = &'static str> {
    const COMMON: [&str; 4] = ["/lib", "/lib64", "/usr/lib", "/usr/lib64"];
    #[cfg(target_arch = "x86_64")]
    const ARCH: [&str; 2] = ["/lib/x86_64-linux-gnu", "/usr/lib/x86_64-linux-gnu"];
    #[cfg(target_arch = "x86")]
    const ARCH: [&str; 2] = ["/lib/i386-linux-gnu", "/usr/lib/i386-linux-gnu"];
    #[cfg(target_arch = "aarch64")]
    const ARCH: [&str; 2] = ["/lib/aarch64-linux-gnu", "/usr/lib/aarch64-linux-gnu"];
    COMMON.into_iter().chain(ARCH)
}

/// Paths and spellings to try for one library name, in order.
fn dlopen_candidates(name: &str) -> Vec<String> {
    let name = name.trim();
    if name.is_empty() {
        return Vec::new();
    }
    let mut out: Vec<String> = Vec::with_capacity(8);
    let mut add = |candidate: String| {
        if !candidate.is_empty() && !out.contains(&candidate) {
            out.push(candidate);
        }
    };

    add(name.to_string());
    let base = basename(name).to_string();
    add(base.clone());

    match base.as_str() {
        "libc.so" => add("libc.so.6".to_string()),
        "libdl.so" => add("libdl.so.2".to_string()),
        "libpthread.so" => add("libpthread.so.0".to_string()),
        _ => {}
    }
    if let Some(index) = base.find(".so.") {
        if index > 0 {
            add(base[..index + 3].to_string());
        }
    }
    for dir in library_search_dirs() {
        add(format!("{dir}/{base}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidates_for_versioned_soname() {
        let candidates = dlopen_candidates("libm.so.6");
        assert_eq!(candidates[0], "libm.so.6");
        assert!(candidates.contains(&"libm.so".to_string()));
        assert!(candidates.contains(&"/lib/libm.so.6".to_string()));
        assert!(candidates.contains(&"/usr/lib64/libm.so.6".to_string()));
    }

    #[test]
    fn candidates_map_well_known_aliases() {
        let candidates = dlopen_candidates("libc.so");
        assert_eq!(candidates[0], "libc.so");
        assert!(candidates.contains(&"libc.so.6".to_string()));
    }

    #[test]
    fn candidates_reduce_paths_to_basenames() {
        let candidates = dlopen_candidates("/some/odd/prefix/libfoo.so.1");
        assert_eq!(candidates[0], "/some/odd/prefix/libfoo.so.1");
        assert_eq!(candidates[1], "libfoo.so.1");
        assert!(candidates.contains(&"libfoo.so".to_string()));
    }

    #[test]
    fn baseline_always_contains_libc() {
        let baseline: Vec<&str> = baseline_dependencies().collect();
        assert!(baseline.contains(&"libc.so.6"));
        assert!(baseline.contains(&"libdl.so.2"));
        assert!(baseline.contains(&"libpthread.so.0"));
        assert_eq!(baseline.len(), 5);
    }
}

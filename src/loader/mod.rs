//! The per-OS loader backends. Each backend composes the same pipeline:
//! validate the image, lay its segments out in memory, apply relocations
//! against the live process, lock page protections, and expose exports.

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod elf;
        pub(crate) use elf::ElfModule as Module;
    } else if #[cfg(target_os = "macos")] {
        mod macho;
        pub(crate) use macho::MachoModule as Module;
    } else if #[cfg(windows)] {
        mod pe;
        pub(crate) use pe::PeModule as Module;
    }
}

/// The name as given plus its with/without-leading-underscore variant, in
/// lookup order.
#[cfg(any(target_os = "linux", windows))]
pub(crate) fn export_candidates(name: &str) -> [String; 2] {
    match name.strip_prefix('_') {
        Some(stripped) => [name.to_string(), stripped.to_string()],
        None => [name.to_string(), format!("_{name}")],
    }
}

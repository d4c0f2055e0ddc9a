//! Load a native shared-library image (ELF, Mach-O or PE) directly from a
//! byte buffer and invoke a named zero-argument export, without staging the
//! image to a filesystem path of our own.
//!
//! ```no_run
//! let bytes = std::fs::read("payload.so").unwrap();
//! let library = reflektor::Library::load(&bytes).unwrap();
//! library.call_export("StartW").unwrap();
//! library.free();
//! ```

#[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
compile_error!("reflektor only supports linux, macos and windows hosts");

pub mod ap32;
mod loader;
mod mmap;
mod os;

#[cfg(target_os = "linux")]
mod arch;

use loader::Module;
use std::fmt::{Debug, Display};
use std::path::Path;
use std::sync::RwLock;

/// A shared-library image loaded into the current process.
///
/// Read operations (`call_export`) may run concurrently; `free` excludes
/// them and every operation after `free` reports [`Error::LibraryClosed`].
pub struct Library {
    module: RwLock<Option<Module>>,
}

impl Library {
    /// Load a shared-library image from a byte buffer.
    pub fn load(bytes: &[u8]) -> Result<Library> {
        if bytes.is_empty() {
            return Err(Error::EmptyImage);
        }
        let module = Module::load(bytes)?;
        Ok(Library {
            module: RwLock::new(Some(module)),
        })
    }

    /// Read a shared-library image from disk and load it from memory.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Library> {
        let bytes = std::fs::read(path)?;
        Self::load(&bytes)
    }

    /// Resolve a zero-argument exported function and call it.
    ///
    /// The name is trimmed of surrounding whitespace and looked up both as
    /// given and with the leading-underscore variant. The call runs on the
    /// current thread; if the export never returns, neither does this.
    pub fn call_export(&self, name: &str) -> Result<()> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::EmptyExportName);
        }
        if name.contains('\0') {
            return Err(malformed_error("export name contains NUL"));
        }
        let guard = self.module.read().expect("library lock poisoned");
        let module = guard.as_ref().ok_or(Error::LibraryClosed)?;
        module.call_export(name)
    }

    /// Release the mapping and any owned OS resources. Idempotent.
    pub fn free(&self) {
        let mut guard = self.module.write().expect("library lock poisoned");
        guard.take();
    }
}

impl Drop for Library {
    fn drop(&mut self) {
        self.free();
    }
}

impl Debug for Library {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let closed = self
            .module
            .read()
            .map(|guard| guard.is_none())
            .unwrap_or(true);
        f.debug_struct("Library").field("closed", &closed).finish()
    }
}

#[derive(Debug)]
pub enum Error {
    /// Returned when encountered an io error.
    IoError { err: std::io::Error },
    /// The input buffer is empty.
    EmptyImage,
    /// The input is not a recognizable shared-library image.
    UnsupportedFormat,
    /// The image targets a machine other than the host's.
    ForeignPlatform { provided: String, expected: String },
    /// The image is recognizable but violates its own format.
    MalformedImage { detail: String },
    /// Reserving, committing or protecting memory failed.
    MapFailure { detail: String },
    /// A relocation entry could not be applied.
    RelocationFailure { detail: String },
    /// An imported symbol has no address in the running process.
    UnresolvedExternalSymbol { name: String },
    /// A needed library could not be brought into the process.
    DependencyLoadFailure { name: String, detail: String },
    /// Required dyld-internal entry points were not found.
    MissingDyldSymbols { list: Vec<String> },
    /// The AP32 container header is inconsistent.
    Ap32HeaderInvalid,
    /// The AP32 payload does not decode to the declared size.
    Ap32DecodeFailure,
    /// The live dyld runtime APIs could not be located.
    DyldApisUnavailable,
    /// `free()` has already run on this library.
    LibraryClosed,
    /// The export name is empty after trimming.
    EmptyExportName,
    /// No export matches the requested name or its underscore variant.
    ExportNotFound { name: String },
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IoError { err } => write!(f, "{err}"),
            Error::EmptyImage => write!(f, "empty library image"),
            Error::UnsupportedFormat => write!(f, "unrecognized image format"),
            Error::ForeignPlatform { provided, expected } => {
                write!(f, "foreign platform (provided: {provided}, expected: {expected})")
            }
            Error::MalformedImage { detail } => write!(f, "malformed image: {detail}"),
            Error::MapFailure { detail } => write!(f, "map failure: {detail}"),
            Error::RelocationFailure { detail } => write!(f, "relocation failure: {detail}"),
            Error::UnresolvedExternalSymbol { name } => {
                write!(f, "unresolved external symbol {name:?}")
            }
            Error::DependencyLoadFailure { name, detail } => {
                write!(f, "failed to load dependency {name}: {detail}")
            }
            Error::MissingDyldSymbols { list } => {
                write!(f, "failed to resolve required dyld symbols: {}", list.join(", "))
            }
            Error::Ap32HeaderInvalid => write!(f, "invalid packed AP32 payload header"),
            Error::Ap32DecodeFailure => write!(f, "failed to depack AP32 payload"),
            Error::DyldApisUnavailable => {
                write!(f, "failed to resolve dyld runtime API section")
            }
            Error::LibraryClosed => write!(f, "library is closed"),
            Error::EmptyExportName => write!(f, "export name cannot be empty"),
            Error::ExportNotFound { name } => write!(f, "export {name:?} not found"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::IoError { err } => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    #[cold]
    fn from(value: std::io::Error) -> Self {
        Error::IoError { err: value }
    }
}

#[cold]
#[inline(never)]
pub(crate) fn malformed_error(detail: impl ToString) -> Error {
    Error::MalformedImage {
        detail: detail.to_string(),
    }
}

#[cold]
#[inline(never)]
pub(crate) fn map_error(detail: impl ToString) -> Error {
    Error::MapFailure {
        detail: detail.to_string(),
    }
}

#[cold]
#[inline(never)]
pub(crate) fn relocate_error(detail: impl ToString) -> Error {
    Error::RelocationFailure {
        detail: detail.to_string(),
    }
}

#[cold]
#[inline(never)]
pub(crate) fn foreign_platform_error(provided: impl ToString, expected: impl ToString) -> Error {
    Error::ForeignPlatform {
        provided: provided.to_string(),
        expected: expected.to_string(),
    }
}

#[cold]
#[inline(never)]
#[allow(unused)]
pub(crate) fn unresolved_symbol_error(name: impl ToString) -> Error {
    Error::UnresolvedExternalSymbol {
        name: name.to_string(),
    }
}

#[cold]
#[inline(never)]
#[allow(unused)]
pub(crate) fn dependency_error(name: impl ToString, detail: impl ToString) -> Error {
    Error::DependencyLoadFailure {
        name: name.to_string(),
        detail: detail.to_string(),
    }
}

#[cold]
#[inline(never)]
pub(crate) fn export_not_found(name: impl ToString) -> Error {
    Error::ExportNotFound {
        name: name.to_string(),
    }
}

pub type Result<T> = core::result::Result<T, Error>;

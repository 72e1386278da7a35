//! The opaque "module handle" collaborator (§1, §6).
//!
//! Filesystem and dynamic-library loading mechanics are out of scope for
//! this crate; everything above this module only needs a handle that can
//! enumerate the `ModuleExport`s it carries. `StaticModuleHandle` supports
//! statically-linked modules (the binary-section-scanning case, which is
//! itself platform-specific and out of scope); `DynamicModuleHandle`
//! mirrors the teacher's `PluginRegistry::load_plugin`
//! (`plugin/mod.rs`) — `libloading::Library::new` plus a single exported
//! symbol lookup.

use std::fmt;
use std::path::{Path, PathBuf};

use libloading::{Library, Symbol};
use tracing::{debug, warn};

use crate::export::ModuleExport;

/// A source of module exports. `iterate_exports` is visitor-style to match
/// §6's `fimo_impl_module_export_iterator(visitor, data)` contract, even
/// though our in-process representation can hand back owned values directly
/// rather than crossing a real C-ABI boundary.
pub trait ModuleHandle: Send + Sync {
    fn module_path(&self) -> &Path;
    fn iterate_exports(&mut self, visitor: &mut dyn FnMut(ModuleExport));
}

impl fmt::Debug for dyn ModuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ModuleHandle({})", self.module_path().display())
    }
}

/// A module whose exports were linked into this binary (or constructed
/// in-process for tests) rather than discovered on disk.
pub struct StaticModuleHandle {
    path: PathBuf,
    exports: Vec<ModuleExport>,
}

impl StaticModuleHandle {
    pub fn new(path: impl Into<PathBuf>, exports: Vec<ModuleExport>) -> Self {
        Self {
            path: path.into(),
            exports,
        }
    }
}

impl ModuleHandle for StaticModuleHandle {
    fn module_path(&self) -> &Path {
        &self.path
    }

    fn iterate_exports(&mut self, visitor: &mut dyn FnMut(ModuleExport)) {
        for export in self.exports.drain(..) {
            visitor(export);
        }
    }
}

/// Function signature every dynamically loaded module must export.
///
/// Mirrors the teacher's `InitPluginFn`/`GetPluginInfoFn` pattern
/// (`plugin/mod.rs`): the return value crosses the dynamic-library boundary
/// as a Rust value, not a C-ABI one, so — exactly like the teacher's
/// comment on `PluginRegistry` — the module must be compiled with the same
/// Rust toolchain as the host.
type ModuleExportsFn = unsafe extern "C" fn() -> *mut Vec<ModuleExport>;

/// A module loaded from a shared library (`.so`/`.dylib`/`.dll`) via
/// `libloading`, the way `plugin::PluginRegistry::load_plugin` does.
pub struct DynamicModuleHandle {
    path: PathBuf,
    library: Library,
    exports: Option<Vec<ModuleExport>>,
}

impl DynamicModuleHandle {
    /// # Safety
    /// The caller must ensure `path` names a library built against a
    /// compatible `fulcrum-core` and exports `fulcrum_module_exports` with
    /// the signature above.
    pub unsafe fn load(path: impl Into<PathBuf>) -> Result<Self, libloading::Error> {
        let path = path.into();
        debug!(path = %path.display(), "loading module library");
        let library = Library::new(&path)?;
        let exports = {
            let ctor: Symbol<ModuleExportsFn> = library.get(b"fulcrum_module_exports")?;
            let raw = ctor();
            *Box::from_raw(raw)
        };
        Ok(Self {
            path,
            library,
            exports: Some(exports),
        })
    }
}

impl ModuleHandle for DynamicModuleHandle {
    fn module_path(&self) -> &Path {
        &self.path
    }

    fn iterate_exports(&mut self, visitor: &mut dyn FnMut(ModuleExport)) {
        if let Some(exports) = self.exports.take() {
            for export in exports {
                visitor(export);
            }
        } else {
            warn!(path = %self.path.display(), "module exports already consumed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::Version;

    #[test]
    fn static_handle_yields_every_export_once() {
        let exports = vec![
            ModuleExport::builder("a", Version::new(1, 0, 0)).build(),
            ModuleExport::builder("b", Version::new(1, 0, 0)).build(),
        ];
        let mut handle = StaticModuleHandle::new("/modules/a.so", exports);
        let mut seen = Vec::new();
        handle.iterate_exports(&mut |export| seen.push(export.name));
        assert_eq!(seen, vec!["a".to_string(), "b".to_string()]);

        // Draining again yields nothing further.
        let mut seen_again = Vec::new();
        handle.iterate_exports(&mut |export| seen_again.push(export.name));
        assert!(seen_again.is_empty());
    }
}

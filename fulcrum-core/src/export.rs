//! Module export descriptor — the immutable value a module provider hands
//! to a loading set.
//!
//! Grounded on the teacher's `plugin::PluginInfo` (name/version/author/
//! description) and `executor::ExecutionContext`/`ResourceLimits` (typed
//! declaration structs passed by value rather than stringly-typed maps).

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::Result;
use crate::parameter::{AccessGroup, ParameterType};
use crate::version::Version;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
/// Opaque cross-module state or symbol value. Stands in for the wire
/// format's untyped pointer now that the real C-ABI boundary is out of
/// scope (§1) — `Arc<dyn Any + Send + Sync>` is the idiomatic Rust
/// equivalent of "a pointer with a destructor".
pub type Opaque = Arc<dyn Any + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ParameterDecl {
    pub name: String,
    pub ty: ParameterType,
    pub default: i64,
    pub read_group: AccessGroup,
    pub write_group: AccessGroup,
}

#[derive(Debug, Clone)]
pub struct ResourceDecl {
    pub name: String,
    /// Path relative to the owning instance's module path.
    pub relative_path: String,
}

#[derive(Debug, Clone)]
pub struct NamespaceImportDecl {
    pub namespace: String,
}

#[derive(Debug, Clone)]
pub struct SymbolImportDecl {
    pub name: String,
    pub namespace: String,
    pub required_version: Version,
}

/// A dynamic symbol's constructor: polled to completion with access to the
/// owning (not-yet-`Started`) instance, producing the opaque symbol value.
pub trait DynamicConstructor: Send + Sync {
    fn construct(&self, instance: crate::instance::InstanceHandle) -> BoxFuture<Result<Opaque>>;
}

pub trait DynamicDestructor: Send + Sync {
    fn destruct(&self, instance: crate::instance::InstanceHandle, value: Opaque) -> BoxFuture<Result<()>>;
}

#[derive(Clone)]
pub enum SymbolExportDecl {
    Static {
        name: String,
        namespace: String,
        version: Version,
        value: Opaque,
    },
    Dynamic {
        name: String,
        namespace: String,
        version: Version,
        constructor: Arc<dyn DynamicConstructor>,
        destructor: Option<Arc<dyn DynamicDestructor>>,
    },
}

impl SymbolExportDecl {
    pub fn name(&self) -> &str {
        match self {
            SymbolExportDecl::Static { name, .. } => name,
            SymbolExportDecl::Dynamic { name, .. } => name,
        }
    }

    pub fn namespace(&self) -> &str {
        match self {
            SymbolExportDecl::Static { namespace, .. } => namespace,
            SymbolExportDecl::Dynamic { namespace, .. } => namespace,
        }
    }

    pub fn version(&self) -> Version {
        match self {
            SymbolExportDecl::Static { version, .. } => *version,
            SymbolExportDecl::Dynamic { version, .. } => *version,
        }
    }
}

impl fmt::Debug for SymbolExportDecl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SymbolExportDecl")
            .field("name", &self.name())
            .field("namespace", &self.namespace())
            .field("version", &self.version())
            .finish()
    }
}

/// Modifier tags from the export's `modifiers` list (§3, §6). `Dependencies`
/// (wire tag 5) is reserved: accepted by validation but never emitted or
/// interpreted by any code path here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Modifier {
    InstanceState,
    StartEvent,
    StopEvent,
    Dependencies,
    DebugInfo(String),
}

/// A user-supplied lifecycle poll (`init`, `deinit`, `start`, `stop`).
/// `init` is the only hook whose successful result is retained (as the
/// instance's opaque user state); the others return `()`.
pub trait LifecycleHook: Send + Sync {
    fn call(&self, instance: crate::instance::InstanceHandle) -> BoxFuture<Result<Option<Opaque>>>;
}

#[derive(Clone)]
pub struct ModuleExport {
    pub name: String,
    pub description: Option<String>,
    pub author: Option<String>,
    pub license: Option<String>,
    /// Context version this export was compiled against.
    pub version: Version,
    pub parameters: Vec<ParameterDecl>,
    pub resources: Vec<ResourceDecl>,
    pub namespace_imports: Vec<NamespaceImportDecl>,
    pub symbol_imports: Vec<SymbolImportDecl>,
    pub symbol_exports: Vec<SymbolExportDecl>,
    pub modifiers: Vec<Modifier>,
    pub init: Option<Arc<dyn LifecycleHook>>,
    pub deinit: Option<Arc<dyn LifecycleHook>>,
    pub start: Option<Arc<dyn LifecycleHook>>,
    pub stop: Option<Arc<dyn LifecycleHook>>,
}

impl fmt::Debug for ModuleExport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleExport")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("symbol_exports", &self.symbol_exports)
            .field("symbol_imports", &self.symbol_imports)
            .finish()
    }
}

impl ModuleExport {
    pub fn builder(name: impl Into<String>, version: Version) -> ModuleExportBuilder {
        ModuleExportBuilder::new(name, version)
    }
}

/// Convenience builder used by module providers and by tests; mirrors the
/// teacher's preference for small `with_config`-style constructors over
/// public-field struct literals scattered through call sites.
#[derive(Clone)]
pub struct ModuleExportBuilder {
    export: ModuleExport,
}

impl ModuleExportBuilder {
    pub fn new(name: impl Into<String>, version: Version) -> Self {
        Self {
            export: ModuleExport {
                name: name.into(),
                description: None,
                author: None,
                license: None,
                version,
                parameters: Vec::new(),
                resources: Vec::new(),
                namespace_imports: Vec::new(),
                symbol_imports: Vec::new(),
                symbol_exports: Vec::new(),
                modifiers: Vec::new(),
                init: None,
                deinit: None,
                start: None,
                stop: None,
            },
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.export.description = Some(description.into());
        self
    }

    pub fn namespace_import(mut self, namespace: impl Into<String>) -> Self {
        self.export.namespace_imports.push(NamespaceImportDecl {
            namespace: namespace.into(),
        });
        self
    }

    pub fn symbol_import(mut self, name: impl Into<String>, namespace: impl Into<String>, required_version: Version) -> Self {
        self.export.symbol_imports.push(SymbolImportDecl {
            name: name.into(),
            namespace: namespace.into(),
            required_version,
        });
        self
    }

    pub fn static_export(mut self, name: impl Into<String>, namespace: impl Into<String>, version: Version, value: Opaque) -> Self {
        self.export.symbol_exports.push(SymbolExportDecl::Static {
            name: name.into(),
            namespace: namespace.into(),
            version,
            value,
        });
        self
    }

    pub fn dynamic_export(
        mut self,
        name: impl Into<String>,
        namespace: impl Into<String>,
        version: Version,
        constructor: Arc<dyn DynamicConstructor>,
        destructor: Option<Arc<dyn DynamicDestructor>>,
    ) -> Self {
        self.export.symbol_exports.push(SymbolExportDecl::Dynamic {
            name: name.into(),
            namespace: namespace.into(),
            version,
            constructor,
            destructor,
        });
        self
    }

    pub fn parameter(mut self, decl: ParameterDecl) -> Self {
        self.export.parameters.push(decl);
        self
    }

    pub fn init(mut self, hook: Arc<dyn LifecycleHook>) -> Self {
        self.export.init = Some(hook);
        self
    }

    pub fn deinit(mut self, hook: Arc<dyn LifecycleHook>) -> Self {
        self.export.deinit = Some(hook);
        self
    }

    pub fn start(mut self, hook: Arc<dyn LifecycleHook>) -> Self {
        self.export.start = Some(hook);
        self
    }

    pub fn stop(mut self, hook: Arc<dyn LifecycleHook>) -> Self {
        self.export.stop = Some(hook);
        self
    }

    pub fn build(self) -> ModuleExport {
        self.export
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_produces_expected_shape() {
        let export = ModuleExport::builder("a", Version::new(1, 0, 0))
            .namespace_import("net")
            .symbol_import("s", "", Version::new(1, 0, 0))
            .build();
        assert_eq!(export.name, "a");
        assert_eq!(export.namespace_imports.len(), 1);
        assert_eq!(export.symbol_imports.len(), 1);
    }
}

//! Loading set — the append-only staging area for a batch of module exports
//! pending commit (§3, §4.D).
//!
//! Grounded on the teacher's `PluginRegistry::discover_plugins`
//! (`plugin/mod.rs`): enumerate candidates, validate each, and only then
//! commit them into the live table. Here "the live table" is the
//! `Registry`, and validation is `validate_export` below.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::task::{Poll, Waker};

use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{FulcrumError, Result};
use crate::export::{Modifier, ModuleExport};
use crate::instance::InstanceHandle;
use crate::module_handle::ModuleHandle;
use crate::registry::Registry;
use crate::version::Version;

/// One module's progress through the staging pipeline.
pub(crate) enum ModuleStatus {
    Unloaded {
        owner: Option<InstanceHandle>,
        wakers: Vec<Waker>,
    },
    Err {
        owner: Option<InstanceHandle>,
    },
    Loaded {
        instance: InstanceHandle,
    },
}

type SharedModuleHandle = Arc<Box<dyn ModuleHandle>>;

pub(crate) struct ModuleInfo {
    pub(crate) export: ModuleExport,
    pub(crate) module_handle: SharedModuleHandle,
    pub(crate) status: ModuleStatus,
}

/// The outcome delivered to a registered status callback, invoked exactly
/// once per module (§7 "User-visible failure behavior").
pub enum ModuleStatusEvent {
    Success(InstanceHandle),
    Error(ModuleExport),
    Abort,
}

/// Result of `poll_module_status`.
pub(crate) enum PollStatus {
    Pending,
    Resolved { instance: Option<InstanceHandle>, export: ModuleExport },
    NotFound,
}

struct LoadingSetInner {
    modules: HashMap<String, ModuleInfo>,
    /// Local duplicate-check index over `(symbol_name, namespace)`, distinct
    /// from the registry's global index.
    symbols: HashMap<(String, String), String>,
    active_commits: usize,
    callbacks: HashMap<String, Box<dyn FnMut(ModuleStatusEvent) + Send>>,
}

/// §3 "Loading set": arena-allocated staging area. The Rust rendition owns
/// its modules directly rather than through a literal arena (§9 design
/// notes: ownership substitutes for arena bookkeeping).
#[derive(Clone)]
pub struct LoadingSet {
    pub(crate) registry: Registry,
    pub(crate) executor: Arc<crate::executor::TaskExecutor>,
    pub(crate) config: Config,
    inner: Arc<Mutex<LoadingSetInner>>,
}

impl LoadingSet {
    pub fn new(registry: Registry, executor: Arc<crate::executor::TaskExecutor>, config: Config) -> Self {
        LoadingSet {
            registry,
            executor,
            config,
            inner: Arc::new(Mutex::new(LoadingSetInner {
                modules: HashMap::new(),
                symbols: HashMap::new(),
                active_commits: 0,
                callbacks: HashMap::new(),
            })),
        }
    }

    /// Register a status callback for `module_name`, invoked exactly once
    /// when that module resolves (§7).
    pub fn on_status(&self, module_name: impl Into<String>, callback: impl FnMut(ModuleStatusEvent) + Send + 'static) {
        self.inner.lock().unwrap().callbacks.insert(module_name.into(), Box::new(callback));
    }

    /// §4.D `add_module_inner`.
    pub(crate) fn add_module_inner(
        &self,
        module_handle: SharedModuleHandle,
        export: ModuleExport,
        owner: Option<InstanceHandle>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.modules.contains_key(&export.name) {
            return Err(FulcrumError::Duplicate(format!("module '{}' already in this loading set", export.name)));
        }
        for decl in &export.symbol_exports {
            let key = (decl.name().to_string(), decl.namespace().to_string());
            if inner.symbols.contains_key(&key) {
                return Err(FulcrumError::Duplicate(format!(
                    "symbol '{}' in namespace '{}' already staged in this set",
                    decl.name(),
                    decl.namespace()
                )));
            }
        }
        for decl in &export.symbol_exports {
            let key = (decl.name().to_string(), decl.namespace().to_string());
            inner.symbols.insert(key, export.name.clone());
        }
        if let Some(owner) = &owner {
            owner.ref_strong();
        }
        inner.modules.insert(
            export.name.clone(),
            ModuleInfo {
                export,
                module_handle,
                status: ModuleStatus::Unloaded { owner, wakers: Vec::new() },
            },
        );
        Ok(())
    }

    /// §4.D `add_modules_from_local`: drain every export a module handle
    /// yields, validating and filtering each before staging it. Rolls back
    /// the whole batch if any export fails validation.
    pub fn add_modules_from_local(
        &self,
        mut module_handle: Box<dyn ModuleHandle>,
        config: &Config,
        filter: impl Fn(&ModuleExport) -> bool,
    ) -> Result<usize> {
        let mut collected = Vec::new();
        let mut failure = None;
        module_handle.iterate_exports(&mut |export| {
            if failure.is_some() {
                return;
            }
            match validate_export(&export, config) {
                Ok(()) => {
                    if filter(&export) {
                        collected.push(export);
                    }
                }
                Err(err) => failure = Some(err),
            }
        });
        if let Some(err) = failure {
            warn!(error = %err, "rolling back batch after a rejected export");
            return Err(err);
        }
        let count = collected.len();
        // All exports drained from one handle share ownership of it — this
        // keeps a `DynamicModuleHandle`'s underlying `libloading::Library`
        // (and thus the mapped `.so`) alive for as long as any instance
        // built from it is loaded.
        let shared: SharedModuleHandle = Arc::new(module_handle);
        for export in collected {
            self.add_module_inner(shared.clone(), export, None)?;
        }
        Ok(count)
    }

    /// §4.D `poll_module_status`.
    pub(crate) fn poll_module_status(&self, name: &str, waker: &Waker) -> PollStatus {
        let mut inner = self.inner.lock().unwrap();
        match inner.modules.get_mut(name) {
            None => PollStatus::NotFound,
            Some(info) => match &mut info.status {
                ModuleStatus::Unloaded { wakers, .. } => {
                    wakers.push(waker.clone());
                    PollStatus::Pending
                }
                ModuleStatus::Err { .. } => PollStatus::Resolved {
                    instance: None,
                    export: info.export.clone(),
                },
                ModuleStatus::Loaded { instance } => PollStatus::Resolved {
                    instance: Some(instance.clone()),
                    export: info.export.clone(),
                },
            },
        }
    }

    pub(crate) fn pending_names(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .modules
            .iter()
            .filter(|(_, info)| matches!(info.status, ModuleStatus::Unloaded { .. }))
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub(crate) fn export_of(&self, name: &str) -> Option<ModuleExport> {
        self.inner.lock().unwrap().modules.get(name).map(|info| info.export.clone())
    }

    pub(crate) fn status_is_err(&self, name: &str) -> bool {
        matches!(
            self.inner.lock().unwrap().modules.get(name).map(|info| &info.status),
            Some(ModuleStatus::Err { .. })
        )
    }

    pub(crate) fn status_is_loaded(&self, name: &str) -> bool {
        matches!(
            self.inner.lock().unwrap().modules.get(name).map(|info| &info.status),
            Some(ModuleStatus::Loaded { .. })
        )
    }

    /// Whether any module in this set has already transitioned to `Err`.
    /// Used by `commit_op` to honor `Config::fail_fast` (§7).
    pub(crate) fn has_any_err(&self) -> bool {
        self.inner
            .lock()
            .unwrap()
            .modules
            .values()
            .any(|info| matches!(info.status, ModuleStatus::Err { .. }))
    }

    pub(crate) fn module_handle(&self, name: &str) -> Option<SharedModuleHandle> {
        self.inner.lock().unwrap().modules.get(name).map(|info| info.module_handle.clone())
    }

    /// Mark `name` as `Err`, waking any wakers installed by
    /// `poll_module_status` and invoking its registered callback.
    pub(crate) fn signal_error(&self, name: &str) {
        let (owner, export, callback, wakers) = {
            let mut inner = self.inner.lock().unwrap();
            let Some(info) = inner.modules.get_mut(name) else { return };
            let (owner, wakers) = match std::mem::replace(
                &mut info.status,
                ModuleStatus::Err { owner: None },
            ) {
                ModuleStatus::Unloaded { owner, wakers } => (owner, wakers),
                other => {
                    info.status = other;
                    return;
                }
            };
            info.status = ModuleStatus::Err { owner: owner.clone() };
            let export = info.export.clone();
            let callback = inner.callbacks.remove(name);
            (owner, export, callback, wakers)
        };
        if let Some(owner) = owner {
            owner.unref_strong();
        }
        warn!(module = %name, "module transitioned to Err");
        if let Some(mut callback) = callback {
            callback(ModuleStatusEvent::Error(export));
        }
        for waker in wakers {
            waker.wake();
        }
    }

    /// Mark `name` as `Loaded`, delivering `instance` to callback/wakers.
    pub(crate) fn signal_success(&self, name: &str, instance: InstanceHandle) {
        let (owner, callback, wakers) = {
            let mut inner = self.inner.lock().unwrap();
            let Some(info) = inner.modules.get_mut(name) else { return };
            let (owner, wakers) = match std::mem::replace(
                &mut info.status,
                ModuleStatus::Loaded { instance: instance.clone() },
            ) {
                ModuleStatus::Unloaded { owner, wakers } => (owner, wakers),
                other => {
                    info.status = other;
                    return;
                }
            };
            let callback = inner.callbacks.remove(name);
            (owner, callback, wakers)
        };
        if let Some(owner) = owner {
            owner.unref_strong();
        }
        debug!(module = %name, "module loaded");
        if let Some(mut callback) = callback {
            callback(ModuleStatusEvent::Success(instance));
        }
        for waker in wakers {
            waker.wake();
        }
    }

    pub(crate) fn enter_commit(&self) {
        self.inner.lock().unwrap().active_commits += 1;
    }

    pub(crate) fn exit_commit(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.active_commits = inner.active_commits.saturating_sub(1);
    }

    /// §4.E: drives every pending module in this set to `Loaded` or `Err`.
    pub async fn commit(&self) -> Result<()> {
        crate::load_graph::commit_op(self.clone()).await
    }
}

impl Drop for LoadingSet {
    fn drop(&mut self) {
        // Only the last clone (the one actually holding the final strong
        // ref to `inner`) should fire `Abort`; cheap clones used internally
        // by the commit machinery must not spuriously abort modules still
        // in flight.
        if Arc::strong_count(&self.inner) != 1 {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        let names: Vec<String> = inner
            .modules
            .iter()
            .filter(|(_, info)| matches!(info.status, ModuleStatus::Unloaded { .. }))
            .map(|(name, _)| name.clone())
            .collect();
        for name in names {
            if let Some(mut callback) = inner.callbacks.remove(&name) {
                callback(ModuleStatusEvent::Abort);
            }
        }
    }
}

/// §4.D "Export validation".
pub fn validate_export(export: &ModuleExport, config: &Config) -> Result<()> {
    if config.is_reserved_name(&export.name) {
        return Err(FulcrumError::InvalidExport {
            name: export.name.clone(),
            reason: "name uses a reserved prefix".into(),
        });
    }

    let mut seen_namespaces = HashSet::new();
    for import in &export.namespace_imports {
        if import.namespace.is_empty() {
            return Err(FulcrumError::InvalidExport {
                name: export.name.clone(),
                reason: "namespace import name must not be empty".into(),
            });
        }
        if !seen_namespaces.insert(import.namespace.clone()) {
            return Err(FulcrumError::InvalidExport {
                name: export.name.clone(),
                reason: format!("namespace '{}' imported twice", import.namespace),
            });
        }
    }

    for symbol_import in &export.symbol_imports {
        if !symbol_import.namespace.is_empty() && !seen_namespaces.contains(&symbol_import.namespace) {
            return Err(FulcrumError::InvalidExport {
                name: export.name.clone(),
                reason: format!(
                    "symbol import '{}' uses namespace '{}' which is not imported",
                    symbol_import.name, symbol_import.namespace
                ),
            });
        }
    }

    let mut seen_exports = HashSet::new();
    for decl in &export.symbol_exports {
        if config.is_reserved_name(decl.name()) {
            return Err(FulcrumError::InvalidExport {
                name: export.name.clone(),
                reason: format!("exported symbol '{}' uses a reserved prefix", decl.name()),
            });
        }
        let key = (decl.name().to_string(), decl.namespace().to_string());
        if !seen_exports.insert(key) {
            return Err(FulcrumError::InvalidExport {
                name: export.name.clone(),
                reason: format!("exported symbol '{}' declared twice", decl.name()),
            });
        }
    }

    for symbol_import in &export.symbol_imports {
        let also_exported = export
            .symbol_exports
            .iter()
            .any(|decl| decl.name() == symbol_import.name && decl.namespace() == symbol_import.namespace);
        if also_exported {
            return Err(FulcrumError::InvalidExport {
                name: export.name.clone(),
                reason: format!("symbol '{}' is both imported and exported", symbol_import.name),
            });
        }
    }

    let mut instance_state_count = 0;
    let mut start_event_count = 0;
    let mut stop_event_count = 0;
    for modifier in &export.modifiers {
        match modifier {
            Modifier::InstanceState => instance_state_count += 1,
            Modifier::StartEvent => start_event_count += 1,
            Modifier::StopEvent => stop_event_count += 1,
            Modifier::Dependencies | Modifier::DebugInfo(_) => {}
        }
    }
    if instance_state_count > 1 || start_event_count > 1 || stop_event_count > 1 {
        return Err(FulcrumError::InvalidExport {
            name: export.name.clone(),
            reason: "instance_state/start_event/stop_event may each appear at most once".into(),
        });
    }

    if !satisfies_compatible_runtime_version(export.version) {
        return Err(FulcrumError::InvalidExport {
            name: export.name.clone(),
            reason: format!("export version {} is not compatible with this runtime", export.version),
        });
    }

    Ok(())
}

pub(crate) fn satisfies_compatible_runtime_version(export_version: Version) -> bool {
    // The crate's own context version; modules built against an
    // incompatible major version are rejected at validation time (§4.D).
    export_version.satisfies(&Version::new(1, 0, 0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::ModuleExport;

    #[test]
    fn reserved_prefix_is_rejected() {
        let export = ModuleExport::builder("__internal", Version::new(1, 0, 0)).build();
        assert!(validate_export(&export, &Config::default()).is_err());
    }

    #[test]
    fn duplicate_namespace_import_is_rejected() {
        let export = ModuleExport::builder("a", Version::new(1, 0, 0))
            .namespace_import("net")
            .namespace_import("net")
            .build();
        assert!(validate_export(&export, &Config::default()).is_err());
    }

    #[test]
    fn symbol_import_namespace_must_be_declared() {
        let export = ModuleExport::builder("a", Version::new(1, 0, 0))
            .symbol_import("s", "net", Version::new(1, 0, 0))
            .build();
        assert!(validate_export(&export, &Config::default()).is_err());
    }

    #[test]
    fn well_formed_export_passes() {
        let export = ModuleExport::builder("a", Version::new(1, 0, 0))
            .namespace_import("net")
            .symbol_import("s", "net", Version::new(1, 0, 0))
            .build();
        assert!(validate_export(&export, &Config::default()).is_ok());
    }
}

//! Instance handle — the mutable, shared, reference-counted state behind a
//! loaded module (§3, §4.C).
//!
//! Grounded on the teacher's `ExecutorRegistry`/`ConcurrentExecutorRegistry`
//! split (`executor/mod.rs`): one `Mutex`-guarded inner struct reachable
//! through cheap `Arc` clones, generalized from "a table of executors" to
//! "one instance's full mutable state".

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::task::Waker;

type SharedModuleHandle = Arc<Box<dyn ModuleHandle>>;

use tracing::{debug, warn};

use crate::error::{FulcrumError, Result};
use crate::export::{ModuleExport, Opaque};
use crate::module_handle::ModuleHandle;
use crate::parameter::{AccessGroup, Parameter};
use crate::registry::Registry;
use crate::version::Version;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninit,
    Init,
    Started,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyKind {
    /// Declared at load time via a symbol import; cannot be removed before
    /// the owning instance unloads.
    Static,
    /// Added after load via `add_dependency`; removable at will.
    Dynamic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamespaceKind {
    Static,
    Dynamic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamespaceQuery {
    None,
    Added,
    Static,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyQuery {
    None,
    Static,
    Dynamic,
}

/// A resolved, owned symbol value sitting in an instance's local symbol
/// table (distinct from the registry's `(version, owner)` index entry).
#[derive(Clone)]
pub struct Symbol {
    pub version: Version,
    pub value: Opaque,
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Symbol").field("version", &self.version).finish()
    }
}

pub(crate) struct InstanceInner {
    pub(crate) name: String,
    module_path: PathBuf,
    pub(crate) author: Option<String>,
    pub(crate) license: Option<String>,
    pub(crate) state: LifecycleState,
    pub(crate) is_detached: bool,
    pub(crate) unload_requested: bool,
    pub(crate) strong_count: usize,
    pub(crate) dependents_count: usize,
    unload_waiter: Option<Waker>,
    pub(crate) parameters: HashMap<String, Arc<Parameter>>,
    resources: HashMap<String, PathBuf>,
    pub(crate) namespaces: HashMap<String, NamespaceKind>,
    pub(crate) dependencies: HashMap<String, (InstanceHandle, DependencyKind)>,
    pub(crate) symbols: HashMap<(String, String), Symbol>,
    imports: HashMap<(String, String), Opaque>,
    module_handle: Option<SharedModuleHandle>,
    pub(crate) user_state: Option<Opaque>,
    registry: Registry,
}

/// A shared, reference-counted handle to a loaded module instance.
///
/// The outer `Arc` is the "outer reference count" from §4.C; `strong_count`
/// and `dependents_count` inside the guarded inner state are the separate
/// counts that gate unloading (invariant 2, §3).
pub struct InstanceHandle(Arc<Mutex<InstanceInner>>);

impl Clone for InstanceHandle {
    fn clone(&self) -> Self {
        InstanceHandle(self.0.clone())
    }
}

impl fmt::Debug for InstanceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.0.lock().unwrap();
        f.debug_struct("InstanceHandle")
            .field("name", &inner.name)
            .field("state", &inner.state)
            .finish()
    }
}

impl PartialEq for InstanceHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for InstanceHandle {}

impl InstanceHandle {
    /// Step 1 of `InitExportedOp` (§4.F): allocate the handle and inner
    /// state for a freshly-accepted export, with `strong_count` already at 1
    /// to prevent the instance unloading before the pipeline finishes.
    pub(crate) fn allocate(export: &ModuleExport, module_handle: SharedModuleHandle, registry: Registry) -> Self {
        let module_path = module_handle.module_path().to_path_buf();
        InstanceHandle(Arc::new(Mutex::new(InstanceInner {
            name: export.name.clone(),
            module_path,
            author: export.author.clone(),
            license: export.license.clone(),
            state: LifecycleState::Uninit,
            is_detached: false,
            unload_requested: false,
            strong_count: 1,
            dependents_count: 0,
            unload_waiter: None,
            parameters: HashMap::new(),
            resources: HashMap::new(),
            namespaces: HashMap::new(),
            dependencies: HashMap::new(),
            symbols: HashMap::new(),
            imports: HashMap::new(),
            module_handle: Some(module_handle),
            user_state: None,
            registry,
        })))
    }

    pub fn name(&self) -> String {
        self.0.lock().unwrap().name.clone()
    }

    pub fn module_path(&self) -> PathBuf {
        self.0.lock().unwrap().module_path.clone()
    }

    pub fn state(&self) -> LifecycleState {
        self.0.lock().unwrap().state
    }

    pub fn is_detached(&self) -> bool {
        self.0.lock().unwrap().is_detached
    }

    pub fn strong_count(&self) -> usize {
        self.0.lock().unwrap().strong_count
    }

    pub fn dependents_count(&self) -> usize {
        self.0.lock().unwrap().dependents_count
    }

    /// Invariant 2 (§3): `canUnload ⇔ strong_count == 0 ∧ dependents_count == 0`.
    pub fn can_unload(&self) -> bool {
        let inner = self.0.lock().unwrap();
        inner.strong_count == 0 && inner.dependents_count == 0
    }

    pub(crate) fn resource_path(&self, name: &str) -> Option<PathBuf> {
        self.0.lock().unwrap().resources.get(name).cloned()
    }

    pub(crate) fn insert_parameter(&self, name: impl Into<String>, parameter: Arc<Parameter>) {
        self.0.lock().unwrap().parameters.insert(name.into(), parameter);
    }

    pub(crate) fn insert_resource(&self, name: impl Into<String>, path: PathBuf) {
        self.0.lock().unwrap().resources.insert(name.into(), path);
    }

    pub(crate) fn insert_symbol(&self, name: String, namespace: String, symbol: Symbol) {
        self.0.lock().unwrap().symbols.insert((name, namespace), symbol);
    }

    pub(crate) fn take_symbol(&self, name: &str, namespace: &str) -> Option<Symbol> {
        self.0.lock().unwrap().symbols.remove(&(name.to_string(), namespace.to_string()))
    }

    pub(crate) fn insert_import(&self, name: String, namespace: String, value: Opaque) {
        self.0.lock().unwrap().imports.insert((name, namespace), value);
    }

    pub fn get_import(&self, name: &str, namespace: &str) -> Option<Opaque> {
        self.0.lock().unwrap().imports.get(&(name.to_string(), namespace.to_string())).cloned()
    }

    pub fn user_state(&self) -> Option<Opaque> {
        self.0.lock().unwrap().user_state.clone()
    }

    pub(crate) fn set_user_state(&self, state: Option<Opaque>) {
        self.0.lock().unwrap().user_state = state;
    }

    pub(crate) fn set_state(&self, state: LifecycleState) {
        self.0.lock().unwrap().state = state;
    }


    /// §4.C: `{None, Added, Static}`.
    pub fn query_namespace(&self, name: &str) -> NamespaceQuery {
        match self.0.lock().unwrap().namespaces.get(name) {
            None => NamespaceQuery::None,
            Some(NamespaceKind::Static) => NamespaceQuery::Static,
            Some(NamespaceKind::Dynamic) => NamespaceQuery::Added,
        }
    }

    pub(crate) fn add_namespace_kind(&self, name: &str, kind: NamespaceKind) -> Result<()> {
        let mut inner = self.0.lock().unwrap();
        if inner.namespaces.contains_key(name) {
            return Err(FulcrumError::Duplicate(format!("namespace '{name}' already present")));
        }
        inner.namespaces.insert(name.to_string(), kind);
        Ok(())
    }

    /// §4.C `add_namespace`: fails `NotPermitted` on the global (empty)
    /// namespace, `Duplicate` on re-add. Bumps the registry's namespace
    /// refcount so other instances' `namespace_import`s can see it.
    pub fn add_namespace(&self, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(FulcrumError::NotPermitted("cannot add the global namespace".into()));
        }
        self.add_namespace_kind(name, NamespaceKind::Dynamic)?;
        let registry = self.0.lock().unwrap().registry.clone();
        registry.ref_namespace(name);
        Ok(())
    }

    /// §4.C `remove_namespace`: fails `NotPermitted` on the global namespace
    /// or on a `Static` entry. Symmetric with `add_namespace`'s refcount bump.
    pub fn remove_namespace(&self, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(FulcrumError::NotPermitted("cannot remove the global namespace".into()));
        }
        let mut inner = self.0.lock().unwrap();
        match inner.namespaces.get(name) {
            None => Err(FulcrumError::NotFound(format!("namespace '{name}'"))),
            Some(NamespaceKind::Static) => Err(FulcrumError::NotPermitted(format!(
                "namespace '{name}' was declared at load time"
            ))),
            Some(NamespaceKind::Dynamic) => {
                inner.namespaces.remove(name);
                let registry = inner.registry.clone();
                drop(inner);
                registry.unref_namespace(name);
                Ok(())
            }
        }
    }

    pub fn query_dependency(&self, other: &InstanceHandle) -> DependencyQuery {
        let inner = self.0.lock().unwrap();
        match inner.dependencies.get(&other.name()) {
            None => DependencyQuery::None,
            Some((_, DependencyKind::Static)) => DependencyQuery::Static,
            Some((_, DependencyKind::Dynamic)) => DependencyQuery::Dynamic,
        }
    }

    /// Would adding `self -> target` introduce a cycle in the dependency
    /// relation? Walks forward edges from `target`, releasing each lock
    /// before acquiring the next (no global lock ordering is needed here
    /// since we only ever hold one instance lock at a time).
    fn reachable_from(start: &InstanceHandle, target: &InstanceHandle) -> bool {
        if Arc::ptr_eq(&start.0, &target.0) {
            return true;
        }
        let next: Vec<InstanceHandle> = {
            let inner = target.0.lock().unwrap();
            inner.dependencies.values().map(|(handle, _)| handle.clone()).collect()
        };
        next.iter().any(|n| Self::reachable_from(start, n))
    }

    pub(crate) fn add_dependency_kind(&self, target: &InstanceHandle, kind: DependencyKind) -> Result<()> {
        if Arc::ptr_eq(&self.0, &target.0) {
            return Err(FulcrumError::NotPermitted("an instance cannot depend on itself".into()));
        }
        if Self::reachable_from(target, self) {
            return Err(FulcrumError::CyclicDependency {
                dependent: self.name(),
                dependency: target.name(),
            });
        }
        let target_name = target.name();
        let mut inner = self.0.lock().unwrap();
        if inner.dependencies.contains_key(&target_name) {
            return Err(FulcrumError::Duplicate(format!("already depends on '{target_name}'")));
        }
        inner.dependencies.insert(target_name, (target.clone(), kind));
        drop(inner);
        target.0.lock().unwrap().dependents_count += 1;
        Ok(())
    }

    /// §4.C `add_dependency`: enforces acyclicity.
    pub fn add_dependency(&self, target: &InstanceHandle) -> Result<()> {
        self.add_dependency_kind(target, DependencyKind::Dynamic)
    }

    /// §4.C `remove_dependency`: fails `NotPermitted` on a `Static` edge.
    pub fn remove_dependency(&self, target: &InstanceHandle) -> Result<()> {
        let target_name = target.name();
        let mut inner = self.0.lock().unwrap();
        match inner.dependencies.get(&target_name) {
            None => return Err(FulcrumError::NotADependency {
                dependent: inner.name.clone(),
                dependency: target_name,
            }),
            Some((_, DependencyKind::Static)) => {
                return Err(FulcrumError::NotPermitted(format!(
                    "'{target_name}' was declared as a load-time import"
                )))
            }
            Some((_, DependencyKind::Dynamic)) => {}
        }
        inner.dependencies.remove(&target_name);
        drop(inner);
        target.unblock_unload_after_decrement();
        Ok(())
    }

    pub(crate) fn unblock_unload_after_decrement(&self) {
        let mut inner = self.0.lock().unwrap();
        inner.dependents_count = inner.dependents_count.saturating_sub(1);
        Self::unblock_unload(&mut inner);
    }

    fn unblock_unload(inner: &mut InstanceInner) {
        if inner.unload_requested && inner.strong_count == 0 && inner.dependents_count == 0 {
            if let Some(waker) = inner.unload_waiter.take() {
                waker.wake();
            }
        }
    }

    /// §4.C `load_symbol`: the owner must be a dependency, and the namespace
    /// must be imported (or the symbol must live in the global namespace).
    pub fn load_symbol(&self, owner: &InstanceHandle, name: &str, namespace: &str, required_version: Version) -> Result<Opaque> {
        let self_inner = self.0.lock().unwrap();
        if !self_inner.dependencies.contains_key(&owner.name()) {
            return Err(FulcrumError::NotADependency {
                dependent: self_inner.name.clone(),
                dependency: owner.name(),
            });
        }
        if !namespace.is_empty() && !self_inner.namespaces.contains_key(namespace) {
            return Err(FulcrumError::NotPermitted(format!("namespace '{namespace}' is not imported")));
        }
        drop(self_inner);
        let owner_inner = owner.0.lock().unwrap();
        let symbol = owner_inner
            .symbols
            .get(&(name.to_string(), namespace.to_string()))
            .ok_or_else(|| FulcrumError::NotFound(format!("symbol '{name}' in namespace '{namespace}'")))?;
        if !symbol.version.satisfies(&required_version) {
            return Err(FulcrumError::NotFound(format!(
                "symbol '{name}' v{} does not satisfy required v{}",
                symbol.version, required_version
            )));
        }
        Ok(symbol.value.clone())
    }

    /// §4.C `read_parameter`: `module` must be a dependency; access is
    /// gated at `AccessGroup::Dependency`.
    pub fn read_parameter(&self, module: &InstanceHandle, name: &str) -> Result<i64> {
        let self_inner = self.0.lock().unwrap();
        if !self_inner.dependencies.contains_key(&module.name()) {
            return Err(FulcrumError::NotADependency {
                dependent: self_inner.name.clone(),
                dependency: module.name(),
            });
        }
        drop(self_inner);
        let module_inner = module.0.lock().unwrap();
        let parameter = module_inner
            .parameters
            .get(name)
            .ok_or_else(|| FulcrumError::NotFound(format!("parameter '{name}'")))?;
        parameter.read(AccessGroup::Dependency)
    }

    /// §4.C `write_parameter`: same dependency requirement as `read_parameter`.
    pub fn write_parameter(&self, module: &InstanceHandle, name: &str, value: i64) -> Result<()> {
        let self_inner = self.0.lock().unwrap();
        if !self_inner.dependencies.contains_key(&module.name()) {
            return Err(FulcrumError::NotADependency {
                dependent: self_inner.name.clone(),
                dependency: module.name(),
            });
        }
        drop(self_inner);
        let module_inner = module.0.lock().unwrap();
        let parameter = module_inner
            .parameters
            .get(name)
            .ok_or_else(|| FulcrumError::NotFound(format!("parameter '{name}'")))?;
        parameter.write(AccessGroup::Dependency, value)
    }

    pub(crate) fn own_parameter(&self, name: &str) -> Option<Arc<Parameter>> {
        self.0.lock().unwrap().parameters.get(name).cloned()
    }

    /// External reference pin; `canUnload` requires this to reach zero.
    pub fn ref_strong(&self) {
        self.0.lock().unwrap().strong_count += 1;
    }

    pub fn unref_strong(&self) {
        let mut inner = self.0.lock().unwrap();
        inner.strong_count = inner.strong_count.saturating_sub(1);
        Self::unblock_unload(&mut inner);
    }

    /// §4.C `enqueueUnload`: idempotent — a no-op if already unloading or
    /// detached. Spawning the actual `EnqueueUnloadOp` future is the
    /// caller's responsibility (see `crate::unload_op`); this only flips the
    /// flag and reports whether the caller should proceed.
    pub(crate) fn mark_unload_requested(&self) -> bool {
        let mut inner = self.0.lock().unwrap();
        if inner.is_detached || inner.unload_requested {
            return false;
        }
        inner.unload_requested = true;
        true
    }

    pub(crate) fn is_detached_or_can_unload(&self) -> (bool, bool) {
        let inner = self.0.lock().unwrap();
        (inner.is_detached, inner.strong_count == 0 && inner.dependents_count == 0)
    }

    pub(crate) fn install_unload_waiter(&self, waker: Waker) {
        self.0.lock().unwrap().unload_waiter = Some(waker);
    }

    /// §4.C `Started → Init` transition driven by `stop`. Caller must have
    /// already released the registry lock; this releases the instance lock
    /// for the duration of the user poll to allow re-entrancy.
    pub(crate) async fn stop(&self, export: &ModuleExport) -> Result<()> {
        {
            let mut inner = self.0.lock().unwrap();
            if inner.state != LifecycleState::Started {
                return Ok(());
            }
            inner.is_detached = true;
        }
        if let Some(hook) = &export.stop {
            debug!(instance = %self.name(), "running stop poll");
            hook.call(self.clone()).await?;
        }
        let mut inner = self.0.lock().unwrap();
        inner.is_detached = false;
        inner.state = LifecycleState::Init;
        Ok(())
    }

    /// Unwind of `InitExportedOp` (§4.F) after a mid-pipeline failure. The
    /// instance never left `Uninit`, so this is a narrower version of
    /// `detach` that skips the `deinit` poll and the `canUnload`/`Started`
    /// assertions. Returns the namespaces and dependencies the caller must
    /// release in the registry / on the dependency instances.
    pub(crate) fn rollback_uninit(&self) -> (Vec<String>, Vec<InstanceHandle>) {
        let mut inner = self.0.lock().unwrap();
        inner.parameters.clear();
        inner.resources.clear();
        inner.imports.clear();
        inner.symbols.clear();
        let namespaces: Vec<String> = inner.namespaces.drain().map(|(name, _)| name).collect();
        let dependencies: Vec<InstanceHandle> = inner.dependencies.drain().map(|(_, (handle, _))| handle).collect();
        inner.module_handle = None;
        inner.strong_count = inner.strong_count.saturating_sub(1);
        inner.is_detached = true;
        (namespaces, dependencies)
    }

    /// §4.C `detach`: asserts `canUnload` and `state != Started`; runs
    /// `deinit`, destructs exports in reverse order, clears every table.
    pub(crate) async fn detach(&self, export: &ModuleExport) -> Result<()> {
        {
            let inner = self.0.lock().unwrap();
            if inner.state == LifecycleState::Started {
                return Err(FulcrumError::OperationFailed(format!(
                    "cannot detach '{}' while Started",
                    inner.name
                )));
            }
            if !(inner.strong_count == 0 && inner.dependents_count == 0) {
                return Err(FulcrumError::NotPermitted(format!(
                    "cannot detach '{}': still referenced",
                    inner.name
                )));
            }
        }
        if let Some(hook) = &export.deinit {
            debug!(instance = %self.name(), "running deinit poll");
            hook.call(self.clone()).await?;
        }

        let symbols: Vec<((String, String), Symbol)> = {
            let mut inner = self.0.lock().unwrap();
            inner.symbols.drain().collect()
        };
        for ((name, namespace), symbol) in symbols.into_iter().rev() {
            let export_decl = export
                .symbol_exports
                .iter()
                .find(|decl| decl.name() == name && decl.namespace() == namespace);
            if let Some(crate::export::SymbolExportDecl::Dynamic {
                destructor: Some(destructor),
                ..
            }) = export_decl
            {
                if let Err(err) = destructor.destruct(self.clone(), symbol.value).await {
                    warn!(instance = %self.name(), error = %err, "symbol destructor failed during detach");
                }
            }
        }

        let mut inner = self.0.lock().unwrap();
        inner.parameters.clear();
        inner.resources.clear();
        let dynamic_namespaces: Vec<String> = inner
            .namespaces
            .iter()
            .filter(|(_, kind)| **kind == NamespaceKind::Dynamic)
            .map(|(name, _)| name.clone())
            .collect();
        inner.namespaces.clear();
        inner.imports.clear();
        let dependencies: Vec<InstanceHandle> = inner.dependencies.drain().map(|(_, (handle, _))| handle).collect();
        inner.module_handle = None;
        inner.user_state = None;
        inner.is_detached = true;
        let registry = inner.registry.clone();
        drop(inner);
        for name in &dynamic_namespaces {
            registry.unref_namespace(name);
        }
        for dependency in dependencies {
            dependency.unblock_unload_after_decrement();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::ModuleExport;
    use crate::module_handle::StaticModuleHandle;

    fn handle(name: &str) -> InstanceHandle {
        let export = ModuleExport::builder(name, Version::new(1, 0, 0)).build();
        let module_handle: Box<dyn crate::module_handle::ModuleHandle> =
            Box::new(StaticModuleHandle::new(format!("/{name}.so"), vec![]));
        InstanceHandle::allocate(&export, Arc::new(module_handle), Registry::new())
    }

    #[test]
    fn add_then_remove_namespace_round_trips() {
        let a = handle("a");
        a.add_namespace("net").unwrap();
        assert_eq!(a.query_namespace("net"), NamespaceQuery::Added);
        a.remove_namespace("net").unwrap();
        assert_eq!(a.query_namespace("net"), NamespaceQuery::None);
    }

    #[test]
    fn add_namespace_rejects_global_namespace() {
        let a = handle("a");
        assert!(a.add_namespace("").is_err());
    }

    #[test]
    fn add_dependency_then_remove_leaves_dependents_count_unchanged() {
        let a = handle("a");
        let b = handle("b");
        a.add_dependency(&b).unwrap();
        assert_eq!(b.dependents_count(), 1);
        a.remove_dependency(&b).unwrap();
        assert_eq!(b.dependents_count(), 0);
    }

    #[test]
    fn adding_a_cyclic_dependency_is_rejected() {
        let a = handle("a");
        let b = handle("b");
        a.add_dependency(&b).unwrap();
        let err = b.add_dependency(&a).unwrap_err();
        assert!(matches!(err, FulcrumError::CyclicDependency { .. }));
    }

    #[test]
    fn can_unload_reflects_strong_and_dependents_counts() {
        let a = handle("a");
        a.unref_strong(); // allocate() starts at strong_count = 1
        assert!(a.can_unload());
        a.ref_strong();
        assert!(!a.can_unload());
    }
}

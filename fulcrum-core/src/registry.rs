//! Process-wide instance registry (§3, §4.B).
//!
//! One mutex-guarded table, the same shape as the teacher's
//! `ConcurrentExecutorRegistry` (`executor/mod.rs`) — a `RwLock`/`Mutex`
//! around a `HashMap`, generalized here to also carry the symbol index,
//! namespace refcounts, and the single serial `Idle`/`LoadingSet` flag that
//! orders concurrent commits.

use std::collections::{HashMap, VecDeque};
use std::future::poll_fn;
use std::sync::{Arc, Mutex};
use std::task::{Poll, Waker};

use tracing::info;

use crate::error::{FulcrumError, Result};
use crate::export::ModuleExport;
use crate::instance::{DependencyKind, InstanceHandle};
use crate::version::Version;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GlobalState {
    Idle,
    LoadingSet,
}

struct RegistryInner {
    instances: HashMap<String, InstanceHandle>,
    /// `(name, namespace) -> [(version, owner)]`, kept sorted ascending by
    /// version so "highest compatible" is a reverse scan.
    symbols: HashMap<(String, String), Vec<(Version, String)>>,
    namespace_refcounts: HashMap<String, usize>,
    state: GlobalState,
    waiters: VecDeque<Waker>,
}

/// The process-wide table of loaded instances. Cheap to clone; every clone
/// shares the same underlying lock.
#[derive(Clone)]
pub struct Registry(Arc<Mutex<RegistryInner>>);

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Registry(Arc::new(Mutex::new(RegistryInner {
            instances: HashMap::new(),
            symbols: HashMap::new(),
            namespace_refcounts: HashMap::new(),
            state: GlobalState::Idle,
            waiters: VecDeque::new(),
        })))
    }

    /// §4.B `add_instance`: asserts name uniqueness, indexes every exported
    /// symbol (rejecting a duplicate `(name, namespace)` regardless of
    /// version), bumps `namespace_refcounts` for every imported namespace.
    pub(crate) fn add_instance(&self, handle: &InstanceHandle, export: &ModuleExport) -> Result<()> {
        let mut inner = self.0.lock().unwrap();
        let name = handle.name();
        if inner.instances.contains_key(&name) {
            return Err(FulcrumError::Duplicate(format!("instance '{name}' already registered")));
        }
        for decl in &export.symbol_exports {
            let key = (decl.name().to_string(), decl.namespace().to_string());
            if inner.symbols.contains_key(&key) {
                return Err(FulcrumError::Duplicate(format!(
                    "symbol '{}' in namespace '{}' already exported",
                    decl.name(),
                    decl.namespace()
                )));
            }
        }
        for decl in &export.symbol_exports {
            let key = (decl.name().to_string(), decl.namespace().to_string());
            inner.symbols.insert(key, vec![(decl.version(), name.clone())]);
        }
        for import in &export.namespace_imports {
            *inner.namespace_refcounts.entry(import.namespace.clone()).or_insert(0) += 1;
        }
        info!(instance = %name, "instance registered");
        inner.instances.insert(name, handle.clone());
        Ok(())
    }

    /// §4.B `remove_instance`: symmetric. Must be called with the instance
    /// already detached from its dependencies.
    pub(crate) fn remove_instance(&self, handle: &InstanceHandle, export: &ModuleExport) {
        let mut inner = self.0.lock().unwrap();
        let name = handle.name();
        inner.instances.remove(&name);
        for decl in &export.symbol_exports {
            let key = (decl.name().to_string(), decl.namespace().to_string());
            inner.symbols.remove(&key);
        }
        for import in &export.namespace_imports {
            if let Some(count) = inner.namespace_refcounts.get_mut(&import.namespace) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    inner.namespace_refcounts.remove(&import.namespace);
                }
            }
        }
        info!(instance = %name, "instance removed");
    }

    /// §4.B `link_instances`: edge `dependent -> dependency` after checking
    /// not-same-instance, acyclicity, and both sides alive. "Alive" here
    /// means not yet detached — a dependent may link to a dependency before
    /// either has been published into the registry's instance table, which
    /// happens only once the dependent itself reaches `Started` (§4.E S4).
    pub(crate) fn link_instances(&self, dependent: &InstanceHandle, dependency: &InstanceHandle) -> Result<()> {
        if dependent.is_detached() || dependency.is_detached() {
            return Err(FulcrumError::Detached(dependency.name()));
        }
        dependent.add_dependency_kind(dependency, DependencyKind::Static)
    }

    /// §4.B `unlink_instances`: symmetric; also attempts to unblock a
    /// pending unload on `dependency`.
    pub(crate) fn unlink_instances(&self, dependent: &InstanceHandle, dependency: &InstanceHandle) -> Result<()> {
        dependent.remove_dependency(dependency)
    }

    /// §4.B `get_symbol_compatible`: returns the highest version satisfying
    /// `required_version`.
    pub fn get_symbol_compatible(&self, name: &str, namespace: &str, required_version: Version) -> Option<(InstanceHandle, Version)> {
        let inner = self.0.lock().unwrap();
        let candidates = inner.symbols.get(&(name.to_string(), namespace.to_string()))?;
        let (version, owner) = candidates
            .iter()
            .rev()
            .find(|(version, _)| version.satisfies(&required_version))?;
        let handle = inner.instances.get(owner)?.clone();
        Some((handle, *version))
    }

    pub(crate) fn has_compatible_symbol(&self, name: &str, namespace: &str, required_version: Version) -> bool {
        self.get_symbol_compatible(name, namespace, required_version).is_some()
    }

    pub(crate) fn has_instance(&self, name: &str) -> bool {
        self.0.lock().unwrap().instances.contains_key(name)
    }

    pub(crate) fn symbol_conflicts(&self, name: &str, namespace: &str) -> bool {
        self.0.lock().unwrap().symbols.contains_key(&(name.to_string(), namespace.to_string()))
    }

    pub fn ref_namespace(&self, name: &str) {
        let mut inner = self.0.lock().unwrap();
        *inner.namespace_refcounts.entry(name.to_string()).or_insert(0) += 1;
    }

    pub fn unref_namespace(&self, name: &str) {
        let mut inner = self.0.lock().unwrap();
        if let Some(count) = inner.namespace_refcounts.get_mut(name) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                inner.namespace_refcounts.remove(name);
            }
        }
    }

    pub fn namespace_exists(&self, name: &str) -> bool {
        if name.is_empty() {
            return true;
        }
        self.0.lock().unwrap().namespace_refcounts.contains_key(name)
    }

    pub fn instance(&self, name: &str) -> Option<InstanceHandle> {
        self.0.lock().unwrap().instances.get(name).cloned()
    }

    /// Enter the `LoadingSet` global state, queueing behind any commit
    /// already in flight (§4.E CommitOp S0, §5 serialization guarantee).
    pub(crate) async fn acquire_loading_set_lock(&self) {
        poll_fn(|cx| {
            let mut inner = self.0.lock().unwrap();
            if inner.state == GlobalState::Idle {
                inner.state = GlobalState::LoadingSet;
                Poll::Ready(())
            } else {
                inner.waiters.push_back(cx.waker().clone());
                Poll::Pending
            }
        })
        .await
    }

    /// CommitOp `Unwind`: restore `Idle`, wake exactly one queued waiter.
    pub(crate) fn release_loading_set_lock(&self) {
        let mut inner = self.0.lock().unwrap();
        inner.state = GlobalState::Idle;
        if let Some(waker) = inner.waiters.pop_front() {
            waker.wake();
        }
    }
}

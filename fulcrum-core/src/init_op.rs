//! `InitExportedOp` and `StartInstanceOp` (§4.F) — the async pipeline that
//! turns a validated module export into a live, `Started` instance.
//!
//! Written as plain `async fn`s rather than hand-numbered state structs:
//! §9's design notes explicitly accept "stackless coroutines compiled from
//! linear code" as an equivalent to the source's `__unwindN` state machine,
//! provided rollback on failure still only unwinds the steps that
//! completed — which the early-return-plus-rollback shape below preserves.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{FulcrumError, Result};
use crate::export::{ModuleExport, SymbolExportDecl};
use crate::instance::{DependencyQuery, InstanceHandle, NamespaceKind, Symbol};
use crate::module_handle::ModuleHandle;
use crate::parameter::Parameter;
use crate::registry::Registry;

type SharedModuleHandle = Arc<Box<dyn ModuleHandle>>;

/// Steps 1–8 of §4.F. On any failure, unwinds the steps that had already
/// completed and returns the error.
pub(crate) async fn init_exported_op(registry: &Registry, module_handle: SharedModuleHandle, export: ModuleExport) -> Result<InstanceHandle> {
    // 1. Allocate handle and inner (strong_count starts at 1).
    let instance = InstanceHandle::allocate(&export, module_handle, registry.clone());

    // 2. Parameters.
    for decl in &export.parameters {
        let parameter = Arc::new(Parameter::new(decl.name.clone(), decl.ty, decl.default, decl.read_group, decl.write_group));
        instance.insert_parameter(decl.name.clone(), parameter);
    }

    // 3. Resources.
    for decl in &export.resources {
        let path = instance.module_path().join(&decl.relative_path);
        instance.insert_resource(decl.name.clone(), path);
    }

    // 4. Namespaces.
    for import in &export.namespace_imports {
        if !registry.namespace_exists(&import.namespace) {
            warn!(instance = %instance.name(), namespace = %import.namespace, "namespace import not found, unwinding init");
            rollback(&instance);
            return Err(FulcrumError::NotFound(format!("namespace '{}'", import.namespace)));
        }
        instance
            .add_namespace_kind(&import.namespace, NamespaceKind::Static)
            .expect("namespace import was validated as non-empty and not yet present");
        // `registry.add_instance` (step 4.B) is the sole place that bumps the
        // namespace refcount for a Static import, once this instance actually
        // gets published; refcounting it here too would double-count it.
    }

    // 5. Imports.
    for symbol_import in &export.symbol_imports {
        let Some((owner, version)) = registry.get_symbol_compatible(&symbol_import.name, &symbol_import.namespace, symbol_import.required_version)
        else {
            warn!(instance = %instance.name(), symbol = %symbol_import.name, "symbol import unresolved, unwinding init");
            rollback(&instance);
            return Err(FulcrumError::NotFound(format!(
                "symbol '{}' in namespace '{}'",
                symbol_import.name, symbol_import.namespace
            )));
        };
        if instance.query_dependency(&owner) == DependencyQuery::None {
            if let Err(err) = registry.link_instances(&instance, &owner) {
                rollback(&instance);
                return Err(err);
            }
        }
        let value = instance.load_symbol(&owner, &symbol_import.name, &symbol_import.namespace, version)?;
        instance.insert_import(symbol_import.name.clone(), symbol_import.namespace.clone(), value);
    }

    // 6. User init.
    if let Some(hook) = &export.init {
        debug!(instance = %instance.name(), "running init poll");
        match hook.call(instance.clone()).await {
            Ok(state) => instance.set_user_state(state),
            Err(err) => {
                warn!(instance = %instance.name(), error = %err, "init poll failed, unwinding");
                rollback(&instance);
                return Err(err);
            }
        }
    }

    // 7. Exports.
    let mut constructed: Vec<(String, String)> = Vec::new();
    for decl in &export.symbol_exports {
        let result = match decl {
            SymbolExportDecl::Static { value, .. } => Ok(value.clone()),
            SymbolExportDecl::Dynamic { constructor, .. } => constructor.construct(instance.clone()).await,
        };
        match result {
            Ok(value) => {
                instance.insert_symbol(
                    decl.name().to_string(),
                    decl.namespace().to_string(),
                    Symbol {
                        version: decl.version(),
                        value,
                    },
                );
                constructed.push((decl.name().to_string(), decl.namespace().to_string()));
            }
            Err(err) => {
                warn!(instance = %instance.name(), symbol = %decl.name(), error = %err, "export construction failed, unwinding");
                rollback_exports(&export, &instance, &constructed).await;
                rollback(&instance);
                return Err(err);
            }
        }
    }

    // 8. Finalization.
    instance.set_state(crate::instance::LifecycleState::Init);
    Ok(instance)
}

async fn rollback_exports(export: &ModuleExport, instance: &InstanceHandle, constructed: &[(String, String)]) {
    for (name, namespace) in constructed.iter().rev() {
        let Some(symbol) = instance.take_symbol(name, namespace) else { continue };
        let decl = export
            .symbol_exports
            .iter()
            .find(|decl| decl.name() == name && decl.namespace() == namespace);
        if let Some(SymbolExportDecl::Dynamic { destructor: Some(destructor), .. }) = decl {
            if let Err(err) = destructor.destruct(instance.clone(), symbol.value).await {
                warn!(instance = %instance.name(), symbol = %name, error = %err, "destructor failed during unwind");
            }
        }
    }
}

fn rollback(instance: &InstanceHandle) {
    // Step 4's namespace imports were never registry-refcounted (that only
    // happens once `registry.add_instance` publishes the instance), so
    // unwinding here has nothing to unref for them.
    let (_namespaces, dependencies) = instance.rollback_uninit();
    for dependency in dependencies {
        dependency.unblock_unload_after_decrement();
    }
}

/// §4.F `StartInstanceOp`.
pub(crate) async fn start_instance_op(instance: &InstanceHandle, export: &ModuleExport) -> Result<()> {
    if let Some(hook) = &export.start {
        debug!(instance = %instance.name(), "running start poll");
        hook.call(instance.clone()).await?;
    }
    instance.set_state(crate::instance::LifecycleState::Started);
    Ok(())
}

//! Load graph, `CommitOp`, and `LoadOp` (§4.E) — resolves the dependency DAG
//! over a loading set's pending modules and drives each to `Loaded` or
//! `Err`.

use std::collections::{HashMap, HashSet};
use std::future::poll_fn;
use std::task::Poll;

use tracing::{info_span, warn};

use crate::error::Result;
use crate::loading_set::{validate_export, LoadingSet, PollStatus};
use crate::registry::Registry;

/// Edges recorded as `importer -> [in-set producers it depends on]`.
struct LoadGraph {
    edges: HashMap<String, Vec<String>>,
}

/// §4.E `spawn_missing_tasks`'s three skip-rather-than-fail checks, plus
/// cycle detection over the resulting edge set.
fn build_graph(set: &LoadingSet, registry: &Registry) -> LoadGraph {
    let pending = set.pending_names();
    let pending_set: HashSet<String> = pending.iter().cloned().collect();
    let mut edges: HashMap<String, Vec<String>> = HashMap::new();

    for name in &pending {
        let export = match set.export_of(name) {
            Some(export) => export,
            None => continue,
        };

        // Check 1: no instance with the same name already registered.
        if registry.has_instance(name) {
            warn!(module = %name, "skipping: an instance with this name already exists");
            set.signal_error(name);
            continue;
        }

        // Check 3: no exported symbol conflicts with an already-loaded
        // registry symbol.
        let conflicts = export
            .symbol_exports
            .iter()
            .any(|decl| registry.symbol_conflicts(decl.name(), decl.namespace()));
        if conflicts {
            warn!(module = %name, "skipping: exported symbol already present in the registry");
            set.signal_error(name);
            continue;
        }

        // Check 2: every symbol import resolves in-set or in the registry.
        let mut deps = Vec::new();
        let mut unresolved = false;
        for symbol_import in &export.symbol_imports {
            if let Some(producer) = pending.iter().find(|other| {
                *other != name
                    && set
                        .export_of(other)
                        .map(|e| {
                            e.symbol_exports
                                .iter()
                                .any(|decl| decl.name() == symbol_import.name && decl.namespace() == symbol_import.namespace)
                        })
                        .unwrap_or(false)
            }) {
                if set.status_is_err(producer) {
                    unresolved = true;
                    break;
                }
                deps.push(producer.clone());
                continue;
            }
            if registry.has_compatible_symbol(&symbol_import.name, &symbol_import.namespace, symbol_import.required_version) {
                continue;
            }
            unresolved = true;
            break;
        }
        if unresolved {
            warn!(module = %name, "skipping: a symbol import could not be resolved");
            set.signal_error(name);
            continue;
        }

        edges.insert(name.clone(), deps);
    }

    let cyclic = find_cycles(&edges);
    for name in &cyclic {
        warn!(module = %name, "skipping: part of a dependency cycle");
        set.signal_error(name);
        edges.remove(name);
    }
    for deps in edges.values_mut() {
        deps.retain(|d| !cyclic.contains(d) && pending_set.contains(d));
    }

    LoadGraph { edges }
}

fn find_cycles(edges: &HashMap<String, Vec<String>>) -> HashSet<String> {
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Mark {
        Visiting,
        Done,
    }
    let mut marks: HashMap<&str, Mark> = HashMap::new();
    let mut cyclic = HashSet::new();

    fn visit<'a>(
        node: &'a str,
        edges: &'a HashMap<String, Vec<String>>,
        marks: &mut HashMap<&'a str, Mark>,
        stack: &mut Vec<&'a str>,
        cyclic: &mut HashSet<String>,
    ) {
        if let Some(Mark::Done) = marks.get(node) {
            return;
        }
        if marks.get(node) == Some(&Mark::Visiting) {
            if let Some(pos) = stack.iter().position(|n| *n == node) {
                for n in &stack[pos..] {
                    cyclic.insert(n.to_string());
                }
            }
            cyclic.insert(node.to_string());
            return;
        }
        marks.insert(node, Mark::Visiting);
        stack.push(node);
        if let Some(deps) = edges.get(node) {
            for dep in deps {
                visit(dep, edges, marks, stack, cyclic);
            }
        }
        stack.pop();
        marks.insert(node, Mark::Done);
    }

    let mut stack = Vec::new();
    for node in edges.keys() {
        visit(node, edges, &mut marks, &mut stack, &mut cyclic);
    }
    cyclic
}

async fn wait_for_resolution(set: &LoadingSet, name: &str) -> bool {
    poll_fn(|cx| match set.poll_module_status(name, cx.waker()) {
        PollStatus::Pending => Poll::Pending,
        PollStatus::Resolved { instance, .. } => Poll::Ready(instance.is_some()),
        PollStatus::NotFound => Poll::Ready(false),
    })
    .await
}

/// §4.E `LoadOp`, S0–S4, for one module.
async fn load_op(set: LoadingSet, registry: Registry, name: String, dependencies: Vec<String>) {
    let span = info_span!("load_op", module = %name);
    let _enter = span.enter();

    for dependency in &dependencies {
        if !wait_for_resolution(&set, dependency).await {
            set.signal_error(&name);
            return;
        }
    }

    let Some(export) = set.export_of(&name) else { return };
    let Some(module_handle) = set.module_handle(&name) else {
        set.signal_error(&name);
        return;
    };

    let instance = match crate::init_op::init_exported_op(&registry, module_handle, export.clone()).await {
        Ok(instance) => instance,
        Err(err) => {
            warn!(module = %name, error = %err, "instance init failed");
            set.signal_error(&name);
            return;
        }
    };

    if let Err(err) = crate::init_op::start_instance_op(&instance, &export).await {
        warn!(module = %name, error = %err, "instance start failed");
        let _ = instance.detach(&export).await;
        set.signal_error(&name);
        return;
    }

    if let Err(err) = registry.add_instance(&instance, &export) {
        warn!(module = %name, error = %err, "registering instance failed");
        set.signal_error(&name);
        return;
    }

    set.signal_success(&name, instance);
}

async fn join_all(handles: Vec<crate::executor::JoinHandle<()>>) {
    for handle in handles {
        handle.await;
    }
}

/// §4.E `CommitOp`: S0 (acquire serial lock), S1 (spawn + wait), Unwind
/// (release the serial lock, waking the next queued commit).
pub(crate) async fn commit_op(set: LoadingSet) -> Result<()> {
    set.registry.acquire_loading_set_lock().await;
    set.enter_commit();

    let config = &set.config;
    for name in set.pending_names() {
        if let Some(export) = set.export_of(&name) {
            if let Err(err) = validate_export(&export, config) {
                warn!(module = %name, error = %err, "export failed validation at commit time");
                set.signal_error(&name);
            }
        }
    }

    if config.fail_fast && set.has_any_err() {
        warn!("fail_fast set and at least one module failed validation, aborting the rest of the batch");
        for name in set.pending_names() {
            set.signal_error(&name);
        }
    } else {
        let graph = build_graph(&set, &set.registry);
        let mut handles = Vec::new();
        for (name, deps) in graph.edges {
            let executor = set.executor.clone();
            let task_set = set.clone();
            let registry = set.registry.clone();
            handles.push(executor.enqueue(load_op(task_set, registry, name, deps)));
        }
        join_all(handles).await;
    }

    set.exit_commit();
    set.registry.release_loading_set_lock();
    Ok(())
}

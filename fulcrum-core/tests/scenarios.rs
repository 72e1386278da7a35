//! End-to-end scenarios (§8) driven entirely through the public API.

use std::sync::{Arc, Mutex};

use fulcrum_core::{Config, Context, ModuleExport, ModuleStatusEvent, StaticModuleHandle, Version};

fn v1() -> Version {
    Version::new(1, 0, 0)
}

fn status_log() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> Box<dyn FnMut(ModuleStatusEvent) + Send>) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let make = {
        let log = log.clone();
        move |name: &str| -> Box<dyn FnMut(ModuleStatusEvent) + Send> {
            let log = log.clone();
            let name = name.to_string();
            Box::new(move |event| {
                let outcome = match event {
                    ModuleStatusEvent::Success(_) => "Success",
                    ModuleStatusEvent::Error(_) => "Error",
                    ModuleStatusEvent::Abort => "Abort",
                };
                log.lock().unwrap().push(format!("{name}:{outcome}"));
            })
        }
    };
    (log, make)
}

#[test]
fn scenario_1_trivial_load() {
    let context = Context::new(Config::default());
    let loading_set = context.new_loading_set();

    let export = ModuleExport::builder("M1", v1())
        .static_export("S1", "", v1(), Arc::new(()))
        .build();
    loading_set
        .add_modules_from_local(Box::new(StaticModuleHandle::new("/m1", vec![export])), context.config(), |_| true)
        .unwrap();
    context.block_on(loading_set.commit()).unwrap();

    let (instance, _) = context
        .registry()
        .get_symbol_compatible("S1", "", v1())
        .expect("S1 should resolve");
    assert_eq!(instance.name(), "M1");
    assert_eq!(instance.state(), fulcrum_core::instance::LifecycleState::Started);

    context.shutdown();
}

#[test]
fn scenario_2_linear_chain_loads_regardless_of_submission_order() {
    let context = Context::new(Config::default());
    let loading_set = context.new_loading_set();

    let a = ModuleExport::builder("A", v1()).static_export("a", "", v1(), Arc::new(())).build();
    let b = ModuleExport::builder("B", v1())
        .symbol_import("a", "", v1())
        .static_export("b", "", v1(), Arc::new(()))
        .build();
    let c = ModuleExport::builder("C", v1()).symbol_import("b", "", v1()).build();

    // Submitted in order C, A, B; the load graph must still resolve A -> B -> C.
    loading_set
        .add_modules_from_local(Box::new(StaticModuleHandle::new("/set", vec![c, a, b])), context.config(), |_| true)
        .unwrap();
    context.block_on(loading_set.commit()).unwrap();

    let a_instance = context.registry().instance("A").expect("A loaded");
    let b_instance = context.registry().instance("B").expect("B loaded");
    let c_instance = context.registry().instance("C").expect("C loaded");

    assert_eq!(c_instance.query_dependency(&b_instance), fulcrum_core::instance::DependencyQuery::Static);
    assert_eq!(b_instance.query_dependency(&a_instance), fulcrum_core::instance::DependencyQuery::Static);

    context.shutdown();
}

#[test]
fn scenario_3_missing_dependency_marks_module_err() {
    let context = Context::new(Config::default());
    let loading_set = context.new_loading_set();
    let (log, make_callback) = status_log();

    let b = ModuleExport::builder("B", v1()).symbol_import("a", "", v1()).build();
    loading_set.on_status("B", make_callback("B"));
    loading_set
        .add_modules_from_local(Box::new(StaticModuleHandle::new("/set", vec![b])), context.config(), |_| true)
        .unwrap();
    context.block_on(loading_set.commit()).unwrap();

    assert!(context.registry().instance("B").is_none());
    assert_eq!(log.lock().unwrap().as_slice(), ["B:Error"]);

    context.shutdown();
}

#[test]
fn scenario_4_cyclic_dependency_marks_both_err() {
    let context = Context::new(Config::default());
    let loading_set = context.new_loading_set();
    let (log, make_callback) = status_log();

    let a = ModuleExport::builder("A", v1())
        .symbol_import("b", "", v1())
        .static_export("a", "", v1(), Arc::new(()))
        .build();
    let b = ModuleExport::builder("B", v1())
        .symbol_import("a", "", v1())
        .static_export("b", "", v1(), Arc::new(()))
        .build();

    loading_set.on_status("A", make_callback("A"));
    loading_set.on_status("B", make_callback("B"));
    loading_set
        .add_modules_from_local(Box::new(StaticModuleHandle::new("/set", vec![a, b])), context.config(), |_| true)
        .unwrap();
    context.block_on(loading_set.commit()).unwrap();

    assert!(context.registry().instance("A").is_none());
    assert!(context.registry().instance("B").is_none());
    let mut outcomes = log.lock().unwrap().clone();
    outcomes.sort();
    assert_eq!(outcomes, ["A:Error", "B:Error"]);

    context.shutdown();
}

#[test]
fn scenario_5_duplicate_symbol_marks_newcomer_err() {
    let context = Context::new(Config::default());

    let first_set = context.new_loading_set();
    let m1 = ModuleExport::builder("M1", v1()).static_export("S1", "", v1(), Arc::new(())).build();
    first_set
        .add_modules_from_local(Box::new(StaticModuleHandle::new("/m1", vec![m1])), context.config(), |_| true)
        .unwrap();
    context.block_on(first_set.commit()).unwrap();

    let second_set = context.new_loading_set();
    let (log, make_callback) = status_log();
    let m2 = ModuleExport::builder("M2", v1()).static_export("S1", "", v1(), Arc::new(())).build();
    second_set.on_status("M2", make_callback("M2"));
    second_set
        .add_modules_from_local(Box::new(StaticModuleHandle::new("/m2", vec![m2])), context.config(), |_| true)
        .unwrap();
    context.block_on(second_set.commit()).unwrap();

    assert!(context.registry().instance("M2").is_none());
    assert_eq!(log.lock().unwrap().as_slice(), ["M2:Error"]);

    context.shutdown();
}

#[test]
fn scenario_6_unload_gating_waits_for_dependents() {
    let context = Context::new(Config::default());
    let loading_set = context.new_loading_set();

    let a_export = ModuleExport::builder("A", v1()).static_export("s", "", v1(), Arc::new(())).build();
    let b_export = ModuleExport::builder("B", v1()).symbol_import("s", "", v1()).build();
    loading_set
        .add_modules_from_local(
            Box::new(StaticModuleHandle::new("/set", vec![a_export.clone(), b_export.clone()])),
            context.config(),
            |_| true,
        )
        .unwrap();
    context.block_on(loading_set.commit()).unwrap();

    let a_instance = context.registry().instance("A").expect("A loaded");
    let b_instance = context.registry().instance("B").expect("B loaded");

    // A has a live dependent (B), so it cannot unload yet.
    assert!(!a_instance.can_unload());

    let registry = context.registry().clone();
    context
        .block_on(fulcrum_core::unload_op::enqueue_unload_op(registry.clone(), b_instance.clone(), b_export))
        .unwrap();
    assert!(context.registry().instance("B").is_none());

    // With B gone, A's dependents_count has dropped to zero.
    assert!(a_instance.can_unload());
    context
        .block_on(fulcrum_core::unload_op::enqueue_unload_op(registry, a_instance, a_export))
        .unwrap();
    assert!(context.registry().instance("A").is_none());

    context.shutdown();
}

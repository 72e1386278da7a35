//! Fulcrum demo binary — builds a `Context`, stages a trivial module
//! export, commits it, and reports the result.

use std::sync::Arc;

use anyhow::Result;
use fulcrum_core::{Config, Context, ModuleExport, ModuleStatusEvent, StaticModuleHandle, Version};
use tracing::info;

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(tracing::Level::INFO).init();

    info!("starting fulcrumd v{}", env!("CARGO_PKG_VERSION"));

    let context = Context::new(Config::default());
    let loading_set = context.new_loading_set();

    let export = ModuleExport::builder("greeter", Version::new(1, 0, 0))
        .description("demo module exporting a single static symbol")
        .static_export("hello", "", Version::new(1, 0, 0), Arc::new("world".to_string()))
        .build();
    let module_handle = StaticModuleHandle::new("/modules/greeter", vec![export]);

    loading_set.on_status("greeter", |event| match event {
        ModuleStatusEvent::Success(instance) => info!(instance = %instance.name(), "module loaded"),
        ModuleStatusEvent::Error(export) => info!(module = %export.name, "module failed to load"),
        ModuleStatusEvent::Abort => info!("commit aborted before module resolved"),
    });

    loading_set.add_modules_from_local(Box::new(module_handle), context.config(), |_| true)?;
    context.block_on(loading_set.commit())?;

    if let Some((instance, _version)) = context.registry().get_symbol_compatible("hello", "", Version::new(1, 0, 0)) {
        info!(instance = %instance.name(), "resolved symbol 'hello'");
    }

    context.shutdown();
    Ok(())
}

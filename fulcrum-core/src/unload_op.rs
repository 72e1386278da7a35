//! `EnqueueUnloadOp` (§4.G) — waits for an instance to become quiescent,
//! then tears it down.

use std::future::poll_fn;
use std::task::Poll;

use tracing::info;

use crate::error::Result;
use crate::export::ModuleExport;
use crate::instance::InstanceHandle;
use crate::registry::Registry;

/// §4.C `enqueueUnload`: idempotent. Returns immediately if the instance is
/// already detached or already has an unload in flight; otherwise spawns
/// the S0/S1 pipeline below onto the caller's executor.
pub async fn enqueue_unload_op(registry: Registry, instance: InstanceHandle, export: ModuleExport) -> Result<()> {
    if !instance.mark_unload_requested() {
        return Ok(());
    }

    // S0: wait until the instance is quiescent (no strong refs, no
    // dependents) or discover it was detached out from under us.
    let should_unload = poll_fn(|cx| {
        let (is_detached, can_unload) = instance.is_detached_or_can_unload();
        if is_detached {
            return Poll::Ready(false);
        }
        if can_unload {
            return Poll::Ready(true);
        }
        instance.install_unload_waiter(cx.waker().clone());
        Poll::Pending
    })
    .await;

    if !should_unload {
        return Ok(());
    }

    // S1: remove from the registry, stop, then detach.
    registry.remove_instance(&instance, &export);
    instance.stop(&export).await?;
    instance.detach(&export).await?;
    info!(instance = %instance.name(), "instance unloaded");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::TaskExecutor;
    use crate::export::ModuleExport;
    use crate::instance::InstanceHandle;
    use crate::module_handle::StaticModuleHandle;
    use crate::version::Version;
    use std::sync::Arc;

    #[test]
    fn enqueue_unload_is_idempotent() {
        let executor = TaskExecutor::new();
        let registry = Registry::new();
        let export = ModuleExport::builder("m", Version::new(1, 0, 0)).build();
        let module_handle: Box<dyn crate::module_handle::ModuleHandle> =
            Box::new(StaticModuleHandle::new("/m.so", vec![]));
        let instance = InstanceHandle::allocate(&export, Arc::new(module_handle), registry.clone());
        instance.unref_strong(); // drop the allocation-time pin so canUnload holds
        registry.add_instance(&instance, &export).unwrap();

        executor.block_on(enqueue_unload_op(registry.clone(), instance.clone(), export.clone())).unwrap();
        // Second call after the instance is already detached is a no-op.
        executor.block_on(enqueue_unload_op(registry, instance, export)).unwrap();
        executor.shutdown();
    }
}

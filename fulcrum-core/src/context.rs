//! The process-wide `Context` (§9 design notes): owns the registry and the
//! task executor, the crate's only piece of ambient global state.

use std::sync::Arc;

use crate::config::Config;
use crate::executor::TaskExecutor;
use crate::loading_set::LoadingSet;
use crate::registry::Registry;

/// Constructed once at process start, torn down with `shutdown` once every
/// module and outstanding future has drained.
pub struct Context {
    registry: Registry,
    executor: Arc<TaskExecutor>,
    config: Config,
}

impl Context {
    pub fn new(config: Config) -> Self {
        Context {
            registry: Registry::new(),
            executor: TaskExecutor::new(),
            config,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Drive `future` to completion on this context's executor, blocking
    /// the calling thread.
    pub fn block_on<F: std::future::Future>(&self, future: F) -> F::Output {
        self.executor.block_on(future)
    }

    pub fn new_loading_set(&self) -> LoadingSet {
        LoadingSet::new(self.registry.clone(), self.executor.clone(), self.config.clone())
    }

    /// Blocks until the executor drains every outstanding task (§9).
    pub fn shutdown(self) {
        self.executor.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_context_has_an_empty_registry() {
        let context = Context::new(Config::default());
        assert!(!context.registry().has_instance("anything"));
        context.shutdown();
    }
}

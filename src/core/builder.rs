use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::callbacks::{ExceptionCallback, LogCallback};
use crate::core::config::{DispatchStrategy, EngineConfig};
use crate::core::engine::{
    run_worker, AsyncWorker, DispatchEngine, DispatchQueue, ParallelPool, StrategyState,
};
use crate::core::notify::EngineCore;
use crate::error::EngineError;
use crate::listeners::{ListenerRegistry, ListenerSource};

/// Builder for constructing a [`DispatchEngine`] with optional features.
pub struct EngineBuilder {
    cfg: EngineConfig,
    source: Option<Arc<dyn ListenerSource>>,
    callback: Option<Arc<dyn ExceptionCallback>>,
    cancel: Option<CancellationToken>,
    synchronized: bool,
}

impl EngineBuilder {
    /// Creates a builder with the given configuration.
    pub fn new(cfg: EngineConfig) -> Self {
        Self {
            cfg,
            source: None,
            callback: None,
            cancel: None,
            synchronized: false,
        }
    }

    /// Selects the dispatch strategy.
    pub fn with_strategy(mut self, strategy: DispatchStrategy) -> Self {
        self.cfg.strategy = strategy;
        self
    }

    /// Sets the listener source. Defaults to a fresh [`ListenerRegistry`].
    pub fn with_source(mut self, source: Arc<dyn ListenerSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Requests the thread-safe view of the source; a no-op for sources
    /// that are natively thread-safe.
    pub fn with_synchronized_source(mut self) -> Self {
        self.synchronized = true;
        self
    }

    /// Sets the engine-wide exception callback. Defaults to logging.
    pub fn with_exception_callback(mut self, callback: Arc<dyn ExceptionCallback>) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Supplies an external cancellation token, usually shared with the
    /// surrounding application.
    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Stops sequential rounds between listener invocations once the
    /// engine's cancellation token is cancelled.
    pub fn with_interrupt_aware(mut self, interrupt_aware: bool) -> Self {
        self.cfg.interrupt_aware = interrupt_aware;
        self
    }

    /// Bounds the `Asynchronous` worker queue. Must be at least 1.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.cfg.queue_capacity = capacity;
        self
    }

    /// Sets the `close()` grace period.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.cfg.grace = grace;
        self
    }

    /// Builds the engine.
    ///
    /// Fails with [`EngineError::InvalidArgument`] on a zero queue capacity,
    /// and with [`EngineError::IllegalState`] when a `Parallel` or
    /// `Asynchronous` engine is built outside a tokio runtime.
    pub fn build(self) -> Result<DispatchEngine, EngineError> {
        if self.cfg.strategy == DispatchStrategy::Asynchronous && self.cfg.queue_capacity == 0 {
            return Err(EngineError::InvalidArgument("queue_capacity must be at least 1"));
        }

        let source = self
            .source
            .unwrap_or_else(|| ListenerRegistry::new() as Arc<dyn ListenerSource>);
        let source = if self.synchronized {
            source.synchronized_view()
        } else {
            source
        };

        let callback = self.callback.unwrap_or_else(|| Arc::new(LogCallback));
        let cancel = self.cancel.unwrap_or_default();
        let core = Arc::new(EngineCore::new(
            source,
            callback,
            cancel,
            self.cfg.interrupt_aware,
        ));

        let state = match self.cfg.strategy {
            DispatchStrategy::Immediate => StrategyState::Immediate,
            DispatchStrategy::Queuing => {
                StrategyState::Queuing(std::sync::Mutex::new(DispatchQueue::default()))
            }
            DispatchStrategy::Parallel => StrategyState::Parallel(ParallelPool {
                handle: runtime_handle()?,
                tracker: tokio_util::task::TaskTracker::new(),
            }),
            DispatchStrategy::Asynchronous => {
                let handle = runtime_handle()?;
                let (tx, rx) = mpsc::channel(self.cfg.queue_capacity);
                let join = handle.spawn(run_worker(Arc::clone(&core), rx));
                StrategyState::Asynchronous(AsyncWorker {
                    tx: std::sync::Mutex::new(Some(tx)),
                    join: std::sync::Mutex::new(Some(join)),
                })
            }
        };

        Ok(DispatchEngine::from_parts(core, state, self.cfg.grace))
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

fn runtime_handle() -> Result<Handle, EngineError> {
    Handle::try_current()
        .map_err(|_| EngineError::IllegalState("this strategy requires a tokio runtime"))
}

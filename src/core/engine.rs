//! # The dispatch engine.
//!
//! [`DispatchEngine`] is the user-facing dispatch surface. It owns a
//! listener source, an engine-wide exception callback and one
//! [`DispatchStrategy`](crate::DispatchStrategy) worth of execution state;
//! the delegation semantics themselves live in the core notify loop.
//!
//! ## Strategies
//! - **Immediate** runs the notify loop inline; `dispatch` returns after the
//!   last listener.
//! - **Queuing** runs inline too, but a dispatch made while another one is
//!   active on this engine is queued and run afterwards, in FIFO order.
//! - **Parallel** spawns one runtime task per listener and returns after
//!   submission.
//! - **Asynchronous** enqueues the whole round onto a single background
//!   worker, preserving submission order across calls.
//!
//! ## Shutdown
//! `close()` stops accepting work on the detached strategies and waits up to
//! the configured grace period for in-flight work, then returns
//! [`EngineError::GraceExceeded`]. Inline strategies have nothing in flight
//! and close immediately.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::callbacks::{ExceptionCallback, FailedInvocation, LogCallback};
use crate::core::config::DispatchStrategy;
use crate::core::notify::{Delegate, EngineCore};
use crate::error::{EngineError, ListenerError};
use crate::events::Event;
use crate::listeners::{ListenerEntry, ListenerKind, ListenerSource};

/// A deferred dispatch round, captured with its event, delegate and
/// callback.
pub(crate) type QueuedJob = Box<dyn FnOnce(&EngineCore) -> Result<(), EngineError> + Send>;

#[derive(Default)]
pub(crate) struct DispatchQueue {
    busy: bool,
    pending: VecDeque<QueuedJob>,
}

pub(crate) struct ParallelPool {
    pub(crate) handle: Handle,
    pub(crate) tracker: TaskTracker,
}

pub(crate) struct AsyncWorker {
    pub(crate) tx: Mutex<Option<mpsc::Sender<QueuedJob>>>,
    pub(crate) join: Mutex<Option<JoinHandle<()>>>,
}

/// Per-strategy execution state.
pub(crate) enum StrategyState {
    Immediate,
    Queuing(Mutex<DispatchQueue>),
    Parallel(ParallelPool),
    Asynchronous(AsyncWorker),
}

impl StrategyState {
    fn kind(&self) -> DispatchStrategy {
        match self {
            StrategyState::Immediate => DispatchStrategy::Immediate,
            StrategyState::Queuing(_) => DispatchStrategy::Queuing,
            StrategyState::Parallel(_) => DispatchStrategy::Parallel,
            StrategyState::Asynchronous(_) => DispatchStrategy::Asynchronous,
        }
    }
}

/// Resets the queuing busy flag when a drain exits early (abort or panic).
/// The normal empty-queue exit resets the flag itself, under the same lock
/// as the emptiness check, and disarms the guard.
struct BusyGuard<'a> {
    queue: &'a Mutex<DispatchQueue>,
    armed: bool,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.queue.lock().unwrap_or_else(PoisonError::into_inner).busy = false;
        }
    }
}

/// Dispatches events of any listener kind to the listeners of its source.
pub struct DispatchEngine {
    core: Arc<EngineCore>,
    state: Arc<StrategyState>,
    grace: Duration,
}

impl DispatchEngine {
    pub(crate) fn from_parts(
        core: Arc<EngineCore>,
        state: StrategyState,
        grace: Duration,
    ) -> Self {
        Self { core, state: Arc::new(state), grace }
    }

    /// An immediate engine over `source` with default settings. Needs no
    /// runtime and cannot fail to construct.
    pub fn immediate(source: Arc<dyn ListenerSource>) -> Self {
        Self::from_parts(
            Arc::new(EngineCore::new(
                source,
                Arc::new(LogCallback),
                CancellationToken::new(),
                false,
            )),
            StrategyState::Immediate,
            crate::EngineConfig::default().grace,
        )
    }

    /// The listener source this engine notifies from.
    pub fn source(&self) -> Arc<dyn ListenerSource> {
        Arc::clone(self.core.source())
    }

    /// The strategy this engine was built with.
    pub fn strategy(&self) -> DispatchStrategy {
        self.state.kind()
    }

    /// Whether listeners are notified one at a time, in registration order.
    /// Requires both a sequential strategy and a sequential source.
    pub fn is_sequential(&self) -> bool {
        self.state.kind().is_sequential() && self.core.source().is_sequential()
    }

    /// The cancellation token checked by interrupt-aware engines.
    pub fn cancel_token(&self) -> CancellationToken {
        self.core.cancel().clone()
    }

    /// Installs the engine-wide exception callback used by [`dispatch`]
    /// (`None` resets to the logging default).
    ///
    /// [`dispatch`]: DispatchEngine::dispatch
    pub fn set_exception_callback(&self, callback: Option<Arc<dyn ExceptionCallback>>) {
        self.core.set_exception_callback(callback);
    }

    /// Whether this engine still accepts dispatch calls. Inline strategies
    /// always do; `Parallel` and `Asynchronous` stop once closed.
    pub fn can_dispatch(&self) -> bool {
        match &*self.state {
            StrategyState::Immediate | StrategyState::Queuing(_) => true,
            StrategyState::Parallel(pool) => !pool.tracker.is_closed(),
            StrategyState::Asynchronous(worker) => {
                worker.tx.lock().unwrap_or_else(PoisonError::into_inner).is_some()
            }
        }
    }

    /// Notifies the listeners of kind `K` with `event`, invoking each via
    /// `delegate`. Failures are routed to the engine-wide callback.
    ///
    /// Closure delegates need their parameter types written out
    /// (`|l: &(dyn UserListener + Send + Sync), e: &Event<String, UserEvents>|`):
    /// `K::Listener` is an associated type, so the types are not inferred
    /// from the closure alone.
    pub fn dispatch<S, K, F>(
        &self,
        event: Arc<Event<S, K>>,
        delegate: F,
    ) -> Result<(), EngineError>
    where
        S: Send + Sync + 'static,
        K: ListenerKind,
        F: Fn(&K::Listener, &Event<S, K>) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        let callback = self.core.default_callback();
        self.dispatch_inner(event, Arc::new(delegate), callback)
    }

    /// Like [`dispatch`](DispatchEngine::dispatch), with a callback for this
    /// call only.
    pub fn dispatch_with<S, K, F>(
        &self,
        event: Arc<Event<S, K>>,
        delegate: F,
        callback: Arc<dyn ExceptionCallback>,
    ) -> Result<(), EngineError>
    where
        S: Send + Sync + 'static,
        K: ListenerKind,
        F: Fn(&K::Listener, &Event<S, K>) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        self.dispatch_inner(event, Arc::new(delegate), callback)
    }

    fn dispatch_inner<S, K>(
        &self,
        event: Arc<Event<S, K>>,
        delegate: Delegate<S, K>,
        callback: Arc<dyn ExceptionCallback>,
    ) -> Result<(), EngineError>
    where
        S: Send + Sync + 'static,
        K: ListenerKind,
    {
        match &*self.state {
            StrategyState::Immediate => {
                self.core.notify_listeners(event, delegate, callback)
            }
            StrategyState::Queuing(queue) => {
                self.dispatch_queuing(queue, event, delegate, callback)
            }
            StrategyState::Parallel(pool) => {
                self.dispatch_parallel(pool, event, delegate, callback)
            }
            StrategyState::Asynchronous(worker) => {
                self.dispatch_asynchronous(worker, event, delegate, callback)
            }
        }
    }

    /// Enqueues the round; the first dispatch call on an idle engine becomes
    /// the drainer and runs queued rounds in FIFO order until the queue is
    /// empty. Dispatches made by a listener join the back of the queue. An
    /// abort stops the drain and leaves the remainder queued for the next
    /// dispatch call.
    fn dispatch_queuing<S, K>(
        &self,
        queue: &Mutex<DispatchQueue>,
        event: Arc<Event<S, K>>,
        delegate: Delegate<S, K>,
        callback: Arc<dyn ExceptionCallback>,
    ) -> Result<(), EngineError>
    where
        S: Send + Sync + 'static,
        K: ListenerKind,
    {
        {
            let mut q = lock_queue(queue);
            q.pending.push_back(Box::new(move |core| {
                core.notify_listeners(event, delegate, callback)
            }));
            if q.busy {
                return Ok(());
            }
            q.busy = true;
        }

        let mut busy = BusyGuard { queue, armed: true };
        loop {
            let job = {
                let mut q = lock_queue(queue);
                match q.pending.pop_front() {
                    Some(job) => job,
                    None => {
                        // The emptiness check and the busy reset must share
                        // one lock acquisition: a dispatch landing from
                        // another thread in between would sit unserved.
                        q.busy = false;
                        busy.armed = false;
                        return Ok(());
                    }
                }
            };
            job(&self.core)?;
        }
    }

    /// Spawns one runtime task per listener in the snapshot. The cascade
    /// guard and the `handled` short-circuit do not order invocations here;
    /// `handled` is honored best-effort before each invocation starts.
    fn dispatch_parallel<S, K>(
        &self,
        pool: &ParallelPool,
        event: Arc<Event<S, K>>,
        delegate: Delegate<S, K>,
        callback: Arc<dyn ExceptionCallback>,
    ) -> Result<(), EngineError>
    where
        S: Send + Sync + 'static,
        K: ListenerKind,
    {
        if pool.tracker.is_closed() {
            debug!(tag = %event.tag(), "dropping dispatch on closed engine");
            return Ok(());
        }
        // Cancellation cannot be observed per listener here; check once.
        if self.core.interrupted() {
            return Ok(());
        }

        event.set_prevented(false);
        event.bind_source(Arc::clone(self.core.source()));

        let snapshot = self.core.source().snapshot(event.tag());
        for (index, entry) in snapshot.iter().enumerate() {
            let Some(listener) = ListenerEntry::downcast::<K>(entry) else {
                continue;
            };
            let core = Arc::clone(&self.core);
            let event = Arc::clone(&event);
            let delegate = Arc::clone(&delegate);
            let callback = Arc::clone(&callback);
            pool.tracker.spawn_on(
                async move {
                    if event.is_handled() {
                        return;
                    }
                    core.notify_detached(&event, &listener, index, &delegate, &callback);
                },
                &pool.handle,
            );
        }
        Ok(())
    }

    /// Enqueues the whole round onto the background worker. A full or
    /// stopped queue is reported to `callback` as a submission failure.
    fn dispatch_asynchronous<S, K>(
        &self,
        worker: &AsyncWorker,
        event: Arc<Event<S, K>>,
        delegate: Delegate<S, K>,
        callback: Arc<dyn ExceptionCallback>,
    ) -> Result<(), EngineError>
    where
        S: Send + Sync + 'static,
        K: ListenerKind,
    {
        let tag = event.tag();
        let report_to = Arc::clone(&callback);
        let job: QueuedJob =
            Box::new(move |core| core.notify_listeners(event, delegate, callback));

        // Clone the sender out of the lock: a submission callback may
        // dispatch on this engine again and must not find the lock held.
        let sender = {
            let tx = worker.tx.lock().unwrap_or_else(PoisonError::into_inner);
            match tx.as_ref() {
                Some(tx) => tx.clone(),
                None => {
                    debug!(tag = %tag, "dropping dispatch on closed engine");
                    return Ok(());
                }
            }
        };
        match sender.try_send(job) {
            Ok(()) => Ok(()),
            Err(err) => {
                let reason = match err {
                    TrySendError::Full(_) => "dispatch queue is full",
                    TrySendError::Closed(_) => "dispatch worker is stopped",
                };
                self.core.handle_exception(
                    &report_to,
                    FailedInvocation::submission(tag, ListenerError::failed(reason)),
                )
            }
        }
    }

    /// Stops accepting work on detached strategies and waits up to the grace
    /// period for in-flight dispatches. Listeners stay registered; an
    /// inline-strategy engine remains usable after closing.
    pub async fn close(&self) -> Result<(), EngineError> {
        match &*self.state {
            StrategyState::Immediate | StrategyState::Queuing(_) => Ok(()),
            StrategyState::Parallel(pool) => {
                pool.tracker.close();
                tokio::time::timeout(self.grace, pool.tracker.wait())
                    .await
                    .map_err(|_| EngineError::GraceExceeded { grace: self.grace })
            }
            StrategyState::Asynchronous(worker) => {
                // Dropping the sender lets the worker drain and exit.
                drop(worker.tx.lock().unwrap_or_else(PoisonError::into_inner).take());
                let join = worker.join.lock().unwrap_or_else(PoisonError::into_inner).take();
                let Some(join) = join else {
                    return Ok(());
                };
                match tokio::time::timeout(self.grace, join).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(err)) => {
                        warn!(error = %err, "dispatch worker did not exit cleanly");
                        Ok(())
                    }
                    Err(_) => Err(EngineError::GraceExceeded { grace: self.grace }),
                }
            }
        }
    }
}

impl fmt::Debug for DispatchEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchEngine")
            .field("strategy", &self.state.kind())
            .field("grace", &self.grace)
            .finish_non_exhaustive()
    }
}

fn lock_queue(queue: &Mutex<DispatchQueue>) -> MutexGuard<'_, DispatchQueue> {
    queue.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Drains queued rounds until the engine drops its sender.
pub(crate) async fn run_worker(core: Arc<EngineCore>, mut rx: mpsc::Receiver<QueuedJob>) {
    while let Some(job) = rx.recv().await {
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| job(&core)));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %err, "aborted an asynchronous dispatch"),
            Err(payload) => warn!(
                panic = %crate::panic_message(&payload),
                "asynchronous dispatch panicked",
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::builder::EngineBuilder;
    use crate::core::config::EngineConfig;
    use crate::listeners::{Listener, ListenerRegistry, PriorityRegistry};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::OnceLock;
    use std::time::Duration;

    type Log = Arc<Mutex<Vec<String>>>;

    trait OrderListener: Listener {
        fn notified(&self, event: &Event<&'static str, Orders>) -> Result<(), ListenerError>;
    }

    struct Orders;
    impl ListenerKind for Orders {
        type Listener = dyn OrderListener + Send + Sync;
    }

    struct Recorder {
        name: &'static str,
        log: Log,
    }
    impl Listener for Recorder {}
    impl OrderListener for Recorder {
        fn notified(&self, event: &Event<&'static str, Orders>) -> Result<(), ListenerError> {
            let src = event.source().copied().unwrap_or("?");
            self.log.lock().unwrap().push(format!("{}:{src}", self.name));
            Ok(())
        }
    }

    fn new_log() -> Log {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn entries(log: &Log) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    fn recorder(name: &'static str, log: &Log) -> Arc<dyn OrderListener + Send + Sync> {
        Arc::new(Recorder { name, log: Arc::clone(log) })
    }

    // The delegate's parameter types must be spelled out: `K::Listener` is
    // an associated type, so they are not inferred from the closure body.
    fn fire(
        engine: &DispatchEngine,
        source: &'static str,
    ) -> Result<(), EngineError> {
        engine.dispatch(
            Arc::new(Event::new(source)),
            |l: &(dyn OrderListener + Send + Sync + 'static), e: &Event<&'static str, Orders>| {
                l.notified(e)
            },
        )
    }

    #[test]
    fn immediate_notifies_in_registration_order() {
        let log = new_log();
        let registry = ListenerRegistry::new();
        registry.add::<Orders>(recorder("a", &log));
        registry.add::<Orders>(recorder("b", &log));
        registry.add::<Orders>(recorder("c", &log));

        let engine = DispatchEngine::immediate(registry);
        fire(&engine, "e").expect("dispatch");
        assert_eq!(entries(&log), vec!["a:e", "b:e", "c:e"]);
    }

    #[test]
    fn handled_stops_remaining_listeners() {
        struct Settler {
            log: Log,
        }
        impl Listener for Settler {}
        impl OrderListener for Settler {
            fn notified(&self, event: &Event<&'static str, Orders>) -> Result<(), ListenerError> {
                self.log.lock().unwrap().push("settled".into());
                event.set_handled(true);
                Ok(())
            }
        }

        let log = new_log();
        let registry = ListenerRegistry::new();
        registry.add::<Orders>(recorder("a", &log));
        registry.add::<Orders>(
            Arc::new(Settler { log: Arc::clone(&log) }) as Arc<dyn OrderListener + Send + Sync>
        );
        registry.add::<Orders>(recorder("c", &log));

        let engine = DispatchEngine::immediate(registry);
        fire(&engine, "e").expect("dispatch");
        assert_eq!(entries(&log), vec!["a:e", "settled"]);
    }

    #[test]
    fn failure_continues_and_is_reported_once() {
        struct Failer;
        impl Listener for Failer {}
        impl OrderListener for Failer {
            fn notified(&self, _: &Event<&'static str, Orders>) -> Result<(), ListenerError> {
                Err(ListenerError::failed("boom"))
            }
        }

        let log = new_log();
        let registry = ListenerRegistry::new();
        registry.add::<Orders>(Arc::new(Failer) as Arc<dyn OrderListener + Send + Sync>);
        registry.add::<Orders>(recorder("b", &log));

        let engine = DispatchEngine::immediate(registry);
        let failures: Arc<Mutex<Vec<crate::callbacks::FailureSite>>> =
            Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&failures);
        engine.set_exception_callback(Some(Arc::new(
            move |failure: &FailedInvocation| -> Result<(), ListenerError> {
                sink.lock().unwrap().push(failure.site);
                Ok(())
            },
        )));

        fire(&engine, "e").expect("dispatch");
        assert_eq!(entries(&log), vec!["b:e"]);
        assert_eq!(
            *failures.lock().unwrap(),
            vec![crate::callbacks::FailureSite::Listener { index: 0 }]
        );
    }

    #[test]
    fn callback_receives_failing_listener_and_event() {
        struct Failer;
        impl Listener for Failer {}
        impl OrderListener for Failer {
            fn notified(&self, _: &Event<&'static str, Orders>) -> Result<(), ListenerError> {
                Err(ListenerError::failed("boom"))
            }
        }

        let registry = ListenerRegistry::new();
        let failer = Arc::new(Failer) as Arc<dyn OrderListener + Send + Sync>;
        registry.add::<Orders>(Arc::clone(&failer));

        let engine = DispatchEngine::immediate(registry);
        let seen: Arc<Mutex<Vec<(bool, Option<&'static str>)>>> =
            Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let expected = Arc::clone(&failer);
        engine.set_exception_callback(Some(Arc::new(
            move |failure: &FailedInvocation| -> Result<(), ListenerError> {
                let same = failure
                    .listener::<Orders>()
                    .map(|l| Arc::ptr_eq(&l, &expected))
                    .unwrap_or(false);
                let src = failure
                    .event::<&'static str, Orders>()
                    .and_then(|e| e.source().copied());
                sink.lock().unwrap().push((same, src));
                Ok(())
            },
        )));

        fire(&engine, "e").expect("dispatch");
        assert_eq!(*seen.lock().unwrap(), vec![(true, Some("e"))]);
    }

    #[test]
    fn default_callback_recovers_and_dispatch_returns_ok() {
        struct Failer;
        impl Listener for Failer {}
        impl OrderListener for Failer {
            fn notified(&self, _: &Event<&'static str, Orders>) -> Result<(), ListenerError> {
                Err(ListenerError::failed("x"))
            }
        }

        let log = new_log();
        let registry = ListenerRegistry::new();
        registry.add::<Orders>(Arc::new(Failer) as Arc<dyn OrderListener + Send + Sync>);
        registry.add::<Orders>(recorder("b", &log));

        // No callback installed: the logging default recovers.
        let engine = DispatchEngine::immediate(registry);
        fire(&engine, "e").expect("dispatch");
        assert_eq!(entries(&log), vec!["b:e"]);
    }

    #[test]
    fn listener_abort_reaches_caller_and_skips_callback() {
        struct Aborter;
        impl Listener for Aborter {}
        impl OrderListener for Aborter {
            fn notified(&self, _: &Event<&'static str, Orders>) -> Result<(), ListenerError> {
                Err(ListenerError::abort("stop everything"))
            }
        }

        let log = new_log();
        let registry = ListenerRegistry::new();
        registry.add::<Orders>(recorder("a", &log));
        registry.add::<Orders>(Arc::new(Aborter) as Arc<dyn OrderListener + Send + Sync>);
        registry.add::<Orders>(recorder("c", &log));

        let engine = DispatchEngine::immediate(registry);
        let reported = Arc::new(AtomicUsize::new(0));
        let hits = Arc::clone(&reported);
        engine.set_exception_callback(Some(Arc::new(
            move |_: &FailedInvocation| -> Result<(), ListenerError> {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        )));

        let err = fire(&engine, "e").unwrap_err();
        assert!(matches!(err, EngineError::Aborted { .. }));
        assert_eq!(entries(&log), vec!["a:e"]);
        assert_eq!(reported.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn same_tag_cascade_is_deferred_until_after_the_round() {
        struct Cascader {
            engine: OnceLock<Arc<DispatchEngine>>,
            log: Log,
            fired: AtomicBool,
            inner_prevented: AtomicBool,
        }
        impl Listener for Cascader {}
        impl OrderListener for Cascader {
            fn notified(&self, event: &Event<&'static str, Orders>) -> Result<(), ListenerError> {
                let src = event.source().copied().unwrap_or("?");
                self.log.lock().unwrap().push(format!("cascade:{src}"));
                if !self.fired.swap(true, Ordering::SeqCst) {
                    let inner = Arc::new(Event::new("inner"));
                    let engine = self.engine.get().ok_or(ListenerError::failed("no engine"))?;
                    engine
                        .dispatch(
                            Arc::clone(&inner),
                            |l: &(dyn OrderListener + Send + Sync + 'static),
                             e: &Event<&'static str, Orders>| {
                                l.notified(e)
                            },
                        )
                        .map_err(|err| ListenerError::failed(err.to_string()))?;
                    self.inner_prevented.store(inner.is_prevented(), Ordering::SeqCst);
                }
                Ok(())
            }
        }

        let log = new_log();
        let registry = ListenerRegistry::new();
        let cascader = Arc::new(Cascader {
            engine: OnceLock::new(),
            log: Arc::clone(&log),
            fired: AtomicBool::new(false),
            inner_prevented: AtomicBool::new(false),
        });
        registry
            .add::<Orders>(Arc::clone(&cascader) as Arc<dyn OrderListener + Send + Sync>);
        registry.add::<Orders>(recorder("tail", &log));

        let engine = Arc::new(DispatchEngine::immediate(registry));
        cascader.engine.set(Arc::clone(&engine)).ok().expect("set once");

        fire(&engine, "outer").expect("dispatch");
        assert_eq!(
            entries(&log),
            vec!["cascade:outer", "tail:outer", "cascade:inner", "tail:inner"]
        );
        assert!(cascader.inner_prevented.load(Ordering::SeqCst));
    }

    #[test]
    fn mutation_during_round_does_not_affect_snapshot() {
        struct Remover {
            registry: Arc<ListenerRegistry>,
            victim: OnceLock<Arc<dyn OrderListener + Send + Sync>>,
            log: Log,
        }
        impl Listener for Remover {}
        impl OrderListener for Remover {
            fn notified(&self, _: &Event<&'static str, Orders>) -> Result<(), ListenerError> {
                self.log.lock().unwrap().push("remover".into());
                if let Some(victim) = self.victim.get() {
                    self.registry.remove::<Orders>(victim);
                }
                Ok(())
            }
        }

        let log = new_log();
        let registry = ListenerRegistry::new();
        let victim = recorder("b", &log);
        let remover = Arc::new(Remover {
            registry: Arc::clone(&registry),
            victim: OnceLock::new(),
            log: Arc::clone(&log),
        });
        remover.victim.set(Arc::clone(&victim)).ok().expect("set once");

        registry.add::<Orders>(Arc::clone(&remover) as Arc<dyn OrderListener + Send + Sync>);
        registry.add::<Orders>(victim);

        let engine = DispatchEngine::immediate(registry);
        fire(&engine, "x").expect("dispatch");
        // The victim was removed mid-round but its snapshot slot still ran.
        assert_eq!(entries(&log), vec!["remover", "b:x"]);

        fire(&engine, "y").expect("dispatch");
        assert_eq!(entries(&log), vec!["remover", "b:x", "remover"]);
    }

    #[test]
    fn stop_notifying_applies_from_the_next_round() {
        struct Stopper {
            target: OnceLock<Arc<dyn OrderListener + Send + Sync>>,
            log: Log,
        }
        impl Listener for Stopper {}
        impl OrderListener for Stopper {
            fn notified(&self, event: &Event<&'static str, Orders>) -> Result<(), ListenerError> {
                self.log.lock().unwrap().push("stopper".into());
                if let Some(target) = self.target.get() {
                    event
                        .stop_notifying(target)
                        .map_err(|err| ListenerError::failed(err.to_string()))?;
                }
                Ok(())
            }
        }

        let log = new_log();
        let registry = ListenerRegistry::new();
        let target = recorder("b", &log);
        let stopper = Arc::new(Stopper { target: OnceLock::new(), log: Arc::clone(&log) });
        stopper.target.set(Arc::clone(&target)).ok().expect("set once");

        registry.add::<Orders>(Arc::clone(&stopper) as Arc<dyn OrderListener + Send + Sync>);
        registry.add::<Orders>(target);

        let engine = DispatchEngine::immediate(registry);
        fire(&engine, "x").expect("dispatch");
        assert_eq!(entries(&log), vec!["stopper", "b:x"]);

        fire(&engine, "y").expect("dispatch");
        assert_eq!(entries(&log), vec!["stopper", "b:x", "stopper"]);
    }

    #[test]
    fn priority_source_orders_snapshots_and_disables_sequential() {
        let log = new_log();
        let registry = PriorityRegistry::new();
        registry.add_with_priority::<Orders>(recorder("lo", &log), 200);
        registry.add_with_priority::<Orders>(recorder("hi", &log), 10);

        let engine = DispatchEngine::immediate(registry);
        assert!(!engine.is_sequential());

        fire(&engine, "e").expect("dispatch");
        assert_eq!(entries(&log), vec!["hi:e", "lo:e"]);
    }

    #[test]
    fn interrupt_aware_round_stops_after_cancellation() {
        struct Canceller {
            token: CancellationToken,
            log: Log,
        }
        impl Listener for Canceller {}
        impl OrderListener for Canceller {
            fn notified(&self, _: &Event<&'static str, Orders>) -> Result<(), ListenerError> {
                self.log.lock().unwrap().push("cancel".into());
                self.token.cancel();
                Ok(())
            }
        }

        let log = new_log();
        let token = CancellationToken::new();
        let registry = ListenerRegistry::new();
        registry.add::<Orders>(Arc::new(Canceller {
            token: token.clone(),
            log: Arc::clone(&log),
        }) as Arc<dyn OrderListener + Send + Sync>);
        registry.add::<Orders>(recorder("b", &log));

        let engine = EngineBuilder::new(EngineConfig::default())
            .with_source(registry)
            .with_cancel_token(token)
            .with_interrupt_aware(true)
            .build()
            .expect("engine");

        fire(&engine, "e").expect("dispatch");
        assert_eq!(entries(&log), vec!["cancel"]);
    }

    /// Issues two more dispatches when notified for "first", aborts for
    /// "boom", and records everything it sees.
    struct Driver {
        engine: OnceLock<Arc<DispatchEngine>>,
        log: Log,
    }
    impl Listener for Driver {}
    impl OrderListener for Driver {
        fn notified(&self, event: &Event<&'static str, Orders>) -> Result<(), ListenerError> {
            let src = event.source().copied().unwrap_or("?");
            self.log.lock().unwrap().push(format!("d:{src}"));
            let engine = self.engine.get().ok_or(ListenerError::failed("no engine"))?;
            match src {
                "first" => {
                    fire(engine, "second").map_err(|e| ListenerError::failed(e.to_string()))?;
                    fire(engine, "third").map_err(|e| ListenerError::failed(e.to_string()))?;
                    self.log.lock().unwrap().push("d:first-done".into());
                    Ok(())
                }
                "boom" => Err(ListenerError::abort("boom")),
                _ => Ok(()),
            }
        }
    }

    fn queuing_engine_with_driver(log: &Log) -> (Arc<DispatchEngine>, Arc<Driver>) {
        let registry = ListenerRegistry::new();
        let driver = Arc::new(Driver { engine: OnceLock::new(), log: Arc::clone(log) });
        registry.add::<Orders>(Arc::clone(&driver) as Arc<dyn OrderListener + Send + Sync>);
        let engine = Arc::new(
            EngineBuilder::new(EngineConfig::default())
                .with_strategy(DispatchStrategy::Queuing)
                .with_source(registry)
                .build()
                .expect("engine"),
        );
        driver.engine.set(Arc::clone(&engine)).ok().expect("set once");
        (engine, driver)
    }

    #[test]
    fn queuing_defers_nested_dispatches_fifo() {
        let log = new_log();
        let (engine, _driver) = queuing_engine_with_driver(&log);

        fire(&engine, "first").expect("dispatch");
        assert_eq!(
            entries(&log),
            vec!["d:first", "d:first-done", "d:second", "d:third"]
        );
    }

    #[test]
    fn queuing_abort_leaves_the_remainder_queued() {
        struct Seeder {
            engine: OnceLock<Arc<DispatchEngine>>,
            log: Log,
        }
        impl Listener for Seeder {}
        impl OrderListener for Seeder {
            fn notified(&self, event: &Event<&'static str, Orders>) -> Result<(), ListenerError> {
                let src = event.source().copied().unwrap_or("?");
                self.log.lock().unwrap().push(format!("s:{src}"));
                match src {
                    "first" => {
                        let engine =
                            self.engine.get().ok_or(ListenerError::failed("no engine"))?;
                        fire(engine, "boom").map_err(|e| ListenerError::failed(e.to_string()))?;
                        fire(engine, "fine").map_err(|e| ListenerError::failed(e.to_string()))?;
                        Ok(())
                    }
                    "boom" => Err(ListenerError::abort("boom")),
                    _ => Ok(()),
                }
            }
        }

        let log = new_log();
        let registry = ListenerRegistry::new();
        let seeder = Arc::new(Seeder { engine: OnceLock::new(), log: Arc::clone(&log) });
        registry.add::<Orders>(Arc::clone(&seeder) as Arc<dyn OrderListener + Send + Sync>);
        let engine = Arc::new(
            EngineBuilder::new(EngineConfig::default())
                .with_strategy(DispatchStrategy::Queuing)
                .with_source(registry)
                .build()
                .expect("engine"),
        );
        seeder.engine.set(Arc::clone(&engine)).ok().expect("set once");

        let err = fire(&engine, "first").unwrap_err();
        assert!(matches!(err, EngineError::Aborted { .. }));
        assert_eq!(entries(&log), vec!["s:first", "s:boom"]);

        // The queued remainder survives the abort and drains first.
        fire(&engine, "retry").expect("dispatch");
        assert_eq!(entries(&log), vec!["s:first", "s:boom", "s:fine", "s:retry"]);
    }

    #[test]
    fn queuing_serves_dispatches_enqueued_from_other_threads() {
        struct Gate {
            entered: std::sync::mpsc::Sender<()>,
            resume: Mutex<std::sync::mpsc::Receiver<()>>,
            log: Log,
        }
        impl Listener for Gate {}
        impl OrderListener for Gate {
            fn notified(&self, event: &Event<&'static str, Orders>) -> Result<(), ListenerError> {
                let src = event.source().copied().unwrap_or("?");
                self.log.lock().unwrap().push(format!("g:{src}"));
                if src == "first" {
                    self.entered.send(()).expect("signal entered");
                    // Hold the drain until the other thread has enqueued.
                    self.resume.lock().unwrap().recv().expect("resume");
                }
                Ok(())
            }
        }

        let log = new_log();
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let (resume_tx, resume_rx) = std::sync::mpsc::channel();
        let registry = ListenerRegistry::new();
        registry.add::<Orders>(Arc::new(Gate {
            entered: entered_tx,
            resume: Mutex::new(resume_rx),
            log: Arc::clone(&log),
        }) as Arc<dyn OrderListener + Send + Sync>);

        let engine = Arc::new(
            EngineBuilder::new(EngineConfig::default())
                .with_strategy(DispatchStrategy::Queuing)
                .with_source(registry)
                .build()
                .expect("engine"),
        );

        let other = Arc::clone(&engine);
        let second = std::thread::spawn(move || {
            entered_rx.recv().expect("first entered");
            fire(&other, "second").expect("dispatch");
            resume_tx.send(()).expect("resume");
        });

        // This call drains both rounds; the second must not be stranded.
        fire(&engine, "first").expect("dispatch");
        second.join().expect("join");
        assert_eq!(entries(&log), vec!["g:first", "g:second"]);
    }

    struct Count {
        hits: Arc<AtomicUsize>,
    }
    impl Listener for Count {}
    impl OrderListener for Count {
        fn notified(&self, _: &Event<&'static str, Orders>) -> Result<(), ListenerError> {
            self.hits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn parallel_notifies_every_listener_then_refuses_after_close() {
        let hits = Arc::new(AtomicUsize::new(0));
        let registry = ListenerRegistry::new();
        for _ in 0..3 {
            registry.add::<Orders>(Arc::new(Count { hits: Arc::clone(&hits) })
                as Arc<dyn OrderListener + Send + Sync>);
        }

        let engine = EngineBuilder::new(EngineConfig::default())
            .with_strategy(DispatchStrategy::Parallel)
            .with_source(registry)
            .build()
            .expect("engine");
        assert!(!engine.is_sequential());
        assert!(engine.can_dispatch());

        fire(&engine, "e").expect("dispatch");
        engine.close().await.expect("close");
        assert_eq!(hits.load(Ordering::SeqCst), 3);

        // Closed engines drop dispatches instead of failing.
        assert!(!engine.can_dispatch());
        fire(&engine, "late").expect("dispatch");
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn parallel_close_times_out_on_stuck_listeners() {
        struct Sleeper;
        impl Listener for Sleeper {}
        impl OrderListener for Sleeper {
            fn notified(&self, _: &Event<&'static str, Orders>) -> Result<(), ListenerError> {
                std::thread::sleep(Duration::from_millis(500));
                Ok(())
            }
        }

        let registry = ListenerRegistry::new();
        registry.add::<Orders>(Arc::new(Sleeper) as Arc<dyn OrderListener + Send + Sync>);

        let engine = EngineBuilder::new(EngineConfig::default())
            .with_strategy(DispatchStrategy::Parallel)
            .with_source(registry)
            .with_grace(Duration::from_millis(50))
            .build()
            .expect("engine");

        fire(&engine, "e").expect("dispatch");
        let err = engine.close().await.unwrap_err();
        assert!(matches!(err, EngineError::GraceExceeded { .. }));
    }

    #[tokio::test]
    async fn asynchronous_preserves_submission_order() {
        let log = new_log();
        let registry = ListenerRegistry::new();
        registry.add::<Orders>(recorder("r", &log));

        let engine = EngineBuilder::new(EngineConfig::default())
            .with_strategy(DispatchStrategy::Asynchronous)
            .with_source(registry)
            .build()
            .expect("engine");
        assert!(engine.is_sequential());

        fire(&engine, "one").expect("dispatch");
        fire(&engine, "two").expect("dispatch");
        engine.close().await.expect("close");

        assert_eq!(entries(&log), vec!["r:one", "r:two"]);
        assert!(!engine.can_dispatch());

        fire(&engine, "late").expect("dispatch");
        assert_eq!(entries(&log), vec!["r:one", "r:two"]);
    }

    #[tokio::test]
    async fn asynchronous_full_queue_is_reported_as_submission_failure() {
        let log = new_log();
        let registry = ListenerRegistry::new();
        registry.add::<Orders>(recorder("r", &log));

        let engine = EngineBuilder::new(EngineConfig::default())
            .with_strategy(DispatchStrategy::Asynchronous)
            .with_queue_capacity(1)
            .with_source(registry)
            .build()
            .expect("engine");

        let failures: Arc<Mutex<Vec<crate::callbacks::FailureSite>>> =
            Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&failures);
        engine.set_exception_callback(Some(Arc::new(
            move |failure: &FailedInvocation| -> Result<(), ListenerError> {
                sink.lock().unwrap().push(failure.site);
                Ok(())
            },
        )));

        // The worker cannot run between these calls on a current-thread
        // runtime, so the second dispatch finds the queue full.
        fire(&engine, "one").expect("dispatch");
        fire(&engine, "two").expect("dispatch");
        engine.close().await.expect("close");

        assert_eq!(entries(&log), vec!["r:one"]);
        assert_eq!(
            *failures.lock().unwrap(),
            vec![crate::callbacks::FailureSite::Submission]
        );
    }

    #[tokio::test]
    async fn asynchronous_submission_callback_may_dispatch_again() {
        struct Requeuer {
            engine: OnceLock<Arc<DispatchEngine>>,
            retried: AtomicBool,
            sites: Arc<Mutex<Vec<crate::callbacks::FailureSite>>>,
        }
        impl ExceptionCallback for Requeuer {
            fn exception(&self, failure: &FailedInvocation) -> Result<(), ListenerError> {
                self.sites.lock().unwrap().push(failure.site);
                if !self.retried.swap(true, Ordering::SeqCst) {
                    if let Some(engine) = self.engine.get() {
                        fire(engine, "retry")
                            .map_err(|e| ListenerError::failed(e.to_string()))?;
                    }
                }
                Ok(())
            }
        }

        let log = new_log();
        let registry = ListenerRegistry::new();
        registry.add::<Orders>(recorder("r", &log));

        let engine = Arc::new(
            EngineBuilder::new(EngineConfig::default())
                .with_strategy(DispatchStrategy::Asynchronous)
                .with_queue_capacity(1)
                .with_source(registry)
                .build()
                .expect("engine"),
        );

        let sites: Arc<Mutex<Vec<crate::callbacks::FailureSite>>> =
            Arc::new(Mutex::new(Vec::new()));
        let requeuer = Arc::new(Requeuer {
            engine: OnceLock::new(),
            retried: AtomicBool::new(false),
            sites: Arc::clone(&sites),
        });
        requeuer.engine.set(Arc::clone(&engine)).ok().expect("set once");
        engine.set_exception_callback(Some(
            Arc::clone(&requeuer) as Arc<dyn ExceptionCallback>
        ));

        // The first dispatch fills the queue; the second fails to submit and
        // its callback dispatches on the same engine. Both submission
        // failures are reported and the calls return instead of blocking.
        fire(&engine, "one").expect("dispatch");
        fire(&engine, "two").expect("dispatch");
        engine.close().await.expect("close");

        assert_eq!(entries(&log), vec!["r:one"]);
        assert_eq!(
            *sites.lock().unwrap(),
            vec![
                crate::callbacks::FailureSite::Submission,
                crate::callbacks::FailureSite::Submission,
            ]
        );
    }
}

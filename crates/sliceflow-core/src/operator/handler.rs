//! Operator handlers and their registry.
//!
//! An operator handler owns the shared mutable state of one logical
//! windowed operator: the slice store and the watermark registry. The
//! physical operators that make up the logical operator (build and trigger
//! for aggregations; left build, right build and probe for joins) look the
//! handler up by [`OperatorHandlerId`] in the query's
//! [`OperatorHandlerRegistry`] and share it across worker threads.
//!
//! # Lifecycle
//!
//! ```text
//! Created ──start()──► Running ──stop(termination)──► Stopped
//! ```
//!
//! Build and trigger calls hold a read guard on the handler's lifecycle for
//! their whole duration. `stop` takes the write guard, so it waits for
//! every in-flight call to finish. Calls arriving after `stop` fail with
//! [`OperatorError::HandlerStopped`].

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use fxhash::FxHashMap;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::{OperatorError, WindowOutput};
use crate::config::EngineConfig;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Identifies one operator handler within a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OperatorHandlerId(pub u64);

impl fmt::Display for OperatorHandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler-{}", self.0)
    }
}

/// How a query is being terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryTerminationType {
    /// Sources are exhausted: every remaining window is triggered and emitted.
    Graceful,
    /// Stop requested: open windows are discarded.
    HardStop,
    /// The query failed: open windows are discarded.
    Failure,
}

impl QueryTerminationType {
    /// Returns true if remaining windows should be flushed.
    #[must_use]
    pub fn flushes(self) -> bool {
        matches!(self, Self::Graceful)
    }
}

// ---------------------------------------------------------------------------
// OperatorHandler
// ---------------------------------------------------------------------------

/// Shared state of one logical windowed operator.
pub trait OperatorHandler: Send + Sync {
    /// The handler's id.
    fn id(&self) -> OperatorHandlerId;

    /// Called once before the first build or trigger call.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::HandlerStopped`] if the handler was stopped.
    fn start(&self, ctx: &PipelineExecutionContext) -> Result<(), OperatorError>;

    /// Waits for in-flight calls, then tears the handler down.
    ///
    /// Graceful termination returns every remaining window; the other
    /// termination types discard them and return nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if flushing a remaining window fails.
    fn stop(&self, termination: QueryTerminationType) -> Result<Vec<WindowOutput>, OperatorError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Created,
    Running,
    Stopped,
}

/// Reader-writer gate guarding a handler's lifecycle.
pub(crate) struct Lifecycle {
    id: OperatorHandlerId,
    phase: RwLock<Phase>,
}

impl Lifecycle {
    pub(crate) fn new(id: OperatorHandlerId) -> Self {
        Self {
            id,
            phase: RwLock::new(Phase::Created),
        }
    }

    /// Marks the handler running. Starting twice is a no-op.
    pub(crate) fn start(&self) -> Result<(), OperatorError> {
        let mut phase = self.phase.write();
        match *phase {
            Phase::Stopped => Err(OperatorError::HandlerStopped(self.id.0)),
            Phase::Created => {
                *phase = Phase::Running;
                Ok(())
            }
            Phase::Running => Ok(()),
        }
    }

    /// Admits one build, trigger or probe call.
    pub(crate) fn enter(&self) -> Result<RwLockReadGuard<'_, Phase>, OperatorError> {
        let phase = self.phase.read();
        if *phase == Phase::Stopped {
            return Err(OperatorError::HandlerStopped(self.id.0));
        }
        Ok(phase)
    }

    /// Waits for every admitted call and returns the exclusive guard, or
    /// `None` if the handler was already stopped.
    pub(crate) fn begin_stop(&self) -> Option<StopGuard<'_>> {
        let phase = self.phase.write();
        if *phase == Phase::Stopped {
            return None;
        }
        Some(StopGuard { phase })
    }

    pub(crate) fn is_stopped(&self) -> bool {
        *self.phase.read() == Phase::Stopped
    }
}

/// Exclusive access during `stop`. The handler counts as stopped once the
/// guard is dropped.
pub(crate) struct StopGuard<'a> {
    phase: RwLockWriteGuard<'a, Phase>,
}

impl Drop for StopGuard<'_> {
    fn drop(&mut self) {
        *self.phase = Phase::Stopped;
    }
}

// ---------------------------------------------------------------------------
// OperatorHandlerRegistry
// ---------------------------------------------------------------------------

struct RegisteredHandler {
    handler: Arc<dyn OperatorHandler>,
    typed: Arc<dyn Any + Send + Sync>,
}

/// Handlers of one query, addressed by id.
#[derive(Default)]
pub struct OperatorHandlerRegistry {
    handlers: RwLock<FxHashMap<OperatorHandlerId, RegisteredHandler>>,
}

impl OperatorHandlerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler under its own id.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::DuplicateHandler`] if the id is taken.
    pub fn register<H: OperatorHandler + 'static>(&self, handler: Arc<H>) -> Result<(), OperatorError> {
        let id = handler.id();
        let mut handlers = self.handlers.write();
        if handlers.contains_key(&id) {
            return Err(OperatorError::DuplicateHandler(id.0));
        }
        handlers.insert(
            id,
            RegisteredHandler {
                handler: Arc::clone(&handler) as Arc<dyn OperatorHandler>,
                typed: handler as Arc<dyn Any + Send + Sync>,
            },
        );
        Ok(())
    }

    /// Looks up a handler by id and concrete type.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::HandlerNotFound`] if no handler of type `H`
    /// is registered under `id`.
    pub fn get<H: OperatorHandler + 'static>(&self, id: OperatorHandlerId) -> Result<Arc<H>, OperatorError> {
        let handlers = self.handlers.read();
        let entry = handlers
            .get(&id)
            .ok_or(OperatorError::HandlerNotFound(id.0))?;
        Arc::clone(&entry.typed)
            .downcast::<H>()
            .map_err(|_| OperatorError::HandlerNotFound(id.0))
    }

    /// Removes a handler. Returns it if it was registered.
    pub fn deregister(&self, id: OperatorHandlerId) -> Option<Arc<dyn OperatorHandler>> {
        self.handlers.write().remove(&id).map(|entry| entry.handler)
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    /// Returns true if no handler is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }

    /// Starts every registered handler, in id order.
    ///
    /// # Errors
    ///
    /// Returns the first start failure.
    pub fn start_all(&self, ctx: &PipelineExecutionContext) -> Result<(), OperatorError> {
        for handler in self.sorted() {
            handler.start(ctx)?;
        }
        Ok(())
    }

    /// Stops and removes every handler, in id order.
    ///
    /// Every handler is stopped even if an earlier one fails; the first
    /// failure is returned after all of them have been torn down.
    ///
    /// # Errors
    ///
    /// Returns the first stop failure.
    pub fn stop_all(
        &self,
        termination: QueryTerminationType,
    ) -> Result<Vec<(OperatorHandlerId, Vec<WindowOutput>)>, OperatorError> {
        let handlers = self.sorted();
        self.handlers.write().clear();

        let mut flushed = Vec::with_capacity(handlers.len());
        let mut first_error = None;
        for handler in handlers {
            match handler.stop(termination) {
                Ok(outputs) => flushed.push((handler.id(), outputs)),
                Err(e) => {
                    tracing::error!(handler = %handler.id(), error = %e, "failed to stop handler");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(flushed),
        }
    }

    fn sorted(&self) -> Vec<Arc<dyn OperatorHandler>> {
        let handlers = self.handlers.read();
        let mut ids: Vec<_> = handlers.keys().copied().collect();
        ids.sort_unstable();
        ids.iter()
            .filter_map(|id| handlers.get(id))
            .map(|entry| Arc::clone(&entry.handler))
            .collect()
    }
}

impl fmt::Debug for OperatorHandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperatorHandlerRegistry")
            .field("handlers", &self.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// PipelineExecutionContext
// ---------------------------------------------------------------------------

/// Per-query execution context shared by all physical operators.
#[derive(Debug)]
pub struct PipelineExecutionContext {
    query_id: u64,
    config: EngineConfig,
    handlers: OperatorHandlerRegistry,
}

impl PipelineExecutionContext {
    /// Creates a context with an empty handler registry.
    #[must_use]
    pub fn new(query_id: u64, config: EngineConfig) -> Self {
        Self {
            query_id,
            config,
            handlers: OperatorHandlerRegistry::new(),
        }
    }

    /// Query this context belongs to.
    #[must_use]
    pub fn query_id(&self) -> u64 {
        self.query_id
    }

    /// Engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Number of worker threads feeding build operators.
    #[must_use]
    pub fn worker_threads(&self) -> usize {
        self.config.worker_threads
    }

    /// The query's handlers.
    #[must_use]
    pub fn handlers(&self) -> &OperatorHandlerRegistry {
        &self.handlers
    }

    /// Registers `handler` and starts it.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::DuplicateHandler`] or a start failure.
    pub fn install<H: OperatorHandler + 'static>(&self, handler: Arc<H>) -> Result<(), OperatorError> {
        self.handlers.register(Arc::clone(&handler))?;
        handler.start(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        id: OperatorHandlerId,
        lifecycle: Lifecycle,
        calls: AtomicUsize,
    }

    impl CountingHandler {
        fn new(id: u64) -> Arc<Self> {
            Arc::new(Self {
                id: OperatorHandlerId(id),
                lifecycle: Lifecycle::new(OperatorHandlerId(id)),
                calls: AtomicUsize::new(0),
            })
        }

        fn call(&self) -> Result<(), OperatorError> {
            let _guard = self.lifecycle.enter()?;
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    impl OperatorHandler for CountingHandler {
        fn id(&self) -> OperatorHandlerId {
            self.id
        }

        fn start(&self, _ctx: &PipelineExecutionContext) -> Result<(), OperatorError> {
            self.lifecycle.start()
        }

        fn stop(&self, _termination: QueryTerminationType) -> Result<Vec<WindowOutput>, OperatorError> {
            let _guard = self.lifecycle.begin_stop();
            Ok(Vec::new())
        }
    }

    struct OtherHandler;

    impl OperatorHandler for OtherHandler {
        fn id(&self) -> OperatorHandlerId {
            OperatorHandlerId(99)
        }

        fn start(&self, _ctx: &PipelineExecutionContext) -> Result<(), OperatorError> {
            Ok(())
        }

        fn stop(&self, _termination: QueryTerminationType) -> Result<Vec<WindowOutput>, OperatorError> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let ctx = PipelineExecutionContext::new(1, EngineConfig::default());
        let handler = CountingHandler::new(7);
        ctx.install(Arc::clone(&handler)).unwrap();

        let found: Arc<CountingHandler> = ctx.handlers().get(OperatorHandlerId(7)).unwrap();
        assert!(Arc::ptr_eq(&found, &handler));
        assert!(matches!(
            ctx.handlers().get::<OtherHandler>(OperatorHandlerId(7)),
            Err(OperatorError::HandlerNotFound(7))
        ));
        assert!(matches!(
            ctx.handlers().get::<CountingHandler>(OperatorHandlerId(8)),
            Err(OperatorError::HandlerNotFound(8))
        ));
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let registry = OperatorHandlerRegistry::new();
        registry.register(CountingHandler::new(1)).unwrap();
        assert!(matches!(
            registry.register(CountingHandler::new(1)),
            Err(OperatorError::DuplicateHandler(1))
        ));
        assert_eq!(registry.len(), 1);
        assert!(registry.deregister(OperatorHandlerId(1)).is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_calls_fail_after_stop() {
        let ctx = PipelineExecutionContext::new(1, EngineConfig::default());
        let handler = CountingHandler::new(3);
        ctx.install(Arc::clone(&handler)).unwrap();
        handler.call().unwrap();

        let flushed = ctx.handlers().stop_all(QueryTerminationType::HardStop).unwrap();
        assert_eq!(flushed.len(), 1);
        assert!(ctx.handlers().is_empty());
        assert!(handler.lifecycle.is_stopped());
        assert!(matches!(handler.call(), Err(OperatorError::HandlerStopped(3))));
        assert!(matches!(
            handler.lifecycle.start(),
            Err(OperatorError::HandlerStopped(3))
        ));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stop_waits_for_in_flight_calls() {
        let handler = CountingHandler::new(5);
        handler.lifecycle.start().unwrap();

        let guard = handler.lifecycle.enter().unwrap();
        let stopper = {
            let handler = Arc::clone(&handler);
            std::thread::spawn(move || handler.stop(QueryTerminationType::HardStop))
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!stopper.is_finished());
        drop(guard);

        stopper.join().unwrap().unwrap();
        assert!(handler.lifecycle.is_stopped());
    }

    #[test]
    fn test_termination_flush_flag() {
        assert!(QueryTerminationType::Graceful.flushes());
        assert!(!QueryTerminationType::HardStop.flushes());
        assert!(!QueryTerminationType::Failure.flushes());
    }
}

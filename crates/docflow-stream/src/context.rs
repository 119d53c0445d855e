//! Execution context confinement
//!
//! A [`Context`] is a serial task queue running on the tokio runtime. Every
//! adapter is bound to the context that created it: callbacks arriving from
//! driver or I/O threads are redispatched onto the context before they touch
//! adapter state, so a consumer never observes concurrent invocations of its
//! handlers.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use docflow_common::{DocFlowError, Result};
use futures::FutureExt;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};

use crate::fault::{Fault, FaultReporter, SharedFaultReporter};

type Task = Box<dyn FnOnce() + Send + 'static>;

tokio::task_local! {
    static CURRENT_CONTEXT: u64;
}

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// Context
// ============================================================================

/// Handle to a single logical execution context
///
/// Cloning the handle is cheap; all clones refer to the same task queue. The
/// queue stops once every handle has been dropped.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    id: u64,
    tasks: mpsc::UnboundedSender<Task>,
    runtime: Handle,
    faults: SharedFaultReporter,
}

impl Context {
    /// Create a context on the current tokio runtime.
    ///
    /// # Panics
    /// Panics when called outside of a tokio runtime.
    pub fn new() -> Self {
        Self::with_fault_reporter(Arc::new(FaultReporter::new()))
    }

    /// Create a context on the current runtime with a shared fault reporter
    pub fn with_fault_reporter(faults: SharedFaultReporter) -> Self {
        Self::on_runtime(Handle::current(), faults)
    }

    /// Create a context on an explicit runtime
    pub fn on_runtime(runtime: Handle, faults: SharedFaultReporter) -> Self {
        let id = NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed);
        let (tasks, mut queue) = mpsc::unbounded_channel::<Task>();

        let task_faults = Arc::clone(&faults);
        runtime.spawn(CURRENT_CONTEXT.scope(id, async move {
            while let Some(task) = queue.recv().await {
                if let Err(panic) = catch_unwind(AssertUnwindSafe(task)) {
                    task_faults.report(
                        Fault::new(DocFlowError::Internal(panic_message(panic.as_ref())))
                            .origin("context")
                            .extra("context_id", id.to_string()),
                    );
                }
            }
            tracing::trace!(context_id = id, "Context task queue closed");
        }));

        Self {
            inner: Arc::new(ContextInner {
                id,
                tasks,
                runtime,
                faults,
            }),
        }
    }

    /// Unique identifier of this context
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Whether the caller is currently running on this context
    pub fn is_current(&self) -> bool {
        CURRENT_CONTEXT
            .try_with(|id| *id == self.inner.id)
            .unwrap_or(false)
    }

    /// The fault reporter of this context
    pub fn faults(&self) -> &SharedFaultReporter {
        &self.inner.faults
    }

    /// Report an error nobody handled
    pub fn report_failure(&self, fault: Fault) {
        self.inner.faults.report(fault);
    }

    /// Enqueue `task` to run on the context, always asynchronously
    pub fn run_on_context<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.inner.tasks.send(Box::new(task)).is_err() {
            tracing::warn!(context_id = self.inner.id, "Context stopped, task dropped");
        }
    }

    /// Run `task` inline when already on the context, otherwise enqueue it
    pub fn dispatch<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_current() {
            task();
        } else {
            self.run_on_context(task);
        }
    }

    /// Run `future` on the runtime and deliver its output to `then` on the
    /// context. A panicking future is delivered as an internal error.
    pub fn execute<Fut, T, F>(&self, future: Fut, then: F)
    where
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
        F: FnOnce(Result<T>) + Send + 'static,
    {
        let context = self.clone();
        self.inner.runtime.spawn(async move {
            let result = match AssertUnwindSafe(future).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => Err(DocFlowError::Internal(panic_message(panic.as_ref()))),
            };
            context.run_on_context(move || then(result));
        });
    }

    /// Run a blocking closure on the blocking pool and deliver its output to
    /// `then` on the context
    pub fn execute_blocking<B, T, F>(&self, blocking: B, then: F)
    where
        B: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
        F: FnOnce(Result<T>) + Send + 'static,
    {
        let context = self.clone();
        let handle = self.inner.runtime.spawn_blocking(blocking);
        self.inner.runtime.spawn(async move {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => Err(DocFlowError::Internal(format!("blocking task failed: {}", e))),
            };
            context.run_on_context(move || then(result));
        });
    }

    /// Run `task` on the context and wait for its result
    pub async fn call<F, R>(&self, task: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.run_on_context(move || {
            let _ = tx.send(task());
        });
        rx.await
            .map_err(|_| DocFlowError::Internal("context dropped the task".to_string()))
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context").field("id", &self.inner.id).finish()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("task panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("task panicked: {}", s)
    } else {
        "task panicked".to_string()
    }
}

// ============================================================================
// Tests
// ============================================================================

//! Fault reporting for errors nobody handled
//!
//! When an adapter fails and the consumer registered no exception handler, the
//! error is surfaced here instead of being dropped. Each [`Context`] owns one
//! reporter; a custom handler may be installed, otherwise faults are logged.
//!
//! [`Context`]: crate::Context

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use docflow_common::DocFlowError;
use parking_lot::RwLock;

// ============================================================================
// Fault
// ============================================================================

/// An error that reached its owning context without an exception handler
#[derive(Debug, Clone)]
pub struct Fault {
    /// The error itself
    pub error: DocFlowError,
    /// Component that raised the fault (e.g. `publisher-adapter`)
    pub origin: Option<String>,
    /// Additional context data
    pub extra: HashMap<String, String>,
}

impl Fault {
    /// Create a new fault from an error
    pub fn new(error: DocFlowError) -> Self {
        Self {
            error,
            origin: None,
            extra: HashMap::new(),
        }
    }

    /// Set the originating component
    pub fn origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// Add extra context
    pub fn extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Format the fault for logging
    pub fn format(&self) -> String {
        let mut parts = vec![format!("Error: {}", self.error)];
        if let Some(ref origin) = self.origin {
            parts.push(format!("Origin: {}", origin));
        }
        for (key, value) in &self.extra {
            parts.push(format!("{}: {}", key, value));
        }
        parts.join("\n")
    }
}

// ============================================================================
// Fault Reporter
// ============================================================================

/// Fault handler function type
pub type FaultHandlerFn = Arc<dyn Fn(&Fault) + Send + Sync>;

/// Collects and dispatches unhandled faults for one execution context
pub struct FaultReporter {
    custom_handler: RwLock<Option<FaultHandlerFn>>,
    log_unhandled: RwLock<bool>,
    history: RwLock<VecDeque<Fault>>,
    max_history: usize,
}

impl FaultReporter {
    /// Create a new reporter that logs faults through `tracing`
    pub fn new() -> Self {
        Self {
            custom_handler: RwLock::new(None),
            log_unhandled: RwLock::new(true),
            history: RwLock::new(VecDeque::new()),
            max_history: 100,
        }
    }

    /// Install a custom fault handler
    pub fn set_handler<F>(&self, handler: F)
    where
        F: Fn(&Fault) + Send + Sync + 'static,
    {
        *self.custom_handler.write() = Some(Arc::new(handler));
    }

    /// Whether a custom handler is installed
    pub fn has_handler(&self) -> bool {
        self.custom_handler.read().is_some()
    }

    /// Remove the custom handler (revert to logging)
    pub fn clear_handler(&self) {
        *self.custom_handler.write() = None;
    }

    /// Set whether faults are logged when no custom handler is installed
    pub fn set_log_unhandled(&self, log: bool) {
        *self.log_unhandled.write() = log;
    }

    /// Report a fault
    pub fn report(&self, fault: Fault) {
        {
            let mut history = self.history.write();
            history.push_back(fault.clone());
            while history.len() > self.max_history {
                history.pop_front();
            }
        }

        // Clone the handler out so it may itself report or reinstall handlers
        let handler = self.custom_handler.read().clone();
        if let Some(handler) = handler {
            handler(&fault);
            return;
        }

        if *self.log_unhandled.read() {
            tracing::error!(
                origin = fault.origin.as_deref().unwrap_or("unknown"),
                error = %fault.error,
                "Unhandled fault in execution context"
            );
        }
    }

    /// Get fault history, oldest first
    pub fn history(&self) -> Vec<Fault> {
        self.history.read().iter().cloned().collect()
    }

    /// Clear fault history
    pub fn clear_history(&self) {
        self.history.write().clear();
    }

    /// Number of faults currently kept in history
    pub fn recent_fault_count(&self) -> usize {
        self.history.read().len()
    }
}

impl Default for FaultReporter {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared fault reporter
pub type SharedFaultReporter = Arc<FaultReporter>;

// ============================================================================
// Tests
// ============================================================================

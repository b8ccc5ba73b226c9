//! Explain-trace collection.

use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::term::Location;

/// Evaluation step kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceOp {
    /// Entering a rule or query.
    Enter,
    /// Evaluating one expression.
    Eval,
    /// Leaving a rule or query with a result.
    Exit,
    /// An expression or rule produced no result.
    Fail,
}

/// One evaluation step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEvent {
    /// Step kind.
    pub op: TraceOp,
    /// Rule or expression being evaluated.
    pub node: String,
    /// Source location of the node, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    /// Nesting depth; zero for the top-level query.
    pub depth: usize,
}

/// Tracer that buffers every event in memory. Clones share the buffer.
#[derive(Debug, Clone, Default)]
pub struct BufferTracer {
    events: Arc<Mutex<Vec<TraceEvent>>>,
}

impl BufferTracer {
    /// An empty tracer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one event.
    pub fn trace(&self, event: TraceEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }

    /// Copy of the events recorded so far.
    #[must_use]
    pub fn events(&self) -> Vec<TraceEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// True if nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }
}

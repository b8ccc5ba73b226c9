//! Decision records and the per-request diagnostics policy.
//!
//! Whether a request's decision is buffered, traced or instrumented is itself
//! decided by policy: the controller evaluates its diagnostics query (by
//! default `data.system.diagnostics.config`) with a description of the
//! request as input. The result selects a [`DiagnosticsMode`]:
//!
//! ```text
//! {"mode": "on"}   buffer the decision record
//! {"mode": "all"}  buffer it with an explain trace and instrumentation
//! ```
//!
//! Anything else, including an evaluation error, disables diagnostics for
//! the request. The decision callback, when configured, sees every record
//! regardless of mode.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::context::Context;
use crate::controller::Controller;
use crate::error::{ArbiterError, ArbiterResult};
use crate::eval::{BufferTracer, Evaluation, Metrics, ResultSet, TraceEvent};

/// Description of one policy decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Info {
    /// Unique id of this decision.
    pub decision_id: String,
    /// Bundle revision current when the decision was made.
    pub revision: String,
    /// When the record was built.
    pub timestamp: DateTime<Utc>,
    /// Address of the caller.
    pub remote_addr: String,
    /// Query that was evaluated.
    pub query: String,
    /// Input the query saw, if any.
    pub input: Option<serde_json::Value>,
    /// Solutions; `None` when the query failed.
    pub results: Option<ResultSet>,
    /// Failure, if the query failed.
    pub error: Option<DecisionError>,
    /// Metrics collected while serving the decision.
    pub metrics: BTreeMap<String, u64>,
    /// Evaluation trace, captured in [`DiagnosticsMode::All`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<Vec<TraceEvent>>,
}

/// Error attached to a decision record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionError {
    /// Machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

impl From<&ArbiterError> for DecisionError {
    fn from(err: &ArbiterError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

/// Sink for decision records. Must accept concurrent pushes.
pub trait DecisionBuffer: Send + Sync {
    /// Store one record.
    fn push(&self, info: Arc<Info>);
}

/// Receives every decision record, independent of diagnostics mode.
pub type DecisionCallback = Arc<dyn Fn(&Context, &Info) + Send + Sync>;

/// Bounded [`DecisionBuffer`] keeping the most recent records.
#[derive(Debug)]
pub struct RingBuffer {
    capacity: usize,
    items: Mutex<VecDeque<Arc<Info>>>,
}

impl RingBuffer {
    /// A buffer holding at most `capacity` records, minimum one.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            items: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Maximum number of records held.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Records currently held, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<Info>> {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Number of records held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// True if no record is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DecisionBuffer for RingBuffer {
    fn push(&self, info: Arc<Info>) {
        let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        if items.len() == self.capacity {
            items.pop_front();
        }
        items.push_back(info);
    }
}

/// What to capture for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticsMode {
    /// Capture nothing beyond the decision callback.
    #[default]
    Off,
    /// Buffer the record only.
    On,
    /// Buffer with trace and instrumentation.
    All,
}

impl DiagnosticsMode {
    /// Mode named by a diagnostics config value; `None` if unrecognised.
    #[must_use]
    pub fn from_config(config: &serde_json::Value) -> Option<Self> {
        match config.get("mode")?.as_str()? {
            "on" => Some(Self::On),
            "all" => Some(Self::All),
            _ => None,
        }
    }
}

/// The parts of an incoming request visible to the diagnostics policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticsRequest {
    /// HTTP method.
    pub method: String,
    /// Request path.
    pub path: String,
    /// Query parameters; repeated keys keep every value.
    #[serde(default)]
    pub params: BTreeMap<String, Vec<String>>,
    /// Address of the caller.
    #[serde(default)]
    pub remote_addr: String,
}

impl DiagnosticsRequest {
    /// Input document for the diagnostics query.
    #[must_use]
    pub fn to_input(&self) -> serde_json::Value {
        serde_json::json!({
            "method": self.method,
            "path": self.path,
            "params": self.params,
        })
    }
}

/// Everything known about one served decision. Fields mirror [`Info`].
#[allow(missing_docs)]
#[derive(Clone, Copy)]
pub struct Decision<'a> {
    pub decision_id: &'a str,
    pub remote_addr: &'a str,
    pub query: &'a str,
    pub input: Option<&'a serde_json::Value>,
    pub results: Option<&'a ResultSet>,
    pub error: Option<&'a ArbiterError>,
    pub metrics: &'a Metrics,
    pub tracer: Option<&'a BufferTracer>,
}

/// Per-request decision logger.
#[derive(Clone, Default)]
pub struct DiagnosticsLogger {
    mode: DiagnosticsMode,
    revision: String,
    buffer: Option<Arc<dyn DecisionBuffer>>,
    callback: Option<DecisionCallback>,
}

impl fmt::Debug for DiagnosticsLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiagnosticsLogger")
            .field("mode", &self.mode)
            .field("revision", &self.revision)
            .field("buffer", &self.buffer.is_some())
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

impl DiagnosticsLogger {
    /// A logger that buffers nothing but still feeds the callback.
    #[must_use]
    pub fn disabled(revision: impl Into<String>, callback: Option<DecisionCallback>) -> Self {
        Self {
            mode: DiagnosticsMode::Off,
            revision: revision.into(),
            buffer: None,
            callback,
        }
    }

    /// Decide diagnostics for one request.
    ///
    /// Never fails: problems evaluating the diagnostics policy are logged at
    /// debug level and disable diagnostics for the request.
    pub fn generate(ctx: &Context, controller: &Controller, request: &DiagnosticsRequest) -> Self {
        let revision = controller.revision();
        let callback = controller.decision_callback();
        let Some(buffer) = controller.diagnostics() else {
            return Self::disabled(revision, callback);
        };

        let mode = match evaluate_mode(ctx, controller, request) {
            Ok(mode) => mode,
            Err(err) => {
                tracing::debug!(
                    error = %err,
                    query = %controller.config().diagnostics_query,
                    "diagnostics config evaluation failed"
                );
                DiagnosticsMode::Off
            }
        };
        if mode == DiagnosticsMode::Off {
            return Self::disabled(revision, callback);
        }
        Self {
            mode,
            revision,
            buffer: Some(buffer),
            callback,
        }
    }

    /// Mode chosen for this request.
    #[must_use]
    pub const fn mode(&self) -> DiagnosticsMode {
        self.mode
    }

    /// Revision captured when the logger was generated.
    #[must_use]
    pub fn revision(&self) -> &str {
        &self.revision
    }

    /// Whether records are pushed to the buffer.
    #[must_use]
    pub const fn enabled(&self) -> bool {
        !matches!(self.mode, DiagnosticsMode::Off)
    }

    /// Whether the caller should collect an explain trace.
    #[must_use]
    pub const fn explain(&self) -> bool {
        matches!(self.mode, DiagnosticsMode::All)
    }

    /// Whether the caller should enable evaluation instrumentation.
    #[must_use]
    pub const fn instrument(&self) -> bool {
        matches!(self.mode, DiagnosticsMode::All)
    }

    /// Tracer to hand to the evaluation, if this request is explained.
    #[must_use]
    pub fn tracer(&self) -> Option<BufferTracer> {
        self.explain().then(BufferTracer::new)
    }

    /// Build the record for `decision`, hand it to the callback and, when
    /// enabled, to the buffer.
    pub fn log(&self, ctx: &Context, decision: Decision<'_>) -> Arc<Info> {
        let info = Arc::new(Info {
            decision_id: decision.decision_id.to_string(),
            revision: self.revision.clone(),
            timestamp: Utc::now(),
            remote_addr: decision.remote_addr.to_string(),
            query: decision.query.to_string(),
            input: decision.input.cloned(),
            results: decision.results.cloned(),
            error: decision.error.map(DecisionError::from),
            metrics: decision.metrics.all(),
            trace: decision
                .tracer
                .filter(|_| self.explain())
                .map(BufferTracer::events),
        });

        if let Some(callback) = &self.callback {
            callback(ctx, &info);
        }
        if let (true, Some(buffer)) = (self.enabled(), &self.buffer) {
            buffer.push(Arc::clone(&info));
        }
        info
    }
}

fn evaluate_mode(
    ctx: &Context,
    controller: &Controller,
    request: &DiagnosticsRequest,
) -> ArbiterResult<DiagnosticsMode> {
    let store = controller.store();
    let results = Evaluation::new(
        store.as_ref(),
        controller.compiler(),
        controller.config().diagnostics_query.as_str(),
    )
    .raw_input(Some(request.to_input()))
    .eval(ctx)?;

    let [result] = results.as_slice() else {
        return Ok(DiagnosticsMode::Off);
    };
    Ok(result
        .expressions
        .first()
        .filter(|e| e.value.is_object())
        .and_then(|e| DiagnosticsMode::from_config(&e.value))
        .unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    fn decision<'a>(metrics: &'a Metrics, tracer: Option<&'a BufferTracer>) -> Decision<'a> {
        Decision {
            decision_id: "d-1",
            remote_addr: "10.0.0.1:5000",
            query: "data.x",
            input: None,
            results: None,
            error: None,
            metrics,
            tracer,
        }
    }

    #[test]
    fn ring_buffer_keeps_most_recent() {
        let buf = Arc::new(RingBuffer::new(2));
        let logger = DiagnosticsLogger {
            mode: DiagnosticsMode::On,
            revision: "r".into(),
            buffer: Some(buf.clone()),
            callback: None,
        };
        let m = Metrics::new();
        for id in ["a", "b", "c"] {
            let mut d = decision(&m, None);
            d.decision_id = id;
            logger.log(&Context::background(), d);
        }
        let ids: Vec<String> = buf.snapshot().iter().map(|i| i.decision_id.clone()).collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn disabled_logger_only_calls_callback() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let cb: DecisionCallback = Arc::new(move |_ctx: &Context, info: &Info| {
            sink.lock().unwrap().push(info.decision_id.clone());
        });
        let logger = DiagnosticsLogger::disabled("rev-1", Some(cb));
        assert!(!logger.enabled());
        assert!(!logger.explain() && !logger.instrument());
        assert!(logger.tracer().is_none());

        let m = Metrics::new();
        let info = logger.log(&Context::background(), decision(&m, None));
        assert_eq!(info.revision, "rev-1");
        assert_eq!(*seen.lock().unwrap(), vec!["d-1".to_string()]);
    }

    #[test]
    fn trace_attached_only_in_full_mode() {
        let tracer = BufferTracer::new();
        tracer.trace(TraceEvent {
            op: crate::eval::TraceOp::Enter,
            node: "data.x".into(),
            location: None,
            depth: 0,
        });
        let m = Metrics::new();

        let basic = DiagnosticsLogger {
            mode: DiagnosticsMode::On,
            ..DiagnosticsLogger::default()
        };
        assert!(basic.log(&Context::background(), decision(&m, Some(&tracer))).trace.is_none());

        let full = DiagnosticsLogger {
            mode: DiagnosticsMode::All,
            ..DiagnosticsLogger::default()
        };
        let info = full.log(&Context::background(), decision(&m, Some(&tracer)));
        assert_eq!(info.trace.as_ref().map(Vec::len), Some(1));
    }

    #[test]
    fn mode_from_config() {
        assert_eq!(DiagnosticsMode::from_config(&json!({"mode": "on"})), Some(DiagnosticsMode::On));
        assert_eq!(DiagnosticsMode::from_config(&json!({"mode": "all"})), Some(DiagnosticsMode::All));
        assert_eq!(DiagnosticsMode::from_config(&json!({"mode": "verbose"})), None);
        assert_eq!(DiagnosticsMode::from_config(&json!({"mode": 1})), None);
        assert_eq!(DiagnosticsMode::from_config(&json!({})), None);
    }

    #[test]
    fn info_serializes_with_nullable_fields() {
        let m = Metrics::new();
        m.incr("counter_x");
        let info = DiagnosticsLogger::disabled("r", None).log(&Context::background(), decision(&m, None));
        let v = serde_json::to_value(info.as_ref()).unwrap();
        assert_eq!(v["results"], serde_json::Value::Null);
        assert_eq!(v["error"], serde_json::Value::Null);
        assert_eq!(v["metrics"]["counter_x"], json!(1));
        assert!(v.get("trace").is_none());
    }
}

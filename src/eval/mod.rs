//! Query evaluation against a compiled policy and a store.
//!
//! [`Evaluation`] composes the pieces of one query: the policy, the store and
//! (optionally) a caller-owned transaction, the input document, a metrics
//! collector and a tracer. [`Evaluation::partial`] captures every base
//! document a query depends on so it can be evaluated again later with only
//! an input.

mod evaluator;
pub mod metrics;
pub mod trace;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::context::{Context, ContextError};
use crate::policy::ast::Query;
use crate::policy::compiler::{check_query, CompiledPolicy, Diagnostic};
use crate::policy::parser::{parse_query, ParseError};
use crate::storage::{Path, StorageError, Store, Transaction, TransactionParams};
use crate::term::{Location, Term};

use evaluator::{DataSource, Evaluator, SnapshotSource, StoreSource};
pub use metrics::Metrics;
pub use trace::{BufferTracer, TraceEvent, TraceOp};

/// Errors raised while evaluating a query.
#[derive(Debug, Error)]
pub enum EvalError {
    /// The query text did not parse.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// The query uses variables it never binds.
    #[error("rego_unsafe_var_error: {}", join_diagnostics(.0))]
    UnsafeQuery(Vec<Diagnostic>),

    /// Two definitions of a complete rule produced different values.
    #[error("eval_conflict_error: complete rules must not produce multiple outputs: {rule}")]
    Conflict {
        /// Name of the conflicting rule.
        rule: String,
    },

    /// A rule depends on itself.
    #[error("eval_recursion_error: rule {rule} is recursive")]
    Recursion {
        /// Name of the recursive rule.
        rule: String,
    },

    /// Context cancelled or deadline exceeded mid-evaluation.
    #[error("eval_cancel_error: {0}")]
    Cancelled(#[from] ContextError),

    /// Reading a base document failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// A prepared result was asked for a document it did not capture.
    #[error("eval_internal_error: {path} not captured by partial result")]
    SnapshotMiss {
        /// Path the evaluation asked for.
        path: Path,
    },
}

impl EvalError {
    /// True if evaluation stopped because the context ended.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_) | Self::Storage(StorageError::Cancelled(_)))
    }

    /// True if the query itself was rejected.
    #[must_use]
    pub const fn is_parse_error(&self) -> bool {
        matches!(self, Self::Parse(_) | Self::UnsafeQuery(_))
    }
}

fn join_diagnostics(diags: &[Diagnostic]) -> String {
    diags
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Value of one query expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpressionValue {
    /// Value the expression evaluated to.
    pub value: serde_json::Value,
    /// Source text of the expression.
    pub text: String,
    /// Where the expression appears in the query.
    pub location: Location,
}

/// One solution of a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    /// Value of every query expression, in order.
    pub expressions: Vec<ExpressionValue>,
    /// Values of the query's named variables.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub bindings: BTreeMap<String, serde_json::Value>,
}

/// Ordered query solutions; empty when the query is undefined.
pub type ResultSet = Vec<QueryResult>;

/// Builder for a single query evaluation.
pub struct Evaluation<'a> {
    store: &'a dyn Store,
    policy: Arc<CompiledPolicy>,
    query: String,
    parsed_input: Option<Term>,
    raw_input: Option<serde_json::Value>,
    metrics: Metrics,
    instrument: bool,
    tracer: Option<BufferTracer>,
    transaction: Option<&'a Transaction>,
}

impl<'a> Evaluation<'a> {
    /// Evaluate `query` against `policy` and data in `store`.
    pub fn new(store: &'a dyn Store, policy: Arc<CompiledPolicy>, query: impl Into<String>) -> Self {
        Self {
            store,
            policy,
            query: query.into(),
            parsed_input: None,
            raw_input: None,
            metrics: Metrics::new(),
            instrument: false,
            tracer: None,
            transaction: None,
        }
    }

    /// Input given as an already-parsed term. Takes precedence over raw input.
    #[must_use]
    pub fn parsed_input(mut self, input: Option<Term>) -> Self {
        self.parsed_input = input;
        self
    }

    /// Input given as JSON.
    #[must_use]
    pub fn raw_input(mut self, input: Option<serde_json::Value>) -> Self {
        self.raw_input = input;
        self
    }

    /// Record into `metrics` instead of a fresh collector.
    #[must_use]
    pub fn metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Record per-stage counters.
    #[must_use]
    pub fn instrument(mut self, yes: bool) -> Self {
        self.instrument = yes;
        self
    }

    /// Send trace events to `tracer`.
    #[must_use]
    pub fn tracer(mut self, tracer: Option<BufferTracer>) -> Self {
        self.tracer = tracer;
        self
    }

    /// Evaluate inside `txn` instead of a private read transaction.
    #[must_use]
    pub fn transaction(mut self, txn: Option<&'a Transaction>) -> Self {
        self.transaction = txn;
        self
    }

    fn input(&self) -> Option<Term> {
        self.parsed_input
            .clone()
            .or_else(|| self.raw_input.as_ref().map(Term::from))
    }

    fn parse(&self) -> Result<Query, EvalError> {
        let timer = self.metrics.timer(metrics::TIMER_QUERY_PARSE);
        let parsed = parse_query(&self.query);
        timer.stop();
        let query = parsed?;
        check_query(&query).map_err(EvalError::UnsafeQuery)?;
        Ok(query)
    }

    /// Run `f` inside the configured transaction, or a private read
    /// transaction that is aborted afterwards.
    fn with_txn<R>(
        &self,
        ctx: &Context,
        f: impl FnOnce(&Transaction) -> Result<R, EvalError>,
    ) -> Result<R, EvalError> {
        if let Some(txn) = self.transaction {
            return f(txn);
        }
        let txn = self.store.new_transaction(ctx, TransactionParams::READ)?;
        let out = f(&txn);
        self.store.abort(ctx, txn);
        out
    }

    /// Evaluate the query.
    pub fn eval(&self, ctx: &Context) -> Result<ResultSet, EvalError> {
        let query = self.parse()?;
        let input = self.input();
        self.with_txn(ctx, |txn| {
            let source = StoreSource {
                store: self.store,
                txn,
            };
            let timer = self.metrics.timer(metrics::TIMER_QUERY_EVAL);
            let out = Evaluator::new(
                ctx,
                &self.policy,
                &source,
                input.as_ref(),
                &self.metrics,
                self.instrument,
                self.tracer.as_ref(),
            )
            .eval_query(&query);
            timer.stop();
            out
        })
    }

    /// Capture the query and the base documents it depends on.
    pub fn partial(&self, ctx: &Context) -> Result<PartialResult, EvalError> {
        let query = self.parse()?;
        self.with_txn(ctx, |txn| {
            let timer = self.metrics.timer(metrics::TIMER_PARTIAL_PREPARE);
            let source = StoreSource {
                store: self.store,
                txn,
            };
            let mut snapshot = BTreeMap::new();
            for path in self.policy.data_dependencies(&query) {
                let value = source.read(ctx, &path)?;
                snapshot.insert(path, value);
            }
            timer.stop();
            Ok(PartialResult {
                query_text: self.query.clone(),
                query,
                policy: Arc::clone(&self.policy),
                snapshot,
            })
        })
    }
}

/// A query prepared ahead of time: parsed, checked and bound to the data it
/// reads. Evaluating it touches no store.
#[derive(Debug, Clone)]
pub struct PartialResult {
    query_text: String,
    query: Query,
    policy: Arc<CompiledPolicy>,
    snapshot: BTreeMap<Path, Option<serde_json::Value>>,
}

impl PartialResult {
    /// Query text the result was prepared from.
    #[must_use]
    pub fn query_text(&self) -> &str {
        &self.query_text
    }

    /// Compiled policy the result was prepared against.
    #[must_use]
    pub fn policy(&self) -> &Arc<CompiledPolicy> {
        &self.policy
    }

    /// Data paths captured when the result was prepared.
    #[must_use]
    pub fn dependencies(&self) -> BTreeSet<Path> {
        self.snapshot.keys().cloned().collect()
    }

    /// Evaluate against the captured data with `input`. Never touches the
    /// store.
    pub fn eval(
        &self,
        ctx: &Context,
        input: Option<&Term>,
        metrics: &Metrics,
        instrument: bool,
        tracer: Option<&BufferTracer>,
    ) -> Result<ResultSet, EvalError> {
        let source = SnapshotSource {
            snapshot: &self.snapshot,
        };
        let timer = metrics.timer(metrics::TIMER_QUERY_EVAL);
        let out = Evaluator::new(ctx, &self.policy, &source, input, metrics, instrument, tracer)
            .eval_query(&self.query);
        timer.stop();
        out
    }
}

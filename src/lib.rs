//! # arbiter - transactional policy decisions
//!
//! arbiter evaluates queries against a compiled policy and a transactional
//! JSON document store, and keeps the derived state around those queries
//! consistent as data and policy change underneath them.
//!
//! ## Core Concepts
//!
//! - **Controller**: opens and bounds transactions around evaluation, owns
//!   the prepared-query cache, the change watcher and the data revision
//! - **Store**: transactional document store with synchronous commit triggers
//! - **CompilerManager**: holds the active compiled policy and runs hooks when
//!   a new one is activated
//! - **Watcher**: live query subscriptions that survive policy changes
//! - **DiagnosticsLogger**: per-request, policy-driven choice of what to
//!   capture about a decision
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use arbiter::{Context, Controller, InMemoryStore, PolicyManager, QueryRequest};
//!
//! let store = Arc::new(InMemoryStore::new());
//! let controller = Controller::builder()
//!     .with_store(store)
//!     .with_manager(Arc::new(PolicyManager::new()))
//!     .build()?;
//! controller.init(&Context::background())?;
//!
//! let response = controller
//!     .exec_query(&Context::background(), &QueryRequest::new("x = 1"))
//!     .into_result()?;
//! assert_eq!(response.results[0].bindings["x"], 1);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod cache;
pub mod context;
pub mod controller;
pub mod diagnostics;
pub mod error;
pub mod eval;
pub mod policy;
pub mod storage;
pub mod term;
pub mod watch;

pub use cache::PartialResultCache;
pub use context::{Context, ContextError};
pub use controller::{
    Controller, ControllerBuilder, ControllerConfig, DecisionIdFactory, FatalHook, QueryOutcome,
    QueryRequest, QueryResponse,
};
pub use diagnostics::{
    Decision, DecisionBuffer, DecisionCallback, DiagnosticsLogger, DiagnosticsMode,
    DiagnosticsRequest, Info, RingBuffer,
};
pub use error::{
    is_entry_exists_error, is_module_parse_error, ArbiterError, ArbiterResult, ClassifiedError,
    CompileError, FatalError, ValidationError, WrappedError, ENTRY_EXISTS_ERR, MODULE_PARSE_ERR,
};
pub use eval::{
    BufferTracer, EvalError, Evaluation, ExpressionValue, Metrics, PartialResult, QueryResult,
    ResultSet, TraceEvent, TraceOp,
};
pub use policy::{CompiledPolicy, CompilerManager, PolicyManager, RecompileTrigger};
pub use storage::{
    CommitTrigger, InMemoryStore, PatchOp, Path, StorageError, Store, Transaction,
    TransactionParams, TriggerEvent, TriggerHandle,
};
pub use term::{Location, Term, TermValue};
pub use watch::{WatchError, WatchEvent, WatchEventKind, WatchHandle, Watcher};

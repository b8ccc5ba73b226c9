//! Decision controller.
//!
//! The controller sits between callers and the policy engine. It opens and
//! bounds the transactions queries run in, keeps the prepared-query cache
//! consistent with committed data and the active policy, keeps the change
//! watcher bound to the active policy, and tracks the data revision reported
//! by the bundle manifest.
//!
//! Two hooks keep that state current. Both run synchronously on the thread
//! that commits or recompiles:
//!
//! - a commit trigger on the store, which re-reads the manifest revision and
//!   drops every prepared query;
//! - a recompile trigger on the compiler manager, which migrates the watcher
//!   to the new policy.
//!
//! A manifest revision of the wrong type and a failed watcher migration are
//! unrecoverable: the controller logs, calls the fatal hook if one is
//! configured, and panics.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use uuid::Uuid;

use crate::cache::PartialResultCache;
use crate::context::Context;
use crate::diagnostics::{
    Decision, DecisionBuffer, DecisionCallback, DiagnosticsLogger, DiagnosticsRequest, Info,
};
use crate::error::{
    codes, ArbiterError, ArbiterResult, ClassifiedError, CompileError, FatalError,
    ValidationError, WrappedError, ENTRY_EXISTS_ERR, MODULE_PARSE_ERR,
};
use crate::eval::metrics::COUNTER_PARTIAL_CACHE_HIT;
use crate::eval::{BufferTracer, Evaluation, Metrics, PartialResult, ResultSet};
use crate::policy::ast::Module;
use crate::policy::compiler::{compile, CompiledPolicy};
use crate::policy::manager::{CompilerManager, RecompileTrigger};
use crate::policy::parser::{parse_module, parse_query};
use crate::storage::{
    CommitTrigger, Path, StorageError, Store, Transaction, TransactionParams, TriggerEvent,
    TriggerHandle,
};
use crate::term::Term;
use crate::watch::{WatchError, WatchHandle, Watcher};

/// Produces a fresh decision id.
pub type DecisionIdFactory = Arc<dyn Fn() -> String + Send + Sync>;

/// Called with the fatal condition just before the controller panics.
pub type FatalHook = Arc<dyn Fn(&FatalError) + Send + Sync>;

/// Tunables for a [`Controller`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Most compiler diagnostics reported per compile; zero means unlimited.
    pub compiler_error_limit: usize,
    /// Store path holding the bundle revision string.
    pub revision_path: String,
    /// Query deciding per-request diagnostics.
    pub diagnostics_query: String,
    /// Per-subscription buffer of the change watcher.
    pub watch_stream_capacity: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            compiler_error_limit: 10,
            revision_path: "/system/bundle/manifest/revision".to_string(),
            diagnostics_query: "data.system.diagnostics.config".to_string(),
            watch_stream_capacity: 64,
        }
    }
}

/// One query to execute.
#[derive(Debug, Clone, Default)]
pub struct QueryRequest<'a> {
    /// Query text, e.g. `x = data.limits.max`.
    pub query: String,
    /// Input as a term. Wins over `raw_input` when both are set.
    pub parsed_input: Option<Term>,
    /// Input as JSON.
    pub raw_input: Option<serde_json::Value>,
    /// Collect per-stage evaluation metrics.
    pub instrument: bool,
    /// Receives evaluation trace events.
    pub tracer: Option<BufferTracer>,
    /// Caller-owned transaction to evaluate in. Never closed by the controller.
    pub transaction: Option<&'a Transaction>,
}

impl<'a> QueryRequest<'a> {
    /// A request for `query` with no input.
    #[must_use]
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }

    /// Set the JSON input.
    #[must_use]
    pub fn with_raw_input(mut self, input: serde_json::Value) -> Self {
        self.raw_input = Some(input);
        self
    }

    /// Set the input as an already parsed term.
    #[must_use]
    pub fn with_parsed_input(mut self, input: Term) -> Self {
        self.parsed_input = Some(input);
        self
    }

    /// Turn instrumentation on or off.
    #[must_use]
    pub fn with_instrument(mut self, yes: bool) -> Self {
        self.instrument = yes;
        self
    }

    /// Trace evaluation into `tracer`.
    #[must_use]
    pub fn with_tracer(mut self, tracer: BufferTracer) -> Self {
        self.tracer = Some(tracer);
        self
    }

    /// Evaluate inside `txn`, which stays open afterwards.
    #[must_use]
    pub fn with_transaction(mut self, txn: &'a Transaction) -> Self {
        self.transaction = Some(txn);
        self
    }

    fn input_term(&self) -> Option<Term> {
        self.parsed_input
            .clone()
            .or_else(|| self.raw_input.as_ref().map(Term::from))
    }

    /// Input as it should appear in a decision record.
    fn input_json(&self) -> Option<serde_json::Value> {
        match &self.parsed_input {
            Some(term) => term.to_json(),
            None => self.raw_input.clone(),
        }
    }
}

/// Results of a query with the metrics collected while producing them.
#[derive(Debug, Clone)]
pub struct QueryResponse {
    /// Query solutions; empty when the query is undefined.
    pub results: ResultSet,
    /// Timers and counters recorded during the query.
    pub metrics: Metrics,
}

/// A query response together with the error, if the query failed.
///
/// Metrics are kept on failure too.
#[derive(Debug)]
pub struct QueryOutcome {
    /// Results, empty on failure, and metrics.
    pub response: QueryResponse,
    /// Why the query failed, if it did.
    pub error: Option<ArbiterError>,
}

impl QueryOutcome {
    fn new(metrics: Metrics, result: ArbiterResult<ResultSet>) -> Self {
        match result {
            Ok(results) => Self {
                response: QueryResponse { results, metrics },
                error: None,
            },
            Err(err) => Self {
                response: QueryResponse {
                    results: ResultSet::new(),
                    metrics,
                },
                error: Some(err),
            },
        }
    }

    /// True if the query succeeded.
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// Metrics, available whether or not the query succeeded.
    #[must_use]
    pub const fn metrics(&self) -> &Metrics {
        &self.response.metrics
    }

    /// The response, or the error if the query failed.
    pub fn into_result(self) -> ArbiterResult<QueryResponse> {
        match self.error {
            None => Ok(self.response),
            Some(err) => Err(err),
        }
    }
}

#[derive(Default)]
struct ControllerState {
    initialized: bool,
    revision: String,
    partials: PartialResultCache,
    /// Bumped on every invalidation; a prepared result computed across a
    /// bump is not cached.
    generation: u64,
    watcher: Option<Arc<Watcher>>,
}

/// Builder for [`Controller`].
#[derive(Default)]
pub struct ControllerBuilder {
    store: Option<Arc<dyn Store>>,
    manager: Option<Arc<dyn CompilerManager>>,
    config: ControllerConfig,
    diagnostics: Option<Arc<dyn DecisionBuffer>>,
    decision_callback: Option<DecisionCallback>,
    decision_id_factory: Option<DecisionIdFactory>,
    fatal_hook: Option<FatalHook>,
}

impl ControllerBuilder {
    /// Store the controller reads and watches. Required.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Compiler manager holding the active policy. Required.
    #[must_use]
    pub fn with_manager(mut self, manager: Arc<dyn CompilerManager>) -> Self {
        self.manager = Some(manager);
        self
    }

    /// Cap the diagnostics reported per compile; zero means unlimited.
    #[must_use]
    pub fn with_compiler_error_limit(mut self, limit: usize) -> Self {
        self.config.compiler_error_limit = limit;
        self
    }

    /// Buffer that receives decision records when diagnostics are on.
    #[must_use]
    pub fn with_diagnostics_buffer(mut self, buffer: Arc<dyn DecisionBuffer>) -> Self {
        self.diagnostics = Some(buffer);
        self
    }

    /// Callback invoked with every decision record.
    #[must_use]
    pub fn with_decision_logger(mut self, callback: DecisionCallback) -> Self {
        self.decision_callback = Some(callback);
        self
    }

    /// Override how decision ids are generated. Defaults to random UUIDs.
    #[must_use]
    pub fn with_decision_id_factory(mut self, factory: DecisionIdFactory) -> Self {
        self.decision_id_factory = Some(factory);
        self
    }

    /// Called with the fatal condition before the controller panics.
    #[must_use]
    pub fn with_fatal_hook(mut self, hook: FatalHook) -> Self {
        self.fatal_hook = Some(hook);
        self
    }

    /// Replace the whole config. Call before `with_compiler_error_limit`
    /// if both are used.
    #[must_use]
    pub fn with_config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Validate and build. The controller is unusable until
    /// [`Controller::init`] succeeds.
    pub fn build(self) -> ArbiterResult<Arc<Controller>> {
        let store = self.store.ok_or_else(|| ValidationError::MissingField {
            field: "store".to_string(),
        })?;
        let manager = self.manager.ok_or_else(|| ValidationError::MissingField {
            field: "manager".to_string(),
        })?;
        let revision_path =
            Path::parse(&self.config.revision_path).map_err(|e| ValidationError::InvalidValue {
                field: "revision_path".to_string(),
                reason: e.to_string(),
            })?;
        parse_query(&self.config.diagnostics_query).map_err(|e| ValidationError::InvalidValue {
            field: "diagnostics_query".to_string(),
            reason: e.to_string(),
        })?;
        if self.config.watch_stream_capacity == 0 {
            return Err(ValidationError::InvalidValue {
                field: "watch_stream_capacity".to_string(),
                reason: "must be positive".to_string(),
            }
            .into());
        }

        let decision_id_factory: DecisionIdFactory = match self.decision_id_factory {
            Some(factory) => factory,
            None => Arc::new(|| Uuid::new_v4().to_string()),
        };

        Ok(Arc::new(Controller {
            store,
            manager,
            revision_path,
            config: self.config,
            diagnostics: self.diagnostics,
            decision_callback: self.decision_callback,
            decision_id_factory,
            fatal_hook: self.fatal_hook,
            state: RwLock::new(ControllerState::default()),
            migrate_lock: Mutex::new(()),
            recompile_hooked: AtomicBool::new(false),
        }))
    }
}

/// Policy decision controller. See the module docs.
pub struct Controller {
    store: Arc<dyn Store>,
    manager: Arc<dyn CompilerManager>,
    config: ControllerConfig,
    revision_path: Path,
    diagnostics: Option<Arc<dyn DecisionBuffer>>,
    decision_callback: Option<DecisionCallback>,
    decision_id_factory: DecisionIdFactory,
    fatal_hook: Option<FatalHook>,
    state: RwLock<ControllerState>,
    /// Serialises watcher migrations without blocking queries.
    migrate_lock: Mutex<()>,
    /// The manager keeps hooks for its lifetime; register ours at most once.
    recompile_hooked: AtomicBool,
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("config", &self.config)
            .field("revision", &self.revision())
            .field("watcher", &self.watcher_id())
            .finish_non_exhaustive()
    }
}

struct ReloadTrigger(Weak<Controller>);

impl CommitTrigger for ReloadTrigger {
    fn on_commit(&self, ctx: &Context, txn: &Transaction, _event: &TriggerEvent) {
        if let Some(controller) = self.0.upgrade() {
            controller.reload(ctx, txn);
        }
    }
}

struct MigrateTrigger(Weak<Controller>);

impl RecompileTrigger for MigrateTrigger {
    fn on_recompile(&self, ctx: &Context, txn: &Transaction, policy: &Arc<CompiledPolicy>) {
        if let Some(controller) = self.0.upgrade() {
            controller.migrate_watcher(ctx, txn, policy);
        }
    }
}

impl Controller {
    /// Start building a controller.
    #[must_use]
    pub fn builder() -> ControllerBuilder {
        ControllerBuilder::default()
    }

    fn read_state(&self) -> RwLockReadGuard<'_, ControllerState> {
        // State updates are single assignments; a poisoned guard is consistent.
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, ControllerState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register the controller's hooks and build the initial watcher, all in
    /// one write transaction.
    ///
    /// On error the transaction is aborted, any store trigger registered for
    /// it is removed and the controller stays uninitialised, so the caller may
    /// retry. The recompile hook is registered once per controller and is a
    /// no-op until a watcher exists.
    pub fn init(self: &Arc<Self>, ctx: &Context) -> ArbiterResult<()> {
        if self.read_state().initialized {
            return Err(ClassifiedError::new(
                codes::RESOURCE_CONFLICT,
                "controller already initialized",
            )
            .into());
        }

        if !self.recompile_hooked.swap(true, Ordering::AcqRel) {
            self.manager
                .register_compiler_trigger(Arc::new(MigrateTrigger(Arc::downgrade(self))));
        }

        let txn = self.store.new_transaction(ctx, TransactionParams::WRITE)?;
        let (handle, watcher) = match self.init_in(ctx, &txn) {
            Ok(hooks) => hooks,
            Err(err) => {
                self.store.abort(ctx, txn);
                return Err(err);
            }
        };

        let watcher = Arc::new(watcher);
        let watcher_id = watcher.id();
        {
            let mut state = self.write_state();
            state.watcher = Some(Arc::clone(&watcher));
            state.partials.clear();
            state.generation += 1;
            state.initialized = true;
        }
        if let Err(err) = self.store.commit(ctx, txn) {
            {
                let mut state = self.write_state();
                state.watcher = None;
                state.partials.clear();
                state.generation += 1;
                state.initialized = false;
            }
            self.detach(ctx, handle, &watcher);
            return Err(err.into());
        }
        tracing::info!(watcher = %watcher_id, "decision controller initialized");
        Ok(())
    }

    fn init_in(
        self: &Arc<Self>,
        ctx: &Context,
        txn: &Transaction,
    ) -> ArbiterResult<(TriggerHandle, Watcher)> {
        let handle = self
            .store
            .register(ctx, txn, Arc::new(ReloadTrigger(Arc::downgrade(self))))?;

        let watcher = Watcher::new(
            ctx,
            Arc::clone(&self.store),
            self.compiler(),
            txn,
            self.config.watch_stream_capacity,
        )
        .map_err(|err| {
            if let Err(cleanup) = self.store.unregister(ctx, txn, handle) {
                tracing::warn!(error = %cleanup, "failed to remove reload trigger");
            }
            ArbiterError::from(err)
        })?;
        Ok((handle, watcher))
    }

    /// Best-effort removal of the store triggers of a failed `init`.
    fn detach(&self, ctx: &Context, handle: TriggerHandle, watcher: &Watcher) {
        let txn = match self.store.new_transaction(ctx, TransactionParams::WRITE) {
            Ok(txn) => txn,
            Err(err) => {
                tracing::warn!(error = %err, "cannot open transaction to remove init triggers");
                return;
            }
        };
        if let Err(err) = self.store.unregister(ctx, &txn, handle) {
            tracing::warn!(error = %err, "failed to remove reload trigger");
        }
        if let Err(err) = watcher.close(ctx, &txn) {
            tracing::warn!(error = %err, "failed to remove watch trigger");
        }
        if let Err(err) = self.store.commit(ctx, txn) {
            tracing::warn!(error = %err, "failed to commit init cleanup");
        }
    }

    /// Commit hook: pick up the manifest revision and drop prepared queries.
    fn reload(&self, ctx: &Context, txn: &Transaction) {
        let revision = match self.store.read(ctx, txn, &self.revision_path) {
            Ok(serde_json::Value::String(rev)) => Some(rev),
            Ok(other) => self.fail_fast(FatalError::BadRevision {
                path: self.revision_path.clone(),
                found: json_type(&other).to_string(),
            }),
            Err(StorageError::NotFound { .. }) => None,
            Err(source) => self.fail_fast(FatalError::RevisionRead {
                path: self.revision_path.clone(),
                source,
            }),
        };

        let mut state = self.write_state();
        if let Some(rev) = revision {
            if rev != state.revision {
                tracing::debug!(from = %state.revision, to = %rev, "revision changed");
            }
            state.revision = rev;
        }
        let dropped = state.partials.len();
        state.partials.clear();
        state.generation += 1;
        tracing::debug!(txn = %txn.id(), dropped, "reloaded after commit");
    }

    /// Recompile hook: rebind the watcher to `policy`.
    fn migrate_watcher(&self, ctx: &Context, txn: &Transaction, policy: &Arc<CompiledPolicy>) {
        let _migrating = self.migrate_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.read_state().watcher.clone();
        let Some(current) = current else {
            tracing::debug!("recompiled before watcher was built; nothing to migrate");
            return;
        };

        let next = match current.migrate(ctx, Arc::clone(policy), txn) {
            Ok(next) => next,
            Err(source) => self.fail_fast(FatalError::WatcherMigration { source }),
        };
        tracing::debug!(from = %current.id(), to = %next.id(), "watcher migrated");

        let mut state = self.write_state();
        state.watcher = Some(Arc::new(next));
        state.partials.clear();
        state.generation += 1;
    }

    /// Log, notify the fatal hook and halt.
    fn fail_fast(&self, err: FatalError) -> ! {
        tracing::error!(error = %err, "decision controller cannot continue");
        if let Some(hook) = &self.fatal_hook {
            hook(&err);
        }
        panic!("fatal: {err}");
    }

    /// Active compiled policy.
    #[must_use]
    pub fn compiler(&self) -> Arc<CompiledPolicy> {
        self.manager.get_compiler()
    }

    /// Store this controller reads from.
    #[must_use]
    pub fn store(&self) -> Arc<dyn Store> {
        Arc::clone(&self.store)
    }

    /// Decision buffer, if diagnostics are configured.
    #[must_use]
    pub fn diagnostics(&self) -> Option<Arc<dyn DecisionBuffer>> {
        self.diagnostics.clone()
    }

    /// Callback receiving every decision record, if any.
    #[must_use]
    pub fn decision_callback(&self) -> Option<DecisionCallback> {
        self.decision_callback.clone()
    }

    /// Effective configuration.
    #[must_use]
    pub const fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Last revision seen in the bundle manifest; empty until one is committed.
    #[must_use]
    pub fn revision(&self) -> String {
        self.read_state().revision.clone()
    }

    /// Identity of the current watcher; `None` before `init`.
    #[must_use]
    pub fn watcher_id(&self) -> Option<Uuid> {
        self.read_state().watcher.as_ref().map(|w| w.id())
    }

    /// A fresh decision id from the configured factory.
    #[must_use]
    pub fn next_decision_id(&self) -> String {
        (self.decision_id_factory)()
    }

    /// Open a transaction on the underlying store.
    pub fn new_transaction(
        &self,
        ctx: &Context,
        params: TransactionParams,
    ) -> ArbiterResult<Transaction> {
        Ok(self.store.new_transaction(ctx, params)?)
    }

    /// Discard `txn` and its staged writes.
    pub fn abort(&self, ctx: &Context, txn: Transaction) {
        self.store.abort(ctx, txn);
    }

    /// Commit `txn`. The controller's commit hook runs before the writes
    /// become visible to other transactions.
    pub fn commit(&self, ctx: &Context, txn: Transaction) -> ArbiterResult<()> {
        Ok(self.store.commit(ctx, txn)?)
    }

    /// Prepared result for `query`, if one is cached.
    ///
    /// The entry is an immutable snapshot of the data it was prepared from,
    /// so callers may evaluate it after the state lock is released; any
    /// commit since then has already evicted it from the cache.
    #[must_use]
    pub fn cached_partial(&self, query: &str) -> Option<Arc<PartialResult>> {
        self.read_state().partials.get(query)
    }

    /// Prepared result for `query`, computing and caching it if needed.
    ///
    /// A result computed while a commit or recompile invalidated the cache
    /// is returned but not cached.
    pub fn prepare(&self, ctx: &Context, query: &str) -> ArbiterResult<Arc<PartialResult>> {
        let generation = {
            let state = self.read_state();
            if let Some(hit) = state.partials.get(query) {
                return Ok(hit);
            }
            state.generation
        };

        let txn = self.store.new_transaction(ctx, TransactionParams::READ)?;
        let partial = Evaluation::new(self.store.as_ref(), self.compiler(), query)
            .transaction(Some(&txn))
            .partial(ctx);
        self.store.abort(ctx, txn);
        let partial = Arc::new(partial?);

        let mut state = self.write_state();
        if state.generation != generation {
            return Ok(partial);
        }
        Ok(state.partials.insert(partial))
    }

    /// Execute a query in a transaction the controller opens and always
    /// aborts, or in `request.transaction` when set.
    pub fn exec_query(&self, ctx: &Context, request: &QueryRequest<'_>) -> QueryOutcome {
        let metrics = Metrics::new();
        let result = match request.transaction {
            Some(txn) => self.eval(ctx, request, txn, &metrics),
            None => self.exec_managed(ctx, request, &metrics),
        };
        QueryOutcome::new(metrics, result)
    }

    /// Execute a query inside `txn`, observing its uncommitted writes. The
    /// transaction is left open.
    pub fn txn_exec_query(
        &self,
        ctx: &Context,
        txn: &Transaction,
        request: &QueryRequest<'_>,
    ) -> QueryOutcome {
        let metrics = Metrics::new();
        let result = self.eval(ctx, request, txn, &metrics);
        QueryOutcome::new(metrics, result)
    }

    fn exec_managed(
        &self,
        ctx: &Context,
        request: &QueryRequest<'_>,
        metrics: &Metrics,
    ) -> ArbiterResult<ResultSet> {
        if let Some(partial) = self.cached_partial(&request.query) {
            metrics.incr(COUNTER_PARTIAL_CACHE_HIT);
            let input = request.input_term();
            return Ok(partial.eval(
                ctx,
                input.as_ref(),
                metrics,
                request.instrument,
                request.tracer.as_ref(),
            )?);
        }

        let txn = self.store.new_transaction(ctx, TransactionParams::READ)?;
        let result = self.eval(ctx, request, &txn, metrics);
        self.store.abort(ctx, txn);
        result
    }

    fn eval(
        &self,
        ctx: &Context,
        request: &QueryRequest<'_>,
        txn: &Transaction,
        metrics: &Metrics,
    ) -> ArbiterResult<ResultSet> {
        Ok(
            Evaluation::new(self.store.as_ref(), self.compiler(), request.query.as_str())
                .parsed_input(request.parsed_input.clone())
                .raw_input(request.raw_input.clone())
                .metrics(metrics.clone())
                .instrument(request.instrument)
                .tracer(request.tracer.clone())
                .transaction(Some(txn))
                .eval(ctx)?,
        )
    }

    /// Serve one decision end to end: pick diagnostics for the request,
    /// execute the query with the matching trace and instrumentation, and
    /// log the decision record.
    pub fn decide(
        &self,
        ctx: &Context,
        diagnostics: &DiagnosticsRequest,
        mut request: QueryRequest<'_>,
    ) -> (QueryOutcome, Arc<Info>) {
        let logger = DiagnosticsLogger::generate(ctx, self, diagnostics);
        request.instrument |= logger.instrument();
        if request.tracer.is_none() {
            request.tracer = logger.tracer();
        }

        let outcome = self.exec_query(ctx, &request);
        let decision_id = self.next_decision_id();
        let input = request.input_json();
        let info = logger.log(
            ctx,
            Decision {
                decision_id: &decision_id,
                remote_addr: &diagnostics.remote_addr,
                query: &request.query,
                input: input.as_ref(),
                results: outcome.is_ok().then_some(&outcome.response.results),
                error: outcome.error.as_ref(),
                metrics: outcome.metrics(),
                tracer: request.tracer.as_ref(),
            },
        );
        (outcome, info)
    }

    /// Subscribe to changes of `query`'s result.
    pub fn watch(&self, ctx: &Context, query: &str) -> ArbiterResult<WatchHandle> {
        loop {
            let watcher = self
                .read_state()
                .watcher
                .clone()
                .ok_or_else(|| ArbiterError::internal("controller is not initialized"))?;
            match watcher.watch(ctx, query) {
                // Migrated between the lookup and the call; use the successor.
                Err(WatchError::Closed { .. }) => {}
                other => return Ok(other?),
            }
        }
    }

    /// Add a policy module. Fails with `entry_exists` if `id` is taken.
    pub fn put_policy(
        &self,
        ctx: &Context,
        txn: &Transaction,
        id: &str,
        source: &str,
    ) -> ArbiterResult<Arc<CompiledPolicy>> {
        self.install_policy(ctx, txn, id, source, false)
    }

    /// Add or replace a policy module.
    pub fn upsert_policy(
        &self,
        ctx: &Context,
        txn: &Transaction,
        id: &str,
        source: &str,
    ) -> ArbiterResult<Arc<CompiledPolicy>> {
        self.install_policy(ctx, txn, id, source, true)
    }

    /// Remove a policy module.
    pub fn delete_policy(
        &self,
        ctx: &Context,
        txn: &Transaction,
        id: &str,
    ) -> ArbiterResult<Arc<CompiledPolicy>> {
        require_write(txn)?;
        let current = self.compiler();
        if current.module(id).is_none() {
            return Err(ClassifiedError::new(
                codes::RESOURCE_NOT_FOUND,
                format!("policy {id} not found"),
            )
            .into());
        }
        let mut modules = current.modules().clone();
        modules.remove(id);
        self.activate(ctx, txn, modules)
    }

    fn install_policy(
        &self,
        ctx: &Context,
        txn: &Transaction,
        id: &str,
        source: &str,
        replace: bool,
    ) -> ArbiterResult<Arc<CompiledPolicy>> {
        require_write(txn)?;
        let module =
            parse_module(id, source).map_err(|err| WrappedError::new(MODULE_PARSE_ERR, err))?;
        let current = self.compiler();
        if !replace && current.module(id).is_some() {
            return Err(ClassifiedError::new(
                ENTRY_EXISTS_ERR,
                format!("policy {id} already exists"),
            )
            .into());
        }
        let mut modules = current.modules().clone();
        modules.insert(id.to_string(), module);
        self.activate(ctx, txn, modules)
    }

    fn activate(
        &self,
        ctx: &Context,
        txn: &Transaction,
        modules: BTreeMap<String, Module>,
    ) -> ArbiterResult<Arc<CompiledPolicy>> {
        let compiled =
            compile(modules, self.config.compiler_error_limit).map_err(CompileError::new)?;
        Ok(self.manager.activate(ctx, txn, compiled))
    }
}

fn require_write(txn: &Transaction) -> ArbiterResult<()> {
    if txn.is_write() {
        return Ok(());
    }
    Err(ValidationError::InvalidValue {
        field: "transaction".to_string(),
        reason: "policy changes require a write transaction".to_string(),
    }
    .into())
}

const fn json_type(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    use crate::policy::PolicyManager;
    use crate::storage::{InMemoryStore, PatchOp};

    fn controller(data: serde_json::Value) -> (Arc<InMemoryStore>, Arc<Controller>) {
        let store = Arc::new(InMemoryStore::from_value(data));
        let c = Controller::builder()
            .with_store(store.clone())
            .with_manager(Arc::new(PolicyManager::new()))
            .build()
            .unwrap();
        c.init(&Context::background()).unwrap();
        (store, c)
    }

    #[test]
    fn builder_requires_store_and_manager() {
        let err = Controller::builder().build().unwrap_err();
        assert!(err.is_validation());
        assert!(err.to_string().contains("store"));

        let err = Controller::builder()
            .with_store(Arc::new(InMemoryStore::new()))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("manager"));
    }

    #[test]
    fn builder_rejects_bad_config() {
        let base = || {
            Controller::builder()
                .with_store(Arc::new(InMemoryStore::new()))
                .with_manager(Arc::new(PolicyManager::new()))
        };
        let err = base()
            .with_config(ControllerConfig {
                diagnostics_query: "x =".into(),
                ..ControllerConfig::default()
            })
            .build()
            .unwrap_err();
        assert!(err.is_validation());

        let err = base()
            .with_config(ControllerConfig {
                watch_stream_capacity: 0,
                ..ControllerConfig::default()
            })
            .build()
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn init_registers_hooks_once() {
        let (store, c) = controller(json!({}));
        assert_eq!(store.trigger_count().unwrap(), 2);
        assert!(c.watcher_id().is_some());
        assert_eq!(c.revision(), "");
        assert_eq!(
            c.init(&Context::background()).unwrap_err().code(),
            codes::RESOURCE_CONFLICT
        );
    }

    #[test]
    fn exec_query_returns_bindings_and_metrics() {
        let (_store, c) = controller(json!({}));
        let outcome = c.exec_query(&Context::background(), &QueryRequest::new("x = 1"));
        assert!(outcome.is_ok());
        assert!(outcome.metrics().all().contains_key("timer_eval_query_eval_ns"));
        let response = outcome.into_result().unwrap();
        assert_eq!(response.results[0].bindings["x"], json!(1));
    }

    #[test]
    fn failed_query_keeps_metrics() {
        let (_store, c) = controller(json!({}));
        let outcome = c.exec_query(&Context::background(), &QueryRequest::new("x == 1"));
        assert!(!outcome.is_ok());
        assert!(outcome.metrics().timer_ns("timer_eval_query_parse_ns").is_some());
        assert_eq!(outcome.error.unwrap().code(), codes::INVALID_PARAMETER);
    }

    #[test]
    fn reload_updates_revision_and_drops_partials() {
        let ctx = Context::background();
        let (store, c) = controller(json!({}));
        c.prepare(&ctx, "x = data.a").unwrap();
        assert!(c.cached_partial("x = data.a").is_some());

        let mut txn = store.new_transaction(&ctx, TransactionParams::WRITE).unwrap();
        store
            .write(
                &ctx,
                &mut txn,
                PatchOp::Add,
                &Path::parse("/system/bundle/manifest/revision").unwrap(),
                Some(json!("v2")),
            )
            .unwrap();
        store.commit(&ctx, txn).unwrap();

        assert_eq!(c.revision(), "v2");
        assert!(c.cached_partial("x = data.a").is_none());
    }

    #[test]
    fn cached_partial_serves_queries() {
        let ctx = Context::background();
        let (_store, c) = controller(json!({"limit": 5}));
        c.prepare(&ctx, "data.limit == input.n").unwrap();
        let outcome = c.exec_query(
            &ctx,
            &QueryRequest::new("data.limit == input.n").with_raw_input(json!({"n": 5})),
        );
        assert_eq!(outcome.metrics().counter(COUNTER_PARTIAL_CACHE_HIT), 1);
        assert_eq!(outcome.into_result().unwrap().results.len(), 1);
    }

    #[test]
    fn policy_install_errors_are_classified() {
        let ctx = Context::background();
        let (store, c) = controller(json!({}));
        let txn = store.new_transaction(&ctx, TransactionParams::WRITE).unwrap();

        c.put_policy(&ctx, &txn, "a", "package a\np = 1").unwrap();
        let err = c.put_policy(&ctx, &txn, "a", "package a\np = 2").unwrap_err();
        assert!(err.is_entry_exists());
        let err = c.put_policy(&ctx, &txn, "b", "package").unwrap_err();
        assert!(err.is_module_parse());
        let err = c.put_policy(&ctx, &txn, "c", "package c\nq = x").unwrap_err();
        assert!(err.is_compile());

        c.upsert_policy(&ctx, &txn, "a", "package a\np = 2").unwrap();
        c.delete_policy(&ctx, &txn, "a").unwrap();
        assert_eq!(
            c.delete_policy(&ctx, &txn, "a").unwrap_err().code(),
            codes::RESOURCE_NOT_FOUND
        );
        store.commit(&ctx, txn).unwrap();

        let read = store.new_transaction(&ctx, TransactionParams::READ).unwrap();
        assert!(c.put_policy(&ctx, &read, "z", "package z").unwrap_err().is_validation());
        store.abort(&ctx, read);
    }

    #[test]
    fn custom_decision_ids() {
        let store = Arc::new(InMemoryStore::new());
        let c = Controller::builder()
            .with_store(store)
            .with_manager(Arc::new(PolicyManager::new()))
            .with_decision_id_factory(Arc::new(|| "fixed".to_string()))
            .build()
            .unwrap();
        assert_eq!(c.next_decision_id(), "fixed");
    }
}

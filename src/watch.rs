//! Live query subscriptions driven by store commits.
//!
//! A [`Watcher`] is bound to one compiled policy. It registers a commit
//! trigger on the store and, for every commit that touches a path a
//! subscribed query depends on, re-evaluates that query inside the committing
//! transaction and pushes the result to the subscriber. Sends never block: a
//! subscriber whose stream is full loses the event and the loss is counted.
//!
//! When the policy changes the watcher is replaced with [`Watcher::migrate`],
//! which carries the subscriber set over to a watcher bound to the new policy.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::context::Context;
use crate::eval::{EvalError, Evaluation, ResultSet};
use crate::policy::ast::Query;
use crate::policy::compiler::{check_query, CompiledPolicy};
use crate::policy::parser::parse_query;
use crate::storage::{
    CommitTrigger, Path, StorageError, Store, Transaction, TriggerEvent, TriggerHandle,
};

/// Errors from the watch subsystem.
#[derive(Debug, Error)]
pub enum WatchError {
    /// The watcher was migrated away and no longer accepts work.
    #[error("watch_closed_error: watcher {id} is closed")]
    Closed {
        /// The closed watcher.
        id: Uuid,
    },

    /// The watched query could not be parsed or checked.
    #[error(transparent)]
    Eval(#[from] EvalError),

    /// Registering or removing the commit trigger failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The watcher side of the stream is gone.
    #[error("watch_disconnected_error: subscription {0} disconnected")]
    Disconnected(SubscriptionId),

    /// No event arrived in time.
    #[error("watch_timeout_error: no event within {duration_ms}ms")]
    Timeout {
        /// How long the caller waited.
        duration_ms: u64,
    },
}

impl WatchError {
    /// True for [`WatchError::Closed`].
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        matches!(self, Self::Closed { .. })
    }
}

/// Identifier of one subscription. Stable across migrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(pub Uuid);

impl SubscriptionId {
    /// A fresh random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a [`WatchEvent`] was emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchEventKind {
    /// First result, sent when the subscription is created.
    Initial,
    /// A commit changed data the query reads.
    DataChanged,
    /// The active policy changed.
    PolicyChanged,
}

/// A query result pushed to a subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchEvent {
    /// Subscription the event belongs to.
    pub subscription_id: SubscriptionId,
    /// Why the event was sent.
    pub kind: WatchEventKind,
    /// Watched query text.
    pub query: String,
    /// Fresh result; `None` if evaluation failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<ResultSet>,
    /// Evaluation error, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the event was produced.
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug)]
struct Subscription {
    query: String,
    parsed: Query,
    dependencies: BTreeSet<Path>,
    tx: Sender<WatchEvent>,
    /// Initial event sent; later changes are delivered as events.
    primed: bool,
    /// A change arrived before the initial event; evaluate it again.
    stale: bool,
}

impl Subscription {
    /// Whether the subscriber should be sent a fresh result now. Unprimed
    /// subscriptions are marked stale instead.
    fn take_target(&mut self) -> bool {
        if self.primed {
            true
        } else {
            self.stale = true;
            false
        }
    }
}

/// Subscriber set shared by a watcher and its migrated successors.
#[derive(Debug)]
struct Registry {
    subs: Mutex<HashMap<SubscriptionId, Subscription>>,
    dropped_events: AtomicU64,
    capacity: usize,
}

impl Registry {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SubscriptionId, Subscription>> {
        self.subs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn send(&self, tx: &Sender<WatchEvent>, event: WatchEvent) {
        // Never block the committing thread on a slow subscriber.
        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => {
                self.dropped_events.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

fn evaluate(
    ctx: &Context,
    store: &dyn Store,
    policy: &Arc<CompiledPolicy>,
    query: &str,
    txn: Option<&Transaction>,
) -> (Option<ResultSet>, Option<String>) {
    match Evaluation::new(store, Arc::clone(policy), query)
        .transaction(txn)
        .eval(ctx)
    {
        Ok(rs) => (Some(rs), None),
        Err(err) => (None, Some(err.to_string())),
    }
}

fn notify(
    ctx: &Context,
    registry: &Registry,
    store: &dyn Store,
    policy: &Arc<CompiledPolicy>,
    txn: &Transaction,
    kind: WatchEventKind,
    targets: Vec<(SubscriptionId, String, Sender<WatchEvent>)>,
) {
    for (id, query, tx) in targets {
        let (results, error) = evaluate(ctx, store, policy, &query, Some(txn));
        registry.send(
            &tx,
            WatchEvent {
                subscription_id: id,
                kind,
                query,
                results,
                error,
                timestamp: Utc::now(),
            },
        );
    }
}

/// Commit hook registered on the store. Holds the store weakly since the
/// store owns the hook.
struct WatchTrigger {
    watcher_id: Uuid,
    store: Weak<dyn Store>,
    policy: Arc<CompiledPolicy>,
    registry: Arc<Registry>,
    closed: Arc<AtomicBool>,
}

impl CommitTrigger for WatchTrigger {
    fn on_commit(&self, ctx: &Context, txn: &Transaction, event: &TriggerEvent) {
        if self.closed.load(Ordering::Acquire) || event.is_empty() {
            return;
        }
        let Some(store) = self.store.upgrade() else {
            return;
        };
        let targets: Vec<_> = self
            .registry
            .lock()
            .iter_mut()
            .filter(|(_, sub)| sub.dependencies.iter().any(|p| event.touches(p)))
            .filter_map(|(id, sub)| {
                sub.take_target()
                    .then(|| (*id, sub.query.clone(), sub.tx.clone()))
            })
            .collect();
        if targets.is_empty() {
            return;
        }
        tracing::debug!(
            watcher = %self.watcher_id,
            subscribers = targets.len(),
            "re-evaluating watched queries"
        );
        notify(
            ctx,
            &self.registry,
            store.as_ref(),
            &self.policy,
            txn,
            WatchEventKind::DataChanged,
            targets,
        );
    }
}

/// Change watcher bound to one compiled policy.
pub struct Watcher {
    id: Uuid,
    store: Arc<dyn Store>,
    policy: Arc<CompiledPolicy>,
    registry: Arc<Registry>,
    handle: TriggerHandle,
    closed: Arc<AtomicBool>,
}

impl fmt::Debug for Watcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watcher")
            .field("id", &self.id)
            .field("policy", &self.policy.fingerprint())
            .field("handle", &self.handle)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Watcher {
    /// Build a watcher and register its commit trigger in `txn`, which must
    /// be a write transaction.
    pub fn new(
        ctx: &Context,
        store: Arc<dyn Store>,
        policy: Arc<CompiledPolicy>,
        txn: &Transaction,
        stream_capacity: usize,
    ) -> Result<Self, WatchError> {
        let registry = Arc::new(Registry {
            subs: Mutex::new(HashMap::new()),
            dropped_events: AtomicU64::new(0),
            capacity: stream_capacity.max(1),
        });
        Self::bind(ctx, store, policy, txn, registry)
    }

    fn bind(
        ctx: &Context,
        store: Arc<dyn Store>,
        policy: Arc<CompiledPolicy>,
        txn: &Transaction,
        registry: Arc<Registry>,
    ) -> Result<Self, WatchError> {
        let id = Uuid::new_v4();
        let closed = Arc::new(AtomicBool::new(false));
        let trigger = Arc::new(WatchTrigger {
            watcher_id: id,
            store: Arc::downgrade(&store),
            policy: Arc::clone(&policy),
            registry: Arc::clone(&registry),
            closed: Arc::clone(&closed),
        });
        let handle = store.register(ctx, txn, trigger)?;
        Ok(Self {
            id,
            store,
            policy,
            registry,
            handle,
            closed,
        })
    }

    /// Identity of this watcher instance; changes on every migration.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Policy this watcher evaluates against.
    #[must_use]
    pub fn policy(&self) -> &Arc<CompiledPolicy> {
        &self.policy
    }

    /// True once migrated away or closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Events lost to full or disconnected subscriber streams.
    #[must_use]
    pub fn dropped_events(&self) -> u64 {
        self.registry.dropped_events.load(Ordering::Relaxed)
    }

    /// Query text of every live subscription, sorted.
    #[must_use]
    pub fn subscriber_queries(&self) -> Vec<String> {
        let mut out: Vec<String> = self.registry.lock().values().map(|s| s.query.clone()).collect();
        out.sort();
        out
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.registry.lock().len()
    }

    /// Subscribe to `query`. The stream starts with the current result.
    ///
    /// The subscription is registered before the initial result is
    /// evaluated. Until that result is sent, commits and migrations that
    /// reach the subscription mark it stale instead of notifying it, and the
    /// initial result is evaluated again, so the first event is never older
    /// than a change the subscriber would otherwise have missed. Returns
    /// [`WatchError::Closed`] if this watcher is migrated away before the
    /// initial event goes out.
    pub fn watch(&self, ctx: &Context, query: &str) -> Result<WatchHandle, WatchError> {
        if self.is_closed() {
            return Err(WatchError::Closed { id: self.id });
        }
        let parsed = parse_query(query).map_err(EvalError::from)?;
        check_query(&parsed).map_err(EvalError::UnsafeQuery)?;
        let dependencies = self.policy.data_dependencies(&parsed);

        let id = SubscriptionId::new();
        let (tx, rx) = bounded(self.registry.capacity);
        self.registry.lock().insert(
            id,
            Subscription {
                query: query.to_string(),
                parsed,
                dependencies,
                tx: tx.clone(),
                primed: false,
                stale: false,
            },
        );

        loop {
            let (results, error) = evaluate(ctx, self.store.as_ref(), &self.policy, query, None);
            let mut subs = self.registry.lock();
            // Migration sets `closed` before it walks the registry, so an
            // unprimed entry it skipped is always caught here.
            if self.is_closed() {
                subs.remove(&id);
                return Err(WatchError::Closed { id: self.id });
            }
            let Some(sub) = subs.get_mut(&id) else {
                return Err(WatchError::Closed { id: self.id });
            };
            if std::mem::take(&mut sub.stale) {
                continue;
            }
            sub.primed = true;
            self.registry.send(
                &tx,
                WatchEvent {
                    subscription_id: id,
                    kind: WatchEventKind::Initial,
                    query: query.to_string(),
                    results,
                    error,
                    timestamp: Utc::now(),
                },
            );
            break;
        }

        tracing::debug!(watcher = %self.id, subscription = %id, query, "watch registered");
        Ok(WatchHandle {
            id,
            rx,
            registry: Arc::downgrade(&self.registry),
        })
    }

    /// Remove this watcher's commit trigger in `txn` and close it. The
    /// subscriber set is left to whoever still holds the handles.
    pub fn close(&self, ctx: &Context, txn: &Transaction) -> Result<(), WatchError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(WatchError::Closed { id: self.id });
        }
        self.store.unregister(ctx, txn, self.handle)?;
        Ok(())
    }

    /// Rebind every subscription to `policy` and return the new watcher.
    ///
    /// The new trigger is registered and this watcher's trigger removed in
    /// `txn`; afterwards this watcher is closed. Every subscriber receives a
    /// [`WatchEventKind::PolicyChanged`] event evaluated in `txn`.
    pub fn migrate(
        &self,
        ctx: &Context,
        policy: Arc<CompiledPolicy>,
        txn: &Transaction,
    ) -> Result<Self, WatchError> {
        if self.is_closed() {
            return Err(WatchError::Closed { id: self.id });
        }

        let next = Self::bind(
            ctx,
            Arc::clone(&self.store),
            Arc::clone(&policy),
            txn,
            Arc::clone(&self.registry),
        )?;
        if let Err(err) = self.store.unregister(ctx, txn, self.handle) {
            // Leave the store as it was: drop the new registration.
            next.closed.store(true, Ordering::Release);
            if let Err(cleanup) = self.store.unregister(ctx, txn, next.handle) {
                tracing::warn!(error = %cleanup, "failed to remove new watch trigger");
            }
            return Err(err.into());
        }
        self.closed.store(true, Ordering::Release);

        let targets: Vec<_> = {
            let mut subs = self.registry.lock();
            subs.iter_mut()
                .filter_map(|(id, sub)| {
                    sub.dependencies = policy.data_dependencies(&sub.parsed);
                    sub.take_target()
                        .then(|| (*id, sub.query.clone(), sub.tx.clone()))
                })
                .collect()
        };
        tracing::debug!(
            from = %self.id,
            to = %next.id,
            subscribers = targets.len(),
            "migrated watcher"
        );
        notify(
            ctx,
            &self.registry,
            self.store.as_ref(),
            &policy,
            txn,
            WatchEventKind::PolicyChanged,
            targets,
        );
        Ok(next)
    }
}

/// Receiving end of one subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct WatchHandle {
    id: SubscriptionId,
    rx: Receiver<WatchEvent>,
    registry: Weak<Registry>,
}

impl WatchHandle {
    /// Subscription id carried by every event on this stream.
    #[must_use]
    pub const fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Next event, blocking.
    pub fn recv(&self) -> Result<WatchEvent, WatchError> {
        self.rx.recv().map_err(|_| WatchError::Disconnected(self.id))
    }

    /// Next event, waiting at most `timeout`.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<WatchEvent, WatchError> {
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => WatchError::Timeout {
                duration_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            },
            RecvTimeoutError::Disconnected => WatchError::Disconnected(self.id),
        })
    }

    /// Next event if one is queued.
    #[must_use]
    pub fn try_recv(&self) -> Option<WatchEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.lock().remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    use crate::policy::compiler::compile;
    use crate::policy::parser::parse_module;
    use crate::storage::{InMemoryStore, PatchOp, TransactionParams};

    fn policy(src: &str) -> Arc<CompiledPolicy> {
        let mut modules = std::collections::BTreeMap::new();
        modules.insert("m".to_string(), parse_module("m", src).unwrap());
        Arc::new(compile(modules, 0).unwrap())
    }

    fn setup(store: &Arc<InMemoryStore>, p: Arc<CompiledPolicy>) -> Watcher {
        let ctx = Context::background();
        let dyn_store: Arc<dyn Store> = store.clone();
        let txn = store.new_transaction(&ctx, TransactionParams::WRITE).unwrap();
        let w = Watcher::new(&ctx, dyn_store, p, &txn, 8).unwrap();
        store.commit(&ctx, txn).unwrap();
        w
    }

    fn put(store: &InMemoryStore, path: &str, value: serde_json::Value) {
        let ctx = Context::background();
        let mut txn = store.new_transaction(&ctx, TransactionParams::WRITE).unwrap();
        store
            .write(&ctx, &mut txn, PatchOp::Add, &Path::parse(path).unwrap(), Some(value))
            .unwrap();
        store.commit(&ctx, txn).unwrap();
    }

    #[test]
    fn initial_event_then_updates_on_dependent_writes() {
        let ctx = Context::background();
        let store = Arc::new(InMemoryStore::from_value(json!({"limit": 1})));
        let w = setup(&store, policy("package a\np = data.limit"));
        let h = w.watch(&ctx, "x = data.a.p").unwrap();

        let first = h.try_recv().unwrap();
        assert_eq!(first.kind, WatchEventKind::Initial);
        assert_eq!(first.results.unwrap()[0].bindings["x"], json!(1));

        put(&store, "/unrelated", json!(true));
        assert!(h.try_recv().is_none());

        put(&store, "/limit", json!(2));
        let next = h.try_recv().unwrap();
        assert_eq!(next.kind, WatchEventKind::DataChanged);
        assert_eq!(next.results.unwrap()[0].bindings["x"], json!(2));
    }

    #[test]
    fn dropping_handle_unsubscribes() {
        let ctx = Context::background();
        let store = Arc::new(InMemoryStore::new());
        let w = setup(&store, Arc::new(CompiledPolicy::empty()));
        let h = w.watch(&ctx, "x = data.y").unwrap();
        assert_eq!(w.subscriber_count(), 1);
        drop(h);
        assert_eq!(w.subscriber_count(), 0);
    }

    #[test]
    fn full_streams_drop_and_count_events() {
        let ctx = Context::background();
        let store = Arc::new(InMemoryStore::new());
        let dyn_store: Arc<dyn Store> = store.clone();
        let txn = store.new_transaction(&ctx, TransactionParams::WRITE).unwrap();
        let w = Watcher::new(&ctx, dyn_store, Arc::new(CompiledPolicy::empty()), &txn, 1).unwrap();
        store.commit(&ctx, txn).unwrap();

        let _h = w.watch(&ctx, "x = data.v").unwrap();
        put(&store, "/v", json!(1));
        put(&store, "/v", json!(2));
        assert_eq!(w.dropped_events(), 2);
    }

    #[test]
    fn migration_preserves_subscribers_and_closes_old_watcher() {
        let ctx = Context::background();
        let store = Arc::new(InMemoryStore::from_value(json!({"a": 1, "b": 2})));
        let w = setup(&store, policy("package q\nv = data.a"));
        let h = w.watch(&ctx, "x = data.q.v").unwrap();
        let _ = h.try_recv();

        let txn = store.new_transaction(&ctx, TransactionParams::WRITE).unwrap();
        let next = w.migrate(&ctx, policy("package q\nv = data.b"), &txn).unwrap();
        store.commit(&ctx, txn).unwrap();

        assert_ne!(next.id(), w.id());
        assert!(w.is_closed());
        assert_eq!(next.subscriber_queries(), vec!["x = data.q.v".to_string()]);
        assert_eq!(store.trigger_count().unwrap(), 1);

        let changed = h.try_recv().unwrap();
        assert_eq!(changed.kind, WatchEventKind::PolicyChanged);
        assert_eq!(changed.results.unwrap()[0].bindings["x"], json!(2));

        put(&store, "/a", json!(10));
        assert!(h.try_recv().is_none());
        put(&store, "/b", json!(20));
        assert_eq!(h.try_recv().unwrap().results.unwrap()[0].bindings["x"], json!(20));

        let txn = store.new_transaction(&ctx, TransactionParams::WRITE).unwrap();
        assert!(w.migrate(&ctx, Arc::new(CompiledPolicy::empty()), &txn).unwrap_err().is_closed());
        store.abort(&ctx, txn);
    }
    /// Commits a pending write right after the next read transaction opens,
    /// so that transaction's snapshot is already stale.
    struct CommitAfterOpen {
        inner: Arc<InMemoryStore>,
        pending: Mutex<Option<(Path, serde_json::Value)>>,
    }

    impl Store for CommitAfterOpen {
        fn new_transaction(
            &self,
            ctx: &Context,
            params: TransactionParams,
        ) -> Result<Transaction, StorageError> {
            let txn = self.inner.new_transaction(ctx, params)?;
            let pending = if params.write {
                None
            } else {
                self.pending.lock().unwrap().take()
            };
            if let Some((path, value)) = pending {
                let mut w = self.inner.new_transaction(ctx, TransactionParams::WRITE)?;
                self.inner.write(ctx, &mut w, PatchOp::Replace, &path, Some(value))?;
                self.inner.commit(ctx, w)?;
            }
            Ok(txn)
        }

        fn read(
            &self,
            ctx: &Context,
            txn: &Transaction,
            path: &Path,
        ) -> Result<serde_json::Value, StorageError> {
            self.inner.read(ctx, txn, path)
        }

        fn write(
            &self,
            ctx: &Context,
            txn: &mut Transaction,
            op: PatchOp,
            path: &Path,
            value: Option<serde_json::Value>,
        ) -> Result<(), StorageError> {
            self.inner.write(ctx, txn, op, path, value)
        }

        fn commit(&self, ctx: &Context, txn: Transaction) -> Result<(), StorageError> {
            self.inner.commit(ctx, txn)
        }

        fn abort(&self, ctx: &Context, txn: Transaction) {
            self.inner.abort(ctx, txn);
        }

        fn register(
            &self,
            ctx: &Context,
            txn: &Transaction,
            trigger: Arc<dyn CommitTrigger>,
        ) -> Result<TriggerHandle, StorageError> {
            self.inner.register(ctx, txn, trigger)
        }

        fn unregister(
            &self,
            ctx: &Context,
            txn: &Transaction,
            handle: TriggerHandle,
        ) -> Result<(), StorageError> {
            self.inner.unregister(ctx, txn, handle)
        }
    }

    #[test]
    fn commit_during_initial_evaluation_is_not_lost() {
        let ctx = Context::background();
        let inner = Arc::new(InMemoryStore::from_value(json!({"v": 1})));
        let store = Arc::new(CommitAfterOpen {
            inner: Arc::clone(&inner),
            pending: Mutex::new(None),
        });
        let dyn_store: Arc<dyn Store> = store.clone();
        let txn = inner.new_transaction(&ctx, TransactionParams::WRITE).unwrap();
        let w = Watcher::new(&ctx, dyn_store, Arc::new(CompiledPolicy::empty()), &txn, 8).unwrap();
        inner.commit(&ctx, txn).unwrap();

        *store.pending.lock().unwrap() = Some((Path::parse("/v").unwrap(), json!(2)));
        let h = w.watch(&ctx, "x = data.v").unwrap();

        let first = h.try_recv().unwrap();
        assert_eq!(first.kind, WatchEventKind::Initial);
        assert_eq!(first.results.unwrap()[0].bindings["x"], json!(2));
        assert!(h.try_recv().is_none());
        assert!(store.pending.lock().unwrap().is_none());

        put(&inner, "/v", json!(3));
        let next = h.try_recv().unwrap();
        assert_eq!(next.kind, WatchEventKind::DataChanged);
        assert_eq!(next.results.unwrap()[0].bindings["x"], json!(3));
    }

    #[test]
    fn watching_a_migrated_watcher_leaves_no_subscription() {
        let ctx = Context::background();
        let store = Arc::new(InMemoryStore::from_value(json!({"a": 1})));
        let w = setup(&store, policy("package q\nv = data.a"));

        let txn = store.new_transaction(&ctx, TransactionParams::WRITE).unwrap();
        let next = w.migrate(&ctx, policy("package q\nv = 2"), &txn).unwrap();
        store.commit(&ctx, txn).unwrap();

        assert!(w.watch(&ctx, "x = data.q.v").unwrap_err().is_closed());
        assert_eq!(next.subscriber_count(), 0);

        let h = next.watch(&ctx, "x = data.q.v").unwrap();
        assert_eq!(h.try_recv().unwrap().results.unwrap()[0].bindings["x"], json!(2));
        assert_eq!(next.subscriber_count(), 1);
    }

    #[test]
    fn closing_removes_the_trigger() {
        let ctx = Context::background();
        let store = Arc::new(InMemoryStore::new());
        let w = setup(&store, Arc::new(CompiledPolicy::empty()));
        let h = w.watch(&ctx, "x = data.v").unwrap();
        let _ = h.try_recv();

        let txn = store.new_transaction(&ctx, TransactionParams::WRITE).unwrap();
        w.close(&ctx, &txn).unwrap();
        assert!(w.close(&ctx, &txn).unwrap_err().is_closed());
        store.commit(&ctx, txn).unwrap();

        assert_eq!(store.trigger_count().unwrap(), 0);
        put(&store, "/v", json!(1));
        assert!(h.try_recv().is_none());
    }
}

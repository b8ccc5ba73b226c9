//! In-memory storage backend.
//!
//! Thread-safe reference implementation of [`Store`] for embedded usage and
//! tests. Each transaction pins the committed document current when it was
//! opened and reads that snapshot plus its own staged writes until it ends.
//! Commits are serialised and swap in a new document. While a commit runs its
//! triggers the data lock is held exclusively, so no transaction can open
//! against a half-applied state, and reads through the committing transaction
//! are served from the prepared post-commit document.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde_json::{Map, Value};
use uuid::Uuid;

use crate::context::Context;
use crate::storage::traits::{
    CommitTrigger, DataEvent, PatchOp, Path, StorageError, Store, Transaction, TransactionParams,
    TriggerEvent, TriggerHandle, TxnId,
};

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

fn lookup<'a>(doc: &'a Value, path: &Path) -> Option<&'a Value> {
    let mut cur = doc;
    for seg in path.segments() {
        cur = match cur {
            Value::Object(map) => map.get(seg)?,
            Value::Array(items) => items.get(seg.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(cur)
}

fn lookup_mut<'a>(doc: &'a mut Value, segments: &[String]) -> Option<&'a mut Value> {
    let mut cur = doc;
    for seg in segments {
        cur = match cur {
            Value::Object(map) => map.get_mut(seg)?,
            Value::Array(items) => items.get_mut(seg.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(cur)
}

/// Apply one write to a document in place.
///
/// `Add` creates missing intermediate objects; `Replace` and `Remove` require
/// the target to exist.
fn apply(doc: &mut Value, event: &DataEvent) -> Result<(), StorageError> {
    let path = &event.path;
    if path.is_root() {
        return match event.op {
            PatchOp::Add | PatchOp::Replace => match &event.value {
                Some(v @ Value::Object(_)) => {
                    *doc = v.clone();
                    Ok(())
                }
                _ => Err(StorageError::InvalidPatch(
                    "root must be replaced by an object".to_string(),
                )),
            },
            PatchOp::Remove => Err(StorageError::InvalidPatch(
                "root cannot be removed".to_string(),
            )),
        };
    }

    let segments = path.segments();
    let (last, parents) = segments
        .split_last()
        .ok_or_else(|| StorageError::InvalidPatch("empty path".to_string()))?;

    if event.op == PatchOp::Add {
        let mut cur = &mut *doc;
        for seg in parents {
            let Value::Object(map) = cur else {
                return Err(StorageError::InvalidPatch(format!(
                    "{path}: parent is not an object"
                )));
            };
            cur = map
                .entry(seg.clone())
                .or_insert_with(|| Value::Object(Map::new()));
        }
        let Value::Object(map) = cur else {
            return Err(StorageError::InvalidPatch(format!(
                "{path}: parent is not an object"
            )));
        };
        map.insert(last.clone(), event.value.clone().unwrap_or(Value::Null));
        return Ok(());
    }

    let parent = lookup_mut(doc, parents).ok_or_else(|| StorageError::NotFound {
        path: path.clone(),
    })?;
    let Value::Object(map) = parent else {
        return Err(StorageError::NotFound { path: path.clone() });
    };
    if !map.contains_key(last) {
        return Err(StorageError::NotFound { path: path.clone() });
    }
    match event.op {
        PatchOp::Replace => {
            map.insert(last.clone(), event.value.clone().unwrap_or(Value::Null));
        }
        PatchOp::Remove => {
            map.remove(last);
        }
        PatchOp::Add => unreachable!("handled above"),
    }
    Ok(())
}

/// Thread-safe in-memory document store.
pub struct InMemoryStore {
    id: Uuid,
    data: RwLock<Arc<Value>>,
    triggers: RwLock<BTreeMap<TriggerHandle, Arc<dyn CommitTrigger>>>,
    commit_lock: Mutex<()>,
    committing: Mutex<Option<(TxnId, Value)>>,
    next_txn: AtomicU64,
    next_trigger: AtomicU64,
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStore").field("id", &self.id).finish_non_exhaustive()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::from_value(Value::Object(Map::new()))
    }

    /// Create a store seeded with `data`. Non-object seeds become `{}`.
    #[must_use]
    pub fn from_value(data: Value) -> Self {
        let data = if data.is_object() {
            data
        } else {
            Value::Object(Map::new())
        };
        Self {
            id: Uuid::new_v4(),
            data: RwLock::new(Arc::new(data)),
            triggers: RwLock::new(BTreeMap::new()),
            commit_lock: Mutex::new(()),
            committing: Mutex::new(None),
            next_txn: AtomicU64::new(1),
            next_trigger: AtomicU64::new(1),
        }
    }

    /// Number of registered commit triggers.
    pub fn trigger_count(&self) -> Result<usize, StorageError> {
        Ok(self
            .triggers
            .read()
            .map_err(|_| lock_err("store.trigger_count"))?
            .len())
    }

    fn check_owner(&self, txn: &Transaction) -> Result<(), StorageError> {
        if txn.store_id() == self.id {
            Ok(())
        } else {
            Err(StorageError::ForeignTransaction(txn.id()))
        }
    }

    fn check_write(&self, txn: &Transaction) -> Result<(), StorageError> {
        self.check_owner(txn)?;
        if txn.is_write() {
            Ok(())
        } else {
            Err(StorageError::ReadOnlyTransaction(txn.id()))
        }
    }

    /// Committed document `txn` reads from.
    fn base(&self, txn: &Transaction) -> Result<Arc<Value>, StorageError> {
        match txn.snapshot() {
            Some(snapshot) => Ok(Arc::clone(snapshot)),
            None => Ok(Arc::clone(
                &*self.data.read().map_err(|_| lock_err("store.base"))?,
            )),
        }
    }

    /// The document as `txn` sees it: its snapshot plus staged writes.
    fn view(&self, txn: &Transaction) -> Result<Value, StorageError> {
        let mut doc = Value::clone(&*self.base(txn)?);
        for event in txn.writes() {
            apply(&mut doc, event)?;
        }
        Ok(doc)
    }
}

impl Store for InMemoryStore {
    fn new_transaction(
        &self,
        ctx: &Context,
        params: TransactionParams,
    ) -> Result<Transaction, StorageError> {
        if let Some(err) = ctx.err() {
            return Err(err.into());
        }
        let snapshot = Arc::clone(&*self.data.read().map_err(|_| lock_err("store.open"))?);
        let id = TxnId(self.next_txn.fetch_add(1, Ordering::Relaxed));
        Ok(Transaction::new(id, self.id, params).with_snapshot(snapshot))
    }

    fn read(
        &self,
        ctx: &Context,
        txn: &Transaction,
        path: &Path,
    ) -> Result<Value, StorageError> {
        if let Some(err) = ctx.err() {
            return Err(err.into());
        }
        self.check_owner(txn)?;

        let not_found = || StorageError::NotFound { path: path.clone() };
        {
            let committing = self.committing.lock().map_err(|_| lock_err("store.read.committing"))?;
            if let Some((id, doc)) = committing.as_ref() {
                if *id == txn.id() {
                    return lookup(doc, path).cloned().ok_or_else(not_found);
                }
            }
        }
        if txn.writes().is_empty() {
            let base = self.base(txn)?;
            return lookup(&base, path).cloned().ok_or_else(not_found);
        }
        let doc = self.view(txn)?;
        lookup(&doc, path).cloned().ok_or_else(not_found)
    }

    fn write(
        &self,
        ctx: &Context,
        txn: &mut Transaction,
        op: PatchOp,
        path: &Path,
        value: Option<Value>,
    ) -> Result<(), StorageError> {
        if let Some(err) = ctx.err() {
            return Err(err.into());
        }
        self.check_write(txn)?;

        let event = DataEvent {
            op,
            path: path.clone(),
            value,
        };
        // Validate against the transaction's view so bad writes fail here,
        // not at commit.
        let mut doc = self.view(txn)?;
        apply(&mut doc, &event)?;
        txn.stage(event);
        Ok(())
    }

    fn commit(&self, ctx: &Context, txn: Transaction) -> Result<(), StorageError> {
        self.check_owner(&txn)?;
        if !txn.is_write() {
            return Ok(());
        }

        let _commit = self.commit_lock.lock().map_err(|_| lock_err("store.commit"))?;

        // Writes land on the latest committed document, not the transaction's
        // snapshot. Commits are serialised, so it cannot change between this
        // clone and the write lock below.
        let mut next = Value::clone(&**self.data.read().map_err(|_| lock_err("store.commit.read"))?);
        for event in txn.writes() {
            apply(&mut next, event)?;
        }

        let event = TriggerEvent {
            txn_id: Some(txn.id()),
            data: txn.writes().to_vec(),
        };
        let triggers: Vec<Arc<dyn CommitTrigger>> = self
            .triggers
            .read()
            .map_err(|_| lock_err("store.commit.triggers"))?
            .values()
            .cloned()
            .collect();

        let mut data = self.data.write().map_err(|_| lock_err("store.commit.data"))?;
        *self
            .committing
            .lock()
            .map_err(|_| lock_err("store.commit.committing"))? = Some((txn.id(), next));
        for trigger in triggers {
            trigger.on_commit(ctx, &txn, &event);
        }
        let committed = self
            .committing
            .lock()
            .map_err(|_| lock_err("store.commit.committing"))?
            .take();
        if let Some((_, next)) = committed {
            *data = Arc::new(next);
        }
        Ok(())
    }

    fn abort(&self, _ctx: &Context, txn: Transaction) {
        drop(txn);
    }

    fn register(
        &self,
        ctx: &Context,
        txn: &Transaction,
        trigger: Arc<dyn CommitTrigger>,
    ) -> Result<TriggerHandle, StorageError> {
        if let Some(err) = ctx.err() {
            return Err(err.into());
        }
        self.check_write(txn)?;
        let handle = TriggerHandle(self.next_trigger.fetch_add(1, Ordering::Relaxed));
        self.triggers
            .write()
            .map_err(|_| lock_err("store.register"))?
            .insert(handle, trigger);
        Ok(handle)
    }

    fn unregister(
        &self,
        _ctx: &Context,
        txn: &Transaction,
        handle: TriggerHandle,
    ) -> Result<(), StorageError> {
        self.check_write(txn)?;
        self.triggers
            .write()
            .map_err(|_| lock_err("store.unregister"))?
            .remove(&handle)
            .map(|_| ())
            .ok_or(StorageError::TriggerNotFound(handle))
    }
}

//! Abstract storage contract consumed by the controller.
//!
//! A store holds one JSON document tree addressed by slash-separated paths.
//! All access goes through a [`Transaction`]; writes are staged on the
//! transaction and become visible only when the store commits it. Commit
//! triggers run synchronously inside the commit, before the writes are
//! visible to other transactions.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::context::{Context, ContextError};
use crate::term::Ref;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Nothing stored at the path.
    #[error("storage_not_found_error: {path}: document missing")]
    NotFound {
        /// Path that was read.
        path: Path,
    },

    /// Malformed path text.
    #[error("storage_invalid_path_error: {0}")]
    InvalidPath(String),

    /// A write could not be applied to the current document shape.
    #[error("storage_invalid_patch_error: {0}")]
    InvalidPatch(String),

    /// Write or trigger registration attempted on a read transaction.
    #[error("storage_write_conflict_error: transaction {0} is read-only")]
    ReadOnlyTransaction(TxnId),

    /// Transaction was created by a different store.
    #[error("storage_invalid_txn_error: transaction {0} does not belong to this store")]
    ForeignTransaction(TxnId),

    /// Unregister called with an unknown handle.
    #[error("storage_trigger_error: trigger {0} is not registered")]
    TriggerNotFound(TriggerHandle),

    /// The call context was cancelled or timed out.
    #[error("storage_cancelled_error: {0}")]
    Cancelled(#[from] ContextError),

    /// Backend error.
    #[error("storage_internal_error: {0}")]
    BackendError(String),
}

impl StorageError {
    /// True for [`StorageError::NotFound`].
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// A slash-separated location in the data document, e.g. `/system/bundle`.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Path(Vec<String>);

impl Path {
    /// The root of the document.
    #[must_use]
    pub const fn root() -> Self {
        Self(Vec::new())
    }

    /// A path from already split segments.
    #[must_use]
    pub fn new(segments: Vec<String>) -> Self {
        Self(segments)
    }

    /// Parse `/a/b/c`. The empty string and `/` both name the root.
    pub fn parse(text: &str) -> Result<Self, StorageError> {
        if text.is_empty() || text == "/" {
            return Ok(Self::root());
        }
        let Some(rest) = text.strip_prefix('/') else {
            return Err(StorageError::InvalidPath(format!(
                "path must start with '/': {text}"
            )));
        };
        let segments: Vec<String> = rest.split('/').map(str::to_string).collect();
        if segments.iter().any(String::is_empty) {
            return Err(StorageError::InvalidPath(format!(
                "path contains an empty segment: {text}"
            )));
        }
        Ok(Self(segments))
    }

    /// Path addressed by a `data.x.y` reference.
    #[must_use]
    pub fn from_data_ref(r: &Ref) -> Option<Self> {
        r.is_data().then(|| Self(r.path.clone()))
    }

    /// Path segments, root first.
    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// True for the document root.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Path one level up; `None` at the root.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.0.is_empty() {
            return None;
        }
        Some(Self(self.0[..self.0.len() - 1].to_vec()))
    }

    /// Path one level down.
    #[must_use]
    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut out = self.0.clone();
        out.push(segment.into());
        Self(out)
    }

    /// True if `prefix` is this path or one of its ancestors.
    #[must_use]
    pub fn has_prefix(&self, prefix: &Self) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// True if a change at one path can affect a read at the other.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.has_prefix(other) || other.has_prefix(self)
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("/");
        }
        for seg in &self.0 {
            write!(f, "/{seg}")?;
        }
        Ok(())
    }
}

/// Transaction identifier, unique per store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxnId(pub u64);

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle returned by [`Store::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TriggerHandle(pub u64);

impl fmt::Display for TriggerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Options for opening a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransactionParams {
    /// Allow writes and trigger registration.
    pub write: bool,
}

impl TransactionParams {
    /// Read-only transaction.
    pub const READ: Self = Self { write: false };
    /// Read-write transaction.
    pub const WRITE: Self = Self { write: true };
}

/// Kind of staged write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchOp {
    /// Set the value, creating missing parents.
    Add,
    /// Overwrite an existing value.
    Replace,
    /// Delete an existing value.
    Remove,
}

/// One staged write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataEvent {
    /// Kind of write.
    pub op: PatchOp,
    /// Target path.
    pub path: Path,
    /// New value; absent for removals.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

/// An open unit of work against one store.
///
/// Writes are kept on the transaction until commit; reads through the owning
/// store observe them. A store may pin the committed document the transaction
/// was opened against, so every read through it sees one consistent state.
#[derive(Debug)]
pub struct Transaction {
    id: TxnId,
    store_id: Uuid,
    params: TransactionParams,
    snapshot: Option<Arc<serde_json::Value>>,
    writes: Vec<DataEvent>,
}

impl Transaction {
    /// Used by store implementations when opening a transaction.
    #[must_use]
    pub fn new(id: TxnId, store_id: Uuid, params: TransactionParams) -> Self {
        Self {
            id,
            store_id,
            params,
            snapshot: None,
            writes: Vec::new(),
        }
    }

    /// Pin the committed document this transaction reads from.
    #[must_use]
    pub fn with_snapshot(mut self, snapshot: Arc<serde_json::Value>) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    /// Committed document pinned when the transaction was opened, if any.
    #[must_use]
    pub fn snapshot(&self) -> Option<&Arc<serde_json::Value>> {
        self.snapshot.as_ref()
    }

    /// Identifier, unique within the owning store.
    #[must_use]
    pub const fn id(&self) -> TxnId {
        self.id
    }

    /// Identity of the store that opened this transaction.
    #[must_use]
    pub const fn store_id(&self) -> Uuid {
        self.store_id
    }

    /// True for write transactions.
    #[must_use]
    pub const fn is_write(&self) -> bool {
        self.params.write
    }

    /// Writes staged so far, in order.
    #[must_use]
    pub fn writes(&self) -> &[DataEvent] {
        &self.writes
    }

    /// Stage a write. Store implementations validate before calling this.
    pub fn stage(&mut self, event: DataEvent) {
        self.writes.push(event);
    }

    /// Consume the transaction, yielding its staged writes.
    #[must_use]
    pub fn into_writes(self) -> Vec<DataEvent> {
        self.writes
    }
}

/// What a committing transaction changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    /// Committing transaction.
    pub txn_id: Option<TxnId>,
    /// Writes in the order they were staged.
    pub data: Vec<DataEvent>,
}

impl TriggerEvent {
    /// True if the commit changed no data.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// True if any change overlaps `path`.
    #[must_use]
    pub fn touches(&self, path: &Path) -> bool {
        self.data.iter().any(|e| e.path.overlaps(path))
    }
}

/// Receiver of commit notifications.
///
/// Called synchronously on the committing thread, inside the commit and
/// before its writes are visible to other transactions. Reads made through
/// `txn` see the transaction's writes; a trigger must not read through any
/// other transaction.
pub trait CommitTrigger: Send + Sync {
    /// Called inside the commit of `txn`, before its writes become visible.
    fn on_commit(&self, ctx: &Context, txn: &Transaction, event: &TriggerEvent);
}

/// Transactional key/value document store.
///
/// # Safety Considerations
/// - Implementations must be safe to call from many threads at once
/// - Reads through the committing transaction must succeed from inside a
///   commit trigger
pub trait Store: Send + Sync {
    /// Open a transaction.
    fn new_transaction(
        &self,
        ctx: &Context,
        params: TransactionParams,
    ) -> Result<Transaction, StorageError>;

    /// Read the document at `path` as seen by `txn`.
    ///
    /// # Errors
    /// - `NotFound`: nothing is stored at `path`
    fn read(
        &self,
        ctx: &Context,
        txn: &Transaction,
        path: &Path,
    ) -> Result<serde_json::Value, StorageError>;

    /// Stage a write on a write transaction.
    fn write(
        &self,
        ctx: &Context,
        txn: &mut Transaction,
        op: PatchOp,
        path: &Path,
        value: Option<serde_json::Value>,
    ) -> Result<(), StorageError>;

    /// Run commit triggers, then make the transaction's writes visible.
    fn commit(&self, ctx: &Context, txn: Transaction) -> Result<(), StorageError>;

    /// Discard the transaction and its staged writes.
    fn abort(&self, ctx: &Context, txn: Transaction);

    /// Register a commit trigger. Requires a write transaction.
    fn register(
        &self,
        ctx: &Context,
        txn: &Transaction,
        trigger: Arc<dyn CommitTrigger>,
    ) -> Result<TriggerHandle, StorageError>;

    /// Remove a previously registered trigger. Requires a write transaction.
    fn unregister(
        &self,
        ctx: &Context,
        txn: &Transaction,
        handle: TriggerHandle,
    ) -> Result<(), StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    // Compile-time test: ensure traits are object-safe
    fn _assert_store_object_safe(_: &dyn Store) {}
    fn _assert_trigger_object_safe(_: &dyn CommitTrigger) {}

    #[test]
    fn path_parse_and_display() {
        let p = Path::parse("/system/bundle/manifest/revision").unwrap();
        assert_eq!(p.segments().len(), 4);
        assert_eq!(p.to_string(), "/system/bundle/manifest/revision");
        assert!(Path::parse("/").unwrap().is_root());
        assert!(Path::parse("a/b").is_err());
        assert!(Path::parse("/a//b").is_err());
    }

    #[test]
    fn path_overlap_is_symmetric_prefix() {
        let a = Path::parse("/a").unwrap();
        let ab = Path::parse("/a/b").unwrap();
        let c = Path::parse("/c").unwrap();
        assert!(a.overlaps(&ab));
        assert!(ab.overlaps(&a));
        assert!(!ab.overlaps(&c));
        assert!(Path::root().overlaps(&c));
    }

    #[test]
    fn storage_error_display() {
        let err = StorageError::NotFound {
            path: Path::parse("/x").unwrap(),
        };
        assert!(err.is_not_found());
        assert!(err.to_string().contains("/x"));
    }
}

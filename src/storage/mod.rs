//! Transactional data store contract and its in-memory backend.

mod memory;
mod traits;

pub use memory::InMemoryStore;
pub use traits::{
    CommitTrigger, DataEvent, PatchOp, Path, StorageError, Store, Transaction, TransactionParams,
    TriggerEvent, TriggerHandle, TxnId,
};

//! Holder of the active compiled policy and its recompilation hooks.

use std::sync::{Arc, Mutex, RwLock};

use crate::context::Context;
use crate::policy::compiler::CompiledPolicy;
use crate::storage::Transaction;

/// Receiver of policy activation notifications.
///
/// Called synchronously by the activating thread, with the transaction in
/// which the new policy became active.
pub trait RecompileTrigger: Send + Sync {
    /// Called after `policy` becomes active.
    fn on_recompile(&self, ctx: &Context, txn: &Transaction, policy: &Arc<CompiledPolicy>);
}

/// Access to the current compiled policy.
pub trait CompilerManager: Send + Sync {
    /// Snapshot of the active policy.
    fn get_compiler(&self) -> Arc<CompiledPolicy>;

    /// Add a hook that runs on every activation.
    fn register_compiler_trigger(&self, trigger: Arc<dyn RecompileTrigger>);

    /// Make `policy` the active policy and run every hook with `txn`.
    fn activate(&self, ctx: &Context, txn: &Transaction, policy: CompiledPolicy)
        -> Arc<CompiledPolicy>;
}

/// In-process [`CompilerManager`].
#[derive(Default)]
pub struct PolicyManager {
    current: RwLock<Arc<CompiledPolicy>>,
    triggers: Mutex<Vec<Arc<dyn RecompileTrigger>>>,
}

impl std::fmt::Debug for PolicyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyManager")
            .field("fingerprint", &self.get_compiler().fingerprint())
            .finish_non_exhaustive()
    }
}

impl PolicyManager {
    /// Create a manager holding the empty policy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a manager holding `policy`, without running any hooks.
    #[must_use]
    pub fn with_policy(policy: CompiledPolicy) -> Self {
        Self {
            current: RwLock::new(Arc::new(policy)),
            triggers: Mutex::new(Vec::new()),
        }
    }
}

impl CompilerManager for PolicyManager {
    fn get_compiler(&self) -> Arc<CompiledPolicy> {
        // A poisoned lock still holds a complete Arc; the swap is atomic.
        let guard = self.current.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        Arc::clone(&guard)
    }

    fn register_compiler_trigger(&self, trigger: Arc<dyn RecompileTrigger>) {
        self.triggers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(trigger);
    }

    fn activate(
        &self,
        ctx: &Context,
        txn: &Transaction,
        policy: CompiledPolicy,
    ) -> Arc<CompiledPolicy> {
        let policy = Arc::new(policy);
        {
            let mut current = self
                .current
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            *current = Arc::clone(&policy);
        }
        tracing::info!(
            fingerprint = %policy.fingerprint(),
            modules = policy.modules().len(),
            "activated compiled policy"
        );

        let triggers: Vec<Arc<dyn RecompileTrigger>> = self
            .triggers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        for trigger in triggers {
            trigger.on_recompile(ctx, txn, &policy);
        }
        policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BTreeMap;

    use crate::policy::compiler::compile;
    use crate::policy::parser::parse_module;
    use crate::storage::{InMemoryStore, Store, TransactionParams};

    struct Counter(Mutex<Vec<String>>);

    impl RecompileTrigger for Counter {
        fn on_recompile(&self, _ctx: &Context, _txn: &Transaction, policy: &Arc<CompiledPolicy>) {
            self.0.lock().unwrap().push(policy.fingerprint().to_string());
        }
    }

    #[test]
    fn activation_swaps_policy_and_runs_hooks_in_order() {
        let ctx = Context::background();
        let store = InMemoryStore::new();
        let manager = PolicyManager::new();
        let hook = Arc::new(Counter(Mutex::new(Vec::new())));
        manager.register_compiler_trigger(hook.clone());

        let mut modules = BTreeMap::new();
        modules.insert("a".to_string(), parse_module("a", "package a\np = 1").unwrap());
        let policy = compile(modules, 0).unwrap();

        let txn = store.new_transaction(&ctx, TransactionParams::WRITE).unwrap();
        let active = manager.activate(&ctx, &txn, policy);
        store.commit(&ctx, txn).unwrap();

        assert!(Arc::ptr_eq(&active, &manager.get_compiler()));
        assert_eq!(*hook.0.lock().unwrap(), vec![active.fingerprint().to_string()]);
    }
}

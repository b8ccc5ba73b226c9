//! Prepared-query cache, keyed by query text.
//!
//! Entries are only ever dropped all at once: any committed data change or
//! policy change may affect any prepared query.

use std::collections::HashMap;
use std::sync::Arc;

use crate::eval::PartialResult;

/// Prepared results keyed by the query text they were prepared from.
#[derive(Debug, Default, Clone)]
pub struct PartialResultCache {
    entries: HashMap<String, Arc<PartialResult>>,
}

impl PartialResultCache {
    /// An empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached entry for `query`, if any.
    #[must_use]
    pub fn get(&self, query: &str) -> Option<Arc<PartialResult>> {
        self.entries.get(query).cloned()
    }

    /// Insert unless an entry already exists; returns the cached entry.
    pub fn insert(&mut self, partial: Arc<PartialResult>) -> Arc<PartialResult> {
        Arc::clone(
            self.entries
                .entry(partial.query_text().to_string())
                .or_insert(partial),
        )
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of cached queries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::context::Context;
    use crate::eval::Evaluation;
    use crate::policy::CompiledPolicy;
    use crate::storage::InMemoryStore;

    fn partial(query: &str) -> Arc<PartialResult> {
        let store = InMemoryStore::new();
        Arc::new(
            Evaluation::new(&store, Arc::new(CompiledPolicy::empty()), query)
                .partial(&Context::background())
                .unwrap(),
        )
    }

    #[test]
    fn first_insert_wins_and_clear_drops_everything() {
        let mut cache = PartialResultCache::new();
        let a = cache.insert(partial("x = 1"));
        let b = cache.insert(partial("x = 1"));
        assert!(Arc::ptr_eq(&a, &b));
        cache.insert(partial("y = 2"));
        assert_eq!(cache.len(), 2);
        assert!(cache.get("y = 2").is_some());

        cache.clear();
        assert!(cache.is_empty());
        assert!(cache.get("x = 1").is_none());
    }
}

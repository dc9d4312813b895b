//! Memoized tag-filter evaluation.
//!
//! `evaluate` is pure, so results are cacheable by (expression, tag set).
//! Views are recomputed on every list request; the cache keeps that cheap
//! for fleets with many servers and few distinct filters.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use unimcp_core::{CacheConfig, TtlLruCache};

use crate::expr::TagExpression;

/// Shared memoizer for tag-filter evaluation.
#[derive(Clone)]
pub struct FilterCache {
    cache: Arc<TtlLruCache<String, bool>>,
}

impl FilterCache {
    /// Cache with the given bounds.
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            cache: Arc::new(TtlLruCache::new(CacheConfig { max_entries, ttl })),
        }
    }

    /// Evaluate `expr` against `tags`, memoized.
    pub fn matches(&self, expr: &TagExpression, tags: &[String]) -> bool {
        let key = Self::key(expr, tags);
        self.cache.get_or_insert_with(key, || {
            let set: HashSet<String> = tags.iter().cloned().collect();
            expr.evaluate(&set)
        })
    }

    /// Expose the underlying cache for sweeping.
    pub fn inner(&self) -> &Arc<TtlLruCache<String, bool>> {
        &self.cache
    }

    fn key(expr: &TagExpression, tags: &[String]) -> String {
        let mut sorted: Vec<&str> = tags.iter().map(String::as_str).collect();
        sorted.sort_unstable();
        sorted.dedup();
        format!("{expr}|{}", sorted.join(","))
    }
}

impl Default for FilterCache {
    fn default() -> Self {
        Self::new(4096, Duration::from_secs(300))
    }
}

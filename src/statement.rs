//! Per-connection cache of prepared query plans.
//!
//! A plan records the descriptor ids negotiated for a query so later runs
//! can skip the prepare round trip and go straight to an optimistic
//! execute. Plans are keyed by the query text plus the flags that change
//! its compilation, and evicted least-recently-used.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;

use crate::descriptor::DescriptorId;
use crate::protocol::{Cardinality, IoFormat};

/// Cache key: the query text and the flags it was prepared with.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PlanKey {
    pub command: String,
    pub io_format: IoFormat,
    pub expected_cardinality: Cardinality,
}

/// Descriptor ids negotiated at prepare time.
#[derive(Debug, Clone)]
pub struct PreparedPlan {
    /// Cardinality announced by the server; a pre-execute hint only.
    pub server_cardinality: Cardinality,
    pub input_id: DescriptorId,
    pub output_id: DescriptorId,
}

/// O(1) LRU cache of prepared plans.
pub struct PlanCache {
    cache: LruCache<PlanKey, Arc<PreparedPlan>>,
}

impl PlanCache {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).expect("capacity is at least one");
        PlanCache {
            cache: LruCache::new(cap),
        }
    }

    /// Fetch a plan and mark it recently used. The `Arc` clone is a
    /// refcount increment only.
    pub fn get(&mut self, key: &PlanKey) -> Option<Arc<PreparedPlan>> {
        self.cache.get(key).map(Arc::clone)
    }

    pub fn insert(&mut self, key: PlanKey, plan: PreparedPlan) -> Arc<PreparedPlan> {
        let plan = Arc::new(plan);
        self.cache.put(key, Arc::clone(&plan));
        plan
    }

    /// Drop a plan whose descriptors turned out to be stale.
    pub fn remove(&mut self, key: &PlanKey) {
        self.cache.pop(key);
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

impl Default for PlanCache {
    fn default() -> Self {
        // matches the per-connection default of the pool options
        Self::new(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(command: &str) -> PlanKey {
        PlanKey {
            command: command.to_string(),
            io_format: IoFormat::Binary,
            expected_cardinality: Cardinality::Many,
        }
    }

    fn plan() -> PreparedPlan {
        PreparedPlan {
            server_cardinality: Cardinality::One,
            input_id: DescriptorId::ZERO,
            output_id: DescriptorId([1; 16]),
        }
    }

    #[test]
    fn get_returns_inserted_plans() {
        let mut cache = PlanCache::new(4);
        assert!(cache.is_empty());
        cache.insert(key("SELECT 1"), plan());
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&key("SELECT 1")).is_some());
        assert!(cache.get(&key("SELECT 2")).is_none());
    }

    #[test]
    fn flags_are_part_of_the_key() {
        let mut cache = PlanCache::new(4);
        cache.insert(key("SELECT 1"), plan());
        let one_shot = PlanKey {
            expected_cardinality: Cardinality::One,
            ..key("SELECT 1")
        };
        assert!(cache.get(&one_shot).is_none());
    }

    #[test]
    fn least_recently_used_plan_is_evicted() {
        let mut cache = PlanCache::new(2);
        cache.insert(key("q1"), plan());
        cache.insert(key("q2"), plan());
        cache.get(&key("q1"));
        cache.insert(key("q3"), plan());

        assert!(cache.get(&key("q1")).is_some());
        assert!(cache.get(&key("q2")).is_none());
        assert!(cache.get(&key("q3")).is_some());
    }

    #[test]
    fn stale_plans_can_be_dropped() {
        let mut cache = PlanCache::new(2);
        cache.insert(key("q1"), plan());
        cache.remove(&key("q1"));
        assert!(cache.get(&key("q1")).is_none());
    }
}

//! Bounded cache in front of a [`SessionInfoProvider`].
//!
//! Authority sets are keyed by set id: once a set is known it does not
//! depend on which relay point it was fetched through. Only successes are
//! cached; errors pass through unchanged so the caller can tell a fatal
//! provider failure from a retryable one.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::trace;
use weft_core::error::SessionError;
use weft_core::types::{AuthorityId, Hash256, SetId};
use weft_core::SessionInfoProvider;

/// Authority sets kept before the oldest is evicted.
pub const DEFAULT_SESSION_CACHE_SIZE: usize = 64;

pub struct SessionCache {
    provider: Arc<dyn SessionInfoProvider>,
    capacity: usize,
    sets: HashMap<SetId, Vec<AuthorityId>>,
    order: VecDeque<SetId>,
    hits: u64,
    misses: u64,
}

impl SessionCache {
    pub fn new(provider: Arc<dyn SessionInfoProvider>, capacity: usize) -> Self {
        Self {
            provider,
            capacity: capacity.max(1),
            sets: HashMap::new(),
            order: VecDeque::new(),
            hits: 0,
            misses: 0,
        }
    }

    /// Authorities of `set_id`, asking the provider at `relay_point` on a miss.
    pub fn authorities(&mut self, relay_point: &Hash256, set_id: SetId) -> Result<Vec<AuthorityId>, SessionError> {
        if let Some(set) = self.sets.get(&set_id) {
            self.hits += 1;
            return Ok(set.clone());
        }
        self.misses += 1;
        let set = self.provider.authorities(relay_point, set_id)?;
        trace!(set_id, relay = %relay_point.short(), size = set.len(), "session: cached authority set");
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.sets.remove(&oldest);
            }
        }
        self.order.push_back(set_id);
        self.sets.insert(set_id, set.clone());
        Ok(set)
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// (hits, misses)
    pub fn stats(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;
    use weft_core::error::{FatalSessionError, NonFatalSessionError};
    use weft_core::MockSessionInfoProvider;

    fn set(byte: u8) -> Vec<AuthorityId> {
        vec![AuthorityId([byte; 32])]
    }

    /// A set is fetched once and then served from the cache.
    #[test]
    fn caches_successes() {
        let mut provider = MockSessionInfoProvider::new();
        provider
            .expect_authorities()
            .with(eq(Hash256([1; 32])), eq(3))
            .times(1)
            .returning(|_, _| Ok(set(3)));
        let mut cache = SessionCache::new(Arc::new(provider), 4);

        assert_eq!(cache.authorities(&Hash256([1; 32]), 3).unwrap(), set(3));
        // Different relay point, same set: still cached.
        assert_eq!(cache.authorities(&Hash256([2; 32]), 3).unwrap(), set(3));
        assert_eq!(cache.stats(), (1, 1));
    }

    /// Errors keep their class and are not cached.
    #[test]
    fn errors_pass_through() {
        let mut provider = MockSessionInfoProvider::new();
        let mut calls = 0;
        provider.expect_authorities().times(2).returning(move |_, _| {
            calls += 1;
            if calls == 1 {
                Err(FatalSessionError::ProviderShutdown.into())
            } else {
                Err(NonFatalSessionError::UnknownRelayPoint("x".into()).into())
            }
        });
        let mut cache = SessionCache::new(Arc::new(provider), 4);

        let first = cache.authorities(&Hash256::ZERO, 1).unwrap_err();
        assert!(first.is_fatal());
        let second = cache.authorities(&Hash256::ZERO, 1).unwrap_err();
        assert!(!second.is_fatal());
        assert!(cache.is_empty());
    }

    #[test]
    fn evicts_oldest() {
        let mut provider = MockSessionInfoProvider::new();
        provider
            .expect_authorities()
            .returning(|_, id| Ok(vec![AuthorityId([id as u8; 32])]));
        let mut cache = SessionCache::new(Arc::new(provider), 2);
        for id in 0..3 {
            cache.authorities(&Hash256::ZERO, id).unwrap();
        }
        assert_eq!(cache.len(), 2);
        cache.authorities(&Hash256::ZERO, 0).unwrap();
        assert_eq!(cache.stats(), (0, 4), "set 0 was evicted");
    }
}

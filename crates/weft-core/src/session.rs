//! Static [`SessionInfoProvider`] backed by a fixed table of authority sets.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::error::{NonFatalSessionError, SessionError};
use crate::traits::SessionInfoProvider;
use crate::types::{AuthorityId, Hash256, SetId};

/// Authority sets known up front, independent of the relay point.
///
/// Unknown set ids produce [`NonFatalSessionError::NoSuchSession`]; this
/// provider never fails fatally.
#[derive(Default)]
pub struct StaticSessionProvider {
    sets: RwLock<HashMap<SetId, Vec<AuthorityId>>>,
}

impl StaticSessionProvider {
    pub fn new(sets: HashMap<SetId, Vec<AuthorityId>>) -> Self {
        Self {
            sets: RwLock::new(sets),
        }
    }

    /// Add or replace the authorities of `set_id`.
    pub fn insert(&self, set_id: SetId, authorities: Vec<AuthorityId>) {
        self.sets.write().insert(set_id, authorities);
    }

    pub fn len(&self) -> usize {
        self.sets.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.read().is_empty()
    }
}

impl SessionInfoProvider for StaticSessionProvider {
    fn authorities(&self, _relay_point: &Hash256, set_id: SetId) -> Result<Vec<AuthorityId>, SessionError> {
        self.sets
            .read()
            .get(&set_id)
            .cloned()
            .ok_or_else(|| NonFatalSessionError::NoSuchSession(set_id).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_set_is_returned() {
        let provider = StaticSessionProvider::default();
        provider.insert(2, vec![AuthorityId([1; 32])]);
        let got = provider.authorities(&Hash256::ZERO, 2).unwrap();
        assert_eq!(got, vec![AuthorityId([1; 32])]);
        assert_eq!(provider.len(), 1);
    }

    #[test]
    fn unknown_set_is_non_fatal() {
        let provider = StaticSessionProvider::default();
        let err = provider.authorities(&Hash256::ZERO, 9).unwrap_err();
        assert!(!err.is_fatal());
        assert_eq!(err, SessionError::NonFatal(NonFatalSessionError::NoSuchSession(9)));
    }
}

//! Client-side memo of operator getter results.

use std::sync::Mutex;

use fnv::FnvHashMap;

use dpf_core::EntityId;

use crate::msg::{Method, WireValue};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct CacheKey {
    pub op: EntityId,
    pub method: Method,
    /// Encoded request arguments
    pub args: Vec<u8>,
}

/// Results of getters on operators declared pure. Values carrying handles
/// are never stored, every retrieval of a handle must produce a new owned
/// reference.
#[derive(Default)]
pub(crate) struct OutputCache {
    entries: Mutex<FnvHashMap<CacheKey, WireValue>>,
}

impl OutputCache {
    pub fn get(&self, key: &CacheKey) -> Option<WireValue> {
        let entries = self.entries.lock().ok()?;
        entries.get(key).cloned()
    }

    pub fn insert(&self, key: CacheKey, value: WireValue) {
        if matches!(value, WireValue::Entity(_)) {
            return;
        }
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(key, value);
        }
    }

    /// Drops every entry of the given operator.
    pub fn invalidate(&self, op: EntityId) {
        if let Ok(mut entries) = self.entries.lock() {
            let before = entries.len();
            entries.retain(|key, _| key.op != op);
            if entries.len() != before {
                trace!("invalidated {} cached outputs of operator {}", before - entries.len(), op);
            }
        }
    }

    /// Drops every entry. Outputs of downstream operators depend on the
    /// inputs of their producers, so any input change goes through here.
    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            if !entries.is_empty() {
                trace!("cleared {} cached outputs", entries.len());
            }
            entries.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(op: EntityId, pin: u8) -> CacheKey {
        CacheKey {
            op,
            method: Method::GetOutput,
            args: vec![pin],
        }
    }

    #[test]
    fn invalidation_is_per_operator() {
        let cache = OutputCache::default();
        cache.insert(key(1, 0), WireValue::Double(1.));
        cache.insert(key(1, 1), WireValue::Double(3.));
        cache.insert(key(2, 0), WireValue::Int(5));
        cache.invalidate(1);
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&key(1, 0)).is_none());
        assert_eq!(cache.get(&key(2, 0)), Some(WireValue::Int(5)));
    }

    #[test]
    fn clearing_drops_all_operators() {
        let cache = OutputCache::default();
        cache.insert(key(1, 0), WireValue::Double(1.));
        cache.insert(key(2, 0), WireValue::Int(5));
        cache.clear();
        assert_eq!(cache.len(), 0);
        assert!(cache.get(&key(2, 0)).is_none());
    }

    #[test]
    fn handles_are_not_cached() {
        let cache = OutputCache::default();
        cache.insert(
            key(1, 0),
            WireValue::Entity(crate::msg::EntityRef {
                id: 9,
                kind: dpf_core::ObjectKind::Field,
            }),
        );
        assert_eq!(cache.len(), 0);
    }
}

use std::collections::BTreeSet;

use dashmap::DashMap;

/// Identities seen by the dispatcher, the inventory for glob expansion
#[derive(Debug, Default)]
pub struct IdentityTracker {
    /// identity → unix seconds last seen
    seen: DashMap<String, i64>,
}

impl IdentityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&self, identity: &str, now: i64) {
        if let Some(mut last) = self.seen.get_mut(identity) {
            if *last != now {
                *last = now;
            }
            return;
        }
        self.seen.insert(identity.to_string(), now);
    }

    /// Identities seen within `ttl_secs` of `now`
    pub fn inventory(&self, now: i64, ttl_secs: i64) -> BTreeSet<String> {
        self.seen
            .iter()
            .filter(|e| now - *e.value() <= ttl_secs)
            .map(|e| e.key().clone())
            .collect()
    }

    /// Forget identities not seen for longer than `ttl_secs`
    pub fn expire(&self, now: i64, ttl_secs: i64) -> usize {
        let before = self.seen.len();
        self.seen.retain(|_, last| now - *last <= ttl_secs);
        before - self.seen.len()
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

//! Routing cache: which rules care about a series
//!
//! Rules are kept in an arena keyed by id; the index only stores ids. The
//! index is two-level, keyed first by the leading two bytes of the routing
//! key so each lookup touches a small map:
//!
//! ```text
//! md5("{identity}/{metric}") ──prefix(u16)──► { routing key ──► [rule id] }
//! ```
//!
//! Snapshots are immutable and published through a single `ArcSwap`.

mod identity;
mod refresh;
mod rule;
mod source;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use arc_swap::{ArcSwap, Guard};
use tracing::warn;

use crate::point::{Point, RoutingKey, routing_key};

pub use identity::IdentityTracker;
pub use refresh::{RoutingCache, RoutingConfig, RoutingTask};
pub use rule::{Clause, Op, Rule, RuleFilter, RuleId, RuleKind, TagPredicate, glob_regex, is_glob};
pub use source::{HttpRuleSource, RuleSet, RuleSource, RuleSourceError, StaticRuleSource};

/// Rules addressable by id
pub type RuleArena = HashMap<RuleId, Arc<Rule>>;

type Index = HashMap<u16, HashMap<u128, Vec<RuleId>>>;

#[derive(Debug, Default)]
pub struct RoutingSnapshot {
    rules: RuleArena,
    index: Index,
}

impl RoutingSnapshot {
    /// Index every filter of every rule; glob identities are expanded
    /// against `inventory`
    pub fn build(rules: Vec<Rule>, inventory: &BTreeSet<String>) -> Self {
        let mut index: Index = HashMap::new();
        let mut arena = RuleArena::with_capacity(rules.len());

        for rule in rules {
            for filter in &rule.filters {
                if filter.is_glob() {
                    let re = match glob_regex(&filter.identity) {
                        Ok(re) => re,
                        Err(e) => {
                            warn!("rule {} has an unusable identity pattern {:?}: {e}", rule.id, filter.identity);
                            continue;
                        }
                    };
                    for identity in inventory.iter().filter(|i| re.is_match(i)) {
                        insert(&mut index, routing_key(identity, &filter.metric), rule.id);
                    }
                } else {
                    insert(&mut index, routing_key(&filter.identity, &filter.metric), rule.id);
                }
            }
            arena.insert(rule.id, Arc::new(rule));
        }

        Self { rules: arena, index }
    }

    pub fn rule(&self, id: RuleId) -> Option<&Arc<Rule>> {
        self.rules.get(&id)
    }

    pub fn rules(&self) -> &RuleArena {
        &self.rules
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Number of distinct routing keys indexed
    pub fn key_count(&self) -> usize {
        self.index.values().map(HashMap::len).sum()
    }

    /// Candidate rule ids for a routing key, before tag predicates
    pub fn lookup(&self, key: RoutingKey) -> &[RuleId] {
        self.index
            .get(&key.prefix())
            .and_then(|bucket| bucket.get(&key.0))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Rules whose filters and tag predicate accept `point`
    pub fn matching(&self, point: &Point) -> Vec<Arc<Rule>> {
        self.lookup(point.routing_key())
            .iter()
            .filter_map(|id| self.rules.get(id))
            .filter(|rule| rule.predicate.matches(&point.tags))
            .cloned()
            .collect()
    }
}

fn insert(index: &mut Index, key: RoutingKey, id: RuleId) {
    let ids = index.entry(key.prefix()).or_default().entry(key.0).or_default();
    if !ids.contains(&id) {
        ids.push(id);
    }
}

/// Current snapshot, swapped whole by the refresher
#[derive(Debug)]
pub struct RoutingTable {
    current: ArcSwap<RoutingSnapshot>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(RoutingSnapshot::default()),
        }
    }

    pub fn load(&self) -> Guard<Arc<RoutingSnapshot>> {
        self.current.load()
    }

    pub fn install(&self, snapshot: RoutingSnapshot) {
        self.current.store(Arc::new(snapshot));
    }
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::new()
    }
}

use std::collections::BTreeMap;

use regex::Regex;
use serde::{Deserialize, Serialize};

pub type RuleId = u64;

/// A rule interested in some set of series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: RuleId,
    #[serde(default)]
    pub kind: RuleKind,
    pub filters: Vec<RuleFilter>,
    #[serde(default)]
    pub predicate: TagPredicate,
}

impl Rule {
    pub fn is_aggregation(&self) -> bool {
        matches!(self.kind, RuleKind::Aggregation { .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RuleKind {
    /// Points are shipped to the rule's judge
    #[default]
    Alert,
    /// Points are published to the aggregation bus
    Aggregation {
        #[serde(default)]
        group_by: Vec<String>,
        #[serde(default = "default_aggr_step")]
        step: u32,
        /// Seconds a late sample still counts toward its window
        #[serde(default)]
        lateness: u32,
    },
}

fn default_aggr_step() -> u32 {
    10
}

/// One `(identity, metric)` selector; `identity` may contain `*` and `?`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleFilter {
    #[serde(alias = "endpoint")]
    pub identity: String,
    pub metric: String,
}

impl RuleFilter {
    pub fn is_glob(&self) -> bool {
        is_glob(&self.identity)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    #[serde(rename = "=", alias = "eq")]
    Eq,
    #[serde(rename = "!=", alias = "ne")]
    Ne,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clause {
    pub key: String,
    pub op: Op,
    #[serde(default)]
    pub values: Vec<String>,
}

impl Clause {
    /// A point without the clause's key never matches, whatever the operator
    pub fn matches(&self, tags: &BTreeMap<String, String>) -> bool {
        let Some(value) = tags.get(&self.key) else {
            return false;
        };
        let listed = self.values.iter().any(|v| v == value);
        match self.op {
            Op::Eq => listed,
            Op::Ne => !listed,
        }
    }
}

/// Conjunction of clauses; empty accepts everything
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagPredicate(pub Vec<Clause>);

impl TagPredicate {
    pub fn equals(key: &str, values: &[&str]) -> Self {
        Self::default().and(key, Op::Eq, values)
    }

    pub fn and(mut self, key: &str, op: Op, values: &[&str]) -> Self {
        self.0.push(Clause {
            key: key.to_string(),
            op,
            values: values.iter().map(|v| v.to_string()).collect(),
        });
        self
    }

    pub fn matches(&self, tags: &BTreeMap<String, String>) -> bool {
        self.0.iter().all(|clause| clause.matches(tags))
    }
}

pub fn is_glob(pattern: &str) -> bool {
    pattern.contains(['*', '?'])
}

/// Anchored regex for a shell-style glob over `*` and `?`
pub fn glob_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    for c in pattern.chars() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re)
}

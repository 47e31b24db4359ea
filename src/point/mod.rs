//! Canonical ingest record and its fingerprints
//!
//! ## Shapes
//!
//! - [`RawPoint`]: what arrives over RPC or HTTP, untrusted
//! - [`Point`]: a validated, normalised sample ready for fan-out
//!
//! ## Fingerprints
//!
//! Both hashes are the 128-bit MD5 of a canonical string, so they are stable
//! across processes and releases:
//!
//! ```text
//! fingerprint  = md5("{identity}/{metric}/{k=v,k=v}")   tags sorted by key
//! routing key  = md5("{identity}/{metric}")
//! ```

mod raw;
mod validate;

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use raw::{JsonPoint, RawPoint, Value, parse_json_batch, parse_tag_string};
pub use validate::{PointError, Validator, ValidatorConfig, normalize_tags};

/// Optional counter-type hint carried through to storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CounterType {
    Gauge,
    Counter,
    Derive,
}

impl CounterType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CounterType::Gauge => "GAUGE",
            CounterType::Counter => "COUNTER",
            CounterType::Derive => "DERIVE",
        }
    }
}

impl std::str::FromStr for CounterType {
    type Err = PointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "GAUGE" => Ok(CounterType::Gauge),
            "COUNTER" => Ok(CounterType::Counter),
            "DERIVE" => Ok(CounterType::Derive),
            _ => Err(PointError::InvalidCounterType(s.to_string())),
        }
    }
}

/// Who produced the sample
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Identity {
    Endpoint(String),
    Node(String),
}

impl Identity {
    /// String used in fingerprints and as the storage-side endpoint
    pub fn key(&self) -> Cow<'_, str> {
        match self {
            Identity::Endpoint(endpoint) => Cow::Borrowed(endpoint),
            Identity::Node(nid) => Cow::Owned(format!("nid:{nid}")),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Routing key over the full series identity (identity, metric, tags)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(pub u128);

/// Routing key over `(identity, metric)` only
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoutingKey(pub u128);

macro_rules! hash_key_impl {
    ($name:ident) => {
        impl $name {
            pub fn of(canonical: &str) -> Self {
                Self(hash128(canonical))
            }

            /// First two bytes, used as the coarse routing-cache index
            #[inline]
            pub fn prefix(&self) -> u16 {
                (self.0 >> 112) as u16
            }

            /// Leading 64 bits, used as the ring lookup key
            #[inline]
            pub fn ring_key(&self) -> u64 {
                (self.0 >> 64) as u64
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&hex::encode(self.0.to_be_bytes()))
            }
        }
    };
}

hash_key_impl!(Fingerprint);
hash_key_impl!(RoutingKey);

/// 128-bit MD5 of `s`, big-endian
pub fn hash128(s: &str) -> u128 {
    u128::from_be_bytes(md5::compute(s.as_bytes()).0)
}

/// Leading 64 bits of [`hash128`]
pub fn hash64(s: &str) -> u64 {
    (hash128(s) >> 64) as u64
}

/// A validated metric sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub identity: Identity,
    pub metric: String,
    /// Canonically ordered by key
    pub tags: BTreeMap<String, String>,
    pub value: f64,
    pub timestamp: i64,
    pub step: u32,
    pub counter_type: Option<CounterType>,
    pub extra: Option<String>,
}

/// Points are shared between every queue they are fanned out to
pub type SharedPoint = Arc<Point>;

impl Point {
    pub fn new(endpoint: impl Into<String>, metric: impl Into<String>, value: f64, timestamp: i64) -> Self {
        Self {
            identity: Identity::Endpoint(endpoint.into()),
            metric: metric.into(),
            tags: BTreeMap::new(),
            value,
            timestamp,
            step: 10,
            counter_type: None,
            extra: None,
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_step(mut self, step: u32) -> Self {
        self.step = step;
        self
    }

    /// `k=v,k=v` in key order
    pub fn sorted_tags(&self) -> String {
        join_tags(&self.tags)
    }

    /// `{identity}/{metric}/{sorted_tags}`
    pub fn canonical(&self) -> String {
        format!("{}/{}/{}", self.identity.key(), self.metric, self.sorted_tags())
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(&self.canonical())
    }

    pub fn routing_key(&self) -> RoutingKey {
        routing_key(&self.identity.key(), &self.metric)
    }

    /// Metric name with its tags, as the storage side addresses a series
    pub fn counter(&self) -> String {
        if self.tags.is_empty() {
            self.metric.clone()
        } else {
            format!("{}/{}", self.metric, self.sorted_tags())
        }
    }
}

pub fn routing_key(identity: &str, metric: &str) -> RoutingKey {
    RoutingKey::of(&format!("{identity}/{metric}"))
}

pub fn join_tags(tags: &BTreeMap<String, String>) -> String {
    tags.iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

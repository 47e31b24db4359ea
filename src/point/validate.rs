use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

use super::{CounterType, Identity, Point, RawPoint};
use crate::clock::Clock;

static TAG_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$").expect("tag key pattern is a valid regex")
});

/// Seven days, the accepted distance between a sample and the local clock
pub const DEFAULT_MAX_SKEW_SECS: i64 = 7 * 24 * 3600;

/// Reasons a single point is rejected
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PointError {
    #[error("malformed point: {0}")]
    Malformed(String),
    #[error("metric is empty")]
    EmptyMetric,
    #[error("endpoint and nid are both empty")]
    EmptyIdentity,
    #[error("timestamp {0} outside the accepted window")]
    TimestampOutOfRange(i64),
    #[error("invalid tag key {0:?}")]
    InvalidTagKey(String),
    #[error("duplicate tag key {0:?}")]
    DuplicateTag(String),
    #[error("invalid tags: {0}")]
    InvalidTags(String),
    #[error("value is missing or not numeric")]
    InvalidValue,
    #[error("value is not finite")]
    NonFiniteValue,
    #[error("invalid counter type {0:?}")]
    InvalidCounterType(String),
}

#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    pub min_step: u32,
    pub max_skew_secs: i64,
    pub lowercase_tag_keys: bool,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            min_step: 10,
            max_skew_secs: DEFAULT_MAX_SKEW_SECS,
            lowercase_tag_keys: false,
        }
    }
}

/// Structural validation and normalisation of incoming points
#[derive(Debug, Clone)]
pub struct Validator {
    config: ValidatorConfig,
    clock: Clock,
}

impl Validator {
    pub fn new(config: ValidatorConfig, clock: Clock) -> Self {
        Self { config, clock }
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    pub fn validate(&self, raw: RawPoint) -> Result<Point, PointError> {
        let metric = raw.metric.trim();
        if metric.is_empty() {
            return Err(PointError::EmptyMetric);
        }

        let nid = raw.nid.trim();
        let endpoint = raw.endpoint.trim();
        let identity = if !nid.is_empty() {
            Identity::Node(nid.to_string())
        } else if !endpoint.is_empty() {
            Identity::Endpoint(endpoint.to_string())
        } else {
            return Err(PointError::EmptyIdentity);
        };

        let now = self.clock.now();
        if raw.timestamp.abs_diff(now) > self.config.max_skew_secs.unsigned_abs() {
            return Err(PointError::TimestampOutOfRange(raw.timestamp));
        }

        let value = raw.value.as_f64().ok_or(PointError::InvalidValue)?;
        if !value.is_finite() {
            return Err(PointError::NonFiniteValue);
        }

        let tags = self.normalize_tags(raw.tags)?;

        let counter_type = match raw.counter_type.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(s) => Some(s.parse::<CounterType>()?),
        };

        let step = u32::try_from(raw.step.max(0))
            .unwrap_or(u32::MAX)
            .max(self.config.min_step);

        Ok(Point {
            identity,
            metric: metric.to_string(),
            tags,
            value,
            timestamp: raw.timestamp,
            step,
            counter_type,
            extra: raw.extra.filter(|e| !e.is_empty()),
        })
    }

    fn normalize_tags(&self, raw: Vec<(String, String)>) -> Result<BTreeMap<String, String>, PointError> {
        normalize_tags(raw, self.config.lowercase_tag_keys)
    }
}

/// Trims tag pairs and checks keys against the tag key pattern and for duplicates
pub fn normalize_tags(raw: Vec<(String, String)>, lowercase_keys: bool) -> Result<BTreeMap<String, String>, PointError> {
    let mut tags = BTreeMap::new();
    for (key, value) in raw {
        let key = key.trim();
        let key = if lowercase_keys {
            key.to_ascii_lowercase()
        } else {
            key.to_string()
        };

        if !TAG_KEY.is_match(&key) {
            return Err(PointError::InvalidTagKey(key));
        }

        if tags.insert(key.clone(), value.trim().to_string()).is_some() {
            return Err(PointError::DuplicateTag(key));
        }
    }
    Ok(tags)
}

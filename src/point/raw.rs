use serde::{Deserialize, Serialize};

use super::{Point, PointError};

/// Untyped numeric value as it crosses the ingest boundary
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Value {
    F64(f64),
    I64(i64),
    None,
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::F64(v) => Some(v),
            Value::I64(v) => Some(v as f64),
            Value::None => None,
        }
    }
}

impl From<&serde_json::Value> for Value {
    fn from(v: &serde_json::Value) -> Self {
        match v {
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::I64(i)
                } else {
                    n.as_f64().map(Value::F64).unwrap_or(Value::None)
                }
            }
            serde_json::Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map(Value::F64)
                .unwrap_or(Value::None),
            _ => Value::None,
        }
    }
}

/// A point as submitted by a client, before validation
///
/// This is also the RPC wire shape, so every field is always encoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPoint {
    pub nid: String,
    pub endpoint: String,
    pub metric: String,
    /// Submission order, duplicates preserved so validation can reject them
    pub tags: Vec<(String, String)>,
    pub value: Value,
    pub timestamp: i64,
    pub step: i64,
    pub counter_type: Option<String>,
    pub extra: Option<String>,
}

impl RawPoint {
    pub fn new(endpoint: impl Into<String>, metric: impl Into<String>, value: f64, timestamp: i64) -> Self {
        Self {
            nid: String::new(),
            endpoint: endpoint.into(),
            metric: metric.into(),
            tags: Vec::new(),
            value: Value::F64(value),
            timestamp,
            step: 0,
            counter_type: None,
            extra: None,
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.push((key.into(), value.into()));
        self
    }

    pub fn with_step(mut self, step: i64) -> Self {
        self.step = step;
        self
    }
}

impl From<&Point> for RawPoint {
    fn from(p: &Point) -> Self {
        let (nid, endpoint) = match &p.identity {
            super::Identity::Endpoint(e) => (String::new(), e.clone()),
            super::Identity::Node(n) => (n.clone(), String::new()),
        };
        Self {
            nid,
            endpoint,
            metric: p.metric.clone(),
            tags: p.tags.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            value: Value::F64(p.value),
            timestamp: p.timestamp,
            step: i64::from(p.step),
            counter_type: p.counter_type.map(|c| c.as_str().to_string()),
            extra: p.extra.clone(),
        }
    }
}

/// JSON shape accepted by the HTTP push endpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JsonPoint {
    pub nid: String,
    pub endpoint: String,
    pub metric: String,
    /// Either an object or a `k=v,k=v` string
    pub tags: Option<serde_json::Value>,
    pub value: serde_json::Value,
    pub timestamp: i64,
    pub step: i64,
    #[serde(rename = "counterType", skip_serializing_if = "Option::is_none")]
    pub counter_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<String>,
}

impl TryFrom<JsonPoint> for RawPoint {
    type Error = PointError;

    fn try_from(p: JsonPoint) -> Result<Self, Self::Error> {
        let tags = match &p.tags {
            None | Some(serde_json::Value::Null) => Vec::new(),
            Some(serde_json::Value::String(s)) => parse_tag_string(s)?,
            Some(serde_json::Value::Object(map)) => map
                .iter()
                .map(|(k, v)| {
                    let v = match v {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (k.clone(), v)
                })
                .collect(),
            Some(other) => return Err(PointError::InvalidTags(other.to_string())),
        };

        Ok(RawPoint {
            nid: p.nid,
            endpoint: p.endpoint,
            metric: p.metric,
            tags,
            value: Value::from(&p.value),
            timestamp: p.timestamp,
            step: p.step,
            counter_type: p.counter_type,
            extra: p.extra,
        })
    }
}

impl From<&Point> for JsonPoint {
    fn from(p: &Point) -> Self {
        let tags = p
            .tags
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect::<serde_json::Map<_, _>>();
        let (nid, endpoint) = match &p.identity {
            super::Identity::Endpoint(e) => (String::new(), e.clone()),
            super::Identity::Node(n) => (n.clone(), String::new()),
        };
        Self {
            nid,
            endpoint,
            metric: p.metric.clone(),
            tags: Some(serde_json::Value::Object(tags)),
            value: serde_json::Number::from_f64(p.value)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            timestamp: p.timestamp,
            step: i64::from(p.step),
            counter_type: p.counter_type.map(|c| c.as_str().to_string()),
            extra: p.extra.clone(),
        }
    }
}

/// Parse `k=v,k=v`; an empty string yields no tags
pub fn parse_tag_string(s: &str) -> Result<Vec<(String, String)>, PointError> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(Vec::new());
    }

    s.split(',')
        .filter(|pair| !pair.trim().is_empty())
        .map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| PointError::InvalidTags(pair.to_string()))
        })
        .collect()
}

/// Parse an HTTP push body
///
/// The envelope must be a JSON array. Elements that do not have the point
/// shape are returned as per-element errors so the rest of the batch still
/// goes through.
pub fn parse_json_batch(body: &[u8]) -> Result<Vec<Result<RawPoint, PointError>>, serde_json::Error> {
    let elements: Vec<serde_json::Value> = serde_json::from_slice(body)?;
    Ok(elements
        .into_iter()
        .map(|element| {
            serde_json::from_value::<JsonPoint>(element)
                .map_err(|e| PointError::Malformed(e.to_string()))
                .and_then(RawPoint::try_from)
        })
        .collect())
}

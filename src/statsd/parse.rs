use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

use crate::point::{PointError, normalize_tags, parse_tag_string};

/// Tag holding a request's trace id; never part of the aggregation key
pub const TRACE_ID_TAG: &str = "trace_id";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StatsdParseError {
    #[error("packet is missing its {0} line")]
    MissingLine(&'static str),
    #[error("invalid value {0:?}")]
    InvalidValue(String),
    #[error("metric is empty")]
    EmptyMetric,
    #[error("invalid tags: {0}")]
    InvalidTags(#[from] PointError),
    #[error("aggregator is empty")]
    EmptyAggregator,
    #[error("unknown aggregator {0:?}")]
    UnknownAggregator(String),
}

/// One statistic of a histogram
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HistogramStat {
    /// Digits as written after `p`: `95` is 0.95, `999` is 0.999
    Percentile(String),
    Max,
    Min,
    Avg,
    Sum,
    Cnt,
}

impl HistogramStat {
    pub fn parse(s: &str) -> Result<Self, StatsdParseError> {
        let stat = match s {
            "max" => HistogramStat::Max,
            "min" => HistogramStat::Min,
            "avg" => HistogramStat::Avg,
            "sum" => HistogramStat::Sum,
            "cnt" => HistogramStat::Cnt,
            _ => match s.strip_prefix('p') {
                Some(digits) if !digits.is_empty() && digits.len() <= 4 && digits.bytes().all(|b| b.is_ascii_digit()) => {
                    HistogramStat::Percentile(digits.to_string())
                }
                _ => return Err(StatsdParseError::UnknownAggregator(s.to_string())),
            },
        };
        Ok(stat)
    }

    /// Quantile in `[0, 1]` for percentiles
    pub fn quantile(&self) -> Option<f64> {
        let HistogramStat::Percentile(digits) = self else {
            return None;
        };
        let n: f64 = digits.parse().ok()?;
        // p5 and p50 are whole percents, p999 is 99.9
        let scale = 10f64.powi(digits.len().max(2) as i32);
        Some(n / scale)
    }

    /// Value of the `percentile` tag on the emitted point
    pub fn tag_value(&self) -> &str {
        match self {
            HistogramStat::Percentile(digits) => digits,
            HistogramStat::Max => "max",
            HistogramStat::Min => "min",
            HistogramStat::Avg => "avg",
            HistogramStat::Sum => "sum",
            HistogramStat::Cnt => "cnt",
        }
    }
}

/// What to compute for a metric
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AggrSpec {
    Counter,
    Gauge,
    /// Latency histogram plus error accounting
    Rpc,
    /// [`AggrSpec::Rpc`] plus a counter per status code
    Rpce,
    Histogram(Vec<HistogramStat>),
}

impl AggrSpec {
    pub fn parse(s: &str) -> Result<Self, StatsdParseError> {
        let s = s.trim();
        let spec = match s {
            "" => return Err(StatsdParseError::EmptyAggregator),
            "c" => AggrSpec::Counter,
            "g" => AggrSpec::Gauge,
            "rpc" => AggrSpec::Rpc,
            "rpce" => AggrSpec::Rpce,
            list => {
                let mut stats = list
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(HistogramStat::parse)
                    .collect::<Result<Vec<_>, _>>()?;
                if stats.is_empty() {
                    return Err(StatsdParseError::EmptyAggregator);
                }
                stats.sort();
                stats.dedup();
                AggrSpec::Histogram(stats)
            }
        };
        Ok(spec)
    }

    pub fn is_rpc(&self) -> bool {
        matches!(self, AggrSpec::Rpc | AggrSpec::Rpce)
    }
}

impl fmt::Display for AggrSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AggrSpec::Counter => f.write_str("c"),
            AggrSpec::Gauge => f.write_str("g"),
            AggrSpec::Rpc => f.write_str("rpc"),
            AggrSpec::Rpce => f.write_str("rpce"),
            AggrSpec::Histogram(stats) => {
                for (i, stat) in stats.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    match stat {
                        HistogramStat::Percentile(d) => write!(f, "p{d}")?,
                        other => f.write_str(other.tag_value())?,
                    }
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Sample {
    Value(f64),
    /// `latency,code`
    Call { latency: f64, code: String },
}

/// One parsed three-line packet
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub sample: Sample,
    pub namespace: String,
    pub metric: String,
    /// Without `trace_id`
    pub tags: BTreeMap<String, String>,
    pub trace_id: Option<String>,
    pub aggr: AggrSpec,
}

impl Packet {
    /// `value\n[namespace/]metric\n[k=v,k=v|]aggr`
    pub fn parse(text: &str) -> Result<Self, StatsdParseError> {
        let mut lines = text.lines();
        let value_line = lines.next().ok_or(StatsdParseError::MissingLine("value"))?;
        let metric_line = lines.next().ok_or(StatsdParseError::MissingLine("metric"))?;
        let tag_line = lines.next().ok_or(StatsdParseError::MissingLine("aggregator"))?;
        Self::from_lines(value_line, metric_line, tag_line)
    }

    pub fn from_lines(value_line: &str, metric_line: &str, tag_line: &str) -> Result<Self, StatsdParseError> {
        let (tag_part, aggr_part) = tag_line.rsplit_once('|').unwrap_or(("", tag_line));
        let aggr = AggrSpec::parse(aggr_part)?;

        let (namespace, metric) = metric_line.trim().split_once('/').unwrap_or(("", metric_line.trim()));
        if metric.is_empty() {
            return Err(StatsdParseError::EmptyMetric);
        }

        let mut tags = normalize_tags(parse_tag_string(tag_part)?, false)?;
        let trace_id = tags.remove(TRACE_ID_TAG);

        let sample = parse_sample(value_line.trim(), aggr.is_rpc())?;

        Ok(Self {
            sample,
            namespace: namespace.to_string(),
            metric: metric.to_string(),
            tags,
            trace_id,
            aggr,
        })
    }

    /// Trace ids ending in `ff` mark security-scan traffic
    pub fn is_scan(&self) -> bool {
        self.trace_id.as_deref().is_some_and(|id| id.to_ascii_lowercase().ends_with("ff"))
    }
}

fn parse_sample(s: &str, rpc: bool) -> Result<Sample, StatsdParseError> {
    let number = |v: &str| {
        v.trim()
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| StatsdParseError::InvalidValue(s.to_string()))
    };

    if rpc {
        let (latency, code) = s.split_once(',').unwrap_or((s, "0"));
        Ok(Sample::Call {
            latency: number(latency)?,
            code: code.trim().to_string(),
        })
    } else {
        Ok(Sample::Value(number(s)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_counter_packet() {
        let packet = Packet::parse("3\nshop/orders.created\nregion=eu,trace_id=abc1|c").unwrap();

        assert_eq!(packet.sample, Sample::Value(3.0));
        assert_eq!(packet.namespace, "shop");
        assert_eq!(packet.metric, "orders.created");
        assert_eq!(packet.tags.get("region").map(String::as_str), Some("eu"));
        assert!(!packet.tags.contains_key(TRACE_ID_TAG));
        assert_eq!(packet.trace_id.as_deref(), Some("abc1"));
        assert_eq!(packet.aggr, AggrSpec::Counter);
        assert!(!packet.is_scan());
    }

    #[test]
    fn test_optional_parts() {
        let packet = Packet::parse("1.5\nqueue.depth\ng").unwrap();
        assert_eq!(packet.namespace, "");
        assert!(packet.tags.is_empty());
        assert_eq!(packet.aggr, AggrSpec::Gauge);
    }

    #[test]
    fn test_rpc_value_line() {
        let packet = Packet::parse("12.5,500\napi/login\n|rpce").unwrap();
        assert_eq!(
            packet.sample,
            Sample::Call {
                latency: 12.5,
                code: "500".to_string()
            }
        );

        let packet = Packet::parse("7\napi/login\n|rpc").unwrap();
        assert_matches!(packet.sample, Sample::Call { ref code, .. } if code == "0");
    }

    #[test]
    fn test_histogram_list_is_canonical() {
        let a = AggrSpec::parse("p99,max,p95").unwrap();
        let b = AggrSpec::parse("p95, p99,max,p99").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "p95,p99,max");
    }

    #[test]
    fn test_quantiles() {
        assert_eq!(HistogramStat::Percentile("95".into()).quantile(), Some(0.95));
        assert_eq!(HistogramStat::Percentile("5".into()).quantile(), Some(0.05));
        assert_eq!(HistogramStat::Percentile("999".into()).quantile(), Some(0.999));
        assert_eq!(HistogramStat::Max.quantile(), None);
    }

    #[test]
    fn test_scan_trace_id() {
        let packet = Packet::parse("1\nm\ntrace_id=0a1bFF|c").unwrap();
        assert!(packet.is_scan());
    }

    #[test]
    fn test_errors() {
        assert_matches!(Packet::parse("1\nm"), Err(StatsdParseError::MissingLine("aggregator")));
        assert_matches!(Packet::parse("x\nm\nc"), Err(StatsdParseError::InvalidValue(_)));
        assert_matches!(Packet::parse("1\nns/\nc"), Err(StatsdParseError::EmptyMetric));
        assert_matches!(Packet::parse("1\nm\nk=v|"), Err(StatsdParseError::EmptyAggregator));
        assert_matches!(Packet::parse("1\nm\nmedian"), Err(StatsdParseError::UnknownAggregator(_)));
        assert_matches!(Packet::parse("1\nm\nnovalue|c"), Err(StatsdParseError::InvalidTags(_)));
    }

    #[test]
    fn test_tag_keys_are_validated() {
        assert_matches!(
            Packet::parse("1\nshop/orders\nbad key=eu|c"),
            Err(StatsdParseError::InvalidTags(PointError::InvalidTagKey(k))) if k == "bad key"
        );
        assert_matches!(
            Packet::parse("1\nshop/orders\n=x|c"),
            Err(StatsdParseError::InvalidTags(PointError::InvalidTagKey(k))) if k.is_empty()
        );
        assert_matches!(
            Packet::parse("1\nshop/orders\nregion=eu, region=us|c"),
            Err(StatsdParseError::InvalidTags(PointError::DuplicateTag(k))) if k == "region"
        );
        assert!(Packet::parse("1\nshop/orders\n region = eu |c").is_ok());
    }
}

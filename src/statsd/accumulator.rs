use std::collections::BTreeMap;

use super::digest::TDigest;
use super::parse::{AggrSpec, HistogramStat, Sample};

/// Latency statistics reported for `rpc` and `rpce`
const RPC_LATENCY_STATS: [&str; 7] = ["p50", "p75", "p95", "p99", "max", "min", "avg"];

/// One output series of an accumulator: metric suffix, extra tag, value
#[derive(Debug, Clone, PartialEq)]
pub struct Emitted {
    pub suffix: &'static str,
    pub tag: Option<(&'static str, String)>,
    pub value: f64,
}

impl Emitted {
    fn plain(suffix: &'static str, value: f64) -> Self {
        Self { suffix, tag: None, value }
    }

    fn tagged(suffix: &'static str, key: &'static str, tag: impl Into<String>, value: f64) -> Self {
        Self {
            suffix,
            tag: Some((key, tag.into())),
            value,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Histogram {
    digest: TDigest,
    min: f64,
    max: f64,
    sum: f64,
    count: u64,
}

impl Histogram {
    pub fn add(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.sum += value;
        self.count += 1;
        self.digest.add(value);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn freeze(&mut self) {
        self.digest.compress();
    }

    pub fn stat(&self, stat: &HistogramStat) -> Option<f64> {
        if self.count == 0 {
            return None;
        }
        match stat {
            HistogramStat::Percentile(_) => stat.quantile().and_then(|q| self.digest.quantile(q)),
            HistogramStat::Max => Some(self.max),
            HistogramStat::Min => Some(self.min),
            HistogramStat::Avg => Some(self.sum / self.count as f64),
            HistogramStat::Sum => Some(self.sum),
            HistogramStat::Cnt => Some(self.count as f64),
        }
    }

    fn emit(&self, stats: &[HistogramStat], out: &mut Vec<Emitted>) {
        for stat in stats {
            if let Some(value) = self.stat(stat) {
                out.push(Emitted::tagged(".latency", "percentile", stat.tag_value(), value));
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RpcStats {
    latency: Histogram,
    total: u64,
    errors: u64,
    codes: BTreeMap<String, u64>,
}

impl RpcStats {
    fn add(&mut self, latency: f64, code: &str) {
        self.latency.add(latency);
        self.total += 1;
        if is_error_code(code) {
            self.errors += 1;
        }
        *self.codes.entry(code.to_string()).or_default() += 1;
    }
}

/// `0`, `200` and `ok` (and an empty code) are successes
pub fn is_error_code(code: &str) -> bool {
    !matches!(code.trim(), "" | "0" | "200") && !code.trim().eq_ignore_ascii_case("ok")
}

#[derive(Debug, Clone)]
pub enum Accumulator {
    Counter(f64),
    Gauge(f64),
    Histogram(Histogram),
    Rpc(RpcStats),
}

impl Accumulator {
    pub fn new(spec: &AggrSpec) -> Self {
        match spec {
            AggrSpec::Counter => Accumulator::Counter(0.0),
            AggrSpec::Gauge => Accumulator::Gauge(0.0),
            AggrSpec::Histogram(_) => Accumulator::Histogram(Histogram::default()),
            AggrSpec::Rpc | AggrSpec::Rpce => Accumulator::Rpc(RpcStats::default()),
        }
    }

    /// Samples of the wrong shape for this accumulator are ignored
    pub fn add(&mut self, sample: &Sample) {
        match (self, sample) {
            (Accumulator::Counter(sum), Sample::Value(v)) => *sum += v,
            (Accumulator::Gauge(last), Sample::Value(v)) => *last = *v,
            (Accumulator::Histogram(h), Sample::Value(v)) => h.add(*v),
            (Accumulator::Rpc(rpc), Sample::Call { latency, code }) => rpc.add(*latency, code),
            _ => {}
        }
    }

    pub fn freeze(&mut self) {
        match self {
            Accumulator::Histogram(h) => h.freeze(),
            Accumulator::Rpc(rpc) => rpc.latency.freeze(),
            Accumulator::Counter(_) | Accumulator::Gauge(_) => {}
        }
    }

    /// Output series; pure, so a frozen accumulator emits the same every time
    pub fn emit(&self, spec: &AggrSpec) -> Vec<Emitted> {
        let mut out = Vec::new();
        match (self, spec) {
            (Accumulator::Counter(sum), _) => out.push(Emitted::plain(".counter", *sum)),
            (Accumulator::Gauge(last), _) => out.push(Emitted::plain(".gauge", *last)),
            (Accumulator::Histogram(h), AggrSpec::Histogram(stats)) => h.emit(stats, &mut out),
            (Accumulator::Rpc(rpc), _) => {
                let stats: Vec<HistogramStat> = RPC_LATENCY_STATS
                    .iter()
                    .filter_map(|s| HistogramStat::parse(s).ok())
                    .collect();
                rpc.latency.emit(&stats, &mut out);

                out.push(Emitted::plain(".counter", rpc.total as f64));
                out.push(Emitted::plain(".error.counter", rpc.errors as f64));
                let ratio = if rpc.total == 0 { 0.0 } else { rpc.errors as f64 / rpc.total as f64 };
                out.push(Emitted::plain(".error.ratio", ratio));

                if *spec == AggrSpec::Rpce {
                    for (code, n) in &rpc.codes {
                        out.push(Emitted::tagged(".code.counter", "code", code.clone(), *n as f64));
                    }
                }
            }
            (Accumulator::Histogram(_), _) => {}
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(latency: f64, code: &str) -> Sample {
        Sample::Call {
            latency,
            code: code.to_string(),
        }
    }

    #[test]
    fn test_counter_and_gauge() {
        let mut counter = Accumulator::new(&AggrSpec::Counter);
        let mut gauge = Accumulator::new(&AggrSpec::Gauge);
        for v in [1.0, 2.0, 3.5] {
            counter.add(&Sample::Value(v));
            gauge.add(&Sample::Value(v));
        }

        assert_eq!(counter.emit(&AggrSpec::Counter), vec![Emitted::plain(".counter", 6.5)]);
        assert_eq!(gauge.emit(&AggrSpec::Gauge), vec![Emitted::plain(".gauge", 3.5)]);
    }

    #[test]
    fn test_histogram_singletons() {
        let spec = AggrSpec::parse("max,min,avg,sum,cnt").unwrap();
        let mut acc = Accumulator::new(&spec);
        for v in [4.0, 2.0, 6.0] {
            acc.add(&Sample::Value(v));
        }
        acc.freeze();

        let emitted: Vec<(String, f64)> = acc
            .emit(&spec)
            .into_iter()
            .map(|e| (e.tag.map(|(_, v)| v).unwrap_or_default(), e.value))
            .collect();
        assert_eq!(
            emitted,
            vec![
                ("max".to_string(), 6.0),
                ("min".to_string(), 2.0),
                ("avg".to_string(), 4.0),
                ("sum".to_string(), 12.0),
                ("cnt".to_string(), 3.0),
            ]
        );
    }

    #[test]
    fn test_rpc_error_accounting() {
        let mut acc = Accumulator::new(&AggrSpec::Rpce);
        acc.add(&call(10.0, "0"));
        acc.add(&call(20.0, "200"));
        acc.add(&call(30.0, "500"));
        acc.add(&call(40.0, "500"));
        acc.freeze();

        let emitted = acc.emit(&AggrSpec::Rpce);
        let find = |suffix: &str| emitted.iter().find(|e| e.suffix == suffix).map(|e| e.value);
        assert_eq!(find(".counter"), Some(4.0));
        assert_eq!(find(".error.counter"), Some(2.0));
        assert_eq!(find(".error.ratio"), Some(0.5));

        let codes: Vec<(String, f64)> = emitted
            .iter()
            .filter(|e| e.suffix == ".code.counter")
            .map(|e| (e.tag.clone().map(|(_, c)| c).unwrap_or_default(), e.value))
            .collect();
        assert_eq!(codes, vec![("0".into(), 1.0), ("200".into(), 1.0), ("500".into(), 2.0)]);

        let plain = Accumulator::new(&AggrSpec::Rpc).emit(&AggrSpec::Rpc);
        assert!(plain.iter().all(|e| e.suffix != ".code.counter"));
    }

    #[test]
    fn test_emit_is_repeatable() {
        let spec = AggrSpec::parse("p50,p99").unwrap();
        let mut acc = Accumulator::new(&spec);
        for v in 1..=100 {
            acc.add(&Sample::Value(v as f64));
        }
        acc.freeze();
        assert_eq!(acc.emit(&spec), acc.emit(&spec));
    }

    #[test]
    fn test_error_codes() {
        assert!(!is_error_code("0"));
        assert!(!is_error_code("OK"));
        assert!(is_error_code("404"));
    }
}

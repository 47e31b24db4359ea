//! Merging t-digest
//!
//! Samples are buffered and periodically merged into a sorted list of
//! centroids. A centroid may absorb neighbours while its weight stays under
//! `4 * n * q * (1 - q) / compression`, which keeps the tails at full
//! resolution and lets the middle coarsen.

const DEFAULT_COMPRESSION: f64 = 100.0;

/// Buffer size as a multiple of the compression factor
const BUFFER_FACTOR: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Centroid {
    mean: f64,
    weight: f64,
}

#[derive(Debug, Clone)]
pub struct TDigest {
    compression: f64,
    centroids: Vec<Centroid>,
    buffer: Vec<f64>,
    count: f64,
    min: f64,
    max: f64,
}

impl Default for TDigest {
    fn default() -> Self {
        Self::new(DEFAULT_COMPRESSION)
    }
}

impl TDigest {
    pub fn new(compression: f64) -> Self {
        Self {
            compression,
            centroids: Vec::new(),
            buffer: Vec::new(),
            count: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    pub fn add(&mut self, value: f64) {
        self.buffer.push(value);
        self.count += 1.0;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        if self.buffer.len() >= BUFFER_FACTOR * self.compression as usize {
            self.compress();
        }
    }

    pub fn count(&self) -> u64 {
        self.count as u64
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0.0
    }

    /// Centroids after the last merge
    pub fn centroid_count(&self) -> usize {
        self.centroids.len()
    }

    /// Merge buffered samples into the centroid list
    pub fn compress(&mut self) {
        if self.buffer.is_empty() {
            return;
        }

        let mut all: Vec<Centroid> = self
            .buffer
            .drain(..)
            .map(|mean| Centroid { mean, weight: 1.0 })
            .chain(self.centroids.drain(..))
            .collect();
        all.sort_by(|a, b| a.mean.total_cmp(&b.mean));

        let total = self.count;
        let mut merged = Vec::with_capacity(all.len().min(self.compression as usize * 4));
        let mut iter = all.into_iter();
        let Some(mut current) = iter.next() else {
            return;
        };
        let mut before = 0.0;

        for next in iter {
            let combined = current.weight + next.weight;
            let q = (before + combined / 2.0) / total;
            let limit = 4.0 * total * q * (1.0 - q) / self.compression;

            if combined <= limit {
                current.mean += (next.mean - current.mean) * next.weight / combined;
                current.weight = combined;
            } else {
                before += current.weight;
                merged.push(current);
                current = next;
            }
        }
        merged.push(current);
        self.centroids = merged;
    }

    /// Estimated value at quantile `q`; needs a prior [`TDigest::compress`]
    /// to see buffered samples
    pub fn quantile(&self, q: f64) -> Option<f64> {
        let (first, last) = (self.centroids.first()?, self.centroids.last()?);
        if q <= 0.0 {
            return Some(self.min);
        }
        if q >= 1.0 {
            return Some(self.max);
        }

        let target = q * self.count;
        let mut cumulative = 0.0;
        let mut prev_center = first.weight / 2.0;
        let mut prev_mean = first.mean;

        if target < prev_center {
            return Some(interpolate(0.0, self.min, prev_center, first.mean, target));
        }

        for c in &self.centroids {
            let center = cumulative + c.weight / 2.0;
            if target <= center {
                return Some(interpolate(prev_center, prev_mean, center, c.mean, target));
            }
            prev_center = center;
            prev_mean = c.mean;
            cumulative += c.weight;
        }

        Some(interpolate(prev_center, last.mean, self.count, self.max, target))
    }
}

fn interpolate(x0: f64, y0: f64, x1: f64, y1: f64, x: f64) -> f64 {
    if x1 <= x0 {
        return y1;
    }
    y0 + (y1 - y0) * (x - x0) / (x1 - x0)
}

use std::collections::VecDeque;

/// Fixed-capacity rolling window of observed lowest prices for one query
/// group. Pushing past capacity evicts the oldest sample.
#[derive(Debug, Clone)]
pub struct PriceWindow {
    samples: VecDeque<i64>,
    cap: usize,
}

impl PriceWindow {
    pub fn new(cap: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(cap),
            cap,
        }
    }

    pub fn push(&mut self, price: i64) {
        if self.samples.len() == self.cap {
            self.samples.pop_front();
        }
        self.samples.push_back(price);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Samples oldest-first as a contiguous slice-friendly Vec.
    pub fn as_vec(&self) -> Vec<i64> {
        self.samples.iter().copied().collect()
    }

    pub fn mean(&self) -> f64 {
        mean(&self.as_vec())
    }

    /// Population standard deviation over the whole window.
    pub fn std_dev(&self) -> f64 {
        let values = self.as_vec();
        if values.is_empty() {
            return 0.0;
        }
        let m = mean(&values);
        let variance = values
            .iter()
            .map(|&v| {
                let d = v as f64 - m;
                d * d
            })
            .sum::<f64>()
            / values.len() as f64;
        variance.sqrt()
    }

    /// The newest `n` samples, oldest-first (all of them if fewer exist).
    pub fn last_n(&self, n: usize) -> Vec<i64> {
        let values = self.as_vec();
        let start = values.len().saturating_sub(n);
        values[start..].to_vec()
    }

    /// Everything older than the newest `n` samples.
    pub fn before_last_n(&self, n: usize) -> Vec<i64> {
        let values = self.as_vec();
        let end = values.len().saturating_sub(n);
        values[..end].to_vec()
    }

    /// The `n` samples immediately preceding the newest `n` — the second
    /// half of the stable-price comparison. Distinct from `before_last_n`
    /// on purpose: the two call sites slice differently when the window
    /// holds more than 2n samples.
    pub fn prior_n(&self, n: usize) -> Vec<i64> {
        let values = self.as_vec();
        let end = values.len().saturating_sub(n);
        let start = end.saturating_sub(n);
        values[start..end].to_vec()
    }
}

/// Arithmetic mean; 0.0 for an empty slice (callers guard on emptiness
/// where 0.0 would be misleading).
pub fn mean(values: &[i64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<i64>() as f64 / values.len() as f64
}

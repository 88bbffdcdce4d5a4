//! Divergence-based equivalence checks between two backends' predictions.
//!
//! Verification replays one instance's sampled tokens through another
//! instance and compares the per-step distributions. Three signals are
//! combined: top-1 agreement, a normalized L2-energy distance over raw
//! logits, and the Jensen-Shannon divergence of the softmaxed
//! distributions restricted to the shared token set.

use std::collections::HashMap;

use blama_engine::{Token, TokenData, TokenDataVector};

/// Per-step comparison result.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ComparisonMetrics {
    /// 1.0 iff both sides rank the same token first.
    pub top1_match: f32,
    /// `|e1 - e2| / max(e1, e2)` over the squared-logit energies.
    pub distance: f32,
    /// Jensen-Shannon divergence over the shared token set.
    pub jsd: f32,
}

/// Pure comparison functions over sampler-produced candidate lists.
pub struct LogitComparer;

impl LogitComparer {
    /// Compare two candidate lists over the prefix both sides cover.
    pub fn compare(data1: &TokenDataVector, data2: &TokenDataVector) -> ComparisonMetrics {
        let min_size = data1.len().min(data2.len());

        let e1 = Self::euclidean_sq(&data1[..min_size]);
        let e2 = Self::euclidean_sq(&data2[..min_size]);
        let denom = e1.max(e2);
        let distance = if denom > 0.0 {
            (e1 - e2).abs() / denom
        } else {
            0.0
        };

        let top1_match = match (data1.first(), data2.first()) {
            (Some(a), Some(b)) if a.token == b.token => 1.0,
            (None, None) => 1.0,
            _ => 0.0,
        };

        let p = Self::softmax_map(&data1[..min_size]);
        let q = Self::softmax_map(&data2[..min_size]);

        ComparisonMetrics {
            top1_match,
            distance,
            jsd: Self::jsd(&p, &q),
        }
    }

    /// Weighted per-token similarity. Each token of `data1` contributes with
    /// weight `|logit|`; a token missing from `data2` contributes zero
    /// similarity at full weight.
    pub fn logit_similarity(data1: &TokenDataVector, data2: &TokenDataVector) -> f32 {
        let by_id: HashMap<Token, f32> = data2.iter().map(|d| (d.token, d.logit)).collect();

        let mut weight_sum = 0.0f64;
        let mut acc = 0.0f64;
        for d in data1 {
            let w = f64::from(d.logit.abs());
            weight_sum += w;
            if let Some(&other) = by_id.get(&d.token) {
                let denom = d.logit.abs().max(other.abs());
                let sim = if denom > 0.0 {
                    1.0 - (d.logit - other).abs() / denom
                } else {
                    1.0
                };
                acc += w * f64::from(sim);
            }
        }

        if weight_sum > 0.0 {
            (acc / weight_sum) as f32
        } else {
            1.0
        }
    }

    /// Aggregate a batch of metrics with a fresh [`MetricsAggregator`].
    pub fn comparison_final_score(metrics: &[ComparisonMetrics]) -> f32 {
        MetricsAggregator::default().push_and_verify(metrics)
    }

    fn euclidean_sq(tokens: &[TokenData]) -> f32 {
        // the true distance needs a square root at the end; comparisons don't
        tokens.iter().map(|t| t.logit * t.logit).sum()
    }

    /// Softmax over the prefix with subtract-max for stability, keyed by
    /// token id.
    fn softmax_map(tokens: &[TokenData]) -> HashMap<Token, f32> {
        if tokens.is_empty() {
            return HashMap::new();
        }
        let max = tokens
            .iter()
            .map(|t| t.logit)
            .fold(f32::NEG_INFINITY, f32::max);
        let mut out = HashMap::with_capacity(tokens.len());
        let mut sum = 0.0f32;
        for t in tokens {
            let e = (t.logit - max).exp();
            sum += e;
            out.insert(t.token, e);
        }
        if sum > 0.0 {
            for v in out.values_mut() {
                *v /= sum;
            }
        }
        out
    }

    /// Jensen-Shannon divergence restricted to tokens carrying positive mass
    /// on both sides; `M` is the pairwise average over that intersection.
    fn jsd(p: &HashMap<Token, f32>, q: &HashMap<Token, f32>) -> f32 {
        let mut avg = HashMap::new();
        for (&token, &pv) in p {
            if let Some(&qv) = q.get(&token) {
                avg.insert(token, (pv + qv) / 2.0);
            }
        }

        let kl = |a: &HashMap<Token, f32>, m: &HashMap<Token, f32>| {
            let mut out = 0.0f32;
            for (&token, &av) in a {
                if av > 0.0 {
                    if let Some(&mv) = m.get(&token) {
                        if mv > 0.0 {
                            out += av * (av / mv).ln();
                        }
                    }
                }
            }
            out
        };

        (kl(p, &avg) + kl(q, &avg)) / 2.0
    }
}

/// Accumulates per-step metrics and reports a running aggregate score.
#[derive(Debug, Default)]
pub struct MetricsAggregator {
    entries: Vec<ComparisonMetrics>,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a batch and return the running mean of
    /// `0.5*(1-distance) + 0.5*(1-jsd)` over everything accumulated so far.
    pub fn push_and_verify(&mut self, batch: &[ComparisonMetrics]) -> f32 {
        self.entries.extend_from_slice(batch);
        if self.entries.is_empty() {
            return 0.0;
        }
        let sum: f32 = self
            .entries
            .iter()
            .map(|m| 0.5 * (1.0 - m.distance) + 0.5 * (1.0 - m.jsd))
            .sum();
        sum / self.entries.len() as f32
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

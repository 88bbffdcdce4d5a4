//! Probability transforms of the sampler chain.
//!
//! Every transform edits a candidate array in place, in the style of the
//! classic sampler stacks: truncating steps sort and shrink, scaling steps
//! rewrite logits, and terminal steps pick a candidate. Probabilities are
//! only meaningful after a softmax ran.

use blama_engine::{Token, TokenData};
use rand::rngs::StdRng;
use rand::Rng;

/// Candidate array threaded through the chain.
#[derive(Debug, Clone)]
pub(crate) struct Candidates {
    pub data: Vec<TokenData>,
    /// Sorted by logit, descending.
    pub sorted: bool,
    pub selected: Option<usize>,
}

impl Candidates {
    pub fn from_logits(logits: &[f32]) -> Self {
        Candidates {
            data: logits
                .iter()
                .enumerate()
                .map(|(id, &logit)| TokenData::new(id as Token, logit))
                .collect(),
            sorted: false,
            selected: None,
        }
    }

    pub fn single(token: Token, logit: f32) -> Self {
        Candidates {
            data: vec![TokenData::new(token, logit)],
            sorted: true,
            selected: None,
        }
    }

    pub fn sort_desc(&mut self) {
        if !self.sorted {
            self.data
                .sort_by(|a, b| b.logit.partial_cmp(&a.logit).unwrap_or(std::cmp::Ordering::Equal));
            self.sorted = true;
        }
    }

    /// Softmax with subtract-max; sorts descending first.
    pub fn softmax(&mut self) {
        if self.data.is_empty() {
            return;
        }
        self.sort_desc();
        let max = self.data[0].logit;
        let mut sum = 0.0f32;
        for d in &mut self.data {
            d.prob = (d.logit - max).exp();
            sum += d.prob;
        }
        if sum > 0.0 {
            for d in &mut self.data {
                d.prob /= sum;
            }
        }
    }
}

fn min_keep_floor(min_keep: usize) -> usize {
    min_keep.max(1)
}

pub(crate) fn top_k(c: &mut Candidates, k: i32) {
    let k = if k <= 0 {
        c.data.len()
    } else {
        (k as usize).min(c.data.len())
    };
    c.sort_desc();
    c.data.truncate(k);
}

pub(crate) fn top_p(c: &mut Candidates, p: f32, min_keep: usize) {
    if p >= 1.0 {
        return;
    }
    c.softmax();
    let mut cum = 0.0f32;
    let mut last = c.data.len();
    for (i, d) in c.data.iter().enumerate() {
        cum += d.prob;
        if cum >= p && i + 1 >= min_keep_floor(min_keep) {
            last = i + 1;
            break;
        }
    }
    c.data.truncate(last);
}

pub(crate) fn min_p(c: &mut Candidates, p: f32, min_keep: usize) {
    if p <= 0.0 || c.data.is_empty() {
        return;
    }
    c.sort_desc();
    let threshold = c.data[0].logit + p.ln();
    let mut cut = c
        .data
        .iter()
        .position(|d| d.logit < threshold)
        .unwrap_or(c.data.len());
    cut = cut.max(min_keep_floor(min_keep)).min(c.data.len());
    c.data.truncate(cut);
}

pub(crate) fn typical_p(c: &mut Candidates, p: f32, min_keep: usize) {
    if p >= 1.0 || c.data.is_empty() {
        return;
    }
    c.softmax();

    let entropy: f32 = c
        .data
        .iter()
        .filter(|d| d.prob > 0.0)
        .map(|d| -d.prob * d.prob.ln())
        .sum();

    // rank by distance of each token's information content from the entropy
    let mut order: Vec<usize> = (0..c.data.len()).collect();
    let shift = |i: usize| ((-c.data[i].prob.max(f32::MIN_POSITIVE).ln()) - entropy).abs();
    order.sort_by(|&a, &b| {
        shift(a)
            .partial_cmp(&shift(b))
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut cum = 0.0f32;
    let mut keep = Vec::new();
    for (rank, &i) in order.iter().enumerate() {
        cum += c.data[i].prob;
        keep.push(c.data[i]);
        if cum >= p && rank + 1 >= min_keep_floor(min_keep) {
            break;
        }
    }
    c.data = keep;
    c.sorted = false;
}

pub(crate) fn temperature(c: &mut Candidates, t: f32) {
    if c.data.is_empty() {
        return;
    }
    if t <= 0.0 {
        // greedy: keep only the argmax candidate
        let best = c
            .data
            .iter()
            .enumerate()
            .max_by(|a, b| {
                a.1.logit
                    .partial_cmp(&b.1.logit)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(i, _)| i)
            .unwrap_or(0);
        c.data.swap(0, best);
        c.data.truncate(1);
        c.sorted = true;
        return;
    }
    for d in &mut c.data {
        d.logit /= t;
    }
}

/// Dynamic-range temperature: the effective temperature tracks normalized
/// entropy, mapped through `exponent`.
pub(crate) fn temperature_ext(c: &mut Candidates, t: f32, range: f32, exponent: f32) {
    if range <= 0.0 {
        temperature(c, t);
        return;
    }
    if c.data.len() <= 1 {
        return;
    }
    let min_t = (t - range).max(0.0);
    let max_t = t + range;

    c.softmax();
    let entropy: f32 = c
        .data
        .iter()
        .filter(|d| d.prob > 0.0)
        .map(|d| -d.prob * d.prob.ln())
        .sum();
    let max_entropy = (c.data.len() as f32).ln();
    let norm = if max_entropy > 0.0 {
        entropy / max_entropy
    } else {
        0.0
    };
    let dyn_t = min_t + (max_t - min_t) * norm.powf(exponent);
    if dyn_t <= 0.0 {
        temperature(c, 0.0);
        return;
    }
    for d in &mut c.data {
        d.logit /= dyn_t;
    }
}

/// Exclude-top-choices: with probability `probability`, drop every candidate
/// above `threshold` except the least likely of them.
pub(crate) fn xtc(
    c: &mut Candidates,
    probability: f32,
    threshold: f32,
    min_keep: usize,
    rng: &mut StdRng,
) {
    if probability <= 0.0 || threshold > 0.5 || c.data.len() < 2 {
        return;
    }
    if rng.gen::<f32>() >= probability {
        return;
    }
    c.softmax();
    let above = c.data.iter().take_while(|d| d.prob >= threshold).count();
    if above < 2 {
        return;
    }
    let drop = above - 1;
    if c.data.len() - drop < min_keep_floor(min_keep) {
        return;
    }
    c.data.drain(..drop);
}

/// Repetition, frequency, and presence penalties over recent context.
pub(crate) fn penalties(
    c: &mut Candidates,
    recent: &[Token],
    repeat: f32,
    freq: f32,
    present: f32,
) {
    if recent.is_empty() || (repeat == 1.0 && freq == 0.0 && present == 0.0) {
        return;
    }
    use std::collections::HashMap;
    let mut counts: HashMap<Token, u32> = HashMap::new();
    for &t in recent {
        *counts.entry(t).or_insert(0) += 1;
    }
    for d in &mut c.data {
        let Some(&n) = counts.get(&d.token) else {
            continue;
        };
        if d.logit <= 0.0 {
            d.logit *= repeat;
        } else {
            d.logit /= repeat;
        }
        d.logit -= n as f32 * freq + present;
    }
    c.sorted = false;
}

pub(crate) fn logit_bias(c: &mut Candidates, bias: &[(Token, f32)]) {
    if bias.is_empty() {
        return;
    }
    for &(token, b) in bias {
        if let Some(d) = c.data.iter_mut().find(|d| d.token == token) {
            d.logit += b;
        }
    }
    c.sorted = false;
}

/// Terminal step: softmax and draw from the remaining distribution.
pub(crate) fn dist(c: &mut Candidates, rng: &mut StdRng) {
    if c.data.is_empty() {
        return;
    }
    c.softmax();
    let r = rng.gen::<f32>();
    let mut cum = 0.0f32;
    for (i, d) in c.data.iter().enumerate() {
        cum += d.prob;
        if r < cum {
            c.selected = Some(i);
            return;
        }
    }
    c.selected = Some(c.data.len() - 1);
}

/// Mirostat v1: adaptive top-k targeting a surprise set-point.
#[allow(clippy::too_many_arguments)]
pub(crate) fn mirostat_v1(
    c: &mut Candidates,
    n_vocab: u32,
    tau: f32,
    eta: f32,
    m: usize,
    mu: &mut f32,
    rng: &mut StdRng,
) {
    if c.data.is_empty() {
        return;
    }
    c.softmax();

    // estimate the Zipf exponent over the head of the distribution
    let mut sum_ti_bi = 0.0f32;
    let mut sum_ti_sq = 0.0f32;
    let limit = m.min(c.data.len()).saturating_sub(1);
    for i in 0..limit {
        let t_i = (((i + 2) as f32) / ((i + 1) as f32)).ln();
        let p0 = c.data[i].prob.max(f32::MIN_POSITIVE);
        let p1 = c.data[i + 1].prob.max(f32::MIN_POSITIVE);
        let b_i = (p0 / p1).ln();
        sum_ti_bi += t_i * b_i;
        sum_ti_sq += t_i * t_i;
    }
    let s_hat = if sum_ti_sq > 0.0 {
        sum_ti_bi / sum_ti_sq
    } else {
        1.0
    };

    let epsilon_hat = s_hat - 1.0;
    let k = if epsilon_hat.abs() < 1e-6 {
        c.data.len() as f32
    } else {
        ((epsilon_hat * 2f32.powf(*mu)) / (1.0 - (n_vocab as f32).powf(-epsilon_hat)))
            .powf(1.0 / s_hat)
    };
    let k = (k.round().max(1.0) as i32).max(1);

    top_k(c, k);
    dist(c, rng);

    if let Some(sel) = c.selected {
        let observed = -c.data[sel].prob.max(f32::MIN_POSITIVE).log2();
        *mu -= eta * (observed - tau);
    }
}

/// Mirostat v2: truncate by surprise against the running `mu`.
pub(crate) fn mirostat_v2(
    c: &mut Candidates,
    tau: f32,
    eta: f32,
    mu: &mut f32,
    rng: &mut StdRng,
) {
    if c.data.is_empty() {
        return;
    }
    c.softmax();

    let cut = c
        .data
        .iter()
        .position(|d| -d.prob.max(f32::MIN_POSITIVE).log2() > *mu)
        .unwrap_or(c.data.len())
        .max(1);
    c.data.truncate(cut);

    dist(c, rng);

    if let Some(sel) = c.selected {
        let observed = -c.data[sel].prob.max(f32::MIN_POSITIVE).log2();
        *mu -= eta * (observed - tau);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn candidates(logits: &[f32]) -> Candidates {
        Candidates::from_logits(logits)
    }

    #[test]
    fn top_k_keeps_largest() {
        let mut c = candidates(&[0.1, 3.0, 1.0, 2.0]);
        top_k(&mut c, 2);
        let ids: Vec<_> = c.data.iter().map(|d| d.token).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn top_k_nonpositive_keeps_all() {
        let mut c = candidates(&[0.1, 3.0, 1.0]);
        top_k(&mut c, 0);
        assert_eq!(c.data.len(), 3);
    }

    #[test]
    fn top_p_respects_mass_and_min_keep() {
        let mut c = candidates(&[10.0, 1.0, 0.5, 0.1]);
        top_p(&mut c, 0.5, 0);
        assert_eq!(c.data.len(), 1);
        assert_eq!(c.data[0].token, 0);

        let mut c = candidates(&[10.0, 1.0, 0.5, 0.1]);
        top_p(&mut c, 0.5, 3);
        assert_eq!(c.data.len(), 3);
    }

    #[test]
    fn min_p_filters_relative_to_max() {
        let mut c = candidates(&[5.0, 4.9, 0.0]);
        min_p(&mut c, 0.5, 0);
        let ids: Vec<_> = c.data.iter().map(|d| d.token).collect();
        assert_eq!(ids, vec![0, 1]);
    }

    #[test]
    fn typical_keeps_probability_mass() {
        let mut c = candidates(&[2.0, 2.0, 2.0, -10.0]);
        typical_p(&mut c, 0.9, 0);
        assert!(c.data.len() >= 3 || {
            let mass: f32 = c.data.iter().map(|d| d.prob).sum();
            mass >= 0.9
        });
        assert!(c.data.iter().all(|d| d.token != 3));
    }

    #[test]
    fn zero_temperature_is_greedy() {
        let mut c = candidates(&[0.5, 7.0, 3.0]);
        temperature(&mut c, 0.0);
        assert_eq!(c.data.len(), 1);
        assert_eq!(c.data[0].token, 1);
    }

    #[test]
    fn temperature_scales_logits() {
        let mut c = candidates(&[1.0, 2.0]);
        temperature(&mut c, 0.5);
        assert_eq!(c.data[0].logit, 2.0);
        assert_eq!(c.data[1].logit, 4.0);
    }

    #[test]
    fn dynamic_temperature_falls_back_to_plain() {
        let mut a = candidates(&[1.0, 2.0, 3.0]);
        let mut b = candidates(&[1.0, 2.0, 3.0]);
        temperature(&mut a, 0.8);
        temperature_ext(&mut b, 0.8, 0.0, 1.0);
        let la: Vec<_> = a.data.iter().map(|d| (d.token, d.logit)).collect();
        let lb: Vec<_> = b.data.iter().map(|d| (d.token, d.logit)).collect();
        assert_eq!(la, lb);
    }

    #[test]
    fn xtc_drops_leading_choices() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut c = candidates(&[4.0, 3.9, -5.0, -6.0]);
        // probability 1.0 always triggers
        xtc(&mut c, 1.0, 0.2, 0, &mut rng);
        // the two high candidates both clear the threshold; only the weaker
        // of them survives
        assert_eq!(c.data[0].token, 1);
    }

    #[test]
    fn xtc_disabled_by_threshold() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut c = candidates(&[4.0, 3.9]);
        xtc(&mut c, 1.0, 0.9, 0, &mut rng);
        assert_eq!(c.data.len(), 2);
    }

    #[test]
    fn penalties_discourage_recent_tokens() {
        let mut c = candidates(&[2.0, 2.0]);
        penalties(&mut c, &[0, 0, 0], 1.5, 0.1, 0.2);
        let t0 = c.data.iter().find(|d| d.token == 0).unwrap();
        let t1 = c.data.iter().find(|d| d.token == 1).unwrap();
        assert!(t0.logit < t1.logit);
        assert_eq!(t1.logit, 2.0);
    }

    #[test]
    fn logit_bias_applies() {
        let mut c = candidates(&[0.0, 0.0]);
        logit_bias(&mut c, &[(1, 5.0)]);
        assert_eq!(c.data[1].logit, 5.0);
    }

    #[test]
    fn dist_is_seed_deterministic() {
        let mut r1 = StdRng::seed_from_u64(7);
        let mut r2 = StdRng::seed_from_u64(7);
        let mut a = candidates(&[1.0, 2.0, 3.0, 0.5]);
        let mut b = candidates(&[1.0, 2.0, 3.0, 0.5]);
        dist(&mut a, &mut r1);
        dist(&mut b, &mut r2);
        assert_eq!(a.selected, b.selected);
    }

    #[test]
    fn dist_prefers_dominant_token() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut c = candidates(&[50.0, 0.0, 0.0]);
        dist(&mut c, &mut rng);
        assert_eq!(c.data[c.selected.unwrap()].token, 0);
    }

    #[test]
    fn mirostat_v2_tracks_mu() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut mu = 10.0f32;
        let mut c = candidates(&[5.0, 1.0, 0.5, 0.1]);
        mirostat_v2(&mut c, 5.0, 0.1, &mut mu, &mut rng);
        assert!(c.selected.is_some());
        assert_ne!(mu, 10.0);
    }

    #[test]
    fn mirostat_v1_selects() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut mu = 10.0f32;
        let mut c = candidates(&[5.0, 4.0, 3.0, 2.0, 1.0, 0.0]);
        mirostat_v1(&mut c, 6, 5.0, 0.1, 100, &mut mu, &mut rng);
        assert!(c.selected.is_some());
    }
}

/*
 * This source code is licensed under the Business Source License 1.1.
 */

//! Rolling population baseline for fingerprint anomaly scoring.
//!
//! Tracks mean and variance of the four [`FingerprintScalars`] across every
//! fingerprinted actor, one batch per closed window. The baseline starts from
//! an organic prior so the very first window already has something to deviate
//! from, and resists being dragged by a single large coordinated batch:
//!
//! - a batch never carries more weight than the baseline it merges into;
//! - older evidence decays by `retention` per window but the total weight never
//!   drops below the prior weight.

use crate::fingerprint::FingerprintScalars;

/// Floor on the standard deviation used for z-scores.
const MIN_STD: f64 = 1e-3;

/// Organic prior for one feature.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FeaturePrior {
    /// Prior mean.
    pub mean: f64,
    /// Prior standard deviation.
    pub std: f64,
}

/// Starting point of the population baseline.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BaselinePrior {
    /// `ln(1 + mean interval s)`. Default mean 7.5 (~30 min), std 1.5.
    pub log_interval: FeaturePrior,
    /// Burstiness. Default mean 0.0, std 0.35.
    pub burstiness: FeaturePrior,
    /// `ln(1 + posts per window)`. Default mean 0.9, std 0.6.
    pub log_posts: FeaturePrior,
    /// `ln(1 + account age days)`. Default mean 6.0 (~400 days), std 1.5.
    pub log_account_age: FeaturePrior,
    /// Pseudo-observations the prior is worth. Default 50.
    pub prior_weight: f64,
    /// Per-window decay of accumulated weight. Default 0.9.
    pub retention: f64,
}

impl Default for BaselinePrior {
    fn default() -> Self {
        Self {
            log_interval: FeaturePrior { mean: 7.5, std: 1.5 },
            burstiness: FeaturePrior { mean: 0.0, std: 0.35 },
            log_posts: FeaturePrior { mean: 0.9, std: 0.6 },
            log_account_age: FeaturePrior { mean: 6.0, std: 1.5 },
            prior_weight: 50.0,
            retention: 0.9,
        }
    }
}

/// Weighted running mean/variance of one feature.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FeatureStats {
    /// Current mean.
    pub mean: f64,
    /// Current variance.
    pub var: f64,
    /// Effective sample weight.
    pub weight: f64,
}

impl FeatureStats {
    fn from_prior(p: FeaturePrior, weight: f64) -> Self {
        Self { mean: p.mean, var: p.std * p.std, weight }
    }

    /// Standard score of `x`.
    pub fn z(&self, x: f64) -> f64 {
        (x - self.mean) / self.var.sqrt().max(MIN_STD)
    }

    /// Chan et al. parallel merge with a weighted batch.
    fn merge(&mut self, batch_mean: f64, batch_var: f64, batch_weight: f64) {
        let total = self.weight + batch_weight;
        if batch_weight <= 0.0 || total <= 0.0 {
            return;
        }
        let delta = batch_mean - self.mean;
        let mean = self.mean + delta * batch_weight / total;
        let m2 = self.var * self.weight + batch_var * batch_weight + delta * delta * self.weight * batch_weight / total;
        self.mean = mean;
        self.var = m2 / total;
        self.weight = total;
    }
}

/// Population statistics over all fingerprint scalars.
#[derive(Clone, Debug)]
pub struct PopulationBaseline {
    prior: BaselinePrior,
    log_interval: FeatureStats,
    burstiness: FeatureStats,
    log_posts: FeatureStats,
    log_account_age: FeatureStats,
    windows_seen: u64,
}

impl Default for PopulationBaseline {
    fn default() -> Self {
        Self::new(BaselinePrior::default())
    }
}

impl PopulationBaseline {
    /// Baseline seeded from `prior`.
    pub fn new(prior: BaselinePrior) -> Self {
        let w = prior.prior_weight.max(1.0);
        Self {
            log_interval: FeatureStats::from_prior(prior.log_interval, w),
            burstiness: FeatureStats::from_prior(prior.burstiness, w),
            log_posts: FeatureStats::from_prior(prior.log_posts, w),
            log_account_age: FeatureStats::from_prior(prior.log_account_age, w),
            windows_seen: 0,
            prior,
        }
    }

    /// Windows folded in so far.
    pub fn windows_seen(&self) -> u64 {
        self.windows_seen
    }

    /// Current statistics, in scalar order: interval, burstiness, posts, age.
    pub fn stats(&self) -> [FeatureStats; 4] {
        [self.log_interval, self.burstiness, self.log_posts, self.log_account_age]
    }

    /// Anomaly magnitude in [0, 1]: mean of `min(|z|, cap) / cap` over the
    /// features the fingerprint actually has.
    pub fn anomaly(&self, s: &FingerprintScalars, z_cap: f64) -> f32 {
        let cap = z_cap.max(f64::EPSILON);
        let pairs = [
            (s.log_interval, &self.log_interval),
            (s.burstiness, &self.burstiness),
            (Some(s.log_posts), &self.log_posts),
            (s.log_account_age, &self.log_account_age),
        ];
        let (sum, n) = pairs
            .iter()
            .filter_map(|(x, st)| x.filter(|v| v.is_finite()).map(|v| st.z(v).abs().min(cap) / cap))
            .fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
        if n == 0 {
            0.0
        } else {
            (sum / n as f64) as f32
        }
    }

    /// Fold one window's scalars into the baseline.
    pub fn update(&mut self, batch: &[FingerprintScalars]) {
        if batch.is_empty() {
            return;
        }
        let floor = self.prior.prior_weight.max(1.0);
        let retention = self.prior.retention.clamp(0.0, 1.0);
        let fold = |stats: &mut FeatureStats, values: Vec<f64>| {
            stats.weight = (stats.weight * retention).max(floor);
            if values.is_empty() {
                return;
            }
            let n = values.len() as f64;
            let mean = values.iter().sum::<f64>() / n;
            let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
            let capped = n.min(stats.weight);
            stats.merge(mean, var, capped);
        };

        let finite = |v: &f64| v.is_finite();
        fold(&mut self.log_interval, batch.iter().filter_map(|s| s.log_interval).filter(finite).collect());
        fold(&mut self.burstiness, batch.iter().filter_map(|s| s.burstiness).filter(finite).collect());
        fold(&mut self.log_posts, batch.iter().map(|s| s.log_posts).filter(finite).collect());
        fold(&mut self.log_account_age, batch.iter().filter_map(|s| s.log_account_age).filter(finite).collect());
        self.windows_seen += 1;
    }
}

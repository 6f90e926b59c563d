//! In-process weighted Gaussian kernel density estimator.
//!
//! Product kernel with one bandwidth per dimension. Bandwidths follow Scott's or
//! Silverman's rule computed over the *effective* sample size of the weights,
//! `n_eff = (sum w)^2 / sum w^2`, and never drop below `min_bandwidth_ns`.

use log::{debug, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

use crate::error::{AggError, Result};
use crate::grid;
use crate::model::DensitySummary;
use crate::traits::DensityBackend;

/// Bandwidth selection rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BandwidthRule {
    Scott,
    Silverman,
}

impl BandwidthRule {
    /// Multiplier applied to each dimension's standard deviation.
    pub fn factor(&self, n_eff: f64, dims: usize) -> f64 {
        let d = dims as f64;
        match self {
            BandwidthRule::Scott => n_eff.powf(-1.0 / (d + 4.0)),
            BandwidthRule::Silverman => (n_eff * (d + 2.0) / 4.0).powf(-1.0 / (d + 4.0)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KdeConfig {
    pub bandwidth: BandwidthRule,
    pub min_bandwidth_ns: f64,
    /// Upper bound on lattice size for divergence integration
    pub max_grid_points: usize,
    /// Fixed seed for reproducible resampling; OS entropy if unset
    pub seed: Option<u64>,
}

impl Default for KdeConfig {
    fn default() -> Self {
        KdeConfig {
            bandwidth: BandwidthRule::Scott,
            min_bandwidth_ns: 1.0,
            max_grid_points: 4096,
            seed: None,
        }
    }
}

#[derive(Debug, Clone)]
struct Fit {
    points: Vec<Vec<f64>>,
    /// Normalized to sum to 1
    weights: Vec<f64>,
    /// Running sum of `weights`, for weighted draws
    cumulative: Vec<f64>,
    bandwidth: Vec<f64>,
    summary: DensitySummary,
}

pub struct WeightedKde {
    config: KdeConfig,
    fit: Option<Fit>,
    rng: StdRng,
}

impl WeightedKde {
    pub fn new(config: KdeConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        WeightedKde { config, fit: None, rng }
    }

    /// Per-dimension kernel bandwidth of the current fit.
    pub fn bandwidth(&self) -> Option<&[f64]> {
        self.fit.as_ref().map(|f| f.bandwidth.as_slice())
    }

    fn build(config: &KdeConfig, points: &[Vec<f64>], weights: &[u64]) -> Result<Fit> {
        if points.is_empty() {
            return Err(AggError::EmptyBatch);
        }
        if weights.len() != points.len() {
            return Err(AggError::InvalidArgument(format!(
                "{} weights supplied for {} points",
                weights.len(),
                points.len()
            )));
        }
        let dims = points[0].len();
        if dims == 0 {
            return Err(AggError::InvalidArgument("points must have at least 1 dimension".into()));
        }
        if let Some(bad) = points.iter().find(|p| p.len() != dims) {
            return Err(AggError::DimensionMismatch { expected: dims, actual: bad.len() });
        }

        let total: u64 = weights.iter().fold(0u64, |acc, w| acc.saturating_add(*w));
        let norm: Vec<f64> = if total == 0 {
            vec![1.0 / points.len() as f64; points.len()]
        } else {
            weights.iter().map(|w| *w as f64 / total as f64).collect()
        };

        let sum_sq: f64 = norm.iter().map(|w| w * w).sum();
        let n_eff = 1.0 / sum_sq;

        let mut mean = vec![0.0; dims];
        for (p, w) in points.iter().zip(&norm) {
            for d in 0..dims {
                mean[d] += w * p[d];
            }
        }
        let mut variance = vec![0.0; dims];
        for (p, w) in points.iter().zip(&norm) {
            for d in 0..dims {
                variance[d] += w * (p[d] - mean[d]).powi(2);
            }
        }
        // unbiased weighted estimator; a single effective point has no spread
        let correction = 1.0 - sum_sq;
        for v in variance.iter_mut() {
            *v = if correction > f64::EPSILON { *v / correction } else { 0.0 };
        }

        let factor = config.bandwidth.factor(n_eff, dims);
        let bandwidth: Vec<f64> = variance
            .iter()
            .map(|v| (v.sqrt() * factor).max(config.min_bandwidth_ns))
            .collect();

        let mut cumulative = Vec::with_capacity(norm.len());
        let mut acc = 0.0;
        for w in &norm {
            acc += w;
            cumulative.push(acc);
        }

        Ok(Fit {
            points: points.to_vec(),
            weights: norm,
            cumulative,
            bandwidth,
            summary: DensitySummary { mean, variance },
        })
    }

    fn density_at(fit: &Fit, x: &[f64]) -> f64 {
        let norm: f64 = fit.bandwidth.iter().map(|h| 1.0 / (h * (2.0 * PI).sqrt())).product();
        let mut total = 0.0;
        for (p, w) in fit.points.iter().zip(&fit.weights) {
            let mut exponent = 0.0;
            for d in 0..x.len() {
                let z = (x[d] - p[d]) / fit.bandwidth[d];
                exponent += z * z;
            }
            total += w * (-0.5 * exponent).exp();
        }
        total * norm
    }

    fn standard_normal(rng: &mut StdRng) -> f64 {
        // Box-Muller; u1 in (0, 1]
        let u1 = 1.0 - rng.random::<f64>();
        let u2 = rng.random::<f64>();
        (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
    }

    /// Box covering both fits out to four kernel-widened standard deviations.
    fn integration_bounds(a: &Fit, b: &Fit) -> (Vec<f64>, Vec<f64>) {
        let dims = a.bandwidth.len();
        let mut lower = vec![f64::INFINITY; dims];
        let mut upper = vec![f64::NEG_INFINITY; dims];
        for fit in [a, b] {
            for d in 0..dims {
                let spread = 4.0 * (fit.summary.variance[d] + fit.bandwidth[d].powi(2)).sqrt();
                lower[d] = lower[d].min(fit.summary.mean[d] - spread);
                upper[d] = upper[d].max(fit.summary.mean[d] + spread);
            }
        }
        (lower, upper)
    }

    fn normalized(masses: Vec<f64>) -> Option<Vec<f64>> {
        let total: f64 = masses.iter().sum();
        if total > 0.0 && total.is_finite() {
            Some(masses.into_iter().map(|m| m / total).collect())
        } else {
            None
        }
    }

    fn jensen_shannon(p: &[f64], q: &[f64]) -> f64 {
        let mut js = 0.0;
        for (pi, qi) in p.iter().zip(q) {
            let mi = 0.5 * (pi + qi);
            if *pi > 0.0 {
                js += 0.5 * pi * (pi / mi).ln();
            }
            if *qi > 0.0 {
                js += 0.5 * qi * (qi / mi).ln();
            }
        }
        js.max(0.0)
    }

    fn divergence_from(&self, fit: &Fit, reference: &[Vec<f64>], weights: &[u64], base_unit: &[f64]) -> Result<f64> {
        let other = Self::build(&self.config, reference, weights)?;
        if other.bandwidth.len() != fit.bandwidth.len() {
            return Err(AggError::DimensionMismatch {
                expected: fit.bandwidth.len(),
                actual: other.bandwidth.len(),
            });
        }
        let (lower, upper) = Self::integration_bounds(fit, &other);
        let lattice = grid::lattice(&lower, &upper, base_unit, self.config.max_grid_points)?;
        let volume = lattice.cell_volume();

        let p = Self::normalized(lattice.points.iter().map(|x| Self::density_at(fit, x) * volume).collect());
        let q = Self::normalized(lattice.points.iter().map(|x| Self::density_at(&other, x) * volume).collect());
        match (p, q) {
            (Some(p), Some(q)) => Ok(Self::jensen_shannon(&p, &q)),
            _ => Err(AggError::Backend("density vanished over the integration lattice".into())),
        }
    }
}

impl Default for WeightedKde {
    fn default() -> Self {
        Self::new(KdeConfig::default())
    }
}

impl DensityBackend for WeightedKde {
    fn fit(&mut self, points: &[Vec<f64>], weights: &[u64]) -> Result<()> {
        let fit = Self::build(&self.config, points, weights)?;
        debug!(
            "[KDE] Fitted {} points: mean={:?} bandwidth={:?}",
            fit.points.len(),
            fit.summary.mean,
            fit.bandwidth
        );
        self.fit = Some(fit);
        Ok(())
    }

    fn is_fitted(&self) -> bool {
        self.fit.is_some()
    }

    fn evaluate(&self, points: &[Vec<f64>]) -> Result<Vec<f64>> {
        let fit = self.fit.as_ref().ok_or(AggError::ModelNotReady)?;
        let dims = fit.bandwidth.len();
        if let Some(bad) = points.iter().find(|p| p.len() != dims) {
            return Err(AggError::DimensionMismatch { expected: dims, actual: bad.len() });
        }
        Ok(points.iter().map(|x| Self::density_at(fit, x)).collect())
    }

    fn resample(&mut self, count: usize) -> Result<Vec<Vec<f64>>> {
        let fit = self.fit.as_ref().ok_or(AggError::ModelNotReady)?;
        let last = fit.points.len() - 1;
        let mut rows = Vec::with_capacity(count);
        for _ in 0..count {
            let u = self.rng.random::<f64>();
            let i = fit.cumulative.partition_point(|c| *c <= u).min(last);
            let row = fit.points[i]
                .iter()
                .zip(&fit.bandwidth)
                .map(|(x, h)| x + h * Self::standard_normal(&mut self.rng))
                .collect();
            rows.push(row);
        }
        Ok(rows)
    }

    fn summary(&self) -> Option<DensitySummary> {
        self.fit.as_ref().map(|f| f.summary.clone())
    }

    fn divergence(&self, reference: &[Vec<f64>], weights: &[u64], base_unit: &[f64]) -> Option<Result<f64>> {
        let fit = self.fit.as_ref()?;
        let result = self.divergence_from(fit, reference, weights, base_unit);
        if let Err(e) = &result {
            warn!("[KDE] Divergence computation failed: {}", e);
        }
        Some(result)
    }

    fn shutdown(&mut self) -> Result<()> {
        self.fit = None;
        Ok(())
    }
}

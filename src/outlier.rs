//! Density-based outlier classification against a reference [`ErrorModel`].

use log::debug;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{AggError, Result};
use crate::grid;
use crate::model::ErrorModel;
use crate::sample::TimeErrorSample;
use crate::traits::{DensityBackend, OutlierDetector};

/// How the likelihood of a sample is measured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LikelihoodPolicy {
    /// Density at the sample's coordinates.
    PointEstimate,
    /// Probability mass within one standard deviation of the sample, integrated over a
    /// lattice stepping by `base_unit` per dimension.
    Neighborhood { base_unit: Vec<f64> },
}

impl Default for LikelihoodPolicy {
    fn default() -> Self {
        LikelihoodPolicy::PointEstimate
    }
}

pub struct DensityOutlierDetector<B: DensityBackend> {
    model: Arc<ErrorModel<B>>,
    threshold: f64,
    policy: LikelihoodPolicy,
    max_grid_points: usize,
}

impl<B: DensityBackend> DensityOutlierDetector<B> {
    pub const DEFAULT_MAX_GRID_POINTS: usize = 4096;

    /// Samples whose likelihood under `model` falls below `threshold` are outliers.
    pub fn new(model: Arc<ErrorModel<B>>, threshold: f64) -> Result<Self> {
        if !threshold.is_finite() || threshold < 0.0 {
            return Err(AggError::InvalidArgument(format!(
                "likelihood threshold must be a non-negative number, got {}",
                threshold
            )));
        }
        Ok(DensityOutlierDetector {
            model,
            threshold,
            policy: LikelihoodPolicy::PointEstimate,
            max_grid_points: Self::DEFAULT_MAX_GRID_POINTS,
        })
    }

    pub fn with_policy(mut self, policy: LikelihoodPolicy) -> Result<Self> {
        if let LikelihoodPolicy::Neighborhood { base_unit } = &policy {
            if base_unit.len() != self.model.dimensions() {
                return Err(AggError::DimensionMismatch {
                    expected: self.model.dimensions(),
                    actual: base_unit.len(),
                });
            }
            if base_unit.iter().any(|b| !b.is_finite() || *b <= 0.0) {
                return Err(AggError::InvalidArgument(format!("base unit must be positive, got {:?}", base_unit)));
            }
        }
        self.policy = policy;
        Ok(self)
    }

    pub fn with_max_grid_points(mut self, max_grid_points: usize) -> Self {
        self.max_grid_points = max_grid_points.max(1);
        self
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn policy(&self) -> &LikelihoodPolicy {
        &self.policy
    }

    /// Likelihood of `sample` under the configured policy.
    pub fn likelihood(&self, sample: &TimeErrorSample) -> Result<f64> {
        match &self.policy {
            LikelihoodPolicy::PointEstimate => self.model.estimate(sample),
            LikelihoodPolicy::Neighborhood { base_unit } => {
                let sd = self.model.standard_deviation().ok_or(AggError::ModelNotReady)?;
                let lower: Vec<f64> = sample.values().iter().zip(&sd).map(|(v, s)| v - s).collect();
                let upper: Vec<f64> = sample.values().iter().zip(&sd).map(|(v, s)| v + s).collect();
                let lattice = grid::lattice(&lower, &upper, base_unit, self.max_grid_points)?;
                let densities = self.model.estimate_points(&lattice.points)?;
                Ok(densities.iter().sum::<f64>() * lattice.cell_volume())
            }
        }
    }
}

impl<B: DensityBackend> OutlierDetector for DensityOutlierDetector<B> {
    fn dimensions(&self) -> usize {
        self.model.dimensions()
    }

    fn is_outlier(&self, sample: &TimeErrorSample) -> Result<bool> {
        if sample.dimensions() != self.dimensions() {
            return Err(AggError::DimensionMismatch {
                expected: self.dimensions(),
                actual: sample.dimensions(),
            });
        }
        let likelihood = self.likelihood(sample)?;
        let outlier = likelihood < self.threshold;
        if outlier {
            debug!("[Outlier] {} likelihood {:.3e} below {:.3e}", sample, likelihood, self.threshold);
        }
        Ok(outlier)
    }
}

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::AggError;
use crate::kde::KdeConfig;
use crate::model::ResamplePolicy;
use crate::outlier::LikelihoodPolicy;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AggConfig {
    pub model: ModelConfig,
    pub kde: KdeConfig,
    pub outlier: OutlierConfig,
    pub aggregator: AggregatorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub window_size: usize,      // per monitored port
    pub dimensions: usize,
    pub resample_policy: ResamplePolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutlierConfig {
    pub likelihood_threshold: f64,
    pub policy: LikelihoodPolicy,
    pub max_grid_points: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    pub monitoring_ports: usize,
    pub network_window_size: usize, // samples per upstream summary
    pub max_frame_size: usize,      // bytes per AMTLV data field
}

impl Default for ModelConfig {
    fn default() -> Self {
        ModelConfig {
            window_size: 200,
            dimensions: 1,
            resample_policy: ResamplePolicy::WindowTurnover,
        }
    }
}

impl Default for OutlierConfig {
    fn default() -> Self {
        OutlierConfig {
            likelihood_threshold: 1e-5,
            policy: LikelihoodPolicy::PointEstimate,
            max_grid_points: 4096,
        }
    }
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        AggregatorConfig {
            monitoring_ports: 1,
            network_window_size: 50,
            max_frame_size: 1024,
        }
    }
}

impl AggConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: AggConfig = serde_json::from_str(json).context("Failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration from {}", path.display()))?;
        Self::from_json_str(&json).with_context(|| format!("Invalid configuration in {}", path.display()))
    }

    pub fn validate(&self) -> std::result::Result<(), AggError> {
        let invalid = |msg: &str| Err(AggError::InvalidArgument(msg.to_string()));
        let dims = self.model.dimensions;

        if self.model.window_size == 0 {
            return invalid("model.window_size must be greater than 0");
        }
        if dims == 0 {
            return invalid("model.dimensions must be greater than 0");
        }
        if self.aggregator.monitoring_ports == 0 {
            return invalid("aggregator.monitoring_ports must be greater than 0");
        }
        if self.aggregator.network_window_size == 0 {
            return invalid("aggregator.network_window_size must be greater than 0");
        }
        if !self.outlier.likelihood_threshold.is_finite() || self.outlier.likelihood_threshold < 0.0 {
            return invalid("outlier.likelihood_threshold must be a non-negative number");
        }
        if !self.kde.min_bandwidth_ns.is_finite() || self.kde.min_bandwidth_ns <= 0.0 {
            return invalid("kde.min_bandwidth_ns must be positive");
        }
        if self.outlier.max_grid_points == 0 || self.kde.max_grid_points == 0 {
            return invalid("max_grid_points must be greater than 0");
        }

        let base_units = [
            match &self.model.resample_policy {
                ResamplePolicy::Divergence { base_unit, .. } => Some(base_unit),
                ResamplePolicy::WindowTurnover => None,
            },
            match &self.outlier.policy {
                LikelihoodPolicy::Neighborhood { base_unit } => Some(base_unit),
                LikelihoodPolicy::PointEstimate => None,
            },
        ];
        for base_unit in base_units.into_iter().flatten() {
            if base_unit.len() != dims {
                return Err(AggError::DimensionMismatch { expected: dims, actual: base_unit.len() });
            }
            if base_unit.iter().any(|b| !b.is_finite() || *b <= 0.0) {
                return invalid("base_unit entries must be positive");
            }
        }
        if let ResamplePolicy::Divergence { threshold, .. } = &self.model.resample_policy {
            if !threshold.is_finite() || *threshold < 0.0 {
                return invalid("model.resample_policy.threshold must be a non-negative number");
            }
        }
        Ok(())
    }
}

use crate::error::Result;
use crate::model::DensitySummary;
use crate::sample::{AmtlvData, ClockIdentity, PtpTimestamp, SyncData, TimeErrorSample};

/// Density-estimation strategy behind an [`ErrorModel`](crate::model::ErrorModel).
///
/// Every call is blocking from the model's point of view and runs inside the model's
/// window lock. Backends that reach out of process must bound their own calls with a
/// timeout and report it as [`AggError::Backend`](crate::error::AggError::Backend).
#[cfg_attr(test, mockall::automock)]
pub trait DensityBackend: Send {
    /// Fit a density over `points` (rows = samples), each row weighted by device count.
    fn fit(&mut self, points: &[Vec<f64>], weights: &[u64]) -> Result<()>;

    fn is_fitted(&self) -> bool;

    /// Likelihood of each point, order-preserving.
    fn evaluate(&self, points: &[Vec<f64>]) -> Result<Vec<f64>>;

    /// Draw `count` representative rows from the fitted density.
    fn resample(&mut self, count: usize) -> Result<Vec<Vec<f64>>>;

    /// Weighted mean/variance of the window behind the last fit.
    fn summary(&self) -> Option<DensitySummary>;

    /// Divergence between the fitted density and one fitted over `reference`.
    /// `None` means the backend has no notion of distribution distance.
    fn divergence(&self, reference: &[Vec<f64>], weights: &[u64], base_unit: &[f64]) -> Option<Result<f64>>;

    /// Release any resources held by the backend.
    fn shutdown(&mut self) -> Result<()>;
}

/// Sample-type specific half of a [`SampleProcessor`](crate::processor::SampleProcessor):
/// the time-error metric and its AMTLV wire codec.
pub trait SampleCodec: Send + Sync {
    fn name(&self) -> &str;

    /// Dimensionality of the samples this codec produces and parses.
    fn dimensions(&self) -> usize;

    fn compute_time_error(
        &self,
        gm_sync: &SyncData,
        upstream_path_delay: f64,
        rev_sync: &SyncData,
        downstream_path_delay: f64,
    ) -> TimeErrorSample;

    fn parse_amtlv(&self, sender: ClockIdentity, timestamp: Option<PtpTimestamp>, data: &[u8]) -> Result<AmtlvData>;

    fn package_amtlv(&self, network_weight: u64, outliers: Vec<TimeErrorSample>, resampled: Vec<Vec<f64>>) -> AmtlvData;

    fn amtlv_to_bytes(&self, amtlv: &AmtlvData, max_frame_size: usize) -> Result<Vec<Vec<u8>>>;
}

/// Classifies samples as anomalous with respect to some reference behavior.
#[cfg_attr(test, mockall::automock)]
pub trait OutlierDetector: Send + Sync {
    fn dimensions(&self) -> usize;

    fn is_outlier(&self, sample: &TimeErrorSample) -> Result<bool>;
}

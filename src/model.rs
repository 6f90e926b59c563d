//! Sliding-window model of a time-error distribution.
//!
//! The model keeps the most recent `sample_size` samples (newest first) and refits its
//! density backend every time the window is full. Window mutation and the refit happen
//! under one lock, so readers never see a density that does not match the window exactly.
//!
//! Resampling is rate limited: by default a new summary is only recommended once the
//! window has turned over completely since the last resample.

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::error::{AggError, Result};
use crate::sample::{AmtlvData, TimeErrorSample};
use crate::traits::DensityBackend;

/// Weighted per-dimension moments of the window behind the last fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DensitySummary {
    pub mean: Vec<f64>,
    pub variance: Vec<f64>,
}

impl DensitySummary {
    pub fn standard_deviation(&self) -> Vec<f64> {
        self.variance.iter().map(|v| v.sqrt()).collect()
    }
}

/// When the model recommends producing a fresh resampled summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResamplePolicy {
    /// Once a full window of new samples has arrived since the last resample.
    WindowTurnover,
    /// Window turnover, and the fitted density has drifted from the one last transmitted
    /// by more than `threshold` (Jensen-Shannon, nats). `base_unit` is the integration step.
    Divergence { threshold: f64, base_unit: Vec<f64> },
}

impl Default for ResamplePolicy {
    fn default() -> Self {
        ResamplePolicy::WindowTurnover
    }
}

struct WindowState<B> {
    /// Newest sample at the front
    window: VecDeque<TimeErrorSample>,
    backend: B,
}

pub struct ErrorModel<B: DensityBackend> {
    state: Mutex<WindowState<B>>,
    sample_size: AtomicUsize,
    dimensions: usize,
    policy: ResamplePolicy,

    samples_since_resample: AtomicUsize,
    resample_due: AtomicBool,
    /// Edge-triggered: set the first time the window fills, never cleared
    window_filled: AtomicBool,
}

impl<B: DensityBackend> ErrorModel<B> {
    pub fn new(sample_size: usize, dimensions: usize, backend: B) -> Result<Self> {
        if sample_size == 0 {
            return Err(AggError::InvalidArgument("sample window must be greater than 0".into()));
        }
        if dimensions == 0 {
            return Err(AggError::InvalidArgument("samples must have at least 1 dimension".into()));
        }
        Ok(ErrorModel {
            state: Mutex::new(WindowState {
                window: VecDeque::with_capacity(sample_size),
                backend,
            }),
            sample_size: AtomicUsize::new(sample_size),
            dimensions,
            policy: ResamplePolicy::WindowTurnover,
            samples_since_resample: AtomicUsize::new(0),
            resample_due: AtomicBool::new(false),
            window_filled: AtomicBool::new(false),
        })
    }

    pub fn with_policy(mut self, policy: ResamplePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Empty model with the same capacity, dimensionality and policy around a new backend.
    pub fn duplicate(&self, backend: B) -> Self {
        ErrorModel {
            state: Mutex::new(WindowState {
                window: VecDeque::with_capacity(self.local_window_size()),
                backend,
            }),
            sample_size: AtomicUsize::new(self.local_window_size()),
            dimensions: self.dimensions,
            policy: self.policy.clone(),
            samples_since_resample: AtomicUsize::new(0),
            resample_due: AtomicBool::new(false),
            window_filled: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, WindowState<B>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ========================================================================
    // WINDOW
    // ========================================================================

    pub fn add_sample(&self, sample: TimeErrorSample) -> Result<()> {
        self.add_samples(vec![sample])
    }

    /// Insert a batch at the head of the window, evicting the oldest samples past capacity.
    ///
    /// The whole batch is validated first; on error nothing is inserted. The density is
    /// refit once, after the whole batch, if the window is full.
    pub fn add_samples(&self, samples: Vec<TimeErrorSample>) -> Result<()> {
        if samples.is_empty() {
            return Err(AggError::EmptyBatch);
        }
        if let Some(bad) = samples.iter().find(|s| s.dimensions() != self.dimensions) {
            return Err(AggError::DimensionMismatch {
                expected: self.dimensions,
                actual: bad.dimensions(),
            });
        }

        let mut state = self.lock();
        let capacity = self.local_window_size();
        let added = samples.len();

        for sample in samples {
            state.window.push_front(sample);
        }
        let since = self.samples_since_resample.fetch_add(added, Ordering::SeqCst) + added;

        while state.window.len() > capacity {
            state.window.pop_back();
        }

        if state.window.len() == capacity {
            if !self.window_filled.swap(true, Ordering::SeqCst) {
                info!("[Model] Reached moving sample window size ({}). Model estimation has started.", capacity);
            }
            self.resample_due.store(since >= capacity, Ordering::SeqCst);
            Self::compute_metrics(&mut state)?;
        }
        Ok(())
    }

    /// Refit the backend over the current window.
    fn compute_metrics(state: &mut WindowState<B>) -> Result<()> {
        let points: Vec<Vec<f64>> = state.window.iter().map(|s| s.values().to_vec()).collect();
        let weights: Vec<u64> = state.window.iter().map(|s| s.weight()).collect();
        state.backend.fit(&points, &weights).map_err(|e| {
            error!("[Model] Failed to fit density over {} samples: {}", points.len(), e);
            e
        })
    }

    /// Capacity of the moving window.
    pub fn local_window_size(&self) -> usize {
        self.sample_size.load(Ordering::SeqCst)
    }

    /// Change the window capacity. Non-positive values are logged and ignored.
    /// A smaller capacity takes effect on the next insertion.
    pub fn modify_window_size(&self, new_size: i64) {
        if new_size > 0 {
            self.sample_size.store(new_size as usize, Ordering::SeqCst);
            debug!("[Model] Window size set to {}", new_size);
        } else {
            warn!("[Model] Attempted to set a window size of {}, which is not greater than 0.", new_size);
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn policy(&self) -> &ResamplePolicy {
        &self.policy
    }

    pub fn window_len(&self) -> usize {
        self.lock().window.len()
    }

    pub fn is_window_full(&self) -> bool {
        self.window_len() >= self.local_window_size()
    }

    /// True once the window has filled at least once.
    pub fn window_filled(&self) -> bool {
        self.window_filled.load(Ordering::SeqCst)
    }

    /// Copy of the window, newest first.
    pub fn samples(&self) -> Vec<TimeErrorSample> {
        self.lock().window.iter().cloned().collect()
    }

    /// Empty the window. The last fitted density stays available for estimates.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.window.clear();
        self.samples_since_resample.store(0, Ordering::SeqCst);
        self.resample_due.store(false, Ordering::SeqCst);
    }

    // ========================================================================
    // RESAMPLING
    // ========================================================================

    /// Draw `new_size` rows representative of the fitted distribution.
    pub fn resample(&self, new_size: usize) -> Result<Vec<Vec<f64>>> {
        if new_size < 1 {
            return Err(AggError::InvalidArgument(
                "size of re-sampled data set must be greater than 0".into(),
            ));
        }
        let mut state = self.lock();
        self.resample_due.store(false, Ordering::SeqCst);
        self.samples_since_resample.store(0, Ordering::SeqCst);

        if !state.backend.is_fitted() {
            return Err(AggError::ModelNotReady);
        }
        let rows = state.backend.resample(new_size)?;
        if rows.iter().any(|r| r.len() != self.dimensions) {
            return Err(AggError::Backend(format!(
                "resampled rows do not have {} dimensions",
                self.dimensions
            )));
        }
        Ok(rows)
    }

    /// Whether a new summary should be sent upstream, given the last AMTLV that carried one.
    pub fn should_resample(&self, last_summary: Option<&AmtlvData>) -> bool {
        let due = self.resample_due.load(Ordering::SeqCst);
        match &self.policy {
            ResamplePolicy::WindowTurnover => due,
            ResamplePolicy::Divergence { threshold, base_unit } => {
                if !due {
                    return false;
                }
                let last = match last_summary {
                    Some(last) if !last.samples().is_empty() => last,
                    _ => return true,
                };
                let points: Vec<Vec<f64>> = last.samples().iter().map(|s| s.values().to_vec()).collect();
                let weights: Vec<u64> = last.samples().iter().map(|s| s.weight().max(1)).collect();

                match self.lock().backend.divergence(&points, &weights, base_unit) {
                    Some(Ok(divergence)) => {
                        debug!("[Model] Divergence from last summary: {:.4} (threshold {:.4})", divergence, threshold);
                        divergence > *threshold
                    }
                    Some(Err(e)) => {
                        warn!("[Model] Could not compare against last summary: {}", e);
                        true
                    }
                    None => true,
                }
            }
        }
    }

    // ========================================================================
    // ESTIMATION
    // ========================================================================

    pub fn estimate(&self, sample: &TimeErrorSample) -> Result<f64> {
        let values = self.estimate_points(&[sample.values().to_vec()])?;
        values.into_iter().next().ok_or_else(|| AggError::Backend("backend returned no estimate".into()))
    }

    /// Likelihood of each sample, in the same order.
    pub fn estimate_many(&self, samples: &[TimeErrorSample]) -> Result<Vec<f64>> {
        let points: Vec<Vec<f64>> = samples.iter().map(|s| s.values().to_vec()).collect();
        self.estimate_points(&points)
    }

    /// Likelihood of each raw coordinate vector, in the same order.
    pub fn estimate_points(&self, points: &[Vec<f64>]) -> Result<Vec<f64>> {
        if let Some(bad) = points.iter().find(|p| p.len() != self.dimensions) {
            return Err(AggError::DimensionMismatch {
                expected: self.dimensions,
                actual: bad.len(),
            });
        }
        let state = self.lock();
        if !state.backend.is_fitted() {
            return Err(AggError::ModelNotReady);
        }
        let densities = state.backend.evaluate(points)?;
        if densities.len() != points.len() {
            return Err(AggError::Backend(format!(
                "backend returned {} estimates for {} points",
                densities.len(),
                points.len()
            )));
        }
        Ok(densities)
    }

    pub fn summary(&self) -> Option<DensitySummary> {
        self.lock().backend.summary()
    }

    pub fn mean(&self) -> Option<Vec<f64>> {
        self.summary().map(|s| s.mean)
    }

    pub fn variance(&self) -> Option<Vec<f64>> {
        self.summary().map(|s| s.variance)
    }

    pub fn standard_deviation(&self) -> Option<Vec<f64>> {
        self.summary().map(|s| s.standard_deviation())
    }

    /// Release backend resources. Failures are logged; teardown always completes.
    pub fn shutdown(&self) {
        if let Err(e) = self.lock().backend.shutdown() {
            error!("[Model] Failed to shut down density backend: {}", e);
        }
    }
}

//! Aggregation pipeline for one node of the tree.
//!
//! Locally computed samples and samples reported by downstream nodes feed one network
//! model. Outliers found along the way are buffered until the next call to
//! [`Aggregator::retrieve_new_data`], which drains them together with a resampled summary
//! of the model into AMTLV frames for the upstream link.

use log::{debug, info, warn};
use std::mem;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::config::AggConfig;
use crate::dispatch::{Handler, SubscriptionId, Subscribers};
use crate::error::{AggError, Result};
use crate::kde::WeightedKde;
use crate::model::ErrorModel;
use crate::outlier::DensityOutlierDetector;
use crate::processor::{min_frame_size, SampleProcessor};
use crate::sample::{AmtlvData, TimeErrorSample};
use crate::traits::{DensityBackend, OutlierDetector};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregatorState {
    /// Wired to a processor, nothing absorbed yet
    Configured,
    Running,
    /// Terminal
    Stopped,
}

impl AggregatorState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => AggregatorState::Configured,
            1 => AggregatorState::Running,
            _ => AggregatorState::Stopped,
        }
    }
}

/// State shared with the handlers registered on the processor.
struct Pipeline<B: DensityBackend> {
    model: Arc<ErrorModel<B>>,
    detector: Arc<dyn OutlierDetector>,
    outliers: Mutex<Vec<TimeErrorSample>>,
    outlier_listeners: Subscribers<TimeErrorSample>,
    state: AtomicU8,
}

impl<B: DensityBackend> Pipeline<B> {
    fn state(&self) -> AggregatorState {
        AggregatorState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Returns false once stopped.
    fn mark_running(&self) -> bool {
        let _ = self.state.compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst);
        self.state() != AggregatorState::Stopped
    }

    fn buffer(&self) -> std::sync::MutexGuard<'_, Vec<TimeErrorSample>> {
        self.outliers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn on_sample(&self, sample: &TimeErrorSample) {
        if !self.mark_running() {
            return;
        }
        if let Err(e) = self.model.add_sample(sample.clone()) {
            warn!("[Aggregator] Rejected local sample {}: {}", sample, e);
            return;
        }
        if !self.model.is_window_full() {
            return;
        }
        match self.detector.is_outlier(sample) {
            Ok(true) => {
                debug!("[Aggregator] Local outlier {}", sample);
                self.buffer().push(sample.clone());
                self.outlier_listeners.notify(sample);
            }
            Ok(false) => {}
            Err(e) => warn!("[Aggregator] Could not classify local sample {}: {}", sample, e),
        }
    }

    fn on_amtlv(&self, amtlv: &AmtlvData) {
        if !self.mark_running() {
            return;
        }
        if !amtlv.samples().is_empty() {
            if let Err(e) = self.model.add_samples(amtlv.samples().to_vec()) {
                warn!(
                    "[Aggregator] Rejected {} samples from {}: {}",
                    amtlv.samples().len(),
                    amtlv.clock_identity(),
                    e
                );
            }
        }

        let mut accepted = Vec::new();
        for outlier in amtlv.outliers() {
            match self.detector.is_outlier(outlier) {
                Ok(true) => accepted.push(outlier.clone()),
                Ok(false) => {}
                // no local reference yet: pass the downstream verdict through
                Err(AggError::ModelNotReady) => accepted.push(outlier.clone()),
                Err(e) => warn!("[Aggregator] Could not classify outlier {} from {}: {}", outlier, amtlv.clock_identity(), e),
            }
        }
        if !accepted.is_empty() {
            debug!("[Aggregator] {} outliers forwarded from {}", accepted.len(), amtlv.clock_identity());
            self.buffer().extend(accepted);
        }
    }
}

struct Wiring {
    processor: Arc<SampleProcessor>,
    sample_subscription: SubscriptionId,
    amtlv_subscription: SubscriptionId,
}

impl Wiring {
    fn attach<B: DensityBackend + 'static>(pipeline: &Arc<Pipeline<B>>, processor: Arc<SampleProcessor>) -> Self {
        let on_sample = pipeline.clone();
        let sample_subscription = processor.register_sample_consumer(Arc::new(move |s: &TimeErrorSample| on_sample.on_sample(s)));
        let on_amtlv = pipeline.clone();
        let amtlv_subscription = processor.register_amtlv_consumer(Arc::new(move |a: &AmtlvData| on_amtlv.on_amtlv(a)));
        Wiring {
            processor,
            sample_subscription,
            amtlv_subscription,
        }
    }

    fn detach(&self) {
        self.processor.unregister_sample_consumer(self.sample_subscription);
        self.processor.unregister_amtlv_consumer(self.amtlv_subscription);
    }
}

#[derive(Default)]
struct Transmitted {
    last: Option<AmtlvData>,
    /// Last AMTLV that carried samples; the reference for divergence checks
    summary: Option<AmtlvData>,
}

pub struct Aggregator<B: DensityBackend + 'static> {
    pipeline: Arc<Pipeline<B>>,
    wiring: RwLock<Wiring>,
    /// The lock also serializes retrievals
    sent: Mutex<Transmitted>,
    monitoring_ports: usize,
    network_window_size: usize,
}

impl<B: DensityBackend + 'static> Aggregator<B> {
    /// Wire `model` and `detector` to `processor`.
    ///
    /// The model's window is scaled by `monitoring_ports`, since every monitored port feeds
    /// the same model. `network_window_size` is the number of samples sent upstream per
    /// summary.
    pub fn new(
        processor: Arc<SampleProcessor>,
        model: Arc<ErrorModel<B>>,
        detector: Arc<dyn OutlierDetector>,
        monitoring_ports: usize,
        network_window_size: usize,
    ) -> Result<Self> {
        if monitoring_ports == 0 {
            return Err(AggError::InvalidArgument("at least one monitoring port is required".into()));
        }
        if network_window_size == 0 {
            return Err(AggError::InvalidArgument("network window size must be greater than 0".into()));
        }
        for actual in [detector.dimensions(), processor.dimensions()] {
            if actual != model.dimensions() {
                return Err(AggError::DimensionMismatch {
                    expected: model.dimensions(),
                    actual,
                });
            }
        }

        let scaled = model.local_window_size().saturating_mul(monitoring_ports);
        model.modify_window_size(i64::try_from(scaled).unwrap_or(i64::MAX));

        let pipeline = Arc::new(Pipeline {
            model,
            detector,
            outliers: Mutex::new(Vec::new()),
            outlier_listeners: Subscribers::new(),
            state: AtomicU8::new(0),
        });
        info!("[Aggregator] New sync messages are now being processed using {:?}", processor);
        let wiring = Wiring::attach(&pipeline, processor);

        Ok(Aggregator {
            pipeline,
            wiring: RwLock::new(wiring),
            sent: Mutex::new(Transmitted::default()),
            monitoring_ports,
            network_window_size,
        })
    }

    pub fn state(&self) -> AggregatorState {
        self.pipeline.state()
    }

    pub fn model(&self) -> &Arc<ErrorModel<B>> {
        &self.pipeline.model
    }

    pub fn monitoring_ports(&self) -> usize {
        self.monitoring_ports
    }

    pub fn network_window_size(&self) -> usize {
        self.network_window_size
    }

    pub fn sample_processor(&self) -> Arc<SampleProcessor> {
        self.wiring.read().unwrap_or_else(|e| e.into_inner()).processor.clone()
    }

    /// Route samples and AMTLVs from `processor` into this aggregator instead of the current one.
    pub fn set_sample_processor(&self, processor: Arc<SampleProcessor>) -> Result<()> {
        if self.state() == AggregatorState::Stopped {
            return Err(AggError::Stopped);
        }
        if processor.dimensions() != self.pipeline.model.dimensions() {
            return Err(AggError::DimensionMismatch {
                expected: self.pipeline.model.dimensions(),
                actual: processor.dimensions(),
            });
        }
        info!("[Aggregator] New sync messages are now being processed using {:?}", processor);
        let next = Wiring::attach(&self.pipeline, processor);
        let prev = {
            let mut wiring = self.wiring.write().unwrap_or_else(|e| e.into_inner());
            mem::replace(&mut *wiring, next)
        };
        prev.detach();
        Ok(())
    }

    /// Drain buffered outliers and package them, with a fresh summary when one is due, into
    /// AMTLV frames of at most `max_frame_size` bytes.
    pub fn retrieve_new_data(&self, max_frame_size: usize) -> Result<Vec<Vec<u8>>> {
        if self.state() == AggregatorState::Stopped {
            return Err(AggError::Stopped);
        }
        let mut sent = self.sent.lock().unwrap_or_else(|e| e.into_inner());
        let processor = self.sample_processor();

        let outliers = mem::take(&mut *self.pipeline.buffer());

        let min = min_frame_size(!outliers.is_empty());
        if max_frame_size < min {
            self.restore_outliers(outliers);
            return Err(AggError::FrameTooSmall { min, actual: max_frame_size });
        }

        let model = &self.pipeline.model;
        let samples = match sent.last.as_ref() {
            Some(_) if model.should_resample(sent.summary.as_ref()) => match model.resample(self.network_window_size) {
                Ok(rows) => rows,
                Err(e) => {
                    warn!("[Aggregator] Sending no samples, resample failed: {}", e);
                    Vec::new()
                }
            },
            _ => Vec::new(),
        };

        let weight = (self.monitoring_ports as u64).saturating_add(processor.network_representation());
        let amtlv = processor.package_amtlv_data(weight, outliers, samples);

        match processor.amtlv_to_bytes(&amtlv, max_frame_size) {
            Ok(frames) => {
                debug!(
                    "[Aggregator] Packaged {} samples and {} outliers (weight {}) into {} frames",
                    amtlv.samples().len(),
                    amtlv.outliers().len(),
                    weight,
                    frames.len()
                );
                if !amtlv.samples().is_empty() {
                    sent.summary = Some(amtlv.clone());
                }
                sent.last = Some(amtlv);
                Ok(frames)
            }
            Err(e) => {
                self.restore_outliers(amtlv.outliers().to_vec());
                Err(e)
            }
        }
    }

    // Put drained outliers back ahead of anything that arrived meanwhile.
    fn restore_outliers(&self, drained: Vec<TimeErrorSample>) {
        let mut buffer = self.pipeline.buffer();
        let newer = mem::replace(&mut *buffer, drained);
        buffer.extend(newer);
    }

    /// The AMTLV packaged by the last successful [`retrieve_new_data`](Self::retrieve_new_data).
    pub fn last_transmitted(&self) -> Option<AmtlvData> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).last.clone()
    }

    /// The last transmitted AMTLV that carried a summary of the model.
    pub fn last_summary(&self) -> Option<AmtlvData> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).summary.clone()
    }

    /// Outliers waiting for the next retrieval.
    pub fn pending_outliers(&self) -> usize {
        self.pipeline.buffer().len()
    }

    pub fn register_outlier_receipt_callback(&self, handler: Handler<TimeErrorSample>) -> SubscriptionId {
        self.pipeline.outlier_listeners.register(handler)
    }

    pub fn unregister_outlier_receipt_callback(&self, id: SubscriptionId) -> bool {
        self.pipeline.outlier_listeners.unregister(id)
    }

    /// Drop buffered outliers and the model's window. The aggregator keeps running.
    pub fn clear_data(&self) {
        if self.state() == AggregatorState::Stopped {
            warn!("[Aggregator] clear_data called after stop; ignoring");
            return;
        }
        self.pipeline.buffer().clear();
        self.pipeline.model.clear();
    }

    /// Tear down: release the model backend, stop the processor's dispatch and drop all
    /// listeners. Later calls are no-ops.
    pub fn stop_aggregation(&self) {
        if self.pipeline.state.swap(2, Ordering::SeqCst) == 2 {
            return;
        }
        self.pipeline.model.shutdown();
        self.sample_processor().stop_processing();
        self.pipeline.outlier_listeners.clear();
        self.pipeline.buffer().clear();
        info!("[Aggregator] Aggregation stopped");
    }
}

impl Aggregator<WeightedKde> {
    /// Aggregator over a [`WeightedKde`] network model and a [`DensityOutlierDetector`],
    /// both built from `config`.
    pub fn from_config(processor: Arc<SampleProcessor>, config: &AggConfig) -> Result<Self> {
        config.validate()?;
        let model = Arc::new(
            ErrorModel::new(
                config.model.window_size,
                config.model.dimensions,
                WeightedKde::new(config.kde.clone()),
            )?
            .with_policy(config.model.resample_policy.clone()),
        );
        let detector = DensityOutlierDetector::new(model.clone(), config.outlier.likelihood_threshold)?
            .with_policy(config.outlier.policy.clone())?
            .with_max_grid_points(config.outlier.max_grid_points);

        Self::new(
            processor,
            model,
            Arc::new(detector),
            config.aggregator.monitoring_ports,
            config.aggregator.network_window_size,
        )
    }
}

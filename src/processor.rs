//! Sample processing: turns Sync / reverse-Sync pairs into time-error samples, and owns the
//! AMTLV wire codec.
//!
//! AMTLV data field layout (all big-endian):
//! - Bytes 0-3: network weight (devices represented by the sender's subtree)
//! - Bytes 4-5: sample data length in bytes (multiple of 8)
//! - Bytes 6-7: outlier data length in bytes (multiple of 16)
//! - Sample records, 8 bytes each: scaled-ns offset
//! - Outlier records, 16 bytes each: scaled-ns offset + clock identity
//!
//! The codec is the interoperability contract between nodes; segmentation must produce
//! the same frames on every implementation.

use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::{Arc, Mutex, RwLock};

use crate::dispatch::{Handler, SubscriptionId, Subscribers};
use crate::error::{AggError, Result};
use crate::sample::{
    from_scaled_ns, round_half_up, to_scaled_ns, AmtlvData, ClockIdentity, PtpTimestamp, SyncData,
    TimeErrorSample,
};
use crate::traits::SampleCodec;

pub const AMTLV_HEADER_SIZE: usize = 8;
pub const SAMPLE_RECORD_SIZE: usize = 8;
pub const OUTLIER_RECORD_SIZE: usize = 16;

// Length fields are u16, so one frame can never declare more than this per list.
const MAX_LENGTH_FIELD: usize = u16::MAX as usize;

/// Smallest frame that can carry at least one record of an AMTLV with (or without) outliers.
pub fn min_frame_size(has_outliers: bool) -> usize {
    if has_outliers {
        AMTLV_HEADER_SIZE + OUTLIER_RECORD_SIZE
    } else {
        AMTLV_HEADER_SIZE + SAMPLE_RECORD_SIZE
    }
}

// ============================================================================
// OFFSET-FROM-GM CODEC
// ============================================================================

/// Codec for the one-dimensional offsetFromGm metric.
#[derive(Debug, Default, Clone, Copy)]
pub struct OffsetCodec;

impl OffsetCodec {
    fn offset_of(sample: &TimeErrorSample) -> Result<f64> {
        match sample.values() {
            [offset] => Ok(*offset),
            other => Err(AggError::DimensionMismatch { expected: 1, actual: other.len() }),
        }
    }
}

impl SampleCodec for OffsetCodec {
    fn name(&self) -> &str {
        "Offset from GM Sample Processor"
    }

    fn dimensions(&self) -> usize {
        1
    }

    /// offset = (t1_peer - t1_gm) + (t2_gm - t2_peer) + (corr_down - corr_up), with each
    /// correction = correction field + rounded path delay. Evaluated in scaled nanoseconds
    /// so the only rounding is the path-delay step.
    fn compute_time_error(
        &self,
        gm_sync: &SyncData,
        upstream_path_delay: f64,
        rev_sync: &SyncData,
        downstream_path_delay: f64,
    ) -> TimeErrorSample {
        let t1_gm = gm_sync.origin_timestamp.to_nanos();
        let t1_peer = rev_sync.origin_timestamp.to_nanos();
        let t2_gm = gm_sync.receipt_timestamp.to_nanos();
        let t2_peer = rev_sync.receipt_timestamp.to_nanos();

        let upstream_corr = gm_sync.correction.scaled() + ((round_half_up(upstream_path_delay) as i128) << 16);
        let downstream_corr = rev_sync.correction.scaled() + ((round_half_up(downstream_path_delay) as i128) << 16);

        let timestamp_diff = (t1_peer - t1_gm) + (t2_gm - t2_peer);
        let offset_scaled = (timestamp_diff << 16) + (downstream_corr - upstream_corr);
        let offset_ns = offset_scaled as f64 / 65536.0;

        TimeErrorSample::offset(offset_ns, 1, rev_sync.clock_identity).with_timestamp(rev_sync.receipt_timestamp)
    }

    fn parse_amtlv(&self, sender: ClockIdentity, timestamp: Option<PtpTimestamp>, data: &[u8]) -> Result<AmtlvData> {
        if data.len() < AMTLV_HEADER_SIZE {
            return Err(AggError::MalformedAmtlv(format!(
                "data field is {} bytes, shorter than the {} byte header",
                data.len(),
                AMTLV_HEADER_SIZE
            )));
        }

        let weight = BigEndian::read_u32(&data[0..4]) as u64;
        let sample_len = BigEndian::read_u16(&data[4..6]) as usize;
        let outlier_len = BigEndian::read_u16(&data[6..8]) as usize;

        if data.len() - AMTLV_HEADER_SIZE != sample_len + outlier_len || data.len() % 8 != 0 {
            return Err(AggError::MalformedAmtlv(format!(
                "declared lengths ({} + {}) do not match the {} byte payload, or the field is not 8-byte aligned",
                sample_len,
                outlier_len,
                data.len() - AMTLV_HEADER_SIZE
            )));
        }
        if sample_len % SAMPLE_RECORD_SIZE != 0 {
            return Err(AggError::MalformedAmtlv(format!(
                "sample data length {} is not a multiple of {}",
                sample_len, SAMPLE_RECORD_SIZE
            )));
        }
        if outlier_len % OUTLIER_RECORD_SIZE != 0 {
            return Err(AggError::MalformedAmtlv(format!(
                "outlier data length {} is not a multiple of {}",
                outlier_len, OUTLIER_RECORD_SIZE
            )));
        }

        let mut rdr = Cursor::new(&data[AMTLV_HEADER_SIZE..]);
        let read_err = |e: std::io::Error| AggError::MalformedAmtlv(e.to_string());

        let mut samples = Vec::with_capacity(sample_len / SAMPLE_RECORD_SIZE);
        for _ in 0..sample_len / SAMPLE_RECORD_SIZE {
            let offset = from_scaled_ns(rdr.read_i64::<BigEndian>().map_err(read_err)?);
            let mut sample = TimeErrorSample::offset(offset, weight, sender);
            if let Some(ts) = timestamp {
                sample = sample.with_timestamp(ts);
            }
            samples.push(sample);
        }

        let mut outliers = Vec::with_capacity(outlier_len / OUTLIER_RECORD_SIZE);
        for _ in 0..outlier_len / OUTLIER_RECORD_SIZE {
            let offset = from_scaled_ns(rdr.read_i64::<BigEndian>().map_err(read_err)?);
            let mut id = [0u8; 8];
            std::io::Read::read_exact(&mut rdr, &mut id).map_err(read_err)?;
            let mut outlier = TimeErrorSample::offset(offset, weight, ClockIdentity(id));
            if let Some(ts) = timestamp {
                outlier = outlier.with_timestamp(ts);
            }
            outliers.push(outlier);
        }

        Ok(AmtlvData::new(weight, sender, timestamp, samples, outliers))
    }

    fn package_amtlv(&self, network_weight: u64, outliers: Vec<TimeErrorSample>, resampled: Vec<Vec<f64>>) -> AmtlvData {
        let samples = resampled
            .into_iter()
            .map(|row| TimeErrorSample::new(row, network_weight, ClockIdentity::ZERO))
            .collect();
        AmtlvData::new(network_weight, ClockIdentity::ZERO, None, samples, outliers)
    }

    /// Segments `amtlv` into data fields no larger than `max_frame_size`.
    ///
    /// Samples take priority: each frame is filled with whole sample records first, then
    /// whole outlier records in whatever room is left. Whatever does not fit rolls into the
    /// next frame. Every frame carries its own header describing only its own payload.
    fn amtlv_to_bytes(&self, amtlv: &AmtlvData, max_frame_size: usize) -> Result<Vec<Vec<u8>>> {
        let samples = amtlv.samples();
        let outliers = amtlv.outliers();

        let min = min_frame_size(!outliers.is_empty());
        if max_frame_size < min {
            return Err(AggError::FrameTooSmall { min, actual: max_frame_size });
        }

        let weight = u32::try_from(amtlv.weight()).unwrap_or_else(|_| {
            warn!("[AMTLV] Network weight {} exceeds the 32-bit field, saturating", amtlv.weight());
            u32::MAX
        });

        let payload_cap = max_frame_size - AMTLV_HEADER_SIZE;
        let write_err = |e: std::io::Error| AggError::Backend(format!("AMTLV encode failed: {}", e));
        let mut frames = Vec::new();
        let (mut s_idx, mut o_idx) = (0usize, 0usize);

        loop {
            let sample_count = (samples.len() - s_idx).min(payload_cap.min(MAX_LENGTH_FIELD) / SAMPLE_RECORD_SIZE);
            let room = payload_cap - sample_count * SAMPLE_RECORD_SIZE;
            let outlier_count = (outliers.len() - o_idx).min(room.min(MAX_LENGTH_FIELD) / OUTLIER_RECORD_SIZE);

            let sample_len = sample_count * SAMPLE_RECORD_SIZE;
            let outlier_len = outlier_count * OUTLIER_RECORD_SIZE;
            let mut frame = Vec::with_capacity(AMTLV_HEADER_SIZE + sample_len + outlier_len);

            frame.write_u32::<BigEndian>(weight).map_err(write_err)?;
            frame.write_u16::<BigEndian>(sample_len as u16).map_err(write_err)?;
            frame.write_u16::<BigEndian>(outlier_len as u16).map_err(write_err)?;

            for sample in &samples[s_idx..s_idx + sample_count] {
                frame.write_i64::<BigEndian>(to_scaled_ns(Self::offset_of(sample)?)).map_err(write_err)?;
            }
            for outlier in &outliers[o_idx..o_idx + outlier_count] {
                frame.write_i64::<BigEndian>(to_scaled_ns(Self::offset_of(outlier)?)).map_err(write_err)?;
                frame.extend_from_slice(outlier.clock_identity().as_bytes());
            }

            s_idx += sample_count;
            o_idx += outlier_count;
            frames.push(frame);

            if s_idx == samples.len() && o_idx == outliers.len() {
                break;
            }
        }

        debug!(
            "[AMTLV] Encoded {} samples + {} outliers into {} frame(s) (max {} bytes)",
            samples.len(),
            outliers.len(),
            frames.len(),
            max_frame_size
        );
        Ok(frames)
    }
}

// ============================================================================
// SAMPLE PROCESSOR
// ============================================================================

struct GmObservation {
    sync: SyncData,
    mean_path_delay: f64,
    gm_identity: ClockIdentity,
}

/// Bridges PTP observations to the statistical layer.
///
/// Computed samples and parsed AMTLVs are fanned out to registered consumers. The
/// grandmaster observation is replaced as a whole, so a reverse Sync always pairs with
/// one complete observation.
pub struct SampleProcessor {
    codec: Box<dyn SampleCodec>,
    gm: RwLock<Option<Arc<GmObservation>>>,
    /// Last weight reported by each downstream sender. Entries are never expired.
    network_rep: Mutex<HashMap<ClockIdentity, u64>>,
    sample_consumers: Subscribers<TimeErrorSample>,
    amtlv_consumers: Subscribers<AmtlvData>,
}

impl SampleProcessor {
    pub fn new(codec: Box<dyn SampleCodec>) -> Self {
        SampleProcessor {
            codec,
            gm: RwLock::new(None),
            network_rep: Mutex::new(HashMap::new()),
            sample_consumers: Subscribers::new(),
            amtlv_consumers: Subscribers::new(),
        }
    }

    /// Processor for the offsetFromGm metric.
    pub fn offset() -> Self {
        Self::new(Box::new(OffsetCodec))
    }

    pub fn name(&self) -> &str {
        self.codec.name()
    }

    pub fn dimensions(&self) -> usize {
        self.codec.dimensions()
    }

    /// Record the latest Sync received from the grandmaster.
    pub fn received_gm_sync(&self, sync: SyncData, mean_path_delay: f64, gm_identity: ClockIdentity) {
        let next = Arc::new(GmObservation { sync, mean_path_delay, gm_identity });
        let prev = {
            let mut gm = self.gm.write().unwrap_or_else(|e| e.into_inner());
            gm.replace(next)
        };

        match prev {
            Some(prev) if prev.gm_identity != gm_identity => {
                info!(
                    "[GM] Grandmaster changed: {} -> {}. Time error is now computed against the new grandmaster.",
                    prev.gm_identity, gm_identity
                );
            }
            None => info!("[GM] First Sync observed from grandmaster {}", gm_identity),
            _ => {}
        }
    }

    /// Handle a reverse Sync from a downstream link partner.
    ///
    /// With `add_sample` set the partner's time error is computed and fanned out. Any
    /// attached AMTLV is parsed and fanned out either way. Before the first grandmaster
    /// Sync this is a no-op.
    pub fn received_reverse_sync(&self, rev_sync: &SyncData, peer_path_delay: f64, add_sample: bool) {
        let gm = match self.gm.read().unwrap_or_else(|e| e.into_inner()).clone() {
            Some(gm) => gm,
            None => return,
        };

        if add_sample {
            let sample = self.compute_time_error(&gm.sync, gm.mean_path_delay, rev_sync, peer_path_delay);
            self.sample_consumers.notify(&sample);
        }

        if let Some(data) = &rev_sync.amtlv {
            match self.parse_amtlv(rev_sync.clock_identity, Some(rev_sync.receipt_timestamp), data) {
                Ok(amtlv) => self.amtlv_consumers.notify(&amtlv),
                Err(e) => error!("[AMTLV] Dropping TLV from {}: {}", rev_sync.clock_identity, e),
            }
        }
    }

    pub fn compute_time_error(
        &self,
        gm_sync: &SyncData,
        upstream_path_delay: f64,
        rev_sync: &SyncData,
        downstream_path_delay: f64,
    ) -> TimeErrorSample {
        self.codec
            .compute_time_error(gm_sync, upstream_path_delay, rev_sync, downstream_path_delay)
    }

    /// Parse an AMTLV data field received from `sender` and remember its reported weight.
    pub fn process_amtlv_data(&self, sender: ClockIdentity, data: &[u8]) -> Result<AmtlvData> {
        self.parse_amtlv(sender, None, data)
    }

    fn parse_amtlv(&self, sender: ClockIdentity, timestamp: Option<PtpTimestamp>, data: &[u8]) -> Result<AmtlvData> {
        let amtlv = self.codec.parse_amtlv(sender, timestamp, data)?;
        self.network_rep
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(sender, amtlv.weight());
        Ok(amtlv)
    }

    /// Sum of the latest weight reported by every known downstream sender.
    pub fn network_representation(&self) -> u64 {
        self.network_rep
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .fold(0u64, |acc, w| acc.saturating_add(*w))
    }

    pub fn package_amtlv_data(&self, network_weight: u64, outliers: Vec<TimeErrorSample>, resampled: Vec<Vec<f64>>) -> AmtlvData {
        self.codec.package_amtlv(network_weight, outliers, resampled)
    }

    pub fn amtlv_to_bytes(&self, amtlv: &AmtlvData, max_frame_size: usize) -> Result<Vec<Vec<u8>>> {
        self.codec.amtlv_to_bytes(amtlv, max_frame_size)
    }

    // ========================================================================
    // SUBSCRIPTIONS
    // ========================================================================

    pub fn register_sample_consumer(&self, handler: Handler<TimeErrorSample>) -> SubscriptionId {
        self.sample_consumers.register(handler)
    }

    pub fn unregister_sample_consumer(&self, id: SubscriptionId) -> bool {
        self.sample_consumers.unregister(id)
    }

    pub fn register_amtlv_consumer(&self, handler: Handler<AmtlvData>) -> SubscriptionId {
        self.amtlv_consumers.register(handler)
    }

    pub fn unregister_amtlv_consumer(&self, id: SubscriptionId) -> bool {
        self.amtlv_consumers.unregister(id)
    }

    /// Drop every registered consumer.
    pub fn stop_processing(&self) {
        self.sample_consumers.clear();
        self.amtlv_consumers.clear();
    }
}

impl std::fmt::Debug for SampleProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleProcessor")
            .field("codec", &self.codec.name())
            .field("sample_consumers", &self.sample_consumers.len())
            .field("amtlv_consumers", &self.amtlv_consumers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::CorrectionField;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const OUTLIER_ID: ClockIdentity = ClockIdentity([0, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0]);
    const SENDER_ID: ClockIdentity = ClockIdentity([0, 0x0a, 0x0a, 0x0a, 0x0a, 0x0a, 0x0a, 0]);

    fn sync(t1: i64, t2: i64, corr_ns: i64, id: ClockIdentity) -> SyncData {
        SyncData::new(
            PtpTimestamp::from_nanos(t1 as i128),
            PtpTimestamp::from_nanos(t2 as i128),
            CorrectionField::from_nanos(corr_ns),
            id,
        )
    }

    fn packaged(n_samples: usize, sample_off: f64, n_outliers: usize, outlier_off: f64, weight: u64) -> AmtlvData {
        let outliers = (0..n_outliers)
            .map(|_| TimeErrorSample::offset(outlier_off, 1, OUTLIER_ID))
            .collect();
        let rows = (0..n_samples).map(|_| vec![sample_off]).collect();
        OffsetCodec.package_amtlv(weight, outliers, rows)
    }

    #[test]
    fn test_compute_time_error() {
        let check = |gm_t1: i64, gm_t2: i64, gm_cor: i64, dev_t1: i64, dev_t2: i64, dev_cor: i64, up_pd: i64, down_pd: i64| {
            let gm = sync(gm_t1, gm_t2, gm_cor, OUTLIER_ID);
            let dev = sync(dev_t1, dev_t2, dev_cor, SENDER_ID);
            let sample = OffsetCodec.compute_time_error(&gm, up_pd as f64, &dev, down_pd as f64);
            let expected = (dev_t1 - gm_t1) + (gm_t2 - dev_t2) + (down_pd + dev_cor) - (up_pd + gm_cor);
            assert_eq!(sample.values()[0], expected as f64);
            assert_eq!(sample.weight(), 1);
            assert_eq!(sample.clock_identity(), SENDER_ID);
        };

        check(100, 200, 50, 10, 15, 5, 50, 5);
        check(100, 200, 0, 10, 15, -5, 50, 5);
        check(100, 200, 0, 10, 2000, -5, 50, 1000);
        check(100, 200, 0, 100, 200, 0, 50, 50);
        check(i32::MIN as i64, i32::MAX as i64, -1000, i64::MIN >> 16, i64::MAX >> 16, 0, 1_000_000_000, 0);
    }

    #[test]
    fn test_compute_time_error_rounds_path_delay() {
        let gm = sync(0, 0, 0, OUTLIER_ID);
        let dev = sync(0, 0, 0, SENDER_ID);
        let sample = OffsetCodec.compute_time_error(&gm, 0.4, &dev, 2.5);
        assert_eq!(sample.values()[0], 3.0);
    }

    #[test]
    fn test_compute_time_error_keeps_sub_ns_correction() {
        let gm = SyncData::new(PtpTimestamp::default(), PtpTimestamp::default(), CorrectionField(0), OUTLIER_ID);
        let dev = SyncData::new(PtpTimestamp::default(), PtpTimestamp::default(), CorrectionField(0x8000), SENDER_ID);
        let sample = OffsetCodec.compute_time_error(&gm, 0.0, &dev, 0.0);
        assert_eq!(sample.values()[0], 0.5);
    }

    #[test]
    fn test_compute_time_error_antisymmetric() {
        let a = sync(1_000, 1_250, 30, OUTLIER_ID);
        let b = sync(1_007, 1_240, 12, SENDER_ID);
        let ab = OffsetCodec.compute_time_error(&a, 20.0, &b, 20.0).values()[0];
        let ba = OffsetCodec.compute_time_error(&b, 20.0, &a, 20.0).values()[0];
        assert_eq!(ab, -ba);

        let same = OffsetCodec.compute_time_error(&a, 20.0, &a, 20.0).values()[0];
        assert_eq!(same, 0.0);
    }

    #[test]
    fn test_single_frame_example() {
        let amtlv = packaged(2, 10.0, 1, -1000.0, 1);
        let frames = OffsetCodec.amtlv_to_bytes(&amtlv, 1000).unwrap();
        assert_eq!(frames.len(), 1);
        let frame = &frames[0];
        assert_eq!(frame.len(), 8 + 16 + 16);
        assert_eq!(BigEndian::read_u32(&frame[0..4]), 1);
        assert_eq!(BigEndian::read_u16(&frame[4..6]), 16);
        assert_eq!(BigEndian::read_u16(&frame[6..8]), 16);
        assert_eq!(from_scaled_ns(BigEndian::read_i64(&frame[8..16])), 10.0);
        assert_eq!(from_scaled_ns(BigEndian::read_i64(&frame[24..32])), -1000.0);
        assert_eq!(&frame[32..40], OUTLIER_ID.as_bytes());
    }

    #[test]
    fn test_roundtrip_without_segmentation() {
        let cases: &[(usize, usize, f64, f64)] = &[
            (100, 100, -1000.0, 2.0),
            (1500, 0, i32::MAX as f64, -1.0),
            (0, 1500, (i64::MAX >> 16) as f64, 0.0),
            (4095, 1, (i64::MIN >> 16) as f64, 10.5),
        ];
        for &(n_samples, n_outliers, sample_off, outlier_off) in cases {
            let amtlv = packaged(n_samples, sample_off, n_outliers, outlier_off, 7);
            let total = AMTLV_HEADER_SIZE + n_samples * 8 + n_outliers * 16;
            let frames = OffsetCodec.amtlv_to_bytes(&amtlv, total).unwrap();
            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0].len(), total);

            let processor = SampleProcessor::offset();
            let parsed = processor.process_amtlv_data(SENDER_ID, &frames[0]).unwrap();
            assert_eq!(parsed.weight(), 7);
            assert_eq!(parsed.clock_identity(), SENDER_ID);
            assert_eq!(parsed.samples().len(), n_samples);
            assert_eq!(parsed.outliers().len(), n_outliers);
            assert!(parsed.samples().iter().all(|s| s.values() == [sample_off] && s.weight() == 7));
            assert!(parsed
                .outliers()
                .iter()
                .all(|s| s.values() == [outlier_off] && s.clock_identity() == OUTLIER_ID));
        }
    }

    #[test]
    fn test_segmentation_invariants() {
        let cases: &[(usize, usize, usize)] = &[
            (1500, 1500, 1500),
            (32, 64, 64),
            (100, 1, 800),
            (100, 1600, 1),
            (27, 13, 9),
            (24, 0, 5),
            (24, 5, 0),
            (70_000, 9000, 5000),
        ];
        for &(max_frame, n_outliers, n_samples) in cases {
            let amtlv = packaged(n_samples, 2.0, n_outliers, -1.0, 45);
            let frames = OffsetCodec.amtlv_to_bytes(&amtlv, max_frame).unwrap();

            assert!(frames.iter().all(|f| f.len() <= max_frame));
            let declared_samples: usize = frames.iter().map(|f| BigEndian::read_u16(&f[4..6]) as usize).sum();
            let declared_outliers: usize = frames.iter().map(|f| BigEndian::read_u16(&f[6..8]) as usize).sum();
            assert_eq!(declared_samples, n_samples * 8);
            assert_eq!(declared_outliers, n_outliers * 16);

            let processor = SampleProcessor::offset();
            let mut seen_samples = 0;
            let mut seen_outliers = 0;
            for frame in &frames {
                assert_eq!(BigEndian::read_u32(&frame[0..4]), 45);
                let parsed = processor.process_amtlv_data(SENDER_ID, frame).unwrap();
                seen_samples += parsed.samples().len();
                seen_outliers += parsed.outliers().len();
            }
            assert_eq!(seen_samples, n_samples);
            assert_eq!(seen_outliers, n_outliers);
        }
    }

    #[test]
    fn test_samples_fill_before_outliers() {
        // 40 bytes of payload per frame: 5 samples fit, the outlier waits for the next frame.
        let amtlv = packaged(7, 1.0, 1, -1.0, 1);
        let frames = OffsetCodec.amtlv_to_bytes(&amtlv, 48).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(BigEndian::read_u16(&frames[0][4..6]), 40);
        assert_eq!(BigEndian::read_u16(&frames[0][6..8]), 0);
        assert_eq!(BigEndian::read_u16(&frames[1][4..6]), 16);
        assert_eq!(BigEndian::read_u16(&frames[1][6..8]), 16);
    }

    #[test]
    fn test_frame_too_small() {
        let with_outliers = packaged(1, 1.0, 1, -1.0, 1);
        assert_eq!(
            OffsetCodec.amtlv_to_bytes(&with_outliers, 23),
            Err(AggError::FrameTooSmall { min: 24, actual: 23 })
        );
        let samples_only = packaged(1, 1.0, 0, 0.0, 1);
        assert_eq!(
            OffsetCodec.amtlv_to_bytes(&samples_only, 15),
            Err(AggError::FrameTooSmall { min: 16, actual: 15 })
        );
        assert!(OffsetCodec.amtlv_to_bytes(&samples_only, 16).is_ok());
    }

    #[test]
    fn test_empty_amtlv_is_single_header() {
        let empty = packaged(0, 0.0, 0, 0.0, 3);
        let frames = OffsetCodec.amtlv_to_bytes(&empty, 100).unwrap();
        assert_eq!(frames, vec![vec![0, 0, 0, 3, 0, 0, 0, 0]]);
    }

    #[test]
    fn test_weight_saturates() {
        let amtlv = packaged(1, 1.0, 0, 0.0, u64::MAX);
        let frames = OffsetCodec.amtlv_to_bytes(&amtlv, 100).unwrap();
        assert_eq!(BigEndian::read_u32(&frames[0][0..4]), u32::MAX);
    }

    #[test]
    fn test_malformed_amtlv_rejected() {
        let processor = SampleProcessor::offset();

        assert!(matches!(processor.process_amtlv_data(SENDER_ID, &[0u8; 4]), Err(AggError::MalformedAmtlv(_))));

        // Declares 16 bytes of samples but carries 8.
        let mut bad_len = vec![0, 0, 0, 1, 0, 16, 0, 0];
        bad_len.extend_from_slice(&[0u8; 8]);
        assert!(matches!(processor.process_amtlv_data(SENDER_ID, &bad_len), Err(AggError::MalformedAmtlv(_))));

        // Outlier length of 8 is consistent in total but not record-aligned.
        let mut bad_outlier = vec![0, 0, 0, 1, 0, 8, 0, 8];
        bad_outlier.extend_from_slice(&[0u8; 16]);
        assert!(matches!(processor.process_amtlv_data(SENDER_ID, &bad_outlier), Err(AggError::MalformedAmtlv(_))));

        assert_eq!(processor.network_representation(), 0);
    }

    #[test]
    fn test_network_representation_tracks_latest_per_sender() {
        let processor = SampleProcessor::offset();
        let other = ClockIdentity([1; 8]);

        let frame = |w| OffsetCodec.amtlv_to_bytes(&packaged(1, 0.0, 0, 0.0, w), 64).unwrap().remove(0);

        processor.process_amtlv_data(SENDER_ID, &frame(10)).unwrap();
        processor.process_amtlv_data(other, &frame(5)).unwrap();
        assert_eq!(processor.network_representation(), 15);

        processor.process_amtlv_data(SENDER_ID, &frame(3)).unwrap();
        assert_eq!(processor.network_representation(), 8);
    }

    #[test]
    fn test_reverse_sync_before_gm_is_ignored() {
        let processor = SampleProcessor::offset();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        processor.register_sample_consumer(Arc::new(move |_: &TimeErrorSample| {
            h.fetch_add(1, Ordering::SeqCst);
        }));

        processor.received_reverse_sync(&sync(0, 0, 0, SENDER_ID), 0.0, true);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_reverse_sync_fans_out_sample_and_amtlv() {
        let _ = env_logger::builder().is_test(true).try_init();
        let processor = SampleProcessor::offset();
        let samples = Arc::new(Mutex::new(Vec::new()));
        let amtlvs = Arc::new(AtomicUsize::new(0));

        let s = samples.clone();
        processor.register_sample_consumer(Arc::new(move |sample: &TimeErrorSample| {
            s.lock().unwrap().push(sample.clone());
        }));
        let s2 = samples.clone();
        processor.register_sample_consumer(Arc::new(move |sample: &TimeErrorSample| {
            s2.lock().unwrap().push(sample.clone());
        }));
        let a = amtlvs.clone();
        processor.register_amtlv_consumer(Arc::new(move |amtlv: &AmtlvData| {
            assert_eq!(amtlv.samples().len(), 2);
            a.fetch_add(1, Ordering::SeqCst);
        }));

        processor.received_gm_sync(sync(100, 200, 0, OUTLIER_ID), 50.0, OUTLIER_ID);

        let tlv = OffsetCodec.amtlv_to_bytes(&packaged(2, 3.0, 0, 0.0, 4), 64).unwrap().remove(0);
        let rev = sync(110, 215, 0, SENDER_ID).with_amtlv(tlv);
        processor.received_reverse_sync(&rev, 50.0, true);

        let got = samples.lock().unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].values()[0], -5.0);
        assert_eq!(amtlvs.load(Ordering::SeqCst), 1);
        assert_eq!(processor.network_representation(), 4);

        // add_sample = false still parses the TLV
        drop(got);
        processor.received_reverse_sync(&rev, 50.0, false);
        assert_eq!(samples.lock().unwrap().len(), 2);
        assert_eq!(amtlvs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_malformed_tlv_does_not_block_sample() {
        let processor = SampleProcessor::offset();
        let hits = Arc::new(AtomicUsize::new(0));
        let amtlvs = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        processor.register_sample_consumer(Arc::new(move |_: &TimeErrorSample| {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        let a = amtlvs.clone();
        processor.register_amtlv_consumer(Arc::new(move |_: &AmtlvData| {
            a.fetch_add(1, Ordering::SeqCst);
        }));

        processor.received_gm_sync(sync(0, 0, 0, OUTLIER_ID), 0.0, OUTLIER_ID);
        let rev = sync(0, 0, 0, SENDER_ID).with_amtlv(vec![1, 2, 3]);
        processor.received_reverse_sync(&rev, 0.0, true);

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(amtlvs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_stop_processing_clears_consumers() {
        let processor = SampleProcessor::offset();
        processor.register_sample_consumer(Arc::new(|_: &TimeErrorSample| {}));
        processor.register_amtlv_consumer(Arc::new(|_: &AmtlvData| {}));
        processor.stop_processing();
        assert!(processor.sample_consumers.is_empty());
        assert!(processor.amtlv_consumers.is_empty());
    }
}

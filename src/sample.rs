//! Value records exchanged between the PTP stack and the statistical layer.
//!
//! Everything here is immutable after construction. The wire-facing helpers
//! (`PtpTimestamp::parse`, `CorrectionField::from_bytes`, scaled nanosecond
//! conversion) are the only places that know about byte layouts below the AMTLV codec.

use byteorder::{BigEndian, ByteOrder};
use std::fmt;

use crate::error::{AggError, Result};

pub const NSEC_PER_SEC: i128 = 1_000_000_000;

/// Scaled nanoseconds carry 16 bits of sub-nanosecond precision.
pub const SCALED_NS_CONVERSION: f64 = 65536.0;

/// Converts fractional nanoseconds to the scaled integer used on the wire.
///
/// Rounds half-up so encoders on every node agree on tie-breaking.
pub fn to_scaled_ns(ns: f64) -> i64 {
    (ns * SCALED_NS_CONVERSION + 0.5).floor() as i64
}

/// Inverse of [`to_scaled_ns`].
pub fn from_scaled_ns(scaled: i64) -> f64 {
    scaled as f64 / SCALED_NS_CONVERSION
}

/// Half-up rounding of a path delay to whole nanoseconds.
pub fn round_half_up(value: f64) -> i64 {
    (value + 0.5).floor() as i64
}

// ============================================================================
// CLOCK IDENTITY
// ============================================================================

/// 8-byte IEEE-1588 clock identity.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClockIdentity(pub [u8; 8]);

impl ClockIdentity {
    pub const SIZE: usize = 8;

    /// All-zero identity used for synthesized (resampled) points.
    pub const ZERO: ClockIdentity = ClockIdentity([0u8; 8]);

    pub fn from_slice(buf: &[u8]) -> Result<Self> {
        let bytes: [u8; 8] = buf.try_into().map_err(|_| {
            AggError::InvalidArgument(format!("clock identity must be 8 bytes, got {}", buf.len()))
        })?;
        Ok(ClockIdentity(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 8]
    }
}

impl fmt::Display for ClockIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for ClockIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClockIdentity({})", self)
    }
}

// ============================================================================
// TIMESTAMPS & CORRECTION
// ============================================================================

/// PTP timestamp: 48-bit seconds plus 32-bit nanoseconds.
///
/// Seconds are kept signed so test fixtures and synthetic drivers can express
/// timestamps before the epoch; wire parsing only ever produces non-negative values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct PtpTimestamp {
    pub seconds: i64,
    pub nanoseconds: u32,
}

impl PtpTimestamp {
    pub const SIZE: usize = 10;

    pub fn new(seconds: i64, nanoseconds: u32) -> Self {
        PtpTimestamp { seconds, nanoseconds }
    }

    pub fn from_nanos(total_ns: i128) -> Self {
        PtpTimestamp {
            seconds: total_ns.div_euclid(NSEC_PER_SEC) as i64,
            nanoseconds: total_ns.rem_euclid(NSEC_PER_SEC) as u32,
        }
    }

    pub fn to_nanos(&self) -> i128 {
        self.seconds as i128 * NSEC_PER_SEC + self.nanoseconds as i128
    }

    /// Parses the 10-byte wire form (u48 seconds, u32 nanoseconds, big-endian).
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(AggError::InvalidArgument(format!(
                "PTP timestamp needs {} bytes, got {}",
                Self::SIZE,
                buf.len()
            )));
        }
        Ok(PtpTimestamp {
            seconds: BigEndian::read_u48(&buf[0..6]) as i64,
            nanoseconds: BigEndian::read_u32(&buf[6..10]),
        })
    }

    pub fn to_bytes(&self) -> [u8; 10] {
        let mut buf = [0u8; 10];
        BigEndian::write_u48(&mut buf[0..6], (self.seconds as u64) & 0xFFFF_FFFF_FFFF);
        BigEndian::write_u32(&mut buf[6..10], self.nanoseconds);
        buf
    }
}

/// PTP correction field in scaled nanoseconds (ns * 2^16).
///
/// Held as `i128` so fields wider than the standard 8 bytes still fit exactly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CorrectionField(pub i128);

impl CorrectionField {
    /// Interprets `buf` (8..=16 bytes) as one signed big-endian integer of scaled nanoseconds.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < 8 || buf.len() > 16 {
            return Err(AggError::InvalidArgument(format!(
                "correction field must be 8 to 16 bytes, got {}",
                buf.len()
            )));
        }
        let mut wide = if buf[0] & 0x80 != 0 { [0xFFu8; 16] } else { [0u8; 16] };
        wide[16 - buf.len()..].copy_from_slice(buf);
        Ok(CorrectionField(i128::from_be_bytes(wide)))
    }

    pub fn from_nanos(ns: i64) -> Self {
        CorrectionField((ns as i128) << 16)
    }

    pub fn scaled(&self) -> i128 {
        self.0
    }
}

// ============================================================================
// SYNC OBSERVATION
// ============================================================================

/// Data parsed from a Sync (and Follow_Up when two-step) or a reverse Sync.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncData {
    pub clock_identity: ClockIdentity,
    pub correction: CorrectionField,
    /// t1
    pub origin_timestamp: PtpTimestamp,
    /// t2
    pub receipt_timestamp: PtpTimestamp,
    /// Data field of an AMTLV attached to the message, if any
    pub amtlv: Option<Vec<u8>>,
}

impl SyncData {
    pub fn new(
        origin_timestamp: PtpTimestamp,
        receipt_timestamp: PtpTimestamp,
        correction: CorrectionField,
        clock_identity: ClockIdentity,
    ) -> Self {
        SyncData {
            clock_identity,
            correction,
            origin_timestamp,
            receipt_timestamp,
            amtlv: None,
        }
    }

    pub fn with_amtlv(mut self, data: Vec<u8>) -> Self {
        self.amtlv = Some(data);
        self
    }
}

// ============================================================================
// TIME ERROR SAMPLE
// ============================================================================

/// One time-error measurement (or one point drawn from a fitted distribution).
#[derive(Debug, Clone, PartialEq)]
pub struct TimeErrorSample {
    values: Vec<f64>,
    weight: u64,
    clock_identity: ClockIdentity,
    timestamp: Option<PtpTimestamp>,
}

impl TimeErrorSample {
    /// `weight` is the number of real devices this point stands for.
    pub fn new(values: Vec<f64>, weight: u64, clock_identity: ClockIdentity) -> Self {
        TimeErrorSample {
            values,
            weight,
            clock_identity,
            timestamp: None,
        }
    }

    /// One-dimensional offset-from-GM sample.
    pub fn offset(offset_ns: f64, weight: u64, clock_identity: ClockIdentity) -> Self {
        Self::new(vec![offset_ns], weight, clock_identity)
    }

    pub fn with_timestamp(mut self, timestamp: PtpTimestamp) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn dimensions(&self) -> usize {
        self.values.len()
    }

    pub fn weight(&self) -> u64 {
        self.weight
    }

    pub fn clock_identity(&self) -> ClockIdentity {
        self.clock_identity
    }

    pub fn timestamp(&self) -> Option<PtpTimestamp> {
        self.timestamp
    }
}

impl fmt::Display for TimeErrorSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}; {:?}ns; {} nodes", self.clock_identity, self.values, self.weight)
    }
}

// ============================================================================
// AMTLV
// ============================================================================

/// Parsed or packaged contents of one AMTLV data field.
#[derive(Debug, Clone, PartialEq)]
pub struct AmtlvData {
    weight: u64,
    clock_identity: ClockIdentity,
    timestamp: Option<PtpTimestamp>,
    samples: Vec<TimeErrorSample>,
    outliers: Vec<TimeErrorSample>,
}

impl AmtlvData {
    pub fn new(
        weight: u64,
        clock_identity: ClockIdentity,
        timestamp: Option<PtpTimestamp>,
        samples: Vec<TimeErrorSample>,
        outliers: Vec<TimeErrorSample>,
    ) -> Self {
        AmtlvData {
            weight,
            clock_identity,
            timestamp,
            samples,
            outliers,
        }
    }

    /// Aggregate device count represented by the sender.
    pub fn weight(&self) -> u64 {
        self.weight
    }

    pub fn clock_identity(&self) -> ClockIdentity {
        self.clock_identity
    }

    pub fn timestamp(&self) -> Option<PtpTimestamp> {
        self.timestamp
    }

    pub fn samples(&self) -> &[TimeErrorSample] {
        &self.samples
    }

    pub fn outliers(&self) -> &[TimeErrorSample] {
        &self.outliers
    }
}

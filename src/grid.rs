//! Bounded evaluation lattices for numeric integration over a density.

use log::debug;

use crate::error::{AggError, Result};

/// Regular grid over a box, row-major (last dimension varies fastest).
#[derive(Debug, Clone, PartialEq)]
pub struct Lattice {
    pub points: Vec<Vec<f64>>,
    /// Step actually used per dimension; may be coarser than requested.
    pub step: Vec<f64>,
}

impl Lattice {
    /// Volume of one grid cell.
    pub fn cell_volume(&self) -> f64 {
        self.step.iter().product()
    }
}

fn counts_for(lower: &[f64], upper: &[f64], step: &[f64]) -> Vec<usize> {
    lower
        .iter()
        .zip(upper)
        .zip(step)
        // float-to-int casts saturate, so only the +1 can overflow
        .map(|((lo, hi), s)| (((hi - lo) / s + 1e-9).floor() as usize).saturating_add(1))
        .collect()
}

fn total(counts: &[usize]) -> usize {
    counts.iter().fold(1usize, |acc, c| acc.saturating_mul(*c))
}

/// Lattice from `lower` to `upper` (inclusive) stepping by `base_unit`.
///
/// If that would produce more than `max_points` points, every step is scaled by the same
/// factor until it fits.
pub fn lattice(lower: &[f64], upper: &[f64], base_unit: &[f64], max_points: usize) -> Result<Lattice> {
    let dims = lower.len();
    if dims == 0 || upper.len() != dims || base_unit.len() != dims {
        return Err(AggError::DimensionMismatch {
            expected: dims,
            actual: if upper.len() != dims { upper.len() } else { base_unit.len() },
        });
    }
    if max_points == 0 {
        return Err(AggError::InvalidArgument("lattice needs room for at least 1 point".into()));
    }
    if base_unit.iter().any(|b| !b.is_finite() || *b <= 0.0) {
        return Err(AggError::InvalidArgument(format!("base unit must be positive, got {:?}", base_unit)));
    }
    if lower.iter().zip(upper).any(|(lo, hi)| !lo.is_finite() || !hi.is_finite() || hi < lo) {
        return Err(AggError::InvalidArgument(format!("invalid lattice bounds {:?}..{:?}", lower, upper)));
    }

    let mut step = base_unit.to_vec();
    let mut counts = counts_for(lower, upper, &step);
    let mut rounds = 0;
    while total(&counts) > max_points {
        let factor = (total(&counts) as f64 / max_points as f64).powf(1.0 / dims as f64).max(1.0 + 1e-6);
        for s in step.iter_mut() {
            *s *= factor;
        }
        counts = counts_for(lower, upper, &step);
        rounds += 1;
        if rounds > 64 {
            break;
        }
    }
    if total(&counts) > max_points {
        return Err(AggError::InvalidArgument(format!(
            "cannot fit {:?}..{:?} into {} lattice points",
            lower, upper, max_points
        )));
    }
    if rounds > 0 {
        debug!("[Grid] Coarsened step {:?} -> {:?} to stay within {} points", base_unit, step, max_points);
    }

    let n = total(&counts);
    let mut points = Vec::with_capacity(n);
    let mut index = vec![0usize; dims];
    for _ in 0..n {
        points.push((0..dims).map(|d| lower[d] + index[d] as f64 * step[d]).collect());
        for d in (0..dims).rev() {
            index[d] += 1;
            if index[d] < counts[d] {
                break;
            }
            index[d] = 0;
        }
    }

    Ok(Lattice { points, step })
}

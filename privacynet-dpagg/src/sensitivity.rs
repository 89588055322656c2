use serde::{Deserialize, Serialize};

use crate::errors::{DpAggError, DpAggResult};

/// Sensitivity pair derived once at construction.
///
/// `l0` bounds how many partitions a single user touches and `l_inf` bounds
/// that user's influence on any one partition.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Sensitivity {
    pub l0: u64,
    pub l_inf: f64,
}

impl Sensitivity {
    pub fn new(l0: u64, l_inf: f64) -> DpAggResult<Self> {
        let sensitivity = Self { l0, l_inf };
        sensitivity.validate()?;
        Ok(sensitivity)
    }

    /// Count sensitivity: every contribution moves the tally by one.
    pub fn for_count(
        max_partitions_contributed: u64,
        max_contributions_per_partition: u64,
    ) -> DpAggResult<Self> {
        Self::new(
            max_partitions_contributed.max(1),
            positive_limit(max_contributions_per_partition)? as f64,
        )
    }

    pub fn validate(&self) -> DpAggResult<()> {
        if self.l0 == 0 {
            return Err(DpAggError::config("l0 sensitivity must be >= 1"));
        }
        if !self.l_inf.is_finite() || self.l_inf <= 0.0 {
            return Err(DpAggError::config(format!(
                "l_inf sensitivity must be finite and > 0, got {}",
                self.l_inf
            )));
        }
        Ok(())
    }

    /// L1 norm used to calibrate Laplace noise.
    pub fn l1(&self) -> f64 {
        self.l0 as f64 * self.l_inf
    }

    /// L2 norm used to calibrate Gaussian noise.
    pub fn l2(&self) -> f64 {
        (self.l0 as f64).sqrt() * self.l_inf
    }
}

/// Sensitivity of a sum-like aggregation over values clamped to
/// `[lower, upper]`.
pub fn compute_sensitivity(
    lower: f64,
    upper: f64,
    max_partitions_contributed: u64,
    max_contributions_per_partition: u64,
) -> DpAggResult<Sensitivity> {
    validate_bounds(lower, upper)?;
    let per_partition = positive_limit(max_contributions_per_partition)? as f64;
    Sensitivity::new(
        max_partitions_contributed.max(1),
        per_partition * lower.abs().max(upper.abs()),
    )
}

pub fn validate_bounds(lower: f64, upper: f64) -> DpAggResult<()> {
    if !lower.is_finite() || !upper.is_finite() {
        return Err(DpAggError::config(format!(
            "bounds must be finite, got [{lower}, {upper}]"
        )));
    }
    if lower >= upper {
        return Err(DpAggError::config(format!(
            "lower bound {lower} must be strictly below upper bound {upper}"
        )));
    }
    if !(upper - lower).is_finite() {
        return Err(DpAggError::config("bound range overflows f64"));
    }
    Ok(())
}

pub(crate) fn positive_limit(max_contributions_per_partition: u64) -> DpAggResult<u64> {
    if max_contributions_per_partition == 0 {
        return Err(DpAggError::config(
            "max contributions per partition must be >= 1",
        ));
    }
    Ok(max_contributions_per_partition)
}

/// Saturating clamp into `[lower, upper]`. Callers drop NaN before clamping.
pub(crate) fn clamp(value: f64, lower: f64, upper: f64) -> f64 {
    value.max(lower).min(upper)
}

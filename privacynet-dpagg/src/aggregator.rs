//! The contract shared by every aggregation kind.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    accounting::DpEvent,
    codec::AggregatorKind,
    errors::{DpAggError, DpAggResult},
    noise::{self, ConfidenceInterval, NoiseMechanism},
    sensitivity::Sensitivity,
    state::AggregationState,
};

/// Streaming DP aggregation.
///
/// Implementations only mutate through `add` and `merge` while
/// [`AggregationState::Accumulating`], release at most one result, and leave
/// themselves untouched when any call fails.
pub trait Aggregator: Sized + Send {
    type Input;
    type Output;

    fn kind(&self) -> AggregatorKind;

    fn state(&self) -> AggregationState;

    fn add(&mut self, value: Self::Input) -> DpAggResult<()>;

    /// Absorbs `other`, which is left `Merged`.
    fn merge(&mut self, other: &mut Self) -> DpAggResult<()>;

    /// Noises the accumulated data and finalizes the aggregator.
    fn result_with_rng<R: RngCore + ?Sized>(&mut self, rng: &mut R) -> DpAggResult<Self::Output>;

    fn result(&mut self) -> DpAggResult<Self::Output> {
        self.result_with_rng(&mut noise::entropy_rng())
    }

    fn serialize(&mut self) -> DpAggResult<Vec<u8>>;

    fn deserialize(bytes: &[u8]) -> DpAggResult<Self>;

    /// Accounting event spent by releasing this aggregator's result.
    fn privacy_event(&self) -> DpEvent;
}

/// Budget share, sensitivity and mechanism of one noised release.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PrivacyParams {
    pub epsilon: f64,
    pub delta: f64,
    pub sensitivity: Sensitivity,
    pub noise: NoiseMechanism,
}

impl PrivacyParams {
    pub fn new(
        epsilon: f64,
        delta: f64,
        sensitivity: Sensitivity,
        noise: NoiseMechanism,
    ) -> DpAggResult<Self> {
        let params = Self {
            epsilon,
            delta,
            sensitivity,
            noise,
        };
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> DpAggResult<()> {
        self.noise.validate(self.epsilon, self.delta)?;
        self.sensitivity.validate()?;
        self.noise
            .validate_calibration(&self.sensitivity, self.epsilon, self.delta)
    }

    pub fn noise_f64<R: RngCore + ?Sized>(&self, value: f64, rng: &mut R) -> DpAggResult<f64> {
        self.noise
            .add_noise_f64(value, &self.sensitivity, self.epsilon, self.delta, rng)
    }

    pub fn noise_i64<R: RngCore + ?Sized>(&self, value: i64, rng: &mut R) -> DpAggResult<i64> {
        self.noise
            .add_noise_i64(value, &self.sensitivity, self.epsilon, self.delta, rng)
    }

    pub fn confidence_interval(&self, noised: f64, alpha: f64) -> DpAggResult<ConfidenceInterval> {
        self.noise.confidence_interval_f64(
            noised,
            &self.sensitivity,
            self.epsilon,
            self.delta,
            alpha,
        )
    }

    /// Noise multiplier of the release relative to its own sensitivity.
    pub fn privacy_event(&self) -> DpEvent {
        match self.noise {
            NoiseMechanism::Laplace => DpEvent::Laplace {
                noise_multiplier: noise::laplace_scale(&self.sensitivity, self.epsilon)
                    / self.sensitivity.l1(),
            },
            NoiseMechanism::Gaussian => DpEvent::Gaussian {
                noise_multiplier: noise::gaussian_sigma(
                    &self.sensitivity,
                    self.epsilon,
                    self.delta,
                ) / self.sensitivity.l2(),
            },
            NoiseMechanism::Identity => DpEvent::NonPrivate,
        }
    }

    /// Exact equality of every field; floats are compared bitwise-equal.
    pub(crate) fn check_compatible(&self, other: &Self, kind: AggregatorKind) -> DpAggResult<()> {
        let mismatch = if self.epsilon != other.epsilon {
            Some(format!("epsilon {} != {}", self.epsilon, other.epsilon))
        } else if self.delta != other.delta {
            Some(format!("delta {} != {}", self.delta, other.delta))
        } else if self.sensitivity.l0 != other.sensitivity.l0 {
            Some(format!(
                "l0 sensitivity {} != {}",
                self.sensitivity.l0, other.sensitivity.l0
            ))
        } else if self.sensitivity.l_inf != other.sensitivity.l_inf {
            Some(format!(
                "l_inf sensitivity {} != {}",
                self.sensitivity.l_inf, other.sensitivity.l_inf
            ))
        } else if self.noise != other.noise {
            Some(format!("noise {} != {}", self.noise, other.noise))
        } else {
            None
        };
        match mismatch {
            Some(details) => Err(reject_merge(kind, details)),
            None => Ok(()),
        }
    }
}

pub(crate) fn check_bounds_compatible(
    kind: AggregatorKind,
    (lower, upper): (f64, f64),
    (other_lower, other_upper): (f64, f64),
) -> DpAggResult<()> {
    if lower != other_lower || upper != other_upper {
        return Err(reject_merge(
            kind,
            format!("bounds [{lower}, {upper}] != [{other_lower}, {other_upper}]"),
        ));
    }
    Ok(())
}

pub(crate) fn reject_merge(kind: AggregatorKind, details: String) -> DpAggError {
    warn!(%kind, %details, "merge rejected");
    DpAggError::incompatible(details)
}

/// Budget split between the sub-releases of a composed aggregator.
pub(crate) fn split_budget(epsilon: f64, delta: f64, parts: u32) -> (f64, f64) {
    let parts = f64::from(parts);
    (epsilon / parts, delta / parts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(epsilon: f64, noise: NoiseMechanism) -> PrivacyParams {
        let delta = if noise == NoiseMechanism::Gaussian { 1e-6 } else { 0.0 };
        PrivacyParams::new(epsilon, delta, Sensitivity::new(1, 1.0).unwrap(), noise).unwrap()
    }

    #[test]
    fn compatible_params_pass() {
        let a = params(1.0, NoiseMechanism::Laplace);
        assert!(a.check_compatible(&a, AggregatorKind::Count).is_ok());
    }

    #[test]
    fn mismatches_are_reported() {
        let a = params(1.0, NoiseMechanism::Laplace);
        let err = a
            .check_compatible(&params(2.0, NoiseMechanism::Laplace), AggregatorKind::Count)
            .unwrap_err();
        assert!(matches!(err, DpAggError::MergeIncompatible(ref d) if d.contains("epsilon")));

        let err = a
            .check_compatible(&params(1.0, NoiseMechanism::Identity), AggregatorKind::Count)
            .unwrap_err();
        assert!(matches!(err, DpAggError::MergeIncompatible(ref d) if d.contains("noise")));

        assert!(
            check_bounds_compatible(AggregatorKind::BoundedSum, (0.0, 1.0), (0.0, 2.0)).is_err()
        );
    }

    #[test]
    fn release_events_follow_mechanism() {
        assert_eq!(
            params(0.5, NoiseMechanism::Laplace).privacy_event(),
            DpEvent::Laplace {
                noise_multiplier: 2.0
            }
        );
        assert_eq!(
            params(1.0, NoiseMechanism::Identity).privacy_event(),
            DpEvent::NonPrivate
        );
        match params(1.0, NoiseMechanism::Gaussian).privacy_event() {
            DpEvent::Gaussian { noise_multiplier } => {
                let expected = (2.0 * (1.25f64 / 1e-6).ln()).sqrt();
                assert!((noise_multiplier - expected).abs() < 1e-9);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn invalid_params_rejected() {
        let unit = Sensitivity::new(1, 1.0).unwrap();
        assert!(PrivacyParams::new(0.0, 0.0, unit, NoiseMechanism::Laplace).is_err());
        assert!(PrivacyParams::new(1.0, 0.1, unit, NoiseMechanism::Laplace).is_err());
        assert!(PrivacyParams::new(1.0, 0.0, unit, NoiseMechanism::Gaussian).is_err());
        let wide = Sensitivity::new(1, 1e300).unwrap();
        assert!(PrivacyParams::new(1e-10, 1e-5, wide, NoiseMechanism::Gaussian).is_err());
        assert!(PrivacyParams::new(1e-10, 0.0, wide, NoiseMechanism::Identity).is_ok());
    }

    #[test]
    fn budget_splits_evenly() {
        assert_eq!(split_budget(1.0, 1e-6, 2), (0.5, 5e-7));
    }
}

use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    accounting::DpEvent,
    aggregator::{self, Aggregator, PrivacyParams},
    codec::{self, AggregatorKind},
    errors::{DpAggError, DpAggResult},
    noise::{ConfidenceInterval, NoiseMechanism},
    sensitivity::{self, compute_sensitivity},
    state::{self, AggregationState, Operation, Transition},
};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BoundedSumOptions {
    pub epsilon: f64,
    #[serde(default)]
    pub delta: f64,
    pub lower: f64,
    pub upper: f64,
    #[serde(default = "default_limit")]
    pub max_partitions_contributed: u64,
    #[serde(default = "default_limit")]
    pub max_contributions_per_partition: u64,
    #[serde(default)]
    pub noise: NoiseMechanism,
}

pub(crate) fn default_limit() -> u64 {
    1
}

impl BoundedSumOptions {
    pub fn new(epsilon: f64, lower: f64, upper: f64) -> Self {
        Self {
            epsilon,
            delta: 0.0,
            lower,
            upper,
            max_partitions_contributed: 1,
            max_contributions_per_partition: 1,
            noise: NoiseMechanism::Laplace,
        }
    }

    pub(crate) fn params(&self) -> DpAggResult<PrivacyParams> {
        let sensitivity = compute_sensitivity(
            self.lower,
            self.upper,
            self.max_partitions_contributed,
            self.max_contributions_per_partition,
        )?;
        PrivacyParams::new(self.epsilon, self.delta, sensitivity, self.noise)
    }
}

/// Differentially private sum of contributions clamped to `[lower, upper]`.
#[derive(Debug)]
pub struct BoundedSum {
    lower: f64,
    upper: f64,
    params: PrivacyParams,
    sum: f64,
    state: AggregationState,
    released: Option<f64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct BoundedSumSnapshot {
    lower: f64,
    upper: f64,
    params: PrivacyParams,
    sum: f64,
    state: AggregationState,
}

impl BoundedSum {
    pub fn new(options: &BoundedSumOptions) -> DpAggResult<Self> {
        Ok(Self::with_params(
            options.lower,
            options.upper,
            options.params()?,
        ))
    }

    /// Caller has already validated the bounds and derived `params` from them.
    pub(crate) fn with_params(lower: f64, upper: f64, params: PrivacyParams) -> Self {
        Self {
            lower,
            upper,
            params,
            sum: 0.0,
            state: AggregationState::Accumulating,
            released: None,
        }
    }

    pub fn bounds(&self) -> (f64, f64) {
        (self.lower, self.upper)
    }

    pub fn params(&self) -> &PrivacyParams {
        &self.params
    }

    pub fn confidence_interval(&self, alpha: f64) -> DpAggResult<ConfidenceInterval> {
        let released = self.released.ok_or(DpAggError::InvalidState {
            operation: Operation::Result,
            state: self.state,
        })?;
        self.params.confidence_interval(released, alpha)
    }

    pub fn equally_initialized(&self, other: &Self) -> bool {
        self.lower == other.lower
            && self.upper == other.upper
            && self.params == other.params
            && self.state == other.state
    }

    pub(crate) fn check_merge(&self, other: &Self) -> DpAggResult<()> {
        state::check_merge_states(self.state, other.state)?;
        aggregator::check_bounds_compatible(
            AggregatorKind::BoundedSum,
            self.bounds(),
            other.bounds(),
        )?;
        self.params
            .check_compatible(&other.params, AggregatorKind::BoundedSum)
    }

    pub(crate) fn absorb(&mut self, other: &mut Self) {
        self.sum += other.sum;
        other.sum = 0.0;
        other.state = AggregationState::Merged;
    }

    pub(crate) fn set_state(&mut self, state: AggregationState) {
        self.state = state;
    }

    /// Noised value for a release, leaving the lifecycle untouched.
    pub(crate) fn draw<R: RngCore + ?Sized>(&self, rng: &mut R) -> DpAggResult<f64> {
        self.state.apply(Transition::Finalize)?;
        self.params.noise_f64(self.sum, rng)
    }

    pub(crate) fn commit_release(&mut self, noised: f64) {
        self.state = AggregationState::Finalized;
        self.released = Some(noised);
    }

    /// JSON has no encoding for an overflowed sum.
    pub(crate) fn check_encodable(&self) -> DpAggResult<()> {
        if !self.sum.is_finite() {
            return Err(DpAggError::serialization(format!(
                "bounded sum {} cannot be encoded",
                self.sum
            )));
        }
        Ok(())
    }

    pub(crate) fn snapshot(&self) -> BoundedSumSnapshot {
        BoundedSumSnapshot {
            lower: self.lower,
            upper: self.upper,
            params: self.params,
            sum: self.sum,
            state: self.state,
        }
    }

    pub(crate) fn restore(snapshot: BoundedSumSnapshot) -> DpAggResult<Self> {
        if snapshot.state != AggregationState::Serialized {
            return Err(DpAggError::serialization(format!(
                "restored bounded sum is {}, expected serialized",
                snapshot.state
            )));
        }
        sensitivity::validate_bounds(snapshot.lower, snapshot.upper)
            .and_then(|_| snapshot.params.validate())
            .map_err(|err| DpAggError::serialization(format!("restored bounded sum: {err}")))?;
        if !snapshot.sum.is_finite() {
            return Err(DpAggError::serialization("restored bounded sum is not finite"));
        }
        Ok(Self {
            lower: snapshot.lower,
            upper: snapshot.upper,
            params: snapshot.params,
            sum: snapshot.sum,
            state: snapshot.state,
            released: None,
        })
    }
}

impl Aggregator for BoundedSum {
    type Input = f64;
    type Output = f64;

    fn kind(&self) -> AggregatorKind {
        AggregatorKind::BoundedSum
    }

    fn state(&self) -> AggregationState {
        self.state
    }

    /// NaN is dropped; anything else saturates into the bounds.
    fn add(&mut self, value: f64) -> DpAggResult<()> {
        self.state = self.state.apply(Transition::Accumulate)?;
        if !value.is_nan() {
            self.sum += sensitivity::clamp(value, self.lower, self.upper);
        }
        Ok(())
    }

    fn merge(&mut self, other: &mut Self) -> DpAggResult<()> {
        self.check_merge(other)?;
        self.absorb(other);
        debug!(kind = %AggregatorKind::BoundedSum, epsilon = self.params.epsilon, "merged");
        Ok(())
    }

    fn result_with_rng<R: RngCore + ?Sized>(&mut self, rng: &mut R) -> DpAggResult<f64> {
        let noised = self.draw(rng)?;
        self.commit_release(noised);
        debug!(
            kind = %AggregatorKind::BoundedSum,
            epsilon = self.params.epsilon,
            state = %self.state,
            "released result"
        );
        Ok(noised)
    }

    fn serialize(&mut self) -> DpAggResult<Vec<u8>> {
        let previous = self.state;
        let next = previous.apply(Transition::Serialize)?;
        self.check_encodable()?;
        self.state = next;
        let encoded = codec::encode(AggregatorKind::BoundedSum, &self.snapshot());
        if encoded.is_err() {
            self.state = previous;
        } else {
            debug!(kind = %AggregatorKind::BoundedSum, epsilon = self.params.epsilon, "serialized");
        }
        encoded
    }

    fn deserialize(bytes: &[u8]) -> DpAggResult<Self> {
        Self::restore(codec::decode(AggregatorKind::BoundedSum, bytes)?)
    }

    fn privacy_event(&self) -> DpEvent {
        self.params.privacy_event()
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    fn exact(lower: f64, upper: f64) -> BoundedSum {
        BoundedSum::new(&BoundedSumOptions {
            noise: NoiseMechanism::Identity,
            ..BoundedSumOptions::new(1.0, lower, upper)
        })
        .unwrap()
    }

    #[test]
    fn construction_validates_options() {
        assert!(BoundedSum::new(&BoundedSumOptions::new(1.0, 5.0, 5.0)).is_err());
        assert!(BoundedSum::new(&BoundedSumOptions::new(0.0, 0.0, 5.0)).is_err());
        assert!(BoundedSum::new(&BoundedSumOptions {
            max_contributions_per_partition: 0,
            ..BoundedSumOptions::new(1.0, 0.0, 5.0)
        })
        .is_err());
        let sum = BoundedSum::new(&BoundedSumOptions {
            max_contributions_per_partition: 3,
            ..BoundedSumOptions::new(1.0, -2.0, 5.0)
        })
        .unwrap();
        assert_eq!(sum.params().sensitivity.l_inf, 15.0);
    }

    #[test]
    fn clamps_at_both_bounds() {
        let mut sum = exact(-1.0, 5.0);
        for value in [8.3, -7.5, 3.5, 5.0, -1.0] {
            sum.add(value).unwrap();
        }
        assert_relative_eq!(sum.result().unwrap(), 5.0 - 1.0 + 3.5 + 5.0 - 1.0);
    }

    #[test]
    fn nan_is_ignored() {
        let mut with_nan = exact(0.0, 10.0);
        let mut without = exact(0.0, 10.0);
        for value in [1.0, 2.5, 7.0] {
            with_nan.add(value).unwrap();
            with_nan.add(f64::NAN).unwrap();
            without.add(value).unwrap();
        }
        assert_eq!(with_nan.result().unwrap(), without.result().unwrap());
    }

    #[test]
    fn merge_requires_matching_bounds() {
        let mut a = exact(0.0, 10.0);
        let mut b = exact(0.0, 9.0);
        assert!(matches!(
            a.merge(&mut b).unwrap_err(),
            DpAggError::MergeIncompatible(_)
        ));
        let mut c = exact(0.0, 10.0);
        a.add(4.0).unwrap();
        c.add(6.0).unwrap();
        a.merge(&mut c).unwrap();
        assert_eq!(a.result().unwrap(), 10.0);
    }

    #[test]
    fn merge_into_finalized_is_invalid_state() {
        let mut a = exact(0.0, 10.0);
        let mut b = BoundedSum::new(&BoundedSumOptions::new(3.0, 0.0, 10.0)).unwrap();
        a.result().unwrap();
        assert!(matches!(
            a.merge(&mut b).unwrap_err(),
            DpAggError::InvalidState {
                operation: Operation::Merge,
                state: AggregationState::Finalized,
            }
        ));
        assert_eq!(b.state(), AggregationState::Accumulating);
    }

    #[test]
    fn overflowed_sum_refuses_to_serialize() {
        let mut sum = exact(0.0, 1e308);
        sum.add(1e308).unwrap();
        sum.add(1e308).unwrap();
        let err = sum.serialize().unwrap_err();
        assert!(matches!(err, DpAggError::Serialization(_)));
        assert_eq!(sum.state(), AggregationState::Accumulating);
        assert_eq!(sum.result().unwrap(), f64::INFINITY);
    }

    #[test]
    fn interval_needs_a_release() {
        let mut sum = BoundedSum::new(&BoundedSumOptions::new(1.0, 0.0, 10.0)).unwrap();
        assert!(sum.confidence_interval(0.05).is_err());
        sum.add(3.0).unwrap();
        let released = sum.result().unwrap();
        let interval = sum.confidence_interval(0.05).unwrap();
        assert_relative_eq!(interval.upper - released, 10.0 * 20f64.ln(), epsilon = 1e-9);
    }
}

//! Bounded mean as a composition of a [`Count`] and a [`BoundedSum`].
//!
//! The inner sum runs over values shifted by the midpoint of the bounds, so
//! its sensitivity only depends on half the range. Each half of the
//! composition receives half of the budget.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    accounting::DpEvent,
    aggregator::{self, Aggregator, PrivacyParams},
    codec::{self, AggregatorKind},
    count::{Count, CountOptions, CountSnapshot},
    errors::{DpAggError, DpAggResult},
    noise::NoiseMechanism,
    sensitivity::{self, compute_sensitivity},
    state::{self, AggregationState, Transition},
    sum::{default_limit, BoundedSum, BoundedSumSnapshot},
};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BoundedMeanOptions {
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

impl BoundedMeanOptions {
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
}

#[derive(Debug)]
pub struct BoundedMean {
    lower: f64,
    upper: f64,
    mid_point: f64,
    count: Count,
    normalized_sum: BoundedSum,
    state: AggregationState,
}

#[derive(Debug, Serialize, Deserialize)]
struct BoundedMeanSnapshot {
    lower: f64,
    upper: f64,
    mid_point: f64,
    count: CountSnapshot,
    normalized_sum: BoundedSumSnapshot,
    state: AggregationState,
}

fn mid_point(lower: f64, upper: f64) -> f64 {
    lower + (upper - lower) / 2.0
}

impl BoundedMean {
    pub fn new(options: &BoundedMeanOptions) -> DpAggResult<Self> {
        sensitivity::validate_bounds(options.lower, options.upper)?;
        let mid_point = mid_point(options.lower, options.upper);
        let half_range = (options.upper - options.lower) / 2.0;
        let (epsilon, delta) = aggregator::split_budget(options.epsilon, options.delta, 2);

        let sum_sensitivity = compute_sensitivity(
            -half_range,
            half_range,
            options.max_partitions_contributed,
            options.max_contributions_per_partition,
        )?;
        let sum_params = PrivacyParams::new(epsilon, delta, sum_sensitivity, options.noise)?;
        let count_params = CountOptions {
            epsilon,
            delta,
            max_partitions_contributed: options.max_partitions_contributed,
            max_contributions_per_partition: options.max_contributions_per_partition,
            noise: options.noise,
        }
        .params()?;

        Ok(Self {
            lower: options.lower,
            upper: options.upper,
            mid_point,
            count: Count::with_params(count_params),
            normalized_sum: BoundedSum::with_params(-half_range, half_range, sum_params),
            state: AggregationState::Accumulating,
        })
    }

    pub fn bounds(&self) -> (f64, f64) {
        (self.lower, self.upper)
    }

    pub fn mid_point(&self) -> f64 {
        self.mid_point
    }

    /// Same bounds, sub-aggregator configuration and lifecycle state.
    /// Accumulated data is not compared.
    pub fn equally_initialized(&self, other: &Self) -> bool {
        self.lower == other.lower
            && self.upper == other.upper
            && self.mid_point == other.mid_point
            && self.state == other.state
            && self.count.equally_initialized(&other.count)
            && self.normalized_sum.equally_initialized(&other.normalized_sum)
    }

    fn check_merge(&self, other: &Self) -> DpAggResult<()> {
        state::check_merge_states(self.state, other.state)?;
        aggregator::check_bounds_compatible(
            AggregatorKind::BoundedMean,
            self.bounds(),
            other.bounds(),
        )?;
        if self.mid_point != other.mid_point {
            return Err(aggregator::reject_merge(
                AggregatorKind::BoundedMean,
                format!("mid point {} != {}", self.mid_point, other.mid_point),
            ));
        }
        self.count.check_merge(&other.count)?;
        self.normalized_sum.check_merge(&other.normalized_sum)
    }

    fn set_state(&mut self, state: AggregationState) {
        self.state = state;
        self.count.set_state(state);
        self.normalized_sum.set_state(state);
    }

    fn restore(snapshot: BoundedMeanSnapshot) -> DpAggResult<Self> {
        if snapshot.state != AggregationState::Serialized {
            return Err(DpAggError::serialization(format!(
                "restored bounded mean is {}, expected serialized",
                snapshot.state
            )));
        }
        sensitivity::validate_bounds(snapshot.lower, snapshot.upper)
            .map_err(|err| DpAggError::serialization(format!("restored bounded mean: {err}")))?;
        if snapshot.mid_point != mid_point(snapshot.lower, snapshot.upper) {
            return Err(DpAggError::serialization(
                "restored bounded mean has an inconsistent mid point",
            ));
        }
        let count = Count::restore(snapshot.count)?;
        let normalized_sum = BoundedSum::restore(snapshot.normalized_sum)?;
        let half_range = (snapshot.upper - snapshot.lower) / 2.0;
        if normalized_sum.bounds() != (-half_range, half_range) {
            return Err(DpAggError::serialization(
                "restored bounded mean has inconsistent sum bounds",
            ));
        }
        Ok(Self {
            lower: snapshot.lower,
            upper: snapshot.upper,
            mid_point: snapshot.mid_point,
            count,
            normalized_sum,
            state: snapshot.state,
        })
    }
}

impl Aggregator for BoundedMean {
    type Input = f64;
    type Output = f64;

    fn kind(&self) -> AggregatorKind {
        AggregatorKind::BoundedMean
    }

    fn state(&self) -> AggregationState {
        self.state
    }

    fn add(&mut self, value: f64) -> DpAggResult<()> {
        self.state = self.state.apply(Transition::Accumulate)?;
        if value.is_nan() {
            return Ok(());
        }
        let clamped = sensitivity::clamp(value, self.lower, self.upper);
        self.count.add(1)?;
        self.normalized_sum.add(clamped - self.mid_point)
    }

    fn merge(&mut self, other: &mut Self) -> DpAggResult<()> {
        self.check_merge(other)?;
        self.count.absorb(&mut other.count);
        self.normalized_sum.absorb(&mut other.normalized_sum);
        other.state = AggregationState::Merged;
        debug!(
            kind = %AggregatorKind::BoundedMean,
            epsilon = self.count.params().epsilon * 2.0,
            "merged"
        );
        Ok(())
    }

    fn result_with_rng<R: RngCore + ?Sized>(&mut self, rng: &mut R) -> DpAggResult<f64> {
        let next = self.state.apply(Transition::Finalize)?;
        let noised_count = self.count.draw(rng)?;
        let noised_sum = self.normalized_sum.draw(rng)?;
        self.count.commit_release(noised_count);
        self.normalized_sum.commit_release(noised_sum);
        self.state = next;
        debug!(
            kind = %AggregatorKind::BoundedMean,
            state = %self.state,
            noised_count,
            "released result"
        );
        if noised_count <= 0 {
            return Ok(self.mid_point);
        }
        let mean = noised_sum / noised_count as f64 + self.mid_point;
        Ok(sensitivity::clamp(mean, self.lower, self.upper))
    }

    fn serialize(&mut self) -> DpAggResult<Vec<u8>> {
        let previous = self.state;
        let next = previous.apply(Transition::Serialize)?;
        self.normalized_sum.check_encodable()?;
        self.set_state(next);
        let snapshot = BoundedMeanSnapshot {
            lower: self.lower,
            upper: self.upper,
            mid_point: self.mid_point,
            count: self.count.snapshot(),
            normalized_sum: self.normalized_sum.snapshot(),
            state: self.state,
        };
        let encoded = codec::encode(AggregatorKind::BoundedMean, &snapshot);
        if encoded.is_err() {
            self.set_state(previous);
        } else {
            debug!(kind = %AggregatorKind::BoundedMean, "serialized");
        }
        encoded
    }

    fn deserialize(bytes: &[u8]) -> DpAggResult<Self> {
        Self::restore(codec::decode(AggregatorKind::BoundedMean, bytes)?)
    }

    fn privacy_event(&self) -> DpEvent {
        DpEvent::Composed(vec![
            self.count.privacy_event(),
            self.normalized_sum.privacy_event(),
        ])
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    fn exact(lower: f64, upper: f64) -> BoundedMean {
        BoundedMean::new(&BoundedMeanOptions {
            noise: NoiseMechanism::Identity,
            ..BoundedMeanOptions::new(1.0, lower, upper)
        })
        .unwrap()
    }

    #[test]
    fn budget_is_split_between_halves() {
        let mean = BoundedMean::new(&BoundedMeanOptions {
            delta: 1e-5,
            noise: NoiseMechanism::Gaussian,
            max_contributions_per_partition: 2,
            ..BoundedMeanOptions::new(1.0, -1.0, 5.0)
        })
        .unwrap();
        assert_eq!(mean.count.params().epsilon, 0.5);
        assert_eq!(mean.count.params().delta, 5e-6);
        assert_eq!(mean.normalized_sum.params().epsilon, 0.5);
        assert_eq!(mean.count.params().sensitivity.l_inf, 2.0);
        assert_eq!(mean.normalized_sum.params().sensitivity.l_inf, 6.0);
        assert_eq!(mean.mid_point(), 2.0);
    }

    #[test]
    fn empty_mean_is_mid_point() {
        let mut mean = exact(-1.0, 5.0);
        assert_eq!(mean.result().unwrap(), 2.0);
    }

    #[test]
    fn exact_mean_of_clamped_values() {
        let mut mean = exact(-1.0, 5.0);
        for value in [3.5, 8.3, -7.5] {
            mean.add(value).unwrap();
        }
        assert_relative_eq!(mean.result().unwrap(), 2.5, epsilon = 1e-12);
    }

    #[test]
    fn single_value_round_trips() {
        let mut mean = exact(-1.0, 5.0);
        mean.add(1.2345).unwrap();
        assert_relative_eq!(mean.result().unwrap(), 1.2345, epsilon = 1e-12);
    }

    #[test]
    fn result_finalizes_sub_aggregators() {
        let mut mean = exact(0.0, 2.0);
        mean.add(1.0).unwrap();
        mean.result().unwrap();
        assert_eq!(mean.state(), AggregationState::Finalized);
        assert_eq!(mean.count.state(), AggregationState::Finalized);
        assert_eq!(mean.normalized_sum.state(), AggregationState::Finalized);
    }

    #[test]
    fn failed_release_finalizes_nothing() {
        let mut mean = exact(-1.0, 5.0);
        mean.add(1.0).unwrap();
        mean.normalized_sum.set_state(AggregationState::Merged);
        assert!(matches!(
            mean.result().unwrap_err(),
            DpAggError::InvalidState { .. }
        ));
        assert_eq!(mean.state(), AggregationState::Accumulating);
        assert_eq!(mean.count.state(), AggregationState::Accumulating);
    }

    #[test]
    fn unbounded_noise_scale_is_rejected() {
        let err = BoundedMean::new(&BoundedMeanOptions {
            delta: 1e-5,
            noise: NoiseMechanism::Gaussian,
            ..BoundedMeanOptions::new(1e-10, -1e300, 1e300)
        })
        .unwrap_err();
        assert!(matches!(err, DpAggError::InvalidConfiguration(_)));
    }

    #[test]
    fn overflowed_mean_refuses_to_serialize() {
        let mut mean = exact(0.0, 1.7e308);
        for _ in 0..3 {
            mean.add(1.7e308).unwrap();
        }
        assert!(matches!(
            mean.serialize().unwrap_err(),
            DpAggError::Serialization(_)
        ));
        assert_eq!(mean.state(), AggregationState::Accumulating);
        assert_eq!(mean.count.state(), AggregationState::Accumulating);
    }

    #[test]
    fn equally_initialized_ignores_data() {
        let mut a = exact(0.0, 2.0);
        let b = exact(0.0, 2.0);
        a.add(1.5).unwrap();
        assert!(a.equally_initialized(&b));
        assert!(!a.equally_initialized(&exact(0.0, 3.0)));
        a.result().unwrap();
        assert!(!a.equally_initialized(&b));
    }

    #[test]
    fn merge_checks_sub_configuration() {
        let mut a = exact(0.0, 2.0);
        let mut b = BoundedMean::new(&BoundedMeanOptions {
            max_contributions_per_partition: 2,
            noise: NoiseMechanism::Identity,
            ..BoundedMeanOptions::new(1.0, 0.0, 2.0)
        })
        .unwrap();
        b.add(2.0).unwrap();
        assert!(matches!(
            a.merge(&mut b).unwrap_err(),
            DpAggError::MergeIncompatible(_)
        ));
        assert_eq!(b.state(), AggregationState::Accumulating);
        assert_eq!(b.result().unwrap(), 2.0);
    }
}

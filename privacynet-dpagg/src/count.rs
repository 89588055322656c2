use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    accounting::DpEvent,
    aggregator::{Aggregator, PrivacyParams},
    codec::{self, AggregatorKind},
    errors::{DpAggError, DpAggResult},
    noise::{ConfidenceInterval, NoiseMechanism},
    sensitivity::Sensitivity,
    state::{self, AggregationState, Operation, Transition},
};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct CountOptions {
    pub epsilon: f64,
    pub delta: f64,
    /// Zero means one.
    pub max_partitions_contributed: u64,
    /// Zero means one.
    pub max_contributions_per_partition: u64,
    pub noise: NoiseMechanism,
}

impl Default for CountOptions {
    fn default() -> Self {
        Self {
            epsilon: 1.0,
            delta: 0.0,
            max_partitions_contributed: 1,
            max_contributions_per_partition: 1,
            noise: NoiseMechanism::Laplace,
        }
    }
}

impl CountOptions {
    pub fn new(epsilon: f64) -> Self {
        Self {
            epsilon,
            ..Self::default()
        }
    }

    pub(crate) fn params(&self) -> DpAggResult<PrivacyParams> {
        let sensitivity = Sensitivity::for_count(
            self.max_partitions_contributed,
            self.max_contributions_per_partition.max(1),
        )?;
        PrivacyParams::new(self.epsilon, self.delta, sensitivity, self.noise)
    }
}

/// Differentially private count of contributions.
#[derive(Debug)]
pub struct Count {
    params: PrivacyParams,
    count: i64,
    state: AggregationState,
    released: Option<i64>,
}

/// Wire form of a [`Count`].
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct CountSnapshot {
    params: PrivacyParams,
    count: i64,
    state: AggregationState,
}

impl Count {
    pub fn new(options: &CountOptions) -> DpAggResult<Self> {
        Ok(Self::with_params(options.params()?))
    }

    pub(crate) fn with_params(params: PrivacyParams) -> Self {
        Self {
            params,
            count: 0,
            state: AggregationState::Accumulating,
            released: None,
        }
    }

    pub fn increment(&mut self) -> DpAggResult<()> {
        self.add(1)
    }

    pub fn params(&self) -> &PrivacyParams {
        &self.params
    }

    /// Interval around the released count with `1 - alpha` coverage,
    /// rounded outward and floored at zero.
    pub fn confidence_interval(&self, alpha: f64) -> DpAggResult<ConfidenceInterval> {
        let released = self.released.ok_or(DpAggError::InvalidState {
            operation: Operation::Result,
            state: self.state,
        })?;
        let interval = self.params.confidence_interval(released as f64, alpha)?;
        Ok(ConfidenceInterval {
            lower: interval.lower.floor().max(0.0),
            upper: interval.upper.ceil().max(0.0),
        })
    }

    /// Same configuration and lifecycle state; accumulated data is ignored.
    pub fn equally_initialized(&self, other: &Self) -> bool {
        self.params == other.params && self.state == other.state
    }

    pub(crate) fn check_merge(&self, other: &Self) -> DpAggResult<()> {
        state::check_merge_states(self.state, other.state)?;
        self.params.check_compatible(&other.params, AggregatorKind::Count)
    }

    pub(crate) fn absorb(&mut self, other: &mut Self) {
        self.count = self.count.saturating_add(other.count);
        other.count = 0;
        other.state = AggregationState::Merged;
    }

    pub(crate) fn set_state(&mut self, state: AggregationState) {
        self.state = state;
    }

    /// Noised value for a release, leaving the lifecycle untouched.
    pub(crate) fn draw<R: RngCore + ?Sized>(&self, rng: &mut R) -> DpAggResult<i64> {
        self.state.apply(Transition::Finalize)?;
        self.params.noise_i64(self.count, rng)
    }

    pub(crate) fn commit_release(&mut self, noised: i64) {
        self.state = AggregationState::Finalized;
        self.released = Some(noised);
    }
}

impl Aggregator for Count {
    type Input = i64;
    type Output = i64;

    fn kind(&self) -> AggregatorKind {
        AggregatorKind::Count
    }

    fn state(&self) -> AggregationState {
        self.state
    }

    fn add(&mut self, value: i64) -> DpAggResult<()> {
        self.state = self.state.apply(Transition::Accumulate)?;
        self.count = self.count.saturating_add(value);
        Ok(())
    }

    fn merge(&mut self, other: &mut Self) -> DpAggResult<()> {
        self.check_merge(other)?;
        self.absorb(other);
        debug!(kind = %AggregatorKind::Count, epsilon = self.params.epsilon, "merged");
        Ok(())
    }

    fn result_with_rng<R: RngCore + ?Sized>(&mut self, rng: &mut R) -> DpAggResult<i64> {
        let noised = self.draw(rng)?;
        self.commit_release(noised);
        debug!(
            kind = %AggregatorKind::Count,
            epsilon = self.params.epsilon,
            state = %self.state,
            "released result"
        );
        Ok(noised)
    }

    fn serialize(&mut self) -> DpAggResult<Vec<u8>> {
        let previous = self.state;
        self.state = previous.apply(Transition::Serialize)?;
        let encoded = codec::encode(AggregatorKind::Count, &self.snapshot());
        if encoded.is_err() {
            self.state = previous;
        } else {
            debug!(kind = %AggregatorKind::Count, epsilon = self.params.epsilon, "serialized");
        }
        encoded
    }

    fn deserialize(bytes: &[u8]) -> DpAggResult<Self> {
        Self::restore(codec::decode(AggregatorKind::Count, bytes)?)
    }

    fn privacy_event(&self) -> DpEvent {
        self.params.privacy_event()
    }
}

impl Count {
    pub(crate) fn snapshot(&self) -> CountSnapshot {
        CountSnapshot {
            params: self.params,
            count: self.count,
            state: self.state,
        }
    }

    pub(crate) fn restore(snapshot: CountSnapshot) -> DpAggResult<Self> {
        if snapshot.state != AggregationState::Serialized {
            return Err(DpAggError::serialization(format!(
                "restored count is {}, expected serialized",
                snapshot.state
            )));
        }
        snapshot
            .params
            .validate()
            .map_err(|err| DpAggError::serialization(format!("restored count: {err}")))?;
        Ok(Self {
            params: snapshot.params,
            count: snapshot.count,
            state: snapshot.state,
            released: None,
        })
    }
}

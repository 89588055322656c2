//! Bounded quantiles over a noised count tree.
//!
//! The value range is split into `branching_factor ^ tree_height` equal
//! leaves. Each contribution increments every node on its leaf-to-root path,
//! so a user touches at most `tree_height` nodes per partition. Ranks are
//! answered by descending from the root along noised child counts.
//!
//! Node indices are implicit: the root is `0` and the children of `i` are
//! `i * b + 1 ..= i * b + b`. Only non-zero counts are stored.

use std::collections::{BTreeMap, HashMap};

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    accounting::DpEvent,
    aggregator::{self, Aggregator, PrivacyParams},
    codec::{self, AggregatorKind},
    errors::{DpAggError, DpAggResult},
    noise::{self, NoiseMechanism},
    sensitivity::{self, positive_limit, Sensitivity},
    state::{self, AggregationState, Transition},
    sum::default_limit,
};

pub const DEFAULT_TREE_HEIGHT: u32 = 4;
pub const DEFAULT_BRANCHING_FACTOR: u32 = 16;
pub const MAX_LEAVES: u64 = 1 << 24;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BoundedQuantilesOptions {
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
    #[serde(default = "default_tree_height")]
    pub tree_height: u32,
    #[serde(default = "default_branching_factor")]
    pub branching_factor: u32,
}

fn default_tree_height() -> u32 {
    DEFAULT_TREE_HEIGHT
}

fn default_branching_factor() -> u32 {
    DEFAULT_BRANCHING_FACTOR
}

impl BoundedQuantilesOptions {
    pub fn new(epsilon: f64, lower: f64, upper: f64) -> Self {
        Self {
            epsilon,
            delta: 0.0,
            lower,
            upper,
            max_partitions_contributed: 1,
            max_contributions_per_partition: 1,
            noise: NoiseMechanism::Laplace,
            tree_height: DEFAULT_TREE_HEIGHT,
            branching_factor: DEFAULT_BRANCHING_FACTOR,
        }
    }
}

/// Shape of the count tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeShape {
    pub height: u32,
    pub branching_factor: u32,
}

impl TreeShape {
    pub fn new(height: u32, branching_factor: u32) -> DpAggResult<Self> {
        let shape = Self {
            height,
            branching_factor,
        };
        shape.validate()?;
        Ok(shape)
    }

    pub fn validate(&self) -> DpAggResult<()> {
        if self.height < 1 {
            return Err(DpAggError::config("tree height must be >= 1"));
        }
        if self.branching_factor < 2 {
            return Err(DpAggError::config("branching factor must be >= 2"));
        }
        match u64::from(self.branching_factor).checked_pow(self.height) {
            Some(leaves) if leaves <= MAX_LEAVES => Ok(()),
            _ => Err(DpAggError::config(format!(
                "{}^{} leaves exceed the supported maximum of {MAX_LEAVES}",
                self.branching_factor, self.height
            ))),
        }
    }

    pub fn leaves(&self) -> u64 {
        self.level_width(self.height)
    }

    fn level_width(&self, depth: u32) -> u64 {
        u64::from(self.branching_factor).pow(depth)
    }

    /// Index of the first node at `depth`.
    fn level_start(&self, depth: u32) -> u64 {
        (self.level_width(depth) - 1) / (u64::from(self.branching_factor) - 1)
    }

    fn node_count(&self) -> u64 {
        self.level_start(self.height + 1)
    }

    fn parent(&self, index: u64) -> u64 {
        (index - 1) / u64::from(self.branching_factor)
    }

    fn first_child(&self, index: u64) -> u64 {
        index * u64::from(self.branching_factor) + 1
    }
}

#[derive(Debug)]
pub struct BoundedQuantiles {
    lower: f64,
    upper: f64,
    shape: TreeShape,
    params: PrivacyParams,
    counts: BTreeMap<u64, i64>,
    state: AggregationState,
}

#[derive(Debug, Serialize, Deserialize)]
struct BoundedQuantilesSnapshot {
    lower: f64,
    upper: f64,
    shape: TreeShape,
    params: PrivacyParams,
    counts: BTreeMap<u64, i64>,
    state: AggregationState,
}

impl BoundedQuantiles {
    pub fn new(options: &BoundedQuantilesOptions) -> DpAggResult<Self> {
        sensitivity::validate_bounds(options.lower, options.upper)?;
        let shape = TreeShape::new(options.tree_height, options.branching_factor)?;
        let per_partition = positive_limit(options.max_contributions_per_partition)?;
        let partitions = options.max_partitions_contributed.max(1);
        let l0 = partitions
            .checked_mul(u64::from(shape.height))
            .ok_or_else(|| DpAggError::config("l0 sensitivity overflows u64"))?;
        let sensitivity = Sensitivity::new(l0, per_partition as f64)?;
        let params =
            PrivacyParams::new(options.epsilon, options.delta, sensitivity, options.noise)?;
        Ok(Self {
            lower: options.lower,
            upper: options.upper,
            shape,
            params,
            counts: BTreeMap::new(),
            state: AggregationState::Accumulating,
        })
    }

    pub fn bounds(&self) -> (f64, f64) {
        (self.lower, self.upper)
    }

    pub fn shape(&self) -> TreeShape {
        self.shape
    }

    pub fn params(&self) -> &PrivacyParams {
        &self.params
    }

    /// Finalizes and answers a single rank.
    pub fn quantile(&mut self, rank: f64) -> DpAggResult<f64> {
        self.quantile_with_rng(rank, &mut noise::entropy_rng())
    }

    pub fn quantile_with_rng<R: RngCore + ?Sized>(
        &mut self,
        rank: f64,
        rng: &mut R,
    ) -> DpAggResult<f64> {
        check_rank(rank)?;
        self.result_with_rng(rng)?.quantile(rank)
    }

    pub fn equally_initialized(&self, other: &Self) -> bool {
        self.lower == other.lower
            && self.upper == other.upper
            && self.shape == other.shape
            && self.params == other.params
            && self.state == other.state
    }

    fn leaf_for(&self, value: f64) -> u64 {
        let leaves = self.shape.leaves();
        let clamped = sensitivity::clamp(value, self.lower, self.upper);
        let fraction = (clamped - self.lower) / (self.upper - self.lower);
        let leaf = (fraction * leaves as f64).floor() as u64;
        self.shape.level_start(self.shape.height) + leaf.min(leaves - 1)
    }

    fn check_merge(&self, other: &Self) -> DpAggResult<()> {
        state::check_merge_states(self.state, other.state)?;
        aggregator::check_bounds_compatible(
            AggregatorKind::BoundedQuantiles,
            self.bounds(),
            other.bounds(),
        )?;
        if self.shape != other.shape {
            return Err(aggregator::reject_merge(
                AggregatorKind::BoundedQuantiles,
                format!(
                    "tree shape {}^{} != {}^{}",
                    self.shape.branching_factor,
                    self.shape.height,
                    other.shape.branching_factor,
                    other.shape.height
                ),
            ));
        }
        self.params
            .check_compatible(&other.params, AggregatorKind::BoundedQuantiles)
    }

    fn restore(snapshot: BoundedQuantilesSnapshot) -> DpAggResult<Self> {
        let invalid = |err: DpAggError| {
            DpAggError::serialization(format!("restored bounded quantiles: {err}"))
        };
        if snapshot.state != AggregationState::Serialized {
            return Err(DpAggError::serialization(format!(
                "restored bounded quantiles is {}, expected serialized",
                snapshot.state
            )));
        }
        sensitivity::validate_bounds(snapshot.lower, snapshot.upper).map_err(invalid)?;
        snapshot.shape.validate().map_err(invalid)?;
        snapshot.params.validate().map_err(invalid)?;
        let nodes = snapshot.shape.node_count();
        if let Some(index) = snapshot
            .counts
            .keys()
            .copied()
            .find(|&index| index == 0 || index >= nodes)
        {
            return Err(DpAggError::serialization(format!(
                "restored bounded quantiles has node {index} outside the tree"
            )));
        }
        Ok(Self {
            lower: snapshot.lower,
            upper: snapshot.upper,
            shape: snapshot.shape,
            params: snapshot.params,
            counts: snapshot.counts,
            state: snapshot.state,
        })
    }
}

impl Aggregator for BoundedQuantiles {
    type Input = f64;
    type Output = NoisedQuantileTree;

    fn kind(&self) -> AggregatorKind {
        AggregatorKind::BoundedQuantiles
    }

    fn state(&self) -> AggregationState {
        self.state
    }

    fn add(&mut self, value: f64) -> DpAggResult<()> {
        self.state = self.state.apply(Transition::Accumulate)?;
        if value.is_nan() {
            return Ok(());
        }
        let mut index = self.leaf_for(value);
        while index != 0 {
            let count = self.counts.entry(index).or_insert(0);
            *count = count.saturating_add(1);
            index = self.shape.parent(index);
        }
        Ok(())
    }

    fn merge(&mut self, other: &mut Self) -> DpAggResult<()> {
        self.check_merge(other)?;
        for (index, count) in std::mem::take(&mut other.counts) {
            let target = self.counts.entry(index).or_insert(0);
            *target = target.saturating_add(count);
        }
        other.state = AggregationState::Merged;
        debug!(
            kind = %AggregatorKind::BoundedQuantiles,
            epsilon = self.params.epsilon,
            nodes = self.counts.len(),
            "merged"
        );
        Ok(())
    }

    fn result_with_rng<R: RngCore + ?Sized>(
        &mut self,
        rng: &mut R,
    ) -> DpAggResult<NoisedQuantileTree> {
        self.state = self.state.apply(Transition::Finalize)?;
        let mut seed = [0u8; 32];
        rng.fill_bytes(&mut seed);
        debug!(
            kind = %AggregatorKind::BoundedQuantiles,
            epsilon = self.params.epsilon,
            state = %self.state,
            "released result"
        );
        Ok(NoisedQuantileTree {
            lower: self.lower,
            upper: self.upper,
            shape: self.shape,
            params: self.params,
            counts: std::mem::take(&mut self.counts),
            rng: ChaCha20Rng::from_seed(seed),
            noised: HashMap::new(),
        })
    }

    fn serialize(&mut self) -> DpAggResult<Vec<u8>> {
        let previous = self.state;
        self.state = previous.apply(Transition::Serialize)?;
        let snapshot = BoundedQuantilesSnapshot {
            lower: self.lower,
            upper: self.upper,
            shape: self.shape,
            params: self.params,
            counts: self.counts.clone(),
            state: self.state,
        };
        let encoded = codec::encode(AggregatorKind::BoundedQuantiles, &snapshot);
        if encoded.is_err() {
            self.state = previous;
        } else {
            debug!(
                kind = %AggregatorKind::BoundedQuantiles,
                epsilon = self.params.epsilon,
                nodes = self.counts.len(),
                "serialized"
            );
        }
        encoded
    }

    fn deserialize(bytes: &[u8]) -> DpAggResult<Self> {
        Self::restore(codec::decode(AggregatorKind::BoundedQuantiles, bytes)?)
    }

    fn privacy_event(&self) -> DpEvent {
        self.params.privacy_event()
    }
}

/// Released quantile tree.
///
/// Node counts are noised on first use and cached, so every rank query is
/// post-processing of one noised tree and may be repeated freely.
#[derive(Debug)]
pub struct NoisedQuantileTree {
    lower: f64,
    upper: f64,
    shape: TreeShape,
    params: PrivacyParams,
    counts: BTreeMap<u64, i64>,
    rng: ChaCha20Rng,
    noised: HashMap<u64, f64>,
}

impl NoisedQuantileTree {
    pub fn bounds(&self) -> (f64, f64) {
        (self.lower, self.upper)
    }

    /// Value below which roughly `rank` of the contributions fall. Ranks
    /// outside `[0, 1]` are clamped.
    pub fn quantile(&mut self, rank: f64) -> DpAggResult<f64> {
        check_rank(rank)?;
        let branching = self.shape.branching_factor as usize;
        let mut rank = rank.clamp(0.0, 1.0);
        let mut index = 0u64;
        let mut depth = 0u32;
        let mut position = 0u64;
        let mut children = Vec::with_capacity(branching);

        while depth < self.shape.height {
            let first_child = self.shape.first_child(index);
            children.clear();
            for offset in 0..branching as u64 {
                children.push(self.noised_count(first_child + offset)?.max(0.0));
            }
            let total: f64 = children.iter().sum();
            if total <= 0.0 {
                break;
            }

            let target = rank * total;
            let mut cumulative = 0.0;
            let mut last_positive = 0;
            let mut chosen = None;
            for (offset, &count) in children.iter().enumerate() {
                if count <= 0.0 {
                    continue;
                }
                last_positive = offset;
                if cumulative + count >= target {
                    chosen = Some((offset, ((target - cumulative) / count).clamp(0.0, 1.0)));
                    break;
                }
                cumulative += count;
            }
            // Rounding can leave the target just past the last child.
            let (offset, child_rank) = chosen.unwrap_or((last_positive, 1.0));

            index = first_child + offset as u64;
            position = position * branching as u64 + offset as u64;
            rank = child_rank;
            depth += 1;
        }

        let width = (self.upper - self.lower) / self.shape.level_width(depth) as f64;
        let value = self.lower + (position as f64 + rank) * width;
        Ok(sensitivity::clamp(value, self.lower, self.upper))
    }

    pub fn min(&mut self) -> DpAggResult<f64> {
        self.quantile(0.0)
    }

    pub fn max(&mut self) -> DpAggResult<f64> {
        self.quantile(1.0)
    }

    pub fn median(&mut self) -> DpAggResult<f64> {
        self.quantile(0.5)
    }

    fn noised_count(&mut self, index: u64) -> DpAggResult<f64> {
        if let Some(&noised) = self.noised.get(&index) {
            return Ok(noised);
        }
        let raw = self.counts.get(&index).copied().unwrap_or(0);
        let noised = self.params.noise_f64(raw as f64, &mut self.rng)?;
        self.noised.insert(index, noised);
        Ok(noised)
    }
}

fn check_rank(rank: f64) -> DpAggResult<()> {
    if rank.is_nan() {
        return Err(DpAggError::config("quantile rank must not be NaN"));
    }
    Ok(())
}

//! Empirical (ε, δ) closeness check.
//!
//! Fresh aggregators are fed a dataset and its neighbor, released many times,
//! and the two output distributions are compared bucket by bucket. Each
//! bucket probability is widened by a Hoeffding slack before testing
//! `P[D ∈ B] ≤ e^ε · P[D' ∈ B] + δ` in both directions, so a correct
//! mechanism fails only with the configured failure probability.

use privacynet_dpagg::{Aggregator, DpAggResult};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    config::TesterConfig,
    dataset::NeighboringDatasets,
    errors::{TesterError, TesterResult},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    /// Original dataset more likely than the neighbor allows.
    OriginalOverNeighbor,
    NeighborOverOriginal,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BucketViolation {
    pub bucket: usize,
    pub lower: f64,
    pub upper: f64,
    pub original_probability: f64,
    pub neighbor_probability: f64,
    pub direction: Direction,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClosenessReport {
    pub epsilon: f64,
    pub delta: f64,
    pub samples_per_dataset: usize,
    pub slack: f64,
    pub violations: Vec<BucketViolation>,
    pub passed: bool,
}

#[derive(Clone, Debug)]
pub struct StochasticTester {
    config: TesterConfig,
}

impl StochasticTester {
    pub fn new(config: TesterConfig) -> TesterResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &TesterConfig {
        &self.config
    }

    /// Checks that releases of aggregators built by `factory` are
    /// (`epsilon`, `delta`)-close on `datasets`. `project` maps each released
    /// output to the scalar that is histogrammed.
    pub fn run<A, F, P>(
        &self,
        datasets: &NeighboringDatasets<A::Input>,
        epsilon: f64,
        delta: f64,
        factory: F,
        project: P,
    ) -> TesterResult<ClosenessReport>
    where
        A: Aggregator,
        A::Input: Clone,
        F: Fn() -> DpAggResult<A>,
        P: Fn(A::Output) -> DpAggResult<f64>,
    {
        if !(epsilon >= 0.0) || !epsilon.is_finite() || !(0.0..=1.0).contains(&delta) {
            return Err(TesterError::InvalidConfig(format!(
                "claimed guarantee (epsilon={epsilon}, delta={delta}) is not testable"
            )));
        }
        let mut seeds = ChaCha20Rng::seed_from_u64(self.config.seed);
        let original = self.sample::<A, F, P>(&datasets.original, &mut seeds, &factory, &project)?;
        let neighbor = self.sample::<A, F, P>(&datasets.neighbor, &mut seeds, &factory, &project)?;

        let histogram = Histogram::shared(&original, &neighbor, self.config.buckets);
        let slack = self.config.slack();
        let bound = epsilon.exp();
        let total = self.config.samples_per_dataset as f64;

        let mut violations = Vec::new();
        for bucket in 0..histogram.buckets() {
            let p = histogram.original[bucket] as f64 / total;
            let q = histogram.neighbor[bucket] as f64 / total;
            let (lower, upper) = histogram.range(bucket);
            for (direction, a, b) in [
                (Direction::OriginalOverNeighbor, p, q),
                (Direction::NeighborOverOriginal, q, p),
            ] {
                if a - slack > bound * (b + slack) + delta {
                    violations.push(BucketViolation {
                        bucket,
                        lower,
                        upper,
                        original_probability: p,
                        neighbor_probability: q,
                        direction,
                    });
                }
            }
        }

        let passed = violations.is_empty();
        info!(
            epsilon,
            delta,
            samples = self.config.samples_per_dataset,
            violations = violations.len(),
            passed,
            "stochastic closeness verdict"
        );
        Ok(ClosenessReport {
            epsilon,
            delta,
            samples_per_dataset: self.config.samples_per_dataset,
            slack,
            violations,
            passed,
        })
    }

    fn sample<A, F, P>(
        &self,
        records: &[A::Input],
        seeds: &mut ChaCha20Rng,
        factory: &F,
        project: &P,
    ) -> TesterResult<Vec<f64>>
    where
        A: Aggregator,
        A::Input: Clone,
        F: Fn() -> DpAggResult<A>,
        P: Fn(A::Output) -> DpAggResult<f64>,
    {
        let mut outputs = Vec::with_capacity(self.config.samples_per_dataset);
        for run in 0..self.config.samples_per_dataset {
            let mut aggregator = factory()?;
            for record in records {
                aggregator.add(record.clone())?;
            }
            let mut rng = ChaCha20Rng::seed_from_u64(seeds.next_u64());
            let value = project(aggregator.result_with_rng(&mut rng)?)?;
            if !value.is_finite() {
                return Err(TesterError::NonFiniteOutput { run, value });
            }
            outputs.push(value);
        }
        debug!(records = records.len(), runs = outputs.len(), "sampled releases");
        Ok(outputs)
    }
}

/// Counts of both samples over one set of equal-width buckets.
#[derive(Debug)]
struct Histogram {
    min: f64,
    width: f64,
    original: Vec<u64>,
    neighbor: Vec<u64>,
}

impl Histogram {
    fn shared(original: &[f64], neighbor: &[f64], buckets: usize) -> Self {
        let (min, max) = original
            .iter()
            .chain(neighbor)
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &value| {
                (lo.min(value), hi.max(value))
            });
        // A constant sample collapses into a single bucket.
        let (buckets, width) = if max > min {
            (buckets, (max - min) / buckets as f64)
        } else {
            (1, 1.0)
        };
        let mut histogram = Self {
            min,
            width,
            original: vec![0; buckets],
            neighbor: vec![0; buckets],
        };
        for &value in original {
            let bucket = histogram.bucket_of(value);
            histogram.original[bucket] += 1;
        }
        for &value in neighbor {
            let bucket = histogram.bucket_of(value);
            histogram.neighbor[bucket] += 1;
        }
        histogram
    }

    fn buckets(&self) -> usize {
        self.original.len()
    }

    fn bucket_of(&self, value: f64) -> usize {
        let index = ((value - self.min) / self.width).floor() as usize;
        index.min(self.buckets() - 1)
    }

    fn range(&self, bucket: usize) -> (f64, f64) {
        let lower = self.min + bucket as f64 * self.width;
        (lower, lower + self.width)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram_shares_edges() {
        let histogram = Histogram::shared(&[0.0, 1.0, 2.0], &[3.0, 4.0], 4);
        assert_eq!(histogram.buckets(), 4);
        assert_eq!(histogram.original, vec![1, 1, 1, 0]);
        // The maximum lands in the last bucket.
        assert_eq!(histogram.neighbor, vec![0, 0, 0, 2]);
        assert_eq!(histogram.range(3), (3.0, 4.0));
    }

    #[test]
    fn constant_samples_use_one_bucket() {
        let histogram = Histogram::shared(&[2.0, 2.0], &[2.0], 10);
        assert_eq!(histogram.buckets(), 1);
        assert_eq!(histogram.original, vec![2]);
        assert_eq!(histogram.neighbor, vec![1]);
    }
}

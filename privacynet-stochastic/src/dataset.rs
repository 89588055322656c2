use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

use crate::errors::{TesterError, TesterResult};

/// A dataset and a neighbor that differs by exactly one record.
#[derive(Clone, Debug, PartialEq)]
pub struct NeighboringDatasets<T> {
    pub original: Vec<T>,
    pub neighbor: Vec<T>,
}

impl<T: Clone> NeighboringDatasets<T> {
    /// Neighbor obtained by dropping the record at `index`.
    pub fn removing(original: Vec<T>, index: usize) -> TesterResult<Self> {
        if index >= original.len() {
            return Err(TesterError::InvalidConfig(format!(
                "cannot remove record {index} from a dataset of {}",
                original.len()
            )));
        }
        let mut neighbor = original.clone();
        neighbor.remove(index);
        Ok(Self { original, neighbor })
    }

    /// Neighbor obtained by appending `extra`.
    pub fn adding(original: Vec<T>, extra: T) -> Self {
        let mut neighbor = original.clone();
        neighbor.push(extra);
        Self { original, neighbor }
    }
}

impl<T> NeighboringDatasets<T> {
    pub fn map<U>(self, mut f: impl FnMut(T) -> U) -> NeighboringDatasets<U> {
        NeighboringDatasets {
            original: self.original.into_iter().map(&mut f).collect(),
            neighbor: self.neighbor.into_iter().map(&mut f).collect(),
        }
    }
}

/// Seeded generator of uniform datasets.
#[derive(Debug)]
pub struct DatasetGenerator {
    rng: ChaCha20Rng,
}

impl DatasetGenerator {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha20Rng::seed_from_u64(seed),
        }
    }

    pub fn uniform(&mut self, len: usize, lower: f64, upper: f64) -> TesterResult<Vec<f64>> {
        if !(lower < upper) || !(upper - lower).is_finite() {
            return Err(TesterError::InvalidConfig(format!(
                "dataset range [{lower}, {upper}) is empty or unbounded"
            )));
        }
        Ok((0..len).map(|_| self.rng.gen_range(lower..upper)).collect())
    }

    /// Uniform dataset of `len` records and the neighbor without one of them.
    pub fn neighbors(
        &mut self,
        len: usize,
        lower: f64,
        upper: f64,
    ) -> TesterResult<NeighboringDatasets<f64>> {
        if len == 0 {
            return Err(TesterError::InvalidConfig(
                "neighboring datasets need at least one record".into(),
            ));
        }
        let original = self.uniform(len, lower, upper)?;
        let index = self.rng.gen_range(0..len);
        NeighboringDatasets::removing(original, index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn neighbor_drops_one_record() {
        let mut generator = DatasetGenerator::new(1);
        let datasets = generator.neighbors(50, -1.0, 1.0).unwrap();
        assert_eq!(datasets.original.len(), 50);
        assert_eq!(datasets.neighbor.len(), 49);
        assert!(datasets
            .original
            .iter()
            .all(|value| (-1.0..1.0).contains(value)));
        assert!(datasets
            .neighbor
            .iter()
            .all(|value| datasets.original.contains(value)));
    }

    #[test]
    fn same_seed_same_data() {
        let a = DatasetGenerator::new(9).uniform(10, 0.0, 5.0).unwrap();
        let b = DatasetGenerator::new(9).uniform(10, 0.0, 5.0).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn map_and_add() {
        let datasets = NeighboringDatasets::adding(vec![1.5, 2.5], 3.5).map(|_| 1i64);
        assert_eq!(datasets.original, vec![1, 1]);
        assert_eq!(datasets.neighbor, vec![1, 1, 1]);
        assert!(NeighboringDatasets::removing(Vec::<f64>::new(), 0).is_err());
        assert!(DatasetGenerator::new(0).uniform(3, 1.0, 1.0).is_err());
    }
}

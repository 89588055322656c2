use serde::{Deserialize, Serialize};

use crate::errors::{TesterError, TesterResult};

const fn default_samples_per_dataset() -> usize {
    2_000
}

const fn default_buckets() -> usize {
    20
}

const fn default_failure_probability() -> f64 {
    1e-3
}

const fn default_seed() -> u64 {
    0x5eed
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TesterConfig {
    /// Releases drawn from each of the two neighboring datasets.
    #[serde(default = "default_samples_per_dataset")]
    pub samples_per_dataset: usize,
    #[serde(default = "default_buckets")]
    pub buckets: usize,
    /// Probability that sampling error alone reports a violation.
    #[serde(default = "default_failure_probability")]
    pub failure_probability: f64,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for TesterConfig {
    fn default() -> Self {
        Self {
            samples_per_dataset: default_samples_per_dataset(),
            buckets: default_buckets(),
            failure_probability: default_failure_probability(),
            seed: default_seed(),
        }
    }
}

impl TesterConfig {
    pub fn validate(&self) -> TesterResult<()> {
        if self.samples_per_dataset == 0 {
            return Err(TesterError::InvalidConfig(
                "samples per dataset must be > 0".into(),
            ));
        }
        if self.buckets == 0 {
            return Err(TesterError::InvalidConfig("buckets must be > 0".into()));
        }
        if !(self.failure_probability > 0.0 && self.failure_probability < 1.0) {
            return Err(TesterError::InvalidConfig(format!(
                "failure probability must be within (0, 1), got {}",
                self.failure_probability
            )));
        }
        Ok(())
    }

    /// Hoeffding deviation bound that holds for every estimated bucket
    /// probability at once with probability `1 - failure_probability`.
    pub fn slack(&self) -> f64 {
        let estimates = 2.0 * self.buckets as f64;
        ((2.0 * estimates / self.failure_probability).ln()
            / (2.0 * self.samples_per_dataset as f64))
            .sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = TesterConfig::default();
        config.validate().unwrap();
        assert_eq!(config.samples_per_dataset, 2_000);
        let slack = config.slack();
        assert!(slack > 0.05 && slack < 0.06, "slack {slack}");
    }

    #[test]
    fn rejects_degenerate_settings() {
        for config in [
            TesterConfig {
                samples_per_dataset: 0,
                ..TesterConfig::default()
            },
            TesterConfig {
                buckets: 0,
                ..TesterConfig::default()
            },
            TesterConfig {
                failure_probability: 1.0,
                ..TesterConfig::default()
            },
        ] {
            assert!(matches!(
                config.validate(),
                Err(TesterError::InvalidConfig(_))
            ));
        }
    }
}

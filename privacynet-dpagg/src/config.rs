//! Aggregation settings loaded from TOML or YAML.
//!
//! ```toml
//! [mean]
//! epsilon = 1.0
//! lower = -1.0
//! upper = 5.0
//! max-contributions-per-partition = 2
//! noise = "laplace"
//! ```

use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    count::{Count, CountOptions},
    errors::DpAggError,
    mean::{BoundedMean, BoundedMeanOptions},
    quantiles::{BoundedQuantiles, BoundedQuantilesOptions},
    sum::{BoundedSum, BoundedSumOptions},
};

/// Syntax of an aggregation settings file. `Auto` goes by file extension.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConfigFormat {
    Auto,
    Toml,
    Yaml,
}

impl fmt::Display for ConfigFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Toml => write!(f, "toml"),
            Self::Yaml => write!(f, "yaml"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read aggregation settings from {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("aggregation settings are not valid {format}: {details}")]
    Parse {
        format: ConfigFormat,
        details: String,
    },
    #[error("aggregation settings rejected by aggregator constructor: {0}")]
    Validation(#[from] DpAggError),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AggregationConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<CountOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sum: Option<BoundedSumOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mean: Option<BoundedMeanOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantiles: Option<BoundedQuantilesOptions>,
}

impl AggregationConfig {
    /// Builds every configured aggregator once and discards it.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(options) = &self.count {
            Count::new(options)?;
        }
        if let Some(options) = &self.sum {
            BoundedSum::new(options)?;
        }
        if let Some(options) = &self.mean {
            BoundedMean::new(options)?;
        }
        if let Some(options) = &self.quantiles {
            BoundedQuantiles::new(options)?;
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.count.is_none()
            && self.sum.is_none()
            && self.mean.is_none()
            && self.quantiles.is_none()
    }

    pub fn sample() -> Self {
        Self {
            count: Some(CountOptions::new(1.0)),
            sum: Some(BoundedSumOptions::new(1.0, 0.0, 100.0)),
            mean: Some(BoundedMeanOptions::new(1.0, -1.0, 5.0)),
            quantiles: Some(BoundedQuantilesOptions::new(1.0, 0.0, 200.0)),
        }
    }
}

pub fn load_config(path: &Path, format: ConfigFormat) -> Result<AggregationConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let config = parse_config(&contents, resolve_format(path, format))?;
    config.validate()?;
    Ok(config)
}

/// Parses without validating. `Auto` is treated as TOML.
pub fn parse_config(
    contents: &str,
    format: ConfigFormat,
) -> Result<AggregationConfig, ConfigError> {
    match format {
        ConfigFormat::Toml | ConfigFormat::Auto => {
            toml::from_str(contents).map_err(|err| ConfigError::Parse {
                format: ConfigFormat::Toml,
                details: err.to_string(),
            })
        }
        ConfigFormat::Yaml => serde_yaml::from_str(contents).map_err(|err| ConfigError::Parse {
            format,
            details: err.to_string(),
        }),
    }
}

fn resolve_format(path: &Path, format: ConfigFormat) -> ConfigFormat {
    match format {
        ConfigFormat::Auto => match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => ConfigFormat::Yaml,
            _ => ConfigFormat::Toml,
        },
        _ => format,
    }
}

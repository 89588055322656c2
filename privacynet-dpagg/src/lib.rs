//! PrivacyNet DP aggregations – streaming count, bounded sum, bounded mean
//! and quantile-tree aggregators whose released results are calibrated to a
//! declared sensitivity and (ε, δ) budget. Every aggregator follows the same
//! lifecycle (accumulate, merge, serialize, finalize) and releases at most one
//! noised result, so partial aggregators can be built on independent workers
//! and combined without double counting.

pub mod accounting;
pub mod aggregator;
pub mod codec;
pub mod config;
pub mod count;
pub mod errors;
pub mod mean;
pub mod noise;
pub mod quantiles;
pub mod sensitivity;
pub mod state;
pub mod sum;

pub use accounting::{DpEvent, RdpAccountant, DEFAULT_RDP_ORDERS};
pub use aggregator::{Aggregator, PrivacyParams};
pub use codec::{peek_kind, AggregatorKind};
pub use config::{load_config, AggregationConfig, ConfigError, ConfigFormat};
pub use count::{Count, CountOptions};
pub use errors::{DpAggError, DpAggResult};
pub use mean::{BoundedMean, BoundedMeanOptions};
pub use noise::{entropy_rng, ConfidenceInterval, NoiseMechanism, DEFAULT_CONFIDENCE_ALPHA};
pub use quantiles::{BoundedQuantiles, BoundedQuantilesOptions, NoisedQuantileTree, TreeShape};
pub use sensitivity::{compute_sensitivity, Sensitivity};
pub use state::{AggregationState, Operation, Transition};
pub use sum::{BoundedSum, BoundedSumOptions};

//! Stochastic (ε, δ) closeness tester for PrivacyNet DP aggregators. The
//! tester only speaks the public [`privacynet_dpagg::Aggregator`] contract:
//! it builds fresh aggregators, feeds a dataset and its neighbor, and checks
//! the empirical release distributions against the claimed guarantee.

pub mod config;
pub mod dataset;
pub mod errors;
pub mod tester;

pub use config::TesterConfig;
pub use dataset::{DatasetGenerator, NeighboringDatasets};
pub use errors::{TesterError, TesterResult};
pub use tester::{BucketViolation, ClosenessReport, Direction, StochasticTester};

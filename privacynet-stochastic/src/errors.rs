use privacynet_dpagg::DpAggError;
use thiserror::Error;

pub type TesterResult<T> = Result<T, TesterError>;

#[derive(Debug, Error, PartialEq)]
pub enum TesterError {
    #[error("invalid tester configuration: {0}")]
    InvalidConfig(String),
    #[error("aggregation error: {0}")]
    Aggregation(#[from] DpAggError),
    #[error("run {run} produced non-finite output {value}")]
    NonFiniteOutput { run: usize, value: f64 },
}

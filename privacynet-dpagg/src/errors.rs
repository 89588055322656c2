use thiserror::Error;

use crate::state::{AggregationState, Operation};

pub type DpAggResult<T> = Result<T, DpAggError>;

/// Every failure is deterministic for a given input and leaves the
/// aggregator exactly as it was before the call.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum DpAggError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("{operation} not permitted while aggregator is {state}")]
    InvalidState {
        operation: Operation,
        state: AggregationState,
    },
    #[error("merge incompatible: {0}")]
    MergeIncompatible(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl DpAggError {
    pub(crate) fn config(details: impl Into<String>) -> Self {
        Self::InvalidConfiguration(details.into())
    }

    pub(crate) fn incompatible(details: impl Into<String>) -> Self {
        Self::MergeIncompatible(details.into())
    }

    pub(crate) fn serialization(details: impl Into<String>) -> Self {
        Self::Serialization(details.into())
    }
}

//! Aggregation lifecycle.
//!
//! Every aggregator moves through `Accumulating → {Merged | Serialized →
//! Finalized | Finalized}`. All transitions go through
//! [`AggregationState::apply`], whose match is exhaustive so that adding a
//! state or an event forces every edge to be reconsidered.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::{DpAggError, DpAggResult};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AggregationState {
    #[default]
    Accumulating,
    /// Contents were absorbed by another aggregator.
    Merged,
    /// Serialized; exactly one result may still be released.
    Serialized,
    /// Result returned.
    Finalized,
}

impl AggregationState {
    /// Returns the state reached after `transition`, or `InvalidState` when
    /// the edge does not exist.
    pub fn apply(self, transition: Transition) -> DpAggResult<Self> {
        use AggregationState::{Accumulating, Finalized, Merged, Serialized};
        match (self, transition) {
            (Accumulating, Transition::Accumulate) => Ok(Accumulating),
            (Accumulating, Transition::Donate) => Ok(Merged),
            (Accumulating, Transition::Serialize) => Ok(Serialized),
            (Accumulating | Serialized, Transition::Finalize) => Ok(Finalized),
            (
                Merged | Serialized | Finalized,
                Transition::Accumulate | Transition::Donate | Transition::Serialize,
            )
            | (Merged | Finalized, Transition::Finalize) => Err(DpAggError::InvalidState {
                operation: transition.operation(),
                state: self,
            }),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Merged | Self::Finalized)
    }

    pub fn can_release(self) -> bool {
        matches!(self, Self::Accumulating | Self::Serialized)
    }
}

impl fmt::Display for AggregationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accumulating => write!(f, "accumulating"),
            Self::Merged => write!(f, "merged"),
            Self::Serialized => write!(f, "serialized"),
            Self::Finalized => write!(f, "finalized"),
        }
    }
}

/// Lifecycle events reported by aggregators.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    /// `add`, or being the target of a merge.
    Accumulate,
    /// Being absorbed by another aggregator.
    Donate,
    Serialize,
    Finalize,
}

impl Transition {
    pub fn operation(self) -> Operation {
        match self {
            Self::Accumulate => Operation::Add,
            Self::Donate => Operation::Merge,
            Self::Serialize => Operation::Serialize,
            Self::Finalize => Operation::Result,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Add,
    Merge,
    Result,
    Serialize,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Add => write!(f, "add"),
            Self::Merge => write!(f, "merge"),
            Self::Result => write!(f, "result"),
            Self::Serialize => write!(f, "serialize"),
        }
    }
}

/// Both sides of a merge must still be accumulating. The target is checked
/// first so its state is the one reported.
pub(crate) fn check_merge_states(
    target: AggregationState,
    donor: AggregationState,
) -> DpAggResult<()> {
    if target != AggregationState::Accumulating {
        return Err(DpAggError::InvalidState {
            operation: Operation::Merge,
            state: target,
        });
    }
    donor.apply(Transition::Donate).map(|_| ())
}

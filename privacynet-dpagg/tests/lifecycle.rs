use privacynet_dpagg::{
    peek_kind, AggregationState, Aggregator, AggregatorKind, BoundedMean, BoundedMeanOptions,
    BoundedQuantiles, BoundedQuantilesOptions, BoundedSum, BoundedSumOptions, Count,
    CountOptions, DpAggError, NoiseMechanism, Operation,
};

fn exact_mean() -> BoundedMean {
    BoundedMean::new(&BoundedMeanOptions {
        noise: NoiseMechanism::Identity,
        ..BoundedMeanOptions::new(1.0, -1.0, 5.0)
    })
    .expect("mean options")
}

fn exact_sum() -> BoundedSum {
    BoundedSum::new(&BoundedSumOptions {
        noise: NoiseMechanism::Identity,
        ..BoundedSumOptions::new(1.0, 0.0, 10.0)
    })
    .expect("sum options")
}

fn invalid(operation: Operation, state: AggregationState) -> DpAggError {
    DpAggError::InvalidState { operation, state }
}

#[test]
fn finalized_mean_rejects_everything() {
    let mut mean = exact_mean();
    mean.add(1.0).unwrap();
    mean.result().unwrap();

    let finalized = AggregationState::Finalized;
    assert_eq!(mean.add(2.0).unwrap_err(), invalid(Operation::Add, finalized));
    assert_eq!(mean.result().unwrap_err(), invalid(Operation::Result, finalized));
    assert_eq!(
        mean.serialize().unwrap_err(),
        invalid(Operation::Serialize, finalized)
    );
    let mut donor = exact_mean();
    assert_eq!(
        mean.merge(&mut donor).unwrap_err(),
        invalid(Operation::Merge, finalized)
    );
    assert_eq!(donor.state(), AggregationState::Accumulating);
}

#[test]
fn merged_donor_is_unusable() {
    let mut target = exact_sum();
    let mut donor = exact_sum();
    donor.add(4.0).unwrap();
    target.merge(&mut donor).unwrap();

    let merged = AggregationState::Merged;
    assert_eq!(donor.add(1.0).unwrap_err(), invalid(Operation::Add, merged));
    assert_eq!(donor.result().unwrap_err(), invalid(Operation::Result, merged));
    assert_eq!(
        donor.serialize().unwrap_err(),
        invalid(Operation::Serialize, merged)
    );
    let mut fresh = exact_sum();
    assert_eq!(
        donor.merge(&mut fresh).unwrap_err(),
        invalid(Operation::Merge, merged)
    );
    assert_eq!(
        target.merge(&mut donor).unwrap_err(),
        invalid(Operation::Merge, merged)
    );
    assert_eq!(target.result().unwrap(), 4.0);
}

#[test]
fn state_errors_take_precedence_over_config_mismatch() {
    let mut target = exact_sum();
    let mut donor = BoundedSum::new(&BoundedSumOptions::new(3.0, -5.0, 5.0)).unwrap();
    donor.serialize().unwrap();
    assert_eq!(
        target.merge(&mut donor).unwrap_err(),
        invalid(Operation::Merge, AggregationState::Serialized)
    );
}

#[test]
fn serialized_aggregator_releases_exactly_once() {
    let mut sum = exact_sum();
    sum.add(3.0).unwrap();
    sum.serialize().unwrap();

    let serialized = AggregationState::Serialized;
    assert_eq!(sum.add(1.0).unwrap_err(), invalid(Operation::Add, serialized));
    let mut other = exact_sum();
    assert_eq!(
        sum.merge(&mut other).unwrap_err(),
        invalid(Operation::Merge, serialized)
    );
    assert_eq!(
        other.merge(&mut sum).unwrap_err(),
        invalid(Operation::Merge, serialized)
    );
    assert_eq!(sum.result().unwrap(), 3.0);
    assert_eq!(
        sum.result().unwrap_err(),
        invalid(Operation::Result, AggregationState::Finalized)
    );
}

#[test]
fn mean_round_trips_through_bytes() {
    let mut original = exact_mean();
    let mut reference = exact_mean();
    for value in [3.5, 8.3, -7.5, f64::NAN] {
        original.add(value).unwrap();
        reference.add(value).unwrap();
    }
    let bytes = original.serialize().expect("serialize mean");
    assert_eq!(peek_kind(&bytes).unwrap(), AggregatorKind::BoundedMean);

    let mut restored = BoundedMean::deserialize(&bytes).expect("deserialize mean");
    assert_eq!(restored.state(), AggregationState::Serialized);
    assert!(restored.equally_initialized(&original));
    assert_eq!(restored.result().unwrap(), reference.result().unwrap());
}

#[test]
fn sum_round_trips_through_bytes() {
    let mut original = exact_sum();
    let mut reference = exact_sum();
    for value in [2.25, 14.0, -3.0, f64::NAN, 7.125] {
        original.add(value).unwrap();
        reference.add(value).unwrap();
    }
    let bytes = original.serialize().expect("serialize sum");
    assert_eq!(peek_kind(&bytes).unwrap(), AggregatorKind::BoundedSum);

    let mut restored = BoundedSum::deserialize(&bytes).expect("deserialize sum");
    assert_eq!(restored.state(), AggregationState::Serialized);
    assert_eq!(restored.bounds(), (0.0, 10.0));
    assert_eq!(restored.params(), reference.params());
    let released = restored.result().unwrap();
    assert_eq!(released, reference.result().unwrap());
    assert_eq!(released, 2.25 + 10.0 + 7.125);
}

#[test]
fn quantiles_round_trip_through_bytes() {
    let options = BoundedQuantilesOptions {
        noise: NoiseMechanism::Identity,
        tree_height: 3,
        branching_factor: 8,
        ..BoundedQuantilesOptions::new(1.0, 0.0, 100.0)
    };
    let mut original = BoundedQuantiles::new(&options).unwrap();
    let mut reference = BoundedQuantiles::new(&options).unwrap();
    for i in 0..500 {
        let value = f64::from(i % 100);
        original.add(value).unwrap();
        reference.add(value).unwrap();
    }
    let bytes = original.serialize().unwrap();
    let mut restored = BoundedQuantiles::deserialize(&bytes).unwrap();
    let mut restored_tree = restored.result().unwrap();
    let mut reference_tree = reference.result().unwrap();
    for rank in [0.0, 0.1, 0.5, 0.77, 1.0] {
        assert_eq!(
            restored_tree.quantile(rank).unwrap(),
            reference_tree.quantile(rank).unwrap()
        );
    }
}

#[test]
fn deserialize_rejects_wrong_kind_and_garbage() {
    let mut count = Count::new(&CountOptions::new(1.0)).unwrap();
    count.increment().unwrap();
    let bytes = count.serialize().unwrap();

    assert!(matches!(
        BoundedSum::deserialize(&bytes),
        Err(DpAggError::Serialization(_))
    ));
    assert!(matches!(
        Count::deserialize(&bytes[..bytes.len() - 3]),
        Err(DpAggError::Serialization(_))
    ));
    assert!(matches!(
        BoundedMean::deserialize(b"not an aggregator"),
        Err(DpAggError::Serialization(_))
    ));
    assert!(Count::deserialize(&bytes).is_ok());
}

#[test]
fn restored_aggregator_cannot_accumulate() {
    let mut mean = exact_mean();
    let bytes = mean.serialize().unwrap();
    let mut restored = BoundedMean::deserialize(&bytes).unwrap();
    let mut fresh = exact_mean();
    assert!(matches!(
        restored.add(1.0),
        Err(DpAggError::InvalidState { .. })
    ));
    assert!(matches!(
        fresh.merge(&mut restored),
        Err(DpAggError::InvalidState { .. })
    ));
    assert_eq!(restored.result().unwrap(), 2.0);
}

//! Property tests for the timing oracle's smoothing step.

use convoy::timing::{ALPHA_FAST, ALPHA_SLOW, smooth};
use proptest::prelude::*;

proptest! {
    /// Feeding a constant sample converges geometrically:
    /// |EMA_k − v| ≤ (1−α)^k · |EMA_0 − v|, with α picked by direction.
    #[test]
    fn constant_samples_converge_geometrically(
        start in 1.0f64..1_000_000.0,
        target in 1.0f64..1_000_000.0,
        steps in 1usize..60,
    ) {
        let alpha = if target > start { ALPHA_FAST } else { ALPHA_SLOW };
        let initial_error = (start - target).abs();

        let mut ema = start;
        for _ in 0..steps {
            ema = smooth(Some(ema), target);
        }

        let bound = (1.0 - alpha).powi(steps as i32) * initial_error;
        prop_assert!(
            (ema - target).abs() <= bound + 1e-6,
            "ema={ema} target={target} bound={bound}"
        );
    }

    /// The estimate never leaves the interval between the previous value
    /// and the sample.
    #[test]
    fn smoothing_stays_between_previous_and_sample(
        previous in 1.0f64..1_000_000.0,
        sample in 1.0f64..1_000_000.0,
    ) {
        let next = smooth(Some(previous), sample);
        let (low, high) = if previous <= sample {
            (previous, sample)
        } else {
            (sample, previous)
        };
        prop_assert!(next >= low - 1e-9 && next <= high + 1e-9);
    }

    /// Widening reacts at least as strongly as tightening.
    #[test]
    fn widening_moves_faster_than_tightening(delta in 1.0f64..10_000.0) {
        let base = 50_000.0;
        let widened = smooth(Some(base), base + delta) - base;
        let tightened = base - smooth(Some(base), base - delta);
        prop_assert!(widened > tightened);
    }
}

#[test]
fn first_sample_is_stored_raw() {
    assert_eq!(smooth(None, 1234.5), 1234.5);
}

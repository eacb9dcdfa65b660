//! Arrival-order independence of sorted first/last selection.

use proptest::prelude::*;
use tally_core::operator::{ChunkedOperator, SelectionMode, SortedFirstOrLastOperator};
use tally_core::values::{SortKey, NULL_DOUBLE, NULL_INT};

/// Winner by full scan, with the row-key tie-break.
fn expected_winner<T: SortKey>(mode: SelectionMode, values: &[T]) -> Option<i64> {
    let keyed = values.iter().enumerate().map(|(key, value)| (key as i64, value));
    let best = match mode {
        SelectionMode::First => keyed.min_by(|a, b| a.1.compare(b.1).then(a.0.cmp(&b.0))),
        SelectionMode::Last => keyed.max_by(|a, b| a.1.compare(b.1).then(a.0.cmp(&b.0))),
    };
    best.map(|(key, _)| key)
}

/// Feeds rows to one slot in `order`, `chunk` rows per call.
fn select<T: SortKey>(mode: SelectionMode, values: &[T], order: &[usize], chunk: usize) -> Option<i64> {
    let mut op = SortedFirstOrLastOperator::<T>::new(mode);
    op.ensure_capacity(1);
    for rows in order.chunks(chunk) {
        let chunk_values: Vec<T> = rows.iter().map(|&row| values[row].clone()).collect();
        let chunk_keys: Vec<i64> = rows.iter().map(|&row| row as i64).collect();
        op.add_chunk_singleton(&chunk_values, &chunk_keys, 0).unwrap();
    }
    op.winner(0)
}

fn arb_mode() -> impl Strategy<Value = SelectionMode> {
    prop_oneof![Just(SelectionMode::First), Just(SelectionMode::Last)]
}

fn arb_int() -> impl Strategy<Value = i32> {
    prop_oneof![1 => Just(NULL_INT), 6 => -4i32..4]
}

fn arb_double() -> impl Strategy<Value = f64> {
    prop_oneof![
        Just(NULL_DOUBLE),
        Just(-0.0),
        Just(0.0),
        Just(1.5),
        Just(f64::NAN),
        Just(f64::NEG_INFINITY),
    ]
}

/// Values, a permutation of their row keys, and a chunk size.
fn arb_rows<T: std::fmt::Debug + Clone + 'static>(
    value: impl Strategy<Value = T> + 'static,
) -> impl Strategy<Value = (Vec<T>, Vec<usize>, usize)> {
    prop::collection::vec(value, 1..48).prop_flat_map(|values| {
        let len = values.len();
        (
            Just(values),
            Just((0..len).collect::<Vec<_>>()).prop_shuffle(),
            1..=len,
        )
    })
}

proptest! {
    #[test]
    fn first_last_ints_ignore_arrival_order(
        mode in arb_mode(),
        rows in arb_rows(arb_int()),
    ) {
        let (values, order, chunk) = rows;
        prop_assert_eq!(
            select(mode, &values, &order, chunk),
            expected_winner(mode, &values)
        );
    }

    #[test]
    fn first_last_doubles_ignore_arrival_order(
        mode in arb_mode(),
        rows in arb_rows(arb_double()),
    ) {
        let (values, order, chunk) = rows;
        prop_assert_eq!(
            select(mode, &values, &order, chunk),
            expected_winner(mode, &values)
        );
    }

    #[test]
    fn first_last_strings_ignore_arrival_order(
        mode in arb_mode(),
        rows in arb_rows(proptest::option::of("[a-c]{0,2}")),
    ) {
        let (values, order, chunk) = rows;
        prop_assert_eq!(
            select(mode, &values, &order, chunk),
            expected_winner(mode, &values)
        );
    }
}

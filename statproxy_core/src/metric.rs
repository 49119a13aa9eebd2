//! Reduction kinds and the values they reduce into.
//!
//! Every write carries a [`Kind`] that decides how the stored value evolves:
//!
//! | kind | effect on the stored value                                   |
//! |------|--------------------------------------------------------------|
//! | Sum  | `value += delta`                                             |
//! | Set  | `value = delta`                                              |
//! | Max  | `value = delta` if unset or `delta > value`                  |
//! | Min  | `value = delta` if unset or `delta < value`                  |
//! | Avg  | `_sum += delta; _count += 1; value = _sum / _count`, truncating |
//!
//! Sums saturate at the `i64` bounds rather than wrapping.

use rustc_hash::FxHashMap;

/// Suffix of the running sum an Avg metric keeps beside its value.
pub const SUM_SUFFIX: &str = "_sum";
/// Suffix of the sample count an Avg metric keeps beside its value.
pub const COUNT_SUFFIX: &str = "_count";

/// How a write reduces into the stored value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    /// Add the delta to the stored value.
    Sum,
    /// Replace the stored value, last write wins.
    Set,
    /// Keep the largest value seen.
    Max,
    /// Keep the smallest value seen.
    Min,
    /// Keep the truncated integer mean of all values seen.
    Avg,
}

/// Which of the two cardinality sketch sets an insert targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SketchSet {
    /// Cleared on every numeric flush.
    Rolling,
    /// Cleared once a day and persisted across restarts.
    Daily,
}

fn shadow(name: &str, suffix: &str) -> String {
    let mut key = String::with_capacity(name.len() + suffix.len());
    key.push_str(name);
    key.push_str(suffix);
    key
}

/// Apply a scalar write to `metrics`, creating the entry on first write.
///
/// Avg keeps its running sum and count as the ordinary entries
/// `<name>_sum` and `<name>_count` beside `<name>`, so they are drained and
/// counted toward the overload bound like any other metric. A count that is
/// not positive leaves `<name>` untouched.
pub(crate) fn apply(metrics: &mut FxHashMap<String, i64>, name: &str, kind: Kind, delta: i64) {
    match kind {
        Kind::Sum => {
            let value = metrics.entry(name.to_owned()).or_insert(0);
            *value = value.saturating_add(delta);
        }
        Kind::Set => {
            metrics.insert(name.to_owned(), delta);
        }
        Kind::Max => match metrics.get_mut(name) {
            Some(value) => *value = (*value).max(delta),
            None => {
                metrics.insert(name.to_owned(), delta);
            }
        },
        Kind::Min => match metrics.get_mut(name) {
            Some(value) => *value = (*value).min(delta),
            None => {
                metrics.insert(name.to_owned(), delta);
            }
        },
        Kind::Avg => {
            let sum = metrics.entry(shadow(name, SUM_SUFFIX)).or_insert(0);
            *sum = sum.saturating_add(delta);
            let sum = *sum;
            let count = metrics.entry(shadow(name, COUNT_SUFFIX)).or_insert(0);
            *count = count.saturating_add(1);
            let count = *count;
            if count > 0 {
                if let Some(mean) = sum.checked_div(count) {
                    metrics.insert(name.to_owned(), mean);
                }
            }
        }
    }
}

/// The shape every cell of a pattern cache has, fixed when the cache is made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Shape {
    Scalar,
    Mean,
}

impl Shape {
    pub(crate) fn for_kind(kind: Kind) -> Self {
        match kind {
            Kind::Avg => Shape::Mean,
            Kind::Sum | Kind::Set | Kind::Max | Kind::Min => Shape::Scalar,
        }
    }
}

/// One pattern's stored value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Cell {
    Scalar(i64),
    Mean { sum: i64, count: i64 },
}

impl Cell {
    pub(crate) fn shape(self) -> Shape {
        match self {
            Cell::Scalar(_) => Shape::Scalar,
            Cell::Mean { .. } => Shape::Mean,
        }
    }

    /// The reported value, or `None` for a mean that has no samples.
    pub(crate) fn value(self) -> Option<i64> {
        match self {
            Cell::Scalar(v) => Some(v),
            Cell::Mean { sum, count } if count > 0 => Some(sum / count),
            Cell::Mean { .. } => None,
        }
    }

    /// Compute the cell that results from writing `delta` over `prior`.
    ///
    /// Returns `None` when the write leaves the stored value as it is, a Max
    /// or Min that does not improve on `prior`.
    pub(crate) fn next(prior: Option<Cell>, kind: Kind, delta: i64) -> Option<Cell> {
        match (kind, prior) {
            (Kind::Sum, Some(Cell::Scalar(v))) => Some(Cell::Scalar(v.saturating_add(delta))),
            (Kind::Max, Some(Cell::Scalar(v))) if delta <= v => None,
            (Kind::Min, Some(Cell::Scalar(v))) if delta >= v => None,
            (Kind::Avg, Some(Cell::Mean { sum, count })) => Some(Cell::Mean {
                sum: sum.saturating_add(delta),
                count: count + 1,
            }),
            (Kind::Avg, _) => Some(Cell::Mean {
                sum: delta,
                count: 1,
            }),
            (Kind::Sum | Kind::Set | Kind::Max | Kind::Min, _) => Some(Cell::Scalar(delta)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(writes: &[(Kind, i64)]) -> i64 {
        let mut metrics = FxHashMap::default();
        for &(kind, delta) in writes {
            apply(&mut metrics, "m", kind, delta);
        }
        metrics["m"]
    }

    #[test]
    fn avg_truncates() {
        assert_eq!(run(&[(Kind::Avg, 7), (Kind::Avg, 3)]), 5);
        assert_eq!(run(&[(Kind::Avg, 4), (Kind::Avg, 1)]), 2);
        assert_eq!(run(&[(Kind::Avg, -3), (Kind::Avg, -4)]), -3);
    }

    #[test]
    fn max_first_write_is_unconditional() {
        assert_eq!(run(&[(Kind::Max, 3)]), 3);
        assert_eq!(run(&[(Kind::Max, 3), (Kind::Max, 2)]), 3);
        assert_eq!(run(&[(Kind::Max, 3), (Kind::Max, 2), (Kind::Max, 5)]), 5);
        assert_eq!(run(&[(Kind::Max, -10)]), -10);
    }

    #[test]
    fn min_first_write_is_unconditional() {
        assert_eq!(run(&[(Kind::Min, 3)]), 3);
        assert_eq!(run(&[(Kind::Min, 3), (Kind::Min, 4)]), 3);
        assert_eq!(run(&[(Kind::Min, 3), (Kind::Min, 1)]), 1);
        assert_eq!(run(&[(Kind::Min, 10)]), 10);
    }

    #[test]
    fn sum_saturates() {
        assert_eq!(run(&[(Kind::Sum, i64::MAX), (Kind::Sum, 1)]), i64::MAX);
        assert_eq!(run(&[(Kind::Sum, 2), (Kind::Sum, -5)]), -3);
    }

    #[test]
    fn set_after_avg_keeps_mean_shadow() {
        // The next Avg recomputes from the shadow, not from the Set value.
        assert_eq!(run(&[(Kind::Avg, 10), (Kind::Set, 100), (Kind::Avg, 20)]), 15);
    }

    #[test]
    fn avg_shadows_are_plain_entries() {
        let mut metrics = FxHashMap::default();
        apply(&mut metrics, "lat", Kind::Avg, 7);
        apply(&mut metrics, "lat", Kind::Avg, 3);
        assert_eq!(metrics.len(), 3);
        assert_eq!(metrics["lat"], 5);
        assert_eq!(metrics["lat_sum"], 10);
        assert_eq!(metrics["lat_count"], 2);
    }

    #[test]
    fn avg_over_a_clobbered_count_keeps_the_value() {
        let mut metrics = FxHashMap::default();
        apply(&mut metrics, "lat", Kind::Avg, 8);
        apply(&mut metrics, "lat_count", Kind::Set, -1);
        apply(&mut metrics, "lat", Kind::Avg, 2);
        assert_eq!(metrics["lat_count"], 0);
        assert_eq!(metrics["lat"], 8);
    }

    #[test]
    fn cell_max_min_without_improvement_is_not_a_write() {
        assert_eq!(Cell::next(Some(Cell::Scalar(5)), Kind::Max, 5), None);
        assert_eq!(Cell::next(Some(Cell::Scalar(5)), Kind::Min, 6), None);
        assert_eq!(
            Cell::next(Some(Cell::Scalar(5)), Kind::Max, 6),
            Some(Cell::Scalar(6))
        );
        assert_eq!(Cell::next(None, Kind::Min, 6), Some(Cell::Scalar(6)));
    }

    #[test]
    fn cell_mean_divides_on_read() {
        let one = Cell::next(None, Kind::Avg, 4);
        let two = Cell::next(one, Kind::Avg, 1);
        assert_eq!(two, Some(Cell::Mean { sum: 5, count: 2 }));
        assert_eq!(two.and_then(Cell::value), Some(2));
        assert_eq!(Cell::Mean { sum: 5, count: 0 }.value(), None);
    }
}

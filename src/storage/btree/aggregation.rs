//! Per-node aggregation hooks.
//!
//! Every node caches an aggregate over the values below it. Leaves fold their
//! values with [`AggrCalc::add`]; internal nodes fold their children's
//! aggregates with [`AggrCalc::merge`].

use std::fmt;

/// Computes subtree aggregates over values of type `V`.
///
/// `merge` must be associative and the default aggregate must be its identity.
pub trait AggrCalc<V>: Clone + Default + Send + Sync + 'static {
    /// Cached per-node summary.
    type Aggregate: Clone + Default + PartialEq + fmt::Debug + fmt::Display + Send + Sync;

    /// Folds a single value into `aggr`.
    fn add(&self, aggr: &mut Self::Aggregate, value: &V);

    /// Folds another aggregate into `aggr`.
    fn merge(&self, aggr: &mut Self::Aggregate, other: &Self::Aggregate);

    /// Aggregates a run of values.
    fn from_values<'a, I>(&self, values: I) -> Self::Aggregate
    where
        I: IntoIterator<Item = &'a V>,
        V: 'a,
    {
        let mut aggr = Self::Aggregate::default();
        for value in values {
            self.add(&mut aggr, value);
        }
        aggr
    }
}

/// Integer types usable as min/max aggregated values.
pub trait AggrValue: Copy + Ord + fmt::Debug + fmt::Display + Send + Sync + 'static {
    /// Smallest representable value, the empty `max` sentinel.
    const MIN_VALUE: Self;
    /// Largest representable value, the empty `min` sentinel.
    const MAX_VALUE: Self;
}

macro_rules! impl_aggr_value {
    ($($ty:ty),* $(,)?) => {
        $(
            impl AggrValue for $ty {
                const MIN_VALUE: Self = <$ty>::MIN;
                const MAX_VALUE: Self = <$ty>::MAX;
            }
        )*
    };
}

impl_aggr_value!(i8, i16, i32, i64, u8, u16, u32, u64, usize, isize);

/// Running minimum and maximum.
///
/// An empty aggregate holds `min = MAX_VALUE` and `max = MIN_VALUE`, so merging
/// it is a no-op.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MinMax<T> {
    min: T,
    max: T,
}

impl<T: AggrValue> Default for MinMax<T> {
    fn default() -> Self {
        Self {
            min: T::MAX_VALUE,
            max: T::MIN_VALUE,
        }
    }
}

impl<T: AggrValue> MinMax<T> {
    /// Smallest value seen, or `T::MAX_VALUE` when empty.
    pub fn min(&self) -> T {
        self.min
    }

    /// Largest value seen, or `T::MIN_VALUE` when empty.
    pub fn max(&self) -> T {
        self.max
    }

    /// Returns `true` if nothing has been folded in.
    pub fn is_empty(&self) -> bool {
        self.min > self.max
    }

    /// Folds `value` in.
    pub fn add(&mut self, value: T) {
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    /// Folds `other` in.
    pub fn merge(&mut self, other: &Self) {
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }
}

impl<T: fmt::Display> fmt::Display for MinMax<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "min={},max={}", self.min, self.max)
    }
}

/// Aggregates values into a [`MinMax`].
#[derive(Clone, Copy, Debug, Default)]
pub struct MinMaxAggrCalc;

impl<V: AggrValue> AggrCalc<V> for MinMaxAggrCalc {
    type Aggregate = MinMax<V>;

    fn add(&self, aggr: &mut MinMax<V>, value: &V) {
        aggr.add(*value);
    }

    fn merge(&self, aggr: &mut MinMax<V>, other: &MinMax<V>) {
        aggr.merge(other);
    }
}

/// Placeholder aggregate of trees that do not aggregate.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NoAggregated;

impl fmt::Display for NoAggregated {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("noaggr")
    }
}

/// Aggregation disabled; every node reports [`NoAggregated`].
#[derive(Clone, Copy, Debug, Default)]
pub struct NoAggrCalc;

impl<V> AggrCalc<V> for NoAggrCalc {
    type Aggregate = NoAggregated;

    fn add(&self, _aggr: &mut NoAggregated, _value: &V) {}

    fn merge(&self, _aggr: &mut NoAggregated, _other: &NoAggregated) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_minmax_uses_sentinels() {
        let aggr = MinMax::<i32>::default();
        assert_eq!(aggr.min(), i32::MAX);
        assert_eq!(aggr.max(), i32::MIN);
        assert!(aggr.is_empty());
        assert_eq!(aggr.to_string(), format!("min={},max={}", i32::MAX, i32::MIN));
    }

    #[test]
    fn merging_empty_is_identity() {
        let calc = MinMaxAggrCalc;
        let mut aggr = AggrCalc::<i32>::from_values(&calc, &[5i32, -3, 12]);
        let before = aggr;
        calc.merge(&mut aggr, &MinMax::default());
        assert_eq!(aggr, before);
        assert_eq!((aggr.min(), aggr.max()), (-3, 12));
    }

    #[test]
    fn merge_combines_ranges() {
        let calc = MinMaxAggrCalc;
        let mut left = AggrCalc::<u32>::from_values(&calc, &[10u32, 20]);
        let right = AggrCalc::<u32>::from_values(&calc, &[5u32, 15]);
        calc.merge(&mut left, &right);
        assert_eq!(left.to_string(), "min=5,max=20");
    }

    #[test]
    fn no_aggregation_renders_marker() {
        let calc = NoAggrCalc;
        let aggr = AggrCalc::<u8>::from_values(&calc, &[1u8, 2]);
        assert_eq!(aggr.to_string(), "noaggr");
    }
}

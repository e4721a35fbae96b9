use std::cmp::Ordering;

/// Total order over keys supplied by the caller.
pub trait KeyComparator<K> {
    /// Compares `lhs` against `rhs`.
    fn compare(&self, lhs: &K, rhs: &K) -> Ordering;
}

/// Orders keys by their [`Ord`] implementation.
#[derive(Clone, Copy, Debug, Default)]
pub struct NaturalOrder;

impl<K: Ord> KeyComparator<K> for NaturalOrder {
    fn compare(&self, lhs: &K, rhs: &K) -> Ordering {
        lhs.cmp(rhs)
    }
}

/// Adapts a closure into a [`KeyComparator`].
#[derive(Clone, Copy)]
pub struct CompareFn<F>(pub F);

impl<K, F> KeyComparator<K> for CompareFn<F>
where
    F: Fn(&K, &K) -> Ordering,
{
    fn compare(&self, lhs: &K, rhs: &K) -> Ordering {
        (self.0)(lhs, rhs)
    }
}

impl<K, C: KeyComparator<K> + ?Sized> KeyComparator<K> for &C {
    fn compare(&self, lhs: &K, rhs: &K) -> Ordering {
        (**self).compare(lhs, rhs)
    }
}

/// Index of the first key not less than `key`.
///
/// Slices longer than `threshold` use binary search, shorter ones a linear scan.
pub(crate) fn lower_bound<K, C>(keys: &[K], key: &K, cmp: &C, threshold: usize) -> usize
where
    C: KeyComparator<K> + ?Sized,
{
    if keys.len() > threshold {
        keys.partition_point(|probe| cmp.compare(probe, key) == Ordering::Less)
    } else {
        keys.iter()
            .position(|probe| cmp.compare(probe, key) != Ordering::Less)
            .unwrap_or(keys.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_and_binary_search_agree() {
        let keys: Vec<u32> = (0..40).map(|k| k * 3).collect();
        for probe in 0..125u32 {
            let linear = lower_bound(&keys, &probe, &NaturalOrder, usize::MAX);
            let binary = lower_bound(&keys, &probe, &NaturalOrder, 0);
            assert_eq!(linear, binary, "probe {probe}");
            assert_eq!(linear, keys.iter().filter(|&&k| k < probe).count());
        }
    }

    #[test]
    fn closure_comparators_reverse_order() {
        let reverse = CompareFn(|a: &i32, b: &i32| b.cmp(a));
        let keys = [9, 7, 4, 1];
        assert_eq!(lower_bound(&keys, &7, &reverse, 8), 1);
        assert_eq!(lower_bound(&keys, &5, &reverse, 0), 2);
        assert_eq!(lower_bound(&keys, &0, &reverse, 0), 4);
    }
}

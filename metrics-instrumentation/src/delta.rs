use std::ops::Sub;

/// Turns a monotonically increasing value into per-interval differences.
///
/// Cumulative counters, such as the total number of allocations performed since the process
/// started, are fed through `compare` once per sampling interval to yield the amount attributable
/// to that interval alone.
#[derive(Clone, Debug)]
pub struct Delta<T> {
    previous: T,
}

impl<T> Delta<T>
where
    T: Copy + Sub<Output = T>,
{
    /// Creates a new `Delta` with the given baseline.
    pub fn new(initial: T) -> Self {
        Delta { previous: initial }
    }

    /// Returns the difference between `new_value` and the previously seen value, and remembers
    /// `new_value` for the next comparison.
    pub fn compare(&mut self, new_value: T) -> T {
        let delta = new_value - self.previous;
        self.previous = new_value;
        delta
    }

    /// The most recently seen value.
    pub fn previous(&self) -> T {
        self.previous
    }
}

impl<T: Default> Default for Delta<T> {
    fn default() -> Self {
        Delta { previous: T::default() }
    }
}

#[cfg(test)]
mod tests {
    use proptest::{collection::vec as arb_vec, prelude::*, proptest};

    use super::Delta;

    #[test]
    fn first_comparison_uses_baseline() {
        let mut delta = Delta::new(10i64);
        assert_eq!(delta.compare(15), 5);
        assert_eq!(delta.compare(15), 0);
        assert_eq!(delta.compare(22), 7);
        assert_eq!(delta.previous(), 22);
    }

    #[test]
    fn default_starts_at_zero() {
        let mut delta = Delta::<f64>::default();
        assert_eq!(delta.compare(2.5), 2.5);
    }

    proptest! {
        #[test]
        fn deltas_telescope(initial in -1_000_000i64..1_000_000, values in arb_vec(-1_000_000i64..1_000_000, 1..64)) {
            let mut delta = Delta::new(initial);
            let sum: i64 = values.iter().map(|v| delta.compare(*v)).sum();

            prop_assert_eq!(sum, values[values.len() - 1] - initial);
        }
    }
}

use std::time::Duration;

use rand::{rngs::SmallRng, Rng as _, SeedableRng as _};

const MAX_STEP: Duration = Duration::from_millis(100);

/// A signed adjustment applied to a base interval.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Offset {
    nanos: i128,
}

impl Offset {
    /// Offset in nanoseconds.
    pub fn as_nanos(&self) -> i128 {
        self.nanos
    }

    /// Returns `base` shifted by this offset, saturating at zero.
    pub fn apply(&self, base: Duration) -> Duration {
        let shifted = (base.as_nanos() as i128).saturating_add(self.nanos).max(0);
        duration_from_nanos(shifted as u128)
    }
}

fn duration_from_nanos(nanos: u128) -> Duration {
    let secs = u64::try_from(nanos / 1_000_000_000).unwrap_or(u64::MAX);
    Duration::new(secs, (nanos % 1_000_000_000) as u32)
}

/// Randomized sleep intervals around a base interval.
///
/// Offsets are drawn from a fixed set, symmetric around zero, spanning `[-interval/2, +interval/2]`
/// in steps of at most 100 milliseconds.  The offset drawn on the previous call is never drawn
/// twice in a row.  An interval shorter than two nanoseconds has the single offset zero.
#[derive(Debug)]
pub struct Jitter {
    interval: Duration,
    offsets: Vec<Offset>,
    last: Option<usize>,
    rng: SmallRng,
}

impl Jitter {
    /// Creates a new `Jitter` around `interval`, seeded from the thread-local generator.
    pub fn new(interval: Duration) -> Self {
        Self::with_rng(interval, SmallRng::from_rng(&mut rand::rng()))
    }

    /// Creates a new `Jitter` around `interval` with a fixed seed.
    pub fn with_seed(interval: Duration, seed: u64) -> Self {
        Self::with_rng(interval, SmallRng::seed_from_u64(seed))
    }

    fn with_rng(interval: Duration, rng: SmallRng) -> Self {
        let half = (interval.as_nanos() / 2) as i128;
        let step = MAX_STEP.as_nanos() as i128;
        // Steps per side; never more than `half`, so the offsets are distinct.
        let steps = ((half + step - 1) / step).max(1);

        let mut offsets: Vec<Offset> =
            (-steps..=steps).map(|k| Offset { nanos: k * half / steps }).collect();
        offsets.dedup();

        Jitter { interval, offsets, last: None, rng }
    }

    /// Base interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Every offset that can be drawn.
    pub fn offsets(&self) -> &[Offset] {
        &self.offsets
    }

    /// Draws the next offset.
    pub fn next_offset(&mut self) -> Offset {
        let len = self.offsets.len();
        let index = match self.last {
            Some(_) if len == 1 => 0,
            Some(last) => {
                let index = self.rng.random_range(0..len - 1);
                if index >= last {
                    index + 1
                } else {
                    index
                }
            }
            None => self.rng.random_range(0..len),
        };

        self.last = Some(index);
        self.offsets[index]
    }

    /// Draws the next offset and applies it to the base interval.
    pub fn next_interval(&mut self) -> Duration {
        let offset = self.next_offset();
        offset.apply(self.interval)
    }
}

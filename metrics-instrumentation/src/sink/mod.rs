//! Destinations for batches of [`MetricSample`]s.
use std::sync::Arc;

use parking_lot::Mutex;

use crate::MetricSample;

mod forwarder;
pub use self::forwarder::{
    ForwarderBuilder, ForwardingSink, JsonLinesTransport, Transport, TransportError,
};

/// Accepts batches of samples for persistence.
///
/// Submission never fails from the caller's point of view: implementations log and drop what they
/// cannot deliver.
pub trait SampleSink: Send + Sync {
    /// Submits a batch of samples.
    fn submit(&self, samples: Vec<MetricSample>);
}

impl<T> SampleSink for Arc<T>
where
    T: SampleSink + ?Sized,
{
    fn submit(&self, samples: Vec<MetricSample>) {
        (**self).submit(samples);
    }
}

/// A sink that discards every sample.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl SampleSink for NullSink {
    fn submit(&self, _samples: Vec<MetricSample>) {}
}

/// A sink that keeps every submitted sample in memory.
///
/// Clones share the same buffer, so a clone can be handed to [`Telemetry`][crate::Telemetry] while
/// the original is used to inspect what was submitted.
#[derive(Clone, Debug, Default)]
pub struct MemorySink {
    samples: Arc<Mutex<Vec<MetricSample>>>,
}

impl MemorySink {
    /// Creates an empty `MemorySink`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of every sample submitted so far.
    pub fn samples(&self) -> Vec<MetricSample> {
        self.samples.lock().clone()
    }

    /// Removes and returns every sample submitted so far.
    pub fn drain(&self) -> Vec<MetricSample> {
        std::mem::take(&mut *self.samples.lock())
    }
}

impl SampleSink for MemorySink {
    fn submit(&self, samples: Vec<MetricSample>) {
        self.samples.lock().extend(samples);
    }
}

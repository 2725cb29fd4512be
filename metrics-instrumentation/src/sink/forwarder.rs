use std::{
    io::{self, Write},
    panic::{catch_unwind, AssertUnwindSafe},
    thread::{self, JoinHandle},
};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use thiserror::Error;
use tracing::{debug, error, trace, warn};

use crate::{sample::SinkRecord, MetricSample};

use super::SampleSink;

const DEFAULT_SLICE_SIZE: usize = 1000;
const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Errors that could occur while delivering records.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The underlying writer or connection failed.
    #[error("failed to write records: {0}")]
    Io(#[from] io::Error),

    /// A record could not be serialized.
    #[error("failed to serialize record: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Delivers slices of records to their final destination.
pub trait Transport: Send + 'static {
    /// Sends one slice of records.
    ///
    /// # Errors
    ///
    /// If the slice could not be delivered, an error is returned and the slice is dropped.
    fn send(&mut self, records: &[SinkRecord]) -> Result<(), TransportError>;
}

/// A transport that writes each record as one line of JSON.
#[derive(Debug)]
pub struct JsonLinesTransport<W> {
    writer: W,
}

impl<W> JsonLinesTransport<W> {
    /// Creates a new `JsonLinesTransport` writing to `writer`.
    pub fn new(writer: W) -> Self {
        JsonLinesTransport { writer }
    }

    /// Gets a reference to the underlying writer.
    pub fn get_ref(&self) -> &W {
        &self.writer
    }
}

impl<W> Transport for JsonLinesTransport<W>
where
    W: Write + Send + 'static,
{
    fn send(&mut self, records: &[SinkRecord]) -> Result<(), TransportError> {
        for record in records {
            serde_json::to_writer(&mut self.writer, record)?;
            self.writer.write_all(b"\n")?;
        }
        self.writer.flush()?;
        Ok(())
    }
}

/// Builder for [`ForwardingSink`].
#[derive(Debug)]
pub struct ForwarderBuilder {
    slice_size: usize,
    buffer_size: usize,
}

impl ForwarderBuilder {
    /// Creates a new `ForwarderBuilder` with default values.
    pub fn new() -> Self {
        ForwarderBuilder { slice_size: DEFAULT_SLICE_SIZE, buffer_size: DEFAULT_BUFFER_SIZE }
    }

    /// Sets the maximum number of records handed to the transport at once.
    ///
    /// A failing slice only drops the records it carries.  Values below one are treated as one.
    ///
    /// Defaults to 1000.
    #[must_use]
    pub fn with_slice_size(mut self, slice_size: usize) -> Self {
        self.slice_size = slice_size.max(1);
        self
    }

    /// Sets the number of batches that may be queued for the background thread.
    ///
    /// Batches submitted while the queue is full are dropped.  Values below one are treated as one.
    ///
    /// Defaults to 1024.
    #[must_use]
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1);
        self
    }

    /// Spawns the background thread and returns the sink feeding it.
    ///
    /// # Errors
    ///
    /// If the background thread cannot be spawned, an error is returned.
    pub fn build<T>(self, transport: T) -> io::Result<ForwardingSink>
    where
        T: Transport,
    {
        let (sender, receiver) = bounded(self.buffer_size);
        let slice_size = self.slice_size;

        let handle = thread::Builder::new()
            .name("metrics-instrumentation-forwarder".to_string())
            .spawn(move || run_forwarder(receiver, transport, slice_size))?;

        Ok(ForwardingSink { sender: Some(sender), handle: Some(handle) })
    }
}

impl Default for ForwarderBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A sink that hands batches to a [`Transport`] on a background thread.
///
/// Submitting never blocks.  Dropping the sink delivers every queued batch before returning.
#[derive(Debug)]
pub struct ForwardingSink {
    sender: Option<Sender<Vec<MetricSample>>>,
    handle: Option<JoinHandle<()>>,
}

impl SampleSink for ForwardingSink {
    fn submit(&self, samples: Vec<MetricSample>) {
        if samples.is_empty() {
            return;
        }

        let Some(sender) = &self.sender else {
            return;
        };

        match sender.try_send(samples) {
            Ok(()) => {}
            Err(TrySendError::Full(samples)) => {
                warn!(samples = samples.len(), "Sample queue full. Dropping batch.");
            }
            Err(TrySendError::Disconnected(samples)) => {
                warn!(samples = samples.len(), "Sample forwarder stopped. Dropping batch.");
            }
        }
    }
}

impl Drop for ForwardingSink {
    fn drop(&mut self) {
        drop(self.sender.take());

        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Sample forwarder thread panicked.");
            }
        }
    }
}

fn run_forwarder<T: Transport>(receiver: Receiver<Vec<MetricSample>>, mut transport: T, slice_size: usize) {
    debug!(slice_size, "Sample forwarder started.");

    for batch in receiver.iter() {
        let records: Vec<SinkRecord> = batch.iter().map(MetricSample::to_record).collect();

        let mut records_sent = 0;
        let mut records_dropped = 0;
        for slice in records.chunks(slice_size) {
            match catch_unwind(AssertUnwindSafe(|| transport.send(slice))) {
                Ok(Ok(())) => records_sent += slice.len(),
                Ok(Err(e)) => {
                    error!(error = %e, records = slice.len(), "Failed to send slice.");
                    records_dropped += slice.len();
                }
                Err(_) => {
                    error!(records = slice.len(), "Transport panicked while sending slice.");
                    records_dropped += slice.len();
                }
            }
        }

        trace!(records_sent, records_dropped, "Finished forwarding batch.");
    }

    debug!("Sample forwarder stopped.");
}

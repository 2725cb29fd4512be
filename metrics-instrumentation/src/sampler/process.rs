use std::{mem, sync::Arc};

use crate::{
    alloc,
    delta::Delta,
    method_call::millis,
    registry::{Gauge, RegistryError},
    sample::{values, MetricSample},
    system, Labels, SampleSink, Telemetry,
};

use super::{SampleError, Sampler};

/// Samples memory, file descriptors, CPU time and allocation activity of the current process.
///
/// Cumulative statistics (CPU time, allocations) are reported per interval.  Allocation samples
/// are only produced when [`CountingAllocator`][crate::alloc::CountingAllocator] is installed.
pub struct ProcessSampler {
    prefix: &'static str,
    sink: Arc<dyn SampleSink>,
    buffer: Vec<MetricSample>,
    cpu_time: Delta<f64>,
    allocations: Delta<u64>,
    allocated_bytes: Delta<u64>,
    resident_memory: Gauge,
    open_fds: Gauge,
    max_fds: Gauge,
    cpu_seconds: Gauge,
}

impl ProcessSampler {
    /// Creates a new `ProcessSampler` reporting through `telemetry`.
    ///
    /// # Errors
    ///
    /// If the process gauges conflict with metrics already registered, an error is returned.
    pub fn new(telemetry: &Telemetry) -> Result<Self, RegistryError> {
        let registry = telemetry.registry();
        let none = Labels::new();
        let allocations = alloc::stats();

        Ok(ProcessSampler {
            prefix: telemetry.config().role().series_prefix(),
            sink: Arc::clone(telemetry.sink()),
            buffer: Vec::new(),
            cpu_time: Delta::new(cpu_millis()),
            allocations: Delta::new(allocations.allocations),
            allocated_bytes: Delta::new(allocations.allocated_bytes),
            resident_memory: registry.gauge(
                "process_resident_memory_bytes",
                "Resident memory size in bytes",
                &none,
            )?,
            open_fds: registry.gauge("process_open_fds", "Number of open file descriptors", &none)?,
            max_fds: registry.gauge(
                "process_max_fds",
                "Maximum number of open file descriptors",
                &none,
            )?,
            cpu_seconds: registry.gauge(
                "process_cpu_seconds_total",
                "Total user and system CPU time spent in seconds",
                &none,
            )?,
        })
    }

    fn add(&mut self, name: &str, values: std::collections::BTreeMap<String, f64>) {
        let series = format!("{}{name}", self.prefix);
        self.buffer.push(MetricSample::new(series, values, Labels::new()));
    }

    fn sample_memory(&mut self) -> bool {
        let Some(rss) = system::memory_usage() else {
            return false;
        };

        self.resident_memory.set(&Labels::new(), rss as f64);
        self.add("memory_usage", values([("value", rss as f64)]));
        true
    }

    fn sample_file_descriptors(&mut self) {
        if let Some(max) = system::max_open_file_descriptors() {
            self.max_fds.set(&Labels::new(), max as f64);
        }

        if let Some(open) = system::file_descriptor_count() {
            self.open_fds.set(&Labels::new(), open as f64);
            self.add("file_descriptors", values([("value", open as f64)]));
        }
    }

    fn sample_cpu(&mut self) -> bool {
        let Some(cpu) = system::process_cpu_time() else {
            return false;
        };

        self.cpu_seconds.set(&Labels::new(), cpu.as_secs_f64());
        let interval_ms = self.cpu_time.compare(millis(cpu));
        self.add("cpu_time", values([("value", interval_ms)]));
        true
    }

    fn sample_allocations(&mut self) {
        if !alloc::is_active() {
            return;
        }

        let stats = alloc::stats();
        let count = self.allocations.compare(stats.allocations);
        let bytes = self.allocated_bytes.compare(stats.allocated_bytes);
        self.add("allocations", values([("count", count as f64), ("bytes", bytes as f64)]));
    }

    /// Samples that have been gathered but not yet flushed.
    pub fn pending(&self) -> &[MetricSample] {
        &self.buffer
    }
}

fn cpu_millis() -> f64 {
    system::process_cpu_time().map_or(0.0, millis)
}

impl Sampler for ProcessSampler {
    fn name(&self) -> &str {
        "process"
    }

    fn sample(&mut self) -> Result<(), SampleError> {
        let has_memory = self.sample_memory();
        self.sample_file_descriptors();
        let has_cpu = self.sample_cpu();
        self.sample_allocations();

        if !has_memory && !has_cpu {
            self.buffer.clear();
            return Err(SampleError::Unavailable { what: "process memory and CPU usage" });
        }

        self.sink.submit(mem::take(&mut self.buffer));
        Ok(())
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use std::sync::Arc;

    use metrics_util::debugging::DebuggingRecorder;

    use super::ProcessSampler;
    use crate::{test_util, Config, Labels, MemorySink, ProcessRole, Sampler, Telemetry};

    #[test]
    fn samples_are_prefixed_and_flushed() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        let sink = MemorySink::new();
        let telemetry = Telemetry::builder()
            .with_config(Config::default().with_role(ProcessRole::Worker))
            .with_recorder(Arc::new(recorder))
            .with_sink(sink.clone())
            .build()
            .unwrap();

        let mut sampler = ProcessSampler::new(&telemetry).unwrap();
        sampler.sample().unwrap();
        assert!(sampler.pending().is_empty());

        let samples = sink.drain();
        let series: Vec<&str> = samples.iter().map(|s| s.series()).collect();
        assert!(series.contains(&"worker_memory_usage"));
        assert!(series.contains(&"worker_file_descriptors"));
        assert!(series.contains(&"worker_cpu_time"));

        let cpu = samples.iter().find(|s| s.series() == "worker_cpu_time").unwrap();
        assert!(cpu.values()["value"] >= 0.0);

        let rss = test_util::capture(&snapshotter).gauge("process_resident_memory_bytes", &Labels::new());
        assert!(rss.unwrap() > 0.0);
    }

    #[test]
    fn conflicting_gauge_is_a_setup_error() {
        let sink = MemorySink::new();
        let telemetry = Telemetry::builder()
            .with_recorder(Arc::new(DebuggingRecorder::new()))
            .with_sink(sink)
            .build()
            .unwrap();
        telemetry.registry().counter("process_open_fds", "taken", &Labels::new()).unwrap();

        assert!(ProcessSampler::new(&telemetry).is_err());
    }
}

use std::time::Duration;

use quanta::Clock;

use crate::{
    registry::Histogram,
    sample::{values, MetricSample},
    system, Labels,
};

/// Accumulated timing for one call site within one transaction.
///
/// Every call through [`measure`][MethodCallTimer::measure] adds to the wall-clock time, CPU time
/// and call count.  Once the cumulative wall-clock time reaches the configured threshold the timer
/// is considered worth reporting, and from then on each call is also observed on the method call
/// histograms, under the owning transaction's labels at the time of the call plus `method`.
#[derive(Debug)]
pub struct MethodCallTimer {
    name: String,
    real_time: Duration,
    cpu_time: Duration,
    call_count: u64,
    threshold: Duration,
    real_histogram: Histogram,
    cpu_histogram: Histogram,
}

impl MethodCallTimer {
    /// Creates a new `MethodCallTimer` for the call site `name`.
    pub fn new(
        name: &str,
        threshold: Duration,
        real_histogram: Histogram,
        cpu_histogram: Histogram,
    ) -> Self {
        MethodCallTimer {
            name: name.to_string(),
            real_time: Duration::ZERO,
            cpu_time: Duration::ZERO,
            call_count: 0,
            threshold,
            real_histogram,
            cpu_histogram,
        }
    }

    /// Runs `f`, adding its wall-clock and CPU time to this timer.
    pub fn measure<T, F>(&mut self, clock: &Clock, transaction_labels: &Labels, f: F) -> T
    where
        F: FnOnce() -> T,
    {
        let (result, real, cpu) = time_call(clock, f);
        self.record(real, cpu, transaction_labels);
        result
    }

    /// Adds one completed call to this timer.
    ///
    /// `transaction_labels` are the owning transaction's labels as of this call.
    pub fn record(&mut self, real: Duration, cpu: Duration, transaction_labels: &Labels) {
        self.real_time += real;
        self.cpu_time += cpu;
        self.call_count += 1;

        if self.above_threshold() {
            let labels = self.observation_labels(transaction_labels);
            self.real_histogram.observe(&labels, real.as_secs_f64());
            self.cpu_histogram.observe(&labels, cpu.as_secs_f64());
        }
    }

    fn observation_labels(&self, transaction_labels: &Labels) -> Labels {
        let mut labels = transaction_labels.clone();
        labels.insert("method".to_string(), self.name.clone());
        labels
    }

    /// Returns `true` if the cumulative wall-clock time has reached the threshold.
    pub fn above_threshold(&self) -> bool {
        self.real_time >= self.threshold
    }

    /// Call site name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cumulative wall-clock time.
    pub fn real_time(&self) -> Duration {
        self.real_time
    }

    /// Cumulative CPU time.
    pub fn cpu_time(&self) -> Duration {
        self.cpu_time
    }

    /// Number of completed calls.
    pub fn call_count(&self) -> u64 {
        self.call_count
    }

    /// Builds the sample reported for this timer, with durations in milliseconds.
    ///
    /// The sample is tagged with `method` only; the owning transaction stamps its `action`.
    pub fn to_sample(&self, series: &str) -> MetricSample {
        MetricSample::new(
            series,
            values([
                ("duration", millis(self.real_time)),
                ("cpu_duration", millis(self.cpu_time)),
                ("call_count", self.call_count as f64),
            ]),
            labels! { "method" => self.name },
        )
    }
}

/// Runs `f` and returns its result along with the wall-clock and thread CPU time it took.
pub(crate) fn time_call<T, F>(clock: &Clock, f: F) -> (T, Duration, Duration)
where
    F: FnOnce() -> T,
{
    let cpu_start = system::thread_cpu_time();
    let start = clock.now();

    let result = f();

    let real = clock.now().saturating_duration_since(start);
    let cpu = match (cpu_start, system::thread_cpu_time()) {
        (Some(start), Some(end)) => end.saturating_sub(start),
        _ => Duration::ZERO,
    };

    (result, real, cpu)
}

pub(crate) fn millis(duration: Duration) -> f64 {
    duration.as_nanos() as f64 / 1_000_000.0
}

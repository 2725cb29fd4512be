use std::{fmt, sync::Arc};

use metrics::Recorder;
use quanta::Clock;
use thiserror::Error;
use tracing::debug;

use crate::{
    config::{Config, ConfigError},
    registry::{FeatureSwitch, GlobalRecorder, Histogram, MetricRegistry, RegistryError},
    sampler::{BackgroundSampler, ProcessSampler, SamplerError},
    sink::{NullSink, SampleSink},
    sli::SliRegistry,
    transaction::{BackgroundJob, LabelSource, RequestEnv, Transaction},
    Labels,
};

const TRANSACTION_DURATION_BUCKETS: &[f64] = &[0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 60.0];
const TRANSACTION_MEMORY_BUCKETS: &[f64] =
    &[500_000.0, 1_000_000.0, 2_000_000.0, 5_000_000.0, 10_000_000.0, 20_000_000.0, 100_000_000.0];
const METHOD_CALL_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.5, 1.0];

/// Errors that could occur while building [`Telemetry`].
#[derive(Debug, Error)]
pub enum BuildError {
    /// The configuration was invalid.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// A core metric conflicted with an existing registration.
    #[error("failed to register core metrics: {0}")]
    Registry(#[from] RegistryError),
}

pub(crate) struct CoreMetrics {
    pub(crate) transaction_duration: Histogram,
    pub(crate) transaction_allocated_memory: Histogram,
    pub(crate) method_call_duration: Histogram,
    pub(crate) method_call_cpu_duration: Histogram,
}

impl CoreMetrics {
    fn register(registry: &MetricRegistry) -> Result<Self, RegistryError> {
        let none = Labels::new();
        Ok(CoreMetrics {
            transaction_duration: registry.histogram(
                "transaction_duration_seconds",
                "Transaction duration",
                &none,
                TRANSACTION_DURATION_BUCKETS,
            )?,
            transaction_allocated_memory: registry.histogram(
                "transaction_allocated_memory_bytes",
                "Transaction allocated memory bytes",
                &none,
                TRANSACTION_MEMORY_BUCKETS,
            )?,
            method_call_duration: registry.histogram(
                "method_call_duration_seconds",
                "Method calls real duration",
                &none,
                METHOD_CALL_BUCKETS,
            )?,
            method_call_cpu_duration: registry.histogram(
                "method_call_cpu_duration_seconds",
                "Method calls CPU duration",
                &none,
                METHOD_CALL_BUCKETS,
            )?,
        })
    }
}

struct Inner {
    config: Config,
    registry: Arc<MetricRegistry>,
    sink: Arc<dyn SampleSink>,
    clock: Clock,
    sli: SliRegistry,
    core: CoreMetrics,
}

/// Instrumentation state shared by every transaction, sampler and SLI of a process.
///
/// `Telemetry` is cheap to clone; clones share the same state.  It is normally built once at
/// startup and handed to whatever needs to create transactions or samplers.
#[derive(Clone)]
pub struct Telemetry {
    inner: Arc<Inner>,
}

impl Telemetry {
    /// Creates a new [`TelemetryBuilder`].
    pub fn builder() -> TelemetryBuilder {
        TelemetryBuilder::new()
    }

    /// Configuration in effect.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Metric registry.
    pub fn registry(&self) -> &MetricRegistry {
        &self.inner.registry
    }

    /// SLI registry.
    pub fn sli(&self) -> &SliRegistry {
        &self.inner.sli
    }

    /// Clock used for all timing.
    pub fn clock(&self) -> &Clock {
        &self.inner.clock
    }

    /// Sink that samples are submitted to.
    pub fn sink(&self) -> &Arc<dyn SampleSink> {
        &self.inner.sink
    }

    pub(crate) fn core(&self) -> &CoreMetrics {
        &self.inner.core
    }

    /// Creates a transaction labelled by `source`.
    pub fn transaction<S>(&self, source: S) -> Transaction
    where
        S: LabelSource + 'static,
    {
        Transaction::new(self, source)
    }

    /// Creates a transaction for a web request.
    ///
    /// Keep a clone of `env` to record the route once it is known.
    pub fn web_transaction(&self, env: RequestEnv) -> Transaction {
        Transaction::new(self, env)
    }

    /// Creates a transaction for a background job run by `worker_class`.
    pub fn background_transaction(&self, worker_class: &str) -> Transaction {
        Transaction::new(self, BackgroundJob::new(worker_class))
    }

    /// Creates a stopped process sampler using the configured sample interval.
    ///
    /// # Errors
    ///
    /// If the process gauges conflict with existing metrics, an error is returned.
    pub fn process_sampler(&self) -> Result<BackgroundSampler<ProcessSampler>, SamplerError> {
        let sampler = ProcessSampler::new(self)?;
        Ok(BackgroundSampler::new(sampler, self.config().sample_interval()))
    }

    /// Creates and starts the process sampler, if the process role runs samplers.
    ///
    /// The sampler stops when the returned value is dropped.
    ///
    /// # Errors
    ///
    /// If the sampler cannot be created or its thread cannot be spawned, an error is returned.
    pub fn start_process_sampler(
        &self,
    ) -> Result<Option<BackgroundSampler<ProcessSampler>>, SamplerError> {
        let role = self.config().role();
        if !role.runs_samplers() {
            debug!(%role, "Process role does not run samplers.");
            return Ok(None);
        }

        let sampler = self.process_sampler()?;
        sampler.start()?;
        Ok(Some(sampler))
    }
}

impl fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Telemetry")
            .field("config", &self.inner.config)
            .field("registry", &self.inner.registry)
            .field("sli", &self.inner.sli)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Telemetry`].
pub struct TelemetryBuilder {
    config: Config,
    recorder: Option<Arc<dyn Recorder + Send + Sync>>,
    switch: Option<Arc<dyn FeatureSwitch>>,
    sink: Option<Arc<dyn SampleSink>>,
    clock: Option<Clock>,
}

impl TelemetryBuilder {
    /// Creates a new `TelemetryBuilder` with default values.
    pub fn new() -> Self {
        TelemetryBuilder { config: Config::default(), recorder: None, switch: None, sink: None, clock: None }
    }

    /// Sets the configuration.
    ///
    /// Defaults to [`Config::default`].
    #[must_use]
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Sets the recorder metrics are registered with.
    ///
    /// Defaults to [`GlobalRecorder`], which forwards to the globally installed recorder.
    #[must_use]
    pub fn with_recorder(mut self, recorder: Arc<dyn Recorder + Send + Sync>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Sets the feature switch deciding which metrics are collected.
    ///
    /// Defaults to enabling every metric.
    #[must_use]
    pub fn with_feature_switch<F>(mut self, switch: F) -> Self
    where
        F: FeatureSwitch + 'static,
    {
        self.switch = Some(Arc::new(switch));
        self
    }

    /// Sets the sink samples are submitted to.
    ///
    /// Defaults to [`NullSink`].
    #[must_use]
    pub fn with_sink<S>(mut self, sink: S) -> Self
    where
        S: SampleSink + 'static,
    {
        self.sink = Some(Arc::new(sink));
        self
    }

    /// Sets the clock used for timing.
    ///
    /// Defaults to a new [`Clock`].
    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Builds the [`Telemetry`].
    ///
    /// # Errors
    ///
    /// If the configuration is invalid, or the core metrics conflict with metrics already known
    /// to the recorder, an error is returned.
    pub fn build(self) -> Result<Telemetry, BuildError> {
        self.config.validate()?;

        let recorder = self.recorder.unwrap_or_else(|| Arc::new(GlobalRecorder));
        let mut registry = MetricRegistry::new(recorder).with_enabled(self.config.enabled());
        if let Some(switch) = self.switch {
            registry = registry.with_feature_switch(switch);
        }
        let registry = Arc::new(registry);

        let core = CoreMetrics::register(&registry)?;
        let sli = SliRegistry::new(Arc::clone(&registry));

        debug!(
            enabled = self.config.enabled(),
            role = %self.config.role(),
            "Telemetry built."
        );

        Ok(Telemetry {
            inner: Arc::new(Inner {
                config: self.config,
                registry,
                sink: self.sink.unwrap_or_else(|| Arc::new(NullSink)),
                clock: self.clock.unwrap_or_default(),
                sli,
                core,
            }),
        })
    }
}

impl Default for TelemetryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

//! Metric handle registration.
//!
//! [`MetricRegistry`] hands out counter, gauge and histogram handles backed by a
//! [`Recorder`][metrics::Recorder].  Handles are cached by name, so asking for the same metric
//! twice yields the same handle, while asking for an existing name under a different kind is a
//! programmer error and is reported as [`RegistryError::KindMismatch`].
//!
//! When metrics are globally disabled, or when the [`FeatureSwitch`] reports a metric as gated off,
//! a null handle is returned instead.  Null handles accept every operation and do nothing, so call
//! sites never need to branch on whether metrics are enabled.
use std::{collections::HashMap, fmt, str::FromStr, sync::Arc};

use metrics::{Key, KeyName, Level, Metadata, Recorder, SharedString, Unit};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::debug;

use crate::{
    labels::{merge, to_metric_labels},
    Labels,
};

static METADATA: Metadata<'static> =
    Metadata::new(module_path!(), Level::INFO, Some(module_path!()));

/// Metric kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MetricKind {
    /// Monotonically increasing count.
    Counter,

    /// Point-in-time value.
    Gauge,

    /// Distribution of observed values.
    Histogram,
}

impl MetricKind {
    /// Returns the lowercase name of the kind.
    pub const fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Histogram => "histogram",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "counter" => Ok(MetricKind::Counter),
            "gauge" => Ok(MetricKind::Gauge),
            "histogram" => Ok(MetricKind::Histogram),
            other => Err(RegistryError::UnknownKind(other.to_string())),
        }
    }
}

/// Errors that could occur while registering a metric.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// The name was already registered as a different kind of metric.
    #[error("metric `{name}` is already registered as a {existing}, not a {requested}")]
    KindMismatch {
        /// Metric name.
        name: String,

        /// Kind the metric was first registered as.
        existing: MetricKind,

        /// Kind that was requested.
        requested: MetricKind,
    },

    /// The metric name was empty.
    #[error("invalid metric name `{0}`")]
    InvalidName(String),

    /// The metric kind was not recognized.
    #[error("unknown metric kind `{0}`")]
    UnknownKind(String),
}

/// A boolean lookup deciding whether an individual metric is collected.
pub trait FeatureSwitch: Send + Sync {
    /// Returns `true` if the metric with the given name should be collected.
    fn is_enabled(&self, name: &str) -> bool;
}

/// A feature switch that enables every metric.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllEnabled;

impl FeatureSwitch for AllEnabled {
    fn is_enabled(&self, _name: &str) -> bool {
        true
    }
}

impl<F> FeatureSwitch for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn is_enabled(&self, name: &str) -> bool {
        self(name)
    }
}

/// A recorder that forwards to whichever recorder is installed globally.
///
/// If no global recorder has been installed, operations fall through to the no-op recorder.
#[derive(Clone, Copy, Debug, Default)]
pub struct GlobalRecorder;

impl Recorder for GlobalRecorder {
    fn describe_counter(&self, key: KeyName, unit: Option<Unit>, description: SharedString) {
        metrics::with_recorder(|recorder| recorder.describe_counter(key, unit, description));
    }

    fn describe_gauge(&self, key: KeyName, unit: Option<Unit>, description: SharedString) {
        metrics::with_recorder(|recorder| recorder.describe_gauge(key, unit, description));
    }

    fn describe_histogram(&self, key: KeyName, unit: Option<Unit>, description: SharedString) {
        metrics::with_recorder(|recorder| recorder.describe_histogram(key, unit, description));
    }

    fn register_counter(&self, key: &Key, metadata: &Metadata<'_>) -> metrics::Counter {
        metrics::with_recorder(|recorder| recorder.register_counter(key, metadata))
    }

    fn register_gauge(&self, key: &Key, metadata: &Metadata<'_>) -> metrics::Gauge {
        metrics::with_recorder(|recorder| recorder.register_gauge(key, metadata))
    }

    fn register_histogram(&self, key: &Key, metadata: &Metadata<'_>) -> metrics::Histogram {
        metrics::with_recorder(|recorder| recorder.register_histogram(key, metadata))
    }
}

trait Primitive: Clone + Send + Sync + 'static {
    fn register(recorder: &dyn Recorder, key: &Key) -> Self;
    fn describe(recorder: &dyn Recorder, name: KeyName, unit: Option<Unit>, help: SharedString);
}

impl Primitive for metrics::Counter {
    fn register(recorder: &dyn Recorder, key: &Key) -> Self {
        recorder.register_counter(key, &METADATA)
    }

    fn describe(recorder: &dyn Recorder, name: KeyName, unit: Option<Unit>, help: SharedString) {
        recorder.describe_counter(name, unit, help);
    }
}

impl Primitive for metrics::Gauge {
    fn register(recorder: &dyn Recorder, key: &Key) -> Self {
        recorder.register_gauge(key, &METADATA)
    }

    fn describe(recorder: &dyn Recorder, name: KeyName, unit: Option<Unit>, help: SharedString) {
        recorder.describe_gauge(name, unit, help);
    }
}

impl Primitive for metrics::Histogram {
    fn register(recorder: &dyn Recorder, key: &Key) -> Self {
        recorder.register_histogram(key, &METADATA)
    }

    fn describe(recorder: &dyn Recorder, name: KeyName, unit: Option<Unit>, help: SharedString) {
        recorder.describe_histogram(name, unit, help);
    }
}

/// One named metric and its per-label-set children.
struct Family<P> {
    name: String,
    base_labels: Labels,
    recorder: Arc<dyn Recorder + Send + Sync>,
    children: RwLock<HashMap<Labels, P>>,
}

impl<P: Primitive> Family<P> {
    fn new(
        name: &str,
        help: &str,
        base_labels: &Labels,
        recorder: Arc<dyn Recorder + Send + Sync>,
    ) -> Self {
        P::describe(
            &*recorder,
            KeyName::from(name.to_string()),
            unit_for(name),
            SharedString::from(help.to_string()),
        );

        Family {
            name: name.to_string(),
            base_labels: base_labels.clone(),
            recorder,
            children: RwLock::new(HashMap::new()),
        }
    }

    fn child(&self, labels: &Labels) -> P {
        if let Some(handle) = self.children.read().get(labels) {
            return handle.clone();
        }

        let mut children = self.children.write();
        children
            .entry(labels.clone())
            .or_insert_with(|| {
                let labels = to_metric_labels(&merge(&self.base_labels, labels));
                let key = Key::from_parts(self.name.clone(), labels);
                P::register(&*self.recorder, &key)
            })
            .clone()
    }
}

fn unit_for(name: &str) -> Option<Unit> {
    if name.ends_with("_seconds") {
        Some(Unit::Seconds)
    } else if name.ends_with("_bytes") {
        Some(Unit::Bytes)
    } else {
        None
    }
}

#[derive(Clone)]
struct Handle<P> {
    name: Arc<str>,
    family: Option<Arc<Family<P>>>,
}

impl<P: Primitive> Handle<P> {
    fn live(family: Family<P>) -> Self {
        Handle { name: Arc::from(family.name.as_str()), family: Some(Arc::new(family)) }
    }

    fn null(name: &str) -> Self {
        Handle { name: Arc::from(name), family: None }
    }

    fn with(&self, labels: &Labels, op: impl FnOnce(P)) {
        if let Some(family) = &self.family {
            op(family.child(labels));
        }
    }
}

impl<P> fmt::Debug for Handle<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("name", &self.name)
            .field("null", &self.family.is_none())
            .finish()
    }
}

/// A counter handle.
#[derive(Clone, Debug)]
pub struct Counter(Handle<metrics::Counter>);

impl Counter {
    /// Creates a counter handle that ignores every operation.
    pub fn noop() -> Self {
        Counter(Handle::null(""))
    }

    /// Metric name.
    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Returns `true` if this is a null handle.
    pub fn is_null(&self) -> bool {
        self.0.family.is_none()
    }

    /// Increments the counter for the given label set.
    pub fn increment(&self, labels: &Labels, value: u64) {
        self.0.with(labels, |counter| counter.increment(value));
    }

    /// Registers the counter for the given label set without changing its value.
    ///
    /// This makes the label set visible with a value of zero before it is first incremented.
    pub fn touch(&self, labels: &Labels) {
        self.0.with(labels, |_| {});
    }
}

/// A gauge handle.
#[derive(Clone, Debug)]
pub struct Gauge(Handle<metrics::Gauge>);

impl Gauge {
    /// Creates a gauge handle that ignores every operation.
    pub fn noop() -> Self {
        Gauge(Handle::null(""))
    }

    /// Metric name.
    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Returns `true` if this is a null handle.
    pub fn is_null(&self) -> bool {
        self.0.family.is_none()
    }

    /// Sets the gauge for the given label set.
    pub fn set(&self, labels: &Labels, value: f64) {
        self.0.with(labels, |gauge| gauge.set(value));
    }

    /// Increments the gauge for the given label set.
    pub fn increment(&self, labels: &Labels, value: f64) {
        self.0.with(labels, |gauge| gauge.increment(value));
    }

    /// Decrements the gauge for the given label set.
    pub fn decrement(&self, labels: &Labels, value: f64) {
        self.0.with(labels, |gauge| gauge.decrement(value));
    }
}

/// A histogram handle.
#[derive(Clone, Debug)]
pub struct Histogram {
    handle: Handle<metrics::Histogram>,
    buckets: Arc<[f64]>,
}

impl Histogram {
    /// Creates a histogram handle that ignores every operation.
    pub fn noop() -> Self {
        Histogram { handle: Handle::null(""), buckets: Arc::from(Vec::new()) }
    }

    /// Metric name.
    pub fn name(&self) -> &str {
        &self.handle.name
    }

    /// Returns `true` if this is a null handle.
    pub fn is_null(&self) -> bool {
        self.handle.family.is_none()
    }

    /// Bucket boundaries requested at registration.
    ///
    /// Buckets are advisory: exporters that support per-metric buckets can be configured with them.
    pub fn buckets(&self) -> &[f64] {
        &self.buckets
    }

    /// Records an observation for the given label set.
    pub fn observe(&self, labels: &Labels, value: f64) {
        self.handle.with(labels, |histogram| histogram.record(value));
    }
}

#[derive(Clone)]
enum Entry {
    Counter(Counter),
    Gauge(Gauge),
    Histogram(Histogram),
}

impl Entry {
    fn kind(&self) -> MetricKind {
        match self {
            Entry::Counter(_) => MetricKind::Counter,
            Entry::Gauge(_) => MetricKind::Gauge,
            Entry::Histogram(_) => MetricKind::Histogram,
        }
    }
}

trait Registered: Clone {
    const KIND: MetricKind;

    fn into_entry(self) -> Entry;
    fn from_entry(entry: &Entry) -> Option<Self>;
}

macro_rules! impl_registered {
    ($ty:ident) => {
        impl Registered for $ty {
            const KIND: MetricKind = MetricKind::$ty;

            fn into_entry(self) -> Entry {
                Entry::$ty(self)
            }

            fn from_entry(entry: &Entry) -> Option<Self> {
                match entry {
                    Entry::$ty(handle) => Some(handle.clone()),
                    _ => None,
                }
            }
        }
    };
}

impl_registered!(Counter);
impl_registered!(Gauge);
impl_registered!(Histogram);

/// Process-wide factory and cache for metric handles.
///
/// A single registry is normally owned by [`Telemetry`][crate::Telemetry] and shared with every
/// component that needs to create metrics.
pub struct MetricRegistry {
    recorder: Arc<dyn Recorder + Send + Sync>,
    switch: Arc<dyn FeatureSwitch>,
    enabled: bool,
    entries: Mutex<HashMap<String, Entry>>,
}

impl MetricRegistry {
    /// Creates a new `MetricRegistry` backed by the given recorder, with every metric enabled.
    pub fn new(recorder: Arc<dyn Recorder + Send + Sync>) -> Self {
        MetricRegistry {
            recorder,
            switch: Arc::new(AllEnabled),
            enabled: true,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Sets the feature switch consulted when a metric is first registered.
    #[must_use]
    pub fn with_feature_switch(mut self, switch: Arc<dyn FeatureSwitch>) -> Self {
        self.switch = switch;
        self
    }

    /// Sets whether metrics are globally enabled.
    ///
    /// When disabled, every registration returns a null handle.
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Returns `true` if metrics are globally enabled.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Returns the kind a name was registered as, if any.
    pub fn kind_of(&self, name: &str) -> Option<MetricKind> {
        self.entries.lock().get(name).map(Entry::kind)
    }

    /// Gets or registers a counter.
    ///
    /// # Errors
    ///
    /// If the name is empty, or was already registered as a different kind, an error is returned.
    pub fn counter(
        &self,
        name: &str,
        help: &str,
        base_labels: &Labels,
    ) -> Result<Counter, RegistryError> {
        self.fetch(name, |live, recorder| {
            if live {
                Counter(Handle::live(Family::new(name, help, base_labels, recorder)))
            } else {
                Counter(Handle::null(name))
            }
        })
    }

    /// Gets or registers a gauge.
    ///
    /// # Errors
    ///
    /// If the name is empty, or was already registered as a different kind, an error is returned.
    pub fn gauge(
        &self,
        name: &str,
        help: &str,
        base_labels: &Labels,
    ) -> Result<Gauge, RegistryError> {
        self.fetch(name, |live, recorder| {
            if live {
                Gauge(Handle::live(Family::new(name, help, base_labels, recorder)))
            } else {
                Gauge(Handle::null(name))
            }
        })
    }

    /// Gets or registers a histogram.
    ///
    /// # Errors
    ///
    /// If the name is empty, or was already registered as a different kind, an error is returned.
    pub fn histogram(
        &self,
        name: &str,
        help: &str,
        base_labels: &Labels,
        buckets: &[f64],
    ) -> Result<Histogram, RegistryError> {
        self.fetch(name, |live, recorder| {
            let handle = if live {
                Handle::live(Family::new(name, help, base_labels, recorder))
            } else {
                Handle::null(name)
            };
            Histogram { handle, buckets: Arc::from(buckets) }
        })
    }

    fn fetch<T, F>(&self, name: &str, create: F) -> Result<T, RegistryError>
    where
        T: Registered,
        F: FnOnce(bool, Arc<dyn Recorder + Send + Sync>) -> T,
    {
        if name.is_empty() {
            return Err(RegistryError::InvalidName(name.to_string()));
        }

        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(name) {
            return T::from_entry(entry).ok_or_else(|| RegistryError::KindMismatch {
                name: name.to_string(),
                existing: entry.kind(),
                requested: T::KIND,
            });
        }

        let live = self.enabled && self.switch.is_enabled(name);
        if !live {
            debug!(metric = name, kind = %T::KIND, "Registering null handle for disabled metric.");
        }

        let handle = create(live, Arc::clone(&self.recorder));
        entries.insert(name.to_string(), handle.clone().into_entry());
        Ok(handle)
    }
}

impl fmt::Debug for MetricRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricRegistry")
            .field("enabled", &self.enabled)
            .field("registered", &self.entries.lock().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use metrics::NoopRecorder;
    use metrics_util::debugging::DebuggingRecorder;

    use super::{MetricKind, MetricRegistry, RegistryError};
    use crate::{test_util, Labels};

    fn debugging_registry() -> (MetricRegistry, metrics_util::debugging::Snapshotter) {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        (MetricRegistry::new(Arc::new(recorder)), snapshotter)
    }

    #[test]
    fn handles_are_cached_by_name() {
        let (registry, snapshotter) = debugging_registry();

        let first = registry.counter("jobs_total", "Jobs processed", &Labels::new()).unwrap();
        let second = registry.counter("jobs_total", "ignored", &Labels::new()).unwrap();
        first.increment(&labels! { "queue" => "default" }, 2);
        second.increment(&labels! { "queue" => "default" }, 3);

        assert_eq!(
            test_util::capture(&snapshotter).counter("jobs_total", &labels! { "queue" => "default" }),
            Some(5)
        );
        assert_eq!(registry.kind_of("jobs_total"), Some(MetricKind::Counter));
    }

    #[test]
    fn base_labels_are_merged() {
        let (registry, snapshotter) = debugging_registry();

        let gauge = registry
            .gauge("queue_depth", "Queue depth", &labels! { "shard" => "main" })
            .unwrap();
        gauge.set(&labels! { "queue" => "mailers" }, 4.0);
        gauge.increment(&labels! { "queue" => "mailers" }, 1.5);

        assert_eq!(
            test_util::capture(&snapshotter)
                .gauge("queue_depth", &labels! { "shard" => "main", "queue" => "mailers" }),
            Some(5.5)
        );
    }

    #[test]
    fn conflicting_kind_fails_fast() {
        let (registry, _snapshotter) = debugging_registry();

        registry.counter("requests", "Requests", &Labels::new()).unwrap();
        let err = registry.gauge("requests", "Requests", &Labels::new()).unwrap_err();
        assert_eq!(
            err,
            RegistryError::KindMismatch {
                name: "requests".to_string(),
                existing: MetricKind::Counter,
                requested: MetricKind::Gauge,
            }
        );

        let err = registry.histogram("requests", "Requests", &Labels::new(), &[1.0]).unwrap_err();
        assert!(matches!(err, RegistryError::KindMismatch { .. }));
    }

    #[test]
    fn empty_name_is_rejected() {
        let (registry, _snapshotter) = debugging_registry();
        assert_eq!(
            registry.counter("", "nothing", &Labels::new()).unwrap_err(),
            RegistryError::InvalidName(String::new())
        );
    }

    #[test]
    fn disabled_registry_returns_null_handles() {
        let (registry, snapshotter) = debugging_registry();
        let registry = registry.with_enabled(false);

        let counter = registry.counter("disabled_total", "Disabled", &Labels::new()).unwrap();
        assert!(counter.is_null());
        assert_eq!(counter.name(), "disabled_total");
        counter.increment(&Labels::new(), 1);

        let histogram =
            registry.histogram("disabled_seconds", "Disabled", &Labels::new(), &[0.1]).unwrap();
        assert!(histogram.is_null());
        assert_eq!(histogram.buckets(), &[0.1]);
        histogram.observe(&Labels::new(), 1.0);

        assert!(test_util::capture(&snapshotter).is_empty());
    }

    #[test]
    fn feature_switch_gates_individual_metrics() {
        let (registry, _snapshotter) = debugging_registry();
        let consulted = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&consulted);
        let registry = registry.with_feature_switch(Arc::new(move |name: &str| {
            counted.fetch_add(1, Ordering::SeqCst);
            name != "gated_total"
        }));

        let gated = registry.counter("gated_total", "Gated", &Labels::new()).unwrap();
        let open = registry.counter("open_total", "Open", &Labels::new()).unwrap();
        assert!(gated.is_null());
        assert!(!open.is_null());

        // Cached handles do not consult the switch again.
        registry.counter("gated_total", "Gated", &Labels::new()).unwrap();
        assert_eq!(consulted.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn kind_parsing() {
        assert_eq!("histogram".parse::<MetricKind>(), Ok(MetricKind::Histogram));
        assert_eq!(
            "summary".parse::<MetricKind>(),
            Err(RegistryError::UnknownKind("summary".to_string()))
        );
        assert_eq!(MetricKind::Gauge.to_string(), "gauge");
    }

    #[test]
    fn noop_handles_accept_everything() {
        let registry = MetricRegistry::new(Arc::new(NoopRecorder));
        let counter = registry.counter("noop_total", "Noop", &Labels::new()).unwrap();
        counter.increment(&Labels::new(), 1);
        counter.touch(&Labels::new());

        super::Counter::noop().increment(&Labels::new(), 1);
        super::Gauge::noop().set(&Labels::new(), 1.0);
        super::Histogram::noop().observe(&Labels::new(), 1.0);
        assert!(super::Counter::noop().is_null());
    }
}

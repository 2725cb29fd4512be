//! Per-unit-of-work metric collection.
//!
//! A [`Transaction`] covers one web request or one background job.  While it runs it is the
//! current transaction of its thread, which is how instrumented calls, [`measure`] and
//! [`add_event`] find it without it being passed around explicitly.
//!
//! A transaction moves through four phases:
//!
//! - `Idle`: created, not yet started
//! - `Running`: inside [`Transaction::run`]; this is the only phase in which it is current
//! - `Completed`: `run` has returned or unwound, and duration and memory have been recorded
//! - `Finished`: [`Transaction::finish`] has submitted its samples; it cannot be reused
use std::{
    cell::{OnceCell, RefCell},
    collections::BTreeMap,
    fmt,
    rc::Rc,
    time::Duration,
};

use indexmap::IndexMap;
use quanta::Instant;
use thiserror::Error;
use tracing::error;

use crate::{
    labels::merge,
    method_call::{millis, time_call, MethodCallTimer},
    registry::RegistryError,
    sample::{values, MetricSample},
    system, Labels, Telemetry,
};

mod background;
mod web;

pub use self::background::BackgroundJob;
pub use self::web::RequestEnv;

thread_local! {
    static CURRENT: RefCell<Option<Transaction>> = const { RefCell::new(None) };
}

/// Errors that could occur while driving a transaction through its phases.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransactionError {
    /// `run` was called on a transaction that has already run.
    #[error("transaction has already been started")]
    AlreadyStarted,

    /// `run` was called while another transaction was current on this thread.
    #[error("another transaction is already running on this thread")]
    NestedTransaction,

    /// `finish` was called before `run` completed.
    #[error("transaction has not completed")]
    NotCompleted,

    /// `finish` was called twice.
    #[error("transaction has already been finished")]
    AlreadyFinished,
}

/// Lifecycle phase of a [`Transaction`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Created, not yet started.
    Idle,

    /// Inside `run`.
    Running,

    /// `run` has returned.
    Completed,

    /// Samples have been submitted.
    Finished,
}

/// Supplies the labels of a transaction.
///
/// Sources may not know their labels straight away: a web request only learns its controller and
/// action once routing has happened.  Returning `None` means "not known yet".
pub trait LabelSource {
    /// Returns the labels, if they are known.
    fn labels(&self) -> Option<Labels>;
}

impl LabelSource for Labels {
    fn labels(&self) -> Option<Labels> {
        (!self.is_empty()).then(|| self.clone())
    }
}

impl<F> LabelSource for F
where
    F: Fn() -> Option<Labels>,
{
    fn labels(&self) -> Option<Labels> {
        self()
    }
}

struct State {
    phase: Phase,
    values: IndexMap<String, f64>,
    samples: Vec<MetricSample>,
    timers: IndexMap<String, MethodCallTimer>,
    tags: Labels,
    started_at: Option<Instant>,
    finished_at: Option<Instant>,
    memory_before: Option<u64>,
    memory_after: Option<u64>,
}

struct Inner {
    telemetry: Telemetry,
    source: Box<dyn LabelSource>,
    labels: OnceCell<Labels>,
    state: RefCell<State>,
}

/// The metric context of one request or job.
///
/// `Transaction` is a cheap handle: clones refer to the same transaction.  It cannot be sent to
/// another thread.
#[derive(Clone)]
pub struct Transaction {
    inner: Rc<Inner>,
}

impl Transaction {
    /// Creates a new, idle `Transaction` whose labels come from `source`.
    pub fn new<S>(telemetry: &Telemetry, source: S) -> Self
    where
        S: LabelSource + 'static,
    {
        let state = State {
            phase: Phase::Idle,
            values: IndexMap::new(),
            samples: Vec::new(),
            timers: IndexMap::new(),
            tags: Labels::new(),
            started_at: None,
            finished_at: None,
            memory_before: None,
            memory_after: None,
        };

        Transaction {
            inner: Rc::new(Inner {
                telemetry: telemetry.clone(),
                source: Box::new(source),
                labels: OnceCell::new(),
                state: RefCell::new(state),
            }),
        }
    }

    /// Returns the transaction currently running on this thread, if any.
    pub fn current() -> Option<Transaction> {
        CURRENT.try_with(|current| current.borrow().clone()).ok().flatten()
    }

    /// Runs `f` as this transaction.
    ///
    /// For the duration of `f`, this is the current transaction of the calling thread.  When `f`
    /// returns, or unwinds, the transaction stops being current and its duration and allocated
    /// memory are recorded.
    ///
    /// # Errors
    ///
    /// If the transaction has already been run, or another transaction is running on this thread,
    /// an error is returned and `f` is not called.
    pub fn run<T, F>(&self, f: F) -> Result<T, TransactionError>
    where
        F: FnOnce() -> T,
    {
        match self.phase() {
            Phase::Idle => {}
            Phase::Finished => return Err(TransactionError::AlreadyFinished),
            Phase::Running | Phase::Completed => return Err(TransactionError::AlreadyStarted),
        }

        if Transaction::current().is_some() {
            return Err(TransactionError::NestedTransaction);
        }

        {
            let mut state = self.inner.state.borrow_mut();
            state.phase = Phase::Running;
            state.memory_before = system::memory_usage();
            state.started_at = Some(self.inner.telemetry.clock().now());
        }
        CURRENT.with(|current| *current.borrow_mut() = Some(self.clone()));

        let _guard = RunGuard { transaction: self };
        Ok(f())
    }

    fn complete(&self) {
        {
            let mut state = self.inner.state.borrow_mut();
            state.memory_after = system::memory_usage();
            state.finished_at = Some(self.inner.telemetry.clock().now());
            state.phase = Phase::Completed;
        }

        let labels = self.labels();
        let core = self.inner.telemetry.core();
        core.transaction_duration.observe(&labels, self.duration().as_secs_f64());
        core.transaction_allocated_memory.observe(&labels, self.allocated_memory() as f64);
    }

    /// Submits every sample gathered by this transaction to the sink.
    ///
    /// The batch holds one aggregate sample carrying the duration, allocated memory and every
    /// value set through [`increment`][Transaction::increment] or [`set`][Transaction::set], every
    /// sample added through [`add_metric`][Transaction::add_metric] or
    /// [`add_event`][Transaction::add_event], and one sample per method call site whose
    /// cumulative time reached the configured threshold.  Each sample is tagged with the
    /// transaction's `action` unless it already carries one.
    ///
    /// # Errors
    ///
    /// If the transaction has not completed `run`, or has already been finished, an error is
    /// returned.
    pub fn finish(&self) -> Result<(), TransactionError> {
        match self.phase() {
            Phase::Completed => {}
            Phase::Finished => return Err(TransactionError::AlreadyFinished),
            Phase::Idle | Phase::Running => return Err(TransactionError::NotCompleted),
        }

        let prefix = self.inner.telemetry.config().role().series_prefix();
        let duration = self.duration();
        let allocated_memory = self.allocated_memory();
        let action = self.action();

        let batch = {
            let mut state = self.inner.state.borrow_mut();
            state.phase = Phase::Finished;

            let mut aggregate: BTreeMap<String, f64> =
                state.values.iter().map(|(k, v)| (k.clone(), *v)).collect();
            aggregate.insert("duration".to_string(), millis(duration));
            aggregate.insert("allocated_memory".to_string(), allocated_memory as f64);

            let mut batch = Vec::with_capacity(1 + state.samples.len() + state.timers.len());
            batch.push(MetricSample::new(
                format!("{prefix}transactions"),
                aggregate,
                state.tags.clone(),
            ));
            batch.append(&mut state.samples);

            let method_series = format!("{prefix}method_calls");
            batch.extend(
                state
                    .timers
                    .values()
                    .filter(|timer| timer.above_threshold())
                    .map(|timer| timer.to_sample(&method_series)),
            );

            batch
        };

        let batch = match action {
            Some(action) => {
                batch.into_iter().map(|sample| sample.with_default_tag("action", &action)).collect()
            }
            None => batch,
        };

        self.inner.telemetry.sink().submit(batch);
        Ok(())
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.inner.state.borrow().phase
    }

    /// Labels of this transaction.
    ///
    /// The first non-empty label set obtained from the source is kept for the rest of the
    /// transaction.  Until the source knows its labels, an empty set is returned.
    pub fn labels(&self) -> Labels {
        if let Some(labels) = self.inner.labels.get() {
            return labels.clone();
        }

        match self.inner.source.labels() {
            Some(labels) if !labels.is_empty() => self.inner.labels.get_or_init(|| labels).clone(),
            _ => Labels::new(),
        }
    }

    /// Returns `"<controller>#<action>"` when both labels are present.
    pub fn action(&self) -> Option<String> {
        let labels = self.labels();
        match (labels.get("controller"), labels.get("action")) {
            (Some(controller), Some(action)) => Some(format!("{controller}#{action}")),
            _ => None,
        }
    }

    /// Wall-clock time between the start and end of `run`.
    ///
    /// Zero until `run` has completed.
    pub fn duration(&self) -> Duration {
        let state = self.inner.state.borrow();
        match (state.started_at, state.finished_at) {
            (Some(start), Some(end)) => end.saturating_duration_since(start),
            _ => Duration::ZERO,
        }
    }

    /// Growth of resident memory across `run`, in bytes.
    ///
    /// Zero when memory shrank, or could not be read.
    pub fn allocated_memory(&self) -> u64 {
        let state = self.inner.state.borrow();
        match (state.memory_before, state.memory_after) {
            (Some(before), Some(after)) => after.saturating_sub(before),
            _ => 0,
        }
    }

    /// Value accumulated under `name`, or zero.
    pub fn value(&self, name: &str) -> f64 {
        self.inner.state.borrow().values.get(name).copied().unwrap_or(0.0)
    }

    /// Adds `value` to `name`, both in the aggregate sample and in the
    /// `transaction_<name>_total` counter.
    pub fn increment(&self, name: &str, value: u64) {
        let metric = format!("transaction_{name}_total");
        let help = format!("Transaction {name} total");
        match self.inner.telemetry.registry().counter(&metric, &help, &Labels::new()) {
            Ok(counter) => counter.increment(&self.labels(), value),
            Err(e) => log_registry_error(&metric, &e),
        }

        self.increment_local(name, value as f64);
    }

    /// Adds `value` to `name` in the aggregate sample only.
    pub fn increment_local(&self, name: &str, value: f64) {
        *self.inner.state.borrow_mut().values.entry(name.to_string()).or_insert(0.0) += value;
    }

    /// Sets `name` to `value`, both in the aggregate sample and in the `transaction_<name>` gauge.
    pub fn set(&self, name: &str, value: f64) {
        let metric = format!("transaction_{name}");
        let help = format!("Transaction gauge {name}");
        match self.inner.telemetry.registry().gauge(&metric, &help, &Labels::new()) {
            Ok(gauge) => gauge.set(&self.labels(), value),
            Err(e) => log_registry_error(&metric, &e),
        }

        self.set_local(name, value);
    }

    /// Sets `name` to `value` in the aggregate sample only.
    pub fn set_local(&self, name: &str, value: f64) {
        self.inner.state.borrow_mut().values.insert(name.to_string(), value);
    }

    /// Adds a tag to the aggregate sample.
    pub fn add_tag(&self, key: &str, value: &str) {
        self.inner.state.borrow_mut().tags.insert(key.to_string(), value.to_string());
    }

    /// Adds an arbitrary sample to this transaction's batch.
    pub fn add_metric(&self, series: &str, values: BTreeMap<String, f64>, tags: Labels) {
        self.inner.state.borrow_mut().samples.push(MetricSample::new(series, values, tags));
    }

    /// Records a business event.
    ///
    /// Increments `transaction_event_<name>_total` under the transaction's labels merged with
    /// `tags`, and adds an `events` sample tagged with `tags` and the event name.
    pub fn add_event(&self, name: &str, tags: &Labels) {
        let metric = format!("transaction_event_{name}_total");
        let help = format!("Transaction event {name} counter");
        match self.inner.telemetry.registry().counter(&metric, &help, &Labels::new()) {
            Ok(counter) => counter.increment(&merge(&self.labels(), tags), 1),
            Err(e) => log_registry_error(&metric, &e),
        }

        let mut event_tags = tags.clone();
        event_tags.insert("event".to_string(), name.to_string());
        self.inner
            .state
            .borrow_mut()
            .samples
            .push(MetricSample::new("events", values([("count", 1.0)]), event_tags));
    }

    /// Runs `f`, adding its wall-clock time, CPU time and a call count to
    /// `<name>_real_time`, `<name>_cpu_time` and `<name>_call_count`.
    ///
    /// Times are recorded in milliseconds.
    pub fn measure<T, F>(&self, name: &str, f: F) -> T
    where
        F: FnOnce() -> T,
    {
        let (result, real, cpu) = time_call(self.inner.telemetry.clock(), f);

        self.increment_local(&format!("{name}_real_time"), millis(real));
        self.increment_local(&format!("{name}_cpu_time"), millis(cpu));
        self.increment_local(&format!("{name}_call_count"), 1.0);

        result
    }

    /// Runs `f`, attributing its time to the method call timer for `name`.
    ///
    /// The timer is created on first use.  Calls that unwind are not recorded.
    pub fn measure_method<T, F>(&self, name: &str, f: F) -> T
    where
        F: FnOnce() -> T,
    {
        let (result, real, cpu) = time_call(self.inner.telemetry.clock(), f);
        self.record_method_call(name, real, cpu);
        result
    }

    fn record_method_call(&self, name: &str, real: Duration, cpu: Duration) {
        let exists = self.inner.state.borrow().timers.contains_key(name);
        if !exists {
            let timer = self.new_timer(name);
            self.inner.state.borrow_mut().timers.insert(name.to_string(), timer);
        }

        let labels = self.labels();
        if let Some(timer) = self.inner.state.borrow_mut().timers.get_mut(name) {
            timer.record(real, cpu, &labels);
        }
    }

    fn new_timer(&self, name: &str) -> MethodCallTimer {
        let telemetry = &self.inner.telemetry;
        let core = telemetry.core();
        MethodCallTimer::new(
            name,
            telemetry.config().method_call_threshold(),
            core.method_call_duration.clone(),
            core.method_call_cpu_duration.clone(),
        )
    }

    /// Number of completed calls recorded for the method call site `name`.
    pub fn method_call_count(&self, name: &str) -> u64 {
        self.inner.state.borrow().timers.get(name).map_or(0, MethodCallTimer::call_count)
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.borrow();
        f.debug_struct("Transaction")
            .field("phase", &state.phase)
            .field("labels", &self.inner.labels.get())
            .field("values", &state.values.len())
            .field("samples", &state.samples.len())
            .field("timers", &state.timers.len())
            .finish()
    }
}

struct RunGuard<'a> {
    transaction: &'a Transaction,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        let _ = CURRENT.try_with(|current| current.borrow_mut().take());
        self.transaction.complete();
    }
}

fn log_registry_error(metric: &str, e: &RegistryError) {
    error!(error = %e, metric, "Failed to register transaction metric.");
}

/// Records a business event on the current transaction, if there is one.
pub fn add_event(name: &str, tags: &Labels) {
    if let Some(transaction) = Transaction::current() {
        transaction.add_event(name, tags);
    }
}

/// Runs `f`, measuring it on the current transaction if there is one.
///
/// See [`Transaction::measure`].
pub fn measure<T, F>(name: &str, f: F) -> T
where
    F: FnOnce() -> T,
{
    match Transaction::current() {
        Some(transaction) => transaction.measure(name, f),
        None => f(),
    }
}

#[cfg(test)]
mod tests {
    use std::{
        cell::Cell,
        panic::{catch_unwind, AssertUnwindSafe},
        rc::Rc,
        sync::Arc,
        time::Duration,
    };

    use metrics_util::debugging::{DebuggingRecorder, Snapshotter};
    use quanta::Clock;

    use super::{add_event, measure, Phase, RequestEnv, Transaction, TransactionError};
    use crate::{test_util, Config, Labels, MemorySink, ProcessRole, Telemetry};

    fn telemetry(config: Config) -> (Telemetry, MemorySink, Snapshotter, Arc<quanta::Mock>) {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        let sink = MemorySink::new();
        let (clock, mock) = Clock::mock();
        let telemetry = Telemetry::builder()
            .with_config(config)
            .with_recorder(Arc::new(recorder))
            .with_sink(sink.clone())
            .with_clock(clock)
            .build()
            .unwrap();
        (telemetry, sink, snapshotter, mock)
    }

    fn show() -> Labels {
        labels! { "controller" => "ProjectsController", "action" => "show" }
    }

    #[test]
    fn run_binds_and_clears_current() {
        let (telemetry, _sink, _snapshotter, _mock) = telemetry(Config::default());
        let transaction = Transaction::new(&telemetry, show());

        assert!(Transaction::current().is_none());
        let phase = transaction
            .run(|| {
                let current = Transaction::current().unwrap();
                assert_eq!(current.action().as_deref(), Some("ProjectsController#show"));
                current.phase()
            })
            .unwrap();

        assert_eq!(phase, Phase::Running);
        assert_eq!(transaction.phase(), Phase::Completed);
        assert!(Transaction::current().is_none());
    }

    #[test]
    fn phases_are_enforced() {
        let (telemetry, _sink, _snapshotter, _mock) = telemetry(Config::default());
        let transaction = Transaction::new(&telemetry, show());

        assert_eq!(transaction.finish(), Err(TransactionError::NotCompleted));
        transaction.run(|| ()).unwrap();
        assert_eq!(transaction.run(|| ()), Err(TransactionError::AlreadyStarted));
        transaction.finish().unwrap();
        assert_eq!(transaction.finish(), Err(TransactionError::AlreadyFinished));
        assert_eq!(transaction.run(|| ()), Err(TransactionError::AlreadyFinished));
    }

    #[test]
    fn nested_run_is_rejected() {
        let (telemetry, _sink, _snapshotter, _mock) = telemetry(Config::default());
        let outer = Transaction::new(&telemetry, show());
        let inner = Transaction::new(&telemetry, show());

        let nested = outer.run(|| inner.run(|| ())).unwrap();
        assert_eq!(nested, Err(TransactionError::NestedTransaction));
        assert_eq!(inner.phase(), Phase::Idle);
    }

    #[test]
    fn panicking_run_still_completes() {
        let (telemetry, _sink, snapshotter, mock) = telemetry(Config::default());
        let transaction = Transaction::new(&telemetry, show());

        let result = catch_unwind(AssertUnwindSafe(|| {
            transaction
                .run(|| {
                    mock.increment(Duration::from_millis(300));
                    panic!("boom");
                })
                .ok()
        }));

        assert!(result.is_err());
        assert!(Transaction::current().is_none());
        assert_eq!(transaction.phase(), Phase::Completed);
        assert_eq!(transaction.duration(), Duration::from_millis(300));

        let observed =
            test_util::capture(&snapshotter).histogram("transaction_duration_seconds", &show());
        assert_eq!(observed, Some(vec![0.3]));
    }

    #[test]
    fn labels_are_empty_until_known_then_memoized() {
        let (telemetry, _sink, _snapshotter, _mock) = telemetry(Config::default());
        let calls = Rc::new(Cell::new(0));
        let known = Rc::new(Cell::new(false));

        let source = {
            let calls = Rc::clone(&calls);
            let known = Rc::clone(&known);
            move || {
                calls.set(calls.get() + 1);
                known.get().then(show)
            }
        };
        let transaction = Transaction::new(&telemetry, source);

        assert!(transaction.labels().is_empty());
        assert_eq!(transaction.action(), None);

        known.set(true);
        let first = transaction.labels();
        let second = transaction.labels();
        assert_eq!(first, show());
        assert_eq!(first, second);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn finish_builds_aggregate_batch() {
        let config = Config::default().with_role(ProcessRole::Worker);
        let (telemetry, sink, snapshotter, mock) = telemetry(config);
        let transaction = Transaction::new(&telemetry, show());

        transaction
            .run(|| {
                mock.increment(Duration::from_millis(120));
                transaction.increment("gitaly_calls", 2);
                transaction.increment("gitaly_calls", 1);
                transaction.set("cache_hit_ratio", 0.5);
                transaction.add_tag("feature_category", "source_code");
                transaction.add_metric(
                    "rails_queue",
                    crate::sample::values([("depth", 3.0)]),
                    labels! { "action" => "Other#thing" },
                );
                add_event("push", &labels! { "branch" => "main" });
            })
            .unwrap();
        transaction.finish().unwrap();

        let samples = sink.drain();
        assert_eq!(samples.len(), 3);

        let aggregate = &samples[0];
        assert_eq!(aggregate.series(), "worker_transactions");
        assert_eq!(aggregate.values()["duration"], 120.0);
        assert_eq!(aggregate.values()["gitaly_calls"], 3.0);
        assert_eq!(aggregate.values()["cache_hit_ratio"], 0.5);
        assert!(aggregate.values().contains_key("allocated_memory"));
        assert_eq!(aggregate.tags()["feature_category"], "source_code");
        assert_eq!(aggregate.tags()["action"], "ProjectsController#show");

        assert_eq!(samples[1].series(), "rails_queue");
        assert_eq!(samples[1].tags()["action"], "Other#thing");

        let event = &samples[2];
        assert_eq!(event.series(), "events");
        assert_eq!(event.values()["count"], 1.0);
        assert_eq!(event.tags()["event"], "push");
        assert_eq!(event.tags()["branch"], "main");
        assert_eq!(event.tags()["action"], "ProjectsController#show");

        let captured = test_util::capture(&snapshotter);
        assert_eq!(captured.counter("transaction_gitaly_calls_total", &show()), Some(3));
        let mut event_labels = show();
        event_labels.insert("branch".to_string(), "main".to_string());
        assert_eq!(captured.counter("transaction_event_push_total", &event_labels), Some(1));
        assert_eq!(captured.gauge("transaction_cache_hit_ratio", &show()), Some(0.5));
    }

    #[test]
    fn registry_conflicts_do_not_fail_the_transaction() {
        let (telemetry, sink, _snapshotter, _mock) = telemetry(Config::default());
        telemetry.registry().gauge("transaction_conflict_total", "taken", &Labels::new()).unwrap();

        let transaction = Transaction::new(&telemetry, show());
        transaction.run(|| transaction.increment("conflict", 4)).unwrap();
        transaction.finish().unwrap();

        assert_eq!(sink.drain()[0].values()["conflict"], 4.0);
    }

    #[test]
    fn measure_records_block_values() {
        let (telemetry, _sink, _snapshotter, mock) = telemetry(Config::default());
        let transaction = Transaction::new(&telemetry, show());

        assert_eq!(measure("outside", || 1), 1);

        transaction
            .run(|| {
                measure("render", || mock.increment(Duration::from_millis(15)));
                measure("render", || mock.increment(Duration::from_millis(5)));
            })
            .unwrap();

        assert_eq!(transaction.value("render_real_time"), 20.0);
        assert_eq!(transaction.value("render_call_count"), 2.0);
        assert!(transaction.value("render_cpu_time") >= 0.0);
        assert_eq!(transaction.value("outside_call_count"), 0.0);
    }

    #[test]
    fn method_calls_below_threshold_are_not_reported() {
        let config = Config::default().with_method_call_threshold(Duration::from_millis(50));
        let (telemetry, sink, _snapshotter, mock) = telemetry(config);
        let transaction = Transaction::new(&telemetry, show());

        transaction
            .run(|| {
                transaction.measure_method("Fast#call", || mock.increment(Duration::from_millis(1)));
                transaction.measure_method("Slow#call", || mock.increment(Duration::from_millis(60)));
            })
            .unwrap();
        transaction.finish().unwrap();

        let samples = sink.drain();
        let method_samples: Vec<_> =
            samples.iter().filter(|s| s.series() == "web_method_calls").collect();
        assert_eq!(method_samples.len(), 1);
        assert_eq!(
            method_samples[0].tags(),
            &labels! { "method" => "Slow#call", "action" => "ProjectsController#show" }
        );
        assert_eq!(transaction.method_call_count("Fast#call"), 1);
    }

    #[test]
    fn method_call_histograms_follow_routing() {
        let config = Config::default().with_method_call_threshold(Duration::ZERO);
        let (telemetry, sink, snapshotter, mock) = telemetry(config);
        let env = RequestEnv::new();
        let transaction = telemetry.web_transaction(env.clone());

        transaction
            .run(|| {
                transaction.measure_method("Auth#check", || mock.increment(Duration::from_millis(2)));
                env.set_controller("ProjectsController", "show");
                transaction.measure_method("Auth#check", || mock.increment(Duration::from_millis(3)));
            })
            .unwrap();
        transaction.finish().unwrap();

        let mut routed = show();
        routed.insert("method".to_string(), "Auth#check".to_string());
        let captured = test_util::capture(&snapshotter);
        assert_eq!(captured.histogram("method_call_duration_seconds", &routed), Some(vec![0.003]));
        assert_eq!(
            captured.histogram("method_call_duration_seconds", &labels! { "method" => "Auth#check" }),
            Some(vec![0.002])
        );

        let samples = sink.drain();
        let method_sample = samples.iter().find(|s| s.series() == "web_method_calls").unwrap();
        assert_eq!(method_sample.values()["call_count"], 2.0);
        assert_eq!(method_sample.tags()["action"], "ProjectsController#show");
    }
}

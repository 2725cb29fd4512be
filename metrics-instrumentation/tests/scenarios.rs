use std::{
    collections::HashMap,
    io::{self, Write},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use metrics::Key;
use metrics_instrumentation::{
    instrument::{CallSite, InstrumentedCall},
    labels,
    sink::{ForwarderBuilder, JsonLinesTransport},
    transaction::RequestEnv,
    BackgroundSampler, Config, Labels, MemorySink, SampleError, Sampler, SinkRecord, Telemetry,
};
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use parking_lot::Mutex;

fn labels_of(key: &Key) -> Labels {
    key.labels().map(|l| (l.key().to_string(), l.value().to_string())).collect()
}

/// Counter values by name and label set, from a single snapshot.
///
/// Snapshots drain the recorder, so each test takes exactly one after its updates.
fn counters(snapshotter: &Snapshotter) -> HashMap<(String, Labels), u64> {
    snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .filter_map(|(ckey, _, _, value)| match value {
            DebugValue::Counter(v) => Some(((ckey.key().name().to_string(), labels_of(ckey.key())), v)),
            _ => None,
        })
        .collect()
}

#[test]
fn repeated_instrumented_calls_aggregate_into_one_sample() {
    let sink = MemorySink::new();
    let telemetry = Telemetry::builder()
        .with_config(Config::default().with_method_call_threshold(Duration::ZERO))
        .with_recorder(Arc::new(DebuggingRecorder::new()))
        .with_sink(sink.clone())
        .build()
        .unwrap();

    let repository = CallSite::instance("Project", "repository").wrap(|path: &str| path.len());
    let transaction = telemetry.transaction(labels! { "controller" => "ProjectsController", "action" => "show" });

    let total = transaction.run(|| repository.call(("gitlab-org/gitlab",)) + repository.call(("a/b",))).unwrap();
    assert_eq!(total, 20);
    transaction.finish().unwrap();

    let samples = sink.drain();
    let method_calls: Vec<_> = samples
        .iter()
        .filter(|s| s.series() == "web_method_calls" && s.tags().get("method").map(String::as_str) == Some("Project#repository"))
        .collect();

    assert_eq!(method_calls.len(), 1);
    assert_eq!(method_calls[0].values()["call_count"], 2.0);
    assert_eq!(
        method_calls[0].tags(),
        &labels! { "method" => "Project#repository", "action" => "ProjectsController#show" }
    );
}

#[test]
fn apdex_counts_per_label_combination() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    let telemetry = Telemetry::builder().with_recorder(Arc::new(recorder)).build().unwrap();

    let a = labels! { "type" => "a" };
    let b = labels! { "type" => "b" };
    let apdex = telemetry.sli().initialize_apdex("scenario", &[a.clone(), b.clone()]).unwrap();

    for _ in 0..3 {
        apdex.increment(&a, true);
    }
    for _ in 0..2 {
        apdex.increment(&b, false);
    }

    let counters = counters(&snapshotter);
    let value = |name: &str, labels: &Labels| counters.get(&(name.to_string(), labels.clone())).copied();
    assert_eq!(value("sli:scenario_apdex:total", &a), Some(3));
    assert_eq!(value("sli:scenario_apdex:total", &b), Some(2));
    assert_eq!(value("sli:scenario_apdex:success_total", &a), Some(3));
    assert_eq!(value("sli:scenario_apdex:success_total", &b), Some(0));
}

#[test]
fn never_initialized_sli_lookup_succeeds() {
    let telemetry = Telemetry::builder().with_recorder(Arc::new(DebuggingRecorder::new())).build().unwrap();

    let sli = telemetry.sli().apdex("never_initialized");
    assert!(!sli.is_initialized());
    sli.increment(&labels! { "type" => "a" }, true);
}

struct AlwaysFails {
    ticks: Arc<AtomicUsize>,
}

impl Sampler for AlwaysFails {
    fn name(&self) -> &str {
        "always-fails"
    }

    fn sample(&mut self) -> Result<(), SampleError> {
        self.ticks.fetch_add(1, Ordering::SeqCst);
        Err(SampleError::Io(io::Error::new(io::ErrorKind::Other, "statm unreadable")))
    }
}

#[test]
fn failing_sampler_stops_after_one_tick() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let ticks = Arc::new(AtomicUsize::new(0));
    let sampler =
        BackgroundSampler::new(AlwaysFails { ticks: Arc::clone(&ticks) }, Duration::from_millis(10));
    sampler.start().unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while sampler.is_running() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }

    assert!(!sampler.is_running());
    thread::sleep(Duration::from_millis(100));
    assert_eq!(ticks.load(Ordering::SeqCst), 1);
}

#[test]
fn web_transaction_labels_follow_routing_and_stay_fixed() {
    let sink = MemorySink::new();
    let telemetry = Telemetry::builder()
        .with_recorder(Arc::new(DebuggingRecorder::new()))
        .with_sink(sink.clone())
        .build()
        .unwrap();

    let env = RequestEnv::new();
    let transaction = telemetry.web_transaction(env.clone());
    assert!(transaction.labels().is_empty());

    transaction
        .run(|| {
            env.set_controller("Projects::MergeRequestsController", "show");
            let first = transaction.labels();

            env.set_endpoint("GET", "/api/:version/projects");
            assert_eq!(transaction.labels(), first);
        })
        .unwrap();
    transaction.finish().unwrap();

    let samples = sink.drain();
    assert_eq!(samples[0].tags()["action"], "Projects::MergeRequestsController#show");
}

#[derive(Clone, Default)]
struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn finished_transactions_reach_the_transport() {
    let buffer = SharedBuffer::default();
    let sink = ForwarderBuilder::new()
        .with_slice_size(1)
        .build(JsonLinesTransport::new(buffer.clone()))
        .unwrap();
    let telemetry = Telemetry::builder()
        .with_recorder(Arc::new(DebuggingRecorder::new()))
        .with_sink(sink)
        .build()
        .unwrap();

    let transaction = telemetry.background_transaction("PostReceive");
    transaction
        .run(|| metrics_instrumentation::add_event("push", &labels! { "branch" => "main" }))
        .unwrap();
    transaction.finish().unwrap();

    // Dropping the last handle on the sink drains its queue.
    drop(transaction);
    drop(telemetry);

    let output = String::from_utf8(buffer.0.lock().clone()).unwrap();
    let records: Vec<SinkRecord> = output.lines().map(|line| serde_json::from_str(line).unwrap()).collect();

    assert_eq!(records.len(), 2);
    assert_eq!(records[0].series, "web_transactions");
    assert_eq!(records[0].tags["action"], "PostReceive#perform");
    assert_eq!(records[1].series, "events");
    assert_eq!(records[1].tags["event"], "push");
}

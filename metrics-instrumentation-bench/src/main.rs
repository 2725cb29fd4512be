use getopts::Options;
use hdrhistogram::Histogram as HdrHistogram;
use log::{error, info};
use metrics::{Counter, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit};
use metrics_instrumentation::{
    alloc::CountingAllocator,
    instrument::{CallSite, Instrumented, InstrumentedCall},
    labels,
    sink::{ForwarderBuilder, ForwardingSink, JsonLinesTransport},
    sli::{Apdex, ErrorRate, Sli},
    transaction::RequestEnv,
    Config, Labels, Telemetry,
};
use metrics_util::registry::{AtomicStorage, Registry};
use quanta::Clock;
use std::{
    env, io,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

#[global_allocator]
static ALLOCATOR: CountingAllocator = CountingAllocator::system();

const LOOP_SAMPLE: u64 = 100;

const ENDPOINTS: &[(&str, &str)] = &[
    ("ProjectsController", "show"),
    ("Projects::IssuesController", "index"),
    ("Projects::MergeRequestsController", "show"),
];

const WORKERS: &[&str] = &["PostReceive", "PipelineProcessWorker", "NewNoteWorker"];

pub struct Controller {
    registry: Arc<Registry<Key, AtomicStorage>>,
}

impl Controller {
    /// Performs the traditional "upkeep" of a recorder i.e. clearing histogram buckets, etc.
    pub fn upkeep(&self) -> usize {
        let handles = self.registry.get_histogram_handles();
        let count = handles.len();

        for (_, histo) in handles {
            histo.clear();
        }

        count
    }
}

/// A simplistic recorder for benchmarking.
///
/// Simulates typical recorder implementations by utilizing `Registry`, clearing histogram buckets, etc.
pub struct BenchmarkingRecorder {
    registry: Arc<Registry<Key, AtomicStorage>>,
}

impl BenchmarkingRecorder {
    /// Creates a new `BenchmarkingRecorder`.
    pub fn new() -> BenchmarkingRecorder {
        BenchmarkingRecorder { registry: Arc::new(Registry::atomic()) }
    }

    /// Gets a `Controller` attached to this recorder.
    pub fn controller(&self) -> Controller {
        Controller { registry: self.registry.clone() }
    }
}

impl Recorder for BenchmarkingRecorder {
    fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

    fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

    fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

    fn register_counter(&self, key: &Key, _metadata: &Metadata<'_>) -> Counter {
        self.registry.get_or_create_counter(key, |c| Counter::from_arc(c.clone()))
    }

    fn register_gauge(&self, key: &Key, _metadata: &Metadata<'_>) -> Gauge {
        self.registry.get_or_create_gauge(key, |g| Gauge::from_arc(g.clone()))
    }

    fn register_histogram(&self, key: &Key, _metadata: &Metadata<'_>) -> Histogram {
        self.registry.get_or_create_histogram(key, |h| Histogram::from_arc(h.clone()))
    }
}

impl Default for BenchmarkingRecorder {
    fn default() -> Self {
        BenchmarkingRecorder::new()
    }
}

fn endpoint_labels() -> Vec<Labels> {
    ENDPOINTS
        .iter()
        .map(|(controller, action)| labels! { "endpoint_id" => format!("{controller}#{action}") })
        .collect()
}

fn worker_labels() -> Vec<Labels> {
    WORKERS.iter().map(|worker| labels! { "worker" => worker }).collect()
}

type Call = Instrumented<fn(u64) -> u64>;

fn checksum(seed: u64) -> u64 {
    (0..64u64).fold(seed, |acc, i| acc.rotate_left(5) ^ i.wrapping_mul(0x9e37_79b9_7f4a_7c15))
}

fn render(seed: u64) -> u64 {
    let rendered: String = (0..16).map(|i| char::from(b'a' + (seed.wrapping_add(i) % 26) as u8)).collect();
    seed.wrapping_add(rendered.len() as u64)
}

struct Generator {
    telemetry: Telemetry,
    apdex: Arc<Sli<Apdex>>,
    error_rate: Arc<Sli<ErrorRate>>,
    find: Call,
    render: Call,
    hist: HdrHistogram<u64>,
    done: Arc<AtomicBool>,
    rate_counter: Arc<AtomicU64>,
}

impl Generator {
    fn new(telemetry: Telemetry, done: Arc<AtomicBool>, rate_counter: Arc<AtomicU64>) -> Generator {
        let apdex = telemetry.sli().apdex("rails_request");
        let error_rate = telemetry.sli().error_rate("sidekiq_execution");

        Generator {
            telemetry,
            apdex,
            error_rate,
            find: CallSite::associated("Project", "find").wrap(checksum as fn(u64) -> u64),
            render: CallSite::instance("Banzai::Renderer", "render").wrap(render as fn(u64) -> u64),
            hist: HdrHistogram::<u64>::new_with_bounds(1, u64::MAX, 3).unwrap(),
            done,
            rate_counter,
        }
    }

    fn web_request(&self, n: u64) {
        let (controller, action) = ENDPOINTS[(n as usize) % ENDPOINTS.len()];
        let env = RequestEnv::new();
        let transaction = self.telemetry.web_transaction(env.clone());

        let result = transaction.run(|| {
            env.set_controller(controller, action);
            let id = self.find.call((n,));
            transaction.increment("gitaly_calls", 1);
            self.render.call((id,))
        });

        if let Err(e) = result.and_then(|_| transaction.finish()) {
            error!("transaction failed: {}", e);
        }

        let endpoint = labels! { "endpoint_id" => format!("{controller}#{action}") };
        self.apdex.increment(&endpoint, n % 10 != 0);
    }

    fn background_job(&self, n: u64) {
        let worker = WORKERS[(n as usize) % WORKERS.len()];
        let transaction = self.telemetry.background_transaction(worker);

        let result = transaction.run(|| {
            metrics_instrumentation::measure("process", || self.find.call((n,)));
            metrics_instrumentation::add_event("job_done", &labels! { "worker" => worker });
        });

        if let Err(e) = result.and_then(|_| transaction.finish()) {
            error!("transaction failed: {}", e);
        }

        self.error_rate.increment(&labels! { "worker" => worker }, n % 50 == 0);
    }

    fn run(&mut self) {
        let clock = Clock::new();
        let mut loop_counter = 0u64;

        loop {
            loop_counter += 1;

            let start = if loop_counter % LOOP_SAMPLE == 0 { Some(clock.now()) } else { None };

            if loop_counter % 2 == 0 {
                self.web_request(loop_counter);
            } else {
                self.background_job(loop_counter);
            }

            if let Some(val) = start {
                let delta = clock.now() - val;
                self.hist.saturating_record(delta.as_nanos() as u64);

                // We also increment our global counter for the transaction rate here.
                self.rate_counter.fetch_add(LOOP_SAMPLE, Ordering::AcqRel);

                if self.done.load(Ordering::Relaxed) {
                    break;
                }
            }
        }
    }
}

impl Drop for Generator {
    fn drop(&mut self) {
        info!(
            "    transaction latency: min: {:8} p50: {:8} p95: {:8} p99: {:8} p999: {:8} max: {:8}",
            nanos_to_readable(self.hist.min()),
            nanos_to_readable(self.hist.value_at_percentile(50.0)),
            nanos_to_readable(self.hist.value_at_percentile(95.0)),
            nanos_to_readable(self.hist.value_at_percentile(99.0)),
            nanos_to_readable(self.hist.value_at_percentile(99.9)),
            nanos_to_readable(self.hist.max())
        );
    }
}

fn print_usage(program: &str, opts: &Options) {
    let brief = format!("Usage: {} [options]", program);
    print!("{}", opts.usage(&brief));
}

pub fn opts() -> Options {
    let mut opts = Options::new();

    opts.optopt("d", "duration", "number of seconds to run the benchmark", "INTEGER");
    opts.optopt("p", "producers", "number of producers", "INTEGER");
    opts.optopt(
        "t",
        "threshold",
        "method call reporting threshold, in milliseconds",
        "INTEGER",
    );
    opts.optflag("e", "emit", "write forwarded samples to stdout as JSON lines");
    opts.optflag("h", "help", "print this help menu");

    opts
}

fn parse_opt<T: std::str::FromStr>(matches: &getopts::Matches, name: &str, default: T) -> Option<T> {
    match matches.opt_str(name) {
        Some(value) => match value.parse() {
            Ok(parsed) => Some(parsed),
            Err(_) => {
                error!("Invalid value for --{}: {}", name, value);
                None
            }
        },
        None => Some(default),
    }
}

fn forwarding_sink(emit: bool) -> io::Result<ForwardingSink> {
    let builder = ForwarderBuilder::new().with_slice_size(500);
    if emit {
        builder.build(JsonLinesTransport::new(io::stdout()))
    } else {
        builder.build(JsonLinesTransport::new(io::sink()))
    }
}

fn main() {
    pretty_env_logger::init();

    let args: Vec<String> = env::args().collect();
    let program = &args[0];
    let opts = opts();

    let matches = match opts.parse(&args[1..]) {
        Ok(m) => m,
        Err(f) => {
            error!("Failed to parse command line args: {}", f);
            return;
        }
    };

    if matches.opt_present("help") {
        print_usage(program, &opts);
        return;
    }

    info!("metrics-instrumentation benchmark");

    let (Some(seconds), Some(producers), Some(threshold_ms)) = (
        parse_opt::<u64>(&matches, "duration", 60),
        parse_opt::<usize>(&matches, "producers", 1),
        parse_opt::<u64>(&matches, "threshold", 10),
    ) else {
        return;
    };

    info!("duration: {}s", seconds);
    info!("producers: {}", producers);
    info!("method call threshold: {}ms", threshold_ms);

    let sink = match forwarding_sink(matches.opt_present("emit")) {
        Ok(sink) => sink,
        Err(e) => {
            error!("Failed to start sample forwarder: {}", e);
            return;
        }
    };

    let recorder = BenchmarkingRecorder::new();
    let controller = recorder.controller();

    let config = Config::default()
        .with_method_call_threshold(Duration::from_millis(threshold_ms))
        .with_sample_interval(Duration::from_secs(1));
    let telemetry = match Telemetry::builder()
        .with_config(config)
        .with_recorder(Arc::new(recorder))
        .with_sink(sink)
        .build()
    {
        Ok(telemetry) => telemetry,
        Err(e) => {
            error!("Failed to build telemetry: {}", e);
            return;
        }
    };

    let endpoints = endpoint_labels();
    let workers = worker_labels();
    if let Err(e) = telemetry.sli().initialize_apdex("rails_request", &endpoints) {
        error!("Failed to initialize SLI: {}", e);
        return;
    }
    if let Err(e) = telemetry.sli().initialize_error_rate("sidekiq_execution", &workers) {
        error!("Failed to initialize SLI: {}", e);
        return;
    }

    let sampler = match telemetry.start_process_sampler() {
        Ok(sampler) => sampler,
        Err(e) => {
            error!("Failed to start process sampler: {}", e);
            return;
        }
    };

    info!("telemetry configured");

    // Spin up our transaction producers.
    let done = Arc::new(AtomicBool::new(false));
    let rate_counter = Arc::new(AtomicU64::new(0));
    let mut handles = Vec::new();

    for _ in 0..producers {
        let d = done.clone();
        let r = rate_counter.clone();
        let t = telemetry.clone();
        let handle = thread::spawn(move || {
            let mut gen = Generator::new(t, d, r);
            gen.run();
        });

        handles.push(handle);
    }

    // Poll the controller to figure out the transaction rate.
    let mut total = 0;
    let mut t0 = Instant::now();

    let mut upkeep_hist = HdrHistogram::<u64>::new_with_bounds(1, u64::MAX, 3).unwrap();
    for _ in 0..seconds {
        let t1 = Instant::now();

        let start = Instant::now();
        let histograms = controller.upkeep();
        let end = Instant::now();
        upkeep_hist.saturating_record((end - start).as_nanos() as u64);

        let turn_total = rate_counter.load(Ordering::Acquire);
        let turn_delta = turn_total - total;
        total = turn_total;
        let rate = turn_delta as f64 / (t1 - t0).as_secs_f64();

        info!("transaction rate: {:.0} transactions/sec ({} histograms)", rate, histograms);
        t0 = t1;
        thread::sleep(Duration::new(1, 0));
    }

    info!("--------------------------------------------------------------------------------");
    info!(" transactions total: {}", total);
    info!(
        "   recorder upkeep: min: {:8} p50: {:8} p95: {:8} p99: {:8} p999: {:8} max: {:8}",
        nanos_to_readable(upkeep_hist.min()),
        nanos_to_readable(upkeep_hist.value_at_percentile(50.0)),
        nanos_to_readable(upkeep_hist.value_at_percentile(95.0)),
        nanos_to_readable(upkeep_hist.value_at_percentile(99.0)),
        nanos_to_readable(upkeep_hist.value_at_percentile(99.9)),
        nanos_to_readable(upkeep_hist.max())
    );

    // Wait for the producers to finish so we can get their stats too.
    done.store(true, Ordering::SeqCst);
    for handle in handles {
        let _ = handle.join();
    }

    if let Some(sampler) = sampler {
        info!("process sampler running at shutdown: {}", sampler.is_running());
        sampler.stop();
    }
}

fn nanos_to_readable(t: u64) -> String {
    let f = t as f64;
    if f < 1_000.0 {
        format!("{}ns", f)
    } else if f < 1_000_000.0 {
        format!("{:.0}μs", f / 1_000.0)
    } else if f < 2_000_000_000.0 {
        format!("{:.2}ms", f / 1_000_000.0)
    } else {
        format!("{:.3}s", f / 1_000_000_000.0)
    }
}

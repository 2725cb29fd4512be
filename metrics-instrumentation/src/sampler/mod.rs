//! Periodic, process-wide sampling.
//!
//! A [`BackgroundSampler`] owns one dedicated thread that sleeps for a jittered interval, calls
//! [`Sampler::sample`], and repeats until stopped.  A sampler that fails, by returning an error or
//! by panicking, is logged and disables itself; it is not retried.
use std::{
    fmt, io,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error};

use crate::registry::RegistryError;

mod jitter;
mod process;

pub use self::jitter::{Jitter, Offset};
pub use self::process::ProcessSampler;

/// Errors that could occur while taking a sample.
#[derive(Debug, Error)]
pub enum SampleError {
    /// A statistic could not be read.
    #[error("{what} is unavailable on this platform")]
    Unavailable {
        /// Statistic that could not be read.
        what: &'static str,
    },

    /// Reading a statistic failed.
    #[error("failed to read process statistics: {0}")]
    Io(#[from] io::Error),

    /// Any other failure.
    #[error("{0}")]
    Failed(String),
}

/// Errors that could occur while creating or starting a sampler.
#[derive(Debug, Error)]
pub enum SamplerError {
    /// The sampler thread could not be spawned.
    #[error("failed to spawn sampler thread: {0}")]
    Spawn(#[from] io::Error),

    /// The sampler's metrics could not be registered.
    #[error("failed to register sampler metrics: {0}")]
    Registry(#[from] RegistryError),
}

/// Collects process-wide statistics.
pub trait Sampler: Send + 'static {
    /// Name used for the sampler thread and in logs.
    fn name(&self) -> &str;

    /// Takes one sample and flushes it.
    ///
    /// # Errors
    ///
    /// Returning an error stops the background sampler permanently.
    fn sample(&mut self) -> Result<(), SampleError>;
}

struct Shared<S> {
    name: String,
    sampler: Mutex<S>,
    running: AtomicBool,
}

struct Worker {
    handle: JoinHandle<()>,
    stop: Sender<()>,
}

/// Runs a [`Sampler`] on a dedicated thread at a jittered interval.
///
/// The sampler stops when [`stop`][BackgroundSampler::stop] is called or when it is dropped.
pub struct BackgroundSampler<S> {
    shared: Arc<Shared<S>>,
    interval: Duration,
    worker: Mutex<Option<Worker>>,
}

impl<S: Sampler> BackgroundSampler<S> {
    /// Creates a new, stopped `BackgroundSampler` with the given base interval.
    pub fn new(sampler: S, interval: Duration) -> Self {
        BackgroundSampler {
            shared: Arc::new(Shared {
                name: sampler.name().to_string(),
                sampler: Mutex::new(sampler),
                running: AtomicBool::new(false),
            }),
            interval,
            worker: Mutex::new(None),
        }
    }

    /// Starts the sampler thread.
    ///
    /// Does nothing if the sampler is already running.  A sampler that disabled itself after a
    /// failure can be started again.
    ///
    /// # Errors
    ///
    /// If the thread cannot be spawned, an error is returned.
    pub fn start(&self) -> Result<(), SamplerError> {
        let mut worker = self.worker.lock();
        if self.shared.running.load(Ordering::Acquire) {
            return Ok(());
        }

        // A previous worker may have exited after a failure.
        if let Some(stale) = worker.take() {
            join_worker(&self.shared.name, stale);
        }

        let (stop, stop_rx) = bounded(1);
        let shared = Arc::clone(&self.shared);
        let jitter = Jitter::new(self.interval);

        self.shared.running.store(true, Ordering::Release);
        let spawned = thread::Builder::new()
            .name(format!("metrics-sampler-{}", self.shared.name))
            .spawn(move || run_sampler(&shared, jitter, &stop_rx));

        match spawned {
            Ok(handle) => {
                *worker = Some(Worker { handle, stop });
                debug!(sampler = %self.shared.name, interval = ?self.interval, "Sampler started.");
                Ok(())
            }
            Err(e) => {
                self.shared.running.store(false, Ordering::Release);
                Err(e.into())
            }
        }
    }

    /// Stops the sampler thread and waits for it to exit.
    ///
    /// Does nothing if the sampler is not running.
    pub fn stop(&self) {
        let mut worker = self.worker.lock();
        self.shared.running.store(false, Ordering::Release);

        if let Some(worker) = worker.take() {
            let _ = worker.stop.try_send(());
            join_worker(&self.shared.name, worker);
        }
    }

    /// Returns `true` while the sampler thread is running.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Base interval between samples.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Runs `f` with exclusive access to the sampler.
    pub fn with_sampler<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&mut S) -> R,
    {
        f(&mut self.shared.sampler.lock())
    }
}

impl<S> Drop for BackgroundSampler<S> {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(worker) = self.worker.get_mut().take() {
            let _ = worker.stop.try_send(());
            join_worker(&self.shared.name, worker);
        }
    }
}

impl<S> fmt::Debug for BackgroundSampler<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackgroundSampler")
            .field("name", &self.shared.name)
            .field("interval", &self.interval)
            .field("running", &self.shared.running.load(Ordering::Acquire))
            .finish()
    }
}

fn join_worker(name: &str, worker: Worker) {
    drop(worker.stop);
    if worker.handle.join().is_err() {
        error!(sampler = %name, "Sampler thread panicked.");
    }
}

fn run_sampler<S: Sampler>(shared: &Shared<S>, mut jitter: Jitter, stop: &Receiver<()>) {
    loop {
        match stop.recv_timeout(jitter.next_interval()) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }

        if !shared.running.load(Ordering::Acquire) {
            break;
        }

        if !safe_sample(shared) {
            shared.running.store(false, Ordering::Release);
            break;
        }
    }

    debug!(sampler = %shared.name, "Sampler stopped.");
}

fn safe_sample<S: Sampler>(shared: &Shared<S>) -> bool {
    let result = catch_unwind(AssertUnwindSafe(|| shared.sampler.lock().sample()));
    match result {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            error!(error = %e, sampler = %shared.name, "Sampler failed. Disabling.");
            false
        }
        Err(_) => {
            error!(sampler = %shared.name, "Sampler panicked. Disabling.");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        thread,
        time::{Duration, Instant},
    };

    use super::{BackgroundSampler, SampleError, Sampler};

    struct Counting {
        ticks: Arc<AtomicUsize>,
        fail: bool,
        panic: bool,
    }

    impl Sampler for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        fn sample(&mut self) -> Result<(), SampleError> {
            self.ticks.fetch_add(1, Ordering::SeqCst);
            if self.panic {
                panic!("sampler exploded");
            }
            if self.fail {
                return Err(SampleError::Failed("no data".to_string()));
            }
            Ok(())
        }
    }

    fn counting(fail: bool, panic: bool) -> (BackgroundSampler<Counting>, Arc<AtomicUsize>) {
        let ticks = Arc::new(AtomicUsize::new(0));
        let sampler = Counting { ticks: Arc::clone(&ticks), fail, panic };
        (BackgroundSampler::new(sampler, Duration::from_millis(20)), ticks)
    }

    fn wait_until(mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn samples_until_stopped() {
        let (sampler, ticks) = counting(false, false);
        assert!(!sampler.is_running());

        sampler.start().unwrap();
        sampler.start().unwrap();
        assert!(sampler.is_running());
        assert!(wait_until(|| ticks.load(Ordering::SeqCst) >= 3));

        sampler.stop();
        assert!(!sampler.is_running());
        let after_stop = ticks.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(100));
        assert_eq!(ticks.load(Ordering::SeqCst), after_stop);

        sampler.stop();
    }

    #[test]
    fn failing_sampler_disables_itself() {
        let (sampler, ticks) = counting(true, false);
        sampler.start().unwrap();

        assert!(wait_until(|| !sampler.is_running()));
        thread::sleep(Duration::from_millis(100));
        assert_eq!(ticks.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_sampler_disables_itself() {
        let (sampler, ticks) = counting(false, true);
        sampler.start().unwrap();

        assert!(wait_until(|| !sampler.is_running()));
        assert_eq!(ticks.load(Ordering::SeqCst), 1);

        // The sampler is still usable after the panic.
        assert_eq!(sampler.with_sampler(|s| s.name().to_string()), "counting");
    }

    #[test]
    fn disabled_sampler_can_be_restarted() {
        let (sampler, ticks) = counting(true, false);
        sampler.start().unwrap();
        assert!(wait_until(|| !sampler.is_running()));

        sampler.start().unwrap();
        assert!(wait_until(|| ticks.load(Ordering::SeqCst) == 2 && !sampler.is_running()));
    }

    #[test]
    fn drop_stops_the_thread() {
        let (sampler, ticks) = counting(false, false);
        sampler.start().unwrap();
        assert!(wait_until(|| ticks.load(Ordering::SeqCst) >= 1));
        drop(sampler);

        let after_drop = ticks.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(100));
        assert_eq!(ticks.load(Ordering::SeqCst), after_drop);
    }
}

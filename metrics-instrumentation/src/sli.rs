//! Service level indicators.
//!
//! An SLI is a pair of counters, a total and a numerator, tracked per label combination.  The
//! numerator counts successes for an [`Apdex`] SLI and errors for an [`ErrorRate`] SLI, so the
//! indicator itself is `numerator / total`.
//!
//! Every label combination an SLI will ever see should be supplied when it is initialized.  Doing
//! so bounds cardinality, and registers every combination at zero so the ratio is defined before
//! the first increment.
use std::{
    collections::HashMap,
    fmt,
    marker::PhantomData,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use tracing::{error, warn};

use crate::{
    registry::{Counter, MetricRegistry, RegistryError},
    Labels,
};

/// The flavor of an SLI: what its numerator counts and how its counters are named.
pub trait SliKind: Send + Sync + 'static {
    /// Name of the kind, used in logs.
    const KIND: &'static str;

    /// Describes what the numerator counts, used in help text.
    const OUTCOME: &'static str;

    /// Name of the total counter for the SLI `name`.
    fn total_name(name: &str) -> String;

    /// Name of the numerator counter for the SLI `name`.
    fn numerator_name(name: &str) -> String;
}

/// Apdex: the numerator counts satisfactory outcomes.
#[derive(Debug)]
pub enum Apdex {}

impl SliKind for Apdex {
    const KIND: &'static str = "apdex";
    const OUTCOME: &'static str = "successful";

    fn total_name(name: &str) -> String {
        format!("sli:{name}_apdex:total")
    }

    fn numerator_name(name: &str) -> String {
        format!("sli:{name}_apdex:success_total")
    }
}

/// Error rate: the numerator counts errors.
#[derive(Debug)]
pub enum ErrorRate {}

impl SliKind for ErrorRate {
    const KIND: &'static str = "error_rate";
    const OUTCOME: &'static str = "failed";

    fn total_name(name: &str) -> String {
        format!("sli:{name}:total")
    }

    fn numerator_name(name: &str) -> String {
        format!("sli:{name}:error_total")
    }
}

/// A named SLI.
pub struct Sli<K> {
    name: String,
    total: Counter,
    numerator: Counter,
    combinations: Mutex<Vec<Labels>>,
    initialized: AtomicBool,
    _kind: PhantomData<K>,
}

impl<K: SliKind> Sli<K> {
    fn new(registry: &MetricRegistry, name: &str) -> Result<Self, RegistryError> {
        let total = registry.counter(
            &K::total_name(name),
            &format!("Total number of measurements for {name}"),
            &Labels::new(),
        )?;
        let numerator = registry.counter(
            &K::numerator_name(name),
            &format!("Number of {} measurements for {name}", K::OUTCOME),
            &Labels::new(),
        )?;

        Ok(Self::with_counters(name, total, numerator))
    }

    fn detached(name: &str) -> Self {
        Self::with_counters(name, Counter::noop(), Counter::noop())
    }

    fn with_counters(name: &str, total: Counter, numerator: Counter) -> Self {
        Sli {
            name: name.to_string(),
            total,
            numerator,
            combinations: Mutex::new(Vec::new()),
            initialized: AtomicBool::new(false),
            _kind: PhantomData,
        }
    }

    fn initialize(&self, combinations: &[Labels]) {
        let mut known = self.combinations.lock();
        for combination in combinations {
            if known.contains(combination) {
                continue;
            }

            self.total.touch(combination);
            self.numerator.touch(combination);
            known.push(combination.clone());
        }

        if !known.is_empty() {
            self.initialized.store(true, Ordering::Release);
        }
    }

    /// SLI name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns `true` once at least one label combination has been registered.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Label combinations registered so far.
    pub fn label_combinations(&self) -> Vec<Labels> {
        self.combinations.lock().clone()
    }

    fn increment_with(&self, labels: &Labels, increment_numerator: bool) {
        self.total.increment(labels, 1);
        if increment_numerator {
            self.numerator.increment(labels, 1);
        }
    }
}

impl Sli<Apdex> {
    /// Counts one measurement, and one success if `success` is `true`.
    pub fn increment(&self, labels: &Labels, success: bool) {
        self.increment_with(labels, success);
    }
}

impl Sli<ErrorRate> {
    /// Counts one measurement, and one error if `error` is `true`.
    pub fn increment(&self, labels: &Labels, error: bool) {
        self.increment_with(labels, error);
    }
}

impl<K: SliKind> fmt::Debug for Sli<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sli")
            .field("kind", &K::KIND)
            .field("name", &self.name)
            .field("initialized", &self.is_initialized())
            .field("combinations", &self.combinations.lock().len())
            .finish()
    }
}

struct Trackers<K> {
    slis: Mutex<HashMap<String, Arc<Sli<K>>>>,
}

impl<K: SliKind> Trackers<K> {
    fn new() -> Self {
        Trackers { slis: Mutex::new(HashMap::new()) }
    }

    fn initialize(
        &self,
        registry: &MetricRegistry,
        name: &str,
        combinations: &[Labels],
    ) -> Result<Arc<Sli<K>>, RegistryError> {
        let mut slis = self.slis.lock();
        let sli = match slis.get(name) {
            Some(sli) => Arc::clone(sli),
            None => {
                let sli = Arc::new(Sli::new(registry, name)?);
                slis.insert(name.to_string(), Arc::clone(&sli));
                sli
            }
        };

        sli.initialize(combinations);
        Ok(sli)
    }

    fn get(&self, name: &str) -> Option<Arc<Sli<K>>> {
        self.slis.lock().get(name).cloned()
    }

    fn get_or_fallback(&self, registry: &MetricRegistry, name: &str) -> Arc<Sli<K>> {
        if let Some(sli) = self.get(name) {
            return sli;
        }

        warn!(sli = name, kind = K::KIND, "SLI used before initialization. Label combinations are not pre-registered.");
        match self.initialize(registry, name, &[]) {
            Ok(sli) => sli,
            Err(e) => {
                error!(error = %e, sli = name, kind = K::KIND, "Failed to register SLI counters.");
                Arc::new(Sli::detached(name))
            }
        }
    }
}

/// Process-wide registry of SLIs.
pub struct SliRegistry {
    registry: Arc<MetricRegistry>,
    apdex: Trackers<Apdex>,
    error_rate: Trackers<ErrorRate>,
}

impl SliRegistry {
    /// Creates a new, empty `SliRegistry` registering counters in `registry`.
    pub fn new(registry: Arc<MetricRegistry>) -> Self {
        SliRegistry { registry, apdex: Trackers::new(), error_rate: Trackers::new() }
    }

    /// Initializes the Apdex SLI `name` with every label combination it may be incremented with.
    ///
    /// Initializing an existing SLI again registers any new combinations and returns the same
    /// instance.  Concurrent callers converge on one instance.
    ///
    /// # Errors
    ///
    /// If the SLI's counter names conflict with other metrics, an error is returned.
    pub fn initialize_apdex(
        &self,
        name: &str,
        combinations: &[Labels],
    ) -> Result<Arc<Sli<Apdex>>, RegistryError> {
        self.apdex.initialize(&self.registry, name, combinations)
    }

    /// Initializes the error rate SLI `name` with every label combination it may be incremented
    /// with.
    ///
    /// # Errors
    ///
    /// If the SLI's counter names conflict with other metrics, an error is returned.
    pub fn initialize_error_rate(
        &self,
        name: &str,
        combinations: &[Labels],
    ) -> Result<Arc<Sli<ErrorRate>>, RegistryError> {
        self.error_rate.initialize(&self.registry, name, combinations)
    }

    /// Returns the Apdex SLI `name`.
    ///
    /// An SLI that was never initialized is created on the spot without any label combinations,
    /// and a warning is logged.  Use [`try_apdex`][SliRegistry::try_apdex] to only look up
    /// initialized SLIs.
    pub fn apdex(&self, name: &str) -> Arc<Sli<Apdex>> {
        self.apdex.get_or_fallback(&self.registry, name)
    }

    /// Returns the error rate SLI `name`, creating it without label combinations if needed.
    pub fn error_rate(&self, name: &str) -> Arc<Sli<ErrorRate>> {
        self.error_rate.get_or_fallback(&self.registry, name)
    }

    /// Returns the Apdex SLI `name` if it exists.
    pub fn try_apdex(&self, name: &str) -> Option<Arc<Sli<Apdex>>> {
        self.apdex.get(name)
    }

    /// Returns the error rate SLI `name` if it exists.
    pub fn try_error_rate(&self, name: &str) -> Option<Arc<Sli<ErrorRate>>> {
        self.error_rate.get(name)
    }
}

impl fmt::Debug for SliRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SliRegistry")
            .field("apdex", &self.apdex.slis.lock().len())
            .field("error_rate", &self.error_rate.slis.lock().len())
            .finish()
    }
}

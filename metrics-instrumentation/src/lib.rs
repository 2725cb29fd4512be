//! Application instrumentation built on [`metrics`].
//!
//! This crate measures units of work in a long-running service: web requests and background jobs.
//! It provides:
//!
//! - [`Transaction`]: the metric context of one request or job, bound to the current thread while
//!   it runs, which accumulates values, samples and method call timings and submits them as one
//!   batch when finished
//! - [`CallSite`][instrument::CallSite] and [`Instrumented`][instrument::Instrumented]: call
//!   wrappers that attribute time spent in selected methods to the current transaction
//! - [`BackgroundSampler`]: a jittered periodic sampler on its own thread, with
//!   [`ProcessSampler`] reporting memory, file descriptor, CPU and allocation statistics
//! - [`SliRegistry`]: Apdex and error rate indicators over a fixed set of label combinations
//!
//! Metric handles come from a [`MetricRegistry`] backed by any [`Recorder`][metrics::Recorder].
//! When metrics are disabled, every handle is a null handle, so instrumented code never needs to
//! check.
//!
//! # Usage
//!
//! ```
//! use metrics_instrumentation::{labels, Config, MemorySink, Telemetry};
//!
//! let sink = MemorySink::new();
//! let telemetry = Telemetry::builder()
//!     .with_config(Config::default())
//!     .with_sink(sink.clone())
//!     .build()
//!     .expect("failed to build telemetry");
//!
//! let apdex = telemetry
//!     .sli()
//!     .initialize_apdex("rails_request", &[labels! { "endpoint" => "ProjectsController#show" }])
//!     .expect("failed to initialize SLI");
//!
//! let transaction = telemetry.background_transaction("PostReceive");
//! transaction
//!     .run(|| {
//!         transaction.increment("gitaly_calls", 1);
//!         apdex.increment(&labels! { "endpoint" => "ProjectsController#show" }, true);
//!     })
//!     .expect("transaction already running");
//! transaction.finish().expect("transaction not completed");
//!
//! assert_eq!(sink.samples()[0].series(), "web_transactions");
//! ```
#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg), deny(rustdoc::broken_intra_doc_links))]

#[macro_use]
mod labels;
pub use self::labels::Labels;

pub mod alloc;

mod builder;
pub use self::builder::{BuildError, Telemetry, TelemetryBuilder};

mod config;
pub use self::config::{Config, ConfigError, ProcessRole};

mod delta;
pub use self::delta::Delta;

pub mod instrument;

mod method_call;
pub use self::method_call::MethodCallTimer;

pub mod registry;
pub use self::registry::{FeatureSwitch, GlobalRecorder, MetricKind, MetricRegistry, RegistryError};

mod sample;
pub use self::sample::{MetricSample, SinkRecord};

pub mod sampler;
pub use self::sampler::{BackgroundSampler, ProcessSampler, SampleError, Sampler, SamplerError};

pub mod sink;
pub use self::sink::{MemorySink, NullSink, SampleSink};

pub mod sli;
pub use self::sli::{Sli, SliRegistry};

pub mod system;

pub mod transaction;
pub use self::transaction::{add_event, measure, Transaction, TransactionError};

#[cfg(test)]
mod test_util;

use std::{
    collections::BTreeMap,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

use crate::Labels;

/// A timestamped, named measurement.
///
/// Samples are produced by transactions and samplers and handed to a [`SampleSink`][crate::SampleSink]
/// in batches.  A sample has no identity beyond its fields, and many samples may share a series.
#[derive(Clone, Debug, PartialEq)]
pub struct MetricSample {
    series: String,
    values: BTreeMap<String, f64>,
    tags: Labels,
    created_at: SystemTime,
}

impl MetricSample {
    /// Creates a new `MetricSample` stamped with the current time.
    pub fn new<S>(series: S, values: BTreeMap<String, f64>, tags: Labels) -> Self
    where
        S: Into<String>,
    {
        Self::with_timestamp(series, values, tags, SystemTime::now())
    }

    /// Creates a new `MetricSample` with an explicit creation time.
    pub fn with_timestamp<S>(
        series: S,
        values: BTreeMap<String, f64>,
        tags: Labels,
        created_at: SystemTime,
    ) -> Self
    where
        S: Into<String>,
    {
        MetricSample { series: series.into(), values, tags, created_at }
    }

    /// Series name.
    pub fn series(&self) -> &str {
        &self.series
    }

    /// Measured values, keyed by field name.
    pub fn values(&self) -> &BTreeMap<String, f64> {
        &self.values
    }

    /// Tags attached to the sample.
    pub fn tags(&self) -> &Labels {
        &self.tags
    }

    /// Time the sample was created.
    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// Returns a copy of this sample with `key` set to `value`, unless the tag is already present.
    #[must_use]
    pub fn with_default_tag(mut self, key: &str, value: &str) -> Self {
        if !self.tags.contains_key(key) {
            self.tags.insert(key.to_string(), value.to_string());
        }
        self
    }

    /// Converts the sample into the record shape accepted by sink transports.
    ///
    /// Non-finite values (NaN and infinities) have no JSON representation and are left out of the
    /// record.
    pub fn to_record(&self) -> SinkRecord {
        let timestamp = self
            .created_at
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
            .unwrap_or(0);

        SinkRecord {
            series: self.series.clone(),
            tags: self.tags.clone(),
            values: self
                .values
                .iter()
                .filter(|(_, value)| value.is_finite())
                .map(|(name, value)| (name.clone(), *value))
                .collect(),
            timestamp,
        }
    }
}

impl From<SinkRecord> for MetricSample {
    fn from(record: SinkRecord) -> Self {
        MetricSample {
            series: record.series,
            values: record.values,
            tags: record.tags,
            created_at: UNIX_EPOCH + Duration::from_nanos(record.timestamp),
        }
    }
}

/// The wire-independent shape of a sample as handed to a [`Transport`][crate::sink::Transport].
///
/// `timestamp` is expressed in nanoseconds since the Unix epoch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SinkRecord {
    /// Series name.
    pub series: String,

    /// Tags.
    pub tags: BTreeMap<String, String>,

    /// Values, all finite.
    pub values: BTreeMap<String, f64>,

    /// Nanoseconds since the Unix epoch.
    pub timestamp: u64,
}

/// Builds a value map from `(name, value)` pairs.
pub(crate) fn values<const N: usize>(pairs: [(&str, f64); N]) -> BTreeMap<String, f64> {
    pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

use metrics::Key;
use metrics_util::debugging::{DebugValue, Snapshotter};

use crate::Labels;

fn labels_of(key: &Key) -> Labels {
    key.labels().map(|l| (l.key().to_string(), l.value().to_string())).collect()
}

/// One snapshot of a `DebuggingRecorder`.
///
/// Taking a snapshot drains counters, gauges and histograms, so a test captures once after all
/// updates and reads every value from the capture.
pub(crate) struct Captured {
    entries: Vec<(Key, DebugValue)>,
}

pub(crate) fn capture(snapshotter: &Snapshotter) -> Captured {
    let entries = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(ckey, _, _, value)| (ckey.key().clone(), value))
        .collect();
    Captured { entries }
}

impl Captured {
    fn find(&self, name: &str, labels: &Labels) -> Option<&DebugValue> {
        self.entries.iter().find_map(|(key, value)| {
            (key.name() == name && &labels_of(key) == labels).then_some(value)
        })
    }

    pub(crate) fn counter(&self, name: &str, labels: &Labels) -> Option<u64> {
        match self.find(name, labels)? {
            DebugValue::Counter(value) => Some(*value),
            _ => None,
        }
    }

    pub(crate) fn gauge(&self, name: &str, labels: &Labels) -> Option<f64> {
        match self.find(name, labels)? {
            DebugValue::Gauge(value) => Some(value.0),
            _ => None,
        }
    }

    pub(crate) fn histogram(&self, name: &str, labels: &Labels) -> Option<Vec<f64>> {
        match self.find(name, labels)? {
            DebugValue::Histogram(values) => Some(values.iter().map(|v| v.0).collect()),
            _ => None,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Label sets recorded under `name`.
    pub(crate) fn label_sets(&self, name: &str) -> Vec<Labels> {
        self.entries
            .iter()
            .filter(|(key, _)| key.name() == name)
            .map(|(key, _)| labels_of(key))
            .collect()
    }
}

use std::collections::BTreeMap;

use metrics::Label;

/// A flat, ordered set of label key/value pairs.
///
/// Ordering makes label sets hashable and gives every combination a single canonical form, which
/// is what lets a label set act as the key for a per-combination metric handle.
pub type Labels = BTreeMap<String, String>;

/// Builds a [`Labels`] map from `key => value` pairs.
///
/// ```
/// # use metrics_instrumentation::labels;
/// let labels = labels! { "controller" => "ProjectsController", "action" => "show" };
/// assert_eq!(labels.len(), 2);
/// ```
#[macro_export]
macro_rules! labels {
    () => { $crate::Labels::new() };
    ($($k:expr => $v:expr),+ $(,)?) => {{
        let mut labels = $crate::Labels::new();
        $(labels.insert(::std::string::ToString::to_string(&$k), ::std::string::ToString::to_string(&$v));)+
        labels
    }};
}

/// Returns `base` overlaid with `overrides`.
pub(crate) fn merge(base: &Labels, overrides: &Labels) -> Labels {
    if base.is_empty() {
        return overrides.clone();
    }

    let mut merged = base.clone();
    merged.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

pub(crate) fn to_metric_labels(labels: &Labels) -> Vec<Label> {
    labels.iter().map(|(k, v)| Label::new(k.clone(), v.clone())).collect()
}

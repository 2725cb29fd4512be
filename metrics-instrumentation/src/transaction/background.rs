use crate::Labels;

use super::LabelSource;

/// Label source for a background job.
///
/// Jobs are labelled with the worker class as `controller` and `"perform"` as `action`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackgroundJob {
    worker_class: String,
}

impl BackgroundJob {
    /// Creates a new `BackgroundJob` for the given worker class.
    pub fn new(worker_class: &str) -> Self {
        BackgroundJob { worker_class: worker_class.to_string() }
    }

    /// Worker class name.
    pub fn worker_class(&self) -> &str {
        &self.worker_class
    }
}

impl LabelSource for BackgroundJob {
    fn labels(&self) -> Option<Labels> {
        if self.worker_class.is_empty() {
            return None;
        }

        Some(labels! { "controller" => self.worker_class, "action" => "perform" })
    }
}

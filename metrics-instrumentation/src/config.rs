use std::{env, fmt, str::FromStr, time::Duration};

use thiserror::Error;

const DEFAULT_METHOD_CALL_THRESHOLD: Duration = Duration::from_millis(10);
const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(15);

const ENABLED_VAR: &str = "METRICS_ENABLED";
const METHOD_CALL_THRESHOLD_VAR: &str = "METRICS_METHOD_CALL_THRESHOLD_MS";
const SAMPLE_INTERVAL_VAR: &str = "METRICS_SAMPLE_INTERVAL_SECS";
const PROCESS_ROLE_VAR: &str = "METRICS_PROCESS_ROLE";

/// Errors that could occur while loading or validating configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A configuration value could not be parsed.
    #[error("invalid value for `{name}`: {reason}")]
    InvalidValue {
        /// Name of the offending setting.
        name: &'static str,

        /// Why the value was rejected.
        reason: String,
    },

    /// The sampler interval was zero.
    #[error("sample interval must be greater than zero")]
    ZeroSampleInterval,
}

/// The role the current process plays.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ProcessRole {
    /// Serves web requests.
    #[default]
    Web,

    /// Processes background jobs.
    Worker,

    /// Interactive console or one-off task.
    Console,
}

impl ProcessRole {
    /// Prefix applied to series names emitted from this process.
    pub const fn series_prefix(&self) -> &'static str {
        match self {
            ProcessRole::Web => "web_",
            ProcessRole::Worker => "worker_",
            ProcessRole::Console => "console_",
        }
    }

    /// Returns `true` if background samplers should run in this process.
    pub const fn runs_samplers(&self) -> bool {
        !matches!(self, ProcessRole::Console)
    }
}

impl fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProcessRole::Web => "web",
            ProcessRole::Worker => "worker",
            ProcessRole::Console => "console",
        })
    }
}

impl FromStr for ProcessRole {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "web" => Ok(ProcessRole::Web),
            "worker" => Ok(ProcessRole::Worker),
            "console" => Ok(ProcessRole::Console),
            other => Err(ConfigError::InvalidValue {
                name: PROCESS_ROLE_VAR,
                reason: format!("unknown process role `{other}`"),
            }),
        }
    }
}

/// Instrumentation settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    enabled: bool,
    method_call_threshold: Duration,
    sample_interval: Duration,
    role: ProcessRole,
}

impl Config {
    /// Loads configuration from the environment, falling back to defaults for unset variables.
    ///
    /// | variable | meaning |
    /// |---|---|
    /// | `METRICS_ENABLED` | `true`/`false`/`1`/`0` |
    /// | `METRICS_METHOD_CALL_THRESHOLD_MS` | method call reporting threshold, in milliseconds |
    /// | `METRICS_SAMPLE_INTERVAL_SECS` | base process sampling interval, in seconds |
    /// | `METRICS_PROCESS_ROLE` | `web`, `worker` or `console` |
    ///
    /// # Errors
    ///
    /// If a variable is set to a value that cannot be parsed, an error is returned.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(value) = lookup(ENABLED_VAR) {
            config.enabled = parse_bool(ENABLED_VAR, &value)?;
        }

        if let Some(value) = lookup(METHOD_CALL_THRESHOLD_VAR) {
            let millis = parse_u64(METHOD_CALL_THRESHOLD_VAR, &value)?;
            config.method_call_threshold = Duration::from_millis(millis);
        }

        if let Some(value) = lookup(SAMPLE_INTERVAL_VAR) {
            let secs = parse_u64(SAMPLE_INTERVAL_VAR, &value)?;
            config.sample_interval = Duration::from_secs(secs);
        }

        if let Some(value) = lookup(PROCESS_ROLE_VAR) {
            config.role = value.parse()?;
        }

        Ok(config)
    }

    /// Sets whether metrics are collected at all.
    ///
    /// When disabled, every metric handle is a null handle.  Defaults to `true`.
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Sets the cumulative time a method call site must reach within one transaction before it is
    /// reported.
    ///
    /// Defaults to 10 milliseconds.
    #[must_use]
    pub fn with_method_call_threshold(mut self, threshold: Duration) -> Self {
        self.method_call_threshold = threshold;
        self
    }

    /// Sets the base interval between process samples.
    ///
    /// Defaults to 15 seconds.
    #[must_use]
    pub fn with_sample_interval(mut self, interval: Duration) -> Self {
        self.sample_interval = interval;
        self
    }

    /// Sets the role of the current process.
    ///
    /// Defaults to [`ProcessRole::Web`].
    #[must_use]
    pub fn with_role(mut self, role: ProcessRole) -> Self {
        self.role = role;
        self
    }

    /// Whether metrics are collected.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Method call reporting threshold.
    pub fn method_call_threshold(&self) -> Duration {
        self.method_call_threshold
    }

    /// Base process sampling interval.
    pub fn sample_interval(&self) -> Duration {
        self.sample_interval
    }

    /// Role of the current process.
    pub fn role(&self) -> ProcessRole {
        self.role
    }

    /// Checks the configuration for values that cannot work.
    ///
    /// # Errors
    ///
    /// If the sample interval is zero, an error is returned.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_interval.is_zero() {
            return Err(ConfigError::ZeroSampleInterval);
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            enabled: true,
            method_call_threshold: DEFAULT_METHOD_CALL_THRESHOLD,
            sample_interval: DEFAULT_SAMPLE_INTERVAL,
            role: ProcessRole::default(),
        }
    }
}

fn parse_bool(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => Err(ConfigError::InvalidValue {
            name,
            reason: format!("expected a boolean, got `{other}`"),
        }),
    }
}

fn parse_u64(name: &'static str, value: &str) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|e| ConfigError::InvalidValue { name, reason: format!("{e}") })
}

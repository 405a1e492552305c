//! Configuration values. Every type here is an immutable value: "updating" a
//! configuration builds a new value and the owner swaps it in as a whole.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ErrorKind;
use crate::validation::DEFAULT_MAX_IMAGE_BYTES;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BACKOFF_MILLIS: [u64; 3] = [500, 1000, 2000];
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_LOCAL_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_VERSION_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_LOCAL_COMMAND: &str = "sightline-engine";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    max_attempts: u32,
    backoff_millis: Vec<u64>,
    retryable_error_kinds: BTreeSet<ErrorKind>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_BACKOFF_MILLIS.to_vec())
    }
}

impl RetryConfig {
    /// `max_attempts` counts the first attempt and is raised to at least 1.
    pub fn new(max_attempts: u32, backoff_millis: Vec<u64>) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff_millis,
            retryable_error_kinds: [ErrorKind::EndpointError5xx, ErrorKind::EndpointUnreachable]
                .into_iter()
                .collect(),
        }
    }

    pub fn with_retryable_kinds(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.retryable_error_kinds = kinds.into_iter().collect();
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn backoff_millis(&self) -> &[u64] {
        &self.backoff_millis
    }

    pub fn retryable_error_kinds(&self) -> &BTreeSet<ErrorKind> {
        &self.retryable_error_kinds
    }

    /// Delay after the failed attempt at `attempt_index` (0-based), clamped to the
    /// last configured value.
    pub fn backoff_for(&self, attempt_index: usize) -> Duration {
        let Some(last) = self.backoff_millis.last() else {
            return Duration::ZERO;
        };
        let millis = self
            .backoff_millis
            .get(attempt_index)
            .copied()
            .unwrap_or(*last);
        Duration::from_millis(millis)
    }

    pub fn should_retry(&self, kind: ErrorKind) -> bool {
        self.retryable_error_kinds.contains(&kind)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudEndpointConfig {
    pub endpoint_url: String,
    pub request_timeout: Duration,
    pub probe_timeout: Duration,
    pub retry: RetryConfig,
}

impl CloudEndpointConfig {
    pub fn new(endpoint_url: impl Into<String>) -> Self {
        Self {
            endpoint_url: endpoint_url.into(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            retry: RetryConfig::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn updated(&self, update: &CloudConfigUpdate) -> Self {
        Self {
            endpoint_url: update
                .endpoint_url
                .clone()
                .unwrap_or_else(|| self.endpoint_url.clone()),
            request_timeout: update.request_timeout.unwrap_or(self.request_timeout),
            probe_timeout: update.probe_timeout.unwrap_or(self.probe_timeout),
            retry: update.retry.clone().unwrap_or_else(|| self.retry.clone()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloudConfigUpdate {
    pub endpoint_url: Option<String>,
    pub request_timeout: Option<Duration>,
    pub probe_timeout: Option<Duration>,
    pub retry: Option<RetryConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEngineConfig {
    /// Shell-word command line, e.g. `python3 /opt/engine/run.py`. Split into
    /// discrete arguments; never handed to a shell.
    pub command: String,
    pub timeout: Duration,
    pub version_timeout: Duration,
}

impl Default for LocalEngineConfig {
    fn default() -> Self {
        Self::new(DEFAULT_LOCAL_COMMAND)
    }
}

impl LocalEngineConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            timeout: DEFAULT_LOCAL_TIMEOUT,
            version_timeout: DEFAULT_VERSION_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Program followed by its leading arguments.
    pub fn command_line(&self) -> Result<(String, Vec<String>), String> {
        let mut words = shell_words::split(&self.command)
            .map_err(|err| format!("invalid engine command '{}': {err}", self.command))?;
        if words.is_empty() {
            return Err("engine command is empty".to_string());
        }
        let program = words.remove(0);
        Ok((program, words))
    }

    pub fn updated(&self, update: &LocalConfigUpdate) -> Self {
        Self {
            command: update.command.clone().unwrap_or_else(|| self.command.clone()),
            timeout: update.timeout.unwrap_or(self.timeout),
            version_timeout: update.version_timeout.unwrap_or(self.version_timeout),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalConfigUpdate {
    pub command: Option<String>,
    pub timeout: Option<Duration>,
    pub version_timeout: Option<Duration>,
}

/// Everything the CLI or an embedding host needs to assemble a pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub cloud: CloudEndpointConfig,
    pub local: LocalEngineConfig,
    pub plugins_dir: Option<PathBuf>,
    pub plugin_timeout: Option<Duration>,
    pub results_dir: PathBuf,
    pub events_path: Option<PathBuf>,
    pub max_image_bytes: u64,
}

impl EngineSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let millis = |key: &str| {
            get(key)
                .and_then(|value| value.parse::<u64>().ok())
                .map(Duration::from_millis)
        };

        let max_attempts = get("SIGHTLINE_MAX_ATTEMPTS")
            .and_then(|value| value.parse::<u32>().ok())
            .unwrap_or(DEFAULT_MAX_ATTEMPTS);
        let backoff = get("SIGHTLINE_BACKOFF_MS")
            .and_then(|value| parse_millis_list(&value))
            .unwrap_or_else(|| DEFAULT_BACKOFF_MILLIS.to_vec());

        let mut cloud = CloudEndpointConfig::new(get("SIGHTLINE_ENDPOINT_URL").unwrap_or_default())
            .with_retry(RetryConfig::new(max_attempts, backoff));
        if let Some(timeout) = millis("SIGHTLINE_REQUEST_TIMEOUT_MS") {
            cloud.request_timeout = timeout;
        }

        let mut local = LocalEngineConfig::new(
            get("SIGHTLINE_LOCAL_ENGINE").unwrap_or_else(|| DEFAULT_LOCAL_COMMAND.to_string()),
        );
        if let Some(timeout) = millis("SIGHTLINE_LOCAL_TIMEOUT_MS") {
            local.timeout = timeout;
        }

        Self {
            cloud,
            local,
            plugins_dir: get("SIGHTLINE_PLUGINS_DIR").map(PathBuf::from),
            plugin_timeout: millis("SIGHTLINE_PLUGIN_TIMEOUT_MS"),
            results_dir: get("SIGHTLINE_RESULTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".sightline/results")),
            events_path: get("SIGHTLINE_EVENTS_PATH").map(PathBuf::from),
            max_image_bytes: get("SIGHTLINE_MAX_IMAGE_BYTES")
                .and_then(|value| value.parse::<u64>().ok())
                .unwrap_or(DEFAULT_MAX_IMAGE_BYTES),
        }
    }
}

fn parse_millis_list(raw: &str) -> Option<Vec<u64>> {
    let parsed = raw
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| part.parse::<u64>().ok())
        .collect::<Option<Vec<u64>>>()?;
    if parsed.is_empty() {
        return None;
    }
    Some(parsed)
}

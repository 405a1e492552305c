//! Post-processing plugin chain.
//!
//! Plugins come from [`PluginSource`]s, are checked structurally on discovery and
//! run strictly one after another. A failing plugin (error, panic or timeout)
//! never aborts the chain: the accumulator is left as it was and the failure is
//! written to the execution log.

mod builtin;
mod directory;

use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::{json, Value};
use sightline_contracts::events::{EventPayload, EventSink, NoopEventSink};
use sightline_contracts::plugins::{validate_identity, PluginExecutionLogEntry};
use sightline_contracts::{AnalysisError, AnalysisResult, ErrorKind};
use tracing::{debug, error, warn};

use crate::{elapsed_millis, resolve_path};

pub use builtin::{builtin_plugins, LabelNormalizePlugin, OcrWhitespacePlugin};
pub use directory::{DirectoryPluginSource, ProcessPlugin};

#[async_trait]
pub trait Plugin: Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    fn version(&self) -> &str;

    /// Returns a new result; the input is never modified.
    async fn process(
        &self,
        image_path: &Path,
        result: &AnalysisResult,
    ) -> anyhow::Result<AnalysisResult>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedPlugin {
    pub location: String,
    pub reason: String,
}

/// Outcome of one discovery pass: valid plugins in registration order plus the
/// entries that failed structural checks.
#[derive(Default)]
pub struct PluginDiscovery {
    pub plugins: IndexMap<String, Arc<dyn Plugin>>,
    pub rejected: Vec<RejectedPlugin>,
}

impl PluginDiscovery {
    /// First registration of an id wins; later ones are rejected.
    pub fn register(&mut self, plugin: Arc<dyn Plugin>, location: &str) {
        if let Err(reason) = validate_identity(plugin.id(), plugin.name(), plugin.version()) {
            self.reject(location, reason);
            return;
        }
        if self.plugins.contains_key(plugin.id()) {
            let reason = format!("duplicate plugin id '{}'", plugin.id());
            self.reject(location, reason);
            return;
        }
        self.plugins.insert(plugin.id().to_string(), plugin);
    }

    pub fn reject(&mut self, location: &str, reason: impl Into<String>) {
        self.rejected.push(RejectedPlugin {
            location: location.to_string(),
            reason: reason.into(),
        });
    }

    pub fn get(&self, id: &str) -> Option<&Arc<dyn Plugin>> {
        self.plugins.get(id)
    }

    pub fn ids(&self) -> Vec<&str> {
        self.plugins.keys().map(String::as_str).collect()
    }
}

pub trait PluginSource: Send + Sync {
    fn discover(&self) -> PluginDiscovery;
}

/// In-memory registry.
#[derive(Clone)]
pub struct StaticPluginSource {
    label: String,
    plugins: Vec<Arc<dyn Plugin>>,
}

impl StaticPluginSource {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            plugins: Vec::new(),
        }
    }

    pub fn with(mut self, plugin: Arc<dyn Plugin>) -> Self {
        self.plugins.push(plugin);
        self
    }
}

impl PluginSource for StaticPluginSource {
    fn discover(&self) -> PluginDiscovery {
        let mut discovery = PluginDiscovery::default();
        for plugin in &self.plugins {
            discovery.register(plugin.clone(), &self.label);
        }
        discovery
    }
}

/// Merges sources in order.
#[derive(Default)]
pub struct CompositePluginSource {
    sources: Vec<Arc<dyn PluginSource>>,
}

impl CompositePluginSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, source: Arc<dyn PluginSource>) -> Self {
        self.sources.push(source);
        self
    }
}

impl PluginSource for CompositePluginSource {
    fn discover(&self) -> PluginDiscovery {
        let mut merged = PluginDiscovery::default();
        for source in &self.sources {
            let found = source.discover();
            for (_, plugin) in found.plugins {
                merged.register(plugin, "composite");
            }
            merged.rejected.extend(found.rejected);
        }
        merged
    }
}

struct PluginFailure {
    message: String,
    stack_trace: Option<String>,
}

/// Runs the requested plugins in order and keeps the execution log of the last run.
pub struct PluginLoader {
    source: Arc<dyn PluginSource>,
    events: Arc<dyn EventSink>,
    plugin_timeout: Option<Duration>,
    log: Vec<PluginExecutionLogEntry>,
}

impl PluginLoader {
    pub fn new(source: Arc<dyn PluginSource>) -> Self {
        Self {
            source,
            events: Arc::new(NoopEventSink),
            plugin_timeout: None,
            log: Vec::new(),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Bounds each plugin's run time. `None` lets plugins run to completion.
    pub fn with_plugin_timeout(mut self, plugin_timeout: Option<Duration>) -> Self {
        self.plugin_timeout = plugin_timeout;
        self
    }

    /// Entries from the most recent `execute_plugins` call, in execution order.
    pub fn execution_log(&self) -> &[PluginExecutionLogEntry] {
        &self.log
    }

    pub fn discover(&self) -> PluginDiscovery {
        let discovery = self.source.discover();
        for rejected in &discovery.rejected {
            warn!(
                location = %rejected.location,
                "plugin rejected: {}",
                rejected.reason
            );
            let mut payload = EventPayload::new();
            payload.insert("location".to_string(), json!(rejected.location));
            payload.insert("reason".to_string(), json!(rejected.reason));
            self.events.record("plugin_rejected", payload);
        }
        discovery
    }

    pub async fn execute_plugins(
        &mut self,
        result: AnalysisResult,
        plugin_ids: &[String],
        working_directory: &Path,
    ) -> AnalysisResult {
        self.log.clear();
        if plugin_ids.is_empty() {
            return result;
        }
        let discovery = self.discover();
        let image_path = resolve_path(working_directory, &result.image_path);
        let mut current = result;

        for plugin_id in plugin_ids {
            let Some(plugin) = discovery.get(plugin_id).cloned() else {
                warn!(plugin = %plugin_id, "requested plugin is not registered");
                self.log.push(PluginExecutionLogEntry::not_found(plugin_id.as_str()));
                continue;
            };

            let started = Instant::now();
            let outcome = run_isolated(
                plugin,
                image_path.clone(),
                current.clone(),
                self.plugin_timeout,
            )
            .await;
            let duration_millis = elapsed_millis(started);

            match outcome {
                Ok(next) => {
                    debug!(plugin = %plugin_id, duration_ms = duration_millis, "plugin finished");
                    self.log.push(PluginExecutionLogEntry::succeeded(
                        plugin_id.as_str(),
                        duration_millis,
                    ));
                    current = next;
                }
                Err(failure) => {
                    error!(plugin = %plugin_id, "plugin failed: {}", failure.message);
                    let mut report =
                        AnalysisError::new(ErrorKind::PluginExecutionError, failure.message.as_str())
                            .with_plugin(plugin_id.as_str())
                            .with_model(current.model_identifier.as_str());
                    if let Some(stack) = &failure.stack_trace {
                        report = report.with_stack(stack.as_str());
                    }
                    let mut payload = EventPayload::new();
                    payload.insert("plugin_id".to_string(), json!(plugin_id));
                    payload.insert("result_id".to_string(), json!(current.id));
                    payload.insert(
                        "error".to_string(),
                        serde_json::to_value(&report).unwrap_or(Value::Null),
                    );
                    payload.insert("duration_ms".to_string(), Value::from(duration_millis));
                    self.events.record("plugin_failed", payload);
                    self.log.push(PluginExecutionLogEntry::failed(
                        plugin_id.as_str(),
                        failure.message,
                        failure.stack_trace,
                        duration_millis,
                    ));
                }
            }
        }
        current
    }
}

async fn run_isolated(
    plugin: Arc<dyn Plugin>,
    image_path: PathBuf,
    input: AnalysisResult,
    plugin_timeout: Option<Duration>,
) -> Result<AnalysisResult, PluginFailure> {
    let mut handle = tokio::spawn(async move { plugin.process(&image_path, &input).await });
    let joined = match plugin_timeout {
        Some(limit) => match tokio::time::timeout(limit, &mut handle).await {
            Ok(joined) => joined,
            Err(_) => {
                handle.abort();
                return Err(PluginFailure {
                    message: format!("plugin timed out after {}ms", limit.as_millis()),
                    stack_trace: None,
                });
            }
        },
        None => handle.await,
    };

    match joined {
        Ok(Ok(next)) => Ok(next),
        Ok(Err(err)) => Err(PluginFailure {
            message: err.to_string(),
            stack_trace: Some(format!("{err:?}")),
        }),
        Err(join_err) if join_err.is_panic() => {
            let detail = panic_message(join_err.into_panic());
            Err(PluginFailure {
                message: format!("plugin panicked: {detail}"),
                stack_trace: Some(detail),
            })
        }
        Err(join_err) => Err(PluginFailure {
            message: format!("plugin task was cancelled: {join_err}"),
            stack_trace: None,
        }),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        return (*text).to_string();
    }
    if let Some(text) = payload.downcast_ref::<String>() {
        return text.clone();
    }
    "non-string panic payload".to_string()
}

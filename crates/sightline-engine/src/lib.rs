//! Async dispatch engine: backend adapters, the router that picks between them,
//! the plugin chain and the pipeline that ties validation, routing, plugins and
//! persistence together.

pub mod backend;
pub mod cloud;
pub mod local;
pub mod pipeline;
pub mod plugins;
pub mod router;

mod wire;

#[cfg(test)]
mod test_support;

use std::path::{Path, PathBuf};

pub use backend::{CloudBackend, LocalBackend};
pub use cloud::{CloudEndpointAdapter, EndpointTransport, ReqwestTransport};
pub use local::LocalEngineAdapter;
pub use pipeline::{AnalysisPipeline, AnalysisSubmission, PipelineError, PipelineOutcome};
pub use plugins::{Plugin, PluginLoader, PluginSource};
pub use router::AnalysisRouter;

/// Relative paths are taken against `working_directory`; absolute ones pass through.
pub fn resolve_path(working_directory: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() || working_directory.as_os_str().is_empty() {
        return path.to_path_buf();
    }
    working_directory.join(path)
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

pub(crate) fn elapsed_millis(started: std::time::Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

//! Shared contracts for the Sightline dispatch layer: the analysis data model,
//! the closed error taxonomy, input validation, configuration values, the plugin
//! manifest format, the observability sink and the results store.
//!
//! Nothing in this crate talks to the network or spawns processes.

pub mod analysis;
pub mod config;
pub mod errors;
pub mod events;
pub mod plugins;
pub mod results;
pub mod validation;

pub use analysis::{
    AnalysisMode, AnalysisRequest, AnalysisResult, BoundingBox, DetectionLabel,
};
pub use errors::{AnalysisError, ErrorDetails, ErrorKind};

pub(crate) fn now_utc_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, false)
}

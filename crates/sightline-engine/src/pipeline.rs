use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use sightline_contracts::events::{EventPayload, EventSink, NoopEventSink};
use sightline_contracts::plugins::PluginExecutionLogEntry;
use sightline_contracts::results::{file_sha256, AnalysisInputs, ResultsManager};
use sightline_contracts::validation::{ValidationError, Validator};
use sightline_contracts::{AnalysisError, AnalysisMode, AnalysisRequest, AnalysisResult};
use tracing::info;

use crate::plugins::PluginLoader;
use crate::resolve_path;
use crate::router::AnalysisRouter;

/// What a collaborator hands over for one analysis.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisSubmission {
    pub image_path: PathBuf,
    pub model_identifier: String,
    pub mode: AnalysisMode,
    pub confidence_threshold: f64,
    pub plugin_ids: Vec<String>,
    pub working_directory: PathBuf,
    pub save: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineOutcome {
    pub result: AnalysisResult,
    pub plugin_log: Vec<PluginExecutionLogEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stored_path: Option<PathBuf>,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid image: {0}")]
    Validation(ValidationError),
    #[error(transparent)]
    Analysis(#[from] AnalysisError),
    #[error("failed to store analysis result: {0:#}")]
    Persistence(anyhow::Error),
}

impl From<ValidationError> for PipelineError {
    fn from(err: ValidationError) -> Self {
        match err {
            ValidationError::Missing(path) => Self::Analysis(AnalysisError::file_not_found(&path)),
            other => Self::Validation(other),
        }
    }
}

/// Validator, router, confidence filter, plugin chain and results store in one call.
pub struct AnalysisPipeline {
    validator: Validator,
    router: AnalysisRouter,
    plugins: PluginLoader,
    results: Option<ResultsManager>,
    events: Arc<dyn EventSink>,
}

impl AnalysisPipeline {
    pub fn new(validator: Validator, router: AnalysisRouter, plugins: PluginLoader) -> Self {
        Self {
            validator,
            router,
            plugins,
            results: None,
            events: Arc::new(NoopEventSink),
        }
    }

    pub fn with_results(mut self, results: ResultsManager) -> Self {
        self.results = Some(results);
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn router(&self) -> &AnalysisRouter {
        &self.router
    }

    pub fn plugin_loader(&self) -> &PluginLoader {
        &self.plugins
    }

    pub async fn run(
        &mut self,
        submission: AnalysisSubmission,
    ) -> Result<PipelineOutcome, PipelineError> {
        let image_path = resolve_path(&submission.working_directory, &submission.image_path);
        let mut payload = EventPayload::new();
        payload.insert("image_path".to_string(), json!(image_path.display().to_string()));
        payload.insert("model".to_string(), json!(submission.model_identifier));
        payload.insert("mode".to_string(), json!(submission.mode.as_str()));
        self.events.record("analysis_started", payload);

        let outcome = self.run_stages(&submission, image_path).await;

        let mut payload = EventPayload::new();
        match &outcome {
            Ok(done) => {
                let failed_plugins = done.plugin_log.iter().filter(|entry| !entry.success).count();
                info!(
                    result_id = %done.result.id,
                    labels = done.result.labels.len(),
                    failed_plugins,
                    "analysis finished"
                );
                payload.insert("result_id".to_string(), json!(done.result.id));
                payload.insert("labels".to_string(), Value::from(done.result.labels.len()));
                payload.insert("duration_ms".to_string(), Value::from(done.result.duration_millis));
                payload.insert("failed_plugins".to_string(), Value::from(failed_plugins));
                self.events.record("analysis_finished", payload);
            }
            Err(err) => {
                if let PipelineError::Analysis(analysis) = err {
                    payload.insert("kind".to_string(), json!(analysis.kind.as_str()));
                }
                payload.insert("error".to_string(), json!(err.to_string()));
                self.events.record("analysis_failed", payload);
            }
        }
        outcome
    }

    async fn run_stages(
        &mut self,
        submission: &AnalysisSubmission,
        image_path: PathBuf,
    ) -> Result<PipelineOutcome, PipelineError> {
        let validated = self.validator.validate_path(&image_path)?;
        let request = AnalysisRequest::new(
            &validated,
            submission.model_identifier.as_str(),
            submission.confidence_threshold,
            submission.mode,
            submission.working_directory.as_path(),
        );

        let routed = self.router.route(&request).await?;
        let filtered = routed.retain_confident(request.confidence_threshold);
        let result = self
            .plugins
            .execute_plugins(filtered, &submission.plugin_ids, &request.working_directory)
            .await;
        let plugin_log = self.plugins.execution_log().to_vec();

        let stored_path = match (&self.results, submission.save) {
            (Some(store), true) => {
                let digest = file_sha256(&image_path).map_err(PipelineError::Persistence)?;
                let inputs = AnalysisInputs::new(
                    digest,
                    request.confidence_threshold,
                    &submission.plugin_ids,
                );
                let path = store
                    .save(&result, &plugin_log, inputs)
                    .map_err(PipelineError::Persistence)?;
                Some(path)
            }
            _ => None,
        };

        Ok(PipelineOutcome {
            result,
            plugin_log,
            stored_path,
        })
    }
}

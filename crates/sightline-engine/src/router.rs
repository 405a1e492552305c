use std::sync::{Arc, Mutex, PoisonError};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sightline_contracts::{
    AnalysisError, AnalysisMode, AnalysisRequest, AnalysisResult, ErrorKind,
};
use tracing::info;

use crate::backend::{CloudBackend, LocalBackend};

/// Dispatches a request to exactly the backend its mode names. Never falls back
/// to the other backend and never retries.
pub struct AnalysisRouter {
    local: Arc<dyn LocalBackend>,
    cloud: Arc<dyn CloudBackend>,
    last_mode: Mutex<Option<AnalysisMode>>,
}

impl AnalysisRouter {
    pub fn new(local: Arc<dyn LocalBackend>, cloud: Arc<dyn CloudBackend>) -> Self {
        Self {
            local,
            cloud,
            last_mode: Mutex::new(None),
        }
    }

    pub fn last_mode(&self) -> Option<AnalysisMode> {
        *self.last_mode.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Liveness of the backend serving `mode`.
    pub async fn backend_available(&self, mode: AnalysisMode) -> bool {
        match mode {
            AnalysisMode::Local => self.local.is_available().await,
            AnalysisMode::Cloud => self.cloud.is_available().await,
        }
    }

    pub async fn route(&self, request: &AnalysisRequest) -> Result<AnalysisResult, AnalysisError> {
        let image_path = request.image_path.as_path();
        let model = request.model_identifier.as_str();
        if !image_path.is_file() {
            return Err(AnalysisError::file_not_found(image_path).with_model(model));
        }
        *self.last_mode.lock().unwrap_or_else(PoisonError::into_inner) = Some(request.mode);

        match request.mode {
            AnalysisMode::Local => {
                if !self.local.is_available().await {
                    info!(model, "local engine unavailable; not routing");
                    return Err(AnalysisError::new(
                        ErrorKind::LocalEngineNotFound,
                        "local analysis engine is not available",
                    )
                    .with_model(model));
                }
                info!(model, image = %image_path.display(), "routing to local engine");
                self.local.analyze(image_path, model).await
            }
            AnalysisMode::Cloud => {
                if !self.cloud.is_available().await {
                    info!(model, "cloud endpoint unreachable; not routing");
                    return Err(AnalysisError::new(
                        ErrorKind::EndpointUnreachable,
                        "cloud analysis endpoint is not reachable",
                    )
                    .with_model(model));
                }
                let bytes = tokio::fs::read(image_path)
                    .await
                    .map_err(|_| AnalysisError::file_not_found(image_path).with_model(model))?;
                let encoded = BASE64.encode(bytes);
                info!(model, bytes = request.file_size, "routing to cloud endpoint");
                let result = self.cloud.analyze(&encoded, model).await?;
                Ok(result.with_image_path(image_path))
            }
        }
    }
}

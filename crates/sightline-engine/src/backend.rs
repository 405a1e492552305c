use std::path::Path;

use async_trait::async_trait;
use sightline_contracts::{AnalysisError, AnalysisResult};

use crate::cloud::CloudEndpointAdapter;
use crate::local::LocalEngineAdapter;

/// On-device backend as seen by the router.
#[async_trait]
pub trait LocalBackend: Send + Sync {
    async fn is_available(&self) -> bool;

    async fn analyze(
        &self,
        image_path: &Path,
        model_identifier: &str,
    ) -> Result<AnalysisResult, AnalysisError>;
}

/// Remote backend as seen by the router. Takes base64 image data.
#[async_trait]
pub trait CloudBackend: Send + Sync {
    async fn is_available(&self) -> bool;

    async fn analyze(
        &self,
        image_data: &str,
        model_identifier: &str,
    ) -> Result<AnalysisResult, AnalysisError>;
}

#[async_trait]
impl LocalBackend for LocalEngineAdapter {
    async fn is_available(&self) -> bool {
        LocalEngineAdapter::is_available(self).await
    }

    async fn analyze(
        &self,
        image_path: &Path,
        model_identifier: &str,
    ) -> Result<AnalysisResult, AnalysisError> {
        LocalEngineAdapter::analyze(self, image_path, model_identifier).await
    }
}

#[async_trait]
impl CloudBackend for CloudEndpointAdapter {
    async fn is_available(&self) -> bool {
        CloudEndpointAdapter::is_available(self).await
    }

    async fn analyze(
        &self,
        image_data: &str,
        model_identifier: &str,
    ) -> Result<AnalysisResult, AnalysisError> {
        CloudEndpointAdapter::analyze(self, image_data, model_identifier).await
    }
}

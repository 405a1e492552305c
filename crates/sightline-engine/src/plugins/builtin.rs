use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use sightline_contracts::AnalysisResult;

use super::{Plugin, StaticPluginSource};

const BUILTIN_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Plugins shipped with the engine, registered ahead of any directory plugins.
pub fn builtin_plugins() -> StaticPluginSource {
    StaticPluginSource::new("builtin")
        .with(Arc::new(LabelNormalizePlugin))
        .with(Arc::new(OcrWhitespacePlugin))
}

/// Trims and lowercases label text so results from both backends compare equal.
#[derive(Debug, Clone, Copy, Default)]
pub struct LabelNormalizePlugin;

#[async_trait]
impl Plugin for LabelNormalizePlugin {
    fn id(&self) -> &str {
        "label-normalize"
    }

    fn name(&self) -> &str {
        "Label normalizer"
    }

    fn version(&self) -> &str {
        BUILTIN_VERSION
    }

    async fn process(
        &self,
        _image_path: &Path,
        result: &AnalysisResult,
    ) -> anyhow::Result<AnalysisResult> {
        let mut next = result.clone();
        for label in &mut next.labels {
            label.label = label.label.trim().to_lowercase();
        }
        Ok(next)
    }
}

/// Collapses runs of whitespace in OCR text; blank text becomes absent.
#[derive(Debug, Clone, Copy, Default)]
pub struct OcrWhitespacePlugin;

#[async_trait]
impl Plugin for OcrWhitespacePlugin {
    fn id(&self) -> &str {
        "ocr-whitespace"
    }

    fn name(&self) -> &str {
        "OCR whitespace cleanup"
    }

    fn version(&self) -> &str {
        BUILTIN_VERSION
    }

    async fn process(
        &self,
        _image_path: &Path,
        result: &AnalysisResult,
    ) -> anyhow::Result<AnalysisResult> {
        let mut next = result.clone();
        next.ocr_text = result
            .ocr_text
            .as_deref()
            .map(|text| text.split_whitespace().collect::<Vec<_>>().join(" "))
            .filter(|text| !text.is_empty());
        Ok(next)
    }
}
